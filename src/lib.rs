//! Streams camera frames to a remote inference service and surfaces the
//! predictions it sends back.
//!
//! Two pieces, composed linearly:
//!
//! - [`ConnectionManager`] owns one WebSocket to a fixed endpoint, sends
//!   binary frames, and decodes each JSON reply into a [`PredictionResult`].
//! - [`CaptureLoop`] ticks at a fixed interval and, while the link is open and
//!   nothing is in flight, captures a frame through a [`Capture`]
//!   collaborator and hands it to the manager.
//!
//! Failures never propagate to callers. They go to an [`ErrorReporter`]
//! and the visible effect is simply that no prediction appears.

pub mod capture;
pub mod capture_loop;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod prediction;
pub mod render;
pub mod transport;
#[cfg(feature = "camera")]
pub mod webcam;

pub use capture::{Capture, ReplayCapture};
pub use capture_loop::{CaptureLoop, LoopPhase, LoopStats, Uplink};
pub use config::StreamConfig;
pub use connection::{ConnectionManager, Dispatch, DropReason, LinkState};
pub use error::{CaptureError, ConfigError, ErrorKind, ErrorReporter, LogReporter, StreamError};
pub use frame::{CaptureOptions, FramePayload, ImageFormat};
pub use prediction::{Prediction, PredictionResult};
pub use render::{ConsoleRenderer, Render};
#[cfg(feature = "camera")]
pub use webcam::WebcamCapture;
