//! Runtime configuration: where to stream and how often.

use std::time::Duration;

use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use crate::error::ConfigError;
use crate::frame::CaptureOptions;

pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8000/ws";
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Static configuration for one streaming session.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// `ws://` or `wss://` URL of the inference service.
    pub endpoint: String,
    /// Capture period.
    pub interval: Duration,
    pub capture: CaptureOptions,
    /// How long `send` waits for the socket to take a frame.
    pub write_timeout: Duration,
    /// DER certificate to pin for `wss://`. When unset the webpki roots are used.
    pub pinned_cert: Option<Vec<u8>>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            interval: DEFAULT_INTERVAL,
            capture: CaptureOptions::default(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            pinned_cert: None,
        }
    }
}

impl StreamConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        StreamConfig {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_capture(mut self, capture: CaptureOptions) -> Self {
        self.capture = capture;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_pinned_cert(mut self, der: Vec<u8>) -> Self {
        self.pinned_cert = Some(der);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let endpoint_err = |reason: String| ConfigError::Endpoint {
            endpoint: self.endpoint.clone(),
            reason,
        };
        let request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| endpoint_err(e.to_string()))?;
        match request.uri().scheme_str() {
            Some("ws") | Some("wss") => {}
            other => {
                return Err(endpoint_err(format!(
                    "scheme must be ws or wss, got {}",
                    other.unwrap_or("none")
                )))
            }
        }

        if self.interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if self.write_timeout.is_zero() {
            return Err(ConfigError::ZeroWriteTimeout);
        }
        check_ratio("quality", self.capture.quality)?;
        check_ratio("compress", self.capture.compress)?;
        Ok(())
    }
}

fn check_ratio(name: &'static str, value: f32) -> Result<(), ConfigError> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::Ratio { name, value })
    }
}
