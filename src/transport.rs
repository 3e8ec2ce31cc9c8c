//! WebSocket transport to the inference service.
//!
//! Wraps `tokio-tungstenite` into split writer/reader halves for the link
//! task's `tokio::select!` loop. TLS (for `wss://`) uses rustls with either
//! the Mozilla roots or a single pinned certificate.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};

use crate::error::StreamError;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Received WebSocket message.
#[derive(Debug)]
pub enum WsMessage {
    Text(String),
    Binary(Bytes),
    Ping,
    Pong,
    /// Close frame; code 1005 when the peer sent none.
    Close { code: u16, reason: String },
}

/// Write half of the connection.
pub struct WsWriter {
    sink: SplitSink<WsStream, Message>,
}

impl WsWriter {
    /// Send one binary frame.
    pub async fn send_binary(&mut self, data: Bytes) -> Result<(), StreamError> {
        self.sink.send(Message::Binary(data)).await?;
        Ok(())
    }

    /// Send a close frame and flush.
    pub async fn send_close(&mut self) -> Result<(), StreamError> {
        self.sink.send(Message::Close(None)).await?;
        self.sink.close().await?;
        Ok(())
    }
}

/// Read half of the connection.
pub struct WsReader {
    stream: SplitStream<WsStream>,
}

impl WsReader {
    /// Next message, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<Result<WsMessage, StreamError>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(e.into())),
            };
            let msg = match msg {
                Message::Text(text) => WsMessage::Text(text.as_str().to_owned()),
                Message::Binary(data) => WsMessage::Binary(data),
                Message::Ping(_) => WsMessage::Ping,
                Message::Pong(_) => WsMessage::Pong,
                Message::Close(frame) => {
                    let (code, reason) = frame
                        .map(|cf| (cf.code.into(), cf.reason.as_str().to_owned()))
                        .unwrap_or((1005, String::new()));
                    WsMessage::Close { code, reason }
                }
                // Raw frames never surface when reading
                Message::Frame(_) => continue,
            };
            return Some(Ok(msg));
        }
    }
}

/// Connect to `endpoint` and split the stream.
pub async fn connect(
    endpoint: &str,
    pinned_cert: Option<&[u8]>,
) -> Result<(WsWriter, WsReader), StreamError> {
    let request = endpoint.into_client_request()?;
    let connector = match request.uri().scheme_str() {
        Some("wss") => Some(Connector::Rustls(make_tls_config(pinned_cert)?)),
        _ => None,
    };

    let (ws_stream, _response) =
        tokio_tungstenite::connect_async_tls_with_config(request, None, true, connector).await?;
    let (sink, stream) = ws_stream.split();
    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Build a rustls client config.
///
/// With no pinned certificate the server chain is checked against the Mozilla
/// roots. Otherwise the server must present exactly the pinned DER.
pub fn make_tls_config(
    pinned_cert: Option<&[u8]>,
) -> Result<Arc<rustls::ClientConfig>, StreamError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let algorithms = provider.signature_verification_algorithms;
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?;
    let config = match pinned_cert {
        None => {
            let roots: RootCertStore = webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect();
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        Some(der) => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PinnedCertVerifier::new(der, algorithms)))
            .with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// Trusts one server certificate, compared byte for byte. Handshake
/// signatures are still checked.
#[derive(Debug)]
struct PinnedCertVerifier {
    pinned: CertificateDer<'static>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl PinnedCertVerifier {
    fn new(der: &[u8], algorithms: WebPkiSupportedAlgorithms) -> Self {
        PinnedCertVerifier {
            pinned: CertificateDer::from(der.to_vec()),
            algorithms,
        }
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() != self.pinned.as_ref() {
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
