//! Error types for the camera relay library.
//!
//! Variants map to the failure modes of each component:
//!
//! - **Session start**: [`StartError`] — reservation conflicts, admission
//!   limit, execution unit spawn failure.
//! - **Camera control**: [`CameraError`] — ONVIF transport faults, SOAP
//!   faults, unusable responses.
//! - **Media transport**: [`MediaError`] — raw backend failures, wrapped by
//!   [`RelayError`] with the relay step that produced them.
//! - **Logging sink**: [`SinkError`] — never propagated past the sink layer.

/// Why a start-relay request was rejected before any session ran.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// A session for this camera already holds the registry slot.
    #[error("stream is already running for camera {0}")]
    Duplicate(String),

    /// The configured maximum number of concurrent sessions is reached.
    #[error("session limit reached ({limit} active)")]
    AtCapacity { limit: usize },

    /// The OS refused to spawn the session thread.
    #[error("failed to spawn session thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Failure talking to a camera's control service.
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    /// Connection, timeout, or other HTTP transport fault.
    #[error("camera request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The camera answered with a non-success HTTP status and no SOAP fault.
    #[error("camera returned HTTP {status}")]
    Status { status: u16 },

    /// The camera answered with a SOAP fault.
    #[error("SOAP fault: {reason}")]
    Fault { reason: String },

    /// `GetStreamUri` succeeded but carried no URI.
    #[error("stream URI missing from camera response")]
    MissingUri,

    /// The response body was not well-formed XML.
    #[error("malformed camera response: {0}")]
    Xml(String),

    /// The resolved URI could not be parsed (credential embedding).
    #[error("invalid stream URI {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },
}

/// Raw failure reported by a [`MediaBackend`](crate::relay::MediaBackend).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct MediaError(pub String);

impl MediaError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A relay step that failed, carrying the backend's cause.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("failed to open source: {0}")]
    SourceOpen(#[source] MediaError),

    #[error("failed to probe source streams: {0}")]
    StreamProbe(#[source] MediaError),

    #[error("failed to open destination: {0}")]
    DestinationOpen(#[source] MediaError),

    #[error("failed to set up output stream: {0}")]
    StreamSetup(#[source] MediaError),

    #[error("failed to write container header: {0}")]
    HeaderWrite(#[source] MediaError),

    #[error("failed to read packet: {0}")]
    PacketRead(#[source] MediaError),

    #[error("failed to write packet: {0}")]
    PacketWrite(#[source] MediaError),

    #[error("failed to write container trailer: {0}")]
    TrailerWrite(#[source] MediaError),
}

/// A log record could not be persisted.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("log sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log record encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}
