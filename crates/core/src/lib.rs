//! Camera stream relay.
//!
//! Resolves a camera's live media source over ONVIF, relays it without
//! re-encoding to a caller-chosen destination, and tracks one relay session
//! per camera.
//!
//! ## Components
//!
//! - [`camera`]: camera control client (`GetStreamUri`, pan/tilt).
//! - [`relay`]: stream-copy relay engine over a pluggable media backend.
//! - [`session`]: session registry and session manager.
//! - [`control`]: request validation and replies for the RPC surface.
//! - [`logging`]: persistent log sink fed from `tracing`.
//! - [`config`]: `camrelay.toml` configuration.

pub mod camera;
pub mod config;
pub mod control;
pub mod error;
pub mod logging;
pub mod relay;
pub mod session;

pub use camera::{CameraControl, CameraId, Credentials, OnvifCamera, OnvifConfig};
pub use config::Config;
pub use control::ControlService;
pub use error::{CameraError, MediaError, RelayError, SinkError, StartError};
pub use relay::{Relay, RelayEngine, RelayOutcome, StreamMapping};
pub use session::{SessionConfig, SessionManager, SessionState};
