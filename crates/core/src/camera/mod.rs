//! Camera control: source resolution and pan/tilt commands.
//!
//! The [`CameraControl`] trait is the seam between session orchestration
//! and the camera's control protocol. [`OnvifCamera`] implements it over
//! ONVIF SOAP; tests substitute in-process fakes.

pub mod onvif;
pub mod soap;

use std::fmt;

pub use onvif::{OnvifCamera, OnvifConfig};

use crate::error::CameraError;

/// Media profile addressed when none is configured.
pub const DEFAULT_PROFILE_TOKEN: &str = "Profile_1";

/// Identifies a physical camera by its network address (`host` or
/// `host:port`). Used as the session registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CameraId(String);

impl CameraId {
    /// Trimmed address; `None` when blank.
    pub fn parse(address: &str) -> Option<Self> {
        let trimmed = address.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Username/password pair for the camera's digest handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    RtpUnicast,
    RtpMulticast,
}

impl StreamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::RtpUnicast => "RTP-Unicast",
            StreamType::RtpMulticast => "RTP-Multicast",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    Udp,
    Tcp,
    Rtsp,
    Http,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
            TransportProtocol::Rtsp => "RTSP",
            TransportProtocol::Http => "HTTP",
        }
    }
}

/// Where a camera publishes its live media, as resolved through its
/// control service. Consumed once by the relay.
#[derive(Clone, PartialEq, Eq)]
pub struct MediaSource {
    pub uri: String,
    pub stream: StreamType,
    pub protocol: TransportProtocol,
    pub profile_token: String,
}

impl fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaSource")
            .field("uri", &redact_userinfo(&self.uri))
            .field("stream", &self.stream)
            .field("protocol", &self.protocol)
            .field("profile_token", &self.profile_token)
            .finish()
    }
}

/// Strip a `user:pass@` section from a URI for logging.
pub fn redact_userinfo(uri: &str) -> String {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return uri.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{scheme}://***@{}", &rest[at + 1..]),
        None => uri.to_string(),
    }
}

/// Pan/tilt velocity in the camera's generic velocity space (-1.0..=1.0).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Velocity {
    pub pan: f32,
    pub tilt: f32,
}

impl Velocity {
    /// Speed used by the directional helpers.
    pub const STEP: f32 = 0.5;

    pub const LEFT: Velocity = Velocity::new(-Self::STEP, 0.0);
    pub const RIGHT: Velocity = Velocity::new(Self::STEP, 0.0);
    pub const UP: Velocity = Velocity::new(0.0, Self::STEP);
    pub const DOWN: Velocity = Velocity::new(0.0, -Self::STEP);

    pub const fn new(pan: f32, tilt: f32) -> Self {
        Self { pan, tilt }
    }

    /// Clamp both axes into the generic velocity space.
    pub fn clamped(self) -> Self {
        Self {
            pan: self.pan.clamp(-1.0, 1.0),
            tilt: self.tilt.clamp(-1.0, 1.0),
        }
    }
}

/// Operations against a camera's control service.
///
/// Every call performs its own authenticated exchange; implementations
/// keep no per-camera session state between calls.
pub trait CameraControl: Send + Sync {
    /// Resolve the media source address published under `profile_token`.
    fn resolve_source(
        &self,
        camera: &CameraId,
        credentials: &Credentials,
        profile_token: &str,
    ) -> Result<MediaSource, CameraError>;

    /// Start a continuous pan/tilt move. Does not affect any relay.
    fn continuous_move(
        &self,
        camera: &CameraId,
        credentials: &Credentials,
        velocity: Velocity,
    ) -> Result<(), CameraError>;

    /// Stop any pan/tilt/zoom movement.
    fn stop_motion(&self, camera: &CameraId, credentials: &Credentials) -> Result<(), CameraError>;

    fn move_left(&self, camera: &CameraId, credentials: &Credentials) -> Result<(), CameraError> {
        self.continuous_move(camera, credentials, Velocity::LEFT)
    }

    fn move_right(&self, camera: &CameraId, credentials: &Credentials) -> Result<(), CameraError> {
        self.continuous_move(camera, credentials, Velocity::RIGHT)
    }

    fn move_up(&self, camera: &CameraId, credentials: &Credentials) -> Result<(), CameraError> {
        self.continuous_move(camera, credentials, Velocity::UP)
    }

    fn move_down(&self, camera: &CameraId, credentials: &Credentials) -> Result<(), CameraError> {
        self.continuous_move(camera, credentials, Velocity::DOWN)
    }
}
