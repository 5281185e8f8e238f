//! Control endpoint logic, independent of the RPC transport.
//!
//! Requests are validated here, delegated to the [`SessionManager`], and
//! answered with a success flag and a human-readable message. Nothing here
//! waits for a relay to finish.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::camera::{CameraId, Credentials, Velocity};
use crate::error::StartError;
use crate::session::{SessionManager, SessionSnapshot, StopOutcome};

pub const MSG_STARTED: &str = "Stream started successfully.";
pub const MSG_ALREADY_RUNNING: &str = "Stream is already running for this camera.";
pub const MSG_AT_CAPACITY: &str = "Maximum number of concurrent streams reached.";
pub const MSG_MISSING_CAMERA: &str = "Camera address is required.";
pub const MSG_MISSING_DESTINATION: &str = "Destination address is required.";
pub const MSG_STOPPED: &str = "Stream stopped.";
pub const MSG_STOPPING: &str = "Stream is stopping.";
pub const MSG_NOT_RUNNING: &str = "No stream is running for this camera.";
pub const MSG_MOVED: &str = "Camera moved.";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartRequest {
    pub camera: String,
    pub username: String,
    pub password: String,
    pub destination: String,
}

/// Success flag plus a message for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub success: bool,
    pub message: String,
}

impl Reply {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReply {
    pub found: bool,
    /// Lowercase state name, empty when not found.
    pub state: String,
    pub destination: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub packets: u64,
    /// Failure cause for failed sessions.
    pub detail: String,
}

impl StatusReply {
    fn not_found() -> Self {
        Self {
            found: false,
            state: String::new(),
            destination: String::new(),
            started_at: None,
            finished_at: None,
            packets: 0,
            detail: String::new(),
        }
    }
}

impl From<SessionSnapshot> for StatusReply {
    fn from(snapshot: SessionSnapshot) -> Self {
        Self {
            found: true,
            state: snapshot.state.name().to_string(),
            destination: snapshot.destination,
            started_at: Some(snapshot.started_at),
            finished_at: snapshot.finished_at,
            packets: snapshot.packets,
            detail: snapshot
                .state
                .failure()
                .map(ToString::to_string)
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Left,
    Right,
    Up,
    Down,
    /// Stop any movement.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MoveCommand {
    Direction(Direction),
    Velocity(Velocity),
}

/// Handlers behind the RPC surface.
#[derive(Clone)]
pub struct ControlService {
    sessions: Arc<SessionManager>,
}

impl ControlService {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Accept or reject a start-relay request. Accepted requests are
    /// answered before the camera is contacted.
    pub fn start_stream(&self, request: StartRequest) -> Reply {
        tracing::info!(
            camera = %request.camera,
            destination = %request.destination,
            "received StartStream request"
        );

        let Some(camera) = CameraId::parse(&request.camera) else {
            tracing::warn!("StartStream rejected: missing camera address");
            return Reply::rejected(MSG_MISSING_CAMERA);
        };
        let destination = request.destination.trim();
        if destination.is_empty() {
            tracing::warn!(%camera, "StartStream rejected: missing destination");
            return Reply::rejected(MSG_MISSING_DESTINATION);
        }

        let credentials = Credentials::new(request.username, request.password);
        match self.sessions.start(camera.clone(), credentials, destination) {
            Ok(_) => {
                tracing::info!(%camera, destination, "stream started");
                Reply::ok(MSG_STARTED)
            }
            Err(StartError::Duplicate(_)) => {
                tracing::warn!(%camera, "stream is already running");
                Reply::rejected(MSG_ALREADY_RUNNING)
            }
            Err(StartError::AtCapacity { .. }) => Reply::rejected(MSG_AT_CAPACITY),
            Err(e @ StartError::Spawn(_)) => Reply::rejected(format!("Failed to start stream: {e}")),
        }
    }

    pub fn stream_status(&self, camera: &str) -> StatusReply {
        CameraId::parse(camera)
            .and_then(|camera| self.sessions.status(&camera))
            .map(StatusReply::from)
            .unwrap_or_else(StatusReply::not_found)
    }

    /// Cancel a running relay. Blocks for up to the stop grace period.
    pub fn stop_stream(&self, camera: &str) -> Reply {
        let Some(camera) = CameraId::parse(camera) else {
            return Reply::rejected(MSG_MISSING_CAMERA);
        };
        tracing::info!(%camera, "received StopStream request");

        match self.sessions.stop(&camera) {
            StopOutcome::Stopped(_) => Reply::ok(MSG_STOPPED),
            StopOutcome::StillRunning => Reply::ok(MSG_STOPPING),
            StopOutcome::NotRunning => Reply::rejected(MSG_NOT_RUNNING),
        }
    }

    /// Issue a pan/tilt command. Independent of any running relay.
    pub fn move_camera(
        &self,
        camera: &str,
        credentials: Credentials,
        command: MoveCommand,
    ) -> Reply {
        let Some(camera) = CameraId::parse(camera) else {
            return Reply::rejected(MSG_MISSING_CAMERA);
        };
        let control = self.sessions.camera();

        let result = match command {
            MoveCommand::Direction(Direction::Left) => control.move_left(&camera, &credentials),
            MoveCommand::Direction(Direction::Right) => control.move_right(&camera, &credentials),
            MoveCommand::Direction(Direction::Up) => control.move_up(&camera, &credentials),
            MoveCommand::Direction(Direction::Down) => control.move_down(&camera, &credentials),
            MoveCommand::Direction(Direction::Stop) => control.stop_motion(&camera, &credentials),
            MoveCommand::Velocity(velocity) => {
                control.continuous_move(&camera, &credentials, velocity)
            }
        };

        match result {
            Ok(()) => Reply::ok(MSG_MOVED),
            Err(e) => Reply::rejected(format!("Camera move failed: {e}")),
        }
    }
}
