//! gRPC surface of the camera relay (`camrelay.v1.VideoStreaming`).
//!
//! Maps protobuf messages onto [`ControlService`] calls. Calls that block
//! (waiting for a stopped session, talking to a camera) run on tokio's
//! blocking pool.

use std::future::Future;
use std::net::SocketAddr;

use camrelay::camera::{Credentials, Velocity as CameraVelocity};
use camrelay::control::{self, ControlService, MoveCommand, Reply, StartRequest, StatusReply};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

pub mod proto {
    tonic::include_proto!("camrelay.v1");
}

use proto::move_camera_request::Motion;
use proto::video_streaming_server::{VideoStreaming, VideoStreamingServer};
use proto::{
    Direction, MoveCameraRequest, StopStreamRequest, StreamRequest, StreamResponse,
    StreamStatusRequest, StreamStatusResponse,
};

impl From<Reply> for StreamResponse {
    fn from(reply: Reply) -> Self {
        StreamResponse {
            success: reply.success,
            message: reply.message,
        }
    }
}

impl From<StatusReply> for StreamStatusResponse {
    fn from(reply: StatusReply) -> Self {
        StreamStatusResponse {
            found: reply.found,
            state: reply.state,
            destination: reply.destination,
            started_at: reply
                .started_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
            finished_at: reply
                .finished_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
            packets_relayed: reply.packets,
            detail: reply.detail,
        }
    }
}

impl From<StreamRequest> for StartRequest {
    fn from(request: StreamRequest) -> Self {
        StartRequest {
            camera: request.camera_ip,
            username: request.camera_username,
            password: request.camera_password,
            destination: request.rtp_destination,
        }
    }
}

fn move_command(motion: Option<Motion>) -> Result<MoveCommand, Status> {
    let direction = match motion {
        Some(Motion::Velocity(v)) => {
            return Ok(MoveCommand::Velocity(CameraVelocity::new(v.pan, v.tilt)));
        }
        Some(Motion::Direction(raw)) => Direction::try_from(raw)
            .map_err(|_| Status::invalid_argument(format!("unknown direction {raw}")))?,
        None => return Err(Status::invalid_argument("direction or velocity is required")),
    };

    let direction = match direction {
        Direction::Left => control::Direction::Left,
        Direction::Right => control::Direction::Right,
        Direction::Up => control::Direction::Up,
        Direction::Down => control::Direction::Down,
        Direction::Stop => control::Direction::Stop,
        Direction::Unspecified => {
            return Err(Status::invalid_argument("direction is unspecified"));
        }
    };
    Ok(MoveCommand::Direction(direction))
}

/// `VideoStreaming` service implementation.
#[derive(Clone)]
pub struct VideoStreamingService {
    control: ControlService,
}

impl VideoStreamingService {
    pub fn new(control: ControlService) -> Self {
        Self { control }
    }

    pub fn into_server(self) -> VideoStreamingServer<Self> {
        VideoStreamingServer::new(self)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, Status>
    where
        T: Send + 'static,
        F: FnOnce(ControlService) -> T + Send + 'static,
    {
        let control = self.control.clone();
        tokio::task::spawn_blocking(move || f(control))
            .await
            .map_err(|e| Status::internal(format!("request handler failed: {e}")))
    }
}

#[tonic::async_trait]
impl VideoStreaming for VideoStreamingService {
    async fn start_stream(
        &self,
        request: Request<StreamRequest>,
    ) -> Result<Response<StreamResponse>, Status> {
        let reply = self.control.start_stream(request.into_inner().into());
        Ok(Response::new(reply.into()))
    }

    async fn get_stream_status(
        &self,
        request: Request<StreamStatusRequest>,
    ) -> Result<Response<StreamStatusResponse>, Status> {
        let reply = self.control.stream_status(&request.into_inner().camera_ip);
        Ok(Response::new(reply.into()))
    }

    async fn stop_stream(
        &self,
        request: Request<StopStreamRequest>,
    ) -> Result<Response<StreamResponse>, Status> {
        let camera = request.into_inner().camera_ip;
        let reply = self
            .blocking(move |control| control.stop_stream(&camera))
            .await?;
        Ok(Response::new(reply.into()))
    }

    async fn move_camera(
        &self,
        request: Request<MoveCameraRequest>,
    ) -> Result<Response<StreamResponse>, Status> {
        let request = request.into_inner();
        let command = move_command(request.motion)?;
        let credentials = Credentials::new(request.camera_username, request.camera_password);
        let camera = request.camera_ip;

        tracing::info!(%camera, ?command, "received MoveCamera request");
        let reply = self
            .blocking(move |control| control.move_camera(&camera, credentials, command))
            .await?;
        Ok(Response::new(reply.into()))
    }
}

/// Serve on `addr` until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    control: ControlService,
    shutdown: impl Future<Output = ()>,
) -> Result<(), tonic::transport::Error> {
    tracing::info!(%addr, "gRPC control endpoint listening");
    Server::builder()
        .add_service(VideoStreamingService::new(control).into_server())
        .serve_with_shutdown(addr, shutdown)
        .await
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve_with_listener(
    listener: TcpListener,
    control: ControlService,
    shutdown: impl Future<Output = ()>,
) -> Result<(), tonic::transport::Error> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "gRPC control endpoint listening");
    }
    Server::builder()
        .add_service(VideoStreamingService::new(control).into_server())
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directions_map_onto_commands() {
        let cases = [
            (Direction::Left, control::Direction::Left),
            (Direction::Right, control::Direction::Right),
            (Direction::Up, control::Direction::Up),
            (Direction::Down, control::Direction::Down),
            (Direction::Stop, control::Direction::Stop),
        ];
        for (proto, expected) in cases {
            let command = move_command(Some(Motion::Direction(proto as i32))).unwrap();
            assert_eq!(command, MoveCommand::Direction(expected));
        }
    }

    #[test]
    fn velocity_passes_through() {
        let command = move_command(Some(Motion::Velocity(proto::Velocity {
            pan: 0.25,
            tilt: -1.0,
        })))
        .unwrap();
        assert_eq!(
            command,
            MoveCommand::Velocity(CameraVelocity::new(0.25, -1.0))
        );
    }

    #[test]
    fn missing_or_unknown_motion_is_invalid() {
        for motion in [
            None,
            Some(Motion::Direction(Direction::Unspecified as i32)),
            Some(Motion::Direction(99)),
        ] {
            let status = move_command(motion).unwrap_err();
            assert_eq!(status.code(), tonic::Code::InvalidArgument);
        }
    }

    #[test]
    fn status_reply_maps_timestamps() {
        let reply = StatusReply {
            found: true,
            state: "relaying".into(),
            destination: "rtp://10.0.0.9:5000".into(),
            started_at: Some("2024-05-01T12:00:00Z".parse().unwrap()),
            finished_at: None,
            packets: 10,
            detail: String::new(),
        };
        let response = StreamStatusResponse::from(reply);
        assert_eq!(response.started_at, "2024-05-01T12:00:00+00:00");
        assert!(response.finished_at.is_empty());
        assert_eq!(response.packets_relayed, 10);
    }
}
