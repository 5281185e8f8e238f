//! Session orchestration.
//!
//! [`SessionManager::start`] reserves the camera's slot and spawns one
//! named thread per session. The thread resolves the camera's media
//! source, runs the relay to its end, and releases the slot. The caller
//! gets an answer as soon as the thread is spawned.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::Mutex;

use crate::camera::{CameraControl, CameraId, Credentials, DEFAULT_PROFILE_TOKEN};
use crate::error::StartError;
use crate::relay::{Relay, RelayOutcome};
use crate::session::{
    FailureCause, InMemoryRegistry, Reservation, Session, SessionConfig, SessionRegistry,
    SessionSnapshot, SessionState,
};

/// Result of [`SessionManager::stop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// No session is running for the camera.
    NotRunning,
    /// The session reached a terminal state within the grace period.
    Stopped(SessionSnapshot),
    /// The camera still holds its slot: the session is winding down, or
    /// its start has reserved the slot but not yet attached the session.
    StillRunning,
}

/// Releases a camera's slot when dropped.
struct SlotGuard {
    registry: Arc<dyn SessionRegistry>,
    camera: CameraId,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.registry.release(&self.camera);
    }
}

/// What a session thread needs besides its [`Session`].
#[derive(Clone)]
struct Worker {
    registry: Arc<dyn SessionRegistry>,
    camera: Arc<dyn CameraControl>,
    relay: Arc<dyn Relay>,
    history: Arc<Mutex<HashMap<CameraId, SessionSnapshot>>>,
    profile_token: String,
}

impl Worker {
    fn run(self, session: Arc<Session>, credentials: Credentials) {
        let guard = SlotGuard {
            registry: self.registry.clone(),
            camera: session.camera().clone(),
        };

        let terminal = panic::catch_unwind(AssertUnwindSafe(|| {
            self.drive(&session, &credentials)
        }))
        .unwrap_or_else(|payload| {
            SessionState::Failed(FailureCause::Panicked(panic_message(payload.as_ref())))
        });

        session.finish(terminal);
        self.history
            .lock()
            .insert(session.camera().clone(), session.snapshot());
        drop(guard);
        session.settle();
    }

    fn drive(&self, session: &Session, credentials: &Credentials) -> SessionState {
        if session.is_cancelled() {
            return SessionState::Cancelled;
        }

        session.transition(SessionState::Resolving);
        let resolved =
            self.camera
                .resolve_source(session.camera(), credentials, &self.profile_token);
        let source = match resolved {
            Ok(source) => source,
            Err(e) => return SessionState::Failed(FailureCause::SourceResolution(e.to_string())),
        };

        if session.is_cancelled() {
            return SessionState::Cancelled;
        }

        session.transition(SessionState::Relaying);
        match self.relay.relay(
            &source.uri,
            session.destination(),
            session.cancel_flag(),
            session.packet_counter(),
        ) {
            RelayOutcome::Completed(_) => SessionState::Completed,
            RelayOutcome::Cancelled(_) => SessionState::Cancelled,
            RelayOutcome::Failed(err) => SessionState::Failed(FailureCause::Relay(err)),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Starts, tracks, and stops relay sessions.
///
/// Each manager owns its registry; two managers never share slots unless
/// they are given the same registry.
pub struct SessionManager {
    worker: Worker,
    config: SessionConfig,
}

impl SessionManager {
    /// Manager with an [`InMemoryRegistry`].
    pub fn new(
        camera: Arc<dyn CameraControl>,
        relay: Arc<dyn Relay>,
        config: SessionConfig,
    ) -> Self {
        Self::with_registry(Arc::new(InMemoryRegistry::new()), camera, relay, config)
    }

    pub fn with_registry(
        registry: Arc<dyn SessionRegistry>,
        camera: Arc<dyn CameraControl>,
        relay: Arc<dyn Relay>,
        config: SessionConfig,
    ) -> Self {
        Self {
            worker: Worker {
                registry,
                camera,
                relay,
                history: Arc::new(Mutex::new(HashMap::new())),
                profile_token: DEFAULT_PROFILE_TOKEN.to_string(),
            },
            config,
        }
    }

    /// Media profile used to resolve sources.
    pub fn with_profile_token(mut self, token: impl Into<String>) -> Self {
        self.worker.profile_token = token.into();
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<dyn SessionRegistry> {
        &self.worker.registry
    }

    /// Camera control client shared with the session threads.
    pub fn camera(&self) -> &Arc<dyn CameraControl> {
        &self.worker.camera
    }

    /// Reserve `camera`'s slot and start relaying its stream to
    /// `destination` on a new thread.
    ///
    /// Returns once the thread is spawned; resolution and relaying happen
    /// afterwards and are observable through [`status`](Self::status).
    pub fn start(
        &self,
        camera: CameraId,
        credentials: Credentials,
        destination: &str,
    ) -> Result<Arc<Session>, StartError> {
        let session = Arc::new(Session::new(camera.clone(), destination));
        tracing::debug!(%camera, destination, "session requested");

        match self.worker.registry.reserve(&camera, self.config.max_sessions) {
            Reservation::Reserved => {}
            Reservation::Duplicate => {
                tracing::info!(%camera, "stream already running, start rejected");
                return Err(StartError::Duplicate(camera.to_string()));
            }
            Reservation::AtCapacity => {
                let limit = self.config.max_sessions.unwrap_or_default();
                tracing::warn!(%camera, limit, "session limit reached, start rejected");
                return Err(StartError::AtCapacity { limit });
            }
        }

        session.transition(SessionState::Reserved);
        self.worker.registry.attach(&camera, session.clone());

        let worker = self.worker.clone();
        let thread_session = session.clone();
        let spawned = thread::Builder::new()
            .name(format!("relay-{camera}"))
            .spawn(move || worker.run(thread_session, credentials));

        match spawned {
            Ok(handle) => {
                session.set_thread(handle);
                Ok(session)
            }
            Err(e) => {
                tracing::error!(%camera, error = %e, "failed to spawn session thread");
                self.worker.registry.release(&camera);
                Err(StartError::Spawn(e))
            }
        }
    }

    /// Cancel `camera`'s session and wait up to the grace period for it.
    pub fn stop(&self, camera: &CameraId) -> StopOutcome {
        let Some(session) = self.worker.registry.get(camera) else {
            if self.worker.registry.contains(camera) {
                tracing::debug!(%camera, "stop requested before session attached");
                return StopOutcome::StillRunning;
            }
            return StopOutcome::NotRunning;
        };

        session.cancel();
        if session.wait_settled(self.config.stop_grace) {
            session.join();
            StopOutcome::Stopped(session.snapshot())
        } else {
            tracing::warn!(
                %camera,
                grace_ms = self.config.stop_grace.as_millis() as u64,
                "session did not stop within grace period"
            );
            StopOutcome::StillRunning
        }
    }

    /// The running session for `camera`, else its most recent finished one.
    pub fn status(&self, camera: &CameraId) -> Option<SessionSnapshot> {
        if let Some(session) = self.worker.registry.get(camera) {
            return Some(session.snapshot());
        }
        self.worker.history.lock().get(camera).cloned()
    }

    /// Snapshots of every running session, ordered by camera id.
    pub fn active(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<_> = self
            .worker
            .registry
            .active()
            .iter()
            .map(|s| s.snapshot())
            .collect();
        sessions.sort_by(|a, b| a.camera.cmp(&b.camera));
        sessions
    }

    /// Cancel every running session and wait for them, sharing one grace
    /// period. Returns how many were still running when it expired.
    pub fn shutdown(&self) -> usize {
        let sessions = self.worker.registry.active();
        if sessions.is_empty() {
            return 0;
        }
        tracing::info!(sessions = sessions.len(), "stopping all sessions");

        for session in &sessions {
            session.cancel();
        }

        let deadline = Instant::now() + self.config.stop_grace;
        let mut lingering = 0;
        for session in &sessions {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if session.wait_settled(remaining) {
                session.join();
            } else {
                tracing::warn!(camera = %session.camera(), "session still running at shutdown");
                lingering += 1;
            }
        }
        lingering
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        for session in self.worker.registry.active() {
            session.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Barrier, mpsc};
    use std::time::Duration;

    use super::*;
    use crate::camera::{MediaSource, StreamType, TransportProtocol, Velocity};
    use crate::error::{CameraError, MediaError, RelayError};
    use crate::relay::RelayStats;

    const DEST: &str = "rtp://10.0.0.9:5000";
    const WAIT: Duration = Duration::from_secs(5);

    fn cam(addr: &str) -> CameraId {
        CameraId::parse(addr).unwrap()
    }

    fn creds() -> Credentials {
        Credentials::new("admin", "pw")
    }

    /// Resolves every camera to `rtsp://<camera>/stream1`, or fails.
    #[derive(Default)]
    struct FakeCamera {
        fail: bool,
        resolves: AtomicUsize,
    }

    impl CameraControl for FakeCamera {
        fn resolve_source(
            &self,
            camera: &CameraId,
            _: &Credentials,
            profile_token: &str,
        ) -> Result<MediaSource, CameraError> {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CameraError::Fault {
                    reason: "Sender not Authorized".into(),
                });
            }
            Ok(MediaSource {
                uri: format!("rtsp://{camera}/stream1"),
                stream: StreamType::RtpUnicast,
                protocol: TransportProtocol::Rtsp,
                profile_token: profile_token.to_string(),
            })
        }

        fn continuous_move(&self, _: &CameraId, _: &Credentials, _: Velocity) -> Result<(), CameraError> {
            Ok(())
        }

        fn stop_motion(&self, _: &CameraId, _: &Credentials) -> Result<(), CameraError> {
            Ok(())
        }
    }

    enum Behavior {
        /// Return `Completed` after `packets` packets.
        Complete { packets: u64 },
        Fail(RelayError),
        /// Relay until cancelled.
        RunUntilCancelled,
        /// Ignore cancellation until the gate is opened.
        Stubborn(Mutex<Option<mpsc::Receiver<()>>>),
        Panic,
    }

    struct FakeRelay {
        behavior: Behavior,
        sources: Mutex<Vec<String>>,
    }

    impl FakeRelay {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                sources: Mutex::new(Vec::new()),
            })
        }
    }

    impl Relay for FakeRelay {
        fn relay(
            &self,
            source: &str,
            _destination: &str,
            cancel: &AtomicBool,
            packets: &AtomicU64,
        ) -> RelayOutcome {
            self.sources.lock().push(source.to_string());
            match &self.behavior {
                Behavior::Complete { packets: n } => {
                    packets.fetch_add(*n, Ordering::Relaxed);
                    RelayOutcome::Completed(RelayStats {
                        packets: *n,
                        skipped: 0,
                    })
                }
                Behavior::Fail(err) => RelayOutcome::Failed(err.clone()),
                Behavior::RunUntilCancelled => {
                    while !cancel.load(Ordering::Acquire) {
                        packets.fetch_add(1, Ordering::Relaxed);
                        thread::sleep(Duration::from_millis(2));
                    }
                    RelayOutcome::Cancelled(RelayStats::default())
                }
                Behavior::Stubborn(gate) => {
                    if let Some(rx) = gate.lock().take() {
                        let _ = rx.recv();
                    }
                    RelayOutcome::Cancelled(RelayStats::default())
                }
                Behavior::Panic => panic!("demuxer exploded"),
            }
        }
    }

    fn manager(camera: Arc<FakeCamera>, relay: Arc<FakeRelay>) -> SessionManager {
        SessionManager::new(camera, relay, SessionConfig::default())
    }

    #[test]
    fn completed_session_releases_slot() {
        let relay = FakeRelay::new(Behavior::Complete { packets: 42 });
        let mgr = manager(Arc::default(), relay.clone());

        let session = mgr.start(cam("10.0.0.5"), creds(), DEST).unwrap();
        assert!(session.wait_settled(WAIT));

        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(session.packets(), 42);
        assert!(mgr.registry().is_empty());
        assert_eq!(*relay.sources.lock(), vec!["rtsp://10.0.0.5/stream1"]);

        let status = mgr.status(&cam("10.0.0.5")).unwrap();
        assert_eq!(status.state, SessionState::Completed);
        assert_eq!(status.packets, 42);
        assert!(status.finished_at.is_some());
    }

    #[test]
    fn duplicate_start_is_rejected_while_running() {
        let camera = Arc::new(FakeCamera::default());
        let mgr = manager(camera.clone(), FakeRelay::new(Behavior::RunUntilCancelled));
        let id = cam("10.0.0.5");

        let first = mgr.start(id.clone(), creds(), DEST).unwrap();
        let err = mgr.start(id.clone(), creds(), DEST).unwrap_err();

        assert!(matches!(err, StartError::Duplicate(ref c) if c == "10.0.0.5"));
        assert_eq!(mgr.registry().len(), 1);

        first.cancel();
        assert!(first.wait_settled(WAIT));
        assert_eq!(camera.resolves.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn camera_can_restart_after_session_ends() {
        let mgr = manager(Arc::default(), FakeRelay::new(Behavior::Complete { packets: 1 }));
        let id = cam("10.0.0.5");

        let first = mgr.start(id.clone(), creds(), DEST).unwrap();
        assert!(first.wait_settled(WAIT));
        let second = mgr.start(id, creds(), DEST).unwrap();
        assert!(second.wait_settled(WAIT));
        assert_eq!(second.state(), SessionState::Completed);
    }

    #[test]
    fn resolution_failure_never_relays() {
        let camera = Arc::new(FakeCamera {
            fail: true,
            ..FakeCamera::default()
        });
        let relay = FakeRelay::new(Behavior::Complete { packets: 1 });
        let mgr = manager(camera, relay.clone());

        let session = mgr.start(cam("10.0.0.5"), creds(), DEST).unwrap();
        assert!(session.wait_settled(WAIT));

        match session.state() {
            SessionState::Failed(FailureCause::SourceResolution(reason)) => {
                assert!(reason.contains("Sender not Authorized"));
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert!(relay.sources.lock().is_empty());
        assert!(mgr.registry().is_empty());
    }

    #[test]
    fn relay_failure_is_recorded() {
        let err = RelayError::DestinationOpen(MediaError::new("invalid argument"));
        let mgr = manager(Arc::default(), FakeRelay::new(Behavior::Fail(err.clone())));

        let session = mgr.start(cam("10.0.0.5"), creds(), DEST).unwrap();
        assert!(session.wait_settled(WAIT));

        assert_eq!(
            session.state(),
            SessionState::Failed(FailureCause::Relay(err))
        );
        assert!(mgr.registry().is_empty());
    }

    #[test]
    fn panicking_relay_releases_slot() {
        let mgr = manager(Arc::default(), FakeRelay::new(Behavior::Panic));

        let session = mgr.start(cam("10.0.0.5"), creds(), DEST).unwrap();
        assert!(session.wait_settled(WAIT));

        match session.state() {
            SessionState::Failed(FailureCause::Panicked(msg)) => {
                assert_eq!(msg, "demuxer exploded");
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert!(mgr.registry().is_empty());
    }

    #[test]
    fn stop_cancels_running_session() {
        let mgr = manager(Arc::default(), FakeRelay::new(Behavior::RunUntilCancelled));
        let id = cam("10.0.0.5");
        mgr.start(id.clone(), creds(), DEST).unwrap();

        match mgr.stop(&id) {
            StopOutcome::Stopped(snapshot) => {
                assert_eq!(snapshot.state, SessionState::Cancelled);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(mgr.registry().is_empty());
        assert_eq!(mgr.stop(&id), StopOutcome::NotRunning);
        assert_eq!(mgr.status(&id).unwrap().state, SessionState::Cancelled);
    }

    #[test]
    fn stop_reports_sessions_outliving_grace_period() {
        let (open_gate, gate) = mpsc::channel();
        let relay = FakeRelay::new(Behavior::Stubborn(Mutex::new(Some(gate))));
        let mgr = SessionManager::new(
            Arc::new(FakeCamera::default()),
            relay,
            SessionConfig {
                stop_grace: Duration::from_millis(50),
                ..SessionConfig::default()
            },
        );
        let id = cam("10.0.0.5");
        let session = mgr.start(id.clone(), creds(), DEST).unwrap();

        // Wait until the relay is actually blocked.
        let deadline = Instant::now() + WAIT;
        while session.state() != SessionState::Relaying && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(mgr.stop(&id), StopOutcome::StillRunning);
        assert_eq!(mgr.registry().len(), 1);
        assert!(matches!(
            mgr.start(id.clone(), creds(), DEST),
            Err(StartError::Duplicate(_))
        ));

        open_gate.send(()).unwrap();
        assert!(session.wait_settled(WAIT));
        assert!(mgr.registry().is_empty());
    }

    #[test]
    fn stop_before_attach_reports_still_running() {
        let registry: Arc<dyn SessionRegistry> = Arc::new(InMemoryRegistry::new());
        let mgr = SessionManager::with_registry(
            registry.clone(),
            Arc::new(FakeCamera::default()),
            FakeRelay::new(Behavior::Complete { packets: 1 }),
            SessionConfig::default(),
        );
        let id = cam("10.0.0.5");

        // A start elsewhere has reserved the slot but not attached yet.
        assert!(registry.try_reserve(&id));
        assert_eq!(mgr.stop(&id), StopOutcome::StillRunning);
        assert!(matches!(
            mgr.start(id.clone(), creds(), DEST),
            Err(StartError::Duplicate(_))
        ));

        registry.release(&id);
        assert_eq!(mgr.stop(&id), StopOutcome::NotRunning);
    }

    #[test]
    fn capacity_limit_rejects_extra_sessions() {
        let mgr = SessionManager::new(
            Arc::new(FakeCamera::default()),
            FakeRelay::new(Behavior::RunUntilCancelled),
            SessionConfig {
                max_sessions: Some(2),
                ..SessionConfig::default()
            },
        );

        mgr.start(cam("a"), creds(), DEST).unwrap();
        mgr.start(cam("b"), creds(), DEST).unwrap();
        let err = mgr.start(cam("c"), creds(), DEST).unwrap_err();

        assert!(matches!(err, StartError::AtCapacity { limit: 2 }));
        assert_eq!(mgr.shutdown(), 0);
        assert!(mgr.registry().is_empty());
    }

    #[test]
    fn concurrent_starts_for_one_camera_admit_one() {
        const RACERS: usize = 8;
        let mgr = Arc::new(manager(
            Arc::default(),
            FakeRelay::new(Behavior::RunUntilCancelled),
        ));
        let barrier = Arc::new(Barrier::new(RACERS));

        let handles: Vec<_> = (0..RACERS)
            .map(|_| {
                let mgr = mgr.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    mgr.start(cam("10.0.0.5"), creds(), DEST).is_ok()
                })
            })
            .collect();

        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(mgr.shutdown(), 0);
    }

    #[test]
    fn active_lists_running_sessions_in_camera_order() {
        let mgr = manager(Arc::default(), FakeRelay::new(Behavior::RunUntilCancelled));
        mgr.start(cam("10.0.0.7"), creds(), DEST).unwrap();
        mgr.start(cam("10.0.0.5"), creds(), DEST).unwrap();

        let cameras: Vec<_> = mgr
            .active()
            .into_iter()
            .map(|s| s.camera.to_string())
            .collect();
        assert_eq!(cameras, vec!["10.0.0.5", "10.0.0.7"]);
        mgr.shutdown();
    }

    #[test]
    fn status_of_unknown_camera_is_none() {
        let mgr = manager(Arc::default(), FakeRelay::new(Behavior::Complete { packets: 0 }));
        assert!(mgr.status(&cam("10.0.0.5")).is_none());
    }

    #[test]
    fn profile_token_reaches_camera() {
        struct TokenCheck(Mutex<Option<String>>);
        impl CameraControl for TokenCheck {
            fn resolve_source(
                &self,
                _: &CameraId,
                _: &Credentials,
                token: &str,
            ) -> Result<MediaSource, CameraError> {
                *self.0.lock() = Some(token.to_string());
                Err(CameraError::MissingUri)
            }
            fn continuous_move(&self, _: &CameraId, _: &Credentials, _: Velocity) -> Result<(), CameraError> {
                Ok(())
            }
            fn stop_motion(&self, _: &CameraId, _: &Credentials) -> Result<(), CameraError> {
                Ok(())
            }
        }

        let camera = Arc::new(TokenCheck(Mutex::new(None)));
        let mgr = SessionManager::new(
            camera.clone(),
            FakeRelay::new(Behavior::Complete { packets: 0 }),
            SessionConfig::default(),
        )
        .with_profile_token("MainStream");

        let session = mgr.start(cam("10.0.0.5"), creds(), DEST).unwrap();
        assert!(session.wait_settled(WAIT));
        assert_eq!(camera.0.lock().as_deref(), Some("MainStream"));
    }
}
