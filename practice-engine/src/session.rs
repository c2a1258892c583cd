//! Speech session: owns one recognition backend and keeps it listening
//! while the caller wants it to, restarting it after the host recognizer
//! ends itself and retrying transient failures with a bounded backoff.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use practice_types::{RecognitionErrorKind, RecognitionState};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::permission::{PermissionProvider, PermissionStatus};
use crate::recognition::{
    create_backend, BackendKind, BackendPreference, EventReceiver, EventSender,
    PlatformCapabilities, RecognitionBackend, RecognitionEvent, RunId, StartError, TaggedEvent,
};
use crate::timing::sleep_until_opt;

/// Bounded retry for transient recognition failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failed runs tolerated before giving up.
    pub max_transient_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_transient_retries: 3,
            base_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(4),
        }
    }
}

/// What the session reports to its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Partial(String),
    Final(String),
    /// A backend run ended; carries the last transcript seen in that run.
    UtteranceEnded(Option<String>),
    /// Transient failure. The session retries on its own.
    Error(RecognitionErrorKind),
    /// The session gave up and is no longer listening.
    Failed(RecognitionErrorKind),
}

#[derive(Debug, Clone, Copy)]
struct PendingRestart {
    at: Instant,
    generation: u64,
}

pub struct SpeechSession {
    backend: Box<dyn RecognitionBackend>,
    events: EventReceiver,
    permissions: Arc<dyn PermissionProvider>,
    policy: RetryPolicy,
    locale: String,
    desired_active: bool,
    engine_state: RecognitionState,
    permission_granted: bool,
    active_run: Option<RunId>,
    run_error: Option<RecognitionErrorKind>,
    consecutive_failures: u32,
    pending_restart: Option<PendingRestart>,
    stop_generation: u64,
    last_text: Option<String>,
    outbox: VecDeque<SessionEvent>,
    destroyed: bool,
}

impl SpeechSession {
    /// Create a session around the backend built by `make_backend`, which
    /// receives the sender half of the session's event channel.
    pub fn new<F>(
        make_backend: F,
        permissions: Arc<dyn PermissionProvider>,
        policy: RetryPolicy,
    ) -> Result<Self>
    where
        F: FnOnce(EventSender) -> Result<Box<dyn RecognitionBackend>>,
    {
        let (tx, events) = mpsc::unbounded_channel();
        let backend = make_backend(tx)?;

        Ok(Self {
            backend,
            events,
            permissions,
            policy,
            locale: String::new(),
            desired_active: false,
            engine_state: RecognitionState::Idle,
            permission_granted: false,
            active_run: None,
            run_error: None,
            consecutive_failures: 0,
            pending_restart: None,
            stop_generation: 0,
            last_text: None,
            outbox: VecDeque::new(),
            destroyed: false,
        })
    }

    /// Resolve the backend strategy once and build the session around it.
    pub fn from_capabilities(
        preference: BackendPreference,
        capabilities: PlatformCapabilities,
        permissions: Arc<dyn PermissionProvider>,
        policy: RetryPolicy,
    ) -> Result<Self> {
        Self::new(
            |tx| create_backend(preference, capabilities, tx),
            permissions,
            policy,
        )
    }

    pub fn engine_state(&self) -> RecognitionState {
        self.engine_state
    }

    pub fn desired_active(&self) -> bool {
        self.desired_active
    }

    pub fn is_listening(&self) -> bool {
        self.active_run.is_some()
    }

    pub fn has_pending_restart(&self) -> bool {
        self.pending_restart.is_some()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }

    /// Acquire permission if needed, then start listening.
    ///
    /// Any previous run is stopped first. Suspends while the permission
    /// prompt is open.
    pub async fn request_start(&mut self, locale: &str) -> Result<(), StartError> {
        if self.destroyed {
            return Err(StartError::Destroyed);
        }

        self.halt();
        self.outbox.clear();
        self.locale = locale.to_string();

        if !self.permission_granted {
            self.set_state(RecognitionState::RequestingPermission);
            let status = match self.permissions.query().await {
                PermissionStatus::Denied => {
                    info!("Requesting microphone permission");
                    self.permissions.request().await
                }
                status => status,
            };

            match status {
                PermissionStatus::Granted => {
                    info!("Microphone permission granted");
                    self.permission_granted = true;
                }
                PermissionStatus::Denied => {
                    warn!("Microphone permission denied");
                    self.set_state(RecognitionState::PermissionDenied);
                    return Err(StartError::PermissionDenied);
                }
                PermissionStatus::Unavailable => {
                    warn!("No microphone permission system or device available");
                    self.set_state(RecognitionState::Unavailable);
                    return Err(StartError::Unavailable);
                }
            }
        }

        self.desired_active = true;
        self.consecutive_failures = 0;

        match self.start_run() {
            Ok(()) => {
                info!("Listening ({}, {:?} backend)", self.locale, self.backend.kind());
                Ok(())
            }
            Err(e) => {
                warn!("Recognition backend failed to start: {}", e);
                self.desired_active = false;
                self.set_state(match e {
                    StartError::PermissionDenied => RecognitionState::PermissionDenied,
                    StartError::Unavailable => RecognitionState::Unavailable,
                    _ => RecognitionState::Error(e.error_kind()),
                });
                if e == StartError::PermissionDenied {
                    self.permission_granted = false;
                }
                Err(e)
            }
        }
    }

    /// Stop listening. Cancels any scheduled restart; idempotent.
    pub fn request_stop(&mut self) {
        let was_active = self.desired_active || self.active_run.is_some();
        self.halt();
        self.outbox.clear();

        if matches!(
            self.engine_state,
            RecognitionState::Listening
                | RecognitionState::RequestingPermission
                | RecognitionState::Error(_)
        ) {
            self.set_state(RecognitionState::Idle);
        }
        if was_active {
            info!("Speech session stopped");
        }
    }

    /// Stop and release the backend. The session cannot be restarted.
    pub fn shutdown(&mut self) {
        if self.destroyed {
            return;
        }
        self.request_stop();
        self.backend.destroy();
        self.destroyed = true;
        info!("Speech session torn down");
    }

    /// Wait for the next event, firing scheduled restarts along the way.
    ///
    /// Returns `None` once the session is torn down. Pending forever while
    /// idle, so callers select over it alongside their own timers.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            if let Some(event) = self.outbox.pop_front() {
                return Some(event);
            }
            if self.destroyed {
                return None;
            }

            let restart_at = self.pending_restart.map(|p| p.at);
            tokio::select! {
                tagged = self.events.recv() => match tagged {
                    Some(tagged) => self.handle(tagged),
                    None => return None,
                },
                _ = sleep_until_opt(restart_at) => self.fire_pending_restart(),
            }
        }
    }

    /// Process everything already queued without waiting.
    pub fn poll_events(&mut self) -> Vec<SessionEvent> {
        while let Ok(tagged) = self.events.try_recv() {
            self.handle(tagged);
        }
        self.outbox.drain(..).collect()
    }

    /// Stop the backend and cancel restarts. Events already queued for the
    /// consumer stay queued.
    fn halt(&mut self) {
        self.desired_active = false;
        self.stop_generation += 1;
        self.pending_restart = None;
        self.active_run = None;
        self.run_error = None;
        self.last_text = None;
        self.backend.stop();
    }

    fn set_state(&mut self, state: RecognitionState) {
        if self.engine_state != state {
            debug!("Recognition state {:?} -> {:?}", self.engine_state, state);
            self.engine_state = state;
        }
    }

    fn start_run(&mut self) -> Result<(), StartError> {
        let run = self.backend.start(&self.locale)?;
        self.active_run = Some(run);
        self.run_error = None;
        self.set_state(RecognitionState::Listening);
        Ok(())
    }

    fn handle(&mut self, tagged: TaggedEvent) {
        if self.active_run != Some(tagged.run) {
            debug!("Dropping {:?} from stale run {}", tagged.event, tagged.run);
            return;
        }

        match tagged.event {
            RecognitionEvent::Partial(text) => {
                self.on_transcript(&text);
                self.outbox.push_back(SessionEvent::Partial(text));
            }
            RecognitionEvent::Final(text) => {
                self.on_transcript(&text);
                self.outbox.push_back(SessionEvent::Final(text));
            }
            RecognitionEvent::Error(kind) => self.on_error(kind),
            RecognitionEvent::End => self.on_end(),
        }
    }

    fn on_transcript(&mut self, text: &str) {
        self.consecutive_failures = 0;
        self.last_text = Some(text.to_string());
        self.set_state(RecognitionState::Listening);
    }

    fn on_error(&mut self, kind: RecognitionErrorKind) {
        if kind.is_terminal() {
            self.fail_terminal(kind);
            return;
        }

        self.consecutive_failures += 1;
        self.run_error = Some(kind);
        warn!(
            "Recognition {} (consecutive failures: {})",
            kind, self.consecutive_failures
        );
        self.set_state(RecognitionState::Error(kind));
        self.outbox.push_back(SessionEvent::Error(kind));
    }

    fn fail_terminal(&mut self, kind: RecognitionErrorKind) {
        warn!("Recognition stopped: {}", kind);
        self.halt();
        if kind == RecognitionErrorKind::PermissionDenied {
            self.permission_granted = false;
            self.set_state(RecognitionState::PermissionDenied);
        } else {
            self.set_state(RecognitionState::Unavailable);
        }
        self.outbox.push_back(SessionEvent::Failed(kind));
    }

    fn on_end(&mut self) {
        self.active_run = None;
        let last = self.last_text.take();
        self.outbox.push_back(SessionEvent::UtteranceEnded(last));

        if !self.desired_active || self.engine_state.blocks_restart() {
            if self.engine_state == RecognitionState::Listening {
                self.set_state(RecognitionState::Idle);
            }
            return;
        }

        match self.run_error.take() {
            Some(kind) => self.schedule_retry(kind),
            None => {
                // Clean end: the host recognizer stops after each utterance
                self.consecutive_failures = 0;
                debug!("Recognizer ended while listening is desired, restarting");
                self.restart_now();
            }
        }
    }

    fn schedule_retry(&mut self, kind: RecognitionErrorKind) {
        if self.consecutive_failures > self.policy.max_transient_retries {
            error!(
                "Giving up after {} consecutive recognition failures ({})",
                self.consecutive_failures, kind
            );
            self.desired_active = false;
            self.stop_generation += 1;
            self.pending_restart = None;
            self.outbox.push_back(SessionEvent::Failed(kind));
            return;
        }

        let delay = self.policy.backoff(self.consecutive_failures);
        info!(
            "Retrying recognition in {:?} (attempt {}/{})",
            delay, self.consecutive_failures, self.policy.max_transient_retries
        );
        self.pending_restart = Some(PendingRestart {
            at: Instant::now() + delay,
            generation: self.stop_generation,
        });
    }

    fn fire_pending_restart(&mut self) {
        let Some(pending) = self.pending_restart.take() else {
            return;
        };
        if pending.generation != self.stop_generation || !self.desired_active {
            debug!("Skipping restart cancelled by stop");
            return;
        }
        self.restart_now();
    }

    fn restart_now(&mut self) {
        if let Err(e) = self.start_run() {
            match e {
                StartError::PermissionDenied => {
                    self.fail_terminal(RecognitionErrorKind::PermissionDenied)
                }
                StartError::Unavailable => {
                    self.fail_terminal(RecognitionErrorKind::ServiceUnavailable)
                }
                e => {
                    let kind = e.error_kind();
                    self.consecutive_failures += 1;
                    warn!("Restart failed: {}", e);
                    self.set_state(RecognitionState::Error(kind));
                    self.outbox.push_back(SessionEvent::Error(kind));
                    self.schedule_retry(kind);
                }
            }
        }
    }
}

impl Drop for SpeechSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::StaticPermissions;
    use crate::recognition::host::HostBackend;
    use crate::recognition::scripted::HostScript;
    use tokio::time::timeout;

    fn host_session(
        script: &HostScript,
        permissions: StaticPermissions,
        policy: RetryPolicy,
    ) -> SpeechSession {
        let api = script.api();
        SpeechSession::new(
            move |tx| Ok(Box::new(HostBackend::new(Box::new(api), tx)) as Box<dyn RecognitionBackend>),
            Arc::new(permissions),
            policy,
        )
        .unwrap()
    }

    fn fast_policy(max: u32) -> RetryPolicy {
        RetryPolicy {
            max_transient_retries: max,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(250));
        assert_eq!(policy.backoff(2), Duration::from_millis(500));
        assert_eq!(policy.backoff(3), Duration::from_millis(1000));
        assert_eq!(policy.backoff(10), Duration::from_secs(4));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_start_listens() {
        let script = HostScript::new();
        let mut session = host_session(&script, StaticPermissions::granted(), RetryPolicy::default());

        session.request_start("tr-TR").await.unwrap();

        assert_eq!(session.engine_state(), RecognitionState::Listening);
        assert!(session.desired_active());
        assert_eq!(script.begin_count(), 1);
        assert_eq!(script.last_locale().as_deref(), Some("tr-TR"));
    }

    #[tokio::test]
    async fn test_permission_denied_does_not_start() {
        let script = HostScript::new();
        let mut session = host_session(&script, StaticPermissions::denied(), RetryPolicy::default());

        let result = session.request_start("tr-TR").await;

        assert_eq!(result, Err(StartError::PermissionDenied));
        assert_eq!(session.engine_state(), RecognitionState::PermissionDenied);
        assert!(!session.desired_active());
        assert_eq!(script.begin_count(), 0);
    }

    #[tokio::test]
    async fn test_permission_unavailable() {
        let script = HostScript::new();
        let mut session =
            host_session(&script, StaticPermissions::unavailable(), RetryPolicy::default());

        assert_eq!(session.request_start("tr-TR").await, Err(StartError::Unavailable));
        assert_eq!(session.engine_state(), RecognitionState::Unavailable);
    }

    #[tokio::test]
    async fn test_permission_requested_once() {
        let script = HostScript::new();
        let permissions = Arc::new(StaticPermissions::prompt_grants());
        let api = script.api();
        let mut session = SpeechSession::new(
            move |tx| Ok(Box::new(HostBackend::new(Box::new(api), tx)) as Box<dyn RecognitionBackend>),
            permissions.clone(),
            RetryPolicy::default(),
        )
        .unwrap();

        session.request_start("tr-TR").await.unwrap();
        session.request_stop();
        session.request_start("tr-TR").await.unwrap();

        assert_eq!(permissions.request_count(), 1);
        assert_eq!(script.begin_count(), 2);
    }

    #[tokio::test]
    async fn test_restarts_after_host_end() {
        let script = HostScript::new();
        let mut session = host_session(&script, StaticPermissions::granted(), RetryPolicy::default());
        session.request_start("tr-TR").await.unwrap();

        assert!(script.speak("kalem"));
        let events = session.poll_events();

        assert_eq!(
            events,
            vec![
                SessionEvent::Partial("kalem".into()),
                SessionEvent::Final("kalem".into()),
                SessionEvent::UtteranceEnded(Some("kalem".into())),
            ]
        );
        assert_eq!(script.begin_count(), 2);
        assert!(script.is_listening());
        assert_eq!(session.engine_state(), RecognitionState::Listening);
    }

    #[tokio::test]
    async fn test_stop_before_end_is_processed_skips_restart() {
        let script = HostScript::new();
        let mut session = host_session(&script, StaticPermissions::granted(), RetryPolicy::default());
        session.request_start("tr-TR").await.unwrap();

        // End is already queued when the caller stops
        script.speak("kalem");
        session.request_stop();

        assert!(session.poll_events().is_empty());
        assert_eq!(script.begin_count(), 1);
        assert_eq!(session.engine_state(), RecognitionState::Idle);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let script = HostScript::new();
        let mut session = host_session(&script, StaticPermissions::granted(), RetryPolicy::default());
        session.request_start("tr-TR").await.unwrap();

        session.request_stop();
        session.request_stop();

        assert_eq!(script.abort_count(), 1);
        assert!(!session.desired_active());
        assert!(!session.is_listening());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_retries_after_backoff() {
        let script = HostScript::new();
        let mut session = host_session(&script, StaticPermissions::granted(), fast_policy(3));
        session.request_start("tr-TR").await.unwrap();

        script.fail("network");
        assert_eq!(
            session.poll_events(),
            vec![
                SessionEvent::Error(RecognitionErrorKind::Network),
                SessionEvent::UtteranceEnded(None),
            ]
        );
        assert_eq!(script.begin_count(), 1);
        assert!(session.has_pending_restart());

        let _ = timeout(Duration::from_millis(50), session.next_event()).await;

        assert_eq!(script.begin_count(), 2);
        assert_eq!(session.engine_state(), RecognitionState::Listening);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_scheduled_retry() {
        let script = HostScript::new();
        let mut session = host_session(&script, StaticPermissions::granted(), fast_policy(3));
        session.request_start("tr-TR").await.unwrap();

        script.fail("audio-capture");
        session.poll_events();
        assert!(session.has_pending_restart());

        session.request_stop();
        let _ = timeout(Duration::from_secs(1), session.next_event()).await;

        assert_eq!(script.begin_count(), 1);
        assert!(!session.has_pending_restart());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_bounded_retries() {
        let script = HostScript::new();
        let mut session = host_session(&script, StaticPermissions::granted(), fast_policy(2));
        session.request_start("tr-TR").await.unwrap();

        let mut failed = None;
        for _ in 0..3 {
            assert!(script.fail("network"));
            for event in session.poll_events() {
                if let SessionEvent::Failed(kind) = event {
                    failed = Some(kind);
                }
            }
            let _ = timeout(Duration::from_millis(100), session.next_event()).await;
        }

        assert_eq!(failed, Some(RecognitionErrorKind::Network));
        assert_eq!(script.begin_count(), 3);
        assert!(!session.desired_active());
        assert_eq!(
            session.engine_state(),
            RecognitionState::Error(RecognitionErrorKind::Network)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transcript_resets_failure_count() {
        let script = HostScript::new();
        let mut session = host_session(&script, StaticPermissions::granted(), fast_policy(1));
        session.request_start("tr-TR").await.unwrap();

        script.fail("network");
        session.poll_events();
        let _ = timeout(Duration::from_millis(50), session.next_event()).await;
        assert_eq!(session.consecutive_failures(), 1);

        script.murmur("ka");
        session.poll_events();
        assert_eq!(session.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_terminal_error_keeps_queued_transcripts() {
        let script = HostScript::new();
        let mut session = host_session(&script, StaticPermissions::granted(), RetryPolicy::default());
        session.request_start("tr-TR").await.unwrap();

        script.murmur("ka");
        script.fail("not-allowed");

        assert_eq!(
            session.poll_events(),
            vec![
                SessionEvent::Partial("ka".into()),
                SessionEvent::Failed(RecognitionErrorKind::PermissionDenied),
            ]
        );
    }

    #[tokio::test]
    async fn test_permission_error_is_terminal() {
        let script = HostScript::new();
        let mut session = host_session(&script, StaticPermissions::granted(), RetryPolicy::default());
        session.request_start("tr-TR").await.unwrap();

        script.fail("not-allowed");

        assert_eq!(
            session.poll_events(),
            vec![SessionEvent::Failed(RecognitionErrorKind::PermissionDenied)]
        );
        assert_eq!(session.engine_state(), RecognitionState::PermissionDenied);
        assert!(!session.desired_active());
        assert_eq!(script.begin_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_releases_backend() {
        let script = HostScript::new();
        let mut session = host_session(&script, StaticPermissions::granted(), RetryPolicy::default());
        session.request_start("tr-TR").await.unwrap();

        session.shutdown();

        assert!(!script.is_listening());
        assert_eq!(session.request_start("tr-TR").await, Err(StartError::Destroyed));
        assert_eq!(session.next_event().await, None);
    }
}
