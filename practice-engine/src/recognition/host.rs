//! Host recognizer backend.
//!
//! The host recognizer (browser-style continuous=false recognition) emits
//! cumulative transcripts, string error codes, and ends itself after every
//! utterance. The speech session restarts it while listening is desired.

use practice_types::RecognitionErrorKind;
use tracing::{debug, info};

use super::{
    BackendKind, EventSender, RecognitionBackend, RecognitionEvent, RunId, StartError, TaggedEvent,
};

/// Raw signals produced by a host recognizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostSignal {
    Result { transcript: String, is_final: bool },
    Error(String),
    End,
}

/// Map a host error code to the shared taxonomy.
///
/// `None` means the code is benign: the utterance simply ends.
pub fn classify_host_error(code: &str) -> Option<RecognitionErrorKind> {
    match code {
        "not-allowed" | "service-not-allowed" => Some(RecognitionErrorKind::PermissionDenied),
        "language-not-supported" | "not-supported" => {
            Some(RecognitionErrorKind::ServiceUnavailable)
        }
        "network" => Some(RecognitionErrorKind::Network),
        "audio-capture" => Some(RecognitionErrorKind::Device),
        "no-speech" | "aborted" => None,
        _ => Some(RecognitionErrorKind::Unknown),
    }
}

/// Listener handed to the host recognizer for one run.
#[derive(Clone)]
pub struct HostListener {
    run: RunId,
    tx: EventSender,
}

impl HostListener {
    fn new(run: RunId, tx: EventSender) -> Self {
        Self { run, tx }
    }

    pub fn run(&self) -> RunId {
        self.run
    }

    /// Translate and forward one host signal.
    pub fn deliver(&self, signal: HostSignal) {
        let event = match signal {
            HostSignal::Result { transcript, is_final } => {
                let text = transcript.trim();
                if text.is_empty() {
                    return;
                }
                if is_final {
                    RecognitionEvent::Final(text.to_string())
                } else {
                    RecognitionEvent::Partial(text.to_string())
                }
            }
            HostSignal::Error(code) => match classify_host_error(&code) {
                Some(kind) => RecognitionEvent::Error(kind),
                None => {
                    debug!("Host recognizer reported benign '{}'", code);
                    return;
                }
            },
            HostSignal::End => RecognitionEvent::End,
        };

        // Receiver gone means the session was torn down
        let _ = self.tx.send(TaggedEvent {
            run: self.run,
            event,
        });
    }
}

/// Capability exposed by a host platform's speech recognizer.
pub trait HostSpeechApi: Send {
    fn is_supported(&self) -> bool;

    /// Begin recognizing. A synchronous failure returns a host error code
    /// (for example `not-allowed`).
    fn begin(&mut self, locale: &str, listener: HostListener) -> Result<(), String>;

    /// Abort the current recognition, if any.
    fn abort(&mut self);
}

pub struct HostBackend {
    api: Box<dyn HostSpeechApi>,
    tx: EventSender,
    run: RunId,
    running: bool,
    destroyed: bool,
}

impl HostBackend {
    pub fn new(api: Box<dyn HostSpeechApi>, tx: EventSender) -> Self {
        Self {
            api,
            tx,
            run: 0,
            running: false,
            destroyed: false,
        }
    }
}

impl RecognitionBackend for HostBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Host
    }

    fn start(&mut self, locale: &str) -> Result<RunId, StartError> {
        if self.destroyed {
            return Err(StartError::Destroyed);
        }
        if !self.api.is_supported() {
            return Err(StartError::Unavailable);
        }
        if self.running {
            self.stop();
        }

        self.run += 1;
        let listener = HostListener::new(self.run, self.tx.clone());

        self.api.begin(locale, listener).map_err(|code| match classify_host_error(&code) {
            Some(RecognitionErrorKind::PermissionDenied) => StartError::PermissionDenied,
            Some(RecognitionErrorKind::ServiceUnavailable) => StartError::Unavailable,
            _ => StartError::Platform(code),
        })?;

        self.running = true;
        debug!("Host recognizer run {} started ({})", self.run, locale);
        Ok(self.run)
    }

    fn stop(&mut self) {
        if self.running {
            self.api.abort();
            self.running = false;
            debug!("Host recognizer run {} aborted", self.run);
        }
    }

    fn destroy(&mut self) {
        if !self.destroyed {
            self.stop();
            self.destroyed = true;
            info!("Host recognition backend destroyed");
        }
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

impl Drop for HostBackend {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::super::scripted::HostScript;
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_classify_host_errors() {
        assert_eq!(
            classify_host_error("not-allowed"),
            Some(RecognitionErrorKind::PermissionDenied)
        );
        assert_eq!(classify_host_error("network"), Some(RecognitionErrorKind::Network));
        assert_eq!(classify_host_error("audio-capture"), Some(RecognitionErrorKind::Device));
        assert_eq!(classify_host_error("no-speech"), None);
        assert_eq!(classify_host_error("weird"), Some(RecognitionErrorKind::Unknown));
    }

    #[test]
    fn test_translates_signals() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let script = HostScript::new();
        let mut backend = HostBackend::new(Box::new(script.api()), tx);

        let run = backend.start("tr-TR").unwrap();
        assert!(script.emit(HostSignal::Result {
            transcript: " ka ".into(),
            is_final: false
        }));
        script.emit(HostSignal::Result {
            transcript: "   ".into(),
            is_final: false,
        });
        script.emit(HostSignal::Error("no-speech".into()));
        script.emit(HostSignal::Error("network".into()));
        script.emit(HostSignal::Result {
            transcript: "kalem".into(),
            is_final: true,
        });
        script.emit(HostSignal::End);

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(events.iter().all(|e| e.run == run));
        let events: Vec<_> = events.into_iter().map(|e| e.event).collect();
        assert_eq!(
            events,
            vec![
                RecognitionEvent::Partial("ka".into()),
                RecognitionEvent::Error(RecognitionErrorKind::Network),
                RecognitionEvent::Final("kalem".into()),
                RecognitionEvent::End,
            ]
        );
    }

    #[test]
    fn test_restart_stops_previous_run() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let script = HostScript::new();
        let mut backend = HostBackend::new(Box::new(script.api()), tx);

        let first = backend.start("tr-TR").unwrap();
        let second = backend.start("tr-TR").unwrap();

        assert!(second > first);
        assert_eq!(script.begin_count(), 2);
        assert_eq!(script.abort_count(), 1);
    }

    #[test]
    fn test_synchronous_start_failures() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut backend = HostBackend::new(Box::new(HostScript::unsupported().api()), tx);
        assert_eq!(backend.start("tr-TR"), Err(StartError::Unavailable));

        let (tx, _rx) = mpsc::unbounded_channel();
        let script = HostScript::new();
        script.fail_next_begin("not-allowed");
        let mut backend = HostBackend::new(Box::new(script.api()), tx);
        assert_eq!(backend.start("tr-TR"), Err(StartError::PermissionDenied));
        assert!(!backend.is_running());
    }

    #[test]
    fn test_destroy_blocks_start() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let script = HostScript::new();
        let mut backend = HostBackend::new(Box::new(script.api()), tx);

        backend.start("tr-TR").unwrap();
        backend.destroy();
        backend.destroy();

        assert!(!backend.is_running());
        assert_eq!(script.abort_count(), 1);
        assert_eq!(backend.start("tr-TR"), Err(StartError::Destroyed));
    }
}
