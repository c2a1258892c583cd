//! Native device recognizer backend.
//!
//! Device recognizers report numbered error codes and deliver result lists
//! ordered best-first. A run ends either with `EndOfSession` or with an
//! error; no end signal follows an error, so the listener synthesizes one.

use practice_types::RecognitionErrorKind;
use tracing::{debug, info};

use super::{
    BackendKind, EventSender, RecognitionBackend, RecognitionEvent, RunId, StartError, TaggedEvent,
};

pub const ERROR_NETWORK_TIMEOUT: i32 = 1;
pub const ERROR_NETWORK: i32 = 2;
pub const ERROR_AUDIO: i32 = 3;
pub const ERROR_SERVER: i32 = 4;
pub const ERROR_CLIENT: i32 = 5;
pub const ERROR_SPEECH_TIMEOUT: i32 = 6;
pub const ERROR_NO_MATCH: i32 = 7;
pub const ERROR_RECOGNIZER_BUSY: i32 = 8;
pub const ERROR_INSUFFICIENT_PERMISSIONS: i32 = 9;

/// Raw signals produced by a device recognizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSignal {
    ReadyForSpeech,
    PartialResults(Vec<String>),
    Results(Vec<String>),
    Error(i32),
    EndOfSession,
}

/// Map a device error code to the shared taxonomy. `None` is benign.
pub fn classify_device_error(code: i32) -> Option<RecognitionErrorKind> {
    match code {
        ERROR_NETWORK_TIMEOUT | ERROR_NETWORK | ERROR_SERVER => Some(RecognitionErrorKind::Network),
        ERROR_AUDIO | ERROR_RECOGNIZER_BUSY => Some(RecognitionErrorKind::Device),
        ERROR_INSUFFICIENT_PERMISSIONS => Some(RecognitionErrorKind::PermissionDenied),
        ERROR_SPEECH_TIMEOUT | ERROR_NO_MATCH => None,
        _ => Some(RecognitionErrorKind::Unknown),
    }
}

fn best(results: Vec<String>) -> Option<String> {
    results
        .into_iter()
        .map(|r| r.trim().to_string())
        .find(|r| !r.is_empty())
}

/// Listener handed to the device recognizer for one run.
#[derive(Clone)]
pub struct DeviceListener {
    run: RunId,
    tx: EventSender,
}

impl DeviceListener {
    fn new(run: RunId, tx: EventSender) -> Self {
        Self { run, tx }
    }

    pub fn run(&self) -> RunId {
        self.run
    }

    fn send(&self, event: RecognitionEvent) {
        let _ = self.tx.send(TaggedEvent {
            run: self.run,
            event,
        });
    }

    /// Translate and forward one device signal.
    pub fn deliver(&self, signal: DeviceSignal) {
        match signal {
            DeviceSignal::ReadyForSpeech => debug!("Device recognizer run {} ready", self.run),
            DeviceSignal::PartialResults(results) => {
                if let Some(text) = best(results) {
                    self.send(RecognitionEvent::Partial(text));
                }
            }
            DeviceSignal::Results(results) => {
                if let Some(text) = best(results) {
                    self.send(RecognitionEvent::Final(text));
                }
            }
            DeviceSignal::Error(code) => {
                match classify_device_error(code) {
                    Some(kind) => self.send(RecognitionEvent::Error(kind)),
                    None => debug!("Device recognizer reported benign code {}", code),
                }
                self.send(RecognitionEvent::End);
            }
            DeviceSignal::EndOfSession => self.send(RecognitionEvent::End),
        }
    }
}

/// Capability exposed by a native device speech recognizer.
pub trait DeviceSpeechApi: Send {
    fn is_available(&self) -> bool;

    fn has_record_permission(&self) -> bool;

    fn start_listening(&mut self, locale: &str, listener: DeviceListener) -> anyhow::Result<()>;

    /// Stop gracefully: pending results are still delivered.
    fn stop_listening(&mut self);

    /// Free the native recognizer.
    fn release(&mut self);
}

pub struct DeviceBackend {
    api: Box<dyn DeviceSpeechApi>,
    tx: EventSender,
    run: RunId,
    running: bool,
    destroyed: bool,
}

impl DeviceBackend {
    pub fn new(api: Box<dyn DeviceSpeechApi>, tx: EventSender) -> Self {
        Self {
            api,
            tx,
            run: 0,
            running: false,
            destroyed: false,
        }
    }
}

impl RecognitionBackend for DeviceBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Device
    }

    fn start(&mut self, locale: &str) -> Result<RunId, StartError> {
        if self.destroyed {
            return Err(StartError::Destroyed);
        }
        if !self.api.is_available() {
            return Err(StartError::Unavailable);
        }
        if !self.api.has_record_permission() {
            return Err(StartError::PermissionDenied);
        }
        if self.running {
            self.stop();
        }

        self.run += 1;
        let listener = DeviceListener::new(self.run, self.tx.clone());
        self.api
            .start_listening(locale, listener)
            .map_err(|e| StartError::Platform(e.to_string()))?;

        self.running = true;
        debug!("Device recognizer run {} started ({})", self.run, locale);
        Ok(self.run)
    }

    fn stop(&mut self) {
        if self.running {
            self.api.stop_listening();
            self.running = false;
            debug!("Device recognizer run {} stopped", self.run);
        }
    }

    fn destroy(&mut self) {
        if !self.destroyed {
            self.stop();
            self.api.release();
            self.destroyed = true;
            info!("Device recognition backend released");
        }
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

impl Drop for DeviceBackend {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::super::scripted::DeviceScript;
    use super::*;
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::UnboundedReceiver<TaggedEvent>) -> Vec<RecognitionEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).map(|e| e.event).collect()
    }

    #[test]
    fn test_classify_device_errors() {
        assert_eq!(classify_device_error(2), Some(RecognitionErrorKind::Network));
        assert_eq!(classify_device_error(3), Some(RecognitionErrorKind::Device));
        assert_eq!(classify_device_error(9), Some(RecognitionErrorKind::PermissionDenied));
        assert_eq!(classify_device_error(7), None);
        assert_eq!(classify_device_error(42), Some(RecognitionErrorKind::Unknown));
    }

    #[test]
    fn test_results_use_best_candidate() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let script = DeviceScript::new();
        let mut backend = DeviceBackend::new(Box::new(script.api()), tx);
        backend.start("tr-TR").unwrap();

        script.emit(DeviceSignal::ReadyForSpeech);
        script.emit(DeviceSignal::PartialResults(vec!["ka".into(), "ca".into()]));
        script.emit(DeviceSignal::Results(vec!["".into(), "kalem".into()]));
        script.emit(DeviceSignal::EndOfSession);

        assert_eq!(
            drain(&mut rx),
            vec![
                RecognitionEvent::Partial("ka".into()),
                RecognitionEvent::Final("kalem".into()),
                RecognitionEvent::End,
            ]
        );
    }

    #[test]
    fn test_error_synthesizes_end() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let script = DeviceScript::new();
        let mut backend = DeviceBackend::new(Box::new(script.api()), tx);
        backend.start("tr-TR").unwrap();

        script.emit(DeviceSignal::Error(ERROR_NETWORK));
        assert_eq!(
            drain(&mut rx),
            vec![
                RecognitionEvent::Error(RecognitionErrorKind::Network),
                RecognitionEvent::End,
            ]
        );

        backend.start("tr-TR").unwrap();
        script.emit(DeviceSignal::Error(ERROR_NO_MATCH));
        assert_eq!(drain(&mut rx), vec![RecognitionEvent::End]);
    }

    #[test]
    fn test_missing_permission_fails_synchronously() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let script = DeviceScript::new();
        script.set_record_permission(false);
        let mut backend = DeviceBackend::new(Box::new(script.api()), tx);

        assert_eq!(backend.start("tr-TR"), Err(StartError::PermissionDenied));
        assert_eq!(script.start_count(), 0);
    }

    #[test]
    fn test_destroy_releases_once() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let script = DeviceScript::new();
        let mut backend = DeviceBackend::new(Box::new(script.api()), tx);
        backend.start("tr-TR").unwrap();

        backend.destroy();
        drop(backend);

        assert_eq!(script.stop_count(), 1);
        assert!(script.is_released());
    }
}
