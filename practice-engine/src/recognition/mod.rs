//! Recognition backend abstraction layer.
//!
//! Both platform recognizers (the host recognizer that ends after every
//! utterance, and the native device recognizer) sit behind the one
//! [`RecognitionBackend`] contract. Each backend translates its platform's
//! raw signals into [`RecognitionEvent`]s sent to a single listener channel
//! supplied at creation.

pub mod device;
pub mod host;
pub mod scripted;

#[cfg(feature = "vosk")]
pub mod vosk_device;

use anyhow::{anyhow, Result};
use practice_types::RecognitionErrorKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub use device::{DeviceBackend, DeviceListener, DeviceSignal, DeviceSpeechApi};
pub use host::{HostBackend, HostListener, HostSignal, HostSpeechApi};

/// Identifies one `start()` of a backend. Events from an earlier run are
/// stale once a newer run has begun or the session stopped.
pub type RunId = u64;

/// Unified event contract delivered by every backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    Partial(String),
    Final(String),
    Error(RecognitionErrorKind),
    End,
}

/// A [`RecognitionEvent`] stamped with the run that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedEvent {
    pub run: RunId,
    pub event: RecognitionEvent,
}

pub type EventSender = mpsc::UnboundedSender<TaggedEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TaggedEvent>;

/// Synchronous `start()` failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartError {
    #[error("microphone permission has not been granted")]
    PermissionDenied,
    #[error("speech recognition is not available on this host")]
    Unavailable,
    #[error("recognition backend has been destroyed")]
    Destroyed,
    #[error("platform recognizer failed to start: {0}")]
    Platform(String),
}

impl StartError {
    pub fn error_kind(&self) -> RecognitionErrorKind {
        match self {
            Self::PermissionDenied => RecognitionErrorKind::PermissionDenied,
            Self::Unavailable => RecognitionErrorKind::ServiceUnavailable,
            Self::Destroyed | Self::Platform(_) => RecognitionErrorKind::Unknown,
        }
    }
}

/// Which platform recognizer a backend wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Host,
    Device,
}

/// Contract shared by both platform backends.
///
/// A backend instance is owned by exactly one speech session. Starting a
/// backend that is already running stops the previous run first, so at
/// most one platform recognizer is ever active per instance.
pub trait RecognitionBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Begin a recognition run. Events of this run carry the returned id.
    fn start(&mut self, locale: &str) -> Result<RunId, StartError>;

    /// Stop the current run. No-op when not running.
    fn stop(&mut self);

    /// Release the platform recognizer. Later `start()` calls fail.
    fn destroy(&mut self);

    fn is_running(&self) -> bool;
}

/// Backend selection strategy, resolved once when the backend is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// Prefer the native device recognizer, fall back to the host one.
    #[default]
    Auto,
    Host,
    Device,
}

impl BackendPreference {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "host" | "web" => Some(Self::Host),
            "device" | "native" => Some(Self::Device),
            _ => None,
        }
    }
}

/// Platform recognizers available on this host.
#[derive(Default)]
pub struct PlatformCapabilities {
    pub host: Option<Box<dyn HostSpeechApi>>,
    pub device: Option<Box<dyn DeviceSpeechApi>>,
}

impl PlatformCapabilities {
    pub fn with_host(mut self, api: impl HostSpeechApi + 'static) -> Self {
        self.host = Some(Box::new(api));
        self
    }

    pub fn with_device(mut self, api: impl DeviceSpeechApi + 'static) -> Self {
        self.device = Some(Box::new(api));
        self
    }
}

/// Create the backend for `preference`. Called once per session.
pub fn create_backend(
    preference: BackendPreference,
    capabilities: PlatformCapabilities,
    tx: EventSender,
) -> Result<Box<dyn RecognitionBackend>> {
    let PlatformCapabilities { host, device } = capabilities;

    match preference {
        BackendPreference::Host => {
            let api = host.ok_or_else(|| anyhow!("host speech recognizer not present"))?;
            info!("Using host recognition backend");
            Ok(Box::new(HostBackend::new(api, tx)))
        }
        BackendPreference::Device => {
            let api = device.ok_or_else(|| anyhow!("device speech recognizer not present"))?;
            info!("Using device recognition backend");
            Ok(Box::new(DeviceBackend::new(api, tx)))
        }
        BackendPreference::Auto => create_backend_auto(host, device, tx),
    }
}

fn create_backend_auto(
    host: Option<Box<dyn HostSpeechApi>>,
    device: Option<Box<dyn DeviceSpeechApi>>,
    tx: EventSender,
) -> Result<Box<dyn RecognitionBackend>> {
    if let Some(api) = device {
        if api.is_available() {
            info!("Using device recognition backend (auto-detected)");
            return Ok(Box::new(DeviceBackend::new(api, tx)));
        }
        warn!("Device recognizer present but not available, trying host recognizer");
    }

    match host {
        Some(api) => {
            info!("Using host recognition backend (auto-detected)");
            Ok(Box::new(HostBackend::new(api, tx)))
        }
        None => Err(anyhow!("no speech recognizer available on this platform")),
    }
}

#[cfg(test)]
mod tests {
    use super::scripted::{DeviceScript, HostScript};
    use super::*;

    #[test]
    fn test_preference_from_str() {
        assert_eq!(BackendPreference::from_str("AUTO"), Some(BackendPreference::Auto));
        assert_eq!(BackendPreference::from_str("web"), Some(BackendPreference::Host));
        assert_eq!(BackendPreference::from_str("native"), Some(BackendPreference::Device));
        assert_eq!(BackendPreference::from_str("cloud"), None);
    }

    #[test]
    fn test_auto_prefers_device() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let caps = PlatformCapabilities::default()
            .with_host(HostScript::new().api())
            .with_device(DeviceScript::new().api());

        let backend = create_backend(BackendPreference::Auto, caps, tx).unwrap();
        assert_eq!(backend.kind(), BackendKind::Device);
    }

    #[test]
    fn test_auto_falls_back_to_host() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let caps = PlatformCapabilities::default()
            .with_host(HostScript::new().api())
            .with_device(DeviceScript::unavailable().api());

        let backend = create_backend(BackendPreference::Auto, caps, tx).unwrap();
        assert_eq!(backend.kind(), BackendKind::Host);
    }

    #[test]
    fn test_explicit_preference_requires_capability() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let caps = PlatformCapabilities::default().with_host(HostScript::new().api());

        assert!(create_backend(BackendPreference::Device, caps, tx).is_err());
    }

    #[test]
    fn test_no_capabilities() {
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(create_backend(BackendPreference::Auto, PlatformCapabilities::default(), tx).is_err());
    }

    #[test]
    fn test_start_error_kinds() {
        assert_eq!(
            StartError::PermissionDenied.error_kind(),
            RecognitionErrorKind::PermissionDenied
        );
        assert_eq!(
            StartError::Unavailable.error_kind(),
            RecognitionErrorKind::ServiceUnavailable
        );
        assert_eq!(
            StartError::Platform("busy".into()).error_kind(),
            RecognitionErrorKind::Unknown
        );
    }
}
