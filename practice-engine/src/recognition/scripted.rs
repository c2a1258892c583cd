//! In-process recognizers driven by a cloneable script handle.
//!
//! Used by the CLI (stdin lines become speech) and by tests. The script
//! handle and the recognizer share state, so the handle can keep injecting
//! signals after the recognizer has been moved into a backend.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::device::{DeviceListener, DeviceSignal, DeviceSpeechApi};
use super::host::{HostListener, HostSignal, HostSpeechApi};

fn growing_prefixes(text: &str) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    (1..=words.len()).map(|n| words[..n].join(" ")).collect()
}

#[derive(Default)]
struct HostState {
    supported: bool,
    listener: Option<HostListener>,
    fail_next: Option<String>,
    locales: Vec<String>,
    begins: usize,
    aborts: usize,
}

/// Control handle for a [`ScriptedHost`].
#[derive(Clone)]
pub struct HostScript {
    state: Arc<Mutex<HostState>>,
}

impl HostScript {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HostState {
                supported: true,
                ..Default::default()
            })),
        }
    }

    pub fn unsupported() -> Self {
        let script = Self::new();
        script.lock().supported = false;
        script
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn api(&self) -> ScriptedHost {
        ScriptedHost {
            script: self.clone(),
        }
    }

    /// Make the next `begin()` fail with a host error code.
    pub fn fail_next_begin(&self, code: &str) {
        self.lock().fail_next = Some(code.to_string());
    }

    /// Deliver a signal to the current run. Returns false when not listening.
    pub fn emit(&self, signal: HostSignal) -> bool {
        let listener = self.lock().listener.clone();
        match listener {
            Some(listener) => {
                if signal == HostSignal::End {
                    self.lock().listener = None;
                }
                listener.deliver(signal);
                true
            }
            None => false,
        }
    }

    /// Interim results growing word by word, without ending the utterance.
    pub fn murmur(&self, text: &str) -> bool {
        let mut delivered = false;
        for prefix in growing_prefixes(text) {
            delivered |= self.emit(HostSignal::Result {
                transcript: prefix,
                is_final: false,
            });
        }
        delivered
    }

    /// A complete utterance: interim results, the final result, then the
    /// recognizer ends itself the way host recognizers do.
    pub fn speak(&self, text: &str) -> bool {
        if !self.murmur(text) {
            return false;
        }
        self.emit(HostSignal::Result {
            transcript: text.to_string(),
            is_final: true,
        });
        self.emit(HostSignal::End)
    }

    /// Report a host error code followed by the end of the run.
    pub fn fail(&self, code: &str) -> bool {
        self.emit(HostSignal::Error(code.to_string())) && self.emit(HostSignal::End)
    }

    pub fn is_listening(&self) -> bool {
        self.lock().listener.is_some()
    }

    pub fn begin_count(&self) -> usize {
        self.lock().begins
    }

    pub fn abort_count(&self) -> usize {
        self.lock().aborts
    }

    pub fn last_locale(&self) -> Option<String> {
        self.lock().locales.last().cloned()
    }
}

impl Default for HostScript {
    fn default() -> Self {
        Self::new()
    }
}

/// Host recognizer whose speech comes from a [`HostScript`].
pub struct ScriptedHost {
    script: HostScript,
}

impl HostSpeechApi for ScriptedHost {
    fn is_supported(&self) -> bool {
        self.script.lock().supported
    }

    fn begin(&mut self, locale: &str, listener: HostListener) -> Result<(), String> {
        let mut state = self.script.lock();
        if let Some(code) = state.fail_next.take() {
            return Err(code);
        }
        state.begins += 1;
        state.locales.push(locale.to_string());
        state.listener = Some(listener);
        Ok(())
    }

    fn abort(&mut self) {
        let listener = {
            let mut state = self.script.lock();
            state.aborts += 1;
            state.listener.take()
        };
        // Host recognizers still fire their end event after an abort
        if let Some(listener) = listener {
            listener.deliver(HostSignal::End);
        }
    }
}

#[derive(Default)]
struct DeviceState {
    available: bool,
    record_permission: bool,
    listener: Option<DeviceListener>,
    starts: usize,
    stops: usize,
    released: bool,
}

/// Control handle for a [`ScriptedDevice`].
#[derive(Clone)]
pub struct DeviceScript {
    state: Arc<Mutex<DeviceState>>,
}

impl DeviceScript {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                available: true,
                record_permission: true,
                ..Default::default()
            })),
        }
    }

    pub fn unavailable() -> Self {
        let script = Self::new();
        script.lock().available = false;
        script
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn api(&self) -> ScriptedDevice {
        ScriptedDevice {
            script: self.clone(),
        }
    }

    pub fn set_record_permission(&self, granted: bool) {
        self.lock().record_permission = granted;
    }

    /// Deliver a signal to the current run. Returns false when not listening.
    pub fn emit(&self, signal: DeviceSignal) -> bool {
        let listener = self.lock().listener.clone();
        match listener {
            Some(listener) => {
                if matches!(signal, DeviceSignal::EndOfSession | DeviceSignal::Error(_)) {
                    self.lock().listener = None;
                }
                listener.deliver(signal);
                true
            }
            None => false,
        }
    }

    /// A complete utterance: growing partial results, results, end.
    pub fn speak(&self, text: &str) -> bool {
        for prefix in growing_prefixes(text) {
            if !self.emit(DeviceSignal::PartialResults(vec![prefix])) {
                return false;
            }
        }
        self.emit(DeviceSignal::Results(vec![text.to_string()]));
        self.emit(DeviceSignal::EndOfSession)
    }

    pub fn is_listening(&self) -> bool {
        self.lock().listener.is_some()
    }

    pub fn start_count(&self) -> usize {
        self.lock().starts
    }

    pub fn stop_count(&self) -> usize {
        self.lock().stops
    }

    pub fn is_released(&self) -> bool {
        self.lock().released
    }
}

impl Default for DeviceScript {
    fn default() -> Self {
        Self::new()
    }
}

/// Device recognizer whose speech comes from a [`DeviceScript`].
pub struct ScriptedDevice {
    script: DeviceScript,
}

impl DeviceSpeechApi for ScriptedDevice {
    fn is_available(&self) -> bool {
        self.script.lock().available
    }

    fn has_record_permission(&self) -> bool {
        self.script.lock().record_permission
    }

    fn start_listening(&mut self, _locale: &str, listener: DeviceListener) -> anyhow::Result<()> {
        let mut state = self.script.lock();
        if state.released {
            anyhow::bail!("recognizer already released");
        }
        state.starts += 1;
        state.listener = Some(listener);
        Ok(())
    }

    fn stop_listening(&mut self) {
        let listener = {
            let mut state = self.script.lock();
            state.stops += 1;
            state.listener.take()
        };
        if let Some(listener) = listener {
            listener.deliver(DeviceSignal::EndOfSession);
        }
    }

    fn release(&mut self) {
        let mut state = self.script.lock();
        state.listener = None;
        state.released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growing_prefixes() {
        assert_eq!(growing_prefixes("bir iki üç"), vec!["bir", "bir iki", "bir iki üç"]);
        assert!(growing_prefixes("   ").is_empty());
    }

    #[test]
    fn test_emit_without_listener() {
        let script = HostScript::new();
        assert!(!script.speak("kalem"));
        assert!(!script.is_listening());

        let device = DeviceScript::new();
        assert!(!device.speak("kalem"));
    }
}
