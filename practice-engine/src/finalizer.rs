use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// A completed spoken attempt, tagged with the target it was heard for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalized {
    pub target: String,
    pub text: String,
}

/// Collapses a stream of partial transcripts into one finalized utterance.
///
/// Each partial replaces the buffered candidate and pushes the deadline out
/// by one window. The caller owns the clock: it waits on [`deadline`] and
/// calls [`poll`] once it has passed.
///
/// [`deadline`]: DebouncedFinalizer::deadline
/// [`poll`]: DebouncedFinalizer::poll
#[derive(Debug)]
pub struct DebouncedFinalizer {
    window: Duration,
    target: String,
    buffered: Option<String>,
    deadline: Option<Instant>,
    last_finalized: Option<String>,
}

impl DebouncedFinalizer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            target: String::new(),
            buffered: None,
            deadline: None,
            last_finalized: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Switch to a new target. Forgets everything about the previous one.
    pub fn set_target(&mut self, target: &str) {
        if self.target != target {
            self.target = target.to_string();
            self.reset();
        }
    }

    pub fn buffered(&self) -> Option<&str> {
        self.buffered.as_deref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn on_partial(&mut self, text: &str, now: Instant) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.buffered = Some(text.to_string());
        self.deadline = Some(now + self.window);
    }

    /// Emit the buffered candidate if the window has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<Finalized> {
        match self.deadline {
            Some(at) if at <= now => {
                self.deadline = None;
                let text = self.buffered.take()?;
                self.emit(text)
            }
            _ => None,
        }
    }

    /// The recognizer ended the utterance: finalize right away, preferring
    /// the session's last known text over the buffer.
    pub fn on_session_end(&mut self, last_known: Option<&str>) -> Option<Finalized> {
        let buffered = self.buffered.take();
        self.deadline = None;

        let text = last_known
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .or(buffered)?;
        self.emit(text)
    }

    /// Drop the buffered candidate and its deadline.
    pub fn cancel(&mut self) {
        self.buffered = None;
        self.deadline = None;
    }

    /// Cancel and forget the last finalized text, so the same answer can be
    /// finalized again.
    pub fn reset(&mut self) {
        self.cancel();
        self.last_finalized = None;
    }

    fn emit(&mut self, text: String) -> Option<Finalized> {
        if text.is_empty() {
            return None;
        }
        if self.last_finalized.as_deref() == Some(text.as_str()) {
            debug!("Dropping repeated utterance '{}' for '{}'", text, self.target);
            return None;
        }

        debug!("Finalized '{}' for '{}'", text, self.target);
        self.last_finalized = Some(text.clone());
        Some(Finalized {
            target: self.target.clone(),
            text,
        })
    }
}
