//! Data types shared between the practice engine, the CLI and any
//! presentation or persistence collaborator.
//!
//! Everything here is plain data: no behavior beyond small helpers, and
//! all of it serializes to JSON for handing outward.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure taxonomy reported by recognition backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionErrorKind {
    /// Microphone or speech permission was refused.
    PermissionDenied,
    /// No recognition capability on this host.
    ServiceUnavailable,
    /// Transient, backend-dependent network failure.
    Network,
    /// Microphone unavailable or busy.
    Device,
    Unknown,
}

impl RecognitionErrorKind {
    /// Terminal errors end the current session: no auto-restart.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::PermissionDenied | Self::ServiceUnavailable)
    }

    /// Actionable message suitable for showing to the user.
    pub fn user_message(self) -> &'static str {
        match self {
            Self::PermissionDenied => {
                "Microphone access is turned off. Ask a grown-up to allow it in settings."
            }
            Self::ServiceUnavailable => "Speech recognition is not available on this device.",
            Self::Network => "We could not reach the speech service. Check the connection.",
            Self::Device => "The microphone is busy or missing.",
            Self::Unknown => "Something went wrong while listening.",
        }
    }
}

impl fmt::Display for RecognitionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PermissionDenied => "permission denied",
            Self::ServiceUnavailable => "service unavailable",
            Self::Network => "network error",
            Self::Device => "device error",
            Self::Unknown => "unknown error",
        };
        f.write_str(name)
    }
}

/// What the recognition engine is currently doing. Exactly one value at a
/// time, owned by the speech session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "kind", rename_all = "snake_case")]
pub enum RecognitionState {
    #[default]
    Idle,
    RequestingPermission,
    Listening,
    Error(RecognitionErrorKind),
    PermissionDenied,
    Unavailable,
}

impl RecognitionState {
    /// States after which the session must not restart on its own.
    pub fn blocks_restart(self) -> bool {
        matches!(self, Self::PermissionDenied | Self::Unavailable)
    }
}

/// One unit of recognized speech, partial or final.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    pub text: String,
    pub is_final: bool,
    pub received_at: DateTime<Utc>,
}

impl Utterance {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            received_at: Utc::now(),
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            received_at: Utc::now(),
        }
    }
}

/// Outcome of comparing a heard utterance to a target word.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    /// Similarity in `[0, 1]`.
    pub score: f64,
    pub is_successful: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    Success,
    Fail,
}

/// One target word of a drill session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PracticeItem {
    pub target: String,
    pub attempts: Vec<ScoreResult>,
    pub status: ItemStatus,
}

impl PracticeItem {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            attempts: Vec::new(),
            status: ItemStatus::Pending,
        }
    }

    pub fn is_decided(&self) -> bool {
        self.status != ItemStatus::Pending
    }

    pub fn best_score(&self) -> Option<f64> {
        self.attempts.iter().map(|a| a.score).reduce(f64::max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePhase {
    #[default]
    Closed,
    Opening,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachinePhase {
    #[default]
    Idle,
    Running,
    Bouncing,
}

/// Snapshot of the interactive round, mutated once per simulation tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundState {
    pub target_word: String,
    pub wall_distance: f32,
    pub gate_phase: GatePhase,
    pub machine_phase: MachinePhase,
    pub score: u32,
}

/// Payload of the fire-and-forget "record attempt" call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub target: String,
    pub recognized: String,
    pub score: f64,
    pub is_successful: bool,
    pub recorded_at: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn new(target: &str, recognized: &str, result: ScoreResult) -> Self {
        Self {
            target: target.to_string(),
            recognized: recognized.to_string(),
            score: result.score,
            is_successful: result.is_successful,
            recorded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_error_kinds() {
        assert!(RecognitionErrorKind::PermissionDenied.is_terminal());
        assert!(RecognitionErrorKind::ServiceUnavailable.is_terminal());
        assert!(!RecognitionErrorKind::Network.is_terminal());
        assert!(!RecognitionErrorKind::Device.is_terminal());
        assert!(!RecognitionErrorKind::Unknown.is_terminal());
    }

    #[test]
    fn test_recognition_state_json_shape() {
        let json = serde_json::to_string(&RecognitionState::Error(RecognitionErrorKind::Network))
            .unwrap();
        assert_eq!(json, r#"{"state":"error","kind":"network"}"#);

        let json = serde_json::to_string(&RecognitionState::Listening).unwrap();
        assert_eq!(json, r#"{"state":"listening"}"#);
    }

    #[test]
    fn test_practice_item_best_score() {
        let mut item = PracticeItem::new("kalem");
        assert_eq!(item.best_score(), None);
        assert!(!item.is_decided());

        item.attempts.push(ScoreResult { score: 0.4, is_successful: false });
        item.attempts.push(ScoreResult { score: 0.8, is_successful: true });
        item.status = ItemStatus::Success;

        assert_eq!(item.best_score(), Some(0.8));
        assert!(item.is_decided());
    }

    #[test]
    fn test_restart_blocking_states() {
        assert!(RecognitionState::PermissionDenied.blocks_restart());
        assert!(RecognitionState::Unavailable.blocks_restart());
        assert!(!RecognitionState::Listening.blocks_restart());
        assert!(!RecognitionState::Error(RecognitionErrorKind::Network).blocks_restart());
    }
}
