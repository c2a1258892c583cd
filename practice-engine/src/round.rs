//! "Speak past the gate" round.
//!
//! [`InteractiveRoundMachine`] is pure and advanced by explicit ticks, so a
//! round can be replayed headlessly. [`RoundRunner`] drives it from a
//! speech session and a tokio interval.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use practice_types::{
    AttemptRecord, GatePhase, MachinePhase, RecognitionErrorKind, RoundState, ScoreResult,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::collaborators::{AttemptRecorder, NullCollaborators};
use crate::config::{EngineConfig, RoundConfig};
use crate::finalizer::{DebouncedFinalizer, Finalized};
use crate::matching::SimilarityScorer;
use crate::recognition::StartError;
use crate::session::{SessionEvent, SpeechSession};
use crate::timing::sleep_until_opt;

pub const DEFAULT_WORDS: &[&str] = &[
    "elma", "kalem", "araba", "kedi", "top", "arı", "balık", "çiçek", "güneş", "kuş",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoundError {
    #[error("word list is empty")]
    NoWords,
    #[error("speech session failed: {0}")]
    SessionFailed(RecognitionErrorKind),
    #[error(transparent)]
    Start(#[from] StartError),
}

/// Supplies round targets.
pub trait WordSource: Send {
    /// Next target, ideally different from `previous`.
    fn next_word(&mut self, previous: Option<&str>) -> String;
}

/// Random targets that never repeat the previous one when there is a choice.
pub struct RandomWords {
    words: Vec<String>,
    rng: StdRng,
}

impl RandomWords {
    pub fn new<I, S>(words: I) -> Result<Self, RoundError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_rng(words, StdRng::from_entropy())
    }

    /// Deterministic order for replays and tests.
    pub fn seeded<I, S>(words: I, seed: u64) -> Result<Self, RoundError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_rng(words, StdRng::seed_from_u64(seed))
    }

    fn with_rng<I, S>(words: I, rng: StdRng) -> Result<Self, RoundError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let words: Vec<String> = words.into_iter().map(Into::into).collect();
        if words.is_empty() {
            return Err(RoundError::NoWords);
        }
        Ok(Self { words, rng })
    }
}

impl WordSource for RandomWords {
    fn next_word(&mut self, previous: Option<&str>) -> String {
        let candidates: Vec<&String> = self
            .words
            .iter()
            .filter(|w| Some(w.as_str()) != previous)
            .collect();

        match candidates.choose(&mut self.rng) {
            Some(word) => (*word).clone(),
            None => self.words[0].clone(),
        }
    }
}

/// Fixed rotation through a word list.
pub struct WordCycle {
    words: Vec<String>,
    next: usize,
}

impl WordCycle {
    pub fn new<I, S>(words: I) -> Result<Self, RoundError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let words: Vec<String> = words.into_iter().map(Into::into).collect();
        if words.is_empty() {
            return Err(RoundError::NoWords);
        }
        Ok(Self { words, next: 0 })
    }
}

impl WordSource for WordCycle {
    fn next_word(&mut self, _previous: Option<&str>) -> String {
        let word = self.words[self.next % self.words.len()].clone();
        self.next = (self.next + 1) % self.words.len();
        word
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoundEvent {
    Started { target: String },
    GateOpening { target: String, heard: String, result: ScoreResult },
    Rejected { target: String, heard: String, result: ScoreResult },
    Passed { score: u32, next_target: String },
    BounceStarted { distance: f32 },
    BounceEnded { distance: f32 },
    Stopped(RoundState),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchOutcome {
    /// Correct: the gate is opening.
    Accepted(ScoreResult),
    Rejected(ScoreResult),
    /// Not accepting matches right now (idle, bouncing, or gate already open).
    Ignored,
}

pub struct InteractiveRoundMachine {
    config: RoundConfig,
    scorer: SimilarityScorer,
    words: Box<dyn WordSource>,
    state: RoundState,
    bounce_remaining: u32,
    events: Option<mpsc::UnboundedSender<RoundEvent>>,
}

impl InteractiveRoundMachine {
    pub fn new(config: RoundConfig, scorer: SimilarityScorer, words: Box<dyn WordSource>) -> Self {
        let state = RoundState {
            target_word: String::new(),
            wall_distance: config.start_distance.max(0.0),
            gate_phase: GatePhase::Closed,
            machine_phase: MachinePhase::Idle,
            score: 0,
        };
        Self {
            config,
            scorer,
            words,
            state,
            bounce_remaining: 0,
            events: None,
        }
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<RoundEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn state(&self) -> &RoundState {
        &self.state
    }

    pub fn target(&self) -> &str {
        &self.state.target_word
    }

    pub fn bounce_remaining(&self) -> u32 {
        self.bounce_remaining
    }

    /// Pick the first target and start approaching. No-op unless idle.
    pub fn start(&mut self) -> Vec<RoundEvent> {
        let mut out = Vec::new();
        if self.state.machine_phase != MachinePhase::Idle {
            return out;
        }

        let previous = (!self.state.target_word.is_empty()).then(|| self.state.target_word.clone());
        self.state.target_word = self.words.next_word(previous.as_deref());
        self.state.wall_distance = self.config.start_distance.max(0.0);
        self.state.gate_phase = GatePhase::Closed;
        self.state.machine_phase = MachinePhase::Running;
        self.bounce_remaining = 0;

        info!("Round started with '{}'", self.state.target_word);
        self.emit(
            &mut out,
            RoundEvent::Started {
                target: self.state.target_word.clone(),
            },
        );
        out
    }

    /// Advance the simulation by `ticks` fixed steps.
    pub fn tick(&mut self, ticks: u32) -> Vec<RoundEvent> {
        let mut out = Vec::new();
        for _ in 0..ticks {
            match self.state.machine_phase {
                MachinePhase::Idle => break,
                MachinePhase::Running => self.step_running(&mut out),
                MachinePhase::Bouncing => self.step_bouncing(&mut out),
            }
        }
        out
    }

    /// Offer a finalized utterance as a match attempt.
    pub fn submit(&mut self, heard: &str) -> MatchOutcome {
        if self.state.machine_phase != MachinePhase::Running
            || self.state.gate_phase != GatePhase::Closed
        {
            debug!(
                "Ignoring '{}' ({:?}, gate {:?})",
                heard, self.state.machine_phase, self.state.gate_phase
            );
            return MatchOutcome::Ignored;
        }

        let result = self.scorer.evaluate(&self.state.target_word, heard);
        let target = self.state.target_word.clone();
        let mut out = Vec::new();

        if result.is_successful {
            info!("Gate opening for '{}' (heard '{}')", target, heard);
            self.state.gate_phase = GatePhase::Opening;
            self.emit(
                &mut out,
                RoundEvent::GateOpening {
                    target,
                    heard: heard.to_string(),
                    result,
                },
            );
            MatchOutcome::Accepted(result)
        } else {
            debug!("'{}' does not match '{}' ({:.2})", heard, target, result.score);
            self.emit(
                &mut out,
                RoundEvent::Rejected {
                    target,
                    heard: heard.to_string(),
                    result,
                },
            );
            MatchOutcome::Rejected(result)
        }
    }

    /// Stop the round and hand back its final state.
    pub fn stop(&mut self) -> RoundState {
        if self.state.machine_phase != MachinePhase::Idle {
            info!("Round stopped with score {}", self.state.score);
            self.state.machine_phase = MachinePhase::Idle;
            self.bounce_remaining = 0;
            let mut out = Vec::new();
            self.emit(&mut out, RoundEvent::Stopped(self.state.clone()));
        }
        self.state.clone()
    }

    fn step_running(&mut self, out: &mut Vec<RoundEvent>) {
        self.state.wall_distance = (self.state.wall_distance - self.config.approach_speed).max(0.0);

        match self.state.gate_phase {
            GatePhase::Opening if self.state.wall_distance <= self.config.pass_threshold => {
                self.state.score += 1;
                let next = self.words.next_word(Some(&self.state.target_word));
                info!(
                    "Passed the gate for '{}', score {}",
                    self.state.target_word, self.state.score
                );
                self.state.target_word = next.clone();
                self.state.wall_distance = self.config.start_distance.max(0.0);
                self.state.gate_phase = GatePhase::Closed;
                self.emit(
                    out,
                    RoundEvent::Passed {
                        score: self.state.score,
                        next_target: next,
                    },
                );
            }
            GatePhase::Closed if self.state.wall_distance <= self.config.near_threshold => {
                self.state.machine_phase = MachinePhase::Bouncing;
                self.bounce_remaining = self.config.bounce_ticks.max(1);
                debug!("Bounced off the gate at {:.1}", self.state.wall_distance);
                self.emit(
                    out,
                    RoundEvent::BounceStarted {
                        distance: self.state.wall_distance,
                    },
                );
            }
            _ => {}
        }
    }

    fn step_bouncing(&mut self, out: &mut Vec<RoundEvent>) {
        let gap = self.config.rebound_distance - self.state.wall_distance;
        self.state.wall_distance = (self.state.wall_distance + gap * self.config.rebound_rate)
            .clamp(0.0, self.config.start_distance.max(0.0));

        self.bounce_remaining = self.bounce_remaining.saturating_sub(1);
        if self.bounce_remaining == 0 {
            self.state.machine_phase = MachinePhase::Running;
            self.emit(
                out,
                RoundEvent::BounceEnded {
                    distance: self.state.wall_distance,
                },
            );
        }
    }

    fn emit(&self, out: &mut Vec<RoundEvent>, event: RoundEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event.clone());
        }
        out.push(event);
    }
}

#[derive(Debug, Clone)]
pub struct RoundOptions {
    pub locale: String,
    pub debounce: Duration,
    pub tick_interval: Duration,
}

impl RoundOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            locale: config.speech.locale.clone(),
            debounce: config.speech.debounce(),
            tick_interval: config.round.tick_interval(),
        }
    }
}

/// Runs a round in real time: ticks on an interval and feeds finalized
/// utterances from the speech session into the machine.
pub struct RoundRunner {
    machine: InteractiveRoundMachine,
    session: SpeechSession,
    finalizer: DebouncedFinalizer,
    options: RoundOptions,
    recorder: Arc<dyn AttemptRecorder>,
}

impl RoundRunner {
    pub fn new(machine: InteractiveRoundMachine, session: SpeechSession, options: RoundOptions) -> Self {
        Self {
            machine,
            session,
            finalizer: DebouncedFinalizer::new(options.debounce),
            options,
            recorder: Arc::new(NullCollaborators),
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn AttemptRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn machine(&self) -> &InteractiveRoundMachine {
        &self.machine
    }

    pub fn session(&self) -> &SpeechSession {
        &self.session
    }

    /// Run until `shutdown` completes, then stop and return the final state.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<RoundState, RoundError>
    where
        F: Future<Output = ()>,
    {
        self.machine.start();
        self.finalizer.set_target(self.machine.target());
        self.session.request_start(&self.options.locale).await?;

        let mut ticker = tokio::time::interval(self.options.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            let deadline = self.finalizer.deadline();
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    self.machine.tick(1);
                    self.sync_target();
                }
                event = self.session.next_event() => match event {
                    Some(SessionEvent::Failed(kind)) => {
                        warn!("Speech session failed during round: {}", kind);
                        self.stop();
                        return Err(RoundError::SessionFailed(kind));
                    }
                    Some(event) => self.on_session_event(event),
                    None => break,
                },
                _ = sleep_until_opt(deadline) => {
                    if let Some(finalized) = self.finalizer.poll(Instant::now()) {
                        self.submit(finalized);
                    }
                }
            }
        }

        Ok(self.stop())
    }

    /// Stop listening, drop pending finalization and stop the machine.
    pub fn stop(&mut self) -> RoundState {
        self.session.request_stop();
        self.finalizer.cancel();
        self.machine.stop()
    }

    fn sync_target(&mut self) {
        if self.finalizer.target() != self.machine.target() {
            self.finalizer.set_target(self.machine.target());
        }
    }

    fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Partial(text) | SessionEvent::Final(text) => {
                self.finalizer.on_partial(&text, Instant::now());
            }
            SessionEvent::UtteranceEnded(last) => {
                if let Some(finalized) = self.finalizer.on_session_end(last.as_deref()) {
                    self.submit(finalized);
                }
            }
            SessionEvent::Error(kind) => debug!("Transient recognition error during round: {}", kind),
            SessionEvent::Failed(_) => {}
        }
    }

    fn submit(&mut self, finalized: Finalized) {
        if finalized.target != self.machine.target() {
            debug!(
                "Discarding '{}' heard for previous target '{}'",
                finalized.text, finalized.target
            );
            return;
        }

        let result = match self.machine.submit(&finalized.text) {
            MatchOutcome::Accepted(result) | MatchOutcome::Rejected(result) => result,
            MatchOutcome::Ignored => return,
        };
        self.recorder
            .record_attempt(AttemptRecord::new(&finalized.target, &finalized.text, result));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(words: &[&str]) -> InteractiveRoundMachine {
        InteractiveRoundMachine::new(
            RoundConfig::default(),
            SimilarityScorer::default(),
            Box::new(WordCycle::new(words.iter().copied()).unwrap()),
        )
    }

    #[test]
    fn test_idle_until_started() {
        let mut m = machine(&["elma"]);
        assert!(m.tick(10).is_empty());
        assert_eq!(m.state().machine_phase, MachinePhase::Idle);
        assert_eq!(m.submit("elma"), MatchOutcome::Ignored);
    }

    #[test]
    fn test_reaches_bounce_at_near_threshold() {
        let mut m = machine(&["elma"]);
        m.start();

        // 100 -> 10 at 0.5 per tick
        let events = m.tick(179);
        assert!(events.is_empty());
        assert_eq!(m.state().machine_phase, MachinePhase::Running);

        let events = m.tick(1);
        assert_eq!(events, vec![RoundEvent::BounceStarted { distance: 10.0 }]);
        assert_eq!(m.state().machine_phase, MachinePhase::Bouncing);
        assert_eq!(m.bounce_remaining(), 30);
    }

    #[test]
    fn test_bounce_restores_distance_toward_rebound() {
        let mut m = machine(&["elma"]);
        m.start();
        m.tick(180);
        assert_eq!(m.state().machine_phase, MachinePhase::Bouncing);

        m.tick(29);
        assert_eq!(m.state().machine_phase, MachinePhase::Bouncing);
        let events = m.tick(1);
        assert_eq!(m.state().machine_phase, MachinePhase::Running);
        assert!(matches!(events[..], [RoundEvent::BounceEnded { .. }]));

        let distance = m.state().wall_distance;
        assert!(distance > 10.0 && distance < 40.0, "distance {}", distance);
        // 40 - 30 * 0.85^30
        assert!((distance - 39.76).abs() < 0.05, "distance {}", distance);
    }

    #[test]
    fn test_distance_never_negative() {
        let config = RoundConfig {
            approach_speed: 7.0,
            near_threshold: 0.0,
            rebound_rate: 1.5,
            ..RoundConfig::default()
        };
        let mut m = InteractiveRoundMachine::new(
            config,
            SimilarityScorer::default(),
            Box::new(WordCycle::new(["kedi"]).unwrap()),
        );
        m.start();
        for _ in 0..500 {
            m.tick(1);
            assert!(m.state().wall_distance >= 0.0);
        }
    }

    #[test]
    fn test_match_opens_gate_once() {
        let mut m = machine(&["kalem", "kedi"]);
        m.start();
        m.tick(20);

        assert!(matches!(m.submit("kalem"), MatchOutcome::Accepted(_)));
        assert_eq!(m.state().gate_phase, GatePhase::Opening);

        // Already opening: no double scoring
        assert_eq!(m.submit("kalem"), MatchOutcome::Ignored);
        assert_eq!(m.state().score, 0);
    }

    #[test]
    fn test_wrong_word_is_rejected() {
        let mut m = machine(&["kalem"]);
        m.start();

        assert!(matches!(m.submit("masa"), MatchOutcome::Rejected(_)));
        assert_eq!(m.state().gate_phase, GatePhase::Closed);
    }

    #[test]
    fn test_open_gate_passes_and_resets_round() {
        let mut m = machine(&["kalem", "kedi"]);
        m.start();
        m.submit("kalem");

        // An open gate does not bounce: it runs through to zero
        let events = m.tick(200);
        assert!(events.contains(&RoundEvent::Passed {
            score: 1,
            next_target: "kedi".into()
        }));
        assert!(!events
            .iter()
            .any(|e| matches!(e, RoundEvent::BounceStarted { .. })));

        let state = m.state();
        assert_eq!(state.score, 1);
        assert_eq!(state.target_word, "kedi");
        assert_eq!(state.gate_phase, GatePhase::Closed);
        assert_eq!(state.machine_phase, MachinePhase::Running);
    }

    #[test]
    fn test_no_match_while_bouncing() {
        let mut m = machine(&["kalem"]);
        m.start();
        m.tick(180);

        assert_eq!(m.submit("kalem"), MatchOutcome::Ignored);
        assert_eq!(m.state().gate_phase, GatePhase::Closed);
    }

    #[test]
    fn test_stop_returns_final_state() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut m = machine(&["top"]).with_events(tx);
        m.start();
        m.tick(3);

        let state = m.stop();
        assert_eq!(state.machine_phase, MachinePhase::Idle);
        assert_eq!(state.wall_distance, 98.5);
        assert!(m.tick(5).is_empty());

        assert_eq!(rx.try_recv().unwrap(), RoundEvent::Started { target: "top".into() });
        assert!(matches!(rx.try_recv().unwrap(), RoundEvent::Stopped(_)));
    }

    #[test]
    fn test_random_words_never_repeat() {
        let mut words = RandomWords::seeded(["elma", "kedi"], 7).unwrap();
        let mut previous = words.next_word(None);
        for _ in 0..50 {
            let next = words.next_word(Some(&previous));
            assert_ne!(next, previous);
            previous = next;
        }

        let mut single = RandomWords::seeded(["top"], 1).unwrap();
        assert_eq!(single.next_word(Some("top")), "top");
        assert!(matches!(RandomWords::new(Vec::<String>::new()), Err(RoundError::NoWords)));
    }
}
