//! Drill mode: one target word at a time through a single speech session.

use std::sync::Arc;
use std::time::Duration;

use practice_types::{
    AttemptRecord, ItemStatus, PracticeItem, RecognitionErrorKind, ScoreResult, Utterance,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::collaborators::{AttemptRecorder, NullCollaborators, ProgressSink};
use crate::config::EngineConfig;
use crate::finalizer::{DebouncedFinalizer, Finalized};
use crate::matching::SimilarityScorer;
use crate::recognition::StartError;
use crate::session::{SessionEvent, SpeechSession};
use crate::timing::sleep_until_opt;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DrillError {
    #[error("no words to practice")]
    NoWords,
    #[error("the drill is already complete")]
    Completed,
    #[error("the current word has not failed")]
    NotFailed,
    #[error("the current word has not been decided yet")]
    NotDecided,
    #[error("the current word is decided, retry or advance first")]
    AwaitingCaller,
    #[error("not listening, retry the current word")]
    NotListening,
    #[error("speech session closed")]
    SessionClosed,
    #[error(transparent)]
    Start(#[from] StartError),
}

#[derive(Debug, Clone)]
pub struct DrillOptions {
    pub locale: String,
    pub debounce: Duration,
    pub success_threshold: f64,
}

impl DrillOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            locale: config.speech.locale.clone(),
            debounce: config.speech.debounce(),
            success_threshold: config.matching.success_threshold,
        }
    }
}

impl Default for DrillOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrillSummary {
    pub items: Vec<PracticeItem>,
    pub successes: usize,
    pub failures: usize,
    pub attempts: usize,
}

impl DrillSummary {
    fn from_items(items: &[PracticeItem]) -> Self {
        Self {
            items: items.to_vec(),
            successes: items.iter().filter(|i| i.status == ItemStatus::Success).count(),
            failures: items.iter().filter(|i| i.status == ItemStatus::Fail).count(),
            attempts: items.iter().map(|i| i.attempts.len()).sum(),
        }
    }
}

/// Outcome handed back by [`PracticeOrchestrator::next_decision`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Scored {
        index: usize,
        target: String,
        heard: String,
        result: ScoreResult,
    },
    /// The session gave up; the caller may `retry()` or `skip()`.
    SessionFailed(RecognitionErrorKind),
    Completed(DrillSummary),
}

/// Where `advance()` or `skip()` left the drill.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    Next { index: usize, target: String },
    Completed(DrillSummary),
}

/// Outward notifications for presentation.
#[derive(Debug, Clone, PartialEq)]
pub enum DrillEvent {
    Listening { index: usize, target: String },
    Heard(Utterance),
    Scored { target: String, heard: String, result: ScoreResult },
    ItemDecided { index: usize, item: PracticeItem },
    SessionFailed(RecognitionErrorKind),
    Completed(DrillSummary),
}

pub struct PracticeOrchestrator {
    session: SpeechSession,
    finalizer: DebouncedFinalizer,
    scorer: SimilarityScorer,
    locale: String,
    items: Vec<PracticeItem>,
    current: usize,
    completed: bool,
    progress: Arc<dyn ProgressSink>,
    recorder: Arc<dyn AttemptRecorder>,
    events: Option<mpsc::UnboundedSender<DrillEvent>>,
}

impl PracticeOrchestrator {
    pub fn new<I, S>(session: SpeechSession, targets: I, options: DrillOptions) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let null = Arc::new(NullCollaborators);
        Self {
            session,
            finalizer: DebouncedFinalizer::new(options.debounce),
            scorer: SimilarityScorer::new(options.success_threshold),
            locale: options.locale,
            items: targets.into_iter().map(PracticeItem::new).collect(),
            current: 0,
            completed: false,
            progress: null.clone(),
            recorder: null,
            events: None,
        }
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn AttemptRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<DrillEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn items(&self) -> &[PracticeItem] {
        &self.items
    }

    pub fn current_index(&self) -> Option<usize> {
        (!self.completed && self.current < self.items.len()).then_some(self.current)
    }

    pub fn current_item(&self) -> Option<&PracticeItem> {
        self.current_index().map(|i| &self.items[i])
    }

    pub fn current_target(&self) -> Option<&str> {
        self.current_item().map(|item| item.target.as_str())
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    pub fn session(&self) -> &SpeechSession {
        &self.session
    }

    pub fn summary(&self) -> DrillSummary {
        DrillSummary::from_items(&self.items)
    }

    /// Begin listening for the first word.
    pub async fn start(&mut self) -> Result<(), DrillError> {
        if self.items.is_empty() {
            return Err(DrillError::NoWords);
        }
        if self.completed {
            return Err(DrillError::Completed);
        }
        info!("Starting drill with {} word(s)", self.items.len());
        self.listen().await
    }

    /// Pump session events and the finalize deadline until the current word
    /// is decided, the session fails, or the drill is over.
    pub async fn next_decision(&mut self) -> Result<Decision, DrillError> {
        if self.completed {
            return Ok(Decision::Completed(self.summary()));
        }
        let Some(index) = self.current_index() else {
            return Err(DrillError::NoWords);
        };
        if self.items[index].is_decided() {
            return Err(DrillError::AwaitingCaller);
        }
        if !self.session.desired_active() {
            return Err(DrillError::NotListening);
        }

        loop {
            let deadline = self.finalizer.deadline();
            tokio::select! {
                event = self.session.next_event() => {
                    let Some(event) = event else {
                        return Err(DrillError::SessionClosed);
                    };
                    if let Some(decision) = self.on_session_event(event) {
                        return Ok(decision);
                    }
                }
                _ = sleep_until_opt(deadline) => {
                    if let Some(finalized) = self.finalizer.poll(Instant::now()) {
                        if let Some(decision) = self.score_finalized(finalized) {
                            return Ok(decision);
                        }
                    }
                }
            }
        }
    }

    /// Score a finalized utterance against the current word.
    ///
    /// Utterances finalized for a different target, or arriving after the
    /// current word was decided, are discarded.
    pub fn score_finalized(&mut self, finalized: Finalized) -> Option<Decision> {
        let index = self.current_index()?;
        let item = &mut self.items[index];

        if finalized.target != item.target {
            debug!(
                "Discarding '{}' scored for stale target '{}'",
                finalized.text, finalized.target
            );
            return None;
        }
        if item.is_decided() {
            debug!("Ignoring '{}', '{}' is already decided", finalized.text, item.target);
            return None;
        }

        let result = self.scorer.evaluate(&item.target, &finalized.text);
        item.attempts.push(result);
        item.status = if result.is_successful {
            ItemStatus::Success
        } else {
            ItemStatus::Fail
        };
        info!(
            "'{}' heard as '{}': score {:.2} -> {:?}",
            item.target, finalized.text, result.score, item.status
        );

        self.recorder
            .record_attempt(AttemptRecord::new(&item.target, &finalized.text, result));
        let target = item.target.clone();

        // Decided: stop listening until the caller retries or advances
        self.session.request_stop();
        self.finalizer.cancel();

        self.emit(DrillEvent::Scored {
            target: target.clone(),
            heard: finalized.text.clone(),
            result,
        });

        Some(Decision::Scored {
            index,
            target,
            heard: finalized.text,
            result,
        })
    }

    /// Try the current word again after a failed attempt or a failed
    /// session. Earlier words are untouched.
    pub async fn retry(&mut self) -> Result<(), DrillError> {
        let index = self.current_index().ok_or(DrillError::Completed)?;
        let item = &mut self.items[index];

        let session_failed = item.status == ItemStatus::Pending && !self.session.desired_active();
        if item.status != ItemStatus::Fail && !session_failed {
            return Err(DrillError::NotFailed);
        }

        info!("Retrying '{}'", item.target);
        item.status = ItemStatus::Pending;
        self.finalizer.reset();
        self.listen().await
    }

    /// Persist the decided word and move on.
    pub async fn advance(&mut self) -> Result<Progress, DrillError> {
        let index = self.current_index().ok_or(DrillError::Completed)?;
        if !self.items[index].is_decided() {
            return Err(DrillError::NotDecided);
        }

        self.session.request_stop();
        self.finalizer.reset();

        let item = self.items[index].clone();
        self.progress.persist_item(&item);
        self.emit(DrillEvent::ItemDecided { index, item });

        self.current += 1;
        if self.current >= self.items.len() {
            self.completed = true;
            let summary = self.summary();
            info!(
                "Drill complete: {} succeeded, {} failed",
                summary.successes, summary.failures
            );
            self.emit(DrillEvent::Completed(summary.clone()));
            return Ok(Progress::Completed(summary));
        }

        self.listen().await?;
        Ok(Progress::Next {
            index: self.current,
            target: self.items[self.current].target.clone(),
        })
    }

    /// Give up on the current word. An undecided word is recorded as failed.
    pub async fn skip(&mut self) -> Result<Progress, DrillError> {
        let index = self.current_index().ok_or(DrillError::Completed)?;
        let item = &mut self.items[index];
        if item.status == ItemStatus::Pending {
            info!("Skipping '{}'", item.target);
            item.status = ItemStatus::Fail;
        }
        self.advance().await
    }

    pub fn shutdown(&mut self) {
        self.finalizer.cancel();
        self.session.shutdown();
    }

    async fn listen(&mut self) -> Result<(), DrillError> {
        let target = self.items[self.current].target.clone();
        self.finalizer.set_target(&target);
        self.session.request_start(&self.locale).await?;
        self.emit(DrillEvent::Listening {
            index: self.current,
            target,
        });
        Ok(())
    }

    fn on_session_event(&mut self, event: SessionEvent) -> Option<Decision> {
        match event {
            SessionEvent::Partial(text) => {
                self.finalizer.on_partial(&text, Instant::now());
                self.emit(DrillEvent::Heard(Utterance::partial(text)));
                None
            }
            SessionEvent::Final(text) => {
                self.finalizer.on_partial(&text, Instant::now());
                self.emit(DrillEvent::Heard(Utterance::final_text(text)));
                None
            }
            SessionEvent::UtteranceEnded(last) => {
                let finalized = self.finalizer.on_session_end(last.as_deref())?;
                self.score_finalized(finalized)
            }
            SessionEvent::Error(kind) => {
                debug!("Transient recognition error during drill: {}", kind);
                None
            }
            SessionEvent::Failed(kind) => {
                warn!("Speech session failed during drill: {}", kind);
                self.finalizer.cancel();
                self.emit(DrillEvent::SessionFailed(kind));
                Some(Decision::SessionFailed(kind))
            }
        }
    }

    fn emit(&self, event: DrillEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}
