//! Speech-input pipeline for pronunciation practice: recognition session
//! management, debounced finalization, fuzzy matching, and the drill and
//! round state machines that consume match results.

pub mod collaborators;
pub mod config;
pub mod finalizer;
pub mod matching;
pub mod orchestrator;
pub mod permission;
pub mod recognition;
pub mod round;
pub mod session;
mod timing;

pub use collaborators::{
    AttemptRecorder, ChannelRecorder, LogCollaborators, NullCollaborators, ProgressSink,
    RecordingCollaborators,
};
pub use config::{load_config, load_config_from, EngineConfig};
pub use finalizer::{DebouncedFinalizer, Finalized};
pub use matching::{evaluate, normalize, similarity, SimilarityScorer};
pub use orchestrator::{
    Decision, DrillError, DrillEvent, DrillOptions, DrillSummary, PracticeOrchestrator, Progress,
};
pub use permission::{PermissionProvider, PermissionStatus, StaticPermissions};
pub use recognition::{
    create_backend, BackendKind, BackendPreference, PlatformCapabilities, RecognitionBackend,
    RecognitionEvent, StartError,
};
pub use round::{
    InteractiveRoundMachine, MatchOutcome, RandomWords, RoundError, RoundEvent, RoundOptions,
    RoundRunner, WordCycle, WordSource,
};
pub use session::{RetryPolicy, SessionEvent, SpeechSession};

/// Install the global fmt subscriber on stderr. `RUST_LOG` overrides the
/// INFO default. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .try_init();
}
