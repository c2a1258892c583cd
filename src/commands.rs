use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use practice_engine::recognition::scripted::HostScript;
use practice_engine::round::DEFAULT_WORDS;
use practice_engine::{
    AttemptRecorder, BackendPreference, ChannelRecorder, Decision, DrillOptions, EngineConfig,
    InteractiveRoundMachine, LogCollaborators, MatchOutcome, PlatformCapabilities,
    PracticeOrchestrator, Progress, RandomWords, RoundEvent, SimilarityScorer, SpeechSession,
    StaticPermissions, WordSource,
};
use practice_types::ItemStatus;

/// Parse `TICK:TEXT`.
pub fn parse_say(s: &str) -> Result<(u32, String), String> {
    let (tick, text) = s
        .split_once(':')
        .ok_or_else(|| format!("expected TICK:TEXT, got '{}'", s))?;
    let tick = tick
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("invalid tick '{}': {}", tick, e))?;
    if text.trim().is_empty() {
        return Err("nothing to say".to_string());
    }
    Ok((tick, text.trim().to_string()))
}

pub fn score(config: &EngineConfig, target: &str, heard: &str) -> Result<()> {
    let scorer = SimilarityScorer::new(config.matching.success_threshold);
    let result = scorer.evaluate(target, heard);
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

pub fn show_config(config: &EngineConfig) -> Result<()> {
    if let Some(path) = practice_engine::config::config_path() {
        println!("# {}", path.display());
    }
    print!("{}", toml::to_string_pretty(config).context("Failed to serialize config")?);
    Ok(())
}

fn attempt_recorder(
    log_attempts: Option<PathBuf>,
) -> (Arc<dyn AttemptRecorder>, Option<tokio::task::JoinHandle<Result<()>>>) {
    match log_attempts {
        Some(path) => {
            info!("Logging attempts to {}", path.display());
            let (recorder, handle) = ChannelRecorder::spawn_json_lines(path);
            (Arc::new(recorder), Some(handle))
        }
        None => (Arc::new(LogCollaborators), None),
    }
}

pub async fn drill(
    config: &EngineConfig,
    words: Vec<String>,
    log_attempts: Option<PathBuf>,
    live: bool,
) -> Result<()> {
    let (recorder, writer) = attempt_recorder(log_attempts);

    let summary = if live {
        drill_live(config, words, recorder).await?
    } else {
        drill_stdin(config, words, recorder).await?
    };

    if let Some(writer) = writer {
        writer.await.context("Attempt writer panicked")??;
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn drill_stdin(
    config: &EngineConfig,
    words: Vec<String>,
    recorder: Arc<dyn AttemptRecorder>,
) -> Result<practice_engine::DrillSummary> {
    let script = HostScript::new();
    let session = SpeechSession::from_capabilities(
        BackendPreference::Host,
        PlatformCapabilities::default().with_host(script.api()),
        Arc::new(StaticPermissions::granted()),
        config.speech.retry_policy(),
    )?;

    let mut drill = PracticeOrchestrator::new(session, words, DrillOptions::from_config(config))
        .with_progress(Arc::new(LogCollaborators))
        .with_recorder(recorder);
    drill.start().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(target) = drill.current_target().map(str::to_string) {
        println!("Say \"{}\" (or :retry, :skip)", target);
        let Some(line) = lines.next_line().await? else {
            break;
        };

        match line.trim() {
            "" => continue,
            ":skip" => report(drill.skip().await?),
            ":retry" => {
                if let Err(e) = drill.retry().await {
                    println!("{}", e);
                }
            }
            text => {
                let failed = drill
                    .current_item()
                    .is_some_and(|item| item.status == ItemStatus::Fail);
                if failed || !drill.session().desired_active() {
                    drill.retry().await?;
                }
                if !script.speak(text) {
                    warn!("Recognizer is not listening, ignoring '{}'", text);
                    continue;
                }
                let decision = drill.next_decision().await?;
                if let Some(progress) = on_decision(&mut drill, decision).await? {
                    report(progress);
                }
            }
        }
    }

    let summary = drill.summary();
    drill.shutdown();
    Ok(summary)
}

#[cfg(feature = "vosk")]
async fn drill_live(
    config: &EngineConfig,
    words: Vec<String>,
    recorder: Arc<dyn AttemptRecorder>,
) -> Result<practice_engine::DrillSummary> {
    use practice_engine::recognition::vosk_device::VoskDevice;

    const MAX_ATTEMPTS: usize = 3;

    let device = VoskDevice::new(config.speech.vosk_model_path());
    let session = SpeechSession::from_capabilities(
        config.speech.backend,
        PlatformCapabilities::default().with_device(device),
        Arc::new(StaticPermissions::granted()),
        config.speech.retry_policy(),
    )?;

    let mut drill = PracticeOrchestrator::new(session, words, DrillOptions::from_config(config))
        .with_progress(Arc::new(LogCollaborators))
        .with_recorder(recorder);
    drill.start().await?;

    while let Some(target) = drill.current_target().map(str::to_string) {
        println!("Say \"{}\"", target);
        let decision = drill.next_decision().await?;
        if let Decision::SessionFailed(kind) = decision {
            anyhow::bail!("{}", kind.user_message());
        }
        if let Some(progress) = on_decision(&mut drill, decision).await? {
            report(progress);
            continue;
        }

        let attempts = drill.current_item().map_or(0, |item| item.attempts.len());
        if attempts >= MAX_ATTEMPTS {
            report(drill.skip().await?);
        } else {
            drill.retry().await?;
        }
    }

    let summary = drill.summary();
    drill.shutdown();
    Ok(summary)
}

#[cfg(not(feature = "vosk"))]
async fn drill_live(
    _config: &EngineConfig,
    _words: Vec<String>,
    _recorder: Arc<dyn AttemptRecorder>,
) -> Result<practice_engine::DrillSummary> {
    anyhow::bail!("live recognition needs a build with the `vosk` feature")
}

/// Print a decision; advance on success. Returns where the drill moved to.
async fn on_decision(drill: &mut PracticeOrchestrator, decision: Decision) -> Result<Option<Progress>> {
    match decision {
        Decision::Scored {
            target,
            heard,
            result,
            ..
        } => {
            println!(
                "Heard \"{}\" for \"{}\": score {:.2} {}",
                heard,
                target,
                result.score,
                if result.is_successful { "✓" } else { "✗" }
            );
            if result.is_successful {
                return Ok(Some(drill.advance().await?));
            }
            Ok(None)
        }
        Decision::SessionFailed(kind) => {
            println!("{}", kind.user_message());
            Ok(None)
        }
        Decision::Completed(summary) => Ok(Some(Progress::Completed(summary))),
    }
}

fn report(progress: Progress) {
    match progress {
        Progress::Next { index, target } => info!("Moving to word {}: '{}'", index + 1, target),
        Progress::Completed(summary) => info!(
            "All words done: {} succeeded, {} failed",
            summary.successes, summary.failures
        ),
    }
}

pub fn round(
    config: &EngineConfig,
    ticks: u32,
    mut says: Vec<(u32, String)>,
    words: Vec<String>,
    seed: Option<u64>,
) -> Result<()> {
    let words: Vec<String> = if words.is_empty() {
        DEFAULT_WORDS.iter().map(|w| w.to_string()).collect()
    } else {
        words
    };
    let source: Box<dyn WordSource> = match seed {
        Some(seed) => Box::new(RandomWords::seeded(words, seed)?),
        None => Box::new(RandomWords::new(words)?),
    };

    let mut machine = InteractiveRoundMachine::new(
        config.round.clone(),
        SimilarityScorer::new(config.matching.success_threshold),
        source,
    );
    says.sort_by_key(|(tick, _)| *tick);
    let mut says = says.into_iter().peekable();

    log_events(0, machine.start());
    for tick in 0..ticks {
        while let Some((_, text)) = says.next_if(|(at, _)| *at == tick) {
            let text = if text == "@" {
                machine.target().to_string()
            } else {
                text
            };
            match machine.submit(&text) {
                MatchOutcome::Accepted(result) => {
                    info!("tick {}: '{}' accepted ({:.2})", tick, text, result.score)
                }
                MatchOutcome::Rejected(result) => {
                    info!("tick {}: '{}' rejected ({:.2})", tick, text, result.score)
                }
                MatchOutcome::Ignored => info!("tick {}: '{}' ignored", tick, text),
            }
        }
        log_events(tick, machine.tick(1));
    }

    if let Some((tick, _)) = says.next() {
        warn!("Utterances from tick {} on are past the end of the round", tick);
    }

    let state = machine.stop();
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

fn log_events(tick: u32, events: Vec<RoundEvent>) {
    for event in events {
        match event {
            RoundEvent::Started { target } => info!("tick {}: target '{}'", tick, target),
            RoundEvent::Passed { score, next_target } => {
                info!("tick {}: passed (score {}), next '{}'", tick, score, next_target)
            }
            RoundEvent::BounceStarted { distance } => {
                info!("tick {}: bounced at {:.1}", tick, distance)
            }
            RoundEvent::BounceEnded { distance } => {
                info!("tick {}: running again from {:.1}", tick, distance)
            }
            _ => {}
        }
    }
}
