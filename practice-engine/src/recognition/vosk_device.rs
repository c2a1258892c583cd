//! Offline device recognizer using Vosk with cpal microphone capture.
//!
//! Behaves like a native device recognizer: one utterance per listening
//! run, partial results while speaking, results once Vosk finalizes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use thiserror::Error;
use tracing::{error, info, warn};
use vosk::{DecodingState, Model, Recognizer};

use super::device::{DeviceListener, DeviceSignal, DeviceSpeechApi, ERROR_AUDIO, ERROR_CLIENT};

/// Why a recognition run ended early.
#[derive(Debug, Error)]
enum WorkerError {
    #[error("Vosk recognizer failed: {0}")]
    Recognizer(String),
    #[error(transparent)]
    Audio(#[from] anyhow::Error),
}

impl WorkerError {
    fn device_code(&self) -> i32 {
        match self {
            WorkerError::Recognizer(_) => ERROR_CLIENT,
            WorkerError::Audio(_) => ERROR_AUDIO,
        }
    }
}

pub struct VoskDevice {
    model_path: PathBuf,
    model: Option<Arc<Model>>,
    stop_signal: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl VoskDevice {
    /// Load the model once; every listening run shares it. A model that
    /// fails to load leaves the device unavailable.
    pub fn new(model_path: PathBuf) -> Self {
        let model = if model_path.exists() {
            info!("Loading Vosk model from {}", model_path.display());
            let model = Model::new(model_path.to_string_lossy());
            if model.is_none() {
                warn!("Failed to load Vosk model from {}", model_path.display());
            }
            model.map(Arc::new)
        } else {
            warn!("Vosk model not found at {}", model_path.display());
            None
        };

        Self {
            model_path,
            model,
            stop_signal: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    fn run_recognition(
        model: &Model,
        listener: DeviceListener,
        stop_signal: Arc<AtomicBool>,
    ) -> Result<(), WorkerError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| anyhow!("No input device available"))?;
        let config = device
            .default_input_config()
            .context("Failed to read input config")?;
        let sample_rate = config.sample_rate().0 as f32;
        let channels = config.channels() as usize;

        let mut recognizer = Recognizer::new(model, sample_rate)
            .ok_or_else(|| WorkerError::Recognizer(format!("no recognizer at {} Hz", sample_rate)))?;

        let (tx, rx) = crossbeam_channel::unbounded::<Vec<i16>>();
        let stream = device
            .build_input_stream(
                &config.into(),
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let samples: Vec<i16> = data
                        .chunks(channels)
                        .map(|frame| {
                            let mono = frame.iter().sum::<f32>() / channels as f32;
                            (mono * 32767.0).clamp(-32768.0, 32767.0) as i16
                        })
                        .collect();
                    let _ = tx.send(samples);
                },
                |err| error!("Audio stream error: {}", err),
                None,
            )
            .context("Failed to build input stream")?;
        stream.play().context("Failed to start input stream")?;

        listener.deliver(DeviceSignal::ReadyForSpeech);
        info!("Vosk recognizer listening at {} Hz", sample_rate);

        let mut last_partial = String::new();
        while !stop_signal.load(Ordering::SeqCst) {
            let samples = match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(samples) => samples,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("Audio stream closed").into());
                }
            };

            let state = recognizer
                .accept_waveform(&samples)
                .map_err(|e| WorkerError::Recognizer(e.to_string()))?;
            if state == DecodingState::Finalized {
                let result = recognizer.result();
                let text = result
                    .single()
                    .map(|r| r.text.trim().to_string())
                    .unwrap_or_default();
                if !text.is_empty() {
                    listener.deliver(DeviceSignal::Results(vec![text]));
                    return Ok(());
                }
                continue;
            }

            let partial = recognizer.partial_result().partial.trim().to_string();
            if !partial.is_empty() && partial != last_partial {
                listener.deliver(DeviceSignal::PartialResults(vec![partial.clone()]));
                last_partial = partial;
            }
        }

        if let Some(result) = recognizer.final_result().single() {
            let text = result.text.trim();
            if !text.is_empty() {
                listener.deliver(DeviceSignal::Results(vec![text.to_string()]));
            }
        }
        Ok(())
    }
}

impl DeviceSpeechApi for VoskDevice {
    fn is_available(&self) -> bool {
        if self.model.is_none() {
            warn!("No Vosk model loaded from {}", self.model_path.display());
            return false;
        }
        cpal::default_host().default_input_device().is_some()
    }

    fn has_record_permission(&self) -> bool {
        // Desktop audio capture has no runtime permission prompt
        true
    }

    fn start_listening(&mut self, locale: &str, listener: DeviceListener) -> Result<()> {
        self.stop_listening();
        let Some(model) = self.model.clone() else {
            bail!("No Vosk model loaded from {}", self.model_path.display());
        };
        info!("Starting Vosk recognition (locale hint '{}')", locale);

        self.stop_signal = Arc::new(AtomicBool::new(false));
        let stop_signal = Arc::clone(&self.stop_signal);

        let handle = thread::Builder::new()
            .name("vosk-recognizer".into())
            .spawn(move || {
                match Self::run_recognition(&model, listener.clone(), stop_signal) {
                    Ok(()) => listener.deliver(DeviceSignal::EndOfSession),
                    Err(e) => {
                        error!("Vosk recognition failed: {:#}", e);
                        listener.deliver(DeviceSignal::Error(e.device_code()));
                    }
                }
            })?;

        self.worker = Some(handle);
        Ok(())
    }

    fn stop_listening(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    fn release(&mut self) {
        self.stop_listening();
    }
}

impl Drop for VoskDevice {
    fn drop(&mut self) {
        self.stop_listening();
    }
}
