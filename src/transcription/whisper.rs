//! # Whisper Engine
//!
//! Candle-rs implementation of [`SpeechEngine`].
//!
//! ## Download:
//! Files are fetched with hf-hub into a private cache under the destination
//! directory, then moved into place. hf-hub reports no progress here; the
//! lifecycle controller estimates it by watching the filesystem.
//!
//! ## Loading Process:
//! 1. Read `config.json` and `tokenizer.json`
//! 2. Memory-map `model.safetensors` into a `VarBuilder`
//! 3. Build the mel filter bank for the model's `num_mel_bins`
//! 4. Resolve the special tokens used for greedy decoding
//!
//! ## Thread Safety:
//! Candle's decoder keeps a key/value cache, so a forward pass needs `&mut`.
//! The model sits behind a `Mutex` and every transcription runs on the
//! blocking pool; concurrent requests queue on that mutex, not on the
//! lifecycle controller.

use super::{LoadedModel, ModelAssets, ModelVersion, SpeechEngine};
use crate::error::EngineError;
use async_trait::async_trait;
use candle_core::{Device, IndexOp, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, audio, Config};
use hf_hub::api::tokio::ApiBuilder;
use hf_hub::{Repo, RepoType};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokenizers::Tokenizer;

pub const CONFIG_FILE: &str = "config.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";

const REQUIRED_FILES: &[&str] = &[CONFIG_FILE, TOKENIZER_FILE, WEIGHTS_FILE];

/// Name of the hf-hub cache used while downloading. Removed afterwards.
const DOWNLOAD_CACHE_DIR: &str = ".download-cache";

/// Whisper speech engine running on candle.
pub struct WhisperEngine {
    device: Device,
}

impl WhisperEngine {
    /// Engine running on the CPU.
    pub fn new() -> Self {
        Self { device: Device::Cpu }
    }

    pub fn with_device(device: Device) -> Self {
        Self { device }
    }
}

impl Default for WhisperEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpeechEngine for WhisperEngine {
    fn required_files(&self) -> &[&'static str] {
        REQUIRED_FILES
    }

    async fn download(&self, version: &ModelVersion, destination: &Path) -> Result<ModelAssets, EngineError> {
        tokio::fs::create_dir_all(destination)
            .await
            .map_err(|e| EngineError::Download(format!("cannot create {}: {}", destination.display(), e)))?;

        let cache_dir = destination.join(DOWNLOAD_CACHE_DIR);
        let mut builder = ApiBuilder::new().with_progress(false).with_cache_dir(cache_dir.clone());
        if let Ok(token) = std::env::var("HF_TOKEN") {
            tracing::debug!("Setting HF token (length: {})", token.len());
            builder = builder.with_token(Some(token));
        } else {
            tracing::debug!("No HF_TOKEN set, proceeding without authentication");
        }
        let api = builder
            .build()
            .map_err(|e| EngineError::Download(format!("cannot create HuggingFace client: {}", e)))?;

        let repo = api.repo(Repo::with_revision(
            version.repo.clone(),
            RepoType::Model,
            version.revision.clone(),
        ));

        for file_name in REQUIRED_FILES {
            let target = destination.join(file_name);
            if is_non_empty_file(&target).await {
                tracing::debug!(file = file_name, "asset file already in place");
                continue;
            }

            tracing::info!(file = file_name, repo = %version, "downloading asset file");
            let cached = repo
                .get(file_name)
                .await
                .map_err(|e| EngineError::Download(format!("{} from {}: {}", file_name, version, e)))?;
            move_into_place(&cached, &target).await?;
        }

        if let Err(e) = tokio::fs::remove_dir_all(&cache_dir).await {
            tracing::warn!(path = %cache_dir.display(), error = %e, "could not remove download cache");
        }

        Ok(ModelAssets::new(destination))
    }

    async fn initialize(&self, assets: &ModelAssets) -> Result<Arc<dyn LoadedModel>, EngineError> {
        let assets = assets.clone();
        let device = self.device.clone();
        let model = tokio::task::spawn_blocking(move || WhisperModel::load(&assets, device))
            .await
            .map_err(|e| EngineError::Load(format!("loader task failed: {}", e)))??;
        Ok(Arc::new(model))
    }
}

async fn is_non_empty_file(path: &Path) -> bool {
    matches!(tokio::fs::metadata(path).await, Ok(meta) if meta.is_file() && meta.len() > 0)
}

/// Move a file out of the hf-hub cache. The cache entry is a symlink into
/// `blobs/`, so the blob itself is moved; copying is the fallback when a
/// rename is not possible.
async fn move_into_place(cached: &Path, target: &Path) -> Result<(), EngineError> {
    let blob: PathBuf = tokio::fs::canonicalize(cached)
        .await
        .map_err(|e| EngineError::Download(format!("cannot resolve {}: {}", cached.display(), e)))?;

    if tokio::fs::rename(&blob, target).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(&blob, target)
        .await
        .map_err(|e| EngineError::Download(format!("cannot install {}: {}", target.display(), e)))?;
    Ok(())
}

/// Special token ids needed for greedy decoding.
#[derive(Debug, Clone, Copy)]
struct SpecialTokens {
    sot: u32,
    transcribe: u32,
    no_timestamps: u32,
    eot: u32,
}

struct WhisperInner {
    model: m::model::Whisper,
    config: Config,
    device: Device,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    tokens: SpecialTokens,
}

/// A Whisper model loaded into memory.
pub struct WhisperModel {
    inner: Arc<Mutex<WhisperInner>>,
}

impl WhisperModel {
    fn load(assets: &ModelAssets, device: Device) -> Result<Self, EngineError> {
        let start_time = std::time::Instant::now();
        let load_err = |what: &str, e: &dyn std::fmt::Display| EngineError::Load(format!("{}: {}", what, e));

        let config_bytes = std::fs::read(assets.path(CONFIG_FILE)).map_err(|e| load_err("config.json", &e))?;
        let config: Config = serde_json::from_slice(&config_bytes).map_err(|e| load_err("config.json", &e))?;

        let tokenizer =
            Tokenizer::from_file(assets.path(TOKENIZER_FILE)).map_err(|e| load_err("tokenizer.json", &e))?;
        let tokens = SpecialTokens {
            sot: token_id(&tokenizer, m::SOT_TOKEN)?,
            transcribe: token_id(&tokenizer, m::TRANSCRIBE_TOKEN)?,
            no_timestamps: token_id(&tokenizer, m::NO_TIMESTAMPS_TOKEN)?,
            eot: token_id(&tokenizer, m::EOT_TOKEN)?,
        };

        // SAFETY: the weights file is owned by this process' installation
        // directory and is not modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[assets.path(WEIGHTS_FILE)], m::DTYPE, &device) }
            .map_err(|e| load_err("model.safetensors", &e))?;
        let model = m::model::Whisper::load(&vb, config.clone()).map_err(|e| load_err("model weights", &e))?;

        let mel_filters = mel_filter_bank(config.num_mel_bins, m::N_FFT, m::SAMPLE_RATE);

        tracing::info!(
            mel_bins = config.num_mel_bins,
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "whisper model loaded"
        );

        Ok(Self {
            inner: Arc::new(Mutex::new(WhisperInner { model, config, device, tokenizer, mel_filters, tokens })),
        })
    }
}

fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32, EngineError> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| EngineError::Load(format!("tokenizer has no {} token", token)))
}

#[async_trait]
impl LoadedModel for WhisperModel {
    async fn transcribe(&self, samples: Vec<f32>, language: Option<String>) -> Result<String, EngineError> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut guard = inner
                .lock()
                .map_err(|_| EngineError::Inference("model lock poisoned by an earlier failure".to_string()))?;
            guard.transcribe(&samples, language.as_deref())
        })
        .await
        .map_err(|e| EngineError::Inference(format!("inference task failed: {}", e)))?
    }
}

impl WhisperInner {
    fn transcribe(&mut self, samples: &[f32], language: Option<&str>) -> Result<String, EngineError> {
        let infer = |e: candle_core::Error| EngineError::Inference(e.to_string());

        if samples.is_empty() {
            return Err(EngineError::Inference("audio contains no samples".to_string()));
        }

        let language_token = language.and_then(|lang| {
            let id = self.tokenizer.token_to_id(&format!("<|{}|>", lang.to_lowercase()));
            if id.is_none() {
                tracing::warn!(language = lang, "unknown language hint, falling back to auto-detect");
            }
            id
        });

        let n_mels = self.config.num_mel_bins;
        let mel = audio::pcm_to_mel(&self.config, samples, &self.mel_filters);
        let mel_len = mel.len();
        let mel = Tensor::from_vec(mel, (1, n_mels, mel_len / n_mels), &self.device).map_err(infer)?;
        let (_, _, content_frames) = mel.dims3().map_err(infer)?;

        // Whisper sees at most 30 s (N_FRAMES) per pass.
        let mut pieces = Vec::new();
        let mut seek = 0;
        while seek < content_frames {
            let size = usize::min(content_frames - seek, m::N_FRAMES);
            let segment = mel.narrow(2, seek, size).map_err(infer)?;
            let text = self.decode_segment(&segment, language_token).map_err(infer)?;
            if !text.is_empty() {
                pieces.push(text);
            }
            seek += size;
        }

        Ok(pieces.join(" "))
    }

    /// Greedy decoding of one mel segment.
    fn decode_segment(&mut self, mel: &Tensor, language_token: Option<u32>) -> candle_core::Result<String> {
        let audio_features = self.model.encoder.forward(mel, true)?;

        let mut tokens = vec![self.tokens.sot];
        if let Some(language) = language_token {
            tokens.push(language);
        }
        tokens.push(self.tokens.transcribe);
        tokens.push(self.tokens.no_timestamps);
        let prompt_len = tokens.len();

        let sample_len = self.config.max_target_positions / 2;
        for i in 0..sample_len {
            let tokens_t = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = self.model.decoder.forward(&tokens_t, &audio_features, i == 0)?;
            let (_, seq_len, _) = ys.dims3()?;
            let logits = self.model.decoder.final_linear(&ys.i((..1, seq_len - 1..))?)?.i(0)?.i(0)?;
            let next = logits.argmax(D::Minus1)?.to_scalar::<u32>()?;

            if next == self.tokens.eot || tokens.len() >= self.config.max_target_positions {
                break;
            }
            tokens.push(next);
        }

        let text = self
            .tokenizer
            .decode(&tokens[prompt_len..], true)
            .map_err(|e| candle_core::Error::Msg(format!("tokenizer decode error: {}", e)))?;
        Ok(text.trim().to_string())
    }
}

/// Slaney-style mel filter bank, row-major `[n_mels][n_fft / 2 + 1]`.
///
/// Same construction as librosa's `mel(sr, n_fft, n_mels)` with area
/// normalization, which is what Whisper was trained with.
pub fn mel_filter_bank(n_mels: usize, n_fft: usize, sample_rate: usize) -> Vec<f32> {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;
    let log_step = (6.4f64).ln() / 27.0;

    let hz_to_mel = |hz: f64| {
        if hz >= MIN_LOG_HZ {
            MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / log_step
        } else {
            hz / F_SP
        }
    };
    let mel_to_hz = |mel: f64| {
        if mel >= MIN_LOG_MEL {
            MIN_LOG_HZ * (log_step * (mel - MIN_LOG_MEL)).exp()
        } else {
            F_SP * mel
        }
    };

    let n_freqs = n_fft / 2 + 1;
    let max_mel = hz_to_mel(sample_rate as f64 / 2.0);
    let band_edges: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(max_mel * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0.0f32; n_mels * n_freqs];
    for band in 0..n_mels {
        let (lower, center, upper) = (band_edges[band], band_edges[band + 1], band_edges[band + 2]);
        let norm = 2.0 / (upper - lower);
        for bin in 0..n_freqs {
            let freq = bin as f64 * sample_rate as f64 / n_fft as f64;
            let rising = (freq - lower) / (center - lower);
            let falling = (upper - freq) / (upper - center);
            let weight = rising.min(falling).max(0.0);
            filters[band * n_freqs + bin] = (weight * norm) as f32;
        }
    }
    filters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mel_filter_bank_shape() {
        let filters = mel_filter_bank(80, 400, 16_000);
        assert_eq!(filters.len(), 80 * 201);
        assert!(filters.iter().all(|w| *w >= 0.0));
    }

    #[test]
    fn test_every_mel_band_has_weight() {
        let n_freqs = 201;
        let filters = mel_filter_bank(80, 400, 16_000);
        for band in 0..80 {
            let row = &filters[band * n_freqs..(band + 1) * n_freqs];
            assert!(row.iter().any(|w| *w > 0.0), "band {} is empty", band);
        }
    }

    #[test]
    fn test_required_files() {
        let engine = WhisperEngine::new();
        assert_eq!(engine.required_files(), &["config.json", "tokenizer.json", "model.safetensors"]);
    }

    #[tokio::test]
    async fn test_initialize_fails_cleanly_without_files() {
        let dir = tempfile::tempdir().unwrap();
        let engine = WhisperEngine::new();
        let result = engine.initialize(&ModelAssets::new(dir.path())).await;
        assert!(matches!(result, Err(EngineError::Load(_))));
    }
}
