//! Kokoro CLI: phoneme features to speech.
//!
//! Reads pre-encoded phoneme features, a voice pack and the model weights,
//! and writes a mono WAV file.
//!
//! # Inputs
//!
//! `--features` is a safetensors file with two tensors:
//! - `input_ids`: phoneme ids without boundary tokens (any integer dtype)
//! - `embeddings`: phoneme encoder hidden states, `[tokens + 2, plbert_hidden]`
//!
//! # Output
//!
//! Writes the WAV to `--output` and prints a one-line JSON summary:
//!
//! ```json
//! {"path":"/tmp/speech.wav","duration_s":2.4,"sample_rate":24000,"frames":96,"tokens":31}
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use std::path::PathBuf;

use candle_core::{DType, Device};
use clap::Parser;
use kokoro_rs::{
    audio::{WavEncoding, peak_normalize, write_wav},
    config::KokoroConfig,
    pipeline::{KokoroPipeline, PhonemeInput, SynthesisOptions},
    voice::VoicePack,
};

#[derive(Parser, Debug)]
#[command(
    name = "kokoro",
    about = "Kokoro acoustic synthesis from phoneme features",
    long_about = "Synthesize speech from pre-encoded phoneme features.\n\
                  Output is written to --output as WAV; a JSON summary line is printed to stdout."
)]
struct Args {
    /// Model weights (safetensors).
    #[arg(long, short = 'w')]
    weights: PathBuf,

    /// Model config.json. Kokoro-82M v1.0 defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Voice pack (safetensors, one [N, 1, 256] tensor).
    #[arg(long, short = 'v')]
    voice: PathBuf,

    /// Phoneme features (safetensors with `input_ids` and `embeddings`).
    #[arg(long, short = 'f')]
    features: PathBuf,

    /// Speaking rate. Values above 1 speak faster.
    #[arg(long, default_value_t = 1.0)]
    speed: f32,

    /// Seed for the excitation noise.
    #[arg(long, short = 's', default_value_t = 0)]
    seed: u64,

    /// Output WAV path.
    #[arg(long, short = 'o')]
    output: PathBuf,

    /// Scale the output so its peak reaches this level (0 < peak <= 1).
    #[arg(long)]
    normalize: Option<f32>,

    /// Write 16-bit PCM instead of 32-bit float.
    #[arg(long)]
    pcm16: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if !(args.speed.is_finite() && args.speed > 0.0) {
        anyhow::bail!("speed must be positive, got {}", args.speed);
    }
    if let Some(peak) = args.normalize
        && !(peak > 0.0 && peak <= 1.0)
    {
        anyhow::bail!("normalize peak must be in (0, 1], got {peak}");
    }

    if let Some(parent) = args.output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let config = match &args.config {
        Some(path) => KokoroConfig::from_file(path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", path.display()))?,
        None => KokoroConfig::default(),
    };

    let device = Device::cuda_if_available(0)?;
    tracing::info!("Using device: {:?}", device);

    let input = load_features(&args.features, &device)?;
    tracing::info!(phonemes = input.valid_phonemes(), "loaded phoneme features");

    let voice = VoicePack::load(&args.voice, config.style_dim, &device)
        .map_err(|e| anyhow::anyhow!("failed to load voice: {e}"))?;
    let style = voice.select(input.valid_phonemes())?;

    let pipeline = KokoroPipeline::load(&args.weights, config, &device)
        .map_err(|e| anyhow::anyhow!("failed to load model: {e}"))?;

    let options = SynthesisOptions {
        speed: args.speed,
        seed: args.seed,
    };
    let mut synthesis = pipeline
        .synthesize(&input, &style, &options)
        .map_err(|e| anyhow::anyhow!("synthesis failed: {e}"))?;

    if let Some(peak) = args.normalize {
        peak_normalize(&mut synthesis.samples, peak);
    }
    let encoding = if args.pcm16 {
        WavEncoding::Pcm16
    } else {
        WavEncoding::Float32
    };
    write_wav(&args.output, &synthesis.samples, synthesis.sample_rate, encoding)
        .map_err(|e| anyhow::anyhow!("failed to write audio: {e}"))?;

    let summary = serde_json::json!({
        "path": args.output.display().to_string(),
        "duration_s": synthesis.duration_secs(),
        "sample_rate": synthesis.sample_rate,
        "frames": synthesis.frames,
        "tokens": input.tokens(),
    });
    println!("{summary}");

    Ok(())
}

fn load_features(path: &std::path::Path, device: &Device) -> anyhow::Result<PhonemeInput> {
    let mut tensors = candle_core::safetensors::load(path, device)
        .map_err(|e| anyhow::anyhow!("failed to read features {}: {e}", path.display()))?;
    let Some(ids) = tensors.remove("input_ids") else {
        anyhow::bail!("{} has no `input_ids` tensor", path.display());
    };
    let Some(embeddings) = tensors.remove("embeddings") else {
        anyhow::bail!("{} has no `embeddings` tensor", path.display());
    };
    let ids: Vec<u32> = ids.flatten_all()?.to_dtype(DType::U32)?.to_vec1()?;
    Ok(PhonemeInput::new(ids, embeddings.to_dtype(DType::F32)?))
}
