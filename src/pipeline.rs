//! End-to-end synthesis pipeline.
//!
//! Orchestrates one synthesis call:
//! 1. Check the token cap and add the two boundary tokens
//! 2. Project the phoneme embeddings (`bert_encoder`) and run the duration encoder
//! 3. Predict integer durations and build the alignment
//! 4. Expand predictor features to frames and predict F0 / voicing curves
//! 5. Encode phoneme ids (text encoder) and expand them to frames
//! 6. Decode to audio through the iSTFTNet generator
//!
//! Padded tokens take part in the duration encoder (masked) but get no
//! duration, so they own no frames and produce no audio.
//!
//! All weights are immutable after loading, so one [`KokoroPipeline`] can
//! serve concurrent calls. Every call owns its RNG.

use std::path::Path;
use std::time::Instant;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::KokoroConfig;
use crate::model::decoder::Decoder;
use crate::model::duration::{Alignment, DurationAligner, DurationEncoder};
use crate::model::mask::PaddingMask;
use crate::model::prosody::ProsodyPredictor;
use crate::model::text_encoder::TextEncoder;
use crate::timestamps::{WordSpan, WordTimestamp, word_timestamps};
use crate::voice::StyleVector;
use crate::{Error, Result};

/// Token id of the boundary marker placed before and after the phonemes.
pub const BOUNDARY_TOKEN: u32 = 0;

/// Phoneme-level input to a synthesis call.
///
/// The bounded sequence is laid out as `[bos, valid phonemes.., eos, pad..]`:
/// the closing boundary token follows the last valid phoneme, not the last
/// id, so a padded batch row keeps its end-of-sequence token valid.
#[derive(Debug, Clone)]
pub struct PhonemeInput {
    /// Phoneme ids without boundary tokens; valid ids first, then padding.
    pub ids: Vec<u32>,
    /// Phoneme encoder hidden states for the bounded sequence, `[T + 2, plbert_hidden]`
    /// (a leading batch axis of 1 is accepted).
    pub embeddings: Tensor,
    /// Padding over the bounded sequence (`T + 2` positions).
    pub mask: PaddingMask,
}

impl PhonemeInput {
    /// Input with no padding.
    pub fn new(ids: Vec<u32>, embeddings: Tensor) -> Self {
        let mask = PaddingMask::all_valid(ids.len() + 2);
        Self {
            ids,
            embeddings,
            mask,
        }
    }

    /// Input whose first `valid_phonemes` ids are real and the rest padding.
    pub fn padded(ids: Vec<u32>, embeddings: Tensor, valid_phonemes: usize) -> Self {
        let tokens = ids.len() + 2;
        let mask = PaddingMask::with_valid_prefix(tokens, (valid_phonemes + 2).min(tokens));
        Self {
            ids,
            embeddings,
            mask,
        }
    }

    pub fn with_mask(mut self, mask: PaddingMask) -> Self {
        self.mask = mask;
        self
    }

    /// Sequence length including the boundary tokens.
    pub fn tokens(&self) -> usize {
        self.ids.len() + 2
    }

    /// Number of valid phonemes (boundary tokens excluded).
    pub fn valid_phonemes(&self) -> usize {
        self.mask.valid_len().saturating_sub(2).min(self.ids.len())
    }

    /// Ids of the bounded sequence: `[bos, valid.., eos, padded..]`.
    pub fn bounded_ids(&self) -> Vec<u32> {
        let (valid, padded) = self.ids.split_at(self.valid_phonemes());
        let mut ids = Vec::with_capacity(self.tokens());
        ids.push(BOUNDARY_TOKEN);
        ids.extend_from_slice(valid);
        ids.push(BOUNDARY_TOKEN);
        ids.extend_from_slice(padded);
        ids
    }
}

/// Per-call synthesis settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynthesisOptions {
    /// Speaking rate; durations are divided by it.
    pub speed: f32,
    /// Seed for the excitation source's phases and noise.
    pub seed: u64,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self { speed: 1.0, seed: 0 }
    }
}

/// Output of a synthesis call.
#[derive(Debug, Clone)]
pub struct Synthesis {
    /// Mono samples at `sample_rate`.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Frames per valid token, boundary tokens included. Padded tokens are
    /// not listed.
    pub durations: Vec<u32>,
    pub frames: usize,
}

impl Synthesis {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Kokoro acoustic model with all weights resident.
#[derive(Debug, Clone)]
pub struct KokoroPipeline {
    config: KokoroConfig,
    device: Device,
    bert_encoder: Linear,
    duration_encoder: DurationEncoder,
    aligner: DurationAligner,
    prosody: ProsodyPredictor,
    text_encoder: TextEncoder,
    decoder: Decoder,
}

impl KokoroPipeline {
    /// Load weights from a safetensors file.
    pub fn load(weights_path: &Path, config: KokoroConfig, device: &Device) -> Result<Self> {
        config.verify()?;
        tracing::info!(path = ?weights_path, device = ?device, dtype = ?DType::F32, "loading Kokoro weights");
        let start = Instant::now();
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, device)
                .map_err(|e| Error::WeightLoad(format!("{}: {e}", weights_path.display())))?
        };
        let pipeline = Self::from_var_builder(config, vb)?;
        tracing::info!(elapsed_ms = start.elapsed().as_millis() as u64, "Kokoro weights loaded");
        Ok(pipeline)
    }

    /// Build from any `VarBuilder` rooted at the canonical weight names.
    pub fn from_var_builder(config: KokoroConfig, vb: VarBuilder) -> Result<Self> {
        config.verify()?;
        let device = vb.device().clone();
        let hidden = config.hidden_dim;
        let style_dim = config.style_dim;
        let predictor = vb.pp("predictor");

        let bert_encoder =
            candle_nn::linear(config.plbert.hidden_size, hidden, vb.pp("bert_encoder")).map_err(mismatch)?;
        let duration_encoder =
            DurationEncoder::new(hidden, style_dim, config.n_layer, predictor.pp("text_encoder"))
                .map_err(mismatch)?;
        let aligner = DurationAligner::new(hidden, style_dim, config.max_dur, predictor.clone()).map_err(mismatch)?;
        let prosody = ProsodyPredictor::new(hidden, style_dim, predictor).map_err(mismatch)?;
        let text_encoder = TextEncoder::new(
            config.n_token,
            hidden,
            config.text_encoder_kernel_size,
            config.n_layer,
            vb.pp("text_encoder"),
        )
        .map_err(mismatch)?;
        let decoder = Decoder::new(&config, vb.pp("decoder")).map_err(|e| match e {
            Error::Candle(e) => mismatch(e),
            other => other,
        })?;

        Ok(Self {
            config,
            device,
            bert_encoder,
            duration_encoder,
            aligner,
            prosody,
            text_encoder,
            decoder,
        })
    }

    pub fn config(&self) -> &KokoroConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    /// Synthesize one utterance.
    pub fn synthesize(
        &self,
        input: &PhonemeInput,
        style: &StyleVector,
        options: &SynthesisOptions,
    ) -> Result<Synthesis> {
        let tokens = input.tokens();
        if tokens > self.config.max_tokens {
            return Err(Error::InputTooLong {
                tokens,
                max: self.config.max_tokens,
            });
        }
        self.check_input(input, style)?;
        let start = Instant::now();
        let mask = &input.mask;
        let prosodic = style.prosodic()?.to_device(&self.device)?;
        let acoustic = style.acoustic()?.to_device(&self.device)?;

        let valid = mask.valid_len();
        let ids = Tensor::from_vec(input.bounded_ids(), (1, tokens), &self.device)?;

        // [T, plbert] → [1, T, hidden] → [1, hidden, T]
        let embeddings = input
            .embeddings
            .reshape((tokens, self.config.plbert.hidden_size))?
            .to_dtype(DType::F32)?
            .to_device(&self.device)?
            .unsqueeze(0)?;
        let d_en = self.bert_encoder.forward(&embeddings)?.transpose(1, 2)?;

        let stage = Instant::now();
        let d = self.duration_encoder.forward(&d_en, &prosodic, mask)?;
        let durations = self.aligner.predict(&d, mask, options.speed)?;
        let total: u64 = durations.iter().map(|&d| u64::from(d)).sum();
        let max_frames = self.config.max_frames();
        if total > max_frames as u64 {
            return Err(Error::InvalidInput(format!(
                "speed {} yields {total} frames, at most {max_frames} allowed",
                options.speed
            )));
        }
        let alignment = Alignment::from_durations(durations)?;
        alignment.verify()?;
        let frames = alignment.frames();
        tracing::debug!(
            tokens,
            frames,
            elapsed_ms = stage.elapsed().as_millis() as u64,
            "durations predicted"
        );

        let stage = Instant::now();
        // Only valid tokens own frames, so every frame is valid.
        let en = alignment.expand(&d.narrow(1, 0, valid)?.transpose(1, 2)?)?;
        let frame_mask = PaddingMask::all_valid(frames);
        let curves = self.prosody.forward(&en, &prosodic, &frame_mask)?;
        tracing::debug!(elapsed_ms = stage.elapsed().as_millis() as u64, "prosody predicted");

        let stage = Instant::now();
        let t_en = self.text_encoder.forward(&ids, mask)?;
        let asr = alignment.expand(&t_en.narrow(2, 0, valid)?)?;
        let mut rng = ChaCha8Rng::seed_from_u64(options.seed);
        let samples = self
            .decoder
            .forward(&asr, &curves.f0, &curves.n, &acoustic, &mut rng)?;
        tracing::debug!(elapsed_ms = stage.elapsed().as_millis() as u64, "decoded audio");

        let expected = frames * self.config.samples_per_frame();
        if samples.len() != expected {
            return Err(Error::NumericalInvariant(format!(
                "decoder produced {} samples, expected {expected} for {frames} frames",
                samples.len()
            )));
        }

        tracing::info!(
            tokens,
            frames,
            samples = samples.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "synthesis complete"
        );
        Ok(Synthesis {
            samples,
            sample_rate: self.config.sample_rate,
            durations: alignment.durations().to_vec(),
            frames,
        })
    }

    /// Start/end seconds for each word of a finished synthesis.
    pub fn word_timestamps(&self, words: &[WordSpan], synthesis: &Synthesis) -> Vec<WordTimestamp> {
        let half_frames_per_second =
            2.0 * self.config.sample_rate as f64 / self.config.samples_per_frame() as f64;
        word_timestamps(words, &synthesis.durations, half_frames_per_second)
    }

    fn check_input(&self, input: &PhonemeInput, style: &StyleVector) -> Result<()> {
        let tokens = input.tokens();
        let rows = match input.embeddings.dims() {
            &[rows, width] | &[1, rows, width] if width == self.config.plbert.hidden_size => rows,
            dims => {
                return Err(Error::InvalidInput(format!(
                    "embeddings must be [{tokens}, {}], got {dims:?}",
                    self.config.plbert.hidden_size
                )));
            }
        };
        if rows != tokens {
            return Err(Error::InvalidInput(format!(
                "{rows} embedding rows for {tokens} tokens"
            )));
        }
        if input.mask.len() != tokens {
            return Err(Error::InvalidInput(format!(
                "mask covers {} positions, sequence has {tokens}",
                input.mask.len()
            )));
        }
        if input.mask.valid_len() < 2 {
            return Err(Error::InvalidInput(
                "mask must keep both boundary tokens valid".into(),
            ));
        }
        if style.style_dim() != self.config.style_dim {
            return Err(Error::InvalidInput(format!(
                "style vector has style_dim {}, model expects {}",
                style.style_dim(),
                self.config.style_dim
            )));
        }
        if let Some(&id) = input.ids.iter().find(|&&id| id as usize >= self.config.n_token) {
            return Err(Error::InvalidInput(format!(
                "phoneme id {id} is outside the vocabulary of {}",
                self.config.n_token
            )));
        }
        Ok(())
    }
}

fn mismatch(e: candle_core::Error) -> Error {
    Error::ConfigurationMismatch(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn make_pipeline(dev: &Device) -> (VarMap, KokoroPipeline) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        let pipeline = KokoroPipeline::from_var_builder(KokoroConfig::tiny(), vb).unwrap();
        (varmap, pipeline)
    }

    fn make_input(pipeline: &KokoroPipeline, ids: Vec<u32>) -> PhonemeInput {
        let rows = ids.len() + 2;
        let width = pipeline.config().plbert.hidden_size;
        let embeddings = Tensor::randn(0f32, 1.0, (rows, width), pipeline.device()).unwrap();
        PhonemeInput::new(ids, embeddings)
    }

    fn make_style(pipeline: &KokoroPipeline) -> StyleVector {
        let width = pipeline.config().style_width();
        let tensor = Tensor::randn(0f32, 1.0, (1, width), pipeline.device()).unwrap();
        StyleVector::new(tensor, pipeline.config().style_dim).unwrap()
    }

    #[test]
    fn test_end_to_end_lengths() {
        let dev = Device::Cpu;
        let (_vm, pipeline) = make_pipeline(&dev);
        let input = make_input(&pipeline, vec![3, 7, 1, 9, 4]);
        let style = make_style(&pipeline);

        let out = pipeline
            .synthesize(&input, &style, &SynthesisOptions::default())
            .unwrap();
        assert_eq!(out.durations.len(), 7);
        assert!(out.durations.iter().all(|&d| d >= 1), "{:?}", out.durations);
        assert_eq!(out.durations.iter().sum::<u32>() as usize, out.frames);
        assert_eq!(out.samples.len(), out.frames * pipeline.config().samples_per_frame());
        assert_eq!(out.sample_rate, 24_000);
        assert!(out.samples.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn test_same_seed_same_audio() {
        let dev = Device::Cpu;
        let (_vm, pipeline) = make_pipeline(&dev);
        let input = make_input(&pipeline, vec![2, 5, 8]);
        let style = make_style(&pipeline);
        let options = SynthesisOptions { speed: 1.0, seed: 42 };

        let a = pipeline.synthesize(&input, &style, &options).unwrap();
        let b = pipeline.synthesize(&input, &style, &options).unwrap();
        assert_eq!(a.durations, b.durations);
        assert_eq!(a.samples, b.samples);
    }

    #[test]
    fn test_too_many_phonemes() {
        let dev = Device::Cpu;
        let (_vm, pipeline) = make_pipeline(&dev);
        let input = make_input(&pipeline, vec![1; 511]);
        let style = make_style(&pipeline);
        let result = pipeline.synthesize(&input, &style, &SynthesisOptions::default());
        assert!(
            matches!(result, Err(Error::InputTooLong { tokens: 513, max: 512 })),
            "{result:?}"
        );
    }

    #[test]
    fn test_faster_speech_has_fewer_frames() {
        let dev = Device::Cpu;
        let (_vm, pipeline) = make_pipeline(&dev);
        let input = make_input(&pipeline, vec![4, 6, 2, 11]);
        let style = make_style(&pipeline);

        let slow = pipeline
            .synthesize(&input, &style, &SynthesisOptions { speed: 0.5, seed: 1 })
            .unwrap();
        let fast = pipeline
            .synthesize(&input, &style, &SynthesisOptions { speed: 2.0, seed: 1 })
            .unwrap();
        assert!(slow.frames >= fast.frames, "{} < {}", slow.frames, fast.frames);
        for (s, f) in slow.durations.iter().zip(&fast.durations) {
            assert!(s >= f);
        }
    }

    #[test]
    fn test_malformed_input_is_rejected() {
        let dev = Device::Cpu;
        let (_vm, pipeline) = make_pipeline(&dev);
        let style = make_style(&pipeline);

        let width = pipeline.config().plbert.hidden_size;
        let short = PhonemeInput::new(vec![1, 2, 3], Tensor::zeros((4, width), DType::F32, &dev).unwrap());
        let result = pipeline.synthesize(&short, &style, &SynthesisOptions::default());
        assert!(matches!(result, Err(Error::InvalidInput(_))));

        let bad_mask = make_input(&pipeline, vec![1, 2, 3]).with_mask(PaddingMask::all_valid(4));
        let result = pipeline.synthesize(&bad_mask, &style, &SynthesisOptions::default());
        assert!(matches!(result, Err(Error::InvalidInput(_))));

        let input = make_input(&pipeline, vec![1, 2, 3]);
        let options = SynthesisOptions { speed: 0.0, seed: 0 };
        let result = pipeline.synthesize(&input, &style, &options);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_timestamps_cover_words() {
        let dev = Device::Cpu;
        let (_vm, pipeline) = make_pipeline(&dev);
        // [bos, h, i, ␣, y, o, eos]
        let input = make_input(&pipeline, vec![5, 6, 16, 7, 8]);
        let style = make_style(&pipeline);
        let out = pipeline
            .synthesize(&input, &style, &SynthesisOptions::default())
            .unwrap();

        let words = [WordSpan::new("hi", Some(2), true), WordSpan::new("yo", Some(2), false)];
        let stamps = pipeline.word_timestamps(&words, &out);
        assert_eq!(stamps.len(), 2);
        assert!(stamps[0].start <= stamps[0].end);
        assert!(stamps[0].end <= stamps[1].start);
        assert!(stamps[1].end <= out.duration_secs() + 1e-9);
    }

    #[test]
    fn test_closing_boundary_follows_valid_phonemes() {
        let embeddings = Tensor::zeros((7, 12), DType::F32, &Device::Cpu).unwrap();
        let input = PhonemeInput::padded(vec![3, 7, 1, 2, 2], embeddings, 3);
        assert_eq!(input.valid_phonemes(), 3);
        assert_eq!(input.bounded_ids(), vec![0, 3, 7, 1, 0, 2, 2]);
        assert_eq!(input.mask.valid_len(), 5);
        assert!(input.mask.is_padded(5));
    }

    #[test]
    fn test_padding_does_not_change_the_audio() {
        let dev = Device::Cpu;
        let (_vm, pipeline) = make_pipeline(&dev);
        let style = make_style(&pipeline);
        let options = SynthesisOptions { speed: 1.0, seed: 3 };
        let width = pipeline.config().plbert.hidden_size;

        // [bos, 5 phonemes, eos] and the same row padded with 3 extra tokens.
        let embeddings = Tensor::randn(0f32, 1.0, (7, width), &dev).unwrap();
        let pad_rows = Tensor::randn(0f32, 1.0, (3, width), &dev).unwrap();
        let padded_embeddings = Tensor::cat(&[&embeddings, &pad_rows], 0).unwrap();
        let plain = PhonemeInput::new(vec![3, 7, 1, 9, 4], embeddings);
        let padded = PhonemeInput::padded(vec![3, 7, 1, 9, 4, 2, 2, 2], padded_embeddings, 5);

        let a = pipeline.synthesize(&plain, &style, &options).unwrap();
        let b = pipeline.synthesize(&padded, &style, &options).unwrap();
        assert_eq!(a.durations, b.durations, "padded tokens must not own frames");
        assert_eq!(a.frames, b.frames);
        assert_eq!(a.samples.len(), b.samples.len());
        let peak = a.samples.iter().fold(0f32, |m, s| m.max(s.abs()));
        let diff = a
            .samples
            .iter()
            .zip(&b.samples)
            .fold(0f32, |m, (x, y)| m.max((x - y).abs()));
        assert!(diff <= 1e-3 * (1.0 + peak), "padding moved the audio by {diff}");
    }

    #[test]
    fn test_mask_must_keep_boundaries() {
        let dev = Device::Cpu;
        let (_vm, pipeline) = make_pipeline(&dev);
        let style = make_style(&pipeline);
        let input = make_input(&pipeline, vec![1, 2, 3]).with_mask(PaddingMask::with_valid_prefix(5, 1));
        let result = pipeline.synthesize(&input, &style, &SynthesisOptions::default());
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_tiny_speed_hits_frame_cap() {
        let dev = Device::Cpu;
        let (_vm, pipeline) = make_pipeline(&dev);
        let style = make_style(&pipeline);
        let input = make_input(&pipeline, vec![1, 2, 3]);
        let options = SynthesisOptions { speed: 1e-6, seed: 0 };
        let result = pipeline.synthesize(&input, &style, &options);
        assert!(
            matches!(&result, Err(Error::InvalidInput(message)) if message.contains("frames")),
            "{result:?}"
        );
    }

    #[test]
    fn test_pipeline_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<KokoroPipeline>();
    }

    #[test]
    fn test_missing_weights_are_a_configuration_mismatch() {
        let dev = Device::Cpu;
        let vb = VarBuilder::from_tensors(std::collections::HashMap::new(), DType::F32, &dev);
        let result = KokoroPipeline::from_var_builder(KokoroConfig::tiny(), vb);
        assert!(matches!(result, Err(Error::ConfigurationMismatch(_))));
    }
}
