//! Harmonic-plus-noise excitation source for the vocoder.
//!
//! The pitch curve arrives at generator-input rate and is held (nearest
//! neighbour) up to audio rate. From there:
//!
//! ```text
//! f0 → H+1 harmonics of normalized frequency
//!    → decimate, integrate phase, interpolate back   (smooth phase track)
//!    → sin · sine_amp, voiced-gated, plus noise      [L, H+1]
//!    → Linear(H+1 → 1) → tanh                         excitation [1, 1, L]
//! ```
//!
//! Phase integration runs at the decimated rate in `f64` on the host, so long
//! utterances do not accumulate `f32` phase error.

use std::f64::consts::PI;

use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::config::SourceConfig;

/// Hold every sample `factor` times.
pub fn upsample_nearest(values: &[f32], factor: usize) -> Vec<f32> {
    values
        .iter()
        .flat_map(|&v| std::iter::repeat_n(v, factor))
        .collect()
}

/// Linear resampling with half-pixel centres (`align_corners = false`).
pub fn interpolate_linear(input: &[f64], out_len: usize) -> Vec<f64> {
    let in_len = input.len();
    if in_len == 0 {
        return vec![0.0; out_len];
    }
    let ratio = in_len as f64 / out_len.max(1) as f64;
    (0..out_len)
        .map(|i| {
            let src = ((i as f64 + 0.5) * ratio - 0.5).max(0.0);
            let lo = (src.floor() as usize).min(in_len - 1);
            let hi = (lo + 1).min(in_len - 1);
            let frac = src - lo as f64;
            input[lo] * (1.0 - frac) + input[hi] * frac
        })
        .collect()
}

/// Per-harmonic sine bank at audio rate.
#[derive(Debug, Clone)]
pub struct HarmonicBank {
    /// `sines[h][t]`, harmonic-major.
    pub sines: Vec<Vec<f32>>,
    pub voiced: Vec<bool>,
}

impl HarmonicBank {
    pub fn len(&self) -> usize {
        self.voiced.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voiced.is_empty()
    }

    /// Interleave into a `[L, H+1]` row-major buffer.
    fn interleaved(&self) -> Vec<f32> {
        let dim = self.sines.len();
        let mut out = vec![0f32; self.len() * dim];
        for (h, sine) in self.sines.iter().enumerate() {
            for (t, &v) in sine.iter().enumerate() {
                out[t * dim + h] = v;
            }
        }
        out
    }
}

/// Sine generator with voiced/unvoiced gating. Holds no weights.
#[derive(Debug, Clone)]
pub struct SineGenerator {
    config: SourceConfig,
    sample_rate: u32,
    upsample: usize,
}

impl SineGenerator {
    pub fn new(config: SourceConfig, sample_rate: u32, upsample: usize) -> Self {
        Self {
            config,
            sample_rate,
            upsample: upsample.max(1),
        }
    }

    pub fn harmonics(&self) -> usize {
        self.config.harmonic_num + 1
    }

    /// Phase track of one harmonic over `f0` (audio rate), radians.
    fn phase(&self, f0: &[f32], harmonic: usize, initial: f64) -> Vec<f64> {
        let sr = self.sample_rate as f64;
        let mut rad: Vec<f64> = f0
            .iter()
            .map(|&f| (f as f64 * harmonic as f64 / sr).rem_euclid(1.0))
            .collect();
        if let Some(first) = rad.first_mut() {
            *first += initial;
        }

        let decimated_len = f0.len() / self.upsample;
        let decimated = interpolate_linear(&rad, decimated_len);
        let scale = self.upsample as f64;
        let mut acc = 0.0;
        let integrated: Vec<f64> = decimated
            .iter()
            .map(|&r| {
                acc += r;
                acc * 2.0 * PI * scale
            })
            .collect();
        interpolate_linear(&integrated, f0.len())
    }

    /// `f0`: pitch in Hz at audio rate.
    pub fn generate(&self, f0: &[f32], rng: &mut ChaCha8Rng) -> HarmonicBank {
        let cfg = &self.config;
        let voiced: Vec<bool> = f0.iter().map(|&f| f > cfg.voiced_threshold).collect();
        let sine_amp = cfg.sine_amp as f64;
        let unvoiced_amp = sine_amp / 3.0;

        let sines = (0..self.harmonics())
            .map(|h| {
                // The fundamental keeps phase zero.
                let initial = if h == 0 {
                    0.0
                } else {
                    rng.sample::<f64, _>(StandardNormal)
                };
                let phase = self.phase(f0, h + 1, initial);
                phase
                    .iter()
                    .zip(&voiced)
                    .map(|(&p, &is_voiced)| {
                        let noise: f64 = rng.sample(StandardNormal);
                        let value = if is_voiced {
                            p.sin() * sine_amp + cfg.noise_std as f64 * noise
                        } else {
                            unvoiced_amp * noise
                        };
                        value as f32
                    })
                    .collect()
            })
            .collect();

        HarmonicBank { sines, voiced }
    }
}

/// Merged excitation and the separate noise channel, each `[1, 1, L]`.
#[derive(Debug, Clone)]
pub struct Excitation {
    pub harmonic: Tensor,
    pub noise: Tensor,
    pub voiced: Vec<bool>,
}

#[derive(Debug, Clone)]
pub struct HarmonicSource {
    sine_gen: SineGenerator,
    merge: Linear,
}

impl HarmonicSource {
    /// `vb` points at `m_source`; the merge layer is `l_linear`.
    pub fn new(config: SourceConfig, sample_rate: u32, upsample: usize, vb: VarBuilder) -> Result<Self> {
        let sine_gen = SineGenerator::new(config, sample_rate, upsample);
        let merge = candle_nn::linear(sine_gen.harmonics(), 1, vb.pp("l_linear"))?;
        Ok(Self { sine_gen, merge })
    }

    pub fn upsample(&self) -> usize {
        self.sine_gen.upsample
    }

    /// `f0: [1, N]` at generator-input rate → excitation at `N * upsample`
    /// samples.
    pub fn forward(&self, f0: &Tensor, rng: &mut ChaCha8Rng) -> Result<Excitation> {
        let device = f0.device();
        let dtype = self.merge.weight().dtype();
        let curve: Vec<f32> = f0.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
        let f0_audio = upsample_nearest(&curve, self.upsample());
        let len = f0_audio.len();

        let bank = self.sine_gen.generate(&f0_audio, rng);
        let dim = self.sine_gen.harmonics();
        let sines = Tensor::from_vec(bank.interleaved(), (1, len, dim), device)?.to_dtype(dtype)?;
        // [1, L, H+1] → [1, L, 1] → [1, 1, L]
        let harmonic = self.merge.forward(&sines)?.tanh()?.transpose(1, 2)?;

        let noise_amp = self.sine_gen.config.sine_amp as f64 / 3.0;
        let noise: Vec<f32> = (0..len)
            .map(|_| (noise_amp * rng.sample::<f64, _>(StandardNormal)) as f32)
            .collect();
        let noise = Tensor::from_vec(noise, (1, 1, len), device)?.to_dtype(dtype)?;

        tracing::trace!(
            samples = len,
            voiced = bank.voiced.iter().filter(|&&v| v).count(),
            "harmonic source"
        );
        Ok(Excitation {
            harmonic,
            noise,
            voiced: bank.voiced,
        })
    }
}
