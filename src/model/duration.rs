//! Duration prediction and phoneme → frame alignment.
//!
//! ```text
//! d_en [B, hidden, T] ──┐
//!  style ───────────────┼→ DurationEncoder → d [B, T, hidden + style]
//!                       │    (n_layer × { BiLSTM, AdaLayerNorm }, style re-concatenated
//!                       │     and padding re-masked after every norm)
//!                       └→ BiLSTM → Linear(max_dur) → Σ sigmoid / speed → round → ≥ 1
//! ```
//!
//! Every LSTM runs over the valid token prefix only. Padded tokens get no
//! duration. The durations of the valid tokens define an [`Alignment`], a
//! one-hot `[T, frames]` matrix; expansion onto the frame axis gathers
//! columns by owning token instead of multiplying by the dense matrix.

use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use super::adain::AdaLayerNorm;
use super::lstm::BiLstm;
use super::mask::{PaddingMask, mask_channels_last};
use crate::{Error, Result};

// ---------------------------------------------------------------------------
// DurationEncoder
// ---------------------------------------------------------------------------

/// One stage of the duration encoder.
#[derive(Debug, Clone)]
enum EncoderStage {
    Recurrent(BiLstm),
    StyleNorm(AdaLayerNorm),
}

/// Alternating BiLSTM / AdaLayerNorm stack over phoneme features.
///
/// Weight keys: `lstms.{2i}` for the LSTM and `lstms.{2i+1}.fc` for the norm.
#[derive(Debug, Clone)]
pub struct DurationEncoder {
    stages: Vec<EncoderStage>,
}

impl DurationEncoder {
    pub fn new(
        d_model: usize,
        style_dim: usize,
        n_layers: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let vb = vb.pp("lstms");
        let mut stages = Vec::with_capacity(2 * n_layers);
        for layer in 0..n_layers {
            let lstm = BiLstm::new(d_model + style_dim, d_model / 2, vb.pp(2 * layer))?;
            stages.push(EncoderStage::Recurrent(lstm));
            let norm = AdaLayerNorm::new(style_dim, d_model, vb.pp(2 * layer + 1))?;
            stages.push(EncoderStage::StyleNorm(norm));
        }
        Ok(Self { stages })
    }

    /// `d_en: [1, d_model, T]`, `style: [1, S]` → `[1, T, d_model + S]`.
    ///
    /// Recurrent stages only see the valid prefix; their outputs are
    /// zero-padded back to `T`.
    pub fn forward(
        &self,
        d_en: &Tensor,
        style: &Tensor,
        mask: &PaddingMask,
    ) -> candle_core::Result<Tensor> {
        let (b, _, t) = d_en.dims3()?;
        let style_seq = style.unsqueeze(1)?.broadcast_as((b, t, style.dim(D::Minus1)?))?;

        // [B, T, d_model + S]
        let mut x = Tensor::cat(&[&d_en.transpose(1, 2)?, &style_seq], D::Minus1)?;
        x = mask_channels_last(&x, mask)?;

        for stage in &self.stages {
            x = match stage {
                EncoderStage::Recurrent(lstm) => lstm.forward_masked(&x, mask)?,
                EncoderStage::StyleNorm(norm) => {
                    let ys = norm.forward(&x, style)?;
                    let ys = Tensor::cat(&[&ys, &style_seq], D::Minus1)?;
                    mask_channels_last(&ys, mask)?
                }
            };
        }
        Ok(x)
    }
}

// ---------------------------------------------------------------------------
// DurationAligner
// ---------------------------------------------------------------------------

/// Predicts an integer frame count per token.
#[derive(Debug, Clone)]
pub struct DurationAligner {
    lstm: BiLstm,
    proj: Linear,
}

impl DurationAligner {
    /// `vb` is the predictor root: loads `lstm.*` and `duration_proj.linear_layer.*`.
    pub fn new(
        d_model: usize,
        style_dim: usize,
        max_dur: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let lstm = BiLstm::new(d_model + style_dim, d_model / 2, vb.pp("lstm"))?;
        let proj = candle_nn::linear(d_model, max_dur, vb.pp("duration_proj").pp("linear_layer"))?;
        Ok(Self { lstm, proj })
    }

    /// Expected duration per token before rounding: Σ sigmoid(logits) / speed.
    ///
    /// `d: [1, T, d_model + S]` → one value per valid token. The LSTM only
    /// sees the valid prefix and padded tokens get no duration, so they never
    /// occupy frames.
    pub fn expected_durations(&self, d: &Tensor, mask: &PaddingMask, speed: f32) -> Result<Vec<f32>> {
        if !(speed.is_finite() && speed > 0.0) {
            return Err(Error::InvalidInput(format!("speed must be positive, got {speed}")));
        }
        let x = self.lstm.forward_masked(d, mask)?;
        let x = x.narrow(1, 0, mask.valid_len())?;
        let logits = self.proj.forward(&x)?;
        let expected = (candle_nn::ops::sigmoid(&logits)?.sum(D::Minus1)? / speed as f64)?;
        Ok(expected.squeeze(0)?.to_dtype(DType::F32)?.to_vec1()?)
    }

    /// Integer durations: round half away from zero, clamp to at least 1.
    pub fn predict(&self, d: &Tensor, mask: &PaddingMask, speed: f32) -> Result<Vec<u32>> {
        let expected = self.expected_durations(d, mask, speed)?;
        Ok(quantize_durations(&expected))
    }
}

/// Round each expected duration (half away from zero) and clamp to ≥ 1 frame.
pub fn quantize_durations(expected: &[f32]) -> Vec<u32> {
    expected
        .iter()
        .map(|&v| {
            let rounded = v.round();
            if rounded.is_finite() && rounded >= 1.0 {
                rounded as u32
            } else {
                1
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Alignment
// ---------------------------------------------------------------------------

/// Token → frame assignment: token `i` owns `durations[i]` consecutive frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alignment {
    durations: Vec<u32>,
    /// Exclusive end frame of each token's run.
    ends: Vec<usize>,
}

impl Alignment {
    pub fn from_durations(durations: Vec<u32>) -> Result<Self> {
        if durations.is_empty() {
            return Err(Error::NumericalInvariant("alignment needs at least one token".into()));
        }
        if let Some(i) = durations.iter().position(|&d| d == 0) {
            return Err(Error::NumericalInvariant(format!(
                "token {i} has a zero-length duration"
            )));
        }
        let ends = durations
            .iter()
            .scan(0usize, |acc, &d| {
                *acc += d as usize;
                Some(*acc)
            })
            .collect();
        Ok(Self { durations, ends })
    }

    pub fn durations(&self) -> &[u32] {
        &self.durations
    }

    pub fn tokens(&self) -> usize {
        self.durations.len()
    }

    pub fn frames(&self) -> usize {
        self.ends.last().copied().unwrap_or(0)
    }

    /// Token owning frame `f`.
    pub fn token_at(&self, frame: usize) -> Option<usize> {
        if frame >= self.frames() {
            return None;
        }
        Some(self.ends.partition_point(|&end| end <= frame))
    }

    /// Row-major one-hot values, `[tokens, frames]`.
    pub fn one_hot(&self) -> Vec<f32> {
        let frames = self.frames();
        let mut values = vec![0f32; self.tokens() * frames];
        let mut start = 0;
        for (token, &end) in self.ends.iter().enumerate() {
            for frame in start..end {
                values[token * frames + frame] = 1.0;
            }
            start = end;
        }
        values
    }

    /// One-hot matrix `[tokens, frames]`.
    pub fn to_tensor(&self, dtype: DType, device: &Device) -> candle_core::Result<Tensor> {
        Tensor::from_vec(self.one_hot(), (self.tokens(), self.frames()), device)?.to_dtype(dtype)
    }

    /// Owning token of every frame, in frame order.
    pub fn frame_tokens(&self) -> Vec<u32> {
        self.durations
            .iter()
            .enumerate()
            .flat_map(|(token, &d)| std::iter::repeat_n(token as u32, d as usize))
            .collect()
    }

    /// Expand token features `[B, C, T]` to frame features `[B, C, frames]`.
    ///
    /// Equivalent to multiplying by the one-hot matrix, but gathers columns
    /// instead of materializing `[T, frames]`.
    pub fn expand(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let tokens = xs.dim(D::Minus1)?;
        if tokens != self.tokens() {
            candle_core::bail!("alignment covers {} tokens, features have {tokens}", self.tokens());
        }
        let frames = self.frames();
        let index = Tensor::from_vec(self.frame_tokens(), frames, xs.device())?;
        xs.contiguous()?.index_select(&index, 2)
    }

    /// Re-check the matrix contract from the run boundaries: every token owns
    /// a contiguous run of `durations[i] >= 1` frames, runs follow each other
    /// without gaps or overlaps (so every column is one-hot), and the total
    /// equals `frames`.
    pub fn verify(&self) -> Result<()> {
        if self.ends.len() != self.durations.len() {
            return Err(Error::NumericalInvariant(format!(
                "{} run boundaries for {} tokens",
                self.ends.len(),
                self.durations.len()
            )));
        }
        let mut start = 0usize;
        for (token, (&duration, &end)) in self.durations.iter().zip(&self.ends).enumerate() {
            if duration < 1 {
                return Err(Error::NumericalInvariant(format!(
                    "token {token} has a zero-length duration"
                )));
            }
            if end != start + duration as usize {
                return Err(Error::NumericalInvariant(format!(
                    "token {token} owns frames {start}..{end}, expected a contiguous run of {duration}"
                )));
            }
            start = end;
        }
        let total: usize = self.durations.iter().map(|&d| d as usize).sum();
        if total != self.frames() {
            return Err(Error::NumericalInvariant(format!(
                "durations sum to {total} but alignment has {} frames",
                self.frames()
            )));
        }
        Ok(())
    }
}
