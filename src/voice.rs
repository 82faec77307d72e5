//! Voice packs and style vectors.
//!
//! A voice pack holds one `2 * style_dim` style vector per utterance length:
//! row `n - 1` is tuned for utterances of `n` phonemes. The first half of a
//! style vector conditions the decoder (acoustic), the second half the
//! duration and prosody predictors (prosodic).

use std::path::Path;

use candle_core::{D, Device, Tensor};

use crate::{Error, Result};

/// One utterance's style, `[1, 2 * style_dim]`.
#[derive(Debug, Clone)]
pub struct StyleVector {
    full: Tensor,
    style_dim: usize,
}

impl StyleVector {
    /// Accepts `[2S]` or `[1, 2S]`.
    pub fn new(tensor: Tensor, style_dim: usize) -> Result<Self> {
        let full = match tensor.rank() {
            1 => tensor.unsqueeze(0)?,
            2 if tensor.dim(0)? == 1 => tensor,
            _ => {
                return Err(Error::InvalidInput(format!(
                    "style vector must be [2S] or [1, 2S], got {:?}",
                    tensor.dims()
                )));
            }
        };
        let width = full.dim(D::Minus1)?;
        if width != 2 * style_dim {
            return Err(Error::InvalidInput(format!(
                "style vector has width {width}, expected {}",
                2 * style_dim
            )));
        }
        Ok(Self { full, style_dim })
    }

    pub fn from_vec(values: Vec<f32>, style_dim: usize, device: &Device) -> Result<Self> {
        let len = values.len();
        Self::new(Tensor::from_vec(values, len, device)?, style_dim)
    }

    pub fn style_dim(&self) -> usize {
        self.style_dim
    }

    /// The whole vector, `[1, 2S]`.
    pub fn as_tensor(&self) -> &Tensor {
        &self.full
    }

    /// Decoder half, `[1, S]`.
    pub fn acoustic(&self) -> Result<Tensor> {
        Ok(self.full.narrow(D::Minus1, 0, self.style_dim)?)
    }

    /// Duration/prosody half, `[1, S]`.
    pub fn prosodic(&self) -> Result<Tensor> {
        Ok(self.full.narrow(D::Minus1, self.style_dim, self.style_dim)?)
    }
}

/// Length-indexed table of style vectors, `[N, 2S]`.
#[derive(Debug, Clone)]
pub struct VoicePack {
    styles: Tensor,
    style_dim: usize,
}

impl VoicePack {
    /// Accepts `[N, 2S]` or `[N, 1, 2S]`.
    pub fn new(tensor: Tensor, style_dim: usize) -> Result<Self> {
        let dims = tensor.dims().to_vec();
        let styles = match dims.as_slice() {
            &[_, w] if w == 2 * style_dim => tensor,
            &[_, 1, w] if w == 2 * style_dim => tensor.squeeze(1)?,
            _ => {
                return Err(Error::WeightLoad(format!(
                    "voice pack must be [N, {w}] or [N, 1, {w}], got {dims:?}",
                    w = 2 * style_dim
                )));
            }
        };
        if styles.dim(0)? == 0 {
            return Err(Error::WeightLoad("voice pack is empty".to_string()));
        }
        Ok(Self { styles, style_dim })
    }

    /// Load the single tensor of a `.safetensors` voice file.
    pub fn load(path: impl AsRef<Path>, style_dim: usize, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, device)
            .map_err(|e| Error::WeightLoad(format!("voice pack {}: {e}", path.display())))?;
        let mut tensors = tensors.into_values();
        let tensor = match (tensors.next(), tensors.next()) {
            (Some(t), None) => t,
            _ => {
                return Err(Error::WeightLoad(format!(
                    "voice pack {} must contain exactly one tensor",
                    path.display()
                )));
            }
        };
        let pack = Self::new(tensor.to_dtype(candle_core::DType::F32)?, style_dim)?;
        tracing::debug!(path = %path.display(), entries = pack.len(), "loaded voice pack");
        Ok(pack)
    }

    pub fn len(&self) -> usize {
        self.styles.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row used for an utterance of `phonemes` phonemes (boundary tokens
    /// excluded).
    pub fn index_for(&self, phonemes: usize) -> usize {
        phonemes.clamp(1, self.len()) - 1
    }

    pub fn select(&self, phonemes: usize) -> Result<StyleVector> {
        let row = self.styles.narrow(0, self.index_for(phonemes), 1)?;
        StyleVector::new(row, self.style_dim)
    }
}
