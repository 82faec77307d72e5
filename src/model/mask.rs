//! Padding masks for token and frame axes.
//!
//! `true` marks a padded position. Padding is always trailing, so a mask is
//! fully described by its length and the number of valid leading positions;
//! the boolean form is kept because it is what callers hand in.

use candle_core::{Device, Tensor};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddingMask {
    padded: Vec<bool>,
}

impl PaddingMask {
    /// Build a mask from per-position flags (`true` = padded).
    ///
    /// Rejects masks with a valid position after a padded one.
    pub fn new(padded: Vec<bool>) -> Result<Self> {
        if let Some(first_pad) = padded.iter().position(|&p| p)
            && padded[first_pad..].iter().any(|&p| !p)
        {
            return Err(Error::InvalidInput(format!(
                "padding must be trailing, found a valid position after index {first_pad}"
            )));
        }
        Ok(Self { padded })
    }

    /// Mask with every position valid.
    pub fn all_valid(len: usize) -> Self {
        Self {
            padded: vec![false; len],
        }
    }

    /// Mask of `len` positions whose first `valid` entries are valid.
    pub fn with_valid_prefix(len: usize, valid: usize) -> Self {
        Self {
            padded: (0..len).map(|i| i >= valid).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.padded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.padded.is_empty()
    }

    /// Number of valid (unpadded) leading positions.
    pub fn valid_len(&self) -> usize {
        self.padded.iter().filter(|&&p| !p).count()
    }

    pub fn is_padded(&self, index: usize) -> bool {
        self.padded.get(index).copied().unwrap_or(true)
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.padded
    }

    /// Widen a token mask to a frame mask: frame `f` is padded iff the token
    /// owning it is padded. `durations` holds one run length per token.
    pub fn expand(&self, durations: &[u32]) -> Result<Self> {
        if durations.len() != self.len() {
            return Err(Error::NumericalInvariant(format!(
                "{} durations for a mask of {} tokens",
                durations.len(),
                self.len()
            )));
        }
        let padded = self
            .padded
            .iter()
            .zip(durations)
            .flat_map(|(&p, &d)| std::iter::repeat_n(p, d as usize))
            .collect();
        Ok(Self { padded })
    }

    /// Mask for a stage that doubled the time axis.
    pub fn upsampled(&self) -> Self {
        Self {
            padded: self.padded.iter().flat_map(|&p| [p, p]).collect(),
        }
    }

    /// Re-derive the mask for a tensor whose time axis is `len` long.
    ///
    /// Only the identity and the 2x upsample are legal transitions inside the
    /// prosody and decoder stacks; any other length means a stage broke the
    /// frame contract.
    pub fn resized_to(&self, len: usize) -> Result<Self> {
        if len == self.len() {
            Ok(self.clone())
        } else if len == 2 * self.len() {
            Ok(self.upsampled())
        } else {
            Err(Error::NumericalInvariant(format!(
                "time axis of length {len} cannot carry a mask of length {}",
                self.len()
            )))
        }
    }

    /// Keep-weights `[1, 1, T]` (1.0 valid, 0.0 padded) for `[B, C, T]` maps.
    pub fn channels_first(&self, device: &Device) -> candle_core::Result<Tensor> {
        self.keep_weights(device)?.reshape((1, 1, self.len()))
    }

    /// Keep-weights `[1, T, 1]` for `[B, T, C]` sequences.
    pub fn channels_last(&self, device: &Device) -> candle_core::Result<Tensor> {
        self.keep_weights(device)?.reshape((1, self.len(), 1))
    }

    fn keep_weights(&self, device: &Device) -> candle_core::Result<Tensor> {
        let keep: Vec<f32> = self
            .padded
            .iter()
            .map(|&p| if p { 0.0 } else { 1.0 })
            .collect();
        Tensor::from_vec(keep, self.len(), device)
    }
}

/// Zero padded positions of a `[B, C, T]` map.
pub fn mask_channels_first(xs: &Tensor, mask: &PaddingMask) -> candle_core::Result<Tensor> {
    xs.broadcast_mul(&mask.channels_first(xs.device())?.to_dtype(xs.dtype())?)
}

/// Zero padded positions of a `[B, T, C]` sequence.
pub fn mask_channels_last(xs: &Tensor, mask: &PaddingMask) -> candle_core::Result<Tensor> {
    xs.broadcast_mul(&mask.channels_last(xs.device())?.to_dtype(xs.dtype())?)
}
