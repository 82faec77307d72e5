//! Pitch (F0) and voicing (N) prediction.
//!
//! ```text
//! en [1, hidden + S, F] → shared BiLSTM → [1, hidden, F]
//!   ├→ F0: block(h→h) → block(h→h/2, ×2) → block(h/2→h/2) → conv1x1 → [1, 2F]
//!   └→ N:  block(h→h) → block(h→h/2, ×2) → block(h/2→h/2) → conv1x1 → [1, 2F]
//! ```
//!
//! The frame mask is re-derived from the tensor length after every block, so
//! the doubling in the middle block widens it explicitly.

use candle_core::{D, Module, Tensor};
use candle_nn::{Conv1d, VarBuilder};

use super::lstm::BiLstm;
use super::mask::{PaddingMask, mask_channels_first};
use super::resblock::{ConditionalResBlock, Resample};
use crate::Result;

#[derive(Debug, Clone)]
struct ProsodyBranch {
    blocks: Vec<ConditionalResBlock>,
    proj: Conv1d,
}

impl ProsodyBranch {
    fn new(hidden: usize, style_dim: usize, vb: VarBuilder, proj_vb: VarBuilder) -> candle_core::Result<Self> {
        let half = hidden / 2;
        let blocks = vec![
            ConditionalResBlock::new(hidden, hidden, style_dim, Resample::None, vb.pp(0))?,
            ConditionalResBlock::new(hidden, half, style_dim, Resample::Double, vb.pp(1))?,
            ConditionalResBlock::new(half, half, style_dim, Resample::None, vb.pp(2))?,
        ];
        let proj = candle_nn::conv1d(half, 1, 1, Default::default(), proj_vb)?;
        Ok(Self { blocks, proj })
    }

    /// `[1, hidden, F]` → `[1, 2F]`
    fn forward(&self, xs: &Tensor, style: &Tensor, mask: &PaddingMask) -> Result<Tensor> {
        let mut x = xs.clone();
        let mut mask = mask.clone();
        for block in &self.blocks {
            x = block.forward(&x, style)?;
            mask = mask.resized_to(x.dim(D::Minus1)?)?;
            x = mask_channels_first(&x, &mask)?;
        }
        let curve = self.proj.forward(&x)?;
        let curve = mask_channels_first(&curve, &mask)?;
        Ok(curve.squeeze(1)?)
    }
}

#[derive(Debug, Clone)]
pub struct ProsodyPredictor {
    shared: BiLstm,
    f0: ProsodyBranch,
    n: ProsodyBranch,
}

/// Frame-rate prosody curves, each `[1, 2F]`.
#[derive(Debug, Clone)]
pub struct ProsodyCurves {
    pub f0: Tensor,
    pub n: Tensor,
}

impl ProsodyPredictor {
    /// `vb` is the predictor root: `shared.*`, `F0.{0,1,2}`, `N.{0,1,2}`,
    /// `F0_proj`, `N_proj`.
    pub fn new(hidden: usize, style_dim: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let shared = BiLstm::new(hidden + style_dim, hidden / 2, vb.pp("shared"))?;
        let f0 = ProsodyBranch::new(hidden, style_dim, vb.pp("F0"), vb.pp("F0_proj"))?;
        let n = ProsodyBranch::new(hidden, style_dim, vb.pp("N"), vb.pp("N_proj"))?;
        Ok(Self { shared, f0, n })
    }

    /// `en: [1, hidden + S, F]` frame features, `style: [1, S]` prosodic style,
    /// `frame_mask` of length `F`.
    pub fn forward(&self, en: &Tensor, style: &Tensor, frame_mask: &PaddingMask) -> Result<ProsodyCurves> {
        let frames = en.dim(D::Minus1)?;
        if frame_mask.len() != frames {
            return Err(crate::Error::NumericalInvariant(format!(
                "frame mask covers {} frames, features have {frames}",
                frame_mask.len()
            )));
        }
        // [1, F, hidden + S] → [1, F, hidden] → [1, hidden, F]
        let x = self.shared.forward_masked(&en.transpose(1, 2)?, frame_mask)?;
        let x = mask_channels_first(&x.transpose(1, 2)?, frame_mask)?;

        let f0 = self.f0.forward(&x, style, frame_mask)?;
        let n = self.n.forward(&x, style, frame_mask)?;
        tracing::trace!(frames, curve_len = f0.dim(D::Minus1)?, "prosody curves");
        Ok(ProsodyCurves { f0, n })
    }
}
