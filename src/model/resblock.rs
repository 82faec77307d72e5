//! Style-conditioned residual block (`AdainResBlk1d` in the reference
//! weights), shared by the prosody predictor and the decoder.
//!
//! ```text
//! residual: AdaIN → LeakyReLU(0.2) → [pool ×2] → conv3 → AdaIN → LeakyReLU(0.2) → conv3
//! shortcut: [nearest ×2] → [conv1x1, no bias]
//! out = (residual + shortcut) / √2
//! ```
//!
//! The pool is a depthwise transposed convolution (kernel 3, stride 2,
//! padding 1). It yields `2T - 1` steps; one zero step on the left restores
//! `2T`.

use candle_core::{D, Module, Result, Tensor};
use candle_nn::VarBuilder;

use super::adain::AdaIn1d;
use super::conv::{WeightNormConfig, WeightNormConv1d};

const LEAKY_SLOPE: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resample {
    None,
    Double,
}

pub fn leaky_relu(xs: &Tensor, slope: f64) -> Result<Tensor> {
    candle_nn::ops::leaky_relu(xs, slope)
}

#[derive(Debug, Clone)]
pub struct ConditionalResBlock {
    norm1: AdaIn1d,
    conv1: WeightNormConv1d,
    norm2: AdaIn1d,
    conv2: WeightNormConv1d,
    pool: Option<WeightNormConv1d>,
    conv1x1: Option<WeightNormConv1d>,
    resample: Resample,
    dim_out: usize,
}

impl ConditionalResBlock {
    pub fn new(
        dim_in: usize,
        dim_out: usize,
        style_dim: usize,
        resample: Resample,
        vb: VarBuilder,
    ) -> Result<Self> {
        let norm1 = AdaIn1d::new(style_dim, dim_in, vb.pp("norm1"))?;
        let norm2 = AdaIn1d::new(style_dim, dim_out, vb.pp("norm2"))?;
        let conv1 = WeightNormConv1d::new(dim_in, dim_out, 3, WeightNormConfig::same(3, 1), vb.pp("conv1"))?;
        let conv2 = WeightNormConv1d::new(dim_out, dim_out, 3, WeightNormConfig::same(3, 1), vb.pp("conv2"))?;

        let pool = match resample {
            Resample::None => None,
            Resample::Double => {
                let cfg = WeightNormConfig {
                    groups: dim_in,
                    ..WeightNormConfig::transposed(2, 1)
                };
                Some(WeightNormConv1d::new(dim_in, dim_in, 3, cfg, vb.pp("pool"))?)
            }
        };
        let conv1x1 = if dim_in != dim_out {
            let cfg = WeightNormConfig {
                bias: false,
                ..Default::default()
            };
            Some(WeightNormConv1d::new(dim_in, dim_out, 1, cfg, vb.pp("conv1x1"))?)
        } else {
            None
        };

        Ok(Self {
            norm1,
            conv1,
            norm2,
            conv2,
            pool,
            conv1x1,
            resample,
            dim_out,
        })
    }

    pub fn resample(&self) -> Resample {
        self.resample
    }

    pub fn dim_out(&self) -> usize {
        self.dim_out
    }

    fn shortcut(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = match self.resample {
            Resample::None => xs.clone(),
            Resample::Double => xs.upsample_nearest1d(2 * xs.dim(D::Minus1)?)?,
        };
        match &self.conv1x1 {
            Some(conv) => conv.forward(&xs),
            None => Ok(xs),
        }
    }

    fn residual(&self, xs: &Tensor, style: &Tensor) -> Result<Tensor> {
        let mut h = leaky_relu(&self.norm1.forward(xs, style)?, LEAKY_SLOPE)?;
        if let Some(pool) = &self.pool {
            // [B, C, 2T - 1] → [B, C, 2T]
            h = pool.forward(&h)?.pad_with_zeros(D::Minus1, 1, 0)?;
        }
        let h = self.conv1.forward(&h)?;
        let h = leaky_relu(&self.norm2.forward(&h, style)?, LEAKY_SLOPE)?;
        self.conv2.forward(&h)
    }

    /// `xs: [B, dim_in, T]`, `style: [B, S]` → `[B, dim_out, T']` with
    /// `T' = 2T` when upsampling.
    pub fn forward(&self, xs: &Tensor, style: &Tensor) -> Result<Tensor> {
        let out = (self.residual(xs, style)? + self.shortcut(xs)?)?;
        out / std::f64::consts::SQRT_2
    }
}
