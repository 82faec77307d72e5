//! Style modulation layers.
//!
//! Both layers project the style vector through a linear layer into
//! `[gamma, beta]` and apply `(1 + gamma) * normalized + beta`. They differ in
//! the axis they normalize over.

use candle_core::{D, Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

const NORM_EPS: f64 = 1e-5;

/// Per-channel normalization over the last (time) axis of `[B, C, T]`, no
/// affine parameters, biased variance.
pub fn instance_norm(xs: &Tensor, eps: f64) -> Result<Tensor> {
    let mean = xs.mean_keepdim(D::Minus1)?;
    let centered = xs.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
    centered.broadcast_div(&(var + eps)?.sqrt()?)
}

/// Split a `[B, 2C]` projection into `(1 + gamma, beta)`, both `[B, C]`.
fn gain_and_shift(h: &Tensor) -> Result<(Tensor, Tensor)> {
    let channels = h.dim(D::Minus1)? / 2;
    let gamma = h.narrow(D::Minus1, 0, channels)?;
    let beta = h.narrow(D::Minus1, channels, channels)?;
    Ok(((gamma + 1.0)?, beta))
}

// ---------------------------------------------------------------------------
// AdaIN1d: instance norm over time, modulated per channel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AdaIn1d {
    fc: Linear,
}

impl AdaIn1d {
    pub fn new(style_dim: usize, channels: usize, vb: VarBuilder) -> Result<Self> {
        let fc = candle_nn::linear(style_dim, 2 * channels, vb.pp("fc"))?;
        Ok(Self { fc })
    }

    /// `xs: [B, C, T]`, `style: [B, S]` → `[B, C, T]`.
    pub fn forward(&self, xs: &Tensor, style: &Tensor) -> Result<Tensor> {
        let (gain, beta) = gain_and_shift(&self.fc.forward(style)?)?;
        // Broadcast over time: [B, C] → [B, C, 1]
        let normalized = instance_norm(xs, NORM_EPS)?;
        normalized
            .broadcast_mul(&gain.unsqueeze(D::Minus1)?)?
            .broadcast_add(&beta.unsqueeze(D::Minus1)?)
    }
}

// ---------------------------------------------------------------------------
// AdaLayerNorm: layer norm over features, modulated per feature
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AdaLayerNorm {
    fc: Linear,
}

impl AdaLayerNorm {
    pub fn new(style_dim: usize, channels: usize, vb: VarBuilder) -> Result<Self> {
        let fc = candle_nn::linear(style_dim, 2 * channels, vb.pp("fc"))?;
        Ok(Self { fc })
    }

    /// `xs: [B, T, C]`, `style: [B, S]` → `[B, T, C]`.
    pub fn forward(&self, xs: &Tensor, style: &Tensor) -> Result<Tensor> {
        let (gain, beta) = gain_and_shift(&self.fc.forward(style)?)?;
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normalized = centered.broadcast_div(&(var + NORM_EPS)?.sqrt()?)?;
        // [B, C] → [B, 1, C]
        normalized
            .broadcast_mul(&gain.unsqueeze(1)?)?
            .broadcast_add(&beta.unsqueeze(1)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use std::collections::HashMap;

    #[test]
    fn test_instance_norm_statistics() {
        let dev = Device::Cpu;
        let xs = (Tensor::randn(0f32, 3.0, (2, 4, 64), &dev).unwrap() + 5.0).unwrap();
        let ys = instance_norm(&xs, 1e-5).unwrap();
        let means: Vec<Vec<f32>> = ys.mean(D::Minus1).unwrap().to_vec2().unwrap();
        let vars: Vec<Vec<f32>> = ys.sqr().unwrap().mean(D::Minus1).unwrap().to_vec2().unwrap();
        for (m, v) in means.iter().flatten().zip(vars.iter().flatten()) {
            assert!(m.abs() < 1e-4, "mean {m}");
            assert!((v - 1.0).abs() < 1e-3, "variance {v}");
        }
    }

    #[test]
    fn test_adain_zero_projection_is_plain_norm() {
        // fc = 0 gives gamma = beta = 0, so the output is the normalized input.
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let adain = AdaIn1d::new(8, 3, vb.pp("norm")).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (1, 3, 20), &dev).unwrap();
        let style = Tensor::randn(0f32, 1.0, (1, 8), &dev).unwrap();
        let ys = adain.forward(&xs, &style).unwrap();
        let expected = instance_norm(&xs, NORM_EPS).unwrap();
        let diff: f32 = (ys - expected)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_adain_applies_gain_and_shift() {
        let dev = Device::Cpu;
        // style width 1, one channel: fc weight [2, 1] = [[1], [0]], bias [0, 2]
        // → gamma = s, beta = 2.
        let mut tensors = HashMap::new();
        tensors.insert(
            "norm.fc.weight".to_string(),
            Tensor::new(&[[1f32], [0.0]], &dev).unwrap(),
        );
        tensors.insert(
            "norm.fc.bias".to_string(),
            Tensor::new(&[0f32, 2.0], &dev).unwrap(),
        );
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &dev);
        let adain = AdaIn1d::new(1, 1, vb.pp("norm")).unwrap();
        let xs = Tensor::new(&[[[1f32, 3.0]]], &dev).unwrap();
        let style = Tensor::new(&[[1f32]], &dev).unwrap();
        let ys: Vec<f32> = adain
            .forward(&xs, &style)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        // normalized ≈ [-1, 1]; (1 + 1) * n + 2 ≈ [0, 4]
        assert!((ys[0] - 0.0).abs() < 1e-3, "{ys:?}");
        assert!((ys[1] - 4.0).abs() < 1e-3, "{ys:?}");
    }

    #[test]
    fn test_ada_layer_norm_shape() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let norm = AdaLayerNorm::new(8, 16, vb.pp("ln")).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (1, 5, 16), &dev).unwrap();
        let style = Tensor::randn(0f32, 1.0, (1, 8), &dev).unwrap();
        assert_eq!(norm.forward(&xs, &style).unwrap().dims(), &[1, 5, 16]);
    }
}
