//! Weight-normalized 1-D convolutions.
//!
//! The effective kernel is rebuilt once at load time as `g * v / ||v||`, where
//! the L2 norm runs over every axis except axis 0. For a standard convolution
//! axis 0 is the output channel (`v: [out, in/groups, k]`); for a transposed
//! one it is the input channel (`v: [in, out/groups, k]`), which is the
//! PyTorch layout the weights are stored in.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Init, VarBuilder};

/// How the reconstructed kernel is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvStrategy {
    Standard,
    Transposed { output_padding: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct WeightNormConfig {
    pub padding: usize,
    pub stride: usize,
    pub dilation: usize,
    pub groups: usize,
    pub bias: bool,
    pub strategy: ConvStrategy,
}

impl Default for WeightNormConfig {
    fn default() -> Self {
        Self {
            padding: 0,
            stride: 1,
            dilation: 1,
            groups: 1,
            bias: true,
            strategy: ConvStrategy::Standard,
        }
    }
}

impl WeightNormConfig {
    /// Kernel `k` with dilation `d`, padded to keep the length unchanged.
    pub fn same(kernel_size: usize, dilation: usize) -> Self {
        Self {
            padding: (kernel_size * dilation - dilation) / 2,
            dilation,
            ..Default::default()
        }
    }

    pub fn transposed(stride: usize, padding: usize) -> Self {
        Self {
            stride,
            padding,
            strategy: ConvStrategy::Transposed { output_padding: 0 },
            ..Default::default()
        }
    }
}

/// Rebuild a kernel from its magnitude `g: [d0, 1, 1]` and direction `v`.
pub fn weight_norm(weight_g: &Tensor, weight_v: &Tensor) -> Result<Tensor> {
    let dims: Vec<usize> = (1..weight_v.rank()).collect();
    let norm_v = weight_v.sqr()?.sum_keepdim(dims)?.sqrt()?;
    weight_v.broadcast_mul(&weight_g.broadcast_div(&norm_v)?)
}

#[derive(Debug, Clone)]
pub struct WeightNormConv1d {
    weight: Tensor,
    bias: Option<Tensor>,
    config: WeightNormConfig,
}

impl WeightNormConv1d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        config: WeightNormConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let groups = config.groups.max(1);
        let shape = match config.strategy {
            ConvStrategy::Standard => (out_channels, in_channels / groups, kernel_size),
            ConvStrategy::Transposed { .. } => (in_channels, out_channels / groups, kernel_size),
        };
        let weight_v = vb.get_with_hints(shape, "weight_v", candle_nn::init::DEFAULT_KAIMING_NORMAL)?;
        let weight_g = vb.get_with_hints((shape.0, 1, 1), "weight_g", Init::Const(1.0))?;
        let weight = weight_norm(&weight_g, &weight_v)?;
        let bias = if config.bias {
            Some(vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?)
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            config: WeightNormConfig { groups, ..config },
        })
    }

    /// The reconstructed kernel.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

impl Module for WeightNormConv1d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let cfg = &self.config;
        let ys = match cfg.strategy {
            ConvStrategy::Standard => {
                xs.conv1d(&self.weight, cfg.padding, cfg.stride, cfg.dilation, cfg.groups)?
            }
            ConvStrategy::Transposed { output_padding } => xs.conv_transpose1d(
                &self.weight,
                cfg.padding,
                output_padding,
                cfg.stride,
                cfg.dilation,
                cfg.groups,
            )?,
        };
        match &self.bias {
            // [C] → [1, C, 1]
            Some(bias) => ys.broadcast_add(&bias.reshape((1, (), 1))?),
            None => Ok(ys),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use std::collections::HashMap;

    #[test]
    fn test_unit_norm_direction_is_kept() {
        // When ||v|| == g per output channel, the kernel is v itself.
        let dev = Device::Cpu;
        let v = Tensor::randn(0f32, 1.0, (4, 3, 5), &dev).unwrap();
        let g = v.sqr().unwrap().sum_keepdim((1, 2)).unwrap().sqrt().unwrap();
        let w = weight_norm(&g, &v).unwrap();
        let diff: f32 = (&w - &v)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-6, "reconstruction drifted by {diff}");
    }

    #[test]
    fn test_magnitude_sets_channel_norm() {
        let dev = Device::Cpu;
        let v = Tensor::randn(0f32, 1.0, (2, 3, 3), &dev).unwrap();
        let g = Tensor::new(&[[[2f32]], [[0.5]]], &dev).unwrap();
        let w = weight_norm(&g, &v).unwrap();
        let norms: Vec<f32> = w
            .sqr()
            .unwrap()
            .sum((1, 2))
            .unwrap()
            .sqrt()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!((norms[0] - 2.0).abs() < 1e-5);
        assert!((norms[1] - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_loads_named_tensors() {
        let dev = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert(
            "conv.weight_v".to_string(),
            Tensor::ones((2, 1, 1), DType::F32, &dev).unwrap(),
        );
        tensors.insert(
            "conv.weight_g".to_string(),
            Tensor::new(&[[[3f32]], [[-1.0]]], &dev).unwrap(),
        );
        tensors.insert(
            "conv.bias".to_string(),
            Tensor::new(&[0.5f32, 0.0], &dev).unwrap(),
        );
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &dev);
        let conv = WeightNormConv1d::new(1, 2, 1, Default::default(), vb.pp("conv")).unwrap();
        let xs = Tensor::new(&[[[1f32, 2.0]]], &dev).unwrap();
        let ys: Vec<Vec<f32>> = conv.forward(&xs).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(ys, vec![vec![3.5, 6.5], vec![-1.0, -2.0]]);
    }

    #[test]
    fn test_shape_mismatch_fails_at_construction() {
        let dev = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert(
            "conv.weight_v".to_string(),
            Tensor::ones((4, 3, 3), DType::F32, &dev).unwrap(),
        );
        tensors.insert(
            "conv.weight_g".to_string(),
            Tensor::ones((4, 1, 1), DType::F32, &dev).unwrap(),
        );
        tensors.insert(
            "conv.bias".to_string(),
            Tensor::zeros(4, DType::F32, &dev).unwrap(),
        );
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &dev);
        assert!(WeightNormConv1d::new(5, 4, 3, Default::default(), vb.pp("conv")).is_err());
    }

    #[test]
    fn test_same_padding_keeps_length() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let conv = WeightNormConv1d::new(4, 6, 7, WeightNormConfig::same(7, 3), vb).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (1, 4, 40), &dev).unwrap();
        assert_eq!(conv.forward(&xs).unwrap().dims(), &[1, 6, 40]);
    }

    #[test]
    fn test_transposed_upsamples() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        // stride 10, kernel 20, pad 5: exact x10.
        let conv = WeightNormConv1d::new(8, 4, 20, WeightNormConfig::transposed(10, 5), vb).unwrap();
        assert_eq!(conv.weight().dims(), &[8, 4, 20]);
        let xs = Tensor::randn(0f32, 1.0, (1, 8, 7), &dev).unwrap();
        assert_eq!(conv.forward(&xs).unwrap().dims(), &[1, 4, 70]);
    }

    #[test]
    fn test_depthwise_transposed_pool() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let cfg = WeightNormConfig {
            groups: 6,
            ..WeightNormConfig::transposed(2, 1)
        };
        let conv = WeightNormConv1d::new(6, 6, 3, cfg, vb).unwrap();
        assert_eq!(conv.weight().dims(), &[6, 1, 3]);
        let xs = Tensor::randn(0f32, 1.0, (1, 6, 9), &dev).unwrap();
        // (9 - 1) * 2 - 2 + 3 = 17
        assert_eq!(conv.forward(&xs).unwrap().dims(), &[1, 6, 17]);
    }
}
