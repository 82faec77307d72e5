//! Acoustic text encoder: phoneme ids → `[1, hidden, T]` features for the
//! decoder.
//!
//! ```text
//! ids → Embedding → n_layer × { WN-Conv(k) → LayerNorm(C) → LeakyReLU(0.2) } → BiLSTM
//! ```
//!
//! Padding is re-zeroed after every stage.

use candle_core::{D, Module, Tensor};
use candle_nn::{Embedding, LayerNorm, VarBuilder};

use super::conv::{WeightNormConfig, WeightNormConv1d};
use super::lstm::BiLstm;
use super::mask::{PaddingMask, mask_channels_first};
use super::resblock::leaky_relu;

#[derive(Debug, Clone)]
struct ConvLayer {
    conv: WeightNormConv1d,
    norm: LayerNorm,
}

impl ConvLayer {
    fn new(channels: usize, kernel_size: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let cfg = WeightNormConfig::same(kernel_size, 1);
        let conv = WeightNormConv1d::new(channels, channels, kernel_size, cfg, vb.pp(0))?;
        let norm_vb = vb.pp(1);
        let gamma = norm_vb.get_with_hints(channels, "gamma", candle_nn::Init::Const(1.0))?;
        let beta = norm_vb.get_with_hints(channels, "beta", candle_nn::Init::Const(0.0))?;
        Ok(Self {
            conv,
            norm: LayerNorm::new(gamma, beta, 1e-5),
        })
    }

    fn forward(&self, xs: &Tensor, mask: &PaddingMask) -> candle_core::Result<Tensor> {
        let x = mask_channels_first(&self.conv.forward(xs)?, mask)?;
        // LayerNorm over channels: [B, C, T] → [B, T, C] → [B, C, T]
        let x = self.norm.forward(&x.transpose(1, 2)?)?.transpose(1, 2)?;
        let x = mask_channels_first(&x, mask)?;
        mask_channels_first(&leaky_relu(&x, 0.2)?, mask)
    }
}

#[derive(Debug, Clone)]
pub struct TextEncoder {
    embedding: Embedding,
    cnn: Vec<ConvLayer>,
    lstm: BiLstm,
}

impl TextEncoder {
    pub fn new(
        n_token: usize,
        channels: usize,
        kernel_size: usize,
        depth: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let embedding = candle_nn::embedding(n_token, channels, vb.pp("embedding"))?;
        let cnn = (0..depth)
            .map(|i| ConvLayer::new(channels, kernel_size, vb.pp("cnn").pp(i)))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let lstm = BiLstm::new(channels, channels / 2, vb.pp("lstm"))?;
        Ok(Self {
            embedding,
            cnn,
            lstm,
        })
    }

    /// `ids: [1, T]` (u32) → `[1, channels, T]`.
    pub fn forward(&self, ids: &Tensor, mask: &PaddingMask) -> candle_core::Result<Tensor> {
        // [1, T, C] → [1, C, T]
        let mut x = self.embedding.forward(ids)?.transpose(1, 2)?;
        x = mask_channels_first(&x, mask)?;
        for layer in &self.cnn {
            x = layer.forward(&x, mask)?;
        }
        let x = self.lstm.forward_masked(&x.transpose(1, 2)?, mask)?;
        x.transpose(1, 2)
    }

    pub fn channels(&self) -> candle_core::Result<usize> {
        self.embedding.embeddings().dim(D::Minus1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::VarMap;

    #[test]
    fn test_output_shape_and_padding() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let encoder = TextEncoder::new(24, 16, 5, 2, vb.pp("text_encoder")).unwrap();
        assert_eq!(encoder.channels().unwrap(), 16);

        let ids = Tensor::new(&[[0u32, 3, 7, 11, 0, 0, 0]], &dev).unwrap();
        let mask = PaddingMask::with_valid_prefix(7, 5);
        let ys = encoder.forward(&ids, &mask).unwrap();
        assert_eq!(ys.dims(), &[1, 16, 7]);
        let tail: Vec<f32> = ys.i((.., .., 5..)).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(tail.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_valid_prefix_matches_unpadded_run() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let encoder = TextEncoder::new(24, 16, 5, 2, vb).unwrap();

        let plain_ids = Tensor::new(&[[0u32, 3, 7, 11, 0]], &dev).unwrap();
        let padded_ids = Tensor::new(&[[0u32, 3, 7, 11, 0, 9, 9, 9]], &dev).unwrap();
        let plain = encoder.forward(&plain_ids, &PaddingMask::all_valid(5)).unwrap();
        let padded = encoder
            .forward(&padded_ids, &PaddingMask::with_valid_prefix(8, 5))
            .unwrap();
        let diff: f32 = (plain - padded.i((.., .., ..5)).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5, "valid outputs moved by {diff} when padding was added");
    }
}
