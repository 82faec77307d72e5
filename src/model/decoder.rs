//! Decoder: fuses aligned text features with the prosody curves, then hands
//! off to the iSTFTNet generator.
//!
//! ```text
//! asr [1, H, F], F0/N [1, 2F]
//!   F0_conv / N_conv (stride 2)      → [1, 1, F] each
//!   encode([asr, F0, N])             → [1, D, F]
//!   decode.i([x, asr_res, F0, N])    → ... → [1, C0, 2F]   (last block upsamples)
//!   generator(x, style, F0)          → audio
//! ```
//!
//! The residual inputs are re-concatenated before every decode block up to
//! and including the upsampling one.

use candle_core::{D, Module, Tensor};
use candle_nn::VarBuilder;
use rand_chacha::ChaCha8Rng;

use super::conv::{WeightNormConfig, WeightNormConv1d};
use super::generator::Generator;
use super::resblock::{ConditionalResBlock, Resample};
use crate::config::KokoroConfig;
use crate::{Error, Result};

const DECODE_BLOCKS: usize = 4;

#[derive(Debug, Clone)]
pub struct Decoder {
    f0_conv: WeightNormConv1d,
    n_conv: WeightNormConv1d,
    asr_res: WeightNormConv1d,
    encode: ConditionalResBlock,
    decode: Vec<ConditionalResBlock>,
    generator: Generator,
}

impl Decoder {
    /// `vb` points at `decoder`.
    pub fn new(config: &KokoroConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_dim;
        let dim = config.decoder_hidden;
        let style_dim = config.style_dim;
        let curve_cfg = WeightNormConfig {
            stride: 2,
            padding: 1,
            ..Default::default()
        };
        let f0_conv = WeightNormConv1d::new(1, 1, 3, curve_cfg, vb.pp("F0_conv"))?;
        let n_conv = WeightNormConv1d::new(1, 1, 3, curve_cfg, vb.pp("N_conv"))?;
        let asr_res = WeightNormConv1d::new(
            hidden,
            config.asr_res_dim,
            1,
            WeightNormConfig::default(),
            vb.pp("asr_res").pp(0),
        )?;

        let encode = ConditionalResBlock::new(hidden + 2, dim, style_dim, Resample::None, vb.pp("encode"))?;
        let fused = dim + 2 + config.asr_res_dim;
        let decode = (0..DECODE_BLOCKS)
            .map(|i| {
                let (out, resample) = if i + 1 == DECODE_BLOCKS {
                    (config.istftnet.upsample_initial_channel, Resample::Double)
                } else {
                    (dim, Resample::None)
                };
                ConditionalResBlock::new(fused, out, style_dim, resample, vb.pp("decode").pp(i))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        let generator = Generator::new(config, vb.pp("generator"))?;
        Ok(Self {
            f0_conv,
            n_conv,
            asr_res,
            encode,
            decode,
            generator,
        })
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    /// Audio samples produced for `frames` aligned frames.
    pub fn output_len(&self, frames: usize) -> usize {
        self.generator.output_len(2 * frames)
    }

    /// `asr: [1, hidden, F]`, `f0`/`n`: `[1, 2F]`, `style`: acoustic `[1, S]`.
    pub fn forward(
        &self,
        asr: &Tensor,
        f0: &Tensor,
        n: &Tensor,
        style: &Tensor,
        rng: &mut ChaCha8Rng,
    ) -> Result<Vec<f32>> {
        let frames = asr.dim(D::Minus1)?;
        for (name, curve) in [("F0", f0), ("N", n)] {
            let len = curve.dim(D::Minus1)?;
            if len != 2 * frames {
                return Err(Error::NumericalInvariant(format!(
                    "{name} curve has {len} steps, expected {} for {frames} frames",
                    2 * frames
                )));
            }
        }

        // [1, 2F] → [1, 1, 2F] → [1, 1, F]
        let f0_down = self.f0_conv.forward(&f0.unsqueeze(1)?)?;
        let n_down = self.n_conv.forward(&n.unsqueeze(1)?)?;

        let mut x = Tensor::cat(&[asr, &f0_down, &n_down], 1)?;
        x = self.encode.forward(&x, style)?;
        let asr_res = self.asr_res.forward(asr)?;

        let mut reinject = true;
        for block in &self.decode {
            if reinject {
                x = Tensor::cat(&[&x, &asr_res, &f0_down, &n_down], 1)?;
            }
            x = block.forward(&x, style)?;
            if block.resample() == Resample::Double {
                reinject = false;
            }
        }
        tracing::trace!(channels = x.dim(1)?, steps = x.dim(D::Minus1)?, "decoder features");

        self.generator.forward(&x, style, f0, rng)
    }
}
