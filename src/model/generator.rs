//! iSTFTNet generator: style-conditioned upsampling with harmonic source
//! fusion, ending in a magnitude/phase spectrum that the inverse STFT turns
//! into audio.
//!
//! ```text
//! f0 [1, N] → HarmonicSource → excitation → STFT → [1, n_fft + 2, frames]
//!                                                   │
//! x [1, C, N] ─┬─ per stage i ──────────────────────┤
//!              │  LeakyReLU(0.1)                    noise_convs[i] → noise_res[i]
//!              │  ups[i] (transposed, ×u_i)          │
//!              │  (+ reflection pad on last stage)   │
//!              │  + ───────────────────────────────────┘
//!              │  mean over K snake residual blocks
//!              └→ LeakyReLU(0.01) → conv_post → exp(mag), sin(phase) → ISTFT
//! ```

use candle_core::{D, DType, Module, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, VarBuilder};
use rand_chacha::ChaCha8Rng;

use super::adain::AdaIn1d;
use super::conv::{WeightNormConfig, WeightNormConv1d};
use super::resblock::leaky_relu;
use super::source::HarmonicSource;
use crate::audio::stft::{Spectrogram, Stft};
use crate::config::KokoroConfig;
use crate::{Error, Result};

const STAGE_SLOPE: f64 = 0.1;
const POST_SLOPE: f64 = 0.01;

/// Snake activation `x + sin²(αx) / α` with a learned per-channel `α`.
fn snake(xs: &Tensor, alpha: &Tensor) -> candle_core::Result<Tensor> {
    let sin_sq = xs.broadcast_mul(alpha)?.sin()?.sqr()?;
    xs + sin_sq.broadcast_div(alpha)?
}

/// Residual block of dilated convolutions with AdaIN and snake activations.
#[derive(Debug, Clone)]
pub struct SnakeResBlock {
    convs1: Vec<WeightNormConv1d>,
    convs2: Vec<WeightNormConv1d>,
    adain1: Vec<AdaIn1d>,
    adain2: Vec<AdaIn1d>,
    alpha1: Vec<Tensor>,
    alpha2: Vec<Tensor>,
}

impl SnakeResBlock {
    pub fn new(
        channels: usize,
        kernel_size: usize,
        dilations: &[usize],
        style_dim: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let n = dilations.len();
        let mut block = Self {
            convs1: Vec::with_capacity(n),
            convs2: Vec::with_capacity(n),
            adain1: Vec::with_capacity(n),
            adain2: Vec::with_capacity(n),
            alpha1: Vec::with_capacity(n),
            alpha2: Vec::with_capacity(n),
        };
        let alpha_init = candle_nn::Init::Const(1.0);
        for (i, &dilation) in dilations.iter().enumerate() {
            block.convs1.push(WeightNormConv1d::new(
                channels,
                channels,
                kernel_size,
                WeightNormConfig::same(kernel_size, dilation),
                vb.pp("convs1").pp(i),
            )?);
            block.convs2.push(WeightNormConv1d::new(
                channels,
                channels,
                kernel_size,
                WeightNormConfig::same(kernel_size, 1),
                vb.pp("convs2").pp(i),
            )?);
            block.adain1.push(AdaIn1d::new(style_dim, channels, vb.pp("adain1").pp(i))?);
            block.adain2.push(AdaIn1d::new(style_dim, channels, vb.pp("adain2").pp(i))?);
            block.alpha1.push(vb.get_with_hints((1, channels, 1), &format!("alpha1.{i}"), alpha_init)?);
            block.alpha2.push(vb.get_with_hints((1, channels, 1), &format!("alpha2.{i}"), alpha_init)?);
        }
        Ok(block)
    }

    /// `xs: [B, C, T]`, `style: [B, S]` → `[B, C, T]`.
    pub fn forward(&self, xs: &Tensor, style: &Tensor) -> candle_core::Result<Tensor> {
        let mut x = xs.clone();
        for i in 0..self.convs1.len() {
            let h = snake(&self.adain1[i].forward(&x, style)?, &self.alpha1[i])?;
            let h = self.convs1[i].forward(&h)?;
            let h = snake(&self.adain2[i].forward(&h, style)?, &self.alpha2[i])?;
            let h = self.convs2[i].forward(&h)?;
            x = (h + x)?;
        }
        Ok(x)
    }
}

#[derive(Debug, Clone)]
struct UpsampleStage {
    up: WeightNormConv1d,
    noise_conv: Conv1d,
    noise_res: SnakeResBlock,
}

#[derive(Debug, Clone)]
pub struct Generator {
    source: HarmonicSource,
    stft: Stft,
    stages: Vec<UpsampleStage>,
    /// `stages.len() * kernels` blocks, stage-major.
    resblocks: Vec<SnakeResBlock>,
    kernels: usize,
    conv_post: WeightNormConv1d,
}

impl Generator {
    /// `vb` points at `decoder.generator`.
    pub fn new(config: &KokoroConfig, vb: VarBuilder) -> Result<Self> {
        let net = &config.istftnet;
        let style_dim = config.style_dim;
        let n_fft = net.gen_istft_n_fft;
        let spec_channels = n_fft + 2;
        let stft = Stft::new(n_fft, net.gen_istft_hop_size)?;
        let source = HarmonicSource::new(
            config.source.clone(),
            config.sample_rate,
            config.harmonic_upsample(),
            vb.pp("m_source"),
        )?;

        let n_stages = net.upsample_rates.len();
        let kernels = net.resblock_kernel_sizes.len();
        let mut stages = Vec::with_capacity(n_stages);
        let mut resblocks = Vec::with_capacity(n_stages * kernels);
        for (i, (&rate, &kernel)) in net
            .upsample_rates
            .iter()
            .zip(&net.upsample_kernel_sizes)
            .enumerate()
        {
            let c_in = net.upsample_initial_channel >> i;
            let c_out = net.upsample_initial_channel >> (i + 1);
            let up = WeightNormConv1d::new(
                c_in,
                c_out,
                kernel,
                WeightNormConfig::transposed(rate, (kernel - rate) / 2),
                vb.pp("ups").pp(i),
            )?;

            // Bring the excitation spectrum to this stage's time resolution.
            let (noise_conv, noise_res) = if i + 1 < n_stages {
                let stride: usize = net.upsample_rates[i + 1..].iter().product();
                let cfg = Conv1dConfig {
                    stride,
                    padding: stride.div_ceil(2),
                    ..Default::default()
                };
                let conv = candle_nn::conv1d(spec_channels, c_out, 2 * stride, cfg, vb.pp("noise_convs").pp(i))?;
                let res = SnakeResBlock::new(c_out, 7, &[1, 3, 5], style_dim, vb.pp("noise_res").pp(i))?;
                (conv, res)
            } else {
                let conv = candle_nn::conv1d(spec_channels, c_out, 1, Default::default(), vb.pp("noise_convs").pp(i))?;
                let res = SnakeResBlock::new(c_out, 11, &[1, 3, 5], style_dim, vb.pp("noise_res").pp(i))?;
                (conv, res)
            };
            stages.push(UpsampleStage {
                up,
                noise_conv,
                noise_res,
            });

            for (j, (&k, dilations)) in net
                .resblock_kernel_sizes
                .iter()
                .zip(&net.resblock_dilation_sizes)
                .enumerate()
            {
                resblocks.push(SnakeResBlock::new(
                    c_out,
                    k,
                    dilations,
                    style_dim,
                    vb.pp("resblocks").pp(i * kernels + j),
                )?);
            }
        }

        let c_last = net.upsample_initial_channel >> n_stages;
        let conv_post = WeightNormConv1d::new(
            c_last,
            spec_channels,
            7,
            WeightNormConfig::same(7, 1),
            vb.pp("conv_post"),
        )?;

        Ok(Self {
            source,
            stft,
            stages,
            resblocks,
            kernels,
            conv_post,
        })
    }

    pub fn stft(&self) -> &Stft {
        &self.stft
    }

    /// Samples produced for a generator input of `steps` time steps.
    pub fn output_len(&self, steps: usize) -> usize {
        steps * self.source.upsample()
    }

    /// Excitation spectrum `[1, n_fft + 2, frames]`: magnitudes, then phases.
    fn source_spectrum(&self, f0: &Tensor, rng: &mut ChaCha8Rng) -> Result<Tensor> {
        let excitation = self.source.forward(f0, rng)?;
        let dtype = excitation.harmonic.dtype();
        let samples: Vec<f32> = excitation.harmonic.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
        let spec = self.stft.forward(&samples)?;
        let (bins, frames) = (spec.bins, spec.frames);
        let mut data = spec.magnitude;
        data.extend_from_slice(&spec.phase);
        Ok(Tensor::from_vec(data, (1, 2 * bins, frames), f0.device())?.to_dtype(dtype)?)
    }

    /// `x: [1, C, N]` decoder features, `style: [1, S]` acoustic style,
    /// `f0: [1, N]` pitch curve → audio of `N * harmonic_upsample` samples.
    pub fn forward(&self, x: &Tensor, style: &Tensor, f0: &Tensor, rng: &mut ChaCha8Rng) -> Result<Vec<f32>> {
        let har = self.source_spectrum(f0, rng)?;

        let mut x = x.clone();
        let last = self.stages.len() - 1;
        for (i, stage) in self.stages.iter().enumerate() {
            x = leaky_relu(&x, STAGE_SLOPE)?;
            let x_source = stage.noise_conv.forward(&har)?;
            let x_source = stage.noise_res.forward(&x_source, style)?;

            x = stage.up.forward(&x)?;
            if i == last {
                // Reflection pad (1, 0).
                x = Tensor::cat(&[&x.narrow(D::Minus1, 1, 1)?, &x], D::Minus1)?;
            }
            if x.dims() != x_source.dims() {
                return Err(Error::NumericalInvariant(format!(
                    "stage {i}: upsampled features {:?} do not line up with source branch {:?}",
                    x.dims(),
                    x_source.dims()
                )));
            }
            x = (x + x_source)?;

            let blocks = &self.resblocks[i * self.kernels..(i + 1) * self.kernels];
            let mut acc: Option<Tensor> = None;
            for block in blocks {
                let out = block.forward(&x, style)?;
                acc = Some(match acc {
                    Some(prev) => (prev + out)?,
                    None => out,
                });
            }
            if let Some(sum) = acc {
                x = (sum / self.kernels as f64)?;
            }
        }

        let x = leaky_relu(&x, POST_SLOPE)?;
        let spec = self.conv_post.forward(&x)?;
        let bins = self.stft.bins();
        let frames = spec.dim(D::Minus1)?;
        let magnitude = spec.narrow(1, 0, bins)?.exp()?;
        let phase = spec.narrow(1, bins, bins)?.sin()?;

        let to_host = |t: &Tensor| -> candle_core::Result<Vec<f32>> { t.flatten_all()?.to_dtype(DType::F32)?.to_vec1() };
        let spectrogram = Spectrogram::new(bins, frames, to_host(&magnitude)?, to_host(&phase)?)?;
        tracing::trace!(bins, frames, "generator spectrum");
        self.stft.inverse(&spectrogram)
    }
}
