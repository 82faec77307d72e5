//! Configuration for the Kokoro acoustic model.
//!
//! Field names follow the reference `config.json` so the file shipped next to
//! the weights deserializes directly. Values that are hard-wired in the
//! reference architecture get serde defaults.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// PL-BERT phoneme encoder settings. Only `hidden_size` is consumed here: the
/// encoder itself runs outside this crate and hands over its hidden states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlbertConfig {
    pub hidden_size: usize,
    #[serde(default)]
    pub num_attention_heads: usize,
    #[serde(default)]
    pub intermediate_size: usize,
    #[serde(default)]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub num_hidden_layers: usize,
    #[serde(default)]
    pub dropout: f64,
}

impl Default for PlbertConfig {
    fn default() -> Self {
        Self {
            hidden_size: 768,
            num_attention_heads: 12,
            intermediate_size: 2048,
            max_position_embeddings: 512,
            num_hidden_layers: 12,
            dropout: 0.1,
        }
    }
}

/// iSTFTNet vocoder generator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IstftNetConfig {
    pub upsample_kernel_sizes: Vec<usize>,
    pub upsample_rates: Vec<usize>,
    pub gen_istft_hop_size: usize,
    pub gen_istft_n_fft: usize,
    pub resblock_dilation_sizes: Vec<Vec<usize>>,
    pub resblock_kernel_sizes: Vec<usize>,
    pub upsample_initial_channel: usize,
}

impl Default for IstftNetConfig {
    fn default() -> Self {
        Self {
            upsample_kernel_sizes: vec![20, 12],
            upsample_rates: vec![10, 6],
            gen_istft_hop_size: 5,
            gen_istft_n_fft: 20,
            resblock_dilation_sizes: vec![vec![1, 3, 5], vec![1, 3, 5], vec![1, 3, 5]],
            resblock_kernel_sizes: vec![3, 7, 11],
            upsample_initial_channel: 512,
        }
    }
}

/// Harmonic-plus-noise source constants.
///
/// `sine_amp / 3` is the unvoiced noise amplitude; it is replicated as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub harmonic_num: usize,
    pub sine_amp: f32,
    pub noise_std: f32,
    pub voiced_threshold: f32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            harmonic_num: 8,
            sine_amp: 0.1,
            noise_std: 0.003,
            voiced_threshold: 10.0,
        }
    }
}

/// Top-level model configuration (Kokoro-82M v1.0 defaults).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KokoroConfig {
    #[serde(default)]
    pub dim_in: usize,
    pub hidden_dim: usize,
    #[serde(default)]
    pub max_conv_dim: usize,
    pub max_dur: usize,
    pub n_layer: usize,
    #[serde(default)]
    pub n_mels: usize,
    pub n_token: usize,
    pub style_dim: usize,
    pub text_encoder_kernel_size: usize,
    pub plbert: PlbertConfig,
    pub istftnet: IstftNetConfig,
    #[serde(default)]
    pub vocab: HashMap<String, u32>,

    // --- Fixed in the reference architecture ---
    #[serde(default = "default_decoder_hidden")]
    pub decoder_hidden: usize,
    #[serde(default = "default_asr_res_dim")]
    pub asr_res_dim: usize,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Token cap including the two boundary tokens.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub source: SourceConfig,
}

fn default_decoder_hidden() -> usize {
    1024
}

fn default_asr_res_dim() -> usize {
    64
}

fn default_sample_rate() -> u32 {
    24_000
}

fn default_max_tokens() -> usize {
    512
}

impl Default for KokoroConfig {
    fn default() -> Self {
        Self {
            dim_in: 64,
            hidden_dim: 512,
            max_conv_dim: 512,
            max_dur: 50,
            n_layer: 3,
            n_mels: 80,
            n_token: 178,
            style_dim: 128,
            text_encoder_kernel_size: 5,
            plbert: PlbertConfig::default(),
            istftnet: IstftNetConfig::default(),
            vocab: HashMap::new(),
            decoder_hidden: default_decoder_hidden(),
            asr_res_dim: default_asr_res_dim(),
            sample_rate: default_sample_rate(),
            max_tokens: default_max_tokens(),
            source: SourceConfig::default(),
        }
    }
}

impl KokoroConfig {
    /// Read a `config.json`.
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.verify()?;
        Ok(config)
    }

    /// Width of a full reference style vector (acoustic + prosodic halves).
    pub fn style_width(&self) -> usize {
        2 * self.style_dim
    }

    /// Audio samples per generator input step: prod(upsample_rates) * hop.
    pub fn harmonic_upsample(&self) -> usize {
        self.istftnet.upsample_rates.iter().product::<usize>() * self.istftnet.gen_istft_hop_size
    }

    /// Audio samples per predicted duration frame. The decoder upsamples the
    /// frame axis by 2 before the generator runs.
    pub fn samples_per_frame(&self) -> usize {
        2 * self.harmonic_upsample()
    }

    /// Frame cap for one synthesis call: `max_tokens * max_dur`, the longest
    /// timeline the duration head can produce at speed 1. Slower speeds that
    /// would exceed it are rejected before any frame tensor is built.
    pub fn max_frames(&self) -> usize {
        self.max_tokens * self.max_dur
    }

    /// One-sided spectrum bins of the vocoder's ISTFT.
    pub fn istft_bins(&self) -> usize {
        self.istftnet.gen_istft_n_fft / 2 + 1
    }

    /// Check that the architecture described by this config can be built.
    pub fn verify(&self) -> crate::Result<()> {
        let net = &self.istftnet;
        if net.upsample_rates.is_empty() {
            return Err(mismatch("upsample_rates must not be empty"));
        }
        if net.upsample_rates.len() != net.upsample_kernel_sizes.len() {
            return Err(mismatch(format!(
                "{} upsample rates but {} upsample kernel sizes",
                net.upsample_rates.len(),
                net.upsample_kernel_sizes.len()
            )));
        }
        for (&u, &k) in net.upsample_rates.iter().zip(&net.upsample_kernel_sizes) {
            if k < u || (k - u) % 2 != 0 {
                return Err(mismatch(format!(
                    "upsample kernel {k} with rate {u} does not give an exact x{u} length"
                )));
            }
        }
        if net.resblock_kernel_sizes.is_empty()
            || net.resblock_kernel_sizes.len() != net.resblock_dilation_sizes.len()
        {
            return Err(mismatch(format!(
                "{} resblock kernel sizes but {} dilation sets",
                net.resblock_kernel_sizes.len(),
                net.resblock_dilation_sizes.len()
            )));
        }
        if net.resblock_dilation_sizes.iter().any(|d| d.len() != 3) {
            return Err(mismatch("every resblock needs exactly three dilations"));
        }
        let stages = net.upsample_rates.len() as u32;
        if net.upsample_initial_channel % 2usize.pow(stages) != 0 {
            return Err(mismatch(format!(
                "upsample_initial_channel {} is not divisible by 2^{stages}",
                net.upsample_initial_channel
            )));
        }
        if net.gen_istft_n_fft % 2 != 0 || net.gen_istft_hop_size == 0 {
            return Err(mismatch(format!(
                "gen_istft_n_fft {} must be even and hop {} positive",
                net.gen_istft_n_fft, net.gen_istft_hop_size
            )));
        }
        if self.hidden_dim % 2 != 0 {
            return Err(mismatch(format!(
                "hidden_dim {} must be even for the bidirectional LSTMs",
                self.hidden_dim
            )));
        }
        if self.max_tokens < 3 {
            return Err(mismatch("max_tokens must leave room for two boundary tokens"));
        }
        Ok(())
    }

    /// Same topology as the default model with tiny widths, for unit tests.
    #[cfg(test)]
    pub(crate) fn tiny() -> Self {
        Self {
            dim_in: 8,
            hidden_dim: 16,
            max_conv_dim: 16,
            max_dur: 6,
            n_layer: 2,
            n_mels: 8,
            n_token: 24,
            style_dim: 8,
            text_encoder_kernel_size: 5,
            plbert: PlbertConfig {
                hidden_size: 12,
                ..Default::default()
            },
            istftnet: IstftNetConfig {
                upsample_kernel_sizes: vec![4, 4],
                upsample_rates: vec![2, 2],
                gen_istft_hop_size: 2,
                gen_istft_n_fft: 8,
                resblock_dilation_sizes: vec![vec![1, 3, 5], vec![1, 3, 5]],
                resblock_kernel_sizes: vec![3, 5],
                upsample_initial_channel: 16,
            },
            vocab: HashMap::new(),
            decoder_hidden: 24,
            asr_res_dim: 4,
            sample_rate: default_sample_rate(),
            max_tokens: default_max_tokens(),
            source: SourceConfig::default(),
        }
    }
}

fn mismatch(message: impl Into<String>) -> crate::Error {
    crate::Error::ConfigurationMismatch(message.into())
}
