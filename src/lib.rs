//! Kokoro text-to-speech acoustic core in pure Rust.
//!
//! A candle-based implementation of the Kokoro-82M acoustic model: duration
//! prediction and alignment, prosody prediction, and an iSTFTNet vocoder with
//! a harmonic-plus-noise excitation source. Loads the original safetensors
//! weights directly.
//!
//! ## Architecture
//!
//! Phoneme encoder hidden states and a voice style vector go in, a 24 kHz
//! waveform comes out:
//!
//! ```text
//! embeddings → bert_encoder → DurationEncoder ──→ DurationAligner → durations
//!                                   │                                  ↓
//!                                   └──────────── expand (alignment) ──┤
//!                                                      ↓               │
//!                                          ProsodyPredictor → F0, N    │
//!                                                      ↓               │
//! phoneme ids → TextEncoder ───────────── expand (alignment) ──────────┘
//!                                                      ↓
//!                         Decoder → Generator (harmonic source, ISTFT) → audio
//! ```
//!
//! ## Modules
//!
//! - [`pipeline`]: end-to-end synthesis entry point
//! - [`model`]: recurrent, convolutional and style-conditioned components
//! - [`audio`]: STFT/ISTFT and WAV I/O
//! - [`voice`]: voice packs and style vectors
//! - [`timestamps`]: word timings from predicted durations
//! - [`config`]: model configuration (`config.json`)

pub mod audio;
pub mod config;
pub mod model;
pub mod pipeline;
pub mod timestamps;
pub mod voice;

mod error;

pub use error::{Error, Result};
