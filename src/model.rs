//! Model components of the Kokoro acoustic core.
//!
//! ## Components
//!
//! - [`mask`]: token and frame padding masks
//! - [`conv`]: weight-normalized standard and transposed convolutions
//! - [`lstm`]: bidirectional LSTM
//! - [`adain`]: style modulation (AdaIN, style-conditioned layer norm)
//! - [`resblock`]: style-conditioned residual block with optional 2x upsampling
//! - [`duration`]: duration encoder, duration aligner and alignment matrix
//! - [`prosody`]: pitch (F0) and voicing (N) predictor
//! - [`text_encoder`]: acoustic text encoder feeding the decoder
//! - [`source`]: harmonic-plus-noise excitation source
//! - [`generator`]: iSTFTNet upsampling generator
//! - [`decoder`]: decoder front end driving the generator

pub mod adain;
pub mod conv;
pub mod decoder;
pub mod duration;
pub mod generator;
pub mod lstm;
pub mod mask;
pub mod prosody;
pub mod resblock;
pub mod source;
pub mod text_encoder;
