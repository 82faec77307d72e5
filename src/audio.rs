//! Audio utilities.
//!
//! STFT/ISTFT for the vocoder and WAV read/write for 24 kHz mono output.

pub mod stft;
mod wav;

pub use stft::{Spectrogram, Stft};
pub use wav::{WavAudio, WavEncoding, peak_normalize, read_wav, write_wav};
