//! Short-time Fourier transform and its overlap-add inverse.
//!
//! Framing follows `center = true`: the signal is reflect-padded by `n_fft/2`
//! on each side, so a signal of `L` samples yields `L / hop + 1` frames and the
//! inverse returns `(frames - 1) * hop` samples.
//!
//! - Window: periodic Hann, length `n_fft`
//! - Spectrum: one-sided, `n_fft/2 + 1` bins, reported as magnitude and phase
//! - Inverse: phase unwrapped across frames, inverse FFT per frame, windowed
//!   overlap-add normalized by the accumulated squared window

use std::f64::consts::PI;
use std::fmt;
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::{Error, Result};

/// Window energy below this is treated as uncovered.
const WINDOW_SUM_FLOOR: f64 = 1e-11;

/// Magnitude/phase pair, bin-major: value `(bin, frame)` is at
/// `bin * frames + frame`.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrogram {
    pub bins: usize,
    pub frames: usize,
    pub magnitude: Vec<f32>,
    pub phase: Vec<f32>,
}

impl Spectrogram {
    pub fn new(bins: usize, frames: usize, magnitude: Vec<f32>, phase: Vec<f32>) -> Result<Self> {
        let expected = bins * frames;
        if magnitude.len() != expected || phase.len() != expected {
            return Err(Error::Audio(format!(
                "spectrogram {bins}x{frames} needs {expected} values, got {} magnitudes and {} phases",
                magnitude.len(),
                phase.len()
            )));
        }
        Ok(Self {
            bins,
            frames,
            magnitude,
            phase,
        })
    }

    fn index(&self, bin: usize, frame: usize) -> usize {
        bin * self.frames + frame
    }
}

/// STFT processor with pre-planned forward and inverse FFTs.
pub struct Stft {
    n_fft: usize,
    hop: usize,
    window: Vec<f64>,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

impl fmt::Debug for Stft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stft")
            .field("n_fft", &self.n_fft)
            .field("hop", &self.hop)
            .finish_non_exhaustive()
    }
}

impl Clone for Stft {
    fn clone(&self) -> Self {
        Self {
            n_fft: self.n_fft,
            hop: self.hop,
            window: self.window.clone(),
            forward: Arc::clone(&self.forward),
            inverse: Arc::clone(&self.inverse),
        }
    }
}

impl Stft {
    pub fn new(n_fft: usize, hop: usize) -> Result<Self> {
        if n_fft < 2 || n_fft % 2 != 0 || hop == 0 || hop > n_fft {
            return Err(Error::Audio(format!(
                "unsupported STFT geometry: n_fft {n_fft}, hop {hop}"
            )));
        }
        let mut planner = FftPlanner::new();
        Ok(Self {
            n_fft,
            hop,
            window: hann_window(n_fft),
            forward: planner.plan_fft_forward(n_fft),
            inverse: planner.plan_fft_inverse(n_fft),
        })
    }

    pub fn n_fft(&self) -> usize {
        self.n_fft
    }

    pub fn hop(&self) -> usize {
        self.hop
    }

    /// One-sided bins per frame.
    pub fn bins(&self) -> usize {
        self.n_fft / 2 + 1
    }

    /// Frames produced for a signal of `samples` samples.
    pub fn frame_count(&self, samples: usize) -> usize {
        samples / self.hop + 1
    }

    /// Samples produced by [`Stft::inverse`] for `frames` frames.
    pub fn output_len(&self, frames: usize) -> usize {
        frames.saturating_sub(1) * self.hop
    }

    /// Forward transform of a mono signal.
    pub fn forward(&self, signal: &[f32]) -> Result<Spectrogram> {
        let pad = self.n_fft / 2;
        if signal.len() <= pad {
            return Err(Error::Audio(format!(
                "signal of {} samples is too short to reflect-pad by {pad}",
                signal.len()
            )));
        }
        let samples: Vec<f64> = signal.iter().map(|&s| s as f64).collect();
        let padded = reflect_pad(&samples, pad, pad);

        let bins = self.bins();
        let frames = self.frame_count(signal.len());
        let mut magnitude = vec![0f32; bins * frames];
        let mut phase = vec![0f32; bins * frames];
        let mut buffer = vec![Complex::new(0.0, 0.0); self.n_fft];

        for frame in 0..frames {
            let start = frame * self.hop;
            for (i, slot) in buffer.iter_mut().enumerate() {
                *slot = Complex::new(padded[start + i] * self.window[i], 0.0);
            }
            self.forward.process(&mut buffer);
            for (bin, c) in buffer[..bins].iter().enumerate() {
                let idx = bin * frames + frame;
                magnitude[idx] = c.norm() as f32;
                phase[idx] = c.im.atan2(c.re) as f32;
            }
        }

        Spectrogram::new(bins, frames, magnitude, phase)
    }

    /// Overlap-add inverse. The phase of every bin is unwrapped across frames
    /// before recombination.
    pub fn inverse(&self, spec: &Spectrogram) -> Result<Vec<f32>> {
        let bins = self.bins();
        if spec.bins != bins {
            return Err(Error::Audio(format!(
                "spectrogram has {} bins, STFT expects {bins}",
                spec.bins
            )));
        }
        let frames = spec.frames;
        if frames == 0 {
            return Ok(Vec::new());
        }

        // Continuous phase per bin: [bins][frames]
        let phases: Vec<Vec<f64>> = (0..bins)
            .map(|bin| {
                let mut track: Vec<f64> = (0..frames)
                    .map(|frame| spec.phase[spec.index(bin, frame)] as f64)
                    .collect();
                unwrap_phase(&mut track);
                track
            })
            .collect();

        let n = self.n_fft;
        let padded_len = (frames - 1) * self.hop + n;
        let mut signal = vec![0f64; padded_len];
        let mut window_sum = vec![0f64; padded_len];
        let mut buffer = vec![Complex::new(0.0, 0.0); n];
        let scale = 1.0 / n as f64;

        for frame in 0..frames {
            // Hermitian spectrum; DC and Nyquist are real.
            for (bin, track) in phases.iter().enumerate() {
                let mag = spec.magnitude[spec.index(bin, frame)] as f64;
                let value = Complex::from_polar(mag, track[frame]);
                if bin == 0 || bin == n / 2 {
                    buffer[bin] = Complex::new(value.re, 0.0);
                } else {
                    buffer[bin] = value;
                    buffer[n - bin] = value.conj();
                }
            }
            self.inverse.process(&mut buffer);

            let start = frame * self.hop;
            for (i, c) in buffer.iter().enumerate() {
                let w = self.window[i];
                signal[start + i] += c.re * scale * w;
                window_sum[start + i] += w * w;
            }
        }

        let pad = n / 2;
        let out = signal[pad..padded_len - pad]
            .iter()
            .zip(&window_sum[pad..padded_len - pad])
            .map(|(&s, &w)| if w > WINDOW_SUM_FLOOR { (s / w) as f32 } else { s as f32 })
            .collect::<Vec<_>>();
        debug_assert_eq!(out.len(), self.output_len(frames));
        Ok(out)
    }
}

/// Periodic Hann window of the given length.
pub fn hann_window(length: usize) -> Vec<f64> {
    (0..length)
        .map(|i| {
            let phase = 2.0 * PI * i as f64 / length as f64;
            0.5 * (1.0 - phase.cos())
        })
        .collect()
}

/// Reflect-pad a signal on both sides (edge sample not repeated).
fn reflect_pad(signal: &[f64], pad_left: usize, pad_right: usize) -> Vec<f64> {
    let len = signal.len();
    let mut padded = Vec::with_capacity(pad_left + len + pad_right);
    // signal[pad_left], ..., signal[1]
    for i in (1..=pad_left).rev() {
        padded.push(signal[i.min(len - 1)]);
    }
    padded.extend_from_slice(signal);
    // signal[len - 2], signal[len - 3], ...
    for i in 0..pad_right {
        padded.push(signal[len.saturating_sub(2 + i)]);
    }
    padded
}

/// Remove `2π` jumps larger than `π` between consecutive values, in place.
pub fn unwrap_phase(phase: &mut [f64]) {
    let period = 2.0 * PI;
    let half = PI;
    let mut correction = 0.0;
    let mut prev = match phase.first() {
        Some(&p) => p,
        None => return,
    };
    for value in phase.iter_mut().skip(1) {
        let raw = *value;
        let diff = raw - prev;
        prev = raw;
        if diff.abs() >= half {
            let mut wrapped = (diff + half).rem_euclid(period) - half;
            if wrapped == -half && diff > 0.0 {
                wrapped = half;
            }
            correction += wrapped - diff;
        }
        *value = raw + correction;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hann_window_is_periodic() {
        let w = hann_window(20);
        assert!(w[0].abs() < 1e-12);
        assert!((w[10] - 1.0).abs() < 1e-12);
        for i in 1..20 {
            assert!((w[i] - w[20 - i]).abs() < 1e-12, "asymmetric at {i}");
        }
    }

    #[test]
    fn test_reflect_pad() {
        let padded = reflect_pad(&[1.0, 2.0, 3.0, 4.0, 5.0], 2, 2);
        assert_eq!(padded, vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 5.0, 4.0, 3.0]);
    }

    #[test]
    fn test_unwrap_linear_ramp() {
        let ramp: Vec<f64> = (0..50).map(|i| 0.9 * i as f64).collect();
        let mut wrapped: Vec<f64> = ramp
            .iter()
            .map(|p| (p + PI).rem_euclid(2.0 * PI) - PI)
            .collect();
        unwrap_phase(&mut wrapped);
        for (got, want) in wrapped.iter().zip(&ramp) {
            assert!((got - want).abs() < 1e-9, "{got} vs {want}");
        }
    }

    #[test]
    fn test_unwrap_leaves_small_steps_alone() {
        let mut phase = vec![0.0, 1.0, -1.0, 2.0, 1.0];
        let original = phase.clone();
        unwrap_phase(&mut phase);
        assert_eq!(phase, original);
    }

    #[test]
    fn test_frame_and_output_lengths() {
        let stft = Stft::new(20, 5).unwrap();
        let signal = vec![0.25f32; 600];
        let spec = stft.forward(&signal).unwrap();
        assert_eq!(spec.bins, 11);
        assert_eq!(spec.frames, 121);
        let audio = stft.inverse(&spec).unwrap();
        assert_eq!(audio.len(), 600);
        assert_eq!(stft.output_len(spec.frames), 600);
    }

    #[test]
    fn test_sine_round_trip() {
        let (n_fft, hop, sr) = (20, 5, 24_000.0);
        let stft = Stft::new(n_fft, hop).unwrap();
        let len = 8 * n_fft * 5;
        let signal: Vec<f32> = (0..len)
            .map(|i| (0.8 * (2.0 * PI * 440.0 * i as f64 / sr).sin()) as f32)
            .collect();
        let spec = stft.forward(&signal).unwrap();
        let rebuilt = stft.inverse(&spec).unwrap();
        assert_eq!(rebuilt.len(), len);

        let half = n_fft / 2;
        let max_err = signal[half..len - half]
            .iter()
            .zip(&rebuilt[half..len - half])
            .map(|(a, b)| (a - b).abs())
            .fold(0f32, f32::max);
        assert!(max_err < 1e-3, "max round-trip error {max_err}");
    }

    #[test]
    fn test_magnitude_of_dc_signal() {
        let stft = Stft::new(8, 2).unwrap();
        let spec = stft.forward(&[1.0f32; 64]).unwrap();
        // Interior frame: DC bin holds the window sum (n/2), others vanish.
        let frame = spec.frames / 2;
        assert!((spec.magnitude[spec.index(0, frame)] - 4.0).abs() < 1e-5);
        assert!((spec.magnitude[spec.index(1, frame)] - 2.0).abs() < 1e-5);
        for bin in 2..spec.bins {
            assert!(spec.magnitude[spec.index(bin, frame)] < 1e-5, "bin {bin}");
        }
    }

    #[test]
    fn test_rejects_short_signal_and_bad_geometry() {
        let stft = Stft::new(20, 5).unwrap();
        assert!(matches!(stft.forward(&[0.0; 10]), Err(Error::Audio(_))));
        assert!(Stft::new(21, 5).is_err());
        assert!(Stft::new(20, 0).is_err());
    }

    #[test]
    fn test_inverse_rejects_wrong_bin_count() {
        let stft = Stft::new(8, 2).unwrap();
        let spec = Spectrogram::new(4, 3, vec![0.0; 12], vec![0.0; 12]).unwrap();
        assert!(stft.inverse(&spec).is_err());
        assert!(Spectrogram::new(4, 3, vec![0.0; 11], vec![0.0; 12]).is_err());
    }
}
