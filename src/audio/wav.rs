//! WAV file I/O for synthesized speech (mono, 24 kHz by default).

use std::path::Path;

use crate::Result;

/// Sample encoding used when writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WavEncoding {
    /// 32-bit IEEE float, written unclipped.
    #[default]
    Float32,
    /// 16-bit signed PCM, clipped to [-1, 1].
    Pcm16,
}

/// Decoded WAV contents. Multi-channel samples stay interleaved.
#[derive(Debug, Clone)]
pub struct WavAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl WavAudio {
    /// Average interleaved channels down to one.
    pub fn into_mono(self) -> Vec<f32> {
        let channels = self.channels.max(1) as usize;
        if channels == 1 {
            return self.samples;
        }
        self.samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    }

    pub fn duration_secs(&self) -> f64 {
        let frames = self.samples.len() / self.channels.max(1) as usize;
        frames as f64 / self.sample_rate as f64
    }
}

/// Read a WAV file; integer PCM is scaled to [-1, 1].
pub fn read_wav(path: impl AsRef<Path>) -> Result<WavAudio> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let full_scale = (1u32 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / full_scale))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    Ok(WavAudio {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

/// Write mono samples.
pub fn write_wav(
    path: impl AsRef<Path>,
    samples: &[f32],
    sample_rate: u32,
    encoding: WavEncoding,
) -> Result<()> {
    let (bits_per_sample, sample_format) = match encoding {
        WavEncoding::Float32 => (32, hound::SampleFormat::Float),
        WavEncoding::Pcm16 => (16, hound::SampleFormat::Int),
    };
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample,
        sample_format,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    match encoding {
        WavEncoding::Float32 => {
            for &s in samples {
                writer.write_sample(s)?;
            }
        }
        WavEncoding::Pcm16 => {
            for &s in samples {
                writer.write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16)?;
            }
        }
    }
    writer.finalize()?;
    Ok(())
}

/// Scale so the largest magnitude equals `peak`. Silence is left untouched.
pub fn peak_normalize(samples: &mut [f32], peak: f32) {
    let max_abs = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
    if max_abs > 1e-8 {
        let scale = peak / max_abs;
        for s in samples.iter_mut() {
            *s *= scale;
        }
    }
}
