//! PCM decode, downmix, resample, chunk and WAV encode helpers.

use std::io::Cursor;

use anyhow::Context;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::debug;

use crate::ClientError;

const RESAMPLE_CHUNK: usize = 1024;

/// Interleaved samples as decoded from an upload.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }
}

pub fn decode_wav(bytes: &[u8]) -> Result<AudioBuffer, ClientError> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| ClientError::malformed("file", format!("Invalid audio file: {e}")))?;
    let spec = reader.spec();
    if spec.channels == 0 || spec.sample_rate == 0 {
        return Err(ClientError::malformed(
            "file",
            "Invalid audio file: zero channels or sample rate",
        ));
    }

    let samples = match spec.sample_format {
        hound::SampleFormat::Int => {
            let bits = u32::from(spec.bits_per_sample.max(1));
            let max_val = if bits > 1 {
                ((1i64 << (bits - 1)) - 1) as f32
            } else {
                1.0
            };
            reader
                .samples::<i32>()
                .map(|s| s.map(|s| (s as f32 / max_val).clamp(-1.0, 1.0)))
                .collect::<Result<Vec<_>, _>>()
        }
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<Vec<_>, _>>(),
    }
    .map_err(|e| ClientError::malformed("file", format!("Invalid audio file: {e}")))?;

    Ok(AudioBuffer {
        samples,
        channels: spec.channels,
        sample_rate: spec.sample_rate,
    })
}

/// Averages interleaved channels down to one. Trailing partial frames are dropped.
pub fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

pub fn resample(audio: &[f32], src_rate: u32, dst_rate: u32) -> anyhow::Result<Vec<f32>> {
    if audio.is_empty() || src_rate == 0 || dst_rate == 0 || src_rate == dst_rate {
        return Ok(audio.to_vec());
    }
    debug!(src_rate, dst_rate, "Resampling audio");

    if audio.len() < 32 {
        return Ok(resample_linear(audio, src_rate, dst_rate));
    }

    let params = SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = dst_rate as f64 / src_rate as f64;
    let expected = (audio.len() as f64 * ratio).round() as usize;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, RESAMPLE_CHUNK, 1)
        .context("failed to build resampler")?;
    let delay = resampler.output_delay();

    let mut out = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK);
    let mut frames = audio.chunks_exact(RESAMPLE_CHUNK);
    for frame in &mut frames {
        let processed = resampler
            .process(&[frame][..], None)
            .context("resampling failed")?;
        out.extend(processed.into_iter().next().unwrap_or_default());
    }
    let rest = frames.remainder();
    if !rest.is_empty() {
        let processed = resampler
            .process_partial(Some(&[rest][..]), None)
            .context("resampling failed")?;
        out.extend(processed.into_iter().next().unwrap_or_default());
    }
    // flush the filter tail
    while out.len() < delay + expected {
        let flushed = resampler
            .process_partial(None::<&[&[f32]]>, None)
            .context("resampling failed")?;
        let flushed = flushed.into_iter().next().unwrap_or_default();
        if flushed.is_empty() {
            break;
        }
        out.extend(flushed);
    }

    out.drain(..delay.min(out.len()));
    out.resize(expected, 0.0);
    Ok(out)
}

fn resample_linear(audio: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    let ratio = dst_rate as f64 / src_rate as f64;
    let out_len = ((audio.len() as f64) * ratio).round().max(1.0) as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 / ratio;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = audio[idx.min(audio.len() - 1)];
            let b = audio[(idx + 1).min(audio.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

/// Splits `samples` into consecutive non-overlapping windows of
/// `chunk_secs` seconds. The last window may be shorter.
pub fn chunk(samples: &[f32], sample_rate: u32, chunk_secs: f64) -> Vec<&[f32]> {
    let chunk_len = ((chunk_secs * sample_rate as f64) as usize).max(1);
    samples.chunks(chunk_len).collect()
}

pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|s| {
            let s = if s.is_finite() { s.clamp(-1.0, 1.0) } else { 0.0 };
            (s * i16::MAX as f32).round() as i16
        })
        .collect()
}

/// Encodes mono PCM16 samples as a WAV file in memory.
pub fn encode_wav_i16(samples: &[i16], sample_rate: u32) -> anyhow::Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).context("failed to start WAV stream")?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize().context("failed to finalize WAV stream")?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_is_ceiling_of_length_over_window() {
        let rate = 16_000;
        for (len, secs, expected) in [
            (16_000 * 65, 30.0, 3),
            (16_000 * 60, 30.0, 2),
            (1, 30.0, 1),
            (16_000 * 30 + 1, 30.0, 2),
            (0, 30.0, 0),
        ] {
            let samples = vec![0.0f32; len];
            let chunks = chunk(&samples, rate, secs);
            let window = (secs * rate as f64) as usize;
            assert_eq!(chunks.len(), len.div_ceil(window), "len={len}");
            assert_eq!(chunks.len(), expected, "len={len}");
            assert_eq!(chunks.iter().map(|c| c.len()).sum::<usize>(), len);
        }
    }

    #[test]
    fn downmix_averages_channels() {
        let stereo = [1.0, 0.0, 0.5, 0.5, -1.0, 1.0];
        assert_eq!(downmix(&stereo, 2), vec![0.5, 0.5, 0.0]);
        assert_eq!(downmix(&[0.25, 0.75], 1), vec![0.25, 0.75]);
    }

    #[test]
    fn encoded_wav_decodes_with_same_spec_and_length() {
        let samples: Vec<i16> = (0..2_400).map(|i| ((i % 200) * 100) as i16).collect();
        let wav = encode_wav_i16(&samples, 24_000).unwrap();
        assert_eq!(wav.len(), 44 + samples.len() * 2);

        let decoded = decode_wav(&wav).unwrap();
        assert_eq!(decoded.channels, 1);
        assert_eq!(decoded.sample_rate, 24_000);
        assert_eq!(decoded.frames(), samples.len());
        assert!((decoded.duration_secs() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn resample_length_is_rounded_rate_ratio() {
        let tone: Vec<f32> = (0..4_410)
            .map(|i| (i as f32 * 0.05).sin() * 0.5)
            .collect();
        assert_eq!(resample(&tone, 44_100, 16_000).unwrap().len(), 1_600);
        assert_eq!(resample(&tone, 16_000, 16_000).unwrap().len(), tone.len());

        let minute = vec![0.1f32; 60 * 8_000];
        assert_eq!(resample(&minute, 8_000, 16_000).unwrap().len(), 960_000);
        let half_minute = vec![0.1f32; 30 * 44_100];
        assert_eq!(resample(&half_minute, 44_100, 16_000).unwrap().len(), 480_000);
    }

    #[test]
    fn resample_keeps_signal_aligned() {
        let rate = 8_000.0f32;
        let sine: Vec<f32> = (0..8_000)
            .map(|i| (2.0 * std::f32::consts::PI * 50.0 * i as f32 / rate).sin() * 0.5)
            .collect();
        let out = resample(&sine, 8_000, 16_000).unwrap();
        for i in (1_000..7_000).step_by(250) {
            assert!((out[2 * i] - sine[i]).abs() < 0.02, "sample {i}: {} vs {}", out[2 * i], sine[i]);
        }
    }

    #[test]
    fn garbage_is_rejected_as_client_error() {
        let err = decode_wav(b"RIFF but not really").unwrap_err();
        assert_eq!(err.kind, crate::ClientErrorKind::Malformed);
    }

    #[test]
    fn float_to_pcm16_clamps() {
        assert_eq!(f32_to_i16(&[0.0, 2.0, -2.0, f32::NAN]), vec![0, 32767, -32767, 0]);
    }
}
