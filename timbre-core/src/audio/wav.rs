//! WAV decode/encode on top of `hound`.
//!
//! Everything the pipeline moves through blob storage is WAV. Decoding
//! accepts 8/16/24/32-bit integer PCM and 32-bit float, downmixing any channel
//! count to mono by averaging. Encoding always writes 16-bit mono PCM.

use std::io::Cursor;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use super::Waveform;
use crate::error::{Result, TimbreError};

pub fn decode(bytes: &[u8]) -> Result<Waveform> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(TimbreError::InvalidAudio(
            "not a RIFF/WAVE stream".into(),
        ));
    }

    let reader = WavReader::new(Cursor::new(bytes)).map_err(invalid)?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(invalid)?,
        SampleFormat::Int => {
            let scale = 1.0 / (1u64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(invalid)?
        }
    };

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    Ok(Waveform::new(samples, spec.sample_rate))
}

pub fn encode(waveform: &Waveform) -> Result<Vec<u8>> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: waveform.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut out = Vec::with_capacity(44 + waveform.len() * 2);
    {
        let mut writer = WavWriter::new(Cursor::new(&mut out), spec).map_err(invalid)?;
        for &sample in &waveform.samples {
            // Same 2^15 scale as `decode`, so decode/encode round trips are exact.
            let v = (sample * 32_768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            writer.write_sample(v).map_err(invalid)?;
        }
        writer.finalize().map_err(invalid)?;
    }
    Ok(out)
}

fn invalid(e: hound::Error) -> TimbreError {
    TimbreError::InvalidAudio(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_wav(left: &[i16], right: &[i16], rate: u32) -> Vec<u8> {
        let spec = WavSpec {
            channels: 2,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut out = Vec::new();
        {
            let mut w = WavWriter::new(Cursor::new(&mut out), spec).unwrap();
            for (l, r) in left.iter().zip(right) {
                w.write_sample(*l).unwrap();
                w.write_sample(*r).unwrap();
            }
            w.finalize().unwrap();
        }
        out
    }

    #[test]
    fn encode_then_decode_keeps_rate_and_length() {
        let w = Waveform::new((0..1_000).map(|i| (i as f32 * 0.01).sin() * 0.5).collect(), 22_050);
        let bytes = encode(&w).unwrap();
        let back = decode(&bytes).unwrap();
        assert_eq!(back.sample_rate, 22_050);
        assert_eq!(back.len(), 1_000);
        for (a, b) in w.samples.iter().zip(&back.samples) {
            assert!((a - b).abs() < 1e-3);
        }
        assert_eq!(encode(&back).unwrap(), bytes);
    }

    #[test]
    fn stereo_is_downmixed_by_averaging() {
        let bytes = stereo_wav(&[16_384, 0], &[0, -16_384], 44_100);
        let w = decode(&bytes).unwrap();
        assert_eq!(w.len(), 2);
        assert!((w.samples[0] - 0.25).abs() < 1e-4);
        assert!((w.samples[1] + 0.25).abs() < 1e-4);
    }

    #[test]
    fn non_wav_input_is_rejected() {
        let err = decode(b"ID3\x04\x00\x00\x00\x00\x00\x00not audio").unwrap_err();
        assert!(matches!(err, TimbreError::InvalidAudio(_)));
        assert!(matches!(decode(b""), Err(TimbreError::InvalidAudio(_))));
    }

    #[test]
    fn float_wav_is_read_verbatim() {
        let spec = WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut out = Vec::new();
        {
            let mut w = WavWriter::new(Cursor::new(&mut out), spec).unwrap();
            for s in [0.125f32, -0.5, 0.75] {
                w.write_sample(s).unwrap();
            }
            w.finalize().unwrap();
        }
        let w = decode(&out).unwrap();
        assert_eq!(w.samples, vec![0.125, -0.5, 0.75]);
    }
}
