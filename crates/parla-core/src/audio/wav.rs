//! In-memory WAV encoding of finalized segments.
//!
//! Providers accept the capture's native sample rate, so segments are
//! shipped as 16-bit PCM WAV without resampling or temp files.

use crate::error::PipelineError;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::io::Cursor;

pub fn encode_wav(
    samples: &[i16],
    sample_rate: u32,
    channels: u16,
) -> Result<Vec<u8>, PipelineError> {
    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec)
            .map_err(|err| PipelineError::Validation(format!("wav encode: {err}")))?;
        for sample in samples {
            writer
                .write_sample(*sample)
                .map_err(|err| PipelineError::Validation(format!("wav encode: {err}")))?;
        }
        writer
            .finalize()
            .map_err(|err| PipelineError::Validation(format!("wav encode: {err}")))?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_wav_round_trips_through_hound() {
        let samples: Vec<i16> = (0..1600).map(|i| (i % 128) as i16).collect();
        let bytes = encode_wav(&samples, 16_000, 1).unwrap();

        let reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.sample_rate, 16_000);
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.bits_per_sample, 16);
        let decoded: Vec<i16> = reader.into_samples().map(|s| s.unwrap()).collect();
        assert_eq!(decoded, samples);
    }
}
