//! Fixed-duration segmentation of the captured sample stream.

use serde::Serialize;
use std::time::Duration;

/// A bounded slice of captured audio handed to transcription as one unit.
/// Immutable once finalized: the segmenter moves it out and never touches
/// it again.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioSegment {
    /// Monotonic per session, starting at 0.
    pub sequence: u64,
    #[serde(skip)]
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Offset of the segment's first sample from the start of capture.
    pub started_at: Duration,
}

impl AudioSegment {
    pub fn duration(&self) -> Duration {
        let per_second = u64::from(self.sample_rate) * u64::from(self.channels);
        if per_second == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / per_second as f64)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SegmenterConfig {
    pub segment_seconds: u64,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Accumulates frames and emits a segment whenever the configured duration
/// worth of samples is buffered. The final partial segment is emitted on
/// `finish`, however short; zero captured samples emit nothing.
pub struct Segmenter {
    config: SegmenterConfig,
    buffer: Vec<i16>,
    next_sequence: u64,
    consumed_samples: u64,
}

impl Segmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            config,
            buffer: Vec::new(),
            next_sequence: 0,
            consumed_samples: 0,
        }
    }

    fn samples_per_segment(&self) -> usize {
        (self.config.sample_rate as usize)
            * (self.config.channels as usize)
            * (self.config.segment_seconds.max(1) as usize)
    }

    /// Append a frame; returns every segment completed by it (a frame
    /// longer than the segment size can complete several).
    pub fn push(&mut self, frame: &[i16]) -> Vec<AudioSegment> {
        self.buffer.extend_from_slice(frame);
        let threshold = self.samples_per_segment();
        let mut completed = Vec::new();
        while self.buffer.len() >= threshold {
            let rest = self.buffer.split_off(threshold);
            let full = std::mem::replace(&mut self.buffer, rest);
            completed.push(self.finalize(full));
        }
        completed
    }

    /// Flush the tail. Returns the final short segment, or None when no
    /// samples are buffered.
    pub fn finish(mut self) -> Option<AudioSegment> {
        if self.buffer.is_empty() {
            return None;
        }
        let remainder = std::mem::take(&mut self.buffer);
        Some(self.finalize(remainder))
    }

    /// Sequence numbers issued so far.
    pub fn issued(&self) -> u64 {
        self.next_sequence
    }

    fn finalize(&mut self, samples: Vec<i16>) -> AudioSegment {
        let per_second = u64::from(self.config.sample_rate) * u64::from(self.config.channels);
        let started_at = if per_second == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(self.consumed_samples as f64 / per_second as f64)
        };
        let segment = AudioSegment {
            sequence: self.next_sequence,
            sample_rate: self.config.sample_rate,
            channels: self.config.channels,
            started_at,
            samples,
        };
        self.next_sequence += 1;
        self.consumed_samples += segment.samples.len() as u64;
        segment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(segment_seconds: u64) -> SegmenterConfig {
        SegmenterConfig {
            segment_seconds,
            sample_rate: 16_000,
            channels: 1,
        }
    }

    #[test]
    fn twenty_five_seconds_make_three_segments() {
        let mut segmenter = Segmenter::new(config(10));
        // 25s of mono 16kHz audio in 1s frames
        let frame = vec![0i16; 16_000];
        let mut segments = Vec::new();
        for _ in 0..25 {
            segments.extend(segmenter.push(&frame));
        }
        segments.extend(segmenter.finish());

        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].duration(), Duration::from_secs(10));
        assert_eq!(segments[1].duration(), Duration::from_secs(10));
        assert_eq!(segments[2].duration(), Duration::from_secs(5));
        let sequences: Vec<u64> = segments.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[test]
    fn zero_captured_samples_emit_nothing() {
        let segmenter = Segmenter::new(config(10));
        assert!(segmenter.finish().is_none());
    }

    #[test]
    fn short_capture_flushes_one_partial_segment() {
        let mut segmenter = Segmenter::new(config(10));
        assert!(segmenter.push(&vec![0i16; 8_000]).is_empty());
        let tail = segmenter.finish().expect("partial segment");
        assert_eq!(tail.sequence, 0);
        assert_eq!(tail.duration(), Duration::from_millis(500));
    }

    #[test]
    fn oversized_frame_completes_multiple_segments() {
        let mut segmenter = Segmenter::new(config(1));
        let frame = vec![0i16; 16_000 * 3 + 100];
        let segments = segmenter.push(&frame);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[2].started_at, Duration::from_secs(2));
        let tail = segmenter.finish().expect("tail");
        assert_eq!(tail.sequence, 3);
        assert_eq!(tail.samples.len(), 100);
        assert_eq!(tail.started_at, Duration::from_secs(3));
    }

    #[test]
    fn stereo_doubles_samples_per_segment() {
        let mut segmenter = Segmenter::new(SegmenterConfig {
            segment_seconds: 1,
            sample_rate: 16_000,
            channels: 2,
        });
        assert!(segmenter.push(&vec![0i16; 16_000]).is_empty());
        let segments = segmenter.push(&vec![0i16; 16_000]);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].duration(), Duration::from_secs(1));
    }
}
