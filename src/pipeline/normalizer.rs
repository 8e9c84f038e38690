//! Audio normalization
//!
//! Converts whatever the source produces into fixed real-time audio frames:
//! 48 kHz, stereo, packed s16, 20 ms per frame. Output timestamps are derived
//! from the number of samples emitted so far, never from the input timestamps.

use crate::assets::{AUDIO_CHANNELS, AUDIO_SAMPLE_RATE, AUDIO_SAMPLES_PER_FRAME};
use crate::pipeline::types::{AudioFrame, TimeBase};

/// Stateful linear-interpolation resampler for interleaved stereo.
///
/// Keeps the last input sample and the read position between calls, so
/// splitting the input into frames does not change the output. Positions are
/// kept in units of `1 / to_rate` input samples to stay exact.
struct LinearResampler {
    from_rate: u32,
    to_rate: u32,
    /// Read position of the next output sample, relative to `prev` (or to the
    /// first input sample when there is no `prev` yet)
    pos: i64,
    prev: Option<[i16; 2]>,
}

impl LinearResampler {
    fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            from_rate,
            to_rate,
            pos: 0,
            prev: None,
        }
    }

    fn process(&mut self, input: &[[i16; 2]], out: &mut Vec<i16>) {
        if self.from_rate == self.to_rate {
            for s in input {
                out.extend_from_slice(s);
            }
            return;
        }
        if input.is_empty() {
            return;
        }

        let unit = self.to_rate as i64;
        let step = self.from_rate as i64;
        let buf: Vec<[i16; 2]> = self.prev.into_iter().chain(input.iter().copied()).collect();
        let last = (buf.len() - 1) as i64 * unit;

        while self.pos <= last {
            let idx = (self.pos / unit) as usize;
            let frac = (self.pos % unit) as f64 / unit as f64;
            let a = buf[idx];
            let b = buf.get(idx + 1).copied().unwrap_or(a);
            for ch in 0..2 {
                let s = a[ch] as f64 + (b[ch] as f64 - a[ch] as f64) * frac;
                out.push(s.round() as i16);
            }
            self.pos += step;
        }

        self.pos -= last;
        self.prev = buf.last().copied();
    }
}

/// Map interleaved samples with `channels` channels onto stereo
fn to_stereo(samples: &[i16], channels: u16) -> Vec<[i16; 2]> {
    match channels {
        0 => Vec::new(),
        1 => samples.iter().map(|&s| [s, s]).collect(),
        n => samples
            .chunks_exact(n as usize)
            .map(|c| [c[0], c[1]])
            .collect(),
    }
}

/// Resamples and re-chunks audio into fixed-size frames with contiguous timestamps
pub struct AudioNormalizer {
    resampler: Option<LinearResampler>,
    pending: Vec<i16>,
    running_sample_count: i64,
}

impl AudioNormalizer {
    pub fn new() -> Self {
        Self {
            resampler: None,
            pending: Vec::with_capacity(AUDIO_SAMPLES_PER_FRAME * AUDIO_CHANNELS as usize * 2),
            running_sample_count: 0,
        }
    }

    pub fn time_base() -> TimeBase {
        TimeBase::new(1, AUDIO_SAMPLE_RATE as i32)
    }

    /// Samples emitted so far (per channel)
    pub fn running_sample_count(&self) -> i64 {
        self.running_sample_count
    }

    /// Feed one input frame, returning every complete output frame it made available
    pub fn push(&mut self, frame: &AudioFrame) -> Vec<AudioFrame> {
        if frame.sample_rate == 0 || frame.channels == 0 {
            log::warn!(
                "AudioNormalizer: ignoring frame with {} Hz / {} channels",
                frame.sample_rate,
                frame.channels
            );
            return Vec::new();
        }

        if self.resampler.as_ref().map(|r| r.from_rate) != Some(frame.sample_rate) {
            if self.resampler.is_some() {
                log::info!(
                    "AudioNormalizer: input rate changed to {} Hz",
                    frame.sample_rate
                );
            }
            self.resampler = None;
        }
        let resampler = self
            .resampler
            .get_or_insert_with(|| LinearResampler::new(frame.sample_rate, AUDIO_SAMPLE_RATE));

        let stereo = to_stereo(&frame.samples, frame.channels);
        resampler.process(&stereo, &mut self.pending);

        let chunk = AUDIO_SAMPLES_PER_FRAME * AUDIO_CHANNELS as usize;
        let mut out = Vec::with_capacity(self.pending.len() / chunk);
        while self.pending.len() >= chunk {
            let samples: Vec<i16> = self.pending.drain(..chunk).collect();
            out.push(AudioFrame {
                pts: Some(self.running_sample_count),
                time_base: Self::time_base(),
                sample_rate: AUDIO_SAMPLE_RATE,
                channels: AUDIO_CHANNELS,
                samples,
            });
            self.running_sample_count += AUDIO_SAMPLES_PER_FRAME as i64;
        }
        out
    }
}

impl Default for AudioNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(rate: u32, channels: u16, samples: usize, pts: Option<i64>) -> AudioFrame {
        AudioFrame {
            pts,
            time_base: TimeBase::new(1, rate as i32),
            sample_rate: rate,
            channels,
            samples: (0..samples * channels as usize)
                .map(|i| (i % 200) as i16)
                .collect(),
        }
    }

    #[test]
    fn test_output_format() {
        let mut normalizer = AudioNormalizer::new();
        let out = normalizer.push(&input(48_000, 2, 960, Some(0)));

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sample_rate, 48_000);
        assert_eq!(out[0].channels, 2);
        assert_eq!(out[0].sample_count(), 960);
        assert_eq!(out[0].pts, Some(0));
    }

    #[test]
    fn test_timestamps_contiguous_with_jitter() {
        let mut normalizer = AudioNormalizer::new();
        let sizes = [1024usize, 17, 3000, 441, 1, 2048, 999, 4410];
        let mut frames = Vec::new();

        for (i, &n) in sizes.iter().cycle().take(64).enumerate() {
            // garbage input timestamps must not matter
            let pts = if i % 3 == 0 { None } else { Some((i * 7919) as i64) };
            frames.extend(normalizer.push(&input(44_100, 1, n, pts)));
        }

        assert!(frames.len() > 10);
        for pair in frames.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            assert_eq!(
                b.pts.unwrap(),
                a.pts.unwrap() + a.sample_count() as i64,
                "gap between frames"
            );
        }
        assert_eq!(frames[0].pts, Some(0));
        assert_eq!(
            normalizer.running_sample_count(),
            frames.len() as i64 * 960
        );
    }

    #[test]
    fn test_resampled_length_tracks_ratio() {
        let mut normalizer = AudioNormalizer::new();
        let mut total = 0usize;
        // 10 seconds of 44.1 kHz in 1024-sample frames
        for _ in 0..(441_000 / 1024) {
            total += normalizer
                .push(&input(44_100, 2, 1024, None))
                .iter()
                .map(|f| f.sample_count())
                .sum::<usize>();
        }
        let consumed = (441_000 / 1024) * 1024;
        let expected = consumed as f64 * 48_000.0 / 44_100.0;
        // only the last partial chunk may be missing
        assert!((expected - total as f64).abs() <= 960.0 + 2.0);
    }

    #[test]
    fn test_mono_duplicated_to_stereo() {
        let mut normalizer = AudioNormalizer::new();
        let frame = AudioFrame {
            pts: None,
            time_base: TimeBase::new(1, 48_000),
            sample_rate: 48_000,
            channels: 1,
            samples: vec![1234; 960],
        };
        let out = normalizer.push(&frame);
        assert_eq!(out.len(), 1);
        assert!(out[0].samples.iter().all(|&s| s == 1234));
        assert_eq!(out[0].samples.len(), 1920);
    }

    #[test]
    fn test_multichannel_keeps_front_pair() {
        let stereo = to_stereo(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12], 6);
        assert_eq!(stereo, vec![[1, 2], [7, 8]]);
    }

    #[test]
    fn test_interpolation_is_split_invariant() {
        let signal: Vec<[i16; 2]> = (0..3000).map(|i| [(i % 300) as i16, -(i % 300) as i16]).collect();

        let mut whole = LinearResampler::new(44_100, 48_000);
        let mut a = Vec::new();
        whole.process(&signal, &mut a);

        let mut split = LinearResampler::new(44_100, 48_000);
        let mut b = Vec::new();
        for part in signal.chunks(7) {
            split.process(part, &mut b);
        }

        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_input_ignored() {
        let mut normalizer = AudioNormalizer::new();
        assert!(normalizer.push(&input(0, 2, 100, None)).is_empty());
        assert_eq!(normalizer.running_sample_count(), 0);
    }
}
