//! EBU R128 loudness measurement and true-peak metering.
//!
//! The BS.1770 K-weighting and 100 ms power windows come from the `bs1770`
//! crate; the R128 quantities (momentary, short-term, integrated, loudness
//! range) are derived from those windows. The peak meter oversamples the
//! program 4x so inter-sample peaks are caught.

use bs1770::{ChannelLoudnessMeter, Power, Windows100ms};
use rubato::{FftFixedIn, Resampler};

/// Digital peak of a buffer (largest absolute sample value).
pub fn find_peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |m, &x| m.max(x.abs()))
}

// Momentary loudness integrates 400 ms, short-term 3 s, both as multiples of
// the 100 ms measurement windows.
const MOMENTARY_WINDOWS: usize = 4;
const SHORT_TERM_WINDOWS: usize = 30;

// Gates for the loudness range statistic (EBU Tech 3342): drop short-term
// values below -70 LUFS, then drop values more than 20 LU below the mean of
// what remains, then take the 10th..95th percentile span.
const LRA_ABSOLUTE_GATE_LUFS: f32 = -70.0;
const LRA_RELATIVE_GATE_LU: f32 = 20.0;

/// Stereo R128 meter: momentary, short-term, integrated and loudness-range.
pub struct LoudnessMeter {
    sample_rate: u32,
    channel_meters: [ChannelLoudnessMeter; 2],
    windows_consumed: usize,
    // Stereo power per 100 ms window (sum of channel powers), since the
    // start of integration.
    stereo_windows: Vec<Power>,
    // Short-term power per 100 ms step, once 3 s of audio exist.
    short_term_powers: Vec<Power>,
}

impl LoudnessMeter {
    /// Create a meter and start integrating.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channel_meters: [
                ChannelLoudnessMeter::new(sample_rate),
                ChannelLoudnessMeter::new(sample_rate),
            ],
            windows_consumed: 0,
            stereo_windows: Vec::new(),
            short_term_powers: Vec::new(),
        }
    }

    /// Restart integration from scratch.
    pub fn reset(&mut self) {
        *self = Self::new(self.sample_rate);
    }

    /// Accumulate one block of program audio.
    pub fn process(&mut self, left: &[f32], right: &[f32]) {
        debug_assert_eq!(left.len(), right.len());
        self.channel_meters[0].push(left.iter().copied());
        self.channel_meters[1].push(right.iter().copied());

        let left_windows = self.channel_meters[0].as_100ms_windows();
        let right_windows = self.channel_meters[1].as_100ms_windows();
        let complete = left_windows.len().min(right_windows.len());
        for i in self.windows_consumed..complete {
            self.stereo_windows
                .push(Power(left_windows.inner[i].0 + right_windows.inner[i].0));
            if self.stereo_windows.len() >= SHORT_TERM_WINDOWS {
                let start = self.stereo_windows.len() - SHORT_TERM_WINDOWS;
                let sum: f32 = self.stereo_windows[start..].iter().map(|p| p.0).sum();
                self.short_term_powers
                    .push(Power(sum / SHORT_TERM_WINDOWS as f32));
            }
        }
        self.windows_consumed = complete;
    }

    fn loudness_over_last(&self, count: usize) -> f32 {
        if self.stereo_windows.is_empty() {
            return f32::NEG_INFINITY;
        }
        let start = self.stereo_windows.len().saturating_sub(count);
        let windows = &self.stereo_windows[start..];
        let mean = windows.iter().map(|p| p.0).sum::<f32>() / windows.len() as f32;
        Power(mean).loudness_lkfs()
    }

    /// Momentary loudness (400 ms), in LUFS.
    pub fn loudness_m(&self) -> f32 {
        self.loudness_over_last(MOMENTARY_WINDOWS)
    }

    /// Short-term loudness (3 s), in LUFS.
    pub fn loudness_s(&self) -> f32 {
        self.loudness_over_last(SHORT_TERM_WINDOWS)
    }

    /// Integrated (gated) loudness since the last reset, in LUFS.
    pub fn integrated(&self) -> f32 {
        if self.stereo_windows.is_empty() {
            return f32::NEG_INFINITY;
        }
        bs1770::gated_mean(Windows100ms {
            inner: &self.stereo_windows[..],
        })
        .loudness_lkfs()
    }

    /// Low and high ends of the loudness range, in LUFS. NaN until enough
    /// material has been measured.
    pub fn loudness_range(&self) -> (f32, f32) {
        let abs_gated: Vec<Power> = self
            .short_term_powers
            .iter()
            .copied()
            .filter(|p| p.loudness_lkfs() >= LRA_ABSOLUTE_GATE_LUFS)
            .collect();
        if abs_gated.is_empty() {
            return (f32::NAN, f32::NAN);
        }

        let mean_power = abs_gated.iter().map(|p| p.0).sum::<f32>() / abs_gated.len() as f32;
        let relative_gate = Power(mean_power).loudness_lkfs() - LRA_RELATIVE_GATE_LU;
        let mut gated: Vec<f32> = abs_gated
            .iter()
            .map(|p| p.loudness_lkfs())
            .filter(|&l| l >= relative_gate)
            .collect();
        if gated.is_empty() {
            return (f32::NAN, f32::NAN);
        }

        gated.sort_by(|a, b| a.total_cmp(b));
        let percentile = |fraction: f32| {
            let pos = (fraction * (gated.len() - 1) as f32).round() as usize;
            gated[pos]
        };
        (percentile(0.10), percentile(0.95))
    }
}

/// Peak meter that upsamples the program 4x before scanning for the maximum,
/// so that inter-sample peaks register. The reading is monotone until
/// [`TruePeakMeter::reset`].
pub struct TruePeakMeter {
    sample_rate: u32,
    resampler: FftFixedIn<f32>,
    chunk_in: usize,
    pending: [Vec<f32>; 2],
    out_scratch: Vec<Vec<f32>>,
    peak: f32,
}

impl TruePeakMeter {
    const CHUNK_IN: usize = 480;

    /// Create a meter for the given program sample rate.
    pub fn new(sample_rate: u32) -> Self {
        let resampler = Self::make_resampler(sample_rate);
        let out_len = resampler.output_frames_max();
        Self {
            sample_rate,
            resampler,
            chunk_in: Self::CHUNK_IN,
            pending: [Vec::new(), Vec::new()],
            out_scratch: vec![vec![0.0; out_len]; 2],
            peak: 0.0,
        }
    }

    fn make_resampler(sample_rate: u32) -> FftFixedIn<f32> {
        FftFixedIn::<f32>::new(
            sample_rate as usize,
            sample_rate as usize * 4,
            Self::CHUNK_IN,
            2,
            2,
        )
        .expect("fixed 4x oversampler parameters are always valid")
    }

    /// Clear the held peak and the oversampler history.
    pub fn reset(&mut self) {
        self.resampler = Self::make_resampler(self.sample_rate);
        self.pending[0].clear();
        self.pending[1].clear();
        self.peak = 0.0;
    }

    /// Accumulate one block of program audio.
    pub fn process(&mut self, left: &[f32], right: &[f32]) {
        debug_assert_eq!(left.len(), right.len());
        self.pending[0].extend_from_slice(left);
        self.pending[1].extend_from_slice(right);

        while self.pending[0].len() >= self.chunk_in {
            let input = [
                &self.pending[0][..self.chunk_in],
                &self.pending[1][..self.chunk_in],
            ];
            match self
                .resampler
                .process_into_buffer(&input, &mut self.out_scratch, None)
            {
                Ok((consumed, produced)) => {
                    for channel in &self.out_scratch {
                        self.peak = self.peak.max(find_peak(&channel[..produced]));
                    }
                    self.pending[0].drain(..consumed);
                    self.pending[1].drain(..consumed);
                }
                Err(err) => {
                    log::error!("peak oversampler failed: {err}");
                    self.pending[0].clear();
                    self.pending[1].clear();
                    break;
                }
            }
        }
    }

    /// The held peak, linear.
    pub fn peak(&self) -> f32 {
        self.peak
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(n: usize, freq: f32, amplitude: f32) -> Vec<f32> {
        (0..n)
            .map(|i| amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / 48000.0).sin())
            .collect()
    }

    #[test]
    fn find_peak_scans_magnitudes() {
        assert_eq!(find_peak(&[]), 0.0);
        assert_eq!(find_peak(&[0.1, -0.8, 0.3]), 0.8);
    }

    #[test]
    fn sine_loudness_is_plausible() {
        // A 997 Hz sine at amplitude 0.25 in both channels: per-channel
        // K-weighted power ~ a^2/2, stereo sum doubles it, so about
        // -0.691 + 10*log10(0.0625) ~ -12.7 LUFS.
        let mut meter = LoudnessMeter::new(48000);
        let signal = sine(48000 * 5, 997.0, 0.25);
        meter.process(&signal, &signal);
        let short = meter.loudness_s();
        assert!((-14.5..=-11.0).contains(&short), "short-term {short}");
        let momentary = meter.loudness_m();
        assert!((momentary - short).abs() < 1.0);
        let integrated = meter.integrated();
        assert!((-14.5..=-11.0).contains(&integrated), "integrated {integrated}");
    }

    #[test]
    fn silence_reads_minus_infinity() {
        let mut meter = LoudnessMeter::new(48000);
        meter.process(&vec![0.0; 48000], &vec![0.0; 48000]);
        assert_eq!(meter.loudness_m(), f32::NEG_INFINITY);
    }

    #[test]
    fn steady_signal_has_narrow_range() {
        let mut meter = LoudnessMeter::new(48000);
        let signal = sine(48000 * 10, 997.0, 0.25);
        meter.process(&signal, &signal);
        let (low, high) = meter.loudness_range();
        assert!(!low.is_nan() && !high.is_nan());
        assert!(high - low < 1.0, "range [{low}, {high}]");
    }

    #[test]
    fn true_peak_tracks_sine_amplitude() {
        let mut meter = TruePeakMeter::new(48000);
        let signal = sine(48000, 997.0, 0.5);
        meter.process(&signal, &signal);
        let peak = meter.peak();
        assert!((0.48..=0.52).contains(&peak), "peak {peak}");
    }

    #[test]
    fn reset_clears_peak() {
        let mut meter = TruePeakMeter::new(48000);
        let signal = sine(4800, 997.0, 0.5);
        meter.process(&signal, &signal);
        meter.reset();
        assert_eq!(meter.peak(), 0.0);
    }
}
