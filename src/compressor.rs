//! A simple compressor based on absolute values, with independent
//! attack/release times. There is no sidechain or lookahead, but the peak
//! value is shared between both channels, so stereo imaging is preserved.

#[inline]
fn compressor_knee(
    x: f32,
    threshold: f32,
    inv_threshold: f32,
    inv_ratio_minus_one: f32,
    postgain: f32,
) -> f32 {
    debug_assert!(inv_ratio_minus_one <= 0.0);
    if x > threshold {
        postgain * (x * inv_threshold).powf(inv_ratio_minus_one)
    } else {
        postgain
    }
}

/// Sample-accurate envelope follower and gain computer for interleaved
/// stereo buffers.
#[derive(Debug, Clone)]
pub struct StereoCompressor {
    sample_rate: f32,
    peak_level: f32,
    compr_level: f32,
    scalefactor: f32,
}

impl StereoCompressor {
    /// Create a compressor running at the given sample rate.
    pub fn new(sample_rate: f32) -> Self {
        let mut compressor = Self {
            sample_rate,
            peak_level: 0.0,
            compr_level: 0.0,
            scalefactor: 0.0,
        };
        compressor.reset();
        compressor
    }

    /// Reset the envelope state.
    pub fn reset(&mut self) {
        self.peak_level = 0.1;
        self.compr_level = 0.1;
        self.scalefactor = 0.0;
    }

    /// Process interleaved stereo data in-place. Attack and release times are
    /// in seconds; threshold and makeup gain are linear. A ratio above 63 is
    /// treated as infinite (brick wall).
    pub fn process(
        &mut self,
        buf: &mut [f32],
        threshold: f32,
        ratio: f32,
        attack_time: f32,
        release_time: f32,
        makeup_gain: f32,
    ) {
        let mut attack_increment = 2.0f32.powf(1.0 / (attack_time * self.sample_rate + 1.0));
        if attack_time == 0.0 {
            attack_increment = 100000.0; // Instant attack reaction.
        }
        let release_increment = 2.0f32.powf(-1.0 / (release_time * self.sample_rate + 1.0));
        let peak_increment = 2.0f32.powf(-1.0 / (0.003 * self.sample_rate + 1.0));

        let mut inv_ratio_minus_one = 1.0 / ratio - 1.0;
        if ratio > 63.0 {
            inv_ratio_minus_one = -1.0; // Infinite ratio.
        }
        let inv_threshold = 1.0 / threshold;

        if inv_ratio_minus_one >= 0.0 {
            for sample in buf.iter_mut() {
                *sample *= makeup_gain;
            }
            return;
        }

        let mut peak_level = self.peak_level;
        let mut compr_level = self.compr_level;

        for frame in buf.chunks_exact_mut(2) {
            peak_level = peak_level.max(frame[0].abs()).max(frame[1].abs());

            if peak_level > compr_level {
                compr_level = (compr_level * attack_increment).min(peak_level);
            } else {
                compr_level = (compr_level * release_increment).max(0.0001);
            }

            let scalefactor_with_gain = compressor_knee(
                compr_level,
                threshold,
                inv_threshold,
                inv_ratio_minus_one,
                makeup_gain,
            );

            frame[0] *= scalefactor_with_gain;
            frame[1] *= scalefactor_with_gain;

            peak_level = (peak_level * peak_increment).max(0.0001);
        }

        // Store the attenuation level for metering.
        self.scalefactor = compressor_knee(
            compr_level,
            threshold,
            inv_threshold,
            inv_ratio_minus_one,
            1.0,
        );

        self.peak_level = peak_level;
        self.compr_level = compr_level;
    }

    /// Last level estimate (after attack/decay applied).
    pub fn level(&self) -> f32 {
        self.compr_level
    }

    /// Last attenuation factor applied, e.g. 0.2 if 5x compression is
    /// currently in effect.
    pub fn attenuation(&self) -> f32 {
        self.scalefactor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(n: usize, amplitude: f32) -> Vec<f32> {
        (0..n)
            .flat_map(|i| {
                let x = amplitude
                    * (2.0 * std::f32::consts::PI * 1000.0 * i as f32 / 48000.0).sin();
                [x, x]
            })
            .collect()
    }

    fn peak(buf: &[f32]) -> f32 {
        buf.iter().fold(0.0f32, |acc, &x| acc.max(x.abs()))
    }

    #[test]
    fn below_threshold_applies_makeup_only() {
        let mut compressor = StereoCompressor::new(48000.0);
        let mut buf = sine(4800, 0.01);
        let reference = buf.clone();
        compressor.process(&mut buf, 0.1, 20.0, 0.005, 0.040, 2.0);
        for (out, inp) in buf.iter().zip(&reference) {
            assert!((out - inp * 2.0).abs() < 1e-4);
        }
    }

    #[test]
    fn loud_signal_is_reduced() {
        let mut compressor = StereoCompressor::new(48000.0);
        // Let the envelope settle over two seconds of loud input.
        let mut buf = sine(96000, 0.9);
        compressor.process(&mut buf, 0.1, 20.0, 0.005, 0.040, 1.0);
        let tail_peak = peak(&buf[96000..]);
        assert!(tail_peak < 0.2, "tail peak {tail_peak}");
        // The reported attenuation should match the knee at the tracked level.
        let expected = compressor_knee(compressor.level(), 0.1, 10.0, 1.0 / 20.0 - 1.0, 1.0);
        assert!((compressor.attenuation() - expected).abs() < 1e-6);
    }

    #[test]
    fn brick_wall_caps_near_threshold() {
        let mut compressor = StereoCompressor::new(48000.0);
        let mut buf = sine(96000, 0.9);
        compressor.process(&mut buf, 0.1, 100.0, 0.0, 0.040, 1.0);
        let tail_peak = peak(&buf[96000..]);
        assert!(tail_peak < 0.12, "tail peak {tail_peak}");
    }

    #[test]
    fn unity_ratio_is_passthrough() {
        let mut compressor = StereoCompressor::new(48000.0);
        let mut buf = sine(4800, 0.9);
        let reference = buf.clone();
        compressor.process(&mut buf, 0.1, 1.0, 0.005, 0.040, 1.0);
        assert_eq!(buf, reference);
    }
}
