//! Measurement of left/right stereo correlation. +1 is pure mono (okay but
//! not ideal), 0 is no correlation (usually bad, unless it is due to
//! silence), strongly negative values mean inverted phase (bad). Typical
//! values for e.g. music are somewhere around +0.7.
//!
//! This is the regular Pearson correlation with µ_L and µ_R taken to be 0
//! (no DC offset), computed over IIR-lowpassed inputs so that older material
//! is weighed less than newer, depending on the falloff window.

/// Lowpass-filtered L/R correlation coefficient.
#[derive(Debug, Clone)]
pub struct CorrelationMeasurer {
    w1: f32,
    w2: f32,

    // Filtered values of the left and right channel, respectively.
    zl: f32,
    zr: f32,

    // Filtered values of l², r² and l·r (of the filtered channels above);
    // together they make up what we need to compute the correlation.
    zll: f32,
    zlr: f32,
    zrr: f32,
}

impl CorrelationMeasurer {
    /// Create a measurer with the default 1 kHz lowpass and 150 ms falloff.
    pub fn new(sample_rate: u32) -> Self {
        Self::with_parameters(sample_rate, 1000.0, 0.150)
    }

    /// Create a measurer with explicit lowpass cutoff and falloff window.
    pub fn with_parameters(
        sample_rate: u32,
        lowpass_cutoff_hz: f32,
        falloff_seconds: f32,
    ) -> Self {
        Self {
            w1: 2.0 * std::f32::consts::PI * lowpass_cutoff_hz / sample_rate as f32,
            w2: 1.0 / (falloff_seconds * sample_rate as f32),
            zl: 0.0,
            zr: 0.0,
            zll: 0.0,
            zlr: 0.0,
            zrr: 0.0,
        }
    }

    /// Clear all filter state.
    pub fn reset(&mut self) {
        self.zl = 0.0;
        self.zr = 0.0;
        self.zll = 0.0;
        self.zlr = 0.0;
        self.zrr = 0.0;
    }

    /// Accumulate a buffer of interleaved stereo samples.
    pub fn process_samples(&mut self, samples: &[f32]) {
        assert!(samples.len() % 2 == 0);

        let mut l = self.zl;
        let mut r = self.zr;
        let mut ll = self.zll;
        let mut lr = self.zlr;
        let mut rr = self.zrr;
        let w1 = self.w1;
        let w2 = self.w2;

        for frame in samples.chunks_exact(2) {
            // The 1e-15 epsilon keeps the filters out of denormal range.
            l += w1 * (frame[0] - l) + 1e-15;
            r += w1 * (frame[1] - r) + 1e-15;
            lr += w2 * (l * r - lr);
            ll += w2 * (l * l - ll);
            rr += w2 * (r * r - rr);
        }

        self.zl = l;
        self.zr = r;
        self.zll = ll;
        self.zlr = lr;
        self.zrr = rr;
    }

    /// The current correlation coefficient, in [-1, 1].
    pub fn correlation(&self) -> f32 {
        // The 1e-12 epsilon avoids division by zero; zll and zrr are both
        // always non-negative, so the square root is safe.
        self.zlr / (self.zll * self.zrr + 1e-12).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_frames(n: usize, gain_l: f32, gain_r: f32) -> Vec<f32> {
        (0..n)
            .flat_map(|i| {
                let x = (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 48000.0).sin();
                [gain_l * x, gain_r * x]
            })
            .collect()
    }

    #[test]
    fn mono_signal_is_fully_correlated() {
        let mut measurer = CorrelationMeasurer::new(48000);
        measurer.process_samples(&sine_frames(48000, 0.5, 0.5));
        assert!(measurer.correlation() > 0.99);
    }

    #[test]
    fn inverted_signal_is_anticorrelated() {
        let mut measurer = CorrelationMeasurer::new(48000);
        measurer.process_samples(&sine_frames(48000, 0.5, -0.5));
        assert!(measurer.correlation() < -0.99);
    }

    #[test]
    fn silence_reads_near_zero() {
        let mut measurer = CorrelationMeasurer::new(48000);
        measurer.process_samples(&vec![0.0; 9600]);
        assert!(measurer.correlation().abs() < 1e-3);
    }

    #[test]
    fn reset_clears_history() {
        let mut measurer = CorrelationMeasurer::new(48000);
        measurer.process_samples(&sine_frames(48000, 0.5, -0.5));
        measurer.reset();
        assert_eq!(measurer.correlation(), 0.0);
    }
}
