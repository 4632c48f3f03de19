//! Takes in samples from an input source, possibly with jitter, and outputs a
//! fixed number of samples every iteration. Used to a) change sample rates if
//! needed, and b) deal with input sources whose clock is not locked to the
//! output clock. For every received buffer you call
//! [`ResamplingQueue::add_input_samples`] with the wall-clock time the buffer
//! arrived; when you want output you call
//! [`ResamplingQueue::get_output_samples`] with the number of frames you want,
//! and will get exactly that number back. If the input and output clocks are
//! not in sync, the audio is stretched for you. (If they are _very_ out of
//! sync, this will come through as a pitch shift.) The process introduces some
//! delay; you specify a target delay and the algorithm works to provide
//! exactly that.
//!
//! A/V sync is a much harder problem than one would intuitively assume. This
//! implementation is based on a 2012 paper by Fons Adriaensen, “Controlling
//! adaptive resampling” (<http://kokkinizita.linuxaudio.org/papers/adapt-resamp.pdf>).
//! The paper gives an algorithm that converges to jitter of <100 ns; the basic
//! idea is to measure the _rate_ at which the input queue fills and drains (as
//! opposed to the length of the queue itself), and smoothly adjust the
//! resampling rate so that it reaches steady state at the desired delay.

use std::collections::VecDeque;
use std::time::Instant;

use rubato::{
    Resampler, SincFixedOut, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::device::DeviceSpec;

/// Whether an observation (input buffer or output request) carries a
/// trustworthy timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateAdjustmentPolicy {
    /// Do not update the rate estimator from this call. Primarily useful in
    /// extraordinary situations, such as synthetic silence or dropped frames,
    /// where the timestamp says nothing about the device's clock.
    DoNotAdjustRate,
    /// Normal production; the timestamp is good.
    AdjustRate,
}

// Equivalent to (t_a0, k_a0) or (t_a1, k_a1) in the paper.
#[derive(Debug, Clone, Copy, Default)]
struct InputPoint {
    ts: Option<Instant>,

    // Total number of samples written to the queue at this time point.
    input_samples_received: u64,

    // False if the timestamp should not be used (e.g. it came from synthetic
    // silence); in particular it is then not used for updating
    // current_estimated_freq_in.
    good_sample: bool,
}

// Signed seconds from `a` to `b` (Instant subtraction panics on negative).
fn seconds_between(a: Instant, b: Instant) -> f64 {
    if b >= a {
        (b - a).as_secs_f64()
    } else {
        -((a - b).as_secs_f64())
    }
}

/// Per-device variable-rate resampler with PLL-style delay control.
pub struct ResamplingQueue {
    spec: DeviceSpec,
    freq_in: u32,
    freq_out: u32,
    num_channels: usize,

    resampler: SincFixedOut<f32>,
    in_scratch: Vec<Vec<f32>>,
    out_scratch: Vec<Vec<f32>>,

    // Input samples (interleaved) not yet fed into the resampler.
    buffer: VecDeque<f32>,
    // Resampled output (interleaved) not yet handed to the consumer; the
    // resampler produces fixed-size chunks, the consumer asks for arbitrary
    // counts.
    ready: VecDeque<f32>,

    first_output: bool,
    a0: InputPoint,
    a1: InputPoint,

    // The current rate at which we seem to get input samples, in Hz.
    // For an ideal input, identical to freq_in.
    current_estimated_freq_in: f64,

    total_consumed_samples: i64,

    // Loop filter state.
    z1: f64,
    z2: f64,
    z3: f64,

    // Ratio between the two frequencies.
    ratio: f64,

    // Current correction ratio. ratio * rcorr gives the true ratio; values
    // above 1.0 mean to pitch down (consume input samples more slowly).
    rcorr: f64,

    // How much delay we are expected to have. If the actual delay drifts too
    // far away from this, we start changing the resampling ratio to
    // compensate.
    expected_delay: f64,

    // Delay inside the resampler's polyphase filter, in input samples.
    internal_delay: f64,

    last_delay_estimate: f64,
}

impl ResamplingQueue {
    /// Create a queue adapting `freq_in` to `freq_out` for a device with
    /// `num_channels` interesting channels, aiming for a steady-state delay
    /// of `expected_delay_seconds`.
    pub fn new(
        spec: DeviceSpec,
        freq_in: u32,
        freq_out: u32,
        num_channels: usize,
        expected_delay_seconds: f64,
    ) -> Self {
        assert!(num_channels > 0);
        let ratio = f64::from(freq_out) / f64::from(freq_in);
        let parameters = SincInterpolationParameters {
            sinc_len: 64,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };
        let chunk_out = 64;
        // rcorr is clamped to ±5%, so a 10% relative range can never be
        // exceeded.
        let mut resampler = SincFixedOut::<f32>::new(ratio, 1.1, parameters, chunk_out, num_channels)
            .expect("fixed resampler parameters are always valid");

        let mut in_scratch = vec![Vec::new(); num_channels];
        let mut out_scratch = vec![vec![0.0f32; chunk_out]; num_channels];

        // Prime the resampler with zeros and discard its transient, so the
        // filter itself introduces no extra startup delay or garbage.
        let transient = resampler.output_delay();
        let mut discarded = 0;
        while discarded < transient {
            let needed = resampler.input_frames_next();
            for channel in &mut in_scratch {
                channel.clear();
                channel.resize(needed, 0.0);
            }
            match resampler.process_into_buffer(&in_scratch, &mut out_scratch, None) {
                Ok((_, produced)) => discarded += produced,
                Err(err) => {
                    log::error!("[{spec}] resampler priming failed: {err}");
                    break;
                }
            }
        }
        let internal_delay = transient as f64 / ratio;

        Self {
            spec,
            freq_in,
            freq_out,
            num_channels,
            resampler,
            in_scratch,
            out_scratch,
            buffer: VecDeque::new(),
            ready: VecDeque::new(),
            first_output: true,
            a0: InputPoint::default(),
            a1: InputPoint::default(),
            current_estimated_freq_in: f64::from(freq_in),
            total_consumed_samples: 0,
            z1: 0.0,
            z2: 0.0,
            z3: 0.0,
            ratio,
            rcorr: 1.0,
            expected_delay: expected_delay_seconds * f64::from(freq_out),
            internal_delay,
            last_delay_estimate: 0.0,
        }
    }

    /// Append `num_samples` frames of interleaved input received at `ts`.
    pub fn add_input_samples(
        &mut self,
        ts: Instant,
        samples: &[f32],
        num_samples: usize,
        policy: RateAdjustmentPolicy,
    ) {
        if num_samples == 0 {
            return;
        }
        debug_assert_eq!(samples.len(), num_samples * self.num_channels);

        let good_sample = policy == RateAdjustmentPolicy::AdjustRate;
        if good_sample && self.a1.good_sample {
            self.a0 = self.a1;
        }
        self.a1.ts = Some(ts);
        self.a1.input_samples_received += num_samples as u64;
        self.a1.good_sample = good_sample;
        if self.a0.good_sample && self.a1.good_sample {
            let (t0, t1) = (self.a0.ts, self.a1.ts);
            if let (Some(t0), Some(t1)) = (t0, t1) {
                let elapsed = seconds_between(t0, t1);
                if elapsed > 0.0 {
                    let estimated = (self.a1.input_samples_received
                        - self.a0.input_samples_received)
                        as f64
                        / elapsed;
                    // Bound the frequency, so a single wild result will not
                    // throw the filter off guard.
                    self.current_estimated_freq_in = estimated
                        .clamp(0.8 * f64::from(self.freq_in), 1.2 * f64::from(self.freq_in));
                }
            }
        }

        self.buffer.extend(samples.iter().copied());
    }

    /// Produce exactly `num_samples` frames of interleaved output into
    /// `output` for output time `ts`. Returns false on underrun, in which
    /// case the remainder is zero-filled and the loop filter is reset.
    pub fn get_output_samples(
        &mut self,
        ts: Instant,
        output: &mut [f32],
        num_samples: usize,
        policy: RateAdjustmentPolicy,
    ) -> bool {
        debug_assert!(num_samples > 0);
        debug_assert_eq!(output.len(), num_samples * self.num_channels);

        if self.a1.input_samples_received == 0 {
            // No data yet, just return zeros.
            output.fill(0.0);
            return true;
        }

        if policy == RateAdjustmentPolicy::AdjustRate
            && (self.a0.good_sample || self.a1.good_sample)
        {
            self.adjust_rate(ts, num_samples);
        }

        self.produce(output, num_samples)
    }

    // Estimate the current queueing delay and run the loop filter, updating
    // the resampling ratio.
    fn adjust_rate(&mut self, ts: Instant, num_samples: usize) {
        // Estimate the number of input samples produced at this instant, by
        // extrapolating from the last known good point. Note that we could be
        // extrapolating backward or forward, depending on the timing of the
        // calls.
        let base_point = if self.a1.good_sample { self.a1 } else { self.a0 };
        let base_ts = match base_point.ts {
            Some(ts) => ts,
            None => return,
        };
        let input_samples_received = base_point.input_samples_received as f64
            + self.current_estimated_freq_in * seconds_between(base_ts, ts);

        // Estimate the number of input samples consumed once this request has
        // run through the resampler. Chunked output that was produced but not
        // yet handed out counts as not-yet-consumed.
        let ready_frames = (self.ready.len() / self.num_channels) as f64;
        let input_samples_consumed = self.total_consumed_samples as f64
            + num_samples as f64 / (self.ratio * self.rcorr)
            - ready_frames / self.ratio;

        let mut actual_delay = input_samples_received - input_samples_consumed;
        actual_delay += self.internal_delay;
        self.last_delay_estimate = actual_delay;
        let mut err = actual_delay - self.expected_delay;

        if self.first_output {
            // Before the very first block, insert artificial delay based on
            // our initial estimate, so that we don't need a long period to
            // stabilize at the beginning.
            if err < 0.0 {
                let delay_samples_to_add = (-err).round() as usize;
                for _ in 0..delay_samples_to_add * self.num_channels {
                    self.buffer.push_front(0.0);
                }
                // Equivalent to increasing input_samples_received on a0/a1.
                self.total_consumed_samples -= delay_samples_to_add as i64;
                err += delay_samples_to_add as f64;
            } else if err > 0.0 {
                let buffered_frames = self.buffer.len() / self.num_channels;
                let delay_samples_to_remove = (err.round() as usize).min(buffered_frames);
                self.buffer.drain(..delay_samples_to_remove * self.num_channels);
                self.total_consumed_samples += delay_samples_to_remove as i64;
                err -= delay_samples_to_remove as f64;
            }
        }
        self.first_output = false;

        // The loop bandwidth is at 0.02 Hz; our jitter is pretty large since
        // none of the threads involved run at real-time priority. The first
        // four seconds we use a larger bandwidth, because there is a lot
        // going on during startup and the initial estimate may be tainted by
        // jitter, so we want to converge faster.
        let loop_bandwidth_hz = if self.total_consumed_samples < 4 * i64::from(self.freq_in) {
            0.2
        } else {
            0.02
        };

        // Set up the loop filter. These depend on the number of samples asked
        // for, so they are recomputed every time.
        let w =
            2.0 * std::f64::consts::PI * loop_bandwidth_hz * num_samples as f64
                / f64::from(self.freq_out);
        let w0 = 1.0 - (-20.0 * w).exp();
        let w1 = w * 1.5 / num_samples as f64 / self.ratio;
        let w2 = w / 1.5;

        // Filter <err> through the loop filter to find the correction ratio.
        self.z1 += w0 * (w1 * err - self.z1);
        self.z2 += w0 * (self.z1 - self.z2);
        self.z3 += w2 * self.z2;
        self.rcorr = (1.0 - self.z2 - self.z3).clamp(0.95, 1.05);
        debug_assert!(!self.rcorr.is_nan());
        if let Err(err) = self.resampler.set_resample_ratio_relative(self.rcorr, true) {
            log::error!("[{}] failed to set resampling ratio: {err}", self.spec);
        }
    }

    // Actually resample, producing exactly `num_samples` output frames.
    fn produce(&mut self, output: &mut [f32], num_samples: usize) -> bool {
        let needed = num_samples * self.num_channels;
        while self.ready.len() < needed {
            let needed_in = self.resampler.input_frames_next();
            if self.buffer.len() < needed_in * self.num_channels {
                // This should never happen unless the delay is set way too
                // low, or we are dropping a lot of data.
                log::warn!(
                    "[{}] out of input samples to resample, still need {} output samples \
                     (correction factor is {})",
                    self.spec,
                    (needed - self.ready.len()) / self.num_channels,
                    self.rcorr
                );
                let mut pos = 0;
                while let Some(sample) = self.ready.pop_front() {
                    output[pos] = sample;
                    pos += 1;
                }
                output[pos..].fill(0.0);

                // Reset the loop filter.
                self.z1 = 0.0;
                self.z2 = 0.0;
                self.z3 = 0.0;

                return false;
            }

            for channel in &mut self.in_scratch {
                channel.clear();
                channel.resize(needed_in, 0.0);
            }
            for frame in 0..needed_in {
                for channel in 0..self.num_channels {
                    // Samples up to needed_in * num_channels are present,
                    // checked above.
                    self.in_scratch[channel][frame] = self.buffer[frame * self.num_channels + channel];
                }
            }

            match self
                .resampler
                .process_into_buffer(&self.in_scratch, &mut self.out_scratch, None)
            {
                Ok((consumed, produced)) => {
                    self.buffer.drain(..consumed * self.num_channels);
                    self.total_consumed_samples += consumed as i64;
                    for frame in 0..produced {
                        for channel in 0..self.num_channels {
                            self.ready.push_back(self.out_scratch[channel][frame]);
                        }
                    }
                }
                Err(err) => {
                    log::error!("[{}] resampler failed: {err}", self.spec);
                    output.fill(0.0);
                    return false;
                }
            }
        }

        for sample in output.iter_mut().take(needed) {
            *sample = self.ready.pop_front().unwrap_or(0.0);
        }
        true
    }

    /// The most recent estimate of the queueing delay, in input samples.
    pub fn current_delay(&self) -> f64 {
        self.last_delay_estimate
    }

    /// The current fractional rate correction, in [0.95, 1.05].
    pub fn rate_correction(&self) -> f64 {
        self.rcorr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn queue(freq_in: u32, channels: usize) -> ResamplingQueue {
        ResamplingQueue::new(DeviceSpec::CaptureCard(0), freq_in, 48000, channels, 0.1)
    }

    fn noise(n: usize, channels: usize, state: &mut u32) -> Vec<f32> {
        (0..n * channels)
            .map(|_| {
                // xorshift; keep the test free of external RNG crates.
                *state ^= *state << 13;
                *state ^= *state >> 17;
                *state ^= *state << 5;
                (*state as f32 / u32::MAX as f32) - 0.5
            })
            .collect()
    }

    #[test]
    fn silence_before_first_input() {
        let mut q = queue(48000, 2);
        let mut out = vec![1.0f32; 2 * 1024];
        assert!(q.get_output_samples(
            Instant::now(),
            &mut out,
            1024,
            RateAdjustmentPolicy::AdjustRate
        ));
        assert!(out.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn underrun_is_reported_and_recovers() {
        let mut q = queue(48000, 2);
        let t0 = Instant::now();
        let mut state = 0x1234_5678;
        q.add_input_samples(t0, &noise(100, 2, &mut state), 100, RateAdjustmentPolicy::AdjustRate);

        let mut out = vec![0.0f32; 2 * 4800];
        let ok = q.get_output_samples(
            t0 + Duration::from_millis(2),
            &mut out,
            4800,
            RateAdjustmentPolicy::DoNotAdjustRate,
        );
        assert!(!ok);
        assert!(out.iter().all(|x| x.is_finite()));

        // With plenty of input, the next call must succeed again.
        q.add_input_samples(
            t0 + Duration::from_millis(100),
            &noise(9600, 2, &mut state),
            9600,
            RateAdjustmentPolicy::AdjustRate,
        );
        let ok = q.get_output_samples(
            t0 + Duration::from_millis(110),
            &mut out,
            4800,
            RateAdjustmentPolicy::DoNotAdjustRate,
        );
        assert!(ok);
        assert!(out.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn rate_correction_stays_bounded() {
        let mut q = queue(48000, 1);
        let t0 = Instant::now();
        let mut state = 0xdead_beef;
        // Pathological timing: bursts with wildly wrong spacing.
        for i in 0..200 {
            let ts = t0 + Duration::from_micros(i * i * 13);
            q.add_input_samples(ts, &noise(480, 1, &mut state), 480, RateAdjustmentPolicy::AdjustRate);
            let mut out = vec![0.0f32; 480];
            q.get_output_samples(
                ts + Duration::from_millis(1),
                &mut out,
                480,
                RateAdjustmentPolicy::AdjustRate,
            );
            let rcorr = q.rate_correction();
            assert!((0.95..=1.05).contains(&rcorr), "rcorr {rcorr} out of bounds");
        }
    }

    #[test]
    fn steady_source_converges_to_target_delay() {
        // A source at exactly 48 kHz, 480 frames every 10 ms; pull 480 frames
        // every 10 ms. After a 2 s warm-up the delay estimate must stay
        // within 5% of the 100 ms target, and no underruns may occur.
        let mut q = queue(48000, 1);
        let t0 = Instant::now();
        let mut state = 7;
        for i in 0..6000u64 {
            let ts = t0 + Duration::from_millis(i * 10);
            q.add_input_samples(ts, &noise(480, 1, &mut state), 480, RateAdjustmentPolicy::AdjustRate);
            let mut out = vec![0.0f32; 480];
            let ok = q.get_output_samples(
                ts + Duration::from_millis(5),
                &mut out,
                480,
                RateAdjustmentPolicy::AdjustRate,
            );
            assert!(ok, "underrun at iteration {i}");
            if i > 200 {
                let delay = q.current_delay();
                let target = 0.1 * 48000.0;
                assert!(
                    (delay - target).abs() < target * 0.05,
                    "delay {delay} strayed from target {target} at iteration {i}"
                );
            }
        }
    }

    #[test]
    fn adapts_44100_to_48000() {
        // 441 frames every 10 ms at 44.1 kHz in, 480 frames every 10 ms out.
        // No underruns after the first second.
        let mut q = queue(44100, 1);
        let t0 = Instant::now();
        let mut state = 99;
        let mut underruns_after_warmup = 0;
        for i in 0..6000u64 {
            let ts = t0 + Duration::from_millis(i * 10);
            q.add_input_samples(ts, &noise(441, 1, &mut state), 441, RateAdjustmentPolicy::AdjustRate);
            let mut out = vec![0.0f32; 480];
            let ok = q.get_output_samples(
                ts + Duration::from_millis(5),
                &mut out,
                480,
                RateAdjustmentPolicy::AdjustRate,
            );
            if !ok && i > 100 {
                underruns_after_warmup += 1;
            }
        }
        assert_eq!(underruns_after_warmup, 0);
    }
}
