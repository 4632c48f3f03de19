//! The audio mixer: extracts the right channels from each capture device,
//! resamples them so they stay in sync, runs the per-bus processing chain,
//! sums everything into the stereo program output, and meters the result.
//!
//! All operations are thread-safe. The producer side (`add_audio`,
//! `add_silence`, `silence_card`) uses a timed try-lock and reports
//! contention back to the caller instead of blocking, so a capture thread can
//! never deadlock against a thread that is reconfiguring the mixer; the
//! consumer side (`get_output`) blocks.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use atomic_float::AtomicF32;
use parking_lot::{Mutex, RwLock};

use crate::alsa::{AlsaPool, CaptureSink, CardState};
use crate::compressor::StereoCompressor;
use crate::correlation::CorrelationMeasurer;
use crate::db::{from_db, to_db};
use crate::device::{AudioFormat, DeviceInfo, DeviceSpec};
use crate::filter::{FilterType, StereoFilter};
use crate::loudness::{find_peak, LoudnessMeter, TruePeakMeter};
use crate::mapping::{self, Bus, InputMapping, MappingError, MappingMode};
use crate::metrics::{BusMetrics, MixerMetrics};
use crate::resampler::{RateAdjustmentPolicy, ResamplingQueue};
use crate::settings::{
    MixerSettings, MAX_ALSA_CARDS, MAX_BUSES, MAX_CAPTURE_CARDS, OUTPUT_FREQUENCY,
};

/// Producer-side lock timeout; a capture thread that cannot get the mixer
/// within this long is told to retry.
const ADD_AUDIO_TIMEOUT: Duration = Duration::from_millis(10);

// Gain staging shoots for this level; from practical tests with speech it
// puts the program at roughly 0 LU.
const REF_LEVEL_DBFS: f32 = -14.0;
// 0 LU, more or less by definition.
const REF_LEVEL_LUFS: f32 = -23.0;

/// The three EQ bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EqBand {
    /// Low shelf at 200 Hz.
    Bass = 0,
    /// Flat mid gain.
    Mid = 1,
    /// High shelf at 4.7 kHz.
    Treble = 2,
}

/// Number of EQ bands.
pub const NUM_EQ_BANDS: usize = 3;

/// Levels of one bus, as reported through the level callback. Values are in
/// dBFS; `compressor_attenuation_db` is NaN while the bus compressor is
/// disabled.
#[derive(Debug, Clone)]
pub struct BusLevel {
    /// Digital peak of the last block, left and right.
    pub current_level_dbfs: [f32; 2],
    /// Digital peak with hold and falloff, left and right.
    pub peak_level_dbfs: [f32; 2],
    /// Highest peak since the last [`AudioMixer::reset_peak`].
    pub historic_peak_dbfs: f32,
    /// Current gain staging, in dB.
    pub gain_staging_db: f32,
    /// Current compressor attenuation as a positive dB number; NaN when the
    /// compressor is disabled.
    pub compressor_attenuation_db: f32,
}

/// A combination of all settings for one bus. Useful to get or store them as
/// a whole instead of calling each getter and setter.
#[derive(Debug, Clone, PartialEq)]
pub struct BusSettings {
    /// Fader position, in dB.
    pub fader_volume_db: f32,
    /// Whether the bus is muted.
    pub muted: bool,
    /// Whether the high-pass filter is engaged.
    pub locut_enabled: bool,
    /// Bass/mid/treble gains, in dB.
    pub eq_level_db: [f32; NUM_EQ_BANDS],
    /// Manual gain staging, in dB (ignored while automatic).
    pub gain_staging_db: f32,
    /// Whether gain staging is automatic.
    pub level_compressor_enabled: bool,
    /// Compressor threshold, in dBFS.
    pub compressor_threshold_dbfs: f32,
    /// Whether the compressor is engaged.
    pub compressor_enabled: bool,
}

/// Everything the level callback receives once per output block.
#[derive(Debug, Clone)]
pub struct AudioLevels {
    /// Short-term (3 s) loudness, LUFS.
    pub loudness_s_lufs: f32,
    /// Oversampled program peak, dBFS.
    pub peak_dbfs: f32,
    /// Per-bus levels, in mapping order.
    pub bus_levels: Vec<BusLevel>,
    /// Integrated loudness, LUFS.
    pub loudness_i_lufs: f32,
    /// Low end of the loudness range, LUFS.
    pub range_low_lufs: f32,
    /// High end of the loudness range, LUFS.
    pub range_high_lufs: f32,
    /// Current final makeup gain, dB.
    pub final_makeup_gain_db: f32,
    /// L/R correlation, in [-1, 1].
    pub correlation: f32,
}

/// Receives [`AudioLevels`] after every output block.
pub type AudioLevelCallback = Box<dyn Fn(&AudioLevels) + Send + Sync>;
/// Invoked on any observable state change (device state, mapping, bus
/// count), for UI refresh.
pub type StateChangedCallback = Box<dyn Fn() + Send + Sync>;

// Non-dB peak state for one bus channel. Hold/falloff constants are in
// `measure_bus_levels`.
#[derive(Debug, Clone, Copy, Default)]
struct PeakHistory {
    current_level: f32,  // Peak of the last block.
    historic_peak: f32,  // Highest peak since last reset; no falloff.
    current_peak: f32,   // Current peak meter value.
    last_peak: f32,
    age_seconds: f32,    // Time since last_peak was set.
}

// Mixer-side state of one device.
struct AudioDeviceState {
    resampling_queue: Option<ResamplingQueue>,
    display_name: String,
    capture_frequency: u32,
    // Channels referenced by at least one bus of the current mapping.
    interesting_channels: BTreeSet<usize>,
    silenced: bool,
}

impl AudioDeviceState {
    fn new() -> Self {
        Self {
            resampling_queue: None,
            display_name: String::new(),
            capture_frequency: OUTPUT_FREQUENCY,
            interesting_channels: BTreeSet::new(),
            silenced: false,
        }
    }
}

struct MixerState {
    capture_cards: Vec<AudioDeviceState>,
    alsa_inputs: Vec<AudioDeviceState>,
    input_mapping: InputMapping,
    mapping_mode: MappingMode,
    locut: Vec<StereoFilter>,
    eq: Vec<[StereoFilter; 2]>, // Bass and treble shelves; mid is a plain gain.
    last_fader_volume_db: Vec<f32>,
    last_eq_level_db: Vec<[f32; NUM_EQ_BANDS]>,
    peak_history: Vec<[PeakHistory; 2]>,
    bus_metrics: Vec<Arc<BusMetrics>>,
}

struct CompressorState {
    level_compressor: Vec<StereoCompressor>,
    gain_staging_db: Vec<f32>,
    last_gain_staging_db: Vec<f32>,
    level_compressor_enabled: Vec<bool>,
    compressor: Vec<StereoCompressor>,
    limiter: StereoCompressor,
    // Not in dB; f64 so it can be moved very slowly without losing
    // precision.
    final_makeup_gain: f64,
    final_makeup_gain_auto: bool,
}

struct MeasureState {
    r128: LoudnessMeter,
    correlation: CorrelationMeasurer,
    peak_meter: TruePeakMeter,
}

fn convert_fixed16_to_f32(
    dst: &mut [f32],
    out_channel: usize,
    out_channels: usize,
    src: &[u8],
    in_channel: usize,
    in_channels: usize,
    num_samples: usize,
) {
    for i in 0..num_samples {
        let offset = (i * in_channels + in_channel) * 2;
        let sample = i16::from_le_bytes([src[offset], src[offset + 1]]);
        dst[i * out_channels + out_channel] = f32::from(sample) * (1.0 / 32768.0);
    }
}

fn convert_fixed24_to_f32(
    dst: &mut [f32],
    out_channel: usize,
    out_channels: usize,
    src: &[u8],
    in_channel: usize,
    in_channels: usize,
    num_samples: usize,
) {
    for i in 0..num_samples {
        let offset = (i * in_channels + in_channel) * 3;
        let s1 = u32::from(src[offset]);
        let s2 = u32::from(src[offset + 1]);
        let s3 = u32::from(src[offset + 2]);
        // The low byte is replicated into the bottom bits so full scale maps
        // to full scale.
        let value = (s1 | (s1 << 8) | (s2 << 16) | (s3 << 24)) as i32;
        dst[i * out_channels + out_channel] = value as f32 * (1.0 / 2147483648.0);
    }
}

fn convert_fixed32_to_f32(
    dst: &mut [f32],
    out_channel: usize,
    out_channels: usize,
    src: &[u8],
    in_channel: usize,
    in_channels: usize,
    num_samples: usize,
) {
    for i in 0..num_samples {
        let offset = (i * in_channels + in_channel) * 4;
        let sample = i32::from_le_bytes([
            src[offset],
            src[offset + 1],
            src[offset + 2],
            src[offset + 3],
        ]);
        dst[i * out_channels + out_channel] = sample as f32 * (1.0 / 2147483648.0);
    }
}

fn deinterleave(input: &[f32], left: &mut Vec<f32>, right: &mut Vec<f32>) {
    let num_frames = input.len() / 2;
    left.clear();
    right.clear();
    left.reserve(num_frames);
    right.reserve(num_frames);
    for frame in input.chunks_exact(2) {
        left.push(frame[0]);
        right.push(frame[1]);
    }
}

fn apply_gain(db: f32, last_db: f32, samples: &mut [f32]) {
    if (db - last_db).abs() < 1e-3 {
        // Constant over this block.
        let gain = from_db(db);
        for sample in samples.iter_mut() {
            *sample *= gain;
        }
    } else {
        // Fade over the course of the block.
        let num_frames = samples.len() / 2;
        let mut gain = from_db(last_db);
        let gain_inc = from_db(db - last_db).powf(1.0 / num_frames as f32);
        for frame in samples.chunks_exact_mut(2) {
            frame[0] *= gain;
            frame[1] *= gain;
            gain *= gain_inc;
        }
    }
}

fn apply_filter_fade(
    filter: &mut StereoFilter,
    data: &mut [f32],
    num_frames: usize,
    cutoff_hz: f32,
    db: f32,
    last_db: f32,
) {
    // Recalculating shelf coefficients is expensive; 32-frame blocks are an
    // okay tradeoff between speed and zipper noise.
    const FILTER_GRANULARITY_FRAMES: usize = 32;

    let cutoff = cutoff_hz * 2.0 * std::f32::consts::PI / OUTPUT_FREQUENCY as f32;
    if (db - last_db).abs() < 1e-3 {
        // Constant over this block.
        if db.abs() > 0.01 {
            filter.render(data, num_frames, cutoff, 0.5, db / 40.0);
        }
    } else {
        // Fade. (Rounding up avoids division by zero.)
        let num_blocks = num_frames.div_ceil(FILTER_GRANULARITY_FRAMES);
        let inc_db_norm = (db - last_db) / 40.0 / num_blocks as f32;
        let mut db_norm = db / 40.0;
        let mut start = 0;
        while start < num_frames {
            let block = (num_frames - start).min(FILTER_GRANULARITY_FRAMES);
            filter.render(&mut data[start * 2..], block, cutoff, 0.5, db_norm);
            db_norm += inc_db_norm;
            start += block;
        }
    }
}

fn device_state_mut<'a>(
    capture_cards: &'a mut [AudioDeviceState],
    alsa_inputs: &'a mut [AudioDeviceState],
    spec: DeviceSpec,
) -> Option<&'a mut AudioDeviceState> {
    match spec {
        DeviceSpec::Silence => None,
        DeviceSpec::CaptureCard(index) => capture_cards.get_mut(index),
        DeviceSpec::AlsaInput(index) => alsa_inputs.get_mut(index),
    }
}

fn device_state<'a>(
    capture_cards: &'a [AudioDeviceState],
    alsa_inputs: &'a [AudioDeviceState],
    spec: DeviceSpec,
) -> Option<&'a AudioDeviceState> {
    match spec {
        DeviceSpec::Silence => None,
        DeviceSpec::CaptureCard(index) => capture_cards.get(index),
        DeviceSpec::AlsaInput(index) => alsa_inputs.get(index),
    }
}

// A lane of constant zeros, read with stride 0, stands in for silence
// sources so the per-sample copy loop has no branches.
static ZERO_LANE: [f32; 1] = [0.0];

fn find_sample_src<'a>(
    samples_card: &'a BTreeMap<DeviceSpec, Vec<f32>>,
    capture_cards: &[AudioDeviceState],
    alsa_inputs: &[AudioDeviceState],
    spec: DeviceSpec,
    source_channel: i32,
) -> (&'a [f32], usize) {
    if source_channel == -1 || spec == DeviceSpec::Silence {
        return (&ZERO_LANE, 0);
    }
    let Some(device) = device_state(capture_cards, alsa_inputs, spec) else {
        return (&ZERO_LANE, 0);
    };
    let Some(channel_index) = device
        .interesting_channels
        .iter()
        .position(|&channel| channel == source_channel as usize)
    else {
        return (&ZERO_LANE, 0);
    };
    let Some(samples) = samples_card.get(&spec) else {
        return (&ZERO_LANE, 0);
    };
    (&samples[channel_index..], device.interesting_channels.len())
}

fn fill_audio_bus(
    samples_card: &BTreeMap<DeviceSpec, Vec<f32>>,
    capture_cards: &[AudioDeviceState],
    alsa_inputs: &[AudioDeviceState],
    bus: &Bus,
    num_samples: usize,
    output: &mut [f32],
) {
    if bus.device == DeviceSpec::Silence {
        output[..num_samples * 2].fill(0.0);
        return;
    }
    let (left_src, left_stride) = find_sample_src(
        samples_card,
        capture_cards,
        alsa_inputs,
        bus.device,
        bus.source_channel[0],
    );
    let (right_src, right_stride) = find_sample_src(
        samples_card,
        capture_cards,
        alsa_inputs,
        bus.device,
        bus.source_channel[1],
    );
    for i in 0..num_samples {
        output[i * 2] = left_src[i * left_stride];
        output[i * 2 + 1] = right_src[i * right_stride];
    }
}

/// The live audio mixer. See the crate documentation for the overall model.
pub struct AudioMixer {
    settings: MixerSettings,
    state: Mutex<MixerState>,
    compressor_state: Mutex<CompressorState>,
    measure: Mutex<MeasureState>,
    alsa_pool: AlsaPool,

    // Per-bus user settings that the UI may flip at any time, lock-free.
    locut_cutoff_hz: AtomicF32,
    locut_enabled: Vec<AtomicBool>,
    eq_level_db: Vec<[AtomicF32; NUM_EQ_BANDS]>,
    fader_volume_db: Vec<AtomicF32>,
    mute: Vec<AtomicBool>,
    limiter_threshold_dbfs: AtomicF32,
    limiter_enabled: AtomicBool,
    compressor_threshold_dbfs: Vec<AtomicF32>,
    compressor_enabled: Vec<AtomicBool>,

    metrics: MixerMetrics,
    audio_level_callback: RwLock<Option<AudioLevelCallback>>,
    state_changed_callback: RwLock<Option<StateChangedCallback>>,
}

impl AudioMixer {
    /// Create a mixer for `num_capture_cards` externally-driven capture
    /// cards, start the ALSA pool, and install a SIMPLE mapping of capture
    /// card 0.
    pub fn new(num_capture_cards: usize, settings: MixerSettings) -> Arc<Self> {
        let num_capture_cards = num_capture_cards.min(MAX_CAPTURE_CARDS);
        let mixer = Arc::new_cyclic(|weak: &Weak<AudioMixer>| {
            let alsa_pool = AlsaPool::new();
            alsa_pool.connect(weak.clone() as Weak<dyn CaptureSink>);

            let default = BusSettings::default_settings(&settings);
            let state = MixerState {
                capture_cards: (0..num_capture_cards).map(|_| AudioDeviceState::new()).collect(),
                alsa_inputs: (0..MAX_ALSA_CARDS).map(|_| AudioDeviceState::new()).collect(),
                input_mapping: InputMapping::default(),
                mapping_mode: MappingMode::Simple,
                locut: (0..MAX_BUSES).map(|_| StereoFilter::new(FilterType::Hpf, 2)).collect(),
                eq: (0..MAX_BUSES)
                    .map(|_| {
                        [
                            StereoFilter::new(FilterType::LowShelf, 1),
                            StereoFilter::new(FilterType::HighShelf, 1),
                        ]
                    })
                    .collect(),
                last_fader_volume_db: vec![default.fader_volume_db; MAX_BUSES],
                last_eq_level_db: vec![default.eq_level_db; MAX_BUSES],
                peak_history: vec![[PeakHistory::default(); 2]; MAX_BUSES],
                bus_metrics: Vec::new(),
            };
            let compressor_state = CompressorState {
                level_compressor: (0..MAX_BUSES)
                    .map(|_| StereoCompressor::new(OUTPUT_FREQUENCY as f32))
                    .collect(),
                gain_staging_db: vec![default.gain_staging_db; MAX_BUSES],
                last_gain_staging_db: vec![default.gain_staging_db; MAX_BUSES],
                level_compressor_enabled: vec![default.level_compressor_enabled; MAX_BUSES],
                compressor: (0..MAX_BUSES)
                    .map(|_| StereoCompressor::new(OUTPUT_FREQUENCY as f32))
                    .collect(),
                limiter: StereoCompressor::new(OUTPUT_FREQUENCY as f32),
                final_makeup_gain: 1.0,
                final_makeup_gain_auto: settings.final_makeup_gain_auto,
            };
            let measure = MeasureState {
                r128: LoudnessMeter::new(OUTPUT_FREQUENCY),
                correlation: CorrelationMeasurer::new(OUTPUT_FREQUENCY),
                peak_meter: TruePeakMeter::new(OUTPUT_FREQUENCY),
            };

            Self {
                state: Mutex::new(state),
                compressor_state: Mutex::new(compressor_state),
                measure: Mutex::new(measure),
                alsa_pool,
                locut_cutoff_hz: AtomicF32::new(120.0),
                locut_enabled: (0..MAX_BUSES)
                    .map(|_| AtomicBool::new(default.locut_enabled))
                    .collect(),
                eq_level_db: (0..MAX_BUSES)
                    .map(|_| [AtomicF32::new(0.0), AtomicF32::new(0.0), AtomicF32::new(0.0)])
                    .collect(),
                fader_volume_db: (0..MAX_BUSES)
                    .map(|_| AtomicF32::new(default.fader_volume_db))
                    .collect(),
                mute: (0..MAX_BUSES).map(|_| AtomicBool::new(false)).collect(),
                limiter_threshold_dbfs: AtomicF32::new(REF_LEVEL_DBFS + 4.0),
                limiter_enabled: AtomicBool::new(settings.limiter_enabled),
                compressor_threshold_dbfs: (0..MAX_BUSES)
                    .map(|_| AtomicF32::new(default.compressor_threshold_dbfs))
                    .collect(),
                compressor_enabled: (0..MAX_BUSES)
                    .map(|_| AtomicBool::new(default.compressor_enabled))
                    .collect(),
                metrics: MixerMetrics::new(),
                audio_level_callback: RwLock::new(None),
                state_changed_callback: RwLock::new(None),
                settings,
            }
        });
        mixer.alsa_pool.init();
        mixer.set_simple_input(0);
        mixer
    }

    /// The gauges this mixer maintains.
    pub fn metrics(&self) -> &MixerMetrics {
        &self.metrics
    }

    /// Unconditionally rebuild a device's resampling queue.
    pub fn reset_resampler(&self, spec: DeviceSpec) {
        let mut state = self.state.lock();
        self.reset_resampler_locked(&mut state, spec);
    }

    fn reset_resampler_locked(&self, state: &mut MixerState, spec: DeviceSpec) {
        let queue_len_seconds = self.settings.audio_queue_length_ms * 1e-3;
        let Some(device) = device_state_mut(&mut state.capture_cards, &mut state.alsa_inputs, spec)
        else {
            return;
        };
        device.resampling_queue = if device.interesting_channels.is_empty() {
            None
        } else {
            Some(ResamplingQueue::new(
                spec,
                device.capture_frequency,
                OUTPUT_FREQUENCY,
                device.interesting_channels.len(),
                queue_len_seconds,
            ))
        };
    }

    /// Add audio to the given device's queue. Returns false if the lock was
    /// contended; simply try again. (This avoids a deadlock where a capture
    /// thread hangs on the mixer mutex while another thread holding it is
    /// trying to shut that capture thread down.) `frame_length` is in
    /// [`TIMEBASE`](crate::settings::TIMEBASE) units.
    pub fn add_audio(
        &self,
        spec: DeviceSpec,
        data: &[u8],
        num_samples: usize,
        audio_format: AudioFormat,
        frame_length: i64,
        frame_time: Instant,
    ) -> bool {
        let _ = frame_length;
        let Some(mut state) = self.state.try_lock_for(ADD_AUDIO_TIMEOUT) else {
            return false;
        };
        let state = &mut *state;
        let Some(device) =
            device_state_mut(&mut state.capture_cards, &mut state.alsa_inputs, spec)
        else {
            return true;
        };
        if device.resampling_queue.is_none() {
            // No bus uses this device; throw the data away.
            return true;
        }

        let num_channels = device.interesting_channels.len();
        let mut audio = vec![0.0f32; num_samples * num_channels];
        for (channel_index, &channel) in device.interesting_channels.iter().enumerate() {
            match audio_format.bits_per_sample {
                0 => debug_assert_eq!(num_samples, 0),
                16 => convert_fixed16_to_f32(
                    &mut audio,
                    channel_index,
                    num_channels,
                    data,
                    channel,
                    audio_format.num_channels,
                    num_samples,
                ),
                24 => convert_fixed24_to_f32(
                    &mut audio,
                    channel_index,
                    num_channels,
                    data,
                    channel,
                    audio_format.num_channels,
                    num_samples,
                ),
                32 => convert_fixed32_to_f32(
                    &mut audio,
                    channel_index,
                    num_channels,
                    data,
                    channel,
                    audio_format.num_channels,
                    num_samples,
                ),
                other => panic!("cannot handle audio with {other} bits per sample"),
            }
        }

        // A changed capture frequency invalidates the resampler.
        if audio_format.sample_rate != device.capture_frequency {
            device.capture_frequency = audio_format.sample_rate;
            self.reset_resampler_locked(state, spec);
        }

        let Some(device) =
            device_state_mut(&mut state.capture_cards, &mut state.alsa_inputs, spec)
        else {
            return true;
        };
        if let Some(queue) = device.resampling_queue.as_mut() {
            queue.add_input_samples(
                frame_time,
                &audio,
                num_samples,
                RateAdjustmentPolicy::AdjustRate,
            );
        }
        true
    }

    /// Like [`AudioMixer::add_audio`], but pushes zeros whose timestamps say
    /// nothing about the device clock (used when a capture card reports "no
    /// signal"). Same retry semantics.
    pub fn add_silence(
        &self,
        spec: DeviceSpec,
        samples_per_frame: usize,
        num_frames: usize,
        frame_length: i64,
    ) -> bool {
        let _ = frame_length;
        let Some(mut state) = self.state.try_lock_for(ADD_AUDIO_TIMEOUT) else {
            return false;
        };
        let state = &mut *state;
        let Some(device) =
            device_state_mut(&mut state.capture_cards, &mut state.alsa_inputs, spec)
        else {
            return true;
        };
        let Some(queue) = device.resampling_queue.as_mut() else {
            return true;
        };

        let num_channels = device.interesting_channels.len();
        let silence = vec![0.0f32; samples_per_frame * num_channels];
        for _ in 0..num_frames {
            queue.add_input_samples(
                Instant::now(),
                &silence,
                samples_per_frame,
                RateAdjustmentPolicy::DoNotAdjustRate,
            );
        }
        true
    }

    /// Put a device in or out of silence mode: while silenced it produces
    /// zeros regardless of its queue. Leaving silence mode rebuilds the
    /// resampler so stale audio does not leak into the new material. Same
    /// retry semantics as [`AudioMixer::add_audio`].
    pub fn silence_card(&self, spec: DeviceSpec, silence: bool) -> bool {
        let Some(mut state) = self.state.try_lock_for(ADD_AUDIO_TIMEOUT) else {
            return false;
        };
        let state = &mut *state;
        let currently_silenced = {
            let Some(device) =
                device_state_mut(&mut state.capture_cards, &mut state.alsa_inputs, spec)
            else {
                return true;
            };
            let was = device.silenced;
            device.silenced = silence;
            was
        };
        if currently_silenced && !silence {
            self.reset_resampler_locked(state, spec);
        }
        true
    }

    /// Produce `num_samples` interleaved stereo frames of program output for
    /// output time `ts`. Blocking.
    pub fn get_output(
        &self,
        ts: Instant,
        num_samples: usize,
        policy: RateAdjustmentPolicy,
    ) -> Vec<f32> {
        let mut state_guard = self.state.lock();
        let state = &mut *state_guard;

        // Pull the interesting channels out of every active device.
        let mut active = Vec::new();
        for (index, device) in state.capture_cards.iter().enumerate() {
            if !device.interesting_channels.is_empty() {
                active.push(DeviceSpec::CaptureCard(index));
            }
        }
        for (index, device) in state.alsa_inputs.iter().enumerate() {
            if !device.interesting_channels.is_empty() {
                active.push(DeviceSpec::AlsaInput(index));
            }
        }
        let mut samples_card: BTreeMap<DeviceSpec, Vec<f32>> = BTreeMap::new();
        for &spec in &active {
            let Some(device) =
                device_state_mut(&mut state.capture_cards, &mut state.alsa_inputs, spec)
            else {
                continue;
            };
            let mut samples = vec![0.0f32; num_samples * device.interesting_channels.len()];
            if !device.silenced {
                if let Some(queue) = device.resampling_queue.as_mut() {
                    queue.get_output_samples(ts, &mut samples, num_samples, policy);
                }
            }
            samples_card.insert(spec, samples);
        }

        let MixerState {
            capture_cards,
            alsa_inputs,
            input_mapping,
            locut,
            eq,
            last_fader_volume_db,
            last_eq_level_db,
            peak_history,
            bus_metrics,
            ..
        } = state;

        let num_buses = input_mapping.buses.len();
        let mut samples_out = vec![0.0f32; num_samples * 2];
        let mut samples_bus = vec![0.0f32; num_samples * 2];
        let mut left = Vec::new();
        let mut right = Vec::new();

        for bus_index in 0..num_buses {
            let bus = &input_mapping.buses[bus_index];
            fill_audio_bus(
                &samples_card,
                &*capture_cards,
                &*alsa_inputs,
                bus,
                num_samples,
                &mut samples_bus,
            );
            self.apply_eq(
                bus_index,
                &mut samples_bus,
                num_samples,
                &mut locut[bus_index],
                &mut eq[bus_index],
                &mut last_eq_level_db[bus_index],
            );

            {
                let comp = &mut *self.compressor_state.lock();

                // Gain staging: either the automatic level compressor, which
                // squeezes anything over about -40 dBFS down and then makes
                // it up to the reference level, or the fixed gain the user
                // asked for.
                if comp.level_compressor_enabled[bus_index] {
                    let threshold = 0.01; // -40 dBFS.
                    let makeup_gain = from_db(REF_LEVEL_DBFS - (-40.0));
                    comp.level_compressor[bus_index].process(
                        &mut samples_bus,
                        threshold,
                        20.0,
                        0.5,
                        20.0,
                        makeup_gain,
                    );
                    comp.gain_staging_db[bus_index] =
                        to_db(comp.level_compressor[bus_index].attenuation() * makeup_gain);
                } else {
                    apply_gain(
                        comp.gain_staging_db[bus_index],
                        comp.last_gain_staging_db[bus_index],
                        &mut samples_bus,
                    );
                }
                comp.last_gain_staging_db[bus_index] = comp.gain_staging_db[bus_index];

                // The real compressor.
                if self.compressor_enabled[bus_index].load(Ordering::Relaxed) {
                    let threshold =
                        from_db(self.compressor_threshold_dbfs[bus_index].load(Ordering::Relaxed));
                    comp.compressor[bus_index].process(
                        &mut samples_bus,
                        threshold,
                        20.0,
                        0.005,
                        0.040,
                        2.0, // +6 dB makeup.
                    );
                }
            }

            self.add_bus_to_master(
                bus_index,
                &samples_bus,
                &mut samples_out,
                &mut last_fader_volume_db[bus_index],
            );
            deinterleave(&samples_bus, &mut left, &mut right);
            self.measure_bus_levels(bus_index, &left, &right, &mut peak_history[bus_index]);
        }

        {
            let comp = &mut *self.compressor_state.lock();
            // A limiter to take out only the worst peaks. The ratio is not
            // infinite, so we can go slightly above the threshold.
            if self.limiter_enabled.load(Ordering::Relaxed) {
                let threshold = from_db(self.limiter_threshold_dbfs.load(Ordering::Relaxed));
                comp.limiter
                    .process(&mut samples_out, threshold, 30.0, 0.0, 0.020, 1.0);
            }
        }

        // At this point we are most likely close to 0 LU if the faders sum
        // to 0 dB, but all measurements so far were raw sample values, not
        // R128 ones. A final makeup gain closes that gap. There is a
        // feedback loop here, so the filter is very slow (30 s half-time),
        // and the correction is frozen whenever the signal does not look
        // like a normal program (outside ±5 LU, probably silence).
        let loudness_lu = {
            let measure = self.measure.lock();
            f64::from(measure.r128.loudness_m()) - f64::from(REF_LEVEL_LUFS)
        };
        {
            let comp = &mut *self.compressor_state.lock();
            if loudness_lu.abs() >= 5.0 || !comp.final_makeup_gain_auto {
                let gain = comp.final_makeup_gain;
                for sample in samples_out.iter_mut() {
                    *sample = (f64::from(*sample) * gain) as f32;
                }
            } else {
                let target_loudness_factor =
                    comp.final_makeup_gain * 10f64.powf(-loudness_lu / 20.0);
                let fc_mul_2pi_delta_t = 1.0 / (30.0 * f64::from(OUTPUT_FREQUENCY));
                let alpha = fc_mul_2pi_delta_t / (fc_mul_2pi_delta_t + 1.0);
                let mut gain = comp.final_makeup_gain;
                for frame in samples_out.chunks_exact_mut(2) {
                    frame[0] = (f64::from(frame[0]) * gain) as f32;
                    frame[1] = (f64::from(frame[1]) * gain) as f32;
                    gain += (target_loudness_factor - gain) * alpha;
                }
                comp.final_makeup_gain = gain;
            }
        }

        // Update the meters and tell the listeners.
        deinterleave(&samples_out, &mut left, &mut right);
        {
            let measure = &mut *self.measure.lock();
            measure.peak_meter.process(&left, &right);
            measure.r128.process(&left, &right);
            measure.correlation.process_samples(&samples_out);
        }
        self.send_audio_level_callback(num_buses, &*peak_history, &*bus_metrics);

        samples_out
    }

    fn apply_eq(
        &self,
        bus_index: usize,
        samples_bus: &mut [f32],
        num_frames: usize,
        locut: &mut StereoFilter,
        eq: &mut [StereoFilter; 2],
        last_eq: &mut [f32; NUM_EQ_BANDS],
    ) {
        const BASS_FREQ_HZ: f32 = 200.0;
        const TREBLE_FREQ_HZ: f32 = 4700.0;

        // Cut away everything under the cutoff; we do not need it for voice,
        // and it would reduce headroom and confuse the compressor (hums at
        // 50 or 60 Hz in particular).
        if self.locut_enabled[bus_index].load(Ordering::Relaxed) {
            let cutoff = self.locut_cutoff_hz.load(Ordering::Relaxed) * 2.0
                * std::f32::consts::PI
                / OUTPUT_FREQUENCY as f32;
            locut.render(samples_bus, num_frames, cutoff, 0.5, 0.0);
        }

        // With only three bands, two shelf filters suffice: the mid band is
        // a plain gain, and the low and high bands are shelved relative to
        // it. If anything changed appreciably since the last block, fade
        // smoothly over this one.
        let bass_db = self.eq_level_db[bus_index][EqBand::Bass as usize].load(Ordering::Relaxed);
        let mid_db = self.eq_level_db[bus_index][EqBand::Mid as usize].load(Ordering::Relaxed);
        let treble_db =
            self.eq_level_db[bus_index][EqBand::Treble as usize].load(Ordering::Relaxed);
        let [last_bass_db, last_mid_db, last_treble_db] = *last_eq;

        apply_gain(mid_db, last_mid_db, samples_bus);
        apply_filter_fade(
            &mut eq[0],
            samples_bus,
            num_frames,
            BASS_FREQ_HZ,
            bass_db - mid_db,
            last_bass_db - last_mid_db,
        );
        apply_filter_fade(
            &mut eq[1],
            samples_bus,
            num_frames,
            TREBLE_FREQ_HZ,
            treble_db - mid_db,
            last_treble_db - last_mid_db,
        );

        *last_eq = [bass_db, mid_db, treble_db];
    }

    fn add_bus_to_master(
        &self,
        bus_index: usize,
        samples_bus: &[f32],
        samples_out: &mut [f32],
        last_fader_volume_db: &mut f32,
    ) {
        let num_frames = samples_bus.len() / 2;
        let new_volume_db = if self.mute[bus_index].load(Ordering::Relaxed) {
            -90.0
        } else {
            self.fader_volume_db[bus_index].load(Ordering::Relaxed)
        };
        if (new_volume_db - *last_fader_volume_db).abs() > 1e-3 {
            // The volume changed; fade over the course of this block. For
            // the fade the silence floor is -90 dB (the fader itself only
            // goes down to -84).
            let old_volume = from_db(last_fader_volume_db.max(-90.0));
            let new_volume = from_db(new_volume_db.max(-90.0));
            let volume_inc = (new_volume / old_volume).powf(1.0 / num_frames as f32);
            let mut volume = old_volume;
            if bus_index == 0 {
                for (out, bus) in samples_out
                    .chunks_exact_mut(2)
                    .zip(samples_bus.chunks_exact(2))
                {
                    out[0] = bus[0] * volume;
                    out[1] = bus[1] * volume;
                    volume *= volume_inc;
                }
            } else {
                for (out, bus) in samples_out
                    .chunks_exact_mut(2)
                    .zip(samples_bus.chunks_exact(2))
                {
                    out[0] += bus[0] * volume;
                    out[1] += bus[1] * volume;
                    volume *= volume_inc;
                }
            }
        } else if new_volume_db > -90.0 {
            let volume = from_db(new_volume_db);
            if bus_index == 0 {
                for (out, bus) in samples_out.iter_mut().zip(samples_bus) {
                    *out = bus * volume;
                }
            } else {
                for (out, bus) in samples_out.iter_mut().zip(samples_bus) {
                    *out += bus * volume;
                }
            }
        }
        *last_fader_volume_db = new_volume_db;
    }

    fn measure_bus_levels(
        &self,
        bus_index: usize,
        left: &[f32],
        right: &[f32],
        history: &mut [PeakHistory; 2],
    ) {
        // Hold and falloff constants borrowed from zita-mu1.
        const HOLD_SEC: f32 = 0.5;
        const FALLOFF_DB_SEC: f32 = 15.0;

        let volume = if self.mute[bus_index].load(Ordering::Relaxed) {
            0.0
        } else {
            from_db(self.fader_volume_db[bus_index].load(Ordering::Relaxed))
        };
        let peak_levels = [find_peak(left) * volume, find_peak(right) * volume];
        for (channel, &level) in peak_levels.iter().enumerate() {
            let history = &mut history[channel];
            history.historic_peak = history.historic_peak.max(level);
            let mut current_peak = if history.age_seconds < HOLD_SEC {
                history.last_peak
            } else {
                history.last_peak * from_db(-FALLOFF_DB_SEC * (history.age_seconds - HOLD_SEC))
            };
            if level > current_peak {
                history.last_peak = level;
                history.age_seconds = 0.0;
                current_peak = level;
            } else {
                history.age_seconds += left.len() as f32 / OUTPUT_FREQUENCY as f32;
            }
            history.current_level = level;
            history.current_peak = current_peak;
        }
    }

    fn send_audio_level_callback(
        &self,
        num_buses: usize,
        peak_history: &[[PeakHistory; 2]],
        bus_metrics: &[Arc<BusMetrics>],
    ) {
        let callback_guard = self.audio_level_callback.read();
        let Some(callback) = callback_guard.as_ref() else {
            return;
        };

        let (loudness_s, loudness_i, range_low, range_high, peak, correlation) = {
            let measure = self.measure.lock();
            let (range_low, range_high) = measure.r128.loudness_range();
            (
                measure.r128.loudness_s(),
                measure.r128.integrated(),
                range_low,
                range_high,
                measure.peak_meter.peak(),
                measure.correlation.correlation(),
            )
        };

        let mut bus_levels = Vec::with_capacity(num_buses);
        let final_makeup_gain_db;
        {
            let comp = self.compressor_state.lock();
            for bus_index in 0..num_buses {
                let history = &peak_history[bus_index];
                let compressor_attenuation_db =
                    if self.compressor_enabled[bus_index].load(Ordering::Relaxed) {
                        -to_db(comp.compressor[bus_index].attenuation())
                    } else {
                        f32::NAN
                    };
                let level = BusLevel {
                    current_level_dbfs: [
                        to_db(history[0].current_level),
                        to_db(history[1].current_level),
                    ],
                    peak_level_dbfs: [
                        to_db(history[0].current_peak),
                        to_db(history[1].current_peak),
                    ],
                    historic_peak_dbfs: to_db(
                        history[0].historic_peak.max(history[1].historic_peak),
                    ),
                    gain_staging_db: comp.gain_staging_db[bus_index],
                    compressor_attenuation_db,
                };
                if let Some(metrics) = bus_metrics.get(bus_index) {
                    let order = Ordering::Relaxed;
                    metrics.current_level_dbfs[0].store(level.current_level_dbfs[0].into(), order);
                    metrics.current_level_dbfs[1].store(level.current_level_dbfs[1].into(), order);
                    metrics.peak_level_dbfs[0].store(level.peak_level_dbfs[0].into(), order);
                    metrics.peak_level_dbfs[1].store(level.peak_level_dbfs[1].into(), order);
                    metrics
                        .historic_peak_dbfs
                        .store(level.historic_peak_dbfs.into(), order);
                    metrics
                        .gain_staging_db
                        .store(level.gain_staging_db.into(), order);
                    metrics
                        .compressor_attenuation_db
                        .store(level.compressor_attenuation_db.into(), order);
                }
                bus_levels.push(level);
            }
            final_makeup_gain_db = to_db(comp.final_makeup_gain as f32);
        }

        let order = Ordering::Relaxed;
        self.metrics.loudness_short_lufs.store(loudness_s.into(), order);
        self.metrics
            .loudness_integrated_lufs
            .store(loudness_i.into(), order);
        self.metrics
            .loudness_range_low_lufs
            .store(range_low.into(), order);
        self.metrics
            .loudness_range_high_lufs
            .store(range_high.into(), order);
        self.metrics.peak_dbfs.store(to_db(peak).into(), order);
        self.metrics
            .final_makeup_gain_db
            .store(final_makeup_gain_db.into(), order);
        self.metrics.correlation.store(correlation.into(), order);

        callback(&AudioLevels {
            loudness_s_lufs: loudness_s,
            peak_dbfs: to_db(peak),
            bus_levels,
            loudness_i_lufs: loudness_i,
            range_low_lufs: range_low,
            range_high_lufs: range_high,
            final_makeup_gain_db,
            correlation,
        });
    }

    /// All known devices, as a snapshot keyed by [`DeviceSpec`]. This holds
    /// every ALSA device (see [`AlsaPool::get_devices`]); install a mapping
    /// afterwards to settle the hold state, or every card stays held
    /// forever.
    pub fn get_devices(&self) -> BTreeMap<DeviceSpec, DeviceInfo> {
        let mut devices = BTreeMap::new();
        {
            let state = self.state.lock();
            for (index, card) in state.capture_cards.iter().enumerate() {
                devices.insert(
                    DeviceSpec::CaptureCard(index),
                    DeviceInfo {
                        display_name: card.display_name.clone(),
                        num_channels: 8,
                        ..DeviceInfo::default()
                    },
                );
            }
        }
        for (index, card) in self.alsa_pool.get_devices().into_iter().enumerate() {
            devices.insert(
                DeviceSpec::AlsaInput(index),
                DeviceInfo {
                    display_name: card.display_name(),
                    num_channels: card.num_channels,
                    alsa_name: card.name,
                    alsa_info: card.info,
                    alsa_address: card.address,
                },
            );
        }
        devices
    }

    /// State of an ALSA card; see [`AlsaPool::get_card_state`].
    pub fn get_alsa_card_state(&self, index: usize) -> CardState {
        self.alsa_pool.get_card_state(index)
    }

    /// Create a held `Dead` placeholder; see [`AlsaPool::create_dead_card`].
    pub fn create_dead_card(&self, name: &str, info: &str, num_channels: usize) -> DeviceSpec {
        DeviceSpec::AlsaInput(self.alsa_pool.create_dead_card(name, info, num_channels))
    }

    /// Set the display name of a capture card (shown in enumerations and
    /// stored in mappings).
    pub fn set_display_name(&self, spec: DeviceSpec, name: &str) {
        let mut state = self.state.lock();
        let state = &mut *state;
        if let Some(device) =
            device_state_mut(&mut state.capture_cards, &mut state.alsa_inputs, spec)
        {
            device.display_name = name.to_string();
        }
    }

    /// Install a SIMPLE mapping: one bus named "Main" carrying channels 0/1
    /// of the given capture card, fader at 0 dB.
    pub fn set_simple_input(&self, card_index: usize) {
        let mapping = InputMapping {
            buses: vec![Bus {
                name: "Main".to_string(),
                device: DeviceSpec::CaptureCard(card_index),
                source_channel: [0, 1],
            }],
        };
        let mut state = self.state.lock();
        state.mapping_mode = MappingMode::Simple;
        self.set_input_mapping_locked(&mut state, mapping);
        self.fader_volume_db[0].store(0.0, Ordering::Relaxed);
    }

    /// If the current mapping is representable as SIMPLE, the capture card
    /// it maps; `None` otherwise.
    pub fn get_simple_input(&self) -> Option<usize> {
        let state = self.state.lock();
        match state.input_mapping.buses.as_slice() {
            [bus] if bus.source_channel == [0, 1] => match bus.device {
                DeviceSpec::CaptureCard(index) => Some(index),
                _ => None,
            },
            _ => None,
        }
    }

    /// Install a full multichannel mapping.
    pub fn set_input_mapping(&self, mapping: InputMapping) {
        let mut state = self.state.lock();
        self.set_input_mapping_locked(&mut state, mapping);
        state.mapping_mode = MappingMode::Multichannel;
    }

    /// The current mapping mode.
    pub fn get_mapping_mode(&self) -> MappingMode {
        self.state.lock().mapping_mode
    }

    /// A copy of the current mapping.
    pub fn get_input_mapping(&self) -> InputMapping {
        self.state.lock().input_mapping.clone()
    }

    /// Number of buses in the current mapping.
    pub fn num_buses(&self) -> usize {
        self.state.lock().input_mapping.buses.len()
    }

    fn set_input_mapping_locked(&self, state: &mut MixerState, new_mapping: InputMapping) {
        assert!(new_mapping.buses.len() <= MAX_BUSES);

        // The set of interesting channels per device under the new mapping.
        let mut interesting: BTreeMap<DeviceSpec, BTreeSet<usize>> = BTreeMap::new();
        for bus in &new_mapping.buses {
            if matches!(
                bus.device,
                DeviceSpec::CaptureCard(_) | DeviceSpec::AlsaInput(_)
            ) {
                for &channel in &bus.source_channel {
                    if channel != -1 {
                        interesting
                            .entry(bus.device)
                            .or_default()
                            .insert(channel as usize);
                    }
                }
            }
        }

        // Gauges are per mapping: drop the old set, allocate fresh ones
        // sized to the new bus count.
        state.bus_metrics = new_mapping
            .buses
            .iter()
            .enumerate()
            .map(|(bus_index, bus)| BusMetrics::new(bus_index, bus))
            .collect();

        // Per-bus DSP state is recreated for the lifetime of this mapping.
        for bus_index in 0..new_mapping.buses.len() {
            state.locut[bus_index].init(FilterType::Hpf, 2);
            state.eq[bus_index][0].init(FilterType::LowShelf, 1);
            state.eq[bus_index][1].init(FilterType::HighShelf, 1);
        }
        {
            let comp = &mut *self.compressor_state.lock();
            for bus_index in 0..new_mapping.buses.len() {
                comp.level_compressor[bus_index].reset();
                comp.compressor[bus_index].reset();
            }
        }

        // Rebuild the resampler of every device whose interesting set
        // changed; for ALSA devices also settle the hold state.
        for index in 0..state.capture_cards.len() {
            let spec = DeviceSpec::CaptureCard(index);
            let wanted = interesting.get(&spec).cloned().unwrap_or_default();
            if state.capture_cards[index].interesting_channels != wanted {
                state.capture_cards[index].interesting_channels = wanted;
                self.reset_resampler_locked(state, spec);
            }
        }
        for index in 0..state.alsa_inputs.len() {
            let spec = DeviceSpec::AlsaInput(index);
            let wanted = interesting.get(&spec).cloned().unwrap_or_default();
            if wanted.is_empty() {
                self.alsa_pool.release_device(index);
            } else {
                self.alsa_pool.hold_device(index);
            }
            if state.alsa_inputs[index].interesting_channels != wanted {
                state.alsa_inputs[index].interesting_channels = wanted;
                self.alsa_pool.reset_device(index);
                self.reset_resampler_locked(state, spec);
            }
        }

        state.input_mapping = new_mapping;
    }

    /// Persist the current mapping to `path`.
    pub fn save_input_mapping(&self, path: &std::path::Path) -> Result<(), MappingError> {
        mapping::save_input_mapping(&self.get_devices(), &self.get_input_mapping(), path)
    }

    /// Load a mapping from `path`, bind it against the present devices
    /// (creating dead placeholders for missing ones), and install it.
    pub fn load_input_mapping(&self, path: &std::path::Path) -> Result<(), MappingError> {
        let devices = self.get_devices();
        let mapping = mapping::load_input_mapping(&devices, path, |name, info, num_channels| {
            self.create_dead_card(name, info, num_channels)
        })?;
        self.set_input_mapping(mapping);
        Ok(())
    }

    /// Default settings for a new bus, given the mixer configuration.
    pub fn get_default_bus_settings(&self) -> BusSettings {
        BusSettings::default_settings(&self.settings)
    }

    /// All settings of one bus, as a unit.
    pub fn get_bus_settings(&self, bus_index: usize) -> BusSettings {
        let comp = self.compressor_state.lock();
        BusSettings {
            fader_volume_db: self.fader_volume_db[bus_index].load(Ordering::Relaxed),
            muted: self.mute[bus_index].load(Ordering::Relaxed),
            locut_enabled: self.locut_enabled[bus_index].load(Ordering::Relaxed),
            eq_level_db: [
                self.eq_level_db[bus_index][0].load(Ordering::Relaxed),
                self.eq_level_db[bus_index][1].load(Ordering::Relaxed),
                self.eq_level_db[bus_index][2].load(Ordering::Relaxed),
            ],
            gain_staging_db: comp.gain_staging_db[bus_index],
            level_compressor_enabled: comp.level_compressor_enabled[bus_index],
            compressor_threshold_dbfs: self.compressor_threshold_dbfs[bus_index]
                .load(Ordering::Relaxed),
            compressor_enabled: self.compressor_enabled[bus_index].load(Ordering::Relaxed),
        }
    }

    /// Replace all settings of one bus, as a unit.
    pub fn set_bus_settings(&self, bus_index: usize, settings: &BusSettings) {
        let mut comp = self.compressor_state.lock();
        self.fader_volume_db[bus_index].store(settings.fader_volume_db, Ordering::Relaxed);
        self.mute[bus_index].store(settings.muted, Ordering::Relaxed);
        self.locut_enabled[bus_index].store(settings.locut_enabled, Ordering::Relaxed);
        for (band, &db) in settings.eq_level_db.iter().enumerate() {
            self.eq_level_db[bus_index][band].store(db, Ordering::Relaxed);
        }
        comp.gain_staging_db[bus_index] = settings.gain_staging_db;
        comp.last_gain_staging_db[bus_index] = settings.gain_staging_db;
        comp.level_compressor_enabled[bus_index] = settings.level_compressor_enabled;
        self.compressor_threshold_dbfs[bus_index]
            .store(settings.compressor_threshold_dbfs, Ordering::Relaxed);
        self.compressor_enabled[bus_index].store(settings.compressor_enabled, Ordering::Relaxed);
    }

    /// Fader position of a bus, in dB.
    pub fn get_fader_volume(&self, bus_index: usize) -> f32 {
        self.fader_volume_db[bus_index].load(Ordering::Relaxed)
    }

    /// Move a bus fader. The change is faded in over the next block.
    pub fn set_fader_volume(&self, bus_index: usize, level_db: f32) {
        self.fader_volume_db[bus_index].store(level_db, Ordering::Relaxed);
    }

    /// Whether a bus is muted.
    pub fn get_mute(&self, bus_index: usize) -> bool {
        self.mute[bus_index].load(Ordering::Relaxed)
    }

    /// Mute or unmute a bus.
    pub fn set_mute(&self, bus_index: usize, muted: bool) {
        self.mute[bus_index].store(muted, Ordering::Relaxed);
    }

    /// The high-pass cutoff shared by all buses, in Hz.
    pub fn get_locut_cutoff(&self) -> f32 {
        self.locut_cutoff_hz.load(Ordering::Relaxed)
    }

    /// Set the high-pass cutoff shared by all buses.
    pub fn set_locut_cutoff(&self, cutoff_hz: f32) {
        self.locut_cutoff_hz.store(cutoff_hz, Ordering::Relaxed);
    }

    /// Whether the high-pass filter is engaged on a bus.
    pub fn get_locut_enabled(&self, bus_index: usize) -> bool {
        self.locut_enabled[bus_index].load(Ordering::Relaxed)
    }

    /// Engage or bypass the high-pass filter on a bus.
    pub fn set_locut_enabled(&self, bus_index: usize, enabled: bool) {
        self.locut_enabled[bus_index].store(enabled, Ordering::Relaxed);
    }

    /// EQ gain of one band on a bus, in dB.
    pub fn get_eq(&self, bus_index: usize, band: EqBand) -> f32 {
        self.eq_level_db[bus_index][band as usize].load(Ordering::Relaxed)
    }

    /// Set the EQ gain of one band on a bus. Faded in over the next block.
    pub fn set_eq(&self, bus_index: usize, band: EqBand, db_gain: f32) {
        self.eq_level_db[bus_index][band as usize].store(db_gain, Ordering::Relaxed);
    }

    /// The master limiter threshold, in dBFS.
    pub fn get_limiter_threshold_dbfs(&self) -> f32 {
        self.limiter_threshold_dbfs.load(Ordering::Relaxed)
    }

    /// Set the master limiter threshold.
    pub fn set_limiter_threshold_dbfs(&self, threshold_dbfs: f32) {
        self.limiter_threshold_dbfs
            .store(threshold_dbfs, Ordering::Relaxed);
    }

    /// Whether the master limiter is engaged.
    pub fn get_limiter_enabled(&self) -> bool {
        self.limiter_enabled.load(Ordering::Relaxed)
    }

    /// Engage or bypass the master limiter.
    pub fn set_limiter_enabled(&self, enabled: bool) {
        self.limiter_enabled.store(enabled, Ordering::Relaxed);
    }

    /// A bus's compressor threshold, in dBFS.
    pub fn get_compressor_threshold_dbfs(&self, bus_index: usize) -> f32 {
        self.compressor_threshold_dbfs[bus_index].load(Ordering::Relaxed)
    }

    /// Set a bus's compressor threshold.
    pub fn set_compressor_threshold_dbfs(&self, bus_index: usize, threshold_dbfs: f32) {
        self.compressor_threshold_dbfs[bus_index].store(threshold_dbfs, Ordering::Relaxed);
    }

    /// Whether a bus's compressor is engaged.
    pub fn get_compressor_enabled(&self, bus_index: usize) -> bool {
        self.compressor_enabled[bus_index].load(Ordering::Relaxed)
    }

    /// Engage or bypass a bus's compressor.
    pub fn set_compressor_enabled(&self, bus_index: usize, enabled: bool) {
        self.compressor_enabled[bus_index].store(enabled, Ordering::Relaxed);
    }

    /// Current gain staging of a bus, in dB (whether manual or automatic).
    pub fn get_gain_staging_db(&self, bus_index: usize) -> f32 {
        self.compressor_state.lock().gain_staging_db[bus_index]
    }

    /// Switch a bus to manual gain staging at the given level. The automatic
    /// level was being written to the same slot, so the level does not jump.
    pub fn set_gain_staging_db(&self, bus_index: usize, gain_db: f32) {
        let mut comp = self.compressor_state.lock();
        comp.level_compressor_enabled[bus_index] = false;
        comp.gain_staging_db[bus_index] = gain_db;
    }

    /// Whether a bus's gain staging is automatic.
    pub fn get_gain_staging_auto(&self, bus_index: usize) -> bool {
        self.compressor_state.lock().level_compressor_enabled[bus_index]
    }

    /// Switch a bus between automatic and manual gain staging.
    pub fn set_gain_staging_auto(&self, bus_index: usize, enabled: bool) {
        self.compressor_state.lock().level_compressor_enabled[bus_index] = enabled;
    }

    /// Current final makeup gain, in dB.
    pub fn get_final_makeup_gain_db(&self) -> f32 {
        to_db(self.compressor_state.lock().final_makeup_gain as f32)
    }

    /// Switch to a fixed final makeup gain.
    pub fn set_final_makeup_gain_db(&self, gain_db: f32) {
        let mut comp = self.compressor_state.lock();
        comp.final_makeup_gain_auto = false;
        comp.final_makeup_gain = f64::from(from_db(gain_db));
    }

    /// Whether the final makeup gain tracks loudness automatically.
    pub fn get_final_makeup_gain_auto(&self) -> bool {
        self.compressor_state.lock().final_makeup_gain_auto
    }

    /// Switch the final makeup gain between automatic and fixed.
    pub fn set_final_makeup_gain_auto(&self, enabled: bool) {
        self.compressor_state.lock().final_makeup_gain_auto = enabled;
    }

    /// Forget a bus's held and historic peaks.
    pub fn reset_peak(&self, bus_index: usize) {
        let mut state = self.state.lock();
        state.peak_history[bus_index] = [PeakHistory::default(); 2];
    }

    /// Restart all program metering (R128, correlation, peak).
    pub fn reset_meters(&self) {
        let measure = &mut *self.measure.lock();
        measure.r128.reset();
        measure.correlation.reset();
        measure.peak_meter.reset();
    }

    /// Install the level callback.
    pub fn set_audio_level_callback(&self, callback: Option<AudioLevelCallback>) {
        *self.audio_level_callback.write() = callback;
    }

    /// Install the state-changed callback.
    pub fn set_state_changed_callback(&self, callback: Option<StateChangedCallback>) {
        *self.state_changed_callback.write() = callback;
    }

    /// Invoke the state-changed callback, if any.
    pub fn trigger_state_changed_callback(&self) {
        let callback = self.state_changed_callback.read();
        if let Some(callback) = callback.as_ref() {
            callback();
        }
    }
}

impl BusSettings {
    /// The settings a new bus starts with, given the mixer configuration.
    pub fn default_settings(settings: &MixerSettings) -> Self {
        Self {
            fader_volume_db: 0.0,
            muted: false,
            locut_enabled: settings.locut_enabled,
            eq_level_db: [0.0; NUM_EQ_BANDS],
            gain_staging_db: settings.initial_gain_staging_db,
            level_compressor_enabled: settings.gain_staging_auto,
            compressor_threshold_dbfs: REF_LEVEL_DBFS - 12.0,
            compressor_enabled: settings.compressor_enabled,
        }
    }
}

impl CaptureSink for AudioMixer {
    fn add_audio(
        &self,
        spec: DeviceSpec,
        data: &[u8],
        num_samples: usize,
        format: AudioFormat,
        frame_length: i64,
        frame_time: Instant,
    ) -> bool {
        AudioMixer::add_audio(self, spec, data, num_samples, format, frame_length, frame_time)
    }

    fn silence_card(&self, spec: DeviceSpec, silence: bool) -> bool {
        AudioMixer::silence_card(self, spec, silence)
    }

    fn set_display_name(&self, spec: DeviceSpec, name: &str) {
        AudioMixer::set_display_name(self, spec, name);
    }

    fn state_changed(&self) {
        self.trigger_state_changed_callback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    fn quiet_settings() -> MixerSettings {
        MixerSettings {
            locut_enabled: false,
            gain_staging_auto: false,
            initial_gain_staging_db: 0.0,
            compressor_enabled: false,
            limiter_enabled: false,
            final_makeup_gain_auto: false,
            ..MixerSettings::default()
        }
    }

    fn pcm32(samples: &[f32]) -> Vec<u8> {
        samples
            .iter()
            .flat_map(|&x| {
                let value = (f64::from(x) * 2147483648.0)
                    .clamp(-2147483648.0, 2147483647.0) as i32;
                value.to_le_bytes()
            })
            .collect()
    }

    fn stereo_sine(num_frames: usize, freq: f32, amplitude: f32, phase_frames: usize) -> Vec<f32> {
        (0..num_frames)
            .flat_map(|i| {
                let t = (i + phase_frames) as f32 / 48000.0;
                let x = amplitude * (2.0 * std::f32::consts::PI * freq * t).sin();
                [x, x]
            })
            .collect()
    }

    // Feed interleaved stereo frames to a capture-card device in 480-frame
    // chunks with consistent 10 ms timestamps.
    fn feed(mixer: &AudioMixer, spec: DeviceSpec, frames: &[f32], t0: Instant) {
        let format = AudioFormat {
            bits_per_sample: 32,
            num_channels: 2,
            sample_rate: 48000,
        };
        for (chunk_index, chunk) in frames.chunks(2 * 480).enumerate() {
            let bytes = pcm32(chunk);
            let ts = t0 + Duration::from_millis(chunk_index as u64 * 10);
            while !mixer.add_audio(spec, &bytes, chunk.len() / 2, format, 0, ts) {}
        }
    }

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|&x| x * x).sum::<f32>() / samples.len() as f32).sqrt()
    }

    #[test]
    fn output_always_has_exact_sample_count() {
        let mixer = AudioMixer::new(1, quiet_settings());
        let t0 = Instant::now();
        for n in [1, 7, 480, 1024, 4096] {
            let out = mixer.get_output(t0, n, RateAdjustmentPolicy::DoNotAdjustRate);
            assert_eq!(out.len(), 2 * n);
        }
    }

    #[test]
    fn silence_in_silence_out() {
        let mixer = AudioMixer::new(1, quiet_settings());
        let t0 = Instant::now();
        feed(&mixer, DeviceSpec::CaptureCard(0), &vec![0.0; 2 * 48000], t0);
        let out = mixer.get_output(t0, 1024, RateAdjustmentPolicy::DoNotAdjustRate);
        assert!(out.iter().all(|&x| x == 0.0), "non-zero sample in output");
    }

    #[test]
    fn unity_passthrough() {
        let mixer = AudioMixer::new(1, quiet_settings());
        let levels: Arc<PlMutex<Option<AudioLevels>>> = Arc::new(PlMutex::new(None));
        {
            let levels = Arc::clone(&levels);
            mixer.set_audio_level_callback(Some(Box::new(move |l: &AudioLevels| {
                *levels.lock() = Some(l.clone());
            })));
        }
        let t0 = Instant::now();
        feed(
            &mixer,
            DeviceSpec::CaptureCard(0),
            &stereo_sine(48000, 1000.0, 0.25, 0),
            t0,
        );
        let out = mixer.get_output(t0, 48000, RateAdjustmentPolicy::DoNotAdjustRate);

        let peak = out.iter().fold(0.0f32, |m, &x| m.max(x.abs()));
        assert!((0.24..=0.26).contains(&peak), "peak {peak}");
        let rms_out = rms(&out);
        assert!((0.175..=0.179).contains(&rms_out), "rms {rms_out}");

        let levels = levels.lock();
        let levels = levels.as_ref().expect("level callback did not fire");
        assert!(levels.correlation > 0.99, "correlation {}", levels.correlation);
        assert!((levels.peak_dbfs - to_db(0.25)).abs() < 0.5);
        // The compressor is disabled, so its attenuation reads NaN.
        assert!(levels.bus_levels[0].compressor_attenuation_db.is_nan());
    }

    #[test]
    fn muted_bus_contributes_exact_zeros() {
        let mixer = AudioMixer::new(1, quiet_settings());
        mixer.set_mute(0, true);
        let t0 = Instant::now();
        feed(
            &mixer,
            DeviceSpec::CaptureCard(0),
            &stereo_sine(3 * 48000, 1000.0, 0.5, 0),
            t0,
        );
        // The first block fades from the previous fader level down to the
        // mute floor; every block after that is exact zeros.
        let _ = mixer.get_output(t0, 1024, RateAdjustmentPolicy::DoNotAdjustRate);
        for _ in 0..8 {
            let out = mixer.get_output(t0, 1024, RateAdjustmentPolicy::DoNotAdjustRate);
            assert!(out.iter().all(|&x| x == 0.0), "muted bus leaked audio");
        }
    }

    #[test]
    fn higher_fader_never_lowers_magnitudes() {
        let run = |fader_db: f32| {
            let mixer = AudioMixer::new(1, quiet_settings());
            mixer.set_fader_volume(0, fader_db);
            let t0 = Instant::now();
            feed(
                &mixer,
                DeviceSpec::CaptureCard(0),
                &stereo_sine(2 * 48000, 1000.0, 0.25, 0),
                t0,
            );
            // One warm-up block so the fader fade has settled.
            let _ = mixer.get_output(t0, 4800, RateAdjustmentPolicy::DoNotAdjustRate);
            mixer.get_output(t0, 4800, RateAdjustmentPolicy::DoNotAdjustRate)
        };
        let low = run(-6.0);
        let high = run(0.0);
        for (a, b) in low.iter().zip(&high) {
            assert!(a.abs() <= b.abs() + 1e-6);
        }
    }

    #[test]
    fn compressor_reduces_peaks_as_the_knee_predicts() {
        let mixer = AudioMixer::new(1, quiet_settings());
        mixer.set_compressor_enabled(0, true);
        mixer.set_compressor_threshold_dbfs(0, -20.0);
        let t0 = Instant::now();
        let mut input = vec![0.0f32; 2 * 48000];
        input.extend(stereo_sine(2 * 48000, 1000.0, 0.9, 0));
        feed(&mixer, DeviceSpec::CaptureCard(0), &input, t0);

        // Pull a little less than was fed, so the tail is never starved.
        let mut out = Vec::new();
        for _ in 0..28 {
            out.extend(mixer.get_output(t0, 4800, RateAdjustmentPolicy::DoNotAdjustRate));
        }
        // Look at the last second, after the envelope has settled.
        let tail = &out[out.len() - 2 * 48000..];
        let tail_peak = tail.iter().fold(0.0f32, |m, &x| m.max(x.abs()));
        assert!(tail_peak < 0.3, "tail peak {tail_peak}");

        // The knee is makeup * (level/threshold)^(1/ratio - 1) with makeup
        // +6 dB, ratio 20, threshold 0.1; at an envelope level around 0.86
        // that is a gain of ~0.25.
        let rms_in = 0.9 / std::f32::consts::SQRT_2;
        let predicted_gain = 2.0 * (0.86f32 / 0.1).powf(1.0 / 20.0 - 1.0);
        let ratio = rms(tail) / rms_in;
        assert!(
            (ratio / predicted_gain - 1.0).abs() < 0.10,
            "gain ratio {ratio} vs predicted {predicted_gain}"
        );
    }

    #[test]
    fn mapping_swap_never_mixes_sources_in_one_block() {
        let mixer = AudioMixer::new(2, quiet_settings());
        let t0 = Instant::now();

        // Mapping A: card 0 (amplitude 0.25). Card 1 (amplitude 0.125) is
        // not interesting yet, so its audio is dropped.
        let sine_a = stereo_sine(2 * 48000, 1000.0, 0.25, 0);
        let sine_b = stereo_sine(2 * 48000, 1000.0, 0.125, 0);
        feed(&mixer, DeviceSpec::CaptureCard(0), &sine_a, t0);
        feed(&mixer, DeviceSpec::CaptureCard(1), &sine_b, t0);

        let classify = |block: &[f32]| -> &'static str {
            let peak = block.iter().fold(0.0f32, |m, &x| m.max(x.abs()));
            if (0.24..=0.26).contains(&peak) {
                "a"
            } else if (0.115..=0.135).contains(&peak) {
                "b"
            } else if peak == 0.0 {
                "silence"
            } else {
                "mixed"
            }
        };

        let mut seen = Vec::new();
        for _ in 0..8 {
            let out = mixer.get_output(t0, 1024, RateAdjustmentPolicy::DoNotAdjustRate);
            seen.push(classify(&out));
        }

        let mapping_b = InputMapping {
            buses: vec![Bus {
                name: "Main".to_string(),
                device: DeviceSpec::CaptureCard(1),
                source_channel: [0, 1],
            }],
        };
        mixer.set_input_mapping(mapping_b);
        // Card 1's queue was just created, so it needs fresh audio.
        feed(&mixer, DeviceSpec::CaptureCard(1), &sine_b, t0);

        for _ in 0..8 {
            let out = mixer.get_output(t0, 1024, RateAdjustmentPolicy::DoNotAdjustRate);
            seen.push(classify(&out));
        }

        assert!(!seen.contains(&"mixed"), "blocks: {seen:?}");
        assert!(seen[..8].iter().all(|&c| c == "a"), "blocks: {seen:?}");
        assert!(
            seen[8..].iter().all(|&c| c == "b" || c == "silence"),
            "blocks: {seen:?}"
        );
    }

    #[test]
    fn simple_input_is_recognized() {
        let mixer = AudioMixer::new(2, quiet_settings());
        assert_eq!(mixer.get_simple_input(), Some(0));
        assert_eq!(mixer.get_mapping_mode(), MappingMode::Simple);

        mixer.set_input_mapping(InputMapping {
            buses: vec![Bus {
                name: "Aux".to_string(),
                device: DeviceSpec::CaptureCard(1),
                source_channel: [1, 0],
            }],
        });
        assert_eq!(mixer.get_simple_input(), None);
        assert_eq!(mixer.get_mapping_mode(), MappingMode::Multichannel);
    }

    #[test]
    fn bus_settings_round_trip() {
        let mixer = AudioMixer::new(1, quiet_settings());
        let settings = BusSettings {
            fader_volume_db: -12.5,
            muted: true,
            locut_enabled: true,
            eq_level_db: [2.0, -1.0, 3.5],
            gain_staging_db: 4.0,
            level_compressor_enabled: false,
            compressor_threshold_dbfs: -18.0,
            compressor_enabled: true,
        };
        mixer.set_bus_settings(3, &settings);
        assert_eq!(mixer.get_bus_settings(3), settings);
    }

    #[test]
    fn mapping_save_load_round_trip() {
        let mixer = AudioMixer::new(2, quiet_settings());
        let mapping = InputMapping {
            buses: vec![
                Bus {
                    name: "Main".to_string(),
                    device: DeviceSpec::CaptureCard(0),
                    source_channel: [0, 1],
                },
                Bus {
                    name: "Aux".to_string(),
                    device: DeviceSpec::CaptureCard(1),
                    source_channel: [2, -1],
                },
            ],
        };
        mixer.set_input_mapping(mapping.clone());

        let mut path = std::env::temp_dir();
        path.push(format!("livemix-mixer-mapping-{}", std::process::id()));
        mixer.save_input_mapping(&path).unwrap();
        mixer.set_simple_input(0);
        mixer.load_input_mapping(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(mixer.get_input_mapping(), mapping);
    }
}
