//! Compile-time limits and the runtime configuration surface of the mixer.

/// Sample rate of the program output, in Hz. The whole DSP chain runs at this
/// rate; capture devices running at other rates are adapted by their
/// [`ResamplingQueue`](crate::resampler::ResamplingQueue).
pub const OUTPUT_FREQUENCY: u32 = 48_000;

/// Common timebase that allows us to represent one frame exactly in all the
/// relevant frame rates:
///
/// ```text
///   Timebase:                1/120000
///   Frame at 50fps:       2400/120000
///   Frame at 60fps:       2000/120000
///   Frame at 59.94fps:    2002/120000
///   Frame at 23.976fps:   5005/120000
/// ```
pub const TIMEBASE: i64 = 120_000;

/// Maximum number of audio buses in an input mapping.
pub const MAX_BUSES: usize = 256;

/// Maximum number of externally-driven capture cards.
pub const MAX_CAPTURE_CARDS: usize = 16;

/// Maximum number of ALSA capture devices the mixer tracks.
pub const MAX_ALSA_CARDS: usize = 16;

/// How many times a deferred device probe is retried (at 1 Hz) before the
/// address is given up on.
pub(crate) const PROBE_RETRIES: u32 = 10;

/// Runtime configuration for [`AudioMixer`](crate::mixer::AudioMixer).
///
/// These are the initial values; everything here can also be changed at
/// runtime through the mixer's setters.
#[derive(Debug, Clone)]
pub struct MixerSettings {
    /// Target delay of each device's resampling queue, in milliseconds.
    pub audio_queue_length_ms: f64,
    /// Whether the per-bus high-pass filter starts enabled.
    pub locut_enabled: bool,
    /// Whether per-bus gain staging starts in automatic mode.
    pub gain_staging_auto: bool,
    /// Initial manual gain staging, in dB.
    pub initial_gain_staging_db: f32,
    /// Whether the per-bus compressor starts enabled.
    pub compressor_enabled: bool,
    /// Whether the master limiter starts enabled.
    pub limiter_enabled: bool,
    /// Whether the final makeup gain starts in automatic (R128-tracking) mode.
    pub final_makeup_gain_auto: bool,
}

impl Default for MixerSettings {
    fn default() -> Self {
        Self {
            audio_queue_length_ms: 100.0,
            locut_enabled: true,
            gain_staging_auto: true,
            initial_gain_staging_db: 0.0,
            compressor_enabled: true,
            limiter_enabled: true,
            final_makeup_gain_auto: true,
        }
    }
}
