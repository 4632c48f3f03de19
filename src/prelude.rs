//! Re-exports of the types most users need.

pub use crate::device::{AudioFormat, DeviceInfo, DeviceSpec};
pub use crate::mapping::{Bus, InputMapping, MappingMode};
pub use crate::mixer::{AudioMixer, BusLevel, BusSettings};
pub use crate::resampler::{RateAdjustmentPolicy, ResamplingQueue};
pub use crate::settings::{MixerSettings, MAX_BUSES, OUTPUT_FREQUENCY, TIMEBASE};
