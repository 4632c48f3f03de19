//! Identity and description of audio sources.

use std::fmt;

/// Identity of an audio source.
///
/// A bus in the input mapping names its source through one of these rather
/// than through any kind of pointer; the variants with an index refer to a
/// slot number in the corresponding registry. `Silence` is a first-class
/// source so that an unconnected bus needs no special-casing in the mixing
/// loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceSpec {
    /// A source that always produces zeros.
    Silence,
    /// An externally-driven capture card, by slot number.
    CaptureCard(usize),
    /// An ALSA capture device, by pool slot number.
    AlsaInput(usize),
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSpec::Silence => write!(f, "silence"),
            DeviceSpec::CaptureCard(i) => write!(f, "capture card {i}"),
            DeviceSpec::AlsaInput(i) => write!(f, "ALSA input {i}"),
        }
    }
}

/// Descriptive information about a device, as shown to the user and as
/// matched against when loading a persisted input mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Human-readable name.
    pub display_name: String,
    /// Number of capture channels the device exposes.
    pub num_channels: usize,
    /// ALSA card name (ALSA devices only).
    pub alsa_name: String,
    /// ALSA PCM info string (ALSA devices only).
    pub alsa_info: String,
    /// ALSA bus address, e.g. `hw:0,0` (ALSA devices only).
    pub alsa_address: String,
}

/// Wire format of a buffer delivered by a capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// 16, 24 (packed three-byte) or 32 bits per sample, little-endian
    /// signed. Zero for an empty buffer.
    pub bits_per_sample: u32,
    /// Channels per frame in the delivered buffer.
    pub num_channels: usize,
    /// The rate the device is actually running at, in Hz.
    pub sample_rate: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_ordering() {
        assert!(DeviceSpec::Silence < DeviceSpec::CaptureCard(0));
        assert!(DeviceSpec::CaptureCard(7) < DeviceSpec::AlsaInput(0));
        assert!(DeviceSpec::AlsaInput(1) < DeviceSpec::AlsaInput(2));
    }
}
