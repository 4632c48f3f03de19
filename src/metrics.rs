//! Metric gauges exported by the mixer.
//!
//! The mixer only maintains the values, as lock-free atomics that are safe to
//! read from any thread; scraping and exposition belong to whatever metrics
//! endpoint the application embeds. Gauges that have not been written yet
//! read as NaN.

use std::sync::Arc;

use atomic_float::AtomicF64;

use crate::device::DeviceSpec;
use crate::mapping::Bus;

fn nan_gauge() -> AtomicF64 {
    AtomicF64::new(f64::NAN)
}

/// Program-wide gauges, one instance per mixer.
#[derive(Debug)]
pub struct MixerMetrics {
    /// Short-term loudness of the program output, LUFS.
    pub loudness_short_lufs: AtomicF64,
    /// Integrated loudness of the program output, LUFS.
    pub loudness_integrated_lufs: AtomicF64,
    /// Low end of the loudness range, LUFS.
    pub loudness_range_low_lufs: AtomicF64,
    /// High end of the loudness range, LUFS.
    pub loudness_range_high_lufs: AtomicF64,
    /// Oversampled peak of the program output, dBFS.
    pub peak_dbfs: AtomicF64,
    /// Current final makeup gain, dB.
    pub final_makeup_gain_db: AtomicF64,
    /// L/R correlation of the program output.
    pub correlation: AtomicF64,
}

impl MixerMetrics {
    pub(crate) fn new() -> Self {
        Self {
            loudness_short_lufs: nan_gauge(),
            loudness_integrated_lufs: nan_gauge(),
            loudness_range_low_lufs: nan_gauge(),
            loudness_range_high_lufs: nan_gauge(),
            peak_dbfs: nan_gauge(),
            final_makeup_gain_db: AtomicF64::new(0.0),
            correlation: AtomicF64::new(0.0),
        }
    }
}

/// Gauges for one bus of the current input mapping. A fresh set is allocated
/// on every mapping change; holders of an [`Arc`] to an old set simply stop
/// seeing updates.
#[derive(Debug)]
pub struct BusMetrics {
    /// Label set identifying the bus (index, name, source).
    pub labels: Vec<(String, String)>,
    /// Digital peak of the last block, dBFS, left and right.
    pub current_level_dbfs: [AtomicF64; 2],
    /// Peak with hold and falloff, dBFS, left and right.
    pub peak_level_dbfs: [AtomicF64; 2],
    /// Highest peak since the last reset, dBFS.
    pub historic_peak_dbfs: AtomicF64,
    /// Current gain staging, dB.
    pub gain_staging_db: AtomicF64,
    /// Current compressor attenuation, dB (positive); NaN when the
    /// compressor is disabled.
    pub compressor_attenuation_db: AtomicF64,
}

impl BusMetrics {
    pub(crate) fn new(bus_index: usize, bus: &Bus) -> Arc<Self> {
        let source_type = match bus.device {
            DeviceSpec::Silence => "silence",
            DeviceSpec::CaptureCard(_) => "capture_card",
            DeviceSpec::AlsaInput(_) => "alsa_input",
        };
        let source_index = match bus.device {
            DeviceSpec::Silence => 0,
            DeviceSpec::CaptureCard(index) | DeviceSpec::AlsaInput(index) => index,
        };
        let labels = vec![
            ("index".to_string(), bus_index.to_string()),
            ("name".to_string(), bus.name.clone()),
            ("source_type".to_string(), source_type.to_string()),
            ("source_index".to_string(), source_index.to_string()),
            (
                "source_channels".to_string(),
                format!("{}:{}", bus.source_channel[0], bus.source_channel[1]),
            ),
        ];
        Arc::new(Self {
            labels,
            current_level_dbfs: [nan_gauge(), nan_gauge()],
            peak_level_dbfs: [nan_gauge(), nan_gauge()],
            historic_peak_dbfs: nan_gauge(),
            gain_staging_db: nan_gauge(),
            compressor_attenuation_db: nan_gauge(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_gauges_read_nan() {
        let metrics = MixerMetrics::new();
        assert!(metrics
            .loudness_short_lufs
            .load(std::sync::atomic::Ordering::Relaxed)
            .is_nan());
        assert_eq!(
            metrics
                .final_makeup_gain_db
                .load(std::sync::atomic::Ordering::Relaxed),
            0.0
        );
    }

    #[test]
    fn bus_labels_describe_the_source() {
        let bus = Bus {
            name: "Vox".to_string(),
            device: DeviceSpec::AlsaInput(3),
            source_channel: [0, 1],
        };
        let metrics = BusMetrics::new(2, &bus);
        assert!(metrics
            .labels
            .contains(&("source_type".to_string(), "alsa_input".to_string())));
        assert!(metrics
            .labels
            .contains(&("source_channels".to_string(), "0:1".to_string())));
    }
}
