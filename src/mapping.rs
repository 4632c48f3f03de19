//! Bus-to-device routing, and its persistence.
//!
//! An input mapping is the user-editable description of which device channels
//! feed which buses. On disk it is stored with devices described by name
//! rather than by slot number, so a mapping survives reboots and replugs;
//! loading matches each stored descriptor against the present devices, first
//! exactly and then by name alone, and synthesizes a dead placeholder card
//! for anything that is missing entirely.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::{DeviceInfo, DeviceSpec};

/// One stereo routing in the input mapping, with its own DSP chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bus {
    /// User-visible name.
    pub name: String,
    /// The source device.
    pub device: DeviceSpec,
    /// Left and right source channel on the device; -1 means silence on that
    /// side.
    pub source_channel: [i32; 2],
}

impl Default for Bus {
    fn default() -> Self {
        Self {
            name: String::new(),
            device: DeviceSpec::Silence,
            source_channel: [-1, -1],
        }
    }
}

/// An ordered set of [`Bus`]es.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputMapping {
    /// The buses, in mixing order.
    pub buses: Vec<Bus>,
}

/// How the mixer's mapping is being presented to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingMode {
    /// A single bus named "Main", channels 0/1 of one capture card, fader
    /// locked to +0 dB. A UI abstraction over exactly the same audio code as
    /// `Multichannel`; just less flexible.
    Simple,
    /// Full, arbitrary mappings.
    Multichannel,
}

/// Errors from saving or loading a mapping file.
#[derive(Debug, Error)]
pub enum MappingError {
    /// Reading or writing the file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The file contents could not be parsed.
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    /// A bus referenced a device that is not in the snapshot.
    #[error("mapping references unknown device: {0}")]
    UnknownDevice(DeviceSpec),
    /// A stored bus pointed outside the stored device table.
    #[error("bus references device table entry {0}, which does not exist")]
    BadDeviceIndex(usize),
}

// On-disk descriptor for a device. Stored by name so that the mapping is
// portable across reboots and replugs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DeviceDescriptor {
    Silence,
    CaptureCard {
        index: usize,
        display_name: String,
    },
    AlsaInput {
        name: String,
        info: String,
        num_channels: usize,
        address: String,
        display_name: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct BusEntry {
    name: String,
    device_index: usize,
    source_channel_left: i32,
    source_channel_right: i32,
}

#[derive(Debug, Serialize, Deserialize)]
struct MappingDocument {
    devices: Vec<DeviceDescriptor>,
    buses: Vec<BusEntry>,
}

fn describe_device(
    spec: DeviceSpec,
    devices: &BTreeMap<DeviceSpec, DeviceInfo>,
) -> Result<DeviceDescriptor, MappingError> {
    match spec {
        DeviceSpec::Silence => Ok(DeviceDescriptor::Silence),
        DeviceSpec::CaptureCard(index) => {
            let info = devices
                .get(&spec)
                .ok_or(MappingError::UnknownDevice(spec))?;
            Ok(DeviceDescriptor::CaptureCard {
                index,
                display_name: info.display_name.clone(),
            })
        }
        DeviceSpec::AlsaInput(_) => {
            let info = devices
                .get(&spec)
                .ok_or(MappingError::UnknownDevice(spec))?;
            Ok(DeviceDescriptor::AlsaInput {
                name: info.alsa_name.clone(),
                info: info.alsa_info.clone(),
                num_channels: info.num_channels,
                address: info.alsa_address.clone(),
                display_name: info.display_name.clone(),
            })
        }
    }
}

/// Serialize `mapping` to `path`, describing devices through the `devices`
/// snapshot. The file is written in full, then closed; atomic replacement
/// (temp file + rename) is the caller's responsibility.
pub fn save_input_mapping(
    devices: &BTreeMap<DeviceSpec, DeviceInfo>,
    mapping: &InputMapping,
    path: &Path,
) -> Result<(), MappingError> {
    let mut document = MappingDocument {
        devices: Vec::new(),
        buses: Vec::new(),
    };
    let mut used_devices: BTreeMap<DeviceSpec, usize> = BTreeMap::new();
    for bus in &mapping.buses {
        let device_index = match used_devices.get(&bus.device) {
            Some(&index) => index,
            None => {
                let index = document.devices.len();
                document.devices.push(describe_device(bus.device, devices)?);
                used_devices.insert(bus.device, index);
                index
            }
        };
        document.buses.push(BusEntry {
            name: bus.name.clone(),
            device_index,
            source_channel_left: bus.source_channel[0],
            source_channel_right: bus.source_channel[1],
        });
    }

    fs::write(path, serde_json::to_vec_pretty(&document)?)?;
    Ok(())
}

// Match one stored descriptor against the devices that are present,
// consuming the matched device from `remaining`. This is not a full maximal
// matching, but it is good enough for our uses.
fn match_device(
    descriptor: &DeviceDescriptor,
    devices: &BTreeMap<DeviceSpec, DeviceInfo>,
    remaining: &mut BTreeSet<DeviceSpec>,
    create_dead_card: &mut dyn FnMut(&str, &str, usize) -> DeviceSpec,
) -> DeviceSpec {
    match descriptor {
        DeviceDescriptor::Silence => DeviceSpec::Silence,
        DeviceDescriptor::CaptureCard {
            index,
            display_name,
        } => {
            // First see if there is a card that matches on both index and
            // name.
            let by_index = DeviceSpec::CaptureCard(*index);
            if remaining.contains(&by_index)
                && devices
                    .get(&by_index)
                    .is_some_and(|info| info.display_name == *display_name)
            {
                remaining.remove(&by_index);
                return by_index;
            }
            // Then a match on name alone.
            let by_name = remaining.iter().copied().find(|spec| {
                matches!(spec, DeviceSpec::CaptureCard(_))
                    && devices
                        .get(spec)
                        .is_some_and(|info| info.display_name == *display_name)
            });
            if let Some(spec) = by_name {
                remaining.remove(&spec);
                return spec;
            }
            // Failing that, take the index if it is at least free.
            if remaining.remove(&by_index) {
                return by_index;
            }
            DeviceSpec::Silence
        }
        DeviceDescriptor::AlsaInput {
            name,
            info,
            num_channels,
            address,
            ..
        } => {
            // Exact match on name, info, channel count and address.
            let exact = remaining.iter().copied().find(|spec| {
                matches!(spec, DeviceSpec::AlsaInput(_))
                    && devices.get(spec).is_some_and(|dev| {
                        dev.alsa_name == *name
                            && dev.alsa_info == *info
                            && dev.num_channels == *num_channels
                            && dev.alsa_address == *address
                    })
            });
            if let Some(spec) = exact {
                remaining.remove(&spec);
                return spec;
            }
            // Looser check: ignore the address (the cards probably came back
            // in a different order).
            let relaxed = remaining.iter().copied().find(|spec| {
                matches!(spec, DeviceSpec::AlsaInput(_))
                    && devices.get(spec).is_some_and(|dev| {
                        dev.alsa_name == *name
                            && dev.alsa_info == *info
                            && dev.num_channels == *num_channels
                    })
            });
            if let Some(spec) = relaxed {
                remaining.remove(&spec);
                return spec;
            }
            // We could not map this to a present device, but one may appear
            // later through hotplug. Create a dead card matching this one;
            // it only gives silence for now, but can be replaced later.
            create_dead_card(name, info, *num_channels)
        }
    }
}

/// Parse the mapping file at `path` and bind it to the `devices` snapshot.
///
/// Stored devices with no present counterpart become dead placeholder cards
/// through `create_dead_card`, so the mapping structure survives their
/// absence.
pub fn load_input_mapping(
    devices: &BTreeMap<DeviceSpec, DeviceInfo>,
    path: &Path,
    mut create_dead_card: impl FnMut(&str, &str, usize) -> DeviceSpec,
) -> Result<InputMapping, MappingError> {
    let document: MappingDocument = serde_json::from_slice(&fs::read(path)?)?;

    let mut remaining: BTreeSet<DeviceSpec> = devices.keys().copied().collect();
    let device_mapping: Vec<DeviceSpec> = document
        .devices
        .iter()
        .map(|descriptor| {
            match_device(descriptor, devices, &mut remaining, &mut create_dead_card)
        })
        .collect();

    let mut mapping = InputMapping::default();
    for entry in document.buses {
        let device = *device_mapping
            .get(entry.device_index)
            .ok_or(MappingError::BadDeviceIndex(entry.device_index))?;
        mapping.buses.push(Bus {
            name: entry.name,
            device,
            source_channel: [entry.source_channel_left, entry.source_channel_right],
        });
    }
    Ok(mapping)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alsa_info(name: &str, info: &str, channels: usize, address: &str) -> DeviceInfo {
        DeviceInfo {
            display_name: format!("{name} ({info})"),
            num_channels: channels,
            alsa_name: name.to_string(),
            alsa_info: info.to_string(),
            alsa_address: address.to_string(),
        }
    }

    fn snapshot() -> BTreeMap<DeviceSpec, DeviceInfo> {
        let mut devices = BTreeMap::new();
        devices.insert(
            DeviceSpec::CaptureCard(0),
            DeviceInfo {
                display_name: "HDMI input".to_string(),
                num_channels: 8,
                ..DeviceInfo::default()
            },
        );
        devices.insert(
            DeviceSpec::AlsaInput(0),
            alsa_info("USB Mic", "USB Audio", 2, "hw:1,0"),
        );
        devices
    }

    fn mapping() -> InputMapping {
        InputMapping {
            buses: vec![
                Bus {
                    name: "Main".to_string(),
                    device: DeviceSpec::CaptureCard(0),
                    source_channel: [0, 1],
                },
                Bus {
                    name: "Vox".to_string(),
                    device: DeviceSpec::AlsaInput(0),
                    source_channel: [0, -1],
                },
            ],
        }
    }

    fn temp_path(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("livemix-mapping-test-{name}-{}", std::process::id()));
        path
    }

    #[test]
    fn round_trip_preserves_mapping() {
        let devices = snapshot();
        let original = mapping();
        let path = temp_path("roundtrip");
        save_input_mapping(&devices, &original, &path).unwrap();
        let loaded = load_input_mapping(&devices, &path, |_, _, _| {
            panic!("no dead card should be needed")
        })
        .unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn relaxed_match_survives_address_change() {
        let devices = snapshot();
        let original = mapping();
        let path = temp_path("readdress");
        save_input_mapping(&devices, &original, &path).unwrap();

        // The same card reappears at a different address.
        let mut new_devices = snapshot();
        new_devices.insert(
            DeviceSpec::AlsaInput(0),
            alsa_info("USB Mic", "USB Audio", 2, "hw:2,0"),
        );
        let loaded = load_input_mapping(&new_devices, &path, |_, _, _| {
            panic!("no dead card should be needed")
        })
        .unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn missing_device_becomes_dead_card() {
        let devices = snapshot();
        let original = mapping();
        let path = temp_path("missing");
        save_input_mapping(&devices, &original, &path).unwrap();

        let mut reduced = snapshot();
        reduced.remove(&DeviceSpec::AlsaInput(0));
        let mut created = Vec::new();
        let loaded = load_input_mapping(&reduced, &path, |name, info, channels| {
            created.push((name.to_string(), info.to_string(), channels));
            DeviceSpec::AlsaInput(5)
        })
        .unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(created, vec![("USB Mic".to_string(), "USB Audio".to_string(), 2)]);
        assert_eq!(loaded.buses[1].device, DeviceSpec::AlsaInput(5));
        assert_eq!(loaded.buses[1].source_channel, [0, -1]);
        // The bus list structure itself is unchanged.
        assert_eq!(loaded.buses.len(), original.buses.len());
        assert_eq!(loaded.buses[0], original.buses[0]);
    }

    #[test]
    fn bad_device_index_is_rejected() {
        let path = temp_path("bad-index");
        std::fs::write(
            &path,
            r#"{"devices": [], "buses": [{"name": "X", "device_index": 3,
                "source_channel_left": 0, "source_channel_right": 1}]}"#,
        )
        .unwrap();
        let result = load_input_mapping(&snapshot(), &path, |_, _, _| DeviceSpec::Silence);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(MappingError::BadDeviceIndex(3))));
    }
}
