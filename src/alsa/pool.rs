//! The collective of all ALSA capture devices in the system: enumeration,
//! hotplug, the per-slot state machine, and hold semantics.

use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use alsa::pcm::{HwParams, PCM};
use alsa::Direction;
use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};

use super::hotplug;
use super::input::{AlsaInput, AudioCallback};
use super::quit::QuitFlag;
use crate::device::{AudioFormat, DeviceSpec};
use crate::settings::{OUTPUT_FREQUENCY, PROBE_RETRIES};

/// Lifecycle state of a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    /// There is no card here. (There probably used to be one, but it got
    /// removed.) A card is only inserted once it has actually been probed,
    /// i.e. we know whether it can be captured from at all, and what its
    /// name is.
    Empty,
    /// The card is ready for capture, as far as we know. (It could still be
    /// in use by someone else; we will not know until we try to open it.)
    Ready,
    /// We are trying to start capture from this card, but are not streaming
    /// yet. This can in theory go on forever, e.g. if the card is held open
    /// by some other process.
    Starting,
    /// The card is capturing and delivering data. On a fatal error it goes
    /// back to `Starting`, or to `Dead`, depending on the error.
    Running,
    /// The card is gone (e.g. unplugged), but a bus still references it, so
    /// the entry must stay. If a card that looks the same is plugged back
    /// in, it is installed in this slot and the state leaves `Dead`.
    Dead,
}

/// One slot in the device registry.
#[derive(Debug, Clone)]
pub struct AlsaCard {
    /// Lifecycle state; see [`CardState`].
    pub state: CardState,
    /// Bus address, e.g. `hw:0,0`. Empty for a dead placeholder that has
    /// never been seen.
    pub address: String,
    /// Card name, as the driver reports it.
    pub name: String,
    /// PCM info string for the capture stream.
    pub info: String,
    /// Number of capture channels.
    pub num_channels: usize,
    /// Whether the mixer has an interest in this slot: it is part of a bus
    /// mapping, or it is being shown in an enumeration. A held slot never
    /// disappears; it goes to `Dead` instead.
    pub held: bool,
}

impl AlsaCard {
    fn empty() -> Self {
        Self {
            state: CardState::Empty,
            address: String::new(),
            name: String::new(),
            info: String::new(),
            num_channels: 0,
            held: false,
        }
    }

    /// The name shown to users: `"{name} ({info})"`.
    pub fn display_name(&self) -> String {
        format!("{} ({})", self.name, self.info)
    }
}

/// The mixer-facing side of the pool: where captured audio and device state
/// changes are delivered.
pub trait CaptureSink: Send + Sync {
    /// Deliver one captured buffer. Returns false if the receiver was
    /// contended and the buffer must be redelivered.
    fn add_audio(
        &self,
        spec: DeviceSpec,
        data: &[u8],
        num_samples: usize,
        format: AudioFormat,
        frame_length: i64,
        frame_time: Instant,
    ) -> bool;
    /// Put the device in or out of silence mode. Returns false if the
    /// receiver was contended and the call must be retried.
    fn silence_card(&self, spec: DeviceSpec, silence: bool) -> bool;
    /// Update the device's display name.
    fn set_display_name(&self, spec: DeviceSpec, name: &str);
    /// Some observable device state changed; refresh UIs.
    fn state_changed(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeResult {
    Success,
    /// Transient failure (device busy or not up yet); worth retrying.
    Defer,
    /// Permanent failure for this address.
    Failure,
}

#[derive(Default)]
struct Registry {
    devices: Vec<AlsaCard>,
    // 1:1 with `devices`; Some iff a capture thread is wanted for the slot.
    inputs: Vec<Option<AlsaInput>>,
}

pub(crate) struct PoolShared {
    weak_self: Weak<PoolShared>,
    registry: Mutex<Registry>,
    // Retries left, keyed on device address. An entry here means a retry
    // thread for that address is already running. Kept separate from the
    // registry mutex so the two never nest.
    retry: Mutex<HashMap<String, u32>>,
    sink: RwLock<Option<Weak<dyn CaptureSink>>>,
    quit: QuitFlag,
    retry_threads: AtomicUsize,
}

// Pure parser for /proc/asound/cards; returns the long card name.
fn parse_cards_file(content: &str, card: u32) -> Option<String> {
    for line in content.lines() {
        let trimmed = line.trim_start();
        let Some((number, rest)) = trimmed.split_once(' ') else {
            continue;
        };
        if number.parse::<u32>() != Ok(card) {
            continue;
        }
        if let Some(pos) = rest.find(" - ") {
            return Some(rest[pos + 3..].trim().to_string());
        }
        if let Some(pos) = rest.find("]:") {
            return Some(rest[pos + 2..].trim().to_string());
        }
    }
    None
}

// Pure parser for /proc/asound/cardN/pcmMc/info; returns the PCM name.
fn parse_pcm_info(content: &str) -> Option<String> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("name: "))
        .map(|name| name.trim().to_string())
}

fn card_name_from_proc(card: u32) -> Option<String> {
    parse_cards_file(&fs::read_to_string("/proc/asound/cards").ok()?, card)
}

fn pcm_info_from_proc(card: u32, device: u32) -> Option<String> {
    let path = format!("/proc/asound/card{card}/pcm{device}c/info");
    parse_pcm_info(&fs::read_to_string(path).ok()?)
}

impl PoolShared {
    fn sink(&self) -> Option<Arc<dyn CaptureSink>> {
        self.sink.read().as_ref().and_then(Weak::upgrade)
    }

    fn trigger_state_changed(&self) {
        if let Some(sink) = self.sink() {
            sink.state_changed();
        }
    }

    // Tell the mixer to (un)silence a card, retrying until it accepts. The
    // mixer side uses a timed try-lock, so a rejection only means "busy right
    // now"; we must not drop the notification. A pending quit (ours or the
    // calling capture thread's) aborts the retry so shutdown cannot hang.
    fn notify_silence(&self, spec: DeviceSpec, silence: bool, quit: Option<&QuitFlag>) {
        loop {
            let Some(sink) = self.sink() else {
                return;
            };
            if sink.silence_card(spec, silence) {
                return;
            }
            if self.quit.should_quit() || quit.is_some_and(|q| q.should_quit()) {
                return;
            }
            std::thread::yield_now();
        }
    }

    fn make_audio_callback(&self, index: usize) -> AudioCallback {
        let sink = self.sink.read().clone();
        Box::new(move |data, num_samples, format, frame_length, frame_time| {
            match sink.as_ref().and_then(Weak::upgrade) {
                Some(sink) => sink.add_audio(
                    DeviceSpec::AlsaInput(index),
                    data,
                    num_samples,
                    format,
                    frame_length,
                    frame_time,
                ),
                // No mixer connected; swallow the audio.
                None => true,
            }
        })
    }

    pub(crate) fn set_card_state(&self, index: usize, state: CardState, quit: &QuitFlag) {
        {
            let mut registry = self.registry.lock();
            if index < registry.devices.len() {
                registry.devices[index].state = state;
            }
        }
        let silence = state != CardState::Running;
        self.notify_silence(DeviceSpec::AlsaInput(index), silence, Some(quit));
        self.trigger_state_changed();
    }

    pub(crate) fn get_card_state(&self, index: usize) -> CardState {
        let registry = self.registry.lock();
        registry
            .devices
            .get(index)
            .map_or(CardState::Empty, |device| device.state)
    }

    /// Move the card to `Dead` (if held) or `Empty` (if not), dropping its
    /// capture object and trimming trailing empty slots.
    pub(crate) fn free_card(&self, index: usize, quit: Option<&QuitFlag>) {
        self.notify_silence(DeviceSpec::AlsaInput(index), true, quit);

        let dropped = {
            let mut registry = self.registry.lock();
            let mut dropped = Vec::new();
            if index < registry.devices.len() {
                if registry.devices[index].held {
                    registry.devices[index].state = CardState::Dead;
                } else {
                    registry.devices[index].state = CardState::Empty;
                    if let Some(input) = registry.inputs[index].take() {
                        dropped.push(input);
                    }
                }
                while registry
                    .devices
                    .last()
                    .is_some_and(|device| device.state == CardState::Empty)
                {
                    registry.devices.pop();
                    if let Some(Some(input)) = registry.inputs.pop() {
                        dropped.push(input);
                    }
                }
            }
            dropped
        };
        // Joining capture threads must happen outside the registry lock;
        // they take it to publish state changes.
        drop(dropped);

        self.trigger_state_changed();
    }

    /// If the device is held, (re)start capture; if not, stop it.
    pub(crate) fn reset_device(&self, index: usize) {
        let (old_input, held, address, num_channels) = {
            let mut registry = self.registry.lock();
            if index >= registry.devices.len() {
                return;
            }
            let old_input = registry.inputs[index].take();
            let device = &registry.devices[index];
            (old_input, device.held, device.address.clone(), device.num_channels)
        };
        // Join the old capture thread outside the registry lock.
        drop(old_input);

        if held && !address.is_empty() {
            let mut input = AlsaInput::new(
                &address,
                OUTPUT_FREQUENCY,
                num_channels,
                self.make_audio_callback(index),
                self.weak_self.clone(),
                index,
            );
            input.start_capture_thread();
            let mut registry = self.registry.lock();
            if index < registry.inputs.len() {
                registry.inputs[index] = Some(input);
            }
        }
    }

    pub(crate) fn get_capture_frequency(&self, index: usize) -> u32 {
        let registry = self.registry.lock();
        registry
            .inputs
            .get(index)
            .and_then(|input| input.as_ref())
            .map_or(OUTPUT_FREQUENCY, AlsaInput::sample_rate)
    }

    /// Allocate or reuse a slot for a freshly probed device, and fill in its
    /// identity. Replugged cards are matched back to their held `Dead` slot,
    /// first by full identity including address, then ignoring the address
    /// (devices often come back in a different order). The slot is left in
    /// `Ready` state; `held` survives for reused slots.
    pub(crate) fn install_probed_device(
        &self,
        address: &str,
        name: &str,
        info: &str,
        num_channels: usize,
    ) -> usize {
        let mut registry = self.registry.lock();

        let matches_exact = |device: &AlsaCard| {
            device.state == CardState::Dead
                && device.address == address
                && device.name == name
                && device.info == info
                && device.num_channels == num_channels
        };
        let matches_relaxed = |device: &AlsaCard| {
            device.state == CardState::Dead
                && device.name == name
                && device.info == info
                && device.num_channels == num_channels
        };

        let index = if let Some(i) = registry.devices.iter().position(matches_exact) {
            i
        } else if let Some(i) = registry.devices.iter().position(matches_relaxed) {
            // If we have two identical cards this may get them mixed up, but
            // we have nothing better to go on.
            i
        } else if let Some(i) = registry
            .devices
            .iter()
            .position(|device| device.state == CardState::Empty)
        {
            registry.devices[i].held = false;
            i
        } else {
            registry.devices.push(AlsaCard::empty());
            registry.inputs.push(None);
            registry.devices.len() - 1
        };

        let device = &mut registry.devices[index];
        device.state = CardState::Ready;
        device.address = address.to_string();
        device.name = name.to_string();
        device.info = info.to_string();
        device.num_channels = num_channels;
        // Purposefully does not overwrite `held`.

        index
    }

    fn probe_device_once(&self, card: u32, device: u32) -> ProbeResult {
        let address = format!("hw:{card},{device}");
        let Some(name) = card_name_from_proc(card) else {
            log::debug!("{address}: card name not available yet");
            return ProbeResult::Defer;
        };
        let Some(info) = pcm_info_from_proc(card, device) else {
            log::debug!("{address}: PCM info not available yet");
            return ProbeResult::Defer;
        };

        // Open the device to confirm it can be captured from, and to learn
        // its channel count.
        let num_channels = {
            let pcm = match PCM::new(&address, Direction::Capture, true) {
                Ok(pcm) => pcm,
                Err(err) => {
                    log::debug!("{address}: {err}");
                    return ProbeResult::Defer;
                }
            };
            let channels = match HwParams::any(&pcm).and_then(|hwp| hwp.get_channels_max()) {
                Ok(channels) => channels as usize,
                Err(err) => {
                    log::debug!("{address}: {err}");
                    return ProbeResult::Defer;
                }
            };
            channels
        };
        if num_channels == 0 {
            log::info!("{address}: no capture channels");
            return ProbeResult::Failure;
        }

        let index = self.install_probed_device(&address, &name, &info, num_channels);
        log::info!("{address}: probed successfully");

        // Restarts capture if the slot is held, i.e. we just replaced a dead
        // card that a bus still references.
        self.reset_device(index);

        if let Some(sink) = self.sink() {
            let display_name = {
                let registry = self.registry.lock();
                registry.devices[index].display_name()
            };
            sink.set_display_name(DeviceSpec::AlsaInput(index), &display_name);
            sink.state_changed();
        }
        ProbeResult::Success
    }

    /// Try to add the device at `hw:<card>,<device>`. On transient failure a
    /// background thread keeps trying, up to [`PROBE_RETRIES`] times at 1 Hz;
    /// at most one such thread runs per address.
    pub(crate) fn probe_device_with_retry(&self, card: u32, device: u32) {
        let address = format!("hw:{card},{device}");

        let mut retry = self.retry.lock();
        if let Some(tries) = retry.get_mut(&address) {
            // Some thread is already busy retrying this; just reset its
            // count.
            *tries = PROBE_RETRIES;
            return;
        }

        // Try synchronously first, still holding the retry lock so nobody
        // else starts a thread for this address.
        match self.probe_device_once(card, device) {
            ProbeResult::Success | ProbeResult::Failure => return,
            ProbeResult::Defer => {}
        }

        log::info!("trying {address} again in one second...");
        retry.insert(address, PROBE_RETRIES);
        let Some(shared) = self.weak_self.upgrade() else {
            return;
        };
        self.retry_threads.fetch_add(1, Ordering::SeqCst);
        let spawned = std::thread::Builder::new()
            .name(format!("probe:{card},{device}"))
            .spawn(move || shared.probe_retry_thread(card, device));
        if let Err(err) = spawned {
            log::error!("cannot spawn probe retry thread: {err}");
            self.retry_threads.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn probe_retry_thread(self: Arc<Self>, card: u32, device: u32) {
        let address = format!("hw:{card},{device}");
        loop {
            if !self.quit.sleep_for(Duration::from_secs(1)) {
                self.retry.lock().remove(&address);
                break;
            }

            let mut retry = self.retry.lock();
            let Some(tries) = retry.get_mut(&address) else {
                break;
            };
            if self.quit.should_quit() || *tries == 0 {
                retry.remove(&address);
                log::info!("giving up probe of {address}");
                break;
            }

            // Still holding the retry lock, give it another try.
            match self.probe_device_once(card, device) {
                ProbeResult::Success => {
                    retry.remove(&address);
                    log::info!("probe of {address} succeeded");
                    break;
                }
                ProbeResult::Failure => {
                    retry.remove(&address);
                    log::info!("giving up probe of {address}");
                    break;
                }
                ProbeResult::Defer => {
                    *tries -= 1;
                    if *tries == 0 {
                        retry.remove(&address);
                        log::info!("giving up probe of {address}");
                        break;
                    }
                    log::info!("trying {address} again in one second ({tries} tries left)...");
                }
            }
        }
        self.retry_threads.fetch_sub(1, Ordering::SeqCst);
    }

    /// Free every non-dead slot whose address matches the removed device.
    pub(crate) fn unplug_device(&self, card: u32, device: u32) {
        let address = format!("hw:{card},{device}");
        let indices: Vec<usize> = {
            let registry = self.registry.lock();
            registry
                .devices
                .iter()
                .enumerate()
                .filter(|(_, dev)| {
                    dev.state != CardState::Empty
                        && dev.state != CardState::Dead
                        && dev.address == address
                })
                .map(|(i, _)| i)
                .collect()
        };
        for index in indices {
            self.free_card(index, None);
        }
    }

    /// Append (or slot-reuse) a new entry in `Dead`+held state, so a saved
    /// mapping that references a missing card can still be bound. Returns the
    /// new index.
    pub(crate) fn create_dead_card(&self, name: &str, info: &str, num_channels: usize) -> usize {
        let mut registry = self.registry.lock();
        let index = match registry
            .devices
            .iter()
            .position(|device| device.state == CardState::Empty)
        {
            Some(i) => i,
            None => {
                registry.devices.push(AlsaCard::empty());
                registry.inputs.push(None);
                registry.devices.len() - 1
            }
        };
        let device = &mut registry.devices[index];
        device.state = CardState::Dead;
        device.address = String::new();
        device.name = name.to_string();
        device.info = info.to_string();
        device.num_channels = num_channels;
        device.held = true;
        index
    }

    fn enumerate_devices(&self) {
        let entries = match fs::read_dir(hotplug::SND_DEVICE_DIR) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!(
                    "cannot enumerate {} ({err}); no ALSA devices available",
                    hotplug::SND_DEVICE_DIR
                );
                return;
            }
        };
        let mut nodes: Vec<(u32, u32)> = entries
            .flatten()
            .filter_map(|entry| hotplug::parse_capture_node(&entry.file_name().to_string_lossy()))
            .collect();
        nodes.sort_unstable();
        for (card, device) in nodes {
            self.probe_device_with_retry(card, device);
        }
    }
}

/// The pool of all ALSA capture devices.
pub struct AlsaPool {
    shared: Arc<PoolShared>,
    hotplug_thread: Mutex<Option<JoinHandle<()>>>,
    hotplug_quit: Mutex<Option<Sender<()>>>,
}

impl Default for AlsaPool {
    fn default() -> Self {
        Self::new()
    }
}

impl AlsaPool {
    /// Create an empty, disconnected pool. Call [`AlsaPool::connect`] and
    /// then [`AlsaPool::init`] to bring it up.
    pub fn new() -> Self {
        Self {
            shared: Arc::new_cyclic(|weak_self| PoolShared {
                weak_self: weak_self.clone(),
                registry: Mutex::new(Registry::default()),
                retry: Mutex::new(HashMap::new()),
                sink: RwLock::new(None),
                quit: QuitFlag::new(),
                retry_threads: AtomicUsize::new(0),
            }),
            hotplug_thread: Mutex::new(None),
            hotplug_quit: Mutex::new(None),
        }
    }

    /// Connect the mixer-facing sink. Must happen before [`AlsaPool::init`]
    /// for captured audio to reach anyone.
    pub fn connect(&self, sink: Weak<dyn CaptureSink>) {
        *self.shared.sink.write() = Some(sink);
    }

    /// Start the hotplug watcher and synchronously enumerate devices.
    pub fn init(&self) {
        let (quit_tx, quit_rx) = crossbeam_channel::bounded(1);
        if let Some(handle) = hotplug::spawn_watcher(Arc::downgrade(&self.shared), quit_rx) {
            *self.hotplug_thread.lock() = Some(handle);
            *self.hotplug_quit.lock() = Some(quit_tx);
        }
        self.shared.enumerate_devices();
    }

    /// Snapshot of all current devices. As a side effect every returned
    /// entry is marked held, since the input mapping UI needs stability while
    /// the user chooses; when done, release the devices you do not want by
    /// installing a mapping (or calling [`AlsaPool::release_device`]).
    pub fn get_devices(&self) -> Vec<AlsaCard> {
        let mut registry = self.shared.registry.lock();
        for device in &mut registry.devices {
            device.held = true;
        }
        registry.devices.clone()
    }

    /// Mark a slot as held.
    pub fn hold_device(&self, index: usize) {
        let mut registry = self.shared.registry.lock();
        if index < registry.devices.len() {
            registry.devices[index].held = true;
        }
    }

    /// Clear a slot's held flag. An out-of-range index is allowed.
    pub fn release_device(&self, index: usize) {
        let mut registry = self.shared.registry.lock();
        if index < registry.devices.len() {
            registry.devices[index].held = false;
        }
    }

    /// If the device is held, (re)start capture; if not, stop it.
    pub fn reset_device(&self, index: usize) {
        self.shared.reset_device(index);
    }

    /// The achieved capture rate of a slot, or [`OUTPUT_FREQUENCY`] if it has
    /// not been opened.
    pub fn get_capture_frequency(&self, index: usize) -> u32 {
        self.shared.get_capture_frequency(index)
    }

    /// Current state of a slot.
    pub fn get_card_state(&self, index: usize) -> CardState {
        self.shared.get_card_state(index)
    }

    /// See [`PoolShared::create_dead_card`]: a held `Dead` placeholder for a
    /// card that is not present.
    pub fn create_dead_card(&self, name: &str, info: &str, num_channels: usize) -> usize {
        self.shared.create_dead_card(name, info, num_channels)
    }

    /// A stable descriptor of a held slot, for persistence; matching it back
    /// against probed cards is what keeps mappings alive across replugs.
    /// `None` for unheld or out-of-range slots.
    pub fn describe_device(&self, index: usize) -> Option<crate::device::DeviceInfo> {
        let registry = self.shared.registry.lock();
        let device = registry.devices.get(index)?;
        if !device.held {
            return None;
        }
        Some(crate::device::DeviceInfo {
            display_name: device.display_name(),
            num_channels: device.num_channels,
            alsa_name: device.name.clone(),
            alsa_info: device.info.clone(),
            alsa_address: device.address.clone(),
        })
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<PoolShared> {
        &self.shared
    }
}

impl Drop for AlsaPool {
    fn drop(&mut self) {
        // Stop all capture threads first, outside the registry lock.
        let inputs: Vec<AlsaInput> = {
            let mut registry = self.shared.registry.lock();
            let slots = registry.inputs.len();
            (0..slots)
                .filter_map(|i| registry.inputs[i].take())
                .collect()
        };
        drop(inputs);

        self.shared.quit.quit();
        if let Some(quit_tx) = self.hotplug_quit.lock().take() {
            let _ = quit_tx.send(());
        }
        if let Some(handle) = self.hotplug_thread.lock().take() {
            let _ = handle.join();
        }
        while self.shared.retry_threads.load(Ordering::SeqCst) > 0 {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_card_is_reused_on_exact_replug() {
        let pool = AlsaPool::new();
        let shared = pool.shared();
        let index = shared.create_dead_card("USB Mic", "USB Audio", 2);
        assert_eq!(index, 0);
        assert_eq!(shared.get_card_state(0), CardState::Dead);

        let reused = shared.install_probed_device("hw:1,0", "USB Mic", "USB Audio", 2);
        assert_eq!(reused, 0);
        assert_eq!(shared.get_card_state(0), CardState::Ready);
        let devices = pool.get_devices();
        assert!(devices[0].held);
        assert_eq!(devices[0].address, "hw:1,0");
    }

    #[test]
    fn dead_card_is_reused_when_address_differs() {
        let pool = AlsaPool::new();
        let shared = pool.shared();
        // The card was last seen at hw:1,0...
        let index = shared.install_probed_device("hw:1,0", "USB Mic", "USB Audio", 2);
        pool.hold_device(index);
        shared.free_card(index, None);
        assert_eq!(shared.get_card_state(index), CardState::Dead);

        // ...and comes back at hw:2,0 with the same identity.
        let reused = shared.install_probed_device("hw:2,0", "USB Mic", "USB Audio", 2);
        assert_eq!(reused, index);
        assert_eq!(shared.get_card_state(index), CardState::Ready);
        assert_eq!(pool.get_devices()[index].address, "hw:2,0");
    }

    #[test]
    fn different_identity_gets_a_new_slot() {
        let pool = AlsaPool::new();
        let shared = pool.shared();
        let first = shared.install_probed_device("hw:1,0", "USB Mic", "USB Audio", 2);
        pool.hold_device(first);
        shared.free_card(first, None);

        let second = shared.install_probed_device("hw:1,0", "Other Mic", "USB Audio", 2);
        assert_ne!(second, first);
        assert_eq!(shared.get_card_state(first), CardState::Dead);
        assert_eq!(shared.get_card_state(second), CardState::Ready);
    }

    #[test]
    fn unheld_card_vanishes_and_registry_is_trimmed() {
        let pool = AlsaPool::new();
        let shared = pool.shared();
        let index = shared.install_probed_device("hw:0,0", "Internal", "Analog", 2);
        assert!(!pool.get_devices().is_empty());
        pool.release_device(index);
        shared.free_card(index, None);
        assert!(pool.get_devices().is_empty());
    }

    #[test]
    fn unplug_frees_by_address() {
        let pool = AlsaPool::new();
        let shared = pool.shared();
        let a = shared.install_probed_device("hw:0,0", "Internal", "Analog", 2);
        let b = shared.install_probed_device("hw:1,0", "USB Mic", "USB Audio", 2);
        pool.hold_device(a);
        pool.hold_device(b);
        shared.unplug_device(1, 0);
        assert_eq!(shared.get_card_state(a), CardState::Ready);
        assert_eq!(shared.get_card_state(b), CardState::Dead);
    }

    #[test]
    fn describe_device_requires_held() {
        let pool = AlsaPool::new();
        let shared = pool.shared();
        let index = shared.install_probed_device("hw:1,0", "USB Mic", "USB Audio", 2);
        assert!(pool.describe_device(index).is_none());
        pool.hold_device(index);
        let info = pool.describe_device(index).unwrap();
        assert_eq!(info.alsa_address, "hw:1,0");
        assert_eq!(info.display_name, "USB Mic (USB Audio)");
    }

    #[test]
    fn get_devices_marks_held() {
        let pool = AlsaPool::new();
        let shared = pool.shared();
        shared.install_probed_device("hw:0,0", "Internal", "Analog", 2);
        assert!(pool.get_devices().iter().all(|device| device.held));
    }

    #[test]
    fn cards_file_parsing() {
        let content = concat!(
            " 0 [PCH            ]: HDA-Intel - HDA Intel PCH\n",
            "                      HDA Intel PCH at 0xa1000000 irq 145\n",
            " 1 [C20            ]: USB-Audio - Cambridge Audio USB 2.0\n",
            "                      Cambridge Audio at usb-0000:00:14.0-2\n",
        );
        assert_eq!(
            parse_cards_file(content, 0),
            Some("HDA Intel PCH".to_string())
        );
        assert_eq!(
            parse_cards_file(content, 1),
            Some("Cambridge Audio USB 2.0".to_string())
        );
        assert_eq!(parse_cards_file(content, 7), None);
    }

    #[test]
    fn pcm_info_parsing() {
        let content = "card: 1\ndevice: 0\nsubdevice: 0\nstream: CAPTURE\nid: USB Audio\n\
                       name: USB Audio #1\nsubname: subdevice #0\n";
        assert_eq!(parse_pcm_info(content), Some("USB Audio #1".to_string()));
        assert_eq!(parse_pcm_info("id: X\n"), None);
    }
}
