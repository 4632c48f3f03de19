//! Hotplug of ALSA capture devices.
//!
//! The kernel exposes PCM devices as `/dev/snd/pcmC<card>D<dev>[cp]`; we
//! watch that directory for created and removed capture nodes (`c` suffix)
//! and tell the pool to probe or unplug accordingly. The watcher thread also
//! listens on a quit channel so shutdown is prompt.

use std::path::Path;
use std::sync::Weak;
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode, Watcher};

use super::pool::PoolShared;

pub(crate) const SND_DEVICE_DIR: &str = "/dev/snd";

/// Parse a device-directory entry name like `pcmC1D0c` into (card, device).
/// Playback nodes (`p` suffix) and everything else yield `None`.
pub(crate) fn parse_capture_node(name: &str) -> Option<(u32, u32)> {
    let rest = name.strip_prefix("pcmC")?;
    let (card, rest) = rest.split_once('D')?;
    let device = rest.strip_suffix('c')?;
    Some((card.parse().ok()?, device.parse().ok()?))
}

fn handle_event(pool: &Weak<PoolShared>, event: &notify::Event) {
    let Some(pool) = pool.upgrade() else {
        return;
    };
    let removed = matches!(
        event.kind,
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From))
    );
    let created = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To))
    );
    let ambiguous = matches!(
        event.kind,
        EventKind::Modify(ModifyKind::Name(
            RenameMode::Any | RenameMode::Both | RenameMode::Other
        ))
    );

    for path in &event.paths {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some((card, device)) = parse_capture_node(name) else {
            continue;
        };
        if removed || (ambiguous && !path.exists()) {
            log::info!("capture device removed: card {card}, device {device}");
            pool.unplug_device(card, device);
        }
        if created || (ambiguous && path.exists()) {
            log::info!("capture device added: card {card}, device {device}");
            pool.probe_device_with_retry(card, device);
        }
    }
}

/// Start watching the device directory. Returns `None` (with hotplug
/// disabled) if the watcher cannot be set up, e.g. in containers without
/// `/dev/snd`.
pub(crate) fn spawn_watcher(
    pool: Weak<PoolShared>,
    quit: Receiver<()>,
) -> Option<JoinHandle<()>> {
    let (events_tx, events_rx) = crossbeam_channel::unbounded();
    let mut watcher = match notify::recommended_watcher(move |result| {
        let _ = events_tx.send(result);
    }) {
        Ok(watcher) => watcher,
        Err(err) => {
            log::warn!("cannot create filesystem watcher ({err}); no ALSA hotplug available");
            return None;
        }
    };
    if let Err(err) = watcher.watch(Path::new(SND_DEVICE_DIR), RecursiveMode::NonRecursive) {
        log::warn!("cannot watch {SND_DEVICE_DIR} ({err}); no ALSA hotplug available");
        return None;
    }

    std::thread::Builder::new()
        .name("alsa-hotplug".to_string())
        .spawn(move || {
            // Keep the watcher alive for the lifetime of the loop.
            let _watcher = watcher;
            loop {
                crossbeam_channel::select! {
                    recv(quit) -> _ => break,
                    recv(events_rx) -> message => match message {
                        Err(_) => break,
                        Ok(Err(err)) => log::warn!("hotplug watcher error: {err}"),
                        Ok(Ok(event)) => handle_event(&pool, &event),
                    }
                }
            }
        })
        .map_err(|err| log::warn!("cannot spawn hotplug thread: {err}"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_capture_nodes() {
        assert_eq!(parse_capture_node("pcmC0D0c"), Some((0, 0)));
        assert_eq!(parse_capture_node("pcmC12D3c"), Some((12, 3)));
    }

    #[test]
    fn rejects_everything_else() {
        assert_eq!(parse_capture_node("pcmC0D0p"), None); // Playback.
        assert_eq!(parse_capture_node("controlC0"), None);
        assert_eq!(parse_capture_node("timer"), None);
        assert_eq!(parse_capture_node("pcmC0Dxc"), None);
        assert_eq!(parse_capture_node(""), None);
    }
}
