//! ALSA capture: a pool of hot-pluggable devices and per-device capture
//! threads.
//!
//! The pool owns the universe of ALSA capture devices: it enumerates them at
//! startup, watches the device directory for hotplug, keeps slot numbers
//! stable across replugs, and mediates the mixer's "hold" semantics. Each
//! open device gets its own capture thread which delivers raw PCM buffers to
//! the mixer through the [`CaptureSink`] trait.

mod hotplug;
mod input;
mod pool;
mod quit;

pub use pool::{AlsaCard, AlsaPool, CaptureSink, CardState};
