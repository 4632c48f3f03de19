//! Single-device ALSA capture thread.
//!
//! Note: "frame" here generally refers to the ALSA definition of frame,
//! which is one sample per channel. The exception is `frame_length`, which is
//! the [`TIMEBASE`] duration of the delivered buffer as a whole, since that
//! is what the mixer's `add_audio` wants.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};

use super::pool::{CardState, PoolShared};
use super::quit::QuitFlag;
use crate::device::AudioFormat;
use crate::settings::TIMEBASE;

/// Delivers one captured buffer. Arguments: raw little-endian PCM bytes, the
/// frame count, the buffer's wire format, its length in [`TIMEBASE`] units,
/// and the monotonic receive time. Returning false means "try again" (the
/// receiver was contended); the same buffer is then redelivered. This is
/// back-pressure, never a drop.
pub(crate) type AudioCallback =
    Box<dyn Fn(&[u8], usize, AudioFormat, i64, Instant) -> bool + Send + Sync>;

enum CaptureEndReason {
    RequestedQuit,
    DeviceGone,
    OtherError,
}

struct CaptureCtx {
    address: String,
    num_channels: usize,
    requested_rate: u32,
    actual_rate: AtomicU32,
    callback: AudioCallback,
    should_quit: QuitFlag,
    pool: Weak<PoolShared>,
    index: usize,
}

impl CaptureCtx {
    fn set_state(&self, state: CardState) {
        if let Some(pool) = self.pool.upgrade() {
            pool.set_card_state(self.index, state, &self.should_quit);
        }
    }
}

struct OpenDevice {
    pcm: PCM,
    format: AudioFormat,
    bytes_per_frame: usize,
    buffer: Vec<u8>,
}

fn open_device(ctx: &CaptureCtx) -> Result<OpenDevice, alsa::Error> {
    let pcm = PCM::new(&ctx.address, Direction::Capture, true)?;
    {
        let hwp = HwParams::any(&pcm)?;
        hwp.set_access(Access::RWInterleaved)?;
        // 16-, 24- (packed) or 32-bit little-endian signed; take the widest
        // format the hardware accepts.
        if hwp.set_format(Format::S32LE).is_err() && hwp.set_format(Format::S243LE).is_err() {
            hwp.set_format(Format::S16LE)?;
        }
        // The rate is a request; the card picks the nearest one it can do,
        // and the achieved rate is reported to the callback.
        hwp.set_rate(ctx.requested_rate, ValueOr::Nearest)?;
        hwp.set_channels(ctx.num_channels as u32)?;
        // A period of 64 frames is about 1.3 ms at 48 kHz; with a ~4096-frame
        // buffer that is ~85 ms of slack. More than that, and our jitter is
        // probably so high that the resampling queue cannot keep up anyway.
        hwp.set_periods(16, ValueOr::Nearest)?;
        hwp.set_period_size_near(64, ValueOr::Nearest)?;
        hwp.set_buffer_size_near(4096)?;
        pcm.hw_params(&hwp)?;
    }

    let hwp = pcm.hw_params_current()?;
    let bits_per_sample: u32 = match hwp.get_format()? {
        Format::S16LE => 16,
        Format::S243LE => 24,
        Format::S32LE => 32,
        other => unreachable!("device chose format {other:?} outside the offered mask"),
    };
    let sample_rate = hwp.get_rate()?;
    let buffer_frames = hwp.get_buffer_size()? as usize;
    drop(hwp);
    log::info!(
        "[{}] opened: {} Hz, {} channels, {} bits, buffer of {} frames",
        ctx.address,
        sample_rate,
        ctx.num_channels,
        bits_per_sample,
        buffer_frames
    );

    {
        let swp = pcm.sw_params_current()?;
        swp.set_start_threshold((buffer_frames / 2) as alsa::pcm::Frames)?;
        pcm.sw_params(&swp)?;
    }
    pcm.prepare()?;

    ctx.actual_rate.store(sample_rate, Ordering::SeqCst);
    let bytes_per_frame = ctx.num_channels * bits_per_sample as usize / 8;
    Ok(OpenDevice {
        pcm,
        format: AudioFormat {
            bits_per_sample,
            num_channels: ctx.num_channels,
            sample_rate,
        },
        bytes_per_frame,
        buffer: vec![0; buffer_frames * bytes_per_frame],
    })
}

fn frames_to_pts(frames: u64, sample_rate: u32) -> i64 {
    (frames * TIMEBASE as u64 / u64::from(sample_rate)) as i64
}

fn end_reason(ctx: &CaptureCtx, what: &str, err: alsa::Error) -> CaptureEndReason {
    log::warn!("[{}] {what}: {err}", ctx.address);
    if err.errno() == libc::ENODEV {
        CaptureEndReason::DeviceGone
    } else {
        CaptureEndReason::OtherError
    }
}

fn recover_overrun(ctx: &CaptureCtx, pcm: &PCM) {
    log::warn!("[{}] ALSA overrun", ctx.address);
    if let Err(err) = pcm.prepare() {
        log::warn!("[{}] snd_pcm_prepare: {err}", ctx.address);
    }
    if let Err(err) = pcm.start() {
        log::warn!("[{}] snd_pcm_start: {err}", ctx.address);
    }
}

fn do_capture(ctx: &CaptureCtx, device: &mut OpenDevice) -> CaptureEndReason {
    ctx.set_state(CardState::Starting);
    if let Err(err) = device.pcm.start() {
        return end_reason(ctx, "snd_pcm_start", err);
    }
    ctx.set_state(CardState::Running);

    let mut frames_delivered: u64 = 0;
    while !ctx.should_quit.should_quit() {
        match device.pcm.wait(Some(100)) {
            Ok(false) => continue, // Timeout.
            Ok(true) => {}
            Err(err) if err.errno() == libc::EPIPE => {
                recover_overrun(ctx, &device.pcm);
                continue;
            }
            Err(err) => return end_reason(ctx, "snd_pcm_wait", err),
        }

        let frames = {
            let io = device.pcm.io_bytes();
            match io.readi(&mut device.buffer) {
                Ok(0) => {
                    log::warn!("[{}] snd_pcm_readi returned 0", ctx.address);
                    continue;
                }
                Ok(frames) => frames,
                Err(err) if err.errno() == libc::EPIPE => {
                    recover_overrun(ctx, &device.pcm);
                    continue;
                }
                Err(err) if err.errno() == libc::EAGAIN => continue,
                Err(err) => return end_reason(ctx, "snd_pcm_readi", err),
            }
        };

        let rate = ctx.actual_rate.load(Ordering::SeqCst);
        let prev_pts = frames_to_pts(frames_delivered, rate);
        let pts = frames_to_pts(frames_delivered + frames as u64, rate);
        let now = Instant::now();
        loop {
            if ctx.should_quit.should_quit() {
                return CaptureEndReason::RequestedQuit;
            }
            let delivered = (ctx.callback)(
                &device.buffer[..frames * device.bytes_per_frame],
                frames,
                device.format,
                pts - prev_pts,
                now,
            );
            if delivered {
                break;
            }
        }
        frames_delivered += frames as u64;
    }
    CaptureEndReason::RequestedQuit
}

fn capture_thread_func(ctx: Arc<CaptureCtx>) {
    ctx.set_state(CardState::Starting);

    // Open the device, retrying once per second until it comes up.
    let mut device = None;
    while !ctx.should_quit.should_quit() && device.is_none() {
        match open_device(&ctx) {
            Ok(opened) => device = Some(opened),
            Err(err) => {
                log::warn!(
                    "[{}] open failed ({err}); waiting one second and trying again...",
                    ctx.address
                );
                ctx.should_quit.sleep_for(Duration::from_secs(1));
            }
        }
    }
    let Some(mut device) = device else {
        return;
    };

    loop {
        match do_capture(&ctx, &mut device) {
            CaptureEndReason::RequestedQuit => return,
            CaptureEndReason::DeviceGone => {
                if let Some(pool) = ctx.pool.upgrade() {
                    pool.free_card(ctx.index, Some(&ctx.should_quit));
                }
                return;
            }
            CaptureEndReason::OtherError => {
                ctx.set_state(CardState::Starting);
                log::warn!(
                    "[{}] sleeping one second and restarting capture...",
                    ctx.address
                );
                ctx.should_quit.sleep_for(Duration::from_secs(1));
                if ctx.should_quit.should_quit() {
                    return;
                }
            }
        }
    }
}

/// One ALSA capture device with its worker thread.
pub(crate) struct AlsaInput {
    ctx: Arc<CaptureCtx>,
    thread: Option<JoinHandle<()>>,
}

impl AlsaInput {
    pub fn new(
        address: &str,
        sample_rate: u32,
        num_channels: usize,
        callback: AudioCallback,
        pool: Weak<PoolShared>,
        index: usize,
    ) -> Self {
        Self {
            ctx: Arc::new(CaptureCtx {
                address: address.to_string(),
                num_channels,
                requested_rate: sample_rate,
                actual_rate: AtomicU32::new(sample_rate),
                callback,
                should_quit: QuitFlag::new(),
                pool,
                index,
            }),
            thread: None,
        }
    }

    pub fn start_capture_thread(&mut self) {
        self.ctx.should_quit.unquit();
        let ctx = Arc::clone(&self.ctx);
        let name = format!("alsa:{}", ctx.address);
        match std::thread::Builder::new()
            .name(name)
            .spawn(move || capture_thread_func(ctx))
        {
            Ok(handle) => self.thread = Some(handle),
            Err(err) => log::error!("[{}] cannot spawn capture thread: {err}", self.ctx.address),
        }
    }

    pub fn stop_capture_thread(&mut self) {
        self.ctx.should_quit.quit();
        if let Some(handle) = self.thread.take() {
            // Joining from inside the capture thread itself would deadlock.
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            let _ = handle.join();
        }
    }

    /// The achieved sample rate; the requested one until the device has been
    /// opened.
    pub fn sample_rate(&self) -> u32 {
        self.ctx.actual_rate.load(Ordering::SeqCst)
    }
}

impl Drop for AlsaInput {
    fn drop(&mut self) {
        self.stop_capture_thread();
    }
}
