//! Fast cooperative shutdown for threads that sleep.
//!
//! A thread checks [`QuitFlag::should_quit`] in its loop and sleeps through
//! [`QuitFlag::sleep_for`]; requesting quit aborts such a sleep immediately.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A quit flag paired with a condition variable, so sleeps are interruptible.
/// All operations are thread-safe.
#[derive(Debug, Default)]
pub(crate) struct QuitFlag {
    should_quit: Mutex<bool>,
    cond: Condvar,
}

impl QuitFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request termination and wake all sleepers.
    pub fn quit(&self) {
        *self.should_quit.lock() = true;
        self.cond.notify_all();
    }

    /// Re-arm the flag, e.g. before restarting a stopped thread.
    pub fn unquit(&self) {
        *self.should_quit.lock() = false;
    }

    pub fn should_quit(&self) -> bool {
        *self.should_quit.lock()
    }

    /// Sleep for `duration`, or less if quit is requested. Returns false if
    /// the sleep was aborted by a quit request.
    pub fn sleep_for(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut quit = self.should_quit.lock();
        while !*quit {
            if self.cond.wait_until(&mut quit, deadline).timed_out() {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn sleep_completes_without_quit() {
        let flag = QuitFlag::new();
        assert!(flag.sleep_for(Duration::from_millis(1)));
        assert!(!flag.should_quit());
    }

    #[test]
    fn quit_aborts_sleep_promptly() {
        let flag = Arc::new(QuitFlag::new());
        let sleeper = {
            let flag = Arc::clone(&flag);
            std::thread::spawn(move || {
                let start = Instant::now();
                let completed = flag.sleep_for(Duration::from_secs(30));
                (completed, start.elapsed())
            })
        };
        std::thread::sleep(Duration::from_millis(10));
        flag.quit();
        let (completed, elapsed) = sleeper.join().unwrap();
        assert!(!completed);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn unquit_rearms() {
        let flag = QuitFlag::new();
        flag.quit();
        assert!(flag.should_quit());
        flag.unquit();
        assert!(!flag.should_quit());
    }
}
