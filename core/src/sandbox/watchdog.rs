//! Wall-clock watchdog.
//!
//! CPU rlimits do not bound time spent sleeping or blocked, so each child gets a thread
//! that kills its process group once the wall budget runs out. The kill happens at most
//! once. The caller disarms the watchdog before reaping the child, so the signal can
//! only ever reach the child or its zombie, never a recycled pid.

use std::{
    io,
    sync::mpsc::{self, RecvTimeoutError, Sender},
    thread::{self, JoinHandle},
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::signal::{killpg, Signal},
    unistd::Pid,
};

pub(crate) struct Watchdog {
    disarm: Option<Sender<()>>,
    handle: Option<JoinHandle<bool>>,
}

impl Watchdog {
    pub fn arm(pid: Pid, budget: Duration) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name(format!("watchdog-{}", pid))
            .spawn(move || match rx.recv_timeout(budget) {
                Err(RecvTimeoutError::Timeout) => {
                    kill_group(pid);
                    true
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
            })?;
        Ok(Self {
            disarm: Some(tx),
            handle: Some(handle),
        })
    }

    /// Stops the timer and reports whether it already fired.
    pub fn disarm(mut self) -> bool {
        self.stop()
    }

    fn stop(&mut self) -> bool {
        if let Some(tx) = self.disarm.take() {
            let _ = tx.send(());
        }
        match self.handle.take() {
            Some(h) => h.join().unwrap_or(false),
            None => false,
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

fn kill_group(pid: Pid) {
    match killpg(pid, Signal::SIGKILL) {
        Ok(()) => log::info!("Watchdog killed process group {}", pid),
        // Already gone.
        Err(Errno::ESRCH) => (),
        Err(e) => log::warn!("Watchdog failed to kill process group {}: {}", pid, e),
    }
}
