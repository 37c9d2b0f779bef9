//! Per-operation cancellation state.
//!
//! Every long-running operation receives an [`OpContext`]: a cancellation token
//! checked cooperatively at each network buffer and archive entry, and a slot
//! holding the process group of the sandboxed command currently running on the
//! operation's behalf, so a cancel can terminate it forcibly.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `Err(Error::Cancelled)` once the token has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// The process group of the sandboxed command in flight, if any.
#[derive(Debug, Clone, Default)]
pub struct ProcessSlot {
    pgid: Arc<Mutex<Option<u32>>>,
}

impl ProcessSlot {
    pub fn set(&self, pgid: u32) {
        *self.pgid.lock() = Some(pgid);
    }

    pub fn clear(&self) {
        *self.pgid.lock() = None;
    }

    pub fn current(&self) -> Option<u32> {
        *self.pgid.lock()
    }

    /// SIGKILL the whole process group. Returns whether a process was registered.
    pub fn kill(&self) -> bool {
        match *self.pgid.lock() {
            Some(pgid) => {
                kill_group(pgid);
                true
            }
            None => false,
        }
    }
}

pub(crate) fn kill_group(pgid: u32) {
    let Ok(pgid) = i32::try_from(pgid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions; a negative pid
    // addresses the process group created for the sandboxed command.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        tracing::debug!(pgid, error = %std::io::Error::last_os_error(), "process group already gone");
    } else {
        tracing::info!(pgid, "killed sandboxed process group");
    }
}

#[derive(Debug, Clone, Default)]
pub struct OpContext {
    pub cancel: CancelToken,
    pub process: ProcessSlot,
}

impl OpContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check(&self) -> Result<()> {
        self.cancel.check()
    }

    /// Fire the token and terminate the running process, if any.
    pub fn abort(&self) {
        self.cancel.cancel();
        self.process.kill();
    }
}
