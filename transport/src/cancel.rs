use crate::Result;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

struct Inner {
    cancelled: AtomicBool,
    eventfd: EventFd,
}

/// Shared stop signal. Cancelling sets a flag and makes the token's eventfd
/// readable, so threads parked in `epoll_wait` on it wake up. The eventfd is
/// never drained and stays readable once cancelled.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Result<Self> {
        let eventfd =
            EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;
        Ok(CancellationToken {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                eventfd,
            }),
        })
    }

    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("cancellation requested");
        if let Err(e) = self.inner.eventfd.write(1) {
            warn!(error = %e, "failed to signal cancellation eventfd");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.inner.eventfd.as_fd()
    }

    /// Sleeps for up to `timeout`, returning early with `true` if the token
    /// is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_cancelled() {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            let millis = remaining.as_millis().clamp(1, u16::MAX as u128) as u16;
            let mut fds = [PollFd::new(self.fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(millis)) {
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
