//! Cooperative event loop.
//!
//! A single-threaded poll(2) loop with two kinds of registrations:
//! - fd sources, fired when the descriptor becomes readable (fence fds,
//!   the Wayland display fd, the listening socket)
//! - timers, fired when their deadline passes (per-output finish-frame
//!   pacing)
//!
//! Callbacks receive only the shared data value, never the loop itself.
//! A fired fd callback decides its own fate by returning [`PollAction`];
//! a fired timer rearms itself by returning the next delay. This keeps
//! the loop free of reentrant registration while still letting one-shot
//! sources (a fence wait) tear themselves down exactly once.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

/// What to do with an fd source after its callback ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollAction {
    /// Keep the registration armed.
    Keep,
    /// Drop the registration; the callback closure (and any fd it owns)
    /// is released.
    Remove,
}

/// Handle to a registered fd source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceId(u64);

/// Handle to a registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u64);

type FdCallback<D> = Box<dyn FnMut(&mut D) -> PollAction>;
type TimerCallback<D> = Box<dyn FnMut(&mut D) -> Option<Duration>>;

struct FdSource<D> {
    id: SourceId,
    fd: RawFd,
    callback: FdCallback<D>,
}

struct Timer<D> {
    id: TimerId,
    deadline: Instant,
    callback: TimerCallback<D>,
}

/// Poll-based event loop, generic over the shared dispatch data.
pub struct EventLoop<D> {
    sources: Vec<FdSource<D>>,
    timers: Vec<Timer<D>>,
    next_id: u64,
}

impl<D> EventLoop<D> {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            timers: Vec::new(),
            next_id: 1,
        }
    }

    fn fresh_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Register a callback for readability on `fd`.
    ///
    /// The loop does not take ownership of the descriptor; the closure
    /// should own it so that `PollAction::Remove` closes it.
    pub fn add_fd<F>(&mut self, fd: RawFd, callback: F) -> SourceId
    where
        F: FnMut(&mut D) -> PollAction + 'static,
    {
        let id = SourceId(self.fresh_id());
        self.sources.push(FdSource {
            id,
            fd,
            callback: Box::new(callback),
        });
        id
    }

    /// Remove an fd source. Returns false if it was already gone.
    pub fn remove_fd(&mut self, id: SourceId) -> bool {
        let before = self.sources.len();
        self.sources.retain(|s| s.id != id);
        self.sources.len() != before
    }

    /// Arm a timer that fires once after `delay`. The callback rearms the
    /// timer by returning `Some(next_delay)`.
    pub fn add_timer<F>(&mut self, delay: Duration, callback: F) -> TimerId
    where
        F: FnMut(&mut D) -> Option<Duration> + 'static,
    {
        let id = TimerId(self.fresh_id());
        self.timers.push(Timer {
            id,
            deadline: Instant::now() + delay,
            callback: Box::new(callback),
        });
        id
    }

    /// Move an armed timer's deadline to `delay` from now.
    pub fn update_timer(&mut self, id: TimerId, delay: Duration) -> bool {
        if let Some(timer) = self.timers.iter_mut().find(|t| t.id == id) {
            timer.deadline = Instant::now() + delay;
            true
        } else {
            false
        }
    }

    /// Cancel a timer. Returns false if it was already gone.
    pub fn remove_timer(&mut self, id: TimerId) -> bool {
        let before = self.timers.len();
        self.timers.retain(|t| t.id != id);
        self.timers.len() != before
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    fn poll_timeout_ms(&self, timeout: Option<Duration>) -> i32 {
        let now = Instant::now();
        let timer_wait = self
            .timers
            .iter()
            .map(|t| t.deadline.saturating_duration_since(now))
            .min();
        let wait = match (timer_wait, timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        match wait {
            // poll(2) takes milliseconds; round up so a deadline 0.2ms out
            // does not busy-spin.
            Some(d) => d.as_millis().min(i32::MAX as u128 - 1) as i32 + i32::from(!d.is_zero()),
            None => -1,
        }
    }

    /// Run one loop iteration: wait for readiness or a deadline, then fire
    /// due timers and readable fd sources. Returns how many callbacks ran.
    pub fn dispatch(&mut self, timeout: Option<Duration>, data: &mut D) -> std::io::Result<usize> {
        let timeout_ms = self.poll_timeout_ms(timeout);

        let mut pollfds: Vec<libc::pollfd> = self
            .sources
            .iter()
            .map(|s| libc::pollfd {
                fd: s.fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        if !pollfds.is_empty() || timeout_ms >= 0 {
            let ret = unsafe {
                libc::poll(
                    pollfds.as_mut_ptr(),
                    pollfds.len() as libc::nfds_t,
                    timeout_ms,
                )
            };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
        }

        let mut fired = 0;

        // Timers first: a fence that signaled in the same wakeup sees the
        // pacing state of the period it belongs to.
        let now = Instant::now();
        let due: Vec<TimerId> = self
            .timers
            .iter()
            .filter(|t| t.deadline <= now)
            .map(|t| t.id)
            .collect();
        for id in due {
            let Some(pos) = self.timers.iter().position(|t| t.id == id) else {
                continue;
            };
            let mut timer = self.timers.swap_remove(pos);
            fired += 1;
            if let Some(next) = (timer.callback)(data) {
                timer.deadline = Instant::now() + next;
                self.timers.push(timer);
            }
        }

        // Readable fd sources.
        let ready: Vec<SourceId> = pollfds
            .iter()
            .zip(self.sources.iter())
            .filter(|(p, _)| p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
            .map(|(_, s)| s.id)
            .collect();
        for id in ready {
            let Some(pos) = self.sources.iter().position(|s| s.id == id) else {
                continue;
            };
            let mut source = self.sources.swap_remove(pos);
            fired += 1;
            if (source.callback)(data) == PollAction::Keep {
                self.sources.push(source);
            }
        }

        Ok(fired)
    }
}

impl<D> Default for EventLoop<D> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::{AsRawFd, OwnedFd};

    fn pipe_with_byte() -> OwnedFd {
        let mut fds = [0; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        let wrote = unsafe { libc::write(fds[1], [1u8].as_ptr() as *const _, 1) };
        assert_eq!(wrote, 1);
        unsafe { libc::close(fds[1]) };
        unsafe { std::os::unix::io::FromRawFd::from_raw_fd(fds[0]) }
    }

    #[test]
    fn test_timer_fires_and_rearms() {
        let mut el: EventLoop<u32> = EventLoop::new();
        el.add_timer(Duration::ZERO, |count| {
            *count += 1;
            if *count < 2 {
                Some(Duration::ZERO)
            } else {
                None
            }
        });

        let mut count = 0;
        el.dispatch(Some(Duration::from_millis(10)), &mut count).unwrap();
        assert_eq!(count, 1);
        assert_eq!(el.timer_count(), 1, "timer rearmed itself");

        el.dispatch(Some(Duration::from_millis(10)), &mut count).unwrap();
        assert_eq!(count, 2);
        assert_eq!(el.timer_count(), 0, "timer retired itself");
    }

    #[test]
    fn test_remove_timer_cancels() {
        let mut el: EventLoop<u32> = EventLoop::new();
        let id = el.add_timer(Duration::ZERO, |count| {
            *count += 1;
            None
        });
        assert!(el.remove_timer(id));
        assert!(!el.remove_timer(id));

        let mut count = 0;
        el.dispatch(Some(Duration::ZERO), &mut count).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_fd_source_fires_on_readable() {
        let mut el: EventLoop<u32> = EventLoop::new();
        let fd = pipe_with_byte();
        let raw = fd.as_raw_fd();
        el.add_fd(raw, move |count| {
            let _keep_alive = &fd;
            *count += 1;
            PollAction::Remove
        });

        let mut count = 0;
        el.dispatch(Some(Duration::from_millis(100)), &mut count).unwrap();
        assert_eq!(count, 1);
        assert_eq!(el.source_count(), 0, "one-shot source removed itself");
    }

    #[test]
    fn test_fd_source_keep_stays_registered() {
        let mut el: EventLoop<u32> = EventLoop::new();
        let fd = pipe_with_byte();
        let raw = fd.as_raw_fd();
        let id = el.add_fd(raw, move |count| {
            let _keep_alive = &fd;
            *count += 1;
            PollAction::Keep
        });

        let mut count = 0;
        el.dispatch(Some(Duration::ZERO), &mut count).unwrap();
        assert_eq!(count, 1);
        assert_eq!(el.source_count(), 1);
        assert!(el.remove_fd(id));
    }
}
