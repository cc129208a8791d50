// Deferred tasks and readiness polling.
//
// The capture path only needs two things from the daemon's main loop: a way
// to run a named task after a delay (and to cancel it), and a readiness
// notification for the capture socket. `EventLoop` provides both on top of
// poll(2) for a single thread.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use crate::error::NhrpError;

/// Deferred actions known to the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Task {
    InstallFilter,
}

impl Task {
    pub fn describe(self) -> &'static str {
        match self {
            Task::InstallFilter => "Install PF_PACKET filter code",
        }
    }
}

pub trait Scheduler {
    /// Run `task` after `delay`. Rescheduling a pending task replaces its
    /// deadline.
    fn schedule(&mut self, task: Task, delay: Duration);

    /// Forget a pending task. Cancelling a task that is not pending is a no-op.
    fn cancel(&mut self, task: Task);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Readable(RawFd),
    Task(Task),
}

#[derive(Debug, Default)]
pub struct EventLoop {
    fds: Vec<RawFd>,
    timers: HashMap<Task, Instant>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_fd(&mut self, fd: RawFd) {
        if !self.fds.contains(&fd) {
            self.fds.push(fd);
        }
    }

    pub fn unregister_fd(&mut self, fd: RawFd) {
        self.fds.retain(|&f| f != fd);
    }

    pub fn is_scheduled(&self, task: Task) -> bool {
        self.timers.contains_key(&task)
    }

    /// Block until a registered descriptor is readable, a task is due, or
    /// `max_wait` elapses.
    ///
    /// Due tasks are removed from the timer set before they are returned.
    /// A signal interrupting the wait yields an empty batch so the caller can
    /// look at its signal flags.
    pub fn wait(&mut self, max_wait: Duration) -> Result<Vec<Event>, NhrpError> {
        let now = Instant::now();
        let timeout = self
            .timers
            .values()
            .map(|deadline| deadline.saturating_duration_since(now))
            .min()
            .map_or(max_wait, |due| due.min(max_wait));

        let mut pfds: Vec<libc::pollfd> = self
            .fds
            .iter()
            .map(|&fd| libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        let ret = unsafe {
            libc::poll(
                pfds.as_mut_ptr(),
                pfds.len() as libc::nfds_t,
                poll_timeout_ms(timeout),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(NhrpError::EventLoop(err));
        }

        let mut events: Vec<Event> = pfds
            .iter()
            .filter(|p| p.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0)
            .map(|p| Event::Readable(p.fd))
            .collect();

        let now = Instant::now();
        let mut due: Vec<(Instant, Task)> = self
            .timers
            .iter()
            .filter(|&(_, deadline)| *deadline <= now)
            .map(|(&task, &deadline)| (deadline, task))
            .collect();
        due.sort_by_key(|&(deadline, _)| deadline);
        for (_, task) in due {
            self.timers.remove(&task);
            log::trace!("Running task: {}", task.describe());
            events.push(Event::Task(task));
        }

        Ok(events)
    }
}

impl Scheduler for EventLoop {
    fn schedule(&mut self, task: Task, delay: Duration) {
        log::debug!("Scheduling task '{}' in {:?}", task.describe(), delay);
        self.timers.insert(task, Instant::now() + delay);
    }

    fn cancel(&mut self, task: Task) {
        if self.timers.remove(&task).is_some() {
            log::debug!("Cancelled task '{}'", task.describe());
        }
    }
}

/// Round up so a pending timer never turns into a zero-timeout busy loop.
fn poll_timeout_ms(timeout: Duration) -> libc::c_int {
    let ms = timeout.as_nanos().div_ceil(1_000_000);
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}
