use std::{io::ErrorKind, sync::Arc, time::Duration};

use super::{perform, Backend, Reaped};
use crate::{
    notify::Notifier,
    operation::{Action, Submission},
    Error,
};

/// Readiness based backend built on `poll(2)`
///
/// Transfers run on the driving thread once their descriptor is ready,
/// descriptors without readiness (regular files) are transferred when issued
pub struct PollBackend {
    notifier: Arc<Notifier>,
    parked: Vec<Submission>,
    ready: Vec<Reaped>,
    descriptors: Vec<libc::pollfd>,
}

impl PollBackend {
    pub fn new(notifier: Arc<Notifier>) -> Self {
        Self {
            notifier,
            parked: Vec::new(),
            ready: Vec::new(),
            descriptors: Vec::new(),
        }
    }

    /// Try the transfer, keeping the submission around if it would block
    fn attempt(&mut self, submission: Submission) {
        match perform(&submission) {
            Err(error) if submission.pollable && error.kind() == ErrorKind::WouldBlock => {
                self.parked.push(submission);
            }
            result => self.ready.push(Reaped::Finished {
                key: submission.key,
                result: result.map_err(Error::from),
            }),
        }
    }
}

const fn interest(submission: &Submission) -> libc::c_short {
    match submission.action {
        Action::Write { .. } => libc::POLLOUT,
        Action::Read { .. } | Action::Barrier { .. } => libc::POLLIN,
    }
}

/// Milliseconds for `poll(2)`, rounded up so short waits don't spin
fn poll_timeout(timeout: Option<Duration>) -> libc::c_int {
    timeout.map_or(-1, |timeout| {
        let millis = timeout.as_nanos().div_ceil(1_000_000);
        libc::c_int::try_from(millis).unwrap_or(libc::c_int::MAX)
    })
}

impl Backend for PollBackend {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn supports_cancellation(&self) -> bool {
        true
    }

    unsafe fn issue(&mut self, submission: Submission) -> Result<(), Error> {
        self.attempt(submission);
        Ok(())
    }

    fn cancel(&mut self, key: usize) -> Result<(), Error> {
        match self.parked.iter().position(|parked| parked.key == key) {
            Some(index) => {
                self.parked.swap_remove(index);
                self.ready.push(Reaped::Cancelled { key });
            }
            None => self.ready.push(Reaped::CancelRefused { key }),
        }

        Ok(())
    }

    fn reap(&mut self, timeout: Option<Duration>, reaped: &mut Vec<Reaped>) -> Result<(), Error> {
        let timeout = if self.ready.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };

        self.descriptors.clear();
        self.descriptors.push(libc::pollfd {
            fd: self.notifier.descriptor(),
            events: libc::POLLIN,
            revents: 0,
        });
        self.descriptors
            .extend(self.parked.iter().map(|submission| libc::pollfd {
                fd: submission.fd,
                events: interest(submission),
                revents: 0,
            }));

        let count = libc::nfds_t::try_from(self.descriptors.len())
            .map_err(|_| Error::Broken("too many parked submissions".to_owned()))?;

        // SAFETY: the descriptor array is valid for `count` entries
        let result =
            unsafe { libc::poll(self.descriptors.as_mut_ptr(), count, poll_timeout(timeout)) };

        if result < 0 {
            let error = std::io::Error::last_os_error();
            if error.kind() != ErrorKind::Interrupted {
                return Err(Error::Broken(format!("poll failed: {error}")));
            }
        } else if result > 0 {
            if self.descriptors[0].revents != 0 {
                self.notifier.drain();
            }

            // walk backwards so removal keeps the remaining indices valid
            for index in (0..self.parked.len()).rev() {
                if self.descriptors[index + 1].revents != 0 {
                    let submission = self.parked.swap_remove(index);
                    self.attempt(submission);
                }
            }
        }

        tracing::trace!(
            ready = self.ready.len(),
            parked = self.parked.len(),
            "poll pass"
        );

        reaped.append(&mut self.ready);
        Ok(())
    }
}
