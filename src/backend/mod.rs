//! OS mechanisms which carry operations to completion
//!
//! A backend is owned by a single driving thread at a time, it never sees
//! operation states, only [`Submission`]s keyed by their registry slot

use std::{sync::Arc, time::Duration};

use crate::{
    buffer::Mapping,
    config::BackendKind,
    notify::Notifier,
    operation::{Action, BarrierKind, Submission},
    Config, Error,
};

mod poll;
#[cfg(target_os = "linux")]
mod uring;

pub(crate) use self::poll::PollBackend;
#[cfg(target_os = "linux")]
pub(crate) use self::uring::UringBackend;

/// Something the backend learned about an issued submission
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Reaped {
    Finished {
        key: usize,
        result: Result<usize, Error>,
    },
    /// The submission was withdrawn before it transferred anything
    Cancelled { key: usize },
    /// The submission was past the point of cancelling, its natural result
    /// follows
    CancelRefused { key: usize },
}

pub(crate) trait Backend: Send {
    fn name(&self) -> &'static str;

    /// Whether issued submissions can be withdrawn
    fn supports_cancellation(&self) -> bool;

    /// Hand a submission to the OS
    ///
    /// # Safety
    ///
    /// Memory referenced by the submission must stay valid and untouched
    /// until its key is reaped as finished or cancelled
    unsafe fn issue(&mut self, submission: Submission) -> Result<(), Error>;

    /// Ask for an issued submission to be withdrawn, the answer is reaped
    fn cancel(&mut self, key: usize) -> Result<(), Error>;

    /// Make a buffer known to the OS ahead of transfers using it
    ///
    /// Backends without such a notion accept every buffer as is
    fn register_buffer(&mut self, _mapping: &Arc<Mapping>) -> Result<(), Error> {
        Ok(())
    }

    /// Wait up to `timeout` for results, [`None`] waiting indefinitely
    ///
    /// Returns early once the notifier fires. An error means the backend is
    /// unusable
    fn reap(&mut self, timeout: Option<Duration>, reaped: &mut Vec<Reaped>) -> Result<(), Error>;
}

/// Open the backend the configuration asks for
pub(crate) fn open(config: &Config, notifier: &Arc<Notifier>) -> Result<Box<dyn Backend>, Error> {
    match config.backend {
        BackendKind::Poll => Ok(Box::new(PollBackend::new(notifier.clone()))),
        #[cfg(target_os = "linux")]
        BackendKind::IoUring => Ok(Box::new(UringBackend::new(
            config.ring_entries,
            notifier.clone(),
        )?)),
        #[cfg(not(target_os = "linux"))]
        BackendKind::IoUring => Err(Error::Io {
            code: libc::ENOSYS,
        }),
        #[cfg(target_os = "linux")]
        BackendKind::Auto => match UringBackend::new(config.ring_entries, notifier.clone()) {
            Ok(backend) => Ok(Box::new(backend)),
            Err(error) => {
                tracing::debug!(%error, "io_uring unavailable, falling back to poll");
                Ok(Box::new(PollBackend::new(notifier.clone())))
            }
        },
        #[cfg(not(target_os = "linux"))]
        BackendKind::Auto => Ok(Box::new(PollBackend::new(notifier.clone()))),
    }
}

/// Perform a submission synchronously, retrying interrupted calls
pub(crate) fn perform(submission: &Submission) -> std::io::Result<usize> {
    loop {
        // SAFETY: the submission points at memory kept alive by its operation
        let result = unsafe { perform_once(submission) };

        match result {
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
            result => return result,
        }
    }
}

// the scatter lists are bounded well below `c_int::MAX`
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]
unsafe fn perform_once(submission: &Submission) -> std::io::Result<usize> {
    let fd = submission.fd;

    let transferred = match (&submission.action, submission.offset) {
        (Action::Read { vectors, count, .. }, Some(offset)) => {
            libc::preadv(fd, *vectors, *count as libc::c_int, offset as libc::off_t)
        }
        (Action::Read { vectors, count, .. }, None) => {
            libc::readv(fd, *vectors, *count as libc::c_int)
        }
        (Action::Write { vectors, count, .. }, Some(offset)) => {
            libc::pwritev(fd, *vectors, *count as libc::c_int, offset as libc::off_t)
        }
        (Action::Write { vectors, count, .. }, None) => {
            libc::writev(fd, *vectors, *count as libc::c_int)
        }
        (Action::Barrier { kind, offset, length }, _) => {
            barrier(fd, *kind, *offset, *length) as libc::ssize_t
        }
    };

    if transferred < 0 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(transferred as usize)
}

#[cfg(target_os = "linux")]
#[allow(clippy::cast_possible_wrap)]
unsafe fn barrier(fd: libc::c_int, kind: BarrierKind, offset: u64, length: u64) -> libc::c_int {
    match kind {
        BarrierKind::NowaitDataOnly => libc::sync_file_range(
            fd,
            offset as libc::off64_t,
            length as libc::off64_t,
            libc::SYNC_FILE_RANGE_WRITE,
        ),
        BarrierKind::WaitDataOnly => libc::fdatasync(fd),
        BarrierKind::NowaitAll | BarrierKind::WaitAll => libc::fsync(fd),
    }
}

#[cfg(not(target_os = "linux"))]
unsafe fn barrier(fd: libc::c_int, _: BarrierKind, _: u64, _: u64) -> libc::c_int {
    libc::fsync(fd)
}
