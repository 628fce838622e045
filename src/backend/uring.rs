use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use io_uring::{
    cqueue, opcode, squeue,
    types::{Fd, FsyncFlags, SubmitArgs, Timespec},
    IoUring, Probe,
};

use super::{Backend, Reaped};
use crate::{
    buffer::Mapping,
    notify::Notifier,
    operation::{Action, BarrierKind, Submission},
    Error,
};

const NOTIFY_USER_DATA: u64 = u64::MAX;
const TIMEOUT_REMOVE_USER_DATA: u64 = u64::MAX - 1;
const CANCEL_TAG: u64 = 1 << 63;
/// Tags fallback timeouts, the low bits carry their sequence number
const TIMEOUT_TAG: u64 = 1 << 62;

/// Kernel limit on the registered buffer table
const MAX_REGISTERED_BUFFERS: usize = 1 << 14;

/// Offset meaning "the file position" for descriptors without one
const CURRENT_POSITION: u64 = u64::MAX;

/// Completion based backend on a Linux `io_uring` instance
pub struct UringBackend {
    ring: IoUring,
    /// Buffers in the kernel's table, in registration order
    buffers: Vec<Arc<Mapping>>,
    /// Start address of each registered buffer to its table index
    buffer_index: HashMap<usize, u16>,
    /// Waiting until no fixed transfer is in flight to rebuild the table
    unregistered: Vec<Arc<Mapping>>,
    /// Keys of issued transfers using a registered buffer
    fixed: HashSet<usize>,
    notifier: Arc<Notifier>,
    cancellable: bool,
    extended_wait: bool,
    notifier_armed: bool,
    /// Sequence number and expiry of the fallback timeout in the ring
    armed_timeout: Option<(u64, Instant)>,
    timeout_sequence: u64,
    timespec: Timespec,
    completions: Vec<cqueue::Entry>,
}

impl UringBackend {
    pub fn new(entries: u32, notifier: Arc<Notifier>) -> Result<Self, Error> {
        let ring = IoUring::new(entries)?;

        let mut probe = Probe::new();
        let cancellable = match ring.submitter().register_probe(&mut probe) {
            Ok(()) => probe.is_supported(opcode::AsyncCancel::CODE),
            Err(_) => false,
        };

        let extended_wait = ring.params().is_feature_ext_arg();

        tracing::debug!(entries, cancellable, extended_wait, "opened io_uring");

        Ok(Self {
            ring,
            buffers: Vec::new(),
            buffer_index: HashMap::new(),
            unregistered: Vec::new(),
            fixed: HashSet::new(),
            notifier,
            cancellable,
            extended_wait,
            notifier_armed: false,
            armed_timeout: None,
            timeout_sequence: 0,
            timespec: Timespec::new(),
            completions: Vec::new(),
        })
    }

    /// Push an entry, flushing the queue to the kernel once if it is full
    unsafe fn push(&mut self, entry: &squeue::Entry) -> Result<(), Error> {
        // SAFETY: the caller guarantees the entry's memory stays valid
        if unsafe { self.ring.submission().push(entry) }.is_ok() {
            return Ok(());
        }

        self.ring.submit()?;

        // SAFETY: as above
        unsafe { self.ring.submission().push(entry) }
            .map_err(|_| Error::Broken("io_uring submission queue stays full".to_owned()))
    }

    fn arm_notifier(&mut self) -> Result<(), Error> {
        if self.notifier_armed {
            return Ok(());
        }

        #[allow(clippy::cast_sign_loss)]
        let entry = opcode::PollAdd::new(Fd(self.notifier.descriptor()), libc::POLLIN as u32)
            .build()
            .user_data(NOTIFY_USER_DATA);

        // SAFETY: polling references no memory
        unsafe { self.push(&entry)? };
        self.notifier_armed = true;
        Ok(())
    }

    fn arm_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        let Some(expires) = Instant::now().checked_add(timeout) else {
            return Ok(());
        };

        match self.armed_timeout {
            Some((_, armed)) if armed <= expires => return Ok(()),
            Some((sequence, _)) => {
                let entry = opcode::TimeoutRemove::new(TIMEOUT_TAG | sequence)
                    .build()
                    .user_data(TIMEOUT_REMOVE_USER_DATA);

                // SAFETY: removal references no memory
                unsafe { self.push(&entry)? };
            }
            None => {}
        }

        self.timeout_sequence = (self.timeout_sequence + 1) & (TIMEOUT_TAG - 1);
        self.timespec = Timespec::new()
            .sec(timeout.as_secs())
            .nsec(timeout.subsec_nanos());

        // fires on expiry or as soon as anything else completes
        let entry = opcode::Timeout::new(&self.timespec)
            .count(1)
            .build()
            .user_data(TIMEOUT_TAG | self.timeout_sequence);

        // SAFETY: the timespec lives in self and is copied by the kernel on
        // submission
        unsafe { self.push(&entry)? };
        self.armed_timeout = Some((self.timeout_sequence, expires));
        Ok(())
    }

    /// Rebuild the registered buffer table with the buffers still alive
    ///
    /// Indices shift on every rebuild, so it only happens while no fixed
    /// transfer is in flight
    fn refresh_buffers(&mut self) {
        if self.unregistered.is_empty() || !self.fixed.is_empty() {
            return;
        }

        // a single reference means the owner dropped the buffer
        self.buffers.retain(|mapping| Arc::strong_count(mapping) > 1);
        self.unregistered
            .retain(|mapping| Arc::strong_count(mapping) > 1);

        let room = MAX_REGISTERED_BUFFERS.saturating_sub(self.buffers.len());
        let admitted = self.unregistered.len().min(room);
        self.buffers.extend(self.unregistered.drain(..admitted));
        self.unregistered.clear();

        if !self.buffer_index.is_empty() {
            if let Err(error) = self.ring.submitter().unregister_buffers() {
                tracing::debug!(%error, "failed to unregister buffers");
            }

            self.buffer_index.clear();
            for mapping in &self.buffers {
                mapping.set_registered(false);
            }
        }

        if self.buffers.is_empty() {
            return;
        }

        let vectors: Vec<_> = self.buffers.iter().map(|mapping| mapping.iovec()).collect();

        // SAFETY: `self.buffers` keeps every mapping alive until the table is
        // rebuilt or the ring goes away
        match unsafe { self.ring.submitter().register_buffers(&vectors) } {
            Ok(()) => {
                for (index, mapping) in self.buffers.iter().enumerate() {
                    #[allow(clippy::cast_possible_truncation)]
                    self.buffer_index
                        .insert(mapping.address() as usize, index as u16);
                    mapping.set_registered(true);
                }

                tracing::debug!(count = self.buffers.len(), "registered buffers");
            }
            Err(error) => {
                tracing::debug!(%error, "buffer registration refused, using plain transfers");
                self.buffers.clear();
            }
        }
    }

    fn wait(&mut self, timeout: Option<Duration>) -> std::io::Result<usize> {
        if !self.ring.completion().is_empty() {
            return self.ring.submit();
        }

        match timeout {
            None => self.ring.submit_and_wait(1),
            Some(Duration::ZERO) => self.ring.submit(),
            Some(timeout) if self.extended_wait => {
                let timespec = Timespec::new()
                    .sec(timeout.as_secs())
                    .nsec(timeout.subsec_nanos());
                let arguments = SubmitArgs::new().timespec(&timespec);

                self.ring.submitter().submit_with_args(1, &arguments)
            }
            Some(timeout) => {
                self.arm_timeout(timeout).map_err(std::io::Error::from)?;
                self.ring.submit_and_wait(1)
            }
        }
    }
}

/// Table index and vector of a transfer on a registered buffer
///
/// # Safety
///
/// `vectors` must point at a valid iovec
unsafe fn fixed_buffer(
    vectors: *const libc::iovec,
    registered: bool,
    buffer_index: &HashMap<usize, u16>,
) -> Option<(u16, libc::iovec)> {
    if !registered {
        return None;
    }

    // SAFETY: registered transfers always carry exactly one vector
    let vector = unsafe { *vectors };
    u32::try_from(vector.iov_len).ok()?;

    buffer_index
        .get(&(vector.iov_base as usize))
        .map(|index| (*index, vector))
}

/// Build the entry for a submission, along with whether it uses a
/// registered buffer
///
/// # Safety
///
/// The submission's vectors must be valid
// scatter lists, fixed lengths and barrier lengths are clamped beforehand
#[allow(clippy::cast_possible_truncation)]
unsafe fn build(
    submission: &Submission,
    buffer_index: &HashMap<usize, u16>,
) -> (squeue::Entry, bool) {
    let fd = Fd(submission.fd);
    let offset = submission.offset.unwrap_or(CURRENT_POSITION);
    let mut fixed = false;

    let entry = match submission.action {
        Action::Read {
            vectors,
            count,
            registered,
        } => match unsafe { fixed_buffer(vectors, registered, buffer_index) } {
            Some((index, vector)) => {
                fixed = true;
                opcode::ReadFixed::new(fd, vector.iov_base.cast(), vector.iov_len as u32, index)
                    .offset(offset)
                    .build()
            }
            None => opcode::Readv::new(fd, vectors, count as u32)
                .offset(offset)
                .build(),
        },
        Action::Write {
            vectors,
            count,
            registered,
        } => match unsafe { fixed_buffer(vectors, registered, buffer_index) } {
            Some((index, vector)) => {
                fixed = true;
                opcode::WriteFixed::new(
                    fd,
                    vector.iov_base.cast_const().cast(),
                    vector.iov_len as u32,
                    index,
                )
                .offset(offset)
                .build()
            }
            None => opcode::Writev::new(fd, vectors, count as u32)
                .offset(offset)
                .build(),
        },
        Action::Barrier {
            kind: BarrierKind::NowaitDataOnly,
            offset,
            length,
        } => opcode::SyncFileRange::new(fd, u32::try_from(length).unwrap_or(0))
            .offset(offset)
            .flags(libc::SYNC_FILE_RANGE_WRITE)
            .build(),
        Action::Barrier {
            kind: BarrierKind::WaitDataOnly,
            ..
        } => opcode::Fsync::new(fd).flags(FsyncFlags::DATASYNC).build(),
        Action::Barrier { .. } => opcode::Fsync::new(fd).build(),
    };

    (entry.user_data(submission.key as u64), fixed)
}

impl Backend for UringBackend {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    fn supports_cancellation(&self) -> bool {
        self.cancellable
    }

    unsafe fn issue(&mut self, submission: Submission) -> Result<(), Error> {
        // SAFETY: the caller keeps the referenced memory alive
        let (entry, fixed) = unsafe { build(&submission, &self.buffer_index) };

        // SAFETY: as above
        unsafe { self.push(&entry)? };

        if fixed {
            self.fixed.insert(submission.key);
        }

        Ok(())
    }

    fn cancel(&mut self, key: usize) -> Result<(), Error> {
        if !self.cancellable {
            return Err(Error::CannotCancel);
        }

        let entry = opcode::AsyncCancel::new(key as u64)
            .build()
            .user_data(CANCEL_TAG | key as u64);

        // SAFETY: cancellation references no memory
        unsafe { self.push(&entry) }
    }

    fn register_buffer(&mut self, mapping: &Arc<Mapping>) -> Result<(), Error> {
        self.unregistered.push(mapping.clone());
        self.refresh_buffers();
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn reap(&mut self, timeout: Option<Duration>, reaped: &mut Vec<Reaped>) -> Result<(), Error> {
        self.arm_notifier()?;

        match self.wait(timeout) {
            Ok(_) => {}
            Err(error)
                if matches!(
                    error.raw_os_error(),
                    Some(libc::ETIME | libc::EINTR | libc::EBUSY | libc::EAGAIN)
                ) => {}
            Err(error) => return Err(Error::Broken(format!("io_uring wait failed: {error}"))),
        }

        self.completions.extend(self.ring.completion());

        for entry in self.completions.drain(..) {
            let result = entry.result();

            match entry.user_data() {
                NOTIFY_USER_DATA => {
                    self.notifier.drain();
                    self.notifier_armed = false;
                }
                TIMEOUT_REMOVE_USER_DATA => {}
                data if data & CANCEL_TAG != 0 => {
                    // success shows up as the target completing with ECANCELED
                    if result < 0 {
                        reaped.push(Reaped::CancelRefused {
                            key: (data & !CANCEL_TAG) as usize,
                        });
                    }
                }
                data if data & TIMEOUT_TAG != 0 => {
                    if self
                        .armed_timeout
                        .is_some_and(|(sequence, _)| data == TIMEOUT_TAG | sequence)
                    {
                        self.armed_timeout = None;
                    }
                }
                data => {
                    let key = data as usize;
                    self.fixed.remove(&key);

                    reaped.push(match result {
                        transferred if transferred >= 0 => Reaped::Finished {
                            key,
                            result: Ok(transferred as usize),
                        },
                        code if -code == libc::ECANCELED => Reaped::Cancelled { key },
                        code => Reaped::Finished {
                            key,
                            result: Err(Error::from_raw_os_error(-code)),
                        },
                    });
                }
            }
        }

        self.refresh_buffers();

        tracing::trace!(reaped = reaped.len(), "io_uring pass");
        Ok(())
    }
}
