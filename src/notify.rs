use std::{
    io::{Error, ErrorKind, Result},
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
};

/// Wakes a backend blocked waiting for completions
///
/// Backed by an `eventfd` on Linux and a non-blocking pipe elsewhere. The
/// descriptor stays readable until drained so a notification sent before the
/// backend blocks is never lost
#[derive(Debug)]
pub struct Notifier {
    reader: OwnedFd,
    writer: Option<OwnedFd>,
}

impl Notifier {
    #[cfg(target_os = "linux")]
    pub fn new() -> Result<Self> {
        // SAFETY: plain syscall without pointer arguments
        let raw = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if raw < 0 {
            return Err(Error::last_os_error());
        }

        Ok(Self {
            // SAFETY: the descriptor was just created
            reader: unsafe { OwnedFd::from_raw_fd(raw) },
            writer: None,
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn new() -> Result<Self> {
        let mut ends = [0; 2];

        // SAFETY: the array has room for both descriptors
        if unsafe { libc::pipe(ends.as_mut_ptr()) } != 0 {
            return Err(Error::last_os_error());
        }

        // SAFETY: both descriptors were just created
        let (reader, writer) = unsafe { (OwnedFd::from_raw_fd(ends[0]), OwnedFd::from_raw_fd(ends[1])) };

        for end in [&reader, &writer] {
            // SAFETY: adjusting flags of descriptors we own
            unsafe {
                let flags = libc::fcntl(end.as_raw_fd(), libc::F_GETFL);
                libc::fcntl(end.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK);
                libc::fcntl(end.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }

        Ok(Self {
            reader,
            writer: Some(writer),
        })
    }

    /// Descriptor that turns readable once notified
    pub fn descriptor(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    pub fn notify(&self) -> Result<()> {
        let target = self.writer.as_ref().unwrap_or(&self.reader).as_raw_fd();
        let value = 1u64.to_ne_bytes();

        // SAFETY: the buffer is valid for its length
        let written = unsafe { libc::write(target, value.as_ptr().cast(), value.len()) };
        if written >= 0 {
            return Ok(());
        }

        // a full counter or pipe is already readable
        match Error::last_os_error() {
            error if error.kind() == ErrorKind::WouldBlock => Ok(()),
            error => Err(error),
        }
    }

    pub fn drain(&self) {
        let mut buffer = [0u8; 64];

        loop {
            // SAFETY: the buffer is valid for its length
            let read = unsafe {
                libc::read(
                    self.reader.as_raw_fd(),
                    buffer.as_mut_ptr().cast(),
                    buffer.len(),
                )
            };

            if read <= 0 {
                return;
            }
        }
    }
}
