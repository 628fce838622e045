use std::{
    fs::File,
    io::{Error, Result},
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd},
    sync::atomic::{AtomicU64, Ordering},
};

use bitflags::bitflags;

use crate::RegisteredBuffer;

/// Upper bound on scatter/gather buffers per request, matching `IOV_MAX` on
/// Linux and the BSDs
const MAX_BUFFERS: usize = 1024;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

bitflags! {
    /// What a handle can be asked to do
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Capabilities: u8 {
        const READABLE = 1;
        const WRITABLE = 1 << 1;
        /// Readiness can be waited for, reads and writes may not complete
        /// immediately
        const POLLABLE = 1 << 2;
        /// Transfers honor the request offset
        const SEEKABLE = 1 << 3;
    }
}

/// An opened OS descriptor along with the capabilities it was queried for
///
/// The handle is shared between its owner and every in-flight operation
/// targeting it, so the descriptor outlives any transfer the kernel still
/// performs on it
#[derive(Debug)]
pub struct Handle {
    file: OwnedFd,
    capabilities: Capabilities,
    id: u64,
    multiplexer: AtomicU64,
}

impl Handle {
    /// Wrap a descriptor with explicitly provided capabilities
    pub fn new(file: impl Into<OwnedFd>, capabilities: Capabilities) -> Self {
        Self {
            file: file.into(),
            capabilities,
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            multiplexer: AtomicU64::new(0),
        }
    }

    /// Wrap a file, probing its access mode and type
    ///
    /// # Errors
    ///
    /// If querying the descriptor fails
    pub fn from_file(file: File) -> Result<Self> {
        let capabilities = probe(file.as_fd())?;
        Ok(Self::new(file, capabilities))
    }

    /// Wrap a connected or listening socket
    pub fn from_socket(socket: socket2::Socket) -> Self {
        Self::new(
            socket,
            Capabilities::READABLE | Capabilities::WRITABLE | Capabilities::POLLABLE,
        )
    }

    /// Create an anonymous pipe, returning the reading and the writing end
    ///
    /// # Errors
    ///
    /// If the pipe can't be created
    pub fn pipe() -> Result<(Self, Self)> {
        let mut ends = [0; 2];

        // SAFETY: the array has room for exactly the two descriptors written
        if unsafe { libc::pipe(ends.as_mut_ptr()) } != 0 {
            return Err(Error::last_os_error());
        }

        // SAFETY: both descriptors were just created and are owned by nobody else
        let (reader, writer) = unsafe { (OwnedFd::from_raw_fd(ends[0]), OwnedFd::from_raw_fd(ends[1])) };

        for end in [&reader, &writer] {
            set_descriptor_flag(end.as_raw_fd(), libc::FD_CLOEXEC)?;
        }

        Ok((
            Self::new(reader, Capabilities::READABLE | Capabilities::POLLABLE),
            Self::new(writer, Capabilities::WRITABLE | Capabilities::POLLABLE),
        ))
    }

    #[must_use]
    pub fn native_descriptor(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    #[must_use]
    pub const fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Most scatter/gather buffers a single request may carry
    #[must_use]
    pub const fn max_buffers(&self) -> usize {
        MAX_BUFFERS
    }

    /// Page aligned buffer straight from the OS, rounded up to whole pages
    ///
    /// Not known to any backend, [`crate::Multiplexer::allocate_registered_buffer`]
    /// also registers it
    ///
    /// # Errors
    ///
    /// For zero bytes or when the OS can't map the memory
    #[allow(clippy::unused_self)]
    pub fn allocate_registered_buffer(
        &self,
        bytes: usize,
    ) -> std::result::Result<RegisteredBuffer, crate::Error> {
        RegisteredBuffer::allocate(bytes)
    }

    /// Process unique identity of this handle
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Identity of the multiplexer this handle is registered with
    #[must_use]
    pub fn multiplexer(&self) -> Option<u64> {
        match self.multiplexer.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Close the descriptor, reporting any error the OS returns
    ///
    /// # Errors
    ///
    /// If `close(2)` fails, the descriptor is gone regardless
    pub fn close(self) -> Result<()> {
        let raw = self.file.into_raw_fd();

        // SAFETY: we owned the descriptor and just gave up ownership
        if unsafe { libc::close(raw) } != 0 {
            return Err(Error::last_os_error());
        }

        Ok(())
    }

    /// Bind to a multiplexer, returning the current owner on conflict
    pub(crate) fn bind(&self, multiplexer: u64) -> std::result::Result<(), u64> {
        match self
            .multiplexer
            .compare_exchange(0, multiplexer, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(current) if current == multiplexer => Ok(()),
            Err(current) => Err(current),
        }
    }

    pub(crate) fn unbind(&self, multiplexer: u64) {
        _ = self
            .multiplexer
            .compare_exchange(multiplexer, 0, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Switch the descriptor into non-blocking mode
    pub(crate) fn make_non_blocking(&self) -> Result<()> {
        let raw = self.native_descriptor();

        // SAFETY: querying flags on a descriptor we own
        let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
        if flags < 0 {
            return Err(Error::last_os_error());
        }

        if flags & libc::O_NONBLOCK != 0 {
            return Ok(());
        }

        // SAFETY: only adds a status flag to a descriptor we own
        if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(Error::last_os_error());
        }

        Ok(())
    }
}

impl AsFd for Handle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for Handle {
    fn as_raw_fd(&self) -> RawFd {
        self.native_descriptor()
    }
}

fn probe(file: BorrowedFd) -> Result<Capabilities> {
    let raw = file.as_raw_fd();

    // SAFETY: querying flags on a borrowed, valid descriptor
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::last_os_error());
    }

    let mut capabilities = match flags & libc::O_ACCMODE {
        libc::O_RDONLY => Capabilities::READABLE,
        libc::O_WRONLY => Capabilities::WRITABLE,
        _ => Capabilities::READABLE | Capabilities::WRITABLE,
    };

    let mut status = std::mem::MaybeUninit::<libc::stat>::uninit();

    // SAFETY: fstat fills the whole structure on success
    let status = unsafe {
        if libc::fstat(raw, status.as_mut_ptr()) != 0 {
            return Err(Error::last_os_error());
        }

        status.assume_init()
    };

    match status.st_mode & libc::S_IFMT {
        libc::S_IFREG | libc::S_IFBLK => capabilities |= Capabilities::SEEKABLE,
        libc::S_IFIFO | libc::S_IFSOCK | libc::S_IFCHR => capabilities |= Capabilities::POLLABLE,
        _ => {}
    }

    Ok(capabilities)
}

fn set_descriptor_flag(raw: RawFd, flag: libc::c_int) -> Result<()> {
    // SAFETY: querying and extending descriptor flags we own
    unsafe {
        let flags = libc::fcntl(raw, libc::F_GETFD);
        if flags < 0 || libc::fcntl(raw, libc::F_SETFD, flags | flag) < 0 {
            return Err(Error::last_os_error());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;

    use super::{Capabilities, Handle};

    #[test]
    fn allocates_unregistered_page_aligned_buffers() {
        let (reader, _writer) = Handle::pipe().unwrap();

        let buffer = reader.allocate_registered_buffer(3).unwrap();
        assert!(buffer.len() >= 3);
        assert_eq!(buffer.as_ptr() as usize % buffer.len().min(4096), 0);
        assert!(!buffer.is_registered());

        assert!(matches!(
            reader.allocate_registered_buffer(0),
            Err(crate::Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn probes_read_only_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let reader = OpenOptions::new().read(true).open(file.path()).unwrap();

        let handle = Handle::from_file(reader).unwrap();
        assert_eq!(
            handle.capabilities(),
            Capabilities::READABLE | Capabilities::SEEKABLE
        );
    }

    #[test]
    fn probes_read_write_file() {
        let handle = Handle::from_file(tempfile::tempfile().unwrap()).unwrap();
        assert_eq!(
            handle.capabilities(),
            Capabilities::READABLE | Capabilities::WRITABLE | Capabilities::SEEKABLE
        );
    }

    #[test]
    fn pipe_ends_are_pollable() {
        let (reader, writer) = Handle::pipe().unwrap();
        assert_eq!(
            reader.capabilities(),
            Capabilities::READABLE | Capabilities::POLLABLE
        );
        assert_eq!(
            writer.capabilities(),
            Capabilities::WRITABLE | Capabilities::POLLABLE
        );
        assert_ne!(reader.id(), writer.id());

        reader.close().unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn sockets_are_pollable() {
        let socket =
            socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None).unwrap();
        let handle = Handle::from_socket(socket);

        assert!(handle.capabilities().contains(Capabilities::POLLABLE));
        assert!(!handle.capabilities().contains(Capabilities::SEEKABLE));
    }

    #[test]
    fn binding_is_exclusive() {
        let handle = Handle::from_file(tempfile::tempfile().unwrap()).unwrap();
        assert_eq!(handle.multiplexer(), None);

        assert_eq!(handle.bind(7), Ok(()));
        assert_eq!(handle.bind(7), Ok(()));
        assert_eq!(handle.bind(8), Err(7));

        handle.unbind(8);
        assert_eq!(handle.multiplexer(), Some(7));

        handle.unbind(7);
        assert_eq!(handle.bind(8), Ok(()));
    }

    #[test]
    fn non_blocking_mode_sticks() {
        let (reader, _writer) = Handle::pipe().unwrap();
        reader.make_non_blocking().unwrap();
        reader.make_non_blocking().unwrap();

        // SAFETY: querying flags of a live descriptor
        let flags = unsafe { libc::fcntl(reader.native_descriptor(), libc::F_GETFL) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);
    }
}
