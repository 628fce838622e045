use std::{
    fmt,
    ops::{Deref, DerefMut},
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::Error;

/// Huge page size tried first for requests that are a multiple of it
#[cfg(target_os = "linux")]
const HUGE_PAGE: usize = 2 << 20;

/// Anonymous page aligned mapping, unmapped once the last owner lets go
///
/// Backends which register memory with the kernel keep their own reference
/// so the pages stay valid for as long as the registration
pub(crate) struct Mapping {
    address: NonNull<u8>,
    length: usize,
    registered: AtomicBool,
}

// SAFETY: the mapping is plain memory, access goes through the unique
// `RegisteredBuffer` or the kernel
unsafe impl Send for Mapping {}
// SAFETY: as above, shared references never touch the contents
unsafe impl Sync for Mapping {}

impl Mapping {
    fn allocate(bytes: usize) -> Result<Self, Error> {
        if bytes == 0 {
            return Err(Error::InvalidArgument("registered buffer of zero bytes"));
        }

        let page = page_size();
        let length = bytes
            .checked_next_multiple_of(page)
            .ok_or(Error::InvalidArgument("registered buffer is too large"))?;

        if let Some(mapping) = Self::map_huge(length) {
            return Ok(mapping);
        }

        // SAFETY: anonymous mapping with no address hint
        unsafe { Self::map(length, 0) }
    }

    #[cfg(target_os = "linux")]
    fn map_huge(length: usize) -> Option<Self> {
        if length % HUGE_PAGE != 0 {
            return None;
        }

        // SAFETY: anonymous mapping with no address hint
        unsafe { Self::map(length, libc::MAP_HUGETLB) }.ok()
    }

    #[cfg(not(target_os = "linux"))]
    const fn map_huge(_: usize) -> Option<Self> {
        None
    }

    unsafe fn map(length: usize, flags: libc::c_int) -> Result<Self, Error> {
        let address = libc::mmap(
            std::ptr::null_mut(),
            length,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | flags,
            -1,
            0,
        );

        if address == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }

        let address = NonNull::new(address.cast()).ok_or(Error::Io {
            code: libc::ENOMEM,
        })?;

        Ok(Self {
            address,
            length,
            registered: AtomicBool::new(false),
        })
    }

    pub fn address(&self) -> *mut u8 {
        self.address.as_ptr()
    }

    pub const fn length(&self) -> usize {
        self.length
    }

    pub fn iovec(&self) -> libc::iovec {
        libc::iovec {
            iov_base: self.address().cast(),
            iov_len: self.length,
        }
    }

    pub fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::Release);
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly what `map` created, nothing borrows it
        // anymore since this was the last reference
        if unsafe { libc::munmap(self.address().cast(), self.length) } != 0 {
            tracing::warn!(
                error = %std::io::Error::last_os_error(),
                length = self.length,
                "failed to unmap registered buffer"
            );
        }
    }
}

fn page_size() -> usize {
    // SAFETY: querying a constant of the running system
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).unwrap_or(4096)
}

/// Page aligned buffer allocated straight from the OS
///
/// A multiplexer may register it with its backend, letting transfers skip
/// pinning and copying. Registration is best effort, an unregistered buffer
/// behaves like any other. The length is the request rounded up to whole
/// pages
pub struct RegisteredBuffer {
    mapping: Arc<Mapping>,
}

impl RegisteredBuffer {
    pub(crate) fn allocate(bytes: usize) -> Result<Self, Error> {
        Ok(Self {
            mapping: Arc::new(Mapping::allocate(bytes)?),
        })
    }

    pub(crate) const fn mapping(&self) -> &Arc<Mapping> {
        &self.mapping
    }

    /// Whether a backend currently knows this buffer
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.mapping.registered.load(Ordering::Acquire)
    }
}

impl Deref for RegisteredBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the mapping is valid for its whole length and only this
        // unique owner hands out references into it
        unsafe { std::slice::from_raw_parts(self.mapping.address(), self.mapping.length()) }
    }
}

impl DerefMut for RegisteredBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, exclusive through `&mut self`
        unsafe { std::slice::from_raw_parts_mut(self.mapping.address(), self.mapping.length()) }
    }
}

impl fmt::Debug for RegisteredBuffer {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RegisteredBuffer")
            .field("address", &self.mapping.address)
            .field("length", &self.mapping.length)
            .field("registered", &self.is_registered())
            .finish()
    }
}
