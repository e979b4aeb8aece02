//! Executable memory management using mmap.
//!
//! A region moves through three phases, each its own type:
//! `Region<Writable>` (fresh, zero-filled, read+write) → `Region<Filled>`
//! (code copied in, still read+write) → `Region<Sealed>` (read+execute).
//! Transitions consume the previous phase, so a region can never be written
//! after sealing nor executed before it.

use std::io;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use thiserror::Error;
use tracing::debug;

/// Error type for memory operations.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory allocation failed: {0}")]
    AllocationFailed(io::Error),
    #[error("memory protection change failed: {0}")]
    ProtectionFailed(io::Error),
    #[error("invalid memory size: {0} bytes")]
    InvalidSize(usize),
    #[error("executable memory is not supported on this platform")]
    Unsupported,
}

/// Freshly acquired, writable, not executable.
#[derive(Debug)]
pub struct Writable;
/// Holds the final code, still writable, not executable.
#[derive(Debug)]
pub struct Filled;
/// Read+execute only.
#[derive(Debug)]
pub struct Sealed;

/// A page-granular block of memory in phase `P`.
#[derive(Debug)]
pub struct Region<P> {
    ptr: NonNull<u8>,
    /// Mapped size (multiple of the page size).
    size: usize,
    /// Number of code bytes written.
    len: usize,
    _phase: PhantomData<P>,
}

/// Hands out executable regions.
#[derive(Debug, Clone, Copy)]
pub struct ExecutableMemoryArena {
    page_size: usize,
}

impl Default for ExecutableMemoryArena {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutableMemoryArena {
    pub fn new() -> Self {
        Self {
            page_size: page_size(),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Allocate at least `size` bytes of writable, non-executable memory.
    pub fn acquire(&self, size: usize) -> Result<Region<Writable>, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize(size));
        }

        // Round up to page size
        let aligned_size = size
            .checked_add(self.page_size - 1)
            .ok_or(MemoryError::InvalidSize(size))?
            & !(self.page_size - 1);

        let ptr = mmap_alloc(aligned_size)?;
        debug!(requested = size, mapped = aligned_size, "acquired writable region");

        Ok(Region {
            ptr,
            size: aligned_size,
            len: 0,
            _phase: PhantomData,
        })
    }
}

/// Get the page size for the current system.
fn page_size() -> usize {
    #[cfg(unix)]
    {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    }
    #[cfg(not(unix))]
    {
        4096
    }
}

#[cfg(unix)]
fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(MemoryError::AllocationFailed(io::Error::last_os_error()));
    }

    NonNull::new(ptr as *mut u8)
        .ok_or_else(|| MemoryError::AllocationFailed(io::Error::other("mmap returned null")))
}

#[cfg(not(unix))]
fn mmap_alloc(_size: usize) -> Result<NonNull<u8>, MemoryError> {
    Err(MemoryError::Unsupported)
}

#[cfg(unix)]
fn protect_rx(ptr: NonNull<u8>, size: usize) -> Result<(), MemoryError> {
    let result = unsafe {
        libc::mprotect(
            ptr.as_ptr() as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_EXEC,
        )
    };

    if result != 0 {
        return Err(MemoryError::ProtectionFailed(io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn protect_rx(_ptr: NonNull<u8>, _size: usize) -> Result<(), MemoryError> {
    Err(MemoryError::Unsupported)
}

#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
unsafe extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}

#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
unsafe extern "C" {
    fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
}

/// Make freshly written code visible to instruction fetch.
fn flush_icache(ptr: NonNull<u8>, len: usize) {
    #[cfg(all(target_arch = "aarch64", target_os = "linux"))]
    unsafe {
        let begin = ptr.as_ptr() as *mut libc::c_char;
        __clear_cache(begin, begin.add(len));
    }

    #[cfg(all(target_arch = "aarch64", target_os = "macos"))]
    unsafe {
        sys_icache_invalidate(ptr.as_ptr() as *mut libc::c_void, len);
    }

    // x86-64 keeps instruction and data caches coherent.
    #[cfg(not(all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos"))))]
    let _ = (ptr, len);
}

impl<P> Region<P> {
    /// Mapped size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of code bytes written into the region.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// The written code bytes. Every phase is readable.
    pub fn code(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn into_phase<Q>(self, len: usize) -> Region<Q> {
        let this = ManuallyDrop::new(self);
        Region {
            ptr: this.ptr,
            size: this.size,
            len,
            _phase: PhantomData,
        }
    }
}

impl Region<Writable> {
    /// The whole mapped area, zero-filled.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }

    /// Copy `bytes` into the start of the region.
    pub fn fill(self, bytes: &[u8]) -> Result<Region<Filled>, MemoryError> {
        let len = bytes.len();
        self.fill_with(len, |dst| {
            dst[..len].copy_from_slice(bytes);
            Ok(())
        })
    }

    /// Let `write` produce `len` bytes of code directly into the region.
    pub fn fill_with<E>(
        mut self,
        len: usize,
        write: impl FnOnce(&mut [u8]) -> Result<(), E>,
    ) -> Result<Region<Filled>, E>
    where
        E: From<MemoryError>,
    {
        if len > self.size {
            return Err(MemoryError::InvalidSize(len).into());
        }
        write(self.as_mut_slice())?;
        Ok(self.into_phase(len))
    }
}

impl Region<Filled> {
    /// Revoke write access, grant execute, and synchronize the instruction
    /// cache.
    pub fn seal(self) -> Result<Region<Sealed>, MemoryError> {
        protect_rx(self.ptr, self.size)?;
        flush_icache(self.ptr, self.len);
        debug!(len = self.len, mapped = self.size, "sealed region");
        let len = self.len;
        Ok(self.into_phase(len))
    }
}

impl<P> Drop for Region<P> {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

// The region owns its mapping; once sealed it is immutable.
unsafe impl<P> Send for Region<P> {}
unsafe impl Sync for Region<Sealed> {}
