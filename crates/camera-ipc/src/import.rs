use crate::errors::IpcError;
use memmap2::{MmapMut, MmapOptions};
use std::fs::File;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;

/// Turns a shared-memory descriptor received from the camera server into a
/// mapping in this process.
pub trait MemoryImporter: Send {
    fn import(&self, fd: OwnedFd, size: usize) -> Result<MappedRegion, IpcError>;
}

/// A read/write shared mapping. Unmapped, and its allocator handle freed, on
/// drop.
pub struct MappedRegion {
    // Declared before `_handle` so the mapping goes away before the handle
    // backing it is freed.
    mmap: MmapMut,
    ptr: NonNull<u8>,
    _handle: Option<Box<dyn Send + Sync>>,
}

// The mapping is plain shared memory; all cross-thread access goes through
// atomics or slot locks.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    pub fn new(mut mmap: MmapMut) -> Self {
        let ptr = NonNull::new(mmap.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self {
            mmap,
            ptr,
            _handle: None,
        }
    }

    pub fn with_handle(mmap: MmapMut, handle: impl Send + Sync + 'static) -> Self {
        let mut region = Self::new(mmap);
        region._handle = Some(Box::new(handle));
        region
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 4096 } else { size as usize }
}

/// Shared buffers are allocated in whole pages; anything else means the
/// announce is corrupt.
pub fn validate_size(size: usize) -> Result<(), IpcError> {
    let page = page_size();
    if size == 0 || size % page != 0 {
        return Err(IpcError::Map(format!(
            "buffer size {size} is not a non-zero multiple of the {page} byte page size"
        )));
    }
    Ok(())
}

/// Maps the received descriptor directly. Works for dma-buf, memfd and
/// regular file descriptors.
#[derive(Debug, Default, Clone, Copy)]
pub struct DmaBufImporter;

impl MemoryImporter for DmaBufImporter {
    fn import(&self, fd: OwnedFd, size: usize) -> Result<MappedRegion, IpcError> {
        validate_size(size)?;

        let file = File::from(fd);
        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file) }
            .map_err(|e| IpcError::Map(format!("mmap of {size} bytes failed: {e}")))?;

        Ok(MappedRegion::new(mmap))
    }
}

#[cfg(feature = "ion")]
pub use ion::IonImporter;

#[cfg(feature = "ion")]
mod ion {
    use super::{MappedRegion, MemoryImporter, validate_size};
    use crate::errors::IpcError;
    use crate::paths;
    use memmap2::MmapOptions;
    use std::fs::File;
    use std::os::fd::{AsRawFd, OwnedFd};
    use std::path::PathBuf;

    #[repr(C)]
    struct IonFdData {
        handle: i32,
        fd: i32,
    }

    #[repr(C)]
    struct IonHandleData {
        handle: i32,
    }

    nix::ioctl_readwrite!(ion_import, b'I', 5, IonFdData);
    nix::ioctl_readwrite!(ion_free, b'I', 1, IonHandleData);

    /// Imports the descriptor into the legacy ION allocator before mapping
    /// it, the way the camera server's own allocations are shared.
    #[derive(Debug, Clone)]
    pub struct IonImporter {
        device: PathBuf,
    }

    impl Default for IonImporter {
        fn default() -> Self {
            Self {
                device: PathBuf::from(paths::ION_DEVICE_PATH),
            }
        }
    }

    struct IonHandle {
        device: File,
        handle: i32,
        _buffer: File,
    }

    impl Drop for IonHandle {
        fn drop(&mut self) {
            let mut data = IonHandleData {
                handle: self.handle,
            };
            if let Err(e) = unsafe { ion_free(self.device.as_raw_fd(), &mut data) } {
                tracing::error!(handle = self.handle, error = %e, "Failed to free ION handle");
            }
        }
    }

    impl MemoryImporter for IonImporter {
        fn import(&self, fd: OwnedFd, size: usize) -> Result<MappedRegion, IpcError> {
            validate_size(size)?;

            let device = File::open(&self.device).map_err(|e| {
                IpcError::Map(format!("open {} failed: {e}", self.device.display()))
            })?;

            let mut data = IonFdData {
                handle: 0,
                fd: fd.as_raw_fd(),
            };
            unsafe { ion_import(device.as_raw_fd(), &mut data) }
                .map_err(|e| IpcError::Map(format!("ION import failed: {e}")))?;

            // From here on the handle frees itself if mapping fails
            let handle = IonHandle {
                device,
                handle: data.handle,
                _buffer: File::from(fd),
            };

            let mmap = unsafe { MmapOptions::new().len(size).map_mut(&handle._buffer) }
                .map_err(|e| IpcError::Map(format!("ION mmap failed: {e}")))?;

            Ok(MappedRegion::with_handle(mmap, handle))
        }
    }
}
