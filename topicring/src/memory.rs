use crate::error::{RegistryError, Result};
use core::ptr::NonNull;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, mmap_anonymous, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::fs::File;
use std::num::NonZero;
use std::os::fd::OwnedFd;
use tracing::{debug, warn};

/// A `MAP_SHARED` mapping of a whole segment.
pub(crate) struct SharedMemory {
    ptr: NonNull<u8>,
    size: usize,
    writable: bool,
    unlink: Option<String>,
}

impl SharedMemory {
    /// Creates a new named segment of `size` bytes. The object is unlinked
    /// again on drop unless [`SharedMemory::persist`] is called.
    pub(crate) fn create(name: &str, size: usize) -> Result<Self> {
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR | OFlag::O_CLOEXEC,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|errno| match errno {
            Errno::EEXIST => RegistryError::AlreadyExists(name.to_string()),
            other => RegistryError::Mmap(other),
        })?;

        let mapped = ftruncate(&fd, size as i64)
            .map_err(RegistryError::Mmap)
            .and_then(|()| map_fd(&fd, size, true));

        match mapped {
            Ok(ptr) => {
                debug!(name, size, "created shared segment");
                Ok(SharedMemory {
                    ptr,
                    size,
                    writable: true,
                    unlink: Some(name.to_string()),
                })
            }
            Err(e) => {
                let _ = shm_unlink(name);
                Err(e)
            }
        }
    }

    /// Maps an anonymous shared region. Visible to this process and to
    /// children forked after the call.
    pub(crate) fn anonymous(size: usize) -> Result<Self> {
        let length = NonZero::new(size).ok_or(RegistryError::Mmap(Errno::EINVAL))?;
        let ptr = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED | MapFlags::MAP_ANONYMOUS,
            )?
        };

        Ok(SharedMemory {
            ptr: ptr.cast(),
            size,
            writable: true,
            unlink: None,
        })
    }

    /// Maps an existing named segment in full.
    pub(crate) fn open(name: &str, writable: bool) -> Result<Self> {
        let flags = if writable {
            OFlag::O_RDWR
        } else {
            OFlag::O_RDONLY
        };
        let fd = shm_open(name, flags | OFlag::O_CLOEXEC, Mode::empty()).map_err(
            |errno| match errno {
                Errno::ENOENT => RegistryError::NotFound(name.to_string()),
                other => RegistryError::Mmap(other),
            },
        )?;

        let file = File::from(fd);
        let size = file.metadata()?.len() as usize;
        if size == 0 {
            return Err(RegistryError::CorruptHeader(format!(
                "segment {name} is empty"
            )));
        }

        let fd = OwnedFd::from(file);
        let ptr = map_fd(&fd, size, writable)?;
        debug!(name, size, writable, "mapped shared segment");

        Ok(SharedMemory {
            ptr,
            size,
            writable,
            unlink: None,
        })
    }

    pub(crate) fn persist(&mut self) {
        self.unlink = None;
    }

    pub(crate) fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn writable(&self) -> bool {
        self.writable
    }
}

fn map_fd(fd: &OwnedFd, size: usize, writable: bool) -> Result<NonNull<u8>> {
    let length = NonZero::new(size).ok_or(RegistryError::Mmap(Errno::EINVAL))?;
    let prot = if writable {
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
    } else {
        ProtFlags::PROT_READ
    };
    let ptr = unsafe { mmap(None, length, prot, MapFlags::MAP_SHARED, fd, 0)? };
    Ok(ptr.cast())
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.cast(), self.size);
        }
        if let Some(name) = self.unlink.take() {
            if let Err(e) = shm_unlink(name.as_str()) {
                warn!(name, error = %e, "failed to unlink shared segment");
            }
        }
    }
}

unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}
