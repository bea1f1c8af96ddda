use enum_dispatch::enum_dispatch;
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::time::{Duration, Instant};

pub(crate) const SEGMENT_ALIGN: usize = 4096;

#[derive(Debug)]
pub enum SegmentError {
    Layout(usize),
    OutOfMemory(usize),
    Shmem(String, ShmemError),
    AttachTimeout(String),
}

impl std::fmt::Display for SegmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SegmentError::Layout(size) => write!(f, "invalid segment layout for {} bytes", size),
            SegmentError::OutOfMemory(size) => {
                write!(f, "unable to allocate a {} byte segment", size)
            }
            SegmentError::Shmem(id, err) => {
                write!(f, "unable to map shared memory {:?}: {}", id, err)
            }
            SegmentError::AttachTimeout(id) => {
                write!(f, "timed out waiting for shared memory {:?} to be created", id)
            }
        }
    }
}

impl std::error::Error for SegmentError {}

#[enum_dispatch]
pub(crate) trait SegmentMemory {
    fn as_ptr(&self) -> *mut u8;
    fn len(&self) -> usize;
}

/// Zeroed memory private to this process, shared between in-process ranks.
pub(crate) struct HostMemory {
    ptr: *mut u8,
    layout: std::alloc::Layout,
}

unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

impl HostMemory {
    fn new(size: usize) -> Result<HostMemory, SegmentError> {
        let layout = std::alloc::Layout::from_size_align(size.max(1), SEGMENT_ALIGN)
            .map_err(|_| SegmentError::Layout(size))?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(SegmentError::OutOfMemory(size));
        }
        Ok(HostMemory { ptr, layout })
    }
}

impl SegmentMemory for HostMemory {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }
    fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr, self.layout) }
    }
}

/// A named mapping visible to every process on the node.
pub(crate) struct SharedMemory {
    shmem: Shmem,
}

unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SegmentMemory for SharedMemory {
    fn as_ptr(&self) -> *mut u8 {
        self.shmem.as_ptr()
    }
    fn len(&self) -> usize {
        self.shmem.len()
    }
}

#[enum_dispatch(SegmentMemory)]
pub(crate) enum Backing {
    HostMemory,
    SharedMemory,
}

/// A contiguous, zero initialized byte range that every rank of a run can address.
pub struct Segment {
    backing: Backing,
    id: String,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Segment {{ id: {:?}, base: {:x}, len: {} }}",
            self.id,
            self.base_addr(),
            self.len()
        )
    }
}

impl Segment {
    /// Allocate a segment only reachable from this process.
    pub fn host(size: usize, id: &str) -> Result<Segment, SegmentError> {
        Ok(Segment {
            backing: HostMemory::new(size)?.into(),
            id: id.to_owned(),
        })
    }

    /// Create (`create == true`) or attach to the node-wide segment named `id`.
    ///
    /// Attaching PEs retry until the creator has mapped the segment or
    /// `timeout` passes.
    pub fn shared(
        size: usize,
        id: &str,
        create: bool,
        timeout: Duration,
    ) -> Result<Segment, SegmentError> {
        let shmem_id = "xferbench_".to_owned() + &size.to_string() + "_" + id;
        let shmem = if create {
            match ShmemConf::new().size(size).os_id(&shmem_id).create() {
                Ok(m) => {
                    tracing::debug!("created {:?}", shmem_id);
                    m
                }
                Err(ShmemError::LinkExists) | Err(ShmemError::MappingIdExists) => {
                    // stale mapping from an earlier run with the same id
                    let mut m = ShmemConf::new()
                        .os_id(&shmem_id)
                        .open()
                        .map_err(|e| SegmentError::Shmem(shmem_id.clone(), e))?;
                    if m.len() < size {
                        return Err(SegmentError::Layout(size));
                    }
                    m.set_owner(true);
                    unsafe { std::ptr::write_bytes(m.as_ptr(), 0, m.len()) };
                    tracing::debug!("reset {:?}", shmem_id);
                    m
                }
                Err(e) => return Err(SegmentError::Shmem(shmem_id, e)),
            }
        } else {
            let start = Instant::now();
            loop {
                match ShmemConf::new().os_id(&shmem_id).open() {
                    Ok(m) if m.len() >= size => {
                        tracing::debug!("attached {:?}", shmem_id);
                        break m;
                    }
                    Ok(_) | Err(_) if start.elapsed() < timeout => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Ok(_) => return Err(SegmentError::AttachTimeout(shmem_id)),
                    Err(e) => return Err(SegmentError::Shmem(shmem_id, e)),
                }
            }
        };
        Ok(Segment {
            backing: SharedMemory { shmem }.into(),
            id: id.to_owned(),
        })
    }

    pub fn base_addr(&self) -> usize {
        self.backing.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.backing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn contains(&self, addr: usize, len: usize) -> bool {
        self.base_addr() <= addr && addr + len <= self.base_addr() + self.len()
    }

    /// View the `usize` word at byte `offset` as an atomic.
    ///
    /// # Safety
    /// `offset` must be word aligned and lie inside the segment, and the word
    /// must only ever be accessed atomically.
    pub(crate) unsafe fn atomic_at(&self, offset: usize) -> &std::sync::atomic::AtomicUsize {
        debug_assert!(offset % std::mem::size_of::<usize>() == 0);
        debug_assert!(offset + std::mem::size_of::<usize>() <= self.len());
        &*(self.backing.as_ptr().add(offset) as *const std::sync::atomic::AtomicUsize)
    }
}
