use super::heap_alloc::BTreeAlloc;
use super::segment::{Segment, SEGMENT_ALIGN};
use super::*;
use crate::barrier::Barrier;
use crate::env_var::XferBenchConfig;
use crate::utils::round_up;

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

const HEAP_ALIGN: usize = 64;

// segment layout: [barrier slots | pe 0 heap | pe 1 heap | ... ]
fn control_size(num_pes: usize) -> usize {
    round_up(Barrier::footprint(num_pes), SEGMENT_ALIGN)
}

fn segment_size(num_pes: usize, heap_size: usize) -> usize {
    control_size(num_pes) + num_pes * heap_size
}

enum SegmentSource {
    /// all PEs live in this process and share one host segment
    Local(Arc<Segment>, GroupId),
    /// one PE per process, the segment is created by pe 0 at join time
    Shared,
}

struct SymmetricHeap {
    segment: Arc<Segment>,
    heap_base: usize, //address of pe 0's heap
    alloc: BTreeAlloc,
    barrier: Barrier,
}

#[derive(Debug, Default)]
struct Completions {
    completed: Mutex<usize>,
    cvar: Condvar,
}

/// Symmetric heap transport for PEs on a single node.
///
/// The heap of every PE lives in one segment, so a put or get is a copy
/// between two PEs' heaps executed on the issuer's stream.
pub struct ShmemTransport {
    my_pe: usize,
    num_pes: usize,
    heap_size: usize,
    source: SegmentSource,
    deadlock_timeout: f64,
    barrier_timeout: Option<f64>,
    initialized: AtomicBool,
    heap: OnceLock<SymmetricHeap>,
    issued: AtomicUsize,
    completions: Arc<Completions>,
}

impl std::fmt::Debug for ShmemTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ShmemTransport {{ my_pe: {}, num_pes: {}, heap_size: {}, joined: {}, issued: {:?} }}",
            self.my_pe,
            self.num_pes,
            self.heap_size,
            self.heap.get().is_some(),
            self.issued
        )
    }
}

impl ShmemTransport {
    fn with_source(
        my_pe: usize,
        num_pes: usize,
        heap_size: usize,
        source: SegmentSource,
        deadlock_timeout: f64,
        barrier_timeout: Option<f64>,
    ) -> ShmemTransport {
        ShmemTransport {
            my_pe,
            num_pes,
            heap_size: round_up(heap_size, SEGMENT_ALIGN),
            source,
            deadlock_timeout,
            barrier_timeout,
            initialized: AtomicBool::new(false),
            heap: OnceLock::new(),
            issued: AtomicUsize::new(0),
            completions: Arc::new(Completions::default()),
        }
    }

    /// A transport for PE `my_pe` of a multi-process run on this node.
    pub fn new(my_pe: usize, num_pes: usize, config: &XferBenchConfig) -> ShmemTransport {
        ShmemTransport::with_source(
            my_pe,
            num_pes,
            config.heap_size(),
            SegmentSource::Shared,
            config.deadlock_timeout,
            config.barrier_timeout,
        )
    }

    /// `num_pes` transports sharing one in-process heap, one per thread.
    pub fn local_world(
        num_pes: usize,
        config: &XferBenchConfig,
    ) -> TransportResult<Vec<ShmemTransport>> {
        let heap_size = round_up(config.heap_size(), SEGMENT_ALIGN);
        let group_id = GroupId::random();
        let segment = Arc::new(Segment::host(
            segment_size(num_pes, heap_size),
            &group_id.to_string(),
        )?);
        Ok((0..num_pes)
            .map(|pe| {
                ShmemTransport::with_source(
                    pe,
                    num_pes,
                    heap_size,
                    SegmentSource::Local(segment.clone(), group_id),
                    config.deadlock_timeout,
                    config.barrier_timeout,
                )
            })
            .collect())
    }

    fn heap(&self) -> Option<&SymmetricHeap> {
        self.heap.get()
    }

    fn pe_heap_base(&self, heap: &SymmetricHeap, pe: usize) -> usize {
        heap.heap_base + pe * self.heap_size
    }

    fn in_my_heap(&self, heap: &SymmetricHeap, addr: usize, len: usize) -> bool {
        let base = self.pe_heap_base(heap, self.my_pe);
        base <= addr && addr + len <= base + self.heap_size
    }

    /// translate a symmetric address of this PE into the same object on `pe`
    fn remote_addr(&self, heap: &SymmetricHeap, pe: usize, addr: usize) -> usize {
        addr - self.pe_heap_base(heap, self.my_pe) + self.pe_heap_base(heap, pe)
    }

    /// Bytes currently allocated from this PE's heap.
    pub fn occupied(&self) -> usize {
        self.heap().map(|heap| heap.alloc.occupied()).unwrap_or(0)
    }

    pub fn ops_issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    fn attach(&self, group_id: &GroupId) -> TransportResult<Arc<Segment>> {
        match &self.source {
            SegmentSource::Local(segment, local_id) => {
                if local_id != group_id {
                    return Err(TransportError::GroupMismatch {
                        expected: *local_id,
                        found: *group_id,
                    });
                }
                Ok(segment.clone())
            }
            SegmentSource::Shared => {
                let timeout = self.barrier_timeout.unwrap_or(self.deadlock_timeout);
                Ok(Arc::new(Segment::shared(
                    segment_size(self.num_pes, self.heap_size),
                    &group_id.to_string(),
                    self.my_pe == 0,
                    Duration::from_secs_f64(timeout),
                )?))
            }
        }
    }

    // validates the ranges and enqueues the copy, `dst`/`src` are real addresses
    fn issue_copy(
        &self,
        heap: &SymmetricHeap,
        dst: usize,
        src: usize,
        len: usize,
        stream: &ExecStream,
    ) -> Result<(), i32> {
        if !heap.segment.contains(dst, len) || !heap.segment.contains(src, len) {
            return Err(INVALID_ARG);
        }
        let segment = heap.segment.clone();
        let completions = self.completions.clone();
        self.issued.fetch_add(1, Ordering::SeqCst);
        let res = stream.enqueue(move || {
            let _keep_alive = segment;
            unsafe { std::ptr::copy(src as *const u8, dst as *mut u8, len) };
            let mut completed = completions.completed.lock();
            *completed += 1;
            completions.cvar.notify_all();
        });
        if res.is_err() {
            self.issued.fetch_sub(1, Ordering::SeqCst);
            return Err(NOT_INITIALIZED);
        }
        Ok(())
    }

    fn check_args(&self, addr: usize, len: usize, pe: usize) -> Result<&SymmetricHeap, i32> {
        let heap = self.heap().ok_or(NOT_INITIALIZED)?;
        if pe >= self.num_pes || !self.in_my_heap(heap, addr, len) {
            return Err(INVALID_ARG);
        }
        Ok(heap)
    }
}

impl SymmetricTransport for ShmemTransport {
    fn init(&self) -> TransportResult<()> {
        if self.my_pe >= self.num_pes {
            return Err(TransportError::InvalidPe {
                my_pe: self.my_pe,
                num_pes: self.num_pes,
            });
        }
        self.initialized.store(true, Ordering::SeqCst);
        tracing::debug!(
            "[{}] shmem transport initialized, heap {} bytes per pe",
            self.my_pe,
            self.heap_size
        );
        Ok(())
    }

    fn unique_id(&self) -> GroupId {
        match &self.source {
            SegmentSource::Local(_, group_id) => *group_id,
            SegmentSource::Shared => GroupId::random(),
        }
    }

    fn join_group(&self, group_id: &GroupId) -> TransportResult<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(TransportError::NotInitialized);
        }
        if self.heap.get().is_some() {
            return Err(TransportError::AlreadyJoined);
        }
        let segment = self.attach(group_id)?;
        let heap_base = segment.base_addr() + control_size(self.num_pes);
        let my_base = heap_base + self.my_pe * self.heap_size;
        let heap = SymmetricHeap {
            alloc: BTreeAlloc::new(format!("pe{}", self.my_pe), my_base, self.heap_size),
            barrier: Barrier::new(
                self.my_pe,
                self.num_pes,
                segment.clone(),
                0,
                self.deadlock_timeout,
                self.barrier_timeout,
            ),
            heap_base,
            segment,
        };
        self.heap
            .set(heap)
            .map_err(|_| TransportError::AlreadyJoined)?;
        tracing::debug!("[{}] joined group {}", self.my_pe, group_id);
        Ok(())
    }

    fn my_pe(&self) -> usize {
        self.my_pe
    }

    fn num_pes(&self) -> usize {
        self.num_pes
    }

    fn malloc(&self, size: usize) -> Option<usize> {
        let heap = self.heap()?;
        let addr = heap.alloc.try_malloc(round_up(size, HEAP_ALIGN));
        if addr.is_none() {
            tracing::debug!(
                "[{}] {} heap exhausted: requested {} bytes, {} of {} in use",
                self.my_pe,
                heap.alloc.id(),
                size,
                heap.alloc.occupied(),
                self.heap_size
            );
        }
        addr
    }

    fn free(&self, addr: usize) {
        match self.heap() {
            Some(heap) if heap.alloc.contains(addr) => {
                if heap.alloc.free(addr).is_none() {
                    tracing::error!("[{}] illegal free of {:x}", self.my_pe, addr);
                }
            }
            _ => tracing::error!("[{}] free of unknown address {:x}", self.my_pe, addr),
        }
    }

    fn putmem_on_stream(
        &self,
        dst: usize,
        src: usize,
        len: usize,
        pe: usize,
        stream: &ExecStream,
    ) -> RdmaResult {
        let heap = self.check_args(dst, len, pe).map_err(RdmaError::PutError)?;
        let remote_dst = self.remote_addr(heap, pe, dst);
        self.issue_copy(heap, remote_dst, src, len, stream)
            .map_err(RdmaError::PutError)
    }

    fn getmem_on_stream(
        &self,
        dst: usize,
        src: usize,
        len: usize,
        pe: usize,
        stream: &ExecStream,
    ) -> RdmaResult {
        let heap = self.check_args(src, len, pe).map_err(RdmaError::GetError)?;
        let remote_src = self.remote_addr(heap, pe, src);
        self.issue_copy(heap, dst, remote_src, len, stream)
            .map_err(RdmaError::GetError)
    }

    fn quiet(&self) {
        let issued = self.issued.load(Ordering::SeqCst);
        let mut completed = self.completions.completed.lock();
        while *completed < issued {
            self.completions.cvar.wait(&mut completed);
        }
    }

    fn barrier_all(&self) -> crate::barrier::BarrierResult {
        match self.heap() {
            Some(heap) => heap.barrier.barrier(),
            None => {
                tracing::warn!("[{}] barrier before joining a group", self.my_pe);
                Ok(())
            }
        }
    }

    fn finalize(&self) {
        self.quiet();
        let occupied = self.occupied();
        if occupied > 0 {
            tracing::warn!(
                "[{}] finalizing with {} bytes still allocated",
                self.my_pe,
                occupied
            );
        }
        self.initialized.store(false, Ordering::SeqCst);
        tracing::debug!("[{}] shmem transport finalized", self.my_pe);
    }
}
