//! The one-sided transport capability the benchmark drives.
//!
//! A transport owns a symmetric heap: every PE allocates the same sequence of
//! buffers and gets the same layout, so the local address of a buffer names
//! the matching buffer on any other PE. Puts and gets are issued onto an
//! [ExecStream] and complete asynchronously; [SymmetricTransport::quiet]
//! waits for everything this PE has issued.

pub(crate) mod heap_alloc;
pub(crate) mod segment;
pub(crate) mod shmem_transport;

pub use segment::{Segment, SegmentError};
pub use shmem_transport::ShmemTransport;

use crate::barrier::{BarrierError, BarrierResult};
use crate::stream::ExecStream;

/// error code for an operation issued with an invalid PE or address range
pub const INVALID_ARG: i32 = -22;
/// error code for an operation issued before the transport joined its group
pub const NOT_INITIALIZED: i32 = -19;

pub const GROUP_ID_INTS: usize = 4;

/// Identifies the group of transport instances that share one symmetric heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupId(pub [i32; GROUP_ID_INTS]);

impl GroupId {
    pub fn random() -> GroupId {
        GroupId(rand::random::<[i32; GROUP_ID_INTS]>())
    }

    pub fn as_ints(&self) -> &[i32] {
        &self.0
    }

    pub fn as_ints_mut(&mut self) -> &mut [i32] {
        &mut self.0
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for word in self.0.iter() {
            write!(f, "{:08x}", *word as u32)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdmaError {
    PutError(i32),
    GetError(i32),
}

impl RdmaError {
    /// The negative status code reported by the transport.
    pub fn code(&self) -> i32 {
        match self {
            RdmaError::PutError(code) | RdmaError::GetError(code) => *code,
        }
    }
}

impl std::fmt::Display for RdmaError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            RdmaError::PutError(err_no) => write!(f, "put error: {}", err_no),
            RdmaError::GetError(err_no) => write!(f, "get error: {}", err_no),
        }
    }
}

impl std::error::Error for RdmaError {}

pub type RdmaResult = Result<(), RdmaError>;

#[derive(Debug)]
pub enum TransportError {
    InvalidPe { my_pe: usize, num_pes: usize },
    NotInitialized,
    AlreadyJoined,
    GroupMismatch { expected: GroupId, found: GroupId },
    Segment(SegmentError),
    Barrier(BarrierError),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TransportError::InvalidPe { my_pe, num_pes } => {
                write!(f, "pe {} is not part of a {} pe group", my_pe, num_pes)
            }
            TransportError::NotInitialized => write!(f, "transport has not been initialized"),
            TransportError::AlreadyJoined => write!(f, "transport already joined a group"),
            TransportError::GroupMismatch { expected, found } => {
                write!(f, "group id {} does not match {}", found, expected)
            }
            TransportError::Segment(err) => write!(f, "{}", err),
            TransportError::Barrier(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<SegmentError> for TransportError {
    fn from(err: SegmentError) -> TransportError {
        TransportError::Segment(err)
    }
}

impl From<BarrierError> for TransportError {
    fn from(err: BarrierError) -> TransportError {
        TransportError::Barrier(err)
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

pub trait SymmetricTransport: Send + Sync {
    /// Local initialization, before any group membership exists.
    fn init(&self) -> TransportResult<()>;
    /// A fresh group identifier; only called on the root PE.
    fn unique_id(&self) -> GroupId;
    /// Attach to the symmetric heap shared by every PE holding `group_id`.
    fn join_group(&self, group_id: &GroupId) -> TransportResult<()>;
    fn my_pe(&self) -> usize;
    fn num_pes(&self) -> usize;

    /// Allocate `size` bytes from the symmetric heap, `None` if exhausted.
    fn malloc(&self, size: usize) -> Option<usize>;
    fn free(&self, addr: usize);

    /// Copy `len` bytes from local `src` into `pe`'s copy of symmetric address `dst`.
    fn putmem_on_stream(
        &self,
        dst: usize,
        src: usize,
        len: usize,
        pe: usize,
        stream: &ExecStream,
    ) -> RdmaResult;
    /// Copy `len` bytes from `pe`'s copy of symmetric address `src` into local `dst`.
    fn getmem_on_stream(
        &self,
        dst: usize,
        src: usize,
        len: usize,
        pe: usize,
        stream: &ExecStream,
    ) -> RdmaResult;
    /// Wait until every put and get issued by this PE has completed.
    fn quiet(&self);
    /// Collective barrier across every PE of the group.
    fn barrier_all(&self) -> BarrierResult;
    fn finalize(&self);
}
