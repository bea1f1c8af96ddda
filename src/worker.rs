//! The interface a benchmark harness drives, independent of the transport.

pub(crate) mod symmetric_worker;

pub use symmetric_worker::SymmetricWorker;

use crate::barrier::BarrierError;
use crate::iov::IovLists;
use crate::transport::RdmaError;

/// byte pattern the initiator fills its regions with
pub const INITIATOR_BUFFER_ELEMENT: u8 = 0xbb;
/// byte pattern the target fills its regions with
pub const TARGET_BUFFER_ELEMENT: u8 = 0xaa;

/// error code reported when a barrier inside a transfer times out
pub const BARRIER_TIMEOUT: i32 = -110;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferRole {
    Initiator,
    Target,
}

impl XferRole {
    /// rank 0 initiates, every other rank is a target
    pub fn from_rank(rank: usize) -> XferRole {
        if rank == 0 {
            XferRole::Initiator
        } else {
            XferRole::Target
        }
    }

    pub fn buffer_element(&self) -> u8 {
        match self {
            XferRole::Initiator => INITIATOR_BUFFER_ELEMENT,
            XferRole::Target => TARGET_BUFFER_ELEMENT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// `failed` of the `requested` regions could not be allocated; the rest were released
    Incomplete { requested: usize, failed: usize },
}

impl std::fmt::Display for AllocError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            AllocError::Incomplete { requested, failed } => write!(
                f,
                "failed to allocate {} of {} symmetric memory regions",
                failed, requested
            ),
        }
    }
}

impl std::error::Error for AllocError {}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransferError {
    Transport(RdmaError),
    Barrier(BarrierError),
}

impl TransferError {
    /// The negative outcome code of a failed transfer.
    pub fn code(&self) -> i32 {
        match self {
            TransferError::Transport(err) => err.code(),
            TransferError::Barrier(_) => BARRIER_TIMEOUT,
        }
    }
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TransferError::Transport(err) => write!(f, "transfer failed: {}", err),
            TransferError::Barrier(err) => write!(f, "transfer failed: {}", err),
        }
    }
}

impl std::error::Error for TransferError {}

impl From<RdmaError> for TransferError {
    fn from(err: RdmaError) -> TransferError {
        TransferError::Transport(err)
    }
}

impl From<BarrierError> for TransferError {
    fn from(err: BarrierError) -> TransferError {
        TransferError::Barrier(err)
    }
}

/// Elapsed microseconds of the measured window, or why the transfer failed.
pub type TransferResult = Result<f64, TransferError>;

pub trait XferBenchWorker {
    fn rank(&self) -> usize;
    fn role(&self) -> XferRole;
    fn is_initiator(&self) -> bool {
        self.role() == XferRole::Initiator
    }

    /// Collective. Allocates and fills one region per device for each of `num_threads` threads.
    fn allocate_memory(&self, num_threads: usize) -> Result<IovLists, AllocError>;
    /// Collective. Releases every region once all ranks have arrived.
    fn deallocate_memory(&self, iov_lists: IovLists);
    fn exchange_metadata(&self) -> i32;
    fn exchange_iov(&self, iov_lists: &IovLists) -> IovLists;
    /// Collective with [XferBenchWorker::poll] on the peer.
    fn transfer(&self, block_size: usize, local: &IovLists, remote: &IovLists) -> TransferResult;
    /// The target side of [XferBenchWorker::transfer].
    fn poll(&self, block_size: usize);
    fn synchronize_start(&self) -> i32;
}
