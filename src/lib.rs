//! A one-sided put/get bandwidth and latency benchmark over a symmetric heap.
//!
//! Two ranks on a node each allocate the same sequence of regions from a
//! symmetric heap. Rank 0, the initiator, then drives timed loops of puts (or
//! gets) against the matching regions of rank 1, the target, while the target
//! meets it at every barrier of the timing protocol.
//!
//! The pieces:
//! - [XferBenchConfig]: run parameters loaded from `XFERBENCH_*` environment variables.
//! - [XferBenchRuntime]: rank discovery, broadcast and barrier between processes ([ShmemRuntime]).
//! - [SymmetricTransport]: the symmetric heap and its one-sided operations ([ShmemTransport]).
//! - [ExecStream]: an ordered execution queue with timing events.
//! - [XferBenchWorker]: allocation, transfer timing and rank synchronization ([SymmetricWorker]).
//!
//! EXAMPLES
//! --------
//!
//! # Two ranks in one process
//! ```no_run
//! use lamellar_xferbench::*;
//! use std::sync::Arc;
//!
//! let config = Arc::new(XferBenchConfig::default());
//! let runtimes = ShmemRuntime::local_world(2, &config).unwrap();
//! let transports = ShmemTransport::local_world(2, &config).unwrap();
//! let handles: Vec<_> = runtimes
//!     .into_iter()
//!     .zip(transports)
//!     .map(|(rt, transport)| {
//!         let config = config.clone();
//!         std::thread::spawn(move || {
//!             let worker = SymmetricWorker::new(config, Arc::new(rt), transport);
//!             worker.synchronize_start();
//!             let local = worker.allocate_memory(1).unwrap();
//!             let remote = worker.exchange_iov(&local);
//!             if worker.is_initiator() {
//!                 let us = worker.transfer(4096, &local, &remote).unwrap();
//!                 println!("{} us", us);
//!             } else {
//!                 worker.poll(4096);
//!             }
//!             worker.deallocate_memory(local);
//!         })
//!     })
//!     .collect();
//! for h in handles {
//!     h.join().unwrap();
//! }
//! ```

#[macro_use]
mod utils;

mod barrier;
pub mod env_var;
pub mod iov;
pub mod runtime;
pub mod stream;
pub mod transport;
pub mod worker;

pub use crate::barrier::{BarrierError, BarrierResult};
pub use crate::env_var::{ConfigError, RuntimeType, XferBenchConfig, XferOp};
pub use crate::iov::{make_block_lists, IovList, IovLists, XferBenchIov};
pub use crate::runtime::{BootstrapError, ShmemRuntime, XferBenchRuntime};
pub use crate::stream::{Event, ExecStream, StreamError};
pub use crate::transport::{
    GroupId, RdmaError, ShmemTransport, SymmetricTransport, TransportError,
};
pub use crate::worker::{
    AllocError, SymmetricWorker, TransferError, TransferResult, XferBenchWorker, XferRole,
};

#[doc(hidden)]
pub use tracing;
