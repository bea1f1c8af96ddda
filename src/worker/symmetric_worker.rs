use super::*;
use crate::env_var::{RuntimeType, XferBenchConfig, XferOp};
use crate::iov::{IovList, XferBenchIov};
use crate::runtime::XferBenchRuntime;
use crate::stream::{Event, ExecStream};
use crate::transport::{GroupId, RdmaResult, SymmetricTransport, INVALID_ARG};

use std::sync::{Arc, OnceLock};

/// Benchmark worker over a symmetric heap transport.
///
/// Every rank allocates the same sequence of regions, so the addresses in
/// the local iov lists also name the peer's regions and no metadata has to
/// be exchanged. The initiator (rank 0) drives puts or gets against rank
/// `(rank + 1) % size` while the target answers every
/// [XferBenchWorker::transfer] with a [XferBenchWorker::poll].
pub struct SymmetricWorker<T: SymmetricTransport> {
    // dropped before the transport so no queued op outlives the heap
    stream: ExecStream,
    transport: T,
    rt: Arc<dyn XferBenchRuntime>,
    config: Arc<XferBenchConfig>,
    role: XferRole,
    group: OnceLock<GroupId>,
}

impl<T: SymmetricTransport> std::fmt::Debug for SymmetricWorker<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SymmetricWorker {{ rank: {}, role: {:?}, group: {:?} }}",
            self.rt.rank(),
            self.role,
            self.group.get()
        )
    }
}

impl<T: SymmetricTransport> SymmetricWorker<T> {
    /// Exits the process if the configuration asks for a runtime other than shmem.
    pub fn new(
        config: Arc<XferBenchConfig>,
        rt: Arc<dyn XferBenchRuntime>,
        transport: T,
    ) -> SymmetricWorker<T> {
        if config.runtime_type != RuntimeType::Shmem {
            fatal!(
                "Runtime {} not supported for symmetric worker",
                config.runtime_type
            );
        }
        let role = XferRole::from_rank(rt.rank());
        tracing::debug!("[{}] symmetric worker created as {:?}", rt.rank(), role);
        SymmetricWorker {
            stream: ExecStream::new(),
            transport,
            rt,
            config,
            role,
            group: OnceLock::new(),
        }
    }

    pub fn stream(&self) -> &ExecStream {
        &self.stream
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &XferBenchConfig {
        &self.config
    }

    /// `None` until [XferBenchWorker::synchronize_start] has completed.
    pub fn group_id(&self) -> Option<&GroupId> {
        self.group.get()
    }

    /// The rank transfers are issued against.
    pub fn peer_rank(&self) -> usize {
        (self.rt.rank() + 1) % self.rt.size()
    }

    fn init_basic_desc(&self, buffer_size: usize, dev_id: usize) -> Option<XferBenchIov> {
        let addr = match self.transport.malloc(buffer_size) {
            Some(addr) => addr,
            None => {
                tracing::error!(
                    "[{}] Failed to allocate {} bytes of symmetric memory for device {}",
                    self.rt.rank(),
                    buffer_size,
                    dev_id
                );
                return None;
            }
        };
        // the region was just carved out of our own heap and stays live until freed
        check_device!(
            unsafe {
                self.stream
                    .memset(addr, self.role.buffer_element(), buffer_size)
            },
            "Failed to set device"
        );
        Some(XferBenchIov::new(addr, buffer_size, dev_id))
    }

    fn barrier_or_exit(&self) {
        if let Err(err) = self.transport.barrier_all() {
            fatal!("[{}] {}", self.rt.rank(), err);
        }
    }

    fn exec_transfer(&self, local: &[IovList], remote: &[IovList], num_iter: usize) -> RdmaResult {
        let tid = 0;
        let (local_iov, remote_iov) = match (local.get(tid), remote.get(tid)) {
            (Some(l), Some(r)) => (l, r),
            _ => return Ok(()),
        };
        if local_iov.len() != remote_iov.len() {
            tracing::error!(
                "[{}] {} local blocks paired with {} remote blocks",
                self.rt.rank(),
                local_iov.len(),
                remote_iov.len()
            );
            return Err(match self.config.op_type {
                XferOp::Write => RdmaError::PutError(INVALID_ARG),
                XferOp::Read => RdmaError::GetError(INVALID_ARG),
            });
        }
        let target_rank = self.peer_rank();

        for _ in 0..num_iter {
            for (local, remote) in local_iov.iter().zip(remote_iov.iter()) {
                match self.config.op_type {
                    XferOp::Write => self.transport.putmem_on_stream(
                        remote.addr,
                        local.addr,
                        local.len,
                        target_rank,
                        &self.stream,
                    )?,
                    XferOp::Read => self.transport.getmem_on_stream(
                        local.addr,
                        remote.addr,
                        local.len,
                        target_rank,
                        &self.stream,
                    )?,
                }
            }
            self.transport.quiet();
        }
        Ok(())
    }
}

impl<T: SymmetricTransport> XferBenchWorker for SymmetricWorker<T> {
    fn rank(&self) -> usize {
        self.rt.rank()
    }

    fn role(&self) -> XferRole {
        self.role
    }

    #[tracing::instrument(skip_all)]
    fn allocate_memory(&self, num_threads: usize) -> Result<IovLists, AllocError> {
        if num_threads != 1 {
            fatal!("Only 1 thread is supported for now, got {}", num_threads);
        }
        let num_devices = self.config.num_devices(self.is_initiator());
        if num_devices == 0 {
            fatal!("At least one device is required per rank");
        }
        let buffer_size = self.config.total_buffer_size / (num_devices * num_threads);
        tracing::debug!(
            "[{}] allocating {} regions of {} bytes",
            self.rt.rank(),
            num_devices * num_threads,
            buffer_size
        );

        let mut failed = 0;
        let mut iov_lists = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            let mut iov_list = Vec::with_capacity(num_devices);
            for dev_id in 0..num_devices {
                match self.init_basic_desc(buffer_size, dev_id) {
                    Some(iov) => iov_list.push(iov),
                    None => failed += 1,
                }
            }
            iov_lists.push(iov_list);
        }

        // no peer may write into a region before its fill has landed
        check_device!(self.stream.synchronize(), "Failed to synchronize");
        self.barrier_or_exit();

        if failed > 0 {
            for iov in iov_lists.iter().flatten() {
                self.transport.free(iov.addr);
            }
            return Err(AllocError::Incomplete {
                requested: num_devices * num_threads,
                failed,
            });
        }
        Ok(iov_lists)
    }

    fn deallocate_memory(&self, iov_lists: IovLists) {
        self.barrier_or_exit();
        for iov in iov_lists.iter().flatten() {
            self.transport.free(iov.addr);
        }
    }

    fn exchange_metadata(&self) -> i32 {
        0
    }

    fn exchange_iov(&self, iov_lists: &IovLists) -> IovLists {
        iov_lists.clone()
    }

    #[tracing::instrument(skip(self, local, remote))]
    fn transfer(&self, block_size: usize, local: &IovLists, remote: &IovLists) -> TransferResult {
        let (skip, num_iter) = self.config.iterations(block_size);
        let start = Event::new();
        let stop = Event::new();

        self.exec_transfer(local, remote, skip)?;

        self.transport.barrier_all()?;
        check_device!(self.stream.synchronize(), "Failed to synchronize");

        check_device!(self.stream.record(&start), "Failed to record start event");
        let measured = self.exec_transfer(local, remote, num_iter);
        check_device!(self.stream.record(&stop), "Failed to record stop event");

        // the peer waits here even when the measured loop failed
        self.transport.barrier_all()?;
        check_device!(
            self.stream.event_synchronize(&stop),
            "Failed to synchronize stop event"
        );
        check_device!(self.stream.synchronize(), "Failed to synchronize");

        let elapsed_ms = check_device!(
            self.stream.elapsed_ms(&start, &stop),
            "Failed to read elapsed time"
        );
        measured?;
        tracing::trace!(
            "[{}] {} iterations of {} byte blocks in {} ms",
            self.rt.rank(),
            num_iter,
            block_size,
            elapsed_ms
        );
        Ok(elapsed_ms as f64 * 1e3)
    }

    fn poll(&self, _block_size: usize) {
        for _ in 0..2 {
            self.barrier_or_exit();
            check_device!(self.stream.synchronize(), "Failed to synchronize");
        }
    }

    #[tracing::instrument(skip_all)]
    fn synchronize_start(&self) -> i32 {
        if let Err(err) = self.transport.init() {
            fatal!("Failed to initialize transport: {}", err);
        }
        let mut group_id = if self.rt.rank() == 0 {
            self.transport.unique_id()
        } else {
            GroupId::default()
        };
        if let Err(err) = self.rt.broadcast_int(group_id.as_ints_mut(), 0) {
            fatal!("Failed to broadcast group id: {}", err);
        }
        if let Err(err) = self.transport.join_group(&group_id) {
            fatal!("Failed to join group {}: {}", group_id, err);
        }
        if self.group.set(group_id).is_err() {
            fatal!("Group was already initialized");
        }
        self.barrier_or_exit();
        tracing::debug!(
            "[{}] joined group {} with {} ranks",
            self.rt.rank(),
            group_id,
            self.transport.num_pes()
        );
        0
    }
}

impl<T: SymmetricTransport> Drop for SymmetricWorker<T> {
    fn drop(&mut self) {
        if self.group.get().is_some() {
            self.transport.finalize();
        }
    }
}
