//! Process bootstrap: rank discovery, broadcast and a bootstrap barrier.

use crate::barrier::{Barrier, BarrierError};
use crate::env_var::XferBenchConfig;
use crate::transport::{Segment, SegmentError};
use crate::utils::env_usize;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Maximum number of ints a single broadcast can carry.
pub const BCAST_MAX_INTS: usize = 64;

const WORD: usize = std::mem::size_of::<usize>();

#[derive(Debug)]
pub enum BootstrapError {
    Env(&'static str, std::num::ParseIntError),
    InvalidRank { rank: usize, size: usize },
    InvalidRoot { root: usize, size: usize },
    BroadcastTooLarge(usize),
    Timeout(f64),
    Segment(SegmentError),
    Barrier(BarrierError),
}

impl std::fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            BootstrapError::Env(name, err) => write!(f, "invalid value for {}: {}", name, err),
            BootstrapError::InvalidRank { rank, size } => {
                write!(f, "rank {} is out of range for {} ranks", rank, size)
            }
            BootstrapError::InvalidRoot { root, size } => {
                write!(f, "broadcast root {} is out of range for {} ranks", root, size)
            }
            BootstrapError::BroadcastTooLarge(len) => write!(
                f,
                "broadcast of {} ints exceeds the {} int mailbox",
                len, BCAST_MAX_INTS
            ),
            BootstrapError::Timeout(waited) => {
                write!(f, "broadcast timed out after {:.3} seconds", waited)
            }
            BootstrapError::Segment(err) => write!(f, "{}", err),
            BootstrapError::Barrier(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for BootstrapError {}

impl From<SegmentError> for BootstrapError {
    fn from(err: SegmentError) -> BootstrapError {
        BootstrapError::Segment(err)
    }
}

impl From<BarrierError> for BootstrapError {
    fn from(err: BarrierError) -> BootstrapError {
        BootstrapError::Barrier(err)
    }
}

pub type BootstrapResult<T> = Result<T, BootstrapError>;

/// What the benchmark needs from whatever launched its ranks.
pub trait XferBenchRuntime: Send + Sync {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    /// Overwrite `buf` on every rank with the contents of `buf` on `root`.
    fn broadcast_int(&self, buf: &mut [i32], root: usize) -> BootstrapResult<()>;
    fn barrier(&self) -> BootstrapResult<()>;
}

// control segment layout, in words:
// [ready | barrier slots (size) | bcast seq | bcast mailbox (BCAST_MAX_INTS)]
struct Layout {
    barrier: usize,
    seq: usize,
    mailbox: usize,
    len: usize,
}

impl Layout {
    fn new(size: usize) -> Layout {
        let barrier = WORD;
        let seq = barrier + Barrier::footprint(size);
        let mailbox = seq + WORD;
        Layout {
            barrier,
            seq,
            mailbox,
            len: mailbox + BCAST_MAX_INTS * WORD,
        }
    }
}

/// Single node bootstrap, ranks meet in a small shared control segment.
pub struct ShmemRuntime {
    rank: usize,
    size: usize,
    job_id: usize,
    segment: Arc<Segment>,
    layout: Layout,
    barrier: Barrier,
    bcast_epoch: AtomicUsize,
    timeout: Option<f64>,
}

impl std::fmt::Debug for ShmemRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ShmemRuntime {{ rank: {}, size: {}, job_id: {} }}",
            self.rank, self.size, self.job_id
        )
    }
}

impl ShmemRuntime {
    fn with_segment(
        rank: usize,
        size: usize,
        job_id: usize,
        segment: Arc<Segment>,
        config: &XferBenchConfig,
    ) -> ShmemRuntime {
        let layout = Layout::new(size);
        let barrier = Barrier::new(
            rank,
            size,
            segment.clone(),
            layout.barrier,
            config.deadlock_timeout,
            config.barrier_timeout,
        );
        ShmemRuntime {
            rank,
            size,
            job_id,
            segment,
            layout,
            barrier,
            bcast_epoch: AtomicUsize::new(0),
            timeout: config.barrier_timeout,
        }
    }

    /// Join the run described by `XFERBENCH_PE_ID`, `XFERBENCH_NUM_PES` and
    /// `XFERBENCH_JOB_ID` (defaults: 0, 1, 0).
    pub fn from_env(config: &XferBenchConfig) -> BootstrapResult<ShmemRuntime> {
        let size = env_usize("XFERBENCH_NUM_PES", 1)
            .map_err(|e| BootstrapError::Env("XFERBENCH_NUM_PES", e))?;
        let rank = env_usize("XFERBENCH_PE_ID", 0)
            .map_err(|e| BootstrapError::Env("XFERBENCH_PE_ID", e))?;
        let job_id = env_usize("XFERBENCH_JOB_ID", 0)
            .map_err(|e| BootstrapError::Env("XFERBENCH_JOB_ID", e))?;
        ShmemRuntime::new(rank, size, job_id, config)
    }

    pub fn new(
        rank: usize,
        size: usize,
        job_id: usize,
        config: &XferBenchConfig,
    ) -> BootstrapResult<ShmemRuntime> {
        if rank >= size {
            return Err(BootstrapError::InvalidRank { rank, size });
        }
        let layout = Layout::new(size);
        let timeout = Duration::from_secs_f64(config.barrier_timeout.unwrap_or(config.deadlock_timeout));
        let segment = Arc::new(Segment::shared(
            layout.len,
            &format!("rt_{}", job_id),
            rank == 0,
            timeout,
        )?);
        let ready = unsafe { segment.atomic_at(0) };
        if rank == 0 {
            ready.store(job_id + 1, Ordering::SeqCst);
        } else {
            let start = Instant::now();
            while ready.load(Ordering::SeqCst) != job_id + 1 {
                if start.elapsed() > timeout {
                    return Err(BootstrapError::Timeout(start.elapsed().as_secs_f64()));
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        tracing::debug!("[{}] bootstrap segment ready for job {}", rank, job_id);
        Ok(ShmemRuntime::with_segment(rank, size, job_id, segment, config))
    }

    /// `size` ranks living in this process, one per thread.
    pub fn local_world(size: usize, config: &XferBenchConfig) -> BootstrapResult<Vec<ShmemRuntime>> {
        let segment = Arc::new(Segment::host(Layout::new(size).len, "rt_local")?);
        Ok((0..size)
            .map(|rank| ShmemRuntime::with_segment(rank, size, 0, segment.clone(), config))
            .collect())
    }

    fn word(&self, offset: usize) -> &AtomicUsize {
        unsafe { self.segment.atomic_at(offset) }
    }

    fn wait_for_seq(&self, epoch: usize) -> BootstrapResult<()> {
        let start = Instant::now();
        let seq = self.word(self.layout.seq);
        while seq.load(Ordering::SeqCst) < epoch {
            if let Some(timeout) = self.timeout {
                let waited = start.elapsed().as_secs_f64();
                if waited > timeout {
                    return Err(BootstrapError::Timeout(waited));
                }
            }
            std::thread::yield_now();
        }
        Ok(())
    }
}

impl XferBenchRuntime for ShmemRuntime {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn broadcast_int(&self, buf: &mut [i32], root: usize) -> BootstrapResult<()> {
        if root >= self.size {
            return Err(BootstrapError::InvalidRoot {
                root,
                size: self.size,
            });
        }
        if buf.len() > BCAST_MAX_INTS {
            return Err(BootstrapError::BroadcastTooLarge(buf.len()));
        }
        let epoch = self.bcast_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if self.rank == root {
            for (i, val) in buf.iter().enumerate() {
                self.word(self.layout.mailbox + i * WORD)
                    .store(*val as u32 as usize, Ordering::SeqCst);
            }
            self.word(self.layout.seq).store(epoch, Ordering::SeqCst);
        } else {
            self.wait_for_seq(epoch)?;
            for (i, val) in buf.iter_mut().enumerate() {
                *val = self
                    .word(self.layout.mailbox + i * WORD)
                    .load(Ordering::SeqCst) as u32 as i32;
            }
        }
        // the mailbox can only be reused once every rank has read it
        self.barrier.barrier()?;
        Ok(())
    }

    fn barrier(&self) -> BootstrapResult<()> {
        Ok(self.barrier.barrier()?)
    }
}
