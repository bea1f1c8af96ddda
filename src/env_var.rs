use serde::Deserialize;

fn default_total_buffer_size() -> usize {
    64 * 1024 * 1024
}

fn default_num_dev() -> usize {
    1
}

fn default_num_threads() -> usize {
    1
}

fn default_num_iter() -> usize {
    1000
}

fn default_warmup_iter() -> usize {
    100
}

fn default_start_block_size() -> usize {
    4 * 1024
}

fn default_max_block_size() -> usize {
    1024 * 1024
}

fn default_batch_size() -> usize {
    1
}

fn default_large_block_size() -> usize {
    1024 * 1024
}

fn default_large_block_iter_factor() -> usize {
    16
}

fn default_deadlock_timeout() -> f64 {
    600.0
}

/// How the ranks of a run discover each other.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// single node, ranks rendezvous through a named shared memory segment
    Shmem,
    Etcd,
    Mpi,
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            RuntimeType::Shmem => write!(f, "shmem"),
            RuntimeType::Etcd => write!(f, "etcd"),
            RuntimeType::Mpi => write!(f, "mpi"),
        }
    }
}

fn default_runtime_type() -> RuntimeType {
    RuntimeType::Shmem
}

/// The one-sided operation issued by every transfer of a run.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum XferOp {
    /// local -> remote
    Write,
    /// remote -> local
    Read,
}

impl std::fmt::Display for XferOp {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            XferOp::Write => write!(f, "WRITE"),
            XferOp::Read => write!(f, "READ"),
        }
    }
}

fn default_op_type() -> XferOp {
    XferOp::Write
}

/// Read-only run parameters, loaded once at startup and shared by reference.
#[derive(Deserialize, Debug, Clone)]
pub struct XferBenchConfig {
    /// bootstrap mode, only `shmem` is supported by the symmetric worker, default: shmem
    #[serde(default = "default_runtime_type")]
    pub runtime_type: RuntimeType,

    /// Total bytes allocated per rank, split evenly across devices and threads, default: 64 MiB
    #[serde(default = "default_total_buffer_size")]
    pub total_buffer_size: usize,

    #[serde(default = "default_num_dev")]
    pub num_initiator_dev: usize,
    #[serde(default = "default_num_dev")]
    pub num_target_dev: usize,

    /// number of transfer issuing threads, only 1 is currently supported
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,

    #[serde(default = "default_num_iter")]
    pub num_iter: usize,
    #[serde(default = "default_warmup_iter")]
    pub warmup_iter: usize,

    /// write | read, default: write
    #[serde(default = "default_op_type")]
    pub op_type: XferOp,

    #[serde(default = "default_start_block_size")]
    pub start_block_size: usize,
    #[serde(default = "default_max_block_size")]
    pub max_block_size: usize,
    #[serde(default = "default_batch_size")]
    pub start_batch_size: usize,
    #[serde(default = "default_batch_size")]
    pub max_batch_size: usize,

    /// Block sizes above this run with fewer iterations, default: 1 MiB
    #[serde(default = "default_large_block_size")]
    pub large_block_size: usize,
    /// divisor applied to warmup and measured iterations for large blocks, default: 16
    #[serde(default = "default_large_block_iter_factor")]
    pub large_block_iter_factor: usize,

    /// bytes of symmetric heap reserved per rank, defaults to the buffer budget plus one MiB
    pub heap_size: Option<usize>,

    /// Seconds a barrier waits before printing a potential deadlock warning, default: 600.0
    #[serde(default = "default_deadlock_timeout")]
    pub deadlock_timeout: f64,
    /// Seconds after which a barrier gives up, default: wait forever
    pub barrier_timeout: Option<f64>,
}

const HEAP_SLACK: usize = 1024 * 1024;

impl Default for XferBenchConfig {
    fn default() -> Self {
        XferBenchConfig {
            runtime_type: default_runtime_type(),
            total_buffer_size: default_total_buffer_size(),
            num_initiator_dev: default_num_dev(),
            num_target_dev: default_num_dev(),
            num_threads: default_num_threads(),
            num_iter: default_num_iter(),
            warmup_iter: default_warmup_iter(),
            op_type: default_op_type(),
            start_block_size: default_start_block_size(),
            max_block_size: default_max_block_size(),
            start_batch_size: default_batch_size(),
            max_batch_size: default_batch_size(),
            large_block_size: default_large_block_size(),
            large_block_iter_factor: default_large_block_iter_factor(),
            heap_size: None,
            deadlock_timeout: default_deadlock_timeout(),
            barrier_timeout: None,
        }
    }
}

impl XferBenchConfig {
    /// Load the configuration from `XFERBENCH_*` environment variables.
    pub fn from_env() -> Result<XferBenchConfig, envy::Error> {
        envy::prefixed("XFERBENCH_").from_env::<XferBenchConfig>()
    }

    /// Load the configuration from `XFERBENCH_*` key/value pairs.
    pub fn from_iter<I>(iter: I) -> Result<XferBenchConfig, envy::Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::prefixed("XFERBENCH_").from_iter::<_, XferBenchConfig>(iter)
    }

    pub fn heap_size(&self) -> usize {
        self.heap_size
            .unwrap_or(self.total_buffer_size + HEAP_SLACK)
    }

    pub fn num_devices(&self, initiator: bool) -> usize {
        if initiator {
            self.num_initiator_dev
        } else {
            self.num_target_dev
        }
    }

    /// Warmup and measured iterations each thread runs for `block_size` blocks.
    pub fn iterations(&self, block_size: usize) -> (usize, usize) {
        let num_threads = self.num_threads.max(1);
        let mut skip = self.warmup_iter / num_threads;
        let mut num_iter = self.num_iter / num_threads;
        if block_size > self.large_block_size {
            let factor = self.large_block_iter_factor.max(1);
            skip /= factor;
            num_iter /= factor;
        }
        (skip, num_iter)
    }

    /// Checks the invariants the allocator and the transfer loop assume but never verify.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, val) in [
            ("total_buffer_size", self.total_buffer_size),
            ("num_initiator_dev", self.num_initiator_dev),
            ("num_target_dev", self.num_target_dev),
            ("num_threads", self.num_threads),
            ("num_iter", self.num_iter),
            ("start_block_size", self.start_block_size),
            ("start_batch_size", self.start_batch_size),
            ("large_block_iter_factor", self.large_block_iter_factor),
        ] {
            if val == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        for num_devices in [self.num_initiator_dev, self.num_target_dev] {
            let parts = num_devices * self.num_threads;
            if self.total_buffer_size % parts != 0 {
                return Err(ConfigError::UnevenBuffer {
                    total_buffer_size: self.total_buffer_size,
                    parts,
                });
            }
        }
        if self.start_block_size > self.max_block_size {
            return Err(ConfigError::Range {
                name: "block_size",
                start: self.start_block_size,
                max: self.max_block_size,
            });
        }
        if self.start_batch_size > self.max_batch_size {
            return Err(ConfigError::Range {
                name: "batch_size",
                start: self.start_batch_size,
                max: self.max_batch_size,
            });
        }
        let num_devices = self.num_initiator_dev.max(self.num_target_dev);
        let region_size = self.total_buffer_size / (num_devices * self.num_threads);
        if self.max_block_size * self.max_batch_size > region_size {
            return Err(ConfigError::BlockTooLarge {
                block_size: self.max_block_size,
                batch_size: self.max_batch_size,
                region_size,
            });
        }
        if self.heap_size() < self.total_buffer_size {
            return Err(ConfigError::HeapTooSmall {
                heap_size: self.heap_size(),
                total_buffer_size: self.total_buffer_size,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    Zero(&'static str),
    UnevenBuffer {
        total_buffer_size: usize,
        parts: usize,
    },
    Range {
        name: &'static str,
        start: usize,
        max: usize,
    },
    BlockTooLarge {
        block_size: usize,
        batch_size: usize,
        region_size: usize,
    },
    HeapTooSmall {
        heap_size: usize,
        total_buffer_size: usize,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ConfigError::Zero(name) => write!(f, "{} must be greater than 0", name),
            ConfigError::UnevenBuffer {
                total_buffer_size,
                parts,
            } => write!(
                f,
                "total_buffer_size {} is not evenly divisible into {} device/thread regions",
                total_buffer_size, parts
            ),
            ConfigError::Range { name, start, max } => {
                write!(f, "start_{} {} is larger than max_{} {}", name, start, name, max)
            }
            ConfigError::BlockTooLarge {
                block_size,
                batch_size,
                region_size,
            } => write!(
                f,
                "max_block_size {} x max_batch_size {} does not fit a {} byte region",
                block_size, batch_size, region_size
            ),
            ConfigError::HeapTooSmall {
                heap_size,
                total_buffer_size,
            } => write!(
                f,
                "heap_size {} is smaller than total_buffer_size {}",
                heap_size, total_buffer_size
            ),
        }
    }
}

impl std::error::Error for ConfigError {}
