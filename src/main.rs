use lamellar_xferbench::iov::total_bytes;
use lamellar_xferbench::*;

use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn print_header(config: &XferBenchConfig, num_pes: usize) {
    println!("xferbench: {} over {} ranks", config.op_type, num_pes);
    println!(
        "{:<20}{:<15}{:<20}{:<15}",
        "Block Size (B)", "Batch Size", "Avg Lat. (us)", "B/W (GB/Sec)"
    );
    println!("{}", "-".repeat(70));
}

fn print_row(block_size: usize, batch_size: usize, bytes_per_iter: usize, num_iter: usize, us: f64) {
    let (avg_lat, gbps) = if num_iter == 0 || us <= 0.0 {
        (0.0, 0.0)
    } else {
        (
            us / num_iter as f64,
            (bytes_per_iter * num_iter) as f64 / (us * 1e3),
        )
    };
    println!(
        "{:<20}{:<15}{:<20.3}{:<15.6}",
        block_size, batch_size, avg_lat, gbps
    );
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match XferBenchConfig::from_env() {
        Ok(config) => config,
        Err(err) => fatal!("Invalid configuration: {}", err),
    };
    if let Err(err) = config.validate() {
        fatal!("Invalid configuration: {}", err);
    }
    let config = Arc::new(config);

    let rt = ShmemRuntime::from_env(&config)
        .map_err(|err| anyhow::anyhow!("failed to bootstrap ranks: {}", err))?;
    let (rank, num_pes) = (rt.rank(), rt.size());
    tracing::info!("rank {} of {} starting", rank, num_pes);
    let transport = ShmemTransport::new(rank, num_pes, &config);
    let worker = SymmetricWorker::new(config.clone(), Arc::new(rt), transport);

    worker.synchronize_start();
    let local = match worker.allocate_memory(config.num_threads) {
        Ok(iov_lists) => iov_lists,
        Err(err) => fatal!("[{}] {}", rank, err),
    };
    if worker.exchange_metadata() != 0 {
        fatal!("[{}] Failed to exchange metadata", rank);
    }
    let remote = worker.exchange_iov(&local);

    if worker.is_initiator() {
        print_header(&config, num_pes);
    }
    let mut block_size = config.start_block_size;
    while block_size <= config.max_block_size {
        let mut batch_size = config.start_batch_size;
        while batch_size <= config.max_batch_size {
            let local_blocks = make_block_lists(&local, block_size, batch_size);
            let remote_blocks = make_block_lists(&remote, block_size, batch_size);
            if worker.is_initiator() {
                let us = match worker.transfer(block_size, &local_blocks, &remote_blocks) {
                    Ok(us) => us,
                    Err(err) => fatal!(
                        "[{}] {} (code {}) at block size {}",
                        rank,
                        err,
                        err.code(),
                        block_size
                    ),
                };
                let (_skip, num_iter) = config.iterations(block_size);
                print_row(
                    block_size,
                    batch_size,
                    total_bytes(&local_blocks),
                    num_iter,
                    us,
                );
            } else {
                worker.poll(block_size);
            }
            batch_size *= 2;
        }
        block_size *= 2;
    }

    worker.deallocate_memory(local);
    tracing::info!("rank {} done", rank);
    Ok(())
}
