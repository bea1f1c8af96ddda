use lamellar_xferbench::*;
use std::sync::Arc;

struct RankResult {
    rank: usize,
    elapsed_us: Option<f64>,
    regions: Vec<Vec<u8>>,
    occupied_after: usize,
}

fn config(op_type: XferOp, num_dev: usize) -> Arc<XferBenchConfig> {
    Arc::new(XferBenchConfig {
        op_type,
        total_buffer_size: 1024 * 1024,
        num_initiator_dev: num_dev,
        num_target_dev: num_dev,
        num_iter: 8,
        warmup_iter: 2,
        start_block_size: 4096,
        max_block_size: 64 * 1024,
        large_block_size: 16 * 1024,
        barrier_timeout: Some(60.0),
        ..Default::default()
    })
}

fn snapshot(iov_lists: &IovLists) -> Vec<Vec<u8>> {
    iov_lists
        .iter()
        .flatten()
        .map(|iov| unsafe { std::slice::from_raw_parts(iov.addr as *const u8, iov.len).to_vec() })
        .collect()
}

/// Runs one allocate/transfer/deallocate cycle on two in-process ranks.
fn run_pair(config: Arc<XferBenchConfig>, block_size: usize, batch_size: usize) -> Vec<RankResult> {
    let runtimes = ShmemRuntime::local_world(2, &config).unwrap();
    let transports = ShmemTransport::local_world(2, &config).unwrap();
    let handles = runtimes
        .into_iter()
        .zip(transports)
        .map(|(rt, transport)| {
            let config = config.clone();
            std::thread::spawn(move || {
                let rank = rt.rank();
                let worker = SymmetricWorker::new(config, Arc::new(rt), transport);
                assert_eq!(worker.synchronize_start(), 0);
                let local = worker.allocate_memory(1).unwrap();
                assert_eq!(worker.exchange_metadata(), 0);
                let remote = worker.exchange_iov(&local);
                let local_blocks = make_block_lists(&local, block_size, batch_size);
                let remote_blocks = make_block_lists(&remote, block_size, batch_size);
                let elapsed_us = if worker.is_initiator() {
                    Some(
                        worker
                            .transfer(block_size, &local_blocks, &remote_blocks)
                            .unwrap(),
                    )
                } else {
                    worker.poll(block_size);
                    None
                };
                let regions = snapshot(&local);
                worker.deallocate_memory(local);
                RankResult {
                    rank,
                    elapsed_us,
                    regions,
                    occupied_after: worker.transport().occupied(),
                }
            })
        })
        .collect::<Vec<_>>();
    let mut results: Vec<RankResult> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    results.sort_by_key(|r| r.rank);
    results
}

fn check_region(region: &[u8], touched: usize, touched_val: u8, untouched_val: u8) {
    assert!(region[..touched].iter().all(|b| *b == touched_val));
    assert!(region[touched..].iter().all(|b| *b == untouched_val));
}

macro_rules! create_test {
    ( $op:ident, $num_dev:expr, $block_size:expr, $batch_size:expr) => {
        paste::paste! {
            #[test]
            #[allow(non_snake_case)]
            fn [<$op _ $num_dev dev_ $block_size _ $batch_size>]() {
                let results = run_pair(config(XferOp::$op, $num_dev), $block_size, $batch_size);
                let initiator = &results[0];
                let target = &results[1];
                assert!(initiator.elapsed_us.unwrap() >= 0.0);
                assert!(target.elapsed_us.is_none());
                assert_eq!(initiator.regions.len(), $num_dev);
                assert_eq!(target.regions.len(), $num_dev);
                let touched = $block_size * $batch_size;
                for (init_region, target_region) in initiator.regions.iter().zip(target.regions.iter()) {
                    match XferOp::$op {
                        XferOp::Write => {
                            check_region(init_region, 0, 0xbb, 0xbb);
                            check_region(target_region, touched, 0xbb, 0xaa);
                        }
                        XferOp::Read => {
                            check_region(init_region, touched, 0xaa, 0xbb);
                            check_region(target_region, 0, 0xaa, 0xaa);
                        }
                    }
                }
                assert_eq!(initiator.occupied_after, 0);
                assert_eq!(target.occupied_after, 0);
            }
        }
    };
}

macro_rules! create_tests {
    ( ($($op:ident),*), $num_dev:tt, $block_size:tt, $batch_size:tt) => {
        $(iter_num_dev!($op, $num_dev, $block_size, $batch_size);)*
    };
}

macro_rules! iter_num_dev {
    ( $op:ident, ($($num_dev:expr),*), $block_size:tt, $batch_size:tt) => {
        $(iter_block_size!($op, $num_dev, $block_size, $batch_size);)*
    };
}

macro_rules! iter_block_size {
    ( $op:ident, $num_dev:expr, ($($block_size:expr),*), $batch_size:tt) => {
        $(iter_batch_size!($op, $num_dev, $block_size, $batch_size);)*
    };
}

macro_rules! iter_batch_size {
    ( $op:ident, $num_dev:expr, $block_size:expr, ($($batch_size:expr),*)) => {
        $(create_test!($op, $num_dev, $block_size, $batch_size);)*
    };
}

// 32768 exceeds the large block threshold and runs the scaled down iteration counts
create_tests!((Write, Read), (1, 2), (4096, 32768), (1, 4));

#[test]
fn full_sweep_keeps_barriers_in_step() {
    let config = config(XferOp::Write, 2);
    let runtimes = ShmemRuntime::local_world(2, &config).unwrap();
    let transports = ShmemTransport::local_world(2, &config).unwrap();
    let handles = runtimes
        .into_iter()
        .zip(transports)
        .map(|(rt, transport)| {
            let config = config.clone();
            std::thread::spawn(move || {
                let worker = SymmetricWorker::new(config.clone(), Arc::new(rt), transport);
                worker.synchronize_start();
                let local = worker.allocate_memory(1).unwrap();
                let remote = worker.exchange_iov(&local);
                let mut rows = 0;
                let mut block_size = config.start_block_size;
                while block_size <= config.max_block_size {
                    let local_blocks = make_block_lists(&local, block_size, 1);
                    let remote_blocks = make_block_lists(&remote, block_size, 1);
                    if worker.is_initiator() {
                        worker
                            .transfer(block_size, &local_blocks, &remote_blocks)
                            .unwrap();
                    } else {
                        worker.poll(block_size);
                    }
                    rows += 1;
                    block_size *= 2;
                }
                worker.deallocate_memory(local);
                rows
            })
        })
        .collect::<Vec<_>>();
    for h in handles {
        assert_eq!(h.join().unwrap(), 5);
    }
}

#[test]
fn transfer_outside_the_heap_reports_invalid_arg() {
    let config = config(XferOp::Write, 1);
    let runtimes = ShmemRuntime::local_world(2, &config).unwrap();
    let transports = ShmemTransport::local_world(2, &config).unwrap();
    let handles = runtimes
        .into_iter()
        .zip(transports)
        .map(|(rt, transport)| {
            let config = config.clone();
            std::thread::spawn(move || {
                let worker = SymmetricWorker::new(config, Arc::new(rt), transport);
                worker.synchronize_start();
                let local = worker.allocate_memory(1).unwrap();
                let outcome = if worker.is_initiator() {
                    let mut bogus = local.clone();
                    bogus[0][0].addr = 0x10;
                    // fails during warmup, so the target never gets polled
                    Some(worker.transfer(4096, &bogus, &local).map_err(|e| e.code()))
                } else {
                    None
                };
                worker.deallocate_memory(local);
                outcome
            })
        })
        .collect::<Vec<_>>();
    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(outcomes[0], Some(Err(-22)));
    assert_eq!(outcomes[1], None);
}

#[test]
fn absent_target_times_out_transfer() {
    let config = Arc::new(XferBenchConfig {
        barrier_timeout: Some(2.0),
        ..(*config(XferOp::Write, 1)).clone()
    });
    let runtimes = ShmemRuntime::local_world(2, &config).unwrap();
    let transports = ShmemTransport::local_world(2, &config).unwrap();
    let (done_tx, done_rx) = crossbeam::channel::bounded::<()>(1);
    let handles = runtimes
        .into_iter()
        .zip(transports)
        .map(|(rt, transport)| {
            let config = config.clone();
            let done_tx = done_tx.clone();
            let done_rx = done_rx.clone();
            std::thread::spawn(move || {
                let worker = SymmetricWorker::new(config, Arc::new(rt), transport);
                worker.synchronize_start();
                let local = worker.allocate_memory(1).unwrap();
                let blocks = make_block_lists(&local, 4096, 1);
                if worker.is_initiator() {
                    let start = std::time::Instant::now();
                    let outcome = worker.transfer(4096, &blocks, &blocks);
                    done_tx.send(()).unwrap();
                    Some((outcome.map_err(|e| e.code()), start.elapsed()))
                } else {
                    // never polls, the initiator is left alone at the first barrier
                    done_rx.recv().unwrap();
                    None
                }
            })
        })
        .collect::<Vec<_>>();
    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let (outcome, waited) = outcomes[0].clone().unwrap();
    assert_eq!(outcome, Err(-110));
    assert!(waited >= std::time::Duration::from_secs(2), "{:?}", waited);
    assert!(outcomes[1].is_none());
}
