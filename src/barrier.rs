use crate::transport::Segment;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BarrierError {
    /// A PE never arrived at barrier `barrier_id` within the configured timeout.
    Timeout { barrier_id: usize, waited: f64 },
}

impl std::fmt::Display for BarrierError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            BarrierError::Timeout { barrier_id, waited } => write!(
                f,
                "barrier {} timed out after {:.3} seconds waiting for all PEs",
                barrier_id, waited
            ),
        }
    }
}

impl std::error::Error for BarrierError {}

pub type BarrierResult = Result<(), BarrierError>;

/// A collective barrier over `num_pes` counters living in a shared segment.
///
/// Every PE owns one word. Entering barrier `n` publishes `n` in that word and
/// waits for every other word to reach at least `n`. The counters only grow,
/// so the same words serve every barrier of the run.
pub(crate) struct Barrier {
    my_pe: usize,
    num_pes: usize,
    segment: Arc<Segment>,
    offset: usize,
    barrier_cnt: AtomicUsize,
    deadlock_timeout: f64,
    timeout: Option<f64>,
}

impl std::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Barrier {{ my_pe: {}, num_pes: {}, barrier_cnt: {:?} }}",
            self.my_pe, self.num_pes, self.barrier_cnt
        )
    }
}

impl Barrier {
    /// Bytes of segment space a barrier over `num_pes` PEs occupies.
    pub(crate) fn footprint(num_pes: usize) -> usize {
        num_pes * std::mem::size_of::<AtomicUsize>()
    }

    pub(crate) fn new(
        my_pe: usize,
        num_pes: usize,
        segment: Arc<Segment>,
        offset: usize,
        deadlock_timeout: f64,
        timeout: Option<f64>,
    ) -> Barrier {
        assert!(
            offset + Barrier::footprint(num_pes) <= segment.len(),
            "barrier slots must lie inside the segment"
        );
        Barrier {
            my_pe,
            num_pes,
            segment,
            offset,
            barrier_cnt: AtomicUsize::new(0),
            deadlock_timeout,
            timeout,
        }
    }

    fn slot(&self, pe: usize) -> &AtomicUsize {
        unsafe {
            self.segment
                .atomic_at(self.offset + pe * std::mem::size_of::<AtomicUsize>())
        }
    }

    fn slot_vals(&self) -> Vec<usize> {
        (0..self.num_pes)
            .map(|pe| self.slot(pe).load(Ordering::SeqCst))
            .collect()
    }

    pub(crate) fn barrier(&self) -> BarrierResult {
        let barrier_id = self.barrier_cnt.fetch_add(1, Ordering::SeqCst) + 1;
        self.slot(self.my_pe).store(barrier_id, Ordering::SeqCst);
        let start = Instant::now();
        let mut warn = Instant::now();
        let mut spins = 0usize;
        for pe in 0..self.num_pes {
            while self.slot(pe).load(Ordering::SeqCst) < barrier_id {
                spins += 1;
                if spins < 1000 {
                    std::hint::spin_loop();
                } else if spins < 100_000 {
                    std::thread::yield_now();
                } else {
                    std::thread::sleep(Duration::from_micros(50));
                }
                if let Some(timeout) = self.timeout {
                    let waited = start.elapsed().as_secs_f64();
                    if waited > timeout {
                        return Err(BarrierError::Timeout { barrier_id, waited });
                    }
                }
                if warn.elapsed().as_secs_f64() > self.deadlock_timeout {
                    tracing::warn!(
                        "[{}] Potential deadlock detected in barrier {}.\n\
                        Barrier is a collective operation requiring all PEs to enter the barrier call.\n\
                        The warning interval can be set via the XFERBENCH_DEADLOCK_TIMEOUT environment variable, the current interval is {} seconds\n\
                        PE barrier counters: {:?}",
                        self.my_pe,
                        barrier_id,
                        self.deadlock_timeout,
                        self.slot_vals()
                    );
                    warn = Instant::now();
                }
            }
        }
        tracing::trace!("[{}] completed barrier {}", self.my_pe, barrier_id);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn barriers_entered(&self) -> usize {
        self.barrier_cnt.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world(num_pes: usize, timeout: Option<f64>) -> Vec<Barrier> {
        let seg = Arc::new(Segment::host(Barrier::footprint(num_pes), "barrier_test").unwrap());
        (0..num_pes)
            .map(|pe| Barrier::new(pe, num_pes, seg.clone(), 0, 600.0, timeout))
            .collect()
    }

    #[test]
    fn single_pe_never_waits() {
        let bars = world(1, Some(0.0));
        for _ in 0..3 {
            bars[0].barrier().unwrap();
        }
        assert_eq!(bars[0].barriers_entered(), 3);
    }

    #[test]
    fn threads_rendezvous() {
        let num_pes = 4;
        let arrived = Arc::new(AtomicUsize::new(0));
        let handles = world(num_pes, None)
            .into_iter()
            .map(|bar| {
                let arrived = arrived.clone();
                std::thread::spawn(move || {
                    for round in 1..=10 {
                        arrived.fetch_add(1, Ordering::SeqCst);
                        bar.barrier().unwrap();
                        // nobody can have started the next round yet
                        assert!(arrived.load(Ordering::SeqCst) >= round * num_pes);
                        bar.barrier().unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn missing_pe_times_out() {
        let bars = world(2, Some(0.05));
        let err = bars[0].barrier().unwrap_err();
        assert!(matches!(err, BarrierError::Timeout { barrier_id: 1, .. }));
    }
}
