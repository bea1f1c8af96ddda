//! A host emulated device execution stream.
//!
//! Work enqueued on an [ExecStream] runs asynchronously on a dedicated thread,
//! strictly in enqueue order. Host code only observes completion through the
//! explicit wait primitives ([ExecStream::synchronize],
//! [ExecStream::event_synchronize]). [Event] markers take their timestamp when
//! the stream reaches them, so the interval between two markers is the time the
//! stream spent on the work enqueued between them, independent of how fast the
//! host issued it.

use crossbeam::channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// the stream thread is gone, nothing enqueued will ever run
    Disconnected,
    /// an event was queried before the stream executed it
    NotRecorded,
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            StreamError::Disconnected => write!(f, "execution stream disconnected"),
            StreamError::NotRecorded => write!(f, "event has not been recorded"),
        }
    }
}

impl std::error::Error for StreamError {}

pub type StreamResult<T> = Result<T, StreamError>;

type StreamOp = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Default)]
struct ProgressState {
    completed: u64,
    exited: bool,
}

#[derive(Debug, Default)]
struct Progress {
    state: Mutex<ProgressState>,
    cvar: Condvar,
}

impl Progress {
    fn complete(&self) {
        let mut state = self.state.lock();
        state.completed += 1;
        self.cvar.notify_all();
    }

    fn exit(&self) {
        let mut state = self.state.lock();
        state.exited = true;
        self.cvar.notify_all();
    }

    fn completed(&self) -> u64 {
        self.state.lock().completed
    }

    fn wait_for(&self, target: u64) -> StreamResult<()> {
        let mut state = self.state.lock();
        while state.completed < target {
            if state.exited {
                return Err(StreamError::Disconnected);
            }
            self.cvar.wait(&mut state);
        }
        Ok(())
    }
}

// marks the stream as gone however its thread leaves, including by panic
struct ExitGuard(Arc<Progress>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.exit();
    }
}

/// A timeline marker, see [ExecStream::record].
#[derive(Debug, Clone, Default)]
pub struct Event {
    inner: Arc<EventInner>,
}

#[derive(Debug, Default)]
struct EventInner {
    stamp: Mutex<Option<Instant>>,
    ticket: AtomicUsize, // stream position of the marker, 0 == never recorded
}

impl Event {
    pub fn new() -> Event {
        Default::default()
    }

    fn stamp(&self) {
        *self.inner.stamp.lock() = Some(Instant::now());
    }

    fn reset(&self) {
        *self.inner.stamp.lock() = None;
        self.inner.ticket.store(0, Ordering::SeqCst);
    }

    pub fn is_recorded(&self) -> bool {
        self.inner.stamp.lock().is_some()
    }

    fn timestamp(&self) -> StreamResult<Instant> {
        self.inner.stamp.lock().ok_or(StreamError::NotRecorded)
    }
}

pub struct ExecStream {
    tx: Option<Sender<StreamOp>>,
    thread: Option<JoinHandle<()>>,
    submitted: AtomicUsize,
    progress: Arc<Progress>,
    events_recorded: AtomicUsize,
}

impl std::fmt::Debug for ExecStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ExecStream {{ submitted: {:?}, completed: {:?}, events_recorded: {:?} }}",
            self.submitted,
            self.progress.completed(),
            self.events_recorded
        )
    }
}

impl ExecStream {
    pub fn new() -> ExecStream {
        let (tx, rx) = unbounded::<StreamOp>();
        let progress = Arc::new(Progress::default());
        let thread_progress = progress.clone();
        let thread = std::thread::Builder::new()
            .name("xferbench-stream".to_owned())
            .spawn(move || {
                let _guard = ExitGuard(thread_progress.clone());
                for op in rx.iter() {
                    op();
                    thread_progress.complete();
                }
            })
            .ok();
        if thread.is_none() {
            tracing::error!("failed to spawn execution stream thread");
        }
        ExecStream {
            tx: thread.as_ref().map(|_| tx),
            thread,
            submitted: AtomicUsize::new(0),
            progress,
            events_recorded: AtomicUsize::new(0),
        }
    }

    /// Append `op` to the stream; it runs after everything enqueued before it.
    pub fn enqueue<F>(&self, op: F) -> StreamResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Box::new(op)).map(|_| ())
    }

    // returns the stream position of `op`
    fn submit(&self, op: StreamOp) -> StreamResult<usize> {
        let tx = self.tx.as_ref().ok_or(StreamError::Disconnected)?;
        let ticket = self.submitted.fetch_add(1, Ordering::SeqCst) + 1;
        tx.send(op).map_err(|_| {
            self.submitted.fetch_sub(1, Ordering::SeqCst);
            StreamError::Disconnected
        })?;
        Ok(ticket)
    }

    /// Fill `len` bytes at `addr` with `value`, asynchronously.
    ///
    /// # Safety
    /// `addr..addr+len` must stay valid and unaliased by host references
    /// until the stream has been synchronized.
    pub unsafe fn memset(&self, addr: usize, value: u8, len: usize) -> StreamResult<()> {
        self.enqueue(move || unsafe { std::ptr::write_bytes(addr as *mut u8, value, len) })
    }

    /// Mark the current end of the stream; `event` is stamped once every
    /// previously enqueued operation has executed.
    pub fn record(&self, event: &Event) -> StreamResult<()> {
        event.reset();
        let event_clone = event.clone();
        let ticket = self.submit(Box::new(move || event_clone.stamp()))?;
        event.inner.ticket.store(ticket, Ordering::SeqCst);
        self.events_recorded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Block until everything enqueued so far has executed.
    pub fn synchronize(&self) -> StreamResult<()> {
        if self.tx.is_none() {
            return Err(StreamError::Disconnected);
        }
        let target = self.submitted.load(Ordering::SeqCst) as u64;
        self.progress.wait_for(target)
    }

    /// Block until `event` has been stamped by the stream.
    pub fn event_synchronize(&self, event: &Event) -> StreamResult<()> {
        if self.tx.is_none() {
            return Err(StreamError::Disconnected);
        }
        match event.inner.ticket.load(Ordering::SeqCst) {
            0 => Err(StreamError::NotRecorded),
            ticket => self.progress.wait_for(ticket as u64),
        }
    }

    /// Milliseconds between two recorded events.
    pub fn elapsed_ms(&self, start: &Event, stop: &Event) -> StreamResult<f32> {
        let start = start.timestamp()?;
        let stop = stop.timestamp()?;
        Ok(stop.saturating_duration_since(start).as_secs_f64() as f32 * 1e3)
    }

    /// Number of markers recorded on this stream over its lifetime.
    pub fn events_recorded(&self) -> usize {
        self.events_recorded.load(Ordering::SeqCst)
    }

    pub fn ops_submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }
}

impl Default for ExecStream {
    fn default() -> Self {
        ExecStream::new()
    }
}

impl Drop for ExecStream {
    fn drop(&mut self) {
        // closing the channel lets the thread drain the queue and exit
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("execution stream thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn ops_run_in_order() {
        let stream = ExecStream::new();
        let log = Arc::new(Mutex::new(vec![]));
        for i in 0..100 {
            let log = log.clone();
            stream.enqueue(move || log.lock().push(i)).unwrap();
        }
        stream.synchronize().unwrap();
        assert_eq!(*log.lock(), (0..100).collect::<Vec<_>>());
        assert_eq!(stream.ops_submitted(), 100);
    }

    #[test]
    fn markers_bracket_stream_time() {
        let stream = ExecStream::new();
        let start = Event::new();
        let stop = Event::new();
        stream.record(&start).unwrap();
        stream
            .enqueue(|| std::thread::sleep(Duration::from_millis(20)))
            .unwrap();
        stream.record(&stop).unwrap();
        stream.event_synchronize(&stop).unwrap();
        assert!(start.is_recorded());
        let ms = stream.elapsed_ms(&start, &stop).unwrap();
        assert!(ms >= 19.0, "elapsed {} ms", ms);
        assert_eq!(stream.events_recorded(), 2);
    }

    #[test]
    fn elapsed_requires_recorded_events() {
        let stream = ExecStream::new();
        let start = Event::new();
        let stop = Event::new();
        assert_eq!(
            stream.elapsed_ms(&start, &stop),
            Err(StreamError::NotRecorded)
        );
        assert_eq!(stream.event_synchronize(&stop), Err(StreamError::NotRecorded));
    }

    #[test]
    fn memset_fills_bytes() {
        let stream = ExecStream::new();
        let mut buf = vec![0u8; 256];
        unsafe { stream.memset(buf.as_mut_ptr() as usize, 0xbb, 128).unwrap() };
        stream.synchronize().unwrap();
        assert!(buf[..128].iter().all(|b| *b == 0xbb));
        assert!(buf[128..].iter().all(|b| *b == 0));
    }

    #[test]
    fn panicked_op_disconnects_stream() {
        let stream = ExecStream::new();
        stream.enqueue(|| panic!("op failed")).unwrap();
        assert_eq!(stream.synchronize(), Err(StreamError::Disconnected));
        let event = Event::new();
        // the queue may or may not have noticed the exit yet
        if stream.record(&event).is_ok() {
            assert_eq!(
                stream.event_synchronize(&event),
                Err(StreamError::Disconnected)
            );
        }
        assert!(stream.enqueue(|| ()).is_err() || stream.synchronize().is_err());
    }

    #[test]
    fn drop_drains_queue() {
        let cnt = Arc::new(AtomicUsize::new(0));
        {
            let stream = ExecStream::new();
            for _ in 0..10 {
                let cnt = cnt.clone();
                stream
                    .enqueue(move || {
                        cnt.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
            }
        }
        assert_eq!(cnt.load(Ordering::SeqCst), 10);
    }
}
