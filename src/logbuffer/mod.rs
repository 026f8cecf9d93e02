//! Windowed, append-only output buffer with independent blocking readers.
//!
//! Entries are written into fixed-size chunks. A window holds `chunk_count`
//! chunks; when the last chunk of a window fills, a fresh window is allocated
//! and the old one is left to the readers still walking it. A full chunk is
//! never written again, so readers copy entries out without holding the
//! buffer lock. A reader that reaches the end of a stale window jumps to the
//! start of the current one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Condvar, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CHUNK_COUNT: usize = 32;
pub const DEFAULT_CHUNK_SIZE: usize = 164;

type Window<T> = Arc<[Arc<Chunk<T>>]>;

struct Chunk<T> {
    len: AtomicUsize,
    slots: Box<[OnceLock<T>]>,
}

impl<T: Clone> Chunk<T> {
    fn new(size: usize) -> Self {
        Self {
            len: AtomicUsize::new(0),
            slots: (0..size).map(|_| OnceLock::new()).collect(),
        }
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Only called with the buffer lock held, so there is a single writer.
    fn write(&self, entries: &[T]) -> usize {
        let start = self.len.load(Ordering::Relaxed);
        let n = entries.len().min(self.capacity() - start);
        for (offset, entry) in entries[..n].iter().enumerate() {
            let _ = self.slots[start + offset].set(entry.clone());
        }
        self.len.store(start + n, Ordering::Release);
        n
    }

    fn copy_range(&self, start: usize, end: usize) -> Vec<T> {
        self.slots[start..end]
            .iter()
            .filter_map(|slot| slot.get().cloned())
            .collect()
    }
}

fn new_window<T: Clone>(count: usize, size: usize) -> Window<T> {
    (0..count).map(|_| Arc::new(Chunk::new(size))).collect()
}

struct State<T> {
    window: Window<T>,
    current: usize,
    readers: HashMap<u64, CancellationToken>,
    next_reader: u64,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
    /// Bumped on every write and close, for async readers that poll.
    wake: watch::Sender<u64>,
    chunk_count: usize,
    chunk_size: usize,
}

/// Cheap to clone; all clones refer to the same buffer.
pub struct LogBuffer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for LogBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for LogBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBuffer")
            .field("chunk_count", &self.shared.chunk_count)
            .field("chunk_size", &self.shared.chunk_size)
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for LogBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> LogBuffer<T> {
    pub fn new() -> Self {
        Self::with_chunks(DEFAULT_CHUNK_COUNT, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunks(chunk_count: usize, chunk_size: usize) -> Self {
        let chunk_count = chunk_count.max(1);
        let chunk_size = chunk_size.max(1);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    window: new_window(chunk_count, chunk_size),
                    current: 0,
                    readers: HashMap::new(),
                    next_reader: 0,
                    closed: false,
                }),
                cond: Condvar::new(),
                wake: watch::Sender::new(0),
                chunk_count,
                chunk_size,
            }),
        }
    }

    /// Append entries and wake every blocked reader. Ignored once closed.
    pub fn write(&self, entries: &[T]) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }

        let mut written = 0;
        while written < entries.len() {
            let chunk = Arc::clone(&state.window[state.current]);
            written += chunk.write(&entries[written..]);

            if chunk.is_full() {
                state.current += 1;
                if state.current >= state.window.len() {
                    state.window = new_window(self.shared.chunk_count, self.shared.chunk_size);
                    state.current = 0;
                }
            }
        }

        self.shared.cond.notify_all();
        self.shared.wake.send_modify(|n| *n += 1);
    }

    /// A signal that changes after every write and on close. Pair it with
    /// non-blocking reads to follow the buffer without parking a thread.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.wake.subscribe()
    }

    /// Attach a reader.
    ///
    /// `max_history < 0` starts at the oldest entry still in the window,
    /// `0` starts after the newest entry, and `n > 0` starts `n` entries back
    /// (or at the oldest entry if fewer are held).
    pub fn reader(&self, max_history: i32) -> Reader<T> {
        let mut state = self.shared.state.lock();
        let window = Arc::clone(&state.window);

        let (idx, cursor) = match max_history {
            n if n < 0 => (0, 0),
            0 => (state.current, window[state.current].len()),
            n => {
                let mut remaining = n as usize;
                let mut idx = state.current;
                let mut cursor = 0;
                for i in (0..=state.current).rev() {
                    let size = window[i].len();
                    idx = i;
                    if size >= remaining {
                        cursor = size - remaining;
                        break;
                    }
                    remaining -= size;
                }
                (idx, cursor)
            }
        };

        let id = state.next_reader;
        state.next_reader += 1;
        let closed = CancellationToken::new();
        if state.closed {
            closed.cancel();
        } else {
            state.readers.insert(id, closed.clone());
        }

        Reader {
            shared: Arc::clone(&self.shared),
            window,
            idx,
            cursor,
            id,
            closed,
        }
    }

    /// Close the buffer, releasing every outstanding reader.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        for (_, token) in state.readers.drain() {
            token.cancel();
        }
        self.shared.cond.notify_all();
        self.shared.wake.send_modify(|n| *n += 1);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}

/// A private cursor into a [`LogBuffer`].
pub struct Reader<T> {
    shared: Arc<Shared<T>>,
    window: Window<T>,
    idx: usize,
    cursor: usize,
    id: u64,
    closed: CancellationToken,
}

impl<T: Clone + Send + Sync + 'static> Reader<T> {
    /// Read up to `max` entries.
    ///
    /// Returns `None` without blocking when nothing is available and `block`
    /// is false, and `None` once the reader or its buffer is closed.
    pub fn read(&mut self, max: usize, block: bool) -> Option<Vec<T>> {
        let max = max.max(1);
        loop {
            if self.closed.is_cancelled() {
                return None;
            }

            if let Some(batch) = self.take(max) {
                return Some(batch);
            }

            if !block {
                return None;
            }

            let chunk = Arc::clone(&self.window[self.idx]);
            let mut state = self.shared.state.lock();
            while chunk.len() <= self.cursor && !self.closed.is_cancelled() {
                self.shared.cond.wait(&mut state);
            }
        }
    }

    /// Everything currently readable, even if the reader was closed.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(batch) = self.take(self.shared.chunk_size) {
            out.extend(batch);
        }
        out
    }

    pub fn closer(&self) -> ReaderCloser {
        ReaderCloser {
            remove: Arc::new({
                let shared = Arc::clone(&self.shared);
                let id = self.id;
                move || {
                    let mut state = shared.state.lock();
                    state.readers.remove(&id);
                    shared.cond.notify_all();
                    shared.wake.send_modify(|n| *n += 1);
                }
            }),
            closed: self.closed.clone(),
        }
    }

    /// Close this reader only. Safe to call more than once.
    pub fn close(&self) {
        self.closer().close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn take(&mut self, max: usize) -> Option<Vec<T>> {
        loop {
            let chunk = Arc::clone(&self.window[self.idx]);
            if self.cursor >= chunk.capacity() {
                self.advance();
                continue;
            }

            let len = chunk.len();
            if len <= self.cursor {
                return None;
            }

            let end = len.min(self.cursor + max);
            let batch = chunk.copy_range(self.cursor, end);
            self.cursor = end;
            if self.cursor >= chunk.capacity() {
                self.advance();
            }
            return Some(batch);
        }
    }

    fn advance(&mut self) {
        self.idx += 1;
        self.cursor = 0;
        if self.idx >= self.window.len() {
            self.window = Arc::clone(&self.shared.state.lock().window);
            self.idx = 0;
        }
    }
}

impl<T> Drop for Reader<T> {
    fn drop(&mut self) {
        self.closed.cancel();
        self.shared.state.lock().readers.remove(&self.id);
    }
}

/// Handle that closes a reader from another task.
#[derive(Clone)]
pub struct ReaderCloser {
    remove: Arc<dyn Fn() + Send + Sync>,
    closed: CancellationToken,
}

impl ReaderCloser {
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            (self.remove)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_millis(50);

    /// Run a blocking read on another thread, reporting its result.
    fn spawn_read(
        mut reader: Reader<u32>,
        max: usize,
    ) -> mpsc::Receiver<(Reader<u32>, Option<Vec<u32>>)> {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let v = reader.read(max, true);
            let _ = tx.send((reader, v));
        });
        rx
    }

    // =======================================================================
    // 1. Basic write/read, blocking and non-blocking
    // =======================================================================
    #[test]
    fn test_read_blocks_until_write() {
        let b = LogBuffer::new();
        let mut r1 = b.reader(-1);

        b.write(&[1, 2, 3]);
        let v = r1.read(10, true).expect("entries");
        assert_eq!(v, vec![1, 2, 3]);

        let rx = spawn_read(r1, 10);
        assert!(rx.recv_timeout(WAIT).is_err(), "should block");

        b.write(&[4, 5]);
        let (mut r1, v) = rx.recv_timeout(Duration::from_secs(1)).expect("should unblock");
        assert_eq!(v, Some(vec![4, 5]));

        assert!(r1.read(10, false).is_none());
        b.write(&[6, 7, 8, 9]);
        assert_eq!(r1.read(10, false).expect("entries").len(), 4);
    }

    #[test]
    fn test_read_partial() {
        let b = LogBuffer::new();
        let mut r1 = b.reader(-1);
        b.write(&[1, 2, 3]);

        assert_eq!(r1.read(2, true), Some(vec![1, 2]));
        assert_eq!(r1.read(1, true), Some(vec![3]));
    }

    // =======================================================================
    // 2. Close semantics
    // =======================================================================
    #[test]
    fn test_buffer_close_unblocks_readers() {
        let b: LogBuffer<u32> = LogBuffer::new();
        let rx1 = spawn_read(b.reader(-1), 10);
        let rx2 = spawn_read(b.reader(0), 10);
        assert!(rx1.recv_timeout(WAIT).is_err(), "should block");

        b.close();

        let (r1, v1) = rx1.recv_timeout(Duration::from_secs(1)).expect("unblocked");
        let (_, v2) = rx2.recv_timeout(Duration::from_secs(1)).expect("unblocked");
        assert!(v1.is_none());
        assert!(v2.is_none());

        // closing an already released reader is harmless
        r1.close();
        r1.close();
    }

    #[test]
    fn test_reader_close_is_idempotent_and_isolated() {
        let b = LogBuffer::new();
        let r1 = b.reader(-1);
        let mut r2 = b.reader(-1);
        let closer = r1.closer();

        let rx = spawn_read(r1, 10);
        assert!(rx.recv_timeout(WAIT).is_err(), "should block");

        closer.close();
        let (r1, v) = rx.recv_timeout(Duration::from_secs(1)).expect("unblocked");
        assert!(v.is_none());
        r1.close();
        closer.close();

        b.write(&[7]);
        assert_eq!(r2.read(10, false), Some(vec![7]));
    }

    #[test]
    fn test_write_after_close_is_ignored() {
        let b = LogBuffer::new();
        b.close();
        b.write(&[1]);
        let mut r = b.reader(-1);
        assert!(r.is_closed());
        assert!(r.read(10, false).is_none());
        assert!(r.drain().is_empty());
    }

    #[test]
    fn test_drain_after_close_returns_pending_entries() {
        let b = LogBuffer::with_chunks(2, 2);
        let mut r = b.reader(-1);
        b.write(&[1, 2, 3]);
        r.close();
        assert!(r.read(10, false).is_none());
        assert_eq!(r.drain(), vec![1, 2, 3]);
    }

    // =======================================================================
    // 3. Window rotation
    // =======================================================================
    #[test]
    fn test_write_full_wraps_window() {
        let b = LogBuffer::with_chunks(2, 2);
        for i in 0..53 {
            b.write(&[i]);
        }

        let mut r = b.reader(-1);
        let vs = r.read(10, true).expect("entries");
        assert_eq!(*vs.last().expect("non-empty"), 52);
    }

    #[test]
    fn test_stale_reader_jumps_to_current_window() {
        let b = LogBuffer::with_chunks(2, 1);
        let mut r = b.reader(-1);
        for i in 0..53 {
            b.write(&[i]);
        }

        assert_eq!(r.read(1, true), Some(vec![0]));
        assert_eq!(r.read(1, true), Some(vec![1]));
        // window jump
        assert_eq!(r.read(1, true), Some(vec![52]));
    }

    #[test]
    fn test_interleaved_reads_see_every_write_in_order() {
        let b = LogBuffer::with_chunks(2, 2);
        let mut r = b.reader(-1);

        let writer = {
            let b = b.clone();
            thread::spawn(move || {
                for i in 0..53u32 {
                    b.write(&[i]);
                    // keep the reader inside the window
                    thread::sleep(Duration::from_millis(5));
                }
            })
        };

        let mut seen = Vec::new();
        while seen.len() < 53 {
            let batch = r.read(3, true).expect("entries");
            seen.extend(batch);
        }
        writer.join().expect("writer");

        assert_eq!(seen, (0..53).collect::<Vec<_>>());
        assert_eq!(*seen.last().expect("non-empty"), 52);
    }

    // =======================================================================
    // 4. History
    // =======================================================================
    #[test]
    fn test_no_history_waits_for_new_writes() {
        let b = LogBuffer::new();
        b.write(&[1, 2, 3]);

        let rx = spawn_read(b.reader(0), 10);
        assert!(rx.recv_timeout(WAIT).is_err(), "should block");

        b.write(&[4, 5]);
        let (_, v) = rx.recv_timeout(Duration::from_secs(1)).expect("should unblock");
        assert_eq!(v, Some(vec![4, 5]));
    }

    #[test]
    fn test_max_history_limits_backlog() {
        let b = LogBuffer::new();
        b.write(&[1, 2, 3, 4, 5]);

        let mut r1 = b.reader(2);
        assert_eq!(r1.read(10, true), Some(vec![4, 5]));

        let rx = spawn_read(r1, 10);
        assert!(rx.recv_timeout(WAIT).is_err(), "should block");

        b.write(&[6, 7, 8, 9]);
        let (mut r1, v) = rx.recv_timeout(Duration::from_secs(1)).expect("unblocked");
        assert_eq!(v, Some(vec![6, 7, 8, 9]));
        assert!(r1.read(10, false).is_none());
    }

    #[test]
    fn test_max_history_before_writes_sees_everything() {
        let b = LogBuffer::new();
        let mut r1 = b.reader(2);
        b.write(&[1, 2, 3, 4, 5]);
        assert_eq!(r1.read(10, true), Some(vec![1, 2, 3, 4, 5]));
    }

    #[test]
    fn test_max_history_spans_chunks() {
        let b = LogBuffer::with_chunks(3, 4);
        for i in 0..23 {
            b.write(&[i]);
        }

        let mut r = b.reader(9);
        let mut acc = Vec::new();
        while let Some(vs) = r.read(9, false) {
            acc.extend(vs);
        }

        assert_eq!(acc.len(), 9);
        assert_eq!(acc[acc.len() - 1], 22);
        assert_eq!(acc[acc.len() - 2], 21);
        assert_eq!(acc[0], 14);
    }

    #[test]
    fn test_max_history_larger_than_held_starts_at_oldest() {
        let b = LogBuffer::with_chunks(3, 4);
        b.write(&[1, 2, 3, 4, 5, 6]);
        let mut r = b.reader(100);
        assert_eq!(r.drain(), vec![1, 2, 3, 4, 5, 6]);
    }

    // =======================================================================
    // 5. Polling readers
    // =======================================================================
    #[tokio::test]
    async fn test_subscribe_signals_writes_and_close() {
        let b: LogBuffer<u32> = LogBuffer::with_chunks(2, 2);
        let mut wake = b.subscribe();
        let mut r = b.reader(-1);
        assert!(!wake.has_changed().expect("sender alive"));

        b.write(&[1]);
        tokio::time::timeout(Duration::from_secs(1), wake.changed())
            .await
            .expect("signalled")
            .expect("sender alive");
        assert_eq!(r.read(10, false), Some(vec![1]));
        assert!(r.read(10, false).is_none());

        b.close();
        assert!(wake.has_changed().expect("sender alive"));
        assert!(r.read(10, false).is_none());
        assert!(r.is_closed());
    }

    #[test]
    fn test_lagging_reader_skips_overwritten_windows() {
        let b = LogBuffer::with_chunks(2, 2);
        let mut r = b.reader(-1);
        b.write(&[0, 1]);
        assert_eq!(r.read(10, false), Some(vec![0, 1]));

        for i in 2..1000 {
            b.write(&[i]);
        }

        // the rest of the reader's window, then whatever the current one holds
        let seen = r.drain();
        assert!(seen.len() <= 4, "kept {} entries", seen.len());
        assert_eq!(seen, vec![2, 3]);
    }
}
