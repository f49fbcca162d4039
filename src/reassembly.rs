//! Per-direction TCP reassembly
//!
//! A [`ReassemblyBuffer`] accepts segments for one direction of one connection
//! in any order, parks the ones that arrive ahead of a gap, and hands the
//! contiguous byte stream to a single reader through a bounded queue.
//! Sequence numbers wrap modulo 2^32. A lost segment stalls delivery until it
//! shows up or the buffer is dropped; there is no gap skipping.

use crate::config::ReassemblyConfig;
use crate::{ReplayError, Result};
use async_channel::{Receiver, Sender};
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Mutex;

pub const DEFAULT_WINDOW: u32 = 65536;
pub const DEFAULT_HANDOFF_CAPACITY: usize = 1024;

/// Whether `seq` lies in `[expected, expected + window]` modulo 2^32.
pub fn in_window(expected: u32, window: u32, seq: u32) -> bool {
    let right_border = expected.wrapping_add(window);
    if right_border < expected {
        // window straddles the wraparound point
        seq <= right_border || seq >= expected
    } else {
        expected <= seq && seq <= right_border
    }
}

#[derive(Debug)]
struct Index {
    expected_seq: u32,
    segments: BTreeMap<u32, Bytes>,
}

#[derive(Debug, Default)]
struct Counters {
    out_of_window: AtomicU64,
    duplicate: AtomicU64,
    stale: AtomicU64,
    delivered_bytes: AtomicU64,
}

/// Snapshot of a buffer's discard and delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub discarded_out_of_window: u64,
    pub discarded_duplicate: u64,
    /// Parked segments overtaken by an overlapping delivery.
    pub discarded_stale: u64,
    pub delivered_bytes: u64,
}

#[derive(Debug)]
pub struct ReassemblyBuffer {
    window: u32,
    // Held across the hand-off send so insert and drain stay atomic.
    index: Mutex<Index>,
    // Mirror of `Index::expected_seq`, readable while a writer is blocked on the queue.
    expected: AtomicU32,
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,
    buffered: AtomicUsize,
    available: AtomicUsize,
    counters: Counters,
}

impl ReassemblyBuffer {
    pub fn new(initial_seq: u32, window: u32, handoff_capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(handoff_capacity.max(1));
        Self {
            window,
            index: Mutex::new(Index {
                expected_seq: initial_seq,
                segments: BTreeMap::new(),
            }),
            expected: AtomicU32::new(initial_seq),
            tx,
            rx,
            buffered: AtomicUsize::new(0),
            available: AtomicUsize::new(0),
            counters: Counters::default(),
        }
    }

    pub fn from_config(initial_seq: u32, config: &ReassemblyConfig) -> Self {
        Self::new(initial_seq, config.window, config.handoff_capacity)
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    /// Insert a segment starting at `seq`.
    ///
    /// Out-of-window and duplicate segments are dropped silently. Whatever
    /// becomes contiguous is pushed to the reader; this waits while the
    /// hand-off queue is full.
    pub async fn add_segment(&self, seq: u32, payload: Bytes) {
        if payload.is_empty() {
            return;
        }

        let mut index = self.index.lock().await;

        if !in_window(index.expected_seq, self.window, seq) {
            self.counters.out_of_window.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "Discarding out-of-window segment seq={} len={} (expected {})",
                seq,
                payload.len(),
                index.expected_seq
            );
            return;
        }

        if index.segments.contains_key(&seq) {
            self.counters.duplicate.fetch_add(1, Ordering::Relaxed);
            log::debug!("Discarding duplicate segment seq={}", seq);
            return;
        }

        self.buffered.fetch_add(payload.len(), Ordering::SeqCst);
        index.segments.insert(seq, payload);

        self.drain(&mut index).await;
    }

    /// Move the expected sequence number to `seq`, then drain from there.
    pub async fn rebase(&self, seq: u32) {
        let mut index = self.index.lock().await;
        log::debug!("Rebasing expected sequence {} -> {}", index.expected_seq, seq);
        index.expected_seq = seq;
        self.expected.store(seq, Ordering::SeqCst);
        self.prune(&mut index);
        self.drain(&mut index).await;
    }

    async fn drain(&self, index: &mut Index) {
        let mut drained = false;
        while let Some(chunk) = index.segments.remove(&index.expected_seq) {
            let len = chunk.len();
            index.expected_seq = index.expected_seq.wrapping_add(len as u32);
            self.expected.store(index.expected_seq, Ordering::SeqCst);
            self.buffered.fetch_sub(len, Ordering::SeqCst);
            self.available.fetch_add(len, Ordering::SeqCst);
            drained = true;

            if self.tx.send(chunk).await.is_err() {
                self.available.fetch_sub(len, Ordering::SeqCst);
                log::debug!("Reassembly buffer closed, dropping drained chunk");
                return;
            }
            self.counters
                .delivered_bytes
                .fetch_add(len as u64, Ordering::Relaxed);
        }

        if drained {
            self.prune(index);
        }
    }

    // Drop parked segments that now sit behind the expected sequence number.
    fn prune(&self, index: &mut Index) {
        let expected = index.expected_seq;
        let window = self.window;
        let mut released = 0;
        let mut stale = 0;
        index.segments.retain(|&seq, chunk| {
            let keep = in_window(expected, window, seq);
            if !keep {
                released += chunk.len();
                stale += 1;
            }
            keep
        });
        if stale > 0 {
            self.buffered.fetch_sub(released, Ordering::SeqCst);
            self.counters.stale.fetch_add(stale, Ordering::Relaxed);
        }
    }

    /// Next drained chunk, waiting until one exists.
    ///
    /// Returns [`ReplayError::BufferClosed`] once the buffer is closed and
    /// every chunk queued before the close has been read.
    pub async fn read(&self) -> Result<Bytes> {
        match self.rx.recv().await {
            Ok(chunk) => {
                self.available.fetch_sub(chunk.len(), Ordering::SeqCst);
                Ok(chunk)
            }
            Err(_) => Err(ReplayError::BufferClosed),
        }
    }

    /// Read chunks until at least `min_len` bytes have accumulated.
    ///
    /// A close ends the loop early with whatever was read; it is only an
    /// error when nothing was read at all.
    pub async fn read_at_least(&self, min_len: usize) -> Result<Bytes> {
        let mut out = BytesMut::new();
        while out.len() < min_len {
            match self.read().await {
                Ok(chunk) => out.extend_from_slice(&chunk),
                Err(ReplayError::BufferClosed) if !out.is_empty() => break,
                Err(e) => return Err(e),
            }
        }
        Ok(out.freeze())
    }

    /// Wake any pending reader with the closed signal. Safe to call repeatedly.
    pub fn close(&self) {
        if self.tx.close() {
            log::debug!("Reassembly buffer closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Next sequence number the buffer will deliver. Never waits on the writer.
    pub fn expected_seq(&self) -> u32 {
        self.expected.load(Ordering::SeqCst)
    }

    /// Bytes parked in the index waiting for a predecessor.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    /// Bytes drained into the hand-off queue but not yet read.
    pub fn available_bytes(&self) -> usize {
        self.available.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            discarded_out_of_window: self.counters.out_of_window.load(Ordering::Relaxed),
            discarded_duplicate: self.counters.duplicate.load(Ordering::Relaxed),
            discarded_stale: self.counters.stale.load(Ordering::Relaxed),
            delivered_bytes: self.counters.delivered_bytes.load(Ordering::Relaxed),
        }
    }
}
