// WIGIG DATAPATH — ENGINE: BLOCK-ACK REORDER
// Per-(peer, traffic-class) sliding-window buffer restoring delivery order
// under aggregation. Sequence numbers are 12-bit and compared wrap-aware;
// the window never holds more than the negotiated buffer size (<= 16).
//
// Window policy: an arrival beyond the forward window slides the head to
// (seq - buf_size + 1), releasing older slots in sequence order and skipping
// holes without retry. The slide is driven by the arriving frame's sequence,
// so a burst far ahead can skip past frames that were never received. That
// loss is the negotiated-window contract, and the hole counter makes it
// observable.

use std::sync::Mutex;

use log::debug;

use crate::engine::runtime::clock_ns;
use crate::network::hw::{MAX_PEERS, TRAFFIC_CLASSES};
use crate::network::{DeliverySink, RxFrame};

// ============================================================================
// SEQUENCE ARITHMETIC (12-bit, wrap-aware)
// ============================================================================

pub const SEQ_MODULO: u16 = 0x1000;
pub const SEQ_MASK: u16 = 0x0fff;

/// True when `a` is earlier than `b` going backward around the 12-bit ring.
#[inline(always)]
pub fn seq_less(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) & SEQ_MASK) > (SEQ_MODULO >> 1)
}

#[inline(always)]
pub fn seq_inc(s: u16) -> u16 {
    (s + 1) & SEQ_MASK
}

#[inline(always)]
pub fn seq_add(a: u16, n: u16) -> u16 {
    a.wrapping_add(n) & SEQ_MASK
}

#[inline(always)]
pub fn seq_sub(a: u16, b: u16) -> u16 {
    a.wrapping_sub(b) & SEQ_MASK
}

// ============================================================================
// REORDER SESSION
// ============================================================================

/// Locally supported maximum aggregation window.
pub const MAX_AGG_WINDOW: u16 = 16;

#[derive(Default, Clone, Copy, Debug)]
pub struct SessionStats {
    pub delivered: u64,
    pub buffered: u64,
    pub dup_dropped: u64,
    pub stale_dropped: u64,
    pub holes_skipped: u64,
}

pub struct ReorderSession {
    /// Slot index for sequence S is (S - ssn) mod buf_size.
    slots: Vec<Option<(RxFrame, u64)>>,
    buf_size: u16,
    ssn: u16,
    head_seq: u16,
    stored: u16,
    last_drop_seq: Option<u16>,
    stats: SessionStats,
}

impl ReorderSession {
    pub fn new(buf_size: u16, ssn: u16) -> Self {
        let buf_size = buf_size.clamp(1, MAX_AGG_WINDOW);
        let mut slots = Vec::with_capacity(buf_size as usize);
        slots.resize_with(buf_size as usize, || None);
        ReorderSession {
            slots,
            buf_size,
            ssn: ssn & SEQ_MASK,
            head_seq: ssn & SEQ_MASK,
            stored: 0,
            last_drop_seq: None,
            stats: SessionStats::default(),
        }
    }

    #[inline(always)]
    fn index(&self, seq: u16) -> usize {
        (seq_sub(seq, self.ssn) % self.buf_size) as usize
    }

    /// Deliver (or skip, if empty) the slot at the current head, then
    /// advance the head by one.
    fn release_head(&mut self, sink: &dyn DeliverySink) {
        let idx = self.index(self.head_seq);
        if let Some((frame, _ts)) = self.slots[idx].take() {
            self.stored -= 1;
            self.stats.delivered += 1;
            sink.deliver(frame);
        } else {
            self.stats.holes_skipped += 1;
        }
        self.head_seq = seq_inc(self.head_seq);
    }

    /// Release every slot from the current head up to (not including)
    /// `hseq`, in sequence order, skipping holes.
    fn release_up_to(&mut self, hseq: u16, sink: &dyn DeliverySink) {
        while seq_less(self.head_seq, hseq) {
            self.release_head(sink);
        }
    }

    /// Drain the run of contiguous occupied slots starting at the head.
    fn release_contiguous(&mut self, sink: &dyn DeliverySink) {
        while self.slots[self.index(self.head_seq)].is_some() {
            self.release_head(sink);
        }
    }

    /// Process one arrival. Caller holds the session lock.
    pub fn ingest(&mut self, frame: RxFrame, now_ns: u64, sink: &dyn DeliverySink) {
        let seq = frame.meta.seq & SEQ_MASK;

        // Stale duplicate: earlier than everything still deliverable.
        if seq_less(seq, self.head_seq) {
            debug!(
                "reorder: stale seq {:#05x} behind head {:#05x}, dropped",
                seq, self.head_seq
            );
            self.last_drop_seq = Some(seq);
            self.stats.stale_dropped += 1;
            return;
        }

        // Beyond the forward window: slide so the arrival fits, releasing
        // everything older in order (holes skipped, not retried).
        if !seq_less(seq, seq_add(self.head_seq, self.buf_size)) {
            let hseq = seq_inc(seq_sub(seq, self.buf_size));
            self.release_up_to(hseq, sink);
        }

        // Index against the possibly-advanced head.
        let idx = self.index(seq);
        if self.slots[idx].is_some() {
            debug!("reorder: duplicate seq {:#05x}, dropped", seq);
            self.stats.dup_dropped += 1;
            return;
        }

        // In order with nothing pending: no need to buffer.
        if seq == self.head_seq && self.stored == 0 {
            self.head_seq = seq_inc(self.head_seq);
            self.stats.delivered += 1;
            sink.deliver(frame);
            return;
        }

        self.slots[idx] = Some((frame, now_ns));
        self.stored += 1;
        self.stats.buffered += 1;
        self.release_contiguous(sink);
    }

    /// Flush every occupied slot within one full window of the head, in
    /// order. Used at teardown so buffered frames are never silently lost.
    pub fn flush(&mut self, sink: &dyn DeliverySink) {
        self.release_up_to(seq_add(self.head_seq, self.buf_size), sink);
    }

    pub fn buf_size(&self) -> u16 {
        self.buf_size
    }

    pub fn head_seq(&self) -> u16 {
        self.head_seq
    }

    pub fn stored(&self) -> u16 {
        self.stored
    }

    pub fn last_drop_seq(&self) -> Option<u16> {
        self.last_drop_seq
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }
}

// ============================================================================
// SESSION TABLE
// ============================================================================

/// Fixed table of optional sessions, one per (connection id, traffic class).
/// Each slot's mutex serializes ingest against open/close for that session;
/// distinct sessions proceed in parallel.
pub struct ReorderTable {
    slots: Box<[Mutex<Option<ReorderSession>>]>,
}

impl Default for ReorderTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ReorderTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_PEERS * TRAFFIC_CLASSES);
        slots.resize_with(MAX_PEERS * TRAFFIC_CLASSES, || Mutex::new(None));
        ReorderTable {
            slots: slots.into_boxed_slice(),
        }
    }

    #[inline(always)]
    fn slot(&self, cid: u8, tid: u8) -> Option<&Mutex<Option<ReorderSession>>> {
        if cid as usize >= MAX_PEERS || tid as usize >= TRAFFIC_CLASSES {
            return None;
        }
        Some(&self.slots[cid as usize * TRAFFIC_CLASSES + tid as usize])
    }

    /// Install a session, replacing any prior one for the pair. The prior
    /// session's buffered frames are flushed to delivery first; replace is
    /// atomic under the slot lock.
    pub fn open(&self, cid: u8, tid: u8, buf_size: u16, ssn: u16, sink: &dyn DeliverySink) {
        let Some(slot) = self.slot(cid, tid) else {
            return;
        };
        let mut guard = slot.lock().unwrap();
        if let Some(old) = guard.as_mut() {
            old.flush(sink);
        }
        *guard = Some(ReorderSession::new(buf_size, ssn));
    }

    /// Tear down the session for the pair, flushing buffered frames in order.
    pub fn close(&self, cid: u8, tid: u8, sink: &dyn DeliverySink) {
        let Some(slot) = self.slot(cid, tid) else {
            return;
        };
        let mut guard = slot.lock().unwrap();
        if let Some(old) = guard.as_mut() {
            old.flush(sink);
        }
        *guard = None;
    }

    pub fn has_session(&self, cid: u8, tid: u8) -> bool {
        self.slot(cid, tid)
            .map(|s| s.lock().unwrap().is_some())
            .unwrap_or(false)
    }

    /// Route one frame: through the session when one exists for the frame's
    /// (peer, traffic class), directly to the sink otherwise.
    pub fn ingest(&self, frame: RxFrame, sink: &dyn DeliverySink) {
        let Some(slot) = self.slot(frame.meta.cid, frame.meta.tid) else {
            sink.deliver(frame);
            return;
        };
        let mut guard = slot.lock().unwrap();
        match guard.as_mut() {
            Some(session) => session.ingest(frame, clock_ns(), sink),
            None => {
                drop(guard);
                sink.deliver(frame);
            }
        }
    }

    /// Negotiated window of one session, if present.
    pub fn session_window(&self, cid: u8, tid: u8) -> Option<u16> {
        self.slot(cid, tid)?
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.buf_size())
    }

    /// Stats snapshot for one session, if present.
    pub fn session_stats(&self, cid: u8, tid: u8) -> Option<SessionStats> {
        self.slot(cid, tid)?
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.stats())
    }
}
