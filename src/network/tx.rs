// WIGIG DATAPATH — NETWORK: TRANSMIT ENGINE
// Builds descriptor chains from outbound frames (plain or TSO), maps
// buffers, publishes the ring head and doorbell, and reclaims completed
// chains on completion notifications.
//
// Chain ownership: the frame is shared (Arc) between the submission call and
// every slot context of its chain; the reference held by the chain-terminal
// slot is released last and carries the stats update. Each slot context
// records its own mapping kind, so reclaim and teardown release mappings
// correctly without knowing how the chain was laid out.
//
// Concurrency: submit is the ring's single producer, reclaim its single
// consumer. Concurrent submits to one ring must be serialized by the caller
// (per-queue transmit serialization); submit vs. reclaim is the supported
// concurrent pair.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use bytemuck::Zeroable;
use log::{debug, warn};

use crate::engine::ring::DescRing;
use crate::engine::runtime::clock_ns;
use crate::error::Error;
use crate::network::hw::{
    Bus, DmaAddr, FirmwareCtl, MapDirection, MapKind, PeerTable, RingHandle, TxDescriptor,
    ETH_HDR_LEN, MAX_TX_RINGS, TX_FLAG_CSUM_IP, TX_FLAG_CSUM_L4, TX_FLAG_EOP, TX_FLAG_TSO,
    TX_SEG_FIRST, TX_SEG_HEADER, TX_SEG_LAST, TX_SEG_MIDDLE, TX_SEG_PLAIN,
};
use crate::network::{DeviceStats, OperMode, TxFrame};

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const IPPROTO_TCP: u8 = 6;

// ============================================================================
// SLOT CONTEXT
// ============================================================================

/// Software-side bookkeeping for one staged descriptor. Holding the Arc is
/// what keeps the frame alive until the whole chain is reclaimed.
pub struct TxSlotCtx {
    frame: Arc<TxFrame>,
    addr: DmaAddr,
    len: usize,
    kind: MapKind,
    /// Chain-terminal slot: releases the last frame reference and carries
    /// the packet/byte/error counter update.
    last: bool,
}

// ============================================================================
// TRANSMIT RING
// ============================================================================

pub struct TxRing {
    ring: DescRing<TxDescriptor, TxSlotCtx>,
    handle: RingHandle,
    cid: u8,
    tid: u8,
    /// Backpressure: set when available slots fall under capacity/8,
    /// cleared by reclaim once they recover above capacity/4.
    paused: AtomicBool,
    /// When the ring last became empty (utilization reporting).
    last_idle_ns: AtomicU64,
    /// Accumulated idle time.
    idle_ns: AtomicU64,
}

impl TxRing {
    pub fn cid(&self) -> u8 {
        self.cid
    }

    pub fn tid(&self) -> u8 {
        self.tid
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn idle_ns(&self) -> u64 {
        self.idle_ns.load(Ordering::Relaxed)
    }

    /// The underlying descriptor ring. Descriptor slots follow the ring's
    /// producer/consumer ownership contract.
    pub fn desc_ring(&self) -> &DescRing<TxDescriptor, TxSlotCtx> {
        &self.ring
    }
}

// ============================================================================
// CHAIN BUILDER
// ============================================================================

/// Stages descriptors above the published head. Nothing staged is visible to
/// hardware or to reclaim until the caller advances the head, so a failed
/// build unwinds by walking the staged range back.
struct ChainBuilder<'a, B: Bus> {
    bus: &'a B,
    ring: &'a DescRing<TxDescriptor, TxSlotCtx>,
    head: u32,
    staged: u32,
    last_idx: u32,
}

impl<'a, B: Bus> ChainBuilder<'a, B> {
    fn new(bus: &'a B, ring: &'a DescRing<TxDescriptor, TxSlotCtx>) -> Self {
        let head = ring.head();
        ChainBuilder {
            bus,
            ring,
            head,
            staged: 0,
            last_idx: head,
        }
    }

    fn staged(&self) -> u32 {
        self.staged
    }

    fn last_idx(&self) -> u32 {
        self.last_idx
    }

    /// Map `buf` and fill the next staged descriptor. Fails with `RingFull`
    /// when the staged count reaches the available-slot limit.
    fn stage(
        &mut self,
        buf: &[u8],
        kind: MapKind,
        frame: &Arc<TxFrame>,
        flags: u32,
        seg_type: u8,
    ) -> Result<u32, Error> {
        if self.staged >= self.ring.available_slots() {
            return Err(Error::RingFull);
        }
        let addr = self.bus.map(buf, kind, MapDirection::ToDevice)?;
        let idx = self.ring.offset(self.head, self.staged);
        // SAFETY: slot is above the published head and below the staging
        // limit, so the producer (this call path) exclusively owns it.
        unsafe {
            let d = &mut *self.ring.desc_ptr(idx);
            *d = TxDescriptor::zeroed();
            d.set_addr(addr);
            d.length = buf.len() as u16;
            d.flags = flags;
            d.seg_type = seg_type;
            self.ring.put_ctx(
                idx,
                TxSlotCtx {
                    frame: Arc::clone(frame),
                    addr,
                    len: buf.len(),
                    kind,
                    last: false,
                },
            );
        }
        self.staged += 1;
        self.last_idx = idx;
        Ok(idx)
    }

    /// Mutable access to a staged descriptor.
    ///
    /// # Safety
    /// `idx` must be a slot this builder staged.
    unsafe fn desc_at(&self, idx: u32) -> &mut TxDescriptor {
        &mut *self.ring.desc_ptr(idx)
    }

    /// Flag a staged slot's context as chain-terminal.
    fn mark_last(&self, idx: u32) {
        // SAFETY: staged slots are producer-owned until the head advances.
        unsafe {
            if let Some(mut ctx) = self.ring.take_ctx(idx) {
                ctx.last = true;
                self.ring.put_ctx(idx, ctx);
            }
        }
    }

    /// Undo every staged slot: unmap, drop the frame reference, blank the
    /// descriptor. No partial state survives.
    fn unwind(self) {
        for i in 0..self.staged {
            let idx = self.ring.offset(self.head, i);
            // SAFETY: staged slots are producer-owned; the head was never
            // advanced, so neither hardware nor reclaim has seen them.
            unsafe {
                if let Some(ctx) = self.ring.take_ctx(idx) {
                    self.bus
                        .unmap(ctx.addr, ctx.len, ctx.kind, MapDirection::ToDevice);
                }
                *self.ring.desc_ptr(idx) = TxDescriptor::zeroed();
            }
        }
    }
}

// ============================================================================
// TSO HEADER PARSING
// ============================================================================

/// Validate that the frame is TCP, zero the header fields hardware
/// recomputes per segment (IPv4 total-length/checksum, IPv6 payload-length),
/// and return the total protocol header length.
fn tso_prepare_headers(head: &mut [u8]) -> Result<usize, Error> {
    if head.len() < ETH_HDR_LEN + 20 {
        return Err(Error::MalformedFrame);
    }
    let ethertype = u16::from_be_bytes([head[12], head[13]]);
    let l4_off = match ethertype {
        ETHERTYPE_IPV4 => {
            let ihl = ((head[ETH_HDR_LEN] & 0x0f) as usize) * 4;
            if ihl < 20 || head.len() < ETH_HDR_LEN + ihl {
                return Err(Error::MalformedFrame);
            }
            if head[ETH_HDR_LEN + 9] != IPPROTO_TCP {
                return Err(Error::NotTcp);
            }
            head[16] = 0; // total length, recomputed per segment
            head[17] = 0;
            head[24] = 0; // header checksum, recomputed per segment
            head[25] = 0;
            ETH_HDR_LEN + ihl
        }
        ETHERTYPE_IPV6 => {
            if head.len() < ETH_HDR_LEN + 40 {
                return Err(Error::MalformedFrame);
            }
            if head[ETH_HDR_LEN + 6] != IPPROTO_TCP {
                return Err(Error::NotTcp);
            }
            head[18] = 0; // payload length, recomputed per segment
            head[19] = 0;
            ETH_HDR_LEN + 40
        }
        _ => return Err(Error::NotTcp),
    };
    if head.len() < l4_off + 20 {
        return Err(Error::MalformedFrame);
    }
    let doff = ((head[l4_off + 12] >> 4) as usize) * 4;
    if doff < 20 || head.len() < l4_off + doff {
        return Err(Error::MalformedFrame);
    }
    Ok(l4_off + doff)
}

// ============================================================================
// TRANSMIT ENGINE
// ============================================================================

pub struct TxEngine<B: Bus> {
    bus: Arc<B>,
    peers: Arc<PeerTable>,
    stats: Arc<DeviceStats>,
    mode: OperMode,
    rings: [RwLock<Option<Arc<TxRing>>>; MAX_TX_RINGS],
}

impl<B: Bus> TxEngine<B> {
    pub fn new(bus: Arc<B>, peers: Arc<PeerTable>, stats: Arc<DeviceStats>, mode: OperMode) -> Self {
        TxEngine {
            bus,
            peers,
            stats,
            mode,
            rings: std::array::from_fn(|_| RwLock::new(None)),
        }
    }

    /// Configure a transmit ring for (peer, traffic class) through firmware
    /// and allocate its descriptor storage.
    pub fn create_ring(
        &self,
        fw: &dyn FirmwareCtl,
        ring_id: usize,
        cid: u8,
        tid: u8,
        capacity: u32,
    ) -> Result<(), Error> {
        assert!(ring_id < MAX_TX_RINGS, "ring id out of range");
        if !self.peers.is_connected(cid) {
            return Err(Error::InvalidPeer(cid));
        }
        let handle = fw.configure_tx_ring(cid, tid, capacity)?;
        let ring = DescRing::new(capacity)?;
        *self.rings[ring_id].write().unwrap() = Some(Arc::new(TxRing {
            ring,
            handle,
            cid,
            tid,
            paused: AtomicBool::new(false),
            last_idle_ns: AtomicU64::new(clock_ns()),
            idle_ns: AtomicU64::new(0),
        }));
        debug!("tx ring {ring_id} up: cid {cid} tid {tid} capacity {capacity}");
        Ok(())
    }

    /// Tear a ring down, draining outstanding slots and releasing whatever
    /// buffer ownership each still holds. Caller quiesces both submit and
    /// reclaim first.
    pub fn destroy_ring(&self, ring_id: usize) {
        let Some(ring) = self.rings[ring_id].write().unwrap().take() else {
            return;
        };
        let r = &ring.ring;
        let head = r.head();
        let mut tail = r.tail();
        let mut drained = 0u32;
        while tail != head {
            // SAFETY: teardown contract, no concurrent producer or consumer.
            if let Some(ctx) = unsafe { r.take_ctx(tail) } {
                self.bus
                    .unmap(ctx.addr, ctx.len, ctx.kind, MapDirection::ToDevice);
            }
            tail = r.next(tail);
            drained += 1;
        }
        if drained > 0 {
            warn!("tx ring {ring_id} torn down with {drained} outstanding descriptors");
        }
    }

    pub fn ring(&self, ring_id: usize) -> Option<Arc<TxRing>> {
        self.rings.get(ring_id)?.read().unwrap().clone()
    }

    fn ring_for_cid(&self, cid: u8) -> Option<Arc<TxRing>> {
        for slot in &self.rings {
            if let Some(ring) = slot.read().unwrap().as_ref() {
                if ring.cid == cid {
                    return Some(Arc::clone(ring));
                }
            }
        }
        None
    }

    /// Transmit entry point. Broadcast/multicast frames are duplicated
    /// across every active ring; in access-point mode each copy gets the
    /// ring's peer unicast destination, in station mode the group address
    /// is kept.
    pub fn submit(&self, frame: TxFrame) -> Result<(), Error> {
        if frame.head.len() < ETH_HDR_LEN {
            return Err(Error::MalformedFrame);
        }

        if frame.is_broadcast() {
            let mut sent = 0u32;
            let mut last_err = Error::InvalidPeer(0xff);
            for slot in &self.rings {
                let Some(ring) = slot.read().unwrap().clone() else {
                    continue;
                };
                let mut copy = frame.clone();
                if self.mode == OperMode::AccessPoint {
                    if let Some(mac) = self.peers.mac(ring.cid) {
                        copy.set_dest_mac(mac);
                    }
                }
                match self.submit_to_ring(&ring, copy) {
                    Ok(()) => sent += 1,
                    Err(e) => last_err = e,
                }
            }
            if sent > 0 {
                Ok(())
            } else {
                Err(last_err)
            }
        } else {
            let mac = frame.dest_mac().ok_or(Error::MalformedFrame)?;
            let cid = self
                .peers
                .find_by_mac(&mac)
                .ok_or(Error::InvalidPeer(0xff))?;
            let ring = self.ring_for_cid(cid).ok_or(Error::InvalidPeer(cid))?;
            self.submit_to_ring(&ring, frame)
        }
    }

    fn submit_to_ring(&self, ring: &TxRing, frame: TxFrame) -> Result<(), Error> {
        if ring.paused.load(Ordering::Acquire) {
            self.stats.tx_ring_full.fetch_add(1, Ordering::Relaxed);
            return Err(Error::RingFull);
        }

        let was_empty = ring.ring.is_empty();
        let built = if frame.mss.is_some() {
            self.build_tso(ring, frame)
        } else {
            self.build_plain(ring, frame)
        };
        let staged = match built {
            Ok(n) => n,
            Err(e) => {
                if e == Error::RingFull {
                    self.stats.tx_ring_full.fetch_add(1, Ordering::Relaxed);
                }
                return Err(e);
            }
        };

        if was_empty {
            let now = clock_ns();
            let last = ring.last_idle_ns.load(Ordering::Relaxed);
            ring.idle_ns
                .fetch_add(now.saturating_sub(last), Ordering::Relaxed);
        }

        ring.ring.advance_head(staged);
        self.bus
            .doorbell(ring.handle.doorbell_reg, ring.ring.head());

        if ring.ring.available_slots() < ring.ring.capacity() / 8 {
            ring.paused.store(true, Ordering::Release);
            debug!("tx ring cid {} paused, {} slots left", ring.cid, ring.ring.available_slots());
        }
        Ok(())
    }

    /// One chain of 1 + fragment_count descriptors, one buffer each.
    fn build_plain(&self, ring: &TxRing, frame: TxFrame) -> Result<u32, Error> {
        let needed = 1 + frame.frags.len() as u32;
        if ring.ring.available_slots() < needed {
            return Err(Error::RingFull);
        }
        let csum = if frame.csum_offload { TX_FLAG_CSUM_L4 } else { 0 };
        let frame = Arc::new(frame);
        let mut b = ChainBuilder::new(self.bus.as_ref(), &ring.ring);

        let built = (|b: &mut ChainBuilder<'_, B>| -> Result<(), Error> {
            let first = b.stage(&frame.head, MapKind::Single, &frame, csum, TX_SEG_PLAIN)?;
            for frag in &frame.frags {
                b.stage(frag, MapKind::Fragment, &frame, csum, TX_SEG_PLAIN)?;
            }
            // SAFETY: both indices were staged by this builder.
            unsafe {
                b.desc_at(first).num_descs = needed as u8;
                b.desc_at(b.last_idx()).flags |= TX_FLAG_EOP;
            }
            b.mark_last(b.last_idx());
            Ok(())
        })(&mut b);

        match built {
            Ok(()) => Ok(b.staged()),
            Err(e) => {
                b.unwind();
                Err(e)
            }
        }
    }

    /// Segmented chain: a dedicated header descriptor, then the payload
    /// partitioned so each logical segment accumulates `mss` bytes. Closing
    /// a segment marks its last descriptor terminal and stamps the segment's
    /// descriptor count on its first; the header descriptor carries the
    /// whole chain's count.
    fn build_tso(&self, ring: &TxRing, mut frame: TxFrame) -> Result<u32, Error> {
        let mss = frame.mss.unwrap_or(0) as usize;
        if mss == 0 {
            return Err(Error::NotTcp);
        }
        let hdrlen = tso_prepare_headers(&mut frame.head)?;
        let payload = frame.total_len() - hdrlen;
        if payload == 0 {
            return Err(Error::MalformedFrame);
        }

        // Worst case: one descriptor per contiguous piece plus one extra
        // split per segment boundary, plus the header descriptor.
        let segments = payload.div_ceil(mss) as u32;
        let pieces = 1 + frame.frags.len() as u32;
        if ring.ring.available_slots() < 1 + pieces + segments {
            return Err(Error::RingFull);
        }

        let csum = TX_FLAG_CSUM_L4 | TX_FLAG_CSUM_IP;
        let frame = Arc::new(frame);
        let mut b = ChainBuilder::new(self.bus.as_ref(), &ring.ring);

        let built = (|b: &mut ChainBuilder<'_, B>| -> Result<(), Error> {
            let hidx = b.stage(
                &frame.head[..hdrlen],
                MapKind::Single,
                &frame,
                TX_FLAG_TSO | TX_FLAG_EOP | csum,
                TX_SEG_HEADER,
            )?;

            let mut rem = mss;
            let mut seg_first: Option<u32> = None;
            let mut seg_count: u8 = 0;
            let mut last = hidx;

            let head_piece: &[u8] = &frame.head[hdrlen..];
            let data = std::iter::once((head_piece, MapKind::Single)).chain(
                frame
                    .frags
                    .iter()
                    .map(|f| (f.as_slice(), MapKind::Fragment)),
            );

            for (buf, kind) in data {
                let mut off = 0;
                while off < buf.len() {
                    let take = rem.min(buf.len() - off);
                    let seg_type = if seg_first.is_none() {
                        TX_SEG_FIRST
                    } else {
                        TX_SEG_MIDDLE
                    };
                    let idx = b.stage(&buf[off..off + take], kind, &frame, csum, seg_type)?;
                    if seg_first.is_none() {
                        seg_first = Some(idx);
                    }
                    seg_count += 1;
                    off += take;
                    rem -= take;
                    last = idx;
                    if rem == 0 {
                        // SAFETY: both indices were staged by this builder.
                        unsafe {
                            b.desc_at(idx).flags |= TX_FLAG_EOP;
                            b.desc_at(seg_first.unwrap()).num_descs = seg_count;
                        }
                        seg_first = None;
                        seg_count = 0;
                        rem = mss;
                    }
                }
            }

            if seg_count > 0 {
                // Trailing short segment.
                // SAFETY: staged by this builder.
                unsafe {
                    b.desc_at(last).flags |= TX_FLAG_EOP;
                    b.desc_at(seg_first.unwrap()).num_descs = seg_count;
                }
            }
            // SAFETY: staged by this builder.
            unsafe {
                b.desc_at(last).seg_type = TX_SEG_LAST;
                b.desc_at(hidx).num_descs = b.staged() as u8;
            }
            b.mark_last(last);
            Ok(())
        })(&mut b);

        match built {
            Ok(()) => Ok(b.staged()),
            Err(e) => {
                b.unwind();
                Err(e)
            }
        }
    }

    /// Completion pass for one ring. Retires descriptors from the tail while
    /// hardware has marked them done, stopping at a chain-terminal
    /// descriptor whose done bit is still clear (the terminal bit is
    /// authoritative for the chain). Returns the number retired, bounded by
    /// `budget`.
    pub fn reclaim(&self, ring_id: usize, budget: usize) -> usize {
        let Some(ring) = self.ring(ring_id) else {
            warn!("tx completion for ring {ring_id}: not initialized");
            return 0;
        };
        let r = &ring.ring;
        let head = r.head();

        // Furthest descriptor hardware has completed; descriptors between
        // tail and there retire unless a terminal descriptor gates them.
        let mut rel_to = r.tail();
        let mut scan = r.tail();
        while scan != head {
            // SAFETY: consumer owns [tail, head).
            let d = unsafe { *r.desc_ptr(scan) };
            if d.is_done() {
                rel_to = r.next(scan);
            }
            scan = r.next(scan);
        }

        let mut retired = 0usize;
        let mut tail = r.tail();
        while tail != rel_to && retired < budget {
            // SAFETY: consumer owns [tail, head); tail has not advanced yet.
            let d = unsafe { &mut *r.desc_ptr(tail) };
            if d.is_eop() && !d.is_done() {
                break;
            }
            debug!(
                "tx[{:3}] retired: {} bytes, status {:#04x} err {:#04x}",
                tail, d.length, d.status, d.error
            );
            // SAFETY: same slot ownership as above.
            if let Some(ctx) = unsafe { r.take_ctx(tail) } {
                self.bus
                    .unmap(ctx.addr, ctx.len, ctx.kind, MapDirection::ToDevice);
                if ctx.last {
                    let stats = self.peers.stats(ring.cid);
                    if d.error == 0 {
                        stats.tx_packets.fetch_add(1, Ordering::Relaxed);
                        stats
                            .tx_bytes
                            .fetch_add(ctx.frame.total_len() as u64, Ordering::Relaxed);
                    } else {
                        stats.tx_errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
                // ctx drops here, releasing this slot's frame reference.
            }
            *d = TxDescriptor::zeroed();
            tail = r.next(tail);
            retired += 1;
        }

        if retired > 0 {
            r.advance_tail(retired as u32);
        }
        if r.is_empty() {
            ring.last_idle_ns.store(clock_ns(), Ordering::Relaxed);
        }
        if r.available_slots() > r.capacity() / 4 {
            ring.paused.store(false, Ordering::Release);
        }
        retired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::hw::TX_STATUS_DONE;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicI64;
    use std::sync::Mutex;

    // ------------------------------------------------------------------
    // Mocks
    // ------------------------------------------------------------------

    struct MockBus {
        next_addr: AtomicU64,
        active: Mutex<HashMap<u64, (usize, MapKind)>>,
        doorbells: Mutex<Vec<(u32, u32)>>,
        /// Remaining maps before failure; negative = never fail.
        fail_after: AtomicI64,
    }

    impl MockBus {
        fn new() -> Self {
            MockBus {
                next_addr: AtomicU64::new(0x1000),
                active: Mutex::new(HashMap::new()),
                doorbells: Mutex::new(Vec::new()),
                fail_after: AtomicI64::new(-1),
            }
        }

        fn active_mappings(&self) -> usize {
            self.active.lock().unwrap().len()
        }

        fn doorbell_count(&self) -> usize {
            self.doorbells.lock().unwrap().len()
        }
    }

    impl Bus for MockBus {
        fn map(&self, buf: &[u8], kind: MapKind, _dir: MapDirection) -> Result<DmaAddr, Error> {
            let remaining = self.fail_after.load(Ordering::Relaxed);
            if remaining == 0 {
                return Err(Error::MappingFailure);
            }
            if remaining > 0 {
                self.fail_after.fetch_sub(1, Ordering::Relaxed);
            }
            let addr = self.next_addr.fetch_add(0x1000, Ordering::Relaxed);
            self.active.lock().unwrap().insert(addr, (buf.len(), kind));
            Ok(DmaAddr(addr))
        }

        fn unmap(&self, addr: DmaAddr, len: usize, kind: MapKind, _dir: MapDirection) {
            let removed = self.active.lock().unwrap().remove(&addr.0);
            assert_eq!(removed, Some((len, kind)), "unmap mismatch");
        }

        fn doorbell(&self, register: u32, value: u32) {
            self.doorbells.lock().unwrap().push((register, value));
        }
    }

    struct MockFw;

    impl FirmwareCtl for MockFw {
        fn configure_tx_ring(&self, _cid: u8, _tid: u8, _size: u32) -> Result<RingHandle, Error> {
            Ok(RingHandle {
                base: 0xdead_0000,
                doorbell_reg: 0x44,
            })
        }

        fn configure_rx_ring(&self, _size: u32) -> Result<RingHandle, Error> {
            Ok(RingHandle {
                base: 0xbeef_0000,
                doorbell_reg: 0x48,
            })
        }

        fn send_backack_response(
            &self,
            _cid: u8,
            _tid: u8,
            _dialog_token: u8,
            _status: u16,
            _amsdu: bool,
            _agg_wsize: u16,
            _timeout: u16,
        ) -> Result<(), Error> {
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Frame builders
    // ------------------------------------------------------------------

    const PEER_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];

    fn eth_frame(payload_len: usize) -> TxFrame {
        let mut head = Vec::new();
        head.extend_from_slice(&PEER_MAC);
        head.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
        head.extend_from_slice(&0x0800u16.to_be_bytes());
        head.resize(14 + payload_len, 0xab);
        TxFrame::new(head)
    }

    fn tcp_frame(payload_len: usize, mss: u16) -> TxFrame {
        let mut head = Vec::new();
        head.extend_from_slice(&PEER_MAC);
        head.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
        head.extend_from_slice(&0x0800u16.to_be_bytes());
        // Minimal IPv4 header, protocol TCP.
        let mut ip = [0u8; 20];
        ip[0] = 0x45;
        ip[9] = IPPROTO_TCP;
        head.extend_from_slice(&ip);
        // Minimal TCP header, data offset 5.
        let mut tcp = [0u8; 20];
        tcp[12] = 5 << 4;
        head.extend_from_slice(&tcp);
        head.resize(54 + payload_len, 0xcd);
        let mut f = TxFrame::new(head);
        f.mss = Some(mss);
        f
    }

    fn engine(capacity: u32) -> (Arc<MockBus>, TxEngine<MockBus>) {
        let bus = Arc::new(MockBus::new());
        let peers = Arc::new(PeerTable::new());
        peers.connect(0, PEER_MAC).unwrap();
        let eng = TxEngine::new(
            Arc::clone(&bus),
            peers,
            Arc::new(DeviceStats::default()),
            OperMode::Station,
        );
        eng.create_ring(&MockFw, 0, 0, 0, capacity).unwrap();
        (bus, eng)
    }

    fn complete_all(ring: &TxRing) {
        let r = ring.desc_ring();
        let mut i = r.tail();
        while i != r.head() {
            // SAFETY: test stands in for hardware; no concurrent access.
            unsafe { (*r.desc_ptr(i)).status |= TX_STATUS_DONE };
            i = r.next(i);
        }
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    #[test]
    fn plain_chain_layout() {
        let (bus, eng) = engine(32);
        let mut f = eth_frame(100);
        f.frags.push(vec![0xee; 64]);
        f.frags.push(vec![0xee; 32]);
        eng.submit(f).unwrap();

        let ring = eng.ring(0).unwrap();
        let r = ring.desc_ring();
        assert_eq!(r.used(), 3);
        // SAFETY: single-threaded test.
        let (first, mid, last) = unsafe { (*r.desc_ptr(0), *r.desc_ptr(1), *r.desc_ptr(2)) };
        assert_eq!(first.num_descs, 3);
        assert!(!first.is_eop());
        assert!(!mid.is_eop());
        assert!(last.is_eop());
        assert_eq!(bus.doorbell_count(), 1);
        assert_eq!(bus.active_mappings(), 3);
    }

    #[test]
    fn round_trip_releases_one_frame_reference() {
        let (bus, eng) = engine(32);
        let mut f = eth_frame(100);
        f.frags.push(vec![0xee; 64]);
        eng.submit(f).unwrap();

        let ring = eng.ring(0).unwrap();
        complete_all(&ring);
        let retired = eng.reclaim(0, usize::MAX);
        assert_eq!(retired, 2);
        assert!(ring.desc_ring().is_empty());
        assert_eq!(bus.active_mappings(), 0);

        let stats = eng.peers.stats(0);
        assert_eq!(stats.tx_packets.load(Ordering::Relaxed), 1);
        assert_eq!(stats.tx_bytes.load(Ordering::Relaxed), 178);
    }

    #[test]
    fn reclaim_without_completions_is_a_no_op() {
        let (_bus, eng) = engine(32);
        eng.submit(eth_frame(60)).unwrap();
        let ring = eng.ring(0).unwrap();
        let tail_before = ring.desc_ring().tail();
        for _ in 0..3 {
            assert_eq!(eng.reclaim(0, usize::MAX), 0);
            assert_eq!(ring.desc_ring().tail(), tail_before);
        }
    }

    #[test]
    fn error_completion_counts_tx_errors() {
        let (_bus, eng) = engine(32);
        eng.submit(eth_frame(60)).unwrap();
        let ring = eng.ring(0).unwrap();
        let r = ring.desc_ring();
        // SAFETY: test stands in for hardware.
        unsafe {
            (*r.desc_ptr(0)).status |= TX_STATUS_DONE;
            (*r.desc_ptr(0)).error = 1;
        }
        eng.reclaim(0, usize::MAX);
        let stats = eng.peers.stats(0);
        assert_eq!(stats.tx_packets.load(Ordering::Relaxed), 0);
        assert_eq!(stats.tx_errors.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn ring_full_rejected() {
        let (_bus, eng) = engine(4);
        // One slot always stays empty: a 4-entry ring holds 3 chains.
        eng.submit(eth_frame(60)).unwrap();
        eng.submit(eth_frame(60)).unwrap();
        eng.submit(eth_frame(60)).unwrap();
        assert!(matches!(eng.submit(eth_frame(60)), Err(Error::RingFull)));
    }

    #[test]
    fn backpressure_pause_and_resume() {
        let (_bus, eng) = engine(16);
        // capacity/8 = 2: pause once available drops under 2.
        for _ in 0..14 {
            eng.submit(eth_frame(60)).unwrap();
        }
        let ring = eng.ring(0).unwrap();
        assert!(ring.is_paused());
        assert!(matches!(eng.submit(eth_frame(60)), Err(Error::RingFull)));

        complete_all(&ring);
        eng.reclaim(0, usize::MAX);
        assert!(!ring.is_paused());
        eng.submit(eth_frame(60)).unwrap();
    }

    #[test]
    fn tso_three_full_segments() {
        let (_bus, eng) = engine(64);
        let mss = 256u16;
        eng.submit(tcp_frame(3 * mss as usize, mss)).unwrap();

        let ring = eng.ring(0).unwrap();
        let r = ring.desc_ring();
        let total = r.used();

        // SAFETY: single-threaded test.
        let header = unsafe { *r.desc_ptr(0) };
        assert_eq!(header.seg_type, TX_SEG_HEADER);
        assert!(header.flags & TX_FLAG_TSO != 0);
        assert_eq!(header.num_descs as u32, total);

        let mut terminal_beyond_header = 0;
        let mut seg_bytes = 0usize;
        for i in 1..total {
            let d = unsafe { *r.desc_ptr(i) };
            seg_bytes += d.length as usize;
            if d.is_eop() {
                terminal_beyond_header += 1;
                assert_eq!(seg_bytes, mss as usize);
                seg_bytes = 0;
            }
        }
        assert_eq!(terminal_beyond_header, 3);
        let last = unsafe { *r.desc_ptr(total - 1) };
        assert_eq!(last.seg_type, TX_SEG_LAST);
    }

    #[test]
    fn tso_segments_split_across_fragments() {
        let (bus, eng) = engine(64);
        let mss = 300u16;
        // 100 bytes in the head piece, two fragments; 700 payload total
        // crosses two segment boundaries mid-fragment.
        let mut f = tcp_frame(100, mss);
        f.frags.push(vec![0x11; 400]);
        f.frags.push(vec![0x22; 200]);
        eng.submit(f).unwrap();

        let ring = eng.ring(0).unwrap();
        let r = ring.desc_ring();
        let total = r.used();
        let mut payload = 0usize;
        let mut terminals = 0;
        for i in 1..total {
            let d = unsafe { *r.desc_ptr(i) };
            payload += d.length as usize;
            if d.is_eop() {
                terminals += 1;
            }
        }
        assert_eq!(payload, 700);
        assert_eq!(terminals, 3); // 300 + 300 + 100
        complete_all(&ring);
        eng.reclaim(0, usize::MAX);
        assert_eq!(bus.active_mappings(), 0);
    }

    #[test]
    fn tso_rejects_non_tcp() {
        let (_bus, eng) = engine(32);
        let mut f = tcp_frame(512, 256);
        f.head[23] = 17; // ip protocol = UDP
        assert!(matches!(eng.submit(f), Err(Error::NotTcp)));
        let ring = eng.ring(0).unwrap();
        assert!(ring.desc_ring().is_empty());
    }

    #[test]
    fn tso_zeroes_ipv4_recomputed_fields() {
        let (_bus, eng) = engine(64);
        let mut f = tcp_frame(256, 128);
        f.head[16] = 0xaa; // stale total length
        f.head[17] = 0xbb;
        f.head[24] = 0xcc; // stale checksum
        f.head[25] = 0xdd;
        eng.submit(f).unwrap();
        // The mapped header is the frame's own buffer; grab it back through
        // the slot context at teardown.
        let ring = eng.ring(0).unwrap();
        let r = ring.desc_ring();
        // SAFETY: single-threaded test; slot 0 staged and published.
        let ctx_frame = unsafe {
            let ctx = r.take_ctx(0).unwrap();
            let frame = Arc::clone(&ctx.frame);
            r.put_ctx(0, ctx);
            frame
        };
        assert_eq!(&ctx_frame.head[16..18], &[0, 0]);
        assert_eq!(&ctx_frame.head[24..26], &[0, 0]);
    }

    #[test]
    fn failed_mapping_unwinds_fully() {
        let (bus, eng) = engine(64);
        bus.fail_after.store(2, Ordering::Relaxed);
        let mut f = eth_frame(100);
        f.frags.push(vec![0xee; 64]);
        f.frags.push(vec![0xee; 64]);
        let err = eng.submit(f).unwrap_err();
        assert_eq!(err, Error::MappingFailure);

        let ring = eng.ring(0).unwrap();
        assert!(ring.desc_ring().is_empty());
        assert_eq!(bus.active_mappings(), 0);
        assert_eq!(bus.doorbell_count(), 0);
    }

    #[test]
    fn unknown_destination_rejected() {
        let (_bus, eng) = engine(32);
        let mut f = eth_frame(60);
        f.head[..6].copy_from_slice(&[0x02, 9, 9, 9, 9, 9]);
        assert!(matches!(eng.submit(f), Err(Error::InvalidPeer(_))));
    }

    #[test]
    fn destroy_ring_releases_outstanding_mappings() {
        let (bus, eng) = engine(32);
        eng.submit(eth_frame(100)).unwrap();
        assert_eq!(bus.active_mappings(), 1);
        eng.destroy_ring(0);
        assert_eq!(bus.active_mappings(), 0);
        assert!(eng.ring(0).is_none());
    }
}
