// WIGIG DATAPATH — NETWORK: RECEIVE ENGINE
// Keeps the receive ring stocked with device-writable buffers, reaps slots
// the device has filled, rebuilds per-frame metadata from the descriptor,
// and dispatches: monitor capture, malformed/non-data filtering, the
// address-swap hardware workaround, checksum hints, then reorder or direct
// delivery.
//
// Ring orientation: refill is the producer (posts buffers, publishes its
// cursor to the hardware tail register), reap is the consumer (retires
// slots the device marked ready). Both normally run serially from the
// completion context, reap first.

use std::sync::{Arc, RwLock};

use bytemuck::Zeroable;
use log::{debug, warn};

use crate::engine::reorder::ReorderTable;
use crate::engine::ring::DescRing;
use crate::error::Error;
use crate::network::hw::{
    Bus, DmaAddr, FirmwareCtl, MapDirection, MapKind, PeerTable, RingHandle, RxDescriptor,
    DS_BITS_SWAPPED, ETH_HDR_LEN, FRAME_TYPE_DATA, MAX_PEERS, RX_ERROR_L4_CSUM,
    RX_STATUS_L4_IDENT,
};
use crate::network::{
    AccountingSink, CaptureMeta, CsumHint, DeliverySink, DeviceStats, OperMode, RxFrame, RxMeta,
};

/// Receive buffer size; covers the largest data frame plus metadata the
/// device prepends.
pub const RX_BUF_LEN: usize = 2048;

// ============================================================================
// SLOT CONTEXT / RING
// ============================================================================

pub struct RxSlotCtx {
    buf: Vec<u8>,
    addr: DmaAddr,
}

pub struct RxRing {
    ring: DescRing<RxDescriptor, RxSlotCtx>,
    handle: RingHandle,
}

impl RxRing {
    /// The underlying descriptor ring. Descriptor slots follow the ring's
    /// producer/consumer ownership contract.
    pub fn desc_ring(&self) -> &DescRing<RxDescriptor, RxSlotCtx> {
        &self.ring
    }
}

// ============================================================================
// RECEIVE ENGINE
// ============================================================================

pub struct RxEngine<B: Bus, S: DeliverySink> {
    bus: Arc<B>,
    peers: Arc<PeerTable>,
    stats: Arc<DeviceStats>,
    reorder: Arc<ReorderTable>,
    sink: Arc<S>,
    mode: OperMode,
    ring: RwLock<Option<Arc<RxRing>>>,
}

impl<B: Bus, S: DeliverySink> RxEngine<B, S> {
    pub fn new(
        bus: Arc<B>,
        peers: Arc<PeerTable>,
        stats: Arc<DeviceStats>,
        reorder: Arc<ReorderTable>,
        sink: Arc<S>,
        mode: OperMode,
    ) -> Self {
        RxEngine {
            bus,
            peers,
            stats,
            reorder,
            sink,
            mode,
            ring: RwLock::new(None),
        }
    }

    /// Configure the receive ring through firmware, allocate descriptor
    /// storage, and stock it full of buffers.
    pub fn init(&self, fw: &dyn FirmwareCtl, capacity: u32) -> Result<(), Error> {
        let handle = fw.configure_rx_ring(capacity)?;
        let ring = DescRing::new(capacity)?;
        *self.ring.write().unwrap() = Some(Arc::new(RxRing { ring, handle }));
        self.refill();
        Ok(())
    }

    /// Tear the ring down, unmapping and dropping every posted buffer.
    /// Caller quiesces the completion context first.
    pub fn destroy(&self) {
        let Some(ring) = self.ring.write().unwrap().take() else {
            return;
        };
        let r = &ring.ring;
        let head = r.head();
        let mut tail = r.tail();
        while tail != head {
            // SAFETY: teardown contract, no concurrent producer or consumer.
            if let Some(ctx) = unsafe { r.take_ctx(tail) } {
                self.bus
                    .unmap(ctx.addr, ctx.buf.len(), MapKind::Single, MapDirection::FromDevice);
            }
            tail = r.next(tail);
        }
    }

    pub fn ring(&self) -> Option<Arc<RxRing>> {
        self.ring.read().unwrap().clone()
    }

    /// Post fresh buffers until the ring is full, then publish the refill
    /// cursor to the doorbell once. A slot that fails allocation or mapping
    /// is logged and left for the next pass; the call itself never fails.
    pub fn refill(&self) -> usize {
        let Some(ring) = self.ring() else {
            return 0;
        };
        let r = &ring.ring;
        let mut posted = 0;
        while !r.is_full() {
            let mut buf = Vec::new();
            if buf.try_reserve_exact(RX_BUF_LEN).is_err() {
                warn!("rx refill: buffer allocation failed, retrying next pass");
                self.stats
                    .rx_refill_failures
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                break;
            }
            buf.resize(RX_BUF_LEN, 0);
            let addr = match self.bus.map(&buf, MapKind::Single, MapDirection::FromDevice) {
                Ok(a) => a,
                Err(e) => {
                    warn!("rx refill: mapping failed ({e}), retrying next pass");
                    self.stats
                        .rx_refill_failures
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    break;
                }
            };
            let idx = r.head();
            // SAFETY: producer owns the slot until advance_head publishes it.
            unsafe {
                let d = &mut *r.desc_ptr(idx);
                *d = RxDescriptor::zeroed();
                d.set_addr(addr);
                d.length = RX_BUF_LEN as u16;
                r.put_ctx(idx, RxSlotCtx { buf, addr });
            }
            r.advance_head(1);
            posted += 1;
        }
        self.bus.doorbell(ring.handle.doorbell_reg, r.head());
        posted
    }

    /// Retire the next device-filled slot, if any. `None` means caught up
    /// with hardware, the normal idle condition.
    pub fn reap(&self) -> Option<RxFrame> {
        let ring = self.ring()?;
        let r = &ring.ring;
        if r.is_empty() {
            return None;
        }
        let idx = r.tail();
        // SAFETY: consumer owns [tail, head).
        let d = unsafe { *r.desc_ptr(idx) };
        if !d.is_ready() {
            return None;
        }
        // SAFETY: same slot ownership; tail has not advanced yet.
        let ctx = unsafe { r.take_ctx(idx) }?;
        self.bus
            .unmap(ctx.addr, ctx.buf.len(), MapKind::Single, MapDirection::FromDevice);
        // SAFETY: slot still consumer-owned until advance_tail.
        unsafe {
            *r.desc_ptr(idx) = RxDescriptor::zeroed();
        }
        r.advance_tail(1);

        let mut data = ctx.buf;
        data.truncate((d.length as usize).min(data.len()));

        let csum = if d.status & RX_STATUS_L4_IDENT != 0 {
            if d.error & RX_ERROR_L4_CSUM != 0 {
                CsumHint::Invalid
            } else {
                CsumHint::Verified
            }
        } else {
            CsumHint::None
        };

        debug!(
            "rx[{:3}] : {} bytes, cid {} tid {} seq {:#05x} mcs {}",
            idx,
            data.len(),
            d.cid(),
            d.tid(),
            d.seq12(),
            d.mcs
        );

        Some(RxFrame {
            data,
            meta: RxMeta {
                cid: d.cid(),
                tid: d.tid(),
                seq: d.seq12(),
                mcs: d.mcs,
                frame_type: d.frame_type,
                ds_bits: d.ds_bits,
                csum,
            },
            capture: None,
        })
    }

    /// Filter, fix up, and route one reaped frame.
    pub fn dispatch(&self, mut frame: RxFrame) {
        use std::sync::atomic::Ordering;

        if self.mode == OperMode::Monitor {
            frame.capture = Some(CaptureMeta {
                mcs: frame.meta.mcs,
                frame_len: frame.data.len() as u16,
            });
            self.sink.deliver(frame);
            return;
        }

        if frame.data.len() < ETH_HDR_LEN {
            debug!("rx: runt frame ({} bytes), dropped", frame.data.len());
            self.stats.rx_malformed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if frame.meta.frame_type != FRAME_TYPE_DATA {
            debug!("rx: non-data ftype {}, dropped", frame.meta.frame_type);
            self.stats.rx_non_data.fetch_add(1, Ordering::Relaxed);
            return;
        }
        // The descriptor's cid field is a 4-bit nibble; the connection table
        // only has 8 entries, so the upper half of the range is garbage.
        if frame.meta.cid as usize >= MAX_PEERS {
            debug!("rx: cid {} out of range, dropped", frame.meta.cid);
            self.stats.rx_malformed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // The device swaps the two link-layer addresses for this traffic
        // direction; swap them back.
        if frame.meta.ds_bits == DS_BITS_SWAPPED {
            for i in 0..6 {
                frame.data.swap(i, i + 6);
            }
        }

        let acct = AccountingSink::new(self.peers.as_ref(), self.sink.as_ref());
        self.reorder.ingest(frame, &acct);
    }

    /// Completion-notification entry point: reap and dispatch up to `budget`
    /// frames, then restock the ring. Returns the number of frames handled.
    pub fn on_rx_ready(&self, budget: usize) -> usize {
        let mut handled = 0;
        while handled < budget {
            let Some(frame) = self.reap() else {
                break;
            };
            self.dispatch(frame);
            handled += 1;
        }
        self.refill();
        handled
    }
}
