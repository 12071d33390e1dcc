// WIGIG DATAPATH — ADAPTER FACADE
// Wires the peer table, transmit/receive engines, reorder table, and
// negotiation worker together behind the entry points the interrupt and
// submission boundaries call.

use std::sync::Arc;

use crate::engine::backack::{BackAckQueue, BackAckRequest};
use crate::engine::reorder::ReorderTable;
use crate::error::Error;
use crate::network::hw::{Bus, FirmwareCtl, PeerTable, TRAFFIC_CLASSES};
use crate::network::rx::RxEngine;
use crate::network::tx::TxEngine;
use crate::network::{AccountingSink, DeliverySink, DeviceStats, OperMode, TxFrame};

pub struct Datapath<B, F, S>
where
    B: Bus,
    F: FirmwareCtl + 'static,
    S: DeliverySink + 'static,
{
    fw: Arc<F>,
    sink: Arc<S>,
    peers: Arc<PeerTable>,
    stats: Arc<DeviceStats>,
    reorder: Arc<ReorderTable>,
    tx: TxEngine<B>,
    rx: RxEngine<B, S>,
    backack: BackAckQueue,
}

impl<B, F, S> Datapath<B, F, S>
where
    B: Bus,
    F: FirmwareCtl + 'static,
    S: DeliverySink + 'static,
{
    pub fn new(bus: Arc<B>, fw: Arc<F>, sink: Arc<S>, mode: OperMode) -> Self {
        let peers = Arc::new(PeerTable::new());
        let stats = Arc::new(DeviceStats::default());
        let reorder = Arc::new(ReorderTable::new());
        let tx = TxEngine::new(
            Arc::clone(&bus),
            Arc::clone(&peers),
            Arc::clone(&stats),
            mode,
        );
        let rx = RxEngine::new(
            bus,
            Arc::clone(&peers),
            Arc::clone(&stats),
            Arc::clone(&reorder),
            Arc::clone(&sink),
            mode,
        );
        let backack = BackAckQueue::spawn(
            Arc::clone(&fw),
            Arc::clone(&peers),
            Arc::clone(&reorder),
            Arc::clone(&sink),
        );
        Datapath {
            fw,
            sink,
            peers,
            stats,
            reorder,
            tx,
            rx,
            backack,
        }
    }

    // ------------------------------------------------------------------
    // Control plane
    // ------------------------------------------------------------------

    pub fn connect_peer(&self, cid: u8, mac: [u8; 6]) -> Result<(), Error> {
        self.peers.connect(cid, mac)
    }

    /// Drop the peer's link state and flush every reorder session it holds.
    /// Flushed frames still count as delivered for the peer.
    pub fn disconnect_peer(&self, cid: u8) {
        let sink = AccountingSink::new(self.peers.as_ref(), self.sink.as_ref());
        for tid in 0..TRAFFIC_CLASSES as u8 {
            self.reorder.close(cid, tid, &sink);
        }
        self.peers.disconnect(cid);
    }

    pub fn setup_tx_ring(&self, ring_id: usize, cid: u8, tid: u8, capacity: u32) -> Result<(), Error> {
        self.tx
            .create_ring(self.fw.as_ref(), ring_id, cid, tid, capacity)
    }

    pub fn teardown_tx_ring(&self, ring_id: usize) {
        self.tx.destroy_ring(ring_id);
    }

    pub fn setup_rx_ring(&self, capacity: u32) -> Result<(), Error> {
        self.rx.init(self.fw.as_ref(), capacity)
    }

    pub fn teardown_rx_ring(&self) {
        self.rx.destroy();
    }

    // ------------------------------------------------------------------
    // Data plane
    // ------------------------------------------------------------------

    /// Transmit entry point. `Err(RingFull)` is the busy signal; the caller
    /// retries after backpressure lifts.
    pub fn submit(&self, frame: TxFrame) -> Result<(), Error> {
        self.tx.submit(frame)
    }

    /// Completion-interrupt entry point for one transmit ring.
    pub fn on_tx_complete(&self, ring_id: usize, budget: usize) -> usize {
        self.tx.reclaim(ring_id, budget)
    }

    /// Receive-interrupt entry point.
    pub fn on_rx_ready(&self, budget: usize) -> usize {
        self.rx.on_rx_ready(budget)
    }

    // ------------------------------------------------------------------
    // Block-ack sessions
    // ------------------------------------------------------------------

    pub fn open_reorder_session(&self, cid: u8, tid: u8, window: u16, ssn: u16) {
        let sink = AccountingSink::new(self.peers.as_ref(), self.sink.as_ref());
        self.reorder.open(cid, tid, window, ssn, &sink);
    }

    pub fn close_reorder_session(&self, cid: u8, tid: u8) {
        let sink = AccountingSink::new(self.peers.as_ref(), self.sink.as_ref());
        self.reorder.close(cid, tid, &sink);
    }

    /// Queue an inbound ADDBA request for the negotiation worker.
    pub fn enqueue_negotiation_request(
        &self,
        cid: u8,
        tid: u8,
        requested_window: u16,
        timeout: u16,
        dialog_token: u8,
        seq_ctrl: u16,
    ) {
        self.backack.enqueue(BackAckRequest {
            cid,
            tid,
            dialog_token,
            requested_window,
            timeout,
            seq_ctrl,
        });
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    pub fn reorder(&self) -> &ReorderTable {
        &self.reorder
    }

    pub fn tx_engine(&self) -> &TxEngine<B> {
        &self.tx
    }

    pub fn rx_engine(&self) -> &RxEngine<B, S> {
        &self.rx
    }
}
