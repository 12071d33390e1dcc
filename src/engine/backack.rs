// WIGIG DATAPATH — ENGINE: BLOCK-ACK NEGOTIATION QUEUE
// ADDBA requests arrive from the radio asynchronously and need a
// control-plane response round trip before the reorder window changes.
// That round trip must never run on the ingest path, so requests go through
// a FIFO channel to a dedicated worker: validate the peer, clamp the window
// to the local maximum, respond, then replace the reorder session with the
// agreed parameters. The worker drains to empty and blocks on the channel
// until re-signaled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, warn};

use crate::engine::reorder::{ReorderTable, MAX_AGG_WINDOW};
use crate::network::hw::{FirmwareCtl, PeerTable, MAX_PEERS};
use crate::network::{AccountingSink, DeliverySink};

/// One pending ADDBA request, consumed strictly in arrival order.
#[derive(Clone, Copy, Debug)]
pub struct BackAckRequest {
    pub cid: u8,
    pub tid: u8,
    pub dialog_token: u8,
    pub requested_window: u16,
    pub timeout: u16,
    /// Sequence-control field; the session's starting sequence number is
    /// its upper 12 bits.
    pub seq_ctrl: u16,
}

pub struct BackAckQueue {
    tx: Option<Sender<BackAckRequest>>,
    worker: Option<JoinHandle<()>>,
    flushing: Arc<AtomicBool>,
}

impl BackAckQueue {
    pub fn spawn<F, D>(
        fw: Arc<F>,
        peers: Arc<PeerTable>,
        reorder: Arc<ReorderTable>,
        sink: Arc<D>,
    ) -> Self
    where
        F: FirmwareCtl + 'static,
        D: DeliverySink + 'static,
    {
        let (tx, rx) = channel();
        let flushing = Arc::new(AtomicBool::new(false));
        let flush_flag = Arc::clone(&flushing);
        let worker = thread::spawn(move || {
            worker_loop(rx, flush_flag, fw, peers, reorder, sink);
        });
        BackAckQueue {
            tx: Some(tx),
            worker: Some(worker),
            flushing,
        }
    }

    /// Append a request; the worker wakes on its own schedule. Never blocks
    /// the caller.
    pub fn enqueue(&self, req: BackAckRequest) {
        if let Some(tx) = &self.tx {
            if tx.send(req).is_err() {
                error!("negotiation: worker gone, request dropped");
            }
        }
    }
}

impl Drop for BackAckQueue {
    fn drop(&mut self) {
        // Teardown discards whatever is still queued.
        self.flushing.store(true, Ordering::Release);
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop<F, D>(
    rx: Receiver<BackAckRequest>,
    flushing: Arc<AtomicBool>,
    fw: Arc<F>,
    peers: Arc<PeerTable>,
    reorder: Arc<ReorderTable>,
    sink: Arc<D>,
) where
    F: FirmwareCtl,
    D: DeliverySink,
{
    while let Ok(req) = rx.recv() {
        if flushing.load(Ordering::Acquire) {
            debug!("negotiation: flushing, request for cid {} dropped", req.cid);
            continue;
        }
        handle(&req, fw.as_ref(), &peers, &reorder, sink.as_ref());
    }
}

fn handle(
    req: &BackAckRequest,
    fw: &dyn FirmwareCtl,
    peers: &PeerTable,
    reorder: &ReorderTable,
    sink: &dyn DeliverySink,
) {
    if req.cid as usize >= MAX_PEERS {
        error!("negotiation: invalid cid {}", req.cid);
        return;
    }
    if !peers.is_connected(req.cid) {
        error!("negotiation: cid {} not connected", req.cid);
        return;
    }

    let agg_wsize = req.requested_window.min(MAX_AGG_WINDOW).max(1);
    debug!(
        "negotiation: cid {} tid {} requested {} granted {}",
        req.cid, req.tid, req.requested_window, agg_wsize
    );

    // Accept, aggregation without AMSDU, at the clamped window.
    if let Err(e) = fw.send_backack_response(
        req.cid,
        req.tid,
        req.dialog_token,
        0,
        false,
        agg_wsize,
        req.timeout,
    ) {
        warn!("negotiation: response for cid {} failed ({e})", req.cid);
        return;
    }

    // Close-then-open under the session slot lock; the prior session's
    // buffered frames reach delivery (and the peer's counters) first.
    let acct = AccountingSink::new(peers, sink);
    reorder.open(req.cid, req.tid, agg_wsize, req.seq_ctrl >> 4, &acct);
}
