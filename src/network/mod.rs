// WIGIG DATAPATH — NETWORK MODULE
// Module structure:
//   hw.rs — descriptor layouts, bus/firmware traits, peer table
//   tx.rs — transmit engine: chain construction (plain + TSO), reclaim
//   rx.rs — receive engine: refill, reap, dispatch

pub mod hw;
pub mod rx;
pub mod tx;

use std::sync::atomic::AtomicU64;

// ============================================================================
// OPERATING MODE
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OperMode {
    /// Access point: broadcast transmissions are duplicated per peer with
    /// the destination rewritten to each peer's unicast address.
    AccessPoint,
    /// Station: broadcast frames stay broadcast.
    Station,
    /// Promiscuous capture: receive delivers everything, with capture
    /// metadata attached and no filtering or reordering.
    Monitor,
}

// ============================================================================
// OUTBOUND FRAME
// ============================================================================

/// Outbound frame: one contiguous head buffer (link header, any transport
/// headers, leading payload) plus zero or more fragment buffers.
#[derive(Clone)]
pub struct TxFrame {
    pub head: Vec<u8>,
    pub frags: Vec<Vec<u8>>,
    /// Request hardware transport-checksum computation.
    pub csum_offload: bool,
    /// Maximum segment size; `Some` requests segmentation offload.
    pub mss: Option<u16>,
}

impl TxFrame {
    pub fn new(head: Vec<u8>) -> Self {
        TxFrame {
            head,
            frags: Vec::new(),
            csum_offload: false,
            mss: None,
        }
    }

    /// Total payload bytes across head and fragments.
    pub fn total_len(&self) -> usize {
        self.head.len() + self.frags.iter().map(Vec::len).sum::<usize>()
    }

    pub fn dest_mac(&self) -> Option<[u8; 6]> {
        self.head.get(..6).map(|d| {
            let mut mac = [0u8; 6];
            mac.copy_from_slice(d);
            mac
        })
    }

    pub fn set_dest_mac(&mut self, mac: [u8; 6]) {
        if self.head.len() >= 6 {
            self.head[..6].copy_from_slice(&mac);
        }
    }

    pub fn is_broadcast(&self) -> bool {
        // Group bit of the destination address covers broadcast + multicast.
        self.head.first().is_some_and(|b| b & 0x01 != 0)
    }
}

// ============================================================================
// INBOUND FRAME
// ============================================================================

/// Device-reported checksum verdict, forwarded as a delivery hint.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CsumHint {
    /// Device made no claim; the stack verifies in software.
    None,
    Verified,
    Invalid,
}

#[derive(Clone, Copy, Debug)]
pub struct RxMeta {
    pub cid: u8,
    pub tid: u8,
    /// 12-bit sequence number.
    pub seq: u16,
    pub mcs: u8,
    pub frame_type: u8,
    pub ds_bits: u8,
    pub csum: CsumHint,
}

/// Capture metadata attached in monitor mode.
#[derive(Clone, Copy, Debug)]
pub struct CaptureMeta {
    pub mcs: u8,
    pub frame_len: u16,
}

pub struct RxFrame {
    pub data: Vec<u8>,
    pub meta: RxMeta,
    pub capture: Option<CaptureMeta>,
}

// ============================================================================
// DELIVERY BOUNDARY
// ============================================================================

/// Generic frame-delivery sink: where in-order frames leave the engine.
pub trait DeliverySink: Send + Sync {
    fn deliver(&self, frame: RxFrame);
}

/// Wraps a delivery sink so per-peer counters update at the point a frame
/// actually leaves the engine. Every path that can emit frames routes
/// through this, including reorder-window flushes at session close.
pub struct AccountingSink<'a> {
    peers: &'a hw::PeerTable,
    inner: &'a dyn DeliverySink,
}

impl<'a> AccountingSink<'a> {
    pub fn new(peers: &'a hw::PeerTable, inner: &'a dyn DeliverySink) -> Self {
        AccountingSink { peers, inner }
    }
}

impl DeliverySink for AccountingSink<'_> {
    fn deliver(&self, frame: RxFrame) {
        self.peers
            .record_rx(frame.meta.cid, frame.data.len(), frame.meta.mcs);
        self.inner.deliver(frame);
    }
}

// ============================================================================
// DEVICE COUNTERS
// ============================================================================

/// Device-wide drop/reject counters. Per-frame receive errors are absorbed
/// here rather than surfaced as delivery errors.
#[derive(Default)]
pub struct DeviceStats {
    /// Frames shorter than the minimum addressable length or carrying an
    /// out-of-range connection id.
    pub rx_malformed: AtomicU64,
    /// Non-data frame types reaching the data path.
    pub rx_non_data: AtomicU64,
    /// Submissions rejected for lack of ring space.
    pub tx_ring_full: AtomicU64,
    /// Receive refill slots skipped on allocation/mapping failure.
    pub rx_refill_failures: AtomicU64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_len_sums_fragments() {
        let mut f = TxFrame::new(vec![0; 100]);
        f.frags.push(vec![0; 50]);
        f.frags.push(vec![0; 25]);
        assert_eq!(f.total_len(), 175);
    }

    #[test]
    fn broadcast_detection() {
        let f = TxFrame::new(vec![0xff; 14]);
        assert!(f.is_broadcast());
        let f = TxFrame::new(vec![0x02, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 2, 0x08, 0x00]);
        assert!(!f.is_broadcast());
    }

    #[test]
    fn dest_rewrite() {
        let mut f = TxFrame::new(vec![0xff; 14]);
        f.set_dest_mac([1, 2, 3, 4, 5, 6]);
        assert_eq!(f.dest_mac(), Some([1, 2, 3, 4, 5, 6]));
    }
}
