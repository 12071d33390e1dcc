// WIGIG DATAPATH — NETWORK: HARDWARE CONTRACT
// Descriptor binary layouts, the bus primitives the engine consumes
// (mapping, doorbell), the firmware control surface (ring configuration,
// negotiation responses), and the peer table.
//
// Descriptors are opaque 32-byte records with named fields; the layout is a
// device contract, not a portability surface. Hardware writes status bytes
// in place, so descriptor slots are only read through the ring's ownership
// contract.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;

use bytemuck::{Pod, Zeroable};

use crate::error::Error;

// ============================================================================
// LIMITS
// ============================================================================

/// Hardware connection-id limit.
pub const MAX_PEERS: usize = 8;
/// Traffic classes per peer.
pub const TRAFFIC_CLASSES: usize = 16;
/// Hardware transmit-ring limit.
pub const MAX_TX_RINGS: usize = 24;

/// Link-layer header length; frames shorter than this are malformed.
pub const ETH_HDR_LEN: usize = 14;

// ============================================================================
// TRANSMIT DESCRIPTOR
// ============================================================================

/// Chain-terminal descriptor: the last descriptor of a chain (or of one TSO
/// segment). Its done bit is the authoritative completion signal for every
/// descriptor before it in the chain.
pub const TX_FLAG_EOP: u32 = 1 << 0;
/// Compute the transport (L4) checksum for this buffer.
pub const TX_FLAG_CSUM_L4: u32 = 1 << 1;
/// Recompute the IP header checksum/length fields (TSO segments).
pub const TX_FLAG_CSUM_IP: u32 = 1 << 2;
/// Segmentation enabled for this chain (set on the header descriptor).
pub const TX_FLAG_TSO: u32 = 1 << 3;

/// Hardware sets this when the descriptor's DMA has completed. Hardware does
/// NOT clear a software ownership bit on transmit; the done bit is the only
/// completion signal.
pub const TX_STATUS_DONE: u8 = 1 << 0;

/// Role of a descriptor within a segmented chain.
pub const TX_SEG_PLAIN: u8 = 0;
pub const TX_SEG_HEADER: u8 = 1;
pub const TX_SEG_FIRST: u8 = 2;
pub const TX_SEG_MIDDLE: u8 = 3;
pub const TX_SEG_LAST: u8 = 4;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct TxDescriptor {
    pub flags: u32,
    pub addr_lo: u32,
    pub addr_hi: u16,
    /// Transport header length and offsets for the offload engine.
    pub offload_cfg: u16,
    pub length: u16,
    /// Written back by hardware on completion.
    pub status: u8,
    /// Written back by hardware; nonzero marks a failed transmission.
    pub error: u8,
    /// Descriptor count: whole chain on the first descriptor, per-segment
    /// count on each segment's first descriptor under TSO.
    pub num_descs: u8,
    pub seg_type: u8,
    _rsvd: [u8; 14],
}

const _: () = assert!(core::mem::size_of::<TxDescriptor>() == 32);

impl TxDescriptor {
    #[inline(always)]
    pub fn set_addr(&mut self, addr: DmaAddr) {
        debug_assert!(addr.0 >> 48 == 0, "device addresses are 48-bit");
        self.addr_lo = addr.0 as u32;
        self.addr_hi = (addr.0 >> 32) as u16;
    }

    #[inline(always)]
    pub fn addr(&self) -> DmaAddr {
        DmaAddr(((self.addr_hi as u64) << 32) | self.addr_lo as u64)
    }

    #[inline(always)]
    pub fn is_eop(&self) -> bool {
        self.flags & TX_FLAG_EOP != 0
    }

    #[inline(always)]
    pub fn is_done(&self) -> bool {
        self.status & TX_STATUS_DONE != 0
    }
}

// ============================================================================
// RECEIVE DESCRIPTOR
// ============================================================================

/// Device set the data-ready bit: the buffer holds a complete frame.
pub const RX_STATUS_READY: u8 = 1 << 0;
/// Device identified and verified an L4 checksum.
pub const RX_STATUS_L4_IDENT: u8 = 1 << 1;

/// Device-reported L4 checksum failure (valid when L4_IDENT is set).
pub const RX_ERROR_L4_CSUM: u8 = 1 << 1;

/// 802.11 frame types as reported in the descriptor.
pub const FRAME_TYPE_MGMT: u8 = 0;
pub const FRAME_TYPE_CTRL: u8 = 1;
pub const FRAME_TYPE_DATA: u8 = 2;

/// DS-bits value for which the device swaps the two link-layer addresses
/// (known hardware defect; the receive path swaps them back).
pub const DS_BITS_SWAPPED: u8 = 1;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct RxDescriptor {
    pub flags: u32,
    pub addr_lo: u32,
    pub addr_hi: u16,
    /// Connection id in the low nibble, traffic class in the high nibble.
    pub cid_tid: u8,
    /// Modulation/coding scheme index for this reception.
    pub mcs: u8,
    /// 12-bit sequence number in the low bits.
    pub seq: u16,
    pub frame_type: u8,
    pub ds_bits: u8,
    /// Frame length written back by the device.
    pub length: u16,
    pub status: u8,
    pub error: u8,
    _rsvd: [u8; 12],
}

const _: () = assert!(core::mem::size_of::<RxDescriptor>() == 32);

impl RxDescriptor {
    #[inline(always)]
    pub fn set_addr(&mut self, addr: DmaAddr) {
        debug_assert!(addr.0 >> 48 == 0, "device addresses are 48-bit");
        self.addr_lo = addr.0 as u32;
        self.addr_hi = (addr.0 >> 32) as u16;
    }

    #[inline(always)]
    pub fn addr(&self) -> DmaAddr {
        DmaAddr(((self.addr_hi as u64) << 32) | self.addr_lo as u64)
    }

    #[inline(always)]
    pub fn is_ready(&self) -> bool {
        self.status & RX_STATUS_READY != 0
    }

    #[inline(always)]
    pub fn cid(&self) -> u8 {
        self.cid_tid & 0x0f
    }

    #[inline(always)]
    pub fn tid(&self) -> u8 {
        self.cid_tid >> 4
    }

    #[inline(always)]
    pub fn seq12(&self) -> u16 {
        self.seq & 0x0fff
    }
}

// ============================================================================
// BUS PRIMITIVES
// ============================================================================

/// Device-visible buffer address. Descriptors carry 48 address bits.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DmaAddr(pub u64);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MapDirection {
    ToDevice,
    FromDevice,
}

/// Mapping kind recorded per transmit slot; release at reclaim honors it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MapKind {
    /// Contiguous head buffer (single mapping).
    Single,
    /// Page-fragment mapping.
    Fragment,
}

/// Bus access primitives: buffer mapping and the doorbell register write.
pub trait Bus: Send + Sync {
    /// Establish a device-visible address for `buf`. Single-buffer and
    /// page-fragment mappings are distinct resources; the kind used to map
    /// must be the kind used to unmap.
    fn map(&self, buf: &[u8], kind: MapKind, dir: MapDirection) -> Result<DmaAddr, Error>;

    /// Release a mapping previously returned by [`map`](Self::map).
    fn unmap(&self, addr: DmaAddr, len: usize, kind: MapKind, dir: MapDirection);

    /// Single 32-bit register write publishing a new tail index to hardware.
    fn doorbell(&self, register: u32, value: u32);
}

/// Hardware handle for a configured ring.
#[derive(Clone, Copy, Debug)]
pub struct RingHandle {
    /// Device base address of the descriptor array.
    pub base: u64,
    /// Doorbell register for this ring's hardware tail.
    pub doorbell_reg: u32,
}

/// Firmware control surface: ring configuration and negotiation responses.
/// Round trips here are control-plane latency and must never run on the
/// ingest path.
pub trait FirmwareCtl: Send + Sync {
    fn configure_tx_ring(&self, cid: u8, tid: u8, size: u32) -> Result<RingHandle, Error>;

    fn configure_rx_ring(&self, size: u32) -> Result<RingHandle, Error>;

    /// Send the agreed block-ack window parameters back to the peer.
    #[allow(clippy::too_many_arguments)]
    fn send_backack_response(
        &self,
        cid: u8,
        tid: u8,
        dialog_token: u8,
        status: u16,
        amsdu: bool,
        agg_wsize: u16,
        timeout: u16,
    ) -> Result<(), Error>;
}

// ============================================================================
// PEER TABLE
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LinkState {
    Unused,
    Pending,
    Connected,
}

#[derive(Clone, Copy)]
struct PeerEntry {
    mac: [u8; 6],
    state: LinkState,
}

/// Per-peer traffic counters. Written from the transmit-reclaim and
/// receive-dispatch contexts concurrently, so everything is atomic.
#[derive(Default)]
pub struct PeerStats {
    pub tx_packets: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub tx_errors: AtomicU64,
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub rx_dropped: AtomicU64,
    pub last_mcs: AtomicU32,
}

/// Connection id ↔ link-layer address ↔ link state, plus per-peer stats.
/// The entry array sits behind a read-write lock (connect/disconnect are
/// control-plane rare); stats stay lock-free.
pub struct PeerTable {
    entries: RwLock<[PeerEntry; MAX_PEERS]>,
    stats: [PeerStats; MAX_PEERS],
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTable {
    pub fn new() -> Self {
        PeerTable {
            entries: RwLock::new(
                [PeerEntry {
                    mac: [0; 6],
                    state: LinkState::Unused,
                }; MAX_PEERS],
            ),
            stats: Default::default(),
        }
    }

    pub fn connect(&self, cid: u8, mac: [u8; 6]) -> Result<(), Error> {
        if cid as usize >= MAX_PEERS {
            return Err(Error::InvalidPeer(cid));
        }
        let mut entries = self.entries.write().unwrap();
        entries[cid as usize] = PeerEntry {
            mac,
            state: LinkState::Connected,
        };
        Ok(())
    }

    pub fn disconnect(&self, cid: u8) {
        if let Some(e) = self
            .entries
            .write()
            .unwrap()
            .get_mut(cid as usize)
        {
            e.state = LinkState::Unused;
            e.mac = [0; 6];
        }
    }

    pub fn state(&self, cid: u8) -> LinkState {
        self.entries
            .read()
            .unwrap()
            .get(cid as usize)
            .map(|e| e.state)
            .unwrap_or(LinkState::Unused)
    }

    pub fn is_connected(&self, cid: u8) -> bool {
        self.state(cid) == LinkState::Connected
    }

    pub fn mac(&self, cid: u8) -> Option<[u8; 6]> {
        let entries = self.entries.read().unwrap();
        let e = entries.get(cid as usize)?;
        (e.state == LinkState::Connected).then_some(e.mac)
    }

    /// Resolve a destination address to a connected peer's connection id.
    pub fn find_by_mac(&self, mac: &[u8; 6]) -> Option<u8> {
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .position(|e| e.state == LinkState::Connected && &e.mac == mac)
            .map(|i| i as u8)
    }

    /// Counters for `cid`. Callers pass a validated connection id; ids from
    /// untrusted descriptors go through [`record_rx`](Self::record_rx).
    #[inline(always)]
    pub fn stats(&self, cid: u8) -> &PeerStats {
        &self.stats[cid as usize]
    }

    /// Record one delivered frame. `cid` comes straight from a descriptor
    /// the device wrote, so an out-of-range id is ignored rather than
    /// trusted.
    pub fn record_rx(&self, cid: u8, bytes: usize, mcs: u8) {
        let Some(s) = self.stats.get(cid as usize) else {
            return;
        };
        s.rx_packets.fetch_add(1, Ordering::Relaxed);
        s.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        s.last_mcs.store(mcs as u32, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_sizes() {
        assert_eq!(core::mem::size_of::<TxDescriptor>(), 32);
        assert_eq!(core::mem::size_of::<RxDescriptor>(), 32);
    }

    #[test]
    fn tx_addr_round_trip() {
        // Full 48-bit address, both halves of the split field exercised.
        let mut d = TxDescriptor::zeroed();
        d.set_addr(DmaAddr(0xa345_6789_abcd));
        assert_eq!(d.addr(), DmaAddr(0xa345_6789_abcd));
    }

    #[test]
    fn rx_cid_tid_split() {
        let mut d = RxDescriptor::zeroed();
        d.cid_tid = 0x53; // tid 5, cid 3
        assert_eq!(d.cid(), 3);
        assert_eq!(d.tid(), 5);
    }

    #[test]
    fn rx_seq_masked_to_12_bits() {
        let mut d = RxDescriptor::zeroed();
        d.seq = 0xf123;
        assert_eq!(d.seq12(), 0x123);
    }

    #[test]
    fn peer_lookup() {
        let t = PeerTable::new();
        t.connect(2, [2; 6]).unwrap();
        t.connect(5, [5; 6]).unwrap();
        assert_eq!(t.find_by_mac(&[5; 6]), Some(5));
        assert_eq!(t.find_by_mac(&[9; 6]), None);
        assert!(t.is_connected(2));
        t.disconnect(2);
        assert!(!t.is_connected(2));
        assert_eq!(t.mac(2), None);
    }

    #[test]
    fn connect_out_of_range_rejected() {
        let t = PeerTable::new();
        assert_eq!(t.connect(8, [1; 6]), Err(Error::InvalidPeer(8)));
    }

    #[test]
    fn record_rx_ignores_out_of_range_cid() {
        // The cid field in a receive descriptor is a 4-bit nibble, so the
        // device can report ids past the connection table.
        let t = PeerTable::new();
        t.record_rx(9, 100, 3);
        t.record_rx(15, 100, 3);
        for cid in 0..MAX_PEERS as u8 {
            assert_eq!(t.stats(cid).rx_packets.load(Ordering::Relaxed), 0);
        }
    }
}
