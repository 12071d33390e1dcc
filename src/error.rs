// WIGIG DATAPATH — ERROR TAXONOMY
// Every error here is recoverable at the path level: per-frame failures are
// counted and absorbed, ring-full surfaces as backpressure, and construction
// failures unwind fully before returning. Nothing in the core is fatal.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// No room for the submission. The caller retries after backpressure
    /// lifts (available slots back above 1/4 of capacity).
    #[error("transmit ring full")]
    RingFull,

    /// Backing storage or a receive buffer could not be allocated.
    #[error("out of memory")]
    OutOfMemory,

    /// A buffer could not be given a device-visible address.
    #[error("buffer mapping failed")]
    MappingFailure,

    /// Segmentation offload requested for a frame that is not TCP.
    #[error("segmentation requested on non-TCP frame")]
    NotTcp,

    /// Submission or negotiation referenced an out-of-range or
    /// unconnected peer.
    #[error("invalid peer {0}")]
    InvalidPeer(u8),

    /// Received frame too short or of a non-data type.
    #[error("malformed frame")]
    MalformedFrame,

    /// Firmware rejected a ring configuration command.
    #[error("firmware rejected ring configuration (status {0})")]
    FirmwareRejected(u32),
}
