// WIGIG DATAPATH — CRATE ROOT (LIBRARY)
// Data-path engine for a 60 GHz wireless adapter.
//
// Module hierarchy:
//   engine/ring      — descriptor ring core: atomically published head/tail,
//                      context side-table, one-slot-empty arithmetic
//   engine/reorder   — block-ack reorder sessions, 12-bit wrap-aware sequences
//   engine/backack   — ADDBA negotiation queue + worker thread
//   engine/runtime   — monotonic clock, cache-line padding
//   network/         — frame model, descriptor layouts, bus traits,
//                      transmit engine (plain + TSO), receive engine
//   adapter          — top-level facade wiring the paths together

pub mod adapter;
pub mod engine;
pub mod error;
pub mod network;

pub use adapter::Datapath;
pub use error::Error;
