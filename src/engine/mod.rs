// WIGIG DATAPATH — ENGINE MODULE
// The machinery the paths are built from: ring core, reorder sessions,
// negotiation worker, clock. Network moves the bytes; engine keeps the order.

pub mod backack;
pub mod reorder;
pub mod ring;
pub mod runtime;
