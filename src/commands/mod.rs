//! Control operations
//!
//! Higher-level operations composed from the session registry, for the
//! control API to call.

mod tunnel;

pub use tunnel::{
    start_tunnel, stop_tunnel, tunnel_status, HostRecord, LedgerEntry, MemoryLedger,
    SessionLedger, StopStatus,
};
