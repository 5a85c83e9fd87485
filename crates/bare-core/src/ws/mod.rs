//! WebSocket handshake computation and the minimal frame codec needed
//! for v3's inline connect/open exchange (spec.md §4.F, §6.2).

pub mod frame;
pub mod handshake;
