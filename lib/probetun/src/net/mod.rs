//! The networking modules handle the whole tunnel: wire codec, per-client
//! reliable-delivery state machines, connection bookkeeping and the server
//! dispatch loop, plus the thin adapters onto the kernel channels.

pub mod link;
pub mod packet;
pub mod server;
pub mod socket;
pub mod support;
pub mod table;
