//! Wire bridge between the pool controller and the in-editor worker.
//!
//! Both sides speak channel-tagged envelopes over one loopback WebSocket:
//!
//! - **envelope**: flat cycle-tolerant codec + channel multiplexing
//! - **protocol**: control-channel message types (request/response, session)
//! - **transport**: loopback endpoint (bind/accept on the pool side,
//!   connect on the worker side)

pub mod envelope;
pub mod protocol;
pub mod transport;
