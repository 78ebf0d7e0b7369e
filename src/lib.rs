//! A server-side PostgreSQL wire protocol endpoint.
//!
//! - [`channel`]: suspending read/write over a non-blocking socket
//! - [`network`]: message codec, handshake state machine, sessions and the listener
//! - [`executor`]: the seam through which simple queries are answered

pub mod channel;
pub mod executor;
pub mod network;
