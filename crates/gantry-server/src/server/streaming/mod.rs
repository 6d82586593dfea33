//! Ordered forwarding for bidirectional calls.
//!
//! - [`coordinator`] - Feeds inbound messages to the pool one at a time and
//!   streams results back.

pub mod coordinator;
