//! Process-backed worker pool.
//!
//! - [`manager`] - [`ProcessPool`], the [`WorkerPool`](gantry_core::pool::WorkerPool)
//!   implementation: dispatch, start, stop, reset.
//! - [`worker`] - One worker slot: its child process, the relay to it, and
//!   the respawn policy.

pub mod manager;
pub(crate) mod worker;

pub use manager::ProcessPool;
