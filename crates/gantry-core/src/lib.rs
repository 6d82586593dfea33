#![doc = include_str!("../README.md")]

mod common;
pub use common::*;

pub mod codec;
pub mod idl;
pub mod pool;
pub mod relay;
