#![doc = include_str!("../README.md")]

pub mod server;

pub use server::{
    config::{CliArgs, ListenAddr, PoolConfig, ServerConfig, TlsConfig},
    error::Error,
    gateway::{Gateway, ServiceState},
    pool::ProcessPool,
};
