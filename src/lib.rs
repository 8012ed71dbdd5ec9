//! Wakegate - a wake-on-demand reverse proxy for a fleet of home servers
//!
//! This library provides a TCP/UDP reverse proxy that:
//! - Keeps managed hosts asleep until a client connects to one of their ports
//! - Wakes a host via a remote SSH command or a Wake-on-LAN magic packet
//! - Holds the triggering connection until the host answers liveness probes
//! - Splices client and upstream bytes once the host is up
//! - Puts autostop hosts back to sleep after a configurable idle period
//! - Reconciles the running host set against configuration on reload

pub mod config;
pub mod controller;
pub mod error;
pub mod host;
pub mod registry;
pub mod remote;
pub mod ssh;
pub mod state;
pub mod tcp;
pub mod udp;
pub mod wol;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
