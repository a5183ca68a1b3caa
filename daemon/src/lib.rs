//! The Alfred agent daemon: one long-running process per managed machine.
//!
//! The daemon dials out to Prime (never the other way around, so machines
//! behind NAT need no port forwarding), registers its identity, and then
//! serves commands over a single framed TCP connection while emitters push
//! proactive events upstream.

pub mod client;
pub mod config;
pub mod emitters;
pub mod handlers;
pub mod stats;
