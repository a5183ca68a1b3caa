//! Alfred Prime's daemon link endpoint.
//!
//! Daemons connect TO Prime and keep one persistent framed TCP connection
//! each, so machines behind NAT need no port forwarding. This crate owns the
//! listener, the per-connection sessions with their in-flight command
//! tables, and the internal event bus the rest of Prime consumes.

pub mod config;
pub mod events;
pub mod registry;
pub mod server;
