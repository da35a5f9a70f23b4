//! Infrastructure adapters for the delivery service.
//!
//! Contains the TOML configuration loader and `MemoryTunnelEndpoint`, an
//! in-process implementation of the tunnel endpoint collaborator defined in
//! `delivery-core`.

pub mod config;
pub mod tunnel;
