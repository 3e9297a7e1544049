//! HTTP handlers for the gateway surfaces.

pub mod close;
pub mod health;
pub mod routed;
pub mod rpc;
pub mod unified;
