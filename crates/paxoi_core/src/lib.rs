//! Paxoi consensus crate.
//!
//! This crate provides the Paxoi replica core and the CURP-style client
//! used against it. The API surface is intentionally small: higher layers
//! supply a `StateMachine` and a `Network`, then drive proposals through
//! `Replica` handles and `curp::Client`.

pub mod curp;
pub mod paxoi;
