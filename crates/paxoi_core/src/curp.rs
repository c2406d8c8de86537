//! CURP-style client module wiring.

mod client;

pub use client::Client;
