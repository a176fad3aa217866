//! Inbound adapters that translate operator requests into domain service
//! calls while keeping framework details at the edge.
//!
//! The operator command line lives under [`cli`]; the routes `serve` exposes
//! live under [`http`].

pub mod cli;
pub mod http;
