//! Host-facing contract and stdio bridge for an embedding UI process.

pub mod contract;
pub mod stdio;
