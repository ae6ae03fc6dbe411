// Node - In-process collaborators for the round-robin loop

pub mod chain;
pub mod network;

pub use chain::InMemoryChain;
pub use network::{LocalHub, LocalNetwork};
