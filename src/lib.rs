// Quorum Consensus - HotStuff-family BFT consensus core
//
// Layout:
// - types:     identifiers, identities, blocks, votes, certificates, signatures
// - consensus: thresholds, signer codec, committee, validator, forks,
//              aggregation, safety rules, pacemaker, round-robin loop
// - storage:   RocksDB wrapper and the durable safety-data persister
// - node:      in-process chain state and network used by the runner
// - cli:       command line, configuration and the simulation runner

pub mod cli;
pub mod consensus;
pub mod node;
pub mod storage;
pub mod types;

#[cfg(test)]
mod tests;
