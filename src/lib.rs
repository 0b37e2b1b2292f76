//! Distributed mutual exclusion with the Ricart & Agrawala (1983) permission protocol.
//!
//! Each process keeps a Lamport clock, asks every peer for permission before entering the
//! critical section and defers its own replies while it holds, or has priority for, the section.

pub mod config;
pub mod error;
pub mod message;
pub mod observer;
pub mod process;
pub mod protocol;
pub mod run;
pub mod schedule;
pub mod time;
pub mod transport;
