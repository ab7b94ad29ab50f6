//! Roundtable - turn-taking coordination for cooperating agents
//!
//! A three-layer turn scheduler (round-robin rotation, priority-heap
//! interrupts, arbitration and recovery) plus a beat-based deterministic
//! executor, sharing one in-process bus and an append-only transcript.

pub mod agent;
pub mod beat;
pub mod bus;
pub mod cli;
pub mod config;
pub mod console;
pub mod sched;
