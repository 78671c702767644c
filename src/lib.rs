//! External-memory breadth-first search for Kwirk-like tile puzzles.
//!
//! The state graph is far too large for RAM, so the frontier lives on
//! disk as sorted runs of fixed-width compressed records. Each frame
//! group (a batch of ten delay frames) flows through a pipeline of
//! sort, k-way merge, filter-against-the-past and parallel expansion;
//! closed groups double as checkpoints, so an interrupted search
//! resumes at the last completed group.

pub mod cache;
pub mod commands;
pub mod compressed;
pub mod config;
pub mod disk;
pub mod kwirk;
pub mod layout;
pub mod maze;
pub mod merge;
pub mod open_queue;
pub mod problem;
pub mod search;
pub mod trace;
pub mod workers;
