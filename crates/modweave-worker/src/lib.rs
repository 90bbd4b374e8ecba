//! The single writer: drains the inbox, runs queue items through their
//! envelopes, and isolates every parse behind a timeout.

pub mod executor;
pub mod processor;

pub use executor::{ExecutorError, InProcessExecutor, ParseExecutor, ProcessExecutor};
pub use processor::{ItemOutcome, Processed, Worker, WorkerError};
