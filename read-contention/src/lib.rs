// read-contention/src/lib.rs
// Read throughput on one shared word, with and without a concurrent writer.
// Every task is its own forked process; the only shared state is the cell
// (named shm) and the writer's stop flag (anonymous shm).

pub mod cell;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod pipe;
pub mod shm;
pub mod task;

pub use cell::AtomicWord;
pub use config::{Field, RunParams};
pub use coordinator::{run_test, ReaderOutcome, ReaderStatus, RunResult, WriterExit};
pub use error::{Error, Result};
pub use shm::{ShmCell, StopFlag, CELL_NAME};
pub use task::{run_reader, run_writer, ReaderReport, Role, TaskDescriptor};
