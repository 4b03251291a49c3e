use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::cell::AtomicWord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Writer,
    Reader,
}

/// Per-process task record. Each forked child works on its own copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDescriptor {
    pub index: usize,
    pub role: Role,
    pub duration: Duration,
    pub write_rate: u32,
}

impl TaskDescriptor {
    /// Lay out `processes` descriptors. With a writer, slot 0 writes and the
    /// rest read; without one every slot reads.
    pub fn layout(
        processes: usize,
        write_rate: u32,
        duration: Duration,
        with_writer: bool,
    ) -> Vec<TaskDescriptor> {
        (0..processes)
            .map(|index| TaskDescriptor {
                index,
                role: if with_writer && index == 0 {
                    Role::Writer
                } else {
                    Role::Reader
                },
                duration,
                write_rate,
            })
            .collect()
    }
}

/// What a reader saw. `sum` is diagnostic only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReaderReport {
    pub reads: u64,
    pub sum: u64,
}

/// Pause between two writes at `rate` writes per second.
pub fn write_interval(rate: u32) -> Duration {
    Duration::from_micros(1_000_000 / u64::from(rate.max(1)))
}

/// Store 0, 1, 2, ... into `cell`, pausing `write_interval(rate)` between
/// stores, until `stop` is raised. Returns the number of stores made.
pub fn run_writer<C: AtomicWord + ?Sized>(cell: &C, rate: u32, stop: &AtomicBool) -> u64 {
    let interval = write_interval(rate);
    let mut value: u64 = 0;
    while !stop.load(Ordering::SeqCst) {
        cell.store(value);
        trace!(value, "write");
        value += 1;
        thread::sleep(interval);
    }
    debug!(writes = value, "writer stopped");
    value
}

/// Load `cell` as fast as possible until `duration` has elapsed.
///
/// There is no backoff and no `spin_loop` hint: the point is best-case read
/// throughput, so each reader keeps one CPU fully busy for the whole run.
/// The first load happens before the first clock check, so `reads >= 1`.
pub fn run_reader<C: AtomicWord + ?Sized>(cell: &C, duration: Duration) -> ReaderReport {
    let start = Instant::now();
    let mut report = ReaderReport::default();
    loop {
        report.sum = report.sum.wrapping_add(cell.load());
        report.reads += 1;
        if start.elapsed() >= duration {
            break;
        }
    }
    report
}
