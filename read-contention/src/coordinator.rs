// One benchmark run: fork a writer (optional) and readers, let them run for
// the configured duration, stop the writer, collect every reader's count.

use std::fmt;
use std::io;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::cell::AtomicWord;
use crate::config::RunParams;
use crate::error::{Error, Result};
use crate::pipe::{count_channel, CountReceiver, CountSender};
use crate::shm::StopFlag;
use crate::task::{run_reader, run_writer, write_interval, Role, TaskDescriptor};

/// Extra time the writer gets, on top of one write interval, to notice the
/// stop flag before it is killed.
pub const STOP_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderStatus {
    Completed(u64),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderOutcome {
    pub index: usize,
    pub status: ReaderStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterExit {
    /// Saw the stop flag and exited on its own.
    Stopped,
    /// Missed the grace period and got SIGKILL.
    Killed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub with_writer: bool,
    pub duration: Duration,
    pub elapsed: Duration,
    pub writer: Option<WriterExit>,
    pub readers: Vec<ReaderOutcome>,
}

impl RunResult {
    pub fn total_reads(&self) -> u64 {
        self.readers
            .iter()
            .filter_map(|r| match r.status {
                ReaderStatus::Completed(reads) => Some(reads),
                ReaderStatus::Failed(_) => None,
            })
            .sum()
    }

    pub fn failed(&self) -> usize {
        self.readers
            .iter()
            .filter(|r| matches!(r.status, ReaderStatus::Failed(_)))
            .count()
    }

    /// Reads per second over the configured duration.
    pub fn throughput(&self) -> f64 {
        throughput(self.total_reads(), self.duration)
    }
}

pub fn throughput(total_reads: u64, duration: Duration) -> f64 {
    if duration.is_zero() {
        return 0.0;
    }
    total_reads as f64 / duration.as_secs_f64()
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for reader in &self.readers {
            match &reader.status {
                ReaderStatus::Completed(reads) => {
                    writeln!(f, "Reader {}: {} reads", reader.index, reads)?
                }
                ReaderStatus::Failed(reason) => {
                    writeln!(f, "Reader {}: failed ({})", reader.index, reason)?
                }
            }
        }
        let failed = self.failed();
        if failed > 0 {
            writeln!(f, "Failed readers (excluded): {failed}")?;
        }
        write!(f, "Average reads per second: {:.2}", self.throughput())
    }
}

enum Spawned {
    Writer { pid: libc::pid_t },
    Reader { index: usize, pid: libc::pid_t, counts: CountReceiver },
}

impl Spawned {
    fn pid(&self) -> libc::pid_t {
        match self {
            Spawned::Writer { pid } | Spawned::Reader { pid, .. } => *pid,
        }
    }
}

/// Run one benchmark pass over `cell`.
///
/// Children are forked, so `cell` must live in `MAP_SHARED` memory (see
/// [`crate::shm::ShmCell`]) for the writer's stores to reach the readers.
pub fn run_test<C: AtomicWord + ?Sized>(
    cell: &C,
    params: &RunParams,
    with_writer: bool,
) -> Result<RunResult> {
    let tasks = TaskDescriptor::layout(
        params.processes,
        params.write_rate,
        params.duration,
        with_writer,
    );
    if !tasks.iter().any(|t| t.role == Role::Reader) {
        warn!(processes = params.processes, "no readers in this run, throughput will be 0");
    }

    let stop = StopFlag::new()?;
    let start = Instant::now();

    let mut children = Vec::with_capacity(tasks.len());
    for task in &tasks {
        match spawn(cell, task, &stop) {
            Ok(child) => children.push(child),
            Err(e) => {
                abort(&children);
                return Err(e);
            }
        }
    }
    info!(
        processes = children.len(),
        with_writer,
        duration_secs = params.duration.as_secs(),
        "tasks spawned"
    );

    thread::sleep(params.duration);

    let (writer, readers) = collect(children, &stop, params.write_rate)?;

    let result = RunResult {
        with_writer,
        duration: params.duration,
        elapsed: start.elapsed(),
        writer,
        readers,
    };
    info!(
        total_reads = result.total_reads(),
        failed = result.failed(),
        throughput = result.throughput(),
        elapsed_ms = result.elapsed.as_millis() as u64,
        "run finished"
    );
    Ok(result)
}

fn spawn<C: AtomicWord + ?Sized>(
    cell: &C,
    task: &TaskDescriptor,
    stop: &StopFlag,
) -> Result<Spawned> {
    let channel = match task.role {
        Role::Reader => Some(count_channel(task.index)?),
        Role::Writer => None,
    };

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(Error::Spawn {
            index: task.index,
            source: io::Error::last_os_error(),
        });
    }
    if pid == 0 {
        child_main(cell, task, stop, channel.map(|(tx, _)| tx));
    }

    debug!(index = task.index, pid, role = ?task.role, "forked");
    Ok(match channel {
        // Dropping our write end here lets the reader's exit show up as EOF.
        Some((_tx, counts)) => Spawned::Reader {
            index: task.index,
            pid,
            counts,
        },
        None => Spawned::Writer { pid },
    })
}

// Runs in the forked child and never returns into the parent's frames.
fn child_main<C: AtomicWord + ?Sized>(
    cell: &C,
    task: &TaskDescriptor,
    stop: &StopFlag,
    counts: Option<CountSender>,
) -> ! {
    let code = match (task.role, counts) {
        (Role::Writer, _) => {
            run_writer(cell, task.write_rate, stop.flag());
            0
        }
        (Role::Reader, Some(counts)) => {
            let report = run_reader(cell, task.duration);
            debug!(index = task.index, reads = report.reads, sum = report.sum, "reader done");
            match counts.send(report.reads) {
                Ok(()) => 0,
                Err(_) => 1,
            }
        }
        (Role::Reader, None) => 1,
    };
    unsafe { libc::_exit(code) }
}

/// Stop the writer and gather every reader. On the first error the children
/// not yet reaped are killed and reaped before the error is returned.
fn collect(
    children: Vec<Spawned>,
    stop: &StopFlag,
    write_rate: u32,
) -> Result<(Option<WriterExit>, Vec<ReaderOutcome>)> {
    let mut writer = None;
    let mut readers = Vec::with_capacity(children.len());
    let mut pending = children.into_iter();
    while let Some(child) = pending.next() {
        let step = match child {
            Spawned::Writer { pid } => {
                stop.raise();
                stop_writer(pid, write_rate).map(|exit| writer = Some(exit))
            }
            Spawned::Reader { index, pid, counts } => {
                collect_reader(index, pid, counts).map(|outcome| readers.push(outcome))
            }
        };
        if let Err(e) = step {
            let rest: Vec<Spawned> = pending.collect();
            abort(&rest);
            return Err(e);
        }
    }
    Ok((writer, readers))
}

fn stop_writer(pid: libc::pid_t, rate: u32) -> Result<WriterExit> {
    let deadline = Instant::now() + write_interval(rate) + STOP_GRACE;
    loop {
        if wait_pid(pid, libc::WNOHANG)?.is_some() {
            debug!(pid, "writer stopped");
            return Ok(WriterExit::Stopped);
        }
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }

    warn!(pid, "writer missed the stop flag, killing it");
    kill(pid)?;
    wait_pid(pid, 0)?;
    Ok(WriterExit::Killed)
}

fn collect_reader(index: usize, pid: libc::pid_t, counts: CountReceiver) -> Result<ReaderOutcome> {
    let received = counts.recv();
    let status = wait_pid(pid, 0)?.unwrap_or_default();

    let status = match (received, abnormal_exit(status)) {
        (_, Some(reason)) => ReaderStatus::Failed(reason),
        (Ok(Some(reads)), None) => ReaderStatus::Completed(reads),
        (Ok(None), None) => ReaderStatus::Failed("exited without reporting a count".into()),
        (Err(e), None) => ReaderStatus::Failed(format!("result pipe: {e}")),
    };
    match &status {
        ReaderStatus::Completed(reads) => debug!(index, pid, reads, "reader collected"),
        ReaderStatus::Failed(reason) => {
            warn!(index, pid, %reason, "reader failed, excluded from total")
        }
    }
    Ok(ReaderOutcome { index, status })
}

fn abnormal_exit(status: libc::c_int) -> Option<String> {
    if libc::WIFEXITED(status) {
        match libc::WEXITSTATUS(status) {
            0 => None,
            code => Some(format!("exited with status {code}")),
        }
    } else if libc::WIFSIGNALED(status) {
        Some(format!("killed by signal {}", libc::WTERMSIG(status)))
    } else {
        Some("terminated abnormally".into())
    }
}

/// `waitpid`, retried on EINTR. `None` only with `WNOHANG` and a live child.
fn wait_pid(pid: libc::pid_t, flags: libc::c_int) -> Result<Option<libc::c_int>> {
    let mut status: libc::c_int = 0;
    loop {
        let r = unsafe { libc::waitpid(pid, &mut status, flags) };
        if r == pid {
            return Ok(Some(status));
        }
        if r == 0 {
            return Ok(None);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(Error::Wait { pid, source: err });
        }
    }
}

fn kill(pid: libc::pid_t) -> Result<()> {
    if unsafe { libc::kill(pid, libc::SIGKILL) } != 0 {
        let err = io::Error::last_os_error();
        // Already gone; waitpid still reaps it.
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(Error::Signal {
                pid,
                signal: libc::SIGKILL,
                source: err,
            });
        }
    }
    Ok(())
}

// Best-effort teardown after a failed fork or collection.
fn abort(children: &[Spawned]) {
    for child in children {
        let pid = child.pid();
        let _ = kill(pid);
        let _ = wait_pid(pid, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn completed(index: usize, reads: u64) -> ReaderOutcome {
        ReaderOutcome {
            index,
            status: ReaderStatus::Completed(reads),
        }
    }

    fn result(readers: Vec<ReaderOutcome>, secs: u64) -> RunResult {
        RunResult {
            with_writer: true,
            duration: Duration::from_secs(secs),
            elapsed: Duration::from_secs(secs),
            writer: Some(WriterExit::Stopped),
            readers,
        }
    }

    #[test]
    fn failed_readers_count_separately() {
        let run = result(
            vec![
                completed(1, 100),
                ReaderOutcome {
                    index: 2,
                    status: ReaderStatus::Failed("killed by signal 9".into()),
                },
                completed(3, 50),
            ],
            2,
        );
        assert_eq!(run.total_reads(), 150);
        assert_eq!(run.failed(), 1);
        assert_eq!(run.throughput(), 75.0);
    }

    #[test]
    fn display_lists_readers_and_average() {
        let run = result(vec![completed(1, 10), completed(2, 20)], 2);
        assert_eq!(
            run.to_string(),
            "Reader 1: 10 reads\nReader 2: 20 reads\nAverage reads per second: 15.00"
        );
    }

    #[test]
    fn display_reports_failures() {
        let run = result(
            vec![ReaderOutcome {
                index: 1,
                status: ReaderStatus::Failed("exited with status 1".into()),
            }],
            1,
        );
        let text = run.to_string();
        assert!(text.contains("Reader 1: failed (exited with status 1)"));
        assert!(text.contains("Failed readers (excluded): 1"));
    }

    #[test]
    fn empty_run_has_zero_throughput() {
        assert_eq!(result(Vec::new(), 3).throughput(), 0.0);
        assert_eq!(throughput(10, Duration::ZERO), 0.0);
    }

    #[test]
    fn exit_status_decoding() {
        assert_eq!(abnormal_exit(0), None);
        // Exit code lives in the second byte of the wait status.
        assert_eq!(abnormal_exit(3 << 8), Some("exited with status 3".into()));
        assert_eq!(abnormal_exit(libc::SIGKILL), Some("killed by signal 9".into()));
    }

    fn fork_child(body: impl FnOnce() -> libc::c_int) -> libc::pid_t {
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0, "fork: {}", io::Error::last_os_error());
        if pid == 0 {
            let code = body();
            unsafe { libc::_exit(code) }
        }
        pid
    }

    fn idle_forever() -> libc::c_int {
        loop {
            unsafe { libc::sleep(1) };
        }
    }

    fn is_reaped(pid: libc::pid_t) -> bool {
        let r = unsafe { libc::waitpid(pid, std::ptr::null_mut(), libc::WNOHANG) };
        r == -1 && io::Error::last_os_error().raw_os_error() == Some(libc::ECHILD)
    }

    #[test]
    fn reader_exit_without_count_is_failed() {
        let (tx, rx) = count_channel(0).unwrap();
        let pid = fork_child(|| 3);
        drop(tx);

        let outcome = collect_reader(0, pid, rx).unwrap();
        assert_eq!(
            outcome.status,
            ReaderStatus::Failed("exited with status 3".into())
        );
        assert!(is_reaped(pid));
    }

    #[test]
    fn signalled_reader_is_failed_even_after_sending() {
        let (tx, rx) = count_channel(1).unwrap();
        let pid = fork_child(move || {
            let _ = tx.send(500);
            unsafe { libc::raise(libc::SIGKILL) };
            0
        });

        let outcome = collect_reader(1, pid, rx).unwrap();
        assert_eq!(
            outcome.status,
            ReaderStatus::Failed("killed by signal 9".into())
        );
    }

    #[test]
    fn reader_closing_pipe_early_is_failed() {
        let (tx, rx) = count_channel(2).unwrap();
        let pid = fork_child(|| 0);
        drop(tx);

        let outcome = collect_reader(2, pid, rx).unwrap();
        assert_eq!(
            outcome.status,
            ReaderStatus::Failed("exited without reporting a count".into())
        );
    }

    #[test]
    fn reader_count_crosses_the_pipe() {
        let (tx, rx) = count_channel(3).unwrap();
        let pid = fork_child(move || match tx.send(1 << 33) {
            Ok(()) => 0,
            Err(_) => 1,
        });

        let outcome = collect_reader(3, pid, rx).unwrap();
        assert_eq!(outcome.status, ReaderStatus::Completed(1 << 33));
    }

    #[test]
    fn writer_ignoring_stop_flag_is_killed() {
        let pid = fork_child(idle_forever);
        let start = Instant::now();

        assert_eq!(stop_writer(pid, 1000).unwrap(), WriterExit::Killed);
        assert!(start.elapsed() >= STOP_GRACE);
        assert!(is_reaped(pid));
    }

    #[test]
    fn writer_exiting_on_its_own_is_stopped() {
        let pid = fork_child(|| 0);
        assert_eq!(stop_writer(pid, 1000).unwrap(), WriterExit::Stopped);
        assert!(is_reaped(pid));
    }

    #[test]
    fn collection_error_reaps_remaining_children() {
        let stop = StopFlag::new().unwrap();
        let (tx, counts) = count_channel(1).unwrap();
        let reader = fork_child(idle_forever);
        drop(tx);

        // Not a child of ours, so waitpid fails with ECHILD.
        let stranger = libc::pid_t::MAX;
        let children = vec![
            Spawned::Writer { pid: stranger },
            Spawned::Reader {
                index: 1,
                pid: reader,
                counts,
            },
        ];

        let err = collect(children, &stop, 1000).unwrap_err();
        assert!(matches!(err, Error::Wait { pid, .. } if pid == stranger));
        assert!(stop.is_raised());
        assert!(is_reaped(reader));
    }

    proptest! {
        #[test]
        fn throughput_is_exact_quotient(
            counts in proptest::collection::vec(0u64..1_000_000_000, 0..16),
            secs in 1u64..3600,
        ) {
            let readers = counts
                .iter()
                .enumerate()
                .map(|(i, &c)| completed(i, c))
                .collect();
            let run = result(readers, secs);
            let total: u64 = counts.iter().sum();
            prop_assert_eq!(run.total_reads(), total);
            prop_assert_eq!(run.throughput(), total as f64 / secs as f64);
        }
    }
}
