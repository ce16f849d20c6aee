use crate::sink::CoverageSink;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Structured result of a completed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecOutput {
    /// Result rows, each a list of rendered column values.
    Rows(Vec<Vec<String>>),
    /// Number of rows changed by a data-modifying input.
    Changes(u64),
    /// The engine rejected the input at its API level. This is an ordinary
    /// outcome and is still compared across versions.
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultKind {
    Crash,
    Timeout,
    ResourceExhausted,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Crash => f.write_str("crash"),
            FaultKind::Timeout => f.write_str("timeout"),
            FaultKind::ResourceExhausted => f.write_str("resource-exhausted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    pub detail: String,
}

impl Fault {
    pub fn new(kind: FaultKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// What one execution of one input against one target produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Completed(ExecOutput),
    Fault(Fault),
}

impl Outcome {
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Outcome::Fault(fault) => Some(fault),
            Outcome::Completed(_) => None,
        }
    }

    pub fn output(&self) -> Option<&ExecOutput> {
        match self {
            Outcome::Completed(output) => Some(output),
            Outcome::Fault(_) => None,
        }
    }
}

/// One versioned build of the engine under test.
///
/// `execute` runs a whole input (a sequence of database operations) against a
/// fresh or reused session and must return within roughly `deadline`. Hangs
/// are reported as [`FaultKind::Timeout`], never by blocking the caller.
/// Edges executed by the target are reported through `coverage`.
pub trait Target: Send {
    fn version(&self) -> &str;

    fn execute(&mut self, input: &[u8], coverage: &CoverageSink, deadline: Duration) -> Outcome;

    /// Discards the execution context and prepares a fresh one. Called by the
    /// driver after every fault.
    fn recycle(&mut self) -> Result<(), anyhow::Error>;
}

/// Harness signature for [`InProcessTarget`].
///
/// Returning `Err(kind)` reports a fault other than a panic, for example a
/// harness that detects its own memory limit being hit.
pub type Harness =
    dyn Fn(&[u8], &CoverageSink) -> Result<ExecOutput, FaultKind> + Send + Sync + 'static;

struct Job {
    input: Vec<u8>,
    coverage: CoverageSink,
}

struct Worker {
    jobs: Sender<Job>,
    results: Receiver<Result<ExecOutput, Fault>>,
    _handle: JoinHandle<()>,
}

impl Worker {
    fn spawn(version: &str, harness: Arc<Harness>) -> std::io::Result<Self> {
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (result_tx, result_rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name(format!("target-{version}"))
            .spawn(move || {
                for job in job_rx {
                    let result = catch_unwind(AssertUnwindSafe(|| {
                        harness(&job.input, &job.coverage)
                    }));
                    let result = match result {
                        Ok(Ok(output)) => Ok(output),
                        Ok(Err(kind)) => Err(Fault::new(kind, "reported by harness")),
                        Err(panic_payload) => {
                            let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                                s.to_string()
                            } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                                s.clone()
                            } else {
                                "Unknown panic type".to_string()
                            };
                            Err(Fault::new(FaultKind::Crash, msg))
                        }
                    };
                    if result_tx.send(result).is_err() {
                        // Abandoned after a timeout.
                        return;
                    }
                }
            })?;
        Ok(Self {
            jobs: job_tx,
            results: result_rx,
            _handle: handle,
        })
    }
}

/// Runs a Rust harness function on a dedicated worker thread.
///
/// The worker is the isolated execution context: a panic is caught and
/// reported as a crash, and a harness that misses its deadline is abandoned
/// (its thread keeps the old coverage sink until it returns) and replaced by a
/// new worker on the next execution.
pub struct InProcessTarget {
    version: String,
    harness: Arc<Harness>,
    worker: Option<Worker>,
}

impl InProcessTarget {
    pub fn new<F>(version: impl Into<String>, harness: F) -> Self
    where
        F: Fn(&[u8], &CoverageSink) -> Result<ExecOutput, FaultKind> + Send + Sync + 'static,
    {
        Self {
            version: version.into(),
            harness: Arc::new(harness),
            worker: None,
        }
    }
}

impl Target for InProcessTarget {
    fn version(&self) -> &str {
        &self.version
    }

    fn execute(&mut self, input: &[u8], coverage: &CoverageSink, deadline: Duration) -> Outcome {
        if self.worker.is_none() {
            match Worker::spawn(&self.version, Arc::clone(&self.harness)) {
                Ok(worker) => self.worker = Some(worker),
                Err(e) => {
                    return Outcome::Fault(Fault::new(
                        FaultKind::ResourceExhausted,
                        format!("failed to spawn worker thread: {e}"),
                    ));
                }
            }
        }
        let Some(worker) = self.worker.as_ref() else {
            return Outcome::Fault(Fault::new(FaultKind::Crash, "worker unavailable"));
        };

        let job = Job {
            input: input.to_vec(),
            coverage: coverage.clone(),
        };
        if worker.jobs.send(job).is_err() {
            self.worker = None;
            return Outcome::Fault(Fault::new(FaultKind::Crash, "worker thread exited"));
        }

        match worker.results.recv_timeout(deadline) {
            Ok(Ok(output)) => Outcome::Completed(output),
            Ok(Err(fault)) => Outcome::Fault(fault),
            Err(RecvTimeoutError::Timeout) => {
                warn!(version = %self.version, ?deadline, "in-process harness timed out, abandoning worker");
                self.worker = None;
                Outcome::Fault(Fault::new(
                    FaultKind::Timeout,
                    format!("no result within {deadline:?}"),
                ))
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.worker = None;
                Outcome::Fault(Fault::new(FaultKind::Crash, "worker thread exited"))
            }
        }
    }

    fn recycle(&mut self) -> Result<(), anyhow::Error> {
        debug!(version = %self.version, "recycling in-process worker");
        self.worker = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::{CoverageMap, MIN_MAP_CAPACITY};

    fn sink() -> (Arc<CoverageMap>, CoverageSink) {
        let map = Arc::new(CoverageMap::new(MIN_MAP_CAPACITY).unwrap());
        (Arc::clone(&map), CoverageSink::new(map))
    }

    #[test]
    fn in_process_target_runs_harness_and_reports_coverage() {
        let (map, sink) = sink();
        let mut target = InProcessTarget::new("v1", |data: &[u8], cov: &CoverageSink| {
            cov.hit(7);
            Ok(ExecOutput::Changes(data.len() as u64))
        });
        let outcome = target.execute(b"abc", &sink, Duration::from_secs(5));
        assert_eq!(outcome, Outcome::Completed(ExecOutput::Changes(3)));
        assert_eq!(map.get(7), 1);
        assert_eq!(target.version(), "v1");
    }

    #[test]
    fn in_process_target_catches_panic() {
        let (_map, sink) = sink();
        let mut target = InProcessTarget::new("v1", |data: &[u8], _cov: &CoverageSink| {
            if data.first() == Some(&0xFF) {
                panic!("Boom!");
            }
            Ok(ExecOutput::Changes(0))
        });
        match target.execute(&[0xFF], &sink, Duration::from_secs(5)) {
            Outcome::Fault(fault) => {
                assert_eq!(fault.kind, FaultKind::Crash);
                assert!(fault.detail.contains("Boom!"));
            }
            other => panic!("Expected a crash, got {other:?}"),
        }
        // The worker survives a caught panic.
        assert_eq!(
            target.execute(&[1], &sink, Duration::from_secs(5)),
            Outcome::Completed(ExecOutput::Changes(0))
        );
    }

    #[test]
    fn in_process_target_times_out_and_recovers() {
        let (_map, sink) = sink();
        let mut target = InProcessTarget::new("slow", |data: &[u8], _cov: &CoverageSink| {
            if data == b"hang" {
                std::thread::sleep(Duration::from_millis(500));
            }
            Ok(ExecOutput::Rows(vec![]))
        });
        match target.execute(b"hang", &sink, Duration::from_millis(20)) {
            Outcome::Fault(fault) => assert_eq!(fault.kind, FaultKind::Timeout),
            other => panic!("Expected Timeout, got {other:?}"),
        }
        target.recycle().unwrap();
        assert_eq!(
            target.execute(b"fast", &sink, Duration::from_secs(5)),
            Outcome::Completed(ExecOutput::Rows(vec![]))
        );
    }

    #[test]
    fn harness_reported_fault_is_kept() {
        let (_map, sink) = sink();
        let mut target = InProcessTarget::new("oom", |_data: &[u8], _cov: &CoverageSink| {
            Err(FaultKind::ResourceExhausted)
        });
        match target.execute(b"x", &sink, Duration::from_secs(5)) {
            Outcome::Fault(fault) => assert_eq!(fault.kind, FaultKind::ResourceExhausted),
            other => panic!("Expected ResourceExhausted, got {other:?}"),
        }
    }
}
