use crate::coverage::{CoverageError, CoverageMap, CoverageSnapshot};
use crate::input::Input;
use crate::sink::CoverageSink;
use crate::target::{FaultKind, Outcome, Target};
use anyhow::anyhow;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Everything one execution of one input against one version produced.
#[derive(Debug, Clone)]
pub struct ExecutionRecord<I: Input> {
    pub input: I,
    pub version: String,
    pub coverage: CoverageSnapshot,
    pub outcome: Outcome,
    pub duration: Duration,
}

impl<I: Input> ExecutionRecord<I> {
    pub fn is_fault(&self) -> bool {
        self.outcome.fault().is_some()
    }
}

/// Runs inputs against one target version with a coverage map of its own.
///
/// Each call to [`ExecutionDriver::run`] zeroes the map, hands the target a
/// sink onto it, snapshots the map once the target returns and packages the
/// lot into an [`ExecutionRecord`]. A faulted target is recycled before the
/// record is returned, so the next input starts from a clean context.
pub struct ExecutionDriver {
    target: Box<dyn Target>,
    map: Arc<CoverageMap>,
    sink: CoverageSink,
    timeout: Duration,
    executions: u64,
}

impl ExecutionDriver {
    pub fn new(
        target: Box<dyn Target>,
        capacity: usize,
        timeout: Duration,
    ) -> Result<Self, CoverageError> {
        let map = Arc::new(CoverageMap::new(capacity)?);
        let sink = CoverageSink::new(Arc::clone(&map));
        Ok(Self {
            target,
            map,
            sink,
            timeout,
            executions: 0,
        })
    }

    pub fn version(&self) -> &str {
        self.target.version()
    }

    pub fn capacity(&self) -> usize {
        self.map.capacity()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    /// The map the target currently writes into. Replaced after a timeout.
    pub fn coverage_map(&self) -> &Arc<CoverageMap> {
        &self.map
    }

    pub fn run<I: Input>(&mut self, input: &I) -> ExecutionRecord<I> {
        self.map.reset();
        let start = Instant::now();
        let outcome = self
            .target
            .execute(input.as_bytes(), &self.sink, self.timeout);
        let duration = start.elapsed();
        let coverage = self.map.snapshot();
        self.executions += 1;

        if let Some(fault) = outcome.fault() {
            debug!(
                version = %self.target.version(),
                kind = %fault.kind,
                detail = %fault.detail,
                "target faulted, recycling"
            );
            if fault.kind == FaultKind::Timeout {
                self.replace_map();
            }
            if let Err(e) = self.target.recycle() {
                warn!(version = %self.target.version(), error = %e, "failed to recycle target");
            }
        }

        ExecutionRecord {
            input: input.clone(),
            version: self.target.version().to_string(),
            coverage,
            outcome,
            duration,
        }
    }

    /// Runs an empty input and fails if the target cannot complete it.
    pub fn warm_up(&mut self) -> Result<(), anyhow::Error> {
        let record = self.run(&Vec::<u8>::new());
        match record.outcome.fault() {
            Some(fault) => Err(anyhow!(
                "target '{}' failed to start: {} ({})",
                record.version,
                fault.kind,
                fault.detail
            )),
            None => Ok(()),
        }
    }

    // A timed-out context may still be writing into the old map.
    fn replace_map(&mut self) {
        match CoverageMap::new(self.map.capacity()) {
            Ok(map) => {
                self.map = Arc::new(map);
                self.sink = CoverageSink::new(Arc::clone(&self.map));
            }
            Err(e) => warn!(error = %e, "could not allocate replacement coverage map"),
        }
    }
}
