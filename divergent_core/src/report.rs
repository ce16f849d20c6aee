use crate::comparator::{DivergenceReport, Verdict};
use crate::input::Input;
use serde::Serialize;
use std::io::Write;
use std::time::Duration;
use tracing::{info, warn};

/// Aggregate run statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FuzzStats {
    pub iterations: u64,
    /// Per-version executions, summed.
    pub executions: u64,
    pub corpus_size: usize,
    pub findings: usize,
    pub agreements: u64,
    pub divergences: u64,
    pub faults: u64,
    pub shared_faults: u64,
    pub unresolved: u64,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl FuzzStats {
    pub fn execs_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.executions as f64 / secs
        } else {
            0.0
        }
    }
}

/// Receives findings as they are made and periodic statistics.
pub trait Reporter<I: Input>: Send {
    fn report_divergence(&mut self, report: &DivergenceReport<I>) -> Result<(), anyhow::Error>;

    fn report_stats(&mut self, stats: &FuzzStats) -> Result<(), anyhow::Error>;
}

/// Writes findings and statistics to the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl<I: Input> Reporter<I> for LogReporter {
    fn report_divergence(&mut self, report: &DivergenceReport<I>) -> Result<(), anyhow::Error> {
        let input = String::from_utf8_lossy(report.input.as_bytes());
        match &report.verdict {
            Verdict::Diverge { outliers } => warn!(
                input_hash = %report.input_hash,
                outliers = ?outliers,
                %input,
                "versions diverge"
            ),
            Verdict::Fault { faulted } => {
                for outcome in &report.outcomes {
                    if let Some(fault) = outcome.outcome.fault() {
                        warn!(
                            input_hash = %report.input_hash,
                            version = %outcome.version,
                            kind = %fault.kind,
                            detail = %fault.detail,
                            "version faulted"
                        );
                    }
                }
                warn!(input_hash = %report.input_hash, faulted = ?faulted, %input, "fault in a subset of versions");
            }
            Verdict::SharedFault { kind } => {
                info!(input_hash = %report.input_hash, %kind, "all versions faulted alike")
            }
            Verdict::Agree | Verdict::Unresolved { .. } => {}
        }
        Ok(())
    }

    fn report_stats(&mut self, stats: &FuzzStats) -> Result<(), anyhow::Error> {
        info!(
            iterations = stats.iterations,
            executions = stats.executions,
            execs_per_sec = format_args!("{:.1}", stats.execs_per_sec()),
            corpus = stats.corpus_size,
            findings = stats.findings,
            divergences = stats.divergences,
            faults = stats.faults,
            shared_faults = stats.shared_faults,
            unresolved = stats.unresolved,
            "stats"
        );
        Ok(())
    }
}

/// Appends one JSON object per finding to a writer, flushing after each so
/// that findings survive an abrupt stop.
pub struct JsonLinesReporter<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesReporter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<I: Input, W: Write + Send> Reporter<I> for JsonLinesReporter<W> {
    fn report_divergence(&mut self, report: &DivergenceReport<I>) -> Result<(), anyhow::Error> {
        serde_json::to_writer(&mut self.writer, report)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    fn report_stats(&mut self, _stats: &FuzzStats) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

/// Forwards every call to each inner reporter in turn.
pub struct MultiReporter<I: Input> {
    reporters: Vec<Box<dyn Reporter<I>>>,
}

impl<I: Input> MultiReporter<I> {
    pub fn new(reporters: Vec<Box<dyn Reporter<I>>>) -> Self {
        Self { reporters }
    }
}

impl<I: Input> Reporter<I> for MultiReporter<I> {
    fn report_divergence(&mut self, report: &DivergenceReport<I>) -> Result<(), anyhow::Error> {
        for reporter in &mut self.reporters {
            reporter.report_divergence(report)?;
        }
        Ok(())
    }

    fn report_stats(&mut self, stats: &FuzzStats) -> Result<(), anyhow::Error> {
        for reporter in &mut self.reporters {
            reporter.report_stats(stats)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::VersionOutcome;
    use crate::target::{ExecOutput, Fault, FaultKind, Outcome};

    fn report(verdict: Verdict) -> DivergenceReport<Vec<u8>> {
        let input = b"SELECT 1;".to_vec();
        DivergenceReport {
            input_hash: input.digest_hex(),
            input,
            outcomes: vec![
                VersionOutcome {
                    version: "a".into(),
                    outcome: Outcome::Completed(ExecOutput::Rows(vec![vec!["1".into()]])),
                    covered_edges: 4,
                    duration_ms: 1,
                },
                VersionOutcome {
                    version: "b".into(),
                    outcome: Outcome::Fault(Fault::new(FaultKind::Crash, "signal 11")),
                    covered_edges: 2,
                    duration_ms: 3,
                },
            ],
            verdict,
        }
    }

    #[test]
    fn json_lines_reporter_writes_one_object_per_line() {
        let mut reporter = JsonLinesReporter::new(Vec::new());
        let fault = report(Verdict::Fault {
            faulted: vec!["b".into()],
        });
        reporter.report_divergence(&fault).unwrap();
        reporter
            .report_divergence(&report(Verdict::Diverge {
                outliers: vec!["a".into()],
            }))
            .unwrap();

        let written = String::from_utf8(reporter.into_inner()).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["verdict"], "fault");
        assert_eq!(first["faulted"][0], "b");
        assert_eq!(first["input"], "SELECT 1;");
        assert_eq!(first["outcomes"][1]["outcome"]["fault"]["kind"], "crash");
        assert_eq!(first["outcomes"][0]["outcome"]["completed"]["rows"][0][0], "1");
    }

    #[test]
    fn multi_reporter_fans_out() {
        let mut reporter: MultiReporter<Vec<u8>> =
            MultiReporter::new(vec![Box::new(LogReporter), Box::new(LogReporter)]);
        reporter
            .report_divergence(&report(Verdict::SharedFault {
                kind: FaultKind::Timeout,
            }))
            .unwrap();
        reporter.report_stats(&FuzzStats::default()).unwrap();
    }

    #[test]
    fn execs_per_sec_handles_zero_elapsed() {
        let stats = FuzzStats {
            executions: 10,
            ..FuzzStats::default()
        };
        assert_eq!(stats.execs_per_sec(), 0.0);
        let stats = FuzzStats {
            executions: 10,
            elapsed: Duration::from_secs(2),
            ..FuzzStats::default()
        };
        assert_eq!(stats.execs_per_sec(), 5.0);
    }
}
