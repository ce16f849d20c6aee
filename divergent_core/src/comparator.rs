use crate::equivalence::Equivalence;
use crate::executor::ExecutionRecord;
use crate::input::Input;
use crate::target::{ExecOutput, FaultKind, Outcome};
use serde::{Serialize, Serializer};
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::warn;

/// Classification of one input's records across every version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "kebab-case")]
pub enum Verdict {
    /// Every version completed and all outputs are equivalent.
    Agree,
    /// Completed outputs fall into more than one equivalence class. The
    /// outliers are the versions outside the largest class.
    Diverge { outliers: Vec<String> },
    /// Some versions faulted while others completed, or all faulted with
    /// different classifications.
    Fault { faulted: Vec<String> },
    /// Every version faulted the same way. Usually a degenerate input rather
    /// than a version-specific bug.
    SharedFault { kind: FaultKind },
    /// No verdict could be reached, e.g. the predicate failed.
    Unresolved { reason: String },
}

impl Verdict {
    /// Verdicts handed to the reporter as soon as they are reached.
    pub fn is_finding(&self) -> bool {
        matches!(
            self,
            Verdict::Diverge { .. } | Verdict::Fault { .. } | Verdict::SharedFault { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Verdict::Agree => "agree",
            Verdict::Diverge { .. } => "diverge",
            Verdict::Fault { .. } => "fault",
            Verdict::SharedFault { .. } => "shared-fault",
            Verdict::Unresolved { .. } => "unresolved",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionOutcome {
    pub version: String,
    pub outcome: Outcome,
    pub covered_edges: usize,
    pub duration_ms: u128,
}

/// Result of comparing one input across all versions. Immutable once built.
#[derive(Debug, Clone, Serialize)]
#[serde(bound = "")]
pub struct DivergenceReport<I: Input> {
    #[serde(serialize_with = "serialize_input")]
    pub input: I,
    pub input_hash: String,
    pub outcomes: Vec<VersionOutcome>,
    #[serde(flatten)]
    pub verdict: Verdict,
}

fn serialize_input<I: Input, S: Serializer>(input: &I, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(input.as_bytes()))
}

/// Groups per-version records for one input into a [`Verdict`] using a
/// caller-supplied [`Equivalence`].
pub struct DifferentialComparator {
    equivalence: Box<dyn Equivalence>,
}

impl DifferentialComparator {
    pub fn new(equivalence: impl Equivalence + 'static) -> Self {
        Self {
            equivalence: Box::new(equivalence),
        }
    }

    pub fn compare<I: Input>(&self, input: &I, records: &[ExecutionRecord<I>]) -> DivergenceReport<I> {
        let verdict = self.classify(records);
        if let Verdict::Unresolved { reason } = &verdict {
            warn!(input_hash = %input.digest_hex(), %reason, "comparison unresolved");
        }
        DivergenceReport {
            input: input.clone(),
            input_hash: input.digest_hex(),
            outcomes: records
                .iter()
                .map(|r| VersionOutcome {
                    version: r.version.clone(),
                    outcome: r.outcome.clone(),
                    covered_edges: r.coverage.covered_edges(),
                    duration_ms: r.duration.as_millis(),
                })
                .collect(),
            verdict,
        }
    }

    fn classify<I: Input>(&self, records: &[ExecutionRecord<I>]) -> Verdict {
        if records.len() < 2 {
            return Verdict::Unresolved {
                reason: format!("need at least two versions, got {}", records.len()),
            };
        }

        let faulted: Vec<&ExecutionRecord<I>> = records.iter().filter(|r| r.is_fault()).collect();
        if faulted.len() == records.len() {
            let first = faulted[0].outcome.fault().map(|f| f.kind);
            if faulted.iter().all(|r| r.outcome.fault().map(|f| f.kind) == first) {
                if let Some(kind) = first {
                    return Verdict::SharedFault { kind };
                }
            }
        }
        if !faulted.is_empty() {
            return Verdict::Fault {
                faulted: faulted.iter().map(|r| r.version.clone()).collect(),
            };
        }

        // Equivalence classes as (representative output, member indices).
        let mut classes: Vec<(&ExecOutput, Vec<usize>)> = Vec::new();
        for (index, record) in records.iter().enumerate() {
            let Some(output) = record.outcome.output() else {
                continue;
            };
            let mut placed = false;
            for (representative, members) in &mut classes {
                match self.equivalent(*representative, output) {
                    Ok(true) => {
                        members.push(index);
                        placed = true;
                        break;
                    }
                    Ok(false) => {}
                    Err(reason) => return Verdict::Unresolved { reason },
                }
            }
            if !placed {
                classes.push((output, vec![index]));
            }
        }

        if classes.len() <= 1 {
            return Verdict::Agree;
        }
        let mut reference = 0;
        for (i, (_, members)) in classes.iter().enumerate() {
            if members.len() > classes[reference].1.len() {
                reference = i;
            }
        }
        let outliers = records
            .iter()
            .enumerate()
            .filter(|(i, _)| !classes[reference].1.contains(i))
            .map(|(_, r)| r.version.clone())
            .collect();
        Verdict::Diverge { outliers }
    }

    fn equivalent(&self, left: &ExecOutput, right: &ExecOutput) -> Result<bool, String> {
        match catch_unwind(AssertUnwindSafe(|| self.equivalence.equivalent(left, right))) {
            Ok(Ok(same)) => Ok(same),
            Ok(Err(e)) => Err(format!("equivalence predicate failed: {e:#}")),
            Err(panic_payload) => {
                let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic type".to_string()
                };
                Err(format!("equivalence predicate panicked: {msg}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::CoverageSnapshot;
    use crate::equivalence::{ExactEquivalence, NormalizedEquivalence};
    use crate::target::Fault;
    use std::time::Duration;

    fn record(version: &str, outcome: Outcome) -> ExecutionRecord<Vec<u8>> {
        ExecutionRecord {
            input: b"SELECT 1;".to_vec(),
            version: version.to_string(),
            coverage: CoverageSnapshot::from_counts(vec![0u8; 64]),
            outcome,
            duration: Duration::from_millis(1),
        }
    }

    fn completed(version: &str, output: ExecOutput) -> ExecutionRecord<Vec<u8>> {
        record(version, Outcome::Completed(output))
    }

    fn faulted(version: &str, kind: FaultKind) -> ExecutionRecord<Vec<u8>> {
        record(version, Outcome::Fault(Fault::new(kind, "test")))
    }

    fn compare(records: &[ExecutionRecord<Vec<u8>>]) -> Verdict {
        DifferentialComparator::new(ExactEquivalence)
            .compare(&b"SELECT 1;".to_vec(), records)
            .verdict
    }

    #[test]
    fn identical_change_counts_agree() {
        let records = [
            completed("a", ExecOutput::Changes(1)),
            completed("b", ExecOutput::Changes(1)),
        ];
        assert_eq!(compare(&records), Verdict::Agree);
    }

    #[test]
    fn identical_application_errors_agree() {
        let err = ExecOutput::Error("no such table: t".into());
        let records = [completed("a", err.clone()), completed("b", err)];
        assert_eq!(compare(&records), Verdict::Agree);
    }

    #[test]
    fn single_outlier_is_named() {
        let records = [
            completed("a", ExecOutput::Changes(1)),
            completed("b", ExecOutput::Changes(2)),
            completed("c", ExecOutput::Changes(1)),
        ];
        assert_eq!(
            compare(&records),
            Verdict::Diverge {
                outliers: vec!["b".to_string()]
            }
        );
    }

    #[test]
    fn two_way_split_names_the_second_class() {
        let records = [
            completed("a", ExecOutput::Changes(1)),
            completed("b", ExecOutput::Changes(2)),
        ];
        assert_eq!(
            compare(&records),
            Verdict::Diverge {
                outliers: vec!["b".to_string()]
            }
        );
    }

    #[test]
    fn timeout_in_one_version_is_a_fault_verdict() {
        let records = [
            completed("a", ExecOutput::Changes(1)),
            faulted("b", FaultKind::Timeout),
        ];
        assert_eq!(
            compare(&records),
            Verdict::Fault {
                faulted: vec!["b".to_string()]
            }
        );
    }

    #[test]
    fn fault_takes_precedence_over_divergence() {
        let records = [
            completed("a", ExecOutput::Changes(1)),
            completed("b", ExecOutput::Changes(2)),
            faulted("c", FaultKind::Crash),
        ];
        assert!(matches!(compare(&records), Verdict::Fault { faulted } if faulted == ["c"]));
    }

    #[test]
    fn identical_faults_everywhere_are_shared() {
        let records = [faulted("a", FaultKind::Crash), faulted("b", FaultKind::Crash)];
        assert_eq!(
            compare(&records),
            Verdict::SharedFault {
                kind: FaultKind::Crash
            }
        );
    }

    #[test]
    fn different_faults_everywhere_are_a_fault() {
        let records = [faulted("a", FaultKind::Crash), faulted("b", FaultKind::Timeout)];
        assert_eq!(
            compare(&records),
            Verdict::Fault {
                faulted: vec!["a".to_string(), "b".to_string()]
            }
        );
    }

    #[test]
    fn fewer_than_two_records_is_unresolved() {
        let records = [completed("a", ExecOutput::Changes(1))];
        assert!(matches!(compare(&records), Verdict::Unresolved { .. }));
    }

    #[test]
    fn predicate_error_is_unresolved() {
        let comparator = DifferentialComparator::new(
            |_: &ExecOutput, _: &ExecOutput| -> Result<bool, anyhow::Error> {
                Err(anyhow::anyhow!("cannot compare"))
            },
        );
        let records = [
            completed("a", ExecOutput::Changes(1)),
            completed("b", ExecOutput::Changes(1)),
        ];
        let report = comparator.compare(&b"x".to_vec(), &records);
        match report.verdict {
            Verdict::Unresolved { reason } => assert!(reason.contains("cannot compare")),
            other => panic!("Expected Unresolved, got {other:?}"),
        }
    }

    #[test]
    fn predicate_panic_is_unresolved() {
        let comparator = DifferentialComparator::new(
            |_: &ExecOutput, _: &ExecOutput| -> Result<bool, anyhow::Error> {
                panic!("predicate bug")
            },
        );
        let records = [
            completed("a", ExecOutput::Changes(1)),
            completed("b", ExecOutput::Changes(1)),
        ];
        let verdict = comparator.compare(&b"x".to_vec(), &records).verdict;
        assert!(matches!(verdict, Verdict::Unresolved { reason } if reason.contains("predicate bug")));
    }

    #[test]
    fn normalized_predicate_ignores_row_order() {
        let comparator = DifferentialComparator::new(NormalizedEquivalence::default());
        let a = ExecOutput::Rows(vec![vec!["1".into()], vec!["2".into()]]);
        let b = ExecOutput::Rows(vec![vec!["2".into()], vec!["1".into()]]);
        let records = [completed("a", a), completed("b", b)];
        assert_eq!(comparator.compare(&b"x".to_vec(), &records).verdict, Verdict::Agree);
    }

    #[test]
    fn report_serializes_with_input_text_and_hash() {
        let records = [
            completed("a", ExecOutput::Changes(1)),
            completed("b", ExecOutput::Changes(2)),
        ];
        let input = b"UPDATE t SET x = 1;".to_vec();
        let report = DifferentialComparator::new(ExactEquivalence).compare(&input, &records);
        assert_eq!(report.input_hash, format!("{:x}", md5::compute(&input)));

        let json: serde_json::Value = serde_json::to_value(&report).unwrap();
        assert_eq!(json["input"], "UPDATE t SET x = 1;");
        assert_eq!(json["verdict"], "diverge");
        assert_eq!(json["outliers"][0], "b");
        assert_eq!(json["outcomes"][1]["version"], "b");
    }
}
