use crate::coverage::CoverageUnion;
use crate::executor::ExecutionRecord;
use crate::input::Input;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FeedbackError {
    #[error("No coverage union for version '{0}'")]
    UnknownVersion(String),
    #[error("Version '{version}' reported {actual} counters, union holds {expected}")]
    CapacityMismatch {
        version: String,
        expected: usize,
        actual: usize,
    },
}

/// What one input's records revealed, per version.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Novelty {
    /// `(version, slots hit for the first time)`, in record order.
    pub per_version: Vec<(String, usize)>,
    /// Largest covered-edge count among the records.
    pub covered_edges: usize,
    /// Hex coverage signature of the first version with new slots.
    pub signature: Option<String>,
}

impl Novelty {
    pub fn novel_edges(&self) -> usize {
        self.per_version.iter().map(|(_, n)| n).sum()
    }

    pub fn is_novel(&self) -> bool {
        self.novel_edges() > 0
    }

    pub fn novel_versions(&self) -> Vec<String> {
        self.per_version
            .iter()
            .filter(|(_, n)| *n > 0)
            .map(|(v, _)| v.clone())
            .collect()
    }
}

/// Tracks the ever-seen coverage of every version separately.
///
/// Versions are different binaries, so a slot index in one map says nothing
/// about the same index in another. An input is novel when it hits an unseen
/// slot in at least one version.
#[derive(Debug)]
pub struct CoverageFeedback {
    unions: Vec<(String, CoverageUnion)>,
}

impl CoverageFeedback {
    pub fn new<S: Into<String>>(versions: impl IntoIterator<Item = (S, usize)>) -> Self {
        Self {
            unions: versions
                .into_iter()
                .map(|(version, capacity)| (version.into(), CoverageUnion::new(capacity)))
                .collect(),
        }
    }

    fn union(&self, version: &str) -> Result<&CoverageUnion, FeedbackError> {
        self.unions
            .iter()
            .find(|(v, _)| v == version)
            .map(|(_, u)| u)
            .ok_or_else(|| FeedbackError::UnknownVersion(version.to_string()))
    }

    /// Ever-seen edge count of one version.
    pub fn covered_edges(&self, version: &str) -> Option<usize> {
        self.union(version).ok().map(CoverageUnion::covered_edges)
    }

    /// Whether any record hits a slot its version has never hit. Does not
    /// update the unions.
    pub fn is_interesting<I: Input>(
        &self,
        records: &[ExecutionRecord<I>],
    ) -> Result<bool, FeedbackError> {
        for record in records {
            if self.union(&record.version)?.has_novel(&record.coverage) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Folds every record into its version's union and reports what was new.
    pub fn evaluate<I: Input>(
        &mut self,
        records: &[ExecutionRecord<I>],
    ) -> Result<Novelty, FeedbackError> {
        let mut novelty = Novelty::default();
        for record in records {
            let union = self
                .unions
                .iter_mut()
                .find(|(v, _)| *v == record.version)
                .map(|(_, u)| u)
                .ok_or_else(|| FeedbackError::UnknownVersion(record.version.clone()))?;
            if union.capacity() != record.coverage.capacity() {
                return Err(FeedbackError::CapacityMismatch {
                    version: record.version.clone(),
                    expected: union.capacity(),
                    actual: record.coverage.capacity(),
                });
            }
            let new_edges = union.union_with(&record.coverage);
            if new_edges > 0 && novelty.signature.is_none() {
                novelty.signature = Some(hex(&record.coverage.signature()));
            }
            novelty.covered_edges = novelty.covered_edges.max(record.coverage.covered_edges());
            novelty.per_version.push((record.version.clone(), new_edges));
        }
        Ok(novelty)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::CoverageSnapshot;
    use crate::target::{ExecOutput, Outcome};
    use std::time::Duration;

    fn record(version: &str, hits: &[usize]) -> ExecutionRecord<Vec<u8>> {
        let mut counts = vec![0u8; 64];
        for &h in hits {
            counts[h] = 1;
        }
        ExecutionRecord {
            input: b"SELECT 1;".to_vec(),
            version: version.to_string(),
            coverage: CoverageSnapshot::from_counts(counts),
            outcome: Outcome::Completed(ExecOutput::Changes(0)),
            duration: Duration::ZERO,
        }
    }

    fn feedback() -> CoverageFeedback {
        CoverageFeedback::new([("a", 64), ("b", 64)])
    }

    #[test]
    fn first_coverage_is_novel_and_repeat_is_not() {
        let mut feedback = feedback();
        let records = [record("a", &[1, 2]), record("b", &[1])];
        assert!(feedback.is_interesting(&records).unwrap());

        let novelty = feedback.evaluate(&records).unwrap();
        assert_eq!(novelty.novel_edges(), 3);
        assert_eq!(novelty.novel_versions(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(novelty.covered_edges, 2);
        assert!(novelty.signature.is_some());

        assert!(!feedback.is_interesting(&records).unwrap());
        assert!(!feedback.evaluate(&records).unwrap().is_novel());
        assert_eq!(feedback.covered_edges("a"), Some(2));
    }

    #[test]
    fn unions_are_kept_per_version() {
        let mut feedback = feedback();
        feedback.evaluate(&[record("a", &[5]), record("b", &[])]).unwrap();

        // Slot 5 is known in "a" but new in "b".
        let novelty = feedback.evaluate(&[record("a", &[5]), record("b", &[5])]).unwrap();
        assert_eq!(novelty.per_version, vec![("a".to_string(), 0), ("b".to_string(), 1)]);
        assert_eq!(novelty.novel_versions(), vec!["b".to_string()]);
    }

    #[test]
    fn empty_coverage_is_never_novel() {
        let mut feedback = feedback();
        let novelty = feedback.evaluate(&[record("a", &[]), record("b", &[])]).unwrap();
        assert!(!novelty.is_novel());
        assert_eq!(novelty.signature, None);
    }

    #[test]
    fn unknown_version_is_an_error() {
        let mut feedback = feedback();
        assert_eq!(
            feedback.evaluate(&[record("zzz", &[1])]),
            Err(FeedbackError::UnknownVersion("zzz".to_string()))
        );
    }
}
