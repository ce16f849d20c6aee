//! Predicates deciding whether two versions produced "the same" result.

use crate::target::ExecOutput;

/// Decides whether two completed outputs agree.
///
/// Returning an error marks the comparison as unresolved instead of forcing
/// a verdict.
pub trait Equivalence: Send + Sync {
    fn equivalent(&self, left: &ExecOutput, right: &ExecOutput) -> Result<bool, anyhow::Error>;
}

impl<F> Equivalence for F
where
    F: Fn(&ExecOutput, &ExecOutput) -> Result<bool, anyhow::Error> + Send + Sync,
{
    fn equivalent(&self, left: &ExecOutput, right: &ExecOutput) -> Result<bool, anyhow::Error> {
        self(left, right)
    }
}

/// Structural equality.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactEquivalence;

impl Equivalence for ExactEquivalence {
    fn equivalent(&self, left: &ExecOutput, right: &ExecOutput) -> Result<bool, anyhow::Error> {
        Ok(left == right)
    }
}

/// Equality modulo representation details that legitimately differ between
/// engine versions.
#[derive(Debug, Clone, Copy)]
pub struct NormalizedEquivalence {
    /// Compare row sets as multisets. Queries without `ORDER BY` have no
    /// defined row order.
    pub unordered_rows: bool,
    /// Trim values and collapse internal whitespace runs.
    pub normalize_whitespace: bool,
    /// Two errors agree regardless of message text.
    pub match_errors_by_presence: bool,
}

impl Default for NormalizedEquivalence {
    fn default() -> Self {
        Self {
            unordered_rows: true,
            normalize_whitespace: true,
            match_errors_by_presence: false,
        }
    }
}

impl NormalizedEquivalence {
    fn normalize_value(&self, value: &str) -> String {
        if self.normalize_whitespace {
            value.split_whitespace().collect::<Vec<_>>().join(" ")
        } else {
            value.to_string()
        }
    }

    fn normalize_rows(&self, rows: &[Vec<String>]) -> Vec<Vec<String>> {
        let mut rows: Vec<Vec<String>> = rows
            .iter()
            .map(|row| row.iter().map(|v| self.normalize_value(v)).collect())
            .collect();
        if self.unordered_rows {
            rows.sort();
        }
        rows
    }
}

impl Equivalence for NormalizedEquivalence {
    fn equivalent(&self, left: &ExecOutput, right: &ExecOutput) -> Result<bool, anyhow::Error> {
        Ok(match (left, right) {
            (ExecOutput::Rows(a), ExecOutput::Rows(b)) => {
                a.len() == b.len() && self.normalize_rows(a) == self.normalize_rows(b)
            }
            (ExecOutput::Changes(a), ExecOutput::Changes(b)) => a == b,
            (ExecOutput::Error(a), ExecOutput::Error(b)) => {
                self.match_errors_by_presence || self.normalize_value(a) == self.normalize_value(b)
            }
            _ => false,
        })
    }
}
