use crate::corpus::{Corpus, EntryMetadata};
use crate::input::Input;
use rand::Rng;
use rand_core::RngCore;
use std::collections::HashMap;
use thiserror::Error;

/// Iterations after which an entry's recency bonus has halved.
pub const DEFAULT_RECENCY_WINDOW: u64 = 1_000;

/// Errors that can occur during scheduler operations.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// The corpus is empty, so no entry can be scheduled.
    #[error("Corpus is empty, cannot schedule next input")]
    CorpusEmpty,
}

/// Picks the corpus entry the next mutation starts from.
pub trait Scheduler<I: Input>: Send + Sync {
    /// Returns the ID of the next entry to mutate. `iteration` is the
    /// fuzzer's current iteration, used to age entries.
    fn next(
        &mut self,
        corpus: &dyn Corpus<I>,
        rng: &mut dyn RngCore,
        iteration: u64,
    ) -> Result<usize, SchedulerError>;

    /// Reports what a child of `entry_id` achieved: new coverage, and whether
    /// it produced a finding.
    fn report_feedback(&mut self, entry_id: usize, novel_edges: usize, is_finding: bool);
}

#[derive(Debug, Default, Clone, Copy)]
struct Productivity {
    child_edges: usize,
    findings: usize,
}

/// Prefers entries that revealed a lot, were found recently, have productive
/// children and have not been picked often yet.
///
/// Weight of an entry:
/// `(1 + novel_edges + child_edges + 4 * findings) * recency / (1 + selections)`
/// with `recency = window / (window + age)`.
#[derive(Debug)]
pub struct NoveltyWeightedScheduler {
    recency_window: u64,
    productivity: HashMap<usize, Productivity>,
}

impl Default for NoveltyWeightedScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_RECENCY_WINDOW)
    }
}

impl NoveltyWeightedScheduler {
    pub fn new(recency_window: u64) -> Self {
        Self {
            recency_window: recency_window.max(1),
            productivity: HashMap::new(),
        }
    }

    pub fn weight(&self, id: usize, metadata: &EntryMetadata, iteration: u64) -> f64 {
        let productivity = self.productivity.get(&id).copied().unwrap_or_default();
        let merit = 1.0
            + metadata.novel_edges as f64
            + productivity.child_edges as f64
            + 4.0 * productivity.findings as f64;
        let age = iteration.saturating_sub(metadata.found_at) as f64;
        let window = self.recency_window as f64;
        let recency = window / (window + age);
        merit * recency / (1.0 + metadata.selections as f64)
    }
}

impl<I: Input> Scheduler<I> for NoveltyWeightedScheduler {
    fn next(
        &mut self,
        corpus: &dyn Corpus<I>,
        rng: &mut dyn RngCore,
        iteration: u64,
    ) -> Result<usize, SchedulerError> {
        if corpus.is_empty() {
            return Err(SchedulerError::CorpusEmpty);
        }
        let weights: Vec<(usize, f64)> = corpus
            .entries()
            .map(|entry| (entry.id, self.weight(entry.id, &entry.metadata, iteration)))
            .collect();
        let total: f64 = weights.iter().map(|(_, w)| w).sum();
        if !total.is_finite() || total <= 0.0 {
            return corpus
                .random_select(rng)
                .map(|entry| entry.id)
                .ok_or(SchedulerError::CorpusEmpty);
        }

        let mut target = rng.random::<f64>() * total;
        for &(id, weight) in &weights {
            if target < weight {
                return Ok(id);
            }
            target -= weight;
        }
        // Rounding can leave a sliver past the last entry.
        weights
            .last()
            .map(|&(id, _)| id)
            .ok_or(SchedulerError::CorpusEmpty)
    }

    fn report_feedback(&mut self, entry_id: usize, novel_edges: usize, is_finding: bool) {
        if novel_edges == 0 && !is_finding {
            return;
        }
        let productivity = self.productivity.entry(entry_id).or_default();
        productivity.child_edges += novel_edges;
        if is_finding {
            productivity.findings += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{EntrySource, InMemoryCorpus};
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn metadata(novel_edges: usize, found_at: u64, selections: u64) -> EntryMetadata {
        EntryMetadata {
            source: EntrySource::Synthesized,
            found_at,
            novel_edges,
            novel_versions: vec![],
            covered_edges: novel_edges,
            signature: String::new(),
            selections,
        }
    }

    fn pick_counts(
        scheduler: &mut NoveltyWeightedScheduler,
        corpus: &InMemoryCorpus<Vec<u8>>,
        iteration: u64,
    ) -> Vec<usize> {
        let mut rng = ChaCha8Rng::from_seed([7; 32]);
        let mut counts = vec![0; corpus.len()];
        for _ in 0..2_000 {
            let id = Scheduler::<Vec<u8>>::next(scheduler, corpus, &mut rng, iteration).unwrap();
            counts[id] += 1;
        }
        counts
    }

    #[test]
    fn empty_corpus_is_an_error() {
        let mut scheduler = NoveltyWeightedScheduler::default();
        let corpus: InMemoryCorpus<Vec<u8>> = InMemoryCorpus::new();
        let mut rng = ChaCha8Rng::from_seed([0; 32]);
        assert!(matches!(
            Scheduler::<Vec<u8>>::next(&mut scheduler, &corpus, &mut rng, 0),
            Err(SchedulerError::CorpusEmpty)
        ));
    }

    #[test]
    fn entries_with_more_novelty_are_picked_more_often() {
        let mut scheduler = NoveltyWeightedScheduler::default();
        let mut corpus: InMemoryCorpus<Vec<u8>> = InMemoryCorpus::new();
        corpus.add(vec![0], metadata(1, 0, 0)).unwrap();
        corpus.add(vec![1], metadata(30, 0, 0)).unwrap();

        let counts = pick_counts(&mut scheduler, &corpus, 0);
        assert!(counts[1] > counts[0] * 5, "counts: {counts:?}");
        assert!(counts[0] > 0, "low-weight entries must still be reachable");
    }

    #[test]
    fn recent_entries_beat_old_ones_with_equal_novelty() {
        let scheduler = NoveltyWeightedScheduler::new(100);
        let old = metadata(5, 0, 0);
        let recent = metadata(5, 900, 0);
        assert!(scheduler.weight(1, &recent, 1_000) > scheduler.weight(0, &old, 1_000) * 4.0);
    }

    #[test]
    fn selections_and_feedback_shift_weight() {
        let mut scheduler = NoveltyWeightedScheduler::default();
        let fresh = metadata(2, 0, 0);
        let worn = metadata(2, 0, 9);
        assert!(scheduler.weight(0, &fresh, 0) > scheduler.weight(1, &worn, 0));

        let before = scheduler.weight(0, &fresh, 0);
        <NoveltyWeightedScheduler as Scheduler<Vec<u8>>>::report_feedback(&mut scheduler, 0, 6, true);
        let after = scheduler.weight(0, &fresh, 0);
        assert_eq!(after, before + 10.0);

        <NoveltyWeightedScheduler as Scheduler<Vec<u8>>>::report_feedback(&mut scheduler, 1, 0, false);
        assert_eq!(scheduler.weight(1, &worn, 0), 3.0 / 10.0);
    }
}
