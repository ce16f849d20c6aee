//! The differential fuzzing loop.
//!
//! Every iteration walks the same four states: pick an input (SELECT), run it
//! against every version (EXECUTE), fold the coverage into the per-version
//! unions and classify the outputs (EVALUATE), then keep or drop the input
//! (RETAIN-OR-DISCARD). Per-input problems are recorded and never end the
//! loop; only construction can fail.

use crate::comparator::{DifferentialComparator, DivergenceReport, Verdict};
use crate::corpus::{Corpus, CorpusEntry, EntryMetadata, EntrySource, InMemoryCorpus};
use crate::coverage::CoverageSnapshot;
use crate::executor::{ExecutionDriver, ExecutionRecord};
use crate::feedback::{CoverageFeedback, Novelty};
use crate::input::Input;
use crate::mutator::{Mutator, StatementMutator};
use crate::report::{FuzzStats, Reporter};
use crate::scheduler::{NoveltyWeightedScheduler, Scheduler};
use crate::target::{Fault, FaultKind, Outcome};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FuzzerError {
    #[error("differential fuzzing needs at least two drivers, got {0}")]
    TooFewDrivers(usize),
    #[error("driver version '{0}' appears more than once")]
    DuplicateVersion(String),
}

#[derive(Debug, Clone)]
pub struct FuzzerOptions {
    /// Run the drivers of one input on scoped threads.
    pub parallel: bool,
    /// Chance, once seeds are exhausted, of synthesizing a fresh input
    /// instead of mutating a corpus entry. Clamped to `0.0..=1.0`.
    pub synthesize_probability: f64,
    pub stats_interval: Duration,
    pub rng_seed: u64,
}

impl Default for FuzzerOptions {
    fn default() -> Self {
        Self {
            parallel: true,
            synthesize_probability: 0.05,
            stats_interval: Duration::from_secs(10),
            rng_seed: 0,
        }
    }
}

/// What one iteration did with its input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub source: EntrySource,
    pub verdict: Verdict,
    pub novel_edges: usize,
    /// Corpus ID, when the input revealed new coverage.
    pub retained: Option<usize>,
    /// Findings-corpus ID, when the verdict was escalated.
    pub finding: Option<usize>,
}

struct Candidate<I> {
    input: I,
    source: EntrySource,
}

enum State<I: Input> {
    Select,
    Execute(Candidate<I>),
    Evaluate(Candidate<I>, Vec<ExecutionRecord<I>>),
    RetainOrDiscard(Candidate<I>, Novelty, DivergenceReport<I>),
}

pub struct Fuzzer<I: Input> {
    drivers: Vec<ExecutionDriver>,
    comparator: DifferentialComparator,
    corpus: InMemoryCorpus<I>,
    findings: InMemoryCorpus<I>,
    scheduler: Box<dyn Scheduler<I>>,
    mutator: Box<dyn Mutator<I, ChaCha8Rng>>,
    feedback: CoverageFeedback,
    reporter: Box<dyn Reporter<I>>,
    rng: ChaCha8Rng,
    pending_seeds: VecDeque<I>,
    options: FuzzerOptions,
    stats: FuzzStats,
    started: Instant,
}

impl<I: Input + From<Vec<u8>>> Fuzzer<I> {
    /// Builds a fuzzer with an in-memory corpus, the novelty-weighted
    /// scheduler and the statement mutator.
    pub fn new(
        drivers: Vec<ExecutionDriver>,
        comparator: DifferentialComparator,
        reporter: Box<dyn Reporter<I>>,
        options: FuzzerOptions,
    ) -> Result<Self, FuzzerError> {
        if drivers.len() < 2 {
            return Err(FuzzerError::TooFewDrivers(drivers.len()));
        }
        let mut versions = HashSet::new();
        for driver in &drivers {
            if !versions.insert(driver.version().to_string()) {
                return Err(FuzzerError::DuplicateVersion(driver.version().to_string()));
            }
        }
        let feedback = CoverageFeedback::new(
            drivers
                .iter()
                .map(|d| (d.version().to_string(), d.capacity())),
        );
        Ok(Self {
            drivers,
            comparator,
            corpus: InMemoryCorpus::new(),
            findings: InMemoryCorpus::new(),
            scheduler: Box::new(NoveltyWeightedScheduler::default()),
            mutator: Box::new(StatementMutator::default()),
            feedback,
            reporter,
            rng: ChaCha8Rng::seed_from_u64(options.rng_seed),
            pending_seeds: VecDeque::new(),
            options,
            stats: FuzzStats::default(),
            started: Instant::now(),
        })
    }

    pub fn with_mutator(mut self, mutator: Box<dyn Mutator<I, ChaCha8Rng>>) -> Self {
        self.mutator = mutator;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Box<dyn Scheduler<I>>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Queues inputs to run verbatim before any mutation, e.g. user seeds or
    /// the inputs of a persisted corpus. Each is kept only if it reveals new
    /// coverage, which also rebuilds the coverage unions after a restart.
    pub fn with_seeds(mut self, seeds: impl IntoIterator<Item = I>) -> Self {
        self.pending_seeds.extend(seeds);
        self
    }

    pub fn corpus(&self) -> &InMemoryCorpus<I> {
        &self.corpus
    }

    /// Every input whose verdict was escalated, for reproduction.
    pub fn findings(&self) -> &InMemoryCorpus<I> {
        &self.findings
    }

    /// Corpus entries in a form an external store can persist.
    pub fn export_corpus(&self) -> Vec<CorpusEntry<I>> {
        self.corpus.entries().cloned().collect()
    }

    pub fn pending_seeds(&self) -> usize {
        self.pending_seeds.len()
    }

    pub fn stats(&self) -> FuzzStats {
        FuzzStats {
            corpus_size: self.corpus.len(),
            findings: self.findings.len(),
            elapsed: self.started.elapsed(),
            ..self.stats.clone()
        }
    }

    /// Iterates until `stop` is set or `max_iterations` more iterations have
    /// run. Statistics go to the reporter every `stats_interval` and once at
    /// the end.
    pub fn run(&mut self, stop: &AtomicBool, max_iterations: Option<u64>) -> FuzzStats {
        let mut last_stats = Instant::now();
        let mut done = 0u64;
        info!(
            versions = ?self.drivers.iter().map(|d| d.version()).collect::<Vec<_>>(),
            seeds = self.pending_seeds.len(),
            parallel = self.options.parallel,
            "fuzzing started"
        );
        while !stop.load(Ordering::Relaxed) && max_iterations.is_none_or(|max| done < max) {
            self.step();
            done += 1;
            if last_stats.elapsed() >= self.options.stats_interval {
                self.publish_stats();
                last_stats = Instant::now();
            }
        }
        self.publish_stats();
        self.stats()
    }

    /// Runs one full iteration.
    pub fn step(&mut self) -> StepOutcome {
        let mut state = State::Select;
        loop {
            state = match state {
                State::Select => State::Execute(self.select()),
                State::Execute(candidate) => {
                    let records = self.execute(&candidate.input);
                    State::Evaluate(candidate, records)
                }
                State::Evaluate(candidate, records) => {
                    let (novelty, report) = self.evaluate(&candidate, &records);
                    State::RetainOrDiscard(candidate, novelty, report)
                }
                State::RetainOrDiscard(candidate, novelty, report) => {
                    return self.retain_or_discard(candidate, novelty, report);
                }
            };
        }
    }

    fn select(&mut self) -> Candidate<I> {
        if let Some(input) = self.pending_seeds.pop_front() {
            return Candidate {
                input,
                source: EntrySource::Seed,
            };
        }

        let p = self.options.synthesize_probability.clamp(0.0, 1.0);
        if self.corpus.is_empty() || self.rng.random_bool(p) {
            return self.synthesize();
        }

        let parent = match self
            .scheduler
            .next(&self.corpus, &mut self.rng, self.stats.iterations)
        {
            Ok(id) => id,
            Err(e) => {
                debug!(error = %e, "scheduler had nothing to offer, synthesizing");
                return self.synthesize();
            }
        };
        let Some(entry) = self.corpus.get_mut(parent) else {
            return self.synthesize();
        };
        entry.metadata.selections += 1;
        let base = entry.input.clone();

        match self
            .mutator
            .mutate(Some(&base), &mut self.rng, Some(&self.corpus as &dyn Corpus<I>))
        {
            Ok(input) => Candidate {
                input,
                source: EntrySource::Mutated { parent },
            },
            Err(e) => {
                warn!(parent, error = %e, "mutation failed, re-running parent");
                Candidate {
                    input: base,
                    source: EntrySource::Mutated { parent },
                }
            }
        }
    }

    fn synthesize(&mut self) -> Candidate<I> {
        let input = match self
            .mutator
            .mutate(None, &mut self.rng, Some(&self.corpus as &dyn Corpus<I>))
        {
            Ok(input) => input,
            Err(e) => {
                warn!(error = %e, "synthesis failed, running an empty input");
                I::from(Vec::new())
            }
        };
        Candidate {
            input,
            source: EntrySource::Synthesized,
        }
    }

    fn execute(&mut self, input: &I) -> Vec<ExecutionRecord<I>> {
        if !self.options.parallel {
            return self.drivers.iter_mut().map(|d| d.run(input)).collect();
        }
        std::thread::scope(|s| {
            let handles: Vec<_> = self
                .drivers
                .iter_mut()
                .map(|driver| {
                    let version = driver.version().to_string();
                    let capacity = driver.capacity();
                    (version, capacity, s.spawn(move || driver.run(input)))
                })
                .collect();
            handles
                .into_iter()
                .map(|(version, capacity, handle)| match handle.join() {
                    Ok(record) => record,
                    Err(_) => {
                        warn!(%version, "driver thread panicked");
                        ExecutionRecord {
                            input: input.clone(),
                            version,
                            coverage: CoverageSnapshot::from_counts(vec![0; capacity]),
                            outcome: Outcome::Fault(Fault::new(
                                FaultKind::Crash,
                                "driver thread panicked",
                            )),
                            duration: Duration::ZERO,
                        }
                    }
                })
                .collect()
        })
    }

    fn evaluate(
        &mut self,
        candidate: &Candidate<I>,
        records: &[ExecutionRecord<I>],
    ) -> (Novelty, DivergenceReport<I>) {
        self.stats.executions += records.len() as u64;

        let novelty = self.feedback.evaluate(records).unwrap_or_else(|e| {
            warn!(error = %e, "coverage feedback failed");
            Novelty::default()
        });

        let report = self.comparator.compare(&candidate.input, records);
        match &report.verdict {
            Verdict::Agree => self.stats.agreements += 1,
            Verdict::Diverge { .. } => self.stats.divergences += 1,
            Verdict::Fault { .. } => self.stats.faults += 1,
            Verdict::SharedFault { .. } => self.stats.shared_faults += 1,
            Verdict::Unresolved { .. } => self.stats.unresolved += 1,
        }
        if report.verdict.is_finding() {
            if let Err(e) = self.reporter.report_divergence(&report) {
                warn!(input_hash = %report.input_hash, error = %e, "reporter rejected finding");
            }
        }
        (novelty, report)
    }

    fn retain_or_discard(
        &mut self,
        candidate: Candidate<I>,
        novelty: Novelty,
        report: DivergenceReport<I>,
    ) -> StepOutcome {
        let iteration = self.stats.iterations;
        self.stats.iterations += 1;
        let is_finding = report.verdict.is_finding();
        let novel_edges = novelty.novel_edges();

        if let EntrySource::Mutated { parent } = candidate.source {
            self.scheduler.report_feedback(parent, novel_edges, is_finding);
        }

        let metadata = EntryMetadata {
            source: candidate.source.clone(),
            found_at: iteration,
            novel_edges,
            novel_versions: novelty.novel_versions(),
            covered_edges: novelty.covered_edges,
            signature: novelty.signature.clone().unwrap_or_default(),
            selections: 0,
        };

        let finding = if is_finding {
            match self.findings.add(candidate.input.clone(), metadata.clone()) {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(error = %e, "could not keep finding");
                    None
                }
            }
        } else {
            None
        };

        let retained = if novelty.is_novel() {
            match self.corpus.add(candidate.input, metadata) {
                Ok(id) => {
                    debug!(
                        id,
                        novel_edges,
                        versions = ?novelty.novel_versions(),
                        "retained input with new coverage"
                    );
                    Some(id)
                }
                Err(e) => {
                    warn!(error = %e, "could not retain input");
                    None
                }
            }
        } else {
            None
        };

        StepOutcome {
            source: candidate.source,
            verdict: report.verdict,
            novel_edges,
            retained,
            finding,
        }
    }

    fn publish_stats(&mut self) {
        let stats = self.stats();
        if let Err(e) = self.reporter.report_stats(&stats) {
            warn!(error = %e, "reporter rejected stats");
        }
    }
}
