pub mod comparator;
pub mod config;
pub mod corpus;
pub mod coverage;
pub mod equivalence;
pub mod executor;
pub mod feedback;
pub mod fuzzer;
pub mod guard;
pub mod input;
pub mod mutator;
pub mod report;
pub mod scheduler;
pub mod shell;
pub mod sink;
pub mod target;

pub use comparator::{DifferentialComparator, DivergenceReport, Verdict};
pub use config::{ConfigError, DivergentConfig};
pub use corpus::{Corpus, CorpusEntry, CorpusError, EntryMetadata, EntrySource, InMemoryCorpus};
pub use coverage::{CoverageError, CoverageMap, CoverageSnapshot, CoverageUnion};
pub use equivalence::{Equivalence, ExactEquivalence, NormalizedEquivalence};
pub use executor::{ExecutionDriver, ExecutionRecord};
pub use feedback::{CoverageFeedback, FeedbackError, Novelty};
pub use fuzzer::{Fuzzer, FuzzerError, FuzzerOptions, StepOutcome};
pub use guard::{GuardError, GuardRegistry};
pub use input::Input;
pub use mutator::{FlipSingleByteMutator, Mutator, StatementMutator};
pub use report::{FuzzStats, JsonLinesReporter, LogReporter, MultiReporter, Reporter};
pub use scheduler::{NoveltyWeightedScheduler, Scheduler, SchedulerError};
pub use shell::{ShellSettings, ShellTarget};
pub use sink::CoverageSink;
pub use target::{ExecOutput, Fault, FaultKind, InProcessTarget, Outcome, Target};
