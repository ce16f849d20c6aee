use crate::coverage::{DEFAULT_MAP_CAPACITY, MAX_MAP_CAPACITY, MIN_MAP_CAPACITY};
use crate::equivalence::NormalizedEquivalence;
use crate::shell::ShellSettings;
use anyhow::Context;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration mistakes that make a run meaningless. Reported before any
/// input executes.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    /// Differential testing needs something to compare against.
    #[error("at least two targets are required, found {0}")]
    TooFewTargets(usize),

    #[error("target version '{0}' is configured more than once")]
    DuplicateVersion(String),

    #[error("target '{0}' has an empty command")]
    EmptyCommand(String),

    #[error("target '{0}' has a zero timeout")]
    ZeroTimeout(String),

    #[error(
        "map capacity {0} is outside {min}..={max}",
        min = MIN_MAP_CAPACITY,
        max = MAX_MAP_CAPACITY
    )]
    InvalidMapCapacity(usize),

    #[error("synthesize probability {0} is outside 0.0..=1.0")]
    InvalidProbability(f64),
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_iterations")]
    pub max_iterations: u64,
    /// Run the versions of one input on parallel threads.
    #[serde(default = "default_parallel")]
    pub parallel: bool,
    /// Chance of synthesizing a fresh input instead of mutating a corpus
    /// entry.
    #[serde(default = "default_synthesize_probability")]
    pub synthesize_probability: f64,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
    #[serde(default)]
    pub rng_seed: u64,
    #[serde(default = "default_max_statements")]
    pub max_statements: usize,
}

pub fn default_iterations() -> u64 {
    1_000_000
}
fn default_parallel() -> bool {
    true
}
fn default_synthesize_probability() -> f64 {
    0.05
}
fn default_stats_interval_secs() -> u64 {
    10
}
fn default_max_statements() -> usize {
    crate::mutator::DEFAULT_MAX_STATEMENTS
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_iterations(),
            parallel: default_parallel(),
            synthesize_probability: default_synthesize_probability(),
            stats_interval_secs: default_stats_interval_secs(),
            rng_seed: 0,
            max_statements: default_max_statements(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CoverageSettings {
    #[serde(default = "default_map_capacity")]
    pub map_capacity: usize,
}

fn default_map_capacity() -> usize {
    DEFAULT_MAP_CAPACITY
}

impl Default for CoverageSettings {
    fn default() -> Self {
        Self {
            map_capacity: default_map_capacity(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ComparisonSettings {
    #[serde(default = "default_true")]
    pub unordered_rows: bool,
    #[serde(default = "default_true")]
    pub normalize_whitespace: bool,
    #[serde(default)]
    pub match_errors_by_presence: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ComparisonSettings {
    fn default() -> Self {
        Self {
            unordered_rows: true,
            normalize_whitespace: true,
            match_errors_by_presence: false,
        }
    }
}

impl ComparisonSettings {
    pub fn equivalence(&self) -> NormalizedEquivalence {
        NormalizedEquivalence {
            unordered_rows: self.unordered_rows,
            normalize_whitespace: self.normalize_whitespace,
            match_errors_by_presence: self.match_errors_by_presence,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusConfig {
    #[serde(default)]
    pub initial_seed_paths: Vec<PathBuf>,
}

/// One versioned engine shell.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub version: String,
    pub command: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub working_dir: Option<PathBuf>,
    /// Database file recreated before each input; in-memory when unset.
    pub database: Option<String>,
    #[serde(default)]
    pub coverage_file: bool,
}

fn default_timeout_ms() -> u64 {
    2000
}

impl TargetConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn shell_settings(&self) -> ShellSettings {
        let mut settings = ShellSettings::sqlite(self.version.clone(), self.command.clone());
        settings.working_dir = self.working_dir.clone();
        settings.coverage_file = self.coverage_file;
        if let Some(database) = &self.database {
            settings.database = database.clone();
        }
        settings
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DivergentConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub coverage: CoverageSettings,
    #[serde(default)]
    pub comparison: ComparisonSettings,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

impl DivergentConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {path:?}"))?;
        let config: DivergentConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML from config file {path:?}"))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.len() < 2 {
            return Err(ConfigError::TooFewTargets(self.targets.len()));
        }
        let mut versions = HashSet::new();
        for target in &self.targets {
            if !versions.insert(target.version.as_str()) {
                return Err(ConfigError::DuplicateVersion(target.version.clone()));
            }
            if target.command.first().is_none_or(|program| program.is_empty()) {
                return Err(ConfigError::EmptyCommand(target.version.clone()));
            }
            if target.timeout_ms == 0 {
                return Err(ConfigError::ZeroTimeout(target.version.clone()));
            }
        }
        let capacity = self.coverage.map_capacity;
        if !(MIN_MAP_CAPACITY..=MAX_MAP_CAPACITY).contains(&capacity) {
            return Err(ConfigError::InvalidMapCapacity(capacity));
        }
        let p = self.fuzzer.synthesize_probability;
        if !(0.0..=1.0).contains(&p) {
            return Err(ConfigError::InvalidProbability(p));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
[fuzzer]
max-iterations = 500
parallel = false
synthesize-probability = 0.25
rng-seed = 42

[coverage]
map-capacity = 4096

[comparison]
match-errors-by-presence = true

[corpus]
initial-seed-paths = ["seeds/"]

[[targets]]
version = "sqlite-3.26.0"
command = ["./bin/sqlite3-3.26.0"]
timeout-ms = 500
coverage-file = true

[[targets]]
version = "sqlite-3.39.4"
command = ["./bin/sqlite3-3.39.4"]
database = "work/3.39.4.db"
"#;

    fn parse(text: &str) -> DivergentConfig {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn parses_full_config() {
        let config = parse(EXAMPLE);
        assert_eq!(config.fuzzer.max_iterations, 500);
        assert!(!config.fuzzer.parallel);
        assert_eq!(config.fuzzer.rng_seed, 42);
        assert_eq!(config.fuzzer.stats_interval_secs, 10);
        assert_eq!(config.coverage.map_capacity, 4096);
        assert!(config.comparison.unordered_rows);
        assert!(config.comparison.equivalence().match_errors_by_presence);
        assert_eq!(config.corpus.initial_seed_paths, vec![PathBuf::from("seeds/")]);
        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.targets[0].timeout(), Duration::from_millis(500));
        assert_eq!(config.targets[1].timeout_ms, 2000);
        assert!(!config.targets[1].coverage_file);
        assert_eq!(config.validate(), Ok(()));

        let shell = config.targets[0].shell_settings();
        assert_eq!(shell.version, "sqlite-3.26.0");
        assert!(shell.coverage_file);
        assert_eq!(shell.database, ":memory:");
        assert_eq!(config.targets[1].shell_settings().database, "work/3.39.4.db");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<DivergentConfig, _> = toml::from_str("[fuzzer]\nthreads = 4\n");
        assert!(result.is_err());
    }

    #[test]
    fn validation_catches_misconfiguration() {
        let mut config = parse(EXAMPLE);
        config.targets.pop();
        assert_eq!(config.validate(), Err(ConfigError::TooFewTargets(1)));

        let mut config = parse(EXAMPLE);
        config.targets[1].version = "sqlite-3.26.0".into();
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateVersion("sqlite-3.26.0".into()))
        );

        let mut config = parse(EXAMPLE);
        config.targets[1].command.clear();
        assert_eq!(
            config.validate(),
            Err(ConfigError::EmptyCommand("sqlite-3.39.4".into()))
        );

        let mut config = parse(EXAMPLE);
        config.coverage.map_capacity = 8;
        let err = config.validate().unwrap_err();
        assert_eq!(err, ConfigError::InvalidMapCapacity(8));
        assert_eq!(
            err.to_string(),
            format!("map capacity 8 is outside {MIN_MAP_CAPACITY}..={MAX_MAP_CAPACITY}")
        );

        let mut config = parse(EXAMPLE);
        config.fuzzer.synthesize_probability = 1.5;
        assert_eq!(config.validate(), Err(ConfigError::InvalidProbability(1.5)));
    }

    #[test]
    fn load_from_file_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("divergent.toml");
        std::fs::write(&path, EXAMPLE).unwrap();
        assert_eq!(DivergentConfig::load_from_file(&path).unwrap(), parse(EXAMPLE));

        let missing = dir.path().join("missing.toml");
        let err = DivergentConfig::load_from_file(&missing).unwrap_err();
        assert!(format!("{err:#}").contains("missing.toml"));
    }
}
