use divergent_core::comparator::DifferentialComparator;
use divergent_core::config::DivergentConfig;
use divergent_core::corpus::load_seed_inputs;
use divergent_core::executor::ExecutionDriver;
use divergent_core::fuzzer::{Fuzzer, FuzzerOptions};
use divergent_core::input::Input;
use divergent_core::mutator::StatementMutator;
use divergent_core::report::{JsonLinesReporter, LogReporter, MultiReporter, Reporter};
use divergent_core::shell::ShellTarget;

use anyhow::Context;
use clap::Parser;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "DIVERGENT_LOG";

/// Coverage-guided differential fuzzing of SQL engine versions.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser, default_value = "divergent.toml")]
    config_file: PathBuf,
    /// Overrides `fuzzer.max-iterations`.
    #[clap(short, long)]
    iterations: Option<u64>,
    /// Stop after this many seconds of wall-clock time.
    #[clap(long)]
    duration_secs: Option<u64>,
    /// Overrides `fuzzer.rng-seed`.
    #[clap(long)]
    seed: Option<u64>,
    /// Extra seed files or directories, loaded after the configured ones.
    #[clap(long = "seed-dir", value_parser)]
    seed_dirs: Vec<PathBuf>,
    /// Where `findings.jsonl` and the retained corpus are written.
    #[clap(short, long, value_parser, default_value = "divergent-out")]
    out_dir: PathBuf,
    /// Run the versions of an input one after another.
    #[clap(long)]
    sequential: bool,
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    run(Cli::parse())
}

fn run(cli: Cli) -> Result<(), anyhow::Error> {
    let mut config = DivergentConfig::load_from_file(&cli.config_file)?;
    if let Some(iterations) = cli.iterations {
        config.fuzzer.max_iterations = iterations;
    }
    if let Some(seed) = cli.seed {
        config.fuzzer.rng_seed = seed;
    }
    if cli.sequential {
        config.fuzzer.parallel = false;
    }
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {:?}", cli.config_file))?;

    if config.fuzzer.rng_seed == 0 {
        config.fuzzer.rng_seed = rand::random::<u64>().max(1);
    }
    info!(
        config = ?cli.config_file,
        rng_seed = config.fuzzer.rng_seed,
        max_iterations = config.fuzzer.max_iterations,
        "configuration loaded"
    );

    let mut drivers = Vec::with_capacity(config.targets.len());
    for target in &config.targets {
        let mut driver = ExecutionDriver::new(
            Box::new(ShellTarget::new(target.shell_settings())),
            config.coverage.map_capacity,
            target.timeout(),
        )
        .with_context(|| format!("Failed to set up target '{}'", target.version))?;
        driver.warm_up()?;
        info!(version = %target.version, command = ?target.command, "target ready");
        drivers.push(driver);
    }

    let mut seed_paths = config.corpus.initial_seed_paths.clone();
    seed_paths.extend(cli.seed_dirs.iter().cloned());
    let seeds = load_seed_inputs(&seed_paths)?;
    info!(seeds = seeds.len(), "seed inputs loaded");

    fs::create_dir_all(&cli.out_dir)
        .with_context(|| format!("Failed to create output directory {:?}", cli.out_dir))?;
    let findings_path = cli.out_dir.join("findings.jsonl");
    let findings_file = File::options()
        .create(true)
        .append(true)
        .open(&findings_path)
        .with_context(|| format!("Failed to open {findings_path:?}"))?;
    let reporter: MultiReporter<Vec<u8>> = MultiReporter::new(vec![
        Box::new(LogReporter) as Box<dyn Reporter<Vec<u8>>>,
        Box::new(JsonLinesReporter::new(BufWriter::new(findings_file))),
    ]);

    let options = FuzzerOptions {
        parallel: config.fuzzer.parallel,
        synthesize_probability: config.fuzzer.synthesize_probability,
        stats_interval: Duration::from_secs(config.fuzzer.stats_interval_secs.max(1)),
        rng_seed: config.fuzzer.rng_seed,
    };
    let comparator = DifferentialComparator::new(config.comparison.equivalence());
    let mut fuzzer = Fuzzer::new(drivers, comparator, Box::new(reporter), options)?
        .with_mutator(Box::new(StatementMutator::new(config.fuzzer.max_statements)))
        .with_seeds(seeds);

    let stop = Arc::new(AtomicBool::new(false));
    let ctrl_c_stop = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("interrupt received, finishing the current iteration");
        ctrl_c_stop.store(true, Ordering::Relaxed);
    }) {
        warn!("Error setting CTRL+C handler: {e}");
    }
    if let Some(secs) = cli.duration_secs {
        let timer_stop = stop.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(secs));
            timer_stop.store(true, Ordering::Relaxed);
        });
    }

    let stats = fuzzer.run(&stop, Some(config.fuzzer.max_iterations));

    let corpus_dir = cli.out_dir.join("corpus");
    let written = write_corpus(&corpus_dir, fuzzer.export_corpus().iter().map(|e| &e.input))?;
    info!(
        iterations = stats.iterations,
        executions = stats.executions,
        findings = stats.findings,
        retained = written,
        corpus_dir = ?corpus_dir,
        findings_file = ?findings_path,
        "fuzzing finished"
    );
    Ok(())
}

/// Writes each retained input as `<digest>.sql`, so the directory can be fed
/// back through `--seed-dir` on the next run.
fn write_corpus<'a>(
    dir: &Path,
    inputs: impl Iterator<Item = &'a Vec<u8>>,
) -> Result<usize, anyhow::Error> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create corpus directory {dir:?}"))?;
    let mut written = 0;
    for input in inputs {
        let path = dir.join(format!("{}.sql", input.digest_hex()));
        fs::write(&path, input.as_bytes())
            .with_context(|| format!("Failed to write corpus entry {path:?}"))?;
        written += 1;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_and_overrides() {
        let cli = Cli::parse_from(["divergent"]);
        assert_eq!(cli.config_file, PathBuf::from("divergent.toml"));
        assert_eq!(cli.out_dir, PathBuf::from("divergent-out"));
        assert!(cli.seed_dirs.is_empty());
        assert!(!cli.sequential);

        let cli = Cli::parse_from([
            "divergent",
            "-c",
            "fuzz.toml",
            "--iterations",
            "50",
            "--seed-dir",
            "a",
            "--seed-dir",
            "b",
            "--duration-secs",
            "30",
        ]);
        assert_eq!(cli.config_file, PathBuf::from("fuzz.toml"));
        assert_eq!(cli.iterations, Some(50));
        assert_eq!(cli.duration_secs, Some(30));
        assert_eq!(cli.seed_dirs, vec![PathBuf::from("a"), PathBuf::from("b")]);
    }

    #[test]
    fn written_corpus_loads_back_as_seeds() {
        let dir = tempfile::tempdir().unwrap();
        let corpus_dir = dir.path().join("corpus");
        let inputs = vec![b"SELECT 1;".to_vec(), b"SELECT 2;".to_vec()];
        assert_eq!(write_corpus(&corpus_dir, inputs.iter()).unwrap(), 2);

        let mut loaded = load_seed_inputs(&[corpus_dir]).unwrap();
        loaded.sort();
        assert_eq!(loaded, inputs);
    }

    #[test]
    fn run_reports_a_missing_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nowhere.toml");
        let cli = Cli::parse_from(["divergent", "-c", missing.to_str().unwrap()]);
        let err = run(cli).unwrap_err();
        assert!(format!("{err:#}").contains("nowhere.toml"), "{err:#}");
    }

    #[test]
    fn run_rejects_single_target_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("divergent.toml");
        fs::write(
            &config,
            "[[targets]]\nversion = \"only\"\ncommand = [\"sqlite3\"]\n",
        )
        .unwrap();
        let cli = Cli::parse_from([
            "divergent",
            "-c",
            config.to_str().unwrap(),
            "-o",
            dir.path().join("out").to_str().unwrap(),
        ]);
        let err = run(cli).unwrap_err();
        assert!(format!("{err:#}").contains("at least two targets"));
    }
}
