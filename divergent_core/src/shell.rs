//! Persistent engine shell target.
//!
//! Each versioned engine build ships an interactive shell (for SQLite, the
//! `sqlite3` CLI) that reads statements from stdin and prints rows on stdout
//! and errors on stderr. [`ShellTarget`] keeps one such process alive across
//! inputs but gives every input a fresh database: it reopens the database,
//! stages the input in a script file and `.read`s it, then writes a sentinel
//! query and collects output until the sentinel comes back. The input never
//! shares a parse buffer with the sentinel, so an unterminated statement or
//! quote ends as an ordinary error. The sentinel carries a random suffix per
//! input and reports `total_changes()` of the fresh connection. The process
//! is the isolated execution context; it is killed on timeout and restarted
//! lazily after any fault.
//!
//! Coverage from an instrumented shell travels through a plain file: the
//! target creates a temporary file of exactly `capacity` bytes and exports its
//! path in [`COVERAGE_FILE_ENV`]. The instrumented binary maps that file
//! shared and increments bytes in it; the target zeroes it before each input
//! and absorbs it into the driver's map afterwards.

use crate::sink::CoverageSink;
use crate::target::{ExecOutput, Fault, FaultKind, Outcome, Target};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Environment variable naming the shared coverage file for the child.
pub const COVERAGE_FILE_ENV: &str = "DIVERGENT_COVERAGE_FILE";

const DEFAULT_SENTINEL: &str = "DIVERGENT_SENTINEL_7F3A9C";
const MEMORY_DATABASE: &str = ":memory:";
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_STDERR_SETTLE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct ShellSettings {
    pub version: String,
    /// Program and arguments, e.g. `["./bin/sqlite3-3.26.0", ":memory:"]`.
    pub command: Vec<String>,
    /// Lines written once after every (re)start, before the first input.
    pub setup: Vec<String>,
    /// Column separator the setup lines configure.
    pub separator: String,
    /// Prefix of the per-input sentinel token.
    pub sentinel: String,
    /// Database reopened before every input. Anything other than
    /// `:memory:` is a file that is recreated empty each time.
    pub database: String,
    pub working_dir: Option<PathBuf>,
    /// Export a coverage file to the child.
    pub coverage_file: bool,
    /// How long to keep listening after the sentinel for stderr lines that
    /// raced it through the other pipe.
    pub stderr_settle: Duration,
}

impl ShellSettings {
    /// Settings for a `sqlite3`-compatible shell.
    pub fn sqlite(version: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            version: version.into(),
            command,
            setup: vec![
                ".echo off".to_string(),
                ".bail off".to_string(),
                ".mode list".to_string(),
                ".separator |".to_string(),
            ],
            separator: "|".to_string(),
            sentinel: DEFAULT_SENTINEL.to_string(),
            database: MEMORY_DATABASE.to_string(),
            working_dir: None,
            coverage_file: false,
            stderr_settle: DEFAULT_STDERR_SETTLE,
        }
    }

    fn token(&self) -> String {
        format!("{}_{:016x}", self.sentinel, rand::random::<u64>())
    }

    fn reset_command(&self) -> String {
        if self.database == MEMORY_DATABASE {
            format!(".open {MEMORY_DATABASE}")
        } else {
            format!(".open --new '{}'", self.database)
        }
    }

    /// Everything written to stdin for one input staged at `script`.
    fn input_commands(&self, script: &Path, token: &str) -> String {
        format!(
            "{}\n.read '{}'\n{}",
            self.reset_command(),
            script.display(),
            sentinel_query(token)
        )
    }
}

fn sentinel_query(token: &str) -> String {
    format!("SELECT '{token}:' || total_changes();\n")
}

/// The change count carried by a sentinel line, if `line` is one.
fn parse_sentinel(line: &str, token: &str) -> Option<u64> {
    line.strip_prefix(token)?
        .strip_prefix(':')?
        .trim()
        .parse()
        .ok()
}

#[derive(Debug)]
enum Line {
    Out(String),
    Err(String),
    Closed,
}

struct Session {
    child: Child,
    stdin: ChildStdin,
    lines: Receiver<Line>,
    script: tempfile::NamedTempFile,
    coverage: Option<CoverageFile>,
}

struct CoverageFile {
    file: tempfile::NamedTempFile,
    capacity: usize,
}

impl CoverageFile {
    fn create(capacity: usize) -> std::io::Result<Self> {
        let file = tempfile::NamedTempFile::new()?;
        file.as_file().set_len(capacity as u64)?;
        Ok(Self { file, capacity })
    }

    fn zero(&mut self) -> std::io::Result<()> {
        let f = self.file.as_file_mut();
        f.seek(SeekFrom::Start(0))?;
        f.write_all(&vec![0u8; self.capacity])?;
        f.flush()
    }

    fn read(&mut self) -> std::io::Result<Vec<u8>> {
        let f = self.file.as_file_mut();
        f.seek(SeekFrom::Start(0))?;
        let mut counts = vec![0u8; self.capacity];
        f.read_exact(&mut counts)?;
        Ok(counts)
    }
}

fn forward_lines<R: Read + Send + 'static>(
    reader: R,
    tx: Sender<Line>,
    wrap: fn(String) -> Line,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("shell-reader".to_string())
        .spawn(move || {
            for line in BufReader::new(reader).lines() {
                match line {
                    Ok(line) => {
                        if tx.send(wrap(line)).is_err() {
                            return;
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = tx.send(Line::Closed);
        })?;
    Ok(())
}

/// Lines collected for one input, up to the sentinel.
#[derive(Debug, Default, PartialEq, Eq)]
struct Transcript {
    stdout: Vec<String>,
    stderr: Vec<String>,
    /// `total_changes()` reported by the sentinel.
    changes: u64,
}

impl Transcript {
    fn into_outcome(self, separator: &str) -> Outcome {
        if !self.stderr.is_empty() {
            let message = self.stderr.join("\n");
            if message.to_ascii_lowercase().contains("out of memory") {
                return Outcome::Fault(Fault::new(FaultKind::ResourceExhausted, message));
            }
            return Outcome::Completed(ExecOutput::Error(message));
        }
        if self.stdout.is_empty() {
            return Outcome::Completed(ExecOutput::Changes(self.changes));
        }
        let rows = self
            .stdout
            .into_iter()
            .map(|line| line.split(separator).map(str::to_string).collect())
            .collect();
        Outcome::Completed(ExecOutput::Rows(rows))
    }
}

enum WaitError {
    Timeout,
    Exited,
}

pub struct ShellTarget {
    settings: ShellSettings,
    session: Option<Session>,
}

impl ShellTarget {
    pub fn new(settings: ShellSettings) -> Self {
        Self {
            settings,
            session: None,
        }
    }

    fn start(&self, capacity: usize) -> Result<Session, anyhow::Error> {
        let program = self
            .settings
            .command
            .first()
            .ok_or_else(|| anyhow::anyhow!("empty command for target '{}'", self.settings.version))?;
        let mut cmd = Command::new(program);
        cmd.args(&self.settings.command[1..]);
        if let Some(cwd) = &self.settings.working_dir {
            cmd.current_dir(cwd);
        }

        let coverage = if self.settings.coverage_file {
            let file = CoverageFile::create(capacity)?;
            cmd.env(COVERAGE_FILE_ENV, file.file.path());
            Some(file)
        } else {
            None
        };

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| {
            anyhow::anyhow!("Failed to spawn command '{:?}': {}", self.settings.command, e)
        })?;

        let (tx, rx) = mpsc::channel();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            let _ = child.kill();
            let _ = child.wait();
            anyhow::bail!("child pipes were not available after spawning");
        };
        forward_lines(stdout, tx.clone(), Line::Out)?;
        forward_lines(stderr, tx, Line::Err)?;

        let script = match tempfile::Builder::new()
            .prefix("divergent-input")
            .suffix(".sql")
            .tempfile()
        {
            Ok(script) => script,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow::Error::new(e).context("creating input script file"));
            }
        };

        let mut session = Session {
            child,
            stdin,
            lines: rx,
            script,
            coverage,
        };

        match self.handshake(&mut session) {
            Ok(transcript) => {
                if !transcript.stderr.is_empty() {
                    warn!(
                        version = %self.settings.version,
                        stderr = %transcript.stderr.join("\n"),
                        "shell reported errors during setup"
                    );
                }
                info!(
                    version = %self.settings.version,
                    pid = session.child.id(),
                    "shell session started"
                );
                Ok(session)
            }
            Err(e) => {
                Self::kill(&mut session);
                Err(e.context(format!(
                    "starting shell for target '{}'",
                    self.settings.version
                )))
            }
        }
    }

    fn handshake(&self, session: &mut Session) -> Result<Transcript, anyhow::Error> {
        let token = self.settings.token();
        let mut setup = self.settings.setup.join("\n");
        setup.push('\n');
        setup.push_str(&sentinel_query(&token));
        session.stdin.write_all(setup.as_bytes())?;
        session.stdin.flush()?;
        self.wait_for_sentinel(session, &token, Instant::now() + STARTUP_TIMEOUT)
            .map_err(|_| anyhow::anyhow!("no sentinel within {STARTUP_TIMEOUT:?}"))
    }

    fn wait_for_sentinel(
        &self,
        session: &Session,
        token: &str,
        deadline: Instant,
    ) -> Result<Transcript, WaitError> {
        let mut transcript = Transcript::default();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match session.lines.recv_timeout(remaining) {
                Ok(Line::Out(line)) => match parse_sentinel(&line, token) {
                    Some(changes) => {
                        transcript.changes = changes;
                        break;
                    }
                    None => transcript.stdout.push(line),
                },
                Ok(Line::Err(line)) => transcript.stderr.push(line),
                Ok(Line::Closed) | Err(RecvTimeoutError::Disconnected) => {
                    return Err(WaitError::Exited);
                }
                Err(RecvTimeoutError::Timeout) => return Err(WaitError::Timeout),
            }
        }
        while let Ok(line) = session.lines.recv_timeout(self.settings.stderr_settle) {
            match line {
                Line::Err(line) => transcript.stderr.push(line),
                Line::Out(line) => transcript.stdout.push(line),
                Line::Closed => break,
            }
        }
        Ok(transcript)
    }

    fn exit_fault(session: &mut Session) -> Fault {
        // Output closes slightly before the process is reapable.
        let mut status = None;
        for _ in 0..50 {
            match session.child.try_wait() {
                Ok(Some(exit)) => {
                    status = Some(exit);
                    break;
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(10)),
                Err(_) => break,
            }
        }
        let detail = match status {
            Some(status) => describe_exit(status),
            None => {
                Self::kill(session);
                "output closed unexpectedly".to_string()
            }
        };
        Fault::new(FaultKind::Crash, detail)
    }

    fn kill(session: &mut Session) {
        if let Err(e) = session.child.kill() {
            debug!("Failed to kill child process: {e}");
        }
        let _ = session.child.wait();
    }
}

fn describe_exit(status: std::process::ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("Exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("Terminated by signal {signal}");
        }
    }
    "Exited abnormally".to_string()
}

impl Target for ShellTarget {
    fn version(&self) -> &str {
        &self.settings.version
    }

    fn execute(&mut self, input: &[u8], coverage: &CoverageSink, deadline: Duration) -> Outcome {
        if self.session.is_none() {
            match self.start(coverage.capacity()) {
                Ok(session) => self.session = Some(session),
                Err(e) => {
                    warn!(version = %self.settings.version, error = %e, "shell start failed");
                    return Outcome::Fault(Fault::new(FaultKind::Crash, format!("{e:#}")));
                }
            }
        }
        let Some(mut session) = self.session.take() else {
            return Outcome::Fault(Fault::new(FaultKind::Crash, "no shell session"));
        };

        while let Ok(stale) = session.lines.try_recv() {
            debug!(version = %self.settings.version, ?stale, "drained stale shell output");
        }
        if let Some(file) = session.coverage.as_mut() {
            if let Err(e) = file.zero() {
                warn!(version = %self.settings.version, error = %e, "failed to reset coverage file");
            }
        }

        if let Err(e) = std::fs::write(session.script.path(), input) {
            warn!(version = %self.settings.version, error = %e, "failed to stage input");
            self.session = Some(session);
            return Outcome::Fault(Fault::new(
                FaultKind::Crash,
                format!("failed to stage input: {e}"),
            ));
        }
        let token = self.settings.token();
        let commands = self.settings.input_commands(session.script.path(), &token);

        let deadline_at = Instant::now() + deadline;
        let outcome = match session
            .stdin
            .write_all(commands.as_bytes())
            .and_then(|_| session.stdin.flush())
        {
            Err(e) => {
                debug!(version = %self.settings.version, error = %e, "write to shell failed");
                Outcome::Fault(Self::exit_fault(&mut session))
            }
            Ok(()) => match self.wait_for_sentinel(&session, &token, deadline_at) {
                Ok(transcript) => transcript.into_outcome(&self.settings.separator),
                Err(WaitError::Exited) => Outcome::Fault(Self::exit_fault(&mut session)),
                Err(WaitError::Timeout) => {
                    warn!(version = %self.settings.version, ?deadline, "Target timed out, killing...");
                    Self::kill(&mut session);
                    Outcome::Fault(Fault::new(
                        FaultKind::Timeout,
                        format!("no sentinel within {deadline:?}"),
                    ))
                }
            },
        };

        if let Some(file) = session.coverage.as_mut() {
            match file.read() {
                Ok(counts) => {
                    if let Err(e) = coverage.absorb(&counts) {
                        warn!(version = %self.settings.version, error = %e, "coverage file rejected");
                    }
                }
                Err(e) => warn!(version = %self.settings.version, error = %e, "failed to read coverage file"),
            }
        }

        match outcome.fault() {
            None => self.session = Some(session),
            Some(_) => Self::kill(&mut session),
        }
        outcome
    }

    fn recycle(&mut self) -> Result<(), anyhow::Error> {
        if let Some(mut session) = self.session.take() {
            debug!(version = %self.settings.version, "recycling shell session");
            let _ = session.stdin.write_all(b".quit\n");
            Self::kill(&mut session);
        }
        Ok(())
    }
}

impl Drop for ShellTarget {
    fn drop(&mut self) {
        let _ = self.recycle();
    }
}
