use crate::input::Input;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Defines errors that can arise during corpus operations.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// The requested entry ID was not found within the corpus.
    #[error("Entry ID {0} not found in corpus")]
    EntryNotFound(usize),

    /// An operation could not be performed because the corpus is empty.
    #[error("Corpus is empty, cannot select an entry")]
    CorpusIsEmpty,

    /// Reading seed files failed.
    #[error("Corpus I/O error: {0}")]
    Io(String),
}

/// How an entry came to be in the corpus.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum EntrySource {
    /// Supplied by the user before the run started.
    Seed,
    /// Derived from another corpus entry.
    Mutated { parent: usize },
    /// Generated from scratch.
    Synthesized,
}

/// What an entry revealed when it was retained.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct EntryMetadata {
    pub source: EntrySource,
    /// Iteration in which the entry was found.
    pub found_at: u64,
    /// Slots hit for the first time, summed over every version.
    pub novel_edges: usize,
    /// Versions in which the entry revealed new coverage.
    pub novel_versions: Vec<String>,
    /// Largest covered-edge count across versions.
    pub covered_edges: usize,
    /// Hex coverage signature of the first version that found something new.
    pub signature: String,
    /// Times the scheduler picked this entry.
    #[serde(default)]
    pub selections: u64,
}

impl EntryMetadata {
    pub fn seed(found_at: u64) -> Self {
        Self {
            source: EntrySource::Seed,
            found_at,
            novel_edges: 0,
            novel_versions: Vec::new(),
            covered_edges: 0,
            signature: String::new(),
            selections: 0,
        }
    }
}

/// A retained input together with its metadata. Handed as-is to whatever
/// persists the corpus.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CorpusEntry<I> {
    pub id: usize,
    pub input: I,
    pub metadata: EntryMetadata,
}

/// Defines the common interface for a collection of fuzzing inputs.
///
/// Entries are never removed, so an ID stays valid for the lifetime of the
/// corpus.
pub trait Corpus<I: Input>: Send + Sync {
    /// Adds a new input and returns the ID assigned to it.
    fn add(&mut self, input: I, metadata: EntryMetadata) -> Result<usize, CorpusError>;

    fn get(&self, id: usize) -> Option<&CorpusEntry<I>>;

    fn get_mut(&mut self, id: usize) -> Option<&mut CorpusEntry<I>>;

    /// Picks an entry uniformly at random.
    fn random_select(&self, rng: &mut dyn RngCore) -> Option<&CorpusEntry<I>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> Box<dyn Iterator<Item = &CorpusEntry<I>> + '_>;
}

/// Keeps every entry in a `Vec`, indexed by ID.
#[derive(Debug)]
pub struct InMemoryCorpus<I: Input> {
    entries: Vec<CorpusEntry<I>>,
}

impl<I: Input> InMemoryCorpus<I> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Rebuilds a corpus from persisted entries. IDs are reassigned in order.
    pub fn from_entries(entries: impl IntoIterator<Item = CorpusEntry<I>>) -> Self {
        let entries = entries
            .into_iter()
            .enumerate()
            .map(|(id, entry)| CorpusEntry { id, ..entry })
            .collect();
        Self { entries }
    }
}

impl<I: Input> Default for InMemoryCorpus<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Input> Corpus<I> for InMemoryCorpus<I> {
    fn add(&mut self, input: I, metadata: EntryMetadata) -> Result<usize, CorpusError> {
        let id = self.entries.len();
        self.entries.push(CorpusEntry {
            id,
            input,
            metadata,
        });
        Ok(id)
    }

    fn get(&self, id: usize) -> Option<&CorpusEntry<I>> {
        self.entries.get(id)
    }

    fn get_mut(&mut self, id: usize) -> Option<&mut CorpusEntry<I>> {
        self.entries.get_mut(id)
    }

    fn random_select(&self, rng: &mut dyn RngCore) -> Option<&CorpusEntry<I>> {
        if self.is_empty() {
            return None;
        }
        let index = rng.next_u64() as usize % self.entries.len();
        self.entries.get(index)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn entries(&self) -> Box<dyn Iterator<Item = &CorpusEntry<I>> + '_> {
        Box::new(self.entries.iter())
    }
}

/// Reads seed inputs from files and directories.
///
/// Files directly inside a directory are loaded in file-name order;
/// subdirectories and dotfiles are skipped.
pub fn load_seed_inputs(seed_paths: &[PathBuf]) -> Result<Vec<Vec<u8>>, CorpusError> {
    let mut seeds = Vec::new();
    for path in seed_paths {
        if path.is_file() {
            seeds.push(read_seed(path)?);
        } else if path.is_dir() {
            let mut files = Vec::new();
            for entry in fs::read_dir(path).map_err(|e| {
                CorpusError::Io(format!("Failed to read seed directory {path:?}: {e}"))
            })? {
                let entry = entry
                    .map_err(|e| CorpusError::Io(format!("Error reading entry in {path:?}: {e}")))?;
                let file_path = entry.path();
                let hidden = file_path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'));
                if file_path.is_file() && !hidden {
                    files.push(file_path);
                }
            }
            files.sort();
            for file in files {
                seeds.push(read_seed(&file)?);
            }
        } else {
            return Err(CorpusError::Io(format!("Seed path {path:?} does not exist")));
        }
    }
    Ok(seeds)
}

fn read_seed(path: &Path) -> Result<Vec<u8>, CorpusError> {
    fs::read(path).map_err(|e| CorpusError::Io(format!("Failed to read seed file {path:?}: {e}")))
}
