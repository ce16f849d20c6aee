use crate::corpus::Corpus;
use crate::input::{Input, join_statements, split_statements};
use rand::Rng;
use rand::seq::IndexedRandom;

/// Default cap on the number of statements a mutated or synthesized input
/// may hold.
pub const DEFAULT_MAX_STATEMENTS: usize = 24;

/// Statements that are valid against a fresh, empty database. Inputs
/// synthesized from scratch always start with the schema.
const SCHEMA: &[&str] = &[
    "CREATE TABLE t0(a INTEGER PRIMARY KEY, b TEXT, c REAL)",
    "CREATE TABLE t1(x INTEGER, y TEXT UNIQUE, z BLOB)",
];

const STATEMENT_POOL: &[&str] = &[
    "INSERT INTO t0(b, c) VALUES ('a', 1.5)",
    "INSERT INTO t0(b, c) VALUES (NULL, -0.0)",
    "INSERT INTO t0 VALUES (9223372036854775807, 'max', 1e308)",
    "INSERT OR IGNORE INTO t1 VALUES (1, 'k', x'00ff')",
    "INSERT OR REPLACE INTO t1 VALUES (2, 'k', zeroblob(4))",
    "UPDATE t0 SET c = c * 2 WHERE a > 1",
    "UPDATE t1 SET y = upper(y) WHERE x IS NOT NULL",
    "DELETE FROM t0 WHERE b IS NULL",
    "DELETE FROM t1 WHERE x % 2 = 0",
    "SELECT * FROM t0",
    "SELECT count(*), sum(c), avg(a) FROM t0",
    "SELECT b, typeof(c) FROM t0 ORDER BY a DESC LIMIT 3",
    "SELECT t0.a, t1.y FROM t0 LEFT JOIN t1 ON t0.a = t1.x",
    "SELECT a, row_number() OVER (ORDER BY c) FROM t0",
    "SELECT DISTINCT length(b) FROM t0 WHERE b LIKE '%a%'",
    "SELECT group_concat(y, ',') FROM t1 GROUP BY x HAVING count(*) > 0",
    "WITH RECURSIVE c(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM c WHERE n < 10) SELECT sum(n) FROM c",
    "SELECT CAST('12abc' AS INTEGER), 7 / 2, 7 % -3, -9223372036854775808 / -1",
    "SELECT datetime('2000-01-01', '+1 month', 'start of year')",
    "SELECT printf('%.3f', 1.0 / 3), round(2.5), abs(-0.0)",
    "SELECT * FROM t0 WHERE a IN (SELECT x FROM t1)",
    "SELECT EXISTS (SELECT 1 FROM t1 WHERE z IS NULL)",
    "EXPLAIN QUERY PLAN SELECT * FROM t0 WHERE a = 1",
    "CREATE INDEX IF NOT EXISTS i0 ON t0(b, c)",
    "CREATE VIEW IF NOT EXISTS v0 AS SELECT a, b FROM t0 WHERE c > 0",
    "SELECT * FROM v0",
    "ANALYZE",
    "VACUUM",
];

const INTERESTING_INTEGERS: &[&str] = &[
    "0",
    "1",
    "-1",
    "127",
    "128",
    "255",
    "2147483647",
    "-2147483648",
    "4294967296",
    "9223372036854775807",
    "-9223372036854775808",
    "9223372036854775808",
];

/// A `Mutator` is responsible for transforming an `Input` into a new, potentially modified `Input`.
///
/// # Type Parameters
/// * `I`: The type of `Input` this mutator operates on.
/// * `R`: The type of random number generator used for mutation decisions.
pub trait Mutator<I: Input, R: Rng + ?Sized>: Send {
    /// Produces a new input.
    ///
    /// * `input_opt`: `Some(input)` derives the result from `input`; `None`
    ///   synthesizes one from scratch.
    /// * `corpus_opt`: splice donors, if the mutator uses any.
    fn mutate(
        &mut self,
        input_opt: Option<&I>,
        rng: &mut R,
        corpus_opt: Option<&dyn Corpus<I>>,
    ) -> Result<I, anyhow::Error>;
}

/// A simple `Mutator` that randomly selects a single byte in the input and
/// flips a few of its bits by adding a small random value.
///
/// If the input is empty, or no input is provided, it starts with a single
/// zero byte.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlipSingleByteMutator;

impl<I, R> Mutator<I, R> for FlipSingleByteMutator
where
    I: Input + From<Vec<u8>>,
    R: Rng + ?Sized,
{
    fn mutate(
        &mut self,
        input_opt: Option<&I>,
        rng: &mut R,
        _corpus_opt: Option<&dyn Corpus<I>>,
    ) -> Result<I, anyhow::Error> {
        let mut bytes = input_opt.map(|i| i.as_bytes().to_vec()).unwrap_or_default();
        if bytes.is_empty() {
            bytes.push(0);
        }
        let delta = rng.random_range(1u8..=15u8);
        let index = rng.random_range(0..bytes.len());
        bytes[index] = bytes[index].wrapping_add(delta);
        Ok(I::from(bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatementMutation {
    Duplicate,
    Delete,
    Swap,
    Splice,
    TweakLiteral,
    InsertFromPool,
}

const MUTATIONS: &[StatementMutation] = &[
    StatementMutation::Duplicate,
    StatementMutation::Delete,
    StatementMutation::Swap,
    StatementMutation::Splice,
    StatementMutation::TweakLiteral,
    StatementMutation::InsertFromPool,
];

/// Mutates inputs one `;`-terminated statement at a time.
///
/// Each call applies between one and `max_stacked` statement-level edits:
/// duplicating, deleting or swapping statements, splicing in a statement from
/// another corpus entry, replacing a numeric literal with a boundary value, or
/// inserting a statement from the built-in pool. Byte-level noise mostly
/// yields syntax errors that every version rejects the same way; keeping
/// statements intact reaches the engines' planners and executors.
#[derive(Debug, Clone)]
pub struct StatementMutator {
    max_statements: usize,
    max_stacked: usize,
}

impl Default for StatementMutator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STATEMENTS)
    }
}

impl StatementMutator {
    pub fn new(max_statements: usize) -> Self {
        Self {
            max_statements: max_statements.max(1),
            max_stacked: 4,
        }
    }

    /// Builds a fresh input: the schema followed by random pool statements.
    pub fn synthesize<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<String> {
        let mut statements: Vec<String> = SCHEMA.iter().map(|s| s.to_string()).collect();
        let budget = self.max_statements.saturating_sub(statements.len()).max(1);
        let count = rng.random_range(1..=budget.min(8));
        for _ in 0..count {
            if let Some(stmt) = STATEMENT_POOL.choose(rng) {
                statements.push(stmt.to_string());
            }
        }
        statements.truncate(self.max_statements);
        statements
    }

    fn apply<I: Input, R: Rng>(
        &self,
        mutation: StatementMutation,
        statements: &mut Vec<String>,
        rng: &mut R,
        corpus_opt: Option<&dyn Corpus<I>>,
    ) -> bool {
        let len = statements.len();
        match mutation {
            StatementMutation::Duplicate if len > 0 && len < self.max_statements => {
                let from = rng.random_range(0..len);
                let to = rng.random_range(0..=len);
                let stmt = statements[from].clone();
                statements.insert(to, stmt);
                true
            }
            StatementMutation::Delete if len > 1 => {
                statements.remove(rng.random_range(0..len));
                true
            }
            StatementMutation::Swap if len > 1 => {
                let a = rng.random_range(0..len);
                let b = rng.random_range(0..len);
                statements.swap(a, b);
                a != b
            }
            StatementMutation::Splice if len < self.max_statements => {
                let Some(donor) = corpus_opt.and_then(|c| c.random_select(&mut *rng)) else {
                    return false;
                };
                let donor_statements = split_statements(donor.input.as_bytes());
                let Some(stmt) = donor_statements.choose(rng) else {
                    return false;
                };
                let to = rng.random_range(0..=len);
                statements.insert(to, stmt.clone());
                true
            }
            StatementMutation::TweakLiteral if len > 0 => {
                let index = rng.random_range(0..len);
                match tweak_numeric_literal(&statements[index], rng) {
                    Some(tweaked) => {
                        statements[index] = tweaked;
                        true
                    }
                    None => false,
                }
            }
            StatementMutation::InsertFromPool if len < self.max_statements => {
                let Some(stmt) = STATEMENT_POOL.choose(rng) else {
                    return false;
                };
                let to = rng.random_range(0..=len);
                statements.insert(to, stmt.to_string());
                true
            }
            _ => false,
        }
    }
}

impl<I, R> Mutator<I, R> for StatementMutator
where
    I: Input + From<Vec<u8>>,
    R: Rng,
{
    fn mutate(
        &mut self,
        input_opt: Option<&I>,
        rng: &mut R,
        corpus_opt: Option<&dyn Corpus<I>>,
    ) -> Result<I, anyhow::Error> {
        let Some(base) = input_opt else {
            return Ok(I::from(join_statements(&self.synthesize(rng))));
        };

        let mut statements = split_statements(base.as_bytes());
        let stacked = rng.random_range(1..=self.max_stacked);
        let mut applied = 0;
        // Some mutations are inapplicable to a given input; retry a bounded
        // number of times so every call changes something.
        for _ in 0..stacked * 4 {
            let Some(&mutation) = MUTATIONS.choose(rng) else {
                break;
            };
            if self.apply(mutation, &mut statements, rng, corpus_opt) {
                applied += 1;
                if applied == stacked {
                    break;
                }
            }
        }
        if applied == 0 && statements.len() < self.max_statements {
            if let Some(stmt) = STATEMENT_POOL.choose(rng) {
                statements.push(stmt.to_string());
            }
        }
        statements.truncate(self.max_statements);
        Ok(I::from(join_statements(&statements)))
    }
}

/// Replaces one integer literal in `statement` with a boundary value or a
/// neighbour of its current value. Digits inside quoted strings and
/// identifiers are left alone.
fn tweak_numeric_literal<R: Rng + ?Sized>(statement: &str, rng: &mut R) -> Option<String> {
    let bytes = statement.as_bytes();
    let mut literals = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b.is_ascii_digit() => {
                let starts_word = i > 0 && (bytes[i - 1].is_ascii_alphanumeric() || bytes[i - 1] == b'_');
                let start = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if !starts_word {
                    literals.push(start..i);
                }
                continue;
            }
            None => {}
        }
        i += 1;
    }

    let range = literals.choose(rng)?.clone();
    let current = &statement[range.clone()];
    let replacement = match rng.random_range(0..3) {
        0 => match current.parse::<i128>() {
            Ok(n) => (n + 1).to_string(),
            Err(_) => "0".to_string(),
        },
        1 => match current.parse::<i128>() {
            Ok(n) => (n - 1).to_string(),
            Err(_) => "0".to_string(),
        },
        _ => INTERESTING_INTEGERS.choose(rng)?.to_string(),
    };
    Some(format!(
        "{}{}{}",
        &statement[..range.start],
        replacement,
        &statement[range.end..]
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{EntryMetadata, InMemoryCorpus};
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    #[test]
    fn test_flip_single_byte_mutator() {
        let mut mutator = FlipSingleByteMutator;
        let mut rng = ChaCha8Rng::from_seed([1; 32]);
        let original: Vec<u8> = vec![10, 20, 30];
        let mutated: Vec<u8> = mutator.mutate(Some(&original), &mut rng, None).unwrap();
        assert_eq!(mutated.len(), original.len());
        let changed = original.iter().zip(&mutated).filter(|(a, b)| a != b).count();
        assert_eq!(changed, 1, "exactly one byte should change");

        let fresh: Vec<u8> = mutator.mutate(None, &mut rng, None).unwrap();
        assert_eq!(fresh.len(), 1);
        assert_ne!(fresh[0], 0);
    }

    #[test]
    fn synthesized_inputs_start_with_the_schema() {
        let mut mutator = StatementMutator::default();
        let mut rng = ChaCha8Rng::from_seed([2; 32]);
        for _ in 0..20 {
            let input: Vec<u8> = mutator.mutate(None, &mut rng, None).unwrap();
            let statements = split_statements(&input);
            assert_eq!(statements[0], SCHEMA[0]);
            assert_eq!(statements[1], SCHEMA[1]);
            assert!(statements.len() > SCHEMA.len());
            assert!(statements.len() <= DEFAULT_MAX_STATEMENTS);
        }
    }

    #[test]
    fn statement_mutation_changes_the_input() {
        let mut mutator = StatementMutator::default();
        let mut rng = ChaCha8Rng::from_seed([3; 32]);
        let base = b"CREATE TABLE t(a); INSERT INTO t VALUES (5); SELECT a FROM t;".to_vec();
        let mut changed = 0;
        for _ in 0..50 {
            let mutated: Vec<u8> = mutator.mutate(Some(&base), &mut rng, None).unwrap();
            if mutated != join_statements(&split_statements(&base)) {
                changed += 1;
            }
        }
        // Stacked edits occasionally cancel out.
        assert!(changed > 35, "only {changed} of 50 mutations changed the input");
    }

    #[test]
    fn statement_count_is_capped() {
        let mut mutator = StatementMutator::new(3);
        let mut rng = ChaCha8Rng::from_seed([4; 32]);
        let mut input = b"SELECT 1; SELECT 2;".to_vec();
        for _ in 0..100 {
            input = mutator.mutate(Some(&input), &mut rng, None).unwrap();
            assert!(split_statements(&input).len() <= 3);
        }
    }

    #[test]
    fn splice_draws_statements_from_the_corpus() {
        let mut corpus: InMemoryCorpus<Vec<u8>> = InMemoryCorpus::new();
        corpus
            .add(b"SELECT 'donor-only';".to_vec(), EntryMetadata::seed(0))
            .unwrap();
        let mutator = StatementMutator::default();
        let mut rng = ChaCha8Rng::from_seed([5; 32]);
        let mut statements = vec!["SELECT 1".to_string()];
        let applied = mutator.apply(
            StatementMutation::Splice,
            &mut statements,
            &mut rng,
            Some(&corpus as &dyn Corpus<Vec<u8>>),
        );
        assert!(applied);
        assert!(statements.contains(&"SELECT 'donor-only'".to_string()));
    }

    #[test]
    fn tweak_only_touches_numeric_literals() {
        let mut rng = ChaCha8Rng::from_seed([6; 32]);
        assert_eq!(tweak_numeric_literal("SELECT 'abc' FROM t1", &mut rng), None);
        for _ in 0..20 {
            let tweaked = tweak_numeric_literal("SELECT x1 FROM t1 WHERE a = 41", &mut rng).unwrap();
            assert!(tweaked.starts_with("SELECT x1 FROM t1 WHERE a = "), "got {tweaked}");
            assert_ne!(tweaked, "SELECT x1 FROM t1 WHERE a = 41");
        }
    }
}
