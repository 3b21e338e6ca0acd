//! Policy files
//!
//! Format (whitespace separated): replication factor, number of coding
//! levels, then `n k n_upload` for each level, outermost first.

use crate::coding::Coding;
use crate::error::VdaError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Name of the per-file record of per-level piece sizes
pub const CHUNK_SIZES_FILE: &str = "chunk_sizes.txt";

/// Full redundancy configuration for one archived file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Replicas kept of each bottom-level chunk
    pub replication: usize,
    /// Coding levels, outermost first
    pub codings: Vec<Coding>,
    /// Byte size of one piece at each level (empty until sized)
    #[serde(default)]
    pub chunk_sizes: Vec<f64>,
    /// Human-readable summary
    pub description: String,
}

impl Policy {
    /// Build a policy from already-validated parts
    pub fn new(replication: usize, codings: Vec<Coding>) -> Result<Self> {
        if replication == 0 {
            return Err(VdaError::Parse("replication must be >= 1".into()));
        }
        if codings.is_empty() {
            return Err(VdaError::Parse("policy needs at least one coding level".into()));
        }
        let description = describe(replication, &codings);
        Ok(Self {
            replication,
            codings,
            chunk_sizes: Vec::new(),
            description,
        })
    }

    /// Parse the textual policy format
    pub fn parse(text: &str) -> Result<Self> {
        let mut tokens = text.split_whitespace();
        let replication = next_number(&mut tokens, "replication")?;
        let levels = next_number(&mut tokens, "coding level count")?;
        if levels == 0 {
            return Err(VdaError::Parse("policy needs at least one coding level".into()));
        }

        let mut codings = Vec::with_capacity(levels);
        for level in 0..levels {
            let n = next_number(&mut tokens, &format!("level {} n", level))?;
            let k = next_number(&mut tokens, &format!("level {} k", level))?;
            let n_upload = next_number(&mut tokens, &format!("level {} n_upload", level))?;
            codings.push(Coding::new(n, k, n_upload)?);
        }

        Self::new(replication, codings)
    }

    /// Read and parse a policy file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Render back into the textual format
    pub fn to_text(&self) -> String {
        let mut out = format!("{}\n{}\n", self.replication, self.codings.len());
        for c in &self.codings {
            out.push_str(&format!("{} {} {}\n", c.n, c.k, c.n_upload));
        }
        out
    }

    /// Number of coding levels
    pub fn levels(&self) -> usize {
        self.codings.len()
    }

    /// Derive per-level piece sizes from the size of the whole file
    pub fn compute_chunk_sizes(&mut self, file_size: f64) {
        let mut size = file_size;
        self.chunk_sizes = self
            .codings
            .iter()
            .map(|c| {
                size = c.piece_size(size);
                size
            })
            .collect();
    }

    /// Size of a bottom-level chunk, if sizes are known
    pub fn chunk_size(&self) -> Option<f64> {
        self.chunk_sizes.last().copied()
    }

    /// Persist chunk sizes, one per line
    pub fn write_chunk_sizes(&self, dir: &Path) -> Result<()> {
        let text: String = self
            .chunk_sizes
            .iter()
            .map(|s| format!("{}\n", s))
            .collect();
        fs::write(dir.join(CHUNK_SIZES_FILE), text)?;
        Ok(())
    }

    /// Load chunk sizes written by `write_chunk_sizes`
    pub fn read_chunk_sizes(&mut self, dir: &Path) -> Result<()> {
        let text = fs::read_to_string(dir.join(CHUNK_SIZES_FILE))?;
        let sizes = text
            .split_whitespace()
            .map(|t| {
                t.parse::<f64>()
                    .map_err(|_| VdaError::Parse(format!("bad chunk size '{}'", t)))
            })
            .collect::<Result<Vec<f64>>>()?;
        if sizes.len() != self.levels() {
            return Err(VdaError::Parse(format!(
                "{} chunk sizes for {} levels",
                sizes.len(),
                self.levels()
            )));
        }
        self.chunk_sizes = sizes;
        Ok(())
    }
}

impl Default for Policy {
    /// Two replicas of a single (10 6 12) level
    fn default() -> Self {
        let codings = vec![Coding {
            n: 10,
            k: 6,
            m: 16,
            n_upload: 12,
        }];
        Self {
            replication: 2,
            description: describe(2, &codings),
            codings,
            chunk_sizes: Vec::new(),
        }
    }
}

fn describe(replication: usize, codings: &[Coding]) -> String {
    let mut desc = String::new();
    for c in codings {
        desc.push_str(&format!("{} ", c));
    }
    desc.push_str(&format!("X{}", replication));
    desc
}

fn next_number<'a>(tokens: &mut impl Iterator<Item = &'a str>, what: &str) -> Result<usize> {
    let token = tokens
        .next()
        .ok_or_else(|| VdaError::Parse(format!("missing {}", what)))?;
    token
        .parse()
        .map_err(|_| VdaError::Parse(format!("{} is not a number: '{}'", what, token)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_level() {
        let policy = Policy::parse("2\n1\n10 6 12\n").unwrap();
        assert_eq!(policy.replication, 2);
        assert_eq!(policy.levels(), 1);
        assert_eq!(policy.codings[0].m, 16);
        assert!(policy.description.contains("(10 6 12)"));
        assert!(policy.description.contains("X2"));
    }

    #[test]
    fn test_parse_two_levels() {
        let policy = Policy::parse("3 2  4 2 5   8 4 8").unwrap();
        assert_eq!(policy.codings.len(), 2);
        assert_eq!(policy.codings[1], Coding::new(8, 4, 8).unwrap());
        assert_eq!(policy.description, "(4 2 5) (8 4 8) X3");
    }

    #[test]
    fn test_default_policy() {
        assert_eq!(Policy::default(), Policy::parse("2 1 10 6 12").unwrap());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Policy::parse("two 1 10 6 12"), Err(VdaError::Parse(_))));
        assert!(matches!(Policy::parse("2 x 10 6 12"), Err(VdaError::Parse(_))));
        assert!(matches!(Policy::parse("2 1 10 6"), Err(VdaError::Parse(_))));
        assert!(matches!(Policy::parse("2 0"), Err(VdaError::Parse(_))));
        assert!(matches!(Policy::parse("0 1 10 6 12"), Err(VdaError::Parse(_))));
    }

    #[test]
    fn test_text_round_trip() {
        let policy = Policy::parse("2 2 4 2 4 3 1 3").unwrap();
        assert_eq!(Policy::parse(&policy.to_text()).unwrap(), policy);
    }

    #[test]
    fn test_chunk_sizes() {
        let mut policy = Policy::parse("2 2 4 2 4 2 1 2").unwrap();
        policy.compute_chunk_sizes(8000.0);
        assert_eq!(policy.chunk_sizes, vec![2000.0, 1000.0]);
        assert_eq!(policy.chunk_size(), Some(1000.0));

        let dir = tempfile::tempdir().unwrap();
        policy.write_chunk_sizes(dir.path()).unwrap();

        let mut reloaded = Policy::parse("2 2 4 2 4 2 1 2").unwrap();
        reloaded.read_chunk_sizes(dir.path()).unwrap();
        assert_eq!(reloaded.chunk_sizes, policy.chunk_sizes);
    }
}
