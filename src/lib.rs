//! Subword-aware word and text embeddings, trained by streaming corpora
//! through one or more weight-sharing trainers.
//!
//! A [`session::TrainingSession`] owns everything that is shared: the
//! dictionary, the input matrix, one output matrix per role and the math
//! tables. [`trainer::Trainer`]s borrow from it, a [`scheduler::Scheduler`]
//! keeps a group of them in lock-step, and [`pool::run`] replicates the group
//! across threads that all write to the same matrices without locking.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::ops::Index;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ordered_float::OrderedFloat;

pub mod args;
pub mod artifact;
pub mod corpus;
pub mod dictionary;
pub mod evaluate;
pub mod matrix;
pub mod model;
pub mod pool;
pub mod scheduler;
pub mod session;
pub mod strategy;
pub mod tables;
pub mod trainer;

#[allow(non_camel_case_types)]
pub type real = f32; // Precision of float numbers

/// Word vectors read back from a `.vec` file.
pub struct Vectors {
    /// Embedding vector length (number of dimensions).
    size: usize,

    /// The vocabulary.
    vocab: Vec<String>,

    /// `embeddings[k * size..(k+1) * size]` is the vector embedding for word `k`,
    /// normalized to length 1.
    embeddings: Vec<real>,
}

pub fn norm(v: &[real]) -> real {
    v.iter().copied().map(|e| e * e).sum::<real>().sqrt()
}

/// Scale `v` to unit length. Zero vectors are left alone.
pub fn normalize(v: &mut [real]) {
    let len = norm(v);
    if len > 0.0 {
        for e in v {
            *e /= len;
        }
    }
}

pub fn dot(a: &[real], b: &[real]) -> real {
    assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(&a, &b)| a * b).sum()
}

impl Index<usize> for Vectors {
    type Output = [real];

    fn index(&self, i: usize) -> &[real] {
        &self.embeddings[i * self.size..][..self.size]
    }
}

impl Vectors {
    pub fn load(file_name: &Path) -> Result<Self> {
        let mut f = BufReader::new(
            File::open(file_name)
                .with_context(|| format!("error opening vectors file {}", file_name.display()))?,
        );
        let mut line = String::new();
        f.read_line(&mut line).context("error reading vectors file")?;
        let mut fields = line.split_whitespace();
        let num_words: usize = fields
            .next()
            .ok_or_else(|| anyhow!("invalid vectors file header"))?
            .parse()
            .context("invalid vectors file header")?;
        let size: usize = fields
            .next()
            .ok_or_else(|| anyhow!("invalid vectors file header"))?
            .parse()
            .context("invalid vectors file header")?;

        let mut vocab: Vec<String> = Vec::with_capacity(num_words);
        let mut m = vec![0.0; num_words * size];
        for b in 0..num_words {
            line.clear();
            let count = f.read_line(&mut line).context("error reading vectors file")?;
            if count == 0 {
                anyhow::bail!("vectors file ends after {b} of {num_words} words");
            }
            let mut fields = line.split_whitespace();
            let word = fields
                .next()
                .ok_or_else(|| anyhow!("empty line {} in vectors file", b + 2))?;
            let row = &mut m[b * size..][..size];
            for (i, e) in row.iter_mut().enumerate() {
                *e = fields
                    .next()
                    .ok_or_else(|| anyhow!("word {word:?} has only {i} of {size} components"))?
                    .parse()
                    .with_context(|| format!("invalid component for word {word:?}"))?;
            }
            normalize(row);
            vocab.push(word.to_string());
        }

        Ok(Vectors {
            size,
            vocab,
            embeddings: m,
        })
    }

    pub fn num_words(&self) -> usize {
        self.vocab.len()
    }

    /// Returns the vector size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the index for a word as string. Exact match only, case-sensitive.
    pub fn lookup_word(&self, word: &str) -> Option<usize> {
        self.vocab.iter().position(|v| v == word)
    }

    /// Get the word for a word-index. Panics if `word` is out of range.
    pub fn word(&self, word: usize) -> &str {
        &self.vocab[word]
    }

    /// The `n` words most similar to `query` by cosine similarity, best first,
    /// leaving out the word indexes in `exclude`.
    pub fn nearest(&self, query: &[real], n: usize, exclude: &[usize]) -> Vec<(&str, real)> {
        let mut query = query.to_vec();
        normalize(&mut query);
        let mut best: Vec<(&str, real)> = (0..self.num_words())
            .filter(|c| !exclude.contains(c))
            .map(|c| (self.word(c), dot(&query, &self[c])))
            .collect();
        best.sort_by_key(|&(_word, sim)| std::cmp::Reverse(OrderedFloat(sim)));
        best.truncate(n);
        best
    }
}
