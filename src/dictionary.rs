use std::cmp::Reverse;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::args::TrainingConfig;
use crate::corpus::{self, CorpusStream};
use crate::real;
use crate::strategy::Subwords;

/// End-of-sentence token, produced by every newline.
pub const EOS: &str = "</s>";
const BOW: &str = "<";
const EOW: &str = ">";

/// Unsupervised lines are truncated to this many words.
pub const MAX_LINE_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Word,
    Label,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub word: String,
    pub count: u64,
    pub kind: EntryKind,
}

/// Token and line counts of one corpus file, counting only tokens that made
/// it into the vocabulary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorpusStats {
    pub tokens: u64,
    pub lines: u64,
}

/// How [`Dictionary::parse_line`] treats frequent words.
pub enum Sampler<'a> {
    /// Keep every word (supervised reading and evaluation).
    Keep,
    /// Randomly discard frequent words, drawing from the given generator.
    Subsample(&'a mut StdRng),
}

#[derive(Serialize, Deserialize)]
struct StoredDictionary {
    nwords: u64,
    nlabels: u64,
    ntokens: u64,
    entries: Vec<Entry>,
}

pub struct Dictionary {
    entries: Vec<Entry>,
    word2int: HashMap<String, usize>,
    nwords: usize,
    nlabels: usize,
    ntokens: u64,

    /// `subwords[i]` is word `i` followed by its character n-gram ids.
    subwords: Vec<Vec<usize>>,
    pdiscard: Vec<real>,

    minn: usize,
    maxn: usize,
    bucket: usize,
    t: f64,
    label: String,

    corpus: HashMap<PathBuf, CorpusStats>,
}

/// 32-bit FNV-1a over the bytes of `s`. Bytes are sign-extended first, which
/// matters for non-ASCII text and keeps hashes compatible with existing
/// models.
pub fn hash(s: &[u8]) -> u32 {
    let mut h: u32 = 2166136261;
    for &b in s {
        h ^= b as i8 as i32 as u32;
        h = h.wrapping_mul(16777619);
    }
    h
}

fn is_continuation_byte(b: u8) -> bool {
    b & 0xC0 == 0x80
}

impl Dictionary {
    fn empty(config: &TrainingConfig) -> Self {
        Dictionary {
            entries: vec![],
            word2int: HashMap::new(),
            nwords: 0,
            nlabels: 0,
            ntokens: 0,
            subwords: vec![],
            pdiscard: vec![],
            minn: config.minn,
            maxn: config.maxn,
            bucket: config.bucket,
            t: config.t,
            label: config.label.clone(),
            corpus: HashMap::new(),
        }
    }

    /// Build the vocabulary of all `files`, then count how many of each
    /// file's tokens and lines the vocabulary covers.
    pub fn build(config: &TrainingConfig, files: &[&Path]) -> Result<Self> {
        let mut dict = Dictionary::empty(config);
        for path in files {
            dict.count_file(path)?;
        }
        dict.threshold(config.min_count);
        dict.init_discard();
        dict.init_subwords();
        info!(
            words = dict.nwords,
            labels = dict.nlabels,
            tokens = dict.ntokens,
            "built dictionary"
        );

        for path in files {
            if dict.corpus.contains_key(*path) {
                continue;
            }
            let stats = dict.scan_file(path)?;
            debug!(
                path = %path.display(),
                tokens = stats.tokens,
                lines = stats.lines,
                "scanned corpus"
            );
            dict.corpus.insert(path.to_path_buf(), stats);
        }
        Ok(dict)
    }

    fn count_file(&mut self, path: &Path) -> Result<()> {
        let mut tokens = vec![];
        corpus::for_each_line(path, |line| {
            tokens.extend(line.text.split_whitespace().map(str::to_string));
            if line.terminated {
                tokens.push(EOS.to_string());
            }
            for token in tokens.drain(..) {
                self.add(&token);
            }
            Ok(())
        })
    }

    fn add(&mut self, token: &str) {
        self.ntokens += 1;
        if let Some(&i) = self.word2int.get(token) {
            self.entries[i].count += 1;
            return;
        }
        let kind = if token.starts_with(&self.label) {
            EntryKind::Label
        } else {
            EntryKind::Word
        };
        self.word2int.insert(token.to_string(), self.entries.len());
        self.entries.push(Entry {
            word: token.to_string(),
            count: 1,
            kind,
        });
    }

    /// Drop words seen fewer than `min_count` times and sort the rest: words
    /// before labels, most frequent first.
    fn threshold(&mut self, min_count: u64) {
        self.entries
            .retain(|e| e.kind == EntryKind::Label || e.count >= min_count);
        self.entries
            .sort_by_key(|e| (e.kind == EntryKind::Label, Reverse(e.count)));
        self.reindex();
    }

    fn reindex(&mut self) {
        self.word2int.clear();
        self.nwords = 0;
        self.nlabels = 0;
        for (i, e) in self.entries.iter().enumerate() {
            self.word2int.insert(e.word.clone(), i);
            match e.kind {
                EntryKind::Word => self.nwords += 1,
                EntryKind::Label => self.nlabels += 1,
            }
        }
    }

    fn init_discard(&mut self) {
        let ntokens = self.ntokens.max(1) as f64;
        self.pdiscard = self
            .entries
            .iter()
            .map(|e| {
                let f = e.count as f64 / ntokens;
                ((self.t / f).sqrt() + self.t / f) as real
            })
            .collect();
    }

    fn init_subwords(&mut self) {
        self.subwords = (0..self.entries.len())
            .map(|i| {
                let mut ids = vec![i];
                if self.entries[i].word != EOS {
                    self.char_ngrams(&self.entries[i].word, &mut ids);
                }
                ids
            })
            .collect();
    }

    /// Append the bucket ids of the character n-grams of `<word>`.
    fn char_ngrams(&self, word: &str, out: &mut Vec<usize>) {
        if self.maxn == 0 || self.bucket == 0 {
            return;
        }
        let bytes = format!("{BOW}{word}{EOW}").into_bytes();
        let len = bytes.len();
        let mut ngram = Vec::with_capacity(self.maxn * 4);
        for i in 0..len {
            if is_continuation_byte(bytes[i]) {
                continue;
            }
            ngram.clear();
            let mut j = i;
            let mut n = 1;
            while j < len && n <= self.maxn {
                ngram.push(bytes[j]);
                j += 1;
                while j < len && is_continuation_byte(bytes[j]) {
                    ngram.push(bytes[j]);
                    j += 1;
                }
                // Single characters at the word boundary are just "<" or ">".
                if n >= self.minn && !(n == 1 && (i == 0 || j == len)) {
                    out.push(self.nwords + hash(&ngram) as usize % self.bucket);
                }
                n += 1;
            }
        }
    }

    /// Count the in-vocabulary tokens and the lines of one file, exactly as
    /// [`Dictionary::parse_line`] would count them.
    fn scan_file(&self, path: &Path) -> Result<CorpusStats> {
        let mut stats = CorpusStats::default();
        let eos = self.word2int.contains_key(EOS);
        corpus::for_each_line(path, |line| {
            stats.lines += 1;
            stats.tokens += line
                .text
                .split_whitespace()
                .filter(|token| self.word2int.contains_key(*token))
                .count() as u64;
            if line.terminated && eos {
                stats.tokens += 1;
            }
            Ok(())
        })?;
        Ok(stats)
    }

    pub fn nwords(&self) -> usize {
        self.nwords
    }

    pub fn nlabels(&self) -> usize {
        self.nlabels
    }

    /// Number of tokens read while building the vocabulary, over all files.
    pub fn ntokens(&self) -> u64 {
        self.ntokens
    }

    pub fn bucket(&self) -> usize {
        self.bucket
    }

    pub fn id(&self, token: &str) -> Option<usize> {
        self.word2int.get(token).copied()
    }

    pub fn kind(&self, id: usize) -> EntryKind {
        self.entries[id].kind
    }

    pub fn word(&self, id: usize) -> &str {
        &self.entries[id].word
    }

    /// The label with label index `lid` (not dictionary id).
    pub fn label(&self, lid: usize) -> &str {
        &self.entries[self.nwords + lid].word
    }

    /// Frequency of every word or every label, in id order.
    pub fn counts(&self, kind: EntryKind) -> Vec<u64> {
        self.entries
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.count)
            .collect()
    }

    /// Input rows of any word, known or not. Unknown words get only their
    /// character n-grams.
    pub fn subwords_of(&self, word: &str) -> Vec<usize> {
        match self.id(word) {
            Some(id) if self.kind(id) == EntryKind::Word => self.subwords[id].clone(),
            _ => {
                let mut ids = vec![];
                if word != EOS {
                    self.char_ngrams(word, &mut ids);
                }
                ids
            }
        }
    }

    /// Corpus statistics of a file passed to [`Dictionary::build`].
    pub fn corpus_stats(&self, path: &Path) -> Result<CorpusStats> {
        self.corpus
            .get(path)
            .copied()
            .ok_or_else(|| anyhow!("{} was not part of the dictionary", path.display()))
    }

    /// Tokens in one pass over all of `paths`.
    pub fn corpus_tokens(&self, paths: &[&Path]) -> Result<u64> {
        paths
            .iter()
            .map(|path| Ok(self.corpus_stats(path)?.tokens))
            .sum()
    }

    /// Split a line of text into word ids and label indexes. Returns the
    /// number of in-vocabulary tokens read, counting discarded words.
    pub fn parse_line(
        &self,
        text: &str,
        terminated: bool,
        words: &mut Vec<usize>,
        labels: &mut Vec<usize>,
        mut sampler: Sampler<'_>,
    ) -> u64 {
        words.clear();
        labels.clear();
        let eos = if terminated { Some(EOS) } else { None };
        let mut ntokens = 0;
        for token in text.split_whitespace().chain(eos) {
            let Some(id) = self.id(token) else {
                continue;
            };
            ntokens += 1;
            match self.kind(id) {
                EntryKind::Word => {
                    let keep = match &mut sampler {
                        Sampler::Keep => true,
                        Sampler::Subsample(rng) => {
                            words.len() < MAX_LINE_SIZE
                                && rng.gen::<real>() <= self.pdiscard[id]
                        }
                    };
                    if keep {
                        words.push(id);
                    }
                }
                EntryKind::Label => labels.push(id - self.nwords),
            }
        }
        ntokens
    }

    /// Read the next line of `stream` (see [`Dictionary::parse_line`]).
    pub fn get_line(
        &self,
        stream: &mut CorpusStream,
        words: &mut Vec<usize>,
        labels: &mut Vec<usize>,
        sampler: Sampler<'_>,
    ) -> Result<u64> {
        let line = stream.next_line()?;
        Ok(self.parse_line(line.text, line.terminated, words, labels, sampler))
    }

    /// Expand a supervised line into classifier features: every word's
    /// subwords followed by hashed word n-grams up to length `n`.
    pub fn line_features(&self, words: &[usize], n: usize, out: &mut Vec<usize>) {
        out.clear();
        for &w in words {
            out.extend_from_slice(&self.subwords[w]);
        }
        if self.bucket == 0 {
            return;
        }
        for i in 0..words.len() {
            let mut h = words[i] as u64;
            for &w in words.iter().skip(i + 1).take(n.saturating_sub(1)) {
                h = h.wrapping_mul(116049371).wrapping_add(w as u64);
                out.push(self.nwords + (h % self.bucket as u64) as usize);
            }
        }
    }

    pub fn save<W: Write>(&self, out: &mut W) -> Result<()> {
        let stored = StoredDictionary {
            nwords: self.nwords as u64,
            nlabels: self.nlabels as u64,
            ntokens: self.ntokens,
            entries: self.entries.clone(),
        };
        bincode::serialize_into(out, &stored).context("error writing dictionary")?;
        Ok(())
    }

    /// Read a dictionary written by [`Dictionary::save`]. `config` supplies
    /// the subword settings, which are stored separately.
    pub fn load<R: Read>(config: &TrainingConfig, input: &mut R) -> Result<Self> {
        let stored: StoredDictionary =
            bincode::deserialize_from(input).context("error reading dictionary")?;
        let mut dict = Dictionary::empty(config);
        dict.entries = stored.entries;
        dict.ntokens = stored.ntokens;
        dict.reindex();
        anyhow::ensure!(
            dict.nwords as u64 == stored.nwords && dict.nlabels as u64 == stored.nlabels,
            "corrupt dictionary: expected {} words and {} labels, found {} and {}",
            stored.nwords,
            stored.nlabels,
            dict.nwords,
            dict.nlabels
        );
        dict.init_discard();
        dict.init_subwords();
        Ok(dict)
    }
}

impl Subwords for Dictionary {
    fn subwords(&self, id: usize) -> &[usize] {
        &self.subwords[id]
    }
}
