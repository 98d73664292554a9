use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::real;

/// Which sampling strategy a trainer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModelKind {
    Cbow,
    #[value(name = "sg")]
    SkipGram,
    #[value(name = "sup")]
    Supervised,
    #[value(name = "bil")]
    Bilingual,
}

impl ModelKind {
    pub fn tag(self) -> i32 {
        match self {
            ModelKind::Cbow => 1,
            ModelKind::SkipGram => 2,
            ModelKind::Supervised => 3,
            ModelKind::Bilingual => 4,
        }
    }

    pub fn from_tag(tag: i32) -> Result<Self, ConfigError> {
        match tag {
            1 => Ok(ModelKind::Cbow),
            2 => Ok(ModelKind::SkipGram),
            3 => Ok(ModelKind::Supervised),
            4 => Ok(ModelKind::Bilingual),
            _ => Err(ConfigError::UnknownTag { what: "model", tag }),
        }
    }
}

/// Output layer used by the gradient model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LossKind {
    /// Hierarchical softmax over a Huffman tree of the targets.
    Hs,
    /// Negative sampling.
    Ns,
    /// Full softmax over every target.
    Softmax,
}

impl LossKind {
    pub fn tag(self) -> i32 {
        match self {
            LossKind::Hs => 1,
            LossKind::Ns => 2,
            LossKind::Softmax => 3,
        }
    }

    pub fn from_tag(tag: i32) -> Result<Self, ConfigError> {
        match tag {
            1 => Ok(LossKind::Hs),
            2 => Ok(LossKind::Ns),
            3 => Ok(LossKind::Softmax),
            _ => Err(ConfigError::UnknownTag { what: "loss", tag }),
        }
    }
}

/// How the bilingual strategy scales its learning rate by the length of the
/// aligned sentence it predicts.
///
/// The factor is `ws / |target line|`. It was tuned empirically, not derived,
/// so the direction(s) it applies to can be chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BilingualScaling {
    /// Scale both directions.
    Both,
    /// Scale only the left-to-right direction.
    Forward,
    /// Plain learning rate in both directions.
    None,
}

impl BilingualScaling {
    /// Learning-rate factors for the (left → right, right → left) directions,
    /// given the lengths of the left and right lines.
    pub fn factors(self, ws: usize, left_len: usize, right_len: usize) -> (real, real) {
        let scale = |len: usize| {
            if len == 0 {
                1.0
            } else {
                ws as real / len as real
            }
        };
        match self {
            BilingualScaling::Both => (scale(right_len), scale(left_len)),
            BilingualScaling::Forward => (scale(right_len), 1.0),
            BilingualScaling::None => (1.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// A named training objective. Every role shares the dictionary and the input
/// matrix but reads its own corpus and owns its own output matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The single role of a plain skip-gram, CBOW or supervised run.
    Primary,
    /// Classifier head on the labelled corpus.
    Supervised,
    /// CBOW word vectors on the labelled corpus, used by semi-supervised runs.
    Words,
    /// CBOW word vectors on one side's monolingual corpus.
    Mono(Side),
    /// Cross-lingual skip-gram on the aligned parallel corpora.
    Parallel,
}

impl Role {
    pub fn name(self) -> &'static str {
        match self {
            Role::Primary => "main",
            Role::Supervised => "sup",
            Role::Words => "wv",
            Role::Mono(Side::Left) => "mono1",
            Role::Mono(Side::Right) => "mono2",
            Role::Parallel => "par",
        }
    }

    /// Suffix appended to the output path for this role's artifacts.
    pub fn suffix(self) -> String {
        match self {
            Role::Primary => String::new(),
            other => format!("-{}", other.name()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("role `{role}` needs a corpus: pass --{flag}")]
    MissingCorpus {
        role: &'static str,
        flag: &'static str,
    },

    #[error("invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },

    #[error("unknown {what} tag {tag} in model file")]
    UnknownTag { what: &'static str, tag: i32 },
}

/// All hyperparameters of one role.
///
/// Role configurations are derived from a base configuration with
/// [`TrainingConfig::for_role`], which never mutates the base.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingConfig {
    pub role: Role,

    pub input: Option<PathBuf>,
    pub input_mono1: Option<PathBuf>,
    pub input_mono2: Option<PathBuf>,
    pub input_par1: Option<PathBuf>,
    pub input_par2: Option<PathBuf>,

    /// Output path prefix. Artifacts are `<output><suffix>.bin` and `.vec`.
    pub output: PathBuf,

    pub lr: f64,
    /// Learning rate of the word-vector roles.
    pub lr_wv: f64,
    /// Number of steps between progress reports.
    pub lr_update_rate: u32,
    pub dim: usize,
    pub ws: usize,
    pub epoch: usize,
    pub min_count: u64,
    pub neg: usize,
    pub word_ngrams: usize,
    pub loss: LossKind,
    pub model: ModelKind,
    pub bucket: usize,
    pub minn: usize,
    pub maxn: usize,
    pub thread: usize,
    /// Lines each thread skips per thread id; `None` spreads threads evenly.
    pub thread_offset: Option<u64>,
    /// Subsampling threshold.
    pub t: f64,
    pub label: String,
    pub verbose: u8,
    pub bilingual_scaling: BilingualScaling,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            role: Role::Primary,
            input: None,
            input_mono1: None,
            input_mono2: None,
            input_par1: None,
            input_par2: None,
            output: PathBuf::new(),
            lr: 0.05,
            lr_wv: 0.05,
            lr_update_rate: 100,
            dim: 100,
            ws: 5,
            epoch: 5,
            min_count: 1,
            neg: 5,
            word_ngrams: 1,
            loss: LossKind::Ns,
            model: ModelKind::SkipGram,
            bucket: 2_000_000,
            minn: 3,
            maxn: 6,
            thread: 12,
            thread_offset: None,
            t: 1e-4,
            label: "__label__".to_string(),
            verbose: 2,
            bilingual_scaling: BilingualScaling::Both,
            seed: 0,
        }
    }
}

/// The fields written at the start of a model file, in file order.
#[derive(Serialize, Deserialize)]
struct StoredArgs {
    dim: i32,
    ws: i32,
    epoch: i32,
    min_count: i32,
    neg: i32,
    word_ngrams: i32,
    loss: i32,
    model: i32,
    bucket: i32,
    minn: i32,
    maxn: i32,
    lr_update_rate: i32,
    t: f64,
}

fn to_i32<T: TryInto<i32>>(field: &'static str, value: T) -> Result<i32, ConfigError> {
    value.try_into().map_err(|_| ConfigError::Invalid {
        field,
        reason: "does not fit in a 32-bit model file field".to_string(),
    })
}

fn from_i32<T: TryFrom<i32>>(field: &'static str, value: i32) -> Result<T, ConfigError> {
    T::try_from(value).map_err(|_| ConfigError::Invalid {
        field,
        reason: format!("{value} is out of range"),
    })
}

impl TrainingConfig {
    /// Corpus paths in their declared order: primary, monolingual left and
    /// right, parallel left and right. Empty slots are skipped.
    pub fn corpus_paths(&self) -> Vec<&Path> {
        [
            &self.input,
            &self.input_mono1,
            &self.input_mono2,
            &self.input_par1,
            &self.input_par2,
        ]
        .into_iter()
        .filter_map(|p| p.as_deref())
        .collect()
    }

    /// Derive the configuration of `role` from this base configuration.
    ///
    /// Corpus paths the role does not read are cleared, and the model, loss
    /// and learning rate are chosen for the role.
    pub fn for_role(&self, role: Role) -> Result<TrainingConfig, ConfigError> {
        let mut config = self.clone();
        config.role = role;
        match role {
            Role::Primary => {
                config.clear_bilingual_inputs();
            }
            Role::Supervised => {
                config.model = ModelKind::Supervised;
                config.loss = LossKind::Softmax;
                config.clear_bilingual_inputs();
            }
            Role::Words => {
                config.model = ModelKind::Cbow;
                config.loss = LossKind::Ns;
                config.lr = self.lr_wv;
                config.clear_bilingual_inputs();
            }
            Role::Mono(side) => {
                config.model = ModelKind::Cbow;
                config.loss = LossKind::Ns;
                config.lr = self.lr_wv;
                config.input = None;
                config.input_par1 = None;
                config.input_par2 = None;
                match side {
                    Side::Left => config.input_mono2 = None,
                    Side::Right => config.input_mono1 = None,
                }
            }
            Role::Parallel => {
                config.model = ModelKind::Bilingual;
                config.loss = LossKind::Ns;
                config.lr = self.lr_wv;
                config.input = None;
                config.input_mono1 = None;
                config.input_mono2 = None;
            }
        }
        config.validate()?;
        Ok(config)
    }

    fn clear_bilingual_inputs(&mut self) {
        self.input_mono1 = None;
        self.input_mono2 = None;
        self.input_par1 = None;
        self.input_par2 = None;
    }

    /// True if every corpus `role` needs is present.
    pub fn has_corpora_for(&self, role: Role) -> bool {
        match role {
            Role::Primary | Role::Supervised | Role::Words => self.input.is_some(),
            Role::Mono(Side::Left) => self.input_mono1.is_some(),
            Role::Mono(Side::Right) => self.input_mono2.is_some(),
            Role::Parallel => self.input_par1.is_some() && self.input_par2.is_some(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let missing = |flag| ConfigError::MissingCorpus {
            role: self.role.name(),
            flag,
        };
        match self.role {
            Role::Primary | Role::Supervised | Role::Words => {
                if self.input.is_none() {
                    return Err(missing("input"));
                }
            }
            Role::Mono(Side::Left) => {
                if self.input_mono1.is_none() {
                    return Err(missing("input-mono1"));
                }
            }
            Role::Mono(Side::Right) => {
                if self.input_mono2.is_none() {
                    return Err(missing("input-mono2"));
                }
            }
            Role::Parallel => {
                if self.input_par1.is_none() {
                    return Err(missing("input-par1"));
                }
                if self.input_par2.is_none() {
                    return Err(missing("input-par2"));
                }
            }
        }

        let positive = [
            ("dim", self.dim),
            ("ws", self.ws),
            ("epoch", self.epoch),
            ("thread", self.thread),
            ("lr-update-rate", self.lr_update_rate as usize),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than 0".to_string(),
                });
            }
        }
        if self.lr.is_nan() || self.lr <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "lr",
                reason: format!("{} is not a positive learning rate", self.lr),
            });
        }
        if self.maxn > 0 && self.minn > self.maxn {
            return Err(ConfigError::Invalid {
                field: "minn",
                reason: format!("{} is larger than maxn {}", self.minn, self.maxn),
            });
        }
        if self.maxn > 0 && self.bucket == 0 {
            return Err(ConfigError::Invalid {
                field: "bucket",
                reason: "character n-grams need at least one bucket".to_string(),
            });
        }
        if self.label.is_empty() {
            return Err(ConfigError::Invalid {
                field: "label",
                reason: "label prefix must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Write the fixed-width header of a model file.
    pub fn save<W: Write>(&self, out: &mut W) -> Result<()> {
        let stored = StoredArgs {
            dim: to_i32("dim", self.dim)?,
            ws: to_i32("ws", self.ws)?,
            epoch: to_i32("epoch", self.epoch)?,
            min_count: to_i32("min-count", self.min_count)?,
            neg: to_i32("neg", self.neg)?,
            word_ngrams: to_i32("word-ngrams", self.word_ngrams)?,
            loss: self.loss.tag(),
            model: self.model.tag(),
            bucket: to_i32("bucket", self.bucket)?,
            minn: to_i32("minn", self.minn)?,
            maxn: to_i32("maxn", self.maxn)?,
            lr_update_rate: to_i32("lr-update-rate", self.lr_update_rate)?,
            t: self.t,
        };
        bincode::serialize_into(out, &stored).context("error writing model arguments")?;
        Ok(())
    }

    /// Read the header written by [`TrainingConfig::save`]. Fields that are
    /// not stored keep their defaults.
    pub fn load<R: Read>(input: &mut R) -> Result<Self> {
        let stored: StoredArgs =
            bincode::deserialize_from(input).context("error reading model arguments")?;
        Ok(TrainingConfig {
            dim: from_i32("dim", stored.dim)?,
            ws: from_i32("ws", stored.ws)?,
            epoch: from_i32("epoch", stored.epoch)?,
            min_count: from_i32("min-count", stored.min_count)?,
            neg: from_i32("neg", stored.neg)?,
            word_ngrams: from_i32("word-ngrams", stored.word_ngrams)?,
            loss: LossKind::from_tag(stored.loss)?,
            model: ModelKind::from_tag(stored.model)?,
            bucket: from_i32("bucket", stored.bucket)?,
            minn: from_i32("minn", stored.minn)?,
            maxn: from_i32("maxn", stored.maxn)?,
            lr_update_rate: from_i32("lr-update-rate", stored.lr_update_rate)?,
            t: stored.t,
            ..TrainingConfig::default()
        })
    }
}

/// Training flags shared by every training command.
#[derive(clap::Args, Debug, Clone)]
pub struct TrainOptions {
    /// Use text data from FILE to train the model
    #[arg(long, value_name = "FILE")]
    pub input: Option<PathBuf>,

    /// First-language monolingual corpus (bilingual command)
    #[arg(long = "input-mono1", value_name = "FILE")]
    pub input_mono1: Option<PathBuf>,

    /// Second-language monolingual corpus (bilingual command)
    #[arg(long = "input-mono2", value_name = "FILE")]
    pub input_mono2: Option<PathBuf>,

    /// First-language side of the parallel corpus (bilingual command)
    #[arg(long = "input-par1", value_name = "FILE")]
    pub input_par1: Option<PathBuf>,

    /// Second-language side of the parallel corpus, aligned line by line
    #[arg(long = "input-par2", value_name = "FILE")]
    pub input_par2: Option<PathBuf>,

    /// Output path prefix; `.bin` and `.vec` are appended
    #[arg(long, value_name = "PATH")]
    pub output: PathBuf,

    /// Set the starting learning rate; default is 0.1 for supervised commands
    /// and 0.05 otherwise
    #[arg(long)]
    pub lr: Option<f64>,

    /// Learning rate of the word-vector roles
    #[arg(long = "lr-wv", default_value_t = 0.05)]
    pub lr_wv: f64,

    /// Report progress every N steps
    #[arg(long = "lr-update-rate", value_name = "N", default_value_t = 100)]
    pub lr_update_rate: u32,

    /// Set size of word vectors
    #[arg(long, default_value_t = 100)]
    pub dim: usize,

    /// Set max skip length between words
    #[arg(long, default_value_t = 5)]
    pub ws: usize,

    /// Number of passes over each corpus
    #[arg(long, default_value_t = 5)]
    pub epoch: usize,

    /// Discard words that appear less than N times
    #[arg(long = "min-count", value_name = "N", default_value_t = 1)]
    pub min_count: u64,

    /// Number of negative examples
    #[arg(long, default_value_t = 5)]
    pub neg: usize,

    /// Max length of word n-grams used as classifier features
    #[arg(long = "word-ngrams", default_value_t = 1)]
    pub word_ngrams: usize,

    /// Loss function; default is softmax for supervised commands and ns otherwise
    #[arg(long, value_enum)]
    pub loss: Option<LossKind>,

    /// Number of hash buckets for character and word n-grams
    #[arg(long, default_value_t = 2_000_000)]
    pub bucket: usize,

    /// Min length of character n-grams; default is 0 for supervised commands, 3 otherwise
    #[arg(long)]
    pub minn: Option<usize>,

    /// Max length of character n-grams; default is 0 for supervised commands, 6 otherwise
    #[arg(long)]
    pub maxn: Option<usize>,

    /// Use N threads
    #[arg(long, value_name = "N", default_value_t = 12)]
    pub thread: usize,

    /// Lines skipped per thread id before training; default spreads the
    /// threads evenly over each corpus
    #[arg(long = "thread-offset", value_name = "LINES")]
    pub thread_offset: Option<u64>,

    /// Set threshold for occurrence of words. Those that appear with higher
    /// frequency in the training data will be randomly down-sampled
    #[arg(long, default_value_t = 1e-4)]
    pub sample: f64,

    /// Labels prefix
    #[arg(long, default_value = "__label__")]
    pub label: String,

    /// Verbosity level; 2 shows progress bars, 3 adds debug logging
    #[arg(long, default_value_t = 2)]
    pub verbose: u8,

    /// Which directions of the bilingual objective get length-scaled learning rates
    #[arg(long = "bilingual-scaling", value_enum, default_value_t = BilingualScaling::Both)]
    pub bilingual_scaling: BilingualScaling,

    /// Seed for weight initialization and sampling
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}

impl TrainOptions {
    /// Resolve the options into the base configuration of a run whose
    /// primary model is `model`.
    pub fn into_config(self, model: ModelKind) -> TrainingConfig {
        let supervised = model == ModelKind::Supervised;
        let minn = self.minn.unwrap_or(if supervised { 0 } else { 3 });
        let maxn = self.maxn.unwrap_or(if supervised { 0 } else { 6 });
        let bucket = if self.word_ngrams <= 1 && maxn == 0 {
            0
        } else {
            self.bucket
        };
        TrainingConfig {
            role: Role::Primary,
            input: self.input,
            input_mono1: self.input_mono1,
            input_mono2: self.input_mono2,
            input_par1: self.input_par1,
            input_par2: self.input_par2,
            output: self.output,
            lr: self.lr.unwrap_or(if supervised { 0.1 } else { 0.05 }),
            lr_wv: self.lr_wv,
            lr_update_rate: self.lr_update_rate,
            dim: self.dim,
            ws: self.ws,
            epoch: self.epoch,
            min_count: self.min_count,
            neg: self.neg,
            word_ngrams: self.word_ngrams,
            loss: self
                .loss
                .unwrap_or(if supervised { LossKind::Softmax } else { LossKind::Ns }),
            model,
            bucket,
            minn,
            maxn,
            thread: self.thread,
            thread_offset: self.thread_offset,
            t: self.sample,
            label: self.label,
            verbose: self.verbose,
            bilingual_scaling: self.bilingual_scaling,
            seed: self.seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bilingual_base() -> TrainingConfig {
        TrainingConfig {
            input: Some("sup.txt".into()),
            input_mono1: Some("mono1.txt".into()),
            input_mono2: Some("mono2.txt".into()),
            input_par1: Some("par1.txt".into()),
            input_par2: Some("par2.txt".into()),
            lr: 0.1,
            lr_wv: 0.02,
            model: ModelKind::Supervised,
            loss: LossKind::Softmax,
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn roles_keep_only_their_corpora() {
        let base = bilingual_base();

        let sup = base.for_role(Role::Supervised).unwrap();
        assert_eq!(sup.corpus_paths(), vec![Path::new("sup.txt")]);
        assert_eq!(sup.model, ModelKind::Supervised);
        assert_eq!(sup.lr, 0.1);

        let mono2 = base.for_role(Role::Mono(Side::Right)).unwrap();
        assert_eq!(mono2.corpus_paths(), vec![Path::new("mono2.txt")]);
        assert_eq!(mono2.model, ModelKind::Cbow);
        assert_eq!(mono2.loss, LossKind::Ns);
        assert_eq!(mono2.lr, 0.02);

        let par = base.for_role(Role::Parallel).unwrap();
        assert_eq!(
            par.corpus_paths(),
            vec![Path::new("par1.txt"), Path::new("par2.txt")]
        );
        assert_eq!(par.model, ModelKind::Bilingual);

        // The base is untouched.
        assert_eq!(base, bilingual_base());
    }

    #[test]
    fn missing_corpus_is_reported() {
        let base = TrainingConfig {
            input: Some("sup.txt".into()),
            ..TrainingConfig::default()
        };
        let err = base.for_role(Role::Parallel).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingCorpus {
                role: "par",
                flag: "input-par1"
            }
        ));
        assert!(!base.has_corpora_for(Role::Mono(Side::Left)));
        assert!(base.has_corpora_for(Role::Words));
    }

    #[test]
    fn rejects_inverted_ngram_bounds() {
        let config = TrainingConfig {
            input: Some("a.txt".into()),
            minn: 5,
            maxn: 3,
            ..TrainingConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "minn", .. })
        ));
    }

    #[test]
    fn header_round_trip() {
        let config = TrainingConfig {
            dim: 17,
            ws: 3,
            epoch: 9,
            min_count: 2,
            neg: 7,
            word_ngrams: 2,
            loss: LossKind::Hs,
            model: ModelKind::Cbow,
            bucket: 1234,
            minn: 2,
            maxn: 4,
            lr_update_rate: 50,
            t: 1e-3,
            ..TrainingConfig::default()
        };
        let mut bytes = vec![];
        config.save(&mut bytes).unwrap();
        // 12 i32 fields and one f64, no framing.
        assert_eq!(bytes.len(), 12 * 4 + 8);
        assert_eq!(&bytes[..4], &17i32.to_le_bytes());

        let loaded = TrainingConfig::load(&mut bytes.as_slice()).unwrap();
        assert_eq!(loaded.dim, 17);
        assert_eq!(loaded.ws, 3);
        assert_eq!(loaded.epoch, 9);
        assert_eq!(loaded.min_count, 2);
        assert_eq!(loaded.neg, 7);
        assert_eq!(loaded.word_ngrams, 2);
        assert_eq!(loaded.loss, LossKind::Hs);
        assert_eq!(loaded.model, ModelKind::Cbow);
        assert_eq!(loaded.bucket, 1234);
        assert_eq!(loaded.minn, 2);
        assert_eq!(loaded.maxn, 4);
        assert_eq!(loaded.lr_update_rate, 50);
        assert_eq!(loaded.t, 1e-3);
    }

    #[test]
    fn bilingual_factors() {
        assert_eq!(BilingualScaling::Both.factors(5, 4, 10), (0.5, 1.25));
        assert_eq!(BilingualScaling::Forward.factors(5, 4, 10), (0.5, 1.0));
        assert_eq!(BilingualScaling::None.factors(5, 4, 10), (1.0, 1.0));
    }
}
