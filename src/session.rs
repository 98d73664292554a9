use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, ensure, Context, Result};
use indicatif::MultiProgress;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use crate::args::{ModelKind, Role, Side, TrainingConfig};
use crate::dictionary::{Dictionary, EntryKind};
use crate::matrix::Matrix;
use crate::model::TargetSpace;
use crate::pool;
use crate::real;
use crate::scheduler::Scheduler;
use crate::tables::Tables;
use crate::trainer::{RoleBinding, Trainer};

/// The training commands. They differ only in the roles they train.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    SkipGram,
    Cbow,
    Supervised,
    /// A classifier plus CBOW word vectors on the same labelled corpus.
    SemiSupervised,
    /// A classifier plus monolingual and cross-lingual word vectors.
    Bilingual,
}

impl Mode {
    /// Model of the base configuration the roles are derived from.
    pub fn model(self) -> ModelKind {
        match self {
            Mode::SkipGram => ModelKind::SkipGram,
            Mode::Cbow => ModelKind::Cbow,
            Mode::Supervised | Mode::SemiSupervised | Mode::Bilingual => ModelKind::Supervised,
        }
    }

    /// The roles to train. Optional bilingual roles whose corpora were not
    /// given are left out.
    pub fn roles(self, base: &TrainingConfig) -> Vec<Role> {
        match self {
            Mode::SkipGram | Mode::Cbow | Mode::Supervised => vec![Role::Primary],
            Mode::SemiSupervised => vec![Role::Supervised, Role::Words],
            Mode::Bilingual => {
                let mut roles = vec![Role::Supervised];
                for role in [Role::Mono(Side::Left), Role::Mono(Side::Right), Role::Parallel] {
                    if base.has_corpora_for(role) {
                        roles.push(role);
                    } else {
                        info!(role = role.name(), "no corpus given; role skipped");
                    }
                }
                roles
            }
        }
    }
}

struct RoleState {
    config: TrainingConfig,
    output: Matrix,
    targets: TargetSpace,
    tokens: AtomicU64,
    total_tokens: u64,
}

pub struct TrainingSession {
    base: TrainingConfig,
    dict: Dictionary,
    input: Matrix,
    tables: Tables,
    roles: Vec<RoleState>,
    bars: Option<MultiProgress>,
}

impl TrainingSession {
    pub fn for_mode(base: TrainingConfig, mode: Mode) -> Result<Self> {
        let roles = mode.roles(&base);
        TrainingSession::new(base, &roles)
    }

    /// Build the dictionary over every role's corpora and allocate all
    /// matrices. Fails before any training if a role is misconfigured or has
    /// nothing to train on.
    pub fn new(base: TrainingConfig, roles: &[Role]) -> Result<Self> {
        ensure!(!roles.is_empty(), "nothing to train");
        let configs = roles
            .iter()
            .map(|&role| base.for_role(role))
            .collect::<Result<Vec<_>, _>>()?;

        let mut files: Vec<&Path> = vec![];
        for config in &configs {
            for path in config.corpus_paths() {
                if !files.contains(&path) {
                    files.push(path);
                }
            }
        }
        let dict = Dictionary::build(&base, &files)?;
        ensure!(dict.nwords() > 0, "no words in the training data");

        let mut rng = StdRng::seed_from_u64(base.seed);
        let input = Matrix::uniform(
            dict.nwords() + dict.bucket(),
            base.dim,
            1.0 / base.dim as real,
            &mut rng,
        )
        .context("error allocating input matrix")?;

        let mut states = Vec::with_capacity(configs.len());
        for config in configs {
            let kind = if config.model == ModelKind::Supervised {
                EntryKind::Label
            } else {
                EntryKind::Word
            };
            let counts = dict.counts(kind);
            if counts.is_empty() {
                bail!(
                    "role `{}` has no labels to predict; labels start with `{}`",
                    config.role.name(),
                    config.label
                );
            }
            let output = Matrix::zeros(counts.len(), config.dim)
                .with_context(|| format!("error allocating `{}` output matrix", config.role.name()))?;
            let targets = TargetSpace::new(&counts, config.loss, config.seed);
            let total_tokens = dict.corpus_tokens(&config.corpus_paths())?;
            ensure!(
                total_tokens > 0,
                "role `{}` has no known tokens in its corpus",
                config.role.name()
            );
            info!(
                role = config.role.name(),
                model = ?config.model,
                loss = ?config.loss,
                lr = config.lr,
                targets = counts.len(),
                tokens = total_tokens,
                "role ready"
            );
            states.push(RoleState {
                config,
                output,
                targets,
                tokens: AtomicU64::new(0),
                total_tokens,
            });
        }

        Ok(TrainingSession {
            bars: (base.verbose > 1).then(MultiProgress::new),
            base,
            dict,
            input,
            tables: Tables::new(),
            roles: states,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.base
    }

    pub fn dict(&self) -> &Dictionary {
        &self.dict
    }

    pub fn input(&self) -> &Matrix {
        &self.input
    }

    pub fn num_roles(&self) -> usize {
        self.roles.len()
    }

    pub fn role_config(&self, i: usize) -> &TrainingConfig {
        &self.roles[i].config
    }

    pub fn output(&self, i: usize) -> &Matrix {
        &self.roles[i].output
    }

    /// Tokens consumed so far by role `i`, over all threads.
    pub fn tokens_consumed(&self, i: usize) -> u64 {
        self.roles[i].tokens.load(Ordering::Relaxed)
    }

    /// Tokens in one pass over role `i`'s corpora.
    pub fn total_tokens(&self, i: usize) -> u64 {
        self.roles[i].total_tokens
    }

    pub fn binding(&self, i: usize) -> RoleBinding<'_> {
        let role = &self.roles[i];
        RoleBinding {
            config: &role.config,
            dict: &self.dict,
            input: &self.input,
            output: &role.output,
            targets: &role.targets,
            tables: &self.tables,
            tokens: &role.tokens,
            total_tokens: role.total_tokens,
            progress_bars: self.bars.as_ref(),
        }
    }

    /// One replica of every role, for thread `thread_id`.
    pub fn scheduler(&self, thread_id: usize) -> Result<Scheduler<'_>> {
        let trainers = (0..self.roles.len())
            .map(|i| Trainer::setup(self.binding(i), thread_id))
            .collect::<Result<Vec<_>>>()?;
        Ok(Scheduler::new(trainers))
    }

    /// Train every role to completion on `thread` threads and write the
    /// artifacts.
    pub fn train(&self) -> Result<()> {
        pool::run(self)
    }
}
