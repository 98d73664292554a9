use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{ensure, Result};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::args::TrainingConfig;
use crate::artifact;
use crate::corpus::CorpusStream;
use crate::dictionary::{Dictionary, Sampler};
use crate::matrix::Matrix;
use crate::model::{Learner, Model, TargetSpace};
use crate::real;
use crate::strategy::{self, Strategy};
use crate::tables::Tables;

/// Positions of a progress bar; progress 1.0 is the full bar.
const BAR_LENGTH: u64 = 1000;

/// Everything a trainer borrows from the training session for one role.
#[derive(Clone, Copy)]
pub struct RoleBinding<'s> {
    pub config: &'s TrainingConfig,
    pub dict: &'s Dictionary,
    pub input: &'s Matrix,
    pub output: &'s Matrix,
    pub targets: &'s TargetSpace,
    pub tables: &'s Tables,
    /// Tokens consumed so far by every replica of the role.
    pub tokens: &'s AtomicU64,
    /// Tokens in one pass over the role's corpora.
    pub total_tokens: u64,
    pub progress_bars: Option<&'s MultiProgress>,
}

struct Telemetry {
    bar: ProgressBar,
    start: Instant,
}

pub struct Trainer<'s> {
    binding: RoleBinding<'s>,
    strategy: Strategy,
    streams: Vec<CorpusStream>,
    model: Model<'s>,
    /// Lines each stream still skips before its first read.
    skip: u64,
    steps: u64,
    telemetry: Option<Telemetry>,

    words: Vec<usize>,
    paired: Vec<usize>,
    labels: Vec<usize>,
    features: Vec<usize>,
}

impl<'s> Trainer<'s> {
    /// Open the role's corpora and build a gradient model against the shared
    /// matrices. Every stream starts `thread_id × offset` lines in; the lines
    /// are skipped by the first [`Trainer::step`], on the thread that trains.
    pub fn setup(binding: RoleBinding<'s>, thread_id: usize) -> Result<Self> {
        let config = binding.config;
        let strategy = Strategy::for_model(config.model, config.bilingual_scaling);
        let paths = config.corpus_paths();
        ensure!(
            paths.len() == if strategy.is_paired() { 2 } else { 1 },
            "role `{}` has {} corpus files for a {:?} model",
            config.role.name(),
            paths.len(),
            config.model
        );

        let offset = match config.thread_offset {
            Some(offset) => offset,
            None => binding.dict.corpus_stats(paths[0])?.lines / config.thread as u64,
        };
        let streams = paths
            .iter()
            .map(|path| CorpusStream::open(path))
            .collect::<Result<Vec<_>>>()?;

        let model = Model::new(
            config,
            binding.input,
            binding.output,
            binding.targets,
            binding.tables,
            config.seed.wrapping_add(thread_id as u64),
        );

        let telemetry = match binding.progress_bars {
            Some(bars) if thread_id == 0 && config.verbose > 1 => {
                let style = ProgressStyle::with_template(
                    "{prefix:>6} [{elapsed_precise}] {bar:40.cyan/blue} {percent:>3}% {msg} (eta {eta})",
                )?;
                let bar = bars.add(ProgressBar::new(BAR_LENGTH));
                bar.set_style(style);
                bar.set_prefix(config.role.name());
                Some(Telemetry {
                    bar,
                    start: Instant::now(),
                })
            }
            _ => None,
        };

        debug!(
            role = config.role.name(),
            thread = thread_id,
            skipped_lines = offset * thread_id as u64,
            "trainer ready"
        );
        Ok(Trainer {
            binding,
            strategy,
            streams,
            model,
            skip: offset * thread_id as u64,
            steps: 0,
            telemetry,
            words: vec![],
            paired: vec![],
            labels: vec![],
            features: vec![],
        })
    }

    pub fn config(&self) -> &'s TrainingConfig {
        self.binding.config
    }

    /// Fraction of the role's work done, over all threads: tokens consumed
    /// divided by `epoch` passes over the role's corpora.
    pub fn progress(&self) -> f64 {
        let consumed = self.binding.tokens.load(Ordering::Relaxed);
        let total = self.binding.config.epoch as u64 * self.binding.total_tokens;
        consumed as f64 / total as f64
    }

    /// Average loss of this replica's updates.
    pub fn loss(&self) -> f64 {
        self.model.loss()
    }

    /// Read one line (two for paired strategies) and train on it.
    pub fn step(&mut self) -> Result<()> {
        if self.skip > 0 {
            for stream in &mut self.streams {
                stream.skip_lines(self.skip)?;
            }
            self.skip = 0;
        }
        let config = self.binding.config;
        let dict = self.binding.dict;
        let progress = self.progress();
        let lr = (config.lr * (1.0 - progress)).max(0.0) as real;

        let consumed = match self.strategy {
            Strategy::Supervised => {
                let n = dict.get_line(
                    &mut self.streams[0],
                    &mut self.words,
                    &mut self.labels,
                    Sampler::Keep,
                )?;
                dict.line_features(&self.words, config.word_ngrams, &mut self.features);
                strategy::supervised(&mut self.model, lr, &self.features, &self.labels);
                n
            }
            Strategy::Cbow | Strategy::SkipGram => {
                let n = dict.get_line(
                    &mut self.streams[0],
                    &mut self.words,
                    &mut self.labels,
                    Sampler::Subsample(self.model.rng()),
                )?;
                if self.strategy == Strategy::Cbow {
                    strategy::cbow(&mut self.model, dict, config.ws, lr, &self.words);
                } else {
                    strategy::skipgram(&mut self.model, dict, config.ws, lr, &self.words);
                }
                n
            }
            Strategy::Bilingual(scaling) => {
                // Both sides subsample from the same draw.
                let seed = self.model.rng().gen::<u64>();
                let mut left_rng = StdRng::seed_from_u64(seed);
                let mut right_rng = StdRng::seed_from_u64(seed);
                let (left, right) = self.streams.split_at_mut(1);
                let n = dict.get_line(
                    &mut left[0],
                    &mut self.words,
                    &mut self.labels,
                    Sampler::Subsample(&mut left_rng),
                )? + dict.get_line(
                    &mut right[0],
                    &mut self.paired,
                    &mut self.labels,
                    Sampler::Subsample(&mut right_rng),
                )?;
                strategy::bilingual(
                    &mut self.model,
                    dict,
                    config.ws,
                    scaling,
                    lr,
                    &self.words,
                    &self.paired,
                );
                n
            }
        };
        self.binding.tokens.fetch_add(consumed, Ordering::Relaxed);

        self.steps += 1;
        if self.steps % u64::from(config.lr_update_rate) == 0 {
            self.report(lr);
        }
        Ok(())
    }

    fn report(&self, lr: real) {
        let Some(telemetry) = &self.telemetry else {
            return;
        };
        let progress = self.progress().min(1.0);
        let elapsed = telemetry.start.elapsed().as_secs_f64().max(1e-3);
        let consumed = self.binding.tokens.load(Ordering::Relaxed);
        let words_per_sec_per_thread =
            consumed as f64 / elapsed / self.binding.config.thread as f64;
        telemetry
            .bar
            .set_position((progress * BAR_LENGTH as f64) as u64);
        telemetry.bar.set_message(format!(
            "words/sec/thread {words_per_sec_per_thread:>8.0} lr {lr:.6} loss {:.6}",
            self.model.loss()
        ));
    }

    /// Finish the run for this role: write `<output><suffix>.bin` and
    /// `<output><suffix>.vec`. The corpus streams are closed on return.
    pub fn close(self, suffix: &str) -> Result<()> {
        let config = self.binding.config;
        if let Some(telemetry) = &self.telemetry {
            telemetry.bar.set_position(BAR_LENGTH);
            telemetry
                .bar
                .finish_with_message(format!("loss {:.6}", self.model.loss()));
        }
        let dict = self.binding.dict;
        artifact::save_model(
            &artifact::output_path(&config.output, suffix, "bin"),
            config,
            dict,
            self.binding.input,
            self.binding.output,
        )?;
        artifact::save_vectors(
            &artifact::output_path(&config.output, suffix, "vec"),
            dict,
            self.binding.input,
        )?;
        Ok(())
    }
}
