use std::fmt;
use std::io::Write;
use std::path::Path;

use anyhow::{ensure, Context, Result};

use crate::args::{ModelKind, TrainingConfig};
use crate::artifact::ModelArtifact;
use crate::corpus;
use crate::dictionary::{EntryKind, Sampler};
use crate::model::{Model, TargetSpace};
use crate::real;
use crate::tables::Tables;

/// Precision and recall at `k` over a labelled file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestReport {
    pub k: usize,
    /// Lines that had both features and labels.
    pub examples: u64,
    pub precision: f64,
    pub recall: f64,
}

impl fmt::Display for TestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "P@{}: {:.3}", self.k, self.precision)?;
        writeln!(f, "R@{}: {:.3}", self.k, self.recall)?;
        write!(f, "Number of examples: {}", self.examples)
    }
}

/// A classifier ready to predict: the loaded artifact plus the read-only
/// tables its gradient model borrows.
pub struct Classifier {
    artifact: ModelArtifact,
    targets: TargetSpace,
    tables: Tables,
}

impl Classifier {
    pub fn new(artifact: ModelArtifact) -> Result<Self> {
        ensure!(
            artifact.config.model == ModelKind::Supervised,
            "model was trained with the {:?} objective; only supervised models predict labels",
            artifact.config.model
        );
        let counts = artifact.dict.counts(EntryKind::Label);
        let targets = TargetSpace::new(&counts, artifact.config.loss, 0);
        Ok(Classifier {
            artifact,
            targets,
            tables: Tables::new(),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        Classifier::new(ModelArtifact::load(path)?)
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.artifact.config
    }

    fn model(&self) -> Model<'_> {
        Model::new(
            &self.artifact.config,
            &self.artifact.input,
            &self.artifact.output,
            &self.targets,
            &self.tables,
            0,
        )
    }

    /// Split a line into classifier features and label indexes.
    fn features(&self, text: &str, terminated: bool, features: &mut Vec<usize>, labels: &mut Vec<usize>) {
        let dict = &self.artifact.dict;
        let mut words = vec![];
        dict.parse_line(text, terminated, &mut words, labels, Sampler::Keep);
        dict.line_features(&words, self.artifact.config.word_ngrams, features);
    }

    pub fn test(&self, path: &Path, k: usize) -> Result<TestReport> {
        let mut model = self.model();
        let (mut features, mut labels) = (vec![], vec![]);
        let mut examples = 0u64;
        let mut nlabels = 0u64;
        let mut correct = 0u64;
        corpus::for_each_line(path, |line| {
            self.features(line.text, line.terminated, &mut features, &mut labels);
            if !labels.is_empty() && !features.is_empty() {
                for (_, predicted) in model.predict(&features, k) {
                    if labels.contains(&predicted) {
                        correct += 1;
                    }
                }
                examples += 1;
                nlabels += labels.len() as u64;
            }
            Ok(())
        })?;
        Ok(TestReport {
            k,
            examples,
            precision: correct as f64 / (k as u64 * examples).max(1) as f64,
            recall: correct as f64 / nlabels.max(1) as f64,
        })
    }

    /// The `k` most likely labels of one line with their probabilities.
    pub fn predict_line(&self, model: &mut Model<'_>, text: &str, k: usize) -> Vec<(&str, real)> {
        let (mut features, mut labels) = (vec![], vec![]);
        self.features(text, true, &mut features, &mut labels);
        model
            .predict(&features, k)
            .into_iter()
            .map(|(log_prob, i)| (self.artifact.dict.label(i), log_prob.exp()))
            .collect()
    }

    /// Write one line of predictions per line of `path`; `n/a` when a line
    /// has no known words.
    pub fn predict_file<W: Write>(&self, path: &Path, k: usize, with_prob: bool, out: &mut W) -> Result<()> {
        let mut model = self.model();
        corpus::for_each_line(path, |line| {
            let predictions = self.predict_line(&mut model, line.text, k);
            if predictions.is_empty() {
                writeln!(out, "n/a")?;
                return Ok(());
            }
            let mut sep = "";
            for (label, prob) in predictions {
                write!(out, "{sep}{label}")?;
                if with_prob {
                    write!(out, " {prob}")?;
                }
                sep = " ";
            }
            writeln!(out)?;
            Ok(())
        })
        .context("error writing predictions")
    }
}
