use std::ffi::OsString;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};

use crate::args::TrainingConfig;
use crate::dictionary::Dictionary;
use crate::matrix::Matrix;
use crate::real;

/// `<output><suffix>.<extension>`, e.g. `out-sup.bin`.
pub fn output_path(output: &Path, suffix: &str, extension: &str) -> PathBuf {
    let mut name = OsString::from(output.as_os_str());
    name.push(suffix);
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

/// Write the model file: configuration header, dictionary, input matrix,
/// output matrix, back to back.
pub fn save_model(
    path: &Path,
    config: &TrainingConfig,
    dict: &Dictionary,
    input: &Matrix,
    output: &Matrix,
) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("error creating model file {}", path.display()))?;
    let mut out = BufWriter::new(file);
    config.save(&mut out)?;
    dict.save(&mut out)?;
    input.save(&mut out)?;
    output.save(&mut out)?;
    out.flush()
        .with_context(|| format!("error writing model file {}", path.display()))?;
    Ok(())
}

/// Average of the input rows of `ids`, or zeros if there are none.
pub fn average_rows(input: &Matrix, ids: &[usize]) -> Vec<real> {
    let mut vec = vec![0.0; input.cols()];
    for &id in ids {
        input.add_row_into(&mut vec, id, 1.0);
    }
    if !ids.is_empty() {
        let scale = 1.0 / ids.len() as real;
        for v in &mut vec {
            *v *= scale;
        }
    }
    vec
}

/// Write every word's vector, the average of its subword rows, as text.
pub fn save_vectors(path: &Path, dict: &Dictionary, input: &Matrix) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("error creating vectors file {}", path.display()))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "{} {}", dict.nwords(), input.cols()).context("error writing vectors file")?;
    for id in 0..dict.nwords() {
        let vec = average_rows(input, &dict.subwords_of(dict.word(id)));
        write_vector(&mut out, dict.word(id), &vec).context("error writing vectors file")?;
    }
    out.flush().context("error writing vectors file")?;
    Ok(())
}

/// One line of a `.vec` file: the word, then its components.
pub fn write_vector<W: Write>(out: &mut W, word: &str, vec: &[real]) -> std::io::Result<()> {
    write!(out, "{word}")?;
    for v in vec {
        write!(out, " {v}")?;
    }
    writeln!(out)
}

/// A trained model read back from a `.bin` file.
pub struct ModelArtifact {
    pub config: TrainingConfig,
    pub dict: Dictionary,
    pub input: Matrix,
    pub output: Matrix,
}

impl ModelArtifact {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("error opening model file {}", path.display()))?;
        let mut input = BufReader::new(file);
        let config = TrainingConfig::load(&mut input)?;
        let dict = Dictionary::load(&config, &mut input)?;
        let input_matrix = Matrix::load(&mut input)?;
        let output = Matrix::load(&mut input)?;
        ensure!(
            input_matrix.cols() == config.dim && output.cols() == config.dim,
            "model file {} has matrices of width {} and {}, expected {}",
            path.display(),
            input_matrix.cols(),
            output.cols(),
            config.dim
        );
        ensure!(
            input_matrix.rows() == dict.nwords() + config.bucket,
            "model file {} has {} input rows for {} words and {} buckets",
            path.display(),
            input_matrix.rows(),
            dict.nwords(),
            config.bucket
        );
        Ok(ModelArtifact {
            config,
            dict,
            input: input_matrix,
            output,
        })
    }

    /// Vector of any word. Words outside the vocabulary are built from their
    /// character n-grams, and are zero if they have none.
    pub fn word_vector(&self, word: &str) -> Vec<real> {
        average_rows(&self.input, &self.dict.subwords_of(word))
    }
}
