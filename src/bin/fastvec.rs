use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use fastvec::args::TrainOptions;
use fastvec::artifact::{self, ModelArtifact};
use fastvec::evaluate::Classifier;
use fastvec::session::{Mode, TrainingSession};
use fastvec::Vectors;

#[derive(Parser)]
#[command(about = "Train and use subword-aware word and text embeddings")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a skip-gram model
    Skipgram(TrainOptions),
    /// Train a CBOW model
    Cbow(TrainOptions),
    /// Train a supervised classifier
    Supervised(TrainOptions),
    /// Train a classifier and CBOW word vectors on the same labelled corpus
    Semisupervised(TrainOptions),
    /// Train a classifier together with monolingual and cross-lingual word vectors
    Bilingual(TrainOptions),
    /// Evaluate a supervised model on a labelled file
    Test {
        #[arg(value_name = "MODEL")]
        model: PathBuf,
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(default_value_t = 1)]
        k: usize,
    },
    /// Print the most likely labels of each line
    Predict {
        #[arg(value_name = "MODEL")]
        model: PathBuf,
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(default_value_t = 1)]
        k: usize,
    },
    /// Print the most likely labels of each line with their probabilities
    PredictProb {
        #[arg(value_name = "MODEL")]
        model: PathBuf,
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(default_value_t = 1)]
        k: usize,
    },
    /// Print vectors for words read from stdin
    PrintVectors {
        #[arg(value_name = "MODEL")]
        model: PathBuf,
    },
    /// Query nearest neighbours in a `.vec` file
    Nn {
        #[arg(value_name = "VECTORS")]
        vectors: PathBuf,
        /// Number of neighbours to show
        #[arg(default_value_t = 10)]
        k: usize,
    },
}

fn init_logging(verbose: u8) {
    let default = if verbose >= 3 { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn train(options: TrainOptions, mode: Mode) -> Result<()> {
    init_logging(options.verbose);
    let config = options.into_config(mode.model());
    let session = TrainingSession::for_mode(config, mode)?;
    session.train()
}

fn print_vectors(model: &Path) -> Result<()> {
    let artifact = ModelArtifact::load(model)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for line in io::stdin().lock().lines() {
        let line = line.context("error reading stdin")?;
        for word in line.split_whitespace() {
            artifact::write_vector(&mut out, word, &artifact.word_vector(word))
                .context("error writing vectors")?;
        }
    }
    Ok(())
}

fn nearest_neighbours(vectors: &Path, k: usize) -> Result<()> {
    let vectors = Vectors::load(vectors)?;
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("Query word? ");
        let _ = io::stdout().flush();
        line.clear();
        if stdin.lock().read_line(&mut line).context("error reading stdin")? == 0 {
            break;
        }
        let word = line.trim();
        if word.is_empty() {
            continue;
        }
        let Some(i) = vectors.lookup_word(word) else {
            println!("Out of dictionary word!");
            continue;
        };
        for (neighbour, sim) in vectors.nearest(&vectors[i], k, &[i]) {
            println!("{neighbour:50}\t{sim}");
        }
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Skipgram(options) => train(options, Mode::SkipGram),
        Command::Cbow(options) => train(options, Mode::Cbow),
        Command::Supervised(options) => train(options, Mode::Supervised),
        Command::Semisupervised(options) => train(options, Mode::SemiSupervised),
        Command::Bilingual(options) => train(options, Mode::Bilingual),
        Command::Test { model, file, k } => {
            let report = Classifier::load(&model)?.test(&file, k)?;
            println!("{report}");
            Ok(())
        }
        Command::Predict { model, file, k } => {
            Classifier::load(&model)?.predict_file(&file, k, false, &mut io::stdout().lock())
        }
        Command::PredictProb { model, file, k } => {
            Classifier::load(&model)?.predict_file(&file, k, true, &mut io::stdout().lock())
        }
        Command::PrintVectors { model } => print_vectors(&model),
        Command::Nn { vectors, k } => nearest_neighbours(&vectors, k),
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("{err:#}");
        process::exit(1);
    }
}
