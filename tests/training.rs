//! End-to-end training runs on small corpora.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use fastvec::args::{ConfigError, ModelKind, Role, Side, TrainingConfig};
use fastvec::artifact::ModelArtifact;
use fastvec::evaluate::Classifier;
use fastvec::pool;
use fastvec::session::{Mode, TrainingSession};

fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, text).unwrap();
    path
}

/// Small, deterministic settings. `t = 1` keeps every word.
fn config(dir: &Path, model: ModelKind) -> TrainingConfig {
    TrainingConfig {
        output: dir.join("out"),
        model,
        dim: 8,
        epoch: 3,
        minn: 2,
        maxn: 3,
        bucket: 50,
        thread: 1,
        t: 1.0,
        verbose: 0,
        seed: 11,
        ..TrainingConfig::default()
    }
}

fn bits(values: Vec<f32>) -> Vec<u32> {
    values.into_iter().map(f32::to_bits).collect()
}

#[test]
fn toy_corpus_consumes_epoch_passes() {
    let dir = tempfile::tempdir().unwrap();
    let input = write(dir.path(), "toy.txt", "a b c\nb c d\nc d a\n");
    let config = TrainingConfig {
        input: Some(input),
        ws: 2,
        ..config(dir.path(), ModelKind::SkipGram)
    };
    let session = TrainingSession::for_mode(config, Mode::SkipGram).unwrap();
    // Three words and an end of sentence per line.
    assert_eq!(session.total_tokens(0), 12);

    session.train().unwrap();
    assert_eq!(session.tokens_consumed(0), 3 * 12);

    assert!(dir.path().join("out.bin").exists());
    let vectors = fs::read_to_string(dir.path().join("out.vec")).unwrap();
    let mut lines = vectors.lines();
    assert_eq!(lines.next(), Some("5 8"));
    assert_eq!(lines.count(), 5);
}

#[test]
fn scheduler_keeps_roles_in_lock_step() {
    let dir = tempfile::tempdir().unwrap();
    let text = "__label__x red green\n__label__y blue green\n__label__x red red\n".repeat(4);
    let input = write(dir.path(), "sup.txt", &text);
    let config = TrainingConfig {
        input: Some(input),
        ..config(dir.path(), ModelKind::Supervised)
    };
    let session = TrainingSession::for_mode(config, Mode::SemiSupervised).unwrap();
    assert_eq!(session.num_roles(), 2);
    assert_eq!(session.total_tokens(0), session.total_tokens(1));

    // Every line is four tokens, so every step moves a role by `delta`.
    let delta = 4.0 / (3 * session.total_tokens(0)) as f64;
    let mut scheduler = session.scheduler(0).unwrap();
    let mut previous = vec![0.0; 2];
    let mut steps = 0;
    while let Some(stepped) = scheduler.step_once().unwrap() {
        steps += 1;
        let progress: Vec<f64> = scheduler.trainers().iter().map(|t| t.progress()).collect();
        let max = progress.iter().cloned().fold(f64::MIN, f64::max);
        let min = progress.iter().cloned().fold(f64::MAX, f64::min);
        assert!(max - min <= delta + 1e-9, "step {steps}: {progress:?}");
        for (p, q) in progress.iter().zip(&previous) {
            assert!(p >= q);
        }
        assert!(progress[stepped] > previous[stepped]);
        previous = progress;
    }
    // Twelve lines, three epochs, two roles.
    assert_eq!(steps, 12 * 3 * 2);
    for p in previous {
        assert!((1.0..1.0 + delta).contains(&p), "final progress {p}");
    }
}

#[test]
fn single_thread_pool_matches_direct_scheduling() {
    let dir = tempfile::tempdir().unwrap();
    let input = write(
        dir.path(),
        "corpus.txt",
        &"the quick brown fox jumps over the lazy dog\n".repeat(5),
    );
    let base = TrainingConfig {
        input: Some(input),
        ..config(dir.path(), ModelKind::Cbow)
    };

    let pooled = TrainingSession::for_mode(base.clone(), Mode::Cbow).unwrap();
    pool::run(&pooled).unwrap();

    let direct = TrainingSession::for_mode(
        TrainingConfig {
            output: dir.path().join("direct"),
            ..base
        },
        Mode::Cbow,
    )
    .unwrap();
    let mut scheduler = direct.scheduler(0).unwrap();
    scheduler.run().unwrap();
    scheduler.close().unwrap();

    assert_eq!(bits(pooled.input().to_vec()), bits(direct.input().to_vec()));
    assert_eq!(
        bits(pooled.output(0).to_vec()),
        bits(direct.output(0).to_vec())
    );
    assert_eq!(
        fs::read(dir.path().join("out.bin")).unwrap(),
        fs::read(dir.path().join("direct.bin")).unwrap()
    );
}

#[test]
fn model_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let input = write(
        dir.path(),
        "corpus.txt",
        "__label__sport ball goal team\n__label__food bread cheese\n",
    );
    let config = TrainingConfig {
        input: Some(input),
        word_ngrams: 2,
        ..config(dir.path(), ModelKind::Supervised)
    };
    let session = TrainingSession::for_mode(config, Mode::Supervised).unwrap();
    session.train().unwrap();

    let loaded = ModelArtifact::load(&dir.path().join("out.bin")).unwrap();
    let trained = session.role_config(0);
    assert_eq!(loaded.config.dim, trained.dim);
    assert_eq!(loaded.config.ws, trained.ws);
    assert_eq!(loaded.config.epoch, trained.epoch);
    assert_eq!(loaded.config.min_count, trained.min_count);
    assert_eq!(loaded.config.neg, trained.neg);
    assert_eq!(loaded.config.word_ngrams, 2);
    assert_eq!(loaded.config.loss, trained.loss);
    assert_eq!(loaded.config.model, ModelKind::Supervised);
    assert_eq!(loaded.config.bucket, trained.bucket);
    assert_eq!((loaded.config.minn, loaded.config.maxn), (2, 3));
    assert_eq!(loaded.config.lr_update_rate, trained.lr_update_rate);
    assert_eq!(loaded.config.t, trained.t);

    assert_eq!(loaded.dict.nwords(), session.dict().nwords());
    assert_eq!(loaded.dict.nlabels(), 2);
    assert_eq!(bits(loaded.input.to_vec()), bits(session.input().to_vec()));
    assert_eq!(bits(loaded.output.to_vec()), bits(session.output(0).to_vec()));
}

#[test]
fn semisupervised_writes_both_roles() {
    let dir = tempfile::tempdir().unwrap();
    let text = "__label__a apple apple pie\n__label__b banana split banana\n".repeat(30);
    let input = write(dir.path(), "sup.txt", &text);
    let config = TrainingConfig {
        input: Some(input.clone()),
        lr: 0.5,
        epoch: 10,
        ..config(dir.path(), ModelKind::Supervised)
    };
    let session = TrainingSession::for_mode(config, Mode::SemiSupervised).unwrap();
    session.train().unwrap();

    for name in ["out-sup.bin", "out-sup.vec", "out-wv.bin", "out-wv.vec"] {
        assert!(dir.path().join(name).exists(), "{name}");
    }
    assert!(!dir.path().join("out.bin").exists());

    let classifier = Classifier::load(&dir.path().join("out-sup.bin")).unwrap();
    let report = classifier.test(&input, 1).unwrap();
    assert_eq!(report.examples, 60);
    assert!(report.precision > 0.9, "{report:?}");

    let wv = ModelArtifact::load(&dir.path().join("out-wv.bin")).unwrap();
    assert_eq!(wv.config.model, ModelKind::Cbow);
    assert!(Classifier::new(wv).is_err());
}

#[test]
fn bilingual_skips_roles_without_corpora() {
    let dir = tempfile::tempdir().unwrap();
    let sup = write(
        dir.path(),
        "sup.txt",
        "__label__pos good film\n__label__neg bad film\n",
    );
    let mono1 = write(dir.path(), "mono1.txt", "good film today\nbad film yesterday\n");
    let par1 = write(dir.path(), "par1.txt", "good film\nbad day\n");
    let par2 = write(dir.path(), "par2.txt", "bon film\nmauvais jour\n");
    let config = TrainingConfig {
        input: Some(sup),
        input_mono1: Some(mono1),
        input_par1: Some(par1),
        input_par2: Some(par2),
        thread: 2,
        ..config(dir.path(), ModelKind::Supervised)
    };

    let roles = Mode::Bilingual.roles(&config);
    assert_eq!(
        roles,
        vec![Role::Supervised, Role::Mono(Side::Left), Role::Parallel]
    );
    let session = TrainingSession::for_mode(config, Mode::Bilingual).unwrap();
    session.train().unwrap();

    for i in 0..session.num_roles() {
        assert!(session.tokens_consumed(i) >= 3 * session.total_tokens(i));
    }
    for name in ["out-sup.bin", "out-mono1.vec", "out-par.bin", "out-par.vec"] {
        assert!(dir.path().join(name).exists(), "{name}");
    }
    assert!(!dir.path().join("out-mono2.bin").exists());
}

#[test]
fn bilingual_needs_a_labelled_corpus() {
    let dir = tempfile::tempdir().unwrap();
    let par1 = write(dir.path(), "par1.txt", "a b\n");
    let par2 = write(dir.path(), "par2.txt", "c d\n");
    let config = TrainingConfig {
        input_par1: Some(par1),
        input_par2: Some(par2),
        ..config(dir.path(), ModelKind::Supervised)
    };
    let err = TrainingSession::for_mode(config, Mode::Bilingual)
        .err()
        .unwrap();
    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::MissingCorpus { role: "sup", .. })
    ));
}

#[test]
fn unreadable_corpus_fails_before_training() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainingConfig {
        input: Some(dir.path().join("missing.txt")),
        ..config(dir.path(), ModelKind::SkipGram)
    };
    let err = TrainingSession::for_mode(config, Mode::SkipGram)
        .err()
        .unwrap();
    assert!(format!("{err:#}").contains("error opening training file"));
    assert!(!dir.path().join("out.bin").exists());
}

#[test]
fn threads_share_one_token_counter() {
    let dir = tempfile::tempdir().unwrap();
    let input = write(
        dir.path(),
        "corpus.txt",
        &"one two three four five six\nseven eight nine ten\n".repeat(20),
    );
    let config = TrainingConfig {
        input: Some(input),
        thread: 4,
        loss: fastvec::args::LossKind::Hs,
        ..config(dir.path(), ModelKind::SkipGram)
    };
    let session = TrainingSession::for_mode(config, Mode::SkipGram).unwrap();
    session.train().unwrap();

    let total = 3 * session.total_tokens(0);
    let consumed = session.tokens_consumed(0);
    // Each thread stops once the shared count reaches the total, so at most
    // one line per thread overshoots.
    assert!(consumed >= total);
    assert!(consumed < total + 4 * 7, "{consumed} of {total}");
}

#[test]
fn abort_flag_stops_the_scheduler() {
    let dir = tempfile::tempdir().unwrap();
    let input = write(dir.path(), "corpus.txt", &"red green blue\n".repeat(6));
    let config = TrainingConfig {
        input: Some(input),
        ..config(dir.path(), ModelKind::Cbow)
    };
    let session = TrainingSession::for_mode(config, Mode::Cbow).unwrap();

    let mut scheduler = session.scheduler(0).unwrap();
    scheduler.run_until(&AtomicBool::new(true)).unwrap();
    assert_eq!(session.tokens_consumed(0), 0);

    scheduler.run_until(&AtomicBool::new(false)).unwrap();
    assert!(scheduler.min_progress() >= 1.0);
}

#[test]
fn failing_thread_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let par1 = write(dir.path(), "par1.txt", "good film\nbad day\n");
    let par2 = write(dir.path(), "par2.txt", "");
    let config = TrainingConfig {
        input_par1: Some(par1),
        input_par2: Some(par2),
        thread: 3,
        ..config(dir.path(), ModelKind::Supervised)
    };
    let session = TrainingSession::new(config, &[Role::Parallel]).unwrap();
    let err = session.train().unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("error in training thread"), "{message}");
    assert!(message.contains("is empty"), "{message}");
    assert!(!dir.path().join("out-par.bin").exists());
}
