//! Sampling strategies: how a line of tokens becomes (features, target)
//! updates.

use rand::Rng;

use crate::args::{BilingualScaling, ModelKind};
use crate::model::Learner;
use crate::real;

/// Input rows of a vocabulary word: the word's own row followed by its
/// character n-gram rows.
pub trait Subwords {
    fn subwords(&self, id: usize) -> &[usize];
}

/// The strategy a trainer runs, fixed when the trainer is set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Supervised,
    Cbow,
    SkipGram,
    Bilingual(BilingualScaling),
}

impl Strategy {
    pub fn for_model(model: ModelKind, scaling: BilingualScaling) -> Self {
        match model {
            ModelKind::Supervised => Strategy::Supervised,
            ModelKind::Cbow => Strategy::Cbow,
            ModelKind::SkipGram => Strategy::SkipGram,
            ModelKind::Bilingual => Strategy::Bilingual(scaling),
        }
    }

    /// True if the strategy reads a second, aligned line per step.
    pub fn is_paired(self) -> bool {
        matches!(self, Strategy::Bilingual(_))
    }
}

/// Predict one label, drawn uniformly, from all of the line's features.
pub fn supervised<L: Learner>(learner: &mut L, lr: real, features: &[usize], labels: &[usize]) {
    if labels.is_empty() || features.is_empty() {
        return;
    }
    let i = learner.rng().gen_range(0..labels.len());
    learner.update(features, labels[i], lr);
}

/// Predict each word from the bag of subwords of its neighbours.
pub fn cbow<L: Learner, S: Subwords + ?Sized>(
    learner: &mut L,
    dict: &S,
    ws: usize,
    lr: real,
    line: &[usize],
) {
    let mut bow = vec![];
    for w in 0..line.len() {
        let radius = learner.rng().gen_range(1..=ws);
        bow.clear();
        let start = w.saturating_sub(radius);
        let stop = (w + radius + 1).min(line.len());
        for c in start..stop {
            if c != w {
                bow.extend_from_slice(dict.subwords(line[c]));
            }
        }
        if !bow.is_empty() {
            learner.update(&bow, line[w], lr);
        }
    }
}

/// Predict each neighbour of a word from the word's subwords.
pub fn skipgram<L: Learner, S: Subwords + ?Sized>(
    learner: &mut L,
    dict: &S,
    ws: usize,
    lr: real,
    line: &[usize],
) {
    for w in 0..line.len() {
        let radius = learner.rng().gen_range(1..=ws);
        let ngrams = dict.subwords(line[w]);
        let start = w.saturating_sub(radius);
        let stop = (w + radius + 1).min(line.len());
        for c in start..stop {
            if c != w {
                learner.update(ngrams, line[c], lr);
            }
        }
    }
}

/// Cross-lingual skip-gram over two aligned lines: every word of each line
/// predicts every word of the other.
///
/// Longer target lines mean more updates per source word, so the learning
/// rate of each direction is scaled by `ws / |target line|` as `scaling`
/// selects.
pub fn bilingual<L: Learner, S: Subwords + ?Sized>(
    learner: &mut L,
    dict: &S,
    ws: usize,
    scaling: BilingualScaling,
    lr: real,
    left: &[usize],
    right: &[usize],
) {
    let (forward, backward) = scaling.factors(ws, left.len(), right.len());
    for &x in left {
        for &y in right {
            learner.update(dict.subwords(x), y, lr * forward);
        }
    }
    for &y in right {
        for &x in left {
            learner.update(dict.subwords(y), x, lr * backward);
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    /// Records every update instead of learning.
    struct Recorder {
        rng: StdRng,
        updates: Vec<(Vec<usize>, usize, real)>,
    }

    impl Recorder {
        fn new() -> Self {
            Recorder {
                rng: StdRng::seed_from_u64(0),
                updates: vec![],
            }
        }
    }

    impl Learner for Recorder {
        fn update(&mut self, input: &[usize], target: usize, lr: real) {
            self.updates.push((input.to_vec(), target, lr));
        }

        fn rng(&mut self) -> &mut StdRng {
            &mut self.rng
        }
    }

    /// Word `i` has subwords `[i, 100 + i]`.
    struct FakeDict(Vec<Vec<usize>>);

    impl FakeDict {
        fn new(n: usize) -> Self {
            FakeDict((0..n).map(|i| vec![i, 100 + i]).collect())
        }
    }

    impl Subwords for FakeDict {
        fn subwords(&self, id: usize) -> &[usize] {
            &self.0[id]
        }
    }

    #[test]
    fn single_word_lines_produce_no_updates() {
        let dict = FakeDict::new(3);
        let mut learner = Recorder::new();
        skipgram(&mut learner, &dict, 5, 0.1, &[1]);
        cbow(&mut learner, &dict, 5, 0.1, &[1]);
        assert!(learner.updates.is_empty());
    }

    #[test]
    fn cbow_excludes_the_target_from_its_context() {
        let dict = FakeDict::new(4);
        let mut learner = Recorder::new();
        cbow(&mut learner, &dict, 1, 0.1, &[0, 1, 2]);
        assert_eq!(
            learner.updates,
            vec![
                (vec![1, 101], 0, 0.1),
                (vec![0, 100, 2, 102], 1, 0.1),
                (vec![1, 101], 2, 0.1),
            ]
        );
    }

    #[test]
    fn skipgram_stays_inside_the_window() {
        let dict = FakeDict::new(5);
        let line = [0, 1, 2, 3, 4];
        let mut learner = Recorder::new();
        skipgram(&mut learner, &dict, 2, 0.1, &line);
        assert!(!learner.updates.is_empty());
        for (input, target, _) in &learner.updates {
            let w = input[0];
            assert_ne!(w, *target);
            assert!(w.abs_diff(*target) <= 2);
            assert_eq!(input, dict.subwords(w));
        }
        // Radius 1 is always covered.
        for w in 0..4 {
            assert!(learner.updates.iter().any(|(i, t, _)| i[0] == w && *t == w + 1));
        }
    }

    #[test]
    fn supervised_needs_labels_and_features() {
        let mut learner = Recorder::new();
        supervised(&mut learner, 0.1, &[1, 2], &[]);
        supervised(&mut learner, 0.1, &[], &[0]);
        assert!(learner.updates.is_empty());

        supervised(&mut learner, 0.1, &[1, 2], &[3]);
        assert_eq!(learner.updates, vec![(vec![1, 2], 3, 0.1)]);
    }

    #[test]
    fn bilingual_scales_by_target_length() {
        let dict = FakeDict::new(20);
        let left: Vec<usize> = (0..4).collect();
        let right: Vec<usize> = (4..14).collect();
        let mut learner = Recorder::new();
        bilingual(
            &mut learner,
            &dict,
            5,
            BilingualScaling::Both,
            0.2,
            &left,
            &right,
        );
        assert_eq!(learner.updates.len(), 2 * 4 * 10);
        let (forward, backward) = learner.updates.split_at(40);
        assert!(forward.iter().all(|(i, t, lr)| i[0] < 4 && *t >= 4 && *lr == 0.2 * 0.5));
        assert!(backward.iter().all(|(i, t, lr)| i[0] >= 4 && *t < 4 && *lr == 0.2 * 1.25));

        let mut learner = Recorder::new();
        bilingual(
            &mut learner,
            &dict,
            5,
            BilingualScaling::None,
            0.2,
            &left,
            &right,
        );
        assert!(learner.updates.iter().all(|(_, _, lr)| *lr == 0.2));
    }

    #[test]
    fn bilingual_with_an_empty_side_is_a_no_op() {
        let dict = FakeDict::new(3);
        let mut learner = Recorder::new();
        bilingual(&mut learner, &dict, 5, BilingualScaling::Both, 0.1, &[0, 1], &[]);
        assert!(learner.updates.is_empty());
    }
}
