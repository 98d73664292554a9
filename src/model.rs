//! The gradient model: one forward/backward pass per (features, target)
//! pair against shared matrices.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::args::{LossKind, ModelKind, TrainingConfig};
use crate::matrix::Matrix;
use crate::real;
use crate::tables::Tables;

const NEGATIVE_TABLE_SIZE: usize = 10_000_000;

/// Anything that can take one gradient step. Sampling strategies only see
/// this trait.
pub trait Learner {
    /// One stochastic update: predict `target` from the average of the
    /// `input` rows.
    fn update(&mut self, input: &[usize], target: usize, lr: real);

    fn rng(&mut self) -> &mut StdRng;
}

/// Huffman coding of the output targets, for hierarchical softmax.
///
/// Leaf `i` is target `i`; internal node `n + j` is output row `j`.
struct HuffmanTree {
    /// Internal nodes on the way from each leaf to the root, as output rows.
    paths: Vec<Vec<usize>>,
    /// Which child each step of `paths` takes (true for the right child).
    codes: Vec<Vec<bool>>,
    /// Children of internal node `n + j`.
    children: Vec<(usize, usize)>,
}

impl HuffmanTree {
    /// Build the tree. `counts` must be sorted from most to least frequent,
    /// which the dictionary guarantees.
    fn new(counts: &[u64]) -> Self {
        let n = counts.len();
        if n == 0 {
            return HuffmanTree {
                paths: vec![],
                codes: vec![],
                children: vec![],
            };
        }

        let mut count = vec![1_000_000_000_000_000u64; 2 * n - 1];
        count[..n].copy_from_slice(counts);
        let mut parent = vec![None; 2 * n - 1];
        let mut binary = vec![false; 2 * n - 1];
        let mut children = Vec::with_capacity(n - 1);

        // Leaves are consumed from the rarest end; internal nodes are
        // created in increasing count order, so two cursors suffice.
        let mut pos1 = n;
        let mut pos2 = n;
        let pick = |count: &[u64], pos1: &mut usize, pos2: &mut usize| {
            if *pos1 > 0 && count[*pos1 - 1] < count[*pos2] {
                *pos1 -= 1;
                *pos1
            } else {
                *pos2 += 1;
                *pos2 - 1
            }
        };
        for node in n..(2 * n - 1) {
            let min1 = pick(&count, &mut pos1, &mut pos2);
            let min2 = pick(&count, &mut pos1, &mut pos2);
            count[node] = count[min1] + count[min2];
            parent[min1] = Some(node);
            parent[min2] = Some(node);
            binary[min2] = true;
            children.push((min1, min2));
        }

        let mut paths = Vec::with_capacity(n);
        let mut codes = Vec::with_capacity(n);
        for leaf in 0..n {
            let mut path = vec![];
            let mut code = vec![];
            let mut b = leaf;
            while let Some(p) = parent[b] {
                path.push(p - n);
                code.push(binary[b]);
                b = p;
            }
            paths.push(path);
            codes.push(code);
        }
        HuffmanTree {
            paths,
            codes,
            children,
        }
    }
}

/// Read-only tables describing a role's output space: the Huffman tree for
/// hierarchical softmax and the negatives table for negative sampling.
///
/// Built once per role and shared by all of the role's thread replicas.
pub struct TargetSpace {
    ntargets: usize,
    tree: Option<HuffmanTree>,
    negatives: Vec<usize>,
}

impl TargetSpace {
    pub fn new(counts: &[u64], loss: LossKind, seed: u64) -> Self {
        let tree = (loss == LossKind::Hs).then(|| HuffmanTree::new(counts));
        let negatives = if loss == LossKind::Ns {
            let mut rng = StdRng::seed_from_u64(seed);
            negative_table(counts, &mut rng)
        } else {
            vec![]
        };
        TargetSpace {
            ntargets: counts.len(),
            tree,
            negatives,
        }
    }

    pub fn ntargets(&self) -> usize {
        self.ntargets
    }
}

/// Targets drawn with probability proportional to the square root of their
/// frequency. Every target appears at least once.
fn negative_table(counts: &[u64], rng: &mut StdRng) -> Vec<usize> {
    let size = NEGATIVE_TABLE_SIZE.min(counts.len().saturating_mul(1000));
    let z: f64 = counts.iter().map(|&c| (c as f64).sqrt()).sum();
    if z == 0.0 {
        return vec![];
    }
    let mut table = Vec::with_capacity(size + counts.len());
    for (i, &c) in counts.iter().enumerate() {
        let share = ((c as f64).sqrt() * size as f64 / z).ceil().max(1.0) as usize;
        table.extend(std::iter::repeat(i).take(share));
    }
    table.shuffle(rng);
    table
}

/// Per-thread gradient model. Owns its scratch vectors and random state and
/// borrows everything shared.
pub struct Model<'s> {
    input: &'s Matrix,
    output: &'s Matrix,
    targets: &'s TargetSpace,
    tables: &'s Tables,

    loss_kind: LossKind,
    neg: usize,
    supervised: bool,

    hidden: Vec<real>,
    grad: Vec<real>,
    scores: Vec<real>,
    rng: StdRng,
    neg_pos: usize,

    loss: f64,
    nexamples: u64,
}

impl<'s> Model<'s> {
    pub fn new(
        config: &TrainingConfig,
        input: &'s Matrix,
        output: &'s Matrix,
        targets: &'s TargetSpace,
        tables: &'s Tables,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let neg_pos = if targets.negatives.is_empty() {
            0
        } else {
            rng.gen_range(0..targets.negatives.len())
        };
        Model {
            input,
            output,
            targets,
            tables,
            loss_kind: config.loss,
            neg: config.neg,
            supervised: config.model == ModelKind::Supervised,
            hidden: vec![0.0; input.cols()],
            grad: vec![0.0; input.cols()],
            scores: vec![0.0; output.rows()],
            rng,
            neg_pos,
            loss: 0.0,
            nexamples: 0,
        }
    }

    /// Average loss over every update so far.
    pub fn loss(&self) -> f64 {
        if self.nexamples == 0 {
            0.0
        } else {
            self.loss / self.nexamples as f64
        }
    }

    fn compute_hidden(&mut self, input: &[usize]) {
        self.hidden.fill(0.0);
        for &i in input {
            self.input.add_row_into(&mut self.hidden, i, 1.0);
        }
        let scale = 1.0 / input.len() as real;
        for h in &mut self.hidden {
            *h *= scale;
        }
    }

    fn binary_logistic(&mut self, target: usize, label: bool, lr: real) -> real {
        let score = self
            .tables
            .sigmoid(self.output.dot_row(&self.hidden, target));
        let alpha = lr * (if label { 1.0 } else { 0.0 } - score);
        self.output.add_row_into(&mut self.grad, target, alpha);
        self.output.add_to_row(&self.hidden, target, alpha);
        if label {
            -self.tables.log(score)
        } else {
            -self.tables.log(1.0 - score)
        }
    }

    fn negative(&mut self, target: usize) -> usize {
        let table = &self.targets.negatives;
        loop {
            // Terminates: every target has at least one slot.
            let negative = table[self.neg_pos];
            self.neg_pos = (self.neg_pos + 1) % table.len();
            if negative != target {
                return negative;
            }
        }
    }

    fn negative_sampling(&mut self, target: usize, lr: real) -> real {
        let mut loss = self.binary_logistic(target, true, lr);
        // With a single target there is nothing to contrast against.
        if self.targets.ntargets < 2 {
            return loss;
        }
        for _ in 0..self.neg {
            let negative = self.negative(target);
            loss += self.binary_logistic(negative, false, lr);
        }
        loss
    }

    fn hierarchical_softmax(&mut self, target: usize, lr: real) -> real {
        let targets = self.targets;
        let Some(tree) = &targets.tree else {
            return 0.0;
        };
        let mut loss = 0.0;
        for (&node, &code) in tree.paths[target].iter().zip(&tree.codes[target]) {
            loss += self.binary_logistic(node, code, lr);
        }
        loss
    }

    fn compute_scores(&mut self) {
        let mut max = real::NEG_INFINITY;
        for (i, s) in self.scores.iter_mut().enumerate() {
            *s = self.output.dot_row(&self.hidden, i);
            max = max.max(*s);
        }
        let mut z = 0.0;
        for s in &mut self.scores {
            *s = (*s - max).exp();
            z += *s;
        }
        for s in &mut self.scores {
            *s /= z;
        }
    }

    fn softmax(&mut self, target: usize, lr: real) -> real {
        self.compute_scores();
        for i in 0..self.scores.len() {
            let label = if i == target { 1.0 } else { 0.0 };
            let alpha = lr * (label - self.scores[i]);
            self.output.add_row_into(&mut self.grad, i, alpha);
            self.output.add_to_row(&self.hidden, i, alpha);
        }
        -self.tables.log(self.scores[target])
    }

    /// The `k` most likely targets for `input`, as (log-probability, target)
    /// pairs, most likely first.
    pub fn predict(&mut self, input: &[usize], k: usize) -> Vec<(real, usize)> {
        if input.is_empty() || k == 0 || self.targets.ntargets == 0 {
            return vec![];
        }
        self.compute_hidden(input);
        let mut heap = BinaryHeap::with_capacity(k + 1);
        let targets = self.targets;
        match &targets.tree {
            Some(tree) => {
                let root = 2 * targets.ntargets - 2;
                self.dfs(tree, k, root, 0.0, &mut heap);
            }
            None => self.find_k_best(k, &mut heap),
        }
        heap.into_sorted_vec()
            .into_iter()
            .map(|Reverse((score, i))| (score.into_inner(), i))
            .collect()
    }

    fn find_k_best(&mut self, k: usize, heap: &mut BinaryHeap<Reverse<(OrderedFloat<real>, usize)>>) {
        self.compute_scores();
        for (i, &s) in self.scores.iter().enumerate() {
            push_bounded(heap, k, self.tables.log(s), i);
        }
    }

    fn dfs(
        &self,
        tree: &HuffmanTree,
        k: usize,
        node: usize,
        score: real,
        heap: &mut BinaryHeap<Reverse<(OrderedFloat<real>, usize)>>,
    ) {
        if let Some(Reverse((worst, _))) = heap.peek() {
            if heap.len() == k && score < worst.into_inner() {
                return;
            }
        }
        let n = self.targets.ntargets;
        if node < n {
            push_bounded(heap, k, score, node);
            return;
        }
        let (left, right) = tree.children[node - n];
        let f = self
            .tables
            .sigmoid(self.output.dot_row(&self.hidden, node - n));
        self.dfs(tree, k, left, score + self.tables.log(1.0 - f), heap);
        self.dfs(tree, k, right, score + self.tables.log(f), heap);
    }
}

fn push_bounded(
    heap: &mut BinaryHeap<Reverse<(OrderedFloat<real>, usize)>>,
    k: usize,
    score: real,
    i: usize,
) {
    if heap.len() == k {
        if let Some(Reverse((worst, _))) = heap.peek() {
            if score < worst.into_inner() {
                return;
            }
        }
    }
    heap.push(Reverse((OrderedFloat(score), i)));
    if heap.len() > k {
        heap.pop();
    }
}

impl Learner for Model<'_> {
    fn update(&mut self, input: &[usize], target: usize, lr: real) {
        if input.is_empty() {
            return;
        }
        self.compute_hidden(input);
        self.grad.fill(0.0);
        let loss = match self.loss_kind {
            LossKind::Ns => self.negative_sampling(target, lr),
            LossKind::Hs => self.hierarchical_softmax(target, lr),
            LossKind::Softmax => self.softmax(target, lr),
        };
        self.loss += loss as f64;
        self.nexamples += 1;

        if self.supervised {
            let scale = 1.0 / input.len() as real;
            for g in &mut self.grad {
                *g *= scale;
            }
        }
        for &i in input {
            self.input.add_to_row(&self.grad, i, 1.0);
        }
    }

    fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}
