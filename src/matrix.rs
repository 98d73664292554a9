use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};

use aligned_box::AlignedBox;
use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::Rng;

use crate::real;

/// A weight that can be read and written from any thread.
///
/// Loads and stores are relaxed and `add` is a load followed by a store, not
/// an atomic read-modify-write. Concurrent updates to the same weight can
/// overwrite each other; Hogwild training accepts that.
#[derive(Default)]
#[repr(transparent)]
pub struct Real {
    bits: AtomicU32,
}

impl Real {
    pub fn get(&self) -> real {
        real::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: real) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn add(&self, x: real) {
        let a = self.get();
        self.set(a + x);
    }
}

/// Row-major `rows × cols` matrix of [`Real`]s.
///
/// All mutation goes through `&self`, so one matrix can be shared by every
/// trainer and every thread. It is never resized after allocation.
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: AlignedBox<[Real]>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Result<Self> {
        // AlignedBox can't hold an empty slice; an empty matrix keeps one
        // unused cell.
        let len = (rows * cols).max(1);
        let data = AlignedBox::slice_from_default(128, len)
            .map_err(|err| anyhow!("error allocating {rows}x{cols} matrix: {err:?}"))?;
        Ok(Matrix { rows, cols, data })
    }

    /// A matrix with entries drawn uniformly from `[-bound, bound)`.
    pub fn uniform(rows: usize, cols: usize, bound: real, rng: &mut StdRng) -> Result<Self> {
        let m = Matrix::zeros(rows, cols)?;
        if bound > 0.0 {
            for cell in m.cells() {
                cell.set(rng.gen_range(-bound..bound));
            }
        }
        Ok(m)
    }

    pub fn from_values(rows: usize, cols: usize, values: &[real]) -> Result<Self> {
        anyhow::ensure!(
            values.len() == rows * cols,
            "expected {} values for a {rows}x{cols} matrix, got {}",
            rows * cols,
            values.len()
        );
        let m = Matrix::zeros(rows, cols)?;
        for (cell, &v) in m.cells().iter().zip(values) {
            cell.set(v);
        }
        Ok(m)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    fn cells(&self) -> &[Real] {
        &self.data[..self.rows * self.cols]
    }

    pub fn row(&self, i: usize) -> &[Real] {
        &self.data[i * self.cols..][..self.cols]
    }

    pub fn get(&self, i: usize, j: usize) -> real {
        self.row(i)[j].get()
    }

    /// Dot product of row `i` with `vec`.
    pub fn dot_row(&self, vec: &[real], i: usize) -> real {
        debug_assert_eq!(vec.len(), self.cols);
        self.row(i)
            .iter()
            .zip(vec)
            .map(|(w, &v)| w.get() * v)
            .sum()
    }

    /// `row[i] += scale * vec`
    pub fn add_to_row(&self, vec: &[real], i: usize, scale: real) {
        debug_assert_eq!(vec.len(), self.cols);
        for (w, &v) in self.row(i).iter().zip(vec) {
            w.add(scale * v);
        }
    }

    /// `out += scale * row[i]`
    pub fn add_row_into(&self, out: &mut [real], i: usize, scale: real) {
        debug_assert_eq!(out.len(), self.cols);
        for (o, w) in out.iter_mut().zip(self.row(i)) {
            *o += scale * w.get();
        }
    }

    /// Snapshot of every weight, row-major.
    pub fn to_vec(&self) -> Vec<real> {
        self.cells().iter().map(Real::get).collect()
    }

    pub fn save<W: Write>(&self, out: &mut W) -> Result<()> {
        bincode::serialize_into(&mut *out, &(self.rows as u64, self.cols as u64))
            .context("error writing matrix shape")?;
        let values = self.to_vec();
        out.write_all(bytemuck::cast_slice::<real, u8>(&values))
            .context("error writing matrix")?;
        Ok(())
    }

    pub fn load<R: Read>(input: &mut R) -> Result<Self> {
        let (rows, cols): (u64, u64) =
            bincode::deserialize_from(&mut *input).context("error reading matrix shape")?;
        let rows = usize::try_from(rows).context("matrix too large")?;
        let cols = usize::try_from(cols).context("matrix too large")?;
        let mut values = vec![0.0 as real; rows * cols];
        input
            .read_exact(bytemuck::cast_slice_mut::<real, u8>(&mut values))
            .context("error reading matrix")?;
        Matrix::from_values(rows, cols, &values)
    }
}
