use crate::real;

const SIGMOID_TABLE_SIZE: usize = 512;
const MAX_SIGMOID: real = 8.0;
const LOG_TABLE_SIZE: usize = 512;

/// Precomputed sigmoid and log values.
///
/// Built once per process and handed to every gradient model by reference.
pub struct Tables {
    sigmoid: Vec<real>,
    log: Vec<real>,
}

impl Default for Tables {
    fn default() -> Self {
        Tables::new()
    }
}

impl Tables {
    pub fn new() -> Self {
        let sigmoid = (0..=SIGMOID_TABLE_SIZE)
            .map(|i| {
                let x = (i as f64 * 2.0 * MAX_SIGMOID as f64) / SIGMOID_TABLE_SIZE as f64
                    - MAX_SIGMOID as f64;
                (1.0 / (1.0 + (-x).exp())) as real
            })
            .collect();
        let log = (0..=LOG_TABLE_SIZE)
            .map(|i| {
                let x = (i as f64 + 1e-5) / LOG_TABLE_SIZE as f64;
                x.ln() as real
            })
            .collect();
        Tables { sigmoid, log }
    }

    /// Approximate the logistic function, 1 / (1 + e^-x).
    pub fn sigmoid(&self, x: real) -> real {
        if x < -MAX_SIGMOID {
            0.0
        } else if x > MAX_SIGMOID {
            1.0
        } else {
            let i = ((x + MAX_SIGMOID) * SIGMOID_TABLE_SIZE as real / MAX_SIGMOID / 2.0) as usize;
            self.sigmoid[i]
        }
    }

    /// Approximate ln(x) for x in (0, 1]. Larger inputs give 0.
    pub fn log(&self, x: real) -> real {
        if x > 1.0 {
            return 0.0;
        }
        let i = (x * LOG_TABLE_SIZE as real) as usize;
        self.log[i]
    }
}
