use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;

use crate::trainer::Trainer;

/// An ordered group of trainers that advance together: the one with the
/// least progress always steps next, so no trainer runs ahead of the others
/// by more than one step.
pub struct Scheduler<'s> {
    trainers: Vec<Trainer<'s>>,
}

impl<'s> Scheduler<'s> {
    pub fn new(trainers: Vec<Trainer<'s>>) -> Self {
        Scheduler { trainers }
    }

    pub fn trainers(&self) -> &[Trainer<'s>] {
        &self.trainers
    }

    /// Index and progress of the least advanced trainer. Ties go to the
    /// trainer that comes first.
    fn least_advanced(&self) -> Option<(usize, f64)> {
        let mut best: Option<(usize, f64)> = None;
        for (i, trainer) in self.trainers.iter().enumerate() {
            let progress = trainer.progress();
            match best {
                Some((_, p)) if p <= progress => {}
                _ => best = Some((i, progress)),
            }
        }
        best
    }

    /// Minimum progress over the group; 1.0 for an empty group.
    pub fn min_progress(&self) -> f64 {
        self.least_advanced().map_or(1.0, |(_, p)| p)
    }

    /// Step the least advanced trainer once, unless every trainer is done.
    /// Returns the index of the trainer that stepped.
    pub fn step_once(&mut self) -> Result<Option<usize>> {
        match self.least_advanced() {
            Some((i, progress)) if progress < 1.0 => {
                self.trainers[i].step()?;
                Ok(Some(i))
            }
            _ => Ok(None),
        }
    }

    /// Step until every trainer has finished its epochs.
    pub fn run(&mut self) -> Result<()> {
        self.run_until(&AtomicBool::new(false))
    }

    /// Like [`Scheduler::run`], but stop early once `abort` is set. The flag
    /// is checked between steps.
    pub fn run_until(&mut self, abort: &AtomicBool) -> Result<()> {
        while !abort.load(Ordering::Relaxed) {
            if self.step_once()?.is_none() {
                break;
            }
        }
        Ok(())
    }

    /// Write every trainer's artifacts, each under its role's suffix.
    pub fn close(self) -> Result<()> {
        for trainer in self.trainers {
            let suffix = trainer.config().role.suffix();
            trainer.close(&suffix)?;
        }
        Ok(())
    }
}
