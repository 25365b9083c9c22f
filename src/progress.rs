use crate::volume::next_power_of_two;

use std::{
    fmt,
    sync::{Mutex, PoisonError},
    time::Duration,
};

/// Phase of the pipeline plus how far along it is.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Progress {
    #[default]
    Idle,
    CreatingModel {
        fraction: f32,
    },
    LoadingSlice {
        fraction: f32,
    },
    /// `elapsed` is `None` when the low-res fill already met the target scale.
    Completed {
        elapsed: Option<Duration>,
    },
    Failed {
        message: String,
    },
}

impl Progress {
    pub fn is_finished(&self) -> bool {
        matches!(self, Progress::Completed { .. } | Progress::Failed { .. })
    }

    /// Fraction complete of the current phase; finished phases report 1.
    pub fn fraction(&self) -> f32 {
        match self {
            Progress::Idle => 0.0,
            Progress::CreatingModel { fraction } | Progress::LoadingSlice { fraction } => {
                *fraction
            }
            Progress::Completed { .. } | Progress::Failed { .. } => 1.0,
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Progress::Idle => write!(f, "Idle"),
            Progress::CreatingModel { fraction } => {
                write!(f, "Creating model: {:.1}%", fraction * 100.0)
            }
            Progress::LoadingSlice { fraction } => {
                write!(f, "Loading slice: {:.1}%", fraction * 100.0)
            }
            Progress::Completed { elapsed: None } => write!(f, "Loading slice: Completed"),
            Progress::Completed {
                elapsed: Some(elapsed),
            } => write!(
                f,
                "Loading slice: Completed in {:.1} seconds.",
                elapsed.as_secs_f32()
            ),
            Progress::Failed { message } => write!(f, "Encountered error: {message}"),
        }
    }
}

/// Latest progress, tagged with the epoch that wrote it. Writes from older
/// epochs are dropped so a cancelled job can't overwrite the current status.
#[derive(Debug, Default)]
pub struct ProgressCell {
    inner: Mutex<(u64, Progress)>,
}

impl ProgressCell {
    pub fn get(&self) -> Progress {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .1
            .clone()
    }

    pub fn epoch(&self) -> u64 {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).0
    }

    /// Start reporting for `epoch`, unless a newer epoch already did.
    pub fn begin(&self, epoch: u64, progress: Progress) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if epoch >= inner.0 {
            *inner = (epoch, progress);
        }
    }

    /// Report for `epoch` if it is still current. Within one phase the
    /// fraction never goes backwards.
    pub fn update(&self, epoch: u64, progress: Progress) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if epoch != inner.0 {
            return;
        }
        let regresses = match (&inner.1, &progress) {
            (Progress::CreatingModel { fraction: old }, Progress::CreatingModel { fraction: new })
            | (Progress::LoadingSlice { fraction: old }, Progress::LoadingSlice { fraction: new }) => {
                new < old
            }
            _ => false,
        };
        if !regresses {
            inner.1 = progress;
        }
    }
}

/// Scales of the refinement passes: one octave above the low-res cache,
/// doubling up to and including `target`. Empty when the cache already meets
/// the target.
pub fn pass_scales(lowres_scale: f32, target: f32) -> Vec<f32> {
    let mut scales = Vec::new();
    if lowres_scale >= target {
        return scales;
    }
    let mut scale = (2.0 / next_power_of_two(1.0 / lowres_scale)).min(target);
    loop {
        scales.push(scale);
        if scale >= target {
            return scales;
        }
        scale = (scale * 2.0).min(target);
    }
}

/// Overall refinement progress when `chunks_done` of `visible_chunks` are
/// finished in pass `iteration`. Pass `i` costs `4^i` times the first one.
/// With no visible chunks every pass counts the same.
pub fn refinement_fraction(
    iteration: usize,
    chunks_done: usize,
    visible_chunks: usize,
    final_iteration: usize,
) -> f32 {
    if visible_chunks == 0 {
        return (iteration as f32 / (final_iteration + 1) as f32).clamp(0.0, 1.0);
    }
    let weight = |i: usize| 4f64.powi(i as i32);
    let visible = visible_chunks as f64;
    let previous: f64 = (0..iteration).map(|i| weight(i) * visible).sum();
    let total: f64 = (0..=final_iteration).map(|i| weight(i) * visible).sum();
    let done = weight(iteration) * chunks_done as f64 + previous;
    (done / total).clamp(0.0, 1.0) as f32
}
