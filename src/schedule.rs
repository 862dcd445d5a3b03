//! Noise-index schedules driving the stepping loop.
//!
//! A schedule is a sequence of indices into the time grid, descending from
//! the starting noise level down to 0. Revisit segments (for the ancestral
//! family) re-ascend by a fixed jump length before resuming the descent.

use ndarray::Array;

use crate::{Sde, PredictionKind};

/// Time value for each noise index, ascending: for the continuous families a
/// uniform grid from the floor `eps` up to 1; for the ancestral family the
/// step indices themselves.
pub fn time_grid(sde: &Sde, num_steps: usize, eps: f32) -> Vec<f32> {
    match sde.prediction_kind() {
        PredictionKind::Score => Array::linspace(eps, 1.0, num_steps).to_vec(),
        PredictionKind::Epsilon => (0..num_steps).map(|k| k as f32).collect(),
    }
}

/// Plain descent: `[num_steps - 1 - start_time_step, ..., 1, 0]`.
///
/// A positive `start_time_step` drops that many of the noisiest levels,
/// which is how sampling resumes mid-chain from an initial estimate.
pub fn descending(num_steps: usize, start_time_step: usize) -> Vec<usize> {
    (0..num_steps - start_time_step).rev().collect()
}

/// Descent with revisits: whenever the descent reaches a designated jump
/// point (every `travel_length` levels), re-ascend by `travel_length` and
/// descend again, `travel_repeat` times, before carrying on down to 0.
pub fn with_time_travel(num_steps: usize, travel_length: usize, travel_repeat: usize) -> Vec<usize> {
    let mut revisits_left = vec![0usize; num_steps];
    let mut j = 0;
    while j + travel_length < num_steps {
        revisits_left[j] = travel_repeat;
        j += travel_length;
    }

    let mut schedule = Vec::with_capacity(num_steps);
    let mut k = num_steps;
    while k >= 1 {
        k -= 1;
        schedule.push(k);
        if revisits_left[k] > 0 {
            revisits_left[k] -= 1;
            for _ in 0..travel_length {
                k += 1;
                schedule.push(k);
            }
        }
    }
    schedule
}
