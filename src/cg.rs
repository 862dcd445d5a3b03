//! Conjugate gradient for the symmetric positive-definite systems that turn
//! up inside data-consistency projections.
//!
//! The operator is supplied as a closure so that `A^t A + gamma I` never has
//! to be materialized. Reaching the iteration cap is not a failure: the best
//! iterate so far is returned and the caller carries on.

use ndarray::azip;

use crate::ImageBatch;

pub fn conjugate_gradient<F>(
    apply: F,
    rhs: &ImageBatch,
    x0: &ImageBatch,
    max_iter: usize,
    tol: f32,
) -> ImageBatch
where
    F: Fn(&ImageBatch) -> ImageBatch,
{
    let mut x = x0.clone();
    if max_iter == 0 { return x; }

    let mut r = rhs - &apply(&x);
    let mut p = r.clone();
    let mut rs_old = dot(&r, &r);
    if rs_old.sqrt() <= tol { return x; }

    for _ in 0..max_iter {
        let ap = apply(&p);
        let curvature = dot(&p, &ap);
        // Rounding can push a nearly-singular system off positive-definite
        if curvature <= 0.0 { break; }
        let alpha = rs_old / curvature;
        x.scaled_add( alpha, &p);
        r.scaled_add(-alpha, &ap);
        let rs_new = dot(&r, &r);
        if rs_new.sqrt() <= tol { break; }
        let ratio = rs_new / rs_old;
        azip!((pi in &mut p, &ri in &r) *pi = ri + ratio * *pi);
        rs_old = rs_new;
    }
    x
}

fn dot(a: &ImageBatch, b: &ImageBatch) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;
    use ndarray::array;

    // 4x4 SPD matrix acting on a (1,1,4,1) batch
    const A: [[f32; 4]; 4] = [
        [ 4.0,  1.0,  0.0,  0.5],
        [ 1.0,  3.0,  0.5,  0.0],
        [ 0.0,  0.5,  5.0,  1.0],
        [ 0.5,  0.0,  1.0,  2.0],
    ];

    fn apply_a(x: &ImageBatch) -> ImageBatch {
        let mut out = ImageBatch::zeros((1, 1, 4, 1));
        for i in 0..4 {
            for j in 0..4 {
                out[(0, 0, i, 0)] += A[i][j] * x[(0, 0, j, 0)];
            }
        }
        out
    }

    fn as_batch(v: [f32; 4]) -> ImageBatch {
        array![v[0], v[1], v[2], v[3]].into_shape((1, 1, 4, 1)).unwrap()
    }

    #[test]
    fn solves_spd_system_when_cap_covers_dimension() {
        let solution = as_batch([1.0, -2.0, 0.5, 3.0]);
        let rhs = apply_a(&solution);
        let x = conjugate_gradient(apply_a, &rhs, &ImageBatch::zeros((1, 1, 4, 1)), 4, 0.0);
        for (got, want) in x.iter().zip(solution.iter()) {
            assert_float_eq!(got, want, abs <= 1e-4);
        }
    }

    #[test]
    fn zero_iteration_cap_returns_initial_guess() {
        let x0 = as_batch([7.0, 8.0, 9.0, 10.0]);
        let rhs = as_batch([1.0, 1.0, 1.0, 1.0]);
        let x = conjugate_gradient(apply_a, &rhs, &x0, 0, 0.0);
        assert_eq!(x, x0);
    }

    #[test]
    fn capped_solve_returns_best_effort_without_panicking() {
        let solution = as_batch([1.0, -2.0, 0.5, 3.0]);
        let rhs = apply_a(&solution);
        let x0 = ImageBatch::zeros((1, 1, 4, 1));
        let partial = conjugate_gradient(apply_a, &rhs, &x0, 1, 0.0);
        // One iteration must not diverge: residual should shrink vs the guess
        let res = |x: &ImageBatch| {
            let r = &rhs - &apply_a(x);
            r.iter().map(|v| v * v).sum::<f32>().sqrt()
        };
        assert!(res(&partial) < res(&x0));
    }

    #[test]
    fn identity_plus_regularization_has_closed_form() {
        // (I + gamma I) x = rhs  =>  x = rhs / (1 + gamma)
        let gamma = 0.25;
        let apply = |x: &ImageBatch| x * (1.0 + gamma);
        let rhs = as_batch([2.0, -1.0, 4.0, 0.0]);
        let x = conjugate_gradient(apply, &rhs, &ImageBatch::zeros((1, 1, 4, 1)), 8, 1e-8);
        for (got, want) in x.iter().zip(rhs.iter()) {
            assert_float_eq!(*got, want / 1.25, abs <= 1e-5);
        }
    }
}
