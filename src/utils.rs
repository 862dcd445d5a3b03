use ndarray::{ArrayBase, Data, Dimension};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::ImageBatch;

/// Standard-normal tensor of the given shape.
pub fn randn(shape: (usize, usize, usize, usize), rng: &mut impl Rng) -> ImageBatch {
    ImageBatch::from_shape_simple_fn(shape, || rng.sample::<f32, _>(StandardNormal))
}

/// Standard-normal tensor shaped like `x`.
pub fn randn_like(x: &ImageBatch, rng: &mut impl Rng) -> ImageBatch {
    randn(x.raw_dim().into_pattern(), rng)
}

/// Euclidean norm over all elements.
pub fn l2_norm<S, D>(x: &ArrayBase<S, D>) -> f32
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    x.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// Group numeric digits to facilitate reading long numbers
pub fn group_digits<F: std::fmt::Display>(n: F) -> String {
    use numsep::{separate, Locale};
    separate(n, Locale::English)
}

pub mod timing {

    use super::group_digits;
    use std::time::Instant;
    use std::io::Write;

    pub struct Progress {
        previous: Instant,
    }

    impl Progress {

        #[allow(clippy::new_without_default)]
        pub fn new() -> Self { Self { previous: Instant::now() } }

        /// Print message, append ellipsis, flush stdout, stay on same line, start timer.
        pub fn start(&mut self, message: &str) {
            print!("{message} ... ");
            std::io::stdout().flush().unwrap();
            self.start_timer();
        }

        // Print time elapsed since last start or done
        pub fn done(&mut self) {
            println!("{} ms", group_digits(self.previous.elapsed().as_millis()));
            self.start_timer();
        }

        // Print message followed by time elapsed since last start or done
        pub fn done_with_message(&mut self, message: &str) {
            println!("{message}: {} ms",
                     group_digits(self.previous.elapsed().as_millis()));
            self.start_timer();
        }

        fn start_timer(&mut self) { self.previous = Instant::now() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn randn_is_reproducible_for_a_fixed_seed() {
        let a = randn((1, 1, 4, 4), &mut StdRng::seed_from_u64(5));
        let b = randn((1, 1, 4, 4), &mut StdRng::seed_from_u64(5));
        assert_eq!(a, b);
    }

    #[test]
    fn l2_norm_of_unit_vector() {
        let mut x = ImageBatch::zeros((1, 1, 3, 3));
        x[(0, 0, 1, 1)] = -1.0;
        float_eq::assert_float_eq!(l2_norm(&x), 1.0, abs <= 1e-7);
    }
}
