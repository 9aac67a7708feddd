//! Latent space initialization.

use ndarray::Array4;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use tracing::info;

use crate::config::{LATENT_CHANNELS, VAE_SCALE_FACTOR};

/// Generates standard normal noise of `shape` from `seed`.
///
/// The same seed always produces a bit-identical tensor.
pub fn generate_noise(shape: (usize, usize, usize, usize), seed: u64) -> Array4<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    Array4::from_shape_simple_fn(shape, || StandardNormal.sample(&mut rng))
}

/// Returns `seed`, or draws and logs a fresh one.
pub fn resolve_seed(seed: Option<u64>) -> u64 {
    seed.unwrap_or_else(|| {
        let seed = rand::random::<u64>();
        info!(seed, "No seed supplied, drew a random seed");
        seed
    })
}

/// Latent shape for an output of `height`×`width` pixels.
pub fn latent_shape(height: usize, width: usize) -> (usize, usize, usize, usize) {
    (1, LATENT_CHANNELS, height / VAE_SCALE_FACTOR, width / VAE_SCALE_FACTOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_noise() {
        let a = generate_noise((1, 16, 8, 8), 42);
        let b = generate_noise((1, 16, 8, 8), 42);
        assert_eq!(a, b);
    }

    #[test]
    fn different_seed_different_noise() {
        let a = generate_noise((1, 16, 8, 8), 42);
        let b = generate_noise((1, 16, 8, 8), 43);
        assert_ne!(a, b);
    }

    #[test]
    fn noise_is_roughly_standard() {
        let noise = generate_noise((1, 16, 32, 32), 7);
        let mean = noise.mean().unwrap();
        let var = noise.mapv(|v| (v - mean) * (v - mean)).mean().unwrap();
        assert!(mean.abs() < 0.05, "mean {}", mean);
        assert!((var - 1.0).abs() < 0.1, "variance {}", var);
    }

    #[test]
    fn latent_shape_for_512() {
        assert_eq!(latent_shape(512, 768), (1, 16, 64, 96));
    }

    #[test]
    fn explicit_seed_is_kept() {
        assert_eq!(resolve_seed(Some(9)), 9);
    }
}
