//! Seeded latent noise that reproduces across devices.

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const LATENT_CHANNELS: usize = 16;

/// Latent shape for an image of `height`×`width` pixels.
pub fn latent_shape(height: usize, width: usize) -> (usize, usize, usize, usize) {
    (1, LATENT_CHANNELS, height.div_ceil(16) * 2, width.div_ceil(16) * 2)
}

/// Standard normal noise drawn on the host from `seed`, then moved to `device`.
pub fn gaussian(seed: u64, height: usize, width: usize, device: &Device) -> Result<Tensor> {
    let shape = latent_shape(height, width);
    let len = shape.0 * shape.1 * shape.2 * shape.3;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut values = Vec::with_capacity(len);
    while values.len() < len {
        // Box-Muller yields two samples per pair of uniforms
        let u1: f32 = rng.random_range(f32::EPSILON..1.0);
        let u2: f32 = rng.random();
        let radius = (-2.0 * u1.ln()).sqrt();
        let angle = std::f32::consts::TAU * u2;
        values.push(radius * angle.cos());
        if values.len() < len {
            values.push(radius * angle.sin());
        }
    }
    Ok(Tensor::from_vec(values, shape, device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_noise() {
        let a = gaussian(7, 64, 48, &Device::Cpu).unwrap();
        let b = gaussian(7, 64, 48, &Device::Cpu).unwrap();
        let c = gaussian(8, 64, 48, &Device::Cpu).unwrap();
        assert_eq!(a.dims(), &[1, 16, 8, 6]);
        let a = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = b.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let c = c.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn roughly_standard_normal() {
        let noise = gaussian(1, 256, 256, &Device::Cpu).unwrap();
        let values = noise.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let n = values.len() as f32;
        let mean = values.iter().sum::<f32>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.1, "var {var}");
    }
}
