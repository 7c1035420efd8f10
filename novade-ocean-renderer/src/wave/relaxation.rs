//! Finite-difference wave equation with random forcing.
//!
//! Per step: integrate `v += c²·dt·∇²h`, `h += v·dt` (sub-stepped to stay
//! under the stable step), remove the mean height, clamp total energy,
//! smooth sign-alternating samples along the tile seam and inject a few
//! 3×3 Gaussian impulses so the surface never settles.

use super::{rasterize_height_field, WaveSimulator};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

const WAVE_SPEED_SQUARED: f32 = 400.0;
/// Largest stable step for the 5-point Laplacian at `WAVE_SPEED_SQUARED`.
const MAX_STABLE_DT: f32 = 0.035;
const MAX_SUBSTEPS: usize = 16;
const MAX_RMS_ENERGY: f32 = 0.35;
/// Weight of velocity in the energy estimate (1/c²).
const VELOCITY_ENERGY_WEIGHT: f32 = 1.0 / WAVE_SPEED_SQUARED;
const DAMPING_PER_SECOND: f32 = 0.2;
const MAX_IMPULSES_PER_STEP: usize = 4;
const IMPULSE_STRENGTH: f32 = 3.0;
const GAUSSIAN_3X3: [[f32; 3]; 3] = [
    [1.0 / 16.0, 2.0 / 16.0, 1.0 / 16.0],
    [2.0 / 16.0, 4.0 / 16.0, 2.0 / 16.0],
    [1.0 / 16.0, 2.0 / 16.0, 1.0 / 16.0],
];

/// Number of equal sub-steps needed to integrate `dt` stably.
pub fn substeps_for(dt: f32) -> usize {
    if dt <= 0.0 || !dt.is_finite() {
        return 0;
    }
    ((dt / MAX_STABLE_DT).ceil() as usize).clamp(1, MAX_SUBSTEPS)
}

pub struct RelaxationWaveSimulator {
    size: usize,
    dt: f32,
    height: Vec<f32>,
    velocity: Vec<f32>,
    rng: StdRng,
    bitmap: Vec<u32>,
}

impl RelaxationWaveSimulator {
    /// # Panics
    ///
    /// If `size` is not a power of two.
    pub fn new(size: usize, seed: u64) -> Self {
        assert!(size.is_power_of_two(), "wave tank size must be a power of two, got {size}");
        let mut simulator = Self {
            size,
            dt: 0.0,
            height: vec![0.0; size * size],
            velocity: vec![0.0; size * size],
            rng: StdRng::seed_from_u64(seed),
            bitmap: vec![0; size * size],
        };
        for _ in 0..MAX_IMPULSES_PER_STEP * 4 {
            simulator.inject_impulse();
        }
        rasterize_height_field(&simulator.height, size, &mut simulator.bitmap);
        debug!("Relaxation wave simulator {}x{} seeded with {}.", size, size, seed);
        simulator
    }

    pub fn heights(&self) -> &[f32] {
        &self.height
    }

    fn integrate(&mut self, dt: f32) {
        let size = self.size;
        let mask = size - 1;
        let scale = WAVE_SPEED_SQUARED * dt;
        // x direction
        for y in 0..size {
            let row = y * size;
            for x in 0..size {
                let left = self.height[row + ((x + size - 1) & mask)];
                let right = self.height[row + ((x + 1) & mask)];
                self.velocity[row + x] += (left + right - 2.0 * self.height[row + x]) * scale;
            }
        }
        // y direction
        for y in 0..size {
            let up = ((y + size - 1) & mask) * size;
            let down = ((y + 1) & mask) * size;
            let row = y * size;
            for x in 0..size {
                self.velocity[row + x] += (self.height[up + x] + self.height[down + x] - 2.0 * self.height[row + x]) * scale;
            }
        }
        let damping = (1.0 - DAMPING_PER_SECOND * dt).max(0.0);
        for (h, v) in self.height.iter_mut().zip(self.velocity.iter_mut()) {
            *v *= damping;
            *h += *v * dt;
        }
    }

    fn inject_impulse(&mut self) {
        let size = self.size;
        let mask = size - 1;
        let cx = self.rng.random_range(0..size);
        let cy = self.rng.random_range(0..size);
        let strength = self.rng.random_range(-IMPULSE_STRENGTH..IMPULSE_STRENGTH);
        for (dy, weights) in GAUSSIAN_3X3.iter().enumerate() {
            let y = (cy + size + dy - 1) & mask;
            for (dx, weight) in weights.iter().enumerate() {
                let x = (cx + size + dx - 1) & mask;
                self.velocity[y * size + x] += strength * weight;
            }
        }
    }
}

/// Shifts `values` so they average to zero.
fn subtract_mean(values: &mut [f32]) {
    if values.is_empty() {
        return;
    }
    let mean = values.iter().sum::<f32>() / values.len() as f32;
    values.iter_mut().for_each(|v| *v -= mean);
}

/// Rescales height and velocity together when their RMS energy exceeds the
/// limit. Returns the applied factor.
fn clamp_energy(height: &mut [f32], velocity: &mut [f32], limit: f32) -> f32 {
    let count = height.len().max(1) as f32;
    let energy: f32 = height
        .iter()
        .zip(velocity.iter())
        .map(|(h, v)| h * h + v * v * VELOCITY_ENERGY_WEIGHT)
        .sum();
    let rms = (energy / count).sqrt();
    if rms <= limit || !rms.is_finite() {
        return 1.0;
    }
    let factor = limit / rms;
    height.iter_mut().for_each(|h| *h *= factor);
    velocity.iter_mut().for_each(|v| *v *= factor);
    factor
}

/// Replaces border samples whose sign differs from both neighbours across the
/// wrap-around seam by the neighbours' average. Returns how many changed.
fn denoise_seams(height: &mut [f32], size: usize) -> usize {
    if size < 3 {
        return 0;
    }
    let mut fixed = 0;
    let mut fix = |height: &mut [f32], index: usize, a: usize, b: usize| {
        let (here, before, after) = (height[index], height[a], height[b]);
        if here * before < 0.0 && here * after < 0.0 {
            height[index] = (before + after) * 0.5;
            fixed += 1;
        }
    };
    let last = size - 1;
    for i in 0..size {
        let row = i * size;
        fix(height, row, row + last, row + 1);
        fix(height, row + last, row + last - 1, row);
        fix(height, i, last * size + i, size + i);
        fix(height, last * size + i, (last - 1) * size + i, i);
    }
    fixed
}

impl WaveSimulator for RelaxationWaveSimulator {
    fn size(&self) -> usize {
        self.size
    }

    fn set_time_step(&mut self, dt: f32) {
        self.dt = dt;
    }

    fn step(&mut self) {
        let substeps = substeps_for(self.dt);
        if substeps > 0 {
            let sub_dt = self.dt.min(MAX_STABLE_DT * MAX_SUBSTEPS as f32) / substeps as f32;
            for _ in 0..substeps {
                self.integrate(sub_dt);
            }
        }
        subtract_mean(&mut self.height);
        let factor = clamp_energy(&mut self.height, &mut self.velocity, MAX_RMS_ENERGY);
        let seams = denoise_seams(&mut self.height, self.size);
        let impulses = self.rng.random_range(0..=MAX_IMPULSES_PER_STEP);
        for _ in 0..impulses {
            self.inject_impulse();
        }
        trace!("Relaxation step: {} substeps, energy factor {:.3}, {} seam fixes, {} impulses.", substeps, factor, seams, impulses);
        rasterize_height_field(&self.height, self.size, &mut self.bitmap);
    }

    fn bitmap(&self) -> &[u32] {
        &self.bitmap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_steps_are_split() {
        assert_eq!(substeps_for(0.0), 0);
        assert_eq!(substeps_for(-1.0), 0);
        assert_eq!(substeps_for(f32::NAN), 0);
        assert_eq!(substeps_for(1.0 / 60.0), 1);
        assert_eq!(substeps_for(0.05), 2);
        assert_eq!(substeps_for(0.1), 3);
        assert_eq!(substeps_for(100.0), MAX_SUBSTEPS);
    }

    #[test]
    fn mean_is_removed() {
        let mut values = vec![1.0, 2.0, 3.0, 6.0];
        subtract_mean(&mut values);
        assert_eq!(values, vec![-2.0, -1.0, 0.0, 3.0]);
    }

    #[test]
    fn energy_above_limit_is_rescaled() {
        let mut height = vec![1.0; 16];
        let mut velocity = vec![0.0; 16];
        let factor = clamp_energy(&mut height, &mut velocity, 0.5);
        assert!((factor - 0.5).abs() < 1e-6);
        assert!(height.iter().all(|h| (h - 0.5).abs() < 1e-6));

        let mut calm = vec![0.1; 16];
        let before = calm.clone();
        assert_eq!(clamp_energy(&mut calm, &mut velocity, 0.5), 1.0);
        assert_eq!(calm, before);
    }

    #[test]
    fn seam_spikes_are_averaged() {
        let size = 4;
        let mut height = vec![0.5; size * size];
        // Left-edge sample flipped against both its seam neighbours.
        height[size] = -0.5;
        // Interior sign flips are left alone.
        height[size + 1] = 0.5;
        height[2 * size + 1] = -0.5;
        let fixed = denoise_seams(&mut height, size);
        assert_eq!(fixed, 1);
        assert_eq!(height[size], 0.5);
        assert_eq!(height[2 * size + 1], -0.5);
    }

    #[test]
    fn gaussian_kernel_is_normalized() {
        let total: f32 = GAUSSIAN_3X3.iter().flatten().sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn simulation_stays_bounded() {
        let mut simulator = RelaxationWaveSimulator::new(32, 11);
        simulator.set_time_step(0.2);
        for _ in 0..200 {
            simulator.step();
        }
        let heights = simulator.heights();
        assert!(heights.iter().all(|h| h.is_finite()));
        let rms = (heights.iter().map(|h| h * h).sum::<f32>() / heights.len() as f32).sqrt();
        assert!(rms <= MAX_RMS_ENERGY * 1.5, "rms {rms}");
        assert!(simulator.bitmap().iter().any(|&p| p != simulator.bitmap()[0]));
    }

    #[test]
    fn same_seed_same_surface() {
        let mut a = RelaxationWaveSimulator::new(16, 5);
        let mut b = RelaxationWaveSimulator::new(16, 5);
        for simulator in [&mut a, &mut b] {
            simulator.set_time_step(1.0 / 60.0);
            simulator.step();
            simulator.step();
        }
        assert_eq!(a.bitmap(), b.bitmap());
    }
}
