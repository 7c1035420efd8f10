//! Spectral wave synthesis.
//!
//! The height field is the inverse FFT of a half spectrum whose cells rotate
//! at an angular velocity proportional to their wavenumber. Magnitudes follow
//! a Phillips-style spectrum seeded from a fixed RNG, normalized so the height
//! field stays around [`TARGET_HEIGHT_RMS`].

use super::fft::{Complex, HalfSpectrumTransform};
use super::{rasterize_height_field, WaveSimulator};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f32::consts::TAU;
use tracing::debug;

const TARGET_HEIGHT_RMS: f32 = 0.3;
/// Radians per second per unit wavenumber.
const PHASE_SPEED: f32 = 3.0;
/// Dominant wavelength as a fraction of the tile.
const DOMINANT_WAVELENGTH: f32 = 0.15;
const WIND_DIRECTION: (f32, f32) = (0.8, 0.6);

/// One half-spectrum bin.
#[derive(Debug, Clone, Copy)]
struct SpectralCell {
    magnitude: f32,
    phase: f32,
    phase_per_second: f32,
    rotation: [[f32; 2]; 2],
}

impl SpectralCell {
    fn advance(&mut self, dt: f32) {
        self.phase = (self.phase + self.phase_per_second * dt).rem_euclid(TAU);
    }

    fn sample(&self) -> Complex {
        let (sin, cos) = self.phase.sin_cos();
        let (re, im) = (self.magnitude * cos, self.magnitude * sin);
        Complex::new(
            self.rotation[0][0] * re + self.rotation[0][1] * im,
            self.rotation[1][0] * re + self.rotation[1][1] * im,
        )
    }
}

fn phillips(kx: f32, ky: f32, size: usize) -> f32 {
    let k2 = kx * kx + ky * ky;
    if k2 == 0.0 {
        return 0.0;
    }
    let peak = TAU / (DOMINANT_WAVELENGTH * size as f32);
    let along_wind = (kx * WIND_DIRECTION.0 + ky * WIND_DIRECTION.1) / k2.sqrt();
    (-(peak * peak) / k2).exp() / (k2 * k2) * (0.2 + along_wind * along_wind)
}

fn gaussian(rng: &mut StdRng) -> f32 {
    let u1: f32 = 1.0 - rng.random::<f32>();
    let u2: f32 = rng.random();
    (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()
}

pub struct SpectralWaveSimulator {
    size: usize,
    dt: f32,
    cells: Vec<SpectralCell>,
    spectrum: Vec<Complex>,
    transform: HalfSpectrumTransform,
    heights: Vec<f32>,
    bitmap: Vec<u32>,
}

impl SpectralWaveSimulator {
    /// # Panics
    ///
    /// If `size` is not a power of two.
    pub fn new(size: usize, seed: u64) -> Self {
        let transform = HalfSpectrumTransform::new(size);
        let half_width = transform.half_width();
        let mut rng = StdRng::seed_from_u64(seed);
        let wavenumber = |index: usize| {
            let signed = if index > size / 2 { index as f32 - size as f32 } else { index as f32 };
            signed * TAU / size as f32
        };

        let mut cells = Vec::with_capacity(half_width * size);
        for ky in 0..size {
            for kx in 0..half_width {
                let (kx_f, ky_f) = (wavenumber(kx), wavenumber(ky));
                let k = (kx_f * kx_f + ky_f * ky_f).sqrt();
                let theta = rng.random_range(0.0..TAU);
                let (sin, cos) = theta.sin_cos();
                cells.push(SpectralCell {
                    magnitude: gaussian(&mut rng).abs() * phillips(kx_f, ky_f, size).sqrt(),
                    phase: rng.random_range(0.0..TAU),
                    phase_per_second: PHASE_SPEED * k * size as f32 / TAU,
                    rotation: [[cos, -sin], [sin, cos]],
                });
            }
        }

        // Each stored bin except the DC/Nyquist columns stands for itself and its mirror.
        let energy: f32 = cells.iter().map(|c| 2.0 * c.magnitude * c.magnitude).sum();
        if energy > 0.0 {
            let scale = TARGET_HEIGHT_RMS / energy.sqrt();
            cells.iter_mut().for_each(|c| c.magnitude *= scale);
        }
        debug!("Spectral wave simulator {}x{} seeded with {}.", size, size, seed);

        let mut simulator = Self {
            size,
            dt: 0.0,
            cells,
            spectrum: vec![Complex::ZERO; half_width * size],
            transform,
            heights: vec![0.0; size * size],
            bitmap: vec![0; size * size],
        };
        simulator.synthesize();
        simulator
    }

    fn synthesize(&mut self) {
        for (bin, cell) in self.spectrum.iter_mut().zip(&self.cells) {
            *bin = cell.sample();
        }
        self.transform.inverse(&self.spectrum, &mut self.heights);
        rasterize_height_field(&self.heights, self.size, &mut self.bitmap);
    }

    pub fn heights(&self) -> &[f32] {
        &self.heights
    }
}

impl WaveSimulator for SpectralWaveSimulator {
    fn size(&self) -> usize {
        self.size
    }

    fn set_time_step(&mut self, dt: f32) {
        self.dt = dt;
    }

    fn step(&mut self) {
        let dt = self.dt;
        self.cells.iter_mut().for_each(|cell| cell.advance(dt));
        self.synthesize();
    }

    fn bitmap(&self) -> &[u32] {
        &self.bitmap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rms(values: &[f32]) -> f32 {
        (values.iter().map(|v| v * v).sum::<f32>() / values.len() as f32).sqrt()
    }

    #[test]
    fn same_seed_same_waves() {
        let mut a = SpectralWaveSimulator::new(32, 42);
        let mut b = SpectralWaveSimulator::new(32, 42);
        let c = SpectralWaveSimulator::new(32, 43);
        assert_eq!(a.bitmap(), b.bitmap());
        assert_ne!(a.heights(), c.heights());
        a.set_time_step(0.5);
        b.set_time_step(0.5);
        a.step();
        b.step();
        assert_eq!(a.bitmap(), b.bitmap());
    }

    #[test]
    fn field_is_bounded_and_moves() {
        let mut simulator = SpectralWaveSimulator::new(64, 7);
        let before = simulator.heights().to_vec();
        assert!(before.iter().all(|h| h.is_finite()));
        let initial_rms = rms(&before);
        assert!(initial_rms > 0.05 && initial_rms < 1.0, "rms {initial_rms}");

        simulator.set_time_step(1.0 / 60.0);
        for _ in 0..30 {
            simulator.step();
        }
        assert_ne!(simulator.heights(), &before[..]);
        // Phase rotation preserves every bin's magnitude, so energy is stable.
        assert!((rms(simulator.heights()) - initial_rms).abs() < initial_rms * 0.5);
    }

    #[test]
    fn zero_time_step_is_stationary() {
        let mut simulator = SpectralWaveSimulator::new(16, 3);
        let before = simulator.bitmap().to_vec();
        simulator.set_time_step(0.0);
        simulator.step();
        assert_eq!(simulator.bitmap(), &before[..]);
    }

    #[test]
    fn rotation_keeps_sample_magnitude() {
        let (sin, cos) = 1.1f32.sin_cos();
        let cell = SpectralCell { magnitude: 2.0, phase: 0.4, phase_per_second: 0.0, rotation: [[cos, -sin], [sin, cos]] };
        let sample = cell.sample();
        assert!(((sample.re * sample.re + sample.im * sample.im).sqrt() - 2.0).abs() < 1e-5);
    }
}
