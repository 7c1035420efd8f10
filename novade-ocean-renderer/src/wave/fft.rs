//! Radix-2 inverse FFT and the real-valued 2-D inverse transform of a
//! half spectrum.

use std::f32::consts::TAU;
use std::ops::{Add, Mul, Sub};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Complex {
    pub re: f32,
    pub im: f32,
}

impl Complex {
    pub const ZERO: Complex = Complex { re: 0.0, im: 0.0 };

    pub fn new(re: f32, im: f32) -> Self {
        Self { re, im }
    }

    pub fn from_polar(magnitude: f32, phase: f32) -> Self {
        let (sin, cos) = phase.sin_cos();
        Self { re: magnitude * cos, im: magnitude * sin }
    }

    pub fn conj(self) -> Self {
        Self { re: self.re, im: -self.im }
    }
}

impl Add for Complex {
    type Output = Complex;
    fn add(self, rhs: Complex) -> Complex {
        Complex { re: self.re + rhs.re, im: self.im + rhs.im }
    }
}

impl Sub for Complex {
    type Output = Complex;
    fn sub(self, rhs: Complex) -> Complex {
        Complex { re: self.re - rhs.re, im: self.im - rhs.im }
    }
}

impl Mul for Complex {
    type Output = Complex;
    fn mul(self, rhs: Complex) -> Complex {
        Complex {
            re: self.re * rhs.re - self.im * rhs.im,
            im: self.re * rhs.im + self.im * rhs.re,
        }
    }
}

/// Unnormalized inverse transform (`exp(+i...)`) of a power-of-two length.
#[derive(Debug, Clone)]
pub struct InverseFft {
    size: usize,
    twiddles: Vec<Complex>,
    bit_reverse: Vec<usize>,
}

impl InverseFft {
    /// # Panics
    ///
    /// If `size` is not a power of two.
    pub fn new(size: usize) -> Self {
        assert!(size.is_power_of_two(), "FFT size must be a power of two, got {size}");
        let bits = size.trailing_zeros();
        let bit_reverse = (0..size)
            .map(|i| if bits == 0 { 0 } else { i.reverse_bits() >> (usize::BITS - bits) })
            .collect();
        let twiddles = (0..size / 2).map(|k| Complex::from_polar(1.0, TAU * k as f32 / size as f32)).collect();
        Self { size, twiddles, bit_reverse }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn transform(&self, data: &mut [Complex]) {
        let n = self.size;
        debug_assert_eq!(data.len(), n);
        for i in 0..n {
            let j = self.bit_reverse[i];
            if i < j {
                data.swap(i, j);
            }
        }
        let mut len = 2;
        while len <= n {
            let half = len / 2;
            let stride = n / len;
            for start in (0..n).step_by(len) {
                for k in 0..half {
                    let a = data[start + k];
                    let b = data[start + k + half] * self.twiddles[k * stride];
                    data[start + k] = a + b;
                    data[start + k + half] = a - b;
                }
            }
            len <<= 1;
        }
    }
}

/// Reconstructs a real `size`×`size` field from its half spectrum.
///
/// `half` holds `size / 2 + 1` columns (non-negative `kx`) for every `ky`, row
/// major by `ky`. Columns are transformed along `y` first; the missing
/// columns follow from `G(size - kx, y) = conj(G(kx, y))`, after which each
/// row is transformed along `x`.
pub struct HalfSpectrumTransform {
    fft: InverseFft,
    columns: Vec<Complex>,
    column: Vec<Complex>,
    row: Vec<Complex>,
}

impl HalfSpectrumTransform {
    pub fn new(size: usize) -> Self {
        let half_width = size / 2 + 1;
        Self {
            fft: InverseFft::new(size),
            columns: vec![Complex::ZERO; half_width * size],
            column: vec![Complex::ZERO; size],
            row: vec![Complex::ZERO; size],
        }
    }

    pub fn half_width(&self) -> usize {
        self.fft.size() / 2 + 1
    }

    pub fn inverse(&mut self, half: &[Complex], out: &mut [f32]) {
        let size = self.fft.size();
        let half_width = self.half_width();
        debug_assert_eq!(half.len(), half_width * size);
        debug_assert_eq!(out.len(), size * size);

        // `columns` is stored transposed: columns[kx * size + y].
        for kx in 0..half_width {
            for ky in 0..size {
                self.column[ky] = half[ky * half_width + kx];
            }
            self.fft.transform(&mut self.column);
            self.columns[kx * size..(kx + 1) * size].copy_from_slice(&self.column);
        }

        for y in 0..size {
            for kx in 0..size {
                self.row[kx] = if kx < half_width {
                    self.columns[kx * size + y]
                } else {
                    self.columns[(size - kx) * size + y].conj()
                };
            }
            self.fft.transform(&mut self.row);
            for (x, value) in self.row.iter().enumerate() {
                out[y * size + x] = value.re;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn single_bin_is_a_complex_exponential() {
        let n = 8;
        let fft = InverseFft::new(n);
        let mut data = vec![Complex::ZERO; n];
        data[1] = Complex::new(1.0, 0.0);
        fft.transform(&mut data);
        for (x, value) in data.iter().enumerate() {
            let expected = Complex::from_polar(1.0, TAU * x as f32 / n as f32);
            assert!(close(value.re, expected.re) && close(value.im, expected.im), "x = {x}: {value:?}");
        }
    }

    #[test]
    fn length_one_is_identity() {
        let fft = InverseFft::new(1);
        let mut data = vec![Complex::new(3.0, -2.0)];
        fft.transform(&mut data);
        assert_eq!(data[0], Complex::new(3.0, -2.0));
    }

    #[test]
    fn half_spectrum_reconstructs_real_cosines() {
        let size = 16;
        let mut transform = HalfSpectrumTransform::new(size);
        let half_width = transform.half_width();
        let mut half = vec![Complex::ZERO; half_width * size];
        half[0] = Complex::new(0.25, 0.0);
        // kx = 1, ky = 2 with amplitude 0.5: its mirror supplies the other half.
        half[2 * half_width + 1] = Complex::new(0.5, 0.0);
        let mut out = vec![0.0; size * size];
        transform.inverse(&half, &mut out);
        for y in 0..size {
            for x in 0..size {
                let phase = TAU * (x + 2 * y) as f32 / size as f32;
                let expected = 0.25 + phase.cos();
                assert!(close(out[y * size + x], expected), "({x}, {y}): {} vs {expected}", out[y * size + x]);
            }
        }
    }
}
