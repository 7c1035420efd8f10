//! Ocean wave simulation.
//!
//! Each [`WaveTank`] owns one [`WaveSimulator`] and a worker thread. The render
//! thread calls [`WaveTank::start`] to advance the simulation one step in the
//! background and [`WaveTank::join`] to wait for it; the bitmap is only
//! reachable while the tank is idle, so it can never be read half-written.

pub mod fft;
pub mod relaxation;
pub mod spectral;

use crate::config::WaveSolver;
use crate::error::{Result, VulkanError};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;
use tracing::{debug, error, trace};

pub use relaxation::RelaxationWaveSimulator;
pub use spectral::SpectralWaveSimulator;

/// A square height-field simulation producing a packed RGBA8 bitmap.
pub trait WaveSimulator: Send {
    /// Edge length of the simulated grid.
    fn size(&self) -> usize;
    /// Time to advance on the next [`step`](Self::step), in seconds.
    fn set_time_step(&mut self, dt: f32);
    /// Advances the simulation and rasterizes the result into the bitmap.
    fn step(&mut self);
    /// `size * size` pixels, row-major, `u32::from_le_bytes([r, g, b, a])`.
    fn bitmap(&self) -> &[u32];
}

/// Builds the simulator selected by `solver`.
pub fn create_simulator(solver: WaveSolver, size: usize, seed: u64) -> Box<dyn WaveSimulator> {
    match solver {
        WaveSolver::Spectral => Box::new(SpectralWaveSimulator::new(size, seed)),
        WaveSolver::Relaxation => Box::new(RelaxationWaveSimulator::new(size, seed)),
    }
}

/// Quantizes `value` in `[-1, 1]` to `[0, 255]`, rounding to nearest.
pub fn encode_8bit(value: f32) -> u8 {
    ((value + 1.0) * 0.5 * 255.0 + 0.5).floor().clamp(0.0, 255.0) as u8
}

/// Writes the packed normal and height of a wrapping height field.
///
/// Channels: x-slope, y-slope, z component of the surface normal and the
/// height itself, each mapped from `[-1, 1]` by [`encode_8bit`].
pub fn rasterize_height_field(heights: &[f32], size: usize, bitmap: &mut [u32]) {
    debug_assert_eq!(heights.len(), size * size);
    debug_assert_eq!(bitmap.len(), size * size);
    let mask = size - 1;
    for y in 0..size {
        let up = ((y + size - 1) & mask) * size;
        let down = ((y + 1) & mask) * size;
        let row = y * size;
        for x in 0..size {
            let left = (x + size - 1) & mask;
            let right = (x + 1) & mask;
            let dx = (heights[row + right] - heights[row + left]) * 0.5;
            let dy = (heights[down + x] - heights[up + x]) * 0.5;
            let inv_len = 1.0 / (dx * dx + dy * dy + 1.0).sqrt();
            bitmap[row + x] = u32::from_le_bytes([
                encode_8bit(-dx * inv_len),
                encode_8bit(-dy * inv_len),
                encode_8bit(inv_len),
                encode_8bit(heights[row + x]),
            ]);
        }
    }
}

/// One simulator running on its own worker thread.
pub struct WaveTank {
    index: usize,
    size: usize,
    simulator: Option<Box<dyn WaveSimulator>>,
    jobs: Option<Sender<Box<dyn WaveSimulator>>>,
    results: Receiver<Box<dyn WaveSimulator>>,
    worker: Option<JoinHandle<()>>,
    runs_started: u64,
    runs_joined: u64,
}

impl WaveTank {
    pub fn new(index: usize, simulator: Box<dyn WaveSimulator>) -> Result<Self> {
        let (job_tx, job_rx) = mpsc::channel::<Box<dyn WaveSimulator>>();
        let (result_tx, result_rx) = mpsc::channel();
        let worker = std::thread::Builder::new()
            .name(format!("wave-tank-{index}"))
            .spawn(move || {
                for mut simulator in job_rx {
                    simulator.step();
                    if result_tx.send(simulator).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| VulkanError::WaveTaskFailed(format!("failed to spawn worker for tank {index}: {e}")))?;
        debug!("Wave tank {} ready ({}x{}).", index, simulator.size(), simulator.size());
        Ok(Self {
            index,
            size: simulator.size(),
            simulator: Some(simulator),
            jobs: Some(job_tx),
            results: result_rx,
            worker: Some(worker),
            runs_started: 0,
            runs_joined: 0,
        })
    }

    /// Starts one simulation step of `dt` seconds. A step still in flight is
    /// joined first.
    pub fn start(&mut self, dt: f32) -> Result<()> {
        if self.is_running() {
            self.join()?;
        }
        let Some(jobs) = self.jobs.as_ref() else {
            return Err(self.failure("worker channel closed"));
        };
        let Some(mut simulator) = self.simulator.take() else {
            return Err(self.failure("tank has no simulator"));
        };
        simulator.set_time_step(dt);
        jobs.send(simulator).map_err(|_| self.failure("worker thread exited"))?;
        self.runs_started += 1;
        trace!("Wave tank {} started run {}.", self.index, self.runs_started);
        Ok(())
    }

    /// Blocks until the running step finished. No-op when idle.
    pub fn join(&mut self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        let simulator = self.results.recv().map_err(|_| self.failure("worker thread terminated mid-step"))?;
        self.simulator = Some(simulator);
        self.runs_joined += 1;
        Ok(())
    }

    /// The last produced bitmap, or `None` while a step is in flight.
    pub fn bitmap(&self) -> Option<&[u32]> {
        self.simulator.as_deref().map(|s| s.bitmap())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_running(&self) -> bool {
        self.runs_started > self.runs_joined
    }

    pub fn runs_started(&self) -> u64 {
        self.runs_started
    }

    pub fn runs_joined(&self) -> u64 {
        self.runs_joined
    }

    fn failure(&self, what: &str) -> VulkanError {
        error!("Wave tank {}: {}", self.index, what);
        VulkanError::WaveTaskFailed(format!("tank {}: {}", self.index, what))
    }
}

impl Drop for WaveTank {
    fn drop(&mut self) {
        if let Err(e) = self.join() {
            debug!("Ignoring wave tank error during shutdown: {}", e);
        }
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Wave tank {} worker panicked.", self.index);
            }
        }
    }
}

impl std::fmt::Debug for WaveTank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaveTank")
            .field("index", &self.index)
            .field("size", &self.size)
            .field("runs_started", &self.runs_started)
            .field("runs_joined", &self.runs_joined)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Fills the bitmap with its step counter; flags overlapping steps.
    struct CountingSimulator {
        steps: u32,
        dt: f32,
        bitmap: Vec<u32>,
        active: Arc<AtomicBool>,
        overlaps: Arc<AtomicUsize>,
    }

    impl WaveSimulator for CountingSimulator {
        fn size(&self) -> usize {
            4
        }
        fn set_time_step(&mut self, dt: f32) {
            self.dt = dt;
        }
        fn step(&mut self) {
            if self.active.swap(true, Ordering::SeqCst) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_millis(2));
            self.steps += 1;
            self.bitmap.iter_mut().for_each(|p| *p = self.steps);
            self.active.store(false, Ordering::SeqCst);
        }
        fn bitmap(&self) -> &[u32] {
            &self.bitmap
        }
    }

    fn counting_tank() -> (WaveTank, Arc<AtomicUsize>) {
        let overlaps = Arc::new(AtomicUsize::new(0));
        let simulator = CountingSimulator {
            steps: 0,
            dt: 0.0,
            bitmap: vec![0; 16],
            active: Arc::new(AtomicBool::new(false)),
            overlaps: overlaps.clone(),
        };
        (WaveTank::new(0, Box::new(simulator)).unwrap(), overlaps)
    }

    #[test]
    fn encode_extremes_and_rounding() {
        assert_eq!(encode_8bit(-1.0), 0);
        assert_eq!(encode_8bit(1.0), 255);
        assert_eq!(encode_8bit(0.0), 128);
        assert_eq!(encode_8bit(-5.0), 0);
        assert_eq!(encode_8bit(7.5), 255);
        // 0.5 -> 191.25 -> 191, -0.5 -> 63.75 -> 64
        assert_eq!(encode_8bit(0.5), 191);
        assert_eq!(encode_8bit(-0.5), 64);
        for i in -100..=100 {
            let v = i as f32 / 100.0;
            let expected = ((v + 1.0) * 127.5).round();
            assert!((encode_8bit(v) as f32 - expected).abs() <= 1.0);
        }
    }

    #[test]
    fn flat_field_rasterizes_to_up_normal() {
        let size = 8;
        let heights = vec![0.0; size * size];
        let mut bitmap = vec![0; size * size];
        rasterize_height_field(&heights, size, &mut bitmap);
        let expected = u32::from_le_bytes([128, 128, 255, 128]);
        assert!(bitmap.iter().all(|&p| p == expected));
    }

    #[test]
    fn slope_uses_wrapping_central_difference() {
        let size = 4;
        // Height rises along x: 0, 0.2, 0.4, 0.2 (wraps).
        let row = [0.0, 0.2, 0.4, 0.2];
        let heights: Vec<f32> = (0..size).flat_map(|_| row).collect();
        let mut bitmap = vec![0; size * size];
        rasterize_height_field(&heights, size, &mut bitmap);
        let [r0, g0, _, a0] = bitmap[0].to_le_bytes();
        // At x = 0 the neighbours are 0.2 and 0.2: no slope.
        assert_eq!((r0, g0, a0), (128, 128, 128));
        let [r1, g1, _, a1] = bitmap[1].to_le_bytes();
        assert!(r1 < 128, "rising height must tilt the normal towards -x");
        assert_eq!(g1, 128);
        assert_eq!(a1, encode_8bit(0.2));
    }

    #[test]
    fn tank_joins_before_restarting() {
        let (mut tank, overlaps) = counting_tank();
        assert_eq!(tank.bitmap().map(|b| b[0]), Some(0));
        for run in 1..=5u32 {
            tank.start(1.0 / 60.0).unwrap();
            assert!(tank.is_running());
            assert!(tank.bitmap().is_none());
            tank.join().unwrap();
            assert_eq!(tank.bitmap().map(|b| b[0]), Some(run));
            assert_eq!(tank.runs_started(), tank.runs_joined());
        }
        // Starting while running joins the previous step first.
        tank.start(0.1).unwrap();
        tank.start(0.1).unwrap();
        tank.join().unwrap();
        assert_eq!(tank.runs_started(), 7);
        assert_eq!(tank.runs_joined(), 7);
        assert_eq!(tank.bitmap().map(|b| b[0]), Some(7));
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn joined_bitmap_is_stable() {
        let (mut tank, _) = counting_tank();
        tank.start(0.1).unwrap();
        tank.join().unwrap();
        let snapshot = tank.bitmap().map(<[u32]>::to_vec);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(tank.bitmap().map(<[u32]>::to_vec), snapshot);
    }

    #[test]
    fn drop_while_running_waits_for_worker() {
        let (mut tank, _) = counting_tank();
        tank.start(0.1).unwrap();
        drop(tank);
    }

    #[test]
    fn solver_choice_selects_simulator() {
        let spectral = create_simulator(WaveSolver::Spectral, 16, 1);
        let relaxation = create_simulator(WaveSolver::Relaxation, 32, 1);
        assert_eq!(spectral.size(), 16);
        assert_eq!(spectral.bitmap().len(), 256);
        assert_eq!(relaxation.size(), 32);
        assert_eq!(relaxation.bitmap().len(), 1024);
    }
}
