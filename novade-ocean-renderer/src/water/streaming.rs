//! Moves wave bitmaps and source colors into the water textures.
//!
//! [`TextureStreamer::update`] is the only place the render thread waits for
//! the wave tanks. It joins them all, records every upload into one batch,
//! then starts the next simulation step of each tank.

use crate::config::WaterConfig;
use crate::error::Result;
use crate::water::dirty::UpdateBitmap;
use crate::wave::{create_simulator, WaveTank};
use tracing::{debug, trace};

/// Step used for the first simulation run, before any frame time is known.
const INITIAL_TIME_STEP: f32 = 1.0 / 60.0;

/// Grid the water takes its color from.
pub trait WaterSource: Send + Sync {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    /// Packed `u32::from_le_bytes([r, g, b, a])` color of a texel.
    fn color(&self, x: u32, y: u32) -> u32;
    /// Elevation of the water surface.
    fn water_level(&self) -> u32;
}

/// Destination of a batch of texture uploads.
pub trait UploadSink {
    fn begin_batch(&mut self) -> Result<()>;
    fn upload_wave_layer(&mut self, layer: u32, size: u32, pixels: &[u32]) -> Result<()>;
    fn upload_color_full(&mut self, width: u32, height: u32, pixels: &[u32]) -> Result<()>;
    fn upload_color_span(&mut self, x: u32, y: u32, pixels: &[u32]) -> Result<()>;
    fn submit_batch(&mut self) -> Result<()>;
}

/// What one [`TextureStreamer::update`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub tanks_joined: usize,
    pub layers_uploaded: usize,
    pub full_color_upload: bool,
    pub color_spans: usize,
    pub submissions: usize,
}

/// `(v * v + 128) >> 8` on the color channels; alpha is kept.
pub fn remap_color(color: u32) -> u32 {
    let [r, g, b, a] = color.to_le_bytes();
    let remap = |v: u8| ((v as u32 * v as u32 + 128) >> 8) as u8;
    u32::from_le_bytes([remap(r), remap(g), remap(b), a])
}

pub struct TextureStreamer {
    tanks: Vec<WaveTank>,
    time_scales: Vec<f32>,
    dirty: Option<UpdateBitmap>,
    scratch: Vec<u32>,
}

impl TextureStreamer {
    /// Creates the tanks for the configured quality and starts their first step.
    pub fn new(config: &WaterConfig) -> Result<Self> {
        let quality = config.quality;
        let mut tanks = Vec::with_capacity(quality.tank_count());
        let mut time_scales = Vec::with_capacity(quality.tank_count());
        for index in 0..quality.tank_count() {
            let simulator = create_simulator(config.solver, quality.tank_size(), config.seed.wrapping_add(index as u64));
            let mut tank = WaveTank::new(index, simulator)?;
            let scale = config.time_scale(index);
            tank.start(INITIAL_TIME_STEP * scale)?;
            tanks.push(tank);
            time_scales.push(scale);
        }
        debug!("Texture streamer started {} wave tank(s) ({:?}, {:?}).", tanks.len(), quality, config.solver);
        Ok(Self { tanks, time_scales, dirty: None, scratch: Vec::new() })
    }

    pub fn tanks(&self) -> &[WaveTank] {
        &self.tanks
    }

    /// Starts tracking a source grid; every texel begins dirty.
    pub fn set_source_size(&mut self, width: u32, height: u32) {
        self.dirty = Some(UpdateBitmap::new(width, height));
    }

    pub fn dirty(&self) -> Option<&UpdateBitmap> {
        self.dirty.as_ref()
    }

    /// Records a changed texel. Changes below the water surface are invisible
    /// and ignored.
    pub fn mark_texel(&mut self, x: u32, y: u32, z: u32, water_level: u32) {
        if z < water_level {
            return;
        }
        if let Some(dirty) = self.dirty.as_mut() {
            dirty.mark(x, y);
        }
    }

    pub fn update(&mut self, dt: f32, source: Option<&dyn WaterSource>, sink: &mut dyn UploadSink) -> Result<UploadReport> {
        let mut report = UploadReport::default();
        for tank in &mut self.tanks {
            tank.join()?;
            report.tanks_joined += 1;
        }

        sink.begin_batch()?;
        for tank in &self.tanks {
            if let Some(bitmap) = tank.bitmap() {
                sink.upload_wave_layer(tank.index() as u32, tank.size() as u32, bitmap)?;
                report.layers_uploaded += 1;
            }
        }
        if let (Some(source), Some(dirty)) = (source, self.dirty.as_mut()) {
            Self::stream_colors(source, dirty, &mut self.scratch, sink, &mut report)?;
        }
        sink.submit_batch()?;
        report.submissions += 1;

        for (tank, scale) in self.tanks.iter_mut().zip(&self.time_scales) {
            tank.start(dt * scale)?;
        }
        trace!("Texture streaming: {:?}", report);
        Ok(report)
    }

    fn stream_colors(
        source: &dyn WaterSource,
        dirty: &mut UpdateBitmap,
        scratch: &mut Vec<u32>,
        sink: &mut dyn UploadSink,
        report: &mut UploadReport,
    ) -> Result<()> {
        let (width, height) = (dirty.width(), dirty.height());
        if dirty.is_fully_dirty() {
            scratch.clear();
            for y in 0..height {
                scratch.extend((0..width).map(|x| remap_color(source.color(x, y))));
            }
            sink.upload_color_full(width, height, scratch)?;
            dirty.clear_all();
            report.full_color_upload = true;
            return Ok(());
        }
        for span in dirty.dirty_spans() {
            scratch.clear();
            scratch.extend((span.x..span.x + span.len).map(|x| remap_color(source.color(x, span.y))));
            sink.upload_color_span(span.x, span.y, scratch)?;
            dirty.clear_span(&span);
            report.color_spans += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{WaveQuality, WaveSolver};
    use crate::testing::{MemoryWaterSource, RecordingSink, SinkEvent};

    fn config(quality: WaveQuality) -> WaterConfig {
        WaterConfig { quality, solver: WaveSolver::Relaxation, ..WaterConfig::default() }
    }

    #[test]
    fn color_remap_squares_channels() {
        assert_eq!(remap_color(u32::from_le_bytes([0, 255, 128, 77])), u32::from_le_bytes([0, 254, 64, 77]));
        assert_eq!(remap_color(u32::from_le_bytes([16, 1, 200, 255])), u32::from_le_bytes([1, 0, 156, 255]));
    }

    #[test]
    fn first_update_uploads_everything_then_nothing() {
        let source = MemoryWaterSource::new(64, 40, 63);
        let mut streamer = TextureStreamer::new(&config(WaveQuality::Single)).unwrap();
        streamer.set_source_size(source.width(), source.height());
        let mut sink = RecordingSink::default();

        let first = streamer.update(1.0 / 60.0, Some(&source), &mut sink).unwrap();
        assert_eq!(
            first,
            UploadReport { tanks_joined: 1, layers_uploaded: 1, full_color_upload: true, color_spans: 0, submissions: 1 }
        );
        assert_eq!(
            sink.events,
            vec![
                SinkEvent::Begin,
                SinkEvent::WaveLayer { layer: 0, size: 256 },
                SinkEvent::ColorFull { width: 64, height: 40 },
                SinkEvent::Submit
            ]
        );

        sink.events.clear();
        let second = streamer.update(1.0 / 60.0, Some(&source), &mut sink).unwrap();
        assert!(!second.full_color_upload);
        assert_eq!(second.color_spans, 0);
        assert_eq!(second.submissions, 1);
        assert!(streamer.dirty().is_some_and(UpdateBitmap::is_clean));
    }

    #[test]
    fn changes_above_water_upload_their_span() {
        let source = MemoryWaterSource::new(100, 8, 63);
        let mut streamer = TextureStreamer::new(&config(WaveQuality::Single)).unwrap();
        streamer.set_source_size(100, 8);
        let mut sink = RecordingSink::default();
        streamer.update(0.01, Some(&source), &mut sink).unwrap();

        streamer.mark_texel(3, 2, 62, 63);
        streamer.mark_texel(70, 5, 63, 63);
        streamer.mark_texel(71, 5, 64, 63);
        sink.events.clear();
        let report = streamer.update(0.01, Some(&source), &mut sink).unwrap();
        assert_eq!(report.color_spans, 1);
        assert!(sink.events.contains(&SinkEvent::ColorSpan { x: 64, y: 5, len: 32 }));
        assert_eq!(sink.last_span_pixels[0], remap_color(source.color(64, 5)));
    }

    #[test]
    fn layered_quality_runs_three_tanks_with_own_time_scale() {
        let mut streamer = TextureStreamer::new(&config(WaveQuality::Layered)).unwrap();
        assert_eq!(streamer.tanks().len(), 3);
        assert_eq!(streamer.time_scales, vec![1.0, 0.75, 0.5]);
        let mut sink = RecordingSink::default();
        let report = streamer.update(0.02, None, &mut sink).unwrap();
        assert_eq!(report.layers_uploaded, 3);
        assert_eq!(report.tanks_joined, 3);
        assert!(!report.full_color_upload);
        for tank in streamer.tanks() {
            assert_eq!(tank.size(), 128);
            assert_eq!(tank.runs_joined(), 1);
            assert_eq!(tank.runs_started(), 2);
        }
    }
}
