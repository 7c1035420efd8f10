use novade_ocean_renderer::water::streaming::TextureStreamer;
use novade_ocean_renderer::{Result, UploadSink, WaterConfig, WaterSource, WaveQuality};

struct Grid {
    size: u32,
    level: u32,
}

impl WaterSource for Grid {
    fn width(&self) -> u32 {
        self.size
    }

    fn height(&self) -> u32 {
        self.size
    }

    fn color(&self, x: u32, y: u32) -> u32 {
        0xff00_0000 | (y << 8) | (x & 0xff)
    }

    fn water_level(&self) -> u32 {
        self.level
    }
}

#[derive(Default)]
struct CountingSink {
    batches: usize,
    open: bool,
    wave_layers: Vec<u32>,
    full_uploads: Vec<(u32, u32)>,
    span_texels: usize,
}

impl UploadSink for CountingSink {
    fn begin_batch(&mut self) -> Result<()> {
        assert!(!self.open, "batch begun twice");
        self.open = true;
        Ok(())
    }

    fn upload_wave_layer(&mut self, layer: u32, size: u32, pixels: &[u32]) -> Result<()> {
        assert!(self.open);
        assert_eq!(pixels.len(), (size * size) as usize);
        self.wave_layers.push(layer);
        Ok(())
    }

    fn upload_color_full(&mut self, width: u32, height: u32, pixels: &[u32]) -> Result<()> {
        assert!(self.open);
        assert_eq!(pixels.len(), (width * height) as usize);
        self.full_uploads.push((width, height));
        Ok(())
    }

    fn upload_color_span(&mut self, _x: u32, _y: u32, pixels: &[u32]) -> Result<()> {
        assert!(self.open);
        self.span_texels += pixels.len();
        Ok(())
    }

    fn submit_batch(&mut self) -> Result<()> {
        assert!(self.open);
        self.open = false;
        self.batches += 1;
        Ok(())
    }
}

fn streamer(quality: WaveQuality, size: u32) -> TextureStreamer {
    let config = WaterConfig { quality, ..WaterConfig::default() };
    let mut streamer = TextureStreamer::new(&config).unwrap();
    streamer.set_source_size(size, size);
    streamer
}

#[test]
fn first_update_uploads_everything_then_only_changes() {
    let grid = Grid { size: 512, level: 10 };
    let mut streamer = streamer(WaveQuality::Single, grid.size);
    let mut sink = CountingSink::default();

    let first = streamer.update(1.0 / 60.0, Some(&grid), &mut sink).unwrap();
    assert_eq!(first.layers_uploaded, 1);
    assert!(first.full_color_upload);
    assert_eq!(sink.full_uploads, vec![(512, 512)]);
    assert_eq!(sink.batches, 1);

    let second = streamer.update(1.0 / 60.0, Some(&grid), &mut sink).unwrap();
    assert!(!second.full_color_upload);
    assert_eq!(second.color_spans, 0);
    assert_eq!(sink.full_uploads.len(), 1);
    assert!(!sink.open);
}

#[test]
fn texels_above_water_do_not_dirty_the_color_map() {
    let grid = Grid { size: 64, level: 10 };
    let mut streamer = streamer(WaveQuality::Single, grid.size);
    let mut sink = CountingSink::default();
    streamer.update(1.0 / 60.0, Some(&grid), &mut sink).unwrap();

    streamer.mark_texel(3, 4, 2, grid.level);
    streamer.mark_texel(5, 6, 20, grid.level);
    let report = streamer.update(1.0 / 60.0, Some(&grid), &mut sink).unwrap();
    assert_eq!(report.color_spans, 1);
    // One 32-texel word.
    assert_eq!(sink.span_texels, 32);
}

#[test]
fn layered_quality_uploads_every_tank() {
    let grid = Grid { size: 128, level: 0 };
    let mut streamer = streamer(WaveQuality::Layered, grid.size);
    let mut sink = CountingSink::default();
    let report = streamer.update(1.0 / 30.0, Some(&grid), &mut sink).unwrap();
    assert_eq!(streamer.tanks().len(), 3);
    assert_eq!(report.layers_uploaded, 3);
    assert_eq!(sink.wave_layers, vec![0, 1, 2]);
}

#[test]
fn update_without_source_still_streams_waves() {
    let mut streamer = streamer(WaveQuality::Single, 32);
    let mut sink = CountingSink::default();
    let report = streamer.update(1.0 / 60.0, None, &mut sink).unwrap();
    assert_eq!(report.layers_uploaded, 1);
    assert!(!report.full_color_upload);
    assert!(sink.full_uploads.is_empty());
}
