//! In-memory stand-ins for the driver seams, shared by the unit tests.

use crate::error::{Result, VulkanError};
use crate::shader::{reflect_spirv, FileSource, ShaderBackend, ShaderReflection};
use crate::surface_swapchain::{AcquireOutcome, PresentStatus, SwapchainOps};
use crate::water::streaming::{UploadSink, WaterSource};
use ash::vk::{self, Handle};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

const FAKE_IMAGE_COUNT: u32 = 3;

/// Swapchain whose acquire and present results are scripted.
#[derive(Debug)]
pub struct FakeSwapchain {
    /// Size a rebuild adopts.
    pub window_extent: vk::Extent2D,
    pub extent: vk::Extent2D,
    /// Outcomes returned by the next acquires, front first. Empty means success.
    pub acquire_script: Vec<AcquireOutcome>,
    /// Statuses returned by the next presents, front first. Empty means presented.
    pub present_script: Vec<PresentStatus>,
    pub rebuilds: usize,
    pub acquires: usize,
    pub presented: usize,
    next_index: u32,
}

impl FakeSwapchain {
    pub fn new(extent: vk::Extent2D) -> Self {
        Self {
            window_extent: extent,
            extent,
            acquire_script: Vec::new(),
            present_script: Vec::new(),
            rebuilds: 0,
            acquires: 0,
            presented: 0,
            next_index: 0,
        }
    }
}

impl SwapchainOps for FakeSwapchain {
    fn acquire(&mut self, _signal: vk::Semaphore) -> Result<AcquireOutcome> {
        self.acquires += 1;
        if !self.acquire_script.is_empty() {
            return Ok(self.acquire_script.remove(0));
        }
        let index = self.next_index;
        self.next_index = (self.next_index + 1) % FAKE_IMAGE_COUNT;
        Ok(AcquireOutcome::Acquired { index, suboptimal: false })
    }

    fn present(&mut self, _image_index: u32, _wait: &[vk::Semaphore]) -> Result<PresentStatus> {
        let status =
            if self.present_script.is_empty() { PresentStatus::Presented } else { self.present_script.remove(0) };
        if status != PresentStatus::Stale {
            self.presented += 1;
        }
        Ok(status)
    }

    fn rebuild(&mut self) -> Result<()> {
        self.rebuilds += 1;
        self.extent = self.window_extent;
        Ok(())
    }
}

/// Files served from memory, counting reads per path.
#[derive(Debug, Default)]
pub struct MemorySource {
    files: HashMap<String, Vec<u8>>,
    reads: Mutex<HashMap<String, usize>>,
}

impl MemorySource {
    pub fn new(files: &[(&str, &str)]) -> Self {
        Self {
            files: files.iter().map(|(path, text)| (path.to_string(), text.as_bytes().to_vec())).collect(),
            reads: Mutex::new(HashMap::new()),
        }
    }

    pub fn reads(&self, path: &str) -> usize {
        self.reads.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

impl FileSource for MemorySource {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        *self.reads.lock().unwrap().entry(path.to_string()).or_default() += 1;
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| VulkanError::ShaderLoadingError(format!("no such file: {path}")))
    }
}

/// Hands out fake handles and tracks how many of each kind are alive.
#[derive(Debug, Default)]
pub struct FakeBackend {
    next_handle: AtomicU64,
    modules: AtomicUsize,
    set_layouts: AtomicUsize,
    pipeline_layouts: AtomicUsize,
    last_set_layout_bindings: AtomicUsize,
    reflection_disabled: bool,
}

impl FakeBackend {
    /// A backend whose reflection always fails, as for modules naga cannot read.
    pub fn without_reflection() -> Self {
        Self { reflection_disabled: true, ..Self::default() }
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn live_modules(&self) -> usize {
        self.modules.load(Ordering::Relaxed)
    }

    pub fn live_set_layouts(&self) -> usize {
        self.set_layouts.load(Ordering::Relaxed)
    }

    pub fn live_pipeline_layouts(&self) -> usize {
        self.pipeline_layouts.load(Ordering::Relaxed)
    }

    /// Binding count of the most recently created set layout.
    pub fn last_set_layout_bindings(&self) -> usize {
        self.last_set_layout_bindings.load(Ordering::Relaxed)
    }
}

impl ShaderBackend for FakeBackend {
    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule> {
        if code.is_empty() {
            return Err(VulkanError::ShaderLoadingError("empty module".to_string()));
        }
        self.modules.fetch_add(1, Ordering::Relaxed);
        Ok(vk::ShaderModule::from_raw(self.handle()))
    }

    fn destroy_shader_module(&self, _module: vk::ShaderModule) {
        self.modules.fetch_sub(1, Ordering::Relaxed);
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        self.set_layouts.fetch_add(1, Ordering::Relaxed);
        self.last_set_layout_bindings.store(bindings.len(), Ordering::Relaxed);
        Ok(vk::DescriptorSetLayout::from_raw(self.handle()))
    }

    fn destroy_descriptor_set_layout(&self, _layout: vk::DescriptorSetLayout) {
        self.set_layouts.fetch_sub(1, Ordering::Relaxed);
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
        _push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout> {
        self.pipeline_layouts.fetch_add(1, Ordering::Relaxed);
        Ok(vk::PipelineLayout::from_raw(self.handle()))
    }

    fn destroy_pipeline_layout(&self, _layout: vk::PipelineLayout) {
        self.pipeline_layouts.fetch_sub(1, Ordering::Relaxed);
    }

    fn reflect(&self, words: &[u32]) -> Result<ShaderReflection> {
        if self.reflection_disabled {
            return Err(VulkanError::ShaderLoadingError("reflection disabled".to_string()));
        }
        reflect_spirv(words)
    }
}

/// Source grid with a deterministic color per texel.
#[derive(Debug, Clone)]
pub struct MemoryWaterSource {
    width: u32,
    height: u32,
    water_level: u32,
}

impl MemoryWaterSource {
    pub fn new(width: u32, height: u32, water_level: u32) -> Self {
        Self { width, height, water_level }
    }
}

impl WaterSource for MemoryWaterSource {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn color(&self, x: u32, y: u32) -> u32 {
        u32::from_le_bytes([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8, 255])
    }

    fn water_level(&self) -> u32 {
        self.water_level
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Begin,
    WaveLayer { layer: u32, size: u32 },
    ColorFull { width: u32, height: u32 },
    ColorSpan { x: u32, y: u32, len: u32 },
    Submit,
}

/// Upload sink that records calls instead of touching a GPU.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub events: Vec<SinkEvent>,
    pub last_span_pixels: Vec<u32>,
}

impl UploadSink for RecordingSink {
    fn begin_batch(&mut self) -> Result<()> {
        self.events.push(SinkEvent::Begin);
        Ok(())
    }

    fn upload_wave_layer(&mut self, layer: u32, size: u32, pixels: &[u32]) -> Result<()> {
        assert_eq!(pixels.len(), (size * size) as usize);
        self.events.push(SinkEvent::WaveLayer { layer, size });
        Ok(())
    }

    fn upload_color_full(&mut self, width: u32, height: u32, pixels: &[u32]) -> Result<()> {
        assert_eq!(pixels.len(), (width * height) as usize);
        self.events.push(SinkEvent::ColorFull { width, height });
        Ok(())
    }

    fn upload_color_span(&mut self, x: u32, y: u32, pixels: &[u32]) -> Result<()> {
        self.events.push(SinkEvent::ColorSpan { x, y, len: pixels.len() as u32 });
        self.last_span_pixels = pixels.to_vec();
        Ok(())
    }

    fn submit_batch(&mut self) -> Result<()> {
        self.events.push(SinkEvent::Submit);
        Ok(())
    }
}
