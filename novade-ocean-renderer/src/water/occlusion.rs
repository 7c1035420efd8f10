//! Occlusion query around the water draw, one query per frame slot.
//!
//! Queries are reset from the host because a command-buffer reset may not be
//! recorded inside the render pass. Results are read without waiting; a slot's
//! fence has already been waited on when its result is fetched, so the value
//! is normally available.

use crate::device::LogicalDevice;
use crate::error::Result;
use ash::vk;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

static HOST_RESET_WARNED: AtomicBool = AtomicBool::new(false);

/// Which slots have a query in flight and what the last result was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcclusionTracker {
    issued: Vec<bool>,
    last_visible: Option<u64>,
}

impl OcclusionTracker {
    pub fn new(slots: usize) -> Self {
        Self { issued: vec![false; slots], last_visible: None }
    }

    pub fn slots(&self) -> usize {
        self.issued.len()
    }

    pub fn mark_issued(&mut self, slot: usize) {
        if let Some(issued) = self.issued.get_mut(slot) {
            *issued = true;
        }
    }

    pub fn is_issued(&self, slot: usize) -> bool {
        self.issued.get(slot).copied().unwrap_or(false)
    }

    pub fn record_result(&mut self, slot: usize, samples: u64) {
        if let Some(issued) = self.issued.get_mut(slot) {
            *issued = false;
        }
        self.last_visible = Some(samples);
    }

    /// Samples that passed in the most recently read query. Zero means the
    /// water was fully hidden; nothing acts on it.
    pub fn last_visible(&self) -> Option<u64> {
        self.last_visible
    }
}

pub struct OcclusionQuery {
    pool: Option<vk::QueryPool>,
    tracker: OcclusionTracker,
    device: Arc<LogicalDevice>,
}

impl OcclusionQuery {
    /// Creates a pool of `slots` occlusion queries. Without host query reset
    /// the query is disabled and every call is a no-op.
    pub fn new(device: Arc<LogicalDevice>, slots: usize) -> Result<Self> {
        let tracker = OcclusionTracker::new(slots);
        if !device.host_query_reset {
            if !HOST_RESET_WARNED.swap(true, Ordering::Relaxed) {
                warn!("Host query reset unavailable; water occlusion queries disabled.");
            }
            return Ok(Self { pool: None, tracker, device });
        }
        let create_info = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::OCCLUSION)
            .query_count(slots as u32);
        // # Safety: valid create info on a live device.
        let pool = unsafe { device.raw.create_query_pool(&create_info, None) }?;
        // # Safety: hostQueryReset was enabled at device creation; nothing uses the pool yet.
        unsafe { device.raw.reset_query_pool(pool, 0, slots as u32) };
        Ok(Self { pool: Some(pool), tracker, device })
    }

    pub fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    pub fn last_visible(&self) -> Option<u64> {
        self.tracker.last_visible()
    }

    /// Reads the result of `slot`'s previous query if it is ready.
    pub fn poll(&mut self, slot: usize) -> Option<u64> {
        let pool = self.pool?;
        if !self.tracker.is_issued(slot) {
            return None;
        }
        let mut samples = [0u64; 1];
        // # Safety: the query was begun and ended in a submitted command buffer.
        match unsafe {
            self.device
                .raw
                .get_query_pool_results(pool, slot as u32, 1, &mut samples, vk::QueryResultFlags::TYPE_64)
        } {
            Ok(()) => {
                self.tracker.record_result(slot, samples[0]);
                trace!("Water occlusion (slot {}): {} samples visible.", slot, samples[0]);
                Some(samples[0])
            }
            Err(vk::Result::NOT_READY) => None,
            Err(e) => {
                warn!("Reading occlusion query {} failed: {}", slot, e);
                None
            }
        }
    }

    /// Resets `slot` from the host. Call after [`OcclusionQuery::poll`] and
    /// before recording the slot's command buffer.
    pub fn reset(&mut self, slot: usize) {
        let Some(pool) = self.pool else {
            return;
        };
        // # Safety: the slot's fence was waited, so its previous query is no longer in use.
        unsafe { self.device.raw.reset_query_pool(pool, slot as u32, 1) };
    }

    pub fn begin(&mut self, command_buffer: vk::CommandBuffer, slot: usize) {
        if let Some(pool) = self.pool {
            // # Safety: the query was reset and the command buffer is recording inside a render pass.
            unsafe {
                self.device
                    .raw
                    .cmd_begin_query(command_buffer, pool, slot as u32, vk::QueryControlFlags::empty())
            };
        }
    }

    pub fn end(&mut self, command_buffer: vk::CommandBuffer, slot: usize) {
        if let Some(pool) = self.pool {
            // # Safety: paired with begin() in the same command buffer.
            unsafe { self.device.raw.cmd_end_query(command_buffer, pool, slot as u32) };
            self.tracker.mark_issued(slot);
        }
    }
}

impl Drop for OcclusionQuery {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            // # Safety: the renderer waits for the device before dropping its queries.
            unsafe { self.device.raw.destroy_query_pool(pool, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_clears_issued_slot() {
        let mut tracker = OcclusionTracker::new(3);
        assert_eq!(tracker.slots(), 3);
        assert_eq!(tracker.last_visible(), None);
        tracker.mark_issued(1);
        assert!(tracker.is_issued(1));
        assert!(!tracker.is_issued(0));
        tracker.record_result(1, 0);
        assert!(!tracker.is_issued(1));
        assert_eq!(tracker.last_visible(), Some(0));
    }

    #[test]
    fn latest_result_wins() {
        let mut tracker = OcclusionTracker::new(2);
        tracker.mark_issued(0);
        tracker.mark_issued(1);
        tracker.record_result(0, 120);
        tracker.record_result(1, 7);
        assert_eq!(tracker.last_visible(), Some(7));
    }

    #[test]
    fn out_of_range_slots_are_ignored() {
        let mut tracker = OcclusionTracker::new(2);
        tracker.mark_issued(5);
        assert!(!tracker.is_issued(5));
        tracker.record_result(5, 3);
        assert_eq!(tracker.last_visible(), Some(3));
    }
}
