//! Per-frame-slot synchronization.

use std::sync::Arc;

use ember_rhi::device::Device;
use ember_rhi::sync::{Fence, Semaphore};
use ember_rhi::RhiResult;

/// Synchronization primitives for one frame-in-flight slot.
///
/// The protocol per frame: wait on `in_flight` (bounds CPU lead), acquire
/// a swapchain image signaling `image_available`, submit waiting on it and
/// signaling `render_finished` plus `in_flight`, present waiting on
/// `render_finished`.
pub struct FrameSync {
    image_available: Semaphore,
    render_finished: Semaphore,
    in_flight: Fence,
}

impl FrameSync {
    /// Creates the slot's primitives; the fence starts signaled so the
    /// first wait on a fresh slot does not block.
    pub fn new(device: Arc<Device>) -> RhiResult<Self> {
        Ok(Self {
            image_available: Semaphore::new(device.clone())?,
            render_finished: Semaphore::new(device.clone())?,
            in_flight: Fence::new(device, true)?,
        })
    }

    /// Semaphore signaled when the acquired image is usable.
    #[inline]
    pub fn image_available(&self) -> &Semaphore {
        &self.image_available
    }

    /// Semaphore signaled when rendering completes.
    #[inline]
    pub fn render_finished(&self) -> &Semaphore {
        &self.render_finished
    }

    /// Fence signaled when the slot's submission retires.
    #[inline]
    pub fn in_flight(&self) -> &Fence {
        &self.in_flight
    }
}
