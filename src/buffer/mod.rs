//! Buffer record and normalized buffer metadata
//!
//! Wraps one graphics buffer handle per layer: a normalized
//! `PrivateHandle` view of the raw allocator metadata, identity history
//! for swap-vs-update detection, and the acquire/release/prev-release
//! fence triple whose lifecycle is tied to the frame cycle.

use bitflags::bitflags;
use log::trace;

use crate::fence::Fence;

bitflags! {
    /// Usage flags carried by the buffer allocator, normalized from the
    /// gralloc-style raw usage word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufferUsage: u32 {
        /// Buffer contents must stay in protected memory.
        const PROTECTED     = 1 << 0;
        /// Buffer carries secure content restricted to secure displays.
        const SECURE        = 1 << 1;
        /// Buffer was produced by a video decoder.
        const VIDEO_SOURCE  = 1 << 2;
        /// Buffer was produced by the camera pipeline.
        const CAMERA        = 1 << 3;
        /// Buffer is sampleable as a GPU texture.
        const HW_TEXTURE    = 1 << 4;
        /// Allocator tagged the buffer as HDR content.
        const HDR           = 1 << 5;
    }
}

/// Pixel formats relevant to classification and overlay-path gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgba8888,
    Rgbx8888,
    Rgb888,
    Rgb565,
    Rgba1010102,
    RgbaFp16,
    Yuyv,
    Yv12,
    Nv12,
    Unknown(u32),
}

/// Raw buffer metadata as handed over by the allocator collaborator.
#[derive(Debug, Clone)]
pub struct RawBuffer {
    /// Allocator-assigned unique buffer identity.
    pub id: u64,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub usage: BufferUsage,
}

/// Normalized view of one buffer's metadata, derived from `RawBuffer`.
///
/// This is the stand-in for the platform's private-handle extraction; the
/// classification code only ever consults this view.
#[derive(Debug, Clone, PartialEq)]
pub struct PrivateHandle {
    pub id: u64,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub usage: BufferUsage,
}

impl PrivateHandle {
    /// Normalize raw allocator metadata into the private-handle view.
    pub fn from_raw(raw: &RawBuffer) -> Self {
        Self {
            id: raw.id,
            format: raw.format,
            width: raw.width,
            height: raw.height,
            stride: raw.stride,
            usage: raw.usage,
        }
    }

    pub fn is_protected(&self) -> bool {
        self.usage.contains(BufferUsage::PROTECTED)
    }

    pub fn is_secure(&self) -> bool {
        self.usage.contains(BufferUsage::SECURE)
    }

    pub fn is_video_source(&self) -> bool {
        self.usage.contains(BufferUsage::VIDEO_SOURCE)
    }

    pub fn is_camera(&self) -> bool {
        self.usage.contains(BufferUsage::CAMERA)
    }

    pub fn is_hdr_tagged(&self) -> bool {
        self.usage.contains(BufferUsage::HDR)
    }
}

/// Per-layer buffer state: the current handle, identity history, and the
/// fence triple.
///
/// Fence invariant: no fence field stays open across two consecutive
/// present cycles. `after_present` closes the displaced fences; `Drop`
/// on the contained `Fence`s covers every other exit path.
#[derive(Debug, Default)]
pub struct BufferRecord {
    handle: Option<PrivateHandle>,
    /// Identity of the current buffer, 0 when no handle is attached.
    original_id: u64,
    /// Identity of the previous frame's buffer.
    prev_original_id: u64,
    acquire_fence: Fence,
    release_fence: Fence,
    prev_release_fence: Fence,
    /// True from `set_handle` until cleared by `after_present`.
    buffer_changed: bool,
}

impl BufferRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new buffer handle with its acquire fence.
    ///
    /// The previously held acquire fence (if any) is closed; identity
    /// history rolls forward so `is_buffer_swapped` can distinguish a
    /// buffer swap from an in-place content update.
    pub fn set_handle(&mut self, handle: Option<PrivateHandle>, acquire_fence: Fence) {
        self.prev_original_id = self.original_id;
        self.original_id = handle.as_ref().map_or(0, |h| h.id);
        self.handle = handle;
        // Replacing drops (and thus closes) any unconsumed acquire fence.
        self.acquire_fence = acquire_fence;
        self.buffer_changed = true;
        trace!(
            "buffer handle set: id {} (prev {})",
            self.original_id,
            self.prev_original_id
        );
    }

    pub fn handle(&self) -> Option<&PrivateHandle> {
        self.handle.as_ref()
    }

    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    /// Whether the most recent `set_handle` attached a different buffer
    /// than the one before it.
    pub fn is_buffer_swapped(&self) -> bool {
        self.original_id != self.prev_original_id
    }

    pub fn is_buffer_changed(&self) -> bool {
        self.buffer_changed
    }

    /// Store the release fence produced by the present call. Any fence
    /// already in the slot is closed first.
    pub fn set_release_fence(&mut self, fence: Fence) {
        self.release_fence.close();
        self.release_fence = fence;
    }

    /// Move the acquire fence out for the hardware to wait on.
    pub fn take_acquire_fence(&mut self) -> Fence {
        self.acquire_fence.take()
    }

    /// Move the previous release fence out, for handing back to the
    /// upstream client after present.
    pub fn take_prev_release_fence(&mut self) -> Fence {
        self.prev_release_fence.take()
    }

    /// Roll fence state forward at the frame boundary.
    ///
    /// Closes the consumed acquire fence and the displaced prev-release
    /// fence, rotates release into prev-release, and clears the
    /// buffer-changed flag.
    pub fn after_present(&mut self) {
        self.acquire_fence.close();
        self.prev_release_fence.close();
        self.prev_release_fence = self.release_fence.take();
        self.buffer_changed = false;
    }

    /// Release every held fence; used on layer destruction from any
    /// lifecycle state.
    pub fn release_all(&mut self) {
        self.acquire_fence.close();
        self.release_fence.close();
        self.prev_release_fence.close();
        self.handle = None;
    }
}
