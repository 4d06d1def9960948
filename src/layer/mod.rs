//! Layer model and per-frame classification
//!
//! This module implements one composited surface and the decision engine
//! that classifies it for the hardware composition path each frame:
//! - Geometry, blending and z-order state with per-field dirty bits
//! - Composition-type negotiation with the upstream display stack
//! - The `validate` classification ladder (overlay / MM / GLAI / fallback)
//! - Capability refinement after classification (`complete_layer_caps`)
//! - The frame lifecycle state machine and `after_present` rollover
//!
//! A layer exclusively owns its `BufferRecord`; its back-reference to the
//! owning display is id-based, resolved through the display registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use log::{debug, error, trace, warn};

use crate::buffer::{BufferRecord, PixelFormat, PrivateHandle};
use crate::config::PlatformConfig;
use crate::error::CompositionError;
use crate::fence::Fence;
use crate::hal::{DisplayData, DisplayDataRegistry, ModelController, OverlayCaps, PathValidator};

/// Process-wide layer id source; ids are unique and never reused.
static NEXT_LAYER_ID: AtomicU64 = AtomicU64::new(1);

/// Integer rectangle in display coordinates (left/top/right/bottom).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    /// Degenerate rectangles cannot be composed by any hardware path.
    pub fn is_degenerate(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }
}

/// Float rectangle in buffer coordinates, used for source crops.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl FRect {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }
}

bitflags! {
    /// Rotation/flip bitmask, matching the upstream transform encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Transform: u32 {
        const FLIP_H = 1 << 0;
        const FLIP_V = 1 << 1;
        const ROT_90 = 1 << 2;
    }
}

/// Composition types exchanged with the upstream display stack. Numeric
/// codes are fixed by the external protocol and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CompositionType {
    Invalid = 0,
    Client = 1,
    Device = 2,
    SolidColor = 3,
    Cursor = 4,
}

/// Internal hardware layer classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwLayerType {
    /// Not classified yet this frame.
    None,
    /// Cannot be hardware-composed; falls back to client composition.
    Invalid,
    /// Plain UI overlay path.
    Ui,
    /// Media path through the MDP scaling/rotation engine.
    Mm,
    /// AI-inference accelerator path.
    Glai,
    /// Solid-color dim layer, composed without a buffer.
    Dim,
    /// Hardware cursor plane.
    Cursor,
    /// The client target (framebuffer target) surface itself.
    Fbt,
    /// Excluded from composition entirely.
    Ignore,
    /// Background hole filled by the hardware.
    Wormhole,
}

/// Blend modes from the upstream protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendMode {
    /// No blending; the layer is opaque regardless of alpha.
    #[default]
    None,
    Premultiplied,
    Coverage,
}

/// Frame lifecycle states for one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Constructed, no property set for the coming frame yet.
    Uncommitted,
    /// At least one property setter ran this frame.
    Pending,
    /// `validate` completed for this frame.
    Classified,
    /// The display's present step consumed the classification.
    Presented,
}

bitflags! {
    /// Per-field dirty bits, one per setter.
    ///
    /// `CONTENT_DIRTY` is the single source of truth for the subset that
    /// affects pixel output; the remaining bits are bookkeeping-only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LayerDirty: u32 {
        const BUFFER         = 1 << 0;
        const CROP           = 1 << 1;
        const FRAME          = 1 << 2;
        /// Display frame moved without resizing.
        const OFFSET         = 1 << 3;
        /// Display frame changed size.
        const SIZE           = 1 << 4;
        const TRANSFORM      = 1 << 5;
        const ZORDER         = 1 << 6;
        const ALPHA          = 1 << 7;
        const BLEND          = 1 << 8;
        const VISIBLE_REGION = 1 << 9;
        const DAMAGE         = 1 << 10;
        const COLOR          = 1 << 11;
        const HDR_STATIC     = 1 << 12;
        const HDR_DYNAMIC    = 1 << 13;
        // Bookkeeping-only bits below.
        const NAME           = 1 << 14;
        const SECURE         = 1 << 15;
        const FORMAT         = 1 << 16;
        const PREXFORM       = 1 << 17;

        const CONTENT_DIRTY = Self::BUFFER.bits()
            | Self::CROP.bits()
            | Self::FRAME.bits()
            | Self::OFFSET.bits()
            | Self::SIZE.bits()
            | Self::TRANSFORM.bits()
            | Self::ZORDER.bits()
            | Self::ALPHA.bits()
            | Self::BLEND.bits()
            | Self::VISIBLE_REGION.bits()
            | Self::DAMAGE.bits()
            | Self::COLOR.bits()
            | Self::HDR_STATIC.bits()
            | Self::HDR_DYNAMIC.bits();
    }
}

bitflags! {
    /// Where the layer's HDR signal came from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HdrSource: u8 {
        const GRALLOC = 1 << 0;
        const STATIC  = 1 << 1;
        const DYNAMIC = 1 << 2;
    }
}

bitflags! {
    /// Capability restrictions assigned during `complete_layer_caps`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LayerCaps: u32 {
        /// MM layer may only go through the MML overlay path.
        const MML_OVERLAY_ONLY = 1 << 0;
        /// Overlay only, MDP excluded (protected/secure content).
        const NO_MDP           = 1 << 1;
        /// UI layer restricted to the overlay-only path by debug hint.
        const OVERLAY_ONLY_UI  = 1 << 2;
        /// Background behind this layer can be cleared instead of
        /// composed.
        const CLIENT_CLEAR     = 1 << 3;
    }
}

/// Static HDR metadata keys (SMPTE 2086 / CTA-861.3 subset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataKey {
    DisplayRedPrimaryX,
    DisplayRedPrimaryY,
    DisplayGreenPrimaryX,
    DisplayGreenPrimaryY,
    DisplayBluePrimaryX,
    DisplayBluePrimaryY,
    WhitePointX,
    WhitePointY,
    MaxLuminance,
    MinLuminance,
    MaxContentLightLevel,
    MaxFrameAverageLightLevel,
}

/// Why a layer settled on its classification. Diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifyReason {
    NotValidated,
    ClientRequested,
    DebugForcedInvalid,
    DimLayer,
    DimDegenerateFrame,
    NoBufferHandle,
    ProtectedOnInsecureDisplay,
    SecureOnExternalDisplay,
    DebugForcedMm,
    DebugForcedUi,
    GlaiPath,
    UiPath,
    CursorPath,
    MmDisabled,
    MmPath,
    NoHardwarePath,
    ClientTarget,
}

/// Pixel formats allowed through the overlay-only path when the
/// bottom-of-stack layer needs PQ post-processing.
const PQ_OVERLAY_FORMATS: &[PixelFormat] = &[
    PixelFormat::Rgba8888,
    PixelFormat::Rgbx8888,
    PixelFormat::Rgb888,
    PixelFormat::Rgb565,
    PixelFormat::Rgba1010102,
    PixelFormat::Yuyv,
];

/// Everything `validate` needs from outside the layer, assembled by the
/// display for one frame.
pub struct ValidateContext<'a> {
    pub config: &'a PlatformConfig,
    pub validator: &'a dyn PathValidator,
    /// The owning display sits on a secure output path.
    pub display_secure: bool,
    /// The owning display is the primary/internal panel.
    pub display_internal: bool,
    /// Active PQ mode forwarded to the MM validity predicate.
    pub pq_mode_id: i32,
}

/// One composited surface and its full per-frame state.
#[derive(Debug)]
pub struct Layer {
    id: u64,
    name: String,
    /// Id of the owning display; resolved through the display registry,
    /// never a pointer.
    display_id: u64,
    /// Set at construction for the single client-target surface per
    /// display; immutable.
    is_client_target: bool,

    frame_state: FrameState,
    hw_type: HwLayerType,
    classify_reason: ClassifyReason,
    sf_requested_type: CompositionType,
    /// Last-frame snapshot of `sf_requested_type`; a changed request
    /// defeats the skip-validate fast path.
    last_sf_requested_type: CompositionType,
    returned_type: CompositionType,
    caps: LayerCaps,
    dirty: LayerDirty,

    // === Geometry ===
    source_crop: FRect,
    display_frame: Rect,
    transform: Transform,
    z_order: u32,
    plane_alpha: f32,
    blend_mode: BlendMode,
    visible_region: Vec<Rect>,
    damage_region: Vec<Rect>,
    /// Solid color for Dim/SolidColor layers (RGBA).
    color: [u8; 4],
    visible: bool,

    // === Buffer ===
    buffer: BufferRecord,

    // === HDR / PQ ===
    static_metadata: HashMap<MetadataKey, f32>,
    dynamic_metadata: Vec<u8>,
    hdr_source: HdrSource,
    app_game_pq: bool,
    ai_pq: bool,
    camera_preview_hdr: bool,
    ai_inference: bool,
    last_app_game_pq: bool,
    last_ai_pq: bool,
    last_camera_preview_hdr: bool,
    last_ai_inference: bool,

    /// At most one live AI/stream queue slot per layer.
    queue_slot: Option<u64>,
}

impl Layer {
    /// Create a new layer owned by `display_id`. Ids are process-wide
    /// unique and monotonically increasing.
    pub fn new(display_id: u64) -> Self {
        let id = NEXT_LAYER_ID.fetch_add(1, Ordering::Relaxed);
        trace!("layer {} created on display {}", id, display_id);
        Self {
            id,
            name: String::new(),
            display_id,
            is_client_target: false,
            frame_state: FrameState::Uncommitted,
            hw_type: HwLayerType::None,
            classify_reason: ClassifyReason::NotValidated,
            sf_requested_type: CompositionType::Device,
            last_sf_requested_type: CompositionType::Device,
            returned_type: CompositionType::Invalid,
            caps: LayerCaps::empty(),
            dirty: LayerDirty::empty(),
            source_crop: FRect::default(),
            display_frame: Rect::default(),
            transform: Transform::empty(),
            z_order: 0,
            plane_alpha: 1.0,
            blend_mode: BlendMode::None,
            visible_region: Vec::new(),
            damage_region: Vec::new(),
            color: [0; 4],
            visible: false,
            buffer: BufferRecord::new(),
            static_metadata: HashMap::new(),
            dynamic_metadata: Vec::new(),
            hdr_source: HdrSource::empty(),
            app_game_pq: false,
            ai_pq: false,
            camera_preview_hdr: false,
            ai_inference: false,
            last_app_game_pq: false,
            last_ai_pq: false,
            last_camera_preview_hdr: false,
            last_ai_inference: false,
            queue_slot: None,
        }
    }

    /// Create the single client-target (software fallback) layer for a
    /// display. The flag is immutable afterwards.
    pub fn new_client_target(display_id: u64) -> Self {
        let mut layer = Self::new(display_id);
        layer.is_client_target = true;
        layer.hw_type = HwLayerType::Fbt;
        layer.classify_reason = ClassifyReason::ClientTarget;
        layer
    }

    // === Identity and lifecycle queries ===

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn display_id(&self) -> u64 {
        self.display_id
    }

    /// Resolve the owning display through the registry. Layers hold the
    /// display id rather than a reference, so a display torn down while
    /// its layers are still draining yields `None` here instead of a
    /// dangling handle.
    pub fn resolve_display(&self, registry: &dyn DisplayDataRegistry) -> Option<DisplayData> {
        registry.display_data(self.display_id)
    }

    pub fn is_client_target(&self) -> bool {
        self.is_client_target
    }

    pub fn frame_state(&self) -> FrameState {
        self.frame_state
    }

    pub fn hw_type(&self) -> HwLayerType {
        self.hw_type
    }

    pub fn classify_reason(&self) -> ClassifyReason {
        self.classify_reason
    }

    pub fn sf_requested_type(&self) -> CompositionType {
        self.sf_requested_type
    }

    pub fn returned_type(&self) -> CompositionType {
        self.returned_type
    }

    pub fn caps(&self) -> LayerCaps {
        self.caps
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn z_order(&self) -> u32 {
        self.z_order
    }

    pub fn plane_alpha(&self) -> f32 {
        self.plane_alpha
    }

    pub fn blend_mode(&self) -> BlendMode {
        self.blend_mode
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn source_crop(&self) -> FRect {
        self.source_crop
    }

    pub fn display_frame(&self) -> Rect {
        self.display_frame
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn hdr_source(&self) -> HdrSource {
        self.hdr_source
    }

    pub fn buffer(&self) -> &BufferRecord {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut BufferRecord {
        &mut self.buffer
    }

    // === Dirty tracking ===

    pub fn is_state_changed(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn is_content_dirty(&self) -> bool {
        self.dirty.intersects(LayerDirty::CONTENT_DIRTY)
    }

    pub fn dirty(&self) -> LayerDirty {
        self.dirty
    }

    fn mark_dirty(&mut self, bits: LayerDirty) {
        self.dirty |= bits;
        if matches!(
            self.frame_state,
            FrameState::Uncommitted | FrameState::Presented
        ) {
            self.frame_state = FrameState::Pending;
        }
    }

    // === Property setters (upstream protocol surface) ===
    //
    // Every setter is a strict no-op when the new value equals the
    // current one: no dirty bit, no mutation.

    pub fn set_name(&mut self, name: &str) {
        if self.name == name {
            return;
        }
        self.name = name.to_string();
        self.mark_dirty(LayerDirty::NAME);
    }

    pub fn set_source_crop(&mut self, crop: FRect) {
        if self.source_crop == crop {
            return;
        }
        self.source_crop = crop;
        self.mark_dirty(LayerDirty::CROP);
    }

    /// Set the display frame, distinguishing an offset move from a size
    /// change as independent dirty bits.
    pub fn set_display_frame(&mut self, frame: Rect) {
        if self.display_frame == frame {
            return;
        }
        let mut bits = LayerDirty::FRAME;
        if frame.width() != self.display_frame.width()
            || frame.height() != self.display_frame.height()
        {
            bits |= LayerDirty::SIZE;
        }
        if frame.left != self.display_frame.left || frame.top != self.display_frame.top {
            bits |= LayerDirty::OFFSET;
        }
        self.display_frame = frame;
        self.mark_dirty(bits);
    }

    pub fn set_transform(&mut self, transform: Transform) {
        if self.transform == transform {
            return;
        }
        self.transform = transform;
        self.mark_dirty(LayerDirty::TRANSFORM);
    }

    pub fn set_z_order(&mut self, z: u32) {
        if self.z_order == z {
            return;
        }
        self.z_order = z;
        self.mark_dirty(LayerDirty::ZORDER);
    }

    /// Plane alpha must be a finite value in [0, 1]; anything else is a
    /// contract violation and prior state is retained.
    pub fn set_plane_alpha(&mut self, alpha: f32) -> Result<(), CompositionError> {
        if !alpha.is_finite() || !(0.0..=1.0).contains(&alpha) {
            return Err(CompositionError::BadParameter {
                field: "plane_alpha",
                reason: format!("{} outside [0, 1]", alpha),
            });
        }
        if self.plane_alpha == alpha {
            return Ok(());
        }
        self.plane_alpha = alpha;
        self.mark_dirty(LayerDirty::ALPHA);
        Ok(())
    }

    pub fn set_blend_mode(&mut self, mode: BlendMode) {
        if self.blend_mode == mode {
            return;
        }
        self.blend_mode = mode;
        self.mark_dirty(LayerDirty::BLEND);
    }

    pub fn set_visible_region(&mut self, region: Vec<Rect>) {
        if self.visible_region == region {
            return;
        }
        self.visible_region = region;
        self.mark_dirty(LayerDirty::VISIBLE_REGION);
    }

    pub fn set_damage_region(&mut self, region: Vec<Rect>) {
        if self.damage_region == region {
            return;
        }
        self.damage_region = region;
        self.mark_dirty(LayerDirty::DAMAGE);
    }

    pub fn set_color(&mut self, color: [u8; 4]) {
        if self.color == color {
            return;
        }
        self.color = color;
        self.mark_dirty(LayerDirty::COLOR);
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    /// Composition type requested by the upstream client for this layer.
    pub fn set_sf_requested_type(&mut self, ty: CompositionType) {
        self.sf_requested_type = ty;
        if matches!(
            self.frame_state,
            FrameState::Uncommitted | FrameState::Presented
        ) {
            self.frame_state = FrameState::Pending;
        }
    }

    /// Attach a buffer handle plus acquire fence. A format change is
    /// tracked as a bookkeeping-only bit on top of the content bit.
    pub fn set_buffer(&mut self, handle: Option<PrivateHandle>, acquire_fence: Fence) {
        let mut bits = LayerDirty::BUFFER;
        let prev_format = self.buffer.handle().map(|h| h.format);
        let prev_secure = self.buffer.handle().map(|h| h.is_secure());
        if let Some(h) = &handle {
            if prev_format.is_some_and(|f| f != h.format) {
                bits |= LayerDirty::FORMAT;
            }
            if prev_secure.is_some_and(|s| s != h.is_secure()) {
                bits |= LayerDirty::SECURE;
            }
            if h.is_hdr_tagged() {
                self.hdr_source |= HdrSource::GRALLOC;
            } else {
                self.hdr_source -= HdrSource::GRALLOC;
            }
        } else {
            // Detaching the buffer drops its allocator-side HDR signal.
            self.hdr_source -= HdrSource::GRALLOC;
        }
        self.buffer.set_handle(handle, acquire_fence);
        self.mark_dirty(bits);
    }

    /// Replace the per-frame static HDR metadata map.
    pub fn set_per_frame_metadata(&mut self, metadata: &[(MetadataKey, f32)]) {
        let new: HashMap<MetadataKey, f32> = metadata.iter().copied().collect();
        if self.static_metadata == new {
            return;
        }
        self.static_metadata = new;
        if self.static_metadata.is_empty() {
            self.hdr_source -= HdrSource::STATIC;
        } else {
            self.hdr_source |= HdrSource::STATIC;
        }
        self.mark_dirty(LayerDirty::HDR_STATIC);
    }

    pub fn set_dynamic_metadata(&mut self, blob: Vec<u8>) {
        if self.dynamic_metadata == blob {
            return;
        }
        self.dynamic_metadata = blob;
        if self.dynamic_metadata.is_empty() {
            self.hdr_source -= HdrSource::DYNAMIC;
        } else {
            self.hdr_source |= HdrSource::DYNAMIC;
        }
        self.mark_dirty(LayerDirty::HDR_DYNAMIC);
    }

    // === PQ / AI per-frame flags ===

    pub fn set_app_game_pq(&mut self, on: bool) {
        self.app_game_pq = on;
    }

    pub fn set_ai_pq(&mut self, on: bool) {
        self.ai_pq = on;
    }

    pub fn set_camera_preview_hdr(&mut self, on: bool) {
        self.camera_preview_hdr = on;
    }

    pub fn set_ai_inference(&mut self, on: bool) {
        self.ai_inference = on;
    }

    /// Whether this layer requires PQ post-processing. Stable across
    /// exactly one frame boundary via the last-frame snapshots.
    pub fn is_need_pq(&self, config: &PlatformConfig) -> bool {
        let game = config.pq.game_pq && (self.app_game_pq || self.last_app_game_pq);
        let ai = config.pq.ai_pq && (self.ai_pq || self.last_ai_pq);
        let camera = self.camera_preview_hdr || self.last_camera_preview_hdr;
        game || ai || camera
    }

    pub fn is_ai_pq(&self) -> bool {
        self.ai_pq || self.last_ai_pq
    }

    /// Whether the upstream composition-type request matches its
    /// last-frame snapshot. Request changes carry no dirty bit, so the
    /// skip-validate gate checks this separately.
    pub fn request_stable(&self) -> bool {
        self.sf_requested_type == self.last_sf_requested_type
    }

    /// Whether the PQ/AI flags match their last-frame snapshots; one of
    /// the gates for the display's skip-validate fast path.
    pub fn pq_state_stable(&self) -> bool {
        self.app_game_pq == self.last_app_game_pq
            && self.ai_pq == self.last_ai_pq
            && self.camera_preview_hdr == self.last_camera_preview_hdr
            && self.ai_inference == self.last_ai_inference
    }

    /// Bind an AI/stream queue slot to this layer. At most one slot may
    /// be live; a previous slot is released first.
    pub fn bind_queue_slot(&mut self, slot: u64) {
        if self.queue_slot.is_some() {
            self.release_queue_slot();
        }
        self.queue_slot = Some(slot);
    }

    pub fn queue_slot(&self) -> Option<u64> {
        self.queue_slot
    }

    fn release_queue_slot(&mut self) {
        if let Some(slot) = self.queue_slot.take() {
            debug!("layer {} released queue slot {}", self.id, slot);
        }
    }

    // === Classification ===

    /// Classify this layer for the current frame.
    ///
    /// First match wins; failure is not an error but the `Invalid`
    /// outcome, which routes the layer to client composition.
    pub fn validate(&mut self, ctx: &ValidateContext<'_>) {
        if self.is_client_target {
            self.set_hw_type(HwLayerType::Fbt, ClassifyReason::ClientTarget);
            self.frame_state = FrameState::Classified;
            return;
        }

        let hints = &ctx.config.debug;

        // 1. Forced software composition.
        if self.sf_requested_type == CompositionType::Client {
            self.set_hw_type(HwLayerType::Invalid, ClassifyReason::ClientRequested);
        } else if hints.force_invalid_layer == Some(self.id) {
            self.set_hw_type(HwLayerType::Invalid, ClassifyReason::DebugForcedInvalid);
        }
        // 2. Solid color / dim, legitimately handle-less.
        else if self.sf_requested_type == CompositionType::SolidColor
            || hints.force_dim_layer == Some(self.id)
        {
            if self.display_frame.is_degenerate() {
                self.set_hw_type(HwLayerType::Invalid, ClassifyReason::DimDegenerateFrame);
            } else {
                self.set_hw_type(HwLayerType::Dim, ClassifyReason::DimLayer);
            }
        }
        // 3. Everything past here needs a buffer.
        else if !self.buffer.has_handle() {
            self.set_hw_type(HwLayerType::Invalid, ClassifyReason::NoBufferHandle);
        }
        // 4. Protected content on a non-secure display.
        else if self.buffer.handle().is_some_and(|h| h.is_protected()) && !ctx.display_secure {
            self.set_hw_type(
                HwLayerType::Invalid,
                ClassifyReason::ProtectedOnInsecureDisplay,
            );
        }
        // 5. Secure non-video content off the secure/internal displays.
        else if self
            .buffer
            .handle()
            .is_some_and(|h| h.is_secure() && !h.is_video_source())
            && !ctx.display_secure
            && !ctx.display_internal
        {
            self.set_hw_type(HwLayerType::Invalid, ClassifyReason::SecureOnExternalDisplay);
        }
        // 6. Debug-hint overrides, still gated by the path predicates.
        else if hints.force_mm_layer == Some(self.id)
            && ctx.validator.is_mm_layer_valid(self, ctx.pq_mode_id).0
        {
            self.set_hw_type(HwLayerType::Mm, ClassifyReason::DebugForcedMm);
        } else if hints.force_ui_layer == Some(self.id) && ctx.validator.is_ui_layer_valid(self).0 {
            self.set_hw_type(HwLayerType::Ui, ClassifyReason::DebugForcedUi);
        }
        // 7. AI-inference path.
        else if !ctx.config.composition.disable_glai && ctx.validator.is_glai_layer_valid(self).0
        {
            self.set_hw_type(HwLayerType::Glai, ClassifyReason::GlaiPath);
        }
        // 8. Plain UI overlay path (or hardware cursor when requested).
        else if !ctx.config.composition.disable_ui && ctx.validator.is_ui_layer_valid(self).0 {
            if self.sf_requested_type == CompositionType::Cursor {
                self.set_hw_type(HwLayerType::Cursor, ClassifyReason::CursorPath);
            } else {
                self.set_hw_type(HwLayerType::Ui, ClassifyReason::UiPath);
            }
        }
        // 9/10. Media path, unless globally disabled.
        else if ctx.config.composition.disable_mm {
            self.set_hw_type(HwLayerType::Invalid, ClassifyReason::MmDisabled);
        } else if ctx.validator.is_mm_layer_valid(self, ctx.pq_mode_id).0 {
            self.set_hw_type(HwLayerType::Mm, ClassifyReason::MmPath);
        }
        // 11. No hardware path left.
        else {
            self.set_hw_type(HwLayerType::Invalid, ClassifyReason::NoHardwarePath);
        }

        self.frame_state = FrameState::Classified;
        trace!(
            "layer {} validated: {:?} ({:?})",
            self.id,
            self.hw_type,
            self.classify_reason
        );
    }

    fn set_hw_type(&mut self, ty: HwLayerType, reason: ClassifyReason) {
        let was_queue_path = matches!(self.hw_type, HwLayerType::Mm | HwLayerType::Glai);
        let is_queue_path = matches!(ty, HwLayerType::Mm | HwLayerType::Glai);
        if was_queue_path && !is_queue_path {
            // Leaving the MM/GLAI paths drops the streaming queue slot.
            self.release_queue_slot();
        }
        self.hw_type = ty;
        self.classify_reason = reason;
        self.caps = LayerCaps::empty();
        self.returned_type = derive_returned_type(ty, self.sf_requested_type);
    }

    /// Refine capabilities after classification.
    ///
    /// `is_bottom` marks the lowest visible non-client-target layer;
    /// `overlay` answers the owning display's overlay-device capability
    /// queries.
    pub fn complete_layer_caps(
        &mut self,
        config: &PlatformConfig,
        overlay: &dyn OverlayCaps,
        is_bottom: bool,
    ) {
        match self.hw_type {
            HwLayerType::Mm => {
                if overlay.supports_mml() && !config.pq.game_hdr {
                    self.caps |= LayerCaps::MML_OVERLAY_ONLY;
                }
                if self
                    .buffer
                    .handle()
                    .is_some_and(|h| h.is_protected() || h.is_secure())
                {
                    self.caps |= LayerCaps::NO_MDP;
                }
                // Beyond the MDP scaler input limit, or with a rotation
                // the engine cannot do, the layer must stay overlay-only.
                let too_wide = self
                    .buffer
                    .handle()
                    .is_some_and(|h| h.width > overlay.max_scaler_input_width());
                let unrotatable = !self.transform.is_empty()
                    && !overlay.supports_rotation(self.transform.bits());
                if too_wide || unrotatable {
                    self.caps |= LayerCaps::NO_MDP;
                }
                if is_bottom && (self.is_need_pq(config) || self.is_ai_pq()) {
                    let format = self.buffer.handle().map(|h| h.format);
                    let allowed = format.is_some_and(|f| PQ_OVERLAY_FORMATS.contains(&f));
                    if !allowed {
                        // Unexpected format on the restricted overlay-only
                        // path; leave the capability unset so the layer
                        // falls back, never fatal.
                        error!(
                            "layer {}: format {:?} not allowed on PQ overlay-only path",
                            self.id, format
                        );
                        self.caps -= LayerCaps::MML_OVERLAY_ONLY;
                    }
                }
            }
            HwLayerType::Ui => {
                if config.debug.overlay_only_ui_layer == Some(self.id) {
                    self.caps |= LayerCaps::OVERLAY_ONLY_UI;
                }
            }
            _ => {}
        }

        let debug_forced = matches!(
            self.classify_reason,
            ClassifyReason::DebugForcedMm
                | ClassifyReason::DebugForcedUi
                | ClassifyReason::DebugForcedInvalid
        );
        if config.composition.client_clear
            && self.hw_type != HwLayerType::Invalid
            && !debug_forced
            && self.blend_mode == BlendMode::None
        {
            self.caps |= LayerCaps::CLIENT_CLEAR;
        }
    }

    // === Frame boundary ===

    /// The display's present step consumed this layer's classification.
    pub(crate) fn mark_presented(&mut self) {
        self.frame_state = FrameState::Presented;
    }

    /// Roll per-frame state forward after the hardware present.
    ///
    /// Flushes the buffer fence state, clears the dirty mask (unless the
    /// skip-validate fast path asked to keep it), resets visibility, and
    /// snapshots the PQ/AI booleans the next frame's decisions depend on.
    pub fn after_present(&mut self, keep_dirty: bool) {
        self.buffer.after_present();
        if !keep_dirty {
            self.dirty = LayerDirty::empty();
        }
        self.visible = false;
        self.last_sf_requested_type = self.sf_requested_type;
        self.last_app_game_pq = self.app_game_pq;
        self.last_ai_pq = self.ai_pq;
        self.last_camera_preview_hdr = self.camera_preview_hdr;
        self.last_ai_inference = self.ai_inference;
        self.frame_state = FrameState::Pending;
    }

    /// Release everything the layer owns. Valid from any lifecycle
    /// state; called by the display when the layer is evicted.
    pub fn destroy(&mut self, models: &dyn ModelController) {
        if self.last_ai_inference || self.ai_inference || self.queue_slot.is_some() {
            models.clean_model(self.id);
        }
        self.release_queue_slot();
        self.buffer.release_all();
        debug!("layer {} destroyed", self.id);
    }

    /// One-line human-readable snapshot for the debug dump.
    pub fn dump(&self) -> String {
        format!(
            "layer {:>4} z={:<3} {:?}/{:?} req={:?} ret={:?} dirty={:#x} caps={:#x} frame=({},{},{},{}) alpha={:.2} {}",
            self.id,
            self.z_order,
            self.hw_type,
            self.frame_state,
            self.sf_requested_type,
            self.returned_type,
            self.dirty.bits(),
            self.caps.bits(),
            self.display_frame.left,
            self.display_frame.top,
            self.display_frame.right,
            self.display_frame.bottom,
            self.plane_alpha,
            self.name
        )
    }
}

/// Fixed mapping from the internal classification to the composition
/// type reported back upstream. The Cursor→Device branch preserves an
/// upstream-protocol quirk (cursor device composition unsupported); do
/// not re-derive this table.
pub fn derive_returned_type(hw: HwLayerType, requested: CompositionType) -> CompositionType {
    match hw {
        HwLayerType::Invalid | HwLayerType::Fbt => CompositionType::Client,
        HwLayerType::Dim => CompositionType::SolidColor,
        HwLayerType::Cursor => CompositionType::Device,
        HwLayerType::Ui | HwLayerType::Mm | HwLayerType::Glai => CompositionType::Device,
        HwLayerType::None | HwLayerType::Ignore | HwLayerType::Wormhole => requested,
    }
}

impl Drop for Layer {
    fn drop(&mut self) {
        if self.queue_slot.is_some() {
            warn!("layer {} dropped with live queue slot", self.id);
        }
    }
}

#[cfg(test)]
mod tests;
