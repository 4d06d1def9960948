//! Unit tests for layer classification, dirty tracking, and the frame
//! lifecycle state machine.

use super::*;
use crate::buffer::{BufferUsage, RawBuffer};
use crate::hal::ReasonTag;
use proptest::prelude::*;

/// Path validator double with scripted verdicts.
struct ScriptedValidator {
    mm: bool,
    ui: bool,
    glai: bool,
}

impl ScriptedValidator {
    fn all(mm: bool, ui: bool, glai: bool) -> Self {
        Self { mm, ui, glai }
    }
}

/// Overlay-device double; `mml` scripts the MML path capability.
struct Overlay {
    mml: bool,
}

impl OverlayCaps for Overlay {
    fn max_scaler_input_width(&self) -> u32 {
        4096
    }
    fn supports_rotation(&self, _transform: u32) -> bool {
        true
    }
    fn supports_scaling(&self) -> bool {
        true
    }
    fn supports_mml(&self) -> bool {
        self.mml
    }
}

impl PathValidator for ScriptedValidator {
    fn is_mm_layer_valid(&self, _layer: &Layer, _pq_mode_id: i32) -> (bool, ReasonTag) {
        (self.mm, ReasonTag::NONE)
    }

    fn is_ui_layer_valid(&self, _layer: &Layer) -> (bool, ReasonTag) {
        (self.ui, ReasonTag::NONE)
    }

    fn is_glai_layer_valid(&self, _layer: &Layer) -> (bool, ReasonTag) {
        (self.glai, ReasonTag::NONE)
    }
}

fn ctx<'a>(
    config: &'a PlatformConfig,
    validator: &'a ScriptedValidator,
    secure: bool,
    internal: bool,
) -> ValidateContext<'a> {
    ValidateContext {
        config,
        validator,
        display_secure: secure,
        display_internal: internal,
        pq_mode_id: 0,
    }
}

fn handle_with_usage(usage: BufferUsage) -> PrivateHandle {
    PrivateHandle::from_raw(&RawBuffer {
        id: 1,
        format: PixelFormat::Rgba8888,
        width: 1920,
        height: 1080,
        stride: 1920,
        usage,
    })
}

fn layer_with_buffer() -> Layer {
    let mut layer = Layer::new(0);
    layer.set_buffer(Some(handle_with_usage(BufferUsage::HW_TEXTURE)), Fence::invalid());
    layer.set_display_frame(Rect::new(0, 0, 100, 100));
    layer
}

// === Classification ladder ===

#[test]
fn test_client_requested_always_invalid() {
    let config = PlatformConfig::default();
    let validator = ScriptedValidator::all(true, true, true);
    let mut layer = layer_with_buffer();
    layer.set_sf_requested_type(CompositionType::Client);

    layer.validate(&ctx(&config, &validator, true, true));
    assert_eq!(layer.hw_type(), HwLayerType::Invalid);
    assert_eq!(layer.returned_type(), CompositionType::Client);
    assert_eq!(layer.classify_reason(), ClassifyReason::ClientRequested);
}

#[test]
fn test_solid_color_degenerate_frame_is_invalid() {
    let config = PlatformConfig::default();
    let validator = ScriptedValidator::all(true, true, true);
    let mut layer = Layer::new(0);
    layer.set_sf_requested_type(CompositionType::SolidColor);
    layer.set_display_frame(Rect::new(10, 10, 10, 50));

    layer.validate(&ctx(&config, &validator, false, true));
    assert_eq!(layer.hw_type(), HwLayerType::Invalid);
    assert_eq!(layer.classify_reason(), ClassifyReason::DimDegenerateFrame);
}

#[test]
fn test_solid_color_classifies_dim() {
    let config = PlatformConfig::default();
    let validator = ScriptedValidator::all(false, false, false);
    let mut layer = Layer::new(0);
    layer.set_sf_requested_type(CompositionType::SolidColor);
    layer.set_display_frame(Rect::new(0, 0, 100, 100));

    layer.validate(&ctx(&config, &validator, false, true));
    assert_eq!(layer.hw_type(), HwLayerType::Dim);
    assert_eq!(layer.returned_type(), CompositionType::SolidColor);
}

#[test]
fn test_missing_handle_is_invalid() {
    let config = PlatformConfig::default();
    let validator = ScriptedValidator::all(true, true, true);
    let mut layer = Layer::new(0);
    layer.set_display_frame(Rect::new(0, 0, 100, 100));

    layer.validate(&ctx(&config, &validator, true, true));
    assert_eq!(layer.hw_type(), HwLayerType::Invalid);
    assert_eq!(layer.classify_reason(), ClassifyReason::NoBufferHandle);
}

#[test]
fn test_protected_content_needs_secure_display() {
    let config = PlatformConfig::default();
    let validator = ScriptedValidator::all(true, true, true);
    let mut layer = Layer::new(0);
    layer.set_buffer(Some(handle_with_usage(BufferUsage::PROTECTED)), Fence::invalid());

    layer.validate(&ctx(&config, &validator, false, true));
    assert_eq!(layer.hw_type(), HwLayerType::Invalid);
    assert_eq!(
        layer.classify_reason(),
        ClassifyReason::ProtectedOnInsecureDisplay
    );

    layer.validate(&ctx(&config, &validator, true, true));
    assert_ne!(layer.hw_type(), HwLayerType::Invalid);
}

#[test]
fn test_secure_buffer_on_external_display_is_invalid() {
    let config = PlatformConfig::default();
    let validator = ScriptedValidator::all(true, true, true);
    let mut layer = Layer::new(0);
    layer.set_buffer(Some(handle_with_usage(BufferUsage::SECURE)), Fence::invalid());

    // Non-secure, non-internal display.
    layer.validate(&ctx(&config, &validator, false, false));
    assert_eq!(layer.hw_type(), HwLayerType::Invalid);
    assert_eq!(
        layer.classify_reason(),
        ClassifyReason::SecureOnExternalDisplay
    );
}

#[test]
fn test_secure_video_allowed_on_external_display() {
    let config = PlatformConfig::default();
    let validator = ScriptedValidator::all(true, false, false);
    let mut layer = Layer::new(0);
    layer.set_buffer(
        Some(handle_with_usage(BufferUsage::SECURE | BufferUsage::VIDEO_SOURCE)),
        Fence::invalid(),
    );

    layer.validate(&ctx(&config, &validator, false, false));
    assert_eq!(layer.hw_type(), HwLayerType::Mm);
}

#[test]
fn test_glai_preferred_over_ui_and_mm() {
    let config = PlatformConfig::default();
    let validator = ScriptedValidator::all(true, true, true);
    let mut layer = layer_with_buffer();

    layer.validate(&ctx(&config, &validator, false, true));
    assert_eq!(layer.hw_type(), HwLayerType::Glai);
    assert_eq!(layer.returned_type(), CompositionType::Device);
}

#[test]
fn test_glai_disabled_falls_to_ui() {
    let mut config = PlatformConfig::default();
    config.composition.disable_glai = true;
    let validator = ScriptedValidator::all(true, true, true);
    let mut layer = layer_with_buffer();

    layer.validate(&ctx(&config, &validator, false, true));
    assert_eq!(layer.hw_type(), HwLayerType::Ui);
}

#[test]
fn test_cursor_request_on_ui_path() {
    let mut config = PlatformConfig::default();
    config.composition.disable_glai = true;
    let validator = ScriptedValidator::all(false, true, false);
    let mut layer = layer_with_buffer();
    layer.set_sf_requested_type(CompositionType::Cursor);

    layer.validate(&ctx(&config, &validator, false, true));
    assert_eq!(layer.hw_type(), HwLayerType::Cursor);
    // Cursor device composition is unsupported upstream; reported as
    // Device.
    assert_eq!(layer.returned_type(), CompositionType::Device);
}

#[test]
fn test_mm_disabled_is_invalid() {
    let mut config = PlatformConfig::default();
    config.composition.disable_glai = true;
    config.composition.disable_ui = true;
    config.composition.disable_mm = true;
    let validator = ScriptedValidator::all(true, true, true);
    let mut layer = layer_with_buffer();

    layer.validate(&ctx(&config, &validator, false, true));
    assert_eq!(layer.hw_type(), HwLayerType::Invalid);
    assert_eq!(layer.classify_reason(), ClassifyReason::MmDisabled);
}

#[test]
fn test_no_path_left_is_invalid() {
    let config = PlatformConfig::default();
    let validator = ScriptedValidator::all(false, false, false);
    let mut layer = layer_with_buffer();

    layer.validate(&ctx(&config, &validator, false, true));
    assert_eq!(layer.hw_type(), HwLayerType::Invalid);
    assert_eq!(layer.classify_reason(), ClassifyReason::NoHardwarePath);
}

#[test]
fn test_debug_hint_forces_mm() {
    let mut layer = layer_with_buffer();
    let mut config = PlatformConfig::default();
    config.debug.force_mm_layer = Some(layer.id());
    let validator = ScriptedValidator::all(true, true, true);

    layer.validate(&ctx(&config, &validator, false, true));
    assert_eq!(layer.hw_type(), HwLayerType::Mm);
    assert_eq!(layer.classify_reason(), ClassifyReason::DebugForcedMm);

    // Hint for a different layer id has no effect.
    config.debug.force_mm_layer = Some(layer.id() + 1000);
    layer.validate(&ctx(&config, &validator, false, true));
    assert_eq!(layer.hw_type(), HwLayerType::Glai);
}

#[test]
fn test_classify_away_from_mm_releases_queue_slot() {
    let config = PlatformConfig::default();
    let validator = ScriptedValidator::all(true, false, false);
    let mut layer = layer_with_buffer();

    layer.validate(&ctx(&config, &validator, false, true));
    assert_eq!(layer.hw_type(), HwLayerType::Mm);
    layer.bind_queue_slot(7);
    assert_eq!(layer.queue_slot(), Some(7));

    // Next frame the MM predicate fails; the slot must be released.
    let validator = ScriptedValidator::all(false, false, false);
    layer.validate(&ctx(&config, &validator, false, true));
    assert_eq!(layer.hw_type(), HwLayerType::Invalid);
    assert_eq!(layer.queue_slot(), None);
}

#[test]
fn test_client_target_always_fbt() {
    let config = PlatformConfig::default();
    let validator = ScriptedValidator::all(true, true, true);
    let mut layer = Layer::new_client_target(0);
    assert!(layer.is_client_target());

    layer.validate(&ctx(&config, &validator, true, true));
    assert_eq!(layer.hw_type(), HwLayerType::Fbt);
    assert_eq!(layer.returned_type(), CompositionType::Client);
}

// === Capability refinement ===

#[test]
fn test_mm_caps_mml_overlay() {
    let config = PlatformConfig::default();
    let validator = ScriptedValidator::all(true, false, false);
    let mut layer = layer_with_buffer();
    layer.validate(&ctx(&config, &validator, false, true));

    layer.complete_layer_caps(&config, &Overlay { mml: true }, false);
    assert!(layer.caps().contains(LayerCaps::MML_OVERLAY_ONLY));
    assert!(!layer.caps().contains(LayerCaps::NO_MDP));
}

#[test]
fn test_game_hdr_excludes_mml_overlay() {
    let mut config = PlatformConfig::default();
    config.pq.game_hdr = true;
    let validator = ScriptedValidator::all(true, false, false);
    let mut layer = layer_with_buffer();
    layer.validate(&ctx(&config, &validator, false, true));

    layer.complete_layer_caps(&config, &Overlay { mml: true }, false);
    assert!(!layer.caps().contains(LayerCaps::MML_OVERLAY_ONLY));
}

#[test]
fn test_protected_mm_forces_no_mdp() {
    let config = PlatformConfig::default();
    let validator = ScriptedValidator::all(true, false, false);
    let mut layer = Layer::new(0);
    layer.set_buffer(Some(handle_with_usage(BufferUsage::PROTECTED)), Fence::invalid());
    layer.validate(&ctx(&config, &validator, true, true));
    assert_eq!(layer.hw_type(), HwLayerType::Mm);

    layer.complete_layer_caps(&config, &Overlay { mml: true }, false);
    assert!(layer.caps().contains(LayerCaps::NO_MDP));
}

#[test]
fn test_bottom_pq_layer_format_restriction() {
    let config = PlatformConfig::default();
    let validator = ScriptedValidator::all(true, false, false);

    // Allowed format keeps the overlay-only capability.
    let mut layer = layer_with_buffer();
    layer.set_app_game_pq(true);
    layer.validate(&ctx(&config, &validator, false, true));
    layer.complete_layer_caps(&config, &Overlay { mml: true }, true);
    assert!(layer.caps().contains(LayerCaps::MML_OVERLAY_ONLY));

    // NV12 is outside the allowlist; capability cleared, not fatal.
    let mut layer = Layer::new(0);
    layer.set_buffer(
        Some(PrivateHandle::from_raw(&RawBuffer {
            id: 2,
            format: PixelFormat::Nv12,
            width: 1920,
            height: 1080,
            stride: 1920,
            usage: BufferUsage::VIDEO_SOURCE,
        })),
        Fence::invalid(),
    );
    layer.set_app_game_pq(true);
    layer.validate(&ctx(&config, &validator, false, true));
    layer.complete_layer_caps(&config, &Overlay { mml: true }, true);
    assert!(!layer.caps().contains(LayerCaps::MML_OVERLAY_ONLY));
}

#[test]
fn test_client_clear_eligibility() {
    let config = PlatformConfig::default();
    let validator = ScriptedValidator::all(false, true, false);
    let mut layer = layer_with_buffer();
    layer.validate(&ctx(&config, &validator, false, true));
    layer.complete_layer_caps(&config, &Overlay { mml: false }, false);
    assert!(layer.caps().contains(LayerCaps::CLIENT_CLEAR));

    // Alpha-blended layers are not eligible.
    layer.set_blend_mode(BlendMode::Premultiplied);
    layer.validate(&ctx(&config, &validator, false, true));
    layer.complete_layer_caps(&config, &Overlay { mml: false }, false);
    assert!(!layer.caps().contains(LayerCaps::CLIENT_CLEAR));

    // Invalid layers are not eligible.
    let validator = ScriptedValidator::all(false, false, false);
    let mut invalid = layer_with_buffer();
    invalid.validate(&ctx(&config, &validator, false, true));
    invalid.complete_layer_caps(&config, &Overlay { mml: false }, false);
    assert!(!invalid.caps().contains(LayerCaps::CLIENT_CLEAR));
}

// === Dirty tracking ===

#[test]
fn test_setter_idempotence() {
    let mut layer = Layer::new(0);
    layer.set_display_frame(Rect::new(0, 0, 100, 100));
    layer.after_present(false);
    assert!(!layer.is_state_changed());

    layer.set_display_frame(Rect::new(0, 0, 100, 100));
    assert!(!layer.is_state_changed());

    layer.set_z_order(0);
    assert!(!layer.is_state_changed());

    layer.set_z_order(3);
    assert!(layer.dirty().contains(LayerDirty::ZORDER));
}

#[test]
fn test_offset_vs_size_bits() {
    let mut layer = Layer::new(0);
    layer.set_display_frame(Rect::new(0, 0, 100, 100));
    layer.after_present(false);

    // Pure move: offset bit only.
    layer.set_display_frame(Rect::new(10, 10, 110, 110));
    assert!(layer.dirty().contains(LayerDirty::OFFSET));
    assert!(!layer.dirty().contains(LayerDirty::SIZE));

    layer.after_present(false);

    // Pure resize: size bit only.
    layer.set_display_frame(Rect::new(10, 10, 210, 110));
    assert!(layer.dirty().contains(LayerDirty::SIZE));
    assert!(!layer.dirty().contains(LayerDirty::OFFSET));
}

#[test]
fn test_name_change_is_not_content_dirty() {
    let mut layer = Layer::new(0);
    layer.set_name("status-bar");
    assert!(layer.is_state_changed());
    assert!(!layer.is_content_dirty());

    layer.set_source_crop(FRect::new(0.0, 0.0, 64.0, 64.0));
    assert!(layer.is_content_dirty());
}

#[test]
fn test_bad_alpha_rejected_state_retained() {
    let mut layer = Layer::new(0);
    layer.set_plane_alpha(0.5).unwrap();
    layer.after_present(false);

    assert!(layer.set_plane_alpha(1.5).is_err());
    assert!(layer.set_plane_alpha(f32::NAN).is_err());
    assert!(layer.set_plane_alpha(-0.1).is_err());
    assert_eq!(layer.plane_alpha(), 0.5);
    assert!(!layer.is_state_changed());
}

proptest! {
    /// Calling any geometry setter twice with the same value sets the
    /// dirty bit at most once; the second call is a full no-op.
    #[test]
    fn prop_double_set_is_noop(left in -500i32..500, top in -500i32..500,
                               w in 1i32..500, h in 1i32..500, z in 0u32..64) {
        let mut layer = Layer::new(0);
        let frame = Rect::new(left, top, left + w, top + h);

        layer.set_display_frame(frame);
        layer.set_z_order(z);
        let dirty_after_first = layer.dirty();

        layer.set_display_frame(frame);
        layer.set_z_order(z);
        prop_assert_eq!(layer.dirty(), dirty_after_first);
    }
}

// === Frame lifecycle ===

#[test]
fn test_lifecycle_transitions() {
    let config = PlatformConfig::default();
    let validator = ScriptedValidator::all(true, true, true);
    let mut layer = Layer::new(0);
    assert_eq!(layer.frame_state(), FrameState::Uncommitted);

    layer.set_display_frame(Rect::new(0, 0, 10, 10));
    assert_eq!(layer.frame_state(), FrameState::Pending);

    layer.set_buffer(Some(handle_with_usage(BufferUsage::HW_TEXTURE)), Fence::invalid());
    layer.validate(&ctx(&config, &validator, false, true));
    assert_eq!(layer.frame_state(), FrameState::Classified);

    layer.mark_presented();
    assert_eq!(layer.frame_state(), FrameState::Presented);

    layer.after_present(false);
    assert_eq!(layer.frame_state(), FrameState::Pending);
}

#[test]
fn test_after_present_clears_dirty_and_snapshots() {
    let mut layer = Layer::new(0);
    layer.set_display_frame(Rect::new(0, 0, 10, 10));
    layer.set_visible(true);
    layer.set_app_game_pq(true);
    layer.set_ai_pq(true);

    layer.after_present(false);
    assert!(!layer.is_state_changed());
    assert!(!layer.is_visible());
    // Snapshots keep the PQ predicates stable across one frame boundary.
    let config = PlatformConfig::default();
    let mut cfg = config.clone();
    cfg.pq.ai_pq = true;
    layer.set_app_game_pq(false);
    layer.set_ai_pq(false);
    assert!(layer.is_need_pq(&cfg));
    assert!(layer.is_ai_pq());

    // One more boundary and the stale flags age out.
    layer.after_present(false);
    assert!(!layer.is_need_pq(&cfg));
}

#[test]
fn test_after_present_keep_dirty_preserves_mask() {
    let mut layer = Layer::new(0);
    layer.set_display_frame(Rect::new(0, 0, 10, 10));
    let dirty = layer.dirty();

    layer.after_present(true);
    assert_eq!(layer.dirty(), dirty);
}

#[test]
fn test_revalidate_after_present_reproduces_type() {
    let config = PlatformConfig::default();
    let validator = ScriptedValidator::all(true, true, false);
    let mut layer = layer_with_buffer();

    layer.validate(&ctx(&config, &validator, false, true));
    let first = layer.hw_type();
    layer.mark_presented();
    layer.after_present(true);

    // Identical inputs, skip-validate style re-run.
    layer.validate(&ctx(&config, &validator, false, true));
    assert_eq!(layer.hw_type(), first);
}

#[test]
fn test_request_snapshot_rolls_at_frame_boundary() {
    let mut layer = layer_with_buffer();
    assert!(layer.request_stable());

    layer.set_sf_requested_type(CompositionType::Cursor);
    assert!(!layer.request_stable());

    layer.after_present(false);
    assert!(layer.request_stable());
}

#[test]
fn test_hdr_source_tracking() {
    let mut layer = Layer::new(0);
    assert_eq!(layer.hdr_source(), HdrSource::empty());

    layer.set_per_frame_metadata(&[(MetadataKey::MaxLuminance, 1000.0)]);
    assert!(layer.hdr_source().contains(HdrSource::STATIC));

    layer.set_dynamic_metadata(vec![1, 2, 3]);
    assert!(layer.hdr_source().contains(HdrSource::DYNAMIC));

    layer.set_buffer(Some(handle_with_usage(BufferUsage::HDR)), Fence::invalid());
    assert!(layer.hdr_source().contains(HdrSource::GRALLOC));

    layer.set_per_frame_metadata(&[]);
    assert!(!layer.hdr_source().contains(HdrSource::STATIC));

    // Detaching the buffer drops the allocator-side signal with it.
    layer.set_buffer(None, Fence::invalid());
    assert!(!layer.hdr_source().contains(HdrSource::GRALLOC));
}

#[test]
fn test_layer_ids_unique_and_monotonic() {
    let a = Layer::new(0);
    let b = Layer::new(0);
    let c = Layer::new(1);
    assert!(a.id() < b.id());
    assert!(b.id() < c.id());
}

#[test]
fn test_resolve_display_through_registry() {
    struct OneDisplay;
    impl DisplayDataRegistry for OneDisplay {
        fn display_data(&self, display_id: u64) -> Option<DisplayData> {
            (display_id == 0).then_some(DisplayData {
                width: 1080,
                height: 2400,
                refresh_hz: 120.0,
                is_internal: true,
                is_secure: false,
            })
        }
    }

    let attached = Layer::new(0);
    let orphaned = Layer::new(7);
    let data = attached.resolve_display(&OneDisplay).unwrap();
    assert!(data.is_internal);
    assert_eq!(orphaned.resolve_display(&OneDisplay), None);
}
