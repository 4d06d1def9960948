//! External collaborator interfaces
//!
//! The composition core never talks to hardware directly; everything the
//! classification ladder needs from the platform comes in through these
//! trait seams. Production wires in the real overlay device and platform
//! registry; tests wire in scripted doubles.

use crate::layer::Layer;

/// Opaque diagnostic tag attached to a validity verdict. Carries no
/// behavioral meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReasonTag(pub u32);

impl ReasonTag {
    pub const NONE: ReasonTag = ReasonTag(0);
}

/// Hardware-path validity predicates consulted during classification.
pub trait PathValidator {
    /// Can this layer go through the MM (MDP scaling/rotation) path?
    fn is_mm_layer_valid(&self, layer: &Layer, pq_mode_id: i32) -> (bool, ReasonTag);

    /// Can this layer go through the plain UI overlay path?
    fn is_ui_layer_valid(&self, layer: &Layer) -> (bool, ReasonTag);

    /// Can this layer go through the AI-inference (GLAI) path?
    fn is_glai_layer_valid(&self, layer: &Layer) -> (bool, ReasonTag);
}

/// Overlay-device capability queries.
pub trait OverlayCaps {
    /// Maximum input width the MDP scaler accepts.
    fn max_scaler_input_width(&self) -> u32;

    /// Whether the overlay engine can rotate with the given transform
    /// bitmask.
    fn supports_rotation(&self, transform: u32) -> bool;

    /// Whether the overlay engine can scale at all.
    fn supports_scaling(&self) -> bool;

    /// Whether the display supports the MML (AI/ML overlay) path.
    fn supports_mml(&self) -> bool;
}

/// AI-inference model lifecycle, owned by the GPU/AI controller.
pub trait ModelController {
    /// Release the inference model bound to a layer. Must be safe to call
    /// for layers that never held a model.
    fn clean_model(&self, layer_id: u64);
}

/// Per-display data published by the display manager.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayData {
    pub width: u32,
    pub height: u32,
    pub refresh_hz: f32,
    /// Primary/internal panel vs. external or virtual display.
    pub is_internal: bool,
    /// Display sits on a secure output path.
    pub is_secure: bool,
}

/// Registry resolving display ids to their published data.
///
/// This is the id-based weak back-reference from Layer/Display code to
/// the display manager: a missing display yields `None`, never dangling
/// state.
pub trait DisplayDataRegistry {
    fn display_data(&self, display_id: u64) -> Option<DisplayData>;
}

/// A model controller that owns nothing; used where no AI controller is
/// wired in.
#[derive(Debug, Default)]
pub struct NullModelController;

impl ModelController for NullModelController {
    fn clean_model(&self, _layer_id: u64) {}
}
