//! Color mode and histogram bookkeeping
//!
//! Per-display color-mode/render-intent state and the content-sampling
//! (histogram) enable/collect counters. The hardware sampling itself is
//! an external collaborator; this module only tracks what was requested
//! and what has been collected, so the display can answer upstream
//! queries consistently.

use bitflags::bitflags;
use log::debug;

use crate::error::CompositionError;

/// Color modes supported by the composition core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Native,
    Srgb,
    DisplayP3,
}

/// Render intents per the upstream color management protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderIntent {
    Colorimetric,
    Enhance,
    ToneMapColorimetric,
    ToneMapEnhance,
}

bitflags! {
    /// Color components the histogram engine can sample.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HistogramComponents: u8 {
        const RED   = 1 << 0;
        const GREEN = 1 << 1;
        const BLUE  = 1 << 2;
        const LUMA  = 1 << 3;
    }
}

/// 4x4 color transform in row-major order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorTransform {
    pub matrix: [f32; 16],
}

impl ColorTransform {
    pub const IDENTITY: ColorTransform = ColorTransform {
        matrix: [
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ],
    };

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }
}

impl Default for ColorTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Histogram sampling state for one display.
#[derive(Debug, Default)]
pub struct HistogramState {
    enabled: bool,
    components: HistogramComponents,
    /// Buckets per component requested by the client.
    sample_count: u32,
    /// Frames sampled since enable.
    collected_frames: u64,
}

impl HistogramState {
    /// Enable sampling. A zero sample count or empty component mask is a
    /// contract violation.
    pub fn enable(
        &mut self,
        components: HistogramComponents,
        sample_count: u32,
    ) -> Result<(), CompositionError> {
        if components.is_empty() {
            return Err(CompositionError::BadParameter {
                field: "histogram_components",
                reason: "empty component mask".into(),
            });
        }
        if sample_count == 0 {
            return Err(CompositionError::BadParameter {
                field: "sample_count",
                reason: "zero buckets".into(),
            });
        }
        self.enabled = true;
        self.components = components;
        self.sample_count = sample_count;
        self.collected_frames = 0;
        debug!(
            "histogram enabled: components={:?} buckets={}",
            components, sample_count
        );
        Ok(())
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.components = HistogramComponents::empty();
        self.sample_count = 0;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn components(&self) -> HistogramComponents {
        self.components
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn collected_frames(&self) -> u64 {
        self.collected_frames
    }

    /// Record that a frame was sampled; called from the display's present
    /// step while sampling is on.
    pub fn on_frame_sampled(&mut self) {
        if self.enabled {
            self.collected_frames += 1;
        }
    }
}

/// Per-display color state: active mode/intent, supported-mode registry,
/// and the current color transform.
#[derive(Debug)]
pub struct ColorState {
    supported_modes: Vec<(ColorMode, Vec<RenderIntent>)>,
    mode: ColorMode,
    intent: RenderIntent,
    transform: ColorTransform,
    pub histogram: HistogramState,
}

impl ColorState {
    pub fn new(supported_modes: Vec<(ColorMode, Vec<RenderIntent>)>) -> Self {
        Self {
            supported_modes,
            mode: ColorMode::Native,
            intent: RenderIntent::Colorimetric,
            transform: ColorTransform::IDENTITY,
            histogram: HistogramState::default(),
        }
    }

    /// Default supported set: native and sRGB, colorimetric only.
    pub fn with_defaults() -> Self {
        Self::new(vec![
            (ColorMode::Native, vec![RenderIntent::Colorimetric]),
            (
                ColorMode::Srgb,
                vec![RenderIntent::Colorimetric, RenderIntent::Enhance],
            ),
        ])
    }

    pub fn supported_modes(&self) -> impl Iterator<Item = ColorMode> + '_ {
        self.supported_modes.iter().map(|(m, _)| *m)
    }

    pub fn mode(&self) -> ColorMode {
        self.mode
    }

    pub fn render_intent(&self) -> RenderIntent {
        self.intent
    }

    pub fn transform(&self) -> ColorTransform {
        self.transform
    }

    /// Switch color mode with a render intent, validated against the
    /// supported-mode registry. State is unchanged on rejection.
    pub fn set_color_mode_with_render_intent(
        &mut self,
        mode: ColorMode,
        intent: RenderIntent,
    ) -> Result<(), CompositionError> {
        let supported = self
            .supported_modes
            .iter()
            .find(|(m, _)| *m == mode)
            .map(|(_, intents)| intents.contains(&intent))
            .unwrap_or(false);

        if !supported {
            return Err(CompositionError::BadParameter {
                field: "color_mode",
                reason: format!("{:?}/{:?} not supported", mode, intent),
            });
        }

        if self.mode != mode || self.intent != intent {
            debug!("color mode -> {:?}/{:?}", mode, intent);
            self.mode = mode;
            self.intent = intent;
        }
        Ok(())
    }

    /// Set the display color transform. Returns true if the transform
    /// changed (the display marks its state dirty on change).
    pub fn set_color_transform(&mut self, transform: ColorTransform) -> bool {
        if self.transform == transform {
            return false;
        }
        self.transform = transform;
        true
    }
}
