//! Platform configuration for the composition core
//!
//! This module handles loading, parsing, and validating configuration
//! from TOML files. The resulting `PlatformConfig` is constructed once at
//! startup, immutable thereafter, and passed explicitly into
//! classification and capability calls — never consulted through a
//! hidden singleton.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level configuration for the composition core.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PlatformConfig {
    /// Composition-path kill switches and policy toggles.
    #[serde(default)]
    pub composition: CompositionConfig,

    /// Debug hints that force classification outcomes for specific layers.
    #[serde(default)]
    pub debug: DebugHints,

    /// Picture-quality pipeline switches.
    #[serde(default)]
    pub pq: PqConfig,
}

/// Composition-path policy toggles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompositionConfig {
    /// Disable the AI-inference (GLAI) composition path globally.
    #[serde(default)]
    pub disable_glai: bool,

    /// Disable the UI overlay composition path globally.
    #[serde(default)]
    pub disable_ui: bool,

    /// Disable the MM (media/MDP) composition path globally.
    #[serde(default)]
    pub disable_mm: bool,

    /// Allow the client-clear optimization (clear the background instead
    /// of composing it).
    #[serde(default = "CompositionConfig::default_client_clear")]
    pub client_clear: bool,

    /// Allow the skip-validate fast path when no layer changed.
    #[serde(default = "CompositionConfig::default_skip_validate")]
    pub skip_validate: bool,

    /// Exclude Invalid-classified layers from the committed sequence.
    #[serde(default = "CompositionConfig::default_commit_valid_only")]
    pub commit_valid_only: bool,
}

impl CompositionConfig {
    fn default_client_clear() -> bool {
        true
    }

    fn default_skip_validate() -> bool {
        true
    }

    fn default_commit_valid_only() -> bool {
        false
    }
}

impl Default for CompositionConfig {
    fn default() -> Self {
        Self {
            disable_glai: false,
            disable_ui: false,
            disable_mm: false,
            client_clear: Self::default_client_clear(),
            skip_validate: Self::default_skip_validate(),
            commit_valid_only: Self::default_commit_valid_only(),
        }
    }
}

/// Debug hints targeting specific layer ids. All default to off.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DebugHints {
    /// Force this layer to classify Invalid.
    #[serde(default)]
    pub force_invalid_layer: Option<u64>,

    /// Force this layer through the Dim path.
    #[serde(default)]
    pub force_dim_layer: Option<u64>,

    /// Force this layer through the MM path (still gated by the MM
    /// validity predicate).
    #[serde(default)]
    pub force_mm_layer: Option<u64>,

    /// Force this layer through the UI path (still gated by the UI
    /// validity predicate).
    #[serde(default)]
    pub force_ui_layer: Option<u64>,

    /// Restrict this UI layer to the overlay-only path during capability
    /// refinement.
    #[serde(default)]
    pub overlay_only_ui_layer: Option<u64>,
}

/// Picture-quality pipeline switches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PqConfig {
    /// Game-PQ post-processing enabled on this platform.
    #[serde(default = "PqConfig::default_game_pq")]
    pub game_pq: bool,

    /// AI-PQ post-processing enabled on this platform.
    #[serde(default)]
    pub ai_pq: bool,

    /// Game-HDR mode active; excludes the MML overlay path.
    #[serde(default)]
    pub game_hdr: bool,
}

impl PqConfig {
    fn default_game_pq() -> bool {
        true
    }
}

impl Default for PqConfig {
    fn default() -> Self {
        Self {
            game_pq: Self::default_game_pq(),
            ai_pq: false,
            game_hdr: false,
        }
    }
}

impl PlatformConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// missing sections.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: PlatformConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field consistency.
    pub fn validate(&self) -> Result<()> {
        if self.composition.disable_glai
            && self.composition.disable_ui
            && self.composition.disable_mm
            && self.composition.skip_validate
        {
            // Every hardware path is off; skip-validate would freeze the
            // all-Invalid outcome. Not fatal, but worth flagging.
            log::warn!("all hardware composition paths disabled with skip_validate on");
        }

        if let (Some(mm), Some(ui)) = (self.debug.force_mm_layer, self.debug.force_ui_layer) {
            if mm == ui {
                anyhow::bail!("layer {} hinted as both forced-MM and forced-UI", mm);
            }
        }

        Ok(())
    }
}
