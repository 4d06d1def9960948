//! # Strata Composition Core
//!
//! Per-frame layer classification and state tracking for a hardware
//! display composition pipeline: decide which submitted layers the
//! hardware path can compose directly (overlay, MDP scaling/rotation,
//! AI-inference engine) versus which fall back to client/GPU
//! composition, and track every layer's dirty state across frames.
//!
//! ## Architecture
//!
//! Strata is built on a modular architecture:
//! - `layer`: the layer data model, dirty tracking, and the per-frame
//!   classification ladder
//! - `buffer`: buffer metadata views and acquire/release fence rotation
//! - `display`: per-display aggregation, committed sequences, and the
//!   frame lifecycle
//! - `fence`: owned sync-fence handles with close-exactly-once semantics
//! - `color`: color-mode/render-intent and histogram bookkeeping
//! - `hal`: trait seams for the overlay device, path validators, and the
//!   AI model controller
//! - `config`: immutable platform configuration passed into every
//!   classification call
//!
//! ## Usage
//!
//! ```rust,no_run
//! use strata::config::PlatformConfig;
//! use strata::display::Display;
//!
//! let config = PlatformConfig::default();
//! let mut display = Display::new(0, "internal", false, true);
//! let layer = display.create_layer();
//! # let _ = (layer, config);
//! ```

pub mod buffer;
pub mod color;
pub mod config;
pub mod display;
pub mod error;
pub mod fence;
pub mod hal;
pub mod layer;

// Re-export main types for easy access
pub use buffer::{BufferRecord, BufferUsage, PixelFormat, PrivateHandle, RawBuffer};
pub use config::PlatformConfig;
pub use display::{Display, FrameSummary, PowerMode};
pub use error::CompositionError;
pub use fence::Fence;
pub use layer::{CompositionType, HwLayerType, Layer, LayerDirty};

// Re-export common error types
pub use anyhow::{Context, Error, Result};

/// Version information for Strata
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
