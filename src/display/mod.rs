//! Per-display layer aggregation and frame driving
//!
//! One `Display` owns the layers of one physical or virtual display and
//! drives the per-frame lifecycle across them: rebuild the z-sorted
//! visible/invisible partitions, run classification per layer, aggregate
//! the frame summary for the upstream stack, and roll state forward
//! after present.
//!
//! Locking policy: the layer store, the pending-removal set, and dump
//! serialization each have their own mutex. The present path never waits
//! behind the diagnostics thread on a shared lock.

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Result};
use log::{debug, info, trace};
use parking_lot::Mutex;

use crate::color::ColorState;
use crate::config::PlatformConfig;
use crate::fence::Fence;
use crate::hal::{ModelController, OverlayCaps, PathValidator};
use crate::layer::{CompositionType, HwLayerType, Layer, LayerCaps, ValidateContext};

/// Display power modes, codes per the upstream protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Off,
    Doze,
    On,
    DozeSuspend,
}

/// Per-type classification counts for one validated frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeCounts {
    pub ui: usize,
    pub mm: usize,
    pub glai: usize,
    pub dim: usize,
    pub cursor: usize,
    pub invalid: usize,
}

/// Aggregated result of validating one frame, in the shape the upstream
/// stack queries it.
#[derive(Debug, Default)]
pub struct FrameSummary {
    /// The skip-validate fast path reused last frame's classification.
    pub skip_validate_taken: bool,
    /// Layers whose returned composition type differs from the requested
    /// one (the changed-composition-types query).
    pub changed_composition_types: Vec<(u64, CompositionType)>,
    /// Layers with a client-clear request attached (the changed-requests
    /// query).
    pub client_clear_requests: Vec<u64>,
    pub counts: TypeCounts,
    /// At least one layer fell back to Invalid, so the client target must
    /// be composed and presented this frame.
    pub needs_client_composition: bool,
}

/// Layer collection plus the per-frame derived sequences. Derived
/// sequences are rebuilt fresh each frame, never incrementally patched.
#[derive(Debug, Default)]
struct LayerStore {
    layers: HashMap<u64, Layer>,
    visible: Vec<u64>,
    invisible: Vec<u64>,
    committed: Vec<u64>,
    last_committed: Vec<u64>,
}

impl LayerStore {
    /// Partition current layers into visible/invisible, each sorted by
    /// z ascending, stable for equal z (insertion order of the frame's
    /// iteration preserved via stable sort over id-collection order).
    fn rebuild_partitions(&mut self) {
        let mut ids: Vec<u64> = self.layers.keys().copied().collect();
        // Stable tie-break on creation order: ids are monotonic.
        ids.sort_unstable();

        self.visible.clear();
        self.invisible.clear();
        for id in ids {
            if self.layers[&id].is_visible() {
                self.visible.push(id);
            } else {
                self.invisible.push(id);
            }
        }
        let layers = &self.layers;
        self.visible.sort_by_key(|id| layers[id].z_order());
        self.invisible.sort_by_key(|id| layers[id].z_order());
    }
}

/// One physical or virtual display and its layer state.
pub struct Display {
    id: u64,
    name: String,
    /// Display sits on a secure output path.
    secure: bool,
    /// Primary/internal panel.
    internal: bool,
    power_mode: PowerMode,
    active_config: u32,
    /// Retire fence for the most recent present; single consumer.
    retire_fence: Fence,
    client_target_id: u64,
    /// Last frame took the skip-validate path; `after_present` preserves
    /// dirty masks in that case.
    skip_validate_active: bool,

    store: Mutex<LayerStore>,
    pending_removal: Mutex<HashSet<u64>>,
    dump_lock: Mutex<()>,

    pub color: ColorState,
}

impl Display {
    /// Create a display. The single client-target layer is created here
    /// and is immutable for the display's lifetime.
    pub fn new(id: u64, name: &str, secure: bool, internal: bool) -> Self {
        info!(
            "🖥️ display {} ({}) created (secure={}, internal={})",
            id, name, secure, internal
        );
        let client_target = Layer::new_client_target(id);
        let client_target_id = client_target.id();
        let mut layers = HashMap::new();
        layers.insert(client_target_id, client_target);

        Self {
            id,
            name: name.to_string(),
            secure,
            internal,
            power_mode: PowerMode::Off,
            active_config: 0,
            retire_fence: Fence::invalid(),
            client_target_id,
            skip_validate_active: false,
            store: Mutex::new(LayerStore {
                layers,
                ..LayerStore::default()
            }),
            pending_removal: Mutex::new(HashSet::new()),
            dump_lock: Mutex::new(()),
            color: ColorState::with_defaults(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn power_mode(&self) -> PowerMode {
        self.power_mode
    }

    pub fn set_power_mode(&mut self, mode: PowerMode) {
        if self.power_mode != mode {
            debug!("display {} power mode -> {:?}", self.id, mode);
            self.power_mode = mode;
        }
    }

    pub fn active_config(&self) -> u32 {
        self.active_config
    }

    pub fn set_active_config(&mut self, config: u32) {
        self.active_config = config;
    }

    pub fn client_target_id(&self) -> u64 {
        self.client_target_id
    }

    // === Layer lifecycle ===

    /// Create a layer on client request; returns its stable id.
    pub fn create_layer(&self) -> u64 {
        let layer = Layer::new(self.id);
        let id = layer.id();
        self.store.lock().layers.insert(id, layer);
        debug!("display {}: layer {} created", self.id, id);
        id
    }

    /// Request layer destruction. Removal is deferred to the next frame
    /// boundary; in-flight references stay valid for the current frame.
    pub fn destroy_layer(&self, layer_id: u64) -> Result<()> {
        if layer_id == self.client_target_id {
            return Err(anyhow!("cannot destroy the client target layer"));
        }
        if !self.store.lock().layers.contains_key(&layer_id) {
            return Err(anyhow!("layer {} not found", layer_id));
        }
        self.pending_removal.lock().insert(layer_id);
        debug!("display {}: layer {} pending removal", self.id, layer_id);
        Ok(())
    }

    /// Run a closure against one layer mutably. Returns `None` for an
    /// unknown id.
    pub fn with_layer_mut<R>(&self, layer_id: u64, f: impl FnOnce(&mut Layer) -> R) -> Option<R> {
        self.store.lock().layers.get_mut(&layer_id).map(f)
    }

    /// Run a closure against one layer immutably.
    pub fn with_layer<R>(&self, layer_id: u64, f: impl FnOnce(&Layer) -> R) -> Option<R> {
        self.store.lock().layers.get(&layer_id).map(f)
    }

    pub fn layer_count(&self) -> usize {
        self.store.lock().layers.len()
    }

    // === Frame lifecycle ===

    /// Classify every visible layer for this frame and aggregate the
    /// results.
    ///
    /// Layers are visited bottom-up (z ascending) so the bottom-of-stack
    /// capability check sees every other layer's assigned type.
    pub fn validate_layers(
        &mut self,
        config: &PlatformConfig,
        validator: &dyn PathValidator,
        overlay: &dyn OverlayCaps,
        pq_mode_id: i32,
    ) -> FrameSummary {
        let mut guard = self.store.lock();
        let store = &mut *guard;
        store.rebuild_partitions();

        let mut summary = FrameSummary::default();

        let can_skip = config.composition.skip_validate
            && !store.last_committed.is_empty()
            && store.visible.iter().all(|id| {
                let layer = &store.layers[id];
                !layer.is_state_changed()
                    && layer.request_stable()
                    && layer.pq_state_stable()
                    && layer.hw_type() != HwLayerType::None
            });

        if can_skip {
            trace!("display {}: skip-validate fast path", self.id);
            summary.skip_validate_taken = true;
        } else {
            let ctx = ValidateContext {
                config,
                validator,
                display_secure: self.secure,
                display_internal: self.internal,
                pq_mode_id,
            };
            for id in &store.visible {
                if let Some(layer) = store.layers.get_mut(id) {
                    layer.validate(&ctx);
                }
            }

            // Bottom of stack: lowest-z visible layer that is not the
            // client target.
            let bottom_id = store
                .visible
                .iter()
                .copied()
                .find(|id| *id != self.client_target_id);
            for id in &store.visible {
                if let Some(layer) = store.layers.get_mut(id) {
                    layer.complete_layer_caps(config, overlay, Some(*id) == bottom_id);
                }
            }
        }
        self.skip_validate_active = summary.skip_validate_taken;

        // Committed sequence: visible layers submitted to the hardware,
        // excluding the client target (and Invalid layers under the
        // commit-valid-only policy).
        let committed: Vec<u64> = store
            .visible
            .iter()
            .copied()
            .filter(|id| *id != self.client_target_id)
            .filter(|id| {
                !config.composition.commit_valid_only
                    || store.layers[id].hw_type() != HwLayerType::Invalid
            })
            .collect();
        store.committed = committed;

        // Summary queries cover every visible classified layer; the
        // committed filter above only shapes the hardware submit
        // sequence. An Invalid layer dropped from commit still needs
        // client composition and still answers the changed-types query.
        for id in store.visible.iter().filter(|id| **id != self.client_target_id) {
            let layer = &store.layers[id];
            match layer.hw_type() {
                HwLayerType::Ui => summary.counts.ui += 1,
                HwLayerType::Mm => summary.counts.mm += 1,
                HwLayerType::Glai => summary.counts.glai += 1,
                HwLayerType::Dim => summary.counts.dim += 1,
                HwLayerType::Cursor => summary.counts.cursor += 1,
                HwLayerType::Invalid => summary.counts.invalid += 1,
                _ => {}
            }
            if layer.returned_type() != layer.sf_requested_type() {
                summary
                    .changed_composition_types
                    .push((*id, layer.returned_type()));
            }
            if layer.caps().contains(LayerCaps::CLIENT_CLEAR) {
                summary.client_clear_requests.push(*id);
            }
        }
        summary.needs_client_composition = summary.counts.invalid > 0;

        summary
    }

    /// True if the committed sequence differs from the previous frame by
    /// identity or order, or any committed layer reports a state change.
    pub fn is_geometry_changed(&self) -> bool {
        let store = self.store.lock();
        if store.committed != store.last_committed {
            return true;
        }
        store
            .committed
            .iter()
            .any(|id| store.layers[id].is_state_changed())
    }

    /// The hardware present consumed this frame. Stores the new retire
    /// fence (closing the displaced one) and records release fences for
    /// every committed layer.
    pub fn present(&mut self, retire_fence: Fence, release_fences: Vec<(u64, Fence)>) {
        self.retire_fence.close();
        self.retire_fence = retire_fence;

        let mut store = self.store.lock();
        let mut fences: HashMap<u64, Fence> = release_fences.into_iter().collect();
        for id in store.committed.clone() {
            if let Some(layer) = store.layers.get_mut(&id) {
                if let Some(fence) = fences.remove(&id) {
                    layer.buffer_mut().set_release_fence(fence);
                }
                layer.mark_presented();
            }
        }
        // Fences for unknown layers are dropped (closed) here.
        drop(fences);

        self.color.histogram.on_frame_sampled();
    }

    /// Take the retire fence for the single upstream consumer.
    pub fn take_retire_fence(&mut self) -> Fence {
        self.retire_fence.take()
    }

    /// Collect the previous-frame release fences owed to the upstream
    /// client, transferring ownership.
    pub fn take_release_fences(&self) -> Vec<(u64, Fence)> {
        let mut store = self.store.lock();
        let ids = store.committed.clone();
        ids.into_iter()
            .filter_map(|id| {
                store.layers.get_mut(&id).and_then(|layer| {
                    let fence = layer.buffer_mut().take_prev_release_fence();
                    fence.is_valid().then(|| (id, fence))
                })
            })
            .collect()
    }

    /// Roll every layer forward at the frame boundary and apply pending
    /// removals. Strictly follows the present call it pairs with.
    pub fn after_present(&mut self, models: &dyn ModelController) {
        let keep_dirty = self.skip_validate_active;
        let mut guard = self.store.lock();
        let store = &mut *guard;

        for layer in store.layers.values_mut() {
            layer.after_present(keep_dirty);
        }
        store.last_committed = store.committed.clone();
        drop(guard);

        self.remove_pending_removed_layers(models);
    }

    /// Evict layers flagged for destruction. Only called between frames,
    /// never mid-validate.
    fn remove_pending_removed_layers(&self, models: &dyn ModelController) {
        let pending: Vec<u64> = {
            let mut set = self.pending_removal.lock();
            set.drain().collect()
        };
        if pending.is_empty() {
            return;
        }
        let mut store = self.store.lock();
        for id in pending {
            if let Some(mut layer) = store.layers.remove(&id) {
                layer.destroy(models);
                debug!("display {}: layer {} removed", self.id, id);
            }
        }
    }

    // === Queries for the aggregation tests and diagnostics ===

    pub fn visible_layers(&self) -> Vec<u64> {
        self.store.lock().visible.clone()
    }

    pub fn invisible_layers(&self) -> Vec<u64> {
        self.store.lock().invisible.clone()
    }

    pub fn committed_layers(&self) -> Vec<u64> {
        self.store.lock().committed.clone()
    }

    pub fn last_committed_layers(&self) -> Vec<u64> {
        self.store.lock().last_committed.clone()
    }

    /// Human-readable snapshot for the diagnostics thread. Serialized by
    /// its own lock so concurrent dump requests don't interleave, without
    /// stalling the present path.
    pub fn dump(&self) -> String {
        let _serial = self.dump_lock.lock();
        let store = self.store.lock();

        let mut out = format!(
            "display {} ({}) power={:?} config={} secure={} internal={}\n",
            self.id, self.name, self.power_mode, self.active_config, self.secure, self.internal
        );
        out.push_str(&format!(
            "  visible={:?} committed={:?} last={:?}\n",
            store.visible, store.committed, store.last_committed
        ));
        let mut ids: Vec<u64> = store.layers.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            out.push_str("  ");
            out.push_str(&store.layers[&id].dump());
            out.push('\n');
        }
        out
    }
}

impl Drop for Display {
    fn drop(&mut self) {
        // Remaining layer fences close through their own Drop impls.
        self.retire_fence.close();
    }
}
