//! Slice view synchronization.
//!
//! A [`SliceView`] owns one cutting plane, its three layers and the blend
//! pipeline. Changes are recorded as [`DirtyFlags`] and applied in a single
//! rebuild pass by [`SliceView::process`]:
//!
//! 1. geometry (optional fit to a new background volume)
//! 2. layer pipeline, for layers whose source or geometry changed
//! 3. compositing
//!
//! Scene notifications arrive through an [`EventQueue`] and take effect at
//! the next [`SliceView::process`]. Events about a view's own nodes may carry
//! the new node value as a [`NodeState`], which the view adopts. Events a
//! view publishes carry its name as sender and are ignored when they come
//! back.

use crate::compositor::{BlendPipeline, CompositeParameters, CompositingEngine};
use crate::config::{EngineConfig, SlabSettings};
use crate::enums::{CompositingMode, LayerKind};
use crate::geometry::{
    GeometryResolver, LightboxLayout, OffsetRange, SliceBounds, SliceGeometry, SliceIndex,
};
use crate::layer::{LabelColorTable, LayerPipeline, WindowLevelInfo};
use crate::registry::{VolumeHandle, VolumeId, VolumeRegistry};

use bitflags::bitflags;
use glam::DVec3;
use image::RgbaImage;
use log::{debug, trace, warn};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use web_time::Instant;

bitflags! {
    /// Components that need work in the next rebuild pass.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DirtyFlags: u8 {
        const GEOMETRY = 1 << 0;
        const BACKGROUND = 1 << 1;
        const FOREGROUND = 1 << 2;
        const LABEL = 1 << 3;
        const COMPOSITE = 1 << 4;
        const LAYERS = Self::BACKGROUND.bits() | Self::FOREGROUND.bits() | Self::LABEL.bits();
    }
}

impl DirtyFlags {
    pub fn layer(kind: LayerKind) -> Self {
        match kind {
            LayerKind::Background => Self::BACKGROUND,
            LayerKind::Foreground => Self::FOREGROUND,
            LayerKind::Label => Self::LABEL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    PendingRebuild,
    Rebuilding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneEventKind {
    NodeAdded,
    NodeRemoved,
    NodeModified,
}

/// Scene nodes a slice view can observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRef {
    /// Cutting plane of the named view.
    SliceGeometry(String),
    /// Compositing parameters of the named view.
    CompositeParameters(String),
    Volume(VolumeId),
}

/// Value of a view node after a modification.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeState {
    SliceGeometry(SliceGeometry),
    CompositeParameters(CompositeParameters),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SceneEvent {
    pub kind: SceneEventKind,
    pub node: NodeRef,
    /// Name of the view that caused the event, if any.
    pub sender: Option<String>,
    /// New value of the node. Without it the receiving view keeps its own
    /// copy and only re-renders.
    pub state: Option<NodeState>,
}

impl SceneEvent {
    pub fn new(kind: SceneEventKind, node: NodeRef) -> Self {
        Self {
            kind,
            node,
            sender: None,
            state: None,
        }
    }

    pub fn modified(node: NodeRef) -> Self {
        Self::new(SceneEventKind::NodeModified, node)
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_state(mut self, state: NodeState) -> Self {
        self.state = Some(state);
        self
    }
}

/// Shared FIFO of scene events, consumed on the owning thread.
#[derive(Debug, Clone, Default)]
pub struct EventQueue(Rc<RefCell<VecDeque<SceneEvent>>>);

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: SceneEvent) {
        self.0.borrow_mut().push_back(event);
    }

    pub fn pop(&self) -> Option<SceneEvent> {
        self.0.borrow_mut().pop_front()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    /// True when both handles refer to the same queue.
    pub fn same_queue(&self, other: &EventQueue) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Notifications published by a view to its listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewEvent {
    GeometryModified(SliceGeometry),
    /// Emitted once at the end of every rebuild pass.
    PipelineUpdated {
        generation: u64,
        topology_changed: bool,
        refreshed: Vec<LayerKind>,
    },
}

type Listener = Box<dyn FnMut(&ViewEvent)>;

pub struct SliceView {
    name: String,
    config: EngineConfig,
    resolver: GeometryResolver,
    geometry: SliceGeometry,
    published_geometry: SliceGeometry,
    viewport: (u32, u32),
    sources: [Option<VolumeId>; 3],
    layers: LayerPipeline,
    parameters: CompositeParameters,
    compositor: CompositingEngine,
    state: SyncState,
    dirty: DirtyFlags,
    generation: u64,
    inbox: EventQueue,
    outboxes: Vec<EventQueue>,
    listeners: Vec<Listener>,
}

impl std::fmt::Debug for SliceView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceView")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("dirty", &self.dirty)
            .field("generation", &self.generation)
            .field("viewport", &self.viewport)
            .finish_non_exhaustive()
    }
}

impl SliceView {
    /// Creates a view on `geometry`. The viewport is the tile size times the
    /// lightbox layout of the geometry.
    pub fn new(name: impl Into<String>, geometry: SliceGeometry, config: &EngineConfig) -> Self {
        let dims = geometry.dimensions();
        let layout = geometry.layout();
        let mut layers = LayerPipeline::new(&config.window_level);
        layers.set_slab(&config.slab);
        Self {
            name: name.into(),
            config: config.clone(),
            resolver: GeometryResolver::new(&config.geometry),
            geometry,
            published_geometry: geometry,
            viewport: (dims.x * layout.columns, dims.y * layout.rows),
            sources: [None; 3],
            layers,
            parameters: CompositeParameters::new(&config.compositing),
            compositor: CompositingEngine::new(&config.compositing),
            state: SyncState::Idle,
            dirty: DirtyFlags::empty(),
            generation: 0,
            inbox: EventQueue::new(),
            outboxes: Vec::new(),
            listeners: Vec::new(),
        }
    }

    /// Axial view with the configured default field of view.
    pub fn axial(name: impl Into<String>, width: u32, height: u32, config: &EngineConfig) -> Self {
        let geometry = SliceGeometry::axial(width, height, config.geometry.default_field_of_view);
        Self::new(name, geometry, config)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Synchronization state as of the last change or pass. Events still
    /// waiting in the [`inbox`](Self::inbox) are not reflected until
    /// [`process`](Self::process) consumes them; see
    /// [`pending_events`](Self::pending_events).
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Number of scene events queued for the next [`process`](Self::process).
    pub fn pending_events(&self) -> usize {
        self.inbox.len()
    }

    pub fn dirty(&self) -> DirtyFlags {
        self.dirty
    }

    /// Number of completed rebuild passes.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn geometry(&self) -> &SliceGeometry {
        &self.geometry
    }

    pub fn viewport(&self) -> (u32, u32) {
        self.viewport
    }

    pub fn parameters(&self) -> &CompositeParameters {
        &self.parameters
    }

    pub fn layers(&self) -> &LayerPipeline {
        &self.layers
    }

    pub fn blend_pipeline(&self) -> &BlendPipeline {
        self.compositor.pipeline()
    }

    pub fn resolver(&self) -> &GeometryResolver {
        &self.resolver
    }

    /// Queue the scene pushes this view's notifications into.
    pub fn inbox(&self) -> EventQueue {
        self.inbox.clone()
    }

    /// Also publish this view's own changes into `queue`.
    pub fn connect(&mut self, queue: EventQueue) {
        if !self.outboxes.iter().any(|q| q.same_queue(&queue)) {
            self.outboxes.push(queue);
        }
    }

    pub fn subscribe(&mut self, listener: impl FnMut(&ViewEvent) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// The composited image of the last rebuild pass.
    pub fn output(&self) -> Option<&RgbaImage> {
        self.compositor.output()
    }

    /// Raw RGBA8 bytes of [`output`](Self::output), row-major.
    pub fn output_bytes(&self) -> Option<&[u8]> {
        self.output().map(|image| image.as_raw().as_slice())
    }

    // ---- change recording -------------------------------------------------

    fn notify(&mut self, flags: DirtyFlags) {
        self.dirty |= flags;
        if self.state == SyncState::Idle {
            self.state = SyncState::PendingRebuild;
        }
        trace!("{}: {:?} dirty, {:?}", self.name, flags, self.state);
    }

    fn apply_geometry(&mut self, geometry: Option<SliceGeometry>) -> bool {
        match geometry {
            Some(geometry) if geometry != self.geometry => {
                self.geometry = geometry;
                self.notify(DirtyFlags::GEOMETRY);
                true
            }
            _ => false,
        }
    }

    /// Replaces the cutting plane. Returns false if it is unchanged.
    pub fn set_geometry(&mut self, geometry: SliceGeometry) -> bool {
        self.apply_geometry(Some(geometry))
    }

    pub fn set_layer_volume(&mut self, kind: LayerKind, volume: Option<VolumeId>) -> bool {
        let slot = &mut self.sources[kind.ordinal()];
        if *slot == volume {
            return false;
        }
        *slot = volume;
        self.notify(DirtyFlags::layer(kind));
        true
    }

    pub fn layer_volume(&self, kind: LayerKind) -> Option<VolumeId> {
        self.sources[kind.ordinal()]
    }

    pub fn set_composite_parameters(&mut self, parameters: CompositeParameters) -> bool {
        if parameters == self.parameters {
            return false;
        }
        self.parameters = parameters;
        self.notify(DirtyFlags::COMPOSITE);
        true
    }

    pub fn set_compositing_mode(&mut self, mode: CompositingMode) -> bool {
        self.set_composite_parameters(self.parameters.with_mode(mode))
    }

    pub fn set_foreground_opacity(&mut self, opacity: f64) -> bool {
        self.set_composite_parameters(self.parameters.with_foreground_opacity(opacity))
    }

    pub fn set_label_opacity(&mut self, opacity: f64) -> bool {
        self.set_composite_parameters(self.parameters.with_label_opacity(opacity))
    }

    pub fn set_clip_to_background_volume(&mut self, clip: bool) -> bool {
        self.set_composite_parameters(self.parameters.with_clip_to_background_volume(clip))
    }

    /// Switches the layer to a manual window/level.
    pub fn set_window_level(&mut self, kind: LayerKind, window: f64, level: f64) -> bool {
        let changed = self.layers.set_window_level(kind, window, level);
        if changed {
            self.notify(DirtyFlags::layer(kind));
        }
        changed
    }

    pub fn set_auto_window_level(&mut self, kind: LayerKind, auto: bool) -> bool {
        let changed = self.layers.set_auto_window_level(kind, auto);
        if changed {
            self.notify(DirtyFlags::layer(kind));
        }
        changed
    }

    pub fn window_level_and_range(&self, kind: LayerKind) -> WindowLevelInfo {
        self.layers.window_level_and_range(kind)
    }

    pub fn set_label_colors(&mut self, colors: LabelColorTable) {
        self.layers.set_label_colors(colors);
        self.notify(DirtyFlags::LABEL);
    }

    /// Thick-slab reconstruction of the background and foreground layers.
    pub fn set_slab_reconstruction(&mut self, slab: SlabSettings) -> bool {
        let changed = self.layers.set_slab(&slab);
        if changed {
            self.notify(DirtyFlags::BACKGROUND | DirtyFlags::FOREGROUND);
        }
        changed
    }

    // ---- scene events -----------------------------------------------------

    fn handle_event(&mut self, event: &SceneEvent) {
        if event.sender.as_deref() == Some(self.name.as_str()) {
            trace!("{}: ignoring self-originated {:?}", self.name, event.node);
            return;
        }
        let flags = match (&event.node, &event.state) {
            (NodeRef::SliceGeometry(view), Some(NodeState::SliceGeometry(geometry)))
                if *view == self.name =>
            {
                self.apply_geometry(Some(*geometry));
                DirtyFlags::empty()
            }
            (NodeRef::CompositeParameters(view), Some(NodeState::CompositeParameters(parameters)))
                if *view == self.name =>
            {
                self.set_composite_parameters(*parameters);
                DirtyFlags::empty()
            }
            (NodeRef::SliceGeometry(view), state) if *view == self.name => {
                if state.is_some() {
                    warn!("{}: geometry event with mismatched state", self.name);
                }
                DirtyFlags::GEOMETRY
            }
            (NodeRef::CompositeParameters(view), state) if *view == self.name => {
                if state.is_some() {
                    warn!("{}: parameter event with mismatched state", self.name);
                }
                DirtyFlags::COMPOSITE
            }
            (NodeRef::Volume(id), _) => {
                let mut flags = DirtyFlags::empty();
                for kind in LayerKind::ALL {
                    let slot = &mut self.sources[kind.ordinal()];
                    if *slot == Some(*id) {
                        if event.kind == SceneEventKind::NodeRemoved {
                            *slot = None;
                        }
                        flags |= DirtyFlags::layer(kind);
                    }
                }
                flags
            }
            _ => DirtyFlags::empty(),
        };
        if !flags.is_empty() {
            self.notify(flags);
        }
    }

    fn drain_inbox(&mut self) {
        while let Some(event) = self.inbox.pop() {
            self.handle_event(&event);
        }
    }

    fn emit(&mut self, event: ViewEvent) {
        for listener in self.listeners.iter_mut() {
            listener(&event);
        }
    }

    fn publish_geometry(&mut self) {
        if self.published_geometry == self.geometry {
            return;
        }
        self.published_geometry = self.geometry;
        let event = SceneEvent::modified(NodeRef::SliceGeometry(self.name.clone()))
            .with_sender(self.name.clone())
            .with_state(NodeState::SliceGeometry(self.geometry));
        for queue in &self.outboxes {
            queue.push(event.clone());
        }
        self.emit(ViewEvent::GeometryModified(self.geometry));
    }

    // ---- rebuild ----------------------------------------------------------

    /// Consumes pending scene events and runs rebuild passes until the view
    /// is idle. Changes arriving during a pass trigger a follow-up pass, up
    /// to the configured limit; beyond it the view stays pending until the
    /// next call. Returns the number of passes run.
    pub fn process(&mut self, registry: &VolumeRegistry) -> u32 {
        self.drain_inbox();
        let limit = self.config.pipeline.max_follow_up_passes;
        let mut passes = 0;
        while self.state == SyncState::PendingRebuild {
            if passes > limit {
                warn!(
                    "{}: still dirty after {} passes, deferring {:?}",
                    self.name, passes, self.dirty
                );
                break;
            }
            self.rebuild(registry);
            passes += 1;
        }
        passes
    }

    fn resolve(&self, registry: &VolumeRegistry, kind: LayerKind) -> Option<VolumeHandle> {
        self.sources[kind.ordinal()].and_then(|id| registry.get(id))
    }

    fn rebuild(&mut self, registry: &VolumeRegistry) {
        let started = Instant::now();
        self.state = SyncState::Rebuilding;
        let dirty = std::mem::replace(&mut self.dirty, DirtyFlags::empty());

        if dirty.contains(DirtyFlags::BACKGROUND)
            && self.config.pipeline.fit_on_background_change
            && let Some(background) = self.resolve(registry, LayerKind::Background)
        {
            let bounds = self
                .resolver
                .volume_slice_bounds(&self.geometry, background.volume().geometry(), false);
            let (width, height) = self.viewport;
            if let Some(fitted) = self
                .resolver
                .fit_slice_to_volume_extent(&self.geometry, &bounds, width, height)
            {
                self.geometry = fitted;
            }
        }
        let geometry_changed = self.layers.update_for_geometry(&self.geometry);

        for kind in LayerKind::ALL {
            if dirty.contains(DirtyFlags::layer(kind)) {
                let handle = self.resolve(registry, kind);
                self.layers.set_source_volume(kind, handle);
            }
        }
        let refreshed = self.layers.update();

        let topology_changed = self
            .compositor
            .rebuild_blend_pipeline(&self.layers, &self.parameters);
        if topology_changed
            || geometry_changed
            || !refreshed.is_empty()
            || dirty.contains(DirtyFlags::COMPOSITE)
        {
            self.compositor.render_composite(&self.layers);
        }
        self.generation += 1;
        debug!(
            "{}: rebuild pass {} ({:?}) refreshed {:?} in {:?}",
            self.name,
            self.generation,
            dirty,
            refreshed,
            started.elapsed()
        );

        self.publish_geometry();
        self.emit(ViewEvent::PipelineUpdated {
            generation: self.generation,
            topology_changed,
            refreshed,
        });

        self.drain_inbox();
        self.state = if self.dirty.is_empty() {
            SyncState::Idle
        } else {
            SyncState::PendingRebuild
        };
    }

    // ---- geometry operations ----------------------------------------------

    fn present_volumes(&self, registry: &VolumeRegistry) -> Vec<VolumeHandle> {
        LayerKind::ALL
            .iter()
            .filter_map(|&kind| self.resolve(registry, kind))
            .collect()
    }

    /// First present volume in layer order.
    pub fn lowest_volume(&self, registry: &VolumeRegistry) -> Option<VolumeHandle> {
        LayerKind::ALL.iter().find_map(|&kind| self.resolve(registry, kind))
    }

    pub fn has_inputs(&self, registry: &VolumeRegistry) -> bool {
        self.lowest_volume(registry).is_some()
    }

    fn fit_to(&mut self, volumes: &[VolumeHandle]) -> bool {
        let bounds: Vec<SliceBounds> = volumes
            .iter()
            .map(|v| {
                self.resolver
                    .volume_slice_bounds(&self.geometry, v.volume().geometry(), false)
            })
            .collect();
        let (width, height) = self.viewport;
        let fitted = self
            .resolver
            .fit_slice_to_multiple_volumes(&self.geometry, &bounds, width, height);
        self.apply_geometry(fitted)
    }

    /// Fits the field of view to the union of all layer volumes.
    pub fn fit_slice_to_all(&mut self, registry: &VolumeRegistry) -> bool {
        let volumes = self.present_volumes(registry);
        self.fit_to(&volumes)
    }

    /// Fits the field of view to the first present layer volume.
    pub fn fit_slice_to_first(&mut self, registry: &VolumeRegistry) -> bool {
        let volumes: Vec<_> = self.lowest_volume(registry).into_iter().collect();
        self.fit_to(&volumes)
    }

    /// Fits to the background volume when the other layers are clipped to
    /// it, otherwise to all volumes.
    pub fn fit_slice_to_background(&mut self, registry: &VolumeRegistry) -> bool {
        if !self.parameters.clip_to_background_volume() {
            return self.fit_slice_to_all(registry);
        }
        let volumes: Vec<_> = self.resolve(registry, LayerKind::Background).into_iter().collect();
        self.fit_to(&volumes)
    }

    /// Applies `field_of_view` to the smaller viewport dimension.
    pub fn fit_field_of_view(&mut self, field_of_view: f64) -> bool {
        let fitted = self.resolver.fit_field_of_view(&self.geometry, field_of_view);
        self.apply_geometry(fitted)
    }

    pub fn rotate_slice_to_lowest_volume_axes(
        &mut self,
        registry: &VolumeRegistry,
        force_single_plane: bool,
    ) -> bool {
        let Some(volume) = self.lowest_volume(registry) else {
            return false;
        };
        let rotated = self
            .resolver
            .rotate_to_volume_axes(&self.geometry, volume.volume().geometry(), force_single_plane);
        self.apply_geometry(Some(rotated))
    }

    /// Handles a viewport size change. `width` and `height` are the overall
    /// viewport size, also in lightbox layouts.
    pub fn resize_slice_node(&mut self, width: u32, height: u32) -> bool {
        let resized = self.resolver.resize_for_viewport(&self.geometry, width, height);
        if resized.is_some() {
            self.viewport = (width, height);
        }
        self.apply_geometry(resized)
    }

    pub fn set_lightbox_layout(&mut self, layout: LightboxLayout) -> bool {
        let (width, height) = self.viewport;
        let relaid = self.resolver.relayout(&self.geometry, layout, width, height);
        self.apply_geometry(relaid)
    }

    pub fn slice_offset(&self) -> f64 {
        self.geometry.offset()
    }

    pub fn set_slice_offset(&mut self, offset: f64) -> bool {
        let moved = self.geometry.with_offset(offset);
        self.apply_geometry(Some(moved))
    }

    /// Moves the plane onto the closest voxel center of the lowest volume.
    pub fn snap_slice_offset_to_ijk(&mut self, registry: &VolumeRegistry) -> bool {
        let Some(volume) = self.lowest_volume(registry) else {
            return false;
        };
        let offset = self.resolver.snap_offset_to_voxel_center(
            &self.geometry,
            self.slice_offset(),
            volume.volume().geometry(),
        );
        self.set_slice_offset(offset)
    }

    pub fn slice_index_from_offset(
        &self,
        registry: &VolumeRegistry,
        offset: f64,
        kind: LayerKind,
    ) -> SliceIndex {
        let volume = self.resolve(registry, kind);
        self.resolver.slice_index_from_offset(
            &self.geometry,
            offset,
            volume.as_ref().map(|v| v.volume().geometry()),
        )
    }

    pub fn lowest_layer_slice_index(&self, registry: &VolumeRegistry) -> SliceIndex {
        let volume = self.lowest_volume(registry);
        self.resolver.slice_index_from_offset(
            &self.geometry,
            self.slice_offset(),
            volume.as_ref().map(|v| v.volume().geometry()),
        )
    }

    pub fn lowest_volume_slice_spacing(&self, registry: &VolumeRegistry) -> Option<DVec3> {
        self.lowest_volume(registry)
            .map(|v| self.resolver.volume_slice_spacing(&self.geometry, v.volume().geometry()))
    }

    pub fn lowest_volume_slice_bounds(
        &self,
        registry: &VolumeRegistry,
        use_voxel_center: bool,
    ) -> Option<SliceBounds> {
        self.lowest_volume(registry).map(|v| {
            self.resolver
                .volume_slice_bounds(&self.geometry, v.volume().geometry(), use_voxel_center)
        })
    }

    /// Slider range and step for the slice offset.
    pub fn slice_offset_range_resolution(&self, registry: &VolumeRegistry) -> Option<OffsetRange> {
        self.lowest_volume(registry).map(|v| {
            self.resolver
                .slice_offset_range_resolution(&self.geometry, v.volume().geometry())
        })
    }

    /// Layer an interaction at `world` should edit: a visible foreground
    /// first, then the background.
    pub fn editable_layer_at_world_position(
        &self,
        world: DVec3,
        background_editable: bool,
        foreground_editable: bool,
    ) -> Option<LayerKind> {
        if foreground_editable
            && self.parameters.foreground_opacity() > 0.0
            && self.layers.is_inside_volume(LayerKind::Foreground, world)
        {
            return Some(LayerKind::Foreground);
        }
        if background_editable && self.layers.is_inside_volume(LayerKind::Background, world) {
            return Some(LayerKind::Background);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::volume::Volume;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    fn constant(value: u8, dims: (usize, usize, usize)) -> Volume {
        Volume::new(Array3::from_elem(dims, value), (1.0, 1.0, 1.0)).unwrap()
    }

    fn recorder(view: &mut SliceView) -> Rc<RefCell<Vec<ViewEvent>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        view.subscribe(move |event| sink.borrow_mut().push(event.clone()));
        events
    }

    fn pipeline_updates(events: &Rc<RefCell<Vec<ViewEvent>>>) -> usize {
        events
            .borrow()
            .iter()
            .filter(|e| matches!(e, ViewEvent::PipelineUpdated { .. }))
            .count()
    }

    fn view() -> SliceView {
        SliceView::axial("Red", 32, 32, &EngineConfig::default())
    }

    #[test_log::test]
    fn changes_are_coalesced_into_one_pass() {
        let mut registry = VolumeRegistry::new();
        let bg = registry.insert(constant(100, (4, 16, 16)));
        let fg = registry.insert(constant(200, (4, 16, 16)));
        let mut view = view();
        let events = recorder(&mut view);

        assert!(view.set_layer_volume(LayerKind::Background, Some(bg)));
        assert!(view.set_layer_volume(LayerKind::Foreground, Some(fg)));
        assert!(view.set_foreground_opacity(0.5));
        assert!(view.fit_slice_to_all(&registry));
        assert_eq!(view.state(), SyncState::PendingRebuild);
        let intensity_layers = DirtyFlags::LAYERS.difference(DirtyFlags::LABEL);
        assert!(view.dirty().contains(DirtyFlags::GEOMETRY | intensity_layers));

        assert_eq!(view.process(&registry), 1);
        assert_eq!(view.state(), SyncState::Idle);
        assert_eq!(pipeline_updates(&events), 1);
        assert!(view.output().is_some());
        assert_eq!(view.blend_pipeline().entries().len(), 2);
    }

    #[test_log::test]
    fn unchanged_geometry_does_not_schedule_a_pass() {
        let mut registry = VolumeRegistry::new();
        let bg = registry.insert(constant(50, (4, 8, 8)));
        let mut view = view();
        view.set_layer_volume(LayerKind::Background, Some(bg));
        view.process(&registry);

        assert!(view.set_slice_offset(1.0));
        assert_eq!(view.process(&registry), 1);
        assert!(!view.set_slice_offset(1.0));
        assert_eq!(view.state(), SyncState::Idle);
        assert_eq!(view.process(&registry), 0);
    }

    #[test_log::test]
    fn geometry_changes_are_published_once_per_pass() {
        let registry = VolumeRegistry::new();
        let mut view = view();
        let events = recorder(&mut view);
        view.set_slice_offset(2.0);
        view.set_slice_offset(3.0);
        view.process(&registry);

        let geometry_events: Vec<_> = events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                ViewEvent::GeometryModified(g) => Some(g.offset()),
                _ => None,
            })
            .collect();
        assert_eq!(geometry_events.len(), 1);
        assert_relative_eq!(geometry_events[0], 3.0);
    }

    #[test_log::test]
    fn self_originated_events_are_ignored() {
        let registry = VolumeRegistry::new();
        let mut view = view();
        let inbox = view.inbox();
        view.connect(inbox.clone());

        view.set_slice_offset(4.0);
        assert_eq!(view.process(&registry), 1);
        assert_eq!(view.state(), SyncState::Idle);
        assert!(inbox.is_empty());
    }

    #[test_log::test]
    fn linked_views_see_each_others_geometry_only() {
        let registry = VolumeRegistry::new();
        let mut red = view();
        let mut green = SliceView::axial("Green", 32, 32, &EngineConfig::default());
        red.connect(green.inbox());

        red.set_slice_offset(4.0);
        red.process(&registry);
        assert_eq!(green.inbox().len(), 1);
        // another view's geometry node is not observed
        assert_eq!(green.process(&registry), 0);
    }

    #[test_log::test]
    fn linked_geometry_carries_the_new_plane() {
        let registry = VolumeRegistry::new();
        let mut red = view();
        let outbox = EventQueue::new();
        red.connect(outbox.clone());
        red.set_slice_offset(4.0);
        red.process(&registry);

        let event = outbox.pop().unwrap();
        assert_eq!(event.sender.as_deref(), Some("Red"));
        assert_eq!(event.state, Some(NodeState::SliceGeometry(*red.geometry())));
    }

    #[test_log::test]
    fn node_state_in_events_is_adopted_on_process() {
        let registry = VolumeRegistry::new();
        let mut view = view();
        let moved = view.geometry().with_offset(7.5);
        let blended = view.parameters().with_foreground_opacity(0.4);
        let inbox = view.inbox();
        inbox.push(
            SceneEvent::modified(NodeRef::SliceGeometry("Red".into()))
                .with_state(NodeState::SliceGeometry(moved)),
        );
        inbox.push(
            SceneEvent::modified(NodeRef::CompositeParameters("Red".into()))
                .with_state(NodeState::CompositeParameters(blended)),
        );

        // queued events only count once process consumes them
        assert_eq!(view.state(), SyncState::Idle);
        assert_eq!(view.pending_events(), 2);

        assert_eq!(view.process(&registry), 1);
        assert_eq!(view.pending_events(), 0);
        assert_eq!(*view.geometry(), moved);
        assert_eq!(view.parameters().foreground_opacity(), 0.4);

        // the same value again is not a change
        inbox.push(
            SceneEvent::modified(NodeRef::SliceGeometry("Red".into()))
                .with_state(NodeState::SliceGeometry(moved)),
        );
        assert_eq!(view.process(&registry), 0);
    }

    #[test_log::test]
    fn slab_reconstruction_refreshes_intensity_layers() {
        let mut registry = VolumeRegistry::new();
        let data = Array3::from_shape_fn((5, 8, 8), |(k, _, _)| (k * 40) as u8);
        let bg = registry.insert(Volume::new(data, (1.0, 1.0, 1.0)).unwrap());
        let origin = DVec3::new(4.0, 4.0, 2.0);
        let geometry = SliceGeometry::from_axes(DVec3::X, DVec3::Y, DVec3::Z, origin, 8, 8, 8.0);
        let mut view = SliceView::new("Red", geometry, &EngineConfig::default());
        view.set_layer_volume(LayerKind::Background, Some(bg));
        view.set_window_level(LayerKind::Background, 255.0, 127.5);
        view.process(&registry);
        assert_eq!(view.output().unwrap().get_pixel(4, 4).0[0], 80);

        let slab = SlabSettings {
            enabled: true,
            thickness: 3.0,
            ..SlabSettings::default()
        };
        assert!(view.set_slab_reconstruction(slab));
        assert!(!view.set_slab_reconstruction(slab));
        assert_eq!(view.process(&registry), 1);
        assert_eq!(view.output().unwrap().get_pixel(4, 4).0[0], 120);
    }

    #[test_log::test]
    fn events_during_a_pass_trigger_a_follow_up() {
        let mut registry = VolumeRegistry::new();
        let bg = registry.insert(constant(10, (2, 8, 8)));
        let mut view = view();
        view.set_layer_volume(LayerKind::Background, Some(bg));

        let inbox = view.inbox();
        let fired = Rc::new(RefCell::new(false));
        let flag = Rc::clone(&fired);
        view.subscribe(move |event| {
            if matches!(event, ViewEvent::PipelineUpdated { .. }) && !*flag.borrow() {
                *flag.borrow_mut() = true;
                inbox.push(SceneEvent::modified(NodeRef::Volume(bg)));
            }
        });
        let events = recorder(&mut view);

        assert_eq!(view.process(&registry), 2);
        assert_eq!(pipeline_updates(&events), 2);
        assert_eq!(view.state(), SyncState::Idle);
    }

    #[test_log::test]
    fn follow_up_passes_are_bounded() {
        let mut registry = VolumeRegistry::new();
        let bg = registry.insert(constant(10, (2, 8, 8)));
        let config = EngineConfig {
            pipeline: PipelineConfig {
                max_follow_up_passes: 2,
                ..PipelineConfig::default()
            },
            ..EngineConfig::default()
        };
        let mut view = SliceView::axial("Red", 16, 16, &config);
        view.set_layer_volume(LayerKind::Background, Some(bg));
        let inbox = view.inbox();
        view.subscribe(move |_| inbox.push(SceneEvent::modified(NodeRef::Volume(bg))));

        assert_eq!(view.process(&registry), 3);
        assert_eq!(view.state(), SyncState::PendingRebuild);
    }

    #[test_log::test]
    fn removed_volume_leaves_the_composite() {
        let mut registry = VolumeRegistry::new();
        let bg = registry.insert(constant(10, (2, 8, 8)));
        let mut view = view();
        view.set_layer_volume(LayerKind::Background, Some(bg));
        view.process(&registry);
        assert!(view.output().is_some());

        registry.remove(bg);
        view.inbox()
            .push(SceneEvent::new(SceneEventKind::NodeRemoved, NodeRef::Volume(bg)));
        view.process(&registry);
        assert_eq!(view.layer_volume(LayerKind::Background), None);
        assert!(view.blend_pipeline().is_empty());
        assert!(view.output().is_none());
    }

    #[test_log::test]
    fn replaced_volume_data_is_picked_up() {
        let mut registry = VolumeRegistry::new();
        let bg = registry.insert(constant(10, (1, 8, 8)));
        let mut view = view();
        view.set_layer_volume(LayerKind::Background, Some(bg));
        view.set_window_level(LayerKind::Background, 255.0, 127.5);
        view.fit_slice_to_background(&registry);
        view.process(&registry);
        let before = view.output().unwrap().get_pixel(16, 16).0[0];

        registry.replace(bg, constant(240, (1, 8, 8)));
        view.inbox().push(SceneEvent::modified(NodeRef::Volume(bg)));
        view.process(&registry);
        let after = view.output().unwrap().get_pixel(16, 16).0[0];
        assert_eq!(before, 10);
        assert_eq!(after, 240);
    }

    #[test_log::test]
    fn background_change_can_refit_the_view() {
        let mut registry = VolumeRegistry::new();
        let bg = registry.insert(constant(10, (1, 64, 128)));
        let config = EngineConfig {
            pipeline: PipelineConfig {
                fit_on_background_change: true,
                ..PipelineConfig::default()
            },
            ..EngineConfig::default()
        };
        let mut view = SliceView::axial("Red", 100, 100, &config);
        let events = recorder(&mut view);
        view.set_layer_volume(LayerKind::Background, Some(bg));
        view.process(&registry);

        assert_relative_eq!(view.geometry().field_of_view().x, 128.0, epsilon = 1e-9);
        assert!(events.borrow().iter().any(|e| matches!(e, ViewEvent::GeometryModified(_))));
    }

    #[test_log::test]
    fn opacity_only_update_redraws_without_topology_change() {
        let mut registry = VolumeRegistry::new();
        let bg = registry.insert(constant(100, (1, 8, 8)));
        let fg = registry.insert(constant(200, (1, 8, 8)));
        let mut view = view();
        let events = recorder(&mut view);
        view.set_layer_volume(LayerKind::Background, Some(bg));
        view.set_layer_volume(LayerKind::Foreground, Some(fg));
        for kind in [LayerKind::Background, LayerKind::Foreground] {
            view.set_window_level(kind, 255.0, 127.5);
        }
        view.fit_slice_to_background(&registry);
        view.set_foreground_opacity(0.2);
        view.process(&registry);
        let before = view.output().unwrap().get_pixel(16, 16).0;

        view.set_foreground_opacity(0.8);
        view.process(&registry);
        let after = view.output().unwrap().get_pixel(16, 16).0;
        assert_ne!(before, after);
        match events.borrow().last() {
            Some(ViewEvent::PipelineUpdated { topology_changed, .. }) => assert!(!topology_changed),
            other => panic!("unexpected last event {other:?}"),
        }
    }

    #[test_log::test]
    fn slice_queries_use_the_lowest_volume() {
        let mut registry = VolumeRegistry::new();
        let fg = registry.insert(constant(1, (10, 8, 8)));
        let mut view = view();
        assert_eq!(view.lowest_layer_slice_index(&registry), SliceIndex::NoVolume);

        view.set_layer_volume(LayerKind::Foreground, Some(fg));
        assert!(view.has_inputs(&registry));
        view.set_slice_offset(3.2);
        assert!(view.snap_slice_offset_to_ijk(&registry));
        assert_relative_eq!(view.slice_offset(), 3.0, epsilon = 1e-9);
        assert_eq!(view.lowest_layer_slice_index(&registry), SliceIndex::Index(4));

        let range = view.slice_offset_range_resolution(&registry).unwrap();
        assert_relative_eq!(range.min, 0.0, epsilon = 1e-9);
        assert_relative_eq!(range.max, 9.0, epsilon = 1e-9);
        assert_relative_eq!(range.resolution, 1.0, epsilon = 1e-9);
        let spacing = view.lowest_volume_slice_spacing(&registry).unwrap();
        assert_relative_eq!(spacing.z, 1.0, epsilon = 1e-9);
    }

    #[test_log::test]
    fn editable_layer_prefers_visible_foreground() {
        let mut registry = VolumeRegistry::new();
        let bg = registry.insert(constant(1, (4, 20, 20)));
        let fg = registry.insert(constant(1, (4, 5, 5)));
        let mut view = view();
        view.set_layer_volume(LayerKind::Background, Some(bg));
        view.set_layer_volume(LayerKind::Foreground, Some(fg));
        view.process(&registry);

        let inside_both = DVec3::new(2.0, 2.0, 1.0);
        let background_only = DVec3::new(15.0, 15.0, 1.0);
        let editable = |view: &SliceView, world: DVec3, foreground: bool| {
            view.editable_layer_at_world_position(world, true, foreground)
        };
        assert_eq!(editable(&view, inside_both, true), Some(LayerKind::Background));

        view.set_foreground_opacity(0.5);
        assert_eq!(editable(&view, inside_both, true), Some(LayerKind::Foreground));
        assert_eq!(editable(&view, inside_both, false), Some(LayerKind::Background));
        assert_eq!(editable(&view, background_only, true), Some(LayerKind::Background));
        assert_eq!(editable(&view, DVec3::splat(100.0), true), None);
    }
}
