use std::sync::Arc;

use prism_capture::prelude::*;
use smallvec::SmallVec;
use tracing::{debug, error, info, warn};

use super::{
    config::{BranchConfig, BranchHandle, SourceConfig},
    connection::Connection,
    error::PipelineError,
    pipeline::{BranchRuntime, Pipeline, SourceRuntime},
    tunables::{Tunables, tunables},
};

/// Collects source, branch and presentation settings, then materializes the stage graph.
///
/// The builder only records configuration; nothing is created on the platform until
/// [`PipelineBuilder::finish_configuration`].
///
/// # Example
/// ```rust
/// use prism::prelude::*;
/// use std::sync::Arc;
///
/// let platform = Arc::new(VirtualPlatform::builder().source(1280, 720).build());
/// let mut builder = PipelineBuilder::new(platform)?;
/// let branch = builder.configure_branch(0, 640, 480, Encoding::RGBA, true)?;
/// builder.configure_presentation(branch, DisplayRegion::fullscreen(2))?;
/// let pipeline = builder.finish_configuration()?;
/// pipeline.capture_next_frame(branch)?;
/// assert_eq!(pipeline.get_frame(branch)?.len(), 640 * 480 * 4);
/// pipeline.render_frame(branch)?;
/// # Ok::<(), prism::prelude::PipelineError>(())
/// ```
pub struct PipelineBuilder {
    platform: Arc<dyn Platform>,
    sources: SmallVec<[SourceConfig; 2]>,
    tunables: Tunables,
}

impl PipelineBuilder {
    /// Query the platform for its sources and their limits.
    pub fn new(platform: Arc<dyn Platform>) -> Result<Self, PipelineError> {
        let count = platform.source_count().map_err(PipelineError::Query)?;
        let mut sources = SmallVec::with_capacity(count);
        for index in 0..count {
            let max = platform
                .max_resolution(index)
                .map_err(PipelineError::Query)?;
            sources.push(SourceConfig::new(index, max));
        }
        Ok(Self {
            platform,
            sources,
            tunables: tunables(),
        })
    }

    /// Use `tunables` instead of the process-wide ones for this pipeline.
    pub fn with_tunables(mut self, tunables: Tunables) -> Self {
        self.tunables = tunables.sanitized();
        self
    }

    pub fn tunables(&self) -> Tunables {
        self.tunables
    }

    /// Sources reported by the platform.
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn source(&self, index: usize) -> Option<&SourceConfig> {
        self.sources.get(index)
    }

    /// Size of the display presentation stages draw on.
    pub fn screen_size(&self) -> Result<Resolution, PipelineError> {
        self.platform.screen_size().map_err(PipelineError::Query)
    }

    /// Add a branch to `source` producing `width`x`height` frames in `encoding`.
    ///
    /// Fails without changing anything when the source is unknown, the size is empty or
    /// larger than the source, the encoding is unknown, or the source already has four
    /// branches.
    pub fn configure_branch(
        &mut self,
        source: usize,
        width: u32,
        height: u32,
        encoding: Encoding,
        zero_copy: bool,
    ) -> Result<BranchHandle, PipelineError> {
        let available = self.sources.len();
        let config = self
            .sources
            .get_mut(source)
            .ok_or(PipelineError::NoSuchSource {
                index: source,
                available,
            })?;
        if width == 0 || height == 0 {
            return Err(PipelineError::EmptyGeometry { width, height });
        }
        if !config.max.contains(width, height) {
            return Err(PipelineError::OversizedRequest {
                source_index: source,
                width,
                height,
                max: config.max,
            });
        }
        if !encoding.is_supported() {
            return Err(PipelineError::UnsupportedEncoding(encoding));
        }
        if config.branches.len() >= SPLITTER_OUTPUTS {
            return Err(PipelineError::TooManyBranches {
                source_index: source,
                max: SPLITTER_OUTPUTS,
            });
        }
        let handle = BranchHandle::new(source, config.branches.len());
        config.branches.push(BranchConfig {
            width,
            height,
            encoding,
            zero_copy,
            presentation: None,
        });
        debug!(branch = %handle, width, height, %encoding, zero_copy, "branch configured");
        Ok(handle)
    }

    /// Choose which source output feeds the fan-out.
    pub fn configure_source_port(
        &mut self,
        source: usize,
        port: SourcePort,
    ) -> Result<(), PipelineError> {
        let available = self.sources.len();
        let config = self
            .sources
            .get_mut(source)
            .ok_or(PipelineError::NoSuchSource {
                index: source,
                available,
            })?;
        config.port = port;
        Ok(())
    }

    /// Show `branch` on screen at `region`; a second call replaces the region.
    pub fn configure_presentation(
        &mut self,
        branch: BranchHandle,
        region: DisplayRegion,
    ) -> Result<(), PipelineError> {
        let config = self
            .sources
            .get_mut(branch.source())
            .and_then(|s| s.branches.get_mut(branch.index()))
            .ok_or(PipelineError::UnknownBranch(branch))?;
        config.presentation = Some(region);
        Ok(())
    }

    /// Create, wire and enable every stage, then prime each branch with buffers.
    ///
    /// On failure every stage created so far is destroyed and the builder is gone.
    pub fn finish_configuration(self) -> Result<Pipeline, PipelineError> {
        if !self.sources.iter().any(SourceConfig::in_use) {
            return Err(PipelineError::NothingConfigured);
        }
        let mut graph = StageGraph::new(self.platform.clone());
        match self.materialize(&mut graph) {
            Ok(sources) => {
                info!(
                    sources = sources.len(),
                    stages = graph.stages.len(),
                    connections = graph.connections.len(),
                    "pipeline ready"
                );
                Ok(Pipeline::new(self.platform, graph, sources))
            }
            Err(err) => {
                error!(error = %err, code = err.code(), "pipeline construction failed");
                graph.dismantle();
                Err(err)
            }
        }
    }

    fn materialize(
        &self,
        graph: &mut StageGraph,
    ) -> Result<SmallVec<[SourceRuntime; 2]>, PipelineError> {
        let mut runtimes: SmallVec<[SourceRuntime; 2]> = SmallVec::new();
        let mut pending = Vec::new();

        for source in self.sources.iter().filter(|s| s.in_use()) {
            let Some(provisioned) = source.provisioned() else {
                continue;
            };
            let upstream = PortFormat::aligned(self.tunables.upstream_encoding, provisioned);
            debug!(source = source.index, %upstream, port = ?source.port, "provisioning source");

            let camera = graph.create(StageKind::Source)?;
            self.platform
                .select_source(camera, source.index)
                .map_err(PipelineError::stage("select source", StageKind::Source))?;
            graph.enable_control(camera, StageKind::Source)?;
            let output = graph.port(
                camera,
                StageKind::Source,
                PortDirection::Output,
                source.port.output_index(),
            )?;
            graph.commit(output, StageKind::Source, &upstream, true)?;
            let preview = if source.needs_discard_sink() {
                let preview = graph.port(
                    camera,
                    StageKind::Source,
                    PortDirection::Output,
                    SourcePort::Preview.output_index(),
                )?;
                graph.commit(preview, StageKind::Source, &upstream, true)?;
                Some(preview)
            } else {
                None
            };
            graph.enable_stage(camera, StageKind::Source)?;

            let discard = match preview {
                Some(preview) => {
                    let sink = graph.create(StageKind::DiscardSink)?;
                    graph.enable_control(sink, StageKind::DiscardSink)?;
                    let input = graph.port(sink, StageKind::DiscardSink, PortDirection::Input, 0)?;
                    graph.commit(input, StageKind::DiscardSink, &upstream, true)?;
                    graph.enable_stage(sink, StageKind::DiscardSink)?;
                    Some((preview, input))
                }
                None => None,
            };

            let splitter = graph.create(StageKind::Splitter)?;
            graph.enable_control(splitter, StageKind::Splitter)?;
            let splitter_in = graph.port(splitter, StageKind::Splitter, PortDirection::Input, 0)?;
            graph.commit(splitter_in, StageKind::Splitter, &upstream, true)?;
            let mut splitter_outs: SmallVec<[PortId; SPLITTER_OUTPUTS]> = SmallVec::new();
            for index in 0..source.branches.len() {
                let port = graph.port(splitter, StageKind::Splitter, PortDirection::Output, index)?;
                graph.commit(port, StageKind::Splitter, &upstream, true)?;
                splitter_outs.push(port);
            }
            graph.enable_stage(splitter, StageKind::Splitter)?;

            let mut branches: SmallVec<[BranchRuntime; SPLITTER_OUTPUTS]> = SmallVec::new();
            let mut wiring = SmallVec::<[(PortId, PortId, Option<PortId>); SPLITTER_OUTPUTS]>::new();
            for (index, config) in source.branches.iter().enumerate() {
                let handle = BranchHandle::new(source.index, index);
                let format = config
                    .format()
                    .ok_or(PipelineError::EmptyGeometry {
                        width: config.width,
                        height: config.height,
                    })?;

                let processor = graph.create(StageKind::Processor)?;
                graph.enable_control(processor, StageKind::Processor)?;
                let proc_in = graph.port(processor, StageKind::Processor, PortDirection::Input, 0)?;
                graph.commit(proc_in, StageKind::Processor, &upstream, true)?;
                let proc_out =
                    graph.port(processor, StageKind::Processor, PortDirection::Output, 0)?;
                let req = graph.commit(proc_out, StageKind::Processor, &format, config.zero_copy)?;
                let buffer_num = self
                    .tunables
                    .pool_size(req.buffer_num, config.presentation.is_some());
                let connection = Connection::new(
                    self.platform.clone(),
                    proc_out,
                    buffer_num,
                    req.buffer_size.max(format.frame_size()),
                );
                graph.enable_stage(processor, StageKind::Processor)?;

                let presentation = match config.presentation {
                    Some(region) => {
                        let stage = graph.create(StageKind::Presentation)?;
                        graph.enable_control(stage, StageKind::Presentation)?;
                        let input =
                            graph.port(stage, StageKind::Presentation, PortDirection::Input, 0)?;
                        graph.commit(input, StageKind::Presentation, &format, config.zero_copy)?;
                        self.platform
                            .set_display_region(input, &region)
                            .map_err(PipelineError::stage(
                                "set display region",
                                StageKind::Presentation,
                            ))?;
                        graph.enable_stage(stage, StageKind::Presentation)?;
                        Some(input)
                    }
                    None => None,
                };

                debug!(
                    branch = %handle,
                    %format,
                    buffers = buffer_num,
                    buffer_size = req.buffer_size,
                    presentation = presentation.is_some(),
                    "branch stages created"
                );
                wiring.push((splitter_outs[index], proc_in, presentation));
                branches.push(BranchRuntime::new(
                    handle,
                    *config,
                    format,
                    connection,
                    presentation,
                ));
            }

            pending.push(PendingWiring {
                source_out: output,
                splitter_in,
                wiring,
                discard,
            });
            runtimes.push(SourceRuntime {
                index: source.index,
                port: source.port,
                output,
                upstream,
                branches,
            });
        }

        // Connections in topological order, per source.
        let mut to_enable = Vec::new();
        for (wiring, runtime) in pending.iter().zip(runtimes.iter()) {
            to_enable.push(graph.connect(
                wiring.source_out,
                wiring.splitter_in,
                ConnectionMode::Tunnelled,
                StageKind::Splitter,
            )?);
            for (splitter_out, proc_in, _) in &wiring.wiring {
                to_enable.push(graph.connect(
                    *splitter_out,
                    *proc_in,
                    ConnectionMode::Tunnelled,
                    StageKind::Processor,
                )?);
            }
            for ((_, _, presentation), branch) in wiring.wiring.iter().zip(runtime.branches.iter()) {
                if let Some(input) = presentation {
                    to_enable.push(graph.connect(
                        branch.connection.producer(),
                        *input,
                        ConnectionMode::Managed,
                        StageKind::Presentation,
                    )?);
                }
            }
            if let Some((preview, sink)) = wiring.discard {
                to_enable.push(graph.connect(
                    preview,
                    sink,
                    ConnectionMode::Tunnelled,
                    StageKind::DiscardSink,
                )?);
            }
        }

        // Every completion callback goes in before any connection starts moving buffers.
        for runtime in &runtimes {
            for branch in &runtime.branches {
                graph.enable_port(
                    branch.connection.producer(),
                    StageKind::Processor,
                    branch.connection.completion_callback(),
                )?;
                if let Some(input) = branch.presentation {
                    graph.enable_port(input, StageKind::Presentation, release_callback())?;
                }
            }
        }
        for (connection, kind) in to_enable {
            graph.enable_connection(connection, kind)?;
        }

        for runtime in &runtimes {
            for branch in &runtime.branches {
                let primed = branch
                    .connection
                    .drain_free_buffers_to_port()
                    .map_err(|error| PipelineError::Recycle {
                        branch: branch.handle,
                        error,
                    })?;
                branch.counters.recycled(primed);
            }
        }
        Ok(runtimes)
    }
}

struct PendingWiring {
    source_out: PortId,
    splitter_in: PortId,
    /// Splitter output, processor input and optional presentation input per branch.
    wiring: SmallVec<[(PortId, PortId, Option<PortId>); SPLITTER_OUTPUTS]>,
    discard: Option<(PortId, PortId)>,
}

/// Buffers coming back from a control port or a presentation stage are just released.
fn release_callback() -> CompletionCallback {
    Arc::new(|_port: PortId, buffer: BufferHeader| drop(buffer))
}

/// Record of everything created on the platform, so it can be dismantled as a unit.
pub(crate) struct StageGraph {
    platform: Arc<dyn Platform>,
    pub(crate) stages: Vec<StageId>,
    pub(crate) connections: Vec<ConnectionId>,
    enabled_connections: Vec<ConnectionId>,
    enabled_ports: Vec<PortId>,
}

impl StageGraph {
    fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            stages: Vec::new(),
            connections: Vec::new(),
            enabled_connections: Vec::new(),
            enabled_ports: Vec::new(),
        }
    }

    fn create(&mut self, kind: StageKind) -> Result<StageId, PipelineError> {
        let stage = self
            .platform
            .create_stage(kind)
            .map_err(PipelineError::stage("create", kind))?;
        self.stages.push(stage);
        Ok(stage)
    }

    fn port(
        &self,
        stage: StageId,
        kind: StageKind,
        direction: PortDirection,
        index: usize,
    ) -> Result<PortId, PipelineError> {
        self.platform
            .port(stage, direction, index)
            .map_err(PipelineError::stage("port lookup", kind))
    }

    fn commit(
        &self,
        port: PortId,
        kind: StageKind,
        format: &PortFormat,
        zero_copy: bool,
    ) -> Result<PortRequirements, PipelineError> {
        let req = self
            .platform
            .commit_format(port, format)
            .map_err(PipelineError::stage("commit format", kind))?;
        self.platform
            .set_zero_copy(port, zero_copy)
            .map_err(PipelineError::stage("set zero copy", kind))?;
        Ok(req)
    }

    fn enable_stage(&self, stage: StageId, kind: StageKind) -> Result<(), PipelineError> {
        self.platform
            .enable_stage(stage)
            .map_err(PipelineError::stage("enable", kind))
    }

    fn enable_control(&mut self, stage: StageId, kind: StageKind) -> Result<(), PipelineError> {
        let control = self.port(stage, kind, PortDirection::Control, 0)?;
        self.enable_port(control, kind, release_callback())
    }

    fn enable_port(
        &mut self,
        port: PortId,
        kind: StageKind,
        callback: CompletionCallback,
    ) -> Result<(), PipelineError> {
        self.platform
            .enable_port(port, callback)
            .map_err(PipelineError::stage("enable port", kind))?;
        self.enabled_ports.push(port);
        Ok(())
    }

    fn connect(
        &mut self,
        output: PortId,
        input: PortId,
        mode: ConnectionMode,
        consumer: StageKind,
    ) -> Result<(ConnectionId, StageKind), PipelineError> {
        let connection = self
            .platform
            .create_connection(output, input, mode)
            .map_err(PipelineError::stage("create connection", consumer))?;
        self.connections.push(connection);
        Ok((connection, consumer))
    }

    fn enable_connection(
        &mut self,
        connection: ConnectionId,
        consumer: StageKind,
    ) -> Result<(), PipelineError> {
        self.platform
            .enable_connection(connection)
            .map_err(PipelineError::stage("enable connection", consumer))?;
        self.enabled_connections.push(connection);
        Ok(())
    }

    /// Disable and destroy everything, newest first.
    pub(crate) fn dismantle(&mut self) {
        for connection in self.enabled_connections.drain(..).rev() {
            if let Err(err) = self.platform.disable_connection(connection) {
                warn!(?connection, error = %err, "disabling connection failed");
            }
        }
        for port in self.enabled_ports.drain(..).rev() {
            if let Err(err) = self.platform.disable_port(port) {
                warn!(?port, error = %err, "disabling port failed");
            }
        }
        for stage in self.stages.drain(..).rev() {
            if let Err(err) = self.platform.destroy_stage(stage) {
                warn!(?stage, error = %err, "destroying stage failed");
            }
        }
        self.connections.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder(sources: &[(u32, u32)]) -> PipelineBuilder {
        let mut platform = VirtualPlatform::builder();
        for (w, h) in sources {
            platform = platform.source(*w, *h);
        }
        PipelineBuilder::new(Arc::new(platform.build())).unwrap()
    }

    #[test]
    fn rejects_bad_requests_without_mutation() {
        let mut b = builder(&[(640, 480)]);
        assert!(matches!(
            b.configure_branch(1, 320, 240, Encoding::RGBA, true),
            Err(PipelineError::NoSuchSource { index: 1, available: 1 })
        ));
        assert!(matches!(
            b.configure_branch(0, 641, 480, Encoding::RGBA, true),
            Err(PipelineError::OversizedRequest { .. })
        ));
        assert!(matches!(
            b.configure_branch(0, 0, 480, Encoding::RGBA, true),
            Err(PipelineError::EmptyGeometry { .. })
        ));
        assert!(matches!(
            b.configure_branch(0, 320, 240, Encoding::new(*b"NOPE"), true),
            Err(PipelineError::UnsupportedEncoding(_))
        ));
        assert!(b.source(0).unwrap().branches.is_empty());
        assert!(b.configure_branch(0, 640, 480, Encoding::RGBA, true).is_ok());
    }

    #[test]
    fn fifth_branch_is_rejected() {
        let mut b = builder(&[(640, 480)]);
        let handles: Vec<_> = (0..4)
            .map(|_| b.configure_branch(0, 320, 240, Encoding::RGBA, false).unwrap())
            .collect();
        assert_eq!(handles.last().unwrap().index(), 3);
        let err = b
            .configure_branch(0, 320, 240, Encoding::RGBA, false)
            .unwrap_err();
        assert!(matches!(err, PipelineError::TooManyBranches { max: 4, .. }));
        assert_eq!(b.source(0).unwrap().branches.len(), 4);
    }

    #[test]
    fn presentation_requires_known_branch() {
        let mut b = builder(&[(640, 480)]);
        let branch = b.configure_branch(0, 320, 240, Encoding::RGBA, true).unwrap();
        b.configure_presentation(branch, DisplayRegion::fullscreen(1))
            .unwrap();
        b.configure_presentation(branch, DisplayRegion::fullscreen(3))
            .unwrap();
        assert_eq!(
            b.source(0).unwrap().branches[0].presentation,
            Some(DisplayRegion::fullscreen(3))
        );
        assert!(matches!(
            b.configure_presentation(BranchHandle::new(0, 1), DisplayRegion::default()),
            Err(PipelineError::UnknownBranch(_))
        ));
    }

    #[test]
    fn finishing_without_branches_fails() {
        let b = builder(&[(640, 480)]);
        assert!(matches!(
            b.finish_configuration(),
            Err(PipelineError::NothingConfigured)
        ));
    }
}
