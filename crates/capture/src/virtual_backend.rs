//! Virtual stage platform that simulates the camera graph in software.
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use smallvec::SmallVec;
use tracing::{debug, trace};

use prism_core::prelude::*;

use crate::{
    CompletionCallback, ConnectionId, ConnectionMode, DisplayRegion, Platform, PlatformError,
    PortDirection, PortId, PortRequirements, SendError, SourcePort, StageId, StageKind,
};

/// Buffer count every port recommends by default.
pub const DEFAULT_PORT_BUFFERS: usize = 3;
/// Default delay between two produced frames.
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(5);
/// Displayed frames remembered for inspection.
const DISPLAY_LOG_DEPTH: usize = 64;

/// Platform call that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    CreateStage(StageKind),
    CommitFormat(StageKind),
    EnablePort(StageKind),
    CreateConnection(ConnectionMode),
    EnableConnection(ConnectionMode),
    Trigger,
}

/// Structural calls recorded in the order the platform saw them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformEvent {
    StageCreated(StageId, StageKind),
    StageEnabled(StageId),
    PortEnabled(PortId),
    PortDisabled(PortId),
    ConnectionCreated(ConnectionId, ConnectionMode),
    ConnectionEnabled(ConnectionId),
    ConnectionDisabled(ConnectionId),
    CaptureTriggered(PortId),
    StageDestroyed(StageId),
}

/// A buffer shown by a presentation stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayedFrame {
    pub port: PortId,
    pub sequence: u64,
    pub length: usize,
    pub flags: BufferFlags,
    /// First payload byte, enough to tell frames and edits apart.
    pub first_byte: Option<u8>,
}

/// Inspection view of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortInfo {
    pub stage: StageId,
    pub kind: StageKind,
    pub direction: PortDirection,
    pub index: usize,
    pub format: Option<PortFormat>,
    pub zero_copy: bool,
    pub region: Option<DisplayRegion>,
    pub enabled: bool,
    /// Buffers waiting on the port to be filled.
    pub queued: usize,
    /// A presentation input currently shows a frame.
    pub on_screen: bool,
}

/// Byte every payload of frame `sequence` is filled with; never zero.
pub fn pattern_byte(sequence: u64) -> u8 {
    (sequence % 255) as u8 + 1
}

/// Builder for [`VirtualPlatform`].
///
/// # Example
/// ```rust
/// use prism_capture::prelude::*;
///
/// let platform = VirtualPlatform::builder()
///     .source(1280, 720)
///     .screen(800, 480)
///     .empty_completions(true)
///     .build();
/// assert_eq!(platform.source_count().unwrap(), 1);
/// assert_eq!(platform.max_resolution(0).unwrap().to_string(), "1280x720");
/// ```
#[derive(Debug, Clone)]
pub struct VirtualPlatformBuilder {
    sources: SmallVec<[(u32, u32); 4]>,
    screen: (u32, u32),
    frame_interval: Duration,
    port_buffers: usize,
    empty_completions: bool,
    failures: Vec<FailPoint>,
}

impl Default for VirtualPlatformBuilder {
    fn default() -> Self {
        Self {
            sources: SmallVec::new(),
            screen: (1920, 1080),
            frame_interval: DEFAULT_FRAME_INTERVAL,
            port_buffers: DEFAULT_PORT_BUFFERS,
            empty_completions: false,
            failures: Vec::new(),
        }
    }
}

impl VirtualPlatformBuilder {
    /// Attach a camera with the given maximum resolution.
    pub fn source(mut self, max_width: u32, max_height: u32) -> Self {
        self.sources.push((max_width, max_height));
        self
    }

    pub fn screen(mut self, width: u32, height: u32) -> Self {
        self.screen = (width, height);
        self
    }

    /// Delay between two frames on a streaming port.
    pub fn frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval.max(Duration::from_micros(100));
        self
    }

    /// Buffer count ports recommend once their format is committed.
    pub fn port_buffers(mut self, count: usize) -> Self {
        self.port_buffers = count.max(1);
        self
    }

    /// Precede every other processor completion with a zero-length one.
    pub fn empty_completions(mut self, enabled: bool) -> Self {
        self.empty_completions = enabled;
        self
    }

    /// Make the matching platform call fail with `OutOfResources`.
    pub fn fail_on(mut self, point: FailPoint) -> Self {
        self.failures.push(point);
        self
    }

    /// Start the platform and its frame worker.
    pub fn build(self) -> VirtualPlatform {
        let shared = Arc::new(Shared {
            config: self,
            state: Mutex::new(State::default()),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
            events: BufferPool::new(8, 64),
        });
        let worker_shared = shared.clone();
        let worker = thread::spawn(move || run_worker(worker_shared));
        VirtualPlatform {
            shared,
            worker: Some(worker),
        }
    }
}

/// Software stage platform.
///
/// A worker thread produces one frame per source every frame interval on streaming ports
/// (and one per trigger on capture ports), fans it out along enabled tunnelled connections
/// and fills buffers queued on processor outputs with a pattern derived from the frame
/// sequence. Completions are delivered from the worker thread outside the platform lock.
pub struct VirtualPlatform {
    shared: Arc<Shared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl VirtualPlatform {
    pub fn builder() -> VirtualPlatformBuilder {
        VirtualPlatformBuilder::default()
    }

    /// One 1920x1080 camera and default settings.
    pub fn new() -> Self {
        Self::builder().source(1920, 1080).build()
    }

    /// Report a transmission failure on the next `count` processor completions.
    pub fn fail_next_completions(&self, count: usize) {
        self.shared.state.lock().pending_failures += count;
    }

    /// Every structural call seen so far.
    pub fn events(&self) -> Vec<PlatformEvent> {
        self.shared.state.lock().log.clone()
    }

    /// Most recent frames shown by presentation stages, oldest first.
    pub fn displayed(&self) -> Vec<DisplayedFrame> {
        self.shared.state.lock().displayed.iter().copied().collect()
    }

    /// Frames consumed by discard sinks.
    pub fn discarded(&self) -> u64 {
        self.shared.state.lock().discarded
    }

    /// Frames lost because a processor output had no buffer queued.
    pub fn starved(&self) -> u64 {
        self.shared.state.lock().starved
    }

    /// Stages that exist and have not been destroyed.
    pub fn live_stages(&self) -> Vec<(StageId, StageKind)> {
        let state = self.shared.state.lock();
        state
            .stages
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.destroyed)
            .map(|(idx, s)| (StageId(idx as u32), s.kind))
            .collect()
    }

    /// Every stage ever created, destroyed or not.
    pub fn created_stages(&self) -> Vec<(StageId, StageKind)> {
        let state = self.shared.state.lock();
        state
            .stages
            .iter()
            .enumerate()
            .map(|(idx, s)| (StageId(idx as u32), s.kind))
            .collect()
    }

    pub fn port_info(&self, port: PortId) -> Option<PortInfo> {
        let state = self.shared.state.lock();
        state.ports.get(port.0 as usize).map(|p| PortInfo {
            stage: p.stage,
            kind: p.kind,
            direction: p.direction,
            index: p.index,
            format: p.format,
            zero_copy: p.zero_copy,
            region: p.region,
            enabled: p.callback.is_some() || p.tunnelled,
            queued: p.queued.len(),
            on_screen: p.held.is_some(),
        })
    }

    /// Ports of every live stage of `kind`, in creation order.
    pub fn ports_of(&self, kind: StageKind, direction: PortDirection) -> Vec<PortId> {
        let state = self.shared.state.lock();
        state
            .stages
            .iter()
            .filter(|s| s.kind == kind && !s.destroyed)
            .flat_map(|s| match direction {
                PortDirection::Control => vec![s.control],
                PortDirection::Input => s.inputs.to_vec(),
                PortDirection::Output => s.outputs.to_vec(),
            })
            .collect()
    }

    fn check(&self, point: FailPoint) -> Result<(), PlatformError> {
        if self.shared.config.failures.contains(&point) {
            debug!(?point, "injecting platform failure");
            return Err(PlatformError::OutOfResources(format!(
                "injected failure at {point:?}"
            )));
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock()
    }
}

impl Default for VirtualPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for VirtualPlatform {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        {
            let _guard = self.shared.state.lock();
            self.shared.wake.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Platform for VirtualPlatform {
    fn source_count(&self) -> Result<usize, PlatformError> {
        Ok(self.shared.config.sources.len())
    }

    fn max_resolution(&self, source: usize) -> Result<Resolution, PlatformError> {
        let (w, h) = self
            .shared
            .config
            .sources
            .get(source)
            .copied()
            .ok_or(PlatformError::NoSuchSource(source))?;
        Resolution::new(w, h).ok_or(PlatformError::NoSuchSource(source))
    }

    fn screen_size(&self) -> Result<Resolution, PlatformError> {
        let (w, h) = self.shared.config.screen;
        Resolution::new(w, h).ok_or(PlatformError::Unsupported("display without geometry"))
    }

    fn create_stage(&self, kind: StageKind) -> Result<StageId, PlatformError> {
        self.check(FailPoint::CreateStage(kind))?;
        let mut state = self.lock();
        let id = StageId(state.stages.len() as u32);
        let control = state.add_port(id, kind, PortDirection::Control, 0);
        let inputs = (0..kind.port_count(PortDirection::Input))
            .map(|idx| state.add_port(id, kind, PortDirection::Input, idx))
            .collect();
        let outputs = (0..kind.port_count(PortDirection::Output))
            .map(|idx| state.add_port(id, kind, PortDirection::Output, idx))
            .collect();
        state.stages.push(StageRecord {
            kind,
            source: None,
            enabled: false,
            destroyed: false,
            control,
            inputs,
            outputs,
        });
        state.log.push(PlatformEvent::StageCreated(id, kind));
        Ok(id)
    }

    fn port(
        &self,
        stage: StageId,
        direction: PortDirection,
        index: usize,
    ) -> Result<PortId, PlatformError> {
        let state = self.lock();
        let record = state.stage(stage)?;
        let port = match direction {
            PortDirection::Control if index == 0 => Some(record.control),
            PortDirection::Control => None,
            PortDirection::Input => record.inputs.get(index).copied(),
            PortDirection::Output => record.outputs.get(index).copied(),
        };
        port.ok_or(PlatformError::NoSuchPort {
            kind: record.kind,
            direction,
            index,
        })
    }

    fn select_source(&self, stage: StageId, source: usize) -> Result<(), PlatformError> {
        if source >= self.shared.config.sources.len() {
            return Err(PlatformError::NoSuchSource(source));
        }
        let mut state = self.lock();
        let record = state.stage_mut(stage)?;
        if record.kind != StageKind::Source {
            return Err(PlatformError::Unsupported("source selection on a non-source stage"));
        }
        record.source = Some(source);
        Ok(())
    }

    fn commit_format(
        &self,
        port: PortId,
        format: &PortFormat,
    ) -> Result<PortRequirements, PlatformError> {
        let kind = self.lock().port(port)?.kind;
        self.check(FailPoint::CommitFormat(kind))?;
        let reject = |reason: &str| PlatformError::FormatRejected {
            format: *format,
            reason: reason.to_string(),
        };
        if !format.encoding.is_supported() {
            return Err(reject("unknown encoding"));
        }
        if format.width == 0 || format.height == 0 {
            return Err(reject("empty geometry"));
        }
        if format.width % WIDTH_ALIGN != 0 || format.height % HEIGHT_ALIGN != 0 {
            return Err(reject("geometry not aligned"));
        }
        if format.crop.x + format.crop.width > format.width
            || format.crop.y + format.crop.height > format.height
        {
            return Err(reject("crop outside the buffer"));
        }

        let mut state = self.lock();
        let stage = state.port(port)?.stage;
        if let Some(source) = state.stage(stage)?.source {
            let (max_w, max_h) = self.shared.config.sources[source];
            if format.crop.width > max_w || format.crop.height > max_h {
                return Err(reject("larger than the sensor"));
            }
        }
        let record = state.port_mut(port)?;
        if record.direction == PortDirection::Control {
            return Err(PlatformError::Unsupported("format on a control port"));
        }
        record.format = Some(*format);
        Ok(PortRequirements {
            buffer_num: self.shared.config.port_buffers,
            buffer_size: format.frame_size(),
        })
    }

    fn set_zero_copy(&self, port: PortId, enabled: bool) -> Result<(), PlatformError> {
        self.lock().port_mut(port)?.zero_copy = enabled;
        Ok(())
    }

    fn set_display_region(
        &self,
        port: PortId,
        region: &DisplayRegion,
    ) -> Result<(), PlatformError> {
        let mut state = self.lock();
        let record = state.port_mut(port)?;
        if record.kind != StageKind::Presentation {
            return Err(PlatformError::Unsupported("display region on a non-presentation port"));
        }
        record.region = Some(*region);
        Ok(())
    }

    fn enable_stage(&self, stage: StageId) -> Result<(), PlatformError> {
        let mut state = self.lock();
        let record = state.stage_mut(stage)?;
        if record.kind == StageKind::Source && record.source.is_none() {
            return Err(PlatformError::Unsupported("source stage without a camera"));
        }
        record.enabled = true;
        state.log.push(PlatformEvent::StageEnabled(stage));
        Ok(())
    }

    fn enable_port(&self, port: PortId, callback: CompletionCallback) -> Result<(), PlatformError> {
        let kind = self.lock().port(port)?.kind;
        self.check(FailPoint::EnablePort(kind))?;
        let mut state = self.lock();
        let record = state.port_mut(port)?;
        if record.callback.is_some() || record.tunnelled {
            return Err(PlatformError::PortAlreadyEnabled(port));
        }
        if record.direction != PortDirection::Control && record.format.is_none() {
            return Err(PlatformError::Unsupported("enabling a port without a format"));
        }
        record.callback = Some(callback);
        state.log.push(PlatformEvent::PortEnabled(port));
        Ok(())
    }

    fn disable_port(&self, port: PortId) -> Result<(), PlatformError> {
        let mut state = self.lock();
        let record = state.port_mut(port)?;
        let queued: Vec<BufferHeader> = record.queued.drain(..).collect();
        let held = record.held.take();
        let was_enabled = record.callback.take().is_some();
        if was_enabled {
            state.log.push(PlatformEvent::PortDisabled(port));
        }
        drop(state);
        drop(queued);
        drop(held);
        Ok(())
    }

    fn create_connection(
        &self,
        output: PortId,
        input: PortId,
        mode: ConnectionMode,
    ) -> Result<ConnectionId, PlatformError> {
        self.check(FailPoint::CreateConnection(mode))?;
        let mut state = self.lock();
        let out = state.port(output)?;
        let inp = state.port(input)?;
        if out.direction != PortDirection::Output || inp.direction != PortDirection::Input {
            return Err(PlatformError::Unsupported("connections run from an output to an input"));
        }
        if out.connection.is_some() || inp.connection.is_some() {
            return Err(PlatformError::Unsupported("port already connected"));
        }
        let (Some(out_format), Some(in_format)) = (out.format, inp.format) else {
            return Err(PlatformError::Unsupported("connecting ports without formats"));
        };
        if out_format != in_format {
            return Err(PlatformError::FormatRejected {
                format: in_format,
                reason: format!("does not match upstream {out_format}"),
            });
        }
        let id = ConnectionId(state.connections.len() as u32);
        state.connections.push(ConnectionRecord {
            output,
            input,
            mode,
            enabled: false,
        });
        state.port_mut(output)?.connection = Some(id);
        state.port_mut(input)?.connection = Some(id);
        state.log.push(PlatformEvent::ConnectionCreated(id, mode));
        Ok(id)
    }

    fn enable_connection(&self, connection: ConnectionId) -> Result<(), PlatformError> {
        let mode = self.lock().connection(connection)?.mode;
        self.check(FailPoint::EnableConnection(mode))?;
        let mut state = self.lock();
        let record = *state.connection(connection)?;
        match record.mode {
            ConnectionMode::Tunnelled => {
                for port in [record.output, record.input] {
                    let p = state.port_mut(port)?;
                    if p.callback.is_some() {
                        return Err(PlatformError::PortAlreadyEnabled(port));
                    }
                    p.tunnelled = true;
                }
            }
            ConnectionMode::Managed => {
                // Both ends must already deliver completions to their owner.
                for port in [record.output, record.input] {
                    if state.port(port)?.callback.is_none() {
                        return Err(PlatformError::PortDisabled(port));
                    }
                }
            }
        }
        state.connection_mut(connection)?.enabled = true;
        state.log.push(PlatformEvent::ConnectionEnabled(connection));
        self.shared.wake.notify_all();
        Ok(())
    }

    fn disable_connection(&self, connection: ConnectionId) -> Result<(), PlatformError> {
        let mut state = self.lock();
        let record = *state.connection(connection)?;
        if !record.enabled {
            return Ok(());
        }
        if record.mode == ConnectionMode::Tunnelled {
            for port in [record.output, record.input] {
                state.port_mut(port)?.tunnelled = false;
            }
        }
        state.connection_mut(connection)?.enabled = false;
        state.log.push(PlatformEvent::ConnectionDisabled(connection));
        Ok(())
    }

    fn send_buffer(&self, port: PortId, mut buffer: BufferHeader) -> Result<(), SendError> {
        let mut state = self.lock();
        let record = match state.port_mut(port) {
            Ok(record) => record,
            Err(error) => return Err(SendError { error, buffer }),
        };
        let Some(callback) = record.callback.clone() else {
            return Err(SendError {
                error: PlatformError::PortDisabled(port),
                buffer,
            });
        };
        match (record.kind, record.direction) {
            (StageKind::Processor, PortDirection::Output) => {
                let needed = record.format.map(|f| f.frame_size()).unwrap_or(0);
                if buffer.capacity() < needed {
                    let error = PlatformError::OutOfResources(format!(
                        "buffer holds {} bytes, port needs {needed}",
                        buffer.capacity()
                    ));
                    return Err(SendError { error, buffer });
                }
                buffer.set_len(0);
                buffer.set_flags(BufferFlags::NONE);
                record.queued.push_back(buffer);
                Ok(())
            }
            (StageKind::Presentation, PortDirection::Input) => {
                let shown = DisplayedFrame {
                    port,
                    sequence: buffer.sequence(),
                    length: buffer.len(),
                    flags: buffer.flags(),
                    first_byte: buffer.payload().first().copied(),
                };
                let previous = record.held.replace(buffer);
                if state.displayed.len() == DISPLAY_LOG_DEPTH {
                    state.displayed.pop_front();
                }
                state.displayed.push_back(shown);
                drop(state);
                // The previous frame leaves the screen and goes back to its owner.
                if let Some(previous) = previous {
                    callback(port, previous);
                }
                Ok(())
            }
            (StageKind::DiscardSink, PortDirection::Input) => {
                state.discarded += 1;
                drop(state);
                callback(port, buffer);
                Ok(())
            }
            _ => Err(SendError {
                error: PlatformError::Unsupported("port does not accept buffers"),
                buffer,
            }),
        }
    }

    fn trigger_capture(&self, port: PortId) -> Result<(), PlatformError> {
        self.check(FailPoint::Trigger)?;
        let mut state = self.lock();
        let record = state.port_mut(port)?;
        if record.kind != StageKind::Source
            || record.direction != PortDirection::Output
            || record.index != SourcePort::Capture.output_index()
        {
            return Err(PlatformError::Unsupported("trigger on a non-capture port"));
        }
        record.triggers += 1;
        state.log.push(PlatformEvent::CaptureTriggered(port));
        self.shared.wake.notify_all();
        Ok(())
    }

    fn destroy_stage(&self, stage: StageId) -> Result<(), PlatformError> {
        let mut state = self.lock();
        let record = state.stage_mut(stage)?;
        if record.destroyed {
            return Ok(());
        }
        record.destroyed = true;
        record.enabled = false;
        let mut ports: SmallVec<[PortId; 6]> = SmallVec::new();
        ports.push(record.control);
        ports.extend(record.inputs.iter().copied());
        ports.extend(record.outputs.iter().copied());

        let mut released = Vec::new();
        for port in ports {
            let p = state.port_mut(port)?;
            p.callback = None;
            p.tunnelled = false;
            released.extend(p.queued.drain(..));
            released.extend(p.held.take());
            if let Some(conn) = p.connection
                && let Ok(c) = state.connection_mut(conn)
            {
                c.enabled = false;
            }
        }
        state.log.push(PlatformEvent::StageDestroyed(stage));
        drop(state);
        drop(released);
        Ok(())
    }
}

struct Shared {
    config: VirtualPlatformBuilder,
    state: Mutex<State>,
    wake: Condvar,
    shutdown: AtomicBool,
    /// Control-port event buffers.
    events: BufferPool,
}

#[derive(Default)]
struct State {
    stages: Vec<StageRecord>,
    ports: Vec<PortRecord>,
    connections: Vec<ConnectionRecord>,
    sequence: u64,
    pending_failures: usize,
    log: Vec<PlatformEvent>,
    displayed: VecDeque<DisplayedFrame>,
    discarded: u64,
    starved: u64,
}

struct StageRecord {
    kind: StageKind,
    source: Option<usize>,
    enabled: bool,
    destroyed: bool,
    control: PortId,
    inputs: SmallVec<[PortId; 1]>,
    outputs: SmallVec<[PortId; 4]>,
}

struct PortRecord {
    stage: StageId,
    kind: StageKind,
    direction: PortDirection,
    index: usize,
    format: Option<PortFormat>,
    zero_copy: bool,
    region: Option<DisplayRegion>,
    callback: Option<CompletionCallback>,
    /// Enabled as one end of a tunnelled connection.
    tunnelled: bool,
    connection: Option<ConnectionId>,
    queued: VecDeque<BufferHeader>,
    /// Frame currently on screen.
    held: Option<BufferHeader>,
    triggers: u32,
    completions: u64,
}

#[derive(Debug, Clone, Copy)]
struct ConnectionRecord {
    output: PortId,
    input: PortId,
    mode: ConnectionMode,
    enabled: bool,
}

type Delivery = (CompletionCallback, PortId, BufferHeader);

impl State {
    fn add_port(
        &mut self,
        stage: StageId,
        kind: StageKind,
        direction: PortDirection,
        index: usize,
    ) -> PortId {
        let id = PortId(self.ports.len() as u32);
        self.ports.push(PortRecord {
            stage,
            kind,
            direction,
            index,
            format: None,
            zero_copy: false,
            region: None,
            callback: None,
            tunnelled: false,
            connection: None,
            queued: VecDeque::new(),
            held: None,
            triggers: 0,
            completions: 0,
        });
        id
    }

    fn stage(&self, id: StageId) -> Result<&StageRecord, PlatformError> {
        self.stages
            .get(id.0 as usize)
            .filter(|s| !s.destroyed)
            .ok_or(PlatformError::UnknownStage(id))
    }

    fn stage_mut(&mut self, id: StageId) -> Result<&mut StageRecord, PlatformError> {
        self.stages
            .get_mut(id.0 as usize)
            .ok_or(PlatformError::UnknownStage(id))
    }

    fn port(&self, id: PortId) -> Result<&PortRecord, PlatformError> {
        self.ports
            .get(id.0 as usize)
            .ok_or(PlatformError::UnknownPort(id))
    }

    fn port_mut(&mut self, id: PortId) -> Result<&mut PortRecord, PlatformError> {
        self.ports
            .get_mut(id.0 as usize)
            .ok_or(PlatformError::UnknownPort(id))
    }

    fn connection(&self, id: ConnectionId) -> Result<&ConnectionRecord, PlatformError> {
        self.connections
            .get(id.0 as usize)
            .ok_or(PlatformError::UnknownConnection(id))
    }

    fn connection_mut(&mut self, id: ConnectionId) -> Result<&mut ConnectionRecord, PlatformError> {
        self.connections
            .get_mut(id.0 as usize)
            .ok_or(PlatformError::UnknownConnection(id))
    }

    fn stage_live(&self, id: StageId) -> bool {
        self.stages
            .get(id.0 as usize)
            .is_some_and(|s| s.enabled && !s.destroyed)
    }

    /// Input port on the far side of an enabled tunnel leaving `output`.
    fn tunnel_peer(&self, output: PortId) -> Option<PortId> {
        let conn = self.ports.get(output.0 as usize)?.connection?;
        let record = self.connections.get(conn.0 as usize)?;
        (record.enabled && record.mode == ConnectionMode::Tunnelled && record.output == output)
            .then_some(record.input)
    }

    /// Run one production step for every live source.
    fn produce(&mut self, config: &VirtualPlatformBuilder, events: &BufferPool) -> Vec<Delivery> {
        let mut out = Vec::new();
        for stage_idx in 0..self.stages.len() {
            let stage = &self.stages[stage_idx];
            if stage.kind != StageKind::Source || !stage.enabled || stage.destroyed {
                continue;
            }
            let control = stage.control;
            let outputs = stage.outputs.clone();
            for (index, port) in outputs.iter().copied().enumerate() {
                let Some(peer) = self.tunnel_peer(port) else {
                    continue;
                };
                let triggered = index == SourcePort::Capture.output_index();
                if triggered {
                    let record = &mut self.ports[port.0 as usize];
                    if record.triggers == 0 {
                        continue;
                    }
                    record.triggers -= 1;
                }
                self.sequence += 1;
                let sequence = self.sequence;
                self.propagate(peer, sequence, config, &mut out);
                if triggered {
                    self.control_event(control, sequence, events, &mut out);
                }
            }
        }
        out
    }

    fn propagate(
        &mut self,
        input: PortId,
        sequence: u64,
        config: &VirtualPlatformBuilder,
        out: &mut Vec<Delivery>,
    ) {
        let Some(record) = self.ports.get(input.0 as usize) else {
            return;
        };
        let stage_id = record.stage;
        if !self.stage_live(stage_id) {
            return;
        }
        let stage = &self.stages[stage_id.0 as usize];
        match stage.kind {
            StageKind::DiscardSink => self.discarded += 1,
            StageKind::Splitter => {
                let outputs = stage.outputs.clone();
                for output in outputs {
                    if let Some(peer) = self.tunnel_peer(output) {
                        self.propagate(peer, sequence, config, out);
                    }
                }
            }
            StageKind::Processor => {
                if let Some(output) = stage.outputs.first().copied() {
                    self.complete(output, sequence, config, out);
                }
            }
            StageKind::Source | StageKind::Presentation => {}
        }
    }

    /// Fill the next buffer queued on a processor output.
    fn complete(
        &mut self,
        port: PortId,
        sequence: u64,
        config: &VirtualPlatformBuilder,
        out: &mut Vec<Delivery>,
    ) {
        let record = &mut self.ports[port.0 as usize];
        let (Some(callback), Some(format)) = (record.callback.clone(), record.format) else {
            return;
        };
        if config.empty_completions && record.completions % 2 == 0 && record.queued.len() >= 2 {
            if let Some(mut empty) = record.queued.pop_front() {
                empty.set_len(0);
                empty.set_flags(BufferFlags::FRAME_END);
                empty.set_sequence(sequence);
                out.push((callback.clone(), port, empty));
            }
        }
        let Some(mut buffer) = record.queued.pop_front() else {
            self.starved += 1;
            trace!(?port, sequence, "processor output starved");
            return;
        };
        record.completions += 1;
        let size = format.frame_size().min(buffer.capacity());
        buffer.storage_mut()[..size].fill(pattern_byte(sequence));
        buffer.set_len(size);
        let mut flags = BufferFlags::FRAME_END;
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            flags.insert(BufferFlags::TRANSMISSION_FAILED);
        }
        buffer.set_flags(flags);
        buffer.set_sequence(sequence);
        out.push((callback, port, buffer));
    }

    fn control_event(
        &mut self,
        control: PortId,
        sequence: u64,
        events: &BufferPool,
        out: &mut Vec<Delivery>,
    ) {
        let Some(callback) = self
            .ports
            .get(control.0 as usize)
            .and_then(|p| p.callback.clone())
        else {
            return;
        };
        if let Some(mut event) = events.acquire() {
            event.set_sequence(sequence);
            out.push((callback, control, event));
        }
    }
}

fn run_worker(shared: Arc<Shared>) {
    debug!(interval = ?shared.config.frame_interval, "virtual platform worker started");
    let mut state = shared.state.lock();
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        shared
            .wake
            .wait_for(&mut state, shared.config.frame_interval);
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        let deliveries = state.produce(&shared.config, &shared.events);
        if deliveries.is_empty() {
            continue;
        }
        MutexGuard::unlocked(&mut state, || {
            for (callback, port, buffer) in deliveries {
                callback(port, buffer);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn collecting_callback() -> (CompletionCallback, mpsc::Receiver<(PortId, usize, u64)>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let callback: CompletionCallback = Arc::new(move |port: PortId, buffer: BufferHeader| {
            let _ = tx.lock().send((port, buffer.len(), buffer.sequence()));
        });
        (callback, rx)
    }

    fn fmt(w: u32, h: u32, encoding: Encoding) -> PortFormat {
        PortFormat::aligned(encoding, Resolution::new(w, h).unwrap())
    }

    /// source -> processor directly, enough to see frames flow.
    fn single_chain(
        platform: &VirtualPlatform,
        port: SourcePort,
    ) -> (PortId, PortId, mpsc::Receiver<(PortId, usize, u64)>) {
        let source = platform.create_stage(StageKind::Source).unwrap();
        platform.select_source(source, 0).unwrap();
        let processor = platform.create_stage(StageKind::Processor).unwrap();
        let src_out = platform
            .port(source, PortDirection::Output, port.output_index())
            .unwrap();
        let proc_in = platform.port(processor, PortDirection::Input, 0).unwrap();
        let proc_out = platform.port(processor, PortDirection::Output, 0).unwrap();
        let upstream = fmt(64, 32, Encoding::I420);
        platform.commit_format(src_out, &upstream).unwrap();
        platform.commit_format(proc_in, &upstream).unwrap();
        platform
            .commit_format(proc_out, &fmt(64, 32, Encoding::RGBA))
            .unwrap();
        let (callback, rx) = collecting_callback();
        platform.enable_port(proc_out, callback).unwrap();
        let conn = platform
            .create_connection(src_out, proc_in, ConnectionMode::Tunnelled)
            .unwrap();
        platform.enable_stage(source).unwrap();
        platform.enable_stage(processor).unwrap();
        platform.enable_connection(conn).unwrap();
        (src_out, proc_out, rx)
    }

    #[test]
    fn commit_rejects_unaligned_and_oversized() {
        let platform = VirtualPlatform::builder().source(640, 480).build();
        let source = platform.create_stage(StageKind::Source).unwrap();
        platform.select_source(source, 0).unwrap();
        let out = platform.port(source, PortDirection::Output, 0).unwrap();
        let mut unaligned = fmt(64, 32, Encoding::I420);
        unaligned.width = 65;
        assert!(matches!(
            platform.commit_format(out, &unaligned),
            Err(PlatformError::FormatRejected { .. })
        ));
        assert!(platform
            .commit_format(out, &fmt(1280, 720, Encoding::I420))
            .is_err());
        let req = platform
            .commit_format(out, &fmt(640, 480, Encoding::I420))
            .unwrap();
        assert_eq!(req.buffer_num, DEFAULT_PORT_BUFFERS);
        assert_eq!(req.buffer_size, 640 * 480 * 3 / 2);
    }

    #[test]
    fn streaming_port_fills_queued_buffers() {
        let platform = VirtualPlatform::builder().source(640, 480).build();
        let (_, proc_out, rx) = single_chain(&platform, SourcePort::Preview);
        let pool = BufferPool::new(2, 64 * 32 * 4);
        platform
            .send_buffer(proc_out, pool.acquire().unwrap())
            .unwrap();
        let (port, len, seq) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(port, proc_out);
        assert_eq!(len, 64 * 32 * 4);
        assert!(seq > 0);
    }

    #[test]
    fn capture_port_waits_for_trigger() {
        let platform = VirtualPlatform::builder()
            .source(640, 480)
            .frame_interval(Duration::from_millis(1))
            .build();
        let (src_out, proc_out, rx) = single_chain(&platform, SourcePort::Capture);
        let pool = BufferPool::new(2, 64 * 32 * 4);
        platform
            .send_buffer(proc_out, pool.acquire().unwrap())
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(30)).is_err());
        platform.trigger_capture(src_out).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        assert!(platform
            .events()
            .contains(&PlatformEvent::CaptureTriggered(src_out)));
    }

    #[test]
    fn managed_connection_requires_enabled_ports() {
        let platform = VirtualPlatform::builder().source(640, 480).build();
        let processor = platform.create_stage(StageKind::Processor).unwrap();
        let presentation = platform.create_stage(StageKind::Presentation).unwrap();
        let out = platform.port(processor, PortDirection::Output, 0).unwrap();
        let input = platform.port(presentation, PortDirection::Input, 0).unwrap();
        let format = fmt(64, 32, Encoding::RGBA);
        platform.commit_format(out, &format).unwrap();
        platform.commit_format(input, &format).unwrap();
        let conn = platform
            .create_connection(out, input, ConnectionMode::Managed)
            .unwrap();
        assert_eq!(
            platform.enable_connection(conn),
            Err(PlatformError::PortDisabled(out))
        );
    }

    #[test]
    fn presentation_releases_previous_frame() {
        let platform = VirtualPlatform::new();
        let presentation = platform.create_stage(StageKind::Presentation).unwrap();
        let input = platform.port(presentation, PortDirection::Input, 0).unwrap();
        platform
            .commit_format(input, &fmt(64, 32, Encoding::RGBA))
            .unwrap();
        platform
            .set_display_region(input, &DisplayRegion::fullscreen(2))
            .unwrap();
        let (callback, rx) = collecting_callback();
        platform.enable_port(input, callback).unwrap();

        let pool = BufferPool::new(2, 16);
        let mut first = pool.acquire().unwrap();
        first.set_len(16);
        first.set_sequence(1);
        platform.send_buffer(input, first).unwrap();
        assert!(rx.try_recv().is_err());
        platform
            .send_buffer(input, pool.acquire().unwrap())
            .unwrap();
        let (_, _, seq) = rx.try_recv().unwrap();
        assert_eq!(seq, 1);
        assert_eq!(platform.displayed().len(), 2);
        assert_eq!(
            platform.port_info(input).unwrap().region,
            Some(DisplayRegion::fullscreen(2))
        );
    }

    #[test]
    fn injected_failure_and_destroy() {
        let platform = VirtualPlatform::builder()
            .source(640, 480)
            .fail_on(FailPoint::CreateStage(StageKind::Splitter))
            .build();
        assert!(matches!(
            platform.create_stage(StageKind::Splitter),
            Err(PlatformError::OutOfResources(_))
        ));
        let stage = platform.create_stage(StageKind::Processor).unwrap();
        platform.destroy_stage(stage).unwrap();
        assert!(platform.live_stages().is_empty());
        assert_eq!(platform.created_stages().len(), 1);
    }

    #[test]
    fn pattern_is_never_zero() {
        assert!((0..1024).all(|s| pattern_byte(s) != 0));
    }
}
