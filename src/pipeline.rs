//! Per-stream stage chain.
//!
//! Every stream owns a [`Pipeline`]: an ordered list of [`Stage`]s that
//! inbound events walk head to tail and outbound writes walk tail to head,
//! ending at the [`Transport`]. A stage never touches the chain directly.
//! It records actions on the short-lived [`StageContext`] it is handed, and
//! the pipeline applies them, in order, before the triggering event
//! returns. That is what makes a routing rewrite (insert codec, insert
//! handler, remove dispatcher) atomic with respect to the next inbound
//! event.
//!
//! Work that originates off the loop (a call handle used from another
//! thread, a status promise settled after async work) is posted to the
//! stream's [`Mailbox`] and only executed when the owner drains it with
//! [`Pipeline::run_pending`].

use crate::error::Error;
use crate::message::AnyMessage;
use crate::metadata::Metadata;
use crate::status::Status;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Transport-level stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u32);

impl StreamId {
    pub fn new(id: u32) -> Self {
        StreamId(id)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a stage within a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageId(u64);

impl StageId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        StageId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Routing headers of a new stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    /// Request path, `/{service}/{method}`.
    pub path: String,
    /// Remaining request headers.
    pub metadata: Metadata,
}

impl RequestHead {
    pub fn new(path: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            path: path.into(),
            metadata,
        }
    }
}

/// Events travelling head to tail.
#[derive(Debug)]
pub enum InboundEvent {
    /// Routing headers, always the first event of a stream.
    Headers(RequestHead),
    /// One raw message frame.
    Frame(Bytes),
    /// One decoded request message.
    Message(AnyMessage),
    /// The client half-closed the stream.
    End,
}

/// Writes travelling tail to head.
#[derive(Debug)]
pub enum OutboundEvent {
    /// Response headers.
    Headers(Metadata),
    /// One typed response message, turned into a frame by the codec.
    Message(AnyMessage),
    /// One raw message frame.
    Frame(Bytes),
    /// The trailer that ends the call.
    Trailers(Metadata),
}

/// What the transport receives for a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePart {
    Headers(Metadata),
    Message(Bytes),
    Trailers(Metadata),
}

/// Completion signal of a single write.
pub type WriteCompletion = Box<dyn FnOnce(Result<(), Error>) + Send>;

pub(crate) fn complete(completion: Option<WriteCompletion>, result: Result<(), Error>) {
    if let Some(completion) = completion {
        completion(result);
    }
}

/// The multiplexing layer underneath the engine.
///
/// It owns length-delimiting and flow control; the engine hands it whole
/// response parts, in order, per stream.
pub trait Transport {
    fn send(&mut self, stream_id: StreamId, part: ResponsePart) -> Result<(), Error>;
}

/// Recording transport, handy for driving a pipeline by hand.
impl Transport for Vec<(StreamId, ResponsePart)> {
    fn send(&mut self, stream_id: StreamId, part: ResponsePart) -> Result<(), Error> {
        self.push((stream_id, part));
        Ok(())
    }
}

/// A processing step in a stream's pipeline.
///
/// Every callback has a pass-through default, so a stage only overrides the
/// directions it cares about.
pub trait Stage {
    /// Short name used in logs and introspection.
    fn name(&self) -> &'static str;

    /// Called once the stage has been linked into the chain.
    fn handler_added(&mut self, _ctx: &mut StageContext<'_>) {}

    fn read(&mut self, ctx: &mut StageContext<'_>, event: InboundEvent) {
        ctx.fire_read(event);
    }

    fn error_caught(&mut self, ctx: &mut StageContext<'_>, error: Error) {
        ctx.fire_error(error);
    }

    fn write(
        &mut self,
        ctx: &mut StageContext<'_>,
        event: OutboundEvent,
        completion: Option<WriteCompletion>,
    ) {
        ctx.write(event, completion);
    }

    /// The status promise registered by this stage settled.
    fn status_settled(&mut self, _ctx: &mut StageContext<'_>, _result: Result<Status, Error>) {}

    /// The stream went away. Nothing written from here reaches the wire.
    fn stream_closed(&mut self, _ctx: &mut StageContext<'_>) {}
}

/// Work posted from outside the loop.
pub(crate) enum Task {
    /// A write issued on behalf of `from`.
    Write {
        from: StageId,
        event: OutboundEvent,
        completion: Option<WriteCompletion>,
    },
    /// A status promise owned by `stage` settled.
    Settled {
        stage: StageId,
        result: Result<Status, Error>,
    },
}

/// Handle for posting work onto a stream's owning loop.
///
/// Cheap to clone and `Send`; posting never runs anything inline.
#[derive(Clone)]
pub struct Mailbox {
    stream_id: StreamId,
    tx: Sender<Task>,
}

impl Mailbox {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub(crate) fn post(&self, task: Task) {
        if let Err(e) = self.tx.send(task) {
            trace!(stream_id = %self.stream_id, "stream gone, dropping task");
            if let Task::Write { completion, .. } = e.into_inner() {
                complete(completion, Err(Error::StreamClosed));
            }
        }
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

enum Action {
    Read(InboundEvent),
    Error(Error),
    Write(OutboundEvent, Option<WriteCompletion>),
    InsertAfter {
        anchor: StageId,
        id: StageId,
        stage: Box<dyn Stage>,
    },
    Remove(StageId),
}

/// Short-lived view of the pipeline handed to a stage callback.
///
/// Everything a stage does through the context is recorded and applied in
/// call order once the callback returns.
pub struct StageContext<'a> {
    stream_id: StreamId,
    id: StageId,
    mailbox: &'a Mailbox,
    actions: Vec<Action>,
}

impl<'a> StageContext<'a> {
    fn new(stream_id: StreamId, id: StageId, mailbox: &'a Mailbox) -> Self {
        Self {
            stream_id,
            id,
            mailbox,
            actions: Vec::new(),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Id of the stage this context belongs to.
    pub fn stage_id(&self) -> StageId {
        self.id
    }

    pub fn mailbox(&self) -> &Mailbox {
        self.mailbox
    }

    /// Pass an inbound event to the next stage.
    pub fn fire_read(&mut self, event: InboundEvent) {
        self.actions.push(Action::Read(event));
    }

    /// Pass an error to the next stage.
    pub fn fire_error(&mut self, error: Error) {
        self.actions.push(Action::Error(error));
    }

    /// Pass a write to the previous stage (or the transport).
    pub fn write(&mut self, event: OutboundEvent, completion: Option<WriteCompletion>) {
        self.actions.push(Action::Write(event, completion));
    }

    /// Link `stage` directly after this one.
    pub fn insert_after_self(&mut self, id: StageId, stage: Box<dyn Stage>) {
        let anchor = self.id;
        self.insert_after(anchor, id, stage);
    }

    /// Link `stage` directly after `anchor`.
    pub fn insert_after(&mut self, anchor: StageId, id: StageId, stage: Box<dyn Stage>) {
        self.actions.push(Action::InsertAfter { anchor, id, stage });
    }

    /// Unlink this stage. It receives nothing afterwards.
    pub fn remove_self(&mut self) {
        self.actions.push(Action::Remove(self.id));
    }

    fn into_actions(self) -> Vec<Action> {
        self.actions
    }
}

struct Entry {
    id: StageId,
    stage: Box<dyn Stage>,
}

enum Hop {
    Stage(StageId),
    /// Past the head (transport) or the tail.
    Edge,
    /// The origin is no longer linked.
    Detached,
}

/// The ordered stage chain of one stream.
pub struct Pipeline {
    stream_id: StreamId,
    stages: Vec<Entry>,
    mailbox: Mailbox,
    tasks: Receiver<Task>,
    trailers_sent: bool,
    closed: bool,
}

impl Pipeline {
    pub fn new(stream_id: StreamId) -> Self {
        let (tx, tasks) = crossbeam_channel::unbounded();
        Self {
            stream_id,
            stages: Vec::new(),
            mailbox: Mailbox { stream_id, tx },
            tasks,
            trailers_sent: false,
            closed: false,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Append a stage at the tail.
    pub fn add_last(&mut self, stage: Box<dyn Stage>, transport: &mut dyn Transport) -> StageId {
        let id = StageId::next();
        self.add_last_with_id(id, stage, transport);
        id
    }

    /// Append a stage that already knows its id, such as a call handler.
    pub fn add_last_with_id(
        &mut self,
        id: StageId,
        stage: Box<dyn Stage>,
        transport: &mut dyn Transport,
    ) {
        self.stages.push(Entry { id, stage });
        self.invoke(id, transport, |stage, ctx| stage.handler_added(ctx));
    }

    /// Names of the linked stages, head first.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|e| e.stage.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Whether a trailer has been handed to the transport.
    pub fn trailers_sent(&self) -> bool {
        self.trailers_sent
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Deliver an inbound event from the transport and run it to completion,
    /// including any work it posted to the mailbox.
    pub fn fire_read(&mut self, event: InboundEvent, transport: &mut dyn Transport) {
        if self.closed {
            warn!(stream_id = %self.stream_id, ?event, "inbound event on closed stream");
            return;
        }
        match self.stages.first().map(|e| e.id) {
            Some(id) => self.invoke(id, transport, |stage, ctx| stage.read(ctx, event)),
            None => debug!(stream_id = %self.stream_id, "inbound event on empty pipeline"),
        }
        self.run_pending(transport);
    }

    /// Deliver a transport-level error to the head stage.
    pub fn fire_error(&mut self, error: Error, transport: &mut dyn Transport) {
        if self.closed {
            return;
        }
        match self.stages.first().map(|e| e.id) {
            Some(id) => self.invoke(id, transport, |stage, ctx| stage.error_caught(ctx, error)),
            None => warn!(stream_id = %self.stream_id, %error, "unhandled stream error"),
        }
        self.run_pending(transport);
    }

    /// Execute work posted to the mailbox. Returns the number of tasks taken.
    pub fn run_pending(&mut self, transport: &mut dyn Transport) -> usize {
        let mut taken = 0;
        while let Ok(task) = self.tasks.try_recv() {
            taken += 1;
            if self.closed {
                discard(self.stream_id, task);
                continue;
            }
            match task {
                Task::Write {
                    from,
                    event,
                    completion,
                } => self.route_write(from, event, completion, transport),
                Task::Settled { stage, result } => {
                    if self.position(stage).is_some() {
                        self.invoke(stage, transport, |s, ctx| s.status_settled(ctx, result));
                    } else {
                        debug!(stream_id = %self.stream_id, "status settled for unlinked stage");
                    }
                }
            }
        }
        taken
    }

    /// Tear the stream down. Stages are told, then released, and any work
    /// still queued is discarded without touching the transport.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        for entry in self.stages.iter_mut() {
            let mut ctx = StageContext::new(self.stream_id, entry.id, &self.mailbox);
            entry.stage.stream_closed(&mut ctx);
            let actions = ctx.into_actions();
            if !actions.is_empty() {
                trace!(
                    stream_id = %self.stream_id,
                    stage = entry.stage.name(),
                    "dropping {} actions issued while closing",
                    actions.len()
                );
            }
        }
        self.stages.clear();

        while let Ok(task) = self.tasks.try_recv() {
            discard(self.stream_id, task);
        }
        debug!(stream_id = %self.stream_id, "pipeline closed");
    }

    fn position(&self, id: StageId) -> Option<usize> {
        self.stages.iter().position(|e| e.id == id)
    }

    fn next_hop(&self, from: StageId) -> Hop {
        match self.position(from) {
            Some(idx) => match self.stages.get(idx + 1) {
                Some(entry) => Hop::Stage(entry.id),
                None => Hop::Edge,
            },
            None => Hop::Detached,
        }
    }

    fn prev_hop(&self, from: StageId) -> Hop {
        match self.position(from) {
            Some(0) => Hop::Edge,
            Some(idx) => Hop::Stage(self.stages[idx - 1].id),
            None => Hop::Detached,
        }
    }

    /// Run one stage callback and apply what it recorded.
    fn invoke<F>(&mut self, id: StageId, transport: &mut dyn Transport, f: F)
    where
        F: FnOnce(&mut dyn Stage, &mut StageContext<'_>),
    {
        let Some(idx) = self.position(id) else {
            warn!(stream_id = %self.stream_id, "event for unlinked stage dropped");
            return;
        };

        let mut ctx = StageContext::new(self.stream_id, id, &self.mailbox);
        f(self.stages[idx].stage.as_mut(), &mut ctx);
        let actions = ctx.into_actions();
        self.apply(id, actions, transport);
    }

    fn apply(&mut self, origin: StageId, actions: Vec<Action>, transport: &mut dyn Transport) {
        for action in actions {
            match action {
                Action::Read(event) => match self.next_hop(origin) {
                    Hop::Stage(id) => self.invoke(id, transport, |s, ctx| s.read(ctx, event)),
                    Hop::Edge => {
                        trace!(stream_id = %self.stream_id, ?event, "inbound event reached the tail");
                    }
                    Hop::Detached => {
                        warn!(stream_id = %self.stream_id, ?event, "inbound event from unlinked stage");
                    }
                },
                Action::Error(error) => match self.next_hop(origin) {
                    Hop::Stage(id) => {
                        self.invoke(id, transport, |s, ctx| s.error_caught(ctx, error))
                    }
                    Hop::Edge | Hop::Detached => {
                        warn!(stream_id = %self.stream_id, %error, "unhandled error reached the tail");
                    }
                },
                Action::Write(event, completion) => {
                    self.route_write(origin, event, completion, transport)
                }
                Action::InsertAfter { anchor, id, stage } => {
                    let Some(idx) = self.position(anchor) else {
                        warn!(stream_id = %self.stream_id, stage = stage.name(), "insert anchor is not linked");
                        continue;
                    };
                    trace!(stream_id = %self.stream_id, stage = stage.name(), "stage added");
                    self.stages.insert(idx + 1, Entry { id, stage });
                    self.invoke(id, transport, |s, ctx| s.handler_added(ctx));
                }
                Action::Remove(id) => {
                    if let Some(idx) = self.position(id) {
                        let entry = self.stages.remove(idx);
                        trace!(stream_id = %self.stream_id, stage = entry.stage.name(), "stage removed");
                    }
                }
            }
        }
    }

    fn route_write(
        &mut self,
        from: StageId,
        event: OutboundEvent,
        completion: Option<WriteCompletion>,
        transport: &mut dyn Transport,
    ) {
        match self.prev_hop(from) {
            Hop::Stage(id) => {
                self.invoke(id, transport, |s, ctx| s.write(ctx, event, completion))
            }
            Hop::Edge => self.transmit(event, completion, transport),
            Hop::Detached => {
                warn!(stream_id = %self.stream_id, ?event, "write from unlinked stage dropped");
                complete(
                    completion,
                    Err(Error::Protocol("write from unlinked stage".into())),
                );
            }
        }
    }

    /// Hand a part to the transport. After a trailer nothing else passes.
    fn transmit(
        &mut self,
        event: OutboundEvent,
        completion: Option<WriteCompletion>,
        transport: &mut dyn Transport,
    ) {
        let part = match event {
            OutboundEvent::Headers(headers) => ResponsePart::Headers(headers),
            OutboundEvent::Frame(frame) => ResponsePart::Message(frame),
            OutboundEvent::Trailers(trailers) => ResponsePart::Trailers(trailers),
            OutboundEvent::Message(message) => {
                warn!(
                    stream_id = %self.stream_id,
                    message_type = message.type_name(),
                    "typed message reached the transport"
                );
                complete(completion, Err(Error::UnexpectedMessageType("Bytes")));
                return;
            }
        };

        if self.trailers_sent {
            warn!(stream_id = %self.stream_id, ?part, "write after trailer dropped");
            complete(completion, Err(Error::CallCompleted));
            return;
        }

        if matches!(part, ResponsePart::Trailers(_)) {
            self.trailers_sent = true;
        }
        let result = transport.send(self.stream_id, part);
        if let Err(e) = &result {
            debug!(stream_id = %self.stream_id, error = %e, "transport rejected write");
        }
        complete(completion, result);
    }
}

fn discard(stream_id: StreamId, task: Task) {
    trace!(%stream_id, "discarding task for closed stream");
    if let Task::Write { completion, .. } = task {
        complete(completion, Err(Error::StreamClosed));
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stream_id", &self.stream_id)
            .field("stages", &self.stage_names())
            .field("trailers_sent", &self.trailers_sent)
            .field("closed", &self.closed)
            .finish()
    }
}
