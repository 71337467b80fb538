//! Per-call state machines.
//!
//! A call handler sits at the tail of a routed stream, right behind its
//! codec. It receives decoded requests in arrival order, drives the hosting
//! call logic and resolves the call's status exactly once. The four gRPC
//! call shapes differ only in how requests reach the logic and how many
//! responses the logic may send; the status-sending part is shared through
//! [`CallCore`].

mod call;
mod handle;

pub use call::CallCore;
pub use handle::CallHandle;

use crate::codec::ServerCodec;
use crate::dispatcher::DispatchContext;
use crate::error::Error;
use crate::message::Message;
use crate::pipeline::{InboundEvent, Stage, StageContext, StageId};
use crate::status::Status;

use std::fmt;
use tracing::{debug, error, trace, warn};

/// One step of a streamed request sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent<T> {
    Message(T),
    /// The client finished sending.
    End,
}

/// The gRPC call shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Unary,
    ClientStreaming,
    ServerStreaming,
    Bidirectional,
}

impl CallKind {
    /// Responses the call logic may send, `None` when unbounded.
    pub fn max_responses(self) -> Option<usize> {
        match self {
            CallKind::Unary | CallKind::ClientStreaming => Some(1),
            CallKind::ServerStreaming | CallKind::Bidirectional => None,
        }
    }

    /// Whether requests are handed to the logic one at a time as they arrive.
    pub fn streams_requests(self) -> bool {
        matches!(self, CallKind::ClientStreaming | CallKind::Bidirectional)
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallKind::Unary => "unary",
            CallKind::ClientStreaming => "client-streaming",
            CallKind::ServerStreaming => "server-streaming",
            CallKind::Bidirectional => "bidirectional",
        };
        write!(f, "{}", name)
    }
}

/// A stage able to serve one call.
///
/// Produced by a [`CallHandlerProvider`](crate::CallHandlerProvider) and
/// installed by the dispatcher together with the codec it asks for.
pub trait CallHandler: Stage {
    /// Id under which the handler must be linked. Its call handle already
    /// addresses the pipeline with it.
    fn stage_id(&self) -> StageId;

    fn kind(&self) -> CallKind;

    /// Codec matching the handler's request and response types.
    fn make_codec(&self) -> Box<dyn Stage>;

    fn into_stage(self: Box<Self>) -> Box<dyn Stage>;
}

type SingleRequestFn<Req, Resp> = Box<dyn FnOnce(Req, CallHandle<Resp>)>;
type EventObserver<Req> = Box<dyn FnMut(StreamEvent<Req>)>;

enum CallLogic<Req, Resp> {
    /// Unary and server-streaming: one buffered request, logic runs at end.
    SingleRequest {
        request: Option<Req>,
        run: Option<SingleRequestFn<Req, Resp>>,
    },
    /// Client-streaming and bidirectional: every event goes to the observer.
    Streaming { observer: EventObserver<Req> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    AwaitingMessages,
    EndReceived,
    Completed,
}

/// Call handler for any of the four call shapes.
pub struct ServerCallHandler<Req, Resp> {
    kind: CallKind,
    state: CallState,
    core: CallCore<Resp>,
    /// Released once the status is resolved.
    logic: Option<CallLogic<Req, Resp>>,
}

impl<Req: Message, Resp: Message> ServerCallHandler<Req, Resp> {
    /// A call taking one request and sending at most one response. `f`
    /// runs once the client has finished sending.
    pub fn unary<F>(ctx: &DispatchContext, f: F) -> Self
    where
        F: FnOnce(Req, CallHandle<Resp>) + 'static,
    {
        Self::single_request(CallKind::Unary, ctx, Box::new(f))
    }

    /// A call taking one request and sending any number of responses.
    pub fn server_streaming<F>(ctx: &DispatchContext, f: F) -> Self
    where
        F: FnOnce(Req, CallHandle<Resp>) + 'static,
    {
        Self::single_request(CallKind::ServerStreaming, ctx, Box::new(f))
    }

    /// A call taking any number of requests and sending at most one
    /// response. `factory` runs immediately and returns the observer fed
    /// with every request event.
    pub fn client_streaming<F, O>(ctx: &DispatchContext, factory: F) -> Self
    where
        F: FnOnce(CallHandle<Resp>) -> O,
        O: FnMut(StreamEvent<Req>) + 'static,
    {
        Self::streaming(CallKind::ClientStreaming, ctx, factory)
    }

    /// A call streaming in both directions.
    pub fn bidirectional<F, O>(ctx: &DispatchContext, factory: F) -> Self
    where
        F: FnOnce(CallHandle<Resp>) -> O,
        O: FnMut(StreamEvent<Req>) + 'static,
    {
        Self::streaming(CallKind::Bidirectional, ctx, factory)
    }

    fn single_request(
        kind: CallKind,
        ctx: &DispatchContext,
        run: SingleRequestFn<Req, Resp>,
    ) -> Self {
        Self {
            kind,
            state: CallState::AwaitingMessages,
            core: CallCore::new(ctx, kind.max_responses()),
            logic: Some(CallLogic::SingleRequest {
                request: None,
                run: Some(run),
            }),
        }
    }

    fn streaming<F, O>(kind: CallKind, ctx: &DispatchContext, factory: F) -> Self
    where
        F: FnOnce(CallHandle<Resp>) -> O,
        O: FnMut(StreamEvent<Req>) + 'static,
    {
        let core = CallCore::new(ctx, kind.max_responses());
        let observer = factory(core.handle().clone());
        Self {
            kind,
            state: CallState::AwaitingMessages,
            core,
            logic: Some(CallLogic::Streaming {
                observer: Box::new(observer),
            }),
        }
    }

    pub fn handle(&self) -> &CallHandle<Resp> {
        self.core.handle()
    }

    fn process_message(&mut self, ctx: &StageContext<'_>, request: Req) {
        match self.logic.as_mut() {
            Some(CallLogic::SingleRequest { request: slot, .. }) => {
                if slot.is_some() {
                    debug!(stream_id = %ctx.stream_id(), kind = %self.kind, "second request message");
                    self.core
                        .fail(Status::internal("too many request messages").into());
                } else {
                    *slot = Some(request);
                }
            }
            Some(CallLogic::Streaming { observer }) => observer(StreamEvent::Message(request)),
            None => {}
        }
    }

    fn end_of_stream(&mut self, ctx: &StageContext<'_>) {
        match self.logic.as_mut() {
            Some(CallLogic::SingleRequest { request, run }) => match request.take() {
                Some(request) => {
                    if let Some(run) = run.take() {
                        run(request, self.core.handle().clone());
                    }
                }
                None => {
                    debug!(stream_id = %ctx.stream_id(), kind = %self.kind, "no request message");
                    self.core
                        .fail(Status::internal("missing request message").into());
                }
            },
            Some(CallLogic::Streaming { observer }) => observer(StreamEvent::End),
            None => {}
        }
    }

    fn release(&mut self) {
        self.state = CallState::Completed;
        self.logic = None;
    }
}

impl<Req: Message, Resp: Message> Stage for ServerCallHandler<Req, Resp> {
    fn name(&self) -> &'static str {
        "call-handler"
    }

    fn handler_added(&mut self, ctx: &mut StageContext<'_>) {
        self.core.install(ctx);
    }

    fn read(&mut self, ctx: &mut StageContext<'_>, event: InboundEvent) {
        if self.state == CallState::Completed || self.core.is_settled() {
            trace!(stream_id = %ctx.stream_id(), ?event, "call resolved, dropping inbound event");
            return;
        }

        match event {
            InboundEvent::Message(message) => {
                if self.state == CallState::EndReceived {
                    warn!(stream_id = %ctx.stream_id(), "request message after end of stream");
                    return;
                }
                match message.downcast::<Req>() {
                    Ok(request) => self.process_message(ctx, request),
                    Err(e) => {
                        error!(stream_id = %ctx.stream_id(), error = %e, "request of the wrong type");
                        self.core.fail(e);
                    }
                }
            }
            InboundEvent::End => {
                if self.state == CallState::EndReceived {
                    warn!(stream_id = %ctx.stream_id(), "duplicate end of stream");
                    return;
                }
                self.state = CallState::EndReceived;
                self.end_of_stream(ctx);
            }
            InboundEvent::Headers(head) => {
                error!(stream_id = %ctx.stream_id(), path = %head.path, "headers reached a routed call");
            }
            InboundEvent::Frame(frame) => {
                error!(stream_id = %ctx.stream_id(), len = frame.len(), "undecoded frame reached the call handler");
            }
        }
    }

    fn error_caught(&mut self, ctx: &mut StageContext<'_>, error: Error) {
        debug!(stream_id = %ctx.stream_id(), %error, "error while processing call");
        self.core.fail(error);
    }

    fn status_settled(&mut self, ctx: &mut StageContext<'_>, result: Result<Status, Error>) {
        self.release();
        self.core.send_trailers(ctx, result);
    }

    fn stream_closed(&mut self, ctx: &mut StageContext<'_>) {
        if self.core.fail(Error::StreamClosed) {
            debug!(stream_id = %ctx.stream_id(), kind = %self.kind, "call cancelled");
        }
        self.release();
    }
}

impl<Req: Message, Resp: Message> CallHandler for ServerCallHandler<Req, Resp> {
    fn stage_id(&self) -> StageId {
        self.core.stage_id()
    }

    fn kind(&self) -> CallKind {
        self.kind
    }

    fn make_codec(&self) -> Box<dyn Stage> {
        Box::new(ServerCodec::<Req, Resp>::new())
    }

    fn into_stage(self: Box<Self>) -> Box<dyn Stage> {
        self
    }
}

impl<Req, Resp> fmt::Debug for ServerCallHandler<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCallHandler")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("stage_id", &self.core.stage_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::AnyMessage;
    use crate::metadata::Metadata;
    use crate::pipeline::{Pipeline, RequestHead, ResponsePart, StreamId};
    use crate::status::Code;
    use bytes::Bytes;
    use std::sync::{Arc, Mutex};

    type Wire = Vec<(StreamId, ResponsePart)>;

    fn install<H: CallHandler + 'static>(pipeline: &mut Pipeline, wire: &mut Wire, handler: H) {
        let id = handler.stage_id();
        pipeline.add_last(handler.make_codec(), wire);
        pipeline.add_last_with_id(id, Box::new(handler).into_stage(), wire);
    }

    fn context(pipeline: &Pipeline, path: &str) -> DispatchContext {
        DispatchContext::new(
            pipeline.mailbox().clone(),
            RequestHead::new(path, Metadata::new()),
        )
    }

    fn frame<T: Message>(message: T) -> InboundEvent {
        InboundEvent::Frame(message.serialize().unwrap())
    }

    fn trailer_status(wire: &Wire) -> Status {
        match wire.last().map(|(_, part)| part) {
            Some(ResponsePart::Trailers(trailers)) => Status::from_trailers(trailers).unwrap(),
            other => panic!("expected trailers, got {:?}", other),
        }
    }

    fn responses<T: Message>(wire: &Wire) -> Vec<T> {
        wire.iter()
            .filter_map(|(_, part)| match part {
                ResponsePart::Message(frame) => Some(T::deserialize(frame.clone()).unwrap()),
                _ => None,
            })
            .collect()
    }

    fn trailer_count(wire: &Wire) -> usize {
        wire.iter()
            .filter(|(_, part)| matches!(part, ResponsePart::Trailers(_)))
            .count()
    }

    #[test]
    fn test_unary_runs_at_end_of_stream() {
        let mut wire = Vec::new();
        let mut pipeline = Pipeline::new(StreamId::new(1));
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        let handler = ServerCallHandler::<String, String>::unary(
            &context(&pipeline, "/Greeter/SayHello"),
            move |name, call| {
                *flag.lock().unwrap() = true;
                call.respond(format!("Hello {}", name)).unwrap();
            },
        );
        install(&mut pipeline, &mut wire, handler);

        pipeline.fire_read(frame("Alice".to_string()), &mut wire);
        assert!(!*ran.lock().unwrap());
        assert!(wire.is_empty());

        pipeline.fire_read(InboundEvent::End, &mut wire);
        assert_eq!(responses::<String>(&wire), vec!["Hello Alice"]);
        assert_eq!(trailer_status(&wire).code(), Code::Ok);
        assert_eq!(trailer_count(&wire), 1);
    }

    #[test]
    fn test_unary_without_request() {
        let mut wire = Vec::new();
        let mut pipeline = Pipeline::new(StreamId::new(1));
        let handler = ServerCallHandler::<String, String>::unary(
            &context(&pipeline, "/Greeter/SayHello"),
            |_, _| panic!("logic must not run"),
        );
        install(&mut pipeline, &mut wire, handler);

        pipeline.fire_read(InboundEvent::End, &mut wire);
        let status = trailer_status(&wire);
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), Some("missing request message"));
    }

    #[test]
    fn test_unary_with_two_requests() {
        let mut wire = Vec::new();
        let mut pipeline = Pipeline::new(StreamId::new(1));
        let handler = ServerCallHandler::<String, String>::unary(
            &context(&pipeline, "/Greeter/SayHello"),
            |_, _| panic!("logic must not run"),
        );
        install(&mut pipeline, &mut wire, handler);

        pipeline.fire_read(frame("Alice".to_string()), &mut wire);
        pipeline.fire_read(frame("Bob".to_string()), &mut wire);
        pipeline.fire_read(InboundEvent::End, &mut wire);

        let status = trailer_status(&wire);
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), Some("too many request messages"));
        assert_eq!(trailer_count(&wire), 1);
    }

    #[test]
    fn test_unary_rejects_second_response() {
        let mut wire = Vec::new();
        let mut pipeline = Pipeline::new(StreamId::new(1));
        let second = Arc::new(Mutex::new(None));
        let slot = second.clone();
        let handler = ServerCallHandler::<String, String>::unary(
            &context(&pipeline, "/Greeter/SayHello"),
            move |name, call| {
                call.send_message(name.clone()).unwrap();
                *slot.lock().unwrap() = Some(call.send_message(name));
                call.send_status(Status::ok());
            },
        );
        install(&mut pipeline, &mut wire, handler);

        pipeline.fire_read(frame("Alice".to_string()), &mut wire);
        pipeline.fire_read(InboundEvent::End, &mut wire);

        assert!(matches!(
            second.lock().unwrap().take(),
            Some(Err(Error::TooManyResponses))
        ));
        assert_eq!(responses::<String>(&wire).len(), 1);
    }

    /// Response that refuses to encode unless `ok` is set.
    struct Fragile {
        ok: bool,
    }

    impl Message for Fragile {
        fn serialize(&self) -> Result<Bytes, Error> {
            if self.ok {
                Ok(Bytes::from_static(b"fine"))
            } else {
                Err(Error::Encode("refused".into()))
            }
        }

        fn deserialize(_payload: Bytes) -> Result<Self, Error> {
            Ok(Fragile { ok: true })
        }
    }

    #[test]
    fn test_encode_failure_fails_only_the_write() {
        let mut wire = Vec::new();
        let mut pipeline = Pipeline::new(StreamId::new(3));
        let results = Arc::new(Mutex::new(Vec::new()));
        let handle = Arc::new(Mutex::new(None));
        let (log, slot) = (results.clone(), handle.clone());
        let handler = ServerCallHandler::<u32, Fragile>::server_streaming(
            &context(&pipeline, "/Fragile/Send"),
            move |_, call| {
                for ok in [true, false] {
                    let log = log.clone();
                    call.send_message_with(Fragile { ok }, move |r| log.lock().unwrap().push(r))
                        .unwrap();
                }
                *slot.lock().unwrap() = Some(call);
            },
        );
        install(&mut pipeline, &mut wire, handler);

        pipeline.fire_read(frame(1u32), &mut wire);
        pipeline.fire_read(InboundEvent::End, &mut wire);

        {
            let results = results.lock().unwrap();
            assert_eq!(results.len(), 2);
            assert!(matches!(results[0], Ok(())));
            assert!(matches!(results[1], Err(Error::Encode(_))));
        }
        let frames = wire
            .iter()
            .filter(|(_, part)| matches!(part, ResponsePart::Message(_)))
            .count();
        assert_eq!(frames, 1);
        assert_eq!(trailer_count(&wire), 0);

        let call = handle.lock().unwrap().take().unwrap();
        assert!(!call.is_completed());
        assert_eq!(call.responses_sent(), 2);

        assert!(call.send_status(Status::not_found("gone")));
        pipeline.run_pending(&mut wire);
        assert_eq!(trailer_status(&wire).code(), Code::NotFound);
        assert_eq!(trailer_count(&wire), 1);
    }

    #[test]
    fn test_server_streaming_sends_many() {
        let mut wire = Vec::new();
        let mut pipeline = Pipeline::new(StreamId::new(3));
        let handler = ServerCallHandler::<u32, u32>::server_streaming(
            &context(&pipeline, "/Counter/CountTo"),
            |n, call| {
                for i in 1..=n {
                    call.send_message(i).unwrap();
                }
                call.send_status(Status::ok());
            },
        );
        install(&mut pipeline, &mut wire, handler);

        pipeline.fire_read(frame(3u32), &mut wire);
        pipeline.fire_read(InboundEvent::End, &mut wire);

        assert_eq!(responses::<u32>(&wire), vec![1, 2, 3]);
        assert_eq!(trailer_status(&wire).code(), Code::Ok);
    }

    #[test]
    fn test_client_streaming_sums() {
        let mut wire = Vec::new();
        let mut pipeline = Pipeline::new(StreamId::new(5));
        let handler = ServerCallHandler::<u32, u32>::client_streaming(
            &context(&pipeline, "/Counter/Sum"),
            |call| {
                let mut sum = 0;
                move |event: StreamEvent<u32>| match event {
                    StreamEvent::Message(n) => sum += n,
                    StreamEvent::End => {
                        let _ = call.respond(sum);
                    }
                }
            },
        );
        install(&mut pipeline, &mut wire, handler);

        for n in [1u32, 2, 3, 4] {
            pipeline.fire_read(frame(n), &mut wire);
        }
        assert!(wire.is_empty());
        pipeline.fire_read(InboundEvent::End, &mut wire);

        assert_eq!(responses::<u32>(&wire), vec![10]);
        assert_eq!(trailer_status(&wire).code(), Code::Ok);
    }

    #[test]
    fn test_bidirectional_interleaves() {
        let mut wire = Vec::new();
        let mut pipeline = Pipeline::new(StreamId::new(7));
        let handler = ServerCallHandler::<u32, u32>::bidirectional(
            &context(&pipeline, "/Echo/Scale"),
            |call| {
                move |event: StreamEvent<u32>| match event {
                    StreamEvent::Message(n) => call.send_message(n * 10).unwrap(),
                    StreamEvent::End => {
                        call.send_status(Status::ok());
                    }
                }
            },
        );
        install(&mut pipeline, &mut wire, handler);

        pipeline.fire_read(frame(1u32), &mut wire);
        assert_eq!(responses::<u32>(&wire), vec![10]);
        pipeline.fire_read(frame(2u32), &mut wire);
        pipeline.fire_read(InboundEvent::End, &mut wire);

        assert_eq!(responses::<u32>(&wire), vec![10, 20]);
        assert_eq!(trailer_status(&wire).code(), Code::Ok);
    }

    #[test]
    fn test_early_status_stops_delivery() {
        let mut wire = Vec::new();
        let mut pipeline = Pipeline::new(StreamId::new(9));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let handler = ServerCallHandler::<u32, u32>::bidirectional(
            &context(&pipeline, "/Echo/Scale"),
            |call| {
                move |event: StreamEvent<u32>| {
                    log.lock().unwrap().push(event);
                    call.send_status(Status::invalid_argument("enough"));
                }
            },
        );
        install(&mut pipeline, &mut wire, handler);

        pipeline.fire_read(frame(1u32), &mut wire);
        pipeline.fire_read(frame(2u32), &mut wire);
        pipeline.fire_read(InboundEvent::End, &mut wire);

        assert_eq!(*seen.lock().unwrap(), vec![StreamEvent::Message(1)]);
        assert_eq!(trailer_status(&wire).code(), Code::InvalidArgument);
        assert_eq!(trailer_count(&wire), 1);
    }

    #[test]
    fn test_status_before_any_request() {
        let mut wire = Vec::new();
        let mut pipeline = Pipeline::new(StreamId::new(9));
        let handler = ServerCallHandler::<u32, u32>::bidirectional(
            &context(&pipeline, "/Echo/Scale"),
            |call| {
                call.send_status(Status::unavailable("draining"));
                |_: StreamEvent<u32>| panic!("no events after status")
            },
        );
        install(&mut pipeline, &mut wire, handler);
        pipeline.run_pending(&mut wire);

        assert_eq!(trailer_status(&wire).code(), Code::Unavailable);
        pipeline.fire_read(frame(1u32), &mut wire);
        assert_eq!(wire.len(), 1);
    }

    #[test]
    fn test_decode_error_is_processing_error() {
        let mut wire = Vec::new();
        let mut pipeline = Pipeline::new(StreamId::new(11));
        let handler = ServerCallHandler::<String, String>::bidirectional(
            &context(&pipeline, "/Echo/Say"),
            |_call| |_: StreamEvent<String>| panic!("corrupt request delivered"),
        );
        install(&mut pipeline, &mut wire, handler);

        pipeline.fire_read(
            InboundEvent::Frame(Bytes::from_static(&[0x0a, 0x01, 0xff])),
            &mut wire,
        );
        assert_eq!(trailer_status(&wire), Status::processing_error());
    }

    #[test]
    fn test_user_failure_is_processing_error() {
        let mut wire = Vec::new();
        let mut pipeline = Pipeline::new(StreamId::new(13));
        let handler = ServerCallHandler::<String, String>::unary(
            &context(&pipeline, "/Greeter/SayHello"),
            |_, call| {
                call.fail(Error::Transport("backend down".into()));
            },
        );
        install(&mut pipeline, &mut wire, handler);

        pipeline.fire_read(frame("Alice".to_string()), &mut wire);
        pipeline.fire_read(InboundEvent::End, &mut wire);
        assert_eq!(trailer_status(&wire), Status::processing_error());
    }

    #[test]
    fn test_wrong_request_type_fails_call() {
        let mut wire = Vec::new();
        let mut pipeline = Pipeline::new(StreamId::new(15));
        let handler = ServerCallHandler::<String, String>::bidirectional(
            &context(&pipeline, "/Echo/Say"),
            |_call| |_: StreamEvent<String>| panic!("wrong type delivered"),
        );
        let id = handler.stage_id();
        pipeline.add_last_with_id(id, Box::new(handler), &mut wire);

        pipeline.fire_read(InboundEvent::Message(AnyMessage::new(1u32)), &mut wire);
        assert_eq!(trailer_status(&wire), Status::processing_error());
    }

    #[test]
    fn test_send_after_status() {
        let mut wire = Vec::new();
        let mut pipeline = Pipeline::new(StreamId::new(17));
        let handle = Arc::new(Mutex::new(None));
        let slot = handle.clone();
        let handler = ServerCallHandler::<u32, u32>::bidirectional(
            &context(&pipeline, "/Echo/Scale"),
            move |call| {
                *slot.lock().unwrap() = Some(call);
                |_: StreamEvent<u32>| {}
            },
        );
        install(&mut pipeline, &mut wire, handler);

        let call = handle.lock().unwrap().take().unwrap();
        assert!(call.send_status(Status::ok()));
        assert!(!call.send_status(Status::internal("late")));
        assert!(matches!(call.send_message(1), Err(Error::CallCompleted)));
        assert!(call.is_completed());

        pipeline.run_pending(&mut wire);
        assert_eq!(wire.len(), 1);
        assert_eq!(trailer_status(&wire).code(), Code::Ok);
    }

    #[test]
    fn test_stream_close_cancels_call() {
        let mut wire = Vec::new();
        let mut pipeline = Pipeline::new(StreamId::new(19));
        let handle = Arc::new(Mutex::new(None));
        let slot = handle.clone();
        let handler = ServerCallHandler::<u32, u32>::bidirectional(
            &context(&pipeline, "/Echo/Scale"),
            move |call| {
                *slot.lock().unwrap() = Some(call);
                |_: StreamEvent<u32>| {}
            },
        );
        install(&mut pipeline, &mut wire, handler);

        let call = handle.lock().unwrap().take().unwrap();
        call.send_message(1).unwrap();
        pipeline.close();

        assert!(call.is_completed());
        assert!(!call.send_status(Status::ok()));
        pipeline.run_pending(&mut wire);
        assert!(wire.is_empty());
    }

    #[test]
    fn test_call_kinds() {
        assert_eq!(CallKind::Unary.max_responses(), Some(1));
        assert_eq!(CallKind::ClientStreaming.max_responses(), Some(1));
        assert_eq!(CallKind::ServerStreaming.max_responses(), None);
        assert_eq!(CallKind::Bidirectional.max_responses(), None);
        assert!(CallKind::Bidirectional.streams_requests());
        assert!(!CallKind::ServerStreaming.streams_requests());
        assert_eq!(CallKind::ClientStreaming.to_string(), "client-streaming");
    }
}
