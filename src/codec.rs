//! Per-call translation between raw frames and typed messages.

use crate::message::{AnyMessage, Message};
use crate::pipeline::{
    InboundEvent, OutboundEvent, Stage, StageContext, WriteCompletion, complete,
};

use std::marker::PhantomData;
use tracing::{debug, trace, warn};

/// Decodes request frames into `Req` and encodes `Resp` into response
/// frames. One instance per call, installed by the dispatcher directly in
/// front of the call handler.
///
/// Each frame is self-contained; nothing is buffered between frames.
pub struct ServerCodec<Req, Resp> {
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req: Message, Resp: Message> ServerCodec<Req, Resp> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<Req: Message, Resp: Message> Default for ServerCodec<Req, Resp> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Req: Message, Resp: Message> Stage for ServerCodec<Req, Resp> {
    fn name(&self) -> &'static str {
        "codec"
    }

    fn read(&mut self, ctx: &mut StageContext<'_>, event: InboundEvent) {
        match event {
            InboundEvent::Frame(payload) => {
                let len = payload.len();
                match Req::deserialize(payload) {
                    Ok(request) => {
                        trace!(stream_id = %ctx.stream_id(), len, "decoded request frame");
                        ctx.fire_read(InboundEvent::Message(AnyMessage::new(request)));
                    }
                    Err(e) => {
                        debug!(stream_id = %ctx.stream_id(), len, error = %e, "failed to decode request frame");
                        ctx.fire_error(e);
                    }
                }
            }
            other => ctx.fire_read(other),
        }
    }

    fn write(
        &mut self,
        ctx: &mut StageContext<'_>,
        event: OutboundEvent,
        completion: Option<WriteCompletion>,
    ) {
        match event {
            OutboundEvent::Message(message) => {
                let response = match message.downcast::<Resp>() {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(stream_id = %ctx.stream_id(), error = %e, "response of the wrong type");
                        complete(completion, Err(e));
                        return;
                    }
                };
                match response.serialize() {
                    Ok(frame) => ctx.write(OutboundEvent::Frame(frame), completion),
                    Err(e) => {
                        debug!(stream_id = %ctx.stream_id(), error = %e, "failed to encode response");
                        complete(completion, Err(e));
                    }
                }
            }
            other => ctx.write(other, completion),
        }
    }
}
