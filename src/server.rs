//! Sans-io gRPC server connection.
//!
//! [`Server`] sits between an HTTP/2 stream layer and the per-stream call
//! pipelines. The caller feeds it stream events (request headers, DATA
//! payloads, resets) and drains the HEADERS and DATA frames it must send
//! back. Nothing here does I/O or owns a thread; call logic running on other
//! threads is picked up whenever the owner calls [`Server::poll`].

use crate::config::ServerConfig;
use crate::dispatcher::{ServiceDispatcher, ServiceRegistry};
use crate::error::Error;
use crate::frame::{self, MessageDecoder};
use crate::metadata::Metadata;
use crate::pipeline::{InboundEvent, Pipeline, RequestHead, ResponsePart, StreamId, Transport};
use crate::status::Status;

use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// A header as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderField {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A frame the HTTP/2 layer must send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Headers {
        stream_id: StreamId,
        headers: Vec<HeaderField>,
        end_stream: bool,
    },
    Data {
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    },
}

impl ServerFrame {
    pub fn stream_id(&self) -> StreamId {
        match self {
            ServerFrame::Headers { stream_id, .. } | ServerFrame::Data { stream_id, .. } => {
                *stream_id
            }
        }
    }
}

/// Renders response parts into frames.
struct Outbound {
    content_type: String,
    frames: VecDeque<ServerFrame>,
    /// Streams whose response headers went out.
    headers_sent: HashSet<StreamId>,
}

impl Outbound {
    fn status_headers(&self) -> Vec<HeaderField> {
        vec![
            HeaderField::new(":status", "200"),
            HeaderField::new("content-type", self.content_type.as_str()),
        ]
    }

    fn forget(&mut self, stream_id: StreamId) {
        self.headers_sent.remove(&stream_id);
        self.frames.retain(|f| f.stream_id() != stream_id);
    }
}

fn to_fields(metadata: &Metadata) -> impl Iterator<Item = HeaderField> + '_ {
    metadata.iter().map(|(k, v)| HeaderField::new(k, v))
}

impl Transport for Outbound {
    fn send(&mut self, stream_id: StreamId, part: ResponsePart) -> Result<(), Error> {
        let frame = match part {
            ResponsePart::Headers(metadata) => {
                if !self.headers_sent.insert(stream_id) {
                    return Err(Error::Protocol("response headers sent twice".into()));
                }
                let mut headers = vec![HeaderField::new(":status", "200")];
                headers.extend(to_fields(&metadata));
                ServerFrame::Headers {
                    stream_id,
                    headers,
                    end_stream: false,
                }
            }
            ResponsePart::Message(payload) => {
                if !self.headers_sent.contains(&stream_id) {
                    return Err(Error::Protocol("response message before headers".into()));
                }
                ServerFrame::Data {
                    stream_id,
                    data: frame::encode_message(&payload),
                    end_stream: false,
                }
            }
            ResponsePart::Trailers(trailers) => {
                // trailers-only responses still need the response preamble
                let mut headers = if self.headers_sent.remove(&stream_id) {
                    Vec::new()
                } else {
                    self.status_headers()
                };
                headers.extend(to_fields(&trailers));
                ServerFrame::Headers {
                    stream_id,
                    headers,
                    end_stream: true,
                }
            }
        };
        trace!(%stream_id, ?frame, "queued frame");
        self.frames.push_back(frame);
        Ok(())
    }
}

/// State of an active stream.
struct StreamState {
    pipeline: Pipeline,
    decoder: MessageDecoder,
}

/// A gRPC server connection.
pub struct Server {
    registry: Arc<ServiceRegistry>,
    max_message_size: usize,
    streams: HashMap<StreamId, StreamState>,
    outbound: Outbound,
}

impl Server {
    /// Create a server with default settings.
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self::with_config(registry, &ServerConfig::default())
    }

    pub fn with_config(registry: Arc<ServiceRegistry>, config: &ServerConfig) -> Self {
        Self {
            registry,
            max_message_size: config.max_message_size,
            streams: HashMap::new(),
            outbound: Outbound {
                content_type: config.content_type.clone(),
                frames: VecDeque::new(),
                headers_sent: HashSet::new(),
            },
        }
    }

    /// Number of streams with a call in progress.
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn is_active(&self, stream_id: StreamId) -> bool {
        self.streams.contains_key(&stream_id)
    }

    /// A HEADERS frame arrived. The first one opens the call; a later one
    /// carries the client's trailers.
    pub fn on_headers(&mut self, stream_id: StreamId, headers: &[HeaderField], end_stream: bool) {
        if self.streams.contains_key(&stream_id) {
            trace!(%stream_id, "request trailers");
            if end_stream {
                self.finish_request(stream_id);
            }
            self.reap(stream_id);
            return;
        }

        let (path, metadata) = parse_request_headers(headers);
        let Some(path) = path else {
            warn!(%stream_id, "request without :path");
            let status = Status::invalid_argument("missing :path");
            if let Err(e) = self
                .outbound
                .send(stream_id, ResponsePart::Trailers(status.to_trailers()))
            {
                debug!(%stream_id, error = %e, "rejection not sent");
            }
            return;
        };

        debug!(%stream_id, %path, "new stream");
        let mut pipeline = Pipeline::new(stream_id);
        let dispatcher = ServiceDispatcher::new(self.registry.clone())
            .with_content_type(self.outbound.content_type.as_str());
        pipeline.add_last(Box::new(dispatcher), &mut self.outbound);
        pipeline.fire_read(
            InboundEvent::Headers(RequestHead::new(path, metadata)),
            &mut self.outbound,
        );

        self.streams.insert(
            stream_id,
            StreamState {
                pipeline,
                decoder: MessageDecoder::new(self.max_message_size),
            },
        );
        if end_stream {
            self.finish_request(stream_id);
        }
        self.reap(stream_id);
    }

    /// A DATA frame arrived.
    pub fn on_data(&mut self, stream_id: StreamId, data: &[u8], end_stream: bool) {
        let Some(state) = self.streams.get_mut(&stream_id) else {
            trace!(%stream_id, len = data.len(), "data for inactive stream");
            return;
        };

        state.decoder.feed(data);
        while !state.pipeline.trailers_sent() {
            match state.decoder.decode() {
                Ok(Some(message)) => {
                    trace!(%stream_id, len = message.len(), "request message");
                    state
                        .pipeline
                        .fire_read(InboundEvent::Frame(message), &mut self.outbound);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(%stream_id, error = %e, "bad request framing");
                    state.pipeline.fire_error(e, &mut self.outbound);
                    break;
                }
            }
        }

        if end_stream {
            self.finish_request(stream_id);
        }
        self.reap(stream_id);
    }

    /// The peer reset the stream.
    pub fn on_reset(&mut self, stream_id: StreamId) {
        if let Some(mut state) = self.streams.remove(&stream_id) {
            debug!(%stream_id, "stream reset");
            state.pipeline.close();
        }
        self.outbound.forget(stream_id);
    }

    /// The connection is going away. Every open call is cancelled; frames
    /// of calls that already completed stay queued.
    pub fn on_goaway(&mut self) {
        let abandoned: Vec<StreamId> = self
            .streams
            .drain()
            .map(|(stream_id, mut state)| {
                debug!(%stream_id, "stream abandoned");
                state.pipeline.close();
                stream_id
            })
            .collect();
        for stream_id in abandoned {
            self.outbound.forget(stream_id);
        }
    }

    /// Run work posted by call logic since the last poll. Returns the number
    /// of tasks executed.
    pub fn poll(&mut self) -> usize {
        let mut taken = 0;
        for state in self.streams.values_mut() {
            taken += state.pipeline.run_pending(&mut self.outbound);
        }
        self.streams.retain(|stream_id, state| {
            if state.pipeline.trailers_sent() {
                trace!(%stream_id, "call complete");
                state.pipeline.close();
                false
            } else {
                true
            }
        });
        taken
    }

    /// Poll, then take every frame ready to send.
    pub fn poll_frames(&mut self) -> Vec<ServerFrame> {
        self.poll();
        self.outbound.frames.drain(..).collect()
    }

    pub fn has_pending_frames(&self) -> bool {
        !self.outbound.frames.is_empty()
    }

    fn finish_request(&mut self, stream_id: StreamId) {
        let Some(state) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if state.pipeline.trailers_sent() {
            return;
        }
        match state.decoder.finish() {
            Ok(()) => state.pipeline.fire_read(InboundEvent::End, &mut self.outbound),
            Err(e) => {
                debug!(%stream_id, error = %e, "request ended mid-message");
                state.pipeline.fire_error(e, &mut self.outbound);
            }
        }
    }

    /// Drop the stream once its trailer is out.
    fn reap(&mut self, stream_id: StreamId) {
        let done = self
            .streams
            .get(&stream_id)
            .is_some_and(|state| state.pipeline.trailers_sent());
        if done && let Some(mut state) = self.streams.remove(&stream_id) {
            trace!(%stream_id, "call complete");
            state.pipeline.close();
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("registry", &self.registry)
            .field("active_streams", &self.streams.len())
            .field("pending_frames", &self.outbound.frames.len())
            .finish()
    }
}

/// Split request headers into the path and the remaining metadata.
/// Pseudo-headers other than `:path` are dropped.
fn parse_request_headers(headers: &[HeaderField]) -> (Option<String>, Metadata) {
    let mut path = None;
    let mut metadata = Metadata::new();

    for h in headers {
        let name = String::from_utf8_lossy(&h.name).to_string();
        let value = String::from_utf8_lossy(&h.value).to_string();

        if name == ":path" {
            path = Some(value);
        } else if !name.starts_with(':') {
            metadata.insert(name, value);
        }
    }

    (path, metadata)
}
