//! grpc-engine - server-side gRPC call lifecycle without async/await.
//!
//! Every HTTP/2 stream gets its own pipeline of stages. The pipeline starts
//! with a dispatcher that reads the request path and, in one atomic step,
//! replaces itself with a codec and a call handler for the requested method.
//! The handler drives user call logic and guarantees the call ends with
//! exactly one status trailer, written after every response it queued.
//!
//! # Features
//!
//! - Unary, client-streaming, server-streaming and bidirectional calls
//! - Call logic may complete from any thread through a [`CallHandle`]
//! - gRPC message framing (length-prefixed) and status trailers
//! - Sans-io [`Server`] adapter for an HTTP/2 stream layer
//!
//! # Architecture
//!
//! ```text
//! transport -> ServiceDispatcher -> (rewrite) -> ServerCodec -> call handler
//!     ^                                                             |
//!     +---------------- headers, messages, trailer <----------------+
//! ```
//!
//! Message payload encoding is left to the [`Message`] trait, implemented
//! for every `prost` message.

mod codec;
mod dispatcher;
mod error;
mod frame;
mod handler;
mod message;
mod metadata;
mod pipeline;
mod promise;
mod server;
mod service;
mod status;

pub mod config;
pub mod logging;

pub use codec::ServerCodec;
pub use dispatcher::{
    CallHandlerProvider, DispatchContext, GRPC_CONTENT_TYPE, ServiceDispatcher, ServiceRegistry,
    parse_path,
};
pub use error::Error;
pub use frame::{
    DEFAULT_MAX_MESSAGE_SIZE, HEADER_SIZE, MessageDecoder, decode_message, encode_message,
};
pub use handler::{CallCore, CallHandle, CallHandler, CallKind, ServerCallHandler, StreamEvent};
pub use message::{AnyMessage, Message};
pub use metadata::Metadata;
pub use pipeline::{
    InboundEvent, Mailbox, OutboundEvent, Pipeline, RequestHead, ResponsePart, Stage,
    StageContext, StageId, StreamId, Transport, WriteCompletion,
};
pub use promise::StatusPromise;
pub use server::{HeaderField, Server, ServerFrame};
pub use service::Service;
pub use status::{Code, GRPC_MESSAGE, GRPC_STATUS, Status};
