//! Routing of new streams to call handlers.

use crate::error::Error;
use crate::handler::CallHandler;
use crate::metadata::Metadata;
use crate::pipeline::{
    InboundEvent, Mailbox, OutboundEvent, RequestHead, Stage, StageContext, StageId, StreamId,
};
use crate::status::Status;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Default content type of gRPC responses.
pub const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// What a provider gets to build a handler for one call.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    mailbox: Mailbox,
    head: Arc<RequestHead>,
}

impl DispatchContext {
    pub fn new(mailbox: Mailbox, head: RequestHead) -> Self {
        Self {
            mailbox,
            head: Arc::new(head),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.mailbox.stream_id()
    }

    /// Mailbox of the stream the call lives on.
    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub(crate) fn shared_head(&self) -> Arc<RequestHead> {
        self.head.clone()
    }
}

/// Serves the methods of one named service.
pub trait CallHandlerProvider: Send + Sync {
    /// The service name as it appears in request paths.
    fn service_name(&self) -> &str;

    /// Build a handler for `method`, or `None` if the service does not
    /// implement it.
    fn handle_method(
        &self,
        method: &str,
        head: &RequestHead,
        ctx: &DispatchContext,
    ) -> Option<Box<dyn CallHandler>>;
}

/// Service name to provider map, fixed once the server starts.
#[derive(Default)]
pub struct ServiceRegistry {
    providers: HashMap<String, Arc<dyn CallHandlerProvider>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its service name. Names are unique.
    pub fn register<P>(&mut self, provider: P) -> Result<(), Error>
    where
        P: CallHandlerProvider + 'static,
    {
        self.register_shared(Arc::new(provider))
    }

    /// Register a provider that is also held elsewhere.
    pub fn register_shared(&mut self, provider: Arc<dyn CallHandlerProvider>) -> Result<(), Error> {
        let name = provider.service_name().to_string();
        if self.providers.contains_key(&name) {
            return Err(Error::DuplicateService(name));
        }
        debug!(service = %name, "registered service");
        self.providers.insert(name, provider);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<P>(mut self, provider: P) -> Result<Self, Error>
    where
        P: CallHandlerProvider + 'static,
    {
        self.register(provider)?;
        Ok(self)
    }

    pub fn lookup(&self, service: &str) -> Option<&dyn CallHandlerProvider> {
        self.providers.get(service).map(|p| p.as_ref())
    }

    /// Registered service names, sorted.
    pub fn service_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.service_names())
            .finish()
    }
}

/// Split `/{service}/{method}`. Segments past the method are ignored.
pub fn parse_path(path: &str) -> Option<(&str, &str)> {
    let mut segments = path.split('/');
    match (segments.next(), segments.next(), segments.next()) {
        (Some(""), Some(service), Some(method)) => Some((service, method)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchState {
    AwaitingHeaders,
    Rejected,
}

/// First stage of every new stream.
///
/// Waits for the routing headers, then either ends the stream with an
/// `UNIMPLEMENTED` trailer or replaces itself with the call's codec and
/// handler. The replacement happens before the next inbound event is
/// delivered.
pub struct ServiceDispatcher {
    registry: Arc<ServiceRegistry>,
    content_type: String,
    state: DispatchState,
}

impl ServiceDispatcher {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            content_type: GRPC_CONTENT_TYPE.to_string(),
            state: DispatchState::AwaitingHeaders,
        }
    }

    /// Override the content type sent in response headers.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    fn route(&mut self, ctx: &mut StageContext<'_>, head: RequestHead) {
        let dispatch = DispatchContext::new(ctx.mailbox().clone(), head.clone());
        let handler = parse_path(&head.path).and_then(|(service, method)| {
            self.registry
                .lookup(service)?
                .handle_method(method, &head, &dispatch)
        });

        let Some(handler) = handler else {
            debug!(stream_id = %ctx.stream_id(), path = %head.path, "unknown method");
            self.state = DispatchState::Rejected;
            let status = Status::unimplemented(format!("unknown method {}", head.path));
            ctx.write(OutboundEvent::Trailers(status.to_trailers()), None);
            return;
        };

        debug!(
            stream_id = %ctx.stream_id(),
            path = %head.path,
            kind = %handler.kind(),
            "routing call"
        );

        let mut headers = Metadata::new();
        headers.insert("content-type", self.content_type.as_str());
        ctx.write(OutboundEvent::Headers(headers), None);

        let codec_id = StageId::next();
        let handler_id = handler.stage_id();
        ctx.insert_after_self(codec_id, handler.make_codec());
        ctx.insert_after(codec_id, handler_id, handler.into_stage());
        ctx.remove_self();
    }
}

impl Stage for ServiceDispatcher {
    fn name(&self) -> &'static str {
        "dispatcher"
    }

    fn read(&mut self, ctx: &mut StageContext<'_>, event: InboundEvent) {
        match (self.state, event) {
            (DispatchState::AwaitingHeaders, InboundEvent::Headers(head)) => self.route(ctx, head),
            (DispatchState::AwaitingHeaders, event) => {
                error!(
                    stream_id = %ctx.stream_id(),
                    ?event,
                    "request data before routing headers, dropping"
                );
            }
            (DispatchState::Rejected, InboundEvent::Headers(head)) => {
                warn!(stream_id = %ctx.stream_id(), path = %head.path, "headers on a rejected stream");
            }
            (DispatchState::Rejected, event) => {
                debug!(stream_id = %ctx.stream_id(), ?event, "dropping event for unknown method");
            }
        }
    }

    fn error_caught(&mut self, ctx: &mut StageContext<'_>, error: Error) {
        warn!(stream_id = %ctx.stream_id(), %error, "error before routing");
    }
}

impl fmt::Debug for ServiceDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDispatcher")
            .field("registry", &self.registry)
            .field("content_type", &self.content_type)
            .field("state", &self.state)
            .finish()
    }
}
