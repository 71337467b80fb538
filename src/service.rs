//! Closure-based service definitions.

use crate::dispatcher::{CallHandlerProvider, DispatchContext};
use crate::handler::{CallHandle, CallHandler, CallKind, ServerCallHandler, StreamEvent};
use crate::message::Message;
use crate::pipeline::RequestHead;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

type HandlerFactory = Box<dyn Fn(&DispatchContext) -> Box<dyn CallHandler> + Send + Sync>;

struct Method {
    kind: CallKind,
    factory: HandlerFactory,
}

/// A named service whose methods are plain closures.
///
/// ```
/// use grpc_engine::{Service, ServiceRegistry, Status, StreamEvent};
///
/// let greeter = Service::new("Greeter")
///     .unary("SayHello", |name: String, call| {
///         let _ = call.respond(format!("Hello {}", name));
///     })
///     .bidirectional("Chat", |call| {
///         move |event: StreamEvent<String>| match event {
///             StreamEvent::Message(line) => {
///                 let _ = call.send_message(line);
///             }
///             StreamEvent::End => {
///                 call.send_status(Status::ok());
///             }
///         }
///     });
///
/// let registry = ServiceRegistry::new().with(greeter).unwrap();
/// assert!(registry.lookup("Greeter").is_some());
/// ```
pub struct Service {
    name: String,
    methods: HashMap<String, Method>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Add a unary method. `f` runs once per call with the single request.
    pub fn unary<Req, Resp, F>(self, method: &str, f: F) -> Self
    where
        Req: Message,
        Resp: Message,
        F: Fn(Req, CallHandle<Resp>) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.add(method, CallKind::Unary, move |ctx| {
            let f = f.clone();
            Box::new(ServerCallHandler::<Req, Resp>::unary(
                ctx,
                move |request, call| f(request, call),
            ))
        })
    }

    /// Add a server-streaming method.
    pub fn server_streaming<Req, Resp, F>(self, method: &str, f: F) -> Self
    where
        Req: Message,
        Resp: Message,
        F: Fn(Req, CallHandle<Resp>) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.add(method, CallKind::ServerStreaming, move |ctx| {
            let f = f.clone();
            Box::new(ServerCallHandler::<Req, Resp>::server_streaming(
                ctx,
                move |request, call| f(request, call),
            ))
        })
    }

    /// Add a client-streaming method. `factory` runs once per call and
    /// returns the observer for that call's request events.
    pub fn client_streaming<Req, Resp, F, O>(self, method: &str, factory: F) -> Self
    where
        Req: Message,
        Resp: Message,
        F: Fn(CallHandle<Resp>) -> O + Send + Sync + 'static,
        O: FnMut(StreamEvent<Req>) + 'static,
    {
        self.add(method, CallKind::ClientStreaming, move |ctx| {
            Box::new(ServerCallHandler::<Req, Resp>::client_streaming(ctx, &factory))
        })
    }

    /// Add a bidirectional-streaming method.
    pub fn bidirectional<Req, Resp, F, O>(self, method: &str, factory: F) -> Self
    where
        Req: Message,
        Resp: Message,
        F: Fn(CallHandle<Resp>) -> O + Send + Sync + 'static,
        O: FnMut(StreamEvent<Req>) + 'static,
    {
        self.add(method, CallKind::Bidirectional, move |ctx| {
            Box::new(ServerCallHandler::<Req, Resp>::bidirectional(ctx, &factory))
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call shape of `method`, if the service has it.
    pub fn method_kind(&self, method: &str) -> Option<CallKind> {
        self.methods.get(method).map(|m| m.kind)
    }

    /// Method names, sorted.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }

    fn add<F>(mut self, method: &str, kind: CallKind, factory: F) -> Self
    where
        F: Fn(&DispatchContext) -> Box<dyn CallHandler> + Send + Sync + 'static,
    {
        let previous = self.methods.insert(
            method.to_string(),
            Method {
                kind,
                factory: Box::new(factory),
            },
        );
        if previous.is_some() {
            warn!(service = %self.name, method, "method defined twice, keeping the last");
        }
        self
    }
}

impl CallHandlerProvider for Service {
    fn service_name(&self) -> &str {
        &self.name
    }

    fn handle_method(
        &self,
        method: &str,
        _head: &RequestHead,
        ctx: &DispatchContext,
    ) -> Option<Box<dyn CallHandler>> {
        self.methods.get(method).map(|m| (m.factory)(ctx))
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &self.method_names())
            .finish()
    }
}
