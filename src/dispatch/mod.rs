//! Handler registration and dispatch.
//!
//! Handlers are registered against type names in an explicit table; no
//! reflection. With the prefix rule enabled (the default), a message of type
//! `orders.v2.Created` is routed to the handler registered as `Created`.
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::trace;

use crate::context::DispatchContext;
use crate::{Error, Message, Validation};

/// Handler invoked for a message type. The returned value is the published
/// response used by RPC-style sources.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles one message against its dispatch context.
    async fn handle(
        &self,
        message: &Message,
        ctx: &mut DispatchContext,
    ) -> Result<Option<Value>, Error>;
}

/// Hook running around handler invocation.
#[async_trait]
pub trait DispatchHook: Send + Sync {
    /// Called with the message and its context.
    async fn call(&self, message: &Message, ctx: &mut DispatchContext) -> Result<(), Error>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&Message, &mut DispatchContext) -> Result<Option<Value>, Error> + Send + Sync,
{
    async fn handle(
        &self,
        message: &Message,
        ctx: &mut DispatchContext,
    ) -> Result<Option<Value>, Error> {
        (self.0)(message, ctx)
    }
}

/// Wraps a synchronous closure as a [MessageHandler].
pub fn handler_fn<F>(f: F) -> impl MessageHandler + 'static
where
    F: Fn(&Message, &mut DispatchContext) -> Result<Option<Value>, Error> + Send + Sync + 'static,
{
    FnHandler(f)
}

struct FnHook<F>(F);

#[async_trait]
impl<F> DispatchHook for FnHook<F>
where
    F: Fn(&Message, &mut DispatchContext) -> Result<(), Error> + Send + Sync,
{
    async fn call(&self, message: &Message, ctx: &mut DispatchContext) -> Result<(), Error> {
        (self.0)(message, ctx)
    }
}

/// Wraps a synchronous closure as a [DispatchHook].
pub fn hook_fn<F>(f: F) -> impl DispatchHook + 'static
where
    F: Fn(&Message, &mut DispatchContext) -> Result<(), Error> + Send + Sync + 'static,
{
    FnHook(f)
}

/// Routes messages to registered handlers with optional `before`/`after`
/// hooks and an `invalid` handler for messages failing validation.
pub struct Dispatcher {
    routes: FxHashMap<String, Box<dyn MessageHandler>>,
    before: Option<Box<dyn DispatchHook>>,
    after: Option<Box<dyn DispatchHook>>,
    invalid: Option<Box<dyn MessageHandler>>,
    strip_prefix: bool,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher::new()
    }
}

impl Dispatcher {
    /// An empty dispatcher with the prefix rule enabled.
    pub fn new() -> Self {
        Dispatcher {
            routes: FxHashMap::default(),
            before: None,
            after: None,
            invalid: None,
            strip_prefix: true,
        }
    }

    /// Registers a handler for a type name.
    pub fn on(mut self, type_name: impl Into<String>, handler: impl MessageHandler + 'static) -> Self {
        let _ = self.routes.insert(type_name.into(), Box::new(handler));
        self
    }

    /// Registers a hook invoked before each handler.
    pub fn before(mut self, hook: impl DispatchHook + 'static) -> Self {
        self.before = Some(Box::new(hook));
        self
    }

    /// Registers a hook invoked after each handler.
    pub fn after(mut self, hook: impl DispatchHook + 'static) -> Self {
        self.after = Some(Box::new(hook));
        self
    }

    /// Registers the handler for messages failing validation.
    pub fn invalid(mut self, handler: impl MessageHandler + 'static) -> Self {
        self.invalid = Some(Box::new(handler));
        self
    }

    /// Disables the prefix rule; type names must then match the full tag.
    pub fn match_full_type(mut self) -> Self {
        self.strip_prefix = false;
        self
    }

    /// The name a message type routes by: with the prefix rule, the
    /// substring after the last `.`.
    pub fn route_name<'a>(&self, mtype: &'a str) -> &'a str {
        if self.strip_prefix {
            mtype.rsplit_once('.').map(|(_, name)| name).unwrap_or(mtype)
        } else {
            mtype
        }
    }

    /// Whether a handler is registered for the message's type.
    pub fn can_dispatch(&self, message: &Message) -> bool {
        self.routes.contains_key(self.route_name(&message.mtype))
    }

    /// Dispatches one message: `before`, the type's handler, then `after`.
    ///
    /// A failed validation routes to the `invalid` handler instead, or fails
    /// with [Error::NoInvalidHandler] when none is registered.
    pub async fn dispatch(
        &self,
        message: &Message,
        ctx: &mut DispatchContext,
        validation: &Validation,
    ) -> Result<Option<Value>, Error> {
        if !validation.success {
            return match &self.invalid {
                Some(handler) => {
                    trace!(mtype = message.mtype, "routing to invalid handler");
                    handler.handle(message, ctx).await
                }
                None => Err(Error::NoInvalidHandler(message.mtype.clone())),
            };
        }

        let handler = self
            .routes
            .get(self.route_name(&message.mtype))
            .ok_or_else(|| {
                Error::ProcessingError(format!("no handler for type {}", message.mtype))
            })?;

        if let Some(hook) = &self.before {
            hook.call(message, ctx).await?;
        }
        let value = handler.handle(message, ctx).await?;
        if let Some(hook) = &self.after {
            hook.call(message, ctx).await?;
        }
        Ok(value)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .field("strip_prefix", &self.strip_prefix)
            .finish()
    }
}
