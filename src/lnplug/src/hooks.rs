//! Hook chain participation.
//!
//! The host calls the next plugin in a chain only after this one answers,
//! so every invocation must produce exactly one response, even on failure.
//! A failed handler is answered with the hook's fallback decision.

use crate::dispatch::respond;
use crate::error::{Cause, RpcError};
use crate::manifest::HookSpec;
use crate::plugin::Plugin;
use crate::protocol::RequestId;
use futures::future::BoxFuture;
use futures::FutureExt;
use lnplug_core::LogLevel;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

pub type HookFn<S> =
    Arc<dyn Fn(Plugin<S>, Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

pub(crate) fn hook_fn<S, F, Fut>(handler: F) -> HookFn<S>
where
    S: Send + Sync + 'static,
    F: Fn(Plugin<S>, Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |plugin, params| handler(plugin, params).boxed())
}

/// The decision that lets the chain move on to the next plugin.
pub fn continue_decision() -> Value {
    json!({"result": "continue"})
}

pub struct HookTable<S> {
    handlers: HashMap<String, HookFn<S>>,
    fallbacks: HashMap<String, Value>,
}

impl<S: Send + Sync + 'static> HookTable<S> {
    pub fn new(handlers: HashMap<String, HookFn<S>>, specs: &[HookSpec]) -> Self {
        let fallbacks = specs
            .iter()
            .map(|spec| (spec.name.clone(), spec.fallback.clone()))
            .collect();
        Self { handlers, fallbacks }
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.handlers.keys()
    }

    /// Run the handler for `hook` outside the concurrency gate. Returns
    /// false when no handler is bound.
    pub fn invoke(&self, plugin: Plugin<S>, id: RequestId, hook: String, params: Value) -> bool {
        let Some(handler) = self.handlers.get(&hook).cloned() else {
            return false;
        };
        let fallback = self.fallbacks.get(&hook).cloned().unwrap_or_else(continue_decision);
        tokio::spawn(async move {
            let running = handler(plugin.clone(), params);
            let failure = match AssertUnwindSafe(running).catch_unwind().await {
                Ok(Ok(decision)) => {
                    respond(plugin.writer(), &id, Ok(decision)).await;
                    return;
                }
                Ok(Err(err)) => match err.downcast::<RpcError>() {
                    Ok(rpc) => {
                        respond(plugin.writer(), &id, Err(rpc)).await;
                        return;
                    }
                    Err(err) => Cause::from_error("hook", &err),
                },
                Err(payload) => Cause::from_panic(payload.as_ref()),
            };
            let message = format!("Error while handling hook {{hook: {hook}}}: {failure}");
            plugin.log(LogLevel::Error, &message).await;
            respond(plugin.writer(), &id, Ok(fallback)).await;
        });
        true
    }
}
