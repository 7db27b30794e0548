//! Method calls: the concurrency gate, deprecation gating and turning a
//! handler's outcome into exactly one response.

use crate::error::{Cause, RpcError};
use crate::notifications::{self, NotifyError};
use crate::plugin::Plugin;
use crate::protocol::{RequestId, Response, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND};
use crate::transport::MessageWriter;
use futures::future::BoxFuture;
use futures::FutureExt;
use lnplug_core::LogLevel;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;

/// Why a handler produced no result.
#[derive(Debug, Error)]
pub enum CallFailure {
    #[error(transparent)]
    Handler(anyhow::Error),
    #[error("result is not serializable: {0}")]
    Serialize(serde_json::Error),
}

pub type MethodFn<S> =
    Arc<dyn Fn(Plugin<S>, Call) -> BoxFuture<'static, Result<Value, CallFailure>> + Send + Sync>;

pub(crate) fn method_fn<S, F, Fut, R>(handler: F) -> MethodFn<S>
where
    S: Send + Sync + 'static,
    F: Fn(Plugin<S>, Call) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<R>> + Send + 'static,
    R: Serialize,
{
    Arc::new(move |plugin, call| {
        let running = handler(plugin, call);
        async move {
            let result = running.await.map_err(CallFailure::Handler)?;
            serde_json::to_value(result).map_err(CallFailure::Serialize)
        }
        .boxed()
    })
}

/// One in-flight method invocation, handed to the handler.
pub struct Call {
    pub id: RequestId,
    pub method: String,
    pub params: Value,
    writer: MessageWriter,
}

impl Call {
    pub(crate) fn new(id: RequestId, method: String, params: Value, writer: MessageWriter) -> Self {
        Self {
            id,
            method,
            params,
            writer,
        }
    }

    /// Decode the call parameters. Failures reach the caller as `-32602`.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        let params = match &self.params {
            Value::Null => json!({}),
            other => other.clone(),
        };
        serde_json::from_value(params).map_err(|err| {
            RpcError::new(
                INVALID_PARAMS,
                format!("invalid params for '{}': {err}", self.method),
            )
        })
    }

    /// Send a `message` notification tied to this call. Each one is written
    /// before this returns, so the response always follows the messages.
    pub async fn message<P: Serialize + ?Sized>(&self, message: &P) -> Result<(), NotifyError> {
        let message = serde_json::to_value(message).map_err(|source| NotifyError::Serialize {
            topic: "message".into(),
            source,
        })?;
        notifications::send(
            &self.writer,
            "message",
            &json!({"id": self.id, "level": "info", "message": message}),
        )
        .await
    }

    pub async fn progress(&self, num: u64, total: u64) -> Result<(), NotifyError> {
        check_progress(num, total)?;
        notifications::send(
            &self.writer,
            "progress",
            &json!({"id": self.id, "num": num, "total": total}),
        )
        .await
    }

    pub async fn staged_progress(
        &self,
        num: u64,
        total: u64,
        stage: u64,
        stage_total: u64,
    ) -> Result<(), NotifyError> {
        check_progress(num, total)?;
        check_progress(stage, stage_total)?;
        notifications::send(
            &self.writer,
            "progress",
            &json!({
                "id": self.id,
                "num": num,
                "total": total,
                "stage": {"num": stage, "total": stage_total},
            }),
        )
        .await
    }
}

fn check_progress(num: u64, total: u64) -> Result<(), NotifyError> {
    if total == 0 || num >= total {
        return Err(NotifyError::Assertion(format!(
            "progress num {num} must be below total {total}"
        )));
    }
    Ok(())
}

/// Bound method handlers plus the gate limiting how many run at once.
pub struct Dispatcher<S> {
    methods: HashMap<String, MethodFn<S>>,
    gate: Arc<Semaphore>,
}

impl<S: Send + Sync + 'static> Dispatcher<S> {
    pub fn new(methods: HashMap<String, MethodFn<S>>, max_parallel_reqs: usize) -> Self {
        Self {
            methods,
            gate: Arc::new(Semaphore::new(max_parallel_reqs)),
        }
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.methods.keys()
    }

    /// Start one call. The caller never waits on the gate; only the spawned
    /// task does.
    pub async fn dispatch(&self, plugin: Plugin<S>, id: RequestId, method: String, params: Value) {
        let writer = plugin.writer().clone();
        let Some(handler) = self.methods.get(&method).cloned() else {
            let err = RpcError::new(METHOD_NOT_FOUND, format!("Unknown command '{method}'"));
            respond(&writer, &id, Err(err)).await;
            return;
        };

        let deprecated = plugin.manifest().and_then(|m| m.method(&method)).is_some_and(|m| m.deprecated);
        if deprecated && !plugin.options().allow_deprecated() {
            let err = RpcError::new(METHOD_NOT_FOUND, format!("Command \"{method}\" is deprecated"));
            respond(&writer, &id, Err(err)).await;
            return;
        }

        let gate = Arc::clone(&self.gate);
        tokio::spawn(async move {
            let Ok(_permit) = gate.acquire_owned().await else {
                tracing::warn!(%method, "concurrency gate closed, dropping call");
                return;
            };
            let call = Call::new(id.clone(), method.clone(), params.clone(), writer.clone());
            let running = handler(plugin.clone(), call);
            let outcome = match AssertUnwindSafe(running).catch_unwind().await {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(CallFailure::Handler(err))) => match err.downcast::<RpcError>() {
                    Ok(rpc) => {
                        let message = format!("Error while processing {{method: {method}, params: {params}}}: {rpc}");
                        plugin.log(LogLevel::Error, &message).await;
                        Err(rpc)
                    }
                    Err(err) => Err(processing_error(&plugin, &method, &params, Cause::from_error("handler", &err)).await),
                },
                Ok(Err(CallFailure::Serialize(err))) => {
                    let cause = Cause {
                        kind: "serialization",
                        message: err.to_string(),
                        trace: Vec::new(),
                    };
                    Err(processing_error(&plugin, &method, &params, cause).await)
                }
                Err(payload) => {
                    Err(processing_error(&plugin, &method, &params, Cause::from_panic(payload.as_ref())).await)
                }
            };
            respond(&writer, &id, outcome).await;
        });
    }
}

async fn processing_error<S: Send + Sync + 'static>(
    plugin: &Plugin<S>,
    method: &str,
    params: &Value,
    cause: Cause,
) -> RpcError {
    let message = format!("Error while processing {{method: {method}, params: {params}}}: {cause}");
    plugin.log(LogLevel::Error, &message).await;
    RpcError::new(INTERNAL_ERROR, message).with_data(cause.to_data())
}

pub(crate) async fn respond(writer: &MessageWriter, id: &RequestId, outcome: Result<Value, RpcError>) {
    let response = match outcome {
        Ok(result) => Response::result(id, result),
        Err(err) => Response::error(id, err),
    };
    if let Err(err) = writer.write_message(&response).await {
        tracing::error!(%id, error = %err, "failed to write response");
    }
}
