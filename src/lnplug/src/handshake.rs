//! The two-phase `getmanifest` → `init` startup.

use crate::error::{Cause, RpcError};
use crate::options::OptionError;
use crate::plugin::Plugin;
use crate::protocol::{Configuration, InitParams, INVALID_REQUEST, METHOD_NOT_FOUND};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AwaitingManifest,
    AwaitingInit,
    Running,
    /// Init succeeded but the plugin asked to be disabled. Still attached,
    /// nothing is dispatched.
    Disabled,
    Terminated,
}

/// Where an inbound request goes given the current state.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Manifest,
    Init,
    SetConfig,
    Call,
    Reject(RpcError),
}

impl State {
    pub fn route(self, method: &str) -> Route {
        match (self, method) {
            (State::AwaitingManifest, "getmanifest") => Route::Manifest,
            (_, "getmanifest") => Route::Reject(RpcError::new(
                INVALID_REQUEST,
                "getmanifest was already answered",
            )),
            (State::AwaitingInit, "init") => Route::Init,
            (State::AwaitingManifest, "init") => Route::Reject(RpcError::new(
                INVALID_REQUEST,
                "init received before getmanifest",
            )),
            (_, "init") => Route::Reject(RpcError::new(INVALID_REQUEST, "init was already received")),
            (State::AwaitingManifest | State::AwaitingInit, _) => Route::Reject(RpcError::new(
                INVALID_REQUEST,
                "plugin is not initialized",
            )),
            (State::Running, "setconfig") => Route::SetConfig,
            (State::Running, _) => Route::Call,
            (State::Disabled | State::Terminated, _) => Route::Reject(RpcError::new(
                METHOD_NOT_FOUND,
                format!("Unknown command '{method}'"),
            )),
        }
    }
}

/// What the init callback decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    Continue,
    Disable(String),
}

impl InitOutcome {
    pub fn disable(reason: impl Into<String>) -> Self {
        InitOutcome::Disable(reason.into())
    }
}

pub type InitFn<S> =
    Arc<dyn Fn(Plugin<S>, Configuration) -> BoxFuture<'static, anyhow::Result<InitOutcome>> + Send + Sync>;

pub(crate) fn init_fn<S, F, Fut>(callback: F) -> InitFn<S>
where
    S: Send + Sync + 'static,
    F: Fn(Plugin<S>, Configuration) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<InitOutcome>> + Send + 'static,
{
    Arc::new(move |plugin, configuration| callback(plugin, configuration).boxed())
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("malformed init params: {0}")]
    MalformedParams(#[from] serde_json::Error),
    #[error("{0}")]
    Options(#[from] OptionError),
    #[error("init callback failed: {0}")]
    CallbackFailed(Cause),
    #[error("init callback panicked: {0}")]
    CallbackPanicked(Cause),
}

/// Apply the init options, then run the user's init callback.
pub(crate) async fn initialize<S: Send + Sync + 'static>(
    plugin: &Plugin<S>,
    callback: Option<&InitFn<S>>,
    params: serde_json::Value,
) -> Result<InitOutcome, InitError> {
    let params: InitParams = if params.is_null() {
        InitParams::default()
    } else {
        serde_json::from_value(params)?
    };

    plugin.options().apply_init(&params.options)?;
    plugin.set_configuration(params.configuration.clone());
    tracing::debug!(
        network = %params.configuration.network,
        lightning_dir = %params.configuration.lightning_dir,
        "options applied"
    );

    let Some(callback) = callback else {
        return Ok(InitOutcome::Continue);
    };
    let running = callback(plugin.clone(), params.configuration);
    match AssertUnwindSafe(running).catch_unwind().await {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(err)) => Err(InitError::CallbackFailed(Cause::from_error("init", &err))),
        Err(payload) => Err(InitError::CallbackPanicked(Cause::from_panic(payload.as_ref()))),
    }
}
