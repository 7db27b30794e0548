//! The plugin-facing API: a [`Builder`] collecting declarations and handlers,
//! the [`Plugin`] handle passed to every callback, and the router that runs
//! the handshake and feeds the dispatcher, the hook table and the
//! notification worker.

use crate::dispatch::{method_fn, respond, Call, Dispatcher, MethodFn};
use crate::error::{Error, RpcError};
use crate::handshake::{init_fn, initialize, InitFn, InitOutcome, Route, State};
use crate::hooks::{hook_fn, HookFn, HookTable};
use crate::manifest::{Declarations, FeatureBits, HookSpec, Manifest, MethodSpec};
use crate::notifications::{
    self, subscriber_fn, Delivery, Envelope, PreInitBuffer, SubscriberFn, SubscriptionSet, SHUTDOWN_TOPIC,
};
use crate::options::{ApplyPhase, OptionRegistry, OptionSpec, OptionValue, ValidatorFn};
use crate::protocol::{
    Configuration, GetManifestParams, Incoming, Notification, RequestId, SetConfigParams, INVALID_PARAMS,
    METHOD_NOT_FOUND,
};
use crate::transport::{MessageReader, MessageWriter};
use lnplug_core::{EngineConfig, LogEvent, LogLevel, LogSink};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;

/// Handle to the running plugin. Cheap to clone.
pub struct Plugin<S> {
    inner: Arc<Shared<S>>,
}

impl<S> Clone for Plugin<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Shared<S> {
    state: S,
    options: OptionRegistry,
    manifest: OnceLock<Manifest>,
    configuration: OnceLock<Configuration>,
    writer: MessageWriter,
}

impl<S: Send + Sync + 'static> Plugin<S> {
    /// Application state supplied to [`Builder::new`].
    pub fn state(&self) -> &S {
        &self.inner.state
    }

    /// Current value of `name`, or `None` if it is unset or undeclared.
    pub fn option(&self, name: &str) -> Option<OptionValue> {
        self.inner.options.get(name)
    }

    /// The registry behind [`Plugin::option`], for snapshots and specs.
    pub fn options(&self) -> &OptionRegistry {
        &self.inner.options
    }

    /// Current option values in the `listconfigs` shape.
    pub fn configs_json(&self) -> Value {
        self.inner.options.configs_json()
    }

    /// Host environment, available once `init` was received.
    pub fn configuration(&self) -> Option<&Configuration> {
        self.inner.configuration.get()
    }

    /// What was advertised at `getmanifest`; `None` before that.
    pub fn manifest(&self) -> Option<&Manifest> {
        self.inner.manifest.get()
    }

    pub(crate) fn writer(&self) -> &MessageWriter {
        &self.inner.writer
    }

    pub(crate) fn set_configuration(&self, configuration: Configuration) {
        if self.inner.configuration.set(configuration).is_err() {
            tracing::warn!("configuration was already set, keeping the first one");
        }
    }

    /// Send a notification on `topic`. Failures are logged, never returned.
    pub async fn notify<P: Serialize + ?Sized>(&self, topic: &str, payload: &P) {
        if self.manifest().is_some_and(|m| !m.declares_topic(topic)) {
            tracing::warn!(topic, "topic was not declared, the host will drop this notification");
        }
        if let Err(err) = notifications::send(self.writer(), topic, payload).await {
            let message = format!("Error while sending notification {{method: {topic}}}: {err}");
            self.log(LogLevel::Error, &message).await;
        }
    }

    /// Write a log event to the host, one event per line of `message`.
    pub async fn log(&self, level: LogLevel, message: &str) {
        for event in LogEvent::split(level, message) {
            let note = Notification::new("log", event.to_params());
            if let Err(err) = self.inner.writer.write_message(&note).await {
                tracing::warn!(error = %err, "failed to forward log line to host");
                return;
            }
        }
    }
}

/// Collects the plugin's declarations and handlers, then runs the engine.
pub struct Builder<S> {
    state: S,
    decl: Declarations,
    validators: HashMap<String, ValidatorFn>,
    methods: HashMap<String, MethodFn<S>>,
    hooks: HashMap<String, HookFn<S>>,
    subscribers: Vec<(String, SubscriberFn<S>)>,
    init: Option<InitFn<S>>,
    strict_options: bool,
    config: EngineConfig,
    log_events: Option<UnboundedReceiver<LogEvent>>,
}

impl<S: Send + Sync + 'static> Builder<S> {
    pub fn new(state: S) -> Self {
        Self {
            state,
            decl: Declarations {
                dynamic: true,
                ..Declarations::default()
            },
            validators: HashMap::new(),
            methods: HashMap::new(),
            hooks: HashMap::new(),
            subscribers: Vec::new(),
            init: None,
            strict_options: false,
            config: EngineConfig::default(),
            log_events: None,
        }
    }

    pub fn option(mut self, spec: OptionSpec) -> Self {
        self.decl.options.push(spec);
        self
    }

    /// Register a validator that options can refer to by name.
    pub fn validator<F>(mut self, name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&OptionValue) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.validators.insert(name.into(), Arc::new(check));
        self
    }

    /// Declare a method and bind its handler.
    pub fn rpcmethod<F, Fut, R>(self, name: &str, description: &str, handler: F) -> Self
    where
        F: Fn(Plugin<S>, Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Serialize,
    {
        self.rpcmethod_with(MethodSpec::new(name, description), handler)
    }

    pub fn rpcmethod_with<F, Fut, R>(mut self, spec: MethodSpec, handler: F) -> Self
    where
        F: Fn(Plugin<S>, Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Serialize,
    {
        let name = spec.name.clone();
        self.decl.methods.push(spec);
        self.bind_rpcmethod(name, handler)
    }

    /// Declare a method without binding a handler.
    pub fn declare_rpcmethod(mut self, spec: MethodSpec) -> Self {
        self.decl.methods.push(spec);
        self
    }

    /// Bind a handler without declaring the method.
    pub fn bind_rpcmethod<F, Fut, R>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Plugin<S>, Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Serialize,
    {
        let name = name.into();
        if self.methods.insert(name.clone(), method_fn(handler)).is_some() {
            tracing::warn!(method = %name, "replacing previously bound handler");
        }
        self
    }

    pub fn hook<F, Fut>(self, name: &str, handler: F) -> Self
    where
        F: Fn(Plugin<S>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.hook_with(HookSpec::new(name), handler)
    }

    pub fn hook_with<F, Fut>(mut self, spec: HookSpec, handler: F) -> Self
    where
        F: Fn(Plugin<S>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.hooks.insert(spec.name.clone(), hook_fn(handler));
        self.decl.hooks.push(spec);
        self
    }

    pub fn declare_hook(mut self, spec: HookSpec) -> Self {
        self.decl.hooks.push(spec);
        self
    }

    /// Declare an outbound notification topic.
    pub fn notification(mut self, topic: impl Into<String>) -> Self {
        self.decl.topics.push(topic.into());
        self
    }

    /// Subscribe to an inbound topic, or to every topic with `"*"`.
    pub fn subscribe<F, Fut>(mut self, topic: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Plugin<S>, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let topic = topic.into();
        if !self.decl.subscriptions.contains(&topic) {
            self.decl.subscriptions.push(topic.clone());
        }
        self.subscribers.push((topic, subscriber_fn(handler)));
        self
    }

    pub fn featurebits(mut self, bits: FeatureBits) -> Self {
        self.decl.featurebits = Some(bits);
        self
    }

    /// Whether dynamic options may be changed after init. Defaults to true.
    pub fn dynamic(mut self, dynamic: bool) -> Self {
        self.decl.dynamic = dynamic;
        self
    }

    /// Fail init on option names that were never declared.
    pub fn strict_options(mut self) -> Self {
        self.strict_options = true;
        self
    }

    pub fn on_init<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(Plugin<S>, Configuration) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<InitOutcome>> + Send + 'static,
    {
        self.init = Some(init_fn(callback));
        self
    }

    pub fn max_parallel_reqs(mut self, max: usize) -> Self {
        self.config.max_parallel_reqs = max;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// A sink whose events are forwarded to the host as `log` notifications
    /// while the engine runs. Hand it to `lnplug_core::init_logging`.
    pub fn log_sink(&mut self) -> LogSink {
        let (sink, events) = LogSink::channel();
        self.log_events = Some(events);
        sink
    }

    pub async fn run_stdio(self) -> Result<(), Error> {
        self.run(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve the host until it closes the pipe or sends `shutdown`.
    pub async fn run<R, W>(self, input: R, output: W) -> Result<(), Error>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + 'static,
    {
        self.config.validate()?;
        let Builder {
            state,
            decl,
            validators,
            methods,
            hooks,
            subscribers,
            init,
            strict_options,
            config,
            log_events,
        } = self;

        let writer = MessageWriter::new(output);
        let options = OptionRegistry::new(decl.options.clone(), validators, decl.dynamic, strict_options);
        let plugin = Plugin {
            inner: Arc::new(Shared {
                state,
                options,
                manifest: OnceLock::new(),
                configuration: OnceLock::new(),
                writer: writer.clone(),
            }),
        };
        let forwarder = log_events.map(|events| {
            let (stop, stopped) = oneshot::channel();
            (stop, tokio::spawn(forward_logs(writer, events, stopped)))
        });

        let mut router = Router {
            delivery: Delivery::spawn(plugin.clone(), SubscriptionSet::new(subscribers)),
            dispatcher: Dispatcher::new(methods, config.max_parallel_reqs),
            hooks: HookTable::new(hooks, &decl.hooks),
            pending: PreInitBuffer::new(config.pending_notifications),
            state: State::AwaitingManifest,
            plugin,
            decl,
            init,
        };
        tracing::debug!(max_parallel_reqs = config.max_parallel_reqs, "plugin engine started");
        let result = router.serve(MessageReader::new(input)).await;

        router.delivery.finish().await;
        if let Some((stop, task)) = forwarder {
            let _ = stop.send(());
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "log forwarder ended abnormally");
            }
        }
        result
    }
}

struct Router<S> {
    plugin: Plugin<S>,
    decl: Declarations,
    dispatcher: Dispatcher<S>,
    hooks: HookTable<S>,
    delivery: Delivery,
    pending: PreInitBuffer,
    init: Option<InitFn<S>>,
    state: State,
}

impl<S: Send + Sync + 'static> Router<S> {
    async fn serve<R: AsyncRead + Unpin>(&mut self, mut reader: MessageReader<R>) -> Result<(), Error> {
        while let Some(message) = reader.read_message().await? {
            let incoming = match Incoming::classify(message) {
                Ok(incoming) => incoming,
                Err(err) => {
                    tracing::warn!(error = %err, "ignoring message from host");
                    continue;
                }
            };
            match incoming {
                Incoming::Request { id, method, params } => self.request(id, method, params).await?,
                Incoming::Notification { method, params } => {
                    if !self.notification(method, params) {
                        break;
                    }
                }
            }
        }
        self.state = State::Terminated;
        Ok(())
    }

    async fn request(&mut self, id: RequestId, method: String, params: Value) -> Result<(), Error> {
        match self.state.route(&method) {
            Route::Manifest => self.getmanifest(&id, params).await?,
            Route::Init => self.init(&id, params).await?,
            Route::SetConfig => self.setconfig(&id, params).await,
            Route::Call => self.call(id, method, params).await,
            Route::Reject(err) => respond(self.plugin.writer(), &id, Err(err)).await,
        }
        Ok(())
    }

    async fn getmanifest(&mut self, id: &RequestId, params: Value) -> Result<(), Error> {
        let params: GetManifestParams = decode_or_default(params);
        self.plugin.options().set_allow_deprecated(params.allow_deprecated_apis);

        let bound_methods: HashSet<String> = self.dispatcher.names().cloned().collect();
        let bound_hooks: HashSet<String> = self.hooks.names().cloned().collect();
        let manifest = match Manifest::build(&self.decl, &bound_methods, &bound_hooks) {
            Ok(manifest) => manifest,
            Err(err) => {
                let message = format!("refusing to answer getmanifest: {err}");
                self.plugin.log(LogLevel::Error, &message).await;
                return Err(err.into());
            }
        };

        let reply = manifest.to_json();
        if self.plugin.inner.manifest.set(manifest).is_err() {
            tracing::warn!("manifest was already built");
        }
        respond(self.plugin.writer(), id, Ok(reply)).await;
        self.state = State::AwaitingInit;
        Ok(())
    }

    async fn init(&mut self, id: &RequestId, params: Value) -> Result<(), Error> {
        let writer = self.plugin.writer().clone();
        match initialize(&self.plugin, self.init.as_ref(), params).await {
            Ok(InitOutcome::Continue) => {
                respond(&writer, id, Ok(json!({}))).await;
                self.state = State::Running;
                if !self.pending.is_empty() {
                    tracing::debug!(count = self.pending.len(), "delivering notifications received before init");
                }
                for envelope in self.pending.drain() {
                    self.delivery.deliver(envelope);
                }
                Ok(())
            }
            Ok(InitOutcome::Disable(reason)) => {
                tracing::info!(%reason, "plugin disabled itself at init");
                let reply = json!({"disable": format!("disabled by user: {reason}")});
                respond(&writer, id, Ok(reply)).await;
                self.state = State::Disabled;
                self.pending.drain().for_each(drop);
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                self.plugin.log(LogLevel::Error, &message).await;
                respond(&writer, id, Ok(json!({"disable": message}))).await;
                self.state = State::Terminated;
                Err(err.into())
            }
        }
    }

    async fn setconfig(&self, id: &RequestId, params: Value) {
        let writer = self.plugin.writer();
        let params: SetConfigParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(err) => {
                let err = RpcError::new(INVALID_PARAMS, format!("malformed setconfig params: {err}"));
                respond(writer, id, Err(err)).await;
                return;
            }
        };

        let outcome = match self
            .plugin
            .options()
            .apply(&params.config, params.val.as_ref(), ApplyPhase::Live)
        {
            Ok(value) => {
                let (key, wire) = value.config_entry();
                let mut config = Map::new();
                config.insert("config".into(), Value::String(params.config));
                config.insert("dynamic".into(), Value::Bool(true));
                config.insert(key.into(), wire);
                Ok(json!({ "config": config }))
            }
            Err(err) => {
                self.plugin.log(LogLevel::Error, &err.to_string()).await;
                Err(err.to_rpc_error())
            }
        };
        respond(writer, id, outcome).await;
    }

    async fn call(&self, id: RequestId, method: String, params: Value) {
        if self.dispatcher.contains(&method) {
            self.dispatcher.dispatch(self.plugin.clone(), id, method, params).await;
        } else if !self.hooks.invoke(self.plugin.clone(), id.clone(), method.clone(), params) {
            let err = RpcError::new(METHOD_NOT_FOUND, format!("Unknown command '{method}'"));
            respond(self.plugin.writer(), &id, Err(err)).await;
        }
    }

    /// Returns false once the host asked the plugin to shut down.
    fn notification(&mut self, topic: String, params: Value) -> bool {
        let shutdown = topic == SHUTDOWN_TOPIC;
        match self.state {
            State::AwaitingManifest | State::AwaitingInit => {
                self.pending.push(Envelope::new(topic, params, true));
            }
            State::Running if self.plugin.manifest().is_some_and(|m| m.is_subscribed(&topic)) => {
                self.delivery.deliver(Envelope::new(topic, params, false));
            }
            State::Running => tracing::debug!(%topic, "no subscriber for notification"),
            State::Disabled | State::Terminated => {
                tracing::debug!(%topic, "plugin is not running, ignoring notification");
            }
        }
        if shutdown {
            tracing::info!("host requested shutdown");
        }
        !shutdown
    }
}

fn decode_or_default<T: DeserializeOwned + Default>(params: Value) -> T {
    if params.is_null() {
        return T::default();
    }
    serde_json::from_value(params).unwrap_or_else(|err| {
        tracing::warn!(error = %err, "malformed params, using defaults");
        T::default()
    })
}

/// Forward queued log events until the engine stops, then flush whatever
/// is still queued so the host sees the last words of a failing plugin.
async fn forward_logs(
    writer: MessageWriter,
    mut events: UnboundedReceiver<LogEvent>,
    mut stopped: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if !forward_log(&writer, event).await {
                        return;
                    }
                }
                None => return,
            },
            _ = &mut stopped => break,
        }
    }
    while let Ok(event) = events.try_recv() {
        if !forward_log(&writer, event).await {
            return;
        }
    }
}

async fn forward_log(writer: &MessageWriter, event: LogEvent) -> bool {
    let note = Notification::new("log", event.to_params());
    writer.write_message(&note).await.is_ok()
}
