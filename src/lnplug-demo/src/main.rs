use anyhow::{anyhow, Result};
use clap::Parser;
use lnplug::{
    continue_decision, Builder, Call, Envelope, InitOutcome, LogLevel, MethodSpec, OptionSpec, OptionValue,
    Plugin, Rejection, RpcError,
};
use lnplug_core::{init_logging, EngineConfig, LoggingConfig, DEFAULT_MAX_PARALLEL_REQS};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Parser)]
#[command(name = "lnplug-demo", version, about = "Demo plugin for the lnplug engine")]
struct Cli {
    /// Upper bound on concurrently running method handlers
    #[arg(long, default_value_t = DEFAULT_MAX_PARALLEL_REQS)]
    max_parallel_reqs: usize,
    /// Diagnostic level: trace, debug, info, warn or error
    #[arg(long, default_value = "info", value_parser = parse_level)]
    log_level: LogLevel,
    /// Ask the host to disable the plugin at init with this reason
    #[arg(long)]
    disable: Option<String>,
    /// Keep diagnostics on stderr instead of forwarding them to the host
    #[arg(long)]
    no_forward: bool,
}

fn parse_level(raw: &str) -> std::result::Result<LogLevel, String> {
    serde_json::from_value(Value::String(raw.to_ascii_lowercase()))
        .map_err(|_| format!("unknown log level '{raw}'"))
}

#[derive(Debug, Default)]
struct Demo {
    x: AtomicI64,
    counter: AtomicU64,
    foo_3: Mutex<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct Foo1 {
    #[serde(rename = "baz-1")]
    baz_1: String,
}

#[derive(Debug, Deserialize)]
struct OptName {
    opt: String,
}

#[derive(Debug, Default, Deserialize)]
struct ProgressArgs {
    #[serde(default, rename = "with-stages?")]
    with_stages: bool,
}

type DemoPlugin = Plugin<Demo>;

fn positive(value: &OptionValue) -> Result<()> {
    match value.as_i64() {
        Some(n) if n > 0 => Ok(()),
        _ => Err(Rejection::new(format!("option must be positive {value}")).into()),
    }
}

fn option_json(plugin: &DemoPlugin, name: &str) -> Value {
    plugin.option(name).map(|v| v.to_json()).unwrap_or(Value::Null)
}

fn declare_options(builder: Builder<Demo>) -> Builder<Demo> {
    builder
        .option(OptionSpec::string("foo", "foo option"))
        .option(OptionSpec::string("bar", "bar option"))
        .option(OptionSpec::string("foo_deprecated", "deprecated foo option").deprecated())
        .option(OptionSpec::string("foo-no-check-opt", "dynamic string").dynamic())
        .option(OptionSpec::int("foo-int", "dynamic integer").dynamic())
        .option(OptionSpec::bool("foo-bool", "dynamic boolean").dynamic())
        .option(OptionSpec::flag("foo-flag", "dynamic flag").dynamic())
        .option(
            OptionSpec::int("foo-with-check-opt", "must be positive")
                .dynamic()
                .validated_by("positive"),
        )
        .option(
            OptionSpec::string("foo-error-in-check-opt", "its check always fails")
                .dynamic()
                .validate_with(|value| {
                    let len = value.as_str().map(str::len).unwrap_or_default() as i64;
                    len.checked_div(0).map(drop).ok_or_else(|| anyhow!("Divide by zero"))
                }),
        )
        .option(
            OptionSpec::string("foo-wrong-check-opt", "refers to an unknown check")
                .dynamic()
                .validated_by("not-registered"),
        )
        .validator("positive", positive)
}

fn declare_methods(builder: Builder<Demo>) -> Builder<Demo> {
    builder
        .rpcmethod("foo-0", "returns bar", |_, _| async { Ok(json!({"bar": "baz"})) })
        .rpcmethod("foo-1", "echoes baz-1", |_, call: Call| async move {
            let params: Foo1 = call.params()?;
            Ok(json!({"bar-1": params.baz_1}))
        })
        .rpcmethod("foo-2", "returns bar-2", |_, _| async { Ok(json!({"bar-2": "baz-2"})) })
        .rpcmethod("foo-3", "remembers baz-3", |plugin: DemoPlugin, _| async move {
            *plugin.state().foo_3.lock().unwrap_or_else(PoisonError::into_inner) = Some("baz-3".into());
            Ok(json!({}))
        })
        .rpcmethod("foo-4", "returns what foo-3 remembered", |plugin: DemoPlugin, _| async move {
            let stored = plugin.state().foo_3.lock().unwrap_or_else(PoisonError::into_inner).clone();
            Ok(json!({"bar-4": stored}))
        })
        .rpcmethod_with(MethodSpec::new("foo-deprecated", "old foo").deprecated(), |_, _| async {
            Ok(json!({"bar": "baz"}))
        })
        .rpcmethod("get-x-set-at-init", "value set by the init callback", |plugin: DemoPlugin, _| async move {
            Ok(json!({"x": plugin.state().x.load(Ordering::SeqCst)}))
        })
        .rpcmethod("get-plugin-options-values", "foo and bar", |plugin: DemoPlugin, _| async move {
            Ok(json!({"foo": option_json(&plugin, "foo"), "bar": option_json(&plugin, "bar")}))
        })
        .rpcmethod("get-foo_deprecated-value", "foo_deprecated", |plugin: DemoPlugin, _| async move {
            Ok(json!({"foo_deprecated": option_json(&plugin, "foo_deprecated")}))
        })
        .rpcmethod("get-opt-value", "current value of one option", |plugin: DemoPlugin, call: Call| async move {
            let params: OptName = call.params()?;
            Ok(option_json(&plugin, &params.opt))
        })
        .rpcmethod("sleep-and-update-counter", "sleeps one second", |plugin: DemoPlugin, _| async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let counter = plugin.state().counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(json!({"counter": counter}))
        })
}

fn declare_logging(builder: Builder<Demo>) -> Builder<Demo> {
    builder
        .rpcmethod("log-info", "logs at info", |plugin: DemoPlugin, _| async move {
            plugin.log(LogLevel::Info, "logged by 'log-info'").await;
            Ok(json!({}))
        })
        .rpcmethod("log-debug", "logs at debug", |plugin: DemoPlugin, _| async move {
            plugin.log(LogLevel::Debug, "logged by 'log-debug'").await;
            Ok(json!({}))
        })
        .rpcmethod("log-multi-lines", "logs three lines", |plugin: DemoPlugin, _| async move {
            let message = (0..3)
                .map(|i| format!("line {i} - logged by 'log-multi-lines'"))
                .collect::<Vec<_>>()
                .join("\n");
            plugin.log(LogLevel::Info, &message).await;
            Ok(json!({}))
        })
}

fn declare_notifications(builder: Builder<Demo>) -> Builder<Demo> {
    builder
        .notification("topic-0")
        .notification("topic-1")
        .rpcmethod("notify-topic-0", "", |plugin: DemoPlugin, _| async move {
            plugin.notify("topic-0", &json!({"foo-0": "bar-0"})).await;
            Ok(json!({}))
        })
        .rpcmethod("notify-topic-1", "", |plugin: DemoPlugin, _| async move {
            plugin.notify("topic-1", "topic-1 params").await;
            Ok(json!({}))
        })
        .rpcmethod("notify-topic-undeclared-0", "", |plugin: DemoPlugin, _| async move {
            plugin.notify("topic-undeclared-0", "some params").await;
            Ok(json!({}))
        })
        .rpcmethod("notify-topic-1-non-json-writable", "", |plugin: DemoPlugin, _| async move {
            let mut payload = HashMap::new();
            payload.insert((0, 1), "tuple keys");
            plugin.notify("topic-1", &payload).await;
            Ok(json!({}))
        })
        .subscribe("topic-0", log_notification)
        .subscribe("topic-1", log_notification)
        .subscribe("connect", |plugin: DemoPlugin, _| async move {
            plugin.log(LogLevel::Info, "Got a connect notification").await;
            Ok(())
        })
        .subscribe("warning", |plugin: DemoPlugin, envelope: Envelope| async move {
            let when = if envelope.pre_init { "before init" } else { "after init" };
            let message = format!("Got a warning {when}: {}", envelope.payload);
            plugin.log(LogLevel::Info, &message).await;
            Ok(())
        })
        .subscribe("shutdown", |plugin: DemoPlugin, _| async move {
            plugin.log(LogLevel::Info, "demo plugin shutting down itself").await;
            Ok(())
        })
}

async fn log_notification(plugin: DemoPlugin, envelope: Envelope) -> Result<()> {
    let message = format!(
        "Got a {} notification {} from plugin {}",
        envelope.topic,
        envelope.payload,
        envelope.origin.as_deref().unwrap_or("unknown")
    );
    plugin.log(LogLevel::Info, &message).await;
    Ok(())
}

fn declare_progress(builder: Builder<Demo>) -> Builder<Demo> {
    builder
        .rpcmethod("send-message-notifications", "three messages then a result", |_, call: Call| async move {
            for message in ["foo", "bar", "baz"] {
                call.message(message).await?;
            }
            Ok(json!({"foo": "bar"}))
        })
        .rpcmethod("send-progress-notifications", "progress then a result", |_, call: Call| async move {
            let args: ProgressArgs = call.params()?;
            if args.with_stages {
                for stage in 0..3 {
                    for num in 0..2 {
                        call.staged_progress(num, 2, stage, 3).await?;
                    }
                }
            } else {
                for num in 0..3 {
                    call.progress(num, 3).await?;
                }
            }
            Ok(json!({"foo": "bar"}))
        })
        .rpcmethod("wrong-args-in-notify-progress", "progress past its total", |_, call: Call| async move {
            call.progress(3, 3).await?;
            Ok(json!({}))
        })
}

fn declare_errors(builder: Builder<Demo>) -> Builder<Demo> {
    builder
        .rpcmethod("custom-error", "fails with code -100", |_, _| async {
            Err::<Value, _>(RpcError::new(-100, "custom-error").into())
        })
        .rpcmethod("execution-error", "fails while executing", |_, _| async {
            Err::<Value, _>(anyhow!("Divide by zero"))
        })
        .rpcmethod("non-json-writable-in-result", "returns an unserializable map", |_, _| async {
            let mut result = HashMap::new();
            result.insert((0, 1), "tuple keys");
            Ok(result)
        })
}

fn demo_plugin(disable: Option<String>) -> Builder<Demo> {
    let builder = Builder::new(Demo::default());
    let builder = declare_options(builder);
    let builder = declare_methods(builder);
    let builder = declare_logging(builder);
    let builder = declare_notifications(builder);
    let builder = declare_progress(builder);
    declare_errors(builder)
        .hook("peer_connected", |plugin: DemoPlugin, _| async move {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default();
            plugin.log(LogLevel::Info, &format!("timestamp: {nanos}")).await;
            Ok(continue_decision())
        })
        .on_init(move |plugin: DemoPlugin, _| {
            let disable = disable.clone();
            async move {
                plugin.state().x.store(1, Ordering::SeqCst);
                Ok(match disable {
                    Some(reason) => InitOutcome::Disable(reason),
                    None => InitOutcome::Continue,
                })
            }
        })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig {
        max_parallel_reqs: cli.max_parallel_reqs,
        logging: LoggingConfig {
            level: cli.log_level,
            forward_to_host: !cli.no_forward,
            ..LoggingConfig::default()
        },
        ..EngineConfig::default()
    };

    let mut builder = demo_plugin(cli.disable).config(config.clone());
    let sink = config.logging.forward_to_host.then(|| builder.log_sink());
    let _logging = init_logging(&config.logging, sink)?;
    tracing::debug!(max_parallel_reqs = config.max_parallel_reqs, "starting demo plugin");

    builder.run_stdio().await?;
    Ok(())
}
