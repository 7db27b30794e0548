//! End-to-end tests: the test plays the host daemon over an in-memory pipe.

use lnplug::{
    continue_decision, Builder, Envelope, Error, FeatureBits, HookSpec, InitError, InitOutcome, LogLevel,
    ManifestError, MessageReader, MethodSpec, OptionError, OptionSpec, OptionValue, Plugin, Rejection, RpcError,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Host {
    input: DuplexStream,
    output: MessageReader<DuplexStream>,
    engine: JoinHandle<Result<(), Error>>,
    next_id: u64,
    notifications: Vec<Value>,
}

impl Host {
    fn start<S: Send + Sync + 'static>(builder: Builder<S>) -> Self {
        let (input, plugin_in) = tokio::io::duplex(1 << 20);
        let (plugin_out, output) = tokio::io::duplex(1 << 20);
        Self {
            input,
            output: MessageReader::new(output),
            engine: tokio::spawn(builder.run(plugin_in, plugin_out)),
            next_id: 0,
            notifications: Vec::new(),
        }
    }

    async fn send(&mut self, message: Value) {
        let mut bytes = serde_json::to_vec(&message).unwrap();
        bytes.extend_from_slice(b"\n\n");
        self.input.write_all(&bytes).await.unwrap();
    }

    async fn request(&mut self, method: &str, params: Value) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.send(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await;
        id
    }

    async fn notify(&mut self, topic: &str, params: Value) {
        self.send(json!({"jsonrpc": "2.0", "method": topic, "params": params}))
            .await;
    }

    async fn recv(&mut self) -> Option<Value> {
        self.output.read_message().await.unwrap()
    }

    /// Read up to the response for `id`, keeping notifications seen on the way.
    async fn response(&mut self, id: u64) -> Value {
        loop {
            let message = self.recv().await.expect("plugin closed its output");
            if message.get("id") == Some(&json!(id)) {
                return message;
            }
            assert!(message.get("id").is_none(), "unexpected response {message}");
            self.notifications.push(message);
        }
    }

    async fn call(&mut self, method: &str, params: Value) -> Value {
        let id = self.request(method, params).await;
        self.response(id).await
    }

    async fn result(&mut self, method: &str, params: Value) -> Value {
        let response = self.call(method, params).await;
        assert!(response.get("error").is_none(), "unexpected error {response}");
        response["result"].clone()
    }

    async fn error(&mut self, method: &str, params: Value) -> Value {
        let response = self.call(method, params).await;
        assert!(response.get("result").is_none(), "unexpected result {response}");
        response["error"].clone()
    }

    async fn handshake(&mut self, allow_deprecated: bool, options: Value) -> (Value, Value) {
        let manifest = self
            .result("getmanifest", json!({"allow-deprecated-apis": allow_deprecated}))
            .await;
        let init = self
            .result(
                "init",
                json!({
                    "options": options,
                    "configuration": {
                        "lightning-dir": "/tmp/l1/regtest",
                        "rpc-file": "lightning-rpc",
                        "network": "regtest"
                    }
                }),
            )
            .await;
        (manifest, init)
    }

    /// Params of every notification on `topic` seen so far, oldest first.
    fn seen(&mut self, topic: &str) -> Vec<Value> {
        let (matching, rest) = std::mem::take(&mut self.notifications)
            .into_iter()
            .partition::<Vec<_>, _>(|n| n["method"] == topic);
        self.notifications = rest;
        matching.into_iter().map(|n| n["params"].clone()).collect()
    }

    async fn finish(self) -> Result<(), Error> {
        let Host { input, engine, .. } = self;
        drop(input);
        engine.await.unwrap()
    }
}

fn positive(value: &OptionValue) -> anyhow::Result<()> {
    match value.as_i64() {
        Some(n) if n > 0 => Ok(()),
        _ => Err(Rejection::new(format!("option must be positive {value}")).into()),
    }
}

fn options_plugin() -> Builder<()> {
    Builder::new(())
        .option(OptionSpec::int("foo-int", "an integer").dynamic())
        .option(OptionSpec::bool("foo-bool", "a boolean").dynamic())
        .option(OptionSpec::flag("foo-flag", "a flag").dynamic())
        .option(OptionSpec::int("foo-with-check-opt", "checked").dynamic().validated_by("positive"))
        .option(OptionSpec::string("foo-wrong-check-opt", "unresolved check").dynamic().validated_by("missing"))
        .option(OptionSpec::string("foo-static", "fixed after init").default_value(OptionValue::Str("static".into())))
        .option(OptionSpec::string("foo_deprecated", "old").deprecated())
        .validator("positive", positive)
        .rpcmethod("get-opt-value", "current option values", |plugin: Plugin<()>, _| async move {
            Ok(plugin.configs_json())
        })
}

#[tokio::test]
async fn handshake_reports_manifest_and_inits() {
    let builder = Builder::new(())
        .option(OptionSpec::string("foo", "a string option"))
        .rpcmethod_with(
            MethodSpec::new("foo-0", "returns bar").usage("[arg]"),
            |_, _| async { Ok(json!({"foo": "bar"})) },
        )
        .hook_with(HookSpec::new("peer_connected").after("other-plugin"), |_, _| async {
            Ok(continue_decision())
        })
        .notification("topic-0")
        .subscribe("connect", |_, _| async { Ok(()) })
        .featurebits(FeatureBits {
            node: Some("0200".into()),
            ..FeatureBits::default()
        })
        .on_init(|plugin: Plugin<()>, configuration| async move {
            assert_eq!(configuration.network, "regtest");
            assert_eq!(plugin.option("foo"), Some(OptionValue::Str("FOO".into())));
            Ok(InitOutcome::Continue)
        });
    let mut host = Host::start(builder);

    let (manifest, init) = host.handshake(false, json!({"foo": "FOO"})).await;
    assert_eq!(manifest["options"][0]["name"], "foo");
    assert_eq!(manifest["rpcmethods"][0]["usage"], "[arg]");
    assert_eq!(manifest["hooks"], json!([{"name": "peer_connected", "after": ["other-plugin"]}]));
    assert_eq!(manifest["subscriptions"], json!(["connect"]));
    assert_eq!(manifest["notifications"], json!([{"method": "topic-0"}]));
    assert_eq!(manifest["featurebits"], json!({"node": "0200"}));
    assert_eq!(manifest["dynamic"], true);
    assert_eq!(init, json!({}));

    assert_eq!(host.result("foo-0", json!({})).await, json!({"foo": "bar"}));
    host.finish().await.unwrap();
}

#[tokio::test]
async fn missing_handler_exits_before_replying() {
    let builder = Builder::new(()).declare_rpcmethod(MethodSpec::new("foo", "no handler"));
    let mut host = Host::start(builder);
    host.request("getmanifest", json!({})).await;

    let Host { engine, mut output, input, .. } = host;
    let result = engine.await.unwrap();
    assert!(matches!(
        result,
        Err(Error::Manifest(ManifestError::MissingHandler { ref method })) if method == "foo"
    ));
    let log = output.read_message().await.unwrap().unwrap();
    assert_eq!(log["method"], "log");
    assert_eq!(log["params"]["level"], "broken");
    assert!(log["params"]["message"]
        .as_str()
        .unwrap()
        .starts_with("refusing to answer getmanifest: rpc method 'foo'"));
    assert_eq!(output.read_message().await.unwrap(), None);
    drop(input);
}

#[tokio::test]
async fn queued_log_events_are_flushed_when_the_engine_stops() {
    let mut builder = Builder::new(()).declare_rpcmethod(MethodSpec::new("foo", "no handler"));
    let sink = builder.log_sink();
    assert!(sink.send(LogLevel::Warn, "queued before start"));
    let mut host = Host::start(builder);
    host.request("getmanifest", json!({})).await;

    let Host { engine, mut output, input, .. } = host;
    assert!(engine.await.unwrap().is_err());
    drop(sink);
    let mut messages = Vec::new();
    while let Some(message) = output.read_message().await.unwrap() {
        messages.push(message["params"]["message"].as_str().unwrap().to_string());
    }
    assert_eq!(messages.len(), 2, "{messages:?}");
    assert!(messages.contains(&"queued before start".to_string()));
    assert!(messages.iter().any(|m| m.starts_with("refusing to answer getmanifest")));
    drop(input);
}

#[tokio::test]
async fn log_subscription_without_log_topic_is_fatal() {
    let builder = Builder::new(()).subscribe("log", |_, _| async { Ok(()) });
    let mut host = Host::start(builder);
    host.request("getmanifest", json!({})).await;
    let Host { engine, input, .. } = host;
    assert!(matches!(
        engine.await.unwrap(),
        Err(Error::Manifest(ManifestError::MissingCompanion { .. }))
    ));
    drop(input);
}

#[tokio::test]
async fn requests_before_init_are_invalid() {
    let mut host = Host::start(options_plugin());
    let err = host.error("get-opt-value", json!({})).await;
    assert_eq!(err["code"], -32600);
    host.finish().await.unwrap();
}

#[tokio::test]
async fn disabled_plugin_stays_attached_and_hides_methods() {
    let builder = options_plugin().on_init(|_, _| async { Ok(InitOutcome::disable("no reason")) });
    let mut host = Host::start(builder);
    let (_, init) = host.handshake(false, json!({})).await;
    assert_eq!(init, json!({"disable": "disabled by user: no reason"}));

    let err = host.error("get-opt-value", json!({})).await;
    assert_eq!(err["code"], -32601);
    host.finish().await.unwrap();
}

#[tokio::test]
async fn init_callback_failure_disables_and_exits() {
    let builder = Builder::new(()).on_init(|_, _| async { Err(anyhow::anyhow!("Divide by zero")) });
    let mut host = Host::start(builder);
    let (_, init) = host.handshake(false, json!({})).await;
    let reason = init["disable"].as_str().unwrap();
    assert!(reason.contains("Divide by zero"), "{reason}");
    assert!(reason.contains("type: init"), "{reason}");

    let logged = host.seen("log");
    assert_eq!(logged[0]["level"], "broken");

    let Host { engine, input, .. } = host;
    assert!(matches!(
        engine.await.unwrap(),
        Err(Error::Init(InitError::CallbackFailed(_)))
    ));
    drop(input);
}

#[tokio::test]
async fn strict_options_reject_unknown_names() {
    let mut host = Host::start(options_plugin().strict_options());
    let (_, init) = host.handshake(false, json!({"foo_1": "foo-value"})).await;
    assert_eq!(init["disable"], "Wrong option 'foo_1'");
    assert!(matches!(host.finish().await, Err(Error::Init(InitError::Options(_)))));
}

#[tokio::test]
async fn deprecated_option_needs_allowance() {
    let mut host = Host::start(options_plugin());
    let (_, init) = host.handshake(false, json!({"foo_deprecated": "foo-value"})).await;
    assert!(init["disable"].as_str().unwrap().contains("deprecated option"));
    assert!(host.finish().await.is_err());

    let mut host = Host::start(options_plugin());
    let (_, init) = host.handshake(true, json!({"foo_deprecated": "foo-value"})).await;
    assert_eq!(init, json!({}));
    let configs = host.result("get-opt-value", json!({})).await;
    assert_eq!(configs["configs"]["foo_deprecated"]["value_str"], "foo-value");
    host.finish().await.unwrap();
}

#[tokio::test]
async fn unresolved_validator_is_fatal_at_init() {
    let mut host = Host::start(options_plugin());
    let (_, init) = host.handshake(false, json!({"foo-wrong-check-opt": "x"})).await;
    assert!(init["disable"].as_str().unwrap().contains("must be a function"));
    assert!(matches!(
        host.finish().await,
        Err(Error::Init(InitError::Options(OptionError::ValidatorNotCallable { .. })))
    ));
}

#[tokio::test]
async fn failing_validator_aborts_init_with_its_cause() {
    let builder = Builder::new(()).option(
        OptionSpec::string("foo_5", "checked at init")
            .validate_with(|_| Err(anyhow::anyhow!("Divide by zero"))),
    );
    let mut host = Host::start(builder);
    let (_, init) = host.handshake(false, json!({"foo_5": "foo-value"})).await;
    let reason = init["disable"].as_str().unwrap();
    assert!(reason.starts_with("check of option 'foo_5' failed"), "{reason}");
    assert!(reason.contains("{cause: Divide by zero, type: validator}"), "{reason}");

    match host.finish().await {
        Err(Error::Init(InitError::Options(OptionError::ValidatorFailed { name, value, cause }))) => {
            assert_eq!(name, "foo_5");
            assert_eq!(value, json!("foo-value"));
            assert_eq!(cause.to_data()["type"], "validator");
        }
        other => panic!("expected a validator failure, got {other:?}"),
    }
}

#[tokio::test]
async fn setconfig_updates_dynamic_options() {
    let mut host = Host::start(options_plugin());
    host.handshake(false, json!({"foo-int": 3})).await;

    let reply = host.result("setconfig", json!({"config": "foo-int", "val": -12})).await;
    assert_eq!(reply, json!({"config": {"config": "foo-int", "dynamic": true, "value_int": -12}}));

    let reply = host.result("setconfig", json!({"config": "foo-bool", "val": "false"})).await;
    assert_eq!(reply["config"]["value_bool"], false);

    let reply = host.result("setconfig", json!({"config": "foo-flag"})).await;
    assert_eq!(reply["config"]["set"], true);

    let reply = host.result("setconfig", json!({"config": "foo-with-check-opt", "val": 12})).await;
    assert_eq!(reply["config"]["value_int"], 12);

    let configs = host.result("get-opt-value", json!({})).await;
    assert_eq!(configs["configs"]["foo-int"]["value_int"], -12);
    assert_eq!(configs["configs"]["foo-bool"]["value_bool"], false);
    assert_eq!(configs["configs"]["foo-static"]["value_str"], "static");
    host.finish().await.unwrap();
}

#[tokio::test]
async fn setconfig_failures_keep_the_plugin_running() {
    let mut host = Host::start(options_plugin());
    host.handshake(false, json!({})).await;

    let err = host
        .error("setconfig", json!({"config": "foo-with-check-opt", "val": -1}))
        .await;
    assert_eq!(err["code"], -32602);
    assert!(err["message"].as_str().unwrap().contains("option must be positive -1"));

    let err = host.error("setconfig", json!({"config": "foo-static", "val": "x"})).await;
    assert!(err["message"].as_str().unwrap().contains("not dynamic"));

    let err = host
        .error("setconfig", json!({"config": "foo-wrong-check-opt", "val": "x"}))
        .await;
    assert!(err["message"].as_str().unwrap().contains("must be a function"));

    let err = host.error("setconfig", json!({"config": "foo-int", "val": "twelve"})).await;
    assert!(err["message"].as_str().unwrap().contains("twelve"));

    let configs = host.result("get-opt-value", json!({})).await;
    assert!(configs["configs"].get("foo-with-check-opt").is_none());
    host.finish().await.unwrap();
}

#[tokio::test]
async fn restart_reflects_latest_options() {
    for value in [1, 2] {
        let mut host = Host::start(options_plugin());
        host.handshake(false, json!({"foo-int": value})).await;
        let configs = host.result("get-opt-value", json!({})).await;
        assert_eq!(configs["configs"]["foo-int"]["value_int"], value);
        host.finish().await.unwrap();
    }
}

async fn three_sleeps(max_parallel_reqs: Option<usize>) -> Duration {
    let mut builder = Builder::new(()).rpcmethod("sleep-1", "sleeps one second", |_, _| async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(json!({}))
    });
    if let Some(max) = max_parallel_reqs {
        builder = builder.max_parallel_reqs(max);
    }
    let mut host = Host::start(builder);
    host.handshake(false, json!({})).await;

    let start = tokio::time::Instant::now();
    for _ in 0..3 {
        host.request("sleep-1", json!({})).await;
    }
    let mut answered = 0;
    while answered < 3 {
        let message = host.recv().await.unwrap();
        if message.get("id").is_some() {
            assert!(message.get("result").is_some(), "{message}");
            answered += 1;
        }
    }
    let elapsed = start.elapsed();
    host.finish().await.unwrap();
    elapsed
}

#[tokio::test(start_paused = true)]
async fn one_parallel_request_serializes_calls() {
    assert!(three_sleeps(Some(1)).await >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn two_parallel_requests_overlap() {
    let elapsed = three_sleeps(Some(2)).await;
    assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn default_gate_is_effectively_unbounded() {
    assert!(three_sleeps(None).await < Duration::from_millis(1500));
}

fn deprecated_plugin() -> Builder<()> {
    Builder::new(()).rpcmethod_with(MethodSpec::new("foo-deprecated", "old").deprecated(), |_, _| async {
        Ok(json!({"foo": "bar"}))
    })
}

#[tokio::test]
async fn deprecated_method_is_denied_without_allowance() {
    let mut host = Host::start(deprecated_plugin());
    host.handshake(false, json!({})).await;
    let err = host.error("foo-deprecated", json!({})).await;
    assert_eq!(err["message"], "Command \"foo-deprecated\" is deprecated");
    host.finish().await.unwrap();

    let mut host = Host::start(deprecated_plugin());
    host.handshake(true, json!({})).await;
    assert_eq!(host.result("foo-deprecated", json!({})).await, json!({"foo": "bar"}));
    host.finish().await.unwrap();
}

#[tokio::test]
async fn handler_failures_become_error_objects() {
    let side_effects = Arc::new(AtomicUsize::new(0));
    let builder = Builder::new(Arc::clone(&side_effects))
        .rpcmethod("custom-error", "typed failure", |_, _| async {
            Err::<Value, _>(RpcError::new(-100, "custom-error").into())
        })
        .rpcmethod("execution-error", "untyped failure", |_, _| async {
            Err::<Value, _>(anyhow::anyhow!("Divide by zero"))
        })
        .rpcmethod("panicking", "panics", |_, _| async {
            let zero = std::hint::black_box(0u64);
            Ok(json!(1 / zero))
        })
        .rpcmethod(
            "non-json-writable-in-result",
            "unserializable result",
            |plugin: Plugin<Arc<AtomicUsize>>, _| async move {
                plugin.state().fetch_add(1, Ordering::SeqCst);
                let mut result = HashMap::new();
                result.insert((1, 2), "tuple keys");
                Ok(result)
            },
        );
    let mut host = Host::start(builder);
    host.handshake(false, json!({})).await;

    let err = host.error("custom-error", json!({})).await;
    assert_eq!(err, json!({"code": -100, "message": "custom-error"}));

    let err = host.error("execution-error", json!({"a": 1})).await;
    assert_eq!(err["code"], -32603);
    let message = err["message"].as_str().unwrap();
    assert!(message.starts_with("Error while processing {method: execution-error"), "{message}");
    assert_eq!(err["data"]["cause"], "Divide by zero");
    assert!(host.seen("log").iter().any(|l| l["level"] == "broken"));

    let err = host.error("panicking", json!({})).await;
    assert_eq!(err["data"]["type"], "panic");

    let err = host.error("non-json-writable-in-result", json!({})).await;
    assert_eq!(err["data"]["type"], "serialization");
    assert_eq!(side_effects.load(Ordering::SeqCst), 1);

    assert_eq!(host.error("no-such-method", json!({})).await["code"], -32601);
    host.finish().await.unwrap();
}

#[tokio::test]
async fn messages_and_progress_precede_the_result() {
    let builder = Builder::new(())
        .rpcmethod("send-messages", "three messages", |_, call| async move {
            for i in 0..3 {
                call.message(&format!("message {i}")).await?;
            }
            Ok(json!({"sent": 3}))
        })
        .rpcmethod("send-progress", "plain progress", |_, call| async move {
            for num in 0..3 {
                call.progress(num, 3).await?;
            }
            Ok(json!({}))
        })
        .rpcmethod("send-staged-progress", "staged progress", |_, call| async move {
            for stage in 0..3 {
                for num in 0..2 {
                    call.staged_progress(num, 2, stage, 3).await?;
                }
            }
            Ok(json!({}))
        })
        .rpcmethod("wrong-args-in-notify-progress", "bad progress", |_, call| async move {
            call.progress(5, 5).await?;
            Ok(json!({}))
        });
    let mut host = Host::start(builder);
    host.handshake(false, json!({})).await;

    let id = host.request("send-messages", json!({})).await;
    host.response(id).await;
    let messages: Vec<Value> = host.seen("message").into_iter().map(|m| m["message"].clone()).collect();
    assert_eq!(messages, vec![json!("message 0"), json!("message 1"), json!("message 2")]);

    host.result("send-progress", json!({})).await;
    let progress: Vec<(u64, u64)> = host
        .seen("progress")
        .iter()
        .map(|p| (p["num"].as_u64().unwrap(), p["total"].as_u64().unwrap()))
        .collect();
    assert_eq!(progress, vec![(0, 3), (1, 3), (2, 3)]);

    host.result("send-staged-progress", json!({})).await;
    let staged: Vec<(u64, u64)> = host
        .seen("progress")
        .iter()
        .map(|p| (p["stage"]["num"].as_u64().unwrap(), p["num"].as_u64().unwrap()))
        .collect();
    assert_eq!(staged, vec![(0, 0), (0, 1), (1, 0), (1, 1), (2, 0), (2, 1)]);

    let err = host.error("wrong-args-in-notify-progress", json!({})).await;
    assert!(err["message"].as_str().unwrap().contains("Assert failed"));
    host.finish().await.unwrap();
}

#[tokio::test]
async fn pre_init_notifications_are_delivered_after_init() {
    let (tx, mut rx) = mpsc::unbounded_channel::<(&'static str, Envelope)>();
    let builder = Builder::new(tx)
        .subscribe("warning", |plugin: Plugin<mpsc::UnboundedSender<(&'static str, Envelope)>>, envelope| async move {
            plugin.state().send(("warning", envelope))?;
            Ok(())
        })
        .subscribe("*", |plugin: Plugin<mpsc::UnboundedSender<(&'static str, Envelope)>>, envelope| async move {
            plugin.state().send(("*", envelope))?;
            Ok(())
        });
    let mut host = Host::start(builder);

    host.notify("warning", json!({"warning": {"log": "early"}})).await;
    host.handshake(false, json!({})).await;
    host.notify("custom", json!({"origin": "notify-plugin", "payload": {"n": 1}})).await;
    host.notify("shutdown", json!({})).await;
    host.finish().await.unwrap();

    let mut delivered = Vec::new();
    while let Ok(entry) = rx.try_recv() {
        delivered.push(entry);
    }
    let summary: Vec<(&str, &str, bool)> = delivered
        .iter()
        .map(|(who, e)| (*who, e.topic.as_str(), e.pre_init))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("warning", "warning", true),
            ("*", "warning", true),
            ("*", "custom", false),
            ("*", "shutdown", false),
        ]
    );
    assert_eq!(delivered[2].1.origin.as_deref(), Some("notify-plugin"));
    assert_eq!(delivered[2].1.payload, json!({"n": 1}));
}

#[tokio::test]
async fn shutdown_ends_the_engine() {
    let mut host = Host::start(Builder::new(()));
    host.handshake(false, json!({})).await;
    host.notify("shutdown", json!({})).await;
    let Host { engine, input, .. } = host;
    assert!(engine.await.unwrap().is_ok());
    drop(input);
}

#[tokio::test]
async fn outbound_notifications_and_logs() {
    let builder = Builder::new(())
        .notification("topic-0")
        .rpcmethod("emit", "emits notifications", |plugin: Plugin<()>, _| async move {
            plugin.notify("topic-0", &json!({"n": 0})).await;
            plugin.notify("undeclared", &json!({"n": 1})).await;
            let mut bad = HashMap::new();
            bad.insert((1, 2), 3);
            plugin.notify("topic-0", &bad).await;
            plugin.log(LogLevel::Info, "first line\nsecond line").await;
            Ok(json!({}))
        });
    let mut host = Host::start(builder);
    host.handshake(false, json!({})).await;
    host.result("emit", json!({})).await;

    assert_eq!(host.seen("topic-0"), vec![json!({"n": 0})]);
    assert_eq!(host.seen("undeclared"), vec![json!({"n": 1})]);
    let logs = host.seen("log");
    assert!(logs[0]["message"]
        .as_str()
        .unwrap()
        .starts_with("Error while sending notification {method: topic-0}"));
    assert_eq!(
        logs[1..],
        [
            json!({"level": "info", "message": "first line"}),
            json!({"level": "info", "message": "second line"}),
        ]
    );
    host.finish().await.unwrap();
}

#[tokio::test]
async fn hooks_always_answer() {
    let builder = Builder::new(())
        .hook("peer_connected", |_, params| async move {
            assert_eq!(params["peer"]["id"], "02aa");
            Ok(continue_decision())
        })
        .hook("htlc_accepted", |_, _| async { Err(anyhow::anyhow!("cannot decide")) })
        .hook_with(
            HookSpec::new("invoice_payment").on_failure(json!({"result": "reject"})),
            |_, params: Value| async move {
                let amount = params["amount"].as_u64().expect("amount is required");
                Ok(json!({"result": "continue", "amount": amount}))
            },
        )
        .hook("rpc_command", |_, _| async {
            Err(RpcError::new(-1, "refused on purpose").into())
        });
    let mut host = Host::start(builder);
    host.handshake(false, json!({})).await;

    let decision = host.result("peer_connected", json!({"peer": {"id": "02aa"}})).await;
    assert_eq!(decision, json!({"result": "continue"}));

    let decision = host.result("htlc_accepted", json!({})).await;
    assert_eq!(decision, json!({"result": "continue"}));
    let logs = host.seen("log");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["level"], "broken");
    let message = logs[0]["message"].as_str().unwrap();
    assert!(message.starts_with("Error while handling hook {hook: htlc_accepted}"));
    assert!(message.contains("cannot decide"));

    let decision = host.result("invoice_payment", json!({})).await;
    assert_eq!(decision, json!({"result": "reject"}));
    assert!(host.seen("log")[0]["message"].as_str().unwrap().contains("type: panic"));

    let err = host.error("rpc_command", json!({})).await;
    assert_eq!(err["code"], -1);
    assert_eq!(err["message"], "refused on purpose");
    host.finish().await.unwrap();
}
