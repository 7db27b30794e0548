//! Plugin-side engine for the JSON-RPC extension protocol spoken by a
//! Lightning node daemon.
//!
//! A plugin declares its options, methods, hooks and notification topics on
//! a [`Builder`], then hands control to [`Builder::run_stdio`]. The engine:
//! - answers `getmanifest` with the validated [`Manifest`]
//! - applies the `init` options and runs the init callback
//! - dispatches method calls, bounded by `max-parallel-reqs`
//! - answers hook calls and `setconfig`
//! - delivers subscribed notifications in receipt order, including those
//!   that arrived before init
//!
//! # Usage
//!
//! ```rust,ignore
//! use lnplug::{Builder, OptionSpec};
//! use serde_json::json;
//!
//! Builder::new(())
//!     .option(OptionSpec::string("greeting", "what to say").dynamic())
//!     .rpcmethod("hello", "say hello", |plugin, _call| async move {
//!         Ok(json!({ "greeting": plugin.option("greeting") }))
//!     })
//!     .run_stdio()
//!     .await?;
//! ```
//!
//! Messages are framed as JSON documents; everything the plugin writes goes
//! through one lock so concurrent handlers never interleave on stdout.

mod dispatch;
mod error;
mod handshake;
mod hooks;
mod manifest;
mod notifications;
pub mod options;
mod plugin;
pub mod protocol;
mod transport;

pub use dispatch::{Call, CallFailure};
pub use error::{Cause, Error, RpcError};
pub use handshake::{InitError, InitOutcome, State};
pub use hooks::continue_decision;
pub use manifest::{FeatureBits, HookSpec, Manifest, ManifestError, MethodSpec, WILDCARD_TOPIC};
pub use notifications::{Envelope, NotifyError, SHUTDOWN_TOPIC};
pub use options::{OptionError, OptionKind, OptionRegistry, OptionSpec, OptionValue, Rejection};
pub use plugin::{Builder, Plugin};
pub use transport::{MessageReader, MessageWriter, TransportError};

pub use lnplug_core::{EngineConfig, LogLevel, LoggingConfig};
