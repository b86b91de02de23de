//! DroneHub: control plane for ephemeral, per-task development containers.

#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(unreachable_pub)]
#![warn(elided_lifetimes_in_paths)]
#![deny(unused_must_use)]

/// HTTP API: routing, error envelope, preview proxy.
pub mod api;
/// Daemon configuration loading.
pub mod config;
/// Container Adapter: typed operations over the `dvm` CLI.
pub mod engine;
/// Hub-wide error taxonomy with stable machine codes.
pub mod error;
/// The component graph and its lifecycle.
pub mod hub;
/// Lifecycle Orchestrator: drone state machine workflows.
pub mod lifecycle;
/// Data-directory path helpers.
pub mod paths;
/// Prompt Dispatcher: per-chat FIFO delivery and pending tracking.
pub mod prompts;
/// PR Controller: list/merge/close with status gating.
pub mod prs;
/// Drone Registry: durable records and per-drone locks.
pub mod registry;
/// Repo Sync Engine: seed, pull, push, previews, diffs.
pub mod sync;
/// Terminal Stream Hub: offset-addressed session streaming.
pub mod terminal;
