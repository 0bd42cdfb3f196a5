//! Root of the `uicp-core` library.

// Prevent accidental direct writes to stdout/stderr in library code. All
// user-visible output must go through the tracing stack or the host shell.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod adapter;
pub mod backend;
pub mod bridge;
pub mod collector;
pub mod error;
pub mod extract;
pub mod flags;
pub mod harmony;
pub mod linter;
pub mod net;
pub mod orchestrator;
pub mod policy;
pub mod profile;
pub mod sanitize;
pub mod schema;
pub mod stream;
pub mod telemetry;
pub mod tool_spec;
mod util;

pub use adapter::Adapter;
pub use adapter::ApplyOptions;
pub use adapter::ApplyOutcome;
pub use backend::HttpHostBridge;
pub use bridge::HostBridge;
pub use bridge::open_chat_stream;
pub use collector::collect_with_fallback;
pub use error::Result;
pub use error::UicpErr;
pub use extract::extract_events_from_chunk;
pub use net::classify::should_block_host;
pub use net::guard::GuardConfig;
pub use net::guard::NetworkGuard;
pub use net::guard::install_network_guard;
pub use orchestrator::IntentOutcome;
pub use orchestrator::Orchestrator;
pub use policy::Policy;
pub use policy::Presets;
pub use policy::ensure_policy;
pub use policy::runtime::get_effective_policy;
pub use policy::runtime::set_runtime_policy;
pub use sanitize::sanitize_html_strict;
pub use schema::validate_batch;
pub use schema::validate_plan;
pub use stream::StreamEvent;
pub use telemetry::TelemetryBus;
