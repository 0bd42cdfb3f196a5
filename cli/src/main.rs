//! `uicp` — run intents against a local OpenAI-compatible backend and
//! inspect the effective policy.

use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use tracing::info;
use uicp_core::Adapter;
use uicp_core::GuardConfig;
use uicp_core::HttpHostBridge;
use uicp_core::Orchestrator;
use uicp_core::Presets;
use uicp_core::TelemetryBus;
use uicp_core::install_network_guard;
use uicp_core::net::intel::IntelClient;
use uicp_core::net::intel::IntelConfig;
use uicp_core::net::rollout::RolloutConfig;
use uicp_core::net::rollout::RolloutController;
use uicp_core::policy::runtime::get_effective_policy;
use uicp_core::policy::runtime::load_startup_policy;
use uicp_core::policy::runtime::persist_policy;
use uicp_core::policy::runtime::set_runtime_policy;

/// UICP workspace runner.
#[derive(Debug, Parser)]
#[clap(author, version)]
struct Cli {
    /// OpenAI-compatible chat endpoint base.
    #[clap(long, env = "UICP_BASE_URL", default_value = "http://localhost:11434/v1")]
    base_url: String,

    /// Bearer token for the backend, when it wants one.
    #[clap(long, env = "UICP_API_KEY")]
    api_key: Option<String>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run one free-form intent through the planner/actor pipeline.
    Run {
        /// The intent text, e.g. "make a notepad".
        intent: String,

        /// Apply the resulting batch to the in-process workspace and print
        /// the final workspace HTML.
        #[clap(long)]
        apply: bool,
    },

    /// Inspect or change the runtime policy.
    Policy {
        #[clap(subcommand)]
        command: PolicyCommand,
    },
}

#[derive(Debug, clap::Subcommand)]
enum PolicyCommand {
    /// Print the effective policy as JSON.
    Show,
    /// Switch to a preset (`open`, `balanced`, `locked`) and persist it.
    Preset { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    set_runtime_policy(load_startup_policy());

    match cli.command {
        Command::Run { intent, apply } => run_intent(&cli.base_url, cli.api_key, &intent, apply).await,
        Command::Policy { command } => policy_command(command),
    }
}

async fn run_intent(
    base_url: &str,
    api_key: Option<String>,
    intent: &str,
    apply: bool,
) -> Result<()> {
    let bus = TelemetryBus::new();
    bus.subscribe(|event| {
        tracing::debug!(name = event.name, payload = %event.payload, "telemetry");
    });

    let intel_config = IntelConfig::from_flags();
    let intel = intel_config
        .enabled
        .then(|| Arc::new(IntelClient::new(intel_config)));
    let guard = install_network_guard(GuardConfig::from_flags(), intel, bus.clone());
    let _rollout = RolloutController::start(RolloutConfig::from_flags(), Arc::clone(guard.stats()));

    let adapter = Arc::new(tokio::sync::Mutex::new(
        Adapter::new(bus.clone()).with_guard(guard),
    ));
    let bridge = Arc::new(HttpHostBridge::new(base_url, api_key));
    let orchestrator = Orchestrator::new(bridge, bus).with_adapter(Arc::clone(&adapter));

    info!("running intent: {intent}");
    let outcome = orchestrator
        .run_intent(intent, apply, None)
        .await
        .context("intent pipeline failed")?;

    let report = serde_json::json!({
        "traceId": outcome.trace_id,
        "notice": outcome.notice,
        "plan": outcome.plan,
        "batch": outcome.batch,
        "timings": { "planMs": outcome.timings.plan_ms, "actMs": outcome.timings.act_ms },
        "autoApply": outcome.auto_apply,
        "failures": outcome.failures,
        "applyOutcome": outcome.apply_outcome.as_ref().map(|o| serde_json::json!({
            "success": o.success,
            "applied": o.applied,
            "skippedDuplicates": o.skipped_duplicates,
            "deniedByPolicy": o.denied_by_policy,
            "errors": o.errors,
        })),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if apply {
        let adapter = adapter.lock().await;
        println!("{}", adapter.workspace_html());
    }
    Ok(())
}

fn policy_command(command: PolicyCommand) -> Result<()> {
    match command {
        PolicyCommand::Show => {
            let policy = get_effective_policy();
            println!("{}", serde_json::to_string_pretty(policy.as_ref())?);
        }
        PolicyCommand::Preset { name } => {
            let Some(policy) = Presets::by_name(&name) else {
                bail!("unknown preset `{name}` (expected open, balanced, or locked)");
            };
            persist_policy(&policy).context("persisting policy")?;
            set_runtime_policy(policy);
            info!("switched to `{name}` preset");
        }
    }
    Ok(())
}
