use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conclave_agent::{Agent, AgentRole};
use conclave_channels::OutgoingMessage;
use conclave_core::config::ConclaveConfig;
use conclave_core::error::ConclaveError;
use conclave_core::event::EventBus;
use conclave_core::handler::Handler;
use conclave_core::traits::{EventSink, StateProvider};
use conclave_core::types::{DataMap, SystemId};
use conclave_core::MemoryStateStore;
use conclave_orchestrator::{
    Orchestrator, StateSync, SystemStateAdapter, TaskPriority, TaskSpec, TaskStatus,
};

#[derive(Parser)]
#[command(name = "conclave", version, about = "Multi-agent task orchestration runtime")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the built-in build pipeline with one agent per role
    Run {
        /// Feature description handed to the planner
        #[arg(trailing_var_arg = true)]
        feature: Vec<String>,
    },
    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("conclave=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => {
            info!(path = %path.display(), "Loading config");
            ConclaveConfig::load(path)?
        }
        None => {
            let local = PathBuf::from("conclave.toml");
            if local.exists() {
                ConclaveConfig::load(&local)?
            } else {
                ConclaveConfig::default()
            }
        }
    };

    match cli.command {
        Some(Commands::Config) => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Some(Commands::Run { feature }) => {
            let feature = feature.join(" ");
            run_pipeline(config, &feature).await?;
        }
        None => run_pipeline(config, "todo list with sync").await?,
    }

    Ok(())
}

/// One agent per role; each stage records what it received.
fn stage(role: AgentRole) -> Handler {
    Handler::from_fn(move |_cancel, inputs: DataMap| async move {
        let mut out = DataMap::new();
        out.insert(
            format!("{}_done", role),
            serde_json::json!({ "received": inputs.len() }),
        );
        Ok::<_, ConclaveError>(out)
    })
}

async fn run_pipeline(config: ConclaveConfig, feature: &str) -> anyhow::Result<()> {
    let bus = Arc::new(EventBus::new(config.events.capacity));
    let sink: Arc<dyn EventSink> = bus.clone();
    let store = Arc::new(MemoryStateStore::new());
    let state: Arc<dyn StateProvider> = store.clone();
    let sync = StateSync::start(sink.clone(), state.clone());

    let orchestrator = Orchestrator::new(config.clone(), Some(sink.clone()));

    for role in AgentRole::ALL {
        let agent = Arc::new(
            Agent::new(format!("{}-1", role), role, stage(role)).with_event_sink(sink.clone()),
        );
        orchestrator.register_agent(agent)?;
    }

    let plan = orchestrator.create_task(
        TaskSpec::new("plan", AgentRole::Planner)
            .with_description(feature)
            .with_priority(TaskPriority::High)
            .with_inputs(DataMap::from([(
                "feature".to_string(),
                serde_json::json!(feature),
            )])),
    )?;
    let ui = orchestrator
        .create_task(TaskSpec::new("build ui", AgentRole::UiBuilder).depends_on(&plan.id))?;
    let api = orchestrator
        .create_task(TaskSpec::new("build api", AgentRole::ApiBuilder).depends_on(&plan.id))?;
    let verify = orchestrator.create_task(
        TaskSpec::new("verify", AgentRole::Verifier)
            .depends_on(&ui.id)
            .depends_on(&api.id),
    )?;

    let wait = config.orchestrator.default_task_timeout() * 2;
    let done = orchestrator.wait_for_task(&verify.id, wait).await?;
    if done.status != TaskStatus::Completed {
        warn!(status = %done.status, error = ?done.error, "Pipeline did not complete");
    }

    for task in orchestrator.list_tasks() {
        println!(
            "{:<10} {:<12} {:<10} {}ms",
            task.name,
            task.agent_role,
            task.status,
            task.elapsed_ms().unwrap_or_default()
        );
    }

    // Ask the verifier directly over a channel.
    let comm = orchestrator.communication();
    let planner = orchestrator.get_agents_by_role(AgentRole::Planner);
    let verifier = orchestrator.get_agents_by_role(AgentRole::Verifier);
    if let (Some(planner), Some(verifier)) = (planner.first(), verifier.first()) {
        let channel = comm.create_channel(planner.id(), verifier.id(), "review")?;
        let request = OutgoingMessage::new(&channel.id, planner.id(), verifier.id(), "review")
            .with_content(DataMap::from([(
                "feature".to_string(),
                serde_json::json!(feature),
            )]));
        match comm.send_and_wait(request, Some(Duration::from_secs(5))).await {
            Ok(reply) => println!("review reply: {}", serde_json::to_string(&reply.content)?),
            Err(ConclaveError::ReplyTimeout { .. }) => warn!("Verifier did not reply in time"),
            Err(e) => return Err(e.into()),
        }
    }

    let summary = SystemStateAdapter::new(state, SystemId::from("main"))
        .snapshot(&orchestrator)
        .await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    orchestrator.shutdown().await;
    sync.stop().await;
    info!(keys = store.keys().len(), "Published state keys");
    Ok(())
}
