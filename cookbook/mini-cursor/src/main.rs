use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tether::{
    coding_toolkit, init_tracing, Agent, AppConfig, ConversationStore, FileConversationStore,
    OpenAIClient, StopReason, StorageBackend, ToolkitConfig,
};

const SYSTEM_PROMPT: &str = "You are a coding assistant working inside the user's project. \
Use the tools to inspect files before changing them, write complete files, and run commands \
to verify your work. Reply with a short summary once the task is done.";

#[derive(Parser)]
#[command(author, version, about = "A small coding agent with file and shell tools", long_about = None)]
struct Cli {
    /// Task for the agent
    #[arg(required = true)]
    query: Vec<String>,

    /// Path to a TOML config file
    #[arg(short, long, default_value = "tether.toml")]
    config: PathBuf,

    /// Project directory the tools operate in
    #[arg(short, long)]
    workdir: Option<PathBuf>,

    /// Override the configured model name
    #[arg(short, long)]
    model: Option<String>,

    /// Conversation to resume when storage is sqlite
    #[arg(short, long, default_value = "default")]
    session: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::from_env_or_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(model) = cli.model {
        config.model.model = model;
    }
    init_tracing(&config.logging);

    if config.model.provider != "openai" {
        bail!(
            "provider `{}` is not supported here; set TETHER_PROVIDER=openai",
            config.model.provider
        );
    }
    let client = OpenAIClient::from_config(&config.model)?;

    let root = cli
        .workdir
        .or_else(|| config.agent.working_directory.clone().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));
    let tools = coding_toolkit(
        ToolkitConfig::new(&root)
            .with_command_timeout(Duration::from_secs(config.agent.command_timeout_secs)),
    );

    let mut agent = Agent::new(Arc::new(client))
        .with_system_prompt(
            config
                .agent
                .system_prompt
                .clone()
                .unwrap_or_else(|| SYSTEM_PROMPT.to_string()),
        )
        .with_tools(tools)
        .with_max_iterations(config.agent.max_iterations);

    if let Some(store) = open_store(&config, &cli.session).await? {
        agent = agent.with_store(store);
        let restored = agent.load_history().await?;
        tracing::info!(restored, "resumed conversation");
    }

    let token = agent.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    let outcome = agent.run(cli.query.join(" ")).await?;
    println!("{}", outcome.answer);
    match outcome.stop {
        StopReason::Completed => {}
        StopReason::BudgetExhausted => eprintln!(
            "stopped after {} model calls without a final answer",
            outcome.model_calls
        ),
        StopReason::Cancelled => eprintln!("cancelled"),
    }
    Ok(())
}

async fn open_store(config: &AppConfig, session: &str) -> Result<Option<Arc<dyn ConversationStore>>> {
    let store: Arc<dyn ConversationStore> = match config.storage.backend {
        StorageBackend::Memory => return Ok(None),
        StorageBackend::File => Arc::new(FileConversationStore::new(&config.storage.file_path)),
        StorageBackend::Sqlite => {
            let url = config
                .storage
                .database_url
                .as_deref()
                .context("sqlite storage needs `database_url`")?;
            Arc::new(tether::SqlConversationStore::connect(url).await?.for_session(session))
        }
    };
    Ok(Some(store))
}
