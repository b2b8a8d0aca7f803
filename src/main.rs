use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use agentflow::api::{AppState, routes};
use agentflow::company::{CompanyLookup, StaticDirectory};
use agentflow::config::{PipelineConfig, ServerConfig};
use agentflow::knowledge::{InMemoryKnowledgeBase, KnowledgeRetriever};
use agentflow::llm::{LlmConfig, create_reasoning_port};
use agentflow::observability::{CostLedger, FanoutSink, MetricsCollector, TracingSink};
use agentflow::pipeline::{Orchestrator, OrchestratorDeps, RawEmail};
use agentflow::store::{HistoryStore, LibSqlHistoryStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let server = ServerConfig::from_env().context("server configuration")?;
    let pipeline = PipelineConfig::from_env().context("pipeline configuration")?;
    let llm = LlmConfig::from_env().context("LLM configuration")?;

    let retriever: Arc<dyn KnowledgeRetriever> = match server.knowledge_path {
        Some(ref path) => Arc::new(InMemoryKnowledgeBase::from_json_file(path).await?),
        None => {
            tracing::warn!("AGENTFLOW_KNOWLEDGE_PATH not set, knowledge base is empty");
            Arc::new(InMemoryKnowledgeBase::new())
        }
    };
    let lookup: Arc<dyn CompanyLookup> = match server.company_path {
        Some(ref path) => Arc::new(StaticDirectory::from_json_file(path).await?),
        None => Arc::new(StaticDirectory::default()),
    };

    let metrics = Arc::new(MetricsCollector::new());
    let costs = Arc::new(CostLedger::new());
    let sink = FanoutSink::new()
        .with(Arc::new(TracingSink))
        .with(metrics.clone())
        .with(costs.clone());

    let orchestrator = Arc::new(Orchestrator::new(
        pipeline,
        OrchestratorDeps {
            port: Arc::new(create_reasoning_port(&llm)?),
            retriever,
            lookup,
            sink: Arc::new(sink),
        },
    )?);

    // One-shot mode: `agentflow process <message.eml>` prints the run as JSON.
    let args: Vec<String> = std::env::args().skip(1).collect();
    if let [command, path] = args.as_slice()
        && command == "process"
    {
        let path = PathBuf::from(path);
        let raw = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let email = RawEmail::from_rfc822(&raw)?;
        let state = orchestrator.process(email).await?;
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    let history: Arc<dyn HistoryStore> =
        Arc::new(LibSqlHistoryStore::new_local(&server.db_path).await?);

    eprintln!("AgentFlow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm.model);
    eprintln!("   API:   http://0.0.0.0:{}/process", server.port);
    eprintln!("   DB:    {}\n", server.db_path.display());

    let app = routes(AppState {
        orchestrator,
        history: Some(history),
        metrics,
        costs,
        batch_concurrency: server.max_concurrent,
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", server.port))
        .await
        .with_context(|| format!("binding port {}", server.port))?;
    tracing::info!(port = server.port, "AgentFlow server started");
    axum::serve(listener, app).await?;
    Ok(())
}
