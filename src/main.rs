use std::sync::Arc;

use clap::Parser;
use rmcp::ServiceExt;
use tokio::io::{stdin, stdout};

use nwb_orchestrator::agents::conversion::AGENT_NAME as CONVERSION_AGENT_NAME;
use nwb_orchestrator::agents::evaluation::AGENT_NAME as EVALUATION_AGENT_NAME;
use nwb_orchestrator::{
    AnthropicLlmClient, Args, Config, ConversationAgent, ConversionAgent, EvaluationAgent,
    MessageBus, MockConversionLibrary, MockNwbLibrary, OrchestratorServer, PromptService,
    PromptTemplateStore, ReportService, SessionStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nwb_orchestrator=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(&args).map_err(|e| anyhow::anyhow!(e))?;
    config.ensure_directories()?;

    tracing::info!(
        upload_dir = %config.upload_dir.display(),
        output_dir = %config.output_dir.display(),
        report_dir = %config.report_dir.display(),
        "starting nwb conversion orchestrator"
    );

    let session_store = SessionStore::new().shared();

    let llm = AnthropicLlmClient::new(config.llm_api_key.clone())
        .map_err(|e| anyhow::anyhow!("failed to build LLM HTTP client: {e}"))?;
    let prompts = Arc::new(PromptService::new(
        PromptTemplateStore::with_defaults(),
        Box::new(llm),
    ));

    let conversion_library = Arc::new(MockConversionLibrary::default());
    let nwb_library = Arc::new(MockNwbLibrary::default());
    let reports = ReportService::new(config.report_dir.clone());

    let conversion_agent = Arc::new(ConversionAgent::new(
        session_store.clone(),
        conversion_library,
        prompts.clone(),
        config.output_dir.clone(),
    ));
    let evaluation_agent = Arc::new(EvaluationAgent::new(
        session_store.clone(),
        nwb_library,
        prompts.clone(),
        reports,
    ));
    let conversation_agent = Arc::new(ConversationAgent::new(session_store.clone(), prompts.clone()));

    let mut bus = MessageBus::new(session_store.clone());
    bus.register(conversion_agent);
    bus.register(evaluation_agent);
    bus.register(conversation_agent);
    tracing::info!(
        conversion = CONVERSION_AGENT_NAME,
        evaluation = EVALUATION_AGENT_NAME,
        "agents registered on the message bus"
    );

    let server = OrchestratorServer::new(Arc::new(bus), session_store);

    let transport = (stdin(), stdout());
    let service = server.serve(transport).await?;
    service.waiting().await?;

    Ok(())
}
