use std::path::PathBuf;

use clap::Parser;
use guardrail_gateway::gateway::{Gateway, GatewayConfig, GatewayHttpState, router};

#[derive(Debug, Parser)]
#[command(name = "guardrail-gateway", about = "LLM request gateway with guardrail hooks")]
struct Args {
    /// Gateway config (.json, .toml or .yaml).
    #[arg(long, short)]
    config: PathBuf,
    /// Overrides `listen` from the config.
    #[arg(long)]
    listen: Option<String>,
    #[arg(long)]
    json_logs: bool,
    /// Export spans over OTLP/HTTP (needs the `gateway-otel` feature).
    #[arg(long)]
    otel: bool,
    #[arg(long)]
    otel_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let _otel_guard = init_tracing(&args)?;

    let mut config = GatewayConfig::load(&args.config)?;
    if let Some(listen) = args.listen.clone() {
        config.listen = listen;
    }
    let listen = config.listen.clone();
    let gateway = Gateway::new(config)?;

    let app = router(GatewayHttpState::new(gateway));
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(listen = %listen, "guardrail-gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(feature = "gateway-otel")]
fn init_tracing(
    args: &Args,
) -> Result<Option<guardrail_gateway::gateway::otel::OtelGuard>, Box<dyn std::error::Error>> {
    if !args.otel && args.otel_endpoint.is_none() {
        guardrail_gateway::gateway::observability::init_tracing(args.json_logs)?;
        return Ok(None);
    }
    Ok(Some(guardrail_gateway::gateway::otel::init_tracing(
        guardrail_gateway::gateway::otel::DEFAULT_SERVICE_NAME,
        args.otel_endpoint.as_deref(),
        args.json_logs,
    )?))
}

#[cfg(not(feature = "gateway-otel"))]
fn init_tracing(args: &Args) -> Result<Option<()>, Box<dyn std::error::Error>> {
    if args.otel || args.otel_endpoint.is_some() {
        return Err("otel requires `--features gateway-otel`".into());
    }
    guardrail_gateway::gateway::observability::init_tracing(args.json_logs)?;
    Ok(None)
}
