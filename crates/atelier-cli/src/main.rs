use std::path::PathBuf;

use anyhow::{Context, Result};
use atelier_cli::telemetry::init_logging;
use atelier_cli::{create_router, AppState};
use atelier_contracts::requests::RawRequest;
use atelier_contracts::TaskKind;
use atelier_engine::{Gateway, GatewayConfig};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "atelier", version, about = "Resilient inference gateway")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API.
    Serve(ServeArgs),
    /// Run one inference and print the response envelope.
    Run(RunArgs),
    /// Print the model tables.
    Models,
}

#[derive(Debug, Args)]
struct GatewayArgs {
    /// JSONL journal of attempts and backoffs.
    #[arg(long, env = "ATELIER_EVENTS_PATH")]
    events: Option<PathBuf>,
    /// Route every model to the offline dryrun provider.
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[arg(long, env = "ATELIER_HOST", default_value = "0.0.0.0")]
    host: String,
    #[arg(long, env = "ATELIER_PORT", default_value_t = 8080)]
    port: u16,
    #[command(flatten)]
    gateway: GatewayArgs,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    task: TaskKind,
    /// Prompt or chat message; text to speak for TTS, base64 audio for STT, image URL for vision.
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    width: Option<i64>,
    #[arg(long)]
    height: Option<i64>,
    #[arg(long)]
    max_tokens: Option<i64>,
    #[arg(long)]
    temperature: Option<f32>,
    #[command(flatten)]
    gateway: GatewayArgs,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("atelier error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_logging(cli.log_json);
    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    match cli.command {
        Command::Serve(args) => {
            runtime.block_on(serve(args))?;
            Ok(0)
        }
        Command::Run(args) => runtime.block_on(run_once(args)),
        Command::Models => {
            let gateway = build_gateway(&GatewayArgs {
                events: None,
                dryrun: true,
            })?;
            println!("{}", serde_json::to_string_pretty(&gateway.models_overview())?);
            Ok(0)
        }
    }
}

fn build_gateway(args: &GatewayArgs) -> Result<Gateway> {
    let mut config = GatewayConfig::from_env();
    config.dryrun |= args.dryrun;
    if args.events.is_some() {
        config.events_path = args.events.clone();
    }
    if config.dryrun {
        info!("dryrun mode: every model is served offline");
    }
    Gateway::from_config(&config).context("failed to build gateway")
}

async fn serve(args: ServeArgs) -> Result<()> {
    let gateway = build_gateway(&args.gateway)?;
    let app = create_router(AppState::new(gateway));

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("atelier listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    info!("atelier stopped");
    Ok(())
}

impl RunArgs {
    /// `--prompt` lands in the field each task reads its primary input from.
    fn raw_request(&self) -> RawRequest {
        let mut raw = RawRequest {
            model: self.model.clone(),
            width: self.width,
            height: self.height,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            ..RawRequest::default()
        };
        let input = Some(self.prompt.clone());
        match self.task {
            TaskKind::TextToSpeech => raw.text = input,
            TaskKind::SpeechToText => raw.audio = input,
            TaskKind::VisionTask => raw.image_url = input,
            _ => raw.prompt = input,
        }
        raw
    }
}

async fn run_once(args: RunArgs) -> Result<i32> {
    let gateway = build_gateway(&args.gateway)?;
    let task = args.task;
    let raw = args.raw_request();

    let (envelope, code) = match gateway.handle(task, raw).await {
        Ok(result) => (result.to_envelope(), 0),
        Err(err) => (gateway.failure_envelope(task, &err), 2),
    };
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(code)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
