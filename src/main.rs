//! TravelBot Orchestrator - Entry Point
//!
//! Modes:
//! - Default: JSON lines over stdio (one `Request` per line in, one `OrchestrationResult` per line out)
//! - --interactive / -i: type messages into a demo chat conversation

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use travelbot_orchestrator::{
    backend, Channel, Config, ErrorBody, Locale, Orchestrator, OrchestratorError, Request,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    let interactive = args.iter().any(|a| a == "--interactive" || a == "-i");
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");

    if help_mode {
        println!("TravelBot Orchestrator v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: travelbot [OPTIONS]");
        println!();
        println!("Options:");
        println!("  --interactive, -i  Chat with the orchestrator from the terminal");
        println!("  --help, -h         Show this help");
        println!();
        println!("Default: read JSON requests from stdin, write JSON results to stdout");
        println!();
        println!("Environment variables:");
        println!("  TRAVELBOT_CONFIG              TOML config file");
        println!("  TRAVELBOT_MAX_CONCURRENT      Max requests in flight (default: 50)");
        println!("  TRAVELBOT_CACHE_ENABLED       Enable result caching (default: true)");
        println!("  TRAVELBOT_CACHE_TTL           Provider cache TTL in seconds (default: 300)");
        println!("  TRAVELBOT_RESULT_TTL          Result cache TTL in seconds (default: 300)");
        println!("  TRAVELBOT_PROVIDER_TIMEOUT_MS Default provider timeout (default: 10000)");
        println!("  TRAVELBOT_REDIS_URL           Redis cache backend");
        println!("  TRAVELBOT_CACHE_DB            SQLite cache backend path");
        return Ok(());
    }

    // Setup logging based on mode
    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(if interactive { Level::WARN } else { Level::INFO });

    if interactive {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        // stdout carries results - log to stderr as JSON
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    info!("TravelBot Orchestrator v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let mut builder = Orchestrator::builder(config.clone()).with_default_providers();
    match backend::from_config(&config.backend).await {
        Ok(Some(store)) => {
            info!("Cache backend: {}", store.name());
            builder = builder.backend(store);
        }
        Ok(None) => {}
        // Caching still works in-process
        Err(e) => warn!("Cache backend unavailable, continuing in memory: {}", e),
    }
    let orchestrator = Arc::new(builder.build()?);

    let run = async {
        if interactive {
            run_interactive(&orchestrator).await
        } else {
            run_stdio(&orchestrator).await
        }
    };

    tokio::select! {
        result = run => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    orchestrator.shutdown().await;
    Ok(())
}

async fn run_stdio(orchestrator: &Arc<Orchestrator>) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<String>(256);

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.write_all(b"\n").await;
            let _ = stdout.flush().await;
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = JoinSet::new();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        // Reap finished requests so a long session stays bounded
        while in_flight.try_join_next().is_some() {}

        let tx = tx.clone();
        let orchestrator = orchestrator.clone();
        in_flight.spawn(async move {
            let output = match serde_json::from_str::<Request>(&line) {
                Ok(request) => serde_json::to_string(&orchestrator.handle(request).await),
                Err(e) => {
                    let error = OrchestratorError::Validation(format!("malformed request: {}", e));
                    serde_json::to_string(&serde_json::json!({
                        "success": false,
                        "error": ErrorBody::from_error(&error, Locale::En),
                    }))
                }
            };
            match output {
                Ok(json) => {
                    let _ = tx.send(json).await;
                }
                Err(e) => warn!("Failed to encode result: {}", e),
            }
        });
    }

    while in_flight.join_next().await.is_some() {}
    drop(tx);
    let _ = writer.await;
    Ok(())
}

async fn run_interactive(orchestrator: &Arc<Orchestrator>) -> anyhow::Result<()> {
    let conversation_id = uuid::Uuid::new_v4().to_string();
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(b"TravelBot - type a message, Ctrl-D to quit\n> ")
        .await?;
    stdout.flush().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !line.trim().is_empty() {
            let request = Request::new("demo-user", &conversation_id, &line).with_channel(Channel::Chat);
            let result = orchestrator.handle(request).await;

            let text = match (&result.data, &result.error) {
                (Some(data), _) => format!(
                    "{}\n  [completeness {}%, {} ms, strategy {}]",
                    data["reply"].as_str().unwrap_or_default(),
                    data["completeness"],
                    result.metadata.response_time_ms,
                    result.metadata.strategy.map(|s| s.as_str()).unwrap_or("-"),
                ),
                (None, Some(error)) => format!("{}\n  {}", error.message, error.support_hint),
                (None, None) => String::new(),
            };
            stdout.write_all(text.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
        }
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
    }
    Ok(())
}
