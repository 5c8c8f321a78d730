use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use scratch_guard::config::Config;
use scratch_guard::tools::{ToolCall, ToolContext, ToolOutput, ToolRegistry};

/// One line written back to the caller.
#[derive(Serialize)]
struct Reply {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<serde_json::Value>,
    #[serde(flatten)]
    output: ToolOutput,
}

#[tokio::main]
async fn main() {
    // Load .env file (if present) before anything reads env vars
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return;
    }

    if args.iter().any(|a| a == "--default-config") {
        print!("{}", Config::default_config_contents());
        return;
    }

    if args.iter().any(|a| a == "--tools") {
        let schemas = ToolRegistry::builtin().schemas();
        println!("{}", serde_json::to_string_pretty(&schemas).unwrap_or_default());
        return;
    }

    // stdout carries replies only, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from);

    let config = match Config::load(config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    if args.iter().any(|a| a == "--check") {
        let healthy = run_checks(&config).await;
        std::process::exit(if healthy { 0 } else { 1 });
    }

    let ctx = match ToolContext::from_config(&config) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("failed to initialize: {e}");
            std::process::exit(1);
        }
    };
    let registry = ToolRegistry::builtin();

    info!(
        scratch_root = %ctx.sandbox.root().display(),
        scripts_dir = %ctx.scripts.scripts_dir().display(),
        tools = registry.len(),
        "scratch-guard ready"
    );

    let served = serve(
        tokio::io::stdin(),
        tokio::io::stdout(),
        Arc::new(registry),
        Arc::new(ctx),
    )
    .await;
    if let Err(e) = served {
        error!("stdio loop failed: {e}");
        std::process::exit(1);
    }
}

/// Read one `ToolCall` per line and answer each with one JSON line.
/// Calls run concurrently, so replies may arrive out of order; the echoed
/// `id` ties them back to their requests.
async fn serve<R, W>(
    input: R,
    output: W,
    registry: Arc<ToolRegistry>,
    ctx: Arc<ToolContext>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Reply>(64);
    let writer = tokio::spawn(write_replies(rx, output));
    let mut calls = JoinSet::new();
    let mut lines = BufReader::new(input).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if tx.is_closed() {
            break;
        }

        match serde_json::from_str::<ToolCall>(line) {
            Ok(call) => {
                let (registry, ctx, tx) = (Arc::clone(&registry), Arc::clone(&ctx), tx.clone());
                calls.spawn(async move {
                    let output = dispatch(&registry, &ctx, &call.tool, call.params).await;
                    let _ = tx.send(Reply { id: call.id, output }).await;
                });
            }
            Err(e) => {
                let reply = Reply {
                    id: None,
                    output: ToolOutput::error(format!("invalid request: {e}")),
                };
                let _ = tx.send(reply).await;
            }
        }

        while let Some(done) = calls.try_join_next() {
            log_join(done);
        }
    }

    info!(in_flight = calls.len(), "input closed, finishing outstanding calls");
    while let Some(done) = calls.join_next().await {
        log_join(done);
    }
    drop(tx);
    writer.await.map_err(std::io::Error::other)?
}

async fn dispatch(
    registry: &ToolRegistry,
    ctx: &ToolContext,
    tool: &str,
    params: serde_json::Value,
) -> ToolOutput {
    debug!(tool, "dispatching");
    match registry.execute(tool, params, ctx).await {
        Ok(output) => output,
        Err(e) => {
            warn!(tool, error = %e, "call failed");
            ToolOutput::error(e.to_string())
        }
    }
}

fn log_join(done: Result<(), tokio::task::JoinError>) {
    if let Err(e) = done {
        error!(error = %e, "tool call task panicked");
    }
}

/// Sole owner of the output stream, so reply lines never interleave.
async fn write_replies<W>(mut rx: mpsc::Receiver<Reply>, mut out: W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(reply) = rx.recv().await {
        let mut encoded = serde_json::to_string(&reply).map_err(std::io::Error::other)?;
        encoded.push('\n');
        out.write_all(encoded.as_bytes()).await?;
        out.flush().await?;
    }
    Ok(())
}

async fn run_checks(config: &Config) -> bool {
    info!("running pre-flight checks...");
    let mut healthy = true;

    info!("config: OK");
    info!("  scratch_root: {}", config.scratch_root.display());
    info!("  fetch timeout: {}ms (max {}ms)", config.fetch.default_timeout_ms, config.fetch.max_timeout_ms);
    info!("  fetch bytes: {} (max {})", config.fetch.default_max_bytes, config.fetch.max_max_bytes);
    info!("  extra blocked hostnames: {:?}", config.egress.extra_blocked_hostnames);

    match std::fs::symlink_metadata(&config.scratch_root) {
        Ok(meta) if meta.file_type().is_symlink() => {
            error!("scratch root: IS A SYMLINK ({})", config.scratch_root.display());
            healthy = false;
        }
        Ok(meta) if meta.is_dir() => info!("scratch root: OK"),
        Ok(_) => {
            error!("scratch root: NOT A DIRECTORY ({})", config.scratch_root.display());
            healthy = false;
        }
        Err(_) => info!("scratch root: missing (created on first write)"),
    }

    if config.process.scripts_dir.is_dir() {
        info!("scripts dir: OK ({})", config.process.scripts_dir.display());
    } else {
        warn!("scripts dir: NOT FOUND ({})", config.process.scripts_dir.display());
    }

    match tokio::process::Command::new(&config.process.interpreter)
        .arg("--version")
        .output()
        .await
    {
        Ok(out) if out.status.success() => {
            let ver = String::from_utf8_lossy(&out.stdout);
            info!("interpreter: OK ({})", ver.trim());
        }
        Ok(out) => {
            error!("interpreter: exited with {}", out.status);
            healthy = false;
        }
        Err(e) => {
            error!("interpreter: NOT FOUND ({}): {e}", config.process.interpreter);
            healthy = false;
        }
    }

    healthy
}

fn print_usage() {
    println!(
        "scratch-guard — sandboxed file, fetch and script operations over stdio

USAGE:
    scratch-guard [OPTIONS]

Reads one JSON request per line on stdin:
    {{\"tool\": \"fetch_url\", \"params\": {{\"url\": \"https://example.com\"}}, \"id\": 1}}
and writes one JSON reply per line on stdout.

OPTIONS:
    --config <PATH>     Path to config file (default: ~/.config/scratch-guard/config.toml)
    --default-config    Print default config to stdout and exit
    --tools             Print tool names and parameter schemas, then exit
    --check             Validate config, scratch root and interpreter, then exit
    -h, --help          Print this help message

ENVIRONMENT:
    SCRATCH_ROOT          Override the scratch directory
    SCRIPT_INTERPRETER    Override the script interpreter (default: python3)
    RUST_LOG              Optional. Tracing filter (default: info).
"
    );
}
