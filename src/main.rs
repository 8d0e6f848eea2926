use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;
use clap::Parser;
use dapadapter::paths::find_project_root;
use dapadapter::{DebugBridge, SessionConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

mod dispatch;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Drive netcoredbg from a tool-calling client", long_about = None)]
struct Args {
    /// Debug adapter executable
    #[clap(long, env = "NETCOREDBG_PATH", default_value = "netcoredbg")]
    netcoredbg: PathBuf,

    /// Every program, source file and build project must live under this
    /// directory (default: detected from the current directory)
    #[clap(long, env = "NETCOREDBG_PROJECT_ROOT")]
    project_root: Option<PathBuf>,

    /// error, warn, info, debug or trace
    #[clap(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Delay before each stackTrace request, in milliseconds
    #[clap(long, env = "NETCOREDBG_STACKTRACE_DELAY_MS")]
    stacktrace_delay_ms: Option<u64>,

    /// Timeout for adapter requests, in seconds
    #[clap(long, default_value_t = 30)]
    request_timeout: u64,

    /// Build tool command line used for pre-launch builds
    #[clap(long, default_value = "dotnet")]
    build_tool: String,

    /// Upper bound for a pre-launch build, in seconds
    #[clap(long, default_value_t = 300)]
    build_timeout: u64,

    /// Skip `restore` before `build`
    #[clap(long)]
    no_restore: bool,
}

impl Args {
    fn level(&self) -> anyhow::Result<log::LevelFilter> {
        self.log_level
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid log level '{}'", self.log_level))
    }

    fn session_config(&self) -> anyhow::Result<SessionConfig> {
        let project_root = match &self.project_root {
            Some(root) => root.clone(),
            None => {
                let cwd = std::env::current_dir().context("cannot read the current directory")?;
                find_project_root(&cwd)
            }
        };

        let mut config = SessionConfig::new(&self.netcoredbg, project_root);
        config.request_timeout = Duration::from_secs(self.request_timeout);
        config.stack_trace_delay = self
            .stacktrace_delay_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        config.build_tool = self.build_tool.clone();
        config.build_timeout = Duration::from_secs(self.build_timeout);
        config.restore_before_build = !self.no_restore;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = args.level()?;

    // stdout carries tool replies, logs go to stderr
    simple_logger::SimpleLogger::new()
        .with_level(level)
        .with_module_level("dapadapter", level)
        .init()
        .map_err(|e| anyhow::anyhow!("failed to initialise logging: {}", e))?;

    let config = args.session_config()?;
    log::info!("netdbg-bridge starting, adapter: {}", config.adapter_path.display());
    let bridge = Arc::new(DebugBridge::new(config).context("invalid project root")?);

    let (replies, mut outgoing) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = outgoing.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                log::error!("stdout closed, dropping replies");
                break;
            }
        }
    });

    // Calls run concurrently so `stop_debug` can interrupt a slow request
    let mut calls = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let bridge = bridge.clone();
        let replies = replies.clone();
        calls.spawn(async move {
            let Some(reply) = dispatch::handle_line(&bridge, &line).await else {
                return;
            };
            match serde_json::to_string(&reply) {
                Ok(mut text) => {
                    text.push('\n');
                    let _ = replies.send(text);
                }
                Err(e) => log::error!("Failed to serialize reply: {}", e),
            }
        });
    }

    log::info!("stdin closed, shutting down");
    if let Err(e) = bridge.stop_debug().await {
        log::warn!("Failed to stop the debug session: {}", e);
    }
    while calls.join_next().await.is_some() {}
    drop(replies);
    let _ = writer.await;

    Ok(())
}
