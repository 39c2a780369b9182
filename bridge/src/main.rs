mod config;
mod server;
mod thread_tcp;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bridge_session_lib::{
    AdapterKind, ClaudeAgent, ClaudeAgentConfig, ClientHandle, FileHistoryStore,
    PersistenceBridge, ProcessSupervisor, SessionRegistry, ThreadAgent, ThreadAgentConfig,
};
use clap::Parser;
use config::BridgeConfig;
use thread_tcp::TcpThreadTransport;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "acp-bridge")]
#[command(about = "Session bridge between ACP clients and coding-agent backends")]
struct Args {
    /// Default backend variant: "subprocess" or "native-stream"
    #[arg(long, env = "ACP_BRIDGE_BACKEND")]
    backend: Option<String>,

    /// Path to the backend CLI binary (subprocess variant)
    #[arg(long, env = "ACP_BRIDGE_CLAUDE_BINARY")]
    claude_binary: Option<PathBuf>,

    /// Credential marker file checked before spawning the CLI
    #[arg(long)]
    credentials: Option<PathBuf>,

    /// Thread-protocol endpoint, host:port (native-stream variant)
    #[arg(long, env = "ACP_BRIDGE_THREAD_ADDR")]
    thread_addr: Option<String>,

    /// Notification history directory (defaults to the platform config dir)
    #[arg(long)]
    history_dir: Option<PathBuf>,

    /// All remaining arguments are forwarded to the backend CLI
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    claude_args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Stdout is the protocol channel; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = BridgeConfig::load().unwrap_or_else(|e| {
        tracing::warn!("Could not load config, using defaults: {}", e);
        BridgeConfig::default()
    });

    let default_kind = args
        .backend
        .or(config.default_backend.clone())
        .as_deref()
        .map(|id| {
            AdapterKind::from_id(id)
                .with_context(|| format!("unknown backend '{}'", id))
        })
        .transpose()?
        .unwrap_or(AdapterKind::Subprocess);

    let history_root = match args.history_dir.or(config.history_dir.clone()) {
        Some(dir) => dir,
        None => FileHistoryStore::default_root().context("resolving history directory")?,
    };
    let store = FileHistoryStore::new(&history_root)
        .with_context(|| format!("opening history store at {}", history_root.display()))?;
    let persistence = Arc::new(PersistenceBridge::new(Arc::new(store)));

    let (client, notifications, permissions) = ClientHandle::channel();

    let supervisor = Arc::new(
        ProcessSupervisor::new()
            .with_spawn_callback(Box::new(|spawn| {
                info!("backend up: pid={} ({})", spawn.pid, spawn.command);
            }))
            .with_exit_callback(Box::new(|pid, code| {
                info!("backend down: pid={} code={:?}", pid, code);
            })),
    );

    let claude = Arc::new(ClaudeAgent::new(
        ClaudeAgentConfig {
            binary_path: args
                .claude_binary
                .or(config.claude_binary.clone())
                .unwrap_or_else(|| PathBuf::from("claude")),
            extra_args: if args.claude_args.is_empty() {
                config.claude_args.clone()
            } else {
                args.claude_args.clone()
            },
            credentials_path: args.credentials.or(config.credentials_path.clone()),
            ..Default::default()
        },
        supervisor,
        Arc::clone(&persistence),
        client.clone(),
    ));

    let mut registry = SessionRegistry::new(default_kind).with_adapter(claude);
    if let Some(addr) = args.thread_addr.or(config.thread_addr.clone()) {
        let thread = Arc::new(ThreadAgent::new(
            ThreadAgentConfig::default(),
            Arc::new(TcpThreadTransport::new(addr)),
            Arc::clone(&persistence),
            client.clone(),
        ));
        registry = registry.with_adapter(thread);
    } else if default_kind == AdapterKind::NativeStream {
        anyhow::bail!("native-stream backend selected but no --thread-addr configured");
    }

    info!(
        "acp-bridge ready (default backend: {}, history: {})",
        default_kind,
        history_root.display()
    );

    server::run(Arc::new(registry), notifications, permissions).await
}
