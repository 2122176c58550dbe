//! irn-node: research node daemon and admin CLI.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use irn_core::messages::NodeRegistration;
use irn_core::{AccessLevel, NodeContact, NodeId};
use irn_node::client::load_certificate;
use irn_node::{NodeConfig, ResearchNode};

const DEFAULT_LOG_FILTER: &str = "irn_node=info,irn_sync=info,irn_auth=info,irn_store=info";

#[derive(Parser)]
#[command(name = "irn-node")]
#[command(about = "Research node: secure handshake and entity sync between institutions")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "irn-node.toml")]
    config: PathBuf,

    /// Node ID (overrides config file)
    #[arg(long, env = "IRN_NODE_ID")]
    node_id: Option<NodeId>,

    /// Listen address (overrides config file)
    #[arg(long, env = "IRN_LISTEN_ADDR")]
    listen: Option<SocketAddr>,

    /// SQLite database path (overrides config file)
    #[arg(long, env = "IRN_DATABASE_PATH")]
    database: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, env = "IRN_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the handshake and sync endpoints
    Serve,

    /// Pull new and updated entities from a registered node
    Pull {
        node_id: NodeId,

        /// Only rows updated after this instant (RFC 3339). Defaults to
        /// the last completed pull from this node.
        #[arg(long)]
        since: Option<DateTime<Utc>>,
    },

    /// Ask a remote node to register this one
    Register {
        url: String,

        #[arg(long, default_value = "ReadOnly")]
        access: AccessLevel,
    },

    /// Manage the local node registry
    Nodes {
        #[command(subcommand)]
        command: NodesCommand,
    },

    /// Show sync history
    Logs {
        #[arg(long)]
        remote: Option<NodeId>,
    },
}

#[derive(Subcommand)]
enum NodesCommand {
    /// List registered nodes
    List,

    /// Record a peer from its certificate, as pending
    Add {
        id: NodeId,

        #[arg(long)]
        name: String,

        /// Certificate file, PEM or base64 DER
        #[arg(long)]
        certificate: PathBuf,

        /// Base URL the peer serves on
        #[arg(long)]
        url: Option<String>,

        #[arg(long, default_value = "ReadOnly")]
        access: AccessLevel,
    },

    /// Authorize a node
    Approve {
        id: NodeId,

        #[arg(long)]
        access: Option<AccessLevel>,
    },

    /// Revoke a node and end its sessions
    Revoke { id: NodeId },
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_LOG_FILTER))?;
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    let mut config = NodeConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node.id = Some(node_id);
    }
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(database) = cli.database {
        config.storage.database_path = database;
    }

    let node = ResearchNode::from_config(&config)
        .await
        .context("starting node")?;
    info!(node = %node.node_id(), name = node.name(), "node ready");

    match cli.command {
        Command::Serve => {
            let listener = TcpListener::bind(config.server.listen_addr)
                .await
                .with_context(|| format!("binding {}", config.server.listen_addr))?;
            node.serve(listener).await?;
        }

        Command::Pull { node_id, since } => {
            let report = node.pull(&node_id, since).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Command::Register { url, access } => {
            let result = node.register_with(&url, access).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }

        Command::Nodes { command } => run_nodes(&node, command).await?,

        Command::Logs { remote } => {
            for log in node.sync_logs(remote.as_ref()).await? {
                println!(
                    "{}  {}  {:?}  started {}  written {}{}",
                    log.id,
                    log.remote_node_id,
                    log.status,
                    log.started_at.to_rfc3339(),
                    log.counts.written(),
                    log.error_message.map(|m| format!("  error: {m}")).unwrap_or_default(),
                );
            }
        }
    }

    Ok(())
}

async fn run_nodes(node: &ResearchNode, command: NodesCommand) -> anyhow::Result<()> {
    match command {
        NodesCommand::List => {
            for peer in node.list_nodes().await? {
                println!(
                    "{}  {:<24}  {:?}  {:?}  {}",
                    peer.id,
                    peer.node_name,
                    peer.status,
                    peer.access_level,
                    peer.node_url.as_deref().unwrap_or("-"),
                );
            }
        }
        NodesCommand::Add {
            id,
            name,
            certificate,
            url,
            access,
        } => {
            let certificate = load_certificate(&certificate)?;
            let registration = NodeRegistration {
                node_id: id,
                node_name: name,
                certificate: certificate.to_base64(),
                node_url: url,
                contact: NodeContact::default(),
                requested_access_level: access,
            };
            let result = node.register_peer(&registration).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        NodesCommand::Approve { id, access } => {
            node.approve(&id, access).await?;
            println!("{id} authorized");
        }
        NodesCommand::Revoke { id } => {
            let ended = node.revoke(&id).await?;
            println!("{id} revoked, {ended} session(s) ended");
        }
    }
    Ok(())
}
