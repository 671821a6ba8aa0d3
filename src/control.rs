//! Line-oriented TCP control server for toggling nodes at runtime.
//!
//! Plaintext, unauthenticated, loopback-only debugging interface: connect
//! with netcat, type `status`, `stop <name>` or `start <name>`. Every
//! response ends with a `"> "` prompt. Not for use across an untrusted
//! network.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::Result;
use crate::network::NetworkContext;
use crate::node::Node;

/// A command decoded from one request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Status,
    Start(String),
    Stop(String),
}

/// Decode `command[ SPACE argument]`. `None` means the command is unknown.
pub fn parse_command(line: &str) -> Option<ControlCommand> {
    let (command, argument) = match line.split_once(' ') {
        Some((command, argument)) => (command, argument),
        None => (line, ""),
    };
    match command {
        "status" => Some(ControlCommand::Status),
        "start" => Some(ControlCommand::Start(argument.to_string())),
        "stop" => Some(ControlCommand::Stop(argument.to_string())),
        _ => None,
    }
}

type SharedNode = Arc<Mutex<Node>>;

/// Handle to the background accept-loop task.
pub struct ControlServer {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ControlServer {
    /// Bind and start serving. Port 0 picks an ephemeral port; the bound
    /// address is available via [`ControlServer::local_addr`].
    pub async fn start(
        port: u16,
        nodes: Vec<(String, SharedNode)>,
        ctx: Arc<NetworkContext>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;
        info!("Control server listening on {}", local_addr);
        let task = tokio::spawn(serve(listener, nodes, ctx));
        Ok(Self { local_addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(listener: TcpListener, nodes: Vec<(String, SharedNode)>, ctx: Arc<NetworkContext>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!("Control accept failed: {}", e);
                continue;
            }
        };
        debug!("Control connection from {}", peer);
        // Connections are served one at a time; a second client queues in
        // the accept backlog until the first disconnects.
        if let Err(e) = handle_connection(stream, &nodes, &ctx).await {
            debug!("Control connection closed: {}", e);
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    nodes: &[(String, SharedNode)],
    ctx: &NetworkContext,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.split();
    let mut lines = BufReader::new(reader).lines();

    writer.write_all(b"> ").await?;
    writer.flush().await?;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = match parse_command(line) {
            Some(ControlCommand::Status) => {
                let mut out = String::new();
                for (name, node) in nodes {
                    let status = node.lock().await.status();
                    out.push_str(&format!("{}: {}\n", name, status));
                }
                out
            }
            Some(ControlCommand::Stop(name)) => match find_node(nodes, &name) {
                Some(node) => {
                    node.lock().await.stop();
                    format!("Stopped {}.\n", name)
                }
                None => format!("Unknown node {}\n", name),
            },
            Some(ControlCommand::Start(name)) => match find_node(nodes, &name) {
                Some(node) => {
                    // Stop first so `start` is idempotent whatever state the
                    // node is in.
                    let mut node = node.lock().await;
                    node.stop();
                    match node.start(ctx).await {
                        Ok(()) => format!("Started {}.\n", name),
                        Err(e) => format!("Error starting {}: {}\n", name, e),
                    }
                }
                None => format!("Unknown node {}\n", name),
            },
            None => "Unknown command\n".to_string(),
        };

        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"> ").await?;
        writer.flush().await?;
    }

    Ok(())
}

fn find_node<'a>(nodes: &'a [(String, SharedNode)], name: &str) -> Option<&'a SharedNode> {
    nodes
        .iter()
        .find(|(node_name, _)| node_name == name)
        .map(|(_, node)| node)
}
