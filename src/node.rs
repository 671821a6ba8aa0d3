//! Per-node process supervision: the consensus engine plus its two
//! sidecars (ledger distribution and the admin HTTP gateway).

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::keys::KeyProvider;
use crate::network::NetworkContext;
use crate::provision::{NetworkDefinition, TokensConfig};
use crate::topology::{Peer, PeerUri, QuorumSet};

/// What the rest of the network needs to know about a node when building
/// peer URIs and ledger source URLs. Immutable once the node exists.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub peer_port: u16,
    pub fingerprint: String,
    pub ledger_distribution_dir: PathBuf,
}

/// Name-keyed registry of every node's entry, shared with the control
/// server and used for lazy quorum resolution.
pub type NodeDirectory = BTreeMap<String, NodeEntry>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    /// Never started, or explicitly stopped.
    Stopped,
    Running {
        pid: u32,
    },
    /// The consensus process terminated without a `stop()`.
    Exited,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NodeStatus::Stopped => write!(f, "stopped"),
            NodeStatus::Running { pid } => write!(f, "running, pid={}", pid),
            NodeStatus::Exited => write!(f, "exited"),
        }
    }
}

/// A single validator-like node: identity, ports, topology declarations and
/// up to three supervised child processes.
pub struct Node {
    pub name: String,
    pub index: usize,
    pub client_port: u16,
    pub peer_port: u16,
    pub admin_port: u16,
    pub admin_http_gateway_port: u16,
    pub peers: Vec<Peer>,
    pub quorum_set: QuorumSet,
    pub block_version: u32,
    pub minimum_fee: u64,

    ledger_dir: PathBuf,
    ledger_distribution_dir: PathBuf,
    msg_signer_key_file: PathBuf,
    tokens_config_file: PathBuf,
    fingerprint: String,

    consensus: Option<Child>,
    ledger_distribution: Option<Child>,
    admin_http_gateway: Option<Child>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl Node {
    /// Build a node and generate its message-signing key on the spot; the
    /// fingerprint must be available to every other node's config long
    /// before this node starts.
    pub fn new(
        config: &OrchestratorConfig,
        keys: &dyn KeyProvider,
        name: &str,
        index: usize,
        peers: Vec<Peer>,
        quorum_set: QuorumSet,
        block_version: u32,
    ) -> Result<Self> {
        let work_dir = &config.paths.work_dir;
        let msg_signer_key_file = work_dir.join(format!("node-scp-{}.pem", index));
        keys.generate_signing_key(&msg_signer_key_file)?;
        let fingerprint = keys.public_key_fingerprint(&msg_signer_key_file)?;

        Ok(Self {
            name: name.to_string(),
            index,
            client_port: config.client_port(index),
            peer_port: config.peer_port(index),
            admin_port: config.admin_port(index),
            admin_http_gateway_port: config.admin_http_gateway_port(index),
            peers,
            quorum_set,
            block_version,
            minimum_fee: config.consensus.minimum_fee,
            ledger_dir: work_dir.join(format!("node-ledger-{}", index)),
            ledger_distribution_dir: work_dir.join(format!("node-ledger-distribution-{}", index)),
            msg_signer_key_file,
            tokens_config_file: work_dir.join(format!("node-tokens-{}.json", index)),
            fingerprint,
            consensus: None,
            ledger_distribution: None,
            admin_http_gateway: None,
        })
    }

    pub fn entry(&self) -> NodeEntry {
        NodeEntry {
            peer_port: self.peer_port,
            fingerprint: self.fingerprint.clone(),
            ledger_distribution_dir: self.ledger_distribution_dir.clone(),
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn ledger_dir(&self) -> &PathBuf {
        &self.ledger_dir
    }

    pub fn peer_uri(&self, broadcast_consensus_msgs: bool) -> PeerUri {
        PeerUri {
            host: "localhost".to_string(),
            port: self.peer_port,
            consensus_msg_key: self.fingerprint.clone(),
            broadcast_consensus_msgs,
        }
    }

    /// The resolved topology this node advertises: quorum set against live
    /// addresses, URIs for its declared peers, URIs for every other node it
    /// should merely know about, and ledger sources for its direct peers.
    pub fn network_definition(&self, ctx: &NetworkContext) -> Result<NetworkDefinition> {
        let directory = &ctx.directory;
        let peer_names: HashSet<&str> = self.peers.iter().map(|p| p.name.as_str()).collect();

        let mut broadcast_peers = Vec::with_capacity(self.peers.len());
        for peer in &self.peers {
            let entry = directory
                .get(&peer.name)
                .ok_or_else(|| OrchestratorError::UnknownNode(peer.name.clone()))?;
            broadcast_peers.push(entry_peer_uri(entry, peer.broadcast_consensus_msgs).to_string());
        }

        let mut known_peers = Vec::new();
        let mut tx_source_urls = Vec::new();
        for (name, entry) in directory {
            if *name == self.name {
                continue;
            }
            if peer_names.contains(name.as_str()) {
                tx_source_urls.push(format!("file://{}", entry.ledger_distribution_dir.display()));
            } else {
                known_peers.push(entry_peer_uri(entry, true).to_string());
            }
        }

        let peer_ports: BTreeMap<String, u16> = directory
            .iter()
            .map(|(name, entry)| (name.clone(), entry.peer_port))
            .collect();

        Ok(NetworkDefinition {
            quorum_set: self.quorum_set.resolve(&peer_ports)?,
            broadcast_peers,
            known_peers,
            tx_source_urls,
        })
    }

    /// Start the engine and, once its ledger exists, the two sidecars.
    ///
    /// Refuses to run while a consensus process is tracked. If the engine
    /// exits before its ledger database appears the start is abandoned and
    /// the node is left stopped; callers discover this via `status()`. A
    /// hung engine is bounded by the configured readiness timeout.
    pub async fn start(&mut self, ctx: &NetworkContext) -> Result<()> {
        if self.consensus.is_some() {
            return Err(OrchestratorError::AlreadyStarted(self.name.clone()));
        }

        // Sidecars from a previous incarnation depend on ledger state the
        // new engine is about to rewrite.
        for child in [
            self.ledger_distribution.take(),
            self.admin_http_gateway.take(),
        ]
        .into_iter()
        .flatten()
        {
            kill_if_running(child);
        }

        let config = &ctx.config;
        let work_dir = &config.paths.work_dir;

        // Config always reflects the current peer set.
        let definition = self.network_definition(ctx)?;
        let network_json_path = work_dir.join(format!("node{}-network.json", self.index));
        definition.write(&network_json_path)?;

        let debug_dump_dir = work_dir.join(format!("scp-debug-dump-{}", self.index));
        match fs::remove_dir_all(&debug_dump_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        TokensConfig::for_node(self.minimum_fee, &ctx.minting).write_signed(
            &self.tokens_config_file,
            &ctx.minting,
            ctx.keys.as_ref(),
        )?;

        let msg_signer_key = ctx.keys.signing_key_material(&self.msg_signer_key_file)?;
        let sealed_key_path =
            work_dir.join(format!("consensus-sealed-block-signing-key-{}", self.index));

        info!(
            "Starting node {}: client_port={} peer_port={} admin_port={}",
            self.name, self.client_port, self.peer_port, self.admin_port
        );
        info!(
            " - Peers: {:?}",
            self.peers.iter().map(|p| p.name.as_str()).collect::<Vec<_>>()
        );

        let bin = config.binary_path(&config.binaries.consensus);
        let child = Command::new(&bin)
            .arg("--client-responder-id")
            .arg(format!("localhost:{}", self.client_port))
            .arg("--peer-responder-id")
            .arg(format!("localhost:{}", self.peer_port))
            .arg("--msg-signer-key")
            .arg(&msg_signer_key)
            .arg("--network")
            .arg(&network_json_path)
            .arg(format!("--ias-api-key={}", config.consensus.ias_api_key))
            .arg(format!("--ias-spid={}", config.consensus.ias_spid))
            .arg("--origin-block-path")
            .arg(&config.paths.origin_block_dir)
            .arg("--block-version")
            .arg(self.block_version.to_string())
            .arg("--ledger-path")
            .arg(&self.ledger_dir)
            .arg(format!(
                "--admin-listen-uri=insecure-mca://0.0.0.0:{}/",
                self.admin_port
            ))
            .arg(format!(
                "--client-listen-uri=insecure-mc://0.0.0.0:{}/",
                self.client_port
            ))
            .arg(format!(
                "--peer-listen-uri=insecure-mcp://0.0.0.0:{}/",
                self.peer_port
            ))
            .arg("--scp-debug-dump")
            .arg(&debug_dump_dir)
            .arg("--sealed-block-signing-key")
            .arg(&sealed_key_path)
            .arg(format!("--tokens={}", self.tokens_config_file.display()))
            .env(
                &config.supervisor.child_log_var,
                &config.supervisor.child_log_filter,
            )
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OrchestratorError::Spawn {
                bin: bin.clone(),
                source: e,
            })?;
        self.consensus = Some(child);

        // The sidecars need the ledger database the engine creates.
        let ledger_db = self.ledger_dir.join("data.mdb");
        let deadline = Instant::now() + config.readiness_timeout();
        while !ledger_db.exists() {
            let exited = match self.consensus.as_mut() {
                Some(child) => !matches!(child.try_wait(), Ok(None)),
                None => true,
            };
            if exited {
                warn!(
                    "Node {} consensus process exited before its ledger appeared",
                    self.name
                );
                self.stop();
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.stop();
                return Err(OrchestratorError::StartTimeout(
                    self.name.clone(),
                    config.readiness_timeout(),
                ));
            }
            info!("Waiting for {}", ledger_db.display());
            sleep(config.poll_interval()).await;
        }

        let bin = config.binary_path(&config.binaries.ledger_distribution);
        let child = Command::new(&bin)
            .arg("--ledger-path")
            .arg(&self.ledger_dir)
            .arg("--dest")
            .arg(format!("file://{}", self.ledger_distribution_dir.display()))
            .arg("--state-file")
            .arg(work_dir.join(format!("ledger-distribution-state-{}", self.index)))
            .env(
                &config.supervisor.child_log_var,
                &config.supervisor.child_log_filter,
            )
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OrchestratorError::Spawn {
                bin: bin.clone(),
                source: e,
            })?;
        info!("Started ledger distribution for node {}", self.name);
        self.ledger_distribution = Some(child);

        let bin = config.binary_path(&config.binaries.admin_http_gateway);
        let child = Command::new(&bin)
            .arg("--listen-host")
            .arg("0.0.0.0")
            .arg("--listen-port")
            .arg(self.admin_http_gateway_port.to_string())
            .arg("--admin-uri")
            .arg(format!("insecure-mca://127.0.0.1:{}/", self.admin_port))
            .env(
                &config.supervisor.child_log_var,
                &config.supervisor.child_log_filter,
            )
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OrchestratorError::Spawn {
                bin: bin.clone(),
                source: e,
            })?;
        info!("Started admin http gateway for node {}", self.name);
        self.admin_http_gateway = Some(child);

        Ok(())
    }

    pub fn status(&mut self) -> NodeStatus {
        match self.consensus.as_mut() {
            None => NodeStatus::Stopped,
            Some(child) => match child.try_wait() {
                Ok(None) => NodeStatus::Running {
                    pid: child.id().unwrap_or(0),
                },
                _ => NodeStatus::Exited,
            },
        }
    }

    /// Idempotent: kills whatever is still running and always clears all
    /// handles, so a later `start()` is never wedged by a dead process.
    pub fn stop(&mut self) {
        for child in [
            self.consensus.take(),
            self.ledger_distribution.take(),
            self.admin_http_gateway.take(),
        ]
        .into_iter()
        .flatten()
        {
            kill_if_running(child);
        }
        info!("Stopped node {}", self.name);
    }

    /// Poll every tracked process; reports the first one found dead.
    /// Used by the network-wide `wait()` loop.
    pub fn first_dead_process(&mut self) -> Option<String> {
        if let Some(status) = process_exit(&mut self.consensus) {
            return Some(format!("consensus service died with {}", status));
        }
        if let Some(status) = process_exit(&mut self.admin_http_gateway) {
            return Some(format!("admin http gateway died with {}", status));
        }
        if let Some(status) = process_exit(&mut self.ledger_distribution) {
            return Some(format!("ledger distribution died with {}", status));
        }
        None
    }
}

fn kill_if_running(mut child: Child) {
    if matches!(child.try_wait(), Ok(None)) {
        let _ = child.start_kill();
    }
}

fn process_exit(child: &mut Option<Child>) -> Option<String> {
    let status = child.as_mut()?.try_wait().ok()??;
    Some(status.to_string())
}

fn entry_peer_uri(entry: &NodeEntry, broadcast_consensus_msgs: bool) -> PeerUri {
    PeerUri {
        host: "localhost".to_string(),
        port: entry.peer_port,
        consensus_msg_key: entry.fingerprint.clone(),
        broadcast_consensus_msgs,
    }
}
