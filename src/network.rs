//! Whole-network lifecycle: canned topologies, sequential startup, the
//! process watchdog and ownership of the control server.

use clap::ValueEnum;
use std::fs;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::OrchestratorConfig;
use crate::control::ControlServer;
use crate::error::Result;
use crate::keys::KeyProvider;
use crate::node::{Node, NodeDirectory};
use crate::provision::MintingKeys;
use crate::topology::{Peer, QuorumSet};

/// Immutable per-run data shared between the network, every node's
/// `start()` and the control server: the configuration, the name/port/
/// fingerprint directory, the minting key material and the key provider.
pub struct NetworkContext {
    pub config: OrchestratorConfig,
    pub directory: NodeDirectory,
    pub minting: MintingKeys,
    pub keys: Arc<dyn KeyProvider>,
}

/// Canned topology presets differing in peer-graph shape and
/// broadcast-vs-known-only edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum NetworkPreset {
    /// 5 nodes, fully interconnected, each requiring 3 of its 4 peers.
    Dense5,
    /// 3 nodes in a line (a-b-c); all three required, but `a` and `c` only
    /// reach each other through `b`.
    #[value(name = "a-b-c")]
    Abc,
    /// A ring of 5, broadcasting to both ring neighbors.
    Ring5,
    /// A ring of 5, broadcasting only forward; the node behind is a
    /// known-but-not-broadcast peer.
    Ring5b,
}

/// The full node set plus the control server. Owns the working directory,
/// which is wiped and recreated on construction.
pub struct Network {
    config: OrchestratorConfig,
    keys: Arc<dyn KeyProvider>,
    block_version: u32,
    nodes: Vec<(String, Arc<Mutex<Node>>)>,
    directory: NodeDirectory,
    minting: Option<MintingKeys>,
    control: Option<ControlServer>,
}

impl Network {
    pub fn new(
        config: OrchestratorConfig,
        keys: Arc<dyn KeyProvider>,
        block_version: Option<u32>,
    ) -> Result<Self> {
        match fs::remove_dir_all(&config.paths.work_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&config.paths.work_dir)?;

        Ok(Self {
            block_version: block_version.unwrap_or(config.consensus.block_version),
            config,
            keys,
            nodes: Vec::new(),
            directory: NodeDirectory::new(),
            minting: None,
            control: None,
        })
    }

    /// Add a node with the next index and its deterministically derived
    /// ports. Generates the node's signing key immediately so its
    /// fingerprint is available to everyone else's config.
    pub fn add_node(&mut self, name: &str, peers: Vec<Peer>, quorum_set: QuorumSet) -> Result<()> {
        let index = self.nodes.len();
        let node = Node::new(
            &self.config,
            self.keys.as_ref(),
            name,
            index,
            peers,
            quorum_set,
            self.block_version,
        )?;
        self.directory.insert(name.to_string(), node.entry());
        self.nodes.push((name.to_string(), Arc::new(Mutex::new(node))));
        Ok(())
    }

    pub fn get_node(&self, name: &str) -> Option<Arc<Mutex<Node>>> {
        self.nodes
            .iter()
            .find(|(node_name, _)| node_name == name)
            .map(|(_, node)| Arc::clone(node))
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn apply_preset(&mut self, preset: NetworkPreset) -> Result<()> {
        match preset {
            NetworkPreset::Dense5 => {
                let names: Vec<String> = (0..5).map(|i| i.to_string()).collect();
                for name in &names {
                    let others: Vec<&str> = names
                        .iter()
                        .filter(|other| *other != name)
                        .map(String::as_str)
                        .collect();
                    let peers = others.iter().map(|other| Peer::new(other)).collect();
                    self.add_node(name, peers, QuorumSet::of_nodes(3, &others))?;
                }
            }
            NetworkPreset::Abc => {
                self.add_node("a", vec![Peer::new("b")], QuorumSet::of_nodes(2, &["b", "c"]))?;
                self.add_node(
                    "b",
                    vec![Peer::new("a"), Peer::new("c")],
                    QuorumSet::of_nodes(2, &["a", "c"]),
                )?;
                self.add_node("c", vec![Peer::new("b")], QuorumSet::of_nodes(2, &["a", "b"]))?;
            }
            NetworkPreset::Ring5 => {
                for i in 1..=5u32 {
                    let prev = (if i == 1 { 5 } else { i - 1 }).to_string();
                    let next = (if i == 5 { 1 } else { i + 1 }).to_string();
                    self.add_node(
                        &i.to_string(),
                        vec![Peer::new(&prev), Peer::new(&next)],
                        QuorumSet::of_nodes(1, &[next.as_str()]),
                    )?;
                }
            }
            NetworkPreset::Ring5b => {
                for i in 1..=5u32 {
                    let prev = (if i == 1 { 5 } else { i - 1 }).to_string();
                    let next = (if i == 5 { 1 } else { i + 1 }).to_string();
                    self.add_node(
                        &i.to_string(),
                        vec![Peer::non_broadcast(&prev), Peer::new(&next)],
                        QuorumSet::of_nodes(1, &[next.as_str()]),
                    )?;
                }
            }
        }
        Ok(())
    }

    /// The shared context handed to `Node::start` and the control server.
    /// Generates minting keys on first use.
    pub fn context(&mut self) -> Result<Arc<NetworkContext>> {
        let minting = match &self.minting {
            Some(minting) => minting.clone(),
            None => {
                info!("Generating minting keys");
                let minting =
                    MintingKeys::generate(&self.config.paths.work_dir, self.keys.as_ref())?;
                self.minting = Some(minting.clone());
                minting
            }
        };
        Ok(Arc::new(NetworkContext {
            config: self.config.clone(),
            directory: self.directory.clone(),
            minting,
            keys: Arc::clone(&self.keys),
        }))
    }

    /// Tear down any previous run, regenerate minting keys, start every
    /// node sequentially, then bring up the control server.
    pub async fn start(&mut self) -> Result<()> {
        self.stop().await;

        info!("Generating minting keys");
        self.minting = Some(MintingKeys::generate(
            &self.config.paths.work_dir,
            self.keys.as_ref(),
        )?);
        let ctx = self.context()?;

        info!("Starting nodes");
        for (_, node) in &self.nodes {
            node.lock().await.start(&ctx).await?;
        }

        info!("Starting network control server");
        let server =
            ControlServer::start(self.config.ports.control_port, self.nodes.clone(), ctx).await?;
        self.control = Some(server);
        Ok(())
    }

    /// Bring up only the control server (on `port`, 0 for ephemeral),
    /// without touching node processes.
    pub async fn start_control_server_on(&mut self, port: u16) -> Result<std::net::SocketAddr> {
        let ctx = self.context()?;
        let server = ControlServer::start(port, self.nodes.clone(), ctx).await?;
        let addr = server.local_addr();
        self.control = Some(server);
        Ok(addr)
    }

    /// Block until any tracked process (engine or sidecar) dies
    /// unexpectedly; returns `false` when that happens.
    pub async fn wait(&self) -> bool {
        loop {
            for (name, node) in &self.nodes {
                if let Some(death) = node.lock().await.first_dead_process() {
                    error!("Node {} {}", name, death);
                    return false;
                }
            }
            sleep(self.config.poll_interval()).await;
        }
    }

    /// Shut down the control server, stop every node, then best-effort
    /// reap leftover processes by binary name.
    pub async fn stop(&mut self) {
        if let Some(control) = self.control.take() {
            control.shutdown();
        }
        for (_, node) in &self.nodes {
            node.lock().await.stop();
        }
        if self.config.supervisor.kill_stale_on_start {
            self.kill_stale_processes();
        }
    }

    /// Name-matched `pkill` of anything a previous (possibly crashed)
    /// orchestrator left behind. Logs, never errors.
    fn kill_stale_processes(&self) {
        info!("Killing any existing processes");
        for name in self.config.stale_process_names() {
            match std::process::Command::new("pkill")
                .args(["-9", &name])
                .status()
            {
                // pkill exits 1 when nothing matched
                Ok(status) if status.success() || status.code() == Some(1) => {}
                Ok(status) => warn!("pkill {} exited with {}", name, status),
                Err(e) => warn!("pkill {} failed: {}", name, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BinariesConfig, ConsensusConfig, PathsConfig, PortsConfig, SupervisorConfig,
    };
    use crate::keys::MemoryKeyProvider;
    use crate::topology::MemberRef;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> OrchestratorConfig {
        let root = dir.path();
        let mut supervisor = SupervisorConfig::default();
        supervisor.kill_stale_on_start = false;
        OrchestratorConfig {
            ports: PortsConfig::default(),
            paths: PathsConfig {
                bin_dir: root.join("bin"),
                work_dir: root.join("work"),
                origin_block_dir: root.join("origin"),
            },
            binaries: BinariesConfig::default(),
            consensus: ConsensusConfig::default(),
            supervisor,
        }
    }

    fn test_network(dir: &TempDir) -> Network {
        Network::new(test_config(dir), Arc::new(MemoryKeyProvider::new()), None).unwrap()
    }

    #[test]
    fn test_new_wipes_work_dir() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        fs::create_dir_all(&config.paths.work_dir).unwrap();
        let stale = config.paths.work_dir.join("stale-file");
        fs::write(&stale, "leftover").unwrap();

        let _network = Network::new(config, Arc::new(MemoryKeyProvider::new()), None).unwrap();
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn test_dense5_ports_are_pairwise_distinct() {
        let dir = TempDir::new().unwrap();
        let mut network = test_network(&dir);
        network.apply_preset(NetworkPreset::Dense5).unwrap();

        let mut seen = HashSet::new();
        for name in network.node_names() {
            let node = network.get_node(&name).unwrap();
            let node = node.lock().await;
            assert!(seen.insert((
                node.client_port,
                node.peer_port,
                node.admin_port,
                node.admin_http_gateway_port,
            )));
        }
        assert_eq!(seen.len(), 5);
    }

    #[tokio::test]
    async fn test_dense5_quorums_are_3_of_4() {
        let dir = TempDir::new().unwrap();
        let mut network = test_network(&dir);
        network.apply_preset(NetworkPreset::Dense5).unwrap();

        for name in network.node_names() {
            let node = network.get_node(&name).unwrap();
            let node = node.lock().await;
            assert_eq!(node.peers.len(), 4);
            assert_eq!(node.quorum_set.threshold, 3);
            assert_eq!(node.quorum_set.members.len(), 4);
        }
    }

    #[tokio::test]
    async fn test_abc_peering_and_quorums() {
        let dir = TempDir::new().unwrap();
        let mut network = test_network(&dir);
        network.apply_preset(NetworkPreset::Abc).unwrap();

        let b = network.get_node("b").unwrap();
        let b = b.lock().await;
        assert_eq!(b.peers, vec![Peer::new("a"), Peer::new("c")]);
        assert!(b.peers.iter().all(|p| p.broadcast_consensus_msgs));

        // `a` only talks to `b`, yet still requires agreement from both
        // `b` and `c`.
        let a = network.get_node("a").unwrap();
        let a = a.lock().await;
        assert_eq!(a.peers, vec![Peer::new("b")]);
        assert_eq!(a.quorum_set.threshold, 2);
        assert_eq!(
            a.quorum_set.members,
            vec![MemberRef::from("b"), MemberRef::from("c")]
        );
    }

    #[tokio::test]
    async fn test_ring5b_has_one_silent_edge_per_node() {
        let dir = TempDir::new().unwrap();
        let mut network = test_network(&dir);
        network.apply_preset(NetworkPreset::Ring5b).unwrap();

        let one = network.get_node("1").unwrap();
        let one = one.lock().await;
        assert_eq!(
            one.peers,
            vec![Peer::non_broadcast("5"), Peer::new("2")]
        );
        assert_eq!(one.quorum_set, QuorumSet::of_nodes(1, &["2"]));
    }

    #[tokio::test]
    async fn test_ring5_broadcasts_both_ways() {
        let dir = TempDir::new().unwrap();
        let mut network = test_network(&dir);
        network.apply_preset(NetworkPreset::Ring5).unwrap();

        for name in network.node_names() {
            let node = network.get_node(&name).unwrap();
            let node = node.lock().await;
            assert_eq!(node.peers.len(), 2);
            assert!(node.peers.iter().all(|p| p.broadcast_consensus_msgs));
        }
    }

    #[test]
    fn test_get_node_unknown_is_none() {
        let dir = TempDir::new().unwrap();
        let mut network = test_network(&dir);
        network.apply_preset(NetworkPreset::Abc).unwrap();
        assert!(network.get_node("d").is_none());
    }

    #[tokio::test]
    async fn test_network_definition_for_abc() {
        let dir = TempDir::new().unwrap();
        let mut network = test_network(&dir);
        network.apply_preset(NetworkPreset::Abc).unwrap();
        let ctx = network.context().unwrap();

        let a = network.get_node("a").unwrap();
        let a = a.lock().await;
        let definition = a.network_definition(&ctx).unwrap();

        // One broadcast peer (b), one known peer (c), ledger sources only
        // from the direct peer.
        assert_eq!(definition.broadcast_peers.len(), 1);
        assert!(definition.broadcast_peers[0].contains(&format!(":{}", 3301)));
        assert!(definition.broadcast_peers[0].ends_with("broadcast-consensus-msgs=1"));
        assert_eq!(definition.known_peers.len(), 1);
        assert!(definition.known_peers[0].contains(&format!(":{}", 3302)));
        assert_eq!(definition.tx_source_urls.len(), 1);
        assert!(definition.tx_source_urls[0].starts_with("file://"));
        assert!(definition.tx_source_urls[0].contains("node-ledger-distribution-1"));
        assert_eq!(definition.quorum_set.members.len(), 2);
    }
}
