//! Configuration management for the orchestrator

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub ports: PortsConfig,
    pub paths: PathsConfig,
    #[serde(default)]
    pub binaries: BinariesConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

/// Base ports; each node claims `base + index` on every channel.
#[derive(Debug, Clone, Deserialize)]
pub struct PortsConfig {
    #[serde(default = "default_base_client_port")]
    pub base_client_port: u16,
    #[serde(default = "default_base_peer_port")]
    pub base_peer_port: u16,
    #[serde(default = "default_base_admin_port")]
    pub base_admin_port: u16,
    #[serde(default = "default_base_admin_http_gateway_port")]
    pub base_admin_http_gateway_port: u16,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Directory holding the engine and sidecar binaries.
    pub bin_dir: PathBuf,
    /// Scratch directory for the whole network run. Wiped on construction.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Pre-built origin block the engine bootstraps its ledger from.
    pub origin_block_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BinariesConfig {
    #[serde(default = "default_consensus_bin")]
    pub consensus: String,
    #[serde(default = "default_ledger_distribution_bin")]
    pub ledger_distribution: String,
    #[serde(default = "default_admin_http_gateway_bin")]
    pub admin_http_gateway: String,
    #[serde(default = "default_mint_client_bin")]
    pub mint_client: String,
    #[serde(default = "default_seeded_keygen_bin")]
    pub seeded_keygen: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_block_version")]
    pub block_version: u32,
    #[serde(default = "default_minimum_fee")]
    pub minimum_fee: u64,
    /// Attestation placeholders; real values only matter on SGX hardware.
    #[serde(default = "default_ias_api_key")]
    pub ias_api_key: String,
    #[serde(default = "default_ias_spid")]
    pub ias_spid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_kill_stale")]
    pub kill_stale_on_start: bool,
    /// Extra process names reaped alongside the configured binaries.
    #[serde(default)]
    pub stale_process_names: Vec<String>,
    #[serde(default = "default_child_log_var")]
    pub child_log_var: String,
    #[serde(default = "default_child_log_filter")]
    pub child_log_filter: String,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            base_client_port: default_base_client_port(),
            base_peer_port: default_base_peer_port(),
            base_admin_port: default_base_admin_port(),
            base_admin_http_gateway_port: default_base_admin_http_gateway_port(),
            control_port: default_control_port(),
        }
    }
}

impl Default for BinariesConfig {
    fn default() -> Self {
        Self {
            consensus: default_consensus_bin(),
            ledger_distribution: default_ledger_distribution_bin(),
            admin_http_gateway: default_admin_http_gateway_bin(),
            mint_client: default_mint_client_bin(),
            seeded_keygen: default_seeded_keygen_bin(),
        }
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            block_version: default_block_version(),
            minimum_fee: default_minimum_fee(),
            ias_api_key: default_ias_api_key(),
            ias_spid: default_ias_spid(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            readiness_timeout_secs: default_readiness_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            kill_stale_on_start: default_kill_stale(),
            stale_process_names: Vec::new(),
            child_log_var: default_child_log_var(),
            child_log_filter: default_child_log_filter(),
        }
    }
}

impl OrchestratorConfig {
    pub fn client_port(&self, index: usize) -> u16 {
        self.ports.base_client_port + index as u16
    }

    pub fn peer_port(&self, index: usize) -> u16 {
        self.ports.base_peer_port + index as u16
    }

    pub fn admin_port(&self, index: usize) -> u16 {
        self.ports.base_admin_port + index as u16
    }

    pub fn admin_http_gateway_port(&self, index: usize) -> u16 {
        self.ports.base_admin_http_gateway_port + index as u16
    }

    pub fn binary_path(&self, name: &str) -> PathBuf {
        self.paths.bin_dir.join(name)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.supervisor.readiness_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.supervisor.poll_interval_ms)
    }

    /// Process names reaped by the best-effort stale cleanup.
    pub fn stale_process_names(&self) -> Vec<String> {
        let mut names = vec![
            self.binaries.consensus.clone(),
            self.binaries.ledger_distribution.clone(),
            self.binaries.admin_http_gateway.clone(),
        ];
        names.extend(self.supervisor.stale_process_names.iter().cloned());
        names
    }
}

/// Load the orchestrator config from `localnet.toml` in the working
/// directory, or from an explicit path. A missing file yields the compiled
/// defaults with `bin_dir`/`origin_block_dir` pointing at `./target/release`
/// style layouts, matching a source checkout.
pub fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig> {
    let path = path.unwrap_or_else(|| Path::new("localnet.toml"));
    let config_str = fs::read_to_string(path).unwrap_or_default();
    let config: OrchestratorConfig = if config_str.is_empty() {
        OrchestratorConfig {
            ports: PortsConfig::default(),
            paths: PathsConfig {
                bin_dir: PathBuf::from("target/release"),
                work_dir: default_work_dir(),
                origin_block_dir: PathBuf::from("target/sample_data/ledger"),
            },
            binaries: BinariesConfig::default(),
            consensus: ConsensusConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    } else {
        toml::from_str(&config_str).map_err(|e| OrchestratorError::Config(e.to_string()))?
    };

    // Validate critical values
    if config.paths.bin_dir.as_os_str().is_empty() {
        return Err(OrchestratorError::Config(
            "paths.bin_dir must be set".to_string(),
        ));
    }

    if config.paths.work_dir.as_os_str().is_empty() {
        return Err(OrchestratorError::Config(
            "paths.work_dir must be set".to_string(),
        ));
    }

    if config.supervisor.poll_interval_ms == 0 {
        return Err(OrchestratorError::Config(
            "supervisor.poll_interval_ms must be non-zero".to_string(),
        ));
    }

    Ok(config)
}

fn default_base_client_port() -> u16 {
    3200
}

fn default_base_peer_port() -> u16 {
    3300
}

fn default_base_admin_port() -> u16 {
    3400
}

fn default_base_admin_http_gateway_port() -> u16 {
    3500
}

fn default_control_port() -> u16 {
    31337
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("target/local-network")
}

fn default_consensus_bin() -> String {
    "consensus-service".to_string()
}

fn default_ledger_distribution_bin() -> String {
    "ledger-distribution".to_string()
}

fn default_admin_http_gateway_bin() -> String {
    "admin-http-gateway".to_string()
}

fn default_mint_client_bin() -> String {
    "consensus-mint-client".to_string()
}

fn default_seeded_keygen_bin() -> String {
    "seeded-ed25519-key-gen".to_string()
}

fn default_block_version() -> u32 {
    2
}

fn default_minimum_fee() -> u64 {
    400_000_000
}

fn default_ias_api_key() -> String {
    // 32 bytes of hex
    "0".repeat(64)
}

fn default_ias_spid() -> String {
    // 16 bytes of hex
    "0".repeat(32)
}

fn default_readiness_timeout_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_kill_stale() -> bool {
    true
}

fn default_child_log_var() -> String {
    "MC_LOG".to_string()
}

fn default_child_log_filter() -> String {
    "debug,rustls=warn,hyper=warn,mio=warn,h2=error,reqwest=error".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(work_dir: &Path, bin_dir: &Path) -> OrchestratorConfig {
        OrchestratorConfig {
            ports: PortsConfig::default(),
            paths: PathsConfig {
                bin_dir: bin_dir.to_path_buf(),
                work_dir: work_dir.to_path_buf(),
                origin_block_dir: bin_dir.join("origin"),
            },
            binaries: BinariesConfig::default(),
            consensus: ConsensusConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }

    #[test]
    fn test_port_assignment_is_deterministic() {
        let config = test_config(Path::new("/tmp/w"), Path::new("/tmp/b"));
        assert_eq!(config.client_port(0), 3200);
        assert_eq!(config.peer_port(3), 3303);
        assert_eq!(config.admin_port(4), 3404);
        assert_eq!(config.admin_http_gateway_port(1), 3501);
    }

    #[test]
    fn test_parse_partial_toml_fills_defaults() {
        let toml_str = r#"
            [paths]
            bin_dir = "/opt/engine/bin"
            origin_block_dir = "/opt/engine/origin"

            [supervisor]
            readiness_timeout_secs = 5
        "#;
        let config: OrchestratorConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.ports.base_client_port, 3200);
        assert_eq!(config.ports.control_port, 31337);
        assert_eq!(config.supervisor.readiness_timeout_secs, 5);
        assert_eq!(config.supervisor.poll_interval_ms, 1000);
        assert_eq!(config.consensus.block_version, 2);
        assert_eq!(config.consensus.minimum_fee, 400_000_000);
        assert_eq!(config.binaries.consensus, "consensus-service");
    }

    #[test]
    fn test_stale_names_include_binaries() {
        let mut config = test_config(Path::new("/tmp/w"), Path::new("/tmp/b"));
        config.supervisor.stale_process_names = vec!["filebeat".to_string()];
        let names = config.stale_process_names();
        assert!(names.contains(&"consensus-service".to_string()));
        assert!(names.contains(&"ledger-distribution".to_string()));
        assert!(names.contains(&"filebeat".to_string()));
    }
}
