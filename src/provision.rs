//! Per-run minting key material, token configuration documents and per-node
//! network definitions.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::keys::KeyProvider;
use crate::topology::ResolvedQuorumSet;

/// Fixed seed for the minting trust root. Intentionally static so test runs
/// are reproducible; never for production use. Matches the key the engine
/// builds into its test enclave.
pub const MINTING_TRUST_ROOT_SEED: &str =
    "abababababababababababababababababababababababababababababababab";

/// Fee floor for the auxiliary test tokens.
const AUX_TOKEN_FEE: u64 = 1024;

/// Governor and trust-root key material generated once per network run.
#[derive(Debug, Clone)]
pub struct MintingKeys {
    pub dir: PathBuf,
    pub governor1_pub: String,
    pub governor2_pub: String,
    pub trust_root_key: PathBuf,
}

impl MintingKeys {
    /// Create (or recreate) `minting-keys/` under the work dir: two
    /// independent governor keypairs plus the seeded trust root.
    pub fn generate(work_dir: &Path, keys: &dyn KeyProvider) -> Result<Self> {
        let dir = work_dir.join("minting-keys");
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;

        keys.generate_keypair(&dir.join("governor1"), &dir.join("governor1.pub"))?;
        keys.generate_keypair(&dir.join("governor2"), &dir.join("governor2.pub"))?;

        let trust_root_key = dir.join("minting-trust-root.pem");
        keys.generate_seeded_signing_key(MINTING_TRUST_ROOT_SEED, &trust_root_key)?;

        Ok(Self {
            governor1_pub: fs::read_to_string(dir.join("governor1.pub"))?,
            governor2_pub: fs::read_to_string(dir.join("governor2.pub"))?,
            trust_root_key,
            dir,
        })
    }
}

/// Tokens configuration document consumed by the engine's `--tokens` flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokensConfig {
    pub tokens: Vec<TokenEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token_id: u64,
    pub minimum_fee: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub governors: Option<Governors>,
}

/// An authorized signer set permitted to approve minting for a token id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Governors {
    pub signers: String,
    pub threshold: u32,
}

impl TokensConfig {
    /// The standard test-network layout: the native token with the node's
    /// minimum fee, plus two mintable tokens each governed 1-of-1 by its own
    /// governor key.
    pub fn for_node(minimum_fee: u64, minting: &MintingKeys) -> Self {
        Self {
            tokens: vec![
                TokenEntry {
                    token_id: 0,
                    minimum_fee,
                    governors: None,
                },
                TokenEntry {
                    token_id: 1,
                    minimum_fee: AUX_TOKEN_FEE,
                    governors: Some(Governors {
                        signers: minting.governor1_pub.clone(),
                        threshold: 1,
                    }),
                },
                TokenEntry {
                    token_id: 2,
                    minimum_fee: AUX_TOKEN_FEE,
                    governors: Some(Governors {
                        signers: minting.governor2_pub.clone(),
                        threshold: 1,
                    }),
                },
            ],
        }
    }

    /// Write the document, then countersign the governor sets in place with
    /// the trust-root key so the engine accepts them.
    pub fn write_signed(
        &self,
        path: &Path,
        minting: &MintingKeys,
        keys: &dyn KeyProvider,
    ) -> Result<()> {
        fs::write(path, serde_json::to_string(self)?)?;
        keys.sign_governors(path, &minting.trust_root_key)?;
        Ok(())
    }
}

/// Per-node resolved topology, written to `node<N>-network.json` on every
/// start so it always reflects the current peer set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkDefinition {
    pub quorum_set: ResolvedQuorumSet,
    pub broadcast_peers: Vec<String>,
    pub known_peers: Vec<String>,
    pub tx_source_urls: Vec<String>,
}

impl NetworkDefinition {
    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }
}
