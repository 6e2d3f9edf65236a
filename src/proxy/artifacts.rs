use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use ethers::types::Bytes;
use serde::Deserialize;

use crate::errors::DeployError;

/// The parts of a compiled hardhat artifact this crate uses.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub contract_name: String,
    #[serde(default)]
    pub source_name: Option<String>,
    pub bytecode: Bytes,
    #[serde(default)]
    pub compiler_version: Option<String>,
    /// Solidity standard JSON input, submitted to the explorer for verification.
    #[serde(default)]
    pub standard_json_input: Option<serde_json::Value>,
}

pub trait ArtifactSource: Send + Sync {
    fn artifact(&self, name: &str) -> Result<Artifact, DeployError>;
}

/// `<dir>/<Name>.json`
pub struct ArtifactDir {
    dir: PathBuf,
}

impl ArtifactDir {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        ArtifactDir {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

impl ArtifactSource for ArtifactDir {
    fn artifact(&self, name: &str) -> Result<Artifact, DeployError> {
        let path = self.dir.join(format!("{name}.json"));
        let err = |reason: String| DeployError::Artifact {
            name: name.to_string(),
            reason,
        };
        let file = File::open(&path).map_err(|e| err(format!("{path:?}: {e}")))?;
        let artifact: Artifact = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| err(format!("{path:?}: {e}")))?;
        if artifact.bytecode.is_empty() {
            return Err(err("empty bytecode, is it an interface or abstract?".into()));
        }
        Ok(artifact)
    }
}

#[derive(Default)]
pub struct MemoryArtifacts {
    artifacts: HashMap<String, Artifact>,
}

impl MemoryArtifacts {
    pub fn insert(&mut self, name: &str, bytecode: Bytes) {
        self.artifacts.insert(
            name.to_string(),
            Artifact {
                contract_name: name.to_string(),
                source_name: Some(format!("contracts/{name}.sol")),
                bytecode,
                compiler_version: Some("v0.8.21+commit.d9974bed".to_string()),
                standard_json_input: Some(serde_json::json!({ "language": "Solidity" })),
            },
        );
    }
}

impl ArtifactSource for MemoryArtifacts {
    fn artifact(&self, name: &str) -> Result<Artifact, DeployError> {
        self.artifacts
            .get(name)
            .cloned()
            .ok_or_else(|| DeployError::Artifact {
                name: name.to_string(),
                reason: "unknown contract".to_string(),
            })
    }
}
