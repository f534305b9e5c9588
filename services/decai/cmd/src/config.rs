//! Configuration handling for the decai node.
//!
//! Settings come from a YAML file, then environment variables. A missing or
//! unparsable file leaves the defaults in place.

use anyhow::{Context, Result};
use decai_discovery::DiscoveryConfig;
use decai_wire::{DEFAULT_PROTOCOL_ID, MAX_FRAME_SIZE};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Peer id announced during negotiation
    pub peer_id: String,
    /// Address `serve` listens on
    pub listen: SocketAddr,
    /// Protocol id both sides must agree on
    pub protocol: String,
    /// Largest frame accepted or sent
    pub max_frame_size: usize,
    /// External prover
    pub engine: EngineConfig,
    /// Models by name
    pub models: BTreeMap<String, ModelPaths>,
    /// Advertisement and discovery timing
    pub discovery: DiscoveryConfig,
}

/// External prover settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Prover executable
    pub program: PathBuf,
    /// Extra arguments placed before every subcommand
    pub args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("decai-prover"),
            args: Vec::new(),
        }
    }
}

/// On-disk artifacts of one model
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelPaths {
    /// Compiled circuit; required to serve the model
    pub compiled: Option<PathBuf>,
    /// Circuit settings; required to verify outputs
    pub settings: Option<PathBuf>,
    /// Structured reference string sent with requests
    pub srs: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_id: "decai-node".to_string(),
            listen: SocketAddr::from(([0, 0, 0, 0], 10333)),
            protocol: DEFAULT_PROTOCOL_ID.to_string(),
            max_frame_size: MAX_FRAME_SIZE,
            engine: EngineConfig::default(),
            models: BTreeMap::new(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

/// Root of the YAML file
#[derive(Debug, Default, Deserialize)]
struct RootConfig {
    node: Option<NodeSection>,
    engine: Option<EngineSection>,
    models: Option<BTreeMap<String, ModelPaths>>,
    discovery: Option<DiscoverySection>,
}

#[derive(Debug, Deserialize)]
struct NodeSection {
    peer_id: Option<String>,
    listen: Option<String>,
    protocol: Option<String>,
    max_frame_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EngineSection {
    program: Option<PathBuf>,
    args: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct DiscoverySection {
    advertise_delay: Option<String>,
    discovery_delay: Option<String>,
    discovery_timeout: Option<String>,
    max_providers: Option<usize>,
}

impl NodeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = Self::default();

        match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    config.apply_root_config(root)?;
                    info!("Loaded configuration from {:?}", path);
                }
                Err(e) => warn!("Failed to parse config file {:?} ({}), using defaults", path, e),
            },
            Err(_) => warn!("Config file {:?} not found, using defaults", path),
        }

        config.apply_environment_overrides()?;

        info!(
            "Node configuration: peer_id={}, listen={}, protocol={}, models={}",
            config.peer_id,
            config.listen,
            config.protocol,
            config.models.len()
        );
        Ok(config)
    }

    fn apply_root_config(&mut self, root: RootConfig) -> Result<()> {
        if let Some(node) = root.node {
            if let Some(peer_id) = node.peer_id {
                self.peer_id = peer_id;
            }
            if let Some(listen) = node.listen {
                self.listen = parse_addr("node.listen", &listen)?;
            }
            if let Some(protocol) = node.protocol {
                self.protocol = protocol;
            }
            if let Some(max) = node.max_frame_size {
                self.max_frame_size = max.min(MAX_FRAME_SIZE);
            }
        }

        if let Some(engine) = root.engine {
            if let Some(program) = engine.program {
                self.engine.program = program;
            }
            if let Some(args) = engine.args {
                self.engine.args = args;
            }
        }

        if let Some(models) = root.models {
            self.models = models;
        }

        if let Some(discovery) = root.discovery {
            let target = &mut self.discovery;
            if let Some(value) = discovery.advertise_delay {
                target.advertise_delay = parse_duration("discovery.advertise_delay", &value)?;
            }
            if let Some(value) = discovery.discovery_delay {
                target.discovery_delay = parse_duration("discovery.discovery_delay", &value)?;
            }
            if let Some(value) = discovery.discovery_timeout {
                target.discovery_timeout = parse_duration("discovery.discovery_timeout", &value)?;
            }
            if let Some(max) = discovery.max_providers {
                target.max_providers = max;
            }
        }

        Ok(())
    }

    fn apply_environment_overrides(&mut self) -> Result<()> {
        if let Ok(peer_id) = std::env::var("DECAI_PEER_ID") {
            info!("Using DECAI_PEER_ID={}", peer_id);
            self.peer_id = peer_id;
        }
        if let Ok(listen) = std::env::var("DECAI_LISTEN") {
            info!("Using DECAI_LISTEN={}", listen);
            self.listen = parse_addr("DECAI_LISTEN", &listen)?;
        }
        if let Ok(protocol) = std::env::var("DECAI_PROTOCOL") {
            info!("Using DECAI_PROTOCOL={}", protocol);
            self.protocol = protocol;
        }
        if let Ok(program) = std::env::var("DECAI_PROVER") {
            info!("Using DECAI_PROVER={}", program);
            self.engine.program = PathBuf::from(program);
        }
        Ok(())
    }

    /// Paths for `model`
    pub fn model(&self, model: &str) -> Option<&ModelPaths> {
        self.models.get(model)
    }
}

fn parse_addr(key: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .with_context(|| format!("{}: invalid socket address {:?}", key, value))
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .with_context(|| format!("{}: invalid duration {:?}", key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(yaml: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_full_file() {
        let file = write_config(
            r#"
node:
  peer_id: server-1
  listen: 127.0.0.1:4001
  max_frame_size: 1048576
engine:
  program: /usr/local/bin/prover
  args: ["--quiet"]
models:
  mnist:
    compiled: models/mnist/network.compiled
    settings: models/mnist/settings.json
    srs: models/kzg14.srs
discovery:
  advertise_delay: 250ms
  discovery_timeout: 3s
  max_providers: 4
"#,
        );

        let mut config = NodeConfig::default();
        let content = std::fs::read_to_string(file.path()).unwrap();
        config
            .apply_root_config(serde_yaml::from_str(&content).unwrap())
            .unwrap();

        assert_eq!(config.peer_id, "server-1");
        assert_eq!(config.listen, "127.0.0.1:4001".parse().unwrap());
        assert_eq!(config.protocol, DEFAULT_PROTOCOL_ID);
        assert_eq!(config.max_frame_size, 1048576);
        assert_eq!(config.engine.program, PathBuf::from("/usr/local/bin/prover"));
        assert_eq!(config.engine.args, vec!["--quiet".to_string()]);

        let mnist = config.model("mnist").unwrap();
        assert_eq!(
            mnist.compiled.as_deref(),
            Some(Path::new("models/mnist/network.compiled"))
        );
        assert_eq!(mnist.srs.as_deref(), Some(Path::new("models/kzg14.srs")));

        assert_eq!(config.discovery.advertise_delay, Duration::from_millis(250));
        assert_eq!(config.discovery.discovery_delay, Duration::from_secs(1));
        assert_eq!(config.discovery.discovery_timeout, Duration::from_secs(3));
        assert_eq!(config.discovery.max_providers, 4);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = NodeConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert!(config.models.is_empty());
        assert_eq!(config.max_frame_size, MAX_FRAME_SIZE);
    }

    #[test]
    fn test_unparsable_file_uses_defaults() {
        let file = write_config("node: [this is not a map");
        let config = NodeConfig::load_from_file(file.path()).unwrap();
        assert!(config.models.is_empty());
    }

    #[test]
    fn test_invalid_values_are_errors() {
        let mut config = NodeConfig::default();
        let bad_addr: RootConfig = serde_yaml::from_str("node:\n  listen: nowhere\n").unwrap();
        assert!(config.apply_root_config(bad_addr).is_err());

        let bad_duration: RootConfig =
            serde_yaml::from_str("discovery:\n  discovery_delay: soon\n").unwrap();
        assert!(config.apply_root_config(bad_duration).is_err());
    }

    #[test]
    fn test_frame_size_is_capped() {
        let mut config = NodeConfig::default();
        let root: RootConfig =
            serde_yaml::from_str(&format!("node:\n  max_frame_size: {}\n", MAX_FRAME_SIZE * 2))
                .unwrap();
        config.apply_root_config(root).unwrap();
        assert_eq!(config.max_frame_size, MAX_FRAME_SIZE);
    }
}
