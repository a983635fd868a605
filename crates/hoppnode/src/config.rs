use anyhow::{Context, Result};
use hoppmesh_protocol::{NodeId, TransportKind};
use hoppmesh_routing::RouterConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(skip)]
    config_file_path: PathBuf,
    #[serde(skip)]
    pub data_directory: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub name: String,
    /// Advertise this node as a relay bot
    #[serde(default)]
    pub relay_bot: bool,
    /// Whether this node can reach the internet itself
    #[serde(default)]
    pub internet_access: bool,
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
}

fn default_status_interval() -> u64 {
    30
}

/// A statically known neighbor, re-announced on every discovery poll
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub name: String,
    pub transport: TransportKind,
    #[serde(default)]
    pub internet_access: bool,
    #[serde(default = "default_peer_trust")]
    pub trust: f64,
    #[serde(default = "default_link_reliability")]
    pub reliability: f64,
    /// Link bandwidth estimate in kbit/s
    #[serde(default = "default_link_bandwidth")]
    pub bandwidth: f64,
}

fn default_peer_trust() -> f64 {
    0.5
}

fn default_link_reliability() -> f64 {
    0.8
}

fn default_link_bandwidth() -> f64 {
    250.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardMethod {
    Email,
    Sms,
    Webhook,
    Satellite,
}

impl std::fmt::Display for ForwardMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ForwardMethod::Email => "email",
            ForwardMethod::Sms => "sms",
            ForwardMethod::Webhook => "webhook",
            ForwardMethod::Satellite => "satellite",
        };
        f.write_str(s)
    }
}

/// Simulated radio and gateway behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Probability that a single send is accepted (0.0-1.0)
    pub success_rate: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub forward_method: ForwardMethod,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            success_rate: 0.7,
            min_latency_ms: 20,
            max_latency_ms: 250,
            forward_method: ForwardMethod::Webhook,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(config_path: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(Self::default_config_path);
        let data_dir = data_dir.unwrap_or_else(Self::default_data_dir);

        if !config_path.exists() {
            anyhow::bail!(
                "Configuration file not found: {}\nRun with --init to create a new configuration",
                config_path.display()
            );
        }

        let contents =
            fs::read_to_string(&config_path).context("Failed to read configuration file")?;

        let mut config: Config =
            serde_yaml::from_str(&contents).context("Failed to parse configuration file")?;

        config.config_file_path = config_path;
        config.data_directory = data_dir;
        config.validate()?;

        Ok(config)
    }

    /// Create and save a new default configuration with a fresh node id
    pub fn create_default(config_path: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(Self::default_config_path);
        let data_dir = data_dir.unwrap_or_else(Self::default_data_dir);

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create configuration directory")?;
        }
        fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let id = hex::encode(rand::random::<[u8; 8]>());
        let config = Config {
            node: NodeConfig {
                name: format!("hopp-{}", &id[..8]),
                id,
                relay_bot: false,
                internet_access: false,
                status_interval_secs: default_status_interval(),
            },
            router: RouterConfig::default(),
            peers: Vec::new(),
            simulation: SimulationConfig::default(),
            logging: LoggingConfig::default(),
            config_file_path: config_path.clone(),
            data_directory: data_dir,
        };

        let yaml = serde_yaml::to_string(&config)?;
        fs::write(&config_path, yaml).context("Failed to write configuration file")?;

        Ok(config)
    }

    /// Reject values the node cannot start with
    pub fn validate(&self) -> Result<()> {
        NodeId::new(self.node.id.as_str()).context("Invalid node id")?;
        for peer in &self.peers {
            NodeId::new(peer.id.as_str())
                .with_context(|| format!("Invalid peer id for {}", peer.name))?;
            if peer.id == self.node.id {
                anyhow::bail!("Peer {} reuses the local node id", peer.name);
            }
        }
        if !(0.0..=1.0).contains(&self.simulation.success_rate) {
            anyhow::bail!(
                "simulation.success_rate must be within 0.0-1.0, got {}",
                self.simulation.success_rate
            );
        }
        if self.simulation.min_latency_ms > self.simulation.max_latency_ms {
            anyhow::bail!("simulation.min_latency_ms exceeds max_latency_ms");
        }
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    /// Directory holding messages waiting for a route
    pub fn outbox_dir(&self) -> PathBuf {
        self.data_directory.join("outbox")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_directory.join("ledger.bin")
    }

    fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hoppnode")
            .join("config.yaml")
    }

    fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hoppnode")
    }
}
