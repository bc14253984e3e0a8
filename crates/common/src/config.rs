use serde::{Deserialize, Serialize};

/// Top-level server configuration, deserialized from ferrite.toml and
/// overlaid by command-line flags.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
}

/// Listener addresses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// RESP listener port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bind address for both listeners.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Admin HTTP port for /health and /metrics. 0 disables the endpoint.
    #[serde(default)]
    pub admin_port: u16,
}

/// RDB snapshot location. Read at startup, never written.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory containing the dump file. Exposed via `CONFIG GET dir`.
    #[serde(default = "default_dir")]
    pub dir: String,
    /// Dump file name. Exposed via `CONFIG GET dbfilename`.
    #[serde(default = "default_dbfilename")]
    pub dbfilename: String,
}

/// Replication role and tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Leader to follow. None means this server is the leader.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicaof: Option<ReplicaOf>,
    /// Whether resolving a WAIT adds the WAIT request's own byte length to
    /// the leader's replication offset. On by default for wire
    /// compatibility; disable for strict offset accounting.
    #[serde(default = "default_true")]
    pub wait_adds_own_length: bool,
}

/// Address of the leader a follower connects to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicaOf {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    /// Whether this server runs as the replication leader.
    pub fn is_leader(&self) -> bool {
        self.replication.replicaof.is_none()
    }

    /// Full path of the RDB dump file.
    pub fn rdb_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.storage.dir).join(&self.storage.dbfilename)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_addr: default_bind_addr(),
            admin_port: 0,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            dbfilename: default_dbfilename(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replicaof: None,
            wait_adds_own_length: default_true(),
        }
    }
}

fn default_port() -> u16 {
    6379
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_dir() -> String {
    ".".to_string()
}

fn default_dbfilename() -> String {
    "dump.rdb".to_string()
}

fn default_true() -> bool {
    true
}
