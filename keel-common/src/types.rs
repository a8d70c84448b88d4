pub type NodeId = uuid::Uuid;
pub type CommandId = uuid::Uuid;
pub type Term = u64;
pub type LogIndex = u64;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
    pub node_id: NodeId,
}

/// How the journal hands bytes to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IoMode {
    /// Writes go through the OS page cache.
    #[default]
    Buffered,
    /// Write-through: every frame is padded to the volume's sector size.
    Unbuffered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    pub directory: PathBuf,
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
    #[serde(default = "default_max_segment_len")]
    pub max_segment_len: u64,
    #[serde(default)]
    pub io_mode: IoMode,
    #[serde(default = "default_true")]
    pub sync_on_write: bool,
    #[serde(default)]
    pub compression: bool,
}

impl JournalConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            file_prefix: default_file_prefix(),
            max_segment_len: default_max_segment_len(),
            io_mode: IoMode::default(),
            sync_on_write: true,
            compression: false,
        }
    }

    pub fn with_io_mode(mut self, io_mode: IoMode) -> Self {
        self.io_mode = io_mode;
        self
    }

    pub fn with_max_segment_len(mut self, max_segment_len: u64) -> Self {
        self.max_segment_len = max_segment_len;
        self
    }

    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub node_id: NodeId,
    pub nodes: Vec<NodeAddress>,
    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,
    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_pipeline_capacity")]
    pub pipeline_capacity: usize,
    #[serde(default = "default_max_append_batch")]
    pub max_append_batch: usize,
    pub journal: JournalConfig,
}

impl ClusterConfig {
    pub fn new(node_id: NodeId, nodes: Vec<NodeAddress>, journal: JournalConfig) -> Self {
        Self {
            node_id,
            nodes,
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            pipeline_capacity: default_pipeline_capacity(),
            max_append_batch: default_max_append_batch(),
            journal,
        }
    }

    /// Every member except this node.
    pub fn peers(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .map(|n| n.node_id)
            .filter(|id| *id != self.node_id)
            .collect()
    }

    pub fn election_timeout_range(&self) -> (u64, u64) {
        (self.election_timeout_min_ms, self.election_timeout_max_ms)
    }
}

fn default_file_prefix() -> String {
    "journal".to_string()
}

fn default_max_segment_len() -> u64 {
    64 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_election_timeout_min_ms() -> u64 {
    150
}

fn default_election_timeout_max_ms() -> u64 {
    300
}

fn default_heartbeat_interval_ms() -> u64 {
    50
}

fn default_pipeline_capacity() -> usize {
    1024
}

fn default_max_append_batch() -> usize {
    64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_address_serialization() {
        let node = NodeAddress {
            host: "127.0.0.1".into(),
            port: 8080,
            node_id: NodeId::new_v4(),
        };

        let json = serde_json::to_string(&node).unwrap();
        let deserialized: NodeAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(node.node_id, deserialized.node_id);
    }

    #[test]
    fn test_peers_excludes_self() {
        let me = NodeId::new_v4();
        let other = NodeId::new_v4();
        let nodes = [me, other]
            .iter()
            .enumerate()
            .map(|(i, id)| NodeAddress {
                host: "127.0.0.1".into(),
                port: 9000 + i as u16,
                node_id: *id,
            })
            .collect();

        let config = ClusterConfig::new(me, nodes, JournalConfig::new("/tmp/keel"));
        assert_eq!(config.peers(), vec![other]);
    }

    #[test]
    fn test_journal_config_defaults_from_json() {
        let json = r#"{ "directory": "/var/lib/keel" }"#;
        let config: JournalConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.file_prefix, "journal");
        assert_eq!(config.io_mode, IoMode::Buffered);
        assert!(config.sync_on_write);
        assert!(!config.compression);
    }
}
