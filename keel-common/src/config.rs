use crate::error::{KeelError, Result};
use crate::types::ClusterConfig;
use std::fs;
use std::path::Path;

/// Loads a cluster configuration from a JSON file and validates it.
pub fn load_config(path: impl AsRef<Path>) -> Result<ClusterConfig> {
    let data = fs::read_to_string(path)?;
    let config: ClusterConfig = serde_json::from_str(&data)?;
    config.validate()?;
    Ok(config)
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min_ms == 0
            || self.election_timeout_min_ms >= self.election_timeout_max_ms
        {
            return Err(KeelError::Config(format!(
                "election timeout range {}..{} ms is empty",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.election_timeout_min_ms
        {
            return Err(KeelError::Config(format!(
                "heartbeat interval {} ms must be below the election timeout",
                self.heartbeat_interval_ms
            )));
        }
        if self.pipeline_capacity == 0 || self.max_append_batch == 0 {
            return Err(KeelError::Config(
                "pipeline capacity and append batch must be non-zero".into(),
            ));
        }
        if self.journal.max_segment_len == 0 {
            return Err(KeelError::Config("max_segment_len must be non-zero".into()));
        }
        if !self.nodes.is_empty() && !self.nodes.iter().any(|n| n.node_id == self.node_id) {
            return Err(KeelError::Config(format!(
                "node {} is not listed in the cluster",
                self.node_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JournalConfig, NodeId};
    use std::io::Write;

    #[test]
    fn test_load_config_from_file() {
        let id = NodeId::new_v4();
        let json = format!(
            r#"{{
                "node_id": "{id}",
                "nodes": [{{ "host": "127.0.0.1", "port": 7001, "node_id": "{id}" }}],
                "heartbeat_interval_ms": 20,
                "journal": {{ "directory": "/tmp/keel", "io_mode": "unbuffered" }}
            }}"#
        );
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.node_id, id);
        assert_eq!(config.heartbeat_interval_ms, 20);
        assert_eq!(config.election_timeout_range(), (150, 300));
        assert_eq!(config.journal.io_mode, crate::types::IoMode::Unbuffered);
    }

    #[test]
    fn test_validate_rejects_inverted_timeouts() {
        let mut config = ClusterConfig::new(NodeId::new_v4(), vec![], JournalConfig::new("/tmp"));
        config.election_timeout_min_ms = 300;
        config.election_timeout_max_ms = 300;

        assert!(matches!(config.validate(), Err(KeelError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_slow_heartbeat() {
        let mut config = ClusterConfig::new(NodeId::new_v4(), vec![], JournalConfig::new("/tmp"));
        config.heartbeat_interval_ms = 200;

        assert!(matches!(config.validate(), Err(KeelError::Config(_))));
    }
}
