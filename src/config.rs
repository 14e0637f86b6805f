//! Engine configuration.

use crate::error::{EngineError, Result};
use crate::naming::is_valid_identifier;
use serde::{Deserialize, Serialize};

/// Configuration of one versioned space.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Schema holding the space's tables.
    pub schema: String,

    /// Table of the main branch; branch tables derive their names from it.
    pub root_table: String,

    /// Space id forwarded to the changeset-query collaborator.
    pub space_id: String,

    /// Stream id used to correlate log lines of one request.
    pub stream_id: String,

    /// Max number of features per changeset page.
    /// Default: 1000
    pub page_size: usize,

    /// Number of partitions for new branch tables (None = unpartitioned).
    pub partitions: Option<u32>,

    /// Oldest version the history is guaranteed to retain, forwarded as the
    /// retention hint of changeset queries.
    pub retention_min_version: Option<u64>,

    /// Number of resolved branch paths kept in memory.
    /// Default: 256
    pub path_cache_size: usize,

    /// Max buffered events per subscriber before it is dropped.
    /// Default: 1000
    pub event_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            root_table: "space".to_string(),
            space_id: "space".to_string(),
            stream_id: String::new(),
            page_size: 1000,
            partitions: None,
            retention_min_version: None,
            path_cache_size: 256,
            event_buffer_size: 1000,
        }
    }
}

impl EngineConfig {
    /// Config for a space whose main table is `root_table` in `schema`.
    pub fn for_space(schema: impl Into<String>, root_table: impl Into<String>) -> Self {
        let root_table = root_table.into();
        Self {
            schema: schema.into(),
            space_id: root_table.clone(),
            root_table,
            ..Default::default()
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = Some(partitions);
        self
    }

    pub fn with_stream_id(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = stream_id.into();
        self
    }

    /// Check the config before an engine is built from it.
    pub fn validate(&self) -> Result<()> {
        if self.schema.is_empty() {
            return Err(EngineError::InvalidConfig("schema must not be empty".into()));
        }
        if !is_valid_identifier(&self.root_table) {
            return Err(EngineError::InvalidConfig(format!(
                "root table is not a plain identifier: {:?}",
                self.root_table
            )));
        }
        if self.page_size == 0 {
            return Err(EngineError::InvalidConfig("page size must be positive".into()));
        }
        if self.partitions == Some(0) {
            return Err(EngineError::InvalidConfig(
                "partition count must be positive when set".into(),
            ));
        }
        Ok(())
    }
}
