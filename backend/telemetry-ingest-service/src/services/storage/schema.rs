//! CQL for the sensor table.
//!
//! Names are interpolated unquoted; `Config::validate` guarantees they are
//! plain identifiers.

use crate::config::CassandraConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replication {
    Simple { factor: u32 },
    NetworkTopology { datacenter: String, factor: u32 },
}

impl Replication {
    fn as_cql_map(&self) -> String {
        match self {
            Replication::Simple { factor } => format!(
                "{{'class': 'SimpleStrategy', 'replication_factor': {}}}",
                factor
            ),
            Replication::NetworkTopology { datacenter, factor } => format!(
                "{{'class': 'NetworkTopologyStrategy', '{}': {}}}",
                datacenter, factor
            ),
        }
    }
}

/// Keyspace, table and replication of the sensor readings store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorSchema {
    pub keyspace: String,
    pub table: String,
    pub replication: Replication,
}

impl SensorSchema {
    pub fn new(keyspace: impl Into<String>, table: impl Into<String>, replication: Replication) -> Self {
        Self {
            keyspace: keyspace.into(),
            table: table.into(),
            replication,
        }
    }

    pub fn from_config(config: &CassandraConfig) -> Self {
        let replication = match &config.local_datacenter {
            Some(dc) => Replication::NetworkTopology {
                datacenter: dc.clone(),
                factor: config.replication_factor,
            },
            None => Replication::Simple {
                factor: config.replication_factor,
            },
        };
        Self::new(config.keyspace.clone(), config.table.clone(), replication)
    }

    pub fn create_keyspace(&self) -> String {
        format!(
            "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = {}",
            self.keyspace,
            self.replication.as_cql_map()
        )
    }

    /// Partition by sensor, newest reading first inside a partition
    pub fn create_table(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {}.{} (\
             sensor_id text, \
             timestamp timestamp, \
             value double, \
             PRIMARY KEY (sensor_id, timestamp)\
             ) WITH CLUSTERING ORDER BY (timestamp DESC)",
            self.keyspace, self.table
        )
    }

    /// Insert against the session's current keyspace
    pub fn insert(&self) -> String {
        format!(
            "INSERT INTO {} (sensor_id, timestamp, value) VALUES (?, ?, ?)",
            self.table
        )
    }
}
