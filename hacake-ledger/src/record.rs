use std::collections::BTreeMap;

use hacake_membership::NodeId;
use rkyv::{AlignedVec, Archive, Deserialize, Serialize};
use thiserror::Error;

/// The opaque configuration document passed to a deployable unit.
///
/// The document is a flat map of string keys to string values. Nested
/// structures must be encoded into a value by the caller, for example as a
/// JSON string, and are carried verbatim through deferral and failover.
pub type UnitConfig = BTreeMap<String, String>;

const SCRATCH_SPACE: usize = 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Failed to serialize entry.")]
    Serialize,

    #[error("Failed to deserialize entry: {0}")]
    Deserialize(String),
}

#[derive(Debug, Error)]
#[error("Invalid unit spec: {0}")]
/// The unit spec cannot be run by any driver.
pub struct InvalidSpec(pub String);

#[repr(C)]
#[derive(Serialize, Deserialize, Archive, Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug))]
/// The flavour of workload a deployment runs.
pub enum DeploymentKind {
    /// A packaged module, addressed by its module coordinate.
    Module,
    /// A standard verticle, addressed by its main entrypoint.
    Verticle,
    /// A verticle which runs on the worker pool.
    WorkerVerticle,
}

#[repr(C)]
#[derive(Serialize, Deserialize, Archive, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
/// Everything the local driver needs to start a unit.
///
/// The spec is copied verbatim when a unit is deferred, failed over or
/// redeployed after quorum is regained.
pub struct UnitSpec {
    pub kind: DeploymentKind,
    /// The module coordinate or verticle main.
    pub unit_name: String,
    /// Flat key-value configuration, see [UnitConfig].
    pub config: UnitConfig,
    /// The number of replicas, always positive.
    pub instances: u32,
    /// Only meaningful for [DeploymentKind::WorkerVerticle].
    pub multi_threaded: bool,
}

impl UnitSpec {
    fn new(kind: DeploymentKind, unit_name: impl Into<String>) -> Self {
        Self {
            kind,
            unit_name: unit_name.into(),
            config: UnitConfig::new(),
            instances: 1,
            multi_threaded: false,
        }
    }

    /// A spec for a module deployment.
    pub fn module(unit_name: impl Into<String>) -> Self {
        Self::new(DeploymentKind::Module, unit_name)
    }

    /// A spec for a verticle deployment.
    pub fn verticle(unit_name: impl Into<String>) -> Self {
        Self::new(DeploymentKind::Verticle, unit_name)
    }

    /// A spec for a worker verticle deployment.
    pub fn worker(unit_name: impl Into<String>, multi_threaded: bool) -> Self {
        let mut spec = Self::new(DeploymentKind::WorkerVerticle, unit_name);
        spec.multi_threaded = multi_threaded;
        spec
    }

    /// Set the number of instances to run.
    pub fn with_instances(mut self, instances: u32) -> Self {
        self.instances = instances;
        self
    }

    /// Replace the unit configuration.
    pub fn with_config(mut self, config: UnitConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a single configuration entry.
    pub fn with_config_entry(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Checks the spec describes something runnable.
    pub fn validate(&self) -> Result<(), InvalidSpec> {
        if self.unit_name.is_empty() {
            return Err(InvalidSpec("unit name must not be empty".to_string()));
        }

        if self.instances == 0 {
            return Err(InvalidSpec("instances must be positive".to_string()));
        }

        if self.multi_threaded && self.kind != DeploymentKind::WorkerVerticle {
            return Err(InvalidSpec(format!(
                "multi-threaded is only supported for worker verticles, got {:?}",
                self.kind
            )));
        }

        Ok(())
    }
}

#[repr(C)]
#[derive(Serialize, Deserialize, Archive, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
/// A single unit owned by a node.
pub struct DeploymentRecord {
    /// The caller chosen id, unique across the whole ledger.
    pub external_id: String,
    pub spec: UnitSpec,
    /// If the deployment is subject to quorum gating and failover.
    pub ha: bool,
    /// The handle returned by the owning node's driver.
    pub internal_id: String,
}

impl DeploymentRecord {
    pub fn new(
        external_id: impl Into<String>,
        spec: UnitSpec,
        ha: bool,
        internal_id: impl Into<String>,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            spec,
            ha,
            internal_id: internal_id.into(),
        }
    }
}

#[repr(C)]
#[derive(Serialize, Deserialize, Archive, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
/// The HA info a node publishes about itself.
///
/// Only the node identified by `node_id` ever writes this record, and
/// it is always written in full.
pub struct NodeRecord {
    pub node_id: NodeId,
    /// The HA group the node participates in.
    pub group: String,
    pub deployments: Vec<DeploymentRecord>,
}

impl NodeRecord {
    /// Creates a new record without any deployments.
    pub fn new(node_id: impl Into<NodeId>, group: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            group: group.into(),
            deployments: Vec::new(),
        }
    }

    /// Finds a deployment by its external id.
    pub fn find(&self, external_id: &str) -> Option<&DeploymentRecord> {
        self.deployments
            .iter()
            .find(|dep| dep.external_id == external_id)
    }

    #[inline]
    pub fn contains(&self, external_id: &str) -> bool {
        self.find(external_id).is_some()
    }

    /// Finds the external id of a deployment by the driver's internal id.
    pub fn external_id_of(&self, internal_id: &str) -> Option<&str> {
        self.deployments
            .iter()
            .find(|dep| dep.internal_id == internal_id)
            .map(|dep| dep.external_id.as_str())
    }

    /// Appends a deployment to the record.
    pub fn push(&mut self, deployment: DeploymentRecord) {
        self.deployments.push(deployment);
    }

    /// Removes a deployment by its external id, preserving the order of
    /// the remaining deployments.
    pub fn remove(&mut self, external_id: &str) -> Option<DeploymentRecord> {
        let pos = self
            .deployments
            .iter()
            .position(|dep| dep.external_id == external_id)?;
        Some(self.deployments.remove(pos))
    }

    /// All deployments which participate in quorum gating and failover.
    pub fn ha_deployments(&self) -> impl Iterator<Item = &DeploymentRecord> {
        self.deployments.iter().filter(|dep| dep.ha)
    }

    /// Serializes the record.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        rkyv::to_bytes::<_, SCRATCH_SPACE>(self)
            .map(|buf| buf.to_vec())
            .map_err(|_| CodecError::Serialize)
    }

    /// Deserializes and validates a record produced by [NodeRecord::to_bytes].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let aligned = aligned_copy(bytes);
        rkyv::from_bytes::<Self>(&aligned)
            .map_err(|e| CodecError::Deserialize(e.to_string()))
    }
}

/// Copies the buffer so the archive root is correctly aligned.
pub fn aligned_copy(bytes: &[u8]) -> AlignedVec {
    let mut aligned = AlignedVec::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);
    aligned
}
