use async_trait::async_trait;
use hacake_ledger::{DeploymentKind, UnitSpec};

#[async_trait]
/// The local primitive which starts and stops units on this node.
///
/// Calls for different units may overlap.
pub trait DeploymentDriver: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Starts the unit described by `spec`, returning the node-local handle
    /// which is later passed to [DeploymentDriver::stop].
    async fn run(&self, spec: &UnitSpec) -> Result<String, Self::Error>;

    /// Stops a previously started unit.
    async fn stop(&self, internal_id: &str) -> Result<(), Self::Error>;

    /// Returns if units of the given kind may be redeployed on this node
    /// when their owner departs.
    fn supports_failover(&self, _kind: DeploymentKind) -> bool {
        true
    }
}
