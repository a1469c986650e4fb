//! Typed stand-in for "the upstream neuron that publishes validator/miner
//! identities" (§1: explicitly an external collaborator, re-specified as an
//! interface only — not reimplemented).
//!
//! Grounded in the teacher's `ContainerCommand`/`MeshProvider` seam pattern
//! (§9 Design Notes): production wiring of the real blockchain client is out
//! of scope; this trait is the boundary an implementer plugs it in behind.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use tpn_common::{Result, ValidatorDescriptor};

/// What the core needs from the neuron: the current validator set and the
/// map of mining-pool uid → self-reported IP used by `score_mining_pools`
/// (§4.9) to filter to pools the chain actually recognizes.
#[async_trait]
pub trait NeuronClient: Send + Sync {
    async fn validators(&self) -> Result<Vec<ValidatorDescriptor>>;
    async fn miner_uid_to_ip(&self) -> Result<HashMap<String, IpAddr>>;
}

/// Reads a fixed validator/miner list from configuration. The default
/// implementation for nodes that have not wired a real neuron client.
pub struct StaticNeuronClient {
    validators: Vec<ValidatorDescriptor>,
    miner_uid_to_ip: HashMap<String, IpAddr>,
}

impl StaticNeuronClient {
    pub fn new(validators: Vec<ValidatorDescriptor>, miner_uid_to_ip: HashMap<String, IpAddr>) -> Self {
        Self { validators, miner_uid_to_ip }
    }

    pub fn empty() -> Self {
        Self {
            validators: Vec::new(),
            miner_uid_to_ip: HashMap::new(),
        }
    }
}

#[async_trait]
impl NeuronClient for StaticNeuronClient {
    async fn validators(&self) -> Result<Vec<ValidatorDescriptor>> {
        Ok(self.validators.clone())
    }

    async fn miner_uid_to_ip(&self) -> Result<HashMap<String, IpAddr>> {
        Ok(self.miner_uid_to_ip.clone())
    }
}

/// Backs `POST /protocol/broadcast/neurons` (§6): the neuron pushes its
/// current validator/miner identities to us instead of us polling it, so this
/// variant holds the last-pushed state behind a lock rather than reading
/// fixed configuration (§9 Design Notes "Global state → explicit registries").
pub struct PushedNeuronClient {
    validators: parking_lot::RwLock<Vec<ValidatorDescriptor>>,
    miner_uid_to_ip: parking_lot::RwLock<HashMap<String, IpAddr>>,
}

impl Default for PushedNeuronClient {
    fn default() -> Self {
        Self {
            validators: parking_lot::RwLock::new(Vec::new()),
            miner_uid_to_ip: parking_lot::RwLock::new(HashMap::new()),
        }
    }
}

impl PushedNeuronClient {
    pub fn update_validators(&self, validators: Vec<ValidatorDescriptor>) {
        *self.validators.write() = validators;
    }

    pub fn update_miner_map(&self, miners: HashMap<String, IpAddr>) {
        *self.miner_uid_to_ip.write() = miners;
    }
}

#[async_trait]
impl NeuronClient for PushedNeuronClient {
    async fn validators(&self) -> Result<Vec<ValidatorDescriptor>> {
        Ok(self.validators.read().clone())
    }

    async fn miner_uid_to_ip(&self) -> Result<HashMap<String, IpAddr>> {
        Ok(self.miner_uid_to_ip.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pushed_client_reflects_latest_update() {
        let client = PushedNeuronClient::default();
        client.update_validators(vec![ValidatorDescriptor { uid: Some(1), ip: "203.0.113.1".parse().unwrap() }]);
        let mut map = HashMap::new();
        map.insert("pool-a".to_string(), "203.0.113.9".parse().unwrap());
        client.update_miner_map(map.clone());

        assert_eq!(client.validators().await.unwrap().len(), 1);
        assert_eq!(client.miner_uid_to_ip().await.unwrap(), map);
    }

    #[tokio::test]
    async fn static_client_echoes_configured_state() {
        let mut map = HashMap::new();
        map.insert("pool-a".to_string(), "203.0.113.1".parse().unwrap());
        let client = StaticNeuronClient::new(vec![], map.clone());
        assert_eq!(client.miner_uid_to_ip().await.unwrap(), map);
        assert!(client.validators().await.unwrap().is_empty());
    }
}
