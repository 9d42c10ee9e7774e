use serde::{Deserialize, Serialize};

use crate::capacity::Capacity;
use crate::{ContractId, FarmId, NodeId, TwinId};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicConfig {
    #[serde(default)]
    pub ipv4: String,
    #[serde(default)]
    pub gw4: String,
    #[serde(default)]
    pub ipv6: String,
    #[serde(default)]
    pub gw6: String,
    #[serde(default)]
    pub domain: String,
}

/// What the directory knows about a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub farm_id: FarmId,
    pub twin_id: TwinId,
    pub total: Capacity,
    pub used: Capacity,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_config: Option<PublicConfig>,
}

impl NodeInfo {
    pub fn free(&self) -> Capacity {
        self.total.saturating_sub(&self.used)
    }

    pub fn has_public_ipv4(&self) -> bool {
        self.public_config
            .as_ref()
            .is_some_and(|cfg| !cfg.ipv4.is_empty())
    }

    pub fn has_domain(&self) -> bool {
        self.public_config
            .as_ref()
            .is_some_and(|cfg| !cfg.domain.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FarmPublicIp {
    pub ip: String,
    pub gateway: String,
    /// 0 when the address is free.
    #[serde(default)]
    pub contract_id: ContractId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FarmInfo {
    pub farm_id: FarmId,
    #[serde(default)]
    pub public_ips: Vec<FarmPublicIp>,
}

impl FarmInfo {
    pub fn free_public_ips(&self) -> u32 {
        self.public_ips.iter().filter(|ip| ip.contract_id == 0).count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_ips_skip_reserved() {
        let farm = FarmInfo {
            farm_id: 1,
            public_ips: vec![
                FarmPublicIp { ip: "1.1.1.1/24".into(), gateway: "1.1.1.254".into(), contract_id: 0 },
                FarmPublicIp { ip: "1.1.1.2/24".into(), gateway: "1.1.1.254".into(), contract_id: 9 },
            ],
        };
        assert_eq!(farm.free_public_ips(), 1);
    }

    #[test]
    fn public_config_flags() {
        let mut node = NodeInfo {
            node_id: 1,
            farm_id: 1,
            twin_id: 11,
            total: Capacity::default(),
            used: Capacity::default(),
            public_config: None,
        };
        assert!(!node.has_public_ipv4());
        node.public_config = Some(PublicConfig {
            ipv4: "185.1.1.2/24".to_string(),
            ..PublicConfig::default()
        });
        assert!(node.has_public_ipv4());
        assert!(!node.has_domain());
    }
}
