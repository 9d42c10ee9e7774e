//! Capacity feasibility check over a whole batch, run before any mutation.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use grid_clients::CapacityDirectory;
use grid_common::{Capacity, CapacityId, FarmId, NodeId, NodeInfo, PlannedDeployment};

use crate::error::CapacityError;
use crate::operator::ObservedDeployment;
use crate::util::bounded;

/// Fails if the desired deployments cannot all fit on their nodes once the
/// deployments they replace are released.
///
/// Free pools are shared across the batch: several deployments on one node or
/// farm are checked together.
pub async fn validate_capacity(
    cancel: &CancellationToken,
    directory: &dyn CapacityDirectory,
    timeout: Duration,
    old: &BTreeMap<CapacityId, ObservedDeployment>,
    new: &BTreeMap<CapacityId, PlannedDeployment>,
) -> Result<(), CapacityError> {
    for (capacity_id, planned) in new {
        if let Some(current) = old.get(capacity_id) {
            if current.node_id != planned.node_id {
                return Err(CapacityError::NodeMismatch {
                    capacity_id: *capacity_id,
                    old: current.node_id,
                    new: planned.node_id,
                });
            }
        }
    }

    let mut nodes: BTreeMap<NodeId, NodeInfo> = BTreeMap::new();
    let mut free_ips: BTreeMap<FarmId, u32> = BTreeMap::new();
    for planned in new.values() {
        if nodes.contains_key(&planned.node_id) {
            continue;
        }
        let node = bounded(cancel, timeout, directory.node(planned.node_id))
            .await
            .map_err(|e| CapacityError::Directory {
                what: format!("node {}", planned.node_id),
                source: e.into_anyhow(),
            })?;
        if !free_ips.contains_key(&node.farm_id) {
            let farm = bounded(cancel, timeout, directory.farm(node.farm_id))
                .await
                .map_err(|e| CapacityError::Directory {
                    what: format!("farm {}", node.farm_id),
                    source: e.into_anyhow(),
                })?;
            free_ips.insert(farm.farm_id, farm.free_public_ips());
        }
        nodes.insert(node.node_id, node);
    }

    let mut free: BTreeMap<NodeId, Capacity> =
        nodes.iter().map(|(id, node)| (*id, node.free())).collect();

    // Updates release what they currently hold before claiming the new footprint.
    for (capacity_id, current) in old {
        if !new.contains_key(capacity_id) {
            continue;
        }
        let Some(node) = nodes.get(&current.node_id) else {
            continue;
        };
        if let Some(pool) = free.get_mut(&current.node_id) {
            *pool += current.deployment.capacity();
        }
        if let Some(ips) = free_ips.get_mut(&node.farm_id) {
            *ips += current.public_ips;
        }
    }

    for (capacity_id, planned) in new {
        let node_id = planned.node_id;
        let Some(node) = nodes.get(&node_id) else {
            continue;
        };
        let deployment = &planned.deployment;
        let needed = deployment.capacity();
        let ips = deployment.public_ipv4_count();

        if let Some(current) = old.get(capacity_id) {
            if ips > current.public_ips {
                return Err(CapacityError::PublicIpIncrease {
                    capacity_id: *capacity_id,
                    old: current.public_ips,
                    new: ips,
                });
            }
        }

        for w in &deployment.workloads {
            if w.data.requires_public_ipv4() && !node.has_public_ipv4() {
                return Err(CapacityError::MissingIpv4 {
                    node_id,
                    workload: w.name.clone(),
                });
            }
            if w.data.requires_domain() && !node.has_domain() {
                return Err(CapacityError::MissingDomain {
                    node_id,
                    workload: w.name.clone(),
                });
            }
        }

        let pool = free.entry(node_id).or_default();
        if !pool.fits(&needed) {
            return Err(CapacityError::InsufficientCapacity {
                node_id,
                needed,
                free: *pool,
            });
        }
        *pool = pool.saturating_sub(&needed);

        let farm_free = free_ips.entry(node.farm_id).or_default();
        if *farm_free < ips {
            return Err(CapacityError::NotEnoughPublicIps {
                farm_id: node.farm_id,
                needed: ips,
                free: *farm_free,
            });
        }
        *farm_free -= ips;

        debug!(capacity_id, node_id, %needed, public_ips = ips, "capacity reserved");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use grid_clients::MemoryGrid;
    use grid_common::capacity::GIB;
    use grid_common::{
        Deployment, DiskData, FarmInfo, FarmPublicIp, GatewayNameData, PublicIpData, Workload,
        WorkloadData,
    };

    async fn grid() -> MemoryGrid {
        let grid = MemoryGrid::new();
        grid.add_farm(FarmInfo {
            farm_id: 1,
            public_ips: vec![FarmPublicIp {
                ip: "185.1.1.10/24".to_string(),
                gateway: "185.1.1.1".to_string(),
                contract_id: 0,
            }],
        })
        .await;
        grid.add_node(NodeInfo {
            node_id: 10,
            farm_id: 1,
            twin_id: 100,
            total: Capacity { cru: 4, mru: 8 * GIB, sru: 100 * GIB, hru: 0 },
            used: Capacity { cru: 0, mru: 0, sru: 50 * GIB, hru: 0 },
            public_config: None,
        })
        .await;
        grid
    }

    fn disk(size: u64) -> Deployment {
        Deployment::new(
            1,
            vec![Workload::new("d", WorkloadData::Disk(DiskData { size }))],
        )
    }

    fn planned(dl: Deployment) -> PlannedDeployment {
        PlannedDeployment::new(10, dl)
    }

    async fn check(
        grid: &MemoryGrid,
        old: &BTreeMap<CapacityId, ObservedDeployment>,
        new: &BTreeMap<CapacityId, PlannedDeployment>,
    ) -> Result<(), CapacityError> {
        let clients = grid.clients();
        validate_capacity(
            &CancellationToken::new(),
            clients.directory.as_ref(),
            Duration::from_secs(1),
            old,
            new,
        )
        .await
    }

    #[tokio::test]
    async fn batch_shares_the_free_pool() {
        let grid = grid().await;
        let one = BTreeMap::from([(1, planned(disk(30 * GIB)))]);
        check(&grid, &BTreeMap::new(), &one).await.unwrap();

        let two = BTreeMap::from([(1, planned(disk(30 * GIB))), (2, planned(disk(30 * GIB)))]);
        let err = check(&grid, &BTreeMap::new(), &two).await.unwrap_err();
        assert!(matches!(err, CapacityError::InsufficientCapacity { node_id: 10, .. }));
    }

    #[tokio::test]
    async fn update_gets_old_footprint_back() {
        let grid = grid().await;
        let old = BTreeMap::from([(
            1,
            ObservedDeployment {
                node_id: 10,
                public_ips: 0,
                deployment: disk(40 * GIB),
            },
        )]);
        let new = BTreeMap::from([(1, planned(disk(80 * GIB)))]);
        check(&grid, &old, &new).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_node_change_and_ip_growth() {
        let grid = grid().await;
        let current = ObservedDeployment {
            node_id: 10,
            public_ips: 0,
            deployment: disk(GIB),
        };
        let old = BTreeMap::from([(1, current)]);

        let moved = BTreeMap::from([(1, PlannedDeployment::new(11, disk(GIB)))]);
        assert!(matches!(
            check(&grid, &old, &moved).await,
            Err(CapacityError::NodeMismatch { old: 10, new: 11, .. })
        ));

        let ip = Workload::new("ip", WorkloadData::PublicIp(PublicIpData { v4: true, v6: false }));
        let grown = BTreeMap::from([(1, planned(Deployment::new(1, vec![ip])))]);
        assert!(matches!(
            check(&grid, &old, &grown).await,
            Err(CapacityError::PublicIpIncrease { old: 0, new: 1, .. })
        ));
    }

    #[tokio::test]
    async fn farm_ips_are_counted() {
        let grid = grid().await;
        let ip = |name: &str| {
            Workload::new(name, WorkloadData::PublicIp(PublicIpData { v4: true, v6: false }))
        };
        let one = BTreeMap::from([(1, planned(Deployment::new(1, vec![ip("a")])))]);
        check(&grid, &BTreeMap::new(), &one).await.unwrap();

        let two = BTreeMap::from([(1, planned(Deployment::new(1, vec![ip("a"), ip("b")])))]);
        assert!(matches!(
            check(&grid, &BTreeMap::new(), &two).await,
            Err(CapacityError::NotEnoughPublicIps { farm_id: 1, needed: 2, free: 1 })
        ));
    }

    #[tokio::test]
    async fn gateway_needs_public_config() {
        let grid = grid().await;
        let gw = Workload::new(
            "gw",
            WorkloadData::GatewayName(GatewayNameData {
                name: "app".to_string(),
                backends: vec!["http://10.1.2.2:8080".to_string()],
                tls_passthrough: false,
            }),
        );
        let new = BTreeMap::from([(1, planned(Deployment::new(1, vec![gw])))]);
        assert!(matches!(
            check(&grid, &BTreeMap::new(), &new).await,
            Err(CapacityError::MissingIpv4 { node_id: 10, .. })
        ));
    }

    #[tokio::test]
    async fn unknown_node_is_a_directory_error() {
        let grid = grid().await;
        let new = BTreeMap::from([(1, PlannedDeployment::new(99, disk(GIB)))]);
        assert!(matches!(
            check(&grid, &BTreeMap::new(), &new).await,
            Err(CapacityError::Directory { .. })
        ));
    }
}
