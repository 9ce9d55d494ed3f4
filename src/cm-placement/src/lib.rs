//! The Placement Policy Engine (§4.4): validates a `ReplicationInfo` against
//! a live tablet server set, and assigns Raft peers to satisfy it.

use cm_ts_manager::TsDescriptor;
use cm_types::{MemberType, PlacementBlock, PlacementInfo, ReplicationInfo, TsId};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlacementError {
    #[error(
        "placement block {cloud}.{region}.{zone} requires {required} live servers, only {available} available"
    )]
    InsufficientBlockCapacity {
        cloud: String,
        region: String,
        zone: String,
        required: u32,
        available: u32,
    },
    #[error("sum of placement block minimums ({sum}) exceeds num_replicas ({num_replicas})")]
    BlockMinimumsExceedTotal { sum: u32, num_replicas: u32 },
    #[error("not enough live servers to satisfy num_replicas={num_replicas} (have {available})")]
    InsufficientTotalCapacity { num_replicas: u32, available: u32 },
}

/// Validates a single placement-info against a live server set (§4.4):
/// every block must have at least `min_num_replicas` live servers matching
/// its cloud/region/zone, the sum of block minimums must not exceed
/// `num_replicas`, and there must be enough live servers overall.
pub fn validate_placement_info(
    info: &PlacementInfo,
    live_servers: &[TsDescriptor],
) -> Result<(), PlacementError> {
    let matching: Vec<&TsDescriptor> = live_servers
        .iter()
        .filter(|s| s.registration.placement_uuid == info.placement_uuid)
        .collect();

    let sum_minimums: u32 = info.placement_blocks.iter().map(|b| b.min_num_replicas).sum();
    if sum_minimums > info.num_replicas {
        return Err(PlacementError::BlockMinimumsExceedTotal {
            sum: sum_minimums,
            num_replicas: info.num_replicas,
        });
    }

    for block in &info.placement_blocks {
        let available = count_in_block(&matching, block);
        if available < block.min_num_replicas {
            return Err(PlacementError::InsufficientBlockCapacity {
                cloud: block.cloud.clone(),
                region: block.region.clone(),
                zone: block.zone.clone(),
                required: block.min_num_replicas,
                available,
            });
        }
    }

    if (matching.len() as u32) < info.num_replicas {
        return Err(PlacementError::InsufficientTotalCapacity {
            num_replicas: info.num_replicas,
            available: matching.len() as u32,
        });
    }

    Ok(())
}

/// Validates a full replication policy: the live placement and every
/// read-replica placement (§4.4).
pub fn validate_replication_info(
    info: &ReplicationInfo,
    live_servers: &[TsDescriptor],
) -> Result<(), PlacementError> {
    validate_placement_info(&info.live_replicas, live_servers)?;
    for read_replica in &info.read_replicas {
        validate_placement_info(read_replica, live_servers)?;
    }
    Ok(())
}

fn count_in_block(servers: &[&TsDescriptor], block: &PlacementBlock) -> u32 {
    servers
        .iter()
        .filter(|s| block.matches(&s.registration.cloud, &s.registration.region, &s.registration.zone))
        .count() as u32
}

/// Checks whether a server satisfies an as-yet-unmet block in `info`: used
/// by the balancer's "missing placement" phase (§4.5 a.1) to pick an
/// addition target.
pub fn server_satisfies_block(server: &TsDescriptor, block: &PlacementBlock) -> bool {
    block.matches(&server.registration.cloud, &server.registration.region, &server.registration.zone)
}

/// A peer assignment for one tablet's Raft group: which servers get VOTER
/// roles (from the live placement) and which get OBSERVER roles (from
/// read-replica placements) (§4.4 "Peer assignment").
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PeerAssignment {
    pub voters: Vec<TsId>,
    pub observers: Vec<TsId>,
}

/// Distributes VOTER peers across live placements and OBSERVER peers across
/// read-replica placements, respecting per-block minimums before filling
/// remainder capacity (§4.4).
pub fn assign_peers(
    info: &ReplicationInfo,
    live_servers: &[TsDescriptor],
) -> Result<PeerAssignment, PlacementError> {
    validate_replication_info(info, live_servers)?;

    let voters = assign_from_placement(&info.live_replicas, live_servers);
    let mut observers = Vec::new();
    for read_replica in &info.read_replicas {
        observers.extend(assign_from_placement(read_replica, live_servers));
    }
    Ok(PeerAssignment { voters, observers })
}

fn assign_from_placement(info: &PlacementInfo, live_servers: &[TsDescriptor]) -> Vec<TsId> {
    let matching: Vec<&TsDescriptor> = live_servers
        .iter()
        .filter(|s| s.registration.placement_uuid == info.placement_uuid)
        .collect();

    let mut chosen = Vec::new();
    let mut used = std::collections::BTreeSet::new();

    // Satisfy each block's minimum first.
    for block in &info.placement_blocks {
        let mut taken = 0;
        for server in &matching {
            if taken >= block.min_num_replicas {
                break;
            }
            if used.contains(&server.instance.permanent_uuid) {
                continue;
            }
            if server_satisfies_block(server, block) {
                used.insert(server.instance.permanent_uuid.clone());
                chosen.push(server.instance.permanent_uuid.clone());
                taken += 1;
            }
        }
    }

    // Fill remaining capacity from any unused matching server.
    for server in &matching {
        if chosen.len() as u32 >= info.num_replicas {
            break;
        }
        if used.contains(&server.instance.permanent_uuid) {
            continue;
        }
        used.insert(server.instance.permanent_uuid.clone());
        chosen.push(server.instance.permanent_uuid.clone());
    }

    chosen.truncate(info.num_replicas as usize);
    chosen
}

/// The member type a peer assignment implies for a given server (§4.4,
/// GLOSSARY): voters are live/synchronous, observers are read replicas.
pub fn member_type_for(assignment: &PeerAssignment, server: &TsId) -> Option<MemberType> {
    if assignment.voters.contains(server) {
        Some(MemberType::Voter)
    } else if assignment.observers.contains(server) {
        Some(MemberType::Observer)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_ts_manager::{Registration, TsInstance};
    use std::time::Instant;

    fn server(uuid: &str, cloud: &str, region: &str, zone: &str) -> TsDescriptor {
        TsDescriptor {
            instance: TsInstance {
                permanent_uuid: TsId(uuid.to_string()),
                instance_seqno: 1,
            },
            registration: Registration {
                rpc_addresses: vec![],
                cloud: cloud.into(),
                region: region.into(),
                zone: zone.into(),
                placement_uuid: String::new(),
            },
            last_heartbeat: Instant::now(),
            reported_tablets: Default::default(),
            has_reported_all_tablets: true,
            load: Default::default(),
        }
    }

    fn block(cloud: &str, region: &str, zone: &str, min: u32) -> PlacementBlock {
        PlacementBlock {
            cloud: cloud.into(),
            region: region.into(),
            zone: zone.into(),
            min_num_replicas: min,
        }
    }

    #[test]
    fn validates_sufficient_capacity() {
        let servers = vec![
            server("a", "aws", "us-east", "1a"),
            server("b", "aws", "us-east", "1b"),
            server("c", "aws", "us-east", "1c"),
        ];
        let info = PlacementInfo {
            num_replicas: 3,
            placement_blocks: vec![
                block("aws", "us-east", "1a", 1),
                block("aws", "us-east", "1b", 1),
            ],
            placement_uuid: String::new(),
        };
        assert!(validate_placement_info(&info, &servers).is_ok());
    }

    #[test]
    fn rejects_block_minimums_exceeding_total() {
        let info = PlacementInfo {
            num_replicas: 2,
            placement_blocks: vec![block("aws", "us-east", "1a", 2), block("aws", "us-east", "1b", 2)],
            placement_uuid: String::new(),
        };
        let err = validate_placement_info(&info, &[]).unwrap_err();
        assert!(matches!(err, PlacementError::BlockMinimumsExceedTotal { .. }));
    }

    #[test]
    fn rejects_insufficient_block_capacity() {
        let servers = vec![server("a", "aws", "us-east", "1a")];
        let info = PlacementInfo {
            num_replicas: 2,
            placement_blocks: vec![block("aws", "us-east", "1b", 1)],
            placement_uuid: String::new(),
        };
        let err = validate_placement_info(&info, &servers).unwrap_err();
        assert!(matches!(err, PlacementError::InsufficientBlockCapacity { .. }));
    }

    #[test]
    fn assigns_voters_respecting_block_minimums() {
        let servers = vec![
            server("a", "aws", "us-east", "1a"),
            server("b", "aws", "us-east", "1b"),
            server("c", "aws", "us-east", "1b"),
        ];
        let info = ReplicationInfo {
            live_replicas: PlacementInfo {
                num_replicas: 3,
                placement_blocks: vec![block("aws", "us-east", "1a", 1)],
                placement_uuid: String::new(),
            },
            read_replicas: vec![],
        };
        let assignment = assign_peers(&info, &servers).unwrap();
        assert_eq!(assignment.voters.len(), 3);
        assert!(assignment.voters.contains(&TsId("a".into())));
    }
}
