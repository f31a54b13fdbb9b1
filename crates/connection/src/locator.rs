//! Device locator
//!
//! Depth-first, pre-order search of the attached-device tree. A device is
//! compared before its own children are scanned, and the first match wins.
//! Nodes are visited at most once and hub nesting is bounded, so cyclic or
//! absurdly deep trees terminate.

use crate::identity::DeviceIdentity;
use crate::platform::{NodeId, UsbNode};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Hub nesting limit below the root
///
/// USB allows at most five tiers of external hubs; the margin leaves room
/// for virtual roots and test trees.
pub const MAX_HUB_DEPTH: usize = 16;

/// Find the first device in `root`'s subtree matching `identity`
///
/// `root` itself is not compared. Returns `None` when nothing matches.
pub fn find_device<N: UsbNode>(root: &N, identity: DeviceIdentity) -> Option<N> {
    let mut visited = HashSet::new();
    visited.insert(root.node_id());

    let found = search(root, identity, 0, &mut visited);
    match &found {
        Some(device) => debug!("Found device {} at node {:?}", identity, device.node_id()),
        None => debug!(
            "Device {} not found after visiting {} nodes",
            identity,
            visited.len()
        ),
    }
    found
}

fn search<N: UsbNode>(
    hub: &N,
    identity: DeviceIdentity,
    depth: usize,
    visited: &mut HashSet<NodeId>,
) -> Option<N> {
    if depth >= MAX_HUB_DEPTH {
        warn!(
            "Hub nesting deeper than {} at node {:?}, not descending",
            MAX_HUB_DEPTH,
            hub.node_id()
        );
        return None;
    }

    for device in hub.children() {
        if !visited.insert(device.node_id()) {
            debug!("Skipping already visited node {:?}", device.node_id());
            continue;
        }

        if device.identity() == Some(identity) {
            return Some(device);
        }

        if device.is_hub()
            && let Some(found) = search(&device, identity, depth + 1, visited)
        {
            return Some(found);
        }
    }

    None
}
