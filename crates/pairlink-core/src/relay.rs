//! Deterministic relay selection
//!
//! Both peers run the same computation over the same node list, so they
//! converge on one relay without coordination. Distance is the absolute
//! difference between the local identity hash and the hash of each node
//! name (salted with an optional nonce), taken as 256-bit integers.

use crate::crypto::generic_hash;
use crate::error::{P2pError, P2pResult};

/// Built-in relay nodes, used when the configured list is empty.
pub const DEFAULT_RELAY_NODES: &[&str] = &["matrix.papers.tech", "matrix.tez.ie"];

/// Big-endian comparison; byte order equals numeric order for equal widths.
fn less_than(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a < b
}

/// Big-endian subtraction `a - b`, caller guarantees `a >= b`.
fn sub(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let mut borrow = 0u16;
    for i in (0..32).rev() {
        let lhs = a[i] as u16;
        let rhs = b[i] as u16 + borrow;
        if lhs >= rhs {
            out[i] = (lhs - rhs) as u8;
            borrow = 0;
        } else {
            out[i] = (lhs + 256 - rhs) as u8;
            borrow = 1;
        }
    }
    out
}

fn abs_diff(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    if less_than(a, b) {
        sub(b, a)
    } else {
        sub(a, b)
    }
}

/// Hash a node name salted with the nonce.
fn node_distance_hash(node: &str, nonce: &str) -> [u8; 32] {
    let mut input = Vec::with_capacity(node.len() + nonce.len());
    input.extend_from_slice(node.as_bytes());
    input.extend_from_slice(nonce.as_bytes());
    generic_hash(&input)
}

/// Select the node closest to `local_hash_hex` (a 32-byte hex hash).
///
/// Pure: no I/O, and equal inputs always yield the same node. Ties keep the
/// earlier entry. An empty `nodes` slice falls back to
/// [`DEFAULT_RELAY_NODES`].
pub fn select_relay<'a>(
    local_hash_hex: &str,
    nonce: &str,
    nodes: &'a [String],
) -> P2pResult<&'a str> {
    let decoded = hex::decode(local_hash_hex)
        .map_err(|_| P2pError::Identity("Local hash is not valid hex".to_string()))?;
    let local: [u8; 32] = decoded
        .try_into()
        .map_err(|_| P2pError::Identity("Local hash must be 32 bytes".to_string()))?;

    if nodes.is_empty() {
        // Defaults are static, so recurse once with the owned list.
        let defaults: Vec<String> = DEFAULT_RELAY_NODES.iter().map(|s| s.to_string()).collect();
        let chosen = select_relay(local_hash_hex, nonce, &defaults)?;
        let index = defaults
            .iter()
            .position(|n| n.as_str() == chosen)
            .unwrap_or(0);
        return Ok(DEFAULT_RELAY_NODES[index]);
    }

    let mut best: &'a str = &nodes[0];
    let mut best_distance = abs_diff(&local, &node_distance_hash(&nodes[0], nonce));

    for node in &nodes[1..] {
        let distance = abs_diff(&local, &node_distance_hash(node, nonce));
        if less_than(&distance, &best_distance) {
            best = node;
            best_distance = distance;
        }
    }

    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generic_hash_hex;

    fn nodes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_single_node_always_selected() {
        let list = nodes(&["matrix.papers.tech"]);
        for seed in [[0u8; 32], [1u8; 32], [0xAB; 32]] {
            let hash = generic_hash_hex(&seed);
            assert_eq!(select_relay(&hash, "", &list).unwrap(), "matrix.papers.tech");
        }
    }

    #[test]
    fn test_selection_is_idempotent() {
        let list = nodes(&["node-a.example", "node-b.example", "node-c.example"]);
        let hash = generic_hash_hex(b"some identity");
        let first = select_relay(&hash, "", &list).unwrap();
        for _ in 0..10 {
            assert_eq!(select_relay(&hash, "", &list).unwrap(), first);
        }
    }

    #[test]
    fn test_same_inputs_converge_across_callers() {
        // Two peers with the same list and the same target hash must agree.
        let list_a = nodes(&["node-a.example", "node-b.example"]);
        let list_b = nodes(&["node-a.example", "node-b.example"]);
        let hash = generic_hash_hex(b"target peer");
        assert_eq!(
            select_relay(&hash, "0", &list_a).unwrap(),
            select_relay(&hash, "0", &list_b).unwrap()
        );
    }

    #[test]
    fn test_nonce_changes_selection_space() {
        let list = nodes(&["node-a.example", "node-b.example", "node-c.example"]);
        let hash = generic_hash_hex(b"identity");
        // Selections for distinct nonces are independent computations; at
        // minimum they must each be stable.
        let for_zero = select_relay(&hash, "0", &list).unwrap();
        let for_one = select_relay(&hash, "1", &list).unwrap();
        assert_eq!(select_relay(&hash, "0", &list).unwrap(), for_zero);
        assert_eq!(select_relay(&hash, "1", &list).unwrap(), for_one);
    }

    #[test]
    fn test_empty_list_uses_defaults() {
        let hash = generic_hash_hex(b"anyone");
        let chosen = select_relay(&hash, "", &[]).unwrap();
        assert!(DEFAULT_RELAY_NODES.contains(&chosen));
    }

    #[test]
    fn test_rejects_malformed_hash() {
        let list = nodes(&["node-a.example"]);
        assert!(select_relay("zz", "", &list).is_err());
        assert!(select_relay("abcd", "", &list).is_err());
    }

    #[test]
    fn test_sub_with_borrow() {
        let mut a = [0u8; 32];
        a[30] = 1; // 256
        let mut b = [0u8; 32];
        b[31] = 1; // 1
        let diff = sub(&a, &b);
        assert_eq!(diff[31], 255);
        assert_eq!(diff[30], 0);
    }

    #[test]
    fn test_abs_diff_symmetric() {
        let a = generic_hash(b"a");
        let b = generic_hash(b"b");
        assert_eq!(abs_diff(&a, &b), abs_diff(&b, &a));
    }
}
