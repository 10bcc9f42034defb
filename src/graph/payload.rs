//! Graph response shapes. Nodes and edges reference each other by stable
//! string ids; the payload itself is a flat DAG of records.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
pub struct GraphMeta {
    pub device: String,
    pub device_label: String,
    pub src_kind: String,
    pub src_value: String,
    pub dst_kind: String,
    pub dst_value: String,
    pub time_from: DateTime<Utc>,
    pub time_to: DateTime<Utc>,
    pub view: String,
    pub dest_view: String,
    pub left_count: usize,
    pub right_count: usize,
    pub router_mac_rules: usize,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct Node {
    pub id: String,
    pub side: String,
    pub label: String,
    pub ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    pub seen_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct Edge {
    pub source_node_id: String,
    pub target_node_id: String,
    pub count_open: i64,
    pub count_close: i64,
    pub bytes_src_to_dst: i64,
    pub bytes_dst_to_src: i64,
    pub top_ports: BTreeMap<String, i64>,
    pub top_rules: BTreeMap<String, i64>,
    pub top_apps: BTreeMap<String, i64>,
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub top_services: Vec<ServiceSummary>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServiceSummary {
    pub proto: String,
    pub port: i32,
    pub app_name: Option<String>,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct RouterBucket {
    pub node_id: String,
    pub count: usize,
    pub hidden_nodes: Vec<Node>,
    pub hidden_edges: Vec<Edge>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceGroup {
    pub id: String,
    pub dest_if: String,
    pub dest_zone: String,
    pub label: String,
    pub local_devices: Vec<Node>,
    pub router: Option<RouterBucket>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServicePortNode {
    pub id: String,
    pub label: String,
    pub proto: String,
    pub port: i32,
    pub count: i64,
    pub dest_ip_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceAppNode {
    pub id: String,
    pub parent_port_id: String,
    pub label: String,
    pub proto: String,
    pub port: i32,
    pub app: Option<String>,
    pub count: i64,
    pub by_pair: Vec<PairCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairCount {
    pub source_label: String,
    pub dest_label: String,
    pub src_ip: String,
    pub dest_ip: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphResponse {
    pub meta: GraphMeta,
    pub left_nodes: Vec<Node>,
    pub interface_groups: Vec<InterfaceGroup>,
    pub service_port_nodes: Vec<ServicePortNode>,
    pub service_app_nodes: Vec<ServiceAppNode>,
    pub router_bucket_left: RouterBucket,
    pub edges: Vec<Edge>,
}

/// Keep only the `n` largest entries of a counting map.
pub fn retain_top_n(map: &mut BTreeMap<String, i64>, n: usize) {
    if map.len() <= n {
        return;
    }
    let mut entries: Vec<(String, i64)> = std::mem::take(map).into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(n);
    map.extend(entries);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retain_top_n_keeps_largest_with_stable_ties() {
        let mut map = BTreeMap::new();
        for (k, v) in [("a", 5), ("b", 9), ("c", 5), ("d", 1), ("e", 7), ("f", 3)] {
            map.insert(k.to_string(), v);
        }
        retain_top_n(&mut map, 3);
        assert_eq!(map.len(), 3);
        assert!(map.contains_key("b"));
        assert!(map.contains_key("e"));
        assert!(map.contains_key("a"), "tie broken lexicographically");
    }
}
