//! The graph query engine: time window + filters in, two-sided topology out.

pub mod inspect;
pub mod payload;

use crate::classify::{self, EndpointClass, FlowSide, RouterMacRules};
use crate::cli::ClassificationPrecedence;
use crate::devices;
use crate::error::{Result, ServiceError};
use crate::models::{EndpointOverrideRow, EndpointRow, FlowRow, RouterMacRuleRow};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use payload::*;
use std::collections::{BTreeMap, HashMap, HashSet};

const LEFT_NODE_CAP: usize = 9;
const TOP_MAP_N: usize = 5;
const TOP_SERVICES_N: usize = 5;
const BY_PAIR_CAP: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Zone,
    Interface,
    Endpoint,
}

impl FilterKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "zone" => Some(Self::Zone),
            "interface" => Some(Self::Interface),
            "endpoint" => Some(Self::Endpoint),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zone => "zone",
            Self::Interface => "interface",
            Self::Endpoint => "endpoint",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DstKind {
    Zone,
    Interface,
    Endpoint,
    Any,
}

impl DstKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "zone" => Some(Self::Zone),
            "interface" => Some(Self::Interface),
            "endpoint" => Some(Self::Endpoint),
            "any" => Some(Self::Any),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zone => "zone",
            Self::Interface => "interface",
            Self::Endpoint => "endpoint",
            Self::Any => "any",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Original,
    Translated,
}

impl View {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "original" => Some(Self::Original),
            "translated" => Some(Self::Translated),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Original => "original",
            Self::Translated => "translated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestView {
    Endpoints,
    Services,
}

impl DestView {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "endpoints" => Some(Self::Endpoints),
            "services" => Some(Self::Services),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Endpoints => "endpoints",
            Self::Services => "services",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphQuery {
    pub device_key: String,
    pub src_kind: FilterKind,
    pub src_value: String,
    pub dst_kind: DstKind,
    pub dst_value: String,
    pub time_from: DateTime<Utc>,
    pub time_to: DateTime<Utc>,
    pub view: View,
    pub dest_view: DestView,
}

/// Labels and enrichment for one merged endpoint identity.
#[derive(Debug, Clone, Default)]
pub struct EndpointInfo {
    pub label: String,
    pub ip: String,
    pub mac: Option<String>,
    pub seen_count: i64,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub vendor: Option<String>,
    pub type_name: Option<String>,
    pub os_name: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub hostname: Option<String>,
    pub comment: Option<String>,
}

pub type EndpointIndex = HashMap<String, EndpointInfo>;

/// Merge endpoint inventory rows (possibly from several HA members) into an
/// identity-keyed index; overrides shadow auto fields.
pub fn build_endpoint_index(
    endpoints: &[EndpointRow],
    overrides: &[EndpointOverrideRow],
) -> EndpointIndex {
    let override_by_mac: HashMap<&str, &EndpointOverrideRow> = overrides
        .iter()
        .map(|row| (row.mac.as_str(), row))
        .collect();

    let mut index: EndpointIndex = HashMap::new();
    for ep in endpoints {
        let id = classify::endpoint_id(ep.mac_opt(), &ep.ip);
        let info = index.entry(id).or_default();
        info.seen_count = info.seen_count.saturating_add(ep.seen_count);
        if info.first_seen.map_or(true, |seen| ep.first_seen < seen) {
            info.first_seen = Some(ep.first_seen);
        }
        if info.last_seen.map_or(true, |seen| ep.last_seen > seen) {
            info.last_seen = Some(ep.last_seen);
        }
        if info.ip.is_empty() {
            info.ip = ep.ip.clone();
        }
        if info.mac.is_none() {
            info.mac = ep.mac_opt().map(str::to_string);
        }
        merge_field(&mut info.vendor, ep.auto_vendor.as_deref());
        merge_field(&mut info.type_name, ep.auto_type.as_deref());
        merge_field(&mut info.os_name, ep.auto_os.as_deref());
        merge_field(&mut info.brand, ep.auto_brand.as_deref());
        merge_field(&mut info.model, ep.auto_model.as_deref());
        merge_field(&mut info.hostname, ep.auto_hostname.as_deref());

        if let Some(ov) = ep.mac_opt().and_then(|mac| override_by_mac.get(mac)) {
            shadow_field(&mut info.vendor, ov.vendor.as_deref());
            shadow_field(&mut info.type_name, ov.type_name.as_deref());
            shadow_field(&mut info.os_name, ov.os_name.as_deref());
            shadow_field(&mut info.brand, ov.brand.as_deref());
            shadow_field(&mut info.model, ov.model.as_deref());
            shadow_field(&mut info.hostname, ov.hostname.as_deref());
            shadow_field(&mut info.comment, ov.comment.as_deref());
        }
    }
    for info in index.values_mut() {
        info.label = info
            .hostname
            .clone()
            .unwrap_or_else(|| info.ip.clone());
    }
    index
}

fn merge_field(slot: &mut Option<String>, value: Option<&str>) {
    if slot.is_none() {
        if let Some(v) = value.filter(|v| !v.is_empty()) {
            *slot = Some(v.to_string());
        }
    }
}

fn shadow_field(slot: &mut Option<String>, value: Option<&str>) {
    if let Some(v) = value.filter(|v| !v.is_empty()) {
        *slot = Some(v.to_string());
    }
}

struct Projected<'a> {
    src_ip: &'a str,
    dst_ip: &'a str,
    dst_port: i32,
    flow: &'a FlowRow,
}

fn project(flow: &FlowRow, view: View) -> Projected<'_> {
    match view {
        View::Original => Projected {
            src_ip: &flow.src_ip,
            dst_ip: &flow.dst_ip,
            dst_port: flow.dst_port,
            flow,
        },
        View::Translated => Projected {
            src_ip: flow.xlat_src_ip.as_deref().unwrap_or(&flow.src_ip),
            dst_ip: flow.xlat_dst_ip.as_deref().unwrap_or(&flow.dst_ip),
            dst_port: flow.xlat_dst_port.unwrap_or(flow.dst_port),
            flow,
        },
    }
}

/// Zone and interface names share a namespace on NetWall. When an event
/// carries both, the configured precedence picks which field is consulted
/// for matching; otherwise whichever is present is compared.
fn segment_matches(
    precedence: ClassificationPrecedence,
    value: &str,
    zone: Option<&str>,
    iface: Option<&str>,
) -> bool {
    classify::leading_field(precedence, zone, iface) == Some(value)
}

fn matches_src(
    p: &Projected<'_>,
    kind: FilterKind,
    value: &str,
    precedence: ClassificationPrecedence,
) -> bool {
    match kind {
        FilterKind::Zone | FilterKind::Interface => segment_matches(
            precedence,
            value,
            p.flow.src_zone.as_deref(),
            p.flow.src_if.as_deref(),
        ),
        FilterKind::Endpoint => {
            classify::endpoint_id(p.flow.src_mac.as_deref(), p.src_ip) == value
        }
    }
}

fn matches_dst(
    p: &Projected<'_>,
    kind: DstKind,
    value: &str,
    precedence: ClassificationPrecedence,
) -> bool {
    match kind {
        DstKind::Any => true,
        DstKind::Zone | DstKind::Interface => segment_matches(
            precedence,
            value,
            p.flow.dst_zone.as_deref(),
            p.flow.dst_if.as_deref(),
        ),
        DstKind::Endpoint => {
            classify::endpoint_id(p.flow.dst_mac.as_deref(), p.dst_ip) == value
        }
    }
}

#[derive(Default, Clone)]
struct EdgeAgg {
    count_open: i64,
    count_close: i64,
    bytes_src_to_dst: i64,
    bytes_dst_to_src: i64,
    ports: BTreeMap<String, i64>,
    rules: BTreeMap<String, i64>,
    apps: BTreeMap<String, i64>,
    services: HashMap<(String, i32, Option<String>), i64>,
    last_seen: Option<DateTime<Utc>>,
}

impl EdgeAgg {
    fn absorb(&mut self, p: &Projected<'_>) {
        let flow = p.flow;
        self.count_open = self.count_open.saturating_add(1);
        if flow.close_ts.is_some() {
            self.count_close = self.count_close.saturating_add(1);
        }
        self.bytes_src_to_dst = self.bytes_src_to_dst.saturating_add(flow.bytes_orig);
        self.bytes_dst_to_src = self.bytes_dst_to_src.saturating_add(flow.bytes_term);
        *self.ports.entry(p.dst_port.to_string()).or_insert(0) += 1;
        if let Some(rule) = flow.rule.as_deref() {
            *self.rules.entry(rule.to_string()).or_insert(0) += 1;
        }
        if let Some(app) = flow.app_name.as_deref() {
            *self.apps.entry(app.to_string()).or_insert(0) += 1;
        }
        *self
            .services
            .entry((flow.proto.clone(), p.dst_port, flow.app_name.clone()))
            .or_insert(0) += 1;
        if self.last_seen.map_or(true, |seen| flow.last_seen > seen) {
            self.last_seen = Some(flow.last_seen);
        }
    }

    fn merge(&mut self, other: &EdgeAgg) {
        self.count_open = self.count_open.saturating_add(other.count_open);
        self.count_close = self.count_close.saturating_add(other.count_close);
        self.bytes_src_to_dst = self.bytes_src_to_dst.saturating_add(other.bytes_src_to_dst);
        self.bytes_dst_to_src = self.bytes_dst_to_src.saturating_add(other.bytes_dst_to_src);
        for (k, v) in &other.ports {
            *self.ports.entry(k.clone()).or_insert(0) += v;
        }
        for (k, v) in &other.rules {
            *self.rules.entry(k.clone()).or_insert(0) += v;
        }
        for (k, v) in &other.apps {
            *self.apps.entry(k.clone()).or_insert(0) += v;
        }
        for (k, v) in &other.services {
            *self.services.entry(k.clone()).or_insert(0) += v;
        }
        if let Some(seen) = other.last_seen {
            if self.last_seen.map_or(true, |mine| seen > mine) {
                self.last_seen = Some(seen);
            }
        }
    }

    fn into_edge(mut self, source: &str, target: &str) -> Edge {
        retain_top_n(&mut self.ports, TOP_MAP_N);
        retain_top_n(&mut self.rules, TOP_MAP_N);
        retain_top_n(&mut self.apps, TOP_MAP_N);

        let mut services: Vec<ServiceSummary> = self
            .services
            .into_iter()
            .map(|((proto, port, app_name), count)| ServiceSummary {
                proto,
                port,
                app_name,
                count,
            })
            .collect();
        services.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.proto.cmp(&b.proto))
                .then_with(|| a.port.cmp(&b.port))
        });
        services.truncate(TOP_SERVICES_N);

        Edge {
            source_node_id: source.to_string(),
            target_node_id: target.to_string(),
            count_open: self.count_open,
            count_close: self.count_close,
            bytes_src_to_dst: self.bytes_src_to_dst,
            bytes_dst_to_src: self.bytes_dst_to_src,
            top_ports: self.ports,
            top_rules: self.rules,
            top_apps: self.apps,
            last_seen: self.last_seen,
            top_services: services,
        }
    }
}

fn make_node(
    id: &str,
    side: &str,
    mac: Option<&str>,
    ip: &str,
    index: &EndpointIndex,
    activity: i64,
) -> Node {
    let eid = classify::endpoint_id(mac, ip);
    let info = index.get(&eid);
    Node {
        id: id.to_string(),
        side: side.to_string(),
        label: info
            .map(|i| i.label.clone())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| ip.to_string()),
        ip: ip.to_string(),
        mac: mac.map(str::to_string),
        seen_count: info.map(|i| i.seen_count).unwrap_or(0).max(activity),
        vendor: info.and_then(|i| i.vendor.clone()),
        type_name: info.and_then(|i| i.type_name.clone()),
        os_name: info.and_then(|i| i.os_name.clone()),
        brand: info.and_then(|i| i.brand.clone()),
        model: info.and_then(|i| i.model.clone()),
        hostname: info.and_then(|i| i.hostname.clone()),
        comment: info.and_then(|i| i.comment.clone()),
    }
}

/// Assemble the graph payload from pre-fetched rows. Pure so reconstruction
/// semantics are testable without a database.
pub fn build_graph(
    query: &GraphQuery,
    device_label: String,
    flows: &[FlowRow],
    rules: &RouterMacRules,
    index: &EndpointIndex,
    precedence: ClassificationPrecedence,
) -> GraphResponse {
    let mut response = empty_response(query, device_label, rules.len());
    if query.time_from >= query.time_to {
        return response;
    }

    // Classify and filter flows once; everything downstream works on the
    // surviving projections.
    let mut matched: Vec<Projected<'_>> = Vec::new();
    for flow in flows {
        let p = project(flow, query.view);
        if !matches_src(&p, query.src_kind, &query.src_value, precedence) {
            continue;
        }
        if !matches_dst(&p, query.dst_kind, &query.dst_value, precedence) {
            continue;
        }
        matched.push(p);
    }

    // Left column: aggregate per source identity.
    let mut src_agg: HashMap<String, EdgeAgg> = HashMap::new();
    let mut src_meta: HashMap<String, (Option<String>, String)> = HashMap::new();
    let mut src_hidden: HashSet<String> = HashSet::new();
    for p in &matched {
        let class = classify::classify_side(rules, FlowSide::Source, p.flow.src_mac.as_deref(), p.src_ip);
        let sid = classify::endpoint_id(p.flow.src_mac.as_deref(), p.src_ip);
        if matches!(class, EndpointClass::Router) || p.flow.src_mac.is_none() {
            src_hidden.insert(sid.clone());
        }
        src_agg.entry(sid.clone()).or_default().absorb(p);
        src_meta
            .entry(sid)
            .or_insert_with(|| (p.flow.src_mac.clone(), p.src_ip.to_string()));
    }

    let activity_of = |sid: &str, agg: &EdgeAgg| -> i64 {
        index
            .get(sid)
            .map(|info| info.seen_count)
            .unwrap_or(0)
            .max(agg.count_open)
    };

    // Rank visible sources; overflow beyond the cap joins the router bucket.
    let mut visible: Vec<(String, i64)> = src_agg
        .iter()
        .filter(|(sid, _)| !src_hidden.contains(sid.as_str()))
        .map(|(sid, agg)| (sid.clone(), activity_of(sid, agg)))
        .collect();
    visible.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    for (sid, _) in visible.iter().skip(LEFT_NODE_CAP) {
        src_hidden.insert(sid.clone());
    }
    visible.truncate(LEFT_NODE_CAP);

    let mut left_nodes = Vec::new();
    for (sid, activity) in &visible {
        let (mac, ip) = src_meta.get(sid).cloned().unwrap_or((None, String::new()));
        let node_id = format!("left:{sid}");
        let mut node = make_node(&node_id, "left", mac.as_deref(), &ip, index, *activity);
        node.seen_count = *activity;
        left_nodes.push(node);
    }
    left_nodes.sort_by(|a, b| b.seen_count.cmp(&a.seen_count).then_with(|| a.id.cmp(&b.id)));

    // Left edges: visible source -> fw, hidden sources collapsed into the
    // router bucket with per-source hidden edges.
    let mut edges: Vec<Edge> = Vec::new();
    let mut router_left = RouterBucket {
        node_id: "router-left".to_string(),
        ..Default::default()
    };
    let mut router_left_agg = EdgeAgg::default();
    for (sid, agg) in &src_agg {
        let (mac, ip) = src_meta.get(sid).cloned().unwrap_or((None, String::new()));
        if src_hidden.contains(sid) {
            let node_id = format!("left:{sid}");
            router_left
                .hidden_nodes
                .push(make_node(&node_id, "left", mac.as_deref(), &ip, index, agg.count_open));
            router_left
                .hidden_edges
                .push(agg.clone().into_edge(&node_id, "fw"));
            router_left_agg.merge(agg);
        } else {
            edges.push(agg.clone().into_edge(&format!("left:{sid}"), "fw"));
        }
    }
    router_left.count = router_left.hidden_nodes.len();
    router_left
        .hidden_nodes
        .sort_by(|a, b| b.seen_count.cmp(&a.seen_count).then_with(|| a.id.cmp(&b.id)));
    router_left
        .hidden_edges
        .sort_by(|a, b| a.source_node_id.cmp(&b.source_node_id));
    if router_left.count > 0 {
        edges.push(router_left_agg.into_edge("router-left", "fw"));
    }

    match query.dest_view {
        DestView::Endpoints => {
            build_endpoints_side(&matched, rules, index, &mut response, &mut edges)
        }
        DestView::Services => build_services_side(&matched, index, &mut response, &mut edges),
    }

    edges.sort_by(|a, b| {
        a.source_node_id
            .cmp(&b.source_node_id)
            .then_with(|| a.target_node_id.cmp(&b.target_node_id))
    });

    response.meta.left_count = left_nodes.len();
    response.left_nodes = left_nodes;
    response.router_bucket_left = router_left;
    response.edges = edges;
    response
}

fn build_endpoints_side(
    matched: &[Projected<'_>],
    rules: &RouterMacRules,
    index: &EndpointIndex,
    response: &mut GraphResponse,
    edges: &mut Vec<Edge>,
) {
    struct Group {
        dest_if: String,
        dest_zone: String,
        locals: HashMap<String, (Option<String>, String, EdgeAgg)>,
        routed: HashMap<String, (Option<String>, String, EdgeAgg)>,
        agg: EdgeAgg,
    }

    let mut groups: HashMap<String, Group> = HashMap::new();
    for p in matched {
        let dest_if = p.flow.dst_if.clone().unwrap_or_default();
        let dest_zone = p.flow.dst_zone.clone().unwrap_or_default();
        let group_key = format!("{dest_if}|{dest_zone}");
        let group = groups.entry(group_key).or_insert_with(|| Group {
            dest_if: dest_if.clone(),
            dest_zone: dest_zone.clone(),
            locals: HashMap::new(),
            routed: HashMap::new(),
            agg: EdgeAgg::default(),
        });
        group.agg.absorb(p);

        let did = classify::endpoint_id(p.flow.dst_mac.as_deref(), p.dst_ip);
        let class =
            classify::classify_side(rules, FlowSide::Dest, p.flow.dst_mac.as_deref(), p.dst_ip);
        let is_local = p.flow.dst_mac.is_some() && !matches!(class, EndpointClass::Router);
        let bucket = if is_local {
            &mut group.locals
        } else {
            &mut group.routed
        };
        bucket
            .entry(did)
            .or_insert_with(|| (p.flow.dst_mac.clone(), p.dst_ip.to_string(), EdgeAgg::default()))
            .2
            .absorb(p);
    }

    let mut interface_groups = Vec::new();
    let mut right_count = 0usize;
    for (key, group) in groups {
        let ig_id = format!("ig-{}", sanitize_id(&key));
        let mut parts = Vec::new();
        if !group.dest_if.is_empty() {
            parts.push(format!("If: {}", group.dest_if));
        }
        if !group.dest_zone.is_empty() {
            parts.push(format!("Zone: {}", group.dest_zone));
        }
        let label = if parts.is_empty() {
            "unknown".to_string()
        } else {
            parts.join(" / ")
        };

        let mut local_devices: Vec<Node> = group
            .locals
            .iter()
            .map(|(did, (mac, ip, agg))| {
                make_node(&format!("right:{did}"), "right", mac.as_deref(), ip, index, agg.count_open)
            })
            .collect();
        local_devices.sort_by(|a, b| b.seen_count.cmp(&a.seen_count).then_with(|| a.id.cmp(&b.id)));
        right_count += local_devices.len() + group.routed.len();

        let router = if group.routed.is_empty() {
            None
        } else {
            let router_node_id = format!("router-{ig_id}");
            let mut hidden_nodes = Vec::new();
            let mut hidden_edges = Vec::new();
            let mut router_agg = EdgeAgg::default();
            for (did, (mac, ip, agg)) in &group.routed {
                let node_id = format!("right:{did}");
                hidden_nodes.push(make_node(&node_id, "right", mac.as_deref(), ip, index, agg.count_open));
                hidden_edges.push(agg.clone().into_edge(&router_node_id, &node_id));
                router_agg.merge(agg);
            }
            hidden_nodes.sort_by(|a, b| b.seen_count.cmp(&a.seen_count).then_with(|| a.id.cmp(&b.id)));
            hidden_edges.sort_by(|a, b| a.target_node_id.cmp(&b.target_node_id));
            edges.push(router_agg.into_edge(&ig_id, &router_node_id));
            Some(RouterBucket {
                node_id: router_node_id,
                count: group.routed.len(),
                hidden_nodes,
                hidden_edges,
            })
        };

        edges.push(group.agg.clone().into_edge("fw", &ig_id));
        interface_groups.push(InterfaceGroup {
            id: ig_id,
            dest_if: group.dest_if,
            dest_zone: group.dest_zone,
            label,
            local_devices,
            router,
        });
    }

    interface_groups.sort_by(|a, b| {
        let a_activity: i64 = a.local_devices.iter().map(|n| n.seen_count).sum();
        let b_activity: i64 = b.local_devices.iter().map(|n| n.seen_count).sum();
        b_activity
            .cmp(&a_activity)
            .then_with(|| a.id.cmp(&b.id))
    });

    response.meta.right_count = right_count;
    response.interface_groups = interface_groups;
}

fn build_services_side(
    matched: &[Projected<'_>],
    index: &EndpointIndex,
    response: &mut GraphResponse,
    edges: &mut Vec<Edge>,
) {
    struct SvcAgg {
        count: i64,
        bytes_src_to_dst: i64,
        bytes_dst_to_src: i64,
        dest_ips: HashSet<String>,
        by_pair: HashMap<(String, String), i64>,
    }

    let mut svc: HashMap<(String, i32, Option<String>), SvcAgg> = HashMap::new();
    for p in matched {
        let key = (p.flow.proto.clone(), p.dst_port, p.flow.app_name.clone());
        let entry = svc.entry(key).or_insert_with(|| SvcAgg {
            count: 0,
            bytes_src_to_dst: 0,
            bytes_dst_to_src: 0,
            dest_ips: HashSet::new(),
            by_pair: HashMap::new(),
        });
        entry.count = entry.count.saturating_add(1);
        entry.bytes_src_to_dst = entry.bytes_src_to_dst.saturating_add(p.flow.bytes_orig);
        entry.bytes_dst_to_src = entry.bytes_dst_to_src.saturating_add(p.flow.bytes_term);
        entry.dest_ips.insert(p.dst_ip.to_string());
        let sid = classify::endpoint_id(p.flow.src_mac.as_deref(), p.src_ip);
        let did = classify::endpoint_id(p.flow.dst_mac.as_deref(), p.dst_ip);
        *entry.by_pair.entry((sid, did)).or_insert(0) += 1;
    }

    // Port level rollup.
    let mut ports: HashMap<(String, i32), (i64, HashSet<String>, i64, i64)> = HashMap::new();
    for ((proto, port, _), agg) in &svc {
        let entry = ports
            .entry((proto.clone(), *port))
            .or_insert_with(|| (0, HashSet::new(), 0, 0));
        entry.0 += agg.count;
        entry.1.extend(agg.dest_ips.iter().cloned());
        entry.2 = entry.2.saturating_add(agg.bytes_src_to_dst);
        entry.3 = entry.3.saturating_add(agg.bytes_dst_to_src);
    }

    let mut service_port_nodes: Vec<ServicePortNode> = ports
        .iter()
        .map(|((proto, port), (count, dest_ips, _, _))| ServicePortNode {
            id: format!("svcport:{proto}:{port}"),
            label: format!("{proto}/{port}"),
            proto: proto.clone(),
            port: *port,
            count: *count,
            dest_ip_count: dest_ips.len(),
        })
        .collect();
    service_port_nodes.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.id.cmp(&b.id)));

    for ((proto, port), (count, _, s2d, d2s)) in &ports {
        let port_id = format!("svcport:{proto}:{port}");
        edges.push(Edge {
            source_node_id: "fw".to_string(),
            target_node_id: port_id,
            count_open: *count,
            bytes_src_to_dst: *s2d,
            bytes_dst_to_src: *d2s,
            ..Default::default()
        });
    }

    let label_of = |eid: &str| -> String {
        index
            .get(eid)
            .map(|info| info.label.clone())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| eid.to_string())
    };
    let ip_of = |eid: &str| -> String {
        index
            .get(eid)
            .map(|info| info.ip.clone())
            .unwrap_or_default()
    };

    let mut service_app_nodes = Vec::new();
    for ((proto, port, app), agg) in svc {
        let app_key = app.clone().unwrap_or_else(|| "-".to_string());
        let port_id = format!("svcport:{proto}:{port}");
        let app_id = format!("svcapp:{proto}:{port}:{app_key}");

        let mut pairs: Vec<((String, String), i64)> = agg.by_pair.into_iter().collect();
        pairs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        pairs.truncate(BY_PAIR_CAP);
        let by_pair = pairs
            .into_iter()
            .map(|((sid, did), count)| PairCount {
                source_label: label_of(&sid),
                dest_label: label_of(&did),
                src_ip: ip_of(&sid),
                dest_ip: ip_of(&did),
                count,
            })
            .collect();

        edges.push(Edge {
            source_node_id: port_id.clone(),
            target_node_id: app_id.clone(),
            count_open: agg.count,
            bytes_src_to_dst: agg.bytes_src_to_dst,
            bytes_dst_to_src: agg.bytes_dst_to_src,
            ..Default::default()
        });
        service_app_nodes.push(ServiceAppNode {
            id: app_id,
            parent_port_id: port_id,
            label: app.clone().unwrap_or_else(|| "—".to_string()),
            proto,
            port,
            app,
            count: agg.count,
            by_pair,
        });
    }
    service_app_nodes.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.id.cmp(&b.id)));

    response.meta.right_count = service_port_nodes.len() + service_app_nodes.len();
    response.service_port_nodes = service_port_nodes;
    response.service_app_nodes = service_app_nodes;
}

fn sanitize_id(value: &str) -> String {
    let safe: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if safe.trim_matches('_').is_empty() {
        "unknown".to_string()
    } else {
        safe
    }
}

fn empty_response(query: &GraphQuery, device_label: String, rule_count: usize) -> GraphResponse {
    GraphResponse {
        meta: GraphMeta {
            device: query.device_key.clone(),
            device_label,
            src_kind: query.src_kind.as_str().to_string(),
            src_value: query.src_value.clone(),
            dst_kind: query.dst_kind.as_str().to_string(),
            dst_value: query.dst_value.clone(),
            time_from: query.time_from,
            time_to: query.time_to,
            view: query.view.as_str().to_string(),
            dest_view: query.dest_view.as_str().to_string(),
            left_count: 0,
            right_count: 0,
            router_mac_rules: rule_count,
        },
        left_nodes: Vec::new(),
        interface_groups: Vec::new(),
        service_port_nodes: Vec::new(),
        service_app_nodes: Vec::new(),
        router_bucket_left: RouterBucket {
            node_id: "router-left".to_string(),
            ..Default::default()
        },
        edges: Vec::new(),
    }
}

/// Fetch everything the assembly needs and build the response.
pub async fn execute(
    conn: &mut AsyncPgConnection,
    precedence: ClassificationPrecedence,
    query: &GraphQuery,
) -> Result<GraphResponse> {
    let members = devices::expand_device_key(conn, &query.device_key).await?;
    let device_label = devices::display_label(conn, &query.device_key).await?;

    let flows = fetch_flows(conn, &members, query.time_from, query.time_to).await?;
    let rules = fetch_rules(conn, &members).await?;
    let (endpoints, overrides) = fetch_endpoints(conn, &members).await?;
    let index = build_endpoint_index(&endpoints, &overrides);

    Ok(build_graph(
        query,
        device_label,
        &flows,
        &rules,
        &index,
        precedence,
    ))
}

async fn fetch_flows(
    conn: &mut AsyncPgConnection,
    members: &[String],
    time_from: DateTime<Utc>,
    time_to: DateTime<Utc>,
) -> Result<Vec<FlowRow>> {
    use crate::schema::flows::dsl as fl;
    if time_from >= time_to {
        return Ok(Vec::new());
    }
    let rows = fl::flows
        .filter(fl::device_key.eq_any(members))
        .filter(fl::open_ts.lt(time_to))
        .filter(fl::close_ts.ge(time_from).or(fl::close_ts.is_null()))
        .select(FlowRow::as_select())
        .load(conn)
        .await
        .map_err(ServiceError::from)?;
    Ok(rows)
}

async fn fetch_rules(
    conn: &mut AsyncPgConnection,
    members: &[String],
) -> Result<RouterMacRules> {
    use crate::schema::router_mac_rules::dsl as rm;
    let rows: Vec<RouterMacRuleRow> = rm::router_mac_rules
        .filter(rm::device_key.eq_any(members))
        .select(RouterMacRuleRow::as_select())
        .load(conn)
        .await?;
    Ok(RouterMacRules::from_rows(&rows))
}

async fn fetch_endpoints(
    conn: &mut AsyncPgConnection,
    members: &[String],
) -> Result<(Vec<EndpointRow>, Vec<EndpointOverrideRow>)> {
    use crate::schema::endpoint_overrides::dsl as eo;
    use crate::schema::endpoints::dsl as ep;
    let endpoints = ep::endpoints
        .filter(ep::device_key.eq_any(members))
        .select(EndpointRow::as_select())
        .load(conn)
        .await?;
    let overrides = eo::endpoint_overrides
        .filter(eo::device_key.eq_any(members))
        .select(EndpointOverrideRow::as_select())
        .load(conn)
        .await?;
    Ok((endpoints, overrides))
}

#[cfg(test)]
mod tests;
