use super::*;
use crate::models::RouterMacRuleRow;
use chrono::TimeZone;

fn ts(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 12, minute, 0).unwrap()
}

fn flow(
    id: i64,
    src_ip: &str,
    src_mac: Option<&str>,
    dst_ip: &str,
    dst_port: i32,
    app: Option<&str>,
) -> FlowRow {
    FlowRow {
        id,
        device_key: "fw1".into(),
        proto: "TCP".into(),
        src_ip: src_ip.into(),
        src_port: 40000 + id as i32,
        dst_ip: dst_ip.into(),
        dst_port,
        open_ts: ts(5),
        close_ts: Some(ts(6)),
        bytes_orig: 100,
        bytes_term: 200,
        rule: Some("AllowOut".into()),
        app_name: app.map(str::to_string),
        src_zone: Some("trusted".into()),
        src_if: Some("lan".into()),
        dst_zone: Some("untrusted".into()),
        dst_if: Some("wan".into()),
        src_mac: src_mac.map(str::to_string),
        dst_mac: None,
        xlat_src_ip: None,
        xlat_src_port: None,
        xlat_dst_ip: None,
        xlat_dst_port: None,
        last_seen: ts(6),
    }
}

fn query(dest_view: DestView) -> GraphQuery {
    GraphQuery {
        device_key: "fw1".into(),
        src_kind: FilterKind::Zone,
        src_value: "trusted".into(),
        dst_kind: DstKind::Any,
        dst_value: String::new(),
        time_from: ts(0),
        time_to: ts(60),
        view: View::Original,
        dest_view,
    }
}

fn mac(n: u32) -> String {
    format!("AA-BB-CC-DD-{:02X}-{:02X}", n / 256, n % 256)
}

#[test]
fn empty_window_returns_empty_payload() {
    let mut q = query(DestView::Endpoints);
    q.time_to = q.time_from;
    let flows = vec![flow(1, "10.0.0.1", Some("AA-BB-CC-DD-EE-01"), "8.8.8.8", 443, None)];
    let out = build_graph(
        &q,
        "fw1".into(),
        &flows,
        &RouterMacRules::default(),
        &EndpointIndex::new(),
        ClassificationPrecedence::ZoneFirst,
    );
    assert!(out.left_nodes.is_empty());
    assert!(out.edges.is_empty());
    assert_eq!(out.meta.left_count, 0);
}

#[test]
fn dst_value_is_ignored_when_dst_kind_is_any() {
    let mut q = query(DestView::Endpoints);
    q.dst_value = "does-not-exist".into();
    let m = mac(1);
    let flows = vec![flow(1, "10.0.0.1", Some(&m), "8.8.8.8", 443, None)];
    let out = build_graph(
        &q,
        "fw1".into(),
        &flows,
        &RouterMacRules::default(),
        &EndpointIndex::new(),
        ClassificationPrecedence::ZoneFirst,
    );
    assert_eq!(out.left_nodes.len(), 1);
}

#[test]
fn non_matching_source_zone_is_dropped() {
    let mut q = query(DestView::Endpoints);
    q.src_value = "dmz".into();
    let m = mac(1);
    let flows = vec![flow(1, "10.0.0.1", Some(&m), "8.8.8.8", 443, None)];
    let out = build_graph(
        &q,
        "fw1".into(),
        &flows,
        &RouterMacRules::default(),
        &EndpointIndex::new(),
        ClassificationPrecedence::ZoneFirst,
    );
    assert!(out.left_nodes.is_empty());
    assert_eq!(out.router_bucket_left.count, 0);
}

#[test]
fn router_mac_rule_collapses_sources_into_left_bucket() {
    // Twenty source IPs all behind one router MAC.
    let shared = "AA-BB-CC-DD-EE-01";
    let flows: Vec<FlowRow> = (0..20)
        .map(|i| {
            flow(
                i,
                &format!("10.0.1.{i}"),
                Some(shared),
                "8.8.8.8",
                443,
                None,
            )
        })
        .collect();
    let rules = RouterMacRules::from_rows(&[RouterMacRuleRow {
        id: 1,
        device_key: "fw1".into(),
        mac: shared.into(),
        direction: "src".into(),
        created_at: ts(0),
    }]);
    let out = build_graph(
        &query(DestView::Endpoints),
        "fw1".into(),
        &flows,
        &rules,
        &EndpointIndex::new(),
        ClassificationPrecedence::ZoneFirst,
    );
    assert!(out.left_nodes.len() <= 9);
    // All flows share one MAC, so they merge into a single hidden identity
    // that still represents every hidden flow.
    assert!(out.router_bucket_left.count >= 1);
    let hidden_edge_total: i64 = out
        .router_bucket_left
        .hidden_edges
        .iter()
        .map(|e| e.count_open)
        .sum();
    assert_eq!(hidden_edge_total, 20);
    // The bucket rolls up into one visible edge toward the firewall.
    let bucket_edge = out
        .edges
        .iter()
        .find(|e| e.source_node_id == "router-left")
        .expect("router bucket edge");
    assert_eq!(bucket_edge.count_open, 20);
}

#[test]
fn left_column_caps_at_nine_individual_sources() {
    let macs: Vec<String> = (0..14).map(mac).collect();
    let flows: Vec<FlowRow> = (0..14)
        .map(|i| {
            flow(
                i,
                &format!("10.0.2.{i}"),
                Some(&macs[i as usize]),
                "8.8.8.8",
                443,
                None,
            )
        })
        .collect();
    let out = build_graph(
        &query(DestView::Endpoints),
        "fw1".into(),
        &flows,
        &RouterMacRules::default(),
        &EndpointIndex::new(),
        ClassificationPrecedence::ZoneFirst,
    );
    assert_eq!(out.left_nodes.len(), 9);
    assert_eq!(out.router_bucket_left.count, 5);
    // Every flow is accounted for between visible and hidden edges.
    let visible: i64 = out
        .edges
        .iter()
        .filter(|e| e.target_node_id == "fw")
        .map(|e| e.count_open)
        .sum();
    assert_eq!(visible, 14);
}

#[test]
fn macless_sources_are_hidden_from_left_column() {
    let m = mac(7);
    let flows = vec![
        flow(1, "10.0.0.1", None, "8.8.8.8", 443, None),
        flow(2, "10.0.0.2", Some(&m), "8.8.8.8", 443, None),
    ];
    let out = build_graph(
        &query(DestView::Endpoints),
        "fw1".into(),
        &flows,
        &RouterMacRules::default(),
        &EndpointIndex::new(),
        ClassificationPrecedence::ZoneFirst,
    );
    assert_eq!(out.left_nodes.len(), 1);
    assert_eq!(out.router_bucket_left.count, 1);
}

#[test]
fn interface_first_consults_interface_when_both_present() {
    let m = mac(1);
    // src_zone = "trusted", src_if = "lan" on every fixture flow.
    let flows = vec![flow(1, "10.0.0.1", Some(&m), "8.8.8.8", 443, None)];

    let mut q = query(DestView::Endpoints);
    q.src_kind = FilterKind::Interface;
    q.src_value = "lan".into();
    let out = build_graph(
        &q,
        "fw1".into(),
        &flows,
        &RouterMacRules::default(),
        &EndpointIndex::new(),
        ClassificationPrecedence::InterfaceFirst,
    );
    assert_eq!(out.left_nodes.len(), 1);

    // With zone precedence the zone is the consulted field, so the
    // interface name no longer matches.
    let out = build_graph(
        &q,
        "fw1".into(),
        &flows,
        &RouterMacRules::default(),
        &EndpointIndex::new(),
        ClassificationPrecedence::ZoneFirst,
    );
    assert!(out.left_nodes.is_empty());

    // And symmetrically, zone filtering loses under interface precedence.
    let mut q = query(DestView::Endpoints);
    q.src_value = "trusted".into();
    let out = build_graph(
        &q,
        "fw1".into(),
        &flows,
        &RouterMacRules::default(),
        &EndpointIndex::new(),
        ClassificationPrecedence::InterfaceFirst,
    );
    assert!(out.left_nodes.is_empty());
}

#[test]
fn group_key_and_label_do_not_depend_on_precedence() {
    let m = mac(1);
    let flows = vec![flow(1, "10.0.0.1", Some(&m), "8.8.8.8", 443, None)];

    let mut q = query(DestView::Endpoints);
    q.src_kind = FilterKind::Interface;
    q.src_value = "lan".into();
    let by_interface = build_graph(
        &q,
        "fw1".into(),
        &flows,
        &RouterMacRules::default(),
        &EndpointIndex::new(),
        ClassificationPrecedence::InterfaceFirst,
    );

    let q = query(DestView::Endpoints);
    let by_zone = build_graph(
        &q,
        "fw1".into(),
        &flows,
        &RouterMacRules::default(),
        &EndpointIndex::new(),
        ClassificationPrecedence::ZoneFirst,
    );

    assert_eq!(by_interface.interface_groups.len(), 1);
    assert_eq!(by_zone.interface_groups.len(), 1);
    let a = &by_interface.interface_groups[0];
    let b = &by_zone.interface_groups[0];
    assert_eq!(a.id, b.id);
    assert_eq!(a.label, "If: wan / Zone: untrusted");
    assert_eq!(b.label, "If: wan / Zone: untrusted");
}

#[test]
fn services_view_groups_ports_and_apps() {
    // Five https flows and three quic-proxy flows on TCP/443.
    let mut flows = Vec::new();
    for i in 0..5 {
        flows.push(flow(i, "10.0.0.5", Some(&mac(1)), "8.8.8.8", 443, Some("https")));
    }
    for i in 5..8 {
        flows.push(flow(i, "10.0.0.5", Some(&mac(1)), "8.8.8.8", 443, Some("quic-proxy")));
    }
    let out = build_graph(
        &query(DestView::Services),
        "fw1".into(),
        &flows,
        &RouterMacRules::default(),
        &EndpointIndex::new(),
        ClassificationPrecedence::ZoneFirst,
    );

    assert_eq!(out.service_port_nodes.len(), 1);
    let port = &out.service_port_nodes[0];
    assert_eq!(port.label, "TCP/443");
    assert_eq!(port.count, 8);

    assert_eq!(out.service_app_nodes.len(), 2);
    let by_label: HashMap<&str, i64> = out
        .service_app_nodes
        .iter()
        .map(|n| (n.label.as_str(), n.count))
        .collect();
    assert_eq!(by_label.get("https"), Some(&5));
    assert_eq!(by_label.get("quic-proxy"), Some(&3));
    for app in &out.service_app_nodes {
        assert_eq!(app.parent_port_id, port.id);
        assert!(!app.by_pair.is_empty());
        assert!(app.by_pair.len() <= 200);
    }
}

#[test]
fn missing_app_name_renders_as_dash() {
    let m = mac(1);
    let flows = vec![flow(1, "10.0.0.5", Some(&m), "8.8.8.8", 443, None)];
    let out = build_graph(
        &query(DestView::Services),
        "fw1".into(),
        &flows,
        &RouterMacRules::default(),
        &EndpointIndex::new(),
        ClassificationPrecedence::ZoneFirst,
    );
    assert_eq!(out.service_app_nodes[0].label, "—");
    assert!(out.service_app_nodes[0].app.is_none());
}

#[test]
fn ha_union_merges_member_flows_into_one_topology() {
    // Identical flows reported by both HA members; union keeps aggregate
    // counts, no dedup.
    let m = mac(3);
    let mut fa = flow(1, "10.0.0.5", Some(&m), "8.8.8.8", 443, None);
    fa.device_key = "fw-a".into();
    let mut fb = flow(2, "10.0.0.5", Some(&m), "8.8.8.8", 443, None);
    fb.device_key = "fw-b".into();
    fb.src_port = fa.src_port;

    let mut q = query(DestView::Endpoints);
    q.device_key = "ha:fw".into();
    let out = build_graph(
        &q,
        "fw".into(),
        &[fa, fb],
        &RouterMacRules::default(),
        &EndpointIndex::new(),
        ClassificationPrecedence::ZoneFirst,
    );
    assert_eq!(out.left_nodes.len(), 1, "same endpoint merges across members");
    let edge = out
        .edges
        .iter()
        .find(|e| e.target_node_id == "fw")
        .unwrap();
    assert_eq!(edge.count_open, 2);
    assert_eq!(edge.bytes_src_to_dst, 200);
}

#[test]
fn translated_view_swaps_nat_addresses() {
    let m = mac(4);
    let mut f = flow(1, "10.0.0.5", Some(&m), "8.8.8.8", 443, None);
    f.xlat_dst_ip = Some("192.168.90.1".into());
    f.xlat_dst_port = Some(8443);

    let mut q = query(DestView::Services);
    q.view = View::Translated;
    let out = build_graph(
        &q,
        "fw1".into(),
        &[f],
        &RouterMacRules::default(),
        &EndpointIndex::new(),
        ClassificationPrecedence::ZoneFirst,
    );
    assert_eq!(out.service_port_nodes[0].port, 8443);
}

#[test]
fn edge_top_maps_keep_five_entries() {
    let m = mac(5);
    let flows: Vec<FlowRow> = (0..8)
        .map(|i| {
            let mut f = flow(i, "10.0.0.5", Some(&m), "8.8.8.8", 1000 + i as i32, None);
            f.rule = Some(format!("rule-{i}"));
            f
        })
        .collect();
    let out = build_graph(
        &query(DestView::Endpoints),
        "fw1".into(),
        &flows,
        &RouterMacRules::default(),
        &EndpointIndex::new(),
        ClassificationPrecedence::ZoneFirst,
    );
    let edge = out
        .edges
        .iter()
        .find(|e| e.target_node_id == "fw")
        .unwrap();
    assert_eq!(edge.top_ports.len(), 5);
    assert_eq!(edge.top_rules.len(), 5);
    assert!(edge.top_services.len() <= 5);
}

#[test]
fn endpoint_filter_matches_by_identity() {
    let m1 = mac(1);
    let m2 = mac(2);
    let flows = vec![
        flow(1, "10.0.0.5", Some(&m1), "8.8.8.8", 443, None),
        flow(2, "10.0.0.6", Some(&m2), "8.8.8.8", 443, None),
    ];
    let mut q = query(DestView::Endpoints);
    q.src_kind = FilterKind::Endpoint;
    q.src_value = classify::endpoint_id(Some(&m1), "10.0.0.5");
    let out = build_graph(
        &q,
        "fw1".into(),
        &flows,
        &RouterMacRules::default(),
        &EndpointIndex::new(),
        ClassificationPrecedence::ZoneFirst,
    );
    assert_eq!(out.left_nodes.len(), 1);
    assert_eq!(out.left_nodes[0].ip, "10.0.0.5");
}

#[test]
fn endpoint_index_applies_overrides_over_auto_fields() {
    let endpoints = vec![EndpointRow {
        id: 1,
        device_key: "fw1".into(),
        mac: "AA-BB-CC-DD-EE-01".into(),
        ip: "10.0.0.5".into(),
        first_seen: ts(0),
        last_seen: ts(1),
        seen_count: 12,
        auto_vendor: Some("AutoVendor".into()),
        auto_type: None,
        auto_os: Some("Linux".into()),
        auto_brand: None,
        auto_model: None,
        auto_hostname: Some("host-5".into()),
    }];
    let overrides = vec![EndpointOverrideRow {
        id: 1,
        device_key: "fw1".into(),
        mac: "AA-BB-CC-DD-EE-01".into(),
        vendor: Some("RealVendor".into()),
        type_name: None,
        os_name: None,
        brand: None,
        model: None,
        hostname: None,
        comment: Some("lab device".into()),
        updated_at: ts(2),
    }];
    let index = build_endpoint_index(&endpoints, &overrides);
    let info = index
        .get(&classify::endpoint_id(Some("AA-BB-CC-DD-EE-01"), "10.0.0.5"))
        .unwrap();
    assert_eq!(info.vendor.as_deref(), Some("RealVendor"));
    assert_eq!(info.os_name.as_deref(), Some("Linux"));
    assert_eq!(info.label, "host-5");
    assert_eq!(info.comment.as_deref(), Some("lab device"));
    assert_eq!(info.seen_count, 12);
}

#[test]
fn interface_groups_split_locals_from_routed_destinations() {
    let src = mac(1);
    let dst = mac(2);
    let mut local = flow(1, "10.0.0.5", Some(&src), "10.0.9.1", 443, None);
    local.dst_mac = Some(dst.clone());
    let remote = flow(2, "10.0.0.5", Some(&src), "8.8.8.8", 443, None);

    let out = build_graph(
        &query(DestView::Endpoints),
        "fw1".into(),
        &[local, remote],
        &RouterMacRules::default(),
        &EndpointIndex::new(),
        ClassificationPrecedence::ZoneFirst,
    );
    assert_eq!(out.interface_groups.len(), 1);
    let group = &out.interface_groups[0];
    assert_eq!(group.local_devices.len(), 1);
    let router = group.router.as_ref().expect("router bucket for remote dest");
    assert_eq!(router.count, 1);
    assert_eq!(out.meta.right_count, 2);
}

#[test]
fn deterministic_edge_ordering() {
    let macs: Vec<String> = (0..4).map(mac).collect();
    let flows: Vec<FlowRow> = (0..4)
        .map(|i| {
            flow(
                i,
                &format!("10.0.3.{i}"),
                Some(&macs[i as usize]),
                "8.8.8.8",
                443,
                None,
            )
        })
        .collect();
    let out = build_graph(
        &query(DestView::Endpoints),
        "fw1".into(),
        &flows,
        &RouterMacRules::default(),
        &EndpointIndex::new(),
        ClassificationPrecedence::ZoneFirst,
    );
    let pairs: Vec<(String, String)> = out
        .edges
        .iter()
        .map(|e| (e.source_node_id.clone(), e.target_node_id.clone()))
        .collect();
    let mut sorted = pairs.clone();
    sorted.sort();
    assert_eq!(pairs, sorted);
}
