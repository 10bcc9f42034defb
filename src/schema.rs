//! Diesel schema definitions for the analyzer tables.

diesel::table! {
    use diesel::sql_types::*;

    raw_logs (id) {
        id -> Int8,
        device_key -> Text,
        received_at -> Timestamptz,
        raw_line -> Text,
        parse_status -> Text,
        parse_error -> Nullable<Text>,
        job_id -> Nullable<Uuid>,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    events (id) {
        id -> Int8,
        raw_log_id -> Int8,
        device_key -> Text,
        ts -> Timestamptz,
        event_kind -> Text,
        proto -> Text,
        src_ip -> Text,
        src_port -> Int4,
        dst_ip -> Text,
        dst_port -> Int4,
        src_zone -> Nullable<Text>,
        src_if -> Nullable<Text>,
        dst_zone -> Nullable<Text>,
        dst_if -> Nullable<Text>,
        src_mac -> Nullable<Text>,
        dst_mac -> Nullable<Text>,
        xlat_src_ip -> Nullable<Text>,
        xlat_src_port -> Nullable<Int4>,
        xlat_dst_ip -> Nullable<Text>,
        xlat_dst_port -> Nullable<Int4>,
        rule -> Nullable<Text>,
        app_name -> Nullable<Text>,
        bytes_orig -> Int8,
        bytes_term -> Int8,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    flows (id) {
        id -> Int8,
        device_key -> Text,
        proto -> Text,
        src_ip -> Text,
        src_port -> Int4,
        dst_ip -> Text,
        dst_port -> Int4,
        open_ts -> Timestamptz,
        close_ts -> Nullable<Timestamptz>,
        bytes_orig -> Int8,
        bytes_term -> Int8,
        rule -> Nullable<Text>,
        app_name -> Nullable<Text>,
        src_zone -> Nullable<Text>,
        src_if -> Nullable<Text>,
        dst_zone -> Nullable<Text>,
        dst_if -> Nullable<Text>,
        src_mac -> Nullable<Text>,
        dst_mac -> Nullable<Text>,
        xlat_src_ip -> Nullable<Text>,
        xlat_src_port -> Nullable<Int4>,
        xlat_dst_ip -> Nullable<Text>,
        xlat_dst_port -> Nullable<Int4>,
        last_seen -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    endpoints (id) {
        id -> Int8,
        device_key -> Text,
        mac -> Text,
        ip -> Text,
        first_seen -> Timestamptz,
        last_seen -> Timestamptz,
        seen_count -> Int8,
        auto_vendor -> Nullable<Text>,
        auto_type -> Nullable<Text>,
        auto_os -> Nullable<Text>,
        auto_brand -> Nullable<Text>,
        auto_model -> Nullable<Text>,
        auto_hostname -> Nullable<Text>,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    endpoint_overrides (id) {
        id -> Int8,
        device_key -> Text,
        mac -> Text,
        vendor -> Nullable<Text>,
        type_name -> Nullable<Text>,
        os_name -> Nullable<Text>,
        brand -> Nullable<Text>,
        model -> Nullable<Text>,
        hostname -> Nullable<Text>,
        comment -> Nullable<Text>,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    firewalls (device_key) {
        device_key -> Text,
        source_syslog -> Bool,
        source_import -> Bool,
        first_seen -> Nullable<Timestamptz>,
        last_seen -> Nullable<Timestamptz>,
        last_import_ts -> Nullable<Timestamptz>,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    firewall_overrides (device_key) {
        device_key -> Text,
        display_name -> Text,
        comment -> Nullable<Text>,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    ha_clusters (base) {
        base -> Text,
        label -> Text,
        members -> Jsonb,
        is_enabled -> Bool,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    router_mac_rules (id) {
        id -> Int8,
        device_key -> Text,
        mac -> Text,
        direction -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    ingest_jobs (id) {
        id -> Uuid,
        kind -> Text,
        status -> Text,
        phase -> Nullable<Text>,
        progress -> Float8,
        cancel_requested -> Bool,
        device_key -> Nullable<Text>,
        filename -> Nullable<Text>,
        bytes_total -> Int8,
        lines_total -> Int8,
        lines_processed -> Int8,
        parse_ok -> Int8,
        parse_err -> Int8,
        filtered_id -> Int8,
        raw_logs_inserted -> Int8,
        events_inserted -> Int8,
        time_min -> Nullable<Timestamptz>,
        time_max -> Nullable<Timestamptz>,
        device_detected -> Nullable<Text>,
        error_type -> Nullable<Text>,
        error_message -> Nullable<Text>,
        error_stage -> Nullable<Text>,
        result_counts -> Nullable<Jsonb>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        started_at -> Nullable<Timestamptz>,
        finished_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    settings (name) {
        name -> Text,
        value -> Jsonb,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    schema_migrations (name) {
        name -> Text,
        applied_at -> Timestamptz,
    }
}

diesel::joinable!(events -> raw_logs (raw_log_id));

diesel::allow_tables_to_appear_in_same_query!(
    raw_logs,
    events,
    flows,
    endpoints,
    endpoint_overrides,
    firewalls,
    firewall_overrides,
    ha_clusters,
    router_mac_rules,
    ingest_jobs,
    settings,
);
