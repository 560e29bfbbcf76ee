diesel::table! {
    /// Every server discovered by the crawler or declared as a seed
    server (id) {
        /// unique id
        id -> Integer,
        /// display hostname
        hostname -> Text,
        /// ip address used for connections
        ip -> Text,
        /// "linux" | "aix" | "unknown"
        os_type -> Text,
        /// ssh port
        ssh_port -> Integer,
        /// whether the jump host could last reach this server
        is_reachable -> Bool,
        /// unix timestamp of the last completed scan, if any
        last_scanned_at -> Nullable<BigInt>,
        /// latest fully-processed event_time for this server, unix seconds
        scan_watermark -> BigInt,
        /// whether agent-pushed data takes priority over SSH scanning
        prefer_agent -> Bool,
        /// unix timestamp of the last agent heartbeat, if any
        last_heartbeat_at -> Nullable<BigInt>,
        /// agent-reported version string
        agent_version -> Nullable<Text>,
        /// sha256(bearer token) for agent auth, if an agent has been provisioned
        agent_token_hash -> Nullable<Text>,
        /// last scan failure, cleared on next success
        last_error -> Nullable<Text>,
        /// bookkeeping only
        created_at -> BigInt,
    }
}

diesel::table! {
    /// Every distinct public key the crawler or an agent has observed
    ssh_key (id) {
        id -> Integer,
        /// "SHA256:..." canonical fingerprint, globally unique
        fingerprint_sha256 -> Text,
        /// colon-separated hex MD5 fingerprint
        fingerprint_md5 -> Text,
        /// "rsa" | "ed25519" | "ecdsa" | "dsa"
        key_type -> Text,
        key_bits -> Nullable<Integer>,
        comment -> Nullable<Text>,
        is_host_key -> Bool,
        first_seen_at -> BigInt,
        file_mtime -> Nullable<BigInt>,
    }
}

diesel::joinable!(key_location -> server (server_id));
diesel::joinable!(key_location -> ssh_key (ssh_key_id));
diesel::table! {
    /// A place a key was found on disk (the authorization layer)
    key_location (id) {
        id -> Integer,
        server_id -> Integer,
        ssh_key_id -> Integer,
        file_path -> Text,
        /// "authorized_keys" | "identity" | "host_key"
        file_type -> Text,
        unix_owner -> Nullable<Text>,
        unix_perms -> Nullable<Integer>,
        /// fixed at "authorization"
        graph_layer -> Text,
        file_mtime -> Nullable<BigInt>,
        file_size -> Nullable<BigInt>,
    }
}

diesel::joinable!(access_event -> server (target_server_id));
diesel::table! {
    /// A single normalised auth-log (or agent-pushed) event
    access_event (id) {
        id -> Integer,
        target_server_id -> Integer,
        source_ip -> Text,
        source_server_id -> Nullable<Integer>,
        ssh_key_id -> Nullable<Integer>,
        fingerprint -> Nullable<Text>,
        username -> Text,
        /// "publickey" | "password" | "other"
        auth_method -> Text,
        /// "accepted" | "failed" | "disconnect"
        event_type -> Text,
        event_time -> BigInt,
        raw_log_line -> Text,
        /// "syslog" | "journald" | "agent"
        log_source -> Text,
    }
}

diesel::joinable!(access_path -> server (target_server_id));
diesel::table! {
    /// The correlated, deduplicated authorization/usage edge
    access_path (id) {
        id -> Integer,
        source_server_id -> Nullable<Integer>,
        target_server_id -> Integer,
        ssh_key_id -> Nullable<Integer>,
        username -> Text,
        first_seen_at -> BigInt,
        last_seen_at -> BigInt,
        event_count -> Integer,
        is_authorized -> Bool,
        is_used -> Bool,
    }
}

diesel::joinable!(unreachable_source -> server (target_server_id));
diesel::table! {
    /// A source IP the jump host could not itself reach
    unreachable_source (id) {
        id -> Integer,
        source_ip -> Text,
        reverse_dns -> Nullable<Text>,
        fingerprint -> Nullable<Text>,
        ssh_key_id -> Nullable<Integer>,
        target_server_id -> Integer,
        username -> Text,
        first_seen_at -> BigInt,
        last_seen_at -> BigInt,
        event_count -> Integer,
        /// "critical" | "high" | "medium" | "low"
        severity -> Text,
        acknowledged -> Bool,
    }
}

diesel::table! {
    /// A single crawl run, full-fleet or single-server
    scan_job (id) {
        id -> Integer,
        /// "full" | "server" | "spider"
        job_type -> Text,
        /// "pending" | "running" | "completed" | "failed" | "cancelled"
        status -> Text,
        seed_server -> Nullable<Integer>,
        max_depth -> Integer,
        servers_done -> Integer,
        events_parsed -> Integer,
        keys_found -> Integer,
        unreachable_found -> Integer,
        started_at -> Nullable<BigInt>,
        finished_at -> Nullable<BigInt>,
    }
}

diesel::joinable!(watch_session -> server (server_id));
diesel::table! {
    /// A live tail session against one server
    watch_session (id) {
        id -> Integer,
        server_id -> Integer,
        /// "active" | "paused" | "stopped" | "error"
        status -> Text,
        last_event_at -> Nullable<BigInt>,
        events_captured -> Integer,
        auto_spider -> Bool,
        spider_depth -> Integer,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    server,
    ssh_key,
    key_location,
    access_event,
    access_path,
    unreachable_source,
    scan_job,
    watch_session,
);
