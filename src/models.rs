use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;

use crate::DbConnection;

fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// `Server.os_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    Linux,
    Aix,
    Unknown,
}

impl OsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Aix => "aix",
            Self::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for OsType {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "linux" => Self::Linux,
            "aix" => Self::Aix,
            _ => Self::Unknown,
        })
    }
}

#[derive(Queryable, Selectable, Clone, Debug, Serialize, ToSchema)]
#[diesel(table_name = crate::schema::server)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Server {
    pub id: i32,
    pub hostname: String,
    pub ip: String,
    pub os_type: String,
    pub ssh_port: i32,
    pub is_reachable: bool,
    pub last_scanned_at: Option<i64>,
    pub scan_watermark: i64,
    pub prefer_agent: bool,
    pub last_heartbeat_at: Option<i64>,
    pub agent_version: Option<String>,
    pub agent_token_hash: Option<String>,
    pub last_error: Option<String>,
    pub created_at: i64,
}

#[derive(Insertable, Clone, Debug)]
#[diesel(table_name = crate::schema::server)]
pub struct NewServer {
    pub hostname: String,
    pub ip: String,
    pub os_type: String,
    pub ssh_port: i32,
    pub is_reachable: bool,
    pub prefer_agent: bool,
    pub created_at: i64,
}

impl Server {
    /// Finds a server by its natural key, inserting it if absent.
    /// Idempotent: concurrent callers racing on the same `(hostname, ip)`
    /// converge on the row the unique index lets through.
    pub fn get_or_create(
        conn: &mut DbConnection,
        hostname: &str,
        ip: &str,
        ssh_port: i32,
    ) -> QueryResult<Server> {
        use crate::schema::server::dsl;

        if let Some(existing) = dsl::server
            .filter(dsl::hostname.eq(hostname))
            .filter(dsl::ip.eq(ip))
            .first::<Server>(conn)
            .optional()?
        {
            return Ok(existing);
        }

        let new_row = NewServer {
            hostname: hostname.to_owned(),
            ip: ip.to_owned(),
            os_type: OsType::Unknown.as_str().to_owned(),
            ssh_port,
            is_reachable: true,
            prefer_agent: false,
            created_at: now(),
        };

        match diesel::insert_into(dsl::server).values(&new_row).execute(conn) {
            Ok(_) => {}
            Err(diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                _,
            )) => {}
            Err(e) => return Err(e),
        }

        dsl::server
            .filter(dsl::hostname.eq(hostname))
            .filter(dsl::ip.eq(ip))
            .first::<Server>(conn)
    }

    pub fn get_by_id(conn: &mut DbConnection, server_id: i32) -> QueryResult<Option<Server>> {
        use crate::schema::server::dsl;
        dsl::server.find(server_id).first(conn).optional()
    }

    pub fn get_by_hostname(conn: &mut DbConnection, hostname: &str) -> QueryResult<Option<Server>> {
        use crate::schema::server::dsl;
        dsl::server
            .filter(dsl::hostname.eq(hostname))
            .first(conn)
            .optional()
    }

    /// Whether `ip` is already a known node, used by the watcher to decide
    /// if an accepted event's source is novel enough to spider.
    pub fn get_by_ip(conn: &mut DbConnection, ip: &str) -> QueryResult<Option<Server>> {
        use crate::schema::server::dsl;
        dsl::server.filter(dsl::ip.eq(ip)).first(conn).optional()
    }

    pub fn list_all(conn: &mut DbConnection) -> QueryResult<Vec<Server>> {
        use crate::schema::server::dsl;
        dsl::server.load(conn)
    }

    /// Advances the watermark. Never moves it backwards: invariant
    /// "scan_watermark monotonically non-decreasing per server".
    pub fn advance_watermark(&self, conn: &mut DbConnection, new_watermark: i64) -> QueryResult<()> {
        use crate::schema::server::dsl;
        if new_watermark <= self.scan_watermark {
            return Ok(());
        }
        diesel::update(dsl::server.find(self.id))
            .set((
                dsl::scan_watermark.eq(new_watermark),
                dsl::last_scanned_at.eq(now()),
            ))
            .execute(conn)?;
        Ok(())
    }

    pub fn set_reachable(&self, conn: &mut DbConnection, reachable: bool) -> QueryResult<()> {
        use crate::schema::server::dsl;
        diesel::update(dsl::server.find(self.id))
            .set(dsl::is_reachable.eq(reachable))
            .execute(conn)?;
        Ok(())
    }

    pub fn set_os_type(&self, conn: &mut DbConnection, os_type: OsType) -> QueryResult<()> {
        use crate::schema::server::dsl;
        diesel::update(dsl::server.find(self.id))
            .set(dsl::os_type.eq(os_type.as_str()))
            .execute(conn)?;
        Ok(())
    }

    pub fn set_last_error(&self, conn: &mut DbConnection, error: Option<&str>) -> QueryResult<()> {
        use crate::schema::server::dsl;
        diesel::update(dsl::server.find(self.id))
            .set(dsl::last_error.eq(error))
            .execute(conn)?;
        Ok(())
    }

    pub fn record_heartbeat(&self, conn: &mut DbConnection, agent_version: &str) -> QueryResult<()> {
        use crate::schema::server::dsl;
        diesel::update(dsl::server.find(self.id))
            .set((
                dsl::last_heartbeat_at.eq(now()),
                dsl::agent_version.eq(agent_version),
            ))
            .execute(conn)?;
        Ok(())
    }

    /// `prefer_agent` is true and the last heartbeat is within `max_age` seconds.
    pub fn has_fresh_agent_heartbeat(&self, max_age_secs: i64) -> bool {
        self.prefer_agent
            && self
                .last_heartbeat_at
                .is_some_and(|t| now() - t <= max_age_secs)
    }

    pub fn set_agent_token_hash(&self, conn: &mut DbConnection, hash: &str) -> QueryResult<()> {
        use crate::schema::server::dsl;
        diesel::update(dsl::server.find(self.id))
            .set(dsl::agent_token_hash.eq(hash))
            .execute(conn)?;
        Ok(())
    }
}

/// `SSHKey.key_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Rsa,
    Ed25519,
    Ecdsa,
    Dsa,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rsa => "rsa",
            Self::Ed25519 => "ed25519",
            Self::Ecdsa => "ecdsa",
            Self::Dsa => "dsa",
        }
    }
}

#[derive(Queryable, Selectable, Clone, Debug, Serialize, ToSchema)]
#[diesel(table_name = crate::schema::ssh_key)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SSHKey {
    pub id: i32,
    pub fingerprint_sha256: String,
    pub fingerprint_md5: String,
    pub key_type: String,
    pub key_bits: Option<i32>,
    pub comment: Option<String>,
    pub is_host_key: bool,
    pub first_seen_at: i64,
    pub file_mtime: Option<i64>,
}

#[derive(Insertable, Clone, Debug)]
#[diesel(table_name = crate::schema::ssh_key)]
pub struct NewSSHKey {
    pub fingerprint_sha256: String,
    pub fingerprint_md5: String,
    pub key_type: String,
    pub key_bits: Option<i32>,
    pub comment: Option<String>,
    pub is_host_key: bool,
    pub first_seen_at: i64,
    pub file_mtime: Option<i64>,
}

impl SSHKey {
    /// `fingerprint_sha256` is the natural key: first writer wins the
    /// comment/bits/mtime, later scans never overwrite them.
    pub fn get_or_create(
        conn: &mut DbConnection,
        fingerprint_sha256: &str,
        fingerprint_md5: &str,
        key_type: KeyType,
        key_bits: Option<i32>,
        comment: Option<&str>,
        is_host_key: bool,
        file_mtime: Option<i64>,
    ) -> QueryResult<SSHKey> {
        use crate::schema::ssh_key::dsl;

        if let Some(existing) = dsl::ssh_key
            .filter(dsl::fingerprint_sha256.eq(fingerprint_sha256))
            .first::<SSHKey>(conn)
            .optional()?
        {
            return Ok(existing);
        }

        let new_row = NewSSHKey {
            fingerprint_sha256: fingerprint_sha256.to_owned(),
            fingerprint_md5: fingerprint_md5.to_owned(),
            key_type: key_type.as_str().to_owned(),
            key_bits,
            comment: comment.map(str::to_owned),
            is_host_key,
            first_seen_at: now(),
            file_mtime,
        };

        match diesel::insert_into(dsl::ssh_key).values(&new_row).execute(conn) {
            Ok(_) => {}
            Err(diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                _,
            )) => {}
            Err(e) => return Err(e),
        }

        dsl::ssh_key
            .filter(dsl::fingerprint_sha256.eq(fingerprint_sha256))
            .first::<SSHKey>(conn)
    }

    pub fn get_by_fingerprint(
        conn: &mut DbConnection,
        fingerprint_sha256: &str,
    ) -> QueryResult<Option<SSHKey>> {
        use crate::schema::ssh_key::dsl;
        dsl::ssh_key
            .filter(dsl::fingerprint_sha256.eq(fingerprint_sha256))
            .first(conn)
            .optional()
    }

    pub fn all(conn: &mut DbConnection) -> QueryResult<Vec<SSHKey>> {
        use crate::schema::ssh_key::dsl;
        dsl::ssh_key.load(conn)
    }

    /// Bulk prefetch: fingerprint -> key id, for the spider's per-server commit.
    pub fn prefetch_by_fingerprints(
        conn: &mut DbConnection,
        fingerprints: &[String],
    ) -> QueryResult<std::collections::HashMap<String, i32>> {
        use crate::schema::ssh_key::dsl;
        if fingerprints.is_empty() {
            return Ok(Default::default());
        }
        let rows: Vec<(i32, String)> = dsl::ssh_key
            .filter(dsl::fingerprint_sha256.eq_any(fingerprints))
            .select((dsl::id, dsl::fingerprint_sha256))
            .load(conn)?;
        Ok(rows.into_iter().map(|(id, fp)| (fp, id)).collect())
    }
}

/// `KeyLocation.file_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    AuthorizedKeys,
    Identity,
    HostKey,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthorizedKeys => "authorized_keys",
            Self::Identity => "identity",
            Self::HostKey => "host_key",
        }
    }
}

#[derive(Queryable, Selectable, Clone, Debug, Serialize, ToSchema)]
#[diesel(table_name = crate::schema::key_location)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct KeyLocation {
    pub id: i32,
    pub server_id: i32,
    pub ssh_key_id: i32,
    pub file_path: String,
    pub file_type: String,
    pub unix_owner: Option<String>,
    pub unix_perms: Option<i32>,
    pub graph_layer: String,
    pub file_mtime: Option<i64>,
    pub file_size: Option<i64>,
}

#[derive(Insertable, Clone, Debug)]
#[diesel(table_name = crate::schema::key_location)]
pub struct NewKeyLocation {
    pub server_id: i32,
    pub ssh_key_id: i32,
    pub file_path: String,
    pub file_type: String,
    pub unix_owner: Option<String>,
    pub unix_perms: Option<i32>,
    pub graph_layer: String,
    pub file_mtime: Option<i64>,
    pub file_size: Option<i64>,
}

impl KeyLocation {
    /// Deduplicates by `(server, path, fingerprint)` via upsert-or-skip.
    pub fn upsert(
        conn: &mut DbConnection,
        server_id: i32,
        ssh_key_id: i32,
        file_path: &str,
        file_type: FileType,
        unix_owner: Option<&str>,
        unix_perms: Option<i32>,
        file_mtime: Option<i64>,
        file_size: Option<i64>,
    ) -> QueryResult<()> {
        use crate::schema::key_location::dsl;

        let existing = dsl::key_location
            .filter(dsl::server_id.eq(server_id))
            .filter(dsl::file_path.eq(file_path))
            .filter(dsl::ssh_key_id.eq(ssh_key_id))
            .select(dsl::id)
            .first::<i32>(conn)
            .optional()?;

        if let Some(id) = existing {
            diesel::update(dsl::key_location.find(id))
                .set((
                    dsl::unix_owner.eq(unix_owner),
                    dsl::unix_perms.eq(unix_perms),
                    dsl::file_mtime.eq(file_mtime),
                    dsl::file_size.eq(file_size),
                ))
                .execute(conn)?;
            return Ok(());
        }

        diesel::insert_into(dsl::key_location)
            .values(NewKeyLocation {
                server_id,
                ssh_key_id,
                file_path: file_path.to_owned(),
                file_type: file_type.as_str().to_owned(),
                unix_owner: unix_owner.map(str::to_owned),
                unix_perms,
                graph_layer: "authorization".to_owned(),
                file_mtime,
                file_size,
            })
            .execute(conn)?;
        Ok(())
    }

    pub fn for_server(conn: &mut DbConnection, server_id: i32) -> QueryResult<Vec<KeyLocation>> {
        use crate::schema::key_location::dsl;
        dsl::key_location
            .filter(dsl::server_id.eq(server_id))
            .load(conn)
    }

    /// True when this key has at least one `authorized_keys` location on `server_id`.
    pub fn authorized_on(
        conn: &mut DbConnection,
        server_id: i32,
        ssh_key_id: i32,
    ) -> QueryResult<bool> {
        use crate::schema::key_location::dsl;
        let count: i64 = dsl::key_location
            .filter(dsl::server_id.eq(server_id))
            .filter(dsl::ssh_key_id.eq(ssh_key_id))
            .filter(dsl::file_type.eq(FileType::AuthorizedKeys.as_str()))
            .count()
            .get_result(conn)?;
        Ok(count > 0)
    }
}

/// `AccessEvent.event_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Accepted,
    Failed,
    Disconnect,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Failed => "failed",
            Self::Disconnect => "disconnect",
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(Self::Accepted),
            "failed" => Ok(Self::Failed),
            "disconnect" => Ok(Self::Disconnect),
            other => Err(format!("unknown event_type '{other}'")),
        }
    }
}

/// `AccessEvent.auth_method`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Publickey,
    Password,
    Other,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publickey => "publickey",
            Self::Password => "password",
            Self::Other => "other",
        }
    }
}

#[derive(Queryable, Selectable, Clone, Debug, Serialize, ToSchema)]
#[diesel(table_name = crate::schema::access_event)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct AccessEvent {
    pub id: i32,
    pub target_server_id: i32,
    pub source_ip: String,
    pub source_server_id: Option<i32>,
    pub ssh_key_id: Option<i32>,
    pub fingerprint: Option<String>,
    pub username: String,
    pub auth_method: String,
    pub event_type: String,
    pub event_time: i64,
    pub raw_log_line: String,
    pub log_source: String,
}

#[derive(Insertable, Clone, Debug)]
#[diesel(table_name = crate::schema::access_event)]
pub struct NewAccessEvent {
    pub target_server_id: i32,
    pub source_ip: String,
    pub source_server_id: Option<i32>,
    pub ssh_key_id: Option<i32>,
    pub fingerprint: Option<String>,
    pub username: String,
    pub auth_method: String,
    pub event_type: String,
    pub event_time: i64,
    pub raw_log_line: String,
    pub log_source: String,
}

impl AccessEvent {
    /// Batch insert, skipping rows that collide with the natural-key unique
    /// index (`target, source_ip, username, event_time, event_type`). This is
    /// the chosen re-ingest policy: identical re-scans produce identical rows,
    /// never doubled counters.
    pub fn insert_batch(conn: &mut DbConnection, events: &[NewAccessEvent]) -> QueryResult<usize> {
        use crate::schema::access_event::dsl;
        let mut inserted = 0;
        for event in events {
            match diesel::insert_into(dsl::access_event)
                .values(event)
                .execute(conn)
            {
                Ok(n) => inserted += n,
                Err(diesel::result::Error::DatabaseError(
                    diesel::result::DatabaseErrorKind::UniqueViolation,
                    _,
                )) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(inserted)
    }

    pub fn for_target(conn: &mut DbConnection, target_server_id: i32) -> QueryResult<Vec<AccessEvent>> {
        use crate::schema::access_event::dsl;
        dsl::access_event
            .filter(dsl::target_server_id.eq(target_server_id))
            .load(conn)
    }
}

#[derive(Queryable, Selectable, Clone, Debug, Serialize, ToSchema)]
#[diesel(table_name = crate::schema::access_path)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct AccessPath {
    pub id: i32,
    pub source_server_id: Option<i32>,
    pub target_server_id: i32,
    pub ssh_key_id: Option<i32>,
    pub username: String,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
    pub event_count: i32,
    pub is_authorized: bool,
    pub is_used: bool,
}

#[derive(Insertable, Clone, Debug)]
#[diesel(table_name = crate::schema::access_path)]
struct NewAccessPath {
    source_server_id: Option<i32>,
    target_server_id: i32,
    ssh_key_id: Option<i32>,
    username: String,
    first_seen_at: i64,
    last_seen_at: i64,
    event_count: i32,
    is_authorized: bool,
    is_used: bool,
}

impl AccessPath {
    /// Exactly-once edge per `(source, target, key, username)`. Flags are
    /// OR-merged on conflict, never cleared; `event_count` and the seen-at
    /// bounds widen monotonically.
    /// A usage event with a known source correlates onto the
    /// authorization-only placeholder row (`source_server_id = NULL`) for
    /// the same `(target, key, user)` when one exists, promoting its
    /// source instead of leaving the placeholder permanently unused.
    #[allow(clippy::too_many_arguments)]
    fn upsert(
        conn: &mut DbConnection,
        source_server_id: Option<i32>,
        target_server_id: i32,
        ssh_key_id: Option<i32>,
        username: &str,
        at: i64,
        event_count_delta: i32,
        is_authorized: bool,
        is_used: bool,
    ) -> QueryResult<()> {
        use crate::schema::access_path::dsl;

        let exact = dsl::access_path
            .filter(dsl::target_server_id.eq(target_server_id))
            .filter(dsl::username.eq(username))
            .filter(match source_server_id {
                Some(id) => dsl::source_server_id.eq(Some(id)),
                None => dsl::source_server_id.is_null(),
            })
            .filter(match ssh_key_id {
                Some(id) => dsl::ssh_key_id.eq(Some(id)),
                None => dsl::ssh_key_id.is_null(),
            })
            .first::<AccessPath>(conn)
            .optional()?;

        let existing = match exact {
            Some(row) => Some(row),
            None if source_server_id.is_some() => dsl::access_path
                .filter(dsl::target_server_id.eq(target_server_id))
                .filter(dsl::username.eq(username))
                .filter(dsl::source_server_id.is_null())
                .filter(match ssh_key_id {
                    Some(id) => dsl::ssh_key_id.eq(Some(id)),
                    None => dsl::ssh_key_id.is_null(),
                })
                .first::<AccessPath>(conn)
                .optional()?,
            None => None,
        };

        match existing {
            Some(row) => {
                let promoted_source = row.source_server_id.or(source_server_id);
                diesel::update(dsl::access_path.find(row.id))
                    .set((
                        dsl::source_server_id.eq(promoted_source),
                        dsl::first_seen_at.eq(row.first_seen_at.min(at)),
                        dsl::last_seen_at.eq(row.last_seen_at.max(at)),
                        dsl::event_count.eq(row.event_count + event_count_delta),
                        dsl::is_authorized.eq(row.is_authorized || is_authorized),
                        dsl::is_used.eq(row.is_used || is_used),
                    ))
                    .execute(conn)?;
            }
            None => {
                diesel::insert_into(dsl::access_path)
                    .values(NewAccessPath {
                        source_server_id,
                        target_server_id,
                        ssh_key_id,
                        username: username.to_owned(),
                        first_seen_at: at,
                        last_seen_at: at,
                        event_count: event_count_delta,
                        is_authorized,
                        is_used,
                    })
                    .execute(conn)?;
            }
        }
        Ok(())
    }

    /// Records that `ssh_key_id` was actually used from `source_server_id`
    /// against `target_server_id` by `username` at `event_time`.
    pub fn record_usage(
        conn: &mut DbConnection,
        source_server_id: Option<i32>,
        target_server_id: i32,
        ssh_key_id: Option<i32>,
        username: &str,
        event_time: i64,
    ) -> QueryResult<()> {
        Self::upsert(
            conn,
            source_server_id,
            target_server_id,
            ssh_key_id,
            username,
            event_time,
            1,
            false,
            true,
        )
    }

    /// Records that `ssh_key_id` is present in an `authorized_keys` file on
    /// `target_server_id`. The source side of the edge is unknown until a
    /// usage event correlates it, so it's left `None`.
    pub fn record_authorization(
        conn: &mut DbConnection,
        target_server_id: i32,
        ssh_key_id: i32,
        username: &str,
        at: i64,
    ) -> QueryResult<()> {
        Self::upsert(
            conn,
            None,
            target_server_id,
            Some(ssh_key_id),
            username,
            at,
            0,
            true,
            false,
        )
    }

    pub fn dormant_keys(conn: &mut DbConnection) -> QueryResult<Vec<AccessPath>> {
        use crate::schema::access_path::dsl;
        dsl::access_path
            .filter(dsl::is_authorized.eq(true))
            .filter(dsl::is_used.eq(false))
            .load(conn)
    }

    pub fn stale_keys(conn: &mut DbConnection, max_age_secs: i64) -> QueryResult<Vec<AccessPath>> {
        use crate::schema::access_path::dsl;
        let cutoff = now() - max_age_secs;
        dsl::access_path
            .filter(dsl::is_authorized.eq(true))
            .filter(dsl::last_seen_at.lt(cutoff))
            .load(conn)
    }

    pub fn all(conn: &mut DbConnection) -> QueryResult<Vec<AccessPath>> {
        use crate::schema::access_path::dsl;
        dsl::access_path.load(conn)
    }
}

/// Mystery key: an accepted event with a fingerprint that has no
/// `KeyLocation` on the target server.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MysteryKey {
    pub fingerprint: String,
    pub target_server_id: i32,
    pub event_count: i64,
}

pub fn mystery_keys(conn: &mut DbConnection) -> QueryResult<Vec<MysteryKey>> {
    use crate::schema::access_event::dsl as ev;
    use diesel::dsl::count_star;

    let rows: Vec<(Option<String>, i32, i64)> = ev::access_event
        .filter(ev::event_type.eq(EventType::Accepted.as_str()))
        .filter(ev::fingerprint.is_not_null())
        .group_by((ev::fingerprint, ev::target_server_id))
        .select((ev::fingerprint, ev::target_server_id, count_star()))
        .load(conn)?;

    let mut out = Vec::new();
    for (fingerprint, target_server_id, event_count) in rows {
        let Some(fingerprint) = fingerprint else {
            continue;
        };
        let located = if let Some(key) = SSHKey::get_by_fingerprint(conn, &fingerprint)? {
            KeyLocation::authorized_on(conn, target_server_id, key.id)?
        } else {
            false
        };
        if !located {
            out.push(MysteryKey {
                fingerprint,
                target_server_id,
                event_count,
            });
        }
    }
    Ok(out)
}

/// `ScanJob.job_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ScanJobType {
    Full,
    Server,
    Spider,
}

impl ScanJobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Server => "server",
            Self::Spider => "spider",
        }
    }
}

/// `ScanJob.status`. Terminal states (`Completed`/`Failed`/`Cancelled`) are
/// absorbing: no transition out is ever performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ScanJobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Queryable, Selectable, Clone, Debug, Serialize, ToSchema)]
#[diesel(table_name = crate::schema::scan_job)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ScanJob {
    pub id: i32,
    pub job_type: String,
    pub status: String,
    pub seed_server: Option<i32>,
    pub max_depth: i32,
    pub servers_done: i32,
    pub events_parsed: i32,
    pub keys_found: i32,
    pub unreachable_found: i32,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

#[derive(Insertable, Clone, Debug)]
#[diesel(table_name = crate::schema::scan_job)]
pub struct NewScanJob {
    pub job_type: String,
    pub status: String,
    pub seed_server: Option<i32>,
    pub max_depth: i32,
}

impl ScanJob {
    pub fn create(
        conn: &mut DbConnection,
        job_type: ScanJobType,
        seed_server: Option<i32>,
        max_depth: i32,
    ) -> QueryResult<ScanJob> {
        use crate::schema::scan_job::dsl;
        diesel::insert_into(dsl::scan_job)
            .values(NewScanJob {
                job_type: job_type.as_str().to_owned(),
                status: ScanJobStatus::Pending.as_str().to_owned(),
                seed_server,
                max_depth,
            })
            .execute(conn)?;
        dsl::scan_job.order(dsl::id.desc()).first(conn)
    }

    pub fn get(conn: &mut DbConnection, job_id: i32) -> QueryResult<Option<ScanJob>> {
        use crate::schema::scan_job::dsl;
        dsl::scan_job.find(job_id).first(conn).optional()
    }

    pub fn transition(&self, conn: &mut DbConnection, status: ScanJobStatus) -> QueryResult<()> {
        use crate::schema::scan_job::dsl;
        let mut update = diesel::update(dsl::scan_job.find(self.id)).into_boxed();
        update = match status {
            ScanJobStatus::Running => update.set(dsl::status.eq(status.as_str())).into_boxed(),
            _ => update.into_boxed(),
        };
        // started_at/finished_at need distinct `set` calls because diesel's
        // boxed update can't merge heterogeneous `set` tuples conditionally.
        match status {
            ScanJobStatus::Running => {
                diesel::update(dsl::scan_job.find(self.id))
                    .set((dsl::status.eq(status.as_str()), dsl::started_at.eq(now())))
                    .execute(conn)?;
            }
            s if s.is_terminal() => {
                diesel::update(dsl::scan_job.find(self.id))
                    .set((dsl::status.eq(s.as_str()), dsl::finished_at.eq(now())))
                    .execute(conn)?;
            }
            s => {
                diesel::update(dsl::scan_job.find(self.id))
                    .set(dsl::status.eq(s.as_str()))
                    .execute(conn)?;
            }
        }
        Ok(())
    }

    pub fn is_cancelled(conn: &mut DbConnection, job_id: i32) -> QueryResult<bool> {
        use crate::schema::scan_job::dsl;
        let status: String = dsl::scan_job.find(job_id).select(dsl::status).first(conn)?;
        Ok(status == ScanJobStatus::Cancelled.as_str())
    }

    pub fn record_progress(
        &self,
        conn: &mut DbConnection,
        servers_done: i32,
        events_parsed: i32,
        keys_found: i32,
        unreachable_found: i32,
    ) -> QueryResult<()> {
        use crate::schema::scan_job::dsl;
        diesel::update(dsl::scan_job.find(self.id))
            .set((
                dsl::servers_done.eq(servers_done),
                dsl::events_parsed.eq(events_parsed),
                dsl::keys_found.eq(keys_found),
                dsl::unreachable_found.eq(unreachable_found),
            ))
            .execute(conn)?;
        Ok(())
    }
}

/// `WatchSession.status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum WatchStatus {
    Active,
    Paused,
    Stopped,
    Error,
}

impl WatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

#[derive(Queryable, Selectable, Clone, Debug, Serialize, ToSchema)]
#[diesel(table_name = crate::schema::watch_session)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct WatchSession {
    pub id: i32,
    pub server_id: i32,
    pub status: String,
    pub last_event_at: Option<i64>,
    pub events_captured: i32,
    pub auto_spider: bool,
    pub spider_depth: i32,
}

#[derive(Insertable, Clone, Debug)]
#[diesel(table_name = crate::schema::watch_session)]
pub struct NewWatchSession {
    pub server_id: i32,
    pub status: String,
    pub auto_spider: bool,
    pub spider_depth: i32,
}

impl WatchSession {
    /// One active session per `server_id`: replaces a stale row if present.
    pub fn get_or_create(
        conn: &mut DbConnection,
        server_id: i32,
        auto_spider: bool,
        spider_depth: i32,
    ) -> QueryResult<WatchSession> {
        use crate::schema::watch_session::dsl;

        if let Some(existing) = dsl::watch_session
            .filter(dsl::server_id.eq(server_id))
            .first::<WatchSession>(conn)
            .optional()?
        {
            diesel::update(dsl::watch_session.find(existing.id))
                .set((
                    dsl::status.eq(WatchStatus::Active.as_str()),
                    dsl::auto_spider.eq(auto_spider),
                    dsl::spider_depth.eq(spider_depth),
                ))
                .execute(conn)?;
            return dsl::watch_session.find(existing.id).first(conn);
        }

        diesel::insert_into(dsl::watch_session)
            .values(NewWatchSession {
                server_id,
                status: WatchStatus::Active.as_str().to_owned(),
                auto_spider,
                spider_depth,
            })
            .execute(conn)?;
        dsl::watch_session
            .filter(dsl::server_id.eq(server_id))
            .first(conn)
    }

    pub fn set_status(&self, conn: &mut DbConnection, status: WatchStatus) -> QueryResult<()> {
        use crate::schema::watch_session::dsl;
        diesel::update(dsl::watch_session.find(self.id))
            .set(dsl::status.eq(status.as_str()))
            .execute(conn)?;
        Ok(())
    }

    pub fn record_event(&self, conn: &mut DbConnection) -> QueryResult<()> {
        use crate::schema::watch_session::dsl;
        diesel::update(dsl::watch_session.find(self.id))
            .set((
                dsl::events_captured.eq(self.events_captured + 1),
                dsl::last_event_at.eq(now()),
            ))
            .execute(conn)?;
        Ok(())
    }
}

/// `UnreachableSource.severity`, a pure function of its inputs (spec §4.6 / §8.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    /// `critical`: accepted + root + unreachable.
    /// `high`: accepted + unreachable + not RFC1918.
    /// `medium`: accepted + unreachable + RFC1918.
    /// `low`: only failed events from an unreachable source.
    pub fn classify(has_accepted_event: bool, is_root_user: bool, is_rfc1918: bool) -> Self {
        if !has_accepted_event {
            return Self::Low;
        }
        if is_root_user {
            return Self::Critical;
        }
        if is_rfc1918 {
            Self::Medium
        } else {
            Self::High
        }
    }
}

#[derive(Queryable, Selectable, Clone, Debug, Serialize, ToSchema)]
#[diesel(table_name = crate::schema::unreachable_source)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct UnreachableSource {
    pub id: i32,
    pub source_ip: String,
    pub reverse_dns: Option<String>,
    pub fingerprint: Option<String>,
    pub ssh_key_id: Option<i32>,
    pub target_server_id: i32,
    pub username: String,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
    pub event_count: i32,
    pub severity: String,
    pub acknowledged: bool,
}

#[derive(Insertable, Clone, Debug)]
#[diesel(table_name = crate::schema::unreachable_source)]
struct NewUnreachableSource {
    source_ip: String,
    reverse_dns: Option<String>,
    fingerprint: Option<String>,
    ssh_key_id: Option<i32>,
    target_server_id: i32,
    username: String,
    first_seen_at: i64,
    last_seen_at: i64,
    event_count: i32,
    severity: String,
    acknowledged: bool,
}

impl UnreachableSource {
    #[allow(clippy::too_many_arguments)]
    pub fn upsert(
        conn: &mut DbConnection,
        source_ip: &str,
        reverse_dns: Option<&str>,
        fingerprint: Option<&str>,
        ssh_key_id: Option<i32>,
        target_server_id: i32,
        username: &str,
        at: i64,
        severity: Severity,
    ) -> QueryResult<()> {
        use crate::schema::unreachable_source::dsl;

        let existing = dsl::unreachable_source
            .filter(dsl::source_ip.eq(source_ip))
            .filter(dsl::target_server_id.eq(target_server_id))
            .filter(dsl::username.eq(username))
            .first::<UnreachableSource>(conn)
            .optional()?;

        match existing {
            Some(row) => {
                diesel::update(dsl::unreachable_source.find(row.id))
                    .set((
                        dsl::last_seen_at.eq(row.last_seen_at.max(at)),
                        dsl::event_count.eq(row.event_count + 1),
                        dsl::severity.eq(severity.as_str()),
                        dsl::reverse_dns.eq(reverse_dns.or(row.reverse_dns.as_deref())),
                    ))
                    .execute(conn)?;
            }
            None => {
                diesel::insert_into(dsl::unreachable_source)
                    .values(NewUnreachableSource {
                        source_ip: source_ip.to_owned(),
                        reverse_dns: reverse_dns.map(str::to_owned),
                        fingerprint: fingerprint.map(str::to_owned),
                        ssh_key_id,
                        target_server_id,
                        username: username.to_owned(),
                        first_seen_at: at,
                        last_seen_at: at,
                        event_count: 1,
                        severity: severity.as_str().to_owned(),
                        acknowledged: false,
                    })
                    .execute(conn)?;
            }
        }
        Ok(())
    }

    pub fn all(conn: &mut DbConnection) -> QueryResult<Vec<UnreachableSource>> {
        use crate::schema::unreachable_source::dsl;
        dsl::unreachable_source.load(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diesel::r2d2::{ConnectionManager, Pool};
    use diesel_migrations::MigrationHarness;
    use tempfile::TempDir;

    /// Isolated, migrated SQLite db per test. Kept alive by the returned
    /// `TempDir` guard, mirroring the teacher's `TestConfig` pattern.
    fn test_conn() -> (diesel::r2d2::PooledConnection<ConnectionManager<DbConnection>>, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let db_path = dir.path().join("test.db");
        let manager = ConnectionManager::<DbConnection>::new(format!("sqlite://{}", db_path.display()));
        let pool = Pool::builder().build(manager).expect("pool");
        let mut conn = pool.get().expect("conn");
        conn.run_pending_migrations(crate::MIGRATIONS).expect("migrate");
        (conn, dir)
    }

    #[test]
    fn agent_takeover_skips_fresh_heartbeat() {
        let (mut conn, _dir) = test_conn();
        let server = Server::get_or_create(&mut conn, "host-a", "10.0.0.1", 22).unwrap();
        assert!(!server.has_fresh_agent_heartbeat(300));

        server.record_heartbeat(&mut conn, "1.2.3").unwrap();
        let refreshed = Server::get_by_id(&mut conn, server.id).unwrap().unwrap();
        assert!(refreshed.has_fresh_agent_heartbeat(300));
        assert!(!refreshed.has_fresh_agent_heartbeat(0));
    }

    #[test]
    fn get_by_ip_finds_existing_server_and_misses_unknown_ip() {
        let (mut conn, _dir) = test_conn();
        let server = Server::get_or_create(&mut conn, "host-b", "10.0.0.5", 22).unwrap();

        let found = Server::get_by_ip(&mut conn, "10.0.0.5").unwrap();
        assert_eq!(found.map(|s| s.id), Some(server.id));

        assert!(Server::get_by_ip(&mut conn, "10.0.0.6").unwrap().is_none());
    }

    #[test]
    fn access_path_or_merges_authorization_and_usage() {
        let (mut conn, _dir) = test_conn();
        let target = Server::get_or_create(&mut conn, "target", "10.0.0.2", 22).unwrap();
        let source = Server::get_or_create(&mut conn, "source", "10.0.0.9", 22).unwrap();
        let key = SSHKey::get_or_create(&mut conn, "SHA256:abc", "aa:bb", KeyType::Ed25519, None, None, false, None).unwrap();

        AccessPath::record_authorization(&mut conn, target.id, key.id, "root", 100).unwrap();
        let dormant = AccessPath::dormant_keys(&mut conn).unwrap();
        assert_eq!(dormant.len(), 1);
        assert!(dormant[0].is_authorized);
        assert!(!dormant[0].is_used);

        AccessPath::record_usage(&mut conn, Some(source.id), target.id, Some(key.id), "root", 200).unwrap();
        let paths = AccessPath::all(&mut conn).unwrap();
        assert_eq!(paths.len(), 1, "usage correlates onto the same authorization row even from a real source");
        assert!(paths[0].is_authorized);
        assert!(paths[0].is_used);
        assert_eq!(paths[0].event_count, 1);
        assert_eq!(paths[0].source_server_id, Some(source.id), "placeholder source is promoted to the real one");

        let dormant_after = AccessPath::dormant_keys(&mut conn).unwrap();
        assert!(dormant_after.is_empty());
    }

    #[test]
    fn access_path_keeps_distinct_sources_as_separate_edges() {
        let (mut conn, _dir) = test_conn();
        let target = Server::get_or_create(&mut conn, "target2", "10.0.1.2", 22).unwrap();
        let source_a = Server::get_or_create(&mut conn, "source-a", "10.0.1.9", 22).unwrap();
        let source_b = Server::get_or_create(&mut conn, "source-b", "10.0.1.10", 22).unwrap();
        let key = SSHKey::get_or_create(&mut conn, "SHA256:def", "cc:dd", KeyType::Ed25519, None, None, false, None).unwrap();

        AccessPath::record_authorization(&mut conn, target.id, key.id, "root", 100).unwrap();
        AccessPath::record_usage(&mut conn, Some(source_a.id), target.id, Some(key.id), "root", 200).unwrap();
        AccessPath::record_usage(&mut conn, Some(source_b.id), target.id, Some(key.id), "root", 300).unwrap();

        let paths = AccessPath::all(&mut conn).unwrap();
        assert_eq!(paths.len(), 2, "second source gets its own edge once the placeholder is already claimed");
        assert!(paths.iter().any(|p| p.source_server_id == Some(source_a.id) && p.is_authorized));
        assert!(paths.iter().any(|p| p.source_server_id == Some(source_b.id) && !p.is_authorized));
    }

    #[test]
    fn mystery_key_flagged_without_location() {
        let (mut conn, _dir) = test_conn();
        let target = Server::get_or_create(&mut conn, "target", "10.0.0.3", 22).unwrap();

        let events = vec![NewAccessEvent {
            target_server_id: target.id,
            source_ip: "10.0.0.9".to_owned(),
            source_server_id: None,
            ssh_key_id: None,
            fingerprint: Some("SHA256:unlocated".to_owned()),
            username: "root".to_owned(),
            auth_method: "publickey".to_owned(),
            event_type: EventType::Accepted.as_str().to_owned(),
            event_time: 100,
            raw_log_line: "sshd: Accepted publickey for root".to_owned(),
            log_source: "ssh".to_owned(),
        }];
        AccessEvent::insert_batch(&mut conn, &events).unwrap();

        let found = mystery_keys(&mut conn).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].fingerprint, "SHA256:unlocated");
        assert_eq!(found[0].target_server_id, target.id);
    }

    #[test]
    fn scan_job_terminal_states_are_absorbing() {
        assert!(ScanJobStatus::Completed.is_terminal());
        assert!(ScanJobStatus::Failed.is_terminal());
        assert!(ScanJobStatus::Cancelled.is_terminal());
        assert!(!ScanJobStatus::Pending.is_terminal());
        assert!(!ScanJobStatus::Running.is_terminal());
    }

    #[test]
    fn scan_job_cancellation_round_trips() {
        let (mut conn, _dir) = test_conn();
        let job = ScanJob::create(&mut conn, ScanJobType::Spider, None, 10).unwrap();
        assert!(!ScanJob::is_cancelled(&mut conn, job.id).unwrap());

        job.transition(&mut conn, ScanJobStatus::Cancelled).unwrap();
        assert!(ScanJob::is_cancelled(&mut conn, job.id).unwrap());
    }
}
