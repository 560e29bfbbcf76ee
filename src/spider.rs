use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use log::{info, warn};
use time::OffsetDateTime;

use crate::config::{LogTailConfig, SpiderConfig, UnreachableConfig};
use crate::logging::ScanLogger;
use crate::logparse::{self, Dialect};
use crate::models::{
    AccessEvent, AccessPath, EventType, KeyLocation, NewAccessEvent, OsType, ScanJob, ScanJobStatus,
    Server, SSHKey,
};
use crate::scanner;
use crate::sftp::SftpReader;
use crate::ssh::{ConnectionDetails, SshPool};
use crate::unreachable::UnreachableDetector;
use crate::ConnectionPool;

const AGENT_HEARTBEAT_FRESHNESS_SECS: i64 = 300;

const SYSLOG_CANDIDATES: &[(&str, Dialect)] = &[
    ("/var/log/auth.log", Dialect::Debian),
    ("/var/log/secure", Dialect::Rhel),
    ("/var/adm/syslog", Dialect::Aix),
];

#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub servers_done: i32,
    pub queue_size: usize,
    pub events_parsed: i32,
    pub keys_found: i32,
    pub unreachable_found: i32,
}

pub struct SpiderEngine {
    pool: Arc<SshPool>,
    db: ConnectionPool,
    unreachable: Arc<UnreachableDetector>,
    spider_config: SpiderConfig,
    log_config: LogTailConfig,
}

impl SpiderEngine {
    pub fn new(
        pool: Arc<SshPool>,
        db: ConnectionPool,
        spider_config: SpiderConfig,
        log_config: LogTailConfig,
        unreachable_config: UnreachableConfig,
    ) -> Self {
        Self {
            pool,
            db,
            unreachable: Arc::new(UnreachableDetector::new(unreachable_config.cache_ttl)),
            spider_config,
            log_config,
        }
    }

    /// Runs a bounded-depth BFS crawl from `seed_hostname`, reporting progress
    /// through `on_progress` and honouring cooperative cancellation at
    /// server-boundary granularity via `ScanJob::is_cancelled`.
    pub async fn run(
        &self,
        job: &ScanJob,
        seed_hostname: &str,
        seed_ip: &str,
        ssh_port: i32,
        login: &str,
        max_depth: Option<u32>,
        mut on_progress: impl FnMut(Progress),
    ) -> Result<(), String> {
        let max_depth = max_depth
            .unwrap_or(self.spider_config.default_depth)
            .min(self.spider_config.max_depth);

        job.transition(&mut self.conn()?, ScanJobStatus::Running)
            .map_err(|e| e.to_string())?;
        ScanLogger::log_job_started(job.id, "spider", Some(seed_hostname));

        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, String, u32, Option<i32>)> = VecDeque::new();
        visited.insert(canonical_key(seed_hostname, seed_ip));
        queue.push_back((seed_hostname.to_owned(), seed_ip.to_owned(), 0, None));

        let mut progress = Progress {
            servers_done: 0,
            queue_size: queue.len(),
            events_parsed: 0,
            keys_found: 0,
            unreachable_found: 0,
        };

        while let Some((hostname, ip, depth, jump_via)) = queue.pop_front() {
            if ScanJob::is_cancelled(&mut self.conn()?, job.id).map_err(|e| e.to_string())? {
                job.transition(&mut self.conn()?, ScanJobStatus::Cancelled)
                    .map_err(|e| e.to_string())?;
                ScanLogger::log_job_finished(job.id, "cancelled", progress.servers_done, progress.events_parsed);
                return Ok(());
            }

            match self
                .scan_one_server(&hostname, &ip, ssh_port, login, jump_via, &mut queue, &mut visited, depth, max_depth)
                .await
            {
                Ok(server_progress) => {
                    progress.events_parsed += server_progress.0;
                    progress.keys_found += server_progress.1;
                    progress.unreachable_found += server_progress.2;
                }
                Err(e) => {
                    warn!("server {hostname} failed during crawl: {e}");
                }
            }

            progress.servers_done += 1;
            progress.queue_size = queue.len();
            on_progress(progress);

            job.record_progress(
                &mut self.conn()?,
                progress.servers_done,
                progress.events_parsed,
                progress.keys_found,
                progress.unreachable_found,
            )
            .map_err(|e| e.to_string())?;
        }

        job.transition(&mut self.conn()?, ScanJobStatus::Completed)
            .map_err(|e| e.to_string())?;
        ScanLogger::log_job_finished(job.id, "completed", progress.servers_done, progress.events_parsed);
        Ok(())
    }

    /// Refreshes every server already known to the graph without growing
    /// it: one depth-0 scan per row in `server`, under a single `job`.
    /// This is what `ScanJobType::Full` drives — it catches key rotations
    /// and revoked grants on servers no crawl currently reaches because
    /// every path to them already got recorded.
    pub async fn rescan_known_fleet(
        &self,
        job: &ScanJob,
        login: &str,
        mut on_progress: impl FnMut(Progress),
    ) -> Result<(), String> {
        job.transition(&mut self.conn()?, ScanJobStatus::Running)
            .map_err(|e| e.to_string())?;
        ScanLogger::log_job_started(job.id, "full", None);

        let servers = Server::list_all(&mut self.conn()?).map_err(|e| e.to_string())?;

        let mut progress = Progress {
            servers_done: 0,
            queue_size: servers.len(),
            events_parsed: 0,
            keys_found: 0,
            unreachable_found: 0,
        };

        let mut dummy_queue: VecDeque<(String, String, u32, Option<i32>)> = VecDeque::new();
        let mut dummy_visited: HashSet<String> = HashSet::new();

        for server in &servers {
            if ScanJob::is_cancelled(&mut self.conn()?, job.id).map_err(|e| e.to_string())? {
                job.transition(&mut self.conn()?, ScanJobStatus::Cancelled)
                    .map_err(|e| e.to_string())?;
                ScanLogger::log_job_finished(job.id, "cancelled", progress.servers_done, progress.events_parsed);
                return Ok(());
            }

            match self
                .scan_one_server(
                    &server.hostname,
                    &server.ip,
                    server.ssh_port,
                    login,
                    None,
                    &mut dummy_queue,
                    &mut dummy_visited,
                    0,
                    0,
                )
                .await
            {
                Ok(server_progress) => {
                    progress.events_parsed += server_progress.0;
                    progress.keys_found += server_progress.1;
                    progress.unreachable_found += server_progress.2;
                }
                Err(e) => {
                    warn!("server {} failed during full rescan: {e}", server.hostname);
                }
            }

            progress.servers_done += 1;
            progress.queue_size = servers.len() - progress.servers_done as usize;
            on_progress(progress);

            job.record_progress(
                &mut self.conn()?,
                progress.servers_done,
                progress.events_parsed,
                progress.keys_found,
                progress.unreachable_found,
            )
            .map_err(|e| e.to_string())?;
        }

        job.transition(&mut self.conn()?, ScanJobStatus::Completed)
            .map_err(|e| e.to_string())?;
        ScanLogger::log_job_finished(job.id, "completed", progress.servers_done, progress.events_parsed);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn scan_one_server(
        &self,
        hostname: &str,
        ip: &str,
        ssh_port: i32,
        login: &str,
        jump_via: Option<i32>,
        queue: &mut VecDeque<(String, String, u32, Option<i32>)>,
        visited: &mut HashSet<String>,
        depth: u32,
        max_depth: u32,
    ) -> Result<(i32, i32, i32), String> {
        let mut conn = self.conn()?;
        let server = Server::get_or_create(&mut conn, hostname, ip, ssh_port).map_err(|e| e.to_string())?;

        if server.has_fresh_agent_heartbeat(AGENT_HEARTBEAT_FRESHNESS_SECS) {
            info!("{hostname}: skipping SSH scan, agent heartbeat is fresh");
            return Ok((0, 0, 0));
        }

        let chain = vec![
            ConnectionDetails::new(
                hostname.to_owned(),
                ip.to_owned(),
                server.ssh_port as u16,
                login.to_owned(),
                jump_via,
            )
            .await
            .map_err(|e| e.to_string())?,
        ];

        let lease = match self.pool.acquire(&chain, server.id).await {
            Ok(lease) => lease,
            Err(e) => {
                server.set_reachable(&mut conn, false).map_err(|err| err.to_string())?;
                server.set_last_error(&mut conn, Some(&e.to_string())).map_err(|err| err.to_string())?;
                return Err(e.to_string());
            }
        };
        server.set_reachable(&mut conn, true).map_err(|e| e.to_string())?;

        let session = lease.open_sftp().await.map_err(|e| e.to_string())?;
        let sftp = SftpReader::new(&session);

        let (os_type, events) = self.read_and_parse_logs(&sftp, &server, hostname).await;
        server.set_os_type(&mut conn, os_type).map_err(|e| e.to_string())?;

        let new_watermark = events.iter().map(|e| e.event_time).max();

        let new_events: Vec<NewAccessEvent> = events
            .iter()
            .map(|e| NewAccessEvent {
                target_server_id: server.id,
                source_ip: e.source_ip.clone(),
                source_server_id: None,
                ssh_key_id: None,
                fingerprint: e.fingerprint.clone(),
                username: e.username.clone(),
                auth_method: e.auth_method.as_str().to_owned(),
                event_type: e.event_type.as_str().to_owned(),
                event_time: e.event_time,
                raw_log_line: e.raw_log_line.clone(),
                log_source: "ssh".to_owned(),
            })
            .collect();

        let inserted = AccessEvent::insert_batch(&mut conn, &new_events).map_err(|e| e.to_string())?;

        let scan_outcome = scanner::scan_server(&sftp).await;
        let fingerprints: Vec<String> = scan_outcome
            .keys
            .iter()
            .map(|k| k.parsed.fingerprint_sha256.clone())
            .collect();

        for found in &scan_outcome.keys {
            let key = SSHKey::get_or_create(
                &mut conn,
                &found.parsed.fingerprint_sha256,
                &found.parsed.fingerprint_md5,
                found.parsed.key_type,
                found.parsed.key_bits,
                found.parsed.comment.as_deref(),
                found.file_type == crate::models::FileType::HostKey,
                found.file_mtime,
            )
            .map_err(|e| e.to_string())?;

            KeyLocation::upsert(
                &mut conn,
                server.id,
                key.id,
                &found.file_path,
                found.file_type,
                found.unix_owner.as_deref(),
                found.unix_perms,
                found.file_mtime,
                found.file_size,
            )
            .map_err(|e| e.to_string())?;

            if found.file_type == crate::models::FileType::AuthorizedKeys {
                AccessPath::record_authorization(
                    &mut conn,
                    server.id,
                    key.id,
                    found.unix_owner.as_deref().unwrap_or(""),
                    server.created_at,
                )
                .map_err(|e| e.to_string())?;
            }
        }

        let key_ids = SSHKey::prefetch_by_fingerprints(&mut conn, &fingerprints).map_err(|e| e.to_string())?;

        let mut new_sources: Vec<String> = Vec::new();
        for event in &events {
            if event.event_type != EventType::Accepted {
                continue;
            }
            let ssh_key_id = event.fingerprint.as_ref().and_then(|fp| key_ids.get(fp)).copied();

            let source_server = Server::get_or_create(&mut conn, &event.source_ip, &event.source_ip, ssh_port)
                .map_err(|e| e.to_string())?;

            AccessPath::record_usage(
                &mut conn,
                Some(source_server.id),
                server.id,
                ssh_key_id,
                &event.username,
                event.event_time,
            )
            .map_err(|e| e.to_string())?;

            if visited.insert(canonical_key(&event.source_ip, &event.source_ip)) {
                new_sources.push(event.source_ip.clone());
            }
        }

        let mut unreachable_found = 0;
        for source_ip in new_sources {
            if self.unreachable.is_reachable(&source_ip, ssh_port as u16).await {
                if depth < max_depth {
                    queue.push_back((source_ip.clone(), source_ip, depth + 1, Some(server.id)));
                }
            } else {
                let has_accepted = events
                    .iter()
                    .any(|e| e.source_ip == source_ip && e.event_type == EventType::Accepted);
                let username = events
                    .iter()
                    .find(|e| e.source_ip == source_ip)
                    .map(|e| e.username.clone())
                    .unwrap_or_default();
                let severity = crate::unreachable::classify_severity(has_accepted, &username, &source_ip);
                let reverse_dns = self.unreachable.reverse_dns(&source_ip).await;

                crate::models::UnreachableSource::upsert(
                    &mut conn,
                    &source_ip,
                    reverse_dns.as_deref(),
                    None,
                    None,
                    server.id,
                    &username,
                    server.created_at,
                    severity,
                )
                .map_err(|e| e.to_string())?;
                unreachable_found += 1;
            }
        }

        if let Some(watermark) = new_watermark {
            server.advance_watermark(&mut conn, watermark).map_err(|e| e.to_string())?;
        }

        ScanLogger::log_server_scanned(hostname, scan_outcome.keys.len(), events.len());
        ScanLogger::log_parse_errors(hostname, "keys", scan_outcome.malformed_keys);

        Ok((inserted as i32, scan_outcome.keys.len() as i32, unreachable_found))
    }

    async fn read_and_parse_logs(
        &self,
        sftp: &SftpReader<'_>,
        server: &Server,
        hostname: &str,
    ) -> (OsType, Vec<logparse::LogEvent>) {
        let max_lines = if server.last_scanned_at.is_some() {
            self.log_config.max_lines_incremental as usize
        } else {
            self.log_config.max_lines_initial as usize
        };

        if let Ok(lines) = sftp.read_file_tail("/run/log/journal", max_lines).await {
            let text = lines.join("\n");
            let outcome = logparse::parse_journald(&text, Some(server.scan_watermark));
            if !outcome.events.is_empty() || !text.is_empty() {
                return (OsType::Linux, outcome.events);
            }
        }

        for (path, dialect) in SYSLOG_CANDIDATES {
            if !sftp.exists(path).await {
                continue;
            }
            let Ok(lines) = sftp.read_file_tail(path, max_lines).await else {
                continue;
            };
            let reference_time = sftp
                .stat(path)
                .await
                .ok()
                .and_then(|m| m.mtime)
                .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
                .unwrap_or_else(OffsetDateTime::now_utc);

            let text = lines.join("\n");
            let outcome = logparse::parse_syslog(&text, *dialect, reference_time, Some(server.scan_watermark));
            ScanLogger::log_parse_errors(hostname, path, outcome.malformed_lines);

            let os_type = if *dialect == Dialect::Aix {
                OsType::Aix
            } else {
                OsType::Linux
            };
            return (os_type, outcome.events);
        }

        (OsType::Unknown, Vec::new())
    }

    fn conn(
        &self,
    ) -> Result<diesel::r2d2::PooledConnection<diesel::r2d2::ConnectionManager<crate::DbConnection>>, String> {
        self.db.get().map_err(|e| e.to_string())
    }
}

fn canonical_key(hostname: &str, ip: &str) -> String {
    format!("{hostname}|{ip}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_key_distinguishes_hostname_and_ip() {
        assert_eq!(canonical_key("web-1", "10.0.0.1"), "web-1|10.0.0.1");
        assert_ne!(canonical_key("web-1", "10.0.0.1"), canonical_key("web-1", "10.0.0.2"));
        assert_ne!(canonical_key("web-1", "10.0.0.1"), canonical_key("web-2", "10.0.0.1"));
    }

    #[test]
    fn canonical_key_is_stable_for_visited_set_dedup() {
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(canonical_key("jump", "10.0.0.1"));
        assert!(visited.contains(&canonical_key("jump", "10.0.0.1")));
        assert!(!visited.contains(&canonical_key("jump", "10.0.0.2")));
    }
}
