use std::sync::Arc;
use std::time::Duration;

use log::warn;
use rand::Rng;
use tokio::sync::broadcast;
use tokio::sync::Mutex;

use crate::config::{LogTailConfig, WatcherConfig};
use crate::logging::WatcherLogger;
use crate::logparse::{self, Dialect, LogEvent};
use crate::models::{AccessEvent, EventType, NewAccessEvent, ScanJobType, Server, WatchSession, WatchStatus};
use crate::sftp::SftpReader;
use crate::spider::SpiderEngine;
use crate::ssh::{ConnectionDetails, SshPool};
use crate::ConnectionPool;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Sent to every subscriber of a watch; `Shutdown` is the sentinel a
/// consumer uses to know the tail loop stopped for good.
#[derive(Debug, Clone)]
pub enum WatchMessage {
    Event(LogEvent),
    Shutdown,
}

struct FileState {
    path: String,
    dialect: Dialect,
    size: u64,
    inode_hint: Option<i64>,
}

/// Drives one server's persistent log tail: polls for growth, re-parses
/// new bytes, reconnects with full-jitter backoff on failure, and fans
/// events out to every subscriber over a bounded broadcast channel.
pub struct TailWatcher {
    server_id: i32,
    hostname: String,
    ip: String,
    login: String,
    pool: Arc<SshPool>,
    db: ConnectionPool,
    watcher_config: WatcherConfig,
    log_config: LogTailConfig,
    tx: broadcast::Sender<WatchMessage>,
    paused: Arc<Mutex<bool>>,
    stop: Arc<tokio::sync::Notify>,
    /// Current depth of this watch relative to the crawl that discovered
    /// `server_id`; bounds how far auto-spider is allowed to expand from here.
    current_depth: u32,
    spider: Arc<SpiderEngine>,
}

impl TailWatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        server_id: i32,
        hostname: String,
        ip: String,
        login: String,
        pool: Arc<SshPool>,
        db: ConnectionPool,
        watcher_config: WatcherConfig,
        log_config: LogTailConfig,
        current_depth: u32,
        spider: Arc<SpiderEngine>,
    ) -> (Self, broadcast::Receiver<WatchMessage>) {
        let (tx, rx) = broadcast::channel(1024);
        (
            Self {
                server_id,
                hostname,
                ip,
                login,
                pool,
                db,
                watcher_config,
                log_config,
                tx,
                paused: Arc::new(Mutex::new(false)),
                stop: Arc::new(tokio::sync::Notify::new()),
                current_depth,
                spider,
            },
            rx,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchMessage> {
        self.tx.subscribe()
    }

    pub async fn pause(&self) {
        *self.paused.lock().await = true;
    }

    pub async fn resume(&self) {
        *self.paused.lock().await = false;
    }

    pub fn stop(&self) {
        self.stop.notify_waiters();
    }

    /// Runs until `stop()` is called. Each reconnect attempt backs off with
    /// full jitter, bounded by `watcher.max_reconnect_delay`.
    pub async fn run(self: Arc<Self>) {
        WatcherLogger::log_started(&self.hostname);

        match self.conn() {
            Ok(mut conn) => {
                if let Err(e) = WatchSession::get_or_create(
                    &mut conn,
                    self.server_id,
                    self.watcher_config.auto_spider,
                    self.watcher_config.spider_depth as i32,
                ) {
                    warn!("{}: couldn't create watch session: {e}", self.hostname);
                }
            }
            Err(e) => warn!("{}: couldn't reach database: {e}", self.hostname),
        }

        let mut attempt: u32 = 0;

        loop {
            let run_once = self.run_until_disconnect();
            tokio::select! {
                result = run_once => {
                    match result {
                        Ok(()) => {
                            WatcherLogger::log_stopped(&self.hostname);
                            self.set_status(WatchStatus::Stopped);
                            return;
                        }
                        Err(reason) => {
                            WatcherLogger::log_disconnected(&self.hostname, &reason);
                            self.set_status(WatchStatus::Error);
                        }
                    }
                }
                _ = self.stop.notified() => {
                    WatcherLogger::log_stopped(&self.hostname);
                    self.set_status(WatchStatus::Stopped);
                    let _ = self.tx.send(WatchMessage::Shutdown);
                    return;
                }
            }

            attempt += 1;
            let delay = full_jitter_backoff(attempt, self.watcher_config.reconnect_delay, self.watcher_config.max_reconnect_delay);
            WatcherLogger::log_reconnecting(&self.hostname, attempt, delay.as_millis() as u64);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.stop.notified() => {
                    let _ = self.tx.send(WatchMessage::Shutdown);
                    return;
                }
            }
        }
    }

    /// One connect-and-poll cycle. Returns `Ok(())` only if told to stop
    /// cleanly; any connection/read failure returns `Err(reason)` so the
    /// caller can back off and retry.
    async fn run_until_disconnect(&self) -> Result<(), String> {
        let mut conn = self.conn()?;
        let server = Server::get_by_id(&mut conn, self.server_id)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "server no longer exists".to_owned())?;

        let chain = vec![ConnectionDetails::new(
            self.hostname.clone(),
            self.ip.clone(),
            server.ssh_port as u16,
            self.login.clone(),
            None,
        )
        .await
        .map_err(|e| e.to_string())?];

        let lease = self.pool.acquire(&chain, self.server_id).await.map_err(|e| e.to_string())?;
        let session = lease.open_sftp().await.map_err(|e| e.to_string())?;
        let sftp = SftpReader::new(&session);

        let mut state = self.discover_log_file(&sftp).await?;
        self.set_status(WatchStatus::Active);

        loop {
            if *self.paused.lock().await {
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }

            let meta = sftp.stat(&state.path).await.map_err(|e| e.to_string())?;
            let current_size = meta.size.unwrap_or(0) as u64;

            if current_size < state.size {
                // File rotated or truncated: start over from the beginning.
                state.size = 0;
            }

            if current_size > state.size {
                let grown = current_size - state.size;
                let max_lines = (grown / 64).max(1).min(self.log_config.max_lines_incremental as u64) as usize;
                let tail = sftp
                    .read_file_tail(&state.path, max_lines.max(1))
                    .await
                    .map_err(|e| e.to_string())?;
                self.ingest_lines(&tail, state.dialect).await?;
                state.size = current_size;
            }

            let _ = state.inode_hint;
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn discover_log_file(&self, sftp: &SftpReader<'_>) -> Result<FileState, String> {
        const CANDIDATES: &[(&str, Dialect)] = &[
            ("/var/log/auth.log", Dialect::Debian),
            ("/var/log/secure", Dialect::Rhel),
            ("/var/adm/syslog", Dialect::Aix),
        ];

        for (path, dialect) in CANDIDATES {
            if sftp.exists(path).await {
                let meta = sftp.stat(path).await.map_err(|e| e.to_string())?;
                return Ok(FileState {
                    path: (*path).to_owned(),
                    dialect: *dialect,
                    size: meta.size.unwrap_or(0) as u64,
                    inode_hint: None,
                });
            }
        }

        Err("no known auth log found on server".to_owned())
    }

    async fn ingest_lines(&self, lines: &[String], dialect: Dialect) -> Result<(), String> {
        let text = lines.join("\n");
        let reference_time = time::OffsetDateTime::now_utc();
        let outcome = logparse::parse_syslog(&text, dialect, reference_time, None);

        let mut conn = self.conn()?;
        let server = Server::get_by_id(&mut conn, self.server_id)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "server vanished mid-watch".to_owned())?;

        let new_events: Vec<NewAccessEvent> = outcome
            .events
            .iter()
            .map(|e| NewAccessEvent {
                target_server_id: self.server_id,
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

        AccessEvent::insert_batch(&mut conn, &new_events).map_err(|e| e.to_string())?;

        if let Some(watermark) = outcome.events.iter().map(|e| e.event_time).max() {
            server.advance_watermark(&mut conn, watermark).map_err(|e| e.to_string())?;
        }

        let auto_spider = self.watcher_config.auto_spider;
        let spider_depth = self.watcher_config.spider_depth;

        if let Ok(session) = WatchSession::get_or_create(&mut conn, self.server_id, auto_spider, spider_depth as i32) {
            for _ in &outcome.events {
                let _ = session.record_event(&mut conn);
            }
        }

        if auto_spider && self.current_depth < spider_depth {
            for event in &outcome.events {
                if event.event_type != EventType::Accepted {
                    continue;
                }
                self.maybe_spider_source(&mut conn, &server, event, spider_depth);
            }
        }

        for event in outcome.events {
            let _ = self.tx.send(WatchMessage::Event(event));
        }

        Ok(())
    }

    /// Enqueues a bounded spider crawl rooted at `event.source_ip` if it
    /// isn't already a known node, up to `spider_depth` hops past this watch.
    fn maybe_spider_source(&self, conn: &mut crate::DbConnection, server: &Server, event: &LogEvent, spider_depth: u32) {
        let already_known = match Server::get_by_ip(conn, &event.source_ip) {
            Ok(existing) => existing.is_some(),
            Err(e) => {
                warn!("{}: couldn't check source {}: {e}", self.hostname, event.source_ip);
                return;
            }
        };
        if already_known {
            return;
        }

        let remaining_depth = spider_depth.saturating_sub(self.current_depth + 1);
        let job = match crate::models::ScanJob::create(conn, ScanJobType::Spider, Some(server.id), remaining_depth as i32) {
            Ok(job) => job,
            Err(e) => {
                warn!("{}: couldn't create auto-spider job for {}: {e}", self.hostname, event.source_ip);
                return;
            }
        };

        let spider = self.spider.clone();
        let hostname = self.hostname.clone();
        let source_ip = event.source_ip.clone();
        let ssh_port = server.ssh_port;
        let login = self.login.clone();

        tokio::spawn(async move {
            let result = spider
                .run(&job, &source_ip, &source_ip, ssh_port, &login, Some(remaining_depth), |_| {})
                .await;
            if let Err(e) = result {
                warn!("{hostname}: auto-spider crawl from {source_ip} ended with error: {e}");
            }
        });
    }

    fn set_status(&self, status: WatchStatus) {
        if let Ok(mut conn) = self.conn() {
            if let Ok(session) = WatchSession::get_or_create(
                &mut conn,
                self.server_id,
                self.watcher_config.auto_spider,
                self.watcher_config.spider_depth as i32,
            ) {
                let _ = session.set_status(&mut conn, status);
            }
        }
    }

    fn conn(
        &self,
    ) -> Result<diesel::r2d2::PooledConnection<diesel::r2d2::ConnectionManager<crate::DbConnection>>, String> {
        self.db.get().map_err(|e| e.to_string())
    }
}

/// Full-jitter exponential backoff: `random(0, min(max, base * 2^attempt))`.
fn full_jitter_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let capped = base.as_millis().saturating_mul(1u128 << attempt.min(20)).min(max.as_millis());
    let capped = capped.max(1) as u64;
    let jittered = rand::thread_rng().gen_range(0..=capped);
    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_max() {
        for attempt in 0..30 {
            let delay = full_jitter_backoff(attempt, Duration::from_secs(5), Duration::from_secs(300));
            assert!(delay <= Duration::from_secs(300));
        }
    }

    #[test]
    fn backoff_grows_with_attempts_on_average() {
        let low = full_jitter_backoff(1, Duration::from_secs(5), Duration::from_secs(300));
        assert!(low <= Duration::from_secs(300));
    }
}
