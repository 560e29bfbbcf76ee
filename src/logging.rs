/// Standardized logging utilities for consistent logging across the application
///
/// This module provides logging functions that:
/// - Use appropriate log levels (debug, info, warn, error)
/// - Include structured context information
/// - Follow consistent formatting

use log::{debug, error, info, warn};
use actix_web::HttpRequest;

/// Standardized request logging for the agent ingest API
pub struct RequestLogger<'a> {
    req: &'a HttpRequest,
}

impl<'a> RequestLogger<'a> {
    pub fn new(req: &'a HttpRequest) -> Self {
        Self { req }
    }

    pub fn log_request_start(&self, operation: &str) {
        info!(
            "API_REQUEST_START method={} path={} operation={}",
            self.req.method(),
            self.req.path(),
            operation
        );
    }

    pub fn log_request_complete(&self, operation: &str, duration_ms: u64, status: u16) {
        let method = self.req.method();
        let path = self.req.path();
        let level = if status >= 500 {
            log::Level::Error
        } else if status >= 400 {
            log::Level::Warn
        } else {
            log::Level::Info
        };

        match level {
            log::Level::Error => error!(
                "API_REQUEST_COMPLETE method={} path={} operation={} status={} duration_ms={}",
                method, path, operation, status, duration_ms
            ),
            log::Level::Warn => warn!(
                "API_REQUEST_COMPLETE method={} path={} operation={} status={} duration_ms={}",
                method, path, operation, status, duration_ms
            ),
            _ => info!(
                "API_REQUEST_COMPLETE method={} path={} operation={} status={} duration_ms={}",
                method, path, operation, status, duration_ms
            ),
        }
    }
}

/// Database operation logging
pub struct DatabaseLogger;

impl DatabaseLogger {
    pub fn log_operation_success(operation: &str, table: &str, record_count: Option<usize>) {
        match record_count {
            Some(count) => info!("DB_OPERATION_SUCCESS operation={} table={} records={}", operation, table, count),
            None => debug!("DB_OPERATION_SUCCESS operation={} table={}", operation, table),
        }
    }

    pub fn log_operation_error(operation: &str, table: &str, error: &str) {
        error!("DB_OPERATION_ERROR operation={} table={} error={}", operation, table, error);
    }

    pub fn log_connection_event(event: &str, pool_size: usize) {
        match event {
            "exhausted" => warn!("DB_CONNECTION_EXHAUSTED pool_size={}", pool_size),
            "restored" => info!("DB_CONNECTION_RESTORED pool_size={}", pool_size),
            _ => debug!("DB_CONNECTION_EVENT event={} pool_size={}", event, pool_size),
        }
    }
}

/// Agent ingest API logging
pub struct AgentLogger;

impl AgentLogger {
    pub fn log_auth_failure(server_hostname: &str, reason: &str) {
        warn!("AGENT_AUTH_FAILURE server={} reason={}", server_hostname, reason);
    }

    pub fn log_heartbeat(server_hostname: &str, agent_version: &str) {
        debug!("AGENT_HEARTBEAT server={} version={}", server_hostname, agent_version);
    }

    pub fn log_events_ingested(server_hostname: &str, count: usize, inserted: usize) {
        info!(
            "AGENT_EVENTS_INGESTED server={} received={} inserted={}",
            server_hostname, count, inserted
        );
    }

    pub fn log_keys_ingested(server_hostname: &str, count: usize) {
        info!("AGENT_KEYS_INGESTED server={} count={}", server_hostname, count);
    }
}

/// SSH pool and connection logging
pub struct SshLogger;

impl SshLogger {
    pub fn log_connection_attempt(host: &str, username: &str) {
        info!("SSH_CONNECTION_ATTEMPT host={} username={}", host, username);
    }

    pub fn log_connection_success(host: &str, username: &str) {
        info!("SSH_CONNECTION_SUCCESS host={} username={}", host, username);
    }

    pub fn log_connection_failure(host: &str, username: &str, error: &str) {
        warn!("SSH_CONNECTION_FAILURE host={} username={} error={}", host, username, error);
    }

    pub fn log_pool_exhausted(host: &str, waited_ms: u64) {
        warn!("SSH_POOL_EXHAUSTED host={} waited_ms={}", host, waited_ms);
    }

    pub fn log_host_key_trusted(host: &str, fingerprint: &str) {
        debug!("SSH_HOST_KEY_TRUSTED host={} fingerprint={}", host, fingerprint);
    }
}

/// Scanner and spider crawl logging
pub struct ScanLogger;

impl ScanLogger {
    pub fn log_job_started(job_id: i32, job_type: &str, seed: Option<&str>) {
        info!(
            "SCAN_JOB_STARTED job_id={} job_type={} seed={}",
            job_id, job_type, seed.unwrap_or("fleet")
        );
    }

    pub fn log_job_finished(job_id: i32, status: &str, servers_done: i32, events_parsed: i32) {
        info!(
            "SCAN_JOB_FINISHED job_id={} status={} servers_done={} events_parsed={}",
            job_id, status, servers_done, events_parsed
        );
    }

    pub fn log_server_scanned(hostname: &str, keys_found: usize, events_found: usize) {
        debug!(
            "SCAN_SERVER_DONE hostname={} keys_found={} events_found={}",
            hostname, keys_found, events_found
        );
    }

    pub fn log_server_failed(hostname: &str, error: &str) {
        warn!("SCAN_SERVER_FAILED hostname={} error={}", hostname, error);
    }

    pub fn log_parse_errors(hostname: &str, log_source: &str, malformed_lines: usize) {
        if malformed_lines > 0 {
            warn!(
                "SCAN_PARSE_ERRORS hostname={} log_source={} malformed_lines={}",
                hostname, log_source, malformed_lines
            );
        }
    }
}

/// Unreachable-source detection logging
pub struct UnreachableLogger;

impl UnreachableLogger {
    pub fn log_unreachable_source(source_ip: &str, target: &str, severity: &str) {
        match severity {
            "critical" => error!("UNREACHABLE_SOURCE_CRITICAL ip={} target={}", source_ip, target),
            "high" => warn!("UNREACHABLE_SOURCE_HIGH ip={} target={}", source_ip, target),
            _ => info!("UNREACHABLE_SOURCE ip={} target={} severity={}", source_ip, target, severity),
        }
    }
}

/// Persistent tail watcher logging
pub struct WatcherLogger;

impl WatcherLogger {
    pub fn log_started(hostname: &str) {
        info!("WATCHER_STARTED hostname={}", hostname);
    }

    pub fn log_disconnected(hostname: &str, reason: &str) {
        warn!("WATCHER_DISCONNECTED hostname={} reason={}", hostname, reason);
    }

    pub fn log_reconnecting(hostname: &str, attempt: u32, delay_ms: u64) {
        info!(
            "WATCHER_RECONNECTING hostname={} attempt={} delay_ms={}",
            hostname, attempt, delay_ms
        );
    }

    pub fn log_stopped(hostname: &str) {
        info!("WATCHER_STOPPED hostname={}", hostname);
    }
}

/// Application lifecycle logging
pub struct AppLogger;

impl AppLogger {
    pub fn log_startup(component: &str, version: &str) {
        info!("APP_STARTUP component={} version={}", component, version);
    }

    pub fn log_shutdown(component: &str, reason: &str) {
        info!("APP_SHUTDOWN component={} reason={}", component, reason);
    }

    pub fn log_config_loaded(source: &str, keys_loaded: usize) {
        info!("CONFIG_LOADED source={} keys={}", source, keys_loaded);
    }

    pub fn log_config_error(error: &str, fatal: bool) {
        if fatal {
            error!("CONFIG_ERROR_FATAL error={}", error);
        } else {
            warn!("CONFIG_ERROR_RECOVERABLE error={}", error);
        }
    }
}
