use core::fmt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PrivateKey, PublicKey};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::config::SshConfig;
use crate::logging::SshLogger;

use super::ConnectionDetails;

#[derive(Debug, Clone)]
pub enum SshClientError {
    NoSuchHost,
    /// Failed to get address from name lookup
    LookupFailure,
    ConnectFailed(String),
    AuthFailed,
    Timeout,
    /// Waited past the pool's bound for a free session slot
    PoolExhausted,
    ExecutionError(String),
    /// Can't connect because jump host isn't working
    IndirectError(String, Box<SshClientError>),
    SshError(String),
}

impl fmt::Display for SshClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSuchHost => write!(f, "the host doesn't exist"),
            Self::LookupFailure => write!(f, "failed to resolve hostname to an address"),
            Self::ConnectFailed(reason) => write!(f, "connection failed: {reason}"),
            Self::AuthFailed => write!(f, "authentication failed"),
            Self::Timeout => write!(f, "connection to this host timed out"),
            Self::PoolExhausted => write!(f, "no free SSH session slot within the configured wait"),
            Self::ExecutionError(t) => write!(f, "{t}"),
            Self::IndirectError(host, original_error) => {
                write!(f, "cannot connect via jump host {host}: {original_error}")
            }
            Self::SshError(t) => write!(f, "{t}"),
        }
    }
}

impl std::error::Error for SshClientError {}

impl From<russh::Error> for SshClientError {
    fn from(value: russh::Error) -> Self {
        match value {
            russh::Error::NotAuthenticated => Self::AuthFailed,
            _ => Self::SshError(value.to_string()),
        }
    }
}

/// Trusts whatever host key is presented. The fleet's `Server` entity
/// carries no pinned fingerprint, so every first contact is a TOFU accept.
#[derive(Debug)]
struct SshHandler {
    host_name: String,
}

impl russh::client::Handler for SshHandler {
    type Error = SshClientError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(russh::keys::HashAlg::default());
        SshLogger::log_host_key_trusted(&self.host_name, &fingerprint.to_string());
        Ok(true)
    }
}

struct PooledSession {
    handle: Arc<russh::client::Handle<SshHandler>>,
}

/// A leased, authenticated SSH session. Drops release both the global and
/// per-server semaphore permits, regardless of how the lease was used.
pub struct SshLease {
    handle: Arc<russh::client::Handle<SshHandler>>,
    _global_permit: OwnedSemaphorePermit,
    _server_permit: OwnedSemaphorePermit,
}

impl SshLease {
    pub async fn open_sftp(
        &self,
    ) -> Result<russh_sftp::client::SftpSession, SshClientError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(SshClientError::from)?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(SshClientError::from)?;
        russh_sftp::client::SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SshClientError::ExecutionError(format!("sftp handshake failed: {e}")))
    }
}

/// Bounded pool of authenticated SSH sessions: a global cap and a
/// per-server cap, each enforced with a `Semaphore`. Sessions are cached
/// per server and health-checked on reuse; the health check always runs
/// after the cache lock is released so one slow probe can't stall every
/// other lease.
pub struct SshPool {
    key: Arc<PrivateKey>,
    config: SshConfig,
    connection_config: Arc<russh::client::Config>,
    global: Arc<Semaphore>,
    per_server: Mutex<HashMap<i32, Arc<Semaphore>>>,
    sessions: Mutex<HashMap<i32, PooledSession>>,
}

impl SshPool {
    pub fn new(key: PrivateKey, config: SshConfig) -> Self {
        let max_total = config.max_total as usize;
        Self {
            key: Arc::new(key),
            global: Arc::new(Semaphore::new(max_total)),
            config,
            connection_config: Arc::new(russh::client::Config::default()),
            per_server: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    async fn server_semaphore(&self, server_id: i32) -> Arc<Semaphore> {
        let mut map = self.per_server.lock().await;
        map.entry(server_id)
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_per_server as usize)))
            .clone()
    }

    /// Leases a session to `server_id`, reusing a cached connection when one
    /// is healthy. `chain` is the sequence of hops from the jump host (first)
    /// to the target (last); each intermediate hop is dialed in turn and
    /// used as the transport for the next.
    pub async fn acquire(
        &self,
        chain: &[ConnectionDetails],
        server_id: i32,
    ) -> Result<SshLease, SshClientError> {
        let server_sem = self.server_semaphore(server_id).await;

        let global_permit = tokio::time::timeout(self.config.connect_timeout, self.global.clone().acquire_owned())
            .await
            .map_err(|_| SshClientError::PoolExhausted)?
            .expect("semaphore never closed");
        let server_permit = tokio::time::timeout(self.config.connect_timeout, server_sem.acquire_owned())
            .await
            .map_err(|_| SshClientError::PoolExhausted)?
            .expect("semaphore never closed");

        if let Some(handle) = self.try_reuse(server_id).await {
            return Ok(SshLease {
                handle,
                _global_permit: global_permit,
                _server_permit: server_permit,
            });
        }

        let handle = Arc::new(self.dial_chain(chain).await?);
        {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(
                server_id,
                PooledSession {
                    handle: handle.clone(),
                },
            );
        }

        Ok(SshLease {
            handle,
            _global_permit: global_permit,
            _server_permit: server_permit,
        })
    }

    /// Looks up a cached session, releasing the map lock before probing it.
    async fn try_reuse(&self, server_id: i32) -> Option<Arc<russh::client::Handle<SshHandler>>> {
        let candidate = {
            let sessions = self.sessions.lock().await;
            sessions.get(&server_id).map(|s| s.handle.clone())
        };
        let candidate = candidate?;
        if candidate.channel_open_session().await.is_ok() {
            Some(candidate)
        } else {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(&server_id);
            None
        }
    }

    fn dial_chain<'a>(
        &'a self,
        chain: &'a [ConnectionDetails],
    ) -> BoxFuture<'a, Result<russh::client::Handle<SshHandler>, SshClientError>> {
        async move {
            let (first, rest) = chain
                .split_first()
                .ok_or_else(|| SshClientError::ConnectFailed("empty connection chain".to_owned()))?;

            let mut handle = self.dial_direct(first).await?;

            for hop in rest {
                let stream = self.open_jump_stream(&handle, hop.address).await?;
                handle = self.authenticate_stream(stream, hop).await?;
            }

            Ok(handle)
        }
        .boxed()
    }

    async fn dial_direct(
        &self,
        details: &ConnectionDetails,
    ) -> Result<russh::client::Handle<SshHandler>, SshClientError> {
        details.log_connection();
        let handler = SshHandler {
            host_name: details.host_name.clone(),
        };
        let handle = tokio::time::timeout(
            self.config.connect_timeout,
            russh::client::connect(self.connection_config.clone(), details.address, handler),
        )
        .await
        .map_err(|_| {
            SshLogger::log_connection_failure(&details.host_name, &details.login, "connect timeout");
            SshClientError::Timeout
        })?
        .map_err(|e| {
            SshLogger::log_connection_failure(&details.host_name, &details.login, &e.to_string());
            SshClientError::ConnectFailed(e.to_string())
        })?;

        self.authenticate(handle, details).await
    }

    async fn open_jump_stream(
        &self,
        via: &russh::client::Handle<SshHandler>,
        target: SocketAddr,
    ) -> Result<russh::ChannelStream<russh::client::Msg>, SshClientError> {
        tokio::time::timeout(
            self.config.connect_timeout,
            via.channel_open_direct_tcpip(target.ip().to_string(), target.port().into(), "127.0.0.1", 0),
        )
        .await
        .map_err(|_| SshClientError::Timeout)?
        .map(|c| c.into_stream())
        .map_err(SshClientError::from)
    }

    async fn authenticate_stream(
        &self,
        stream: russh::ChannelStream<russh::client::Msg>,
        details: &ConnectionDetails,
    ) -> Result<russh::client::Handle<SshHandler>, SshClientError> {
        details.log_connection();
        let handler = SshHandler {
            host_name: details.host_name.clone(),
        };
        let handle = russh::client::connect_stream(self.connection_config.clone(), stream, handler)
            .await
            .map_err(|e| SshClientError::IndirectError(details.host_name.clone(), Box::new(e.into())))?;
        self.authenticate(handle, details).await
    }

    async fn authenticate(
        &self,
        handle: russh::client::Handle<SshHandler>,
        details: &ConnectionDetails,
    ) -> Result<russh::client::Handle<SshHandler>, SshClientError> {
        let hash_alg = handle.best_supported_rsa_hash().await?;

        if !handle
            .authenticate_publickey(
                details.login.clone(),
                PrivateKeyWithHashAlg::new(self.key.clone(), hash_alg.flatten()),
            )
            .await?
            .success()
        {
            SshLogger::log_connection_failure(&details.host_name, &details.login, "authentication failed");
            return Err(SshClientError::AuthFailed);
        }

        SshLogger::log_connection_success(&details.host_name, &details.login);
        Ok(handle)
    }

    /// Drops every cached session without waiting for in-flight leases.
    pub async fn close_all(&self) {
        self.sessions.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::SshConfig;

    fn test_config(max_total: u32, max_per_server: u32) -> SshConfig {
        SshConfig {
            private_key_file: "keys/id_keyspider".into(),
            private_key_passphrase: None,
            login: "root".to_owned(),
            max_total,
            max_per_server,
            connect_timeout: Duration::from_millis(50),
            command_timeout: Duration::from_secs(5),
        }
    }

    fn test_key() -> PrivateKey {
        PrivateKey::random(&mut rand::thread_rng(), russh::keys::Algorithm::Ed25519).unwrap()
    }

    #[tokio::test]
    async fn per_server_semaphore_is_cached_and_scoped_to_config() {
        let pool = SshPool::new(test_key(), test_config(10, 2));
        let sem_a = pool.server_semaphore(1).await;
        let sem_b = pool.server_semaphore(1).await;
        assert!(Arc::ptr_eq(&sem_a, &sem_b), "same server id reuses the same semaphore");
        assert_eq!(sem_a.available_permits(), 2);

        let sem_other = pool.server_semaphore(2).await;
        assert!(!Arc::ptr_eq(&sem_a, &sem_other));
    }

    #[tokio::test]
    async fn global_cap_blocks_once_exhausted() {
        let pool = SshPool::new(test_key(), test_config(1, 5));
        let first = pool.global.clone().acquire_owned().await.unwrap();
        let result = tokio::time::timeout(Duration::from_millis(20), pool.global.clone().acquire_owned()).await;
        assert!(result.is_err(), "second acquire should block while the only global permit is held");
        drop(first);
        assert!(pool.global.clone().try_acquire_owned().is_ok(), "permit is released back once dropped");
    }

    #[tokio::test]
    async fn acquire_times_out_when_pool_is_exhausted() {
        let pool = SshPool::new(test_key(), test_config(1, 5));
        let _held = pool.global.clone().acquire_owned().await.unwrap();

        let err = pool
            .acquire(&[], 1)
            .await
            .expect_err("empty chain with an exhausted pool should fail before dialing");
        assert!(matches!(err, SshClientError::PoolExhausted));
    }
}

