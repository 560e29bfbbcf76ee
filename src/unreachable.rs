use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::{Duration, Instant};

use hickory_resolver::TokioAsyncResolver;
use log::debug;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::models::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reachability {
    Reachable,
    Unreachable,
}

struct CacheEntry {
    result: Reachability,
    checked_at: Instant,
}

/// Probes whether the jump host can itself reach a source IP, caching
/// results for `ttl` so repeated correlation of the same IP across many
/// servers doesn't re-dial every time.
pub struct UnreachableDetector {
    ttl: Duration,
    cache: Mutex<HashMap<(String, u16), CacheEntry>>,
    resolver: TokioAsyncResolver,
}

impl UnreachableDetector {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Mutex::new(HashMap::new()),
            resolver: TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
                debug!("falling back to default resolver config: {e}");
                TokioAsyncResolver::tokio(Default::default(), Default::default())
            }),
        }
    }

    pub async fn is_reachable(&self, ip: &str, port: u16) -> bool {
        let key = (ip.to_owned(), port);

        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&key) {
                if entry.checked_at.elapsed() < self.ttl {
                    return entry.result == Reachability::Reachable;
                }
            }
        }

        let result = probe(ip, port).await;

        let mut cache = self.cache.lock().await;
        cache.insert(
            key,
            CacheEntry {
                result,
                checked_at: Instant::now(),
            },
        );
        result == Reachability::Reachable
    }

    /// Opportunistic reverse DNS; failure (no PTR, timeout, unparseable
    /// address) is non-fatal and yields `None`.
    pub async fn reverse_dns(&self, ip: &str) -> Option<String> {
        let addr: IpAddr = ip.parse().ok()?;
        let lookup = tokio::time::timeout(Duration::from_secs(2), self.resolver.reverse_lookup(addr))
            .await
            .ok()?
            .ok()?;
        lookup.iter().next().map(|name| name.to_string().trim_end_matches('.').to_owned())
    }
}

async fn probe(ip: &str, port: u16) -> Reachability {
    let addr = format!("{ip}:{port}");
    match tokio::time::timeout(Duration::from_secs(5), TcpStream::connect(&addr)).await {
        Ok(Ok(_)) => Reachability::Reachable,
        Ok(Err(e)) => {
            debug!("unreachable probe failed for {addr}: {e}");
            Reachability::Unreachable
        }
        Err(_) => Reachability::Unreachable,
    }
}

/// RFC1918 check via the standard library's own classification.
pub fn is_rfc1918(ip: &str) -> bool {
    Ipv4Addr::from_str(ip)
        .map(|addr| addr.is_private())
        .unwrap_or(false)
}

/// Pure severity classification, delegating to `Severity::classify`.
pub fn classify_severity(has_accepted_event: bool, username: &str, source_ip: &str) -> Severity {
    Severity::classify(has_accepted_event, username == "root", is_rfc1918(source_ip))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc1918_detects_private_ranges() {
        assert!(is_rfc1918("10.0.0.1"));
        assert!(is_rfc1918("192.168.1.1"));
        assert!(is_rfc1918("172.16.0.1"));
        assert!(!is_rfc1918("8.8.8.8"));
    }

    #[test]
    fn rfc1918_rejects_non_ipv4() {
        assert!(!is_rfc1918("not-an-ip"));
        assert!(!is_rfc1918("::1"));
    }

    #[tokio::test]
    async fn reverse_dns_rejects_unparseable_address() {
        let detector = UnreachableDetector::new(Duration::from_secs(60));
        assert_eq!(detector.reverse_dns("not-an-ip").await, None);
    }

    #[test]
    fn severity_classification_matrix() {
        assert_eq!(classify_severity(true, "root", "8.8.8.8"), Severity::Critical);
        assert_eq!(classify_severity(true, "alice", "8.8.8.8"), Severity::High);
        assert_eq!(classify_severity(true, "alice", "10.0.0.1"), Severity::Medium);
        assert_eq!(classify_severity(false, "alice", "8.8.8.8"), Severity::Low);
        assert_eq!(classify_severity(false, "root", "10.0.0.1"), Severity::Low);
    }
}
