use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use surge_ping::{Client, Config, ICMP, PingIdentifier, PingSequence, SurgeError};

use crate::dns_cache::DnsCache;
use crate::ping::ProbeOutcome;
use crate::probe::{ProbeError, ProbeExecutor};

const PAYLOAD: [u8; 32] = [0; 32];

/// Strips a trailing `:port` and checks that only hostname characters remain.
fn sanitize_hostname(hostname: &str) -> Option<&str> {
    let hostname = hostname.split(':').next().unwrap_or(hostname).trim();

    let valid = !hostname.is_empty()
        && hostname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    valid.then_some(hostname)
}

/// ICMP echo executor built on `surge-ping`, resolving hostnames through a
/// shared [`DnsCache`].
pub struct IcmpExecutor {
    dns: Mutex<DnsCache>,
    next_identifier: AtomicU16,
}

impl Default for IcmpExecutor {
    fn default() -> Self {
        Self::new(DnsCache::default())
    }
}

impl IcmpExecutor {
    pub fn new(dns: DnsCache) -> Self {
        Self {
            dns: Mutex::new(dns),
            next_identifier: AtomicU16::new(1),
        }
    }

    fn dns(&self) -> MutexGuard<'_, DnsCache> {
        self.dns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn resolve_target(&self, target: &str) -> Result<IpAddr, ProbeError> {
        if let Ok(ip) = target.parse::<IpAddr>() {
            return Ok(ip);
        }

        let hostname =
            sanitize_hostname(target).ok_or_else(|| ProbeError::InvalidTarget(target.to_string()))?;

        if let Some(ip) = self.dns().get_valid_ip(hostname) {
            return Ok(ip);
        }

        let ip = tokio::net::lookup_host((hostname, 0))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .map(|addr| addr.ip())
            .ok_or_else(|| ProbeError::Resolve(hostname.to_string()))?;

        let mut dns = self.dns();
        dns.purge_expired();
        dns.insert(hostname, ip);
        Ok(ip)
    }
}

#[async_trait]
impl ProbeExecutor for IcmpExecutor {
    async fn probe(&self, host: &str, timeout: Duration) -> Result<ProbeOutcome, ProbeError> {
        let target_ip = self.resolve_target(host).await?;

        let kind = if target_ip.is_ipv4() { ICMP::V4 } else { ICMP::V6 };
        let client = Client::new(&Config::builder().kind(kind).build())?;

        let identifier = PingIdentifier(self.next_identifier.fetch_add(1, Ordering::Relaxed));
        let mut pinger = client.pinger(target_ip, identifier).await;
        pinger.timeout(timeout);

        match pinger.ping(PingSequence(0), &PAYLOAD).await {
            Ok((_, rtt)) => Ok(ProbeOutcome::success(rtt.as_secs_f64() * 1000.0)),
            Err(SurgeError::Timeout { .. }) => Ok(ProbeOutcome::timed_out()),
            Err(e) => {
                // The address may be stale; look it up again next time.
                if let Some(hostname) = sanitize_hostname(host) {
                    self.dns().invalidate(hostname);
                }
                Err(e.into())
            }
        }
    }
}
