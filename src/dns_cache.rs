use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

pub const DEFAULT_DNS_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct DnsCacheEntry {
    ip_address: IpAddr,
    cached_at: Instant,
}

/// Hostname to address cache so each probe does not pay for a lookup.
#[derive(Debug)]
pub struct DnsCache {
    ttl: Duration,
    cache: HashMap<String, DnsCacheEntry>,
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new(DEFAULT_DNS_TTL)
    }
}

impl DnsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: HashMap::new(),
        }
    }

    pub fn insert(&mut self, hostname: &str, ip_address: IpAddr) {
        self.insert_at(hostname, ip_address, Instant::now());
    }

    fn insert_at(&mut self, hostname: &str, ip_address: IpAddr, now: Instant) {
        self.cache.insert(
            hostname.to_string(),
            DnsCacheEntry {
                ip_address,
                cached_at: now,
            },
        );
    }

    pub fn get_valid_ip(&self, hostname: &str) -> Option<IpAddr> {
        self.get_valid_ip_at(hostname, Instant::now())
    }

    fn get_valid_ip_at(&self, hostname: &str, now: Instant) -> Option<IpAddr> {
        self.cache
            .get(hostname)
            .filter(|entry| now.saturating_duration_since(entry.cached_at) <= self.ttl)
            .map(|entry| entry.ip_address)
    }

    /// Forget a hostname, e.g. after a probe to its cached address failed.
    pub fn invalidate(&mut self, hostname: &str) {
        self.cache.remove(hostname);
    }

    pub fn purge_expired(&mut self) {
        let now = Instant::now();
        let ttl = self.ttl;
        self.cache
            .retain(|_, entry| now.saturating_duration_since(entry.cached_at) <= ttl);
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34));

    #[test]
    fn fresh_entry_is_returned() {
        let mut cache = DnsCache::new(Duration::from_secs(60));
        cache.insert("example.com", IP);
        assert_eq!(cache.get_valid_ip("example.com"), Some(IP));
        assert_eq!(cache.get_valid_ip("example.org"), None);
    }

    #[test]
    fn expired_entry_is_ignored() {
        let mut cache = DnsCache::new(Duration::from_secs(10));
        let now = Instant::now();
        cache.insert_at("example.com", IP, now);
        assert_eq!(cache.get_valid_ip_at("example.com", now + Duration::from_secs(5)), Some(IP));
        assert_eq!(cache.get_valid_ip_at("example.com", now + Duration::from_secs(11)), None);
    }

    #[test]
    fn invalidate_and_purge() {
        let mut cache = DnsCache::new(Duration::ZERO);
        cache.insert("a.test", IP);
        cache.insert("b.test", IP);
        cache.invalidate("a.test");
        assert_eq!(cache.len(), 1);
        std::thread::sleep(Duration::from_millis(2));
        cache.purge_expired();
        assert!(cache.is_empty());
    }
}
