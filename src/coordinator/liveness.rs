//! Host liveness
//!
//! Each tick scans heartbeat timestamps and declares at most one host dead.
//! Death handling mutates the registry being scanned, so finding more than
//! one victim per tick would race the repair work; the next tick catches any
//! others.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::registry::HostRegistry;

/// Find the first host whose heartbeat has expired.
///
/// With `safeguard` set, total fleet silence for more than half the timeout
/// means the coordinator itself is probably the unhealthy party, and the
/// verdict is deferred rather than cannibalising healthy hosts.
pub fn find_dead_host(
    reg: &HostRegistry,
    now: Instant,
    timeout: Duration,
    safeguard: bool,
) -> Option<SocketAddr> {
    let last_any_heard = reg.iter().map(|h| h.last_heard()).max()?;
    let since_any_heard = now.saturating_duration_since(last_any_heard);

    for host in reg.iter() {
        if host.has_timed_out(now, timeout, since_any_heard, safeguard) {
            tracing::info!("Host {} has timed out", host.addr());
            return Some(host.addr());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::registry::Host;

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.1:{}", port).parse().unwrap()
    }

    fn registry_heard_at(times: &[(u16, Instant)]) -> HostRegistry {
        let mut reg = HostRegistry::new();
        for (port, heard) in times {
            let a = addr(*port);
            let id = reg.next_id();
            let mut host = Host::new(a, a, id);
            host.touch(*heard);
            reg.insert(host);
        }
        reg
    }

    #[test]
    fn test_empty_registry() {
        let reg = HostRegistry::new();
        assert!(find_dead_host(&reg, Instant::now(), Duration::from_secs(5), true).is_none());
    }

    #[test]
    fn test_one_silent_host_is_dead() {
        let start = Instant::now();
        let reg = registry_heard_at(&[(7001, start), (7002, start + Duration::from_secs(9))]);
        let now = start + Duration::from_secs(10);

        let dead = find_dead_host(&reg, now, Duration::from_secs(5), true);
        assert_eq!(dead, Some(addr(7001)));
    }

    #[test]
    fn test_only_first_victim_reported() {
        let start = Instant::now();
        let reg = registry_heard_at(&[
            (7001, start),
            (7002, start),
            (7003, start + Duration::from_secs(9)),
        ]);
        let now = start + Duration::from_secs(10);

        // Both 7001 and 7002 expired; only the first in order is returned.
        let dead = find_dead_host(&reg, now, Duration::from_secs(5), true);
        assert_eq!(dead, Some(addr(7001)));
    }

    #[test]
    fn test_global_silence_defers_with_safeguard() {
        let start = Instant::now();
        let reg = registry_heard_at(&[(7001, start), (7002, start)]);
        let now = start + Duration::from_secs(10);

        assert!(find_dead_host(&reg, now, Duration::from_secs(5), true).is_none());
        // Without the safeguard the first host is condemned.
        assert_eq!(
            find_dead_host(&reg, now, Duration::from_secs(5), false),
            Some(addr(7001))
        );
    }

    #[test]
    fn test_all_alive() {
        let start = Instant::now();
        let reg = registry_heard_at(&[(7001, start), (7002, start)]);
        let now = start + Duration::from_secs(2);
        assert!(find_dead_host(&reg, now, Duration::from_secs(5), true).is_none());
    }
}
