//! Retirement gating
//!
//! A retiring host may only begin the irreversible offload sequence once its
//! backup topology has settled and no host it stores backups for could still
//! need a topology change of its own. Offloading hosts are frozen, so
//! depending on one is safe; depending on a host that is retiring but not
//! yet offloading is not, since the two could otherwise deadlock waiting on
//! each other's transitions.

use std::net::SocketAddr;

use super::registry::HostRegistry;

/// Whether `addr` satisfies every offload precondition:
///
/// 1. a committed backup topology exists (computed at least once),
/// 2. no unacknowledged transition is outstanding,
/// 3. every host it accepts backup traffic for is either not retiring or
///    already offloading.
pub fn can_start_offloading(reg: &HostRegistry, addr: &SocketAddr) -> bool {
    let Some(host) = reg.get(addr) else {
        return false;
    };

    if !host.is_retiring() || host.is_offloading() {
        return false;
    }

    if host.backup().is_empty() || !host.pending_backup().is_empty() {
        return false;
    }

    host.backing_up_for().iter().all(|owner| {
        reg.get(owner)
            .map_or(true, |o| !o.is_retiring() || o.is_offloading())
    })
}

/// Latch offloading on every retiring host whose preconditions now hold.
///
/// Called after every membership event and transition acknowledgement,
/// because condition (3) only becomes satisfiable once other hosts finish
/// their own transitions. Returns the hosts latched this round, in
/// registration order; each must be sent a start-offloading instruction.
pub fn check_offload_candidates(reg: &mut HostRegistry) -> Vec<SocketAddr> {
    let mut latched = Vec::new();

    // Candidates are evaluated against the registry as it mutates: a host
    // latched earlier in the round is genuinely offloading, so it may
    // legitimately unblock a later candidate.
    let candidates: Vec<SocketAddr> = reg
        .iter()
        .filter(|h| h.is_retiring() && !h.is_offloading())
        .map(|h| h.addr())
        .collect();

    for addr in candidates {
        if can_start_offloading(reg, &addr) {
            if let Some(host) = reg.get_mut(&addr) {
                host.latch_offloading();
                tracing::info!("Host {} has a stable backup topology, offloading", addr);
                latched.push(addr);
            }
        }
    }

    latched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::registry::Host;

    fn addr(machine: u8, port: u16) -> SocketAddr {
        format!("10.0.0.{}:{}", machine, port).parse().unwrap()
    }

    fn add_host(reg: &mut HostRegistry, machine: u8, port: u16) -> SocketAddr {
        let a = addr(machine, port);
        let id = reg.next_id();
        reg.insert(Host::new(a, addr(machine, port + 1000), id));
        a
    }

    fn commit_backup_to(reg: &mut HostRegistry, host: &SocketAddr, target: SocketAddr) {
        reg.get_mut(host)
            .unwrap()
            .commit_backup(vec![target].into_iter().collect());
    }

    #[test]
    fn test_needs_committed_topology() {
        let mut reg = HostRegistry::new();
        let a = add_host(&mut reg, 1, 7001);
        reg.get_mut(&a).unwrap().start_retiring();

        // No committed backup yet.
        assert!(!can_start_offloading(&reg, &a));

        let b = add_host(&mut reg, 2, 7002);
        commit_backup_to(&mut reg, &a, b);
        assert!(can_start_offloading(&reg, &a));
    }

    #[test]
    fn test_outstanding_transition_blocks_offload() {
        let mut reg = HostRegistry::new();
        let a = add_host(&mut reg, 1, 7001);
        let b = add_host(&mut reg, 2, 7002);
        commit_backup_to(&mut reg, &a, b);
        reg.get_mut(&a).unwrap().start_retiring();

        reg.get_mut(&a)
            .unwrap()
            .pending_backup_mut()
            .unwrap()
            .push(b);
        assert!(!can_start_offloading(&reg, &a));

        reg.get_mut(&a).unwrap().commit_backup(vec![b].into_iter().collect());
        assert!(can_start_offloading(&reg, &a));
    }

    #[test]
    fn test_dependency_on_retiring_host_blocks_offload() {
        let mut reg = HostRegistry::new();
        let a = add_host(&mut reg, 1, 7001);
        let b = add_host(&mut reg, 2, 7002);
        commit_backup_to(&mut reg, &a, b);
        commit_backup_to(&mut reg, &b, a);
        // a stores backups for b.
        reg.get_mut(&a).unwrap().starts_backup_for(b);

        reg.get_mut(&a).unwrap().start_retiring();
        reg.get_mut(&b).unwrap().start_retiring();

        // b is retiring but not offloading: a must wait.
        assert!(!can_start_offloading(&reg, &a));

        // Once b is frozen, a may proceed.
        reg.get_mut(&b).unwrap().latch_offloading();
        assert!(can_start_offloading(&reg, &a));
    }

    #[test]
    fn test_dependency_on_healthy_host_is_fine() {
        let mut reg = HostRegistry::new();
        let a = add_host(&mut reg, 1, 7001);
        let b = add_host(&mut reg, 2, 7002);
        commit_backup_to(&mut reg, &a, b);
        reg.get_mut(&a).unwrap().starts_backup_for(b);
        reg.get_mut(&a).unwrap().start_retiring();

        assert!(can_start_offloading(&reg, &a));
    }

    #[test]
    fn test_check_latches_and_reports() {
        let mut reg = HostRegistry::new();
        let a = add_host(&mut reg, 1, 7001);
        let b = add_host(&mut reg, 2, 7002);
        commit_backup_to(&mut reg, &a, b);
        reg.get_mut(&a).unwrap().start_retiring();

        assert_eq!(check_offload_candidates(&mut reg), vec![a]);
        assert!(reg.get(&a).unwrap().is_offloading());

        // Latching is one-shot.
        assert!(check_offload_candidates(&mut reg).is_empty());
    }

    #[test]
    fn test_mutual_retirement_never_double_latches_in_one_round() {
        // a and b retire together, each storing the other's backups. Only
        // one may latch per round; the other follows on the next event.
        let mut reg = HostRegistry::new();
        let a = add_host(&mut reg, 1, 7001);
        let b = add_host(&mut reg, 2, 7002);
        commit_backup_to(&mut reg, &a, b);
        commit_backup_to(&mut reg, &b, a);
        reg.get_mut(&a).unwrap().starts_backup_for(b);
        reg.get_mut(&b).unwrap().starts_backup_for(a);
        reg.get_mut(&a).unwrap().start_retiring();
        reg.get_mut(&b).unwrap().start_retiring();

        let first = check_offload_candidates(&mut reg);
        assert!(first.is_empty());

        // Neither latched: each depends on a retiring, non-offloading peer.
        assert!(!reg.get(&a).unwrap().is_offloading());
        assert!(!reg.get(&b).unwrap().is_offloading());
    }
}
