//! Backup topology management
//!
//! Every membership change recomputes where each host should stream its
//! entity backups. Targets are primed through a two-phase handshake: the
//! coordinator pushes the new target set to the owning host, the host primes
//! it and acknowledges with `use_new_backup_hash`, and only then are the
//! per-target start/stop instructions issued and the set committed.
//!
//! Placement rules:
//! - Fleet on multiple machines: a host backs up to every host on a
//!   different machine, never to a retiring host.
//! - Fleet on one machine: fully connected mesh, since the cross-machine
//!   rule would leave no targets at all.
//! - Crossing between those regimes rebuilds every target set from scratch.

use crate::common::{BackupHash, DiffVisitor, Error};
use std::net::SocketAddr;

use super::registry::HostRegistry;
use super::rpc::HostMsg;

/// Which membership change triggered the recompute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyOp {
    /// `addr` just registered (already inserted in the registry).
    Add,
    /// `addr` asked to retire (still in the registry).
    Retire,
    /// `addr` died (already erased from the registry).
    Crash,
}

/// Result of a topology recompute.
#[derive(Debug)]
pub struct TopologyUpdate {
    /// `set_backup_targets` pushes, one per affected host.
    pub sends: Vec<(SocketAddr, HostMsg)>,
    /// Machine regime after the change; feed back into the next call.
    pub multi_machine: bool,
}

/// Recompute every host's pending target set after a membership change.
///
/// Hosts that are offloading are left untouched: their transition is frozen
/// until they leave the fleet. A host still waiting on an acknowledgement
/// keeps its pending set as the base; the in-flight transition is superseded,
/// not merged.
pub fn adjust_backup_targets(
    reg: &mut HostRegistry,
    addr: SocketAddr,
    op: TopologyOp,
    was_multi_machine: bool,
) -> TopologyUpdate {
    let multi_machine = reg.has_multiple_machines();

    if multi_machine && !was_multi_machine {
        tracing::info!("Hosts detected on multiple machines, switching to cross-machine backups");
    }
    if !multi_machine && was_multi_machine {
        tracing::info!("Hosts detected on one machine only, falling back to mesh backups");
    }

    let peers_info: Vec<(SocketAddr, bool)> =
        reg.iter().map(|h| (h.addr(), h.is_retiring())).collect();

    let mut sends = Vec::new();
    let mut new_host_targets: Vec<SocketAddr> = Vec::new();

    for a in reg.addrs() {
        if a == addr {
            continue;
        }
        let Some(host) = reg.get_mut(&a) else { continue };
        if host.is_offloading() {
            continue;
        }

        if host.pending_backup().is_empty() {
            let seed = host.backup().clone();
            if let Some(pending) = host.pending_backup_mut() {
                *pending = seed;
            }
        } else {
            tracing::warn!("{}", Error::TransitionAbandoned(a.to_string()));
        }

        if multi_machine && !was_multi_machine {
            // Same-machine targets were legal until now; start over. The new
            // cross-machine host is re-added below.
            if let Some(pending) = host.pending_backup_mut() {
                pending.clear();
            }
        } else if !multi_machine && was_multi_machine {
            // Back to one machine: every other non-retiring host is a target.
            for (peer, retiring) in &peers_info {
                if *peer != a && *peer != addr && !retiring {
                    if let Some(pending) = host.pending_backup_mut() {
                        pending.push(*peer);
                    }
                }
            }
        }

        let host_retiring = host.is_retiring();
        match op {
            TopologyOp::Add => {
                if addr.ip() != a.ip() || !multi_machine {
                    if let Some(pending) = host.pending_backup_mut() {
                        pending.push(addr);
                    }
                    // Retiring hosts are not valid targets for the newcomer.
                    if !host_retiring {
                        new_host_targets.push(a);
                    }
                }
            }
            TopologyOp::Crash => {
                if host.backup_mut().erase(&addr) {
                    // The committed set routed entities through the dead
                    // host; none of it can be trusted any more.
                    host.backup_mut().clear();
                }
                if let Some(pending) = host.pending_backup_mut() {
                    pending.erase(&addr);
                }
            }
            TopologyOp::Retire => {
                if let Some(pending) = host.pending_backup_mut() {
                    pending.erase(&addr);
                }
            }
        }

        sends.push((
            a,
            HostMsg::SetBackupTargets {
                targets: host.pending_backup().clone(),
            },
        ));
    }

    if op == TopologyOp::Add {
        if let Some(host) = reg.get_mut(&addr) {
            if let Some(pending) = host.pending_backup_mut() {
                for target in new_host_targets {
                    pending.push(target);
                }
            }
            sends.push((
                addr,
                HostMsg::SetBackupTargets {
                    targets: host.pending_backup().clone(),
                },
            ));
        } else {
            tracing::error!("adjust_backup_targets: added host {} not in registry", addr);
        }
    }

    TopologyUpdate {
        sends,
        multi_machine,
    }
}

struct TransitionPusher<'a> {
    owner: SocketAddr,
    reg: &'a mut HostRegistry,
    sends: Vec<(SocketAddr, HostMsg)>,
}

impl DiffVisitor for TransitionPusher<'_> {
    fn on_add(&mut self, addr: SocketAddr, index: u32, virtual_size: u32, prime: u32) {
        match self.reg.get_mut(&addr) {
            Some(target) => {
                self.sends.push((
                    addr,
                    HostMsg::StartEntityBackup {
                        owner: self.owner,
                        index,
                        virtual_size,
                        prime,
                        initial: false,
                    },
                ));
                target.starts_backup_for(self.owner);
            }
            None => {
                tracing::error!("Backup transition for {}: no host at {}", self.owner, addr);
            }
        }
    }

    fn on_change(&mut self, addr: SocketAddr, index: u32, virtual_size: u32, prime: u32) {
        self.on_add(addr, index, virtual_size, prime);
    }

    fn on_remove(&mut self, addr: SocketAddr, index: u32, virtual_size: u32, prime: u32) {
        if let Some(target) = self.reg.get_mut(&addr) {
            self.sends.push((
                addr,
                HostMsg::StopEntityBackup {
                    owner: self.owner,
                    index,
                    virtual_size,
                    prime,
                },
            ));
            target.stops_backup_for(&self.owner);
        }
    }
}

/// Complete an acknowledged transition: tell each target to start or stop
/// accepting `owner`'s backup stream, then commit the new set on the owner.
///
/// `old` and `new` are the hashes the owner acknowledged, not whatever is
/// pending now; a recompute that raced the acknowledgement simply starts the
/// next transition afterwards.
pub fn finish_backup_transition(
    reg: &mut HostRegistry,
    owner: SocketAddr,
    old: &BackupHash,
    new: BackupHash,
) -> Vec<(SocketAddr, HostMsg)> {
    if !reg.contains(&owner) {
        tracing::warn!(
            "use_new_backup_hash from unknown host {}; it may have just died",
            owner
        );
        return Vec::new();
    }

    let mut pusher = TransitionPusher {
        owner,
        reg,
        sends: Vec::new(),
    };
    old.diff(&new, &mut pusher);
    let sends = pusher.sends;

    if let Some(host) = reg.get_mut(&owner) {
        host.commit_backup(new);
    }

    sends
}
