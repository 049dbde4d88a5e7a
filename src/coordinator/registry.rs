//! Host registry
//!
//! Authoritative map of live hosts. Hosts are value records in an arena keyed
//! by internal address; iteration follows registration order so scans are
//! deterministic.

use crate::common::BackupHash;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Small integer handle for a host, unique for the coordinator's lifetime.
pub type HostId = u32;

/// Ids wrap within 28 bits; an id of 0 is never handed out.
const HOST_ID_MASK: HostId = 0x0FFF_FFFF;

/// One registered entity host.
#[derive(Debug, Clone)]
pub struct Host {
    addr: SocketAddr,
    external_addr: SocketAddr,
    id: HostId,
    load: f32,
    entity_count: u32,
    heavy_entity_count: u32,
    /// Peers this host is committed to streaming its backup data to.
    backup: BackupHash,
    /// Target set of an in-flight topology transition. Empty when none.
    pending_backup: BackupHash,
    retiring: bool,
    offloading: bool,
    /// Hosts whose backup traffic this host currently accepts.
    backing_up_for: HashSet<SocketAddr>,
    last_heard: Instant,
}

impl Host {
    pub fn new(addr: SocketAddr, external_addr: SocketAddr, id: HostId) -> Self {
        Self {
            addr,
            external_addr,
            id,
            load: 0.0,
            entity_count: 0,
            heavy_entity_count: 0,
            backup: BackupHash::new(),
            pending_backup: BackupHash::new(),
            retiring: false,
            offloading: false,
            backing_up_for: HashSet::new(),
            last_heard: Instant::now(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn external_addr(&self) -> SocketAddr {
        self.external_addr
    }

    pub fn id(&self) -> HostId {
        self.id
    }

    pub fn load(&self) -> f32 {
        self.load
    }

    pub fn entity_count(&self) -> u32 {
        self.entity_count
    }

    pub fn heavy_entity_count(&self) -> u32 {
        self.heavy_entity_count
    }

    pub fn update_load(&mut self, load: f32, entities: u32, heavy: u32) {
        self.load = load;
        self.entity_count = entities;
        self.heavy_entity_count = heavy;
    }

    /// Bump the entity count after a placement decision, so back-to-back
    /// placements see the estimate before the host's next load report.
    pub fn add_entity(&mut self) {
        self.entity_count += 1;
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_heard = now;
    }

    pub fn last_heard(&self) -> Instant {
        self.last_heard
    }

    /// Whether this host has been silent past `timeout`.
    ///
    /// With the safeguard enabled, a host is not declared dead while the
    /// whole fleet has been silent for more than half the timeout: total
    /// silence means the coordinator itself is the likelier problem.
    pub fn has_timed_out(
        &self,
        now: Instant,
        timeout: Duration,
        since_any_heard: Duration,
        safeguard: bool,
    ) -> bool {
        let silent = now.saturating_duration_since(self.last_heard) > timeout;
        if silent && safeguard && since_any_heard > timeout / 2 {
            return false;
        }
        silent
    }

    pub fn is_retiring(&self) -> bool {
        self.retiring
    }

    pub fn is_offloading(&self) -> bool {
        self.offloading
    }

    pub fn start_retiring(&mut self) {
        self.retiring = true;
    }

    /// Latch the offloading flag. Irreversible; from here on the pending
    /// backup set is frozen.
    pub fn latch_offloading(&mut self) {
        self.retiring = true;
        self.offloading = true;
    }

    pub fn backup(&self) -> &BackupHash {
        &self.backup
    }

    pub fn backup_mut(&mut self) -> &mut BackupHash {
        &mut self.backup
    }

    pub fn pending_backup(&self) -> &BackupHash {
        &self.pending_backup
    }

    /// Mutable access to the pending set. `None` once offloading has been
    /// latched: an offloading host's transition must never change again.
    pub fn pending_backup_mut(&mut self) -> Option<&mut BackupHash> {
        if self.offloading {
            None
        } else {
            Some(&mut self.pending_backup)
        }
    }

    /// Install the acknowledged hash as committed and clear the transition.
    pub fn commit_backup(&mut self, new: BackupHash) {
        self.backup = new;
        self.pending_backup.clear();
    }

    pub fn starts_backup_for(&mut self, owner: SocketAddr) {
        self.backing_up_for.insert(owner);
    }

    pub fn stops_backup_for(&mut self, owner: &SocketAddr) {
        self.backing_up_for.remove(owner);
    }

    pub fn backing_up_for(&self) -> &HashSet<SocketAddr> {
        &self.backing_up_for
    }

    /// Restore backup state from a recovery snapshot.
    pub fn restore_backup(&mut self, committed: BackupHash, pending: BackupHash) {
        self.backup = committed;
        self.pending_backup = pending;
    }

    pub fn status(&self) -> HostStatus {
        HostStatus {
            addr: self.addr,
            external_addr: self.external_addr,
            id: self.id,
            load: self.load,
            entity_count: self.entity_count,
            heavy_entity_count: self.heavy_entity_count,
            retiring: self.retiring,
            offloading: self.offloading,
            backup_targets: self.backup.buckets().to_vec(),
            pending_backup_targets: self.pending_backup.buckets().to_vec(),
        }
    }
}

/// Read-only host view for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    pub addr: SocketAddr,
    pub external_addr: SocketAddr,
    pub id: HostId,
    pub load: f32,
    pub entity_count: u32,
    pub heavy_entity_count: u32,
    pub retiring: bool,
    pub offloading: bool,
    pub backup_targets: Vec<SocketAddr>,
    pub pending_backup_targets: Vec<SocketAddr>,
}

/// Arena of live hosts, iterated in registration order.
#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: HashMap<SocketAddr, Host>,
    order: Vec<SocketAddr>,
    last_id: HostId,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.hosts.contains_key(addr)
    }

    /// Allocate the next host id: wrapping 28-bit counter, skipping ids
    /// still in use.
    pub fn next_id(&mut self) -> HostId {
        loop {
            self.last_id = (self.last_id + 1) & HOST_ID_MASK;
            if self.last_id == 0 {
                continue;
            }
            if !self.hosts.values().any(|h| h.id == self.last_id) {
                return self.last_id;
            }
        }
    }

    /// Make sure future allocations start above `id`. Used during recovery.
    pub fn note_recovered_id(&mut self, id: HostId) {
        self.last_id = self.last_id.max(id & HOST_ID_MASK);
    }

    pub fn last_id(&self) -> HostId {
        self.last_id
    }

    pub fn insert(&mut self, host: Host) {
        let addr = host.addr;
        if self.hosts.insert(addr, host).is_none() {
            self.order.push(addr);
        }
    }

    pub fn remove(&mut self, addr: &SocketAddr) -> Option<Host> {
        let host = self.hosts.remove(addr);
        if host.is_some() {
            self.order.retain(|a| a != addr);
        }
        host
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&Host> {
        self.hosts.get(addr)
    }

    pub fn get_mut(&mut self, addr: &SocketAddr) -> Option<&mut Host> {
        self.hosts.get_mut(addr)
    }

    /// Registration-order iteration.
    pub fn iter(&self) -> impl Iterator<Item = &Host> {
        self.order.iter().filter_map(|a| self.hosts.get(a))
    }

    /// Registration-order addresses; useful when call sites need `get_mut`
    /// one host at a time.
    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.order.clone()
    }

    /// The least-loaded host that is not retiring. Ties go to the earliest
    /// registered, so an unchanged registry always yields the same host.
    pub fn best(&self) -> Option<&Host> {
        let mut best: Option<&Host> = None;
        for host in self.iter() {
            if host.retiring {
                continue;
            }
            match best {
                Some(b) if host.load >= b.load => {}
                _ => best = Some(host),
            }
        }
        best
    }

    /// Apply a load report. Returns false when the address is unknown, which
    /// callers log as an anomaly rather than treating as fatal.
    pub fn update_load(&mut self, addr: &SocketAddr, load: f32, entities: u32, heavy: u32) -> bool {
        match self.hosts.get_mut(addr) {
            Some(host) => {
                host.update_load(load, entities, heavy);
                true
            }
            None => false,
        }
    }

    /// Whether the fleet spans more than one physical machine, judged by the
    /// host component of the internal addresses.
    pub fn has_multiple_machines(&self) -> bool {
        let mut first = None;
        for host in self.iter() {
            match first {
                None => first = Some(host.addr.ip()),
                Some(ip) if ip != host.addr.ip() => return true,
                Some(_) => {}
            }
        }
        false
    }

    pub fn min_load(&self) -> f32 {
        self.iter().map(|h| h.load).fold(f32::INFINITY, f32::min)
    }

    pub fn max_load(&self) -> f32 {
        self.iter().map(|h| h.load).fold(0.0, f32::max)
    }

    pub fn avg_load(&self) -> f32 {
        if self.hosts.is_empty() {
            0.0
        } else {
            self.iter().map(|h| h.load).sum::<f32>() / self.hosts.len() as f32
        }
    }

    pub fn total_entities(&self) -> u64 {
        self.iter().map(|h| h.entity_count as u64).sum()
    }

    pub fn total_heavy_entities(&self) -> u64 {
        self.iter().map(|h| h.heavy_entity_count as u64).sum()
    }
}
