//! Placement policy
//!
//! Two decisions live here: whether a create request is admitted at all
//! (overload debounce), and which host each host should send its
//! "create anywhere" entities to (periodic destination assignment).

use rand::seq::SliceRandom;
use rand::Rng;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Overload admission gate.
///
/// A single hot load sample must not bounce traffic, so the fleet is only
/// declared overloaded once the best host's load has stayed above the level
/// for the tolerance window, or once the admission budget has been spent
/// since overload began. The window and budget both reset on the first
/// sample at or below the level.
#[derive(Debug)]
pub struct OverloadGate {
    level: f32,
    tolerance: Duration,
    budget: u32,
    overload_since: Option<Instant>,
    admitted: u32,
}

impl OverloadGate {
    pub fn new(level: f32, tolerance: Duration, budget: u32) -> Self {
        Self {
            level,
            tolerance,
            budget,
            overload_since: None,
            admitted: 0,
        }
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    /// Decide whether a creation aimed at a host with `best_load` may
    /// proceed. Returns false once the fleet counts as overloaded.
    pub fn admit(&mut self, best_load: f32, now: Instant) -> bool {
        if best_load <= self.level {
            self.overload_since = None;
            self.admitted = 0;
            return true;
        }

        let since = *self.overload_since.get_or_insert(now);
        let overload_time = now.saturating_duration_since(since);
        tracing::info!(
            "Fleet overloaded for {}ms (best load {:.2} > {:.2})",
            overload_time.as_millis(),
            best_load,
            self.level
        );

        if overload_time > self.tolerance || self.admitted >= self.budget {
            return false;
        }

        self.admitted += 1;
        tracing::info!(
            "Creations since overload began (allowing max of {}): {}",
            self.budget,
            self.admitted
        );
        true
    }
}

/// Compute the create-anywhere destination for every host.
///
/// Hosts are sorted by load; the least-loaded `1/ratio` fraction become
/// destinations, and the rest are shuffled before being dealt out round-robin
/// so repeated recomputes do not herd the same sources onto the same
/// destination. Returns `(host, destination)` pairs, one per input host.
pub fn assign_create_destinations<R: Rng>(
    hosts: &[(SocketAddr, f32)],
    ratio: f32,
    rng: &mut R,
) -> Vec<(SocketAddr, SocketAddr)> {
    if hosts.is_empty() {
        return Vec::new();
    }

    let mut sorted: Vec<(SocketAddr, f32)> = hosts.to_vec();
    sorted.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    let total = sorted.len();
    let dest_size = ((total as f32 / ratio) + 0.99) as usize;
    let dest_size = dest_size.clamp(1, total);

    sorted[dest_size..].shuffle(rng);

    sorted
        .iter()
        .enumerate()
        .map(|(i, (addr, _))| (*addr, sorted[i % dest_size].0))
        .collect()
}
