//! Fleet-wide registries: global entities and shared data
//!
//! Global entities are singletons addressed by name rather than host+id;
//! the coordinator owns the name table and broadcasts changes. Shared data
//! is a small key/value set replicated to every host; the host-domain set is
//! authoritative here, the fleet-domain set is authoritative in the peer
//! coordinator and only mirrored.

use crate::common::{BackupHashChain, EntityId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

/// A reference to a live entity: the host owning it plus its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub host: SocketAddr,
    pub id: EntityId,
}

/// Name -> owner table for globally registered entities.
#[derive(Debug, Default)]
pub struct GlobalEntities {
    entries: HashMap<String, EntityRef>,
}

impl GlobalEntities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register a name. Returns false when the name is already taken.
    pub fn register(&mut self, name: String, entity: EntityRef) -> bool {
        match self.entries.entry(name) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(entity);
                true
            }
        }
    }

    pub fn deregister(&mut self, name: &str) -> Option<EntityRef> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&EntityRef> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &EntityRef)> {
        self.entries.iter()
    }

    pub fn snapshot(&self) -> Vec<(String, EntityRef)> {
        self.entries
            .iter()
            .map(|(name, entity)| (name.clone(), *entity))
            .collect()
    }

    /// Redirect every entry owned by `dead` to its replacement address,
    /// resolved through the backup hash chain so redirects never land on an
    /// address that is itself dead. Returns the number of entries moved.
    pub fn redirect_dead(&mut self, dead: &SocketAddr, chain: &BackupHashChain) -> usize {
        let mut moved = 0;
        for entity in self.entries.values_mut() {
            if entity.host == *dead {
                entity.host = chain.address_for(*dead, entity.id);
                moved += 1;
            }
        }
        moved
    }
}

/// Which shared-data set a key lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedDomain {
    /// Shared between entity hosts only. Authoritative here.
    Host,
    /// Shared fleet-wide including the compute fleet. Authoritative in the
    /// peer coordinator; mirrored here.
    Fleet,
}

/// The two replicated key/value sets.
#[derive(Debug, Default)]
pub struct SharedData {
    host_data: HashMap<String, String>,
    fleet_data: HashMap<String, String>,
}

impl SharedData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, domain: SharedDomain, key: String, value: String) {
        self.domain_mut(domain).insert(key, value);
    }

    /// Delete a key. Returns whether it existed.
    pub fn del(&mut self, domain: SharedDomain, key: &str) -> bool {
        self.domain_mut(domain).remove(key).is_some()
    }

    pub fn get(&self, domain: SharedDomain, key: &str) -> Option<&String> {
        self.domain(domain).get(key)
    }

    pub fn snapshot(&self, domain: SharedDomain) -> Vec<(String, String)> {
        self.domain(domain)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn domain(&self, domain: SharedDomain) -> &HashMap<String, String> {
        match domain {
            SharedDomain::Host => &self.host_data,
            SharedDomain::Fleet => &self.fleet_data,
        }
    }

    fn domain_mut(&mut self, domain: SharedDomain) -> &mut HashMap<String, String> {
        match domain {
            SharedDomain::Host => &mut self.host_data,
            SharedDomain::Fleet => &mut self.fleet_data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::BackupHash;

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_register_is_exclusive() {
        let mut globals = GlobalEntities::new();
        let e = EntityRef {
            host: addr(7001),
            id: 5,
        };
        assert!(globals.register("world_boss".into(), e));
        assert!(!globals.register(
            "world_boss".into(),
            EntityRef {
                host: addr(7002),
                id: 9
            }
        ));
        assert_eq!(globals.get("world_boss"), Some(&e));
    }

    #[test]
    fn test_deregister() {
        let mut globals = GlobalEntities::new();
        let e = EntityRef {
            host: addr(7001),
            id: 5,
        };
        globals.register("auction_house".into(), e);
        assert_eq!(globals.deregister("auction_house"), Some(e));
        assert_eq!(globals.deregister("auction_house"), None);
    }

    #[test]
    fn test_redirect_dead_follows_chain() {
        let a = addr(7001);
        let b = addr(7002);

        let mut globals = GlobalEntities::new();
        globals.register("boss".into(), EntityRef { host: a, id: 1 });
        globals.register("bank".into(), EntityRef { host: b, id: 2 });

        let mut chain = BackupHashChain::new();
        let hash: BackupHash = vec![b].into_iter().collect();
        chain.record_death(a, hash);

        let moved = globals.redirect_dead(&a, &chain);
        assert_eq!(moved, 1);
        assert_eq!(globals.get("boss").unwrap().host, b);
        assert_eq!(globals.get("bank").unwrap().host, b);
    }

    #[test]
    fn test_shared_data_domains_are_separate() {
        let mut shared = SharedData::new();
        shared.set(SharedDomain::Host, "season".into(), "3".into());
        shared.set(SharedDomain::Fleet, "season".into(), "4".into());

        assert_eq!(
            shared.get(SharedDomain::Host, "season"),
            Some(&"3".to_string())
        );
        assert_eq!(
            shared.get(SharedDomain::Fleet, "season"),
            Some(&"4".to_string())
        );

        assert!(shared.del(SharedDomain::Host, "season"));
        assert!(!shared.del(SharedDomain::Host, "season"));
        assert_eq!(shared.get(SharedDomain::Fleet, "season"), Some(&"4".into()));
    }
}
