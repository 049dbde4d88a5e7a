//! Shared fixtures: a coordinator driven synchronously through its event
//! loop, with a recording transport standing in for the fleet.

#![allow(dead_code)]

use fleetmgr::common::BackupHash;
use fleetmgr::coordinator::rpc::{HostMsg, Outbound, Reply, Request};
use fleetmgr::coordinator::server::{Coordinator, Event};
use fleetmgr::transport::testing::RecordingTransport;
use fleetmgr::transport::ReplyToken;
use fleetmgr::CoordinatorConfig;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;

pub fn addr(machine: u8, port: u16) -> SocketAddr {
    format!("10.0.0.{}:{}", machine, port).parse().unwrap()
}

pub fn ext_addr(machine: u8, port: u16) -> SocketAddr {
    format!("192.168.0.{}:{}", machine, port).parse().unwrap()
}

pub fn peer_addr() -> SocketAddr {
    "10.0.9.1:7100".parse().unwrap()
}

pub fn db_addr() -> SocketAddr {
    "10.0.9.1:7200".parse().unwrap()
}

pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        peer_addr: Some(peer_addr()),
        db_addr: Some(db_addr()),
        ..CoordinatorConfig::default()
    }
}

pub struct TestFleet {
    pub coord: Coordinator,
    pub transport: Arc<RecordingTransport>,
}

impl TestFleet {
    pub fn new(config: CoordinatorConfig) -> Self {
        let transport = RecordingTransport::new();
        let coord = Coordinator::new(config, transport.clone());
        Self { coord, transport }
    }

    /// A coordinator that has received its init data and is accepting hosts.
    pub fn ready(config: CoordinatorConfig) -> Self {
        let mut fleet = Self::new(config);
        fleet.send(db_addr(), Request::InitData {
            game_time: 0,
            max_host_id: 0,
        });
        fleet
    }

    /// Fire-and-forget message into the loop.
    pub fn send(&mut self, from: SocketAddr, req: Request) {
        self.coord.handle_event(Event::Request {
            from,
            req,
            reply: None,
        });
    }

    /// Request/reply through the loop. `None` means the handler dropped the
    /// reply (silent rejection).
    pub fn request(&mut self, from: SocketAddr, req: Request) -> Option<Reply> {
        let (tx, mut rx) = oneshot::channel();
        self.coord.handle_event(Event::Request {
            from,
            req,
            reply: Some(tx),
        });
        rx.try_recv().ok()
    }

    /// Like [`request`], but hands back the receiver for replies that only
    /// arrive after a later event (e.g. a relayed host reply).
    pub fn request_deferred(&mut self, from: SocketAddr, req: Request) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.coord.handle_event(Event::Request {
            from,
            req,
            reply: Some(tx),
        });
        rx
    }

    pub fn tick(&mut self) {
        self.coord.handle_event(Event::Tick);
    }

    pub fn reply(&mut self, token: ReplyToken, result: fleetmgr::Result<Reply>) {
        self.coord.handle_event(Event::Reply { token, result });
    }

    /// Register a host and assert it was accepted.
    pub fn add_host(&mut self, machine: u8, port: u16) -> SocketAddr {
        let a = addr(machine, port);
        let reply = self.request(
            a,
            Request::Add {
                addr: a,
                external_addr: ext_addr(machine, port),
            },
        );
        assert!(
            matches!(reply, Some(Reply::AddAck { .. })),
            "host at {} was not accepted: {:?}",
            a,
            reply
        );
        a
    }

    /// Drain everything sent fire-and-forget so far.
    pub fn drain(&mut self) -> Vec<(SocketAddr, Outbound)> {
        self.transport.take_sent()
    }

    /// The last backup-target push per host in a drained batch; later pushes
    /// supersede earlier ones, exactly as hosts would experience them.
    pub fn last_backup_pushes(msgs: &[(SocketAddr, Outbound)]) -> Vec<(SocketAddr, BackupHash)> {
        let mut latest: HashMap<SocketAddr, BackupHash> = HashMap::new();
        let mut order: Vec<SocketAddr> = Vec::new();
        for (to, msg) in msgs {
            if let Outbound::Host(HostMsg::SetBackupTargets { targets }) = msg {
                if !latest.contains_key(to) {
                    order.push(*to);
                }
                latest.insert(*to, targets.clone());
            }
        }
        order
            .into_iter()
            .map(|to| {
                let targets = latest.remove(&to).unwrap();
                (to, targets)
            })
            .collect()
    }

    /// Acknowledge backup pushes the way live hosts would.
    pub fn ack_pushes(&mut self, pushes: Vec<(SocketAddr, BackupHash)>) {
        for (host, new) in pushes {
            let Some(record) = self.coord.registry().get(&host) else {
                continue;
            };
            let old = record.backup().clone();
            self.send(host, Request::UseNewBackupHash { old, new });
        }
    }

    /// Run push/ack rounds until the topology stops changing.
    pub fn settle_topology(&mut self) -> Vec<(SocketAddr, Outbound)> {
        let mut all = Vec::new();
        for _ in 0..16 {
            let msgs = self.drain();
            let pushes = Self::last_backup_pushes(&msgs);
            all.extend(msgs);
            if pushes.is_empty() {
                break;
            }
            self.ack_pushes(pushes);
        }
        all
    }

    /// Messages of one kind addressed to `to`, from a drained batch.
    pub fn host_msgs_to(msgs: &[(SocketAddr, Outbound)], to: SocketAddr) -> Vec<HostMsg> {
        msgs.iter()
            .filter(|(a, _)| *a == to)
            .filter_map(|(_, m)| match m {
                Outbound::Host(h) => Some(h.clone()),
                Outbound::Peer(_) => None,
            })
            .collect()
    }
}
