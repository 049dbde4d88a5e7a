//! Coordinator restart recovery: hosts re-register with their full state.

mod common;

use common::*;
use fleetmgr::common::BackupHash;
use fleetmgr::coordinator::globals::EntityRef;
use fleetmgr::coordinator::rpc::{RecoverHostData, Reply, Request};

fn recover_data(machine: u8, port: u16, id: u32, backup: Vec<std::net::SocketAddr>) -> RecoverHostData {
    RecoverHostData {
        addr: addr(machine, port),
        external_addr: ext_addr(machine, port),
        id,
        game_time: 0,
        backup: backup.into_iter().collect(),
        pending_backup: BackupHash::new(),
        shared_host_data: vec![],
        shared_fleet_data: vec![],
        globals: vec![],
    }
}

#[test]
fn recovered_hosts_rebuild_the_registry() {
    let mut fleet = TestFleet::new(test_config());

    let a = addr(1, 7001);
    let b = addr(2, 7002);
    fleet.send(a, Request::RecoverHost(Box::new(recover_data(1, 7001, 5, vec![b]))));
    fleet.send(b, Request::RecoverHost(Box::new(recover_data(2, 7002, 9, vec![a]))));

    assert_eq!(fleet.coord.registry().len(), 2);
    assert_eq!(fleet.coord.registry().get(&a).unwrap().id(), 5);
    assert_eq!(fleet.coord.registry().get(&b).unwrap().id(), 9);

    // Committed hashes restored verbatim.
    assert!(fleet.coord.registry().get(&a).unwrap().backup().contains(&b));
    assert!(fleet.coord.registry().get(&b).unwrap().backup().contains(&a));

    // Acceptance sets were rebuilt in both directions.
    assert!(fleet.coord.registry().get(&b).unwrap().backing_up_for().contains(&a));
    assert!(fleet.coord.registry().get(&a).unwrap().backing_up_for().contains(&b));
}

#[test]
fn recovered_ids_are_not_reallocated() {
    let mut fleet = TestFleet::new(test_config());
    let a = addr(1, 7001);
    fleet.send(a, Request::RecoverHost(Box::new(recover_data(1, 7001, 17, vec![]))));

    // Later registrations must allocate above the recovered id.
    fleet.send(db_addr(), Request::InitData { game_time: 0, max_host_id: 0 });
    let b = addr(2, 7002);
    let reply = fleet.request(
        b,
        Request::Add {
            addr: b,
            external_addr: ext_addr(2, 7002),
        },
    );
    match reply {
        Some(Reply::AddAck { id, .. }) => assert_eq!(id, 18),
        other => panic!("expected AddAck, got {:?}", other),
    }
}

#[test]
fn recovery_restores_shared_data_and_globals() {
    let mut fleet = TestFleet::new(test_config());
    let a = addr(1, 7001);

    let mut data = recover_data(1, 7001, 1, vec![]);
    data.shared_host_data = vec![("season".into(), "3".into())];
    data.shared_fleet_data = vec![("event".into(), "on".into())];
    data.globals = vec![("boss".into(), EntityRef { host: a, id: 4 })];
    data.game_time = 4200;
    fleet.send(a, Request::RecoverHost(Box::new(data)));

    assert_eq!(fleet.coord.game_time(), 4200);

    // A host registering later sees the recovered state.
    fleet.send(db_addr(), Request::InitData { game_time: 0, max_host_id: 0 });
    let b = addr(2, 7002);
    let reply = fleet.request(
        b,
        Request::Add {
            addr: b,
            external_addr: ext_addr(2, 7002),
        },
    );
    match reply {
        Some(Reply::AddAck {
            is_ready,
            globals,
            shared_host_data,
            shared_fleet_data,
            ..
        }) => {
            // Recovery implies the fleet had already started.
            assert!(is_ready);
            assert_eq!(globals, vec![("boss".into(), EntityRef { host: a, id: 4 })]);
            assert_eq!(shared_host_data, vec![("season".into(), "3".into())]);
            assert_eq!(shared_fleet_data, vec![("event".into(), "on".into())]);
        }
        other => panic!("expected AddAck, got {:?}", other),
    }
}

#[test]
fn duplicate_recovery_keeps_the_first_record() {
    let mut fleet = TestFleet::new(test_config());
    let a = addr(1, 7001);
    fleet.send(a, Request::RecoverHost(Box::new(recover_data(1, 7001, 5, vec![]))));
    fleet.send(a, Request::RecoverHost(Box::new(recover_data(1, 7001, 6, vec![]))));

    assert_eq!(fleet.coord.registry().len(), 1);
    assert_eq!(fleet.coord.registry().get(&a).unwrap().id(), 5);
}
