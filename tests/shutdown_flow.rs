//! Ordered fleet shutdown: INFORM barrier, sequential PERFORM, triggering.

mod common;

use common::*;
use fleetmgr::coordinator::rpc::{HostMsg, Outbound, PeerMsg, Reply, Request};
use fleetmgr::coordinator::shutdown::ShutdownStage;

fn shutdown_req(stage: ShutdownStage, time: u32) -> Request {
    Request::ControlledShutdown { stage, time }
}

#[test]
fn request_stage_is_forwarded_to_peer() {
    let mut fleet = TestFleet::ready(test_config());
    let _a = fleet.add_host(1, 7001);
    fleet.settle_topology();

    let reply = fleet.request(db_addr(), shutdown_req(ShutdownStage::Request, 0));
    assert!(matches!(reply, Some(Reply::Ack)));

    let sent = fleet.drain();
    assert!(sent.iter().any(|(to, m)| *to == peer_addr()
        && matches!(
            m,
            Outbound::Peer(PeerMsg::ControlledShutdown {
                stage: ShutdownStage::Request,
                ..
            })
        )));

    // REQUEST touches no hosts and does not yet block new registrations.
    assert_eq!(fleet.coord.shutdown_stage(), ShutdownStage::None);
}

#[test]
fn inform_barrier_holds_until_every_host_replies() {
    let mut fleet = TestFleet::ready(test_config());
    let _a = fleet.add_host(1, 7001);
    let _b = fleet.add_host(2, 7002);
    fleet.settle_topology();

    let mut rx = fleet.request_deferred(db_addr(), shutdown_req(ShutdownStage::Inform, 500));
    assert_eq!(fleet.coord.shutdown_stage(), ShutdownStage::Inform);

    let requests = fleet.transport.take_requests();
    assert_eq!(requests.len(), 2);
    for (_, msg, _) in &requests {
        assert!(matches!(
            msg,
            Outbound::Host(HostMsg::ControlledShutdown {
                stage: ShutdownStage::Inform,
                time: 500
            })
        ));
    }

    // One reply: barrier still closed.
    fleet.reply(requests[0].2, Ok(Reply::Ack));
    assert!(rx.try_recv().is_err());

    // Second reply: upstream is acknowledged.
    fleet.reply(requests[1].2, Ok(Reply::Ack));
    assert!(matches!(rx.try_recv(), Ok(Reply::Ack)));
}

#[test]
fn inform_with_zero_hosts_still_enters_the_stage() {
    let mut fleet = TestFleet::ready(test_config());

    let mut rx = fleet.request_deferred(db_addr(), shutdown_req(ShutdownStage::Inform, 0));

    // Nothing to wait on: the barrier completes at once, but the stage was
    // entered, never skipped.
    assert!(matches!(rx.try_recv(), Ok(Reply::Ack)));
    assert_eq!(fleet.coord.shutdown_stage(), ShutdownStage::Inform);
}

#[test]
fn a_host_error_counts_toward_the_inform_barrier() {
    let mut fleet = TestFleet::ready(test_config());
    let _a = fleet.add_host(1, 7001);
    let _b = fleet.add_host(2, 7002);
    fleet.settle_topology();

    let mut rx = fleet.request_deferred(db_addr(), shutdown_req(ShutdownStage::Inform, 500));
    let requests = fleet.transport.take_requests();

    fleet.reply(requests[0].2, Ok(Reply::Ack));
    fleet.reply(
        requests[1].2,
        Err(fleetmgr::Error::TransportTimeout("host".into())),
    );
    assert!(matches!(rx.try_recv(), Ok(Reply::Ack)));
}

#[test]
fn perform_walks_hosts_one_at_a_time() {
    let mut fleet = TestFleet::ready(test_config());
    let a = fleet.add_host(1, 7001);
    let b = fleet.add_host(2, 7002);
    fleet.settle_topology();

    fleet.send(db_addr(), shutdown_req(ShutdownStage::Perform, 0));

    // First host, first step: disconnect its client proxies.
    let requests = fleet.transport.take_requests();
    assert_eq!(requests.len(), 1, "PERFORM must be sequential, not broadcast");
    let (to, msg, token) = requests.into_iter().next().unwrap();
    assert_eq!(to, a);
    assert!(fleet.coord.registry().contains(&a));
    assert!(matches!(
        msg,
        Outbound::Host(HostMsg::ControlledShutdown {
            stage: ShutdownStage::DisconnectProxies,
            ..
        })
    ));
    fleet.reply(token, Ok(Reply::Ack));

    // First host, second step: stop it; confirmed hosts leave the registry.
    let requests = fleet.transport.take_requests();
    assert_eq!(requests.len(), 1);
    let (to, msg, token) = requests.into_iter().next().unwrap();
    assert_eq!(to, a);
    assert!(matches!(
        msg,
        Outbound::Host(HostMsg::ControlledShutdown {
            stage: ShutdownStage::Perform,
            ..
        })
    ));
    fleet.reply(token, Ok(Reply::Ack));
    assert!(!fleet.coord.registry().contains(&a));

    // Only now does the walk reach the second host.
    let requests = fleet.transport.take_requests();
    assert_eq!(requests.len(), 1);
    let (to, _, token) = requests.into_iter().next().unwrap();
    assert_eq!(to, b);
    assert!(fleet.coord.registry().contains(&b));
    fleet.reply(token, Ok(Reply::Ack));

    let requests = fleet.transport.take_requests();
    let (to, _, token) = requests.into_iter().next().unwrap();
    assert_eq!(to, b);
    fleet.reply(token, Ok(Reply::Ack));

    // Fleet fully down: the coordinator stops itself.
    assert_eq!(fleet.coord.registry().len(), 0);
    assert!(fleet.coord.is_stopping());
}

#[test]
fn perform_skips_to_the_next_host_on_error() {
    let mut fleet = TestFleet::ready(test_config());
    let a = fleet.add_host(1, 7001);
    let b = fleet.add_host(2, 7002);
    fleet.settle_topology();

    fleet.send(db_addr(), shutdown_req(ShutdownStage::Perform, 0));

    let requests = fleet.transport.take_requests();
    let (to, _, token) = requests.into_iter().next().unwrap();
    assert_eq!(to, a);

    // The disconnect step errors out: the host is abandoned, not retried,
    // and the walk proceeds.
    fleet.reply(token, Err(fleetmgr::Error::TransportTimeout("host".into())));
    assert!(!fleet.coord.registry().contains(&a));

    let requests = fleet.transport.take_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, b);
}

#[test]
fn new_hosts_are_rejected_during_shutdown() {
    let mut fleet = TestFleet::ready(test_config());
    let _a = fleet.add_host(1, 7001);
    fleet.settle_topology();

    let _rx = fleet.request_deferred(db_addr(), shutdown_req(ShutdownStage::Inform, 100));

    let b = addr(2, 7002);
    let reply = fleet.request(
        b,
        Request::Add {
            addr: b,
            external_addr: ext_addr(2, 7002),
        },
    );
    assert!(reply.is_none());
    assert_eq!(fleet.coord.registry().len(), 1);
}

#[test]
fn death_notifications_are_ignored_during_shutdown() {
    let mut fleet = TestFleet::ready(test_config());
    let a = fleet.add_host(1, 7001);
    let _b = fleet.add_host(2, 7002);
    fleet.settle_topology();

    let _rx = fleet.request_deferred(db_addr(), shutdown_req(ShutdownStage::Inform, 100));
    fleet.drain();

    fleet.send(db_addr(), Request::HandleHostDeath { addr: a });

    // Hosts disappearing mid-shutdown is expected; no repair is attempted.
    assert!(fleet.coord.registry().contains(&a));
    assert!(fleet.coord.backup_chain().entries().is_empty());
}

#[test]
fn trigger_elects_the_gateway_first_then_the_persistence_service() {
    // With a gateway configured, it gets the request.
    let mut config = test_config();
    let gateway: std::net::SocketAddr = "10.0.9.1:7300".parse().unwrap();
    config.gateway_addr = Some(gateway);
    let mut fleet = TestFleet::ready(config);

    fleet.send(db_addr(), shutdown_req(ShutdownStage::Trigger, 0));
    let sent = fleet.drain();
    assert!(sent.iter().any(|(to, m)| *to == gateway
        && matches!(m, Outbound::Peer(PeerMsg::ControlledShutdown { .. }))));

    // Without one, the persistence service drives it.
    let mut fleet = TestFleet::ready(test_config());
    fleet.send(db_addr(), shutdown_req(ShutdownStage::Trigger, 0));
    let sent = fleet.drain();
    assert!(sent.iter().any(|(to, m)| *to == db_addr()
        && matches!(m, Outbound::Peer(PeerMsg::ControlledShutdown { .. }))));

    // With neither, the coordinator starts the protocol itself by
    // forwarding REQUEST to the peer coordinator.
    let mut config = test_config();
    config.db_addr = None;
    let mut fleet = TestFleet::ready(config);
    fleet.send(addr(9, 9100), shutdown_req(ShutdownStage::Trigger, 0));
    let sent = fleet.drain();
    assert!(sent.iter().any(|(to, m)| *to == peer_addr()
        && matches!(
            m,
            Outbound::Peer(PeerMsg::ControlledShutdown {
                stage: ShutdownStage::Request,
                ..
            })
        )));
}

#[tokio::test]
async fn event_loop_stops_on_shutdown() {
    use fleetmgr::coordinator::server::Event;
    use fleetmgr::transport::testing::RecordingTransport;
    use fleetmgr::Coordinator;

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let coordinator = Coordinator::new(test_config(), RecordingTransport::new());
    let handle = tokio::spawn(coordinator.run(rx));

    tx.send(Event::Request {
        from: addr(9, 9000),
        req: Request::Shutdown {
            shutdown_others: false,
        },
        reply: None,
    })
    .unwrap();

    // The loop drains the event and stops itself.
    handle.await.unwrap();
}

#[test]
fn immediate_shutdown_notifies_everyone_when_asked() {
    let mut fleet = TestFleet::ready(test_config());
    let a = fleet.add_host(1, 7001);
    fleet.settle_topology();

    let reply = fleet.request(
        addr(9, 9000),
        Request::Shutdown {
            shutdown_others: true,
        },
    );
    assert!(matches!(reply, Some(Reply::Ack)));
    assert!(fleet.coord.is_stopping());

    let sent = fleet.drain();
    assert!(TestFleet::host_msgs_to(&sent, a)
        .iter()
        .any(|m| matches!(m, HostMsg::Shutdown)));
    assert!(sent.iter().any(|(to, m)| *to == peer_addr()
        && matches!(m, Outbound::Peer(PeerMsg::Shutdown))));
}
