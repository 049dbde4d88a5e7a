//! Coordinator server
//!
//! One tokio task exclusively owns the [`Coordinator`]; every input — RPC
//! ingress, timer ticks, reply callbacks, admin queries — arrives as an
//! [`Event`] on a single queue and is handled to completion. There are no
//! locks because there is no sharing: handlers never yield between reading
//! and writing the registry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

use crate::common::{BackupHash, BackupHashChain, CoordinatorConfig, Result};
use crate::transport::{HttpTransport, ReplyToken, Transport};

use super::backup::{adjust_backup_targets, finish_backup_transition, TopologyOp};
use super::globals::{EntityRef, GlobalEntities, SharedData, SharedDomain};
use super::http;
use super::liveness::find_dead_host;
use super::placement::{assign_create_destinations, OverloadGate};
use super::registry::{Host, HostId, HostRegistry, HostStatus};
use super::retirement::check_offload_candidates;
use super::rpc::{
    ErrorCode, GameTime, HostMsg, MessageKind, Outbound, PeerMsg, RecoverHostData, Reply, Request,
};
use super::shutdown::{ShutdownOrchestrator, ShutdownStage, StageOutcome};

/// Channel end used to answer a request/reply RPC. Dropping it without
/// sending leaves the caller to time out, which is how "silent rejection"
/// is expressed.
pub type ReplySink = oneshot::Sender<Reply>;

/// Everything the coordinator reacts to.
pub enum Event {
    /// Inbound RPC from a host, a peer service or admin tooling.
    Request {
        from: SocketAddr,
        req: Request,
        reply: Option<ReplySink>,
    },
    /// Outcome of a request the coordinator sent earlier.
    Reply {
        token: ReplyToken,
        result: Result<Reply>,
    },
    /// Fixed-period timer.
    Tick,
    /// Read-only snapshot queries from the admin API.
    Admin(AdminQuery),
}

pub enum AdminQuery {
    Status(oneshot::Sender<serde_json::Value>),
    Hosts(oneshot::Sender<Vec<HostStatus>>),
    BackupChain(oneshot::Sender<BackupHashChain>),
}

/// Per-request context handed to handlers.
pub struct RpcContext {
    pub from: SocketAddr,
    pub reply: Option<ReplySink>,
}

impl RpcContext {
    fn ack(self) {
        if let Some(sink) = self.reply {
            let _ = sink.send(Reply::Ack);
        }
    }

    fn respond(self, reply: Reply) {
        if let Some(sink) = self.reply {
            let _ = sink.send(reply);
        }
    }
}

/// What to do when a reply (or transport error) comes back for a request
/// the coordinator issued.
enum PendingReply {
    /// Relay a forwarded create-entity reply to the original caller.
    CreateEntityRelay { sink: ReplySink, host: SocketAddr },
    /// One INFORM-stage barrier acknowledgement.
    InformAck,
    /// One step of the sequential PERFORM walk.
    PerformStep { addr: SocketAddr, phase: PerformPhase },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PerformPhase {
    Disconnect,
    Stop,
}

type Handler = fn(&mut Coordinator, RpcContext, Request);

/// Runtime dispatch table: message kind to handler function.
fn handler_table() -> HashMap<MessageKind, Handler> {
    let mut table: HashMap<MessageKind, Handler> = HashMap::new();
    table.insert(MessageKind::Add, handlers::add);
    table.insert(MessageKind::Del, handlers::del);
    table.insert(MessageKind::InformOfLoad, handlers::inform_of_load);
    table.insert(MessageKind::CreateEntity, handlers::create_entity);
    table.insert(MessageKind::Retire, handlers::retire);
    table.insert(MessageKind::UseNewBackupHash, handlers::use_new_backup_hash);
    table.insert(MessageKind::RegisterGlobal, handlers::register_global);
    table.insert(MessageKind::DeregisterGlobal, handlers::deregister_global);
    table.insert(MessageKind::SetSharedData, handlers::set_shared_data);
    table.insert(MessageKind::DelSharedData, handlers::del_shared_data);
    table.insert(MessageKind::ControlledShutdown, handlers::controlled_shutdown);
    table.insert(MessageKind::RequestBackupChain, handlers::request_backup_chain);
    table.insert(MessageKind::HandleHostDeath, handlers::handle_host_death);
    table.insert(MessageKind::HandleCellDeath, handlers::handle_cell_death);
    table.insert(MessageKind::InitData, handlers::init_data);
    table.insert(MessageKind::Startup, handlers::startup);
    table.insert(MessageKind::RecoverHost, handlers::recover_host);
    table.insert(MessageKind::Shutdown, handlers::shutdown);
    table
}

/// The fleet coordinator: registry, placement, backup topology, retirement,
/// liveness, shutdown sequencing and the fleet-wide registries, owned by a
/// single event loop.
pub struct Coordinator {
    config: CoordinatorConfig,
    transport: Arc<dyn Transport>,
    registry: HostRegistry,
    overload: OverloadGate,
    shutdown: ShutdownOrchestrator,
    globals: GlobalEntities,
    shared: SharedData,
    chain: BackupHashChain,
    handlers: HashMap<MessageKind, Handler>,

    game_time: GameTime,
    tick_count: u64,
    multi_machine: bool,
    best_host: Option<SocketAddr>,
    has_init_data: bool,
    has_started: bool,

    next_token: ReplyToken,
    pending: HashMap<ReplyToken, PendingReply>,
    /// Upstream requester waiting on the INFORM barrier.
    inform_upstream: Option<ReplySink>,
    stopping: bool,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, transport: Arc<dyn Transport>) -> Self {
        let overload = OverloadGate::new(
            config.overload_level,
            config.overload_tolerance(),
            config.overload_admit_budget,
        );
        Self {
            transport,
            overload,
            config,
            registry: HostRegistry::new(),
            shutdown: ShutdownOrchestrator::new(),
            globals: GlobalEntities::new(),
            shared: SharedData::new(),
            chain: BackupHashChain::new(),
            handlers: handler_table(),
            game_time: 0,
            tick_count: 0,
            multi_machine: false,
            best_host: None,
            has_init_data: false,
            has_started: false,
            next_token: 0,
            pending: HashMap::new(),
            inform_upstream: None,
            stopping: false,
        }
    }

    /// Run the coordinator on stdio-free config: bind the HTTP ingress,
    /// start the tick timer and drive the event loop until shutdown.
    pub async fn serve(config: CoordinatorConfig) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = HttpTransport::new(tx.clone(), config.request_timeout());

        tracing::info!("Starting fleet coordinator");
        tracing::info!("  HTTP API: {}", config.bind_addr);
        tracing::info!("  Peer coordinator: {:?}", config.peer_addr);
        tracing::info!("  Persistence service: {:?}", config.db_addr);
        tracing::info!("  Overload level: {:.2}", config.overload_level);

        let router = http::create_router(http::AppState { events: tx.clone() });
        let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;

        let tick = tokio::spawn(tick_task(tx.clone(), config.tick_interval()));

        let coordinator = Coordinator::new(config, transport);

        tokio::select! {
            res = axum::serve(listener, router) => {
                if let Err(e) = res {
                    tracing::error!("HTTP server error: {}", e);
                }
            }
            _ = coordinator.run(rx) => {
                tracing::info!("Coordinator loop finished");
            }
        }

        tick.abort();
        Ok(())
    }

    /// Drive the event loop until a shutdown event stops it.
    pub async fn run(mut self, mut rx: UnboundedReceiver<Event>) {
        while let Some(event) = rx.recv().await {
            self.handle_event(event);
            if self.stopping {
                break;
            }
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    pub fn game_time(&self) -> GameTime {
        self.game_time
    }

    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    pub fn backup_chain(&self) -> &BackupHashChain {
        &self.chain
    }

    pub fn shutdown_stage(&self) -> ShutdownStage {
        self.shutdown.stage()
    }

    /// Handle one event to completion. Public so tests can drive the
    /// coordinator without the loop.
    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::Request { from, req, reply } => self.dispatch(from, req, reply),
            Event::Reply { token, result } => self.handle_reply(token, result),
            Event::Tick => self.handle_tick(),
            Event::Admin(query) => self.handle_admin(query),
        }
    }

    fn dispatch(&mut self, from: SocketAddr, req: Request, reply: Option<ReplySink>) {
        // Any traffic from a registered host counts as a heartbeat.
        if let Some(host) = self.registry.get_mut(&from) {
            host.touch(Instant::now());
        }

        let kind = req.kind();
        let handler = self.handlers.get(&kind).copied();
        match handler {
            Some(handler) => handler(self, RpcContext { from, reply }, req),
            None => {
                tracing::error!("No handler registered for message kind {:?}", kind);
            }
        }
    }

    // === Host membership ===

    fn handle_add(&mut self, ctx: RpcContext, addr: SocketAddr, external_addr: SocketAddr) {
        // Not ready to accept hosts yet or shutting down: drop the reply so
        // the caller times out and retries.
        if !self.has_init_data {
            tracing::info!("add: not allowing host at {} to register yet", addr);
            return;
        }
        if self.shutdown.in_progress() {
            return;
        }
        if self.registry.contains(&addr) {
            tracing::error!(
                "{}",
                crate::Error::InvariantViolation(format!("duplicate host registration at {}", addr))
            );
            return;
        }

        // The peer coordinator learns about the first host immediately so
        // the compute fleet has somewhere to create entities.
        if self.registry.is_empty() {
            self.best_host = Some(addr);
            self.send_peer(PeerMsg::SetBestHost { addr });
        }

        let id = self.registry.next_id();
        self.registry.insert(Host::new(addr, external_addr, id));
        self.chain.forget(&addr);

        tracing::debug!(
            "add: allocated id {} ({} hosts), internal {}, external {}",
            id,
            self.registry.len(),
            addr,
            external_addr
        );

        let mut peers = Vec::new();
        for other in self.registry.addrs() {
            if other == addr {
                continue;
            }
            let external = self.registry.get(&other).map(|h| h.external_addr());
            if let Some(external) = external {
                peers.push((other, external));
                self.transport.send(
                    other,
                    Outbound::Host(HostMsg::HostBirth { addr, external_addr }),
                );
            }
        }

        ctx.respond(Reply::AddAck {
            id,
            game_time: self.game_time,
            is_ready: self.has_started,
            globals: self.globals.snapshot(),
            shared_host_data: self.shared.snapshot(SharedDomain::Host),
            shared_fleet_data: self.shared.snapshot(SharedDomain::Fleet),
            peers,
        });

        let update = adjust_backup_targets(&mut self.registry, addr, TopologyOp::Add, self.multi_machine);
        self.multi_machine = update.multi_machine;
        self.send_host_batch(update.sends);
        self.recheck_offloading();
    }

    fn handle_del(&mut self, ctx: RpcContext, id: HostId) {
        tracing::trace!("del: {}", id);
        if self.on_host_death(ctx.from) {
            tracing::debug!("del: now have {} hosts", self.registry.len());
        } else {
            tracing::error!("del: no host at {} (id {})", ctx.from, id);
        }
        ctx.ack();
    }

    fn handle_inform_of_load(&mut self, ctx: RpcContext, load: f32, entities: u32, heavy: u32) {
        if !self.registry.update_load(&ctx.from, load, entities, heavy) {
            tracing::error!("inform_of_load: no host with address {}", ctx.from);
        }
    }

    // === Placement ===

    fn handle_create_entity(&mut self, ctx: RpcContext, payload: serde_json::Value) {
        let Some(best) = self.registry.best() else {
            tracing::error!("create_entity: could not find a host");
            ctx.respond(Reply::Error {
                code: ErrorCode::NoHostsAvailable,
                message: "No host could be found to create on".into(),
            });
            return;
        };
        let (best_addr, best_load) = (best.addr(), best.load());

        if !self.overload.admit(best_load, Instant::now()) {
            tracing::info!(
                "create_entity: all hosts overloaded (best load {:.2} > level {:.2})",
                best_load,
                self.overload.level()
            );
            ctx.respond(Reply::Error {
                code: ErrorCode::FleetOverloaded,
                message: "All hosts overloaded".into(),
            });
            return;
        }

        let token = self.next_reply_token();
        if let Some(sink) = ctx.reply {
            self.pending.insert(
                token,
                PendingReply::CreateEntityRelay {
                    sink,
                    host: best_addr,
                },
            );
        }
        self.transport.request(
            best_addr,
            Outbound::Host(HostMsg::CreateEntity { payload }),
            token,
        );

        // Count the entity now so back-to-back placements see it before the
        // host's next load report.
        if let Some(host) = self.registry.get_mut(&best_addr) {
            host.add_entity();
        }
    }

    // === Retirement ===

    fn handle_retire(&mut self, ctx: RpcContext) {
        let from = ctx.from;
        let Some(host) = self.registry.get_mut(&from) else {
            tracing::error!("retire: no host at {}", from);
            return;
        };
        tracing::info!("Host {} is retiring", from);
        host.start_retiring();

        if self.best_host == Some(from) {
            self.update_best_host();
        }

        let has_target = self
            .registry
            .iter()
            .any(|h| h.addr() != from && !h.is_retiring());
        if !has_target {
            // Nowhere to offload to; the only safe exit is the death path.
            tracing::warn!(
                "retire: no host can take over from {}; handling as a departure",
                from
            );
            self.on_host_death(from);
            ctx.ack();
            return;
        }

        let update =
            adjust_backup_targets(&mut self.registry, from, TopologyOp::Retire, self.multi_machine);
        self.multi_machine = update.multi_machine;
        self.send_host_batch(update.sends);
        self.recheck_offloading();
        ctx.ack();
    }

    fn handle_use_new_backup_hash(&mut self, ctx: RpcContext, old: BackupHash, new: BackupHash) {
        let sends = finish_backup_transition(&mut self.registry, ctx.from, &old, new);
        self.send_host_batch(sends);
        self.recheck_offloading();
    }

    /// Latch offloading on any retiring host whose topology has settled.
    /// Condition (3) of the gate depends on other hosts' progress, so this
    /// runs after every membership event and acknowledgement.
    fn recheck_offloading(&mut self) {
        for addr in check_offload_candidates(&mut self.registry) {
            self.transport
                .send(addr, Outbound::Host(HostMsg::StartOffloading));
        }
    }

    // === Global entities and shared data ===

    fn handle_register_global(&mut self, ctx: RpcContext, name: String, entity: EntityRef) {
        if !self.registry.contains(&ctx.from) {
            tracing::error!(
                "register_global: message from unregistered host {}, aborted",
                ctx.from
            );
            return;
        }

        let registered = self.globals.register(name.clone(), entity);
        if registered {
            tracing::info!("register_global: registered {} from {}", name, ctx.from);
            self.broadcast_except(
                HostMsg::AddGlobalEntity { name, entity },
                Some(ctx.from),
            );
        } else {
            tracing::info!("register_global: name {} already taken", name);
        }

        ctx.respond(Reply::RegisterGlobalAck { registered });
    }

    fn handle_deregister_global(&mut self, ctx: RpcContext, name: String) {
        if self.globals.deregister(&name).is_some() {
            tracing::info!("deregister_global: {} from {}", name, ctx.from);
            self.broadcast_except(HostMsg::DelGlobalEntity { name }, Some(ctx.from));
        } else {
            tracing::error!("deregister_global: no entity named {}", name);
        }
        ctx.ack();
    }

    fn handle_set_shared_data(
        &mut self,
        ctx: RpcContext,
        domain: SharedDomain,
        key: String,
        value: String,
    ) {
        let from_peer = Some(ctx.from) == self.config.peer_addr;
        if domain == SharedDomain::Fleet && !from_peer {
            // Fleet-wide data is authoritative in the peer coordinator:
            // forward and commit only once its echo comes back.
            self.send_peer(PeerMsg::SetSharedData { domain, key, value });
            return;
        }

        self.shared.set(domain, key.clone(), value.clone());
        self.broadcast_except(HostMsg::SetSharedData { domain, key, value }, None);
    }

    fn handle_del_shared_data(&mut self, ctx: RpcContext, domain: SharedDomain, key: String) {
        let from_peer = Some(ctx.from) == self.config.peer_addr;
        if domain == SharedDomain::Fleet && !from_peer {
            self.send_peer(PeerMsg::DelSharedData { domain, key });
            return;
        }

        self.shared.del(domain, &key);
        self.broadcast_except(HostMsg::DelSharedData { domain, key }, None);
    }

    // === Death handling ===

    fn handle_host_death_notification(&mut self, ctx: RpcContext, addr: SocketAddr) {
        // During a controlled shutdown hosts are expected to disappear.
        if self.shutdown.in_progress() {
            return;
        }
        tracing::info!("Death notification for host at {}", addr);
        self.on_host_death(addr);
        ctx.ack();
    }

    /// Shared removal path for crashes, failed retirements and `del`.
    /// Returns false when the address is unknown.
    fn on_host_death(&mut self, addr: SocketAddr) -> bool {
        let Some(host) = self.registry.get(&addr) else {
            return false;
        };
        tracing::info!("on_host_death: host{:02} @ {}", host.id(), addr);

        let mut controlled = false;

        if self.config.hard_kill_on_death {
            // Make sure it's really dead, otherwise the standby will have
            // trouble taking over its address.
            tracing::info!("on_host_death: requesting hard kill of {}", addr);
            self.transport.hard_kill(addr);
        }

        if self.config.shutdown_on_death {
            controlled = true;
            tracing::warn!("on_host_death: shutdown_on_death is enabled, shutting down fleet");
        } else if host.backup().is_empty() {
            if host.pending_backup().is_empty() {
                tracing::error!("on_host_death: no backup for {}", addr);
            } else {
                tracing::error!("on_host_death: backup not ready for {}", addr);
            }
            if self.config.shutdown_on_bad_state {
                controlled = true;
            }
        }

        let backup = host.backup().clone();
        self.chain.record_death(addr, backup.clone());

        self.send_peer(PeerMsg::HostDeath {
            addr,
            backup: backup.clone(),
        });

        if self.registry.len() > 1 && !controlled {
            self.broadcast_except(
                HostMsg::HostDeath {
                    addr,
                    backup: backup.clone(),
                },
                Some(addr),
            );
        }

        let moved = self.globals.redirect_dead(&addr, &self.chain);
        if moved > 0 {
            tracing::info!(
                "on_host_death: redirected {} global entities off {}",
                moved,
                addr
            );
        }

        self.registry.remove(&addr);

        let update =
            adjust_backup_targets(&mut self.registry, addr, TopologyOp::Crash, self.multi_machine);
        self.multi_machine = update.multi_machine;
        self.send_host_batch(update.sends);

        for a in self.registry.addrs() {
            if let Some(h) = self.registry.get_mut(&a) {
                h.stops_backup_for(&addr);
            }
        }

        self.recheck_offloading();

        if self.best_host == Some(addr) {
            self.best_host = None;
            self.update_best_host();
        }

        if controlled {
            self.trigger_fleet_shutdown();
        } else {
            self.update_create_destinations();
        }

        true
    }

    fn handle_cell_death(&mut self, _ctx: RpcContext, payload: serde_json::Value) {
        tracing::trace!("handle_cell_death: relaying to all hosts");
        self.broadcast_except(HostMsg::CellDeath { payload }, None);
    }

    // === Controlled shutdown ===

    fn handle_controlled_shutdown(&mut self, ctx: RpcContext, stage: ShutdownStage, time: GameTime) {
        self.apply_shutdown_stage(stage, time, ctx.reply);
    }

    fn apply_shutdown_stage(
        &mut self,
        stage: ShutdownStage,
        time: GameTime,
        reply: Option<ReplySink>,
    ) {
        let outcome = self.shutdown.handle_stage(stage, time, self.registry.addrs());
        match outcome {
            StageOutcome::ForwardRequestToPeer => {
                self.send_peer(PeerMsg::ControlledShutdown {
                    stage: ShutdownStage::Request,
                    time,
                });
                if let Some(sink) = reply {
                    let _ = sink.send(Reply::Ack);
                }
            }

            StageOutcome::Inform { targets } => {
                self.inform_upstream = reply;
                if targets.is_empty() {
                    self.complete_inform_barrier();
                } else {
                    for target in targets {
                        let token = self.next_reply_token();
                        self.pending.insert(token, PendingReply::InformAck);
                        self.transport.request(
                            target,
                            Outbound::Host(HostMsg::ControlledShutdown {
                                stage: ShutdownStage::Inform,
                                time,
                            }),
                            token,
                        );
                    }
                }
            }

            StageOutcome::PerformNext { target } => {
                if let Some(sink) = reply {
                    let _ = sink.send(Reply::Ack);
                }
                self.begin_perform_target(target);
            }

            StageOutcome::FleetDone => {
                if let Some(sink) = reply {
                    let _ = sink.send(Reply::Ack);
                }
                self.finish_fleet_shutdown();
            }

            StageOutcome::TriggerUpstream => {
                if let Some(sink) = reply {
                    let _ = sink.send(Reply::Ack);
                }
                self.trigger_fleet_shutdown();
            }

            StageOutcome::Ignore => {
                if let Some(sink) = reply {
                    let _ = sink.send(Reply::Ack);
                }
            }
        }
    }

    fn complete_inform_barrier(&mut self) {
        tracing::info!("Shutdown INFORM stage acknowledged by every host");
        if let Some(sink) = self.inform_upstream.take() {
            let _ = sink.send(Reply::Ack);
        }
    }

    /// Start the disconnect-then-stop step for one host, skipping hosts
    /// that left the registry since the walk was queued.
    fn begin_perform_target(&mut self, target: SocketAddr) {
        let mut target = target;
        loop {
            if self.registry.contains(&target) {
                let token = self.next_reply_token();
                self.pending.insert(
                    token,
                    PendingReply::PerformStep {
                        addr: target,
                        phase: PerformPhase::Disconnect,
                    },
                );
                self.transport.request(
                    target,
                    Outbound::Host(HostMsg::ControlledShutdown {
                        stage: ShutdownStage::DisconnectProxies,
                        time: self.shutdown.shutdown_time(),
                    }),
                    token,
                );
                return;
            }
            match self.shutdown.advance_perform() {
                StageOutcome::PerformNext { target: next } => target = next,
                _ => {
                    self.finish_fleet_shutdown();
                    return;
                }
            }
        }
    }

    fn finish_fleet_shutdown(&mut self) {
        tracing::info!("Controlled fleet shutdown complete");
        self.stopping = true;
    }

    /// Elect an upstream component to initiate the shutdown: the gateway
    /// first, then the persistence service, then this coordinator itself.
    fn trigger_fleet_shutdown(&mut self) {
        if let Some(gateway) = self.config.gateway_addr {
            tracing::info!("Triggering fleet shutdown via gateway @ {}", gateway);
            self.transport.send(
                gateway,
                Outbound::Peer(PeerMsg::ControlledShutdown {
                    stage: ShutdownStage::Request,
                    time: 0,
                }),
            );
            return;
        }

        if let Some(db) = self.config.db_addr {
            tracing::info!("Triggering fleet shutdown via persistence service @ {}", db);
            self.transport.send(
                db,
                Outbound::Peer(PeerMsg::ControlledShutdown {
                    stage: ShutdownStage::Request,
                    time: 0,
                }),
            );
            return;
        }

        tracing::info!("Starting controlled shutdown here (no gateway or persistence service)");
        self.apply_shutdown_stage(ShutdownStage::Request, 0, None);
    }

    fn handle_shutdown(&mut self, ctx: RpcContext, shutdown_others: bool) {
        tracing::info!("shutdown: shutdown_others = {}", shutdown_others);
        if shutdown_others {
            self.broadcast_except(HostMsg::Shutdown, None);
            self.send_peer(PeerMsg::Shutdown);
        }
        self.stopping = true;
        ctx.ack();
    }

    // === Bootstrap, startup and recovery ===

    fn handle_init_data(&mut self, ctx: RpcContext, game_time: GameTime, max_host_id: HostId) {
        if self.has_init_data {
            tracing::error!(
                "init_data: ignored subsequent initialisation data from {}",
                ctx.from
            );
            return;
        }

        if self.game_time == 0 && game_time != 0 {
            self.game_time = game_time;
            tracing::info!("init_data: game time = {}", game_time);
        }
        if max_host_id != 0 {
            self.registry.note_recovered_id(max_host_id);
            tracing::info!("init_data: last host id = {}", max_host_id);
        }

        self.has_init_data = true;
        ctx.ack();
    }

    fn handle_startup(&mut self, ctx: RpcContext, auto_loaded_entities: bool) {
        if self.has_started {
            tracing::warn!("startup: already started");
            return;
        }
        tracing::info!("Fleet is starting");
        self.has_started = true;

        self.send_peer(PeerMsg::Startup);

        if self.registry.is_empty() {
            tracing::error!("startup: no hosts registered at fleet start");
        }

        // Exactly one host bootstraps the fleet-wide singletons.
        let mut bootstrap = true;
        for addr in self.registry.addrs() {
            self.transport.send(
                addr,
                Outbound::Host(HostMsg::Startup {
                    bootstrap,
                    auto_loaded_entities,
                }),
            );
            bootstrap = false;
        }
        ctx.ack();
    }

    fn handle_recover_host(&mut self, ctx: RpcContext, data: RecoverHostData) {
        tracing::debug!("recover_host: {} id {}", data.addr, data.id);

        // A recovering fleet is by definition a running one.
        self.has_started = true;
        self.game_time = self.game_time.max(data.game_time);
        self.registry.note_recovered_id(data.id);

        if self.registry.contains(&data.addr) {
            tracing::error!("recover_host: already know about a host at {}", data.addr);
            return;
        }

        let mut host = Host::new(data.addr, data.external_addr, data.id);
        host.restore_backup(data.backup, data.pending_backup);
        self.registry.insert(host);
        self.chain.forget(&data.addr);

        // Rebuild acceptance sets from the committed hashes, in both
        // directions, as far as recovery has progressed.
        let targets: Vec<SocketAddr> = self
            .registry
            .get(&data.addr)
            .map(|h| h.backup().buckets().to_vec())
            .unwrap_or_default();
        for target in targets {
            if let Some(t) = self.registry.get_mut(&target) {
                t.starts_backup_for(data.addr);
            }
        }
        let owners: Vec<SocketAddr> = self
            .registry
            .iter()
            .filter(|h| h.addr() != data.addr && h.backup().contains(&data.addr))
            .map(|h| h.addr())
            .collect();
        for owner in owners {
            if let Some(h) = self.registry.get_mut(&data.addr) {
                h.starts_backup_for(owner);
            }
        }

        for (key, value) in data.shared_host_data {
            self.shared.set(SharedDomain::Host, key, value);
        }
        for (key, value) in data.shared_fleet_data {
            self.shared.set(SharedDomain::Fleet, key, value);
        }
        for (name, entity) in data.globals {
            if entity.host != data.addr {
                tracing::warn!(
                    "recover_host: global {} claims owner {}, sender is {}",
                    name,
                    entity.host,
                    data.addr
                );
            }
            if !self.globals.register(name.clone(), entity) {
                tracing::warn!("recover_host: global {} recovered twice", name);
            }
        }
        ctx.ack();
    }

    fn handle_request_backup_chain(&mut self, ctx: RpcContext) {
        ctx.respond(Reply::BackupChain {
            chain: self.chain.clone(),
        });
    }

    // === Timer ===

    fn handle_tick(&mut self) {
        // Paused at the agreed shutdown time.
        if self.shutdown.shutdown_time() != 0 && self.game_time == self.shutdown.shutdown_time() {
            return;
        }
        if !self.has_started {
            return;
        }

        self.game_time += 1;
        self.tick_count += 1;

        if !self.shutdown.in_progress() {
            let dead = find_dead_host(
                &self.registry,
                Instant::now(),
                self.config.host_timeout(),
                self.config.dead_host_safeguard,
            );
            // One death per tick; handling it mutates the registry that the
            // scan iterated.
            if let Some(addr) = dead {
                self.on_host_death(addr);
            }
        }

        if self.config.create_info_period_ticks != 0
            && self.tick_count % self.config.create_info_period_ticks as u64 == 0
        {
            self.update_create_destinations();
        }

        self.update_best_host();
    }

    // === Reply glue ===

    fn handle_reply(&mut self, token: ReplyToken, result: Result<Reply>) {
        let Some(pending) = self.pending.remove(&token) else {
            tracing::warn!("Reply for unknown token {} (superseded or late)", token);
            return;
        };

        match pending {
            PendingReply::CreateEntityRelay { sink, host } => match result {
                Ok(reply) => {
                    let _ = sink.send(reply);
                }
                Err(e) => {
                    tracing::warn!("create_entity: forward to {} failed: {}", host, e);
                    let _ = sink.send(Reply::Error {
                        code: ErrorCode::NoHostsAvailable,
                        message: format!("Host at {} did not respond", host),
                    });
                }
            },

            PendingReply::InformAck => {
                if let Err(e) = result {
                    tracing::warn!("INFORM stage: a host failed to acknowledge: {}", e);
                }
                if self.shutdown.note_inform_reply() {
                    self.complete_inform_barrier();
                }
            }

            PendingReply::PerformStep { addr, phase } => {
                self.handle_perform_step_reply(addr, phase, result);
            }
        }
    }

    fn handle_perform_step_reply(
        &mut self,
        addr: SocketAddr,
        phase: PerformPhase,
        result: Result<Reply>,
    ) {
        let errored = result.is_err();
        if let Err(e) = result {
            tracing::warn!(
                "PERFORM stage: {} failed during {:?}: {}; moving on",
                addr,
                phase,
                e
            );
        }

        if phase == PerformPhase::Disconnect && !errored {
            let token = self.next_reply_token();
            self.pending.insert(
                token,
                PendingReply::PerformStep {
                    addr,
                    phase: PerformPhase::Stop,
                },
            );
            self.transport.request(
                addr,
                Outbound::Host(HostMsg::ControlledShutdown {
                    stage: ShutdownStage::Perform,
                    time: self.shutdown.shutdown_time(),
                }),
                token,
            );
            return;
        }

        // Stop confirmed (or the host errored out of the walk): it is done.
        self.registry.remove(&addr);
        match self.shutdown.advance_perform() {
            StageOutcome::PerformNext { target } => self.begin_perform_target(target),
            StageOutcome::FleetDone => self.finish_fleet_shutdown(),
            _ => {}
        }
    }

    // === Admin ===

    fn handle_admin(&mut self, query: AdminQuery) {
        match query {
            AdminQuery::Status(sink) => {
                let _ = sink.send(self.status_json());
            }
            AdminQuery::Hosts(sink) => {
                let hosts: Vec<HostStatus> = self.registry.iter().map(|h| h.status()).collect();
                let _ = sink.send(hosts);
            }
            AdminQuery::BackupChain(sink) => {
                let _ = sink.send(self.chain.clone());
            }
        }
    }

    fn status_json(&self) -> serde_json::Value {
        serde_json::json!({
            "game_time": self.game_time,
            "hosts": self.registry.len(),
            "started": self.has_started,
            "accepting_hosts": self.has_init_data && !self.shutdown.in_progress(),
            "multi_machine": self.multi_machine,
            "shutdown_stage": self.shutdown.stage().to_string(),
            "best_host": self.best_host,
            "load": {
                "min": self.registry.min_load(),
                "avg": self.registry.avg_load(),
                "max": self.registry.max_load(),
            },
            "entities": self.registry.total_entities(),
            "heavy_entities": self.registry.total_heavy_entities(),
            "global_entities": self.globals.len(),
        })
    }

    // === Helpers ===

    fn next_reply_token(&mut self) -> ReplyToken {
        self.next_token += 1;
        self.next_token
    }

    /// The least-loaded non-retiring host, announced to the peer coordinator
    /// whenever it changes.
    fn update_best_host(&mut self) {
        if let Some(best) = self.registry.best().map(|h| h.addr()) {
            if self.best_host != Some(best) {
                self.best_host = Some(best);
                self.send_peer(PeerMsg::SetBestHost { addr: best });
            }
        }
    }

    fn update_create_destinations(&mut self) {
        let hosts: Vec<(SocketAddr, f32)> = self
            .registry
            .iter()
            .map(|h| (h.addr(), h.load()))
            .collect();
        let assignments =
            assign_create_destinations(&hosts, self.config.create_ratio, &mut rand::thread_rng());
        for (host, dest) in assignments {
            self.transport.send(
                host,
                Outbound::Host(HostMsg::SetCreateDestination { addr: dest }),
            );
        }
    }

    fn send_peer(&self, msg: PeerMsg) {
        if let Some(peer) = self.config.peer_addr {
            self.transport.send(peer, Outbound::Peer(msg));
        }
    }

    fn send_host_batch(&self, sends: Vec<(SocketAddr, HostMsg)>) {
        for (to, msg) in sends {
            self.transport.send(to, Outbound::Host(msg));
        }
    }

    fn broadcast_except(&self, msg: HostMsg, except: Option<SocketAddr>) {
        for addr in self.registry.iter().map(|h| h.addr()) {
            if Some(addr) == except {
                continue;
            }
            self.transport.send(addr, Outbound::Host(msg.clone()));
        }
    }
}

/// Handler functions bound into the dispatch table. Each unwraps its message
/// kind and forwards to the coordinator method doing the actual work.
mod handlers {
    use super::*;

    fn mismatch(kind: &str) {
        tracing::error!("handler for {} bound to wrong message kind", kind);
    }

    pub(super) fn add(c: &mut Coordinator, ctx: RpcContext, req: Request) {
        match req {
            Request::Add {
                addr,
                external_addr,
            } => c.handle_add(ctx, addr, external_addr),
            _ => mismatch("add"),
        }
    }

    pub(super) fn del(c: &mut Coordinator, ctx: RpcContext, req: Request) {
        match req {
            Request::Del { id } => c.handle_del(ctx, id),
            _ => mismatch("del"),
        }
    }

    pub(super) fn inform_of_load(c: &mut Coordinator, ctx: RpcContext, req: Request) {
        match req {
            Request::InformOfLoad {
                load,
                entity_count,
                heavy_entity_count,
            } => c.handle_inform_of_load(ctx, load, entity_count, heavy_entity_count),
            _ => mismatch("inform_of_load"),
        }
    }

    pub(super) fn create_entity(c: &mut Coordinator, ctx: RpcContext, req: Request) {
        match req {
            Request::CreateEntity { payload } => c.handle_create_entity(ctx, payload),
            _ => mismatch("create_entity"),
        }
    }

    pub(super) fn retire(c: &mut Coordinator, ctx: RpcContext, req: Request) {
        match req {
            Request::Retire => c.handle_retire(ctx),
            _ => mismatch("retire"),
        }
    }

    pub(super) fn use_new_backup_hash(c: &mut Coordinator, ctx: RpcContext, req: Request) {
        match req {
            Request::UseNewBackupHash { old, new } => c.handle_use_new_backup_hash(ctx, old, new),
            _ => mismatch("use_new_backup_hash"),
        }
    }

    pub(super) fn register_global(c: &mut Coordinator, ctx: RpcContext, req: Request) {
        match req {
            Request::RegisterGlobal { name, entity } => c.handle_register_global(ctx, name, entity),
            _ => mismatch("register_global"),
        }
    }

    pub(super) fn deregister_global(c: &mut Coordinator, ctx: RpcContext, req: Request) {
        match req {
            Request::DeregisterGlobal { name } => c.handle_deregister_global(ctx, name),
            _ => mismatch("deregister_global"),
        }
    }

    pub(super) fn set_shared_data(c: &mut Coordinator, ctx: RpcContext, req: Request) {
        match req {
            Request::SetSharedData { domain, key, value } => {
                c.handle_set_shared_data(ctx, domain, key, value)
            }
            _ => mismatch("set_shared_data"),
        }
    }

    pub(super) fn del_shared_data(c: &mut Coordinator, ctx: RpcContext, req: Request) {
        match req {
            Request::DelSharedData { domain, key } => c.handle_del_shared_data(ctx, domain, key),
            _ => mismatch("del_shared_data"),
        }
    }

    pub(super) fn controlled_shutdown(c: &mut Coordinator, ctx: RpcContext, req: Request) {
        match req {
            Request::ControlledShutdown { stage, time } => {
                c.handle_controlled_shutdown(ctx, stage, time)
            }
            _ => mismatch("controlled_shutdown"),
        }
    }

    pub(super) fn request_backup_chain(c: &mut Coordinator, ctx: RpcContext, req: Request) {
        match req {
            Request::RequestBackupChain => c.handle_request_backup_chain(ctx),
            _ => mismatch("request_backup_chain"),
        }
    }

    pub(super) fn handle_host_death(c: &mut Coordinator, ctx: RpcContext, req: Request) {
        match req {
            Request::HandleHostDeath { addr } => c.handle_host_death_notification(ctx, addr),
            _ => mismatch("handle_host_death"),
        }
    }

    pub(super) fn handle_cell_death(c: &mut Coordinator, ctx: RpcContext, req: Request) {
        match req {
            Request::HandleCellDeath { payload } => c.handle_cell_death(ctx, payload),
            _ => mismatch("handle_cell_death"),
        }
    }

    pub(super) fn init_data(c: &mut Coordinator, ctx: RpcContext, req: Request) {
        match req {
            Request::InitData {
                game_time,
                max_host_id,
            } => c.handle_init_data(ctx, game_time, max_host_id),
            _ => mismatch("init_data"),
        }
    }

    pub(super) fn startup(c: &mut Coordinator, ctx: RpcContext, req: Request) {
        match req {
            Request::Startup {
                auto_loaded_entities,
            } => c.handle_startup(ctx, auto_loaded_entities),
            _ => mismatch("startup"),
        }
    }

    pub(super) fn recover_host(c: &mut Coordinator, ctx: RpcContext, req: Request) {
        match req {
            Request::RecoverHost(data) => c.handle_recover_host(ctx, *data),
            _ => mismatch("recover_host"),
        }
    }

    pub(super) fn shutdown(c: &mut Coordinator, ctx: RpcContext, req: Request) {
        match req {
            Request::Shutdown { shutdown_others } => c.handle_shutdown(ctx, shutdown_others),
            _ => mismatch("shutdown"),
        }
    }
}

/// Fixed-period tick source; dies with the event loop.
async fn tick_task(tx: UnboundedSender<Event>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if tx.send(Event::Tick).is_err() {
            break;
        }
    }
}
