//! RPC surface
//!
//! Message types exchanged with entity hosts, the peer coordinator, the
//! persistence service and the gateway, plus the kind table used to bind
//! inbound messages to handler functions at runtime.

use crate::common::{BackupHash, BackupHashChain};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use super::globals::{EntityRef, SharedDomain};
use super::registry::HostId;
use super::shutdown::ShutdownStage;

/// Fleet-wide game clock, in ticks.
pub type GameTime = u32;

/// Inbound messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    /// Host registration. Silently ignored (so the caller times out and
    /// retries) while the fleet is not accepting hosts.
    Add {
        addr: SocketAddr,
        external_addr: SocketAddr,
    },
    /// Graceful departure of a fully retired host.
    Del { id: HostId },
    /// Periodic load report.
    InformOfLoad {
        load: f32,
        entity_count: u32,
        heavy_entity_count: u32,
    },
    /// Create an entity on the best host; the reply carries the chosen
    /// host's external address.
    CreateEntity { payload: serde_json::Value },
    /// Voluntary retirement request from a host.
    Retire,
    /// A host acknowledges that it finished priming a backup transition.
    UseNewBackupHash { old: BackupHash, new: BackupHash },
    RegisterGlobal { name: String, entity: EntityRef },
    DeregisterGlobal { name: String },
    SetSharedData {
        domain: SharedDomain,
        key: String,
        value: String,
    },
    DelSharedData { domain: SharedDomain, key: String },
    ControlledShutdown { stage: ShutdownStage, time: GameTime },
    /// Read-only topology history for external tooling.
    RequestBackupChain,
    /// Death notification from the discovery service.
    HandleHostDeath { addr: SocketAddr },
    /// A compute node died; relay the payload to every host.
    HandleCellDeath { payload: serde_json::Value },
    /// One-shot initialisation data from the persistence service.
    InitData {
        game_time: GameTime,
        max_host_id: HostId,
    },
    /// Persistence service tells the fleet to start.
    Startup { auto_loaded_entities: bool },
    /// Re-register a host after a coordinator restart.
    RecoverHost(Box<RecoverHostData>),
    /// Stop this coordinator, optionally taking the fleet down with it.
    Shutdown { shutdown_others: bool },
}

/// Everything needed to rebuild one host record during recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverHostData {
    pub addr: SocketAddr,
    pub external_addr: SocketAddr,
    pub id: HostId,
    pub game_time: GameTime,
    pub backup: BackupHash,
    pub pending_backup: BackupHash,
    pub shared_host_data: Vec<(String, String)>,
    pub shared_fleet_data: Vec<(String, String)>,
    pub globals: Vec<(String, EntityRef)>,
}

impl Request {
    pub fn kind(&self) -> MessageKind {
        match self {
            Request::Add { .. } => MessageKind::Add,
            Request::Del { .. } => MessageKind::Del,
            Request::InformOfLoad { .. } => MessageKind::InformOfLoad,
            Request::CreateEntity { .. } => MessageKind::CreateEntity,
            Request::Retire => MessageKind::Retire,
            Request::UseNewBackupHash { .. } => MessageKind::UseNewBackupHash,
            Request::RegisterGlobal { .. } => MessageKind::RegisterGlobal,
            Request::DeregisterGlobal { .. } => MessageKind::DeregisterGlobal,
            Request::SetSharedData { .. } => MessageKind::SetSharedData,
            Request::DelSharedData { .. } => MessageKind::DelSharedData,
            Request::ControlledShutdown { .. } => MessageKind::ControlledShutdown,
            Request::RequestBackupChain => MessageKind::RequestBackupChain,
            Request::HandleHostDeath { .. } => MessageKind::HandleHostDeath,
            Request::HandleCellDeath { .. } => MessageKind::HandleCellDeath,
            Request::InitData { .. } => MessageKind::InitData,
            Request::Startup { .. } => MessageKind::Startup,
            Request::RecoverHost(_) => MessageKind::RecoverHost,
            Request::Shutdown { .. } => MessageKind::Shutdown,
        }
    }
}

/// Stable message-kind table; the dispatch map is keyed by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Add,
    Del,
    InformOfLoad,
    CreateEntity,
    Retire,
    UseNewBackupHash,
    RegisterGlobal,
    DeregisterGlobal,
    SetSharedData,
    DelSharedData,
    ControlledShutdown,
    RequestBackupChain,
    HandleHostDeath,
    HandleCellDeath,
    InitData,
    Startup,
    RecoverHost,
    Shutdown,
}

pub const ALL_MESSAGE_KINDS: &[MessageKind] = &[
    MessageKind::Add,
    MessageKind::Del,
    MessageKind::InformOfLoad,
    MessageKind::CreateEntity,
    MessageKind::Retire,
    MessageKind::UseNewBackupHash,
    MessageKind::RegisterGlobal,
    MessageKind::DeregisterGlobal,
    MessageKind::SetSharedData,
    MessageKind::DelSharedData,
    MessageKind::ControlledShutdown,
    MessageKind::RequestBackupChain,
    MessageKind::HandleHostDeath,
    MessageKind::HandleCellDeath,
    MessageKind::InitData,
    MessageKind::Startup,
    MessageKind::RecoverHost,
    MessageKind::Shutdown,
];

/// Replies to request/reply methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    Ack,
    AddAck {
        id: HostId,
        game_time: GameTime,
        is_ready: bool,
        globals: Vec<(String, EntityRef)>,
        shared_host_data: Vec<(String, String)>,
        shared_fleet_data: Vec<(String, String)>,
        /// (internal, external) addresses of every other registered host.
        peers: Vec<(SocketAddr, SocketAddr)>,
    },
    CreateEntityAck {
        host_external_addr: SocketAddr,
        entity: EntityRef,
    },
    RegisterGlobalAck { registered: bool },
    BackupChain { chain: BackupHashChain },
    Error { code: ErrorCode, message: String },
}

/// Typed errors surfaced to RPC callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NoHostsAvailable,
    FleetOverloaded,
}

/// Messages the coordinator sends to entity hosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum HostMsg {
    /// A new host joined the fleet.
    HostBirth {
        addr: SocketAddr,
        external_addr: SocketAddr,
    },
    /// Prime this target set; acknowledge with `use_new_backup_hash`.
    SetBackupTargets { targets: BackupHash },
    /// Start accepting backup traffic for `owner`'s entities.
    StartEntityBackup {
        owner: SocketAddr,
        index: u32,
        virtual_size: u32,
        prime: u32,
        initial: bool,
    },
    /// Stop accepting backup traffic for `owner`'s entities.
    StopEntityBackup {
        owner: SocketAddr,
        index: u32,
        virtual_size: u32,
        prime: u32,
    },
    /// A host died; `backup` is its last committed target set, from which
    /// each receiver recovers the entities it was backing up.
    HostDeath {
        addr: SocketAddr,
        backup: BackupHash,
    },
    /// A compute node died; payload is opaque to the coordinator.
    CellDeath { payload: serde_json::Value },
    /// Where this host should send create-anywhere entities.
    SetCreateDestination { addr: SocketAddr },
    AddGlobalEntity { name: String, entity: EntityRef },
    DelGlobalEntity { name: String },
    SetSharedData {
        domain: SharedDomain,
        key: String,
        value: String,
    },
    DelSharedData { domain: SharedDomain, key: String },
    ControlledShutdown { stage: ShutdownStage, time: GameTime },
    /// Begin the irreversible offload sequence.
    StartOffloading,
    /// Fleet start; exactly one host is the bootstrap.
    Startup {
        bootstrap: bool,
        auto_loaded_entities: bool,
    },
    /// Forwarded entity creation; replied with `create_entity_ack`.
    CreateEntity { payload: serde_json::Value },
    /// Immediate stop, outside the controlled protocol.
    Shutdown,
}

/// Messages to the peer coordinator, the persistence service or the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum PeerMsg {
    /// Current best host for placing new entities.
    SetBestHost { addr: SocketAddr },
    HostDeath {
        addr: SocketAddr,
        backup: BackupHash,
    },
    ControlledShutdown { stage: ShutdownStage, time: GameTime },
    SetSharedData {
        domain: SharedDomain,
        key: String,
        value: String,
    },
    DelSharedData { domain: SharedDomain, key: String },
    Startup,
    Shutdown,
}

/// Any outbound message, tagged with its recipient class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Outbound {
    Host(HostMsg),
    Peer(PeerMsg),
}
