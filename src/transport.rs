//! Message transport
//!
//! The coordinator never blocks on the network: fire-and-forget sends and
//! request/reply exchanges are handed to a [`Transport`], which does its I/O
//! on its own tasks and posts replies back into the event queue as
//! [`Event::Reply`]. Handlers therefore run to completion without yielding,
//! which is what makes the lock-free single-owner state model sound.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

use crate::common::{Error, Result};
use crate::coordinator::rpc::{Outbound, Reply};
use crate::coordinator::server::Event;

/// Correlates a request with the pending-reply entry registered for it.
pub type ReplyToken = u64;

/// Outbound messaging seam.
///
/// Implementations must not block the caller; they enqueue or spawn and
/// return immediately.
pub trait Transport: Send + Sync {
    /// Fire-and-forget delivery. Failures are logged, never surfaced.
    fn send(&self, to: SocketAddr, msg: Outbound);

    /// Request/reply delivery. The outcome arrives later as
    /// `Event::Reply { token, .. }` on the coordinator's queue.
    fn request(&self, to: SocketAddr, msg: Outbound, token: ReplyToken);

    /// Ask the discovery service on `addr`'s machine to kill the process
    /// bound to `addr`, so a standby can take over the port.
    fn hard_kill(&self, addr: SocketAddr);
}

/// Control port of the per-machine discovery daemon.
const DISCOVERY_PORT: u16 = 20399;

/// JSON-over-HTTP transport. Hosts accept coordinator messages on
/// `POST /msg` (one-way) and `POST /rpc` (request/reply).
pub struct HttpTransport {
    client: reqwest::Client,
    events: UnboundedSender<Event>,
}

impl HttpTransport {
    pub fn new(events: UnboundedSender<Event>, request_timeout: Duration) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("reqwest client");
        Arc::new(Self { client, events })
    }

    async fn post_reply(client: reqwest::Client, to: SocketAddr, msg: Outbound) -> Result<Reply> {
        let url = format!("http://{}/rpc", to);
        let resp = client
            .post(&url)
            .json(&msg)
            .send()
            .await
            .map_err(|e| classify(to, e))?;
        resp.json::<Reply>()
            .await
            .map_err(|e| Error::Transport(format!("bad reply from {}: {}", to, e)))
    }
}

fn classify(to: SocketAddr, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::TransportTimeout(to.to_string())
    } else {
        Error::Transport(format!("{}: {}", to, e))
    }
}

impl Transport for HttpTransport {
    fn send(&self, to: SocketAddr, msg: Outbound) {
        let client = self.client.clone();
        tokio::spawn(async move {
            let url = format!("http://{}/msg", to);
            if let Err(e) = client.post(&url).json(&msg).send().await {
                tracing::warn!("send to {} failed: {}", to, e);
            }
        });
    }

    fn request(&self, to: SocketAddr, msg: Outbound, token: ReplyToken) {
        let client = self.client.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = Self::post_reply(client, to, msg).await;
            // The loop may already be gone during shutdown; nothing to do.
            let _ = events.send(Event::Reply { token, result });
        });
    }

    fn hard_kill(&self, addr: SocketAddr) {
        let client = self.client.clone();
        tokio::spawn(async move {
            let url = format!("http://{}:{}/kill", addr.ip(), DISCOVERY_PORT);
            let body = serde_json::json!({ "port": addr.port() });
            if let Err(e) = client.post(&url).json(&body).send().await {
                tracing::error!("hard kill of {} failed: {}", addr, e);
            }
        });
    }
}

/// In-memory transport for tests: records everything, delivers nothing.
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingTransport {
        sent: Mutex<Vec<(SocketAddr, Outbound)>>,
        requests: Mutex<Vec<(SocketAddr, Outbound, ReplyToken)>>,
        kills: Mutex<Vec<SocketAddr>>,
    }

    impl RecordingTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Drain everything sent fire-and-forget so far.
        pub fn take_sent(&self) -> Vec<(SocketAddr, Outbound)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }

        /// Drain every request issued so far.
        pub fn take_requests(&self) -> Vec<(SocketAddr, Outbound, ReplyToken)> {
            std::mem::take(&mut *self.requests.lock().unwrap())
        }

        pub fn take_kills(&self) -> Vec<SocketAddr> {
            std::mem::take(&mut *self.kills.lock().unwrap())
        }

        /// Fire-and-forget messages delivered to `addr`, without draining.
        pub fn sent_to(&self, addr: SocketAddr) -> Vec<Outbound> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(to, _)| *to == addr)
                .map(|(_, m)| m.clone())
                .collect()
        }
    }

    impl Transport for RecordingTransport {
        fn send(&self, to: SocketAddr, msg: Outbound) {
            self.sent.lock().unwrap().push((to, msg));
        }

        fn request(&self, to: SocketAddr, msg: Outbound, token: ReplyToken) {
            self.requests.lock().unwrap().push((to, msg, token));
        }

        fn hard_kill(&self, addr: SocketAddr) {
            self.kills.lock().unwrap().push(addr);
        }
    }
}
