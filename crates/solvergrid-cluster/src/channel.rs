//! The group communication seam.
//!
//! A `ClusterChannel` is one node's endpoint in a named group. It exposes
//! the current membership view and point-to-point / broadcast invocation of
//! named services. Payloads cross the channel as bytes; the typed helpers
//! at the bottom of this module take care of JSON encoding.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{ClusterError, ClusterResult};

/// Identity of a member in the group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A membership view. Members are ordered by join time, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    pub id: u64,
    pub members: Vec<Address>,
}

impl View {
    /// The oldest member coordinates the view.
    pub fn coordinator(&self) -> Option<&Address> {
        self.members.first()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.members.iter().any(|m| m == address)
    }

    pub fn is_coordinator(&self, address: &Address) -> bool {
        self.coordinator() == Some(address)
    }
}

/// How many replies a broadcast waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// Return as soon as one member answered successfully.
    FirstResponse,
    /// Wait for every member (or its timeout).
    AllResponses,
}

/// Handler for incoming requests on a named service.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, from: Address, payload: Vec<u8>) -> ClusterResult<Vec<u8>>;
}

/// One node's endpoint in the group.
#[async_trait]
pub trait ClusterChannel: Send + Sync {
    fn local_address(&self) -> &Address;

    /// Current membership view.
    fn view(&self) -> View;

    /// Receiver updated on every view change.
    fn subscribe_view(&self) -> watch::Receiver<View>;

    /// Install (or replace) the handler for a service.
    fn register(&self, service: &str, handler: Arc<dyn RpcHandler>);

    /// Whether this endpoint is still part of the view.
    fn is_member(&self) -> bool {
        self.view().contains(self.local_address())
    }

    /// Point-to-point call with a bounded timeout.
    async fn call(
        &self,
        target: &Address,
        service: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> ClusterResult<Vec<u8>>;

    /// Invoke a service on every member of the current view, including self.
    async fn broadcast(
        &self,
        service: &str,
        payload: Vec<u8>,
        mode: CallMode,
        timeout: Duration,
    ) -> Vec<(Address, ClusterResult<Vec<u8>>)>;

    /// Leave the group gracefully.
    async fn leave(&self);
}

// ── Typed helpers ──────────────────────────────────────────────────

pub fn encode<T: Serialize>(value: &T) -> ClusterResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> ClusterResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Call a service with a JSON-encoded request and decode its reply.
pub async fn call_typed<Req, Resp>(
    channel: &dyn ClusterChannel,
    target: &Address,
    service: &str,
    request: &Req,
    timeout: Duration,
) -> ClusterResult<Resp>
where
    Req: Serialize + Sync,
    Resp: DeserializeOwned,
{
    let payload = encode(request)?;
    let reply = channel.call(target, service, payload, timeout).await?;
    decode(&reply)
}

/// Broadcast a JSON-encoded request and decode each member's reply.
pub async fn broadcast_typed<Req, Resp>(
    channel: &dyn ClusterChannel,
    service: &str,
    request: &Req,
    mode: CallMode,
    timeout: Duration,
) -> ClusterResult<Vec<(Address, ClusterResult<Resp>)>>
where
    Req: Serialize + Sync,
    Resp: DeserializeOwned,
{
    let payload = encode(request)?;
    let replies = channel.broadcast(service, payload, mode, timeout).await;
    Ok(replies
        .into_iter()
        .map(|(address, reply)| (address, reply.and_then(|bytes| decode(&bytes))))
        .collect())
}
