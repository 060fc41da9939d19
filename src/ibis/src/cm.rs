//! The connection-manager capability contract.
//!
//! Everything the endpoint layer needs from the underlying fabric (channel
//! and identifier management, the handshake verbs, resource allocation, work
//! posting and completion retrieval) is expressed as the [`CmOps`] trait.
//! Resources cross the boundary as opaque handles; the provider owns the
//! actual kernel or software objects behind them.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::verbs::{AccessFlags, ConnParam, QpCapability, SendFlags, WorkCompletion};
use crate::Result;

/// Opaque provider-scoped resource identifier.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CmId(pub Handle);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventChannel(pub Handle);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtectionDomain(pub Handle);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueuePair(pub Handle);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRegion(pub Handle);

/// Port space a connection identifier is created in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpace {
    Ipoib,
    Tcp,
    Udp,
    Ib,
}

/// Kind of a connection-management event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEventKind {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
}

/// Token identifying one delivered event for acknowledgment bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventToken(pub u64);

/// One event consumed from a notification channel.
///
/// Every event must be acknowledged exactly once: the channel withholds the
/// next event until the previous one is acked, and a second [`CmEvent::ack`]
/// fails with `InvalidState`. Dropping an unacknowledged event performs a
/// best-effort acknowledgment so an early error return cannot stall the
/// channel.
pub struct CmEvent<'a, T: CmOps + ?Sized> {
    ops: &'a T,
    kind: CmEventKind,
    status: i32,
    id: Option<CmId>,
    private_data: Option<Vec<u8>>,
    token: EventToken,
    acked: bool,
}

impl<'a, T: CmOps + ?Sized> CmEvent<'a, T> {
    /// Assembles a delivered event. Called by providers only.
    pub fn new(
        ops: &'a T,
        kind: CmEventKind,
        status: i32,
        id: Option<CmId>,
        private_data: Option<Vec<u8>>,
        token: EventToken,
    ) -> Self {
        CmEvent {
            ops,
            kind,
            status,
            id,
            private_data,
            token,
            acked: false,
        }
    }

    #[inline]
    pub fn kind(&self) -> CmEventKind {
        self.kind
    }

    #[inline]
    pub fn status(&self) -> i32 {
        self.status
    }

    /// The identifier the event refers to. For `ConnectRequest` this is the
    /// freshly created identifier of the incoming connection.
    #[inline]
    pub fn id(&self) -> Option<CmId> {
        self.id
    }

    #[inline]
    pub fn token(&self) -> EventToken {
        self.token
    }

    /// Takes the private payload carried by a connection request, if any.
    pub fn take_private_data(&mut self) -> Option<Vec<u8>> {
        self.private_data.take()
    }

    /// Acknowledges the event, releasing the channel for the next one.
    /// Acknowledging twice fails with `InvalidState`.
    pub fn ack(&mut self) -> Result<()> {
        if self.acked {
            return Err(crate::Error::InvalidState("event already acknowledged"));
        }
        self.ops.ack_cm_event(self.token)?;
        self.acked = true;
        Ok(())
    }
}

impl<'a, T: CmOps + ?Sized> Drop for CmEvent<'a, T> {
    fn drop(&mut self) {
        if !self.acked {
            if let Err(e) = self.ops.ack_cm_event(self.token) {
                log::debug!("acknowledging event on drop: {}", e);
            }
        }
    }
}

impl<'a, T: CmOps + ?Sized> fmt::Debug for CmEvent<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmEvent")
            .field("kind", &self.kind)
            .field("status", &self.status)
            .field("id", &self.id)
            .field("acked", &self.acked)
            .finish()
    }
}

/// The transport capability set consumed by the endpoint layer.
///
/// A provider implements these operations over the actual fabric; the
/// endpoint layer holds the lifecycle and ordering rules. All waits are
/// blocking: `get_cm_event` and the completion retrievals suspend the
/// calling thread until the fabric produces something.
pub trait CmOps: Send + Sync {
    fn create_event_channel(&self) -> Result<EventChannel>;
    fn destroy_event_channel(&self, channel: EventChannel) -> Result<()>;

    fn create_id(&self, channel: EventChannel, port_space: PortSpace) -> Result<CmId>;
    fn destroy_id(&self, id: CmId) -> Result<()>;
    /// Moves an identifier onto another notification channel. Used when an
    /// inherited identifier leaves its listener's channel.
    fn migrate_id(&self, id: CmId, channel: EventChannel) -> Result<()>;

    fn bind_addr(&self, id: CmId, addr: SocketAddr) -> Result<()>;
    fn listen(&self, id: CmId, backlog: i32) -> Result<()>;
    fn resolve_addr(&self, id: CmId, dst: SocketAddr, timeout: Duration) -> Result<()>;
    fn resolve_route(&self, id: CmId, timeout: Duration) -> Result<()>;
    fn connect(&self, id: CmId, param: &ConnParam) -> Result<()>;
    fn accept(&self, id: CmId, param: &ConnParam) -> Result<()>;
    fn disconnect(&self, id: CmId) -> Result<()>;

    /// Blocks until the channel delivers its next event. The previous event
    /// must have been acknowledged; the channel serializes delivery.
    fn get_cm_event(&self, channel: EventChannel) -> Result<CmEvent<'_, Self>>
    where
        Self: Sized;
    fn ack_cm_event(&self, token: EventToken) -> Result<()>;

    fn alloc_pd(&self, id: CmId) -> Result<ProtectionDomain>;
    fn dealloc_pd(&self, pd: ProtectionDomain) -> Result<()>;

    fn create_qp(&self, id: CmId, pd: ProtectionDomain, cap: &QpCapability) -> Result<QueuePair>;
    fn destroy_qp(&self, id: CmId, qp: QueuePair) -> Result<()>;

    fn reg_mr(
        &self,
        pd: ProtectionDomain,
        addr: *const u8,
        len: usize,
        access: AccessFlags,
    ) -> Result<MemoryRegion>;
    fn dereg_mr(&self, mr: MemoryRegion) -> Result<()>;

    /// # Safety
    ///
    /// The buffer behind `addr` must stay valid and unmoved until a work
    /// completion for `wr_id` has been retrieved from the send queue.
    unsafe fn post_send(
        &self,
        id: CmId,
        wr_id: u64,
        addr: *const u8,
        len: usize,
        mr: MemoryRegion,
        flags: SendFlags,
    ) -> Result<()>;

    /// # Safety
    ///
    /// The buffer behind `addr` must stay valid and unmoved until a work
    /// completion for `wr_id` has been retrieved from the receive queue; the
    /// fabric writes into it asynchronously.
    unsafe fn post_recv(
        &self,
        id: CmId,
        wr_id: u64,
        addr: *mut u8,
        len: usize,
        mr: MemoryRegion,
    ) -> Result<()>;

    /// Blocks until one completion is available on the send queue.
    fn get_send_comp(&self, id: CmId) -> Result<WorkCompletion>;
    /// Blocks until one completion is available on the receive queue.
    fn get_recv_comp(&self, id: CmId) -> Result<WorkCompletion>;

    fn local_addr(&self, id: CmId) -> Result<SocketAddr>;
    fn peer_addr(&self, id: CmId) -> Result<SocketAddr>;
}
