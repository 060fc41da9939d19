//! Endpoint handles and the connection-management handshake engine.
//!
//! An [`Endpoint`] owns exactly one connection identifier together with its
//! notification channel. The handshake is driven by blocking event waits:
//! every operation that consumes an event acknowledges it before the next
//! wait, whatever the outcome, because the channel serializes delivery and
//! an unacknowledged event stalls it.
//!
//! One logical thread drives one endpoint; distinct endpoints (a listener
//! and its accepted connections, say) are independent and may live on
//! separate threads.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use crate::cm::{self, CmEventKind, CmOps, PortSpace};
use crate::mr;
use crate::verbs::{AccessFlags, ConnParam, QpCapability, SendFlags, WorkCompletion};
use crate::{Error, Result};

/// Timeout passed to address resolution when the caller has no opinion.
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_millis(100);
/// Timeout passed to route resolution during `connect`.
pub const DEFAULT_ROUTE_TIMEOUT: Duration = Duration::from_millis(100);

/// Observable lifecycle states of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Freshly created; no address resolved, nothing bound.
    Unresolved,
    /// Address resolution succeeded; a queue pair may be attached.
    AddrResolved,
    /// Route resolution succeeded; passed through inside `connect`.
    RouteResolved,
    /// Bound and listening for connection requests.
    Listening,
    /// Built from an inherited connection request, not yet accepted.
    Incoming,
    /// Handshake finished; the data path is open.
    Connected,
    /// A handshake step failed. Terminal: build a fresh endpoint to retry.
    Failed,
    /// Connection torn down by `disconnect`. Terminal.
    Disconnected,
    /// Ownership was transferred away; the handle is inert.
    Invalid,
}

/// One end of a reliable RDMA connection.
///
/// The handle is non-duplicable: two live handles never reference the same
/// identifier. Ownership can be moved to a new handle with
/// [`Endpoint::take_ownership`], after which the source refuses every
/// operation with `InvalidState` and its destructor releases nothing.
pub struct Endpoint<T: CmOps> {
    inner: Option<Inner<T>>,
}

struct Inner<T: CmOps> {
    ops: Arc<T>,
    id: cm::CmId,
    channel: cm::EventChannel,
    state: EndpointState,
    bound: bool,
    pd: Option<Arc<mr::ProtectionDomain<T>>>,
    qp: Option<cm::QueuePair>,
    cap: Option<QpCapability>,
    // regions registered on the fly by posts that supplied none
    mrs: Vec<mr::MemoryRegion<T>>,
    peer_private_data: Option<Vec<u8>>,
}

impl<T: CmOps> Endpoint<T> {
    /// Allocates a notification channel and a connection identifier.
    ///
    /// Construction is all-or-nothing: if the identifier cannot be
    /// allocated, the channel is released before the error is returned.
    pub fn create(ops: Arc<T>, port_space: PortSpace) -> Result<Self> {
        let channel = ops.create_event_channel()?;
        let id = match ops.create_id(channel, port_space) {
            Ok(id) => id,
            Err(e) => {
                if let Err(e2) = ops.destroy_event_channel(channel) {
                    log::warn!("destroying event channel after failed create: {}", e2);
                }
                return Err(e);
            }
        };
        log::debug!("create, id: {:?}, channel: {:?}", id, channel);
        Ok(Endpoint {
            inner: Some(Inner {
                ops,
                id,
                channel,
                state: EndpointState::Unresolved,
                bound: false,
                pd: None,
                qp: None,
                cap: None,
                mrs: Vec::new(),
                peer_private_data: None,
            }),
        })
    }

    /// Builds an endpoint around an identifier inherited from a connection
    /// request: a fresh channel is created and the identifier migrated onto
    /// it, so no handle is ever observably incomplete. Takes ownership of
    /// the identifier; on failure it is destroyed along with the channel.
    fn from_incoming(ops: Arc<T>, id: cm::CmId) -> Result<Self> {
        let channel = match ops.create_event_channel() {
            Ok(c) => c,
            Err(e) => {
                if let Err(e2) = ops.destroy_id(id) {
                    log::warn!("destroying inherited identifier: {}", e2);
                }
                return Err(e);
            }
        };
        if let Err(e) = ops.migrate_id(id, channel) {
            if let Err(e2) = ops.destroy_event_channel(channel) {
                log::warn!("destroying event channel: {}", e2);
            }
            if let Err(e2) = ops.destroy_id(id) {
                log::warn!("destroying inherited identifier: {}", e2);
            }
            return Err(e);
        }
        Ok(Endpoint {
            inner: Some(Inner {
                ops,
                id,
                channel,
                state: EndpointState::Incoming,
                bound: false,
                pd: None,
                qp: None,
                cap: None,
                mrs: Vec::new(),
                peer_private_data: None,
            }),
        })
    }

    /// Moves ownership of the underlying resources into a new handle. The
    /// source becomes inert: every further operation fails with
    /// `InvalidState` and its destructor is a no-op.
    pub fn take_ownership(&mut self) -> Result<Endpoint<T>> {
        match self.inner.take() {
            Some(inner) => Ok(Endpoint { inner: Some(inner) }),
            None => Err(Error::InvalidState("endpoint handle was already moved")),
        }
    }

    pub fn state(&self) -> EndpointState {
        self.inner
            .as_ref()
            .map_or(EndpointState::Invalid, |i| i.state)
    }

    /// Allocates a protection domain scoped to the identifier's device and
    /// creates the queue pair with the given capacities. Requires the
    /// identifier to have a resolved device context: after address
    /// resolution on the active side, or on an inherited request on the
    /// passive side. Capacities are fixed for the queue pair's lifetime.
    pub fn attach_queue_pair(&mut self, cap: QpCapability) -> Result<()> {
        let inner = self.inner_mut()?;
        if inner.qp.is_some() {
            return Err(Error::InvalidState("a queue pair is already attached"));
        }
        match inner.state {
            EndpointState::AddrResolved | EndpointState::Incoming => {}
            _ => {
                return Err(Error::InvalidState(
                    "queue pair attachment requires a resolved device context",
                ))
            }
        }
        log::debug!("attach_queue_pair, id: {:?}, cap: {:?}", inner.id, cap);
        let raw_pd = inner.ops.alloc_pd(inner.id)?;
        let pd = Arc::new(mr::ProtectionDomain::new(inner.ops.clone(), raw_pd));
        // if the queue pair is refused, dropping the guard releases the
        // fresh domain and the endpoint is left exactly as it was
        let qp = inner.ops.create_qp(inner.id, raw_pd, &cap)?;
        inner.pd = Some(pd);
        inner.qp = Some(qp);
        inner.cap = Some(cap);
        Ok(())
    }

    /// Requests address resolution and blocks for exactly one event. Only
    /// `AddrResolved` advances the state machine; any other event is
    /// acknowledged and surfaced as `ResolutionFailed`, leaving the
    /// endpoint in the terminal `Failed` state.
    pub fn resolve<A: ToSocketAddrs>(&mut self, addr: A, timeout: Duration) -> Result<()> {
        let dst = first_addr(addr)?;
        let inner = self.inner_mut()?;
        if inner.state != EndpointState::Unresolved || inner.bound {
            return Err(Error::InvalidState("resolve requires a fresh, unbound endpoint"));
        }
        log::debug!("resolve, id: {:?}, dst: {}, timeout: {:?}", inner.id, dst, timeout);
        let ops = inner.ops.clone();
        if let Err(e) = ops.resolve_addr(inner.id, dst, timeout) {
            inner.state = EndpointState::Failed;
            return Err(Error::ResolutionFailed(e.to_string()));
        }
        match consume_event(&*ops, inner.channel, CmEventKind::AddrResolved) {
            Ok(()) => {
                inner.state = EndpointState::AddrResolved;
                Ok(())
            }
            Err(err) => {
                inner.state = EndpointState::Failed;
                Err(Error::ResolutionFailed(match err {
                    WaitError::Transport(e) => e.to_string(),
                    WaitError::Mismatch { got } => format!("unexpected {:?} event", got),
                    WaitError::Status(s) => format!("completed with status {}", s),
                }))
            }
        }
    }

    /// Resolves the route, issues the connect request and blocks for the
    /// establishment confirmation, acknowledging each event as it is
    /// consumed. Requires a resolved address and an attached queue pair.
    /// Any unexpected event or non-success status is fatal for the attempt.
    pub fn connect(&mut self, param: &ConnParam, route_timeout: Duration) -> Result<()> {
        let inner = self.inner_mut()?;
        if inner.state != EndpointState::AddrResolved {
            return Err(Error::InvalidState("connect requires a resolved address"));
        }
        if inner.qp.is_none() {
            return Err(Error::InvalidState("connect requires an attached queue pair"));
        }
        log::debug!("connect, id: {:?}, param: {:?}", inner.id, param);
        let ops = inner.ops.clone();
        let id = inner.id;
        let channel = inner.channel;

        if let Err(e) = ops.resolve_route(id, route_timeout) {
            inner.state = EndpointState::Failed;
            return Err(Error::ConnectFailed(e.to_string()));
        }
        match consume_event(&*ops, channel, CmEventKind::RouteResolved) {
            Ok(()) => inner.state = EndpointState::RouteResolved,
            Err(e) => {
                inner.state = EndpointState::Failed;
                return Err(connect_failure("route resolution", e));
            }
        }

        if let Err(e) = ops.connect(id, param) {
            inner.state = EndpointState::Failed;
            return Err(Error::ConnectFailed(e.to_string()));
        }
        match consume_event(&*ops, channel, CmEventKind::Established) {
            Ok(()) => {
                inner.state = EndpointState::Connected;
                Ok(())
            }
            Err(e) => {
                inner.state = EndpointState::Failed;
                Err(connect_failure("establishment", e))
            }
        }
    }

    /// Binds the identifier to a local address.
    pub fn bind<A: ToSocketAddrs>(&mut self, addr: A) -> Result<()> {
        let local = first_addr(addr)?;
        let inner = self.inner_mut()?;
        if inner.state != EndpointState::Unresolved || inner.bound {
            return Err(Error::InvalidState("bind requires a fresh endpoint"));
        }
        log::debug!("bind, id: {:?}, addr: {}", inner.id, local);
        inner.ops.bind_addr(inner.id, local)?;
        inner.bound = true;
        Ok(())
    }

    /// Starts listening with the given backlog of pending requests.
    pub fn listen(&mut self, backlog: i32) -> Result<()> {
        let inner = self.inner_mut()?;
        if !inner.bound || inner.state != EndpointState::Unresolved {
            return Err(Error::InvalidState("listen requires a bound endpoint"));
        }
        log::debug!("listen, id: {:?}, backlog: {}", inner.id, backlog);
        inner.ops.listen(inner.id, backlog)?;
        inner.state = EndpointState::Listening;
        Ok(())
    }

    /// Blocks for one connection request and completes the passive side of
    /// the handshake: a new endpoint is built around the inherited
    /// identifier (on a fresh channel), a queue pair with `cap` is attached
    /// to it, the accept reply carrying `param` is issued, the request
    /// event is acknowledged, and the establishment confirmation is awaited
    /// and acknowledged. Returns the new, connected endpoint; the listener
    /// is untouched and keeps accepting.
    ///
    /// Any event other than a connection request is acknowledged and
    /// reported as `UnexpectedEvent`.
    pub fn accept(&mut self, cap: QpCapability, param: &ConnParam) -> Result<Endpoint<T>> {
        let (ops, channel) = {
            let inner = self.inner()?;
            if inner.state != EndpointState::Listening {
                return Err(Error::InvalidState("accept requires a listening endpoint"));
            }
            (inner.ops.clone(), inner.channel)
        };

        let mut event = ops.get_cm_event(channel)?;
        if event.kind() != CmEventKind::ConnectRequest {
            let got = event.kind();
            if let Err(e) = event.ack() {
                log::warn!("acknowledging event: {}", e);
            }
            return Err(Error::UnexpectedEvent {
                expected: CmEventKind::ConnectRequest,
                got,
            });
        }
        if event.status() != 0 {
            let status = event.status();
            if let Err(e) = event.ack() {
                log::warn!("acknowledging event: {}", e);
            }
            return Err(Error::ConnectFailed(format!(
                "connection request carried status {}",
                status
            )));
        }
        let new_id = match event.id() {
            Some(id) => id,
            // dropping the event acknowledges it
            None => {
                return Err(Error::InvalidState(
                    "connection request event carried no identifier",
                ))
            }
        };
        let peer_private = event.take_private_data();
        log::debug!("accept, inherited id: {:?}", new_id);

        let mut accepted = Endpoint::from_incoming(ops.clone(), new_id)?;
        accepted.attach_queue_pair(cap)?;
        if let Err(e) = ops.accept(new_id, param) {
            return Err(Error::ConnectFailed(e.to_string()));
        }
        if let Err(e) = event.ack() {
            log::warn!("acknowledging connection request: {}", e);
        }
        drop(event);

        let accepted_channel = accepted.inner()?.channel;
        match consume_event(&*ops, accepted_channel, CmEventKind::Established) {
            Ok(()) => {
                let ai = accepted.inner_mut()?;
                ai.state = EndpointState::Connected;
                ai.peer_private_data = peer_private;
                Ok(accepted)
            }
            Err(e) => Err(connect_failure("accept confirmation", e)),
        }
    }

    /// Registers a buffer with the endpoint's protection domain. Supplying
    /// the returned region to later posts avoids a fresh registration per
    /// post; registering the same live buffer again is permitted but yields
    /// an independent (and redundant) registration.
    pub fn register(&self, buf: &[u8], access: AccessFlags) -> Result<mr::MemoryRegion<T>> {
        let inner = self.inner()?;
        let pd = inner
            .pd
            .clone()
            .ok_or(Error::InvalidState("registration requires an attached queue pair"))?;
        mr::MemoryRegion::register(inner.ops.clone(), pd, buf.as_ptr(), buf.len(), access)
    }

    /// Posts a receive work request for `buf`. If no region is supplied the
    /// buffer is registered on the fly and the registration is kept until
    /// the endpoint is torn down. The correlation id defaults to the buffer
    /// address. Receives may be posted as soon as a queue pair is attached,
    /// before the connection is established.
    ///
    /// # Safety
    ///
    /// `buf` must stay valid and unmoved until the matching completion has
    /// been retrieved; the fabric writes into it asynchronously.
    pub unsafe fn post_recv(
        &mut self,
        buf: &mut [u8],
        region: Option<&mr::MemoryRegion<T>>,
        wr_id: Option<u64>,
    ) -> Result<()> {
        let inner = self.inner_mut()?;
        match inner.state {
            EndpointState::AddrResolved
            | EndpointState::RouteResolved
            | EndpointState::Incoming
            | EndpointState::Connected => {}
            _ => return Err(Error::InvalidState("post_recv requires an attached queue pair")),
        }
        if inner.qp.is_none() {
            return Err(Error::InvalidState("post_recv requires an attached queue pair"));
        }
        let raw_mr = match region {
            Some(r) => r.raw(),
            None => inner.register_on_demand(
                buf.as_ptr(),
                buf.len(),
                AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE,
            )?,
        };
        let wr_id = wr_id.unwrap_or(buf.as_ptr() as u64);
        inner
            .ops
            .post_recv(inner.id, wr_id, buf.as_mut_ptr(), buf.len(), raw_mr)
    }

    /// Posts a send work request for `buf`. Requires an established
    /// connection. Payloads no larger than the queue pair's inline
    /// threshold are posted inline. The correlation id defaults to the
    /// buffer address.
    ///
    /// # Safety
    ///
    /// `buf` must stay valid and unmoved until the matching completion has
    /// been retrieved from the send queue.
    pub unsafe fn post_send(
        &mut self,
        buf: &[u8],
        region: Option<&mr::MemoryRegion<T>>,
        wr_id: Option<u64>,
    ) -> Result<()> {
        let inner = self.inner_mut()?;
        if inner.state != EndpointState::Connected {
            return Err(Error::InvalidState("post_send requires a connected endpoint"));
        }
        let cap = inner
            .cap
            .ok_or(Error::InvalidState("post_send requires an attached queue pair"))?;
        let raw_mr = match region {
            Some(r) => r.raw(),
            None => inner.register_on_demand(
                buf.as_ptr(),
                buf.len(),
                AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE,
            )?,
        };
        let wr_id = wr_id.unwrap_or(buf.as_ptr() as u64);
        let mut flags = SendFlags::SIGNALED;
        if buf.len() <= cap.max_inline_data as usize {
            flags |= SendFlags::INLINE;
        }
        inner
            .ops
            .post_send(inner.id, wr_id, buf.as_ptr(), buf.len(), raw_mr, flags)
    }

    /// Blocks until one completion is available on the send queue.
    ///
    /// The wait is unbounded; no timeout variant exists at this layer.
    /// Callers needing cancellable waits must build them on top.
    pub fn wait_send_completion(&mut self) -> Result<WorkCompletion> {
        let inner = self.inner()?;
        if inner.qp.is_none() {
            return Err(Error::InvalidState("no queue pair attached"));
        }
        inner.ops.get_send_comp(inner.id)
    }

    /// Blocks until one completion is available on the receive queue.
    ///
    /// The wait is unbounded; no timeout variant exists at this layer.
    pub fn wait_recv_completion(&mut self) -> Result<WorkCompletion> {
        let inner = self.inner()?;
        if inner.qp.is_none() {
            return Err(Error::InvalidState("no queue pair attached"));
        }
        inner.ops.get_recv_comp(inner.id)
    }

    /// Tears the connection down. Terminal: the endpoint cannot be
    /// reconnected afterwards.
    pub fn disconnect(&mut self) -> Result<()> {
        let inner = self.inner_mut()?;
        if inner.state != EndpointState::Connected {
            return Err(Error::InvalidState("disconnect requires a connected endpoint"));
        }
        log::debug!("disconnect, id: {:?}", inner.id);
        inner.ops.disconnect(inner.id)?;
        inner.state = EndpointState::Disconnected;
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let inner = self.inner()?;
        inner.ops.local_addr(inner.id)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        let inner = self.inner()?;
        inner.ops.peer_addr(inner.id)
    }

    /// Private payload the peer attached to its connection request, if any.
    pub fn peer_private_data(&self) -> Option<&[u8]> {
        self.inner
            .as_ref()
            .and_then(|i| i.peer_private_data.as_deref())
    }

    fn inner(&self) -> Result<&Inner<T>> {
        self.inner
            .as_ref()
            .ok_or(Error::InvalidState("endpoint handle was moved"))
    }

    fn inner_mut(&mut self) -> Result<&mut Inner<T>> {
        self.inner
            .as_mut()
            .ok_or(Error::InvalidState("endpoint handle was moved"))
    }
}

impl<T: CmOps> Inner<T> {
    fn register_on_demand(
        &mut self,
        addr: *const u8,
        len: usize,
        access: AccessFlags,
    ) -> Result<cm::MemoryRegion> {
        let pd = self
            .pd
            .clone()
            .ok_or(Error::InvalidState("registration requires an attached queue pair"))?;
        let region = mr::MemoryRegion::register(self.ops.clone(), pd, addr, len, access)?;
        let raw = region.raw();
        self.mrs.push(region);
        Ok(raw)
    }

    /// Release order matters: queue pair, then memory regions, then the
    /// protection domain, then the identifier, then the channel.
    fn teardown(&mut self) {
        if self.state == EndpointState::Connected {
            if let Err(e) = self.ops.disconnect(self.id) {
                log::debug!("disconnect on drop: {}", e);
            }
        }
        if let Some(qp) = self.qp.take() {
            if let Err(e) = self.ops.destroy_qp(self.id, qp) {
                log::warn!("destroying queue pair: {}", e);
            }
        }
        self.mrs.clear();
        // deallocated here unless a caller-held region still references it
        self.pd = None;
        if let Err(e) = self.ops.destroy_id(self.id) {
            log::warn!("destroying connection identifier: {}", e);
        }
        if let Err(e) = self.ops.destroy_event_channel(self.channel) {
            log::warn!("destroying event channel: {}", e);
        }
    }
}

impl<T: CmOps> Drop for Endpoint<T> {
    fn drop(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            inner.teardown();
        }
    }
}

enum WaitError {
    Transport(Error),
    Mismatch { got: CmEventKind },
    Status(i32),
}

/// Blocks for one event on `channel`, acknowledges it whatever it turned
/// out to be, and reports whether it was the expected kind with a success
/// status.
fn consume_event<T: CmOps>(
    ops: &T,
    channel: cm::EventChannel,
    expected: CmEventKind,
) -> std::result::Result<(), WaitError> {
    let mut event = match ops.get_cm_event(channel) {
        Ok(ev) => ev,
        Err(e) => return Err(WaitError::Transport(e)),
    };
    let kind = event.kind();
    let status = event.status();
    if let Err(e) = event.ack() {
        log::warn!("acknowledging {:?} event: {}", kind, e);
    }
    if kind != expected {
        return Err(WaitError::Mismatch { got: kind });
    }
    if status != 0 {
        return Err(WaitError::Status(status));
    }
    Ok(())
}

fn connect_failure(stage: &str, err: WaitError) -> Error {
    match err {
        WaitError::Transport(e) => Error::ConnectFailed(format!("{}: {}", stage, e)),
        WaitError::Mismatch { got } => {
            Error::ConnectFailed(format!("{}: unexpected {:?} event", stage, got))
        }
        WaitError::Status(s) => Error::ConnectFailed(format!("{}: status {}", stage, s)),
    }
}

fn first_addr<A: ToSocketAddrs>(addr: A) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .map_err(|e| Error::ResolutionFailed(e.to_string()))?
        .next()
        .ok_or_else(|| Error::ResolutionFailed("no usable socket address".to_string()))
}
