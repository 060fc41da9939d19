//! An in-process software fabric implementing the [`CmOps`] contract.
//!
//! `SoftFabric` gives reliable-connection semantics over plain process
//! memory: listeners and connectors rendezvous by socket address, handshake
//! events are queued per notification channel and delivered strictly one at
//! a time (the next event is withheld until the previous one has been
//! acknowledged), and posted sends rendezvous with posted receives by
//! copying between the registered buffers. It backs the integration tests
//! and works as a development transport where no RDMA device exists.
//!
//! Every resource lives in one table behind a single mutex; blocking waits
//! (`get_cm_event`, completion retrieval) park on a condition variable.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::ptr;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::cm::{self, CmEvent, CmEventKind, CmOps, EventToken, PortSpace};
use crate::verbs::{AccessFlags, ConnParam, QpCapability, SendFlags, WcStatus, WorkCompletion};
use crate::{Error, Result};

// errno-style statuses carried by error events
const ETIMEDOUT: i32 = 110;
const ECONNREFUSED: i32 = 111;

// completion status codes for failed work requests
const WC_LOC_LEN_ERR: u32 = 1;
const WC_REM_INV_REQ_ERR: u32 = 9;

// capacity limits the software device will admit
const MAX_QUEUE_DEPTH: u32 = 4096;
const MAX_SGE: u32 = 64;
const MAX_INLINE: u32 = 4096;

const EPHEMERAL_BASE: u16 = 49152;

pub struct SoftFabric {
    state: Mutex<FabricState>,
    cond: Condvar,
}

impl Default for SoftFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftFabric {
    pub fn new() -> Self {
        SoftFabric {
            state: Mutex::new(FabricState {
                next_handle: 0,
                next_token: 0,
                next_port: EPHEMERAL_BASE,
                channels: HashMap::new(),
                ids: HashMap::new(),
                pds: HashSet::new(),
                qps: HashMap::new(),
                mrs: HashMap::new(),
                bound: HashMap::new(),
                pending_acks: HashMap::new(),
                unreachable: HashSet::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Marks an address as unroutable: address resolution against it
    /// produces an `AddrError` event instead of `AddrResolved`.
    pub fn set_unreachable(&self, addr: SocketAddr) {
        self.lock().unreachable.insert(addr);
    }

    fn lock(&self) -> MutexGuard<'_, FabricState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, FabricState>) -> MutexGuard<'a, FabricState> {
        self.cond
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }
}

struct FabricState {
    next_handle: u64,
    next_token: u64,
    next_port: u16,
    channels: HashMap<u64, ChannelState>,
    ids: HashMap<u64, IdState>,
    pds: HashSet<u64>,
    qps: HashMap<u64, QpState>,
    mrs: HashMap<u64, MrState>,
    bound: HashMap<SocketAddr, u64>,
    // token -> channel holding the unacknowledged event
    pending_acks: HashMap<u64, u64>,
    unreachable: HashSet<SocketAddr>,
}

struct ChannelState {
    events: VecDeque<PendingEvent>,
    has_unacked: bool,
}

struct PendingEvent {
    kind: CmEventKind,
    status: i32,
    id: Option<cm::CmId>,
    private_data: Option<Vec<u8>>,
}

struct IdState {
    channel: u64,
    local: Option<SocketAddr>,
    dst: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    device_resolved: bool,
    route_resolved: bool,
    listen: Option<ListenState>,
    qp: Option<u64>,
    peer: Option<u64>,
    established: bool,
    parent: Option<u64>,
}

impl IdState {
    fn new(channel: u64) -> Self {
        IdState {
            channel,
            local: None,
            dst: None,
            peer_addr: None,
            device_resolved: false,
            route_resolved: false,
            listen: None,
            qp: None,
            peer: None,
            established: false,
            parent: None,
        }
    }
}

struct ListenState {
    backlog: i32,
    pending: i32,
}

struct QpState {
    pd: u64,
    cap: QpCapability,
    recv_posted: VecDeque<PostedRecv>,
    // sends buffered until the peer posts a matching receive
    inbound: VecDeque<InboundMsg>,
    send_cq: VecDeque<WorkCompletion>,
    recv_cq: VecDeque<WorkCompletion>,
}

struct PostedRecv {
    wr_id: u64,
    addr: usize,
    len: usize,
}

struct InboundMsg {
    sender: u64,
    wr_id: u64,
    bytes: Vec<u8>,
}

struct MrState {
    pd: u64,
    addr: usize,
    len: usize,
    access: AccessFlags,
}

impl FabricState {
    fn alloc_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn alloc_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = if self.next_port == u16::MAX {
            EPHEMERAL_BASE
        } else {
            self.next_port + 1
        };
        port
    }
}

fn unknown_id() -> Error {
    Error::InvalidState("unknown connection identifier")
}

fn push_event(st: &mut FabricState, channel: u64, ev: PendingEvent) {
    // events for a torn-down channel are dropped on the floor
    if let Some(ch) = st.channels.get_mut(&channel) {
        ch.events.push_back(ev);
    }
}

fn validate_region(
    st: &FabricState,
    mr: cm::MemoryRegion,
    pd: u64,
    addr: usize,
    len: usize,
    need: AccessFlags,
) -> Result<()> {
    let m = st
        .mrs
        .get(&mr.0 .0)
        .ok_or(Error::RegistrationFailed("unknown memory region"))?;
    if m.pd != pd {
        return Err(Error::RegistrationFailed(
            "region belongs to a different protection domain",
        ));
    }
    if addr < m.addr || addr + len > m.addr + m.len {
        return Err(Error::RegistrationFailed(
            "work request references memory outside the registered region",
        ));
    }
    if !m.access.contains(need) {
        return Err(Error::RegistrationFailed(
            "region lacks the required access permissions",
        ));
    }
    Ok(())
}

impl CmOps for SoftFabric {
    fn create_event_channel(&self) -> Result<cm::EventChannel> {
        let mut st = self.lock();
        let h = st.alloc_handle();
        st.channels.insert(
            h,
            ChannelState {
                events: VecDeque::new(),
                has_unacked: false,
            },
        );
        Ok(cm::EventChannel(cm::Handle(h)))
    }

    fn destroy_event_channel(&self, channel: cm::EventChannel) -> Result<()> {
        let mut st = self.lock();
        if st.channels.remove(&channel.0 .0).is_none() {
            return Err(Error::InvalidState("unknown event channel"));
        }
        st.pending_acks.retain(|_, ch| *ch != channel.0 .0);
        self.cond.notify_all();
        Ok(())
    }

    fn create_id(&self, channel: cm::EventChannel, port_space: PortSpace) -> Result<cm::CmId> {
        if port_space != PortSpace::Tcp {
            return Err(Error::InvalidState(
                "only the TCP port space is supported",
            ));
        }
        let mut st = self.lock();
        if !st.channels.contains_key(&channel.0 .0) {
            return Err(Error::InvalidState("unknown event channel"));
        }
        let h = st.alloc_handle();
        st.ids.insert(h, IdState::new(channel.0 .0));
        Ok(cm::CmId(cm::Handle(h)))
    }

    fn destroy_id(&self, id: cm::CmId) -> Result<()> {
        let mut st = self.lock();
        let s = st.ids.remove(&id.0 .0).ok_or_else(unknown_id)?;
        if let Some(local) = s.local {
            if st.bound.get(&local) == Some(&id.0 .0) {
                st.bound.remove(&local);
            }
        }
        if let Some(qp) = s.qp {
            st.qps.remove(&qp);
        }
        self.cond.notify_all();
        Ok(())
    }

    fn migrate_id(&self, id: cm::CmId, channel: cm::EventChannel) -> Result<()> {
        let mut st = self.lock();
        if !st.channels.contains_key(&channel.0 .0) {
            return Err(Error::InvalidState("unknown event channel"));
        }
        let s = st.ids.get_mut(&id.0 .0).ok_or_else(unknown_id)?;
        s.channel = channel.0 .0;
        Ok(())
    }

    fn bind_addr(&self, id: cm::CmId, addr: SocketAddr) -> Result<()> {
        let mut st = self.lock();
        if !st.ids.contains_key(&id.0 .0) {
            return Err(unknown_id());
        }
        let assigned = if addr.port() == 0 {
            let port = st.alloc_port();
            SocketAddr::new(addr.ip(), port)
        } else {
            addr
        };
        if st.bound.contains_key(&assigned) {
            return Err(Error::AddressInUse);
        }
        let s = st.ids.get_mut(&id.0 .0).ok_or_else(unknown_id)?;
        if s.local.is_some() {
            return Err(Error::InvalidState("identifier is already bound"));
        }
        s.local = Some(assigned);
        s.device_resolved = true;
        st.bound.insert(assigned, id.0 .0);
        Ok(())
    }

    fn listen(&self, id: cm::CmId, backlog: i32) -> Result<()> {
        let mut st = self.lock();
        let s = st.ids.get_mut(&id.0 .0).ok_or_else(unknown_id)?;
        if s.local.is_none() {
            return Err(Error::InvalidState("listen requires a bound identifier"));
        }
        if s.listen.is_some() {
            return Err(Error::InvalidState("identifier is already listening"));
        }
        s.listen = Some(ListenState {
            backlog,
            pending: 0,
        });
        Ok(())
    }

    fn resolve_addr(&self, id: cm::CmId, dst: SocketAddr, _timeout: Duration) -> Result<()> {
        let mut st = self.lock();
        let reachable = !st.unreachable.contains(&dst);
        let ephemeral = st.alloc_port();
        let s = st.ids.get_mut(&id.0 .0).ok_or_else(unknown_id)?;
        if s.listen.is_some() {
            return Err(Error::InvalidState("identifier is listening"));
        }
        let channel = s.channel;
        let ev = if reachable {
            s.dst = Some(dst);
            s.device_resolved = true;
            if s.local.is_none() {
                s.local = Some(SocketAddr::from(([127, 0, 0, 1], ephemeral)));
            }
            PendingEvent {
                kind: CmEventKind::AddrResolved,
                status: 0,
                id: Some(id),
                private_data: None,
            }
        } else {
            PendingEvent {
                kind: CmEventKind::AddrError,
                status: -ETIMEDOUT,
                id: Some(id),
                private_data: None,
            }
        };
        push_event(&mut st, channel, ev);
        self.cond.notify_all();
        Ok(())
    }

    fn resolve_route(&self, id: cm::CmId, _timeout: Duration) -> Result<()> {
        let mut st = self.lock();
        let s = st.ids.get_mut(&id.0 .0).ok_or_else(unknown_id)?;
        if !s.device_resolved || s.dst.is_none() {
            return Err(Error::InvalidState(
                "route resolution requires a resolved address",
            ));
        }
        s.route_resolved = true;
        let channel = s.channel;
        push_event(
            &mut st,
            channel,
            PendingEvent {
                kind: CmEventKind::RouteResolved,
                status: 0,
                id: Some(id),
                private_data: None,
            },
        );
        self.cond.notify_all();
        Ok(())
    }

    fn connect(&self, id: cm::CmId, param: &ConnParam) -> Result<()> {
        let mut st = self.lock();
        let (client_channel, client_local, dst) = {
            let c = st.ids.get(&id.0 .0).ok_or_else(unknown_id)?;
            if c.qp.is_none() {
                return Err(Error::InvalidState("connect requires a queue pair"));
            }
            if !c.route_resolved {
                return Err(Error::InvalidState("connect requires a resolved route"));
            }
            if c.peer.is_some() || c.established {
                return Err(Error::InvalidState("identifier is already connecting"));
            }
            let dst = c
                .dst
                .ok_or(Error::InvalidState("no destination address resolved"))?;
            (c.channel, c.local, dst)
        };

        let listener = st.bound.get(&dst).copied().and_then(|h| {
            st.ids.get(&h).and_then(|l| {
                l.listen
                    .as_ref()
                    .map(|ls| (h, l.channel, l.local, ls.pending < ls.backlog))
            })
        });
        let (listener_handle, listener_channel, listener_local, has_room) = match listener {
            Some(entry) => entry,
            None => {
                // nobody listening on that address: reject the attempt
                push_event(
                    &mut st,
                    client_channel,
                    PendingEvent {
                        kind: CmEventKind::Rejected,
                        status: -ECONNREFUSED,
                        id: Some(id),
                        private_data: None,
                    },
                );
                self.cond.notify_all();
                return Ok(());
            }
        };
        if !has_room {
            push_event(
                &mut st,
                client_channel,
                PendingEvent {
                    kind: CmEventKind::Rejected,
                    status: -ECONNREFUSED,
                    id: Some(id),
                    private_data: None,
                },
            );
            self.cond.notify_all();
            return Ok(());
        }

        // the incoming side inherits the listener's channel until the
        // identifier is migrated by whoever adopts it
        let sid = st.alloc_handle();
        let mut server = IdState::new(listener_channel);
        server.local = listener_local;
        server.peer_addr = client_local;
        server.device_resolved = true;
        server.peer = Some(id.0 .0);
        server.parent = Some(listener_handle);
        st.ids.insert(sid, server);

        if let Some(c) = st.ids.get_mut(&id.0 .0) {
            c.peer = Some(sid);
            c.peer_addr = Some(dst);
        }
        if let Some(l) = st.ids.get_mut(&listener_handle) {
            if let Some(ls) = &mut l.listen {
                ls.pending += 1;
            }
        }
        push_event(
            &mut st,
            listener_channel,
            PendingEvent {
                kind: CmEventKind::ConnectRequest,
                status: 0,
                id: Some(cm::CmId(cm::Handle(sid))),
                private_data: param.private_data.clone(),
            },
        );
        self.cond.notify_all();
        Ok(())
    }

    fn accept(&self, id: cm::CmId, _param: &ConnParam) -> Result<()> {
        let mut st = self.lock();
        let (server_channel, client_handle, parent) = {
            let s = st.ids.get(&id.0 .0).ok_or_else(unknown_id)?;
            if s.qp.is_none() {
                return Err(Error::InvalidState("accept requires a queue pair"));
            }
            if s.established {
                return Err(Error::InvalidState("connection is already established"));
            }
            let client = s
                .peer
                .ok_or(Error::InvalidState("no pending connection request"))?;
            (s.channel, client, s.parent)
        };
        if let Some(p) = parent {
            if let Some(l) = st.ids.get_mut(&p) {
                if let Some(ls) = &mut l.listen {
                    ls.pending -= 1;
                }
            }
        }
        if let Some(s) = st.ids.get_mut(&id.0 .0) {
            s.established = true;
        }
        let client_channel = match st.ids.get_mut(&client_handle) {
            Some(c) => {
                c.established = true;
                Some(c.channel)
            }
            None => None,
        };
        push_event(
            &mut st,
            server_channel,
            PendingEvent {
                kind: CmEventKind::Established,
                status: 0,
                id: Some(id),
                private_data: None,
            },
        );
        if let Some(cc) = client_channel {
            push_event(
                &mut st,
                cc,
                PendingEvent {
                    kind: CmEventKind::Established,
                    status: 0,
                    id: Some(cm::CmId(cm::Handle(client_handle))),
                    private_data: None,
                },
            );
        }
        self.cond.notify_all();
        Ok(())
    }

    fn disconnect(&self, id: cm::CmId) -> Result<()> {
        let mut st = self.lock();
        let (channel, peer) = {
            let s = st.ids.get_mut(&id.0 .0).ok_or_else(unknown_id)?;
            if !s.established {
                return Err(Error::InvalidState("connection is not established"));
            }
            s.established = false;
            (s.channel, s.peer)
        };
        push_event(
            &mut st,
            channel,
            PendingEvent {
                kind: CmEventKind::Disconnected,
                status: 0,
                id: Some(id),
                private_data: None,
            },
        );
        if let Some(p) = peer {
            let peer_channel = st.ids.get_mut(&p).map(|s| {
                s.established = false;
                s.channel
            });
            if let Some(pc) = peer_channel {
                push_event(
                    &mut st,
                    pc,
                    PendingEvent {
                        kind: CmEventKind::Disconnected,
                        status: 0,
                        id: Some(cm::CmId(cm::Handle(p))),
                        private_data: None,
                    },
                );
            }
        }
        self.cond.notify_all();
        Ok(())
    }

    fn get_cm_event(&self, channel: cm::EventChannel) -> Result<CmEvent<'_, Self>> {
        let mut st = self.lock();
        loop {
            let popped = {
                let ch = match st.channels.get_mut(&channel.0 .0) {
                    Some(ch) => ch,
                    None => return Err(Error::InvalidState("unknown event channel")),
                };
                // the channel is serialized: the previous event must be
                // acknowledged before the next one is handed out
                if ch.has_unacked {
                    None
                } else if let Some(ev) = ch.events.pop_front() {
                    ch.has_unacked = true;
                    Some(ev)
                } else {
                    None
                }
            };
            if let Some(ev) = popped {
                st.next_token += 1;
                let token = EventToken(st.next_token);
                st.pending_acks.insert(token.0, channel.0 .0);
                return Ok(CmEvent::new(
                    self,
                    ev.kind,
                    ev.status,
                    ev.id,
                    ev.private_data,
                    token,
                ));
            }
            st = self.wait(st);
        }
    }

    fn ack_cm_event(&self, token: EventToken) -> Result<()> {
        let mut st = self.lock();
        match st.pending_acks.remove(&token.0) {
            Some(channel) => {
                if let Some(ch) = st.channels.get_mut(&channel) {
                    ch.has_unacked = false;
                }
                self.cond.notify_all();
                Ok(())
            }
            None => Err(Error::InvalidState("event already acknowledged")),
        }
    }

    fn alloc_pd(&self, id: cm::CmId) -> Result<cm::ProtectionDomain> {
        let mut st = self.lock();
        let s = st.ids.get(&id.0 .0).ok_or_else(unknown_id)?;
        if !s.device_resolved {
            return Err(Error::InvalidState(
                "protection domain requires a resolved device context",
            ));
        }
        let h = st.alloc_handle();
        st.pds.insert(h);
        Ok(cm::ProtectionDomain(cm::Handle(h)))
    }

    fn dealloc_pd(&self, pd: cm::ProtectionDomain) -> Result<()> {
        let mut st = self.lock();
        if !st.pds.contains(&pd.0 .0) {
            return Err(Error::InvalidState("unknown protection domain"));
        }
        if st.mrs.values().any(|m| m.pd == pd.0 .0) {
            return Err(Error::InvalidState(
                "protection domain still has registered regions",
            ));
        }
        st.pds.remove(&pd.0 .0);
        Ok(())
    }

    fn create_qp(
        &self,
        id: cm::CmId,
        pd: cm::ProtectionDomain,
        cap: &QpCapability,
    ) -> Result<cm::QueuePair> {
        let mut st = self.lock();
        if !st.pds.contains(&pd.0 .0) {
            return Err(Error::InvalidState("unknown protection domain"));
        }
        if cap.max_send_wr > MAX_QUEUE_DEPTH
            || cap.max_recv_wr > MAX_QUEUE_DEPTH
            || cap.max_send_sge > MAX_SGE
            || cap.max_recv_sge > MAX_SGE
            || cap.max_inline_data > MAX_INLINE
        {
            return Err(Error::ResourceExhausted(
                "queue pair capacities exceed device limits",
            ));
        }
        {
            let s = st.ids.get(&id.0 .0).ok_or_else(unknown_id)?;
            if !s.device_resolved {
                return Err(Error::InvalidState(
                    "queue pair requires a resolved device context",
                ));
            }
            if s.qp.is_some() {
                return Err(Error::InvalidState("identifier already has a queue pair"));
            }
        }
        let h = st.alloc_handle();
        st.qps.insert(
            h,
            QpState {
                pd: pd.0 .0,
                cap: *cap,
                recv_posted: VecDeque::new(),
                inbound: VecDeque::new(),
                send_cq: VecDeque::new(),
                recv_cq: VecDeque::new(),
            },
        );
        if let Some(s) = st.ids.get_mut(&id.0 .0) {
            s.qp = Some(h);
        }
        Ok(cm::QueuePair(cm::Handle(h)))
    }

    fn destroy_qp(&self, id: cm::CmId, qp: cm::QueuePair) -> Result<()> {
        let mut st = self.lock();
        if st.qps.remove(&qp.0 .0).is_none() {
            return Err(Error::InvalidState("unknown queue pair"));
        }
        if let Some(s) = st.ids.get_mut(&id.0 .0) {
            if s.qp == Some(qp.0 .0) {
                s.qp = None;
            }
        }
        self.cond.notify_all();
        Ok(())
    }

    fn reg_mr(
        &self,
        pd: cm::ProtectionDomain,
        addr: *const u8,
        len: usize,
        access: AccessFlags,
    ) -> Result<cm::MemoryRegion> {
        let mut st = self.lock();
        if !st.pds.contains(&pd.0 .0) {
            return Err(Error::RegistrationFailed("unknown protection domain"));
        }
        if addr.is_null() || len == 0 {
            return Err(Error::RegistrationFailed("empty buffer"));
        }
        let h = st.alloc_handle();
        st.mrs.insert(
            h,
            MrState {
                pd: pd.0 .0,
                addr: addr as usize,
                len,
                access,
            },
        );
        Ok(cm::MemoryRegion(cm::Handle(h)))
    }

    fn dereg_mr(&self, mr: cm::MemoryRegion) -> Result<()> {
        let mut st = self.lock();
        if st.mrs.remove(&mr.0 .0).is_none() {
            return Err(Error::InvalidState("unknown memory region"));
        }
        Ok(())
    }

    unsafe fn post_send(
        &self,
        id: cm::CmId,
        wr_id: u64,
        addr: *const u8,
        len: usize,
        mr: cm::MemoryRegion,
        _flags: SendFlags,
    ) -> Result<()> {
        let mut st = self.lock();
        let (my_qp, peer_id) = {
            let s = st.ids.get(&id.0 .0).ok_or_else(unknown_id)?;
            if !s.established {
                return Err(Error::InvalidState("connection is not established"));
            }
            let qp = s.qp.ok_or(Error::InvalidState("no queue pair"))?;
            let peer = s.peer.ok_or(Error::InvalidState("no connected peer"))?;
            (qp, peer)
        };
        let (my_cap, my_pd) = {
            let q = st
                .qps
                .get(&my_qp)
                .ok_or(Error::InvalidState("unknown queue pair"))?;
            (q.cap, q.pd)
        };
        validate_region(&st, mr, my_pd, addr as usize, len, AccessFlags::empty())?;
        let peer_qp = st
            .ids
            .get(&peer_id)
            .and_then(|p| p.qp)
            .ok_or(Error::InvalidState("peer has no queue pair"))?;

        let outstanding = st
            .qps
            .get(&peer_qp)
            .map(|q| q.inbound.iter().filter(|m| m.sender == id.0 .0).count())
            .unwrap_or(0);
        let matched = st
            .qps
            .get_mut(&peer_qp)
            .and_then(|q| q.recv_posted.pop_front());
        match matched {
            Some(recv) => {
                // every request completes; the fabric behaves as if
                // sq_sig_all were set
                let (send_wc, recv_wc) = if len > recv.len {
                    (
                        WorkCompletion {
                            wr_id,
                            status: WcStatus::Error(WC_REM_INV_REQ_ERR),
                            byte_len: 0,
                        },
                        WorkCompletion {
                            wr_id: recv.wr_id,
                            status: WcStatus::Error(WC_LOC_LEN_ERR),
                            byte_len: 0,
                        },
                    )
                } else {
                    // Safety: both buffers are covered by live registrations
                    // and the posting contract keeps them valid until their
                    // completions are retrieved.
                    ptr::copy_nonoverlapping(addr, recv.addr as *mut u8, len);
                    (
                        WorkCompletion {
                            wr_id,
                            status: WcStatus::Success,
                            byte_len: len as u32,
                        },
                        WorkCompletion {
                            wr_id: recv.wr_id,
                            status: WcStatus::Success,
                            byte_len: len as u32,
                        },
                    )
                };
                if let Some(q) = st.qps.get_mut(&peer_qp) {
                    q.recv_cq.push_back(recv_wc);
                }
                if let Some(q) = st.qps.get_mut(&my_qp) {
                    q.send_cq.push_back(send_wc);
                }
            }
            None => {
                if outstanding >= my_cap.max_send_wr as usize {
                    return Err(Error::QueueFull);
                }
                // Safety: the posting contract keeps the buffer valid for
                // the duration of this call; the payload is copied out.
                let bytes = std::slice::from_raw_parts(addr, len).to_vec();
                if let Some(q) = st.qps.get_mut(&peer_qp) {
                    q.inbound.push_back(InboundMsg {
                        sender: id.0 .0,
                        wr_id,
                        bytes,
                    });
                }
            }
        }
        self.cond.notify_all();
        Ok(())
    }

    unsafe fn post_recv(
        &self,
        id: cm::CmId,
        wr_id: u64,
        addr: *mut u8,
        len: usize,
        mr: cm::MemoryRegion,
    ) -> Result<()> {
        let mut st = self.lock();
        let my_qp = {
            let s = st.ids.get(&id.0 .0).ok_or_else(unknown_id)?;
            s.qp.ok_or(Error::InvalidState("no queue pair"))?
        };
        let (my_cap, my_pd, posted) = {
            let q = st
                .qps
                .get(&my_qp)
                .ok_or(Error::InvalidState("unknown queue pair"))?;
            (q.cap, q.pd, q.recv_posted.len())
        };
        validate_region(
            &st,
            mr,
            my_pd,
            addr as usize,
            len,
            AccessFlags::LOCAL_WRITE,
        )?;
        if posted >= my_cap.max_recv_wr as usize {
            return Err(Error::QueueFull);
        }
        // a send may already be waiting for this receive
        let waiting = st.qps.get_mut(&my_qp).and_then(|q| q.inbound.pop_front());
        match waiting {
            Some(msg) => {
                let sender_qp = st.ids.get(&msg.sender).and_then(|s| s.qp);
                let (recv_wc, send_wc) = if msg.bytes.len() > len {
                    (
                        WorkCompletion {
                            wr_id,
                            status: WcStatus::Error(WC_LOC_LEN_ERR),
                            byte_len: 0,
                        },
                        WorkCompletion {
                            wr_id: msg.wr_id,
                            status: WcStatus::Error(WC_REM_INV_REQ_ERR),
                            byte_len: 0,
                        },
                    )
                } else {
                    // Safety: the posting contract keeps the buffer valid
                    // until its completion is retrieved.
                    ptr::copy_nonoverlapping(msg.bytes.as_ptr(), addr, msg.bytes.len());
                    (
                        WorkCompletion {
                            wr_id,
                            status: WcStatus::Success,
                            byte_len: msg.bytes.len() as u32,
                        },
                        WorkCompletion {
                            wr_id: msg.wr_id,
                            status: WcStatus::Success,
                            byte_len: msg.bytes.len() as u32,
                        },
                    )
                };
                if let Some(q) = st.qps.get_mut(&my_qp) {
                    q.recv_cq.push_back(recv_wc);
                }
                if let Some(sq) = sender_qp.and_then(|h| st.qps.get_mut(&h)) {
                    sq.send_cq.push_back(send_wc);
                }
            }
            None => {
                if let Some(q) = st.qps.get_mut(&my_qp) {
                    q.recv_posted.push_back(PostedRecv {
                        wr_id,
                        addr: addr as usize,
                        len,
                    });
                }
            }
        }
        self.cond.notify_all();
        Ok(())
    }

    fn get_send_comp(&self, id: cm::CmId) -> Result<WorkCompletion> {
        let mut st = self.lock();
        loop {
            let qp = st
                .ids
                .get(&id.0 .0)
                .ok_or_else(unknown_id)?
                .qp
                .ok_or(Error::InvalidState("no queue pair"))?;
            if let Some(wc) = st.qps.get_mut(&qp).and_then(|q| q.send_cq.pop_front()) {
                return Ok(wc);
            }
            st = self.wait(st);
        }
    }

    fn get_recv_comp(&self, id: cm::CmId) -> Result<WorkCompletion> {
        let mut st = self.lock();
        loop {
            let qp = st
                .ids
                .get(&id.0 .0)
                .ok_or_else(unknown_id)?
                .qp
                .ok_or(Error::InvalidState("no queue pair"))?;
            if let Some(wc) = st.qps.get_mut(&qp).and_then(|q| q.recv_cq.pop_front()) {
                return Ok(wc);
            }
            st = self.wait(st);
        }
    }

    fn local_addr(&self, id: cm::CmId) -> Result<SocketAddr> {
        let st = self.lock();
        st.ids
            .get(&id.0 .0)
            .ok_or_else(unknown_id)?
            .local
            .ok_or(Error::InvalidState("no local address"))
    }

    fn peer_addr(&self, id: cm::CmId) -> Result<SocketAddr> {
        let st = self.lock();
        st.ids
            .get(&id.0 .0)
            .ok_or_else(unknown_id)?
            .peer_addr
            .ok_or(Error::InvalidState("no connected peer"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn qp_capacities_are_bounded() {
        let fabric = SoftFabric::new();
        let ch = fabric.create_event_channel().unwrap();
        let id = fabric.create_id(ch, PortSpace::Tcp).unwrap();
        fabric
            .resolve_addr(id, addr(7000), Duration::from_millis(100))
            .unwrap();
        fabric.get_cm_event(ch).unwrap().ack().unwrap();
        let pd = fabric.alloc_pd(id).unwrap();
        let cap = QpCapability {
            max_send_wr: MAX_QUEUE_DEPTH + 1,
            ..Default::default()
        };
        let err = fabric.create_qp(id, pd, &cap).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }

    #[test]
    fn pd_with_live_regions_cannot_be_deallocated() {
        let fabric = SoftFabric::new();
        let ch = fabric.create_event_channel().unwrap();
        let id = fabric.create_id(ch, PortSpace::Tcp).unwrap();
        fabric
            .resolve_addr(id, addr(7001), Duration::from_millis(100))
            .unwrap();
        fabric.get_cm_event(ch).unwrap().ack().unwrap();
        let pd = fabric.alloc_pd(id).unwrap();
        let buf = vec![0u8; 64];
        let mr = fabric
            .reg_mr(pd, buf.as_ptr(), buf.len(), AccessFlags::LOCAL_WRITE)
            .unwrap();
        let err = fabric.dealloc_pd(pd).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        fabric.dereg_mr(mr).unwrap();
        fabric.dealloc_pd(pd).unwrap();
    }

    #[test]
    fn bind_assigns_ephemeral_port() {
        let fabric = SoftFabric::new();
        let ch = fabric.create_event_channel().unwrap();
        let id = fabric.create_id(ch, PortSpace::Tcp).unwrap();
        fabric.bind_addr(id, addr(0)).unwrap();
        let local = fabric.local_addr(id).unwrap();
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn acknowledging_twice_is_rejected() {
        let fabric = SoftFabric::new();
        let ch = fabric.create_event_channel().unwrap();
        let id = fabric.create_id(ch, PortSpace::Tcp).unwrap();
        fabric
            .resolve_addr(id, addr(7002), Duration::from_millis(100))
            .unwrap();
        let mut ev = fabric.get_cm_event(ch).unwrap();
        let token = ev.token();
        ev.ack().unwrap();
        assert!(matches!(ev.ack(), Err(Error::InvalidState(_))));
        assert!(matches!(
            fabric.ack_cm_event(token),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn events_are_withheld_until_the_previous_ack() {
        let fabric = Arc::new(SoftFabric::new());
        let ch = fabric.create_event_channel().unwrap();
        let id = fabric.create_id(ch, PortSpace::Tcp).unwrap();
        fabric
            .resolve_addr(id, addr(7003), Duration::from_millis(100))
            .unwrap();
        fabric
            .resolve_route(id, Duration::from_millis(100))
            .unwrap();

        let ev1 = fabric.get_cm_event(ch).unwrap();
        assert_eq!(ev1.kind(), CmEventKind::AddrResolved);
        let token = ev1.token();
        // keep the first event unacknowledged while another thread waits
        std::mem::forget(ev1);

        let acker = {
            let fabric = Arc::clone(&fabric);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                fabric.ack_cm_event(token).unwrap();
            })
        };
        let mut ev2 = fabric.get_cm_event(ch).unwrap();
        assert_eq!(ev2.kind(), CmEventKind::RouteResolved);
        ev2.ack().unwrap();
        acker.join().unwrap();
    }
}
