//! Connection lifecycle management for reliable, connection-oriented RDMA
//! channels.
//!
//! The heart of the crate is [`Endpoint`], which owns one end of an RDMA
//! connection: the connection identifier, its event notification channel,
//! and (once a queue pair is attached) the protection domain scoping all
//! memory registrations. `Endpoint` drives the connection-manager handshake
//! for both roles (resolve/connect on the active side, bind/listen/accept
//! on the passive side) by consuming and acknowledging events from the
//! notification channel, then moves data through posted send/receive work
//! requests and blocking completion retrieval.
//!
//! The underlying connection-manager and verbs primitives are consumed
//! through the [`cm::CmOps`] capability trait rather than called directly,
//! so the lifecycle rules live in one place regardless of what provides the
//! fabric. [`softfabric::SoftFabric`] is an in-process provider with
//! reliable-connection semantics over plain memory; the integration tests
//! drive both roles of the handshake through it.

pub mod cm;
pub mod endpoint;
pub mod mr;
pub mod softfabric;
pub mod verbs;

use thiserror::Error;

pub use cm::{CmEvent, CmEventKind, CmOps, EventToken, PortSpace};
pub use endpoint::{Endpoint, EndpointState, DEFAULT_RESOLVE_TIMEOUT, DEFAULT_ROUTE_TIMEOUT};
pub use mr::{MemoryRegion, ProtectionDomain};
pub use softfabric::SoftFabric;
pub use verbs::{AccessFlags, ConnParam, QpCapability, SendFlags, WcStatus, WorkCompletion};

#[derive(Debug, Error)]
pub enum Error {
    /// The transport could not allocate an event channel, connection
    /// identifier, protection domain or queue pair.
    #[error("transport resource allocation failed: {0}")]
    ResourceExhausted(&'static str),

    /// An operation was invoked before its prerequisite state was reached,
    /// or on a handle whose ownership has been transferred away.
    #[error("operation invalid in the current state: {0}")]
    InvalidState(&'static str),

    /// The requested local address is already bound.
    #[error("address already in use")]
    AddressInUse,

    /// Address resolution was rejected or produced an error event. Terminal
    /// for the endpoint that attempted it.
    #[error("address resolution failed: {0}")]
    ResolutionFailed(String),

    /// Route resolution, the connect request, or the final establishment
    /// step was rejected or errored. Terminal for the endpoint.
    #[error("connection attempt failed: {0}")]
    ConnectFailed(String),

    /// The notification channel produced an event that is not valid for the
    /// current state. A conforming peer never triggers this, but it must be
    /// surfaced rather than assumed away.
    #[error("unexpected {got:?} event while waiting for {expected:?}")]
    UnexpectedEvent {
        expected: CmEventKind,
        got: CmEventKind,
    },

    /// The send or receive queue is at its configured capacity.
    #[error("work queue is full")]
    QueueFull,

    /// The buffer could not be registered with the protection domain, or a
    /// work request referenced memory outside its region.
    #[error("memory registration failed: {0}")]
    RegistrationFailed(&'static str),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
