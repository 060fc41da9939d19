//! Vocabulary types shared between the capability contract and the endpoint
//! layer: queue pair capacities, access/send flags, connection parameters,
//! and work completions.

use bitflags::bitflags;

/// Capacities of a queue pair, fixed at creation time. There is no resize
/// operation; pick the depths for the connection's whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCapability {
    /// Maximum number of outstanding send work requests.
    pub max_send_wr: u32,
    /// Maximum number of outstanding receive work requests.
    pub max_recv_wr: u32,
    /// Maximum scatter-gather entries per send work request.
    pub max_send_sge: u32,
    /// Maximum scatter-gather entries per receive work request.
    pub max_recv_sge: u32,
    /// Largest payload, in bytes, that may be sent inline.
    pub max_inline_data: u32,
}

impl Default for QpCapability {
    /// Eight outstanding requests in each direction, eight scatter-gather
    /// entries per request, and an eight-byte inline threshold.
    fn default() -> Self {
        QpCapability {
            max_send_wr: 8,
            max_recv_wr: 8,
            max_send_sge: 8,
            max_recv_sge: 8,
            max_inline_data: 8,
        }
    }
}

/// Parameters carried by a connect request or an accept reply.
#[derive(Debug, Clone)]
pub struct ConnParam {
    /// Opaque payload delivered to the peer with the connection request.
    pub private_data: Option<Vec<u8>>,
    /// Incoming RDMA read/atomic depth this side is willing to serve.
    pub responder_resources: u8,
    /// Outstanding RDMA read/atomic depth this side will initiate.
    pub initiator_depth: u8,
    pub flow_control: u8,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
}

impl Default for ConnParam {
    /// Resource depths of eight in both directions, no private payload, no
    /// transport-level retries.
    fn default() -> Self {
        ConnParam {
            private_data: None,
            responder_resources: 8,
            initiator_depth: 8,
            flow_control: 0,
            retry_count: 0,
            rnr_retry_count: 0,
        }
    }
}

bitflags! {
    /// Access permissions of a registered memory region.
    #[derive(Default)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 0b0001;
        const REMOTE_WRITE = 0b0010;
        const REMOTE_READ = 0b0100;
        const REMOTE_ATOMIC = 0b1000;
    }
}

bitflags! {
    /// Properties of a posted send work request.
    #[derive(Default)]
    pub struct SendFlags: u32 {
        /// Complete all prior RDMA reads/atomics before this request.
        const FENCE = 0b0001;
        /// Generate a completion for this request.
        const SIGNALED = 0b0010;
        /// Raise a solicited event at the receiver.
        const SOLICITED = 0b0100;
        /// Copy the payload into the work queue entry; the buffer may be
        /// reused as soon as the post returns.
        const INLINE = 0b1000;
    }
}

/// Outcome of a completed work request. Queue status failures are data, not
/// errors: callers inspect the status instead of catching anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    Error(u32),
}

impl WcStatus {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, WcStatus::Success)
    }
}

/// A retrieved work completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    /// Correlation identifier of the completed work request. Defaults to
    /// the posted buffer's address when the caller did not supply one.
    pub wr_id: u64,
    pub status: WcStatus,
    /// Bytes transferred. Zero when the request completed in error.
    pub byte_len: u32,
}
