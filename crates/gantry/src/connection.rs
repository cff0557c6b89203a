use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use gantry_net::{
    framing::{FramingMode, PacketDecoder},
    socket::Socket,
};
use gantry_script::StackId;

use crate::config::{OverflowPolicy, ServerSpec};

pub type ConnId = u64;

/// Script function names for a listener's four callbacks. Absent name =
/// the event is not delivered to the script.
#[derive(Clone, Debug, Default)]
pub struct Handlers {
    pub on_connect: Option<String>,
    pub on_close: Option<String>,
    pub on_data: Option<String>,
    pub on_error: Option<String>,
}

/// Why a connection is going away; drives which callbacks fire and which
/// counter ticks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    Protocol,
    Reaped,
    Shutdown,
    Overflow,
    Io,
    Handler,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PeerClosed => "peer-closed",
            Self::Protocol => "protocol",
            Self::Reaped => "heartbeat",
            Self::Shutdown => "shutdown",
            Self::Overflow => "overflow",
            Self::Io => "io",
            Self::Handler => "handler",
        }
    }
}

/// Per-listener policy, shared between the accepting worker and every
/// connection's owning worker. The admission gauge lives here so the cap is
/// enforced where the accept happens.
pub struct ServerPolicy {
    pub name: String,
    pub framing: FramingMode,
    pub heartbeat_ttl: Option<Duration>,
    /// 0 = unlimited.
    pub max_clients: usize,
    pub max_packet_len: usize,
    pub outbound_high_water: usize,
    pub overflow: OverflowPolicy,
    pub handlers: Handlers,
    current: AtomicUsize,
}

impl ServerPolicy {
    pub fn from_spec(spec: &ServerSpec, outbound_high_water: usize) -> Arc<Self> {
        Arc::new(Self {
            name: spec.name.clone(),
            framing: spec.effective_framing(),
            heartbeat_ttl: spec.heartbeat_ttl,
            max_clients: spec.max_clients,
            max_packet_len: spec.max_packet_len,
            outbound_high_water,
            overflow: spec.overflow,
            handlers: Handlers {
                on_connect: spec.on_connect.clone(),
                on_close: spec.on_close.clone(),
                on_data: spec.on_data.clone(),
                on_error: spec.on_error.clone(),
            },
            current: AtomicUsize::new(0),
        })
    }

    /// Claim an admission slot. Only the accepting worker calls this, so a
    /// plain check-then-add keeps `current ≤ max_clients`; concurrent
    /// releases from owning workers only lower the gauge.
    pub fn try_admit(&self) -> bool {
        if self.max_clients > 0 && self.current.load(Ordering::Acquire) >= self.max_clients {
            return false;
        }
        self.current.fetch_add(1, Ordering::AcqRel);
        true
    }

    pub fn release(&self) {
        self.current.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn current_clients(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }
}

/// One accepted (or dialed) stream connection: its socket, its framing
/// state, and its script binding.
pub struct Connection {
    pub id: ConnId,
    pub socket: Socket,
    pub policy: Arc<ServerPolicy>,
    /// Packet-mode reassembly; `None` for stream framing.
    pub decoder: Option<PacketDecoder>,
    /// Script binding, created by the owning worker on connect and taken
    /// exactly once on close.
    pub stack: Option<StackId>,
    pub last_activity: Instant,
    /// Set when a close is requested while output is still queued; the
    /// connection drains, then closes.
    pub deferred_close: Option<CloseReason>,
    /// Interest set currently registered with the poller, to skip redundant
    /// reregisters.
    pub current_interest: mio::Interest,
    close_fired: bool,
}

impl Connection {
    pub fn new(id: ConnId, socket: Socket, policy: Arc<ServerPolicy>) -> Self {
        let decoder = (policy.framing == FramingMode::Packet)
            .then(|| PacketDecoder::new(policy.max_packet_len));
        Self {
            id,
            socket,
            policy,
            decoder,
            stack: None,
            last_activity: Instant::now(),
            deferred_close: None,
            current_interest: mio::Interest::READABLE,
            close_fired: false,
        }
    }

    #[inline]
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_expired(&self, now: Instant) -> bool {
        self.policy
            .heartbeat_ttl
            .is_some_and(|ttl| now.duration_since(self.last_activity) > ttl)
    }

    /// Latch the close callback; true the first time only.
    pub fn fire_close_once(&mut self) -> bool {
        !std::mem::replace(&mut self.close_fired, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_clients: usize) -> Arc<ServerPolicy> {
        ServerPolicy::from_spec(
            &ServerSpec { name: "t".into(), max_clients, ..ServerSpec::default() },
            1024,
        )
    }

    #[test]
    fn admission_cap_is_enforced() {
        let p = policy(2);
        assert!(p.try_admit());
        assert!(p.try_admit());
        assert!(!p.try_admit());
        assert_eq!(p.current_clients(), 2);

        p.release();
        assert!(p.try_admit());
    }

    #[test]
    fn zero_cap_means_unlimited() {
        let p = policy(0);
        for _ in 0..1000 {
            assert!(p.try_admit());
        }
    }
}
