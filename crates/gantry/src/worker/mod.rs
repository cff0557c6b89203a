//! Worker threads: one event loop each, owning the connections assigned to
//! them for life. The main worker (id 0) additionally runs every listener,
//! the manager control channel, and the admin surface.

mod reaper;

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use gantry_net::{
    buffer::{Direction, hexdump},
    connector,
    endpoint::Endpoint,
    event_loop::{EventLoop, HasSource, Readiness},
    framing::{Frame, FramingMode, PacketDecoder, encode_packet, encode_packet_vec},
    listener::BoundListener,
    socket::{ReadOutcome, Socket, SocketState, StreamKind},
};
use gantry_script::{Action, HostHook, StackId, Value};
use gantry_utils::Repeater;
use mio::{Interest, Token, Waker};
use tracing::{debug, error, info, warn};

use crate::{
    connection::{CloseReason, ConnId, Connection, ServerPolicy},
    control::{self, Command},
    dispatch::{Dispatcher, Effect},
    runtime::Shared,
    status::{self, ConnEntry, Stats},
};

/// Control frames are small JSON documents; anything bigger is a broken peer.
const CONTROL_MAX_PACKET: usize = 64 * 1024;
/// Redial cadence for a lost manager channel.
const CONTROL_RETRY: Duration = Duration::from_secs(2);
const DGRAM_BUF: usize = 64 * 1024;
const DRAIN_POLL: Duration = Duration::from_millis(5);

/// Everything a registry slot can hold. The tag tells the readiness
/// dispatcher which entry point to take.
pub(crate) enum Owner {
    Listener(ServerListener),
    Conn(Connection),
    Control(ControlLink),
}

impl HasSource for Owner {
    fn source(&mut self) -> &mut dyn mio::event::Source {
        match self {
            Self::Listener(l) => l.bound.source(),
            Self::Conn(c) => c.socket.stream_mut().source(),
            Self::Control(l) => l.socket.stream_mut().source(),
        }
    }
}

pub(crate) struct ServerListener {
    bound: BoundListener,
    policy: Arc<ServerPolicy>,
    /// Datagram listeners only: per-peer pseudo-connections.
    peers: HashMap<SocketAddr, DgramPeer>,
}

pub(crate) struct DgramPeer {
    id: ConnId,
    stack: Option<StackId>,
    last_activity: Instant,
}

/// Outbound packet channel to the manager process.
pub(crate) struct ControlLink {
    socket: Socket,
    decoder: PacketDecoder,
    hello_sent: bool,
}

/// An accepted socket on its way to the owning worker.
pub struct Handoff {
    stream: StreamKind,
    policy: Arc<ServerPolicy>,
}

/// Cross-thread handle to a worker: the handoff queue plus the waker that
/// interrupts its poll.
#[derive(Clone)]
pub struct WorkerHandle {
    pub id: u16,
    tx: Sender<Handoff>,
    waker: Arc<Waker>,
}

impl WorkerHandle {
    /// Queue a connection for adoption. Gives the handoff back if the worker
    /// is gone so the caller can place it elsewhere.
    fn assign(&self, handoff: Handoff) -> Result<(), Handoff> {
        self.tx.send(handoff).map_err(|e| e.0)?;
        if let Err(e) = self.waker.wake() {
            warn!(worker = self.id, %e, "waker failed");
        }
        Ok(())
    }

    pub fn wake(&self) {
        let _ = self.waker.wake();
    }
}

pub struct Worker {
    id: u16,
    is_main: bool,
    el: EventLoop<Owner>,
    rx: Receiver<Handoff>,
    shared: Arc<Shared>,
    dispatcher: Dispatcher,
    /// Handoff targets (the non-main workers); empty means adopt locally.
    peers: Vec<WorkerHandle>,
    rr_next: usize,
    stride: u64,
    dgram_buf: Vec<u8>,
    /// Manager endpoint to redial when the channel drops (main worker only).
    control_endpoint: Option<Endpoint>,
    control_token: Option<Token>,
    control_retry: Repeater,
    seen_reload: u64,
    seen_reopen: u64,
    seen_dump: u64,
}

impl Worker {
    pub(crate) fn new(
        id: u16,
        tick: Duration,
        shared: Arc<Shared>,
        dispatcher: Dispatcher,
    ) -> io::Result<(Self, WorkerHandle)> {
        let el = EventLoop::new(tick)?;
        let (tx, rx) = unbounded();
        let handle = WorkerHandle { id, tx, waker: el.waker() };
        let stride = reaper::stride_ticks(shared.heartbeat_stride, tick);
        Ok((
            Self {
                id,
                is_main: id == 0,
                el,
                rx,
                shared,
                dispatcher,
                peers: Vec::new(),
                rr_next: 0,
                stride,
                dgram_buf: vec![0; DGRAM_BUF],
                control_endpoint: None,
                control_token: None,
                control_retry: Repeater::every(CONTROL_RETRY),
                seen_reload: 0,
                seen_reopen: 0,
                seen_dump: 0,
            },
            handle,
        ))
    }

    pub(crate) fn set_peers(&mut self, peers: Vec<WorkerHandle>) {
        self.peers = peers;
    }

    pub(crate) fn add_listener(
        &mut self,
        bound: BoundListener,
        policy: Arc<ServerPolicy>,
    ) -> io::Result<Token> {
        self.el.register(
            Owner::Listener(ServerListener { bound, policy, peers: HashMap::new() }),
            Interest::READABLE,
        )
    }

    pub(crate) fn add_control_link(&mut self, socket: Socket) -> io::Result<Token> {
        let token = self.el.register(
            Owner::Control(ControlLink {
                socket,
                decoder: PacketDecoder::new(CONTROL_MAX_PACKET),
                hello_sent: false,
            }),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        self.control_token = Some(token);
        Ok(token)
    }

    /// Remember the manager endpoint so a dropped channel gets redialed.
    pub(crate) fn set_control_endpoint(&mut self, endpoint: Endpoint) {
        self.control_endpoint = Some(endpoint);
    }

    /// The worker body: poll, adopt handoffs, drive readiness, tick.
    /// Returns after the shutdown flag is observed and the drain completes.
    pub(crate) fn run(&mut self) {
        info!(worker = self.id, "worker up");
        if self.is_main {
            self.dispatcher.hook(HostHook::Load);
        }
        self.dispatcher.hook(HostHook::SubLoad);

        let mut readiness: Vec<Readiness> = Vec::new();
        loop {
            let wake = match self.el.poll_once(&mut readiness) {
                Ok(wake) => wake,
                Err(e) => {
                    error!(worker = self.id, %e, "poll failed, worker terminating");
                    break;
                }
            };

            while let Ok(handoff) = self.rx.try_recv() {
                self.adopt(handoff);
            }
            for r in &readiness {
                self.handle_ready(*r);
            }
            if let Some(tick) = wake.tick {
                self.on_tick(tick);
            }
            self.observe_admin();
            if self.shared.controller.is_shutting_down() {
                break;
            }
        }

        self.shutdown_drain();
        self.dispatcher.hook(HostHook::SubExit);
        if self.is_main {
            self.dispatcher.hook(HostHook::Exit);
        }
        info!(worker = self.id, "worker down");
    }

    // ------------------------------------------------------------------
    // Accept & handoff

    fn adopt(&mut self, handoff: Handoff) {
        if let Some(size) = self.shared.socket_buf_size {
            handoff.stream.set_buf_size(size);
        }
        let policy = handoff.policy;
        let socket = match handoff.stream {
            StreamKind::Tcp(s) => Socket::from_tcp(s, SocketState::Open),
            StreamKind::Local(s) => Ok(Socket::from_local(s, SocketState::Open)),
        };
        let socket = match socket {
            Ok(s) => s,
            Err(e) => {
                warn!(worker = self.id, %e, "could not adopt connection");
                policy.release();
                return;
            }
        };

        let id = self.shared.next_conn_id();
        let peer = socket.peer().to_owned();
        let server = policy.name.clone();
        let conn = Connection::new(id, socket, Arc::clone(&policy));
        let token = match self.el.register(Owner::Conn(conn), Interest::READABLE) {
            Ok(token) => token,
            Err(e) => {
                warn!(worker = self.id, %e, "register failed, dropping connection");
                policy.release();
                return;
            }
        };
        debug!(worker = self.id, conn = id, %peer, %server, "connection adopted");
        self.shared.directory.insert(id, ConnEntry { worker: self.id, server, peer });

        // Strictly before any data callback: data readiness for this fd is
        // first seen by the next poll on this same thread.
        let effects = match self.el.owner_mut(token) {
            Some(Owner::Conn(conn)) => self.dispatcher.on_connect(conn),
            _ => return,
        };
        if self.apply_effects(token, effects) {
            self.flush_conn(token);
        }
    }

    fn on_accept_ready(&mut self, token: Token) {
        loop {
            let accepted = {
                let Some(Owner::Listener(listener)) = self.el.owner_mut(token) else { return };
                match listener.bound.accept() {
                    Ok(Some(stream)) => Some((stream, Arc::clone(&listener.policy))),
                    Ok(None) => None,
                    Err(e) => {
                        error!(%e, "accept failed");
                        None
                    }
                }
            };
            let Some((stream, policy)) = accepted else { break };

            if !policy.try_admit() {
                // Over cap: the fd is closed on drop, no callback fires.
                Stats::bump(&self.shared.stats.refused);
                debug!(server = %policy.name, "admission refused");
                continue;
            }
            Stats::bump(&self.shared.stats.accepted);
            self.assign(Handoff { stream, policy });
        }
    }

    fn assign(&mut self, handoff: Handoff) {
        if self.peers.is_empty() {
            self.adopt(handoff);
            return;
        }
        let idx = self.rr_next % self.peers.len();
        self.rr_next = self.rr_next.wrapping_add(1);
        if let Err(handoff) = self.peers[idx].assign(handoff) {
            error!(worker = self.peers[idx].id, "worker queue closed, adopting locally");
            self.adopt(handoff);
        }
    }

    // ------------------------------------------------------------------
    // Readiness dispatch

    fn handle_ready(&mut self, r: Readiness) {
        enum Kind {
            StreamListener,
            DgramListener,
            Conn,
            Control,
        }
        let kind = match self.el.owner(r.token) {
            // Owner closed earlier in this batch; stale event.
            None => return,
            Some(Owner::Listener(l)) => {
                if l.bound.is_datagram() { Kind::DgramListener } else { Kind::StreamListener }
            }
            Some(Owner::Conn(_)) => Kind::Conn,
            Some(Owner::Control(_)) => Kind::Control,
        };
        match kind {
            Kind::StreamListener => self.on_accept_ready(r.token),
            Kind::DgramListener => self.on_datagram_ready(r.token),
            Kind::Conn => self.on_conn_ready(r.token, r),
            Kind::Control => self.on_control_ready(r.token, r),
        }
    }

    fn on_conn_ready(&mut self, token: Token, r: Readiness) {
        if (r.readable || r.error) && !self.read_pump(token) {
            return;
        }
        self.flush_conn(token);
    }

    /// Drain the kernel read buffer (edge-triggered: until `WouldBlock`),
    /// decoding and dispatching after every chunk. Returns false once the
    /// connection is gone.
    fn read_pump(&mut self, token: Token) -> bool {
        loop {
            let outcome = {
                let Some(Owner::Conn(conn)) = self.el.owner_mut(token) else { return false };
                if conn.deferred_close.is_some() {
                    // Draining: the peer's remaining bytes are not our problem.
                    return true;
                }
                conn.socket.read_into_buffer()
            };
            match outcome {
                Ok(ReadOutcome::Read(n)) => {
                    Stats::add(&self.shared.stats.bytes_in, n as u64);
                    {
                        let Some(Owner::Conn(conn)) = self.el.owner_mut(token) else {
                            return false;
                        };
                        conn.touch();
                        if self.shared.hex_dump_input {
                            let pending = conn.socket.rbuf.as_slice();
                            hexdump(Direction::Ingress, conn.id, &pending[pending.len() - n..]);
                        }
                    }
                    if !self.pump_messages(token) {
                        return false;
                    }
                }
                Ok(ReadOutcome::WouldBlock) => return true,
                Ok(ReadOutcome::Eof) => {
                    self.close_conn(token, CloseReason::PeerClosed);
                    return false;
                }
                Err(e) => {
                    warn!(%e, "read failed");
                    self.close_conn(token, CloseReason::Io);
                    return false;
                }
            }
        }
    }

    /// Turn buffered bytes into handler callbacks under the connection's
    /// framing mode.
    fn pump_messages(&mut self, token: Token) -> bool {
        let framing = {
            let Some(Owner::Conn(conn)) = self.el.owner(token) else { return false };
            conn.policy.framing
        };
        match framing {
            FramingMode::Packet => {
                let decoded = {
                    let Some(Owner::Conn(conn)) = self.el.owner_mut(token) else { return false };
                    let Some(decoder) = conn.decoder.as_mut() else { return true };
                    let mut frames = Vec::new();
                    decoder.drain(&mut conn.socket.rbuf, |f| frames.push(f)).map(|()| frames)
                };
                match decoded {
                    Ok(frames) => {
                        for frame in frames {
                            let effects = {
                                let Some(Owner::Conn(conn)) = self.el.owner_mut(token) else {
                                    return false;
                                };
                                self.dispatcher.on_frame(conn, frame.tag, &frame.payload)
                            };
                            if !self.apply_effects(token, effects) {
                                return false;
                            }
                        }
                        true
                    }
                    Err(e) => {
                        Stats::bump(&self.shared.stats.protocol_errors);
                        warn!(%e, "protocol violation");
                        let effects = {
                            let Some(Owner::Conn(conn)) = self.el.owner_mut(token) else {
                                return false;
                            };
                            self.dispatcher.on_error(conn, CloseReason::Protocol)
                        };
                        drop(effects);
                        self.close_or_drain(token, CloseReason::Protocol);
                        false
                    }
                }
            }
            FramingMode::Stream => {
                let bytes = {
                    let Some(Owner::Conn(conn)) = self.el.owner_mut(token) else { return false };
                    let pending = conn.socket.rbuf.pending();
                    conn.socket.rbuf.take(pending)
                };
                if bytes.is_empty() {
                    return true;
                }
                let effects = {
                    let Some(Owner::Conn(conn)) = self.el.owner_mut(token) else { return false };
                    self.dispatcher.on_raw(conn, bytes)
                };
                self.apply_effects(token, effects)
            }
            // Stream connections never carry datagram framing.
            FramingMode::Datagram => true,
        }
    }

    /// Returns false once the connection is gone.
    fn apply_effects(&mut self, token: Token, effects: Vec<Effect>) -> bool {
        for effect in effects {
            match effect {
                Effect::Close(reason) => {
                    self.close_or_drain(token, reason);
                    return false;
                }
                Effect::Broadcast { tag, payload } => self.broadcast(token, tag, &payload),
            }
        }
        true
    }

    fn broadcast(&mut self, origin: Token, tag: u32, payload: &[u8]) {
        let targets: Vec<Token> = self
            .el
            .iter()
            .filter_map(|(token, owner)| match owner {
                Owner::Conn(conn)
                    if token != origin
                        && conn.policy.framing == FramingMode::Packet
                        && conn.deferred_close.is_none() =>
                {
                    Some(token)
                }
                _ => None,
            })
            .collect();
        for token in targets {
            if let Some(Owner::Conn(conn)) = self.el.owner_mut(token) {
                encode_packet(&mut conn.socket.wbuf, tag, payload);
                Stats::bump(&self.shared.stats.frames_out);
            }
            self.flush_conn(token);
        }
    }

    // ------------------------------------------------------------------
    // Write side

    fn flush_conn(&mut self, token: Token) {
        let result = {
            let Some(Owner::Conn(conn)) = self.el.owner_mut(token) else { return };
            if conn.socket.wbuf.is_empty() {
                Ok(())
            } else {
                if self.shared.hex_dump_output {
                    hexdump(Direction::Egress, conn.id, conn.socket.wbuf.as_slice());
                }
                let before = conn.socket.wbuf.pending();
                let result = conn.socket.write_from_buffer().map(|_| ());
                let written = before - conn.socket.wbuf.pending();
                Stats::add(&self.shared.stats.bytes_out, written as u64);
                result
            }
        };
        match result {
            Ok(()) => {
                let (drained, deferred) = {
                    let Some(Owner::Conn(conn)) = self.el.owner(token) else { return };
                    (conn.socket.wbuf.is_empty(), conn.deferred_close)
                };
                if drained && let Some(reason) = deferred {
                    self.close_conn(token, reason);
                    return;
                }
                self.update_interest(token);
            }
            Err(e) => {
                debug!(%e, "write failed");
                let reason = match e.kind() {
                    io::ErrorKind::BrokenPipe | io::ErrorKind::WriteZero => {
                        CloseReason::PeerClosed
                    }
                    _ => CloseReason::Io,
                };
                self.close_conn(token, reason);
            }
        }
    }

    fn update_interest(&mut self, token: Token) {
        let desired = {
            let Some(Owner::Conn(conn)) = self.el.owner(token) else { return };
            match (conn.socket.wbuf.is_empty(), conn.deferred_close.is_some()) {
                (true, _) => Interest::READABLE,
                (false, false) => Interest::READABLE | Interest::WRITABLE,
                (false, true) => Interest::WRITABLE,
            }
        };
        let changed = {
            let Some(Owner::Conn(conn)) = self.el.owner_mut(token) else { return };
            if conn.current_interest == desired {
                false
            } else {
                conn.current_interest = desired;
                true
            }
        };
        if changed && let Err(e) = self.el.reregister(token, desired) {
            debug!(%e, "reregister failed");
            self.close_conn(token, CloseReason::Io);
        }
    }

    // ------------------------------------------------------------------
    // Close paths

    /// Close now if the outbound buffer is empty, otherwise stop reading and
    /// let the drain finish first.
    fn close_or_drain(&mut self, token: Token, reason: CloseReason) {
        let backlog = match self.el.owner(token) {
            Some(Owner::Conn(conn)) => !conn.socket.wbuf.is_empty(),
            _ => return,
        };
        if !backlog {
            self.close_conn(token, reason);
            return;
        }
        if let Some(Owner::Conn(conn)) = self.el.owner_mut(token) {
            conn.deferred_close = Some(reason);
            conn.socket.start_draining();
        }
        self.update_interest(token);
        self.flush_conn(token);
    }

    fn close_conn(&mut self, token: Token, reason: CloseReason) {
        let mut conn = match self.el.remove(token) {
            Some(Owner::Conn(conn)) => conn,
            Some(_) => {
                gantry_utils::safe_panic!("close_conn on non-connection token {token:?}");
                return;
            }
            None => return,
        };
        // on_close fires exactly once, while the fd is still open; farewell
        // bytes from the close handler get one shot at the kernel.
        self.dispatcher.on_close(&mut conn, reason);
        if !conn.socket.wbuf.is_empty() {
            let _ = conn.socket.write_from_buffer();
        }
        if let Err(e) = self.el.deregister(conn.socket.stream_mut().source()) {
            debug!(%e, "deregister failed");
        }
        conn.socket.mark_closed();
        conn.policy.release();
        self.shared.directory.remove(conn.id);
        Stats::bump(&self.shared.stats.closed);
        if reason == CloseReason::Reaped {
            Stats::bump(&self.shared.stats.reaped);
        }
    }

    // ------------------------------------------------------------------
    // Datagram listeners

    fn on_datagram_ready(&mut self, token: Token) {
        loop {
            let recvd = {
                let Some(Owner::Listener(listener)) = self.el.owner_mut(token) else { return };
                match listener.bound.recv_datagram(&mut self.dgram_buf) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(%e, "datagram recv failed");
                        return;
                    }
                }
            };
            let Some((n, peer)) = recvd else { return };
            Stats::add(&self.shared.stats.bytes_in, n as u64);
            let data = self.dgram_buf[..n].to_vec();
            self.dispatch_datagram(token, peer, data);
        }
    }

    fn dispatch_datagram(&mut self, token: Token, peer: SocketAddr, data: Vec<u8>) {
        let (policy, existing) = {
            let Some(Owner::Listener(listener)) = self.el.owner(token) else { return };
            (
                Arc::clone(&listener.policy),
                listener.peers.get(&peer).map(|p| (p.id, p.stack)),
            )
        };

        let (id, stack) = match existing {
            Some(found) => found,
            None => match self.new_dgram_peer(token, peer, &policy) {
                Some(created) => created,
                None => return,
            },
        };

        if let Some(Owner::Listener(listener)) = self.el.owner_mut(token)
            && let Some(entry) = listener.peers.get_mut(&peer)
        {
            entry.last_activity = Instant::now();
        }
        if self.shared.hex_dump_input {
            hexdump(Direction::Ingress, id, &data);
        }
        Stats::bump(&self.shared.stats.frames_in);

        let Some(stack) = stack else { return };
        let Some(func) = policy.handlers.on_data.clone() else { return };
        let args = [
            Value::Int(id as i64),
            Value::Bytes(data),
            Value::Bytes(peer.to_string().into_bytes()),
        ];
        match self.dispatcher.call_stack(stack, &func, &args) {
            Ok(actions) => self.apply_dgram_actions(token, peer, id, actions),
            Err(e) => {
                Stats::bump(&self.shared.stats.dispatch_errors);
                error!(conn = id, %func, %e, "handler raised");
            }
        }
    }

    /// First datagram from an unknown peer: admission, stack, connect
    /// callback, peer entry.
    fn new_dgram_peer(
        &mut self,
        token: Token,
        peer: SocketAddr,
        policy: &Arc<ServerPolicy>,
    ) -> Option<(ConnId, Option<StackId>)> {
        if !policy.try_admit() {
            Stats::bump(&self.shared.stats.refused);
            return None;
        }
        Stats::bump(&self.shared.stats.accepted);

        let id = self.shared.next_conn_id();
        let stack = match self.dispatcher.new_stack(id) {
            Ok(s) => Some(s),
            Err(e) => {
                error!(conn = id, %e, "stack allocation failed");
                None
            }
        };
        self.shared.directory.insert(
            id,
            ConnEntry { worker: self.id, server: policy.name.clone(), peer: peer.to_string() },
        );
        if let (Some(func), Some(stack)) = (policy.handlers.on_connect.as_deref(), stack)
            && let Err(e) = self.dispatcher.call_stack(stack, func, &[Value::Int(id as i64)])
        {
            Stats::bump(&self.shared.stats.dispatch_errors);
            error!(conn = id, func, %e, "handler raised");
        }

        let Some(Owner::Listener(listener)) = self.el.owner_mut(token) else { return None };
        listener
            .peers
            .insert(peer, DgramPeer { id, stack, last_activity: Instant::now() });
        Some((id, stack))
    }

    fn apply_dgram_actions(
        &mut self,
        token: Token,
        peer: SocketAddr,
        id: ConnId,
        actions: Vec<Action>,
    ) {
        for action in actions {
            let payload = match action {
                Action::SendRaw(bytes) => bytes,
                Action::SendPacket { tag, payload } => {
                    Stats::bump(&self.shared.stats.frames_out);
                    encode_packet_vec(tag, &payload)
                }
                Action::Broadcast { .. } => {
                    debug!(conn = id, "broadcast ignored on datagram listener");
                    continue;
                }
                Action::Close => {
                    let removed = {
                        let Some(Owner::Listener(listener)) = self.el.owner_mut(token) else {
                            return;
                        };
                        listener.peers.remove(&peer)
                    };
                    if let Some(entry) = removed {
                        self.finish_dgram_peer(token, entry, CloseReason::Handler);
                    }
                    return;
                }
            };
            if self.shared.hex_dump_output {
                hexdump(Direction::Egress, id, &payload);
            }
            let sent = {
                let Some(Owner::Listener(listener)) = self.el.owner_mut(token) else { return };
                listener.bound.send_datagram(peer, &payload)
            };
            match sent {
                Ok(n) => Stats::add(&self.shared.stats.bytes_out, n as u64),
                Err(e) => warn!(conn = id, %e, "datagram send failed"),
            }
        }
    }

    fn finish_dgram_peer(&mut self, token: Token, mut entry: DgramPeer, reason: CloseReason) {
        let (on_close, policy) = {
            let Some(Owner::Listener(listener)) = self.el.owner(token) else { return };
            (listener.policy.handlers.on_close.clone(), Arc::clone(&listener.policy))
        };
        if let (Some(func), Some(stack)) = (on_close, entry.stack)
            && let Err(e) = self.dispatcher.call_stack(stack, &func, &[Value::Int(entry.id as i64)])
        {
            error!(conn = entry.id, %e, "close handler raised");
        }
        if let Some(stack) = entry.stack.take() {
            self.dispatcher.release_stack(stack);
        }
        policy.release();
        self.shared.directory.remove(entry.id);
        Stats::bump(&self.shared.stats.closed);
        if reason == CloseReason::Reaped {
            Stats::bump(&self.shared.stats.reaped);
        }
    }

    // ------------------------------------------------------------------
    // Control channel (main worker)

    fn on_control_ready(&mut self, token: Token, r: Readiness) {
        if r.writable || r.error {
            let connected = {
                let Some(Owner::Control(link)) = self.el.owner_mut(token) else { return };
                connector::finish_connect(&mut link.socket)
            };
            match connected {
                Ok(_) => self.maybe_send_hello(token),
                Err(e) => {
                    warn!(%e, "manager channel connect failed");
                    self.drop_control(token);
                    return;
                }
            }
        }

        if r.readable && !self.control_read_pump(token) {
            return;
        }
        self.flush_control(token);
    }

    fn maybe_send_hello(&mut self, token: Token) {
        let due = {
            let Some(Owner::Control(link)) = self.el.owner_mut(token) else { return };
            if link.socket.state() == SocketState::Open && !link.hello_sent {
                link.hello_sent = true;
                true
            } else {
                false
            }
        };
        if due {
            info!("manager channel up");
            let payload = control::hello_payload(&self.shared.app_name, std::process::id());
            if let Some(Owner::Control(link)) = self.el.owner_mut(token) {
                encode_packet(&mut link.socket.wbuf, Command::Hello.tag(), &payload);
            }
        }
    }

    fn control_read_pump(&mut self, token: Token) -> bool {
        loop {
            let outcome = {
                let Some(Owner::Control(link)) = self.el.owner_mut(token) else { return false };
                link.socket.read_into_buffer()
            };
            match outcome {
                Ok(ReadOutcome::Read(_)) => {
                    let frames = {
                        let Some(Owner::Control(link)) = self.el.owner_mut(token) else {
                            return false;
                        };
                        let mut frames = Vec::new();
                        link.decoder
                            .drain(&mut link.socket.rbuf, |f| frames.push(f))
                            .map(|()| frames)
                    };
                    match frames {
                        Ok(frames) => {
                            for frame in frames {
                                self.handle_control_frame(token, &frame);
                            }
                        }
                        Err(e) => {
                            warn!(%e, "manager channel framing error");
                            self.drop_control(token);
                            return false;
                        }
                    }
                }
                Ok(ReadOutcome::WouldBlock) => return true,
                Ok(ReadOutcome::Eof) => {
                    warn!("manager channel closed, will redial");
                    self.drop_control(token);
                    return false;
                }
                Err(e) => {
                    warn!(%e, "manager channel read failed");
                    self.drop_control(token);
                    return false;
                }
            }
        }
    }

    /// Map a command frame from the manager onto the admin surface. These
    /// run here, on the main worker, never inside a connection callback.
    fn handle_control_frame(&mut self, token: Token, frame: &Frame) {
        match Command::from_tag(frame.tag) {
            Some(Command::Reload) => self.shared.controller.reload_script(),
            Some(Command::ReopenLogs) => self.shared.controller.reopen_logs(),
            Some(Command::Shutdown) => self.shared.controller.shutdown(),
            Some(Command::Status) => {
                let snap = self.shared.stats.snapshot(self.shared.directory.len() as u64);
                let payload = serde_json::to_vec(&snap).unwrap_or_default();
                if let Some(Owner::Control(link)) = self.el.owner_mut(token) {
                    encode_packet(&mut link.socket.wbuf, Command::Status.tag(), &payload);
                }
            }
            Some(Command::Hello) => {}
            None => debug!(tag = frame.tag, "unknown control command"),
        }
    }

    fn flush_control(&mut self, token: Token) {
        let result = {
            let Some(Owner::Control(link)) = self.el.owner_mut(token) else { return };
            if link.socket.state() != SocketState::Open {
                return;
            }
            let before = link.socket.wbuf.pending();
            let result = link.socket.write_from_buffer().map(|_| ());
            Stats::add(
                &self.shared.stats.bytes_out,
                (before - link.socket.wbuf.pending()) as u64,
            );
            result
        };
        match result {
            Ok(()) => {
                let drained = match self.el.owner(token) {
                    Some(Owner::Control(link)) => link.socket.wbuf.is_empty(),
                    _ => return,
                };
                let interest = if drained {
                    Interest::READABLE
                } else {
                    Interest::READABLE | Interest::WRITABLE
                };
                if let Err(e) = self.el.reregister(token, interest) {
                    debug!(%e, "control reregister failed");
                }
            }
            Err(e) => {
                warn!(%e, "manager channel write failed");
                self.drop_control(token);
            }
        }
    }

    fn drop_control(&mut self, token: Token) {
        if let Some(Owner::Control(mut link)) = self.el.remove(token) {
            let _ = self.el.deregister(link.socket.stream_mut().source());
        }
        self.control_token = None;
        // Wait a full interval before the first redial attempt.
        self.control_retry.reset();
    }

    /// Redial a dropped manager channel at the retry cadence. Only outbound
    /// channels reconnect; inbound connections never do.
    fn maybe_redial_control(&mut self) {
        if self.control_token.is_some() {
            return;
        }
        let Some(endpoint) = self.control_endpoint.clone() else { return };
        if !self.control_retry.fired() {
            return;
        }
        match connector::connect(&endpoint, self.shared.socket_buf_size) {
            Ok(socket) => match self.add_control_link(socket) {
                Ok(_) => info!(%endpoint, "manager channel redialing"),
                Err(e) => warn!(%e, "manager channel register failed"),
            },
            Err(e) => debug!(%e, "manager channel redial failed"),
        }
    }

    // ------------------------------------------------------------------
    // Timer & admin

    fn on_tick(&mut self, tick: u64) {
        let now = Instant::now();
        for token in reaper::scan(&self.el, tick, self.stride, now) {
            debug!("heartbeat expired");
            self.close_conn(token, CloseReason::Reaped);
        }
        self.reap_dgram_peers(tick, now);
        self.maybe_redial_control();
    }

    fn reap_dgram_peers(&mut self, tick: u64, now: Instant) {
        let listeners: Vec<Token> = self
            .el
            .iter()
            .filter_map(|(token, owner)| match owner {
                Owner::Listener(l) if l.bound.is_datagram() => Some(token),
                _ => None,
            })
            .collect();
        for token in listeners {
            if !reaper::due_this_tick(token, tick, self.stride) {
                continue;
            }
            let expired: Vec<DgramPeer> = {
                let Some(Owner::Listener(listener)) = self.el.owner_mut(token) else { continue };
                let Some(ttl) = listener.policy.heartbeat_ttl else { continue };
                let dead: Vec<SocketAddr> = listener
                    .peers
                    .iter()
                    .filter(|(_, p)| now.duration_since(p.last_activity) > ttl)
                    .map(|(addr, _)| *addr)
                    .collect();
                dead.into_iter().filter_map(|addr| listener.peers.remove(&addr)).collect()
            };
            for entry in expired {
                self.finish_dgram_peer(token, entry, CloseReason::Reaped);
            }
        }
    }

    fn observe_admin(&mut self) {
        let reload = self.shared.controller.reload_generation();
        if reload != self.seen_reload {
            self.seen_reload = reload;
            if self.is_main {
                self.dispatcher.hook(HostHook::Reload);
            }
            self.dispatcher.hook(HostHook::SubReload);
        }

        if !self.is_main {
            return;
        }
        let reopen = self.shared.controller.reopen_generation();
        if reopen != self.seen_reopen {
            self.seen_reopen = reopen;
            match &self.shared.log {
                Some(log) => match log.reopen() {
                    Ok(()) => info!(path = %log.path().display(), "log reopened"),
                    Err(e) => error!(%e, "log reopen failed"),
                },
                None => debug!("log reopen requested without a log file"),
            }
        }
        let dump = self.shared.controller.dump_generation();
        if dump != self.seen_dump {
            self.seen_dump = dump;
            status::dump(&self.shared.stats, &self.shared.directory);
        }
    }

    // ------------------------------------------------------------------
    // Shutdown

    /// Fire every close callback (no handler is interrupted — we only get
    /// here between callbacks), then drain outbound buffers up to the
    /// deadline, then release everything.
    fn shutdown_drain(&mut self) {
        debug!(worker = self.id, owners = self.el.len(), "draining");

        for token in self.el.tokens() {
            let peers: Vec<DgramPeer> = match self.el.owner_mut(token) {
                Some(Owner::Listener(listener)) => {
                    listener.peers.drain().map(|(_, p)| p).collect()
                }
                _ => continue,
            };
            for entry in peers {
                self.finish_dgram_peer(token, entry, CloseReason::Shutdown);
            }
        }
        for token in self.el.tokens() {
            if let Some(Owner::Conn(conn)) = self.el.owner_mut(token) {
                self.dispatcher.on_close(conn, CloseReason::Shutdown);
            }
        }

        let deadline = Instant::now() + self.shared.drain_deadline;
        loop {
            let mut pending = false;
            for token in self.el.tokens() {
                if let Some(Owner::Conn(conn)) = self.el.owner_mut(token) {
                    if !conn.socket.wbuf.is_empty() {
                        let _ = conn.socket.write_from_buffer();
                        pending |= !conn.socket.wbuf.is_empty();
                    }
                }
            }
            if !pending || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(DRAIN_POLL);
        }

        for token in self.el.tokens() {
            match self.el.remove(token) {
                Some(Owner::Conn(mut conn)) => {
                    let _ = self.el.deregister(conn.socket.stream_mut().source());
                    conn.socket.mark_closed();
                    conn.policy.release();
                    self.shared.directory.remove(conn.id);
                    Stats::bump(&self.shared.stats.closed);
                }
                Some(Owner::Listener(mut listener)) => {
                    let _ = self.el.deregister(listener.bound.source());
                }
                Some(Owner::Control(mut link)) => {
                    let _ = self.el.deregister(link.socket.stream_mut().source());
                }
                None => {}
            }
        }
    }
}
