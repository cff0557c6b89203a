use std::sync::Arc;

use gantry_net::framing::{HEADER_SIZE, TAG_NONE, encode_packet};
use gantry_script::{Action, HostError, HostHook, ScriptHost, StackId, Value};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::{
    config::OverflowPolicy,
    connection::{CloseReason, Connection},
    status::Stats,
};

/// The document codec boundary: turns packet payloads into the value tree
/// handlers receive. The real codecs (BSON-like documents et al.) live
/// outside the core; [`BytesCodec`] passes payloads through untouched.
pub trait PayloadCodec: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<Value, CodecError>;
}

#[derive(Debug, Error)]
#[error("payload decode: {0}")]
pub struct CodecError(pub String);

#[derive(Default)]
pub struct BytesCodec;

impl PayloadCodec for BytesCodec {
    fn decode(&self, payload: &[u8]) -> Result<Value, CodecError> {
        Ok(Value::Bytes(payload.to_vec()))
    }
}

/// Connection-level consequences a handler call produced, applied by the
/// worker after the dispatcher returns (it holds the registry borrow).
#[derive(Debug, PartialEq)]
pub enum Effect {
    Close(CloseReason),
    Broadcast { tag: u32, payload: Vec<u8> },
}

/// Binds decoded messages to script calls for one worker.
///
/// Owns the worker's script host; every callback for a connection runs here,
/// on the owning worker's thread, so callbacks are serialized per connection
/// by construction.
pub struct Dispatcher {
    host: Box<dyn ScriptHost>,
    codec: Arc<dyn PayloadCodec>,
    stats: Arc<Stats>,
}

impl Dispatcher {
    pub fn new(host: Box<dyn ScriptHost>, codec: Arc<dyn PayloadCodec>, stats: Arc<Stats>) -> Self {
        Self { host, codec, stats }
    }

    pub fn hook(&mut self, hook: HostHook) {
        self.host.hook(hook);
    }

    /// Fires once per connection, before any data callback. Allocates the
    /// script stack and invokes the listener's connect handler.
    pub fn on_connect(&mut self, conn: &mut Connection) -> Vec<Effect> {
        match self.host.new_stack(conn.id) {
            Ok(stack) => conn.stack = Some(stack),
            Err(e) => {
                error!(conn = conn.id, %e, "stack allocation failed");
                return vec![Effect::Close(CloseReason::Io)];
            }
        }
        let func = conn.policy.handlers.on_connect.clone();
        self.call(conn, func.as_deref(), vec![Value::Int(conn.id as i64)])
    }

    /// Packet-mode message: tag 0 delivers `(conn, object)`, anything else
    /// `(conn, command, object)`.
    pub fn on_frame(&mut self, conn: &mut Connection, tag: u32, payload: &[u8]) -> Vec<Effect> {
        Stats::bump(&self.stats.frames_in);
        let object = match self.codec.decode(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(conn = conn.id, %e, "undecodable payload");
                Stats::bump(&self.stats.protocol_errors);
                return vec![Effect::Close(CloseReason::Protocol)];
            }
        };

        let func = conn.policy.handlers.on_data.clone();
        let mut args = vec![Value::Int(conn.id as i64)];
        if tag != TAG_NONE {
            args.push(Value::Int(tag as i64));
        }
        args.push(object);
        self.call(conn, func.as_deref(), args)
    }

    /// Stream-mode message: the newly-read bytes, as-is.
    pub fn on_raw(&mut self, conn: &mut Connection, bytes: Vec<u8>) -> Vec<Effect> {
        let func = conn.policy.handlers.on_data.clone();
        self.call(conn, func.as_deref(), vec![Value::Int(conn.id as i64), Value::Bytes(bytes)])
    }

    /// Error callback (`kind` from the close reason taxonomy). Reply actions
    /// are still honored; the close that follows drains them.
    pub fn on_error(&mut self, conn: &mut Connection, kind: CloseReason) -> Vec<Effect> {
        let func = conn.policy.handlers.on_error.clone();
        self.call(
            conn,
            func.as_deref(),
            vec![Value::Int(conn.id as i64), Value::from(kind.as_str())],
        )
    }

    /// Fires exactly once per connection; afterwards the stack is gone.
    /// Send actions from the close handler still land in the outbound
    /// buffer — the worker flushes what it can before dropping the fd.
    pub fn on_close(&mut self, conn: &mut Connection, reason: CloseReason) {
        if !conn.fire_close_once() {
            return;
        }
        debug!(conn = conn.id, reason = reason.as_str(), "connection closing");

        let func = conn.policy.handlers.on_close.clone();
        let effects = self.call(conn, func.as_deref(), vec![Value::Int(conn.id as i64)]);
        if !effects.is_empty() {
            debug!(conn = conn.id, "close handler effects ignored");
        }

        if let Some(stack) = conn.stack.take() {
            self.host.release_stack(stack);
        }
    }

    /// Direct host access for bindings that are not stream connections
    /// (datagram peers, the control channel's native host).
    pub fn new_stack(&mut self, conn_id: u64) -> Result<StackId, HostError> {
        self.host.new_stack(conn_id)
    }

    pub fn release_stack(&mut self, stack: StackId) {
        self.host.release_stack(stack);
    }

    pub fn call_stack(
        &mut self,
        stack: StackId,
        func: &str,
        args: &[Value],
    ) -> Result<Vec<Action>, HostError> {
        self.host.call(stack, func, args)
    }

    fn call(
        &mut self,
        conn: &mut Connection,
        func: Option<&str>,
        args: Vec<Value>,
    ) -> Vec<Effect> {
        let Some(func) = func else { return Vec::new() };
        let Some(stack) = conn.stack else { return Vec::new() };

        match self.host.call(stack, func, &args) {
            Ok(actions) => self.apply(conn, actions),
            Err(e) => {
                // Handler failures are contained per-callback; the
                // connection stays up unless the handler closed it itself.
                Stats::bump(&self.stats.dispatch_errors);
                error!(conn = conn.id, func, %e, "handler raised");
                Vec::new()
            }
        }
    }

    /// Apply reply actions to the connection's outbound buffer, honoring the
    /// high-water mark.
    fn apply(&mut self, conn: &mut Connection, actions: Vec<Action>) -> Vec<Effect> {
        let mut effects = Vec::new();
        for action in actions {
            match action {
                Action::SendPacket { tag, payload } => {
                    if self.over_high_water(conn, HEADER_SIZE + payload.len(), &mut effects) {
                        continue;
                    }
                    encode_packet(&mut conn.socket.wbuf, tag, &payload);
                    Stats::bump(&self.stats.frames_out);
                }
                Action::SendRaw(bytes) => {
                    if self.over_high_water(conn, bytes.len(), &mut effects) {
                        continue;
                    }
                    conn.socket.wbuf.append(&bytes);
                }
                Action::Broadcast { tag, payload } => {
                    effects.push(Effect::Broadcast { tag, payload });
                }
                Action::Close => effects.push(Effect::Close(CloseReason::Handler)),
            }
        }
        effects
    }

    fn over_high_water(
        &self,
        conn: &Connection,
        extra: usize,
        effects: &mut Vec<Effect>,
    ) -> bool {
        if conn.socket.wbuf.pending() + extra <= conn.policy.outbound_high_water {
            return false;
        }
        Stats::bump(&self.stats.overflow_drops);
        match conn.policy.overflow {
            OverflowPolicy::Drop => {
                warn!(conn = conn.id, "outbound high water, reply dropped");
            }
            OverflowPolicy::Close => {
                warn!(conn = conn.id, "outbound high water, closing");
                effects.push(Effect::Close(CloseReason::Overflow));
            }
        }
        true
    }
}
