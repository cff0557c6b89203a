use std::sync::Arc;

use thiserror::Error;

use crate::Value;

/// Opaque per-connection execution context handle.
///
/// Returned by [`ScriptHost::new_stack`] and passed back on every later call
/// for that connection. The core never looks inside; the host owns whatever a
/// "stack" means for its engine (a coroutine, an isolate, a lua_State).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StackId(pub u64);

/// Process- and worker-level host lifecycle hooks.
///
/// `Load`/`Reload`/`Exit` fire once per process, on the main worker.
/// The `Sub*` variants fire once per worker, on that worker's thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostHook {
    Load,
    Reload,
    Exit,
    SubLoad,
    SubReload,
    SubExit,
}

/// What a handler asked the core to do with its connection.
///
/// Actions are applied in order after the call returns; a `Close` is deferred
/// until the handler is done (no callback is ever interrupted).
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Append one length-prefixed frame to the outbound buffer.
    SendPacket { tag: u32, payload: Vec<u8> },
    /// Append raw bytes to the outbound buffer (stream/datagram listeners).
    SendRaw(Vec<u8>),
    /// Send one frame to every packet-mode connection on the calling worker.
    /// The control plane runs single-worker, so this reaches every peer
    /// there; handlers on multi-worker data planes should not rely on it.
    Broadcast { tag: u32, payload: Vec<u8> },
    /// Drain the outbound buffer, then close the connection.
    Close,
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("no stack {0:?}")]
    NoSuchStack(StackId),
    #[error("stack limit reached")]
    StackLimit,
    #[error("script function {func} raised: {reason}")]
    Raised { func: String, reason: String },
}

/// One scripting runtime, owned by one worker thread.
///
/// Stacks are created and released only from the owning worker; the trait is
/// `Send` so the host can be moved onto that thread at boot, never `Sync`.
pub trait ScriptHost: Send {
    /// Allocate the per-connection execution context. `conn_id` is the id the
    /// core will pass as the first argument of every handler call.
    fn new_stack(&mut self, conn_id: u64) -> Result<StackId, HostError>;

    /// Release a context. Must be idempotent for already-released ids.
    fn release_stack(&mut self, stack: StackId);

    /// Call `func` on `stack` with `args`, returning the handler's reply
    /// actions. A missing function is not an error; hosts return no actions.
    fn call(
        &mut self,
        stack: StackId,
        func: &str,
        args: &[Value],
    ) -> Result<Vec<Action>, HostError>;

    /// Lifecycle notification. Default: ignore.
    fn hook(&mut self, _hook: HostHook) {}
}

/// Builds one host per worker. The argument is the worker id.
pub type HostFactory = Arc<dyn Fn(u16) -> Box<dyn ScriptHost> + Send + Sync>;
