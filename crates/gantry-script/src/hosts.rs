//! Built-in hosts: `NullHost` for listeners without handlers, `EchoHost` for
//! smoke tests and the default server wiring when no engine is configured.

use tracing::debug;

use crate::{Action, HostError, HostHook, ScriptHost, StackId, Value};

/// Accepts every call and does nothing.
#[derive(Default)]
pub struct NullHost {
    next_stack: u64,
}

impl ScriptHost for NullHost {
    fn new_stack(&mut self, _conn_id: u64) -> Result<StackId, HostError> {
        self.next_stack += 1;
        Ok(StackId(self.next_stack))
    }

    fn release_stack(&mut self, _stack: StackId) {}

    fn call(
        &mut self,
        _stack: StackId,
        _func: &str,
        _args: &[Value],
    ) -> Result<Vec<Action>, HostError> {
        Ok(Vec::new())
    }
}

/// Echoes every data callback back to the peer.
///
/// The reply shape follows the argument shape the dispatcher uses:
/// `(conn, tag, payload)` echoes a packet with the same tag,
/// `(conn, payload)` echoes raw bytes. Connect/close calls return nothing.
#[derive(Default)]
pub struct EchoHost {
    next_stack: u64,
    live_stacks: u64,
}

impl ScriptHost for EchoHost {
    fn new_stack(&mut self, _conn_id: u64) -> Result<StackId, HostError> {
        self.next_stack += 1;
        self.live_stacks += 1;
        Ok(StackId(self.next_stack))
    }

    fn release_stack(&mut self, _stack: StackId) {
        self.live_stacks = self.live_stacks.saturating_sub(1);
    }

    fn call(
        &mut self,
        _stack: StackId,
        func: &str,
        args: &[Value],
    ) -> Result<Vec<Action>, HostError> {
        let actions = match args {
            [_conn, Value::Int(tag), payload] => {
                let payload = marshal_payload(payload);
                vec![Action::SendPacket { tag: *tag as u32, payload }]
            }
            // Raw stream reads and (payload, peer) datagrams echo unframed.
            [_conn, payload @ (Value::Bytes(_) | Value::Object(_))]
            | [_conn, payload @ Value::Bytes(_), Value::Bytes(_)] => {
                vec![Action::SendRaw(marshal_payload(payload))]
            }
            _ => Vec::new(),
        };
        debug!(func, n_actions = actions.len(), "echo host call");
        Ok(actions)
    }

    fn hook(&mut self, hook: HostHook) {
        debug!(?hook, live_stacks = self.live_stacks, "echo host hook");
    }
}

fn marshal_payload(payload: &Value) -> Vec<u8> {
    match payload {
        Value::Bytes(b) => b.clone(),
        // No document codec configured: echo the debug rendering.
        other => format!("{other:?}").into_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echoes_command_frames_with_tag() {
        let mut host = EchoHost::default();
        let stack = host.new_stack(9).unwrap();
        let actions = host
            .call(stack, "on_data", &[Value::Int(9), Value::Int(3), Value::Bytes(b"Hi!".to_vec())])
            .unwrap();
        assert_eq!(actions, vec![Action::SendPacket { tag: 3, payload: b"Hi!".to_vec() }]);
    }

    #[test]
    fn echoes_raw_bytes_without_framing() {
        let mut host = EchoHost::default();
        let stack = host.new_stack(1).unwrap();
        let actions =
            host.call(stack, "on_data", &[Value::Int(1), Value::Bytes(b"ping".to_vec())]).unwrap();
        assert_eq!(actions, vec![Action::SendRaw(b"ping".to_vec())]);
    }

    #[test]
    fn connect_shaped_calls_return_nothing() {
        let mut host = EchoHost::default();
        let stack = host.new_stack(1).unwrap();
        assert!(host.call(stack, "on_connect", &[Value::Int(1)]).unwrap().is_empty());
    }
}
