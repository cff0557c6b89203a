use std::{io, thread};

/// Spawn an OS thread with a name visible in tooling (top -H, gdb).
///
/// Thread names are capped at 15 bytes on Linux; longer names are truncated
/// by the kernel, not rejected here.
pub fn spawn_named<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new().name(name.into()).spawn(f)
}
