//! End-to-end scenarios over real sockets: a scripted echo server, admission
//! caps, protocol-violation closes, heartbeat reaping, graceful shutdown,
//! and the manager control channel.

use std::{
    io::{Read, Write},
    net::TcpStream,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use gantry::{
    Controller, Runtime,
    config::{Config, CoreConfig, ServerSpec},
    control::Command,
    runtime::BootError,
};
use gantry_net::{
    endpoint::{Family, Kind},
    framing::{HEADER_SIZE, encode_packet_vec},
};
use gantry_script::{
    Action, HostError, HostFactory, ScriptHost, StackId, Value, hosts::EchoHost,
};

// ----------------------------------------------------------------------
// Harness

fn core() -> CoreConfig {
    CoreConfig {
        app_name: "test".to_owned(),
        workers: 2,
        tick: Duration::from_millis(100),
        heartbeat_stride: Duration::from_millis(100),
        drain_deadline: Duration::from_secs(2),
        ..CoreConfig::default()
    }
}

fn packet_server(name: &str, port: u16) -> ServerSpec {
    ServerSpec {
        name: name.to_owned(),
        host: "127.0.0.1".to_owned(),
        port,
        family: Family::Inet,
        on_connect: Some("on_connect".to_owned()),
        on_close: Some("on_close".to_owned()),
        on_data: Some("on_data".to_owned()),
        on_error: Some("on_error".to_owned()),
        ..ServerSpec::default()
    }
}

fn echo_factory() -> HostFactory {
    Arc::new(|_| Box::new(EchoHost::default()) as Box<dyn ScriptHost>)
}

fn start(
    config: Config,
    hosts: HostFactory,
) -> (Controller, thread::JoinHandle<Result<(), BootError>>) {
    let runtime = Runtime::new(config, hosts).independent(true);
    let controller = runtime.controller();
    (controller, thread::spawn(move || runtime.run()))
}

fn connect_retry(port: u16) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => {
                stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
                return stream;
            }
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
            Err(e) => panic!("server never came up on {port}: {e}"),
        }
    }
}

/// The peer must observe an orderly close (or RST) — a read timeout fails.
fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 1];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("expected close, read {n} bytes"),
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {}
        Err(e) => panic!("expected close, got {e}"),
    }
}

fn read_frame<S: Read>(stream: &mut S) -> std::io::Result<(u32, Vec<u8>)> {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header)?;
    let len = u32::from_be_bytes(header[..4].try_into().unwrap()) as usize;
    let tag = u32::from_be_bytes(header[4..8].try_into().unwrap());
    let mut payload = vec![0u8; len - HEADER_SIZE];
    stream.read_exact(&mut payload)?;
    Ok((tag, payload))
}

/// Accept on a fake-manager socket with a deadline instead of hanging the
/// test run on a missing dial.
fn accept_within(
    listener: &std::os::unix::net::UnixListener,
    deadline: Duration,
) -> std::os::unix::net::UnixStream {
    listener.set_nonblocking(true).unwrap();
    let end = Instant::now() + deadline;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false).unwrap();
                stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
                return stream;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock && Instant::now() < end => {
                thread::sleep(Duration::from_millis(20));
            }
            Err(e) => panic!("manager accept failed: {e}"),
        }
    }
}

/// Records every host interaction as `"<event>:<conn>"`, echoing data calls.
struct RecordingHost {
    events: Arc<Mutex<Vec<String>>>,
    stacks: std::collections::HashMap<StackId, u64>,
    next: u64,
}

impl RecordingHost {
    fn factory(events: Arc<Mutex<Vec<String>>>) -> HostFactory {
        Arc::new(move |_| {
            Box::new(RecordingHost {
                events: Arc::clone(&events),
                stacks: std::collections::HashMap::new(),
                next: 0,
            }) as Box<dyn ScriptHost>
        })
    }
}

impl ScriptHost for RecordingHost {
    fn new_stack(&mut self, conn_id: u64) -> Result<StackId, HostError> {
        self.next += 1;
        let stack = StackId(self.next);
        self.stacks.insert(stack, conn_id);
        Ok(stack)
    }

    fn release_stack(&mut self, stack: StackId) {
        if let Some(conn) = self.stacks.remove(&stack) {
            self.events.lock().unwrap().push(format!("release:{conn}"));
        }
    }

    fn call(
        &mut self,
        _stack: StackId,
        func: &str,
        args: &[Value],
    ) -> Result<Vec<Action>, HostError> {
        let conn = args.first().and_then(Value::as_int).unwrap_or(-1);
        self.events.lock().unwrap().push(format!("{func}:{conn}"));
        Ok(match args {
            [_, Value::Int(tag), Value::Bytes(payload)] => {
                vec![Action::SendPacket { tag: *tag as u32, payload: payload.clone() }]
            }
            _ => Vec::new(),
        })
    }
}

fn events_matching(events: &Arc<Mutex<Vec<String>>>, prefix: &str) -> Vec<String> {
    events.lock().unwrap().iter().filter(|e| e.starts_with(prefix)).cloned().collect()
}

// ----------------------------------------------------------------------
// Scenarios

#[test]
fn scripted_echo_single_and_split_frames() {
    let config = Config { core: core(), servers: vec![packet_server("echo", 47401)] };
    let (controller, join) = start(config, echo_factory());

    let mut client = connect_retry(47401);

    // One frame split at an awkward byte boundary.
    client.write_all(&[0, 0, 0, 11, 0, 0, 0, 1, b'H', b'i']).unwrap();
    client.flush().unwrap();
    thread::sleep(Duration::from_millis(30));
    client.write_all(&[b'!']).unwrap();

    let (tag, payload) = read_frame(&mut client).expect("no echo");
    assert_eq!((tag, payload.as_slice()), (1, b"Hi!".as_slice()));

    controller.shutdown();
    join.join().unwrap().unwrap();
}

#[test]
fn coalesced_frames_dispatch_in_order() {
    let config = Config { core: core(), servers: vec![packet_server("echo", 47402)] };
    let (controller, join) = start(config, echo_factory());

    let mut client = connect_retry(47402);
    let mut wire = encode_packet_vec(2, b"AB");
    wire.extend_from_slice(&encode_packet_vec(2, b"CD"));
    client.write_all(&wire).unwrap();

    let (_, first) = read_frame(&mut client).expect("no first echo");
    let (_, second) = read_frame(&mut client).expect("no second echo");
    assert_eq!(first, b"AB");
    assert_eq!(second, b"CD");

    controller.shutdown();
    join.join().unwrap().unwrap();
}

#[test]
fn oversize_frame_closes_without_dispatch() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut spec = packet_server("strict", 47403);
    spec.max_packet_len = 1024;
    let config = Config { core: core(), servers: vec![spec] };
    let (controller, join) = start(config, RecordingHost::factory(Arc::clone(&events)));

    let mut client = connect_retry(47403);
    // Header declares 0x1001 bytes, one over the limit.
    client.write_all(&[0, 0, 0x10, 0x01, 0, 0, 0, 1]).unwrap();

    // Peer observes a close with no response bytes.
    assert_closed(&mut client);

    controller.shutdown();
    join.join().unwrap().unwrap();

    assert!(events_matching(&events, "on_data").is_empty(), "no data callback may fire");
    assert_eq!(events_matching(&events, "on_error").len(), 1);
    assert_eq!(events_matching(&events, "on_close").len(), 1);
}

#[test]
fn admission_cap_closes_excess_client_without_callbacks() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut spec = packet_server("capped", 47404);
    spec.max_clients = 2;
    let config = Config { core: core(), servers: vec![spec] };
    let (controller, join) = start(config, RecordingHost::factory(Arc::clone(&events)));

    let mut first = connect_retry(47404);
    let mut second = connect_retry(47404);
    thread::sleep(Duration::from_millis(100));
    let mut third = connect_retry(47404);

    // Third is closed immediately, no handler fired for it.
    assert_closed(&mut third);

    // The two admitted clients still work.
    for client in [&mut first, &mut second] {
        client.write_all(&encode_packet_vec(1, b"ok")).unwrap();
        let (_, payload) = read_frame(client).expect("admitted client lost service");
        assert_eq!(payload, b"ok");
    }
    assert_eq!(events_matching(&events, "on_connect").len(), 2);

    controller.shutdown();
    join.join().unwrap().unwrap();
}

#[test]
fn heartbeat_reaper_closes_idle_connection() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut spec = packet_server("reaped", 47405);
    spec.heartbeat_ttl = Some(Duration::from_millis(300));
    let config = Config { core: core(), servers: vec![spec] };
    let (controller, join) = start(config, RecordingHost::factory(Arc::clone(&events)));

    let mut client = connect_retry(47405);
    client.write_all(&encode_packet_vec(1, b"hb")).unwrap();
    let _ = read_frame(&mut client).expect("no echo");

    // Stay idle past the TTL; the reaper closes us within a stride.
    assert_closed(&mut client);

    controller.shutdown();
    join.join().unwrap().unwrap();
    assert_eq!(events_matching(&events, "on_close").len(), 1);
    assert_eq!(events_matching(&events, "release").len(), 1);
}

#[test]
fn callbacks_are_ordered_and_close_fires_once() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let config = Config { core: core(), servers: vec![packet_server("ordered", 47406)] };
    let (controller, join) = start(config, RecordingHost::factory(Arc::clone(&events)));

    let mut client = connect_retry(47406);
    client.write_all(&encode_packet_vec(9, b"one")).unwrap();
    let _ = read_frame(&mut client).expect("no echo");
    drop(client);

    // Give the close a moment to land, then stop.
    let deadline = Instant::now() + Duration::from_secs(5);
    while events_matching(&events, "release").is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    controller.shutdown();
    join.join().unwrap().unwrap();

    let log = events.lock().unwrap().clone();
    let conn = log
        .first()
        .and_then(|e| e.strip_prefix("on_connect:"))
        .expect("first event must be on_connect")
        .to_owned();
    assert_eq!(
        log,
        vec![
            format!("on_connect:{conn}"),
            format!("on_data:{conn}"),
            format!("on_close:{conn}"),
            format!("release:{conn}"),
        ]
    );
}

#[test]
fn graceful_shutdown_fires_close_for_every_connection() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let config = Config { core: core(), servers: vec![packet_server("drain", 47407)] };
    let (controller, join) = start(config, RecordingHost::factory(Arc::clone(&events)));

    let mut clients: Vec<TcpStream> = (0..5).map(|_| connect_retry(47407)).collect();
    for client in &mut clients {
        client.write_all(&encode_packet_vec(1, b"hello")).unwrap();
        let _ = read_frame(client).expect("no echo");
    }

    controller.shutdown();
    join.join().unwrap().unwrap();

    assert_eq!(events_matching(&events, "on_close").len(), 5);
    assert_eq!(events_matching(&events, "release").len(), 5);
    for client in &mut clients {
        assert_closed(client);
    }
}

#[test]
fn datagram_listener_echoes_per_peer() {
    let mut spec = packet_server("dgram", 47409);
    spec.kind = Kind::Datagram;
    let config = Config { core: core(), servers: vec![spec] };
    let (controller, join) = start(config, echo_factory());

    let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    // The listener may not be bound yet; retry until the echo arrives.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut buf = [0u8; 64];
    let echoed = loop {
        client.send_to(b"ping", ("127.0.0.1", 47409)).unwrap();
        match client.recv_from(&mut buf) {
            Ok((n, _)) => break buf[..n].to_vec(),
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
            Err(e) => panic!("no datagram echo: {e}"),
        }
    };
    assert_eq!(echoed, b"ping");

    controller.shutdown();
    join.join().unwrap().unwrap();
}

#[test]
fn manager_channel_relays_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("manager.sock");
    let manager = std::os::unix::net::UnixListener::bind(&socket_path).unwrap();

    let mut config = Config { core: core(), servers: vec![packet_server("managed", 47408)] };
    config.core.manager_socket.clone_from(&socket_path);

    let runtime = Runtime::new(config, echo_factory());
    let join = thread::spawn(move || runtime.run());

    // Fake manager: expect the Hello announcement, then order a shutdown.
    let mut channel = accept_within(&manager, Duration::from_secs(5));
    let (tag, hello) = read_frame(&mut channel).expect("no hello frame");
    assert_eq!(tag, Command::Hello.tag());
    assert!(String::from_utf8_lossy(&hello).contains("test"));

    channel.write_all(&encode_packet_vec(Command::Shutdown.tag(), b"{}")).unwrap();

    join.join().unwrap().unwrap();
}

#[test]
fn manager_channel_redials_after_loss() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("manager.sock");
    let manager = std::os::unix::net::UnixListener::bind(&socket_path).unwrap();

    let mut config = Config { core: core(), servers: vec![packet_server("redial", 47410)] };
    config.core.manager_socket.clone_from(&socket_path);

    let runtime = Runtime::new(config, echo_factory());
    let join = thread::spawn(move || runtime.run());

    // Take the first channel's Hello, then kill the channel.
    let mut first = accept_within(&manager, Duration::from_secs(5));
    let (tag, _) = read_frame(&mut first).expect("no hello frame");
    assert_eq!(tag, Command::Hello.tag());
    drop(first);

    // The server redials on its retry cadence and announces itself again.
    let mut second = accept_within(&manager, Duration::from_secs(10));
    let (tag, _) = read_frame(&mut second).expect("no hello after redial");
    assert_eq!(tag, Command::Hello.tag());

    // The fresh channel still drives the admin surface.
    second.write_all(&encode_packet_vec(Command::Shutdown.tag(), b"{}")).unwrap();
    join.join().unwrap().unwrap();
}
