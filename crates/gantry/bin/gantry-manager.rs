use std::{collections::HashMap, path::PathBuf, process, sync::Arc};

use clap::Parser;
use gantry::{
    Runtime,
    config::{Config, CoreConfig, ScriptConfig, ServerSpec},
    control::{self, Command},
    log::{self, Verbosity},
};
use gantry_net::endpoint::{Family, Kind};
use gantry_script::{Action, HostError, HostHook, ScriptHost, StackId, Value};
use gantry_utils::spawn_named;
use signal_hook::{
    consts::{SIGINT, SIGTERM, SIGUSR2},
    iterator::Signals,
};
use tracing::{error, info, warn};

const MANAGER_MAX_PACKET: usize = 64 * 1024;

/// Control center: accepts `gantry-ctl` commands and relays them to every
/// connected server process.
#[derive(Parser)]
#[command(name = "gantry-manager", version)]
struct Args {
    /// Control socket path the server processes dial.
    #[arg(long, default_value = control::DEFAULT_MANAGER_SOCKET)]
    socket: PathBuf,
    /// TCP control listener address.
    #[arg(short = 'a', long, default_value = "")]
    addr: String,
    /// TCP control listener port.
    #[arg(short = 'p', long, default_value_t = 65530)]
    port: u16,
    /// PID file.
    #[arg(long, default_value = "/var/run/gantry-manager.pid")]
    pid_file: PathBuf,
    /// Trace-level logging.
    #[arg(short = 'v', long)]
    verbose: bool,
}

/// Native host for the control plane: no script engine, the handlers are
/// Rust. Runs on the manager's single worker, so `Broadcast` reaches every
/// connected peer.
#[derive(Default)]
struct ManagerHost {
    next_stack: u64,
    /// stack → conn id, as handed out by `new_stack`.
    conns: HashMap<StackId, u64>,
    /// conn id → app name, populated by `Hello`.
    servers: HashMap<u64, String>,
}

impl ManagerHost {
    fn on_command(&mut self, conn: u64, tag: u32, payload: &[u8]) -> Vec<Action> {
        match Command::from_tag(tag) {
            Some(Command::Hello) => {
                let app = serde_json::from_slice::<serde_json::Value>(payload)
                    .ok()
                    .and_then(|v| v.get("app").and_then(|a| a.as_str()).map(str::to_owned))
                    .unwrap_or_else(|| "unknown".to_owned());
                info!(conn, %app, "server registered");
                self.servers.insert(conn, app);
                vec![Action::SendPacket {
                    tag: Command::Hello.tag(),
                    payload: control::ack_payload("hello"),
                }]
            }
            Some(Command::Status) => {
                let roster: Vec<_> = self
                    .servers
                    .iter()
                    .map(|(conn, app)| serde_json::json!({ "conn": conn, "app": app }))
                    .collect();
                let payload = serde_json::json!({ "servers": roster }).to_string().into_bytes();
                vec![Action::SendPacket { tag: Command::Status.tag(), payload }]
            }
            Some(cmd @ (Command::Reload | Command::ReopenLogs | Command::Shutdown)) => {
                info!(?cmd, "relaying to connected servers");
                vec![
                    Action::Broadcast { tag: cmd.tag(), payload: b"{}".to_vec() },
                    Action::SendPacket {
                        tag: cmd.tag(),
                        payload: control::ack_payload(&format!("{cmd:?}").to_lowercase()),
                    },
                ]
            }
            None => {
                warn!(conn, tag, "unknown control command");
                Vec::new()
            }
        }
    }
}

impl ScriptHost for ManagerHost {
    fn new_stack(&mut self, conn_id: u64) -> Result<StackId, HostError> {
        self.next_stack += 1;
        let stack = StackId(self.next_stack);
        self.conns.insert(stack, conn_id);
        Ok(stack)
    }

    fn release_stack(&mut self, stack: StackId) {
        if let Some(conn) = self.conns.remove(&stack)
            && self.servers.remove(&conn).is_some()
        {
            info!(conn, "server unregistered");
        }
    }

    fn call(
        &mut self,
        stack: StackId,
        _func: &str,
        args: &[Value],
    ) -> Result<Vec<Action>, HostError> {
        let Some(&conn) = self.conns.get(&stack) else {
            return Err(HostError::NoSuchStack(stack));
        };
        match args {
            [Value::Int(_), Value::Int(tag), payload] => {
                let payload = payload.as_bytes().unwrap_or_default().to_vec();
                Ok(self.on_command(conn, *tag as u32, &payload))
            }
            _ => Ok(Vec::new()),
        }
    }

    fn hook(&mut self, hook: HostHook) {
        if hook == HostHook::Exit {
            info!(servers = self.servers.len(), "manager host exiting");
        }
    }
}

fn control_spec(name: &str, host: String, port: u16, family: Family) -> ServerSpec {
    ServerSpec {
        name: name.to_owned(),
        host,
        port,
        family,
        kind: Kind::Stream,
        max_packet_len: MANAGER_MAX_PACKET,
        on_connect: Some("on_connect".to_owned()),
        on_close: Some("on_close".to_owned()),
        on_data: Some("on_data".to_owned()),
        ..ServerSpec::default()
    }
}

fn main() {
    let args = Args::parse();
    log::init_stderr(if args.verbose { Verbosity::Verbose } else { Verbosity::Normal });

    let config = Config {
        core: CoreConfig {
            app_name: "gantry-manager".to_owned(),
            // The control plane is single-worker: every peer lives on one
            // event loop and broadcast relaying stays lock-free.
            workers: 1,
            script: ScriptConfig { engine: "native".to_owned(), identifier: None },
            ..CoreConfig::default()
        },
        servers: vec![
            control_spec(
                "control-local",
                args.socket.to_string_lossy().into_owned(),
                0,
                Family::Local,
            ),
            control_spec("control-tcp", args.addr.clone(), args.port, Family::Any),
        ],
    };
    if let Err(e) = config.validate() {
        eprintln!("gantry-manager: {e}");
        process::exit(1);
    }

    if let Err(e) = std::fs::write(&args.pid_file, format!("{}\n", process::id())) {
        warn!(path = %args.pid_file.display(), %e, "cannot write pid file");
    }

    let runtime = Runtime::new(
        config,
        Arc::new(|_| Box::new(ManagerHost::default()) as Box<dyn ScriptHost>),
    )
    .independent(true);
    let controller = runtime.controller();

    match Signals::new([SIGTERM, SIGINT, SIGUSR2]) {
        Ok(mut signals) => {
            let controller = controller.clone();
            if let Err(e) = spawn_named("gantry-signals", move || {
                for signal in signals.forever() {
                    match signal {
                        SIGTERM | SIGINT => controller.shutdown(),
                        SIGUSR2 => controller.dump_status(),
                        _ => {}
                    }
                }
            }) {
                error!(%e, "cannot spawn signal thread");
            }
        }
        Err(e) => error!(%e, "cannot install signal handlers"),
    }

    let status = match runtime.run() {
        Ok(()) => 0,
        Err(e) => {
            error!(%e, "fatal");
            1
        }
    };
    let _ = std::fs::remove_file(&args.pid_file);
    let _ = std::fs::remove_file(&args.socket);
    process::exit(status);
}
