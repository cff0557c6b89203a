use std::{path::PathBuf, process, sync::Arc};

use clap::Parser;
use gantry::{
    Runtime,
    config::Config,
    log::{self, Verbosity},
};
use gantry_script::{
    HostFactory, ScriptHost,
    hosts::{EchoHost, NullHost},
};
use gantry_utils::spawn_named;
use signal_hook::{
    consts::{SIGINT, SIGTERM, SIGTSTP, SIGUSR1, SIGUSR2},
    iterator::Signals,
};
use tracing::{error, warn};

/// Scriptable multi-protocol application server.
#[derive(Parser)]
#[command(name = "gantry-server", version)]
struct Args {
    /// Configuration file.
    #[arg(short = 'c', long, default_value = "etc/gantry-server.json")]
    config: PathBuf,
    /// PID file.
    #[arg(short = 'p', long, default_value = "/var/run/gantry-server.pid")]
    pid_file: PathBuf,
    /// Independent mode: do not connect to the manager process.
    #[arg(short = 'i', long)]
    independent: bool,
    /// Trace-level logging.
    #[arg(short = 'v', long, conflicts_with = "silent")]
    verbose: bool,
    /// Errors only.
    #[arg(short = 's', long)]
    silent: bool,
}

/// Engines compiled into this binary. Embedders with a real scripting
/// runtime build their own main and pass their factory to [`Runtime::new`].
fn host_factory(engine: &str) -> Option<HostFactory> {
    match engine {
        "echo" => Some(Arc::new(|_| Box::new(EchoHost::default()) as Box<dyn ScriptHost>)),
        "null" => Some(Arc::new(|_| Box::new(NullHost::default()) as Box<dyn ScriptHost>)),
        _ => None,
    }
}

fn main() {
    let args = Args::parse();
    let verbosity = match (args.verbose, args.silent) {
        (true, _) => Verbosity::Verbose,
        (_, true) => Verbosity::Silent,
        _ => Verbosity::Normal,
    };

    // Config and log failures happen before the subscriber exists: one line
    // to stderr, nonzero exit.
    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("gantry-server: {e}");
            process::exit(1);
        }
    };

    let log_file = match &config.core.log_dir {
        Some(dir) => {
            let name = format!("{}.log", config.core.app_name);
            match log::init_file(dir, &name, verbosity) {
                Ok(file) => Some(file),
                Err(e) => {
                    eprintln!("gantry-server: open log: {e}");
                    process::exit(1);
                }
            }
        }
        None => {
            log::init_stderr(verbosity);
            None
        }
    };

    let Some(hosts) = host_factory(&config.core.script.engine) else {
        eprintln!("gantry-server: unknown script engine {:?}", config.core.script.engine);
        process::exit(1);
    };

    if let Err(e) = std::fs::write(&args.pid_file, format!("{}\n", process::id())) {
        warn!(path = %args.pid_file.display(), %e, "cannot write pid file");
    }

    let mut runtime = Runtime::new(config, hosts).independent(args.independent);
    if let Some(file) = log_file {
        runtime = runtime.with_log_file(file);
    }
    let controller = runtime.controller();

    // Signal → admin action mapping lives here; the core has no signal
    // awareness.
    match Signals::new([SIGTERM, SIGINT, SIGTSTP, SIGUSR1, SIGUSR2]) {
        Ok(mut signals) => {
            let controller = controller.clone();
            let spawned = spawn_named("gantry-signals", move || {
                for signal in signals.forever() {
                    match signal {
                        SIGTERM | SIGINT => controller.shutdown(),
                        SIGTSTP => controller.reload_script(),
                        SIGUSR1 => controller.reopen_logs(),
                        SIGUSR2 => controller.dump_status(),
                        _ => {}
                    }
                }
            });
            if let Err(e) = spawned {
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
    process::exit(status);
}
