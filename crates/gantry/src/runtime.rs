use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use gantry_net::{NetError, connector, endpoint::Endpoint, listener};
use gantry_script::HostFactory;
use gantry_utils::spawn_named;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    connection::ServerPolicy,
    controller::Controller,
    dispatch::{BytesCodec, Dispatcher, PayloadCodec},
    log::LogFile,
    status::{ConnDirectory, Stats},
    worker::Worker,
};

/// State every worker can reach: counters, the connection registry, admin
/// flags, and the few config values the hot paths read.
pub struct Shared {
    pub stats: Arc<Stats>,
    pub directory: ConnDirectory,
    pub controller: Controller,
    pub hex_dump_input: bool,
    pub hex_dump_output: bool,
    pub drain_deadline: Duration,
    pub heartbeat_stride: Duration,
    pub socket_buf_size: Option<usize>,
    pub log: Option<LogFile>,
    pub app_name: String,
    next_conn_id: AtomicU64,
}

impl Shared {
    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Debug, Error)]
pub enum BootError {
    #[error(transparent)]
    Net(#[from] NetError),
    #[error("boot: {0}")]
    Io(#[from] std::io::Error),
}

/// Assembles the process and runs it to completion.
///
/// Bring-up order: shared state, then the sub workers, then the main worker,
/// then listeners and the manager channel onto the main worker — so by the
/// time an accept can happen every adoption target exists. `run` parks the
/// calling thread as the main worker until shutdown.
pub struct Runtime {
    config: Config,
    hosts: HostFactory,
    codec: Arc<dyn PayloadCodec>,
    controller: Controller,
    log: Option<LogFile>,
    independent: bool,
}

impl Runtime {
    pub fn new(config: Config, hosts: HostFactory) -> Self {
        Self {
            config,
            hosts,
            codec: Arc::new(BytesCodec),
            controller: Controller::default(),
            log: None,
            independent: false,
        }
    }

    /// Replace the payload codec (the default passes raw bytes through).
    pub fn with_codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Hand over the log file so `reopen_logs` has something to reopen.
    pub fn with_log_file(mut self, log: LogFile) -> Self {
        self.log = Some(log);
        self
    }

    /// Do not dial the manager control socket.
    pub fn independent(mut self, independent: bool) -> Self {
        self.independent = independent;
        self
    }

    /// Admin handle, valid before and during `run`.
    pub fn controller(&self) -> Controller {
        self.controller.clone()
    }

    pub fn run(self) -> Result<(), BootError> {
        let worker_count = self.config.worker_count();
        let stats = Arc::new(Stats::default());
        let shared = Arc::new(Shared {
            stats: Arc::clone(&stats),
            directory: ConnDirectory::default(),
            controller: self.controller.clone(),
            hex_dump_input: self.config.core.hex_dump_input,
            hex_dump_output: self.config.core.hex_dump_output,
            drain_deadline: self.config.core.drain_deadline,
            heartbeat_stride: self.config.core.heartbeat_stride,
            socket_buf_size: self.config.core.socket_buf_size,
            log: self.log,
            app_name: self.config.core.app_name.clone(),
            next_conn_id: AtomicU64::new(0),
        });
        info!(
            app = %shared.app_name,
            workers = worker_count,
            servers = self.config.servers.len(),
            "runtime starting"
        );

        let tick = self.config.core.tick;
        let mut handles = Vec::new();
        let mut joins = Vec::new();
        for id in 1..worker_count as u16 {
            let dispatcher =
                Dispatcher::new((self.hosts)(id), Arc::clone(&self.codec), Arc::clone(&stats));
            let (mut worker, handle) = Worker::new(id, tick, Arc::clone(&shared), dispatcher)?;
            handles.push(handle);
            joins.push(spawn_named(format!("gantry-worker-{id}"), move || worker.run())?);
        }

        let dispatcher =
            Dispatcher::new((self.hosts)(0), Arc::clone(&self.codec), Arc::clone(&stats));
        let (mut main_worker, _) = Worker::new(0, tick, Arc::clone(&shared), dispatcher)?;
        main_worker.set_peers(handles.clone());

        if self.config.servers.is_empty() {
            warn!("no servers configured");
        }
        for spec in &self.config.servers {
            let policy = ServerPolicy::from_spec(spec, self.config.core.outbound_high_water);
            let bound_set = listener::bind_all(
                &spec.endpoint(),
                listener::DEFAULT_BACKLOG,
                shared.socket_buf_size,
            )?;
            for bound in bound_set {
                main_worker.add_listener(bound, Arc::clone(&policy))?;
            }
        }

        if !self.independent {
            let endpoint =
                Endpoint::local(self.config.core.manager_socket.to_string_lossy().into_owned());
            let socket = connector::connect(&endpoint, shared.socket_buf_size)?;
            main_worker.add_control_link(socket)?;
            main_worker.set_control_endpoint(endpoint);
        }

        main_worker.run();

        // Main worker exited (shutdown, or a fatal poll error): make sure
        // every sub worker sees the flag and gets out of its poll.
        shared.controller.shutdown();
        for handle in &handles {
            handle.wake();
        }
        for join in joins {
            if join.join().is_err() {
                error!("worker panicked during shutdown");
            }
        }
        info!("runtime stopped");
        Ok(())
    }
}
