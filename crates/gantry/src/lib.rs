//! The gantry server core: connection lifecycle and message dispatch.
//!
//! Operators declare listeners and script handlers in a config file. The
//! runtime binds the listeners, frames inbound bytes into application
//! messages under each listener's framing mode, dispatches every message to
//! a scripted handler on the connection's owning worker, and writes framed
//! replies back. A manager process coordinates server processes over a local
//! control socket; `gantry-ctl` talks to the manager.

pub mod config;
pub mod connection;
pub mod control;
pub mod controller;
pub mod dispatch;
pub mod log;
pub mod runtime;
pub mod status;
pub mod worker;

pub use config::Config;
pub use controller::Controller;
pub use runtime::{BootError, Runtime};
