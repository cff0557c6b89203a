//! The boundary between the server core and an embedded scripting runtime.
//!
//! The core never links a script engine. It talks to one [`ScriptHost`] per
//! worker thread through this crate: one opaque stack per connection, a fixed
//! argument schema ([`Value`]), and a reply schema ([`Action`]). Engine
//! implementations live outside the workspace; [`hosts`] carries the built-in
//! ones used for wiring and tests.

mod host;
pub mod hosts;
mod value;

pub use host::{Action, HostError, HostFactory, HostHook, ScriptHost, StackId};
pub use value::{ObjectBuilder, Value};
