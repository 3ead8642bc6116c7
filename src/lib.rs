pub mod config;
pub mod console;
pub mod dispatcher;
pub mod error;
pub mod event_log;
pub mod fit;
pub mod nanonis;
pub mod registry;
pub mod script;
pub mod special;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use crate::config::{AppConfig, load_config, load_config_or_default};
pub use console::{Console, Setpoint, TipAxis};
pub use dispatcher::{DispatchMode, Dispatcher};
pub use error::NanonisError;
pub use event_log::{EventLog, EventRecord};
pub use nanonis::{ConnectionConfig, ConnectionState, Protocol, TcpTransport, Transport};
pub use registry::{CommandSources, InterfaceInfo, Registry, Resolved};
pub use script::{RunState, RunSummary, Script, ScriptEvent, ScriptHandle, ScriptLine, ScriptRunner};
pub use special::SpecialCommand;
pub use types::{DecodedResponse, NanonisValue, WireType};
