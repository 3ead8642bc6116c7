//! Entry point for front-ends: owns the shared dispatcher and exposes the
//! operations an operator console needs.

use crate::config::AppConfig;
use crate::dispatcher::Dispatcher;
use crate::error::NanonisError;
use crate::nanonis::{ConnectionConfig, TcpTransport, Transport};
use crate::registry::{CommandSources, InterfaceInfo, Registry};
use crate::script::{Script, ScriptEvent, ScriptHandle, ScriptRunner};
use crate::types::DecodedResponse;
use crossbeam_channel::Sender;
use log::{error, info};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Z-controller setpoint together with the tip bias
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Setpoint {
    /// Current setpoint in A
    pub current: f64,
    /// Bias in V
    pub bias: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TipAxis {
    X,
    Y,
    Z,
}

impl TipAxis {
    fn offset_command(self) -> &'static str {
        match self {
            TipAxis::X => "addX",
            TipAxis::Y => "addY",
            TipAxis::Z => "addZ",
        }
    }
}

pub struct Console<T: Transport> {
    dispatcher: Arc<Mutex<Dispatcher<T>>>,
}

impl Console<TcpTransport> {
    /// Build a TCP console from configuration. Catalogs are read from disk.
    pub fn from_config(config: &AppConfig) -> Result<Self, NanonisError> {
        let registry = Registry::load(&CommandSources::from(&config.commands))?;
        let transport = TcpTransport::with_config(ConnectionConfig::from(&config.connection));
        let dispatcher = Dispatcher::new(Arc::new(registry), transport)
            .with_mode(config.dispatch.mode)
            .with_max_response_bytes(config.dispatch.max_response_bytes);
        Ok(Self::new(dispatcher))
    }
}

impl<T: Transport + 'static> Console<T> {
    pub fn new(dispatcher: Dispatcher<T>) -> Self {
        Self {
            dispatcher: Arc::new(Mutex::new(dispatcher)),
        }
    }

    /// Shared handle to the dispatcher, as used by script workers
    pub fn dispatcher(&self) -> Arc<Mutex<Dispatcher<T>>> {
        Arc::clone(&self.dispatcher)
    }

    /// Connect to the instrument; failures are logged and reported as `false`
    pub fn connect(&self, host: &str, port: u16) -> bool {
        match self.dispatcher.lock().connect(host, port) {
            Ok(()) => {
                info!("Connected to Nanonis at {host}:{port}");
                true
            }
            Err(e) => {
                error!("{e}");
                false
            }
        }
    }

    /// Returns whether a connection was open
    pub fn disconnect(&self) -> bool {
        let mut dispatcher = self.dispatcher.lock();
        let was_connected = dispatcher.is_connected();
        dispatcher.disconnect();
        if was_connected {
            info!("Disconnected from Nanonis");
        }
        was_connected
    }

    pub fn is_connected(&self) -> bool {
        self.dispatcher.lock().is_connected()
    }

    pub fn execute<S: AsRef<str>>(
        &self,
        alias: &str,
        args: &[S],
    ) -> Result<DecodedResponse, NanonisError> {
        self.dispatcher.lock().execute(alias, args)
    }

    pub fn list_external_interfaces(&self) -> Vec<InterfaceInfo> {
        self.dispatcher
            .lock()
            .registry()
            .interfaces()
            .iter()
            .map(|i| i.info())
            .collect()
    }

    /// Completion candidates for a script editor
    pub fn command_names(&self) -> Vec<String> {
        self.dispatcher.lock().registry().aliases()
    }

    pub fn run_script(
        &self,
        text: &str,
        events: Sender<ScriptEvent>,
    ) -> Result<ScriptHandle, NanonisError> {
        let script = Script::parse(text)?;
        ScriptRunner::spawn(script, self.dispatcher(), events)
    }

    pub fn run_script_with_cancel(
        &self,
        text: &str,
        events: Sender<ScriptEvent>,
        cancel: Arc<AtomicBool>,
    ) -> Result<ScriptHandle, NanonisError> {
        let script = Script::parse(text)?;
        ScriptRunner::spawn_with_cancel(script, self.dispatcher(), events, cancel)
    }

    pub fn setpoint(&self) -> Result<Setpoint, NanonisError> {
        let mut dispatcher = self.dispatcher.lock();
        let current = dispatcher
            .call_builtin::<&str>("getCurrent", &[])?
            .f64_field("Z-Controller setpoint")?;
        let bias = dispatcher
            .call_builtin::<&str>("getBias", &[])?
            .f64_field("Bias value (V)")?;
        Ok(Setpoint { current, bias })
    }

    pub fn feedback_enabled(&self) -> Result<bool, NanonisError> {
        let status = self
            .dispatcher
            .lock()
            .call_builtin::<&str>("getFeedback", &[])?
            .f64_field("Z-Controller status")?;
        Ok(status == 1.0)
    }

    /// Flip the Z-controller on/off and return the new state
    pub fn toggle_feedback(&self) -> Result<bool, NanonisError> {
        let enable = !self.feedback_enabled()?;
        let status = if enable { "1" } else { "0" };
        self.dispatcher.lock().call_builtin("setFeedback", &[status])?;
        info!("Z-controller {}", if enable { "on" } else { "off" });
        Ok(enable)
    }

    /// Relative tip move along one axis, in metres
    pub fn move_tip(&self, axis: TipAxis, delta: f64) -> Result<(), NanonisError> {
        let delta = delta.to_string();
        self.dispatcher
            .lock()
            .execute(axis.offset_command(), &[delta.as_str()])?;
        Ok(())
    }
}
