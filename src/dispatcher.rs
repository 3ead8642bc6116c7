use crate::error::NanonisError;
use crate::nanonis::protocol::{MAX_RESPONSE_SIZE, Protocol};
use crate::nanonis::Transport;
use crate::registry::{CommandSpec, ExternalCommandSpec, ExternalInterface, Registry, Resolved};
use crate::types::DecodedResponse;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Blocking pause used by `wait` and drift sampling
pub type Sleeper = Box<dyn FnMut(Duration) + Send>;

/// How unresolvable aliases and wrong argument counts are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Log a warning and return an empty response without sending anything
    #[default]
    Lenient,
    /// Fail with `UnknownCommand` / `InvalidArgument`
    Strict,
}

/// Resolves command aliases and drives the codec and transport.
///
/// Every call is a blocking request/reply round-trip; there is no local
/// cache of instrument state.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use aunis::{Dispatcher, Registry, TcpTransport};
///
/// let registry = Arc::new(Registry::bundled()?);
/// let mut dispatcher = Dispatcher::new(registry, TcpTransport::new());
/// dispatcher.connect("127.0.0.1", 6501)?;
///
/// dispatcher.execute("setBias", &["0.5"])?;
/// let bias = dispatcher.execute::<&str>("getBias", &[])?;
/// println!("{bias}");
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Dispatcher<T: Transport> {
    registry: Arc<Registry>,
    transport: T,
    mode: DispatchMode,
    max_response_bytes: usize,
    sleeper: Sleeper,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(registry: Arc<Registry>, transport: T) -> Self {
        Self {
            registry,
            transport,
            mode: DispatchMode::default(),
            max_response_bytes: MAX_RESPONSE_SIZE,
            sleeper: Box::new(std::thread::sleep),
        }
    }

    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_response_bytes(mut self, max_bytes: usize) -> Self {
        self.max_response_bytes = max_bytes;
        self
    }

    /// Replace the blocking sleep (tests use this to avoid real delays)
    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn connect(&mut self, host: &str, port: u16) -> Result<(), NanonisError> {
        self.transport.connect(host, port)
    }

    pub fn disconnect(&mut self) {
        self.transport.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Execute `alias` with textual arguments.
    ///
    /// Built-ins are resolved first, then special commands, then external
    /// interfaces.
    pub fn execute<S: AsRef<str>>(
        &mut self,
        alias: &str,
        args: &[S],
    ) -> Result<DecodedResponse, NanonisError> {
        let registry = Arc::clone(&self.registry);
        match registry.resolve(alias) {
            Resolved::BuiltIn(spec) => {
                if !self.arity_ok(alias, spec.arity(), args.len())? {
                    return Ok(DecodedResponse::new());
                }
                self.send_builtin(spec, args)
            }
            Resolved::Special(spec) => {
                if !self.arity_ok(alias, spec.args.len(), args.len())? {
                    return Ok(DecodedResponse::new());
                }
                debug!("Running special command {alias}");
                spec.command.run(self, args)
            }
            Resolved::External(interface, command) => {
                if !self.arity_ok(alias, command.args.len(), args.len())? {
                    return Ok(DecodedResponse::new());
                }
                self.send_external(interface, command, args)
            }
            Resolved::Unknown => match self.mode {
                DispatchMode::Lenient => {
                    warn!("Ignoring unknown command '{alias}'");
                    Ok(DecodedResponse::new())
                }
                DispatchMode::Strict => Err(NanonisError::UnknownCommand(alias.to_string())),
            },
        }
    }

    /// Built-in call made on behalf of a special command.
    ///
    /// Always strict: an orchestration step is never skipped silently.
    pub(crate) fn call_builtin<S: AsRef<str>>(
        &mut self,
        alias: &str,
        args: &[S],
    ) -> Result<DecodedResponse, NanonisError> {
        let registry = Arc::clone(&self.registry);
        let spec = registry
            .builtin(alias)
            .ok_or_else(|| NanonisError::UnknownCommand(alias.to_string()))?;
        self.send_builtin(spec, args)
    }

    pub(crate) fn pause(&mut self, duration: Duration) {
        (self.sleeper)(duration);
    }

    /// `Ok(false)` means: skip the command (lenient mode)
    fn arity_ok(&self, alias: &str, expected: usize, got: usize) -> Result<bool, NanonisError> {
        if expected == got {
            return Ok(true);
        }
        match self.mode {
            DispatchMode::Lenient => {
                warn!("Skipping {alias}: expected {expected} argument(s), got {got}");
                Ok(false)
            }
            DispatchMode::Strict => Err(NanonisError::InvalidArgument(format!(
                "{alias} expects {expected} argument(s), got {got}"
            ))),
        }
    }

    fn send_builtin<S: AsRef<str>>(
        &mut self,
        spec: &CommandSpec,
        args: &[S],
    ) -> Result<DecodedResponse, NanonisError> {
        let values = spec.bind(args)?;
        let request = Protocol::encode_request(&spec.wire_name, true, &values)?;

        debug!("=== COMMAND START: {} ({}) ===", spec.alias, spec.wire_name);
        self.transport.send(&request)?;
        let reply = self.transport.receive(self.max_response_bytes)?;
        let response = Protocol::decode_response(&reply, &spec.response)?;
        debug!("=== COMMAND SUCCESS: {} === {}", spec.wire_name, response);

        Ok(response)
    }

    fn send_external<S: AsRef<str>>(
        &mut self,
        interface: &ExternalInterface,
        command: &ExternalCommandSpec,
        args: &[S],
    ) -> Result<DecodedResponse, NanonisError> {
        let text = std::iter::once(command.wire_name.as_str())
            .chain(args.iter().map(|a| a.as_ref()))
            .collect::<Vec<_>>()
            .join(" ");
        debug!("External {} <- {text:?}", interface.name);

        let reply = self
            .transport
            .call_once(&interface.host, interface.port, text.as_bytes())
            .map_err(|e| NanonisError::ExternalUnreachable {
                interface: interface.name.clone(),
                message: e.to_string(),
            })?;

        let reply = String::from_utf8_lossy(&reply)
            .trim_end_matches(['\0', '\r', '\n'])
            .to_string();
        if reply.is_empty() {
            return Ok(DecodedResponse::new());
        }
        Ok(DecodedResponse::text(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockTransport, bundled_registry, registry_with_external};
    use crate::types::{NanonisValue, REPLY_FIELD};

    fn lenient() -> Dispatcher<MockTransport> {
        Dispatcher::new(bundled_registry(), MockTransport::connected())
    }

    fn strict() -> Dispatcher<MockTransport> {
        lenient().with_mode(DispatchMode::Strict)
    }

    #[test]
    fn test_builtin_round_trip() {
        let mut dispatcher = lenient();
        dispatcher.transport_mut().instrument.bias = 0.25;

        let response = dispatcher.execute::<&str>("getBias", &[]).unwrap();
        assert_eq!(response.get("Bias value (V)"), Some(&NanonisValue::F32(0.25)));
        assert_eq!(dispatcher.transport().commands(), vec!["Bias.Get"]);
    }

    #[test]
    fn test_builtin_encodes_hidden_defaults() {
        let mut dispatcher = lenient();
        dispatcher.execute("setXY", &["1e-9", "2e-9"]).unwrap();

        let frame = &dispatcher.transport().frames[0];
        assert_eq!(frame.len(), 40 + 8 + 8 + 4);
        assert_eq!(&frame[36..38], &[0, 1]);
        assert_eq!(&frame[40..48], &1e-9f64.to_be_bytes());
        assert_eq!(&frame[48..56], &2e-9f64.to_be_bytes());
        assert_eq!(&frame[56..60], &1u32.to_be_bytes());
    }

    #[test]
    fn test_arity_mismatch_never_sends() {
        let mut dispatcher = lenient();
        let response = dispatcher.execute("setBias", &["0.1", "0.2"]).unwrap();
        assert!(response.is_empty());
        let response = dispatcher.execute::<&str>("setXY", &[]).unwrap();
        assert!(response.is_empty());
        assert!(dispatcher.transport().frames.is_empty());
    }

    #[test]
    fn test_strict_arity_mismatch_errors() {
        let mut dispatcher = strict();
        let result = dispatcher.execute::<&str>("setBias", &[]);
        assert!(matches!(result, Err(NanonisError::InvalidArgument(_))));
        assert!(dispatcher.transport().frames.is_empty());
    }

    #[test]
    fn test_unknown_alias_modes() {
        let mut dispatcher = lenient();
        assert!(dispatcher.execute("jump", &["1"]).unwrap().is_empty());

        let mut dispatcher = strict();
        assert!(matches!(
            dispatcher.execute("jump", &["1"]),
            Err(NanonisError::UnknownCommand(_))
        ));
        assert!(dispatcher.transport().frames.is_empty());
    }

    #[test]
    fn test_non_numeric_argument() {
        let mut dispatcher = lenient();
        let result = dispatcher.execute("setBias", &["high"]);
        assert!(matches!(result, Err(NanonisError::InvalidArgument(_))));
        assert!(dispatcher.transport().frames.is_empty());
    }

    #[test]
    fn test_not_connected_is_transport_error() {
        let mut dispatcher = Dispatcher::new(bundled_registry(), MockTransport::default());
        let result = dispatcher.execute::<&str>("getBias", &[]);
        assert!(matches!(result, Err(NanonisError::Transport(_))));
    }

    #[test]
    fn test_short_reply_is_decode_error() {
        let mut dispatcher = lenient();
        dispatcher.transport_mut().truncate_replies = true;
        let result = dispatcher.execute::<&str>("getXY", &[]);
        assert!(matches!(result, Err(NanonisError::Decode(_))));
    }

    #[test]
    fn test_external_command_text() {
        let mut transport = MockTransport::connected();
        transport.external_reply = Some("+004.200\r\n".to_string());
        let mut dispatcher = Dispatcher::new(registry_with_external(), transport);

        let response = dispatcher.execute("setTemp", &["1", "4.2"]).unwrap();

        assert_eq!(
            response.get(REPLY_FIELD),
            Some(&NanonisValue::String("+004.200".to_string()))
        );
        assert_eq!(
            dispatcher.transport().external_calls,
            vec![("127.0.0.1".to_string(), 7777, "SETP 1 4.2".to_string())]
        );
        assert!(dispatcher.transport().frames.is_empty());
    }

    #[test]
    fn test_external_unreachable() {
        let mut dispatcher = Dispatcher::new(registry_with_external(), MockTransport::connected());
        match dispatcher.execute("setTemp", &["1", "4.2"]) {
            Err(NanonisError::ExternalUnreachable { interface, message }) => {
                assert_eq!(interface, "Lakeshore");
                assert!(message.contains("refused"));
            }
            other => panic!("expected ExternalUnreachable, got {other:?}"),
        }
    }

    #[test]
    fn test_builtin_precedes_external_alias() {
        let mut dispatcher = Dispatcher::new(registry_with_external(), MockTransport::connected());
        dispatcher.execute::<&str>("getBias", &[]).unwrap();
        assert_eq!(dispatcher.transport().commands(), vec!["Bias.Get"]);
        assert!(dispatcher.transport().external_calls.is_empty());
    }
}
