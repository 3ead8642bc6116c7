//! Command catalogs and alias resolution.
//!
//! Three tiers are loaded from JSON definitions: built-in binary commands,
//! special (orchestrated) commands and any number of external plain-text
//! interfaces. Resolution always tries them in that order and the first
//! match wins, so a deployment can extend the console through external
//! definitions while built-ins and specials keep precedence.

use crate::error::NanonisError;
use crate::special::SpecialCommand;
use crate::types::{NanonisValue, WireType};
use log::{debug, info, warn};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

const BUNDLED_COMMANDS: &str = include_str!("../cmds/commands.json");
const BUNDLED_SPECIAL_COMMANDS: &str = include_str!("../cmds/special_commands.json");

/// Script directives that are not catalog commands
pub const SCRIPT_KEYWORDS: [&str; 2] = ["repeat", "end"];

/// JSON object that keeps its keys in document order
#[derive(Debug, Clone, PartialEq)]
struct OrderedMap<V>(Vec<(String, V)>);

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        OrderedMap(Vec::new())
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedMapVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedMapVisitor<V> {
            type Value = OrderedMap<V>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, V>()? {
                    entries.push((key, value));
                }
                Ok(OrderedMap(entries))
            }
        }

        deserializer.deserialize_map(OrderedMapVisitor(PhantomData))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandDef {
    cmd_name: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    arg_values: OrderedMap<serde_json::Value>,
    #[serde(default)]
    arg_types: HashMap<String, WireType>,
    #[serde(default)]
    resp_types: OrderedMap<WireType>,
}

#[derive(Debug, Deserialize)]
struct SpecialDef {
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExternalCommandDef {
    cmd_name: String,
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct InterfaceDef {
    name: String,
    #[serde(alias = "IP")]
    host: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct ExternalFile {
    #[serde(rename = "Interface")]
    interface: InterfaceDef,
    #[serde(flatten)]
    commands: OrderedMap<ExternalCommandDef>,
}

/// One argument of a built-in request body
#[derive(Debug, Clone, PartialEq)]
pub struct BodyArg {
    pub name: String,
    pub wire_type: WireType,
    /// Value used when the caller does not supply this argument
    pub default: Option<NanonisValue>,
}

/// Built-in binary command. Immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub alias: String,
    pub wire_name: String,
    /// Caller-supplied argument names, in positional order
    pub args: Vec<String>,
    /// Every body argument in encoding order
    pub body: Vec<BodyArg>,
    pub response: Vec<(String, WireType)>,
}

impl CommandSpec {
    pub fn arity(&self) -> usize {
        self.args.len()
    }

    /// Coerce caller tokens into a fresh list of body values.
    ///
    /// The command definition is never written to; hidden arguments take their
    /// declared defaults.
    pub fn bind<S: AsRef<str>>(&self, tokens: &[S]) -> Result<Vec<(WireType, NanonisValue)>, NanonisError> {
        if tokens.len() != self.arity() {
            return Err(NanonisError::InvalidArgument(format!(
                "{} expects {} argument(s), got {}",
                self.alias,
                self.arity(),
                tokens.len()
            )));
        }

        let mut values: Vec<Option<NanonisValue>> =
            self.body.iter().map(|arg| arg.default.clone()).collect();

        for (name, token) in self.args.iter().zip(tokens) {
            let slot = self
                .body
                .iter()
                .position(|arg| &arg.name == name)
                .ok_or_else(|| NanonisError::InvalidArgument(format!("{}: no body slot for '{name}'", self.alias)))?;
            let value = self.body[slot].wire_type.parse_arg(token.as_ref()).map_err(|e| {
                NanonisError::InvalidArgument(format!("{} '{name}': {e}", self.alias))
            })?;
            values[slot] = Some(value);
        }

        self.body
            .iter()
            .zip(values)
            .map(|(arg, value)| {
                value.map(|v| (arg.wire_type, v)).ok_or_else(|| {
                    NanonisError::InvalidArgument(format!("{}: no value for '{}'", self.alias, arg.name))
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpecialCommandSpec {
    pub alias: String,
    pub args: Vec<String>,
    pub command: SpecialCommand,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalCommandSpec {
    pub alias: String,
    pub wire_name: String,
    pub args: Vec<String>,
}

/// A separately reachable device speaking a plain-text TCP command set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalInterface {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub commands: Vec<ExternalCommandSpec>,
}

impl ExternalInterface {
    pub fn command(&self, alias: &str) -> Option<&ExternalCommandSpec> {
        self.commands.iter().find(|c| c.alias == alias)
    }

    pub fn info(&self) -> InterfaceInfo {
        InterfaceInfo {
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }
}

/// Address summary of an external interface, as listed to collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub host: String,
    pub port: u16,
}

/// Outcome of alias resolution
#[derive(Debug, Clone, Copy)]
pub enum Resolved<'a> {
    BuiltIn(&'a CommandSpec),
    Special(&'a SpecialCommandSpec),
    External(&'a ExternalInterface, &'a ExternalCommandSpec),
    Unknown,
}

/// Where the catalogs live on disk
#[derive(Debug, Clone)]
pub struct CommandSources {
    pub builtin: PathBuf,
    pub special: PathBuf,
    /// Directory with one JSON definition per external interface
    pub external_dir: Option<PathBuf>,
}

impl Default for CommandSources {
    fn default() -> Self {
        Self {
            builtin: PathBuf::from("cmds/commands.json"),
            special: PathBuf::from("cmds/special_commands.json"),
            external_dir: Some(PathBuf::from("cmds/external")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    builtin: Vec<CommandSpec>,
    builtin_index: HashMap<String, usize>,
    special: Vec<SpecialCommandSpec>,
    special_index: HashMap<String, usize>,
    interfaces: Vec<ExternalInterface>,
}

impl Registry {
    /// Load every catalog named in `sources`.
    ///
    /// External definitions are read in file-name order, which fixes the
    /// precedence between interfaces declaring the same alias.
    pub fn load(sources: &CommandSources) -> Result<Self, NanonisError> {
        let builtin = read_source(&sources.builtin)?;
        let special = read_source(&sources.special)?;

        let mut externals = Vec::new();
        if let Some(dir) = &sources.external_dir {
            if dir.is_dir() {
                let dir_error = |e: std::io::Error| {
                    NanonisError::load(dir.display().to_string(), e.to_string())
                };
                let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
                    .map_err(dir_error)?
                    .map(|entry| entry.map(|e| e.path()).map_err(dir_error))
                    .collect::<Result<Vec<_>, _>>()?
                    .into_iter()
                    .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
                    .collect();
                files.sort();
                for path in files {
                    externals.push((path.display().to_string(), read_source(&path)?));
                }
            } else {
                debug!("No external interface directory at {}", dir.display());
            }
        }

        let externals: Vec<(&str, &str)> = externals
            .iter()
            .map(|(name, json)| (name.as_str(), json.as_str()))
            .collect();
        let registry = Self::from_json(&builtin, &special, &externals)?;
        info!(
            "Loaded {} built-in, {} special commands and {} external interface(s)",
            registry.builtin.len(),
            registry.special.len(),
            registry.interfaces.len()
        );
        Ok(registry)
    }

    /// Registry with the catalogs compiled into the crate and no external interfaces
    pub fn bundled() -> Result<Self, NanonisError> {
        Self::from_json(BUNDLED_COMMANDS, BUNDLED_SPECIAL_COMMANDS, &[])
    }

    /// Build a registry from in-memory catalogs.
    ///
    /// `externals` pairs a source name (used in error messages) with its JSON.
    pub fn from_json(
        builtin: &str,
        special: &str,
        externals: &[(&str, &str)],
    ) -> Result<Self, NanonisError> {
        let mut registry = Registry::default();

        let builtin_defs: OrderedMap<CommandDef> = serde_json::from_str(builtin)
            .map_err(|e| NanonisError::load("built-in commands", e.to_string()))?;
        for (alias, def) in builtin_defs.0 {
            let spec = build_command_spec(alias, def)?;
            registry.builtin_index.insert(spec.alias.clone(), registry.builtin.len());
            registry.builtin.push(spec);
        }

        let special_defs: OrderedMap<SpecialDef> = serde_json::from_str(special)
            .map_err(|e| NanonisError::load("special commands", e.to_string()))?;
        for (alias, def) in special_defs.0 {
            let command = SpecialCommand::from_alias(&alias).ok_or_else(|| {
                NanonisError::load("special commands", format!("no procedure for '{alias}'"))
            })?;
            if def.args.len() != command.arity() {
                return Err(NanonisError::load(
                    "special commands",
                    format!(
                        "'{alias}' declares {} argument(s), procedure takes {}",
                        def.args.len(),
                        command.arity()
                    ),
                ));
            }
            if registry.builtin_index.contains_key(&alias) {
                warn!("Special command '{alias}' is shadowed by a built-in command");
            }
            registry.special_index.insert(alias.clone(), registry.special.len());
            registry.special.push(SpecialCommandSpec {
                alias,
                args: def.args,
                command,
            });
        }

        for (source_name, json) in externals {
            let interface = build_interface(source_name, json)?;
            for command in &interface.commands {
                if let Some(owner) = registry.interface_for(&command.alias) {
                    warn!(
                        "External alias '{}' of {} is shadowed by {}",
                        command.alias, interface.name, owner
                    );
                }
            }
            registry.interfaces.push(interface);
        }

        Ok(registry)
    }

    /// Resolve `alias`: built-ins first, then specials, then externals in load order
    pub fn resolve(&self, alias: &str) -> Resolved<'_> {
        if let Some(&i) = self.builtin_index.get(alias) {
            return Resolved::BuiltIn(&self.builtin[i]);
        }
        if let Some(&i) = self.special_index.get(alias) {
            return Resolved::Special(&self.special[i]);
        }
        for interface in &self.interfaces {
            if let Some(command) = interface.command(alias) {
                return Resolved::External(interface, command);
            }
        }
        Resolved::Unknown
    }

    pub fn builtin(&self, alias: &str) -> Option<&CommandSpec> {
        self.builtin_index.get(alias).map(|&i| &self.builtin[i])
    }

    pub fn interfaces(&self) -> &[ExternalInterface] {
        &self.interfaces
    }

    /// Every name a script line may start with, for completion
    pub fn aliases(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        SCRIPT_KEYWORDS
            .iter()
            .map(|k| k.to_string())
            .chain(self.builtin.iter().map(|c| c.alias.clone()))
            .chain(self.special.iter().map(|c| c.alias.clone()))
            .chain(
                self.interfaces
                    .iter()
                    .flat_map(|i| i.commands.iter().map(|c| c.alias.clone())),
            )
            .filter(|alias| seen.insert(alias.clone()))
            .collect()
    }

    fn interface_for(&self, alias: &str) -> Option<&str> {
        if self.builtin_index.contains_key(alias) || self.special_index.contains_key(alias) {
            return Some("a native command");
        }
        self.interfaces
            .iter()
            .find(|i| i.command(alias).is_some())
            .map(|i| i.name.as_str())
    }
}

fn read_source(path: &Path) -> Result<String, NanonisError> {
    std::fs::read_to_string(path)
        .map_err(|e| NanonisError::load(path.display().to_string(), e.to_string()))
}

/// Textual form of a JSON default so it goes through the same coercion as user input.
///
/// Whole-number floats (`1.0`) are accepted for integer types.
fn default_token(value: &serde_json::Value, wire_type: WireType) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) if wire_type.is_integer() && n.is_f64() => match n.as_f64() {
            Some(v) if v.is_finite() && v.fract() == 0.0 => Some(format!("{v:.0}")),
            _ => Some(n.to_string()),
        },
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        _ => None,
    }
}

fn build_command_spec(alias: String, def: CommandDef) -> Result<CommandSpec, NanonisError> {
    let source = format!("built-in command '{alias}'");
    let type_of = |name: &str| {
        def.arg_types
            .get(name)
            .copied()
            .ok_or_else(|| NanonisError::load(source.clone(), format!("argument '{name}' has no type")))
    };

    let mut body = Vec::with_capacity(def.arg_values.0.len());
    for (name, value) in &def.arg_values.0 {
        let wire_type = type_of(name)?;
        let token = default_token(value, wire_type).ok_or_else(|| {
            NanonisError::load(source.clone(), format!("default for '{name}' must be a number or string"))
        })?;
        let default = wire_type
            .parse_arg(&token)
            .map_err(|e| NanonisError::load(source.clone(), e.to_string()))?;
        body.push(BodyArg {
            name: name.clone(),
            wire_type,
            default: Some(default),
        });
    }

    let mut seen = HashSet::new();
    for name in &def.args {
        if !seen.insert(name.as_str()) {
            return Err(NanonisError::load(source.clone(), format!("argument '{name}' listed twice")));
        }
        let wire_type = type_of(name)?;
        if !body.iter().any(|arg| &arg.name == name) {
            body.push(BodyArg {
                name: name.clone(),
                wire_type,
                default: None,
            });
        }
    }

    Ok(CommandSpec {
        alias,
        wire_name: def.cmd_name,
        args: def.args,
        body,
        response: def.resp_types.0,
    })
}

fn build_interface(source_name: &str, json: &str) -> Result<ExternalInterface, NanonisError> {
    let file: ExternalFile =
        serde_json::from_str(json).map_err(|e| NanonisError::load(source_name, e.to_string()))?;

    let commands = file
        .commands
        .0
        .into_iter()
        .map(|(alias, def)| ExternalCommandSpec {
            alias,
            wire_name: def.cmd_name,
            args: def.args,
        })
        .collect();

    Ok(ExternalInterface {
        name: file.interface.name,
        host: file.interface.host,
        port: file.interface.port,
        commands,
    })
}
