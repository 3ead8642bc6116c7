//! Test doubles shared by the unit tests.

use crate::error::NanonisError;
use crate::nanonis::protocol::{HEADER_SIZE, Protocol};
use crate::nanonis::{ConnectionState, Transport};
use crate::registry::Registry;
use byteorder::{BigEndian, ReadBytesExt};
use std::io::Cursor;
use std::sync::Arc;

const BUNDLED_COMMANDS: &str = include_str!("../cmds/commands.json");
const BUNDLED_SPECIAL_COMMANDS: &str = include_str!("../cmds/special_commands.json");

const LAKESHORE: &str = r#"{
    "Interface": {"name": "Lakeshore", "host": "127.0.0.1", "port": 7777},
    "setTemp": {"cmdName": "SETP", "args": ["Loop", "Temperature (K)"]},
    "getBias": {"cmdName": "BIAS?", "args": []}
}"#;

pub fn bundled_registry() -> Arc<Registry> {
    Arc::new(Registry::bundled().unwrap())
}

pub fn registry_with_external() -> Arc<Registry> {
    Arc::new(
        Registry::from_json(
            BUNDLED_COMMANDS,
            BUNDLED_SPECIAL_COMMANDS,
            &[("lakeshore.json", LAKESHORE)],
        )
        .unwrap(),
    )
}

/// Simulated instrument state behind [`MockTransport`]
#[derive(Debug, Clone, Default)]
pub struct Instrument {
    pub x: f64,
    pub y: f64,
    pub z: f32,
    /// Successive `ZCtrl.ZPosGet` readings; `z` is used once exhausted
    pub z_series: Vec<f32>,
    pub setpoint: f32,
    pub bias: f32,
    pub feedback: u32,
    /// (status, vx, vy, vz)
    pub drift: (i32, f32, f32, f32),
}

/// In-memory transport that answers Nanonis frames from an [`Instrument`]
#[derive(Debug, Default)]
pub struct MockTransport {
    pub connected: bool,
    pub instrument: Instrument,
    /// Every request frame sent, in order
    pub frames: Vec<Vec<u8>>,
    /// (host, port, text) of every external call
    pub external_calls: Vec<(String, u16, String)>,
    /// Reply for external calls; `None` refuses the connection
    pub external_reply: Option<String>,
    /// Cut every reply off after the header
    pub truncate_replies: bool,
    pending: Option<Vec<u8>>,
}

impl MockTransport {
    pub fn connected() -> Self {
        Self {
            connected: true,
            ..Self::default()
        }
    }

    /// Command names of the sent frames
    pub fn commands(&self) -> Vec<String> {
        self.frames.iter().map(|f| Protocol::command_name(f)).collect()
    }

    fn answer(&mut self, command: &str, body: &[u8]) -> Result<Vec<u8>, NanonisError> {
        let mut args = Cursor::new(body);
        let mut reply = Vec::new();
        let instrument = &mut self.instrument;
        match command {
            "FolMe.XYPosGet" => {
                reply.extend_from_slice(&instrument.x.to_be_bytes());
                reply.extend_from_slice(&instrument.y.to_be_bytes());
            }
            "FolMe.XYPosSet" => {
                instrument.x = args.read_f64::<BigEndian>()?;
                instrument.y = args.read_f64::<BigEndian>()?;
            }
            "ZCtrl.ZPosGet" => {
                let z = if instrument.z_series.is_empty() {
                    instrument.z
                } else {
                    instrument.z_series.remove(0)
                };
                reply.extend_from_slice(&z.to_be_bytes());
            }
            "ZCtrl.ZPosSet" => instrument.z = args.read_f32::<BigEndian>()?,
            "ZCtrl.SetpntGet" => reply.extend_from_slice(&instrument.setpoint.to_be_bytes()),
            "ZCtrl.SetpntSet" => instrument.setpoint = args.read_f32::<BigEndian>()?,
            "Bias.Get" => reply.extend_from_slice(&instrument.bias.to_be_bytes()),
            "Bias.Set" => instrument.bias = args.read_f32::<BigEndian>()?,
            "ZCtrl.OnOffGet" => reply.extend_from_slice(&instrument.feedback.to_be_bytes()),
            "ZCtrl.OnOffSet" => instrument.feedback = args.read_u32::<BigEndian>()?,
            "Piezo.DriftCompGet" => {
                let (status, vx, vy, vz) = instrument.drift;
                reply.extend_from_slice(&(status as u32).to_be_bytes());
                reply.extend_from_slice(&vx.to_be_bytes());
                reply.extend_from_slice(&vy.to_be_bytes());
                reply.extend_from_slice(&vz.to_be_bytes());
                // X/Y/Z saturation flags and limit, not declared in the catalog
                reply.extend_from_slice(&0u32.to_be_bytes());
                reply.extend_from_slice(&1u32.to_be_bytes());
                reply.extend_from_slice(&0u32.to_be_bytes());
                reply.extend_from_slice(&10.0f32.to_be_bytes());
            }
            "Piezo.DriftCompSet" => {
                instrument.drift = (
                    args.read_i32::<BigEndian>()?,
                    args.read_f32::<BigEndian>()?,
                    args.read_f32::<BigEndian>()?,
                    args.read_f32::<BigEndian>()?,
                );
            }
            _ => {}
        }
        // Error block: status 0, empty message
        reply.extend_from_slice(&[0u8; 8]);
        Ok(reply)
    }
}

impl Transport for MockTransport {
    fn connect(&mut self, host: &str, port: u16) -> Result<(), NanonisError> {
        if port == 0 {
            self.connected = false;
            return Err(NanonisError::Connect {
                address: format!("{host}:{port}"),
                message: "Connection refused".to_string(),
            });
        }
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn state(&self) -> ConnectionState {
        if self.connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), NanonisError> {
        if !self.connected {
            return Err(NanonisError::Transport("Not connected".to_string()));
        }
        self.frames.push(frame.to_vec());

        let command = Protocol::command_name(frame);
        let body = self.answer(&command, &frame[HEADER_SIZE..])?;
        let mut reply = frame[..HEADER_SIZE].to_vec();
        reply[32..36].copy_from_slice(&(body.len() as i32).to_be_bytes());
        if !self.truncate_replies {
            reply.extend_from_slice(&body);
        }
        self.pending = Some(reply);
        Ok(())
    }

    fn receive(&mut self, _max_bytes: usize) -> Result<Vec<u8>, NanonisError> {
        if !self.connected {
            return Err(NanonisError::Transport("Not connected".to_string()));
        }
        self.pending
            .take()
            .ok_or_else(|| NanonisError::Transport("No reply pending".to_string()))
    }

    fn call_once(&mut self, host: &str, port: u16, payload: &[u8]) -> Result<Vec<u8>, NanonisError> {
        self.external_calls.push((
            host.to_string(),
            port,
            String::from_utf8_lossy(payload).to_string(),
        ));
        match &self.external_reply {
            Some(reply) => Ok(reply.as_bytes().to_vec()),
            None => Err(NanonisError::Connect {
                address: format!("{host}:{port}"),
                message: "Connection refused".to_string(),
            }),
        }
    }
}
