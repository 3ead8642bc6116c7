//! Compound commands that orchestrate several built-in calls.
//!
//! The set is closed: each variant carries its own procedure, and the special
//! catalog only supplies argument names for them.

use crate::dispatcher::Dispatcher;
use crate::error::NanonisError;
use crate::fit::linear_fit;
use crate::nanonis::Transport;
use crate::types::DecodedResponse;
use log::{debug, info};
use ndarray::Array1;
use std::time::Duration;

/// Spacing between Z samples during drift estimation
pub const DRIFT_SAMPLE_PERIOD: Duration = Duration::from_secs(1);

/// Fewest samples a line can be fitted through
pub const MIN_DRIFT_SAMPLES: usize = 2;

/// Longest drift estimation accepted: one day of samples
pub const MAX_DRIFT_SAMPLES: usize = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialCommand {
    AddX,
    AddY,
    AddZ,
    AddCurrent,
    AddBias,
    CorrectZDrift,
    Wait,
}

/// Read-modify-write of one field exposed by a get/set pair of built-ins
struct Offset {
    getter: &'static str,
    setter: &'static str,
    /// Fields returned by the getter, passed to the setter in this order
    fields: &'static [&'static str],
    target: usize,
}

const XY_FIELDS: &[&str] = &["X (m)", "Y (m)"];

impl SpecialCommand {
    pub const ALL: [SpecialCommand; 7] = [
        SpecialCommand::AddX,
        SpecialCommand::AddY,
        SpecialCommand::AddZ,
        SpecialCommand::AddCurrent,
        SpecialCommand::AddBias,
        SpecialCommand::CorrectZDrift,
        SpecialCommand::Wait,
    ];

    pub fn from_alias(alias: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|command| command.alias() == alias)
    }

    pub fn alias(self) -> &'static str {
        match self {
            SpecialCommand::AddX => "addX",
            SpecialCommand::AddY => "addY",
            SpecialCommand::AddZ => "addZ",
            SpecialCommand::AddCurrent => "addCurrent",
            SpecialCommand::AddBias => "addBias",
            SpecialCommand::CorrectZDrift => "correctZDrift",
            SpecialCommand::Wait => "wait",
        }
    }

    pub fn arity(self) -> usize {
        1
    }

    fn offset(self) -> Option<Offset> {
        let offset = match self {
            SpecialCommand::AddX => Offset {
                getter: "getXY",
                setter: "setXY",
                fields: XY_FIELDS,
                target: 0,
            },
            SpecialCommand::AddY => Offset {
                getter: "getXY",
                setter: "setXY",
                fields: XY_FIELDS,
                target: 1,
            },
            SpecialCommand::AddZ => Offset {
                getter: "getZ",
                setter: "setZ",
                fields: &["Z position (m)"],
                target: 0,
            },
            SpecialCommand::AddCurrent => Offset {
                getter: "getCurrent",
                setter: "setCurrent",
                fields: &["Z-Controller setpoint"],
                target: 0,
            },
            SpecialCommand::AddBias => Offset {
                getter: "getBias",
                setter: "setBias",
                fields: &["Bias value (V)"],
                target: 0,
            },
            SpecialCommand::CorrectZDrift | SpecialCommand::Wait => return None,
        };
        Some(offset)
    }

    /// Run the procedure. Arity has already been checked by the dispatcher.
    pub(crate) fn run<T: Transport, S: AsRef<str>>(
        self,
        dispatcher: &mut Dispatcher<T>,
        args: &[S],
    ) -> Result<DecodedResponse, NanonisError> {
        let arg = args
            .first()
            .map(|a| a.as_ref())
            .ok_or_else(|| NanonisError::InvalidArgument(format!("{} needs an argument", self.alias())))?;

        if let Some(offset) = self.offset() {
            return add_offset(dispatcher, &offset, parse_number(self, arg)?);
        }

        match self {
            SpecialCommand::CorrectZDrift => correct_z_drift(dispatcher, parse_number(self, arg)?),
            SpecialCommand::Wait => {
                let seconds = parse_number(self, arg)?;
                let duration = Duration::try_from_secs_f64(seconds).map_err(|_| {
                    NanonisError::InvalidArgument(format!("wait: invalid duration '{arg}'"))
                })?;
                debug!("Waiting {duration:?}");
                dispatcher.pause(duration);
                Ok(DecodedResponse::new())
            }
            _ => Ok(DecodedResponse::new()),
        }
    }
}

fn parse_number(command: SpecialCommand, token: &str) -> Result<f64, NanonisError> {
    token.trim().parse::<f64>().map_err(|_| {
        NanonisError::InvalidArgument(format!("{}: '{token}' is not a number", command.alias()))
    })
}

fn add_offset<T: Transport>(
    dispatcher: &mut Dispatcher<T>,
    offset: &Offset,
    delta: f64,
) -> Result<DecodedResponse, NanonisError> {
    let current = dispatcher.call_builtin::<&str>(offset.getter, &[])?;

    let mut values = offset
        .fields
        .iter()
        .map(|field| current.f64_field(field))
        .collect::<Result<Vec<f64>, _>>()?;
    values[offset.target] += delta;

    let tokens: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    dispatcher.call_builtin(offset.setter, &tokens)
}

/// Estimate Z drift from one sample per period and fold it into the piezo
/// drift compensation.
fn correct_z_drift<T: Transport>(
    dispatcher: &mut Dispatcher<T>,
    duration_secs: f64,
) -> Result<DecodedResponse, NanonisError> {
    let period = DRIFT_SAMPLE_PERIOD.as_secs_f64();
    let samples = (duration_secs / period).floor();
    if !(samples >= MIN_DRIFT_SAMPLES as f64) {
        return Err(NanonisError::InvalidArgument(format!(
            "correctZDrift: {duration_secs} s gives fewer than {MIN_DRIFT_SAMPLES} samples"
        )));
    }
    if !samples.is_finite() || samples > MAX_DRIFT_SAMPLES as f64 {
        return Err(NanonisError::InvalidArgument(format!(
            "correctZDrift: {duration_secs} s exceeds {MAX_DRIFT_SAMPLES} samples"
        )));
    }
    let samples = samples as usize;

    let state = dispatcher.call_builtin::<&str>("getDriftComp", &[])?;
    let enabled = state.f64_field("Compensation status")? == 1.0;
    let mut vx = state.f64_field("Vx (m/s)")?;
    let mut vy = state.f64_field("Vy (m/s)")?;
    let old_vz = state.f64_field("Vz (m/s)")?;

    info!("Sampling Z for drift estimation: {samples} samples");
    let mut t = Array1::<f64>::zeros(samples);
    let mut z = Array1::<f64>::zeros(samples);
    for i in 0..samples {
        let reading = dispatcher.call_builtin::<&str>("getZ", &[])?;
        t[i] = period * i as f64;
        z[i] = reading.f64_field("Z position (m)")?;
        dispatcher.pause(DRIFT_SAMPLE_PERIOD);
    }

    let fit = linear_fit(&t, &z).ok_or_else(|| {
        NanonisError::InvalidArgument("correctZDrift: samples do not define a line".to_string())
    })?;

    let vz = if enabled {
        old_vz + fit.slope
    } else {
        vx = 0.0;
        vy = 0.0;
        fit.slope
    };
    info!("Drift fit slope {:e} m/s, new Vz {:e} m/s", fit.slope, vz);

    let tokens = ["1".to_string(), vx.to_string(), vy.to_string(), vz.to_string()];
    dispatcher.call_builtin("setDriftComp", &tokens)
}
