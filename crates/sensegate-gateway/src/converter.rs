//! Type converters between wire payloads and host state values.
//!
//! One pure mapping per host state family, dispatched through a closed
//! table keyed on the variable type. No inheritance, no I/O, no state.
//! Every converter covers its legal domain exhaustively and rejects
//! everything else: an on/off payload other than `"0"`/`"1"` is an error,
//! not a default.

use sensegate_protocol::VariableType;
use serde::{Deserialize, Serialize};

/// Conversion failures. Validation errors, raised at the boundary; the
/// caller must not proceed with the offending value.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ConvertError {
    /// Payload outside the converter's domain.
    #[error("payload {payload:?} outside the {converter} domain")]
    IllegalPayload {
        converter: &'static str,
        payload: String,
    },

    /// State variant does not fit the addressed variable type.
    #[error("state {state} cannot be carried by variable type {variable:?}")]
    StateMismatch {
        variable: VariableType,
        state: &'static str,
    },

    /// No converter is registered for this variable type.
    #[error("no converter for variable type {0:?}")]
    Unsupported(VariableType),
}

/// Travel direction of a cover/blind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoverDirection {
    Up,
    Down,
}

/// Host-side state value, the bridge's half of the host platform's state
/// model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateValue {
    OnOff(bool),
    /// `true` = open.
    OpenClosed(bool),
    UpDown(CoverDirection),
    /// 0–100.
    Percent(u8),
    Decimal(f64),
    Text(String),
    Rgb { r: u8, g: u8, b: u8 },
}

impl StateValue {
    fn variant_name(&self) -> &'static str {
        match self {
            Self::OnOff(_) => "OnOff",
            Self::OpenClosed(_) => "OpenClosed",
            Self::UpDown(_) => "UpDown",
            Self::Percent(_) => "Percent",
            Self::Decimal(_) => "Decimal",
            Self::Text(_) => "Text",
            Self::Rgb { .. } => "Rgb",
        }
    }
}

impl std::fmt::Display for StateValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.variant_name())
    }
}

/// The state family a variable type maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConverterKind {
    Switch,
    Contact,
    Cover,
    Percent,
    Decimal,
    Text,
    Color,
}

/// Closed dispatch table: variable type → converter.
fn kind_for(variable: VariableType) -> Option<ConverterKind> {
    use VariableType as V;
    let kind = match variable {
        V::Status | V::Armed | V::LockStatus | V::SceneOn | V::SceneOff => ConverterKind::Switch,
        V::Tripped => ConverterKind::Contact,
        V::Up | V::Down | V::Stop => ConverterKind::Cover,
        V::Percentage => ConverterKind::Percent,
        V::Temp
        | V::Hum
        | V::Pressure
        | V::Rain
        | V::RainRate
        | V::Wind
        | V::Gust
        | V::Direction
        | V::Uv
        | V::Weight
        | V::Distance
        | V::Impedance
        | V::Watt
        | V::Kwh
        | V::LightLevel
        | V::Level
        | V::Voltage
        | V::Current
        | V::Flow
        | V::Volume
        | V::HvacSetpointCool
        | V::HvacSetpointHeat
        | V::Ph
        | V::Orp
        | V::Ec
        | V::Va
        | V::PowerFactor => ConverterKind::Decimal,
        V::Forecast
        | V::HvacFlowState
        | V::HvacSpeed
        | V::HvacFlowMode
        | V::Var1
        | V::Var2
        | V::Var3
        | V::Var4
        | V::Var5
        | V::IrSend
        | V::IrReceive
        | V::IrRecord
        | V::Id
        | V::UnitPrefix
        | V::Text
        | V::Custom
        | V::Position
        | V::Rgbw
        | V::Var => ConverterKind::Text,
        V::Rgb => ConverterKind::Color,
        V::Unknown(_) => return None,
    };
    Some(kind)
}

/// Decode a wire payload into a host state for the given variable type.
pub fn from_payload(variable: VariableType, payload: &str) -> Result<StateValue, ConvertError> {
    let kind = kind_for(variable).ok_or(ConvertError::Unsupported(variable))?;
    match kind {
        ConverterKind::Switch => match payload {
            "0" => Ok(StateValue::OnOff(false)),
            "1" => Ok(StateValue::OnOff(true)),
            _ => Err(illegal("on/off", payload)),
        },
        ConverterKind::Contact => match payload {
            "0" => Ok(StateValue::OpenClosed(false)),
            "1" => Ok(StateValue::OpenClosed(true)),
            _ => Err(illegal("open/closed", payload)),
        },
        ConverterKind::Cover => match payload {
            "0" => Ok(StateValue::UpDown(CoverDirection::Up)),
            "1" => Ok(StateValue::UpDown(CoverDirection::Down)),
            _ => Err(illegal("up/down", payload)),
        },
        ConverterKind::Percent => {
            // Digits only; `u8::from_str` would also take a leading sign.
            if payload.is_empty() || !payload.bytes().all(|b| b.is_ascii_digit()) {
                return Err(illegal("percent", payload));
            }
            let value: u8 = payload.parse().map_err(|_| illegal("percent", payload))?;
            if value > 100 {
                return Err(illegal("percent", payload));
            }
            Ok(StateValue::Percent(value))
        }
        ConverterKind::Decimal => {
            let value: f64 = payload.parse().map_err(|_| illegal("decimal", payload))?;
            if !value.is_finite() {
                return Err(illegal("decimal", payload));
            }
            Ok(StateValue::Decimal(value))
        }
        ConverterKind::Text => Ok(StateValue::Text(payload.to_string())),
        ConverterKind::Color => {
            if payload.len() != 6 || !payload.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(illegal("rgb", payload));
            }
            let r = u8::from_str_radix(&payload[0..2], 16).map_err(|_| illegal("rgb", payload))?;
            let g = u8::from_str_radix(&payload[2..4], 16).map_err(|_| illegal("rgb", payload))?;
            let b = u8::from_str_radix(&payload[4..6], 16).map_err(|_| illegal("rgb", payload))?;
            Ok(StateValue::Rgb { r, g, b })
        }
    }
}

/// Encode a host state as a wire payload.
pub fn to_payload(state: &StateValue) -> String {
    match state {
        StateValue::OnOff(on) => u8::from(*on).to_string(),
        StateValue::OpenClosed(open) => u8::from(*open).to_string(),
        StateValue::UpDown(CoverDirection::Up) => "0".to_string(),
        StateValue::UpDown(CoverDirection::Down) => "1".to_string(),
        StateValue::Percent(value) => value.to_string(),
        StateValue::Decimal(value) => value.to_string(),
        StateValue::Text(text) => text.clone(),
        StateValue::Rgb { r, g, b } => format!("{r:02x}{g:02x}{b:02x}"),
    }
}

/// Encode a host state for a specific variable type, rejecting mismatched
/// pairs (a Percent state cannot be sent on an on/off slot).
pub fn to_payload_for(variable: VariableType, state: &StateValue) -> Result<String, ConvertError> {
    let kind = kind_for(variable).ok_or(ConvertError::Unsupported(variable))?;
    let fits = matches!(
        (kind, state),
        (ConverterKind::Switch, StateValue::OnOff(_))
            | (ConverterKind::Contact, StateValue::OpenClosed(_))
            | (ConverterKind::Cover, StateValue::UpDown(_))
            | (ConverterKind::Percent, StateValue::Percent(_))
            | (ConverterKind::Decimal, StateValue::Decimal(_))
            | (ConverterKind::Decimal, StateValue::Percent(_))
            | (ConverterKind::Text, StateValue::Text(_))
            | (ConverterKind::Color, StateValue::Rgb { .. })
    );
    if !fits {
        return Err(ConvertError::StateMismatch {
            variable,
            state: state.variant_name(),
        });
    }
    Ok(to_payload(state))
}

fn illegal(converter: &'static str, payload: &str) -> ConvertError {
    ConvertError::IllegalPayload {
        converter,
        payload: payload.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_off_is_two_state() {
        assert_eq!(
            from_payload(VariableType::Status, "0").unwrap(),
            StateValue::OnOff(false)
        );
        assert_eq!(
            from_payload(VariableType::Status, "1").unwrap(),
            StateValue::OnOff(true)
        );
        assert!(matches!(
            from_payload(VariableType::Status, "2"),
            Err(ConvertError::IllegalPayload { .. })
        ));
        assert!(from_payload(VariableType::Status, "on").is_err());
        assert!(from_payload(VariableType::Status, "").is_err());
    }

    #[test]
    fn percent_is_bounded() {
        assert_eq!(
            from_payload(VariableType::Percentage, "100").unwrap(),
            StateValue::Percent(100)
        );
        assert!(from_payload(VariableType::Percentage, "101").is_err());
        assert!(from_payload(VariableType::Percentage, "-1").is_err());
        assert!(from_payload(VariableType::Percentage, "+5").is_err());
        assert!(from_payload(VariableType::Percentage, "").is_err());
        assert!(from_payload(VariableType::Percentage, "abc").is_err());
    }

    #[test]
    fn decimal_rejects_non_finite() {
        assert_eq!(
            from_payload(VariableType::Temp, "21.5").unwrap(),
            StateValue::Decimal(21.5)
        );
        assert!(from_payload(VariableType::Temp, "NaN").is_err());
        assert!(from_payload(VariableType::Temp, "inf").is_err());
        assert!(from_payload(VariableType::Temp, "warm").is_err());
    }

    #[test]
    fn rgb_parses_hex_triplet() {
        assert_eq!(
            from_payload(VariableType::Rgb, "ff8000").unwrap(),
            StateValue::Rgb { r: 255, g: 128, b: 0 }
        );
        assert!(from_payload(VariableType::Rgb, "ff80").is_err());
        assert!(from_payload(VariableType::Rgb, "gg8000").is_err());
    }

    #[test]
    fn payload_round_trips() {
        for (variable, payload) in [
            (VariableType::Status, "1"),
            (VariableType::Percentage, "42"),
            (VariableType::Temp, "21.5"),
            (VariableType::Rgb, "ff8000"),
            (VariableType::Text, "hello world"),
        ] {
            let state = from_payload(variable, payload).unwrap();
            assert_eq!(to_payload_for(variable, &state).unwrap(), payload);
        }
    }

    #[test]
    fn mismatched_state_is_rejected() {
        assert!(matches!(
            to_payload_for(VariableType::Status, &StateValue::Percent(50)),
            Err(ConvertError::StateMismatch { .. })
        ));
        assert!(matches!(
            to_payload_for(VariableType::Rgb, &StateValue::Text("red".into())),
            Err(ConvertError::StateMismatch { .. })
        ));
    }

    #[test]
    fn unknown_variable_type_is_unsupported() {
        assert!(matches!(
            from_payload(VariableType::Unknown(200), "1"),
            Err(ConvertError::Unsupported(_))
        ));
    }
}
