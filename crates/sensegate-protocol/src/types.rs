//! Closed enums for the sensor protocol's type spaces.
//!
//! Each wire enum is a tagged variant over the documented codes with an
//! `Unknown(u8)` escape hatch: firmware in the field routinely sends codes
//! newer than the bridge, and an unknown sub-type must survive a decode /
//! re-encode cycle unchanged.

use serde::{Deserialize, Serialize};

/// Defines a u8-backed wire enum with an `Unknown` variant preserving
/// unrecognized codes.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident = $code:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant,)+
            /// Code not known to this bridge version.
            Unknown(u8),
        }

        impl $name {
            /// Decode a wire code.
            pub fn from_code(code: u8) -> Self {
                match code {
                    $($code => Self::$variant,)+
                    other => Self::Unknown(other),
                }
            }

            /// Encode back to the wire code.
            pub fn code(&self) -> u8 {
                match self {
                    $(Self::$variant => $code,)+
                    Self::Unknown(other) => *other,
                }
            }
        }

        impl From<u8> for $name {
            fn from(code: u8) -> Self {
                Self::from_code(code)
            }
        }

        impl From<$name> for u8 {
            fn from(value: $name) -> u8 {
                value.code()
            }
        }
    };
}

/// Top-level message type. The sub-type field's meaning is keyed off this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Device announces a node or child and its sensor type.
    Presentation,
    /// Value update for a variable (device→bridge or bridge→device).
    Set,
    /// Request for a variable's current value.
    Req,
    /// Protocol housekeeping (ids, heartbeats, metadata, config).
    Internal,
    /// Firmware/OTA data stream.
    Stream,
}

impl MessageType {
    /// Decode the wire code; the type space is closed, codes above 4 are
    /// a parse error upstream.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Presentation),
            1 => Some(Self::Set),
            2 => Some(Self::Req),
            3 => Some(Self::Internal),
            4 => Some(Self::Stream),
            _ => None,
        }
    }

    /// Encode to the wire code.
    pub fn code(&self) -> u8 {
        match self {
            Self::Presentation => 0,
            Self::Set => 1,
            Self::Req => 2,
            Self::Internal => 3,
            Self::Stream => 4,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Presentation => write!(f, "presentation"),
            Self::Set => write!(f, "set"),
            Self::Req => write!(f, "req"),
            Self::Internal => write!(f, "internal"),
            Self::Stream => write!(f, "stream"),
        }
    }
}

wire_enum! {
    /// Sensor type announced by a PRESENTATION message.
    PresentationType {
        Door = 0,
        Motion = 1,
        Smoke = 2,
        Binary = 3,
        Dimmer = 4,
        Cover = 5,
        Temperature = 6,
        Humidity = 7,
        Barometer = 8,
        Wind = 9,
        Rain = 10,
        Uv = 11,
        Weight = 12,
        Power = 13,
        Heater = 14,
        Distance = 15,
        LightLevel = 16,
        ArduinoNode = 17,
        ArduinoRepeaterNode = 18,
        Lock = 19,
        Ir = 20,
        Water = 21,
        AirQuality = 22,
        Custom = 23,
        Dust = 24,
        SceneController = 25,
        RgbLight = 26,
        RgbwLight = 27,
        ColorSensor = 28,
        Hvac = 29,
        Multimeter = 30,
        Sprinkler = 31,
        WaterLeak = 32,
        Sound = 33,
        Vibration = 34,
        Moisture = 35,
        Info = 36,
        Gas = 37,
        Gps = 38,
        WaterQuality = 39,
    }
}

wire_enum! {
    /// Variable slot addressed by SET/REQ messages.
    VariableType {
        Temp = 0,
        Hum = 1,
        Status = 2,
        Percentage = 3,
        Pressure = 4,
        Forecast = 5,
        Rain = 6,
        RainRate = 7,
        Wind = 8,
        Gust = 9,
        Direction = 10,
        Uv = 11,
        Weight = 12,
        Distance = 13,
        Impedance = 14,
        Armed = 15,
        Tripped = 16,
        Watt = 17,
        Kwh = 18,
        SceneOn = 19,
        SceneOff = 20,
        HvacFlowState = 21,
        HvacSpeed = 22,
        LightLevel = 23,
        Var1 = 24,
        Var2 = 25,
        Var3 = 26,
        Var4 = 27,
        Var5 = 28,
        Up = 29,
        Down = 30,
        Stop = 31,
        IrSend = 32,
        IrReceive = 33,
        Flow = 34,
        Volume = 35,
        LockStatus = 36,
        Level = 37,
        Voltage = 38,
        Current = 39,
        Rgb = 40,
        Rgbw = 41,
        Id = 42,
        UnitPrefix = 43,
        HvacSetpointCool = 44,
        HvacSetpointHeat = 45,
        HvacFlowMode = 46,
        Text = 47,
        Custom = 48,
        Position = 49,
        IrRecord = 50,
        Ph = 51,
        Orp = 52,
        Ec = 53,
        Var = 54,
        Va = 55,
        PowerFactor = 56,
    }
}

wire_enum! {
    /// Housekeeping command carried by an INTERNAL message.
    InternalType {
        BatteryLevel = 0,
        Time = 1,
        Version = 2,
        IdRequest = 3,
        IdResponse = 4,
        InclusionMode = 5,
        Config = 6,
        FindParent = 7,
        FindParentResponse = 8,
        LogMessage = 9,
        Children = 10,
        SketchName = 11,
        SketchVersion = 12,
        Reboot = 13,
        GatewayReady = 14,
        SigningPresentation = 15,
        NonceRequest = 16,
        NonceResponse = 17,
        HeartbeatRequest = 18,
        Presentation = 19,
        DiscoverRequest = 20,
        DiscoverResponse = 21,
        HeartbeatResponse = 22,
        Locked = 23,
        Ping = 24,
        Pong = 25,
        RegistrationRequest = 26,
        RegistrationResponse = 27,
        Debug = 28,
    }
}
