//! Wire types for the subset of the ecobee v1 API the controller talks to.
//!
//! Temperatures are integer tenths of a degree Fahrenheit throughout.

use serde::{Deserialize, Serialize};

use crate::{
    cache::QueryKind,
    types::{SensorReading, TemperatureSample},
};

pub const AUTHORIZE_PATH: &str = "/authorize";
pub const TOKEN_PATH: &str = "/token";
pub const THERMOSTAT_PATH: &str = "/1/thermostat";

pub const PIN_RESPONSE_TYPE: &str = "ecobeePin";
pub const PIN_GRANT_TYPE: &str = "ecobeePin";
pub const REFRESH_GRANT_TYPE: &str = "refresh_token";
pub const SCOPE: &str = "smartWrite";

/// `status.code` the API embeds next to an HTTP error when the access token expired.
pub const EXPIRED_TOKEN_CODE: i64 = 14;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Selection {
    #[serde(rename = "selectionType")]
    pub selection_type: &'static str,
    #[serde(rename = "selectionMatch")]
    pub selection_match: &'static str,
    #[serde(rename = "includeRuntime", skip_serializing_if = "is_false")]
    pub include_runtime: bool,
    #[serde(rename = "includeSettings", skip_serializing_if = "is_false")]
    pub include_settings: bool,
    #[serde(rename = "includeSensors", skip_serializing_if = "is_false")]
    pub include_sensors: bool,
    #[serde(rename = "includeEvents", skip_serializing_if = "is_false")]
    pub include_events: bool,
    #[serde(rename = "includeEquipmentStatus", skip_serializing_if = "is_false")]
    pub include_equipment_status: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Selection {
    pub fn registered() -> Self {
        Self {
            selection_type: "registered",
            selection_match: "",
            include_runtime: false,
            include_settings: false,
            include_sensors: false,
            include_events: false,
            include_equipment_status: false,
        }
    }

    pub fn for_query(kind: QueryKind) -> Self {
        match kind {
            QueryKind::Runtime => Self {
                include_runtime: true,
                include_settings: true,
                include_equipment_status: true,
                ..Self::registered()
            },
            QueryKind::Sensors => Self {
                include_sensors: true,
                ..Self::registered()
            },
        }
    }

    pub fn events() -> Self {
        Self {
            include_events: true,
            ..Self::registered()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ThermostatQuery {
    pub selection: Selection,
}

impl ThermostatQuery {
    /// Encoded form for the `body` query parameter of a thermostat GET.
    pub fn to_query_param(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionRequest {
    pub selection: Selection,
    pub functions: Vec<ThermostatFunction>,
}

impl FunctionRequest {
    pub fn single(function: ThermostatFunction) -> Self {
        Self {
            selection: Selection::registered(),
            functions: vec![function],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "params", rename_all = "camelCase")]
pub enum ThermostatFunction {
    SetHold(HoldParams),
    ResumeProgram(ResumeParams),
}

impl ThermostatFunction {
    /// Indefinite hold that forces the furnace fan on while keeping the current setpoints.
    pub fn fan_hold(heat_hold_temp: i32, cool_hold_temp: i32) -> Self {
        Self::SetHold(HoldParams {
            hold_type: "indefinite",
            fan: "on",
            heat_hold_temp,
            cool_hold_temp,
        })
    }

    pub fn resume_program() -> Self {
        Self::ResumeProgram(ResumeParams { resume_all: true })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SetHold(_) => "setHold",
            Self::ResumeProgram(_) => "resumeProgram",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HoldParams {
    #[serde(rename = "holdType")]
    pub hold_type: &'static str,
    pub fan: &'static str,
    #[serde(rename = "heatHoldTemp")]
    pub heat_hold_temp: i32,
    #[serde(rename = "coolHoldTemp")]
    pub cool_hold_temp: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResumeParams {
    #[serde(rename = "resumeAll")]
    pub resume_all: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiStatus {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
struct StatusEnvelope {
    status: ApiStatus,
}

/// True for a non-2xx response whose JSON body carries the expired-token status code.
pub fn is_expired_token(http_status: u16, body: &str) -> bool {
    if (200..300).contains(&http_status) {
        return false;
    }
    serde_json::from_str::<StatusEnvelope>(body)
        .map(|envelope| envelope.status.code == EXPIRED_TOKEN_CODE)
        .unwrap_or(false)
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeResponse {
    #[serde(rename = "ecobeePin")]
    pub pin: String,
    pub code: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub interval: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThermostatResponse {
    #[serde(rename = "thermostatList", default)]
    pub thermostats: Vec<Thermostat>,
    #[serde(default)]
    pub status: ApiStatus,
}

impl ThermostatResponse {
    /// The controller drives exactly one registered thermostat.
    pub fn into_primary(self) -> Option<Thermostat> {
        self.thermostats.into_iter().next()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Thermostat {
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub runtime: Option<Runtime>,
    #[serde(rename = "remoteSensors", default)]
    pub remote_sensors: Vec<RemoteSensor>,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(rename = "equipmentStatus", default)]
    pub equipment_status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Runtime {
    #[serde(rename = "actualTemperature")]
    pub actual_temperature: i32,
    #[serde(rename = "desiredHeat")]
    pub desired_heat: i32,
    #[serde(rename = "desiredCool")]
    pub desired_cool: i32,
    #[serde(default)]
    pub connected: bool,
}

impl Runtime {
    pub fn sample(&self) -> TemperatureSample {
        TemperatureSample {
            actual: self.actual_temperature,
            desired: self.desired_heat,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSensor {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub sensor_type: String,
    #[serde(default)]
    pub capability: Vec<SensorCapability>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorCapability {
    #[serde(rename = "type")]
    pub capability_type: String,
    #[serde(default)]
    pub value: String,
}

impl RemoteSensor {
    pub fn capability_value(&self, kind: &str) -> Option<&str> {
        self.capability
            .iter()
            .find(|capability| capability.capability_type == kind)
            .map(|capability| capability.value.as_str())
    }

    pub fn reading(&self) -> SensorReading {
        SensorReading {
            name: self.name.clone(),
            sensor_type: self.sensor_type.clone(),
            // Sensors out of range report "unknown".
            temperature: self
                .capability_value("temperature")
                .and_then(|value| value.parse().ok()),
            occupied: self.capability_value("occupancy").and_then(|value| match value {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub fan: Option<String>,
    #[serde(rename = "startDate", default)]
    pub start_date: Option<String>,
    #[serde(rename = "startTime", default)]
    pub start_time: Option<String>,
    #[serde(rename = "endDate", default)]
    pub end_date: Option<String>,
    #[serde(rename = "endTime", default)]
    pub end_time: Option<String>,
    #[serde(rename = "heatHoldTemp", default)]
    pub heat_hold_temp: Option<i32>,
    #[serde(rename = "coolHoldTemp", default)]
    pub cool_hold_temp: Option<i32>,
}
