use serde::Serialize;

/// Per-evaluation reading, in tenths of a degree Fahrenheit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemperatureSample {
    pub actual: i32,
    pub desired: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorReading {
    pub name: String,
    #[serde(rename = "sensorType")]
    pub sensor_type: String,
    pub temperature: Option<i32>,
    pub occupied: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlStatus {
    #[serde(rename = "loopActive")]
    pub loop_active: bool,
    #[serde(rename = "actuatorOn")]
    pub actuator_on: bool,
    #[serde(rename = "indicatorOn")]
    pub indicator_on: bool,
    #[serde(rename = "fanHoldActive")]
    pub fan_hold_active: bool,
    #[serde(rename = "overrideTarget")]
    pub override_target: Option<i32>,
    #[serde(rename = "currentTemp")]
    pub current_temp: Option<i32>,
    #[serde(rename = "desiredTemp")]
    pub desired_temp: Option<i32>,
    #[serde(rename = "lastDifferential")]
    pub last_differential: Option<i32>,
    #[serde(rename = "sensorReadings")]
    pub sensor_readings: Vec<SensorReading>,
    pub threshold: i32,
    pub pairing: &'static str,
    #[serde(rename = "lastEvaluationEpoch")]
    pub last_evaluation_epoch: Option<i64>,
    #[serde(rename = "remoteError", skip_serializing_if = "Option::is_none")]
    pub remote_error: Option<String>,
}
