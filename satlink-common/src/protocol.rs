//! Coordination protocol frames.
//!
//! Every frame is a JSON object `{"event": <wire name>, "data": {...}}`. Wire
//! names are stable; the payload of every unit-originated event carries the
//! `fu_id` so frames can be routed without a separate handshake.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{GpsFix, PassEntry, Slot, UnitView};

/// Frames sent to the server by field units. Operators may send
/// `select_satellite` and `request_clients`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    FieldUnitPresence(PresenceReport),
    SelectSatellite(SatelliteSelection),
    TelemetryReport(TelemetryReport),
    ResultReport(ResultReport),
    PollRequest(PollRequest),
    /// Ask for the current aggregate; answered to the sender only
    RequestClients(AggregateRequest),
}

impl ClientEvent {
    pub fn wire_name(&self) -> &'static str {
        match self {
            ClientEvent::FieldUnitPresence(_) => "field_unit_presence",
            ClientEvent::SelectSatellite(_) => "select_satellite",
            ClientEvent::TelemetryReport(_) => "telemetry_report",
            ClientEvent::ResultReport(_) => "result_report",
            ClientEvent::PollRequest(_) => "poll_request",
            ClientEvent::RequestClients(_) => "request_clients",
        }
    }

    /// `None` for frames that are not about a particular unit.
    pub fn fu_id(&self) -> Option<&str> {
        match self {
            ClientEvent::FieldUnitPresence(p) => Some(&p.fu_id),
            ClientEvent::SelectSatellite(s) => Some(&s.fu_id),
            ClientEvent::TelemetryReport(t) => Some(&t.fu_id),
            ClientEvent::ResultReport(r) => Some(&r.fu_id),
            ClientEvent::PollRequest(p) => Some(&p.fu_id),
            ClientEvent::RequestClients(_) => None,
        }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    AzElTarget(AzElTarget),
    /// Relayed operator selection, delivered to the selected unit
    SelectSatellite(SatelliteSelection),
    AggregateState(AggregateState),
    AssignmentUpdate(AssignmentUpdate),
    Error(ErrorNotice),
}

impl ServerEvent {
    pub fn wire_name(&self) -> &'static str {
        match self {
            ServerEvent::AzElTarget(_) => "az_el_target",
            ServerEvent::SelectSatellite(_) => "select_satellite",
            ServerEvent::AggregateState(_) => "aggregate_state",
            ServerEvent::AssignmentUpdate(_) => "assignment_update",
            ServerEvent::Error(_) => "error",
        }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceReport {
    pub fu_id: String,
    /// `None` keeps the slots the server already knows about
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occupied_slots: Option<Vec<Slot>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SatelliteSelection {
    pub fu_id: String,
    pub satellite_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReport {
    pub fu_id: String,
    #[serde(default)]
    pub sensor_data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultReport {
    pub fu_id: String,
    pub az: f64,
    pub el: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gps: Option<GpsFix>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satellite_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollRequest {
    pub fu_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AzElTarget {
    pub fu_id: String,
    pub satellite_name: String,
    pub az: f64,
    pub el: f64,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateState {
    pub units: Vec<UnitView>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentUpdate {
    pub fu_id: String,
    pub passes: Vec<PassEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_shape() {
        let frame = r#"{"event":"poll_request","data":{"fu_id":"FU1"}}"#;
        let event = ClientEvent::from_json(frame).unwrap();
        assert_eq!(event.wire_name(), "poll_request");
        assert_eq!(event.fu_id(), Some("FU1"));
    }

    #[test]
    fn test_request_clients_has_no_unit() {
        let frame = r#"{"event":"request_clients","data":{}}"#;
        let event = ClientEvent::from_json(frame).unwrap();
        assert_eq!(event, ClientEvent::RequestClients(AggregateRequest {}));
        assert_eq!(event.wire_name(), "request_clients");
        assert_eq!(event.fu_id(), None);
        assert_eq!(event.to_json().unwrap(), frame);
    }

    #[test]
    fn test_presence_without_slots() {
        let frame = r#"{"event":"field_unit_presence","data":{"fu_id":"b8:27:eb:00:00:01"}}"#;
        match ClientEvent::from_json(frame).unwrap() {
            ClientEvent::FieldUnitPresence(p) => assert!(p.occupied_slots.is_none()),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_result_report_requires_angles() {
        let frame = r#"{"event":"result_report","data":{"fu_id":"FU1","az":12.5}}"#;
        assert!(ClientEvent::from_json(frame).is_err());

        let frame = r#"{"event":"result_report","data":{"fu_id":"FU1","az":12.5,"el":40.0,
            "gps":{"lat":28.6,"lon":77.2,"alt":216.0},"satellite_name":"NOAA 19"}}"#;
        let event = ClientEvent::from_json(frame).unwrap();
        assert_eq!(event.wire_name(), "result_report");
    }

    #[test]
    fn test_unknown_event_rejected() {
        let frame = r#"{"event":"az_el_result","data":{"fu_id":"FU1"}}"#;
        assert!(ClientEvent::from_json(frame).is_err());
    }

    #[test]
    fn test_server_event_wire_name_matches_tag() {
        let event = ServerEvent::Error(ErrorNotice {
            message: "bad frame".to_string(),
        });
        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["event"], event.wire_name());
    }
}
