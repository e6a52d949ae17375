//! Gateway WebSocket protocol types (command requests, command and variable responses).

use crate::exec::CommandLine;
use serde::{Deserialize, Deserializer, Serialize};

/// Inbound frame type that carries a command request.
pub const COMMAND_REQUEST: &str = "commandRequest";

/// Wire frame: `{ "type": "commandRequest", "data": {...} }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsFrame {
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Which output a `commandResponse` carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
    Completed,
    Image,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
            StreamKind::Completed => "completed",
            StreamKind::Image => "image",
        }
    }
}

/// `commandResponse` payload: `{ id, stream, data }`. `data` is a line of text,
/// an image path, or the exit status for `completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub id: String,
    pub stream: StreamKind,
    pub data: serde_json::Value,
}

/// `variableResponse` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableResponse {
    pub variable_name: String,
    pub variable_value: Option<String>,
}

/// Every event the server sends, framed as `{ "type", "data" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum OutboundEvent {
    CommandResponse(CommandResponse),
    VariableResponse(VariableResponse),
}

impl OutboundEvent {
    pub fn line(id: &str, stream: StreamKind, data: impl Into<String>) -> Self {
        OutboundEvent::CommandResponse(CommandResponse {
            id: id.to_string(),
            stream,
            data: serde_json::Value::String(data.into()),
        })
    }

    pub fn stdout(id: &str, data: impl Into<String>) -> Self {
        Self::line(id, StreamKind::Stdout, data)
    }

    pub fn stderr(id: &str, data: impl Into<String>) -> Self {
        Self::line(id, StreamKind::Stderr, data)
    }

    pub fn image(id: &str, path: impl Into<String>) -> Self {
        Self::line(id, StreamKind::Image, path)
    }

    pub fn completed(id: &str, status: i32) -> Self {
        OutboundEvent::CommandResponse(CommandResponse {
            id: id.to_string(),
            stream: StreamKind::Completed,
            data: serde_json::Value::from(status),
        })
    }

    pub fn variable(name: impl Into<String>, value: Option<String>) -> Self {
        OutboundEvent::VariableResponse(VariableResponse {
            variable_name: name.into(),
            variable_value: value,
        })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Where output events go. Emitting never blocks and never fails; a closed
/// transport drops events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: OutboundEvent);
}

impl EventSink for tokio::sync::mpsc::UnboundedSender<OutboundEvent> {
    fn emit(&self, event: OutboundEvent) {
        let _ = self.send(event);
    }
}

/// Malformed request payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("invalid request payload: {0}")]
    Malformed(String),
    #[error("missing field `{field}` for {kind} request")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
    #[error("invalid value for `{field}`: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// Request `data` exactly as sent; fields are checked per kind by [`CommandRequest::parse`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCommandRequest {
    #[serde(rename = "type", default)]
    pub typ: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(default)]
    pub cmd: Option<CommandLine>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub port: Option<serde_json::Value>,
    #[serde(default)]
    pub runcount: Option<serde_json::Value>,
    #[serde(default)]
    pub sourcelabel: Option<String>,
    #[serde(default)]
    pub targetlabel: Option<String>,
    #[serde(default)]
    pub latency: bool,
    #[serde(default)]
    pub bandwidth: bool,
}

/// Accept ids sent as strings or numbers.
fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let v = Option::<serde_json::Value>::deserialize(d)?;
    Ok(match v {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Parse a port or run count sent as a number or a numeric string.
fn lenient_int<T: std::str::FromStr>(
    value: Option<&serde_json::Value>,
    kind: &'static str,
    field: &'static str,
) -> Result<T, RequestError> {
    let v = value.ok_or(RequestError::MissingField { kind, field })?;
    let text = match v {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        other => other.to_string(),
    };
    text.parse().map_err(|_| RequestError::InvalidField {
        field,
        value: text,
    })
}

/// A performance test against `target:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerformanceRequest {
    pub id: String,
    pub target: String,
    pub port: u16,
    pub runcount: u32,
    pub source_label: String,
    pub target_label: String,
    pub latency: bool,
    pub bandwidth: bool,
}

/// One validated inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandRequest {
    /// Query a server-side value (`hostname`, `nameserver`) into a client variable.
    Variable {
        name: String,
        selector: Option<String>,
    },
    Performance(PerformanceRequest),
    Screenshot {
        id: String,
        target: String,
    },
    Halt {
        id: String,
    },
    Command {
        id: String,
        cmd: CommandLine,
    },
}

impl CommandRequest {
    /// Parse the `data` of a `commandRequest` frame.
    pub fn parse(data: serde_json::Value) -> Result<Self, RequestError> {
        let raw: RawCommandRequest =
            serde_json::from_value(data).map_err(|e| RequestError::Malformed(e.to_string()))?;
        Self::try_from(raw)
    }

    /// Correlation id, when the request kind carries one.
    pub fn id(&self) -> Option<&str> {
        match self {
            CommandRequest::Variable { .. } => None,
            CommandRequest::Performance(p) => Some(p.id.as_str()),
            CommandRequest::Screenshot { id, .. }
            | CommandRequest::Halt { id }
            | CommandRequest::Command { id, .. } => Some(id.as_str()),
        }
    }
}

impl TryFrom<RawCommandRequest> for CommandRequest {
    type Error = RequestError;

    fn try_from(raw: RawCommandRequest) -> Result<Self, Self::Error> {
        let kind = raw.typ.as_deref().unwrap_or("command");
        match kind {
            "variable" => {
                let name = raw.target.ok_or(RequestError::MissingField {
                    kind: "variable",
                    field: "target",
                })?;
                Ok(CommandRequest::Variable {
                    name,
                    selector: raw.cmd.as_ref().and_then(|c| c.first()).map(String::from),
                })
            }
            "performance" => {
                let id = raw.id.ok_or(RequestError::MissingField {
                    kind: "performance",
                    field: "id",
                })?;
                let target = raw.target.ok_or(RequestError::MissingField {
                    kind: "performance",
                    field: "target",
                })?;
                let port = lenient_int(raw.port.as_ref(), "performance", "port")?;
                let runcount = lenient_int(raw.runcount.as_ref(), "performance", "runcount")?;
                Ok(CommandRequest::Performance(PerformanceRequest {
                    id,
                    source_label: raw.sourcelabel.unwrap_or_default(),
                    target_label: raw.targetlabel.unwrap_or_else(|| target.clone()),
                    target,
                    port,
                    runcount,
                    latency: raw.latency,
                    bandwidth: raw.bandwidth,
                }))
            }
            "webscreenshot" => Ok(CommandRequest::Screenshot {
                id: raw.id.ok_or(RequestError::MissingField {
                    kind: "webscreenshot",
                    field: "id",
                })?,
                target: raw.target.ok_or(RequestError::MissingField {
                    kind: "webscreenshot",
                    field: "target",
                })?,
            }),
            "halt" => Ok(CommandRequest::Halt {
                id: raw.id.unwrap_or_default(),
            }),
            _ => Ok(CommandRequest::Command {
                id: raw.id.ok_or(RequestError::MissingField {
                    kind: "command",
                    field: "id",
                })?,
                cmd: raw.cmd.ok_or(RequestError::MissingField {
                    kind: "command",
                    field: "cmd",
                })?,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_command_is_default_kind() {
        let req = CommandRequest::parse(json!({"type": "command", "id": "1", "cmd": "echo hi"})).unwrap();
        assert_eq!(
            req,
            CommandRequest::Command {
                id: "1".into(),
                cmd: CommandLine::Line("echo hi".into())
            }
        );
        let req = CommandRequest::parse(json!({"id": 7, "cmd": ["ls", "-la"]})).unwrap();
        assert_eq!(req.id(), Some("7"));
    }

    #[test]
    fn performance_accepts_numeric_strings() {
        let req = CommandRequest::parse(json!({
            "type": "performance", "id": "p", "target": "db", "port": "11111",
            "runcount": 3, "sourcelabel": "a", "targetlabel": "b", "latency": true
        }))
        .unwrap();
        let CommandRequest::Performance(p) = req else { panic!("expected performance") };
        assert_eq!(p.port, 11111);
        assert_eq!(p.runcount, 3);
        assert!(p.latency);
        assert!(!p.bandwidth);
    }

    #[test]
    fn performance_rejects_bad_port() {
        let err = CommandRequest::parse(json!({
            "type": "performance", "id": "p", "target": "db", "port": "http", "runcount": 1
        }))
        .unwrap_err();
        assert!(matches!(err, RequestError::InvalidField { field: "port", .. }));
    }

    #[test]
    fn missing_fields_are_reported() {
        let err = CommandRequest::parse(json!({"type": "webscreenshot", "id": "s"})).unwrap_err();
        assert_eq!(
            err,
            RequestError::MissingField {
                kind: "webscreenshot",
                field: "target"
            }
        );
        let err = CommandRequest::parse(json!({"id": "1"})).unwrap_err();
        assert!(matches!(err, RequestError::MissingField { field: "cmd", .. }));
    }

    #[test]
    fn variable_selector_from_cmd() {
        let req = CommandRequest::parse(json!({"type": "variable", "target": "host", "cmd": ["hostname"]})).unwrap();
        assert_eq!(
            req,
            CommandRequest::Variable {
                name: "host".into(),
                selector: Some("hostname".into())
            }
        );
    }

    #[test]
    fn outbound_wire_shape() {
        let ev = OutboundEvent::completed("1", 0);
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"type": "commandResponse", "data": {"id": "1", "stream": "completed", "data": 0}})
        );
        let ev = OutboundEvent::variable("host", None);
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"type": "variableResponse", "data": {"variableName": "host", "variableValue": null}})
        );
    }
}
