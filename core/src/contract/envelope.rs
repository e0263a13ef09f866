//! Wire envelopes and the type-tag codec
//!
//! Commands and events cross a transport as JSON envelopes:
//!
//! ```json
//! {"token":"..","id":"..","commandType":"SubmitCode",
//!  "command":{"code":"1+1","targetKernelName":"csharp"},
//!  "routingSlip":["kernel://local/?tag=arrived"]}
//!
//! {"eventType":"ReturnValueProduced","event":{..},
//!  "command":{..command envelope..},"routingSlip":["kernel://remote/csharp"]}
//! ```
//!
//! The payload is looked up by its tag. Built-in tags are always known;
//! runtime-defined ones must be registered on both ends, and an unknown tag
//! is rejected with [`MeshError::UnregisteredType`] rather than dropped.

use std::collections::HashSet;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::command::{CommandPayload, CustomCommand, KernelCommand, RequestKernelInfo, SubmitCode};
use super::events::{CustomEvent, EventPayload, KernelEvent};
use super::ids::{CommandId, CommandToken, KernelUri};
use crate::error::{MeshError, PayloadKind, Result};
use crate::routing_slip::{CommandRoutingSlip, EventRoutingSlip};

const BUILTIN_COMMAND_TYPES: &[&str] = &[SubmitCode::TYPE, RequestKernelInfo::TYPE];

const BUILTIN_EVENT_TYPES: &[&str] = &[
    "CommandSucceeded",
    "CommandFailed",
    "ErrorProduced",
    "DiagnosticsProduced",
    "DisplayedValueProduced",
    "ReturnValueProduced",
    "StandardOutputValueProduced",
    "KernelInfoProduced",
    "KernelReady",
];

const TARGET_KERNEL_NAME: &str = "targetKernelName";
const ORIGIN_URI: &str = "originUri";
const DESTINATION_URI: &str = "destinationUri";

/// A message on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Command(KernelCommand),
    Event(KernelEvent),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandEnvelopeModel {
    token: String,
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_id: Option<String>,
    command_type: String,
    #[serde(default)]
    command: Value,
    #[serde(default)]
    routing_slip: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventEnvelopeModel {
    event_type: String,
    #[serde(default)]
    event: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command: Option<CommandEnvelopeModel>,
    #[serde(default)]
    routing_slip: Vec<String>,
}

/// JSON codec with a registry of payload tags
#[derive(Debug)]
pub struct WireCodec {
    command_types: RwLock<HashSet<String>>,
    event_types: RwLock<HashSet<String>>,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl WireCodec {
    pub fn new() -> Self {
        Self {
            command_types: RwLock::new(BUILTIN_COMMAND_TYPES.iter().map(|t| t.to_string()).collect()),
            event_types: RwLock::new(BUILTIN_EVENT_TYPES.iter().map(|t| t.to_string()).collect()),
        }
    }

    /// Allow a custom command tag on the wire; false if already known
    pub fn register_command_type(&self, tag: impl Into<String>) -> bool {
        self.command_types.write().insert(tag.into())
    }

    /// Allow a custom event tag on the wire; false if already known
    pub fn register_event_type(&self, tag: impl Into<String>) -> bool {
        self.event_types.write().insert(tag.into())
    }

    pub fn is_registered(&self, kind: PayloadKind, tag: &str) -> bool {
        match kind {
            PayloadKind::Command => self.command_types.read().contains(tag),
            PayloadKind::Event => self.event_types.read().contains(tag),
        }
    }

    pub fn encode(&self, message: &WireMessage) -> Result<String> {
        let json = match message {
            WireMessage::Command(command) => serde_json::to_string(&self.command_model(command)?)?,
            WireMessage::Event(event) => serde_json::to_string(&self.event_model(event)?)?,
        };
        Ok(json)
    }

    pub fn decode(&self, json: &str) -> Result<WireMessage> {
        let value: Value = serde_json::from_str(json)?;
        let (is_event, is_command) = match value.as_object() {
            Some(object) => (object.contains_key("eventType"), object.contains_key("commandType")),
            None => {
                return Err(MeshError::Serialization("envelope is not a JSON object".to_string()))
            }
        };
        if is_event {
            let model: EventEnvelopeModel = serde_json::from_value(value)?;
            Ok(WireMessage::Event(self.event_from_model(model)?))
        } else if is_command {
            let model: CommandEnvelopeModel = serde_json::from_value(value)?;
            Ok(WireMessage::Command(self.command_from_model(model)?))
        } else {
            Err(MeshError::Serialization(
                "envelope carries neither commandType nor eventType".to_string(),
            ))
        }
    }

    fn ensure_registered(&self, kind: PayloadKind, tag: &str) -> Result<()> {
        if self.is_registered(kind, tag) {
            Ok(())
        } else {
            Err(MeshError::UnregisteredType {
                kind,
                tag: tag.to_string(),
            })
        }
    }

    fn command_model(&self, command: &KernelCommand) -> Result<CommandEnvelopeModel> {
        let tag = command.command_type();
        self.ensure_registered(PayloadKind::Command, tag)?;

        let body = match &command.payload {
            CommandPayload::SubmitCode(submit) => serde_json::to_value(submit)?,
            CommandPayload::RequestKernelInfo(request) => serde_json::to_value(request)?,
            CommandPayload::Custom(custom) => custom.body.clone(),
        };
        let mut fields = into_object(body, tag)?;
        if let Some(target) = &command.target_kernel_name {
            fields.insert(TARGET_KERNEL_NAME.to_string(), Value::String(target.clone()));
        }
        if let Some(origin) = &command.origin_uri {
            fields.insert(ORIGIN_URI.to_string(), Value::String(origin.to_string()));
        }
        if let Some(destination) = &command.destination_uri {
            fields.insert(DESTINATION_URI.to_string(), Value::String(destination.to_string()));
        }

        Ok(CommandEnvelopeModel {
            token: command.token.to_string(),
            id: command.id.to_string(),
            parent_id: command.parent_id.as_ref().map(|id| id.to_string()),
            command_type: tag.to_string(),
            command: Value::Object(fields),
            routing_slip: command.routing_slip.to_wire(),
        })
    }

    fn command_from_model(&self, model: CommandEnvelopeModel) -> Result<KernelCommand> {
        let tag = model.command_type;
        let mut fields = into_object(model.command, &tag)?;
        let target_kernel_name = take_string(&mut fields, TARGET_KERNEL_NAME)?;
        let origin_uri = take_string(&mut fields, ORIGIN_URI)?
            .map(|raw| KernelUri::parse(&raw))
            .transpose()?;
        let destination_uri = take_string(&mut fields, DESTINATION_URI)?
            .map(|raw| KernelUri::parse(&raw))
            .transpose()?;

        let body = Value::Object(fields);
        let payload = match tag.as_str() {
            SubmitCode::TYPE => CommandPayload::SubmitCode(serde_json::from_value(body)?),
            RequestKernelInfo::TYPE => CommandPayload::RequestKernelInfo(serde_json::from_value(body)?),
            custom => {
                self.ensure_registered(PayloadKind::Command, custom)?;
                CommandPayload::Custom(CustomCommand {
                    command_type: custom.to_string(),
                    body,
                })
            }
        };

        Ok(KernelCommand {
            id: CommandId::from_string(model.id),
            token: CommandToken::from_string(model.token),
            parent_id: model.parent_id.map(CommandId::from_string),
            target_kernel_name,
            origin_uri,
            destination_uri,
            payload,
            routing_slip: CommandRoutingSlip::from_wire(&model.routing_slip)?,
        })
    }

    fn event_model(&self, event: &KernelEvent) -> Result<EventEnvelopeModel> {
        let tag = event.event_type();
        self.ensure_registered(PayloadKind::Event, tag)?;

        let body = match &event.payload {
            EventPayload::CommandSucceeded(e) => serde_json::to_value(e)?,
            EventPayload::CommandFailed(e) => serde_json::to_value(e)?,
            EventPayload::ErrorProduced(e) => serde_json::to_value(e)?,
            EventPayload::DiagnosticsProduced(e) => serde_json::to_value(e)?,
            EventPayload::DisplayedValueProduced(e) => serde_json::to_value(e)?,
            EventPayload::ReturnValueProduced(e) => serde_json::to_value(e)?,
            EventPayload::StandardOutputValueProduced(e) => serde_json::to_value(e)?,
            EventPayload::KernelInfoProduced(e) => serde_json::to_value(e)?,
            EventPayload::KernelReady(e) => serde_json::to_value(e)?,
            EventPayload::Custom(e) => e.body.clone(),
        };

        Ok(EventEnvelopeModel {
            event_type: tag.to_string(),
            event: body,
            command: event.command.as_ref().map(|c| self.command_model(c)).transpose()?,
            routing_slip: event.routing_slip.to_wire(),
        })
    }

    fn event_from_model(&self, model: EventEnvelopeModel) -> Result<KernelEvent> {
        let body = model.event;
        let payload = match model.event_type.as_str() {
            "CommandSucceeded" => EventPayload::CommandSucceeded(serde_json::from_value(body)?),
            "CommandFailed" => EventPayload::CommandFailed(serde_json::from_value(body)?),
            "ErrorProduced" => EventPayload::ErrorProduced(serde_json::from_value(body)?),
            "DiagnosticsProduced" => EventPayload::DiagnosticsProduced(serde_json::from_value(body)?),
            "DisplayedValueProduced" => EventPayload::DisplayedValueProduced(serde_json::from_value(body)?),
            "ReturnValueProduced" => EventPayload::ReturnValueProduced(serde_json::from_value(body)?),
            "StandardOutputValueProduced" => {
                EventPayload::StandardOutputValueProduced(serde_json::from_value(body)?)
            }
            "KernelInfoProduced" => EventPayload::KernelInfoProduced(serde_json::from_value(body)?),
            "KernelReady" => EventPayload::KernelReady(serde_json::from_value(body)?),
            custom => {
                self.ensure_registered(PayloadKind::Event, custom)?;
                EventPayload::Custom(CustomEvent {
                    event_type: custom.to_string(),
                    body,
                })
            }
        };

        Ok(KernelEvent {
            payload,
            command: model.command.map(|c| self.command_from_model(c)).transpose()?,
            routing_slip: EventRoutingSlip::from_wire(&model.routing_slip)?,
        })
    }
}

fn into_object(value: Value, tag: &str) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => Err(MeshError::Serialization(format!(
            "payload of {} must be a JSON object",
            tag
        ))),
    }
}

fn take_string(fields: &mut Map<String, Value>, key: &str) -> Result<Option<String>> {
    match fields.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(MeshError::Serialization(format!(
            "{} must be a string, got {}",
            key, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::events::FormattedValue;

    fn uri(raw: &str) -> KernelUri {
        KernelUri::parse(raw).unwrap()
    }

    #[test]
    fn test_command_round_trip_keeps_routing() {
        let codec = WireCodec::new();
        let parent = KernelCommand::submit_code("#!csharp\n1+1");
        let mut command = KernelCommand::child_of(&parent, parent.payload.clone())
            .with_target("csharp")
            .with_destination(uri("kernel://remote/csharp"));
        command.origin_uri = Some(uri("kernel://local/csharp-proxy"));
        command.routing_slip.stamp_as_arrived(&uri("kernel://local/")).unwrap();

        let json = codec.encode(&WireMessage::Command(command.clone())).unwrap();
        assert!(json.contains("\"commandType\":\"SubmitCode\""));
        assert!(json.contains("kernel://local/?tag=arrived"));

        let decoded = codec.decode(&json).unwrap();
        assert_eq!(decoded, WireMessage::Command(command));
    }

    #[test]
    fn test_event_round_trip_carries_command() {
        let codec = WireCodec::new();
        let command = KernelCommand::submit_code("40+2");
        let mut event = KernelEvent::return_value(&command, FormattedValue::plain_text("42"));
        event.routing_slip.stamp(&uri("kernel://remote/csharp")).unwrap();

        let json = codec.encode(&WireMessage::Event(event.clone())).unwrap();
        let WireMessage::Event(decoded) = codec.decode(&json).unwrap() else {
            panic!("expected an event");
        };
        assert_eq!(decoded, event);
        assert_eq!(decoded.command_id(), Some(&command.id));
    }

    #[test]
    fn test_unregistered_command_type_is_named() {
        let sender = WireCodec::new();
        sender.register_command_type("RequestHover");
        let json = sender
            .encode(&WireMessage::Command(KernelCommand::custom(
                "RequestHover",
                serde_json::json!({"line": 3}),
            )))
            .unwrap();

        let receiver = WireCodec::new();
        let err = receiver.decode(&json).unwrap_err();
        assert_eq!(err.to_string(), "unregistered command type 'RequestHover'");

        receiver.register_command_type("RequestHover");
        let WireMessage::Command(command) = receiver.decode(&json).unwrap() else {
            panic!("expected a command");
        };
        match command.payload {
            CommandPayload::Custom(custom) => assert_eq!(custom.body["line"], 3),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_unregistered_event_type_fails_encoding() {
        let codec = WireCodec::new();
        let event = KernelEvent::unsolicited(EventPayload::Custom(CustomEvent {
            event_type: "VariablesChanged".to_string(),
            body: serde_json::json!({}),
        }));
        let err = codec.encode(&WireMessage::Event(event)).unwrap_err();
        assert!(matches!(
            err,
            MeshError::UnregisteredType { kind: PayloadKind::Event, ref tag } if tag == "VariablesChanged"
        ));
    }

    #[test]
    fn test_untagged_envelope_rejected() {
        let codec = WireCodec::new();
        assert!(codec.decode("{\"id\":\"1\"}").is_err());
        assert!(codec.decode("[1,2]").is_err());
    }
}
