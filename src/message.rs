//! Codec for the JSON array envelopes of the relay protocol.

use serde_json::{json, Value};
use thiserror::Error;

use crate::event::Event;
use crate::filter::Filter;

/// Failures while decoding an inbound envelope.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Not JSON, not an array, or no string tag: dropped without a reply.
    #[error("unparseable message")]
    Unparseable,
    /// An array envelope with fewer than two elements.
    #[error("request has less than 2 parameters")]
    TooShort,
    #[error("failed to decode event: {0}")]
    BadEvent(String),
    #[error("failed to decode auth event: {0}")]
    BadAuthEvent(String),
    #[error("failed to decode filter")]
    BadFilter,
}

/// Messages sent from client to relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// Publish an event: `["EVENT", <event>]`.
    Event(Box<Event>),
    /// Open a subscription: `["REQ", <sub-id>, <filter>, ...]`.
    Req { id: String, filters: Vec<Filter> },
    /// Count-only query: `["COUNT", <sub-id>, <filter>, ...]`.
    Count { id: String, filters: Vec<Filter> },
    /// Cancel a subscription: `["CLOSE", <sub-id>]`.
    Close { id: String },
    /// Respond to an AUTH challenge: `["AUTH", <signed-event>]`.
    Auth(Box<Event>),
    /// Envelope with a tag the relay does not recognize.
    Unknown { tag: String, rest: Vec<Value> },
}

impl ClientMessage {
    /// Decode one inbound text frame.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let val: Value = serde_json::from_str(text).map_err(|_| ParseError::Unparseable)?;
        let arr = val.as_array().ok_or(ParseError::Unparseable)?;
        if arr.len() < 2 {
            return Err(ParseError::TooShort);
        }
        let tag = arr[0].as_str().ok_or(ParseError::Unparseable)?;
        match tag {
            "EVENT" => {
                let event: Event = serde_json::from_value(arr[1].clone())
                    .map_err(|e| ParseError::BadEvent(e.to_string()))?;
                Ok(ClientMessage::Event(Box::new(event)))
            }
            "REQ" => {
                let id = arr[1].as_str().unwrap_or_default().to_string();
                let filters = parse_filters(&arr[2..])?;
                Ok(ClientMessage::Req { id, filters })
            }
            "COUNT" => {
                let id = arr[1].as_str().unwrap_or_default().to_string();
                let filters = parse_filters(&arr[2..])?;
                Ok(ClientMessage::Count { id, filters })
            }
            "CLOSE" => {
                let id = arr[1].as_str().unwrap_or_default().to_string();
                Ok(ClientMessage::Close { id })
            }
            "AUTH" => {
                let event: Event = serde_json::from_value(arr[1].clone())
                    .map_err(|e| ParseError::BadAuthEvent(e.to_string()))?;
                Ok(ClientMessage::Auth(Box::new(event)))
            }
            _ => Ok(ClientMessage::Unknown {
                tag: tag.to_string(),
                rest: arr[1..].to_vec(),
            }),
        }
    }
}

/// Parse the filter objects trailing a REQ or COUNT envelope.
fn parse_filters(values: &[Value]) -> Result<Vec<Filter>, ParseError> {
    values
        .iter()
        .map(|v| Filter::from_value(v).ok_or(ParseError::BadFilter))
        .collect()
}

/// Messages sent from relay to client.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    /// Event matching a subscription: `["EVENT", <sub-id>, <event>]`.
    Event { sub_id: String, event: Event },
    /// Per-event acknowledgement: `["OK", <event-id>, <accepted>, <reason>]`.
    Ok {
        event_id: String,
        accepted: bool,
        reason: String,
    },
    /// End of stored events: `["EOSE", <sub-id>]`.
    Eose { sub_id: String },
    /// Human-readable error outside any subscription: `["NOTICE", <text>]`.
    Notice { message: String },
    /// Authentication challenge: `["AUTH", <challenge>]`.
    Auth { challenge: String },
    /// Count response: `["COUNT", <sub-id>, {"count": <n>}]`.
    Count { sub_id: String, count: u64 },
}

impl RelayMessage {
    /// Encode to the JSON text sent on the wire.
    pub fn to_json(&self) -> String {
        match self {
            RelayMessage::Event { sub_id, event } => {
                json!(["EVENT", sub_id, event]).to_string()
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                reason,
            } => json!(["OK", event_id, accepted, reason]).to_string(),
            RelayMessage::Eose { sub_id } => json!(["EOSE", sub_id]).to_string(),
            RelayMessage::Notice { message } => json!(["NOTICE", message]).to_string(),
            RelayMessage::Auth { challenge } => json!(["AUTH", challenge]).to_string(),
            RelayMessage::Count { sub_id, count } => {
                json!(["COUNT", sub_id, {"count": count}]).to_string()
            }
        }
    }

    /// Create an EVENT message for a subscription.
    pub fn event(sub_id: impl Into<String>, event: Event) -> Self {
        RelayMessage::Event {
            sub_id: sub_id.into(),
            event,
        }
    }

    /// Create an OK acknowledgement.
    pub fn ok(event_id: impl Into<String>, accepted: bool, reason: impl Into<String>) -> Self {
        RelayMessage::Ok {
            event_id: event_id.into(),
            accepted,
            reason: reason.into(),
        }
    }

    /// Create an EOSE message.
    pub fn eose(sub_id: impl Into<String>) -> Self {
        RelayMessage::Eose {
            sub_id: sub_id.into(),
        }
    }

    /// Create a NOTICE message.
    pub fn notice(message: impl Into<String>) -> Self {
        RelayMessage::Notice {
            message: message.into(),
        }
    }

    /// Create an AUTH challenge message.
    pub fn auth(challenge: impl Into<String>) -> Self {
        RelayMessage::Auth {
            challenge: challenge.into(),
        }
    }

    /// Create a COUNT response.
    pub fn count(sub_id: impl Into<String>, count: u64) -> Self {
        RelayMessage::Count {
            sub_id: sub_id.into(),
            count,
        }
    }
}
