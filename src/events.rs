//! Typed gateway events.
//!
//! The session core reacts to a small, fixed set of dispatch names and
//! otherwise forwards the raw `(event_name, data)` pair to the handler
//! registry untouched — user handlers see raw JSON. This enum only exists
//! to give the session core's own bookkeeping (cache sync, READY, protocol
//! ops) a typed match instead of stringly comparing `t` everywhere.

use serde::Deserialize;
use tracing::warn;

use crate::types::*;

#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Ready(ReadyEvent),
    GuildCreate(Guild),
    GuildUpdate(Guild),
    GuildDelete(GuildDeleteEvent),
    ChannelCreate(Channel),
    ChannelUpdate(Channel),
    ChannelDelete(ChannelDeleteEvent),
    GuildMemberAdd(GuildMemberFields),
    GuildMemberUpdate(GuildMemberFields),
    GuildMemberRemove(GuildMemberRemoveEvent),
    MessageCreate(Message),

    /// Heartbeat ACK from the gateway (op 11).
    HeartbeatAck,
    /// The gateway is asking us to heartbeat immediately (op 1).
    HeartbeatRequest,
    /// Gateway told us to reconnect (op 7).
    Reconnect,
    /// Session has been invalidated (op 9). The bool indicates whether the
    /// session is resumable.
    InvalidSession(bool),

    /// Any other dispatch event or unrecognized op, carried as raw JSON for
    /// the handler registry.
    Unknown {
        event_name: Option<String>,
        op: u8,
        data: Option<serde_json::Value>,
    },
}

impl GatewayEvent {
    /// Parse a raw [`GatewayPayload`] into a typed event. Never fails:
    /// unrecognized shapes fall back to [`GatewayEvent::Unknown`].
    pub fn from_payload(payload: GatewayPayload) -> Self {
        match payload.op {
            0 => Self::parse_dispatch(payload.t.as_deref(), payload.d),
            1 => GatewayEvent::HeartbeatRequest,
            7 => GatewayEvent::Reconnect,
            9 => {
                let resumable = payload.d.as_ref().and_then(|v| v.as_bool()).unwrap_or(false);
                GatewayEvent::InvalidSession(resumable)
            }
            11 => GatewayEvent::HeartbeatAck,
            op => GatewayEvent::Unknown {
                event_name: payload.t,
                op,
                data: payload.d,
            },
        }
    }

    fn parse_dispatch(event_name: Option<&str>, data: Option<serde_json::Value>) -> Self {
        let Some(name) = event_name else {
            return GatewayEvent::Unknown {
                event_name: None,
                op: 0,
                data,
            };
        };
        let Some(d) = data else {
            return GatewayEvent::Unknown {
                event_name: Some(name.to_string()),
                op: 0,
                data: None,
            };
        };

        macro_rules! try_parse {
            ($variant:expr) => {
                match serde_json::from_value(d.clone()) {
                    Ok(parsed) => $variant(parsed),
                    Err(e) => {
                        warn!(event = name, error = %e, "failed to parse dispatch payload");
                        GatewayEvent::Unknown {
                            event_name: Some(name.to_string()),
                            op: 0,
                            data: Some(d),
                        }
                    }
                }
            };
        }

        match name {
            "READY" => try_parse!(GatewayEvent::Ready),
            "GUILD_CREATE" => try_parse!(GatewayEvent::GuildCreate),
            "GUILD_UPDATE" => try_parse!(GatewayEvent::GuildUpdate),
            "GUILD_DELETE" => try_parse!(GatewayEvent::GuildDelete),
            "CHANNEL_CREATE" => try_parse!(GatewayEvent::ChannelCreate),
            "CHANNEL_UPDATE" => try_parse!(GatewayEvent::ChannelUpdate),
            "CHANNEL_DELETE" => try_parse!(GatewayEvent::ChannelDelete),
            "GUILD_MEMBER_ADD" => try_parse!(GatewayEvent::GuildMemberAdd),
            "GUILD_MEMBER_UPDATE" => try_parse!(GatewayEvent::GuildMemberUpdate),
            "GUILD_MEMBER_REMOVE" => try_parse!(GatewayEvent::GuildMemberRemove),
            "MESSAGE_CREATE" => try_parse!(GatewayEvent::MessageCreate),
            _ => GatewayEvent::Unknown {
                event_name: Some(name.to_string()),
                op: 0,
                data: Some(d),
            },
        }
    }
}

/// Convenience trait for pulling a typed value out of an Unknown event's data.
pub trait UnknownEventExt {
    fn try_parse_data<T: for<'de> Deserialize<'de>>(&self) -> Option<T>;
}

impl UnknownEventExt for GatewayEvent {
    fn try_parse_data<T: for<'de> Deserialize<'de>>(&self) -> Option<T> {
        match self {
            GatewayEvent::Unknown { data: Some(d), .. } => serde_json::from_value(d.clone()).ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecognized_dispatch_becomes_unknown() {
        let payload = GatewayPayload {
            op: 0,
            d: Some(serde_json::json!({"foo": "bar"})),
            s: Some(1),
            t: Some("SOME_FUTURE_EVENT".into()),
        };
        match GatewayEvent::from_payload(payload) {
            GatewayEvent::Unknown { event_name, .. } => {
                assert_eq!(event_name.as_deref(), Some("SOME_FUTURE_EVENT"));
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn invalid_session_carries_resumable_flag() {
        let payload = GatewayPayload {
            op: 9,
            d: Some(serde_json::Value::Bool(true)),
            s: None,
            t: None,
        };
        assert!(matches!(
            GatewayEvent::from_payload(payload),
            GatewayEvent::InvalidSession(true)
        ));
    }

    #[test]
    fn message_create_parses_into_typed_message() {
        let payload = GatewayPayload {
            op: 0,
            d: Some(serde_json::json!({
                "id": "1", "channel_id": "2", "guild_id": null,
                "author": {"id": "3", "username": "a", "discriminator": null,
                           "avatar": null, "bot": false, "global_name": null},
                "content": "hi", "timestamp": "2020-01-01T00:00:00.000000+00:00"
            })),
            s: Some(5),
            t: Some("MESSAGE_CREATE".into()),
        };
        match GatewayEvent::from_payload(payload) {
            GatewayEvent::MessageCreate(msg) => assert_eq!(msg.content, "hi"),
            other => panic!("expected MessageCreate, got {other:?}"),
        }
    }
}
