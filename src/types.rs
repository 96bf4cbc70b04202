//! Typed representations of gateway/REST objects.
//!
//! These mirror the wire shapes closely enough to deserialize dispatch
//! payloads and REST responses without touching `serde_json::Value` outside
//! of the places that genuinely need raw JSON (the handler registry, the
//! worker pool's tasks).

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

/// IDs are snowflakes transmitted as strings in JSON.
pub type Snowflake = String;

/// Unix-millis timestamp derived from a snowflake ID.
pub fn snowflake_timestamp_ms(id: &str) -> Option<u64> {
    id.parse::<u64>().ok().map(|sf| (sf >> 22) + 1420070400000)
}

// ---------------------------------------------------------------------------
// Gateway payload (the envelope that wraps every WS message)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayPayload {
    pub op: u8,
    pub d: Option<serde_json::Value>,
    pub s: Option<u64>,
    pub t: Option<String>,
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct User {
    pub id: Snowflake,
    pub username: String,
    pub discriminator: Option<String>,
    pub avatar: Option<String>,
    #[serde(default)]
    pub bot: bool,
    pub global_name: Option<String>,
}

impl User {
    /// Returns the CDN URL for the user's avatar, or `None` if no avatar is set.
    pub fn avatar_url(&self) -> Option<String> {
        self.avatar.as_ref().map(|hash| {
            format!(
                "https://cdn.discordapp.com/avatars/{}/{}.png",
                self.id, hash
            )
        })
    }

    /// `Username#Discriminator` or just `Username` for the new username system.
    pub fn tag(&self) -> String {
        match self.discriminator.as_deref() {
            Some("0") | None => self.username.clone(),
            Some(disc) => format!("{}#{}", self.username, disc),
        }
    }
}

/// Partial user object (e.g. inside GUILD_MEMBER_REMOVE).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PartialUser {
    pub id: Snowflake,
    pub username: Option<String>,
    pub avatar: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize_repr, Serialize_repr)]
#[repr(u8)]
pub enum ChannelType {
    GuildText = 0,
    Dm = 1,
    GuildVoice = 2,
    GroupDm = 3,
    GuildCategory = 4,
    GuildAnnouncement = 5,
    AnnouncementThread = 10,
    PublicThread = 11,
    PrivateThread = 12,
    GuildStageVoice = 13,
    GuildDirectory = 14,
    GuildForum = 15,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Channel {
    pub id: Snowflake,
    #[serde(rename = "type")]
    pub kind: ChannelType,
    pub guild_id: Option<Snowflake>,
    pub name: Option<String>,
    pub topic: Option<String>,
    pub position: Option<i32>,
    pub parent_id: Option<Snowflake>,
    #[serde(default)]
    pub nsfw: bool,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub id: Snowflake,
    pub channel_id: Snowflake,
    pub guild_id: Option<Snowflake>,
    pub author: User,
    pub content: String,
    pub timestamp: String,
    pub edited_timestamp: Option<String>,
    #[serde(default)]
    pub tts: bool,
    #[serde(default)]
    pub mention_everyone: bool,
    #[serde(default)]
    pub mentions: Vec<User>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub embeds: Vec<Embed>,
    #[serde(default)]
    pub pinned: bool,
    pub message_reference: Option<MessageReference>,
    /// The member object for `author`, present for guild messages.
    pub member: Option<GuildMember>,
}

impl Message {
    /// Unix-millis timestamp derived from the message snowflake.
    pub fn snowflake_timestamp_ms(&self) -> Option<u64> {
        snowflake_timestamp_ms(&self.id)
    }

    /// Whether a given user id is mentioned in the message.
    pub fn mentions_user(&self, user_id: &str) -> bool {
        self.mentions.iter().any(|u| u.id == user_id)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessageReference {
    pub message_id: Option<Snowflake>,
    pub channel_id: Option<Snowflake>,
    pub guild_id: Option<Snowflake>,
    #[serde(default)]
    pub fail_if_not_exists: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Attachment {
    pub id: Snowflake,
    pub filename: String,
    pub size: u64,
    pub url: String,
    pub proxy_url: String,
    pub content_type: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

// ---------------------------------------------------------------------------
// Embed
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<EmbedMedia>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<EmbedMedia>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<EmbedAuthor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Embed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    pub fn color(mut self, color: u32) -> Self {
        self.color = Some(color);
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>, inline: bool) -> Self {
        self.fields.push(EmbedField {
            name: name.into(),
            value: value.into(),
            inline,
        });
        self
    }

    pub fn footer(mut self, text: impl Into<String>) -> Self {
        self.footer = Some(EmbedFooter {
            text: text.into(),
            icon_url: None,
        });
        self
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbedFooter {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbedMedia {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbedAuthor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

// ---------------------------------------------------------------------------
// Guild
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Guild {
    pub id: Snowflake,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub owner_id: Option<Snowflake>,
    #[serde(default)]
    pub approximate_member_count: Option<u64>,
    #[serde(default)]
    pub approximate_presence_count: Option<u64>,
    #[serde(default)]
    pub unavailable: bool,
}

impl Guild {
    /// A placeholder guild cached from READY's `guilds` list, carrying only
    /// the id and the unavailable flag until a full GUILD_CREATE arrives.
    pub fn unavailable(id: impl Into<Snowflake>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            icon: None,
            owner_id: None,
            approximate_member_count: None,
            approximate_presence_count: None,
            unavailable: true,
        }
    }

    /// Unix-millis timestamp derived from the guild snowflake.
    pub fn created_at_ms(&self) -> Option<u64> {
        snowflake_timestamp_ms(&self.id)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UnavailableGuild {
    pub id: Snowflake,
    #[serde(default)]
    pub unavailable: bool,
}

/// The member object embedded in message/interaction payloads. This is
/// distinct from the cache's [`Member`] entity, which is keyed separately
/// and synchronized from GUILD_MEMBER_* dispatch events.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GuildMember {
    pub user: Option<User>,
    pub nick: Option<String>,
    #[serde(default)]
    pub roles: Vec<Snowflake>,
    pub joined_at: Option<String>,
    #[serde(default)]
    pub deaf: bool,
    #[serde(default)]
    pub mute: bool,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemberFlags: u32 {
        const DID_REJOIN = 1 << 0;
        const COMPLETED_ONBOARDING = 1 << 1;
        const BYPASSES_VERIFICATION = 1 << 2;
        const STARTED_ONBOARDING = 1 << 3;
        const IS_GUEST = 1 << 4;
        const STARTED_HOME_ACTIONS = 1 << 5;
        const COMPLETED_HOME_ACTIONS = 1 << 6;
        const AUTOMOD_QUARANTINED_USERNAME = 1 << 7;
        const DM_SETTINGS_UPSELL_ACKNOWLEDGED = 1 << 8;
    }
}

impl Default for MemberFlags {
    fn default() -> Self {
        MemberFlags::empty()
    }
}

impl Serialize for MemberFlags {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for MemberFlags {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        Ok(MemberFlags::from_bits_truncate(u32::deserialize(d)?))
    }
}

/// The cache's member entity, keyed by `(id, guild_id)`. Distinct from the
/// partial [`GuildMember`] embedded in other payloads.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Member {
    pub id: Snowflake,
    pub guild_id: Snowflake,
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub roles: Vec<Snowflake>,
    #[serde(default)]
    pub joined_at: Option<String>,
    #[serde(default)]
    pub flags: MemberFlags,
    #[serde(default)]
    pub deaf: bool,
    #[serde(default)]
    pub mute: bool,
}

// ---------------------------------------------------------------------------
// Dispatch event bodies used for cache synchronization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GuildDeleteEvent {
    pub id: Snowflake,
    #[serde(default)]
    pub unavailable: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelDeleteEvent {
    pub id: Snowflake,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildMemberRemoveEvent {
    pub guild_id: Snowflake,
    pub user: PartialUser,
}

/// GUILD_MEMBER_ADD/UPDATE share this shape; the user id doubles as the
/// member's cache key alongside `guild_id`.
#[derive(Debug, Clone, Deserialize)]
pub struct GuildMemberFields {
    pub user: User,
    pub guild_id: Snowflake,
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub roles: Vec<Snowflake>,
    #[serde(default)]
    pub joined_at: Option<String>,
    #[serde(default)]
    pub flags: MemberFlags,
    #[serde(default)]
    pub deaf: bool,
    #[serde(default)]
    pub mute: bool,
}

impl From<GuildMemberFields> for Member {
    fn from(f: GuildMemberFields) -> Self {
        Member {
            id: f.user.id,
            guild_id: f.guild_id,
            nick: f.nick,
            avatar: f.avatar,
            roles: f.roles,
            joined_at: f.joined_at,
            flags: f.flags,
            deaf: f.deaf,
            mute: f.mute,
        }
    }
}

// ---------------------------------------------------------------------------
// READY event payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReadyEvent {
    #[serde(default)]
    pub v: Option<u8>,
    #[serde(default)]
    pub user: Option<User>,
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
    #[serde(default)]
    pub guilds: Vec<UnavailableGuild>,
    #[serde(default)]
    pub application: Option<ReadyApplication>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReadyApplication {
    pub id: Snowflake,
    pub flags: Option<u64>,
}

// ---------------------------------------------------------------------------
// Outbound message body (for REST POST /channels/{id}/messages)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embeds: Option<Vec<Embed>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_reference: Option<MessageReference>,
}

impl CreateMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, text: impl Into<String>) -> Self {
        self.content = Some(text.into());
        self
    }

    pub fn embed(mut self, embed: Embed) -> Self {
        self.embeds.get_or_insert_with(Vec::new).push(embed);
        self
    }

    pub fn reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.message_reference = Some(MessageReference {
            message_id: Some(message_id.into()),
            channel_id: None,
            guild_id: None,
            fail_if_not_exists: false,
        });
        self
    }
}

// ---------------------------------------------------------------------------
// Rate-limit info parsed from response headers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    pub remaining: Option<u32>,
    pub reset_after: Option<f64>,
    pub bucket: Option<String>,
    pub is_global: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_falls_back_to_username_for_new_username_system() {
        let u = User {
            id: "1".into(),
            username: "foo".into(),
            discriminator: Some("0".into()),
            avatar: None,
            bot: false,
            global_name: None,
        };
        assert_eq!(u.tag(), "foo");
    }

    #[test]
    fn tag_includes_legacy_discriminator() {
        let u = User {
            id: "1".into(),
            username: "foo".into(),
            discriminator: Some("1234".into()),
            avatar: None,
            bot: false,
            global_name: None,
        };
        assert_eq!(u.tag(), "foo#1234");
    }

    #[test]
    fn member_fields_convert_into_cache_member() {
        let fields = GuildMemberFields {
            user: User {
                id: "42".into(),
                username: "bar".into(),
                discriminator: None,
                avatar: None,
                bot: false,
                global_name: None,
            },
            guild_id: "7".into(),
            nick: Some("nicky".into()),
            avatar: None,
            roles: vec!["r1".into()],
            joined_at: None,
            flags: MemberFlags::empty(),
            deaf: false,
            mute: false,
        };
        let member: Member = fields.into();
        assert_eq!(member.id, "42");
        assert_eq!(member.guild_id, "7");
        assert_eq!(member.nick.as_deref(), Some("nicky"));
    }

    #[test]
    fn minimal_ready_event_deserializes_without_user_or_application() {
        let raw = serde_json::json!({
            "session_id": "test_session",
            "resume_gateway_url": "wss://test.gateway"
        });
        let ready: ReadyEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(ready.session_id, "test_session");
        assert_eq!(ready.resume_gateway_url.as_deref(), Some("wss://test.gateway"));
        assert!(ready.user.is_none());
        assert!(ready.application.is_none());
        assert!(ready.guilds.is_empty());
    }
}
