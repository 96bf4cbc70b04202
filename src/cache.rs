//! Concurrent-read entity cache.
//!
//! Each collection is an independently locked map. Stored values are shared
//! immutable past insertion: readers get an `Arc` clone and must not mutate
//! through it; writers publish a fresh value with `set_*`. The cache never
//! copies on read.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::types::{Channel, Guild, Member, Snowflake};

pub struct EntityCache {
    guilds: RwLock<HashMap<Snowflake, Arc<Guild>>>,
    channels: RwLock<HashMap<Snowflake, Arc<Channel>>>,
    members: RwLock<HashMap<(Snowflake, Snowflake), Arc<Member>>>,
}

impl Default for EntityCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityCache {
    pub fn new() -> Self {
        Self {
            guilds: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            members: RwLock::new(HashMap::new()),
        }
    }

    // --- Guilds ---

    pub fn set_guild(&self, guild: Guild) {
        self.guilds
            .write()
            .unwrap()
            .insert(guild.id.clone(), Arc::new(guild));
    }

    pub fn del_guild(&self, id: &str) {
        self.guilds.write().unwrap().remove(id);
    }

    pub fn get_guild(&self, id: &str) -> Option<Arc<Guild>> {
        self.guilds.read().unwrap().get(id).cloned()
    }

    /// Snapshot of guilds with `unavailable == false`.
    pub fn get_guilds(&self) -> HashMap<Snowflake, Arc<Guild>> {
        self.guilds
            .read()
            .unwrap()
            .iter()
            .filter(|(_, g)| !g.unavailable)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Total count, ignoring availability.
    pub fn guilds_count(&self) -> usize {
        self.guilds.read().unwrap().len()
    }

    // --- Channels ---

    pub fn set_channel(&self, channel: Channel) {
        self.channels
            .write()
            .unwrap()
            .insert(channel.id.clone(), Arc::new(channel));
    }

    pub fn del_channel(&self, id: &str) {
        self.channels.write().unwrap().remove(id);
    }

    pub fn get_channel(&self, id: &str) -> Option<Arc<Channel>> {
        self.channels.read().unwrap().get(id).cloned()
    }

    pub fn channels_count(&self) -> usize {
        self.channels.read().unwrap().len()
    }

    // --- Members ---

    pub fn set_member(&self, member: Member) {
        let key = (member.id.clone(), member.guild_id.clone());
        self.members.write().unwrap().insert(key, Arc::new(member));
    }

    pub fn del_member(&self, id: &str, guild_id: &str) {
        self.members
            .write()
            .unwrap()
            .remove(&(id.to_string(), guild_id.to_string()));
    }

    pub fn get_member(&self, id: &str, guild_id: &str) -> Option<Arc<Member>> {
        self.members
            .read()
            .unwrap()
            .get(&(id.to_string(), guild_id.to_string()))
            .cloned()
    }

    pub fn members_count(&self) -> usize {
        self.members.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelType;

    fn guild(id: &str, unavailable: bool) -> Guild {
        let mut g = Guild::unavailable(id);
        g.unavailable = unavailable;
        g
    }

    #[test]
    fn set_then_get_returns_same_data() {
        let cache = EntityCache::new();
        cache.set_guild(guild("1", false));
        assert_eq!(cache.get_guild("1").unwrap().id, "1");
    }

    #[test]
    fn del_then_get_is_not_found() {
        let cache = EntityCache::new();
        cache.set_guild(guild("1", false));
        cache.del_guild("1");
        assert!(cache.get_guild("1").is_none());
    }

    #[test]
    fn get_guilds_filters_unavailable() {
        let cache = EntityCache::new();
        cache.set_guild(guild("1", true));
        cache.set_guild(guild("2", false));
        let available = cache.get_guilds();
        assert_eq!(available.len(), 1);
        assert!(available.contains_key("2"));
        assert_eq!(cache.guilds_count(), 2);
    }

    #[test]
    fn member_is_keyed_by_id_and_guild() {
        let cache = EntityCache::new();
        cache.set_member(Member {
            id: "u1".into(),
            guild_id: "g1".into(),
            nick: None,
            avatar: None,
            roles: vec![],
            joined_at: None,
            flags: Default::default(),
            deaf: false,
            mute: false,
        });
        assert!(cache.get_member("u1", "g1").is_some());
        assert!(cache.get_member("u1", "g2").is_none());
    }

    #[test]
    fn channel_roundtrips() {
        let cache = EntityCache::new();
        cache.set_channel(Channel {
            id: "c1".into(),
            kind: ChannelType::GuildText,
            guild_id: Some("g1".into()),
            name: Some("general".into()),
            topic: None,
            position: None,
            parent_id: None,
            nsfw: false,
        });
        assert_eq!(cache.get_channel("c1").unwrap().name.as_deref(), Some("general"));
        cache.del_channel("c1");
        assert!(cache.get_channel("c1").is_none());
    }
}
