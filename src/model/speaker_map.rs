use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::model::types::{Speaker, Ssrc, UserId};

/// Maps RTP SSRCs to Discord users, and users to display names.
/// Users are assigned an SSRC when they start speaking; op 5 events
/// tell us about it, usually (but not always) before their audio
/// arrives. Written from the control context, read from the receive
/// context; updates are rare enough that a coarse lock is fine.
pub(crate) struct SpeakerMap {
    ssrc_to_user: RwLock<HashMap<Ssrc, UserId>>,
    display_names: RwLock<HashMap<UserId, String>>,
}

impl SpeakerMap {
    pub fn new() -> Self {
        Self {
            ssrc_to_user: RwLock::new(HashMap::new()),
            display_names: RwLock::new(HashMap::new()),
        }
    }

    /// Records an SSRC binding. Returns true if this SSRC was not
    /// previously bound to this user. We never remove entries: if
    /// another user is later assigned the same SSRC, the insert just
    /// overwrites the stale mapping.
    pub fn bind(&self, ssrc: Ssrc, user_id: UserId) -> bool {
        self.ssrc_to_user.write().unwrap().insert(ssrc, user_id) != Some(user_id)
    }

    pub fn user_for_ssrc(&self, ssrc: Ssrc) -> Option<UserId> {
        self.ssrc_to_user.read().unwrap().get(&ssrc).copied()
    }

    /// The speaker identity for a packet: the bound user, or the
    /// SSRC-derived placeholder until an op 5 arrives.
    pub fn speaker_for_ssrc(&self, ssrc: Ssrc) -> Speaker {
        match self.user_for_ssrc(ssrc) {
            Some(user_id) => Speaker::User(user_id),
            None => Speaker::Unbound(ssrc),
        }
    }

    pub fn set_display_name(&self, user_id: UserId, name: String) {
        self.display_names.write().unwrap().insert(user_id, name);
    }

    /// Resolves a display name at transcript-append time. Falls back to
    /// the speaker's derived name; the stored entry is never
    /// back-patched later.
    pub fn display_name(&self, speaker: &Speaker) -> String {
        if let Speaker::User(user_id) = speaker {
            if let Some(name) = self.display_names.read().unwrap().get(user_id) {
                return name.clone();
            }
        }
        speaker.fallback_name()
    }

    /// Number of distinct users currently bound to an SSRC.
    pub fn speaker_count(&self) -> usize {
        self.ssrc_to_user
            .read()
            .unwrap()
            .values()
            .collect::<HashSet<_>>()
            .len()
    }

    /// Forgets all SSRC bindings. Display names are kept; SSRCs are
    /// only meaningful within one voice session.
    pub fn clear_bindings(&self) {
        self.ssrc_to_user.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_ssrc_yields_placeholder() {
        let map = SpeakerMap::new();
        assert_eq!(map.speaker_for_ssrc(9), Speaker::Unbound(9));
        assert_eq!(map.display_name(&Speaker::Unbound(9)), "Speaker_00000009");
    }

    #[test]
    fn bind_reports_new_bindings_once() {
        let map = SpeakerMap::new();
        assert!(map.bind(9, 100));
        assert!(!map.bind(9, 100));
        assert_eq!(map.speaker_for_ssrc(9), Speaker::User(100));
    }

    #[test]
    fn rebinding_overwrites_stale_user() {
        let map = SpeakerMap::new();
        map.bind(9, 100);
        assert!(map.bind(9, 200));
        assert_eq!(map.user_for_ssrc(9), Some(200));
        assert_eq!(map.speaker_count(), 1);
    }

    #[test]
    fn display_name_prefers_roster_then_fallback() {
        let map = SpeakerMap::new();
        map.bind(9, 123456789);
        assert_eq!(map.display_name(&Speaker::User(123456789)), "User_6789");
        map.set_display_name(123456789, "alice".to_string());
        assert_eq!(map.display_name(&Speaker::User(123456789)), "alice");
    }

    #[test]
    fn speaker_count_is_distinct_users() {
        let map = SpeakerMap::new();
        map.bind(1, 100);
        map.bind(2, 100);
        map.bind(3, 300);
        assert_eq!(map.speaker_count(), 2);
    }
}
