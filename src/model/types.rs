use std::num::Wrapping;

pub type UserId = u64;
pub type GuildId = u64;
pub type ChannelId = u64;

pub type Ssrc = u32;

/// RTP sequence numbers are 16 bits and wrap.
pub(crate) type RtpSequence = Wrapping<u16>;

/// RTP timestamps are 32 bits of 48kHz sample ticks and wrap.
pub(crate) type RtpTimestamp = Wrapping<u32>;

pub(crate) type DiscordAudioSample = i16;

/// A speaker as seen by the receive path: a real user once the op 5
/// speaking event has bound their SSRC, otherwise a placeholder derived
/// from the SSRC alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Speaker {
    User(UserId),
    Unbound(Ssrc),
}

impl Speaker {
    /// Fallback display name when the roster has nothing better.
    /// Real users get `User_<last 4 of id>`; unbound SSRCs are tagged as such.
    pub fn fallback_name(&self) -> String {
        match self {
            Speaker::User(user_id) => {
                let digits = user_id.to_string();
                let tail = &digits[digits.len().saturating_sub(4)..];
                format!("User_{}", tail)
            }
            Speaker::Unbound(ssrc) => format!("Speaker_{:08x}", ssrc),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_name_uses_last_four_digits() {
        assert_eq!(Speaker::User(123456789).fallback_name(), "User_6789");
        assert_eq!(Speaker::User(42).fallback_name(), "User_42");
    }

    #[test]
    fn unbound_fallback_is_ssrc_derived() {
        assert_eq!(Speaker::Unbound(0xdead).fallback_name(), "Speaker_0000dead");
    }
}
