// Discord voice is 16-bit stereo PCM at 48kHz, divided into 20ms frames.

use std::time::Duration;

pub(crate) const DISCORD_AUDIO_CHANNELS: usize = 2;
pub(crate) const DISCORD_SAMPLES_PER_SECOND: usize = 48_000;

/// Number of audio frames sent per second.
pub(crate) const AUDIO_FRAME_RATE: usize = 50;

/// Samples per channel in one 20ms frame.
pub(crate) const MONO_FRAME_SIZE: usize = DISCORD_SAMPLES_PER_SECOND / AUDIO_FRAME_RATE;

/// Interleaved samples in one 20ms stereo frame.
pub(crate) const STEREO_FRAME_SIZE: usize = DISCORD_AUDIO_CHANNELS * MONO_FRAME_SIZE;

/// Bytes of s16le PCM in one 20ms stereo frame.
pub(crate) const STEREO_FRAME_BYTE_SIZE: usize = STEREO_FRAME_SIZE * std::mem::size_of::<i16>();

/// Bytes of s16le stereo PCM per millisecond, for duration math.
pub(crate) const PCM_BYTES_PER_MILLISECOND: usize =
    STEREO_FRAME_BYTE_SIZE * AUDIO_FRAME_RATE / 1000;

pub(crate) const FRAME_LENGTH: Duration = Duration::from_millis(1000 / AUDIO_FRAME_RATE as u64);

/// RTP timestamps advance by one per sample, so one frame is 960 ticks.
pub(crate) const TIMESTAMP_STEP_PER_FRAME: u32 = MONO_FRAME_SIZE as u32;

pub(crate) const RTP_VERSION: u8 = 2;
pub(crate) const RTP_HEADER_LEN: usize = 12;

/// Payload type used by Discord's Opus audio traffic.
pub(crate) const RTP_PAYLOAD_TYPE_OPUS: u8 = 120;

/// Opus silent frame, used by peers to signal speech start and end.
pub(crate) const SILENT_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

/// Largest opus payload we'll produce; well under the Ethernet MTU.
pub(crate) const MAX_OPUS_PACKET_SIZE: usize = 1400;

/// The cipher mode requested in Select Protocol.
pub(crate) const CIPHER_MODE: &str = "xsalsa20_poly1305_lite";

/// Discord's UDP keepalives fire every 5 seconds regardless of traffic.
pub(crate) const UDP_KEEPALIVE_GAP: Duration = Duration::from_secs(5);

pub(crate) const VOICE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive unacknowledged heartbeats before the session is declared dead.
pub(crate) const MAX_MISSED_HEARTBEATS: u32 = 2;

pub(crate) const VOICE_GATEWAY_VERSION: u8 = 8;

pub(crate) const JOIN_VOICE_TIMEOUT: Duration = Duration::from_secs(15);
pub(crate) const PLAY_READY_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const IP_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to wait for pending utterances to reach the transcriber
/// during shutdown before giving up on them.
pub(crate) const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
