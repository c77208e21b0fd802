use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::{self, JoinHandle};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::audio::{DecodedAudio, SpeakerBindingUpdate, UtteranceAudio};
use crate::model::constants::PCM_BYTES_PER_MILLISECOND;
use crate::model::types::{Speaker, Ssrc, UserId};

#[derive(Clone, Copy, Debug)]
pub(crate) struct UtteranceConfig {
    /// Flush after this long with no new chunks.
    pub silence_flush: Duration,
    /// Flush unconditionally once an utterance holds this much audio.
    pub max_duration: Duration,
}

impl Default for UtteranceConfig {
    fn default() -> Self {
        Self {
            silence_flush: Duration::from_millis(2000),
            max_duration: Duration::from_millis(10_000),
        }
    }
}

/// Audio gathered for one SSRC since its last flush. The slot doesn't
/// know who is speaking; the manager resolves the speaker when the
/// utterance closes, so a late op 5 binding still re-parents it.
struct UtteranceSlot {
    pcm: Vec<u8>,
    started_wall: SystemTime,
    first_chunk: Instant,
    last_chunk: Instant,
}

impl UtteranceSlot {
    fn new(now: Instant) -> Self {
        Self {
            pcm: Vec::new(),
            started_wall: SystemTime::now(),
            first_chunk: now,
            last_chunk: now,
        }
    }

    /// Duration of buffered audio, derived from byte length so the
    /// hard cap tracks audio time rather than arrival time.
    fn audio_duration(&self) -> Duration {
        Duration::from_millis((self.pcm.len() / PCM_BYTES_PER_MILLISECOND) as u64)
    }

    fn deadline(&self, config: &UtteranceConfig) -> Instant {
        let silence = self.last_chunk + config.silence_flush;
        let hard_cap = self.first_chunk + config.max_duration;
        silence.min(hard_cap)
    }
}

/// Accumulates PCM per speaker and emits utterances, delimited by a
/// silence timeout or a hard duration cap. Single owner for all slots:
/// audio chunks, binding updates, and timer wakeups are serialized
/// through one task loop.
pub(crate) struct UtteranceManager {
    config: UtteranceConfig,
    slots: HashMap<Ssrc, UtteranceSlot>,
    bound: HashMap<Ssrc, UserId>,
    shutdown_token: CancellationToken,
}

impl UtteranceManager {
    pub fn monitor(
        config: UtteranceConfig,
        rx_audio: UnboundedReceiver<DecodedAudio>,
        rx_bindings: UnboundedReceiver<SpeakerBindingUpdate>,
        tx_utterances: UnboundedSender<UtteranceAudio>,
        shutdown_token: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = UtteranceManager {
            config,
            slots: HashMap::new(),
            bound: HashMap::new(),
            shutdown_token,
        };
        task::spawn(manager.loop_forever(rx_audio, rx_bindings, tx_utterances))
    }

    async fn loop_forever(
        mut self,
        mut rx_audio: UnboundedReceiver<DecodedAudio>,
        mut rx_bindings: UnboundedReceiver<SpeakerBindingUpdate>,
        tx_utterances: UnboundedSender<UtteranceAudio>,
    ) {
        // park the timer far in the future while no slot has a deadline
        let never = Instant::now() + time::Duration::from_secs(86_400 * 365);
        let next_flush_time = time::sleep_until(never);
        tokio::pin!(next_flush_time);

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    break;
                }
                _ = &mut next_flush_time => {
                    self.flush_due(&tx_utterances);
                }
                Some(chunk) = rx_audio.recv() => {
                    self.add_chunk(chunk, &tx_utterances);
                }
                Some(binding) = rx_bindings.recv() => {
                    if binding.speaking {
                        self.bound.insert(binding.ssrc, binding.user_id);
                    }
                }
            }

            next_flush_time.as_mut().reset(
                self.slots
                    .values()
                    .map(|slot| slot.deadline(&self.config))
                    .min()
                    .unwrap_or(never),
            );
        }

        // force-flush everything we still hold before going away
        self.flush_all(&tx_utterances);
    }

    fn add_chunk(&mut self, chunk: DecodedAudio, tx: &UnboundedSender<UtteranceAudio>) {
        let now = Instant::now();

        // a chunk that would push the slot past the hard cap closes the
        // current utterance first
        if let Some(slot) = self.slots.get(&chunk.ssrc) {
            let would_hold = slot.audio_duration()
                + Duration::from_millis((chunk.pcm.len() / PCM_BYTES_PER_MILLISECOND) as u64);
            if would_hold > self.config.max_duration {
                self.flush(chunk.ssrc, tx);
            }
        }

        let slot = self
            .slots
            .entry(chunk.ssrc)
            .or_insert_with(|| UtteranceSlot::new(now));
        slot.pcm.extend_from_slice(&chunk.pcm);
        slot.last_chunk = now;
    }

    fn flush_due(&mut self, tx: &UnboundedSender<UtteranceAudio>) {
        let now = Instant::now();
        let due: Vec<Ssrc> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.deadline(&self.config) <= now)
            .map(|(ssrc, _)| *ssrc)
            .collect();
        for ssrc in due {
            self.flush(ssrc, tx);
        }
    }

    fn flush_all(&mut self, tx: &UnboundedSender<UtteranceAudio>) {
        let all: Vec<Ssrc> = self.slots.keys().copied().collect();
        for ssrc in all {
            self.flush(ssrc, tx);
        }
    }

    /// Closes the utterance for one SSRC: the slot's bytes move into
    /// the emitted record and the slot is gone. Flushing a missing or
    /// empty slot emits nothing.
    fn flush(&mut self, ssrc: Ssrc, tx: &UnboundedSender<UtteranceAudio>) {
        let Some(slot) = self.slots.remove(&ssrc) else {
            return;
        };
        if slot.pcm.is_empty() {
            return;
        }

        let speaker = match self.bound.get(&ssrc) {
            Some(user_id) => Speaker::User(*user_id),
            None => Speaker::Unbound(ssrc),
        };
        let ended_at = slot.started_wall + slot.audio_duration();
        debug!(
            "flushing {}ms utterance for {:?}",
            slot.audio_duration().as_millis(),
            speaker
        );
        if tx
            .send(UtteranceAudio {
                speaker,
                pcm: slot.pcm.into(),
                started_at: slot.started_wall,
                ended_at,
            })
            .is_err()
        {
            warn!("utterance receiver is gone; dropping audio");
        }
    }
}
