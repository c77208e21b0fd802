use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::api_types::{
    AudioInput, ClientError, ConnectData, JoinError, LeaveError, PlayError, TranscriptEntry,
    VoiceChannelEvent, VoiceStatus,
};
use crate::audio::transcode;
use crate::config::Config;
use crate::events::audio::{SpeakerBindingUpdate, UtteranceAudio};
use crate::gateway::{self, GatewayHandle, GatewayNotice};
use crate::model::constants::{
    JOIN_VOICE_TIMEOUT, PCM_BYTES_PER_MILLISECOND, PLAY_READY_TIMEOUT, SHUTDOWN_FLUSH_TIMEOUT,
};
use crate::model::speaker_map::SpeakerMap;
use crate::model::transcript::{unix_millis, TranscriptStore};
use crate::model::types::{ChannelId, GuildId, Speaker};
use crate::model::utterance::UtteranceManager;
use crate::provider::stt::SttClient;
use crate::provider::tts::TtsClient;
use crate::voice::payload;
use crate::voice::send::{pace_frames, PlaybackPipeline};
use crate::voice::session::{self, VoiceSession};

pub type EventCallback = Arc<dyn Fn(VoiceChannelEvent) + Send + Sync>;

/// The voice client core. One instance per process: it owns the
/// gateway connection, at most one active voice session, the speaker
/// roster, and the transcript.
pub struct Discanto {
    config: Config,
    gateway: Arc<GatewayHandle>,
    event_callback: EventCallback,
    transcript: Arc<TranscriptStore>,
    speaker_map: Arc<SpeakerMap>,
    transcription_enabled: Arc<AtomicBool>,
    active: Arc<tokio::sync::Mutex<Option<ActiveVoice>>>,
    notice_task: JoinHandle<()>,
}

/// Everything belonging to one voice session. Dropping this after
/// cancelling the token closes the websocket (tx_ws goes away) and the
/// UDP socket (last Arc refs die with the tasks).
struct ActiveVoice {
    guild_id: GuildId,
    channel_id: ChannelId,
    shutdown_token: CancellationToken,
    session: VoiceSession,
    playback: Arc<tokio::sync::Mutex<PlaybackPipeline>>,
    dropped_packets: Arc<AtomicU64>,
    utterance_task: JoinHandle<()>,
    submit_task: JoinHandle<()>,
    forward_task: JoinHandle<()>,
}

impl Discanto {
    /// Connects the gateway and returns a ready client. Voice channels
    /// are joined separately via `join_voice`.
    pub async fn connect(
        config: Config,
        event_callback: EventCallback,
    ) -> Result<Self, ClientError> {
        let token = config
            .bot_token
            .clone()
            .ok_or(ClientError::MissingToken)?;
        let (tx_notice, rx_notice) = unbounded_channel();
        let gateway = gateway::connect(token, tx_notice)
            .await
            .map_err(|e| ClientError::Gateway(e.to_string()))?;
        Ok(Self::assemble(config, event_callback, gateway, rx_notice))
    }

    /// Shared between `connect` and the tests that bring their own
    /// gateway.
    pub(crate) fn assemble(
        config: Config,
        event_callback: EventCallback,
        gateway: GatewayHandle,
        rx_notice: UnboundedReceiver<GatewayNotice>,
    ) -> Self {
        let transcript = Arc::new(TranscriptStore::new(&config.transcript_dir));
        let speaker_map = Arc::new(SpeakerMap::new());
        let transcription_enabled =
            Arc::new(AtomicBool::new(config.provider_api_key.is_some()));
        let active = Arc::new(tokio::sync::Mutex::new(None));
        let gateway = Arc::new(gateway);

        let notice_task = tokio::spawn(Self::notice_loop(
            rx_notice,
            active.clone(),
            speaker_map.clone(),
            transcript.clone(),
        ));

        Self {
            config,
            gateway,
            event_callback,
            transcript,
            speaker_map,
            transcription_enabled,
            active,
            notice_task,
        }
    }

    /// Gateway-side events that outlive any single voice session.
    async fn notice_loop(
        mut rx_notice: UnboundedReceiver<GatewayNotice>,
        active: Arc<tokio::sync::Mutex<Option<ActiveVoice>>>,
        speaker_map: Arc<SpeakerMap>,
        transcript: Arc<TranscriptStore>,
    ) {
        while let Some(notice) = rx_notice.recv().await {
            match notice {
                GatewayNotice::VoiceSessionInvalidated => {
                    let guard = active.lock().await;
                    if let Some(voice) = guard.as_ref() {
                        warn!("gateway invalidated the voice session");
                        voice.shutdown_token.cancel();
                    }
                }
                GatewayNotice::UserSeen {
                    user_id,
                    display_name,
                } => {
                    speaker_map.set_display_name(user_id, display_name.clone());
                    transcript.set_username(user_id, display_name);
                }
            }
        }
    }

    /// Joins a voice channel: gateway voice-state update, wait for the
    /// two voice dispatches, then the voice websocket handshake through
    /// to the session key. 15 seconds overall; on failure the outer
    /// voice state is rolled back.
    pub async fn join_voice(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<(), JoinError> {
        let mut guard = self.active.lock().await;
        if guard.is_some() {
            return Err(JoinError::AlreadyInVoice);
        }
        if self.gateway.user_id().is_none() {
            return Err(JoinError::NotAuthenticated);
        }

        let deadline = tokio::time::Instant::now() + JOIN_VOICE_TIMEOUT;
        let rx_info = self
            .gateway
            .request_join(guild_id, channel_id)
            .ok_or(JoinError::NotAuthenticated)?;

        let info = match tokio::time::timeout_at(deadline, rx_info).await {
            Ok(Ok(info)) => info,
            Ok(Err(_)) => {
                self.gateway.clear_voice_state(guild_id);
                return Err(JoinError::Connection("gateway connection lost".to_string()));
            }
            Err(_) => {
                // roll back the half-joined outer state
                self.gateway.clear_voice_state(guild_id);
                return Err(JoinError::GatewayTimeout);
            }
        };

        let shutdown_token = CancellationToken::new();
        let dropped_packets = Arc::new(AtomicU64::new(0));
        let (tx_bindings, rx_bindings) = unbounded_channel();
        let (tx_audio, rx_audio) = unbounded_channel();

        let session = match tokio::time::timeout_at(
            deadline,
            session::connect(
                &info,
                tx_bindings,
                tx_audio,
                dropped_packets.clone(),
                shutdown_token.clone(),
            ),
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                shutdown_token.cancel();
                self.gateway.clear_voice_state(guild_id);
                return Err(JoinError::Connection(e.to_string()));
            }
            Err(_) => {
                shutdown_token.cancel();
                self.gateway.clear_voice_state(guild_id);
                return Err(JoinError::GatewayTimeout);
            }
        };

        // per-speaker buffering and transcription submission
        let (tx_bindings_manager, rx_bindings_manager) = unbounded_channel();
        let (tx_utterances, rx_utterances) = unbounded_channel();
        let utterance_task = UtteranceManager::monitor(
            self.config.utterance_config(),
            rx_audio,
            rx_bindings_manager,
            tx_utterances,
            shutdown_token.clone(),
        );
        let forward_task = tokio::spawn(Self::forward_bindings(
            rx_bindings,
            tx_bindings_manager,
            self.speaker_map.clone(),
            self.event_callback.clone(),
        ));
        let submit_task = tokio::spawn(Self::submit_utterances(
            rx_utterances,
            self.stt_client(),
            self.transcription_enabled.clone(),
            self.transcript.clone(),
            self.speaker_map.clone(),
            self.event_callback.clone(),
            guild_id,
            channel_id,
        ));

        let playback = Arc::new(tokio::sync::Mutex::new(
            PlaybackPipeline::new(session.crypto.clone(), session.ssrc)
                .map_err(|e| JoinError::Connection(e.to_string()))?,
        ));

        // protocol-fatal closures cancel the token from inside the
        // session; this watcher turns that into state cleanup
        tokio::spawn(Self::watch_session_death(
            shutdown_token.clone(),
            self.active.clone(),
            self.speaker_map.clone(),
            self.event_callback.clone(),
        ));

        (self.event_callback)(VoiceChannelEvent::Connect(ConnectData {
            guild_id,
            channel_id,
            session_id: info.session_id.clone(),
            endpoint: info.endpoint.clone(),
        }));

        *guard = Some(ActiveVoice {
            guild_id,
            channel_id,
            shutdown_token,
            session,
            playback,
            dropped_packets,
            utterance_task,
            submit_task,
            forward_task,
        });
        Ok(())
    }

    /// Speaking updates fan out from here: the SSRC map, the buffer
    /// manager (for re-parenting), and the embedding application.
    async fn forward_bindings(
        mut rx_bindings: UnboundedReceiver<SpeakerBindingUpdate>,
        tx_manager: UnboundedSender<SpeakerBindingUpdate>,
        speaker_map: Arc<SpeakerMap>,
        event_callback: EventCallback,
    ) {
        while let Some(binding) = rx_bindings.recv().await {
            if binding.speaking && speaker_map.bind(binding.ssrc, binding.user_id) {
                debug!("bound ssrc {} to user {}", binding.ssrc, binding.user_id);
            }
            if tx_manager.send(binding).is_err() {
                return;
            }
            (event_callback)(VoiceChannelEvent::SpeakingStateChange {
                user_id: binding.user_id,
                speaking: binding.speaking,
            });
        }
    }

    /// Consumes flushed utterances until the channel drains, so the
    /// force-flush on shutdown still reaches the provider best-effort.
    #[allow(clippy::too_many_arguments)]
    async fn submit_utterances(
        mut rx_utterances: UnboundedReceiver<UtteranceAudio>,
        stt: Option<SttClient>,
        enabled: Arc<AtomicBool>,
        transcript: Arc<TranscriptStore>,
        speaker_map: Arc<SpeakerMap>,
        event_callback: EventCallback,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) {
        while let Some(utterance) = rx_utterances.recv().await {
            if !enabled.load(Ordering::Relaxed) {
                continue;
            }
            let Some(stt) = stt.as_ref() else { continue };

            let duration_ms = (utterance.pcm.len() / PCM_BYTES_PER_MILLISECOND) as u64;
            match stt.transcribe(&utterance.pcm).await {
                Ok(result) if !result.text.is_empty() => {
                    let user_id = match utterance.speaker {
                        Speaker::User(id) => Some(id),
                        Speaker::Unbound(_) => None,
                    };
                    let entry = TranscriptEntry {
                        user_id,
                        username: speaker_map.display_name(&utterance.speaker),
                        text: result.text,
                        timestamp: unix_millis(utterance.started_at),
                        words: result.words,
                        guild_id: Some(guild_id),
                        channel_id: Some(channel_id),
                    };
                    transcript.append(entry.clone()).await;
                    (event_callback)(VoiceChannelEvent::Transcription(entry));
                }
                Ok(_) => debug!("empty transcription for {}ms utterance", duration_ms),
                Err(e) => {
                    // transient or not, the utterance is gone; the
                    // session stays up either way
                    warn!("transcription failed, dropping utterance: {}", e);
                }
            }
        }
    }

    async fn watch_session_death(
        shutdown_token: CancellationToken,
        active: Arc<tokio::sync::Mutex<Option<ActiveVoice>>>,
        speaker_map: Arc<SpeakerMap>,
        event_callback: EventCallback,
    ) {
        shutdown_token.cancelled().await;
        let mut guard = active.lock().await;
        let Some(voice) = guard.as_ref() else {
            // leave_voice already cleaned up
            return;
        };
        if !voice.shutdown_token.is_cancelled() {
            // a newer session took the slot
            return;
        }
        let voice = guard.take().expect("checked above");
        drop(guard);
        info!("voice session closed (guild {})", voice.guild_id);
        speaker_map.clear_bindings();
        (event_callback)(VoiceChannelEvent::Disconnect {
            guild_id: voice.guild_id,
        });
    }

    /// Leaves the current voice channel: stops playback and the receive
    /// loop, force-flushes pending utterances to STT, closes the UDP
    /// socket and websocket, and nulls our gateway voice state.
    pub async fn leave_voice(&self) -> Result<(), LeaveError> {
        let voice = {
            let mut guard = self.active.lock().await;
            guard.take().ok_or(LeaveError::NotInVoice)?
        };

        self.gateway.clear_voice_state(voice.guild_id);
        voice.session.set_speaking(false);
        voice.shutdown_token.cancel();
        let _ = voice.session.tx_ws.send(Message::Close(None));

        // the buffer manager flushes on cancel, then its channel closes
        // and the submitter drains what's left
        let _ = tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, voice.utterance_task).await;
        let _ = tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, voice.submit_task).await;
        voice.forward_task.abort();
        for task in &voice.session.tasks {
            task.abort();
        }

        self.speaker_map.clear_bindings();
        (self.event_callback)(VoiceChannelEvent::Disconnect {
            guild_id: voice.guild_id,
        });
        info!("left voice channel {} in guild {}", voice.channel_id, voice.guild_id);
        Ok(())
    }

    /// Plays raw or encoded audio into the channel. Blocks while the
    /// session is still connecting, up to 10 seconds; a second playback
    /// while one is in flight is rejected with `Busy`, not queued.
    pub async fn play_audio(&self, input: AudioInput) -> Result<(), PlayError> {
        let pcm = match input {
            AudioInput::Pcm(pcm) => pcm,
            AudioInput::Encoded(encoded) => transcode::to_discord_pcm(encoded)
                .await
                .map_err(|e| PlayError::TransportError(e.to_string()))?,
        };
        if pcm.is_empty() {
            return Ok(());
        }

        // joining holds the session lock, so acquiring it doubles as
        // "wait until Active"
        let (playback, socket, shutdown_token, tx_ws, ssrc) =
            match tokio::time::timeout(PLAY_READY_TIMEOUT, self.active.lock()).await {
                Err(_) => return Err(PlayError::NotReady),
                Ok(guard) => {
                    let Some(voice) = guard.as_ref() else {
                        return Err(PlayError::NotReady);
                    };
                    (
                        voice.playback.clone(),
                        voice.session.socket.clone(),
                        voice.shutdown_token.clone(),
                        voice.session.tx_ws.clone(),
                        voice.session.ssrc,
                    )
                }
            };

        let mut pipeline = playback.try_lock_owned().map_err(|_| PlayError::Busy)?;

        // all codec and crypto work happens before the first send
        let packets = pipeline
            .prepare(&pcm)
            .map_err(|e| PlayError::TransportError(e.to_string()))?;
        let frame_count = packets.len();

        let _ = tx_ws.send(Message::Text(payload::speaking(ssrc, true).to_text()));
        let result = pace_frames(&socket, packets, &shutdown_token).await;
        // clear the speaking flag no matter how pacing ended
        let _ = tx_ws.send(Message::Text(payload::speaking(ssrc, false).to_text()));

        match result {
            Ok(sent) => {
                debug!("playback finished: {}/{} frames sent", sent, frame_count);
                Ok(())
            }
            Err(e) => Err(PlayError::TransportError(e.to_string())),
        }
    }

    /// Synthesizes `text` with the configured voice and plays it.
    pub async fn say(&self, text: &str) -> Result<(), PlayError> {
        let api_key = self
            .config
            .provider_api_key
            .clone()
            .ok_or_else(|| PlayError::NotConfigured("no provider api key".to_string()))?;
        let voice_id = self
            .config
            .preferred_voice_id
            .clone()
            .ok_or_else(|| PlayError::NotConfigured("no voice id configured".to_string()))?;

        let tts = TtsClient::new(api_key);
        let audio = tts
            .synthesize(text, &voice_id)
            .await
            .map_err(|e| PlayError::TransportError(e.to_string()))?;
        self.play_audio(AudioInput::Encoded(audio)).await
    }

    pub fn set_transcription(&self, enabled: bool) {
        self.transcription_enabled.store(enabled, Ordering::Relaxed);
        info!("transcription {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn get_transcript(&self, limit: Option<usize>) -> Vec<TranscriptEntry> {
        self.transcript.entries(limit)
    }

    pub async fn voice_status(&self) -> VoiceStatus {
        let guard = self.active.lock().await;
        match guard.as_ref() {
            Some(voice) => VoiceStatus {
                in_voice: true,
                guild_id: Some(voice.guild_id),
                channel_id: Some(voice.channel_id),
                speaker_count: self.speaker_map.speaker_count(),
                transcription_enabled: self.transcription_enabled.load(Ordering::Relaxed),
                dropped_packets: voice.dropped_packets.load(Ordering::Relaxed),
            },
            None => VoiceStatus::idle(self.transcription_enabled.load(Ordering::Relaxed)),
        }
    }

    /// Leaves voice (if joined) and tears the gateway down.
    pub async fn close(self) {
        let _ = self.leave_voice().await;
        self.notice_task.abort();
        self.gateway.shutdown();
    }

    fn stt_client(&self) -> Option<SttClient> {
        self.config
            .provider_api_key
            .clone()
            .map(|key| SttClient::new(key, self.config.stt_model.clone()))
    }
}
