//! Conversation state machine
//!
//! [`ConversationMachine::handle`] is the single transition function. It
//! takes one [`Input`] and returns the [`Effect`]s the runtime has to carry
//! out, without doing any I/O itself.
//!
//! Every asynchronous result carries the epoch it was started under. Start,
//! end and errors advance the epoch, so a late connect result, transport
//! frame or debounce timer from a superseded conversation is dropped
//! instead of resurrecting it.

use super::state::{ConversationEvent, ConversationState};
use crate::messages::{ConversationTurn, TurnLog};
use crate::speech::{OutputEvent, TranscriptEvent};
use crate::transport::{is_normal_closure, MessageKind, TransportEnvelope, TransportEvent};
use crate::BriefError;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Silence required before a final transcript is accepted
pub const DEFAULT_TURN_DEBOUNCE: Duration = Duration::from_millis(800);

/// Consecutive recognizer failures tolerated before giving up
pub const MAX_RECOGNIZER_FAILURES: u32 = 3;

/// Everything the machine reacts to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Input {
    Start,
    Pause,
    Resume,
    TogglePause,
    End,
    /// The transport established a session
    Connected { epoch: u64, session_id: String },
    /// The transport gave up connecting
    ConnectFailed { epoch: u64, error: BriefError },
    Transport(TransportEnvelope),
    /// Speech output accepted a `Speak` or `SpeakChunk` under `seq`;
    /// zero when nothing was queued
    Queued { seq: u64 },
    Playback(OutputEvent),
    /// Transcript change from the current listening window
    Transcript(TranscriptEvent),
    /// Speech input could not be started
    ListenFailed { epoch: u64, error: BriefError },
    DebounceElapsed { epoch: u64, generation: u64 },
    /// A user turn could not be sent
    SendFailed { epoch: u64, error: BriefError },
}

/// Work requested by the machine
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    Connect { epoch: u64 },
    Disconnect,
    Send { epoch: u64, text: String },
    /// Cancel queued speech and say `text`
    Speak(String),
    /// Queue `text` behind current speech
    SpeakChunk(String),
    PauseSpeaking,
    ResumeSpeaking,
    StopSpeaking,
    StartListening { epoch: u64 },
    StopListening,
    /// Drop accumulated text without closing the window
    ResetTranscript,
    ScheduleDebounce {
        epoch: u64,
        generation: u64,
        delay: Duration,
    },
    CancelDebounce,
    Emit(ConversationEvent),
    InvokeOnEnd,
}

/// The conversation orchestrator's transition function and its state
#[derive(Debug)]
pub struct ConversationMachine {
    state: ConversationState,
    epoch: u64,
    /// State captured when the user paused
    paused_from: Option<ConversationState>,
    session_id: Option<String>,
    turns: TurnLog,
    /// An assistant turn is arriving as chunks
    streaming: bool,
    /// Speak effects whose sequence number is not known yet
    awaiting_queue: u32,
    /// Highest utterance sequence number handed to speech output
    last_queued: u64,
    /// Highest utterance sequence number that finished or was flushed
    played_through: u64,
    /// Final text of the current listening window
    transcript: String,
    /// Final plus interim text for display
    display_transcript: String,
    debounce: Duration,
    debounce_generation: u64,
    /// Text of the last user turn handed to the transport
    last_submitted: Option<String>,
    recognizer_failures: u32,
    listen_failed: bool,
    last_error: Option<BriefError>,
}

impl Default for ConversationMachine {
    fn default() -> Self {
        Self::new(DEFAULT_TURN_DEBOUNCE, TurnLog::new())
    }
}

impl ConversationMachine {
    pub fn new(debounce: Duration, turns: TurnLog) -> Self {
        Self {
            state: ConversationState::Idle,
            epoch: 0,
            paused_from: None,
            session_id: None,
            turns,
            streaming: false,
            awaiting_queue: 0,
            last_queued: 0,
            played_through: 0,
            transcript: String::new(),
            display_transcript: String::new(),
            debounce,
            debounce_generation: 0,
            last_submitted: None,
            recognizer_failures: 0,
            listen_failed: false,
            last_error: None,
        }
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_paused(&self) -> bool {
        self.paused_from.is_some()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Transcript of the current listening window for display
    pub fn transcript(&self) -> &str {
        &self.display_transcript
    }

    pub fn last_error(&self) -> Option<&BriefError> {
        self.last_error.as_ref()
    }

    pub fn turns(&self) -> &TurnLog {
        &self.turns
    }

    /// Apply one input and return the resulting effects in order
    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        let mut fx = Vec::new();

        match input {
            Input::Start => self.on_start(&mut fx),
            Input::Pause => self.on_pause(&mut fx),
            Input::Resume => self.on_resume(&mut fx),
            Input::TogglePause => {
                if self.is_paused() {
                    self.on_resume(&mut fx)
                } else {
                    self.on_pause(&mut fx)
                }
            }
            Input::End => {
                info!("Conversation ended by user");
                self.wind_down(&mut fx);
            }
            Input::Connected { epoch, session_id } => {
                self.on_connected(epoch, session_id, &mut fx)
            }
            Input::ConnectFailed { epoch, error } => {
                if self.is_current(epoch) && self.state == ConversationState::Connecting {
                    self.enter_error(error, &mut fx);
                } else {
                    debug!("Ignoring connect failure from epoch {}", epoch);
                }
            }
            Input::Transport(envelope) => self.on_transport(envelope, &mut fx),
            Input::Queued { seq } => {
                self.awaiting_queue = self.awaiting_queue.saturating_sub(1);
                self.last_queued = self.last_queued.max(seq);
                self.maybe_listen(&mut fx);
            }
            Input::Playback(event) => self.on_playback(event, &mut fx),
            Input::Transcript(event) => self.on_transcript(event, &mut fx),
            Input::ListenFailed { epoch, error } => {
                self.on_listen_failed(epoch, error, &mut fx)
            }
            Input::DebounceElapsed { epoch, generation } => {
                self.on_debounce(epoch, generation, &mut fx)
            }
            Input::SendFailed { epoch, error } => self.on_send_failed(epoch, error, &mut fx),
        }

        fx
    }

    fn is_current(&self, epoch: u64) -> bool {
        epoch == self.epoch
    }

    fn transition(&mut self, to: ConversationState, fx: &mut Vec<Effect>) {
        if self.state == to {
            return;
        }
        let from = self.state;
        info!("Conversation state: {} -> {}", from, to);
        self.state = to;
        fx.push(Effect::Emit(ConversationEvent::StateChanged { from, to }));
    }

    fn on_start(&mut self, fx: &mut Vec<Effect>) {
        if !self.state.can_start() {
            info!("Start ignored while {}", self.state);
            return;
        }

        if self.state.is_error() {
            // Release the failed session before opening a new one
            fx.push(Effect::Disconnect);
        }

        self.epoch += 1;
        self.awaiting_queue = 0;
        self.turns.clear();
        self.session_id = None;
        self.streaming = false;
        self.paused_from = None;
        self.clear_transcript();
        self.last_submitted = None;
        self.recognizer_failures = 0;
        self.listen_failed = false;
        self.last_error = None;

        self.transition(ConversationState::Connecting, fx);
        fx.push(Effect::Connect { epoch: self.epoch });
    }

    fn on_connected(&mut self, epoch: u64, session_id: String, fx: &mut Vec<Effect>) {
        if !self.is_current(epoch) || !self.state.is_active() {
            debug!("Ignoring session {} from epoch {}", session_id, epoch);
            return;
        }
        info!("Session {} opened", session_id);
        self.session_id = Some(session_id.clone());
        fx.push(Effect::Emit(ConversationEvent::SessionOpened { session_id }));
    }

    fn on_transport(&mut self, envelope: TransportEnvelope, fx: &mut Vec<Effect>) {
        if !self.is_current(envelope.epoch) {
            debug!(
                "Dropping stale transport event (epoch {}, current {})",
                envelope.epoch, self.epoch
            );
            return;
        }
        if !self.state.is_active() {
            debug!("Dropping transport event while {}", self.state);
            return;
        }

        match envelope.event {
            TransportEvent::Opened => debug!("Channel open, waiting for assistant"),
            TransportEvent::Chunk(chunk) => self.on_chunk(chunk, fx),
            TransportEvent::Message { content, kind } => self.on_message(content, kind, fx),
            TransportEvent::Error(message) => {
                self.enter_error(BriefError::ServerError(message), fx)
            }
            TransportEvent::Closed { code, reason } => {
                if is_normal_closure(code) {
                    info!("Session closed by server ({})", code);
                    self.wind_down(fx);
                } else {
                    self.enter_error(BriefError::ConnectionError { code, reason }, fx);
                }
            }
        }
    }

    fn on_chunk(&mut self, chunk: String, fx: &mut Vec<Effect>) {
        if self.state == ConversationState::Listening {
            self.stop_listening(fx);
        }

        let text = self.turns.append_chunk(&chunk);
        self.streaming = true;
        fx.push(Effect::Emit(ConversationEvent::AssistantChunk {
            chunk: chunk.clone(),
            text,
        }));

        if !chunk.trim().is_empty() {
            self.awaiting_queue += 1;
            fx.push(Effect::SpeakChunk(chunk));
            if self.is_paused() {
                self.paused_from = Some(ConversationState::Speaking);
                fx.push(Effect::PauseSpeaking);
            }
        }

        self.transition(ConversationState::Speaking, fx);
    }

    fn on_message(&mut self, content: String, kind: MessageKind, fx: &mut Vec<Effect>) {
        if self.state == ConversationState::Listening {
            self.stop_listening(fx);
        }

        let was_streaming = self.streaming;
        self.streaming = false;

        let turn = self.turns.complete_assistant(&content, kind);
        debug!("Assistant {} ({} chars)", kind, content.len());
        fx.push(Effect::Emit(ConversationEvent::AssistantMessage(turn)));

        // Streamed turns were already queued chunk by chunk
        if !was_streaming && !content.trim().is_empty() {
            self.played_through = self.last_queued;
            self.awaiting_queue += 1;
            fx.push(Effect::Speak(content));
            if self.is_paused() {
                self.paused_from = Some(ConversationState::Speaking);
                fx.push(Effect::PauseSpeaking);
            }
        }

        self.transition(ConversationState::Speaking, fx);
        self.maybe_listen(fx);
    }

    fn on_playback(&mut self, event: OutputEvent, fx: &mut Vec<Effect>) {
        match event {
            OutputEvent::Started { seq, .. } => debug!("Playing utterance {}", seq),
            OutputEvent::Finished { seq } => {
                self.played_through = self.played_through.max(seq);
            }
            OutputEvent::Drained { through } => {
                self.played_through = self.played_through.max(through);
                self.maybe_listen(fx);
            }
            OutputEvent::Failed { seq, error } => {
                if self.state == ConversationState::Speaking {
                    warn!("Playback of utterance {} failed", seq);
                    self.enter_error(error, fx);
                } else {
                    debug!("Ignoring playback failure while {}", self.state);
                }
            }
        }
    }

    /// Start listening once the assistant turn is complete and fully played
    fn maybe_listen(&mut self, fx: &mut Vec<Effect>) {
        if self.state != ConversationState::Speaking
            || self.is_paused()
            || self.streaming
            || self.awaiting_queue > 0
            || self.played_through < self.last_queued
        {
            return;
        }
        self.begin_listening(fx);
    }

    fn begin_listening(&mut self, fx: &mut Vec<Effect>) {
        self.clear_transcript();
        self.debounce_generation += 1;
        self.listen_failed = false;
        self.transition(ConversationState::Listening, fx);
        fx.push(Effect::StartListening { epoch: self.epoch });
    }

    fn stop_listening(&mut self, fx: &mut Vec<Effect>) {
        self.debounce_generation += 1;
        self.clear_transcript();
        fx.push(Effect::CancelDebounce);
        fx.push(Effect::StopListening);
    }

    fn stop_speaking(&mut self, fx: &mut Vec<Effect>) {
        self.played_through = self.last_queued;
        fx.push(Effect::StopSpeaking);
    }

    fn clear_transcript(&mut self) {
        self.transcript.clear();
        self.display_transcript.clear();
    }

    fn on_transcript(&mut self, event: TranscriptEvent, fx: &mut Vec<Effect>) {
        if self.state != ConversationState::Listening || self.is_paused() {
            debug!("Ignoring transcript event while {}", self.state);
            return;
        }

        match event {
            TranscriptEvent::Interim { text } => {
                self.debounce_generation += 1;
                if self.transcript.is_empty() {
                    fx.push(Effect::CancelDebounce);
                } else {
                    self.schedule_debounce(fx);
                }
                self.display_transcript = text.clone();
                fx.push(Effect::Emit(ConversationEvent::TranscriptUpdated(text)));
            }
            TranscriptEvent::Final { text } => {
                self.recognizer_failures = 0;
                self.debounce_generation += 1;
                self.transcript = text.clone();
                self.display_transcript = text.clone();
                self.schedule_debounce(fx);
                fx.push(Effect::Emit(ConversationEvent::TranscriptUpdated(text)));
            }
            TranscriptEvent::Failed(error) => {
                if matches!(error, BriefError::UnsupportedError(_)) {
                    self.enter_error(error, fx);
                    return;
                }
                self.recognizer_failures += 1;
                if self.recognizer_failures >= MAX_RECOGNIZER_FAILURES {
                    error!(
                        "Speech recognition failed {} times in a row",
                        self.recognizer_failures
                    );
                    self.enter_error(error, fx);
                    return;
                }
                warn!("Speech recognition failed: {}", error);
                fx.push(Effect::Emit(ConversationEvent::Warning(error.user_message())));
                self.restart_listening_if_empty(fx);
            }
            TranscriptEvent::Ended => {
                debug!("Recognizer ended its window");
                self.restart_listening_if_empty(fx);
            }
        }
    }

    /// Reopen capture after the device closed a window with nothing said;
    /// pending text is left to the debounce timer
    fn restart_listening_if_empty(&mut self, fx: &mut Vec<Effect>) {
        if self.transcript.trim().is_empty() {
            fx.push(Effect::StartListening { epoch: self.epoch });
        }
    }

    fn schedule_debounce(&mut self, fx: &mut Vec<Effect>) {
        fx.push(Effect::ScheduleDebounce {
            epoch: self.epoch,
            generation: self.debounce_generation,
            delay: self.debounce,
        });
    }

    fn on_listen_failed(&mut self, epoch: u64, error: BriefError, fx: &mut Vec<Effect>) {
        if !self.is_current(epoch) || self.state != ConversationState::Listening {
            debug!("Ignoring listen failure from epoch {}", epoch);
            return;
        }
        if matches!(error, BriefError::UnsupportedError(_)) {
            self.enter_error(error, fx);
            return;
        }
        warn!("Could not start listening: {}", error);
        self.listen_failed = true;
        fx.push(Effect::Emit(ConversationEvent::Warning(error.user_message())));
    }

    fn on_debounce(&mut self, epoch: u64, generation: u64, fx: &mut Vec<Effect>) {
        if !self.is_current(epoch)
            || generation != self.debounce_generation
            || self.state != ConversationState::Listening
            || self.is_paused()
        {
            debug!("Ignoring stale debounce (generation {})", generation);
            return;
        }

        let text = self.transcript.trim().to_string();
        if text.is_empty() {
            return;
        }

        if self.last_submitted.as_deref() == Some(text.as_str()) {
            info!("Ignoring repeat of the last submitted turn");
            self.clear_transcript();
            fx.push(Effect::ResetTranscript);
            return;
        }

        self.last_submitted = Some(text.clone());
        let turn = ConversationTurn::user(&text);
        self.turns.add(turn.clone());

        self.debounce_generation += 1;
        self.clear_transcript();
        fx.push(Effect::StopListening);
        fx.push(Effect::Emit(ConversationEvent::UserTurn(turn)));
        self.transition(ConversationState::Processing, fx);
        fx.push(Effect::Send {
            epoch: self.epoch,
            text,
        });
    }

    fn on_send_failed(&mut self, epoch: u64, error: BriefError, fx: &mut Vec<Effect>) {
        if !self.is_current(epoch) || self.state != ConversationState::Processing {
            debug!("Ignoring send failure from epoch {}", epoch);
            return;
        }
        warn!("Failed to send turn: {}", error);
        self.last_submitted = None;
        fx.push(Effect::Emit(ConversationEvent::Warning(error.user_message())));
        self.begin_listening(fx);
    }

    fn on_pause(&mut self, fx: &mut Vec<Effect>) {
        if self.is_paused() {
            debug!("Already paused");
            return;
        }

        match self.state {
            ConversationState::Speaking => {
                fx.push(Effect::PauseSpeaking);
            }
            ConversationState::Listening => {
                self.stop_listening(fx);
            }
            other => {
                debug!("Pause ignored while {}", other);
                return;
            }
        }

        info!("Paused while {}", self.state);
        self.paused_from = Some(self.state);
        fx.push(Effect::Emit(ConversationEvent::PauseChanged(true)));
    }

    fn on_resume(&mut self, fx: &mut Vec<Effect>) {
        match self.paused_from.take() {
            Some(ConversationState::Speaking) => {
                info!("Resuming playback");
                fx.push(Effect::ResumeSpeaking);
                fx.push(Effect::Emit(ConversationEvent::PauseChanged(false)));
                self.maybe_listen(fx);
            }
            Some(_) => {
                info!("Resuming listening");
                fx.push(Effect::Emit(ConversationEvent::PauseChanged(false)));
                if self.state == ConversationState::Listening {
                    self.begin_listening(fx);
                }
            }
            None if self.state == ConversationState::Listening && self.listen_failed => {
                info!("Retrying speech recognition");
                self.listen_failed = false;
                fx.push(Effect::StartListening { epoch: self.epoch });
            }
            None => debug!("Resume ignored, not paused"),
        }
    }

    /// Stop everything and return to idle
    fn wind_down(&mut self, fx: &mut Vec<Effect>) {
        self.epoch += 1;
        self.release(fx);
        self.session_id = None;
        self.transition(ConversationState::Idle, fx);
        fx.push(Effect::Emit(ConversationEvent::Ended));
        fx.push(Effect::InvokeOnEnd);
    }

    fn enter_error(&mut self, error: BriefError, fx: &mut Vec<Effect>) {
        error!("Conversation error: {}", error);
        self.epoch += 1;
        self.release(fx);
        self.last_error = Some(error.clone());
        self.transition(ConversationState::Error, fx);
        fx.push(Effect::Emit(ConversationEvent::Error(error)));
    }

    /// Cancel timers, stop both adapters and drop the channel
    fn release(&mut self, fx: &mut Vec<Effect>) {
        self.debounce_generation += 1;
        self.clear_transcript();
        fx.push(Effect::CancelDebounce);
        self.stop_speaking(fx);
        fx.push(Effect::StopListening);
        fx.push(Effect::Disconnect);

        if self.streaming {
            self.turns.seal_partial();
            self.streaming = false;
        }
        if self.paused_from.take().is_some() {
            fx.push(Effect::Emit(ConversationEvent::PauseChanged(false)));
        }
    }
}
