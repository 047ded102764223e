//! Orchestrator runtime
//!
//! Runs the [`ConversationMachine`] on tokio: UI commands, transport
//! frames, playback progress, transcripts and internal timers are merged
//! into one loop, and the effects of every transition are carried out
//! against the adapters before the next input is taken.

use crate::conversation::{
    ConversationCommand, ConversationEvent, ConversationMachine, ConversationSnapshot,
    Effect, Input, SharedConversationState,
};
use crate::identity::IdentityContext;
use crate::integration::config::BriefConfig;
use crate::messages::TurnLog;
use crate::speech::{
    OutputEvent, Recognizer, SpeechInput, SpeechOutput, Synthesizer, TranscriptUpdate,
};
use crate::transport::{
    ChannelConnector, ConnectOutcome, ConnectStart, SessionApi, SessionTransport,
    TransportEnvelope,
};
use crate::{BriefError, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Callback run when a conversation ends normally
pub type OnEnd = Arc<dyn Fn() + Send + Sync>;

/// Collaborators the orchestrator drives
pub struct OrchestratorParts {
    pub identity: IdentityContext,
    pub session_api: Arc<dyn SessionApi>,
    pub connector: Arc<dyn ChannelConnector>,
    pub recognizer: Arc<dyn Recognizer>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub on_end: Option<OnEnd>,
}

/// Handle for controlling the orchestrator from the UI
#[derive(Clone)]
pub struct OrchestratorHandle {
    command_tx: mpsc::UnboundedSender<ConversationCommand>,
    event_rx: Receiver<ConversationEvent>,
    state: SharedConversationState,
}

impl OrchestratorHandle {
    /// Send a command to the orchestrator
    pub fn send_command(&self, cmd: ConversationCommand) -> Result<()> {
        self.command_tx
            .send(cmd)
            .map_err(|e| BriefError::ConfigError(format!("Failed to send command: {}", e)))
    }

    pub fn start(&self) -> Result<()> {
        self.send_command(ConversationCommand::Start)
    }

    pub fn pause(&self) -> Result<()> {
        self.send_command(ConversationCommand::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        self.send_command(ConversationCommand::Resume)
    }

    pub fn pause_resume(&self) -> Result<()> {
        self.send_command(ConversationCommand::PauseResume)
    }

    pub fn end(&self) -> Result<()> {
        self.send_command(ConversationCommand::End)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send_command(ConversationCommand::Shutdown)
    }

    /// Try to receive an event from the orchestrator
    pub fn try_recv_event(&self) -> Option<ConversationEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Block the calling thread until an event arrives or `timeout` passes
    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<ConversationEvent> {
        match self.event_rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Current conversation state
    pub fn state(&self) -> ConversationSnapshot {
        self.state.snapshot()
    }

    pub fn shared_state(&self) -> SharedConversationState {
        self.state.clone()
    }
}

impl std::fmt::Debug for OrchestratorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorHandle")
            .field("state", &self.state.state())
            .finish()
    }
}

/// Main orchestrator that coordinates session and speech
pub struct Orchestrator {
    machine: ConversationMachine,
    identity: IdentityContext,

    transport: SessionTransport,
    transport_rx: mpsc::UnboundedReceiver<TransportEnvelope>,
    input: SpeechInput,
    transcript_rx: mpsc::UnboundedReceiver<TranscriptUpdate>,
    output: SpeechOutput,
    output_rx: mpsc::UnboundedReceiver<OutputEvent>,

    command_rx: mpsc::UnboundedReceiver<ConversationCommand>,
    event_tx: Sender<ConversationEvent>,
    state: SharedConversationState,
    on_end: Option<OnEnd>,

    /// Results of spawned work fed back into the machine
    internal_tx: mpsc::UnboundedSender<Input>,
    internal_rx: mpsc::UnboundedReceiver<Input>,
    debounce: Option<JoinHandle<()>>,
}

impl Orchestrator {
    /// Create a new orchestrator with the given configuration
    pub fn new(
        config: BriefConfig,
        parts: OrchestratorParts,
    ) -> Result<(Self, OrchestratorHandle)> {
        config.validate()?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = bounded(config.event_buffer_size);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let turns = TurnLog::new();
        let state = SharedConversationState::new(turns.clone());
        let machine = ConversationMachine::new(config.turn_debounce(), turns);

        let (transport, transport_rx) = SessionTransport::new(
            parts.session_api,
            parts.connector,
            config.ws_base(),
            config.retry.clone(),
        );
        let (input, transcript_rx) = SpeechInput::new(parts.recognizer);
        let (output, output_rx) = SpeechOutput::new(parts.synthesizer);

        let handle = OrchestratorHandle {
            command_tx,
            event_rx,
            state: state.clone(),
        };

        let orchestrator = Self {
            machine,
            identity: parts.identity,
            transport,
            transport_rx,
            input,
            transcript_rx,
            output,
            output_rx,
            command_rx,
            event_tx,
            state,
            on_end: parts.on_end,
            internal_tx,
            internal_rx,
            debounce: None,
        };

        Ok((orchestrator, handle))
    }

    /// Spawn the orchestrator loop on the current tokio runtime
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!("Orchestrator started");

        loop {
            let input = tokio::select! {
                cmd = self.command_rx.recv() => match cmd {
                    Some(ConversationCommand::Start) => Input::Start,
                    Some(ConversationCommand::Pause) => Input::Pause,
                    Some(ConversationCommand::Resume) => Input::Resume,
                    Some(ConversationCommand::PauseResume) => Input::TogglePause,
                    Some(ConversationCommand::End) => Input::End,
                    Some(ConversationCommand::Shutdown) => {
                        info!("Orchestrator shutdown requested");
                        break;
                    }
                    None => {
                        warn!("Command channel disconnected");
                        break;
                    }
                },
                Some(envelope) = self.transport_rx.recv() => Input::Transport(envelope),
                Some(event) = self.output_rx.recv() => Input::Playback(event),
                Some(update) = self.transcript_rx.recv() => {
                    if update.window != self.input.window() {
                        debug!("Dropping transcript from closed window {}", update.window);
                        continue;
                    }
                    Input::Transcript(update.event)
                }
                Some(input) = self.internal_rx.recv() => input,
            };

            self.dispatch(input);
        }

        self.release();
        self.emit(ConversationEvent::Shutdown);
        info!("Orchestrator stopped");
    }

    /// Feed one input through the machine, including the inputs its
    /// effects produce synchronously
    fn dispatch(&mut self, input: Input) {
        let mut work = VecDeque::from([input]);
        while let Some(input) = work.pop_front() {
            for effect in self.machine.handle(input) {
                self.apply(effect, &mut work);
            }
        }
        self.sync_state();
    }

    fn apply(&mut self, effect: Effect, work: &mut VecDeque<Input>) {
        match effect {
            Effect::Connect { epoch } => self.spawn_connect(epoch),
            Effect::Disconnect => self.transport.disconnect(),
            Effect::Send { epoch, text } => {
                if let Err(error) = self.transport.send(&text) {
                    work.push_back(Input::SendFailed { epoch, error });
                }
            }
            Effect::Speak(text) => {
                let seq = self.output.speak_now(&text).map(|p| p.seq).unwrap_or(0);
                work.push_back(Input::Queued { seq });
            }
            Effect::SpeakChunk(text) => {
                let seq = self.output.speak_chunk(&text).unwrap_or(0);
                work.push_back(Input::Queued { seq });
            }
            Effect::PauseSpeaking => {
                self.output.pause();
            }
            Effect::ResumeSpeaking => {
                self.output.resume();
            }
            Effect::StopSpeaking => self.output.stop(),
            Effect::StartListening { epoch } => match self.input.start_listening() {
                Ok(window) => debug!("Listening window {} open", window),
                Err(error) => work.push_back(Input::ListenFailed { epoch, error }),
            },
            Effect::StopListening => self.input.stop_listening(),
            Effect::ResetTranscript => self.input.reset_transcript(),
            Effect::ScheduleDebounce {
                epoch,
                generation,
                delay,
            } => {
                self.cancel_debounce();
                let tx = self.internal_tx.clone();
                self.debounce = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Input::DebounceElapsed { epoch, generation });
                }));
            }
            Effect::CancelDebounce => self.cancel_debounce(),
            Effect::Emit(event) => self.emit(event),
            Effect::InvokeOnEnd => {
                if let Some(on_end) = &self.on_end {
                    on_end();
                }
            }
        }
    }

    fn spawn_connect(&self, epoch: u64) {
        // Claimed here so an End handled before the task runs cancels it
        let ticket = match self.transport.begin(epoch) {
            ConnectStart::Begun(ticket) => ticket,
            ConnectStart::Done(ConnectOutcome::AlreadyConnected(session)) => {
                let _ = self.internal_tx.send(Input::Connected {
                    epoch,
                    session_id: session.session_id,
                });
                return;
            }
            ConnectStart::Done(outcome) => {
                debug!("Connect for epoch {} not started: {:?}", epoch, outcome);
                return;
            }
        };

        let transport = self.transport.clone();
        let identity = self.identity.clone();
        let tx = self.internal_tx.clone();

        tokio::spawn(async move {
            let input = match transport.finish(&identity, ticket).await {
                Ok(ConnectOutcome::Connected(session))
                | Ok(ConnectOutcome::AlreadyConnected(session)) => Input::Connected {
                    epoch,
                    session_id: session.session_id,
                },
                Ok(outcome) => {
                    debug!("Connect for epoch {} finished as {:?}", epoch, outcome);
                    return;
                }
                Err(error) => Input::ConnectFailed { epoch, error },
            };
            let _ = tx.send(input);
        });
    }

    fn cancel_debounce(&mut self) {
        if let Some(timer) = self.debounce.take() {
            timer.abort();
        }
    }

    fn emit(&self, event: ConversationEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => warn!("UI event buffer full, dropping {:?}", event),
            Err(TrySendError::Disconnected(_)) => debug!("No UI listening for events"),
        }
    }

    fn sync_state(&self) {
        let mut data = self.state.write();
        data.state = self.machine.state();
        data.paused = self.machine.is_paused();
        data.speaking = self.output.is_speaking();
        data.transcript = self.machine.transcript().to_string();
        data.session_id = self.machine.session_id().map(str::to_string);
        data.last_error = self.machine.last_error().cloned();
        data.epoch = self.machine.epoch();
    }

    /// Stop every adapter on shutdown
    fn release(&mut self) {
        self.cancel_debounce();
        self.output.stop();
        self.input.stop_listening();
        self.transport.disconnect();
    }
}
