//! Call manager: owns the call session and applies every input to it in order.

use super::cleanup::CleanupCoordinator;
use super::error::CallError;
use super::media::{Consumer, LocalStream, MediaEngine, MediaKind};
use super::quality::classify;
use super::state::{CallSession, CallSnapshot, CallTransition, LifecycleState, MediaFlag};
use super::transport::{MediaTransportManager, ProduceOutcome};
use crate::channel::Signaling;
use crate::config::CallConfig;
use crate::protocol::{ClientEvent, ServerEvent, TransportParams};
use crate::types::call::{CallId, EndReason, RemoteParty};
use crate::types::events::{
    CallFailed, CloseReason, CommandRejected, ErrorDismissed, Event, EventBus, NonFatalError,
};
use log::{debug, error, info, trace, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// How many ended call ids are remembered to refuse late offers for them.
const ENDED_CALL_MEMORY: usize = 32;

/// Local user actions.
#[derive(Debug, Clone, PartialEq)]
pub enum CallCommand {
    Dial { to: RemoteParty },
    Answer { call_id: CallId, caller: RemoteParty },
    HangUp,
    ToggleMic,
    ToggleCamera,
    SwitchCamera,
}

impl CallCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Dial { .. } => "dial",
            Self::Answer { .. } => "answer",
            Self::HangUp => "hang-up",
            Self::ToggleMic => "toggle-mic",
            Self::ToggleCamera => "toggle-camera",
            Self::SwitchCamera => "switch-camera",
        }
    }
}

/// Results of background work, reported back into the queue.
pub(crate) enum Completion {
    LocalMediaReady {
        epoch: u64,
        stream: LocalStream,
        outcome: ProduceOutcome,
    },
    LocalMediaFailed {
        epoch: u64,
        message: String,
    },
    ConsumerCreated {
        epoch: u64,
        producer_id: String,
        result: Result<Arc<dyn Consumer>, String>,
    },
    ConsumerResumed {
        epoch: u64,
        consumer_id: String,
        result: Result<(), String>,
    },
    EndedStatusElapsed {
        epoch: u64,
    },
    ErrorDisplayElapsed {
        epoch: u64,
    },
    ErrorTeardownDue {
        epoch: u64,
    },
}

pub(crate) enum CallInput {
    Server(ServerEvent),
    Command(CallCommand),
    Completion(Completion),
}

/// Entry point into the call manager's queue.
#[derive(Clone)]
pub struct CallInbox {
    tx: mpsc::UnboundedSender<CallInput>,
}

impl CallInbox {
    /// Queue a server event. Returns false once the manager has stopped.
    pub fn deliver(&self, event: ServerEvent) -> bool {
        self.tx.send(CallInput::Server(event)).is_ok()
    }

    pub fn command(&self, command: CallCommand) -> Result<(), CallError> {
        self.tx
            .send(CallInput::Command(command))
            .map_err(|_| CallError::Closed)
    }

    fn complete(&self, completion: Completion) {
        if self.tx.send(CallInput::Completion(completion)).is_err() {
            debug!(target: "Calls", "Call manager is gone, dropping completion");
        }
    }
}

#[cfg(test)]
impl CallInbox {
    /// An inbox with no manager behind it, for inspecting what gets delivered.
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<CallInput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[cfg(test)]
impl CallInput {
    pub(crate) fn server_event(&self) -> Option<&ServerEvent> {
        match self {
            Self::Server(event) => Some(event),
            _ => None,
        }
    }
}

/// Cheap handle for issuing commands and observing the call.
#[derive(Clone)]
pub struct CallHandle {
    inbox: CallInbox,
    snapshot: watch::Receiver<CallSnapshot>,
}

impl CallHandle {
    pub fn inbox(&self) -> CallInbox {
        self.inbox.clone()
    }

    /// The most recently published state.
    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    /// A receiver that is notified on every change.
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    pub fn dial(&self, to: RemoteParty) -> Result<(), CallError> {
        self.inbox.command(CallCommand::Dial { to })
    }

    pub fn answer(&self, call_id: CallId, caller: RemoteParty) -> Result<(), CallError> {
        self.inbox.command(CallCommand::Answer { call_id, caller })
    }

    pub fn hang_up(&self) -> Result<(), CallError> {
        self.inbox.command(CallCommand::HangUp)
    }

    pub fn toggle_mic(&self) -> Result<(), CallError> {
        self.inbox.command(CallCommand::ToggleMic)
    }

    pub fn toggle_camera(&self) -> Result<(), CallError> {
        self.inbox.command(CallCommand::ToggleCamera)
    }

    pub fn switch_camera(&self) -> Result<(), CallError> {
        self.inbox.command(CallCommand::SwitchCamera)
    }
}

fn live(session: &mut Option<CallSession>, epoch: u64) -> Option<&mut CallSession> {
    session
        .as_mut()
        .filter(|session| session.epoch == epoch && !session.closed)
}

fn call_label(session: &CallSession) -> &str {
    session.call_id.as_ref().map(CallId::as_str).unwrap_or("-")
}

pub struct CallManager {
    config: CallConfig,
    device_id: String,
    signaling: Arc<dyn Signaling>,
    transports: MediaTransportManager,
    cleanup: CleanupCoordinator,
    events: Arc<EventBus>,
    session: Option<CallSession>,
    next_epoch: u64,
    ended_calls: VecDeque<CallId>,
    // Weak so the manager stops once every handle is dropped.
    inbox: mpsc::WeakUnboundedSender<CallInput>,
    snapshot_tx: watch::Sender<CallSnapshot>,
}

impl CallManager {
    pub(crate) fn new(
        config: CallConfig,
        device_id: String,
        signaling: Arc<dyn Signaling>,
        engine: Arc<dyn MediaEngine>,
        events: Arc<EventBus>,
    ) -> (Self, CallHandle, mpsc::UnboundedReceiver<CallInput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::default());
        let manager = Self {
            transports: MediaTransportManager::new(
                signaling.clone(),
                engine,
                config.video_min_bitrate,
            ),
            cleanup: CleanupCoordinator::new(config.clone(), events.clone()),
            config,
            device_id,
            signaling,
            events,
            session: None,
            next_epoch: 0,
            ended_calls: VecDeque::new(),
            inbox: tx.downgrade(),
            snapshot_tx,
        };
        let handle = CallHandle {
            inbox: CallInbox { tx },
            snapshot: snapshot_rx,
        };
        (manager, handle, rx)
    }

    /// Start the manager on the runtime and return its handle.
    pub fn spawn(
        config: CallConfig,
        device_id: String,
        signaling: Arc<dyn Signaling>,
        engine: Arc<dyn MediaEngine>,
        events: Arc<EventBus>,
    ) -> CallHandle {
        let (manager, handle, rx) = Self::new(config, device_id, signaling, engine, events);
        tokio::spawn(manager.run(rx));
        handle
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<CallInput>) {
        debug!(target: "Calls", "Call manager started");
        while let Some(input) = rx.recv().await {
            self.process(input).await;
        }
        if self.session.is_some() {
            self.close_session(CloseReason::HungUp).await;
            self.reset_session();
            self.publish();
        }
        debug!(target: "Calls", "Call manager stopped");
    }

    pub(crate) async fn process(&mut self, input: CallInput) {
        match input {
            CallInput::Server(event) => {
                debug!(target: "Calls", "<-- {}", event.name());
                self.handle_server_event(event).await;
            }
            CallInput::Command(command) => self.handle_command(command).await,
            CallInput::Completion(completion) => self.handle_completion(completion).await,
        }
        self.publish();
    }

    fn publish(&self) {
        let snapshot = self
            .session
            .as_ref()
            .map(CallSession::snapshot)
            .unwrap_or_default();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn new_session(&mut self) -> CallSession {
        self.next_epoch += 1;
        CallSession::new(self.next_epoch, &self.config)
    }

    fn completion_sink(&self) -> Option<CallInbox> {
        let sink = self.inbox.upgrade().map(|tx| CallInbox { tx });
        if sink.is_none() {
            debug!(target: "Calls", "Call manager is shutting down, not starting background work");
        }
        sink
    }

    fn schedule(&self, delay: Duration, completion: Completion) {
        let Some(inbox) = self.completion_sink() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inbox.complete(completion);
        });
    }

    // Server events

    async fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::CallStarted(started) => {
                self.on_transports_offered(
                    CallTransition::CallStarted,
                    started.call_id,
                    started.remote,
                    &started.send_transport,
                    &started.recv_transport,
                )
                .await
            }
            ServerEvent::CallJoined(joined) => {
                self.on_transports_offered(
                    CallTransition::CallJoined,
                    joined.call_id,
                    joined.remote,
                    &joined.send_transport,
                    &joined.recv_transport,
                )
                .await
            }
            ServerEvent::CallAnswered(answered) => self.on_call_answered(answered.call_id),
            ServerEvent::CallEnded(ended) => self.on_call_ended(ended.call_id, ended.reason).await,
            ServerEvent::NewProducer(announced) => self.on_new_producer(announced.producer_id),
            ServerEvent::ProducerPaused(changed) => {
                self.on_remote_media(changed.kind, MediaFlag::Paused)
            }
            ServerEvent::ProducerResumed(changed) => {
                self.on_remote_media(changed.kind, MediaFlag::Active)
            }
            ServerEvent::ScoreChanged(changed) => self.on_score(changed.score),
            ServerEvent::CallError(report) => self.fail_call(report.message).await,
        }
    }

    async fn on_transports_offered(
        &mut self,
        transition: CallTransition,
        call_id: CallId,
        remote: Option<RemoteParty>,
        send: &TransportParams,
        recv: &TransportParams,
    ) {
        if self.ended_calls.contains(&call_id) {
            warn!(target: "Calls", "Ignoring {transition:?} for {call_id}: call already ended");
            return;
        }
        if self.session.is_none() {
            let session = self.new_session();
            self.session = Some(session);
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.closed
            || !matches!(
                session.state,
                LifecycleState::Idle | LifecycleState::Dialing
            )
        {
            warn!(
                target: "Calls",
                "Ignoring {transition:?} for {call_id} in state {:?}",
                session.state
            );
            return;
        }

        session.call_id = Some(call_id);
        if let Some(remote) = remote {
            session.remote_party = Some(remote);
        }
        let result = self
            .transports
            .create_transports(&mut session.media, send, recv)
            .and_then(|()| Ok(session.apply_transition(transition)?));
        match result {
            Ok(()) => {
                info!(
                    target: "Calls",
                    "Call {} is now {:?}",
                    call_label(session),
                    session.state
                );
                if transition == CallTransition::CallJoined {
                    self.start_local_media();
                }
            }
            Err(e) => {
                self.fail_call(format!("could not set up media transports: {e}"))
                    .await
            }
        }
    }

    fn on_call_answered(&mut self, call_id: Option<CallId>) {
        let Some(session) = self.session.as_mut() else {
            debug!(target: "Calls", "Ignoring call-answered: no call");
            return;
        };
        if !session.matches(call_id.as_ref()) {
            debug!(target: "Calls", "Ignoring call-answered for another call");
            return;
        }
        if let Err(e) = session.apply_transition(CallTransition::CallAnswered) {
            warn!(target: "Calls", "Ignoring call-answered: {e}");
            return;
        }
        info!(target: "Calls", "Call {} answered, publishing local media", call_label(session));
        self.start_local_media();
    }

    /// Capture local media and create producers in the background.
    fn start_local_media(&self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let Some(send) = session.media.send() else {
            warn!(target: "Calls/Media", "No send transport, cannot publish local media");
            return;
        };
        let Some(inbox) = self.completion_sink() else {
            return;
        };
        let epoch = session.epoch;
        let facing_mode = session.local_media.facing_mode;
        let transports = self.transports.clone();
        tokio::spawn(async move {
            let completion = match transports.acquire_local_stream(facing_mode).await {
                Ok(stream) => {
                    let outcome = transports.produce(send, &stream).await;
                    Completion::LocalMediaReady {
                        epoch,
                        stream,
                        outcome,
                    }
                }
                Err(e) => Completion::LocalMediaFailed {
                    epoch,
                    message: e.to_string(),
                },
            };
            inbox.complete(completion);
        });
    }

    async fn on_call_ended(&mut self, call_id: Option<CallId>, reason: EndReason) {
        let Some(session) = self.session.as_mut() else {
            debug!(target: "Calls", "Ignoring call-ended ({reason}): no call");
            return;
        };
        if !session.matches(call_id.as_ref()) {
            debug!(target: "Calls", "Ignoring call-ended for another call");
            return;
        }
        if !session.state.is_active() {
            debug!(
                target: "Calls",
                "Ignoring call-ended ({reason}) in state {:?}",
                session.state
            );
            return;
        }
        if let Err(e) = session.apply_transition(CallTransition::Ended) {
            warn!(target: "Calls", "Ignoring call-ended: {e}");
            return;
        }
        info!(target: "Calls", "Call {} ended: {reason}", call_label(session));
        session.ended_reason = Some(reason.clone());
        let epoch = session.epoch;

        self.close_session(CloseReason::Ended(reason.clone())).await;
        if reason.is_completed() {
            self.reset_session();
        } else {
            self.schedule(
                self.cleanup.ended_status_visibility(),
                Completion::EndedStatusElapsed { epoch },
            );
        }
    }

    fn on_new_producer(&mut self, producer_id: String) {
        let Some(session) = self.session.as_ref() else {
            debug!(target: "Calls/Media", "Ignoring new-producer {producer_id}: no call");
            return;
        };
        if session.closed
            || !matches!(
                session.state,
                LifecycleState::Connecting | LifecycleState::Ongoing
            )
        {
            debug!(
                target: "Calls/Media",
                "Ignoring new-producer {producer_id} in state {:?}",
                session.state
            );
            return;
        }
        let Some(recv) = session.media.recv() else {
            warn!(target: "Calls/Media", "No receive transport for producer {producer_id}");
            return;
        };
        let Some(inbox) = self.completion_sink() else {
            return;
        };
        let epoch = session.epoch;
        let transports = self.transports.clone();
        tokio::spawn(async move {
            let result = transports
                .consume(recv, &producer_id)
                .await
                .map_err(|e| e.to_string());
            inbox.complete(Completion::ConsumerCreated {
                epoch,
                producer_id,
                result,
            });
        });
    }

    fn on_remote_media(&mut self, kind: MediaKind, flag: MediaFlag) {
        match self.session.as_mut() {
            Some(session) if session.state == LifecycleState::Ongoing => {
                debug!(target: "Calls/Media", "Remote {kind} is now {flag:?}");
                session.remote_media.set(kind, flag);
            }
            _ => debug!(target: "Calls/Media", "Ignoring remote {kind} {flag:?}: not in a call"),
        }
    }

    fn on_score(&mut self, score: u32) {
        match self.session.as_mut() {
            Some(session) if session.state == LifecycleState::Ongoing => {
                let quality = classify(score);
                trace!(target: "Calls", "Score {score} -> {quality:?}");
                session.quality = quality;
            }
            _ => trace!(target: "Calls", "Ignoring score {score}: not in a call"),
        }
    }

    // Completions

    async fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::LocalMediaReady {
                epoch,
                stream,
                outcome,
            } => self.on_local_media_ready(epoch, stream, outcome).await,
            Completion::LocalMediaFailed { epoch, message } => {
                let setting_up = live(&mut self.session, epoch).is_some_and(|s| {
                    matches!(
                        s.state,
                        LifecycleState::Connecting | LifecycleState::Ongoing
                    )
                });
                if setting_up {
                    self.fail_call(format!("could not access camera or microphone: {message}"))
                        .await;
                }
            }
            Completion::ConsumerCreated {
                epoch,
                producer_id,
                result,
            } => self.on_consumer_created(epoch, producer_id, result),
            Completion::ConsumerResumed {
                epoch,
                consumer_id,
                result,
            } => self.on_consumer_resumed(epoch, consumer_id, result),
            Completion::EndedStatusElapsed { epoch } => {
                let showing = self
                    .session
                    .as_ref()
                    .is_some_and(|s| s.epoch == epoch && s.state == LifecycleState::Ending);
                if showing {
                    self.reset_session();
                }
            }
            Completion::ErrorDisplayElapsed { epoch } => self.on_error_display_elapsed(epoch),
            Completion::ErrorTeardownDue { epoch } => {
                let failure = self
                    .session
                    .as_ref()
                    .filter(|s| s.epoch == epoch && s.state == LifecycleState::ErrorRecovery)
                    .map(|s| s.failure.clone().unwrap_or_default());
                if let Some(message) = failure {
                    self.close_session(CloseReason::Failed(message)).await;
                    self.reset_session();
                }
            }
        }
    }

    async fn on_local_media_ready(
        &mut self,
        epoch: u64,
        stream: LocalStream,
        outcome: ProduceOutcome,
    ) {
        let accepting = live(&mut self.session, epoch).is_some_and(|s| {
            s.media.send.is_some()
                && matches!(
                    s.state,
                    LifecycleState::Connecting | LifecycleState::Ongoing
                )
        });
        if !accepting {
            debug!(target: "Calls/Media", "Local media arrived after the call moved on, releasing it");
            for producer in &outcome.producers {
                producer.close();
            }
            stream.stop();
            return;
        }

        if outcome.producers.is_empty() {
            stream.stop();
            let reasons = outcome
                .failures
                .iter()
                .map(|(kind, e)| format!("{kind}: {e}"))
                .collect::<Vec<_>>()
                .join("; ");
            self.fail_call(format!("could not publish local media ({reasons})"))
                .await;
            return;
        }

        let Some(session) = live(&mut self.session, epoch) else {
            return;
        };
        for producer in outcome.producers {
            // Toggles made while producers were being negotiated still apply.
            if session.local_media.is_disabled(producer.kind()) {
                producer.pause();
            }
            session.media.insert_producer(producer);
        }
        for track in stream.tracks() {
            track.set_enabled(!session.local_media.is_disabled(track.kind()));
        }
        session.local_stream = Some(stream);

        if session.state == LifecycleState::Connecting {
            if let Err(e) = session.apply_transition(CallTransition::ProducersReady) {
                warn!(target: "Calls", "{e}");
            } else {
                info!(target: "Calls", "Call {} is now Ongoing", call_label(session));
            }
        }
        let send_ready = !session.ready_sent;
        session.ready_sent = true;
        let call_id = session.call_id.clone();

        for (kind, message) in outcome.failures {
            self.events.dispatch(Event::NonFatalError(NonFatalError {
                call_id: call_id.clone(),
                message: format!("could not publish {kind}: {message}"),
            }));
        }
        if send_ready && let Err(e) = self.signaling.emit(ClientEvent::ReadyToConsume {}).await {
            warn!(target: "Calls", "Failed to send readyToConsume: {e}");
        }
    }

    fn on_consumer_created(
        &mut self,
        epoch: u64,
        producer_id: String,
        result: Result<Arc<dyn Consumer>, String>,
    ) {
        let Some(session) = live(&mut self.session, epoch).filter(|s| {
            matches!(
                s.state,
                LifecycleState::Connecting | LifecycleState::Ongoing
            )
        }) else {
            if let Ok(consumer) = result {
                consumer.close();
            }
            debug!(target: "Calls/Media", "Consumer for {producer_id} arrived after teardown, dropping it");
            return;
        };

        let consumer = match result {
            Ok(consumer) => consumer,
            Err(message) => {
                warn!(target: "Calls/Media", "Could not consume {producer_id}: {message}");
                let call_id = session.call_id.clone();
                self.events.dispatch(Event::NonFatalError(NonFatalError {
                    call_id,
                    message: format!("could not receive {producer_id}: {message}"),
                }));
                return;
            }
        };
        let Some(recv) = session.media.recv() else {
            consumer.close();
            return;
        };
        let scope = recv.id().to_string();
        let consumer_id = consumer.id().to_string();
        debug!(target: "Calls/Media", "Consumer {consumer_id} created for {producer_id}, resuming");
        session.media.insert_consumer(consumer);

        let Some(inbox) = self.completion_sink() else {
            return;
        };
        let transports = self.transports.clone();
        tokio::spawn(async move {
            let result = transports
                .resume(&scope, &consumer_id)
                .await
                .map_err(|e| e.to_string());
            inbox.complete(Completion::ConsumerResumed {
                epoch,
                consumer_id,
                result,
            });
        });
    }

    fn on_consumer_resumed(&mut self, epoch: u64, consumer_id: String, result: Result<(), String>) {
        let Some(session) = live(&mut self.session, epoch) else {
            debug!(target: "Calls/Media", "Resume for {consumer_id} arrived after teardown, ignoring");
            return;
        };
        match result {
            Ok(()) => match session.media.consumer(&consumer_id) {
                Some(consumer) => {
                    consumer.resume();
                    debug!(target: "Calls/Media", "Consumer {consumer_id} resumed");
                }
                None => debug!(target: "Calls/Media", "Consumer {consumer_id} is gone, ignoring resume"),
            },
            Err(message) => {
                if let Some(consumer) = session.media.remove_consumer(&consumer_id) {
                    consumer.close();
                }
                warn!(target: "Calls/Media", "Discarding consumer {consumer_id}: {message}");
                let call_id = session.call_id.clone();
                self.events.dispatch(Event::NonFatalError(NonFatalError {
                    call_id,
                    message: format!("could not resume {consumer_id}: {message}"),
                }));
            }
        }
    }

    fn on_error_display_elapsed(&mut self, epoch: u64) {
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.epoch == epoch && s.state == LifecycleState::ErrorRecovery)
        else {
            return;
        };
        session.error = None;
        let call_id = session.call_id.clone();
        self.events
            .dispatch(Event::ErrorDismissed(ErrorDismissed { call_id }));
        let (_, teardown_delay) = self.cleanup.error_schedule();
        self.schedule(teardown_delay, Completion::ErrorTeardownDue { epoch });
    }

    // Terminal paths

    /// Route a fatal error: show it, then tear the call down after the visibility delay.
    async fn fail_call(&mut self, message: String) {
        let Some(session) = self.session.as_mut() else {
            warn!(target: "Calls", "Call error with no call: {message}");
            self.events.dispatch(Event::CallFailed(CallFailed {
                call_id: None,
                message,
            }));
            return;
        };

        match session.state {
            LifecycleState::Ending | LifecycleState::ErrorRecovery => {
                debug!(target: "Calls", "Already terminating, ignoring error: {message}");
            }
            LifecycleState::Idle => {
                // Answer still pending: nothing has been set up, drop it now.
                error!(target: "Calls", "Call {} failed: {message}", call_label(session));
                session.failure = Some(message.clone());
                let call_id = session.call_id.clone();
                self.events.dispatch(Event::CallFailed(CallFailed {
                    call_id,
                    message: message.clone(),
                }));
                self.close_session(CloseReason::Failed(message)).await;
                self.reset_session();
            }
            _ => {
                if let Err(e) = session.apply_transition(CallTransition::Failed) {
                    warn!(target: "Calls", "{e}");
                    return;
                }
                error!(target: "Calls", "Call {} failed: {message}", call_label(session));
                session.error = Some(message.clone());
                session.failure = Some(message.clone());
                let epoch = session.epoch;
                let call_id = session.call_id.clone();
                self.events
                    .dispatch(Event::CallFailed(CallFailed { call_id, message }));
                let (display_delay, _) = self.cleanup.error_schedule();
                self.schedule(display_delay, Completion::ErrorDisplayElapsed { epoch });
            }
        }
    }

    /// Run cleanup, then drop any negotiation still pending on the closed transports.
    async fn close_session(&mut self, reason: CloseReason) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Some(call_id) = &session.call_id
            && !self.ended_calls.contains(call_id)
        {
            if self.ended_calls.len() == ENDED_CALL_MEMORY {
                self.ended_calls.pop_front();
            }
            self.ended_calls.push_back(call_id.clone());
        }
        if let Some(report) = self.cleanup.teardown(session, reason) {
            for transport_id in &report.closed_transports {
                self.signaling.cancel_scope(transport_id).await;
            }
        }
    }

    fn reset_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            if session.state != LifecycleState::Idle
                && let Err(e) = session.apply_transition(CallTransition::Reset)
            {
                debug!(target: "Calls", "{e}");
            }
            debug!(target: "Calls", "Session {} for call {} reset", session.epoch, call_label(&session));
        }
    }

    // Commands

    async fn handle_command(&mut self, command: CallCommand) {
        let name = command.name();
        let result = match command {
            CallCommand::Dial { to } => self.dial(to).await,
            CallCommand::Answer { call_id, caller } => self.answer(call_id, caller).await,
            CallCommand::HangUp => self.hang_up().await,
            CallCommand::ToggleMic => self.toggle(MediaKind::Audio),
            CallCommand::ToggleCamera => self.toggle(MediaKind::Video),
            CallCommand::SwitchCamera => self.switch_camera(),
        };
        if let Err(reason) = result {
            warn!(target: "Calls", "Rejected {name}: {reason}");
            self.events
                .dispatch(Event::CommandRejected(CommandRejected {
                    command: name,
                    reason: reason.to_string(),
                }));
        }
    }

    async fn dial(&mut self, to: RemoteParty) -> Result<(), CallError> {
        if let Some(session) = &self.session {
            return Err(CallError::CallInProgress(session.state));
        }
        let mut session = self.new_session();
        session.apply_transition(CallTransition::Dial)?;
        session.remote_party = Some(to.clone());
        info!(target: "Calls", "Dialing {}", to.user_id());
        self.session = Some(session);
        self.publish();

        let event = ClientEvent::CallUser {
            to: to.user_id().to_string(),
        };
        if let Err(e) = self.signaling.emit(event).await {
            self.fail_call(format!("could not reach the call server: {e}"))
                .await;
        }
        Ok(())
    }

    async fn answer(&mut self, call_id: CallId, caller: RemoteParty) -> Result<(), CallError> {
        if let Some(session) = &self.session {
            return Err(CallError::CallInProgress(session.state));
        }
        let mut session = self.new_session();
        session.call_id = Some(call_id.clone());
        session.remote_party = Some(caller.clone());
        info!(target: "Calls", "Answering call {call_id} from {}", caller.user_id());
        self.session = Some(session);
        self.publish();

        let event = ClientEvent::AnswerCall {
            call_id,
            caller_user_id: caller.user_id().to_string(),
            device_id: self.device_id.clone(),
        };
        if let Err(e) = self.signaling.emit(event).await {
            self.fail_call(format!("could not reach the call server: {e}"))
                .await;
        }
        Ok(())
    }

    async fn hang_up(&mut self) -> Result<(), CallError> {
        let Some(session) = self.session.as_mut() else {
            return Err(CallError::NoSession);
        };
        if session.state == LifecycleState::Ending {
            // Already torn down; this dismisses the ended status.
            self.reset_session();
            return Ok(());
        }
        session.apply_transition(CallTransition::LocalHangUp)?;
        info!(target: "Calls", "Hanging up call {}", call_label(session));
        self.close_session(CloseReason::HungUp).await;
        self.reset_session();
        Ok(())
    }

    fn toggle(&mut self, kind: MediaKind) -> Result<(), CallError> {
        let session = self
            .session
            .as_mut()
            .filter(|s| !s.state.is_terminating())
            .ok_or(CallError::NoSession)?;
        let disabled = match kind {
            MediaKind::Audio => {
                session.local_media.mic_muted = !session.local_media.mic_muted;
                session.local_media.mic_muted
            }
            MediaKind::Video => {
                session.local_media.camera_off = !session.local_media.camera_off;
                session.local_media.camera_off
            }
        };
        if let Some(producer) = session.media.producer_of_kind(kind) {
            if disabled {
                producer.pause();
            } else {
                producer.resume();
            }
        }
        if let Some(track) = session.local_stream.as_ref().and_then(|s| s.track(kind)) {
            track.set_enabled(!disabled);
        }
        debug!(
            target: "Calls/Media",
            "Local {kind} {}",
            if disabled { "disabled" } else { "enabled" }
        );
        Ok(())
    }

    fn switch_camera(&mut self) -> Result<(), CallError> {
        let session = self
            .session
            .as_mut()
            .filter(|s| !s.state.is_terminating())
            .ok_or(CallError::NoSession)?;
        let next = session.local_media.facing_mode.flipped();
        if let Some(track) = session
            .local_stream
            .as_ref()
            .and_then(|s| s.track(MediaKind::Video))
        {
            track.set_facing_mode(next)?;
        }
        session.local_media.facing_mode = next;
        debug!(target: "Calls/Media", "Camera switched to {next:?}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::media::{FacingMode, HeadlessMediaEngine, HeadlessOptions, HeadlessStats};
    use crate::calls::quality::ConnectionQuality;
    use crate::protocol::ServerFrame;
    use crate::request::RequestError;
    use crate::types::events::SessionClosed;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    #[derive(Default)]
    struct FakeSignaling {
        emitted: Mutex<Vec<ClientEvent>>,
        requests: Mutex<Vec<ClientEvent>>,
        refuse: Mutex<HashSet<&'static str>>,
        cancelled: Mutex<Vec<String>>,
        offline: Mutex<bool>,
    }

    impl FakeSignaling {
        fn emitted_names(&self) -> Vec<&'static str> {
            self.emitted.lock().unwrap().iter().map(ClientEvent::name).collect()
        }

        fn count_emitted(&self, name: &str) -> usize {
            self.emitted_names().iter().filter(|n| **n == name).count()
        }
    }

    #[async_trait]
    impl Signaling for FakeSignaling {
        async fn emit(&self, event: ClientEvent) -> Result<(), RequestError> {
            if *self.offline.lock().unwrap() {
                return Err(RequestError::NotConnected);
            }
            self.emitted.lock().unwrap().push(event);
            Ok(())
        }

        async fn request(
            &self,
            event: ClientEvent,
            _scope: Option<&str>,
        ) -> Result<Value, RequestError> {
            self.requests.lock().unwrap().push(event.clone());
            if self.refuse.lock().unwrap().contains(event.name()) {
                return Ok(json!({"success": false, "error": "refused by test"}));
            }
            Ok(match event {
                ClientEvent::CreateProducer { kind, .. } => {
                    json!({"success": true, "id": format!("prod-{kind}")})
                }
                ClientEvent::CreateConsumer { producer_id, .. } => json!({
                    "success": true,
                    "params": {
                        "id": format!("cons-{producer_id}"),
                        "producerId": producer_id,
                        "kind": "video",
                        "rtpParameters": {}
                    }
                }),
                _ => json!({"success": true}),
            })
        }

        async fn cancel_scope(&self, scope: &str) {
            self.cancelled.lock().unwrap().push(scope.to_string());
        }
    }

    struct Harness {
        manager: CallManager,
        handle: CallHandle,
        rx: mpsc::UnboundedReceiver<CallInput>,
        signaling: Arc<FakeSignaling>,
        stats: Arc<HeadlessStats>,
        closed: broadcast::Receiver<Arc<SessionClosed>>,
        failed: broadcast::Receiver<Arc<CallFailed>>,
        non_fatal: broadcast::Receiver<Arc<NonFatalError>>,
        dismissed: broadcast::Receiver<Arc<ErrorDismissed>>,
        rejected: broadcast::Receiver<Arc<CommandRejected>>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with(HeadlessOptions::default())
        }

        fn with(options: HeadlessOptions) -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            let signaling = Arc::new(FakeSignaling::default());
            let engine = HeadlessMediaEngine::new(options);
            let stats = engine.stats();
            let events = Arc::new(EventBus::new());
            let (manager, handle, rx) = CallManager::new(
                CallConfig::default(),
                "device-1".into(),
                signaling.clone(),
                Arc::new(engine),
                events.clone(),
            );
            Self {
                manager,
                handle,
                rx,
                signaling,
                stats,
                closed: events.session_closed.subscribe(),
                failed: events.call_failed.subscribe(),
                non_fatal: events.non_fatal_error.subscribe(),
                dismissed: events.error_dismissed.subscribe(),
                rejected: events.command_rejected.subscribe(),
            }
        }

        /// Process completions until background work goes quiet.
        async fn settle(&mut self) {
            while let Ok(Some(input)) =
                tokio::time::timeout(Duration::from_millis(5), self.rx.recv()).await
            {
                self.manager.process(input).await;
            }
        }

        async fn server(&mut self, frame: Value) {
            self.manager.process(CallInput::Server(event(frame))).await;
            self.settle().await;
        }

        /// Put a frame in the queue without processing anything yet.
        fn enqueue(&self, frame: Value) {
            assert!(self.handle.inbox().deliver(event(frame)));
        }

        async fn command(&mut self, command: CallCommand) {
            self.manager.process(CallInput::Command(command)).await;
            self.settle().await;
        }

        async fn advance(&mut self, duration: Duration) {
            tokio::time::advance(duration).await;
            self.settle().await;
        }

        fn snapshot(&self) -> CallSnapshot {
            self.manager.snapshot_tx.borrow().clone()
        }

        fn session(&self) -> &CallSession {
            self.manager.session.as_ref().expect("live session")
        }

        async fn ongoing_outgoing_call(&mut self) {
            self.command(CallCommand::Dial {
                to: RemoteParty::user("bob"),
            })
            .await;
            self.server(call_started("c1")).await;
            self.server(json!({"event": "call-answered", "data": {"callId": "c1"}}))
                .await;
            assert_eq!(self.snapshot().state, LifecycleState::Ongoing);
        }
    }

    fn event(frame: Value) -> ServerEvent {
        let ServerFrame::Event(event) = ServerFrame::parse(&frame.to_string()).unwrap() else {
            panic!("not an event: {frame}");
        };
        event
    }

    fn transport(id: &str) -> Value {
        json!({"id": id, "iceParameters": {}, "iceCandidates": [], "dtlsParameters": {}})
    }

    fn call_started(call_id: &str) -> Value {
        json!({
            "event": "call-started",
            "data": {
                "callId": call_id,
                "sendTransport": transport("s1"),
                "recvTransport": transport("r1"),
                "remote": {"type": "user", "userId": "bob"}
            }
        })
    }

    fn call_ended(reason: &str) -> Value {
        json!({"event": "call-ended", "data": {"reason": reason}})
    }

    fn new_producer(id: &str) -> Value {
        json!({"event": "new-producer", "data": {"producerId": id, "kind": "video"}})
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_then_call_started_rings() {
        let mut h = Harness::new();

        h.command(CallCommand::Dial {
            to: RemoteParty::user("bob"),
        })
        .await;
        assert_eq!(h.snapshot().state, LifecycleState::Dialing);
        assert_eq!(
            h.signaling.emitted.lock().unwrap().clone(),
            vec![ClientEvent::CallUser { to: "bob".into() }]
        );

        h.server(call_started("c1")).await;
        let snapshot = h.snapshot();
        assert_eq!(snapshot.state, LifecycleState::Ringing);
        assert!(snapshot.is_ringing);
        assert_eq!(snapshot.call_id, Some(CallId::new("c1")));
        assert_eq!(h.stats.open_transports(), 2);
        // Transports are not connected until something is produced or consumed.
        assert!(h.signaling.requests.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_call_goes_ongoing_and_sends_ready_once() {
        let mut h = Harness::new();
        h.ongoing_outgoing_call().await;

        assert_eq!(h.session().media().producer_count(), 2);
        assert!(!h.snapshot().is_ringing);
        assert_eq!(h.signaling.count_emitted("readyToConsume"), 1);

        h.server(new_producer("p1")).await;
        h.server(json!({"event": "score-changed", "data": {"score": 5}}))
            .await;
        assert_eq!(h.signaling.count_emitted("readyToConsume"), 1);
        assert_eq!(h.snapshot().connection_quality, ConnectionQuality::Mid);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_call_is_destroyed() {
        let mut h = Harness::new();
        h.ongoing_outgoing_call().await;
        h.server(json!({"event": "score-changed", "data": {"score": 9}}))
            .await;
        h.server(new_producer("p1")).await;

        h.server(call_ended("completed")).await;

        assert_eq!(h.snapshot(), CallSnapshot::default());
        assert!(h.manager.session.is_none());
        assert_eq!(h.stats.live_tracks(), 0);
        assert_eq!(h.stats.open_transports(), 0);

        let closed = h.closed.try_recv().unwrap();
        assert_eq!(closed.reason, CloseReason::Ended(EndReason::Completed));
        assert!(h.closed.try_recv().is_err());
        let cancelled = h.signaling.cancelled.lock().unwrap().clone();
        assert_eq!(cancelled, vec!["s1", "r1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_call_keeps_ended_status_visible() {
        let mut h = Harness::new();
        h.ongoing_outgoing_call().await;

        h.server(call_ended("rejected")).await;
        let snapshot = h.snapshot();
        assert_eq!(snapshot.state, LifecycleState::Ending);
        assert_eq!(snapshot.ended_reason, Some(EndReason::Rejected));
        assert_eq!(snapshot.remote_party, None);
        assert_eq!(h.stats.live_tracks(), 0);
        assert!(h.closed.try_recv().is_ok());

        h.advance(Duration::from_secs(3)).await;
        assert_eq!(h.snapshot(), CallSnapshot::default());
        assert!(h.closed.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_resume_discards_consumer() {
        let mut h = Harness::new();
        h.ongoing_outgoing_call().await;
        h.signaling.refuse.lock().unwrap().insert("resume-consumer");

        h.server(new_producer("p1")).await;

        assert_eq!(h.session().media().consumer_count(), 0);
        assert_eq!(h.snapshot().remote_media.video, MediaFlag::Active);
        assert_eq!(h.snapshot().state, LifecycleState::Ongoing);
        assert!(h.failed.try_recv().is_err());
        let warning = h.non_fatal.try_recv().unwrap();
        assert!(warning.message.contains("cons-p1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumed_consumer_is_kept() {
        let mut h = Harness::new();
        h.ongoing_outgoing_call().await;

        h.server(new_producer("p1")).await;

        let consumer = h.session().media().consumer("cons-p1").unwrap().clone();
        assert!(!consumer.is_paused());
        assert!(h.non_fatal.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_pause_updates_flags() {
        let mut h = Harness::new();
        h.ongoing_outgoing_call().await;

        h.server(json!({"event": "producer-paused", "data": {"kind": "audio"}}))
            .await;
        assert_eq!(h.snapshot().remote_media.audio, MediaFlag::Paused);
        h.server(json!({"event": "producer-resumed", "data": {"kind": "audio"}}))
            .await;
        assert_eq!(h.snapshot().remote_media.audio, MediaFlag::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_error_is_shown_then_torn_down() {
        let mut h = Harness::new();
        h.ongoing_outgoing_call().await;

        h.server(json!({"event": "call-error", "data": {"message": "router crashed"}}))
            .await;
        let snapshot = h.snapshot();
        assert_eq!(snapshot.state, LifecycleState::ErrorRecovery);
        assert_eq!(snapshot.error.as_deref(), Some("router crashed"));
        assert_eq!(h.failed.try_recv().unwrap().message, "router crashed");
        // Resources stay until the error has been on screen.
        assert_eq!(h.stats.open_transports(), 2);

        h.advance(Duration::from_secs(1)).await;
        assert!(h.dismissed.try_recv().is_ok());
        assert_eq!(h.snapshot().error, None);
        assert_eq!(h.stats.open_transports(), 2);

        h.advance(Duration::from_secs(2)).await;
        assert_eq!(h.snapshot(), CallSnapshot::default());
        assert_eq!(h.stats.open_transports(), 0);
        assert_eq!(h.stats.live_tracks(), 0);
        let closed = h.closed.try_recv().unwrap();
        assert_eq!(closed.reason, CloseReason::Failed("router crashed".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_acquisition_failure_never_reaches_ongoing() {
        let mut h = Harness::with(HeadlessOptions {
            acquire_error: Some("camera busy".into()),
            ..Default::default()
        });
        h.command(CallCommand::Dial {
            to: RemoteParty::user("bob"),
        })
        .await;
        h.server(call_started("c1")).await;
        h.server(json!({"event": "call-answered", "data": {}})).await;

        assert_eq!(h.snapshot().state, LifecycleState::ErrorRecovery);
        assert!(h.failed.try_recv().unwrap().message.contains("camera busy"));
        assert_eq!(h.signaling.count_emitted("readyToConsume"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failing_kind_is_not_fatal() {
        let mut h = Harness::with(HeadlessOptions {
            failing_kinds: vec![MediaKind::Video],
            ..Default::default()
        });
        h.ongoing_outgoing_call().await;

        assert_eq!(h.session().media().producer_count(), 1);
        assert!(h.non_fatal.try_recv().unwrap().message.contains("video"));
        assert!(h.failed.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_producers_refused_is_fatal() {
        let mut h = Harness::new();
        h.signaling.refuse.lock().unwrap().insert("create-producer");
        h.command(CallCommand::Dial {
            to: RemoteParty::user("bob"),
        })
        .await;
        h.server(call_started("c1")).await;
        h.server(json!({"event": "call-answered", "data": {}})).await;

        assert_eq!(h.snapshot().state, LifecycleState::ErrorRecovery);
        assert_eq!(h.stats.live_tracks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callee_join_goes_straight_to_ongoing() {
        let mut h = Harness::new();
        h.command(CallCommand::Answer {
            call_id: CallId::new("c9"),
            caller: RemoteParty::contact("alice", "Alice"),
        })
        .await;
        assert_eq!(
            h.signaling.emitted.lock().unwrap()[0],
            ClientEvent::AnswerCall {
                call_id: CallId::new("c9"),
                caller_user_id: "alice".into(),
                device_id: "device-1".into(),
            }
        );

        let mut joined = call_started("c9");
        joined["event"] = json!("call-joined");
        h.server(joined).await;

        let snapshot = h.snapshot();
        assert_eq!(snapshot.state, LifecycleState::Ongoing);
        assert_eq!(h.session().media().producer_count(), 2);
        assert_eq!(h.signaling.count_emitted("readyToConsume"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_consumer_after_hang_up_is_dropped() {
        let mut h = Harness::new();
        h.ongoing_outgoing_call().await;

        let ServerFrame::Event(event) =
            ServerFrame::parse(&new_producer("p1").to_string()).unwrap()
        else {
            unreachable!()
        };
        h.manager.process(CallInput::Server(event)).await;
        h.manager
            .process(CallInput::Command(CallCommand::HangUp))
            .await;
        h.settle().await;

        assert!(h.manager.session.is_none());
        assert!(h.non_fatal.try_recv().is_err());
        assert_eq!(h.stats.open_transports(), 0);
        assert_eq!(h.closed.try_recv().unwrap().reason, CloseReason::HungUp);
        assert!(h.closed.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_ended_without_call_is_ignored() {
        let mut h = Harness::new();
        h.server(call_ended("completed")).await;
        assert_eq!(h.snapshot(), CallSnapshot::default());
        assert!(h.closed.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_up_twice() {
        let mut h = Harness::new();
        h.ongoing_outgoing_call().await;
        let emitted_before = h.signaling.emitted_names();

        h.command(CallCommand::HangUp).await;
        assert_eq!(h.snapshot(), CallSnapshot::default());
        assert_eq!(h.signaling.emitted_names(), emitted_before);
        assert!(h.closed.try_recv().is_ok());

        h.command(CallCommand::HangUp).await;
        assert_eq!(h.rejected.try_recv().unwrap().command, "hang-up");
        assert!(h.closed.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_while_busy_is_rejected() {
        let mut h = Harness::new();
        h.command(CallCommand::Dial {
            to: RemoteParty::user("bob"),
        })
        .await;
        h.command(CallCommand::Dial {
            to: RemoteParty::user("carol"),
        })
        .await;

        assert_eq!(h.rejected.try_recv().unwrap().command, "dial");
        assert_eq!(h.signaling.count_emitted("call-user"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_while_offline_fails_the_call() {
        let mut h = Harness::new();
        *h.signaling.offline.lock().unwrap() = true;
        h.command(CallCommand::Dial {
            to: RemoteParty::user("bob"),
        })
        .await;

        assert_eq!(h.snapshot().state, LifecycleState::ErrorRecovery);
        assert!(h.failed.try_recv().is_ok());
        h.advance(Duration::from_secs(1)).await;
        h.advance(Duration::from_secs(2)).await;
        assert_eq!(h.snapshot(), CallSnapshot::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_does_not_touch_next_call() {
        let mut h = Harness::new();
        h.ongoing_outgoing_call().await;
        h.server(call_ended("busy")).await;
        // Dismissing the ended status early frees the slot for a new call.
        h.command(CallCommand::HangUp).await;
        h.command(CallCommand::Dial {
            to: RemoteParty::user("carol"),
        })
        .await;

        h.advance(Duration::from_secs(3)).await;
        assert_eq!(h.snapshot().state, LifecycleState::Dialing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggles_apply_to_producers_and_reset_on_cleanup() {
        let mut h = Harness::new();
        h.ongoing_outgoing_call().await;

        h.command(CallCommand::ToggleMic).await;
        h.command(CallCommand::SwitchCamera).await;
        let snapshot = h.snapshot();
        assert!(snapshot.local_media.mic_muted);
        assert_eq!(snapshot.local_media.facing_mode, FacingMode::Environment);
        let audio = h
            .session()
            .media()
            .producer_of_kind(MediaKind::Audio)
            .unwrap()
            .clone();
        assert!(audio.is_paused());

        h.command(CallCommand::ToggleMic).await;
        assert!(!audio.is_paused());

        h.command(CallCommand::ToggleCamera).await;
        h.server(call_ended("rejected")).await;
        assert_eq!(h.snapshot().local_media, Default::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_events_give_same_state_as_one_at_a_time() {
        let script = vec![
            call_started("c1"),
            json!({"event": "producer-paused", "data": {"kind": "video"}}),
            json!({"event": "score-changed", "data": {"score": 2}}),
            call_ended("rejected"),
            call_started("c1"),
        ];

        let mut stepwise = Harness::new();
        let mut queued = Harness::new();
        for h in [&mut stepwise, &mut queued] {
            h.command(CallCommand::Dial {
                to: RemoteParty::user("bob"),
            })
            .await;
        }

        for frame in &script {
            stepwise.server(frame.clone()).await;
        }
        for frame in &script {
            queued.enqueue(frame.clone());
        }
        queued.settle().await;

        let snapshot = stepwise.snapshot();
        assert_eq!(queued.snapshot(), snapshot);
        assert_eq!(snapshot.state, LifecycleState::Ending);
        assert_eq!(snapshot.ended_reason, Some(EndReason::Rejected));
        assert_eq!(snapshot.connection_quality, ConnectionQuality::Unknown);
        assert_eq!(snapshot.remote_media.video, MediaFlag::Active);
        assert_eq!(
            stepwise.signaling.emitted.lock().unwrap().clone(),
            queued.signaling.emitted.lock().unwrap().clone()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ended_call_id_never_rings_again() {
        let mut h = Harness::new();
        h.ongoing_outgoing_call().await;
        h.server(call_ended("completed")).await;
        assert_eq!(h.snapshot(), CallSnapshot::default());

        h.server(call_started("c1")).await;
        assert_eq!(h.snapshot(), CallSnapshot::default());
        assert!(h.manager.session.is_none());

        h.server(json!({
            "event": "call-joined",
            "data": {
                "callId": "c1",
                "sendTransport": transport("s1"),
                "recvTransport": transport("r1")
            }
        }))
        .await;
        assert!(h.manager.session.is_none());

        h.server(call_started("c2")).await;
        assert_eq!(h.snapshot().state, LifecycleState::Ringing);
        assert_eq!(h.snapshot().call_id, Some(CallId::new("c2")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_for_another_call_are_ignored() {
        let mut h = Harness::new();
        h.ongoing_outgoing_call().await;
        h.server(json!({"event": "call-ended", "data": {"reason": "completed", "callId": "other"}}))
            .await;
        assert_eq!(h.snapshot().state, LifecycleState::Ongoing);
    }
}
