//! The session runtime: one task that owns the machine, queue, transport and
//! store handle, and multiplexes caller commands with transport events.

use super::{Command, SessionError};
use crate::{
    queue::OutgoingQueue,
    state::SessionContext,
    store::{self, ConversationRecord, ConversationStore},
    transport::{TransportAdapter, TransportEvent},
};
use chatstream_core::{
    ConversationId, ConversationMeta, Effect, Mode, PendingRequest, PresentationEvent, Scope,
    SessionMachine, types::receipt_time,
};
use std::{ops::ControlFlow, sync::Arc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

const UNTITLED: &str = "New conversation";

pub(super) struct SessionRuntime {
    machine: SessionMachine,
    queue: OutgoingQueue,
    transport: TransportAdapter,
    store: Arc<dyn ConversationStore>,
    commands: mpsc::UnboundedReceiver<Command>,
    observers: Vec<mpsc::UnboundedSender<PresentationEvent>>,
}

impl SessionRuntime {
    pub(super) fn new(context: SessionContext, commands: mpsc::UnboundedReceiver<Command>) -> Self {
        Self {
            machine: SessionMachine::new(context.caller_id),
            queue: OutgoingQueue::new(),
            transport: TransportAdapter::new(context.connector, context.backoff),
            store: context.store,
            commands,
            observers: Vec::new(),
        }
    }

    /// Runs until teardown or until every handle is dropped.
    pub(super) async fn run(mut self) {
        info!("session runtime started");
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        info!("all session handles dropped; shutting down");
                        self.shutdown().await;
                        break;
                    };
                    if self.handle_command(command).await.is_break() {
                        break;
                    }
                }
                event = self.transport.next_event() => self.handle_transport(event).await,
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::SendQuery { text, scope, mode } => {
                match self.machine.send_query(&text, scope, mode, receipt_time()) {
                    Ok((request, effects)) => {
                        self.apply(effects).await;
                        self.dispatch(request).await;
                    }
                    Err(e) => warn!(error = %e, "query rejected"),
                }
            }
            Command::Join { conversation_id } => {
                match self.machine.join(conversation_id, receipt_time()) {
                    Ok((request, effects)) => {
                        self.apply(effects).await;
                        self.dispatch(request).await;
                    }
                    Err(e) => warn!(error = %e, "join rejected"),
                }
            }
            Command::CreateConversation { title, reply } => {
                let _ = reply.send(self.create(title).await);
            }
            Command::LoadConversation {
                conversation_id,
                reply,
            } => {
                let _ = reply.send(self.load(conversation_id).await);
            }
            Command::Observe(observer) => self.observers.push(observer),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.machine.snapshot());
            }
            Command::Teardown(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Ready => {
                let effects = self.machine.on_channel_ready();
                self.apply(effects).await;
                self.flush().await;
            }
            TransportEvent::Frame(raw) => {
                let effects = self.machine.on_frame(&raw, receipt_time());
                self.apply(effects).await;
            }
            TransportEvent::Dropped { reason } => {
                warn!(%reason, queued = self.queue.len(), "channel dropped; reconnect scheduled");
                let effects = self.machine.on_channel_lost();
                self.apply(effects).await;
            }
            TransportEvent::StreamFinished => {
                let effects = self.machine.on_stream_finished();
                self.apply(effects).await;
                self.flush().await;
            }
            TransportEvent::StreamFailed { reason } => {
                let effects = self.machine.on_stream_failed(&reason, receipt_time());
                self.apply(effects).await;
                self.flush().await;
            }
            TransportEvent::GaveUp { attempts } => {
                let dropped = self.queue.clear();
                error!(attempts, dropped, "connection lost for good");
                let effects = self.machine.on_connection_lost(attempts);
                self.apply(effects).await;
            }
        }
    }

    async fn create(&mut self, title: Option<String>) -> Result<ConversationId, SessionError> {
        let id = ConversationId::generate();
        let effects = self.machine.create_conversation(ConversationMeta {
            id: id.clone(),
            title: title.unwrap_or_else(|| UNTITLED.to_string()),
            scope: Scope::default(),
            mode: Mode::default(),
            created_at: receipt_time(),
        })?;
        self.apply(effects).await;
        self.retarget(Some(id.clone())).await;
        Ok(id)
    }

    #[instrument(skip_all, fields(conversation_id = %conversation_id))]
    async fn load(&mut self, conversation_id: ConversationId) -> Result<usize, SessionError> {
        let effects = store::replay(self.store.as_ref(), &conversation_id, &mut self.machine).await?;
        let entries = self.machine.conversation().entries().len();
        self.apply(effects).await;
        self.retarget(Some(conversation_id)).await;
        info!(entries, "conversation loaded");
        Ok(entries)
    }

    /// Queues a request and pushes the queue toward the wire.
    async fn dispatch(&mut self, request: PendingRequest) {
        let conversation_id = self.machine.conversation_id().cloned();
        self.retarget(conversation_id).await;
        self.queue.enqueue(request);
        if self.transport.is_idle() {
            self.transport.open();
            let effects = self.machine.on_connecting();
            self.apply(effects).await;
        }
        self.flush().await;
    }

    /// Routes the transport to the current conversation. A link still bound to
    /// the previous one is dropped; whatever is queued reopens a fresh link.
    async fn retarget(&mut self, conversation_id: Option<ConversationId>) {
        if !self.transport.retarget(conversation_id) {
            return;
        }
        let effects = self.machine.on_channel_closed();
        self.apply(effects).await;
        if !self.queue.is_empty() {
            self.transport.open();
            let effects = self.machine.on_connecting();
            self.apply(effects).await;
        }
    }

    async fn flush(&mut self) {
        if self.queue.is_empty() || !self.transport.is_ready() {
            return;
        }
        let report = self.queue.flush(&mut self.transport).await;
        for request in &report.sent {
            debug!(conversation_id = %request.frame.conversation_id(), "request sent");
            let effects = self.machine.on_request_sent(request);
            self.apply(effects).await;
        }
        if let Some(e) = report.stopped {
            debug!(error = %e, queued = self.queue.len(), "requests wait for the next ready channel");
        }
    }

    async fn shutdown(&mut self) {
        self.transport.close();
        let dropped = self.queue.clear();
        if dropped > 0 {
            warn!(dropped, "discarding queued requests at teardown");
        }
        let effects = self.machine.teardown();
        self.apply(effects).await;
    }

    /// Carries out machine effects in order. Store failures are logged; the
    /// session keeps running.
    async fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::EnsureConversation(meta) => {
                    let record = ConversationRecord {
                        id: meta.id,
                        title: meta.title,
                        scope: meta.scope,
                        mode: meta.mode,
                        created_at: meta.created_at,
                    };
                    match self.store.create_conversation(&record).await {
                        Ok(true) => info!(conversation_id = %record.id, title = %record.title, "conversation created"),
                        Ok(false) => debug!(conversation_id = %record.id, "conversation already stored"),
                        Err(e) => error!(error = %e, conversation_id = %record.id, "failed to store conversation record"),
                    }
                }
                Effect::Persist {
                    conversation_id,
                    entries,
                } => {
                    if let Err(e) = self.store.append_unit(&conversation_id, &entries).await {
                        error!(
                            error = %e,
                            conversation_id = %conversation_id,
                            entries = entries.len(),
                            "failed to persist log unit"
                        );
                    }
                }
                Effect::Emit(event) => self.emit(event),
            }
        }
    }

    fn emit(&mut self, event: PresentationEvent) {
        self.observers
            .retain(|observer| observer.send(event.clone()).is_ok());
    }
}
