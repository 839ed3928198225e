//! Session Facade
//!
//! [`SessionHandle`] is the caller-facing API. Each handle talks to one
//! session runtime task over a command channel; the runtime owns the state
//! machine, the outgoing queue, the transport and the store handle.

mod runtime;

use crate::{state::SessionContext, store::StoreError};
use chatstream_core::{
    ConversationId, CoreError, Mode, PresentationEvent, Scope, SessionSnapshot,
};
use runtime::SessionRuntime;
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, error, info, info_span};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("the session runtime has shut down")]
    Shutdown,
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Requests from a [`SessionHandle`] to its runtime.
#[derive(Debug)]
pub(crate) enum Command {
    SendQuery {
        text: String,
        scope: Scope,
        mode: Mode,
    },
    Join {
        conversation_id: ConversationId,
    },
    CreateConversation {
        title: Option<String>,
        reply: oneshot::Sender<Result<ConversationId, SessionError>>,
    },
    LoadConversation {
        conversation_id: ConversationId,
        reply: oneshot::Sender<Result<usize, SessionError>>,
    },
    Observe(mpsc::UnboundedSender<PresentationEvent>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Teardown(oneshot::Sender<()>),
}

/// A cloneable handle to one running session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    /// Spawns the session runtime on the current tokio runtime.
    pub fn spawn(context: SessionContext) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let span = info_span!(
            "session",
            caller_id = %context.caller_id,
            mode = context.connector.kind()
        );
        tokio::spawn(
            async move {
                SessionRuntime::new(context, rx).run().await;
                info!("session runtime finished");
            }
            .instrument(span),
        );
        Self { commands }
    }

    fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| {
            error!("session runtime is gone");
            SessionError::Shutdown
        })
    }

    /// Fire-and-forget. The request is logged, echoed and queued even while no
    /// channel is open.
    pub fn send_query(
        &self,
        text: impl Into<String>,
        scope: Scope,
        mode: Mode,
    ) -> Result<(), SessionError> {
        self.send(Command::SendQuery {
            text: text.into(),
            scope,
            mode,
        })
    }

    /// Switches to a shared conversation and asks the peer for its backlog.
    pub fn join(&self, conversation_id: ConversationId) -> Result<(), SessionError> {
        self.send(Command::Join { conversation_id })
    }

    /// Starts a new, empty conversation and returns its id.
    pub async fn create_conversation(
        &self,
        title: Option<String>,
    ) -> Result<ConversationId, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CreateConversation { title, reply })?;
        rx.await.map_err(|_| SessionError::Shutdown)?
    }

    /// Replays a stored conversation. Returns the number of transcript entries rebuilt.
    pub async fn load_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<usize, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::LoadConversation {
            conversation_id,
            reply,
        })?;
        rx.await.map_err(|_| SessionError::Shutdown)?
    }

    /// Subscribes to presentation events emitted from now on.
    pub fn observe(&self) -> Result<mpsc::UnboundedReceiver<PresentationEvent>, SessionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.send(Command::Observe(tx))?;
        Ok(rx)
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot(reply))?;
        rx.await.map_err(|_| SessionError::Shutdown)
    }

    /// Closes the transport, drops queued requests, finalizes any in-flight
    /// block as-is and stops the runtime.
    pub async fn teardown(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Teardown(reply))?;
        rx.await.map_err(|_| SessionError::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        store::MockConversationStore,
        transport::{Connector, FrameStream, PushConnector, TransportError},
    };
    use async_trait::async_trait;
    use chatstream_core::{SessionState, backoff::BackoffPolicy};
    use futures::{StreamExt, stream};
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    /// Answers every request with the same frames.
    struct CannedPush(Vec<String>);

    #[async_trait]
    impl PushConnector for CannedPush {
        async fn post(&self, _frame: String) -> Result<FrameStream, TransportError> {
            Ok(stream::iter(self.0.clone().into_iter().map(Ok)).boxed())
        }
    }

    fn teapot_frames() -> Vec<String> {
        vec![
            r#"{"kind":"block-begin","query":"find teapots"}"#.into(),
            r#"{"kind":"result-item","score":0.2,"payload":"a"}"#.into(),
            r#"{"kind":"result-item","score":0.8,"payload":"b"}"#.into(),
            r#"{"kind":"block-end"}"#.into(),
        ]
    }

    fn spawn(store: MockConversationStore) -> SessionHandle {
        SessionHandle::spawn(SessionContext {
            caller_id: "me".into(),
            connector: Connector::Push(Arc::new(CannedPush(teapot_frames()))),
            backoff: BackoffPolicy::default(),
            store: Arc::new(store),
        })
    }

    async fn wait_for(
        events: &mut mpsc::UnboundedReceiver<PresentationEvent>,
        wanted: impl Fn(&PresentationEvent) -> bool,
    ) -> PresentationEvent {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = events.recv().await.expect("session closed its event stream");
                if wanted(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn store_failures_do_not_stop_the_session() {
        let mut store = MockConversationStore::new();
        store
            .expect_create_conversation()
            .returning(|_| Err(StoreError::Corrupt("disk full".into())));
        store
            .expect_append_unit()
            .returning(|_, _| Err(StoreError::Corrupt("disk full".into())));
        let handle = spawn(store);
        let mut events = handle.observe().unwrap();

        handle
            .send_query("find teapots", Scope::default(), Mode::List)
            .unwrap();
        let finalized = wait_for(&mut events, |e| {
            matches!(e, PresentationEvent::BlockFinalized { .. })
        })
        .await;
        let PresentationEvent::BlockFinalized { block } = finalized else {
            unreachable!();
        };
        assert_eq!(block.items[0].item.score, Some(0.8));

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Open);
    }

    #[tokio::test]
    async fn push_flow_persists_the_query_and_the_block_as_two_units() {
        let units = Arc::new(AtomicUsize::new(0));
        let entries = Arc::new(AtomicUsize::new(0));
        let mut store = MockConversationStore::new();
        store
            .expect_create_conversation()
            .times(1)
            .returning(|record| {
                assert_eq!(record.title, "find teapots");
                Ok(true)
            });
        {
            let units = units.clone();
            let entries = entries.clone();
            store.expect_append_unit().returning(move |_, unit| {
                entries.fetch_add(unit.len(), Ordering::SeqCst);
                Ok(units.fetch_add(1, Ordering::SeqCst) as u64)
            });
        }
        let handle = spawn(store);
        let mut events = handle.observe().unwrap();

        handle
            .send_query("find teapots", Scope::default(), Mode::List)
            .unwrap();
        wait_for(&mut events, |e| {
            matches!(e, PresentationEvent::BlockFinalized { .. })
        })
        .await;

        assert_eq!(units.load(Ordering::SeqCst), 2);
        assert_eq!(entries.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn teardown_closes_the_session() {
        let mut store = MockConversationStore::new();
        store.expect_create_conversation().returning(|_| Ok(true));
        store.expect_append_unit().returning(|_, _| Ok(0));
        let handle = spawn(store);
        let mut events = handle.observe().unwrap();

        handle.teardown().await.unwrap();
        wait_for(&mut events, |e| {
            *e == PresentationEvent::StateChanged {
                state: SessionState::Closed,
            }
        })
        .await;
        assert!(matches!(
            handle.snapshot().await,
            Err(SessionError::Shutdown)
        ));
    }
}
