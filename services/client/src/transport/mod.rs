//! Transport Adapter
//!
//! Hides the two ways of talking to the query service behind one event
//! stream. A duplex link keeps a socket open and reconnects with backoff; a
//! push link issues one HTTP request per query and reads the answer as a
//! server-sent event stream.
//!
//! [`TransportAdapter::next_event`] is cancel-safe: every in-flight connect,
//! backoff timer and stream lives in the adapter, so dropping the future
//! inside a `select!` loses nothing.

pub mod duplex;
pub mod push;

use async_trait::async_trait;
use chatstream_core::{
    ConversationId,
    backoff::{Backoff, BackoffPolicy, BackoffStep},
};
use futures::{
    StreamExt,
    future::{BoxFuture, FutureExt},
    stream::BoxStream,
};
use std::{pin::Pin, sync::Arc};
use tokio::time::Sleep;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no channel is open")]
    Closed,
    #[error("a response stream is still in flight")]
    Busy,
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("socket error: {0}")]
    Socket(String),
    #[error("http error: {0}")]
    Http(String),
}

/// Raw inbound frames as delivered by a connected channel.
pub type FrameStream = BoxStream<'static, Result<String, TransportError>>;

/// Anything a raw frame can be written to.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: &str) -> Result<(), TransportError>;
}

/// Both halves of an open duplex channel.
pub struct DuplexChannel {
    pub sink: Box<dyn FrameSink>,
    pub stream: FrameStream,
}

/// Opens duplex channels. Implemented over WebSockets, and by test doubles.
#[async_trait]
pub trait DuplexConnector: Send + Sync {
    async fn connect(
        &self,
        hint: Option<ConversationId>,
    ) -> Result<DuplexChannel, TransportError>;
}

/// Issues one request and returns the stream of frames answering it.
#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn post(&self, frame: String) -> Result<FrameStream, TransportError>;
}

/// The transport flavor a session runs over.
#[derive(Clone)]
pub enum Connector {
    Duplex(Arc<dyn DuplexConnector>),
    Push(Arc<dyn PushConnector>),
}

impl Connector {
    pub fn kind(&self) -> &'static str {
        match self {
            Connector::Duplex(_) => "duplex",
            Connector::Push(_) => "push",
        }
    }
}

/// What the adapter reports to the session runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A channel is ready to carry requests.
    Ready,
    Frame(String),
    /// A duplex channel closed unexpectedly. A reconnect is already scheduled.
    Dropped { reason: String },
    /// A push stream completed normally.
    StreamFinished,
    /// A push request or its stream failed. No retry.
    StreamFailed { reason: String },
    /// Reconnection gave up. Reported once.
    GaveUp { attempts: u32 },
}

enum DuplexState {
    Idle,
    Connecting(BoxFuture<'static, Result<DuplexChannel, TransportError>>),
    Connected {
        sink: Box<dyn FrameSink>,
        stream: FrameStream,
    },
    /// A send failed; the loss is reported on the next poll.
    Broken(String),
    Waiting(Pin<Box<Sleep>>),
    Lost,
}

enum PushState {
    Idle,
    Ready { announce: bool },
    Posting(BoxFuture<'static, Result<FrameStream, TransportError>>),
    Streaming(FrameStream),
}

enum Link {
    Duplex {
        connector: Arc<dyn DuplexConnector>,
        state: DuplexState,
    },
    Push {
        connector: Arc<dyn PushConnector>,
        state: PushState,
    },
}

pub struct TransportAdapter {
    link: Link,
    backoff: Backoff,
    hint: Option<ConversationId>,
    /// Conversation the current link was opened or posted for.
    bound: Option<ConversationId>,
}

impl TransportAdapter {
    pub fn new(connector: Connector, policy: BackoffPolicy) -> Self {
        let link = match connector {
            Connector::Duplex(connector) => Link::Duplex {
                connector,
                state: DuplexState::Idle,
            },
            Connector::Push(connector) => Link::Push {
                connector,
                state: PushState::Idle,
            },
        };
        Self {
            link,
            backoff: Backoff::new(policy),
            hint: None,
            bound: None,
        }
    }

    /// Points the next (re)connect at `hint`. A live or pending link made for
    /// another conversation is dropped, since its frames would land in the
    /// wrong log. Returns true when that happened.
    pub fn retarget(&mut self, hint: Option<ConversationId>) -> bool {
        let stale = self.bound.is_some() && self.bound != hint && self.is_active();
        if stale {
            info!(
                from = ?self.bound,
                to = ?hint,
                "dropping link bound to another conversation"
            );
            self.close();
        }
        self.hint = hint;
        stale
    }

    /// True while a link is connected, connecting or carrying a response.
    fn is_active(&self) -> bool {
        match &self.link {
            Link::Duplex { state, .. } => matches!(
                state,
                DuplexState::Connecting(_) | DuplexState::Connected { .. } | DuplexState::Broken(_)
            ),
            Link::Push { state, .. } => {
                matches!(state, PushState::Posting(_) | PushState::Streaming(_))
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(
            self.link,
            Link::Duplex {
                state: DuplexState::Idle,
                ..
            } | Link::Push {
                state: PushState::Idle,
                ..
            }
        )
    }

    /// True once readiness has been reported and `send` may be attempted.
    pub fn is_ready(&self) -> bool {
        match &self.link {
            Link::Duplex { state, .. } => matches!(state, DuplexState::Connected { .. }),
            Link::Push { state, .. } => !matches!(
                state,
                PushState::Idle | PushState::Ready { announce: true }
            ),
        }
    }

    /// True after reconnection gave up. Nothing will ever be sent again.
    pub fn is_lost(&self) -> bool {
        matches!(
            self.link,
            Link::Duplex {
                state: DuplexState::Lost,
                ..
            }
        )
    }

    /// Starts opening a channel. Readiness is reported through [`Self::next_event`].
    pub fn open(&mut self) {
        match &mut self.link {
            Link::Duplex { connector, state } => {
                if matches!(state, DuplexState::Idle) {
                    info!(conversation_id = ?self.hint, "opening duplex channel");
                    self.bound = self.hint.clone();
                    *state = DuplexState::Connecting(connect(connector.clone(), self.hint.clone()));
                }
            }
            Link::Push { state, .. } => {
                if matches!(state, PushState::Idle) {
                    *state = PushState::Ready { announce: true };
                }
            }
        }
    }

    /// Drops every channel and in-flight operation.
    pub fn close(&mut self) {
        match &mut self.link {
            Link::Duplex { state, .. } => *state = DuplexState::Idle,
            Link::Push { state, .. } => *state = PushState::Idle,
        }
        self.bound = None;
        self.backoff.reset();
    }

    /// Waits for the next transport event. Never resolves while idle.
    pub async fn next_event(&mut self) -> TransportEvent {
        match &mut self.link {
            Link::Duplex { connector, state } => {
                next_duplex_event(connector, state, &mut self.backoff, &self.hint, &mut self.bound)
                    .await
            }
            Link::Push { state, .. } => next_push_event(state).await,
        }
    }
}

#[async_trait]
impl FrameSink for TransportAdapter {
    async fn send(&mut self, frame: &str) -> Result<(), TransportError> {
        match &mut self.link {
            Link::Duplex { state, .. } => {
                let DuplexState::Connected { sink, .. } = state else {
                    return Err(TransportError::Closed);
                };
                if let Err(e) = sink.send(frame).await {
                    warn!(error = %e, "send failed; channel considered lost");
                    *state = DuplexState::Broken(e.to_string());
                    return Err(e);
                }
                Ok(())
            }
            Link::Push { connector, state } => match state {
                PushState::Idle => Err(TransportError::Closed),
                PushState::Posting(_) | PushState::Streaming(_) => Err(TransportError::Busy),
                PushState::Ready { .. } => {
                    let connector = connector.clone();
                    let frame = frame.to_string();
                    self.bound = self.hint.clone();
                    *state = PushState::Posting(async move { connector.post(frame).await }.boxed());
                    Ok(())
                }
            },
        }
    }
}

fn connect(
    connector: Arc<dyn DuplexConnector>,
    hint: Option<ConversationId>,
) -> BoxFuture<'static, Result<DuplexChannel, TransportError>> {
    async move { connector.connect(hint).await }.boxed()
}

async fn next_duplex_event(
    connector: &Arc<dyn DuplexConnector>,
    state: &mut DuplexState,
    backoff: &mut Backoff,
    hint: &Option<ConversationId>,
    bound: &mut Option<ConversationId>,
) -> TransportEvent {
    loop {
        match state {
            DuplexState::Idle | DuplexState::Lost => return std::future::pending().await,
            DuplexState::Connecting(pending) => match pending.await {
                Ok(channel) => {
                    info!("duplex channel open");
                    backoff.reset();
                    *state = DuplexState::Connected {
                        sink: channel.sink,
                        stream: channel.stream,
                    };
                    return TransportEvent::Ready;
                }
                Err(e) => {
                    warn!(error = %e, "connect attempt failed");
                    if let Some(event) = schedule_reconnect(state, backoff) {
                        return event;
                    }
                }
            },
            DuplexState::Connected { stream, .. } => match stream.next().await {
                Some(Ok(frame)) => return TransportEvent::Frame(frame),
                other => {
                    let reason = match other {
                        Some(Err(e)) => e.to_string(),
                        _ => "peer closed the channel".to_string(),
                    };
                    warn!(%reason, "duplex channel dropped");
                    return schedule_reconnect(state, backoff)
                        .unwrap_or(TransportEvent::Dropped { reason });
                }
            },
            DuplexState::Broken(reason) => {
                let reason = std::mem::take(reason);
                return schedule_reconnect(state, backoff)
                    .unwrap_or(TransportEvent::Dropped { reason });
            }
            DuplexState::Waiting(sleep) => {
                sleep.as_mut().await;
                debug!("reconnecting");
                *bound = hint.clone();
                *state = DuplexState::Connecting(connect(connector.clone(), hint.clone()));
            }
        }
    }
}

/// Moves a failed link into its backoff wait. Returns the terminal event when
/// the failure budget is spent.
fn schedule_reconnect(state: &mut DuplexState, backoff: &mut Backoff) -> Option<TransportEvent> {
    match backoff.record_failure() {
        BackoffStep::Retry { attempt, delay } => {
            info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            *state = DuplexState::Waiting(Box::pin(tokio::time::sleep(delay)));
            None
        }
        BackoffStep::GiveUp { attempts } => {
            error!(attempts, "giving up on reconnecting");
            *state = DuplexState::Lost;
            Some(TransportEvent::GaveUp { attempts })
        }
        BackoffStep::Exhausted => {
            *state = DuplexState::Lost;
            None
        }
    }
}

async fn next_push_event(state: &mut PushState) -> TransportEvent {
    loop {
        match state {
            PushState::Idle => return std::future::pending().await,
            PushState::Ready { announce } => {
                if std::mem::take(announce) {
                    return TransportEvent::Ready;
                }
                return std::future::pending().await;
            }
            PushState::Posting(pending) => match pending.await {
                Ok(stream) => *state = PushState::Streaming(stream),
                Err(e) => {
                    warn!(error = %e, "push request failed");
                    *state = PushState::Ready { announce: false };
                    return TransportEvent::StreamFailed {
                        reason: e.to_string(),
                    };
                }
            },
            PushState::Streaming(stream) => match stream.next().await {
                Some(Ok(frame)) => return TransportEvent::Frame(frame),
                Some(Err(e)) => {
                    warn!(error = %e, "push stream failed");
                    *state = PushState::Ready { announce: false };
                    return TransportEvent::StreamFailed {
                        reason: e.to_string(),
                    };
                }
                None => {
                    debug!("push stream finished");
                    *state = PushState::Ready { announce: false };
                    return TransportEvent::StreamFinished;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicU32, Ordering},
        },
        time::Duration,
    };
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    struct VecSink(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl FrameSink for VecSink {
        async fn send(&mut self, frame: &str) -> Result<(), TransportError> {
            self.0
                .send(frame.to_string())
                .map_err(|_| TransportError::Closed)
        }
    }

    /// Fails the first `failures` connects, then hands out channels fed by the test.
    struct FlakyConnector {
        failures: u32,
        attempts: AtomicU32,
        inbound: Mutex<Vec<mpsc::UnboundedReceiver<Result<String, TransportError>>>>,
        outbound: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl DuplexConnector for FlakyConnector {
        async fn connect(
            &self,
            _hint: Option<ConversationId>,
        ) -> Result<DuplexChannel, TransportError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(TransportError::Connect("refused".into()));
            }
            let rx = self
                .inbound
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| TransportError::Connect("no more channels".into()))?;
            Ok(DuplexChannel {
                sink: Box::new(VecSink(self.outbound.clone())),
                stream: UnboundedReceiverStream::new(rx).boxed(),
            })
        }
    }

    fn fast_policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            max_attempts,
        }
    }

    #[tokio::test]
    async fn duplex_retries_then_delivers_frames() {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(FlakyConnector {
            failures: 2,
            attempts: AtomicU32::new(0),
            inbound: Mutex::new(vec![inbound_rx]),
            outbound: outbound_tx,
        });
        let mut adapter =
            TransportAdapter::new(Connector::Duplex(connector.clone()), fast_policy(5));
        assert_eq!(adapter.send("early").await, Err(TransportError::Closed));

        adapter.open();
        assert_eq!(adapter.next_event().await, TransportEvent::Ready);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);

        adapter.send("hello").await.unwrap();
        assert_eq!(outbound_rx.recv().await.as_deref(), Some("hello"));

        inbound_tx.send(Ok("frame-1".into())).unwrap();
        assert_eq!(
            adapter.next_event().await,
            TransportEvent::Frame("frame-1".into())
        );
    }

    #[tokio::test]
    async fn duplex_gives_up_once() {
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(FlakyConnector {
            failures: u32::MAX,
            attempts: AtomicU32::new(0),
            inbound: Mutex::new(Vec::new()),
            outbound: outbound_tx,
        });
        let mut adapter =
            TransportAdapter::new(Connector::Duplex(connector.clone()), fast_policy(3));
        adapter.open();
        assert_eq!(
            adapter.next_event().await,
            TransportEvent::GaveUp { attempts: 3 }
        );
        assert!(adapter.is_lost());
        let again = tokio::time::timeout(Duration::from_millis(50), adapter.next_event()).await;
        assert!(again.is_err(), "a lost link stays silent");
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn duplex_reports_drop_and_reconnects() {
        let (first_tx, first_rx) = mpsc::unbounded_channel();
        let (_second_tx, second_rx) = mpsc::unbounded_channel();
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(FlakyConnector {
            failures: 0,
            attempts: AtomicU32::new(0),
            inbound: Mutex::new(vec![second_rx, first_rx]),
            outbound: outbound_tx,
        });
        let mut adapter = TransportAdapter::new(Connector::Duplex(connector), fast_policy(5));
        adapter.open();
        assert_eq!(adapter.next_event().await, TransportEvent::Ready);

        drop(first_tx);
        assert!(matches!(
            adapter.next_event().await,
            TransportEvent::Dropped { .. }
        ));
        assert!(!adapter.is_ready());
        assert_eq!(adapter.next_event().await, TransportEvent::Ready);
    }

    #[tokio::test]
    async fn retarget_drops_a_link_opened_for_another_conversation() {
        let (_first_tx, first_rx) = mpsc::unbounded_channel();
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(FlakyConnector {
            failures: 0,
            attempts: AtomicU32::new(0),
            inbound: Mutex::new(vec![first_rx]),
            outbound: outbound_tx,
        });
        let mut adapter = TransportAdapter::new(Connector::Duplex(connector), fast_policy(5));
        let room_a = Some(ConversationId::new("a"));
        assert!(!adapter.retarget(room_a.clone()));
        adapter.open();
        assert_eq!(adapter.next_event().await, TransportEvent::Ready);

        assert!(!adapter.retarget(room_a));
        assert!(adapter.is_ready());

        assert!(adapter.retarget(Some(ConversationId::new("b"))));
        assert!(adapter.is_idle());
        assert_eq!(adapter.send("late").await, Err(TransportError::Closed));
        let silent = tokio::time::timeout(Duration::from_millis(20), adapter.next_event()).await;
        assert!(silent.is_err(), "a dropped link delivers nothing");
    }

    struct ScriptedPush {
        posts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PushConnector for ScriptedPush {
        async fn post(&self, frame: String) -> Result<FrameStream, TransportError> {
            if frame == "fail" {
                return Err(TransportError::Http("502 Bad Gateway".into()));
            }
            self.posts.lock().unwrap().push(frame);
            Ok(stream::iter(vec![Ok("a".to_string()), Ok("b".to_string())]).boxed())
        }
    }

    #[tokio::test]
    async fn push_is_busy_until_the_stream_finishes() {
        let connector = Arc::new(ScriptedPush {
            posts: Mutex::new(Vec::new()),
        });
        let mut adapter =
            TransportAdapter::new(Connector::Push(connector.clone()), BackoffPolicy::default());
        adapter.open();
        assert_eq!(adapter.next_event().await, TransportEvent::Ready);

        adapter.send("q1").await.unwrap();
        assert_eq!(adapter.send("q2").await, Err(TransportError::Busy));
        assert_eq!(adapter.next_event().await, TransportEvent::Frame("a".into()));
        assert_eq!(adapter.next_event().await, TransportEvent::Frame("b".into()));
        assert_eq!(adapter.next_event().await, TransportEvent::StreamFinished);

        adapter.send("q2").await.unwrap();
        assert_eq!(adapter.next_event().await, TransportEvent::Frame("a".into()));
        assert_eq!(*connector.posts.lock().unwrap(), vec!["q1", "q2"]);
    }

    #[tokio::test]
    async fn retarget_abandons_an_in_flight_push_stream() {
        let connector = Arc::new(ScriptedPush {
            posts: Mutex::new(Vec::new()),
        });
        let mut adapter =
            TransportAdapter::new(Connector::Push(connector), BackoffPolicy::default());
        adapter.retarget(Some(ConversationId::new("a")));
        adapter.open();
        adapter.next_event().await;
        adapter.send("q1").await.unwrap();

        assert!(adapter.retarget(Some(ConversationId::new("b"))));
        assert!(adapter.is_idle());
        assert!(!adapter.retarget(Some(ConversationId::new("c"))));
    }

    #[tokio::test]
    async fn push_failure_is_reported_without_retry() {
        let connector = Arc::new(ScriptedPush {
            posts: Mutex::new(Vec::new()),
        });
        let mut adapter = TransportAdapter::new(Connector::Push(connector), BackoffPolicy::default());
        adapter.open();
        adapter.next_event().await;
        adapter.send("fail").await.unwrap();
        assert!(matches!(
            adapter.next_event().await,
            TransportEvent::StreamFailed { reason } if reason.contains("502")
        ));
        assert!(adapter.is_ready());
    }
}
