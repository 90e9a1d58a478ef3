//! The real-time channel: a single connection carrying the comment events of every post a
//! client looks at, reconnecting on its own when it gets lost.

use std::{
    collections::{HashMap, HashSet},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{channel::mpsc, pin_mut, select, FutureExt, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{
    api::{ClientFrame, CommentEvent, FeedConnector, FeedMessage, FeedSink, PostId},
    Backoff, Config,
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FeedSignal {
    Event(CommentEvent),

    /// The connection got lost, events may be missed until `Resubscribed`
    Disconnected,

    /// The subscription is live again after having been interrupted
    Resubscribed,
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Already subscribed to post {0}")]
    AlreadySubscribed(PostId),

    #[error("Real-time connection task is gone")]
    ConnectionClosed,
}

enum Command {
    Subscribe(PostId, mpsc::UnboundedSender<FeedSignal>),
    Unsubscribe(PostId),
}

/// Handle to the shared real-time connection
#[derive(Clone)]
pub struct FeedHandle {
    commands: mpsc::UnboundedSender<Command>,
    topics: Arc<Mutex<HashSet<PostId>>>,
}

impl FeedHandle {
    /// Start the connection task. It stops once every handle and subscription is dropped.
    pub fn spawn(connector: Arc<dyn FeedConnector>, config: &Config) -> FeedHandle {
        let (commands, receiver) = mpsc::unbounded();
        tokio::spawn(run_connection(connector, receiver, config.clone()));
        FeedHandle {
            commands,
            topics: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn subscribe(&self, post: PostId) -> Result<Subscription, FeedError> {
        let mut topics = self.topics.lock();
        if !topics.insert(post) {
            return Err(FeedError::AlreadySubscribed(post));
        }
        let (sender, signals) = mpsc::unbounded();
        if self
            .commands
            .unbounded_send(Command::Subscribe(post, sender))
            .is_err()
        {
            topics.remove(&post);
            return Err(FeedError::ConnectionClosed);
        }
        Ok(Subscription {
            post,
            signals,
            handle: self.clone(),
        })
    }

    pub fn is_subscribed(&self, post: PostId) -> bool {
        self.topics.lock().contains(&post)
    }
}

/// Signals for one post. Dropping it unsubscribes.
pub struct Subscription {
    post: PostId,
    signals: mpsc::UnboundedReceiver<FeedSignal>,
    handle: FeedHandle,
}

impl Subscription {
    pub fn post(&self) -> PostId {
        self.post
    }
}

impl Stream for Subscription {
    type Item = FeedSignal;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<FeedSignal>> {
        Pin::new(&mut self.signals).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.topics.lock().remove(&self.post);
        // the connection task being gone already is fine
        let _ = self
            .handle
            .commands
            .unbounded_send(Command::Unsubscribe(self.post));
    }
}

struct Topic {
    signals: mpsc::UnboundedSender<FeedSignal>,

    /// Events may have been missed since the subscription was last live
    stale: bool,
}

fn broadcast(topics: &mut HashMap<PostId, Topic>, signal: FeedSignal) {
    topics.retain(|_, t| t.signals.unbounded_send(signal.clone()).is_ok());
}

/// Returns `false` once every handle is gone. Subscriptions made while a reconnection is
/// pending start out `stale`.
fn handle_offline(
    topics: &mut HashMap<PostId, Topic>,
    cmd: Option<Command>,
    stale: bool,
) -> bool {
    match cmd {
        None => false,
        Some(Command::Subscribe(post, signals)) => {
            topics.insert(post, Topic { signals, stale });
            true
        }
        Some(Command::Unsubscribe(post)) => {
            topics.remove(&post);
            true
        }
    }
}

async fn subscribe_all(sink: &mut FeedSink, topics: &mut HashMap<PostId, Topic>) -> anyhow::Result<()> {
    let posts = topics.keys().copied().collect::<Vec<_>>();
    for post in posts {
        sink.send(ClientFrame::Subscribe(post)).await?;
    }
    for t in topics.values_mut() {
        if t.stale {
            t.stale = false;
            // a failed send means the subscription is being dropped, the command follows
            let _ = t.signals.unbounded_send(FeedSignal::Resubscribed);
        }
    }
    Ok(())
}

async fn run_connection(
    connector: Arc<dyn FeedConnector>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    config: Config,
) {
    let mut topics: HashMap<PostId, Topic> = HashMap::new();
    let mut backoff = Backoff::new(config.reconnect_base(), config.reconnect_max());
    let mut first_attempt = true;
    let mut connected = false;
    let mut ever_connected = false;
    'reconnect: loop {
        match first_attempt {
            true => first_attempt = false,
            false => {
                if std::mem::replace(&mut connected, false) {
                    tracing::warn!("lost real-time connection");
                    for t in topics.values_mut() {
                        t.stale = true;
                    }
                    broadcast(&mut topics, FeedSignal::Disconnected);
                }
                let delay = backoff.next_delay();
                tracing::debug!(
                    consecutive_failures = backoff.consecutive_failures(),
                    ?delay,
                    "waiting before reconnecting"
                );
                let wait = tokio::time::sleep(delay).fuse();
                pin_mut!(wait);
                loop {
                    select! {
                        _ = wait => break,
                        cmd = commands.next() => if !handle_offline(&mut topics, cmd, ever_connected) {
                            return;
                        },
                    }
                }
            }
        }

        // Connect
        let (mut sink, stream) = match connector.connect().await {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(
                    ?err,
                    consecutive_failures = backoff.consecutive_failures(),
                    "failed connecting to real-time channel"
                );
                continue 'reconnect;
            }
        };
        while let Ok(Some(cmd)) = commands.try_next() {
            handle_offline(&mut topics, Some(cmd), ever_connected);
        }
        if let Err(err) = subscribe_all(&mut sink, &mut topics).await {
            tracing::warn!(?err, "failed subscribing to topics");
            continue 'reconnect;
        }
        connected = true;
        ever_connected = true;
        backoff.reset();
        tracing::info!(topics = topics.len(), "connected to real-time channel");

        // Run the event feed
        let mut next_ping = Instant::now() + config.ping_interval();
        let mut last_pong = Instant::now();
        let mut stream = stream.fuse();
        loop {
            let delay_pong_reception =
                tokio::time::sleep_until(last_pong + config.disconnect_after()).fuse();
            let delay_ping_send = tokio::time::sleep_until(next_ping).fuse();
            pin_mut!(delay_ping_send, delay_pong_reception);
            select! {
                _ = delay_pong_reception => {
                    tracing::warn!("no pong received in time");
                    continue 'reconnect;
                }
                _ = delay_ping_send => {
                    if let Err(err) = sink.send(ClientFrame::Ping).await {
                        tracing::warn!(?err, "failed sending ping");
                        continue 'reconnect;
                    }
                    next_ping += config.ping_interval();
                }
                cmd = commands.next() => {
                    let frame = match cmd {
                        None => {
                            let _ = sink.close().await;
                            tracing::info!("disconnected from real-time channel");
                            return;
                        }
                        Some(Command::Subscribe(post, signals)) => {
                            topics.insert(post, Topic { signals, stale: false });
                            ClientFrame::Subscribe(post)
                        }
                        Some(Command::Unsubscribe(post)) => {
                            topics.remove(&post);
                            ClientFrame::Unsubscribe(post)
                        }
                    };
                    if let Err(err) = sink.send(frame).await {
                        tracing::warn!(?err, "failed sending subscription change");
                        continue 'reconnect;
                    }
                }
                msg = stream.next() => match msg {
                    None => continue 'reconnect,
                    Some(Err(err)) => {
                        tracing::warn!(?err, "real-time channel failed");
                        continue 'reconnect;
                    }
                    Some(Ok(FeedMessage::Pong)) => last_pong = Instant::now(),
                    Some(Ok(FeedMessage::Error(message))) => {
                        tracing::warn!(%message, "real-time channel reported an error");
                    }
                    Some(Ok(FeedMessage::Comment(event))) => {
                        let post = event.post_id;
                        let delivered = match topics.get(&post) {
                            Some(t) => t.signals.unbounded_send(FeedSignal::Event(event)).is_ok(),
                            None => {
                                tracing::debug!(%post, "dropping event for a post nobody looks at");
                                true
                            }
                        };
                        if !delivered {
                            topics.remove(&post);
                        }
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use murmur_mock_server::MockServer;

    use super::*;
    use crate::api::{CommentEventKind, PostService};

    fn config() -> Config {
        Config {
            ping_interval_ms: 50,
            disconnect_after_ms: 200,
            reconnect_base_ms: 10,
            reconnect_max_ms: 40,
            ..Config::default()
        }
    }

    async fn next(sub: &mut Subscription) -> FeedSignal {
        tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .expect("timed out waiting for a feed signal")
            .expect("subscription closed")
    }

    #[tokio::test]
    async fn routes_events_by_post() {
        let server = MockServer::new();
        server.create_post(PostId(1));
        server.create_post(PostId(2));
        let feed = FeedHandle::spawn(Arc::new(server.connector()), &config());
        let mut one = feed.subscribe(PostId(1)).unwrap();
        let _two = feed.subscribe(PostId(2)).unwrap();
        assert!(matches!(
            feed.subscribe(PostId(1)),
            Err(FeedError::AlreadySubscribed(PostId(1)))
        ));
        server.wait_for_subscribers(PostId(1), 1).await;

        let client = server.client("ana");
        client
            .create_comment(PostId(2), String::from("elsewhere"), None, crate::api::IdempotencyToken::new())
            .await
            .unwrap();
        let c = client
            .create_comment(PostId(1), String::from("hello"), None, crate::api::IdempotencyToken::new())
            .await
            .unwrap();
        match next(&mut one).await {
            FeedSignal::Event(e) => {
                assert_eq!(e.post_id, PostId(1));
                assert_eq!(e.kind, CommentEventKind::Created(c));
            }
            s => panic!("unexpected signal {s:?}"),
        }
    }

    #[tokio::test]
    async fn reconnects_and_resubscribes() {
        let server = MockServer::new();
        server.create_post(PostId(1));
        let feed = FeedHandle::spawn(Arc::new(server.connector()), &config());
        let mut sub = feed.subscribe(PostId(1)).unwrap();
        server.wait_for_subscribers(PostId(1), 1).await;

        server.refuse_connections(2);
        server.disconnect_all();
        assert_eq!(next(&mut sub).await, FeedSignal::Disconnected);
        assert_eq!(next(&mut sub).await, FeedSignal::Resubscribed);
        server.wait_for_subscribers(PostId(1), 1).await;
    }

    #[tokio::test]
    async fn dropping_unsubscribes() {
        let server = MockServer::new();
        server.create_post(PostId(1));
        let feed = FeedHandle::spawn(Arc::new(server.connector()), &config());
        let sub = feed.subscribe(PostId(1)).unwrap();
        server.wait_for_subscribers(PostId(1), 1).await;
        drop(sub);
        assert!(!feed.is_subscribed(PostId(1)));
        server.wait_for_subscribers(PostId(1), 0).await;
        let _again = feed.subscribe(PostId(1)).unwrap();
    }
}
