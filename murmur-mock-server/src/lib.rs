use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::TimeZone;
use futures::{channel::mpsc, sink, StreamExt};
use murmur_api::{
    self as api, Author, ClientFrame, Comment, CommentEvent, CommentEventKind, CommentId,
    CommentThread, Error, FeedConnector, FeedMessage, FeedSink, FeedStream, IdempotencyToken,
    LikeStatus, Page, PageRequest, PostId, PostService, RawEnvelope, ServiceError, Time,
};
use parking_lot::Mutex;

/// 2024-01-01T00:00:00Z, start of the logical clock
const EPOCH: i64 = 1_704_067_200;
const FIRST_ID: i64 = 1001;

/// What goes wrong with the next mutation request
#[derive(Clone, Debug)]
pub enum Fault {
    /// The request never reaches the server
    Drop,

    /// The server applies the mutation but the reply never makes it back
    Lost,

    Reject(Error),
}

/// In-memory post service, along with its real-time channel
#[derive(Clone)]
pub struct MockServer(Arc<Mutex<State>>);

struct Post {
    /// In creation order
    comments: Vec<Comment>,
    likes: HashMap<CommentId, HashSet<String>>,
    seq: u64,
    events: Vec<CommentEvent>,
}

struct Feed {
    topics: HashSet<PostId>,
    sender: mpsc::UnboundedSender<String>,
}

struct State {
    posts: HashMap<PostId, Post>,
    next_id: i64,
    clock: Time,
    created: HashMap<IdempotencyToken, Comment>,

    feeds: HashMap<u64, Feed>,
    next_feed: u64,
    refused_connections: usize,

    faults: VecDeque<Fault>,
    failed_reads: usize,
    duplicate_events: bool,
    holding: bool,
    held: VecDeque<(PostId, String)>,
}

impl State {
    fn tick(&mut self) -> Time {
        self.clock += chrono::Duration::seconds(1);
        self.clock
    }

    fn post_of(&self, id: CommentId) -> Result<PostId, Error> {
        self.posts
            .iter()
            .find(|(_, p)| p.comments.iter().any(|c| c.id == id))
            .map(|(post, _)| *post)
            .ok_or(Error::NotFound(id))
    }

    fn comment_mut(&mut self, id: CommentId) -> Result<(PostId, &mut Comment), Error> {
        let post = self.post_of(id)?;
        let c = self
            .posts
            .get_mut(&post)
            .and_then(|p| p.comments.iter_mut().find(|c| c.id == id))
            .ok_or(Error::NotFound(id))?;
        Ok((post, c))
    }

    fn relay(&mut self, post: PostId, token: Option<IdempotencyToken>, kind: CommentEventKind) {
        let p = match self.posts.get_mut(&post) {
            Some(p) => p,
            None => return,
        };
        p.seq += 1;
        let event = CommentEvent {
            post_id: post,
            seq: p.seq,
            idempotency_token: token,
            kind,
        };
        p.events.push(event.clone());
        let payload = match serde_json::to_string(&RawEnvelope::from_event(&event)) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(?err, "failed serializing event");
                return;
            }
        };
        match self.holding {
            true => self.held.push_back((post, payload)),
            false => self.deliver(post, payload),
        }
    }

    fn deliver(&mut self, post: PostId, payload: String) {
        let copies = if self.duplicate_events { 2 } else { 1 };
        self.feeds.retain(|_, f| {
            !f.topics.contains(&post)
                || (0..copies).all(|_| f.sender.unbounded_send(payload.clone()).is_ok())
        });
    }

    fn check_fault(&mut self) -> Result<Option<Fault>, ServiceError> {
        match self.faults.pop_front() {
            None => Ok(None),
            Some(Fault::Drop) => Err(ServiceError::Network(String::from("connection reset"))),
            Some(Fault::Reject(e)) => Err(ServiceError::Api(e)),
            Some(Fault::Lost) => Ok(Some(Fault::Lost)),
        }
    }

    fn viewed_by(&self, post: PostId, c: &Comment, viewer: Option<&str>) -> Comment {
        let likes = self.posts.get(&post).and_then(|p| p.likes.get(&c.id));
        let mut c = c.clone();
        c.liked_by_viewer = match (likes, viewer) {
            (Some(likes), Some(v)) => likes.contains(v),
            _ => false,
        };
        c
    }

    fn thread(&self, post: PostId, c: &Comment, viewer: Option<&str>) -> CommentThread {
        let replies = self
            .posts
            .get(&post)
            .map(|p| {
                p.comments
                    .iter()
                    .filter(|r| r.parent_id == Some(c.id))
                    .map(|r| self.thread(post, r, viewer))
                    .collect()
            })
            .unwrap_or_default();
        CommentThread {
            comment: self.viewed_by(post, c, viewer),
            replies,
        }
    }

    fn threads(&self, post: PostId, viewer: Option<&str>) -> Result<Vec<CommentThread>, Error> {
        let p = self.posts.get(&post).ok_or(Error::PostNotFound(post))?;
        Ok(p.comments
            .iter()
            .rev()
            .filter(|c| c.parent_id.is_none())
            .map(|c| self.thread(post, c, viewer))
            .collect())
    }
}

impl MockServer {
    pub fn new() -> MockServer {
        MockServer(Arc::new(Mutex::new(State {
            posts: HashMap::new(),
            next_id: FIRST_ID,
            clock: chrono::Utc.timestamp_opt(EPOCH, 0).unwrap(),
            created: HashMap::new(),
            feeds: HashMap::new(),
            next_feed: 0,
            refused_connections: 0,
            faults: VecDeque::new(),
            failed_reads: 0,
            duplicate_events: false,
            holding: false,
            held: VecDeque::new(),
        })))
    }

    pub fn create_post(&self, post: PostId) {
        self.0.lock().posts.entry(post).or_insert_with(|| Post {
            comments: Vec::new(),
            likes: HashMap::new(),
            seq: 0,
            events: Vec::new(),
        });
    }

    pub fn client(&self, handle: &str) -> MockClient {
        MockClient {
            server: self.clone(),
            handle: Some(String::from(handle)),
        }
    }

    pub fn anonymous_client(&self) -> MockClient {
        MockClient {
            server: self.clone(),
            handle: None,
        }
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            server: self.clone(),
        }
    }

    /// Make the next mutation request go wrong
    pub fn fail_next(&self, fault: Fault) {
        self.0.lock().faults.push_back(fault);
    }

    /// Make the next `n` listing requests fail with a network error
    pub fn fail_reads(&self, n: usize) {
        self.0.lock().failed_reads = n;
    }

    /// Deliver every event twice
    pub fn duplicate_events(&self, duplicate: bool) {
        self.0.lock().duplicate_events = duplicate;
    }

    /// Stop delivering events until `release_held`
    pub fn hold_events(&self) {
        self.0.lock().holding = true;
    }

    /// Lose the `n` oldest held events for good
    pub fn skip_held(&self, n: usize) {
        let mut s = self.0.lock();
        for _ in 0..n {
            s.held.pop_front();
        }
    }

    /// Resume delivery, flushing held events newest first if `reverse`
    pub fn release_held(&self, reverse: bool) {
        let mut s = self.0.lock();
        s.holding = false;
        let mut held = std::mem::take(&mut s.held);
        if reverse {
            held = held.into_iter().rev().collect();
        }
        for (post, payload) in held {
            s.deliver(post, payload);
        }
    }

    pub fn refuse_connections(&self, n: usize) {
        self.0.lock().refused_connections = n;
    }

    /// Drop every real-time connection
    pub fn disconnect_all(&self) {
        self.0.lock().feeds.clear();
    }

    pub fn subscribers(&self, post: PostId) -> usize {
        self.0
            .lock()
            .feeds
            .values()
            .filter(|f| f.topics.contains(&post))
            .count()
    }

    /// Wait until exactly `n` connections listen to `post`
    pub async fn wait_for_subscribers(&self, post: PostId, n: usize) {
        for _ in 0..500 {
            if self.subscribers(post) == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "post {post} has {} subscribers, expected {n}",
            self.subscribers(post)
        );
    }

    /// Every event ever relayed for `post`, delivered or not
    pub fn events(&self, post: PostId) -> Vec<CommentEvent> {
        self.0
            .lock()
            .posts
            .get(&post)
            .map(|p| p.events.clone())
            .unwrap_or_default()
    }

    pub fn seq(&self, post: PostId) -> u64 {
        self.0.lock().posts.get(&post).map_or(0, |p| p.seq)
    }

    /// The whole forest of `post`, as an anonymous viewer sees it
    pub fn threads(&self, post: PostId) -> Vec<CommentThread> {
        self.0.lock().threads(post, None).unwrap_or_default()
    }

    pub fn comment(&self, id: CommentId) -> Option<Comment> {
        let s = self.0.lock();
        s.posts
            .values()
            .flat_map(|p| p.comments.iter())
            .find(|c| c.id == id)
            .cloned()
    }

    /// Live and total number of comments of `post`
    pub fn comment_count(&self, post: PostId) -> (usize, usize) {
        let s = self.0.lock();
        match s.posts.get(&post) {
            None => (0, 0),
            Some(p) => (
                p.comments.iter().filter(|c| !c.deleted).count(),
                p.comments.len(),
            ),
        }
    }
}

impl Default for MockServer {
    fn default() -> MockServer {
        MockServer::new()
    }
}

/// A client of the mock server, signed in as `handle` unless anonymous
#[derive(Clone)]
pub struct MockClient {
    server: MockServer,
    handle: Option<String>,
}

impl MockClient {
    fn handle(&self) -> Result<&str, Error> {
        self.handle.as_deref().ok_or(Error::Unauthenticated)
    }

    pub fn author(&self) -> Author {
        match &self.handle {
            None => Author::anonymous(),
            Some(h) => Author {
                display_name: h.to_uppercase(),
                handle: h.clone(),
                avatar_url: None,
            },
        }
    }

    fn lost(fault: Option<Fault>) -> Result<(), ServiceError> {
        match fault {
            Some(Fault::Lost) => Err(ServiceError::Network(String::from("reply lost"))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl PostService for MockClient {
    async fn create_comment(
        &self,
        post: PostId,
        content: String,
        parent: Option<CommentId>,
        token: IdempotencyToken,
    ) -> Result<Comment, ServiceError> {
        let mut s = self.server.0.lock();
        let fault = s.check_fault()?;
        let handle = self.handle()?;
        if let Some(c) = s.created.get(&token) {
            return Ok(c.clone());
        }
        api::validate_content(&content)?;
        let p = s.posts.get(&post).ok_or(Error::PostNotFound(post))?;
        if let Some(parent) = parent {
            if !p.comments.iter().any(|c| c.id == parent) {
                return Err(Error::ParentNotFound(parent).into());
            }
        }
        let now = s.tick();
        let id = CommentId(s.next_id);
        s.next_id += 1;
        let c = Comment {
            id,
            post_id: post,
            parent_id: parent,
            author: self.author(),
            content,
            like_count: 0,
            liked_by_viewer: false,
            reply_count: 0,
            created_at: now,
            updated_at: now,
            revision: 1,
            deleted: false,
        };
        if let Some(p) = s.posts.get_mut(&post) {
            p.comments.push(c.clone());
            if let Some(replied) = p.comments.iter_mut().find(|c| Some(c.id) == parent) {
                replied.reply_count += 1;
            }
        }
        s.created.insert(token, c.clone());
        tracing::debug!(%post, %id, %handle, "mock server created comment");
        s.relay(post, Some(token), CommentEventKind::Created(c.clone()));
        MockClient::lost(fault)?;
        Ok(c)
    }

    async fn update_comment(
        &self,
        id: CommentId,
        content: String,
        token: IdempotencyToken,
    ) -> Result<Comment, ServiceError> {
        let mut s = self.server.0.lock();
        let fault = s.check_fault()?;
        let handle = String::from(self.handle()?);
        api::validate_content(&content)?;
        let now = s.tick();
        let (post, c) = s.comment_mut(id)?;
        if c.deleted {
            return Err(Error::NotFound(id).into());
        }
        if c.author.handle != handle {
            return Err(Error::NotOwner(id).into());
        }
        c.content = content;
        c.updated_at = now;
        c.revision += 1;
        let c = c.clone();
        let c = s.viewed_by(post, &c, Some(&handle));
        s.relay(post, Some(token), CommentEventKind::Updated(c.clone()));
        MockClient::lost(fault)?;
        Ok(c)
    }

    async fn delete_comment(
        &self,
        id: CommentId,
        token: IdempotencyToken,
    ) -> Result<(), ServiceError> {
        let mut s = self.server.0.lock();
        let fault = s.check_fault()?;
        let handle = String::from(self.handle()?);
        let now = s.tick();
        let (post, c) = s.comment_mut(id)?;
        if c.author.handle != handle {
            return Err(Error::NotOwner(id).into());
        }
        if c.deleted {
            return MockClient::lost(fault);
        }
        c.deleted = true;
        c.content = String::new();
        c.updated_at = now;
        c.revision += 1;
        s.relay(post, Some(token), CommentEventKind::Deleted(id));
        MockClient::lost(fault)
    }

    async fn list_comments(
        &self,
        post: PostId,
        page: PageRequest,
    ) -> Result<Page<CommentThread>, ServiceError> {
        let mut s = self.server.0.lock();
        if s.failed_reads > 0 {
            s.failed_reads -= 1;
            return Err(ServiceError::Network(String::from("service unavailable")));
        }
        let threads = s.threads(post, self.handle.as_deref())?;
        let size = page.size.max(1) as usize;
        let total_pages = ((threads.len() + size - 1) / size).max(1) as u32;
        let seq = s.posts.get(&post).map_or(0, |p| p.seq);
        Ok(Page {
            items: threads
                .into_iter()
                .skip(page.page as usize * size)
                .take(size)
                .collect(),
            page: page.page,
            total_pages,
            seq,
        })
    }

    async fn toggle_like(&self, id: CommentId) -> Result<LikeStatus, ServiceError> {
        let mut s = self.server.0.lock();
        s.check_fault()?;
        let handle = String::from(self.handle()?);
        let post = s.post_of(id)?;
        let now = s.tick();
        let (liked, like_count) = {
            let p = s.posts.get_mut(&post).ok_or(Error::PostNotFound(post))?;
            let likes = p.likes.entry(id).or_default();
            let liked = match likes.contains(&handle) {
                true => !likes.remove(&handle),
                false => likes.insert(handle),
            };
            (liked, likes.len() as u32)
        };
        let (_, c) = s.comment_mut(id)?;
        c.like_count = like_count;
        c.updated_at = now;
        c.revision += 1;
        let c = c.clone();
        s.relay(post, None, CommentEventKind::Updated(c));
        Ok(LikeStatus { liked, like_count })
    }
}

/// Opens real-time connections to the mock server
#[derive(Clone)]
pub struct MockConnector {
    server: MockServer,
}

fn decode_message(msg: String) -> anyhow::Result<FeedMessage> {
    if msg == "pong" {
        return Ok(FeedMessage::Pong);
    }
    let envelope = RawEnvelope::parse(msg.as_bytes())?;
    let message = envelope.message.clone();
    match envelope.decode()? {
        Some(e) => Ok(FeedMessage::Comment(e)),
        None => Ok(FeedMessage::Error(message.unwrap_or_default())),
    }
}

#[async_trait]
impl FeedConnector for MockConnector {
    async fn connect(&self) -> anyhow::Result<(FeedSink, FeedStream)> {
        let (id, receiver) = {
            let mut s = self.server.0.lock();
            if s.refused_connections > 0 {
                s.refused_connections -= 1;
                anyhow::bail!("connection refused");
            }
            let (sender, receiver) = mpsc::unbounded();
            let id = s.next_feed;
            s.next_feed += 1;
            s.feeds.insert(
                id,
                Feed {
                    topics: HashSet::new(),
                    sender,
                },
            );
            (id, receiver)
        };

        let sink = sink::unfold(self.server.clone(), move |server, frame: ClientFrame| async move {
            {
                let mut s = server.0.lock();
                let feed = s
                    .feeds
                    .get_mut(&id)
                    .ok_or_else(|| anyhow::anyhow!("connection closed"))?;
                match frame {
                    ClientFrame::Subscribe(post) => {
                        feed.topics.insert(post);
                    }
                    ClientFrame::Unsubscribe(post) => {
                        feed.topics.remove(&post);
                    }
                    ClientFrame::Ping => {
                        feed.sender
                            .unbounded_send(String::from("pong"))
                            .map_err(|_| anyhow::anyhow!("connection closed"))?;
                    }
                }
            }
            Ok::<_, anyhow::Error>(server)
        });
        let stream = receiver.map(decode_message);
        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_on<F: std::future::Future>(f: F) -> F::Output {
        futures::executor::block_on(f)
    }

    #[test]
    fn listing_orders_roots_newest_first() {
        let server = MockServer::new();
        server.create_post(PostId(1));
        let ana = server.client("ana");
        let a = block_on(ana.create_comment(PostId(1), String::from("a"), None, IdempotencyToken::new())).unwrap();
        let b = block_on(ana.create_comment(PostId(1), String::from("b"), None, IdempotencyToken::new())).unwrap();
        let r1 = block_on(ana.create_comment(PostId(1), String::from("r1"), Some(a.id), IdempotencyToken::new())).unwrap();
        let r2 = block_on(ana.create_comment(PostId(1), String::from("r2"), Some(a.id), IdempotencyToken::new())).unwrap();
        assert_eq!(a.id, CommentId(FIRST_ID));

        let page = block_on(ana.list_comments(PostId(1), PageRequest::first(1))).unwrap();
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.items[0].comment.id, b.id);
        let page = block_on(ana.list_comments(PostId(1), PageRequest::first(1).next())).unwrap();
        assert!(page.is_last());
        let replies = page.items[0].replies.iter().map(|r| r.comment.id).collect::<Vec<_>>();
        assert_eq!(replies, vec![r1.id, r2.id]);
        assert_eq!(page.seq, 4);
    }

    #[test]
    fn mutations_check_ownership_and_tokens() {
        let server = MockServer::new();
        server.create_post(PostId(1));
        let (ana, bob) = (server.client("ana"), server.client("bob"));
        let token = IdempotencyToken::new();
        let c = block_on(ana.create_comment(PostId(1), String::from("a"), None, token)).unwrap();
        let again = block_on(ana.create_comment(PostId(1), String::from("a"), None, token)).unwrap();
        assert_eq!(c, again);
        assert_eq!(server.events(PostId(1)).len(), 1);

        assert!(matches!(
            block_on(bob.update_comment(c.id, String::from("x"), IdempotencyToken::new())),
            Err(ServiceError::Api(Error::NotOwner(_)))
        ));
        assert!(matches!(
            block_on(server.anonymous_client().toggle_like(c.id)),
            Err(ServiceError::Api(Error::Unauthenticated))
        ));
        block_on(ana.delete_comment(c.id, IdempotencyToken::new())).unwrap();
        block_on(ana.delete_comment(c.id, IdempotencyToken::new())).unwrap();
        assert_eq!(server.comment_count(PostId(1)), (0, 1));
        assert_eq!(server.events(PostId(1)).len(), 2);
    }

    #[test]
    fn faults_are_consumed_in_order() {
        let server = MockServer::new();
        server.create_post(PostId(1));
        let ana = server.client("ana");
        server.fail_next(Fault::Drop);
        server.fail_next(Fault::Lost);
        let create = || ana.create_comment(PostId(1), String::from("a"), None, IdempotencyToken::new());
        assert!(matches!(block_on(create()), Err(ServiceError::Network(_))));
        assert_eq!(server.comment_count(PostId(1)), (0, 0));
        assert!(matches!(block_on(create()), Err(ServiceError::Network(_))));
        assert_eq!(server.comment_count(PostId(1)), (1, 1));
        block_on(create()).unwrap();
    }

    #[test]
    fn connection_relays_subscribed_events() {
        let server = MockServer::new();
        server.create_post(PostId(1));
        block_on(async {
            use futures::SinkExt;
            let (mut sink, mut stream) = server.connector().connect().await.unwrap();
            sink.send(ClientFrame::Subscribe(PostId(1))).await.unwrap();
            sink.send(ClientFrame::Ping).await.unwrap();
            assert!(matches!(stream.next().await, Some(Ok(FeedMessage::Pong))));
            let c = server
                .client("ana")
                .create_comment(PostId(1), String::from("a"), None, IdempotencyToken::new())
                .await
                .unwrap();
            match stream.next().await {
                Some(Ok(FeedMessage::Comment(e))) => {
                    assert_eq!(e.comment_id(), c.id);
                    assert_eq!(e.seq, 1);
                }
                m => panic!("unexpected message {m:?}"),
            }
            server.disconnect_all();
            assert!(stream.next().await.is_none());
        });
    }
}
