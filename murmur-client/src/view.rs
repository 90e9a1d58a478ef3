use std::{collections::HashMap, time::Instant};

use chrono::Utc;
use tokio::sync::watch;

use crate::{
    api::{
        self, CommentEvent, CommentId, CommentThread, IdempotencyToken, LikeStatus, PostId,
        ServiceError,
    },
    reconcile::adopt_canonical,
    with_mention, Comment, CommentCount, CommentPatch, CommentStore, CommentTree, Config,
    CountAggregator, Mutation, MutationQueue, NewComment, NodeId, NodeKey, Outcome,
    ProvisionalId, Reconciler, Session, StoreError, ThreadRouter,
};

/// What the user asked for. Targets are node keys, which survive confirmation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UserAction {
    Comment { content: String },
    Reply { target: NodeKey, content: String },
    Edit { target: NodeKey, content: String },
    Delete { target: NodeKey },
    ToggleLike { target: NodeKey },
}

/// A request for the post service, ids resolved
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Request {
    Create {
        content: String,
        parent: Option<CommentId>,
    },
    Update {
        id: CommentId,
        content: String,
    },
    Delete {
        id: CommentId,
    },
    ToggleLike {
        id: CommentId,
    },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutboundRequest {
    pub post: PostId,
    pub token: IdempotencyToken,
    pub request: Request,
}

/// Successful answer of the post service to a `Request`
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Reply {
    Created(api::Comment),
    Updated(api::Comment),
    Deleted { id: CommentId },
    Liked { id: CommentId, status: LikeStatus },
}

/// Things worth telling the user about
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Notice {
    SignInRequired,
    Toast {
        message: String,
        /// Set when trying again could work
        retry: Option<IdempotencyToken>,
    },
    Reconnecting,
    Reconnected,
    Resynced,
}

/// Authoritative state of a post's comments
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Snapshot {
    pub forest: Vec<CommentThread>,

    /// Highest event sequence number the forest reflects
    pub seq: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ViewError {
    #[error("Signing in is required to do that")]
    Unauthenticated,

    #[error(transparent)]
    Invalid(#[from] api::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Comment view for post {0} was closed")]
    TornDown(PostId),

    #[error("Nothing to retry for this mutation")]
    NotRetryable,

    #[error("Comment is deleted")]
    AlreadyDeleted,
}

/// Everything a client shows about one post's comments, from the moment the view is opened
/// until `teardown`.
///
/// This is the synchronous core: it never waits for anything. Requests to send come out of
/// `take_ready`, and their answers go back in through `on_reply`. Real-time events go through
/// `on_event`.
pub struct CommentView {
    post: PostId,
    session: Session,
    config: Config,
    store: CommentStore,
    router: ThreadRouter,
    aggregator: CountAggregator,
    queue: MutationQueue,
    reconciler: Reconciler,

    /// Actions behind pending mutations, kept for retrying them
    actions: HashMap<IdempotencyToken, UserAction>,
    retryable: HashMap<IdempotencyToken, UserAction>,

    notices: Vec<Notice>,
    torn_down: bool,
}

impl CommentView {
    pub fn init(post: PostId, session: Session, config: Config) -> CommentView {
        let mut store = CommentStore::new(post, config.max_depth, config.deleted_placeholder.clone());
        let aggregator = CountAggregator::attach(&mut store);
        let router = ThreadRouter::new(config.max_depth);
        let reconciler = Reconciler::new(post, router, &config);
        tracing::info!(%post, handle = %session.handle, "opened comment view");
        CommentView {
            post,
            session,
            config,
            store,
            router,
            aggregator,
            queue: MutationQueue::new(),
            reconciler,
            actions: HashMap::new(),
            retryable: HashMap::new(),
            notices: Vec::new(),
            torn_down: false,
        }
    }

    pub fn post(&self) -> PostId {
        self.post
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &CommentStore {
        &self.store
    }

    pub fn tree(&self) -> Vec<CommentTree> {
        self.store.get_tree(self.post).unwrap_or_default()
    }

    pub fn count(&self) -> CommentCount {
        self.aggregator.current()
    }

    pub fn watch_count(&self) -> watch::Receiver<CommentCount> {
        self.aggregator.watch()
    }

    pub fn anomalies(&self) -> u64 {
        self.aggregator.anomalies()
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    pub fn held_len(&self) -> usize {
        self.reconciler.held_len()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn is_own(&self, key: NodeKey) -> bool {
        self.store
            .node(key)
            .map_or(false, |c| self.session.owns(&c.author))
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    fn ensure_open(&self) -> Result<(), ViewError> {
        match self.torn_down {
            true => Err(ViewError::TornDown(self.post)),
            false => Ok(()),
        }
    }

    /// Apply a user action right away and queue it for the server
    pub fn submit(&mut self, action: UserAction) -> Result<IdempotencyToken, ViewError> {
        self.ensure_open()?;
        if !self.session.is_authenticated() {
            self.notices.push(Notice::SignInRequired);
            return Err(ViewError::Unauthenticated);
        }
        let mut mutation = self.prepare(&action)?;
        mutation.apply(&mut self.store)?;
        let token = IdempotencyToken::new();
        tracing::debug!(post = %self.post, ?token, ?action, "applied local mutation");
        self.queue.push(token, mutation);
        self.actions.insert(token, action);
        self.aggregator.drain();
        Ok(token)
    }

    fn prepare(&self, action: &UserAction) -> Result<Mutation, ViewError> {
        Ok(match action {
            UserAction::Comment { content } => {
                api::validate_content(content)?;
                self.new_comment(None, content)?
            }
            UserAction::Reply { target, content } => {
                api::validate_content(content)?;
                self.new_comment(Some(*target), content)?
            }
            UserAction::Edit { target, content } => {
                api::validate_content(content)?;
                let node = self.live_node(*target)?;
                Mutation::Edit {
                    key: node.key,
                    content: content.clone(),
                    previous: node.content.clone(),
                }
            }
            UserAction::Delete { target } => {
                let node = self.live_node(*target)?;
                Mutation::Delete {
                    key: node.key,
                    previous: node.content.clone(),
                }
            }
            UserAction::ToggleLike { target } => {
                let node = self.live_node(*target)?;
                Mutation::ToggleLike {
                    key: node.key,
                    previous: node.like_status(),
                }
            }
        })
    }

    fn live_node(&self, key: NodeKey) -> Result<&Comment, ViewError> {
        let node = self.store.node(key).ok_or(StoreError::UnknownNode(key))?;
        match node.deleted {
            true => Err(ViewError::AlreadyDeleted),
            false => Ok(node),
        }
    }

    fn new_comment(&self, target: Option<NodeKey>, content: &str) -> Result<Mutation, ViewError> {
        let placement = self.router.route(&self.store, target)?;
        let mut comment = NewComment::provisional(
            ProvisionalId::new(),
            self.session.author(),
            String::from(content),
            Utc::now(),
        );
        if let Some(handle) = placement.mention {
            comment.content = with_mention(&handle, content);
            comment.replying_to = Some(handle);
            comment.reply_target = target.map(|t| self.store.id_of(t)).transpose()?;
        }
        Ok(Mutation::Create {
            key: NodeKey::UNASSIGNED,
            parent: placement.parent,
            comment,
        })
    }

    /// Requests that can be sent now. Each is handed out once.
    pub fn take_ready(&mut self) -> Vec<OutboundRequest> {
        if self.torn_down {
            return Vec::new();
        }
        let mut res = Vec::new();
        for (token, mutation) in self.queue.ready() {
            match self.request_for(&mutation) {
                Ok(request) => res.push(OutboundRequest {
                    post: self.post,
                    token,
                    request,
                }),
                Err(err) => {
                    tracing::warn!(
                        post = %self.post,
                        ?token,
                        ?err,
                        "reconciliation anomaly: mutation target vanished before sending"
                    );
                    self.actions.remove(&token);
                    self.roll_back(token);
                }
            }
        }
        self.aggregator.drain();
        res
    }

    fn canonical(&self, key: NodeKey) -> Result<CommentId, StoreError> {
        let id = self.store.id_of(key)?;
        id.canonical().ok_or(StoreError::NotFound(id))
    }

    fn request_for(&self, mutation: &Mutation) -> Result<Request, StoreError> {
        Ok(match mutation {
            Mutation::Create {
                parent, comment, ..
            } => Request::Create {
                content: comment.content.clone(),
                parent: parent.map(|p| self.canonical(p)).transpose()?,
            },
            Mutation::Edit { key, content, .. } => Request::Update {
                id: self.canonical(*key)?,
                content: content.clone(),
            },
            Mutation::Delete { key, .. } => Request::Delete {
                id: self.canonical(*key)?,
            },
            Mutation::ToggleLike { key, .. } => Request::ToggleLike {
                id: self.canonical(*key)?,
            },
        })
    }

    /// Answer to a request previously handed out by `take_ready`
    pub fn on_reply(
        &mut self,
        post: PostId,
        token: IdempotencyToken,
        result: Result<Reply, ServiceError>,
    ) {
        if self.torn_down || post != self.post {
            tracing::debug!(post = %self.post, reply_post = %post, ?token, "discarding reply for a closed view");
            return;
        }
        match result {
            Ok(reply) => self.confirm(token, reply),
            Err(err) => self.fail(token, err),
        }
        self.aggregator.drain();
    }

    fn confirm(&mut self, token: IdempotencyToken, reply: Reply) {
        self.actions.remove(&token);
        let mutation = self.queue.confirm(token);
        let res = match (mutation, reply) {
            (Some(m @ Mutation::Create { .. }), Reply::Created(c)) => match m.provisional() {
                Some(p) => adopt_canonical(&mut self.store, &mut self.queue, m.target(), p, &c)
                    .map(|_| {
                        self.reconciler.retry_held(
                            Instant::now(),
                            &mut self.store,
                            &mut self.queue,
                        )
                    }),
                None => Ok(()),
            },
            (_, Reply::Created(c)) | (_, Reply::Updated(c)) => self.catch_up(&c),
            (_, Reply::Liked { id, status }) => match self.store.key_of(&NodeId::Canonical(id)) {
                Some(key) if !self.queue.has_pending_like(key) => self
                    .store
                    .update(NodeId::Canonical(id), CommentPatch::like(status)),
                _ => Ok(()),
            },
            (_, Reply::Deleted { .. }) => Ok(()),
        };
        match res {
            Ok(()) => tracing::debug!(post = %self.post, ?token, "mutation confirmed"),
            Err(err) => tracing::warn!(
                post = %self.post,
                ?token,
                ?err,
                "reconciliation anomaly: could not apply confirmation"
            ),
        }
    }

    /// Bring a node up to the revision the server answered with
    fn catch_up(&mut self, c: &api::Comment) -> Result<(), StoreError> {
        let id = NodeId::Canonical(c.id);
        let node = match self.store.get(&id) {
            Some(node) if c.is_newer_than(node.revision) => node,
            _ => return Ok(()),
        };
        let key = node.key;
        let mut patch = CommentPatch {
            revision: Some(c.revision),
            ..CommentPatch::default()
        };
        if !self.queue.has_pending_edit(key) {
            patch.content = Some(c.content.clone());
        }
        if !self.queue.has_pending_like(key) {
            patch.like_count = Some(c.like_count);
        }
        self.store.update(id, patch)
    }

    fn fail(&mut self, token: IdempotencyToken, err: ServiceError) {
        let action = self.actions.remove(&token);
        if self.roll_back(token) == 0 {
            tracing::debug!(post = %self.post, ?token, ?err, "failure of a mutation that is not pending anymore");
            return;
        }
        tracing::info!(post = %self.post, ?token, %err, "mutation failed");
        match err {
            ServiceError::Api(api::Error::Unauthenticated) => {
                self.notices.push(Notice::SignInRequired)
            }
            ServiceError::Network(_) => {
                if let Some(action) = action {
                    self.retryable.insert(token, action);
                }
                self.notices.push(Notice::Toast {
                    message: err.to_string(),
                    retry: Some(token),
                });
            }
            err => self.notices.push(Notice::Toast {
                message: err.to_string(),
                retry: None,
            }),
        }
    }

    /// Revert a mutation and everything that depended on it, returning how many got reverted
    fn roll_back(&mut self, token: IdempotencyToken) -> usize {
        let entries = self.queue.roll_back(token);
        for (t, m) in entries.iter().rev() {
            if let Err(err) = m.revert(&mut self.store) {
                tracing::warn!(post = %self.post, token = ?t, ?err, "reconciliation anomaly: could not revert mutation");
            }
            if *t != token {
                self.actions.remove(t);
            }
        }
        if !entries.is_empty() {
            tracing::debug!(post = %self.post, ?token, reverted = entries.len(), "rolled back mutation");
        }
        entries.len()
    }

    /// Submit again an action whose request got lost on the network
    pub fn retry(&mut self, token: IdempotencyToken) -> Result<IdempotencyToken, ViewError> {
        self.ensure_open()?;
        let action = self
            .retryable
            .remove(&token)
            .ok_or(ViewError::NotRetryable)?;
        self.submit(action)
    }

    pub fn on_event(&mut self, event: CommentEvent, now: Instant) -> Outcome {
        if self.torn_down {
            return Outcome::Ignored;
        }
        let outcome = self
            .reconciler
            .apply(event, now, &mut self.store, &mut self.queue);
        self.aggregator.drain();
        outcome
    }

    pub fn on_disconnected(&mut self) {
        self.notices.push(Notice::Reconnecting);
    }

    /// The subscription is live again, but events may have been missed meanwhile
    pub fn on_resubscribed(&mut self) {
        self.notices.push(Notice::Reconnected);
        self.reconciler.request_resync();
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.reconciler.next_deadline()
    }

    pub fn poll(&mut self, now: Instant) -> bool {
        self.reconciler.poll(now)
    }

    pub fn request_resync(&mut self) {
        self.reconciler.request_resync();
    }

    pub fn take_resync_request(&mut self) -> bool {
        !self.torn_down && self.reconciler.take_resync_request()
    }

    /// Rebuild the tree from an authoritative snapshot, then put back on top of it the local
    /// mutations still pending and the held events the snapshot does not cover.
    pub fn resync(&mut self, snapshot: Snapshot, now: Instant) {
        if self.torn_down {
            return;
        }
        self.store.clear();
        // top-level comments get inserted at the head
        for thread in snapshot.forest.iter().rev() {
            self.load_thread(None, thread);
        }

        let mut failed = Vec::new();
        for entry in self.queue.pending_mut() {
            if let Err(err) = entry.mutation.apply(&mut self.store) {
                tracing::warn!(
                    post = %self.post,
                    token = ?entry.token,
                    ?err,
                    "reconciliation anomaly: pending mutation does not fit the snapshot anymore"
                );
                failed.push(entry.token);
            }
        }
        for token in failed {
            self.actions.remove(&token);
            self.roll_back(token);
        }
        self.store.finish_reload();

        for event in self.reconciler.take_after(snapshot.seq) {
            self.reconciler
                .apply(event, now, &mut self.store, &mut self.queue);
        }
        self.aggregator.verify(&self.store);
        tracing::info!(
            post = %self.post,
            seq = snapshot.seq,
            comments = self.store.len(),
            "resynchronized comments"
        );
        self.notices.push(Notice::Resynced);
    }

    fn load_thread(&mut self, parent: Option<NodeId>, thread: &CommentThread) {
        let c = &thread.comment;
        let placement = match self.router.place_remote(&self.store, parent) {
            Some(Ok(p)) => p,
            _ => {
                tracing::warn!(post = %self.post, id = %c.id, "reconciliation anomaly: snapshot comment has no parent");
                return;
            }
        };
        let mut new = NewComment::from_api(c);
        if placement.mention.is_some() {
            new.replying_to = placement.mention;
            new.reply_target = parent;
        }
        let res = placement
            .parent
            .map(|k| self.store.id_of(k))
            .transpose()
            .and_then(|p| self.store.merge_insert(p, new));
        if let Err(err) = res {
            tracing::warn!(post = %self.post, id = %c.id, ?err, "reconciliation anomaly: could not load snapshot comment");
            return;
        }
        for reply in &thread.replies {
            self.load_thread(Some(NodeId::Canonical(c.id)), reply);
        }
    }

    /// Close the view. Later replies and events are discarded.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.retryable.clear();
        self.notices.clear();
        tracing::info!(post = %self.post, pending = self.queue.len(), "closed comment view");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Author, CommentEventKind};

    const POST: PostId = PostId(42);

    fn session(handle: &str) -> Session {
        Session::new(
            Author {
                display_name: handle.to_uppercase(),
                handle: String::from(handle),
                avatar_url: None,
            },
            String::from("token"),
        )
    }

    fn view() -> CommentView {
        CommentView::init(POST, session("ana"), Config::default())
    }

    fn server_comment(
        id: i64,
        parent: Option<CommentId>,
        handle: &str,
        content: &str,
    ) -> api::Comment {
        api::Comment {
            id: CommentId(id),
            post_id: POST,
            parent_id: parent,
            author: Author {
                display_name: handle.to_uppercase(),
                handle: String::from(handle),
                avatar_url: None,
            },
            content: String::from(content),
            like_count: 0,
            liked_by_viewer: false,
            reply_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            revision: 1,
            deleted: false,
        }
    }

    /// Pretend to be a server accepting every ready request, assigning ids from `next_id`
    fn accept_all(v: &mut CommentView, next_id: &mut i64) -> Vec<OutboundRequest> {
        let reqs = v.take_ready();
        for r in &reqs {
            let reply = match &r.request {
                Request::Create { content, parent } => {
                    *next_id += 1;
                    Reply::Created(server_comment(*next_id, *parent, "ana", content))
                }
                Request::Update { id, content } => {
                    let mut c = server_comment(id.0, None, "ana", content);
                    c.revision = 2;
                    Reply::Updated(c)
                }
                Request::Delete { id } => Reply::Deleted { id: *id },
                Request::ToggleLike { id } => Reply::Liked {
                    id: *id,
                    status: LikeStatus {
                        liked: true,
                        like_count: 1,
                    },
                },
            };
            v.on_reply(POST, r.token, Ok(reply));
        }
        reqs
    }

    #[test]
    fn anonymous_users_cannot_comment() {
        let mut v = CommentView::init(POST, Session::anonymous(), Config::default());
        assert!(matches!(
            v.submit(UserAction::Comment {
                content: String::from("hi")
            }),
            Err(ViewError::Unauthenticated)
        ));
        assert_eq!(v.take_notices(), vec![Notice::SignInRequired]);
        assert!(v.tree().is_empty());
        assert!(v.take_ready().is_empty());
    }

    #[test]
    fn empty_comments_are_rejected() {
        let mut v = view();
        assert!(matches!(
            v.submit(UserAction::Comment {
                content: String::from("  ")
            }),
            Err(ViewError::Invalid(api::Error::EmptyContent))
        ));
    }

    #[test]
    fn create_then_confirm_keeps_identity() {
        let mut v = view();
        v.submit(UserAction::Comment {
            content: String::from("hello"),
        })
        .unwrap();
        let tree = v.tree();
        assert_eq!(tree.len(), 1);
        let key = tree[0].comment.key;
        assert!(matches!(tree[0].comment.id, NodeId::Provisional(_)));
        assert_eq!(v.count(), CommentCount { visible: 1, total: 1 });

        let mut next_id = 1000;
        accept_all(&mut v, &mut next_id);
        let tree = v.tree();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].comment.key, key);
        assert_eq!(tree[0].comment.id, NodeId::Canonical(CommentId(1001)));
        assert_eq!(v.count(), CommentCount { visible: 1, total: 1 });
        assert_eq!(v.pending_len(), 0);
        assert!(v.is_own(key));
    }

    #[test]
    fn echo_before_reply_yields_a_single_node() {
        let mut v = view();
        let token = v
            .submit(UserAction::Comment {
                content: String::from("hello"),
            })
            .unwrap();
        let reqs = v.take_ready();
        assert_eq!(reqs.len(), 1);
        let c = server_comment(1001, None, "ana", "hello");
        let echo = CommentEvent {
            post_id: POST,
            seq: 1,
            idempotency_token: Some(token),
            kind: CommentEventKind::Created(c.clone()),
        };
        assert_eq!(v.on_event(echo.clone(), Instant::now()), Outcome::Confirmed(token));
        v.on_reply(POST, token, Ok(Reply::Created(c)));
        assert_eq!(v.on_event(echo, Instant::now()), Outcome::Duplicate);
        assert_eq!(v.tree().len(), 1);
        assert_eq!(v.count(), CommentCount { visible: 1, total: 1 });
        assert_eq!(v.anomalies(), 0);
    }

    #[test]
    fn edit_waits_for_its_create() {
        let mut v = view();
        v.submit(UserAction::Comment {
            content: String::from("hello"),
        })
        .unwrap();
        let key = v.tree()[0].comment.key;
        v.submit(UserAction::Edit {
            target: key,
            content: String::from("hello again"),
        })
        .unwrap();
        assert_eq!(v.tree()[0].comment.content, "hello again");
        let first = v.take_ready();
        assert_eq!(first.len(), 1);
        assert!(matches!(first[0].request, Request::Create { .. }));
        // the create reply shows the server content, the pending edit must win
        v.on_reply(
            POST,
            first[0].token,
            Ok(Reply::Created(server_comment(1001, None, "ana", "hello"))),
        );
        assert_eq!(v.tree()[0].comment.content, "hello again");
        let second = v.take_ready();
        assert_eq!(
            second[0].request,
            Request::Update {
                id: CommentId(1001),
                content: String::from("hello again")
            }
        );
    }

    #[test]
    fn deep_replies_thread_back_with_a_mention() {
        let mut v = view();
        let mut next_id = 1000;
        let others = ["bob", "cid", "dan"];
        v.submit(UserAction::Comment {
            content: String::from("root"),
        })
        .unwrap();
        accept_all(&mut v, &mut next_id);
        for (i, handle) in others.iter().enumerate() {
            let parent = v.store().get(&NodeId::Canonical(CommentId(1001 + i as i64))).unwrap().key;
            // replies from other users, coming through the real-time channel
            let c = server_comment(
                1002 + i as i64,
                Some(CommentId(1001 + i as i64)),
                handle,
                "deeper",
            );
            assert!(v.store().node(parent).is_some());
            assert_eq!(
                v.on_event(
                    CommentEvent {
                        post_id: POST,
                        seq: i as u64 + 2,
                        idempotency_token: None,
                        kind: CommentEventKind::Created(c),
                    },
                    Instant::now()
                ),
                Outcome::Applied
            );
        }
        next_id = 1004;
        let target = v.store().get(&NodeId::Canonical(CommentId(1004))).unwrap().key;
        assert_eq!(v.store().depth(target), 3);
        v.submit(UserAction::Reply {
            target,
            content: String::from("me too"),
        })
        .unwrap();
        let reqs = accept_all(&mut v, &mut next_id);
        assert_eq!(
            reqs[0].request,
            Request::Create {
                content: String::from("@dan me too"),
                parent: Some(CommentId(1002)),
            }
        );
        let reply = v.store().get(&NodeId::Canonical(CommentId(1005))).unwrap();
        assert_eq!(v.store().depth(reply.key), 2);
        assert_eq!(reply.replying_to.as_deref(), Some("dan"));
        assert_eq!(reply.reply_target, Some(NodeId::Canonical(CommentId(1004))));
        assert!(v.tree().iter().flat_map(|t| t.iter()).all(|t| t.depth <= 3));
    }

    fn remote(v: &mut CommentView, seq: u64, kind: CommentEventKind) -> Outcome {
        v.on_event(
            CommentEvent {
                post_id: POST,
                seq,
                idempotency_token: None,
                kind,
            },
            Instant::now(),
        )
    }

    #[test]
    fn replies_to_deleted_leaves_are_refused_even_when_deep() {
        let mut v = view();
        for i in 1..=4 {
            let parent = (i > 1).then(|| CommentId(i - 1));
            let c = server_comment(i, parent, "bob", "deeper");
            remote(&mut v, i as u64, CommentEventKind::Created(c));
        }
        remote(&mut v, 5, CommentEventKind::Deleted(CommentId(4)));
        let target = v.store().get(&NodeId::Canonical(CommentId(4))).unwrap().key;
        assert_eq!(v.store().depth(target), 3);
        assert!(matches!(
            v.submit(UserAction::Reply {
                target,
                content: String::from("hi"),
            }),
            Err(ViewError::Store(StoreError::InvalidParent(_)))
        ));
        assert!(v.take_ready().is_empty());
        assert_eq!(v.count(), CommentCount { visible: 3, total: 4 });
    }

    #[test]
    fn too_shallow_depth_limit_refuses_deep_replies() {
        let config = Config {
            max_depth: 1,
            ..Config::default()
        };
        let mut v = CommentView::init(POST, session("ana"), config);
        remote(&mut v, 1, CommentEventKind::Created(server_comment(1, None, "bob", "root")));
        remote(
            &mut v,
            2,
            CommentEventKind::Created(server_comment(2, Some(CommentId(1)), "bob", "reply")),
        );
        let target = v.store().get(&NodeId::Canonical(CommentId(2))).unwrap().key;
        assert!(matches!(
            v.submit(UserAction::Reply {
                target,
                content: String::from("hi"),
            }),
            Err(ViewError::Store(StoreError::DepthExceeded { max: 1, .. }))
        ));
        assert_eq!(v.count(), CommentCount { visible: 2, total: 2 });
    }

    #[test]
    fn network_failure_rolls_back_with_retry() {
        let mut v = view();
        let token = v
            .submit(UserAction::Comment {
                content: String::from("hello"),
            })
            .unwrap();
        let first_id = v.tree()[0].comment.id;
        v.take_ready();
        v.on_reply(
            POST,
            token,
            Err(ServiceError::Network(String::from("connection reset"))),
        );
        assert!(v.tree().is_empty());
        assert_eq!(v.count(), CommentCount::default());
        let notices = v.take_notices();
        assert!(matches!(
            &notices[..],
            [Notice::Toast { retry: Some(t), .. }] if *t == token
        ));

        let retried = v.retry(token).unwrap();
        assert_ne!(retried, token);
        assert_ne!(v.tree()[0].comment.id, first_id);
        assert!(matches!(v.retry(token), Err(ViewError::NotRetryable)));
    }

    #[test]
    fn rejected_edit_only_reverts_its_node() {
        let mut v = view();
        let mut next_id = 1000;
        for content in ["one", "two"] {
            v.submit(UserAction::Comment {
                content: String::from(content),
            })
            .unwrap();
        }
        accept_all(&mut v, &mut next_id);
        let [two, one] = [v.tree()[0].comment.key, v.tree()[1].comment.key];
        let token = v
            .submit(UserAction::Edit {
                target: one,
                content: String::from("one edited"),
            })
            .unwrap();
        v.submit(UserAction::Edit {
            target: two,
            content: String::from("two edited"),
        })
        .unwrap();
        let before = v.store().node(two).cloned();
        v.take_ready();
        v.on_reply(
            POST,
            token,
            Err(ServiceError::Api(api::Error::NotOwner(CommentId(1001)))),
        );
        assert_eq!(v.store().node(one).unwrap().content, "one");
        assert_eq!(v.store().node(two).cloned(), before);
        assert!(matches!(
            &v.take_notices()[..],
            [Notice::Toast { retry: None, .. }]
        ));
    }

    #[test]
    fn replies_after_teardown_are_discarded() {
        let mut v = view();
        let token = v
            .submit(UserAction::Comment {
                content: String::from("hello"),
            })
            .unwrap();
        v.take_ready();
        v.teardown();
        v.on_reply(
            POST,
            token,
            Ok(Reply::Created(server_comment(1001, None, "ana", "hello"))),
        );
        assert!(matches!(v.tree()[0].comment.id, NodeId::Provisional(_)));
        assert!(matches!(
            v.submit(UserAction::Comment {
                content: String::from("again")
            }),
            Err(ViewError::TornDown(POST))
        ));
    }

    #[test]
    fn resync_keeps_pending_and_drops_covered_events() {
        let mut v = view();
        v.submit(UserAction::Comment {
            content: String::from("mine"),
        })
        .unwrap();
        let mine = v.tree()[0].comment.key;
        let held = |seq, id, parent| CommentEvent {
            post_id: POST,
            seq,
            idempotency_token: None,
            kind: CommentEventKind::Created(server_comment(id, Some(CommentId(parent)), "bob", "late")),
        };
        assert_eq!(v.on_event(held(3, 12, 10), Instant::now()), Outcome::Held);
        assert_eq!(v.on_event(held(6, 13, 11), Instant::now()), Outcome::Held);

        let root = server_comment(10, None, "bob", "root");
        let snapshot = Snapshot {
            forest: vec![
                CommentThread {
                    comment: server_comment(11, None, "bob", "newer"),
                    replies: Vec::new(),
                },
                CommentThread {
                    comment: root.clone(),
                    replies: vec![CommentThread::leaf(server_comment(
                        12,
                        Some(root.id),
                        "bob",
                        "late",
                    ))],
                },
            ],
            seq: 5,
        };
        v.resync(snapshot, Instant::now());
        let tree = v.tree();
        let roots = tree.iter().map(|t| t.comment.id).collect::<Vec<_>>();
        assert_eq!(
            roots,
            vec![
                tree[0].comment.id,
                NodeId::Canonical(CommentId(11)),
                NodeId::Canonical(CommentId(10)),
            ]
        );
        assert_eq!(tree[0].comment.key, mine);
        assert_eq!(v.store().node(mine).unwrap().content, "mine");
        assert_eq!(tree[1].replies.len(), 1);
        assert_eq!(tree[2].replies.len(), 1);
        assert_eq!(v.held_len(), 0);
        assert_eq!(v.count(), CommentCount { visible: 5, total: 5 });
        assert_eq!(v.pending_len(), 1);
        assert_eq!(v.take_notices(), vec![Notice::Resynced]);
    }
}
