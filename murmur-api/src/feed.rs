use crate::{Comment, CommentId, PostId, Uuid, STUB_UUID};

/// Client-generated marker attached to a mutation, echoed back by the real-time channel
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct IdempotencyToken(pub Uuid);

impl IdempotencyToken {
    pub fn new() -> IdempotencyToken {
        IdempotencyToken(Uuid::new_v4())
    }

    pub fn stub() -> IdempotencyToken {
        IdempotencyToken(STUB_UUID)
    }
}

/// Name of the broadcast topic carrying a post's comment events
pub fn topic(post: PostId) -> String {
    format!("post/{}/comments", post.0)
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(tag = "type", content = "comment")]
pub enum CommentEventKind {
    Created(Comment),
    Updated(Comment),
    Deleted(CommentId),
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CommentEvent {
    pub post_id: PostId,

    /// Per-post ordering hint. Never decreases for a connection, but the same value can be
    /// delivered more than once around reconnects.
    pub seq: u64,

    pub idempotency_token: Option<IdempotencyToken>,

    pub kind: CommentEventKind,
}

impl CommentEvent {
    pub fn comment_id(&self) -> CommentId {
        match &self.kind {
            CommentEventKind::Created(c) | CommentEventKind::Updated(c) => c.id,
            CommentEventKind::Deleted(id) => *id,
        }
    }

    pub fn parent_id(&self) -> Option<CommentId> {
        match &self.kind {
            CommentEventKind::Created(c) | CommentEventKind::Updated(c) => c.parent_id,
            CommentEventKind::Deleted(_) => None,
        }
    }
}

/// Messages the real-time channel sends to clients
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub enum FeedMessage {
    Pong,
    Comment(CommentEvent),
    Error(String),
}

/// Messages clients send on the real-time channel
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum ClientFrame {
    Subscribe(PostId),
    Unsubscribe(PostId),
    Ping,
}
