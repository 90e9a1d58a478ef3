use std::fmt;

use crate::api::{self, Author, CommentId, LikeStatus, Time, Uuid};

/// Stable identity of a node for as long as it is displayed. Unlike `NodeId` it does not
/// change when a provisional comment gets its canonical id.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeKey(pub u64);

impl NodeKey {
    /// Placeholder for nodes not inserted yet
    pub const UNASSIGNED: NodeKey = NodeKey(u64::MAX);
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ProvisionalId(pub Uuid);

impl ProvisionalId {
    pub fn new() -> ProvisionalId {
        ProvisionalId(Uuid::new_v4())
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NodeId {
    Provisional(ProvisionalId),
    Canonical(CommentId),
}

impl NodeId {
    pub fn canonical(&self) -> Option<CommentId> {
        match self {
            NodeId::Canonical(id) => Some(*id),
            NodeId::Provisional(_) => None,
        }
    }
}

impl From<CommentId> for NodeId {
    fn from(id: CommentId) -> NodeId {
        NodeId::Canonical(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Provisional(p) => write!(f, "provisional:{}", p.0),
            NodeId::Canonical(id) => write!(f, "{}", id),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Comment {
    pub key: NodeKey,
    pub id: NodeId,
    pub parent: Option<NodeKey>,
    pub author: Author,
    pub content: String,
    pub like_count: u32,
    pub liked_by_viewer: bool,
    pub created_at: Time,

    /// Server revision this node reflects, 0 while provisional
    pub revision: u64,

    /// Tombstone, `content` then holds the placeholder
    pub deleted: bool,

    /// Handle of the author this reply was addressed to, when it got threaded back
    pub replying_to: Option<String>,
    pub reply_target: Option<NodeId>,

    /// Replies, oldest first
    pub children: Vec<NodeKey>,
}

impl Comment {
    pub fn display_author(&self) -> Author {
        match self.deleted {
            true => Author::anonymous(),
            false => self.author.clone(),
        }
    }

    pub fn like_status(&self) -> LikeStatus {
        LikeStatus {
            liked: self.liked_by_viewer,
            like_count: self.like_count,
        }
    }
}

/// Everything about a comment that does not depend on where it sits in the tree
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NewComment {
    pub id: NodeId,
    pub author: Author,
    pub content: String,
    pub like_count: u32,
    pub liked_by_viewer: bool,
    pub created_at: Time,
    pub revision: u64,
    pub deleted: bool,
    pub replying_to: Option<String>,
    pub reply_target: Option<NodeId>,
}

impl NewComment {
    pub fn from_api(c: &api::Comment) -> NewComment {
        NewComment {
            id: NodeId::Canonical(c.id),
            author: c.author.clone(),
            content: c.content.clone(),
            like_count: c.like_count,
            liked_by_viewer: c.liked_by_viewer,
            created_at: c.created_at,
            revision: c.revision,
            deleted: c.deleted,
            replying_to: None,
            reply_target: None,
        }
    }

    pub fn provisional(id: ProvisionalId, author: Author, content: String, now: Time) -> NewComment {
        NewComment {
            id: NodeId::Provisional(id),
            author,
            content,
            like_count: 0,
            liked_by_viewer: false,
            created_at: now,
            revision: 0,
            deleted: false,
            replying_to: None,
            reply_target: None,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommentPatch {
    pub content: Option<String>,
    pub like_count: Option<u32>,
    pub liked_by_viewer: Option<bool>,
    pub revision: Option<u64>,
}

impl CommentPatch {
    pub fn content(content: String) -> CommentPatch {
        CommentPatch {
            content: Some(content),
            ..CommentPatch::default()
        }
    }

    pub fn like(status: LikeStatus) -> CommentPatch {
        CommentPatch {
            like_count: Some(status.like_count),
            liked_by_viewer: Some(status.liked),
            ..CommentPatch::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == CommentPatch::default()
    }
}

/// Read-only rendering snapshot of a thread
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommentTree {
    pub comment: Comment,
    pub depth: usize,
    pub replies: Vec<CommentTree>,
}

impl CommentTree {
    pub fn iter(&self) -> Box<dyn Iterator<Item = &CommentTree> + '_> {
        Box::new(std::iter::once(self).chain(self.replies.iter().flat_map(|r| r.iter())))
    }
}
