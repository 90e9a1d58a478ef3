use std::fmt;

use crate::Time;

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct PostId(pub i64);

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-assigned comment identifier, unique within a post
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct CommentId(pub i64);

impl fmt::Display for CommentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Display data for whoever wrote a comment. Handles are not guaranteed unique.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Author {
    pub display_name: String,
    pub handle: String,
    pub avatar_url: Option<String>,
}

impl Author {
    /// What deleted comments show instead of their author
    pub fn anonymous() -> Author {
        Author {
            display_name: String::from("deleted user"),
            handle: String::from("unknown"),
            avatar_url: None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Comment {
    pub id: CommentId,
    pub post_id: PostId,
    pub parent_id: Option<CommentId>,
    pub author: Author,
    pub content: String,

    pub like_count: u32,

    /// Relative to whoever fetched this comment, so meaningless in broadcast events
    pub liked_by_viewer: bool,

    /// Number of direct replies, as maintained by the server
    pub reply_count: u32,

    pub created_at: Time,
    pub updated_at: Time,

    /// Bumped by the server on every change to this comment
    pub revision: u64,

    pub deleted: bool,
}

impl Comment {
    pub fn is_newer_than(&self, revision: u64) -> bool {
        self.revision > revision
    }
}

/// A comment along with all its replies, as returned by comment listings
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CommentThread {
    pub comment: Comment,
    pub replies: Vec<CommentThread>,
}

impl CommentThread {
    pub fn leaf(comment: Comment) -> CommentThread {
        CommentThread {
            comment,
            replies: Vec::new(),
        }
    }

    /// Number of comments in this thread, the root included
    pub fn len(&self) -> usize {
        1 + self.replies.iter().map(|r| r.len()).sum::<usize>()
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = &Comment> + '_> {
        Box::new(std::iter::once(&self.comment).chain(self.replies.iter().flat_map(|r| r.iter())))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LikeStatus {
    pub liked: bool,
    pub like_count: u32,
}
