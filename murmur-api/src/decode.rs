//! Raw payloads as the post service actually sends them, and the step that turns them into
//! the canonical types.
//!
//! Every field is optional on the wire. Decoding checks what is required instead of letting
//! missing fields leak into the comment tree as defaults.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::{
    Author, Comment, CommentEvent, CommentEventKind, CommentId, CommentThread, IdempotencyToken,
    LikeStatus, Page, PostId, Time,
};

const LOCAL_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Payload is missing required field {0}")]
    MissingField(&'static str),

    #[error("Field {field} holds an invalid timestamp {value:?}")]
    InvalidTime { field: &'static str, value: String },

    #[error("Field {field} is out of range: {value}")]
    OutOfRange { field: &'static str, value: i64 },

    #[error("Unknown event type {0:?}")]
    UnknownType(String),

    #[error("Comment {comment} belongs to post {actual}, expected post {expected}")]
    PostMismatch {
        comment: CommentId,
        expected: PostId,
        actual: PostId,
    },

    #[error("Payload is not valid JSON")]
    Json(#[from] serde_json::Error),
}

fn required<T>(v: Option<T>, field: &'static str) -> Result<T, DecodeError> {
    v.ok_or(DecodeError::MissingField(field))
}

fn count(v: Option<i64>, field: &'static str) -> Result<u32, DecodeError> {
    let v = v.unwrap_or(0);
    u32::try_from(v).map_err(|_| DecodeError::OutOfRange { field, value: v })
}

/// The service sends zone-less local timestamps, which are UTC. Offsets are accepted too.
pub fn parse_time(field: &'static str, value: &str) -> Result<Time, DecodeError> {
    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Ok(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, LOCAL_TIME_FORMAT)
        .map(|t| Utc.from_utc_datetime(&t))
        .map_err(|_| DecodeError::InvalidTime {
            field,
            value: String::from(value),
        })
}

pub fn format_time(t: &Time) -> String {
    t.naive_utc().format(LOCAL_TIME_FORMAT).to_string()
}

#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawComment {
    pub id: Option<i64>,
    pub post_id: Option<i64>,
    pub parent_id: Option<i64>,
    pub content: Option<String>,
    pub likes_count: Option<i64>,
    pub replies_count: Option<i64>,
    pub create_at: Option<String>,
    pub update_at: Option<String>,
    pub user_name: Option<String>,
    pub user_full_name: Option<String>,
    pub user_avatar: Option<String>,
    pub is_liked: Option<bool>,
    pub is_owner: Option<bool>,
    pub deleted: Option<bool>,
    pub revision: Option<u64>,
    #[serde(default)]
    pub replies: Vec<RawComment>,
}

impl RawComment {
    pub fn from_comment(c: &Comment) -> RawComment {
        RawComment {
            id: Some(c.id.0),
            post_id: Some(c.post_id.0),
            parent_id: c.parent_id.map(|p| p.0),
            content: Some(c.content.clone()),
            likes_count: Some(i64::from(c.like_count)),
            replies_count: Some(i64::from(c.reply_count)),
            create_at: Some(format_time(&c.created_at)),
            update_at: Some(format_time(&c.updated_at)),
            user_name: Some(c.author.handle.clone()),
            user_full_name: Some(c.author.display_name.clone()),
            user_avatar: c.author.avatar_url.clone(),
            is_liked: Some(c.liked_by_viewer),
            is_owner: None,
            deleted: Some(c.deleted),
            revision: Some(c.revision),
            replies: Vec::new(),
        }
    }

    /// Decode a single comment of `post`. Nested replies are ignored, see `into_thread`.
    pub fn into_comment(self, post: PostId) -> Result<Comment, DecodeError> {
        let id = CommentId(required(self.id, "id")?);
        if let Some(actual) = self.post_id.map(PostId) {
            if actual != post {
                return Err(DecodeError::PostMismatch {
                    comment: id,
                    expected: post,
                    actual,
                });
            }
        }
        let created_at = parse_time("createAt", &required(self.create_at, "createAt")?)?;
        let updated_at = match self.update_at {
            Some(t) => parse_time("updateAt", &t)?,
            None => created_at,
        };
        let revision = match self.revision {
            Some(r) => r,
            // Services that do not version comments still bump the update time on every change
            None => {
                let millis = updated_at.timestamp_millis();
                u64::try_from(millis).map_err(|_| DecodeError::OutOfRange {
                    field: "updateAt",
                    value: millis,
                })?
            }
        };
        Ok(Comment {
            id,
            post_id: post,
            parent_id: self.parent_id.map(CommentId),
            author: Author {
                handle: required(self.user_name, "userName")?,
                display_name: required(self.user_full_name, "userFullName")?,
                avatar_url: self.user_avatar,
            },
            content: self.content.unwrap_or_default(),
            like_count: count(self.likes_count, "likesCount")?,
            liked_by_viewer: self.is_liked.unwrap_or(false),
            reply_count: count(self.replies_count, "repliesCount")?,
            created_at,
            updated_at,
            revision,
            deleted: self.deleted.unwrap_or(false),
        })
    }

    pub fn into_thread(mut self, post: PostId) -> Result<CommentThread, DecodeError> {
        let raw_replies = std::mem::take(&mut self.replies);
        let comment = self.into_comment(post)?;
        let mut replies = Vec::with_capacity(raw_replies.len());
        for r in raw_replies {
            let mut reply = r.into_thread(post)?;
            // Listings sometimes omit parentId on nested replies, nesting already says it
            reply.comment.parent_id.get_or_insert(comment.id);
            replies.push(reply);
        }
        Ok(CommentThread { comment, replies })
    }
}

#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCommentMessage {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub post_id: Option<i64>,
    pub comment: Option<RawComment>,
    pub comment_id: Option<i64>,
    pub username: Option<String>,
    pub seq: Option<u64>,
    pub idempotency_token: Option<IdempotencyToken>,
}

/// Real-time channel envelope
#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct RawEnvelope {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub data: Option<RawCommentMessage>,
    pub message: Option<String>,
    pub success: Option<bool>,
}

impl RawEnvelope {
    pub fn from_event(e: &CommentEvent) -> RawEnvelope {
        let (kind, comment, comment_id) = match &e.kind {
            CommentEventKind::Created(c) => ("COMMENT_CREATED", Some(c), c.id),
            CommentEventKind::Updated(c) => ("COMMENT_UPDATED", Some(c), c.id),
            CommentEventKind::Deleted(id) => ("COMMENT_DELETED", None, *id),
        };
        RawEnvelope {
            kind: Some(String::from(kind)),
            data: Some(RawCommentMessage {
                kind: Some(String::from(kind)),
                post_id: Some(e.post_id.0),
                comment: comment.map(RawComment::from_comment),
                comment_id: Some(comment_id.0),
                username: comment.map(|c| c.author.handle.clone()),
                seq: Some(e.seq),
                idempotency_token: e.idempotency_token,
            }),
            message: None,
            success: Some(true),
        }
    }

    pub fn parse(body: &[u8]) -> Result<RawEnvelope, DecodeError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Returns `None` for envelopes that report a failure instead of carrying an event
    pub fn decode(self) -> Result<Option<CommentEvent>, DecodeError> {
        if self.success == Some(false) {
            return Ok(None);
        }
        let data = required(self.data, "data")?;
        let kind = required(self.kind.or(data.kind), "type")?;
        let post_id = PostId(required(data.post_id, "postId")?);
        let seq = required(data.seq, "seq")?;
        let kind = match &kind as &str {
            "COMMENT_CREATED" => CommentEventKind::Created(
                required(data.comment, "comment")?.into_comment(post_id)?,
            ),
            "COMMENT_UPDATED" => CommentEventKind::Updated(
                required(data.comment, "comment")?.into_comment(post_id)?,
            ),
            "COMMENT_DELETED" => CommentEventKind::Deleted(CommentId(required(
                data.comment_id.or_else(|| data.comment.and_then(|c| c.id)),
                "commentId",
            )?)),
            _ => return Err(DecodeError::UnknownType(kind.clone())),
        };
        Ok(Some(CommentEvent {
            post_id,
            seq,
            idempotency_token: data.idempotency_token,
            kind,
        }))
    }
}

/// One page of top-level comments, replies nested inside them
#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPage {
    #[serde(default)]
    pub content: Vec<RawComment>,
    pub number: Option<u32>,
    pub total_pages: Option<u32>,
    pub seq: Option<u64>,
}

impl RawPage {
    pub fn into_page(self, post: PostId) -> Result<Page<CommentThread>, DecodeError> {
        let items = self
            .content
            .into_iter()
            .map(|c| c.into_thread(post))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page {
            items,
            page: required(self.number, "number")?,
            total_pages: required(self.total_pages, "totalPages")?,
            seq: self.seq.unwrap_or(0),
        })
    }
}

#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLikeStatus {
    pub liked: Option<bool>,
    pub likes_count: Option<i64>,
}

impl RawLikeStatus {
    pub fn into_status(self) -> Result<LikeStatus, DecodeError> {
        Ok(LikeStatus {
            liked: required(self.liked, "liked")?,
            like_count: count(
                Some(required(self.likes_count, "likesCount")?),
                "likesCount",
            )?,
        })
    }
}
