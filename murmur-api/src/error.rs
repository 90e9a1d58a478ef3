use anyhow::{anyhow, Context};
use serde_json::json;

use crate::{CommentId, PostId};

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Authentication required")]
    Unauthenticated,

    #[error("Not the owner of comment {0}")]
    NotOwner(CommentId),

    #[error("Comment not found {0}")]
    NotFound(CommentId),

    #[error("Post not found {0}")]
    PostNotFound(PostId),

    #[error("Parent comment not found {0}")]
    ParentNotFound(CommentId),

    #[error("Null byte in string is not allowed {0:?}")]
    NullByteInString(String),

    #[error("Comment content is empty")]
    EmptyContent,
}

impl Error {
    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Error::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Unauthenticated => StatusCode::UNAUTHORIZED,
            Error::NotOwner(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::PostNotFound(_) => StatusCode::NOT_FOUND,
            Error::ParentNotFound(_) => StatusCode::NOT_FOUND,
            Error::NullByteInString(_) => StatusCode::BAD_REQUEST,
            Error::EmptyContent => StatusCode::BAD_REQUEST,
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        serde_json::to_vec(&match self {
            Error::Unknown(msg) => json!({
                "message": msg,
                "type": "unknown",
            }),
            Error::Unauthenticated => json!({
                "message": "authentication required",
                "type": "unauthenticated",
            }),
            Error::NotOwner(id) => json!({
                "message": "not the owner of this comment",
                "type": "not-owner",
                "commentId": id.0,
            }),
            Error::NotFound(id) => json!({
                "message": "comment not found",
                "type": "not-found",
                "commentId": id.0,
            }),
            Error::PostNotFound(id) => json!({
                "message": "post not found",
                "type": "post-not-found",
                "postId": id.0,
            }),
            Error::ParentNotFound(id) => json!({
                "message": "parent comment not found",
                "type": "parent-not-found",
                "commentId": id.0,
            }),
            Error::NullByteInString(s) => json!({
                "message": "there was a null byte in argument string",
                "type": "null-byte",
                "string": s,
            }),
            Error::EmptyContent => json!({
                "message": "comment content is empty",
                "type": "empty-content",
            }),
        })
        .expect("serializing error contents")
    }

    pub fn parse(body: &[u8]) -> anyhow::Result<Error> {
        let data: serde_json::Value =
            serde_json::from_slice(body).context("parsing error contents")?;
        let id = |field: &str| {
            data.get(field)
                .and_then(|id| id.as_i64())
                .ok_or_else(|| anyhow!("error is missing its {field} field"))
        };
        Ok(
            match data
                .get("type")
                .and_then(|t| t.as_str())
                .ok_or_else(|| anyhow!("error type is not a string"))?
            {
                "unknown" => Error::Unknown(String::from(
                    data.get("message")
                        .and_then(|msg| msg.as_str())
                        .unwrap_or(""),
                )),
                "unauthenticated" => Error::Unauthenticated,
                "not-owner" => Error::NotOwner(CommentId(id("commentId")?)),
                "not-found" => Error::NotFound(CommentId(id("commentId")?)),
                "post-not-found" => Error::PostNotFound(PostId(id("postId")?)),
                "parent-not-found" => Error::ParentNotFound(CommentId(id("commentId")?)),
                "null-byte" => Error::NullByteInString(String::from(
                    data.get("string").and_then(|s| s.as_str()).ok_or_else(|| {
                        anyhow!("error is a null-byte-in-string without a string")
                    })?,
                )),
                "empty-content" => Error::EmptyContent,
                _ => return Err(anyhow!("error contents has unknown type")),
            },
        )
    }
}
