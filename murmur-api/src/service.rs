use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, Stream};

use crate::{
    ClientFrame, Comment, CommentId, CommentThread, DecodeError, Error, FeedMessage,
    IdempotencyToken, LikeStatus, Page, PageRequest, PostId,
};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Api(#[from] Error),

    #[error("Network failure: {0}")]
    Network(String),

    #[error("Malformed service payload")]
    Decode(#[from] DecodeError),
}

impl ServiceError {
    /// Whether trying the exact same request again could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Network(_))
    }
}

/// The post service, as far as comments are concerned
#[async_trait]
pub trait PostService: Send + Sync {
    async fn create_comment(
        &self,
        post: PostId,
        content: String,
        parent: Option<CommentId>,
        token: IdempotencyToken,
    ) -> Result<Comment, ServiceError>;

    async fn update_comment(
        &self,
        id: CommentId,
        content: String,
        token: IdempotencyToken,
    ) -> Result<Comment, ServiceError>;

    /// Soft-deletes the comment
    async fn delete_comment(&self, id: CommentId, token: IdempotencyToken)
        -> Result<(), ServiceError>;

    async fn list_comments(
        &self,
        post: PostId,
        page: PageRequest,
    ) -> Result<Page<CommentThread>, ServiceError>;

    async fn toggle_like(&self, id: CommentId) -> Result<LikeStatus, ServiceError>;
}

pub type FeedSink = Pin<Box<dyn Sink<ClientFrame, Error = anyhow::Error> + Send>>;
pub type FeedStream = Pin<Box<dyn Stream<Item = anyhow::Result<FeedMessage>> + Send>>;

/// Opens the multiplexed real-time channel
#[async_trait]
pub trait FeedConnector: Send + Sync + 'static {
    async fn connect(&self) -> anyhow::Result<(FeedSink, FeedStream)>;
}
