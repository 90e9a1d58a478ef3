use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};

use crate::{
    api::{
        self, Comment, CommentId, CommentThread, DecodeError, IdempotencyToken, LikeStatus, Page,
        PageRequest, PostId, PostService, RawComment, RawLikeStatus, RawPage, ServiceError,
    },
    Config, Session,
};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Clone, Copy, Debug)]
enum Subject {
    Post(PostId),
    Comment(CommentId),

    /// The comment being replied to
    Parent(CommentId),
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct NewCommentBody<'a> {
    content: &'a str,
    parent_id: Option<i64>,
    idempotency_token: IdempotencyToken,
}

#[derive(serde::Serialize)]
struct UpdateCommentBody<'a> {
    content: &'a str,
}

fn network<E: std::fmt::Display>(err: E) -> ServiceError {
    ServiceError::Network(err.to_string())
}

fn status_error(status: StatusCode, body: &[u8], subject: Subject) -> api::Error {
    if let Ok(err) = api::Error::parse(body) {
        return err;
    }
    match (status, subject) {
        (StatusCode::UNAUTHORIZED, _) => api::Error::Unauthenticated,
        (StatusCode::FORBIDDEN, Subject::Comment(id)) => api::Error::NotOwner(id),
        (StatusCode::NOT_FOUND, Subject::Comment(id)) => api::Error::NotFound(id),
        (StatusCode::NOT_FOUND, Subject::Post(post)) => api::Error::PostNotFound(post),
        (StatusCode::NOT_FOUND, Subject::Parent(id)) => api::Error::ParentNotFound(id),
        _ => api::Error::Unknown(format!(
            "post service answered {status}: {}",
            String::from_utf8_lossy(body)
        )),
    }
}

async fn read_body(res: reqwest::Response, subject: Subject) -> Result<Vec<u8>, ServiceError> {
    let status = res.status();
    let body = res.bytes().await.map_err(network)?.to_vec();
    if !status.is_success() {
        let err = status_error(status, &body, subject);
        tracing::debug!(?subject, %status, ?err, "post service refused request");
        return Err(err.into());
    }
    Ok(body)
}

fn decode_comment(body: &[u8]) -> Result<Comment, ServiceError> {
    let raw: RawComment = serde_json::from_slice(body).map_err(DecodeError::from)?;
    let post = PostId(raw.post_id.ok_or(DecodeError::MissingField("postId"))?);
    Ok(raw.into_comment(post)?)
}

/// The post service, over its JSON HTTP interface
pub struct HttpPostService {
    base: String,
    token: Option<String>,

    /// Retries transient failures, only used for reads
    reads: ClientWithMiddleware,
    writes: reqwest::Client,
}

impl HttpPostService {
    pub fn new(host: &str, session: &Session, config: &Config) -> HttpPostService {
        let writes = reqwest::Client::new();
        let retry_policy =
            ExponentialBackoff::builder().build_with_max_retries(config.read_retries);
        let reads = ClientBuilder::new(writes.clone())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        HttpPostService {
            base: format!("{}/api/v1", host.trim_end_matches('/')),
            token: session.token.clone(),
            reads,
            writes,
        }
    }

    fn write(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let req = self.writes.request(method, format!("{}{path}", self.base));
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }
}

#[async_trait]
impl PostService for HttpPostService {
    async fn create_comment(
        &self,
        post: PostId,
        content: String,
        parent: Option<CommentId>,
        token: IdempotencyToken,
    ) -> Result<Comment, ServiceError> {
        let res = self
            .write(reqwest::Method::POST, &format!("/comments/post/{}", post.0))
            .json(&NewCommentBody {
                content: &content,
                parent_id: parent.map(|p| p.0),
                idempotency_token: token,
            })
            .send()
            .await
            .map_err(network)?;
        let subject = match parent {
            Some(p) => Subject::Parent(p),
            None => Subject::Post(post),
        };
        decode_comment(&read_body(res, subject).await?)
    }

    async fn update_comment(
        &self,
        id: CommentId,
        content: String,
        token: IdempotencyToken,
    ) -> Result<Comment, ServiceError> {
        let res = self
            .write(reqwest::Method::PUT, &format!("/comments/{}", id.0))
            .header(IDEMPOTENCY_HEADER, token.0.to_string())
            .json(&UpdateCommentBody { content: &content })
            .send()
            .await
            .map_err(network)?;
        decode_comment(&read_body(res, Subject::Comment(id)).await?)
    }

    async fn delete_comment(
        &self,
        id: CommentId,
        token: IdempotencyToken,
    ) -> Result<(), ServiceError> {
        let res = self
            .write(reqwest::Method::DELETE, &format!("/comments/{}", id.0))
            .header(IDEMPOTENCY_HEADER, token.0.to_string())
            .send()
            .await
            .map_err(network)?;
        read_body(res, Subject::Comment(id)).await?;
        Ok(())
    }

    async fn list_comments(
        &self,
        post: PostId,
        page: PageRequest,
    ) -> Result<Page<CommentThread>, ServiceError> {
        let mut req = self
            .reads
            .get(format!("{}/comments/post/{}", self.base, post.0))
            .query(&[("page", page.page), ("size", page.size)]);
        if let Some(t) = &self.token {
            req = req.bearer_auth(t);
        }
        let res = req.send().await.map_err(network)?;
        let body = read_body(res, Subject::Post(post)).await?;
        let raw: RawPage = serde_json::from_slice(&body).map_err(DecodeError::from)?;
        Ok(raw.into_page(post)?)
    }

    async fn toggle_like(&self, id: CommentId) -> Result<LikeStatus, ServiceError> {
        let res = self
            .write(reqwest::Method::POST, &format!("/likes/comment/{}", id.0))
            .send()
            .await
            .map_err(network)?;
        let body = read_body(res, Subject::Comment(id)).await?;
        let raw: RawLikeStatus = serde_json::from_slice(&body).map_err(DecodeError::from)?;
        Ok(raw.into_status()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_errors() {
        let id = CommentId(5);
        assert_eq!(
            status_error(StatusCode::UNAUTHORIZED, b"", Subject::Comment(id)),
            api::Error::Unauthenticated
        );
        assert_eq!(
            status_error(StatusCode::FORBIDDEN, b"nope", Subject::Comment(id)),
            api::Error::NotOwner(id)
        );
        assert_eq!(
            status_error(StatusCode::NOT_FOUND, b"", Subject::Post(PostId(3))),
            api::Error::PostNotFound(PostId(3))
        );
        assert_eq!(
            status_error(StatusCode::NOT_FOUND, b"", Subject::Parent(id)),
            api::Error::ParentNotFound(id)
        );
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, b"oops", Subject::Post(PostId(3))),
            api::Error::Unknown(msg) if msg.contains("oops")
        ));
    }

    #[test]
    fn typed_error_bodies_win() {
        let body = serde_json::to_vec(&api::Error::ParentNotFound(CommentId(9)).contents()).unwrap();
        assert_eq!(
            status_error(StatusCode::NOT_FOUND, &body, Subject::Post(PostId(1))),
            api::Error::ParentNotFound(CommentId(9))
        );
    }

    #[test]
    fn requests_use_the_wire_names() {
        let body = serde_json::to_value(NewCommentBody {
            content: "hi",
            parent_id: Some(4),
            idempotency_token: IdempotencyToken::stub(),
        })
        .unwrap();
        assert_eq!(body["parentId"], 4);
        assert_eq!(body["content"], "hi");
        assert!(body["idempotencyToken"].is_string());
    }

    #[test]
    fn base_url_is_versioned() {
        let s = HttpPostService::new("http://localhost:8080/", &Session::anonymous(), &Config::default());
        assert_eq!(s.base, "http://localhost:8080/api/v1");
        assert!(s.token.is_none());
    }
}
