use chrono::Utc;

mod comment;
pub use comment::{Author, Comment, CommentId, CommentThread, LikeStatus, PostId};

mod decode;
pub use decode::{DecodeError, RawComment, RawCommentMessage, RawEnvelope, RawLikeStatus, RawPage};

mod error;
pub use error::Error;

mod feed;
pub use feed::{topic, ClientFrame, CommentEvent, CommentEventKind, FeedMessage, IdempotencyToken};

mod page;
pub use page::{Page, PageRequest, DEFAULT_PAGE_SIZE};

mod service;
pub use service::{FeedConnector, FeedSink, FeedStream, PostService, ServiceError};

pub use uuid::{uuid, Uuid};
pub type Time = chrono::DateTime<Utc>;

pub const STUB_UUID: Uuid = uuid!("ffffffff-ffff-ffff-ffff-ffffffffffff");

// The post service stores comment text in a C-string-backed column, so null bytes never make
// it through. Reject them before sending anything.
pub fn validate_string(s: &str) -> Result<(), Error> {
    match s.contains('\0') {
        true => Err(Error::NullByteInString(String::from(s))),
        false => Ok(()),
    }
}

pub fn validate_content(s: &str) -> Result<(), Error> {
    validate_string(s)?;
    if s.trim().is_empty() {
        return Err(Error::EmptyContent);
    }
    Ok(())
}
