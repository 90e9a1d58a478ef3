mod backoff;
pub use backoff::Backoff;

mod comment;
pub use comment::{Comment, CommentPatch, CommentTree, NewComment, NodeId, NodeKey, ProvisionalId};

mod config;
pub use config::Config;

mod count;
pub use count::{count_forest, count_subtree, CommentCount, CountAggregator};

mod driver;
pub use driver::{fetch_snapshot, perform, spawn_view, ViewHandle};

pub mod feed;
pub use feed::{FeedError, FeedHandle, FeedSignal, Subscription};

mod http;
pub use http::HttpPostService;

mod queue;
pub use queue::{Mutation, MutationQueue, MutationState, QueueEntry};

mod reconcile;
pub use reconcile::{Outcome, Reconciler};

mod router;
pub use router::{with_mention, Placement, ThreadRouter};

mod session;
pub use session::Session;

mod store;
pub use store::{ChangeKind, CommentStore, CountDelta, StoreChange, StoreError};

mod view;
pub use view::{
    CommentView, Notice, OutboundRequest, Reply, Request, Snapshot, UserAction, ViewError,
};

mod fuzz;
mod scenarios;

pub mod api {
    pub use murmur_api::*;
}
