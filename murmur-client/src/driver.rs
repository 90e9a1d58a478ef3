use std::{sync::Arc, time::Instant};

use futures::{
    channel::{mpsc, oneshot},
    future::{self, BoxFuture, Fuse, FusedFuture},
    pin_mut, select, FutureExt, StreamExt,
};
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    api::{IdempotencyToken, PageRequest, PostId, PostService, ServiceError},
    Backoff, CommentCount, CommentTree, CommentView, Config, FeedSignal, Notice, OutboundRequest,
    Reply, Request, Snapshot, Subscription, UserAction, ViewError,
};

/// Fetch every page of a post's comments. Transient failures are retried with backoff, up to
/// `read_retries` times in a row.
pub async fn fetch_snapshot(
    service: &dyn PostService,
    post: PostId,
    config: &Config,
) -> Result<Snapshot, ServiceError> {
    let mut backoff = Backoff::new(config.reconnect_base(), config.reconnect_max());
    let mut request = PageRequest::first(config.page_size);
    let mut forest = Vec::new();
    let mut seq = None;
    loop {
        let page = match service.list_comments(post, request).await {
            Ok(page) => page,
            Err(err) if err.is_transient() && backoff.consecutive_failures() < config.read_retries => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    %post,
                    page = request.page,
                    ?err,
                    consecutive_failures = backoff.consecutive_failures(),
                    ?delay,
                    "failed fetching comments, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }
            Err(err) => return Err(err),
        };
        backoff.reset();
        // later pages may reflect more events, the first page is the safe watermark
        seq.get_or_insert(page.seq);
        let last = page.is_last() || page.items.is_empty();
        forest.extend(page.items);
        if last {
            break;
        }
        request = request.next();
    }
    tracing::debug!(%post, roots = forest.len(), "fetched comments");
    Ok(Snapshot {
        forest,
        seq: seq.unwrap_or(0),
    })
}

/// Send one request to the post service
pub async fn perform(
    service: &dyn PostService,
    req: OutboundRequest,
) -> Result<Reply, ServiceError> {
    let OutboundRequest {
        post,
        token,
        request,
    } = req;
    match request {
        Request::Create { content, parent } => service
            .create_comment(post, content, parent, token)
            .await
            .map(Reply::Created),
        Request::Update { id, content } => service
            .update_comment(id, content, token)
            .await
            .map(Reply::Updated),
        Request::Delete { id } => service
            .delete_comment(id, token)
            .await
            .map(|()| Reply::Deleted { id }),
        Request::ToggleLike { id } => service
            .toggle_like(id)
            .await
            .map(|status| Reply::Liked { id, status }),
    }
}

enum Command {
    Submit(
        UserAction,
        oneshot::Sender<Result<IdempotencyToken, ViewError>>,
    ),
    Retry(
        IdempotencyToken,
        oneshot::Sender<Result<IdempotencyToken, ViewError>>,
    ),
    Teardown,
}

/// Handle to a comment view running in its own task. Dropping it tears the view down.
pub struct ViewHandle {
    post: PostId,
    commands: mpsc::UnboundedSender<Command>,
    tree: watch::Receiver<Vec<CommentTree>>,
    count: watch::Receiver<CommentCount>,
    notices: mpsc::UnboundedReceiver<Notice>,
    task: Option<JoinHandle<()>>,
}

impl ViewHandle {
    pub fn post(&self) -> PostId {
        self.post
    }

    async fn call(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<IdempotencyToken, ViewError>>) -> Command,
    ) -> Result<IdempotencyToken, ViewError> {
        let (sender, receiver) = oneshot::channel();
        self.commands
            .unbounded_send(make(sender))
            .map_err(|_| ViewError::TornDown(self.post))?;
        receiver
            .await
            .map_err(|_| ViewError::TornDown(self.post))?
    }

    pub async fn submit(&self, action: UserAction) -> Result<IdempotencyToken, ViewError> {
        self.call(|reply| Command::Submit(action, reply)).await
    }

    pub async fn retry(&self, token: IdempotencyToken) -> Result<IdempotencyToken, ViewError> {
        self.call(|reply| Command::Retry(token, reply)).await
    }

    pub fn tree(&self) -> watch::Receiver<Vec<CommentTree>> {
        self.tree.clone()
    }

    pub fn count(&self) -> watch::Receiver<CommentCount> {
        self.count.clone()
    }

    pub async fn next_notice(&mut self) -> Option<Notice> {
        self.notices.next().await
    }

    pub fn teardown(&self) {
        // an already stopped task is torn down already
        let _ = self.commands.unbounded_send(Command::Teardown);
    }

    /// Tear down and wait for the view task to finish
    pub async fn join(mut self) {
        self.teardown();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::error!(post = %self.post, ?err, "comment view task failed");
            }
        }
    }
}

impl Drop for ViewHandle {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Run `view` in a new task, feeding it the events of `subscription` and loading its comments
/// right away
pub fn spawn_view(
    view: CommentView,
    service: Arc<dyn PostService>,
    subscription: Subscription,
) -> ViewHandle {
    let post = view.post();
    let (commands, command_receiver) = mpsc::unbounded();
    let (notice_sender, notices) = mpsc::unbounded();
    let (tree_sender, tree) = watch::channel(view.tree());
    let count = view.watch_count();
    let task = tokio::spawn(run_view(
        view,
        service,
        subscription,
        command_receiver,
        tree_sender,
        notice_sender,
    ));
    ViewHandle {
        post,
        commands,
        tree,
        count,
        notices,
        task: Some(task),
    }
}

type SnapshotFetch = Fuse<BoxFuture<'static, Result<Snapshot, ServiceError>>>;

fn start_fetch(
    service: Arc<dyn PostService>,
    post: PostId,
    config: Config,
    delay: std::time::Duration,
) -> SnapshotFetch {
    async move {
        tokio::time::sleep(delay).await;
        fetch_snapshot(&*service, post, &config).await
    }
    .boxed()
    .fuse()
}

async fn run_view(
    mut view: CommentView,
    service: Arc<dyn PostService>,
    subscription: Subscription,
    mut commands: mpsc::UnboundedReceiver<Command>,
    tree: watch::Sender<Vec<CommentTree>>,
    notices: mpsc::UnboundedSender<Notice>,
) {
    let post = view.post();
    let config = view.config().clone();
    let (reply_sender, mut replies) = mpsc::unbounded();
    let mut subscription = subscription.fuse();
    let mut fetch: SnapshotFetch = Fuse::terminated();
    let mut fetch_backoff = Backoff::new(config.reconnect_base(), config.reconnect_max());
    let mut fetch_delay = std::time::Duration::ZERO;
    view.request_resync();
    'run: loop {
        if fetch.is_terminated() && view.take_resync_request() {
            fetch = start_fetch(service.clone(), post, config.clone(), fetch_delay);
        }
        for req in view.take_ready() {
            let (service, replies) = (service.clone(), reply_sender.clone());
            tokio::spawn(async move {
                let (post, token) = (req.post, req.token);
                let res = perform(&*service, req).await;
                // the view being gone already is fine
                let _ = replies.unbounded_send((post, token, res));
            });
        }
        tree.send_if_modified(|t| {
            let current = view.tree();
            let changed = *t != current;
            *t = current;
            changed
        });
        for n in view.take_notices() {
            let _ = notices.unbounded_send(n);
        }

        let deadline = view.next_deadline();
        let hold_timer = async move {
            match deadline {
                Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
                None => future::pending().await,
            }
        }
        .fuse();
        pin_mut!(hold_timer);
        select! {
            cmd = commands.next() => match cmd {
                None | Some(Command::Teardown) => break 'run,
                Some(Command::Submit(action, reply)) => {
                    let _ = reply.send(view.submit(action));
                }
                Some(Command::Retry(token, reply)) => {
                    let _ = reply.send(view.retry(token));
                }
            },
            r = replies.next() => {
                if let Some((post, token, res)) = r {
                    view.on_reply(post, token, res);
                }
            }
            signal = subscription.next() => match signal {
                None => tracing::warn!(%post, "real-time subscription ended"),
                Some(FeedSignal::Event(e)) => {
                    view.on_event(e, Instant::now());
                }
                Some(FeedSignal::Disconnected) => view.on_disconnected(),
                Some(FeedSignal::Resubscribed) => view.on_resubscribed(),
            },
            res = fetch => match res {
                Ok(snapshot) => {
                    fetch_backoff.reset();
                    fetch_delay = std::time::Duration::ZERO;
                    view.resync(snapshot, Instant::now());
                }
                Err(err) => {
                    fetch_delay = fetch_backoff.next_delay();
                    tracing::warn!(%post, ?err, ?fetch_delay, "failed loading comments");
                    view.request_resync();
                }
            },
            _ = hold_timer => {
                view.poll(Instant::now());
            }
        }
    }
    view.teardown();
}
