#![cfg(test)]

use std::{sync::Arc, time::Duration};

use murmur_mock_server::{Fault, MockServer};
use tokio::sync::watch;

use crate::{
    api::{CommentEventKind, CommentId, CommentThread, IdempotencyToken, PostId, PostService},
    spawn_view, CommentCount, CommentTree, CommentView, Config, FeedHandle, NodeId, Notice,
    Session, UserAction, ViewHandle,
};

const POST: PostId = PostId(42);

fn config() -> Config {
    Config {
        hold_timeout_ms: 60_000,
        ping_interval_ms: 50,
        disconnect_after_ms: 200,
        reconnect_base_ms: 10,
        reconnect_max_ms: 40,
        ..Config::default()
    }
}

fn setup() -> MockServer {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt::try_init();
    }
    let server = MockServer::new();
    server.create_post(POST);
    server
}

/// Open the comments of `POST` as `handle`, with its own real-time connection, and wait for
/// the first load
async fn open(server: &MockServer, handle: &str, listeners: usize) -> (FeedHandle, ViewHandle) {
    let client = server.client(handle);
    let session = Session::new(client.author(), String::from("token"));
    let feed = FeedHandle::spawn(Arc::new(server.connector()), &config());
    let subscription = feed.subscribe(POST).unwrap();
    server.wait_for_subscribers(POST, listeners).await;
    let mut view = spawn_view(
        CommentView::init(POST, session, config()),
        Arc::new(client),
        subscription,
    );
    expect_notice(&mut view, |n| *n == Notice::Resynced).await;
    (feed, view)
}

async fn wait_for<T: Clone>(receiver: &mut watch::Receiver<T>, pred: impl Fn(&T) -> bool) -> T {
    let wait = async {
        loop {
            {
                let value = receiver.borrow_and_update();
                if pred(&value) {
                    return value.clone();
                }
            }
            receiver.changed().await.expect("comment view closed");
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for the comment view")
}

/// Skip notices until one matches `pred`
async fn expect_notice(view: &mut ViewHandle, pred: impl Fn(&Notice) -> bool) -> Notice {
    let wait = async {
        loop {
            match view.next_notice().await {
                Some(n) if pred(&n) => return n,
                Some(n) => tracing::debug!(?n, "skipping notice"),
                None => panic!("comment view closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for a notice")
}

fn count(visible: u64, total: u64) -> CommentCount {
    CommentCount { visible, total }
}

fn all(trees: &[CommentTree]) -> impl Iterator<Item = &CommentTree> {
    trees.iter().flat_map(|t| t.iter())
}

fn is_confirmed(trees: &[CommentTree]) -> bool {
    all(trees).all(|t| matches!(t.comment.id, NodeId::Canonical(_)))
}

/// Pre-order (id, parent id, content) of a rendered forest
fn client_shape(trees: &[CommentTree]) -> Vec<(CommentId, Option<CommentId>, String)> {
    fn walk(
        t: &CommentTree,
        parent: Option<CommentId>,
        out: &mut Vec<(CommentId, Option<CommentId>, String)>,
    ) {
        let id = match t.comment.id.canonical() {
            Some(id) => id,
            None => return,
        };
        out.push((id, parent, t.comment.content.clone()));
        for r in &t.replies {
            walk(r, Some(id), out);
        }
    }
    let mut res = Vec::new();
    for t in trees {
        walk(t, None, &mut res);
    }
    res
}

fn server_shape(threads: &[CommentThread]) -> Vec<(CommentId, Option<CommentId>, String)> {
    fn walk(t: &CommentThread, out: &mut Vec<(CommentId, Option<CommentId>, String)>) {
        out.push((t.comment.id, t.comment.parent_id, t.comment.content.clone()));
        for r in &t.replies {
            walk(r, out);
        }
    }
    let mut res = Vec::new();
    for t in threads {
        walk(t, &mut res);
    }
    res
}

#[tokio::test]
async fn created_comment_keeps_its_identity() {
    let server = setup();
    let (_feed, view) = open(&server, "ana", 1).await;
    let mut tree = view.tree();

    view.submit(UserAction::Comment {
        content: String::from("hello"),
    })
    .await
    .unwrap();
    let shown = wait_for(&mut tree, |t| t.len() == 1).await;
    let key = shown[0].comment.key;

    let confirmed = wait_for(&mut tree, |t| is_confirmed(t) && !t.is_empty()).await;
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].comment.key, key);
    assert_eq!(confirmed[0].comment.id, NodeId::Canonical(CommentId(1001)));
    assert_eq!(confirmed[0].comment.content, "hello");

    // events come in order, so once this one shows the echo of ours went through already
    server
        .client("bob")
        .create_comment(POST, String::from("hi"), None, IdempotencyToken::new())
        .await
        .unwrap();
    let settled = wait_for(&mut tree, |t| t.len() == 2).await;
    assert_eq!(
        all(&settled).filter(|t| t.comment.content == "hello").count(),
        1
    );
    assert_eq!(settled[1].comment.key, key);
    assert_eq!(*view.count().borrow(), count(2, 2));
}

#[tokio::test]
async fn deep_reply_threads_back_with_a_mention() {
    let server = setup();
    let bob = server.client("bob");
    let cid = server.client("cid");
    let mut parent = None;
    let mut chain = Vec::new();
    for (i, client) in [&bob, &bob, &bob, &cid].into_iter().enumerate() {
        let c = client
            .create_comment(POST, format!("level {i}"), parent, IdempotencyToken::new())
            .await
            .unwrap();
        parent = Some(c.id);
        chain.push(c.id);
    }

    let (_feed, view) = open(&server, "ana", 1).await;
    let mut tree = view.tree();
    let loaded = wait_for(&mut tree, |t| all(t).count() == 4).await;
    let deepest = all(&loaded)
        .find(|t| t.comment.id == NodeId::Canonical(chain[3]))
        .unwrap();
    assert_eq!(deepest.depth, 3);

    view.submit(UserAction::Reply {
        target: deepest.comment.key,
        content: String::from("agreed"),
    })
    .await
    .unwrap();
    let replied = wait_for(&mut tree, |t| all(t).count() == 5 && is_confirmed(t)).await;
    let reply = all(&replied)
        .find(|t| t.comment.content.ends_with("agreed"))
        .unwrap();
    assert_eq!(reply.depth, 2);
    assert_eq!(reply.comment.content, "@cid agreed");
    assert_eq!(reply.comment.replying_to.as_deref(), Some("cid"));

    let stored = server.comment(reply.comment.id.canonical().unwrap()).unwrap();
    assert_eq!(stored.parent_id, Some(chain[1]));
    assert_eq!(stored.content, "@cid agreed");
}

#[tokio::test]
async fn concurrent_deletes_count_once() {
    let server = setup();
    let c = server
        .client("ana")
        .create_comment(POST, String::from("oops"), None, IdempotencyToken::new())
        .await
        .unwrap();
    let (_laptop_feed, laptop) = open(&server, "ana", 1).await;
    let (_phone_feed, phone) = open(&server, "ana", 2).await;

    let target_on = |view: &ViewHandle| {
        let tree = view.tree();
        let tree = tree.borrow();
        tree[0].comment.key
    };
    let (on_laptop, on_phone) = (target_on(&laptop), target_on(&phone));
    let (a, b) = futures::join!(
        laptop.submit(UserAction::Delete { target: on_laptop }),
        phone.submit(UserAction::Delete { target: on_phone }),
    );
    a.unwrap();
    b.unwrap();

    for view in [&laptop, &phone] {
        wait_for(&mut view.count(), |c| *c == count(0, 1)).await;
    }
    server
        .client("bob")
        .create_comment(POST, String::from("still here?"), None, IdempotencyToken::new())
        .await
        .unwrap();
    for view in [&laptop, &phone] {
        let tree = wait_for(&mut view.tree(), |t| t.len() == 2).await;
        assert!(tree[1].comment.deleted);
        assert_eq!(*view.count().borrow(), count(1, 2));
    }

    let deletes = server
        .events(POST)
        .into_iter()
        .filter(|e| e.kind == CommentEventKind::Deleted(c.id))
        .count();
    assert_eq!(deletes, 1);
    assert_eq!(server.comment_count(POST), (1, 2));
}

#[tokio::test]
async fn dropped_create_rolls_back_and_retries() {
    let server = setup();
    let (_feed, mut view) = open(&server, "ana", 1).await;
    let mut tree = view.tree();

    server.fail_next(Fault::Drop);
    let first = view
        .submit(UserAction::Comment {
            content: String::from("hello"),
        })
        .await
        .unwrap();
    let toast = expect_notice(&mut view, |n| matches!(n, Notice::Toast { .. })).await;
    let retry = match toast {
        Notice::Toast { retry, .. } => retry,
        n => panic!("unexpected notice {n:?}"),
    };
    assert_eq!(retry, Some(first));
    wait_for(&mut tree, |t| t.is_empty()).await;
    assert_eq!(*view.count().borrow(), count(0, 0));
    assert_eq!(server.comment_count(POST), (0, 0));

    let second = view.retry(first).await.unwrap();
    assert_ne!(second, first);
    assert!(view.retry(first).await.is_err());
    let confirmed = wait_for(&mut tree, |t| t.len() == 1 && is_confirmed(t)).await;
    assert_eq!(confirmed[0].comment.content, "hello");
    assert_eq!(server.comment_count(POST), (1, 1));
}

#[tokio::test]
async fn resync_after_a_gap_matches_the_server() {
    let server = setup();
    let bob = server.client("bob");
    bob.create_comment(POST, String::from("before"), None, IdempotencyToken::new())
        .await
        .unwrap();
    let (_feed, mut view) = open(&server, "ana", 1).await;

    server.hold_events();
    let root = bob
        .create_comment(POST, String::from("missed"), None, IdempotencyToken::new())
        .await
        .unwrap();
    bob.create_comment(POST, String::from("orphan"), Some(root.id), IdempotencyToken::new())
        .await
        .unwrap();
    // the root's event is lost, its reply reaches the client without a parent
    server.skip_held(1);
    server.release_held(false);
    server.disconnect_all();

    expect_notice(&mut view, |n| *n == Notice::Reconnecting).await;
    expect_notice(&mut view, |n| *n == Notice::Reconnected).await;
    expect_notice(&mut view, |n| *n == Notice::Resynced).await;

    let expected = server_shape(&server.threads(POST));
    assert_eq!(expected.len(), 3);
    let tree = wait_for(&mut view.tree(), |t| client_shape(t) == expected).await;
    assert!(is_confirmed(&tree));
    assert_eq!(tree[0].replies.len(), 1);
    assert_eq!(*view.count().borrow(), count(3, 3));
}
