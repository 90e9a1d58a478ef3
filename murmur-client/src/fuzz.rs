#![cfg(test)]

use std::{
    collections::{BTreeMap, HashSet},
    time::Instant,
};

use futures::executor::block_on;
use murmur_mock_server::{Fault, MockClient, MockServer};

use crate::{
    api::{Author, CommentId, IdempotencyToken, PostId, PostService},
    count_forest, perform, Comment, CommentView, Config, NodeId, NodeKey, Session, UserAction,
};

const POST: PostId = PostId(1);

#[derive(Clone, Debug, bolero::generator::TypeGenerator)]
enum FaultKind {
    Drop,
    Lost,
    Reject,
}

#[derive(Clone, Debug, bolero::generator::TypeGenerator)]
enum Op {
    Comment,
    Reply(u8),
    Edit(u8),
    Delete(u8),
    Like(u8),
    Send,
    SendFaulty(FaultKind),
    Deliver(u8),
    Remote(RemoteOp),
}

#[derive(Clone, Debug, bolero::generator::TypeGenerator)]
enum RemoteOp {
    Comment,
    Reply(u8),
    Delete(u8),
    Like(u8),
}

fn ana() -> Session {
    Session::new(
        Author {
            display_name: String::from("ANA"),
            handle: String::from("ana"),
            avatar_url: None,
        },
        String::from("token"),
    )
}

struct World {
    server: MockServer,
    ana: MockClient,
    bob: MockClient,
    view: CommentView,
    delivered: usize,
}

impl World {
    fn new() -> World {
        if std::env::var("RUST_LOG").is_ok() {
            let _ = tracing_subscriber::fmt::try_init();
        }
        let server = MockServer::new();
        server.create_post(POST);
        World {
            ana: server.client("ana"),
            bob: server.client("bob"),
            view: CommentView::init(POST, ana(), Config::default()),
            server,
            delivered: 0,
        }
    }

    fn keys(&self) -> Vec<NodeKey> {
        let mut keys = self.view.store().nodes().map(|c| c.key).collect::<Vec<_>>();
        keys.sort();
        keys
    }

    fn pick(&self, i: u8) -> Option<NodeKey> {
        let keys = self.keys();
        match keys.is_empty() {
            true => None,
            false => Some(keys[i as usize % keys.len()]),
        }
    }

    fn server_ids(&self, handle: Option<&str>) -> Vec<CommentId> {
        self.server
            .threads(POST)
            .iter()
            .flat_map(|t| t.iter())
            .filter(|c| handle.map_or(true, |h| c.author.handle == h))
            .map(|c| c.id)
            .collect()
    }

    fn submit(&mut self, action: UserAction) -> Option<IdempotencyToken> {
        self.view.submit(action).ok()
    }

    fn send(&mut self, fault: Option<FaultKind>) {
        for req in self.view.take_ready() {
            match &fault {
                None => (),
                Some(FaultKind::Drop) => self.server.fail_next(Fault::Drop),
                Some(FaultKind::Lost) => self.server.fail_next(Fault::Lost),
                Some(FaultKind::Reject) => self.server.fail_next(Fault::Reject(
                    crate::api::Error::Unknown(String::from("rejected")),
                )),
            }
            let (post, token) = (req.post, req.token);
            let res = block_on(perform(&self.ana, req));
            self.view.on_reply(post, token, res);
        }
    }

    fn deliver(&mut self, max: usize) {
        let events = self.server.events(POST);
        for e in events.into_iter().skip(self.delivered).take(max) {
            self.delivered += 1;
            self.view.on_event(e, Instant::now());
        }
    }

    fn remote(&mut self, op: RemoteOp) {
        let token = IdempotencyToken::new();
        // failures, like deleting someone else's comment, are part of the game
        let _ = match op {
            RemoteOp::Comment => block_on(self.bob.create_comment(
                POST,
                String::from("remote"),
                None,
                token,
            ))
            .map(|_| ()),
            RemoteOp::Reply(i) => {
                let ids = self.server_ids(None);
                match ids.is_empty() {
                    true => Ok(()),
                    false => block_on(self.bob.create_comment(
                        POST,
                        String::from("remote reply"),
                        Some(ids[i as usize % ids.len()]),
                        token,
                    ))
                    .map(|_| ()),
                }
            }
            RemoteOp::Delete(i) => {
                let ids = self.server_ids(Some("bob"));
                match ids.is_empty() {
                    true => Ok(()),
                    false => block_on(self.bob.delete_comment(ids[i as usize % ids.len()], token)),
                }
            }
            RemoteOp::Like(i) => {
                let ids = self.server_ids(None);
                match ids.is_empty() {
                    true => Ok(()),
                    false => block_on(self.bob.toggle_like(ids[i as usize % ids.len()])).map(|_| ()),
                }
            }
        };
    }

    fn run(&mut self, op: Op) {
        match op {
            Op::Comment => {
                self.submit(UserAction::Comment {
                    content: String::from("mine"),
                });
            }
            Op::Reply(i) => {
                if let Some(target) = self.pick(i) {
                    self.submit(UserAction::Reply {
                        target,
                        content: String::from("my reply"),
                    });
                }
            }
            Op::Edit(i) => {
                if let Some(target) = self.pick(i) {
                    self.submit(UserAction::Edit {
                        target,
                        content: format!("edited {i}"),
                    });
                }
            }
            Op::Delete(i) => {
                if let Some(target) = self.pick(i) {
                    self.submit(UserAction::Delete { target });
                }
            }
            Op::Like(i) => {
                if let Some(target) = self.pick(i) {
                    self.submit(UserAction::ToggleLike { target });
                }
            }
            Op::Send => self.send(None),
            Op::SendFaulty(f) => self.send(Some(f)),
            Op::Deliver(n) => self.deliver(n as usize % 8),
            Op::Remote(op) => self.remote(op),
        }
    }

    fn check_invariants(&self) {
        let store = self.view.store();
        for c in store.nodes() {
            assert!(
                store.depth(c.key) <= store.max_depth(),
                "comment {} is {} levels deep",
                c.id,
                store.depth(c.key)
            );
            if let Some(p) = c.parent {
                assert!(store.node(p).map_or(false, |p| p.children.contains(&c.key)));
            }
        }
        assert_eq!(self.view.count(), count_forest(store));
    }

    fn settle(&mut self) {
        for _ in 0..64 {
            self.send(None);
            self.deliver(usize::MAX);
            if self.view.pending_len() == 0 {
                break;
            }
        }
        self.deliver(usize::MAX);
        assert_eq!(self.view.pending_len(), 0);
    }
}

/// What must agree between a client and the server: per comment, whether it is deleted, its
/// content while it is not, and its like count
fn client_projection(view: &CommentView) -> BTreeMap<i64, (bool, Option<String>, u32)> {
    view.store()
        .nodes()
        .map(|c| {
            let id = match c.id {
                NodeId::Canonical(id) => id.0,
                NodeId::Provisional(_) => panic!("comment {} never got confirmed", c.key.0),
            };
            (id, (c.deleted, (!c.deleted).then(|| c.content.clone()), c.like_count))
        })
        .collect()
}

fn server_projection(server: &MockServer) -> BTreeMap<i64, (bool, Option<String>, u32)> {
    server
        .threads(POST)
        .iter()
        .flat_map(|t| t.iter())
        .map(|c| {
            (
                c.id.0,
                (c.deleted, (!c.deleted).then(|| c.content.clone()), c.like_count),
            )
        })
        .collect()
}

#[test]
fn converges_with_the_server() {
    bolero::check!()
        .with_type::<Vec<Op>>()
        .cloned()
        .for_each(|ops| {
            let mut w = World::new();
            for op in ops {
                w.run(op);
                w.check_invariants();
            }
            w.settle();
            w.check_invariants();
            assert_eq!(client_projection(&w.view), server_projection(&w.server));
            let (visible, total) = w.server.comment_count(POST);
            let count = w.view.count();
            assert_eq!((count.visible as usize, count.total as usize), (visible, total));
        })
}

#[test]
fn merging_is_idempotent() {
    bolero::check!()
        .with_type::<Vec<RemoteOp>>()
        .cloned()
        .for_each(|ops| {
            let mut once = World::new();
            for op in ops {
                once.remote(op);
            }
            let events = once.server.events(POST);
            let mut twice = CommentView::init(POST, ana(), Config::default());
            for e in events.iter().chain(events.iter()) {
                twice.on_event(e.clone(), Instant::now());
            }
            once.deliver(usize::MAX);
            assert_eq!(once.view.tree(), twice.tree());
            assert_eq!(once.view.count(), twice.count());
            assert_eq!(twice.anomalies(), 0);
        })
}

fn without_children(c: &Comment) -> Comment {
    Comment {
        children: Vec::new(),
        ..c.clone()
    }
}

#[test]
fn rollback_is_isolated() {
    bolero::check!()
        .with_type::<(Vec<Op>, Vec<Op>, u8)>()
        .cloned()
        .for_each(|(setup, pending, victim)| {
            let mut w = World::new();
            for op in setup {
                w.run(op);
            }
            w.settle();

            // local mutations only, none sent yet
            let mut submitted = Vec::new();
            for op in pending {
                let before = w.keys().into_iter().collect::<HashSet<_>>();
                let (action, target) = match op {
                    Op::Comment => (
                        UserAction::Comment {
                            content: String::from("mine"),
                        },
                        None,
                    ),
                    Op::Reply(i) => match w.pick(i) {
                        Some(target) => (
                            UserAction::Reply {
                                target,
                                content: String::from("my reply"),
                            },
                            None,
                        ),
                        None => continue,
                    },
                    Op::Edit(i) => match w.pick(i) {
                        Some(target) => (
                            UserAction::Edit {
                                target,
                                content: String::from("edited"),
                            },
                            Some(target),
                        ),
                        None => continue,
                    },
                    Op::Delete(i) => match w.pick(i) {
                        Some(target) => (UserAction::Delete { target }, Some(target)),
                        None => continue,
                    },
                    Op::Like(i) => match w.pick(i) {
                        Some(target) => (UserAction::ToggleLike { target }, Some(target)),
                        None => continue,
                    },
                    _ => continue,
                };
                if let Some(token) = w.submit(action) {
                    let target = target.or_else(|| {
                        w.keys().into_iter().find(|k| !before.contains(k))
                    });
                    if let Some(target) = target {
                        submitted.push((token, target));
                    }
                }
            }
            if submitted.is_empty() {
                return;
            }

            let (token, target) = submitted[victim as usize % submitted.len()];
            let doomed = w.view.store().subtree(target).into_iter().collect::<HashSet<_>>();
            let before = w
                .view
                .store()
                .nodes()
                .filter(|c| !doomed.contains(&c.key))
                .map(without_children)
                .collect::<Vec<_>>();
            w.view.take_ready();
            w.view.on_reply(
                POST,
                token,
                Err(crate::api::ServiceError::Api(crate::api::Error::Unknown(
                    String::from("rejected"),
                ))),
            );
            for c in before {
                assert_eq!(
                    w.view.store().node(c.key).map(without_children),
                    Some(c),
                    "rolling back a mutation on {} touched another comment",
                    target.0
                );
            }
            w.check_invariants();
        })
}
