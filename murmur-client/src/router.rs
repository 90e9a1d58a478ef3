use crate::{CommentStore, NodeId, NodeKey, StoreError};

/// Where a new comment actually goes
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Placement {
    pub parent: Option<NodeKey>,
    pub depth: usize,

    /// Handle to mention when the reply got threaded back, so it is clear who it answers
    pub mention: Option<String>,

    /// The comment the user asked to reply to, kept even when threaded back
    pub target: Option<NodeKey>,
}

/// Decides where replies attach, keeping every comment at most `max_depth` levels deep.
///
/// Replies to a comment already at `max_depth` do not open a new level: they get threaded
/// back to become a sibling of the target's ancestor at depth `max_depth - 1`.
#[derive(Clone, Copy, Debug)]
pub struct ThreadRouter {
    max_depth: usize,
}

impl ThreadRouter {
    pub fn new(max_depth: usize) -> ThreadRouter {
        ThreadRouter { max_depth }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Where a local reply to `target` goes. Deleted comments without replies cannot be
    /// replied to, wherever they sit.
    pub fn route(
        &self,
        store: &CommentStore,
        target: Option<NodeKey>,
    ) -> Result<Placement, StoreError> {
        if let Some(t) = target {
            let node = store.node(t).ok_or(StoreError::UnknownNode(t))?;
            if node.deleted && node.children.is_empty() {
                return Err(StoreError::InvalidParent(node.id));
            }
        }
        self.place(store, target)
    }

    fn place(&self, store: &CommentStore, target: Option<NodeKey>) -> Result<Placement, StoreError> {
        let target = match target {
            None => {
                return Ok(Placement {
                    parent: None,
                    depth: 0,
                    mention: None,
                    target: None,
                })
            }
            Some(t) => t,
        };
        let target_node = store.node(target).ok_or(StoreError::UnknownNode(target))?;
        let depth = store.depth(target);
        if depth < self.max_depth {
            return Ok(Placement {
                parent: Some(target),
                depth: depth + 1,
                mention: None,
                target: Some(target),
            });
        }

        let parent = self
            .max_depth
            .checked_sub(2)
            .and_then(|d| store.ancestor_at(target, d))
            .ok_or(StoreError::DepthExceeded {
                parent: target_node.id,
                depth: depth + 1,
                max: self.max_depth,
            })?;
        tracing::debug!(
            post = %store.post(),
            target = %target_node.id,
            target_depth = depth,
            "threading back reply"
        );
        Ok(Placement {
            parent: Some(parent),
            depth: self.max_depth - 1,
            mention: Some(target_node.display_author().handle),
            target: Some(target),
        })
    }

    /// Placement for a comment the server already attached under `parent`. Returns `None` if
    /// the parent is not in the tree yet.
    pub fn place_remote(
        &self,
        store: &CommentStore,
        parent: Option<NodeId>,
    ) -> Option<Result<Placement, StoreError>> {
        match parent {
            None => Some(self.place(store, None)),
            Some(id) => {
                let key = store.key_of(&id)?;
                Some(self.place(store, Some(key)))
            }
        }
    }
}

/// Prefix `content` with a mention of `handle`, unless the user already wrote it
pub fn with_mention(handle: &str, content: &str) -> String {
    let mention = format!("@{handle}");
    match content.strip_prefix(&mention as &str) {
        Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => {
            String::from(content)
        }
        _ => format!("{mention} {content}"),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{
        api::{Author, CommentId, PostId},
        NewComment,
    };

    fn chain(store: &mut CommentStore, len: i64) -> Vec<NodeKey> {
        let mut keys: Vec<NodeKey> = Vec::new();
        for i in 0..len {
            let parent = keys.last().map(|k| store.id_of(*k).unwrap());
            let c = NewComment {
                id: NodeId::Canonical(CommentId(i + 1)),
                author: Author {
                    display_name: format!("User {i}"),
                    handle: format!("user{i}"),
                    avatar_url: None,
                },
                content: format!("depth {i}"),
                like_count: 0,
                liked_by_viewer: false,
                created_at: Utc::now(),
                revision: 1,
                deleted: false,
                replying_to: None,
                reply_target: None,
            };
            keys.push(store.insert(parent, c).unwrap());
        }
        keys
    }

    #[test]
    fn nests_below_the_cap() {
        let mut store = CommentStore::new(PostId(1), 3, String::new());
        let keys = chain(&mut store, 3);
        let router = ThreadRouter::new(3);
        assert_eq!(
            router.route(&store, None).unwrap(),
            Placement {
                parent: None,
                depth: 0,
                mention: None,
                target: None
            }
        );
        let p = router.route(&store, Some(keys[2])).unwrap();
        assert_eq!(p.parent, Some(keys[2]));
        assert_eq!(p.depth, 3);
        assert_eq!(p.mention, None);
    }

    #[test]
    fn threads_back_at_the_cap() {
        let mut store = CommentStore::new(PostId(1), 3, String::new());
        let keys = chain(&mut store, 4);
        let router = ThreadRouter::new(3);
        let p = router.route(&store, Some(keys[3])).unwrap();
        // sibling of the depth-3 target's parent
        assert_eq!(p.parent, Some(keys[1]));
        assert_eq!(p.depth, 2);
        assert_eq!(p.mention.as_deref(), Some("user3"));
        assert_eq!(p.target, Some(keys[3]));
    }

    #[test]
    fn deleted_targets_are_routed_alike_at_any_depth() {
        let mut store = CommentStore::new(PostId(1), 3, String::from("gone"));
        let keys = chain(&mut store, 4);
        let router = ThreadRouter::new(3);

        store.soft_delete(NodeId::Canonical(CommentId(4))).unwrap();
        assert_eq!(
            router.route(&store, Some(keys[3])),
            Err(StoreError::InvalidParent(NodeId::Canonical(CommentId(4))))
        );
        store.soft_delete(NodeId::Canonical(CommentId(2))).unwrap();
        assert_eq!(
            router.route(&store, Some(keys[1])).map(|p| p.parent),
            Ok(Some(keys[1]))
        );

        // deleted but still holding a reply, its author is not revealed
        let mut store = CommentStore::new(PostId(1), 4, String::from("gone"));
        let keys = chain(&mut store, 5);
        store.soft_delete(NodeId::Canonical(CommentId(4))).unwrap();
        let p = router.route(&store, Some(keys[3])).unwrap();
        assert_eq!(p.parent, Some(keys[1]));
        assert_eq!(p.mention.as_deref(), Some("unknown"));
    }

    #[test]
    fn shallow_cap_fails_instead_of_threading_back() {
        let mut store = CommentStore::new(PostId(1), 3, String::new());
        let keys = chain(&mut store, 2);
        let router = ThreadRouter::new(1);
        assert_eq!(
            router.route(&store, Some(keys[1])),
            Err(StoreError::DepthExceeded {
                parent: NodeId::Canonical(CommentId(2)),
                depth: 2,
                max: 1,
            })
        );
        assert!(ThreadRouter::new(0).route(&store, Some(keys[0])).is_err());
    }

    #[test]
    fn remote_placement_waits_for_parent() {
        let mut store = CommentStore::new(PostId(1), 3, String::new());
        let keys = chain(&mut store, 1);
        let router = ThreadRouter::new(3);
        assert!(router
            .place_remote(&store, Some(NodeId::Canonical(CommentId(77))))
            .is_none());
        let p = router
            .place_remote(&store, Some(NodeId::Canonical(CommentId(1))))
            .unwrap()
            .unwrap();
        assert_eq!(p.parent, Some(keys[0]));
    }

    #[test]
    fn mentions_are_not_doubled() {
        assert_eq!(with_mention("ana", "hi"), "@ana hi");
        assert_eq!(with_mention("ana", "@ana hi"), "@ana hi");
        assert_eq!(with_mention("ana", "@anabel hi"), "@ana @anabel hi");
    }
}
