use std::collections::HashMap;

use futures::channel::mpsc;

use crate::{
    api::{self, PostId},
    Comment, CommentPatch, CommentTree, NewComment, NodeId, NodeKey, ProvisionalId,
};

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Parent {0} does not exist or cannot hold replies")]
    InvalidParent(NodeId),

    #[error("Comment {0} not found")]
    NotFound(NodeId),

    #[error("Node {0:?} is no longer in the tree")]
    UnknownNode(NodeKey),

    #[error("Provisional comment {0:?} was already superseded")]
    StaleProvisional(ProvisionalId),

    #[error("Comment {0} is already in the tree")]
    DuplicateId(NodeId),

    #[error("Replying under {parent} would reach depth {depth}, above the maximum of {max}")]
    DepthExceeded {
        parent: NodeId,
        depth: usize,
        max: usize,
    },

    #[error("Store holds the comments of post {expected}, not {requested}")]
    WrongPost { expected: PostId, requested: PostId },
}

/// Signed change to the number of visible (non-deleted) and total nodes
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CountDelta {
    pub visible: i64,
    pub total: i64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChangeKind {
    Inserted,
    Updated,
    Deleted,
    Restored,
    Removed,
    Confirmed,
    Cleared,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoreChange {
    pub post: PostId,

    /// `None` for changes touching the whole forest
    pub key: Option<NodeKey>,

    pub kind: ChangeKind,
    pub delta: CountDelta,
}

/// The comment forest of a single post.
///
/// Nodes live in an arena indexed by `NodeKey`, with an index from `NodeId` so that any node
/// is found without walking the tree. Top-level comments are kept newest first, replies oldest
/// first.
///
/// Deleted comments stay in the tree as tombstones and are never purged: their position keeps
/// replies anchored, and a late reply to them must still find its parent.
pub struct CommentStore {
    post: PostId,
    max_depth: usize,
    placeholder: String,
    nodes: HashMap<NodeKey, Comment>,
    ids: HashMap<NodeId, NodeKey>,
    roots: Vec<NodeKey>,

    /// Keys of nodes dropped by `clear`, handed back if the same id is loaded again
    retired: HashMap<NodeId, NodeKey>,
    next_key: u64,

    observers: Vec<mpsc::UnboundedSender<StoreChange>>,
}

impl CommentStore {
    pub fn new(post: PostId, max_depth: usize, placeholder: String) -> CommentStore {
        CommentStore {
            post,
            max_depth,
            placeholder,
            nodes: HashMap::new(),
            ids: HashMap::new(),
            roots: Vec::new(),
            retired: HashMap::new(),
            next_key: 0,
            observers: Vec::new(),
        }
    }

    pub fn post(&self) -> PostId {
        self.post
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    /// Receive a notification for every change made to the tree from now on
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<StoreChange> {
        let (sender, receiver) = mpsc::unbounded();
        self.observers.push(sender);
        receiver
    }

    pub fn unsubscribe_all(&mut self) {
        self.observers.clear();
    }

    fn notify(&mut self, key: Option<NodeKey>, kind: ChangeKind, delta: CountDelta) {
        let change = StoreChange {
            post: self.post,
            key,
            kind,
            delta,
        };
        self.observers
            .retain(|o| o.unbounded_send(change.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &NodeId) -> Option<&Comment> {
        self.ids.get(id).and_then(|k| self.nodes.get(k))
    }

    pub fn node(&self, key: NodeKey) -> Option<&Comment> {
        self.nodes.get(&key)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Comment> {
        self.nodes.values()
    }

    pub fn key_of(&self, id: &NodeId) -> Option<NodeKey> {
        self.ids.get(id).copied()
    }

    pub fn id_of(&self, key: NodeKey) -> Result<NodeId, StoreError> {
        self.nodes
            .get(&key)
            .map(|c| c.id)
            .ok_or(StoreError::UnknownNode(key))
    }

    pub fn roots(&self) -> &[NodeKey] {
        &self.roots
    }

    /// Depth of a node, 0 for top-level comments
    pub fn depth(&self, key: NodeKey) -> usize {
        let mut depth = 0;
        let mut cur = self.nodes.get(&key).and_then(|c| c.parent);
        while let Some(k) = cur {
            depth += 1;
            cur = self.nodes.get(&k).and_then(|c| c.parent);
        }
        depth
    }

    /// The ancestor of `key` (or `key` itself) sitting at `depth`
    pub fn ancestor_at(&self, key: NodeKey, depth: usize) -> Option<NodeKey> {
        let own = self.depth(key);
        if depth > own {
            return None;
        }
        let mut cur = key;
        for _ in depth..own {
            cur = self.nodes.get(&cur)?.parent?;
        }
        Some(cur)
    }

    /// Every key of the subtree rooted at `key`, `key` included
    pub fn subtree(&self, key: NodeKey) -> Vec<NodeKey> {
        let mut res = Vec::new();
        let mut stack = vec![key];
        while let Some(k) = stack.pop() {
            if let Some(c) = self.nodes.get(&k) {
                res.push(k);
                stack.extend(c.children.iter().rev());
            }
        }
        res
    }

    pub fn get_tree(&self, post: PostId) -> Result<Vec<CommentTree>, StoreError> {
        if post != self.post {
            return Err(StoreError::WrongPost {
                expected: self.post,
                requested: post,
            });
        }
        Ok(self
            .roots
            .iter()
            .filter_map(|k| self.tree_of(*k, 0))
            .collect())
    }

    fn tree_of(&self, key: NodeKey, depth: usize) -> Option<CommentTree> {
        let comment = self.nodes.get(&key)?;
        Some(CommentTree {
            comment: comment.clone(),
            depth,
            replies: comment
                .children
                .iter()
                .filter_map(|k| self.tree_of(*k, depth + 1))
                .collect(),
        })
    }

    fn node_mut(&mut self, id: &NodeId) -> Result<&mut Comment, StoreError> {
        let key = self.ids.get(id).ok_or(StoreError::NotFound(*id))?;
        self.nodes.get_mut(key).ok_or(StoreError::NotFound(*id))
    }

    fn alloc_key(&mut self) -> NodeKey {
        let key = NodeKey(self.next_key);
        self.next_key += 1;
        key
    }

    /// Insert a comment on behalf of the local user. Fails with `InvalidParent` if the parent
    /// does not exist, or is a tombstone without any reply left.
    pub fn insert(&mut self, parent: Option<NodeId>, c: NewComment) -> Result<NodeKey, StoreError> {
        self.insert_node(parent, c, true)
    }

    /// Insert a comment the server already accepted, under whatever parent it has
    pub fn merge_insert(
        &mut self,
        parent: Option<NodeId>,
        c: NewComment,
    ) -> Result<NodeKey, StoreError> {
        self.insert_node(parent, c, false)
    }

    fn insert_node(
        &mut self,
        parent: Option<NodeId>,
        c: NewComment,
        strict: bool,
    ) -> Result<NodeKey, StoreError> {
        if self.ids.contains_key(&c.id) {
            return Err(StoreError::DuplicateId(c.id));
        }
        let (parent_key, depth) = match parent {
            None => (None, 0),
            Some(pid) => {
                let pk = self.key_of(&pid).ok_or(StoreError::InvalidParent(pid))?;
                let p = self.nodes.get(&pk).ok_or(StoreError::InvalidParent(pid))?;
                if strict && p.deleted && p.children.is_empty() {
                    return Err(StoreError::InvalidParent(pid));
                }
                let depth = self.depth(pk) + 1;
                if depth > self.max_depth {
                    return Err(StoreError::DepthExceeded {
                        parent: pid,
                        depth,
                        max: self.max_depth,
                    });
                }
                (Some(pk), depth)
            }
        };

        let key = match self.retired.remove(&c.id) {
            Some(k) => k,
            None => self.alloc_key(),
        };
        let id = c.id;
        let deleted = c.deleted;
        let content = match deleted {
            true => self.placeholder.clone(),
            false => c.content,
        };
        self.nodes.insert(
            key,
            Comment {
                key,
                id,
                parent: parent_key,
                author: c.author,
                content,
                like_count: c.like_count,
                liked_by_viewer: c.liked_by_viewer,
                created_at: c.created_at,
                revision: c.revision,
                deleted,
                replying_to: c.replying_to,
                reply_target: c.reply_target,
                children: Vec::new(),
            },
        );
        self.ids.insert(id, key);
        match parent_key {
            None => self.roots.insert(0, key),
            Some(pk) => {
                if let Some(p) = self.nodes.get_mut(&pk) {
                    p.children.push(key);
                }
            }
        }

        tracing::debug!(post = %self.post, %id, depth, "inserted comment");
        self.notify(
            Some(key),
            ChangeKind::Inserted,
            CountDelta {
                visible: if deleted { 0 } else { 1 },
                total: 1,
            },
        );
        Ok(key)
    }

    /// Content changes on tombstones are ignored, they keep showing the placeholder
    pub fn update(&mut self, id: NodeId, patch: CommentPatch) -> Result<(), StoreError> {
        let node = self.node_mut(&id)?;
        if patch.is_empty() {
            return Ok(());
        }
        if let Some(content) = patch.content {
            if !node.deleted {
                node.content = content;
            }
        }
        if let Some(like_count) = patch.like_count {
            node.like_count = like_count;
        }
        if let Some(liked) = patch.liked_by_viewer {
            node.liked_by_viewer = liked;
        }
        if let Some(revision) = patch.revision {
            node.revision = revision;
        }
        let key = node.key;
        self.notify(Some(key), ChangeKind::Updated, CountDelta::default());
        Ok(())
    }

    /// Returns `false` if the comment was already deleted, in which case nothing changes
    pub fn soft_delete(&mut self, id: NodeId) -> Result<bool, StoreError> {
        let placeholder = self.placeholder.clone();
        let node = self.node_mut(&id)?;
        if node.deleted {
            return Ok(false);
        }
        node.deleted = true;
        node.content = placeholder;
        let key = node.key;
        tracing::debug!(post = %self.post, %id, "soft-deleted comment");
        self.notify(
            Some(key),
            ChangeKind::Deleted,
            CountDelta {
                visible: -1,
                total: 0,
            },
        );
        Ok(true)
    }

    /// Undo a soft deletion, putting back `content`
    pub fn restore(&mut self, id: NodeId, content: String) -> Result<bool, StoreError> {
        let node = self.node_mut(&id)?;
        if !node.deleted {
            return Ok(false);
        }
        node.deleted = false;
        node.content = content;
        let key = node.key;
        self.notify(
            Some(key),
            ChangeKind::Restored,
            CountDelta {
                visible: 1,
                total: 0,
            },
        );
        Ok(true)
    }

    /// Physically remove a comment along with all its replies, returning how many nodes went
    pub fn remove(&mut self, id: NodeId) -> Result<usize, StoreError> {
        let key = self.key_of(&id).ok_or(StoreError::NotFound(id))?;
        let subtree = self.subtree(key);
        self.detach(key);
        let mut live = 0;
        for k in &subtree {
            if let Some(c) = self.nodes.remove(k) {
                self.ids.remove(&c.id);
                if !c.deleted {
                    live += 1;
                }
            }
        }
        tracing::debug!(post = %self.post, %id, removed = subtree.len(), "removed comment subtree");
        self.notify(
            Some(key),
            ChangeKind::Removed,
            CountDelta {
                visible: -live,
                total: -(subtree.len() as i64),
            },
        );
        Ok(subtree.len())
    }

    fn detach(&mut self, key: NodeKey) {
        match self.nodes.get(&key).and_then(|c| c.parent) {
            None => self.roots.retain(|k| *k != key),
            Some(pk) => {
                if let Some(p) = self.nodes.get_mut(&pk) {
                    p.children.retain(|k| *k != key);
                }
            }
        }
    }

    /// Give a provisional comment its canonical id, keeping its key and replies.
    ///
    /// If the canonical comment is already in the tree (a listing raced the confirmation),
    /// the provisional node is folded into it instead and the canonical node's key returned.
    pub fn replace_provisional(
        &mut self,
        provisional: ProvisionalId,
        confirmed: &api::Comment,
    ) -> Result<NodeKey, StoreError> {
        let pid = NodeId::Provisional(provisional);
        let key = self
            .key_of(&pid)
            .ok_or(StoreError::StaleProvisional(provisional))?;
        let cid = NodeId::Canonical(confirmed.id);

        if let Some(existing) = self.key_of(&cid) {
            tracing::warn!(
                post = %self.post,
                id = %confirmed.id,
                "reconciliation anomaly: duplicate id clash, folding provisional comment into its canonical copy"
            );
            let children = self
                .nodes
                .get_mut(&key)
                .map(|c| std::mem::take(&mut c.children))
                .unwrap_or_default();
            for child in &children {
                if let Some(c) = self.nodes.get_mut(child) {
                    c.parent = Some(existing);
                }
            }
            if let Some(c) = self.nodes.get_mut(&existing) {
                c.children.extend(children);
            }
            self.detach(key);
            let live = match self.nodes.remove(&key) {
                Some(c) if !c.deleted => 1,
                _ => 0,
            };
            self.ids.remove(&pid);
            self.notify(
                Some(key),
                ChangeKind::Removed,
                CountDelta {
                    visible: -live,
                    total: -1,
                },
            );
            return Ok(existing);
        }

        let node = self
            .nodes
            .get_mut(&key)
            .ok_or(StoreError::StaleProvisional(provisional))?;
        node.id = cid;
        if !node.deleted {
            node.content = confirmed.content.clone();
        }
        node.like_count = confirmed.like_count;
        node.liked_by_viewer = confirmed.liked_by_viewer;
        node.created_at = confirmed.created_at;
        node.revision = confirmed.revision;
        self.ids.remove(&pid);
        self.ids.insert(cid, key);
        tracing::debug!(post = %self.post, id = %confirmed.id, "confirmed provisional comment");
        self.notify(Some(key), ChangeKind::Confirmed, CountDelta::default());
        Ok(key)
    }

    /// Drop every node ahead of a reload. Keys are remembered until `finish_reload`, so nodes
    /// coming back keep their identity.
    pub fn clear(&mut self) {
        let visible = self.nodes.values().filter(|c| !c.deleted).count() as i64;
        let total = self.nodes.len() as i64;
        self.retired.extend(self.ids.drain());
        self.nodes.clear();
        self.roots.clear();
        self.notify(
            None,
            ChangeKind::Cleared,
            CountDelta {
                visible: -visible,
                total: -total,
            },
        );
    }

    pub fn finish_reload(&mut self) {
        self.retired.clear();
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::api::{Author, CommentId};

    fn author(handle: &str) -> Author {
        Author {
            display_name: handle.to_uppercase(),
            handle: String::from(handle),
            avatar_url: None,
        }
    }

    fn new(id: i64, content: &str) -> NewComment {
        NewComment {
            id: NodeId::Canonical(CommentId(id)),
            author: author("ana"),
            content: String::from(content),
            like_count: 0,
            liked_by_viewer: false,
            created_at: Utc::now(),
            revision: 1,
            deleted: false,
            replying_to: None,
            reply_target: None,
        }
    }

    fn cid(id: i64) -> NodeId {
        NodeId::Canonical(CommentId(id))
    }

    fn store() -> CommentStore {
        CommentStore::new(PostId(42), 3, String::from("[deleted]"))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<StoreChange>) -> Vec<StoreChange> {
        let mut res = Vec::new();
        while let Ok(Some(c)) = rx.try_next() {
            res.push(c);
        }
        res
    }

    #[test]
    fn roots_newest_first_replies_oldest_first() {
        let mut s = store();
        s.insert(None, new(1, "first")).unwrap();
        s.insert(None, new(2, "second")).unwrap();
        s.insert(Some(cid(1)), new(3, "a")).unwrap();
        s.insert(Some(cid(1)), new(4, "b")).unwrap();
        let tree = s.get_tree(PostId(42)).unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].comment.content, "second");
        assert_eq!(tree[1].comment.content, "first");
        let replies = tree[1].replies.iter().map(|r| &r.comment.content as &str).collect::<Vec<_>>();
        assert_eq!(replies, vec!["a", "b"]);
        assert_eq!(tree[1].replies[0].depth, 1);
        assert!(matches!(
            s.get_tree(PostId(1)),
            Err(StoreError::WrongPost { .. })
        ));
    }

    #[test]
    fn insert_validates_parent() {
        let mut s = store();
        assert_eq!(
            s.insert(Some(cid(9)), new(1, "x")),
            Err(StoreError::InvalidParent(cid(9)))
        );
        s.insert(None, new(1, "x")).unwrap();
        assert_eq!(
            s.insert(None, new(1, "again")),
            Err(StoreError::DuplicateId(cid(1)))
        );
        s.soft_delete(cid(1)).unwrap();
        assert_eq!(
            s.insert(Some(cid(1)), new(2, "y")),
            Err(StoreError::InvalidParent(cid(1)))
        );
        // the server may still accept it, in which case it has to fit
        s.merge_insert(Some(cid(1)), new(2, "y")).unwrap();
        // a tombstone that still roots replies is a valid parent
        s.insert(Some(cid(1)), new(3, "z")).unwrap();
    }

    #[test]
    fn depth_is_capped() {
        let mut s = store();
        s.insert(None, new(1, "d0")).unwrap();
        s.insert(Some(cid(1)), new(2, "d1")).unwrap();
        s.insert(Some(cid(2)), new(3, "d2")).unwrap();
        let k = s.insert(Some(cid(3)), new(4, "d3")).unwrap();
        assert_eq!(s.depth(k), 3);
        assert_eq!(s.ancestor_at(k, 1), s.key_of(&cid(2)));
        assert_eq!(
            s.insert(Some(cid(4)), new(5, "d4")),
            Err(StoreError::DepthExceeded {
                parent: cid(4),
                depth: 4,
                max: 3
            })
        );
    }

    #[test]
    fn soft_delete_keeps_position_and_notifies_once() {
        let mut s = store();
        let mut rx = s.subscribe();
        s.insert(None, new(1, "x")).unwrap();
        s.insert(Some(cid(1)), new(2, "y")).unwrap();
        assert!(s.soft_delete(cid(1)).unwrap());
        assert!(!s.soft_delete(cid(1)).unwrap());
        assert_eq!(s.soft_delete(cid(7)), Err(StoreError::NotFound(cid(7))));
        let c = s.get(&cid(1)).unwrap();
        assert!(c.deleted);
        assert_eq!(c.content, "[deleted]");
        assert_eq!(c.display_author(), Author::anonymous());
        assert_eq!(c.children.len(), 1);

        let changes = drain(&mut rx);
        assert_eq!(
            changes.iter().map(|c| c.kind).collect::<Vec<_>>(),
            vec![ChangeKind::Inserted, ChangeKind::Inserted, ChangeKind::Deleted]
        );
        assert_eq!(changes[2].delta, CountDelta { visible: -1, total: 0 });

        assert!(s.restore(cid(1), String::from("x")).unwrap());
        assert_eq!(s.get(&cid(1)).unwrap().content, "x");
    }

    #[test]
    fn update_ignores_content_of_tombstones() {
        let mut s = store();
        s.insert(None, new(1, "x")).unwrap();
        s.update(cid(1), CommentPatch::content(String::from("y"))).unwrap();
        assert_eq!(s.get(&cid(1)).unwrap().content, "y");
        s.soft_delete(cid(1)).unwrap();
        s.update(cid(1), CommentPatch::content(String::from("z"))).unwrap();
        assert_eq!(s.get(&cid(1)).unwrap().content, "[deleted]");
        assert_eq!(
            s.update(cid(2), CommentPatch::default()),
            Err(StoreError::NotFound(cid(2)))
        );
    }

    #[test]
    fn remove_cascades() {
        let mut s = store();
        let mut rx = s.subscribe();
        s.insert(None, new(1, "x")).unwrap();
        s.insert(Some(cid(1)), new(2, "y")).unwrap();
        s.insert(Some(cid(2)), new(3, "z")).unwrap();
        s.soft_delete(cid(2)).unwrap();
        drain(&mut rx);
        assert_eq!(s.remove(cid(1)).unwrap(), 3);
        assert!(s.is_empty());
        assert!(s.roots().is_empty());
        assert_eq!(
            drain(&mut rx)[0].delta,
            CountDelta {
                visible: -2,
                total: -3
            }
        );
    }

    #[test]
    fn provisional_replacement_keeps_identity() {
        let mut s = store();
        let p = ProvisionalId::new();
        let key = s
            .insert(
                None,
                NewComment::provisional(p, author("ana"), String::from("hello"), Utc::now()),
            )
            .unwrap();
        let child = s
            .insert(Some(NodeId::Provisional(p)), new(5, "reply"))
            .unwrap();
        let confirmed = api::Comment {
            id: CommentId(1001),
            post_id: PostId(42),
            parent_id: None,
            author: author("ana"),
            content: String::from("hello"),
            like_count: 0,
            liked_by_viewer: false,
            reply_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            revision: 1,
            deleted: false,
        };
        assert_eq!(s.replace_provisional(p, &confirmed), Ok(key));
        assert_eq!(s.key_of(&cid(1001)), Some(key));
        assert_eq!(s.node(child).unwrap().parent, Some(key));
        assert_eq!(
            s.replace_provisional(p, &confirmed),
            Err(StoreError::StaleProvisional(p))
        );
    }

    #[test]
    fn provisional_folds_into_existing_canonical() {
        let mut s = store();
        let p = ProvisionalId::new();
        s.insert(
            None,
            NewComment::provisional(p, author("ana"), String::from("hello"), Utc::now()),
        )
        .unwrap();
        let reply = s
            .insert(Some(NodeId::Provisional(p)), new(7, "reply"))
            .unwrap();
        let canonical = s.merge_insert(None, new(1001, "hello")).unwrap();
        let confirmed = api::Comment {
            id: CommentId(1001),
            post_id: PostId(42),
            parent_id: None,
            author: author("ana"),
            content: String::from("hello"),
            like_count: 0,
            liked_by_viewer: false,
            reply_count: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            revision: 1,
            deleted: false,
        };
        assert_eq!(s.replace_provisional(p, &confirmed), Ok(canonical));
        assert_eq!(s.len(), 2);
        assert_eq!(s.roots(), &[canonical]);
        assert_eq!(s.node(reply).unwrap().parent, Some(canonical));
    }

    #[test]
    fn reload_keeps_keys() {
        let mut s = store();
        let mut rx = s.subscribe();
        let k = s.insert(None, new(1, "x")).unwrap();
        s.clear();
        assert!(s.is_empty());
        let k2 = s.merge_insert(None, new(1, "x")).unwrap();
        let k3 = s.merge_insert(None, new(2, "new")).unwrap();
        s.finish_reload();
        assert_eq!(k, k2);
        assert_ne!(k, k3);
        let deltas = drain(&mut rx)
            .into_iter()
            .map(|c| c.delta.visible)
            .collect::<Vec<_>>();
        assert_eq!(deltas, vec![1, -1, 1, 1]);
    }
}
