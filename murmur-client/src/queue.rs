use std::collections::{HashMap, HashSet, VecDeque};

use crate::{
    api::{IdempotencyToken, LikeStatus},
    CommentPatch, CommentStore, NewComment, NodeKey, ProvisionalId, StoreError,
};

/// A local change, applied to the store before the server confirms it
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Mutation {
    Create {
        key: NodeKey,
        parent: Option<NodeKey>,
        comment: NewComment,
    },
    Edit {
        key: NodeKey,
        content: String,
        previous: String,
    },
    Delete {
        key: NodeKey,
        previous: String,
    },
    ToggleLike {
        key: NodeKey,
        previous: LikeStatus,
    },
}

impl Mutation {
    pub fn target(&self) -> NodeKey {
        match self {
            Mutation::Create { key, .. }
            | Mutation::Edit { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::ToggleLike { key, .. } => *key,
        }
    }

    pub fn parent(&self) -> Option<NodeKey> {
        match self {
            Mutation::Create { parent, .. } => *parent,
            _ => None,
        }
    }

    pub fn provisional(&self) -> Option<ProvisionalId> {
        match self {
            Mutation::Create { comment, .. } => match comment.id {
                crate::NodeId::Provisional(p) => Some(p),
                crate::NodeId::Canonical(_) => None,
            },
            _ => None,
        }
    }

    /// Apply to the store, recording whatever is needed to revert it later
    pub fn apply(&mut self, store: &mut CommentStore) -> Result<(), StoreError> {
        match self {
            Mutation::Create {
                key,
                parent,
                comment,
            } => {
                let parent = parent.map(|p| store.id_of(p)).transpose()?;
                *key = store.insert(parent, comment.clone())?;
            }
            Mutation::Edit {
                key,
                content,
                previous,
            } => {
                let id = store.id_of(*key)?;
                if let Some(node) = store.node(*key) {
                    *previous = node.content.clone();
                }
                store.update(id, CommentPatch::content(content.clone()))?;
            }
            Mutation::Delete { key, previous } => {
                let id = store.id_of(*key)?;
                if let Some(node) = store.node(*key) {
                    *previous = node.content.clone();
                }
                store.soft_delete(id)?;
            }
            Mutation::ToggleLike { key, previous } => {
                let id = store.id_of(*key)?;
                if let Some(node) = store.node(*key) {
                    *previous = node.like_status();
                }
                let liked = !previous.liked;
                let like_count = match liked {
                    true => previous.like_count.saturating_add(1),
                    false => previous.like_count.saturating_sub(1),
                };
                store.update(id, CommentPatch::like(LikeStatus { liked, like_count }))?;
            }
        }
        Ok(())
    }

    /// Undo exactly this mutation, leaving every other node alone
    pub fn revert(&self, store: &mut CommentStore) -> Result<(), StoreError> {
        let id = store.id_of(self.target())?;
        match self {
            Mutation::Create { .. } => {
                store.remove(id)?;
            }
            Mutation::Edit { previous, .. } => {
                store.update(id, CommentPatch::content(previous.clone()))?;
            }
            Mutation::Delete { previous, .. } => {
                store.restore(id, previous.clone())?;
            }
            Mutation::ToggleLike { previous, .. } => {
                store.update(id, CommentPatch::like(*previous))?;
            }
        }
        Ok(())
    }

    fn blocks(&self, later: &Mutation) -> bool {
        self.target() == later.target()
            || (matches!(self, Mutation::Create { .. }) && Some(self.target()) == later.parent())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MutationState {
    Pending,
    Confirmed,
    RolledBack,
}

#[derive(Clone, Debug)]
pub struct QueueEntry {
    pub token: IdempotencyToken,
    pub mutation: Mutation,

    /// Whether the request was handed out for sending
    pub submitted: bool,
}

/// Local mutations waiting for the server, in submission order
#[derive(Debug, Default)]
pub struct MutationQueue {
    pending: VecDeque<QueueEntry>,
    history: HashMap<IdempotencyToken, MutationState>,
}

impl MutationQueue {
    pub fn new() -> MutationQueue {
        MutationQueue::default()
    }

    pub fn push(&mut self, token: IdempotencyToken, mutation: Mutation) {
        self.history.insert(token, MutationState::Pending);
        self.pending.push_back(QueueEntry {
            token,
            mutation,
            submitted: false,
        });
    }

    pub fn state(&self, token: IdempotencyToken) -> Option<MutationState> {
        self.history.get(&token).copied()
    }

    pub fn is_pending(&self, token: IdempotencyToken) -> bool {
        self.state(token) == Some(MutationState::Pending)
    }

    pub fn get(&self, token: IdempotencyToken) -> Option<&QueueEntry> {
        self.pending.iter().find(|e| e.token == token)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &QueueEntry> {
        self.pending.iter()
    }

    pub fn pending_mut(&mut self) -> impl Iterator<Item = &mut QueueEntry> {
        self.pending.iter_mut()
    }

    /// Mutations that can be sent now, marked as submitted.
    ///
    /// A mutation waits while an earlier one still pending targets the same node, or creates
    /// the node it replies to.
    pub fn ready(&mut self) -> Vec<(IdempotencyToken, Mutation)> {
        let mut res = Vec::new();
        for i in 0..self.pending.len() {
            let blocked = {
                let entry = &self.pending[i];
                entry.submitted
                    || self
                        .pending
                        .iter()
                        .take(i)
                        .any(|earlier| earlier.mutation.blocks(&entry.mutation))
            };
            if !blocked {
                let entry = &mut self.pending[i];
                entry.submitted = true;
                res.push((entry.token, entry.mutation.clone()));
            }
        }
        res
    }

    /// Mark a mutation as confirmed by the server. Returns `None` if it was not pending,
    /// confirming twice being a no-op.
    pub fn confirm(&mut self, token: IdempotencyToken) -> Option<Mutation> {
        let idx = self.pending.iter().position(|e| e.token == token)?;
        let entry = self.pending.remove(idx)?;
        self.history.insert(token, MutationState::Confirmed);
        Some(entry.mutation)
    }

    /// Mark a mutation as rolled back, along with every pending mutation that depended on
    /// the node it created. The failed mutation comes first, then its dependents in
    /// submission order.
    pub fn roll_back(&mut self, token: IdempotencyToken) -> Vec<(IdempotencyToken, Mutation)> {
        let idx = match self.pending.iter().position(|e| e.token == token) {
            Some(idx) => idx,
            None => return Vec::new(),
        };
        let mut res = Vec::new();
        let mut doomed = HashSet::new();
        if let Some(entry) = self.pending.remove(idx) {
            self.history.insert(token, MutationState::RolledBack);
            if let Mutation::Create { key, .. } = entry.mutation {
                doomed.insert(key);
            }
            res.push((entry.token, entry.mutation));
        }
        while let Some(i) = self.pending.iter().position(|e| {
            doomed.contains(&e.mutation.target())
                || e.mutation.parent().map_or(false, |p| doomed.contains(&p))
        }) {
            if let Some(entry) = self.pending.remove(i) {
                self.history.insert(entry.token, MutationState::RolledBack);
                doomed.insert(entry.mutation.target());
                res.push((entry.token, entry.mutation));
            }
        }
        res
    }

    pub fn has_pending_edit(&self, key: NodeKey) -> bool {
        self.pending.iter().any(|e| {
            matches!(e.mutation, Mutation::Edit { key: k, .. } | Mutation::Delete { key: k, .. } if k == key)
        })
    }

    pub fn has_pending_like(&self, key: NodeKey) -> bool {
        self.pending
            .iter()
            .any(|e| matches!(e.mutation, Mutation::ToggleLike { key: k, .. } if k == key))
    }

    /// The server moved the content of `key` under a pending edit: revert to that instead
    pub fn rebase_content(&mut self, key: NodeKey, content: &str) {
        for e in self.pending.iter_mut() {
            match &mut e.mutation {
                Mutation::Edit { key: k, previous, .. } | Mutation::Delete { key: k, previous }
                    if *k == key =>
                {
                    *previous = String::from(content);
                }
                _ => (),
            }
        }
    }

    pub fn rebase_like_count(&mut self, key: NodeKey, like_count: u32) {
        for e in self.pending.iter_mut() {
            if let Mutation::ToggleLike { key: k, previous } = &mut e.mutation {
                if *k == key {
                    previous.like_count = like_count;
                }
            }
        }
    }

    /// A node got folded into another one, carry its pending mutations over
    pub fn rekey(&mut self, from: NodeKey, to: NodeKey) {
        for e in self.pending.iter_mut() {
            match &mut e.mutation {
                Mutation::Create { key, parent, .. } => {
                    if *key == from {
                        *key = to;
                    }
                    if *parent == Some(from) {
                        *parent = Some(to);
                    }
                }
                Mutation::Edit { key, .. }
                | Mutation::Delete { key, .. }
                | Mutation::ToggleLike { key, .. } => {
                    if *key == from {
                        *key = to;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{
        api::{Author, CommentId, PostId},
        NodeId,
    };

    fn create(key: u64, parent: Option<u64>) -> Mutation {
        Mutation::Create {
            key: NodeKey(key),
            parent: parent.map(NodeKey),
            comment: NewComment::provisional(
                ProvisionalId::new(),
                Author::anonymous(),
                String::from("x"),
                Utc::now(),
            ),
        }
    }

    fn edit(key: u64) -> Mutation {
        Mutation::Edit {
            key: NodeKey(key),
            content: String::from("new"),
            previous: String::new(),
        }
    }

    fn tokens(v: &[(IdempotencyToken, Mutation)]) -> Vec<IdempotencyToken> {
        v.iter().map(|(t, _)| *t).collect()
    }

    #[test]
    fn same_target_is_serialized() {
        let mut q = MutationQueue::new();
        let (t1, t2, t3, t4) = (
            IdempotencyToken::new(),
            IdempotencyToken::new(),
            IdempotencyToken::new(),
            IdempotencyToken::new(),
        );
        q.push(t1, create(1, None));
        q.push(t2, edit(1));
        q.push(t3, create(2, Some(1)));
        q.push(t4, edit(7));
        assert_eq!(tokens(&q.ready()), vec![t1, t4]);
        assert!(q.ready().is_empty());
        assert!(q.confirm(t1).is_some());
        assert_eq!(tokens(&q.ready()), vec![t2, t3]);
        assert_eq!(q.confirm(t1), None);
        assert_eq!(q.state(t1), Some(MutationState::Confirmed));
    }

    #[test]
    fn rollback_cascades_to_dependents_only() {
        let mut q = MutationQueue::new();
        let (t1, t2, t3, t4) = (
            IdempotencyToken::new(),
            IdempotencyToken::new(),
            IdempotencyToken::new(),
            IdempotencyToken::new(),
        );
        q.push(t1, create(1, None));
        q.push(t2, create(2, Some(1)));
        q.push(t3, edit(2));
        q.push(t4, edit(9));
        assert_eq!(tokens(&q.roll_back(t1)), vec![t1, t2, t3]);
        assert_eq!(q.state(t3), Some(MutationState::RolledBack));
        assert!(q.is_pending(t4));
        assert!(q.roll_back(t1).is_empty());
    }

    #[test]
    fn apply_and_revert() {
        let mut store = CommentStore::new(PostId(1), 3, String::from("gone"));
        let mut m = create(0, None);
        m.apply(&mut store).unwrap();
        let key = m.target();
        store
            .replace_provisional(
                m.provisional().unwrap(),
                &crate::api::Comment {
                    id: CommentId(5),
                    post_id: PostId(1),
                    parent_id: None,
                    author: Author::anonymous(),
                    content: String::from("x"),
                    like_count: 3,
                    liked_by_viewer: false,
                    reply_count: 0,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                    revision: 1,
                    deleted: false,
                },
            )
            .unwrap();

        let mut like = Mutation::ToggleLike {
            key,
            previous: LikeStatus {
                liked: false,
                like_count: 0,
            },
        };
        like.apply(&mut store).unwrap();
        assert_eq!(
            store.node(key).unwrap().like_status(),
            LikeStatus {
                liked: true,
                like_count: 4
            }
        );

        let mut del = Mutation::Delete {
            key,
            previous: String::new(),
        };
        del.apply(&mut store).unwrap();
        assert!(store.node(key).unwrap().deleted);
        del.revert(&mut store).unwrap();
        like.revert(&mut store).unwrap();
        let node = store.get(&NodeId::Canonical(CommentId(5))).unwrap();
        assert!(!node.deleted);
        assert_eq!(node.content, "x");
        assert_eq!(node.like_count, 3);

        m.revert(&mut store).unwrap();
        assert!(store.is_empty());
    }
}
