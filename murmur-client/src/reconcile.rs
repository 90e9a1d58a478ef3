use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use crate::{
    api::{self, CommentEvent, CommentEventKind, IdempotencyToken, PostId},
    CommentPatch, CommentStore, Config, Mutation, MutationQueue, NewComment, NodeId, NodeKey,
    ProvisionalId, StoreError, ThreadRouter,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Applied,

    /// Already reflected in the tree
    Duplicate,

    /// Echo of one of our own pending mutations
    Confirmed(IdempotencyToken),

    /// Waiting for its parent to show up
    Held,

    Ignored,
    ResyncNeeded,
}

#[derive(Debug)]
struct HeldEvent {
    event: CommentEvent,
    since: Instant,
}

/// Merges the real-time events of one post into its store
pub struct Reconciler {
    post: PostId,
    router: ThreadRouter,
    last_seq: u64,
    held: VecDeque<HeldEvent>,
    hold_timeout: Duration,
    max_held: usize,
    resync_requested: bool,
}

/// Swap a confirmed comment in for its provisional node, carrying pending mutations over if
/// the node got folded into an existing copy.
///
/// Edits and likes submitted on the provisional node stay visible: the server values become
/// what they revert to.
pub(crate) fn adopt_canonical(
    store: &mut CommentStore,
    queue: &mut MutationQueue,
    key: NodeKey,
    provisional: ProvisionalId,
    confirmed: &api::Comment,
) -> Result<NodeKey, StoreError> {
    let local = store
        .node(key)
        .map(|n| (n.content.clone(), n.like_status()));
    let new_key = store.replace_provisional(provisional, confirmed)?;
    if new_key != key {
        queue.rekey(key, new_key);
    }
    if let Some((content, like)) = local {
        let mut patch = CommentPatch::default();
        if queue.has_pending_edit(new_key) {
            queue.rebase_content(new_key, &confirmed.content);
            patch.content = Some(content);
        }
        if queue.has_pending_like(new_key) {
            queue.rebase_like_count(new_key, confirmed.like_count);
            patch = CommentPatch {
                like_count: Some(like.like_count),
                liked_by_viewer: Some(like.liked),
                ..patch
            };
        }
        if !patch.is_empty() {
            store.update(NodeId::Canonical(confirmed.id), patch)?;
        }
    }
    Ok(new_key)
}

impl Reconciler {
    pub fn new(post: PostId, router: ThreadRouter, config: &Config) -> Reconciler {
        Reconciler {
            post,
            router,
            last_seq: 0,
            held: VecDeque::new(),
            hold_timeout: config.hold_timeout(),
            max_held: config.max_held_events,
            resync_requested: false,
        }
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    pub fn apply(
        &mut self,
        event: CommentEvent,
        now: Instant,
        store: &mut CommentStore,
        queue: &mut MutationQueue,
    ) -> Outcome {
        if event.post_id != self.post || store.post() != self.post {
            tracing::debug!(post = %self.post, event_post = %event.post_id, "ignoring event for another post");
            return Outcome::Ignored;
        }
        self.last_seq = self.last_seq.max(event.seq);
        let outcome = self.apply_logged(event, now, store, queue);
        if matches!(outcome, Outcome::Applied | Outcome::Confirmed(_)) {
            self.retry_held(now, store, queue);
        }
        outcome
    }

    fn apply_logged(
        &mut self,
        event: CommentEvent,
        now: Instant,
        store: &mut CommentStore,
        queue: &mut MutationQueue,
    ) -> Outcome {
        let (seq, id) = (event.seq, event.comment_id());
        match self.apply_one(event, now, store, queue) {
            Ok(outcome) => {
                tracing::debug!(post = %self.post, seq, %id, ?outcome, "reconciled event");
                outcome
            }
            Err(err) => {
                tracing::warn!(
                    post = %self.post,
                    seq,
                    %id,
                    ?err,
                    "reconciliation anomaly: could not merge event, requesting resync"
                );
                self.resync_requested = true;
                Outcome::ResyncNeeded
            }
        }
    }

    fn apply_one(
        &mut self,
        event: CommentEvent,
        now: Instant,
        store: &mut CommentStore,
        queue: &mut MutationQueue,
    ) -> Result<Outcome, StoreError> {
        if let Some(token) = event.idempotency_token {
            if queue.is_pending(token) {
                return self.confirm_own(token, event, store, queue);
            }
        }
        match &event.kind {
            CommentEventKind::Created(c) | CommentEventKind::Updated(c) => {
                let c = c.clone();
                self.merge_comment(event, c, now, store, queue)
            }
            CommentEventKind::Deleted(id) => {
                let nid = NodeId::Canonical(*id);
                match store.get(&nid).map(|n| n.deleted) {
                    Some(true) => Ok(Outcome::Duplicate),
                    Some(false) => {
                        store.soft_delete(nid)?;
                        Ok(Outcome::Applied)
                    }
                    None if self.held.iter().any(|h| h.event.comment_id() == *id) => {
                        Ok(self.hold(event, now))
                    }
                    None => Ok(Outcome::Ignored),
                }
            }
        }
    }

    fn confirm_own(
        &mut self,
        token: IdempotencyToken,
        event: CommentEvent,
        store: &mut CommentStore,
        queue: &mut MutationQueue,
    ) -> Result<Outcome, StoreError> {
        let mutation = match queue.confirm(token) {
            Some(m) => m,
            None => return Ok(Outcome::Duplicate),
        };
        let c = match event.kind {
            CommentEventKind::Created(c) | CommentEventKind::Updated(c) => c,
            CommentEventKind::Deleted(_) => return Ok(Outcome::Confirmed(token)),
        };
        match (&mutation, mutation.provisional()) {
            (Mutation::Create { key, .. }, Some(provisional)) => {
                adopt_canonical(store, queue, *key, provisional, &c)?;
            }
            _ => {
                let key = mutation.target();
                let id = store.id_of(key)?;
                let mut patch = CommentPatch {
                    revision: Some(c.revision),
                    ..CommentPatch::default()
                };
                if !queue.has_pending_edit(key) {
                    patch.content = Some(c.content);
                }
                if !queue.has_pending_like(key) {
                    patch.like_count = Some(c.like_count);
                }
                store.update(id, patch)?;
            }
        }
        Ok(Outcome::Confirmed(token))
    }

    fn merge_comment(
        &mut self,
        event: CommentEvent,
        c: api::Comment,
        now: Instant,
        store: &mut CommentStore,
        queue: &mut MutationQueue,
    ) -> Result<Outcome, StoreError> {
        let id = NodeId::Canonical(c.id);
        if let Some(node) = store.get(&id) {
            if !c.is_newer_than(node.revision) {
                return Ok(Outcome::Duplicate);
            }
            let (key, was_deleted) = (node.key, node.deleted);
            let mut patch = CommentPatch {
                revision: Some(c.revision),
                ..CommentPatch::default()
            };
            // liked_by_viewer is relative to whoever caused the broadcast, never take it
            match queue.has_pending_edit(key) {
                true => queue.rebase_content(key, &c.content),
                false => patch.content = Some(c.content.clone()),
            }
            match queue.has_pending_like(key) {
                true => queue.rebase_like_count(key, c.like_count),
                false => patch.like_count = Some(c.like_count),
            }
            store.update(id, patch)?;
            if c.deleted && !was_deleted {
                store.soft_delete(id)?;
            }
            return Ok(Outcome::Applied);
        }

        let placement = match self
            .router
            .place_remote(store, c.parent_id.map(NodeId::Canonical))
        {
            None => return Ok(self.hold(event, now)),
            Some(p) => p?,
        };
        let parent = placement.parent.map(|k| store.id_of(k)).transpose()?;
        let mut new = NewComment::from_api(&c);
        new.liked_by_viewer = false;
        if placement.mention.is_some() {
            new.replying_to = placement.mention;
            new.reply_target = c.parent_id.map(NodeId::Canonical);
        }
        store.merge_insert(parent, new)?;
        Ok(Outcome::Applied)
    }

    fn hold(&mut self, event: CommentEvent, now: Instant) -> Outcome {
        tracing::debug!(post = %self.post, seq = event.seq, id = %event.comment_id(), "holding event until its parent arrives");
        self.held.push_back(HeldEvent { event, since: now });
        if self.held.len() > self.max_held {
            tracing::warn!(
                post = %self.post,
                held = self.held.len(),
                "too many events waiting for their parent, requesting resync"
            );
            self.resync_requested = true;
            return Outcome::ResyncNeeded;
        }
        Outcome::Held
    }

    fn is_ready(event: &CommentEvent, store: &CommentStore) -> bool {
        match &event.kind {
            CommentEventKind::Deleted(id) => store.get(&NodeId::Canonical(*id)).is_some(),
            CommentEventKind::Created(c) | CommentEventKind::Updated(c) => {
                store.get(&NodeId::Canonical(c.id)).is_some()
                    || c.parent_id
                        .map_or(true, |p| store.get(&NodeId::Canonical(p)).is_some())
            }
        }
    }

    /// Apply every held event whose parent is now known
    pub fn retry_held(
        &mut self,
        now: Instant,
        store: &mut CommentStore,
        queue: &mut MutationQueue,
    ) {
        while let Some(i) = self
            .held
            .iter()
            .position(|h| Reconciler::is_ready(&h.event, store))
        {
            if let Some(h) = self.held.remove(i) {
                self.apply_logged(h.event, now, store, queue);
            }
        }
    }

    /// When the oldest held event times out, unless a resync is already requested
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.resync_requested {
            true => None,
            false => self.held.front().map(|h| h.since + self.hold_timeout),
        }
    }

    /// Check the holding area for expired events. Returns whether a resync is needed.
    pub fn poll(&mut self, now: Instant) -> bool {
        if let Some(deadline) = self.next_deadline() {
            if now >= deadline {
                tracing::warn!(
                    post = %self.post,
                    held = self.held.len(),
                    "events waited too long for their parent, requesting resync"
                );
                self.resync_requested = true;
            }
        }
        self.resync_requested
    }

    pub fn request_resync(&mut self) {
        self.resync_requested = true;
    }

    pub fn take_resync_request(&mut self) -> bool {
        std::mem::replace(&mut self.resync_requested, false)
    }

    /// Drain the holding area ahead of a resync, keeping only the events more recent than
    /// what the snapshot already reflects
    pub fn take_after(&mut self, seq: u64) -> Vec<CommentEvent> {
        self.last_seq = self.last_seq.max(seq);
        let held = std::mem::take(&mut self.held);
        let before = held.len();
        let res = held
            .into_iter()
            .map(|h| h.event)
            .filter(|e| e.seq > seq)
            .collect::<Vec<_>>();
        tracing::debug!(
            post = %self.post,
            dropped = before - res.len(),
            kept = res.len(),
            "flushed holding area"
        );
        res
    }
}
