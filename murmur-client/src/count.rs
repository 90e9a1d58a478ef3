use futures::channel::mpsc;
use tokio::sync::watch;

use crate::{api::PostId, CommentStore, CountDelta, NodeKey, StoreChange};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CommentCount {
    /// Comments that are not deleted, the number shown to users
    pub visible: u64,

    /// Every node of the forest, tombstones included
    pub total: u64,
}

pub fn count_subtree(store: &CommentStore, key: NodeKey) -> CommentCount {
    let mut res = CommentCount::default();
    for k in store.subtree(key) {
        if let Some(c) = store.node(k) {
            res.total += 1;
            if !c.deleted {
                res.visible += 1;
            }
        }
    }
    res
}

pub fn count_forest(store: &CommentStore) -> CommentCount {
    store
        .roots()
        .iter()
        .map(|k| count_subtree(store, *k))
        .fold(CommentCount::default(), |acc, c| CommentCount {
            visible: acc.visible + c.visible,
            total: acc.total + c.total,
        })
}

/// Keeps the comment count of a post up to date from the store's change notifications
pub struct CountAggregator {
    post: PostId,
    changes: mpsc::UnboundedReceiver<StoreChange>,
    current: CommentCount,
    publisher: watch::Sender<CommentCount>,
    anomalies: u64,
}

impl CountAggregator {
    pub fn attach(store: &mut CommentStore) -> CountAggregator {
        let current = count_forest(store);
        let (publisher, _) = watch::channel(current);
        CountAggregator {
            post: store.post(),
            changes: store.subscribe(),
            current,
            publisher,
            anomalies: 0,
        }
    }

    /// Apply every change notified since the last call
    pub fn drain(&mut self) {
        while let Ok(Some(change)) = self.changes.try_next() {
            if change.post != self.post {
                continue;
            }
            self.apply(change.delta);
        }
        self.publisher.send_replace(self.current);
    }

    fn apply(&mut self, delta: CountDelta) {
        self.current.visible = self.shift("visible", self.current.visible, delta.visible);
        self.current.total = self.shift("total", self.current.total, delta.total);
    }

    fn shift(&mut self, counter: &'static str, value: u64, delta: i64) -> u64 {
        let res = value as i64 + delta;
        if res < 0 {
            self.anomalies += 1;
            tracing::warn!(
                post = %self.post,
                counter,
                value,
                delta,
                "reconciliation anomaly: comment count underflow, clamping to zero"
            );
            return 0;
        }
        res as u64
    }

    /// Recompute the count from the tree, healing any drift. Returns whether the incremental
    /// count was right.
    pub fn verify(&mut self, store: &CommentStore) -> bool {
        self.drain();
        let actual = count_forest(store);
        if actual == self.current {
            return true;
        }
        self.anomalies += 1;
        tracing::warn!(
            post = %self.post,
            counted = ?self.current,
            actual = ?actual,
            "reconciliation anomaly: comment count drifted, resetting it"
        );
        self.current = actual;
        self.publisher.send_replace(actual);
        false
    }

    pub fn current(&self) -> CommentCount {
        self.current
    }

    pub fn watch(&self) -> watch::Receiver<CommentCount> {
        self.publisher.subscribe()
    }

    /// Number of reconciliation anomalies seen so far
    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{
        api::{Author, CommentId},
        NewComment, NodeId,
    };

    fn new(id: i64) -> NewComment {
        NewComment {
            id: NodeId::Canonical(CommentId(id)),
            author: Author::anonymous(),
            content: String::from("x"),
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

    #[test]
    fn follows_store_changes() {
        let mut store = CommentStore::new(PostId(1), 3, String::new());
        let mut agg = CountAggregator::attach(&mut store);
        let watcher = agg.watch();
        store.insert(None, new(1)).unwrap();
        store.insert(Some(cid(1)), new(2)).unwrap();
        store.insert(Some(cid(2)), new(3)).unwrap();
        store.soft_delete(cid(2)).unwrap();
        store.soft_delete(cid(2)).unwrap();
        agg.drain();
        assert_eq!(agg.current(), CommentCount { visible: 2, total: 3 });
        assert_eq!(*watcher.borrow(), agg.current());
        assert_eq!(
            count_subtree(&store, store.key_of(&cid(2)).unwrap()),
            CommentCount { visible: 1, total: 2 }
        );

        store.remove(cid(1)).unwrap();
        agg.drain();
        assert_eq!(agg.current(), CommentCount::default());
        assert!(agg.verify(&store));
        assert_eq!(agg.anomalies(), 0);
    }

    #[test]
    fn underflow_is_clamped_and_healed() {
        let mut store = CommentStore::new(PostId(1), 3, String::new());
        store.insert(None, new(1)).unwrap();
        let mut agg = CountAggregator::attach(&mut store);
        agg.apply(CountDelta {
            visible: -5,
            total: -5,
        });
        assert_eq!(agg.current(), CommentCount::default());
        assert_eq!(agg.anomalies(), 2);
        assert!(!agg.verify(&store));
        assert_eq!(agg.current(), CommentCount { visible: 1, total: 1 });
    }
}
