// Active item list
// Committed items ordered by the LSN of their last commit, awaiting write-back

use crate::buf::Buf;
use crate::inode::Inode;
use crate::sync::lock;
use crate::types::{BlockNumber, Ino, Lsn};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Identity of a logged object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ItemKey {
    Inode(Ino),
    Buf(BlockNumber),
}

/// A committed object waiting to be written home
#[derive(Clone)]
pub enum AilItem {
    Inode(Arc<Inode>),
    Buf(Arc<Buf>),
}

impl AilItem {
    pub fn key(&self) -> ItemKey {
        match self {
            AilItem::Inode(inode) => ItemKey::Inode(inode.ino()),
            AilItem::Buf(buf) => ItemKey::Buf(buf.blkno()),
        }
    }
}

impl std::fmt::Debug for AilItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.key())
    }
}

#[derive(Default)]
struct AilInner {
    by_lsn: BTreeMap<Lsn, HashMap<ItemKey, AilItem>>,
    index: HashMap<ItemKey, Lsn>,
}

/// The AIL. An item re-logged by a later transaction moves to the later
/// LSN, so the smallest LSN present is how far the log tail may advance.
#[derive(Default)]
pub struct Ail {
    inner: Mutex<AilInner>,
}

impl Ail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or move an item to `lsn`
    pub fn insert(&self, lsn: Lsn, item: AilItem) {
        let mut inner = lock(&self.inner);
        let key = item.key();
        if let Some(old) = inner.index.insert(key, lsn) {
            if old == lsn {
                return;
            }
            if let Some(bucket) = inner.by_lsn.get_mut(&old) {
                bucket.remove(&key);
                if bucket.is_empty() {
                    inner.by_lsn.remove(&old);
                }
            }
        }
        inner.by_lsn.entry(lsn).or_default().insert(key, item);
    }

    /// Remove an item, but only if it still sits at `lsn`: an item re-logged
    /// since it was written home must stay.
    pub fn remove_if_at(&self, key: ItemKey, lsn: Lsn) -> bool {
        let mut inner = lock(&self.inner);
        if inner.index.get(&key) != Some(&lsn) {
            return false;
        }
        inner.index.remove(&key);
        if let Some(bucket) = inner.by_lsn.get_mut(&lsn) {
            bucket.remove(&key);
            if bucket.is_empty() {
                inner.by_lsn.remove(&lsn);
            }
        }
        true
    }

    /// Smallest LSN with items still waiting
    pub fn min_lsn(&self) -> Option<Lsn> {
        lock(&self.inner).by_lsn.keys().next().copied()
    }

    pub fn lsn_of(&self, key: ItemKey) -> Option<Lsn> {
        lock(&self.inner).index.get(&key).copied()
    }

    /// All items in LSN order
    pub fn snapshot(&self) -> Vec<(Lsn, AilItem)> {
        let inner = lock(&self.inner);
        let mut items = Vec::with_capacity(inner.index.len());
        for (lsn, bucket) in &inner.by_lsn {
            let mut keyed: Vec<_> = bucket.iter().collect();
            keyed.sort_by_key(|(key, _)| **key);
            items.extend(keyed.into_iter().map(|(_, item)| (*lsn, item.clone())));
        }
        items
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).index.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::BufCache;
    use crate::device::MemDevice;

    fn bufs() -> BufCache {
        BufCache::new(Arc::new(MemDevice::new(512, 32)))
    }

    #[test]
    fn test_relog_moves_item_forward() {
        let cache = bufs();
        let ail = Ail::new();
        let a = cache.get(5).unwrap();
        let b = cache.get(6).unwrap();

        ail.insert(Lsn::new(1, 10), AilItem::Buf(Arc::clone(&a)));
        ail.insert(Lsn::new(1, 12), AilItem::Buf(Arc::clone(&b)));
        assert_eq!(ail.min_lsn(), Some(Lsn::new(1, 10)));

        ail.insert(Lsn::new(1, 20), AilItem::Buf(a));
        assert_eq!(ail.len(), 2);
        assert_eq!(ail.min_lsn(), Some(Lsn::new(1, 12)));
        assert_eq!(ail.lsn_of(ItemKey::Buf(5)), Some(Lsn::new(1, 20)));

        let order: Vec<ItemKey> = ail.snapshot().iter().map(|(_, item)| item.key()).collect();
        assert_eq!(order, vec![ItemKey::Buf(6), ItemKey::Buf(5)]);
    }

    #[test]
    fn test_remove_only_at_current_lsn() {
        let cache = bufs();
        let ail = Ail::new();
        let buf = cache.get(3).unwrap();
        ail.insert(Lsn::new(1, 4), AilItem::Buf(Arc::clone(&buf)));
        ail.insert(Lsn::new(1, 9), AilItem::Buf(buf));

        assert!(!ail.remove_if_at(ItemKey::Buf(3), Lsn::new(1, 4)));
        assert!(ail.remove_if_at(ItemKey::Buf(3), Lsn::new(1, 9)));
        assert!(ail.is_empty());
        assert_eq!(ail.min_lsn(), None);
    }
}
