//! B+Tree nodes and the split, borrow and merge algorithms.
//!
//! A node has `page_size` slots. Live entries occupy `[first, page_size)`,
//! so a node grows towards slot 0 and is full when `first == 0`. A `None`
//! key sorts after every real key; it marks the last slot of each node on
//! the rightmost path. In an internal node, `keys[i]` is the largest key
//! reachable through `children[i]`.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::access::comparator::Comparator;
use crate::access::serializer::Serializer;
use crate::record_manager::RecordManager;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::logical::Recid;

pub(crate) enum NodeKind<V> {
    Leaf {
        values: Vec<Option<V>>,
        prev: Option<Recid>,
        next: Option<Recid>,
    },
    Internal {
        children: Vec<Option<Recid>>,
    },
}

pub(crate) struct Node<K, V> {
    pub recid: Recid,
    pub first: usize,
    pub keys: Vec<Option<K>>,
    pub kind: NodeKind<V>,
}

/// What goes with a key: a value in a leaf, a child in an internal node.
pub(crate) enum Slot<V> {
    Value(V),
    Child(Recid),
}

pub(crate) struct Insertion<K, V> {
    /// Largest key and recid of a node split off below.
    pub overflow: Option<(K, Recid)>,
    pub existing: Option<V>,
}

pub(crate) struct Removal<V> {
    pub underflow: bool,
    pub value: Option<V>,
}

/// On-disk form of a node; only the live slots are stored.
#[derive(Serialize, Deserialize)]
struct StoredNode {
    first: u32,
    keys: Vec<Option<Vec<u8>>>,
    body: StoredBody,
}

#[derive(Serialize, Deserialize)]
enum StoredBody {
    Leaf {
        values: Vec<Option<Vec<u8>>>,
        prev: u64,
        next: u64,
    },
    Internal {
        children: Vec<u64>,
    },
}

/// Entries an underflowing node takes from a sibling whose first live slot
/// is `sibling_first`.
pub(crate) fn steal_count(half: usize, sibling_first: usize) -> usize {
    (half - sibling_first + 1) / 2
}

fn transfer<T>(
    src: &mut [Option<T>],
    src_pos: usize,
    dst: &mut [Option<T>],
    dst_pos: usize,
    count: usize,
) {
    for i in 0..count {
        dst[dst_pos + i] = src[src_pos + i].take();
    }
}

fn shift<T>(slots: &mut [Option<T>], from: usize, to: usize, count: usize) {
    let moved: Vec<Option<T>> = slots[from..from + count]
        .iter_mut()
        .map(Option::take)
        .collect();
    for (i, item) in moved.into_iter().enumerate() {
        slots[to + i] = item;
    }
}

fn link(recid: u64) -> Option<Recid> {
    Some(Recid(recid)).filter(Recid::is_valid)
}

fn corruption(node: Recid, what: &str) -> StorageError {
    StorageError::Corruption(format!("btree node {}: {}", node, what))
}

/// Everything a node operation needs from its tree.
pub(crate) struct Context<'a, K, V> {
    pub rm: &'a RecordManager,
    pub comparator: &'a dyn Comparator<K>,
    pub key_serializer: &'a dyn Serializer<K>,
    pub value_serializer: &'a dyn Serializer<V>,
    pub page_size: usize,
}

impl<K, V> Context<'_, K, V> {
    /// Compare a slot key against `key`; an empty slot is infinitely large.
    pub fn compare_slot(&self, slot: Option<&K>, key: &K) -> Ordering {
        match slot {
            Some(slot) => self.comparator.compare(slot, key),
            None => Ordering::Greater,
        }
    }

    pub fn matches(&self, slot: Option<&K>, key: &K) -> bool {
        slot.is_some() && self.compare_slot(slot, key) == Ordering::Equal
    }

    /// A fresh node with no entries, already owning a recid.
    pub fn create(&self, leaf: bool) -> StorageResult<Node<K, V>> {
        let recid = self.rm.insert(&[])?;
        Ok(Node::empty(recid, leaf, self.page_size))
    }

    pub fn delete(&self, recid: Recid) -> StorageResult<()> {
        self.rm.delete(recid)
    }

    pub fn load(&self, recid: Recid) -> StorageResult<Node<K, V>> {
        let bytes = self.rm.fetch(recid)?;
        let stored: StoredNode = bincode::deserialize(&bytes)?;
        let n = self.page_size;
        let first = stored.first as usize;
        if first > n || stored.keys.len() != n - first {
            return Err(corruption(recid, "slot count does not match the page size"));
        }

        let mut keys = Vec::with_capacity(n);
        keys.resize_with(first, || None);
        for key in stored.keys {
            keys.push(match key {
                Some(bytes) => Some(self.key_serializer.deserialize(&bytes)?),
                None => None,
            });
        }

        let kind = match stored.body {
            StoredBody::Leaf { values, prev, next } => {
                if values.len() != n - first {
                    return Err(corruption(recid, "value count does not match its keys"));
                }
                let mut slots = Vec::with_capacity(n);
                slots.resize_with(first, || None);
                for value in values {
                    slots.push(match value {
                        Some(bytes) => Some(self.value_serializer.deserialize(&bytes)?),
                        None => None,
                    });
                }
                NodeKind::Leaf {
                    values: slots,
                    prev: link(prev),
                    next: link(next),
                }
            }
            StoredBody::Internal { children } => {
                if children.len() != n - first {
                    return Err(corruption(recid, "child count does not match its keys"));
                }
                let mut slots = vec![None; first];
                slots.extend(children.into_iter().map(link));
                NodeKind::Internal { children: slots }
            }
        };

        Ok(Node {
            recid,
            first,
            keys,
            kind,
        })
    }

    pub fn save(&self, node: &Node<K, V>) -> StorageResult<()> {
        let first = node.first;
        let mut keys = Vec::with_capacity(node.keys.len() - first);
        for key in &node.keys[first..] {
            keys.push(match key {
                Some(key) => Some(self.key_serializer.serialize(key)?),
                None => None,
            });
        }

        let body = match &node.kind {
            NodeKind::Leaf { values, prev, next } => {
                let mut stored = Vec::with_capacity(values.len() - first);
                for value in &values[first..] {
                    stored.push(match value {
                        Some(value) => Some(self.value_serializer.serialize(value)?),
                        None => None,
                    });
                }
                StoredBody::Leaf {
                    values: stored,
                    prev: prev.map_or(0, |r| r.0),
                    next: next.map_or(0, |r| r.0),
                }
            }
            NodeKind::Internal { children } => StoredBody::Internal {
                children: children[first..]
                    .iter()
                    .map(|child| child.map_or(0, |r| r.0))
                    .collect(),
            },
        };

        let stored = StoredNode {
            first: first as u32,
            keys,
            body,
        };
        self.rm.update(node.recid, &bincode::serialize(&stored)?)
    }

    /// Detach a leaf that is about to be deleted from its siblings.
    fn unlink_leaf(&self, node: &Node<K, V>) -> StorageResult<()> {
        if let NodeKind::Leaf { prev, next, .. } = &node.kind {
            if let Some(before) = *prev {
                let mut sibling = self.load(before)?;
                sibling.set_next(*next);
                self.save(&sibling)?;
            }
            if let Some(after) = *next {
                let mut sibling = self.load(after)?;
                sibling.set_prev(*prev);
                self.save(&sibling)?;
            }
        }
        Ok(())
    }
}

impl<K: Clone, V: Clone> Context<'_, K, V> {
    /// The first leaf of a tree: one entry followed by the end marker.
    pub fn create_root_leaf(&self, key: K, value: V) -> StorageResult<Node<K, V>> {
        let mut node = self.create(true)?;
        let n = self.page_size;
        node.set_entry(n - 2, Some(key), Slot::Value(value))?;
        node.first = n - 2;
        self.save(&node)?;
        Ok(node)
    }

    /// A new root above a root that just split.
    pub fn create_root(
        &self,
        separator: K,
        overflow: Recid,
        old_root: &Node<K, V>,
    ) -> StorageResult<Node<K, V>> {
        let mut node = self.create(false)?;
        let n = self.page_size;
        node.set_entry(n - 2, Some(separator), Slot::Child(overflow))?;
        node.set_entry(n - 1, old_root.largest_key(), Slot::Child(old_root.recid))?;
        node.first = n - 2;
        self.save(&node)?;
        Ok(node)
    }
}

impl<K, V> Node<K, V> {
    pub fn empty(recid: Recid, leaf: bool, page_size: usize) -> Self {
        let mut keys = Vec::with_capacity(page_size);
        keys.resize_with(page_size, || None);
        let kind = if leaf {
            let mut values = Vec::with_capacity(page_size);
            values.resize_with(page_size, || None);
            NodeKind::Leaf {
                values,
                prev: None,
                next: None,
            }
        } else {
            NodeKind::Internal {
                children: vec![None; page_size],
            }
        };
        Self {
            recid,
            first: page_size,
            keys,
            kind,
        }
    }

    pub fn page_size(&self) -> usize {
        self.keys.len()
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf { .. })
    }

    pub fn is_full(&self) -> bool {
        self.first == 0
    }

    /// Only the last slot is left. For a root leaf that is the end marker;
    /// for a root internal node it is a single child.
    pub fn is_empty(&self) -> bool {
        self.first == self.page_size() - 1
    }

    /// First slot whose key is at or above `key`.
    pub fn find_children(&self, ctx: &Context<'_, K, V>, key: &K) -> usize {
        let mut left = self.first;
        let mut right = self.page_size() - 1;
        while left < right {
            let middle = (left + right) / 2;
            if ctx.compare_slot(self.keys[middle].as_ref(), key) == Ordering::Less {
                left = middle + 1;
            } else {
                right = middle;
            }
        }
        right
    }

    pub fn child(&self, index: usize) -> StorageResult<Recid> {
        match &self.kind {
            NodeKind::Internal { children } => children
                .get(index)
                .copied()
                .flatten()
                .ok_or_else(|| corruption(self.recid, &format!("no child in slot {}", index))),
            NodeKind::Leaf { .. } => Err(corruption(self.recid, "leaf reached above the leaf level")),
        }
    }

    pub fn prev(&self) -> Option<Recid> {
        match &self.kind {
            NodeKind::Leaf { prev, .. } => *prev,
            NodeKind::Internal { .. } => None,
        }
    }

    pub fn next(&self) -> Option<Recid> {
        match &self.kind {
            NodeKind::Leaf { next, .. } => *next,
            NodeKind::Internal { .. } => None,
        }
    }

    pub fn set_prev(&mut self, recid: Option<Recid>) {
        if let NodeKind::Leaf { prev, .. } = &mut self.kind {
            *prev = recid;
        }
    }

    pub fn set_next(&mut self, recid: Option<Recid>) {
        if let NodeKind::Leaf { next, .. } = &mut self.kind {
            *next = recid;
        }
    }

    pub fn set_entry(&mut self, index: usize, key: Option<K>, slot: Slot<V>) -> StorageResult<()> {
        match (&mut self.kind, slot) {
            (NodeKind::Leaf { values, .. }, Slot::Value(value)) => values[index] = Some(value),
            (NodeKind::Internal { children }, Slot::Child(child)) => children[index] = Some(child),
            _ => return Err(corruption(self.recid, "entry kind does not match the node kind")),
        }
        self.keys[index] = key;
        Ok(())
    }

    /// Move `count` entries starting at `src_pos` into `dst` at `dst_pos`.
    pub fn move_entries(
        &mut self,
        src_pos: usize,
        dst: &mut Node<K, V>,
        dst_pos: usize,
        count: usize,
    ) -> StorageResult<()> {
        match (&mut self.kind, &mut dst.kind) {
            (NodeKind::Leaf { values: src, .. }, NodeKind::Leaf { values: to, .. }) => {
                transfer(src, src_pos, to, dst_pos, count)
            }
            (NodeKind::Internal { children: src }, NodeKind::Internal { children: to }) => {
                transfer(src, src_pos, to, dst_pos, count)
            }
            _ => return Err(corruption(self.recid, "sibling nodes of different kinds")),
        }
        transfer(&mut self.keys, src_pos, &mut dst.keys, dst_pos, count);
        Ok(())
    }

    /// Move `count` entries within this node from `from` to `to`.
    pub fn shift_entries(&mut self, from: usize, to: usize, count: usize) {
        shift(&mut self.keys, from, to, count);
        match &mut self.kind {
            NodeKind::Leaf { values, .. } => shift(values, from, to, count),
            NodeKind::Internal { children } => shift(children, from, to, count),
        }
    }

    /// Put an entry at `index`, moving the entries `[first, index]` one slot
    /// down to make room.
    fn insert_entry(&mut self, index: usize, key: K, slot: Slot<V>) -> StorageResult<()> {
        let first = self.first;
        self.shift_entries(first, first - 1, index + 1 - first);
        self.first -= 1;
        self.set_entry(index, Some(key), slot)
    }

    /// Drop the entry at `index`, closing the gap from below.
    fn remove_entry(&mut self, index: usize) -> Option<V> {
        self.keys[index] = None;
        let value = match &mut self.kind {
            NodeKind::Leaf { values, .. } => values[index].take(),
            NodeKind::Internal { children } => {
                children[index] = None;
                None
            }
        };
        let first = self.first;
        self.shift_entries(first, first + 1, index - first);
        self.first += 1;
        value
    }
}

impl<K: Clone, V: Clone> Node<K, V> {
    pub fn largest_key(&self) -> Option<K> {
        self.keys.last().cloned().flatten()
    }

    fn set_value(&mut self, index: usize, value: V) -> StorageResult<()> {
        match &mut self.kind {
            NodeKind::Leaf { values, .. } => {
                values[index] = Some(value);
                Ok(())
            }
            NodeKind::Internal { .. } => Err(corruption(self.recid, "value stored in an internal node")),
        }
    }

    pub fn value(&self, index: usize) -> StorageResult<Option<V>> {
        match &self.kind {
            NodeKind::Leaf { values, .. } => Ok(values[index].clone()),
            NodeKind::Internal { .. } => Err(corruption(self.recid, "value read from an internal node")),
        }
    }

    /// Entry at `index`, or `None` at the end marker.
    pub fn entry(&self, index: usize) -> StorageResult<Option<(K, V)>> {
        let key = match &self.keys[index] {
            Some(key) => key.clone(),
            None => return Ok(None),
        };
        match self.value(index)? {
            Some(value) => Ok(Some((key, value))),
            None => Err(corruption(self.recid, &format!("key without value in slot {}", index))),
        }
    }

    /// Insert below a node at `height` levels above the leaves (1 = this
    /// node is a leaf).
    pub fn insert(
        &mut self,
        ctx: &Context<'_, K, V>,
        height: usize,
        key: &K,
        value: &V,
        replace: bool,
    ) -> StorageResult<Insertion<K, V>> {
        let height = height - 1;
        let index = self.find_children(ctx, key);

        let (new_key, slot) = if height == 0 {
            if ctx.matches(self.keys[index].as_ref(), key) {
                let existing = self.value(index)?;
                if replace {
                    self.set_value(index, value.clone())?;
                    ctx.save(self)?;
                }
                return Ok(Insertion {
                    overflow: None,
                    existing,
                });
            }
            (key.clone(), Slot::Value(value.clone()))
        } else {
            let mut child = ctx.load(self.child(index)?)?;
            match child.insert(ctx, height, key, value, replace)? {
                Insertion {
                    overflow: Some((separator, recid)),
                    existing: None,
                } => (separator, Slot::Child(recid)),
                settled => return Ok(settled),
            }
        };

        if !self.is_full() {
            self.insert_entry(index - 1, new_key, slot)?;
            ctx.save(self)?;
            return Ok(Insertion {
                overflow: None,
                existing: None,
            });
        }

        // Split: the lower half moves to a new node on the left
        let half = self.page_size() / 2;
        let mut overflow = ctx.create(self.is_leaf())?;
        if index < half {
            self.move_entries(0, &mut overflow, half, index)?;
            overflow.set_entry(half + index, Some(new_key), slot)?;
            self.move_entries(index, &mut overflow, half + index + 1, half - index - 1)?;
        } else {
            self.move_entries(0, &mut overflow, half, half)?;
            self.shift_entries(half, half - 1, index - half);
            self.set_entry(index - 1, Some(new_key), slot)?;
        }
        overflow.first = half;
        self.first = half - 1;

        if self.is_leaf() {
            let before = self.prev();
            overflow.set_prev(before);
            overflow.set_next(Some(self.recid));
            if let Some(before) = before {
                let mut sibling = ctx.load(before)?;
                sibling.set_next(Some(overflow.recid));
                ctx.save(&sibling)?;
            }
            self.set_prev(Some(overflow.recid));
        }
        ctx.save(self)?;
        ctx.save(&overflow)?;

        let separator = overflow
            .largest_key()
            .ok_or_else(|| corruption(overflow.recid, "split produced a node without keys"))?;
        Ok(Insertion {
            overflow: Some((separator, overflow.recid)),
            existing: None,
        })
    }

    /// Remove `key` below a node at `height` levels above the leaves.
    pub fn remove(
        &mut self,
        ctx: &Context<'_, K, V>,
        height: usize,
        key: &K,
    ) -> StorageResult<Removal<V>> {
        let height = height - 1;
        let index = self.find_children(ctx, key);

        let value = if height == 0 {
            if !ctx.matches(self.keys[index].as_ref(), key) {
                return Ok(Removal {
                    underflow: false,
                    value: None,
                });
            }
            let value = self.remove_entry(index);
            ctx.save(self)?;
            value
        } else {
            let mut child = ctx.load(self.child(index)?)?;
            let result = child.remove(ctx, height, key)?;
            if result.value.is_none() {
                return Ok(result);
            }
            self.keys[index] = child.largest_key();
            ctx.save(self)?;
            if result.underflow {
                self.rebalance(ctx, index, child)?;
            }
            result.value
        };

        Ok(Removal {
            underflow: self.first > self.page_size() / 2,
            value,
        })
    }

    /// Fix the underflowing child at `index` by borrowing from or merging
    /// with a sibling: the right one, or the left one for the last child.
    fn rebalance(
        &mut self,
        ctx: &Context<'_, K, V>,
        index: usize,
        mut child: Node<K, V>,
    ) -> StorageResult<()> {
        let n = self.page_size();
        let half = n / 2;
        if child.first != half + 1 {
            return Err(corruption(child.recid, "underflow with an unexpected entry count"));
        }

        if index < n - 1 {
            let mut brother = ctx.load(self.child(index + 1)?)?;
            let bfirst = brother.first;
            if bfirst < half {
                let steal = steal_count(half, bfirst);
                child.shift_entries(half + 1, half + 1 - steal, half - 1);
                brother.move_entries(bfirst, &mut child, n - steal, steal)?;
                brother.first += steal;
                child.first -= steal;
                self.keys[index] = child.largest_key();
                ctx.save(self)?;
                ctx.save(&brother)?;
                ctx.save(&child)?;
            } else {
                if bfirst != half {
                    return Err(corruption(brother.recid, "sibling below half full"));
                }
                child.move_entries(half + 1, &mut brother, 1, half - 1)?;
                brother.first = 1;
                ctx.save(&brother)?;
                self.remove_entry(index);
                ctx.save(self)?;
                ctx.unlink_leaf(&child)?;
                ctx.delete(child.recid)?;
            }
        } else {
            let mut brother = ctx.load(self.child(index - 1)?)?;
            let bfirst = brother.first;
            if bfirst < half {
                let steal = steal_count(half, bfirst);
                brother.move_entries(n - steal, &mut child, half + 1 - steal, steal)?;
                brother.shift_entries(bfirst, bfirst + steal, n - bfirst - steal);
                brother.first += steal;
                child.first -= steal;
                self.keys[index - 1] = brother.largest_key();
                ctx.save(self)?;
                ctx.save(&brother)?;
                ctx.save(&child)?;
            } else {
                if bfirst != half {
                    return Err(corruption(brother.recid, "sibling below half full"));
                }
                brother.move_entries(half, &mut child, 1, half)?;
                child.first = 1;
                ctx.save(&child)?;
                self.remove_entry(index - 1);
                ctx.save(self)?;
                ctx.unlink_leaf(&brother)?;
                ctx.delete(brother.recid)?;
            }
        }
        Ok(())
    }
}
