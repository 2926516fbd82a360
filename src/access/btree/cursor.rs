use super::node::Node;
use super::BTree;
use crate::storage::error::StorageResult;

/// Bidirectional cursor over the leaf level of a [`BTree`].
///
/// The cursor sits between two entries: `next_entry` returns the one after
/// it and `previous_entry` the one before. Each leaf is fetched when the
/// cursor reaches it, so the cursor sees changes made to leaves it has not
/// loaded yet.
pub struct Cursor<'a, K, V> {
    tree: &'a BTree<K, V>,
    /// Current leaf and the slot of the next entry.
    position: Option<(Node<K, V>, usize)>,
    failed: bool,
}

impl<'a, K: Clone, V: Clone> Cursor<'a, K, V> {
    pub(super) fn new(tree: &'a BTree<K, V>, position: Option<(Node<K, V>, usize)>) -> Self {
        Self {
            tree,
            position,
            failed: false,
        }
    }

    pub fn next_entry(&mut self) -> StorageResult<Option<(K, V)>> {
        loop {
            let (node, index) = match &mut self.position {
                Some((node, index)) => (node, index),
                None => return Ok(None),
            };

            if *index < node.page_size() {
                if let Some(entry) = node.entry(*index)? {
                    *index += 1;
                    return Ok(Some(entry));
                }
            }

            match node.next() {
                Some(next) => {
                    let leaf = self.tree.load_node(next)?;
                    let first = leaf.first;
                    self.position = Some((leaf, first));
                }
                None => return Ok(None),
            }
        }
    }

    pub fn previous_entry(&mut self) -> StorageResult<Option<(K, V)>> {
        loop {
            let (node, index) = match &mut self.position {
                Some((node, index)) => (node, index),
                None => return Ok(None),
            };

            if *index > node.first {
                *index -= 1;
                match node.entry(*index)? {
                    Some(entry) => return Ok(Some(entry)),
                    None => continue,
                }
            }

            match node.prev() {
                Some(prev) => {
                    let leaf = self.tree.load_node(prev)?;
                    let end = leaf.page_size();
                    self.position = Some((leaf, end));
                }
                None => return Ok(None),
            }
        }
    }
}

impl<K: Clone, V: Clone> Iterator for Cursor<'_, K, V> {
    type Item = StorageResult<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_entry() {
            Ok(entry) => entry.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
