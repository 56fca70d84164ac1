//! B-tree index over grid-resident nodes.
//!
//! The tree is addressed by the identity of its header record, which holds
//! the root node id, the height (0 when the root is a leaf) and the node
//! capacity. Nodes are loaded lazily as descents and cursors reach them.
//!
//! Mutations take an explicit [`Txn`]; every node they touch is registered
//! with it and reaches the grid only when the transaction commits. Deletes
//! are tombstone puts. Nodes are never merged or reclaimed.

#![allow(clippy::cast_possible_truncation)]

use std::fmt::{Debug, Write as _};
use std::sync::Arc;

use futures::Stream;

use crate::config::{ConfigError, IndexConfig};
use crate::grid::{GridError, NodeId};
use crate::structures::codec::{Codec, CodecError, seal, unseal};
use crate::structures::node::{
    self, Entry, IndexKey, IndexValue, NodeCache, NodeError, NodeRef, Payload, Split, Step,
    TreeNode,
};
use crate::structures::persistent::{GridContext, HandleError, Persistable, Persistent};
use crate::structures::txn::Txn;

/// The persisted root record of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeHeader {
    root: NodeId,
    height: u32,
    capacity: u16,
}

impl TreeHeader {
    /// Encoded size: root, height, capacity and checksum.
    const SIZE: usize = 8 + 4 + 2 + 4;
}

impl Persistable for TreeHeader {
    type Resolver = ();

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        self.root.encode(&mut out);
        self.height.encode(&mut out);
        self.capacity.encode(&mut out);
        seal(&mut out);
        out
    }

    fn decode(bytes: &[u8], _resolver: &()) -> Result<Self, CodecError> {
        let mut input = unseal(bytes)?;
        let root = u64::decode(&mut input)?;
        let height = u32::decode(&mut input)?;
        let capacity = u16::decode(&mut input)?;
        if !input.is_empty() {
            return Err(CodecError::TrailingBytes(input.len()));
        }
        if root == 0 || capacity < 4 || capacity % 2 != 0 {
            return Err(CodecError::Malformed(format!(
                "tree header with root {root} and capacity {capacity}"
            )));
        }
        Ok(Self {
            root,
            height,
            capacity,
        })
    }

    fn encoded_len(&self) -> usize {
        Self::SIZE
    }
}

/// A B-tree index mapping `K` to `V`.
pub struct BTree<K: IndexKey, V: IndexValue> {
    header: Arc<Persistent<TreeHeader>>,
    cache: NodeCache<K, V>,
}

impl<K: IndexKey, V: IndexValue> BTree<K, V> {
    /// Create an empty tree under `txn`.
    pub fn create(context: &GridContext, txn: &mut Txn) -> Result<Self, BTreeError> {
        let capacity = context.config().header_capacity()?;
        let cache = NodeCache::new(context.clone());
        let root = cache.create(TreeNode::empty_leaf(), txn)?;
        let header = TreeHeader {
            root: root.id(),
            height: 0,
            capacity,
        };
        let header = Persistent::create(header, (), txn)?;
        tracing::debug!("Created tree {} with root leaf {}", header.id(), root.id());
        Ok(Self { header, cache })
    }

    /// Open an existing tree by the identity of its header record.
    ///
    /// Nothing is fetched until the first operation.
    #[must_use]
    pub fn open(context: &GridContext, id: NodeId) -> Self {
        Self {
            header: Persistent::unloaded(id, context.clone(), ()),
            cache: NodeCache::new(context.clone()),
        }
    }

    /// Identity of the tree's header record.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.header.id()
    }

    /// Number of levels above the leaves.
    pub async fn height(&self) -> Result<u32, BTreeError> {
        Ok(self.header().await?.height)
    }

    /// Entries per node at which a node splits.
    pub async fn capacity(&self) -> Result<usize, BTreeError> {
        Ok(usize::from(self.header().await?.capacity))
    }

    /// Look up `key`. Absent and deleted keys both yield `None`.
    pub async fn get(&self, key: &K) -> Result<Option<V>, BTreeError> {
        let mut current = self.root().await?;
        loop {
            current.load_for_read();
            current.ensure_materialized().await?;
            match current.read(|n| n.step(key))?? {
                Step::Found(value) => return Ok(value),
                Step::Descend(child) => current = child,
            }
        }
    }

    /// Insert or replace `key`. A `None` value records a deletion.
    ///
    /// Oversized entries are rejected before anything is touched.
    pub async fn put(&self, key: K, value: Option<V>, txn: &mut Txn) -> Result<(), BTreeError> {
        self.header.load_for_write(txn);
        self.header.ensure_materialized().await?;
        let header = self.header.read(|h| *h)?;
        let capacity = usize::from(header.capacity);
        let limit = IndexConfig {
            node_capacity: capacity,
            ..*self.cache.context().config()
        }
        .entry_limit();
        node::check_entry_size(&key, value.as_ref(), limit)?;

        // Fetch the whole path first so a failed fetch leaves nothing modified.
        let mut path: Vec<(NodeRef<K, V>, usize)> = Vec::with_capacity(header.height as usize);
        let mut current = self.cache.resolve(header.root);
        loop {
            current.load_for_write(txn);
            current.ensure_materialized().await?;
            let route = current.read(|n| -> Result<Option<(usize, NodeRef<K, V>)>, NodeError> {
                if n.is_leaf() {
                    return Ok(None);
                }
                let index = n.child_index(&key);
                Ok(Some((index, n.child_at(index)?)))
            })??;
            match route {
                Some((index, child)) => {
                    path.push((current, index));
                    current = child;
                }
                None => break,
            }
        }

        self.header.update(txn, |_| {})?;
        for (parent, _) in &path {
            if parent.read(|n| n.min_key().is_some_and(|min| key < *min))? {
                parent.update(txn, |n| n.lower_min_key(&key))?;
            }
        }

        let Some(split) = current.update(txn, |leaf| leaf.upsert(key, value, capacity))? else {
            return Ok(());
        };
        let root = path
            .first()
            .map_or_else(|| Arc::clone(&current), |(node, _)| Arc::clone(node));
        let mut carry = self.spill(&current, split, txn)?;

        while let Some((parent, index)) = path.pop() {
            let (key, child) = carry;
            match parent.update(txn, |n| n.insert_child(index + 1, key, child, capacity))? {
                None => return Ok(()),
                Some(split) => carry = self.spill(&parent, split, txn)?,
            }
        }

        let root_min = root
            .read(|n| n.min_key().cloned())?
            .ok_or(NodeError::MissingEntry(0))?;
        let (key, sibling) = carry;
        let new_root = self.cache.create(
            TreeNode::internal(vec![Entry::child(root_min, root), Entry::child(key, sibling)]),
            txn,
        )?;
        let height = self.header.update(txn, |h| {
            h.root = new_root.id();
            h.height += 1;
            h.height
        })?;
        tracing::debug!(
            "Tree {} grew a new root {} at height {height}",
            self.id(),
            new_root.id()
        );
        Ok(())
    }

    /// Record the deletion of `key` as a tombstone.
    pub async fn delete(&self, key: K, txn: &mut Txn) -> Result<(), BTreeError> {
        self.put(key, None, txn).await
    }

    /// Values whose keys fall in `from..=to`, ascending.
    pub async fn range(&self, from: &K, to: &K) -> Result<RangeCursor<K, V>, BTreeError> {
        if from > to {
            return Ok(RangeCursor {
                walker: LeafWalker::empty(),
                to: to.clone(),
                done: true,
            });
        }
        let leaf = self.leaf_for(Some(from)).await?;
        Ok(RangeCursor {
            walker: LeafWalker::start(leaf, Some(from)).await?,
            to: to.clone(),
            done: false,
        })
    }

    /// Every live key, ascending.
    pub async fn keys(&self) -> Result<KeyCursor<K, V>, BTreeError> {
        let leaf = self.leaf_for(None).await?;
        Ok(KeyCursor {
            walker: LeafWalker::start(leaf, None).await?,
        })
    }

    /// Number of live entries.
    pub async fn count(&self) -> Result<usize, BTreeError> {
        let mut walker = LeafWalker::start(self.leaf_for(None).await?, None).await?;
        let mut count = 0;
        while let Some((_, value)) = walker.advance().await? {
            if value.is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Mark the header and every node deleted under `txn`.
    ///
    /// Returns the number of records marked.
    pub async fn destroy(self, txn: &mut Txn) -> Result<usize, BTreeError> {
        let header = self.header().await?;
        let mut marked = 0;
        let mut stack = vec![(self.cache.resolve(header.root), 0u32)];
        while let Some((node, depth)) = stack.pop() {
            if depth < header.height {
                node.load_for_read();
                node.ensure_materialized().await?;
                for child in node.read(TreeNode::children)? {
                    stack.push((child, depth + 1));
                }
            }
            txn.mark_deleted(node);
            marked += 1;
        }
        txn.mark_deleted(self.header);
        tracing::debug!("Destroyed tree with {marked} nodes");
        Ok(marked + 1)
    }

    /// Check the structural invariants of the whole tree.
    ///
    /// - every leaf sits at depth `height`
    /// - every internal key equals the minimum key of its child
    /// - every non-root node holds `capacity/2 ..= capacity-1` entries
    /// - the leaf chain visits every leaf in key order
    pub async fn verify(&self) -> Result<TreeShape, BTreeError> {
        let header = self.header().await?;
        let capacity = usize::from(header.capacity);
        let mut shape = TreeShape {
            height: header.height,
            ..TreeShape::default()
        };
        let mut leaves: Vec<NodeRef<K, V>> = Vec::new();
        let mut stack = vec![(self.cache.resolve(header.root), 0u32, None::<K>)];

        while let Some((node, depth, expected_min)) = stack.pop() {
            node.load_for_read();
            node.ensure_materialized().await?;
            let id = node.id();
            let (is_leaf, len, min, ascending) = node.read(|n| {
                let ascending = n.entries().windows(2).all(|w| w[0].key < w[1].key);
                (n.is_leaf(), n.len(), n.min_key().cloned(), ascending)
            })?;

            if !ascending {
                return Err(BTreeError::Corrupt(format!("node {id} is not sorted")));
            }
            if is_leaf != (depth == header.height) {
                return Err(BTreeError::Corrupt(format!(
                    "node {id} at depth {depth} in a tree of height {}",
                    header.height
                )));
            }
            if len >= capacity || (depth > 0 && len < capacity / 2) {
                return Err(BTreeError::Corrupt(format!(
                    "node {id} holds {len} entries with capacity {capacity}"
                )));
            }
            if expected_min.is_some() && expected_min != min {
                return Err(BTreeError::Corrupt(format!(
                    "node {id} minimum key disagrees with its parent"
                )));
            }

            shape.max_fill = shape.max_fill.max(len);
            if depth > 0 {
                shape.min_fill = Some(shape.min_fill.map_or(len, |m| m.min(len)));
            }
            if is_leaf {
                shape.leaves += 1;
                shape.entries += len;
                leaves.push(node);
            } else {
                shape.internal_nodes += 1;
                let children: Vec<(K, NodeRef<K, V>)> = node.read(|n| {
                    n.entries()
                        .iter()
                        .filter_map(|e| match &e.payload {
                            Payload::Child(child) => Some((e.key.clone(), Arc::clone(child))),
                            Payload::Value(_) => None,
                        })
                        .collect()
                })?;
                for (key, child) in children.into_iter().rev() {
                    stack.push((child, depth + 1, Some(key)));
                }
            }
        }

        let mut last_key: Option<K> = None;
        for (i, leaf) in leaves.iter().enumerate() {
            let (next, first, last) = leaf.read(|n| {
                (
                    n.next().map(|next| next.id()),
                    n.min_key().cloned(),
                    n.entries().last().map(|e| e.key.clone()),
                )
            })?;
            if next != leaves.get(i + 1).map(|l| l.id()) {
                return Err(BTreeError::Corrupt(format!(
                    "leaf {} links to {next:?} out of order",
                    leaf.id()
                )));
            }
            if let (Some(previous), Some(first)) = (&last_key, &first) {
                if previous >= first {
                    return Err(BTreeError::Corrupt(format!(
                        "leaf {} overlaps its predecessor",
                        leaf.id()
                    )));
                }
            }
            if last.is_some() {
                last_key = last;
            }
        }
        Ok(shape)
    }

    /// Move split-off entries into a new sibling of `node`.
    ///
    /// Returns the separator key and the sibling to insert into the parent.
    fn spill(
        &self,
        node: &NodeRef<K, V>,
        split: Split<K, V>,
        txn: &mut Txn,
    ) -> Result<(K, NodeRef<K, V>), BTreeError> {
        let separator = split.min_key().cloned().ok_or(NodeError::MissingEntry(0))?;
        let is_leaf = node.read(TreeNode::is_leaf)?;
        let Split { entries, next } = split;
        let moved = entries.len();

        let sibling = if is_leaf {
            let sibling = self.cache.create(TreeNode::leaf(entries, next), txn)?;
            node.update(txn, |n| n.set_next(Some(Arc::clone(&sibling))))?;
            sibling
        } else {
            self.cache.create(TreeNode::internal(entries), txn)?
        };
        tracing::debug!(
            "Split {} node {}: moved {moved} entries to {}",
            if is_leaf { "leaf" } else { "internal" },
            node.id(),
            sibling.id()
        );
        Ok((separator, sibling))
    }

    async fn header(&self) -> Result<TreeHeader, BTreeError> {
        self.header.ensure_materialized().await?;
        Ok(self.header.read(|h| *h)?)
    }

    async fn root(&self) -> Result<NodeRef<K, V>, BTreeError> {
        Ok(self.cache.resolve(self.header().await?.root))
    }

    /// Descend to the leaf that would hold `key`, or the leftmost leaf.
    async fn leaf_for(&self, key: Option<&K>) -> Result<NodeRef<K, V>, BTreeError> {
        let mut current = self.root().await?;
        loop {
            current.load_for_read();
            current.ensure_materialized().await?;
            let child = current.read(|n| -> Result<Option<NodeRef<K, V>>, NodeError> {
                if n.is_leaf() {
                    return Ok(None);
                }
                let index = key.map_or(0, |key| n.child_index(key));
                n.child_at(index).map(Some)
            })??;
            match child {
                Some(child) => current = child,
                None => return Ok(current),
            }
        }
    }
}

impl<K: IndexKey + Debug, V: IndexValue + Debug> BTree<K, V> {
    /// Render the tree one node per line, children indented under parents.
    pub async fn dump(&self) -> Result<String, BTreeError> {
        let mut out = String::new();
        let mut stack = vec![(self.root().await?, 0usize)];
        while let Some((node, depth)) = stack.pop() {
            node.load_for_read();
            node.ensure_materialized().await?;
            let (line, children) = node.read(|n| {
                let mut line = format!(
                    "{:indent$}{} #{}",
                    "",
                    if n.is_leaf() { "leaf" } else { "internal" },
                    node.id(),
                    indent = depth * 2
                );
                let keys: Vec<String> = n
                    .entries()
                    .iter()
                    .map(|e| match &e.payload {
                        Payload::Value(Some(value)) => format!("{:?}={value:?}", e.key),
                        Payload::Value(None) => format!("{:?}=<deleted>", e.key),
                        Payload::Child(child) => format!("{:?}->#{}", e.key, child.id()),
                    })
                    .collect();
                let _ = write!(line, " [{}]", keys.join(", "));
                if let Some(next) = n.next() {
                    let _ = write!(line, " next=#{}", next.id());
                }
                (line, n.children())
            })?;
            out.push_str(&line);
            out.push('\n');
            for child in children.into_iter().rev() {
                stack.push((child, depth + 1));
            }
        }
        Ok(out)
    }
}

/// Summary returned by [`BTree::verify`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TreeShape {
    pub height: u32,
    pub internal_nodes: usize,
    pub leaves: usize,
    /// Leaf entries, tombstones included.
    pub entries: usize,
    /// Fewest entries in any non-root node.
    pub min_fill: Option<usize>,
    /// Most entries in any node.
    pub max_fill: usize,
}

/// Walks the leaf chain one snapshot at a time.
struct LeafWalker<K: IndexKey, V: IndexValue> {
    entries: std::vec::IntoIter<(K, Option<V>)>,
    next: Option<NodeRef<K, V>>,
}

impl<K: IndexKey, V: IndexValue> LeafWalker<K, V> {
    fn empty() -> Self {
        Self {
            entries: Vec::new().into_iter(),
            next: None,
        }
    }

    async fn start(leaf: NodeRef<K, V>, from: Option<&K>) -> Result<Self, BTreeError> {
        leaf.ensure_materialized().await?;
        let (entries, next) = leaf.read(|n| n.snapshot_from(from))?;
        Ok(Self {
            entries: entries.into_iter(),
            next,
        })
    }

    async fn advance(&mut self) -> Result<Option<(K, Option<V>)>, BTreeError> {
        loop {
            if let Some(entry) = self.entries.next() {
                return Ok(Some(entry));
            }
            let Some(leaf) = self.next.take() else {
                return Ok(None);
            };
            leaf.load_for_read();
            leaf.ensure_materialized().await?;
            let (entries, next) = leaf.read(|n| n.snapshot_from(None))?;
            self.entries = entries.into_iter();
            self.next = next;
        }
    }
}

/// Forward-only cursor over the values of a key range.
pub struct RangeCursor<K: IndexKey, V: IndexValue> {
    walker: LeafWalker<K, V>,
    to: K,
    done: bool,
}

impl<K: IndexKey, V: IndexValue> RangeCursor<K, V> {
    /// The next live entry in the range.
    pub async fn next_entry(&mut self) -> Result<Option<(K, V)>, BTreeError> {
        while !self.done {
            match self.walker.advance().await? {
                Some((key, _)) if key > self.to => self.done = true,
                Some((key, Some(value))) => return Ok(Some((key, value))),
                Some((_, None)) => {}
                None => self.done = true,
            }
        }
        Ok(None)
    }

    /// The next value in the range.
    pub async fn next(&mut self) -> Result<Option<V>, BTreeError> {
        Ok(self.next_entry().await?.map(|(_, value)| value))
    }

    /// Drain the remaining values.
    pub async fn collect(mut self) -> Result<Vec<V>, BTreeError> {
        let mut values = Vec::new();
        while let Some(value) = self.next().await? {
            values.push(value);
        }
        Ok(values)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<V, BTreeError>> {
        futures::stream::try_unfold(self, |mut cursor| async move {
            Ok(cursor.next().await?.map(|value| (value, cursor)))
        })
    }
}

/// Forward-only cursor over every live key.
pub struct KeyCursor<K: IndexKey, V: IndexValue> {
    walker: LeafWalker<K, V>,
}

impl<K: IndexKey, V: IndexValue> KeyCursor<K, V> {
    pub async fn next(&mut self) -> Result<Option<K>, BTreeError> {
        loop {
            match self.walker.advance().await? {
                Some((key, Some(_))) => return Ok(Some(key)),
                Some((_, None)) => {}
                None => return Ok(None),
            }
        }
    }

    /// Drain the remaining keys.
    pub async fn collect(mut self) -> Result<Vec<K>, BTreeError> {
        let mut keys = Vec::new();
        while let Some(key) = self.next().await? {
            keys.push(key);
        }
        Ok(keys)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<K, BTreeError>> {
        futures::stream::try_unfold(self, |mut cursor| async move {
            Ok(cursor.next().await?.map(|key| (key, cursor)))
        })
    }
}

/// Errors that can occur during B-tree operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BTreeError {
    /// A node or header could not be materialized.
    Handle(HandleError),
    /// Node error.
    Node(NodeError),
    /// The grid refused an allocation.
    Grid(GridError),
    /// The configuration cannot describe a tree.
    Config(ConfigError),
    /// A structural invariant does not hold.
    Corrupt(String),
}

impl std::fmt::Display for BTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handle(e) => write!(f, "handle error: {e}"),
            Self::Node(e) => write!(f, "node error: {e}"),
            Self::Grid(e) => write!(f, "grid error: {e}"),
            Self::Config(e) => write!(f, "config error: {e}"),
            Self::Corrupt(msg) => write!(f, "corrupt tree: {msg}"),
        }
    }
}

impl std::error::Error for BTreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Handle(e) => Some(e),
            Self::Node(e) => Some(e),
            Self::Grid(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Corrupt(_) => None,
        }
    }
}

impl From<HandleError> for BTreeError {
    fn from(e: HandleError) -> Self {
        Self::Handle(e)
    }
}

impl From<NodeError> for BTreeError {
    fn from(e: NodeError) -> Self {
        Self::Node(e)
    }
}

impl From<GridError> for BTreeError {
    fn from(e: GridError) -> Self {
        Self::Grid(e)
    }
}

impl From<ConfigError> for BTreeError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::MemoryGrid;
    use futures::TryStreamExt;

    fn context(grid: &MemoryGrid) -> GridContext {
        GridContext::new(Arc::new(grid.clone()), IndexConfig::default()).expect("valid config")
    }

    async fn tree_with(ctx: &GridContext, keys: impl IntoIterator<Item = u64>) -> BTree<u64, String> {
        let mut txn = Txn::begin(ctx);
        let tree = BTree::create(ctx, &mut txn).expect("create tree");
        for k in keys {
            tree.put(k, Some(format!("value_{k}")), &mut txn)
                .await
                .expect("put");
        }
        txn.commit().await.expect("commit");
        tree
    }

    #[tokio::test]
    async fn test_empty_tree() {
        let grid = MemoryGrid::new();
        let ctx = context(&grid);
        let tree = tree_with(&ctx, []).await;

        assert_eq!(tree.get(&1).await.expect("get"), None);
        assert_eq!(tree.height().await.expect("height"), 0);
        assert_eq!(tree.count().await.expect("count"), 0);
        assert!(tree.keys().await.expect("keys").collect().await.expect("collect").is_empty());
        // Header and root leaf.
        assert_eq!(grid.record_count(), 2);
    }

    #[tokio::test]
    async fn test_put_get_overwrite() {
        let grid = MemoryGrid::new();
        let ctx = context(&grid);
        let tree = tree_with(&ctx, 0..3).await;

        let mut txn = Txn::begin(&ctx);
        tree.put(1, Some("updated".to_string()), &mut txn)
            .await
            .expect("put");
        txn.commit().await.expect("commit");

        assert_eq!(tree.get(&0).await.expect("get"), Some("value_0".to_string()));
        assert_eq!(tree.get(&1).await.expect("get"), Some("updated".to_string()));
        assert_eq!(tree.get(&3).await.expect("get"), None);
        assert_eq!(tree.count().await.expect("count"), 3);
    }

    #[tokio::test]
    async fn test_root_split_grows_height() {
        let grid = MemoryGrid::new();
        let ctx = context(&grid);
        let tree = tree_with(&ctx, 0..3).await;
        assert_eq!(tree.height().await.expect("height"), 0);

        let mut txn = Txn::begin(&ctx);
        tree.put(3, Some("value_3".to_string()), &mut txn)
            .await
            .expect("put");
        txn.commit().await.expect("commit");

        assert_eq!(tree.height().await.expect("height"), 1);
        let shape = tree.verify().await.expect("verify");
        assert_eq!(shape.leaves, 2);
        assert_eq!(shape.internal_nodes, 1);
        assert_eq!(shape.min_fill, Some(2));
    }

    #[tokio::test]
    async fn test_descending_inserts_keep_separators() {
        let grid = MemoryGrid::new();
        let ctx = context(&grid);
        let tree = tree_with(&ctx, (0..40).rev()).await;

        let shape = tree.verify().await.expect("verify");
        assert_eq!(shape.entries, 40);
        assert!(shape.height >= 2);
        let keys = tree.keys().await.expect("keys").collect().await.expect("collect");
        assert_eq!(keys, (0..40).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_delete_is_a_tombstone() {
        let grid = MemoryGrid::new();
        let ctx = context(&grid);
        let tree = tree_with(&ctx, 0..10).await;

        let mut txn = Txn::begin(&ctx);
        tree.delete(4, &mut txn).await.expect("delete");
        tree.delete(42, &mut txn).await.expect("delete absent");
        txn.commit().await.expect("commit");

        assert_eq!(tree.get(&4).await.expect("get"), None);
        assert_eq!(tree.get(&42).await.expect("get"), None);
        assert_eq!(tree.count().await.expect("count"), 9);
        let keys = tree.keys().await.expect("keys").collect().await.expect("collect");
        assert!(!keys.contains(&4));
        // Tombstones stay in the leaves.
        assert_eq!(tree.verify().await.expect("verify").entries, 11);

        let values = tree.range(&3, &5).await.expect("range").collect().await.expect("collect");
        assert_eq!(values, vec!["value_3".to_string(), "value_5".to_string()]);
    }

    #[tokio::test]
    async fn test_range_bounds() {
        let grid = MemoryGrid::new();
        let ctx = context(&grid);
        let tree = tree_with(&ctx, (0..20).map(|k| k * 10)).await;

        let expect = |from: u64, to: u64| -> Vec<String> {
            (0..20)
                .map(|k| k * 10)
                .filter(|k| (from..=to).contains(k))
                .map(|k| format!("value_{k}"))
                .collect()
        };
        for (from, to) in [(0, 190), (20, 40), (25, 35), (35, 39), (190, 500), (0, 0), (191, 999)] {
            let values = tree
                .range(&from, &to)
                .await
                .expect("range")
                .collect()
                .await
                .expect("collect");
            assert_eq!(values, expect(from, to), "range {from}..={to}");
        }
    }

    #[tokio::test]
    async fn test_range_starts_at_each_leaf_boundary() {
        let grid = MemoryGrid::new();
        let ctx = context(&grid);
        let tree = tree_with(&ctx, 0..30).await;

        for from in 0..30u64 {
            let mut cursor = tree.range(&from, &(from + 1)).await.expect("range");
            assert_eq!(
                cursor.next_entry().await.expect("next").map(|(k, _)| k),
                Some(from),
                "first key from {from}"
            );
        }
    }

    #[tokio::test]
    async fn test_inverted_range_is_empty() {
        let grid = MemoryGrid::new();
        let ctx = context(&grid);
        let tree = tree_with(&ctx, 0..10).await;

        let mut cursor = tree.range(&7, &3).await.expect("range");
        assert_eq!(cursor.next().await.expect("next"), None);
    }

    #[tokio::test]
    async fn test_oversized_entry_rejected_without_effect() {
        let grid = MemoryGrid::new();
        let config = IndexConfig {
            max_node_bytes: 415,
            ..IndexConfig::default()
        };
        let ctx = GridContext::new(Arc::new(grid.clone()), config).expect("valid config");
        let tree = tree_with(&ctx, 0..2).await;

        let mut txn = Txn::begin(&ctx);
        let result = tree.put(9, Some("x".repeat(200)), &mut txn).await;
        assert!(matches!(
            result,
            Err(BTreeError::Node(NodeError::EntryTooLarge { limit: 100, .. }))
        ));
        assert_eq!(txn.changed_count(), 0);

        // An entry right at the limit fits.
        tree.put(9, Some("x".repeat(100 - 8 - 1 - 4)), &mut txn)
            .await
            .expect("put at limit");
        txn.commit().await.expect("commit");
        assert_eq!(tree.count().await.expect("count"), 3);
    }

    #[tokio::test]
    async fn test_aborted_split_leaves_handle_usable() {
        let grid = MemoryGrid::new();
        let ctx = context(&grid);
        let tree = tree_with(&ctx, 0..3).await;

        let mut txn = Txn::begin(&ctx);
        tree.put(100, Some("value_100".to_string()), &mut txn)
            .await
            .expect("put");
        assert_eq!(tree.height().await.expect("height"), 1);
        txn.abort().expect("abort");

        assert_eq!(tree.get(&100).await.expect("get"), None);
        assert_eq!(tree.get(&1).await.expect("get"), Some("value_1".to_string()));
        assert_eq!(tree.height().await.expect("height"), 0);

        let mut txn = Txn::begin(&ctx);
        tree.put(1, Some("one".to_string()), &mut txn)
            .await
            .expect("put after abort");
        tree.put(100, Some("value_100".to_string()), &mut txn)
            .await
            .expect("split after abort");
        txn.commit().await.expect("commit");

        assert_eq!(tree.get(&1).await.expect("get"), Some("one".to_string()));
        assert_eq!(tree.count().await.expect("count"), 4);
        assert_eq!(tree.verify().await.expect("verify").height, 1);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_handle_usable() {
        let grid = MemoryGrid::new();
        let ctx = context(&grid);
        let tree = tree_with(&ctx, 0..3).await;

        grid.set_fail_commits(true);
        let mut txn = Txn::begin(&ctx);
        for k in 3..12 {
            tree.put(k, Some(format!("value_{k}")), &mut txn)
                .await
                .expect("put");
        }
        assert!(txn.commit().await.is_err());
        grid.set_fail_commits(false);

        assert_eq!(tree.height().await.expect("height"), 0);
        assert_eq!(tree.count().await.expect("count"), 3);
        assert_eq!(tree.get(&5).await.expect("get"), None);
    }

    #[test]
    fn test_capacity_beyond_header_range_is_rejected() {
        let config = IndexConfig {
            node_capacity: 65_536,
            ..IndexConfig::default()
        };
        let result = GridContext::new(Arc::new(MemoryGrid::new()), config);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[tokio::test]
    async fn test_reopen_by_identity() {
        let grid = MemoryGrid::new();
        let ctx = context(&grid);
        let tree = tree_with(&ctx, 0..25).await;

        let reopened: BTree<u64, String> = BTree::open(&ctx, tree.id());
        for k in 0..25 {
            assert_eq!(
                reopened.get(&k).await.expect("get"),
                Some(format!("value_{k}"))
            );
        }
        assert_eq!(reopened.verify().await.expect("verify"), tree.verify().await.expect("verify"));
    }

    #[tokio::test]
    async fn test_uncommitted_puts_are_invisible_to_other_readers() {
        let grid = MemoryGrid::new();
        let ctx = context(&grid);
        let tree = tree_with(&ctx, 0..2).await;

        let mut txn = Txn::begin(&ctx);
        tree.put(5, Some("value_5".to_string()), &mut txn)
            .await
            .expect("put");

        let reader: BTree<u64, String> = BTree::open(&ctx, tree.id());
        assert_eq!(reader.get(&5).await.expect("get"), None);
        txn.abort().expect("abort");
    }

    #[tokio::test]
    async fn test_streams() {
        let grid = MemoryGrid::new();
        let ctx = context(&grid);
        let tree = tree_with(&ctx, 0..12).await;

        let keys: Vec<u64> = tree
            .keys()
            .await
            .expect("keys")
            .into_stream()
            .try_collect()
            .await
            .expect("stream");
        assert_eq!(keys, (0..12).collect::<Vec<_>>());

        let values: Vec<String> = tree
            .range(&10, &20)
            .await
            .expect("range")
            .into_stream()
            .try_collect()
            .await
            .expect("stream");
        assert_eq!(values, vec!["value_10".to_string(), "value_11".to_string()]);
    }

    #[tokio::test]
    async fn test_dump() {
        let grid = MemoryGrid::new();
        let ctx = context(&grid);
        let tree = tree_with(&ctx, 0..4).await;

        let mut txn = Txn::begin(&ctx);
        tree.delete(1, &mut txn).await.expect("delete");
        txn.commit().await.expect("commit");

        let dump = tree.dump().await.expect("dump");
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("internal #"));
        assert!(lines[1].starts_with("  leaf #"));
        assert!(lines[1].contains("1=<deleted>"));
        assert!(lines[1].contains("next=#"));
        assert!(lines[2].contains("3=\"value_3\""));
    }

    #[tokio::test]
    async fn test_destroy_removes_every_record() {
        let grid = MemoryGrid::new();
        let ctx = context(&grid);
        let tree = tree_with(&ctx, 0..20).await;
        let records = grid.record_count();

        let mut txn = Txn::begin(&ctx);
        let marked = tree.destroy(&mut txn).await.expect("destroy");
        assert_eq!(marked, records);
        assert_eq!(txn.deleted_count(), records);
        txn.commit().await.expect("commit");
        assert_eq!(grid.record_count(), 0);
    }

    #[test]
    fn test_header_rejects_bad_capacity() {
        let mut bytes = Vec::new();
        7u64.encode(&mut bytes);
        0u32.encode(&mut bytes);
        3u16.encode(&mut bytes);
        seal(&mut bytes);
        assert!(matches!(
            TreeHeader::decode(&bytes, &()),
            Err(CodecError::Malformed(_))
        ));
    }
}
