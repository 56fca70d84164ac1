//! Tree node types and serialization.
//!
//! A node is an ordered array of entries. Leaf entries carry a value slot
//! (`None` is a tombstone); internal entries carry a reference to a child
//! whose minimum key equals the entry key. Leaves are singly linked
//! left-to-right through `next` for ordered scans.
//!
//! Node layout (little-endian):
//! - `kind`: 1 byte (0 = internal, 1 = leaf)
//! - `count`: 2 bytes
//! - `next`: 8 bytes (next leaf id, 0 if none)
//! - entries
//! - checksum: 4 bytes (CRC32 of everything before it)
//!
//! Leaf entry: key, presence byte, value if present.
//! Internal entry: key, child id (8 bytes).

#![allow(clippy::cast_possible_truncation)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::grid::{GridError, NodeId};
use crate::structures::codec::{CHECKSUM_SIZE, Codec, CodecError, seal, unseal};
use crate::structures::persistent::{GridContext, Persistable, Persistent};
use crate::structures::txn::Txn;

/// Fixed bytes per node: kind, count, next link and checksum.
pub const NODE_OVERHEAD: usize = 1 + 2 + 8 + CHECKSUM_SIZE;

/// Size of an encoded child reference.
const CHILD_REF_SIZE: usize = 8;

/// Number of tracked handles past which dead cache entries are pruned.
const PRUNE_THRESHOLD: usize = 1024;

/// Bounds for index keys.
pub trait IndexKey: Codec + Ord + Clone + Send + Sync + 'static {}

impl<T: Codec + Ord + Clone + Send + Sync + 'static> IndexKey for T {}

/// Bounds for index values.
pub trait IndexValue: Codec + Clone + Send + Sync + 'static {}

impl<T: Codec + Clone + Send + Sync + 'static> IndexValue for T {}

/// A reference to a node: its identity plus the capability to load it.
pub type NodeRef<K, V> = Arc<Persistent<TreeNode<K, V>>>;

/// Node kind discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeKind {
    Internal = 0,
    Leaf = 1,
}

impl TryFrom<u8> for NodeKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Internal),
            1 => Ok(Self::Leaf),
            _ => Err(value),
        }
    }
}

/// What an entry points at.
pub enum Payload<K: IndexKey, V: IndexValue> {
    /// Leaf value slot. `None` marks a deleted key.
    Value(Option<V>),
    /// Internal child reference.
    Child(NodeRef<K, V>),
}

impl<K: IndexKey, V: IndexValue> Clone for Payload<K, V> {
    fn clone(&self) -> Self {
        match self {
            Self::Value(value) => Self::Value(value.clone()),
            Self::Child(child) => Self::Child(Arc::clone(child)),
        }
    }
}

/// A key and its payload.
pub struct Entry<K: IndexKey, V: IndexValue> {
    pub key: K,
    pub payload: Payload<K, V>,
}

impl<K: IndexKey, V: IndexValue> Clone for Entry<K, V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            payload: self.payload.clone(),
        }
    }
}

impl<K: IndexKey, V: IndexValue> Entry<K, V> {
    /// A leaf entry.
    #[must_use]
    pub const fn value(key: K, value: Option<V>) -> Self {
        Self {
            key,
            payload: Payload::Value(value),
        }
    }

    /// An internal entry.
    #[must_use]
    pub const fn child(key: K, child: NodeRef<K, V>) -> Self {
        Self {
            key,
            payload: Payload::Child(child),
        }
    }

    fn encoded_len(&self) -> usize {
        self.key.encoded_len()
            + match &self.payload {
                Payload::Value(Some(value)) => 1 + value.encoded_len(),
                Payload::Value(None) => 1,
                Payload::Child(_) => CHILD_REF_SIZE,
            }
    }
}

/// Result of routing a key through one node.
pub enum Step<K: IndexKey, V: IndexValue> {
    /// Reached a leaf; `None` if the key is absent or deleted.
    Found(Option<V>),
    /// Continue into this child.
    Descend(NodeRef<K, V>),
}

/// Entries moved out of a node that reached capacity.
pub struct Split<K: IndexKey, V: IndexValue> {
    /// Upper half of the entries.
    pub entries: Vec<Entry<K, V>>,
    /// The split node's former successor (leaves only).
    pub next: Option<NodeRef<K, V>>,
}

impl<K: IndexKey, V: IndexValue> Split<K, V> {
    /// Minimum key of the moved entries.
    #[must_use]
    pub fn min_key(&self) -> Option<&K> {
        self.entries.first().map(|e| &e.key)
    }
}

/// A B-tree node.
pub struct TreeNode<K: IndexKey, V: IndexValue> {
    kind: NodeKind,
    entries: Vec<Entry<K, V>>,
    next: Option<NodeRef<K, V>>,
}

impl<K: IndexKey, V: IndexValue> TreeNode<K, V> {
    /// An empty leaf.
    #[must_use]
    pub const fn empty_leaf() -> Self {
        Self {
            kind: NodeKind::Leaf,
            entries: Vec::new(),
            next: None,
        }
    }

    /// A leaf holding `entries`, linked to `next`.
    #[must_use]
    pub const fn leaf(entries: Vec<Entry<K, V>>, next: Option<NodeRef<K, V>>) -> Self {
        Self {
            kind: NodeKind::Leaf,
            entries,
            next,
        }
    }

    /// An internal node holding `entries`.
    #[must_use]
    pub const fn internal(entries: Vec<Entry<K, V>>) -> Self {
        Self {
            kind: NodeKind::Internal,
            entries,
            next: None,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> NodeKind {
        self.kind
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[Entry<K, V>] {
        &self.entries
    }

    /// The next leaf in the chain.
    #[must_use]
    pub fn next(&self) -> Option<NodeRef<K, V>> {
        self.next.clone()
    }

    #[must_use]
    pub fn min_key(&self) -> Option<&K> {
        self.entries.first().map(|e| &e.key)
    }

    /// Index of the first entry whose key is >= `key`.
    #[must_use]
    pub fn find_slot(&self, key: &K) -> usize {
        self.entries.partition_point(|e| e.key < *key)
    }

    /// Index of the last entry whose key is <= `key`, or 0 when `key` is
    /// below every entry.
    #[must_use]
    pub fn child_index(&self, key: &K) -> usize {
        self.entries
            .partition_point(|e| e.key <= *key)
            .saturating_sub(1)
    }

    /// Child reference stored at `index`.
    pub fn child_at(&self, index: usize) -> Result<NodeRef<K, V>, NodeError> {
        match self.entries.get(index).map(|e| &e.payload) {
            Some(Payload::Child(child)) => Ok(Arc::clone(child)),
            Some(Payload::Value(_)) => Err(NodeError::UnexpectedPayload {
                expected: NodeKind::Internal,
            }),
            None => Err(NodeError::MissingEntry(index)),
        }
    }

    /// Every child reference, in key order.
    #[must_use]
    pub fn children(&self) -> Vec<NodeRef<K, V>> {
        self.entries
            .iter()
            .filter_map(|e| match &e.payload {
                Payload::Child(child) => Some(Arc::clone(child)),
                Payload::Value(_) => None,
            })
            .collect()
    }

    /// Route `key` one level down.
    pub fn step(&self, key: &K) -> Result<Step<K, V>, NodeError> {
        match self.kind {
            NodeKind::Leaf => {
                let slot = self.find_slot(key);
                let found = match self.entries.get(slot) {
                    Some(Entry {
                        key: found,
                        payload: Payload::Value(value),
                    }) if found == key => value.clone(),
                    _ => None,
                };
                Ok(Step::Found(found))
            }
            NodeKind::Internal => {
                if self.entries.is_empty() {
                    return Err(NodeError::MissingEntry(0));
                }
                Ok(Step::Descend(self.child_at(self.child_index(key))?))
            }
        }
    }

    /// Leaf entries with key >= `from` (all entries when `from` is `None`),
    /// plus the next leaf.
    #[must_use]
    pub fn snapshot_from(&self, from: Option<&K>) -> (Vec<(K, Option<V>)>, Option<NodeRef<K, V>>) {
        let start = from.map_or(0, |key| self.find_slot(key));
        let entries = self.entries[start..]
            .iter()
            .filter_map(|e| match &e.payload {
                Payload::Value(value) => Some((e.key.clone(), value.clone())),
                Payload::Child(_) => None,
            })
            .collect();
        (entries, self.next())
    }

    /// Lower the key of the first entry to `key` if `key` is smaller.
    pub fn lower_min_key(&mut self, key: &K) {
        if let Some(first) = self.entries.first_mut() {
            if *key < first.key {
                first.key = key.clone();
            }
        }
    }

    /// Replace or insert a leaf value. Splits when the node reaches
    /// `capacity` entries.
    pub fn upsert(&mut self, key: K, value: Option<V>, capacity: usize) -> Option<Split<K, V>> {
        let slot = self.find_slot(&key);
        match self.entries.get_mut(slot) {
            Some(existing) if existing.key == key => {
                existing.payload = Payload::Value(value);
                None
            }
            _ => {
                self.entries.insert(slot, Entry::value(key, value));
                self.split_if_full(capacity)
            }
        }
    }

    /// Insert a child entry at `index`. Splits when the node reaches
    /// `capacity` entries.
    pub fn insert_child(
        &mut self,
        index: usize,
        key: K,
        child: NodeRef<K, V>,
        capacity: usize,
    ) -> Option<Split<K, V>> {
        self.entries.insert(index, Entry::child(key, child));
        self.split_if_full(capacity)
    }

    /// Link this leaf to `next`.
    pub fn set_next(&mut self, next: Option<NodeRef<K, V>>) {
        self.next = next;
    }

    fn split_if_full(&mut self, capacity: usize) -> Option<Split<K, V>> {
        if self.entries.len() < capacity {
            return None;
        }
        let entries = self.entries.split_off(self.entries.len() / 2);
        Some(Split {
            entries,
            next: self.next.take(),
        })
    }
}

impl<K: IndexKey, V: IndexValue> Persistable for TreeNode<K, V> {
    type Resolver = NodeCache<K, V>;

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        (self.kind as u8).encode(&mut out);
        (self.entries.len() as u16).encode(&mut out);
        self.next.as_ref().map_or(0, |next| next.id()).encode(&mut out);
        for entry in &self.entries {
            entry.key.encode(&mut out);
            match &entry.payload {
                Payload::Value(Some(value)) => {
                    1u8.encode(&mut out);
                    value.encode(&mut out);
                }
                Payload::Value(None) => 0u8.encode(&mut out),
                Payload::Child(child) => child.id().encode(&mut out),
            }
        }
        seal(&mut out);
        out
    }

    fn decode(bytes: &[u8], cache: &NodeCache<K, V>) -> Result<Self, CodecError> {
        let mut input = unseal(bytes)?;
        let tag = u8::decode(&mut input)?;
        let kind = NodeKind::try_from(tag).map_err(|tag| CodecError::InvalidTag {
            field: "node kind",
            tag,
        })?;
        let count = u16::decode(&mut input)? as usize;
        let next_id = u64::decode(&mut input)?;

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key = K::decode(&mut input)?;
            let payload = match kind {
                NodeKind::Leaf => match u8::decode(&mut input)? {
                    0 => Payload::Value(None),
                    1 => Payload::Value(Some(V::decode(&mut input)?)),
                    tag => {
                        return Err(CodecError::InvalidTag {
                            field: "value presence",
                            tag,
                        });
                    }
                },
                NodeKind::Internal => Payload::Child(cache.resolve(u64::decode(&mut input)?)),
            };
            entries.push(Entry { key, payload });
        }
        if !input.is_empty() {
            return Err(CodecError::TrailingBytes(input.len()));
        }

        let next = match (kind, next_id) {
            (_, 0) => None,
            (NodeKind::Leaf, id) => Some(cache.resolve(id)),
            (NodeKind::Internal, id) => {
                return Err(CodecError::Malformed(format!(
                    "internal node links to sibling {id}"
                )));
            }
        };
        if kind == NodeKind::Internal && entries.is_empty() {
            return Err(CodecError::Malformed("internal node without children".to_string()));
        }

        Ok(Self {
            kind,
            entries,
            next,
        })
    }

    fn encoded_len(&self) -> usize {
        NODE_OVERHEAD + self.entries.iter().map(Entry::encoded_len).sum::<usize>()
    }
}

/// Reject entries that could push a full node past the byte budget.
///
/// The same key may later be copied into internal nodes, so the larger of
/// the leaf and internal encodings is checked.
pub fn check_entry_size<K: IndexKey, V: IndexValue>(
    key: &K,
    value: Option<&V>,
    limit: usize,
) -> Result<(), NodeError> {
    let key_len = key.encoded_len();
    let leaf_len = key_len + 1 + value.map_or(0, Codec::encoded_len);
    let size = leaf_len.max(key_len + CHILD_REF_SIZE);
    if size > limit {
        return Err(NodeError::EntryTooLarge { size, limit });
    }
    Ok(())
}

struct CacheState<K: IndexKey, V: IndexValue> {
    nodes: HashMap<NodeId, Weak<Persistent<TreeNode<K, V>>>>,
    prune_at: usize,
}

struct CacheInner<K: IndexKey, V: IndexValue> {
    context: GridContext,
    state: Mutex<CacheState<K, V>>,
}

/// Identity map from node id to the live handle for that node.
///
/// Parents, leaf links and cursors that name the same id share one handle,
/// so a change made through any of them is seen by all. Entries are weak:
/// a node nobody references is dropped and reloaded on next use.
pub struct NodeCache<K: IndexKey, V: IndexValue> {
    inner: Arc<CacheInner<K, V>>,
}

impl<K: IndexKey, V: IndexValue> Clone for NodeCache<K, V> {
    #[allow(clippy::disallowed_methods)] // Arc::clone is safe and expected
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: IndexKey, V: IndexValue> NodeCache<K, V> {
    #[must_use]
    pub fn new(context: GridContext) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                context,
                state: Mutex::new(CacheState {
                    nodes: HashMap::new(),
                    prune_at: PRUNE_THRESHOLD,
                }),
            }),
        }
    }

    #[must_use]
    pub fn context(&self) -> &GridContext {
        &self.inner.context
    }

    /// The live handle for `id`, or a new unloaded one.
    #[must_use]
    pub fn resolve(&self, id: NodeId) -> NodeRef<K, V> {
        let mut state = self.lock();
        if let Some(node) = state.nodes.get(&id).and_then(Weak::upgrade) {
            return node;
        }
        let node = Persistent::unloaded(id, self.inner.context.clone(), self.clone());
        Self::track(&mut state, &node);
        node
    }

    /// Create a new node under `txn`.
    pub fn create(&self, node: TreeNode<K, V>, txn: &mut Txn) -> Result<NodeRef<K, V>, GridError> {
        let node = Persistent::create(node, self.clone(), txn)?;
        Self::track(&mut self.lock(), &node);
        Ok(node)
    }

    /// Number of tracked ids, live or not.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.lock().nodes.len()
    }

    fn track(state: &mut CacheState<K, V>, node: &NodeRef<K, V>) {
        state.nodes.insert(node.id(), Arc::downgrade(node));
        if state.nodes.len() >= state.prune_at {
            state.nodes.retain(|_, weak| weak.strong_count() > 0);
            state.prune_at = PRUNE_THRESHOLD.max(state.nodes.len() * 2);
        }
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn lock(&self) -> MutexGuard<'_, CacheState<K, V>> {
        self.inner.state.lock().expect("lock poisoned")
    }
}

/// Errors that can occur in node operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// An entry can never fit in a node under the byte budget.
    EntryTooLarge { size: usize, limit: usize },
    /// An entry's payload does not match the node kind.
    UnexpectedPayload { expected: NodeKind },
    /// No entry at the given index.
    MissingEntry(usize),
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EntryTooLarge { size, limit } => {
                write!(f, "entry of {size} bytes exceeds the per-entry limit of {limit} bytes")
            }
            Self::UnexpectedPayload { expected } => {
                write!(f, "entry payload does not match {expected:?} node")
            }
            Self::MissingEntry(index) => write!(f, "no entry at index {index}"),
        }
    }
}

impl std::error::Error for NodeError {}
