//! Persistent ordered map backing every cache and index of the replica.
//!
//! Nodes are immutable and reference counted. Every insert or remove copies
//! only the path from the root to the touched node and returns a new map;
//! maps obtained earlier keep pointing at their own root and stay valid.
//! Balancing follows the AVL height rule, so all operations are O(log n).

use std::cmp::Ordering;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

pub type Comparator<K> = Arc<dyn Fn(&K, &K) -> Ordering + Send + Sync>;

/// Tree node. A `Leaf` holds one entry and no children; a `Collection` holds
/// one entry plus at least one non-empty child.
enum Node<K, V> {
    Empty,
    Leaf(Arc<(K, V)>),
    Collection(Arc<Branch<K, V>>),
}

struct Branch<K, V> {
    entry: Arc<(K, V)>,
    left: Node<K, V>,
    right: Node<K, V>,
    height: u32,
    size: usize,
}

impl<K, V> Clone for Node<K, V> {
    fn clone(&self) -> Self {
        match self {
            Node::Empty => Node::Empty,
            Node::Leaf(entry) => Node::Leaf(Arc::clone(entry)),
            Node::Collection(branch) => Node::Collection(Arc::clone(branch)),
        }
    }
}

fn height<K, V>(node: &Node<K, V>) -> u32 {
    match node {
        Node::Empty => 0,
        Node::Leaf(_) => 1,
        Node::Collection(branch) => branch.height,
    }
}

fn size<K, V>(node: &Node<K, V>) -> usize {
    match node {
        Node::Empty => 0,
        Node::Leaf(_) => 1,
        Node::Collection(branch) => branch.size,
    }
}

fn is_empty<K, V>(node: &Node<K, V>) -> bool {
    matches!(node, Node::Empty)
}

/// Clones out the entry and both children of a non-empty node.
fn split<K, V>(node: &Node<K, V>) -> Option<(Arc<(K, V)>, Node<K, V>, Node<K, V>)> {
    match node {
        Node::Empty => None,
        Node::Leaf(entry) => Some((Arc::clone(entry), Node::Empty, Node::Empty)),
        Node::Collection(branch) => Some((
            Arc::clone(&branch.entry),
            branch.left.clone(),
            branch.right.clone(),
        )),
    }
}

fn make<K, V>(entry: Arc<(K, V)>, left: Node<K, V>, right: Node<K, V>) -> Node<K, V> {
    if is_empty(&left) && is_empty(&right) {
        return Node::Leaf(entry);
    }
    let height = height(&left).max(height(&right)) + 1;
    let size = size(&left) + size(&right) + 1;
    Node::Collection(Arc::new(Branch {
        entry,
        left,
        right,
        height,
        size,
    }))
}

fn balance<K, V>(entry: Arc<(K, V)>, left: Node<K, V>, right: Node<K, V>) -> Node<K, V> {
    let left_height = height(&left);
    let right_height = height(&right);

    if left_height > right_height + 1 {
        let Some((pivot, outer, inner)) = split(&left) else {
            return make(entry, left, right);
        };
        if height(&outer) >= height(&inner) {
            return make(pivot, outer, make(entry, inner, right));
        }
        let Some((grand, inner_left, inner_right)) = split(&inner) else {
            return make(pivot, outer, make(entry, inner, right));
        };
        return make(
            grand,
            make(pivot, outer, inner_left),
            make(entry, inner_right, right),
        );
    }

    if right_height > left_height + 1 {
        let Some((pivot, inner, outer)) = split(&right) else {
            return make(entry, left, right);
        };
        if height(&outer) >= height(&inner) {
            return make(pivot, make(entry, left, inner), outer);
        }
        let Some((grand, inner_left, inner_right)) = split(&inner) else {
            return make(pivot, make(entry, left, inner), outer);
        };
        return make(
            grand,
            make(entry, left, inner_left),
            make(pivot, inner_right, outer),
        );
    }

    make(entry, left, right)
}

fn insert<K, V>(node: &Node<K, V>, key: K, value: V, cmp: &Comparator<K>) -> Node<K, V> {
    match split(node) {
        None => Node::Leaf(Arc::new((key, value))),
        Some((entry, left, right)) => match cmp(&key, &entry.0) {
            Ordering::Less => balance(entry, insert(&left, key, value, cmp), right),
            Ordering::Greater => balance(entry, left, insert(&right, key, value, cmp)),
            Ordering::Equal => make(Arc::new((key, value)), left, right),
        },
    }
}

fn remove_min<K, V>(node: &Node<K, V>) -> Option<(Arc<(K, V)>, Node<K, V>)> {
    let (entry, left, right) = split(node)?;
    match remove_min(&left) {
        None => Some((entry, right)),
        Some((min, rest)) => Some((min, balance(entry, rest, right))),
    }
}

fn remove<K, V>(node: &Node<K, V>, key: &K, cmp: &Comparator<K>) -> Node<K, V> {
    let Some((entry, left, right)) = split(node) else {
        return Node::Empty;
    };
    match cmp(key, &entry.0) {
        Ordering::Less => balance(entry, remove(&left, key, cmp), right),
        Ordering::Greater => balance(entry, left, remove(&right, key, cmp)),
        Ordering::Equal => match remove_min(&right) {
            None => left,
            Some((successor, rest)) => balance(successor, left, rest),
        },
    }
}

fn find<'a, K, V>(mut node: &'a Node<K, V>, key: &K, cmp: &Comparator<K>) -> Option<&'a (K, V)> {
    loop {
        match node {
            Node::Empty => return None,
            Node::Leaf(entry) => {
                return (cmp(key, &entry.0) == Ordering::Equal).then_some(entry.as_ref());
            }
            Node::Collection(branch) => match cmp(key, &branch.entry.0) {
                Ordering::Less => node = &branch.left,
                Ordering::Greater => node = &branch.right,
                Ordering::Equal => return Some(branch.entry.as_ref()),
            },
        }
    }
}

/// Immutable ordered map with structural sharing.
pub struct SortedMap<K, V> {
    root: Node<K, V>,
    comparator: Comparator<K>,
}

impl<K, V> Clone for SortedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            comparator: Arc::clone(&self.comparator),
        }
    }
}

impl<K: Ord + 'static, V> SortedMap<K, V> {
    pub fn new() -> Self {
        Self::with_comparator(Arc::new(|left: &K, right: &K| left.cmp(right)))
    }
}

impl<K: Ord + 'static, V> Default for SortedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SortedMap<K, V> {
    pub fn with_comparator(comparator: Comparator<K>) -> Self {
        Self {
            root: Node::Empty,
            comparator,
        }
    }

    pub fn comparator(&self) -> &Comparator<K> {
        &self.comparator
    }

    pub fn len(&self) -> usize {
        size(&self.root)
    }

    pub fn is_empty(&self) -> bool {
        is_empty(&self.root)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        find(&self.root, key, &self.comparator).map(|entry| &entry.1)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Returns a new map with `key` bound to `value`.
    #[must_use]
    pub fn insert(&self, key: K, value: V) -> Self {
        Self {
            root: insert(&self.root, key, value, &self.comparator),
            comparator: Arc::clone(&self.comparator),
        }
    }

    /// Returns a new map without `key`; shares the whole tree when absent.
    #[must_use]
    pub fn remove(&self, key: &K) -> Self {
        if !self.contains_key(key) {
            return self.clone();
        }
        Self {
            root: remove(&self.root, key, &self.comparator),
            comparator: Arc::clone(&self.comparator),
        }
    }

    pub fn first(&self) -> Option<(&K, &V)> {
        let mut node = &self.root;
        let mut found = None;
        loop {
            match node {
                Node::Empty => return found,
                Node::Leaf(entry) => return Some((&entry.0, &entry.1)),
                Node::Collection(branch) => {
                    found = Some((&branch.entry.0, &branch.entry.1));
                    node = &branch.left;
                }
            }
        }
    }

    pub fn last(&self) -> Option<(&K, &V)> {
        let mut node = &self.root;
        let mut found = None;
        loop {
            match node {
                Node::Empty => return found,
                Node::Leaf(entry) => return Some((&entry.0, &entry.1)),
                Node::Collection(branch) => {
                    found = Some((&branch.entry.0, &branch.entry.1));
                    node = &branch.right;
                }
            }
        }
    }

    /// Zero-based rank of `key` in iteration order.
    pub fn position_of(&self, key: &K) -> Option<usize> {
        let mut node = &self.root;
        let mut offset = 0;
        loop {
            match node {
                Node::Empty => return None,
                Node::Leaf(entry) => {
                    return (self.comparator.as_ref()(key, &entry.0) == Ordering::Equal)
                        .then_some(offset);
                }
                Node::Collection(branch) => match self.comparator.as_ref()(key, &branch.entry.0) {
                    Ordering::Less => node = &branch.left,
                    Ordering::Equal => return Some(offset + size(&branch.left)),
                    Ordering::Greater => {
                        offset += size(&branch.left) + 1;
                        node = &branch.right;
                    }
                },
            }
        }
    }

    pub fn iter(&self) -> Iter<'_, K, V> {
        let mut iter = Iter { stack: Vec::new() };
        iter.push_left_spine(&self.root);
        iter
    }

    /// Iterates entries whose key is greater than or equal to `start`.
    pub fn iter_from(&self, start: &K) -> Iter<'_, K, V> {
        let mut iter = Iter { stack: Vec::new() };
        let mut node = &self.root;
        loop {
            match node {
                Node::Empty => break,
                Node::Leaf(entry) => {
                    if self.comparator.as_ref()(start, &entry.0) != Ordering::Greater {
                        iter.stack.push((entry, None));
                    }
                    break;
                }
                Node::Collection(branch) => {
                    if self.comparator.as_ref()(start, &branch.entry.0) != Ordering::Greater {
                        iter.stack.push((&branch.entry, Some(&branch.right)));
                        node = &branch.left;
                    } else {
                        node = &branch.right;
                    }
                }
            }
        }
        iter
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, value)| value)
    }
}

impl<K: Debug, V: Debug> Debug for SortedMap<K, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

pub struct Iter<'a, K, V> {
    stack: Vec<(&'a Arc<(K, V)>, Option<&'a Node<K, V>>)>,
}

impl<'a, K, V> Iter<'a, K, V> {
    fn push_left_spine(&mut self, mut node: &'a Node<K, V>) {
        loop {
            match node {
                Node::Empty => return,
                Node::Leaf(entry) => {
                    self.stack.push((entry, None));
                    return;
                }
                Node::Collection(branch) => {
                    self.stack.push((&branch.entry, Some(&branch.right)));
                    node = &branch.left;
                }
            }
        }
    }
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let (entry, right) = self.stack.pop()?;
        if let Some(right) = right {
            self.push_left_spine(right);
        }
        Some((&entry.0, &entry.1))
    }
}
