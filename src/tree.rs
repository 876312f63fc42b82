// Copyright (c) 2025 ETH Zurich
// Fabian Schuiki <fschuiki@iis.ee.ethz.ch>

//! The configuration tree store.
//!
//! An ordered labeled tree kept in an arena with stable keys. The tree
//! has a single *origin* node that is its own parent; its children are
//! the top-level forest (`augeas`, `files`, ...). A node with no label
//! is hidden from matches and listings.

use std::rc::Rc;

use slotmap::{SlotMap, new_key_type};

use crate::error::{Error, Result};

new_key_type! {
    /// A stable key into the tree arena. Keys are never reused, so a
    /// key held across a removal simply stops resolving.
    pub struct NodeId;
}

/// Byte offsets tying a node to its originating file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Span {
    /// The file the node was parsed from.
    pub filename: Option<Rc<str>>,
    /// Range of the label text; `0..0` if absent.
    pub label_start: usize,
    pub label_end: usize,
    /// Range of the value text; `0..0` if absent.
    pub value_start: usize,
    pub value_end: usize,
    /// Range of the whole node.
    pub span_start: usize,
    pub span_end: usize,
}

/// A node in the tree arena.
#[derive(Debug)]
pub struct Node {
    /// The label; absent only for the origin and freshly spliced
    /// hidden nodes.
    pub label: Option<String>,
    /// The value text, if any.
    pub value: Option<String>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) parent: NodeId,
    pub(crate) dirty: bool,
    /// Span metadata, present when span tracking is enabled.
    pub span: Option<Span>,
}

/// A detached subtree as produced by `get`, before splicing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Fragment {
    pub label: Option<String>,
    pub value: Option<String>,
    pub children: Vec<Fragment>,
    pub span: Option<Span>,
}

impl Fragment {
    /// A fragment with just a label and value.
    pub fn leaf(label: Option<&str>, value: Option<&str>) -> Fragment {
        Fragment {
            label: label.map(str::to_string),
            value: value.map(str::to_string),
            children: Vec::new(),
            span: None,
        }
    }
}

/// The arena-backed tree.
#[derive(Debug)]
pub struct Tree {
    nodes: SlotMap<NodeId, Node>,
    origin: NodeId,
}

impl Tree {
    /// Create a tree holding only the origin.
    pub fn new() -> Tree {
        let mut nodes = SlotMap::with_key();
        let origin = nodes.insert(Node {
            label: None,
            value: None,
            children: Vec::new(),
            parent: NodeId::default(),
            dirty: true,
            span: None,
        });
        nodes[origin].parent = origin;
        Tree { nodes, origin }
    }

    /// The origin node.
    pub fn origin(&self) -> NodeId {
        self.origin
    }

    /// Whether `id` still resolves to a live node.
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Borrow a node.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// The label of a node, if any.
    pub fn label(&self, id: NodeId) -> Option<&str> {
        self.nodes[id].label.as_deref()
    }

    /// The value of a node, if any.
    pub fn value(&self, id: NodeId) -> Option<&str> {
        self.nodes[id].value.as_deref()
    }

    /// The parent of a node; the origin is its own parent.
    pub fn parent(&self, id: NodeId) -> NodeId {
        self.nodes[id].parent
    }

    /// The ordered children of a node.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    /// Whether a node is hidden (has no label).
    pub fn hidden(&self, id: NodeId) -> bool {
        self.nodes[id].label.is_none()
    }

    /// Whether a node has been modified since the last `clean`.
    pub fn dirty(&self, id: NodeId) -> bool {
        self.nodes[id].dirty
    }

    /// The first child with the given label.
    pub fn child(&self, id: NodeId, label: &str) -> Option<NodeId> {
        self.nodes[id]
            .children
            .iter()
            .copied()
            .find(|&c| self.label(c) == Some(label))
    }

    /// The first child with the given label, created if missing.
    pub fn child_or_create(&mut self, id: NodeId, label: &str) -> NodeId {
        match self.child(id, label) {
            Some(c) => c,
            None => self.append(id, Some(label), None),
        }
    }

    /// Resolve a `/`-separated chain of labels below `id`, creating
    /// missing links.
    pub fn path_or_create(&mut self, id: NodeId, path: &str) -> NodeId {
        let mut at = id;
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            at = self.child_or_create(at, seg);
        }
        at
    }

    /// Append a new child and mark the paths to it dirty.
    pub fn append(&mut self, parent: NodeId, label: Option<&str>, value: Option<&str>) -> NodeId {
        let id = self.nodes.insert(Node {
            label: label.map(str::to_string),
            value: value.map(str::to_string),
            children: Vec::new(),
            parent,
            dirty: false,
            span: None,
        });
        self.nodes[parent].children.push(id);
        self.mark_dirty(id);
        id
    }

    /// Insert a new sibling with `label` before or after `sibling`.
    pub fn insert_sibling(&mut self, sibling: NodeId, label: &str, before: bool) -> Result<NodeId> {
        if label.contains('/') {
            return Err(Error::Label(label.to_string()));
        }
        let parent = self.parent(sibling);
        if sibling == self.origin {
            return Err(Error::internal("cannot insert a sibling of the origin"));
        }
        let id = self.nodes.insert(Node {
            label: Some(label.to_string()),
            value: None,
            children: Vec::new(),
            parent,
            dirty: false,
            span: None,
        });
        let pos = self.nodes[parent]
            .children
            .iter()
            .position(|&c| c == sibling)
            .expect("sibling not listed in its parent");
        let pos = if before { pos } else { pos + 1 };
        self.nodes[parent].children.insert(pos, id);
        self.mark_dirty(id);
        Ok(id)
    }

    /// Set the value of a node. Setting the current value again is a
    /// no-op and does not dirty the tree.
    pub fn set_value(&mut self, id: NodeId, value: Option<&str>) {
        if self.nodes[id].value.as_deref() == value {
            return;
        }
        self.nodes[id].value = value.map(str::to_string);
        self.mark_dirty(id);
    }

    /// Change the label of a node. Labels may not contain `/`.
    pub fn rename(&mut self, id: NodeId, label: &str) -> Result<()> {
        if label.contains('/') {
            return Err(Error::Label(label.to_string()));
        }
        self.nodes[id].label = Some(label.to_string());
        self.mark_dirty(id);
        Ok(())
    }

    /// Mark a node and all its ancestors dirty, stopping at the first
    /// node that already is.
    pub fn mark_dirty(&mut self, id: NodeId) {
        let mut at = id;
        while !self.nodes[at].dirty {
            self.nodes[at].dirty = true;
            at = self.nodes[at].parent;
        }
    }

    /// Recursively clear the dirty bits below and including `id`.
    pub fn clean(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(at) = stack.pop() {
            self.nodes[at].dirty = false;
            stack.extend_from_slice(&self.nodes[at].children);
        }
    }

    /// Sever a node from its parent and free the subtree. The node is
    /// unlinked before its children are freed. Returns the number of
    /// nodes removed.
    pub fn unlink(&mut self, id: NodeId) -> usize {
        assert!(id != self.origin, "cannot unlink the origin");
        let parent = self.parent(id);
        self.nodes[parent].children.retain(|&c| c != id);
        self.mark_dirty(parent);
        self.free(id)
    }

    /// Remove all children of a node.
    pub fn unlink_children(&mut self, id: NodeId) -> usize {
        let children = std::mem::take(&mut self.nodes[id].children);
        if !children.is_empty() {
            self.mark_dirty(id);
        }
        children.into_iter().map(|c| self.free(c)).sum()
    }

    fn free(&mut self, id: NodeId) -> usize {
        let mut count = 0;
        let mut stack = vec![id];
        while let Some(at) = stack.pop() {
            let node = self.nodes.remove(at).expect("freeing a dead node");
            stack.extend(node.children);
            count += 1;
        }
        count
    }

    /// Move `node` (already a sibling of `reference`) directly in
    /// front of `reference`.
    pub fn place_before(&mut self, node: NodeId, reference: NodeId) {
        let parent = self.parent(node);
        assert_eq!(
            parent,
            self.parent(reference),
            "place_before across parents"
        );
        self.nodes[parent].children.retain(|&c| c != node);
        let pos = self.nodes[parent]
            .children
            .iter()
            .position(|&c| c == reference)
            .expect("reference vanished from its parent");
        self.nodes[parent].children.insert(pos, node);
        self.mark_dirty(node);
    }

    /// Reparent all children of `from` onto `to`, keeping their
    /// order; returns how many moved.
    pub fn move_children(&mut self, from: NodeId, to: NodeId) -> usize {
        let children = std::mem::take(&mut self.nodes[from].children);
        let count = children.len();
        for &c in &children {
            self.nodes[c].parent = to;
        }
        self.nodes[to].children.extend(children);
        if count > 0 {
            self.mark_dirty(to);
        }
        self.mark_dirty(from);
        count
    }

    /// Whether `node` is `ancestor` or one of its descendants.
    pub fn is_self_or_descendant(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut at = node;
        loop {
            if at == ancestor {
                return true;
            }
            if at == self.origin {
                return false;
            }
            at = self.parent(at);
        }
    }

    /// Graft a detached fragment as the last child of `parent`.
    pub fn graft(&mut self, parent: NodeId, frag: Fragment) -> NodeId {
        let id = self.append(parent, frag.label.as_deref(), frag.value.as_deref());
        self.nodes[id].span = frag.span;
        for child in frag.children {
            self.graft(id, child);
        }
        id
    }

    /// The 1-based position of `id` among its equally-labeled
    /// siblings, and the count of those siblings.
    fn sibling_index(&self, id: NodeId) -> (usize, usize) {
        let parent = self.parent(id);
        let label = self.label(id);
        let mut index = 0;
        let mut count = 0;
        for &c in &self.nodes[parent].children {
            if self.label(c) == label {
                count += 1;
                if c == id {
                    index = count;
                }
            }
        }
        (index, count)
    }

    /// The canonical path of a node, with positional indices where a
    /// label repeats among siblings.
    pub fn path_of(&self, id: NodeId) -> String {
        let mut segs: Vec<String> = Vec::new();
        let mut at = id;
        while at != self.origin {
            let label = self.label(at).unwrap_or("(none)");
            let (index, count) = self.sibling_index(at);
            if count > 1 {
                segs.push(format!("{}[{}]", label, index));
            } else {
                segs.push(label.to_string());
            }
            at = self.parent(at);
        }
        segs.reverse();
        format!("/{}", segs.join("/"))
    }

    /// Structural equality of two subtrees, including child order.
    pub fn equal(&self, a: NodeId, b: NodeId) -> bool {
        let na = &self.nodes[a];
        let nb = &self.nodes[b];
        na.label == nb.label
            && na.value == nb.value
            && na.children.len() == nb.children.len()
            && na
                .children
                .iter()
                .zip(nb.children.iter())
                .all(|(&ca, &cb)| self.equal(ca, cb))
    }

    /// Attach span metadata to a node.
    pub fn set_span(&mut self, id: NodeId, span: Option<Span>) {
        self.nodes[id].span = span;
    }
}

impl Default for Tree {
    fn default() -> Tree {
        Tree::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Tree, NodeId, NodeId, NodeId) {
        let mut t = Tree::new();
        let files = t.append(t.origin(), Some("files"), None);
        let a = t.append(files, Some("a"), Some("1"));
        let b = t.append(files, Some("b"), Some("2"));
        (t, files, a, b)
    }

    #[test]
    fn dirty_propagates_and_stops() {
        let (mut t, files, a, _) = sample();
        let origin = t.origin();
        t.clean(origin);
        assert!(!t.dirty(files));
        t.set_value(a, Some("10"));
        assert!(t.dirty(a));
        assert!(t.dirty(files));
        assert!(t.dirty(origin));
    }

    #[test]
    fn set_same_value_does_not_dirty() {
        let (mut t, _, a, _) = sample();
        t.clean(t.origin());
        t.set_value(a, Some("1"));
        assert!(!t.dirty(a));
    }

    #[test]
    fn unlink_counts_and_severs() {
        let (mut t, files, a, b) = sample();
        let sub = t.append(a, Some("sub"), None);
        assert!(t.contains(sub));
        assert_eq!(t.unlink(a), 2);
        assert!(!t.contains(a));
        assert!(!t.contains(sub));
        assert_eq!(t.children(files), &[b]);
    }

    #[test]
    fn paths_get_positional_indices() {
        let (mut t, files, a, _) = sample();
        assert_eq!(t.path_of(a), "/files/a");
        let a2 = t.append(files, Some("a"), None);
        assert_eq!(t.path_of(a), "/files/a[1]");
        assert_eq!(t.path_of(a2), "/files/a[2]");
    }

    #[test]
    fn rename_rejects_slash() {
        let (mut t, _, a, _) = sample();
        assert!(matches!(t.rename(a, "x/y"), Err(Error::Label(_))));
        t.rename(a, "z").unwrap();
        assert_eq!(t.label(a), Some("z"));
    }

    #[test]
    fn insert_sibling_orders() {
        let (mut t, files, a, b) = sample();
        let c = t.insert_sibling(b, "c", false).unwrap();
        let z = t.insert_sibling(a, "z", true).unwrap();
        assert_eq!(t.children(files), &[z, a, b, c]);
    }

    #[test]
    fn graft_builds_subtree() {
        let (mut t, files, ..) = sample();
        let frag = Fragment {
            label: Some("x".into()),
            value: None,
            children: vec![Fragment::leaf(Some("y"), Some("3"))],
            span: None,
        };
        let x = t.graft(files, frag);
        assert_eq!(t.label(x), Some("x"));
        let y = t.child(x, "y").unwrap();
        assert_eq!(t.value(y), Some("3"));
    }

    #[test]
    fn structural_equality() {
        let (mut t, files, a, b) = sample();
        assert!(!t.equal(a, b));
        let a2 = t.append(files, Some("a"), Some("1"));
        assert!(t.equal(a, a2));
    }
}
