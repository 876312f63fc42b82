// Copyright (c) 2025 ETH Zurich
// Fabian Schuiki <fschuiki@iis.ee.ethz.ch>

//! The engine instance and its public API.
//!
//! An [`Augeas`] owns the configuration tree, the variable symbol
//! table, the lens registry and the latched error slot. Every public
//! call runs through a small enter/exit discipline: the error slot is
//! reset when the outermost call begins and latches the first error
//! raised, so nested internal use of the public API does not clobber
//! the caller-visible state.

use std::rc::Rc;

use bitflags::bitflags;
use indexmap::IndexMap;
use log::debug;

use crate::error::{Error, Result};
use crate::lens::{self, Lens};
use crate::pathx::{self, Ctx, PathExpr, SymbolTable, Value};
use crate::tree::{NodeId, Tree};

bitflags! {
    /// Configuration flags accepted by [`Augeas::init`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u32 {
        /// Keep the original file in a `.augsave` file on save.
        const SAVE_BACKUP = 1 << 0;
        /// Write changes into a `.augnew` file instead of the original.
        const SAVE_NEWFILE = 1 << 1;
        /// Run the expensive lens type checks.
        const TYPE_CHECK = 1 << 2;
        /// Do not search the built-in default module directories.
        const NO_STDINC = 1 << 3;
        /// Run `put` but do not change any file.
        const SAVE_NOOP = 1 << 4;
        /// Do not load the tree on init.
        const NO_LOAD = 1 << 5;
        /// Do not autoload any modules.
        const NO_MODL_AUTOLOAD = 1 << 6;
        /// Track byte spans of tree nodes.
        const ENABLE_SPAN = 1 << 7;
        /// Return a usable handle even when init fails partway.
        const NO_ERR_CLOSE = 1 << 8;
    }
}

/// Span information for a single node, see [`Augeas::span`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpanInfo {
    pub filename: String,
    pub label: (usize, usize),
    pub value: (usize, usize),
    pub span: (usize, usize),
}

/// The default path context.
const CONTEXT_DEFAULT: &str = "/files";

/// An engine instance.
pub struct Augeas {
    pub(crate) tree: Tree,
    /// Filesystem root prefix, always ending in `/`.
    pub(crate) root: String,
    pub(crate) flags: Flags,
    pub(crate) symtab: SymbolTable,
    pub(crate) lenses: IndexMap<String, Rc<Lens>>,
    /// Additional module search paths, from the `loadpath` argument
    /// and `AUGEAS_LENS_LIB`.
    pub(crate) loadpath: Vec<String>,
    error: Option<Error>,
    api_depth: u32,
}

impl Augeas {
    /// Create an instance.
    ///
    /// `root` overrides the filesystem root for all file access
    /// (default `$AUGEAS_ROOT` or `/`); `loadpath` is a `:`-separated
    /// list of extra module directories.
    pub fn init(root: Option<&str>, loadpath: Option<&str>, flags: Flags) -> Result<Augeas> {
        let mut root = match root {
            Some(r) => r.to_string(),
            None => std::env::var("AUGEAS_ROOT").unwrap_or_else(|_| "/".to_string()),
        };
        if !root.ends_with('/') {
            root.push('/');
        }

        let mut paths: Vec<String> = Vec::new();
        if let Some(lp) = loadpath {
            paths.extend(lp.split(':').filter(|s| !s.is_empty()).map(String::from));
        }
        if !flags.contains(Flags::NO_STDINC) {
            if let Ok(lp) = std::env::var("AUGEAS_LENS_LIB") {
                paths.extend(lp.split(':').filter(|s| !s.is_empty()).map(String::from));
            }
        }

        let mut aug = Augeas {
            tree: Tree::new(),
            root,
            flags,
            symtab: SymbolTable::new(),
            lenses: IndexMap::new(),
            loadpath: paths,
            error: None,
            api_depth: 0,
        };

        let setup = aug.api(|aug| {
            let version = env!("CARGO_PKG_VERSION");
            aug.set("/augeas/version", Some(version))?;
            for (i, mode) in ["noop", "backup", "newfile", "overwrite"].iter().enumerate() {
                aug.set(
                    &format!("/augeas/version/save/mode[{}]", i + 1),
                    Some(mode),
                )?;
            }
            let root = aug.root.clone();
            aug.set("/augeas/root", Some(&root))?;
            aug.set("/augeas/context", Some(CONTEXT_DEFAULT))?;
            let span = if flags.contains(Flags::ENABLE_SPAN) {
                "enable"
            } else {
                "disable"
            };
            aug.set("/augeas/span", Some(span))?;
            let mode = if flags.contains(Flags::SAVE_NEWFILE) {
                "newfile"
            } else if flags.contains(Flags::SAVE_BACKUP) {
                "backup"
            } else if flags.contains(Flags::SAVE_NOOP) {
                "noop"
            } else {
                "overwrite"
            };
            aug.set("/augeas/save/mode", Some(mode))?;
            // With no registered lenses there is nothing to autoload,
            // but honoring the flags keeps init symmetric with the C
            // API.
            if !flags.intersects(Flags::NO_LOAD | Flags::NO_MODL_AUTOLOAD) {
                aug.load()?;
            }
            Ok(())
        });
        match setup {
            Ok(()) => Ok(aug),
            // With NO_ERR_CLOSE the caller gets the handle back and
            // can inspect the latched error.
            Err(_) if flags.contains(Flags::NO_ERR_CLOSE) => Ok(aug),
            Err(err) => Err(err),
        }
    }

    /// The first error of the current (or last) public call.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Run `f` under the enter/exit discipline.
    pub(crate) fn api<T>(&mut self, f: impl FnOnce(&mut Augeas) -> Result<T>) -> Result<T> {
        self.api_depth += 1;
        if self.api_depth == 1 {
            self.error = None;
        }
        let result = f(self);
        if let Err(err) = &result {
            if self.error.is_none() {
                self.error = Some(err.clone());
            }
        }
        self.api_depth -= 1;
        result
    }

    /// Register a compiled lens under a name.
    ///
    /// Transforms and the text API look lenses up here; with
    /// `TYPE_CHECK` set the expensive ambiguity checks run now.
    pub fn register_lens(&mut self, name: &str, lens: Rc<Lens>) -> Result<()> {
        self.api(|aug| {
            if aug.flags.contains(Flags::TYPE_CHECK) {
                lens::typecheck(&lens)?;
            }
            aug.lenses.insert(name.to_string(), lens);
            Ok(())
        })
    }

    /// Look a registered lens up by name.
    pub(crate) fn lens_by_name(&self, name: &str) -> Result<Rc<Lens>> {
        self.lenses
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NoLens(name.to_string()))
    }

    /// The node the default context points at.
    pub(crate) fn root_ctx(&self) -> NodeId {
        let origin = self.tree.origin();
        let Some(augeas) = self.tree.child(origin, "augeas") else {
            return origin;
        };
        let Some(ctx) = self.tree.child(augeas, "context") else {
            return origin;
        };
        let Some(path) = self.tree.value(ctx) else {
            return origin;
        };
        match pathx::parse(path) {
            Ok(p) => {
                let ctx = Ctx {
                    tree: &self.tree,
                    start: origin,
                    symtab: &self.symtab,
                };
                match p.nodes(&ctx) {
                    Ok(ns) if ns.len() == 1 => ns[0],
                    _ => origin,
                }
            }
            Err(_) => origin,
        }
    }

    pub(crate) fn parse_path(&self, path: &str) -> Result<PathExpr> {
        pathx::parse(path)
    }

    pub(crate) fn eval_nodes(&self, path: &str) -> Result<Vec<NodeId>> {
        let p = self.parse_path(path)?;
        p.nodes(&Ctx {
            tree: &self.tree,
            start: self.root_ctx(),
            symtab: &self.symtab,
        })
    }

    pub(crate) fn find_one(&self, path: &str) -> Result<NodeId> {
        let p = self.parse_path(path)?;
        p.find_one(&Ctx {
            tree: &self.tree,
            start: self.root_ctx(),
            symtab: &self.symtab,
        })
    }

    pub(crate) fn expand(&mut self, path: &str) -> Result<NodeId> {
        let p = self.parse_path(path)?;
        let start = self.root_ctx();
        p.expand_tree(&mut self.tree, start, &self.symtab)
    }

    /// The value at `path`; `Ok(None)` if there is no matching node
    /// or the node has no value. Multiple matches are an error.
    pub fn get(&mut self, path: &str) -> Result<Option<String>> {
        self.api(|aug| match aug.find_one(path) {
            Ok(node) => Ok(aug.tree.value(node).map(str::to_string)),
            Err(Error::NoMatch(_)) => Ok(None),
            Err(err) => Err(err),
        })
    }

    /// The label at `path`; `Ok(None)` if there is no matching node.
    pub fn label(&mut self, path: &str) -> Result<Option<String>> {
        self.api(|aug| match aug.find_one(path) {
            Ok(node) => Ok(aug.tree.label(node).map(str::to_string)),
            Err(Error::NoMatch(_)) => Ok(None),
            Err(err) => Err(err),
        })
    }

    /// Set the value at `path`, creating the node if needed.
    pub fn set(&mut self, path: &str, value: Option<&str>) -> Result<()> {
        self.api(|aug| {
            let node = aug.expand(path)?;
            aug.tree.set_value(node, value);
            Ok(())
        })
    }

    /// Set the value of all nodes matching `sub` relative to each
    /// node matching `base`; returns how many values were set.
    pub fn setm(&mut self, base: &str, sub: Option<&str>, value: Option<&str>) -> Result<usize> {
        self.api(|aug| {
            let bases = aug.eval_nodes(base)?;
            let sub = match sub {
                Some(".") | None => None,
                Some(s) => Some(aug.parse_path(s)?),
            };
            let mut count = 0;
            for bt in bases {
                match &sub {
                    None => {
                        aug.tree.set_value(bt, value);
                        count += 1;
                    }
                    Some(sx) => {
                        let matches = sx.nodes(&Ctx {
                            tree: &aug.tree,
                            start: bt,
                            symtab: &aug.symtab,
                        })?;
                        if matches.is_empty() {
                            let st = sx.expand_tree(&mut aug.tree, bt, &aug.symtab)?;
                            aug.tree.set_value(st, value);
                            count += 1;
                        } else {
                            for st in matches {
                                aug.tree.set_value(st, value);
                                count += 1;
                            }
                        }
                    }
                }
            }
            Ok(count)
        })
    }

    /// Create `path` if missing and clear its value.
    pub fn clear(&mut self, path: &str) -> Result<()> {
        self.set(path, None)
    }

    /// Clear the value of all nodes matching `sub` under `base`.
    pub fn clearm(&mut self, base: &str, sub: Option<&str>) -> Result<usize> {
        self.setm(base, sub, None)
    }

    /// Create `path` if missing, without touching an existing value.
    pub fn touch(&mut self, path: &str) -> Result<()> {
        self.api(|aug| {
            if aug.eval_nodes(path)?.is_empty() {
                aug.expand(path)?;
            }
            Ok(())
        })
    }

    /// Insert a new sibling of the single node matching `path`.
    pub fn insert(&mut self, path: &str, label: &str, before: bool) -> Result<()> {
        self.api(|aug| {
            if label.contains('/') {
                return Err(Error::Label(label.to_string()));
            }
            let node = aug.find_one(path)?;
            aug.tree.insert_sibling(node, label, before)?;
            Ok(())
        })
    }

    /// Remove all nodes matching `path`; returns how many nodes
    /// (including descendants) were removed.
    pub fn rm(&mut self, path: &str) -> Result<usize> {
        self.api(|aug| {
            let nodes: Vec<NodeId> = aug
                .eval_nodes(path)?
                .into_iter()
                .filter(|&n| !aug.tree.hidden(n))
                .collect();
            let mut count = 0;
            for node in nodes {
                // Earlier removals may have taken descendants along.
                if aug.tree.contains(node) {
                    count += aug.tree.unlink(node);
                }
            }
            Ok(count)
        })
    }

    /// Move the single node matching `src` to `dst`.
    pub fn mv(&mut self, src: &str, dst: &str) -> Result<()> {
        self.api(|aug| {
            let ts = aug.find_one(src)?;
            let existed = !aug.eval_nodes(dst)?.is_empty();
            let td = aug.expand(dst)?;
            if aug.tree.is_self_or_descendant(ts, td) {
                return Err(Error::MoveDescendant {
                    src: src.to_string(),
                    dst: dst.to_string(),
                });
            }
            // The destination takes over value and children; the
            // source node disappears. A freshly created destination
            // among the same siblings also takes over the source's
            // position, so a move-as-rename keeps file order.
            if !existed && aug.tree.parent(td) == aug.tree.parent(ts) {
                aug.tree.place_before(td, ts);
            }
            aug.tree.unlink_children(td);
            let value = aug.tree.value(ts).map(str::to_string);
            aug.tree.set_value(td, value.as_deref());
            let moved = aug.tree.move_children(ts, td);
            debug!("mv: moved {} children from {} to {}", moved, src, dst);
            aug.tree.unlink(ts);
            aug.tree.mark_dirty(td);
            Ok(())
        })
    }

    /// Rename all nodes matching `src` to `label`; returns the count.
    pub fn rename(&mut self, src: &str, label: &str) -> Result<usize> {
        self.api(|aug| {
            if label.contains('/') {
                return Err(Error::Label(label.to_string()));
            }
            let nodes = aug.eval_nodes(src)?;
            let mut count = 0;
            for node in nodes {
                aug.tree.rename(node, label)?;
                count += 1;
            }
            Ok(count)
        })
    }

    /// The paths of all visible nodes matching `path`.
    pub fn matches(&mut self, path: &str) -> Result<Vec<String>> {
        self.api(|aug| {
            let path = if path == "/" { "/*" } else { path };
            let p = aug.parse_path(path)?;
            let nodes = p.matches(&Ctx {
                tree: &aug.tree,
                start: aug.root_ctx(),
                symtab: &aug.symtab,
            })?;
            Ok(nodes.into_iter().map(|n| aug.tree.path_of(n)).collect())
        })
    }

    /// Define a variable from an expression evaluated now; `None`
    /// undefines. Returns the size of a node-set value.
    pub fn defvar(&mut self, name: &str, expr: Option<&str>) -> Result<usize> {
        self.api(|aug| {
            let result = match expr {
                None => {
                    aug.symtab.undefine(name);
                    0
                }
                Some(expr) => {
                    let p = aug.parse_path(expr)?;
                    let value = p.eval(&Ctx {
                        tree: &aug.tree,
                        start: aug.root_ctx(),
                        symtab: &aug.symtab,
                    })?;
                    let n = match &value {
                        Value::Nodes(ns) => ns.len(),
                        _ => 0,
                    };
                    aug.symtab.define(name, value);
                    n
                }
            };
            // Record the definition for reloads.
            let vars = aug.meta_path("variables");
            match expr {
                None => {
                    if let Some(node) = aug.tree.child(vars, name) {
                        aug.tree.unlink(node);
                    }
                }
                Some(expr) => {
                    let node = aug.tree.child_or_create(vars, name);
                    aug.tree.set_value(node, Some(expr));
                }
            }
            Ok(result)
        })
    }

    /// Define a variable as a single node, creating the node if the
    /// expression matches nothing. Returns whether it was created.
    pub fn defnode(&mut self, name: &str, expr: &str, value: Option<&str>) -> Result<bool> {
        self.api(|aug| {
            let p = aug.parse_path(expr)?;
            let ctx_start = aug.root_ctx();
            let existing = p.nodes(&Ctx {
                tree: &aug.tree,
                start: ctx_start,
                symtab: &aug.symtab,
            })?;
            if existing.is_empty() {
                let node = p.expand_tree(&mut aug.tree, ctx_start, &aug.symtab)?;
                aug.tree.set_value(node, value);
                aug.symtab.define(name, Value::Nodes(vec![node]));
                let path = aug.tree.path_of(node);
                let vars = aug.meta_path("variables");
                let rec = aug.tree.child_or_create(vars, name);
                aug.tree.set_value(rec, Some(&path));
                Ok(true)
            } else {
                aug.symtab.define(name, Value::Nodes(existing));
                let vars = aug.meta_path("variables");
                let rec = aug.tree.child_or_create(vars, name);
                aug.tree.set_value(rec, Some(expr));
                Ok(false)
            }
        })
    }

    /// Span information of the single node matching `path`.
    pub fn span(&mut self, path: &str) -> Result<SpanInfo> {
        self.api(|aug| {
            let node = aug.find_one(path)?;
            let span = aug
                .tree
                .node(node)
                .span
                .clone()
                .ok_or_else(|| Error::NoSpan(path.to_string()))?;
            Ok(SpanInfo {
                filename: span
                    .filename
                    .as_deref()
                    .unwrap_or_default()
                    .to_string(),
                label: (span.label_start, span.label_end),
                value: (span.value_start, span.value_end),
                span: (span.span_start, span.span_end),
            })
        })
    }

    /// Shorthand for `/augeas/<name>`, created if missing.
    pub(crate) fn meta_path(&mut self, name: &str) -> NodeId {
        let origin = self.tree.origin();
        let augeas = self.tree.child_or_create(origin, "augeas");
        self.tree.path_or_create(augeas, name)
    }

    /// Shorthand for the `/files` root, created if missing.
    pub(crate) fn files_root(&mut self) -> NodeId {
        let origin = self.tree.origin();
        self.tree.child_or_create(origin, "files")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn aug() -> Augeas {
        Augeas::init(Some("/dev/null"), None, Flags::NO_LOAD).unwrap()
    }

    #[test]
    fn init_populates_metadata() {
        let mut aug = aug();
        assert_eq!(
            aug.get("/augeas/version").unwrap(),
            Some(env!("CARGO_PKG_VERSION").to_string())
        );
        assert_eq!(aug.get("/augeas/context").unwrap(), Some("/files".into()));
        assert_eq!(
            aug.get("/augeas/save/mode").unwrap(),
            Some("overwrite".into())
        );
    }

    #[test]
    fn set_get_roundtrip() {
        let mut aug = aug();
        aug.set("/files/etc/hosts/1/ipaddr", Some("127.0.0.1"))
            .unwrap();
        assert_eq!(
            aug.get("/files/etc/hosts/1/ipaddr").unwrap(),
            Some("127.0.0.1".into())
        );
        // A missing node is a quiet zero-match, not an error.
        assert_eq!(aug.get("/files/etc/hosts/1/nope").unwrap(), None);
        // Multiple matches are.
        aug.set("/files/f/x[1]", Some("1")).unwrap();
        aug.set("/files/f/x[2]", Some("2")).unwrap();
        assert!(matches!(
            aug.get("/files/f/x"),
            Err(Error::TooManyMatches(_))
        ));
    }

    #[test]
    fn context_applies_to_relative_paths() {
        let mut aug = aug();
        aug.set("/files/etc/motd/msg", Some("hi")).unwrap();
        assert_eq!(aug.get("etc/motd/msg").unwrap(), Some("hi".into()));
        aug.set("/augeas/context", Some("/files/etc")).unwrap();
        assert_eq!(aug.get("motd/msg").unwrap(), Some("hi".into()));
    }

    #[test]
    fn setm_sets_multiple() {
        let mut aug = aug();
        aug.set("/files/f/a/x", Some("1")).unwrap();
        aug.set("/files/f/b/x", Some("2")).unwrap();
        let n = aug.setm("/files/f/*", Some("x"), Some("9")).unwrap();
        assert_eq!(n, 2);
        assert_eq!(aug.get("/files/f/a/x").unwrap(), Some("9".into()));
    }

    #[test]
    fn insert_orders_siblings() {
        let mut aug = aug();
        aug.set("/files/f/b", Some("2")).unwrap();
        aug.insert("/files/f/b", "a", true).unwrap();
        aug.insert("/files/f/b", "c", false).unwrap();
        let paths = aug.matches("/files/f/*").unwrap();
        assert_eq!(paths, ["/files/f/a", "/files/f/b", "/files/f/c"]);
    }

    #[test]
    fn rm_returns_removed_count() {
        let mut aug = aug();
        aug.set("/files/f/a/b/c", Some("1")).unwrap();
        let n = aug.rm("/files/f").unwrap();
        assert_eq!(n, 4);
        assert!(aug.matches("/files/*").unwrap().is_empty());
    }

    #[test]
    fn mv_rejects_descendant() {
        let mut aug = aug();
        aug.set("/files/a/b/c", Some("1")).unwrap();
        let err = aug.mv("/files/a", "/files/a/b/c/d").unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::MoveDescendant);
        // Tree unchanged.
        assert_eq!(aug.get("/files/a/b/c").unwrap(), Some("1".into()));
    }

    #[test]
    fn mv_moves_value_and_children() {
        let mut aug = aug();
        aug.set("/files/f/x", Some("1")).unwrap();
        aug.set("/files/f/x/sub", Some("s")).unwrap();
        aug.set("/files/f/y", Some("2")).unwrap();
        aug.mv("/files/f/x", "/files/f/z").unwrap();
        assert_eq!(aug.get("/files/f/z").unwrap(), Some("1".into()));
        assert_eq!(aug.get("/files/f/z/sub").unwrap(), Some("s".into()));
        assert!(aug.matches("/files/f/x").unwrap().is_empty());
        // The new node takes over the position of the moved one.
        let paths = aug.matches("/files/f/*").unwrap();
        assert_eq!(paths, ["/files/f/z", "/files/f/y"]);
    }

    #[test]
    fn rename_rejects_slash() {
        let mut aug = aug();
        aug.set("/files/f/x", Some("1")).unwrap();
        let err = aug.rename("/files/f/x", "a/b").unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Label);
        assert_eq!(aug.rename("/files/f/x", "y").unwrap(), 1);
        assert_eq!(aug.get("/files/f/y").unwrap(), Some("1".into()));
    }

    #[test]
    fn defvar_and_defnode() {
        let mut aug = aug();
        aug.set("/files/f/a", Some("1")).unwrap();
        aug.set("/files/f/b", Some("2")).unwrap();
        let n = aug.defvar("all", Some("/files/f/*")).unwrap();
        assert_eq!(n, 2);
        let paths = aug.matches("$all").unwrap();
        assert_eq!(paths.len(), 2);
        // defvar captures at definition time: adding a node later
        // does not grow the variable.
        aug.set("/files/f/c", Some("3")).unwrap();
        assert_eq!(aug.matches("$all").unwrap().len(), 2);

        let created = aug.defnode("n", "/files/f/d", Some("4")).unwrap();
        assert!(created);
        assert_eq!(aug.get("$n").unwrap(), Some("4".into()));
    }

    #[test]
    fn error_slot_latches_first_error() {
        let mut aug = aug();
        let _ = aug.get("/files/hosts[");
        let err = aug.error().cloned().unwrap();
        assert_eq!(err.code(), crate::error::ErrorCode::Pathx);
        match err {
            Error::Pathx { details, .. } => assert_eq!(details, "/files/hosts[|=|"),
            other => panic!("unexpected {:?}", other),
        }
        // The next call resets the slot.
        aug.set("/files/ok", Some("1")).unwrap();
        assert!(aug.error().is_none());
    }

    #[test]
    fn pathx_error_positions() {
        let mut aug = aug();
        let err = aug.get("/files/*[").unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Pathx);
    }
}
