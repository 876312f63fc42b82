// Copyright (c) 2025 ETH Zurich
// Fabian Schuiki <fschuiki@iis.ee.ethz.ch>

//! The transform layer: mapping lenses onto files.
//!
//! A transform pairs a registered lens with an ordered list of
//! include/exclude globs. `load` enumerates matching files, parses
//! them and splices the results under `/files`; `save` walks dirty
//! subtrees, renders them through `put` against the current on-disk
//! text and writes the result atomically through a temp file in the
//! destination directory.
//!
//! Per-file state lives in the tree itself: `/augeas/load/<name>`
//! holds the transforms, `/augeas/files/<path>` the per-file records
//! (`path`, `mtime`, `lens`, and `error` on failure), and
//! `/augeas/events/saved` the files written by the last `save`.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::UNIX_EPOCH;

use glob::{MatchOptions, Pattern};
use log::{debug, warn};

use crate::augeas::{Augeas, Flags};
use crate::error::{Error, LnsError, Result};
use crate::get;
use crate::lens::Lens;
use crate::put;
use crate::tree::NodeId;

/// Match options equivalent to `fnmatch(3)` with `FNM_PATHNAME`.
fn fnm_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

/// Collapse `//` runs so glob patterns compare like paths.
fn normalize_slashes(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut prev_slash = false;
    for c in pattern.chars() {
        if c == '/' {
            if !prev_slash {
                out.push(c);
            }
            prev_slash = true;
        } else {
            out.push(c);
            prev_slash = false;
        }
    }
    out
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

impl Augeas {
    /// Register a transform: parse files matching `incl` (and none of
    /// `excl`) with the lens registered under `lens_name`.
    ///
    /// This only writes the `/augeas/load/<lens_name>` subtree; the
    /// files are read by the next [`Augeas::load`].
    pub fn transform(&mut self, lens_name: &str, incl: &[&str], excl: &[&str]) -> Result<()> {
        self.api(|aug| {
            aug.lens_by_name(lens_name)?;
            let load = aug.meta_path("load");
            let xfm = aug.tree.child_or_create(load, lens_name);
            let lens_node = aug.tree.child_or_create(xfm, "lens");
            aug.tree.set_value(lens_node, Some(lens_name));
            for pat in incl {
                aug.tree.append(xfm, Some("incl"), Some(pat));
            }
            for pat in excl {
                aug.tree.append(xfm, Some("excl"), Some(pat));
            }
            Ok(())
        })
    }

    /// Load (or reload) all files matched by the registered
    /// transforms.
    pub fn load(&mut self) -> Result<()> {
        self.api(|aug| {
            // Update the span flag from the tree.
            if let Ok(Some(v)) = aug.get("/augeas/span") {
                if v == "enable" {
                    aug.flags |= Flags::ENABLE_SPAN;
                } else {
                    aug.flags -= Flags::ENABLE_SPAN;
                }
            }

            let meta_files = aug.meta_path("files");
            aug.tree.clean(meta_files);
            aug.mark_file_records(meta_files);

            let load = aug.meta_path("load");
            let xfms: Vec<NodeId> = aug.tree.children(load).to_vec();
            for xfm in xfms {
                if aug.transform_validate(xfm) {
                    aug.transform_load(xfm)?;
                }
            }

            let files = aug.files_root();
            aug.tree.clean(files);
            // Records still dirty here matched no transform on this
            // load; drop them and their trees.
            aug.rm_dirty_files(meta_files)?;
            let meta_files = aug.meta_path("files");
            aug.rm_dirty_leaves(meta_files, meta_files);
            let files = aug.files_root();
            aug.rm_dirty_leaves(files, files);
            let origin = aug.tree.origin();
            aug.tree.clean(origin);

            // Re-evaluate recorded variables against the new tree.
            let vars = aug.meta_path("variables");
            let defs: Vec<(String, String)> = aug
                .tree
                .children(vars)
                .iter()
                .filter_map(|&v| {
                    Some((
                        aug.tree.label(v)?.to_string(),
                        aug.tree.value(v)?.to_string(),
                    ))
                })
                .collect();
            for (name, expr) in defs {
                aug.defvar(&name, Some(&expr))?;
            }
            Ok(())
        })
    }

    /// Save all dirty subtrees under `/files` back to their files.
    ///
    /// A failure on one file does not stop the others from being
    /// saved; the first error is reported.
    pub fn save(&mut self) -> Result<()> {
        self.api(|aug| {
            aug.update_save_flags()?;
            // Start a fresh saved-events list.
            let events = aug.meta_path("events");
            while let Some(n) = aug.tree.child(events, "saved") {
                aug.tree.unlink(n);
            }

            let files = aug.files_root();
            if !aug.tree.dirty(files) {
                return Ok(());
            }
            let children: Vec<NodeId> = aug.tree.children(files).to_vec();
            let mut first_err = None;
            for child in children {
                if let Err(err) = aug.save_subtree(child, "/files") {
                    first_err.get_or_insert(err);
                }
            }
            if let Some(err) = first_err {
                return Err(err);
            }
            if !aug.flags.contains(Flags::SAVE_NOOP) {
                let files = aug.files_root();
                aug.tree.clean(files);
            }
            Ok(())
        })
    }

    /// Parse the string value of `node` with a registered lens and
    /// splice the result at `path`.
    pub fn text_store(&mut self, lens_name: &str, node: &str, path: &str) -> Result<()> {
        self.api(|aug| {
            let lens = aug.lens_by_name(lens_name)?;
            let src = aug.get(node)?.ok_or_else(|| {
                Error::BadArg(format!("node {} has no value to parse", node))
            })?;
            match get::get(&lens, &src, None, false) {
                Ok(parsed) => {
                    let target = aug.expand(path)?;
                    aug.tree.unlink_children(target);
                    for frag in parsed.trees {
                        aug.tree.graft(target, frag);
                    }
                    aug.clear_text_error(path);
                    Ok(())
                }
                Err(err) => {
                    aug.store_text_error(path, &src, &err);
                    Err(Error::Syntax(format!(
                        "failed to parse {}: {}",
                        node, err.message
                    )))
                }
            }
        })
    }

    /// Turn the subtree at `path` back into text, using the value of
    /// `node_in` as the skeleton source; the result becomes the value
    /// of `node_out`.
    pub fn text_retrieve(
        &mut self,
        lens_name: &str,
        node_in: &str,
        path: &str,
        node_out: &str,
    ) -> Result<()> {
        self.api(|aug| {
            let lens = aug.lens_by_name(lens_name)?;
            let src = aug.get(node_in)?.unwrap_or_default();
            let root = aug.find_one(path).or_else(|err| match err {
                Error::NoMatch(_) => Err(Error::NoMatch(path.to_string())),
                other => Err(other),
            })?;
            let children: Vec<NodeId> = aug.tree.children(root).to_vec();
            match put::put(&lens, &aug.tree, &children, &src) {
                Ok(text) => {
                    let out = aug.expand(node_out)?;
                    aug.tree.set_value(out, Some(&text));
                    aug.clear_text_error(path);
                    Ok(())
                }
                Err(err) => {
                    aug.store_text_error(path, &src, &err);
                    Err(Error::Syntax(format!(
                        "failed to render {}: {}",
                        path, err.message
                    )))
                }
            }
        })
    }

    /// Mark every per-file record (a node with a `path` child) dirty.
    fn mark_file_records(&mut self, node: NodeId) {
        if self.tree.child(node, "path").is_some() {
            self.tree.mark_dirty(node);
        } else {
            let children: Vec<NodeId> = self.tree.children(node).to_vec();
            for c in children {
                self.mark_file_records(c);
            }
        }
    }

    /// Remove file records (and their trees) that stayed dirty.
    fn rm_dirty_files(&mut self, node: NodeId) -> Result<()> {
        if !self.tree.dirty(node) {
            return Ok(());
        }
        if let Some(p) = self.tree.child(node, "path") {
            if let Some(path) = self.tree.value(p).map(str::to_string) {
                self.rm(&path)?;
            }
            self.tree.unlink(node);
        } else {
            let children: Vec<NodeId> = self.tree.children(node).to_vec();
            for c in children {
                self.rm_dirty_files(c)?;
            }
        }
        Ok(())
    }

    /// Remove dirty leaves bottom-up, leaving `protect` itself alone.
    fn rm_dirty_leaves(&mut self, node: NodeId, protect: NodeId) {
        if !self.tree.contains(node) || !self.tree.dirty(node) {
            return;
        }
        let children: Vec<NodeId> = self.tree.children(node).to_vec();
        for c in children {
            self.rm_dirty_leaves(c, protect);
        }
        if node != protect && self.tree.children(node).is_empty() {
            self.tree.unlink(node);
        }
    }

    /// Check a transform record; on failure note the problem in its
    /// `error` child.
    fn transform_validate(&mut self, xfm: NodeId) -> bool {
        if let Some(err) = self.tree.child(xfm, "error") {
            self.tree.unlink(err);
        }
        let lens_name = self
            .tree
            .child(xfm, "lens")
            .and_then(|n| self.tree.value(n))
            .map(str::to_string);
        let problem = match lens_name {
            None => Some("missing a `lens` entry".to_string()),
            Some(name) => match self.lens_by_name(&name) {
                Ok(_) => {
                    let any_incl = self
                        .tree
                        .children(xfm)
                        .iter()
                        .any(|&c| self.tree.label(c) == Some("incl"));
                    if any_incl {
                        None
                    } else {
                        Some("no include filters".to_string())
                    }
                }
                Err(_) => Some(format!("lens `{}` not registered", name)),
            },
        };
        match problem {
            None => true,
            Some(msg) => {
                let err = self.tree.child_or_create(xfm, "error");
                self.tree.set_value(err, Some(&msg));
                false
            }
        }
    }

    /// The include/exclude filters of a transform record, in order.
    fn transform_filters(&self, xfm: NodeId) -> (Vec<String>, Vec<String>) {
        let mut incl = Vec::new();
        let mut excl = Vec::new();
        for &c in self.tree.children(xfm) {
            match (self.tree.label(c), self.tree.value(c)) {
                (Some("incl"), Some(v)) => incl.push(v.to_string()),
                (Some("excl"), Some(v)) => excl.push(v.to_string()),
                _ => {}
            }
        }
        (incl, excl)
    }

    /// Whether a transform applies to the file `filename` (a path
    /// below the root, with a leading `/`).
    fn filter_matches(&self, xfm: NodeId, filename: &str) -> bool {
        let (incl, excl) = self.transform_filters(xfm);
        let included = incl.iter().any(|pat| {
            Pattern::new(&normalize_slashes(pat))
                .map(|p| p.matches_with(filename, fnm_options()))
                .unwrap_or(false)
        });
        if !included {
            return false;
        }
        !excl.iter().any(|pat| {
            let target = if pat.contains('/') {
                filename
            } else {
                basename(filename)
            };
            Pattern::new(&normalize_slashes(pat))
                .map(|p| p.matches_with(target, fnm_options()))
                .unwrap_or(false)
        })
    }

    /// Enumerate the files a transform matches on disk. Returned
    /// names are relative to the root, with a leading `/`.
    fn filter_generate(&self, xfm: NodeId) -> Vec<String> {
        let (incl, excl) = self.transform_filters(xfm);
        let root = self.root.trim_end_matches('/');
        let mut out: Vec<String> = Vec::new();
        for pat in &incl {
            let full = normalize_slashes(&format!("{}/{}", root, pat.trim_start_matches('/')));
            let paths = match glob::glob(&full) {
                Ok(iter) => iter,
                Err(err) => {
                    warn!("bad include glob {:?}: {}", pat, err);
                    continue;
                }
            };
            for path in paths.flatten() {
                if !path.is_file() {
                    continue;
                }
                let Some(rel) = strip_root(root, &path) else {
                    continue;
                };
                if out.contains(&rel) {
                    continue;
                }
                let excluded = excl.iter().any(|e| {
                    let target = if e.contains('/') {
                        rel.as_str()
                    } else {
                        basename(&rel)
                    };
                    Pattern::new(&normalize_slashes(e))
                        .map(|p| p.matches_with(target, fnm_options()))
                        .unwrap_or(false)
                });
                if !excluded {
                    out.push(rel);
                }
            }
        }
        out
    }

    fn fs_path(&self, filename: &str) -> PathBuf {
        PathBuf::from(format!(
            "{}/{}",
            self.root.trim_end_matches('/'),
            filename.trim_start_matches('/')
        ))
    }

    /// Whether the loaded copy of `filename` is still current: the
    /// stored mtime matches the file and the tree is clean.
    fn file_current(&self, filename: &str, finfo: NodeId) -> bool {
        let Some(mtime) = self.tree.child(finfo, "mtime").and_then(|n| self.tree.value(n))
        else {
            return false;
        };
        let Some(disk) = mtime_string(&self.fs_path(filename)) else {
            return false;
        };
        if mtime != disk {
            return false;
        }
        let Some(path) = self.tree.child(finfo, "path").and_then(|n| self.tree.value(n)) else {
            return false;
        };
        match self.eval_nodes(path) {
            Ok(ns) if ns.len() == 1 => !self.tree.dirty(ns[0]),
            _ => false,
        }
    }

    /// Load every file a transform matches.
    fn transform_load(&mut self, xfm: NodeId) -> Result<()> {
        let lens_name = self
            .tree
            .child(xfm, "lens")
            .and_then(|n| self.tree.value(n))
            .map(str::to_string)
            .expect("validated transform without lens");
        let lens = self.lens_by_name(&lens_name)?;
        for filename in self.filter_generate(xfm) {
            let finfo = self.file_record(&filename);
            let prev = self
                .tree
                .child(finfo, "lens")
                .and_then(|n| self.tree.value(n))
                .map(str::to_string);
            if !self.tree.dirty(finfo) && prev.is_some() {
                // The record was already processed during this load,
                // so another transform claimed the file. Identical
                // lenses are harmless duplication; different ones are
                // a conflict, and the first lens's work is undone.
                if prev.as_deref() != Some(lens_name.as_str()) {
                    let msg = format!(
                        "Lenses {} and {} could be used to load this file",
                        prev.as_deref().unwrap(),
                        lens_name
                    );
                    self.store_file_error(&filename, "mxfm_load", &msg, None, None);
                    let tree_path = format!("/files{}", filename);
                    let _ = self.rm(&tree_path);
                }
            } else if self.file_current(&filename, finfo) {
                debug!("load: {} is current, skipping", filename);
            } else {
                self.load_file(&lens, &lens_name, &filename)?;
            }
            let finfo = self.file_record(&filename);
            self.tree.clean(finfo);
        }
        Ok(())
    }

    /// The `/augeas/files/<filename>` record, created if missing.
    fn file_record(&mut self, filename: &str) -> NodeId {
        let meta_files = self.meta_path("files");
        self.tree.path_or_create(meta_files, filename)
    }

    fn load_file(&mut self, lens: &Rc<Lens>, lens_name: &str, filename: &str) -> Result<()> {
        debug!("load: parsing {} with {}", filename, lens_name);
        let tree_path = format!("/files{}", filename);
        self.store_file_info(filename, &tree_path, lens_name, false);
        let fs_path = self.fs_path(filename);
        let mut text = match fs::read_to_string(&fs_path) {
            Ok(t) => t,
            Err(err) => {
                self.store_file_error(filename, "read_failed", &err.to_string(), None, None);
                return Ok(());
            }
        };
        if !text.ends_with('\n') {
            text.push('\n');
        }
        let spans = self.flags.contains(Flags::ENABLE_SPAN);
        let file_rc: Rc<str> = Rc::from(fs_path.to_string_lossy().as_ref());
        match get::get(lens, &text, Some(file_rc.clone()), spans) {
            Ok(parsed) => {
                let files = self.files_root();
                let node = self.tree.path_or_create(files, filename);
                self.tree.unlink_children(node);
                for frag in parsed.trees {
                    self.tree.graft(node, frag);
                }
                if spans {
                    self.tree.set_span(
                        node,
                        Some(crate::tree::Span {
                            filename: Some(file_rc),
                            span_start: 0,
                            span_end: text.len(),
                            ..Default::default()
                        }),
                    );
                }
                Ok(())
            }
            Err(err) => {
                let (line, chr) = err.line_char(&text).unwrap_or((0, 0));
                self.store_file_error(
                    filename,
                    "parse_failed",
                    &err.message,
                    err.pos,
                    Some((line, chr)),
                );
                Ok(())
            }
        }
    }

    /// Record `path`, `mtime` and `lens` for a file and clear any
    /// previous error.
    fn store_file_info(&mut self, filename: &str, tree_path: &str, lens_name: &str, force_reload: bool) {
        let fs_path = self.fs_path(filename);
        let finfo = self.file_record(filename);
        if let Some(err) = self.tree.child(finfo, "error") {
            self.tree.unlink(err);
        }
        let path_node = self.tree.child_or_create(finfo, "path");
        self.tree.set_value(path_node, Some(tree_path));
        let lens_node = self.tree.child_or_create(finfo, "lens");
        self.tree.set_value(lens_node, Some(lens_name));
        if force_reload {
            if let Some(m) = self.tree.child(finfo, "mtime") {
                self.tree.unlink(m);
            }
        } else {
            let mtime = mtime_string(&fs_path).unwrap_or_else(|| "0".to_string());
            let mtime_node = self.tree.child_or_create(finfo, "mtime");
            self.tree.set_value(mtime_node, Some(&mtime));
        }
    }

    /// Record an error for a file under its metadata node.
    fn store_file_error(
        &mut self,
        filename: &str,
        kind: &str,
        message: &str,
        pos: Option<usize>,
        line_char: Option<(usize, usize)>,
    ) {
        let finfo = self.file_record(filename);
        if let Some(err) = self.tree.child(finfo, "error") {
            self.tree.unlink(err);
        }
        let err = self.tree.append(finfo, Some("error"), Some(kind));
        self.tree.append(err, Some("message"), Some(message));
        if let Some(pos) = pos {
            self.tree
                .append(err, Some("pos"), Some(&pos.to_string()));
        }
        if let Some((line, chr)) = line_char {
            self.tree
                .append(err, Some("line"), Some(&line.to_string()));
            self.tree
                .append(err, Some("char"), Some(&chr.to_string()));
        }
    }

    /// Record a put error (which has a tree path instead of an input
    /// position) for a file.
    fn store_put_error(&mut self, filename: &str, err: &LnsError) {
        let finfo = self.file_record(filename);
        if let Some(e) = self.tree.child(finfo, "error") {
            self.tree.unlink(e);
        }
        let kind = if err.pos.is_some() {
            "parse_skel_failed"
        } else {
            "put_failed"
        };
        let e = self.tree.append(finfo, Some("error"), Some(kind));
        self.tree.append(e, Some("message"), Some(&err.message));
        if let Some(path) = &err.path {
            self.tree.append(e, Some("path"), Some(path));
        }
        if let Some(pos) = err.pos {
            self.tree.append(e, Some("pos"), Some(&pos.to_string()));
        }
        if let Some(lens) = &err.lens {
            self.tree.append(e, Some("lens"), Some(lens));
        }
    }

    fn store_text_error(&mut self, path: &str, _text: &str, err: &LnsError) {
        let meta = self.meta_path("text");
        let node = self.tree.path_or_create(meta, path);
        if let Some(e) = self.tree.child(node, "error") {
            self.tree.unlink(e);
        }
        let kind = if err.pos.is_some() {
            "parse_failed"
        } else {
            "put_failed"
        };
        let e = self.tree.append(node, Some("error"), Some(kind));
        self.tree.append(e, Some("message"), Some(&err.message));
        if let Some(pos) = err.pos {
            self.tree.append(e, Some("pos"), Some(&pos.to_string()));
        }
        if let Some(p) = &err.path {
            self.tree.append(e, Some("path"), Some(p));
        }
    }

    fn clear_text_error(&mut self, path: &str) {
        let meta = self.meta_path("text");
        let node = self.tree.path_or_create(meta, path);
        if let Some(e) = self.tree.child(node, "error") {
            self.tree.unlink(e);
        }
    }

    /// Refresh the save flags from `/augeas/save/mode`.
    fn update_save_flags(&mut self) -> Result<()> {
        let Some(mode) = self.get("/augeas/save/mode")? else {
            return Ok(());
        };
        self.flags -= Flags::SAVE_BACKUP | Flags::SAVE_NEWFILE | Flags::SAVE_NOOP;
        match mode.as_str() {
            "backup" => self.flags |= Flags::SAVE_BACKUP,
            "newfile" => self.flags |= Flags::SAVE_NEWFILE,
            "noop" => self.flags |= Flags::SAVE_NOOP,
            "overwrite" => {}
            other => {
                return Err(Error::BadArg(format!("invalid save mode {:?}", other)));
            }
        }
        Ok(())
    }

    /// Walk a dirty subtree under `/files` and save every file that a
    /// transform claims.
    fn save_subtree(&mut self, node: NodeId, parent_path: &str) -> Result<()> {
        if !self.tree.dirty(node) {
            return Ok(());
        }
        let Some(label) = self.tree.label(node).map(str::to_string) else {
            return Ok(());
        };
        let tpath = format!("{}/{}", parent_path, label);
        let filename = &tpath["/files".len()..];

        let load = self.meta_path("load");
        let xfms: Vec<NodeId> = self.tree.children(load).to_vec();
        let mut owner: Option<NodeId> = None;
        let mut conflict = false;
        for xfm in xfms {
            if self.filter_matches(xfm, filename) {
                match owner {
                    None => owner = Some(xfm),
                    Some(prev) if prev == xfm => {}
                    Some(prev) => {
                        let msg = format!(
                            "Lenses {} and {} could be used to save this file",
                            self.xfm_name(prev),
                            self.xfm_name(xfm)
                        );
                        self.store_file_error(filename, "mxfm_save", &msg, None, None);
                        conflict = true;
                    }
                }
            }
        }
        if conflict {
            return Err(Error::MultipleTransforms(tpath));
        }
        match owner {
            Some(xfm) => self.transform_save(xfm, &tpath, node),
            None => {
                let children: Vec<NodeId> = self.tree.children(node).to_vec();
                let mut result = Ok(());
                for child in children {
                    if let Err(err) = self.save_subtree(child, &tpath) {
                        result = Err(err);
                    }
                }
                result
            }
        }
    }

    fn xfm_name(&self, xfm: NodeId) -> String {
        self.tree.label(xfm).unwrap_or("(anonymous)").to_string()
    }

    /// Save one file through its transform.
    fn transform_save(&mut self, xfm: NodeId, tpath: &str, node: NodeId) -> Result<()> {
        let filename = &tpath["/files".len()..];
        let lens_name = self
            .tree
            .child(xfm, "lens")
            .and_then(|n| self.tree.value(n))
            .map(str::to_string)
            .ok_or_else(|| Error::NoLens(self.xfm_name(xfm)))?;
        let lens = self.lens_by_name(&lens_name)?;

        let fs_path = self.fs_path(filename);
        let exists = fs_path.exists();
        let mut text = if exists {
            match fs::read_to_string(&fs_path) {
                Ok(t) => t,
                Err(err) => {
                    self.store_file_error(filename, "put_read", &err.to_string(), None, None);
                    return Err(Error::Io {
                        path: fs_path.display().to_string(),
                        msg: err.to_string(),
                    });
                }
            }
        } else {
            String::new()
        };
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }

        let children: Vec<NodeId> = self.tree.children(node).to_vec();
        let rendered = match put::put(&lens, &self.tree, &children, &text) {
            Ok(out) => out,
            Err(err) => {
                self.store_put_error(filename, &err);
                return Err(Error::Parse(err));
            }
        };

        // A byte-identical result means there is nothing to write.
        if exists && rendered == text {
            debug!("save: {} unchanged", filename);
            self.store_file_info(filename, tpath, &lens_name, false);
            return Ok(());
        }

        if self.flags.contains(Flags::SAVE_NOOP) {
            self.store_file_info(filename, tpath, &lens_name, false);
            return self.file_saved_event(tpath);
        }

        let dest = if self.flags.contains(Flags::SAVE_NEWFILE) {
            PathBuf::from(format!("{}.augnew", fs_path.display()))
        } else {
            fs_path.clone()
        };

        if let Err((phase, err)) = write_atomically(&fs_path, &dest, exists, &rendered, self.flags)
        {
            self.store_file_error(filename, phase, &err.to_string(), None, None);
            return Err(Error::Io {
                path: dest.display().to_string(),
                msg: err.to_string(),
            });
        }

        let force_reload = self.flags.contains(Flags::SAVE_NEWFILE);
        self.store_file_info(filename, tpath, &lens_name, force_reload);
        self.file_saved_event(tpath)
    }

    fn file_saved_event(&mut self, tpath: &str) -> Result<()> {
        let events = self.meta_path("events");
        self.tree.append(events, Some("saved"), Some(tpath));
        Ok(())
    }
}

fn strip_root(root: &str, path: &Path) -> Option<String> {
    let s = path.to_string_lossy();
    let rel = s.strip_prefix(root)?;
    if rel.starts_with('/') {
        Some(rel.to_string())
    } else {
        Some(format!("/{}", rel))
    }
}

fn mtime_string(path: &Path) -> Option<String> {
    let meta = fs::metadata(path).ok()?;
    let mtime = meta.modified().ok()?;
    let secs = mtime.duration_since(UNIX_EPOCH).ok()?.as_secs();
    Some(secs.to_string())
}

/// Write `content` to `dest` through a temp file in the same
/// directory: transfer attributes, back the original up if requested,
/// then rename into place.
fn write_atomically(
    original: &Path,
    dest: &Path,
    original_exists: bool,
    content: &str,
    flags: Flags,
) -> std::result::Result<(), (&'static str, std::io::Error)> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| ("mkdir", e))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(
            "{}.",
            dest.file_name().unwrap_or_default().to_string_lossy()
        ))
        .tempfile_in(dir)
        .map_err(|e| ("mk_augtemp", e))?;

    if original_exists {
        // Carry mode and ownership over to the new file.
        let meta = fs::metadata(original).map_err(|e| ("stat_augorig", e))?;
        fs::set_permissions(tmp.path(), meta.permissions()).map_err(|e| ("set_mode", e))?;
        use std::os::unix::fs::MetadataExt;
        std::os::unix::fs::chown(tmp.path(), Some(meta.uid()), Some(meta.gid()))
            .map_err(|e| ("set_owner", e))?;
    } else {
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o644))
            .map_err(|e| ("create_chmod", e))?;
    }

    tmp.write_all(content.as_bytes())
        .map_err(|e| ("write_augtemp", e))?;
    tmp.flush().map_err(|e| ("flush_augtemp", e))?;

    if original_exists && flags.contains(Flags::SAVE_BACKUP) && !flags.contains(Flags::SAVE_NEWFILE)
    {
        let backup = PathBuf::from(format!("{}.augsave", original.display()));
        fs::copy(original, &backup).map_err(|e| ("clone_augsave", e))?;
    }

    tmp.persist(dest).map_err(|e| ("rename", e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lens;
    use crate::rx::Regex;
    use pretty_assertions::assert_eq;

    fn kv_lens() -> Rc<Lens> {
        let re = |p| Regex::parse(p).unwrap();
        let entry = lens::concat(
            lens::key(re("[a-z]+")),
            lens::concat(
                lens::del(re("="), "=").unwrap(),
                lens::concat(
                    lens::store(re("[0-9]+")),
                    lens::del(re("\n"), "\n").unwrap(),
                ),
            ),
        );
        lens::star(lens::subtree(entry))
    }

    fn sandbox() -> (tempfile::TempDir, Augeas) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        let mut aug = Augeas::init(
            Some(dir.path().to_str().unwrap()),
            None,
            Flags::NO_LOAD,
        )
        .unwrap();
        aug.register_lens("Kv.lns", kv_lens()).unwrap();
        aug.transform("Kv.lns", &["/etc/app.conf"], &[]).unwrap();
        (dir, aug)
    }

    #[test]
    fn load_parses_files_into_tree() {
        let (dir, mut aug) = sandbox();
        fs::write(dir.path().join("etc/app.conf"), "a=1\nb=2\n").unwrap();
        aug.load().unwrap();
        assert_eq!(
            aug.get("/files/etc/app.conf/a").unwrap(),
            Some("1".into())
        );
        assert_eq!(
            aug.get("/augeas/files/etc/app.conf/path").unwrap(),
            Some("/files/etc/app.conf".into())
        );
        assert!(aug.get("/augeas/files/etc/app.conf/mtime").unwrap().is_some());
    }

    #[test]
    fn load_records_parse_errors() {
        let (dir, mut aug) = sandbox();
        fs::write(dir.path().join("etc/app.conf"), "a=1\nbroken line\n").unwrap();
        aug.load().unwrap();
        assert_eq!(
            aug.get("/augeas/files/etc/app.conf/error").unwrap(),
            Some("parse_failed".into())
        );
        assert_eq!(
            aug.get("/augeas/files/etc/app.conf/error/line").unwrap(),
            Some("2".into())
        );
        assert!(aug.matches("/files/etc/app.conf").unwrap().is_empty());
    }

    #[test]
    fn save_writes_changes_and_events() {
        let (dir, mut aug) = sandbox();
        let file = dir.path().join("etc/app.conf");
        fs::write(&file, "a=1\nb=2\n").unwrap();
        aug.load().unwrap();
        aug.set("/files/etc/app.conf/b", Some("20")).unwrap();
        aug.save().unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "a=1\nb=20\n");
        assert_eq!(
            aug.get("/augeas/events/saved").unwrap(),
            Some("/files/etc/app.conf".into())
        );
    }

    #[test]
    fn save_is_idempotent() {
        let (dir, mut aug) = sandbox();
        let file = dir.path().join("etc/app.conf");
        fs::write(&file, "a=1\n").unwrap();
        aug.load().unwrap();
        aug.set("/files/etc/app.conf/a", Some("2")).unwrap();
        aug.save().unwrap();
        let mtime1 = fs::metadata(&file).unwrap().modified().unwrap();
        aug.save().unwrap();
        // Nothing dirty: no event, no rewrite.
        assert!(aug.matches("/augeas/events/saved").unwrap().is_empty());
        assert_eq!(fs::metadata(&file).unwrap().modified().unwrap(), mtime1);
    }

    #[test]
    fn save_creates_new_files() {
        let (dir, mut aug) = sandbox();
        aug.load().unwrap();
        aug.set("/files/etc/app.conf/port", Some("80")).unwrap();
        aug.save().unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("etc/app.conf")).unwrap(),
            "port=80\n"
        );
    }

    #[test]
    fn backup_mode_keeps_original() {
        let (dir, mut aug) = sandbox();
        let file = dir.path().join("etc/app.conf");
        fs::write(&file, "a=1\n").unwrap();
        aug.load().unwrap();
        aug.set("/augeas/save/mode", Some("backup")).unwrap();
        aug.set("/files/etc/app.conf/a", Some("9")).unwrap();
        aug.save().unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "a=9\n");
        assert_eq!(
            fs::read_to_string(dir.path().join("etc/app.conf.augsave")).unwrap(),
            "a=1\n"
        );
    }

    #[test]
    fn newfile_mode_leaves_original() {
        let (dir, mut aug) = sandbox();
        let file = dir.path().join("etc/app.conf");
        fs::write(&file, "a=1\n").unwrap();
        aug.load().unwrap();
        aug.set("/augeas/save/mode", Some("newfile")).unwrap();
        aug.set("/files/etc/app.conf/a", Some("9")).unwrap();
        aug.save().unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "a=1\n");
        assert_eq!(
            fs::read_to_string(dir.path().join("etc/app.conf.augnew")).unwrap(),
            "a=9\n"
        );
    }

    #[test]
    fn noop_mode_writes_nothing_but_reports() {
        let (dir, mut aug) = sandbox();
        let file = dir.path().join("etc/app.conf");
        fs::write(&file, "a=1\n").unwrap();
        aug.load().unwrap();
        aug.set("/augeas/save/mode", Some("noop")).unwrap();
        aug.set("/files/etc/app.conf/a", Some("9")).unwrap();
        aug.save().unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "a=1\n");
        assert_eq!(
            aug.get("/augeas/events/saved").unwrap(),
            Some("/files/etc/app.conf".into())
        );
    }

    #[test]
    fn save_put_error_keeps_file() {
        let (dir, mut aug) = sandbox();
        let file = dir.path().join("etc/app.conf");
        fs::write(&file, "a=1\n").unwrap();
        aug.load().unwrap();
        aug.set("/files/etc/app.conf/a", Some("not a number"))
            .unwrap();
        assert!(aug.save().is_err());
        assert_eq!(fs::read_to_string(&file).unwrap(), "a=1\n");
        assert_eq!(
            aug.get("/augeas/files/etc/app.conf/error").unwrap(),
            Some("put_failed".into())
        );
        assert!(
            aug.get("/augeas/files/etc/app.conf/error/path")
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn exclude_filters_apply() {
        let (dir, mut aug) = sandbox();
        fs::write(dir.path().join("etc/app.conf"), "a=1\n").unwrap();
        fs::write(dir.path().join("etc/other.conf"), "b=2\n").unwrap();
        aug.transform("Kv.lns", &["/etc/*.conf"], &["other.conf"])
            .unwrap();
        aug.load().unwrap();
        assert!(aug.get("/files/etc/app.conf/a").unwrap().is_some());
        assert!(aug.matches("/files/etc/other.conf").unwrap().is_empty());
    }

    #[test]
    fn conflicting_transforms_are_detected() {
        let (dir, mut aug) = sandbox();
        fs::write(dir.path().join("etc/app.conf"), "a=1\n").unwrap();
        aug.register_lens("Other.lns", kv_lens()).unwrap();
        aug.transform("Other.lns", &["/etc/app.conf"], &[]).unwrap();
        aug.load().unwrap();
        assert_eq!(
            aug.get("/augeas/files/etc/app.conf/error").unwrap(),
            Some("mxfm_load".into())
        );
        assert!(aug.matches("/files/etc/app.conf").unwrap().is_empty());
    }

    #[test]
    fn reload_skips_current_files() {
        let (dir, mut aug) = sandbox();
        let file = dir.path().join("etc/app.conf");
        fs::write(&file, "a=1\n").unwrap();
        aug.load().unwrap();
        // Stale unrelated edits in the tree must survive a reload of
        // an unchanged file.
        aug.set("/files/etc/app.conf/a", Some("5")).unwrap();
        aug.load().unwrap();
        assert_eq!(
            aug.get("/files/etc/app.conf/a").unwrap(),
            Some("1".into())
        );
    }
}
