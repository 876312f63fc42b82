// Copyright (c) 2025 ETH Zurich
// Fabian Schuiki <fschuiki@iis.ee.ethz.ch>

//! The `put` direction: tree plus original text back to text.
//!
//! `put` walks the lens structure in step with the tree children and
//! the skeleton/dictionary recovered from the current text. Where the
//! tree still matches, the skeleton text is reused so formatting
//! survives; where it changed, text is synthesized from lens
//! defaults (`create`).
//!
//! Children are matched against lens `atype`s through the same
//! encoding the type algebra uses: each child contributes
//! `label \x02 value \x01` to an encoded string, and concatenations,
//! unions and iterations split that string by regex match exactly
//! like `get` splits the input text.

use std::rc::Rc;

use log::trace;

use crate::error::LnsError;
use crate::get::{self, Dict, Skel};
use crate::lens::{Body, Lens, enc_node};
use crate::rx::Regex;
use crate::tree::{NodeId, Tree};

/// Render `children` through `lens`, reusing formatting from `text`.
///
/// `text` is the current concrete form (usually the on-disk file); an
/// empty or whitespace-only text falls back to pure creation.
pub fn put(
    lens: &Rc<Lens>,
    tree: &Tree,
    children: &[NodeId],
    text: &str,
) -> Result<String, LnsError> {
    if text.trim().is_empty() {
        return create(lens, tree, children);
    }
    let parsed = get::get(lens, text, None, false)?;
    let mut state = PutState {
        tree,
        out: String::new(),
        key: None,
        value: None,
        path: String::new(),
    };
    let ctx = EncCtx::build(tree, children);
    let reg = ctx.full_region();
    state.check_atype(lens, &ctx, &reg)?;
    let mut dict = parsed.dict;
    state.put_lens(lens, &ctx, reg, Some(&parsed.skel), &mut dict)?;
    Ok(state.out)
}

/// Render `children` through `lens` with no skeleton at all.
pub fn create(lens: &Rc<Lens>, tree: &Tree, children: &[NodeId]) -> Result<String, LnsError> {
    let mut state = PutState {
        tree,
        out: String::new(),
        key: None,
        value: None,
        path: String::new(),
    };
    let ctx = EncCtx::build(tree, children);
    let reg = ctx.full_region();
    state.check_atype(lens, &ctx, &reg)?;
    let mut dict = Dict::default();
    state.put_lens(lens, &ctx, reg, None, &mut dict)?;
    Ok(state.out)
}

/// The encoded form of one child list.
struct EncCtx<'a> {
    children: &'a [NodeId],
    enc: String,
    /// `bounds[i]..bounds[i+1]` is the encoding of `children[i]`.
    bounds: Vec<usize>,
}

impl<'a> EncCtx<'a> {
    fn build(tree: &Tree, children: &'a [NodeId]) -> EncCtx<'a> {
        let mut enc = String::new();
        let mut bounds = vec![0];
        for &c in children {
            enc.push_str(&enc_node(tree.label(c), tree.value(c)));
            bounds.push(enc.len());
        }
        EncCtx {
            children,
            enc,
            bounds,
        }
    }

    fn full_region(&self) -> Region {
        Region {
            lo: 0,
            hi: self.children.len(),
            estart: 0,
            eend: self.enc.len(),
        }
    }

    /// Map an encoding offset back to a child index; splits always
    /// land on child boundaries for well-typed lenses.
    fn child_at(&self, enc_pos: usize) -> Option<usize> {
        self.bounds.iter().position(|&b| b == enc_pos)
    }
}

/// A contiguous run of children and its encoding range.
#[derive(Clone, Copy, Debug)]
struct Region {
    lo: usize,
    hi: usize,
    estart: usize,
    eend: usize,
}

impl Region {
    fn is_empty(&self) -> bool {
        self.estart == self.eend
    }
}

struct PutState<'a> {
    tree: &'a Tree,
    out: String,
    /// Key and value of the subtree node currently being rendered.
    key: Option<String>,
    value: Option<String>,
    /// Path of that node, for error reporting.
    path: String,
}

impl<'a> PutState<'a> {
    fn err(&self, msg: String) -> LnsError {
        LnsError::at_path(msg, self.path.clone())
    }

    fn check_atype(&self, lens: &Rc<Lens>, ctx: &EncCtx, reg: &Region) -> Result<(), LnsError> {
        if !lens
            .atype()
            .matches_range(&ctx.enc, reg.estart, reg.eend)
        {
            return Err(self.err(format!(
                "tree does not match the lens: {} children rejected by {}",
                reg.hi - reg.lo,
                lens
            )));
        }
        Ok(())
    }

    fn put_lens(
        &mut self,
        lens: &Rc<Lens>,
        ctx: &EncCtx,
        reg: Region,
        skel: Option<&Skel>,
        dict: &mut Dict,
    ) -> Result<(), LnsError> {
        trace!("put: {} over children {}..{}", lens, reg.lo, reg.hi);
        // A skeleton of the wrong shape is as good as none.
        let skel = skel.filter(|s| s.instance_of(lens));
        match &lens.body {
            Body::Del(_, dflt) => {
                match skel {
                    Some(Skel::Del(text)) => self.out.push_str(text),
                    _ => self.out.push_str(dflt),
                }
                Ok(())
            }
            Body::Store(re) => {
                let value = self.value.clone().ok_or_else(|| {
                    self.err(format!("no value to store for {}", lens))
                })?;
                if !re.matches(&value) {
                    return Err(self.err(format!(
                        "value {:?} does not match /{}/",
                        value, re
                    )));
                }
                self.out.push_str(&value);
                Ok(())
            }
            Body::Key(re) => {
                let key = self
                    .key
                    .clone()
                    .ok_or_else(|| self.err(format!("no key for {}", lens)))?;
                if !re.matches(&key) {
                    return Err(self.err(format!("key {:?} does not match /{}/", key, re)));
                }
                self.out.push_str(&key);
                Ok(())
            }
            Body::Value(s) => {
                if self.value.as_deref() != Some(s.as_str()) {
                    return Err(self.err(format!(
                        "expected value {:?}, tree has {:?}",
                        s, self.value
                    )));
                }
                Ok(())
            }
            Body::Label(_) | Body::Seq(_) | Body::Counter(_) => Ok(()),
            Body::Concat(a, b) => {
                let (sa, sb) = match skel {
                    Some(Skel::Concat(v)) => (Some(&v[0]), Some(&v[1])),
                    _ => (None, None),
                };
                let split = self.split_concat(a, b, ctx, &reg)?;
                let (left, right) = split_region(ctx, &reg, split)?;
                self.put_lens(a, ctx, left, sa, dict)?;
                self.put_lens(b, ctx, right, sb, dict)
            }
            Body::Union(a, b) => {
                let branch = if a.atype().matches_range(&ctx.enc, reg.estart, reg.eend) {
                    a
                } else if b.atype().matches_range(&ctx.enc, reg.estart, reg.eend) {
                    b
                } else {
                    return Err(self.err(format!("no union branch matches in {}", lens)));
                };
                // The skeleton is only good if the same branch was
                // taken during get.
                let sub_skel = skel.filter(|s| s.instance_of(branch));
                self.put_lens(branch, ctx, reg, sub_skel, dict)
            }
            Body::Subtree(l) => {
                if reg.hi - reg.lo != 1 {
                    return Err(self.err(format!(
                        "subtree lens {} expects one node, got {}",
                        lens,
                        reg.hi - reg.lo
                    )));
                }
                let node = ctx.children[reg.lo];
                let outer_key = self.key.take();
                let outer_value = self.value.take();
                let outer_path = std::mem::take(&mut self.path);
                // Copy the tree reference out so the sub-context does
                // not pin `self`.
                let tree = self.tree;
                self.key = tree.label(node).map(str::to_string);
                self.value = tree.value(node).map(str::to_string);
                self.path = tree.path_of(node);

                let sub_ctx = EncCtx::build(tree, tree.children(node));
                let sub_reg = sub_ctx.full_region();
                let result = match dict.lookup(tree.label(node)) {
                    Some((sub_skel, mut sub_dict)) => {
                        self.put_lens(l, &sub_ctx, sub_reg, Some(&sub_skel), &mut sub_dict)
                    }
                    None => self.put_lens(l, &sub_ctx, sub_reg, None, &mut Dict::default()),
                };

                self.key = outer_key;
                self.value = outer_value;
                self.path = outer_path;
                result
            }
            Body::Star(l) => {
                let star_atype = lens.atype();
                let atype = l.atype();
                let mut skels = match skel {
                    Some(Skel::Star(v)) => v.iter().collect::<Vec<_>>(),
                    _ => Vec::new(),
                }
                .into_iter();
                let mut at = reg;
                while !at.is_empty() {
                    let split = self.split_iter(&atype, &star_atype, ctx, &at)?;
                    let (head, rest) = split_region(ctx, &at, split)?;
                    // Leftover skeletons past the last child are
                    // dropped; removed entries lose their formatting.
                    self.put_lens(l, ctx, head, skels.next(), dict)?;
                    at = rest;
                }
                Ok(())
            }
            Body::Maybe(l) => {
                let inner = match skel {
                    Some(Skel::Maybe(Some(s))) => Some(s.as_ref()),
                    _ => None,
                };
                if !reg.is_empty() {
                    self.put_lens(l, ctx, reg, inner, dict)
                } else if inner.is_some() && l.atype().matches_empty() {
                    // The optional part owns no tree data but was
                    // present in the text; keep it.
                    self.put_lens(l, ctx, reg, inner, dict)
                } else {
                    Ok(())
                }
            }
            Body::Square(k, b, e) => {
                let (sk, sb) = match skel {
                    Some(Skel::Square(v)) => (Some(&v[0]), Some(&v[1])),
                    _ => (None, None),
                };
                let (j1, j2) = self.split_square(k, b, e, ctx, &reg)?;
                let (kreg, rest) = split_region(ctx, &reg, j1)?;
                let (breg, _ereg) = split_region(ctx, &rest, j2)?;

                let mark = self.out.len();
                self.put_lens(k, ctx, kreg, sk, dict)?;
                let ktext = self.out[mark..].to_string();
                self.put_lens(b, ctx, breg, sb, dict)?;
                // The right boundary replays whatever the left one
                // rendered, so renames stay consistent.
                if let Some(ce) = e.ctype() {
                    if !ce.matches(&ktext) {
                        return Err(self.err(format!(
                            "square: boundary {:?} does not match /{}/",
                            ktext, ce
                        )));
                    }
                }
                self.out.push_str(&ktext);
                Ok(())
            }
            Body::Rec(_) => self.put_lens(&lens.rec_body(), ctx, reg, skel, dict),
        }
    }

    /// The unique split of `reg` between the atypes of `a` and `b`.
    fn split_concat(
        &self,
        a: &Rc<Lens>,
        b: &Rc<Lens>,
        ctx: &EncCtx,
        reg: &Region,
    ) -> Result<usize, LnsError> {
        let (aa, ab) = (a.atype(), b.atype());
        let mut valid = aa
            .match_ends(&ctx.enc, reg.estart, reg.eend)
            .into_iter()
            .filter(|&j| ctx.child_at(j).is_some() && ab.matches_range(&ctx.enc, j, reg.eend));
        let Some(split) = valid.next() else {
            return Err(self.err(format!(
                "no split of the tree between {} and {}",
                a, b
            )));
        };
        if let Some(other) = valid.next() {
            return Err(self.err(format!(
                "ambiguous tree split at {} and {}",
                split, other
            )));
        }
        Ok(split)
    }

    /// The end of the next iteration within `reg`.
    fn split_iter(
        &self,
        atype: &Rc<Regex>,
        star_atype: &Rc<Regex>,
        ctx: &EncCtx,
        reg: &Region,
    ) -> Result<usize, LnsError> {
        let mut valid = atype
            .match_ends(&ctx.enc, reg.estart, reg.eend)
            .into_iter()
            .filter(|&j| {
                j > reg.estart
                    && ctx.child_at(j).is_some()
                    && star_atype.matches_range(&ctx.enc, j, reg.eend)
            });
        let Some(split) = valid.next() else {
            return Err(self.err("no tree match in iteration".to_string()));
        };
        if let Some(other) = valid.next() {
            return Err(self.err(format!(
                "ambiguous tree iteration at {} and {}",
                split, other
            )));
        }
        Ok(split)
    }

    /// The two splits of a square within `reg`.
    fn split_square(
        &self,
        k: &Rc<Lens>,
        b: &Rc<Lens>,
        e: &Rc<Lens>,
        ctx: &EncCtx,
        reg: &Region,
    ) -> Result<(usize, usize), LnsError> {
        let (ak, ab, ae) = (k.atype(), b.atype(), e.atype());
        for j1 in ak.match_ends(&ctx.enc, reg.estart, reg.eend) {
            if ctx.child_at(j1).is_none() {
                continue;
            }
            for j2 in ab.match_ends(&ctx.enc, j1, reg.eend) {
                if ctx.child_at(j2).is_some() && ae.matches_range(&ctx.enc, j2, reg.eend) {
                    return Ok((j1, j2));
                }
            }
        }
        Err(self.err("no tree split for square".to_string()))
    }
}

/// Split a region at encoding offset `split`.
fn split_region(ctx: &EncCtx, reg: &Region, split: usize) -> Result<(Region, Region), LnsError> {
    let child = ctx.child_at(split).ok_or_else(|| {
        LnsError::at_path(
            "tree split does not fall on a node boundary".to_string(),
            String::new(),
        )
    })?;
    Ok((
        Region {
            lo: reg.lo,
            hi: child,
            estart: reg.estart,
            eend: split,
        },
        Region {
            lo: child,
            hi: reg.hi,
            estart: split,
            eend: reg.eend,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lens;
    use crate::tree::Fragment;

    fn re(pat: &str) -> Rc<Regex> {
        Regex::parse(pat).unwrap()
    }

    fn kv_lens() -> Rc<Lens> {
        let entry = lens::concat(
            lens::key(re("[a-z]+")),
            lens::concat(
                lens::del(re("[ ]*=[ ]*"), "=").unwrap(),
                lens::concat(
                    lens::store(re("[0-9]+")),
                    lens::del(re("\n"), "\n").unwrap(),
                ),
            ),
        );
        lens::star(lens::subtree(entry))
    }

    /// Load `text` into a fresh tree under a hidden root node.
    fn load(l: &Rc<Lens>, text: &str) -> (Tree, NodeId) {
        let parsed = get::get(l, text, None, false).unwrap();
        let mut tree = Tree::new();
        let root = tree.append(tree.origin(), Some("file"), None);
        for frag in parsed.trees {
            tree.graft(root, frag);
        }
        (tree, root)
    }

    #[test]
    fn get_put_is_identity() {
        let l = kv_lens();
        let text = "a = 1\nb=2\n";
        let (tree, root) = load(&l, text);
        let out = put(&l, &tree, tree.children(root), text).unwrap();
        assert_eq!(out, text);
    }

    #[test]
    fn value_change_keeps_formatting() {
        let l = kv_lens();
        let text = "a = 1\nb=2\n";
        let (mut tree, root) = load(&l, text);
        let b = tree.child(root, "b").unwrap();
        tree.set_value(b, Some("20"));
        let out = put(&l, &tree, tree.children(root), text).unwrap();
        assert_eq!(out, "a = 1\nb=20\n");
    }

    #[test]
    fn delete_and_insert() {
        let l = kv_lens();
        let text = "a=1\nb=2\n";
        let (mut tree, root) = load(&l, text);
        let a = tree.child(root, "a").unwrap();
        tree.unlink(a);
        let out = put(&l, &tree, tree.children(root), text).unwrap();
        assert_eq!(out, "b=2\n");

        let b = tree.child(root, "b").unwrap();
        let c = tree.insert_sibling(b, "c", false).unwrap();
        tree.set_value(c, Some("3"));
        let out = put(&l, &tree, tree.children(root), text).unwrap();
        assert_eq!(out, "b=2\nc=3\n");
    }

    #[test]
    fn reorder_preserves_original_delimiters() {
        let l = kv_lens();
        let text = "x = 1\ny=2\n";
        let (mut tree, root) = load(&l, text);
        let x = tree.child(root, "x").unwrap();
        tree.rename(x, "w").unwrap();
        let out = put(&l, &tree, tree.children(root), text).unwrap();
        // The renamed entry loses its dictionary entry and is
        // re-created; the untouched entry keeps its spacing.
        assert_eq!(out, "w=1\ny=2\n");
    }

    #[test]
    fn create_uses_defaults() {
        let l = kv_lens();
        let mut tree = Tree::new();
        let root = tree.append(tree.origin(), Some("file"), None);
        tree.graft(root, Fragment::leaf(Some("port"), Some("80")));
        let out = create(&l, &tree, tree.children(root)).unwrap();
        assert_eq!(out, "port=80\n");
    }

    #[test]
    fn create_put_matches_empty_skeleton_put() {
        let l = kv_lens();
        let mut tree = Tree::new();
        let root = tree.append(tree.origin(), Some("file"), None);
        tree.graft(root, Fragment::leaf(Some("a"), Some("1")));
        let created = create(&l, &tree, tree.children(root)).unwrap();
        let putted = put(&l, &tree, tree.children(root), "").unwrap();
        assert_eq!(created, putted);
    }

    #[test]
    fn put_rejects_bad_value() {
        let l = kv_lens();
        let text = "a=1\n";
        let (mut tree, root) = load(&l, text);
        let a = tree.child(root, "a").unwrap();
        tree.set_value(a, Some("not-a-number"));
        let err = put(&l, &tree, tree.children(root), text).unwrap_err();
        assert!(err.path.is_some());
    }

    #[test]
    fn square_renames_both_ends() {
        // square (key /[a-z]+/) (del /-/ "-") (del /[a-z]+/ "x")
        let l = lens::star(lens::subtree(
            lens::square(
                lens::key(re("[a-z]+")),
                lens::del(re("-"), "-").unwrap(),
                lens::del(re("[a-z]+"), "x").unwrap(),
            )
            .unwrap(),
        ));
        let text = "ab-ab";
        let (mut tree, root) = load(&l, text);
        let node = tree.children(root)[0];
        tree.rename(node, "cd").unwrap();
        let out = put(&l, &tree, tree.children(root), text).unwrap();
        assert_eq!(out, "cd-cd");
    }
}
