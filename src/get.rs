// Copyright (c) 2025 ETH Zurich
// Fabian Schuiki <fschuiki@iis.ee.ethz.ch>

//! The `get` direction: text to tree.
//!
//! Besides the tree, `get` produces a *skeleton* holding the text that
//! has no tree counterpart (deleted delimiters, whitespace) and a
//! *dictionary* mapping subtree keys to their skeletons. `put` feeds
//! on both to reproduce the original formatting.
//!
//! Non-recursive lenses are evaluated directly; recursive ones parse
//! through the transducer in [`crate::jmt`] and fold the visitor
//! events through a frame stack into the same shapes.

use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;
use log::trace;

use crate::error::LnsError;
use crate::jmt::{self, Jmt, Visitor};
use crate::lens::{Body, Lens};
use crate::tree::{Fragment, Span};

/// Residual text captured during `get`, shaped like the lens that
/// produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Skel {
    /// Text consumed by a `del`.
    Del(String),
    /// Marker for primitives that own no text in the output.
    Unit,
    Concat(Vec<Skel>),
    Star(Vec<Skel>),
    Maybe(Option<Box<Skel>>),
    /// Marker for a subtree; its contents live in the dictionary.
    Subtree,
    /// Exactly `[left, body, right]`.
    Square(Vec<Skel>),
}

impl Skel {
    /// Whether this skeleton was produced by a lens shaped like
    /// `lens`, so `put` may reuse it.
    pub fn instance_of(&self, lens: &Lens) -> bool {
        match (&lens.body, self) {
            (Body::Del(re, _), Skel::Del(text)) => re.matches(text),
            (
                Body::Store(_)
                | Body::Key(_)
                | Body::Value(_)
                | Body::Label(_)
                | Body::Seq(_)
                | Body::Counter(_),
                Skel::Unit,
            ) => true,
            (Body::Concat(a, b), Skel::Concat(v)) => {
                v.len() == 2 && v[0].instance_of(a) && v[1].instance_of(b)
            }
            (Body::Union(a, b), _) => self.instance_of(a) || self.instance_of(b),
            (Body::Subtree(_), Skel::Subtree) => true,
            (Body::Star(l), Skel::Star(v)) => v.iter().all(|s| s.instance_of(l)),
            (Body::Maybe(l), Skel::Maybe(o)) => o.as_ref().is_none_or(|s| s.instance_of(l)),
            (Body::Square(k, b, e), Skel::Square(v)) => {
                v.len() == 3
                    && v[0].instance_of(k)
                    && v[1].instance_of(b)
                    && v[2].instance_of(e)
            }
            (Body::Rec(_), _) => self.instance_of(&lens.rec_body()),
            _ => false,
        }
    }
}

/// A FIFO map from subtree keys to their `(skeleton, dictionary)`
/// pairs. Keyless subtrees file under `None`.
#[derive(Debug, Default)]
pub struct Dict {
    map: IndexMap<Option<String>, std::collections::VecDeque<(Skel, Dict)>>,
}

impl Dict {
    /// File an entry under `key`, preserving arrival order.
    pub fn insert(&mut self, key: Option<String>, skel: Skel, dict: Dict) {
        self.map.entry(key).or_default().push_back((skel, dict));
    }

    /// Take the oldest entry filed under `key`.
    pub fn lookup(&mut self, key: Option<&str>) -> Option<(Skel, Dict)> {
        self.map
            .get_mut(&key.map(str::to_string))
            .and_then(|q| q.pop_front())
    }

    /// Append all entries of `other`.
    pub fn merge(&mut self, other: Dict) {
        for (key, queue) in other.map {
            self.map.entry(key).or_default().extend(queue);
        }
    }

    /// Whether no entries are filed.
    pub fn is_empty(&self) -> bool {
        self.map.values().all(|q| q.is_empty())
    }
}

/// The result of a `get`: tree fragments plus skeleton and dictionary.
#[derive(Debug)]
pub struct Parsed {
    pub trees: Vec<Fragment>,
    pub skel: Skel,
    pub dict: Dict,
}

/// Evaluate the `get` direction of `lens` over all of `text`.
pub fn get(
    lens: &Rc<Lens>,
    text: &str,
    filename: Option<Rc<str>>,
    spans: bool,
) -> Result<Parsed, LnsError> {
    if lens.recursive {
        return get_rec(lens, text, filename, spans);
    }
    let ctype = lens
        .ctype()
        .expect("non-recursive lens without a concrete type");
    if !ctype.matches(text) {
        let pos = ctype.die_pos(text, 0);
        return Err(LnsError::at_pos(
            format!("input does not match /{}/", ctype),
            pos,
        )
        .with_lens(lens.to_string()));
    }
    let mut state = GetState {
        text,
        key: None,
        value: None,
        key_span: None,
        value_span: None,
        counters: HashMap::new(),
        spans,
        filename,
    };
    let mut trees = Vec::new();
    let mut dict = Dict::default();
    let skel = state.parse(lens, 0, text.len(), &mut trees, &mut dict)?;
    Ok(Parsed { trees, skel, dict })
}

struct GetState<'a> {
    text: &'a str,
    /// Key and value registers of the innermost subtree.
    key: Option<String>,
    value: Option<String>,
    key_span: Option<(usize, usize)>,
    value_span: Option<(usize, usize)>,
    counters: HashMap<String, u32>,
    spans: bool,
    filename: Option<Rc<str>>,
}

impl<'a> GetState<'a> {
    fn err(&self, msg: String, pos: usize) -> LnsError {
        LnsError::at_pos(msg, pos)
    }

    /// Evaluate `lens` over the region `[start, end)`, which the
    /// caller has already proven to be in the lens's language.
    fn parse(
        &mut self,
        lens: &Rc<Lens>,
        start: usize,
        end: usize,
        trees: &mut Vec<Fragment>,
        dict: &mut Dict,
    ) -> Result<Skel, LnsError> {
        trace!("get: {} on {}..{}", lens, start, end);
        match &lens.body {
            Body::Del(re, _) => {
                if !re.matches_range(self.text, start, end) {
                    return Err(self.err(format!("no match for del /{}/", re), start));
                }
                Ok(Skel::Del(self.text[start..end].to_string()))
            }
            Body::Store(re) => {
                if !re.matches_range(self.text, start, end) {
                    return Err(self.err(format!("no match for store /{}/", re), start));
                }
                self.value = Some(self.text[start..end].to_string());
                self.value_span = Some((start, end));
                Ok(Skel::Unit)
            }
            Body::Value(s) => {
                self.value = Some(s.clone());
                self.value_span = None;
                Ok(Skel::Unit)
            }
            Body::Key(re) => {
                if !re.matches_range(self.text, start, end) {
                    return Err(self.err(format!("no match for key /{}/", re), start));
                }
                self.key = Some(self.text[start..end].to_string());
                self.key_span = Some((start, end));
                Ok(Skel::Unit)
            }
            Body::Label(s) => {
                self.key = Some(s.clone());
                self.key_span = None;
                Ok(Skel::Unit)
            }
            Body::Seq(name) => {
                let ctr = self.counters.entry(name.clone()).or_insert(1);
                self.key = Some(ctr.to_string());
                self.key_span = None;
                *ctr = ctr.checked_add(1).ok_or_else(|| {
                    LnsError::at_pos(format!("seq counter {:?} overflowed", name), start)
                })?;
                Ok(Skel::Unit)
            }
            Body::Counter(name) => {
                self.counters.insert(name.clone(), 1);
                Ok(Skel::Unit)
            }
            Body::Concat(a, b) => {
                let split = self.split_concat(a, b, start, end)?;
                let sa = self.parse(a, start, split, trees, dict)?;
                let sb = self.parse(b, split, end, trees, dict)?;
                Ok(Skel::Concat(vec![sa, sb]))
            }
            Body::Union(a, b) => {
                let ca = a.ctype().expect("non-recursive union branch");
                if ca.matches_range(self.text, start, end) {
                    self.parse(a, start, end, trees, dict)
                } else {
                    self.parse(b, start, end, trees, dict)
                }
            }
            Body::Subtree(l) => {
                let (frag, skel, sub_dict) = self.parse_subtree(l, start, end)?;
                dict.insert(frag.label.clone(), skel, sub_dict);
                trees.push(frag);
                Ok(Skel::Subtree)
            }
            Body::Star(l) => {
                let star_ctype = lens.ctype().expect("non-recursive star");
                let ctype = l.ctype().expect("non-recursive star body");
                let mut skels = Vec::new();
                let mut pos = start;
                while pos < end {
                    let next = self.split_iter(&ctype, &star_ctype, pos, end)?;
                    if next == pos {
                        return Err(self.err(
                            format!("iterated lens {} matched the empty string", l),
                            pos,
                        ));
                    }
                    skels.push(self.parse(l, pos, next, trees, dict)?);
                    pos = next;
                }
                Ok(Skel::Star(skels))
            }
            Body::Maybe(l) => {
                if start == end {
                    Ok(Skel::Maybe(None))
                } else {
                    let skel = self.parse(l, start, end, trees, dict)?;
                    Ok(Skel::Maybe(Some(Box::new(skel))))
                }
            }
            Body::Square(k, b, e) => {
                let (j1, j2) = self.split_square(k, b, e, start, end)?;
                let sk = self.parse(k, start, j1, trees, dict)?;
                let sb = self.parse(b, j1, j2, trees, dict)?;
                let se = self.parse(e, j2, end, trees, dict)?;
                if self.text[start..j1] != self.text[j2..end] {
                    return Err(self.err(
                        format!(
                            "square: mismatched boundaries {:?} and {:?}",
                            &self.text[start..j1],
                            &self.text[j2..end]
                        ),
                        j2,
                    ));
                }
                Ok(Skel::Square(vec![sk, sb, se]))
            }
            Body::Rec(_) => unreachable!("recursive lens inside the direct evaluator"),
        }
    }

    /// Parse the contents of a subtree and build its node.
    fn parse_subtree(
        &mut self,
        l: &Rc<Lens>,
        start: usize,
        end: usize,
    ) -> Result<(Fragment, Skel, Dict), LnsError> {
        let outer_key = self.key.take();
        let outer_value = self.value.take();
        let outer_kspan = self.key_span.take();
        let outer_vspan = self.value_span.take();

        let mut children = Vec::new();
        let mut sub_dict = Dict::default();
        let skel = self.parse(l, start, end, &mut children, &mut sub_dict)?;

        let span = if self.spans {
            let (ks, ke) = self.key_span.unwrap_or((0, 0));
            let (vs, ve) = self.value_span.unwrap_or((0, 0));
            Some(Span {
                filename: self.filename.clone(),
                label_start: ks,
                label_end: ke,
                value_start: vs,
                value_end: ve,
                span_start: start,
                span_end: end,
            })
        } else {
            None
        };
        let frag = Fragment {
            label: self.key.take(),
            value: self.value.take(),
            children,
            span,
        };

        self.key = outer_key;
        self.value = outer_value;
        self.key_span = outer_kspan;
        self.value_span = outer_vspan;
        Ok((frag, skel, sub_dict))
    }

    /// The unique split point for `a . b` over `[start, end)`.
    fn split_concat(
        &self,
        a: &Rc<Lens>,
        b: &Rc<Lens>,
        start: usize,
        end: usize,
    ) -> Result<usize, LnsError> {
        let ca = a.ctype().expect("non-recursive concat operand");
        let cb = b.ctype().expect("non-recursive concat operand");
        let mut valid = ca
            .match_ends(self.text, start, end)
            .into_iter()
            .filter(|&j| cb.matches_range(self.text, j, end));
        let Some(split) = valid.next() else {
            return Err(self.err(
                format!("no split for concatenation /{}/ . /{}/", ca, cb),
                start,
            ));
        };
        if let Some(other) = valid.next() {
            return Err(self.err(
                format!(
                    "ambiguous concatenation: splits at {} and {}",
                    split, other
                ),
                split,
            ));
        }
        Ok(split)
    }

    /// The end of the next iteration of a star over `[pos, end)`.
    fn split_iter(
        &self,
        body: &Rc<crate::rx::Regex>,
        star: &Rc<crate::rx::Regex>,
        pos: usize,
        end: usize,
    ) -> Result<usize, LnsError> {
        let mut valid = body
            .match_ends(self.text, pos, end)
            .into_iter()
            .filter(|&j| j > pos && star.matches_range(self.text, j, end));
        let Some(split) = valid.next() else {
            return Err(self.err(format!("no match in iteration of /{}/", body), pos));
        };
        if let Some(other) = valid.next() {
            return Err(self.err(
                format!("ambiguous iteration: splits at {} and {}", split, other),
                split,
            ));
        }
        Ok(split)
    }

    /// The two split points of `square k body e` over `[start, end)`.
    fn split_square(
        &self,
        k: &Rc<Lens>,
        b: &Rc<Lens>,
        e: &Rc<Lens>,
        start: usize,
        end: usize,
    ) -> Result<(usize, usize), LnsError> {
        let ck = k.ctype().expect("non-recursive square");
        let cb = b.ctype().expect("non-recursive square");
        let ce = e.ctype().expect("non-recursive square");
        let mut found = None;
        for j1 in ck.match_ends(self.text, start, end) {
            let klen = j1 - start;
            if end - j1 < klen {
                continue;
            }
            let j2 = end - klen;
            if self.text[start..j1] != self.text[j2..end] {
                continue;
            }
            if !cb.matches_range(self.text, j1, j2) || !ce.matches_range(self.text, j2, end) {
                continue;
            }
            if found.is_some() {
                return Err(self.err("ambiguous square".to_string(), j1));
            }
            found = Some((j1, j2));
        }
        found.ok_or_else(|| self.err("no match for square".to_string(), start))
    }
}

/// A frame of the recursive-parse visitor, one per open nonterminal.
struct Frame {
    lens: Rc<Lens>,
    trees: Vec<Fragment>,
    skels: Vec<Skel>,
    /// Regions of the skels, for the square boundary check.
    ranges: Vec<(usize, usize)>,
    dict: Dict,
    key: Option<String>,
    value: Option<String>,
    key_span: Option<(usize, usize)>,
    value_span: Option<(usize, usize)>,
    start: usize,
}

struct RecVisitor<'a> {
    text: &'a str,
    frames: Vec<Frame>,
    counters: HashMap<String, u32>,
    spans: bool,
    filename: Option<Rc<str>>,
    error: Option<LnsError>,
}

impl<'a> RecVisitor<'a> {
    fn top(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("visitor frame stack empty")
    }

    fn push(&mut self, lens: &Rc<Lens>, start: usize) {
        self.frames.push(Frame {
            lens: lens.clone(),
            trees: Vec::new(),
            skels: Vec::new(),
            ranges: Vec::new(),
            dict: Dict::default(),
            key: None,
            value: None,
            key_span: None,
            value_span: None,
            start,
        });
    }
}

impl<'a> Visitor for RecVisitor<'a> {
    fn terminal(&mut self, lens: &Rc<Lens>, start: usize, end: usize) -> Result<(), LnsError> {
        let mut state = GetState {
            text: self.text,
            key: None,
            value: None,
            key_span: None,
            value_span: None,
            counters: std::mem::take(&mut self.counters),
            spans: self.spans,
            filename: self.filename.clone(),
        };
        let mut trees = Vec::new();
        let mut dict = Dict::default();
        let skel = state.parse(lens, start, end, &mut trees, &mut dict);
        self.counters = state.counters;
        let skel = skel?;
        let frame = self.frames.last_mut().expect("terminal outside a frame");
        frame.trees.extend(trees);
        frame.skels.push(skel);
        frame.ranges.push((start, end));
        frame.dict.merge(dict);
        if state.key.is_some() {
            frame.key = state.key;
            frame.key_span = state.key_span;
        }
        if state.value.is_some() {
            frame.value = state.value;
            frame.value_span = state.value_span;
        }
        Ok(())
    }

    fn enter(&mut self, lens: &Rc<Lens>, start: usize, _end: usize) -> Result<(), LnsError> {
        self.push(lens, start);
        Ok(())
    }

    fn exit(&mut self, _lens: &Rc<Lens>, start: usize, end: usize) -> Result<(), LnsError> {
        let frame = self.frames.pop().expect("exit without a frame");

        // A subtree closes into one node; its contents go into the
        // parent's dictionary, not its sibling list.
        if matches!(frame.lens.body, Body::Subtree(_)) {
            let span = if self.spans {
                let (ks, ke) = frame.key_span.unwrap_or((0, 0));
                let (vs, ve) = frame.value_span.unwrap_or((0, 0));
                Some(Span {
                    filename: self.filename.clone(),
                    label_start: ks,
                    label_end: ke,
                    value_start: vs,
                    value_end: ve,
                    span_start: start,
                    span_end: end,
                })
            } else {
                None
            };
            let inner = fold_skels(frame.skels);
            let frag = Fragment {
                label: frame.key,
                value: frame.value,
                children: frame.trees,
                span,
            };
            let parent = self.frames.last_mut().expect("exit from the root frame");
            parent.dict.insert(frag.label.clone(), inner, frame.dict);
            parent.trees.push(frag);
            parent.skels.push(Skel::Subtree);
            parent.ranges.push((start, end));
            return Ok(());
        }

        // Everything else passes its collected pieces through.
        if matches!(frame.lens.body, Body::Square(..)) && frame.ranges.len() == 3 {
            let (ks, ke) = frame.ranges[0];
            let (es, ee) = frame.ranges[2];
            if self.text[ks..ke] != self.text[es..ee] {
                return Err(LnsError::at_pos(
                    format!(
                        "square: mismatched boundaries {:?} and {:?}",
                        &self.text[ks..ke],
                        &self.text[es..ee]
                    ),
                    es,
                ));
            }
        }
        let skel = match &frame.lens.body {
            Body::Concat(..) => Skel::Concat(frame.skels),
            Body::Star(_) => Skel::Star(frame.skels),
            Body::Maybe(_) => Skel::Maybe(frame.skels.into_iter().next().map(Box::new)),
            Body::Square(..) => Skel::Square(frame.skels),
            _ => fold_skels(frame.skels),
        };
        let parent = self.frames.last_mut().expect("exit from the root frame");
        parent.trees.extend(frame.trees);
        parent.dict.merge(frame.dict);
        if frame.key.is_some() {
            parent.key = frame.key;
            parent.key_span = frame.key_span;
        }
        if frame.value.is_some() {
            parent.value = frame.value;
            parent.value_span = frame.value_span;
        }
        parent.skels.push(skel);
        parent.ranges.push((start, end));
        Ok(())
    }

    fn error(&mut self, lens: &Rc<Lens>, pos: usize, msg: String) {
        if self.error.is_none() {
            self.error = Some(
                LnsError::at_pos(format!("ambiguous parse: {}", msg), pos)
                    .with_lens(lens.to_string()),
            );
        }
    }
}

/// Collapse the skels a pass-through frame collected into one.
fn fold_skels(mut skels: Vec<Skel>) -> Skel {
    match skels.len() {
        0 => Skel::Unit,
        1 => skels.pop().unwrap(),
        _ => Skel::Concat(skels),
    }
}

/// Recursive `get`: parse through the transducer and fold the visitor
/// events into the usual result shapes.
fn get_rec(
    lens: &Rc<Lens>,
    text: &str,
    filename: Option<Rc<str>>,
    spans: bool,
) -> Result<Parsed, LnsError> {
    let jmt = Jmt::build(lens)?;
    let parse = jmt.parse(text);
    let mut visitor = RecVisitor {
        text,
        frames: Vec::new(),
        counters: HashMap::new(),
        spans,
        filename,
        error: None,
    };
    // Root frame that collects the final result.
    visitor.push(lens, 0);
    match jmt::visit(&jmt, &parse, &mut visitor)? {
        jmt::VisitOutcome::Parsed => {}
        jmt::VisitOutcome::NoParse { longest } => {
            return Err(LnsError::at_pos(
                "input does not match the recursive lens".to_string(),
                longest,
            )
            .with_lens(lens.to_string()));
        }
    }
    if let Some(err) = visitor.error {
        return Err(err);
    }
    let root = visitor.frames.pop().expect("root frame survived the visit");
    Ok(Parsed {
        trees: root.trees,
        skel: fold_skels(root.skels),
        dict: root.dict,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lens::{self};
    use crate::rx::Regex;

    fn re(pat: &str) -> Rc<Regex> {
        Regex::parse(pat).unwrap()
    }

    fn kv_lens() -> Rc<Lens> {
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

    #[test]
    fn kv_get_builds_tree() {
        let parsed = get(&kv_lens(), "a=1\nb=2\n", None, false).unwrap();
        assert_eq!(parsed.trees.len(), 2);
        assert_eq!(parsed.trees[0].label.as_deref(), Some("a"));
        assert_eq!(parsed.trees[0].value.as_deref(), Some("1"));
        assert_eq!(parsed.trees[1].label.as_deref(), Some("b"));
        assert_eq!(parsed.trees[1].value.as_deref(), Some("2"));
        match &parsed.skel {
            Skel::Star(v) => assert_eq!(v.len(), 2),
            other => panic!("unexpected skel {:?}", other),
        }
    }

    #[test]
    fn get_reports_position() {
        let err = get(&kv_lens(), "a=1\nb=x\n", None, false).unwrap_err();
        assert_eq!(err.pos, Some(6));
    }

    #[test]
    fn seq_numbers_entries() {
        // counter "e" . [ seq "e" . store /[a-z]+/ . del /,?/ "," ]*
        let entry = lens::subtree(lens::concat(
            lens::seq("e"),
            lens::concat(
                lens::store(re("[a-z]+")),
                lens::del(re(",?"), ",").unwrap(),
            ),
        ));
        let l = lens::concat(lens::counter("e"), lens::star(entry));
        let parsed = get(&l, "x,y,z", None, false).unwrap();
        let labels: Vec<_> = parsed
            .trees
            .iter()
            .map(|t| t.label.clone().unwrap())
            .collect();
        assert_eq!(labels, ["1", "2", "3"]);
    }

    #[test]
    fn spans_track_offsets() {
        let parsed = get(&kv_lens(), "a=1\nbb=22\n", None, true).unwrap();
        let span = parsed.trees[1].span.as_ref().unwrap();
        assert_eq!((span.label_start, span.label_end), (4, 6));
        assert_eq!((span.value_start, span.value_end), (7, 9));
        assert_eq!((span.span_start, span.span_end), (4, 10));
    }

    #[test]
    fn union_picks_matching_branch() {
        let comment = lens::subtree(lens::concat(
            lens::label("#comment"),
            lens::concat(
                lens::del(re("#"), "#").unwrap(),
                lens::concat(
                    lens::store(re("[^\n]*")),
                    lens::del(re("\n"), "\n").unwrap(),
                ),
            ),
        ));
        let entry = lens::subtree(lens::concat(
            lens::key(re("[a-z]+")),
            lens::concat(
                lens::del(re("="), "=").unwrap(),
                lens::concat(
                    lens::store(re("[0-9]+")),
                    lens::del(re("\n"), "\n").unwrap(),
                ),
            ),
        ));
        let l = lens::star(lens::union(entry, comment));
        let parsed = get(&l, "a=1\n# hi\n", None, false).unwrap();
        assert_eq!(parsed.trees[1].label.as_deref(), Some("#comment"));
        assert_eq!(parsed.trees[1].value.as_deref(), Some(" hi"));
    }

    #[test]
    fn square_checks_boundaries() {
        // square (key /[a-z]+/) (del /-/ "-") (del /[a-z]+/ "x")
        let l = lens::subtree(
            lens::square(
                lens::key(re("[a-z]+")),
                lens::del(re("-"), "-").unwrap(),
                lens::del(re("[a-z]+"), "x").unwrap(),
            )
            .unwrap(),
        );
        let parsed = get(&l, "ab-ab", None, false).unwrap();
        assert_eq!(parsed.trees[0].label.as_deref(), Some("ab"));
        assert!(get(&l, "ab-cd", None, false).is_err());
    }

    #[test]
    fn dict_preserves_fifo_order() {
        let parsed = get(&kv_lens(), "a=1\na=2\n", None, false).unwrap();
        let mut dict = parsed.dict;
        let (first, _) = dict.lookup(Some("a")).unwrap();
        assert!(matches!(first, Skel::Concat(_)));
        assert!(dict.lookup(Some("a")).is_some());
        assert!(dict.lookup(Some("a")).is_none());
    }
}
