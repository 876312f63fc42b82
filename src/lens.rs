// Copyright (c) 2025 ETH Zurich
// Fabian Schuiki <fschuiki@iis.ee.ethz.ch>

//! Lens values.
//!
//! A lens is an immutable tagged value built from primitives and
//! combinators. Each lens carries four regex types describing the
//! languages it handles: `ctype` (the concrete text), `atype` (the
//! tree children, over an internal encoding), `ktype` (possible keys)
//! and `vtype` (possible values). The engine reads only the tag, the
//! children and these types; the surface language that produces lens
//! values is out of scope here.

use std::cell::{OnceCell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::{Error, Result};
use crate::rx::{self, Regex};

/// Separator after a value in the tree-child encoding.
pub const ENC_SLASH: char = '\u{1}';
/// Separator between label and value in the tree-child encoding.
pub const ENC_EQ: char = '\u{2}';

/// Encode one tree child for abstract-type matching.
pub fn enc_node(label: Option<&str>, value: Option<&str>) -> String {
    format!(
        "{}{}{}{}",
        label.unwrap_or(""),
        ENC_EQ,
        value.unwrap_or(""),
        ENC_SLASH
    )
}

/// The regex types of a lens.
#[derive(Clone)]
pub struct Types {
    /// The concrete (text) language; absent for recursive lenses,
    /// whose text language need not be regular.
    pub ctype: Option<Rc<Regex>>,
    /// Whether the concrete language contains the empty string.
    pub ctype_nullable: bool,
    /// The abstract (tree) language over the child encoding.
    pub atype: Rc<Regex>,
    /// Keys this lens can produce; `None` if it never produces one.
    pub ktype: Option<Rc<Regex>>,
    /// Values this lens can produce; `None` if it never stores one.
    pub vtype: Option<Rc<Regex>>,
}

impl Types {
    /// Whether the value language contains the empty string.
    pub fn vtype_nullable(&self) -> bool {
        self.vtype.as_ref().is_none_or(|v| v.matches_empty())
    }

    fn bottom() -> Types {
        Types {
            ctype: None,
            ctype_nullable: false,
            atype: Regex::empty_lang(),
            ktype: None,
            vtype: None,
        }
    }
}

/// The shared cell behind a recursive lens.
pub struct RecCell {
    body: RefCell<Option<Rc<Lens>>>,
    types: RefCell<RecTypes>,
}

enum RecTypes {
    Unset,
    Computing,
    Done(Types),
}

/// A handle used to build a recursive lens.
///
/// Mint use-sites with [`Recursion::reference`] while assembling the
/// body, then [`Recursion::bind`] the body to obtain the lens itself.
pub struct Recursion {
    cell: Rc<RecCell>,
}

impl Recursion {
    pub fn new() -> Recursion {
        Recursion {
            cell: Rc::new(RecCell {
                body: RefCell::new(None),
                types: RefCell::new(RecTypes::Unset),
            }),
        }
    }

    /// A lens standing for the recursive call inside the body.
    pub fn reference(&self) -> Rc<Lens> {
        Lens::make(Body::Rec(RecRef::Use(Rc::downgrade(&self.cell))), true)
    }

    /// Install the body and return the finished lens.
    pub fn bind(self, body: Rc<Lens>) -> Result<Rc<Lens>> {
        if self.cell.body.borrow().is_some() {
            return Err(Error::internal("recursive lens bound twice"));
        }
        *self.cell.body.borrow_mut() = Some(body.clone());
        // First pass computes the cell types with recursive references
        // contributing the empty language; the second pass then sees
        // the fixed cell and memoizes exact types everywhere. This is
        // exact when every recursive call sits below a subtree.
        *self.cell.types.borrow_mut() = RecTypes::Computing;
        let (types, _) = body.compute_types();
        *self.cell.types.borrow_mut() = RecTypes::Done(types);
        let (types, _) = body.compute_types();
        *self.cell.types.borrow_mut() = RecTypes::Done(types);
        Ok(Lens::make(Body::Rec(RecRef::Def(self.cell)), true))
    }
}

impl Default for Recursion {
    fn default() -> Recursion {
        Recursion::new()
    }
}

/// A reference from a lens to its recursion cell.
pub enum RecRef {
    /// A call site inside the body; weak to keep the value acyclic.
    Use(Weak<RecCell>),
    /// The externally visible, bound lens.
    Def(Rc<RecCell>),
}

impl RecRef {
    fn cell(&self) -> Rc<RecCell> {
        match self {
            RecRef::Use(w) => w
                .upgrade()
                .expect("recursive lens used after its definition was dropped"),
            RecRef::Def(c) => c.clone(),
        }
    }
}

/// The tag and immediate children of a lens.
pub enum Body {
    Del(Rc<Regex>, String),
    Store(Rc<Regex>),
    Value(String),
    Key(Rc<Regex>),
    Label(String),
    Seq(String),
    Counter(String),
    Concat(Rc<Lens>, Rc<Lens>),
    Union(Rc<Lens>, Rc<Lens>),
    Subtree(Rc<Lens>),
    Star(Rc<Lens>),
    Maybe(Rc<Lens>),
    Square(Rc<Lens>, Rc<Lens>, Rc<Lens>),
    Rec(RecRef),
}

/// A lens value.
pub struct Lens {
    pub body: Body,
    /// Whether this lens contains a recursive reference anywhere.
    pub recursive: bool,
    types: OnceCell<Types>,
}

impl Lens {
    fn make(body: Body, recursive: bool) -> Rc<Lens> {
        Rc::new(Lens {
            body,
            recursive,
            types: OnceCell::new(),
        })
    }

    /// The body of a recursive lens.
    pub fn rec_body(&self) -> Rc<Lens> {
        match &self.body {
            Body::Rec(r) => r
                .cell()
                .body
                .borrow()
                .clone()
                .expect("recursive lens used before bind"),
            _ => panic!("rec_body on a non-recursive lens"),
        }
    }

    /// The lens types, computed on first use.
    pub fn types(&self) -> &Types {
        if self.types.get().is_none() {
            let (types, definitive) = self.compute_types();
            assert!(
                definitive,
                "lens types requested before its recursion was bound"
            );
            let _ = self.types.set(types);
        }
        self.types.get().unwrap()
    }

    /// The concrete type; `None` for recursive lenses.
    pub fn ctype(&self) -> Option<Rc<Regex>> {
        self.types().ctype.clone()
    }

    /// The abstract type over the child encoding.
    pub fn atype(&self) -> Rc<Regex> {
        self.types().atype.clone()
    }

    /// Whether the concrete language matches the empty string.
    pub fn ctype_nullable(&self) -> bool {
        self.types().ctype_nullable
    }

    /// Compute types bottom-up. The boolean is false while the result
    /// depends on a recursion cell that is still being computed.
    fn compute_types(&self) -> (Types, bool) {
        if let Some(t) = self.types.get() {
            return (t.clone(), true);
        }
        let eps = Regex::empty_string;
        let (types, definitive) = match &self.body {
            Body::Del(re, _) => (
                Types {
                    ctype: Some(re.clone()),
                    ctype_nullable: re.matches_empty(),
                    atype: eps(),
                    ktype: None,
                    vtype: None,
                },
                true,
            ),
            Body::Store(re) => (
                Types {
                    ctype: Some(re.clone()),
                    ctype_nullable: re.matches_empty(),
                    atype: eps(),
                    ktype: None,
                    vtype: Some(re.clone()),
                },
                true,
            ),
            Body::Value(s) => (
                Types {
                    ctype: Some(eps()),
                    ctype_nullable: true,
                    atype: eps(),
                    ktype: None,
                    vtype: Some(Regex::literal(s)),
                },
                true,
            ),
            Body::Key(re) => (
                Types {
                    ctype: Some(re.clone()),
                    ctype_nullable: re.matches_empty(),
                    atype: eps(),
                    ktype: Some(re.clone()),
                    vtype: None,
                },
                true,
            ),
            Body::Label(s) => (
                Types {
                    ctype: Some(eps()),
                    ctype_nullable: true,
                    atype: eps(),
                    ktype: Some(Regex::literal(s)),
                    vtype: None,
                },
                true,
            ),
            Body::Seq(_) => (
                Types {
                    ctype: Some(eps()),
                    ctype_nullable: true,
                    atype: eps(),
                    ktype: Some(Regex::parse("[0-9]+").expect("builtin regex")),
                    vtype: None,
                },
                true,
            ),
            Body::Counter(_) => (
                Types {
                    ctype: Some(eps()),
                    ctype_nullable: true,
                    atype: eps(),
                    ktype: None,
                    vtype: None,
                },
                true,
            ),
            Body::Concat(a, b) => {
                let (ta, da) = a.compute_types();
                let (tb, db) = b.compute_types();
                (
                    Types {
                        ctype: match (&ta.ctype, &tb.ctype) {
                            (Some(x), Some(y)) => Some(Regex::concat(x, y)),
                            _ => None,
                        },
                        ctype_nullable: ta.ctype_nullable && tb.ctype_nullable,
                        atype: Regex::concat(&ta.atype, &tb.atype),
                        ktype: join_opt(&ta.ktype, &tb.ktype, Regex::concat),
                        vtype: join_opt(&ta.vtype, &tb.vtype, Regex::concat),
                    },
                    da && db,
                )
            }
            Body::Union(a, b) => {
                let (ta, da) = a.compute_types();
                let (tb, db) = b.compute_types();
                (
                    Types {
                        ctype: match (&ta.ctype, &tb.ctype) {
                            (Some(x), Some(y)) => Some(Regex::union(x, y)),
                            _ => None,
                        },
                        ctype_nullable: ta.ctype_nullable || tb.ctype_nullable,
                        atype: Regex::union(&ta.atype, &tb.atype),
                        ktype: union_opt(&ta.ktype, &tb.ktype),
                        vtype: union_opt(&ta.vtype, &tb.vtype),
                    },
                    da && db,
                )
            }
            Body::Subtree(l) => {
                let (tl, dl) = l.compute_types();
                let k = tl.ktype.clone().unwrap_or_else(eps);
                let v = tl.vtype.clone().unwrap_or_else(eps);
                let enc = Regex::concat(
                    &Regex::concat(&k, &Regex::literal(&ENC_EQ.to_string())),
                    &Regex::concat(&v, &Regex::literal(&ENC_SLASH.to_string())),
                );
                (
                    Types {
                        ctype: tl.ctype.clone(),
                        ctype_nullable: tl.ctype_nullable,
                        atype: enc,
                        ktype: None,
                        vtype: None,
                    },
                    dl,
                )
            }
            Body::Star(l) => {
                let (tl, dl) = l.compute_types();
                (
                    Types {
                        ctype: tl.ctype.as_ref().map(Regex::iter),
                        ctype_nullable: true,
                        atype: Regex::iter(&tl.atype),
                        ktype: tl.ktype.as_ref().map(Regex::iter),
                        vtype: tl.vtype.as_ref().map(Regex::iter),
                    },
                    dl,
                )
            }
            Body::Maybe(l) => {
                let (tl, dl) = l.compute_types();
                (
                    Types {
                        ctype: tl.ctype.as_ref().map(Regex::optional),
                        ctype_nullable: true,
                        atype: Regex::optional(&tl.atype),
                        ktype: tl.ktype.as_ref().map(Regex::optional),
                        vtype: tl.vtype.as_ref().map(Regex::optional),
                    },
                    dl,
                )
            }
            Body::Square(k, b, e) => {
                let (tk, dk) = k.compute_types();
                let (tb, db) = b.compute_types();
                let (te, de) = e.compute_types();
                (
                    Types {
                        ctype: match (&tk.ctype, &tb.ctype, &te.ctype) {
                            (Some(x), Some(y), Some(z)) => {
                                Some(Regex::concat(&Regex::concat(x, y), z))
                            }
                            _ => None,
                        },
                        ctype_nullable: tk.ctype_nullable
                            && tb.ctype_nullable
                            && te.ctype_nullable,
                        atype: Regex::concat(&Regex::concat(&tk.atype, &tb.atype), &te.atype),
                        ktype: join_opt(&tk.ktype, &tb.ktype, Regex::concat),
                        vtype: join_opt(&tk.vtype, &tb.vtype, Regex::concat),
                    },
                    dk && db && de,
                )
            }
            Body::Rec(r) => {
                let cell = r.cell();
                let state = cell.types.borrow();
                match &*state {
                    RecTypes::Done(t) => {
                        let mut t = t.clone();
                        // The text language of a recursive lens is not
                        // regular; never advertise a ctype for it.
                        t.ctype = None;
                        (t, true)
                    }
                    _ => (Types::bottom(), false),
                }
            }
        };
        if definitive {
            let _ = self.types.set(types.clone());
        }
        (types, definitive)
    }
}

fn join_opt(
    a: &Option<Rc<Regex>>,
    b: &Option<Rc<Regex>>,
    f: impl Fn(&Rc<Regex>, &Rc<Regex>) -> Rc<Regex>,
) -> Option<Rc<Regex>> {
    match (a, b) {
        (Some(x), Some(y)) => Some(f(x, y)),
        (Some(x), None) => Some(x.clone()),
        (None, Some(y)) => Some(y.clone()),
        (None, None) => None,
    }
}

fn union_opt(a: &Option<Rc<Regex>>, b: &Option<Rc<Regex>>) -> Option<Rc<Regex>> {
    match (a, b) {
        (Some(x), Some(y)) => Some(Regex::union(x, y)),
        (Some(x), None) => Some(Regex::optional(x)),
        (None, Some(y)) => Some(Regex::optional(y)),
        (None, None) => None,
    }
}

impl fmt::Display for Lens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            Body::Del(re, _) => write!(f, "del /{}/", re),
            Body::Store(re) => write!(f, "store /{}/", re),
            Body::Value(s) => write!(f, "value {:?}", s),
            Body::Key(re) => write!(f, "key /{}/", re),
            Body::Label(s) => write!(f, "label {:?}", s),
            Body::Seq(n) => write!(f, "seq {:?}", n),
            Body::Counter(n) => write!(f, "counter {:?}", n),
            Body::Concat(a, b) => write!(f, "({} . {})", a, b),
            Body::Union(a, b) => write!(f, "({} | {})", a, b),
            Body::Subtree(l) => write!(f, "[ {} ]", l),
            Body::Star(l) => write!(f, "({})*", l),
            Body::Maybe(l) => write!(f, "({})?", l),
            Body::Square(k, b, _) => write!(f, "square {} {}", k, b),
            Body::Rec(_) => write!(f, "rec"),
        }
    }
}

impl fmt::Debug for Lens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// `del RE DEFAULT`: match and discard text, emit `DEFAULT` when
/// creating. The default must itself match the regex.
pub fn del(re: Rc<Regex>, dflt: &str) -> Result<Rc<Lens>> {
    if !re.matches(dflt) {
        return Err(Error::Syntax(format!(
            "default value {:?} does not match /{}/",
            dflt, re
        )));
    }
    Ok(Lens::make(Body::Del(re, dflt.to_string()), false))
}

/// `store RE`: match text and store it as the node value.
pub fn store(re: Rc<Regex>) -> Rc<Lens> {
    Lens::make(Body::Store(re), false)
}

/// `value S`: consume nothing, set the node value to `S`.
pub fn value(s: &str) -> Rc<Lens> {
    Lens::make(Body::Value(s.to_string()), false)
}

/// `key RE`: match text and use it as the node label.
pub fn key(re: Rc<Regex>) -> Rc<Lens> {
    Lens::make(Body::Key(re), false)
}

/// `label S`: consume nothing, use `S` as the node label.
pub fn label(s: &str) -> Rc<Lens> {
    Lens::make(Body::Label(s.to_string()), false)
}

/// `seq NAME`: use the next value of counter `NAME` as the label.
pub fn seq(name: &str) -> Rc<Lens> {
    Lens::make(Body::Seq(name.to_string()), false)
}

/// `counter NAME`: reset counter `NAME` to 1.
pub fn counter(name: &str) -> Rc<Lens> {
    Lens::make(Body::Counter(name.to_string()), false)
}

/// Concatenation `a . b`.
pub fn concat(a: Rc<Lens>, b: Rc<Lens>) -> Rc<Lens> {
    let rec = a.recursive || b.recursive;
    Lens::make(Body::Concat(a, b), rec)
}

/// Union `a | b`; the branches must be distinguishable.
pub fn union(a: Rc<Lens>, b: Rc<Lens>) -> Rc<Lens> {
    let rec = a.recursive || b.recursive;
    Lens::make(Body::Union(a, b), rec)
}

/// `[ l ]`: collect everything `l` produces under one tree node.
pub fn subtree(l: Rc<Lens>) -> Rc<Lens> {
    let rec = l.recursive;
    Lens::make(Body::Subtree(l), rec)
}

/// Iteration `l*`.
pub fn star(l: Rc<Lens>) -> Rc<Lens> {
    let rec = l.recursive;
    Lens::make(Body::Star(l), rec)
}

/// Option `l?`.
pub fn maybe(l: Rc<Lens>) -> Rc<Lens> {
    let rec = l.recursive;
    Lens::make(Body::Maybe(l), rec)
}

/// `square k body e`: `e` must consume the same text `k` matched.
pub fn square(k: Rc<Lens>, body: Rc<Lens>, e: Rc<Lens>) -> Result<Rc<Lens>> {
    if !k.recursive && !e.recursive {
        if let (Some(kc), Some(ec)) = (k.ctype(), e.ctype()) {
            if !Regex::lang_equal(&kc, &ec) {
                return Err(Error::Syntax(format!(
                    "square: left /{}/ and right /{}/ do not match the same language",
                    kc, ec
                )));
            }
        }
    }
    let rec = k.recursive || body.recursive || e.recursive;
    Ok(Lens::make(Body::Square(k, body, e), rec))
}

/// Run the expensive ambiguity checks on a lens.
///
/// Recursive sublenses are exempt: their determinism is enforced by
/// the transducer when a file is actually parsed.
pub fn typecheck(lens: &Rc<Lens>) -> Result<()> {
    if lens.recursive {
        match &lens.body {
            Body::Concat(a, b) | Body::Union(a, b) => {
                typecheck(a)?;
                typecheck(b)?;
            }
            Body::Subtree(l) | Body::Star(l) | Body::Maybe(l) => typecheck(l)?,
            Body::Square(k, b, e) => {
                typecheck(k)?;
                typecheck(b)?;
                typecheck(e)?;
            }
            _ => {}
        }
        return Ok(());
    }
    match &lens.body {
        Body::Concat(a, b) => {
            typecheck(a)?;
            typecheck(b)?;
            let (ca, cb) = (a.ctype().unwrap(), b.ctype().unwrap());
            if let Some(w) = rx::ambiguous_concat(&ca, &cb) {
                return Err(Error::Syntax(format!(
                    "ambiguous concatenation in {}: {:?} splits after {} and after {}",
                    lens, w.text, w.split_a, w.split_b
                )));
            }
            if let Some(w) = rx::ambiguous_concat(&a.atype(), &b.atype()) {
                return Err(Error::Syntax(format!(
                    "ambiguous tree concatenation in {}: {:?}",
                    lens, w.text
                )));
            }
        }
        Body::Union(a, b) => {
            typecheck(a)?;
            typecheck(b)?;
            let (ca, cb) = (a.ctype().unwrap(), b.ctype().unwrap());
            let both = Regex::intersect(&ca, &cb);
            if !both.is_empty_lang() {
                return Err(Error::Syntax(format!(
                    "overlapping union in {}: /{}/ and /{}/ both match some input",
                    lens, ca, cb
                )));
            }
        }
        Body::Star(l) => {
            typecheck(l)?;
            let c = l.ctype().unwrap();
            if c.matches_empty() {
                return Err(Error::Syntax(format!(
                    "iterated lens {} matches the empty string",
                    l
                )));
            }
            if let Some(w) = rx::ambiguous_iter(&c) {
                return Err(Error::Syntax(format!(
                    "ambiguous iteration in {}: {:?}",
                    lens, w.text
                )));
            }
        }
        Body::Subtree(l) | Body::Maybe(l) => typecheck(l)?,
        Body::Square(k, b, e) => {
            typecheck(k)?;
            typecheck(b)?;
            typecheck(e)?;
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn re(pat: &str) -> Rc<Regex> {
        Regex::parse(pat).unwrap()
    }

    /// The key/value line lens used throughout the engine tests:
    /// `[ key /[a-z]+/ . del /=/ "=" . store /[0-9]+/ . del /\n/ "\n" ]*`
    fn kv_lens() -> Rc<Lens> {
        let entry = concat(
            key(re("[a-z]+")),
            concat(
                del(re("="), "=").unwrap(),
                concat(store(re("[0-9]+")), del(re("\n"), "\n").unwrap()),
            ),
        );
        star(subtree(entry))
    }

    #[test]
    fn primitive_types() {
        let d = del(re("[ \t]*"), " ").unwrap();
        assert!(d.ctype_nullable());
        assert!(d.atype().matches(""));
        let k = key(re("[a-z]+"));
        assert_eq!(k.types().ktype.as_ref().unwrap().match_at("abc", 0), Some(3));
        let s = store(re("[0-9]+"));
        assert!(s.types().vtype.is_some());
    }

    #[test]
    fn del_default_must_match() {
        assert!(del(re("[0-9]+"), "x").is_err());
    }

    #[test]
    fn subtree_atype_encodes_key_and_value() {
        let l = kv_lens();
        let enc = enc_node(Some("a"), Some("1"));
        assert!(l.atype().matches(&enc));
        let two = format!("{}{}", enc, enc_node(Some("b"), Some("22")));
        assert!(l.atype().matches(&two));
        assert!(!l.atype().matches(&enc_node(Some("a"), Some("x"))));
    }

    #[test]
    fn typecheck_accepts_deterministic() {
        typecheck(&kv_lens()).unwrap();
    }

    #[test]
    fn typecheck_rejects_ambiguous_concat() {
        let l = concat(
            del(re("a*"), "").unwrap(),
            del(re("a*"), "").unwrap(),
        );
        let err = typecheck(&l).unwrap_err();
        assert!(matches!(err, Error::Syntax(_)));
    }

    #[test]
    fn typecheck_rejects_overlapping_union() {
        let l = union(del(re("a+"), "a").unwrap(), del(re("[a-z]+"), "z").unwrap());
        assert!(typecheck(&l).is_err());
    }

    #[test]
    fn typecheck_rejects_nullable_star() {
        let l = star(del(re("a*"), "").unwrap());
        assert!(typecheck(&l).is_err());
    }

    #[test]
    fn recursion_builds_and_types() {
        // rec x . [ key "(" . x* . del ")" ")" ] | [ key /[a-z]+/ ]
        let r = Recursion::new();
        let inner = union(
            subtree(concat(
                key(re("[(]")),
                concat(star(r.reference()), del(re("[)]"), ")").unwrap()),
            )),
            subtree(key(re("[a-z]+"))),
        );
        let lens = r.bind(inner).unwrap();
        assert!(lens.recursive);
        assert!(lens.ctype().is_none());
        // One level of children: nodes labeled `(` or a word.
        assert!(lens.atype().matches(&enc_node(Some("("), None)));
        assert!(lens.atype().matches(&enc_node(Some("abc"), None)));
    }
}
