// Copyright (c) 2025 ETH Zurich
// Fabian Schuiki <fschuiki@iis.ee.ethz.ch>

//! The regex abstraction the lens engine programs against.
//!
//! Patterns are parsed with `regex-syntax` and lowered onto the byte
//! automata in [`crate::fa`]. Matching is anchored and longest-match,
//! which is what the split search in `get` and `put` relies on.
//! Regexes are 8-bit clean; `.` does not match a newline.

use std::cell::OnceCell;
use std::fmt;
use std::rc::Rc;

use regex_syntax::ParserBuilder;
use regex_syntax::hir::{Class, Hir, HirKind};

use crate::error::{Error, Result};
use crate::fa::{self, Dfa, Nfa};

/// A compiled regular expression.
///
/// Values are immutable after construction and shared via `Rc`; the
/// DFA is compiled on first use and cached.
pub struct Regex {
    /// The printable pattern, used in diagnostics.
    src: String,
    imp: Imp,
    dfa: OnceCell<Rc<Dfa>>,
}

enum Imp {
    /// Built from a pattern or by composition.
    Nfa(Nfa),
    /// Derived through a language operation; only exists as a DFA.
    Dfa(Rc<Dfa>),
}

impl fmt::Debug for Regex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/", self.src)
    }
}

impl fmt::Display for Regex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.src)
    }
}

impl Regex {
    /// Parse a pattern into a regex.
    pub fn parse(pattern: &str) -> Result<Rc<Regex>> {
        Regex::parse_flags(pattern, false)
    }

    /// Parse a pattern, optionally case-insensitive.
    pub fn parse_flags(pattern: &str, nocase: bool) -> Result<Rc<Regex>> {
        let hir = ParserBuilder::new()
            .utf8(false)
            .unicode(false)
            .case_insensitive(nocase)
            .build()
            .parse(pattern)
            .map_err(|e| Error::Syntax(format!("invalid regexp /{}/: {}", pattern, e)))?;
        let nfa = lower(&hir)?;
        Ok(Rc::new(Regex {
            src: pattern.to_string(),
            imp: Imp::Nfa(nfa),
            dfa: OnceCell::new(),
        }))
    }

    /// A regex matching exactly `text`.
    pub fn literal(text: &str) -> Rc<Regex> {
        let mut nfa = Nfa::empty_string();
        for &b in text.as_bytes() {
            let prev = nfa.accept;
            let next = nfa.add_state();
            nfa.add_range(prev, b, b, next);
            nfa.accept = next;
        }
        Rc::new(Regex {
            src: escape(text),
            imp: Imp::Nfa(nfa),
            dfa: OnceCell::new(),
        })
    }

    /// The regex matching only the empty string.
    pub fn empty_string() -> Rc<Regex> {
        Regex::literal("")
    }

    /// The regex matching nothing at all.
    pub fn empty_lang() -> Rc<Regex> {
        Rc::new(Regex {
            src: "[]".into(),
            imp: Imp::Nfa(Nfa::empty_lang()),
            dfa: OnceCell::new(),
        })
    }

    fn nfa(&self) -> Nfa {
        match &self.imp {
            Imp::Nfa(nfa) => nfa.clone(),
            // Derived regexes re-enter composition through their DFA.
            Imp::Dfa(_) => dfa_to_nfa(self.dfa()),
        }
    }

    /// Concatenation `a · b`.
    pub fn concat(a: &Rc<Regex>, b: &Rc<Regex>) -> Rc<Regex> {
        Rc::new(Regex {
            src: format!("{}{}", group(&a.src), group(&b.src)),
            imp: Imp::Nfa(Nfa::concat(&a.nfa(), &b.nfa())),
            dfa: OnceCell::new(),
        })
    }

    /// Union `a | b`.
    pub fn union(a: &Rc<Regex>, b: &Rc<Regex>) -> Rc<Regex> {
        Rc::new(Regex {
            src: format!("{}|{}", group(&a.src), group(&b.src)),
            imp: Imp::Nfa(Nfa::union(&a.nfa(), &b.nfa())),
            dfa: OnceCell::new(),
        })
    }

    /// Kleene star `a*`.
    pub fn iter(a: &Rc<Regex>) -> Rc<Regex> {
        Rc::new(Regex {
            src: format!("{}*", group(&a.src)),
            imp: Imp::Nfa(Nfa::iter(&a.nfa(), 0, None)),
            dfa: OnceCell::new(),
        })
    }

    /// Option `a?`.
    pub fn optional(a: &Rc<Regex>) -> Rc<Regex> {
        Rc::new(Regex {
            src: format!("{}?", group(&a.src)),
            imp: Imp::Nfa(Nfa::union(&a.nfa(), &Nfa::empty_string())),
            dfa: OnceCell::new(),
        })
    }

    /// Intersection of the two languages.
    pub fn intersect(a: &Rc<Regex>, b: &Rc<Regex>) -> Rc<Regex> {
        Rc::new(Regex {
            src: format!("{}&{}", group(&a.src), group(&b.src)),
            imp: Imp::Dfa(Rc::new(Dfa::intersect(a.dfa(), b.dfa()))),
            dfa: OnceCell::new(),
        })
    }

    /// Difference `L(a) \ L(b)`.
    pub fn minus(a: &Rc<Regex>, b: &Rc<Regex>) -> Rc<Regex> {
        Rc::new(Regex {
            src: format!("{}-{}", group(&a.src), group(&b.src)),
            imp: Imp::Dfa(Rc::new(Dfa::minus(a.dfa(), b.dfa()))),
            dfa: OnceCell::new(),
        })
    }

    fn dfa(&self) -> &Dfa {
        self.dfa
            .get_or_init(|| match &self.imp {
                Imp::Nfa(nfa) => Rc::new(Dfa::from_nfa(nfa)),
                Imp::Dfa(dfa) => dfa.clone(),
            })
            .as_ref()
    }

    /// Longest anchored match starting at byte offset `start`.
    pub fn match_at(&self, text: &str, start: usize) -> Option<usize> {
        self.dfa().match_at(text.as_bytes(), start)
    }

    /// Whether the regex matches all of `text`.
    pub fn matches(&self, text: &str) -> bool {
        self.dfa().accepts(text.as_bytes())
    }

    /// Whether the regex matches exactly `text[start..end]`.
    pub fn matches_range(&self, text: &str, start: usize, end: usize) -> bool {
        self.dfa().accepts(&text.as_bytes()[start..end])
    }

    /// Every offset `j` such that the regex matches `text[start..j]`,
    /// capped at `end`, in increasing order.
    pub fn match_ends(&self, text: &str, start: usize, end: usize) -> Vec<usize> {
        self.dfa().match_ends(text.as_bytes(), start, end)
    }

    /// The offset where matching `text[start..]` stops making
    /// progress; used for error positions.
    pub fn die_pos(&self, text: &str, start: usize) -> usize {
        self.dfa().die_pos(text.as_bytes(), start)
    }

    /// Whether the empty string is in the language.
    pub fn matches_empty(&self) -> bool {
        self.dfa().matches_empty()
    }

    /// Whether the language is empty.
    pub fn is_empty_lang(&self) -> bool {
        self.dfa().is_empty_lang()
    }

    /// Whether the two regexes denote the same language.
    pub fn lang_equal(a: &Regex, b: &Regex) -> bool {
        Dfa::minus(a.dfa(), b.dfa()).is_empty_lang()
            && Dfa::minus(b.dfa(), a.dfa()).is_empty_lang()
    }

    /// The printable pattern.
    pub fn source(&self) -> &str {
        &self.src
    }
}

/// A concatenation/iteration ambiguity witness, see [`fa::Ambiguity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ambiguity {
    /// The witness string `u·p·v` (lossy if not valid UTF-8).
    pub text: String,
    /// The two distinct split offsets.
    pub split_a: usize,
    pub split_b: usize,
}

impl From<fa::Ambiguity> for Ambiguity {
    fn from(a: fa::Ambiguity) -> Ambiguity {
        Ambiguity {
            text: String::from_utf8_lossy(&a.text).into_owned(),
            split_a: a.split_a,
            split_b: a.split_b,
        }
    }
}

/// A witness that `a · b` can be split in two ways, if any.
pub fn ambiguous_concat(a: &Regex, b: &Regex) -> Option<Ambiguity> {
    fa::ambiguous_concat(a.dfa(), b.dfa()).map(Into::into)
}

/// A witness that iterating `r` is ambiguous, if any.
pub fn ambiguous_iter(r: &Regex) -> Option<Ambiguity> {
    fa::ambiguous_iter(r.dfa()).map(Into::into)
}

/// Lower a `regex-syntax` HIR node onto an NFA.
fn lower(hir: &Hir) -> Result<Nfa> {
    match hir.kind() {
        HirKind::Empty => Ok(Nfa::empty_string()),
        HirKind::Literal(lit) => {
            let mut nfa = Nfa::empty_string();
            for &b in lit.0.iter() {
                let prev = nfa.accept;
                let next = nfa.add_state();
                nfa.add_range(prev, b, b, next);
                nfa.accept = next;
            }
            Ok(nfa)
        }
        HirKind::Class(class) => {
            let mut nfa = Nfa::default();
            let s = nfa.add_state();
            let f = nfa.add_state();
            match class {
                Class::Bytes(cls) => {
                    for r in cls.ranges() {
                        nfa.add_range(s, r.start(), r.end(), f);
                    }
                }
                Class::Unicode(cls) => {
                    // The parser runs in byte mode; clamp any stray
                    // unicode class to the byte range.
                    for r in cls.ranges() {
                        let lo = r.start() as u32;
                        let hi = r.end() as u32;
                        if lo > 0xff {
                            continue;
                        }
                        nfa.add_range(s, lo as u8, hi.min(0xff) as u8, f);
                    }
                }
            }
            nfa.start = s;
            nfa.accept = f;
            Ok(nfa)
        }
        HirKind::Repetition(rep) => {
            let sub = lower(&rep.sub)?;
            Ok(Nfa::iter(&sub, rep.min, rep.max))
        }
        HirKind::Capture(cap) => lower(&cap.sub),
        HirKind::Concat(parts) => {
            let mut acc = Nfa::empty_string();
            for p in parts {
                acc = Nfa::concat(&acc, &lower(p)?);
            }
            Ok(acc)
        }
        HirKind::Alternation(parts) => {
            let mut acc: Option<Nfa> = None;
            for p in parts {
                let sub = lower(p)?;
                acc = Some(match acc {
                    None => sub,
                    Some(prev) => Nfa::union(&prev, &sub),
                });
            }
            Ok(acc.unwrap_or_else(Nfa::empty_lang))
        }
        HirKind::Look(_) => Err(Error::Syntax(
            "anchors and look-around are not supported in lens regexps".into(),
        )),
    }
}

/// Rebuild an NFA from a DFA so derived regexes stay composable.
fn dfa_to_nfa(dfa: &Dfa) -> Nfa {
    let mut nfa = Nfa::default();
    let n = dfa.num_states();
    let base: Vec<u32> = (0..n).map(|_| nfa.add_state()).collect();
    let f = nfa.add_state();
    for s in 0..n as u32 {
        for byte in 0..=255u8 {
            let t = dfa.step(s, byte);
            if t != fa::DEAD {
                nfa.add_range(base[s as usize], byte, byte, base[t as usize]);
            }
        }
        if dfa.is_accept(s) {
            nfa.add_eps(base[s as usize], f);
        }
    }
    nfa.start = base[dfa.start as usize];
    nfa.accept = f;
    nfa
}

/// Wrap a composed source fragment in parentheses where needed.
fn group(src: &str) -> String {
    if src.len() <= 1 || src.chars().all(|c| c.is_alphanumeric()) {
        src.to_string()
    } else {
        format!("({})", src)
    }
}

/// Escape regex metacharacters in a literal string.
fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if ".[]{}()\\*+?|^$".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_match() {
        let re = Regex::parse("[a-z]+").unwrap();
        assert_eq!(re.match_at("abc=1", 0), Some(3));
        assert_eq!(re.match_at("abc=1", 3), None);
        assert!(!re.matches_empty());
    }

    #[test]
    fn longest_wins_over_alternation_order() {
        let re = Regex::parse("a|ab").unwrap();
        assert_eq!(re.match_at("ab", 0), Some(2));
    }

    #[test]
    fn literal_escapes() {
        let re = Regex::literal("a.b");
        assert!(re.matches("a.b"));
        assert!(!re.matches("axb"));
        assert_eq!(re.source(), "a\\.b");
    }

    #[test]
    fn dot_excludes_newline() {
        let re = Regex::parse(".*").unwrap();
        assert_eq!(re.match_at("ab\ncd", 0), Some(2));
    }

    #[test]
    fn composition() {
        let a = Regex::parse("[a-z]+").unwrap();
        let b = Regex::literal("=");
        let re = Regex::concat(&a, &b);
        assert!(re.matches("abc="));
        let opt = Regex::optional(&b);
        assert!(opt.matches(""));
        assert!(opt.matches("="));
    }

    #[test]
    fn intersection_composes_further() {
        let a = Regex::parse("[a-c]+").unwrap();
        let b = Regex::parse("[b-z]+").unwrap();
        let i = Regex::intersect(&a, &b);
        assert!(i.matches("bcb"));
        assert!(!i.matches("a"));
        let again = Regex::concat(&i, &Regex::literal("!"));
        assert!(again.matches("bc!"));
    }

    #[test]
    fn ambiguity_witness() {
        let astar = Regex::parse("a*").unwrap();
        let w = ambiguous_concat(&astar, &astar).expect("ambiguous");
        assert!(w.split_a < w.split_b);
        let det = Regex::parse("a+").unwrap();
        let bs = Regex::parse("b+").unwrap();
        assert!(ambiguous_concat(&det, &bs).is_none());
    }

    #[test]
    fn nocase() {
        let re = Regex::parse_flags("abc", true).unwrap();
        assert!(re.matches("AbC"));
    }
}
