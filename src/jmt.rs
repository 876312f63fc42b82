// Copyright (c) 2025 ETH Zurich
// Fabian Schuiki <fschuiki@iis.ee.ethz.ch>

//! Earley parsing for recursive lenses over a Jim/Mandelbaum
//! transducer.
//!
//! Recursive lenses double as grammar symbols: recursive sublenses
//! are nonterminals, non-recursive ones are terminals, and a
//! non-recursive lens that matches the empty word participates as
//! both (scanning only ever consumes nonempty input). The transducer
//! is built per lens, determinized, and then driven by an Earley loop
//! whose items carry back-links; the links form the parse forest that
//! [`visit`] replays through a visitor, reporting any ambiguity
//! instead of resolving it silently.

use std::rc::Rc;

use log::trace;
use slotmap::{SlotMap, new_key_type};

use crate::error::LnsError;
use crate::lens::{Body, Lens, RecRef};

new_key_type! {
    struct StateId;
}

/// Pseudo lens indices for transition labels.
const EPS: u32 = u32::MAX;
const CALL: u32 = u32::MAX - 1;
/// Sentinel for absent item/link indices.
const NONE: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Trans {
    to: StateId,
    lens: u32,
}

#[derive(Debug, Default)]
struct State {
    trans: Vec<Trans>,
    /// The lens symbols returned (completed) in this state.
    ret: Vec<u32>,
    /// Stable number used for caller identification during visits.
    num: u32,
    reachable: bool,
    live: bool,
}

impl State {
    fn is_return(&self) -> bool {
        !self.ret.is_empty()
    }

    fn returns(&self, lens: u32) -> bool {
        self.ret.contains(&lens)
    }
}

struct JmtLens {
    lens: Rc<Lens>,
    /// The nonterminal state, present for recursive lenses and for
    /// nullable terminals (which also act as nonterminals).
    state: Option<StateId>,
}

/// A transducer compiled from one (recursive) lens.
pub struct Jmt {
    lenses: Vec<JmtLens>,
    states: SlotMap<StateId, State>,
    start: StateId,
    /// The grammar's start symbol; always index 0.
    lens: u32,
    state_count: u32,
}

impl Jmt {
    /// Compile the transducer for `lens`.
    pub fn build(lens: &Rc<Lens>) -> Result<Jmt, LnsError> {
        let mut jmt = Jmt {
            lenses: Vec::new(),
            states: SlotMap::with_key(),
            start: StateId::default(),
            lens: 0,
            state_count: 0,
        };
        jmt.index_lenses(lens);
        for l in 0..jmt.lenses.len() as u32 {
            jmt.conv_rhs(l);
        }
        jmt.unepsilon();
        jmt.determinize();
        trace!(
            "jmt: built {} states over {} symbols",
            jmt.states.len(),
            jmt.lenses.len()
        );
        Ok(jmt)
    }

    fn make_state(&mut self) -> StateId {
        let num = self.state_count;
        self.state_count += 1;
        let id = self.states.insert(State {
            num,
            ..State::default()
        });
        if self.states.len() == 1 {
            self.start = id;
        }
        id
    }

    fn lens_index(&self, lens: &Rc<Lens>) -> Option<u32> {
        self.lenses
            .iter()
            .position(|jl| Rc::ptr_eq(&jl.lens, lens))
            .map(|i| i as u32)
    }

    fn lens_state(&self, l: u32) -> Option<StateId> {
        self.lenses[l as usize].state
    }

    fn lens_of(&self, l: u32) -> Rc<Lens> {
        self.lenses[l as usize].lens.clone()
    }

    /// Register a lens as a grammar symbol. A nonrecursive lens that
    /// matches epsilon is registered twice: index `l` is its
    /// nonterminal face, `l + 1` the terminal one.
    fn add_lens(&mut self, lens: &Rc<Lens>) -> u32 {
        let l = self.lenses.len() as u32;
        let nullable = !lens.recursive && lens.ctype_nullable();
        self.lenses.push(JmtLens {
            lens: lens.clone(),
            state: None,
        });
        if lens.recursive || nullable {
            let sa = self.make_state();
            self.lenses[l as usize].state = Some(sa);
            if !lens.recursive {
                self.lenses.push(JmtLens {
                    lens: lens.clone(),
                    state: None,
                });
            }
        }
        l
    }

    fn index_lenses(&mut self, lens: &Rc<Lens>) {
        if self.lens_index(lens).is_some() {
            return;
        }
        self.add_lens(lens);
        if !lens.recursive {
            return;
        }
        match &lens.body {
            Body::Concat(a, b) | Body::Union(a, b) => {
                self.index_lenses(a);
                self.index_lenses(b);
            }
            Body::Subtree(l) | Body::Star(l) | Body::Maybe(l) => self.index_lenses(l),
            Body::Square(k, b, e) => {
                self.index_lenses(k);
                self.index_lenses(b);
                self.index_lenses(e);
            }
            Body::Rec(RecRef::Def(_)) => {
                let body = lens.rec_body();
                self.index_lenses(&body);
            }
            // Use sites alias the body already reachable from the
            // definition; recursing would never terminate.
            Body::Rec(RecRef::Use(_)) => {}
            _ => unreachable!("a primitive lens cannot be recursive"),
        }
    }

    fn add_trans(&mut self, from: StateId, to: StateId, lens: u32) {
        self.states[from].trans.push(Trans { to, lens });
    }

    /// The Thompson pair for a symbol occurrence: a call edge plus a
    /// labeled edge over it.
    fn thompson(&mut self, lens: &Rc<Lens>) -> (StateId, StateId) {
        let l = self.lens_index(lens).expect("unindexed lens");
        let sa = self.lens_state(l);
        let s = self.make_state();
        let f = self.make_state();
        if lens.recursive {
            self.add_trans(s, f, l);
            self.add_trans(s, sa.expect("recursive lens without state"), CALL);
        } else if let Some(sa) = sa {
            // A terminal that matches epsilon: also usable as the
            // nonterminal l, with l + 1 the plain terminal.
            self.add_trans(s, f, l);
            self.add_trans(s, sa, CALL);
            self.add_trans(s, f, l + 1);
        } else {
            self.add_trans(s, f, l);
        }
        (s, f)
    }

    /// The conversion triple `(s, e, f)` for a symbol occurrence.
    ///
    /// `e` ends the path where everything so far matched epsilon and
    /// `f` the path through an actual call; a base symbol has no
    /// epsilon-history state of its own, so `e` is absent and edges
    /// from it are simply not drawn.
    fn conv(&mut self, lens: &Rc<Lens>) -> (StateId, Option<StateId>, StateId) {
        let l = self.lens_index(lens).expect("unindexed lens");
        let sa = self.lens_state(l);
        let s = self.make_state();
        let f = self.make_state();
        if lens.recursive {
            self.add_trans(s, f, l);
            self.add_trans(s, sa.expect("recursive lens without state"), EPS);
        } else if let Some(sa) = sa {
            self.add_trans(s, f, l);
            self.add_trans(s, f, l + 1);
            self.add_trans(s, sa, EPS);
        } else {
            self.add_trans(s, f, l);
        }
        (s, None, f)
    }

    fn add_trans_opt(&mut self, from: Option<StateId>, to: StateId) {
        if let Some(from) = from {
            self.add_trans(from, to, EPS);
        }
    }

    /// Concatenate a sequence of children into one `(s, e, f)` triple.
    fn conv_seq(&mut self, children: &[Rc<Lens>]) -> (StateId, Option<StateId>, StateId) {
        let (s2, mut e2, mut f2) = self.conv(&children[0]);
        let s = self.make_state();
        self.add_trans(s, s2, EPS);
        let mut e = e2;
        let mut f = f2;
        for child in &children[1..] {
            let (s3, e3, f3) = self.conv(child);
            let (scall, fcall) = self.thompson(child);
            self.add_trans(f2, scall, EPS);
            self.add_trans_opt(e2, s3);
            f = self.make_state();
            self.add_trans(f3, f, EPS);
            self.add_trans(fcall, f, EPS);
            let enew = self.make_state();
            self.add_trans_opt(e3, enew);
            e = Some(enew);
            f2 = f;
            e2 = e;
        }
        (s, e, f)
    }

    fn conv_union(&mut self, a: &Rc<Lens>, b: &Rc<Lens>) -> (StateId, Option<StateId>, StateId) {
        let s = self.make_state();
        let e = self.make_state();
        let f = self.make_state();
        for child in [a, b] {
            let (s2, e2, f2) = self.conv(child);
            self.add_trans(s, s2, EPS);
            self.add_trans_opt(e2, e);
            self.add_trans(f2, f, EPS);
        }
        (s, Some(e), f)
    }

    fn conv_star(&mut self, child: &Rc<Lens>) -> (StateId, Option<StateId>, StateId) {
        let s = self.make_state();
        let e = self.make_state();
        let f = self.make_state();
        let (si, ei, fi) = self.conv(child);
        let (scall, fcall) = self.thompson(child);
        self.add_trans(s, si, EPS);
        self.add_trans_opt(ei, si);
        self.add_trans(s, e, EPS);
        self.add_trans_opt(ei, e);
        self.add_trans(fi, scall, EPS);
        self.add_trans(fcall, scall, EPS);
        self.add_trans(fi, f, EPS);
        self.add_trans(fcall, f, EPS);
        (s, Some(e), f)
    }

    /// Install the right-hand side of symbol `l`.
    fn conv_rhs(&mut self, l: u32) {
        let lens = self.lens_of(l);
        let sa = self.lens_state(l);
        if !lens.recursive {
            // A nullable terminal returns itself in its nonterminal
            // state; plain terminals need nothing here.
            if let Some(sa) = sa {
                self.state_add_return(sa, l);
            }
            return;
        }
        let sa = sa.expect("recursive lens without state");
        if lens.ctype_nullable() {
            self.state_add_return(sa, l);
        }
        let (s, e, f) = match &lens.body {
            Body::Rec(_) => {
                let body = lens.rec_body();
                self.conv(&body)
            }
            Body::Concat(a, b) => self.conv_seq(&[a.clone(), b.clone()]),
            Body::Union(a, b) => self.conv_union(&a.clone(), &b.clone()),
            Body::Subtree(child) => self.conv(&child.clone()),
            Body::Star(child) => self.conv_star(&child.clone()),
            Body::Maybe(child) => {
                let (s, e, f) = self.conv(&child.clone());
                // The epsilon case is covered by the nullable return
                // on `sa`; only an existing epsilon-history state
                // needs the shortcut edge.
                if let Some(e) = e {
                    self.add_trans(s, e, EPS);
                }
                (s, e, f)
            }
            Body::Square(k, b, ee) => self.conv_seq(&[k.clone(), b.clone(), ee.clone()]),
            _ => unreachable!("a primitive lens cannot be recursive"),
        };
        self.add_trans(sa, s, EPS);
        if let Some(e) = e {
            self.state_add_return(e, l);
        }
        self.state_add_return(f, l);
    }

    fn state_add_return(&mut self, s: StateId, l: u32) {
        let state = &mut self.states[s];
        if !state.returns(l) {
            state.ret.push(l);
        }
    }

    /// Drop states that are unreachable or cannot lead to a return.
    fn collect(&mut self) {
        let ids: Vec<StateId> = self.states.keys().collect();
        for &id in &ids {
            self.states[id].reachable = false;
            self.states[id].live = false;
        }
        let mut work = vec![self.start];
        self.states[self.start].reachable = true;
        while let Some(s) = work.pop() {
            let targets: Vec<StateId> = self.states[s].trans.iter().map(|t| t.to).collect();
            for to in targets {
                if !self.states[to].reachable {
                    self.states[to].reachable = true;
                    work.push(to);
                }
            }
        }
        for &id in &ids {
            if self.states[id].reachable && self.states[id].is_return() {
                self.states[id].live = true;
            }
        }
        let mut changed = true;
        while changed {
            changed = false;
            for &id in &ids {
                if !self.states[id].live && self.states[id].reachable {
                    let becomes_live = self.states[id]
                        .trans
                        .iter()
                        .any(|t| t.lens != CALL && self.states[t.to].live);
                    if becomes_live {
                        self.states[id].live = true;
                        changed = true;
                    }
                }
            }
        }
        for &id in &ids {
            if self.states[id].live && self.states[id].reachable {
                let keep: Vec<Trans> = self.states[id]
                    .trans
                    .iter()
                    .copied()
                    .filter(|t| self.states[t.to].live && self.states[t.to].reachable)
                    .collect();
                self.states[id].trans = keep;
            }
        }
        for id in ids {
            if id != self.start && !(self.states[id].live && self.states[id].reachable) {
                self.states.remove(id);
            }
        }
    }

    fn dedup_trans(&mut self, s: StateId) {
        let trans = &mut self.states[s].trans;
        let mut seen = Vec::with_capacity(trans.len());
        trans.retain(|t| {
            if seen.contains(t) {
                false
            } else {
                seen.push(*t);
                true
            }
        });
    }

    /// Splice out every epsilon transition.
    fn unepsilon(&mut self) {
        self.collect();
        let mut changed = true;
        while changed {
            changed = false;
            let ids: Vec<StateId> = self.states.keys().collect();
            for id in ids {
                loop {
                    let Some(pos) = self.states[id].trans.iter().position(|t| t.lens == EPS)
                    else {
                        break;
                    };
                    let to = self.states[id].trans[pos].to;
                    self.states[id].trans.remove(pos);
                    let extra = self.states[to].trans.clone();
                    let rets = self.states[to].ret.clone();
                    self.states[id].trans.extend(extra);
                    for l in rets {
                        self.state_add_return(id, l);
                    }
                    self.dedup_trans(id);
                    changed = true;
                }
            }
        }
        self.collect();
    }

    fn is_deterministic(&self) -> bool {
        self.states.values().all(|s| {
            s.trans
                .iter()
                .enumerate()
                .all(|(i, t)| s.trans[i + 1..].iter().all(|u| u.lens != t.lens))
        })
    }

    /// Subset construction over the symbol alphabet.
    fn determinize(&mut self) {
        if self.is_deterministic() {
            return;
        }
        let nlenses = self.lenses.len() as u32;
        let old_start = self.start;

        let mut sets: Vec<Vec<StateId>> = Vec::new();
        let mut dfa_states: Vec<StateId> = Vec::new();

        let ini_state = self.make_state();
        self.states[ini_state].num = self.states[old_start].num;
        self.start = ini_state;
        sets.push(vec![old_start]);
        dfa_states.push(ini_state);

        let mut i = 0;
        while i < sets.len() {
            let members = sets[i].clone();
            let from = dfa_states[i];
            for &m in &members {
                let rets = self.states[m].ret.clone();
                for l in rets {
                    self.state_add_return(from, l);
                }
            }
            let mut labels: Vec<u32> = (0..nlenses).collect();
            labels.push(CALL);
            for l in labels {
                let mut target: Vec<StateId> = Vec::new();
                for &m in &members {
                    for t in &self.states[m].trans {
                        if t.lens == l && !target.contains(&t.to) {
                            target.push(t.to);
                        }
                    }
                }
                if target.is_empty() {
                    continue;
                }
                target.sort_unstable();
                let to = match sets.iter().position(|s| *s == target) {
                    Some(j) => dfa_states[j],
                    None => {
                        let id = self.make_state();
                        if target.len() == 1 {
                            self.states[id].num = self.states[target[0]].num;
                        }
                        sets.push(target);
                        dfa_states.push(id);
                        id
                    }
                };
                self.add_trans(from, to, l);
            }
            i += 1;
        }
        self.collect();
    }

    /// Run the Earley loop over `text`, producing the item sets.
    pub fn parse(&self, text: &str) -> Parse {
        let n = text.len();
        let mut parse = Parse {
            sets: (0..=n).map(|_| None).collect(),
        };

        // INIT
        self.parse_add_item(
            &mut parse,
            0,
            self.start,
            0,
            R_ROOT,
            EPS,
            NONE,
            NONE,
            NONE,
            self.lens,
        );
        // NINIT: the whole grammar may match epsilon.
        if self.states[self.start].is_return() {
            for t in self.states[self.start].trans.clone() {
                if self.states[self.start].returns(t.lens) {
                    self.parse_add_item(
                        &mut parse,
                        0,
                        t.to,
                        0,
                        R_COMPLETE | R_PREDICT,
                        t.lens,
                        0,
                        0,
                        0,
                        self.states[self.start].num,
                    );
                }
            }
        }

        for j in 0..=n {
            if parse.sets[j].is_none() {
                continue;
            }
            let mut item = 0;
            while item < parse.sets[j].as_ref().unwrap().items.len() {
                let (t_id, i) = {
                    let it = &parse.sets[j].as_ref().unwrap().items[item];
                    (it.state, it.parent)
                };
                if self.states[t_id].is_return() && i as usize != j {
                    self.nncomplete(&mut parse, j, t_id, i, item as u32);
                }
                let trans = self.states[t_id].trans.clone();
                for x in trans {
                    if x.lens == CALL {
                        // PREDICT
                        let pred = self.parse_add_predict(&mut parse, j, x.to, item as u32);
                        if self.states[x.to].is_return() {
                            self.ncaller(&mut parse, j, item as u32, t_id, i, x.to, pred);
                            self.ncallee(&mut parse, j, item as u32, t_id, x.to, pred);
                        }
                    } else {
                        let lens = self.lens_of(x.lens);
                        let sa = self.lens_state(x.lens);
                        if !lens.recursive && sa.is_none() {
                            // SCAN with the longest terminal match.
                            let ctype = lens.ctype().expect("terminal without ctype");
                            if let Some(count) = ctype.match_at(text, j) {
                                if count > 0 {
                                    self.parse_add_item(
                                        &mut parse,
                                        j + count,
                                        x.to,
                                        i,
                                        R_SCAN,
                                        x.lens,
                                        j as u32,
                                        item as u32,
                                        NONE,
                                        NONE,
                                    );
                                }
                            }
                        }
                    }
                }
                item += 1;
            }
        }
        parse
    }

    /// COMPLETE for a return item `(t, k)` sitting in `E_j`.
    fn nncomplete(&self, parse: &mut Parse, j: usize, t: StateId, k: u32, item: u32) {
        let nitems = match &parse.sets[k as usize] {
            Some(set) => set.items.len(),
            None => return,
        };
        for itemk in 0..nitems {
            let (u_id, parent) = {
                let it = &parse.sets[k as usize].as_ref().unwrap().items[itemk];
                (it.state, it.parent)
            };
            for y in self.states[u_id].trans.clone() {
                if self.states[t].returns(y.lens) {
                    self.parse_add_item(
                        parse,
                        j,
                        y.to,
                        parent,
                        R_COMPLETE,
                        y.lens,
                        k,
                        itemk as u32,
                        item,
                        NONE,
                    );
                }
            }
        }
    }

    /// NCALLER: the caller `t` completes a nullable callee `s` in one
    /// step.
    fn ncaller(
        &self,
        parse: &mut Parse,
        j: usize,
        item: u32,
        t: StateId,
        i: u32,
        s: StateId,
        pred: u32,
    ) {
        for u in self.states[t].trans.clone() {
            if self.states[s].returns(u.lens) {
                self.parse_add_item(
                    parse,
                    j,
                    u.to,
                    i,
                    R_COMPLETE | R_PREDICT,
                    u.lens,
                    j as u32,
                    item,
                    pred,
                    self.states[t].num,
                );
            }
        }
    }

    /// NCALLEE: the nullable callee `s` predicts and completes itself.
    fn ncallee(&self, parse: &mut Parse, j: usize, _item: u32, t: StateId, s: StateId, pred: u32) {
        for u in self.states[s].trans.clone() {
            if self.states[s].returns(u.lens) {
                self.parse_add_item(
                    parse,
                    j,
                    u.to,
                    j as u32,
                    R_COMPLETE | R_PREDICT,
                    u.lens,
                    j as u32,
                    pred,
                    pred,
                    self.states[t].num,
                );
            }
        }
    }

    fn parse_add_predict(&self, parse: &mut Parse, j: usize, s: StateId, from: u32) -> u32 {
        let t = parse.sets[j].as_ref().unwrap().items[from as usize].state;
        let caller = self.states[t].num;
        self.parse_add_item(parse, j, s, j as u32, R_PREDICT, EPS, j as u32, from, NONE, caller)
    }

    /// Add item `(s, k)` to `E_j` with a back-link recording why.
    #[allow(clippy::too_many_arguments)]
    fn parse_add_item(
        &self,
        parse: &mut Parse,
        j: usize,
        s: StateId,
        k: u32,
        reason: u8,
        lens: u32,
        from_set: u32,
        from_item: u32,
        to_item: u32,
        caller: u32,
    ) -> u32 {
        let set = parse.sets[j].get_or_insert_with(ItemSet::default);
        let result = match set
            .items
            .iter()
            .position(|it| it.state == s && it.parent == k)
        {
            Some(i) => i as u32,
            None => {
                set.items.push(Item {
                    state: s,
                    parent: k,
                    links: Vec::new(),
                });
                (set.items.len() - 1) as u32
            }
        };
        let links = &mut set.items[result as usize].links;
        let link = Link {
            reason,
            lens,
            from_set,
            from_item,
            to_item,
            caller,
        };
        if !links.contains(&link) {
            links.push(link);
        }
        result
    }
}

/// Why an item was added; combinations of these bits.
const R_ROOT: u8 = 1;
const R_COMPLETE: u8 = 2;
const R_PREDICT: u8 = 4;
const R_SCAN: u8 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Link {
    reason: u8,
    lens: u32,
    from_set: u32,
    from_item: u32,
    to_item: u32,
    caller: u32,
}

impl Link {
    fn is_complete(&self) -> bool {
        self.reason & R_COMPLETE != 0
    }

    fn is_predict(&self) -> bool {
        self.reason & R_PREDICT != 0
    }

    fn is_scan(&self) -> bool {
        self.reason & R_SCAN != 0
    }

    fn is_last_sibling(&self) -> bool {
        if self.is_complete() {
            return false;
        }
        self.reason & (R_PREDICT | R_ROOT) != 0
    }
}

#[derive(Debug)]
struct Item {
    state: StateId,
    parent: u32,
    links: Vec<Link>,
}

#[derive(Debug, Default)]
struct ItemSet {
    items: Vec<Item>,
}

/// The Earley item sets for one input.
pub struct Parse {
    sets: Vec<Option<ItemSet>>,
}

impl Parse {
    fn item(&self, set: u32, item: u32) -> &Item {
        &self.sets[set as usize]
            .as_ref()
            .expect("empty item set referenced")
            .items[item as usize]
    }

    /// The index of the last nonempty item set, i.e. how far the
    /// parse got before failing.
    fn longest(&self) -> usize {
        (0..self.sets.len())
            .rev()
            .find(|&k| self.sets[k].is_some())
            .unwrap_or(0)
    }
}

/// Callbacks driven by [`visit`] while replaying the parse forest.
pub trait Visitor {
    /// A terminal lens matched `text[start..end]`.
    fn terminal(&mut self, lens: &Rc<Lens>, start: usize, end: usize) -> Result<(), LnsError>;
    /// A nonterminal opens over `text[start..end]`.
    fn enter(&mut self, lens: &Rc<Lens>, start: usize, end: usize) -> Result<(), LnsError>;
    /// A nonterminal closes.
    fn exit(&mut self, lens: &Rc<Lens>, start: usize, end: usize) -> Result<(), LnsError>;
    /// The parse is ambiguous at `pos`.
    fn error(&mut self, lens: &Rc<Lens>, pos: usize, msg: String);
}

/// The outcome of a visit.
pub enum VisitOutcome {
    Parsed,
    /// No complete parse; `longest` is how far the input matched.
    NoParse { longest: usize },
}

/// Replay the parse forest rooted in the final item set.
pub fn visit<V: Visitor>(
    jmt: &Jmt,
    parse: &Parse,
    visitor: &mut V,
) -> Result<VisitOutcome, LnsError> {
    let k = (parse.sets.len() - 1) as u32;
    let Some(set) = &parse.sets[k as usize] else {
        return Ok(VisitOutcome::NoParse {
            longest: parse.longest(),
        });
    };
    let mut found = None;
    for (i, item) in set.items.iter().enumerate() {
        if item.parent == 0 && jmt.states[item.state].returns(jmt.lens) {
            if item.links.iter().any(|l| l.is_complete() || l.is_scan()) {
                found = Some(i as u32);
                break;
            }
        }
    }
    let Some(item) = found else {
        return Ok(VisitOutcome::NoParse {
            longest: parse.longest(),
        });
    };
    let lens = jmt.lens_of(jmt.lens);
    visitor.enter(&lens, 0, k as usize)?;
    build_children(jmt, parse, k, item, visitor, jmt.states[jmt.start].num)?;
    visitor.exit(&lens, 0, k as usize)?;
    Ok(VisitOutcome::Parsed)
}

/// Emit the full parse of a nullable lens matching epsilon at `pos`.
fn build_nullable<V: Visitor>(
    pos: usize,
    visitor: &mut V,
    lens: &Rc<Lens>,
) -> Result<(), LnsError> {
    if !lens.recursive {
        return visitor.terminal(lens, pos, pos);
    }
    visitor.enter(lens, pos, pos)?;
    match &lens.body {
        Body::Rec(_) => build_nullable(pos, visitor, &lens.rec_body())?,
        Body::Concat(a, b) => {
            build_nullable(pos, visitor, a)?;
            build_nullable(pos, visitor, b)?;
        }
        Body::Union(a, b) => {
            if a.ctype_nullable() {
                build_nullable(pos, visitor, a)?;
            } else if b.ctype_nullable() {
                build_nullable(pos, visitor, b)?;
            }
        }
        Body::Subtree(l) => build_nullable(pos, visitor, l)?,
        Body::Square(k, b, e) => {
            build_nullable(pos, visitor, k)?;
            build_nullable(pos, visitor, b)?;
            build_nullable(pos, visitor, e)?;
        }
        Body::Star(_) | Body::Maybe(_) => {}
        _ => {
            return Err(LnsError::at_pos(
                format!("unexpected nullable lens {}", lens),
                pos,
            ));
        }
    }
    visitor.exit(lens, pos, pos)
}

/// Whether `caller` can have produced the link `lnk` on item whose
/// state number is `state_num`.
fn is_caller(state_num: u32, lnk: &Link, caller: u32) -> bool {
    if lnk.reason & R_ROOT != 0 {
        return caller == lnk.caller;
    }
    if !lnk.is_predict() {
        return false;
    }
    if lnk.is_complete() {
        return caller == lnk.caller;
    }
    caller == lnk.caller || caller == state_num
}

enum Siblings {
    Found,
    NotFound,
    Ambiguous,
}

/// Walk the sibling chain of `(k, item)` leftwards, collecting the
/// link to follow at each step (leftmost link last). Two viable paths
/// mean the parse is ambiguous.
fn filter_siblings<V: Visitor>(
    jmt: &Jmt,
    parse: &Parse,
    lens: &Rc<Lens>,
    k: u32,
    item: u32,
    caller: u32,
    siblings: &mut Vec<u32>,
    visitor: &mut V,
) -> Siblings {
    let x = parse.item(k, item);
    let nlast = x.links.iter().filter(|l| l.is_last_sibling()).count();

    if nlast > 0 && nlast < x.links.len() {
        visitor.error(
            lens,
            k as usize,
            format!("{} links in state ({}, {})", x.links.len(), jmt.states[x.state].num, x.parent),
        );
        return Siblings::Ambiguous;
    }

    if nlast == x.links.len() {
        let num = jmt.states[x.state].num;
        for (lnk_ind, lnk) in x.links.iter().enumerate() {
            if is_caller(num, lnk, caller) {
                siblings.clear();
                siblings.push(lnk_ind as u32);
                return Siblings::Found;
            }
        }
        return Siblings::NotFound;
    }

    // nlast == 0: recurse towards the first sibling.
    let mut found = None;
    for (lnk_ind, lnk) in x.links.iter().enumerate() {
        match filter_siblings(
            jmt,
            parse,
            lens,
            lnk.from_set,
            lnk.from_item,
            caller,
            siblings,
            visitor,
        ) {
            Siblings::NotFound => continue,
            Siblings::Ambiguous => return Siblings::Ambiguous,
            Siblings::Found => {
                if found.is_some() {
                    visitor.error(lens, k as usize, "two parse paths".to_string());
                    return Siblings::Ambiguous;
                }
                found = Some(lnk_ind as u32);
            }
        }
    }
    match found {
        Some(lnk) => {
            siblings.push(lnk);
            Siblings::Found
        }
        None => Siblings::NotFound,
    }
}

/// Visit the children of the completion item `(k, item)`.
fn build_children<V: Visitor>(
    jmt: &Jmt,
    parse: &Parse,
    mut k: u32,
    mut item: u32,
    visitor: &mut V,
    caller: u32,
) -> Result<(), LnsError> {
    // Only used for error reporting; predict links carry no lens.
    let l0 = parse.item(k, item).links[0].lens;
    let lens = if (l0 as usize) < jmt.lenses.len() {
        jmt.lens_of(l0)
    } else {
        jmt.lens_of(jmt.lens)
    };
    let mut siblings = Vec::new();
    match filter_siblings(jmt, parse, &lens, k, item, caller, &mut siblings, visitor) {
        Siblings::Found => {}
        Siblings::NotFound => {
            return Err(LnsError::at_pos(
                "no consistent parse path".to_string(),
                k as usize,
            ));
        }
        Siblings::Ambiguous => {
            // Reported through the visitor's error callback.
            return Ok(());
        }
    }

    // The links were recorded right-to-left; the first entry of
    // `siblings` is the leftmost (predict) link, which carries no
    // lens event of its own.
    for i in (1..siblings.len()).rev() {
        let lnk_ind = siblings[i] as usize;
        let lnk = parse.item(k, item).links[lnk_ind];
        let sub = jmt.lens_of(lnk.lens);
        if sub.recursive {
            build_tree(jmt, parse, k, item, lnk_ind, &sub, visitor)?;
        } else {
            visitor.terminal(&sub, lnk.from_set as usize, k as usize)?;
        }
        k = lnk.from_set;
        item = lnk.from_item;
    }
    Ok(())
}

/// Visit the subtree of the nonterminal completed by `(k, item)`
/// through its link `lnk_ind`.
fn build_tree<V: Visitor>(
    jmt: &Jmt,
    parse: &Parse,
    k: u32,
    item: u32,
    lnk_ind: usize,
    lens: &Rc<Lens>,
    visitor: &mut V,
) -> Result<(), LnsError> {
    let x = parse.item(k, item);
    let lnk = x.links[lnk_ind];
    let start = lnk.from_set as usize;
    let end = k as usize;

    if start == end {
        // A nullable nonterminal matched epsilon here; reconstruct
        // its full parse structurally.
        return build_nullable(start, visitor, lens);
    }

    if !lnk.is_complete() {
        return Err(LnsError::at_pos(
            "malformed parse forest: expected a completion".to_string(),
            end,
        ));
    }

    visitor.enter(lens, start, end)?;
    if !lnk.is_predict() {
        let sib = parse.item(lnk.from_set, lnk.from_item);
        let caller = jmt.states[sib.state].num;
        build_children(jmt, parse, k, lnk.to_item, visitor, caller)?;
    }
    visitor.exit(lens, start, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lens;
    use crate::rx::Regex;

    fn re(pat: &str) -> Rc<Regex> {
        Regex::parse(pat).unwrap()
    }

    /// S-expressions: rec x . [ key "(" . (x | atom)* . del ")" ] with
    /// atoms as words.
    fn sexp_lens() -> Rc<Lens> {
        let r = lens::Recursion::new();
        let ws = lens::del(re("[ ]*"), "").unwrap();
        let atom = lens::subtree(lens::concat(lens::key(re("[a-z]+")), ws.clone()));
        let list = lens::subtree(lens::concat(
            lens::key(re("[(]")),
            lens::concat(
                lens::star(lens::union(r.reference(), atom.clone())),
                lens::concat(lens::del(re("[)]"), ")").unwrap(), ws.clone()),
            ),
        ));
        r.bind(list).unwrap()
    }

    struct Events {
        log: Vec<String>,
        errors: Vec<String>,
    }

    impl Visitor for Events {
        fn terminal(&mut self, lens: &Rc<Lens>, start: usize, end: usize) -> Result<(), LnsError> {
            self.log.push(format!("t {} {}..{}", lens, start, end));
            Ok(())
        }
        fn enter(&mut self, _lens: &Rc<Lens>, start: usize, end: usize) -> Result<(), LnsError> {
            self.log.push(format!("{{ {}..{}", start, end));
            Ok(())
        }
        fn exit(&mut self, _lens: &Rc<Lens>, start: usize, end: usize) -> Result<(), LnsError> {
            self.log.push(format!("}} {}..{}", start, end));
            Ok(())
        }
        fn error(&mut self, _lens: &Rc<Lens>, pos: usize, msg: String) {
            self.errors.push(format!("{}: {}", pos, msg));
        }
    }

    #[test]
    fn builds_deterministic_transducer() {
        let jmt = Jmt::build(&sexp_lens()).unwrap();
        assert!(jmt.is_deterministic());
        assert!(!jmt.lenses.is_empty());
    }

    #[test]
    fn parses_nested_input() {
        let lens = sexp_lens();
        let jmt = Jmt::build(&lens).unwrap();
        let text = "(a (b c) d)";
        let parse = jmt.parse(text);
        let mut ev = Events {
            log: Vec::new(),
            errors: Vec::new(),
        };
        match visit(&jmt, &parse, &mut ev).unwrap() {
            VisitOutcome::Parsed => {}
            VisitOutcome::NoParse { longest } => panic!("no parse, got to {}", longest),
        }
        assert!(ev.errors.is_empty(), "ambiguity reported: {:?}", ev.errors);
        assert!(ev.log.iter().any(|l| l.starts_with("t ")));
    }

    #[test]
    fn rejects_unbalanced_input() {
        let lens = sexp_lens();
        let jmt = Jmt::build(&lens).unwrap();
        let parse = jmt.parse("(a (b c d)");
        let mut ev = Events {
            log: Vec::new(),
            errors: Vec::new(),
        };
        match visit(&jmt, &parse, &mut ev).unwrap() {
            VisitOutcome::Parsed => panic!("accepted unbalanced input"),
            VisitOutcome::NoParse { longest } => assert!(longest > 0),
        }
    }
}
