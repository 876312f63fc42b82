// Copyright (c) 2025 ETH Zurich
// Fabian Schuiki <fschuiki@iis.ee.ethz.ch>

//! End-to-end scenarios: lens round trips through the full engine,
//! file loading and saving, and the error surface.

use std::fs;
use std::rc::Rc;

use pretty_assertions::assert_eq;

use augeas::error::ErrorCode;
use augeas::lens::{self, Lens};
use augeas::rx::Regex;
use augeas::{Augeas, Flags, Recursion};

fn re(pat: &str) -> Rc<Regex> {
    Regex::parse(pat).unwrap()
}

/// `[ key /[a-z]+/ . del /=/ "=" . store /[0-9]+/ . del /\n/ "\n" ]*`
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

/// An S-expression lens built on recursion: lists hold atoms or
/// nested lists, whitespace after each element is preserved.
fn sexp_lens() -> Rc<Lens> {
    let r = Recursion::new();
    let ws = || lens::del(re("[ ]*"), "").unwrap();
    let atom = lens::subtree(lens::concat(lens::key(re("[a-z]+")), ws()));
    let list = lens::subtree(lens::concat(
        lens::del(re("[(]"), "(").unwrap(),
        lens::concat(
            lens::label("list"),
            lens::concat(
                lens::star(lens::union(r.reference(), atom)),
                lens::concat(lens::del(re("[)]"), ")").unwrap(), ws()),
            ),
        ),
    ));
    r.bind(list).unwrap()
}

fn sandbox(content: &str) -> (tempfile::TempDir, Augeas) {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("etc")).unwrap();
    fs::write(dir.path().join("etc/app.conf"), content).unwrap();
    let mut aug = Augeas::init(Some(dir.path().to_str().unwrap()), None, Flags::NO_LOAD).unwrap();
    aug.register_lens("Kv.lns", kv_lens()).unwrap();
    aug.transform("Kv.lns", &["/etc/app.conf"], &[]).unwrap();
    (dir, aug)
}

#[test]
fn scenario_key_value_edits() {
    let (dir, mut aug) = sandbox("a=1\nb=2\n");
    let file = dir.path().join("etc/app.conf");
    aug.load().unwrap();
    assert_eq!(aug.get("/files/etc/app.conf/a").unwrap(), Some("1".into()));
    assert_eq!(aug.get("/files/etc/app.conf/b").unwrap(), Some("2".into()));

    aug.set("/files/etc/app.conf/b", Some("20")).unwrap();
    aug.save().unwrap();
    assert_eq!(fs::read_to_string(&file).unwrap(), "a=1\nb=20\n");

    aug.rm("/files/etc/app.conf/a").unwrap();
    aug.save().unwrap();
    assert_eq!(fs::read_to_string(&file).unwrap(), "b=20\n");

    aug.insert("/files/etc/app.conf/b", "c", false).unwrap();
    aug.set("/files/etc/app.conf/c", Some("3")).unwrap();
    aug.save().unwrap();
    assert_eq!(fs::read_to_string(&file).unwrap(), "b=20\nc=3\n");
}

#[test]
fn scenario_subtree_reordering() {
    let (dir, mut aug) = sandbox("x=1\ny=2\n");
    let file = dir.path().join("etc/app.conf");
    aug.load().unwrap();
    aug.mv("/files/etc/app.conf/x", "/files/etc/app.conf/z")
        .unwrap();
    aug.rename("/files/etc/app.conf/z", "w").unwrap();
    aug.save().unwrap();
    assert_eq!(fs::read_to_string(&file).unwrap(), "w=1\ny=2\n");
}

#[test]
fn scenario_recursive_sexp_roundtrip() {
    use augeas::get;
    use augeas::put;
    use augeas::tree::Tree;

    let l = sexp_lens();
    let text = "(a (b c) d)";
    let parsed = get::get(&l, text, None, false).unwrap();
    assert_eq!(parsed.trees.len(), 1);
    let top = &parsed.trees[0];
    assert_eq!(top.label.as_deref(), Some("list"));
    let labels: Vec<_> = top
        .children
        .iter()
        .map(|c| c.label.clone().unwrap())
        .collect();
    assert_eq!(labels, ["a", "list", "d"]);
    let inner: Vec<_> = top.children[1]
        .children
        .iter()
        .map(|c| c.label.clone().unwrap())
        .collect();
    assert_eq!(inner, ["b", "c"]);

    // Unmodified put is the identity.
    let mut tree = Tree::new();
    let root = tree.append(tree.origin(), Some("file"), None);
    for frag in parsed.trees {
        tree.graft(root, frag);
    }
    let out = put::put(&l, &tree, tree.children(root), text).unwrap();
    assert_eq!(out, text);

    // Renaming one leaf keeps the surrounding whitespace.
    let top_id = tree.children(root)[0];
    let d = tree
        .children(top_id)
        .iter()
        .copied()
        .find(|&c| tree.label(c) == Some("d"))
        .unwrap();
    tree.rename(d, "dd").unwrap();
    let out = put::put(&l, &tree, tree.children(root), text).unwrap();
    assert_eq!(out, "(a (b c) dd)");
}

#[test]
fn scenario_ambiguous_concat_is_reported() {
    let ambiguous = lens::concat(
        lens::del(re("a*"), "").unwrap(),
        lens::del(re("a*"), "").unwrap(),
    );
    let err = lens::typecheck(&ambiguous).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Syntax);
    let msg = err.to_string();
    assert!(msg.contains("ambiguous"), "message was {:?}", msg);

    // Without the type check, the ambiguity surfaces at parse time,
    // at position 0.
    let err = augeas::get::get(&ambiguous, "aa", None, false).unwrap_err();
    assert_eq!(err.pos, Some(0));

    // With type checking enabled, registration rejects the lens.
    let mut aug = Augeas::init(
        Some("/dev/null"),
        None,
        Flags::NO_LOAD | Flags::TYPE_CHECK,
    )
    .unwrap();
    assert!(
        aug.register_lens("Amb.lns", lens::star(lens::subtree(ambiguous)))
            .is_err()
    );
}

#[test]
fn scenario_pathx_error_details() {
    let mut aug = Augeas::init(Some("/dev/null"), None, Flags::NO_LOAD).unwrap();
    let err = aug.get("/files/hosts[").unwrap_err();
    assert_eq!(err.code(), ErrorCode::Pathx);
    match err {
        augeas::Error::Pathx { details, .. } => {
            assert_eq!(details, "/files/hosts[|=|");
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn scenario_transform_conflict() {
    let (_dir, mut aug) = sandbox("a=1\n");
    aug.register_lens("Kv2.lns", kv_lens()).unwrap();
    aug.transform("Kv2.lns", &["/etc/app.conf"], &[]).unwrap();
    aug.load().unwrap();
    assert_eq!(
        aug.get("/augeas/files/etc/app.conf/error").unwrap(),
        Some("mxfm_load".into())
    );
    let msg = aug
        .get("/augeas/files/etc/app.conf/error/message")
        .unwrap()
        .unwrap();
    assert!(msg.contains("Kv.lns"), "message was {:?}", msg);
    assert!(msg.contains("Kv2.lns"), "message was {:?}", msg);
    assert!(aug.matches("/files/etc/app.conf").unwrap().is_empty());
}

#[test]
fn get_put_law_on_unmodified_tree() {
    let (dir, mut aug) = sandbox("a=1\nb=2\nc=3\n");
    let file = dir.path().join("etc/app.conf");
    let before = fs::read_to_string(&file).unwrap();
    let mtime = fs::metadata(&file).unwrap().modified().unwrap();
    aug.load().unwrap();
    // Dirty the tree without changing anything observable: a node
    // that is added and removed again still marks its ancestors.
    aug.set("/files/etc/app.conf/tmp", Some("9")).unwrap();
    aug.rm("/files/etc/app.conf/tmp").unwrap();
    aug.save().unwrap();
    assert_eq!(fs::read_to_string(&file).unwrap(), before);
    // Byte-identical output skips the rename entirely.
    assert_eq!(fs::metadata(&file).unwrap().modified().unwrap(), mtime);
    assert!(aug.matches("/augeas/events/saved").unwrap().is_empty());
}

#[test]
fn put_get_law_roundtrip() {
    use augeas::get;
    use augeas::put;
    use augeas::tree::Tree;

    let l = kv_lens();
    let text = "a=1\nb=2\n";
    let parsed = get::get(&l, text, None, false).unwrap();
    let mut tree = Tree::new();
    let root = tree.append(tree.origin(), Some("file"), None);
    for frag in parsed.trees {
        tree.graft(root, frag);
    }
    let b = tree.child(root, "b").unwrap();
    tree.set_value(b, Some("99"));

    let out = put::put(&l, &tree, tree.children(root), text).unwrap();
    let reparsed = get::get(&l, &out, None, false).unwrap();
    let mut tree2 = Tree::new();
    let root2 = tree2.append(tree2.origin(), Some("file"), None);
    for frag in reparsed.trees {
        tree2.graft(root2, frag);
    }
    // Everything the tree said must be back after get(put(...)).
    assert_eq!(
        tree2.value(tree2.child(root2, "b").unwrap()),
        Some("99")
    );
    assert_eq!(
        tree2.value(tree2.child(root2, "a").unwrap()),
        Some("1")
    );
}

#[test]
fn consumed_equals_input_length() {
    use augeas::get;
    let l = kv_lens();
    // A failing match reports the position where matching stopped.
    let err = get::get(&l, "a=1\nb=!\n", None, false).unwrap_err();
    assert_eq!(err.pos, Some(6));
}

#[test]
fn spans_are_tracked_when_enabled() {
    let (_dir, mut aug) = sandbox("alpha=1\nbeta=22\n");
    aug.set("/augeas/span", Some("enable")).unwrap();
    aug.load().unwrap();
    let span = aug.span("/files/etc/app.conf/beta").unwrap();
    assert_eq!(span.label, (8, 12));
    assert_eq!(span.value, (13, 15));
    assert_eq!(span.span, (8, 16));
    assert!(span.filename.ends_with("etc/app.conf"));

    // Without span tracking the call reports ENOSPAN.
    let (_dir2, mut aug2) = sandbox("a=1\n");
    aug2.load().unwrap();
    let err = aug2.span("/files/etc/app.conf/a").unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoSpan);
}

#[test]
fn srun_drives_the_whole_engine() {
    let (dir, mut aug) = sandbox("a=1\n");
    let file = dir.path().join("etc/app.conf");
    let mut out = String::new();
    let result = aug
        .srun(
            &mut out,
            "load\n\
             set /files/etc/app.conf/b 2\n\
             match /files/etc/app.conf/*\n\
             save\n",
        )
        .unwrap();
    assert_eq!(result.executed, 4);
    assert!(out.contains("/files/etc/app.conf/a = 1"));
    assert!(out.contains("/files/etc/app.conf/b = 2"));
    assert_eq!(fs::read_to_string(&file).unwrap(), "a=1\nb=2\n");
}

#[test]
fn srun_store_and_retrieve() {
    let mut aug = Augeas::init(Some("/dev/null"), None, Flags::NO_LOAD).unwrap();
    aug.register_lens("Kv.lns", kv_lens()).unwrap();
    let mut out = String::new();
    aug.srun(
        &mut out,
        "set /in x=1\\ny=2\\n\n\
         store Kv.lns /in /parsed\n\
         set /parsed/y 20\n\
         retrieve Kv.lns /in /parsed /out\n\
         get /out\n",
    )
    .unwrap();
    assert_eq!(aug.get("/parsed/x").unwrap(), Some("1".into()));
    assert!(out.contains("x=1"));
    assert!(out.contains("y=20"));
}

#[test]
fn seq_and_counter_through_files() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("etc")).unwrap();
    fs::write(dir.path().join("etc/list.conf"), "alpha\nbeta\n").unwrap();
    // counter "line" . [ seq "line" . store /[a-z]+/ . del /\n/ ]*
    let entry = lens::subtree(lens::concat(
        lens::seq("line"),
        lens::concat(
            lens::store(re("[a-z]+")),
            lens::del(re("\n"), "\n").unwrap(),
        ),
    ));
    let l = lens::concat(lens::counter("line"), lens::star(entry));
    let mut aug = Augeas::init(Some(dir.path().to_str().unwrap()), None, Flags::NO_LOAD).unwrap();
    aug.register_lens("Lines.lns", l).unwrap();
    aug.transform("Lines.lns", &["/etc/list.conf"], &[]).unwrap();
    aug.load().unwrap();
    assert_eq!(
        aug.get("/files/etc/list.conf/1").unwrap(),
        Some("alpha".into())
    );
    assert_eq!(
        aug.get("/files/etc/list.conf/2").unwrap(),
        Some("beta".into())
    );

    aug.set("/files/etc/list.conf/2", Some("gamma")).unwrap();
    aug.save().unwrap();
    assert_eq!(
        fs::read_to_string(dir.path().join("etc/list.conf")).unwrap(),
        "alpha\ngamma\n"
    );
}

#[test]
fn defvar_survives_reload() {
    let (_dir, mut aug) = sandbox("a=1\nb=2\n");
    aug.load().unwrap();
    aug.defvar("conf", Some("/files/etc/app.conf")).unwrap();
    assert_eq!(
        aug.get("/augeas/variables/conf").unwrap(),
        Some("/files/etc/app.conf".into())
    );
    aug.load().unwrap();
    assert_eq!(aug.matches("$conf/a").unwrap().len(), 1);
}

#[test]
fn missing_lens_is_enolens() {
    let mut aug = Augeas::init(Some("/dev/null"), None, Flags::NO_LOAD).unwrap();
    let err = aug.transform("Nope.lns", &["/etc/x"], &[]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoLens);
}
