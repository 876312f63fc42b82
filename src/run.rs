// Copyright (c) 2025 ETH Zurich
// Fabian Schuiki <fschuiki@iis.ee.ethz.ch>

//! The `srun` command language.
//!
//! A small line-oriented language dispatching to the public API: one
//! command per line, tokens with single/double quoting, backslash
//! escapes and bracket balancing (so path expressions with embedded
//! blanks survive unquoted). Commands are described by a dispatch
//! table of name, argument specs and handler.

use std::fmt::Write as _;

use crate::augeas::Augeas;
use crate::error::{Error, Result};
use crate::tree::NodeId;

/// What `srun` did with a block of commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrunResult {
    /// Number of commands executed.
    pub executed: usize,
    /// Whether a `quit` stopped processing.
    pub quit: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ArgType {
    Str,
    Path,
}

struct ArgDef {
    name: &'static str,
    typ: ArgType,
    optional: bool,
}

struct CommandDef {
    name: &'static str,
    args: &'static [ArgDef],
    help: &'static str,
    handler: fn(&mut Augeas, &Args, &mut String) -> Result<()>,
}

struct Args {
    values: Vec<Option<String>>,
    defs: &'static [ArgDef],
}

impl Args {
    fn get(&self, name: &str) -> Option<&str> {
        let idx = self.defs.iter().position(|d| d.name == name)?;
        self.values.get(idx)?.as_deref()
    }

    fn required(&self, name: &str) -> Result<&str> {
        self.get(name)
            .ok_or_else(|| Error::CmdRun(format!("missing argument <{}>", name.to_uppercase())))
    }
}

const fn arg(name: &'static str, typ: ArgType, optional: bool) -> ArgDef {
    ArgDef {
        name,
        typ,
        optional,
    }
}

static COMMANDS: &[CommandDef] = &[
    CommandDef {
        name: "help",
        args: &[arg("command", ArgType::Str, true)],
        help: "print help for all commands, or one command",
        handler: cmd_help,
    },
    CommandDef {
        name: "quit",
        args: &[],
        help: "stop processing commands",
        handler: cmd_quit,
    },
    CommandDef {
        name: "ls",
        args: &[arg("path", ArgType::Path, false)],
        help: "list the direct children of PATH",
        handler: cmd_ls,
    },
    CommandDef {
        name: "match",
        args: &[
            arg("path", ArgType::Path, false),
            arg("value", ArgType::Str, true),
        ],
        help: "print the nodes matching PATH, optionally only those with VALUE",
        handler: cmd_match,
    },
    CommandDef {
        name: "get",
        args: &[arg("path", ArgType::Path, false)],
        help: "print the value at PATH",
        handler: cmd_get,
    },
    CommandDef {
        name: "label",
        args: &[arg("path", ArgType::Path, false)],
        help: "print the label at PATH",
        handler: cmd_label,
    },
    CommandDef {
        name: "set",
        args: &[
            arg("path", ArgType::Path, false),
            arg("value", ArgType::Str, true),
        ],
        help: "set the value at PATH, creating the node if needed",
        handler: cmd_set,
    },
    CommandDef {
        name: "setm",
        args: &[
            arg("base", ArgType::Path, false),
            arg("sub", ArgType::Path, false),
            arg("value", ArgType::Str, true),
        ],
        help: "set the value of multiple nodes at once",
        handler: cmd_setm,
    },
    CommandDef {
        name: "clear",
        args: &[arg("path", ArgType::Path, false)],
        help: "clear the value at PATH, creating the node if needed",
        handler: cmd_clear,
    },
    CommandDef {
        name: "clearm",
        args: &[
            arg("base", ArgType::Path, false),
            arg("sub", ArgType::Path, false),
        ],
        help: "clear the value of multiple nodes at once",
        handler: cmd_clearm,
    },
    CommandDef {
        name: "touch",
        args: &[arg("path", ArgType::Path, false)],
        help: "create PATH if it does not exist yet",
        handler: cmd_touch,
    },
    CommandDef {
        name: "rm",
        args: &[arg("path", ArgType::Path, false)],
        help: "remove all nodes matching PATH",
        handler: cmd_rm,
    },
    CommandDef {
        name: "mv",
        args: &[
            arg("src", ArgType::Path, false),
            arg("dst", ArgType::Path, false),
        ],
        help: "move the node SRC to DST",
        handler: cmd_mv,
    },
    CommandDef {
        name: "move",
        args: &[
            arg("src", ArgType::Path, false),
            arg("dst", ArgType::Path, false),
        ],
        help: "alias for mv",
        handler: cmd_mv,
    },
    CommandDef {
        name: "rename",
        args: &[
            arg("src", ArgType::Path, false),
            arg("label", ArgType::Str, false),
        ],
        help: "rename the nodes matching SRC to LABEL",
        handler: cmd_rename,
    },
    CommandDef {
        name: "ins",
        args: &[
            arg("label", ArgType::Str, false),
            arg("where", ArgType::Str, false),
            arg("path", ArgType::Path, false),
        ],
        help: "insert a node with LABEL before or after PATH",
        handler: cmd_ins,
    },
    CommandDef {
        name: "insert",
        args: &[
            arg("label", ArgType::Str, false),
            arg("where", ArgType::Str, false),
            arg("path", ArgType::Path, false),
        ],
        help: "alias for ins",
        handler: cmd_ins,
    },
    CommandDef {
        name: "defvar",
        args: &[
            arg("name", ArgType::Str, false),
            arg("expr", ArgType::Path, true),
        ],
        help: "define the variable NAME from EXPR; undefine without EXPR",
        handler: cmd_defvar,
    },
    CommandDef {
        name: "defnode",
        args: &[
            arg("name", ArgType::Str, false),
            arg("expr", ArgType::Path, false),
            arg("value", ArgType::Str, true),
        ],
        help: "define NAME as EXPR, creating one node if there is no match",
        handler: cmd_defnode,
    },
    CommandDef {
        name: "print",
        args: &[arg("path", ArgType::Path, true)],
        help: "print the subtree at PATH (default: everything)",
        handler: cmd_print,
    },
    CommandDef {
        name: "span",
        args: &[arg("path", ArgType::Path, false)],
        help: "print the file span of the node at PATH",
        handler: cmd_span,
    },
    CommandDef {
        name: "transform",
        args: &[
            arg("lens", ArgType::Str, false),
            arg("filter", ArgType::Str, false),
            arg("excl", ArgType::Str, true),
        ],
        help: "register a transform of LENS over the files matching FILTER",
        handler: cmd_transform,
    },
    CommandDef {
        name: "store",
        args: &[
            arg("lens", ArgType::Str, false),
            arg("node", ArgType::Path, false),
            arg("path", ArgType::Path, false),
        ],
        help: "parse the value of NODE with LENS into a tree at PATH",
        handler: cmd_store,
    },
    CommandDef {
        name: "retrieve",
        args: &[
            arg("lens", ArgType::Str, false),
            arg("node_in", ArgType::Path, false),
            arg("path", ArgType::Path, false),
            arg("node_out", ArgType::Path, false),
        ],
        help: "render the tree at PATH with LENS into the value of NODE_OUT",
        handler: cmd_retrieve,
    },
    CommandDef {
        name: "load",
        args: &[],
        help: "load files according to the registered transforms",
        handler: cmd_load,
    },
    CommandDef {
        name: "save",
        args: &[],
        help: "save all pending changes to disk",
        handler: cmd_save,
    },
];

fn lookup(name: &str) -> Option<&'static CommandDef> {
    COMMANDS.iter().find(|c| c.name == name)
}

impl Augeas {
    /// Run a block of commands; one command per line, `#` comments
    /// and blank lines ignored.
    pub fn srun(&mut self, out: &mut String, text: &str) -> Result<SrunResult> {
        self.api(|aug| {
            let mut executed = 0;
            for line in text.lines() {
                let trimmed = line.trim_start();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    continue;
                }
                match aug.run_command(out, trimmed)? {
                    true => {
                        return Ok(SrunResult {
                            executed,
                            quit: true,
                        });
                    }
                    false => executed += 1,
                }
            }
            Ok(SrunResult {
                executed,
                quit: false,
            })
        })
    }

    /// Run one command line; returns whether it was `quit`.
    fn run_command(&mut self, out: &mut String, line: &str) -> Result<bool> {
        let mut rest = line;
        let name = next_token(&mut rest, false)?
            .ok_or_else(|| Error::CmdRun("empty command".to_string()))?;
        let def = lookup(&name)
            .ok_or_else(|| Error::CmdRun(format!("Unknown command '{}'", name)))?;
        if def.name == "quit" {
            return Ok(true);
        }

        let mut values: Vec<Option<String>> = Vec::new();
        for argdef in def.args {
            let tok = next_token(&mut rest, argdef.typ == ArgType::Path)?;
            match tok {
                Some(tok) => values.push(Some(tok)),
                None if argdef.optional => values.push(None),
                None => {
                    return Err(Error::CmdRun(format!(
                        "Not enough arguments for {}",
                        def.name
                    )));
                }
            }
        }
        if next_token(&mut rest, false)?.is_some() {
            return Err(Error::CmdRun(format!(
                "Too many arguments. Command {} takes only {} arguments",
                def.name,
                def.args.len()
            )));
        }

        let args = Args {
            values,
            defs: def.args,
        };
        (def.handler)(self, &args, out).map(|_| false)
    }

    /// Render a subtree in the `print` format.
    fn print_subtree(&self, node: NodeId, out: &mut String) {
        let path = self.tree.path_of(node);
        match self.tree.value(node) {
            Some(v) => {
                let _ = writeln!(out, "{} = {:?}", path, v);
            }
            None => {
                let _ = writeln!(out, "{}", path);
            }
        }
        for &child in self.tree.children(node) {
            if !self.tree.hidden(child) {
                self.print_subtree(child, out);
            }
        }
    }
}

/// Read the next token off `line`, honoring quotes, escapes and,
/// in path mode, bracket balancing.
fn next_token(line: &mut &str, path: bool) -> Result<Option<String>> {
    let mut chars = line.char_indices().peekable();
    while matches!(chars.peek(), Some((_, ' ' | '\t'))) {
        chars.next();
    }
    if chars.peek().is_none() {
        *line = "";
        return Ok(None);
    }
    let mut tok = String::new();
    let mut quote: Option<char> = None;
    let mut brackets = 0i32;
    let mut end = line.len();
    while let Some((i, c)) = chars.next() {
        end = i + c.len_utf8();
        if c == '\\' {
            match chars.next() {
                // Brackets pass through escaped, so pathx still sees
                // the escape.
                Some((j, e @ ('[' | ']'))) => {
                    tok.push('\\');
                    tok.push(e);
                    end = j + 1;
                    continue;
                }
                Some((j, 't')) => {
                    tok.push('\t');
                    end = j + 1;
                    continue;
                }
                Some((j, 'n')) => {
                    tok.push('\n');
                    end = j + 1;
                    continue;
                }
                Some((j, e @ (' ' | '\t' | '\'' | '"' | '\\'))) => {
                    tok.push(e);
                    end = j + 1;
                    continue;
                }
                _ => {
                    return Err(Error::CmdRun("unknown escape sequence".to_string()));
                }
            }
        }
        if quote.is_none() {
            if c == '[' {
                brackets += 1;
            }
            if c == ']' {
                brackets -= 1;
                if brackets < 0 {
                    return Err(Error::CmdRun("unmatched ]".to_string()));
                }
            }
        }
        if !path || brackets == 0 {
            match quote {
                None if c == '\'' || c == '"' => {
                    quote = Some(c);
                    continue;
                }
                Some(q) if c == q => {
                    quote = None;
                    continue;
                }
                None if c == ' ' || c == '\t' => {
                    end = i;
                    break;
                }
                _ => {}
            }
        }
        tok.push(c);
    }
    if let Some(q) = quote {
        return Err(Error::CmdRun(format!("unmatched {}", q)));
    }
    if path && brackets > 0 {
        return Err(Error::CmdRun("unmatched [".to_string()));
    }
    *line = &line[end..];
    Ok(Some(tok))
}

fn cmd_help(_aug: &mut Augeas, args: &Args, out: &mut String) -> Result<()> {
    match args.get("command") {
        Some(name) => {
            let def = lookup(name)
                .ok_or_else(|| Error::CmdRun(format!("Unknown command '{}'", name)))?;
            let _ = write!(out, "  {}", def.name);
            for a in def.args {
                if a.optional {
                    let _ = write!(out, " [<{}>]", a.name.to_uppercase());
                } else {
                    let _ = write!(out, " <{}>", a.name.to_uppercase());
                }
            }
            let _ = writeln!(out, "\n    {}", def.help);
        }
        None => {
            for def in COMMANDS {
                let _ = writeln!(out, "  {:10} {}", def.name, def.help);
            }
        }
    }
    Ok(())
}

fn cmd_quit(_aug: &mut Augeas, _args: &Args, _out: &mut String) -> Result<()> {
    Ok(())
}

fn cmd_ls(aug: &mut Augeas, args: &Args, out: &mut String) -> Result<()> {
    let path = args.required("path")?;
    let pattern = format!("{}/*", path.trim_end_matches('/'));
    for p in aug.matches(&pattern)? {
        let base = p.rsplit('/').next().unwrap_or(&p);
        let has_children = !aug.matches(&format!("{}/*", p))?.is_empty();
        let value = aug.get(&p)?;
        let _ = writeln!(
            out,
            "{}{} = {}",
            base,
            if has_children { "/" } else { "" },
            value.as_deref().unwrap_or("(none)")
        );
    }
    Ok(())
}

fn cmd_match(aug: &mut Augeas, args: &Args, out: &mut String) -> Result<()> {
    let path = args.required("path")?;
    let filter = args.get("value");
    for p in aug.matches(path)? {
        let value = aug.get(&p)?;
        if let Some(f) = filter {
            if value.as_deref() != Some(f) {
                continue;
            }
        }
        let _ = writeln!(out, "{} = {}", p, value.as_deref().unwrap_or("(none)"));
    }
    Ok(())
}

fn cmd_get(aug: &mut Augeas, args: &Args, out: &mut String) -> Result<()> {
    let path = args.required("path")?;
    match aug.get(path)? {
        Some(v) => {
            let _ = writeln!(out, "{} = {}", path, v);
        }
        None => {
            let _ = writeln!(out, "{} (none)", path);
        }
    }
    Ok(())
}

fn cmd_label(aug: &mut Augeas, args: &Args, out: &mut String) -> Result<()> {
    let path = args.required("path")?;
    match aug.label(path)? {
        Some(l) => {
            let _ = writeln!(out, "{} = {}", path, l);
        }
        None => {
            let _ = writeln!(out, "{} (none)", path);
        }
    }
    Ok(())
}

fn cmd_set(aug: &mut Augeas, args: &Args, _out: &mut String) -> Result<()> {
    let path = args.required("path")?;
    aug.set(path, args.get("value"))
}

fn cmd_setm(aug: &mut Augeas, args: &Args, _out: &mut String) -> Result<()> {
    let base = args.required("base")?;
    let sub = args.required("sub")?;
    aug.setm(base, Some(sub), args.get("value")).map(|_| ())
}

fn cmd_clear(aug: &mut Augeas, args: &Args, _out: &mut String) -> Result<()> {
    aug.clear(args.required("path")?)
}

fn cmd_clearm(aug: &mut Augeas, args: &Args, _out: &mut String) -> Result<()> {
    let base = args.required("base")?;
    let sub = args.required("sub")?;
    aug.clearm(base, Some(sub)).map(|_| ())
}

fn cmd_touch(aug: &mut Augeas, args: &Args, _out: &mut String) -> Result<()> {
    aug.touch(args.required("path")?)
}

fn cmd_rm(aug: &mut Augeas, args: &Args, out: &mut String) -> Result<()> {
    let path = args.required("path")?;
    let count = aug.rm(path)?;
    let _ = writeln!(out, "rm : {} {}", path, count);
    Ok(())
}

fn cmd_mv(aug: &mut Augeas, args: &Args, _out: &mut String) -> Result<()> {
    aug.mv(args.required("src")?, args.required("dst")?)
}

fn cmd_rename(aug: &mut Augeas, args: &Args, out: &mut String) -> Result<()> {
    let src = args.required("src")?;
    let label = args.required("label")?;
    let count = aug.rename(src, label)?;
    let _ = writeln!(out, "rename : {} to {} {}", src, label, count);
    Ok(())
}

fn cmd_ins(aug: &mut Augeas, args: &Args, _out: &mut String) -> Result<()> {
    let label = args.required("label")?;
    let where_ = args.required("where")?;
    let path = args.required("path")?;
    let before = match where_ {
        "before" => true,
        "after" => false,
        _ => {
            return Err(Error::CmdRun(format!(
                "the <WHERE> argument must be either 'before' or 'after', was '{}'",
                where_
            )));
        }
    };
    aug.insert(path, label, before)
}

fn cmd_defvar(aug: &mut Augeas, args: &Args, _out: &mut String) -> Result<()> {
    let name = args.required("name")?;
    aug.defvar(name, args.get("expr")).map(|_| ())
}

fn cmd_defnode(aug: &mut Augeas, args: &Args, _out: &mut String) -> Result<()> {
    let name = args.required("name")?;
    let expr = args.required("expr")?;
    aug.defnode(name, expr, args.get("value")).map(|_| ())
}

fn cmd_print(aug: &mut Augeas, args: &Args, out: &mut String) -> Result<()> {
    let path = args.get("path").unwrap_or("/*");
    let nodes = aug.eval_nodes(path)?;
    for node in nodes {
        if !aug.tree.hidden(node) {
            aug.print_subtree(node, out);
        }
    }
    Ok(())
}

fn cmd_span(aug: &mut Augeas, args: &Args, out: &mut String) -> Result<()> {
    let path = args.required("path")?;
    let span = aug.span(path)?;
    let _ = writeln!(
        out,
        "{} label=({},{}) value=({},{}) span=({},{}) file={}",
        path,
        span.label.0,
        span.label.1,
        span.value.0,
        span.value.1,
        span.span.0,
        span.span.1,
        span.filename
    );
    Ok(())
}

fn cmd_transform(aug: &mut Augeas, args: &Args, _out: &mut String) -> Result<()> {
    let lens = args.required("lens")?;
    let filter = args.required("filter")?;
    match args.get("excl") {
        Some(excl) => aug.transform(lens, &[filter], &[excl]),
        None => aug.transform(lens, &[filter], &[]),
    }
}

fn cmd_store(aug: &mut Augeas, args: &Args, _out: &mut String) -> Result<()> {
    aug.text_store(
        args.required("lens")?,
        args.required("node")?,
        args.required("path")?,
    )
}

fn cmd_retrieve(aug: &mut Augeas, args: &Args, _out: &mut String) -> Result<()> {
    aug.text_retrieve(
        args.required("lens")?,
        args.required("node_in")?,
        args.required("path")?,
        args.required("node_out")?,
    )
}

fn cmd_load(aug: &mut Augeas, _args: &Args, _out: &mut String) -> Result<()> {
    aug.load()
}

fn cmd_save(aug: &mut Augeas, _args: &Args, _out: &mut String) -> Result<()> {
    aug.save()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::augeas::Flags;
    use pretty_assertions::assert_eq;

    fn aug() -> Augeas {
        Augeas::init(Some("/dev/null"), None, Flags::NO_LOAD).unwrap()
    }

    #[test]
    fn tokens_with_quotes_and_brackets() {
        let mut line = "set /files/etc/hosts[ipaddr = '127.0.0.1']/canonical localhost";
        assert_eq!(
            next_token(&mut line, false).unwrap().as_deref(),
            Some("set")
        );
        // Inside brackets, quotes pass through for pathx to handle.
        assert_eq!(
            next_token(&mut line, true).unwrap().as_deref(),
            Some("/files/etc/hosts[ipaddr = '127.0.0.1']/canonical")
        );
        assert_eq!(
            next_token(&mut line, false).unwrap().as_deref(),
            Some("localhost")
        );
        assert_eq!(next_token(&mut line, false).unwrap(), None);
    }

    #[test]
    fn tokens_report_unmatched_brackets() {
        let mut line = "/files/hosts[";
        assert!(matches!(
            next_token(&mut line, true),
            Err(Error::CmdRun(_))
        ));
    }

    #[test]
    fn escapes() {
        let mut line = r"a\ b c\td";
        assert_eq!(next_token(&mut line, false).unwrap().as_deref(), Some("a b"));
        assert_eq!(
            next_token(&mut line, false).unwrap().as_deref(),
            Some("c\td")
        );
    }

    #[test]
    fn set_get_through_srun() {
        let mut aug = aug();
        let mut out = String::new();
        let r = aug
            .srun(
                &mut out,
                "set /files/f/a hello\nget /files/f/a\n",
            )
            .unwrap();
        assert_eq!(r.executed, 2);
        assert!(!r.quit);
        assert_eq!(out, "/files/f/a = hello\n");
    }

    #[test]
    fn quit_stops_processing() {
        let mut aug = aug();
        let mut out = String::new();
        let r = aug
            .srun(&mut out, "set /files/f/a 1\nquit\nset /files/f/b 2\n")
            .unwrap();
        assert_eq!(r.executed, 1);
        assert!(r.quit);
        assert_eq!(aug.get("/files/f/b").unwrap(), None);
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        let mut aug = aug();
        let mut out = String::new();
        let r = aug
            .srun(&mut out, "# a comment\n\nset /files/f/a 1\n")
            .unwrap();
        assert_eq!(r.executed, 1);
    }

    #[test]
    fn unknown_command_is_an_error() {
        let mut aug = aug();
        let mut out = String::new();
        let err = aug.srun(&mut out, "frobnicate /files\n").unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::CmdRun);
    }

    #[test]
    fn ins_and_match() {
        let mut aug = aug();
        let mut out = String::new();
        aug.srun(
            &mut out,
            "set /files/f/b 2\nins a before /files/f/b\nset /files/f/a 1\n",
        )
        .unwrap();
        out.clear();
        aug.srun(&mut out, "match /files/f/*\n").unwrap();
        assert_eq!(out, "/files/f/a = 1\n/files/f/b = 2\n");
    }

    #[test]
    fn print_quotes_values() {
        let mut aug = aug();
        let mut out = String::new();
        aug.srun(&mut out, "set /files/f/a hello\nprint /files\n")
            .unwrap();
        assert_eq!(out, "/files\n/files/f\n/files/f/a = \"hello\"\n");
    }

    #[test]
    fn rm_reports_count() {
        let mut aug = aug();
        let mut out = String::new();
        aug.srun(&mut out, "set /files/f/a/b 1\nrm /files/f\n")
            .unwrap();
        assert!(out.contains("rm : /files/f 3"));
    }

    #[test]
    fn defvar_and_defnode_commands() {
        let mut aug = aug();
        let mut out = String::new();
        aug.srun(
            &mut out,
            "set /files/f/a 1\ndefvar v /files/f\ndefnode n $v/b 2\nget $n\n",
        )
        .unwrap();
        assert!(out.contains("$n = 2"));
    }

    #[test]
    fn help_lists_commands() {
        let mut aug = aug();
        let mut out = String::new();
        aug.srun(&mut out, "help\n").unwrap();
        assert!(out.contains("set"));
        assert!(out.contains("save"));
        out.clear();
        aug.srun(&mut out, "help ins\n").unwrap();
        assert!(out.contains("<LABEL>"));
    }
}
