//! Per-file source scan: markers, references, search directories.

use serde::{Deserialize, Serialize};

/// What a reference points at, which decides its candidate extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    /// `\input`, `\include`, `\subfile`, `\import` and friends
    Tex,
    Class,
    Package,
    Bibliography,
    Graphic,
    /// Data files loaded by macros (`\DTLloaddb`, `\loadglsentries`)
    Data,
}

/// Graphics usable with pdfTeX only.
pub const PDF_ONLY_IMAGES: &[&str] = &["pdf", "png", "jpg", "jpeg", "jbig2", "jb2"];
/// Graphics usable with dvips only.
pub const DVI_ONLY_IMAGES: &[&str] = &["eps", "ps", "eps.gz", "ps.gz", "eps.z"];

impl RefKind {
    /// Candidate extensions, in lookup order, for a DVI or PDF engine.
    pub fn extensions(&self, dvi: bool) -> Vec<String> {
        let list: &[&str] = match self {
            RefKind::Tex => &["tex"],
            RefKind::Class => &["cls"],
            RefKind::Package => &["sty"],
            RefKind::Bibliography => &["bib"],
            RefKind::Graphic if dvi => &["eps", "ps", "eps.gz", "ps.gz", "eps.Z", "mps"],
            RefKind::Graphic => &["pdf", "png", "jpg", "mps", "jpeg", "jbig2", "jb2"],
            RefKind::Data => &[],
        };
        list.iter().map(|s| s.to_string()).collect()
    }

    /// Whether the target is TeX source that is scanned for further references.
    pub fn is_text(&self) -> bool {
        matches!(self, RefKind::Tex | RefKind::Class | RefKind::Package)
    }
}

/// A file named by a command in the source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    pub name: String,
    pub kind: RefKind,
    pub command: String,
}

/// Markers and references found in one text file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileScan {
    pub path: String,
    /// `\documentclass` or `\documentstyle`
    pub latex_marker: bool,
    /// `\bye`
    pub plain_marker: bool,
    pub begin_document: bool,
    /// `\pdfoutput=1`
    pub pdfoutput: bool,
    pub references: Vec<Reference>,
    /// Directories from `\graphicspath`, as written
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub graphicspath: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

impl FileScan {
    pub fn has_marker(&self) -> bool {
        self.latex_marker || self.plain_marker
    }
}

#[derive(Clone, Copy)]
enum Arg {
    /// File name in the first brace group
    First,
    /// Comma-separated list in the first brace group
    List,
    /// File name in the second brace group
    Second,
    /// `{dir}{file}`
    DirFile,
    /// `file=` key in the first group
    FileKey,
}

struct Command {
    name: &'static str,
    kind: RefKind,
    arg: Arg,
    /// Prefix and suffix wrapped around each name
    wrap: Option<(&'static str, &'static str)>,
}

const fn cmd(name: &'static str, kind: RefKind, arg: Arg) -> Command {
    Command {
        name,
        kind,
        arg,
        wrap: None,
    }
}

const COMMANDS: &[Command] = &[
    cmd("input", RefKind::Tex, Arg::First),
    cmd("include", RefKind::Tex, Arg::First),
    cmd("InputIfFileExists", RefKind::Tex, Arg::First),
    cmd("subfile", RefKind::Tex, Arg::First),
    cmd("subfileinclude", RefKind::Tex, Arg::First),
    cmd("lstinputlisting", RefKind::Tex, Arg::First),
    cmd("import", RefKind::Tex, Arg::DirFile),
    cmd("subimport", RefKind::Tex, Arg::DirFile),
    cmd("documentclass", RefKind::Class, Arg::First),
    cmd("documentstyle", RefKind::Class, Arg::First),
    cmd("LoadClass", RefKind::Class, Arg::First),
    cmd("LoadClassWithOptions", RefKind::Class, Arg::First),
    cmd("usepackage", RefKind::Package, Arg::List),
    cmd("RequirePackage", RefKind::Package, Arg::List),
    cmd("RequirePackageWithOptions", RefKind::Package, Arg::First),
    cmd("bibliography", RefKind::Bibliography, Arg::List),
    cmd("addbibresource", RefKind::Bibliography, Arg::First),
    cmd("includegraphics", RefKind::Graphic, Arg::First),
    cmd("tcbincludegraphics", RefKind::Graphic, Arg::First),
    cmd("epsfbox", RefKind::Graphic, Arg::First),
    cmd("includepdf", RefKind::Graphic, Arg::First),
    cmd("includesvg", RefKind::Graphic, Arg::First),
    cmd("epsfig", RefKind::Graphic, Arg::FileKey),
    cmd("psfig", RefKind::Graphic, Arg::FileKey),
    cmd("loadglsentries", RefKind::Data, Arg::First),
    cmd("DTLloaddb", RefKind::Data, Arg::Second),
    cmd("DTLloadrawdb", RefKind::Data, Arg::Second),
    Command {
        name: "usetikzlibrary",
        kind: RefKind::Tex,
        arg: Arg::List,
        wrap: Some(("tikzlibrary", ".code.tex")),
    },
    Command {
        name: "usepgflibrary",
        kind: RefKind::Tex,
        arg: Arg::List,
        wrap: Some(("pgflibrary", ".code.tex")),
    },
];

/// Removes `%` comments, keeping escaped `\%`.
pub fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        let mut backslashes = 0usize;
        let mut cut = line.len();
        for (i, c) in line.char_indices() {
            match c {
                '\\' => backslashes += 1,
                '%' if backslashes % 2 == 0 => {
                    cut = i;
                    break;
                }
                _ => backslashes = 0,
            }
        }
        out.push_str(&line[..cut]);
        out.push('\n');
    }
    out
}

struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.text.len() - trimmed.len();
    }

    fn eat(&mut self, c: char) -> bool {
        if self.rest().starts_with(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    /// Reads a balanced group opened by `open`, returning its contents.
    fn group(&mut self, open: char, close: char) -> Option<&'a str> {
        self.skip_ws();
        if !self.rest().starts_with(open) {
            return None;
        }
        let start = self.pos + open.len_utf8();
        let mut depth = 0usize;
        for (i, c) in self.rest().char_indices() {
            if c == open {
                depth += 1;
            } else if c == close {
                depth -= 1;
                if depth == 0 {
                    let end = self.pos + i;
                    self.pos = end + close.len_utf8();
                    return Some(&self.text[start..end]);
                }
            }
        }
        None
    }

    /// Letters of a control word starting at the cursor.
    fn word(&mut self) -> &'a str {
        let rest = self.rest();
        let len = rest
            .char_indices()
            .find(|(_, c)| !c.is_ascii_alphabetic())
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        self.pos += len;
        &rest[..len]
    }
}

fn clean_name(name: &str) -> String {
    let name = name.trim();
    name.strip_prefix("./").unwrap_or(name).to_string()
}

fn file_key(arg: &str) -> Option<String> {
    arg.split(',').find_map(|part| {
        let (key, value) = part.split_once('=')?;
        (key.trim() == "file" || key.trim() == "figure").then(|| clean_name(value))
    })
}

/// Scans stripped source for markers and references.
pub fn scan_text(path: &str, text: &str) -> FileScan {
    let stripped = strip_comments(text);
    let mut scan = FileScan {
        path: path.to_string(),
        ..Default::default()
    };
    let mut cursor = Cursor {
        text: &stripped,
        pos: 0,
    };

    while let Some(offset) = cursor.rest().find('\\') {
        cursor.pos += offset + 1;
        let word = cursor.word();
        match word {
            "" => {
                // control symbol such as `\\` or `\%`
                if !cursor.rest().is_empty() {
                    let skip = cursor.rest().chars().next().map(char::len_utf8).unwrap_or(0);
                    cursor.pos += skip;
                }
                continue;
            }
            "documentclass" | "documentstyle" => scan.latex_marker = true,
            "bye" => scan.plain_marker = true,
            "pdfoutput" => {
                cursor.skip_ws();
                cursor.eat('=');
                cursor.skip_ws();
                if cursor.rest().starts_with('1') {
                    scan.pdfoutput = true;
                }
                continue;
            }
            "begin" => {
                if cursor.group('{', '}').map(str::trim) == Some("document") {
                    scan.begin_document = true;
                }
                continue;
            }
            "graphicspath" => {
                if let Some(outer) = cursor.group('{', '}') {
                    let mut inner = Cursor { text: outer, pos: 0 };
                    while let Some(dir) = inner.group('{', '}') {
                        let dir = dir.trim();
                        if !dir.is_empty() {
                            scan.graphicspath.push(dir.to_string());
                        }
                    }
                }
                continue;
            }
            _ => {}
        }

        let Some(command) = COMMANDS.iter().find(|c| c.name == word) else {
            continue;
        };
        let before_args = cursor.pos;
        cursor.eat('*');
        while cursor.group('[', ']').is_some() {}

        // `\input file` without braces
        if word == "input" && !cursor.rest().trim_start().starts_with('{') {
            cursor.skip_ws();
            let rest = cursor.rest();
            let len = rest
                .char_indices()
                .find(|(_, c)| !(c.is_ascii_alphanumeric() || "-_./".contains(*c)))
                .map(|(i, _)| i)
                .unwrap_or(rest.len());
            if len > 0 {
                scan.references.push(Reference {
                    name: clean_name(&rest[..len]),
                    kind: command.kind,
                    command: word.to_string(),
                });
            }
            cursor.pos += len;
            continue;
        }

        let Some(first) = cursor.group('{', '}') else {
            cursor.pos = before_args;
            continue;
        };
        let names: Vec<String> = match command.arg {
            Arg::First => vec![clean_name(first)],
            Arg::List => first.split(',').map(clean_name).collect(),
            Arg::FileKey => file_key(first).into_iter().collect(),
            Arg::Second => cursor.group('{', '}').map(clean_name).into_iter().collect(),
            Arg::DirFile => match cursor.group('{', '}') {
                Some(file) => {
                    let dir = first.trim().trim_end_matches('/');
                    let joined = if dir.is_empty() {
                        file.trim().to_string()
                    } else {
                        format!("{}/{}", dir, file.trim())
                    };
                    vec![clean_name(&joined)]
                }
                None => Vec::new(),
            },
        };

        for name in names {
            if name.is_empty() {
                continue;
            }
            if name.contains('#') {
                scan.issues.push(format!(
                    "include_command_with_macro: \\{} used with macro parameter",
                    word
                ));
                continue;
            }
            let name = match command.wrap {
                Some((prefix, suffix)) => format!("{}{}{}", prefix, name, suffix),
                None => name,
            };
            let reference = Reference {
                name,
                kind: command.kind,
                command: word.to_string(),
            };
            if !scan.references.contains(&reference) {
                scan.references.push(reference);
            }
        }
    }

    if scan.latex_marker && scan.plain_marker {
        scan.issues
            .push("conflicting_file_type: both \\documentclass and \\bye".to_string());
    }
    scan
}
