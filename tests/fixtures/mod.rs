//! Shared fixtures: a fake toolchain of shell scripts and submission trees.
//!
//! Scripts run with `Isolation::None`; the sandbox still resolves them,
//! picks a profile from the bin directory prefix and filters the environment.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tex_lane::config::{IsolationMode, LaneConfig};

/// Answers every query with a system path built from the name and its first
/// extension, except names listed in `unknown-names` next to the script.
pub const RESOLVER_HELPER: &str = r##"
unknown=" "
if [ -f "${0%/*}/unknown-names" ]; then
  while IFS= read -r u; do unknown="$unknown$u "; done < "${0%/*}/unknown-names"
fi
header=1
while IFS= read -r line; do
  if [ "$header" = 1 ]; then
    case "$line" in
      "#"*) continue ;;
      "") header=0; continue ;;
      *) header=0 ;;
    esac
  fi
  name="$line"
  IFS= read -r exts
  echo "$name $exts"
  case "$unknown" in
    *" $name "*) echo "" ;;
    *) echo "SYSTEM:/texmf/$name.${exts%% *}" ;;
  esac
done
"##;

/// Job name from the last argument, as the engines derive it.
pub const JOB_PRELUDE: &str = r#"
for arg; do file="$arg"; done
job="${file%.tex}"
"#;

/// Engine that asks for BibTeX, then for a rerun, then settles.
pub const ENGINE_BIBTEX_RERUN: &str = r#"
count=0
if [ -f "$job.count" ]; then read count < "$job.count"; fi
count=$((count + 1))
echo "$count" > "$job.count"
printf '\\relax\n' > "$job.aux"
case "$count" in
  1) printf 'This is pdfTeX\nNo file %s.bbl.\n' "$job" > "$job.log" ;;
  2) printf 'This is pdfTeX\nLaTeX Warning: Citation(s) may have changed.\nRerun to get citations correct.\n' > "$job.log" ;;
  *) printf 'This is pdfTeX\nOutput written on %s.pdf (1 page).\n' "$job" > "$job.log" ;;
esac
printf '%%PDF-1.5\n' > "$job.pdf"
exit 0
"#;

/// Engine that converges after one pass.
pub const ENGINE_CLEAN: &str = r#"
printf '\\relax\n' > "$job.aux"
printf 'This is pdfTeX\nOutput written on %s.pdf (1 page).\n' "$job" > "$job.log"
printf '%%PDF-1.5\n' > "$job.pdf"
exit 0
"#;

/// Engine that always asks for another pass.
pub const ENGINE_ALWAYS_RERUN: &str = r#"
printf 'This is pdfTeX\nLaTeX Warning: Label(s) may have changed. Rerun to get cross-references right.\n' > "$job.log"
printf '%%PDF-1.5\n' > "$job.pdf"
exit 0
"#;

/// Engine that stops on a missing package.
pub const ENGINE_MISSING_PACKAGE: &str = r#"
cat > "$job.log" <<'EOF'
This is pdfTeX
(./main.tex
! LaTeX Error: File `foo.sty' not found.

Type X to quit or <RETURN> to proceed,
EOF
exit 1
"#;

/// Engine that keeps asking for BibTeX however often it runs.
pub const ENGINE_BIBTEX_LOOP: &str = r#"
printf '\\relax\n' > "$job.aux"
printf 'This is pdfTeX\nNo file %s.bbl.\n' "$job" > "$job.log"
printf '%%PDF-1.5\n' > "$job.pdf"
exit 0
"#;

/// Engine that exits 1 on its first pass with output and a rerun request.
pub const ENGINE_FAILS_THEN_RECOVERS: &str = r#"
count=0
if [ -f "$job.count" ]; then read count < "$job.count"; fi
count=$((count + 1))
echo "$count" > "$job.count"
printf '%%PDF-1.5\n' > "$job.pdf"
if [ "$count" = 1 ]; then
  printf 'This is pdfTeX\nLaTeX Warning: Label(s) may have changed. Rerun to get cross-references right.\n' > "$job.log"
  exit 1
fi
printf 'This is pdfTeX\nOutput written on %s.pdf (1 page).\n' "$job" > "$job.log"
exit 0
"#;

/// Engine that outlives any budget.
pub const ENGINE_SLOW: &str = r#"
printf 'This is pdfTeX\n' > "$job.log"
sleep 10
exit 0
"#;

/// DVI engine that converges after one pass.
pub const LATEX_DVI: &str = r#"
printf '\\relax\n' > "$job.aux"
printf 'This is TeX\nOutput written on %s.dvi (1 page).\n' "$job" > "$job.log"
printf 'DVI' > "$job.dvi"
exit 0
"#;

/// dvips that rejects hyperdvi output and writes the `-o` target otherwise.
pub const DVIPS_NO_HYPER: &str = r#"
for arg; do
  if [ "$arg" = "-z" ]; then echo "dvips: hyperdvi not supported" >&2; exit 1; fi
done
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done
printf '%%!PS-Adobe-3.0\n' > "$out"
exit 0
"#;

/// ps2pdf writing its second argument.
pub const PS2PDF: &str = r#"
printf '%%PDF-1.4\n' > "$2"
exit 0
"#;

/// BibTeX run against a missing database.
pub const BIBTEX_MISSING_DATABASE: &str = r#"
printf 'This is BibTeX\nI couldn'"'"'t open database file refs.bib\n' > "$1.blg"
exit 2
"#;

pub const BIBTEX: &str = r#"
printf 'This is BibTeX\n' > "$1.blg"
printf '\\begin{thebibliography}{1}\n\\end{thebibliography}\n' > "$1.bbl"
exit 0
"#;

/// Writes its last argument as a PDF.
pub const COMBINE: &str = r#"
for arg; do out="$arg"; done
printf '%%PDF-1.5 combined\n' > "$out"
exit 0
"#;

/// A bin directory of fake tools plus the configuration pointing at it.
pub struct FakeToolchain {
    _dir: TempDir,
    pub bin: PathBuf,
}

impl FakeToolchain {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let bin = dir.path().join("bin");
        fs::create_dir_all(&bin).unwrap();
        let bin = bin.canonicalize().unwrap();
        let toolchain = Self { _dir: dir, bin };
        toolchain.script("kpse-helper", RESOLVER_HELPER);
        toolchain.script("bibtex", BIBTEX);
        toolchain.script("pdfunite", COMBINE);
        toolchain
    }

    /// Installs an executable `/bin/sh` script.
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = self.bin.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Makes the resolver helper report `names` as not found.
    pub fn unknown_names(&self, names: &[&str]) {
        let list: String = names.iter().map(|n| format!("{}\n", n)).collect();
        fs::write(self.bin.join("unknown-names"), list).unwrap();
    }

    /// Installs `body` as every engine.
    pub fn engine(&self, body: &str) -> PathBuf {
        self.script("pdflatex", &format!("{}{}", JOB_PRELUDE, body))
    }

    fn tool(&self, name: &str) -> String {
        self.bin.join(name).display().to_string()
    }

    pub fn config(&self) -> LaneConfig {
        let mut config = LaneConfig::default();
        config.sandbox.isolation = IsolationMode::None;
        config.sandbox.toolchain_prefixes = vec![self.bin.clone()];
        config.sandbox.postprocess_prefixes = Vec::new();
        config.timeouts.invocation_seconds = 30;
        config.timeouts.overall_seconds = 120;
        config.timeouts.termination_grace_seconds = 1;
        config.jobs = 2;

        let engine = self.tool("pdflatex");
        config.engines.tex = engine.clone();
        config.engines.latex = engine.clone();
        config.engines.pdflatex = engine;
        config.engines.bibtex = self.tool("bibtex");
        config.engines.dvips = self.tool("dvips");
        config.engines.ps2pdf = self.tool("ps2pdf");

        config.resolver.helper = vec![self.tool("kpse-helper")];
        config.resolver.system_db = true;
        config.postprocess.combine_command = vec![self.tool("pdfunite")];
        config
    }
}

/// Creates `files` (path, contents) below a fresh directory.
pub fn tree(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    write_files(dir.path(), files);
    dir
}

pub fn write_files(root: &Path, files: &[(&str, &str)]) {
    for (path, contents) in files {
        let full = root.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full, contents).unwrap();
    }
}

pub const ARTICLE_WITH_BIBLIOGRAPHY: &str = "\\documentclass{article}\n\
\\begin{document}\n\
See \\cite{knuth}.\n\
\\bibliography{refs}\n\
\\end{document}\n";

pub const ARTICLE: &str = "\\documentclass{article}\n\\begin{document}\nHello.\n\\end{document}\n";
