//! Source fixups applied to a plan's working copy before compilation.

use regex_lite::Regex;
use std::sync::OnceLock;

fn graphicspath_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\\graphicspath\s*\{((?:\s*\{[^{}]*\}\s*)+)\}").ok())
        .as_ref()
}

fn auto_pst_pdf_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^([^%\n]*)(\\usepackage\s*(?:\[[^\]]*\])?\s*\{\s*auto-pst-pdf\s*\})").ok()
    })
    .as_ref()
}

/// Makes every `\graphicspath` directory end in `/`.
pub fn normalize_graphicspath(text: &str) -> String {
    let Some(re) = graphicspath_re() else {
        return text.to_string();
    };
    re.replace_all(text, |caps: &regex_lite::Captures<'_>| {
        let dirs: String = caps[1]
            .split('}')
            .filter_map(|part| part.trim().strip_prefix('{'))
            .map(|dir| {
                let dir = dir.trim();
                if dir.is_empty() || dir.ends_with('/') {
                    format!("{{{}}}", dir)
                } else {
                    format!("{{{}/}}", dir)
                }
            })
            .collect();
        format!("\\graphicspath{{{}}}", dirs)
    })
    .into_owned()
}

/// Comments out `\usepackage{auto-pst-pdf}`, which shells out during compilation.
pub fn disable_auto_pst_pdf(text: &str) -> String {
    match auto_pst_pdf_re() {
        Some(re) => re.replace_all(text, "$1%$2").into_owned(),
        None => text.to_string(),
    }
}

/// Applies all fixups, returning the new text only when something changed.
pub fn apply(text: &str) -> Option<String> {
    let fixed = disable_auto_pst_pdf(&normalize_graphicspath(text));
    (fixed != text).then_some(fixed)
}
