//! Line protocol spoken with the toolchain inspection helper.
//!
//! Request: optional `#progname <name>` and `#path <prefix>` header lines
//! closed by a blank line, then one `name` line and one space-separated
//! extension line per query. Response: per query, an echo line
//! (`name ext ext ...`) followed by the resolved path, which is empty when
//! nothing was found and prefixed with `SYSTEM:` when it lies outside the
//! submission tree.

use serde::{Deserialize, Serialize};

use super::ResolveError;

/// Marker for results outside the submission tree.
pub const SYSTEM_PREFIX: &str = "SYSTEM:";

/// One name to look up with its candidate extensions, in preference order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryItem {
    pub name: String,
    pub extensions: Vec<String>,
}

/// A batch sent in one helper invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryBatch {
    /// Selects the engine's search rules
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progname: Option<String>,

    /// Directory the helper searches first
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,

    pub items: Vec<QueryItem>,
}

impl QueryBatch {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Where a name resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "location", content = "path", rename_all = "snake_case")]
pub enum Found {
    Local(String),
    System(String),
    NotFound,
}

/// Answer for one [`QueryItem`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryAnswer {
    pub item: QueryItem,
    pub found: Found,
}

pub fn encode_request(batch: &QueryBatch) -> String {
    let mut out = String::new();
    let mut header = false;
    if let Some(progname) = &batch.progname {
        out.push_str(&format!("#progname {}\n", progname));
        header = true;
    }
    if let Some(prefix) = &batch.path_prefix {
        out.push_str(&format!("#path {}\n", prefix));
        header = true;
    }
    if header {
        out.push('\n');
    }
    for item in &batch.items {
        out.push_str(&item.name);
        out.push('\n');
        out.push_str(&item.extensions.join(" "));
        out.push('\n');
    }
    out
}

/// Interprets one resolved-path line.
pub fn parse_found(line: &str) -> Found {
    let line = line.trim_end_matches('\r');
    if line.is_empty() {
        return Found::NotFound;
    }
    if let Some(path) = line.strip_prefix(SYSTEM_PREFIX) {
        return Found::System(path.to_string());
    }
    Found::Local(line.strip_prefix("./").unwrap_or(line).to_string())
}

/// Pairs a helper response with the batch it answers.
pub fn decode_response(batch: &QueryBatch, response: &str) -> Result<Vec<QueryAnswer>, ResolveError> {
    let mut lines = response.lines();
    let mut answers = Vec::with_capacity(batch.items.len());
    for item in &batch.items {
        let echo = lines.next().ok_or_else(|| ResolveError::Protocol(format!(
            "response ended before answer for {}",
            item.name
        )))?;
        let echoed = echo.split_whitespace().next().unwrap_or("");
        if echoed != item.name {
            return Err(ResolveError::Protocol(format!(
                "expected echo of {}, got {:?}",
                item.name, echo
            )));
        }
        // A missing final line means the last name was not found.
        let found = lines.next().map(parse_found).unwrap_or(Found::NotFound);
        answers.push(QueryAnswer {
            item: item.clone(),
            found,
        });
    }
    Ok(answers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, exts: &[&str]) -> QueryItem {
        QueryItem {
            name: name.to_string(),
            extensions: exts.iter().map(|e| e.to_string()).collect(),
        }
    }

    fn batch() -> QueryBatch {
        QueryBatch {
            progname: Some("pdflatex".to_string()),
            path_prefix: Some("/work/sub".to_string()),
            items: vec![
                item("article", &["cls"]),
                item("fig", &["pdf", "png"]),
                item("nothere", &["sty"]),
            ],
        }
    }

    #[test]
    fn test_encode_request() {
        assert_eq!(
            encode_request(&batch()),
            "#progname pdflatex\n#path /work/sub\n\narticle\ncls\nfig\npdf png\nnothere\nsty\n"
        );
    }

    #[test]
    fn test_encode_without_header() {
        let b = QueryBatch {
            items: vec![item("a", &[])],
            ..Default::default()
        };
        assert_eq!(encode_request(&b), "a\n\n");
    }

    #[test]
    fn test_decode_response() {
        let response = "article cls\nSYSTEM:/usr/share/texlive/article.cls\nfig pdf png\n./fig.png\nnothere sty\n\n";
        let answers = decode_response(&batch(), response).unwrap();
        assert_eq!(
            answers.iter().map(|a| a.found.clone()).collect::<Vec<_>>(),
            vec![
                Found::System("/usr/share/texlive/article.cls".to_string()),
                Found::Local("fig.png".to_string()),
                Found::NotFound,
            ]
        );
    }

    #[test]
    fn test_decode_tolerates_missing_last_line() {
        let response = "article cls\n\nfig pdf png\n\nnothere sty";
        let answers = decode_response(&batch(), response).unwrap();
        assert!(answers.iter().all(|a| a.found == Found::NotFound));
    }

    #[test]
    fn test_decode_rejects_mismatch() {
        let response = "other cls\n\n";
        assert!(matches!(
            decode_response(&batch(), response),
            Err(ResolveError::Protocol(_))
        ));
    }

    #[test]
    fn test_decode_rejects_short_response() {
        let response = "article cls\n\n";
        assert!(decode_response(&batch(), response).is_err());
    }
}
