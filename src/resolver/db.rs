//! Handles on the installed toolchain's file database.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use tex_lane_sandbox::{Invocation, Run, RunTag, Sandbox, Stage};

use super::protocol::{decode_response, encode_request, Found, QueryAnswer, QueryBatch};
use super::ResolveError;

/// Answers of one batch, plus the run that produced them when a helper was invoked.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub answers: Vec<QueryAnswer>,
    pub run: Option<Run>,
}

/// Read-only view of the toolchain file database.
///
/// Obtained once at startup and passed to every resolution call.
pub trait ToolchainDb: Send + Sync {
    fn query(&self, batch: &QueryBatch) -> Result<BatchResult, ResolveError>;
}

/// Queries the database through the inspection helper, one invocation per batch.
#[derive(Debug, Clone)]
pub struct KpseToolchainDb {
    sandbox: Arc<Sandbox>,
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl KpseToolchainDb {
    pub fn new(sandbox: Arc<Sandbox>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            sandbox,
            program: program.into(),
            args,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl ToolchainDb for KpseToolchainDb {
    fn query(&self, batch: &QueryBatch) -> Result<BatchResult, ResolveError> {
        if batch.is_empty() {
            return Ok(BatchResult {
                answers: Vec::new(),
                run: None,
            });
        }
        let cwd = batch
            .path_prefix
            .as_ref()
            .map(PathBuf::from)
            .ok_or_else(|| ResolveError::Protocol("batch has no path prefix".to_string()))?;
        let mut args = self.args.clone();
        args.push(cwd.display().to_string());

        let mut invocation = Invocation::new(RunTag::new(Stage::Resolve), self.program.clone(), cwd)
            .args(args)
            .stdin(encode_request(batch).into_bytes());
        if let Some(timeout) = self.timeout {
            invocation = invocation.timeout(timeout);
        }
        let run = self.sandbox.run(&invocation);
        debug!(seq = run.seq, exit_code = run.exit_code, items = batch.items.len(), "resolver query ran");

        if !run.succeeded() {
            warn!(exit_code = run.exit_code, "resolver helper failed");
            return Err(ResolveError::Helper {
                message: format!("helper exited with {}", run.exit_code),
                run: Box::new(run),
            });
        }
        match decode_response(batch, &run.stdout) {
            Ok(answers) => Ok(BatchResult {
                answers,
                run: Some(run),
            }),
            Err(e) => Err(ResolveError::Helper {
                message: e.to_string(),
                run: Box::new(run),
            }),
        }
    }
}

/// In-memory database keyed by file name, for tests and `--no-system-db`.
#[derive(Debug, Clone, Default)]
pub struct StaticToolchainDb {
    files: BTreeMap<String, String>,
}

impl StaticToolchainDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name` (with extension) as living at `path`.
    pub fn with_file(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.files.insert(name.into(), path.into());
        self
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl ToolchainDb for StaticToolchainDb {
    fn query(&self, batch: &QueryBatch) -> Result<BatchResult, ResolveError> {
        let answers = batch
            .items
            .iter()
            .map(|item| {
                let names = std::iter::once(item.name.clone()).chain(
                    item.extensions
                        .iter()
                        .map(|ext| format!("{}.{}", item.name, ext)),
                );
                let found = names
                    .filter_map(|name| self.files.get(&name).cloned())
                    .next()
                    .map(Found::System)
                    .unwrap_or(Found::NotFound);
                QueryAnswer {
                    item: item.clone(),
                    found,
                }
            })
            .collect();
        Ok(BatchResult { answers, run: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::QueryItem;

    #[test]
    fn test_static_db_tries_name_then_extensions() {
        let db = StaticToolchainDb::new()
            .with_file("article.cls", "/tl/article.cls")
            .with_file("graphicx.sty", "/tl/graphicx.sty");
        let batch = QueryBatch {
            items: vec![
                QueryItem {
                    name: "article".to_string(),
                    extensions: vec!["cls".to_string()],
                },
                QueryItem {
                    name: "graphicx.sty".to_string(),
                    extensions: vec!["sty".to_string()],
                },
                QueryItem {
                    name: "missing".to_string(),
                    extensions: vec!["sty".to_string()],
                },
            ],
            ..Default::default()
        };
        let result = db.query(&batch).unwrap();
        assert!(result.run.is_none());
        assert_eq!(result.answers[0].found, Found::System("/tl/article.cls".to_string()));
        assert_eq!(result.answers[1].found, Found::System("/tl/graphicx.sty".to_string()));
        assert_eq!(result.answers[2].found, Found::NotFound);
    }

    #[test]
    fn test_empty_batch_skips_helper() {
        let sandbox = Arc::new(Sandbox::new(Default::default()));
        let db = KpseToolchainDb::new(sandbox, "/nonexistent/helper", Vec::new());
        let result = db.query(&QueryBatch::default()).unwrap();
        assert!(result.run.is_none());
        assert!(result.answers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_kpse_db_through_sandbox() {
        use std::os::unix::fs::PermissionsExt;
        use tex_lane_sandbox::{Isolation, ProfileSet, SandboxConfig, SandboxProfile};

        let bin = tempfile::TempDir::new().unwrap();
        let work = tempfile::TempDir::new().unwrap();
        let helper = bin.path().join("helper");
        std::fs::write(
            &helper,
            "#!/bin/sh\nwhile read -r name; do\n  case \"$name\" in \\#*|'') continue;; esac\n  read -r exts\n  echo \"$name $exts\"\n  if [ \"$name\" = article ]; then echo SYSTEM:/tl/article.cls; else echo; fi\ndone\n",
        )
        .unwrap();
        std::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = SandboxConfig {
            isolation: Isolation::None,
            profiles: ProfileSet {
                toolchain: SandboxProfile::toolchain(vec![bin.path().canonicalize().unwrap()]),
                postprocess: SandboxProfile::postprocess(vec![]),
            },
            ..Default::default()
        };
        let db = KpseToolchainDb::new(
            Arc::new(Sandbox::new(config)),
            helper.display().to_string(),
            Vec::new(),
        );
        let batch = QueryBatch {
            progname: Some("pdflatex".to_string()),
            path_prefix: Some(work.path().display().to_string()),
            items: vec![
                QueryItem {
                    name: "article".to_string(),
                    extensions: vec!["cls".to_string()],
                },
                QueryItem {
                    name: "zzz".to_string(),
                    extensions: vec!["sty".to_string()],
                },
            ],
        };
        let result = db.query(&batch).unwrap();
        let run = result.run.unwrap();
        assert_eq!(run.tag.stage, Stage::Resolve);
        assert_eq!(result.answers[0].found, Found::System("/tl/article.cls".to_string()));
        assert_eq!(result.answers[1].found, Found::NotFound);
    }
}
