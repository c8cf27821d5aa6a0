//! Ordered signature table mapping log text to error kinds.

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::excerpt::excerpt;

/// Default number of log lines kept in an excerpt.
pub const DEFAULT_EXCERPT_LINES: usize = 20;

/// Closed taxonomy of failure causes recognised in tool logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// A class, style, or other package file could not be found
    MissingPackage,
    /// An input file or bibliography database could not be found
    MissingFile,
    /// A graphics file could not be found or loaded
    MissingGraphic,
    /// The engine does not support the graphics format in use
    UnknownGraphicsExtension,
    /// Font metric or font map problems
    FontConfiguration,
    /// A command or environment was defined twice
    MacroRedefinition,
    /// A package was loaded twice with incompatible options
    OptionClash,
    /// A control sequence was used but never defined
    UndefinedControlSequence,
    /// The engine stopped because it could not continue in batch mode
    EmergencyStop,
    /// The invocation exceeded its wall-clock limit
    Timeout,
    /// The sandbox could not be set up
    SandboxSetupFailed,
    /// The invoked binary is not under any known installation prefix
    UnknownBinaryLocation,
    /// No signature matched
    Unclassified,
}

impl ErrorKind {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::MissingPackage => "MISSING_PACKAGE",
            ErrorKind::MissingFile => "MISSING_FILE",
            ErrorKind::MissingGraphic => "MISSING_GRAPHIC",
            ErrorKind::UnknownGraphicsExtension => "UNKNOWN_GRAPHICS_EXTENSION",
            ErrorKind::FontConfiguration => "FONT_CONFIGURATION",
            ErrorKind::MacroRedefinition => "MACRO_REDEFINITION",
            ErrorKind::OptionClash => "OPTION_CLASH",
            ErrorKind::UndefinedControlSequence => "UNDEFINED_CONTROL_SEQUENCE",
            ErrorKind::EmergencyStop => "EMERGENCY_STOP",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::SandboxSetupFailed => "SANDBOX_SETUP_FAILED",
            ErrorKind::UnknownBinaryLocation => "UNKNOWN_BINARY_LOCATION",
            ErrorKind::Unclassified => "UNCLASSIFIED",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Result of classifying one log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    /// Matched kind, or `Unclassified`
    pub kind: ErrorKind,

    /// Offending name captured by the signature (file, package, macro)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    /// Zero-based line index of the match
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,

    /// Log lines around the match, or the log tail when unmatched
    pub excerpt: String,
}

/// Errors building a signature table.
#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("invalid signature pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("signature for {0} has neither `contains` nor `regex`")]
    EmptySignature(ErrorKind),
}

#[derive(Debug, Clone)]
enum Matcher {
    Contains(String),
    Regex(Regex),
}

/// One entry of the signature table.
#[derive(Debug, Clone)]
pub struct Signature {
    kind: ErrorKind,
    matcher: Matcher,
}

impl Signature {
    /// Matches lines containing `needle` verbatim.
    pub fn contains(kind: ErrorKind, needle: impl Into<String>) -> Self {
        Self {
            kind,
            matcher: Matcher::Contains(needle.into()),
        }
    }

    /// Matches lines against `pattern`; capture group 1, when present, is the subject.
    pub fn regex(kind: ErrorKind, pattern: &str) -> Result<Self, SignatureError> {
        let re = Regex::new(pattern).map_err(|e| SignatureError::InvalidPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            kind,
            matcher: Matcher::Regex(re),
        })
    }

    /// Kind this signature maps to
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    fn match_line(&self, line: &str) -> Option<Option<String>> {
        match &self.matcher {
            Matcher::Contains(needle) => line.contains(needle.as_str()).then_some(None),
            Matcher::Regex(re) => re
                .captures(line)
                .map(|caps| caps.get(1).map(|m| m.as_str().to_string())),
        }
    }
}

/// Serialized form of a signature, for tables loaded from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureSpec {
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

impl TryFrom<&SignatureSpec> for Signature {
    type Error = SignatureError;

    fn try_from(spec: &SignatureSpec) -> Result<Self, Self::Error> {
        match (&spec.regex, &spec.contains) {
            (Some(pattern), _) => Signature::regex(spec.kind, pattern),
            (None, Some(needle)) => Ok(Signature::contains(spec.kind, needle.clone())),
            (None, None) => Err(SignatureError::EmptySignature(spec.kind)),
        }
    }
}

/// Built-in signatures, most specific first.
const BUILTIN: &[(ErrorKind, &str)] = &[
    (
        ErrorKind::MissingPackage,
        r"^! LaTeX Error: File `([^']+\.(?:sty|cls|clo|def|cfg|fd))' not found",
    ),
    (
        ErrorKind::MissingGraphic,
        r"^! Package (?:pdftex|luatex|xetex|dvips)\.def Error: File `([^']+)' not found",
    ),
    (
        ErrorKind::MissingGraphic,
        r"Unable to load picture or PDF file '([^']+)'",
    ),
    (
        ErrorKind::UnknownGraphicsExtension,
        r"Unknown graphics extension: ?(\S*)",
    ),
    (ErrorKind::MissingFile, r"^! LaTeX Error: File `([^']+)' not found"),
    (ErrorKind::MissingFile, r"^! I can't find file `([^']+)'"),
    (
        ErrorKind::MissingFile,
        r"^! Package \S+ Error: File `([^']+)' not found",
    ),
    (ErrorKind::MissingFile, r"I couldn't open database file (\S+)"),
    (ErrorKind::MissingFile, r"ERROR - Cannot find '([^']+)'"),
    (
        ErrorKind::FontConfiguration,
        r"^! Font \S+=(\S+).* not loadable: Metric \(TFM\) file",
    ),
    (
        ErrorKind::FontConfiguration,
        r"pdfTeX error.*\(file (\S+)\): Font .* not found",
    ),
    (
        ErrorKind::FontConfiguration,
        r"fontmap entry for `([^']+)' already exists",
    ),
    (
        ErrorKind::FontConfiguration,
        r"^kpathsea: Running mktextfm (\S+)",
    ),
    (
        ErrorKind::MacroRedefinition,
        r"^! LaTeX Error: Command (\\\S+) already defined",
    ),
    (
        ErrorKind::MacroRedefinition,
        r"^! LaTeX Error: Environment (\S+) already defined",
    ),
    (
        ErrorKind::OptionClash,
        r"^! LaTeX Error: Option clash for package (\S+?)\.?$",
    ),
    (ErrorKind::UndefinedControlSequence, r"^! Undefined control sequence"),
    (ErrorKind::EmergencyStop, r"^! Emergency stop"),
    (
        ErrorKind::EmergencyStop,
        r"Fatal error occurred, no output PDF file produced",
    ),
];

/// Ordered table of signatures. The first signature with a matching line wins.
#[derive(Debug, Clone)]
pub struct SignatureTable {
    signatures: Vec<Signature>,
    excerpt_lines: usize,
}

impl SignatureTable {
    /// Table containing only the built-in signatures.
    pub fn builtin() -> Result<Self, SignatureError> {
        let signatures = BUILTIN
            .iter()
            .map(|(kind, pattern)| Signature::regex(*kind, pattern))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            signatures,
            excerpt_lines: DEFAULT_EXCERPT_LINES,
        })
    }

    /// Empty table; every log classifies as `Unclassified`.
    pub fn empty() -> Self {
        Self {
            signatures: Vec::new(),
            excerpt_lines: DEFAULT_EXCERPT_LINES,
        }
    }

    /// Prepends extra signatures so they take precedence over the built-ins.
    pub fn with_overrides(mut self, specs: &[SignatureSpec]) -> Result<Self, SignatureError> {
        let mut extra = specs
            .iter()
            .map(Signature::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        extra.append(&mut self.signatures);
        self.signatures = extra;
        Ok(self)
    }

    /// Appends a signature with the lowest precedence.
    pub fn push(&mut self, signature: Signature) {
        self.signatures.push(signature);
    }

    /// Sets the excerpt length.
    pub fn excerpt_lines(mut self, lines: usize) -> Self {
        self.excerpt_lines = lines;
        self
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Classifies a log against this table.
    pub fn classify(&self, log: &str) -> ClassifiedError {
        for signature in &self.signatures {
            for (index, line) in log.lines().enumerate() {
                if let Some(subject) = signature.match_line(line) {
                    return ClassifiedError {
                        kind: signature.kind,
                        subject,
                        line: Some(index),
                        excerpt: excerpt(log, Some(index), self.excerpt_lines.min(4)),
                    };
                }
            }
        }
        ClassifiedError {
            kind: ErrorKind::Unclassified,
            subject: None,
            line: None,
            excerpt: excerpt(log, None, self.excerpt_lines),
        }
    }
}

fn builtin_table() -> &'static SignatureTable {
    static TABLE: OnceLock<SignatureTable> = OnceLock::new();
    TABLE.get_or_init(|| SignatureTable::builtin().unwrap_or_else(|_| SignatureTable::empty()))
}

/// Classifies a log against the built-in table.
pub fn classify(log: &str) -> ClassifiedError {
    builtin_table().classify(log)
}

/// Classifies a log against a caller-supplied table.
pub fn classify_with(table: &SignatureTable, log: &str) -> ClassifiedError {
    table.classify(log)
}
