//! Masking of hardcoded secrets before source text reaches an extractor

use regex::Regex;
use tracing::warn;

/// (kind, pattern, capture group holding the secret; 0 for the whole match)
const PATTERNS: &[(&str, &str, usize)] = &[
    (
        "aws_access_key",
        r#"(?i)(aws_access_key_id|aws_secret_access_key|aws_session_token|aws_key)\s*[=:]\s*['"]([A-Za-z0-9/+=]{16,})['"]"#,
        2,
    ),
    ("aws_key_id", r"\b(AKIA|ASIA)[0-9A-Z]{16}\b", 0),
    (
        "generic_api_key",
        r#"(?i)(api[_-]?key|api[_-]?secret|app[_-]?key|app[_-]?secret|secret[_-]?key|access[_-]?token)\s*[=:]\s*['"]([A-Za-z0-9_\-+=/.]{10,})['"]"#,
        2,
    ),
    (
        "generic_secret",
        r#"(?i)(secret|token|password|passwd|pwd)\s*[=:]\s*['"]([^'"\s]{4,})['"]"#,
        2,
    ),
    (
        "private_key",
        r"-----BEGIN[ A-Z]*PRIVATE KEY-----[\s\S]*?-----END[ A-Z]*PRIVATE KEY-----",
        0,
    ),
    (
        "connection_string",
        r#"(?i)\b(?:mongodb(?:\+srv)?|postgres(?:ql)?|mysql|redis|amqp|jdbc:[a-z]+)://[^\s"':/@]+:[^\s"'@]+@[^\s"']+"#,
        0,
    ),
    (
        "jwt_token",
        r"\beyJ[A-Za-z0-9_-]{10,}\.[A-Za-z0-9_-]{10,}\.[A-Za-z0-9_-]{10,}",
        0,
    ),
];

/// Values that look like documentation rather than credentials.
const PLACEHOLDERS: &str = r"(?i)your[_-]|placeholder|example|dummy|changeme|x{4,}|\*{4,}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretFinding {
    pub kind: &'static str,
    pub start_line: u32,
    pub end_line: u32,
}

/// Source text with secrets replaced by `*`, plus where they were.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskedSource {
    pub text: String,
    pub findings: Vec<SecretFinding>,
}

impl MaskedSource {
    pub fn unmasked(text: String) -> Self {
        MaskedSource {
            text,
            findings: Vec::new(),
        }
    }

    /// Whether any finding overlaps the inclusive line range.
    pub fn overlaps(&self, start_line: u32, end_line: u32) -> bool {
        self.findings
            .iter()
            .any(|f| f.start_line <= end_line && start_line <= f.end_line)
    }
}

pub struct SecretMasker {
    patterns: Vec<(&'static str, Regex, usize)>,
    placeholder: Option<Regex>,
}

impl SecretMasker {
    pub fn new() -> Self {
        let patterns = PATTERNS
            .iter()
            .filter_map(|(kind, pattern, group)| match Regex::new(pattern) {
                Ok(re) => Some((*kind, re, *group)),
                Err(e) => {
                    warn!("Skipping secret pattern {}: {}", kind, e);
                    None
                }
            })
            .collect();
        SecretMasker {
            patterns,
            placeholder: Regex::new(PLACEHOLDERS).ok(),
        }
    }

    /// Replace every secret with `*` of the same character length.
    ///
    /// Line breaks inside a match are kept so line numbers of everything
    /// after it are unchanged.
    pub fn mask(&self, source: &str) -> MaskedSource {
        let mut ranges: Vec<(usize, usize, &'static str)> = Vec::new();
        for (kind, re, group) in &self.patterns {
            for caps in re.captures_iter(source) {
                let Some(m) = caps.get(*group) else {
                    continue;
                };
                if self.placeholder.as_ref().is_some_and(|p| p.is_match(m.as_str())) {
                    continue;
                }
                ranges.push((m.start(), m.end(), kind));
            }
        }
        if ranges.is_empty() {
            return MaskedSource::unmasked(source.to_string());
        }
        ranges.sort_by_key(|(start, end, _)| (*start, std::cmp::Reverse(*end)));

        let mut text = String::with_capacity(source.len());
        let mut findings = Vec::new();
        let mut cursor = 0;
        for (start, end, kind) in ranges {
            if end <= cursor {
                continue;
            }
            let start = start.max(cursor);
            text.push_str(&source[cursor..start]);
            text.extend(
                source[start..end]
                    .chars()
                    .map(|c| if c == '\n' || c == '\r' { c } else { '*' }),
            );
            findings.push(SecretFinding {
                kind,
                start_line: line_of(source, start),
                end_line: line_of(source, end.saturating_sub(1).max(start)),
            });
            cursor = end;
        }
        text.push_str(&source[cursor..]);
        MaskedSource { text, findings }
    }
}

impl Default for SecretMasker {
    fn default() -> Self {
        Self::new()
    }
}

fn line_of(source: &str, offset: usize) -> u32 {
    source[..offset].matches('\n').count() as u32 + 1
}
