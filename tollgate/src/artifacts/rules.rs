//! Artifact rule parsing and path mapping.
//!
//! Rules are separated by newlines or commas. A rule is one or more
//! whitespace separated source patterns, optionally followed by
//! `=> destination`. A `-:` prefix turns the rule into an exclusion and a
//! `+:` prefix is accepted and ignored. Patterns support `*`, `?` and `**`.
//!
//! The path below the first wildcard segment is preserved under the
//! destination; a literal file pattern maps to `destination/<file name>`
//! and a literal directory pattern maps its contents.

use glob::{MatchOptions, Pattern};
use std::collections::BTreeSet;
use thiserror::Error;

/// A malformed artifact rule.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuleParseError {
    /// `=>` with nothing on one side.
    #[error("Rule '{rule}' has an empty source or destination")]
    Empty {
        /// The offending rule.
        rule: String,
    },
    /// A pattern is absolute or climbs above the root.
    #[error("Pattern '{pattern}' must be relative and must not contain '..'")]
    NotRelative {
        /// The offending pattern.
        pattern: String,
    },
    /// A pattern is not a valid glob.
    #[error("Pattern '{pattern}' is not a valid glob: {reason}")]
    BadGlob {
        /// The offending pattern.
        pattern: String,
        /// The glob error.
        reason: String,
    },
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
struct Rule {
    source: String,
    pattern: Pattern,
    base: String,
    literal: bool,
    destination: String,
    exclude: bool,
}

impl Rule {
    fn matches(&self, path: &str) -> bool {
        if self.literal {
            return path == self.source || path.starts_with(&format!("{}/", self.source));
        }
        self.pattern.matches_with(path, MATCH_OPTIONS)
    }

    /// Path of a matching `path` relative to the destination.
    fn relative<'a>(&self, path: &'a str) -> &'a str {
        if self.literal {
            if path == self.source {
                return path.rsplit('/').next().unwrap_or(path);
            }
            return &path[self.source.len() + 1..];
        }
        if self.base.is_empty() {
            path
        } else {
            path.strip_prefix(&self.base)
                .map_or(path, |rest| rest.trim_start_matches('/'))
        }
    }

    fn map(&self, path: &str) -> String {
        let relative = self.relative(path);
        if self.destination.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{relative}", self.destination)
        }
    }
}

/// Outcome of applying rules to a set of paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleApplication {
    /// `(source path, destination path)` pairs in input order.
    pub mapped: Vec<(String, String)>,
    /// Source patterns of include rules that matched nothing.
    pub unmatched: Vec<String>,
}

/// A parsed artifact rule set.
#[derive(Debug, Clone, Default)]
pub struct ArtifactRules {
    rules: Vec<Rule>,
}

fn has_wildcard(segment: &str) -> bool {
    segment.contains(['*', '?', '['])
}

fn is_relative(path: &str) -> bool {
    !path.starts_with('/') && !path.split('/').any(|seg| seg == "..")
}

fn normalize(path: &str) -> String {
    let path = path.trim().replace('\\', "/");
    let path = path.trim_start_matches("./");
    path.trim_end_matches('/').to_string()
}

impl ArtifactRules {
    /// Parses a rule string. An empty string yields an empty rule set.
    pub fn parse(text: &str) -> Result<Self, RuleParseError> {
        let mut rules = Vec::new();

        for raw in text.split(['\n', ',']) {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let (exclude, body) = if let Some(rest) = line.strip_prefix("-:") {
                (true, rest.trim())
            } else {
                (false, line.strip_prefix("+:").unwrap_or(line).trim())
            };

            let (sources, destination) = match body.split_once("=>") {
                Some((src, dest)) => {
                    let dest = normalize(dest);
                    if src.trim().is_empty() || dest.is_empty() {
                        return Err(RuleParseError::Empty { rule: line.to_string() });
                    }
                    if !is_relative(&dest) {
                        return Err(RuleParseError::NotRelative { pattern: dest });
                    }
                    (src, dest)
                }
                None => (body, String::new()),
            };

            let mut any = false;
            for source in sources.split_whitespace() {
                any = true;
                rules.push(Self::compile(source, &destination, exclude)?);
            }
            if !any {
                return Err(RuleParseError::Empty { rule: line.to_string() });
            }
        }

        Ok(Self { rules })
    }

    fn compile(source: &str, destination: &str, exclude: bool) -> Result<Rule, RuleParseError> {
        let source = normalize(source);
        if !is_relative(&source) {
            return Err(RuleParseError::NotRelative { pattern: source });
        }
        let pattern = Pattern::new(&source).map_err(|e| RuleParseError::BadGlob {
            pattern: source.clone(),
            reason: e.msg.to_string(),
        })?;
        let base = source
            .split('/')
            .take_while(|seg| !has_wildcard(seg))
            .collect::<Vec<_>>()
            .join("/");
        let literal = !has_wildcard(&source);

        Ok(Rule {
            pattern,
            base,
            literal,
            destination: destination.to_string(),
            exclude,
            source,
        })
    }

    /// Returns true when there are no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Destination namespaces of the include rules, deduplicated.
    ///
    /// An empty string is the root namespace.
    #[must_use]
    pub fn destinations(&self) -> BTreeSet<String> {
        self.rules
            .iter()
            .filter(|r| !r.exclude)
            .map(|r| r.destination.clone())
            .collect()
    }

    /// Destination paths for one source path; empty if excluded or unmatched.
    #[must_use]
    pub fn map_path(&self, path: &str) -> Vec<String> {
        if self.rules.iter().any(|r| r.exclude && r.matches(path)) {
            return Vec::new();
        }
        let mut out: Vec<String> = Vec::new();
        for rule in self.rules.iter().filter(|r| !r.exclude && r.matches(path)) {
            let dest = rule.map(path);
            if !out.contains(&dest) {
                out.push(dest);
            }
        }
        out
    }

    /// Applies the rules to every path, tracking include rules that
    /// matched nothing.
    pub fn apply<'a, I>(&self, paths: I) -> RuleApplication
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut hits = vec![false; self.rules.len()];
        let mut mapped = Vec::new();

        for path in paths {
            if self.rules.iter().any(|r| r.exclude && r.matches(path)) {
                continue;
            }
            let mut seen: Vec<String> = Vec::new();
            for (i, rule) in self.rules.iter().enumerate() {
                if rule.exclude || !rule.matches(path) {
                    continue;
                }
                hits[i] = true;
                let dest = rule.map(path);
                if !seen.contains(&dest) {
                    seen.push(dest.clone());
                    mapped.push((path.to_string(), dest));
                }
            }
        }

        let unmatched = self
            .rules
            .iter()
            .zip(hits)
            .filter(|(rule, hit)| !rule.exclude && !hit)
            .map(|(rule, _)| rule.source.clone())
            .collect();

        RuleApplication { mapped, unmatched }
    }
}
