//! `+:`/`-:` branch specifications.

use regex::Regex;
use thiserror::Error;

/// Token that matches the VCS root's default branch in trigger filters.
pub const DEFAULT_BRANCH_TOKEN: &str = "<default>";

/// Error raised for a malformed branch specification.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BranchSpecError {
    /// A rule with nothing after its prefix.
    #[error("empty branch rule '{rule}'")]
    Empty {
        /// The offending rule.
        rule: String,
    },

    /// More than one `*` in a pattern.
    #[error("branch pattern '{pattern}' has more than one '*'")]
    TooManyWildcards {
        /// The offending pattern.
        pattern: String,
    },
}

#[derive(Debug, Clone)]
enum Matcher {
    Default,
    Pattern(Regex),
}

#[derive(Debug, Clone)]
struct BranchRule {
    include: bool,
    matcher: Matcher,
}

impl BranchRule {
    fn parse(line: &str) -> Result<Self, BranchSpecError> {
        let (include, pattern) = if let Some(rest) = line.strip_prefix("+:") {
            (true, rest.trim())
        } else if let Some(rest) = line.strip_prefix("-:") {
            (false, rest.trim())
        } else {
            (true, line)
        };
        if pattern.is_empty() {
            return Err(BranchSpecError::Empty { rule: line.to_string() });
        }
        if pattern == DEFAULT_BRANCH_TOKEN {
            return Ok(Self {
                include,
                matcher: Matcher::Default,
            });
        }

        let parts: Vec<&str> = pattern.split('*').collect();
        let source = match parts.as_slice() {
            [literal] => format!("^{}$", regex::escape(literal)),
            [head, tail] => format!("^{}(.*){}$", regex::escape(head), regex::escape(tail)),
            _ => {
                return Err(BranchSpecError::TooManyWildcards {
                    pattern: pattern.to_string(),
                })
            }
        };
        let regex = Regex::new(&source).map_err(|_| BranchSpecError::Empty { rule: line.to_string() })?;
        Ok(Self {
            include,
            matcher: Matcher::Pattern(regex),
        })
    }

    /// The logical name of `candidate` if this rule matches it. A literal
    /// rule names the branch by its short name.
    fn matched(&self, candidate: &str, is_default: bool) -> Option<String> {
        match &self.matcher {
            Matcher::Default => is_default.then(|| short_name(candidate).to_string()),
            Matcher::Pattern(regex) => regex.captures(candidate).map(|caps| {
                caps.get(1)
                    .map_or_else(|| short_name(candidate).to_string(), |m| m.as_str().to_string())
            }),
        }
    }
}

/// An ordered list of include and exclude rules over branch names.
///
/// The last rule matching a name decides; a name no rule matches is
/// excluded. A `*` in an include rule captures the logical branch name.
#[derive(Debug, Clone, Default)]
pub struct BranchSpec {
    rules: Vec<BranchRule>,
}

impl BranchSpec {
    /// Parses a newline separated rule list. Blank lines are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`BranchSpecError`] for an empty rule or a pattern with
    /// several wildcards.
    pub fn parse(text: &str) -> Result<Self, BranchSpecError> {
        let rules = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(BranchRule::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Returns true if the spec has no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn evaluate(&self, candidate: &str, is_default: bool) -> Option<String> {
        self.rules
            .iter()
            .rev()
            .find_map(|rule| rule.matched(candidate, is_default).map(|name| (rule.include, name)))
            .and_then(|(include, name)| include.then_some(name))
    }

    /// The logical branch name of a ref, or `None` if the spec excludes it.
    #[must_use]
    pub fn logical_name(&self, git_ref: &str) -> Option<String> {
        self.evaluate(git_ref, false)
    }

    /// Applies the spec as a filter over logical names. An empty filter
    /// accepts every branch.
    #[must_use]
    pub fn accepts(&self, branch: &str, is_default: bool) -> bool {
        self.is_empty() || self.evaluate(branch, is_default).is_some()
    }
}

/// The short name of a ref: `refs/heads/main` becomes `main`.
#[must_use]
pub fn short_name(git_ref: &str) -> &str {
    git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref)
}
