//! Layered `%name%` parameter resolution.
//!
//! Lookup order, first hit wins: predefined run values (`build.number`,
//! `build.branch`, ...), run overrides, build parameters, project
//! parameters, `env.*` names from the captured process environment, and
//! finally the [`SecretStore`]. `%%` is a literal percent sign.
//! References inside non-secret values are expanded recursively.

use crate::errors::ParameterError;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock};

/// Replacement shown in logs for secret values.
pub const MASK: &str = "*******";

/// Predefined parameter names.
pub mod predefined {
    /// Logical branch name.
    pub const BRANCH: &str = "build.branch";
    /// `"true"` when the branch is the default branch.
    pub const BRANCH_IS_DEFAULT: &str = "build.branch.is_default";
    /// Per-build sequence number.
    pub const BUILD_NUMBER: &str = "build.number";
    /// Checkout directory of the run.
    pub const CHECKOUT_DIR: &str = "build.checkout_dir";
    /// Build definition id.
    pub const BUILD_ID: &str = "build.id";
    /// Run id.
    pub const RUN_ID: &str = "build.run_id";
}

/// External source of secret parameter values.
///
/// Values are fetched on demand and never copied into run state.
#[cfg_attr(test, mockall::automock)]
pub trait SecretStore: Send + Sync {
    /// Returns the secret value for `name`, if the store has one.
    fn lookup(&self, name: &str) -> Option<String>;
}

/// A secret store backed by an in-memory map.
#[derive(Debug, Clone, Default)]
pub struct MapSecretStore {
    values: BTreeMap<String, String>,
}

impl MapSecretStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a secret.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

impl SecretStore for MapSecretStore {
    fn lookup(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%%|%([A-Za-z0-9_.\-]+)%").expect("token pattern is valid"));

enum Source {
    Plain(String),
    Secret(String),
}

/// Scoped parameter lookup for one run.
#[derive(Clone, Default)]
pub struct ParameterResolver {
    predefined: BTreeMap<String, String>,
    run: BTreeMap<String, String>,
    build: BTreeMap<String, String>,
    global: BTreeMap<String, String>,
    env: BTreeMap<String, String>,
    secrets: Option<Arc<dyn SecretStore>>,
}

impl std::fmt::Debug for ParameterResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterResolver")
            .field("predefined", &self.predefined)
            .field("run", &self.run)
            .field("build", &self.build)
            .field("global", &self.global)
            .field("env_vars", &self.env.len())
            .field("has_secrets", &self.secrets.is_some())
            .finish()
    }
}

impl ParameterResolver {
    /// Creates a resolver with no scopes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the predefined run values.
    #[must_use]
    pub fn with_predefined(mut self, values: BTreeMap<String, String>) -> Self {
        self.predefined = values;
        self
    }

    /// Sets run-scoped overrides.
    #[must_use]
    pub fn with_run(mut self, values: BTreeMap<String, String>) -> Self {
        self.run = values;
        self
    }

    /// Sets build-scoped parameters.
    #[must_use]
    pub fn with_build(mut self, values: BTreeMap<String, String>) -> Self {
        self.build = values;
        self
    }

    /// Sets project-scoped parameters.
    #[must_use]
    pub fn with_global(mut self, values: BTreeMap<String, String>) -> Self {
        self.global = values;
        self
    }

    /// Sets the environment used for `env.*` names.
    #[must_use]
    pub fn with_env(mut self, vars: BTreeMap<String, String>) -> Self {
        self.env = vars;
        self
    }

    /// Captures the current process environment for `env.*` names.
    #[must_use]
    pub fn with_process_env(self) -> Self {
        self.with_env(std::env::vars().collect())
    }

    /// Sets the secret store consulted last.
    #[must_use]
    pub fn with_secrets(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(store);
        self
    }

    fn source(&self, name: &str) -> Option<Source> {
        let plain = self
            .predefined
            .get(name)
            .or_else(|| self.run.get(name))
            .or_else(|| self.build.get(name))
            .or_else(|| self.global.get(name))
            .or_else(|| name.strip_prefix("env.").and_then(|var| self.env.get(var)));
        if let Some(value) = plain {
            return Some(Source::Plain(value.clone()));
        }
        self.secrets
            .as_ref()
            .and_then(|store| store.lookup(name))
            .map(Source::Secret)
    }

    fn expand(
        &self,
        text: &str,
        stack: &mut Vec<String>,
        secrets: &mut BTreeSet<String>,
    ) -> Result<String, ParameterError> {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;

        for caps in TOKEN.captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&text[last..whole.start()]);
            last = whole.end();

            let Some(name) = caps.get(1).map(|m| m.as_str()) else {
                out.push('%');
                continue;
            };

            if let Some(pos) = stack.iter().position(|n| n == name) {
                let mut chain = stack[pos..].to_vec();
                chain.push(name.to_string());
                return Err(ParameterError::Cycle { chain });
            }

            match self.source(name) {
                None => {
                    return Err(ParameterError::Unresolved {
                        name: name.to_string(),
                    })
                }
                Some(Source::Secret(value)) => {
                    out.push_str(&value);
                    if !value.is_empty() {
                        secrets.insert(value);
                    }
                }
                Some(Source::Plain(value)) => {
                    stack.push(name.to_string());
                    let expanded = self.expand(&value, stack, secrets)?;
                    stack.pop();
                    out.push_str(&expanded);
                }
            }
        }

        out.push_str(&text[last..]);
        Ok(out)
    }

    /// Substitutes every `%name%` token in `text`.
    pub fn resolve(&self, text: &str) -> Result<String, ParameterError> {
        let mut secrets = BTreeSet::new();
        self.resolve_with_secrets(text, &mut secrets)
    }

    /// Like [`resolve`](Self::resolve), recording secret values that were
    /// substituted so callers can mask them in captured output.
    pub fn resolve_with_secrets(
        &self,
        text: &str,
        secrets: &mut BTreeSet<String>,
    ) -> Result<String, ParameterError> {
        self.expand(text, &mut Vec::new(), secrets)
    }

    /// Resolves the value of a single parameter.
    pub fn resolve_param(&self, name: &str) -> Result<String, ParameterError> {
        self.resolve(&format!("%{name}%"))
    }

    /// The resolved value of `name`, or `None` when it is undefined or
    /// cannot be resolved. Used for condition evaluation.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<String> {
        self.resolve_param(name).ok()
    }
}

/// Replaces every secret value in `text` with [`MASK`].
#[must_use]
pub fn mask_secrets(text: &str, secrets: &BTreeSet<String>) -> String {
    secrets
        .iter()
        .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), MASK))
}
