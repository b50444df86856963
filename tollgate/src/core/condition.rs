//! Step conditions evaluated against run parameters.

use serde::{Deserialize, Serialize};

/// A single comparison against a parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ConditionAtom {
    /// The parameter exists and equals the value.
    Equals {
        /// Parameter name.
        param: String,
        /// Expected value.
        value: String,
    },
    /// The parameter is missing or differs from the value.
    NotEquals {
        /// Parameter name.
        param: String,
        /// Rejected value.
        value: String,
    },
    /// The parameter is defined.
    Exists {
        /// Parameter name.
        param: String,
    },
    /// The parameter is not defined.
    DoesNotExist {
        /// Parameter name.
        param: String,
    },
    /// The parameter value starts with a prefix.
    StartsWith {
        /// Parameter name.
        param: String,
        /// Required prefix.
        value: String,
    },
    /// The parameter value contains a substring.
    Contains {
        /// Parameter name.
        param: String,
        /// Required substring.
        value: String,
    },
}

impl ConditionAtom {
    fn holds<F>(&self, lookup: &F) -> bool
    where
        F: Fn(&str) -> Option<String>,
    {
        match self {
            Self::Equals { param, value } => lookup(param).is_some_and(|v| &v == value),
            Self::NotEquals { param, value } => lookup(param).map_or(true, |v| &v != value),
            Self::Exists { param } => lookup(param).is_some(),
            Self::DoesNotExist { param } => lookup(param).is_none(),
            Self::StartsWith { param, value } => {
                lookup(param).is_some_and(|v| v.starts_with(value.as_str()))
            }
            Self::Contains { param, value } => {
                lookup(param).is_some_and(|v| v.contains(value.as_str()))
            }
        }
    }
}

/// A conjunction of atoms; an empty condition always holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// Atoms that must all hold.
    #[serde(default)]
    pub all_of: Vec<ConditionAtom>,
}

impl Condition {
    /// A condition requiring `param == value`.
    #[must_use]
    pub fn equals(param: impl Into<String>, value: impl Into<String>) -> Self {
        Self::default().and(ConditionAtom::Equals {
            param: param.into(),
            value: value.into(),
        })
    }

    /// Adds another atom.
    #[must_use]
    pub fn and(mut self, atom: ConditionAtom) -> Self {
        self.all_of.push(atom);
        self
    }

    /// Evaluates the condition with a parameter lookup.
    pub fn is_satisfied_by<F>(&self, lookup: F) -> bool
    where
        F: Fn(&str) -> Option<String>,
    {
        self.all_of.iter().all(|atom| atom.holds(&lookup))
    }
}
