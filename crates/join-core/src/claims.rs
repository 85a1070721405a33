//! Verified claims extracted from an external identity token.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Attributes of a successfully verified external identity token.
///
/// Providers decide the shape: each attribute name lives in exactly one of
/// `scalars` or `lists`, and that placement fixes how rules compare against it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Token subject (`sub`).
    pub subject: String,
    /// Single-valued attributes, compared by equality.
    #[serde(default)]
    pub scalars: BTreeMap<String, String>,
    /// Multi-valued attributes, compared by membership.
    #[serde(default)]
    pub lists: BTreeMap<String, Vec<String>>,
}

/// Result of looking up one attribute for comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute<'a> {
    /// Scalar attribute value.
    Scalar(&'a str),
    /// List attribute values.
    List(&'a [String]),
    /// The provider did not report this attribute.
    Missing,
}

impl Attribute<'_> {
    /// Whether `required` satisfies this attribute: equality for scalars,
    /// membership for lists. A missing attribute satisfies nothing.
    #[must_use]
    pub fn satisfies(&self, required: &str) -> bool {
        match self {
            Self::Scalar(value) => *value == required,
            Self::List(values) => values.iter().any(|v| v == required),
            Self::Missing => false,
        }
    }
}

impl Claims {
    /// Create claims for `subject` with no attributes.
    #[must_use]
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..Self::default()
        }
    }

    /// Builder: add a scalar attribute.
    #[must_use]
    pub fn with_scalar(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.scalars.insert(name.into(), value.into());
        self
    }

    /// Builder: add a list attribute.
    #[must_use]
    pub fn with_list<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lists
            .insert(name.into(), values.into_iter().map(Into::into).collect());
        self
    }

    /// Look up an attribute by name. Scalars take precedence over lists.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Attribute<'_> {
        if let Some(value) = self.scalars.get(name) {
            return Attribute::Scalar(value);
        }
        if let Some(values) = self.lists.get(name) {
            return Attribute::List(values);
        }
        Attribute::Missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_requires_exact_equality() {
        let claims = Claims::new("sub").with_scalar("project_id", "p1");

        assert!(claims.attribute("project_id").satisfies("p1"));
        assert!(!claims.attribute("project_id").satisfies("P1"));
        assert!(!claims.attribute("project_id").satisfies(""));
    }

    #[test]
    fn list_requires_membership() {
        let claims = Claims::new("sub").with_list("context_id", ["a", "b"]);

        assert!(claims.attribute("context_id").satisfies("a"));
        assert!(claims.attribute("context_id").satisfies("b"));
        assert!(!claims.attribute("context_id").satisfies("c"));
    }

    #[test]
    fn missing_attribute_satisfies_nothing() {
        let claims = Claims::new("sub");

        assert_eq!(claims.attribute("project_id"), Attribute::Missing);
        assert!(!claims.attribute("project_id").satisfies(""));
    }

    #[test]
    fn empty_list_satisfies_nothing() {
        let claims = Claims::new("sub").with_list("context_id", Vec::<String>::new());

        assert!(!claims.attribute("context_id").satisfies("a"));
    }
}
