//! Route-matching predicates over message type names.
//!
//! The set of kinds is closed: adding one means adding a [`Specification`]
//! variant, and every `match` over it must be updated.

use regex::Regex;

use crate::error::ConfigurationError;
use crate::message::split_type_name;

/// A named predicate deciding whether a message type belongs to a route.
#[derive(Debug, Clone)]
pub enum Specification {
    /// Satisfied by any of the listed full type names.
    TypeList(Vec<String>),
    /// Satisfied by full type names starting with the prefix (namespace match).
    StartsWith(String),
    /// Satisfied when the pattern matches the full type name.
    Regex(Regex),
    /// Satisfied by assembly-qualified names whose assembly equals the value.
    Assembly(String),
}

impl Specification {
    /// Evaluates the predicate against a (possibly assembly-qualified) type name.
    #[must_use]
    pub fn is_satisfied_by(&self, message_type: &str) -> bool {
        let (type_name, assembly) = split_type_name(message_type);
        match self {
            Self::TypeList(types) => types.iter().any(|t| t == type_name),
            Self::StartsWith(prefix) => type_name.starts_with(prefix.as_str()),
            Self::Regex(regex) => regex.is_match(type_name),
            Self::Assembly(expected) => {
                assembly.is_some_and(|a| a.eq_ignore_ascii_case(expected))
            }
        }
    }

    /// Canonical configuration name of this kind.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::TypeList(_) => "TypeList",
            Self::StartsWith(_) => "StartsWith",
            Self::Regex(_) => "Regex",
            Self::Assembly(_) => "Assembly",
        }
    }

    /// Configuration value this specification was built from.
    #[must_use]
    pub fn value(&self) -> String {
        match self {
            Self::TypeList(types) => types.join(";"),
            Self::StartsWith(prefix) => prefix.clone(),
            Self::Regex(regex) => regex.as_str().to_string(),
            Self::Assembly(assembly) => assembly.clone(),
        }
    }
}

/// Equal when the (name, value) pairs are equal.
impl PartialEq for Specification {
    fn eq(&self, other: &Self) -> bool {
        self.name() == other.name() && self.value() == other.value()
    }
}

impl Eq for Specification {}

// ---------------------------------------------------------------------------
// SpecificationFactory
// ---------------------------------------------------------------------------

/// Builds [`Specification`]s from configuration `(name, value)` pairs.
///
/// Names are case-insensitive; `ExactType` and `NamespacePrefix` are accepted
/// as aliases of `TypeList` and `StartsWith`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpecificationFactory;

impl SpecificationFactory {
    /// Creates a specification.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::UnknownSpecification` for an unrecognized
    /// name and `ConfigurationError::InvalidRegex` for a bad pattern.
    pub fn create(&self, name: &str, value: &str) -> Result<Specification, ConfigurationError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "typelist" | "exacttype" => Ok(Specification::TypeList(
                value
                    .split(';')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(ToString::to_string)
                    .collect(),
            )),
            "startswith" | "namespaceprefix" => Ok(Specification::StartsWith(value.trim().to_string())),
            "regex" => Regex::new(value)
                .map(Specification::Regex)
                .map_err(|e| ConfigurationError::InvalidRegex {
                    pattern: value.to_string(),
                    reason: e.to_string(),
                }),
            "assembly" => Ok(Specification::Assembly(value.trim().to_string())),
            _ => Err(ConfigurationError::UnknownSpecification {
                name: name.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn create(name: &str, value: &str) -> Specification {
        SpecificationFactory.create(name, value).unwrap()
    }

    #[test]
    fn type_list_matches_exact_names_only() {
        let spec = create("TypeList", "Orders.PlaceOrder; Orders.CancelOrder");
        assert!(spec.is_satisfied_by("Orders.PlaceOrder"));
        assert!(spec.is_satisfied_by("Orders.CancelOrder, Orders.Messages"));
        assert!(!spec.is_satisfied_by("Orders.PlaceOrderV2"));
    }

    #[test]
    fn starts_with_matches_namespace() {
        let spec = create("NamespacePrefix", "Orders.");
        assert!(spec.is_satisfied_by("Orders.PlaceOrder"));
        assert!(!spec.is_satisfied_by("Billing.Invoice"));
        assert_eq!(spec.name(), "StartsWith");
    }

    #[test]
    fn regex_matches_type_name_without_assembly() {
        let spec = create("regex", "^Orders\\..*Command$");
        assert!(spec.is_satisfied_by("Orders.PlaceCommand, Orders.Messages"));
        assert!(!spec.is_satisfied_by("Orders.Placed"));
    }

    #[test]
    fn assembly_requires_qualified_name() {
        let spec = create("Assembly", "Orders.Messages");
        assert!(spec.is_satisfied_by("Orders.PlaceOrder, Orders.Messages"));
        assert!(!spec.is_satisfied_by("Orders.PlaceOrder"));
        assert!(!spec.is_satisfied_by("Orders.PlaceOrder, Billing.Messages"));
    }

    #[test]
    fn unknown_name_is_rejected() {
        let err = SpecificationFactory.create("Wildcard", "*").unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::UnknownSpecification {
                name: "Wildcard".to_string()
            }
        );
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let err = SpecificationFactory.create("Regex", "(").unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidRegex { ref pattern, .. } if pattern == "("));
    }

    #[test]
    fn equality_is_by_name_and_value() {
        assert_eq!(create("ExactType", "A;B"), create("TypeList", "A; B"));
        assert_ne!(create("StartsWith", "A"), create("TypeList", "A"));
    }

    proptest! {
        #[test]
        fn starts_with_agrees_with_str_prefix(prefix in "[A-Za-z.]{0,8}", rest in "[A-Za-z.]{0,8}") {
            let spec = Specification::StartsWith(prefix.clone());
            let name = format!("{prefix}{rest}");
            prop_assert!(spec.is_satisfied_by(&name));
        }
    }
}
