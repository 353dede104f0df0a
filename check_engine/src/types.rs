//! Core wire-format types shared across the compliance check engine.
//!
//! These mirror the bit-exact contracts in the persisted schemas: enum
//! values here are the ones that round-trip through JSON/CSV storage, not
//! internal Rust symbol names. See [`ComparisonOperator`] and
//! [`ConnectionType`] docs for the exact wire values each variant maps to.

use pyo3::prelude::*;
use serde::{Deserialize, Serialize};

/// The comparison operators a [`crate::check::Check`] may use.
///
/// Wire values (as stored in `metadata.operation.name` and
/// `comparison_operation`) are the literal strings below — never an
/// internal enum symbol name. Round-tripping a Check through
/// serialisation must preserve these exact strings (testable property
/// "Enum fidelity").
#[pyclass(eq, eq_int)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOperator {
    /// Wire value `"=="`.
    #[serde(rename = "==")]
    Equal,
    /// Wire value `"!="`.
    #[serde(rename = "!=")]
    NotEqual,
    /// Wire value `"<"`.
    #[serde(rename = "<")]
    LessThan,
    /// Wire value `">"`.
    #[serde(rename = ">")]
    GreaterThan,
    /// Wire value `"<="`.
    #[serde(rename = "<=")]
    LessThanOrEqual,
    /// Wire value `">="`.
    #[serde(rename = ">=")]
    GreaterThanOrEqual,
    /// Wire value `"contains"`.
    #[serde(rename = "contains")]
    Contains,
    /// Wire value `"not_contains"`.
    #[serde(rename = "not_contains")]
    NotContains,
    /// Wire value `"custom"` — executes `metadata.operation.logic` in the
    /// predicate sandbox (see [`crate::sandbox`]).
    #[serde(rename = "custom")]
    Custom,
}

impl ComparisonOperator {
    /// Parse the operator's wire value, tolerating the handful of
    /// long-form spellings the original Python generator sometimes
    /// emitted (`"equal"`, `"not_equal"`, ...) alongside the canonical
    /// symbolic forms.
    #[must_use]
    pub fn parse_wire(value: &str) -> Option<Self> {
        Some(match value {
            "==" | "equal" => Self::Equal,
            "!=" | "not_equal" => Self::NotEqual,
            "<" | "less_than" => Self::LessThan,
            ">" | "greater_than" => Self::GreaterThan,
            "<=" | "less_than_or_equal" => Self::LessThanOrEqual,
            ">=" | "greater_than_or_equal" => Self::GreaterThanOrEqual,
            "contains" => Self::Contains,
            "not_contains" => Self::NotContains,
            "custom" => Self::Custom,
            _ => return None,
        })
    }

    /// The canonical wire value for this operator.
    #[must_use]
    pub fn wire_value(self) -> &'static str {
        match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::LessThan => "<",
            Self::GreaterThan => ">",
            Self::LessThanOrEqual => "<=",
            Self::GreaterThanOrEqual => ">=",
            Self::Contains => "contains",
            Self::NotContains => "not_contains",
            Self::Custom => "custom",
        }
    }
}

impl std::fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.wire_value())
    }
}

/// Connection type enum, matching the persisted `connections.type` column.
///
/// Wire values are the integers below, not the variant names.
#[pyclass(eq, eq_int)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ConnectionType {
    Github = 1,
    Aws = 2,
    Kubernetes = 3,
    Azure = 4,
    Vmware = 5,
    Gitlab = 6,
    Terraform = 7,
    Microsoft365 = 8,
    Slack = 9,
    Google = 10,
    Splunk = 11,
    Cisco = 12,
    Database = 13,
    Files = 14,
    IdentityServices = 15,
    File = 16,
}

impl ConnectionType {
    /// Parse the integer wire value stored in `connections.type`.
    #[must_use]
    pub fn from_wire(value: i32) -> Option<Self> {
        Some(match value {
            1 => Self::Github,
            2 => Self::Aws,
            3 => Self::Kubernetes,
            4 => Self::Azure,
            5 => Self::Vmware,
            6 => Self::Gitlab,
            7 => Self::Terraform,
            8 => Self::Microsoft365,
            9 => Self::Slack,
            10 => Self::Google,
            11 => Self::Splunk,
            12 => Self::Cisco,
            13 => Self::Database,
            14 => Self::Files,
            15 => Self::IdentityServices,
            16 => Self::File,
            _ => return None,
        })
    }

    /// The lowercase provider name used as the Schema Compiler's registry
    /// key (e.g. `"github"`, `"aws"`).
    #[must_use]
    pub fn provider_name(self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Aws => "aws",
            Self::Kubernetes => "kubernetes",
            Self::Azure => "azure",
            Self::Vmware => "vmware",
            Self::Gitlab => "gitlab",
            Self::Terraform => "terraform",
            Self::Microsoft365 => "microsoft_365",
            Self::Slack => "slack",
            Self::Google => "google",
            Self::Splunk => "splunk",
            Self::Cisco => "cisco",
            Self::Database => "database",
            Self::Files => "files",
            Self::IdentityServices => "identity_services",
            Self::File => "file",
        }
    }
}

/// The tri-state outcome of a per-resource [`crate::check::Check`]
/// evaluation: `Some(true)`/`Some(false)` is a logical outcome, `None` is
/// an execution failure (field missing, predicate raised).
pub type Passed = Option<bool>;

/// The three-valued aggregate outcome stored on a `ConMonResult` row.
#[pyclass(eq, eq_int)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateResult {
    Success,
    Failure,
    Partial,
}

impl std::fmt::Display for AggregateResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Partial => write!(f, "partial"),
        }
    }
}

impl AggregateResult {
    /// Derive the aggregate result from success/failure counts, per §4.5:
    /// `success` iff `failure_count = 0 ∧ success_count > 0`; `failure`
    /// iff `success_count = 0 ∧ failure_count > 0`; otherwise `partial`.
    #[must_use]
    pub fn from_counts(success_count: u64, failure_count: u64) -> Self {
        if failure_count == 0 && success_count > 0 {
            Self::Success
        } else if success_count == 0 && failure_count > 0 {
            Self::Failure
        } else {
            Self::Partial
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_wire_roundtrip() {
        for op in [
            ComparisonOperator::Equal,
            ComparisonOperator::NotEqual,
            ComparisonOperator::LessThan,
            ComparisonOperator::GreaterThan,
            ComparisonOperator::LessThanOrEqual,
            ComparisonOperator::GreaterThanOrEqual,
            ComparisonOperator::Contains,
            ComparisonOperator::NotContains,
            ComparisonOperator::Custom,
        ] {
            let wire = op.wire_value();
            assert_eq!(ComparisonOperator::parse_wire(wire), Some(op));
        }
    }

    #[test]
    fn test_operator_longform_aliases() {
        assert_eq!(
            ComparisonOperator::parse_wire("equal"),
            Some(ComparisonOperator::Equal)
        );
        assert_eq!(
            ComparisonOperator::parse_wire("not_equal"),
            Some(ComparisonOperator::NotEqual)
        );
    }

    #[test]
    fn test_operator_unknown() {
        assert_eq!(ComparisonOperator::parse_wire("frobnicate"), None);
    }

    #[test]
    fn test_connection_type_wire_roundtrip() {
        assert_eq!(ConnectionType::from_wire(1), Some(ConnectionType::Github));
        assert_eq!(ConnectionType::from_wire(16), Some(ConnectionType::File));
        assert_eq!(ConnectionType::from_wire(0), None);
        assert_eq!(ConnectionType::Github.provider_name(), "github");
    }

    #[test]
    fn test_aggregate_result_table() {
        assert_eq!(AggregateResult::from_counts(3, 0), AggregateResult::Success);
        assert_eq!(AggregateResult::from_counts(0, 3), AggregateResult::Failure);
        assert_eq!(AggregateResult::from_counts(2, 1), AggregateResult::Partial);
        assert_eq!(AggregateResult::from_counts(0, 0), AggregateResult::Partial);
    }
}
