//! The field-mapping rule store boundary (spec §1 "out of scope", §6 "Rule
//! read interface").
//!
//! Treated as a read-only lookup with change events; CRUD on rules lives
//! entirely outside this crate's scope.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Direction for [`RuleReadService::normalize_symbol`]. Spec.md's open
/// questions call out that a literal `"standard"` sentinel provider name is
/// a historical footgun — this enum makes the direction explicit instead of
/// accepting a magic provider string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormalizeDirection {
    /// Provider form -> standard form (used by the pipeline, spec §4.4 step 1).
    ToStandard,
    /// Standard form -> provider form (used when issuing subscribe/unsubscribe
    /// calls against the capability handle).
    ToProvider,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldOp {
    Multiply,
    Divide,
    Add,
    Subtract,
    Format,
    /// Disabled per spec.md §4.4: "custom-disabled" — present in the
    /// taxonomy but never executed.
    CustomDisabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source_field: String,
    pub target_field: String,
    pub op: FieldOp,
    /// Operand for `multiply`/`divide`/`add`/`subtract`; a format string for
    /// `format`; unused for `custom_disabled`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operand: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub provider: String,
    pub category: String,
    pub fields: Vec<FieldMapping>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleChangeEvent {
    pub provider: String,
    pub category: String,
}

/// Read-only rule lookup plus change notification (component B, spec §2).
#[async_trait]
pub trait RuleReadService: Send + Sync {
    async fn find_rule_for(&self, provider: &str, category: &str) -> Option<Rule>;
    async fn normalize_symbol(
        &self,
        form: &str,
        provider: &str,
        direction: NormalizeDirection,
    ) -> Option<String>;
    /// New rule-set versions and symbol-table updates are announced here so
    /// the pipeline can evict its local rule cache (spec §6).
    fn subscribe_changes(&self) -> broadcast::Receiver<RuleChangeEvent>;
}
