use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::LinkPartnerName;

use super::expression::{MalformedExpression, RuleExpression};

/// Where a routing rule comes from.
///
/// Within equal priority, durable rules are consulted first, then dynamic
/// rules, then the rules of the tenant configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleSource {
    /// Tenant configuration
    Env,
    /// Added at runtime, kept in memory only
    Dynamic,
    /// Added at runtime and persisted
    Durable,
}

impl RuleSource {
    /// Rank among rules of equal priority, higher first.
    pub fn rank(&self) -> u8 {
        match self {
            RuleSource::Env => 0,
            RuleSource::Dynamic => 1,
            RuleSource::Durable => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleSource::Env => "ENV",
            RuleSource::Dynamic => "DYNAMIC",
            RuleSource::Durable => "DURABLE",
        }
    }
}

impl fmt::Display for RuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A routing rule sending matching messages to a backend link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: String,
    pub link_partner_name: LinkPartnerName,
    pub match_expression: RuleExpression,
    pub source: RuleSource,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl RoutingRule {
    pub fn new(
        id: impl Into<String>,
        link_partner_name: LinkPartnerName,
        match_expression: RuleExpression,
        source: RuleSource,
    ) -> Self {
        RoutingRule {
            id: id.into(),
            link_partner_name,
            match_expression,
            source,
            priority: 0,
            description: None,
        }
    }

    /// Build a rule from DSL text.
    pub fn parse(
        id: impl Into<String>,
        link_partner_name: LinkPartnerName,
        expression: &str,
        source: RuleSource,
    ) -> Result<Self, MalformedExpression> {
        let expr = RuleExpression::parse(expression)?;
        Ok(RoutingRule::new(id, link_partner_name, expr, source))
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}
