use serde::{Deserialize, Serialize};

use crate::domain::{LinkPartnerName, MessageDetails};
use crate::routing::{MalformedExpression, RoutingRule, RuleSource};

/// Request to add a routing rule to a tenant.
#[derive(Debug, Serialize, Deserialize)]
pub struct RoutingRuleRequest {
    /// Rule id, unique within the tenant
    pub id: String,

    /// Backend link the rule routes to
    pub link_name: String,

    /// Rule expression, e.g. `&(equals(ServiceName,'EPO'),equals(Action,'Form_A'))`
    pub expression: String,

    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub description: Option<String>,

    /// Store the rule so it survives a restart
    #[serde(default = "default_persist")]
    pub persist: bool,
}

fn default_persist() -> bool {
    true
}

impl RoutingRuleRequest {
    pub fn to_rule(&self) -> Result<RoutingRule, MalformedExpression> {
        let source = if self.persist {
            RuleSource::Durable
        } else {
            RuleSource::Dynamic
        };
        let rule = RoutingRule::parse(
            self.id.clone(),
            LinkPartnerName::new(self.link_name.clone()),
            &self.expression,
            source,
        )?
        .with_priority(self.priority);

        Ok(match &self.description {
            Some(description) => rule.with_description(description.clone()),
            None => rule,
        })
    }
}

/// Request to replace the default backend of a tenant.
#[derive(Debug, Serialize, Deserialize)]
pub struct DefaultBackendRequest {
    pub link_name: String,
}

/// Dry run of a rule expression, optionally against message details.
#[derive(Debug, Serialize, Deserialize)]
pub struct ValidateExpressionRequest {
    pub expression: String,

    #[serde(default)]
    pub details: Option<MessageDetails>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_request_parsing() {
        let json = r#"{
            "id": "epo",
            "link_name": "backend-epo",
            "expression": "equals(ServiceName,'EPO')",
            "priority": 5
        }"#;

        let req: RoutingRuleRequest = serde_json::from_str(json).unwrap();
        assert!(req.persist);

        let rule = req.to_rule().unwrap();
        assert_eq!(rule.id, "epo");
        assert_eq!(rule.priority, 5);
        assert_eq!(rule.source, RuleSource::Durable);
        assert_eq!(rule.link_partner_name, LinkPartnerName::new("backend-epo"));
    }

    #[test]
    fn test_malformed_expression_rejected() {
        let req = RoutingRuleRequest {
            id: "bad".to_string(),
            link_name: "backend-a".to_string(),
            expression: "equals(ServiceName".to_string(),
            priority: 0,
            description: None,
            persist: false,
        };

        assert!(req.to_rule().is_err());
    }
}
