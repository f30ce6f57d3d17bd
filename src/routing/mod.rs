pub mod expression;
pub mod registry;
pub mod rule;

pub use expression::{ExpressionErrorKind, MalformedExpression, MessageAttribute, RuleExpression};
pub use registry::RoutingRuleRegistry;
pub use rule::{RoutingRule, RuleSource};
