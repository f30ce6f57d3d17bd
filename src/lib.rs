pub mod api;
pub mod config;
pub mod connector;
pub mod domain;
pub mod error;
pub mod evidence;
pub mod link;
pub mod observability;
pub mod processor;
pub mod queue;
pub mod routing;
pub mod storage;
pub mod tenant;
pub mod transport;

pub use config::{ConnectorConfig, Settings};
pub use connector::Connector;
pub use domain::{BusinessDomainId, EvidenceType, Message, MessageDirection};
pub use error::{ConnectorError, Result};
pub use routing::{RoutingRule, RuleExpression};
