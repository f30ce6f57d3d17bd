pub mod context;
pub mod registry;

pub use context::BusinessDomainContext;
pub use registry::{TenantRegistry, TenantState};
