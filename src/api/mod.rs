//! Admin HTTP API: routing rule management, message submission and
//! transport status reports of pull-style link partners.

pub mod request;
pub mod response;
pub mod routes;

pub use routes::{create_router, AppState};
