pub mod memory;
pub mod postgres;
pub mod traits;
pub mod unit_of_work;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use traits::{MessageErrorRecord, Storage};
pub use unit_of_work::{StagedWrites, UnitOfWork};
