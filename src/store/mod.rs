//! Record store over a remote table.
//!
//! - [`TableStore`]: the external table contract (conditional put/update, atomic add, scan)
//! - [`MemoryTable`]: in-process implementation of that contract
//! - [`Database`]: typed CRUD with throttling retries, CAS and counters
//! - [`Filter`]: serializable scan predicates

mod database;
mod filter;
mod memory;
mod record;
mod table;

pub use database::Database;
pub use filter::{values_equal, Filter};
pub use memory::MemoryTable;
pub use record::{now_micros, Attributes, Key, Record};
pub use table::{Condition, ScanPage, TableError, TableStore, Update};
