//! Record persistence.
//!
//! Writes are appended to a checksummed log and applied to an in-memory
//! table that always holds the latest version of every live record.

mod log;
mod table;

pub use log::{LogEntry, RecordLog};
pub use table::RecordTable;
