//! Database drivers for the SQL medium.

mod dialect;
mod driver;
mod pool;
mod postgres;
mod sqlite;

pub use dialect::*;
pub use driver::*;
pub use pool::*;
pub use postgres::*;
pub use sqlite::*;
