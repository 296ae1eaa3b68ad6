//! QueryKit SQLite - driver and dialect for running querykit queries on SQLite.
//!
//! ```no_run
//! use querykit_core::{Bindings, Expr, Lambda, Mapping};
//! use querykit_sqlite::{open_provider, SqliteConfig};
//!
//! # fn main() -> querykit_core::Result<()> {
//! let provider = open_provider(SqliteConfig::new("northwind.db3"), Mapping::new());
//! let london = Expr::table("Customer")
//!     .filter(Lambda::new("c", Expr::param("c").member("City").equals("London")));
//! let customers = provider.execute(&london, &Bindings::new())?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod driver;
pub mod language;
pub mod schema;

use querykit_core::{EntityProvider, QueryMapping};

pub use config::SqliteConfig;
pub use driver::SqliteDriver;
pub use language::SqliteLanguage;
pub use schema::create_table;

/// Build a provider over the configured database.
pub fn open_provider(
    config: SqliteConfig,
    mapping: impl QueryMapping + 'static,
) -> EntityProvider<SqliteDriver> {
    let language = if config.native_offset {
        SqliteLanguage::new()
    } else {
        SqliteLanguage::with_emulated_offset()
    };
    EntityProvider::new(SqliteDriver::new(config), mapping, language)
}
