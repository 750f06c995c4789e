//! Record Store implementations: [`DbStore`] over a relational database via sea-orm, and [`MemoryStore`] for
//! running without one.

pub mod db;
pub mod driver;
pub mod entity;
pub mod memory;
pub mod migrations;

pub use db::DbStore;
pub use driver::DatabaseDriver;
pub use memory::MemoryStore;
pub use migrations::Migrator;
