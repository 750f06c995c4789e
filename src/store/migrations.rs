pub mod cache_log;
pub mod item;
pub mod order;
pub mod order_item;
pub mod payment;

use sea_orm_migration::prelude::*;

pub struct Migrator;

impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        // Referenced tables go first.
        vec![
            Box::new(item::Migration),
            Box::new(payment::Migration),
            Box::new(order::Migration),
            Box::new(order_item::Migration),
            Box::new(cache_log::Migration),
        ]
    }
}
