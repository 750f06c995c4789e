pub mod cache_log;
pub mod item;
pub mod order;
pub mod order_item;
pub mod payment;
