//! Runs the order service.
//!
//! ```sh
//! RUST_LOG=info cargo run --example service --features service,sqlite -- --sqlite --demo-orders 5 --lookup 1,2
//! ```

use order_cache::app::OrderServiceApp;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    OrderServiceApp::run().await?;
    Ok(())
}
