//! keycustody - service entry point
//!
//! All the heavy lifting is done in lib.rs.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    keycustody::run().await
}
