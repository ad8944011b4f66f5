// Binary entry point for burrow
// This is a thin wrapper that delegates to the library implementation

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = burrow::shell::run().await {
        eprintln!("burrow fatal error: {:#}", e);
        return Err(e);
    }
    Ok(())
}
