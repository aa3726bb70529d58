use tokio::io::AsyncReadExt;

use crate::classify::classify;
use crate::error::Result;

/// Classify terminal output read from stdin; one JSON event per line on stdout.
pub async fn run_classify() -> Result<()> {
    let mut input = String::new();
    tokio::io::stdin().read_to_string(&mut input).await?;

    for event in classify(&input) {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}
