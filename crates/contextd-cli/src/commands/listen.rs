//! `ctx listen` - interactive subscriber shell.

use std::path::Path;

use anyhow::{Context, Result};

use crate::client::BrokerConnection;

/// Runs the subscriber shell: subscribe to `keys`, then feed stdin lines
/// to the broker and print every push and reply.
pub fn run(socket_path: &Path, keys: &[String]) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(async {
        let mut connection = BrokerConnection::connect(socket_path).await?;

        // Test harnesses wait for this banner before sending commands.
        println!("Available commands:");
        println!("  new <key>        subscribe to a property");
        println!("  del <key>        drop a subscription");
        println!("  v <key>          print the current value");
        println!("  providers <key>  print the owner of a property");

        for key in keys {
            connection.send(&format!("new {key}")).await?;
        }

        connection.bridge().await
    })
}
