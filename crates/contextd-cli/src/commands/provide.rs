//! `ctx provide` - interactive provider shell.

use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::client::BrokerConnection;

/// Runs the provider shell: announce `session`, optionally declare one
/// key, then feed stdin lines (`add <type> <key> <value>`, `<key>=<value>`,
/// `unset <key>`) to the broker and print any `error:` replies.
///
/// Killing the shell disconnects the provider, which undefines every key
/// it declared.
pub fn run(socket_path: &Path, session: &str, initial: &[String]) -> Result<()> {
    let declare = match initial {
        [] => None,
        [key_type, key, value] => Some(format!("add {key_type} {key} {value}")),
        _ => bail!("initial declaration takes exactly TYPE KEY VALUE"),
    };

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(async {
        let mut connection = BrokerConnection::connect(socket_path).await?;
        connection.send(&format!("provider {session}")).await?;
        if let Some(declare) = &declare {
            connection.send(declare).await?;
        }
        connection.bridge().await
    })
}
