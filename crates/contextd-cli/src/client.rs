//! Line-oriented broker connection and the interactive bridge loop.

use std::path::Path;

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, LinesCodec};

/// One line-delimited connection to a broker socket.
pub struct BrokerConnection {
    lines: FramedRead<OwnedReadHalf, LinesCodec>,
    write: OwnedWriteHalf,
}

impl BrokerConnection {
    /// Connects to the broker socket at `path`.
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("failed to connect to broker socket {}", path.display()))?;
        let (read, write) = stream.into_split();
        Ok(Self {
            lines: FramedRead::new(read, LinesCodec::new()),
            write,
        })
    }

    /// Sends one newline-terminated protocol line.
    pub async fn send(&mut self, line: &str) -> Result<()> {
        self.write
            .write_all(format!("{line}\n").as_bytes())
            .await
            .context("failed to write to broker socket")
    }

    /// Bridges stdin lines to the socket and socket lines to stdout.
    ///
    /// Runs until the broker closes the connection. Stdin running dry does
    /// not end the bridge: a piped-in script may finish while pushes keep
    /// arriving, and a provider keeps serving its declared keys until the
    /// process is killed.
    pub async fn bridge(mut self) -> Result<()> {
        let mut stdin = FramedRead::new(tokio::io::stdin(), LinesCodec::new());
        let mut stdin_open = true;
        loop {
            tokio::select! {
                line = stdin.next(), if stdin_open => match line {
                    Some(line) => {
                        let line = line.context("failed to read stdin")?;
                        if !line.trim().is_empty() {
                            self.send(&line).await?;
                        }
                    },
                    None => stdin_open = false,
                },
                line = self.lines.next() => match line {
                    Some(line) => println!("{}", line.context("failed to read from broker")?),
                    None => bail!("broker closed the connection"),
                },
            }
        }
    }
}
