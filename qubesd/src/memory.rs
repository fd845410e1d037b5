//! Memory balancer client.
//!
//! The balancer is a separate daemon; the core only asks it to hold
//! memory for a starting domain and releases the hold once the domain
//! is up. A refusal aborts the start.

use log::debug;
use qubesd_common::{async_trait, QubesError, QubesResult};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[async_trait]
pub trait MemoryBalancer: Send + Sync {
    /// Ask for `mib` MiB on behalf of a starting domain.
    async fn request(&self, domain: &str, mib: u64) -> QubesResult<()>;

    /// Release a previously granted hold.
    async fn release(&self, domain: &str) -> QubesResult<()>;
}

/// Line protocol over the balancer's unix socket: `request <name> <mib>`
/// answered with `OK` or `DENY <reason>`, and `release <name>`.
pub struct SocketBalancer {
    socket: PathBuf,
}

impl SocketBalancer {
    pub fn new(socket: &Path) -> Self {
        Self {
            socket: socket.to_path_buf(),
        }
    }

    async fn roundtrip(&self, line: String) -> QubesResult<String> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .map_err(|e| QubesError::io(&self.socket, e))?;
        let (read, mut write) = stream.into_split();
        write
            .write_all(line.as_bytes())
            .await
            .map_err(|e| QubesError::io(&self.socket, e))?;
        write
            .shutdown()
            .await
            .map_err(|e| QubesError::io(&self.socket, e))?;

        let mut answer = String::new();
        BufReader::new(read)
            .read_line(&mut answer)
            .await
            .map_err(|e| QubesError::io(&self.socket, e))?;
        Ok(answer.trim().to_string())
    }
}

#[async_trait]
impl MemoryBalancer for SocketBalancer {
    async fn request(&self, domain: &str, mib: u64) -> QubesResult<()> {
        debug!("requesting {} MiB for {}", mib, domain);
        let answer = self.roundtrip(format!("request {} {}\n", domain, mib)).await?;
        if answer == "OK" {
            Ok(())
        } else {
            Err(QubesError::Memory {
                message: answer.strip_prefix("DENY ").unwrap_or(&answer).to_string(),
            })
        }
    }

    async fn release(&self, domain: &str) -> QubesResult<()> {
        self.roundtrip(format!("release {}\n", domain)).await?;
        Ok(())
    }
}

/// Grants everything; used when no balancer socket is configured.
pub struct NullBalancer;

#[async_trait]
impl MemoryBalancer for NullBalancer {
    async fn request(&self, _domain: &str, _mib: u64) -> QubesResult<()> {
        Ok(())
    }

    async fn release(&self, _domain: &str) -> QubesResult<()> {
        Ok(())
    }
}
