//! Guest data bus client.
//!
//! Keys written at domain start (`/qubes-ip`, `/qubes-service/<name>`, …)
//! travel through this trait; the production implementation shells out to
//! the qubesdb command line tools, tests use the recording mock.

use log::debug;
use qubesd_common::{async_trait, QubesError, QubesResult};
use tokio::process::Command;

#[async_trait]
pub trait QubesDb: Send + Sync {
    async fn write(&self, domain: &str, key: &str, value: &str) -> QubesResult<()>;

    async fn remove(&self, domain: &str, key: &str) -> QubesResult<()>;

    /// Drop every key of the domain. Used on shutdown.
    async fn remove_all(&self, domain: &str) -> QubesResult<()>;
}

/// Talks to the qubesdb daemon through its command line tools.
pub struct CommandQubesDb;

impl CommandQubesDb {
    async fn run(&self, program: &str, args: &[&str]) -> QubesResult<()> {
        debug!("qubesdb: {} {}", program, args.join(" "));
        let status = Command::new(program)
            .args(args)
            .status()
            .await
            .map_err(|e| QubesError::io(program, e))?;
        if !status.success() {
            return Err(QubesError::internal(format!(
                "{} exited with {}",
                program, status
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl QubesDb for CommandQubesDb {
    async fn write(&self, domain: &str, key: &str, value: &str) -> QubesResult<()> {
        self.run("qubesdb-write", &["-d", domain, key, value]).await
    }

    async fn remove(&self, domain: &str, key: &str) -> QubesResult<()> {
        self.run("qubesdb-rm", &["-d", domain, key]).await
    }

    async fn remove_all(&self, domain: &str) -> QubesResult<()> {
        self.run("qubesdb-rm", &["-d", domain, "/"]).await
    }
}

/// Discards everything; used in offline mode.
pub struct NullQubesDb;

#[async_trait]
impl QubesDb for NullQubesDb {
    async fn write(&self, _domain: &str, _key: &str, _value: &str) -> QubesResult<()> {
        Ok(())
    }

    async fn remove(&self, _domain: &str, _key: &str) -> QubesResult<()> {
        Ok(())
    }

    async fn remove_all(&self, _domain: &str) -> QubesResult<()> {
        Ok(())
    }
}
