//! Backend driving the `nft` command line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use super::{Batch, Netfilter};
use crate::error::{Error, Result};

/// Applies batches with `nft -j -f -`.
///
/// `nft` loads an input file as a single transaction, so a batch either
/// commits completely or is rejected without side effects.
#[derive(Debug, Clone)]
pub struct NftCommand {
    binary: PathBuf,
}

impl NftCommand {
    pub fn new(binary: impl AsRef<Path>) -> Self {
        Self {
            binary: binary.as_ref().to_path_buf(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

impl Default for NftCommand {
    fn default() -> Self {
        Self::new("nft")
    }
}

impl Netfilter for NftCommand {
    fn commit(&self, batch: &Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let payload = serde_json::to_vec(&batch.to_json())?;

        let mut child = Command::new(&self.binary)
            .args(["-j", "-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Kernel(format!("failed to run {:?}: {}", self.binary, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload)?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Kernel(format!(
                "{} ({})",
                stderr.trim(),
                output.status
            )));
        }

        log::debug!(
            "Committed {} nftables commands to table {}",
            batch.len(),
            batch.table()
        );
        Ok(())
    }
}
