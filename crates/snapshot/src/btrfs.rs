//! btrfs-backed snapshot sink
//!
//! Shells out to the `btrfs` tool: `receive` materializes the streamed
//! subvolume, `property set` flips the read-only flag, `subvolume
//! set-default` registers the boot target. The subvolume that was the
//! default when the sink was created is the currently running system and
//! is never deleted.

use async_trait::async_trait;
use sprout_errors::{Error, SnapshotError};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::SnapshotSink;

pub struct BtrfsSink {
    rootfs_dir: PathBuf,
    deployments_dir: PathBuf,
    /// Default subvolume id recorded at startup. This is the running
    /// deployment; deleting it would take the system down.
    boot_id: u64,
}

impl BtrfsSink {
    /// Create a sink rooted at the given btrfs filesystem.
    ///
    /// # Errors
    ///
    /// Fails when the default subvolume id cannot be determined, which
    /// usually means `rootfs_dir` is not a btrfs filesystem.
    pub async fn new(rootfs_dir: PathBuf, deployments_dir: PathBuf) -> Result<Self, Error> {
        let boot_id = get_default_subvolume(&rootfs_dir).await?;
        info!(boot_id, "recorded running deployment subvolume id");
        Ok(Self {
            rootfs_dir,
            deployments_dir,
            boot_id,
        })
    }

    async fn subvolume_id(&self, path: &Path) -> Result<u64, Error> {
        let output = run_btrfs(["subvolume", "show", &path.display().to_string()]).await?;
        output
            .lines()
            .find_map(|line| line.trim_start().strip_prefix("Subvolume ID:"))
            .and_then(|id| id.trim().parse::<u64>().ok())
            .ok_or_else(|| {
                SnapshotError::NotASubvolume {
                    path: path.display().to_string(),
                }
                .into()
            })
    }

    async fn delete_subvolume(&self, name: &str) -> Result<(), Error> {
        let path = self.deployments_dir.join(name);
        run_btrfs(["subvolume", "delete", &path.display().to_string()])
            .await
            .map_err(|e| {
                SnapshotError::DeleteFailed {
                    name: name.to_string(),
                    message: e.to_string(),
                }
                .into()
            })
            .map(|_| ())
    }
}

#[async_trait]
impl SnapshotSink for BtrfsSink {
    async fn receive(&self, mut stream: Box<dyn AsyncRead + Send + Unpin>) -> Result<String, Error> {
        let mut child = Command::new("btrfs")
            .arg("receive")
            .arg(&self.deployments_dir)
            .arg("-e")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SnapshotError::ReceiveFailed {
                message: format!("failed to spawn btrfs receive: {e}"),
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| SnapshotError::ReceiveFailed {
            message: "btrfs receive has no stdin".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| SnapshotError::ReceiveFailed {
            message: "btrfs receive has no stderr".to_string(),
        })?;

        let feed = async {
            let copied = tokio::io::copy(&mut stream, &mut stdin).await;
            // EOF tells btrfs receive the stream is complete; a broken pipe
            // here means receive itself failed and will report why.
            if let Err(e) = stdin.shutdown().await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    warn!(error = %e, "error closing btrfs receive stdin");
                }
            }
            drop(stdin);
            copied
        };

        let collect_stderr = async {
            let mut lines = BufReader::new(stderr).lines();
            let mut subvol_name = None;
            let mut all_lines = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(line = %line, "btrfs receive");
                if let Some(name) = parse_received_subvolume(&line) {
                    subvol_name = Some(name.to_string());
                }
                all_lines.push(line);
            }
            (subvol_name, all_lines)
        };

        let (copied, (subvol_name, stderr_lines), status) =
            tokio::join!(feed, collect_stderr, child.wait());

        let status = status.map_err(|e| SnapshotError::ReceiveFailed {
            message: format!("waiting for btrfs receive failed: {e}"),
        })?;

        if !status.success() {
            // A partially received subvolume must not linger.
            if let Some(name) = &subvol_name {
                if let Err(e) = self.delete_subvolume(name).await {
                    warn!(%name, error = %e, "failed to remove partial subvolume");
                }
            }
            return Err(SnapshotError::ReceiveFailed {
                message: format!("btrfs receive exited with {status}: {}", stderr_lines.join("; ")),
            }
            .into());
        }

        // A copy error with a successful receive should not happen, but a
        // truncated stream must not produce a usable subvolume either.
        if let Err(e) = copied {
            if let Some(name) = &subvol_name {
                let _ = self.delete_subvolume(name).await;
            }
            return Err(SnapshotError::ReceiveFailed {
                message: format!("stream ended abnormally: {e}"),
            }
            .into());
        }

        let name = subvol_name.ok_or(SnapshotError::NoSubvolumeName)?;
        info!(%name, "received subvolume");
        Ok(name)
    }

    async fn finalize(&self, name: &str) -> Result<(), Error> {
        let path = self.deployments_dir.join(name);
        let map_err = |e: Error| -> Error {
            SnapshotError::FinalizeFailed {
                name: name.to_string(),
                message: e.to_string(),
            }
            .into()
        };

        run_btrfs([
            "property",
            "set",
            "-ts",
            &path.display().to_string(),
            "ro",
            "true",
        ])
        .await
        .map_err(map_err)?;

        let id = self.subvolume_id(&path).await.map_err(map_err)?;
        run_btrfs([
            "subvolume",
            "set-default",
            &id.to_string(),
            &self.rootfs_dir.display().to_string(),
        ])
        .await
        .map_err(map_err)?;

        info!(name, id, "deployment finalized and set as boot default");
        Ok(())
    }

    async fn discard(&self, name: &str) -> Result<(), Error> {
        let path = self.deployments_dir.join(name);
        let id = self.subvolume_id(&path).await?;
        if id == self.boot_id {
            return Err(SnapshotError::DeleteFailed {
                name: name.to_string(),
                message: "refusing to delete the running deployment".to_string(),
            }
            .into());
        }
        self.delete_subvolume(name).await?;
        info!(name, "staged subvolume discarded");
        Ok(())
    }

    async fn sweep_staged(&self) -> Result<Vec<String>, Error> {
        // Anything that is neither the running deployment nor the current
        // boot default is an orphan: staged updates are not persisted
        // across restarts and can never be resumed.
        let default_id = get_default_subvolume(&self.rootfs_dir).await?;

        let mut removed = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.deployments_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Ok(id) = self.subvolume_id(&path).await else {
                continue; // plain directory, not a subvolume
            };
            if id == self.boot_id || id == default_id {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            match self.delete_subvolume(&name).await {
                Ok(()) => {
                    info!(%name, id, "swept orphaned subvolume");
                    removed.push(name);
                }
                Err(e) => warn!(%name, error = %e, "failed to sweep orphaned subvolume"),
            }
        }
        Ok(removed)
    }
}

/// `btrfs receive` announces the subvolume it creates on stderr.
fn parse_received_subvolume(line: &str) -> Option<&str> {
    line.strip_prefix("At subvol ")
        .or_else(|| line.strip_prefix("At snapshot "))
        .map(str::trim)
        .filter(|name| !name.is_empty())
}

async fn get_default_subvolume(rootfs: &Path) -> Result<u64, Error> {
    let output = run_btrfs([
        "subvolume",
        "get-default",
        &rootfs.display().to_string(),
    ])
    .await?;
    // Output shape: "ID 256 gen 123 top level 5 path deployments/current"
    output
        .split_whitespace()
        .find_map(|word| word.parse::<u64>().ok())
        .ok_or_else(|| {
            SnapshotError::CommandFailed {
                message: format!("cannot parse default subvolume from: {output}"),
            }
            .into()
        })
}

async fn run_btrfs<const N: usize>(args: [&str; N]) -> Result<String, Error> {
    let output = Command::new("btrfs")
        .args(args)
        .output()
        .await
        .map_err(|e| SnapshotError::CommandFailed {
            message: format!("failed to run btrfs: {e}"),
        })?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(SnapshotError::CommandFailed {
            message: format!(
                "btrfs {} exited with {}: {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        }
        .into())
    }
}
