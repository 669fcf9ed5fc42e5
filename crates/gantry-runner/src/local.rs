//! Shell runner executing scripts as local child processes.
//!
//! Each dispatch gets its own working directory under the runner root,
//! seeded with the restored cache and any staged artifacts. Script lines
//! run sequentially through `sh -c`; the first non-zero exit fails the
//! dispatch. Archives are JSON maps of relative path to file bytes, the
//! same format `collect` produces.

use gantry_core::ids::DispatchId;
use gantry_core::ports::{DispatchRequest, DispatchStatus, RunnerAgent};
use gantry_core::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, warn};

struct Dispatch {
    status: Arc<Mutex<DispatchStatus>>,
    cancel: watch::Sender<bool>,
    workdir: PathBuf,
}

pub struct LocalRunner {
    root: PathBuf,
    dispatches: RwLock<HashMap<DispatchId, Dispatch>>,
}

impl LocalRunner {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            dispatches: RwLock::new(HashMap::new()),
        })
    }

    async fn seed_workdir(workdir: &Path, request: &DispatchRequest) -> Result<()> {
        tokio::fs::create_dir_all(workdir).await?;
        if let Some(archive) = &request.cache_archive {
            unpack(workdir, archive).await?;
        }
        for archive in request.artifacts.values() {
            unpack(workdir, archive).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RunnerAgent for LocalRunner {
    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchId> {
        let id = DispatchId::new();
        let workdir = self.root.join(id.to_string());
        Self::seed_workdir(&workdir, &request).await?;

        let status = Arc::new(Mutex::new(DispatchStatus::Running));
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        debug!(dispatch = %id, job = %request.job, "dispatching shell job");

        {
            let status = Arc::clone(&status);
            let workdir = workdir.clone();
            tokio::spawn(async move {
                let end = run_script(&request, &workdir, &mut cancel_rx).await;
                *status.lock().await = end;
            });
        }

        self.dispatches.write().await.insert(
            id,
            Dispatch {
                status,
                cancel: cancel_tx,
                workdir,
            },
        );
        Ok(id)
    }

    async fn cancel(&self, dispatch: DispatchId) -> Result<()> {
        let dispatches = self.dispatches.read().await;
        let entry = dispatches
            .get(&dispatch)
            .ok_or_else(|| Error::DispatchNotFound(dispatch.to_string()))?;
        let _ = entry.cancel.send(true);
        Ok(())
    }

    async fn status(&self, dispatch: DispatchId) -> Result<DispatchStatus> {
        let dispatches = self.dispatches.read().await;
        let entry = dispatches
            .get(&dispatch)
            .ok_or_else(|| Error::DispatchNotFound(dispatch.to_string()))?;
        Ok(entry.status.lock().await.clone())
    }

    async fn collect(&self, dispatch: DispatchId, paths: &[String]) -> Result<Vec<u8>> {
        let workdir = {
            let dispatches = self.dispatches.read().await;
            dispatches
                .get(&dispatch)
                .ok_or_else(|| Error::DispatchNotFound(dispatch.to_string()))?
                .workdir
                .clone()
        };
        pack(&workdir, paths).await
    }
}

async fn run_script(
    request: &DispatchRequest,
    workdir: &Path,
    cancel: &mut watch::Receiver<bool>,
) -> DispatchStatus {
    for line in &request.script {
        let child = Command::new("sh")
            .arg("-c")
            .arg(line)
            .envs(&request.variables)
            .current_dir(workdir)
            .kill_on_drop(true)
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(err) => {
                warn!(%err, "failed to spawn shell");
                return DispatchStatus::SystemFailure {
                    message: err.to_string(),
                };
            }
        };

        tokio::select! {
            exit = child.wait() => match exit {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    return DispatchStatus::Failed {
                        exit_code: status.code().unwrap_or(-1),
                    };
                }
                Err(err) => {
                    return DispatchStatus::SystemFailure {
                        message: err.to_string(),
                    };
                }
            },
            _ = cancel.changed() => {
                let _ = child.kill().await;
                return DispatchStatus::Canceled;
            }
        }
    }
    DispatchStatus::Succeeded
}

/// Read the named paths out of a working directory into an archive.
/// Directories are walked recursively; missing paths are skipped.
async fn pack(workdir: &Path, paths: &[String]) -> Result<Vec<u8>> {
    let mut files: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    for path in paths {
        collect_path(workdir, Path::new(path), &mut files).await?;
    }
    Ok(serde_json::to_vec(&files)?)
}

async fn collect_path(
    workdir: &Path,
    relative: &Path,
    files: &mut BTreeMap<String, Vec<u8>>,
) -> Result<()> {
    let full = workdir.join(relative);
    let meta = match tokio::fs::metadata(&full).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    if meta.is_file() {
        let bytes = tokio::fs::read(&full).await?;
        files.insert(relative.to_string_lossy().into_owned(), bytes);
        return Ok(());
    }

    let mut pending = vec![relative.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(workdir.join(&dir)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let child = dir.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push(child);
            } else {
                let bytes = tokio::fs::read(entry.path()).await?;
                files.insert(child.to_string_lossy().into_owned(), bytes);
            }
        }
    }
    Ok(())
}

/// Write an archive's files into a working directory.
async fn unpack(workdir: &Path, archive: &[u8]) -> Result<()> {
    let files: BTreeMap<String, Vec<u8>> = serde_json::from_slice(archive)?;
    for (path, bytes) in files {
        let full = workdir.join(&path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(full, bytes).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::ids::{JobName, PipelineId};
    use gantry_core::ports::ExecutorKind;
    use std::time::Duration;

    fn request(script: &[&str]) -> DispatchRequest {
        DispatchRequest {
            pipeline_id: PipelineId::new(),
            job: JobName::new("unit"),
            script: script.iter().map(|s| s.to_string()).collect(),
            variables: HashMap::new(),
            executor: ExecutorKind::Shell,
            attempt: 1,
            cache_archive: None,
            artifacts: HashMap::new(),
        }
    }

    async fn runner() -> LocalRunner {
        let root = std::env::temp_dir().join(format!("gantry-runner-{}", uuid::Uuid::new_v4()));
        LocalRunner::open(root).await.unwrap()
    }

    async fn wait_terminal(runner: &LocalRunner, dispatch: DispatchId) -> DispatchStatus {
        loop {
            let status = runner.status(dispatch).await.unwrap();
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_successful_script() {
        let runner = runner().await;
        let dispatch = runner.dispatch(request(&["true", "true"])).await.unwrap();
        assert_eq!(
            wait_terminal(&runner, dispatch).await,
            DispatchStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_failing_line_reports_exit_code() {
        let runner = runner().await;
        let dispatch = runner
            .dispatch(request(&["true", "exit 3", "true"]))
            .await
            .unwrap();
        assert_eq!(
            wait_terminal(&runner, dispatch).await,
            DispatchStatus::Failed { exit_code: 3 }
        );
    }

    #[tokio::test]
    async fn test_variables_reach_the_shell() {
        let runner = runner().await;
        let mut req = request(&["test \"$GREETING\" = hello"]);
        req.variables
            .insert("GREETING".to_string(), "hello".to_string());
        let dispatch = runner.dispatch(req).await.unwrap();
        assert_eq!(
            wait_terminal(&runner, dispatch).await,
            DispatchStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_collect_written_files() {
        let runner = runner().await;
        let dispatch = runner
            .dispatch(request(&["mkdir -p out", "echo -n data > out/result.txt"]))
            .await
            .unwrap();
        wait_terminal(&runner, dispatch).await;

        let archive = runner
            .collect(dispatch, &["out".to_string()])
            .await
            .unwrap();
        let files: BTreeMap<String, Vec<u8>> = serde_json::from_slice(&archive).unwrap();
        assert_eq!(files["out/result.txt"], b"data");
    }

    #[tokio::test]
    async fn test_cancel_kills_running_script() {
        let runner = runner().await;
        let dispatch = runner.dispatch(request(&["sleep 30"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        runner.cancel(dispatch).await.unwrap();
        assert_eq!(
            wait_terminal(&runner, dispatch).await,
            DispatchStatus::Canceled
        );
    }

    #[tokio::test]
    async fn test_cache_archive_seeds_workdir() {
        let runner = runner().await;
        let seed: BTreeMap<String, Vec<u8>> =
            BTreeMap::from([("deps/lock".to_string(), b"v1".to_vec())]);
        let mut req = request(&["test \"$(cat deps/lock)\" = v1"]);
        req.cache_archive = Some(serde_json::to_vec(&seed).unwrap());

        let dispatch = runner.dispatch(req).await.unwrap();
        assert_eq!(
            wait_terminal(&runner, dispatch).await,
            DispatchStatus::Succeeded
        );
    }
}
