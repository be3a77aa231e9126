use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use futures_util::StreamExt;
use rand::{Rng, distr::Alphanumeric};
use tokio::{fs, io::AsyncWriteExt, sync::Semaphore, task::JoinSet};
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    fod::connection::Connection,
    types::DownloadTask,
};

pub const DEFAULT_CONCURRENCY: usize = 4;

/// Streams scan artifacts to disk.
///
/// Bytes are written to a hidden `.part` file next to the destination and
/// renamed over it only after the whole body arrived, so a failed download
/// never leaves a partial file at the destination. Every call has its own
/// temp file and its own retry budget; any number of calls may run at once
/// against the same connection.
#[derive(Clone)]
pub struct DownloadCoordinator {
    conn: Connection,
}

impl DownloadCoordinator {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Downloads one artifact to `task.destination`, replacing any existing file.
    ///
    /// # Errors
    ///
    /// [`Error::Download`] naming the task and wrapping the cause (transport,
    /// status, rate-limit exhaustion or file system).
    pub async fn download(&self, task: &DownloadTask) -> Result<u64> {
        let path = format!("releases/{}/fpr", task.release_id);
        let params = [("scanType".to_string(), task.kind.as_str().to_string())];

        debug!(target = %task.target(), "requesting artifact");
        let result = match self.conn.get_stream(&path, &params).await {
            Ok(res) => save_to(res, &task.destination).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(bytes) => {
                info!(target = %task.target(), bytes, "artifact saved");
                Ok(bytes)
            }
            Err(e) => {
                warn!(target = %task.target(), error = %e, "artifact download failed");
                Err(Error::download(task.target(), e))
            }
        }
    }

    /// Runs `tasks` with at most `concurrency` downloads in flight.
    ///
    /// Returns one result per task, in task order. A failing task does not
    /// affect the others. `on_done` is called as each task finishes. A
    /// `concurrency` of 0 means [`DEFAULT_CONCURRENCY`].
    pub async fn download_all<F>(
        &self,
        tasks: Vec<DownloadTask>,
        concurrency: usize,
        mut on_done: F,
    ) -> Vec<Result<u64>>
    where
        F: FnMut(&DownloadTask, &Result<u64>),
    {
        let concurrency = match concurrency {
            0 => DEFAULT_CONCURRENCY,
            n => n,
        };
        let permits = Arc::new(Semaphore::new(concurrency));
        let mut set = JoinSet::new();

        for (index, task) in tasks.iter().cloned().enumerate() {
            let coordinator = self.clone();
            let permits = Arc::clone(&permits);
            set.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => coordinator.download(&task).await,
                    Err(e) => Err(Error::download(
                        task.target(),
                        Error::Configuration(format!("worker pool closed: {e}")),
                    )),
                };
                (index, result)
            });
        }

        let mut results: Vec<Option<Result<u64>>> = tasks.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => {
                    on_done(&tasks[index], &result);
                    results[index] = Some(result);
                }
                Err(e) => warn!(error = %e, "download worker panicked"),
            }
        }

        results
            .into_iter()
            .zip(&tasks)
            .map(|(result, task)| {
                result.unwrap_or_else(|| {
                    Err(Error::download(
                        task.target(),
                        Error::Configuration("download worker did not complete".into()),
                    ))
                })
            })
            .collect()
    }
}

/// Streams `res` into a temp file next to `destination` and renames it over
/// the destination once complete.
async fn save_to(res: reqwest::Response, destination: &Path) -> Result<u64> {
    let tmp = temp_path_for(destination)?;
    match write_stream(res, &tmp).await {
        Ok(bytes) => {
            if let Err(e) = fs::rename(&tmp, destination).await {
                let _ = fs::remove_file(&tmp).await;
                return Err(e.into());
            }
            Ok(bytes)
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp).await;
            Err(e)
        }
    }
}

async fn write_stream(res: reqwest::Response, tmp: &Path) -> Result<u64> {
    let mut file = fs::File::create(tmp).await?;
    let mut stream = res.bytes_stream();
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

/// Hidden sibling of `destination`, unique per call.
fn temp_path_for(destination: &Path) -> Result<PathBuf> {
    let file_name = destination
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            Error::Configuration(format!(
                "destination {} has no file name",
                destination.display()
            ))
        })?;

    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();

    Ok(destination.with_file_name(format!(".{file_name}.{suffix}.part")))
}
