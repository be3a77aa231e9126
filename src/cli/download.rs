use std::{path::Path, time::Duration};

use indicatif::{ProgressBar, ProgressStyle};
use rand::{Rng, distr::Alphanumeric};

use crate::{
    error::{Error, Result},
    fod::{Connection, DownloadCoordinator},
    header, info, success,
    types::{ArtifactKind, DownloadTask},
    warning,
};

use super::target_release_id;

/// Downloads the FPR of the target release `count` times, `threads` at once.
///
/// Firing many identical requests in parallel is the quickest way to run into
/// the server's rate limit, so this doubles as a check of the retry handling.
pub async fn download(
    conn: &Connection,
    kind: ArtifactKind,
    count: usize,
    threads: usize,
    output_dir: &Path,
    keep: bool,
) -> Result<()> {
    let release_id = target_release_id(conn)?;
    tokio::fs::create_dir_all(output_dir).await?;

    header!("Download {kind} FPR of release {release_id} {count} times, {threads} at once");
    let tasks: Vec<DownloadTask> = (0..count)
        .map(|_| DownloadTask::new(&release_id, kind, output_dir.join(random_file_name())))
        .collect();

    let pb = ProgressBar::new(tasks.len() as u64);
    pb.enable_steady_tick(Duration::from_millis(100));
    if let Ok(style) = ProgressStyle::with_template("{spinner:.blue} [{bar:30}] {pos}/{len} {msg}")
    {
        pb.set_style(style.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));
    }
    pb.set_message("downloading...");

    let results = DownloadCoordinator::new(conn.clone())
        .download_all(tasks.clone(), threads, |_, _| pb.inc(1))
        .await;
    pb.finish_and_clear();

    let mut failed = 0;
    let mut first_error: Option<Error> = None;
    for (task, result) in tasks.iter().zip(results) {
        match result {
            Ok(bytes) => info!("{} ({bytes} bytes)", task.destination.display()),
            Err(e) => {
                failed += 1;
                warning!("{e}");
                first_error.get_or_insert(e);
            }
        }
        if !keep {
            let _ = tokio::fs::remove_file(&task.destination).await;
        }
    }

    if let Some(e) = first_error {
        warning!("{failed} of {count} downloads failed");
        return Err(e);
    }

    success!("All {count} downloads completed");
    Ok(())
}

fn random_file_name() -> String {
    let name: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("{name}.fpr")
}
