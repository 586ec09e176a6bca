use std::path::Path;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Replace `path` with `bytes` through a sibling temp file and an atomic rename.
///
/// Readers see either the previous content or the new content, never a mix.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;

    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);

    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err)
        }
    }
}
