use std::{path::{Path, PathBuf}, time::Duration};

use anyhow::{Context, Result, ensure};
use futures::StreamExt;
use humansize::{DECIMAL, format_size};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, info, instrument};

const APK_FILE_NAME: &str = "app.apk";
const PARTIAL_SUFFIX: &str = "part";

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(crate::USER_AGENT)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to build HTTP client")
}

/// Downloads the APK at `url` into `dest_dir` and returns the path of the saved file.
///
/// The body is streamed to `app.apk.part`, which replaces `app.apk` only once complete.
#[instrument(skip(client), fields(dest_dir = %dest_dir.display()), err)]
pub async fn download_apk(client: &reqwest::Client, url: &str, dest_dir: &Path) -> Result<PathBuf> {
    let url = url.trim();
    ensure!(!url.is_empty(), "APK download URL is not configured");
    ensure!(is_http_url(url), "APK download URL must be http(s): '{url}'");

    fs::create_dir_all(dest_dir)
        .await
        .with_context(|| format!("Failed to create {}", dest_dir.display()))?;
    let dst = dest_dir.join(APK_FILE_NAME);
    let tmp = dst.with_extension(format!("apk.{PARTIAL_SUFFIX}"));

    let resp = client.get(url).send().await.context("Download request failed")?;
    let resp = resp.error_for_status().context("Server returned an error")?;
    let total = resp.content_length();
    debug!(?total, "Downloading APK");

    let mut file = fs::File::create(&tmp)
        .await
        .with_context(|| format!("Failed to create {}", tmp.display()))?;
    let mut downloaded: u64 = 0;
    let mut stream = resp.bytes_stream();
    while let Some(item) = stream.next().await {
        let chunk = item.context("Download interrupted")?;
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);

    ensure!(downloaded > 0, "Downloaded APK is empty");
    fs::rename(&tmp, &dst).await.with_context(|| format!("Failed to replace {}", dst.display()))?;
    info!(path = %dst.display(), size = %format_size(downloaded, DECIMAL), "APK downloaded");
    Ok(dst)
}
