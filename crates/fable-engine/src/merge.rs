//! Final merge of lip-synced clips.
//!
//! The merge step is local and deterministic: download every lip-synced
//! scene clip in order, write an ffmpeg concat list, and concatenate with
//! stream copy. No provider chain, no budget charge. Failures are retried a
//! bounded number of times by the pipeline and then fail the run with a
//! `merge` error.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use fable_models::GenerationId;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

/// Produces the run's final video from its lip-synced scene clips.
#[async_trait]
pub trait Merger: Send + Sync {
    /// Concatenate `inputs` (already in scene order) and return the public
    /// URL of the final video.
    async fn merge(&self, generation_id: &GenerationId, inputs: &[String]) -> EngineResult<String>;
}

/// Concat-demuxer merge using the system ffmpeg.
pub struct FfmpegMerger {
    work_dir: PathBuf,
    output_base_url: String,
    ffmpeg_timeout: Duration,
    http: reqwest::Client,
}

impl FfmpegMerger {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            work_dir: PathBuf::from(&config.work_dir),
            output_base_url: config.output_base_url.trim_end_matches('/').to_string(),
            ffmpeg_timeout: config.ffmpeg_timeout,
            http: reqwest::Client::new(),
        }
    }

    /// Public URL the final video of a run is served under.
    pub fn output_url(&self, generation_id: &GenerationId) -> String {
        format!("{}/{}/final.mp4", self.output_base_url, generation_id)
    }

    fn run_dir(&self, generation_id: &GenerationId) -> PathBuf {
        self.work_dir.join(generation_id.as_str())
    }

    async fn download(&self, url: &str, dest: &Path) -> EngineResult<()> {
        debug!(url = %url, dest = %dest.display(), "Downloading merge input");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| EngineError::merge(format!("Download of {url} failed: {e}")))?
            .error_for_status()
            .map_err(|e| EngineError::merge(format!("Download of {url} failed: {e}")))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| EngineError::merge(format!("Download of {url} failed: {e}")))?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(())
    }

    async fn run_ffmpeg(&self, list_path: &Path, output_path: &Path) -> EngineResult<()> {
        which::which("ffmpeg").map_err(|_| EngineError::merge("ffmpeg not found in PATH"))?;

        let mut command = tokio::process::Command::new("ffmpeg");
        command
            .args(["-y", "-f", "concat", "-safe", "0", "-i"])
            .arg(list_path)
            .args(["-c", "copy"])
            .arg(output_path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.ffmpeg_timeout, command.output())
            .await
            .map_err(|_| {
                EngineError::merge(format!(
                    "ffmpeg timed out after {:?}",
                    self.ffmpeg_timeout
                ))
            })??;

        if !output.status.success() {
            return Err(EngineError::merge(format!(
                "ffmpeg concat failed ({}): {}",
                output.status,
                stderr_tail(&output.stderr)
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl Merger for FfmpegMerger {
    async fn merge(&self, generation_id: &GenerationId, inputs: &[String]) -> EngineResult<String> {
        if inputs.is_empty() {
            return Err(EngineError::merge("No clips to merge"));
        }

        let run_dir = self.run_dir(generation_id);
        tokio::fs::create_dir_all(&run_dir).await?;

        let mut clip_paths = Vec::with_capacity(inputs.len());
        for (index, url) in inputs.iter().enumerate() {
            let dest = run_dir.join(format!("scene_{index:03}.mp4"));
            self.download(url, &dest).await?;
            clip_paths.push(dest);
        }

        let list_path = run_dir.join("concat.txt");
        tokio::fs::write(&list_path, build_concat_list(&clip_paths)).await?;

        let output_path = run_dir.join("final.mp4");
        let result = self.run_ffmpeg(&list_path, &output_path).await;

        let _ = tokio::fs::remove_file(&list_path).await;
        result?;

        // The downloads served their purpose; only final.mp4 stays
        for clip in &clip_paths {
            let _ = tokio::fs::remove_file(clip).await;
        }

        info!(
            generation_id = %generation_id,
            clips = inputs.len(),
            output = %output_path.display(),
            "Merged final video"
        );
        Ok(self.output_url(generation_id))
    }
}

/// Concat-demuxer list: one `file '...'` line per clip, in order.
fn build_concat_list(paths: &[PathBuf]) -> String {
    let mut list = String::new();
    for path in paths {
        list.push_str(&format!("file '{}'\n", path.display()));
    }
    list
}

/// Last chunk of ffmpeg's stderr; the failure reason prints at the end.
fn stderr_tail(stderr: &[u8]) -> String {
    const TAIL_CHARS: usize = 800;
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    match trimmed.char_indices().nth_back(TAIL_CHARS) {
        Some((cut, _)) => format!("...{}", &trimmed[cut..]),
        None => trimmed.to_string(),
    }
}
