//! File-playback fallback: one-shot µ-law playback via ARI.
//!
//! When streaming cannot proceed (producer timeout, transport failure,
//! keepalive timeout), the remaining audio is written as a raw µ-law file
//! into a media directory Asterisk can read, played with the `sound:` URI,
//! and deleted on `PlaybackFinished` or after a bounded grace.

use std::path::{Path, PathBuf};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;

use crate::ari::AriClient;
use crate::error::ErrorCode;
use crate::session::epoch_ms;

/// How long an orphaned fallback file may linger before deletion.
const ORPHAN_GRACE: Duration = Duration::from_secs(60);

/// One fallback playback in flight.
#[derive(Debug, Clone)]
pub struct PlaybackRef {
    pub playback_id: String,
    pub call_id: String,
    pub started_at_ms: u64,
    /// What triggered this playback (e.g. "streaming-fallback").
    pub source: String,
    pub file_path: PathBuf,
}

/// Classified fallback failures.
#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("Media directory not writable: {0}")]
    Permission(std::io::Error),

    #[error("Media path missing: {0}")]
    NotFound(String),

    #[error("ARI playback failed: {0}")]
    Ari(#[from] crate::error::AriError),

    #[error("Playback timed out")]
    Timeout,
}

impl ErrorCode for FallbackError {
    fn code(&self) -> &'static str {
        match self {
            Self::Permission(_) => "media_dir_permission",
            Self::NotFound(_) => "media_path_not_found",
            Self::Ari(_) => "ari_playback_error",
            Self::Timeout => "playback_timeout",
        }
    }
}

/// Writes µ-law files and drives ARI file playback for them.
pub struct FallbackPlaybackManager {
    ari: AriClient,
    media_dir: PathBuf,
    /// playback_id → ref, resolved on PlaybackFinished.
    active: DashMap<String, PlaybackRef>,
}

impl FallbackPlaybackManager {
    pub fn new(ari: AriClient, media_dir: impl Into<PathBuf>) -> Self {
        Self {
            ari,
            media_dir: media_dir.into(),
            active: DashMap::new(),
        }
    }

    /// Plays a µ-law@8k buffer to the caller via file playback.
    ///
    /// Returns the playback id, or an error classified per the fallback
    /// taxonomy. The written file is deleted when `PlaybackFinished`
    /// arrives, or by the orphan sweeper after [`ORPHAN_GRACE`].
    pub async fn play_audio(
        &self,
        call_id: &str,
        channel_id: &str,
        mulaw_8k: &[u8],
        source: &str,
    ) -> Result<String, FallbackError> {
        if mulaw_8k.is_empty() {
            return Err(FallbackError::NotFound("empty audio buffer".into()));
        }

        let file_name = format!("{source}-{call_id}-{}.ulaw", epoch_ms());
        let file_path = self.media_dir.join(&file_name);
        tokio::fs::create_dir_all(&self.media_dir)
            .await
            .map_err(FallbackError::Permission)?;
        tokio::fs::write(&file_path, mulaw_8k)
            .await
            .map_err(FallbackError::Permission)?;

        // Asterisk resolves `sound:` URIs without the extension.
        let media_uri = format!(
            "sound:{}",
            self.media_dir
                .join(file_name.trim_end_matches(".ulaw"))
                .display()
        );
        let playback_id = match self.ari.play_media(channel_id, &media_uri).await {
            Ok(id) => id,
            Err(e) => {
                let _ = tokio::fs::remove_file(&file_path).await;
                return Err(FallbackError::Ari(e));
            }
        };

        log::info!(
            "[Fallback] File playback started: call={call_id}, playback={playback_id}, bytes={}, source={source}",
            mulaw_8k.len()
        );
        self.active.insert(
            playback_id.clone(),
            PlaybackRef {
                playback_id: playback_id.clone(),
                call_id: call_id.to_string(),
                started_at_ms: epoch_ms(),
                source: source.to_string(),
                file_path,
            },
        );
        Ok(playback_id)
    }

    /// Resolves a `PlaybackFinished` event: deletes the media file.
    pub async fn on_playback_finished(&self, playback_id: &str) -> Option<PlaybackRef> {
        let (_, playback) = self.active.remove(playback_id)?;
        remove_file_logged(&playback.file_path).await;
        log::debug!(
            "[Fallback] Playback finished: call={}, playback={playback_id}",
            playback.call_id
        );
        Some(playback)
    }

    /// Deletes files for playbacks that never reported finished.
    pub async fn sweep_orphans(&self) -> usize {
        let now = epoch_ms();
        let expired: Vec<String> = self
            .active
            .iter()
            .filter(|entry| now.saturating_sub(entry.started_at_ms) > ORPHAN_GRACE.as_millis() as u64)
            .map(|entry| entry.key().clone())
            .collect();
        let count = expired.len();
        for playback_id in expired {
            if let Some((_, playback)) = self.active.remove(&playback_id) {
                log::warn!(
                    "[Fallback] Orphaned playback swept: call={}, playback={playback_id}",
                    playback.call_id
                );
                remove_file_logged(&playback.file_path).await;
            }
        }
        count
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

async fn remove_file_logged(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        log::debug!("[Fallback] Media file delete failed: {}: {e}", path.display());
    }
}
