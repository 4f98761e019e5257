//! Metadata finalize: strip everything the upload carried, stamp the fields
//! the service owns, and normalize the container for playback.

use chrono::Utc;
use tracing::info;

use crate::command::{check_ffmpeg, FfmpegCommand, FfmpegRunner};
use crate::error::MediaResult;

/// Metadata stamped onto the processed output.
#[derive(Debug, Clone)]
pub struct FinalizeMetadata {
    pub title: String,
    pub artist: String,
    pub copyright: String,
    pub date: String,
    pub description: String,
    pub comment: String,
    pub encoder: String,
}

impl FinalizeMetadata {
    /// Standard metadata for a processed video.
    pub fn for_processing(video_id: &str, user_display_name: &str) -> Self {
        Self {
            title: "Anonymized Video".to_string(),
            artist: user_display_name.to_string(),
            copyright: format!("© {} OccultaShield", Utc::now().format("%Y")),
            date: Utc::now().to_rfc3339(),
            description: "GDPR-compliant anonymized video".to_string(),
            comment: format!("Processing ID: {video_id}"),
            encoder: "OccultaShield Pipeline".to_string(),
        }
    }
}

/// Rewrite `input` into `output` with all pre-existing metadata and chapters
/// dropped and the given fields set. Forces yuv420p, faststart, CRF 23 at
/// preset fast and drops audio.
///
/// Callers treat a missing remuxer as recoverable: the pipeline still
/// succeeds with the unstripped file.
pub async fn finalize_metadata(
    input: &str,
    output: &str,
    metadata: &FinalizeMetadata,
) -> MediaResult<()> {
    check_ffmpeg()?;

    let cmd = FfmpegCommand::new(input, output)
        .output_arg("-map_metadata")
        .output_arg("-1")
        .output_arg("-map_chapters")
        .output_arg("-1")
        .metadata("title", &metadata.title)
        .metadata("artist", &metadata.artist)
        .metadata("copyright", &metadata.copyright)
        .metadata("date", &metadata.date)
        .metadata("description", &metadata.description)
        .metadata("comment", &metadata.comment)
        .metadata("encoder", &metadata.encoder)
        .video_codec("libx264")
        .crf(23)
        .preset("fast")
        .output_arg("-pix_fmt")
        .output_arg("yuv420p")
        .output_args(["-movflags", "+faststart"])
        .no_audio();

    FfmpegRunner::new().run(&cmd).await?;
    info!(output = %output, "Metadata finalize complete");
    Ok(())
}
