//! Raw frame streaming over ffmpeg pipes.
//!
//! The reader decodes the source to RGB24 on ffmpeg's stdout and hands out
//! fixed-size frames in order; the writer feeds RGB24 frames into an x264
//! encode on stdin. Both kill their child process on drop so no decoder
//! lingers after a cancelled phase.

use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::debug;

use crate::error::{MediaError, MediaResult};
use crate::probe::VideoInfo;

/// One decoded RGB24 frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// 1-based frame index in source order
    pub index: u64,
    pub width: u32,
    pub height: u32,
    /// RGB24 pixel data, `width * height * 3` bytes
    pub data: Vec<u8>,
}

impl Frame {
    /// Byte length of one frame at the given dimensions.
    pub fn byte_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 3
    }
}

/// Streams decoded frames from a video file.
pub struct FrameReader {
    child: Child,
    stdout: BufReader<ChildStdout>,
    width: u32,
    height: u32,
    next_index: u64,
}

impl FrameReader {
    /// Open a video for frame-by-frame decoding.
    pub async fn open(path: &str, info: &VideoInfo) -> MediaResult<Self> {
        which::which("ffmpeg").map_err(|_| MediaError::FfmpegNotFound)?;

        let mut child = Command::new("ffmpeg")
            .args([
                "-hide_banner",
                "-v",
                "error",
                "-i",
                path,
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgb24",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MediaError::internal("frame decoder stdout not captured"))?;

        debug!(path = %path, width = info.width, height = info.height, "Opened frame reader");
        Ok(Self {
            child,
            stdout: BufReader::new(stdout),
            width: info.width,
            height: info.height,
            next_index: 1,
        })
    }

    /// Read the next frame, or `None` at end of stream.
    pub async fn next_frame(&mut self) -> MediaResult<Option<Frame>> {
        let mut data = vec![0u8; Frame::byte_len(self.width, self.height)];
        match self.stdout.read_exact(&mut data).await {
            Ok(_) => {
                let frame = Frame {
                    index: self.next_index,
                    width: self.width,
                    height: self.height,
                    data,
                };
                self.next_index += 1;
                Ok(Some(frame))
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(MediaError::Io(e)),
        }
    }

    /// Read up to `batch_size` frames. An empty vec means end of stream.
    pub async fn next_batch(&mut self, batch_size: usize) -> MediaResult<Vec<Frame>> {
        let mut frames = Vec::with_capacity(batch_size);
        while frames.len() < batch_size {
            match self.next_frame().await? {
                Some(frame) => frames.push(frame),
                None => break,
            }
        }
        Ok(frames)
    }

    /// Stop decoding and release the child process.
    pub async fn close(mut self) {
        let _ = self.child.kill().await;
    }
}

/// Encodes RGB24 frames into an H.264 container.
pub struct FrameWriter {
    child: Child,
    stdin: Option<ChildStdin>,
    frame_len: usize,
}

impl FrameWriter {
    /// Open an encoder writing to `output_path`. No audio track is carried.
    pub async fn create(output_path: &str, width: u32, height: u32, fps: f64) -> MediaResult<Self> {
        which::which("ffmpeg").map_err(|_| MediaError::FfmpegNotFound)?;

        let mut child = Command::new("ffmpeg")
            .args([
                "-hide_banner",
                "-v",
                "error",
                "-y",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgb24",
                "-s",
                &format!("{width}x{height}"),
                "-r",
                &format!("{fps}"),
                "-i",
                "pipe:0",
                "-c:v",
                "libx264",
                "-preset",
                "fast",
                "-crf",
                "23",
                "-pix_fmt",
                "yuv420p",
                "-an",
                output_path,
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| MediaError::internal("frame encoder stdin not captured"))?;

        debug!(path = %output_path, "Opened frame writer");
        Ok(Self {
            child,
            stdin: Some(stdin),
            frame_len: Frame::byte_len(width, height),
        })
    }

    /// Write one frame's RGB24 data.
    pub async fn write_frame(&mut self, data: &[u8]) -> MediaResult<()> {
        if data.len() != self.frame_len {
            return Err(MediaError::internal(format!(
                "frame size mismatch: expected {}, got {}",
                self.frame_len,
                data.len()
            )));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| MediaError::internal("frame writer already finished"))?;
        stdin.write_all(data).await?;
        Ok(())
    }

    /// Flush, close the stream and wait for the encoder to exit.
    pub async fn finish(mut self) -> MediaResult<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.flush().await?;
            drop(stdin);
        }
        let output = self.child.wait_with_output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(MediaError::ffmpeg_failed(
                "frame encoder exited with non-zero status",
                Some(String::from_utf8_lossy(&output.stderr).to_string()),
                output.status.code(),
            ))
        }
    }

    /// Abort the encode, deleting nothing.
    pub async fn abort(mut self) {
        let _ = self.child.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_byte_len() {
        assert_eq!(Frame::byte_len(1920, 1080), 1920 * 1080 * 3);
        assert_eq!(Frame::byte_len(2, 2), 12);
    }
}
