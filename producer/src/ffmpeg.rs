use image::{imageops, RgbImage};
use serde::Deserialize;
use slide_sieve_common::frame::Frame;
use std::collections::HashMap;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use tracing::{debug, info, warn};

use crate::{FrameSource, SourceError};

/// Video file source backed by an `ffmpeg` child process.
///
/// The child decodes the first video stream to packed `rgb24` on stdout;
/// each call to [`FrameSource::next_frame`] reads exactly one frame's worth
/// of bytes. Geometry, display rotation and the frame-count hint come from
/// `ffprobe`.
///
/// ffmpeg's own autorotation is disabled so the pipe always carries coded
/// geometry; frames are turned upright here.
pub struct FfmpegSource {
    child: Child,
    stdout: ChildStdout,
    path: PathBuf,
    width: u32,
    height: u32,
    rotation: u32,
    total_frames: Option<u64>,
    next_index: u64,
}

/// Stream geometry as reported by `ffprobe -of json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// Coded width, before rotation.
    pub width: u32,
    /// Coded height, before rotation.
    pub height: u32,
    /// Clockwise display rotation in degrees: 0, 90, 180 or 270.
    pub rotation: u32,
    pub total_frames: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    nb_frames: Option<String>,
    /// Older containers carry `rotate` as a clockwise angle string.
    #[serde(default)]
    tags: HashMap<String, String>,
    /// Newer ffprobe reports a display matrix with a counter-clockwise angle.
    #[serde(default)]
    side_data_list: Vec<ProbeSideData>,
}

#[derive(Debug, Deserialize)]
struct ProbeSideData {
    rotation: Option<f64>,
}

impl ProbeStream {
    fn rotation(&self) -> u32 {
        let clockwise = self
            .side_data_list
            .iter()
            .find_map(|side| side.rotation)
            .map(|ccw| -ccw)
            .or_else(|| {
                self.tags
                    .get("rotate")
                    .and_then(|r| r.trim().parse::<f64>().ok())
            })
            .unwrap_or(0.0);
        quarter_turns(clockwise) * 90
    }
}

/// Nearest whole number of clockwise quarter turns, in `0..4`.
fn quarter_turns(degrees: f64) -> u32 {
    ((degrees / 90.0).round() as i64).rem_euclid(4) as u32
}

/// Turn a coded frame upright.
fn rotate(image: RgbImage, rotation: u32) -> RgbImage {
    match rotation {
        90 => imageops::rotate90(&image),
        180 => imageops::rotate180(&image),
        270 => imageops::rotate270(&image),
        _ => image,
    }
}

impl FfmpegSource {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        if !path.exists() {
            return Err(SourceError::NotFound(path.display().to_string()));
        }

        let info = probe(path)?;
        let path_str = path
            .to_str()
            .ok_or_else(|| SourceError::Probe(format!("non UTF-8 path {}", path.display())))?;

        let mut child = Command::new("ffmpeg")
            .args([
                "-v", "error",
                "-nostdin",
                "-noautorotate",
                "-i", path_str,
                "-map", "0:v:0",
                "-f", "rawvideo",
                "-pix_fmt", "rgb24",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SourceError::Spawn(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::Spawn("could not get stdout handle".into()))?;

        info!(
            path = %path.display(),
            width = info.width,
            height = info.height,
            rotation = info.rotation,
            total_frames = ?info.total_frames,
            "ffmpeg decoder started"
        );

        Ok(Self {
            child,
            stdout,
            path: path.to_path_buf(),
            width: info.width,
            height: info.height,
            rotation: info.rotation,
            total_frames: info.total_frames,
            next_index: 0,
        })
    }

    fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

impl FrameSource for FfmpegSource {
    fn total_frames(&self) -> Option<u64> {
        self.total_frames
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let expected = self.frame_len();
        let mut buf = vec![0u8; expected];
        let got = fill(&mut self.stdout, &mut buf)?;

        if got == 0 {
            debug!(path = %self.path.display(), frames = self.next_index, "decoder reached end of stream");
            return Ok(None);
        }
        if got < expected {
            return Err(SourceError::Truncated { got, expected });
        }

        let index = self.next_index;
        self.next_index += 1;
        let frame = Frame::from_rgb24(index, self.width, self.height, buf).map_err(|e| {
            SourceError::Decode {
                index,
                reason: e.to_string(),
            }
        })?;
        Ok(Some(Frame::new(index, rotate(frame.image, self.rotation))))
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        // The child may still be decoding if the run stopped early.
        if let Err(e) = self.child.kill() {
            if e.kind() != ErrorKind::InvalidInput {
                debug!(error = %e, "failed to kill ffmpeg decoder");
            }
        }
        let _ = self.child.wait();
        debug!(path = %self.path.display(), "ffmpeg decoder released");
    }
}

/// Read until `buf` is full or the stream ends. Returns the number of bytes read.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize, SourceError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(SourceError::Read(e.to_string())),
        }
    }
    Ok(filled)
}

/// Query stream geometry, rotation and the frame-count hint with `ffprobe`.
pub fn probe(path: &Path) -> Result<StreamInfo, SourceError> {
    let output = Command::new("ffprobe")
        .args(["-v", "error", "-select_streams", "v:0"])
        .args(["-show_streams", "-of", "json"])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| SourceError::Spawn(format!("ffprobe: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SourceError::Probe(stderr.trim().to_string()));
    }

    parse_probe(&output.stdout, path)
}

fn parse_probe(json: &[u8], path: &Path) -> Result<StreamInfo, SourceError> {
    let parsed: ProbeOutput =
        serde_json::from_slice(json).map_err(|e| SourceError::Probe(e.to_string()))?;

    let stream = parsed
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| SourceError::NoVideoStream(path.display().to_string()))?;

    match (stream.width, stream.height) {
        (Some(width), Some(height)) if width > 0 && height > 0 => Ok(StreamInfo {
            width,
            height,
            rotation: stream.rotation(),
            total_frames: stream
                .nb_frames
                .as_deref()
                .and_then(|n| n.parse::<u64>().ok())
                .filter(|&n| n > 0),
        }),
        _ => Err(SourceError::NoVideoStream(path.display().to_string())),
    }
}

/// Check whether ffmpeg and ffprobe are available on PATH. Logs a warning if not.
pub fn check_ffmpeg_available() -> bool {
    let mut available = true;
    for tool in ["ffmpeg", "ffprobe"] {
        match Command::new(tool).arg("-version").output() {
            Ok(out) if out.status.success() => {
                debug!(tool, "decoder tool is available");
            }
            Ok(_) => {
                warn!(tool, "tool returned non-zero for -version; video decoding may fail");
                available = false;
            }
            Err(e) => {
                warn!(
                    tool,
                    error = %e,
                    "tool not found on PATH; video sources will fail to open"
                );
                available = false;
            }
        }
    }
    available
}
