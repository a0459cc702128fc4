//! Pure Rust reader for `multipart/x-mixed-replace` JPEG camera streams.
//!
//! A part's `Content-Length` is used when the bytes at that offset close the
//! image. Otherwise the image's marker segments are walked by their length
//! fields until the end-of-image marker, so cameras that send wrong or missing
//! lengths still work and `FF D9` pairs inside metadata (EXIF thumbnails, ICC
//! profiles) never cut a frame short.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};
use image::{ImageFormat, RgbImage};
use tracing::debug;

use crate::config::SourceConfig;
use crate::error::{ConfigError, SourceError};
use crate::source::{CameraSource, CameraStream};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

pub struct MjpegHttpSource {
    client: reqwest::Client,
    read_timeout: Duration,
    max_frame_bytes: usize,
}

impl MjpegHttpSource {
    pub fn new(config: &SourceConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| ConfigError::Invalid(format!("http client: {e}")))?;
        Ok(Self {
            client,
            read_timeout: config.read_timeout(),
            max_frame_bytes: config.max_frame_bytes,
        })
    }
}

#[async_trait]
impl CameraSource for MjpegHttpSource {
    async fn open(&self, url: &str) -> Result<Box<dyn CameraStream>, SourceError> {
        let unavailable = |reason: String| SourceError::Unavailable {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(unavailable(format!("http status {}", response.status())));
        }
        debug!(url, content_type = ?response.headers().get(reqwest::header::CONTENT_TYPE), "mjpeg stream opened");

        Ok(Box::new(MjpegStream {
            body: response.bytes_stream().boxed(),
            splitter: JpegSplitter::new(self.max_frame_bytes),
            read_timeout: self.read_timeout,
        }))
    }
}

struct MjpegStream {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    splitter: JpegSplitter,
    read_timeout: Duration,
}

#[async_trait]
impl CameraStream for MjpegStream {
    async fn read_frame(&mut self) -> Result<RgbImage, SourceError> {
        loop {
            if let Some(jpeg) = self.splitter.next_frame()? {
                return decode_jpeg(&jpeg);
            }

            match tokio::time::timeout(self.read_timeout, self.body.next()).await {
                Err(_) => {
                    return Err(SourceError::StreamEnded(format!(
                        "no data for {:?}",
                        self.read_timeout
                    )));
                }
                Ok(None) => {
                    return Err(SourceError::StreamEnded("camera closed the stream".to_string()));
                }
                Ok(Some(Err(e))) => return Err(SourceError::StreamEnded(e.to_string())),
                Ok(Some(Ok(chunk))) => self.splitter.push(&chunk),
            }
        }
    }
}

fn decode_jpeg(jpeg: &[u8]) -> Result<RgbImage, SourceError> {
    image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg)
        .map(|img| img.to_rgb8())
        .map_err(|e| SourceError::CorruptFrame(e.to_string()))
}

/// Longest unfinished header line kept while waiting for the next image.
const MAX_HEADER_LINE: usize = 1024;

/// Accumulates body bytes and cuts complete JPEG images out of them.
#[derive(Debug)]
pub struct JpegSplitter {
    buffer: BytesMut,
    max_frame_bytes: usize,
    /// `Content-Length` of the part whose image comes next, if it sent one.
    declared_len: Option<usize>,
}

impl JpegSplitter {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            max_frame_bytes,
            declared_len: None,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Returns the next complete image, `None` if more bytes are needed.
    ///
    /// An image that grows past `max_frame_bytes` is discarded and reported as
    /// `CorruptFrame`; the splitter then resynchronises on the next start marker.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, SourceError> {
        let Some(start) = find_marker(&self.buffer, SOI, 0) else {
            // an unfinished line may still turn into a Content-Length header,
            // and a trailing 0xFF may be the first half of a start marker
            let complete_lines = self
                .buffer
                .iter()
                .rposition(|&b| b == b'\n')
                .map_or(0, |newline| newline + 1);
            self.read_part_headers(complete_lines);
            if self.buffer.len() > MAX_HEADER_LINE {
                let keep = usize::from(self.buffer.last() == Some(&0xFF));
                let discard = self.buffer.len() - keep;
                self.buffer.advance(discard);
            }
            return Ok(None);
        };
        self.read_part_headers(start);

        match self.frame_end() {
            Some(end) if end > self.max_frame_bytes => {
                self.buffer.advance(end);
                self.declared_len = None;
                Err(self.oversized())
            }
            Some(end) => {
                self.declared_len = None;
                Ok(Some(self.buffer.split_to(end).freeze()))
            }
            None if self.buffer.len() > self.max_frame_bytes => {
                self.buffer.clear();
                self.declared_len = None;
                Err(self.oversized())
            }
            None => Ok(None),
        }
    }

    /// Consumes `len` bytes of part headers, remembering any `Content-Length`.
    fn read_part_headers(&mut self, len: usize) {
        let headers = self.buffer.split_to(len);
        for line in headers[..].split(|&b| b == b'\n') {
            if let Some(declared) = content_length(line) {
                self.declared_len = Some(declared);
            }
        }
    }

    /// Length of the image at the front of the buffer, once all of it is there.
    fn frame_end(&self) -> Option<usize> {
        if let Some(declared) = self.declared_len {
            if self.buffer.len() < declared && declared <= self.max_frame_bytes {
                return None;
            }
            let tail = declared.checked_sub(EOI.len()).and_then(|at| self.buffer.get(at..declared));
            if tail == Some(&EOI[..]) {
                return Some(declared);
            }
        }

        match walk_segments(&self.buffer) {
            Segments::Complete(end) => Some(end),
            Segments::Incomplete => None,
            Segments::Malformed => find_marker(&self.buffer, EOI, SOI.len()).map(|end| end + EOI.len()),
        }
    }

    fn oversized(&self) -> SourceError {
        SourceError::CorruptFrame(format!("frame larger than {} bytes", self.max_frame_bytes))
    }
}

fn content_length(line: &[u8]) -> Option<usize> {
    let line = std::str::from_utf8(line).ok()?;
    let (name, value) = line.split_once(':')?;
    if !name.trim().eq_ignore_ascii_case("content-length") {
        return None;
    }
    value.trim().parse().ok()
}

#[derive(Debug, PartialEq, Eq)]
enum Segments {
    /// The image ends at this offset, just past its end-of-image marker.
    Complete(usize),
    Incomplete,
    /// Not a well-formed marker sequence; fall back to scanning for `FF D9`.
    Malformed,
}

/// Walks the marker segments of the image starting at `buf[0]` (its start
/// marker). Segment payloads are skipped by their length field and entropy
/// coded data is scanned for the next real marker.
fn walk_segments(buf: &[u8]) -> Segments {
    let mut pos = SOI.len();
    loop {
        let Some(&lead) = buf.get(pos) else {
            return Segments::Incomplete;
        };
        if lead != 0xFF {
            return Segments::Malformed;
        }
        let mut at = pos + 1;
        while buf.get(at) == Some(&0xFF) {
            at += 1;
        }
        let Some(&marker) = buf.get(at) else {
            return Segments::Incomplete;
        };
        pos = at + 1;

        match marker {
            0xD9 => return Segments::Complete(pos),
            // standalone markers carry no length
            0x01 | 0xD0..=0xD7 => continue,
            0x00 | 0xD8 => return Segments::Malformed,
            _ => {}
        }

        let Some(len) = buf.get(pos..pos + 2) else {
            return Segments::Incomplete;
        };
        let len = usize::from(u16::from_be_bytes([len[0], len[1]]));
        if len < 2 {
            return Segments::Malformed;
        }
        pos += len;

        if marker == 0xDA {
            // scan data: FF 00 is a stuffed byte, FF D0..D7 a restart marker
            loop {
                let Some(offset) = buf.get(pos..).and_then(|rest| rest.iter().position(|&b| b == 0xFF)) else {
                    return Segments::Incomplete;
                };
                let ff = pos + offset;
                match buf.get(ff + 1).copied() {
                    None => return Segments::Incomplete,
                    Some(0x00 | 0xD0..=0xD7 | 0xFF) => pos = ff + 1,
                    Some(_) => {
                        pos = ff;
                        break;
                    }
                }
            }
        }
    }
}

fn find_marker(haystack: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|w| w == marker)
        .map(|pos| pos + from)
}
