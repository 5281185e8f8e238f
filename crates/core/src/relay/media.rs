//! Media transport abstraction consumed by the relay engine.
//!
//! The engine never touches codec or container internals. A
//! [`MediaBackend`] opens a demultiplexed input and a multiplexed output;
//! the engine moves opaque packets between them, rewriting only the stream
//! index and timestamps through [`RelayPacket`].
//!
//! Handles close when dropped. Backends must release the underlying
//! transport in `Drop` so every exit path of the engine frees them.

use crate::error::MediaError;
use crate::relay::timestamp::Rational;

/// Kind of elementary stream, used for logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    Data,
    Subtitle,
    Unknown,
}

/// A stream discovered by probing the source, including its codec
/// parameter set.
pub trait SourceStream {
    fn index(&self) -> usize;
    fn time_base(&self) -> Rational;
    fn kind(&self) -> MediaKind;
}

/// A compressed packet in flight from input to output.
pub trait RelayPacket {
    fn stream_index(&self) -> usize;
    fn set_stream_index(&mut self, index: usize);
    fn pts(&self) -> Option<i64>;
    fn set_pts(&mut self, pts: Option<i64>);
    fn set_dts(&mut self, dts: Option<i64>);
    /// Packet duration in the stream's time base; `0` when unknown.
    fn duration(&self) -> i64;
    fn set_duration(&mut self, duration: i64);
}

/// An opened, demultiplexed source.
pub trait MediaInput {
    type Stream: SourceStream;
    type Packet: RelayPacket;

    /// Discover the source's constituent streams.
    fn probe(&mut self) -> Result<Vec<Self::Stream>, MediaError>;

    /// Read the next packet. `Ok(None)` signals end of stream.
    fn read_packet(&mut self) -> Result<Option<Self::Packet>, MediaError>;
}

/// An opened, multiplexed destination.
pub trait MediaOutput {
    type Stream: SourceStream;
    type Packet: RelayPacket;

    /// Create an output stream carrying a verbatim copy of `source`'s
    /// parameter set. Returns the new output stream index.
    fn add_stream(&mut self, source: &Self::Stream) -> Result<usize, MediaError>;

    fn write_header(&mut self) -> Result<(), MediaError>;

    /// Time base of an output stream. Muxers may only settle it while
    /// writing the header, so callers query it afterwards.
    fn time_base(&self, index: usize) -> Option<Rational>;

    fn write_packet(&mut self, packet: Self::Packet) -> Result<(), MediaError>;

    fn write_trailer(&mut self) -> Result<(), MediaError>;
}

/// Factory for input and output handles of one media library.
pub trait MediaBackend: Send + Sync {
    type Stream: SourceStream;
    type Packet: RelayPacket;
    type Input: MediaInput<Stream = Self::Stream, Packet = Self::Packet>;
    type Output: MediaOutput<Stream = Self::Stream, Packet = Self::Packet>;

    fn open_input(&self, url: &str) -> Result<Self::Input, MediaError>;

    /// Open `url` for writing. `format` names the container/framing; `None`
    /// lets the backend guess from the URL.
    fn open_output(&self, url: &str, format: Option<&str>) -> Result<Self::Output, MediaError>;
}

/// Whether `format` multiplexes exactly one elementary stream.
///
/// libavformat's `rtp` muxer refuses a header for more than one stream;
/// each RTP session carries a single payload type.
pub fn is_single_stream(format: Option<&str>) -> bool {
    matches!(format, Some("rtp"))
}

/// Container framing required by a destination URL.
///
/// Packetized network destinations need a muxer that emits discrete
/// packets rather than a byte stream:
///
/// `rtp://host:5000`  → `rtp`
/// `udp://host:5000`  → `mpegts`
/// `srt://host:9000`  → `mpegts`
/// `rtmp://host/live` → `flv`
/// `rtsp://host/path` → `rtsp`
/// anything else      → `None` (guess from the URL)
pub fn output_format_for(url: &str) -> Option<&'static str> {
    let scheme = url.split_once("://")?.0.to_ascii_lowercase();
    match scheme.as_str() {
        "rtp" => Some("rtp"),
        "udp" | "srt" => Some("mpegts"),
        "rtmp" | "rtmps" => Some("flv"),
        "rtsp" | "rtsps" => Some("rtsp"),
        _ => None,
    }
}
