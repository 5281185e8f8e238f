//! FFmpeg media backend (`ffmpeg` feature).
//!
//! Inputs are opened with `avformat_open_input` + stream probing, outputs
//! with `avformat_alloc_output_context2` + `avio_open`. Handles close in
//! their `Drop` impls, provided by `ffmpeg-next`.

use std::time::Duration;

use ffmpeg_next as ffmpeg;

use crate::error::MediaError;
use crate::relay::media::{
    MediaBackend, MediaInput, MediaKind, MediaOutput, RelayPacket, SourceStream,
};
use crate::relay::timestamp::Rational;

impl From<ffmpeg::Error> for MediaError {
    fn from(e: ffmpeg::Error) -> Self {
        MediaError(e.to_string())
    }
}

impl From<ffmpeg::Rational> for Rational {
    fn from(r: ffmpeg::Rational) -> Self {
        Rational::new(r.numerator(), r.denominator())
    }
}

impl From<ffmpeg::media::Type> for MediaKind {
    fn from(t: ffmpeg::media::Type) -> Self {
        match t {
            ffmpeg::media::Type::Video => MediaKind::Video,
            ffmpeg::media::Type::Audio => MediaKind::Audio,
            ffmpeg::media::Type::Data => MediaKind::Data,
            ffmpeg::media::Type::Subtitle => MediaKind::Subtitle,
            _ => MediaKind::Unknown,
        }
    }
}

impl RelayPacket for ffmpeg::Packet {
    fn stream_index(&self) -> usize {
        ffmpeg::Packet::stream(self)
    }

    fn set_stream_index(&mut self, index: usize) {
        ffmpeg::Packet::set_stream(self, index);
    }

    fn pts(&self) -> Option<i64> {
        ffmpeg::Packet::pts(self)
    }

    fn set_pts(&mut self, pts: Option<i64>) {
        ffmpeg::Packet::set_pts(self, pts);
    }

    fn set_dts(&mut self, dts: Option<i64>) {
        ffmpeg::Packet::set_dts(self, dts);
    }

    fn duration(&self) -> i64 {
        ffmpeg::Packet::duration(self)
    }

    fn set_duration(&mut self, duration: i64) {
        ffmpeg::Packet::set_duration(self, duration);
    }
}

/// A probed input stream with an owned copy of its codec parameters.
pub struct FfmpegStream {
    index: usize,
    time_base: Rational,
    kind: MediaKind,
    parameters: ffmpeg::codec::Parameters,
}

impl SourceStream for FfmpegStream {
    fn index(&self) -> usize {
        self.index
    }

    fn time_base(&self) -> Rational {
        self.time_base
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }
}

pub struct FfmpegInput {
    ctx: ffmpeg::format::context::Input,
}

impl MediaInput for FfmpegInput {
    type Stream = FfmpegStream;
    type Packet = ffmpeg::Packet;

    fn probe(&mut self) -> Result<Vec<FfmpegStream>, MediaError> {
        // Cloning detaches the parameters from the input context so the
        // context can close independently.
        Ok(self
            .ctx
            .streams()
            .map(|stream| {
                let parameters = stream.parameters().clone();
                FfmpegStream {
                    index: stream.index(),
                    time_base: stream.time_base().into(),
                    kind: parameters.medium().into(),
                    parameters,
                }
            })
            .collect())
    }

    fn read_packet(&mut self) -> Result<Option<ffmpeg::Packet>, MediaError> {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.ctx) {
            Ok(()) => Ok(Some(packet)),
            Err(ffmpeg::Error::Eof) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct FfmpegOutput {
    ctx: ffmpeg::format::context::Output,
}

impl MediaOutput for FfmpegOutput {
    type Stream = FfmpegStream;
    type Packet = ffmpeg::Packet;

    fn add_stream(&mut self, source: &FfmpegStream) -> Result<usize, MediaError> {
        let mut stream = self
            .ctx
            .add_stream(ffmpeg::encoder::find(ffmpeg::codec::Id::None))?;
        stream.set_parameters(source.parameters.clone());
        // The source container's codec tag may be invalid in the destination.
        // SAFETY: `parameters()` wraps the `codecpar` of a stream that
        // `add_stream` just allocated inside `self.ctx`. The pointer is
        // non-null and stays valid while `self.ctx` is borrowed here, and
        // nothing else aliases it during this write.
        unsafe {
            (*stream.parameters().as_mut_ptr()).codec_tag = 0;
        }
        Ok(stream.index())
    }

    fn write_header(&mut self) -> Result<(), MediaError> {
        self.ctx.write_header()?;
        Ok(())
    }

    fn time_base(&self, index: usize) -> Option<Rational> {
        self.ctx.stream(index).map(|s| s.time_base().into())
    }

    fn write_packet(&mut self, mut packet: ffmpeg::Packet) -> Result<(), MediaError> {
        packet.set_position(-1);
        packet.write_interleaved(&mut self.ctx)?;
        Ok(())
    }

    fn write_trailer(&mut self) -> Result<(), MediaError> {
        self.ctx.write_trailer()?;
        Ok(())
    }
}

/// Opens inputs and outputs through libavformat.
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    io_timeout: Duration,
    rtsp_transport: Option<String>,
}

impl FfmpegBackend {
    /// Initialize libavformat and its network layer.
    ///
    /// `io_timeout` bounds every blocking socket read on the input, which
    /// also bounds how long a cancelled relay can stay blocked.
    pub fn new(io_timeout: Duration, rtsp_transport: Option<String>) -> Result<Self, MediaError> {
        ffmpeg::init()?;
        ffmpeg::format::network::init();
        Ok(Self {
            io_timeout,
            rtsp_transport,
        })
    }

    fn input_options(&self, url: &str) -> ffmpeg::Dictionary<'static> {
        let micros = self.io_timeout.as_micros().to_string();
        let mut options = ffmpeg::Dictionary::new();
        options.set("rw_timeout", &micros);
        if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
            options.set("timeout", &micros);
            if let Some(transport) = &self.rtsp_transport {
                options.set("rtsp_transport", transport);
            }
        }
        options
    }
}

impl MediaBackend for FfmpegBackend {
    type Stream = FfmpegStream;
    type Packet = ffmpeg::Packet;
    type Input = FfmpegInput;
    type Output = FfmpegOutput;

    fn open_input(&self, url: &str) -> Result<FfmpegInput, MediaError> {
        let ctx = ffmpeg::format::input_with_dictionary(&url, self.input_options(url))?;
        Ok(FfmpegInput { ctx })
    }

    fn open_output(&self, url: &str, format: Option<&str>) -> Result<FfmpegOutput, MediaError> {
        let ctx = match format {
            Some(format) => ffmpeg::format::output_as(&url, format)?,
            None => ffmpeg::format::output(&url)?,
        };
        Ok(FfmpegOutput { ctx })
    }
}
