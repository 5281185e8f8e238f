//! Stream-copy relay engine.
//!
//! Opens a source as a demultiplexed input, opens a destination as a
//! multiplexed output, copies the parameter set of every relayed stream and
//! forwards packets one at a time, rescaling timestamps between time bases.
//! No decoding or re-encoding happens.
//!
//! A single-stream muxer (`rtp`) gets one output stream: the first video
//! stream, or the first stream when the source has no video. Packets of the
//! other source streams are counted as skipped.
//!
//! ## Relay steps
//!
//! ```text
//! open source        -> SourceOpen
//! probe streams      -> StreamProbe
//! open destination   -> DestinationOpen
//! copy parameters    -> StreamSetup
//! write header       -> HeaderWrite
//! packet loop        -> Completed | Cancelled | PacketRead | PacketWrite
//! write trailer      -> TrailerWrite (only turns Completed into a failure)
//! ```
//!
//! Handles are locals of [`RelayEngine::relay`]: on every exit path the
//! output drops before the input, releasing them in reverse acquisition
//! order.

pub mod media;
pub mod timestamp;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Deserialize;

use crate::error::{MediaError, RelayError};
pub use media::{
    MediaBackend, MediaInput, MediaKind, MediaOutput, RelayPacket, SourceStream, is_single_stream,
    output_format_for,
};
use timestamp::{Rational, rescale, rescale_opt};

/// How input streams map onto output streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMapping {
    /// Every input stream gets its own output stream, unless the
    /// destination muxer carries a single stream.
    #[default]
    PerStream,
    /// Only the first input stream gets an output stream. Every packet is
    /// forced onto output stream 0 and rescaled with the first stream's
    /// time bases, so multi-stream sources interleave into one stream.
    FirstStream,
}

/// Counters for one relay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Packets written to the destination.
    pub packets: u64,
    /// Packets read from streams that have no output mapping.
    pub skipped: u64,
}

/// Terminal outcome of a relay run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The source reached end of stream.
    Completed(RelayStats),
    /// The cancellation flag was raised.
    Cancelled(RelayStats),
    Failed(RelayError),
}

/// Runs one relay from `source` to `destination` on the calling thread.
///
/// `cancel` is polled between packets; `packets` is incremented for every
/// packet written so observers can follow progress.
pub trait Relay: Send + Sync {
    fn relay(
        &self,
        source: &str,
        destination: &str,
        cancel: &AtomicBool,
        packets: &AtomicU64,
    ) -> RelayOutcome;
}

#[derive(Debug, Clone, Copy)]
struct Route {
    output: usize,
    from: Rational,
    to: Rational,
}

enum Routing {
    PerStream(HashMap<usize, Route>),
    Single(Route),
}

impl Routing {
    fn route(&self, input_index: usize) -> Option<Route> {
        match self {
            Routing::PerStream(routes) => routes.get(&input_index).copied(),
            Routing::Single(route) => Some(*route),
        }
    }
}

enum LoopEnd {
    EndOfStream,
    Cancelled,
    Failed(RelayError),
}

/// Relay engine over a [`MediaBackend`].
pub struct RelayEngine<B> {
    backend: B,
    mapping: StreamMapping,
}

impl<B: MediaBackend> RelayEngine<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            mapping: StreamMapping::default(),
        }
    }

    pub fn with_mapping(mut self, mapping: StreamMapping) -> Self {
        self.mapping = mapping;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Positions in `streams` that get an output stream.
    fn selection(&self, streams: &[B::Stream], format: Option<&str>) -> Vec<usize> {
        match self.mapping {
            StreamMapping::FirstStream => vec![0],
            StreamMapping::PerStream if is_single_stream(format) => {
                let primary = streams
                    .iter()
                    .position(|s| s.kind() == MediaKind::Video)
                    .unwrap_or(0);
                vec![primary]
            }
            StreamMapping::PerStream => (0..streams.len()).collect(),
        }
    }

    /// `selected` and `outputs` are parallel: `outputs[i]` is the output
    /// stream created for `streams[selected[i]]`.
    fn routing(
        &self,
        streams: &[B::Stream],
        selected: &[usize],
        outputs: &[usize],
        output: &B::Output,
    ) -> Routing {
        let route_for = |stream: &B::Stream, out: usize| {
            let from = stream.time_base();
            Route {
                output: out,
                from,
                to: output.time_base(out).unwrap_or(from),
            }
        };

        match self.mapping {
            StreamMapping::PerStream => Routing::PerStream(
                selected
                    .iter()
                    .zip(outputs)
                    .map(|(&pos, &out)| {
                        let stream = &streams[pos];
                        (stream.index(), route_for(stream, out))
                    })
                    .collect(),
            ),
            StreamMapping::FirstStream => Routing::Single(route_for(&streams[0], outputs[0])),
        }
    }

    fn pump(
        input: &mut B::Input,
        output: &mut B::Output,
        routing: &Routing,
        cancel: &AtomicBool,
        packets: &AtomicU64,
        stats: &mut RelayStats,
    ) -> LoopEnd {
        loop {
            if cancel.load(Ordering::Acquire) {
                return LoopEnd::Cancelled;
            }

            let mut packet = match input.read_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => return LoopEnd::EndOfStream,
                Err(e) => return LoopEnd::Failed(RelayError::PacketRead(e)),
            };

            let Some(route) = routing.route(packet.stream_index()) else {
                stats.skipped += 1;
                tracing::trace!(stream = packet.stream_index(), "packet from unmapped stream");
                continue;
            };

            let pts = rescale_opt(packet.pts(), route.from, route.to);
            packet.set_stream_index(route.output);
            packet.set_pts(pts);
            packet.set_dts(pts);
            if packet.duration() > 0 {
                packet.set_duration(rescale(packet.duration(), route.from, route.to));
            }

            if let Err(e) = output.write_packet(packet) {
                return LoopEnd::Failed(RelayError::PacketWrite(e));
            }
            stats.packets += 1;
            packets.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl<B: MediaBackend> Relay for RelayEngine<B> {
    fn relay(
        &self,
        source: &str,
        destination: &str,
        cancel: &AtomicBool,
        packets: &AtomicU64,
    ) -> RelayOutcome {
        let mut input = match self.backend.open_input(source) {
            Ok(input) => input,
            Err(e) => return RelayOutcome::Failed(RelayError::SourceOpen(e)),
        };
        tracing::debug!(source, "source opened");

        let streams = match input.probe() {
            Ok(streams) if !streams.is_empty() => streams,
            Ok(_) => {
                let cause = MediaError::new("source has no streams");
                return RelayOutcome::Failed(RelayError::StreamProbe(cause));
            }
            Err(e) => return RelayOutcome::Failed(RelayError::StreamProbe(e)),
        };
        for stream in &streams {
            tracing::debug!(
                index = stream.index(),
                kind = ?stream.kind(),
                time_base = %stream.time_base(),
                "source stream"
            );
        }

        let format = output_format_for(destination);
        let mut output = match self.backend.open_output(destination, format) {
            Ok(output) => output,
            Err(e) => return RelayOutcome::Failed(RelayError::DestinationOpen(e)),
        };
        tracing::debug!(destination, format, "destination opened");

        let selected = self.selection(&streams, format);
        let mut outputs = Vec::with_capacity(selected.len());
        for &pos in &selected {
            match output.add_stream(&streams[pos]) {
                Ok(index) => outputs.push(index),
                Err(e) => return RelayOutcome::Failed(RelayError::StreamSetup(e)),
            }
        }
        if selected.len() < streams.len() {
            tracing::info!(
                relayed = selected.len(),
                dropped = streams.len() - selected.len(),
                format,
                "destination carries fewer streams than the source"
            );
        }

        if let Err(e) = output.write_header() {
            return RelayOutcome::Failed(RelayError::HeaderWrite(e));
        }

        let routing = self.routing(&streams, &selected, &outputs, &output);
        tracing::info!(
            source,
            destination,
            streams = outputs.len(),
            mapping = ?self.mapping,
            "relay running"
        );

        let mut stats = RelayStats::default();
        let end = Self::pump(&mut input, &mut output, &routing, cancel, packets, &mut stats);

        let trailer = output.write_trailer();
        drop(output);
        drop(input);

        match (end, trailer) {
            (LoopEnd::EndOfStream, Ok(())) => RelayOutcome::Completed(stats),
            (LoopEnd::EndOfStream, Err(e)) => RelayOutcome::Failed(RelayError::TrailerWrite(e)),
            (LoopEnd::Cancelled, trailer) => {
                if let Err(e) = trailer {
                    tracing::warn!(error = %e, "trailer write failed after cancellation");
                }
                RelayOutcome::Cancelled(stats)
            }
            (LoopEnd::Failed(err), trailer) => {
                if let Err(e) = trailer {
                    tracing::warn!(error = %e, "trailer write failed after relay error");
                }
                RelayOutcome::Failed(err)
            }
        }
    }
}
