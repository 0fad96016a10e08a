//! Replay driver
//!
//! Glues the pieces together: enumerate locations from a [`Backend`], fetch
//! each blob, decode its record stream, rebuild a response for every record
//! and route it through a [`Router`].
//!
//! Two ways to drive a replay exist:
//! - [`ReplayDriver::replay`] returns a pull-based [`Replay`] cursor that
//!   handles one location at a time and yields every handler output.
//! - [`ReplayDriver::run`] replays many locations at once and writes items
//!   to an [`OutputSink`](crate::output::OutputSink).
//!
//! In both modes the records of one location are decoded and routed strictly
//! in order, and a record's outputs are complete before the next record is
//! decoded.

mod concurrent;

use crate::backend::{Backend, StorageLocation};
use crate::record::{decode_bytes, Compression, Record, RecordReader};
use crate::router::{HandlerOutput, Router};
use crate::{CorruptStreamError, ReplayError, ReplayResult};
use futures::stream::{self, Stream};
use std::collections::{HashSet, VecDeque};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Tuning for one replay run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayOptions {
    /// Treat a corrupt stream as fatal instead of skipping the location
    pub fail_on_corrupt: bool,

    /// Queue `FollowUp` locations for replay instead of forwarding them
    pub follow_up: bool,

    /// Locations replayed at once by [`ReplayDriver::run`]
    pub concurrency: usize,

    /// Deepest allowed nesting of handler-produced records
    pub max_recursion_depth: usize,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            fail_on_corrupt: false,
            follow_up: true,
            concurrency: 4,
            max_recursion_depth: 8,
        }
    }
}

/// Counters collected during a replay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub locations_listed: usize,
    pub locations_replayed: usize,
    pub locations_skipped: usize,
    pub records_decoded: usize,
    pub items_emitted: usize,
    pub follow_ups_queued: usize,
}

/// A location whose remaining records were abandoned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedLocation {
    pub location: StorageLocation,
    pub error: CorruptStreamError,
}

/// One handler output with its provenance
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayItem {
    /// Blob the originating record was decoded from
    pub location: StorageLocation,

    /// URL of the record whose handler produced the output
    pub url: String,

    pub output: HandlerOutput,
}

/// Cooperative cancellation flag shared by a run and its caller
///
/// Once triggered, no new blob is fetched and no new record is decoded or
/// routed; a record already being routed finishes first.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Routes one record, expanding synthetic records depth-first
///
/// `Record` outputs are routed in place of themselves, so the caller only
/// ever sees items and follow-ups. Outputs are collected before returning:
/// when any nested route fails, nothing from this record is emitted.
pub(crate) fn route_record(
    router: &Router,
    record: &Record,
    max_depth: usize,
) -> ReplayResult<Vec<(String, HandlerOutput)>> {
    let mut outputs = Vec::new();
    expand(router, record, 0, max_depth, &mut outputs)?;
    Ok(outputs)
}

fn expand(
    router: &Router,
    record: &Record,
    depth: usize,
    max_depth: usize,
    outputs: &mut Vec<(String, HandlerOutput)>,
) -> ReplayResult<()> {
    for output in router.route(record)? {
        match output {
            HandlerOutput::Record(child) => {
                if depth >= max_depth {
                    return Err(ReplayError::RecursionLimit {
                        url: child.url,
                        depth: max_depth,
                    });
                }
                expand(router, &child, depth + 1, max_depth, outputs)?;
            }
            other => outputs.push((record.url.clone(), other)),
        }
    }
    Ok(())
}

/// Picks the decompression for a blob from its name
pub(crate) fn compression_for(location: &StorageLocation) -> ReplayResult<Compression> {
    Ok(Compression::from_name(&location.name())?)
}

/// Composes a backend and a router into replay runs
#[derive(Clone)]
pub struct ReplayDriver {
    backend: Arc<dyn Backend>,
    router: Arc<Router>,
    options: ReplayOptions,
}

impl ReplayDriver {
    pub fn new(backend: Arc<dyn Backend>, router: Router, options: ReplayOptions) -> Self {
        Self {
            backend,
            router: Arc::new(router),
            options,
        }
    }

    pub fn options(&self) -> &ReplayOptions {
        &self.options
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Starts a sequential, pull-based replay
    ///
    /// Nothing happens until the cursor is polled.
    pub fn replay(&self) -> Replay {
        self.replay_with_shutdown(Shutdown::new())
    }

    /// Like [`ReplayDriver::replay`], stopping once `shutdown` triggers
    pub fn replay_with_shutdown(&self, shutdown: Shutdown) -> Replay {
        Replay {
            backend: self.backend.clone(),
            router: self.router.clone(),
            options: self.options.clone(),
            shutdown,
            pending: VecDeque::new(),
            frontier: VecDeque::new(),
            seen: HashSet::new(),
            current: None,
            listed: false,
            finished: false,
            stats: ReplayStats::default(),
            skipped: Vec::new(),
        }
    }
}

struct ActiveLocation {
    location: StorageLocation,
    reader: RecordReader<Box<dyn Read + Send>>,
}

/// Pull-based replay cursor
///
/// Yields `Ok` for every handler output that leaves the driver and `Err`
/// for failures. Routing and handler errors, and a blob with no recognized
/// extension, are yielded and the cursor moves on when polled again.
/// Backend failures (and corrupt streams under `fail_on_corrupt`) end the
/// replay.
pub struct Replay {
    backend: Arc<dyn Backend>,
    router: Arc<Router>,
    options: ReplayOptions,
    shutdown: Shutdown,
    pending: VecDeque<ReplayItem>,
    frontier: VecDeque<StorageLocation>,
    seen: HashSet<StorageLocation>,
    current: Option<ActiveLocation>,
    listed: bool,
    finished: bool,
    stats: ReplayStats,
    skipped: Vec<SkippedLocation>,
}

impl Replay {
    /// Produces the next output, or `None` once the replay is over
    pub async fn next(&mut self) -> Option<ReplayResult<ReplayItem>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(Ok(item));
            }
            if self.finished {
                return None;
            }
            if self.shutdown.is_triggered() {
                tracing::info!("Replay interrupted; not starting further work");
                self.finished = true;
                return None;
            }

            if !self.listed {
                self.listed = true;
                match self.backend.list().await {
                    Ok(locations) => {
                        self.stats.locations_listed = locations.len();
                        for location in locations {
                            self.enqueue(location);
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to enumerate {} backend: {}", self.backend.name(), e);
                        self.finished = true;
                        return Some(Err(e.into()));
                    }
                }
                continue;
            }

            if let Some(active) = self.current.as_mut() {
                let step = active.reader.next();
                let location = active.location.clone();

                match step {
                    Some(Ok(record)) => {
                        self.stats.records_decoded += 1;
                        match route_record(&self.router, &record, self.options.max_recursion_depth) {
                            Ok(outputs) => {
                                for (url, output) in outputs {
                                    self.dispatch(&location, url, output);
                                }
                            }
                            Err(e) => return Some(Err(e)),
                        }
                    }
                    Some(Err(error)) => {
                        self.current = None;
                        if self.options.fail_on_corrupt {
                            tracing::error!("Corrupt stream in {}: {}", location, error);
                            self.finished = true;
                            return Some(Err(error.into()));
                        }
                        tracing::warn!("Skipping rest of {}: {}", location, error);
                        self.stats.locations_skipped += 1;
                        self.skipped.push(SkippedLocation { location, error });
                    }
                    None => {
                        tracing::info!(
                            "Finished {} ({} records)",
                            location,
                            active_records(&self.current)
                        );
                        self.current = None;
                        self.stats.locations_replayed += 1;
                    }
                }
                continue;
            }

            let Some(location) = self.frontier.pop_front() else {
                tracing::info!(
                    "Replay finished: {} locations, {} records, {} skipped",
                    self.stats.locations_replayed,
                    self.stats.records_decoded,
                    self.stats.locations_skipped
                );
                self.finished = true;
                return None;
            };

            let compression = match compression_for(&location) {
                Ok(compression) => compression,
                Err(e) => return Some(Err(e)),
            };

            match self.backend.fetch(&location).await {
                Ok(bytes) => {
                    tracing::info!("Replaying {} ({} bytes)", location, bytes.len());
                    self.current = Some(ActiveLocation {
                        location,
                        reader: decode_bytes(bytes, compression),
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to fetch {}: {}", location, e);
                    self.finished = true;
                    return Some(Err(e.into()));
                }
            }
        }
    }

    /// Adapts the cursor into a [`futures::Stream`]
    pub fn into_stream(self) -> impl Stream<Item = ReplayResult<ReplayItem>> + Send {
        stream::unfold(self, |mut replay| async move {
            replay.next().await.map(|item| (item, replay))
        })
    }

    /// Counters so far
    pub fn stats(&self) -> &ReplayStats {
        &self.stats
    }

    /// Locations abandoned because their stream was corrupt
    pub fn skipped(&self) -> &[SkippedLocation] {
        &self.skipped
    }

    fn enqueue(&mut self, location: StorageLocation) -> bool {
        if self.seen.insert(location.clone()) {
            self.frontier.push_back(location);
            true
        } else {
            false
        }
    }

    fn dispatch(&mut self, location: &StorageLocation, url: String, output: HandlerOutput) {
        match output {
            HandlerOutput::FollowUp(next) if self.options.follow_up => {
                if self.enqueue(next) {
                    self.stats.follow_ups_queued += 1;
                }
            }
            output => {
                if matches!(output, HandlerOutput::Item(_)) {
                    self.stats.items_emitted += 1;
                }
                self.pending.push_back(ReplayItem {
                    location: location.clone(),
                    url,
                    output,
                });
            }
        }
    }
}

fn active_records(current: &Option<ActiveLocation>) -> usize {
    current
        .as_ref()
        .map(|active| active.reader.records_read())
        .unwrap_or(0)
}
