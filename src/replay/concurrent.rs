//! Concurrent replay into an output sink

use crate::backend::{Backend, StorageLocation};
use crate::output::{ExtractedItem, OutputSink, RunStatus};
use crate::record::decode_bytes;
use crate::replay::{compression_for, route_record, ReplayDriver, ReplayOptions, ReplayStats, Shutdown};
use crate::router::{HandlerOutput, Router};
use crate::{ReplayError, ReplayResult};
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::io;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// What one location task reports back
struct LocationOutcome {
    stats: ReplayStats,
    follow_ups: Vec<StorageLocation>,
    interrupted: bool,
    result: ReplayResult<()>,
}

impl LocationOutcome {
    fn new() -> Self {
        Self {
            stats: ReplayStats::default(),
            follow_ups: Vec::new(),
            interrupted: false,
            result: Ok(()),
        }
    }
}

fn merge(into: &mut ReplayStats, from: &ReplayStats) {
    into.locations_replayed += from.locations_replayed;
    into.locations_skipped += from.locations_skipped;
    into.records_decoded += from.records_decoded;
    into.items_emitted += from.items_emitted;
}

impl ReplayDriver {
    /// Replays every location into `sink`, several locations at a time
    ///
    /// At most `concurrency` locations are in flight. Each location is
    /// decoded and routed sequentially by its own task. Follow-up locations
    /// returned by finished tasks join the frontier once.
    ///
    /// The first fatal error (backend failure, unrouted URL, handler error,
    /// sink failure, or a corrupt stream under `fail_on_corrupt`) stops new
    /// work; tasks already running finish their current record and the error
    /// is returned. `shutdown` stops new work the same way without an error.
    ///
    /// The caller opens the run with [`OutputSink::begin_run`]; this method
    /// always closes it with [`OutputSink::finalize`].
    pub async fn run(
        &self,
        sink: Arc<dyn OutputSink>,
        shutdown: &Shutdown,
    ) -> ReplayResult<ReplayStats> {
        let mut stats = ReplayStats::default();
        let outcome = self.run_inner(sink.clone(), shutdown, &mut stats).await;

        let status = match &outcome {
            Err(_) => RunStatus::Failed,
            Ok(()) if shutdown.is_triggered() => RunStatus::Interrupted,
            Ok(()) => RunStatus::Completed,
        };
        match (outcome, sink.finalize(status, &stats)) {
            (Ok(()), Ok(())) => Ok(stats),
            (Ok(()), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(finalize_error)) => {
                tracing::error!("Failed to finalize failed run: {}", finalize_error);
                Err(e)
            }
        }
    }

    async fn run_inner(
        &self,
        sink: Arc<dyn OutputSink>,
        shutdown: &Shutdown,
        stats: &mut ReplayStats,
    ) -> ReplayResult<()> {
        let locations = self.backend.list().await.map_err(|e| {
            tracing::error!("Failed to enumerate {} backend: {}", self.backend.name(), e);
            ReplayError::from(e)
        })?;
        stats.locations_listed = locations.len();

        let mut seen: HashSet<StorageLocation> = HashSet::new();
        let mut frontier: VecDeque<StorageLocation> = VecDeque::new();
        for location in locations {
            if seen.insert(location.clone()) {
                frontier.push_back(location);
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut failure: Option<ReplayError> = None;

        loop {
            while failure.is_none() && !shutdown.is_triggered() && !frontier.is_empty() {
                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    break;
                };
                let Some(location) = frontier.pop_front() else {
                    break;
                };

                let backend = self.backend.clone();
                let router = self.router.clone();
                let options = self.options.clone();
                let sink = sink.clone();
                let shutdown = shutdown.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    replay_location(backend, router, options, sink, shutdown, location).await
                });
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };

            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!("Replay task failed: {}", e);
                    failure.get_or_insert(ReplayError::Io(io::Error::new(io::ErrorKind::Other, e)));
                    continue;
                }
            };

            merge(stats, &outcome.stats);
            for location in outcome.follow_ups {
                if seen.insert(location.clone()) {
                    stats.follow_ups_queued += 1;
                    frontier.push_back(location);
                }
            }
            if let Err(e) = outcome.result {
                if failure.is_none() {
                    tracing::error!("Aborting replay: {}", e);
                    failure = Some(e);
                }
            }
            if outcome.interrupted {
                tracing::debug!("Location task stopped on shutdown");
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        if shutdown.is_triggered() {
            tracing::info!(
                "Replay interrupted with {} locations not started",
                frontier.len()
            );
        } else {
            tracing::info!(
                "Replay finished: {} locations, {} records, {} items, {} skipped",
                stats.locations_replayed,
                stats.records_decoded,
                stats.items_emitted,
                stats.locations_skipped
            );
        }
        Ok(())
    }
}

/// Replays one location from start to finish
async fn replay_location(
    backend: Arc<dyn Backend>,
    router: Arc<Router>,
    options: ReplayOptions,
    sink: Arc<dyn OutputSink>,
    shutdown: Shutdown,
    location: StorageLocation,
) -> LocationOutcome {
    let mut outcome = LocationOutcome::new();
    outcome.result = replay_location_inner(
        backend.as_ref(),
        &router,
        &options,
        sink.as_ref(),
        &shutdown,
        &location,
        &mut outcome,
    )
    .await;
    outcome
}

async fn replay_location_inner(
    backend: &dyn Backend,
    router: &Router,
    options: &ReplayOptions,
    sink: &dyn OutputSink,
    shutdown: &Shutdown,
    location: &StorageLocation,
    outcome: &mut LocationOutcome,
) -> ReplayResult<()> {
    let compression = compression_for(location)?;
    let bytes = backend.fetch(location).await.map_err(|e| {
        tracing::error!("Failed to fetch {}: {}", location, e);
        ReplayError::from(e)
    })?;
    tracing::info!("Replaying {} ({} bytes)", location, bytes.len());

    let mut reader = decode_bytes(bytes, compression);
    loop {
        if shutdown.is_triggered() {
            outcome.interrupted = true;
            return Ok(());
        }

        let record = match reader.next() {
            Some(Ok(record)) => record,
            Some(Err(error)) => {
                if options.fail_on_corrupt {
                    tracing::error!("Corrupt stream in {}: {}", location, error);
                    return Err(error.into());
                }
                tracing::warn!("Skipping rest of {}: {}", location, error);
                sink.record_skipped(location, &error.to_string())?;
                outcome.stats.locations_skipped += 1;
                return Ok(());
            }
            None => break,
        };
        outcome.stats.records_decoded += 1;

        for (url, output) in route_record(router, &record, options.max_recursion_depth)? {
            let value = match output {
                HandlerOutput::Item(value) => value,
                HandlerOutput::FollowUp(next) if options.follow_up => {
                    outcome.follow_ups.push(next);
                    continue;
                }
                HandlerOutput::FollowUp(next) => json!({ "follow_up": next.to_string() }),
                // route_record expands synthetic records itself
                HandlerOutput::Record(_) => continue,
            };
            sink.write_item(&ExtractedItem {
                location: location.clone(),
                url,
                value,
            })?;
            outcome.stats.items_emitted += 1;
        }
    }

    tracing::info!(
        "Finished {} ({} records)",
        location,
        reader.records_read()
    );
    outcome.stats.locations_replayed += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{OutputError, OutputResult, SqliteSink};
    use crate::record::{encode, Record};
    use crate::response::Response;
    use crate::router::{HandlerResult, Rule};
    use crate::BackendError;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::path::PathBuf;
    use std::sync::Mutex;

    struct MapBackend {
        blobs: Vec<(StorageLocation, Bytes)>,
        /// Listed first, but every fetch fails
        broken: Vec<StorageLocation>,
        fetches: Mutex<Vec<StorageLocation>>,
    }

    impl MapBackend {
        fn new(blobs: Vec<(&str, Vec<u8>)>) -> Self {
            Self {
                blobs: blobs
                    .into_iter()
                    .map(|(name, bytes)| (StorageLocation::File(PathBuf::from(name)), Bytes::from(bytes)))
                    .collect(),
                broken: Vec::new(),
                fetches: Mutex::new(Vec::new()),
            }
        }

        fn with_broken(mut self, name: &str) -> Self {
            self.broken.push(StorageLocation::File(PathBuf::from(name)));
            self
        }
    }

    #[async_trait]
    impl Backend for MapBackend {
        fn name(&self) -> &'static str {
            "map"
        }

        async fn list(&self) -> Result<Vec<StorageLocation>, BackendError> {
            Ok(self
                .broken
                .iter()
                .cloned()
                .chain(self.blobs.iter().map(|(l, _)| l.clone()))
                .collect())
        }

        async fn fetch(&self, location: &StorageLocation) -> Result<Bytes, BackendError> {
            self.fetches.lock().unwrap().push(location.clone());
            self.blobs
                .iter()
                .find(|(l, _)| l == location)
                .map(|(_, b)| b.clone())
                .ok_or_else(|| BackendError::Status {
                    url: location.to_string(),
                    status: 404,
                })
        }
    }

    #[derive(Default)]
    struct Collecting {
        items: Mutex<Vec<ExtractedItem>>,
        skipped: Mutex<Vec<String>>,
        status: Mutex<Option<RunStatus>>,
        fail_finalize: bool,
    }

    impl OutputSink for Collecting {
        fn begin_run(&self, _config_hash: &str, _source: &str) -> OutputResult<()> {
            Ok(())
        }

        fn write_item(&self, item: &ExtractedItem) -> OutputResult<()> {
            self.items.lock().unwrap().push(item.clone());
            Ok(())
        }

        fn record_skipped(&self, location: &StorageLocation, _reason: &str) -> OutputResult<()> {
            self.skipped.lock().unwrap().push(location.to_string());
            Ok(())
        }

        fn finalize(&self, status: RunStatus, _stats: &ReplayStats) -> OutputResult<()> {
            *self.status.lock().unwrap() = Some(status);
            if self.fail_finalize {
                return Err(OutputError::Write("disk full".to_string()));
            }
            Ok(())
        }
    }

    fn stream(prefix: &str, count: usize) -> Vec<u8> {
        (0..count)
            .flat_map(|n| encode(&Record::new(format!("http://{}/{}", prefix, n), "")).unwrap())
            .collect()
    }

    fn echo(response: &Response) -> HandlerResult {
        Ok(vec![HandlerOutput::Item(json!(response.url()))])
    }

    fn driver(backend: MapBackend, rules: Vec<Rule>, options: ReplayOptions) -> ReplayDriver {
        ReplayDriver::new(Arc::new(backend), Router::new(rules).unwrap(), options)
    }

    #[tokio::test]
    async fn test_run_preserves_order_within_each_location() {
        let backend = MapBackend::new(vec![
            ("/a.records", stream("a", 20)),
            ("/b.records", stream("b", 20)),
            ("/c.records", stream("c", 20)),
        ]);
        let driver = driver(
            backend,
            vec![Rule::handle(".*", "echo", echo).unwrap()],
            ReplayOptions {
                concurrency: 3,
                ..ReplayOptions::default()
            },
        );
        let sink = Arc::new(Collecting::default());

        let stats = driver.run(sink.clone(), &Shutdown::new()).await.unwrap();
        assert_eq!(stats.locations_listed, 3);
        assert_eq!(stats.locations_replayed, 3);
        assert_eq!(stats.records_decoded, 60);
        assert_eq!(stats.items_emitted, 60);

        let items = sink.items.lock().unwrap();
        for host in ["a", "b", "c"] {
            let urls: Vec<String> = items
                .iter()
                .filter(|item| item.url.starts_with(&format!("http://{}/", host)))
                .map(|item| item.url.clone())
                .collect();
            let expected: Vec<String> = (0..20).map(|n| format!("http://{}/{}", host, n)).collect();
            assert_eq!(urls, expected);
        }
        assert_eq!(*sink.status.lock().unwrap(), Some(RunStatus::Completed));
    }

    #[tokio::test]
    async fn test_run_skips_corrupt_location() {
        let mut corrupt = stream("bad", 2);
        corrupt.truncate(corrupt.len() - 2);
        let backend = MapBackend::new(vec![
            ("/bad.records", corrupt),
            ("/good.records", stream("good", 2)),
        ]);
        let driver = driver(
            backend,
            vec![Rule::handle(".*", "echo", echo).unwrap()],
            ReplayOptions::default(),
        );
        let sink = Arc::new(Collecting::default());

        let stats = driver.run(sink.clone(), &Shutdown::new()).await.unwrap();
        assert_eq!(stats.locations_skipped, 1);
        assert_eq!(stats.locations_replayed, 1);
        assert_eq!(*sink.skipped.lock().unwrap(), vec!["file:///bad.records".to_string()]);

        let urls: Vec<String> = sink.items.lock().unwrap().iter().map(|i| i.url.clone()).collect();
        assert!(urls.contains(&"http://good/0".to_string()));
        assert!(urls.contains(&"http://good/1".to_string()));
        assert!(urls.contains(&"http://bad/0".to_string()));
    }

    #[tokio::test]
    async fn test_run_fails_on_unrouted_url() {
        let backend = MapBackend::new(vec![("/a.records", stream("a", 3))]);
        let driver = driver(
            backend,
            vec![Rule::handle("/1$", "one", echo).unwrap()],
            ReplayOptions::default(),
        );
        let sink = Arc::new(Collecting::default());

        let result = driver.run(sink.clone(), &Shutdown::new()).await;
        assert!(matches!(result, Err(ReplayError::UnroutedUrl { url }) if url == "http://a/0"));
        assert_eq!(*sink.status.lock().unwrap(), Some(RunStatus::Failed));
    }

    #[tokio::test]
    async fn test_run_follows_up_once() {
        let backend = MapBackend::new(vec![
            ("/a.records", stream("a", 2)),
            ("/b.records", stream("b", 1)),
        ]);
        let target = StorageLocation::File(PathBuf::from("/b.records"));
        let driver = driver(
            backend,
            vec![
                Rule::handle("^http://a/", "a", move |_: &Response| -> HandlerResult {
                    Ok(vec![HandlerOutput::FollowUp(target.clone())])
                })
                .unwrap(),
                Rule::handle(".*", "echo", echo).unwrap(),
            ],
            ReplayOptions {
                concurrency: 1,
                ..ReplayOptions::default()
            },
        );
        let sink = Arc::new(Collecting::default());

        let stats = driver.run(sink.clone(), &Shutdown::new()).await.unwrap();
        assert_eq!(stats.locations_replayed, 2);
        assert_eq!(stats.follow_ups_queued, 0);
        assert_eq!(sink.items.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_writes_forwarded_follow_ups_when_disabled() {
        let backend = MapBackend::new(vec![("/a.records", stream("a", 1))]);
        let driver = driver(
            backend,
            vec![Rule::handle(".*", "links", |_: &Response| -> HandlerResult {
                Ok(vec![HandlerOutput::FollowUp(StorageLocation::File(PathBuf::from(
                    "/next.records",
                )))])
            })
            .unwrap()],
            ReplayOptions {
                follow_up: false,
                ..ReplayOptions::default()
            },
        );
        let sink = Arc::new(Collecting::default());

        driver.run(sink.clone(), &Shutdown::new()).await.unwrap();
        let items = sink.items.lock().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].value, json!({"follow_up": "file:///next.records"}));
    }

    #[tokio::test]
    async fn test_run_interrupted_before_start() {
        let backend = MapBackend::new(vec![("/a.records", stream("a", 3))]);
        let driver = driver(
            backend,
            vec![Rule::handle(".*", "echo", echo).unwrap()],
            ReplayOptions::default(),
        );
        let sink = Arc::new(Collecting::default());
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let stats = driver.run(sink.clone(), &shutdown).await.unwrap();
        assert_eq!(stats.records_decoded, 0);
        assert_eq!(*sink.status.lock().unwrap(), Some(RunStatus::Interrupted));
    }

    #[tokio::test]
    async fn test_run_into_sqlite_sink() {
        let backend = MapBackend::new(vec![("/a.records", stream("a", 4))]);
        let driver = driver(
            backend,
            vec![Rule::handle(".*", "echo", echo).unwrap()],
            ReplayOptions::default(),
        );
        let sink = Arc::new(SqliteSink::in_memory().unwrap());
        sink.begin_run("hash", "/").unwrap();

        driver.run(sink.clone(), &Shutdown::new()).await.unwrap();

        let summary = sink.statistics().unwrap();
        assert_eq!(summary.total_items, 4);
        assert_eq!(summary.records_decoded, 4);
        assert_eq!(summary.status, "completed");
    }
    #[tokio::test]
    async fn test_run_shutdown_mid_location_finishes_current_record() {
        let backend = MapBackend::new(vec![("/a.records", stream("a", 3))]);
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        let driver = driver(
            backend,
            vec![Rule::handle(".*", "stop", move |response: &Response| -> HandlerResult {
                trigger.trigger();
                Ok(vec![HandlerOutput::Item(json!(response.url()))])
            })
            .unwrap()],
            ReplayOptions::default(),
        );
        let sink = Arc::new(Collecting::default());

        let stats = driver.run(sink.clone(), &shutdown).await.unwrap();
        assert_eq!(stats.records_decoded, 1);
        assert_eq!(stats.locations_replayed, 0);

        let urls: Vec<String> = sink.items.lock().unwrap().iter().map(|i| i.url.clone()).collect();
        assert_eq!(urls, vec!["http://a/0"]);
        assert_eq!(*sink.status.lock().unwrap(), Some(RunStatus::Interrupted));
    }

    #[tokio::test]
    async fn test_run_fetch_failure_is_fatal() {
        let backend = MapBackend::new(vec![("/good.records", stream("good", 2))]).with_broken("/gone.records");
        let backend = Arc::new(backend);
        let driver = ReplayDriver::new(
            backend.clone(),
            Router::new(vec![Rule::handle(".*", "echo", echo).unwrap()]).unwrap(),
            ReplayOptions {
                concurrency: 1,
                ..ReplayOptions::default()
            },
        );
        let sink = Arc::new(Collecting::default());

        let result = driver.run(sink.clone(), &Shutdown::new()).await;
        assert!(matches!(
            result,
            Err(ReplayError::BackendUnavailable(BackendError::Status { status: 404, .. }))
        ));
        assert_eq!(
            *backend.fetches.lock().unwrap(),
            vec![StorageLocation::File(PathBuf::from("/gone.records"))]
        );
        assert!(sink.items.lock().unwrap().is_empty());
        assert_eq!(*sink.status.lock().unwrap(), Some(RunStatus::Failed));
    }

    #[tokio::test]
    async fn test_run_error_survives_failed_finalize() {
        let backend = MapBackend::new(vec![("/a.records", stream("a", 1))]);
        let driver = driver(
            backend,
            vec![Rule::handle("/never$", "never", echo).unwrap()],
            ReplayOptions::default(),
        );
        let sink = Arc::new(Collecting {
            fail_finalize: true,
            ..Collecting::default()
        });

        let result = driver.run(sink.clone(), &Shutdown::new()).await;
        assert!(matches!(result, Err(ReplayError::UnroutedUrl { .. })));
        assert_eq!(*sink.status.lock().unwrap(), Some(RunStatus::Failed));
    }

    #[tokio::test]
    async fn test_run_reports_failed_finalize() {
        let backend = MapBackend::new(vec![("/a.records", stream("a", 1))]);
        let driver = driver(
            backend,
            vec![Rule::handle(".*", "echo", echo).unwrap()],
            ReplayOptions::default(),
        );
        let sink = Arc::new(Collecting {
            fail_finalize: true,
            ..Collecting::default()
        });

        let result = driver.run(sink, &Shutdown::new()).await;
        assert!(matches!(result, Err(ReplayError::Output(OutputError::Write(_)))));
    }
}
