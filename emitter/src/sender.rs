//! The per-source send loop.
//!
//! ## Metrics
//!
//! `requests_sent`: Total number of send calls made
//! `request_ok`: Successful send calls
//! `request_failure`: Failed or timed out send calls, labelled with the gRPC
//! status code
//!
//! All metrics carry a `kind` label. Source IDs are caller supplied and are
//! left out of labels to keep the series count bounded.

use std::time::Duration;

use metrics::counter;
use tracing::{info, warn};

use crate::{envelope::Kind, ingress::Ingress};

/// Number of envelopes emitted for each source ID, one per call.
pub const ENVELOPES_PER_SOURCE: u32 = 10_000;
/// Upper bound on a single send call.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause after each successful send call.
pub const PAUSE: Duration = Duration::from_millis(1);

/// Outcome of one [`Sender`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    /// Calls that Log Cache accepted
    pub sent: u32,
    /// Calls that failed or timed out
    pub failed: u32,
}

/// Emits a fixed number of envelopes for one source ID.
#[derive(Debug)]
pub struct Sender<I> {
    kind: Kind,
    source_id: String,
    client: I,
    envelopes: u32,
    metric_labels: Vec<(String, String)>,
}

impl<I> Sender<I>
where
    I: Ingress,
{
    /// Create a new [`Sender`] that will write through `client`.
    #[must_use]
    pub fn new(kind: Kind, source_id: String, client: I) -> Self {
        let metric_labels = vec![("kind".to_string(), kind.as_str().to_string())];
        Self {
            kind,
            source_id,
            client,
            envelopes: ENVELOPES_PER_SOURCE,
            metric_labels,
        }
    }

    #[cfg(test)]
    fn with_envelopes(mut self, envelopes: u32) -> Self {
        self.envelopes = envelopes;
        self
    }

    /// Run the send loop to completion.
    ///
    /// Failed calls are logged and skipped. There is no retry and a failure
    /// never ends the loop early.
    pub async fn run(mut self) -> Summary {
        info!("Emitting {} for {}", self.kind, self.source_id);

        let mut summary = Summary::default();
        for _ in 0..self.envelopes {
            let request = self.kind.request(&self.source_id);
            counter!("requests_sent", &self.metric_labels).increment(1);

            let res =
                match tokio::time::timeout(CALL_TIMEOUT, self.client.send(request, CALL_TIMEOUT))
                    .await
                {
                    Ok(res) => res,
                    Err(_) => Err(tonic::Status::deadline_exceeded(format!(
                        "send did not complete within {CALL_TIMEOUT:?}"
                    ))),
                };

            match res {
                Ok(()) => {
                    summary.sent += 1;
                    counter!("request_ok", &self.metric_labels).increment(1);
                }
                Err(status) => {
                    warn!("failed to write envelopes: {status}");
                    summary.failed += 1;
                    let mut error_labels = self.metric_labels.clone();
                    error_labels.push((
                        "error".to_string(),
                        status.code().description().to_string(),
                    ));
                    counter!("request_failure", &error_labels).increment(1);
                    continue;
                }
            }

            tokio::time::sleep(PAUSE).await;
        }

        info!(
            sent = summary.sent,
            failed = summary.failed,
            "Done emitting {} for {}",
            self.kind,
            self.source_id
        );
        summary
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::HashSet,
        sync::{Arc, Mutex},
    };

    use async_trait::async_trait;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use tokio::time::Instant;

    use super::*;
    use crate::proto::{logcache::v1::SendRequest, loggregator::v2::envelope};

    /// How a [`FakeIngress`] answers each call.
    #[derive(Debug, Clone, Copy)]
    pub(crate) enum Behavior {
        Accept,
        Reject,
        /// Reject every call whose zero-based index is a multiple of `n`.
        RejectEvery(u32),
        Hang,
    }

    #[derive(Debug, Default)]
    pub(crate) struct Recorded {
        pub(crate) calls: u32,
        pub(crate) source_ids: HashSet<String>,
        pub(crate) timeouts: HashSet<Duration>,
        pub(crate) last: Option<SendRequest>,
    }

    #[derive(Debug, Clone)]
    pub(crate) struct FakeIngress {
        pub(crate) behavior: Behavior,
        pub(crate) recorded: Arc<Mutex<Recorded>>,
    }

    impl FakeIngress {
        pub(crate) fn new(behavior: Behavior) -> Self {
            Self {
                behavior,
                recorded: Arc::new(Mutex::new(Recorded::default())),
            }
        }
    }

    #[async_trait]
    impl Ingress for FakeIngress {
        async fn send(
            &mut self,
            request: SendRequest,
            timeout: Duration,
        ) -> Result<(), tonic::Status> {
            let index = {
                let mut recorded = self.recorded.lock().unwrap();
                let index = recorded.calls;
                recorded.calls += 1;
                for env in &request.envelopes.as_ref().unwrap().batch {
                    recorded.source_ids.insert(env.source_id.clone());
                }
                recorded.timeouts.insert(timeout);
                recorded.last = Some(request);
                index
            };

            match self.behavior {
                Behavior::Accept => Ok(()),
                Behavior::Reject => Err(tonic::Status::unavailable("log cache is down")),
                Behavior::RejectEvery(n) if index % n == 0 => {
                    Err(tonic::Status::unavailable("log cache is down"))
                }
                Behavior::RejectEvery(_) => Ok(()),
                Behavior::Hang => std::future::pending().await,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn emits_ten_thousand_single_envelope_batches() {
        let ingress = FakeIngress::new(Behavior::Accept);
        let recorded = Arc::clone(&ingress.recorded);

        let start = Instant::now();
        let summary = Sender::new(Kind::Logs, "app-1".to_string(), ingress)
            .run()
            .await;

        assert_eq!(
            summary,
            Summary {
                sent: 10_000,
                failed: 0
            }
        );
        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.calls, 10_000);
        assert_eq!(recorded.source_ids.len(), 1);
        assert!(recorded.source_ids.contains("app-1"));
        assert_eq!(
            recorded.timeouts.iter().copied().collect::<Vec<_>>(),
            vec![CALL_TIMEOUT]
        );
        let last = recorded.last.as_ref().unwrap();
        let batch = &last.envelopes.as_ref().unwrap().batch;
        assert_eq!(batch.len(), 1);
        assert!(matches!(batch[0].message, Some(envelope::Message::Log(_))));
        // One pause per successful call.
        assert!(start.elapsed() >= PAUSE * 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_skipped_without_pausing() {
        let ingress = FakeIngress::new(Behavior::Reject);
        let recorded = Arc::clone(&ingress.recorded);

        let start = Instant::now();
        let summary = Sender::new(Kind::Gauges, "app-2".to_string(), ingress)
            .with_envelopes(50)
            .run()
            .await;

        assert_eq!(summary, Summary { sent: 0, failed: 50 });
        assert_eq!(recorded.lock().unwrap().calls, 50);
        assert!(start.elapsed() < PAUSE);
    }

    #[tokio::test(start_paused = true)]
    async fn intermittent_failures_do_not_stop_the_loop() {
        let ingress = FakeIngress::new(Behavior::RejectEvery(4));
        let summary = Sender::new(Kind::Gauges, "app-3".to_string(), ingress)
            .with_envelopes(100)
            .run()
            .await;

        assert_eq!(summary, Summary { sent: 75, failed: 25 });
    }

    #[tokio::test(start_paused = true)]
    async fn hung_calls_time_out() {
        let ingress = FakeIngress::new(Behavior::Hang);
        let recorded = Arc::clone(&ingress.recorded);

        let start = Instant::now();
        let summary = Sender::new(Kind::Logs, "app-4".to_string(), ingress)
            .with_envelopes(3)
            .run()
            .await;

        assert_eq!(summary, Summary { sent: 0, failed: 3 });
        assert_eq!(recorded.lock().unwrap().calls, 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= CALL_TIMEOUT * 3);
        assert!(elapsed < CALL_TIMEOUT * 4);
    }

    #[tokio::test(start_paused = true)]
    async fn counters_are_labelled_by_kind_only() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let ingress = FakeIngress::new(Behavior::RejectEvery(2));
        Sender::new(Kind::Gauges, "app-5".to_string(), ingress)
            .with_envelopes(10)
            .run()
            .await;

        let mut totals = std::collections::HashMap::new();
        for (key, _, _, value) in snapshotter.snapshot().into_vec() {
            let key = key.key();
            assert!(key.labels().all(|l| l.key() != "source_id"));
            assert!(
                key.labels()
                    .any(|l| l.key() == "kind" && l.value() == "gauges")
            );
            if let DebugValue::Counter(v) = value {
                *totals.entry(key.name().to_string()).or_insert(0) += v;
            }
        }
        assert_eq!(totals.get("requests_sent"), Some(&10));
        assert_eq!(totals.get("request_ok"), Some(&5));
        assert_eq!(totals.get("request_failure"), Some(&5));
    }
}
