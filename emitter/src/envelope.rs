//! Construction of the synthetic envelopes pushed into Log Cache.
//!
//! Every request carries a batch of exactly one envelope. The content is
//! fixed per [`Kind`], only the timestamp and source ID vary.

use std::{
    collections::HashMap,
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::proto::{
    logcache::v1::SendRequest,
    loggregator::v2::{Envelope, EnvelopeBatch, Gauge, GaugeValue, Log, envelope, log},
};

/// Payload of every emitted log envelope.
pub const LOG_PAYLOAD: &[u8] = b"log message";
/// Name of the single metric in every emitted gauge envelope.
pub const GAUGE_METRIC_NAME: &str = "metric";
/// Value of [`GAUGE_METRIC_NAME`].
pub const GAUGE_METRIC_VALUE: f64 = 10.0;
/// Unit of [`GAUGE_METRIC_NAME`].
pub const GAUGE_METRIC_UNIT: &str = "ms";

/// The flavor of envelope to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Log lines written to stdout
    Logs,
    /// Single-metric gauge readings
    Gauges,
}

impl Kind {
    /// Label value used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Logs => "logs",
            Kind::Gauges => "gauges",
        }
    }

    /// Build one envelope of this kind.
    #[must_use]
    pub fn envelope(self, source_id: &str, timestamp: i64) -> Envelope {
        let message = match self {
            Kind::Logs => envelope::Message::Log(Log {
                payload: LOG_PAYLOAD.to_vec(),
                r#type: log::Type::Out.into(),
            }),
            Kind::Gauges => {
                let mut metrics = HashMap::with_capacity(1);
                metrics.insert(
                    GAUGE_METRIC_NAME.to_string(),
                    GaugeValue {
                        unit: GAUGE_METRIC_UNIT.to_string(),
                        value: GAUGE_METRIC_VALUE,
                    },
                );
                envelope::Message::Gauge(Gauge { metrics })
            }
        };

        Envelope {
            timestamp,
            source_id: source_id.to_string(),
            message: Some(message),
            ..Envelope::default()
        }
    }

    /// Build a single-envelope send request stamped with the current time.
    #[must_use]
    pub fn request(self, source_id: &str) -> SendRequest {
        SendRequest {
            envelopes: Some(EnvelopeBatch {
                batch: vec![self.envelope(source_id, now_nanos())],
            }),
            local_only: false,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Logs => write!(f, "Logs"),
            Kind::Gauges => write!(f, "Gauges"),
        }
    }
}

/// Wall-clock time as nanoseconds since the Unix epoch. A clock set before
/// the epoch reads as zero.
#[allow(clippy::cast_possible_truncation)]
fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
