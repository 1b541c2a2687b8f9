//! Lightweight telemetry helpers for Omnibox services.
//! Provides the shared tracing-subscriber install plus small metric
//! recorders and label structs used across the pipeline crates.

use anyhow::Result;
use tracing::Span;
use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber configured from `RUST_LOG`, tagging records
/// with the service name.
pub fn install(service_name: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .map_err(|err| anyhow::anyhow!("install tracing subscriber: {err}"))?;
    tracing::info!(service = %service_name, "telemetry installed");
    Ok(())
}

/// Common label set attached to pipeline metrics.
#[derive(Debug, Clone)]
pub struct TelemetryLabels {
    pub org: String,
    pub channel: Option<String>,
    pub queue: Option<String>,
    pub extra: Vec<(String, String)>,
}

impl TelemetryLabels {
    pub fn new(org: impl Into<String>) -> Self {
        Self {
            org: org.into(),
            channel: None,
            queue: None,
            extra: Vec::new(),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    fn tags(&self) -> Vec<metrics::Label> {
        let mut tags = Vec::with_capacity(3 + self.extra.len());
        tags.push(metrics::Label::new("org", self.org.clone()));
        if let Some(channel) = &self.channel {
            tags.push(metrics::Label::new("channel", channel.clone()));
        }
        if let Some(queue) = &self.queue {
            tags.push(metrics::Label::new("queue", queue.clone()));
        }
        for (key, value) in &self.extra {
            tags.push(metrics::Label::new(key.clone(), value.clone()));
        }
        tags
    }
}

pub fn record_counter(name: &'static str, value: u64, labels: &TelemetryLabels) {
    metrics::counter!(name, labels.tags()).increment(value);
}

pub fn record_histogram(name: &'static str, value: f64, labels: &TelemetryLabels) {
    metrics::histogram!(name, labels.tags()).record(value);
}

pub fn record_gauge(name: &'static str, value: f64, labels: &TelemetryLabels) {
    metrics::gauge!(name, labels.tags()).set(value);
}

/// Records shared span fields when they only become known mid-request.
pub fn with_common_fields(span: &Span, org: &str, msg_id: Option<&str>) {
    span.record("org", tracing::field::display(org));
    if let Some(msg_id) = msg_id {
        span.record("msg_id", tracing::field::display(msg_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_collect_tags_in_order() {
        let mut labels = TelemetryLabels::new("org-1")
            .with_channel("messenger")
            .with_queue("email-send");
        labels.extra.push(("code".into(), "E_SEND".into()));
        let tags = labels.tags();
        assert_eq!(tags[0], metrics::Label::new("org", "org-1"));
        assert_eq!(tags[1], metrics::Label::new("channel", "messenger"));
        assert_eq!(tags[2], metrics::Label::new("queue", "email-send"));
        assert_eq!(tags[3], metrics::Label::new("code", "E_SEND"));
    }
}
