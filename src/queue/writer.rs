use std::sync::Arc;

use anyhow::{Context, Result};

use super::buffer::CounterBuffer;
use super::codec;
use super::dimension::{BrowserDimension, DimensionRecord, EventKind, PageDimension};
use crate::event::browser::BrowserClassifier;
use crate::event::RequestEvent;
use crate::export::health::HealthMetrics;
use crate::policy::ErrorPolicy;

/// Buffered write path.
///
/// Extracts both tuples from a request and bumps their counters in the
/// buffer. Never touches the aggregate store.
pub struct QueueWriter {
    buffer: Arc<CounterBuffer>,
    page_queue: String,
    browser_queue: String,
    classifier: Arc<dyn BrowserClassifier>,
    policy: ErrorPolicy,
    health: Option<Arc<HealthMetrics>>,
}

impl QueueWriter {
    pub fn new(
        buffer: Arc<CounterBuffer>,
        page_queue: impl Into<String>,
        browser_queue: impl Into<String>,
        classifier: Arc<dyn BrowserClassifier>,
        policy: ErrorPolicy,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            buffer,
            page_queue: page_queue.into(),
            browser_queue: browser_queue.into(),
            classifier,
            policy,
            health,
        }
    }

    /// Buffers one page view and one browser sighting for `event`.
    ///
    /// Under [`ErrorPolicy::LogAndContinue`] a buffer failure is logged and
    /// the event dropped; this returns `Ok` either way.
    pub async fn enqueue(&self, event: &RequestEvent) -> Result<()> {
        let page = DimensionRecord::Page(PageDimension::from_request(event));
        let browser = DimensionRecord::Browser(BrowserDimension::from_request(
            event,
            self.classifier.as_ref(),
        ));

        self.push(&self.page_queue, &page).await?;
        self.push(&self.browser_queue, &browser).await
    }

    /// Buffers one pre-built tuple.
    pub async fn enqueue_record(&self, record: &DimensionRecord) -> Result<()> {
        let queue = match record.kind() {
            EventKind::Page => &self.page_queue,
            EventKind::Browser => &self.browser_queue,
        };
        self.push(queue, record).await
    }

    async fn push(&self, queue: &str, record: &DimensionRecord) -> Result<()> {
        let kind = record.kind();
        let key = codec::encode(record);

        let outcome = self
            .buffer
            .increment(queue, &key, 1)
            .await
            .with_context(|| format!("buffering {} event in {queue}", kind.as_str()));

        let stored = self.policy.apply("enqueue", outcome)?;

        if let Some(ref health) = self.health {
            if stored {
                health
                    .events_enqueued
                    .with_label_values(&[kind.as_str()])
                    .inc();
            } else {
                health.events_dropped.with_label_values(&["enqueue"]).inc();
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::event::browser::UserAgentClassifier;
    use crate::queue::buffer::redis::RedisCounterStore;
    use crate::queue::buffer::BufferBackend;

    const FIREFOX: &str =
        "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

    fn writer(buffer: Arc<CounterBuffer>, policy: ErrorPolicy) -> QueueWriter {
        QueueWriter::new(
            buffer,
            "pages",
            "browsers",
            Arc::new(UserAgentClassifier),
            policy,
            None,
        )
    }

    fn unreachable_buffer() -> Arc<CounterBuffer> {
        let store = RedisCounterStore::new("redis://127.0.0.1:1").expect("valid url");
        Arc::new(CounterBuffer::new(
            BufferBackend::Redis(store),
            Duration::from_millis(500),
        ))
    }

    async fn entries(buffer: &CounterBuffer, queue: &str) -> Vec<(String, i64)> {
        let handle = buffer.drain(queue).await.expect("drain").expect("non-empty");
        let page = buffer.scan(&handle, 0, 100).await.expect("scan");
        assert_eq!(page.cursor, 0);
        page.entries
    }

    #[tokio::test]
    async fn test_enqueue_writes_both_queues() {
        let buffer = Arc::new(CounterBuffer::memory());
        let writer = writer(Arc::clone(&buffer), ErrorPolicy::Strict);

        let event = RequestEvent::new("Example.com", "/products")
            .with_referrer("http://Google.com/search")
            .with_query_param("utm_source", "google")
            .with_query_param("utm_medium", "cpc")
            .with_user_agent(FIREFOX);

        for _ in 0..3 {
            writer.enqueue(&event).await.expect("enqueue");
        }

        assert_eq!(
            entries(&buffer, "pages").await,
            vec![(
                "v1|example.com|/products|google.com|/search|google|cpc|~|~|~".to_string(),
                3
            )]
        );
        assert_eq!(
            entries(&buffer, "browsers").await,
            vec![("v1|example.com|Firefox|128".to_string(), 3)]
        );
    }

    #[tokio::test]
    async fn test_enqueue_without_optional_fields_keeps_arity() {
        let buffer = Arc::new(CounterBuffer::memory());
        let writer = writer(Arc::clone(&buffer), ErrorPolicy::Strict);

        writer
            .enqueue(&RequestEvent::new("site.test", "/"))
            .await
            .expect("enqueue");

        assert_eq!(
            entries(&buffer, "pages").await,
            vec![("v1|site.test|/|~|~|~|~|~|~|~".to_string(), 1)]
        );
        assert_eq!(
            entries(&buffer, "browsers").await,
            vec![("v1|site.test|Unknown Browser|0".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn test_enqueue_record_routes_by_kind() {
        let buffer = Arc::new(CounterBuffer::memory());
        let writer = writer(Arc::clone(&buffer), ErrorPolicy::Strict);

        let record = DimensionRecord::Browser(BrowserDimension {
            site: Some("site.test".to_string()),
            name: Some("Safari".to_string()),
            version: Some("17".to_string()),
        });
        writer.enqueue_record(&record).await.expect("enqueue");

        assert_eq!(buffer.len("browsers").await.expect("len"), 1);
        assert_eq!(buffer.len("pages").await.expect("len"), 0);
    }

    #[tokio::test]
    async fn test_unreachable_buffer_strict_errors() {
        let writer = writer(unreachable_buffer(), ErrorPolicy::Strict);
        let result = writer.enqueue(&RequestEvent::new("site.test", "/")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_buffer_log_and_continue_drops() {
        let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let writer = QueueWriter::new(
            unreachable_buffer(),
            "pages",
            "browsers",
            Arc::new(UserAgentClassifier),
            ErrorPolicy::LogAndContinue,
            Some(Arc::clone(&health)),
        );

        writer
            .enqueue(&RequestEvent::new("site.test", "/"))
            .await
            .expect("failure is swallowed");

        assert_eq!(
            health
                .events_dropped
                .with_label_values(&["enqueue"])
                .get(),
            2.0
        );
    }
}
