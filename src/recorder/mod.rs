use std::sync::Arc;

use anyhow::{Context, Result};

use crate::clock::Clock;
use crate::event::browser::BrowserClassifier;
use crate::event::RequestEvent;
use crate::export::health::HealthMetrics;
use crate::policy::ErrorPolicy;
use crate::queue::dimension::{BrowserDimension, DimensionRecord, PageDimension};
use crate::store::AggregateStore;

/// Unbuffered write path: merges each event straight into today's rows.
pub struct EventRecorder {
    store: Arc<AggregateStore>,
    classifier: Arc<dyn BrowserClassifier>,
    clock: Clock,
    policy: ErrorPolicy,
    health: Option<Arc<HealthMetrics>>,
}

impl EventRecorder {
    pub fn new(
        store: Arc<AggregateStore>,
        classifier: Arc<dyn BrowserClassifier>,
        clock: Clock,
        policy: ErrorPolicy,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            store,
            classifier,
            clock,
            policy,
            health,
        }
    }

    /// Adds one page view and one browser sighting for `event`.
    ///
    /// Both rows go to the store in one merge call, which is a single
    /// transaction on SQLite but one INSERT per kind on ClickHouse, where a
    /// page row can land without its browser row. Failures follow the
    /// configured [`ErrorPolicy`].
    pub async fn record(&self, event: &RequestEvent) -> Result<()> {
        let date = self.clock.today();
        let batch = [
            (DimensionRecord::Page(PageDimension::from_request(event)), 1),
            (
                DimensionRecord::Browser(BrowserDimension::from_request(
                    event,
                    self.classifier.as_ref(),
                )),
                1,
            ),
        ];

        let outcome = self
            .store
            .merge(date, &batch)
            .await
            .with_context(|| format!("recording view of {}{}", event.host, event.path));

        let stored = self.policy.apply("record", outcome)?;

        if let Some(ref health) = self.health {
            if stored {
                for (record, _) in &batch {
                    health
                        .events_recorded
                        .with_label_values(&[record.kind().as_str()])
                        .inc();
                }
            } else {
                health.events_dropped.with_label_values(&["record"]).inc();
            }
        }

        Ok(())
    }
}
