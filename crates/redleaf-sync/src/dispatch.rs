//! Subscriber fan-out for new or changed draws.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use redleaf_core::{Record, Subscriber};
use redleaf_storage::{Mailer, OutboundEmail, RecordStore, SubscriberStore};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

use redleaf_adapters::{INVITATIONS_ISSUED, SCORE_RANGE};

/// Per-source values that shape outgoing alerts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationContext {
    /// Program label used in subject and body, e.g. "OINP".
    pub program: String,
    pub preferences_url: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSummary {
    pub emailed: usize,
    pub failed: usize,
    /// Records whose notified fingerprint advanced.
    pub notified: usize,
}

pub fn render_email(
    record: &Record,
    subscriber: &Subscriber,
    ctx: &NotificationContext,
) -> OutboundEmail {
    let stream = &record.content.stream;
    let date = record
        .content
        .date_issued
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "an unknown date".to_string());
    let metric = |key: &str| {
        record
            .metric(key)
            .map(|v| v.as_display())
            .unwrap_or_else(|| "n/a".to_string())
    };
    let greeting = subscriber.full_name.as_deref().unwrap_or("there");
    let text = format!(
        "Hi {greeting},\n\n\
         A new {program} {stream} draw has been published:\n\n\
         Stream: {stream}\n\
         Date Issued: {date}\n\
         Score Range: {score}\n\
         Invitations Issued: {invitations}\n\n\
         You're receiving this email because you subscribed to draw alerts from RedLeaf Stats.\n\n\
         To unsubscribe or update your preferences, visit:\n\
         {preferences}?id={id}\n\n\
         RedLeaf Stats",
        program = ctx.program,
        score = metric(SCORE_RANGE),
        invitations = metric(INVITATIONS_ISSUED),
        preferences = ctx.preferences_url,
        id = subscriber.id,
    );
    OutboundEmail {
        to: subscriber.email.clone(),
        subject: format!("New {} {stream} draw on {date}", ctx.program),
        text,
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    records: Arc<dyn RecordStore>,
    subscribers: Arc<dyn SubscriberStore>,
    mailer: Arc<dyn Mailer>,
    send_concurrency: usize,
}

impl Dispatcher {
    pub fn new(
        records: Arc<dyn RecordStore>,
        subscribers: Arc<dyn SubscriberStore>,
        mailer: Arc<dyn Mailer>,
        send_concurrency: usize,
    ) -> Self {
        Self {
            records,
            subscribers,
            mailer,
            send_concurrency: send_concurrency.max(1),
        }
    }

    /// Delivers every eligible record. Records are handled one after another;
    /// sends within a record run concurrently and all resolve before the commit.
    pub async fn dispatch_eligible(
        &self,
        records: &[Record],
        ctx: &NotificationContext,
    ) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        let eligible: Vec<&Record> = records
            .iter()
            .filter(|r| r.is_eligible_for_notification())
            .collect();
        if eligible.is_empty() {
            return summary;
        }

        let subscribers = match self.subscribers.list_opted_in_subscribers().await {
            Ok(subscribers) => subscribers,
            Err(err) => {
                warn!(error = %err, "cannot list subscribers; eligible records stay pending");
                return summary;
            }
        };

        for record in eligible {
            let span = info_span!("dispatch_record", record_id = %record.id);
            self.dispatch_record(record, &subscribers, ctx, &mut summary)
                .instrument(span)
                .await;
        }
        summary
    }

    /// Marks eligible draws as announced without sending anything. Used by the
    /// bootstrap run that seeds an empty store.
    pub async fn acknowledge_silently(&self, records: &[Record]) -> usize {
        let mut acknowledged = 0;
        for record in records.iter().filter(|r| r.is_eligible_for_notification()) {
            match self.records.mark_notified(&record.id, &record.fingerprint).await {
                Ok(true) => acknowledged += 1,
                Ok(false) => debug!(record_id = %record.id, "fingerprint moved; not acknowledged"),
                Err(err) => warn!(record_id = %record.id, error = %err, "acknowledge failed"),
            }
        }
        acknowledged
    }

    async fn dispatch_record(
        &self,
        record: &Record,
        subscribers: &[Subscriber],
        ctx: &NotificationContext,
        summary: &mut DispatchSummary,
    ) {
        let delivered = match self
            .subscribers
            .delivered_subscriber_ids(&record.id, &record.fingerprint)
            .await
        {
            Ok(delivered) => delivered,
            Err(err) => {
                warn!(error = %err, "cannot read delivery markers; record stays pending");
                return;
            }
        };
        let pending: Vec<&Subscriber> = subscribers
            .iter()
            .filter(|s| !delivered.contains(&s.id))
            .collect();

        let sends: Vec<_> = pending
            .iter()
            .map(|s| self.deliver(record, s, ctx))
            .collect();
        let outcomes: Vec<bool> = stream::iter(sends)
            .buffer_unordered(self.send_concurrency)
            .collect()
            .await;

        if !self.mailer.is_live() {
            info!(previewed = outcomes.len(), "dry-run mailer; record stays pending");
            return;
        }
        let sent = outcomes.iter().filter(|ok| **ok).count();
        let failed = outcomes.len() - sent;
        summary.emailed += sent;
        summary.failed += failed;

        if failed > 0 {
            warn!(sent, failed, "delivery incomplete; record will be retried next run");
            return;
        }
        match self.records.mark_notified(&record.id, &record.fingerprint).await {
            Ok(true) => {
                info!(sent, skipped_already_delivered = delivered.len(), "record notified");
                summary.notified += 1;
            }
            Ok(false) => debug!("fingerprint moved since dispatch began; not committed"),
            Err(err) => warn!(error = %err, "commit of notified fingerprint failed"),
        }
    }

    async fn deliver(&self, record: &Record, subscriber: &Subscriber, ctx: &NotificationContext) -> bool {
        let email = render_email(record, subscriber, ctx);
        if let Err(err) = self.mailer.send(&email).await {
            warn!(subscriber_id = %subscriber.id, error = %err, "email delivery failed");
            return false;
        }
        if !self.mailer.is_live() {
            return true;
        }
        if let Err(err) = self
            .subscribers
            .record_delivery(&subscriber.id, &record.id, &record.fingerprint)
            .await
        {
            // The email went out; a missing marker only risks a repeat on retry.
            warn!(subscriber_id = %subscriber.id, error = %err, "delivery marker write failed");
        }
        true
    }
}
