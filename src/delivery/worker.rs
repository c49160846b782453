use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::delivery::queue::JobQueue;
use crate::delivery::records::DeliveryRecordStore;
use crate::delivery::senders::{ChannelSender, SendError};
use crate::models::payloads::{Channel, OutgoingJob};
use crate::streams::{self, StreamConsumer};

const MAX_BACKOFF_EXPONENT: u32 = 10;
const DEFER_DELAY: Duration = Duration::from_millis(500);
const PROMOTE_INTERVAL: Duration = Duration::from_millis(500);
const PROMOTE_BATCH: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total send attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// `base * 2^attempt`, stretched by up to 20% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = 2u32.saturating_pow(attempt.min(MAX_BACKOFF_EXPONENT));
        let jitter: f64 = rand::thread_rng().gen_range(0.0..=0.2);
        self.base_delay.saturating_mul(exp).mul_f64(1.0 + jitter)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Sent(String),
    Fatal(String),
    Retry { attempt: u32, delay: Duration },
    /// Channel saturated; requeued without consuming an attempt.
    Deferred,
    Exhausted(String),
}

pub struct DeliveryWorker {
    senders: HashMap<Channel, Arc<dyn ChannelSender>>,
    limits: HashMap<Channel, Arc<Semaphore>>,
    records: Arc<dyn DeliveryRecordStore>,
    queue: Arc<dyn JobQueue>,
    policy: RetryPolicy,
}

impl DeliveryWorker {
    pub fn new(
        senders: Vec<Arc<dyn ChannelSender>>,
        records: Arc<dyn DeliveryRecordStore>,
        queue: Arc<dyn JobQueue>,
        per_channel: usize,
        policy: RetryPolicy,
    ) -> Self {
        let senders: HashMap<_, _> = senders.into_iter().map(|s| (s.channel(), s)).collect();
        let limits = Channel::ALL
            .iter()
            .map(|c| (*c, Arc::new(Semaphore::new(per_channel.max(1)))))
            .collect();
        Self {
            senders,
            limits,
            records,
            queue,
            policy,
        }
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.senders.keys().copied().collect();
        channels.sort_by_key(|c| c.as_str());
        channels
    }

    pub async fn handle(&self, job: OutgoingJob) -> JobOutcome {
        let temp_id = job.temp_id;
        let attempts = job.attempt as i32 + 1;

        let Some(sender) = self.senders.get(&job.channel) else {
            let reason = format!("no sender configured for {}", job.channel);
            warn!(temp_id = %temp_id, channel = %job.channel, "Dropping job for unconfigured channel");
            self.note(self.records.mark_error(temp_id, &reason, attempts).await, &job);
            return JobOutcome::Fatal(reason);
        };

        // A slow channel fills its own slots only; jobs for it wait in the queue.
        let permit = match self.limits.get(&job.channel).map(|s| s.clone().try_acquire_owned()) {
            Some(Ok(permit)) => Some(permit),
            Some(Err(_)) => {
                info!(temp_id = %temp_id, channel = %job.channel, "Channel saturated, deferring job");
                self.requeue(job, self.policy.base_delay.min(DEFER_DELAY)).await;
                return JobOutcome::Deferred;
            }
            None => None,
        };

        let result = sender.send(&job).await;
        drop(permit);

        match result {
            Ok(provider_id) => {
                info!(
                    temp_id = %temp_id,
                    channel = %job.channel,
                    provider_message_id = provider_id,
                    attempt = attempts,
                    "Message delivered"
                );
                self.note(self.records.mark_sent(temp_id, &provider_id, attempts).await, &job);
                JobOutcome::Sent(provider_id)
            }
            Err(SendError::Fatal(reason)) => {
                warn!(temp_id = %temp_id, channel = %job.channel, error = reason, "Delivery failed permanently");
                self.note(self.records.mark_error(temp_id, &reason, attempts).await, &job);
                JobOutcome::Fatal(reason)
            }
            Err(SendError::Transient(reason)) => {
                self.note(self.records.mark_error(temp_id, &reason, attempts).await, &job);
                if attempts as u32 >= self.policy.max_attempts {
                    error!(
                        temp_id = %temp_id,
                        channel = %job.channel,
                        attempts,
                        error = reason,
                        "Delivery failed after exhausting retries"
                    );
                    return JobOutcome::Exhausted(reason);
                }
                let delay = self.policy.backoff(job.attempt);
                let next = OutgoingJob {
                    attempt: job.attempt + 1,
                    ..job
                };
                warn!(
                    temp_id = %temp_id,
                    channel = %next.channel,
                    attempt = next.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = reason,
                    "Transient delivery failure, retrying"
                );
                let attempt = next.attempt;
                self.requeue(next, delay).await;
                JobOutcome::Retry { attempt, delay }
            }
        }
    }

    /// Puts the job back before the stream entry is acknowledged. Delayed
    /// jobs go to the durable schedule, so a restart does not lose them.
    async fn requeue(&self, job: OutgoingJob, delay: Duration) {
        let result = if delay.is_zero() {
            self.queue.push(&job).await
        } else {
            let due = TimeDelta::from_std(delay)
                .ok()
                .and_then(|d| Utc::now().checked_add_signed(d))
                .unwrap_or_else(Utc::now);
            self.queue.schedule(&job, due).await
        };
        if let Err(e) = result {
            error!(temp_id = %job.temp_id, error = %e, "Failed to requeue job");
        }
    }

    /// Releases scheduled jobs onto the stream as they fall due.
    pub async fn promote_scheduled(&self) -> anyhow::Result<usize> {
        self.queue.promote_due(Utc::now(), PROMOTE_BATCH).await
    }

    fn note(&self, result: anyhow::Result<()>, job: &OutgoingJob) {
        if let Err(e) = result {
            error!(temp_id = %job.temp_id, error = %e, "Failed to update delivery record");
        }
    }
}

/// Consumes the outgoing stream until the connection fails for good, while
/// a companion loop moves scheduled jobs onto it.
pub async fn run(worker: Arc<DeliveryWorker>, consumer: StreamConsumer, prefetch: usize) -> anyhow::Result<()> {
    info!(channels = ?worker.channels(), prefetch, "Delivery worker started");
    let promoter = {
        let worker = worker.clone();
        async move {
            let mut ticker = tokio::time::interval(PROMOTE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = worker.promote_scheduled().await {
                    warn!(error = %e, "Failed to release scheduled jobs");
                }
            }
        }
    };
    let consume = streams::run(consumer, prefetch, move |payload: String| {
        let worker = worker.clone();
        async move {
            match serde_json::from_str::<OutgoingJob>(&payload) {
                Ok(job) => {
                    worker.handle(job).await;
                }
                Err(e) => error!(payload, error = %e, "Failed to parse outgoing job"),
            }
        }
    });

    tokio::select! {
        result = consume => result,
        _ = promoter => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::queue::MemoryJobQueue;
    use crate::delivery::records::MemoryDeliveryRecords;
    use crate::models::db::{DeliveryRecord, DeliveryStatus};
    use crate::models::flow::MessageKind;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Replays a scripted list of results, then succeeds.
    struct ScriptedSender {
        channel: Channel,
        results: Mutex<Vec<Result<String, SendError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedSender {
        fn new(channel: Channel, results: Vec<Result<String, SendError>>) -> Arc<Self> {
            Arc::new(Self {
                channel,
                results: Mutex::new(results),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ChannelSender for ScriptedSender {
        fn channel(&self) -> Channel {
            self.channel
        }

        async fn send(&self, _job: &OutgoingJob) -> Result<String, SendError> {
            *self.calls.lock().unwrap() += 1;
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                Ok("wamid.ok".into())
            } else {
                results.remove(0)
            }
        }
    }

    /// Never returns, holding its channel slot.
    struct StuckSender;

    #[async_trait]
    impl ChannelSender for StuckSender {
        fn channel(&self) -> Channel {
            Channel::Telegram
        }

        async fn send(&self, _job: &OutgoingJob) -> Result<String, SendError> {
            std::future::pending().await
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
        }
    }

    async fn pending_job(records: &MemoryDeliveryRecords, channel: Channel) -> OutgoingJob {
        let temp_id = Uuid::new_v4();
        records
            .insert_pending(&DeliveryRecord {
                temp_id,
                channel: channel.as_str().into(),
                recipient: "5511".into(),
                user_id: format!("{channel}:5511"),
                kind: "text".into(),
                content: json!({"type": "text"}),
                status: DeliveryStatus::Pending,
                provider_message_id: None,
                error: None,
                attempts: 0,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        OutgoingJob {
            temp_id,
            channel,
            to: "5511".into(),
            user_id: format!("{channel}:5511"),
            kind: MessageKind::Text,
            content: json!({"type": "text"}),
            context: None,
            attempt: 0,
        }
    }

    #[tokio::test]
    async fn success_marks_record_sent() {
        let records = Arc::new(MemoryDeliveryRecords::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let sender = ScriptedSender::new(Channel::Whatsapp, vec![]);
        let worker = DeliveryWorker::new(vec![sender.clone() as Arc<dyn ChannelSender>], records.clone(), queue.clone(), 4, policy(3));

        let job = pending_job(&records, Channel::Whatsapp).await;
        assert_eq!(worker.handle(job.clone()).await, JobOutcome::Sent("wamid.ok".into()));

        let record = records.get(job.temp_id).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Sent);
        assert_eq!(record.provider_message_id.as_deref(), Some("wamid.ok"));
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn fatal_is_never_requeued() {
        let records = Arc::new(MemoryDeliveryRecords::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let sender = ScriptedSender::new(Channel::Whatsapp, vec![Err(SendError::Fatal("blocked recipient".into()))]);
        let worker = DeliveryWorker::new(vec![sender.clone() as Arc<dyn ChannelSender>], records.clone(), queue.clone(), 4, policy(5));

        let job = pending_job(&records, Channel::Whatsapp).await;
        let outcome = worker.handle(job.clone()).await;

        assert_eq!(outcome, JobOutcome::Fatal("blocked recipient".into()));
        assert_eq!(queue.len().await, 0);
        assert_eq!(sender.calls(), 1);
        let record = records.get(job.temp_id).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Error);
        assert_eq!(record.error.as_deref(), Some("blocked recipient"));
    }

    #[tokio::test]
    async fn transient_retries_until_max_attempts() {
        let records = Arc::new(MemoryDeliveryRecords::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let failures = (0..5).map(|_| Err(SendError::Transient("HTTP 503".into()))).collect();
        let sender = ScriptedSender::new(Channel::Telegram, failures);
        let worker = DeliveryWorker::new(vec![sender.clone() as Arc<dyn ChannelSender>], records.clone(), queue.clone(), 4, policy(3));

        let job = pending_job(&records, Channel::Telegram).await;
        let mut outcomes = vec![worker.handle(job.clone()).await];
        while let Some(next) = queue.pop().await {
            outcomes.push(worker.handle(next).await);
        }

        assert_eq!(
            outcomes,
            vec![
                JobOutcome::Retry { attempt: 1, delay: Duration::ZERO },
                JobOutcome::Retry { attempt: 2, delay: Duration::ZERO },
                JobOutcome::Exhausted("HTTP 503".into()),
            ]
        );
        assert_eq!(sender.calls(), 3);
        let record = records.get(job.temp_id).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Error);
        assert_eq!(record.attempts, 3);
    }

    #[tokio::test]
    async fn transient_then_success_ends_sent() {
        let records = Arc::new(MemoryDeliveryRecords::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let sender = ScriptedSender::new(Channel::Webchat, vec![Err(SendError::Transient("timeout".into()))]);
        let worker = DeliveryWorker::new(vec![sender.clone() as Arc<dyn ChannelSender>], records.clone(), queue.clone(), 4, policy(3));

        let job = pending_job(&records, Channel::Webchat).await;
        worker.handle(job.clone()).await;
        let retry = queue.pop().await.unwrap();
        assert_eq!(retry.attempt, 1);
        assert_eq!(worker.handle(retry).await, JobOutcome::Sent("wamid.ok".into()));

        let record = records.get(job.temp_id).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Sent);
        assert_eq!(record.error, None);
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test]
    async fn delayed_retry_is_durable_before_handle_returns() {
        let records = Arc::new(MemoryDeliveryRecords::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let sender = ScriptedSender::new(Channel::Whatsapp, vec![Err(SendError::Transient("HTTP 503".into()))]);
        let retry_policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        };
        let worker = DeliveryWorker::new(vec![sender.clone() as Arc<dyn ChannelSender>], records.clone(), queue.clone(), 4, retry_policy);

        let job = pending_job(&records, Channel::Whatsapp).await;
        let before = Utc::now();
        let outcome = worker.handle(job.clone()).await;
        assert!(matches!(outcome, JobOutcome::Retry { attempt: 1, .. }));

        assert_eq!(queue.len().await, 0);
        let scheduled = queue.scheduled().await;
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].1.temp_id, job.temp_id);
        assert_eq!(scheduled[0].1.attempt, 1);
        assert!(scheduled[0].0 >= before + TimeDelta::seconds(2));

        assert_eq!(queue.promote_due(Utc::now() + TimeDelta::seconds(10), 10).await.unwrap(), 1);
        let retry = queue.pop().await.unwrap();
        assert_eq!(worker.handle(retry).await, JobOutcome::Sent("wamid.ok".into()));
        assert_eq!(records.get(job.temp_id).await.unwrap().unwrap().status, DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn missing_sender_is_fatal() {
        let records = Arc::new(MemoryDeliveryRecords::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let worker = DeliveryWorker::new(vec![], records.clone(), queue.clone(), 4, policy(3));

        let job = pending_job(&records, Channel::Telegram).await;
        assert!(matches!(worker.handle(job).await, JobOutcome::Fatal(_)));
        assert_eq!(queue.len().await, 0);
    }

    #[tokio::test]
    async fn saturated_channel_defers_without_blocking_others() {
        let records = Arc::new(MemoryDeliveryRecords::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let whatsapp = ScriptedSender::new(Channel::Whatsapp, vec![]);
        let worker = Arc::new(DeliveryWorker::new(
            vec![Arc::new(StuckSender) as Arc<dyn ChannelSender>, whatsapp.clone()],
            records.clone(),
            queue.clone(),
            1,
            policy(3),
        ));

        let stuck = pending_job(&records, Channel::Telegram).await;
        let background = worker.clone();
        let handle = tokio::spawn(async move { background.handle(stuck).await });
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let second = pending_job(&records, Channel::Telegram).await;
        assert_eq!(worker.handle(second.clone()).await, JobOutcome::Deferred);
        let deferred = queue.pop().await.unwrap();
        assert_eq!(deferred.attempt, 0);
        assert_eq!(deferred.temp_id, second.temp_id);

        let other = pending_job(&records, Channel::Whatsapp).await;
        assert_eq!(worker.handle(other).await, JobOutcome::Sent("wamid.ok".into()));
        handle.abort();
    }

    #[test]
    fn backoff_grows_with_bounded_jitter() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
        };
        for attempt in 0..4 {
            let delay = policy.backoff(attempt);
            let floor = Duration::from_millis(1000 * 2u64.pow(attempt));
            assert!(delay >= floor && delay <= floor.mul_f64(1.2), "attempt {attempt}: {delay:?}");
        }
    }
}
