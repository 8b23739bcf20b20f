//! Activity delivery
//!
//! Outbound activities are queued, then fanned out to every recipient
//! inbox. Each recipient retries independently with linear backoff and a
//! freshly signed request per attempt.

use chrono::{DateTime, Utc};
use rsa::RsaPrivateKey;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use super::directory::ActorDirectory;
use super::handle::parse_handle;
use super::keys;
use super::objects::{ACTIVITY_STREAMS_CONTENT_TYPE, Activity, PUBLIC_COLLECTION};
use super::signature::{SignatureHeaders, sign_request};
use super::transport::{OutboundRequest, Transport};
use crate::config::FederationConfig;
use crate::data::LocalActor;
use crate::error::{AppError, Result};
use crate::metrics::{
    ACTIVITIES_SENT, DEAD_LETTERS_TOTAL, DELIVERIES_IN_FLIGHT, DELIVERY_ATTEMPTS_TOTAL,
};

// =============================================================================
// Signing identity
// =============================================================================

/// Sending actor's key material, loaded once per fan-out
#[derive(Clone)]
pub struct Signer {
    pub actor_id: String,
    pub key_id: String,
    key: Arc<RsaPrivateKey>,
}

impl Signer {
    pub fn new(actor_id: impl Into<String>, key_id: impl Into<String>, key: RsaPrivateKey) -> Self {
        Self {
            actor_id: actor_id.into(),
            key_id: key_id.into(),
            key: Arc::new(key),
        }
    }

    /// Load the private key stored next to the actor's public key
    ///
    /// # Errors
    /// `MissingPrivateKey` if the key file is gone
    pub async fn for_actor(actor: &LocalActor) -> Result<Self> {
        let key = keys::load_private_key(Path::new(&actor.public_key_path)).await?;
        Ok(Self::new(actor.id.clone(), actor.key_id(), key))
    }

    pub fn sign(&self, method: &str, url: &str) -> Result<SignatureHeaders> {
        sign_request(method, url, &self.key, &self.key_id)
    }
}

// =============================================================================
// Retry policy
// =============================================================================

/// Linear backoff: attempt `n` (0-indexed) waits `n * step` first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub step: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &FederationConfig) -> Self {
        Self {
            max_attempts: config.max_delivery_attempts,
            step: config.retry_step(),
        }
    }

    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.step * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            step: Duration::from_secs(60),
        }
    }
}

/// How a single attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Delivered,
    /// Retrying identical bytes cannot help
    Terminal,
    Transient,
}

impl AttemptOutcome {
    fn label(self) -> &'static str {
        match self {
            AttemptOutcome::Delivered => "delivered",
            AttemptOutcome::Terminal => "terminal",
            AttemptOutcome::Transient => "transient",
        }
    }
}

/// Classify an inbox response status
pub fn classify(status: u16) -> AttemptOutcome {
    match status {
        200..=299 => AttemptOutcome::Delivered,
        400 | 401 | 403 => AttemptOutcome::Terminal,
        _ => AttemptOutcome::Transient,
    }
}

/// Final result for one recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    Delivered { attempts: u32 },
    Rejected { status: u16, attempts: u32 },
    Exhausted { attempts: u32, last_error: String },
}

impl DeliveryResult {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryResult::Delivered { .. })
    }

    fn failure_reason(&self) -> Option<String> {
        match self {
            DeliveryResult::Delivered { .. } => None,
            DeliveryResult::Rejected { status, .. } => {
                Some(format!("rejected with HTTP {}", status))
            }
            DeliveryResult::Exhausted {
                attempts,
                last_error,
            } => Some(format!("gave up after {} attempts: {}", attempts, last_error)),
        }
    }
}

// =============================================================================
// Single-inbox delivery
// =============================================================================

/// Delivers one body to one inbox, retrying per [`RetryPolicy`]
#[derive(Clone)]
pub struct Deliverer {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl Deliverer {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    /// Deliver activity to a single inbox
    ///
    /// Never returns early on transient failures; the caller only learns
    /// the final outcome.
    pub async fn deliver(&self, inbox: &str, body: &[u8], signer: &Signer) -> DeliveryResult {
        let mut last_error = String::from("no attempt made");

        for attempt in 0..self.policy.max_attempts {
            let delay = self.policy.delay_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let attempts = attempt + 1;

            let headers = match signer.sign("POST", inbox) {
                Ok(headers) => headers,
                Err(error) => {
                    tracing::warn!(inbox, %error, "Cannot sign delivery");
                    return DeliveryResult::Exhausted {
                        attempts,
                        last_error: error.to_string(),
                    };
                }
            };

            let request = OutboundRequest::post(inbox, body.to_vec())
                .header("Content-Type", ACTIVITY_STREAMS_CONTENT_TYPE)
                .header("Date", headers.date)
                .header("Signature", headers.signature)
                .header("Host", headers.host);

            let outcome = match self.transport.execute(request).await {
                Ok(response) => {
                    let outcome = classify(response.status);
                    tracing::debug!(inbox, attempt = attempts, status = response.status, "Delivery attempt");
                    match outcome {
                        AttemptOutcome::Delivered => {
                            DELIVERY_ATTEMPTS_TOTAL
                                .with_label_values(&[outcome.label()])
                                .inc();
                            return DeliveryResult::Delivered { attempts };
                        }
                        AttemptOutcome::Terminal => {
                            DELIVERY_ATTEMPTS_TOTAL
                                .with_label_values(&[outcome.label()])
                                .inc();
                            return DeliveryResult::Rejected {
                                status: response.status,
                                attempts,
                            };
                        }
                        AttemptOutcome::Transient => {
                            last_error = format!("HTTP {}", response.status);
                            outcome
                        }
                    }
                }
                Err(error) => {
                    tracing::debug!(inbox, attempt = attempts, %error, "Delivery attempt failed");
                    last_error = error.to_string();
                    AttemptOutcome::Transient
                }
            };

            DELIVERY_ATTEMPTS_TOTAL
                .with_label_values(&[outcome.label()])
                .inc();
        }

        DeliveryResult::Exhausted {
            attempts: self.policy.max_attempts,
            last_error,
        }
    }
}

// =============================================================================
// Recipients
// =============================================================================

/// Distinct recipients of `activity` that should be contacted
///
/// Skips the sender, the public collection and `main` actors.
pub fn delivery_targets(activity: &Activity, sender_id: &str) -> Vec<String> {
    activity
        .recipients()
        .into_iter()
        .filter(|recipient| recipient != sender_id && recipient != PUBLIC_COLLECTION)
        .filter(|recipient| match parse_handle(recipient) {
            Some(handle) => !handle.is_main(),
            None => {
                tracing::debug!(recipient = %recipient, "Skipping unparsable recipient");
                false
            }
        })
        .collect()
}

// =============================================================================
// Queue
// =============================================================================

/// Delivery that was given up on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub activity_id: String,
    pub recipient: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Activity waiting for fan-out
struct DeliveryJob {
    activity: Activity,
    sender: LocalActor,
}

struct Shared {
    deliverer: Deliverer,
    directory: Arc<ActorDirectory>,
    pacing: Duration,
    in_flight: AtomicUsize,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    dead_letter_capacity: usize,
}

impl Shared {
    fn record_dead_letter(&self, activity_id: &str, recipient: &str, reason: String) {
        tracing::warn!(activity = activity_id, recipient, reason = %reason, "Delivery dropped");
        DEAD_LETTERS_TOTAL.inc();

        if let Ok(mut dead_letters) = self.dead_letters.lock() {
            if dead_letters.len() >= self.dead_letter_capacity {
                dead_letters.pop_front();
            }
            dead_letters.push_back(DeadLetter {
                activity_id: activity_id.to_string(),
                recipient: recipient.to_string(),
                reason,
                at: Utc::now(),
            });
        }
    }
}

/// Counts a recipient delivery as in flight until dropped
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        DELIVERIES_IN_FLIGHT.inc();
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
        DELIVERIES_IN_FLIGHT.dec();
    }
}

/// Bounded outbound queue drained by one worker
///
/// `enqueue` never waits for delivery. Failures after the last retry end up
/// in [`DeliveryQueue::dead_letters`].
pub struct DeliveryQueue {
    sender: Mutex<Option<mpsc::Sender<DeliveryJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl DeliveryQueue {
    /// Spawn the worker
    pub fn start(
        deliverer: Deliverer,
        directory: Arc<ActorDirectory>,
        config: &FederationConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.delivery_queue_capacity.max(1));
        let shared = Arc::new(Shared {
            deliverer,
            directory,
            pacing: config.pacing(),
            in_flight: AtomicUsize::new(0),
            dead_letters: Mutex::new(VecDeque::new()),
            dead_letter_capacity: config.dead_letter_capacity.max(1),
        });

        let worker = tokio::spawn(run_worker(receiver, shared.clone()));

        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            shared,
        }
    }

    /// Queue `activity` for delivery as `sender`
    ///
    /// # Errors
    /// Returns error if the queue is full or shut down
    pub fn enqueue(&self, activity: Activity, sender: LocalActor) -> Result<()> {
        let kind = activity.kind.to_string();
        let guard = self
            .sender
            .lock()
            .map_err(|_| AppError::Internal(anyhow::anyhow!("delivery queue poisoned")))?;
        let Some(channel) = guard.as_ref() else {
            return Err(AppError::Federation("Delivery queue is shut down".to_string()));
        };

        channel
            .try_send(DeliveryJob { activity, sender })
            .map_err(|error| match error {
                mpsc::error::TrySendError::Full(_) => {
                    AppError::Federation("Delivery queue is full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    AppError::Federation("Delivery queue is shut down".to_string())
                }
            })?;

        ACTIVITIES_SENT.with_label_values(&[&kind]).inc();
        Ok(())
    }

    /// Recipient deliveries running or waiting to retry
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Most recent dropped deliveries, oldest first
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared
            .dead_letters
            .lock()
            .map(|dead_letters| dead_letters.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Stop accepting work, wait up to `grace`, then abort what remains
    pub async fn shutdown(&self, grace: Duration) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }

        let worker = self.worker.lock().ok().and_then(|mut worker| worker.take());
        let Some(mut worker) = worker else {
            return;
        };

        match tokio::time::timeout(grace, &mut worker).await {
            Ok(_) => tracing::info!("Delivery queue drained"),
            Err(_) => {
                tracing::warn!(
                    in_flight = self.in_flight(),
                    "Delivery queue did not drain in time; aborting remaining deliveries"
                );
                worker.abort();
            }
        }
    }
}

async fn run_worker(mut receiver: mpsc::Receiver<DeliveryJob>, shared: Arc<Shared>) {
    let mut fan_outs = JoinSet::new();

    while let Some(job) = receiver.recv().await {
        while fan_outs.try_join_next().is_some() {}
        fan_outs.spawn(fan_out(job, shared.clone()));
    }

    while fan_outs.join_next().await.is_some() {}
}

async fn fan_out(job: DeliveryJob, shared: Arc<Shared>) {
    let DeliveryJob { activity, sender } = job;
    let targets = delivery_targets(&activity, &sender.id);
    if targets.is_empty() {
        return;
    }

    let signer = match Signer::for_actor(&sender).await {
        Ok(signer) => signer,
        Err(error) => {
            for recipient in &targets {
                shared.record_dead_letter(&activity.id, recipient, error.to_string());
            }
            return;
        }
    };

    let body = match serde_json::to_vec(&activity) {
        Ok(body) => Arc::new(body),
        Err(error) => {
            tracing::error!(activity = %activity.id, %error, "Failed to serialize activity");
            return;
        }
    };

    tracing::info!(
        activity = %activity.id,
        kind = %activity.kind,
        recipients = targets.len(),
        "Delivering activity"
    );

    let mut deliveries = JoinSet::new();
    for (index, recipient) in targets.into_iter().enumerate() {
        if index > 0 && !shared.pacing.is_zero() {
            tokio::time::sleep(shared.pacing).await;
        }

        let shared = shared.clone();
        let signer = signer.clone();
        let body = body.clone();
        let activity_id = activity.id.clone();

        deliveries.spawn(async move {
            let _in_flight = InFlight::enter(&shared.in_flight);
            let inbox = shared.directory.inbox_for(&recipient).await;
            let result = shared.deliverer.deliver(&inbox, &body, &signer).await;

            match result.failure_reason() {
                None => tracing::debug!(inbox = %inbox, "Delivered"),
                Some(reason) => shared.record_dead_letter(&activity_id, &recipient, reason),
            }
        });
    }

    while deliveries.join_next().await.is_some() {}
}

// =============================================================================
// Activity builders
// =============================================================================

/// Constructors for the activities this instance sends
pub mod builder {
    use crate::federation::objects::{Activity, ActivityType, ObjectBase};

    /// `actor_id` asks to follow `target_id`
    pub fn follow(actor_id: &str, target_id: &str) -> Activity {
        let mut activity = Activity::new(ActivityType::Follow, actor_id);
        activity.object = Some(ObjectBase {
            id: target_id.to_string(),
            actor: target_id.to_string(),
            ..ObjectBase::default()
        });
        activity.to = vec![target_id.to_string()];
        activity
    }

    /// The Follow being answered, as nested in Accept and Reject
    fn answered_follow(follow_id: &str, requester_id: &str, target_id: &str) -> ObjectBase {
        ObjectBase {
            kind: ActivityType::Follow.to_string(),
            id: follow_id.to_string(),
            actor: requester_id.to_string(),
            object: Some(Box::new(ObjectBase {
                kind: ActivityType::Follow.to_string(),
                actor: target_id.to_string(),
                ..ObjectBase::default()
            })),
            ..ObjectBase::default()
        }
    }

    /// `target_id` accepts a Follow from `requester_id`
    ///
    /// `summary` is `<requester> Follow <target>` or, for a toggle,
    /// `<requester> Unfollow <target>`.
    pub fn accept(follow_id: &str, requester_id: &str, target_id: &str, unfollow: bool) -> Activity {
        let mut activity = Activity::new(ActivityType::Accept, target_id);
        let verb = if unfollow { "Unfollow" } else { "Follow" };
        activity.summary = format!("{} {} {}", requester_id, verb, target_id);
        activity.object = Some(answered_follow(follow_id, requester_id, target_id));
        activity.to = vec![requester_id.to_string()];
        activity
    }

    /// `signer_id` rejects a Follow from `requester_id` to `target_id`
    pub fn reject(follow_id: &str, requester_id: &str, target_id: &str, signer_id: &str) -> Activity {
        let mut activity = Activity::new(ActivityType::Reject, signer_id);
        activity.object = Some(answered_follow(follow_id, requester_id, target_id));
        activity.to = vec![requester_id.to_string()];
        activity
    }

    /// `board_id` publishes `object`
    pub fn create(board_id: &str, object: ObjectBase, to: Vec<String>, cc: Vec<String>) -> Activity {
        let mut activity = Activity::new(ActivityType::Create, board_id);
        activity.object = Some(object);
        activity.to = to;
        activity.cc = cc;
        activity
    }

    /// `board_id` forwards a received Create to its followers
    ///
    /// Followers are addressed in `cc` only, so a relay never names a
    /// reader in `to` and is not relayed again.
    pub fn relay(original: &Activity, board_id: &str, followers: &[String]) -> Activity {
        let mut activity = Activity::new(ActivityType::Create, board_id);
        activity.object = original.object.clone();
        activity.cc = followers
            .iter()
            .filter(|follower| {
                follower.as_str() != original.actor_id() && !original.to.contains(*follower)
            })
            .cloned()
            .collect();
        activity
    }
}
