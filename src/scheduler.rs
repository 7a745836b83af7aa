//! Per-model admission control.
//!
//! One scheduler exists per (provider, model) pair. Each owns a bounded FIFO
//! of reservations and a two-dimensional capacity (requests and tokens) that
//! replenishes linearly toward its per-minute ceilings. A dedicated task
//! drains the FIFO serially: the head-of-line reservation is the only
//! admission candidate until it resolves, so a large request that needs a
//! long replenishment blocks smaller followers. That is a deliberate
//! fairness/simplicity trade-off over best-fit scheduling.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::config::ModelConfig;
use crate::error::ProxyError;

/// Admission outcome. Exactly one is delivered per enqueued reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Capacity was debited; the caller owns one request slot and its tokens
    /// and must proceed to dispatch.
    Ready,
    /// The reservation waited out its deadline without capacity freeing up.
    RateLimit,
    /// The token cost exceeds the per-minute ceiling; no amount of waiting
    /// can admit this request here.
    RequestTooLarge,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("arrivals queue full")]
    QueueFull,
}

#[derive(Debug)]
struct Reservation {
    required_tokens: u32,
    deadline: Instant,
    reply: oneshot::Sender<Verdict>,
}

/// Handle to a running admission loop. Cloneable; all clones feed the same
/// arrivals buffer.
#[derive(Clone)]
pub struct Scheduler {
    config: ModelConfig,
    arrivals: mpsc::Sender<Reservation>,
}

pub type SchedulerMap = HashMap<String, Scheduler>;

pub fn init_schedulers(
    provider: &str,
    models: &HashMap<String, ModelConfig>,
) -> Result<SchedulerMap, ProxyError> {
    let mut schedulers = SchedulerMap::new();
    for (model, config) in models {
        schedulers.insert(model.clone(), Scheduler::spawn(provider, model, config.clone())?);
    }
    Ok(schedulers)
}

impl Scheduler {
    /// Validates the config and starts the admission loop on its own task.
    /// A loop panic aborts the process rather than leaving a scheduler-less
    /// model behind.
    pub fn spawn(provider: &str, model: &str, config: ModelConfig) -> Result<Self, ProxyError> {
        if config.rpm <= 1.0 {
            return Err(ProxyError::Config(format!(
                "scheduler rpm too low (<=1) for {provider}/{model}: {}",
                config.rpm
            )));
        }
        if config.tpm <= 1.0 {
            return Err(ProxyError::Config(format!(
                "scheduler tpm too low (<=1) for {provider}/{model}: {}",
                config.tpm
            )));
        }

        // A zero-size buffer still needs one slot for the in-flight offer.
        let (arrivals, rx) = mpsc::channel(config.max_queue_size.max(1));

        info!(
            provider,
            model,
            rpm = config.rpm,
            tpm = config.tpm,
            "scheduler start"
        );

        let admission = AdmissionLoop {
            provider: provider.to_string(),
            model: model.to_string(),
            capacity: Capacity::new(&config, Instant::now()),
            arrivals: rx,
        };
        let handle = tokio::spawn(admission.run());

        let provider = provider.to_string();
        let model = model.to_string();
        tokio::spawn(async move {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    error!(%provider, %model, error = %err, "unexpected scheduler error");
                    std::process::exit(1);
                }
            }
        });

        Ok(Self { config, arrivals })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Non-blocking offer into the arrivals buffer. A full buffer fails
    /// synchronously; the reservation never reaches the admission loop. On
    /// success the returned receiver yields exactly one [`Verdict`], no later
    /// than `max_queue_wait` plus one polling period after submission.
    pub fn submit(&self, required_tokens: u32) -> Result<oneshot::Receiver<Verdict>, SubmitError> {
        let (reply, verdict) = oneshot::channel();
        let reservation = Reservation {
            required_tokens,
            deadline: Instant::now()
                + Duration::from_secs_f64(self.config.max_queue_wait.max(0.0)),
            reply,
        };
        self.arrivals
            .try_send(reservation)
            .map_err(|_| SubmitError::QueueFull)?;
        Ok(verdict)
    }
}

/// With no arrivals for this long, refresh capacity anyway so observers see
/// current numbers.
const IDLE_REFRESH: Duration = Duration::from_secs(2);

/// Cap on a single capacity-gap sleep; keeps capacity fresh and wake-ups
/// responsive even when the gap is large.
const MAX_SLEEP: Duration = Duration::from_secs(2);

/// Added to each sleep so we wake just past the boundary instead of spinning
/// right at it.
const SLEEP_EPSILON: Duration = Duration::from_millis(100);

struct AdmissionLoop {
    provider: String,
    model: String,
    capacity: Capacity,
    arrivals: mpsc::Receiver<Reservation>,
}

impl AdmissionLoop {
    async fn run(mut self) {
        loop {
            let reservation = match tokio::time::timeout(IDLE_REFRESH, self.arrivals.recv()).await {
                Ok(Some(reservation)) => reservation,
                // Every handle is gone; nothing can be enqueued again.
                Ok(None) => return,
                Err(_) => {
                    self.capacity.replenish(Instant::now());
                    debug!(
                        provider = %self.provider,
                        model = %self.model,
                        requests = self.capacity.requests,
                        tokens = self.capacity.tokens,
                        "scheduler capacity"
                    );
                    continue;
                }
            };

            // Oversized requests are filtered out before enqueue, but this
            // guarantees we never wait forever on one that slips through.
            if f64::from(reservation.required_tokens) > self.capacity.tpm {
                debug!(
                    model = %self.model,
                    tokens = reservation.required_tokens,
                    reason = "RequestTooLarge",
                    "rejecting request"
                );
                let _ = reservation.reply.send(Verdict::RequestTooLarge);
                continue;
            }

            let verdict = self.wait_for_capacity(&reservation).await;
            match verdict {
                Verdict::Ready => {
                    info!(
                        model = %self.model,
                        tokens = reservation.required_tokens,
                        "handling request"
                    );
                }
                _ => {
                    debug!(
                        model = %self.model,
                        tokens = reservation.required_tokens,
                        reason = ?verdict,
                        "rejecting request"
                    );
                }
            }
            // The receiver may have dropped (client gone); the verdict is
            // produced regardless.
            let _ = reservation.reply.send(verdict);
        }
    }

    /// Admits the head-of-line reservation once capacity covers it, debiting
    /// atomically with the decision, or sheds it at its deadline.
    async fn wait_for_capacity(&mut self, reservation: &Reservation) -> Verdict {
        loop {
            let now = Instant::now();
            self.capacity.replenish(now);

            let need = self.capacity.wait_needed(reservation.required_tokens);
            if need.is_zero() {
                self.capacity.debit(reservation.required_tokens);
                return Verdict::Ready;
            }
            if now >= reservation.deadline {
                return Verdict::RateLimit;
            }

            let sleep = (need + SLEEP_EPSILON)
                .min(MAX_SLEEP)
                .min(reservation.deadline - now);
            tokio::time::sleep(sleep).await;
        }
    }
}

/// Continuously replenished two-dimensional budget. Owned exclusively by one
/// admission loop; mutated nowhere else.
struct Capacity {
    rpm: f64,
    tpm: f64,
    requests: f64,
    tokens: f64,
    last_update: Instant,
}

impl Capacity {
    fn new(config: &ModelConfig, now: Instant) -> Self {
        Self {
            rpm: config.rpm,
            tpm: config.tpm,
            requests: config.rpm,
            tokens: config.tpm,
            last_update: now,
        }
    }

    /// Lazy top-up: credit the elapsed fraction of a minute at the nominal
    /// rates, clamped to the ceilings.
    fn replenish(&mut self, now: Instant) {
        if self.requests < self.rpm || self.tokens < self.tpm {
            let elapsed_minutes = now.duration_since(self.last_update).as_secs_f64() / 60.0;
            self.requests = (self.requests + elapsed_minutes * self.rpm).min(self.rpm);
            self.tokens = (self.tokens + elapsed_minutes * self.tpm).min(self.tpm);
        }
        self.last_update = now;
    }

    /// Time until both one request slot and `required_tokens` tokens are
    /// available; zero means admissible now.
    fn wait_needed(&self, required_tokens: u32) -> Duration {
        let request_minutes = ((1.0 - self.requests) / self.rpm).max(0.0);
        let token_minutes = ((f64::from(required_tokens) - self.tokens) / self.tpm).max(0.0);
        Duration::from_secs_f64(request_minutes.max(token_minutes) * 60.0)
    }

    fn debit(&mut self, required_tokens: u32) {
        self.requests -= 1.0;
        self.tokens -= f64::from(required_tokens);
    }
}
