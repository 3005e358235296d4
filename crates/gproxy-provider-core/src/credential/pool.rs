use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::events::{
    Event, ModelUnavailableStartEvent, OperationalEvent, UnavailableStartEvent, UsageBatchEvent,
};
use crate::{Credential, CredentialId, CredentialState, EventHub, UnavailableReason};

use super::model_unavailable_queue::ModelUnavailableQueue;
use super::state::ScoreEntry;
use super::unavailable_queue::UnavailableQueue;

type ModelStateKey = (CredentialId, String);
type ModelStateValue = (Instant, UnavailableReason);

/// Candidates selected within this window of one another are treated as a repeat
/// pick and skipped in favour of the runner-up, to avoid thundering-herd reuse of
/// whichever credential happened to score lowest.
const ANTI_REPEAT_WINDOW: Duration = Duration::from_millis(100);
/// A credential health-checked this recently with no usage yet is "fresh after
/// warmup" and should be preferred over one that has simply never been used.
const WARMUP_FRESH_WINDOW: Duration = Duration::from_secs(120);
const NEVER_USED_PENALTY: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone)]
pub enum AcquireError {
    ProviderUnknown,
    NoActiveCredentials,
}

pub struct CredentialPool {
    creds: RwLock<HashMap<CredentialId, Credential>>,
    by_provider: RwLock<HashMap<String, Vec<CredentialId>>>,
    states: Arc<RwLock<HashMap<CredentialId, CredentialState>>>,
    model_states: Arc<RwLock<HashMap<ModelStateKey, ModelStateValue>>>,
    /// Persisted, always-on per-credential denylist (the account's `notSupportedModels`),
    /// distinct from `model_states`' transient TTL cooldown: an entry here never expires
    /// on its own, only when an admin edits the credential's settings again.
    not_supported_models: Arc<RwLock<HashMap<CredentialId, std::collections::HashSet<String>>>>,
    scores: RwLock<HashMap<CredentialId, ScoreEntry>>,
    last_selected: RwLock<HashMap<String, (CredentialId, Instant)>>,
    seq_counter: AtomicU64,
    events: EventHub,
    queue: Arc<UnavailableQueue>,
    model_queue: Arc<ModelUnavailableQueue>,
    usage_tx: mpsc::UnboundedSender<CredentialId>,
}

/// Base offset for selection sequence numbers, derived from process start time so
/// that a restarted process never reuses sequence numbers a prior run already handed
/// out (which would otherwise bias the LRU score toward the just-restarted process).
fn sequence_base() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64 * 1000)
        .unwrap_or(0)
}

impl CredentialPool {
    pub fn new(events: EventHub) -> Self {
        let states = Arc::new(RwLock::new(HashMap::new()));
        let model_states = Arc::new(RwLock::new(HashMap::new()));
        let queue = Arc::new(UnavailableQueue::new());
        let model_queue = Arc::new(ModelUnavailableQueue::new());
        queue
            .clone()
            .spawn_recover_task(states.clone(), events.clone());
        model_queue
            .clone()
            .spawn_recover_task(model_states.clone(), events.clone());

        let (usage_tx, usage_rx) = mpsc::unbounded_channel();
        spawn_usage_batch_task(usage_rx, events.clone());

        Self {
            creds: RwLock::new(HashMap::new()),
            by_provider: RwLock::new(HashMap::new()),
            states,
            model_states,
            not_supported_models: Arc::new(RwLock::new(HashMap::new())),
            scores: RwLock::new(HashMap::new()),
            last_selected: RwLock::new(HashMap::new()),
            seq_counter: AtomicU64::new(sequence_base()),
            events,
            queue,
            model_queue,
            usage_tx,
        }
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub async fn insert(&self, provider: impl Into<String>, id: CredentialId, cred: Credential) {
        let provider = provider.into();
        self.creds.write().await.insert(id, cred);
        // Avoid duplicated IDs in the provider index; insert() can be called on enable toggles.
        let mut by_provider = self.by_provider.write().await;
        let ids = by_provider.entry(provider).or_default();
        if !ids.contains(&id) {
            ids.push(id);
        }
        self.states
            .write()
            .await
            .entry(id)
            .or_insert(CredentialState::Active);
        self.scores.write().await.entry(id).or_default();
    }

    pub async fn update_credential(&self, id: CredentialId, cred: Credential) {
        self.creds.write().await.insert(id, cred);
    }

    /// Replaces the credential's static `notSupportedModels` denylist, read from
    /// the credential's stored settings (`{"not_supported_models": [...]}`).
    pub async fn set_not_supported_models(&self, id: CredentialId, models: Vec<String>) {
        let mut guard = self.not_supported_models.write().await;
        if models.is_empty() {
            guard.remove(&id);
        } else {
            guard.insert(id, models.into_iter().collect());
        }
    }

    pub async fn is_model_not_supported(&self, id: CredentialId, model: &str) -> bool {
        self.not_supported_models
            .read()
            .await
            .get(&id)
            .is_some_and(|set| set.contains(model))
    }

    pub async fn set_enabled(&self, provider: &str, id: CredentialId, enabled: bool) {
        if enabled {
            let mut by_provider = self.by_provider.write().await;
            let ids = by_provider.entry(provider.to_string()).or_default();
            if !ids.contains(&id) {
                ids.push(id);
            }
            drop(by_provider);

            // If the credential was never inserted before, keep state as Active.
            self.states
                .write()
                .await
                .entry(id)
                .or_insert(CredentialState::Active);
            self.scores.write().await.entry(id).or_default();
        } else {
            let mut by_provider = self.by_provider.write().await;
            if let Some(ids) = by_provider.get_mut(provider) {
                ids.retain(|x| *x != id);
            }
            let mut model_states = self.model_states.write().await;
            model_states.retain(|(cred_id, _), _| *cred_id != id);
        }
    }

    /// Select an active credential for `provider` using the LRU/usage/sequence score,
    /// the anti-repeat window, and (when `model` is set) per-model unavailability.
    /// Not globally serialized: concurrent callers may race on the same `RwLock`
    /// read sections, but no per-provider mutex guards the whole decision.
    async fn select(
        &self,
        provider: &str,
        model: Option<&str>,
    ) -> Result<(CredentialId, Credential), AcquireError> {
        let ids = {
            let guard = self.by_provider.read().await;
            guard.get(provider).cloned()
        };
        let Some(ids) = ids else {
            return Err(AcquireError::ProviderUnknown);
        };

        let states = self.states.read().await;
        let model_states = self.model_states.read().await;
        let not_supported = self.not_supported_models.read().await;
        let mut candidates: Vec<CredentialId> = ids
            .into_iter()
            .filter(|id| matches!(states.get(id), Some(CredentialState::Active)))
            .filter(|id| match model {
                None => true,
                Some(model) => !not_supported
                    .get(id)
                    .is_some_and(|set| set.contains(model)),
            })
            .filter(|id| match model {
                None => true,
                Some(model) => {
                    let key = (*id, model.to_string());
                    match model_states.get(&key) {
                        Some((until, _reason)) => *until <= Instant::now(),
                        None => true,
                    }
                }
            })
            .collect();
        drop(not_supported);
        drop(model_states);
        drop(states);

        if candidates.is_empty() {
            return Err(AcquireError::NoActiveCredentials);
        }

        let now = Instant::now();
        let scores = self.scores.read().await;
        candidates.sort_by_key(|id| {
            let entry = scores.get(id).copied().unwrap_or_default();
            (score_for(entry, now), *id)
        });
        drop(scores);

        let mut chosen = candidates[0];
        if candidates.len() > 1 {
            let mut last_selected = self.last_selected.write().await;
            if let Some((prev_id, prev_at)) = last_selected.get(provider)
                && *prev_id == chosen
                && now.saturating_duration_since(*prev_at) < ANTI_REPEAT_WINDOW
            {
                chosen = candidates[1];
            }
            last_selected.insert(provider.to_string(), (chosen, now));
        }

        {
            let mut scores = self.scores.write().await;
            let entry = scores.entry(chosen).or_default();
            entry.last_used = Some(now);
            entry.usage_count += 1;
            entry.last_selection_seq = self.seq_counter.fetch_add(1, Ordering::Relaxed);
        }
        let _ = self.usage_tx.send(chosen);

        let cred = self
            .creds
            .read()
            .await
            .get(&chosen)
            .cloned()
            .ok_or(AcquireError::NoActiveCredentials)?;
        Ok((chosen, cred))
    }

    pub async fn acquire(
        &self,
        provider: &str,
    ) -> Result<(CredentialId, Credential), AcquireError> {
        self.select(provider, None).await
    }

    pub async fn acquire_for_model(
        &self,
        provider: &str,
        model: &str,
    ) -> Result<(CredentialId, Credential), AcquireError> {
        self.select(provider, Some(model)).await
    }

    pub async fn note_health_check(&self, credential_id: CredentialId) {
        let mut scores = self.scores.write().await;
        scores.entry(credential_id).or_default().last_health_check = Some(Instant::now());
    }

    pub async fn mark_unavailable(
        &self,
        credential_id: CredentialId,
        duration: Duration,
        reason: UnavailableReason,
    ) {
        let until_instant = Instant::now() + duration;
        {
            let mut guard = self.states.write().await;
            guard.insert(
                credential_id,
                CredentialState::Unavailable {
                    until: until_instant,
                    reason,
                },
            );
        }
        self.queue.push(until_instant, credential_id).await;

        let until_wall = SystemTime::now()
            .checked_add(duration)
            .unwrap_or_else(SystemTime::now);
        self.events
            .emit(Event::Operational(OperationalEvent::UnavailableStart(
                UnavailableStartEvent {
                    at: SystemTime::now(),
                    credential_id,
                    reason,
                    until: until_wall,
                },
            )))
            .await;
    }

    pub async fn mark_model_unavailable(
        &self,
        credential_id: CredentialId,
        model: impl Into<String>,
        duration: Duration,
        reason: UnavailableReason,
    ) {
        let model = model.into();
        let until_instant = Instant::now() + duration;
        {
            let mut guard = self.model_states.write().await;
            guard.insert((credential_id, model.clone()), (until_instant, reason));
        }
        self.model_queue
            .push(until_instant, credential_id, model.clone())
            .await;

        let until_wall = SystemTime::now()
            .checked_add(duration)
            .unwrap_or_else(SystemTime::now);
        self.events
            .emit(Event::Operational(OperationalEvent::ModelUnavailableStart(
                ModelUnavailableStartEvent {
                    at: SystemTime::now(),
                    credential_id,
                    model,
                    reason,
                    until: until_wall,
                },
            )))
            .await;
    }

    pub async fn state(&self, credential_id: CredentialId) -> Option<CredentialState> {
        self.states.read().await.get(&credential_id).cloned()
    }

    /// Per-provider health snapshot: `(total, active)` credential counts.
    /// `None` if the provider has never had a credential enabled for it.
    pub async fn health_snapshot(&self, provider: &str) -> Option<(usize, usize)> {
        let ids = {
            let guard = self.by_provider.read().await;
            guard.get(provider).cloned()
        }?;
        let states = self.states.read().await;
        let total = ids.len();
        let active = ids
            .iter()
            .filter(|id| matches!(states.get(id), Some(CredentialState::Active)))
            .count();
        Some((total, active))
    }

    pub async fn model_states(
        &self,
        credential_id: CredentialId,
    ) -> Vec<(String, Instant, UnavailableReason)> {
        let now = Instant::now();
        let guard = self.model_states.read().await;
        let mut rows = Vec::new();
        for ((id, model), (until, reason)) in guard.iter() {
            if *id != credential_id {
                continue;
            }
            if *until <= now {
                continue;
            }
            rows.push((model.clone(), *until, *reason));
        }
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }
}

/// Lower is better. No prior use scores as if last used 24h ago (strongly preferred
/// over anything recently used); a credential health-checked within the warmup
/// window with zero usage scores even lower so a freshly recovered account gets
/// picked up immediately instead of waiting behind warm ones.
fn score_for(entry: ScoreEntry, now: Instant) -> i128 {
    if entry.usage_count == 0
        && let Some(checked) = entry.last_health_check
        && now.saturating_duration_since(checked) < WARMUP_FRESH_WINDOW
    {
        return i128::MIN;
    }
    let last_used_ts = match entry.last_used {
        Some(t) => now.saturating_duration_since(t).as_millis() as i128 * -1,
        None => NEVER_USED_PENALTY.as_millis() as i128 * -1,
    };
    last_used_ts + entry.usage_count as i128 * 10_000 + entry.last_selection_seq as i128 * 1_000
}

/// Drains selection increments into per-credential counts and flushes them as a
/// single batched event every 10-100ms, shortening the interval when the backlog
/// grows so a burst of traffic doesn't pile up unboundedly in memory.
fn spawn_usage_batch_task(mut rx: mpsc::UnboundedReceiver<CredentialId>, events: EventHub) {
    tokio::spawn(async move {
        let mut pending: HashMap<CredentialId, u64> = HashMap::new();
        loop {
            let interval = if pending.len() > 50 {
                Duration::from_millis(10)
            } else if pending.len() < 10 {
                Duration::from_millis(100)
            } else {
                Duration::from_millis(50)
            };

            let deadline = tokio::time::sleep(interval);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    maybe_id = rx.recv() => {
                        match maybe_id {
                            Some(id) => *pending.entry(id).or_insert(0) += 1,
                            None => return,
                        }
                    }
                    _ = &mut deadline => break,
                }
            }

            if pending.is_empty() {
                continue;
            }
            let increments: Vec<(CredentialId, u64)> = pending.drain().collect();
            events
                .emit(Event::Operational(OperationalEvent::UsageBatch(
                    UsageBatchEvent {
                        at: SystemTime::now(),
                        increments,
                    },
                )))
                .await;
        }
    });
}
