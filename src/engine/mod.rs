pub mod fanout;
pub mod freetime;

mod error;
mod mutations;
mod queries;

pub use error::EngineError;
pub use freetime::{free_windows, merge_overlapping, subtract_windows};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use uuid::Uuid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedVertiportState = Arc<RwLock<VertiportState>>;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub wal_path: PathBuf,
    /// Accept plain-http USS base URLs. Off in production; tests and local
    /// deployments turn it on.
    pub allow_http: bool,
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                                .record(batch.len() as f64);
                            let flush_start = std::time::Instant::now();
                            let result = flush_batch(&mut wal, &mut batch);
                            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                                .record(flush_start.elapsed().as_secs_f64());
                            respond_batch(&mut batch, &result);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                        .record(batch.len() as f64);
                    let flush_start = std::time::Instant::now();
                    let result = flush_batch(&mut wal, &mut batch);
                    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                        .record(flush_start.elapsed().as_secs_f64());
                    respond_batch(&mut batch, &result);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(
    batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>,
    result: &io::Result<()>,
) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

pub struct Engine {
    pub(super) config: EngineConfig,
    pub state: DashMap<Uuid, SharedVertiportState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: entity (intent/constraint/subscription) id → vertiport id
    pub(super) entity_to_vertiport: DashMap<Uuid, Uuid>,
}

/// Apply an event directly to a VertiportState (no locking — caller holds the
/// lock). The notification-index bumps ride along with the triggering event,
/// so live writes and replay produce identical indices.
fn apply_event(vs: &mut VertiportState, event: &Event, entity_map: &DashMap<Uuid, Uuid>) {
    match event {
        Event::VertiportUpserted { vertiport } => {
            vs.record = Some(*vertiport);
        }
        Event::VertiportDeleted { .. } => {
            vs.record = None;
        }
        Event::OperationalIntentUpserted { intent, notified } => {
            vs.remove_reservation(intent.id);
            vs.insert_reservation(Reservation::OperationalIntent(intent.clone()));
            entity_map.insert(intent.id, intent.vertiport_id);
            fanout::bump_notification_indices(vs, notified);
        }
        Event::OperationalIntentDeleted { id, notified, .. } => {
            vs.remove_reservation(*id);
            entity_map.remove(id);
            fanout::bump_notification_indices(vs, notified);
        }
        Event::ConstraintUpserted {
            constraint,
            notified,
        } => {
            vs.remove_reservation(constraint.id);
            vs.insert_reservation(Reservation::Constraint(constraint.clone()));
            entity_map.insert(constraint.id, constraint.vertiport_id);
            fanout::bump_notification_indices(vs, notified);
        }
        Event::ConstraintDeleted { id, notified, .. } => {
            vs.remove_reservation(*id);
            entity_map.remove(id);
            fanout::bump_notification_indices(vs, notified);
        }
        Event::SubscriptionUpserted { subscription } => {
            vs.remove_subscription(subscription.id);
            vs.insert_subscription(subscription.clone());
            entity_map.insert(subscription.id, subscription.vertiport_id);
        }
        Event::SubscriptionDeleted { id, .. } => {
            vs.remove_subscription(*id);
            entity_map.remove(id);
        }
    }
}

impl Engine {
    pub fn new(config: EngineConfig, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&config.wal_path)?;
        let wal = Wal::open(&config.wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            config,
            state: DashMap::new(),
            wal_tx,
            notify,
            entity_to_vertiport: DashMap::new(),
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context.
        let replayed = events.len();
        for event in &events {
            let vid = event.vertiport_id();
            let vs_arc = engine
                .state
                .entry(vid)
                .or_insert_with(|| Arc::new(RwLock::new(VertiportState::new(vid))))
                .value()
                .clone();
            let mut guard = vs_arc.try_write().expect("replay: uncontended write");
            apply_event(&mut guard, event, &engine.entity_to_vertiport);
        }
        if replayed > 0 {
            tracing::info!(events = replayed, "replayed WAL");
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// State for a vertiport, created on first touch. Reservations and
    /// subscriptions may reference vertiports that were never declared.
    pub(super) fn vertiport_state(&self, id: Uuid) -> SharedVertiportState {
        self.state
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(VertiportState::new(id))))
            .value()
            .clone()
    }

    pub fn get_vertiport_state(&self, id: &Uuid) -> Option<SharedVertiportState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_vertiport_for_entity(&self, entity_id: &Uuid) -> Option<Uuid> {
        self.entity_to_vertiport.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call. Eliminates the repeated 3-line pattern.
    pub(super) async fn persist_and_apply(
        &self,
        vertiport_id: Uuid,
        vs: &mut VertiportState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_event(vs, event, &self.entity_to_vertiport);
        self.notify.send(vertiport_id, event);
        metrics::counter!(
            crate::observability::MUTATIONS_TOTAL,
            "entity" => crate::observability::entity_label(event)
        )
        .increment(1);
        Ok(())
    }

    /// Lookup entity → vertiport, get its state, acquire the write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Uuid,
    ) -> Result<(Uuid, tokio::sync::OwnedRwLockWriteGuard<VertiportState>), EngineError> {
        let vertiport_id = self
            .get_vertiport_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let vs = self
            .get_vertiport_state(&vertiport_id)
            .ok_or(EngineError::NotFound(vertiport_id))?;
        let guard = vs.write_owned().await;
        Ok((vertiport_id, guard))
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state. Subscription snapshots carry their
    /// notification indices, so compaction never loses them.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        let vertiport_ids: Vec<Uuid> = self.state.iter().map(|e| *e.key()).collect();
        for vid in vertiport_ids {
            let Some(vs_arc) = self.get_vertiport_state(&vid) else {
                continue;
            };
            // Waits out any in-flight write holding the vertiport lock
            let guard = vs_arc.read().await;

            if let Some(record) = guard.record {
                events.push(Event::VertiportUpserted { vertiport: record });
            }
            for sub in &guard.subscriptions {
                events.push(Event::SubscriptionUpserted {
                    subscription: sub.clone(),
                });
            }
            for reservation in &guard.reservations {
                match reservation {
                    Reservation::OperationalIntent(op) => {
                        events.push(Event::OperationalIntentUpserted {
                            intent: op.clone(),
                            notified: vec![],
                        });
                    }
                    Reservation::Constraint(c) => {
                        events.push(Event::ConstraintUpserted {
                            constraint: c.clone(),
                            notified: vec![],
                        });
                    }
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
