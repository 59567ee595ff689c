use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::model::*;

use super::fanout::{self, InterestKind};
use super::{Engine, EngineError};

/// Largest allowed subscription window.
fn max_subscription_duration() -> Duration {
    Duration::hours(24)
}

/// Slack allowed between a requested start time and the server clock.
fn max_clock_skew() -> Duration {
    Duration::minutes(5)
}

fn validate_extent(extent: &Extent, now: DateTime<Utc>) -> Result<(), EngineError> {
    if extent.time_end.value < extent.time_start.value {
        return Err(EngineError::BadRequest(
            "time_end must be after time_start".into(),
        ));
    }
    if extent.time_end.value < now {
        return Err(EngineError::BadRequest(
            "extent must not end in the past".into(),
        ));
    }
    Ok(())
}

/// Resolve omitted subscription time bounds and enforce the window limits.
/// Omitted bounds fall back to the previous values on update, or to
/// `[now, now + 24h)` on create.
fn adjust_time_range(
    now: DateTime<Utc>,
    time_start: Option<Time>,
    time_end: Option<Time>,
    old: Option<&Subscription>,
) -> Result<(Time, Time), EngineError> {
    let start = match time_start {
        Some(t) => {
            if now - t.value > max_clock_skew() {
                return Err(EngineError::BadRequest(
                    "subscription time_start must not be in the past".into(),
                ));
            }
            t
        }
        None => old.map_or(Time::new(now), |o| o.time_start),
    };
    let end = match time_end {
        Some(t) => t,
        None => old.map_or(Time::new(start.value + max_subscription_duration()), |o| {
            o.time_end
        }),
    };
    if end.value < start.value {
        return Err(EngineError::BadRequest(
            "subscription time_end must be after time_start".into(),
        ));
    }
    if end.value - start.value > max_subscription_duration() {
        return Err(EngineError::BadRequest(
            "subscription window exceeds 24 hours".into(),
        ));
    }
    Ok((start, end))
}

/// Post-increment subscriber states for the notified ids, grouped per USS.
fn collect_subscribers(vs: &VertiportState, notified: &[Uuid]) -> Vec<SubscriberToNotify> {
    let subs: Vec<&Subscription> = vs
        .subscriptions
        .iter()
        .filter(|s| notified.contains(&s.id))
        .collect();
    fanout::subscribers_to_notify(&subs)
}

impl Engine {
    fn validate_uss_base_url(&self, url: &str) -> Result<(), EngineError> {
        if url.is_empty() {
            return Err(EngineError::BadRequest("missing uss_base_url".into()));
        }
        if self.config.allow_http || url.starts_with("https://") {
            return Ok(());
        }
        if url.starts_with("http://") {
            return Err(EngineError::BadRequest("uss_base_url must use TLS".into()));
        }
        Err(EngineError::BadRequest(
            "uss_base_url must support the https scheme".into(),
        ))
    }

    // ── Vertiports ───────────────────────────────────────────────

    pub async fn put_vertiport(
        &self,
        id: Uuid,
        number_of_parking_places: i32,
    ) -> Result<Vertiport, EngineError> {
        if number_of_parking_places <= 0 {
            return Err(EngineError::BadRequest(
                "number_of_parking_places must be positive".into(),
            ));
        }
        let vs = self.vertiport_state(id);
        let mut guard = vs.write_owned().await;

        let record = Vertiport {
            id,
            number_of_parking_places,
        };
        let event = Event::VertiportUpserted { vertiport: record };
        self.persist_and_apply(id, &mut guard, &event).await?;
        tracing::info!(%id, number_of_parking_places, "vertiport upserted");
        Ok(record)
    }

    /// Retires the declared record. Reservations and subscriptions at the
    /// vertiport are left in place.
    pub async fn delete_vertiport(&self, id: Uuid) -> Result<Vertiport, EngineError> {
        let vs = self
            .get_vertiport_state(&id)
            .ok_or(EngineError::NotFound(id))?;
        let mut guard = vs.write_owned().await;
        let record = guard.record.ok_or(EngineError::NotFound(id))?;

        let event = Event::VertiportDeleted { id };
        self.persist_and_apply(id, &mut guard, &event).await?;
        tracing::info!(%id, "vertiport deleted");
        Ok(record)
    }

    // ── Operational intent references ────────────────────────────

    /// Create (`ovn` empty) or mutate an operational intent reference.
    /// A successful write bumps the version, issues a fresh OVN, and bumps the
    /// notification index of every overlapping subscription interested in
    /// operational intents — including the writer's own.
    pub async fn put_operational_intent(
        &self,
        manager: &Manager,
        id: Uuid,
        ovn: &Ovn,
        params: PutOperationalIntentParams,
    ) -> Result<ChangeOperationalIntentResponse, EngineError> {
        let now = Utc::now();
        self.validate_uss_base_url(&params.uss_base_url)?;
        validate_extent(&params.extent, now)?;
        if ovn.is_empty() && params.state != OperationalIntentState::Accepted {
            return Err(EngineError::BadRequest(
                "initial version must be in the Accepted state".into(),
            ));
        }
        if params.subscription_id.is_some() && params.new_subscription.is_some() {
            return Err(EngineError::BadRequest(
                "subscription_id and new_subscription are mutually exclusive".into(),
            ));
        }
        let vertiport_id = params.extent.vertiport_id;

        // An entity id stays bound to one vertiport for its whole life.
        if let Some(existing_vid) = self.get_vertiport_for_entity(&id)
            && existing_vid != vertiport_id
        {
            return Err(EngineError::BadRequest(
                "operational intent cannot move to a different vertiport".into(),
            ));
        }
        if let Some(sub_id) = params.subscription_id
            && let Some(sub_vid) = self.get_vertiport_for_entity(&sub_id)
            && sub_vid != vertiport_id
        {
            return Err(EngineError::BadRequest(
                "subscription does not cover the same vertiport".into(),
            ));
        }

        let vs = self.vertiport_state(vertiport_id);
        let mut guard = vs.write_owned().await;

        let old_version = match guard.get_reservation(id) {
            Some(Reservation::OperationalIntent(old)) => {
                if &old.manager != manager {
                    return Err(EngineError::PermissionDenied(id));
                }
                if ovn.is_empty() {
                    return Err(EngineError::AlreadyExists(id));
                }
                if &old.ovn != ovn {
                    return Err(EngineError::VersionMismatch {
                        id,
                        supplied: ovn.to_string(),
                    });
                }
                if old.version != params.old_version {
                    return Err(EngineError::VersionMismatch {
                        id,
                        supplied: params.old_version.to_string(),
                    });
                }
                old.version
            }
            Some(Reservation::Constraint(_)) => return Err(EngineError::AlreadyExists(id)),
            None => {
                if !ovn.is_empty() {
                    return Err(EngineError::NotFound(id));
                }
                if params.old_version != 0 {
                    return Err(EngineError::VersionMismatch {
                        id,
                        supplied: params.old_version.to_string(),
                    });
                }
                0
            }
        };

        // Resolve the attached subscription: reuse the referenced one
        // (silently widening an implicit subscription that falls short), or
        // create a fresh implicit subscription from new_subscription.
        let (subscription, sub_event) = match params.subscription_id {
            Some(sub_id) => {
                let old_sub = guard
                    .get_subscription(sub_id)
                    .ok_or_else(|| {
                        EngineError::BadRequest("specified subscription does not exist".into())
                    })?
                    .clone();
                if &old_sub.manager != manager {
                    return Err(EngineError::PermissionDenied(sub_id));
                }
                let mut sub = old_sub;
                let mut widened = false;
                if sub.time_start.value > params.extent.time_start.value {
                    if !sub.implicit_subscription {
                        return Err(EngineError::BadRequest(
                            "subscription begins after the operational intent starts".into(),
                        ));
                    }
                    sub.time_start = params.extent.time_start;
                    widened = true;
                }
                if sub.time_end.value < params.extent.time_end.value {
                    if !sub.implicit_subscription {
                        return Err(EngineError::BadRequest(
                            "subscription ends before the operational intent ends".into(),
                        ));
                    }
                    sub.time_end = params.extent.time_end;
                    widened = true;
                }
                if sub.zone != params.extent.zone {
                    if !sub.implicit_subscription {
                        return Err(EngineError::BadRequest(
                            "subscription covers a different vertiport zone".into(),
                        ));
                    }
                    sub.zone = params.extent.zone;
                    widened = true;
                }
                if widened {
                    sub.version += 1;
                    sub.ovn = Ovn::from_time(sub.id, now);
                    let event = Event::SubscriptionUpserted {
                        subscription: sub.clone(),
                    };
                    (sub, Some(event))
                } else {
                    (sub, None)
                }
            }
            None => {
                let new_sub = params.new_subscription.as_ref().ok_or_else(|| {
                    EngineError::BadRequest(
                        "one of subscription_id or new_subscription is required".into(),
                    )
                })?;
                self.validate_uss_base_url(&new_sub.uss_base_url)?;
                let sub_id = Uuid::new_v4();
                let sub = Subscription {
                    id: sub_id,
                    manager: manager.clone(),
                    version: 1,
                    ovn: Ovn::from_time(sub_id, now),
                    notification_index: 0,
                    time_start: params.extent.time_start,
                    time_end: params.extent.time_end,
                    vertiport_id,
                    zone: params.extent.zone,
                    uss_base_url: new_sub.uss_base_url.clone(),
                    notify_for_operational_intents: true,
                    notify_for_constraints: new_sub.notify_for_constraints,
                    implicit_subscription: true,
                };
                let event = Event::SubscriptionUpserted {
                    subscription: sub.clone(),
                };
                (sub, Some(event))
            }
        };

        // Nominal states must prove awareness of everything overlapping the
        // extent, the previous version of this intent included. Constraints
        // count only when the attached subscription watches them.
        if params.state.requires_key() {
            let key: HashSet<&Ovn> = params.key.iter().collect();
            let area = params.extent.as_search_area();
            let mut missing_operational_intents = Vec::new();
            let mut missing_constraints = Vec::new();
            for reservation in guard.reservations_overlapping(&area) {
                match reservation {
                    Reservation::OperationalIntent(op) => {
                        if !key.contains(&op.ovn) {
                            missing_operational_intents.push(op.masked_for(manager));
                        }
                    }
                    Reservation::Constraint(c) if subscription.notify_for_constraints => {
                        if !key.contains(&c.ovn) {
                            missing_constraints.push(c.masked_for(manager));
                        }
                    }
                    Reservation::Constraint(_) => {}
                }
            }
            if !missing_operational_intents.is_empty() || !missing_constraints.is_empty() {
                return Err(EngineError::AirspaceConflict {
                    missing_operational_intents,
                    missing_constraints,
                });
            }
        }

        let intent = OperationalIntent {
            id,
            manager: manager.clone(),
            version: old_version + 1,
            ovn: Ovn::from_time(id, now),
            state: params.state,
            time_start: params.extent.time_start,
            time_end: params.extent.time_end,
            uss_base_url: params.uss_base_url.clone(),
            subscription_id: subscription.id,
            vertiport_id,
            zone: params.extent.zone,
            uss_availability: UssAvailability::Unknown,
        };

        if let Some(event) = sub_event {
            self.persist_and_apply(vertiport_id, &mut guard, &event).await?;
        }

        let area = params.extent.as_search_area();
        let notified =
            fanout::interested_subscription_ids(&guard, &area, InterestKind::OperationalIntents);
        let event = Event::OperationalIntentUpserted {
            intent: intent.clone(),
            notified: notified.clone(),
        };
        self.persist_and_apply(vertiport_id, &mut guard, &event).await?;
        metrics::histogram!(crate::observability::FANOUT_SUBSCRIPTIONS)
            .record(notified.len() as f64);

        let subscribers = collect_subscribers(&guard, &notified);
        tracing::info!(%id, version = intent.version, "operational intent upserted");
        Ok(ChangeOperationalIntentResponse {
            operational_intent_reference: intent,
            subscribers,
        })
    }

    /// Remove an operational intent. An implicit subscription left with no
    /// other dependents disappears with it.
    pub async fn delete_operational_intent(
        &self,
        manager: &Manager,
        id: Uuid,
        ovn: &Ovn,
    ) -> Result<ChangeOperationalIntentResponse, EngineError> {
        let (vertiport_id, mut guard) = self.resolve_entity_write(&id).await?;
        let old = match guard.get_reservation(id) {
            Some(Reservation::OperationalIntent(op)) => op.clone(),
            _ => return Err(EngineError::NotFound(id)),
        };
        if &old.manager != manager {
            return Err(EngineError::PermissionDenied(id));
        }
        if &old.ovn != ovn {
            return Err(EngineError::VersionMismatch {
                id,
                supplied: ovn.to_string(),
            });
        }

        let attached_sub = guard.get_subscription(old.subscription_id).cloned();
        let drop_implicit = attached_sub
            .as_ref()
            .is_some_and(|s| s.implicit_subscription && guard.dependent_intents(s.id).len() <= 1);

        let area = old.extent().as_search_area();
        let notified =
            fanout::interested_subscription_ids(&guard, &area, InterestKind::OperationalIntents);
        let event = Event::OperationalIntentDeleted {
            id,
            vertiport_id,
            notified: notified.clone(),
        };
        self.persist_and_apply(vertiport_id, &mut guard, &event).await?;
        metrics::histogram!(crate::observability::FANOUT_SUBSCRIPTIONS)
            .record(notified.len() as f64);

        // Snapshot subscriber indices before the implicit subscription goes away
        let subscribers = collect_subscribers(&guard, &notified);

        if drop_implicit
            && let Some(sub) = attached_sub
        {
            let event = Event::SubscriptionDeleted {
                id: sub.id,
                vertiport_id,
            };
            self.persist_and_apply(vertiport_id, &mut guard, &event).await?;
        }

        tracing::info!(%id, "operational intent deleted");
        Ok(ChangeOperationalIntentResponse {
            operational_intent_reference: old,
            subscribers,
        })
    }

    // ── Constraint references ────────────────────────────────────

    /// Create (`ovn` empty) or mutate a constraint reference. Fan-out goes to
    /// overlapping subscriptions with notify_for_constraints set.
    pub async fn put_constraint(
        &self,
        manager: &Manager,
        id: Uuid,
        ovn: &Ovn,
        params: PutConstraintParams,
    ) -> Result<ChangeConstraintResponse, EngineError> {
        let now = Utc::now();
        self.validate_uss_base_url(&params.uss_base_url)?;
        validate_extent(&params.extent, now)?;
        let vertiport_id = params.extent.vertiport_id;
        if let Some(existing_vid) = self.get_vertiport_for_entity(&id)
            && existing_vid != vertiport_id
        {
            return Err(EngineError::BadRequest(
                "constraint cannot move to a different vertiport".into(),
            ));
        }

        let vs = self.vertiport_state(vertiport_id);
        let mut guard = vs.write_owned().await;

        let old_version = match guard.get_reservation(id) {
            Some(Reservation::Constraint(old)) => {
                if &old.manager != manager {
                    return Err(EngineError::PermissionDenied(id));
                }
                if ovn.is_empty() {
                    return Err(EngineError::AlreadyExists(id));
                }
                if &old.ovn != ovn {
                    return Err(EngineError::VersionMismatch {
                        id,
                        supplied: ovn.to_string(),
                    });
                }
                if old.version != params.old_version {
                    return Err(EngineError::VersionMismatch {
                        id,
                        supplied: params.old_version.to_string(),
                    });
                }
                old.version
            }
            Some(Reservation::OperationalIntent(_)) => return Err(EngineError::AlreadyExists(id)),
            None => {
                // A nonempty OVN names a version that does not exist
                if !ovn.is_empty() {
                    return Err(EngineError::VersionMismatch {
                        id,
                        supplied: ovn.to_string(),
                    });
                }
                if params.old_version != 0 {
                    return Err(EngineError::VersionMismatch {
                        id,
                        supplied: params.old_version.to_string(),
                    });
                }
                0
            }
        };

        let constraint = Constraint {
            id,
            manager: manager.clone(),
            version: old_version + 1,
            ovn: Ovn::from_time(id, now),
            time_start: params.extent.time_start,
            time_end: params.extent.time_end,
            uss_base_url: params.uss_base_url.clone(),
            vertiport_id,
            zone: params.extent.zone,
        };

        let area = params.extent.as_search_area();
        let notified =
            fanout::interested_subscription_ids(&guard, &area, InterestKind::Constraints);
        let event = Event::ConstraintUpserted {
            constraint: constraint.clone(),
            notified: notified.clone(),
        };
        self.persist_and_apply(vertiport_id, &mut guard, &event).await?;
        metrics::histogram!(crate::observability::FANOUT_SUBSCRIPTIONS)
            .record(notified.len() as f64);

        let subscribers = collect_subscribers(&guard, &notified);
        tracing::info!(%id, version = constraint.version, "constraint upserted");
        Ok(ChangeConstraintResponse {
            constraint_reference: constraint,
            subscribers,
        })
    }

    pub async fn delete_constraint(
        &self,
        manager: &Manager,
        id: Uuid,
        ovn: &Ovn,
    ) -> Result<ChangeConstraintResponse, EngineError> {
        let (vertiport_id, mut guard) = self.resolve_entity_write(&id).await?;
        let old = match guard.get_reservation(id) {
            Some(Reservation::Constraint(c)) => c.clone(),
            _ => return Err(EngineError::NotFound(id)),
        };
        if &old.manager != manager {
            return Err(EngineError::PermissionDenied(id));
        }
        if &old.ovn != ovn {
            return Err(EngineError::VersionMismatch {
                id,
                supplied: ovn.to_string(),
            });
        }

        let area = old.extent().as_search_area();
        let notified =
            fanout::interested_subscription_ids(&guard, &area, InterestKind::Constraints);
        let event = Event::ConstraintDeleted {
            id,
            vertiport_id,
            notified: notified.clone(),
        };
        self.persist_and_apply(vertiport_id, &mut guard, &event).await?;
        metrics::histogram!(crate::observability::FANOUT_SUBSCRIPTIONS)
            .record(notified.len() as f64);

        let subscribers = collect_subscribers(&guard, &notified);
        tracing::info!(%id, "constraint deleted");
        Ok(ChangeConstraintResponse {
            constraint_reference: old,
            subscribers,
        })
    }

    // ── Subscriptions ────────────────────────────────────────────

    /// Create (`version_token` empty) or mutate a subscription. Updates
    /// preserve the notification index and must keep covering every attached
    /// operational intent.
    pub async fn put_subscription(
        &self,
        manager: &Manager,
        id: Uuid,
        version_token: &Ovn,
        params: PutSubscriptionParams,
    ) -> Result<PutSubscriptionResponse, EngineError> {
        let now = Utc::now();
        self.validate_uss_base_url(&params.uss_base_url)?;
        if !params.notify_for_operational_intents && !params.notify_for_constraints {
            return Err(EngineError::BadRequest(
                "subscription must notify for operational intents or constraints".into(),
            ));
        }
        if let Some(existing_vid) = self.get_vertiport_for_entity(&id)
            && existing_vid != params.vertiport_id
        {
            return Err(EngineError::BadRequest(
                "subscription cannot move to a different vertiport".into(),
            ));
        }

        let vs = self.vertiport_state(params.vertiport_id);
        let mut guard = vs.write_owned().await;
        let old = guard.get_subscription(id).cloned();

        match &old {
            None => {
                if !version_token.is_empty() {
                    return Err(EngineError::NotFound(id));
                }
            }
            Some(old_sub) => {
                if version_token.is_empty() {
                    return Err(EngineError::AlreadyExists(id));
                }
                if &old_sub.manager != manager {
                    return Err(EngineError::PermissionDenied(id));
                }
                if version_token != &old_sub.ovn {
                    return Err(EngineError::VersionMismatch {
                        id,
                        supplied: version_token.to_string(),
                    });
                }
            }
        }

        let (time_start, time_end) =
            adjust_time_range(now, params.time_start, params.time_end, old.as_ref())?;

        let subscription = Subscription {
            id,
            manager: manager.clone(),
            version: old.as_ref().map_or(1, |o| o.version + 1),
            ovn: Ovn::from_time(id, now),
            notification_index: old.as_ref().map_or(0, |o| o.notification_index),
            time_start,
            time_end,
            vertiport_id: params.vertiport_id,
            zone: params.zone,
            uss_base_url: params.uss_base_url.clone(),
            notify_for_operational_intents: params.notify_for_operational_intents,
            notify_for_constraints: params.notify_for_constraints,
            implicit_subscription: old.as_ref().is_some_and(|o| o.implicit_subscription),
        };

        if old.is_some() {
            for dep_id in guard.dependent_intents(id) {
                if let Some(Reservation::OperationalIntent(op)) = guard.get_reservation(dep_id) {
                    subscription
                        .validate_dependent(op)
                        .map_err(EngineError::BadRequest)?;
                }
            }
        }

        let event = Event::SubscriptionUpserted {
            subscription: subscription.clone(),
        };
        self.persist_and_apply(params.vertiport_id, &mut guard, &event).await?;

        // Everything already in the subscribed area, per the notify flags
        let area = subscription.extent().as_search_area();
        let mut operational_intent_references = Vec::new();
        let mut constraint_references = Vec::new();
        for reservation in guard.reservations_overlapping(&area) {
            match reservation {
                Reservation::OperationalIntent(op)
                    if subscription.notify_for_operational_intents =>
                {
                    operational_intent_references.push(op.masked_for(manager));
                }
                Reservation::Constraint(c) if subscription.notify_for_constraints => {
                    constraint_references.push(c.masked_for(manager));
                }
                _ => {}
            }
        }
        operational_intent_references.sort_by_key(|op| op.id);
        constraint_references.sort_by_key(|c| c.id);

        tracing::info!(%id, version = subscription.version, "subscription upserted");
        Ok(PutSubscriptionResponse {
            subscription,
            operational_intent_references,
            constraint_references,
        })
    }

    /// Remove a subscription. Rejected while operational intents still depend
    /// on it — implicit subscriptions can only disappear with their last
    /// dependent intent.
    pub async fn delete_subscription(
        &self,
        manager: &Manager,
        id: Uuid,
        version_token: Option<&Ovn>,
    ) -> Result<Subscription, EngineError> {
        let (vertiport_id, mut guard) = self.resolve_entity_write(&id).await?;
        let old = guard
            .get_subscription(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if &old.manager != manager {
            return Err(EngineError::PermissionDenied(id));
        }
        if let Some(token) = version_token
            && token != &old.ovn
        {
            return Err(EngineError::VersionMismatch {
                id,
                supplied: token.to_string(),
            });
        }
        let dependents = guard.dependent_intents(id);
        if !dependents.is_empty() {
            return Err(EngineError::DependentIntents {
                subscription_id: id,
                dependents,
            });
        }

        let event = Event::SubscriptionDeleted { id, vertiport_id };
        self.persist_and_apply(vertiport_id, &mut guard, &event).await?;
        tracing::info!(%id, "subscription deleted");
        Ok(old)
    }
}
