use uuid::Uuid;

use crate::model::*;

use super::freetime::{self, Window};
use super::{Engine, EngineError};

impl Engine {
    // ── Entity reads ─────────────────────────────────────────────

    pub async fn get_vertiport(&self, id: Uuid) -> Result<Vertiport, EngineError> {
        let vs = self
            .get_vertiport_state(&id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = vs.read().await;
        guard.record.ok_or(EngineError::NotFound(id))
    }

    /// Fetch an operational intent reference. Foreign OVNs are masked.
    pub async fn get_operational_intent(
        &self,
        manager: &Manager,
        id: Uuid,
    ) -> Result<OperationalIntent, EngineError> {
        let vertiport_id = self
            .get_vertiport_for_entity(&id)
            .ok_or(EngineError::NotFound(id))?;
        let vs = self
            .get_vertiport_state(&vertiport_id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = vs.read().await;
        match guard.get_reservation(id) {
            Some(Reservation::OperationalIntent(op)) => Ok(op.masked_for(manager)),
            _ => Err(EngineError::NotFound(id)),
        }
    }

    pub async fn get_constraint(
        &self,
        manager: &Manager,
        id: Uuid,
    ) -> Result<Constraint, EngineError> {
        let vertiport_id = self
            .get_vertiport_for_entity(&id)
            .ok_or(EngineError::NotFound(id))?;
        let vs = self
            .get_vertiport_state(&vertiport_id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = vs.read().await;
        match guard.get_reservation(id) {
            Some(Reservation::Constraint(c)) => Ok(c.masked_for(manager)),
            _ => Err(EngineError::NotFound(id)),
        }
    }

    /// Owner-only fetch, including the ids of attached operational intents.
    pub async fn get_subscription(
        &self,
        manager: &Manager,
        id: Uuid,
    ) -> Result<GetSubscriptionResponse, EngineError> {
        let vertiport_id = self
            .get_vertiport_for_entity(&id)
            .ok_or(EngineError::NotFound(id))?;
        let vs = self
            .get_vertiport_state(&vertiport_id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = vs.read().await;
        let subscription = guard
            .get_subscription(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if &subscription.manager != manager {
            return Err(EngineError::PermissionDenied(id));
        }
        let mut dependent_operational_intents = guard.dependent_intents(id);
        dependent_operational_intents.sort();
        Ok(GetSubscriptionResponse {
            subscription,
            dependent_operational_intents,
        })
    }

    // ── Overlap searches ─────────────────────────────────────────

    /// Operational intents overlapping the filter, ordered by id.
    /// Foreign OVNs are masked.
    pub async fn query_operational_intents(
        &self,
        manager: &Manager,
        area: &SearchArea,
    ) -> Vec<OperationalIntent> {
        let Some(vs) = self.get_vertiport_state(&area.vertiport_id) else {
            return Vec::new();
        };
        let guard = vs.read().await;
        let mut results: Vec<OperationalIntent> = guard
            .reservations_overlapping(area)
            .filter_map(|r| match r {
                Reservation::OperationalIntent(op) => Some(op.masked_for(manager)),
                Reservation::Constraint(_) => None,
            })
            .collect();
        results.sort_by_key(|op| op.id);
        results
    }

    pub async fn query_constraints(&self, manager: &Manager, area: &SearchArea) -> Vec<Constraint> {
        let Some(vs) = self.get_vertiport_state(&area.vertiport_id) else {
            return Vec::new();
        };
        let guard = vs.read().await;
        let mut results: Vec<Constraint> = guard
            .reservations_overlapping(area)
            .filter_map(|r| match r {
                Reservation::Constraint(c) => Some(c.masked_for(manager)),
                Reservation::OperationalIntent(_) => None,
            })
            .collect();
        results.sort_by_key(|c| c.id);
        results
    }

    /// The caller's own subscriptions overlapping the filter, ordered by id.
    pub async fn query_subscriptions(
        &self,
        manager: &Manager,
        area: &SearchArea,
    ) -> Vec<Subscription> {
        let Some(vs) = self.get_vertiport_state(&area.vertiport_id) else {
            return Vec::new();
        };
        let guard = vs.read().await;
        let mut results: Vec<Subscription> = guard
            .subscriptions_overlapping(area)
            .filter(|s| &s.manager == manager)
            .cloned()
            .collect();
        results.sort_by_key(|s| s.id);
        results
    }

    // ── Availability ─────────────────────────────────────────────

    /// Parking occupancy over a window: every operational intent and
    /// constraint at the vertiport (all zones) strictly overlapping the
    /// window counts one used place.
    pub async fn used_parking_places(
        &self,
        vertiport_id: Uuid,
        time_start: Time,
        time_end: Time,
    ) -> Result<ParkingUsage, EngineError> {
        if time_end.value < time_start.value {
            return Err(EngineError::BadRequest(
                "time_end must be after time_start".into(),
            ));
        }
        let vs = self
            .get_vertiport_state(&vertiport_id)
            .ok_or(EngineError::NotFound(vertiport_id))?;
        let guard = vs.read().await;
        let record = guard.record.ok_or(EngineError::NotFound(vertiport_id))?;

        let area = SearchArea {
            vertiport_id,
            zone: None,
            time_start: Some(time_start),
            time_end: Some(time_end),
        };
        let used = guard.reservations_overlapping(&area).count() as i32;
        Ok(ParkingUsage {
            number_of_places: record.number_of_parking_places,
            number_of_used_places: used,
            number_of_available_places: record.number_of_parking_places - used,
        })
    }

    /// Free FATO windows within the query window.
    pub async fn fato_available_times(
        &self,
        vertiport_id: Uuid,
        time_start: Time,
        time_end: Time,
    ) -> Result<Vec<TimePeriod>, EngineError> {
        self.free_time_windows(vertiport_id, FATO, time_start, time_end)
            .await
    }

    /// Chronological complement of the zone's reservations within the query
    /// window. A vertiport with no reservations is free for the whole window.
    pub async fn free_time_windows(
        &self,
        vertiport_id: Uuid,
        zone: Zone,
        time_start: Time,
        time_end: Time,
    ) -> Result<Vec<TimePeriod>, EngineError> {
        if time_end.value < time_start.value {
            return Err(EngineError::BadRequest(
                "time_end must be after time_start".into(),
            ));
        }
        let Some(vs) = self.get_vertiport_state(&vertiport_id) else {
            return Ok(freetime::free_windows(
                Vec::new(),
                time_start.value,
                time_end.value,
            ));
        };
        let guard = vs.read().await;

        let area = SearchArea {
            vertiport_id,
            zone: Some(zone),
            time_start: Some(time_start),
            time_end: Some(time_end),
        };
        let busy: Vec<Window> = guard
            .reservations_overlapping(&area)
            .map(|r| {
                let extent = r.extent();
                (extent.time_start.value, extent.time_end.value)
            })
            .collect();
        Ok(freetime::free_windows(
            busy,
            time_start.value,
            time_end.value,
        ))
    }
}
