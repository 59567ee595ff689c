use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Zone discriminator within a vertiport.
pub type Zone = i32;

/// Final approach and take-off area.
pub const FATO: Zone = 0;
/// Parking stand.
pub const PARKING_STAND: Zone = 1;

/// OVN placeholder returned for entities the reader does not manage.
pub const NO_OVN_PHRASE: &str = "Available from USS";

/// Owner identity of an entity, as authenticated by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Manager(String);

impl Manager {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Manager {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Manager {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque version notification number. Compared only for equality; holders
/// prove they have seen the latest version of an entity by echoing it back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ovn(String);

impl Ovn {
    /// Derive a fresh OVN from the entity id and its update time.
    /// URL-unsafe base64 characters are substituted so the token can appear
    /// in path segments.
    pub fn from_time(id: Uuid, updated_at: DateTime<Utc>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(id.to_string().as_bytes());
        hasher.update(updated_at.to_rfc3339().as_bytes());
        let digest = hasher.finalize();
        let token = base64::engine::general_purpose::STANDARD
            .encode(digest)
            .replace('+', "-")
            .replace('/', ".")
            .replace('=', "_");
        Self(token)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The placeholder OVN shown to readers who do not manage the entity.
    pub fn masked() -> Self {
        Self(NO_OVN_PHRASE.to_string())
    }
}

impl From<&str> for Ovn {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for Ovn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Wire-tagged timestamp. The format tag is fixed but kept explicit because
/// it travels with every time value on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Time {
    pub value: DateTime<Utc>,
    pub format: TimeFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeFormat {
    #[serde(rename = "RFC3339")]
    Rfc3339,
}

impl Time {
    pub fn new(value: DateTime<Utc>) -> Self {
        Self {
            value,
            format: TimeFormat::Rfc3339,
        }
    }
}

/// A contiguous free window, half-open `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimePeriod {
    pub from: Time,
    pub to: Time,
}

/// The exact scope of a stored entity: one zone at one vertiport over a
/// half-open time interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub vertiport_id: Uuid,
    pub zone: Zone,
    pub time_start: Time,
    pub time_end: Time,
}

impl Extent {
    /// Strict overlap against a search filter: an interval touching a query
    /// bound only at its edge does not match.
    pub fn overlaps(&self, area: &SearchArea) -> bool {
        if let Some(zone) = area.zone
            && zone != self.zone
        {
            return false;
        }
        if let Some(start) = area.time_start
            && self.time_end.value <= start.value
        {
            return false;
        }
        if let Some(end) = area.time_end
            && self.time_start.value >= end.value
        {
            return false;
        }
        true
    }

    pub fn as_search_area(&self) -> SearchArea {
        SearchArea {
            vertiport_id: self.vertiport_id,
            zone: Some(self.zone),
            time_start: Some(self.time_start),
            time_end: Some(self.time_end),
        }
    }
}

/// Search filter over one vertiport. `None` zone matches every zone; absent
/// time bounds are unbounded on that side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchArea {
    pub vertiport_id: Uuid,
    pub zone: Option<Zone>,
    pub time_start: Option<Time>,
    pub time_end: Option<Time>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationalIntentState {
    Accepted,
    Activated,
    Nonconforming,
    Contingent,
}

impl OperationalIntentState {
    /// States describing nominal flight require the writer to prove awareness
    /// of all overlapping entities via an OVN key.
    pub fn requires_key(&self) -> bool {
        matches!(self, Self::Accepted | Self::Activated)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UssAvailability {
    #[default]
    Unknown,
}

/// Reference to an operational intent: a planned use of one vertiport zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationalIntent {
    pub id: Uuid,
    pub manager: Manager,
    pub version: i32,
    pub ovn: Ovn,
    pub state: OperationalIntentState,
    pub time_start: Time,
    pub time_end: Time,
    pub uss_base_url: String,
    pub subscription_id: Uuid,
    pub vertiport_id: Uuid,
    pub zone: Zone,
    pub uss_availability: UssAvailability,
}

impl OperationalIntent {
    pub fn extent(&self) -> Extent {
        Extent {
            vertiport_id: self.vertiport_id,
            zone: self.zone,
            time_start: self.time_start,
            time_end: self.time_end,
        }
    }

    /// Clone with the OVN masked unless `manager` owns the entity.
    pub fn masked_for(&self, manager: &Manager) -> Self {
        let mut copy = self.clone();
        if &copy.manager != manager {
            copy.ovn = Ovn::masked();
        }
        copy
    }
}

/// Reference to a constraint: a restriction on the use of one vertiport zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub id: Uuid,
    pub manager: Manager,
    pub version: i32,
    pub ovn: Ovn,
    pub time_start: Time,
    pub time_end: Time,
    pub uss_base_url: String,
    pub vertiport_id: Uuid,
    pub zone: Zone,
}

impl Constraint {
    pub fn extent(&self) -> Extent {
        Extent {
            vertiport_id: self.vertiport_id,
            zone: self.zone,
            time_start: self.time_start,
            time_end: self.time_end,
        }
    }

    pub fn masked_for(&self, manager: &Manager) -> Self {
        let mut copy = self.clone();
        if &copy.manager != manager {
            copy.ovn = Ovn::masked();
        }
        copy
    }
}

/// A standing request to be told when entities change at a vertiport zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub manager: Manager,
    pub version: i32,
    pub ovn: Ovn,
    pub notification_index: i32,
    pub time_start: Time,
    pub time_end: Time,
    pub vertiport_id: Uuid,
    pub zone: Zone,
    pub uss_base_url: String,
    pub notify_for_operational_intents: bool,
    pub notify_for_constraints: bool,
    pub implicit_subscription: bool,
}

impl Subscription {
    pub fn extent(&self) -> Extent {
        Extent {
            vertiport_id: self.vertiport_id,
            zone: self.zone,
            time_start: self.time_start,
            time_end: self.time_end,
        }
    }

    /// A subscription must keep covering every operational intent attached to
    /// it: same vertiport and zone, starting no more than five minutes after
    /// the intent starts, and ending no earlier than the intent ends.
    pub fn validate_dependent(&self, intent: &OperationalIntent) -> Result<(), String> {
        if self.vertiport_id != intent.vertiport_id {
            return Err(format!(
                "subscription does not cover the same vertiport as operational intent {}",
                intent.id
            ));
        }
        if self.zone != intent.zone {
            return Err(format!(
                "subscription covers a different vertiport zone than operational intent {}",
                intent.id
            ));
        }
        if self.time_start.value - intent.time_start.value > chrono::Duration::minutes(5) {
            return Err(format!(
                "subscription start time does not cover operational intent {}",
                intent.id
            ));
        }
        if intent.time_end.value > self.time_end.value {
            return Err(format!(
                "subscription does not cover the end time of operational intent {}",
                intent.id
            ));
        }
        Ok(())
    }
}

/// Declared physical capacity of a vertiport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vertiport {
    pub id: Uuid,
    pub number_of_parking_places: i32,
}

/// One notification target: a USS base URL with the subscriptions that made
/// it interested, each carrying its post-increment notification index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberToNotify {
    pub uss_base_url: String,
    pub subscriptions: Vec<SubscriptionState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionState {
    pub subscription_id: Uuid,
    pub notification_index: i32,
}

/// A reserved interval at a vertiport — operational intents and constraints
/// are both just reservations to the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reservation {
    OperationalIntent(OperationalIntent),
    Constraint(Constraint),
}

impl Reservation {
    pub fn id(&self) -> Uuid {
        match self {
            Reservation::OperationalIntent(op) => op.id,
            Reservation::Constraint(c) => c.id,
        }
    }

    pub fn extent(&self) -> Extent {
        match self {
            Reservation::OperationalIntent(op) => op.extent(),
            Reservation::Constraint(c) => c.extent(),
        }
    }

    pub fn time_start(&self) -> Time {
        match self {
            Reservation::OperationalIntent(op) => op.time_start,
            Reservation::Constraint(c) => c.time_start,
        }
    }
}

/// All entities scoped to one vertiport: the declared capacity record, the
/// reservation interval index, and the subscription index. Both indexes are
/// kept sorted by start time.
#[derive(Debug, Clone)]
pub struct VertiportState {
    pub id: Uuid,
    /// Declared capacity; `None` until the vertiport is put (reservations may
    /// still exist for undeclared vertiports).
    pub record: Option<Vertiport>,
    pub reservations: Vec<Reservation>,
    pub subscriptions: Vec<Subscription>,
}

impl VertiportState {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            record: None,
            reservations: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    /// Insert a reservation maintaining sort order by start time.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.time_start().value, |r| r.time_start().value)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Uuid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id() == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn get_reservation(&self, id: Uuid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id() == id)
    }

    /// Reservations whose extent strictly overlaps the filter.
    /// Binary search skips everything starting at or after the query end.
    pub fn reservations_overlapping<'a>(
        &'a self,
        area: &'a SearchArea,
    ) -> impl Iterator<Item = &'a Reservation> {
        let right_bound = match area.time_end {
            Some(end) => self
                .reservations
                .partition_point(|r| r.time_start().value < end.value),
            None => self.reservations.len(),
        };
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.extent().overlaps(area))
    }

    pub fn insert_subscription(&mut self, subscription: Subscription) {
        let pos = self
            .subscriptions
            .binary_search_by_key(&subscription.time_start.value, |s| s.time_start.value)
            .unwrap_or_else(|e| e);
        self.subscriptions.insert(pos, subscription);
    }

    pub fn remove_subscription(&mut self, id: Uuid) -> Option<Subscription> {
        let pos = self.subscriptions.iter().position(|s| s.id == id)?;
        Some(self.subscriptions.remove(pos))
    }

    pub fn get_subscription(&self, id: Uuid) -> Option<&Subscription> {
        self.subscriptions.iter().find(|s| s.id == id)
    }

    pub fn subscriptions_overlapping<'a>(
        &'a self,
        area: &'a SearchArea,
    ) -> impl Iterator<Item = &'a Subscription> {
        let right_bound = match area.time_end {
            Some(end) => self
                .subscriptions
                .partition_point(|s| s.time_start.value < end.value),
            None => self.subscriptions.len(),
        };
        self.subscriptions[..right_bound]
            .iter()
            .filter(move |s| s.extent().overlaps(area))
    }

    /// Ids of operational intents attached to a subscription.
    pub fn dependent_intents(&self, subscription_id: Uuid) -> Vec<Uuid> {
        self.reservations
            .iter()
            .filter_map(|r| match r {
                Reservation::OperationalIntent(op) if op.subscription_id == subscription_id => {
                    Some(op.id)
                }
                _ => None,
            })
            .collect()
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
/// Entity upserts carry a full snapshot plus the ids of the subscriptions
/// whose notification index the write incremented, so replay reproduces the
/// indices exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    VertiportUpserted {
        vertiport: Vertiport,
    },
    VertiportDeleted {
        id: Uuid,
    },
    OperationalIntentUpserted {
        intent: OperationalIntent,
        notified: Vec<Uuid>,
    },
    OperationalIntentDeleted {
        id: Uuid,
        vertiport_id: Uuid,
        notified: Vec<Uuid>,
    },
    ConstraintUpserted {
        constraint: Constraint,
        notified: Vec<Uuid>,
    },
    ConstraintDeleted {
        id: Uuid,
        vertiport_id: Uuid,
        notified: Vec<Uuid>,
    },
    SubscriptionUpserted {
        subscription: Subscription,
    },
    SubscriptionDeleted {
        id: Uuid,
        vertiport_id: Uuid,
    },
}

impl Event {
    /// Every event is scoped to exactly one vertiport.
    pub fn vertiport_id(&self) -> Uuid {
        match self {
            Event::VertiportUpserted { vertiport } => vertiport.id,
            Event::VertiportDeleted { id } => *id,
            Event::OperationalIntentUpserted { intent, .. } => intent.vertiport_id,
            Event::OperationalIntentDeleted { vertiport_id, .. } => *vertiport_id,
            Event::ConstraintUpserted { constraint, .. } => constraint.vertiport_id,
            Event::ConstraintDeleted { vertiport_id, .. } => *vertiport_id,
            Event::SubscriptionUpserted { subscription } => subscription.vertiport_id,
            Event::SubscriptionDeleted { vertiport_id, .. } => *vertiport_id,
        }
    }
}

// ── Mutation parameter / response types ──────────────────────────

/// Implicit subscription request embedded in an operational intent put.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSubscriptionParams {
    pub uss_base_url: String,
    pub notify_for_constraints: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutOperationalIntentParams {
    pub extent: Extent,
    pub state: OperationalIntentState,
    pub uss_base_url: String,
    pub old_version: i32,
    /// OVNs of every entity the writer is aware of in the affected extent.
    pub key: Vec<Ovn>,
    pub subscription_id: Option<Uuid>,
    pub new_subscription: Option<NewSubscriptionParams>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeOperationalIntentResponse {
    pub operational_intent_reference: OperationalIntent,
    pub subscribers: Vec<SubscriberToNotify>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutConstraintParams {
    pub extent: Extent,
    pub uss_base_url: String,
    pub old_version: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeConstraintResponse {
    pub constraint_reference: Constraint,
    pub subscribers: Vec<SubscriberToNotify>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutSubscriptionParams {
    pub vertiport_id: Uuid,
    pub zone: Zone,
    pub time_start: Option<Time>,
    pub time_end: Option<Time>,
    pub uss_base_url: String,
    pub notify_for_operational_intents: bool,
    pub notify_for_constraints: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutSubscriptionResponse {
    pub subscription: Subscription,
    /// Entities already in the subscribed area, per the notify flags.
    pub operational_intent_references: Vec<OperationalIntent>,
    pub constraint_references: Vec<Constraint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSubscriptionResponse {
    pub subscription: Subscription,
    pub dependent_operational_intents: Vec<Uuid>,
}

/// Parking occupancy over a query window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkingUsage {
    pub number_of_places: i32,
    pub number_of_used_places: i32,
    pub number_of_available_places: i32,
}
