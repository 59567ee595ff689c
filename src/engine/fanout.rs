use std::collections::BTreeMap;

use uuid::Uuid;

use crate::model::{SearchArea, SubscriberToNotify, Subscription, SubscriptionState, VertiportState};

/// Which interest flag a write triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterestKind {
    OperationalIntents,
    Constraints,
}

/// Ids of subscriptions that must be told about a write to `area`.
/// The writer's own subscriptions are included; a USS is expected to track
/// notification indices for its own entities too.
pub fn interested_subscription_ids(
    vs: &VertiportState,
    area: &SearchArea,
    kind: InterestKind,
) -> Vec<Uuid> {
    vs.subscriptions_overlapping(area)
        .filter(|s| match kind {
            InterestKind::OperationalIntents => s.notify_for_operational_intents,
            InterestKind::Constraints => s.notify_for_constraints,
        })
        .map(|s| s.id)
        .collect()
}

/// Bump notification indices in place. Called when applying an upsert/delete
/// event, so replay reproduces the indices a live write produced.
pub fn bump_notification_indices(vs: &mut VertiportState, ids: &[Uuid]) {
    for sub in &mut vs.subscriptions {
        if ids.contains(&sub.id) {
            sub.notification_index += 1;
        }
    }
}

/// Group notified subscriptions by USS base URL. Deterministic: targets are
/// sorted by URL, subscriptions within a target by id.
pub fn subscribers_to_notify(subscriptions: &[&Subscription]) -> Vec<SubscriberToNotify> {
    let mut by_url: BTreeMap<&str, Vec<SubscriptionState>> = BTreeMap::new();
    for sub in subscriptions {
        by_url
            .entry(sub.uss_base_url.as_str())
            .or_default()
            .push(SubscriptionState {
                subscription_id: sub.id,
                notification_index: sub.notification_index,
            });
    }
    by_url
        .into_iter()
        .map(|(url, mut states)| {
            states.sort_by_key(|s| s.subscription_id);
            SubscriberToNotify {
                uss_base_url: url.to_string(),
                subscriptions: states,
            }
        })
        .collect()
}
