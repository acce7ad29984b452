//! Order tracking table merging partial pushes with authoritative snapshots.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    types::{OrderItem, OrderStatus, OrderTrackingRecord},
    wire::OrderStatusPushPayload,
};

/// Canonical partial update derived from a `notifyOrderStatus` push.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderUpdate {
    pub order_id: String,
    pub status: OrderStatus,
    pub tracking_info: Option<String>,
    pub restaurant_address: Option<String>,
    pub customer_address: Option<String>,
    pub driver_ref: Option<String>,
    pub updated_at_ms: Option<u64>,
}

impl From<&OrderStatusPushPayload> for OrderUpdate {
    fn from(payload: &OrderStatusPushPayload) -> Self {
        Self {
            order_id: payload.order_id.clone(),
            status: payload.status,
            tracking_info: payload.tracking_info.clone(),
            restaurant_address: payload.restaurant_address.clone(),
            customer_address: payload.customer_address.clone(),
            driver_ref: payload
                .driver_details
                .as_ref()
                .and_then(|details| details.driver_id.clone()),
            updated_at_ms: payload.updated_at,
        }
    }
}

/// One entry of the authoritative REST order list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderSnapshotEntry {
    #[serde(alias = "order_id", alias = "id")]
    pub order_id: String,
    pub status: OrderStatus,
    #[serde(default, alias = "restaurant_address")]
    pub restaurant_address: Option<String>,
    #[serde(default, alias = "customer_address")]
    pub customer_address: Option<String>,
    #[serde(default, alias = "total_amount")]
    pub total_amount: Option<f64>,
    #[serde(default, alias = "order_items")]
    pub order_items: Vec<OrderItem>,
    #[serde(default, alias = "updated_at")]
    pub updated_at_ms: Option<u64>,
}

/// Effect of one push merge.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    Created(OrderTrackingRecord),
    Merged(OrderTrackingRecord),
    /// Re-applied update with no observable effect.
    Unchanged,
}

/// Effect of one authoritative snapshot pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotOutcome {
    /// Locally tracked orders absent from the snapshot, now removed.
    pub removed: Vec<String>,
    /// Records created or backfilled by the snapshot.
    pub updated: Vec<OrderTrackingRecord>,
}

/// Table of tracked orders keyed by order id.
#[derive(Debug, Default)]
pub struct OrderTracker {
    orders: HashMap<String, OrderTrackingRecord>,
}

impl OrderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, order_id: &str) -> Option<&OrderTrackingRecord> {
        self.orders.get(order_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &OrderTrackingRecord> {
        self.orders.values()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Merge a partial push onto the table.
    ///
    /// Missing fields retain prior values; an unknown order id creates a
    /// minimal record. `updated_at` is the max of both sides, so replaying
    /// the same update is a no-op. A terminal status retains the record and
    /// flags it for the UI; deletion only happens via snapshot absence or an
    /// explicit clear.
    pub fn apply_push(&mut self, update: OrderUpdate, now_ms: u64) -> PushOutcome {
        match self.orders.get(&update.order_id) {
            None => {
                let mut record = OrderTrackingRecord::minimal(
                    update.order_id.clone(),
                    update.status,
                    update.updated_at_ms.unwrap_or(now_ms),
                );
                record.tracking_info = update.tracking_info;
                record.restaurant_address = update.restaurant_address;
                record.customer_address = update.customer_address;
                record.driver_ref = update.driver_ref;
                self.orders.insert(update.order_id, record.clone());
                debug!(order_id = %record.order_id, "created tracking record from push");
                PushOutcome::Created(record)
            }
            Some(existing) => {
                let mut merged = existing.clone();
                merged.status = update.status;
                if update.tracking_info.is_some() {
                    merged.tracking_info = update.tracking_info;
                }
                if update.restaurant_address.is_some() {
                    merged.restaurant_address = update.restaurant_address;
                }
                if update.customer_address.is_some() {
                    merged.customer_address = update.customer_address;
                }
                if update.driver_ref.is_some() {
                    merged.driver_ref = update.driver_ref;
                }
                merged.updated_at_ms = merged
                    .updated_at_ms
                    .max(update.updated_at_ms.unwrap_or(merged.updated_at_ms));
                if update.status == OrderStatus::Delivered {
                    merged.awaiting_rating = true;
                }

                if &merged == existing {
                    PushOutcome::Unchanged
                } else {
                    self.orders.insert(merged.order_id.clone(), merged.clone());
                    PushOutcome::Merged(merged)
                }
            }
        }
    }

    /// Reconcile against the authoritative order list.
    ///
    /// Removes stale local entries and backfills fields the push stream does
    /// not carry; it never rewinds status or tracking info delivered by
    /// fresher pushes.
    pub fn apply_snapshot(
        &mut self,
        entries: &[OrderSnapshotEntry],
        now_ms: u64,
    ) -> SnapshotOutcome {
        let mut outcome = SnapshotOutcome::default();

        let known: Vec<String> = self.orders.keys().cloned().collect();
        for order_id in known {
            if !entries.iter().any(|entry| entry.order_id == order_id) {
                self.orders.remove(&order_id);
                info!(%order_id, "removed stale tracking record absent from snapshot");
                outcome.removed.push(order_id);
            }
        }

        for entry in entries {
            match self.orders.get_mut(&entry.order_id) {
                None => {
                    let mut record = OrderTrackingRecord::minimal(
                        entry.order_id.clone(),
                        entry.status,
                        entry.updated_at_ms.unwrap_or(now_ms),
                    );
                    record.restaurant_address = entry.restaurant_address.clone();
                    record.customer_address = entry.customer_address.clone();
                    record.total_amount = entry.total_amount;
                    record.order_items = entry.order_items.clone();
                    self.orders.insert(entry.order_id.clone(), record.clone());
                    outcome.updated.push(record);
                }
                Some(existing) => {
                    let before = existing.clone();
                    if existing.restaurant_address.is_none() {
                        existing.restaurant_address = entry.restaurant_address.clone();
                    }
                    if existing.customer_address.is_none() {
                        existing.customer_address = entry.customer_address.clone();
                    }
                    if existing.total_amount.is_none() {
                        existing.total_amount = entry.total_amount;
                    }
                    if existing.order_items.is_empty() {
                        existing.order_items = entry.order_items.clone();
                    }
                    existing.updated_at_ms = existing
                        .updated_at_ms
                        .max(entry.updated_at_ms.unwrap_or(existing.updated_at_ms));
                    if existing != &before {
                        outcome.updated.push(existing.clone());
                    }
                }
            }
        }

        outcome
    }

    /// Drop one tracked order (explicit UI clear or stale server reference).
    pub fn remove(&mut self, order_id: &str) -> bool {
        self.orders.remove(order_id).is_some()
    }

    /// Drop every tracked order (reconnect give-up, logout).
    pub fn clear(&mut self) {
        self.orders.clear();
    }
}

/// Fixed ordered stage index used by progress displays.
///
/// Statuses outside the progress ladder yield stage 0.
pub fn stage_index(status: OrderStatus) -> u8 {
    match status {
        OrderStatus::Pending => 1,
        OrderStatus::Confirmed => 2,
        OrderStatus::Preparing => 3,
        OrderStatus::ReadyForPickup => 4,
        OrderStatus::PickedUp => 5,
        OrderStatus::EnRoute => 6,
        OrderStatus::Delivered => 7,
        OrderStatus::Cancelled | OrderStatus::Unknown => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(order_id: &str, status: OrderStatus, ts: Option<u64>) -> OrderUpdate {
        OrderUpdate {
            order_id: order_id.to_owned(),
            status,
            tracking_info: None,
            restaurant_address: None,
            customer_address: None,
            driver_ref: None,
            updated_at_ms: ts,
        }
    }

    fn entry(order_id: &str, status: OrderStatus) -> OrderSnapshotEntry {
        OrderSnapshotEntry {
            order_id: order_id.to_owned(),
            status,
            restaurant_address: None,
            customer_address: None,
            total_amount: None,
            order_items: Vec::new(),
            updated_at_ms: None,
        }
    }

    #[test]
    fn push_for_unknown_order_creates_minimal_record() {
        let mut tracker = OrderTracker::new();
        let outcome = tracker.apply_push(update("O1", OrderStatus::Pending, Some(100)), 50);
        assert!(matches!(outcome, PushOutcome::Created(_)));
        let record = tracker.get("O1").expect("record exists");
        assert_eq!(record.updated_at_ms, 100);
        assert_eq!(record.order_items.len(), 0);
    }

    #[test]
    fn reapplying_the_same_push_is_a_no_op() {
        let mut tracker = OrderTracker::new();
        let mut push = update("O1", OrderStatus::Preparing, Some(100));
        push.tracking_info = Some("being prepared".to_owned());

        tracker.apply_push(push.clone(), 50);
        let first = tracker.get("O1").cloned().expect("record exists");

        let outcome = tracker.apply_push(push, 60);
        assert_eq!(outcome, PushOutcome::Unchanged);
        assert_eq!(tracker.get("O1"), Some(&first));
    }

    #[test]
    fn partial_push_retains_prior_fields_and_updated_at_is_monotonic() {
        let mut tracker = OrderTracker::new();
        let mut first = update("O1", OrderStatus::Confirmed, Some(200));
        first.restaurant_address = Some("12 Baker St".to_owned());
        tracker.apply_push(first, 0);

        // A late-arriving push with an older timestamp and no address.
        tracker.apply_push(update("O1", OrderStatus::Preparing, Some(150)), 0);

        let record = tracker.get("O1").expect("record exists");
        assert_eq!(record.restaurant_address.as_deref(), Some("12 Baker St"));
        assert_eq!(record.status, OrderStatus::Preparing);
        assert_eq!(record.updated_at_ms, 200);
    }

    #[test]
    fn terminal_push_retains_record_and_flags_rating() {
        let mut tracker = OrderTracker::new();
        tracker.apply_push(update("O1", OrderStatus::EnRoute, Some(100)), 0);
        tracker.apply_push(update("O1", OrderStatus::Delivered, Some(200)), 0);

        let record = tracker.get("O1").expect("record retained");
        assert!(record.awaiting_rating);
        assert_eq!(record.status, OrderStatus::Delivered);
    }

    #[test]
    fn snapshot_removes_orders_absent_from_authoritative_list() {
        // Scenario: O9 tracked locally, fresh snapshot no longer lists it.
        let mut tracker = OrderTracker::new();
        tracker.apply_push(update("O9", OrderStatus::EnRoute, Some(100)), 0);
        tracker.apply_push(update("O2", OrderStatus::Pending, Some(100)), 0);

        let outcome = tracker.apply_snapshot(&[entry("O2", OrderStatus::Pending)], 200);

        assert_eq!(outcome.removed, vec!["O9".to_owned()]);
        assert!(tracker.get("O9").is_none());
        assert!(tracker.get("O2").is_some());
    }

    #[test]
    fn snapshot_backfills_without_rewinding_push_fields() {
        let mut tracker = OrderTracker::new();
        let mut push = update("O1", OrderStatus::EnRoute, Some(300));
        push.tracking_info = Some("almost there".to_owned());
        tracker.apply_push(push, 0);

        let mut listed = entry("O1", OrderStatus::Preparing);
        listed.total_amount = Some(23.5);
        listed.order_items = vec![OrderItem {
            name: "Pad thai".to_owned(),
            quantity: 2,
        }];
        let outcome = tracker.apply_snapshot(&[listed], 400);

        let record = tracker.get("O1").expect("record exists");
        assert_eq!(outcome.updated.len(), 1);
        assert_eq!(record.total_amount, Some(23.5));
        assert_eq!(record.order_items.len(), 1);
        // Push-delivered fields stay authoritative.
        assert_eq!(record.status, OrderStatus::EnRoute);
        assert_eq!(record.tracking_info.as_deref(), Some("almost there"));
    }

    #[test]
    fn stage_indices_follow_the_progress_ladder() {
        assert_eq!(stage_index(OrderStatus::Pending), 1);
        assert_eq!(stage_index(OrderStatus::EnRoute), 6);
        assert_eq!(stage_index(OrderStatus::Delivered), 7);
        assert_eq!(stage_index(OrderStatus::Cancelled), 0);
        assert_eq!(stage_index(OrderStatus::Unknown), 0);
    }
}
