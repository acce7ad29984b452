//! REST collaborator seam for authoritative order data.
//!
//! The engine only consumes two endpoints: the customer's order list used
//! for staleness cleanup/backfill, and the single-order status check used to
//! validate pushes for unknown orders.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Mutex, PoisonError},
};

use serde::Deserialize;
use tracing::debug;

use sync_core::{OrderSnapshotEntry, OrderStatus, SyncError, SyncErrorCategory, classify_http_status};

/// Authoritative order endpoints consumed by the tracker.
pub trait OrderApi: Send + Sync {
    /// `GET /customers/orders/:id`: the authoritative order list.
    fn fetch_orders(&self)
    -> impl Future<Output = Result<Vec<OrderSnapshotEntry>, SyncError>> + Send;

    /// `GET /orders/:id/status`; `Ok(None)` means the order no longer exists.
    fn fetch_order_status(
        &self,
        order_id: &str,
    ) -> impl Future<Output = Result<Option<OrderStatus>, SyncError>> + Send;
}

#[derive(Debug, Deserialize)]
struct OrderStatusDoc {
    status: OrderStatus,
}

/// `reqwest`-backed implementation of [`OrderApi`].
#[derive(Debug, Clone)]
pub struct HttpOrderApi {
    client: reqwest::Client,
    base_url: String,
    customer_id: String,
    auth_token: Option<String>,
}

impl HttpOrderApi {
    pub fn new(
        base_url: impl Into<String>,
        customer_id: impl Into<String>,
        auth_token: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            customer_id: customer_id.into(),
            auth_token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn get(&self, url: String) -> Result<reqwest::Response, SyncError> {
        let mut request = self.client.get(&url);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        request.send().await.map_err(|err| {
            SyncError::new(
                SyncErrorCategory::Connection,
                "order_api_unreachable",
                format!("GET {url}: {err}"),
            )
        })
    }
}

impl OrderApi for HttpOrderApi {
    async fn fetch_orders(&self) -> Result<Vec<OrderSnapshotEntry>, SyncError> {
        let url = self.url(&format!("customers/orders/{}", self.customer_id));
        let response = self.get(url.clone()).await?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(SyncError::new(
                classify_http_status(status),
                "order_list_failed",
                format!("GET {url} returned {status}"),
            ));
        }

        response.json::<Vec<OrderSnapshotEntry>>().await.map_err(|err| {
            SyncError::new(
                SyncErrorCategory::Serialization,
                "order_list_unreadable",
                err.to_string(),
            )
        })
    }

    async fn fetch_order_status(&self, order_id: &str) -> Result<Option<OrderStatus>, SyncError> {
        let url = self.url(&format!("orders/{order_id}/status"));
        let response = self.get(url.clone()).await?;

        let status = response.status().as_u16();
        if matches!(status, 404 | 410) {
            debug!(%order_id, "server reports order gone");
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(SyncError::new(
                classify_http_status(status),
                "order_status_failed",
                format!("GET {url} returned {status}"),
            ));
        }

        let doc = response.json::<OrderStatusDoc>().await.map_err(|err| {
            SyncError::new(
                SyncErrorCategory::Serialization,
                "order_status_unreadable",
                err.to_string(),
            )
        })?;
        Ok(Some(doc.status))
    }
}

/// Scripted implementation used by tests and the smoke binary.
#[derive(Debug, Default)]
pub struct StaticOrderApi {
    orders: Mutex<Vec<OrderSnapshotEntry>>,
    statuses: Mutex<HashMap<String, Option<OrderStatus>>>,
}

impl StaticOrderApi {
    pub fn new(orders: Vec<OrderSnapshotEntry>) -> Self {
        Self {
            orders: Mutex::new(orders),
            statuses: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the authoritative order list returned by `fetch_orders`.
    pub fn set_orders(&self, orders: Vec<OrderSnapshotEntry>) {
        *self
            .orders
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = orders;
    }

    /// Script the status answer for one order (`None` = order gone).
    pub fn set_status(&self, order_id: impl Into<String>, status: Option<OrderStatus>) {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(order_id.into(), status);
    }
}

impl OrderApi for StaticOrderApi {
    async fn fetch_orders(&self) -> Result<Vec<OrderSnapshotEntry>, SyncError> {
        Ok(self
            .orders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn fetch_order_status(&self, order_id: &str) -> Result<Option<OrderStatus>, SyncError> {
        Ok(self
            .statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(order_id)
            .copied()
            .unwrap_or(Some(OrderStatus::Pending)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_api_serves_scripted_answers() {
        let api = StaticOrderApi::default();
        api.set_status("O9", None);

        assert_eq!(
            api.fetch_order_status("O9").await.expect("status answer"),
            None
        );
        assert_eq!(
            api.fetch_order_status("O1").await.expect("status answer"),
            Some(OrderStatus::Pending)
        );
        assert!(api.fetch_orders().await.expect("order list").is_empty());
    }
}
