//! The simulated cluster's administrative HTTP endpoint.
//!
//! Serves `GET /pools/default/buckets/:bucket` with the bucket configuration
//! document the topology refresher reads.

use std::{
    future::Future,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use super::ClusterMap;
use crate::topology::BucketConfig;

#[derive(Clone)]
struct AdminState {
    bucket: Arc<str>,
    map: Arc<Mutex<ClusterMap>>,
}

pub struct SimAdmin {
    listener: TcpListener,
    state: AdminState,
}

impl SimAdmin {
    pub(crate) fn new(listener: TcpListener, bucket: &str, map: Arc<Mutex<ClusterMap>>) -> Self {
        Self {
            listener,
            state: AdminState {
                bucket: Arc::from(bucket),
                map,
            },
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = Router::new()
            .route("/pools/default/buckets/:bucket", get(bucket_config))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state);

        axum::serve(self.listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .context("admin server failed")
    }
}

async fn bucket_config(
    State(state): State<AdminState>,
    Path(bucket): Path<String>,
) -> Result<Json<BucketConfig>, StatusCode> {
    if bucket != *state.bucket {
        return Err(StatusCode::NOT_FOUND);
    }
    let map = state.map.lock().unwrap_or_else(PoisonError::into_inner);
    if !map.available {
        debug!(%bucket, "admin endpoint unavailable");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    match map.table() {
        Ok(table) => Ok(Json(table.to_bucket_config(&bucket))),
        Err(error) => {
            warn!(%bucket, %error, "cluster map is inconsistent");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
