//! solvergrid-api — REST control surface for a SolverGrid node.
//!
//! Every route is answered by the node it is sent to; cluster-wide routes
//! (solver lookup, listing, load) consult the other members through the
//! node's `SolverServer`.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/node` | This node's availability and usage |
//! | GET | `/api/v1/master` | Current master address |
//! | GET | `/api/v1/cluster/load` | Aggregated load of all members |
//! | GET | `/api/v1/solvers/{kind}` | List solvers of a kind |
//! | POST | `/api/v1/solvers/{kind}` | Create a solver (admin) |
//! | GET | `/api/v1/solvers/{kind}/{key}` | Solver details |
//! | DELETE | `/api/v1/solvers/{kind}/{key}` | Remove a solver (admin) |
//! | POST | `/api/v1/solvers/{kind}/{key}/refresh` | Reload a solver (admin) |
//! | POST | `/api/v1/sectioning/{key}/batch` | Section a batch of requests |
//! | POST | `/api/v1/shutdown` | Stop the daemon (admin) |
//!
//! Callers identify themselves with the `x-solvergrid-user` and
//! `x-solvergrid-role` headers (plus `x-solvergrid-student` for students).

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::sync::watch;

use solvergrid_sectioning::RightsRegistry;
use solvergrid_solver::SolverServer;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub server: SolverServer,
    pub rights: Arc<RightsRegistry>,
    /// Set to `true` by `POST /shutdown`.
    pub shutdown: Arc<watch::Sender<bool>>,
}

impl ApiState {
    pub fn new(server: SolverServer, shutdown: watch::Sender<bool>) -> Self {
        Self {
            server,
            rights: Arc::new(RightsRegistry::default()),
            shutdown: Arc::new(shutdown),
        }
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/node", get(handlers::node_info))
        .route("/master", get(handlers::master))
        .route("/cluster/load", get(handlers::cluster_load))
        .route("/solvers/{kind}", get(handlers::list_solvers).post(handlers::create_solver))
        .route(
            "/solvers/{kind}/{key}",
            get(handlers::get_solver).delete(handlers::remove_solver),
        )
        .route("/solvers/{kind}/{key}/refresh", post(handlers::refresh_solver))
        .route("/sectioning/{key}/batch", post(handlers::section_batch))
        .route("/shutdown", post(handlers::shutdown))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
