//! Gateway: HTTP listener for the Telegram webhook and health probes.
//!
//! Single port. `POST /telegram` validates and acknowledges updates immediately,
//! handing accepted events to the dispatch bridge; `GET /healthz` reports backend
//! reachability and dispatch counters.

mod server;

pub use server::{build_router, run_gateway, set_webhook, sweep_sessions, GatewayState};
