//! # Application State
//!
//! Shared state handed to every HTTP handler and WebSocket actor.
//!
//! ## Key Rust Concepts:
//! - **Arc**: handlers run on several worker threads, so everything shared is reference counted
//! - **Build once, read many**: connectors, the router and the auth gate are assembled at
//!   startup; afterwards only the gateway's internal registry changes

use crate::auth::{AuthGate, AuthPolicy, KeyCache, TokenValidator};
use crate::config::AppConfig;
use crate::connectors::build_connector;
use crate::error::{AppResult, GatewayError};
use crate::gateway::TransportGateway;
use crate::router::VirtualAgentRouter;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub gateway: Arc<TransportGateway>,
    /// When the server started
    pub start_time: Instant,
}

impl AppState {
    /// Build connectors, the router and the auth gate from `config`.
    pub async fn build(config: AppConfig) -> AppResult<Self> {
        let mut router = VirtualAgentRouter::new();
        for connector_config in &config.connectors {
            let connector = build_connector(connector_config)?;
            let accepted = router.register(connector).await;
            if accepted == 0 {
                warn!(connector = %connector_config.name(), "Connector registered no agents");
            }
        }
        if router.is_empty() {
            warn!("No virtual agents registered, every START will be rejected");
        } else {
            info!(agents = router.len(), "Virtual agent router ready");
        }

        let gateway = TransportGateway::new(Arc::new(router), auth_gate(&config)?, config.gateway.clone());
        Ok(Self::new(config, gateway))
    }

    pub fn new(config: AppConfig, gateway: TransportGateway) -> Self {
        Self {
            config: Arc::new(config),
            gateway: Arc::new(gateway),
            start_time: Instant::now(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

fn auth_gate(config: &AppConfig) -> AppResult<AuthGate> {
    let policy = AuthPolicy::from_config(&config.auth);
    info!(policy = policy.as_str(), "Token validation policy");
    if policy == AuthPolicy::Disabled {
        return Ok(AuthGate::disabled());
    }

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| GatewayError::Configuration(format!("key endpoint HTTP client: {}", e)))?;
    let ttl = Duration::from_secs(config.auth.key_cache_ttl_minutes * 60);
    let keys = Arc::new(KeyCache::new(http, ttl));
    let validator = Arc::new(TokenValidator::new(&config.auth, keys));
    Ok(AuthGate::new(policy, validator))
}
