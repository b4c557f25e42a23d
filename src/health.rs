use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = &state.config;
    let agents = state.gateway.list_agents();

    HttpResponse::Ok().json(json!({
        "status": if agents.is_empty() { "degraded" } else { "healthy" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "voice-agent-gateway",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "gateway": {
            "registered_agents": agents.len(),
            "active_conversations": state.gateway.active_conversations().await,
            "auth_policy": state.gateway.auth_policy().as_str()
        }
    }))
}

/// `GET /api/v1/monitoring/snapshot`: live conversations and recent lifecycle events.
pub async fn monitoring_snapshot(state: web::Data<AppState>) -> HttpResponse {
    let snapshot = state.gateway.snapshot().await;
    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "active_conversations": snapshot.conversations.len() + snapshot.busy_conversations.len(),
        "conversations": snapshot.conversations,
        "busy_conversations": snapshot.busy_conversations,
        "recent_events": snapshot.recent_events
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthGate;
    use crate::config::{AppConfig, GatewayConfig};
    use crate::gateway::messages::{CallerRequest, RequestKind};
    use crate::gateway::TransportGateway;
    use crate::router::tests::StaticConnector;
    use crate::router::VirtualAgentRouter;
    use actix_web::{test, App};
    use std::sync::Arc;

    #[actix_web::test]
    async fn test_snapshot_lists_conversations() {
        let mut router = VirtualAgentRouter::new();
        router.register(StaticConnector::new("static", &[("BotA", true)])).await;
        let gateway = TransportGateway::new(Arc::new(router), AuthGate::disabled(), GatewayConfig::default());
        let state = AppState::new(AppConfig::default(), gateway);

        let mut start = CallerRequest::new("call-1", RequestKind::Start);
        start.agent_id = "BotA".to_string();
        state.gateway.handle(uuid::Uuid::new_v4(), start, None).await;

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check))
                .route("/api/v1/monitoring/snapshot", web::get().to(monitoring_snapshot)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/monitoring/snapshot").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["active_conversations"], 1);
        assert_eq!(body["conversations"][0]["conversation_id"], "call-1");
        assert_eq!(body["conversations"][0]["state"], "ACTIVE");
        assert_eq!(body["recent_events"][0]["kind"], "start");

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["gateway"]["auth_policy"], "disabled");
    }
}
