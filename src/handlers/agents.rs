use crate::{error::AppResult, state::AppState};
use actix_web::{http::header, web, HttpRequest, HttpResponse};
use serde_json::json;

/// `GET /api/v1/virtual-agents`
pub async fn list_virtual_agents(req: HttpRequest, state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let authorization = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    state.gateway.authorize(authorization).await?;

    let agents: Vec<_> = state
        .gateway
        .list_agents()
        .into_iter()
        .map(|agent| {
            json!({
                "agent_id": agent.agent_id,
                "agent_name": agent.display_name,
                "is_default": agent.is_default
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(json!({ "agents": agents })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::jwks::DEFAULT_KEY_TTL;
    use crate::auth::{AuthGate, AuthPolicy, KeyCache, TokenValidator};
    use crate::config::{AppConfig, AuthConfig, GatewayConfig};
    use crate::gateway::TransportGateway;
    use crate::router::tests::StaticConnector;
    use crate::router::VirtualAgentRouter;
    use actix_web::{test, App};
    use std::sync::Arc;

    async fn state(auth: AuthGate) -> AppState {
        let mut router = VirtualAgentRouter::new();
        router.register(StaticConnector::new("static", &[("BotA", false), ("BotB", true)])).await;
        let gateway = TransportGateway::new(Arc::new(router), auth, GatewayConfig::default());
        AppState::new(AppConfig::default(), gateway)
    }

    #[actix_web::test]
    async fn test_lists_agents() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state(AuthGate::disabled()).await))
                .route("/api/v1/virtual-agents", web::get().to(list_virtual_agents)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/virtual-agents").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["agents"][0]["agent_id"], "BotA");
        assert_eq!(body["agents"][0]["is_default"], false);
        assert_eq!(body["agents"][1]["agent_name"], "BotB");
        assert_eq!(body["agents"][1]["is_default"], true);
    }

    #[actix_web::test]
    async fn test_enforcement_rejects_missing_token() {
        let auth_config = AuthConfig {
            enabled: true,
            enforce: true,
            datasource_url: "https://gateway.example.com/voice".to_string(),
            ..AuthConfig::default()
        };
        let keys = Arc::new(KeyCache::new(reqwest::Client::new(), DEFAULT_KEY_TTL));
        let gate = AuthGate::new(
            AuthPolicy::from_config(&auth_config),
            Arc::new(TokenValidator::new(&auth_config, keys)),
        );
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state(gate).await))
                .route("/api/v1/virtual-agents", web::get().to(list_virtual_agents)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/virtual-agents").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::UNAUTHORIZED);
    }
}
