use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

pub const FALLBACK_PATH: &str = "/fallback/servico-indisponivel";

pub const INTEGRATION_ERROR_CODE: &str = "ERRO_INTEGRACAO";

pub const INTEGRATION_ERROR_MESSAGE: &str = "O serviço solicitado está temporariamente indisponível. Por favor, tente novamente mais tarde.";

/// Static payload served when no gateway route applies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackPayload {
    pub codigo: String,
    pub mensagem: String,
}

impl Default for FallbackPayload {
    fn default() -> Self {
        Self {
            codigo: INTEGRATION_ERROR_CODE.to_string(),
            mensagem: INTEGRATION_ERROR_MESSAGE.to_string(),
        }
    }
}

/// `GET /fallback/servico-indisponivel`
pub async fn service_unavailable() -> impl IntoResponse {
    unmatched_route()
}

/// 503 returned for requests no route matches
pub fn unmatched_route() -> Response<Body> {
    (StatusCode::SERVICE_UNAVAILABLE, Json(FallbackPayload::default())).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unmatched_route_payload() {
        let response = unmatched_route();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["content-type"], "application/json");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let payload: FallbackPayload = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.codigo, "ERRO_INTEGRACAO");
        assert!(payload.mensagem.starts_with("O serviço solicitado"));
    }

    #[tokio::test]
    async fn test_fallback_endpoint_matches_unmatched_route() {
        let response = service_unavailable().await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
