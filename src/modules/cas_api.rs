/// CAS HTTP endpoints
///
/// Thin orchestration over the ticket engine: login, logout, service and
/// proxy ticket validation, and proxy ticket issuance. Pages are JSON
/// documents; the session is carried in the `tgt` cookie.
use crate::authenticator::{authenticate, Authenticator, Credentials};
use crate::config::Settings;
use crate::ticket::error::ValidationError;
use crate::ticket::service_url::{clean_service_url, service_uri_with_ticket};
use crate::ticket::types::{ExtraAttributes, TicketGrantingTicket};
use crate::ticket::TicketBroker;
use axum::{
    extract::{Query, State},
    http::{
        header::{COOKIE, LOCATION, SET_COOKIE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::get,
    Form, Json, Router,
};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Name of the cookie holding the ticket-granting ticket.
pub const TGT_COOKIE: &str = "tgt";

const INVALID_SERVICE_MESSAGE: &str = "The target service your browser supplied appears to be invalid. Please contact your system administrator for help.";

/// Shared state for CAS endpoints
pub struct CasApiState {
    pub broker: TicketBroker,
    pub authenticator: Arc<dyn Authenticator>,
}

pub fn router(state: Arc<CasApiState>) -> Router {
    Router::new()
        .route("/login", get(login_page).post(login_submit))
        .route("/logout", get(logout))
        .route("/serviceValidate", get(service_validate))
        .route("/proxyValidate", get(proxy_validate))
        .route("/proxy", get(proxy))
        .with_state(state)
}

// ==================== Request/Response Types ====================

#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    pub service: Option<String>,
    pub renew: Option<String>,
    pub gateway: Option<String>,
    pub redirection_loop_intercepted: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub username: Option<String>,
    pub password: Option<String>,
    pub lt: Option<String>,
    pub service: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LogoutQuery {
    pub service: Option<String>,
    pub destination: Option<String>,
    pub gateway: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ValidateQuery {
    pub service: Option<String>,
    pub ticket: Option<String>,
    #[serde(rename = "pgtUrl")]
    pub pgt_url: Option<String>,
    pub renew: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProxyQuery {
    pub pgt: Option<String>,
    #[serde(rename = "targetService")]
    pub target_service: Option<String>,
}

/// Login form state returned instead of a rendered page.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginPage {
    pub login_ticket: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResponseDocument {
    pub service_response: ServiceResponse,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ServiceResponse {
    AuthenticationSuccess(AuthenticationSuccess),
    AuthenticationFailure(Failure),
    ProxySuccess(ProxySuccess),
    ProxyFailure(Failure),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationSuccess {
    pub user: String,
    pub attributes: ExtraAttributes,
    /// Iou of the PGT delivered to the callback, never the PGT itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_granting_ticket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxies: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySuccess {
    pub proxy_ticket: String,
}

#[derive(Debug, Serialize)]
pub struct Failure {
    pub code: String,
    pub description: String,
}

impl From<&ValidationError> for Failure {
    fn from(e: &ValidationError) -> Self {
        Failure {
            code: e.code().to_string(),
            description: e.to_string(),
        }
    }
}

/// Page-level failure outside the CAS validation documents.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    #[serde(skip)]
    status: StatusCode,
    pub error: String,
    pub message: String,
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<ValidationError> for ErrorResponse {
    fn from(e: ValidationError) -> Self {
        ErrorResponse {
            status: failure_status(&e),
            error: e.code().to_ascii_lowercase(),
            message: e.to_string(),
        }
    }
}

// ==================== Helper Functions ====================

/// `true` and `1` switch a flag on; anything else leaves it off.
fn flag(value: &Option<String>) -> bool {
    matches!(value.as_deref(), Some("true") | Some("1"))
}

fn log_timing(settings: &Settings, message: &str, duration: std::time::Duration) {
    if settings.enable_timing_logs {
        info!("{}: {:?}", message, duration);
    }
}

/// Read one cookie from the request headers.
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

fn session_cookie(settings: &Settings, tgt: &TicketGrantingTicket) -> String {
    let secure = if settings.secure_cookie { "; Secure" } else { "" };
    format!("{}={}; Path=/; HttpOnly; SameSite=Lax{}", TGT_COOKIE, tgt.id, secure)
}

fn expired_session_cookie() -> String {
    format!("{}=; Path=/; Max-Age=0", TGT_COOKIE)
}

fn with_cookie(mut response: Response, cookie: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(cookie) {
        response.headers_mut().append(SET_COOKIE, value);
    }
    response
}

/// 303 See Other, or `None` when the target cannot be sent as a header.
fn see_other(location: &str) -> Option<Response> {
    let value = HeaderValue::from_str(location).ok()?;
    Some((StatusCode::SEE_OTHER, [(LOCATION, value)]).into_response())
}

fn client_hostname(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn validation_response(status: StatusCode, response: ServiceResponse) -> Response {
    (
        status,
        Json(ServiceResponseDocument {
            service_response: response,
        }),
    )
        .into_response()
}

fn failure_status(e: &ValidationError) -> StatusCode {
    StatusCode::from_u16(e.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Issue a fresh login ticket and render the login page.
async fn render_login(
    state: &CasApiState,
    status: StatusCode,
    service: Option<String>,
    notice: Option<String>,
    error: Option<String>,
) -> Response {
    match state.broker.factory.issue_login_ticket().await {
        Ok(lt) => (
            status,
            Json(LoginPage {
                login_ticket: lt.id,
                service,
                notice,
                error,
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to issue login ticket: {}", e);
            ErrorResponse::from(e).into_response()
        }
    }
}

// ==================== Handlers ====================

/// GET /login
pub async fn login_page(
    State(state): State<Arc<CasApiState>>,
    headers: HeaderMap,
    Query(query): Query<LoginQuery>,
) -> Response {
    let service = clean_service_url(query.service.as_deref());
    let renew = flag(&query.renew);
    let gateway = flag(&query.gateway);

    let tgt = match cookie_value(&headers, TGT_COOKIE) {
        Some(id) => state
            .broker
            .validator
            .validate_ticket_granting_ticket(Some(&id))
            .await
            .ok(),
        None => None,
    };

    let mut notice = tgt.as_ref().map(|tgt| {
        format!(
            "You are currently logged in as '{}'. If this is not you, please log in below.",
            tgt.username
        )
    });
    let mut error = query.redirection_loop_intercepted.as_ref().map(|_| {
        "The client and server are unable to negotiate authentication. Please try logging in again later.".to_string()
    });

    match (&service, &tgt) {
        (Some(service), Some(tgt)) if !renew => {
            let issued = state
                .broker
                .factory
                .issue_service_ticket(service, &tgt.username, tgt, false)
                .await;
            match issued {
                Ok(st) => {
                    let redirect = service_uri_with_ticket(service, &st.id)
                        .ok()
                        .and_then(|target| see_other(&target));
                    match redirect {
                        Some(response) => return response,
                        None => error = Some(INVALID_SERVICE_MESSAGE.to_string()),
                    }
                }
                Err(ValidationError::InvalidService(_)) => {
                    error = Some(INVALID_SERVICE_MESSAGE.to_string())
                }
                Err(ValidationError::InvalidTicket(_)) => {
                    // Session revoked while we were looking at it.
                    notice = None;
                }
                Err(e) => return ErrorResponse::from(e).into_response(),
            }
        }
        (Some(service), _) if gateway => match see_other(service) {
            Some(response) => return response,
            None => error = Some(INVALID_SERVICE_MESSAGE.to_string()),
        },
        (None, _) if gateway => {
            error = Some(
                "The server cannot fulfill this gateway request because no service parameter was given."
                    .to_string(),
            );
        }
        _ => {}
    }

    render_login(&state, StatusCode::OK, service, notice, error).await
}

/// POST /login
pub async fn login_submit(
    State(state): State<Arc<CasApiState>>,
    headers: HeaderMap,
    Form(form): Form<LoginForm>,
) -> Response {
    let service = clean_service_url(form.service.as_deref());
    let username = form.username.as_deref().unwrap_or_default().trim().to_string();

    if let Err(e) = state
        .broker
        .validator
        .validate_login_ticket(form.lt.as_deref())
        .await
    {
        return render_login(&state, failure_status(&e), service, None, Some(e.to_string())).await;
    }

    let credentials = Credentials {
        username: username.clone(),
        password: form.password.unwrap_or_default(),
        service: service.clone(),
        client_hostname: client_hostname(&headers),
    };

    let extra_attributes = match authenticate(state.authenticator.as_ref(), &credentials).await {
        Ok(Some(extra)) => extra,
        Ok(None) => {
            warn!("Invalid credentials given for user '{}'", username);
            return render_login(
                &state,
                StatusCode::UNAUTHORIZED,
                service,
                None,
                Some("Incorrect username or password.".to_string()),
            )
            .await;
        }
        Err(e) => {
            error!("Authenticator failure for user '{}': {}", username, e);
            return render_login(
                &state,
                StatusCode::UNAUTHORIZED,
                service,
                None,
                Some(e.to_string()),
            )
            .await;
        }
    };

    let tgt = match state
        .broker
        .factory
        .issue_ticket_granting_ticket(&username, extra_attributes, credentials.client_hostname)
        .await
    {
        Ok(tgt) => tgt,
        Err(e) => return ErrorResponse::from(e).into_response(),
    };
    let cookie = session_cookie(&state.broker.settings, &tgt);
    info!("User '{}' logged in", username);

    let Some(service) = service else {
        let page = render_login(
            &state,
            StatusCode::OK,
            None,
            Some("You have successfully logged in.".to_string()),
            None,
        )
        .await;
        return with_cookie(page, &cookie);
    };

    let redirect = match state
        .broker
        .factory
        .issue_service_ticket(&service, &username, &tgt, true)
        .await
    {
        Ok(st) => service_uri_with_ticket(&service, &st.id)
            .ok()
            .and_then(|target| see_other(&target)),
        Err(ValidationError::InvalidService(_)) => None,
        Err(e) => return with_cookie(ErrorResponse::from(e).into_response(), &cookie),
    };

    let response = match redirect {
        Some(response) => response,
        None => {
            render_login(
                &state,
                StatusCode::OK,
                Some(service),
                None,
                Some(INVALID_SERVICE_MESSAGE.to_string()),
            )
            .await
        }
    };
    with_cookie(response, &cookie)
}

/// GET /logout
pub async fn logout(
    State(state): State<Arc<CasApiState>>,
    headers: HeaderMap,
    Query(query): Query<LogoutQuery>,
) -> Response {
    let service = clean_service_url(query.service.or(query.destination).as_deref());
    let gateway = flag(&query.gateway);

    if let Some(tgt_id) = cookie_value(&headers, TGT_COOKIE) {
        if let Err(e) = state.broker.revocation.revoke(&tgt_id).await {
            error!("Failed to revoke session on logout: {}", e);
        }
    }

    let target = match (&service, gateway) {
        (Some(service), true) => service.clone(),
        (Some(service), false) => {
            let encoded: String = url::form_urlencoded::byte_serialize(service.as_bytes()).collect();
            format!("/login?service={}", encoded)
        }
        (None, _) => "/login".to_string(),
    };

    let response = see_other(&target)
        .or_else(|| see_other("/login"))
        .unwrap_or_else(|| StatusCode::SEE_OTHER.into_response());
    with_cookie(response, &expired_session_cookie())
}

/// GET /serviceValidate
pub async fn service_validate(
    State(state): State<Arc<CasApiState>>,
    Query(query): Query<ValidateQuery>,
) -> Response {
    let start = Instant::now();
    let service = clean_service_url(query.service.as_deref());

    let result = state
        .broker
        .validator
        .validate_service_ticket(service.as_deref(), query.ticket.as_deref(), flag(&query.renew))
        .await;

    let response = match result {
        Ok(st) => {
            let iou = match query.pgt_url.as_deref() {
                Some(pgt_url) => state
                    .broker
                    .factory
                    .issue_proxy_granting_ticket(pgt_url, &st)
                    .await
                    .map(|pgt| pgt.iou),
                None => None,
            };
            validation_response(
                StatusCode::OK,
                ServiceResponse::AuthenticationSuccess(AuthenticationSuccess {
                    user: st.username,
                    attributes: st.extra_attributes,
                    proxy_granting_ticket: iou,
                    proxies: None,
                }),
            )
        }
        Err(e) => validation_response(
            failure_status(&e),
            ServiceResponse::AuthenticationFailure(Failure::from(&e)),
        ),
    };

    log_timing(&state.broker.settings, "serviceValidate", start.elapsed());
    response
}

/// GET /proxyValidate
pub async fn proxy_validate(
    State(state): State<Arc<CasApiState>>,
    Query(query): Query<ValidateQuery>,
) -> Response {
    let start = Instant::now();
    let service = clean_service_url(query.service.as_deref());

    let result = state
        .broker
        .validator
        .validate_proxy_ticket(service.as_deref(), query.ticket.as_deref(), flag(&query.renew))
        .await;

    let response = match result {
        Ok(validated) => {
            let iou = match query.pgt_url.as_deref() {
                Some(pgt_url) => state
                    .broker
                    .factory
                    .issue_proxy_granting_ticket(pgt_url, &validated.ticket)
                    .await
                    .map(|pgt| pgt.iou),
                None => None,
            };
            validation_response(
                StatusCode::OK,
                ServiceResponse::AuthenticationSuccess(AuthenticationSuccess {
                    user: validated.ticket.username,
                    attributes: validated.ticket.extra_attributes,
                    proxy_granting_ticket: iou,
                    proxies: Some(validated.proxies),
                }),
            )
        }
        Err(e) => validation_response(
            failure_status(&e),
            ServiceResponse::AuthenticationFailure(Failure::from(&e)),
        ),
    };

    log_timing(&state.broker.settings, "proxyValidate", start.elapsed());
    response
}

/// GET /proxy
pub async fn proxy(
    State(state): State<Arc<CasApiState>>,
    Query(query): Query<ProxyQuery>,
) -> Response {
    let result = async {
        let target = query
            .target_service
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                ValidationError::InvalidRequest(
                    "targetService parameter was missing in the request.".to_string(),
                )
            })?;
        let pgt = state
            .broker
            .validator
            .validate_proxy_granting_ticket(query.pgt.as_deref())
            .await?;
        state.broker.factory.issue_proxy_ticket(target, &pgt).await
    }
    .await;

    match result {
        Ok(pt) => validation_response(
            StatusCode::OK,
            ServiceResponse::ProxySuccess(ProxySuccess {
                proxy_ticket: pt.id,
            }),
        ),
        Err(e) => validation_response(
            failure_status(&e),
            ServiceResponse::ProxyFailure(Failure::from(&e)),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag() {
        assert!(flag(&Some("true".to_string())));
        assert!(flag(&Some("1".to_string())));
        assert!(!flag(&Some("false".to_string())));
        assert!(!flag(&None));
    }

    #[test]
    fn test_cookie_value() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; tgt=TGC-abc; other=1"),
        );
        assert_eq!(cookie_value(&headers, "tgt"), Some("TGC-abc".to_string()));
        assert_eq!(cookie_value(&headers, "missing"), None);

        headers.insert(COOKIE, HeaderValue::from_static("tgt="));
        assert_eq!(cookie_value(&headers, "tgt"), None);
    }

    #[test]
    fn test_error_response_status_follows_code() {
        let response = ErrorResponse::from(ValidationError::InvalidTicket(
            "Ticket 'TGC-abc' is no longer valid.".to_string(),
        ))
        .into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let response =
            ErrorResponse::from(ValidationError::InternalError("store down".to_string()))
                .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_failure_document_shape() {
        let e = ValidationError::InvalidTicket("Ticket 'ST-1' not recognized.".to_string());
        let doc = ServiceResponseDocument {
            service_response: ServiceResponse::AuthenticationFailure(Failure::from(&e)),
        };
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(
            json["serviceResponse"]["authenticationFailure"]["code"],
            "INVALID_TICKET"
        );
    }
}
