use axum::{extract::Query, extract::State, routing::get, Router};
use cas::authenticator::{StaticAuthenticator, StaticUser};
use cas::config::Settings;
use cas::server::{self, ServeHandle};
use cas::ticket::{HttpProxyCallback, MemoryTicketStore, TicketBroker};
use reqwest::header::{COOKIE, LOCATION, SET_COOKIE};
use reqwest::{redirect, Client, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const APP: &str = "https://app.example/portal";
const BACKEND: &str = "https://backend.example/api";
const INVALID_SERVICE: &str = "The target service your browser supplied appears to be invalid. Please contact your system administrator for help.";

struct TestServer {
    handle: ServeHandle,
    client: Client,
}

impl TestServer {
    async fn start() -> Self {
        let settings = Arc::new(Settings {
            require_https_callback: false,
            secure_cookie: false,
            purge_interval: Duration::ZERO,
            extra_attributes: vec!["email".to_string()],
            ..Settings::default()
        });
        let callback = Arc::new(HttpProxyCallback::new(Duration::from_secs(2)).unwrap());
        let broker = TicketBroker::new(Arc::new(MemoryTicketStore::new()), settings.clone(), callback);
        let authenticator = Arc::new(StaticAuthenticator::new(
            vec![StaticUser::with_password("alice", "wonderland")
                .attribute("email", json!("alice@example.com"))],
            settings.extra_attributes.clone(),
        ));

        let handle = server::serve(broker, authenticator, "127.0.0.1:0")
            .await
            .unwrap();
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .build()
            .unwrap();
        TestServer { handle, client }
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.handle.port, path)
    }

    async fn login_ticket(&self, service: Option<&str>) -> String {
        let mut request = self.client.get(self.url("/login"));
        if let Some(service) = service {
            request = request.query(&[("service", service)]);
        }
        let page: Value = request.send().await.unwrap().json().await.unwrap();
        page["loginTicket"].as_str().unwrap().to_string()
    }

    /// Log in for `service`; returns the session cookie and the service ticket.
    async fn login(&self, service: &str) -> (String, String) {
        let lt = self.login_ticket(Some(service)).await;
        let response = self
            .client
            .post(self.url("/login"))
            .form(&[
                ("username", "alice"),
                ("password", "wonderland"),
                ("lt", lt.as_str()),
                ("service", service),
            ])
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);

        let cookie = session_cookie(&response).expect("session cookie");
        let location = response.headers()[LOCATION].to_str().unwrap().to_string();
        (cookie, ticket_from(&location))
    }

    async fn validate(&self, path: &str, params: &[(&str, &str)]) -> (StatusCode, Value) {
        let response = self
            .client
            .get(self.url(path))
            .query(params)
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }
}

fn session_cookie(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with("tgt="))
        .and_then(|v| v.split(';').next())
        .map(str::to_string)
}

fn ticket_from(location: &str) -> String {
    let url = url::Url::parse(location).unwrap();
    url.query_pairs()
        .find(|(k, _)| k == "ticket")
        .map(|(_, v)| v.into_owned())
        .expect("ticket parameter")
}

#[tokio::test]
async fn test_login_and_service_validate() {
    let server = TestServer::start().await;
    let (cookie, st) = server.login(APP).await;
    assert!(cookie.starts_with("tgt=TGC-"));
    assert!(st.starts_with("ST-"));

    let (status, body) = server
        .validate("/serviceValidate", &[("service", APP), ("ticket", st.as_str())])
        .await;
    assert_eq!(status, StatusCode::OK);
    let success = &body["serviceResponse"]["authenticationSuccess"];
    assert_eq!(success["user"], "alice");
    assert_eq!(success["attributes"]["email"], "alice@example.com");
    assert!(success.get("proxyGrantingTicket").is_none());

    let (status, body) = server
        .validate("/serviceValidate", &[("service", APP), ("ticket", st.as_str())])
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        body["serviceResponse"]["authenticationFailure"]["code"],
        "INVALID_TICKET"
    );

    server.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_service_validate_missing_parameters() {
    let server = TestServer::start().await;
    let (status, body) = server
        .validate("/serviceValidate", &[("service", APP)])
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        body["serviceResponse"]["authenticationFailure"]["code"],
        "INVALID_REQUEST"
    );
    server.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_single_sign_on_with_existing_session() {
    let server = TestServer::start().await;
    let (cookie, _) = server.login(APP).await;

    let response = server
        .client
        .get(server.url("/login"))
        .query(&[("service", BACKEND)])
        .header(COOKIE, &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let st = ticket_from(response.headers()[LOCATION].to_str().unwrap());

    let (status, _) = server
        .validate("/serviceValidate", &[("service", BACKEND), ("ticket", st.as_str())])
        .await;
    assert_eq!(status, StatusCode::OK);

    // A ticket issued from the session does not satisfy renew.
    let response = server
        .client
        .get(server.url("/login"))
        .query(&[("service", BACKEND)])
        .header(COOKIE, &cookie)
        .send()
        .await
        .unwrap();
    let st = ticket_from(response.headers()[LOCATION].to_str().unwrap());
    let (status, _) = server
        .validate(
            "/serviceValidate",
            &[("service", BACKEND), ("ticket", st.as_str()), ("renew", "true")],
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    server.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_bad_credentials_and_replayed_login_ticket() {
    let server = TestServer::start().await;

    let lt = server.login_ticket(None).await;
    let response = server
        .client
        .post(server.url("/login"))
        .form(&[("username", "alice"), ("password", "wrong"), ("lt", lt.as_str())])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(session_cookie(&response).is_none());
    let page: Value = response.json().await.unwrap();
    assert_eq!(page["error"], "Incorrect username or password.");
    assert!(page["loginTicket"].as_str().unwrap().starts_with("LT-"));

    let response = server
        .client
        .post(server.url("/login"))
        .form(&[("username", "alice"), ("password", "wonderland"), ("lt", lt.as_str())])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(session_cookie(&response).is_none());

    server.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_login_without_service_shows_notice() {
    let server = TestServer::start().await;
    let lt = server.login_ticket(None).await;
    let response = server
        .client
        .post(server.url("/login"))
        .form(&[("username", "alice"), ("password", "wonderland"), ("lt", lt.as_str())])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(session_cookie(&response).is_some());
    let page: Value = response.json().await.unwrap();
    assert_eq!(page["notice"], "You have successfully logged in.");

    server.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_gateway_redirects_without_session() {
    let server = TestServer::start().await;
    let response = server
        .client
        .get(server.url("/login"))
        .query(&[("service", APP), ("gateway", "true")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(response.headers()[LOCATION], APP);
    server.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_logout_revokes_session() {
    let server = TestServer::start().await;
    let (cookie, st) = server.login(APP).await;

    let response = server
        .client
        .get(server.url("/logout"))
        .query(&[("service", APP)])
        .header(COOKIE, &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        response.headers()[LOCATION],
        "/login?service=https%3A%2F%2Fapp.example%2Fportal"
    );
    let cleared = response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .any(|v| v.to_str().unwrap().contains("Max-Age=0"));
    assert!(cleared);

    // The outstanding service ticket went with the session.
    let (status, _) = server
        .validate("/serviceValidate", &[("service", APP), ("ticket", st.as_str())])
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    // The old cookie no longer logs anyone in.
    let response = server
        .client
        .get(server.url("/login"))
        .query(&[("service", APP)])
        .header(COOKIE, &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    server.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_login_page_errors() {
    let server = TestServer::start().await;

    let page: Value = server
        .client
        .get(server.url("/login"))
        .query(&[("service", APP), ("redirection_loop_intercepted", "1")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        page["error"],
        "The client and server are unable to negotiate authentication. Please try logging in again later."
    );
    assert!(page["loginTicket"].as_str().unwrap().starts_with("LT-"));

    let response = server
        .client
        .get(server.url("/login"))
        .query(&[("gateway", "true")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let page: Value = response.json().await.unwrap();
    assert_eq!(
        page["error"],
        "The server cannot fulfill this gateway request because no service parameter was given."
    );

    server.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_service_with_session() {
    let server = TestServer::start().await;
    let (cookie, _) = server.login(APP).await;

    let response = server
        .client
        .get(server.url("/login"))
        .query(&[("service", "not a url")])
        .header(COOKIE, &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let page: Value = response.json().await.unwrap();
    assert_eq!(page["error"], INVALID_SERVICE);
    assert_eq!(page["service"], "not a url");

    server.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_login_with_malformed_service_still_starts_session() {
    let server = TestServer::start().await;
    let lt = server.login_ticket(None).await;

    let response = server
        .client
        .post(server.url("/login"))
        .form(&[
            ("username", "alice"),
            ("password", "wonderland"),
            ("lt", lt.as_str()),
            ("service", "not a url"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = session_cookie(&response).expect("session cookie");
    let page: Value = response.json().await.unwrap();
    assert_eq!(page["error"], INVALID_SERVICE);

    // The session is usable for a well-formed service.
    let response = server
        .client
        .get(server.url("/login"))
        .query(&[("service", APP)])
        .header(COOKIE, &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);

    server.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_logout_redirects() {
    let server = TestServer::start().await;

    let response = server
        .client
        .get(server.url("/logout"))
        .query(&[("service", APP), ("gateway", "true")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(response.headers()[LOCATION], APP);

    let response = server.client.get(server.url("/logout")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(response.headers()[LOCATION], "/login");

    server.handle.shutdown().await.unwrap();
}

type Deliveries = Arc<Mutex<HashMap<String, String>>>;

async fn receive_pgt(
    State(deliveries): State<Deliveries>,
    Query(params): Query<HashMap<String, String>>,
) -> StatusCode {
    match (params.get("pgtIou"), params.get("pgtId")) {
        (Some(iou), Some(id)) => {
            deliveries.lock().unwrap().insert(iou.clone(), id.clone());
            StatusCode::OK
        }
        _ => StatusCode::BAD_REQUEST,
    }
}

/// Local endpoint recording PGT deliveries by iou.
async fn start_callback_endpoint() -> (String, Deliveries) {
    let deliveries: Deliveries = Arc::default();
    let app = Router::new()
        .route("/pgt", get(receive_pgt))
        .with_state(deliveries.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://127.0.0.1:{}/pgt", port), deliveries)
}

#[tokio::test]
async fn test_proxy_flow_over_http() {
    let server = TestServer::start().await;
    let (callback_url, deliveries) = start_callback_endpoint().await;
    let (_, st) = server.login(APP).await;

    let (status, body) = server
        .validate(
            "/serviceValidate",
            &[("service", APP), ("ticket", st.as_str()), ("pgtUrl", callback_url.as_str())],
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let iou = body["serviceResponse"]["authenticationSuccess"]["proxyGrantingTicket"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(iou.starts_with("PGTIOU-"));
    let pgt = deliveries.lock().unwrap().get(&iou).cloned().unwrap();
    assert!(pgt.starts_with("PGT-"));

    let (status, body) = server
        .validate("/proxy", &[("pgt", pgt.as_str()), ("targetService", BACKEND)])
        .await;
    assert_eq!(status, StatusCode::OK);
    let pt = body["serviceResponse"]["proxySuccess"]["proxyTicket"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(pt.starts_with("PT-"));

    let (status, body) = server
        .validate("/serviceValidate", &[("service", BACKEND), ("ticket", pt.as_str())])
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        body["serviceResponse"]["authenticationFailure"]["code"],
        "INVALID_TICKET_SPEC"
    );

    let (status, body) = server
        .validate("/proxyValidate", &[("service", BACKEND), ("ticket", pt.as_str())])
        .await;
    assert_eq!(status, StatusCode::OK);
    let success = &body["serviceResponse"]["authenticationSuccess"];
    assert_eq!(success["user"], "alice");
    assert_eq!(success["proxies"], json!([APP]));

    server.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_callback_does_not_fail_validation() {
    let server = TestServer::start().await;
    let (_, st) = server.login(APP).await;

    let (status, body) = server
        .validate(
            "/serviceValidate",
            &[
                ("service", APP),
                ("ticket", st.as_str()),
                ("pgtUrl", "http://127.0.0.1:9/unreachable"),
            ],
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let success = &body["serviceResponse"]["authenticationSuccess"];
    assert_eq!(success["user"], "alice");
    assert!(success.get("proxyGrantingTicket").is_none());

    server.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_proxy_with_unknown_pgt() {
    let server = TestServer::start().await;
    let (status, body) = server
        .validate("/proxy", &[("pgt", "PGT-unknown"), ("targetService", BACKEND)])
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["serviceResponse"]["proxyFailure"]["code"], "BAD_PGT");

    let (status, body) = server.validate("/proxy", &[("pgt", "PGT-unknown")]).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        body["serviceResponse"]["proxyFailure"]["code"],
        "INVALID_REQUEST"
    );

    server.handle.shutdown().await.unwrap();
}
