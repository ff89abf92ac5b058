use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        dto::{
            AuthResponse, ListUsersQuery, LoginRequest, LogoutAllRequest, LogoutAllResponse,
            PublicUser, RefreshRequest, RegisterRequest,
        },
        extractors::ClientInfo,
        jwt::AuthUser,
        service::Registration,
    },
    error::{AppError, Result},
    rate_limit::LimitedRoute,
    state::AppState,
};

pub(crate) const MIN_PASSWORD_LEN: usize = 8;
/// Self-registered accounts are always clients.
const DEFAULT_TAG: &str = "client";
const DEFAULT_PLAN: &str = "trial";
const MAX_PAGE: i64 = 100;

fn normalize_login(login: &str) -> &str {
    login.trim()
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/users", post(register).get(list_users))
        .route("/users/:user_id", get(get_user))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout-all", post(logout_all))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/me", get(get_me))
}

#[instrument(skip(state, client, payload))]
pub async fn register(
    State(state): State<AppState>,
    client: ClientInfo,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AuthResponse>)> {
    state.throttle(&client, LimitedRoute::Register)?;

    let login = normalize_login(&payload.login).to_string();
    let email = normalize_email(&payload.email);

    if login.is_empty() {
        return Err(AppError::BadRequest("Login is required".into()));
    }
    if !is_valid_email(&email) {
        warn!(%email, "invalid email");
        return Err(AppError::BadRequest("Invalid email".into()));
    }
    if payload.password.chars().count() < MIN_PASSWORD_LEN {
        warn!("password too short");
        return Err(AppError::BadRequest("Password too short".into()));
    }

    let reg = Registration {
        login,
        email,
        password: payload.password,
        tag: DEFAULT_TAG.into(),
        plan: payload.plan.unwrap_or_else(|| DEFAULT_PLAN.into()),
    };
    let pair = state.auth.register(reg, &client.meta()).await?;

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse::bearer(
            pair.access_token,
            pair.refresh_token,
            pair.user,
        )),
    ))
}

#[instrument(skip(state, client, payload))]
pub async fn login(
    State(state): State<AppState>,
    client: ClientInfo,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<AuthResponse>> {
    state.throttle(&client, LimitedRoute::Login)?;

    let pair = state
        .auth
        .login(
            normalize_login(&payload.login),
            &payload.password,
            &client.meta(),
        )
        .await?;

    Ok(Json(AuthResponse::bearer(
        pair.access_token,
        pair.refresh_token,
        pair.user,
    )))
}

#[instrument(skip(state, client, payload))]
pub async fn refresh(
    State(state): State<AppState>,
    client: ClientInfo,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<AuthResponse>> {
    state.throttle(&client, LimitedRoute::Refresh)?;

    let pair = state
        .auth
        .refresh(&payload.refresh_token, &client.meta())
        .await?;

    Ok(Json(AuthResponse::bearer(
        pair.access_token,
        pair.refresh_token,
        pair.user,
    )))
}

#[instrument(skip(state, claims, payload))]
pub async fn logout_all(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    payload: Option<Json<LogoutAllRequest>>,
) -> Result<Json<LogoutAllResponse>> {
    let user_id = claims
        .user_id()
        .ok_or(AppError::Unauthorized("Invalid or expired token"))?;
    let Json(payload) = payload.unwrap_or_default();

    let revoked = state
        .auth
        .revoke_all(user_id, payload.keep_refresh_token.as_deref())
        .await?;

    info!(user_id, revoked, "sessions revoked");
    Ok(Json(LogoutAllResponse { revoked }))
}

#[instrument(skip(state, claims))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
) -> Result<Json<PublicUser>> {
    let user_id = claims
        .user_id()
        .ok_or(AppError::Unauthorized("Invalid or expired token"))?;

    let user = state
        .store
        .find_user_by_id(user_id)
        .await?
        .ok_or(AppError::NotFound("User not found"))?;

    Ok(Json(user.into()))
}

#[instrument(skip(state, _claims))]
pub async fn get_user(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
    Path(user_id): Path<i64>,
) -> Result<Json<PublicUser>> {
    let user = state
        .store
        .find_user_by_id(user_id)
        .await?
        .ok_or(AppError::NotFound("User not found"))?;
    Ok(Json(user.into()))
}

#[instrument(skip(state, _claims))]
pub async fn list_users(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
    Query(page): Query<ListUsersQuery>,
) -> Result<Json<Vec<PublicUser>>> {
    let users = state
        .store
        .list_users(page.skip.max(0), page.limit.clamp(0, MAX_PAGE))
        .await?;
    Ok(Json(users.into_iter().map(PublicUser::from).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{app::build_app, notify::testing::RecordingNotifier};
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request},
    };
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    struct TestApp {
        app: Router,
        notifier: Arc<RecordingNotifier>,
    }

    fn test_app() -> TestApp {
        let (state, _, notifier) = AppState::fake();
        TestApp {
            app: build_app(state),
            notifier,
        }
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
        bearer: Option<&str>,
    ) -> (StatusCode, axum::http::HeaderMap, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            req = req.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let req = match body {
            Some(b) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let headers = res.headers().clone();
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, json)
    }

    async fn register_alice(t: &TestApp) -> Value {
        let (status, _, body) = call(
            &t.app,
            "POST",
            "/users",
            Some(json!({"login": "alice", "password": "P@ss1word", "email": " Alice@Example.com "})),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body
    }

    #[tokio::test]
    async fn register_creates_account_with_defaults() {
        let t = test_app();
        let body = register_alice(&t).await;

        assert_eq!(body["token_type"], "bearer");
        assert_eq!(body["user"]["email"], "alice@example.com");
        assert_eq!(body["user"]["tag"], "client");
        assert_eq!(body["user"]["plan"], "trial");
        assert!(body["user"].get("password_hash").is_none());
        assert_eq!(t.notifier.welcomes().len(), 1);
    }

    #[tokio::test]
    async fn register_ignores_requested_tag() {
        let t = test_app();
        let (status, _, body) = call(
            &t.app,
            "POST",
            "/users",
            Some(json!({"login": "eve", "password": "P@ss1word", "email": "eve@example.com", "tag": "admin"})),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["user"]["tag"], "client");
    }

    #[tokio::test]
    async fn login_is_trimmed_like_registration() {
        let t = test_app();
        let (status, _, _) = call(
            &t.app,
            "POST",
            "/users",
            Some(json!({"login": " carol ", "password": "P@ss1word", "email": "carol@example.com"})),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        for login in [" carol ", "carol"] {
            let (status, _, body) = call(
                &t.app,
                "POST",
                "/auth/login",
                Some(json!({"login": login, "password": "P@ss1word"})),
                None,
            )
            .await;
            assert_eq!(status, StatusCode::OK, "{login:?}");
            assert_eq!(body["user"]["login"], "carol");
        }
    }

    #[tokio::test]
    async fn user_lookup_requires_auth_and_reports_missing_ids() {
        let t = test_app();
        let reg = register_alice(&t).await;
        let access = reg["access_token"].as_str().unwrap();
        let id = reg["user"]["id"].as_i64().unwrap();

        let (status, _, body) =
            call(&t.app, "GET", &format!("/users/{id}"), None, Some(access)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["login"], "alice");

        let (status, _, body) = call(&t.app, "GET", "/users/9999", None, Some(access)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "User not found");

        let (status, _, _) = call(&t.app, "GET", &format!("/users/{id}"), None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn list_users_pages() {
        let t = test_app();
        let reg = register_alice(&t).await;
        let access = reg["access_token"].as_str().unwrap();
        call(
            &t.app,
            "POST",
            "/users",
            Some(json!({"login": "bob", "password": "P@ss1word", "email": "bob@example.com"})),
            None,
        )
        .await;

        let (status, _, body) = call(&t.app, "GET", "/users", None, Some(access)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);

        let (_, _, body) =
            call(&t.app, "GET", "/users?skip=1&limit=5", None, Some(access)).await;
        let page = body.as_array().unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0]["login"], "bob");

        let (status, _, _) = call(&t.app, "GET", "/users", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn register_validates_input() {
        let t = test_app();
        let (status, _, body) = call(
            &t.app,
            "POST",
            "/users",
            Some(json!({"login": "bob", "password": "longenough", "email": "not-an-email"})),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Invalid email");

        let (status, _, body) = call(
            &t.app,
            "POST",
            "/users",
            Some(json!({"login": "bob", "password": "short", "email": "bob@example.com"})),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Password too short");
    }

    #[tokio::test]
    async fn duplicate_email_is_a_conflict() {
        let t = test_app();
        register_alice(&t).await;
        let (status, _, body) = call(
            &t.app,
            "POST",
            "/users",
            Some(json!({"login": "alice2", "password": "P@ss1word", "email": "alice@example.com"})),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["message"], "Email already registered");
    }

    #[tokio::test]
    async fn third_registration_in_an_hour_is_throttled() {
        let t = test_app();
        for i in 0..2 {
            let (status, _, _) = call(
                &t.app,
                "POST",
                "/users",
                Some(json!({"login": format!("u{i}"), "password": "P@ss1word", "email": format!("u{i}@example.com")})),
                None,
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }
        let (status, _, _) = call(
            &t.app,
            "POST",
            "/users",
            Some(json!({"login": "u3", "password": "P@ss1word", "email": "u3@example.com"})),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn seventh_login_in_an_hour_is_throttled() {
        let t = test_app();
        register_alice(&t).await;

        for _ in 0..6 {
            let (status, _, body) = call(
                &t.app,
                "POST",
                "/auth/login",
                Some(json!({"login": "alice", "password": "P@ss1word"})),
                None,
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert!(body["access_token"].is_string());
            assert!(body["refresh_token"].is_string());
        }

        let (status, headers, body) = call(
            &t.app,
            "POST",
            "/auth/login",
            Some(json!({"login": "alice", "password": "P@ss1word"})),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(body["retry_after"].as_u64().unwrap() > 0);
        assert!(body["reset_at"].is_string());
        assert!(headers.contains_key(header::RETRY_AFTER));
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_login_look_the_same() {
        let t = test_app();
        register_alice(&t).await;

        let (s1, h1, b1) = call(
            &t.app,
            "POST",
            "/auth/login",
            Some(json!({"login": "alice", "password": "wrong"})),
            None,
        )
        .await;
        let (s2, _, b2) = call(
            &t.app,
            "POST",
            "/auth/login",
            Some(json!({"login": "mallory", "password": "wrong"})),
            None,
        )
        .await;
        assert_eq!(s1, StatusCode::UNAUTHORIZED);
        assert_eq!(s2, StatusCode::UNAUTHORIZED);
        assert_eq!(b1, b2);
        assert_eq!(h1[header::WWW_AUTHENTICATE], "Bearer");
    }

    #[tokio::test]
    async fn refresh_rotates_and_rejects_replay() {
        let t = test_app();
        let reg = register_alice(&t).await;
        let first = reg["refresh_token"].as_str().unwrap().to_string();

        let (status, _, body) = call(
            &t.app,
            "POST",
            "/auth/refresh",
            Some(json!({"refresh_token": first})),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_ne!(body["refresh_token"].as_str().unwrap(), first);
        assert_eq!(body["user"]["login"], "alice");

        let (status, _, _) = call(
            &t.app,
            "POST",
            "/auth/refresh",
            Some(json!({"refresh_token": first})),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn me_requires_a_valid_access_token() {
        let t = test_app();
        let reg = register_alice(&t).await;
        let access = reg["access_token"].as_str().unwrap();

        let (status, _, body) = call(&t.app, "GET", "/me", None, Some(access)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["login"], "alice");
        assert!(body["plan_date"].is_string());

        let (status, _, _) = call(&t.app, "GET", "/me", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // refresh tokens are not access tokens
        let refresh = reg["refresh_token"].as_str().unwrap();
        let (status, _, _) = call(&t.app, "GET", "/me", None, Some(refresh)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn logout_all_spares_only_the_kept_token() {
        let t = test_app();
        let reg = register_alice(&t).await;
        let access = reg["access_token"].as_str().unwrap().to_string();
        let current = reg["refresh_token"].as_str().unwrap().to_string();

        let (status, _, body) = call(
            &t.app,
            "POST",
            "/auth/logout-all",
            Some(json!({"keep_refresh_token": current})),
            Some(&access),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["revoked"], 0);

        let (status, _, body) =
            call(&t.app, "POST", "/auth/logout-all", None, Some(&access)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["revoked"], 1);

        let (status, _, _) = call(
            &t.app,
            "POST",
            "/auth/refresh",
            Some(json!({"refresh_token": current})),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _, _) = call(&t.app, "POST", "/auth/logout-all", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn email_shape() {
        assert!(is_valid_email("a@b.co"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("a b@c.d"));
        assert_eq!(normalize_email("  Bob@Example.COM "), "bob@example.com");
    }
}
