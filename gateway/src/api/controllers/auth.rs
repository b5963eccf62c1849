use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRef, FromRequestParts, Query, State};
use axum::http::StatusCode;
use axum::http::header::{AUTHORIZATION, ORIGIN, REFERER};
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};

use crate::api::models::auth::{
    CredentialsRequest, GoogleLoginQuery, GoogleLoginResponse, OAuthCallbackQuery,
    RefreshRequest, RegisterRequest, SessionResponse,
};
use crate::api::state::ApiState;
use crate::auth::{AuthError, Claims, Role, TokenPair};

// ── Auth extractor ─────────────────────────────────────────────────────────────

/// Caller authenticated by a valid, unrevoked Bearer access token.
pub struct AuthUser {
    pub claims: Claims,
    pub token: String,
}

impl AuthUser {
    /// Passes if the token's role is one of `allowed`. Admins always pass.
    pub fn require_role(&self, allowed: &[Role]) -> Result<(), AuthError> {
        if self.claims.role == Role::Admin || allowed.contains(&self.claims.role) {
            return Ok(());
        }

        tracing::info!(
            user_id = %self.claims.user_id,
            role = %self.claims.role,
            "rejected request: insufficient role"
        );
        Err(AuthError::Forbidden)
    }
}

impl<S> FromRequestParts<S> for AuthUser
where
    ApiState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(AuthError::MissingToken)?;

        let api_state = ApiState::from_ref(state);
        let claims = api_state
            .sessions()
            .authenticate(&api_state.call_context(), token)
            .await?;

        Ok(AuthUser {
            claims,
            token: token.to_owned(),
        })
    }
}

/// Request whose `Origin` or `Referer` matches the OAuth origin allow-list.
///
/// An empty allow-list admits every request.
pub struct AllowedOrigin;

impl<S> FromRequestParts<S> for AllowedOrigin
where
    ApiState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let api_state = ApiState::from_ref(state);
        let allowed = api_state.allowed_origins();
        if allowed.is_empty() {
            return Ok(AllowedOrigin);
        }

        let origin = parts.headers.get(ORIGIN).and_then(|v| v.to_str().ok());
        let referer = parts.headers.get(REFERER).and_then(|v| v.to_str().ok());

        let matches = allowed.iter().filter(|a| !a.is_empty()).any(|allowed| {
            origin == Some(allowed.as_str())
                || referer.is_some_and(|referer| referer.starts_with(allowed.as_str()))
        });
        if matches {
            return Ok(AllowedOrigin);
        }

        tracing::warn!(?origin, ?referer, "oauth request rejected: origin not allowed");
        Err(AuthError::OriginNotAllowed)
    }
}

// ── Local accounts ────────────────────────────────────────────────────────────

pub async fn register(
    State(state): State<ApiState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Response, AuthError> {
    let Json(req) = payload.map_err(bad_body)?;
    let session = state
        .sessions()
        .register(
            &state.call_context(),
            &req.email,
            &req.password,
            req.username.as_deref(),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(SessionResponse::from(session))).into_response())
}

pub async fn login(
    State(state): State<ApiState>,
    payload: Result<Json<CredentialsRequest>, JsonRejection>,
) -> Result<Json<SessionResponse>, AuthError> {
    let Json(req) = payload.map_err(bad_body)?;
    let session = state
        .sessions()
        .login(&state.call_context(), &req.email, &req.password)
        .await?;

    Ok(Json(session.into()))
}

// ── Tokens ─────────────────────────────────────────────────────────────────────

pub async fn refresh(
    State(state): State<ApiState>,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Json<TokenPair>, AuthError> {
    let Json(req) = payload.map_err(bad_body)?;
    let session = state
        .sessions()
        .refresh_access_token(&state.call_context(), &req.refresh_token)
        .await?;

    Ok(Json(session.tokens))
}

pub async fn logout(State(state): State<ApiState>, user: AuthUser) -> Result<StatusCode, AuthError> {
    state
        .sessions()
        .logout(&state.call_context(), &user.token, &user.claims)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

// ── Google ────────────────────────────────────────────────────────────────────

pub async fn google_login(
    _: AllowedOrigin,
    State(state): State<ApiState>,
    Query(query): Query<GoogleLoginQuery>,
) -> Result<Json<GoogleLoginResponse>, AuthError> {
    let (auth_url, csrf_state) = state
        .sessions()
        .oauth_login_url(&state.call_context(), query.redirect_uri.as_deref())
        .await?;

    Ok(Json(GoogleLoginResponse {
        auth_url: auth_url.into(),
        state: csrf_state,
    }))
}

pub async fn google_callback(
    _: AllowedOrigin,
    State(state): State<ApiState>,
    Query(params): Query<OAuthCallbackQuery>,
) -> Result<Json<SessionResponse>, AuthError> {
    if let Some(error) = params.error {
        tracing::info!(%error, "oauth callback carried a provider error");
        return Err(AuthError::BadRequest(format!("oauth provider error: {error}")));
    }

    let (Some(code), Some(csrf_state)) = (params.code, params.state) else {
        return Err(AuthError::BadRequest(
            "missing code or state parameter".to_owned(),
        ));
    };

    let session = state
        .sessions()
        .oauth_login(
            &state.call_context(),
            &code,
            &csrf_state,
            params.redirect_uri.as_deref(),
        )
        .await?;

    Ok(Json(session.into()))
}

fn bad_body(rejection: JsonRejection) -> AuthError {
    AuthError::BadRequest(rejection.body_text())
}
