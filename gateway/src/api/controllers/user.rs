use axum::Json;
use axum::extract::State;

use crate::api::controllers::auth::AuthUser;
use crate::api::models::user::{MeResponse, PingResponse, UserView};
use crate::api::state::ApiState;
use crate::auth::{AuthError, Role};

pub async fn me(
    State(state): State<ApiState>,
    user: AuthUser,
) -> Result<Json<MeResponse>, AuthError> {
    let identity = state
        .sessions()
        .find_identity(&state.call_context(), user.claims.user_id)
        .await?;

    Ok(Json(MeResponse {
        user: identity.as_ref().map(UserView::from),
        claims: user.claims,
    }))
}

pub async fn admin_ping(user: AuthUser) -> Result<Json<PingResponse>, AuthError> {
    user.require_role(&[Role::Admin])?;
    Ok(Json(PingResponse {
        pong: true,
        role: user.claims.role,
    }))
}
