use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{delete, get, patch, post},
};
use serde_json::json;

use roam_types::api::{
    AddMediaItemRequest, AddMomentRequest, CreateTripRequest, EnableShareLinkRequest,
    InviteMemberRequest, JoinRequest, SetRoleRequest, UpdateTripRequest,
};

use crate::error::ApiResult;
use crate::identity::{CurrentUser, require_identity};
use crate::state::AppState;

/// Every query and mutation route. The gateway upgrade lives in the server
/// binary since it authenticates from the query string.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/trips", post(create_trip).get(get_all_trips))
        .route("/trips/shared", get(get_shared_trips))
        .route(
            "/trips/{trip_id}",
            get(get_trip).patch(update_trip).delete(delete_trip),
        )
        .route("/trips/{trip_id}/media", post(add_media_item))
        .route("/trips/{trip_id}/media/{media_id}", delete(remove_media_item))
        .route("/trips/{trip_id}/moments", post(add_moment))
        .route("/trips/{trip_id}/moments/{moment_id}", delete(delete_moment))
        .route(
            "/trips/{trip_id}/permissions",
            get(get_trip_permissions).post(invite_member),
        )
        .route(
            "/trips/{trip_id}/permissions/{user_id}",
            patch(set_member_role).delete(revoke_member),
        )
        .route("/trips/{trip_id}/leave", post(leave_trip))
        .route(
            "/trips/{trip_id}/share-link",
            post(enable_share_link).delete(disable_share_link),
        )
        .route("/join/{slug}", post(join_via_link))
        .layer(middleware::from_fn_with_state(state.clone(), require_identity))
        .with_state(state);

    Router::new().route("/health", get(health)).merge(protected)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// -- Trips --

async fn create_trip(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(req): Json<CreateTripRequest>,
) -> ApiResult<impl IntoResponse> {
    let trip = state.trips.create_trip(&user, req).await?;
    Ok((StatusCode::CREATED, Json(trip)))
}

async fn get_all_trips(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.trips.get_all_trips(&user).await?))
}

async fn get_shared_trips(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.trips.get_shared_trips(&user).await?))
}

async fn get_trip(
    State(state): State<AppState>,
    Path(trip_id): Path<String>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.trips.get_trip(&user, &trip_id).await?))
}

async fn update_trip(
    State(state): State<AppState>,
    Path(trip_id): Path<String>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(req): Json<UpdateTripRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.trips.update_trip(&user, &trip_id, req).await?))
}

async fn delete_trip(
    State(state): State<AppState>,
    Path(trip_id): Path<String>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> ApiResult<StatusCode> {
    state.trips.delete_trip(&user, &trip_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// -- Media & moments --

async fn add_media_item(
    State(state): State<AppState>,
    Path(trip_id): Path<String>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(req): Json<AddMediaItemRequest>,
) -> ApiResult<impl IntoResponse> {
    let item = state.trips.add_media_item(&user, &trip_id, req).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

async fn remove_media_item(
    State(state): State<AppState>,
    Path((trip_id, media_id)): Path<(String, String)>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> ApiResult<StatusCode> {
    state.trips.remove_media_item(&user, &trip_id, &media_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_moment(
    State(state): State<AppState>,
    Path(trip_id): Path<String>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(req): Json<AddMomentRequest>,
) -> ApiResult<impl IntoResponse> {
    let moment = state.trips.add_moment(&user, &trip_id, req).await?;
    Ok((StatusCode::CREATED, Json(moment)))
}

async fn delete_moment(
    State(state): State<AppState>,
    Path((trip_id, moment_id)): Path<(String, String)>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> ApiResult<StatusCode> {
    state.trips.delete_moment(&user, &trip_id, &moment_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// -- Membership --

async fn get_trip_permissions(
    State(state): State<AppState>,
    Path(trip_id): Path<String>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.trips.get_trip_permissions(&user, &trip_id).await?))
}

async fn invite_member(
    State(state): State<AppState>,
    Path(trip_id): Path<String>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(req): Json<InviteMemberRequest>,
) -> ApiResult<impl IntoResponse> {
    let perm = state.trips.invite_member(&user, &trip_id, req).await?;
    Ok((StatusCode::CREATED, Json(perm)))
}

async fn set_member_role(
    State(state): State<AppState>,
    Path((trip_id, member_id)): Path<(String, String)>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(req): Json<SetRoleRequest>,
) -> ApiResult<impl IntoResponse> {
    let perm = state
        .trips
        .set_member_role(&user, &trip_id, &member_id, req.role)
        .await?;
    Ok(Json(perm))
}

async fn revoke_member(
    State(state): State<AppState>,
    Path((trip_id, member_id)): Path<(String, String)>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> ApiResult<StatusCode> {
    state.trips.revoke_member(&user, &trip_id, &member_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn leave_trip(
    State(state): State<AppState>,
    Path(trip_id): Path<String>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> ApiResult<StatusCode> {
    state.trips.leave_trip(&user, &trip_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// -- Share links --

async fn enable_share_link(
    State(state): State<AppState>,
    Path(trip_id): Path<String>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    req: Option<Json<EnableShareLinkRequest>>,
) -> ApiResult<impl IntoResponse> {
    let with_code = req.is_some_and(|Json(r)| r.with_code);
    Ok(Json(
        state
            .shares
            .enable_share_link(&user, &trip_id, with_code)
            .await?,
    ))
}

async fn disable_share_link(
    State(state): State<AppState>,
    Path(trip_id): Path<String>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> ApiResult<StatusCode> {
    state.shares.disable_share_link(&user, &trip_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn join_via_link(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    req: Option<Json<JoinRequest>>,
) -> ApiResult<impl IntoResponse> {
    let code = req.and_then(|Json(r)| r.code);
    Ok(Json(
        state
            .shares
            .join_via_link(&user, &slug, code.as_deref())
            .await?,
    ))
}
