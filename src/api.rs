//! Public listing routes and the admin surface.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Multipart, Path, Query, State},
    http::{request::Parts, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::auth::{token_expiry, RequestSession, Session};
use crate::database::AppState;
use crate::error::{hash_pii, AppError};
use crate::image_file::ImageFile;
use crate::property::{FieldError, PropertyForm, PropertyRecord};
use crate::property_filter::ListingFilter;
use crate::reconciler::{CleanupReport, StorageHealth};
use crate::record_deleter::DeletedProperty;
use crate::staged_images::StagedImageSet;

pub type SharedState = Arc<AppState>;

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/properties", get(list_properties))
        .route("/properties/featured", get(featured_properties))
        .route("/properties/{id}", get(get_property))
        .route("/admin/login", post(login))
        .route("/admin/logout", post(logout))
        .route("/admin/properties", post(create_property))
        .route(
            "/admin/properties/{id}",
            axum::routing::put(update_property).delete(delete_property),
        )
        .route("/admin/storage/health", get(storage_health))
        .route("/admin/storage/cleanup", post(storage_cleanup))
}

/// An admin whose bearer token Supabase accepted.
pub struct AdminUser {
    pub id: String,
    pub email: Option<String>,
    /// Built from the bearer token and the optional `X-Refresh-Token` header.
    pub session: Session,
}

impl FromRequestParts<SharedState> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::unauthorized("admin_auth", "Missing bearer token"))?;

        let user = state
            .auth
            .verify_access_token(token)
            .await
            .map_err(|err| AppError::auth("admin_auth", &err))?;

        let refresh_token = parts
            .headers
            .get("X-Refresh-Token")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        // Unreadable expiry: treat the token as expiring now so a save refreshes it first.
        let expires_at = token_expiry(token).unwrap_or_else(Utc::now);

        Ok(AdminUser {
            id: user.id,
            session: Session {
                access_token: token.to_string(),
                refresh_token,
                expires_at,
                user_email: user.email.clone(),
            },
            email: user.email,
        })
    }
}

async fn list_properties(
    State(state): State<SharedState>,
    Query(filter): Query<ListingFilter>,
) -> Result<Json<Vec<PropertyRecord>>, AppError> {
    let records = state
        .properties
        .list()
        .await
        .map_err(|err| AppError::repo("list_properties", &err))?;
    Ok(Json(filter.apply(&records).into_iter().cloned().collect()))
}

async fn featured_properties(
    State(state): State<SharedState>,
) -> Result<Json<Vec<PropertyRecord>>, AppError> {
    let records = state
        .properties
        .list()
        .await
        .map_err(|err| AppError::repo("featured_properties", &err))?;
    Ok(Json(
        ListingFilter::featured()
            .apply(&records)
            .into_iter()
            .cloned()
            .collect(),
    ))
}

async fn get_property(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PropertyRecord>, AppError> {
    state
        .properties
        .get(id)
        .await
        .map_err(|err| AppError::repo("get_property", &err))?
        .map(Json)
        .ok_or_else(|| AppError::not_found("get_property", "Property not found"))
}

#[derive(Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

/// Tokens handed back to the client, on login and after a refresh during a save.
#[derive(Debug, Serialize)]
struct SessionTokens {
    access_token: String,
    refresh_token: String,
    expires_at: DateTime<Utc>,
}

impl From<Session> for SessionTokens {
    fn from(session: Session) -> Self {
        Self {
            access_token: session.access_token,
            refresh_token: session.refresh_token,
            expires_at: session.expires_at,
        }
    }
}

async fn login(
    State(state): State<SharedState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<SessionTokens>, AppError> {
    let session = state
        .auth
        .sign_in(req.email.trim(), &req.password)
        .await
        .map_err(|err| {
            AppError::auth("admin_login", &err).with_context("user", hash_pii(&req.email))
        })?;

    info!(user = %hash_pii(&req.email), "Admin signed in");
    Ok(Json(session.into()))
}

async fn logout(State(state): State<SharedState>, admin: AdminUser) -> Result<StatusCode, AppError> {
    state
        .auth
        .sign_out(&admin.session.access_token)
        .await
        .map_err(|err| AppError::auth("admin_logout", &err))?;
    Ok(StatusCode::NO_CONTENT)
}

/// One image position in a submitted form.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum Slot {
    /// Already stored image, by its public URL.
    Existing { url: String },
    /// A file part of the same request, by part name.
    Upload { upload: String },
}

#[derive(Debug, Default)]
struct Submission {
    form: PropertyForm,
    order: Option<Vec<Slot>>,
    files: Vec<(String, ImageFile)>,
}

async fn read_submission(
    mut multipart: Multipart,
    operation: &'static str,
) -> Result<Submission, AppError> {
    let mut submission = Submission::default();
    let mut saw_fields = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(operation, format!("Malformed upload: {err}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "fields" => {
                let text = field.text().await.map_err(|err| {
                    AppError::bad_request(operation, format!("Unreadable fields part: {err}"))
                })?;
                submission.form = serde_json::from_str(&text).map_err(|err| {
                    AppError::bad_request(operation, format!("Invalid fields JSON: {err}"))
                })?;
                saw_fields = true;
            }
            "order" => {
                let text = field.text().await.map_err(|err| {
                    AppError::bad_request(operation, format!("Unreadable order part: {err}"))
                })?;
                submission.order = Some(serde_json::from_str(&text).map_err(|err| {
                    AppError::bad_request(operation, format!("Invalid image order: {err}"))
                })?);
            }
            _ => {
                let file_name = field.file_name().unwrap_or(&name).to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field.bytes().await.map_err(|err| {
                    AppError::bad_request(operation, format!("Unreadable file part: {err}"))
                })?;
                submission
                    .files
                    .push((name, ImageFile::new(file_name, content_type, bytes)));
            }
        }
    }

    if !saw_fields {
        return Err(AppError::bad_request(operation, "Missing 'fields' part"));
    }
    Ok(submission)
}

/// Default slot order: the current images, then the uploads in part order.
fn default_slots(existing: &[String], files: &[(String, ImageFile)]) -> Vec<Slot> {
    existing
        .iter()
        .map(|url| Slot::Existing { url: url.clone() })
        .chain(files.iter().map(|(part, _)| Slot::Upload {
            upload: part.clone(),
        }))
        .collect()
}

/// Rebuilds the form's image list in slot order, transcoding each upload. `existing`
/// holds the record's current images; an existing slot must name one of them.
fn stage_images(
    state: &AppState,
    slots: Vec<Slot>,
    files: Vec<(String, ImageFile)>,
    existing: &[String],
    operation: &'static str,
) -> Result<StagedImageSet, AppError> {
    // Browsers repeat a part name for multi-file inputs; each slot takes the next one.
    let mut by_part: HashMap<String, VecDeque<ImageFile>> = HashMap::new();
    for (part, file) in files {
        by_part.entry(part).or_default().push_back(file);
    }
    let mut current: HashSet<&str> = existing.iter().map(String::as_str).collect();

    let mut set = StagedImageSet::new(
        state.stage_policy,
        state.transcoder.clone(),
        state.previews.clone(),
    );

    for slot in slots {
        match slot {
            Slot::Existing { url } => {
                if !current.remove(url.as_str()) {
                    return Err(AppError::bad_request(
                        operation,
                        format!("'{url}' is not a current image of this property"),
                    ));
                }
                set.add_remote(url)
                    .map_err(|err| AppError::stage(operation, &err))?;
            }
            Slot::Upload { upload } => {
                let file = by_part
                    .get_mut(&upload)
                    .and_then(VecDeque::pop_front)
                    .ok_or_else(|| {
                        AppError::bad_request(operation, format!("No file left for part '{upload}'"))
                    })?;
                let outcome = set
                    .add(vec![file])
                    .map_err(|err| AppError::stage(operation, &err))?;
                if !outcome.rejected.is_empty() {
                    let details = outcome
                        .rejected
                        .into_iter()
                        .map(|r| FieldError {
                            field: "images",
                            message: format!("{}: {}", r.file_name, r.reason),
                        })
                        .collect();
                    return Err(AppError::bad_request(operation, "Some images were rejected")
                        .with_details(details));
                }
            }
        }
    }

    if let Some(part) = by_part
        .iter()
        .find_map(|(part, left)| (!left.is_empty()).then_some(part))
    {
        return Err(AppError::bad_request(
            operation,
            format!("File part '{part}' has no place in the image order"),
        ));
    }
    Ok(set)
}

async fn save_property(
    state: SharedState,
    admin: &AdminUser,
    id: Option<Uuid>,
    multipart: Multipart,
    operation: &'static str,
) -> Result<SavedProperty, AppError> {
    let submission = read_submission(multipart, operation).await?;

    let existing = match id {
        Some(id) => {
            state
                .properties
                .get(id)
                .await
                .map_err(|err| AppError::repo(operation, &err))?
                .ok_or_else(|| AppError::not_found(operation, "Property not found"))?
                .images
        }
        None => Vec::new(),
    };
    let slots = submission
        .order
        .unwrap_or_else(|| default_slots(&existing, &submission.files));

    // Decoding and re-encoding is CPU-bound.
    let staging_state = state.clone();
    let files = submission.files;
    let staged = tokio::task::spawn_blocking(move || {
        stage_images(&staging_state, slots, files, &existing, operation)
    })
    .await
    .map_err(|err| AppError::bug(operation, format!("Staging task failed: {err}")))??;

    let session = RequestSession::new(state.auth.clone(), admin.session.clone());
    let id = state
        .coordinator
        .commit(id, &submission.form, &staged, &session)
        .await
        .map_err(|err| AppError::commit(operation, err))?;

    Ok(SavedProperty {
        id,
        session: session.refreshed().await.map(SessionTokens::from),
    })
}

#[derive(Debug, Serialize)]
struct SavedProperty {
    id: Uuid,
    /// Present when the admin's session was refreshed during the save.
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<SessionTokens>,
}

async fn create_property(
    State(state): State<SharedState>,
    admin: AdminUser,
    multipart: Multipart,
) -> Result<(StatusCode, Json<SavedProperty>), AppError> {
    let saved = save_property(state, &admin, None, multipart, "create_property").await?;
    info!(id = %saved.id, admin = %admin.id, "Property created");
    Ok((StatusCode::CREATED, Json(saved)))
}

async fn update_property(
    State(state): State<SharedState>,
    admin: AdminUser,
    Path(id): Path<Uuid>,
    multipart: Multipart,
) -> Result<Json<SavedProperty>, AppError> {
    let saved = save_property(state, &admin, Some(id), multipart, "update_property").await?;
    info!(id = %saved.id, admin = %admin.id, "Property updated");
    Ok(Json(saved))
}

async fn delete_property(
    State(state): State<SharedState>,
    admin: AdminUser,
    Path(id): Path<Uuid>,
) -> Result<Json<DeletedProperty>, AppError> {
    let deleted = state
        .deleter
        .delete(id)
        .await
        .map_err(|err| AppError::delete("delete_property", &err).with_context("property", id.to_string()))?;
    info!(%id, admin = %admin.id, blobs = deleted.deleted_blob_count, "Property removed");
    Ok(Json(deleted))
}

async fn storage_health(
    State(state): State<SharedState>,
    _admin: AdminUser,
) -> Result<Json<StorageHealth>, AppError> {
    state
        .reconciler
        .health()
        .await
        .map(Json)
        .map_err(|err| AppError::reconcile("storage_health", &err))
}

#[derive(Deserialize)]
struct CleanupRequest {
    #[serde(default = "default_dry_run")]
    dry_run: bool,
}

fn default_dry_run() -> bool {
    true
}

async fn storage_cleanup(
    State(state): State<SharedState>,
    admin: AdminUser,
    Json(req): Json<CleanupRequest>,
) -> Result<Json<CleanupReport>, AppError> {
    info!(admin = %admin.id, dry_run = req.dry_run, "Storage cleanup requested");
    state
        .reconciler
        .run(req.dry_run)
        .await
        .map(Json)
        .map_err(|err| AppError::reconcile("storage_cleanup", &err))
}
