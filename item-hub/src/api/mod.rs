//! HTTP surface over the hierarchy engine.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::sse::{self, Sse},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use item_hub_core::acl::{Grant, PermissionLedger, PermissionLevel};
use item_hub_core::auth::TokenVerifier;
use item_hub_core::bulk::{BatchDisposition, Coordinator};
use item_hub_core::error::HubError;
use item_hub_core::events::{Event, EventBus};
use item_hub_core::item::{Item, ItemKind, Visibility};
use item_hub_core::limits::TreeLimits;
use item_hub_core::storage::ItemStore;

/// Authentication context extracted from request headers.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub user_id: String,
}

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;
        if let Some(auth) = headers.get("Authorization").and_then(|v| v.to_str().ok()) {
            if let Some(token) = auth.strip_prefix("Bearer ") {
                if let Some(claims) = state.verifier.verify(token).await {
                    return Ok(Self {
                        user_id: claims.sub,
                    });
                }
            }
        }
        match headers
            .get("X-User-Id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
        {
            Some(user_id) => Ok(Self { user_id }),
            None => Err(StatusCode::UNAUTHORIZED),
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<RwLock<ItemStore>>,
    pub ledger: Arc<RwLock<PermissionLedger>>,
    pub coordinator: Arc<Coordinator>,
    pub limits: TreeLimits,
    pub events: EventBus,
    pub verifier: Arc<dyn TokenVerifier>,
}

#[derive(Serialize, Deserialize)]
struct CreateItemRequest {
    name: String,
    parent_id: Option<Uuid>,
    #[serde(flatten)]
    kind: ItemKind,
    visibility: Option<Visibility>,
}

#[derive(Serialize, Deserialize)]
struct ItemResponse {
    id: Uuid,
    name: String,
    path: String,
    parent_id: Option<Uuid>,
    depth: usize,
    #[serde(flatten)]
    kind: ItemKind,
    visibility: Visibility,
    owner: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl From<&Item> for ItemResponse {
    fn from(item: &Item) -> Self {
        Self {
            id: item.id,
            name: item.name.clone(),
            path: item.path.to_string(),
            parent_id: item.parent_id(),
            depth: item.depth(),
            kind: item.kind.clone(),
            visibility: item.visibility,
            owner: item.owner.clone(),
            created_at: item.created_at,
            updated_at: item.updated_at,
            deleted_at: item.deleted_at,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct BatchGetRequest {
    ids: Vec<Uuid>,
}

#[derive(Serialize, Deserialize)]
struct BatchGetEntry {
    id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    item: Option<ItemResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct BulkRequest {
    ids: Vec<Uuid>,
    #[serde(default)]
    destination_parent_id: Option<Uuid>,
}

#[derive(Deserialize)]
struct RenameRequest {
    name: String,
}

#[derive(Deserialize)]
struct OrderRequest {
    order: Vec<Uuid>,
}

#[derive(Deserialize)]
struct ContentRequest {
    body: String,
}

#[derive(Deserialize)]
struct VisibilityRequest {
    visibility: Visibility,
}

#[derive(Serialize, Deserialize)]
struct ShareRequest {
    actor: String,
    level: PermissionLevel,
}

#[derive(Deserialize)]
struct UnshareRequest {
    actor: String,
}

#[derive(Deserialize)]
struct ChildrenQuery {
    #[serde(default)]
    ordered: bool,
}

#[derive(Deserialize)]
struct DescendantsQuery {
    #[serde(default)]
    ordered: bool,
    kind: Option<String>,
    #[serde(default)]
    include_deleted: bool,
}

#[derive(Deserialize)]
struct SharedQuery {
    min_level: Option<PermissionLevel>,
}

#[derive(Serialize, Deserialize)]
struct RootResponse {
    id: Uuid,
}

fn status_of(err: &HubError) -> StatusCode {
    match err {
        HubError::NotFound(_) => StatusCode::NOT_FOUND,
        HubError::Forbidden { .. } => StatusCode::FORBIDDEN,
        HubError::LimitExceeded { .. } | HubError::Unsupported(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        HubError::Cycle | HubError::DuplicatePath(_) => StatusCode::CONFLICT,
        HubError::MalformedPath(_) | HubError::Integrity(_) | HubError::Unavailable(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn permitted(
    ledger: &PermissionLedger,
    actor: &str,
    item: &Item,
    required: PermissionLevel,
) -> Result<(), StatusCode> {
    match ledger.effective_permission_with(actor, item) {
        Ok(Some(level)) if level >= required => Ok(()),
        Ok(_) => Err(StatusCode::FORBIDDEN),
        Err(err) => Err(status_of(&err)),
    }
}

/// Bootstrap the actor's root folder, with the implicit Admin grant a fresh
/// root carries.
async fn ensure_actor_root(state: &AppState, actor: &str) -> Result<Uuid, HubError> {
    let root_path = {
        let mut store = state.store.write().await;
        let root = store.ensure_root(actor)?;
        store.get(root).map(|item| item.path.clone())
    };
    let Some(root_path) = root_path else {
        return Err(HubError::Integrity("root folder vanished".into()));
    };
    let root = root_path.item_id()?;
    let mut ledger = state.ledger.write().await;
    if ledger.effective_permission(actor, &root_path)?.is_none() {
        ledger.grant(actor, root, PermissionLevel::Admin)?;
    }
    Ok(root)
}

pub fn router(
    store: Arc<RwLock<ItemStore>>,
    ledger: Arc<RwLock<PermissionLedger>>,
    coordinator: Arc<Coordinator>,
    limits: TreeLimits,
    events: EventBus,
    verifier: Arc<dyn TokenVerifier>,
) -> Router {
    let app_state = AppState {
        store,
        ledger,
        coordinator,
        limits,
        events,
        verifier,
    };
    Router::new()
        .route("/items", post(create_item))
        .route("/items/batch", post(batch_get))
        .route("/items/{id}", get(get_item))
        .route("/items/{id}/children", get(list_children))
        .route("/items/{id}/descendants", get(list_descendants))
        .route("/items/{id}/rename", put(rename_item))
        .route("/items/{id}/order", put(set_child_order))
        .route("/items/{id}/content", put(update_content))
        .route("/items/{id}/visibility", put(set_visibility))
        .route("/items/{id}/share", post(share_item).delete(unshare_item))
        .route("/items/{id}/sharing", get(list_sharing))
        .route("/items/move", post(move_items))
        .route("/items/copy", post(copy_items))
        .route("/items/delete", post(delete_items))
        .route("/items/restore", post(restore_items))
        .route("/items/purge", post(purge_items))
        .route("/shared-with-me", get(shared_with_me))
        .route("/limits", get(get_limits))
        .route("/root", get(get_root))
        .route("/events", get(event_stream))
        .with_state(app_state)
}

async fn create_item(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateItemRequest>,
) -> Result<Json<ItemResponse>, StatusCode> {
    let root = ensure_actor_root(&state, &auth.user_id)
        .await
        .map_err(|err| status_of(&err))?;
    req.kind.validate().map_err(|err| status_of(&err))?;

    let mut store = state.store.write().await;
    let parent_id = req.parent_id.unwrap_or(root);
    let parent = store
        .get_active(parent_id)
        .map_err(|err| status_of(&err))?;
    if !parent.kind.is_folder() {
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }
    let parent_path = parent.path.clone();
    {
        let ledger = state.ledger.read().await;
        permitted(&ledger, &auth.user_id, parent, PermissionLevel::Write)?;
    }
    state
        .limits
        .assert_can_add_child(&store, &parent_path)
        .map_err(|err| status_of(&err))?;
    state
        .limits
        .assert_depth_within_limit(parent_path.depth(), 1)
        .map_err(|err| status_of(&err))?;

    let id = Uuid::new_v4();
    let mut item = Item::new(
        id,
        parent_path.child(id),
        req.name,
        auth.user_id.clone(),
        req.kind,
    );
    if let Some(visibility) = req.visibility {
        item.visibility = visibility;
    }
    let response = ItemResponse::from(&item);
    let item_path = item.path.clone();
    store.create(item).map_err(|err| status_of(&err))?;
    drop(store);

    let mut ledger = state.ledger.write().await;
    let covered = ledger
        .effective_permission(&auth.user_id, &item_path)
        .map_err(|err| status_of(&err))?
        .is_some();
    if !covered {
        ledger
            .grant(&auth.user_id, id, PermissionLevel::Admin)
            .map_err(|err| status_of(&err))?;
    }
    drop(ledger);

    state.events.send(Event::Created { id });
    Ok(Json(response))
}

async fn get_item(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Json<ItemResponse>, StatusCode> {
    let store = state.store.read().await;
    let Some(item) = store.get(id) else {
        return Err(StatusCode::NOT_FOUND);
    };
    let ledger = state.ledger.read().await;
    permitted(&ledger, &auth.user_id, item, PermissionLevel::Read)?;
    Ok(Json(ItemResponse::from(item)))
}

async fn batch_get(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<BatchGetRequest>,
) -> Result<Json<Vec<BatchGetEntry>>, StatusCode> {
    let store = state.store.read().await;
    let ledger = state.ledger.read().await;
    let mut entries = Vec::with_capacity(req.ids.len());
    for id in req.ids {
        let entry = match store.get(id) {
            Some(item) => match permitted(&ledger, &auth.user_id, item, PermissionLevel::Read) {
                Ok(()) => BatchGetEntry {
                    id,
                    item: Some(ItemResponse::from(item)),
                    error: None,
                },
                Err(_) => BatchGetEntry {
                    id,
                    item: None,
                    error: Some("forbidden".to_string()),
                },
            },
            None => BatchGetEntry {
                id,
                item: None,
                error: Some("not_found".to_string()),
            },
        };
        entries.push(entry);
    }
    Ok(Json(entries))
}

async fn list_children(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Query(query): Query<ChildrenQuery>,
) -> Result<Json<Vec<ItemResponse>>, StatusCode> {
    let store = state.store.read().await;
    let parent = store.get_active(id).map_err(|err| status_of(&err))?;
    let ledger = state.ledger.read().await;
    permitted(&ledger, &auth.user_id, parent, PermissionLevel::Read)?;
    let children = store
        .get_children(&parent.path, query.ordered)
        .into_iter()
        .map(ItemResponse::from)
        .collect();
    Ok(Json(children))
}

async fn list_descendants(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Query(query): Query<DescendantsQuery>,
) -> Result<Json<Vec<ItemResponse>>, StatusCode> {
    let store = state.store.read().await;
    let root = store.get_active(id).map_err(|err| status_of(&err))?;
    let ledger = state.ledger.read().await;
    permitted(&ledger, &auth.user_id, root, PermissionLevel::Read)?;
    let descendants = if query.include_deleted {
        store.get_descendants_with_deleted(&root.path)
    } else {
        store.get_descendants(&root.path, query.ordered)
    };
    let items = descendants
        .into_iter()
        .filter(|item| {
            query
                .kind
                .as_deref()
                .is_none_or(|kind| item.kind.label() == kind)
        })
        .map(ItemResponse::from)
        .collect();
    Ok(Json(items))
}

async fn rename_item(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Json(req): Json<RenameRequest>,
) -> StatusCode {
    let mut store = state.store.write().await;
    let Ok(item) = store.get_active(id) else {
        return StatusCode::NOT_FOUND;
    };
    {
        let ledger = state.ledger.read().await;
        if let Err(status) = permitted(&ledger, &auth.user_id, item, PermissionLevel::Write) {
            return status;
        }
    }
    match store.rename(id, req.name) {
        Ok(()) => {
            drop(store);
            state.events.send(Event::Renamed { id });
            StatusCode::NO_CONTENT
        }
        Err(err) => status_of(&err),
    }
}

async fn set_child_order(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Json(req): Json<OrderRequest>,
) -> StatusCode {
    let mut store = state.store.write().await;
    let Ok(item) = store.get_active(id) else {
        return StatusCode::NOT_FOUND;
    };
    {
        let ledger = state.ledger.read().await;
        if let Err(status) = permitted(&ledger, &auth.user_id, item, PermissionLevel::Write) {
            return status;
        }
    }
    match store.set_child_order(id, req.order) {
        Ok(()) => {
            drop(store);
            state.events.send(Event::Updated { id });
            StatusCode::NO_CONTENT
        }
        Err(err) => status_of(&err),
    }
}

async fn update_content(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Json(req): Json<ContentRequest>,
) -> StatusCode {
    let mut store = state.store.write().await;
    let Ok(item) = store.get_active(id) else {
        return StatusCode::NOT_FOUND;
    };
    {
        let ledger = state.ledger.read().await;
        if let Err(status) = permitted(&ledger, &auth.user_id, item, PermissionLevel::Write) {
            return status;
        }
    }
    match store.update_document_body(id, req.body) {
        Ok(()) => {
            drop(store);
            state.events.send(Event::Updated { id });
            StatusCode::NO_CONTENT
        }
        Err(err) => status_of(&err),
    }
}

async fn set_visibility(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Json(req): Json<VisibilityRequest>,
) -> StatusCode {
    let mut store = state.store.write().await;
    let Ok(item) = store.get_active(id) else {
        return StatusCode::NOT_FOUND;
    };
    {
        let ledger = state.ledger.read().await;
        // publishing is a sharing decision
        if let Err(status) = permitted(&ledger, &auth.user_id, item, PermissionLevel::Admin) {
            return status;
        }
    }
    match store.set_visibility(id, req.visibility) {
        Ok(()) => {
            drop(store);
            state.events.send(Event::Updated { id });
            StatusCode::NO_CONTENT
        }
        Err(err) => status_of(&err),
    }
}

async fn share_item(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Json(req): Json<ShareRequest>,
) -> StatusCode {
    {
        let store = state.store.read().await;
        let Ok(item) = store.get_active(id) else {
            return StatusCode::NOT_FOUND;
        };
        let ledger = state.ledger.read().await;
        if let Err(status) = permitted(&ledger, &auth.user_id, item, PermissionLevel::Admin) {
            return status;
        }
    }
    let mut ledger = state.ledger.write().await;
    match ledger.grant(&req.actor, id, req.level) {
        Ok(()) => {
            drop(ledger);
            state.events.send(Event::Shared {
                id,
                actor: req.actor,
            });
            StatusCode::NO_CONTENT
        }
        Err(err) => status_of(&err),
    }
}

async fn unshare_item(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Json(req): Json<UnshareRequest>,
) -> StatusCode {
    {
        let store = state.store.read().await;
        let Ok(item) = store.get_active(id) else {
            return StatusCode::NOT_FOUND;
        };
        let ledger = state.ledger.read().await;
        if let Err(status) = permitted(&ledger, &auth.user_id, item, PermissionLevel::Admin) {
            return status;
        }
    }
    let mut ledger = state.ledger.write().await;
    match ledger.revoke(&req.actor, id) {
        Ok(true) => {
            drop(ledger);
            state.events.send(Event::Unshared {
                id,
                actor: req.actor,
            });
            StatusCode::NO_CONTENT
        }
        Ok(false) => StatusCode::NOT_FOUND,
        Err(err) => status_of(&err),
    }
}

async fn list_sharing(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Grant>>, StatusCode> {
    let store = state.store.read().await;
    let Some(item) = store.get(id) else {
        return Err(StatusCode::NOT_FOUND);
    };
    let ledger = state.ledger.read().await;
    permitted(&ledger, &auth.user_id, item, PermissionLevel::Admin)?;
    let grants = ledger
        .list_inherited_and_below(&item.path, &store)
        .map_err(|err| status_of(&err))?;
    Ok(Json(grants))
}

async fn shared_with_me(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(query): Query<SharedQuery>,
) -> Json<Vec<ItemResponse>> {
    let store = state.store.read().await;
    let ledger = state.ledger.read().await;
    let items = ledger
        .shared_with_me(&auth.user_id, &store, query.min_level)
        .iter()
        .map(ItemResponse::from)
        .collect();
    Json(items)
}

async fn move_items(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<BulkRequest>,
) -> Result<(StatusCode, Json<BatchDisposition>), StatusCode> {
    ensure_actor_root(&state, &auth.user_id)
        .await
        .map_err(|err| status_of(&err))?;
    let disposition = state
        .coordinator
        .move_items(&auth.user_id, &req.ids, req.destination_parent_id)
        .await
        .map_err(|err| status_of(&err))?;
    Ok(respond(disposition))
}

async fn copy_items(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<BulkRequest>,
) -> Result<(StatusCode, Json<BatchDisposition>), StatusCode> {
    ensure_actor_root(&state, &auth.user_id)
        .await
        .map_err(|err| status_of(&err))?;
    let disposition = state
        .coordinator
        .copy_items(&auth.user_id, &req.ids, req.destination_parent_id)
        .await
        .map_err(|err| status_of(&err))?;
    Ok(respond(disposition))
}

async fn delete_items(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<BulkRequest>,
) -> Result<(StatusCode, Json<BatchDisposition>), StatusCode> {
    let disposition = state
        .coordinator
        .delete_items(&auth.user_id, &req.ids)
        .await
        .map_err(|err| status_of(&err))?;
    Ok(respond(disposition))
}

async fn restore_items(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<BulkRequest>,
) -> Result<(StatusCode, Json<BatchDisposition>), StatusCode> {
    let disposition = state
        .coordinator
        .restore_items(&auth.user_id, &req.ids)
        .await
        .map_err(|err| status_of(&err))?;
    Ok(respond(disposition))
}

async fn purge_items(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<BulkRequest>,
) -> Result<(StatusCode, Json<BatchDisposition>), StatusCode> {
    let disposition = state
        .coordinator
        .purge_items(&auth.user_id, &req.ids)
        .await
        .map_err(|err| status_of(&err))?;
    Ok(respond(disposition))
}

fn respond(disposition: BatchDisposition) -> (StatusCode, Json<BatchDisposition>) {
    let status = if disposition.asynchronous {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    (status, Json(disposition))
}

async fn get_limits(State(state): State<AppState>) -> Json<TreeLimits> {
    Json(state.limits.clone())
}

async fn get_root(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<RootResponse>, StatusCode> {
    let id = ensure_actor_root(&state, &auth.user_id)
        .await
        .map_err(|err| status_of(&err))?;
    Ok(Json(RootResponse { id }))
}

async fn event_stream(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Sse<impl Stream<Item = Result<sse::Event, Infallible>>> {
    let rx = state.events.subscribe();
    let store = state.store.clone();
    let ledger = state.ledger.clone();
    let user = auth.user_id.clone();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(move |res| {
        let store = store.clone();
        let ledger = ledger.clone();
        let user = user.clone();
        async move {
            match res {
                Ok(event) => {
                    let allow = {
                        let store = store.read().await;
                        let ledger = ledger.read().await;
                        match store.get(event.item_id()) {
                            Some(item) => matches!(
                                ledger.effective_permission_with(&user, item),
                                Ok(Some(_))
                            ),
                            None => false,
                        }
                    };
                    if allow {
                        let data = serde_json::to_string(&event).ok()?;
                        Some(Ok(sse::Event::default().data(data)))
                    } else {
                        None
                    }
                }
                Err(_) => None,
            }
        }
    });
    Sse::new(stream)
}
