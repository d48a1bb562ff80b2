//! Named layout profiles: plain file-backed JSON storage with CRUD,
//! export-as-attachment, and a three-shape import endpoint.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use axum::extract::{Path as UrlPath, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutProfile {
    pub id: String,
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub layout: Value,
    /// Anything a client stored that this server version does not know
    /// about rides along untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LayoutProfile {
    fn new(name: String, layout: Value) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            created_at: now,
            updated_at: now,
            layout,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutStoreFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_id: Option<String>,
    #[serde(default)]
    pub items: BTreeMap<String, LayoutProfile>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug)]
pub struct LayoutStore {
    path: PathBuf,
    inner: Mutex<LayoutStoreFile>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    pub ok: bool,
    pub mode: String,
    pub created: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_id: Option<String>,
}

impl LayoutStore {
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        let file = match tokio::fs::read_to_string(path).await {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => LayoutStoreFile::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(file),
        })
    }

    async fn persist(&self, file: &LayoutStoreFile) -> std::io::Result<()> {
        let raw = serde_json::to_string_pretty(file)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &self.path).await
    }

    pub async fn snapshot(&self) -> LayoutStoreFile {
        self.inner.lock().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<LayoutProfile> {
        self.inner.lock().await.items.get(id).cloned()
    }

    pub async fn create(&self, name: String, layout: Value) -> std::io::Result<LayoutProfile> {
        let profile = LayoutProfile::new(name, layout);
        let mut inner = self.inner.lock().await;
        inner.items.insert(profile.id.clone(), profile.clone());
        if inner.default_id.is_none() {
            inner.default_id = Some(profile.id.clone());
        }
        self.persist(&inner).await?;
        Ok(profile)
    }

    pub async fn update(
        &self,
        id: &str,
        name: Option<String>,
        layout: Option<Value>,
    ) -> std::io::Result<Option<LayoutProfile>> {
        let mut inner = self.inner.lock().await;
        let Some(profile) = inner.items.get_mut(id) else {
            return Ok(None);
        };
        if let Some(name) = name {
            profile.name = name;
        }
        if let Some(layout) = layout {
            profile.layout = layout;
        }
        profile.updated_at = Utc::now().timestamp_millis();
        let updated = profile.clone();
        self.persist(&inner).await?;
        Ok(Some(updated))
    }

    pub async fn delete(&self, id: &str) -> std::io::Result<bool> {
        let mut inner = self.inner.lock().await;
        let removed = inner.items.remove(id).is_some();
        if removed {
            if inner.default_id.as_deref() == Some(id) {
                inner.default_id = inner.items.keys().next().cloned();
            }
            self.persist(&inner).await?;
        }
        Ok(removed)
    }

    /// Accepts (a) a full store `{defaultId, items}`, (b) a single profile
    /// carrying a stable id, or (c) a wrapper `{name?, layout}`. Shapes (a)
    /// and (b) pass unknown fields through; the wrapper is normalized into a
    /// fresh profile.
    pub async fn import(&self, payload: Value) -> AppResult<ImportOutcome> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now().timestamp_millis();
        let mut created = Vec::new();

        let mode = if payload.get("items").is_some_and(Value::is_object) {
            let store: LayoutStoreFile = serde_json::from_value(payload)?;
            for (id, mut profile) in store.items {
                profile.id = id.clone();
                profile.updated_at = now;
                created.push(id.clone());
                inner.items.insert(id, profile);
            }
            if let Some(default_id) = store.default_id {
                if inner.items.contains_key(&default_id) {
                    inner.default_id = Some(default_id);
                }
            }
            "store"
        } else if payload.get("id").is_some_and(Value::is_string) {
            let mut profile: LayoutProfile = serde_json::from_value(payload)?;
            if inner.items.contains_key(&profile.id) {
                profile.id = Uuid::new_v4().to_string();
            }
            profile.updated_at = now;
            created.push(profile.id.clone());
            inner.items.insert(profile.id.clone(), profile);
            "profile"
        } else if payload.get("layout").is_some() {
            let name = payload
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("Imported layout")
                .to_string();
            let profile = LayoutProfile::new(name, payload["layout"].clone());
            created.push(profile.id.clone());
            inner.items.insert(profile.id.clone(), profile);
            "wrapper"
        } else {
            return Err(AppError::bad_request("unrecognized layout import payload"));
        };

        if inner.default_id.is_none() {
            inner.default_id = created.first().cloned();
        }
        self.persist(&inner).await.map_err(AppError::from)?;

        Ok(ImportOutcome {
            ok: true,
            mode: mode.to_string(),
            created,
            default_id: inner.default_id.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertLayoutRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub layout: Option<Value>,
}

pub async fn list_layouts(State(state): State<AppState>) -> AppResult<Json<LayoutStoreFile>> {
    Ok(Json(state.layouts.snapshot().await))
}

pub async fn create_layout(
    State(state): State<AppState>,
    Json(body): Json<UpsertLayoutRequest>,
) -> AppResult<(StatusCode, Json<LayoutProfile>)> {
    let profile = state
        .layouts
        .create(
            body.name.unwrap_or_else(|| "Untitled layout".to_string()),
            body.layout.unwrap_or(Value::Null),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(profile)))
}

pub async fn get_layout(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> AppResult<Json<LayoutProfile>> {
    state
        .layouts
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("layout not found: {id}")))
}

pub async fn update_layout(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
    Json(body): Json<UpsertLayoutRequest>,
) -> AppResult<Json<LayoutProfile>> {
    state
        .layouts
        .update(&id, body.name, body.layout)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("layout not found: {id}")))
}

pub async fn delete_layout(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> AppResult<StatusCode> {
    if state.layouts.delete(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found(format!("layout not found: {id}")))
    }
}

pub async fn export_layout(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> AppResult<Response> {
    let profile = state
        .layouts
        .get(&id)
        .await
        .ok_or_else(|| AppError::not_found(format!("layout not found: {id}")))?;

    let body = serde_json::to_string_pretty(&profile).map_err(AppError::from)?;
    let filename = format!("{}.layout.json", profile.name.replace(['/', '\\'], "_"));
    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response())
}

pub async fn import_layouts(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> AppResult<Json<ImportOutcome>> {
    let outcome = state.layouts.import(payload).await?;
    Ok(Json(outcome))
}
