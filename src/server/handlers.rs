//! Endpoint handlers.

use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use super::{bad_request, ApiError, AppState};
use crate::load::username_for_uid;
use crate::query::{sanitize, translate_query, Clause, Order, Scroll};
use crate::storage::sqlite::{
    validate_base_names, validate_directory_path, QueryOptions, RegisteredFilter,
};
use crate::whitelist::LinkWhitelist;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 100;
const DEFAULT_BASE_NAME: &str = "metadata.json";

type Params = HashMap<String, String>;

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|err| ApiError::BadRequest(format!("invalid request body: {err}")))
}

fn required_param<'a>(params: &'a Params, key: &str) -> Result<&'a str, ApiError> {
    params
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("missing query parameter {key:?}")))
}

fn bool_param(params: &Params, key: &str, default: bool) -> Result<bool, ApiError> {
    match params.get(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" => Ok(true),
            "false" | "0" | "no" | "n" => Ok(false),
            other => Err(ApiError::BadRequest(format!(
                "invalid boolean {other:?} for {key:?}"
            ))),
        },
    }
}

fn limit_param(params: &Params) -> Result<usize, ApiError> {
    match params.get("limit") {
        None => Ok(DEFAULT_LIMIT),
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map_err(|_| ApiError::BadRequest(format!("invalid limit {raw:?}")))
            .map(|limit| limit.clamp(1, MAX_LIMIT)),
    }
}

fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn next_url(prefix: &str, endpoint: &str, params: &Params, keep: &[&str], scroll: &str) -> String {
    let mut url = format!("{prefix}{endpoint}?scroll={}", encode_component(scroll));
    for key in keep {
        if let Some(value) = params.get(*key) {
            url.push_str(&format!("&{key}={}", encode_component(value)));
        }
    }
    url
}

// --- registration -----------------------------------------------------------

#[derive(Deserialize)]
struct StartRequest {
    path: String,
}

#[derive(Deserialize)]
struct FinishRequest {
    path: String,
    #[serde(default)]
    base: Option<Vec<String>>,
    #[serde(default)]
    block: Option<bool>,
}

/// Pop the pending session for `dir` and prove filesystem ownership from the
/// verification file. Returns the authenticated username.
///
/// The file is examined with lstat so a symlink cannot impersonate it, and a
/// file with more than one hard link is rejected: both would let someone pass
/// off another user's inode as their own.
fn verify_ownership(state: &AppState, dir: &Path) -> Result<String, ApiError> {
    let code = state.registry.pop(dir).ok_or_else(|| {
        ApiError::Unauthorized(format!("no pending verification for {}", dir.display()))
    })?;
    let candidate = dir.join(&code);
    let meta = std::fs::symlink_metadata(&candidate).map_err(|_| {
        ApiError::Unauthorized(format!(
            "verification file {code} not found in {}",
            dir.display()
        ))
    })?;
    if !meta.file_type().is_file() {
        return Err(ApiError::Unauthorized(format!(
            "verification file {code} is not a regular file"
        )));
    }
    if meta.nlink() > 1 {
        return Err(ApiError::BadRequest(format!(
            "verification file {code} has multiple hard links"
        )));
    }
    let uid = meta.uid();
    username_for_uid(uid)
        .ok_or_else(|| ApiError::Internal(anyhow!("failed to resolve username for uid {uid}")))
}

pub(super) async fn register_start(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req: StartRequest = parse_body(&body)?;
    let dir = PathBuf::from(&req.path);
    validate_directory_path(&dir).map_err(bad_request)?;
    match std::fs::metadata(&dir) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(ApiError::BadRequest(format!(
                "{} is not a directory",
                dir.display()
            )))
        }
        Err(err) => {
            return Err(ApiError::BadRequest(format!(
                "failed to access {}: {err}",
                dir.display()
            )))
        }
    }
    let code = state.registry.provision(&dir)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "PENDING", "code": code })),
    )
        .into_response())
}

pub(super) async fn register_finish(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req: FinishRequest = parse_body(&body)?;
    let dir = PathBuf::from(&req.path);
    validate_directory_path(&dir).map_err(bad_request)?;
    let names = req
        .base
        .unwrap_or_else(|| vec![DEFAULT_BASE_NAME.to_string()]);
    validate_base_names(&names).map_err(bad_request)?;

    let user = verify_ownership(&state, &dir)?;

    if req.block.unwrap_or(true) {
        let comments = state
            .store
            .add_new_directory(&dir, &names, &user, &state.shutdown.child_token())
            .await?;
        Ok((
            StatusCode::OK,
            Json(json!({ "status": "SUCCESS", "comments": comments })),
        )
            .into_response())
    } else {
        let store = state.store.clone();
        let cancel = state.shutdown.child_token();
        tokio::spawn(async move {
            match store.add_new_directory(&dir, &names, &user, &cancel).await {
                Ok(comments) => {
                    for comment in &comments {
                        tracing::warn!(dir = %dir.display(), comment, "registration comment");
                    }
                }
                Err(err) => {
                    tracing::error!(dir = %dir.display(), error = %format!("{err:#}"), "background registration failed");
                }
            }
        });
        Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "status": "PENDING" })),
        )
            .into_response())
    }
}

pub(super) async fn deregister_start(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req: StartRequest = parse_body(&body)?;
    let dir = PathBuf::from(&req.path);
    validate_directory_path(&dir).map_err(bad_request)?;

    // A directory that no longer exists cannot host a verification file;
    // anyone may ask for its stale registration to be dropped.
    if std::fs::symlink_metadata(&dir).is_err() {
        state.store.delete_directory(&dir).await?;
        return Ok((StatusCode::OK, Json(json!({ "status": "SUCCESS" }))).into_response());
    }

    let code = state.registry.provision(&dir)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "PENDING", "code": code })),
    )
        .into_response())
}

pub(super) async fn deregister_finish(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req: FinishRequest = parse_body(&body)?;
    let dir = PathBuf::from(&req.path);
    validate_directory_path(&dir).map_err(bad_request)?;

    verify_ownership(&state, &dir)?;

    if req.block.unwrap_or(true) {
        state.store.delete_directory(&dir).await?;
        Ok((StatusCode::OK, Json(json!({ "status": "SUCCESS" }))).into_response())
    } else {
        let store = state.store.clone();
        tokio::spawn(async move {
            if let Err(err) = store.delete_directory(&dir).await {
                tracing::error!(dir = %dir.display(), error = %format!("{err:#}"), "background deregistration failed");
            }
        });
        Ok((StatusCode::ACCEPTED, Json(json!({ "status": "PENDING" }))).into_response())
    }
}

// --- search and retrieval ---------------------------------------------------

pub(super) async fn query(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let clause: Clause = parse_body(&body)?;
    let clause = if bool_param(&params, "translate", false)? {
        translate_query(&clause).map_err(bad_request)?
    } else {
        clause
    };
    let clause = sanitize(&clause).map_err(bad_request)?;

    let order = match params.get("order") {
        Some(raw) => Order::parse(raw).map_err(bad_request)?,
        None => Order::default(),
    };
    let scroll = params
        .get("scroll")
        .map(|raw| Scroll::parse(raw, order))
        .transpose()
        .map_err(bad_request)?;
    let options = QueryOptions {
        order,
        scroll,
        limit: limit_param(&params)?,
        include_metadata: bool_param(&params, "metadata", true)?,
    };

    // A clause that sanitized away entirely matches nothing.
    let Some(clause) = clause else {
        return Ok(Json(json!({ "results": [] })).into_response());
    };

    let page = state.store.query_tokens(Some(&clause), &options)?;
    let mut response = json!({ "results": page.results });
    if let Some(next) = page.next {
        response["next"] = json!(next_url(
            &state.config.url_prefix,
            "/query",
            &params,
            &["translate", "limit", "metadata", "order"],
            &next.encode(),
        ));
    }
    Ok(Json(response).into_response())
}

pub(super) async fn retrieve_metadata(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    let path = required_param(&params, "path")?;
    let include_metadata = bool_param(&params, "metadata", true)?;
    let record = state
        .store
        .retrieve_path(path, include_metadata)?
        .ok_or_else(|| ApiError::NotFound(format!("{path} is not indexed")))?;
    Ok(Json(record).into_response())
}

/// Reject paths that reach through a symlink the whitelist does not admit.
/// Every component below the registered root is lstat-checked.
fn check_link_safety(path: &Path, root: &Path, whitelist: &LinkWhitelist) -> Result<(), ApiError> {
    let rel = match path.strip_prefix(root) {
        Ok(rel) => rel,
        Err(_) => return Ok(()),
    };
    let mut current = root.to_path_buf();
    for component in rel.components() {
        current.push(component);
        let meta = std::fs::symlink_metadata(&current).map_err(|_| {
            ApiError::NotFound(format!("{} does not exist", current.display()))
        })?;
        if meta.file_type().is_symlink() && !whitelist.allows_link(&current) {
            return Err(ApiError::Forbidden(format!(
                "{} is behind a non-whitelisted symbolic link",
                path.display()
            )));
        }
    }
    Ok(())
}

fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("json") => "application/json",
        Some("html") | Some("htm") => "text/html",
        Some("txt") | Some("log") => "text/plain",
        Some("md") => "text/markdown",
        Some("csv") => "text/csv",
        Some("tsv") => "text/tab-separated-values",
        Some("xml") => "text/xml",
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("gz") => "application/gzip",
        _ => "application/octet-stream",
    }
}

pub(super) async fn retrieve_file(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    let raw = required_param(&params, "path")?;
    let path = Path::new(raw);

    let root = state
        .store
        .registered_ancestor(raw)?
        .ok_or_else(|| ApiError::Forbidden(format!("{raw} is not under a registered directory")))?;
    check_link_safety(path, Path::new(&root), &state.whitelist)?;

    let bytes = std::fs::read(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            ApiError::NotFound(format!("{raw} does not exist"))
        } else {
            ApiError::Internal(anyhow!("failed to read {raw}: {err}"))
        }
    })?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type_for(path))],
        bytes,
    )
        .into_response())
}

pub(super) async fn list_directory(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    let raw = required_param(&params, "path")?;
    let recursive = bool_param(&params, "recursive", false)?;
    let root = Path::new(raw);

    if !state.store.is_directory_registered(raw)? {
        return Err(ApiError::NotFound(format!(
            "{raw} is not under a registered directory"
        )));
    }

    let mut entries = Vec::new();
    if recursive {
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let listing = std::fs::read_dir(&dir).map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    ApiError::NotFound(format!("{} does not exist", dir.display()))
                } else {
                    ApiError::Internal(anyhow!("failed to list {}: {err}", dir.display()))
                }
            })?;
            for entry in listing {
                let entry = entry.map_err(|err| ApiError::Internal(anyhow!("{err}")))?;
                let entry_path = entry.path();
                // file_type does not follow links, so symlinked directories
                // show up as plain entries and are never descended into.
                let is_dir = entry
                    .file_type()
                    .map(|ft| ft.is_dir())
                    .unwrap_or(false);
                if is_dir {
                    stack.push(entry_path);
                } else if let Ok(rel) = entry_path.strip_prefix(root) {
                    entries.push(rel.to_string_lossy().into_owned());
                }
            }
        }
    } else {
        let listing = std::fs::read_dir(root).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ApiError::NotFound(format!("{raw} does not exist"))
            } else {
                ApiError::Internal(anyhow!("failed to list {raw}: {err}"))
            }
        })?;
        for entry in listing {
            let entry = entry.map_err(|err| ApiError::Internal(anyhow!("{err}")))?;
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            entries.push(name);
        }
    }
    entries.sort();
    Ok(Json(entries).into_response())
}

// --- listings ---------------------------------------------------------------

pub(super) async fn list_registered(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    let scroll = params
        .get("scroll")
        .map(|raw| {
            raw.parse::<i64>()
                .map_err(|_| ApiError::BadRequest(format!("invalid scroll {raw:?}")))
        })
        .transpose()?;
    let exists = match params.get("exists") {
        None => None,
        Some(_) => Some(bool_param(&params, "exists", false)?),
    };
    let filter = RegisteredFilter {
        user: params.get("user").cloned(),
        contains_path: params.get("contains_path").cloned(),
        within_path: params.get("within_path").cloned(),
        path_prefix: params.get("path_prefix").cloned(),
        exists,
        scroll,
        limit: limit_param(&params)?,
    };

    let page = state.store.list_registered_directories(&filter)?;
    let mut response = json!({ "results": page.results });
    if let Some(next) = page.next {
        response["next"] = json!(next_url(
            &state.config.url_prefix,
            "/registered",
            &params,
            &["user", "contains_path", "within_path", "path_prefix", "exists", "limit"],
            &next.to_string(),
        ));
    }
    Ok(Json(response).into_response())
}

pub(super) async fn list_fields(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    let count = bool_param(&params, "count", false)?;
    let limit = limit_param(&params)?;
    let (results, next) = state.store.list_fields(
        params.get("pattern").map(String::as_str),
        count,
        params.get("scroll").map(String::as_str),
        limit,
    )?;

    let results: Vec<_> = results
        .into_iter()
        .map(|entry| match entry.count {
            Some(count) => json!({ "field": entry.value, "count": count }),
            None => json!({ "field": entry.value }),
        })
        .collect();
    let mut response = json!({ "results": results });
    if let Some(next) = next {
        response["next"] = json!(next_url(
            &state.config.url_prefix,
            "/fields",
            &params,
            &["pattern", "count", "limit"],
            &next,
        ));
    }
    Ok(Json(response).into_response())
}

pub(super) async fn list_tokens(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    let count = bool_param(&params, "count", false)?;
    let limit = limit_param(&params)?;
    let (results, next) = state.store.list_tokens(
        params.get("pattern").map(String::as_str),
        params.get("field").map(String::as_str),
        count,
        params.get("scroll").map(String::as_str),
        limit,
    )?;

    let results: Vec<_> = results
        .into_iter()
        .map(|entry| match entry.count {
            Some(count) => json!({ "token": entry.value, "count": count }),
            None => json!({ "token": entry.value }),
        })
        .collect();
    let mut response = json!({ "results": results });
    if let Some(next) = next {
        response["next"] = json!(next_url(
            &state.config.url_prefix,
            "/tokens",
            &params,
            &["pattern", "field", "count", "limit"],
            &next,
        ));
    }
    Ok(Json(response).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_component_encoding() {
        assert_eq!(encode_component("123,45"), "123%2C45");
        assert_eq!(encode_component("/data/run"), "%2Fdata%2Frun");
        assert_eq!(encode_component("plain-text_1.0~x"), "plain-text_1.0~x");
    }

    #[test]
    fn next_urls_keep_request_parameters() {
        let mut params = Params::new();
        params.insert("limit".into(), "5".into());
        params.insert("order".into(), "-time".into());
        params.insert("ignored".into(), "x".into());
        let url = next_url("", "/query", &params, &["limit", "order"], "99,1");
        assert!(url.starts_with("/query?scroll=99%2C1"));
        assert!(url.contains("&limit=5"));
        assert!(url.contains("&order=-time"));
        assert!(!url.contains("ignored"));
    }

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type_for(Path::new("/a/b.json")), "application/json");
        assert_eq!(content_type_for(Path::new("/a/b.HTML")), "text/html");
        assert_eq!(
            content_type_for(Path::new("/a/b.unknown")),
            "application/octet-stream"
        );
        assert_eq!(
            content_type_for(Path::new("/a/noext")),
            "application/octet-stream"
        );
    }
}
