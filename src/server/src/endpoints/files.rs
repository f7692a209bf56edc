use std::io;
use std::path::Path;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Multipart, Query, State, multipart::Field},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use common::staging::StagedFile;
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;

use crate::ServerState;

/// Create file management routes
pub fn router<S: ServerState>() -> Router<S> {
    Router::new()
        .route("/upload", post(upload_file::<S>))
        .route("/files", get(list_files::<S>).delete(delete_file::<S>))
        .route("/download", get(download_file::<S>))
}

#[derive(Debug, Deserialize)]
pub struct FileParam {
    file: String,
}

/// POST /upload
///
/// Accepts a multipart body; every file field is streamed into a staging file,
/// moved into the upload directory under its (sanitized) client filename, and
/// the staging file is released for reclamation.
#[tracing::instrument(skip(state, multipart))]
pub async fn upload_file<S: ServerState>(
    State(state): State<S>,
    mut multipart: Multipart,
) -> Response {
    let mut uploaded: Vec<String> = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return error_response(StatusCode::BAD_REQUEST, "Malformed multipart body", e);
            }
        };

        // Non-file form fields are ignored
        let Some(original_name) = field.file_name().map(str::to_owned) else {
            continue;
        };
        let Some(safe_name) = sanitize_file_name(&original_name) else {
            return error_response(StatusCode::BAD_REQUEST, "Invalid filename", &original_name);
        };

        let staged = match state.staging().allocate(Some(&original_name)).await {
            Ok(staged) => staged,
            Err(e) => {
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to stage upload",
                    e,
                );
            }
        };

        if let Err(e) = receive_into(&staged, field).await {
            staged.mark_releasable();
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to receive upload",
                e,
            );
        }

        let destination = state.upload_dir().join(&safe_name);
        let moved = async {
            tokio::fs::create_dir_all(state.upload_dir())
                .await
                .context("Failed to create upload directory")?;
            tokio::fs::rename(staged.path(), &destination)
                .await
                .with_context(|| format!("Failed to move upload to {}", destination.display()))
        }
        .await;
        // The staged file is done either way: moved on success, garbage on
        // failure. Release it so the next sweep reclaims whatever is left.
        staged.mark_releasable();

        if let Err(e) = moved {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to store upload", e);
        }

        tracing::info!(file = %safe_name, "Stored upload");
        uploaded.push(safe_name);
    }

    if uploaded.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "No file provided",
            "multipart body contained no file fields",
        );
    }

    (StatusCode::OK, Json(json!({ "uploaded": uploaded }))).into_response()
}

/// Stream one multipart field into the staged file.
async fn receive_into(staged: &StagedFile, mut field: Field<'_>) -> anyhow::Result<()> {
    let mut writer = staged
        .open_for_write()
        .await
        .context("Failed to open staging stream")?;
    while let Some(chunk) = field
        .chunk()
        .await
        .context("Failed to read multipart chunk")?
    {
        writer
            .write_all(&chunk)
            .await
            .context("Failed to write staging file")?;
    }
    writer.close().await;
    Ok(())
}

/// GET /download?file=<name>
///
/// Serves a stored file as an attachment with a MIME type derived from its
/// extension.
#[tracing::instrument(skip(state))]
pub async fn download_file<S: ServerState>(
    State(state): State<S>,
    Query(params): Query<FileParam>,
) -> Response {
    let Some(name) = sanitize_file_name(&params.file) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid filename", &params.file);
    };

    let path = state.upload_dir().join(&name);
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, mime_type_for(&name).to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{name}\""),
                ),
                (header::CACHE_CONTROL, String::from("no-cache")),
            ],
            bytes,
        )
            .into_response(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            error_response(StatusCode::NOT_FOUND, "File not found", name)
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read file", e),
    }
}

/// GET /files
///
/// List stored filenames.
#[tracing::instrument(skip(state))]
pub async fn list_files<S: ServerState>(State(state): State<S>) -> Response {
    let mut entries = match tokio::fs::read_dir(state.upload_dir()).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            // Nothing uploaded yet
            return (StatusCode::OK, Json(json!({ "files": [] }))).into_response();
        }
        Err(e) => {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list files", e);
        }
    };

    let mut files = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let is_file = entry
                    .file_type()
                    .await
                    .map(|kind| kind.is_file())
                    .unwrap_or(false);
                if is_file {
                    files.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
            Ok(None) => break,
            Err(e) => {
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to list files",
                    e,
                );
            }
        }
    }
    files.sort();

    (StatusCode::OK, Json(json!({ "files": files }))).into_response()
}

/// DELETE /files?file=<name>
///
/// Delete a stored file.
#[tracing::instrument(skip(state))]
pub async fn delete_file<S: ServerState>(
    State(state): State<S>,
    Query(params): Query<FileParam>,
) -> Response {
    let Some(name) = sanitize_file_name(&params.file) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid filename", &params.file);
    };

    let path = state.upload_dir().join(&name);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {
            tracing::info!(file = %name, "Deleted stored file");
            (StatusCode::OK, Json(json!({ "deleted": name }))).into_response()
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            error_response(StatusCode::NOT_FOUND, "File not found", name)
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to delete file", e),
    }
}

fn error_response(status: StatusCode, error: &str, message: impl std::fmt::Display) -> Response {
    (
        status,
        Json(json!({
            "error": error,
            "message": message.to_string()
        })),
    )
        .into_response()
}

/// Strip any directory components from a client-supplied filename.
///
/// Returns None when the input does not resolve to a plain file name (empty,
/// `.`, `..`, bare separators).
fn sanitize_file_name(raw: &str) -> Option<String> {
    let name = Path::new(raw).file_name()?.to_str()?;
    if name.is_empty() {
        return None;
    }
    Some(name.to_string())
}

/// MIME type used when serving a stored file, derived from its extension.
fn mime_type_for(name: &str) -> &'static str {
    let lower = name.to_ascii_lowercase();
    match lower.rsplit_once('.').map(|(_, ext)| ext) {
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        Some("html") | Some("htm") => "text/html",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("doc") | Some("docx") => "application/msword",
        Some("xls") | Some("xlsx") => "application/vnd.ms-excel",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}
