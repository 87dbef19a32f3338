//! HTTP handlers for uploads.
//!
//! Both routes hand a byte stream of known length to `IngestService`:
//! multipart uploads are spooled to an anonymous temp file first (the part
//! length is only known once it has been read), raw uploads stream straight
//! through using their `Content-Length`.

use crate::{
    errors::AppError,
    models::upload::{UploadOptions, UploadResult},
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Query, State, multipart::Field},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use futures::StreamExt;
use serde::Deserialize;
use std::io::{self, SeekFrom};
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncSeekExt, AsyncWriteExt},
};
use tokio_util::{io::StreamReader, sync::CancellationToken};

/// Multipart field carrying the payload.
const FILE_FIELD: &str = "file";

/// Content type used when the client declares none.
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Header prefix for metadata on raw stream uploads, e.g. `x-ingest-meta-owner`.
const META_HEADER_PREFIX: &str = "x-ingest-meta-";

/// Query params accepted by the raw stream upload.
#[derive(Debug, Deserialize)]
pub struct StreamUploadQuery {
    pub filename: Option<String>,
}

struct SpooledPart {
    file: File,
    size: u64,
    filename: Option<String>,
    content_type: Option<String>,
}

/// `POST /api/v1/uploads` — multipart form with a `file` part; every other
/// text field becomes metadata (lowercased key, last value wins).
pub async fn upload_multipart(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut spooled: Option<SpooledPart> = None;
    let mut fields: Vec<(String, String)> = Vec::new();
    let mut field_budget = state.multipart_mem_bytes;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("invalid multipart form: {}", err)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == FILE_FIELD {
            let filename = field.file_name().map(str::to_string);
            let content_type = field.content_type().map(str::to_string);
            let (file, size) = spool_part(&mut field, state.max_upload_bytes).await?;
            spooled = Some(SpooledPart {
                file,
                size,
                filename,
                content_type,
            });
        } else if !name.is_empty() {
            let value = read_text_field(&mut field, &mut field_budget, state.multipart_mem_bytes)
                .await?;
            fields.push((name, value));
        }
    }

    let part = spooled.ok_or_else(|| AppError::bad_request("file field is required"))?;
    let mut options = UploadOptions::new(
        part.content_type
            .filter(|ct| !ct.is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.into()),
    );
    if let Some(filename) = part.filename {
        options = options.with_filename(filename);
    }
    for (key, value) in fields {
        options.insert_metadata(key, value);
    }

    let result = run_upload(&state, part.file, part.size, options).await?;
    Ok((StatusCode::ACCEPTED, Json(result)))
}

/// `POST /api/v1/uploads/stream?filename=...` — raw body of exactly
/// `Content-Length` bytes, streamed without spooling.
pub async fn upload_stream(
    State(state): State<AppState>,
    Query(query): Query<StreamUploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| {
            AppError::new(
                StatusCode::LENGTH_REQUIRED,
                "Content-Length header is required",
            )
        })?;
    if length > state.max_upload_bytes {
        return Err(AppError::payload_too_large(state.max_upload_bytes));
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_CONTENT_TYPE);
    let mut options = UploadOptions::new(content_type);
    if let Some(filename) = query.filename {
        options = options.with_filename(filename);
    }
    for (name, value) in headers.iter() {
        if let Some(key) = name.as_str().strip_prefix(META_HEADER_PREFIX) {
            if let Ok(value) = value.to_str() {
                options.insert_metadata(key, value);
            }
        }
    }

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));
    let reader = StreamReader::new(Box::pin(stream));

    let result = run_upload(&state, reader, length, options).await?;
    Ok((StatusCode::ACCEPTED, Json(result)))
}

/// Run one upload under the configured deadline.
async fn run_upload<R>(
    state: &AppState,
    reader: R,
    size: u64,
    options: UploadOptions,
) -> Result<UploadResult, AppError>
where
    R: AsyncRead + Send + Unpin,
{
    let cancel = CancellationToken::new();
    let deadline = tokio::spawn({
        let cancel = cancel.clone();
        let limit = state.upload_timeout;
        async move {
            tokio::time::sleep(limit).await;
            cancel.cancel();
        }
    });

    let outcome = state
        .ingest
        .process_upload(reader, size, options, &cancel)
        .await;
    deadline.abort();

    outcome.map_err(|err| {
        tracing::error!(error = %err, phase = %err.phase(), "upload failed");
        AppError::from(err)
    })
}

/// Read a text field into memory, charging its bytes to `budget`, which is
/// shared by every text field of the form. 413 once the budget is spent.
async fn read_text_field(
    field: &mut Field<'_>,
    budget: &mut u64,
    limit: u64,
) -> Result<String, AppError> {
    let mut value = Vec::new();
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|err| AppError::bad_request(format!("reading form field: {}", err)))?
    {
        let len = chunk.len() as u64;
        if len > *budget {
            return Err(AppError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("form fields exceed the {} byte limit", limit),
            ));
        }
        *budget -= len;
        value.extend_from_slice(&chunk);
    }
    String::from_utf8(value)
        .map_err(|_| AppError::bad_request("form field is not valid UTF-8"))
}

/// Copy a multipart part into an anonymous temp file, enforcing `limit`.
/// Returns the rewound file and the part length.
async fn spool_part(field: &mut Field<'_>, limit: u64) -> Result<(File, u64), AppError> {
    let spool_err = |err: io::Error| AppError::internal(format!("spooling upload: {}", err));

    let mut file = File::from_std(tempfile::tempfile().map_err(spool_err)?);
    let mut size: u64 = 0;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|err| AppError::bad_request(format!("reading file part: {}", err)))?
    {
        size += chunk.len() as u64;
        if size > limit {
            return Err(AppError::payload_too_large(limit));
        }
        file.write_all(&chunk).await.map_err(spool_err)?;
    }
    file.flush().await.map_err(spool_err)?;
    file.seek(SeekFrom::Start(0)).await.map_err(spool_err)?;

    Ok((file, size))
}
