//! Content-type-directed response handling
//!
//! A small set of strategies selected by normalized content type
//! (lowercase, parameters stripped), each producing a uniform output map:
//!
//! - **JSON** (`application/json`, `application/*+json`): parse the body;
//!   an object root is adopted as-is, anything else is wrapped as
//!   `{data: <value>}`.
//! - **Text** (`text/*`): `{content_type, data}`.
//! - **Binary** (everything else): hybrid storage - small bodies inline as
//!   base64, large bodies spill to a temp file under the scratch
//!   directory.
//!
//! JSON is both the registered default and the fallback when no content
//! type is present. Temp files are tracked per execution and deleted when
//! the run settles, on every termination path.

use std::path::PathBuf;
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::error::StepError;

// ============================================================================
// HANDLER SELECTION
// ============================================================================

/// Response handling strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseHandler {
    Json,
    Text,
    Binary,
}

impl ResponseHandler {
    /// Pick the first matching handler; JSON is the fallback.
    pub fn for_content_type(content_type: Option<&str>) -> Self {
        let Some(raw) = content_type else {
            return ResponseHandler::Json;
        };
        let normalized = normalize_content_type(raw);
        if normalized == "application/json"
            || (normalized.starts_with("application/") && normalized.ends_with("+json"))
        {
            ResponseHandler::Json
        } else if normalized.starts_with("text/") {
            ResponseHandler::Text
        } else {
            ResponseHandler::Binary
        }
    }

    /// Turn a response body into the uniform output map.
    pub fn handle(
        self,
        content_type: Option<&str>,
        body: &[u8],
        storage: &ResponseStorage,
    ) -> Result<Map<String, Value>, StepError> {
        match self {
            ResponseHandler::Json => handle_json(body),
            ResponseHandler::Text => Ok(handle_text(content_type, body)),
            ResponseHandler::Binary => storage.store(content_type, body),
        }
    }
}

/// Lowercase the media type and strip parameters (`; charset=...`).
pub fn normalize_content_type(raw: &str) -> String {
    raw.split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

fn handle_json(body: &[u8]) -> Result<Map<String, Value>, StepError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| StepError::ResponseInvalid(format!("invalid JSON body: {e}")))?;
    match value {
        Value::Object(map) => Ok(map),
        other => {
            let mut map = Map::new();
            map.insert("data".into(), other);
            Ok(map)
        }
    }
}

fn handle_text(content_type: Option<&str>, body: &[u8]) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(
        "content_type".into(),
        json!(content_type.map(normalize_content_type).unwrap_or_default()),
    );
    map.insert(
        "data".into(),
        json!(String::from_utf8_lossy(body).into_owned()),
    );
    map
}

// ============================================================================
// RESPONSE STORAGE
// ============================================================================

/// Hybrid in-memory-or-tempfile storage for binary bodies, owned by one
/// execution. Cleanup is guaranteed on any termination path because the
/// runner calls [`ResponseStorage::cleanup`] when the run settles.
#[derive(Debug)]
pub struct ResponseStorage {
    scratch_dir: PathBuf,
    inline_limit: usize,
    files: Mutex<Vec<PathBuf>>,
}

impl ResponseStorage {
    pub fn new(scratch_dir: PathBuf, inline_limit: usize) -> std::io::Result<Self> {
        std::fs::create_dir_all(&scratch_dir)?;
        Ok(Self {
            scratch_dir,
            inline_limit,
            files: Mutex::new(Vec::new()),
        })
    }

    /// Store a binary body: inline base64 below the limit, temp file with a
    /// random suffix otherwise.
    pub fn store(
        &self,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Result<Map<String, Value>, StepError> {
        let normalized = content_type.map(normalize_content_type).unwrap_or_default();
        let mut map = Map::new();
        map.insert("content_type".into(), json!(normalized));
        map.insert("size_bytes".into(), json!(body.len()));

        if body.len() < self.inline_limit {
            map.insert("encoding".into(), json!("base64"));
            map.insert("data".into(), json!(BASE64.encode(body)));
            return Ok(map);
        }

        let spill = || -> std::io::Result<std::path::PathBuf> {
            use std::io::Write;
            let mut file = tempfile::Builder::new()
                .prefix("resp-")
                .suffix(".bin")
                .tempfile_in(&self.scratch_dir)?;
            file.write_all(body)?;
            let (_, path) = file.keep()?;
            Ok(path)
        };
        let path = spill()
            .map_err(|e| StepError::ResponseInvalid(format!("binary spill failed: {e}")))?;
        debug!(path = %path.display(), size = body.len(), "spilled binary response");

        self.track(path.clone());
        map.insert("encoding".into(), json!("file"));
        map.insert("file_path".into(), json!(path.display().to_string()));
        Ok(map)
    }

    fn track(&self, path: PathBuf) {
        if let Ok(mut files) = self.files.lock() {
            files.push(path);
        }
    }

    /// Paths of files currently tracked (for tests and diagnostics).
    pub fn tracked_files(&self) -> Vec<PathBuf> {
        self.files.lock().map(|f| f.clone()).unwrap_or_default()
    }

    /// Delete every tracked file; returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let Ok(mut files) = self.files.lock() else {
            return 0;
        };
        let mut removed = 0;
        for path in files.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "temp file cleanup failed"),
            }
        }
        removed
    }
}

impl Drop for ResponseStorage {
    fn drop(&mut self) {
        // Last line of defense; the runner cleans up explicitly.
        self.cleanup();
    }
}

// ============================================================================
// TESTS
// ============================================================================
