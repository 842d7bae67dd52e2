//! Turns an incoming request into the [`RequestContext`] every action and template sees.

use axum::body::Bytes;
use axum::extract::{ConnectInfo, FromRequest, FromRequestParts, Multipart, Path, Request};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
use axum::http::{HeaderMap, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::DispatchError;
use crate::filetype;
use crate::rules::Args;

pub const UPLOAD_PREFIX: &str = "httpe_upload_";

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Meta {
    pub method: String,
    #[serde(rename = "URL")]
    pub url: String,
    pub remote_addr: String,
    pub user_agent: String,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Upload {
    pub field_name: String,
    #[serde(rename = "FileName")]
    pub original_name: String,
    pub size: u64,
    #[serde(rename = "Type")]
    pub sniffed_type: String,
    #[serde(rename = "Stored")]
    pub stored_path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Input {
    pub form: HashMap<String, String>,
    #[serde(rename = "JSON")]
    pub json: Value,
    #[serde(rename = "Params")]
    pub query_params: HashMap<String, String>,
    #[serde(rename = "URLPlaceholders")]
    pub path_variables: HashMap<String, String>,
    pub uploads: Vec<Upload>,
}

/// Everything known about one request. Cloning is cheap enough to hand a copy to a
/// post action; stored uploads are removed once the last clone is dropped.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub meta: Meta,
    pub input: Input,
    stored_uploads: Arc<Vec<TempPath>>,
}

impl RequestContext {
    pub fn new(meta: Meta, input: Input) -> Self {
        Self {
            meta,
            input,
            stored_uploads: Arc::default(),
        }
    }
}

/// `x-my-header` -> `X-My-Header`
fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            out.insert(canonical_header_name(name.as_str()), value.to_string());
        }
    }
    out
}

/// Query parameters; only the first value of a repeated key is kept.
pub fn query_params(query: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    if let Some(query) = query {
        for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
            params.entry(k.into_owned()).or_insert_with(|| v.into_owned());
        }
    }
    params
}

fn mime_essence(headers: &HeaderMap) -> String {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default()
}

fn body_error(status: StatusCode, what: &str, detail: impl std::fmt::Display, limit: u64) -> DispatchError {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        DispatchError::EntityTooLarge { observed: None, limit }
    } else {
        DispatchError::BadRequest(format!("error parsing {}: {}", what, detail))
    }
}

/// Builds the request context. `body_limit` is only used to describe oversized
/// streamed bodies.
pub async fn extract(req: Request, args: &Args, body_limit: u64) -> Result<RequestContext, DispatchError> {
    let (mut parts, body) = req.into_parts();

    let raw_url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());
    let url = urlencoding::decode(&raw_url)
        .map(|u| u.into_owned())
        .unwrap_or(raw_url);
    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();
    let meta = Meta {
        method: parts.method.to_string(),
        url,
        remote_addr,
        user_agent: parts
            .headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
        headers: header_map(&parts.headers),
    };

    let mut input = Input {
        query_params: query_params(parts.uri.query()),
        path_variables: Path::<HashMap<String, String>>::from_request_parts(&mut parts, &())
            .await
            .map(|Path(vars)| vars)
            .unwrap_or_default(),
        ..Default::default()
    };

    if parts.headers.get(CONTENT_LENGTH).is_some_and(|v| v == "0") {
        return Ok(RequestContext::new(meta, input));
    }

    let content_type = mime_essence(&parts.headers);
    let req = Request::from_parts(parts, body);
    let mut stored = Vec::new();

    match content_type.as_str() {
        "application/json" => {
            let bytes = Bytes::from_request(req, &())
                .await
                .map_err(|e| body_error(e.status(), "json-data", e.body_text(), body_limit))?;
            if !bytes.is_empty() {
                input.json = serde_json::from_slice(&bytes)
                    .map_err(|e| DispatchError::BadRequest(format!("error parsing json-data: {}", e)))?;
            }
        }
        "multipart/form-data" => {
            let mut multipart = Multipart::from_request(req, &())
                .await
                .map_err(|e| body_error(e.status(), "multipart/form-data", e.body_text(), body_limit))?;
            read_multipart(&mut multipart, args.enable_file_uploads, body_limit, &mut input, &mut stored).await?;
        }
        _ => {
            let bytes = Bytes::from_request(req, &())
                .await
                .map_err(|e| body_error(e.status(), "form-data", e.body_text(), body_limit))?;
            // the last value of a repeated field wins
            for (k, v) in url::form_urlencoded::parse(&bytes) {
                input.form.insert(k.into_owned(), v.into_owned());
            }
        }
    }

    Ok(RequestContext {
        meta,
        input,
        stored_uploads: Arc::new(stored),
    })
}

async fn read_multipart(
    multipart: &mut Multipart,
    keep_files: bool,
    body_limit: u64,
    input: &mut Input,
    stored: &mut Vec<TempPath>,
) -> Result<(), DispatchError> {
    let field_error = |e: axum::extract::multipart::MultipartError| {
        body_error(e.status(), "multipart/form-data", e.body_text(), body_limit)
    };

    while let Some(mut field) = multipart.next_field().await.map_err(field_error)? {
        let name = field.name().unwrap_or_default().to_string();
        let Some(file_name) = field.file_name().map(str::to_string) else {
            let value = field.text().await.map_err(field_error)?;
            input.form.insert(name, value);
            continue;
        };

        if !keep_files {
            while field.chunk().await.map_err(field_error)?.is_some() {}
            debug!(field = %name, "file uploads disabled, discarding '{}'", file_name);
            continue;
        }

        let (file, path) = tempfile::Builder::new()
            .prefix(UPLOAD_PREFIX)
            .tempfile()
            .map_err(|e| DispatchError::Internal(anyhow::anyhow!("error creating temp file for upload: {}", e)))?
            .into_parts();
        let mut file = tokio::fs::File::from_std(file);
        let mut size: u64 = 0;
        while let Some(chunk) = field.chunk().await.map_err(field_error)? {
            file.write_all(&chunk)
                .await
                .map_err(|e| DispatchError::Internal(anyhow::anyhow!("error copying upload to destination: {}", e)))?;
            size += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| DispatchError::Internal(anyhow::anyhow!("error copying upload to destination: {}", e)))?;
        drop(file);

        let sniffed_type = filetype::detect(&path)
            .await
            .map_err(|e| DispatchError::Internal(e.context("error getting file type")))?;
        debug!(field = %name, size, "stored upload '{}' as {}", file_name, path.display());
        input.uploads.push(Upload {
            field_name: name,
            original_name: file_name,
            size,
            sniffed_type,
            stored_path: path.to_path_buf(),
        });
        stored.push(path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(builder: axum::http::request::Builder, body: impl Into<Body>) -> Request {
        builder.body(body.into()).unwrap()
    }

    #[test]
    fn test_canonical_header_name() {
        assert_eq!(canonical_header_name("x-my-header"), "X-My-Header");
        assert_eq!(canonical_header_name("user-agent"), "User-Agent");
        assert_eq!(canonical_header_name("dnt"), "Dnt");
    }

    #[test]
    fn test_query_params_keep_first_value() {
        let params = query_params(Some("a=1&b=two%20words&a=2"));
        assert_eq!(params.get("a").map(String::as_str), Some("1"));
        assert_eq!(params.get("b").map(String::as_str), Some("two words"));
        assert!(query_params(None).is_empty());
    }

    #[tokio::test]
    async fn test_extract_meta_and_query() {
        let req = request(
            Request::builder()
                .method("GET")
                .uri("/some/path?x=1&x=2")
                .header("user-agent", "test-agent")
                .header("x-my-header", "gotest"),
            Body::empty(),
        );
        let ctx = extract(req, &Args::default(), 1024).await.unwrap();
        assert_eq!(ctx.meta.method, "GET");
        assert_eq!(ctx.meta.url, "/some/path?x=1&x=2");
        assert_eq!(ctx.meta.user_agent, "test-agent");
        assert_eq!(ctx.meta.headers.get("X-My-Header").map(String::as_str), Some("gotest"));
        assert_eq!(ctx.input.query_params.get("x").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_extract_json() {
        let req = request(
            Request::builder()
                .method("POST")
                .uri("/")
                .header("content-type", "application/json; charset=utf-8"),
            r#"{"nested": {"key": "value"}}"#,
        );
        let ctx = extract(req, &Args::default(), 1024).await.unwrap();
        assert_eq!(ctx.input.json["nested"]["key"], "value");
    }

    #[tokio::test]
    async fn test_extract_malformed_json_is_bad_request() {
        let req = request(
            Request::builder()
                .method("POST")
                .uri("/")
                .header("content-type", "application/json"),
            "{not json",
        );
        let err = extract(req, &Args::default(), 1024).await.unwrap_err();
        match err {
            DispatchError::BadRequest(msg) => assert!(msg.starts_with("error parsing json-data")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_extract_urlencoded_last_value_wins() {
        let req = request(
            Request::builder()
                .method("POST")
                .uri("/")
                .header("content-type", "application/x-www-form-urlencoded"),
            "name=first&name=second&other=x",
        );
        let ctx = extract(req, &Args::default(), 1024).await.unwrap();
        assert_eq!(ctx.input.form.get("name").map(String::as_str), Some("second"));
        assert_eq!(ctx.input.form.get("other").map(String::as_str), Some("x"));
    }

    #[tokio::test]
    async fn test_zero_content_length_skips_body() {
        let req = request(
            Request::builder()
                .method("POST")
                .uri("/")
                .header("content-type", "application/json")
                .header("content-length", "0"),
            Body::empty(),
        );
        let ctx = extract(req, &Args::default(), 1024).await.unwrap();
        assert!(ctx.input.json.is_null());
        assert!(ctx.input.form.is_empty());
    }

    const BOUNDARY: &str = "XBOUNDARYX";

    fn multipart_body() -> String {
        format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nhello\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"doc\"; filename=\"notes.txt\"\r\n\
             Content-Type: text/plain\r\n\r\nsome notes\r\n--{b}--\r\n",
            b = BOUNDARY
        )
    }

    fn multipart_request() -> Request {
        request(
            Request::builder()
                .method("POST")
                .uri("/upload")
                .header("content-type", format!("multipart/form-data; boundary={}", BOUNDARY)),
            multipart_body(),
        )
    }

    #[tokio::test]
    async fn test_multipart_with_uploads() {
        let args = Args {
            enable_file_uploads: true,
            ..Default::default()
        };
        let ctx = extract(multipart_request(), &args, 1 << 20).await.unwrap();
        assert_eq!(ctx.input.form.get("title").map(String::as_str), Some("hello"));
        assert_eq!(ctx.input.uploads.len(), 1);
        let upload = &ctx.input.uploads[0];
        assert_eq!(upload.field_name, "doc");
        assert_eq!(upload.original_name, "notes.txt");
        assert_eq!(upload.size, 10);
        assert_eq!(upload.sniffed_type, "text/UTF-8");
        let stored = upload.stored_path.clone();
        assert_eq!(std::fs::read_to_string(&stored).unwrap(), "some notes");

        let copy = ctx.clone();
        drop(ctx);
        assert!(stored.exists());
        drop(copy);
        assert!(!stored.exists());
    }

    #[tokio::test]
    async fn test_multipart_without_uploads_discards_files() {
        let ctx = extract(multipart_request(), &Args::default(), 1 << 20).await.unwrap();
        assert_eq!(ctx.input.form.get("title").map(String::as_str), Some("hello"));
        assert!(ctx.input.uploads.is_empty());
    }
}
