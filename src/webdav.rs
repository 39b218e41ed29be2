use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::{HeaderMap, Method};
use axum::response::Response;
use futures::stream::Stream;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::cache::CacheWriter;
use crate::channels::Channel;
use crate::vfs::{self, FileStat, Resolved};
use crate::AppState;

/// Characters escaped inside a single path segment of an href.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`');

pub async fn dav_root_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    dispatch(state, method, headers, String::new()).await
}

pub async fn dav_handler(
    UrlPath(path): UrlPath<String>,
    State(state): State<Arc<AppState>>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    dispatch(state, method, headers, path).await
}

async fn dispatch(
    state: Arc<AppState>,
    method: Method,
    headers: HeaderMap,
    path: String,
) -> Response {
    debug!("WebDAV request: method={} path=\"/{}\"", method, path);

    if method == Method::OPTIONS {
        return Response::builder()
            .status(200)
            .header("Allow", "OPTIONS, GET, HEAD, PROPFIND")
            .header("DAV", "1")
            .body(Body::empty())
            .unwrap();
    }

    let catalogue = state.catalogue().await;
    let resolved = vfs::resolve(&catalogue, &path);

    match method.as_str() {
        "PROPFIND" => match resolved {
            Some(resolved) => propfind(&state, &catalogue, &path, resolved, &headers).await,
            None => not_found(),
        },
        "GET" | "HEAD" => match resolved {
            Some(Resolved::Dir(entries)) => {
                if method == Method::HEAD {
                    Response::builder()
                        .status(200)
                        .header("Content-Type", "text/html; charset=utf-8")
                        .body(Body::empty())
                        .unwrap()
                } else {
                    dir_listing(&path, &entries)
                }
            }
            Some(Resolved::File(channel)) => {
                serve_file(&state, channel, &headers, method == Method::HEAD).await
            }
            None => not_found(),
        },
        _ => Response::builder()
            .status(405)
            .header("Allow", "OPTIONS, GET, HEAD, PROPFIND")
            .body(Body::from("Method not allowed"))
            .unwrap(),
    }
}

fn not_found() -> Response {
    Response::builder()
        .status(404)
        .body(Body::from("Not found"))
        .unwrap()
}

fn href_for(path: &str, is_dir: bool) -> String {
    let mut href = String::from("/dav");
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        href.push('/');
        href.push_str(&utf8_percent_encode(segment, SEGMENT).to_string());
    }
    if is_dir {
        href.push('/');
    }
    href
}

fn display_name(path: &str) -> String {
    path.rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("dav")
        .to_string()
}

// Multistatus document, serialised with quick-xml.

#[derive(Serialize)]
#[serde(rename = "D:multistatus")]
struct Multistatus {
    #[serde(rename = "@xmlns:D")]
    xmlns: &'static str,
    #[serde(rename = "D:response")]
    responses: Vec<DavResponse>,
}

#[derive(Serialize)]
struct DavResponse {
    #[serde(rename = "D:href")]
    href: String,
    #[serde(rename = "D:propstat")]
    propstat: PropStat,
}

#[derive(Serialize)]
struct PropStat {
    #[serde(rename = "D:prop")]
    prop: Prop,
    #[serde(rename = "D:status")]
    status: &'static str,
}

#[derive(Serialize)]
struct Prop {
    #[serde(rename = "D:displayname")]
    displayname: String,
    #[serde(rename = "D:resourcetype")]
    resourcetype: ResourceType,
    #[serde(rename = "D:getcontentlength", skip_serializing_if = "Option::is_none")]
    getcontentlength: Option<u64>,
    #[serde(rename = "D:getlastmodified", skip_serializing_if = "Option::is_none")]
    getlastmodified: Option<String>,
    #[serde(rename = "D:getcontenttype", skip_serializing_if = "Option::is_none")]
    getcontenttype: Option<String>,
}

#[derive(Serialize)]
struct ResourceType {
    #[serde(rename = "D:collection", skip_serializing_if = "Option::is_none")]
    collection: Option<CollectionMarker>,
}

#[derive(Serialize)]
struct CollectionMarker {}

fn http_date(t: chrono::DateTime<chrono::Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn dir_response(path: &str) -> DavResponse {
    DavResponse {
        href: href_for(path, true),
        propstat: PropStat {
            prop: Prop {
                displayname: display_name(path),
                resourcetype: ResourceType {
                    collection: Some(CollectionMarker {}),
                },
                getcontentlength: None,
                getlastmodified: None,
                getcontenttype: None,
            },
            status: "HTTP/1.1 200 OK",
        },
    }
}

fn file_response(path: &str, stat: &FileStat) -> DavResponse {
    DavResponse {
        href: href_for(path, false),
        propstat: PropStat {
            prop: Prop {
                displayname: display_name(path),
                resourcetype: ResourceType { collection: None },
                // Unknown sizes are reported as 0; such files also refuse
                // Range requests.
                getcontentlength: Some(stat.size.unwrap_or(0)),
                getlastmodified: Some(http_date(stat.mtime)),
                getcontenttype: Some(stat.content_type.clone()),
            },
            status: "HTTP/1.1 200 OK",
        },
    }
}

async fn propfind(
    state: &Arc<AppState>,
    catalogue: &crate::channels::Catalogue,
    path: &str,
    resolved: Resolved<'_>,
    headers: &HeaderMap,
) -> Response {
    let depth = headers
        .get("Depth")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("1");
    if depth != "0" && depth != "1" {
        return Response::builder()
            .status(403)
            .body(Body::from("Depth infinity is not supported"))
            .unwrap();
    }

    let mut responses = Vec::new();

    match resolved {
        Resolved::Dir(entries) => {
            responses.push(dir_response(path));
            if depth == "1" {
                for entry in entries {
                    let child_path = if path.is_empty() {
                        entry.name.clone()
                    } else {
                        format!("{}/{}", path, entry.name)
                    };
                    if entry.is_dir {
                        responses.push(dir_response(&child_path));
                    } else if let Some(Resolved::File(channel)) =
                        vfs::resolve(catalogue, &child_path)
                    {
                        let stat = vfs::stat(channel, &state.cache, &state.client).await;
                        responses.push(file_response(&child_path, &stat));
                    }
                }
            }
        }
        Resolved::File(channel) => {
            let stat = vfs::stat(channel, &state.cache, &state.client).await;
            responses.push(file_response(path, &stat));
        }
    }

    let doc = Multistatus {
        xmlns: "DAV:",
        responses,
    };
    let xml = match quick_xml::se::to_string(&doc) {
        Ok(xml) => format!("<?xml version=\"1.0\" encoding=\"utf-8\"?>{xml}"),
        Err(e) => {
            warn!("PROPFIND serialisation failed: {}", e);
            return Response::builder()
                .status(500)
                .body(Body::from("Internal error"))
                .unwrap();
        }
    };

    Response::builder()
        .status(207)
        .header("Content-Type", "application/xml; charset=\"utf-8\"")
        .body(Body::from(xml))
        .unwrap()
}

/// Plain HTML listing for browsers poking at the tree, in addition to the
/// PROPFIND surface DAV clients use.
fn dir_listing(path: &str, entries: &[vfs::DirEntry]) -> Response {
    let mut html = String::from("<!DOCTYPE html>\n<html><head><title>tvgate</title></head><body>\n");
    html.push_str(&format!("<h1>/{}</h1>\n<ul>\n", path));
    for entry in entries {
        let child_path = if path.is_empty() {
            entry.name.clone()
        } else {
            format!("{}/{}", path, entry.name)
        };
        html.push_str(&format!(
            "<li><a href=\"{}\">{}{}</a></li>\n",
            href_for(&child_path, entry.is_dir),
            entry.name,
            if entry.is_dir { "/" } else { "" }
        ));
    }
    html.push_str("</ul>\n</body></html>\n");

    Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(Body::from(html))
        .unwrap()
}

/// Byte range of a Range header against a known total size. Suffix ranges
/// (`bytes=-n`) ask for a negative-offset seek and are refused.
fn parse_range(raw: &str, total: u64) -> Option<(u64, u64)> {
    let spec = raw.trim().strip_prefix("bytes=")?;
    let (start_str, end_str) = spec.split_once('-')?;
    if start_str.is_empty() {
        return None;
    }
    let start = start_str.parse::<u64>().ok()?;
    let end = if end_str.is_empty() {
        total.checked_sub(1)?
    } else {
        end_str.parse::<u64>().ok()?.min(total.saturating_sub(1))
    };
    if start > end || start >= total {
        return None;
    }
    Some((start, end))
}

async fn serve_file(
    state: &Arc<AppState>,
    channel: &Channel,
    headers: &HeaderMap,
    head_only: bool,
) -> Response {
    let stat = vfs::stat(channel, &state.cache, &state.client).await;
    let range = headers
        .get(axum::http::header::RANGE)
        .and_then(|v| v.to_str().ok());

    info!(
        "WebDAV file request: channel={} size={:?} range={:?} head={}",
        channel.id, stat.size, range, head_only
    );

    if head_only {
        let mut builder = Response::builder()
            .status(200)
            .header("Content-Type", stat.content_type.clone())
            .header("Last-Modified", http_date(stat.mtime))
            .header(
                "Accept-Ranges",
                if stat.size.is_some() { "bytes" } else { "none" },
            );
        if let Some(size) = stat.size {
            builder = builder.header("Content-Length", size.to_string());
        }
        return builder.body(Body::empty()).unwrap();
    }

    if let Some(raw) = range {
        // Ranged reads only work against a known size.
        let Some(total) = stat.size else {
            return Response::builder()
                .status(416)
                .header("Content-Range", "bytes */*")
                .body(Body::empty())
                .unwrap();
        };
        let Some((start, end)) = parse_range(raw, total) else {
            return Response::builder()
                .status(416)
                .header("Content-Range", format!("bytes */{total}"))
                .body(Body::empty())
                .unwrap();
        };
        return serve_range(state, channel, &stat, start, end, total).await;
    }

    serve_full(state, channel, &stat).await
}

async fn serve_range(
    state: &Arc<AppState>,
    channel: &Channel,
    stat: &FileStat,
    start: u64,
    end: u64,
    total: u64,
) -> Response {
    // A complete cached blob serves ranges locally.
    if let Some((entry, path)) = state.cache.open_blob(&channel.url).await {
        match tokio::fs::File::open(&path).await {
            Ok(mut file) => {
                let end = end.min(entry.stored_size.saturating_sub(1));
                if file.seek(io::SeekFrom::Start(start)).await.is_ok() {
                    let len = end - start + 1;
                    let reader = file.take(len);
                    return Response::builder()
                        .status(206)
                        .header("Content-Type", stat.content_type.clone())
                        .header("Content-Length", len.to_string())
                        .header("Content-Range", format!("bytes {start}-{end}/{total}"))
                        .header("Accept-Ranges", "bytes")
                        .body(Body::from_stream(ReaderStream::new(reader)))
                        .unwrap();
                }
            }
            Err(e) => warn!("Cached blob unreadable for {}: {}", channel.id, e),
        }
    }

    // Forward the range upstream. Partial content must not poison the
    // cache, so no tee here; instead kick off a background population for
    // future reads.
    let background = state.cache.clone();
    let url = channel.url.clone();
    tokio::spawn(async move {
        let _ = background.start_caching(&url).await;
    });

    let request = state
        .client
        .get(&channel.url)
        .header(reqwest::header::RANGE, format!("bytes={start}-{end}"));
    let response = match request.send().await {
        Ok(r) if r.status().is_success() => r,
        Ok(r) => {
            warn!("Upstream range request failed: {} {}", channel.id, r.status());
            return bad_gateway();
        }
        Err(e) => {
            warn!("Upstream range request failed: {} {}", channel.id, e);
            return bad_gateway();
        }
    };

    let status = if response.status() == reqwest::StatusCode::PARTIAL_CONTENT {
        206
    } else {
        // Origin ignored the range; relay the whole body.
        200
    };
    let mut builder = Response::builder()
        .status(status)
        .header("Content-Type", stat.content_type.clone())
        .header("Accept-Ranges", "bytes");
    if status == 206 {
        builder = builder
            .header("Content-Length", (end - start + 1).to_string())
            .header("Content-Range", format!("bytes {start}-{end}/{total}"));
    }
    builder
        .body(Body::from_stream(upstream_stream(response, None)))
        .unwrap()
}

async fn serve_full(state: &Arc<AppState>, channel: &Channel, stat: &FileStat) -> Response {
    // Complete cache blob: serve the file directly.
    if let Some((entry, path)) = state.cache.open_blob(&channel.url).await {
        match tokio::fs::File::open(&path).await {
            Ok(file) => {
                debug!("Serving {} from cache blob", channel.id);
                return Response::builder()
                    .header("Content-Type", stat.content_type.clone())
                    .header("Content-Length", entry.stored_size.to_string())
                    .header("Last-Modified", http_date(stat.mtime))
                    .body(Body::from_stream(ReaderStream::new(file)))
                    .unwrap();
            }
            Err(e) => warn!("Cached blob unreadable for {}: {}", channel.id, e),
        }
    }

    // Stream from upstream, teeing the first chunk of the object into the
    // cache while the client is served.
    let response = match state.client.get(&channel.url).send().await {
        Ok(r) if r.status().is_success() => r,
        Ok(r) => {
            warn!("Upstream fetch failed: {} {}", channel.id, r.status());
            return bad_gateway();
        }
        Err(e) => {
            warn!("Upstream fetch failed: {} {}", channel.id, e);
            return bad_gateway();
        }
    };

    let content_length = response.content_length();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| stat.content_type.clone());
    let last_modified = response
        .headers()
        .get(reqwest::header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| chrono::DateTime::parse_from_rfc2822(v).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc));
    let etag = response
        .headers()
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    state
        .cache
        .record_remote_metadata(
            &channel.url,
            content_length,
            last_modified,
            etag.clone(),
            Some(content_type.clone()),
        )
        .await;

    let writer = state
        .cache
        .begin_tee(
            &channel.url,
            content_length,
            last_modified,
            etag,
            Some(content_type.clone()),
        )
        .await;

    let mut builder = Response::builder().header("Content-Type", content_type);
    if let Some(len) = content_length {
        builder = builder.header("Content-Length", len.to_string());
    }
    builder
        .body(Body::from_stream(upstream_stream(response, writer)))
        .unwrap()
}

fn bad_gateway() -> Response {
    Response::builder()
        .status(502)
        .body(Body::from("Upstream failed"))
        .unwrap()
}

struct UpstreamTee {
    response: reqwest::Response,
    writer: Option<CacheWriter>,
    done: bool,
}

/// Relays the upstream body, copying bytes into the cache writer on the
/// side. Dropping the stream mid-flight (client hung up) drops the writer,
/// which releases its in-flight slot without caching anything.
fn upstream_stream(
    response: reqwest::Response,
    writer: Option<CacheWriter>,
) -> impl Stream<Item = Result<bytes::Bytes, io::Error>> + Send {
    futures::stream::unfold(
        UpstreamTee {
            response,
            writer,
            done: false,
        },
        |mut tee| async move {
            if tee.done {
                return None;
            }
            match tee.response.chunk().await {
                Ok(Some(chunk)) => {
                    if let Some(writer) = tee.writer.as_mut() {
                        writer.write(&chunk);
                    }
                    Some((Ok(chunk), tee))
                }
                Ok(None) => {
                    if let Some(writer) = tee.writer.take() {
                        writer.finish(true).await;
                    }
                    None
                }
                Err(e) => {
                    if let Some(writer) = tee.writer.take() {
                        writer.finish(false).await;
                    }
                    tee.done = true;
                    Some((Err(io::Error::other(e)), tee))
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("bytes=0-99", 1000), Some((0, 99)));
        assert_eq!(parse_range("bytes=500-", 1000), Some((500, 999)));
        // End clamps to the object size.
        assert_eq!(parse_range("bytes=900-5000", 1000), Some((900, 999)));
        // Suffix ranges are negative-offset seeks and refused.
        assert_eq!(parse_range("bytes=-500", 1000), None);
        // Out of bounds or inverted.
        assert_eq!(parse_range("bytes=1000-1001", 1000), None);
        assert_eq!(parse_range("bytes=9-3", 1000), None);
        assert_eq!(parse_range("chunks=0-1", 1000), None);
    }

    #[test]
    fn test_href_encoding() {
        assert_eq!(
            href_for("abcd/On Demand/Movies", true),
            "/dav/abcd/On%20Demand/Movies/"
        );
        assert_eq!(href_for("", true), "/dav/");
    }

    #[test]
    fn test_multistatus_xml_shape() {
        use chrono::TimeZone;

        let doc = Multistatus {
            xmlns: "DAV:",
            responses: vec![
                dir_response("abcd/On Demand"),
                file_response(
                    "abcd/On Demand/Movies/Individual/Film.mp4",
                    &FileStat {
                        size: Some(1234),
                        mtime: chrono::Utc
                            .with_ymd_and_hms(2021, 2, 2, 0, 0, 0)
                            .single()
                            .unwrap(),
                        content_type: "video/mp4".into(),
                    },
                ),
            ],
        };
        let xml = quick_xml::se::to_string(&doc).unwrap();

        assert!(xml.contains("<D:multistatus xmlns:D=\"DAV:\">"));
        assert!(xml.contains("<D:href>/dav/abcd/On%20Demand/</D:href>"));
        assert!(xml.contains("<D:collection"));
        assert!(xml.contains("<D:getcontentlength>1234</D:getcontentlength>"));
        assert!(
            xml.contains("<D:getlastmodified>Tue, 02 Feb 2021 00:00:00 GMT</D:getlastmodified>")
        );
        assert!(xml.contains("<D:status>HTTP/1.1 200 OK</D:status>"));
    }
}
