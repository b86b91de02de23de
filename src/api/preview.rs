//! HTTP preview reverse proxy: forwards requests for a drone's published
//! port to `127.0.0.1:<mappedHostPort>`, preserving method, headers (minus
//! Host), bodies, and WebSocket upgrades.

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};

use super::AppState;
use super::error::ApiError;
use crate::error::HubError;

/// `ANY /api/drones/{id}/preview/{port}/{*path}`
pub(super) async fn preview_handler(
    State(state): State<AppState>,
    Path((id, container_port, path)): Path<(String, u16, String)>,
    request: Request,
) -> Result<Response, ApiError> {
    let drone = state.hub.drone(&id).await?;

    let ports = state.hub.engine().ports(&drone.name).await?;
    let host_port = ports
        .iter()
        .find(|p| p.container_port == container_port)
        .map(|p| p.host_port)
        .ok_or_else(|| {
            HubError::not_found(format!("published port {container_port} on drone {id}"))
        })?;

    let target = build_target_uri(host_port, &path, request.uri())?;
    proxy(target, request).await
}

fn build_target_uri(host_port: u16, path: &str, original: &Uri) -> Result<Uri, ApiError> {
    let query = original
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let uri = format!("http://127.0.0.1:{host_port}/{path}{query}");
    uri.parse().map_err(|e| {
        ApiError(HubError::Internal(anyhow::anyhow!(
            "building preview target uri: {e}"
        )))
    })
}

/// Hop-by-hop headers are not forwarded (the upgrade pair is, to keep
/// WebSocket handshakes intact).
fn copy_headers(src: &HeaderMap, dst: &mut HeaderMap) {
    for (name, value) in src {
        if name == header::HOST
            || name == header::CONTENT_LENGTH
            || name == header::TRANSFER_ENCODING
        {
            continue;
        }
        dst.append(name.clone(), value.clone());
    }
}

async fn proxy(target: Uri, mut request: Request) -> Result<Response, ApiError> {
    // Taken before forwarding: hyper strips it from the forwarded parts.
    let client_upgrade = request.extensions_mut().remove::<hyper::upgrade::OnUpgrade>();

    let (parts, body) = request.into_parts();
    let mut outbound = axum::http::Request::builder()
        .method(parts.method.clone())
        .uri(target)
        .body(body)
        .map_err(|e| {
            ApiError(HubError::Internal(anyhow::anyhow!(
                "building preview request: {e}"
            )))
        })?;
    copy_headers(&parts.headers, outbound.headers_mut());

    let client: Client<HttpConnector, Body> =
        Client::builder(TokioExecutor::new()).build_http();
    let mut upstream = client.request(outbound).await.map_err(|e| {
        ApiError(HubError::UpstreamHttp {
            status: 0,
            body: format!("preview target unreachable: {e}"),
        })
    })?;

    if upstream.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(client_upgrade) = client_upgrade {
            let upstream_upgrade = hyper::upgrade::on(&mut upstream);
            tokio::spawn(async move {
                let client_io = match client_upgrade.await {
                    Ok(io) => io,
                    Err(e) => {
                        tracing::debug!(error = %e, "preview client upgrade failed");
                        return;
                    }
                };
                let upstream_io = match upstream_upgrade.await {
                    Ok(io) => io,
                    Err(e) => {
                        tracing::debug!(error = %e, "preview upstream upgrade failed");
                        return;
                    }
                };
                let mut client_io = TokioIo::new(client_io);
                let mut upstream_io = TokioIo::new(upstream_io);
                if let Err(e) =
                    tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await
                {
                    tracing::debug!(error = %e, "preview tunnel closed with error");
                }
            });
        }
    }

    let (parts, body) = upstream.into_parts();
    Ok(Response::from_parts(parts, Body::new(body)).into_response())
}
