//! Static development server over a target's output directory.

use std::path::{Path, PathBuf};

use axum::Router;
use axum::http::{HeaderValue, header};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::error::WatchError;
use crate::watch::shutdown_requested;

/// Bind a listener for `dir` on the loopback interface.
pub async fn bind(dir: &Path, port: u16) -> Result<TcpListener, WatchError> {
  let listener = TcpListener::bind(("127.0.0.1", port))
    .await
    .map_err(|source| WatchError::Serve {
      dir: dir.to_path_buf(),
      port,
      source,
    })?;
  if let Ok(addr) = listener.local_addr() {
    tracing::info!(dir = %dir.display(), "serving on http://{addr}/");
  }
  Ok(listener)
}

/// Routes serving `root`: GET and HEAD only, `index.html` for directories, never cached.
pub fn router(root: &Path) -> Router {
  Router::new()
    .fallback_service(ServeDir::new(root).append_index_html_on_directories(true))
    .layer(SetResponseHeaderLayer::overriding(
      header::CACHE_CONTROL,
      HeaderValue::from_static("no-cache"),
    ))
}

/// Serve `root` on `port` until shutdown is signalled.
pub async fn serve(
  root: PathBuf,
  port: u16,
  shutdown: watch::Receiver<bool>,
) -> Result<(), WatchError> {
  let listener = bind(&root, port).await?;
  serve_listener(listener, root, shutdown).await
}

/// Serve `root` on an already bound `listener` until shutdown is signalled.
pub async fn serve_listener(
  listener: TcpListener,
  root: PathBuf,
  shutdown: watch::Receiver<bool>,
) -> Result<(), WatchError> {
  let port = listener
    .local_addr()
    .map(|addr| addr.port())
    .unwrap_or_default();

  axum::serve(listener, router(&root))
    .with_graceful_shutdown(shutdown_requested(shutdown))
    .await
    .map_err(|source| WatchError::Serve {
      dir: root.clone(),
      port,
      source,
    })?;

  tracing::debug!(root = %root.display(), "dev server stopped");
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use std::net::SocketAddr;
  use tempfile::tempdir;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpStream;

  async fn request(addr: SocketAddr, method: &str, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let raw = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).to_ascii_lowercase()
  }

  #[tokio::test]
  async fn serves_output_directory_until_shutdown() {
    let temp = tempdir().unwrap();
    let site = temp.path().join("dist");
    fs::create_dir_all(&site).unwrap();
    fs::write(site.join("index.html"), "<html></html>").unwrap();
    fs::write(site.join("index_bg.wasm"), [0u8, 97, 115, 109]).unwrap();
    fs::write(temp.path().join("secret.txt"), "do not serve").unwrap();

    let listener = bind(&site, 0).await.unwrap();
    let addr = listener.local_addr().unwrap();
    assert!(addr.ip().is_loopback());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(serve_listener(listener, site.clone(), shutdown_rx));

    let index = request(addr, "GET", "/").await;
    assert!(index.starts_with("http/1.1 200 ok\r\n"));
    assert!(index.contains("content-type: text/html"));
    assert!(index.contains("cache-control: no-cache\r\n"));
    assert!(index.ends_with("<html></html>"));

    let wasm = request(addr, "HEAD", "/index_bg.wasm").await;
    assert!(wasm.starts_with("http/1.1 200 ok\r\n"));
    assert!(wasm.contains("content-type: application/wasm\r\n"));
    assert!(wasm.contains("content-length: 4\r\n"));
    assert!(wasm.ends_with("\r\n\r\n"));

    let missing = request(addr, "GET", "/nope.js").await;
    assert!(missing.starts_with("http/1.1 404"));

    let post = request(addr, "POST", "/").await;
    assert!(post.starts_with("http/1.1 405"));

    let escape = request(addr, "GET", "/../secret.txt").await;
    assert!(!escape.starts_with("http/1.1 200"));
    assert!(!escape.contains("do not serve"));

    shutdown_tx.send(true).unwrap();
    server.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn occupied_port_is_a_serve_error() {
    let temp = tempdir().unwrap();
    let taken = bind(temp.path(), 0).await.unwrap();
    let port = taken.local_addr().unwrap().port();

    let err = bind(temp.path(), port).await.unwrap_err();
    assert!(matches!(err, WatchError::Serve { port: p, .. } if p == port));
  }
}
