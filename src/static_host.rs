//! Static file worker.
//!
//! The `static-serve` subcommand: a minimal HTTP server for one extracted
//! plugin directory, bound to loopback on the port the supervisor passes
//! via `PORT`. Each plugin instance runs one of these as its own process,
//! so a wedged or crashed server never takes the host down.

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::Router;
use tower_http::services::ServeDir;

/// Serve `root` on `127.0.0.1:{port}` until the process is killed.
pub async fn run(root: PathBuf, port: u16) -> anyhow::Result<()> {
    if !root.is_dir() {
        anyhow::bail!("serving root {} is not a directory", root.display());
    }

    let service = ServeDir::new(&root).append_index_html_on_directories(true);
    let app = Router::new().fallback_service(service);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, root = %root.display(), "static server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use tower::ServiceExt;

    fn app_for(root: &std::path::Path) -> Router {
        let service = ServeDir::new(root).append_index_html_on_directories(true);
        Router::new().fallback_service(service)
    }

    #[tokio::test]
    async fn serves_index_on_directory_requests() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>home</html>").unwrap();

        let resp = app_for(dir.path())
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"<html>home</html>");
    }

    #[tokio::test]
    async fn serves_nested_assets_with_content_type() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("css")).unwrap();
        std::fs::write(dir.path().join("css/app.css"), "body{}").unwrap();

        let resp = app_for(dir.path())
            .oneshot(
                Request::builder()
                    .uri("/css/app.css")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/css"));
    }

    #[tokio::test]
    async fn missing_files_are_404() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app_for(dir.path())
            .oneshot(
                Request::builder()
                    .uri("/nope.js")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
