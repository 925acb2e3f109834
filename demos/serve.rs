use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tracing::info;

use axum_filestream::{LocalFilesystem, StreamFiles};

/// Where to serve from and where to listen, read from the environment.
#[derive(Debug, Clone)]
struct ServeConfig {
    root: PathBuf,
    addr: SocketAddr,
}

impl ServeConfig {
    const DEFAULT_ADDR: &'static str = "127.0.0.1:3000";

    fn from_env() -> Result<Self, std::net::AddrParseError> {
        let root = env::var_os("FILESTREAM_ROOT").map_or_else(|| PathBuf::from("."), PathBuf::from);
        let addr = env::var("FILESTREAM_ADDR")
            .unwrap_or_else(|_| Self::DEFAULT_ADDR.to_owned())
            .parse()?;
        Ok(ServeConfig { root, addr })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct FileRequest {
    path: String,
    #[serde(default)]
    download: bool,
}

async fn get_file(
    State(fs): State<Arc<LocalFilesystem>>,
    headers: HeaderMap,
    Query(q): Query<FileRequest>,
) -> Response {
    let stream = fs.stream(q.path);
    let stream = if q.download { stream.with_download() } else { stream };
    stream.respond_to(&headers).await
}

fn router(fs: Arc<LocalFilesystem>) -> Router {
    Router::new()
        .route("/", get(|| async { "Hello, World!" }))
        .route("/file", get(get_file))
        .with_state(fs)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = ServeConfig::from_env()?;
    info!(root = %config.root.display(), addr = %config.addr, "serving files");

    let fs = Arc::new(LocalFilesystem::new(config.root));
    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, router(fs)).await?;
    Ok(())
}
