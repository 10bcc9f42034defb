use crate::api;
use crate::state::AppState;
use anyhow::Result;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::services::{ServeDir, ServeFile};
use tracing::info;

pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    fn router(&self) -> Router {
        let mut router = api::router(self.state.clone());
        if self.state.config.serve_frontend {
            let dir = &self.state.config.frontend_dir;
            let index = format!("{dir}/index.html");
            router = router.fallback_service(
                ServeDir::new(dir).fallback(ServeFile::new(index)),
            );
        }
        router
    }

    pub async fn run(self) -> Result<()> {
        let addr = self.state.config.web_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "HTTP API listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}
