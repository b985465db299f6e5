//! Tether Echo Plugin
//!
//! Minimal REST plugin for trying out a tether deployment:
//! - `GET /ping` answers `pong`
//! - `POST /exec` runs `echo` (payload unchanged) or `upper` (ASCII uppercase)

use std::net::SocketAddr;

use anyhow::Result;
use axum::Router;
use axum::extract::Json;
use axum::http::StatusCode;
use axum::routing::{get, post};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use tether::caller::rest::{ExecRequest, JsonResponse, PATH_EXEC, PATH_PING};

#[derive(Parser, Debug)]
#[command(name = "tether-echo")]
#[command(about = "Echo plugin for tether", long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,
}

type Reply = (StatusCode, Json<JsonResponse>);

fn router() -> Router {
    Router::new()
        .route(PATH_PING, get(ping))
        .route(PATH_EXEC, post(exec))
}

async fn ping() -> Reply {
    (StatusCode::OK, Json(JsonResponse::success("pong")))
}

async fn exec(Json(request): Json<ExecRequest>) -> Reply {
    let payload = match hex::decode(&request.payload) {
        Ok(payload) => payload,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(JsonResponse::error(e.to_string()))),
    };

    debug!(command = %request.command, bytes = payload.len(), "Exec");

    let output = match request.command.as_str() {
        "echo" => payload,
        "upper" => payload.to_ascii_uppercase(),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(JsonResponse::error("Unknown command")),
            );
        }
    };

    (StatusCode::ACCEPTED, Json(JsonResponse::success(hex::encode(output))))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tether_echo=info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Echo plugin listening on http://{}", addr);
    axum::serve(listener, router()).await?;
    Ok(())
}
