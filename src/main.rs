mod handlers;
mod keys;
mod models;
mod redis_db;
mod watch;

use crate::handlers::{health_check, status_handler, watch_event_handler};
use crate::models::PROJECT_ID;
use crate::redis_db::RedisDb;
use actix_cors::Cors;
use actix_web::http::header;
use actix_web::{middleware, web, App, HttpServer};
use dotenvy::dotenv;
use std::env;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::sync::RwLock;
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health_check,
        handlers::status_handler,
        handlers::watch_event_handler,
    ),
    components(schemas(
        models::WatchEventOptions,
        models::WatchEventResp,
        models::EventType,
        models::ErrorResponse,
        models::HealthResponse,
        models::StatusResponse,
        keys::CursorType,
    )),
    info(
        title = "Event Watch API",
        version = "1.0.0",
        description = "Tail a resource's durable change stream with a cursor, a starting timestamp, or from now. Events are served from a Redis cursor chain maintained by the ingestion pipeline."
    ),
    tags(
        (name = "health", description = "Health and status endpoints"),
        (name = "watch", description = "Long-poll event watch")
    )
)]
struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<RwLock<Option<Arc<RedisDb>>>>,
    /// Active watch request count for admission control.
    pub watch_count: Arc<AtomicUsize>,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "eventwatch=info,eventwatch_server=info".into()),
        )
        .init();

    tracing::info!(target: PROJECT_ID, "event watch server starting");

    // Redis connection
    let db: Arc<RwLock<Option<Arc<RedisDb>>>> = Arc::new(RwLock::new(None));

    // Background reconnection task
    {
        let db = Arc::clone(&db);
        tokio::spawn(async move {
            let mut delay_secs = 5u64;
            let reconnect_max_secs = 300u64;
            let mut is_initial = true;
            loop {
                if is_initial {
                    is_initial = false;
                } else {
                    tokio::time::sleep(std::time::Duration::from_secs(delay_secs)).await;
                }
                if db.read().await.is_some() {
                    delay_secs = 5;
                    continue;
                }
                tracing::info!(target: PROJECT_ID, delay_secs, "attempting to connect to Redis...");
                match RedisDb::new().await {
                    Ok(redis_db) => {
                        if let Err(e) = redis_db.health_check().await {
                            tracing::warn!(target: PROJECT_ID, error = %e, delay_secs, "Redis connection test failed");
                            delay_secs = (delay_secs * 2).min(reconnect_max_secs);
                            continue;
                        }
                        *db.write().await = Some(Arc::new(redis_db));
                        delay_secs = 5;
                        tracing::info!(target: PROJECT_ID, "successfully connected to Redis");
                    }
                    Err(e) => {
                        tracing::warn!(target: PROJECT_ID, error = %e, delay_secs, "Redis connection failed");
                        delay_secs = (delay_secs * 2).min(reconnect_max_secs);
                    }
                }
            }
        });
    }

    // One counter across all workers so the watch cap is process-wide
    let watch_count = Arc::new(AtomicUsize::new(0));

    let port = env::var("PORT").unwrap_or_else(|_| "8090".to_string());
    tracing::info!(target: PROJECT_ID, %port, "binding HTTP server");

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allowed_methods(vec!["GET", "POST"])
            .allowed_headers(vec![header::CONTENT_TYPE, header::ACCEPT])
            .allowed_header(models::REQUEST_ID_HEADER)
            .max_age(3600);

        App::new()
            .app_data(web::PayloadConfig::new(262_144))
            .app_data(web::Data::new(AppState {
                db: Arc::clone(&db),
                watch_count: Arc::clone(&watch_count),
            }))
            .wrap(cors)
            .wrap(middleware::Compress::default())
            .wrap(middleware::Logger::new(
                "%{r}a \"%r\"	%s %b \"%{User-Agent}i\" %T",
            ))
            .wrap(tracing_actix_web::TracingLogger::default())
            .service(Scalar::with_url("/docs", ApiDoc::openapi()))
            .service(health_check)
            .service(status_handler)
            .service(watch_event_handler)
    })
    .bind(format!("0.0.0.0:{}", port))?
    .run()
    .await?;

    Ok(())
}
