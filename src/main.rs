use std::sync::Arc;
use std::time::Duration;

use aws_sdk_s3::Client as S3Client;
use axum::extract::DefaultBodyLimit;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    classify::ServerErrorsFailureClass, timeout::TimeoutLayer, trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use estate_backend::api;
use estate_backend::auth::SupabaseAuth;
use estate_backend::config::AppConfig;
use estate_backend::database::{self, AppState};
use estate_backend::property_repository::PgPropertyStore;
use estate_backend::reconciler;
use estate_backend::s3_ops::S3BlobStore;
use estate_backend::s3_throttle::S3Throttle;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
// Room for the JSON parts next to the images.
const FORM_OVERHEAD_BYTES: usize = 1024 * 1024;

#[tokio::main]
async fn main() {
    let config = AppConfig::from_env().expect("Invalid configuration");

    // Sentry stays disabled when no DSN is configured.
    let _guard = sentry::init((
        config.sentry_dsn.clone(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            traces_sample_rate: 0.2,
            max_breadcrumbs: 50,
            send_default_pii: false,
            before_send: Some(Arc::new(|mut event| {
                if let Some(user) = &mut event.user {
                    user.ip_address = None;
                    user.email = None;
                    user.username = None;
                }

                static LAST_ERRORS: once_cell::sync::Lazy<
                    std::sync::Mutex<std::collections::HashMap<String, std::time::Instant>>,
                > = once_cell::sync::Lazy::new(|| {
                    std::sync::Mutex::new(std::collections::HashMap::new())
                });

                let event_key = format!(
                    "{}:{}",
                    event.message.as_deref().unwrap_or(""),
                    event.level
                );

                // A poisoned map only disables deduplication.
                let Ok(mut last_errors) = LAST_ERRORS.lock() else {
                    return Some(event);
                };
                let now = std::time::Instant::now();
                if let Some(last_seen) = last_errors.get(&event_key) {
                    if now.duration_since(*last_seen).as_secs() < 60 {
                        return None;
                    }
                }
                last_errors.insert(event_key, now);
                last_errors.retain(|_, &mut v| now.duration_since(v).as_secs() < 300);

                Some(event)
            })),
            ..Default::default()
        },
    ));

    let env_filter = if cfg!(debug_assertions) {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            format!("{}=debug,tower_http=debug", env!("CARGO_CRATE_NAME")).into()
        })
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            format!("{}=info,tower_http=info", env!("CARGO_CRATE_NAME")).into()
        })
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();

    let credentials = aws_sdk_s3::config::Credentials::new(
        config.s3.access_key_id.clone(),
        config.s3.secret_access_key.clone(),
        None,
        None,
        "s3-credentials",
    );
    let s3_config = aws_config::from_env()
        .region(aws_sdk_s3::config::Region::new(config.s3.region.clone()))
        .credentials_provider(aws_sdk_s3::config::SharedCredentialsProvider::new(
            credentials,
        ))
        .endpoint_url(&config.s3.endpoint)
        .load()
        .await;
    // Supabase Storage only speaks path-style addressing.
    let s3_service_config = aws_sdk_s3::config::Builder::from(&s3_config)
        .force_path_style(true)
        .build();
    let s3_client = S3Client::from_conf(s3_service_config);

    let s3_throttle = Arc::new(S3Throttle::new(
        config.s3.max_concurrency,
        config.s3.max_rps,
    ));
    let blobs = Arc::new(S3BlobStore::new(
        s3_client,
        config.s3.bucket.clone(),
        &config.s3.public_base_url,
        s3_throttle,
    ));

    let pool = database::establish_pool_connection(&config.database_url)
        .await
        .expect("Failed to establish database connection pool");
    let properties = Arc::new(PgPropertyStore::new(Arc::new(pool)));

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .expect("Failed to build HTTP client");
    let auth = Arc::new(SupabaseAuth::new(
        http,
        &config.supabase_url,
        config.supabase_anon_key.clone(),
    ));

    let state = Arc::new(AppState::assemble(&config, properties, blobs, auth));

    if let Some(every) = config.reconcile_every {
        info!(?every, auto_cleanup = config.reconcile_auto_cleanup, "Scheduling storage reconciliation");
        reconciler::spawn_periodic(
            state.reconciler.clone(),
            every,
            config.reconcile_auto_cleanup,
        );
    }

    let body_limit = config.stage.max_items * config.stage.max_file_bytes + FORM_OVERHEAD_BYTES;

    let app = api::routes()
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http()
                .on_request(())
                .on_response(())
                .on_failure(
                    |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                        match &error {
                            ServerErrorsFailureClass::StatusCode(code) => {
                                // Handlers report their own errors; a 5xx here escaped them.
                                if code.is_server_error() {
                                    sentry::with_scope(
                                        |scope| {
                                            scope.set_fingerprint(Some(&["unhandled_server_error", code.as_str()]));
                                            scope.set_tag("error_type", "unhandled_5xx");
                                            scope.set_extra("latency_ms", (latency.as_millis() as u64).into());
                                        },
                                        || {
                                            sentry::capture_message(
                                                &format!("Unhandled server error: {code} latency={}ms", latency.as_millis()),
                                                sentry::Level::Error,
                                            );
                                        },
                                    );
                                    tracing::error!(status = %code, latency_ms = %latency.as_millis(), "Unhandled server error");
                                }
                            }
                            ServerErrorsFailureClass::Error(msg) => {
                                let msg_str = msg.to_string();
                                let is_expected = msg_str.contains("connection reset")
                                    || msg_str.contains("broken pipe")
                                    || msg_str.contains("connection closed");
                                if !is_expected {
                                    sentry::capture_message(
                                        &format!("Protocol/connection error: {msg_str}"),
                                        sentry::Level::Warning,
                                    );
                                }
                                tracing::warn!(error = %msg, latency_ms = %latency.as_millis(), expected = is_expected, "Connection/protocol issue");
                            }
                        }
                    },
                ))
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT)),
        );

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .expect("Failed to bind listener");
    info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
