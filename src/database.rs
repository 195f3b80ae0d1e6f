use std::sync::Arc;

use bb8_postgres::bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use tokio_postgres::NoTls;

use crate::auth::SupabaseAuth;
use crate::blob_names::BlobNameResolver;
use crate::blob_store::BlobStore;
use crate::commit::CommitCoordinator;
use crate::config::AppConfig;
use crate::property_repository::{PgPool, PropertyStore};
use crate::reconciler::ReferenceReconciler;
use crate::record_deleter::SafeRecordDeleter;
use crate::staged_images::{DataUrlPreviews, PreviewAllocator, StagePolicy};
use crate::transcoder::ImageTranscoder;

pub struct AppState {
    pub properties: Arc<dyn PropertyStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub auth: Arc<SupabaseAuth>,
    pub coordinator: CommitCoordinator,
    pub reconciler: Arc<ReferenceReconciler>,
    pub deleter: SafeRecordDeleter,
    pub stage_policy: StagePolicy,
    pub transcoder: ImageTranscoder,
    pub previews: Arc<dyn PreviewAllocator>,
}

impl AppState {
    /// Wires every component on top of the two stores and the auth client.
    pub fn assemble(
        config: &AppConfig,
        properties: Arc<dyn PropertyStore>,
        blobs: Arc<dyn BlobStore>,
        auth: Arc<SupabaseAuth>,
    ) -> Self {
        let gateway = crate::upload_gateway::UploadGateway::new(blobs.clone())
            .with_max_bytes(config.stage.max_file_bytes);
        let coordinator = CommitCoordinator::new(gateway, properties.clone(), config.commit);
        let reconciler = Arc::new(ReferenceReconciler::new(
            blobs.clone(),
            properties.clone(),
            config.reconcile,
        ));
        let deleter = SafeRecordDeleter::new(
            blobs.clone(),
            properties.clone(),
            Arc::new(BlobNameResolver::new(blobs.clone())),
        );

        Self {
            properties,
            blobs,
            auth,
            coordinator,
            reconciler,
            deleter,
            stage_policy: config.stage,
            transcoder: ImageTranscoder::new(config.transcode),
            previews: Arc::new(DataUrlPreviews),
        }
    }
}

pub async fn establish_pool_connection(
    database_url: &str,
) -> Result<PgPool, Box<dyn std::error::Error + Send + Sync + 'static>> {
    let conn_manager = PostgresConnectionManager::new_from_stringlike(database_url, NoTls)?;

    let pool = Pool::builder()
        .min_idle(Some(1))
        .max_size(15)
        .build(conn_manager)
        .await?;
    Ok(pool)
}
