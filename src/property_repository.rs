use std::sync::Arc;

use async_trait::async_trait;
use bb8_postgres::bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

use crate::property::{GeoPoint, PropertyDraft, PropertyRecord};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepoError {
    #[error("database unavailable: {0}")]
    Unavailable(String),
    #[error("database query failed: {0}")]
    Query(String),
    #[error("property {0} not found")]
    NotFound(Uuid),
    #[error("stored row is invalid: {0}")]
    Corrupt(String),
}

/// The relational side: one row per listing, images kept as an ordered array.
#[async_trait]
pub trait PropertyStore: Send + Sync {
    /// Newest first.
    async fn list(&self) -> Result<Vec<PropertyRecord>, RepoError>;

    async fn get(&self, id: Uuid) -> Result<Option<PropertyRecord>, RepoError>;

    async fn insert(&self, draft: &PropertyDraft, images: &[String]) -> Result<Uuid, RepoError>;

    /// Full overwrite of every column, images included.
    async fn update(&self, id: Uuid, draft: &PropertyDraft, images: &[String])
        -> Result<(), RepoError>;

    async fn delete(&self, id: Uuid) -> Result<(), RepoError>;

    /// One page of image reference lists, in a stable order.
    async fn image_references(&self, offset: i64, limit: i64)
        -> Result<Vec<Vec<String>>, RepoError>;
}

pub type PgPool = Pool<PostgresConnectionManager<NoTls>>;

const COLUMNS: &str = "id, created_at, title, description, price, currency, operation, \
     property_type, bedrooms, bathrooms, built_area, lot_area, address, neighborhood, city, \
     province, country, latitude, longitude, features, featured, status, gated_community, \
     country_club, pays_common_charges, is_studio, is_covered, parking_capacity, images";

pub struct PgPropertyStore {
    pool: Arc<PgPool>,
}

impl PgPropertyStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    async fn conn(
        &self,
    ) -> Result<bb8_postgres::bb8::PooledConnection<'_, PostgresConnectionManager<NoTls>>, RepoError>
    {
        self.pool.get().await.map_err(|err| {
            sentry::capture_message(
                &format!("property_repository: Failed to get pool: {err}"),
                sentry::Level::Error,
            );
            RepoError::Unavailable(err.to_string())
        })
    }
}

fn query_err(err: tokio_postgres::Error) -> RepoError {
    RepoError::Query(err.to_string())
}

fn to_i32(value: u32, column: &str) -> Result<i32, RepoError> {
    i32::try_from(value).map_err(|_| RepoError::Corrupt(format!("{column} out of range")))
}

fn to_u32(value: i32, column: &str) -> Result<u32, RepoError> {
    u32::try_from(value).map_err(|_| RepoError::Corrupt(format!("negative {column}")))
}

fn row_to_record(row: &Row) -> Result<PropertyRecord, RepoError> {
    let text = |column: &str| -> Result<String, RepoError> {
        row.try_get::<_, Option<String>>(column)
            .map(Option::unwrap_or_default)
            .map_err(|e| RepoError::Corrupt(format!("{column}: {e}")))
    };

    let latitude: Option<f64> = row.try_get("latitude").map_err(query_err)?;
    let longitude: Option<f64> = row.try_get("longitude").map_err(query_err)?;
    let parking: Option<i32> = row.try_get("parking_capacity").map_err(query_err)?;

    let draft = PropertyDraft {
        title: text("title")?,
        description: text("description")?,
        price: row.try_get("price").map_err(query_err)?,
        currency: text("currency")?,
        operation: text("operation")?.parse().map_err(RepoError::Corrupt)?,
        property_type: text("property_type")?.parse().map_err(RepoError::Corrupt)?,
        bedrooms: to_u32(row.try_get("bedrooms").map_err(query_err)?, "bedrooms")?,
        bathrooms: to_u32(row.try_get("bathrooms").map_err(query_err)?, "bathrooms")?,
        built_area: row.try_get("built_area").map_err(query_err)?,
        lot_area: row.try_get("lot_area").map_err(query_err)?,
        address: text("address")?,
        neighborhood: text("neighborhood")?,
        city: text("city")?,
        province: text("province")?,
        country: text("country")?,
        location: latitude
            .zip(longitude)
            .map(|(latitude, longitude)| GeoPoint { latitude, longitude }),
        features: row
            .try_get::<_, Option<Vec<String>>>("features")
            .map_err(query_err)?
            .unwrap_or_default(),
        featured: row.try_get("featured").map_err(query_err)?,
        status: text("status")?.parse().map_err(RepoError::Corrupt)?,
        gated_community: row.try_get("gated_community").map_err(query_err)?,
        country_club: row.try_get("country_club").map_err(query_err)?,
        pays_common_charges: row.try_get("pays_common_charges").map_err(query_err)?,
        is_studio: row.try_get("is_studio").map_err(query_err)?,
        is_covered: row.try_get("is_covered").map_err(query_err)?,
        parking_capacity: parking.map(|p| to_u32(p, "parking_capacity")).transpose()?,
    };

    Ok(PropertyRecord {
        id: row.try_get("id").map_err(query_err)?,
        created_at: row.try_get::<_, DateTime<Utc>>("created_at").map_err(query_err)?,
        draft,
        images: row
            .try_get::<_, Option<Vec<String>>>("images")
            .map_err(query_err)?
            .unwrap_or_default(),
    })
}

#[async_trait]
impl PropertyStore for PgPropertyStore {
    async fn list(&self) -> Result<Vec<PropertyRecord>, RepoError> {
        let client = self.conn().await?;
        let rows = client
            .query(
                &format!("SELECT {COLUMNS} FROM properties ORDER BY created_at DESC"),
                &[],
            )
            .await
            .map_err(query_err)?;

        rows.iter().map(row_to_record).collect()
    }

    async fn get(&self, id: Uuid) -> Result<Option<PropertyRecord>, RepoError> {
        let client = self.conn().await?;
        let row = client
            .query_opt(
                &format!("SELECT {COLUMNS} FROM properties WHERE id = $1"),
                &[&id],
            )
            .await
            .map_err(query_err)?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn insert(&self, draft: &PropertyDraft, images: &[String]) -> Result<Uuid, RepoError> {
        let client = self.conn().await?;
        let bedrooms = to_i32(draft.bedrooms, "bedrooms")?;
        let bathrooms = to_i32(draft.bathrooms, "bathrooms")?;
        let parking = draft
            .parking_capacity
            .map(|p| to_i32(p, "parking_capacity"))
            .transpose()?;
        let operation = draft.operation.as_str();
        let property_type = draft.property_type.as_str();
        let status = draft.status.as_str();
        let latitude = draft.location.map(|p| p.latitude);
        let longitude = draft.location.map(|p| p.longitude);

        let row = client
            .query_one(
                "INSERT INTO properties (title, description, price, currency, operation, \
                 property_type, bedrooms, bathrooms, built_area, lot_area, address, neighborhood, \
                 city, province, country, latitude, longitude, features, featured, status, \
                 gated_community, country_club, pays_common_charges, is_studio, is_covered, \
                 parking_capacity, images) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                 $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27) RETURNING id",
                &[
                    &draft.title,
                    &draft.description,
                    &draft.price,
                    &draft.currency,
                    &operation,
                    &property_type,
                    &bedrooms,
                    &bathrooms,
                    &draft.built_area,
                    &draft.lot_area,
                    &draft.address,
                    &draft.neighborhood,
                    &draft.city,
                    &draft.province,
                    &draft.country,
                    &latitude,
                    &longitude,
                    &draft.features,
                    &draft.featured,
                    &status,
                    &draft.gated_community,
                    &draft.country_club,
                    &draft.pays_common_charges,
                    &draft.is_studio,
                    &draft.is_covered,
                    &parking,
                    &images,
                ],
            )
            .await
            .map_err(query_err)?;

        row.try_get(0).map_err(query_err)
    }

    async fn update(
        &self,
        id: Uuid,
        draft: &PropertyDraft,
        images: &[String],
    ) -> Result<(), RepoError> {
        let client = self.conn().await?;
        let bedrooms = to_i32(draft.bedrooms, "bedrooms")?;
        let bathrooms = to_i32(draft.bathrooms, "bathrooms")?;
        let parking = draft
            .parking_capacity
            .map(|p| to_i32(p, "parking_capacity"))
            .transpose()?;
        let operation = draft.operation.as_str();
        let property_type = draft.property_type.as_str();
        let status = draft.status.as_str();
        let latitude = draft.location.map(|p| p.latitude);
        let longitude = draft.location.map(|p| p.longitude);

        let updated = client
            .execute(
                "UPDATE properties SET title = $2, description = $3, price = $4, currency = $5, \
                 operation = $6, property_type = $7, bedrooms = $8, bathrooms = $9, \
                 built_area = $10, lot_area = $11, address = $12, neighborhood = $13, city = $14, \
                 province = $15, country = $16, latitude = $17, longitude = $18, features = $19, \
                 featured = $20, status = $21, gated_community = $22, country_club = $23, \
                 pays_common_charges = $24, is_studio = $25, is_covered = $26, \
                 parking_capacity = $27, images = $28, updated_at = NOW() WHERE id = $1",
                &[
                    &id,
                    &draft.title,
                    &draft.description,
                    &draft.price,
                    &draft.currency,
                    &operation,
                    &property_type,
                    &bedrooms,
                    &bathrooms,
                    &draft.built_area,
                    &draft.lot_area,
                    &draft.address,
                    &draft.neighborhood,
                    &draft.city,
                    &draft.province,
                    &draft.country,
                    &latitude,
                    &longitude,
                    &draft.features,
                    &draft.featured,
                    &status,
                    &draft.gated_community,
                    &draft.country_club,
                    &draft.pays_common_charges,
                    &draft.is_studio,
                    &draft.is_covered,
                    &parking,
                    &images,
                ],
            )
            .await
            .map_err(query_err)?;

        if updated == 0 {
            return Err(RepoError::NotFound(id));
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), RepoError> {
        let client = self.conn().await?;
        let deleted = client
            .execute("DELETE FROM properties WHERE id = $1", &[&id])
            .await
            .map_err(query_err)?;
        if deleted == 0 {
            return Err(RepoError::NotFound(id));
        }
        Ok(())
    }

    async fn image_references(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Vec<String>>, RepoError> {
        let client = self.conn().await?;
        let rows = client
            .query(
                "SELECT images FROM properties ORDER BY created_at, id OFFSET $1 LIMIT $2",
                &[&offset, &limit],
            )
            .await
            .map_err(query_err)?;

        rows.iter()
            .map(|row| {
                row.try_get::<_, Option<Vec<String>>>(0)
                    .map(Option::unwrap_or_default)
                    .map_err(query_err)
            })
            .collect()
    }
}
