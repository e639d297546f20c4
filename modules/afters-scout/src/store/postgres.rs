use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use afters_common::{ClassificationResult, VenueScore, VenueStatus, Vibe};

use super::{PulseStore, StoredClassification};

/// Postgres-backed store.
pub struct PostgresStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct ScoreRow {
    venue_id: Uuid,
    energy: f64,
    crowd: f64,
    vibe: String,
    sample_count: i32,
    computed_at: DateTime<Utc>,
    stale_after: DateTime<Utc>,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables if they do not exist.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS vibe_classifications (
                content_hash   TEXT PRIMARY KEY,
                media_item_id  UUID NOT NULL,
                energy         SMALLINT NOT NULL,
                crowd          SMALLINT NOT NULL,
                vibe           TEXT NOT NULL,
                confidence     DOUBLE PRECISION NOT NULL,
                low_confidence BOOLEAN NOT NULL,
                classified_at  TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS venue_scores (
                venue_id     UUID PRIMARY KEY,
                energy       DOUBLE PRECISION NOT NULL,
                crowd        DOUBLE PRECISION NOT NULL,
                vibe         TEXT NOT NULL,
                sample_count INTEGER NOT NULL,
                computed_at  TIMESTAMPTZ NOT NULL,
                stale_after  TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        info!("Pulse store schema ready");
        Ok(())
    }
}

#[async_trait]
impl PulseStore for PostgresStore {
    async fn load_classifications(&self) -> Result<Vec<StoredClassification>> {
        let rows = sqlx::query_as::<_, StoredClassification>(
            "SELECT content_hash, media_item_id, energy, crowd, vibe, confidence,
                    low_confidence, classified_at
             FROM vibe_classifications",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn append_classification(&self, result: &ClassificationResult) -> Result<()> {
        let row = StoredClassification::from(result);
        sqlx::query(
            "INSERT INTO vibe_classifications
                (content_hash, media_item_id, energy, crowd, vibe, confidence, low_confidence, classified_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (content_hash) DO NOTHING",
        )
        .bind(&row.content_hash)
        .bind(row.media_item_id)
        .bind(row.energy)
        .bind(row.crowd)
        .bind(&row.vibe)
        .bind(row.confidence)
        .bind(row.low_confidence)
        .bind(row.classified_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn evict_classification(&self, content_hash: &str) -> Result<()> {
        sqlx::query("DELETE FROM vibe_classifications WHERE content_hash = $1")
            .bind(content_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_score(&self, score: &VenueScore) -> Result<()> {
        sqlx::query(
            "INSERT INTO venue_scores
                (venue_id, energy, crowd, vibe, sample_count, computed_at, stale_after)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (venue_id)
             DO UPDATE SET energy = EXCLUDED.energy,
                           crowd = EXCLUDED.crowd,
                           vibe = EXCLUDED.vibe,
                           sample_count = EXCLUDED.sample_count,
                           computed_at = EXCLUDED.computed_at,
                           stale_after = EXCLUDED.stale_after",
        )
        .bind(score.venue_id)
        .bind(score.energy)
        .bind(score.crowd)
        .bind(score.vibe.as_str())
        .bind(score.sample_count as i32)
        .bind(score.computed_at)
        .bind(score.stale_after)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_scores(&self) -> Result<Vec<VenueScore>> {
        let rows = sqlx::query_as::<_, ScoreRow>(
            "SELECT venue_id, energy, crowd, vibe, sample_count, computed_at, stale_after
             FROM venue_scores",
        )
        .fetch_all(&self.pool)
        .await?;

        let now = Utc::now();
        let scores = rows
            .into_iter()
            .filter_map(|row| {
                let vibe: Vibe = match row.vibe.parse() {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(venue_id = %row.venue_id, error = %e, "Skipping unreadable score row");
                        return None;
                    }
                };
                let sample_count = row.sample_count.max(0) as u32;
                Some(VenueScore {
                    venue_id: row.venue_id,
                    energy: row.energy,
                    crowd: row.crowd,
                    vibe,
                    sample_count,
                    status: VenueStatus::from_levels(row.energy, row.crowd, sample_count),
                    computed_at: row.computed_at,
                    stale_after: row.stale_after,
                    stale: sample_count == 0 || now >= row.stale_after,
                })
            })
            .collect();
        Ok(scores)
    }
}
