//! PostgreSQL storage for deployments and container images

use crate::listing::ListingQuery;
use crate::models::{Deployment, DeploymentChanges, NewDeployment};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// One page of a deployment listing plus the unpaginated total
#[derive(Debug, Clone, Default)]
pub struct DeploymentPage {
    pub deployments: Vec<Deployment>,
    pub total: i64,
}

/// Durable record of deployments, keyed by (name, owner)
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Look up an owner's deployment by name
    async fn find(&self, name: &str, owner: &str) -> Result<Option<Deployment>>;

    async fn insert(&self, deployment: &NewDeployment) -> Result<Deployment>;

    /// Rewrite image, scaling and (when known) address; touches `updated_at`
    async fn update(&self, id: Uuid, changes: &DeploymentChanges) -> Result<Deployment>;

    /// Returns false when no row had that id
    async fn delete(&self, id: Uuid) -> Result<bool>;

    async fn list(&self, query: &ListingQuery) -> Result<DeploymentPage>;

    /// Round-trip to the database
    async fn ping(&self) -> Result<()>;
}

/// Record of pushed images
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn record_image(&self, fqin: &str, owner: &str) -> Result<()>;

    async fn image_exists(&self, fqin: &str) -> Result<bool>;
}

/// Storage backed by a PostgreSQL pool
#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    /// Connect to the database
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL (pool size {})", max_connections);

        Ok(Self { pool })
    }

    /// Apply embedded migrations; already-applied ones are skipped
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;

        info!("Database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl DeploymentStore for PgStorage {
    async fn find(&self, name: &str, owner: &str) -> Result<Option<Deployment>> {
        let deployment = sqlx::query_as::<_, Deployment>(
            r#"
            SELECT id, name, url, container_image, user_email, min_instances, max_instances,
                   created_at, updated_at
            FROM deployments
            WHERE name = $1 AND user_email = $2
            "#,
        )
        .bind(name)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query deployment")?;

        Ok(deployment)
    }

    async fn insert(&self, deployment: &NewDeployment) -> Result<Deployment> {
        let row = sqlx::query_as::<_, Deployment>(
            r#"
            INSERT INTO deployments (name, url, container_image, user_email, min_instances, max_instances)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, name, url, container_image, user_email, min_instances, max_instances,
                      created_at, updated_at
            "#,
        )
        .bind(&deployment.name)
        .bind(&deployment.url)
        .bind(&deployment.container_image)
        .bind(&deployment.user_email)
        .bind(deployment.scaling.min_instances)
        .bind(deployment.scaling.max_instances)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert deployment")?;

        info!("Inserted deployment {} ({})", row.name, row.id);
        Ok(row)
    }

    async fn update(&self, id: Uuid, changes: &DeploymentChanges) -> Result<Deployment> {
        let row = sqlx::query_as::<_, Deployment>(
            r#"
            UPDATE deployments
            SET container_image = $2,
                min_instances = $3,
                max_instances = $4,
                url = COALESCE($5, url),
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, name, url, container_image, user_email, min_instances, max_instances,
                      created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(&changes.container_image)
        .bind(changes.scaling.min_instances)
        .bind(changes.scaling.max_instances)
        .bind(changes.url.as_deref())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to update deployment")?
        .with_context(|| format!("Deployment {} disappeared before it could be updated", id))?;

        info!("Updated deployment {} ({})", row.name, row.id);
        Ok(row)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM deployments WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete deployment")?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, query: &ListingQuery) -> Result<DeploymentPage> {
        let mut count = query.count_query();
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .context("Failed to count deployments")?;

        let mut page = query.page_query();
        let deployments = page
            .build_query_as::<Deployment>()
            .fetch_all(&self.pool)
            .await
            .context("Failed to list deployments")?;

        debug!(
            "Listed {} of {} deployments for {}",
            deployments.len(),
            total,
            query.owner()
        );

        Ok(DeploymentPage { deployments, total })
    }

    async fn ping(&self) -> Result<()> {
        let version: String = sqlx::query_scalar("SELECT version()")
            .fetch_one(&self.pool)
            .await
            .context("Database health check failed")?;

        debug!("Database version: {}", version);
        Ok(())
    }
}

#[async_trait]
impl ImageStore for PgStorage {
    async fn record_image(&self, fqin: &str, owner: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query("INSERT INTO users (email) VALUES ($1) ON CONFLICT (email) DO NOTHING")
            .bind(owner)
            .execute(&mut *tx)
            .await
            .context("Failed to record user")?;

        sqlx::query("INSERT INTO container_images (fqin, user_email) VALUES ($1, $2)")
            .bind(fqin)
            .bind(owner)
            .execute(&mut *tx)
            .await
            .context("Failed to record container image")?;

        tx.commit().await.context("Failed to commit image record")?;

        info!("Recorded container image {} for {}", fqin, owner);
        Ok(())
    }

    async fn image_exists(&self, fqin: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM container_images WHERE fqin = $1)")
                .bind(fqin)
                .fetch_one(&self.pool)
                .await
                .context("Failed to query container image")?;

        Ok(exists)
    }
}
