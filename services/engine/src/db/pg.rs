//! Postgres store.

use std::fmt::Display;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use railyard_id::{DeploymentId, EnvId, GroupId, ProjectId, ReleaseId, ServiceId, WorkerId};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, instrument};

use super::{releases_lease, DeploymentUpdate, GroupUpdate, Store, StoreError};
use crate::model::{
    Deployment, DeploymentGroup, DeploymentStatus, Environment, Failure, GroupStatus, Release,
    ReleaseStatus, Service, ServiceDependency, Trigger,
};

const SERVICE_COLUMNS: &str =
    "service_id, project_id, name, build_ref, config, created_at, deleted_at";

const RELEASE_COLUMNS: &str =
    "release_id, service_id, version, image, source_commit, status, created_at, ready_at";

const DEPENDENCY_COLUMNS: &str = "dependency_id, service_id, depends_on, dependency_type, created_at";

const GROUP_COLUMNS: &str = "group_id, project_id, environment_id, strategy, status, \
    trigger_source, trigger_actor, source_commit, rollback_group_id, auto_rollback, \
    failure_reason, failure_detail, created_at, started_at, completed_at";

const DEPLOYMENT_COLUMNS: &str = "deployment_id, service_id, environment_id, release_id, \
    group_id, deploy_order, previous_deployment_id, status, health, desired_replicas, \
    ready_replicas, failure_reason, failure_detail, retry_count, spec_hash, claimed_by, \
    claim_expires_at, dispatched_at, applied_at, finished_at, created_at, updated_at";

/// Store backed by Postgres.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_deployment(
        tx: &mut Transaction<'_, Postgres>,
        id: DeploymentId,
    ) -> Result<Deployment, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE deployment_id = $1 FOR UPDATE"
        ))
        .bind(id.to_string())
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| StoreError::not_found("deployment", id))?;
        decode_deployment(&row)
    }

    async fn write_deployment_state(
        tx: &mut Transaction<'_, Postgres>,
        deployment: &Deployment,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE deployments
            SET status = $2,
                health = $3,
                ready_replicas = $4,
                failure_reason = $5,
                failure_detail = $6,
                retry_count = $7,
                spec_hash = $8,
                claimed_by = $9,
                claim_expires_at = $10,
                applied_at = $11,
                finished_at = $12,
                updated_at = $13
            WHERE deployment_id = $1
            "#,
        )
        .bind(deployment.id.to_string())
        .bind(deployment.status.as_str())
        .bind(deployment.health.as_str())
        .bind(deployment.ready_replicas as i32)
        .bind(deployment.failure.as_ref().map(|f| f.reason.as_str()))
        .bind(deployment.failure.as_ref().map(|f| f.detail.as_str()))
        .bind(deployment.retry_count as i32)
        .bind(deployment.spec_hash.as_deref())
        .bind(deployment.claimed_by.map(|w| w.to_string()))
        .bind(deployment.claim_expires_at)
        .bind(deployment.applied_at)
        .bind(deployment.finished_at)
        .bind(deployment.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn fetch_deployments(
        &self,
        sql: &str,
        binds: &[String],
    ) -> Result<Vec<Deployment>, StoreError> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(decode_deployment).collect()
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    #[instrument(skip(self, service), fields(service_id = %service.id, name = %service.name))]
    async fn insert_service(&self, service: &Service) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO services (service_id, project_id, name, build_ref, config, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(service.id.to_string())
        .bind(service.project_id.to_string())
        .bind(&service.name)
        .bind(&service.build_ref)
        .bind(serde_json::to_value(&service.config)?)
        .bind(service.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| unique_violation(e, || format!("service {} already exists", service.name)))?;
        Ok(())
    }

    async fn get_service(&self, id: ServiceId) -> Result<Service, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SERVICE_COLUMNS} FROM services WHERE service_id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("service", id))?;
        decode_service(&row)
    }

    async fn list_services(&self, project: ProjectId) -> Result<Vec<Service>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SERVICE_COLUMNS} FROM services \
             WHERE project_id = $1 AND deleted_at IS NULL \
             ORDER BY created_at, service_id"
        ))
        .bind(project.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_service).collect()
    }

    #[instrument(skip(self))]
    async fn delete_service(
        &self,
        id: ServiceId,
        at: DateTime<Utc>,
    ) -> Result<Vec<ServiceDependency>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE services SET deleted_at = $2 WHERE service_id = $1 AND deleted_at IS NULL",
        )
        .bind(id.to_string())
        .bind(at)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("service", id));
        }

        let rows = sqlx::query(&format!(
            "DELETE FROM service_dependencies WHERE service_id = $1 OR depends_on = $1 \
             RETURNING {DEPENDENCY_COLUMNS}"
        ))
        .bind(id.to_string())
        .fetch_all(&mut *tx)
        .await?;
        let removed = rows
            .iter()
            .map(decode_dependency)
            .collect::<Result<Vec<_>, _>>()?;

        tx.commit().await?;
        debug!(service_id = %id, edges = removed.len(), "Service deleted");
        Ok(removed)
    }

    async fn insert_environment(&self, environment: &Environment) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO environments (env_id, project_id, name, namespace, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(environment.id.to_string())
        .bind(environment.project_id.to_string())
        .bind(&environment.name)
        .bind(&environment.namespace)
        .bind(environment.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            unique_violation(e, || format!("environment {} already exists", environment.name))
        })?;
        Ok(())
    }

    async fn get_environment(&self, id: EnvId) -> Result<Environment, StoreError> {
        let row = sqlx::query(
            "SELECT env_id, project_id, name, namespace, created_at FROM environments WHERE env_id = $1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("environment", id))?;

        Ok(Environment {
            id: parsed(&row, "env_id")?,
            project_id: parsed(&row, "project_id")?,
            name: row.try_get("name")?,
            namespace: row.try_get("namespace")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn insert_release(&self, release: &Release) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO releases (
                release_id, service_id, version, image, source_commit, status,
                created_at, ready_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(release.id.to_string())
        .bind(release.service_id.to_string())
        .bind(&release.version)
        .bind(release.image.as_deref())
        .bind(release.source_commit.as_deref())
        .bind(release.status.as_str())
        .bind(release.created_at)
        .bind(release.ready_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            unique_violation(e, || {
                format!(
                    "release {} already exists for service {}",
                    release.version, release.service_id
                )
            })
        })?;
        Ok(())
    }

    async fn get_release(&self, id: ReleaseId) -> Result<Release, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RELEASE_COLUMNS} FROM releases WHERE release_id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("release", id))?;
        decode_release(&row)
    }

    async fn mark_release_ready(
        &self,
        id: ReleaseId,
        image: &str,
        at: DateTime<Utc>,
    ) -> Result<Release, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE releases SET status = 'ready', image = $2, ready_at = $3 \
             WHERE release_id = $1 AND status IN ('pending', 'building') AND image IS NULL \
             RETURNING {RELEASE_COLUMNS}"
        ))
        .bind(id.to_string())
        .bind(image)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => decode_release(&row),
            None => {
                let current = self.get_release(id).await?;
                Err(StoreError::InvalidTransition {
                    entity: "release",
                    from: current.status.to_string(),
                    to: ReleaseStatus::Ready.to_string(),
                })
            }
        }
    }

    async fn latest_ready_release(
        &self,
        service: ServiceId,
        commit: Option<&str>,
    ) -> Result<Option<Release>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RELEASE_COLUMNS} FROM releases \
             WHERE service_id = $1 AND status = 'ready' \
               AND ($2::TEXT IS NULL OR source_commit = $2) \
             ORDER BY ready_at DESC, created_at DESC, release_id DESC \
             LIMIT 1"
        ))
        .bind(service.to_string())
        .bind(commit)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode_release).transpose()
    }

    async fn insert_dependency(&self, dependency: &ServiceDependency) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO service_dependencies (
                dependency_id, service_id, depends_on, dependency_type, created_at
            )
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(dependency.id.to_string())
        .bind(dependency.service_id.to_string())
        .bind(dependency.depends_on.to_string())
        .bind(dependency.dependency_type.as_str())
        .bind(dependency.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            unique_violation(e, || {
                format!(
                    "dependency {} -> {} already exists",
                    dependency.service_id, dependency.depends_on
                )
            })
        })?;
        Ok(())
    }

    async fn delete_dependency(
        &self,
        service: ServiceId,
        depends_on: ServiceId,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM service_dependencies WHERE service_id = $1 AND depends_on = $2",
        )
        .bind(service.to_string())
        .bind(depends_on.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_dependencies(
        &self,
        project: ProjectId,
    ) -> Result<Vec<ServiceDependency>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT d.dependency_id, d.service_id, d.depends_on, d.dependency_type, d.created_at
            FROM service_dependencies d
            JOIN services s ON s.service_id = d.service_id
            JOIN services u ON u.service_id = d.depends_on
            WHERE s.project_id = $1 AND u.project_id = $1
              AND s.deleted_at IS NULL AND u.deleted_at IS NULL
            ORDER BY d.created_at, d.dependency_id
            "#,
        )
        .bind(project.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_dependency).collect()
    }

    #[instrument(skip(self, group, deployments), fields(group_id = %group.id, deployments = deployments.len()))]
    async fn create_group(
        &self,
        group: &DeploymentGroup,
        deployments: &[Deployment],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO deployment_groups (
                group_id, project_id, environment_id, strategy, status,
                trigger_source, trigger_actor, source_commit, rollback_group_id,
                auto_rollback, failure_reason, failure_detail, created_at,
                started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(group.id.to_string())
        .bind(group.project_id.to_string())
        .bind(group.environment_id.to_string())
        .bind(group.strategy.as_str())
        .bind(group.status.as_str())
        .bind(group.trigger.source.as_str())
        .bind(&group.trigger.actor)
        .bind(group.source_commit.as_deref())
        .bind(group.rollback_group_id.map(|id| id.to_string()))
        .bind(group.auto_rollback)
        .bind(group.failure.as_ref().map(|f| f.reason.as_str()))
        .bind(group.failure.as_ref().map(|f| f.detail.as_str()))
        .bind(group.created_at)
        .bind(group.started_at)
        .bind(group.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| unique_violation(e, || format!("group {} already exists", group.id)))?;

        for deployment in deployments {
            sqlx::query(
                r#"
                INSERT INTO deployments (
                    deployment_id, service_id, environment_id, release_id, group_id,
                    deploy_order, previous_deployment_id, status, health,
                    desired_replicas, ready_replicas, retry_count, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                "#,
            )
            .bind(deployment.id.to_string())
            .bind(deployment.service_id.to_string())
            .bind(deployment.environment_id.to_string())
            .bind(deployment.release_id.to_string())
            .bind(deployment.group_id.map(|id| id.to_string()))
            .bind(deployment.deploy_order.map(|o| o as i32))
            .bind(deployment.previous_deployment_id.map(|id| id.to_string()))
            .bind(deployment.status.as_str())
            .bind(deployment.health.as_str())
            .bind(deployment.desired_replicas as i32)
            .bind(deployment.ready_replicas as i32)
            .bind(deployment.retry_count as i32)
            .bind(deployment.created_at)
            .bind(deployment.updated_at)
            .execute(&mut *tx)
            .await?;

            let leased = sqlx::query(
                r#"
                INSERT INTO deployment_leases (service_id, environment_id, deployment_id, acquired_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (service_id, environment_id) DO NOTHING
                "#,
            )
            .bind(deployment.service_id.to_string())
            .bind(deployment.environment_id.to_string())
            .bind(deployment.id.to_string())
            .bind(deployment.created_at)
            .execute(&mut *tx)
            .await?;

            if leased.rows_affected() == 0 {
                let holder: String = sqlx::query_scalar(
                    "SELECT deployment_id FROM deployment_leases \
                     WHERE service_id = $1 AND environment_id = $2",
                )
                .bind(deployment.service_id.to_string())
                .bind(deployment.environment_id.to_string())
                .fetch_one(&mut *tx)
                .await?;
                // Dropping the transaction rolls back everything above.
                return Err(StoreError::LeaseHeld {
                    service: deployment.service_id,
                    environment: deployment.environment_id,
                    holder: holder.parse()?,
                });
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_group(&self, id: GroupId) -> Result<DeploymentGroup, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {GROUP_COLUMNS} FROM deployment_groups WHERE group_id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("deployment group", id))?;
        decode_group(&row)
    }

    async fn list_groups(
        &self,
        project: ProjectId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<DeploymentGroup>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {GROUP_COLUMNS} FROM deployment_groups WHERE project_id = $1 \
             ORDER BY created_at DESC, group_id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(project.to_string())
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_group).collect()
    }

    async fn group_deployments(&self, id: GroupId) -> Result<Vec<Deployment>, StoreError> {
        // Existence check so an unknown group is an error, not an empty list.
        self.get_group(id).await?;
        self.fetch_deployments(
            &format!(
                "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE group_id = $1 \
                 ORDER BY deploy_order NULLS LAST, created_at, deployment_id"
            ),
            &[id.to_string()],
        )
        .await
    }

    #[instrument(skip(self, update), fields(to = %update.status))]
    async fn transition_group(
        &self,
        id: GroupId,
        from: GroupStatus,
        update: GroupUpdate,
    ) -> Result<DeploymentGroup, StoreError> {
        if !from.can_transition_to(update.status) {
            return Err(StoreError::InvalidTransition {
                entity: "deployment group",
                from: from.to_string(),
                to: update.status.to_string(),
            });
        }

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {GROUP_COLUMNS} FROM deployment_groups WHERE group_id = $1 FOR UPDATE"
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::not_found("deployment group", id))?;
        let mut group = decode_group(&row)?;
        if group.status != from {
            return Err(StoreError::Conflict(format!(
                "group {} is {}, expected {}",
                id, group.status, from
            )));
        }
        update.apply_to(&mut group);

        sqlx::query(
            r#"
            UPDATE deployment_groups
            SET status = $2,
                failure_reason = $3,
                failure_detail = $4,
                started_at = $5,
                completed_at = $6
            WHERE group_id = $1
            "#,
        )
        .bind(id.to_string())
        .bind(group.status.as_str())
        .bind(group.failure.as_ref().map(|f| f.reason.as_str()))
        .bind(group.failure.as_ref().map(|f| f.detail.as_str()))
        .bind(group.started_at)
        .bind(group.completed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(group)
    }

    async fn rollback_groups_for(
        &self,
        failed: GroupId,
    ) -> Result<Vec<DeploymentGroup>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {GROUP_COLUMNS} FROM deployment_groups WHERE rollback_group_id = $1 \
             ORDER BY created_at, group_id"
        ))
        .bind(failed.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_group).collect()
    }

    async fn unfinished_groups(&self) -> Result<Vec<DeploymentGroup>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {GROUP_COLUMNS} FROM deployment_groups \
             WHERE status IN ('pending', 'building', 'deploying') \
             ORDER BY created_at, group_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_group).collect()
    }

    async fn get_deployment(&self, id: DeploymentId) -> Result<Deployment, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE deployment_id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("deployment", id))?;
        decode_deployment(&row)
    }

    #[instrument(skip(self, update), fields(to = %update.status))]
    async fn transition_deployment(
        &self,
        id: DeploymentId,
        from: DeploymentStatus,
        update: DeploymentUpdate,
    ) -> Result<Deployment, StoreError> {
        if !from.can_transition_to(update.status) {
            return Err(StoreError::InvalidTransition {
                entity: "deployment",
                from: from.to_string(),
                to: update.status.to_string(),
            });
        }

        let mut tx = self.pool.begin().await?;
        let mut deployment = Self::lock_deployment(&mut tx, id).await?;
        if deployment.status != from {
            return Err(StoreError::Conflict(format!(
                "deployment {} is {}, expected {}",
                id, deployment.status, from
            )));
        }
        update.apply_to(&mut deployment);
        Self::write_deployment_state(&mut tx, &deployment).await?;

        if releases_lease(update.status) {
            sqlx::query("DELETE FROM deployment_leases WHERE deployment_id = $1")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(deployment)
    }

    async fn claim_deployment(
        &self,
        id: DeploymentId,
        worker: WorkerId,
        expires_at: DateTime<Utc>,
    ) -> Result<Deployment, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE deployments \
             SET status = 'building', claimed_by = $2, claim_expires_at = $3, updated_at = now() \
             WHERE deployment_id = $1 AND status = 'pending' AND claimed_by IS NULL \
             RETURNING {DEPLOYMENT_COLUMNS}"
        ))
        .bind(id.to_string())
        .bind(worker.to_string())
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => decode_deployment(&row),
            None => {
                let current = self.get_deployment(id).await?;
                Err(StoreError::Conflict(format!(
                    "deployment {} is {} and cannot be claimed",
                    id, current.status
                )))
            }
        }
    }

    async fn renew_claim(
        &self,
        id: DeploymentId,
        worker: WorkerId,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE deployments SET claim_expires_at = $3 \
             WHERE deployment_id = $1 AND claimed_by = $2",
        )
        .bind(id.to_string())
        .bind(worker.to_string())
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "worker {} no longer holds deployment {}",
                worker, id
            )));
        }
        Ok(())
    }

    async fn record_progress(
        &self,
        id: DeploymentId,
        ready_replicas: u32,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE deployments SET ready_replicas = $2, updated_at = now() WHERE deployment_id = $1",
        )
        .bind(id.to_string())
        .bind(ready_replicas as i32)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("deployment", id));
        }
        Ok(())
    }

    async fn mark_dispatched(&self, id: DeploymentId, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE deployments SET dispatched_at = COALESCE(dispatched_at, $2) \
             WHERE deployment_id = $1",
        )
        .bind(id.to_string())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claimed_deployments(&self) -> Result<Vec<Deployment>, StoreError> {
        self.fetch_deployments(
            &format!(
                "SELECT {DEPLOYMENT_COLUMNS} FROM deployments \
                 WHERE claimed_by IS NOT NULL \
                   AND status IN ('pending', 'building', 'deploying', 'running') \
                 ORDER BY created_at, deployment_id"
            ),
            &[],
        )
        .await
    }

    async fn expired_claims(&self, now: DateTime<Utc>) -> Result<Vec<Deployment>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments \
             WHERE claim_expires_at < $1 \
               AND status IN ('pending', 'building', 'deploying', 'running') \
             ORDER BY created_at, deployment_id"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_deployment).collect()
    }

    async fn latest_healthy_deployment(
        &self,
        service: ServiceId,
        environment: EnvId,
        exclude_group: GroupId,
        before: DateTime<Utc>,
    ) -> Result<Option<Deployment>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments \
             WHERE service_id = $1 AND environment_id = $2 AND status = 'healthy' \
               AND group_id IS DISTINCT FROM $3 AND created_at < $4 \
             ORDER BY created_at DESC, deployment_id DESC \
             LIMIT 1"
        ))
        .bind(service.to_string())
        .bind(environment.to_string())
        .bind(exclude_group.to_string())
        .bind(before)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode_deployment).transpose()
    }
}

// =============================================================================
// Row decoding
// =============================================================================

fn unique_violation(err: sqlx::Error, message: impl FnOnce() -> String) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = err {
        if db_err.code().as_deref() == Some("23505") {
            return StoreError::Conflict(message());
        }
    }
    StoreError::Query(err)
}

fn parsed<T>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|e: T::Err| StoreError::Corrupt(format!("{column}: {e}")))
}

fn parsed_opt<T>(row: &PgRow, column: &str) -> Result<Option<T>, StoreError>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|value| {
        value
            .parse()
            .map_err(|e: T::Err| StoreError::Corrupt(format!("{column}: {e}")))
    })
    .transpose()
}

fn count(row: &PgRow, column: &str) -> Result<u32, StoreError> {
    let value: i32 = row.try_get(column)?;
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column}: negative value {value}")))
}

fn failure(row: &PgRow) -> Result<Option<Failure>, StoreError> {
    let reason = parsed_opt(row, "failure_reason")?;
    let detail: Option<String> = row.try_get("failure_detail")?;
    Ok(reason.map(|reason| Failure::new(reason, detail.unwrap_or_default())))
}

fn decode_service(row: &PgRow) -> Result<Service, StoreError> {
    let config: serde_json::Value = row.try_get("config")?;
    Ok(Service {
        id: parsed(row, "service_id")?,
        project_id: parsed(row, "project_id")?,
        name: row.try_get("name")?,
        build_ref: row.try_get("build_ref")?,
        config: serde_json::from_value(config)?,
        created_at: row.try_get("created_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn decode_release(row: &PgRow) -> Result<Release, StoreError> {
    Ok(Release {
        id: parsed(row, "release_id")?,
        service_id: parsed(row, "service_id")?,
        version: row.try_get("version")?,
        image: row.try_get("image")?,
        source_commit: row.try_get("source_commit")?,
        status: parsed(row, "status")?,
        created_at: row.try_get("created_at")?,
        ready_at: row.try_get("ready_at")?,
    })
}

fn decode_dependency(row: &PgRow) -> Result<ServiceDependency, StoreError> {
    Ok(ServiceDependency {
        id: parsed(row, "dependency_id")?,
        service_id: parsed(row, "service_id")?,
        depends_on: parsed(row, "depends_on")?,
        dependency_type: parsed(row, "dependency_type")?,
        created_at: row.try_get("created_at")?,
    })
}

fn decode_group(row: &PgRow) -> Result<DeploymentGroup, StoreError> {
    Ok(DeploymentGroup {
        id: parsed(row, "group_id")?,
        project_id: parsed(row, "project_id")?,
        environment_id: parsed(row, "environment_id")?,
        strategy: parsed(row, "strategy")?,
        status: parsed(row, "status")?,
        trigger: Trigger {
            source: parsed(row, "trigger_source")?,
            actor: row.try_get("trigger_actor")?,
        },
        source_commit: row.try_get("source_commit")?,
        rollback_group_id: parsed_opt(row, "rollback_group_id")?,
        auto_rollback: row.try_get("auto_rollback")?,
        failure: failure(row)?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn decode_deployment(row: &PgRow) -> Result<Deployment, StoreError> {
    let deploy_order: Option<i32> = row.try_get("deploy_order")?;
    Ok(Deployment {
        id: parsed(row, "deployment_id")?,
        service_id: parsed(row, "service_id")?,
        environment_id: parsed(row, "environment_id")?,
        release_id: parsed(row, "release_id")?,
        group_id: parsed_opt(row, "group_id")?,
        deploy_order: deploy_order.map(|o| o.max(0) as u32),
        previous_deployment_id: parsed_opt(row, "previous_deployment_id")?,
        status: parsed(row, "status")?,
        health: parsed(row, "health")?,
        desired_replicas: count(row, "desired_replicas")?,
        ready_replicas: count(row, "ready_replicas")?,
        failure: failure(row)?,
        retry_count: count(row, "retry_count")?,
        spec_hash: row.try_get("spec_hash")?,
        claimed_by: parsed_opt(row, "claimed_by")?,
        claim_expires_at: row.try_get("claim_expires_at")?,
        dispatched_at: row.try_get("dispatched_at")?,
        applied_at: row.try_get("applied_at")?,
        finished_at: row.try_get("finished_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
