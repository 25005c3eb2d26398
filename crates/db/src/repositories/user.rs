use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use procura_core::domain::user::{Role, User, UserId};

use super::{RepositoryError, UserRepository};
use crate::DbPool;

pub struct SqlUserRepository {
    pool: DbPool,
}

impl SqlUserRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

pub(crate) fn user_from_row(row: &SqliteRow) -> Result<User, RepositoryError> {
    let role_raw: String = row.try_get("role")?;
    let role = Role::parse(&role_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown user role `{role_raw}`")))?;

    Ok(User {
        id: UserId(row.try_get("id")?),
        username: row.try_get("username")?,
        full_name: row.try_get("full_name")?,
        role,
        department: row.try_get("department")?,
        created_at: super::purchase_request::parse_timestamp(
            "created_at",
            row.try_get("created_at")?,
        )?,
    })
}

#[async_trait::async_trait]
impl UserRepository for SqlUserRepository {
    async fn find_by_id(&self, id: &UserId) -> Result<Option<User>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, username, full_name, role, department, created_at
             FROM app_user WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, username, full_name, role, department, created_at
             FROM app_user WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(user_from_row).transpose()
    }

    async fn save(&self, user: User) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO app_user (id, username, full_name, role, department, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 username = excluded.username,
                 full_name = excluded.full_name,
                 role = excluded.role,
                 department = excluded.department",
        )
        .bind(&user.id.0)
        .bind(&user.username)
        .bind(&user.full_name)
        .bind(user.role.as_str())
        .bind(&user.department)
        .bind(user.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use procura_core::domain::user::{Role, User, UserId};

    use super::SqlUserRepository;
    use crate::repositories::UserRepository;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn sample_user(id: &str, role: Role) -> User {
        User {
            id: UserId(id.to_string()),
            username: format!("user-{id}"),
            full_name: "Jordan Blake".to_string(),
            role,
            department: "operations".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_and_find_round_trip() {
        let pool = setup().await;
        let repo = SqlUserRepository::new(pool);

        let user = sample_user("u-1", Role::ApproverL1);
        repo.save(user.clone()).await.expect("save");

        let found = repo.find_by_id(&UserId("u-1".to_string())).await.expect("find");
        let found = found.expect("should exist");
        assert_eq!(found.id, user.id);
        assert_eq!(found.role, Role::ApproverL1);

        let by_name = repo.find_by_username("user-u-1").await.expect("find by username");
        assert_eq!(by_name.map(|u| u.id), Some(user.id));
    }

    #[tokio::test]
    async fn missing_user_is_none() {
        let pool = setup().await;
        let repo = SqlUserRepository::new(pool);

        let found = repo.find_by_id(&UserId("ghost".to_string())).await.expect("find");
        assert!(found.is_none());
    }
}
