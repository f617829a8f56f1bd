use crate::error::AppError;
use sqlx::SqlitePool;

/// Identity-provider contract: resolves a user name to an id and role.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub name: Option<String>,
    pub role: String,
    pub is_active: bool,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

#[derive(Clone)]
pub struct UserRepository {
    db_pool: SqlitePool,
}

impl UserRepository {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }

    pub async fn find_by_username(&self, username: &str) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, username, name, role, is_active FROM users \
             WHERE username = ? AND is_active = 1",
        )
        .bind(username)
        .fetch_optional(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to fetch user: {}", e)))?;

        Ok(user)
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, username, name, role, is_active FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to fetch user: {}", e)))?;

        Ok(user)
    }

    pub async fn create_user(
        &self,
        username: &str,
        password: &str,
        role: &str,
    ) -> Result<User, AppError> {
        let result = sqlx::query("INSERT INTO users (username, password, role) VALUES (?, ?, ?)")
            .bind(username)
            .bind(password)
            .bind(role)
            .execute(&self.db_pool)
            .await
            .map_err(|e| AppError::Database(format!("Failed to create user: {}", e)))?;

        Ok(User {
            id: result.last_insert_rowid(),
            username: username.to_string(),
            name: None,
            role: role.to_string(),
            is_active: true,
        })
    }
}
