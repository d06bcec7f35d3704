use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;

/// User record in the database.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct User {
    pub id: i64,                                // assigned by the store
    pub email: String,                          // normalized (trimmed, lowercase)
    #[serde(skip_serializing)]
    pub password_hash: String,                  // Argon2 PHC string, not exposed in JSON
    pub created_at: OffsetDateTime,             // creation timestamp
    pub last_login_at: Option<OffsetDateTime>,  // null until first login
}
