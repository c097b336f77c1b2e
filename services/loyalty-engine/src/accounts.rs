use crate::auth::{hash_password, verify_password};
use crate::database::Database;
use crate::errors::{ApiError, Result};
use async_trait::async_trait;
use loyalty_core::User;
use std::sync::Arc;
use tracing::info;

/// User persistence
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Insert a user; [`ApiError::LoginTaken`] if the login exists
    async fn create_user(&self, login: &str, password_hash: &str) -> Result<User>;

    async fn find_user_by_login(&self, login: &str) -> Result<Option<User>>;
}

#[async_trait]
impl UserStore for Database {
    async fn create_user(&self, login: &str, password_hash: &str) -> Result<User> {
        Database::create_user(self, login, password_hash).await
    }

    async fn find_user_by_login(&self, login: &str) -> Result<Option<User>> {
        Database::find_user_by_login(self, login).await
    }
}

/// Registration and login
pub struct AccountService {
    users: Arc<dyn UserStore>,
}

impl AccountService {
    pub fn new(users: Arc<dyn UserStore>) -> Self {
        Self { users }
    }

    pub async fn register(&self, login: &str, password: &str) -> Result<User> {
        validate_credentials(login, password)?;

        let password = password.to_string();
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| ApiError::Internal(format!("Password hashing task failed: {}", e)))??;

        let user = self.users.create_user(login, &password_hash).await?;
        info!("Registered user {} ({})", user.id, user.login);
        Ok(user)
    }

    pub async fn authenticate(&self, login: &str, password: &str) -> Result<User> {
        validate_credentials(login, password)?;

        let user = self
            .users
            .find_user_by_login(login)
            .await?
            .ok_or(ApiError::Unauthorized)?;

        let password = password.to_string();
        let password_hash = user.password_hash.clone();
        let valid = tokio::task::spawn_blocking(move || verify_password(&password, &password_hash))
            .await
            .map_err(|e| ApiError::Internal(format!("Password check task failed: {}", e)))?;

        if !valid {
            return Err(ApiError::Unauthorized);
        }
        Ok(user)
    }
}

fn validate_credentials(login: &str, password: &str) -> Result<()> {
    if login.trim().is_empty() {
        return Err(ApiError::BadRequest("login is required".to_string()));
    }
    if password.is_empty() {
        return Err(ApiError::BadRequest("password is required".to_string()));
    }
    Ok(())
}
