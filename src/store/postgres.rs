use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    CreateUserError, CredentialStore, NewRefreshToken, NewUser, RecoveryCode, RefreshToken, User,
};

const USER_COLUMNS: &str = "id, login, email, password_hash, tag, plan, plan_date, \
     recovery_code_hash, recovery_code_expires_at, selected_path, selected_feelings, \
     test_results, progress, created_at";

const TOKEN_COLUMNS: &str = "id, user_id, token_hash, expires_at, revoked, created_at, \
     last_used_at, ip_address, user_agent";

#[derive(Clone)]
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    async fn find_user_where(&self, column: &str, value: &str) -> anyhow::Result<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(value)
            .fetch_optional(&self.db)
            .await
            .with_context(|| format!("find user by {column}"))?;
        Ok(user)
    }
}

async fn insert_token<'e, E>(exec: E, token: &NewRefreshToken) -> anyhow::Result<RefreshToken>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let sql = format!(
        "INSERT INTO refresh_tokens (id, user_id, token_hash, expires_at, ip_address, user_agent) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING {TOKEN_COLUMNS}"
    );
    let row = sqlx::query_as::<_, RefreshToken>(&sql)
        .bind(Uuid::new_v4())
        .bind(token.user_id)
        .bind(&token.token_hash)
        .bind(token.expires_at)
        .bind(token.ip_address.as_deref())
        .bind(token.user_agent.as_deref())
        .fetch_one(exec)
        .await
        .context("insert refresh token")?;
    Ok(row)
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn find_user_by_id(&self, id: i64) -> anyhow::Result<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await
            .context("find user by id")?;
        Ok(user)
    }

    async fn find_user_by_login(&self, login: &str) -> anyhow::Result<Option<User>> {
        self.find_user_where("login", login).await
    }

    async fn find_user_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        self.find_user_where("email", email).await
    }

    async fn create_user(&self, user: NewUser) -> Result<User, CreateUserError> {
        let sql = format!(
            "INSERT INTO users (login, email, password_hash, tag, plan) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING {USER_COLUMNS}"
        );
        let res = sqlx::query_as::<_, User>(&sql)
            .bind(&user.login)
            .bind(&user.email)
            .bind(&user.password_hash)
            .bind(&user.tag)
            .bind(&user.plan)
            .fetch_one(&self.db)
            .await;

        match res {
            Ok(u) => Ok(u),
            Err(sqlx::Error::Database(db_err)) => match db_err.constraint() {
                Some("users_login_key") => Err(CreateUserError::LoginTaken),
                Some("users_email_key") => Err(CreateUserError::EmailTaken),
                _ => Err(anyhow::Error::new(sqlx::Error::Database(db_err))
                    .context("insert user")
                    .into()),
            },
            Err(e) => Err(anyhow::Error::new(e).context("insert user").into()),
        }
    }

    async fn list_users(&self, skip: i64, limit: i64) -> anyhow::Result<Vec<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users ORDER BY id OFFSET $1 LIMIT $2");
        let users = sqlx::query_as::<_, User>(&sql)
            .bind(skip)
            .bind(limit)
            .fetch_all(&self.db)
            .await
            .context("list users")?;
        Ok(users)
    }

    async fn set_recovery_code(
        &self,
        user_id: i64,
        code: Option<&RecoveryCode>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE users
               SET recovery_code_hash = $2,
                   recovery_code_expires_at = $3,
                   updated_at = now()
             WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(code.map(|c| c.hash.as_str()))
        .bind(code.map(|c| c.expires_at))
        .execute(&self.db)
        .await
        .context("set recovery code")?;
        Ok(())
    }

    async fn clear_recovery_code_if(
        &self,
        user_id: i64,
        expected_hash: &str,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE users
               SET recovery_code_hash = NULL,
                   recovery_code_expires_at = NULL,
                   updated_at = now()
             WHERE id = $1 AND recovery_code_hash = $2
            "#,
        )
        .bind(user_id)
        .bind(expected_hash)
        .execute(&self.db)
        .await
        .context("clear recovery code")?;
        Ok(res.rows_affected() == 1)
    }

    async fn reset_password(&self, user_id: i64, password_hash: &str) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE users
               SET password_hash = $2,
                   recovery_code_hash = NULL,
                   recovery_code_expires_at = NULL,
                   updated_at = now()
             WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(password_hash)
        .execute(&self.db)
        .await
        .context("reset password")?;
        Ok(res.rows_affected() == 1)
    }

    async fn insert_refresh_token(&self, token: NewRefreshToken) -> anyhow::Result<RefreshToken> {
        insert_token(&self.db, &token).await
    }

    async fn replace_user_tokens(&self, token: NewRefreshToken) -> anyhow::Result<RefreshToken> {
        let mut tx = self.db.begin().await.context("begin tx")?;
        sqlx::query("UPDATE refresh_tokens SET revoked = TRUE WHERE user_id = $1 AND revoked = FALSE")
            .bind(token.user_id)
            .execute(&mut *tx)
            .await
            .context("revoke user tokens")?;
        let row = insert_token(&mut *tx, &token).await?;
        tx.commit().await.context("commit tx")?;
        Ok(row)
    }

    async fn find_active_refresh_token(
        &self,
        token_hash: &str,
    ) -> anyhow::Result<Option<RefreshToken>> {
        let sql = format!(
            "SELECT {TOKEN_COLUMNS} FROM refresh_tokens WHERE token_hash = $1 AND revoked = FALSE"
        );
        let row = sqlx::query_as::<_, RefreshToken>(&sql)
            .bind(token_hash)
            .fetch_optional(&self.db)
            .await
            .context("find refresh token")?;
        Ok(row)
    }

    async fn touch_refresh_token(
        &self,
        id: Uuid,
        used_at: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE refresh_tokens
               SET last_used_at = $2, expires_at = $3
             WHERE id = $1 AND revoked = FALSE
            "#,
        )
        .bind(id)
        .bind(used_at)
        .bind(expires_at)
        .execute(&self.db)
        .await
        .context("touch refresh token")?;
        Ok(res.rows_affected() == 1)
    }

    async fn revoke_refresh_token(&self, id: Uuid) -> anyhow::Result<()> {
        sqlx::query("UPDATE refresh_tokens SET revoked = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await
            .context("revoke refresh token")?;
        Ok(())
    }

    async fn rotate_refresh_token(
        &self,
        id: Uuid,
        used_at: OffsetDateTime,
        replacement: NewRefreshToken,
    ) -> anyhow::Result<Option<RefreshToken>> {
        let mut tx = self.db.begin().await.context("begin tx")?;
        let res = sqlx::query(
            r#"
            UPDATE refresh_tokens
               SET revoked = TRUE, last_used_at = $2
             WHERE id = $1 AND revoked = FALSE
            "#,
        )
        .bind(id)
        .bind(used_at)
        .execute(&mut *tx)
        .await
        .context("revoke rotated token")?;

        if res.rows_affected() != 1 {
            tx.rollback().await.context("rollback tx")?;
            return Ok(None);
        }

        let row = insert_token(&mut *tx, &replacement).await?;
        tx.commit().await.context("commit tx")?;
        Ok(Some(row))
    }

    async fn revoke_user_tokens(
        &self,
        user_id: i64,
        except_hash: Option<&str>,
    ) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE refresh_tokens
               SET revoked = TRUE
             WHERE user_id = $1
               AND revoked = FALSE
               AND ($2::TEXT IS NULL OR token_hash <> $2)
            "#,
        )
        .bind(user_id)
        .bind(except_hash)
        .execute(&self.db)
        .await
        .context("revoke user tokens")?;
        Ok(res.rows_affected())
    }
}
