//! 接收者解析
//!
//! 通过 `RecipientResolver` trait 抽象"谁该收到通知"的查询，
//! 分发逻辑只依赖 trait，测试中可替换为 mock，无需真实数据库。

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::instrument;

use crate::error::ResolveError;

/// 接收者解析接口
///
/// 每个方法在引用的记录不存在时返回 [`ResolveError::NotFound`]。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecipientResolver: Send + Sync {
    /// 用户昵称（like / post 的触发者）
    async fn resolve_display_name(&self, user_id: i64) -> Result<String, ResolveError>;

    /// 帖子作者
    async fn resolve_like_owner(&self, post_id: i64) -> Result<i64, ResolveError>;

    /// 关注了该用户的所有用户，可能为空
    async fn resolve_followers(&self, user_id: i64) -> Result<Vec<i64>, ResolveError>;

    /// 关注关系发起者的昵称（follow / unfollow）
    async fn resolve_relation_name(&self, user_id: i64) -> Result<String, ResolveError>;
}

/// 基于 PostgreSQL 的接收者解析实现
///
/// 只读查询社交服务的 users / post / follow 三张表。
/// 上游表的 ID 列可能是 INT4，统一转换为 BIGINT 再解码。
#[derive(Clone)]
pub struct PgRecipientResolver {
    pool: PgPool,
}

impl PgRecipientResolver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn username(&self, user_id: i64, entity: &'static str) -> Result<String, ResolveError> {
        let username: Option<String> =
            sqlx::query_scalar(r#"SELECT username FROM "users" WHERE id = $1"#)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        username.ok_or(ResolveError::NotFound {
            entity,
            id: user_id,
        })
    }
}

#[async_trait]
impl RecipientResolver for PgRecipientResolver {
    #[instrument(skip(self))]
    async fn resolve_display_name(&self, user_id: i64) -> Result<String, ResolveError> {
        self.username(user_id, "users").await
    }

    #[instrument(skip(self))]
    async fn resolve_like_owner(&self, post_id: i64) -> Result<i64, ResolveError> {
        let owner: Option<i64> =
            sqlx::query_scalar(r#"SELECT user_id::BIGINT FROM "post" WHERE id = $1"#)
                .bind(post_id)
                .fetch_optional(&self.pool)
                .await?;

        owner.ok_or(ResolveError::NotFound {
            entity: "post",
            id: post_id,
        })
    }

    #[instrument(skip(self))]
    async fn resolve_followers(&self, user_id: i64) -> Result<Vec<i64>, ResolveError> {
        let followers: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT follower_id::BIGINT AS follower_id
            FROM "follow"
            WHERE following_id = $1
            ORDER BY follower_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(followers)
    }

    #[instrument(skip(self))]
    async fn resolve_relation_name(&self, user_id: i64) -> Result<String, ResolveError> {
        self.username(user_id, "follower").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify_shared::config::DatabaseConfig;
    use notify_shared::database::Database;

    #[tokio::test]
    #[ignore] // 需要数据库连接
    async fn test_unknown_post_is_not_found() {
        let db = Database::connect(&DatabaseConfig::default()).await.unwrap();
        let resolver = PgRecipientResolver::new(db.pool().clone());

        let err = resolver.resolve_like_owner(i64::MAX).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    #[ignore] // 需要数据库连接
    async fn test_unknown_user_has_no_followers() {
        let db = Database::connect(&DatabaseConfig::default()).await.unwrap();
        let resolver = PgRecipientResolver::new(db.pool().clone());

        let followers = resolver.resolve_followers(i64::MAX).await.unwrap();
        assert!(followers.is_empty());
    }
}
