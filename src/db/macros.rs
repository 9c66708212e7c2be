//! Database dispatch macros for reducing code duplication.
//!
//! `DbPool` methods repeat the same body per backend because sqlx pools are
//! distinct types. The macro keeps those match arms short and linear.

/// Macro for generating database dispatch match arms.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(pool, {
///     Postgres(p) => p.close().await,
///     SQLite(p) => p.close().await,
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($pool:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $pool {
            $(
                $crate::db::pool::DbPool::$variant($p) => $body,
            )+
        }
    };
}

pub use impl_db_dispatch;

#[cfg(test)]
mod tests {
    use crate::db::pool::DbPool;
    use crate::models::BackendKind;
    use sqlx::SqlitePool;

    fn backend_name(pool: &DbPool) -> &'static str {
        impl_db_dispatch!(pool, {
            Postgres(_p) => "postgres",
            SQLite(_p) => "sqlite",
        })
    }

    #[tokio::test]
    async fn test_dispatch_selects_variant() {
        let pool = DbPool::SQLite(SqlitePool::connect_lazy("sqlite::memory:").unwrap());
        assert_eq!(backend_name(&pool), "sqlite");
        assert_eq!(pool.backend(), BackendKind::SQLite);
    }
}
