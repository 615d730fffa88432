/// Row store configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// PostgreSQL connection string, required by [`PostgresRowStore::connect`].
    ///
    /// [`PostgresRowStore::connect`]: crate::PostgresRowStore::connect
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl StoreConfig {
    /// Loads configuration from environment variables with sensible defaults.
    ///
    /// - `DATABASE_URL` (no default)
    /// - `DATABASE_MAX_CONNECTIONS` (default: 5)
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
        }
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 5,
        }
    }
}
