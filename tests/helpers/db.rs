use perigee::settings;
use perigee::storage;
use sea_orm::DatabaseConnection;
use tempfile::NamedTempFile;

/// Test database with automatic cleanup
pub struct TestDb {
    connection: DatabaseConnection,
    _temp_file: NamedTempFile,
}

impl TestDb {
    /// Create a new test database with the schema bootstrapped
    pub async fn new() -> Self {
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let db_path = temp_file.path().to_str().expect("Invalid temp file path");
        let cfg = settings::Database {
            url: format!("sqlite://{}?mode=rwc", db_path),
        };

        let connection = storage::init(&cfg)
            .await
            .expect("Failed to init test database");

        Self {
            connection,
            _temp_file: temp_file,
        }
    }

    /// Get database connection
    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }
}

/// Create a test OAuth client for testing
pub async fn seed_test_client(db: &DatabaseConnection) -> storage::Client {
    storage::create_client(
        db,
        storage::NewClient {
            client_name: Some("Test Device App".to_string()),
            redirect_uris: vec![],
        },
        0,
    )
    .await
    .expect("Failed to create test client")
}
