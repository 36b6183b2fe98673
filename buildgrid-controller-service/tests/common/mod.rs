use std::sync::Arc;

use buildgrid_common::config::{DbConfig, DbSqliteConfig};
use buildgrid_controller_service::api;
use buildgrid_controller_service::api::middleware::CorrelationIdMiddleware;
use buildgrid_controller_service::config::ControllerServiceConfig;
use buildgrid_controller_service::db;
use buildgrid_controller_service::repo::build::{BuildRepo, DbBuildRepo};
use buildgrid_controller_service::repo::build_log::{BuildLogRepo, DbBuildLogRepo};
use buildgrid_controller_service::repo::token::{DbTokenRepo, TokenRepo};
use buildgrid_controller_service::repo::worker::{DbWorkerRepo, WorkerRepo};
use buildgrid_controller_service::service::Services;
use poem::test::TestClient;
use poem::{Endpoint, EndpointExt};
use tempfile::TempDir;

pub const TEST_ADMIN_KEY: &str = "test-admin-key";

pub struct TestDeps {
    pub services: Services,
    pub config: ControllerServiceConfig,
    _data_dir: TempDir,
}

pub async fn test_deps() -> TestDeps {
    test_deps_with(|_| {}).await
}

/// Boots a full controller against a temp-file SQLite database and a temp
/// artifact root. `customize` runs before services are wired, so tests can
/// shrink caps or TTLs.
pub async fn test_deps_with(customize: impl FnOnce(&mut ControllerServiceConfig)) -> TestDeps {
    let data_dir = tempfile::tempdir().expect("Failed to create temp dir");

    let mut config = ControllerServiceConfig {
        db: DbConfig::Sqlite(DbSqliteConfig {
            database: data_dir
                .path()
                .join("controller.sqlite")
                .display()
                .to_string(),
            max_connections: 10,
        }),
        ..ControllerServiceConfig::default()
    };
    config.storage.root = data_dir.path().join("artifacts");
    config.auth.admin_key = TEST_ADMIN_KEY.to_string();
    customize(&mut config);

    let DbConfig::Sqlite(sqlite_config) = &config.db else {
        panic!("test deps always run on sqlite");
    };
    db::sqlite_migrate(sqlite_config)
        .await
        .expect("Failed to migrate test database");

    let services = Services::new(&config)
        .await
        .expect("Failed to wire services");

    TestDeps {
        services,
        config,
        _data_dir: data_dir,
    }
}

pub fn test_client(services: &Services) -> TestClient<impl Endpoint> {
    TestClient::new(api::combined_routes(services).with(CorrelationIdMiddleware))
}

pub struct RepoDeps {
    pub build_repo: Arc<dyn BuildRepo>,
    pub worker_repo: Arc<dyn WorkerRepo>,
    pub token_repo: Arc<dyn TokenRepo>,
    pub build_log_repo: Arc<dyn BuildLogRepo>,
    _data_dir: TempDir,
}

pub async fn repo_deps() -> RepoDeps {
    let data_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let sqlite_config = DbSqliteConfig {
        database: data_dir.path().join("repo.sqlite").display().to_string(),
        max_connections: 10,
    };
    db::sqlite_migrate(&sqlite_config)
        .await
        .expect("Failed to migrate test database");
    let pool = Arc::new(
        db::create_sqlite_pool(&sqlite_config)
            .await
            .expect("Failed to create test pool"),
    );

    RepoDeps {
        build_repo: Arc::new(DbBuildRepo::new(pool.clone())),
        worker_repo: Arc::new(DbWorkerRepo::new(pool.clone())),
        token_repo: Arc::new(DbTokenRepo::new(pool.clone())),
        build_log_repo: Arc::new(DbBuildLogRepo::new(pool.clone())),
        _data_dir: data_dir,
    }
}

pub const MULTIPART_BOUNDARY: &str = "buildgrid-test-boundary";

/// Hand-rolled multipart body: (field name, optional file name, bytes).
pub fn multipart_body(parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, file_name, bytes) in parts {
        body.extend_from_slice(format!("--{MULTIPART_BOUNDARY}\r\n").as_bytes());
        match file_name {
            Some(file_name) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\n\r\n"
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
            ),
        }
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{MULTIPART_BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn multipart_content_type() -> String {
    format!("multipart/form-data; boundary={MULTIPART_BOUNDARY}")
}

/// A credential bundle in the shape the controller expects: one signing key,
/// one password file, zero or more provisioning profiles.
pub async fn credentials_zip(key: &[u8], password: &str, profiles: &[&[u8]]) -> Vec<u8> {
    use async_zip::tokio::write::ZipFileWriter;
    use async_zip::{Compression, ZipEntryBuilder};

    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let zip_path = temp_dir.path().join("bundle.zip");
    let zip_file = tokio::fs::File::create(&zip_path)
        .await
        .expect("Failed to create zip file");
    let mut writer = ZipFileWriter::with_tokio(zip_file);

    writer
        .write_entry_whole(
            ZipEntryBuilder::new("cert.p12".to_string().into(), Compression::Deflate),
            key,
        )
        .await
        .expect("Failed to write key entry");
    writer
        .write_entry_whole(
            ZipEntryBuilder::new("password.txt".to_string().into(), Compression::Deflate),
            password.as_bytes(),
        )
        .await
        .expect("Failed to write password entry");
    for (index, profile) in profiles.iter().enumerate() {
        writer
            .write_entry_whole(
                ZipEntryBuilder::new(
                    format!("profiles/profile-{index}.mobileprovision").into(),
                    Compression::Deflate,
                ),
                profile,
            )
            .await
            .expect("Failed to write profile entry");
    }
    writer.close().await.expect("Failed to finish zip");

    tokio::fs::read(&zip_path)
        .await
        .expect("Failed to read zip bytes")
}
