use std::fs;

use sqlx::{Connection, PgConnection};
use tempfile::tempdir;
use uuid::Uuid;
use vatload_storage::{PgSession, StatementSet};
use vatload_sync::{DatasetsFile, LoadPipeline};

const CONTENTS: &str = "ID\tTAX_CALCULATION_DATE\tAMOUNT\n1\t01-02-2024\t10.50\n2\t31-12-2023\t7.00\n";

#[cfg(unix)]
fn open_up(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod");
}

#[cfg(not(unix))]
fn open_up(_path: &std::path::Path) {}

// COPY FROM reads the corrected file on the server, so the database must share this filesystem.
#[tokio::test]
#[ignore = "needs VATLOAD_TEST_DATABASE_URL pointing at a local PostgreSQL allowed to read server files"]
async fn loading_twice_through_postgres_merges_once() {
    let Ok(url) = std::env::var("VATLOAD_TEST_DATABASE_URL") else {
        return;
    };
    let suffix = Uuid::new_v4().simple().to_string();
    let staging = format!("vatload_stage_{suffix}");
    let permanent = format!("vatload_final_{suffix}");

    let mut admin = PgConnection::connect(&url).await.expect("connect");
    let ddl = format!(
        r#"CREATE TABLE "{staging}" ("ID" bigint, "TAX_CALCULATION_DATE" date, "AMOUNT" numeric(12,2),
                                     row_sequence bigint, row_fingerprint text);
           CREATE TABLE "{permanent}" ("ID" bigint, "TAX_CALCULATION_DATE" date, "AMOUNT" numeric(12,2),
                                       row_fingerprint text);"#
    );
    sqlx::raw_sql(&ddl).execute(&mut admin).await.expect("create tables");

    let dir = tempdir().expect("tempdir");
    let folder = dir.path().join("jcom2");
    fs::create_dir(&folder).expect("mkdir");
    open_up(dir.path());
    open_up(&folder);

    let datasets = DatasetsFile::parse(&format!(
        "date_columns: [TAX_CALCULATION_DATE]\n\
         datasets:\n  \
           - name: jcom2\n    \
             source_folder: jcom2\n    \
             staging_table: {staging}\n    \
             permanent_table: {permanent}\n    \
             identity_columns: [ID]\n"
    ))
    .expect("datasets");
    let statements = StatementSet::postgres_defaults().expect("templates");
    let pipeline = LoadPipeline::new(&datasets, statements, dir.path());

    let mut merged = Vec::new();
    for _ in 0..2 {
        fs::write(folder.join("report.txt"), CONTENTS).expect("write source");
        let session = PgSession::connect(&url).await.expect("session");
        let summary = pipeline.run_and_close(session).await;
        assert_eq!(summary.files_cleaned(), 1, "{:#?}", summary.datasets);
        merged.push(summary.rows_merged());
    }

    let count: i64 = sqlx::query_scalar(&format!(r#"SELECT count(*) FROM "{permanent}""#))
        .fetch_one(&mut admin)
        .await
        .expect("count");
    let dates: Vec<String> = sqlx::query_scalar(&format!(
        r#"SELECT "TAX_CALCULATION_DATE"::text FROM "{permanent}" ORDER BY "ID""#
    ))
    .fetch_all(&mut admin)
    .await
    .expect("dates");

    sqlx::raw_sql(&format!(r#"DROP TABLE "{staging}"; DROP TABLE "{permanent}";"#))
        .execute(&mut admin)
        .await
        .expect("drop tables");

    assert_eq!(merged, vec![2, 0]);
    assert_eq!(count, 2);
    assert_eq!(dates, vec!["2024-02-01", "2023-12-31"]);
}
