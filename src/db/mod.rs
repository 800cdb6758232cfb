//! Database pool setup and schema bootstrap (ADDED ambient, §3.1).
//!
//! A single `sqlx::AnyPool` backs both the metadata tables and the application audit tables
//! (§6), selected by `database_url` scheme — `postgres://` or `sqlite://` — mirroring
//! `nuniesmith-audit`'s dual postgres+sqlite feature set so this core is exercisable against an
//! embedded SQLite file in tests without a live Postgres server.

pub mod models;

use sqlx::any::{install_default_drivers, AnyPoolOptions};
use sqlx::AnyPool;

use crate::error::CoreResult;

pub const SCHEMA_VERSION: i64 = 1;

pub async fn connect(database_url: &str) -> CoreResult<AnyPool> {
    install_default_drivers();
    let pool = AnyPoolOptions::new()
        .max_connections(8)
        .connect(database_url)
        .await?;
    bootstrap_schema(&pool).await?;
    Ok(pool)
}

/// Create `schema_version` and every metadata table if absent. Idempotent — safe to call on
/// every connect.
pub async fn bootstrap_schema(pool: &AnyPool) -> CoreResult<()> {
    sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)")
        .execute(pool)
        .await?;
    let row: Option<(i64,)> = sqlx::query_as("SELECT version FROM schema_version LIMIT 1")
        .fetch_optional(pool)
        .await?;
    if row.is_none() {
        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(SCHEMA_VERSION)
            .execute(pool)
            .await?;
    }

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS cohort (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            cohort_name TEXT NOT NULL UNIQUE
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS subject (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            subject_code TEXT NOT NULL UNIQUE,
            patient_id TEXT NOT NULL,
            patient_name TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS subject_cohorts (
            subject_id INTEGER NOT NULL,
            cohort_id INTEGER NOT NULL,
            UNIQUE(subject_id, cohort_id)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS study (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            study_instance_uid TEXT NOT NULL UNIQUE,
            subject_id INTEGER NOT NULL,
            study_fields TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS series (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            series_instance_uid TEXT NOT NULL UNIQUE,
            study_id INTEGER NOT NULL,
            subject_id INTEGER NOT NULL,
            modality TEXT NOT NULL,
            series_fields TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS instance (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sop_instance_uid TEXT NOT NULL UNIQUE,
            series_id INTEGER NOT NULL,
            series_stack_id INTEGER,
            rel_path TEXT NOT NULL,
            instance_fields TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS mri_series_details (
            series_id INTEGER PRIMARY KEY,
            repetition_time REAL,
            echo_time REAL,
            flip_angle REAL,
            magnetic_field_strength REAL,
            inversion_time REAL,
            echo_numbers TEXT,
            echo_train_length TEXT,
            receive_coil_name TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS ct_series_details (
            series_id INTEGER PRIMARY KEY,
            kvp REAL,
            tube_current REAL,
            xray_exposure TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS pet_series_details (
            series_id INTEGER PRIMARY KEY,
            pet_bed_index TEXT,
            pet_frame_type TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS series_stack (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            series_id INTEGER NOT NULL,
            stack_index INTEGER NOT NULL,
            stack_key TEXT,
            stack_modality TEXT NOT NULL,
            stack_echo_time REAL,
            stack_inversion_time REAL,
            stack_echo_numbers TEXT,
            stack_echo_train_length TEXT,
            stack_repetition_time REAL,
            stack_flip_angle REAL,
            stack_receive_coil_name TEXT,
            stack_xray_exposure TEXT,
            stack_kvp REAL,
            stack_tube_current REAL,
            stack_pet_bed_index TEXT,
            stack_pet_frame_type TEXT,
            stack_image_orientation TEXT NOT NULL,
            stack_orientation_confidence REAL NOT NULL,
            stack_image_type TEXT,
            stack_n_instances INTEGER NOT NULL,
            UNIQUE(series_id, stack_index)
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}
