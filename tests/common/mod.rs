#![allow(dead_code)]

use asp_exchange::db::{self, NewHiring, Pool};
use asp_exchange::filename::feedback_filename;
use asp_exchange::records;
use asp_exchange::transport::{MemoryTransport, RemoteDir};
use chrono::{Duration, NaiveDate, Utc};
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;

pub const SIRET: &str = "12345678900012";

pub async fn setup_pool() -> Pool {
    // One connection: each new in-memory connection would be a fresh database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

pub fn person() -> Value {
    json!({"sufPassIae": "999990000001", "nomUsage": "DOE", "prenom": "JANE"})
}

pub struct Seeded {
    pub company_id: i64,
    pub approval_id: i64,
    pub hiring_id: i64,
    pub record_id: i64,
}

/// Company, approval, hiring and the NEW record created from it.
pub async fn seed_with(
    pool: &Pool,
    approval_number: &str,
    start_at: NaiveDate,
    end_at: NaiveDate,
    address: Option<Value>,
) -> Seeded {
    let now = Utc::now();
    let company_id = db::insert_company(pool, SIRET, "ACI", Some(10), None)
        .await
        .unwrap();
    let approval_id = db::insert_approval(pool, approval_number, start_at, end_at, now)
        .await
        .unwrap();
    let hiring_id = db::insert_hiring(
        pool,
        &NewHiring {
            approval_id: Some(approval_id),
            company_id,
            person: Some(person()),
            address,
            situation: Some(json!({"orienteur": "PE", "salarieEnEmploi": false})),
        },
        now,
    )
    .await
    .unwrap();
    let record = records::create_from_hiring(pool, hiring_id, now).await.unwrap();
    Seeded {
        company_id,
        approval_id,
        hiring_id,
        record_id: record.id,
    }
}

/// A NEW record whose approval is currently valid.
pub async fn seed(pool: &Pool, approval_number: &str) -> Seeded {
    seed_with(
        pool,
        approval_number,
        today() - Duration::days(100),
        today() + Duration::days(300),
        Some(json!({"codePostal": "75001", "libelleCommune": "PARIS"})),
    )
    .await
}

/// Same, already READY for upload.
pub async fn seed_ready(pool: &Pool, approval_number: &str) -> Seeded {
    let seeded = seed(pool, approval_number).await;
    records::ready(pool, seeded.record_id, None, Utc::now())
        .await
        .unwrap();
    seeded
}

pub fn feedback_body(movement: &str, lines: &[(i64, &str, &str)]) -> Vec<u8> {
    let lines: Vec<Value> = lines
        .iter()
        .map(|(num, code, label)| {
            json!({
                "numLigne": num,
                "typeMouvement": movement,
                "siret": SIRET,
                "mesure": "ACI_DC",
                "codeTraitement": code,
                "libelleTraitement": label,
            })
        })
        .collect();
    serde_json::to_vec(&json!({
        "msgInformatif": null,
        "telId": null,
        "lignesTelechargement": lines,
    }))
    .unwrap()
}

/// Drops ASP's answer to `upload_name` in the withdrawal directory.
pub fn answer(transport: &MemoryTransport, upload_name: &str, body: Vec<u8>) -> String {
    let name = feedback_filename(upload_name).unwrap();
    transport.put(RemoteDir::Withdrawal, &name, body);
    name
}
