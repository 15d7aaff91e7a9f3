// Run one signing-key rotation pass, the same pass the in-server
// scheduler runs. Safe to invoke repeatedly; eligibility is age-based.
// Usage: cargo run --bin rotate_keys -- [realm-id]

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use std::env;

use codeverify::keyvault;
use codeverify::models::KeyPurpose;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args: Vec<String> = env::args().collect();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;

    keyvault::init_keyvault()?;
    let vault = keyvault::get_keyvault();

    if args.len() > 1 {
        // Force-rotate a single realm.
        let realm_id: i64 = args[1].parse().expect("realm-id must be numeric");
        let key = vault.rotate(&pool, realm_id, KeyPurpose::Certificate).await?;
        println!("Rotated certificate key for realm {}: kid {}", realm_id, key.kid);
    } else {
        let rotated = vault.rotation_tick(&pool).await?;
        println!("Rotation pass complete: {} realm(s) rotated", rotated);
    }

    Ok(())
}
