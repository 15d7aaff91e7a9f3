// Utility to create API keys
// Usage: cargo run --bin create_api_key -- <realm-id> <type> [name]

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use std::env;

use codeverify::models::ApiKeyType;
use codeverify::{apikey, secrets};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <realm-id> <type> [name]", args[0]);
        eprintln!();
        eprintln!("Examples:");
        eprintln!("  {} 1 admin", args[0]);
        eprintln!("  {} 1 device \"ios app\"", args[0]);
        eprintln!();
        eprintln!("Types: admin, device, stats");
        std::process::exit(1);
    }

    let realm_id: i64 = args[1].parse().expect("realm-id must be numeric");
    let key_type = match args[2].as_str() {
        "admin" => ApiKeyType::Admin,
        "device" => ApiKeyType::Device,
        "stats" => ApiKeyType::Stats,
        other => {
            eprintln!("Unknown key type: {}", other);
            std::process::exit(1);
        }
    };
    let name = if args.len() > 3 { &args[3] } else { "cli" };

    secrets::init_secrets()?;

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;

    let (plaintext, key) =
        apikey::create(&pool, secrets::get_secrets(), realm_id, key_type, name).await?;

    println!("Created API key {} for realm {}", key.id, realm_id);
    println!();
    println!("  {}", plaintext);
    println!();
    println!("Store it now; the plaintext is not recoverable.");

    Ok(())
}
