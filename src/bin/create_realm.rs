// Utility to create a realm
// Usage: cargo run --bin create_realm -- <name> [region] [test-types]

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use std::env;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <name> [region] [test-types]", args[0]);
        eprintln!();
        eprintln!("Examples:");
        eprintln!("  {} \"State of Examplia\"", args[0]);
        eprintln!("  {} \"State of Examplia\" US confirmed,likely", args[0]);
        eprintln!();
        eprintln!("Test types: confirmed, likely, negative, user-report");
        std::process::exit(1);
    }

    let name = &args[1];
    let region = if args.len() > 2 { &args[2] } else { "US" };
    let test_types: Vec<String> = if args.len() > 3 {
        args[3].split(',').map(|s| s.trim().to_string()).collect()
    } else {
        vec!["confirmed".to_string()]
    };

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;

    let realm_id: i64 = sqlx::query_scalar(
        "INSERT INTO realms (name, region_code, allowed_test_types)
         VALUES ($1, $2, $3)
         RETURNING id",
    )
    .bind(name)
    .bind(region)
    .bind(&test_types)
    .fetch_one(&pool)
    .await?;

    println!("Created realm {} ({})", realm_id, name);
    println!("  region:     {}", region);
    println!("  test types: {}", test_types.join(", "));
    println!();
    println!("Next: create API keys with `create_api_key {} admin` and", realm_id);
    println!("`create_api_key {} device`.", realm_id);

    Ok(())
}
