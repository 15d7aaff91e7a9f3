// Print the OpenAPI document for the HTTP surfaces
// Usage: cargo run --bin generate_openapi > openapi.json

use codeverify::api::ApiDoc;
use utoipa::OpenApi;

fn main() {
    let doc = ApiDoc::openapi();
    println!(
        "{}",
        doc.to_pretty_json().expect("failed to serialize OpenAPI document")
    );
}
