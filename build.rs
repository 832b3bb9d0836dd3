use std::time::{SystemTime, UNIX_EPOCH};

fn main() {
    // Marker so a running bridge can report which build it is; surfaced by
    // /api/health.
    let build_id = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "dev".to_string());
    println!("cargo:rustc-env=NEARBY_BUILD_ID={}", build_id);
}
