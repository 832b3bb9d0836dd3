use dotenvy::dotenv;
use std::env;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use nearby::config::SubscriptionConfig;
use nearby::database::{MemoryPresenceStore, PresenceStore, RestPresenceStore, SqlitePresenceStore};
use nearby::models::{DestinationCategory, EventBus, GeoPoint, PartitionKey, Role};
use nearby::services::counterpart_subscription_service::CounterpartSubscription;
use nearby::services::proximity_service;

#[tokio::main]
async fn main() {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let role: Role = env::var("WATCH_ROLE")
        .unwrap_or_else(|_| "provider".to_string())
        .parse()
        .unwrap_or_else(|e| {
            eprintln!("{}", e);
            std::process::exit(2);
        });
    let destination: DestinationCategory = env::var("WATCH_DESTINATION")
        .unwrap_or_else(|_| "town".to_string())
        .parse()
        .unwrap_or_else(|e| {
            eprintln!("{}", e);
            std::process::exit(2);
        });
    let viewer = env::var("WATCH_LAT")
        .ok()
        .and_then(|v| v.parse().ok())
        .zip(env::var("WATCH_LON").ok().and_then(|v| v.parse().ok()))
        .map(|(lat, lon)| GeoPoint::new(lat, lon));
    let radius_km: f64 = env::var("WATCH_RADIUS_KM")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5.0);

    let store: Arc<dyn PresenceStore> = match env::var("PRESENCE_STORE").as_deref() {
        Ok("sqlite") => {
            let db_url = env::var("DATABASE_URL").expect("DATABASE_URL is required");
            match SqlitePresenceStore::connect(&db_url).await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    eprintln!("presence database unavailable: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Ok("rest") => Arc::new(RestPresenceStore::from_env().expect("PRESENCE_REST_URL is required")),
        _ => Arc::new(MemoryPresenceStore::new()),
    };

    let partition = PartitionKey::new(role, destination);
    let subscription = CounterpartSubscription::spawn(
        store,
        partition,
        "presence-watch",
        SubscriptionConfig::from_env(),
        EventBus::default(),
    );
    let mut entities = subscription.entities();
    println!("watching {}", partition);

    loop {
        tokio::select! {
            changed = entities.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = entities.borrow_and_update().clone();
                match viewer.map(|v| proximity_service::filter_sorted(v, radius_km, &snapshot)) {
                    Some(Ok(ranked)) => {
                        let nearest = ranked
                            .first()
                            .map(|r| format!("{:.2} km", r.distance_km))
                            .unwrap_or_else(|| "-".to_string());
                        println!(
                            "{}: {} online, {} within {} km, nearest {}",
                            partition,
                            snapshot.len(),
                            ranked.len(),
                            radius_km,
                            nearest
                        );
                    }
                    Some(Err(e)) => {
                        eprintln!("{}", e);
                        std::process::exit(2);
                    }
                    None => println!("{}: {} online", partition, snapshot.len()),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
}
