use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Seeker,
    Provider,
}

impl Role {
    pub fn counterpart(self) -> Role {
        match self {
            Role::Seeker => Role::Provider,
            Role::Provider => Role::Seeker,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Seeker => "seeker",
            Role::Provider => "provider",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "seeker" => Ok(Role::Seeker),
            "provider" => Ok(Role::Provider),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationCategory {
    Town,
    Local,
}

impl DestinationCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            DestinationCategory::Town => "town",
            DestinationCategory::Local => "local",
        }
    }
}

impl FromStr for DestinationCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "town" => Ok(DestinationCategory::Town),
            "local" => Ok(DestinationCategory::Local),
            other => Err(format!("unknown destination category '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// A `(role, destination)` partition of the store. Counterparts subscribe to
/// whole partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub role: Role,
    pub destination: DestinationCategory,
}

impl PartitionKey {
    pub fn new(role: Role, destination: DestinationCategory) -> Self {
        Self { role, destination }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "presence/{}/{}",
            self.role.as_str(),
            self.destination.as_str()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PresencePath {
    pub partition: PartitionKey,
    pub user_id: String,
}

impl PresencePath {
    pub fn new(role: Role, destination: DestinationCategory, user_id: impl Into<String>) -> Self {
        Self {
            partition: PartitionKey::new(role, destination),
            user_id: user_id.into(),
        }
    }
}

impl fmt::Display for PresencePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition, self.user_id)
    }
}

// Wire schema of the store. Nothing else about a user is ever published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    pub role: Role,
    pub destination_category: DestinationCategory,
    pub location: GeoPoint,
    pub updated_at: u64,
}

impl PresenceRecord {
    pub fn path(&self) -> PresencePath {
        PresencePath::new(self.role, self.destination_category, self.user_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_renders_partition_then_user() {
        let path = PresencePath::new(Role::Seeker, DestinationCategory::Town, "u-42");
        assert_eq!(path.to_string(), "presence/seeker/town/u-42");
        assert_eq!(path.partition.to_string(), "presence/seeker/town");
    }

    #[test]
    fn record_serializes_with_lowercase_enums() {
        let record = PresenceRecord {
            user_id: "u-1".into(),
            role: Role::Provider,
            destination_category: DestinationCategory::Local,
            location: GeoPoint::new(52.37, 4.89),
            updated_at: 1_700_000_000_000,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["role"], "provider");
        assert_eq!(json["destination_category"], "local");
        assert_eq!(json["location"]["latitude"], 52.37);
    }

    #[test]
    fn counterpart_flips_role() {
        assert_eq!(Role::Seeker.counterpart(), Role::Provider);
        assert_eq!(Role::Provider.counterpart(), Role::Seeker);
        assert_eq!("Provider".parse::<Role>(), Ok(Role::Provider));
        assert!("driver".parse::<Role>().is_err());
    }

    #[test]
    fn invalid_points_are_rejected() {
        assert!(GeoPoint::new(90.0, -180.0).is_valid());
        assert!(!GeoPoint::new(90.5, 0.0).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
    }
}
