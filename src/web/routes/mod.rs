pub mod health;
pub mod location;
pub mod matches;
pub mod session;
