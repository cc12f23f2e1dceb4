// Integration test suite for the mahilo registry
//
// Organized into focused modules by feature area.
// Each module tests a specific API surface.
// All modules share the common::TestClient for DB lifecycle management.


mod auth;
mod friends;
mod group_messages;
mod policies;
mod preferences;
mod roles;
