//! Vehicles, drivers and users as seen by the booking engine.
//!
//! Records are owned by the fleet catalog service; the engine only asks
//! whether an id exists and is still active. A user's role lives here, not
//! in anything the client sends.

use std::path::Path;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::Role;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: Ulid,
    #[serde(default)]
    pub plate: String,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Driver {
    pub id: Ulid,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

/// A member of staff who may connect. The role decides what they may do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    #[serde(default)]
    pub name: String,
    pub role: Role,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

pub trait ResourceRegistry: Send + Sync {
    /// Look up a vehicle, active or not.
    fn vehicle(&self, id: &Ulid) -> Option<Vehicle>;

    /// Look up a driver, active or not.
    fn driver(&self, id: &Ulid) -> Option<Driver>;

    /// Look up a user, active or not.
    fn user(&self, id: &Ulid) -> Option<User>;
}

/// Snapshot file format: `{"vehicles": [...], "drivers": [...], "users": [...]}`.
#[derive(Debug, Default, Deserialize)]
struct RegistrySeed {
    #[serde(default)]
    vehicles: Vec<Vehicle>,
    #[serde(default)]
    drivers: Vec<Driver>,
    #[serde(default)]
    users: Vec<User>,
}

#[derive(Debug)]
pub enum RegistryError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::Io(e) => write!(f, "registry file: {e}"),
            RegistryError::Parse(e) => write!(f, "registry file is not valid JSON: {e}"),
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    vehicles: DashMap<Ulid, Vehicle>,
    drivers: DashMap<Ulid, Driver>,
    users: DashMap<Ulid, User>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a JSON snapshot exported by the catalog service.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let raw = std::fs::read_to_string(path).map_err(RegistryError::Io)?;
        let seed: RegistrySeed = serde_json::from_str(&raw).map_err(RegistryError::Parse)?;
        let registry = Self::new();
        for v in seed.vehicles {
            registry.upsert_vehicle(v);
        }
        for d in seed.drivers {
            registry.upsert_driver(d);
        }
        for u in seed.users {
            registry.upsert_user(u);
        }
        Ok(registry)
    }

    pub fn upsert_vehicle(&self, vehicle: Vehicle) {
        self.vehicles.insert(vehicle.id, vehicle);
    }

    pub fn upsert_driver(&self, driver: Driver) {
        self.drivers.insert(driver.id, driver);
    }

    pub fn upsert_user(&self, user: User) {
        self.users.insert(user.id, user);
    }

    /// Soft delete: the vehicle stays on past bookings but can't be newly assigned.
    pub fn deactivate_vehicle(&self, id: &Ulid) -> bool {
        match self.vehicles.get_mut(id) {
            Some(mut v) => {
                v.active = false;
                true
            }
            None => false,
        }
    }

    pub fn deactivate_driver(&self, id: &Ulid) -> bool {
        match self.drivers.get_mut(id) {
            Some(mut d) => {
                d.active = false;
                true
            }
            None => false,
        }
    }

    pub fn deactivate_user(&self, id: &Ulid) -> bool {
        match self.users.get_mut(id) {
            Some(mut u) => {
                u.active = false;
                true
            }
            None => false,
        }
    }

    /// Record counts as (vehicles, drivers, users), for the startup log.
    pub fn counts(&self) -> (usize, usize, usize) {
        (self.vehicles.len(), self.drivers.len(), self.users.len())
    }
}

impl ResourceRegistry for InMemoryRegistry {
    fn vehicle(&self, id: &Ulid) -> Option<Vehicle> {
        self.vehicles.get(id).map(|e| e.value().clone())
    }

    fn driver(&self, id: &Ulid) -> Option<Driver> {
        self.drivers.get(id).map(|e| e.value().clone())
    }

    fn user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|e| e.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("fleetbook_test_registry");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn load_seed_file() {
        let path = tmp_path("seed.json");
        let vid = Ulid::new();
        let did = Ulid::new();
        let uid = Ulid::new();
        fs::write(
            &path,
            format!(
                r#"{{"vehicles": [{{"id": "{vid}", "plate": "ABC1D23", "model": "Strada"}}],
                    "drivers": [{{"id": "{did}", "name": "Ana", "active": false}}],
                    "users": [{{"id": "{uid}", "name": "Sari", "role": "MANAGER"}}]}}"#
            ),
        )
        .unwrap();

        let registry = InMemoryRegistry::load(&path).unwrap();
        assert_eq!(registry.counts(), (1, 1, 1));
        let user = registry.user(&uid).unwrap();
        assert_eq!(user.role, Role::Manager);
        assert!(user.active);
        let v = registry.vehicle(&vid).unwrap();
        assert!(v.active); // defaults to active
        assert_eq!(v.plate, "ABC1D23");
        assert!(!registry.driver(&did).unwrap().active);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn user_without_role_is_rejected() {
        let path = tmp_path("roleless.json");
        fs::write(&path, format!(r#"{{"users": [{{"id": "{}"}}]}}"#, Ulid::new())).unwrap();
        assert!(matches!(InMemoryRegistry::load(&path), Err(RegistryError::Parse(_))));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn load_rejects_garbage() {
        let path = tmp_path("garbage.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(InMemoryRegistry::load(&path), Err(RegistryError::Parse(_))));
        let _ = fs::remove_file(&path);

        assert!(matches!(
            InMemoryRegistry::load(&tmp_path("missing.json")),
            Err(RegistryError::Io(_))
        ));
    }

    #[test]
    fn deactivate_keeps_record() {
        let registry = InMemoryRegistry::new();
        let id = Ulid::new();
        registry.upsert_vehicle(Vehicle {
            id,
            plate: "XYZ9876".into(),
            model: "Hilux".into(),
            active: true,
        });
        assert!(registry.deactivate_vehicle(&id));
        assert!(!registry.vehicle(&id).unwrap().active);
        assert!(!registry.deactivate_vehicle(&Ulid::new()));

        let uid = Ulid::new();
        registry.upsert_user(User {
            id: uid,
            name: "Dewi".into(),
            role: Role::User,
            active: true,
        });
        assert!(registry.deactivate_user(&uid));
        assert!(!registry.user(&uid).unwrap().active);
    }
}
