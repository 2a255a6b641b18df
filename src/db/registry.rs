//! Tenant registry: the system database plus one store per tenant.

use super::models::*;
use super::store::*;

use chrono::Utc;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Invalid tenant slug: {0:?}")]
    InvalidSlug(String),
    #[error("Unknown tenant: {0}")]
    UnknownTenant(String),
    #[error("Tenant {0} is not active")]
    Inactive(String),
    #[error("Tenant {0} already exists")]
    AlreadyExists(String),
    #[error(transparent)]
    Db(#[from] DbError),
}

impl From<rusqlite::Error> for RegistryError {
    fn from(e: rusqlite::Error) -> Self {
        RegistryError::Db(DbError::Sqlite(e))
    }
}

fn slug_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,62}$").ok())
        .as_ref()
}

/// Slugs name database files, so they are restricted to a safe alphabet.
pub fn is_valid_slug(slug: &str) -> bool {
    slug_pattern().is_some_and(|re| re.is_match(slug))
}

/// Maps tenant slugs to their isolated stores.
pub struct TenantRegistry {
    data_dir: PathBuf,
    system: Mutex<Connection>,
    stores: Mutex<HashMap<String, Arc<Store>>>,
}

impl TenantRegistry {
    /// Open the registry rooted at `data_dir`, creating `system.db` if needed.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, RegistryError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir).map_err(|e| {
            DbError::Migration(format!("Cannot create {}: {}", data_dir.display(), e))
        })?;

        let conn = Connection::open(data_dir.join("system.db"))?;
        conn.execute_batch(include_str!("../../migrations/system/000001_tenants.up.sql"))
            .map_err(|e| DbError::Migration(format!("System migration 1 failed: {}", e)))?;

        Ok(Self {
            data_dir,
            system: Mutex::new(conn),
            stores: Mutex::new(HashMap::new()),
        })
    }

    fn system(&self) -> Result<std::sync::MutexGuard<'_, Connection>, RegistryError> {
        self.system.lock().map_err(|_| RegistryError::Db(DbError::Poisoned))
    }

    /// Register an active tenant.
    pub fn add_tenant(&self, slug: &str, name: &str) -> Result<Tenant, RegistryError> {
        if !is_valid_slug(slug) {
            return Err(RegistryError::InvalidSlug(slug.to_string()));
        }
        let now = Utc::now();
        let conn = self.system()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO tenants (slug, name, status, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![slug, name, TenantStatus::Active.as_str(), fmt_db_time(now)],
        )?;
        if inserted == 0 {
            return Err(RegistryError::AlreadyExists(slug.to_string()));
        }
        tracing::info!("Registered tenant {}", slug);
        Ok(Tenant {
            slug: slug.to_string(),
            name: name.to_string(),
            status: TenantStatus::Active,
            created_at: now,
        })
    }

    pub fn set_tenant_status(&self, slug: &str, status: TenantStatus) -> Result<(), RegistryError> {
        let conn = self.system()?;
        let n = conn.execute(
            "UPDATE tenants SET status = ?1 WHERE slug = ?2",
            params![status.as_str(), slug],
        )?;
        if n == 0 {
            return Err(RegistryError::UnknownTenant(slug.to_string()));
        }
        Ok(())
    }

    /// Slugs of active tenants, in slug order.
    pub fn list_active_tenants(&self) -> Result<Vec<String>, RegistryError> {
        let conn = self.system()?;
        let mut stmt =
            conn.prepare("SELECT slug FROM tenants WHERE status = ?1 ORDER BY slug")?;
        let slugs = stmt
            .query_map(params![TenantStatus::Active.as_str()], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(slugs)
    }

    /// The store of an active tenant, opened on first use and cached.
    pub fn get_store(&self, slug: &str) -> Result<Arc<Store>, RegistryError> {
        let status: Option<String> = {
            let conn = self.system()?;
            conn.query_row(
                "SELECT status FROM tenants WHERE slug = ?1",
                params![slug],
                |row| row.get(0),
            )
            .optional()?
        };
        match status.as_deref() {
            None => return Err(RegistryError::UnknownTenant(slug.to_string())),
            Some(s) if s != TenantStatus::Active.as_str() => {
                return Err(RegistryError::Inactive(slug.to_string()))
            }
            Some(_) => {}
        }

        let mut stores = self
            .stores
            .lock()
            .map_err(|_| RegistryError::Db(DbError::Poisoned))?;
        if let Some(store) = stores.get(slug) {
            return Ok(store.clone());
        }

        let path = self.data_dir.join(format!("tenant_{}.db", slug));
        let store = Arc::new(Store::new(&path)?);
        tracing::info!("Opened tenant store {} at {}", slug, path.display());
        stores.insert(slug.to_string(), store.clone());
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_validation() {
        assert!(is_valid_slug("acme"));
        assert!(is_valid_slug("acme-prod_2"));
        assert!(!is_valid_slug(""));
        assert!(!is_valid_slug("-acme"));
        assert!(!is_valid_slug("Acme"));
        assert!(!is_valid_slug("../etc"));
        assert!(!is_valid_slug(&"a".repeat(64)));
    }

    #[test]
    fn test_registry_lists_active_and_caches_stores() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TenantRegistry::open(dir.path()).unwrap();
        registry.add_tenant("zeta", "Zeta").unwrap();
        registry.add_tenant("acme", "Acme").unwrap();
        registry.add_tenant("beta", "Beta").unwrap();
        registry.set_tenant_status("beta", TenantStatus::Suspended).unwrap();

        assert_eq!(registry.list_active_tenants().unwrap(), vec!["acme", "zeta"]);
        assert!(matches!(
            registry.add_tenant("acme", "Again"),
            Err(RegistryError::AlreadyExists(_))
        ));

        let a = registry.get_store("acme").unwrap();
        let b = registry.get_store("acme").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(dir.path().join("tenant_acme.db").exists());

        assert!(matches!(
            registry.get_store("beta"),
            Err(RegistryError::Inactive(_))
        ));
        assert!(matches!(
            registry.get_store("nobody"),
            Err(RegistryError::UnknownTenant(_))
        ));
    }

    #[test]
    fn test_tenant_stores_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TenantRegistry::open(dir.path()).unwrap();
        registry.add_tenant("a", "A").unwrap();
        registry.add_tenant("b", "B").unwrap();

        let a = registry.get_store("a").unwrap();
        a.add_server(&Server {
            name: "x".to_string(),
            hostname: "x".to_string(),
            ..Default::default()
        })
        .unwrap();

        let b = registry.get_store("b").unwrap();
        assert_eq!(a.list_servers().unwrap().len(), 1);
        assert!(b.list_servers().unwrap().is_empty());
    }
}
