//! SQLite package database
//!
//! Persists packages (as JSON keyed by fingerprint) and the files each one
//! owns. Used as the installed-system database and for on-disk trees.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use cairn_schema::{Package, PackageRef};
use rusqlite::{Connection, OptionalExtension, params};

use super::{DbError, PackageDatabase};

/// Database kept in a single SQLite file, used for installed packages.
#[derive(Debug)]
pub struct SqliteDatabase {
    conn: Mutex<Connection>,
}

impl SqliteDatabase {
    /// Open or create the database at `path`.
    pub fn open_at(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        Self::init(conn)
    }

    /// A database that lives only as long as this handle.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, DbError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS packages (
                fingerprint TEXT PRIMARY KEY,
                category TEXT NOT NULL,
                name TEXT NOT NULL,
                version TEXT NOT NULL,
                data TEXT NOT NULL,
                installed_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS files (
                path TEXT NOT NULL,
                fingerprint TEXT NOT NULL REFERENCES packages(fingerprint) ON DELETE CASCADE,
                PRIMARY KEY (path, fingerprint)
            );

            CREATE INDEX IF NOT EXISTS idx_packages_name ON packages(category, name);
            CREATE INDEX IF NOT EXISTS idx_files_package ON files(fingerprint);
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn decode(rows: Vec<String>) -> Result<Vec<Package>, DbError> {
        rows.iter()
            .map(|data| serde_json::from_str(data).map_err(DbError::from))
            .collect()
    }
}

impl PackageDatabase for SqliteDatabase {
    fn find_packages(&self, category: &str, name: &str) -> Result<Vec<Package>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT data FROM packages WHERE category = ?1 AND name = ?2 ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map(params![category, name], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Self::decode(rows)
    }

    fn find_package(&self, reference: &PackageRef) -> Result<Package, DbError> {
        if reference.is_unversioned() {
            return self
                .find_packages(&reference.category, &reference.name)?
                .into_iter()
                .max_by(|a, b| cairn_schema::compare_versions(&a.version, &b.version))
                .ok_or_else(|| DbError::NotFound(reference.to_string()));
        }

        let conn = self.conn();
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM packages WHERE fingerprint = ?1",
                params![reference.fingerprint()],
                |row| row.get(0),
            )
            .optional()?;

        match data {
            Some(data) => Ok(serde_json::from_str(&data)?),
            None => Err(DbError::NotFound(reference.to_string())),
        }
    }

    fn world(&self) -> Result<Vec<Package>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT data FROM packages ORDER BY rowid")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Self::decode(rows)
    }

    fn create_package(&self, package: &Package) -> Result<String, DbError> {
        let fingerprint = package.fingerprint();
        let data = serde_json::to_string(package)?;
        let now = chrono::Utc::now().timestamp();

        self.conn().execute(
            "INSERT INTO packages (fingerprint, category, name, version, data, installed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(fingerprint) DO UPDATE SET data = excluded.data",
            params![
                fingerprint,
                package.category,
                package.name,
                package.version,
                data,
                now
            ],
        )?;
        Ok(fingerprint)
    }

    fn remove_package(&self, reference: &PackageRef) -> Result<(), DbError> {
        let fingerprint = self.find_package(reference)?.fingerprint();
        let conn = self.conn();
        conn.execute("DELETE FROM files WHERE fingerprint = ?1", params![fingerprint])?;
        conn.execute(
            "DELETE FROM packages WHERE fingerprint = ?1",
            params![fingerprint],
        )?;
        Ok(())
    }

    fn set_package_files(&self, fingerprint: &str, files: &[String]) -> Result<(), DbError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let known: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM packages WHERE fingerprint = ?1",
                params![fingerprint],
                |row| row.get(0),
            )
            .optional()?;
        if known.is_none() {
            return Err(DbError::NotFound(fingerprint.to_string()));
        }

        tx.execute("DELETE FROM files WHERE fingerprint = ?1", params![fingerprint])?;
        {
            let mut stmt =
                tx.prepare("INSERT OR IGNORE INTO files (path, fingerprint) VALUES (?1, ?2)")?;
            for file in files {
                stmt.execute(params![file, fingerprint])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn get_package_files(&self, fingerprint: &str) -> Result<Vec<String>, DbError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT path FROM files WHERE fingerprint = ?1 ORDER BY rowid")?;
        let files = stmt
            .query_map(params![fingerprint], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_world() {
        let dir = tempdir().unwrap();
        let db = SqliteDatabase::open_at(&dir.path().join("system.db")).unwrap();

        let a = Package::new("test", "a", "1.0");
        let b = Package::new("test", "b", "1.0").with_requires([a.to_ref()]);
        db.create_package(&b).unwrap();
        db.create_package(&a).unwrap();

        let world = db.world().unwrap();
        assert_eq!(world, vec![b.clone(), a]);
        assert_eq!(db.find_package(&b.to_ref()).unwrap(), b);
    }

    #[test]
    fn test_persists_across_handles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("system.db");
        {
            let db = SqliteDatabase::open_at(&path).unwrap();
            db.create_package(&Package::new("test", "a", "1.0")).unwrap();
            db.set_package_files("a-test-1.0", &["usr/bin/a".into(), "etc/a.conf".into()])
                .unwrap();
        }

        let db = SqliteDatabase::open_at(&path).unwrap();
        assert_eq!(db.world().unwrap().len(), 1);
        assert_eq!(
            db.get_package_files("a-test-1.0").unwrap(),
            vec!["usr/bin/a", "etc/a.conf"]
        );
    }

    #[test]
    fn test_remove_package() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        let a = Package::new("test", "a", "1.0");
        db.create_package(&a).unwrap();
        db.set_package_files("a-test-1.0", &["usr/bin/a".into()]).unwrap();

        db.remove_package(&PackageRef::any("test", "a")).unwrap();
        assert!(db.world().unwrap().is_empty());
        assert!(db.get_package_files("a-test-1.0").unwrap().is_empty());
        assert!(matches!(
            db.remove_package(&a.to_ref()),
            Err(DbError::NotFound(_))
        ));
    }

    #[test]
    fn test_unversioned_lookup() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.create_package(&Package::new("test", "a", "1.9")).unwrap();
        db.create_package(&Package::new("test", "a", "1.10")).unwrap();

        let found = db.find_package(&PackageRef::any("test", "a")).unwrap();
        assert_eq!(found.version, "1.10");
    }
}
