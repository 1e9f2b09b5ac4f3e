// src/migrations.rs

use crate::error::{LedgerError, Result};
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use tracing::info;

pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

/// Ordered schema history. Applied migrations must never be edited.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_catalog",
        sql: "CREATE TABLE products (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code TEXT NOT NULL UNIQUE,
                short_code TEXT,
                description TEXT NOT NULL,
                stock INTEGER NOT NULL DEFAULT 0 CHECK (stock >= 0),
                category TEXT NOT NULL DEFAULT 'consumable'
                    CHECK (category IN ('tool', 'consumable')),
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX idx_products_short_code ON products(short_code);
            CREATE INDEX idx_products_category ON products(category);",
    },
    Migration {
        version: 2,
        name: "create_supplier_codes",
        // product_id is deliberately not a foreign key: mappings outlive deleted products
        sql: "CREATE TABLE supplier_codes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                supplier_id TEXT NOT NULL,
                supplier_code TEXT NOT NULL,
                product_id INTEGER NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                UNIQUE (supplier_id, supplier_code)
            );
            CREATE INDEX idx_supplier_codes_product ON supplier_codes(product_id);",
    },
    Migration {
        version: 3,
        name: "create_pending_batches",
        sql: "CREATE TABLE pending_batches (
                batch_id TEXT PRIMARY KEY,
                issuer_id TEXT NOT NULL,
                items TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX idx_pending_batches_created_at ON pending_batches(created_at);",
    },
];

/// Hex SHA-256 of a migration body.
pub fn checksum(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Apply every migration not yet recorded, validating the checksums of those that are.
/// Returns the number of migrations applied by this call.
pub fn run(conn: &mut Connection, migrations: &[Migration]) -> Result<usize> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            checksum TEXT NOT NULL,
            applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let mut applied = 0;
    for migration in migrations {
        let current = checksum(migration.sql);
        let stored: Option<String> = conn
            .query_row(
                "SELECT checksum FROM schema_migrations WHERE version = ?1",
                params![migration.version],
                |row| row.get(0),
            )
            .optional()?;

        match stored {
            Some(stored) if stored == current => continue,
            Some(stored) => {
                return Err(LedgerError::MigrationChecksum {
                    version: migration.version,
                    stored,
                    current,
                });
            }
            None => {
                let tx = conn.transaction()?;
                tx.execute_batch(migration.sql)?;
                tx.execute(
                    "INSERT INTO schema_migrations (version, name, checksum) VALUES (?1, ?2, ?3)",
                    params![migration.version, migration.name, current],
                )?;
                tx.commit()?;
                info!(version = migration.version, name = migration.name, "Migration applied");
                applied += 1;
            }
        }
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_stable() {
        assert_eq!(checksum("SELECT 1"), checksum("SELECT 1"));
        assert_ne!(checksum("SELECT 1"), checksum("SELECT 2"));
    }

    #[test]
    fn test_run_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(run(&mut conn, MIGRATIONS).unwrap(), MIGRATIONS.len());
        assert_eq!(run(&mut conn, MIGRATIONS).unwrap(), 0);

        let recorded: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(recorded, MIGRATIONS.len() as i64);
    }

    #[test]
    fn test_edited_migration_is_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        let original = [Migration {
            version: 1,
            name: "t",
            sql: "CREATE TABLE t (id INTEGER);",
        }];
        run(&mut conn, &original).unwrap();

        let edited = [Migration {
            version: 1,
            name: "t",
            sql: "CREATE TABLE t (id INTEGER, extra TEXT);",
        }];
        let err = run(&mut conn, &edited).unwrap_err();
        assert!(matches!(err, LedgerError::MigrationChecksum { version: 1, .. }));
    }
}
