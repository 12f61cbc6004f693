//! Database initialization and table definitions
//!
//! This module handles the setup of the embedded redb database that backs the
//! key-value namespace and the optimised image storage.

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

/// Flat key-value namespace
///
/// Key: colon-separated key (e.g. "metrics:redirect:gh:ok")
/// Value: scalar encoded as a string ("3", "1705501234567", "https://...")
pub const TABLE_KV: TableDefinition<&str, &str> = TableDefinition::new("kv_v1");

/// Optimised image objects
///
/// Key: content-derived filename "{unix_time}-{content_hash}.webp"
/// Value: encoded WebP bytes
pub const TABLE_IMAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("images_v1");

/// Initializes the embedded database and creates required tables
///
/// # Example
///
/// ```no_run
/// # use site_api::database::init_db;
/// let db = init_db("data.db").expect("Failed to initialize database");
/// ```
pub fn init_db(db_path: &str) -> Result<Database, redb::Error> {
    let db = Database::create(db_path)?;

    let write_txn = db.begin_write()?;
    {
        write_txn.open_table(TABLE_KV)?;
        write_txn.open_table(TABLE_IMAGES)?;
    }
    write_txn.commit()?;

    Ok(db)
}

/// Stores an encoded image under `name`, replacing any previous object
pub fn put_image(db: &Database, name: &str, bytes: &[u8]) -> Result<(), redb::Error> {
    let write_txn = db.begin_write()?;
    {
        let mut table = write_txn.open_table(TABLE_IMAGES)?;
        table.insert(name, bytes)?;
    }
    write_txn.commit()?;
    Ok(())
}

pub fn get_image(db: &Database, name: &str) -> Result<Option<Vec<u8>>, redb::Error> {
    let read_txn = db.begin_read()?;
    let table = read_txn.open_table(TABLE_IMAGES)?;
    let value = table.get(name)?.map(|guard| guard.value().to_vec());
    Ok(value)
}
