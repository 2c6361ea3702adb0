//! Local catalog: a SQLite file recording flare and node metadata that
//! does not belong in the flare's on-disk bytes (commit history, node
//! topology rows surviving a restart).

use crate::error::Result;
use crate::hash;
use crate::ring::Volcano;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS flares (
    hash        TEXT PRIMARY KEY,
    path        TEXT NOT NULL,
    flare_type  INTEGER NOT NULL,
    uid         INTEGER NOT NULL,
    gid         INTEGER NOT NULL,
    commit_path TEXT,
    commit_time INTEGER,
    commit_url  TEXT
);
CREATE TABLE IF NOT EXISTS nodes (
    nickname      TEXT PRIMARY KEY,
    fqdn          TEXT NOT NULL,
    ip            TEXT NOT NULL,
    port          INTEGER NOT NULL,
    bandwidth     INTEGER NOT NULL,
    storage       INTEGER NOT NULL,
    start_key     TEXT NOT NULL,
    stop_key      TEXT NOT NULL
);
";

/// A single flare's persisted metadata row.
#[derive(Debug, Clone)]
pub struct FlareRow {
    pub hash: String,
    pub path: String,
    pub flare_type: i64,
    pub uid: u32,
    pub gid: u32,
    pub commit_path: Option<String>,
    pub commit_time: Option<i64>,
    pub commit_url: Option<String>,
}

/// A single node's persisted topology row, as loaded back on coordinated
/// boot to check liveness and interval agreement.
#[derive(Debug, Clone)]
pub struct NodeRow {
    pub nickname: String,
    pub fqdn: String,
    pub ip: String,
    pub port: u16,
    pub bandwidth: u64,
    pub storage: u64,
    pub start_key: String,
    pub stop_key: String,
}

pub struct Catalog {
    conn: Mutex<Connection>,
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Catalog> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Catalog { conn: Mutex::new(conn) })
    }

    pub fn in_memory() -> Result<Catalog> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Catalog { conn: Mutex::new(conn) })
    }

    pub fn insert_flare(&self, row: &FlareRow) -> Result<()> {
        let conn = self.conn.lock().expect("catalog lock poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO flares
                (hash, path, flare_type, uid, gid, commit_path, commit_time, commit_url)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.hash,
                row.path,
                row.flare_type,
                row.uid,
                row.gid,
                row.commit_path,
                row.commit_time,
                row.commit_url,
            ],
        )?;
        Ok(())
    }

    pub fn load_flare(&self, binhash: &[u8; 20]) -> Result<Option<FlareRow>> {
        let conn = self.conn.lock().expect("catalog lock poisoned");
        let hash = hash::armour(binhash);
        conn.query_row(
            "SELECT hash, path, flare_type, uid, gid, commit_path, commit_time, commit_url
             FROM flares WHERE hash = ?1",
            params![hash],
            |row| {
                Ok(FlareRow {
                    hash: row.get(0)?,
                    path: row.get(1)?,
                    flare_type: row.get(2)?,
                    uid: row.get(3)?,
                    gid: row.get(4)?,
                    commit_path: row.get(5)?,
                    commit_time: row.get(6)?,
                    commit_url: row.get(7)?,
                })
            },
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other.into()),
        })
    }

    pub fn erase_flare(&self, binhash: &[u8; 20]) -> Result<()> {
        let conn = self.conn.lock().expect("catalog lock poisoned");
        conn.execute(
            "DELETE FROM flares WHERE hash = ?1",
            params![hash::armour(binhash)],
        )?;
        Ok(())
    }

    /// Total rows, used by the balancer loop to refresh `total_keys`.
    pub fn flare_count(&self) -> Result<u64> {
        let conn = self.conn.lock().expect("catalog lock poisoned");
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM flares", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    /// Every flare row, for the linear scan-and-filter a join's keyspace
    /// streaming needs (there is no start/stop_key index to drive a
    /// range query directly).
    pub fn all_flares(&self) -> Result<Vec<FlareRow>> {
        let conn = self.conn.lock().expect("catalog lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT hash, path, flare_type, uid, gid, commit_path, commit_time, commit_url FROM flares",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(FlareRow {
                hash: row.get(0)?,
                path: row.get(1)?,
                flare_type: row.get(2)?,
                uid: row.get(3)?,
                gid: row.get(4)?,
                commit_path: row.get(5)?,
                commit_time: row.get(6)?,
                commit_url: row.get(7)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn upsert_node(&self, node: &Volcano) -> Result<()> {
        let conn = self.conn.lock().expect("catalog lock poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO nodes
                (nickname, fqdn, ip, port, bandwidth, storage, start_key, stop_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                node.nickname,
                node.fqdn,
                node.ip.to_string(),
                node.port,
                node.bandwidth,
                node.storage,
                node.start_key.as_str(),
                node.stop_key.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn load_nodes(&self) -> Result<Vec<NodeRow>> {
        let conn = self.conn.lock().expect("catalog lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT nickname, fqdn, ip, port, bandwidth, storage, start_key, stop_key FROM nodes",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(NodeRow {
                nickname: row.get(0)?,
                fqdn: row.get(1)?,
                ip: row.get(2)?,
                port: row.get(3)?,
                bandwidth: row.get(4)?,
                storage: row.get(5)?,
                start_key: row.get(6)?,
                stop_key: row.get(7)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flare_row_roundtrip() {
        let cat = Catalog::in_memory().unwrap();
        let row = FlareRow {
            hash: "a".repeat(40),
            path: "/f".to_string(),
            flare_type: 1,
            uid: 1000,
            gid: 1000,
            commit_path: Some("/f".to_string()),
            commit_time: Some(12345),
            commit_url: None,
        };
        cat.insert_flare(&row).unwrap();
        let binhash = crate::hash::dearmour(&row.hash).unwrap();
        let loaded = cat.load_flare(&binhash).unwrap().unwrap();
        assert_eq!(loaded.path, "/f");
        assert_eq!(cat.flare_count().unwrap(), 1);
        cat.erase_flare(&binhash).unwrap();
        assert!(cat.load_flare(&binhash).unwrap().is_none());
    }

    #[test]
    fn all_flares_returns_every_row() {
        let cat = Catalog::in_memory().unwrap();
        for path in ["/a", "/b", "/c"] {
            cat.insert_flare(&FlareRow {
                hash: crate::hash::armour(&crate::hash::Key::of_path(path).to_bytes()),
                path: path.to_string(),
                flare_type: 1,
                uid: 0,
                gid: 0,
                commit_path: None,
                commit_time: None,
                commit_url: None,
            })
            .unwrap();
        }
        let rows = cat.all_flares().unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn node_row_roundtrip() {
        let cat = Catalog::in_memory().unwrap();
        let node = Volcano::bootstrap(
            "a".to_string(),
            "a.example".to_string(),
            std::net::Ipv4Addr::LOCALHOST,
            12001,
        );
        cat.upsert_node(&node).unwrap();
        let rows = cat.load_nodes().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].nickname, "a");
    }
}
