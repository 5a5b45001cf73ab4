//! Symbol universe: an ordered, persisted, observable set of tickers.
//!
//! Backed by a single key-value row in SQLite (`symbol_universe_v1`, value =
//! JSON array). Loads on construction; saves best-effort on every mutation —
//! a failed save is logged and never fails the operation.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub const DEFAULT_UNIVERSE: &[&str] = &["SPY", "QQQ", "IWM", "DIA", "XSP", "RUT", "NDX"];

const STORE_KEY: &str = "symbol_universe_v1";

type Listener = Arc<dyn Fn(&[String]) + Send + Sync>;

struct Inner {
    symbols: Vec<String>,
    conn: Option<Connection>,
    listeners: Vec<(u64, Listener)>,
    next_listener_id: u64,
}

pub struct SymbolUniverse {
    inner: Mutex<Inner>,
}

/// Ticker validation: 1–6 chars, uppercase letters or `^` (index prefixes).
pub fn is_valid_symbol(sym: &str) -> bool {
    !sym.is_empty() && sym.len() <= 6 && sym.chars().all(|c| c.is_ascii_uppercase() || c == '^')
}

impl SymbolUniverse {
    /// Open (or create) the backing database and load the persisted set.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data dir: {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open universe db: {}", db_path.display()))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create kv table")?;

        let symbols = load_symbols(&conn).unwrap_or_else(|| {
            DEFAULT_UNIVERSE.iter().map(ToString::to_string).collect()
        });

        Ok(Self {
            inner: Mutex::new(Inner {
                symbols,
                conn: Some(conn),
                listeners: Vec::new(),
                next_listener_id: 0,
            }),
        })
    }

    /// Non-persisted store seeded with the defaults. Used in tests and when
    /// no data directory is available.
    pub fn ephemeral() -> Self {
        Self {
            inner: Mutex::new(Inner {
                symbols: DEFAULT_UNIVERSE.iter().map(ToString::to_string).collect(),
                conn: None,
                listeners: Vec::new(),
                next_listener_id: 0,
            }),
        }
    }

    pub fn get(&self) -> Vec<String> {
        self.inner.lock().expect("universe lock").symbols.clone()
    }

    /// Add a ticker. Returns false when invalid or already present.
    pub fn add(&self, sym: &str) -> bool {
        let sym = sym.trim().to_uppercase();
        if !is_valid_symbol(&sym) {
            return false;
        }
        let (snapshot, listeners) = {
            let mut inner = self.inner.lock().expect("universe lock");
            if inner.symbols.iter().any(|s| *s == sym) {
                return false;
            }
            inner.symbols.push(sym);
            inner.persist();
            (inner.symbols.clone(), inner.listeners_snapshot())
        };
        notify(&listeners, &snapshot);
        true
    }

    /// Remove a ticker. Returns false when absent.
    pub fn remove(&self, sym: &str) -> bool {
        let sym = sym.trim().to_uppercase();
        let (snapshot, listeners) = {
            let mut inner = self.inner.lock().expect("universe lock");
            let before = inner.symbols.len();
            inner.symbols.retain(|s| *s != sym);
            if inner.symbols.len() == before {
                return false;
            }
            inner.persist();
            (inner.symbols.clone(), inner.listeners_snapshot())
        };
        notify(&listeners, &snapshot);
        true
    }

    /// Restore the default universe.
    pub fn reset(&self) {
        let (snapshot, listeners) = {
            let mut inner = self.inner.lock().expect("universe lock");
            inner.symbols = DEFAULT_UNIVERSE.iter().map(ToString::to_string).collect();
            inner.persist();
            (inner.symbols.clone(), inner.listeners_snapshot())
        };
        notify(&listeners, &snapshot);
    }

    /// Register a change listener; returns an id for `unsubscribe`.
    pub fn subscribe(&self, listener: impl Fn(&[String]) + Send + Sync + 'static) -> u64 {
        let mut inner = self.inner.lock().expect("universe lock");
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.listeners.push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().expect("universe lock");
        let before = inner.listeners.len();
        inner.listeners.retain(|(lid, _)| *lid != id);
        inner.listeners.len() != before
    }
}

impl Inner {
    fn listeners_snapshot(&self) -> Vec<Listener> {
        self.listeners.iter().map(|(_, l)| l.clone()).collect()
    }

    /// Best-effort save. Failure is logged, never surfaced.
    fn persist(&self) {
        let Some(conn) = &self.conn else { return };
        let json = match serde_json::to_string(&self.symbols) {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!("Failed to serialize symbol universe: {e}");
                return;
            }
        };
        if let Err(e) = conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![STORE_KEY, json],
        ) {
            tracing::warn!("Failed to persist symbol universe: {e}");
        }
    }
}

/// Listener failures are swallowed; a broken subscriber must not poison
/// universe mutations.
fn notify(listeners: &[Listener], snapshot: &[String]) {
    for listener in listeners {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            listener(snapshot);
        }));
        if result.is_err() {
            tracing::warn!("symbol universe listener panicked; ignoring");
        }
    }
}

fn load_symbols(conn: &Connection) -> Option<Vec<String>> {
    let json: String = conn
        .query_row(
            "SELECT value FROM kv WHERE key = ?1",
            rusqlite::params![STORE_KEY],
            |row| row.get(0),
        )
        .ok()?;
    serde_json::from_str(&json).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn defaults_seed_the_universe() {
        let u = SymbolUniverse::ephemeral();
        assert_eq!(u.get(), DEFAULT_UNIVERSE);
    }

    #[test]
    fn add_then_remove_restores_prior_value() {
        let u = SymbolUniverse::ephemeral();
        let before = u.get();
        assert!(u.add("AAPL"));
        assert!(u.get().contains(&"AAPL".to_string()));
        assert!(u.remove("AAPL"));
        assert_eq!(u.get(), before);
    }

    #[test]
    fn add_uppercases_and_dedupes() {
        let u = SymbolUniverse::ephemeral();
        assert!(u.add("tsla"));
        assert!(!u.add("TSLA"));
        assert!(u.get().contains(&"TSLA".to_string()));
    }

    #[test]
    fn invalid_symbols_rejected() {
        let u = SymbolUniverse::ephemeral();
        assert!(!u.add(""));
        assert!(!u.add("TOOLONGG"));
        assert!(!u.add("BRK.B"));
        assert!(!u.add("SPY 1"));
        assert!(u.add("^VIX"));
    }

    #[test]
    fn remove_absent_returns_false() {
        let u = SymbolUniverse::ephemeral();
        assert!(!u.remove("ZZZZ"));
    }

    #[test]
    fn reset_restores_defaults() {
        let u = SymbolUniverse::ephemeral();
        u.add("NVDA");
        u.remove("SPY");
        u.reset();
        assert_eq!(u.get(), DEFAULT_UNIVERSE);
    }

    #[test]
    fn listeners_fire_synchronously_and_unsubscribe_works() {
        let u = SymbolUniverse::ephemeral();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = u.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        u.add("AMD");
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(u.unsubscribe(id));
        u.add("NVDA");
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!u.unsubscribe(id));
    }

    #[test]
    fn panicking_listener_is_swallowed() {
        let u = SymbolUniverse::ephemeral();
        u.subscribe(|_| panic!("listener bug"));
        assert!(u.add("AMD"));
        assert!(u.get().contains(&"AMD".to_string()));
    }

    #[test]
    fn no_notification_on_rejected_mutation() {
        let u = SymbolUniverse::ephemeral();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        u.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        u.add("not-valid!");
        u.remove("ZZZZ");
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("universe.db");

        {
            let u = SymbolUniverse::open(&path).unwrap();
            u.add("NVDA");
            u.remove("DIA");
        }

        let reopened = SymbolUniverse::open(&path).unwrap();
        let symbols = reopened.get();
        assert!(symbols.contains(&"NVDA".to_string()));
        assert!(!symbols.contains(&"DIA".to_string()));
    }
}
