//! Shared engine state: config, database, named locks, geo resolver, and the
//! in-memory request-ticket cache (§3 `RequestTicket`).

use dashmap::DashMap;
use std::sync::Arc;
use tpn_common::{Database, GeoResolver, NamedLockRegistry, Result, TicketStatus};

use crate::config::NodeConfig;

/// Facade every component is constructed against, mirroring the teacher's
/// `StateManager` pattern: one cheaply-cloneable handle threaded through the
/// whole process instead of ambient globals.
#[derive(Clone)]
pub struct StateManager {
    config: Arc<NodeConfig>,
    db: Database,
    locks: NamedLockRegistry,
    geo: Arc<GeoResolver>,
    tickets: Arc<DashMap<String, TicketEntry>>,
}

struct TicketEntry {
    status: TicketStatus,
    expires_at: i64,
}

impl StateManager {
    pub async fn new(config: NodeConfig) -> Result<Self> {
        let store_path = config.store_path();
        tokio::fs::create_dir_all(&store_path).await?;

        let db = Database::open(config.db_path())?;
        let geo = GeoResolver::open(config.geoip_mmdb_path.clone());

        Ok(Self {
            config: Arc::new(config),
            db,
            locks: NamedLockRegistry::new(),
            geo: Arc::new(geo),
            tickets: Arc::new(DashMap::new()),
        })
    }

    /// In-memory-only state manager for tests (`CI_MODE`-style harnesses).
    pub fn new_in_memory(config: NodeConfig) -> Result<Self> {
        Ok(Self {
            config: Arc::new(config),
            db: Database::open_memory()?,
            locks: NamedLockRegistry::new(),
            geo: Arc::new(GeoResolver::disabled()),
            tickets: Arc::new(DashMap::new()),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn locks(&self) -> &NamedLockRegistry {
        &self.locks
    }

    pub fn geo(&self) -> &GeoResolver {
        &self.geo
    }

    // ========================================================================
    // Request tickets (§3 `RequestTicket`, §4.10 fan-out cancellation)
    // ========================================================================

    /// Mint a pending ticket for `request_id`, expiring in `ttl_seconds`.
    pub fn ticket_begin(&self, request_id: &str, ttl_seconds: i64) {
        self.tickets.insert(
            request_id.to_string(),
            TicketEntry {
                status: TicketStatus::Pending,
                expires_at: chrono::Utc::now().timestamp() + ttl_seconds,
            },
        );
    }

    /// Mark a ticket complete; TTL is reset to 60s per §4.10 step 6.
    pub fn ticket_complete(&self, request_id: &str) {
        self.tickets.insert(
            request_id.to_string(),
            TicketEntry {
                status: TicketStatus::Complete,
                expires_at: chrono::Utc::now().timestamp() + 60,
            },
        );
    }

    /// `GET /api/status/request/:request_id` (§6). Expired/unknown tickets
    /// report `pending` — a racer that hasn't heard otherwise keeps going.
    pub fn ticket_status(&self, request_id: &str) -> TicketStatus {
        match self.tickets.get(request_id) {
            Some(entry) if entry.expires_at > chrono::Utc::now().timestamp() => entry.status,
            _ => TicketStatus::Pending,
        }
    }

    /// Sweep expired tickets; called by the scheduler alongside lease cleanup.
    pub fn sweep_tickets(&self) {
        let now = chrono::Utc::now().timestamp();
        self.tickets.retain(|_, entry| entry.expires_at > now);
    }
}
