//! Challenge/response store backing `GET /protocol/challenge/:id` (§6).
//!
//! Supplements the distilled spec per SPEC_FULL.md §4: wired as part of C6/C11
//! cross-node authenticity probing rather than a standalone top-level
//! component. Persists to the `challenge_response` table (§6 "Persisted state").

use tpn_common::{ChallengeSolution, Database, Result};
use uuid::Uuid;

const DEFAULT_TTL_SECONDS: i64 = 300;

pub struct ChallengeStore {
    db: Database,
}

impl ChallengeStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Issue a new challenge/solution pair, persisted with a TTL.
    pub fn issue(&self, tag: Option<String>) -> Result<ChallengeSolution> {
        let solution = ChallengeSolution {
            challenge: Uuid::new_v4(),
            solution: Uuid::new_v4(),
            tag,
            created_at: chrono::Utc::now().timestamp(),
        };
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO challenge_response (challenge, solution, tag, created_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![solution.challenge.to_string(), solution.solution.to_string(), solution.tag, solution.created_at],
        )?;
        Ok(solution)
    }

    /// Resolve a challenge id to its solution, rejecting entries older than
    /// `DEFAULT_TTL_SECONDS` (§3 `ChallengeSolution` TTL).
    pub fn resolve(&self, challenge: Uuid) -> Result<Option<ChallengeSolution>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let row: Option<(String, String, Option<String>, i64)> = conn
            .query_row(
                "SELECT challenge, solution, tag, created_at FROM challenge_response WHERE challenge = ?1",
                rusqlite::params![challenge.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let Some((challenge_str, solution_str, tag, created_at)) = row else {
            return Ok(None);
        };

        if chrono::Utc::now().timestamp() - created_at > DEFAULT_TTL_SECONDS {
            conn.execute("DELETE FROM challenge_response WHERE challenge = ?1", rusqlite::params![challenge_str])?;
            return Ok(None);
        }

        Ok(Some(ChallengeSolution {
            challenge,
            solution: solution_str.parse().map_err(|_| tpn_common::Error::Internal("corrupt solution uuid".to_string()))?,
            tag,
            created_at,
        }))
    }

    /// Sweep expired rows; invoked alongside the scheduler's other cleanup jobs.
    pub fn sweep_expired(&self) -> Result<u64> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let cutoff = chrono::Utc::now().timestamp() - DEFAULT_TTL_SECONDS;
        let removed = conn.execute("DELETE FROM challenge_response WHERE created_at < ?1", rusqlite::params![cutoff])?;
        Ok(removed as u64)
    }
}

use rusqlite::OptionalExtension;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_then_resolve_round_trips() {
        let store = ChallengeStore::new(Database::open_memory().unwrap());
        let issued = store.issue(Some("probe".to_string())).unwrap();
        let resolved = store.resolve(issued.challenge).unwrap().unwrap();
        assert_eq!(resolved.solution, issued.solution);
        assert_eq!(resolved.tag.as_deref(), Some("probe"));
    }

    #[test]
    fn unknown_challenge_resolves_to_none() {
        let store = ChallengeStore::new(Database::open_memory().unwrap());
        assert!(store.resolve(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn expired_challenge_is_swept_and_resolves_to_none() {
        let store = ChallengeStore::new(Database::open_memory().unwrap());
        let issued = store.issue(None).unwrap();
        {
            let conn = store.db.connection();
            let conn = conn.lock();
            conn.execute(
                "UPDATE challenge_response SET created_at = ?1 WHERE challenge = ?2",
                rusqlite::params![chrono::Utc::now().timestamp() - 1000, issued.challenge.to_string()],
            )
            .unwrap();
        }
        assert!(store.resolve(issued.challenge).unwrap().is_none());
    }
}
