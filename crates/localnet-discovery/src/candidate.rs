//! Candidate bookkeeping and the election rules.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

use localnet_types::Heartbeat;
use tokio::time::Instant;

/// A peer as last seen through its heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub address: String,
    /// Tie-break key derived from the address, see [`rank_of`].
    pub rank: u32,
    pub is_host: bool,
    pub last_seen: Instant,
    pub has_active_session: bool,
    /// Epoch milliseconds of the peer's last session activity.
    pub last_session_update: Option<i64>,
}

impl Candidate {
    pub fn from_heartbeat(heartbeat: &Heartbeat, now: Instant) -> Self {
        Self {
            address: heartbeat.sender_address.clone(),
            rank: rank_of(&heartbeat.sender_address),
            is_host: heartbeat.claims_host(),
            last_seen: now,
            has_active_session: heartbeat.has_active_session,
            last_session_update: heartbeat.last_session_update,
        }
    }

    fn session_key(&self) -> Option<i64> {
        if self.has_active_session {
            self.last_session_update
        } else {
            None
        }
    }
}

/// Last address component as an integer, or 0 when it is not numeric.
pub fn rank_of(address: &str) -> u32 {
    address
        .rsplit('.')
        .next()
        .and_then(|last| last.parse().ok())
        .unwrap_or(0)
}

/// Pick the winner among `candidates`.
///
/// Peers holding an active session with a known update time win over all
/// others, latest update first. Without any, the highest rank wins. Both
/// orders fall back to the greater address string, so every peer computes
/// the same winner from the same set regardless of iteration order.
pub fn elect<'a, I>(candidates: I) -> Option<&'a Candidate>
where
    I: IntoIterator<Item = &'a Candidate>,
{
    let all: Vec<&Candidate> = candidates.into_iter().collect();

    let by_session = all
        .iter()
        .filter_map(|c| c.session_key().map(|ts| (ts, *c)))
        .max_by(|(ta, a), (tb, b)| ta.cmp(tb).then_with(|| a.address.cmp(&b.address)))
        .map(|(_, c)| c);

    by_session.or_else(|| all.into_iter().max_by(by_rank))
}

fn by_rank(a: &&Candidate, b: &&Candidate) -> Ordering {
    a.rank.cmp(&b.rank).then_with(|| a.address.cmp(&b.address))
}

/// All candidates currently known, keyed by address.
#[derive(Debug, Default)]
pub struct CandidateSet {
    candidates: HashMap<String, Candidate>,
    election_in_progress: bool,
}

impl CandidateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a heartbeat. The sender's previous entry is replaced, not merged.
    pub fn observe(&mut self, heartbeat: &Heartbeat, now: Instant) {
        self.upsert(Candidate::from_heartbeat(heartbeat, now));
    }

    pub fn upsert(&mut self, candidate: Candidate) {
        self.candidates.insert(candidate.address.clone(), candidate);
    }

    /// Drop candidates not heard from for longer than `timeout`.
    /// Returns the removed addresses.
    pub fn remove_expired(&mut self, now: Instant, timeout: Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .candidates
            .values()
            .filter(|c| now.saturating_duration_since(c.last_seen) > timeout)
            .map(|c| c.address.clone())
            .collect();
        for address in &expired {
            self.candidates.remove(address);
        }
        expired
    }

    /// The address of the host, if any candidate claims the role.
    ///
    /// Conflicting claims are settled with the election order so every
    /// peer reports the same one.
    pub fn host(&self) -> Option<&str> {
        elect(self.candidates.values().filter(|c| c.is_host)).map(|c| c.address.as_str())
    }

    pub fn has_host(&self) -> bool {
        self.candidates.values().any(|c| c.is_host)
    }

    pub fn clear_host(&mut self) {
        for candidate in self.candidates.values_mut() {
            candidate.is_host = false;
        }
    }

    /// Whether the ticker should run an election round now.
    pub fn needs_election(&self) -> bool {
        !self.election_in_progress && !self.candidates.is_empty() && !self.has_host()
    }

    /// Run one election round and mark the winner as host.
    pub fn run_election(&mut self) -> Option<String> {
        self.election_in_progress = true;
        let winner = elect(self.candidates.values()).map(|c| c.address.clone());
        if let Some(address) = &winner {
            if let Some(candidate) = self.candidates.get_mut(address) {
                candidate.is_host = true;
            }
        }
        self.election_in_progress = false;
        winner
    }

    pub fn get(&self, address: &str) -> Option<&Candidate> {
        self.candidates.get(address)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Snapshot sorted by address.
    pub fn snapshot(&self) -> Vec<Candidate> {
        let mut all: Vec<Candidate> = self.candidates.values().cloned().collect();
        all.sort_by(|a, b| a.address.cmp(&b.address));
        all
    }
}
