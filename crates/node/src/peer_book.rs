use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Peer quality scores and timed bans. Misbehaving peers are banned for a
/// cooldown and skipped by sync-peer election until it expires.
#[derive(Default)]
pub struct PeerBook {
    scores: Mutex<HashMap<SocketAddr, i32>>,
    banned: Mutex<HashMap<SocketAddr, Instant>>,
}

impl PeerBook {
    pub fn record_success(&self, addr: SocketAddr) {
        if let Ok(mut scores) = self.scores.lock() {
            let entry = scores.entry(addr).or_insert(0);
            *entry = entry.saturating_add(3);
        }
    }

    pub fn record_failure(&self, addr: SocketAddr) {
        if let Ok(mut scores) = self.scores.lock() {
            let entry = scores.entry(addr).or_insert(0);
            *entry = entry.saturating_sub(1);
        }
    }

    pub fn record_misbehavior(&self, addr: SocketAddr, ban_secs: u64) {
        self.record_failure(addr);
        self.ban_for(addr, ban_secs);
    }

    pub fn ban_for(&self, addr: SocketAddr, secs: u64) {
        if let Ok(mut banned) = self.banned.lock() {
            banned.insert(addr, Instant::now() + Duration::from_secs(secs));
        }
    }

    pub fn is_banned(&self, addr: SocketAddr) -> bool {
        let now = Instant::now();
        let Ok(mut banned) = self.banned.lock() else {
            return false;
        };
        if let Some(until) = banned.get(&addr).copied() {
            if until > now {
                return true;
            }
            banned.remove(&addr);
        }
        false
    }

    pub fn score(&self, addr: SocketAddr) -> i32 {
        self.scores
            .lock()
            .map(|scores| scores.get(&addr).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn scores_accumulate() {
        let book = PeerBook::default();
        book.record_success(addr(1000));
        book.record_success(addr(1000));
        book.record_failure(addr(1000));
        assert_eq!(book.score(addr(1000)), 5);
    }

    #[test]
    fn bans_expire() {
        let book = PeerBook::default();
        book.ban_for(addr(1001), 3600);
        assert!(book.is_banned(addr(1001)));
        book.ban_for(addr(1001), 0);
        assert!(!book.is_banned(addr(1001)));
    }
}
