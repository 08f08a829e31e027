/// Ban policy for miner IPs
///
/// Tracks malformed requests and the invalid-share ratio per IP and issues
/// temporary bans.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

use crate::config::PolicyConfig;
use crate::metrics::prometheus as metrics;

pub trait Policy: Send + Sync {
    fn is_banned(&self, ip: IpAddr) -> bool;

    /// Count a malformed request.
    fn apply_malformed_policy(&self, ip: IpAddr);

    /// Tally a share. Returns `false` when the submitter must stop.
    fn apply_share_policy(&self, ip: IpAddr, valid: bool) -> bool;

    /// Periodic housekeeping.
    fn cleanup(&self) {}
}

#[derive(Debug)]
struct Stats {
    valid: u32,
    invalid: u32,
    malformed: u32,
    banned_until: Option<Instant>,
    last_seen: Instant,
}

impl Stats {
    fn new(now: Instant) -> Self {
        Self {
            valid: 0,
            invalid: 0,
            malformed: 0,
            banned_until: None,
            last_seen: now,
        }
    }

    fn is_banned(&self, now: Instant) -> bool {
        self.banned_until.map(|until| now < until).unwrap_or(false)
    }

    fn reset_shares(&mut self) {
        self.valid = 0;
        self.invalid = 0;
    }
}

pub struct PolicyServer {
    config: PolicyConfig,
    stats: Mutex<HashMap<IpAddr, Stats>>,
}

impl PolicyServer {
    pub fn new(config: PolicyConfig) -> Self {
        tracing::info!(
            "Policy: bans {} (timeout {}s, invalid {}% after {} shares, malformed limit {})",
            if config.ban_enabled { "enabled" } else { "disabled" },
            config.ban_timeout_secs,
            config.invalid_percent,
            config.check_threshold,
            config.malformed_limit
        );

        Self {
            config,
            stats: Mutex::new(HashMap::new()),
        }
    }

    fn ban(&self, ip: IpAddr, stats: &mut Stats, reason: &str) {
        if !self.config.ban_enabled {
            return;
        }
        stats.banned_until = Some(Instant::now() + self.config.ban_timeout());
        metrics::inc_bans();
        tracing::warn!("⛔ Banned {} for {:?}: {}", ip, self.config.ban_timeout(), reason);
    }

    pub fn tracked(&self) -> usize {
        self.stats.lock().len()
    }

    fn touch(all: &mut HashMap<IpAddr, Stats>, ip: IpAddr) -> &mut Stats {
        let now = Instant::now();
        let stats = all.entry(ip).or_insert_with(|| Stats::new(now));
        stats.last_seen = now;
        stats
    }

    /// Forget IPs idle for a full reset interval, unless still banned.
    fn cleanup_at(&self, now: Instant) {
        let idle = self.config.reset_interval();
        let mut stats = self.stats.lock();
        let before = stats.len();
        stats.retain(|_, s| s.is_banned(now) || now.saturating_duration_since(s.last_seen) < idle);
        let evicted = before - stats.len();
        if evicted > 0 {
            tracing::debug!("Policy: forgot {} idle addresses", evicted);
        }
    }
}

impl Policy for PolicyServer {
    fn is_banned(&self, ip: IpAddr) -> bool {
        if !self.config.ban_enabled {
            return false;
        }
        self.stats
            .lock()
            .get(&ip)
            .map(|s| s.is_banned(Instant::now()))
            .unwrap_or(false)
    }

    fn apply_malformed_policy(&self, ip: IpAddr) {
        metrics::inc_malformed();
        let mut all = self.stats.lock();
        let stats = Self::touch(&mut all, ip);
        stats.malformed += 1;
        if stats.malformed >= self.config.malformed_limit {
            stats.malformed = 0;
            self.ban(ip, stats, "malformed requests");
        }
    }

    fn apply_share_policy(&self, ip: IpAddr, valid: bool) -> bool {
        let mut all = self.stats.lock();
        let stats = Self::touch(&mut all, ip);
        if valid {
            stats.valid += 1;
        } else {
            stats.invalid += 1;
        }

        if stats.valid + stats.invalid < self.config.check_threshold {
            return true;
        }

        let ratio = stats.invalid as f64 / stats.valid.max(1) as f64;
        let exceeded = ratio >= self.config.invalid_percent / 100.0;
        stats.reset_shares();
        if exceeded && self.config.ban_enabled {
            self.ban(ip, stats, "invalid share ratio");
            return false;
        }
        true
    }

    fn cleanup(&self) {
        self.cleanup_at(Instant::now());
    }
}
