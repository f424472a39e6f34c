// SPDX-License-Identifier: AGPL-3.0-only
//! Ban list fed by failed logins.

use ipnet::IpNet;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Kind of failed login recorded against a source address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    LoginFailed,
    UserNotFound,
}

pub trait Defender: Send + Sync {
    fn is_banned(&self, ip: &str) -> bool;

    fn add_event(&self, ip: &str, event: HostEvent);
}

#[derive(Debug, Clone)]
pub struct DefenderConfig {
    pub enabled: bool,
    pub ban_time: Duration,
    /// Events older than this no longer count toward the threshold.
    pub observation_time: Duration,
    pub threshold: u32,
    pub score_invalid: u32,
    pub score_user_not_found: u32,
    /// Networks that are never banned.
    pub safe_list: Vec<IpNet>,
    /// Upper bound on tracked hosts, 0 means unbounded.
    pub max_hosts: usize,
}

impl Default for DefenderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ban_time: Duration::from_secs(30 * 60),
            observation_time: Duration::from_secs(30 * 60),
            threshold: 15,
            score_invalid: 1,
            score_user_not_found: 2,
            safe_list: Vec::new(),
            max_hosts: 10_000,
        }
    }
}

#[derive(Debug, Default)]
struct HostState {
    events: VecDeque<(Instant, u32)>,
    banned_until: Option<Instant>,
}

impl HostState {
    fn score(&mut self, now: Instant, window: Duration) -> u32 {
        while let Some((at, _)) = self.events.front() {
            if now.duration_since(*at) > window {
                self.events.pop_front();
            } else {
                break;
            }
        }
        self.events.iter().map(|(_, s)| s).sum()
    }
}

pub struct MemoryDefender {
    config: DefenderConfig,
    hosts: Mutex<HashMap<IpAddr, HostState>>,
}

impl MemoryDefender {
    pub fn new(config: DefenderConfig) -> Self {
        Self {
            config,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DefenderConfig {
        &self.config
    }

    fn is_safe(&self, ip: &IpAddr) -> bool {
        self.config.safe_list.iter().any(|net| net.contains(ip))
    }

    /// Drop hosts with no live events and no active ban.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let window = self.config.observation_time;
        self.hosts.lock().retain(|_, state| {
            let banned = state.banned_until.is_some_and(|until| until > now);
            banned || state.score(now, window) > 0
        });
    }

    pub fn banned_hosts(&self) -> Vec<IpAddr> {
        let now = Instant::now();
        self.hosts
            .lock()
            .iter()
            .filter(|(_, s)| s.banned_until.is_some_and(|until| until > now))
            .map(|(ip, _)| *ip)
            .collect()
    }

    pub fn unban(&self, ip: &IpAddr) -> bool {
        self.hosts.lock().remove(ip).is_some()
    }
}

impl Defender for MemoryDefender {
    fn is_banned(&self, ip: &str) -> bool {
        if !self.config.enabled {
            return false;
        }
        let Ok(addr) = ip.parse::<IpAddr>() else {
            return false;
        };
        let now = Instant::now();
        let mut hosts = self.hosts.lock();
        let Some(state) = hosts.get_mut(&addr) else {
            return false;
        };
        match state.banned_until {
            Some(until) if until > now => true,
            Some(_) => {
                state.banned_until = None;
                false
            }
            None => false,
        }
    }

    fn add_event(&self, ip: &str, event: HostEvent) {
        if !self.config.enabled {
            return;
        }
        let Ok(addr) = ip.parse::<IpAddr>() else {
            warn!(ip = %ip, "ignoring defender event for unparsable address");
            return;
        };
        if self.is_safe(&addr) {
            return;
        }

        let score = match event {
            HostEvent::LoginFailed => self.config.score_invalid,
            HostEvent::UserNotFound => self.config.score_user_not_found,
        };
        let now = Instant::now();
        let mut hosts = self.hosts.lock();
        if self.config.max_hosts > 0
            && hosts.len() >= self.config.max_hosts
            && !hosts.contains_key(&addr)
        {
            let window = self.config.observation_time;
            hosts.retain(|_, s| {
                s.banned_until.is_some_and(|until| until > now) || s.score(now, window) > 0
            });
            if hosts.len() >= self.config.max_hosts {
                warn!(ip = %addr, "defender host table full, event dropped");
                return;
            }
        }

        let state = hosts.entry(addr).or_default();
        if state.banned_until.is_some_and(|until| until > now) {
            return;
        }
        state.events.push_back((now, score));
        let total = state.score(now, self.config.observation_time);
        if total >= self.config.threshold {
            state.banned_until = Some(now + self.config.ban_time);
            state.events.clear();
            info!(
                ip = %addr,
                score = total,
                ban_secs = self.config.ban_time.as_secs(),
                "host banned"
            );
        }
    }
}
