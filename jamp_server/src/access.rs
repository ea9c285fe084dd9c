//! Connection gatekeeping: challenges, bans and rate limiting.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use rand::Rng;
use thiserror::Error;

use jamp_shared::fixed::{CapacityError, FixedVec};
use jamp_shared::limits::SERVER_MAXBANS;

pub const MAX_CHALLENGES: usize = 2048;

#[derive(Debug, Clone, Copy)]
struct Challenge {
    addr: SocketAddr,
    challenge: i32,
    client_challenge: i32,
    time: i32,
}

/// Outstanding `getchallenge` answers, one per address.
#[derive(Debug, Default)]
pub struct Challenges {
    list: Vec<Challenge>,
}

impl Challenges {
    /// Returns the challenge for `addr`, issuing a fresh one if needed. When
    /// the table is full the oldest entry is replaced.
    pub fn issue(&mut self, addr: SocketAddr, client_challenge: i32, time: i32, rng: &mut impl Rng) -> i32 {
        if let Some(c) = self.list.iter_mut().find(|c| c.addr == addr) {
            c.client_challenge = client_challenge;
            c.time = time;
            return c.challenge;
        }
        let entry = Challenge {
            addr,
            challenge: rng.gen::<i32>() & 0x7fff_ffff,
            client_challenge,
            time,
        };
        if self.list.len() >= MAX_CHALLENGES {
            if let Some(oldest) = self.list.iter_mut().min_by_key(|c| c.time) {
                *oldest = entry;
            }
        } else {
            self.list.push(entry);
        }
        entry.challenge
    }

    pub fn verify(&self, addr: SocketAddr, challenge: i32) -> bool {
        self.list.iter().any(|c| c.addr == addr && c.challenge == challenge)
    }

    pub fn client_challenge(&self, addr: SocketAddr) -> Option<i32> {
        self.list.iter().find(|c| c.addr == addr).map(|c| c.client_challenge)
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BanParseError {
    #[error("bad address: {0}")]
    Address(String),
    #[error("bad subnet mask: {0}")]
    Mask(String),
}

/// An address range, `ip[/bits]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ban {
    pub net: IpAddr,
    pub bits: u8,
    /// Exceptions override bans covering the same address.
    pub exception: bool,
}

impl Ban {
    pub fn parse(s: &str, exception: bool) -> Result<Self, BanParseError> {
        let (addr, bits) = match s.split_once('/') {
            Some((a, b)) => (a, Some(b)),
            None => (s, None),
        };
        let net = IpAddr::from_str(addr).map_err(|_| BanParseError::Address(addr.to_string()))?;
        let max = if net.is_ipv4() { 32 } else { 128 };
        let bits = match bits {
            Some(b) => b
                .parse::<u8>()
                .ok()
                .filter(|&b| b <= max)
                .ok_or_else(|| BanParseError::Mask(b.to_string()))?,
            None => max,
        };
        Ok(Self { net, bits, exception })
    }

    pub fn matches(&self, ip: IpAddr) -> bool {
        match (self.net, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => prefix_eq(&net.octets(), &ip.octets(), self.bits),
            (IpAddr::V6(net), IpAddr::V6(ip)) => prefix_eq(&net.octets(), &ip.octets(), self.bits),
            _ => false,
        }
    }
}

impl std::fmt::Display for Ban {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.net, self.bits)
    }
}

fn prefix_eq(a: &[u8], b: &[u8], bits: u8) -> bool {
    let full = usize::from(bits / 8);
    if a[..full] != b[..full] {
        return false;
    }
    let rest = bits % 8;
    if rest == 0 {
        return true;
    }
    let mask = 0xffu8 << (8 - rest);
    a[full] & mask == b[full] & mask
}

#[derive(Debug)]
pub struct BanList {
    bans: FixedVec<Ban>,
}

impl Default for BanList {
    fn default() -> Self {
        Self {
            bans: FixedVec::new("SERVER_MAXBANS", SERVER_MAXBANS),
        }
    }
}

impl BanList {
    /// Adds a ban or exception. A full list is left untouched.
    pub fn add(&mut self, ban: Ban) -> Result<(), CapacityError> {
        if self.bans.iter().any(|b| *b == ban) {
            return Ok(());
        }
        self.bans.try_push(ban).map(|_| ())
    }

    /// Removes entries equal to `ban`; returns how many went.
    pub fn remove(&mut self, ban: &Ban) -> usize {
        let mut removed = 0;
        while let Some(i) = self
            .bans
            .iter()
            .position(|b| b.net == ban.net && b.bits == ban.bits && b.exception == ban.exception)
        {
            self.bans.remove(i);
            removed += 1;
        }
        removed
    }

    /// Banned unless an exception also covers the address.
    pub fn is_banned(&self, ip: IpAddr) -> bool {
        let mut banned = false;
        for b in self.bans.iter().filter(|b| b.matches(ip)) {
            if b.exception {
                return false;
            }
            banned = true;
        }
        banned
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ban> {
        self.bans.iter()
    }

    pub fn len(&self) -> usize {
        self.bans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bans.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    last_time: i32,
    burst: i32,
}

impl Bucket {
    /// Returns true when the caller is over its allowance.
    fn limit(&mut self, now: i32, burst: i32, period: i32) -> bool {
        let interval = now - self.last_time;
        let expired = interval / period;
        let remainder = interval % period;
        if expired > self.burst || interval < 0 {
            self.burst = 0;
            self.last_time = now;
        } else {
            self.burst -= expired;
            self.last_time = now - remainder;
        }
        if self.burst < burst {
            self.burst += 1;
            return false;
        }
        true
    }
}

/// Leaky bucket per source address plus one shared outbound bucket.
#[derive(Debug)]
pub struct RateLimiter {
    burst: i32,
    period: i32,
    capacity: usize,
    buckets: HashMap<IpAddr, Bucket>,
    outbound: Bucket,
}

const MAX_BUCKETS: usize = 16384;

impl RateLimiter {
    pub fn new(burst: i32, period_ms: i32) -> Self {
        Self::with_capacity(burst, period_ms, MAX_BUCKETS)
    }

    /// A limiter tracking at most `capacity` addresses.
    pub fn with_capacity(burst: i32, period_ms: i32, capacity: usize) -> Self {
        Self {
            burst,
            period: period_ms.max(1),
            capacity: capacity.max(1),
            buckets: HashMap::new(),
            outbound: Bucket::default(),
        }
    }

    /// Whether a request from `ip` at `now` should be ignored.
    pub fn limit_address(&mut self, ip: IpAddr, now: i32) -> bool {
        if self.buckets.len() >= self.capacity && !self.buckets.contains_key(&ip) {
            let horizon = self.period * self.burst;
            self.buckets.retain(|_, b| now - b.last_time < horizon);
            if self.buckets.len() >= self.capacity {
                let oldest = self.buckets.iter().min_by_key(|(_, b)| b.last_time).map(|(a, _)| *a);
                if let Some(oldest) = oldest {
                    self.buckets.remove(&oldest);
                }
            }
        }
        let (burst, period) = (self.burst, self.period);
        self.buckets.entry(ip).or_default().limit(now, burst, period)
    }

    /// Shared budget for replies that are cheap to request but costly to
    /// send, such as status queries.
    pub fn limit_outbound(&mut self, now: i32, burst: i32, period_ms: i32) -> bool {
        self.outbound.limit(now, burst, period_ms.max(1))
    }
}

/// `Sys_IsLANAddress`: loopback, private and link-local addresses.
pub fn is_lan_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xffc0) == 0xfe80 || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn challenge_is_stable_per_address() {
        let mut c = Challenges::default();
        let mut rng = rand::thread_rng();
        let a: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:5000".parse().unwrap();
        let first = c.issue(a, 11, 0, &mut rng);
        assert_eq!(c.issue(a, 12, 10, &mut rng), first);
        assert!(first >= 0);
        assert!(c.verify(a, first));
        assert!(!c.verify(b, first));
        assert_eq!(c.client_challenge(a), Some(12));
    }

    #[test]
    fn subnet_bans_and_exceptions() {
        let mut list = BanList::default();
        list.add(Ban::parse("192.168.0.0/16", false).unwrap()).unwrap();
        list.add(Ban::parse("192.168.1.7", true).unwrap()).unwrap();

        assert!(list.is_banned(ip("192.168.44.2")));
        assert!(!list.is_banned(ip("192.168.1.7")));
        assert!(!list.is_banned(ip("10.1.1.1")));

        assert_eq!(list.remove(&Ban::parse("192.168.0.0/16", false).unwrap()), 1);
        assert!(!list.is_banned(ip("192.168.44.2")));
    }

    #[test]
    fn odd_prefix_lengths() {
        let b = Ban::parse("10.0.0.0/9", false).unwrap();
        assert!(b.matches(ip("10.127.255.255")));
        assert!(!b.matches(ip("10.128.0.0")));
        assert!(Ban::parse("10.0.0.0/33", false).is_err());
        assert!(Ban::parse("not-an-ip", false).is_err());
    }

    #[test]
    fn full_ban_list_is_untouched() {
        let mut list = BanList::default();
        for i in 0..SERVER_MAXBANS {
            let ban = Ban {
                net: IpAddr::from([10, 0, (i / 256) as u8, (i % 256) as u8]),
                bits: 32,
                exception: false,
            };
            list.add(ban).unwrap();
        }
        let err = list.add(Ban::parse("172.16.0.1", false).unwrap()).unwrap_err();
        assert_eq!(err.table, "SERVER_MAXBANS");
        assert_eq!(list.len(), SERVER_MAXBANS);
    }

    #[test]
    fn leaky_bucket_allows_bursts_then_refills() {
        let mut r = RateLimiter::new(3, 1000);
        let a = ip("10.0.0.1");
        assert!(!r.limit_address(a, 0));
        assert!(!r.limit_address(a, 0));
        assert!(!r.limit_address(a, 0));
        assert!(r.limit_address(a, 10));
        assert!(!r.limit_address(ip("10.0.0.2"), 10));
        assert!(!r.limit_address(a, 1010));
    }

    #[test]
    fn bucket_table_never_exceeds_capacity() {
        let mut r = RateLimiter::with_capacity(3, 1000, 4);
        for i in 0..4u8 {
            assert!(!r.limit_address(IpAddr::from([10, 0, 0, i]), 1000 + i32::from(i)));
        }
        // Every bucket is still fresh, so the oldest one gives way.
        assert!(!r.limit_address(ip("10.0.0.9"), 1010));
        assert_eq!(r.buckets.len(), 4);
        assert!(!r.limit_address(ip("10.0.0.9"), 1011));
        assert_eq!(r.buckets.len(), 4);
        // 10.0.0.0 was evicted and starts with a fresh allowance.
        for _ in 0..3 {
            assert!(!r.limit_address(ip("10.0.0.0"), 1012));
        }
        assert!(r.limit_address(ip("10.0.0.0"), 1012));
        assert_eq!(r.buckets.len(), 4);
    }

    #[test]
    fn lan_addresses() {
        assert!(is_lan_address(ip("127.0.0.1")));
        assert!(is_lan_address(ip("192.168.1.20")));
        assert!(is_lan_address(ip("10.4.0.1")));
        assert!(is_lan_address(ip("::1")));
        assert!(!is_lan_address(ip("203.0.113.5")));
        assert!(!is_lan_address(ip("2001:db8::1")));
    }
}
