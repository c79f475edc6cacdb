//! Bounded, LRU-evicting connection table keyed by 5-tuple.
//!
//! Grounded on the teacher's `flow_keys: HashMap<FlowKey, FlowEntry>` plus
//! its pool-exhaustion admission control (`tcp_pool`/`udp_pool`), generalized
//! from a fixed-size socket pool into capacity-based least-recently-active
//! eviction. TCP and UDP live in separate buckets so their caps (1000/500)
//! and entry types are independent.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use rustc_hash::FxHashMap;

pub const MAX_TCP_FLOWS: usize = 1000;
pub const MAX_UDP_FLOWS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Immutable 5-tuple identifying a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn new(protocol: Protocol, src_ip: Ipv4Addr, src_port: u16, dst_ip: Ipv4Addr, dst_port: u16) -> Self {
        Self {
            protocol,
            src_ip,
            src_port,
            dst_ip,
            dst_port,
        }
    }

    /// The key as seen from the other side of the connection (used to
    /// address synthesized replies/resets back to the original client).
    pub fn reversed(&self) -> Self {
        Self {
            protocol: self.protocol,
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
        }
    }
}

/// Anything storable in the table must expose when it was last active so
/// the table can pick an eviction victim without reaching into flow
/// internals.
pub trait Activity {
    fn last_activity(&self) -> Instant;
}

struct Slot<V> {
    value: V,
    tick: u64,
}

/// A single protocol's bounded map: capacity enforcement plus an
/// activity-ordered index used to find the least-recently-active entry in
/// O(log n) without touching per-flow state.
struct Bucket<V> {
    capacity: usize,
    entries: FxHashMap<FlowKey, Slot<V>>,
    order: BTreeMap<u64, FlowKey>,
    next_tick: u64,
}

impl<V: Activity> Bucket<V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: FxHashMap::default(),
            order: BTreeMap::new(),
            next_tick: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        let t = self.next_tick;
        self.next_tick += 1;
        t
    }

    fn touch(&mut self, key: &FlowKey) {
        if let Some(slot) = self.entries.get_mut(key) {
            self.order.remove(&slot.tick);
            let new_tick = self.next_tick;
            self.next_tick += 1;
            slot.tick = new_tick;
            self.order.insert(new_tick, *key);
        }
    }

    fn get(&self, key: &FlowKey) -> Option<&V> {
        self.entries.get(key).map(|s| &s.value)
    }

    fn get_mut(&mut self, key: &FlowKey) -> Option<&mut V> {
        self.entries.get_mut(key).map(|s| &mut s.value)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    /// Evicts the single least-recently-active entry, if any, and returns it
    /// for the caller to destroy (e.g. abort its task, close its socket).
    fn evict_lru(&mut self) -> Option<(FlowKey, V)> {
        let (&tick, &key) = self.order.iter().next()?;
        self.order.remove(&tick);
        self.entries.remove(&key).map(|slot| (key, slot.value))
    }

    /// Inserts `value`, evicting the least-recently-active entry first if
    /// the bucket is at capacity. Returns the evicted entry, if one was
    /// needed, alongside the newly inserted key.
    fn insert(&mut self, key: FlowKey, value: V) -> Option<(FlowKey, V)> {
        let evicted = if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            self.evict_lru()
        } else {
            None
        };
        if let Some(old) = self.entries.remove(&key) {
            self.order.remove(&old.tick);
        }
        let tick = self.tick();
        self.order.insert(tick, key);
        self.entries.insert(key, Slot { value, tick });
        evicted
    }

    fn remove(&mut self, key: &FlowKey) -> Option<V> {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.tick);
        Some(slot.value)
    }

    /// Removes every entry whose `last_activity() + threshold <= now`,
    /// returning them for destruction.
    fn evict_idle(&mut self, now: Instant, threshold: std::time::Duration) -> Vec<(FlowKey, V)> {
        let stale: Vec<FlowKey> = self
            .entries
            .iter()
            .filter(|(_, slot)| now.saturating_duration_since(slot.value.last_activity()) >= threshold)
            .map(|(k, _)| *k)
            .collect();
        stale
            .into_iter()
            .filter_map(|key| self.remove(&key).map(|v| (key, v)))
            .collect()
    }

    fn drain_all(&mut self) -> Vec<(FlowKey, V)> {
        self.order.clear();
        self.entries
            .drain()
            .map(|(k, slot)| (k, slot.value))
            .collect()
    }
}

/// Aggregate, atomically-updated counters returned by `snapshot_stats`.
#[derive(Default)]
pub struct Stats {
    pub tcp_total: AtomicU64,
    pub tcp_active: AtomicU64,
    pub udp_total: AtomicU64,
    pub udp_active: AtomicU64,
    pub bytes_in_total: AtomicU64,
    pub bytes_out_total: AtomicU64,
}

/// A consistent snapshot of `Stats` at one instant.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub tcp_total: u64,
    pub tcp_active: u64,
    pub udp_total: u64,
    pub udp_active: u64,
    pub bytes_in_total: u64,
    pub bytes_out_total: u64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tcp_total: self.tcp_total.load(Ordering::Relaxed),
            tcp_active: self.tcp_active.load(Ordering::Relaxed),
            udp_total: self.udp_total.load(Ordering::Relaxed),
            udp_active: self.udp_active.load(Ordering::Relaxed),
            bytes_in_total: self.bytes_in_total.load(Ordering::Relaxed),
            bytes_out_total: self.bytes_out_total.load(Ordering::Relaxed),
        }
    }

    pub fn record_bytes_in(&self, n: u64) {
        self.bytes_in_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_bytes_out(&self, n: u64) {
        self.bytes_out_total.fetch_add(n, Ordering::Relaxed);
    }
}

/// Bounded map of active flows, keyed by 5-tuple, with TCP and UDP held in
/// independent buckets. Exclusively owned by the router task; other tasks
/// never reach into it directly (see the concurrency model).
pub struct ConnectionTable<T, U> {
    tcp: Bucket<T>,
    udp: Bucket<U>,
    pub stats: Stats,
}

impl<T: Activity, U: Activity> ConnectionTable<T, U> {
    pub fn new() -> Self {
        Self {
            tcp: Bucket::new(MAX_TCP_FLOWS),
            udp: Bucket::new(MAX_UDP_FLOWS),
            stats: Stats::default(),
        }
    }

    pub fn insert_tcp(&mut self, key: FlowKey, flow: T) -> Option<(FlowKey, T)> {
        let evicted = self.tcp.insert(key, flow);
        self.stats.tcp_total.fetch_add(1, Ordering::Relaxed);
        if evicted.is_some() {
            self.stats.tcp_active.fetch_sub(1, Ordering::Relaxed);
        }
        self.stats.tcp_active.fetch_add(1, Ordering::Relaxed);
        evicted
    }

    pub fn get_tcp(&self, key: &FlowKey) -> Option<&T> {
        self.tcp.get(key)
    }

    pub fn get_tcp_mut(&mut self, key: &FlowKey) -> Option<&mut T> {
        self.tcp.get_mut(key)
    }

    pub fn touch_tcp(&mut self, key: &FlowKey) {
        self.tcp.touch(key)
    }

    pub fn remove_tcp(&mut self, key: &FlowKey) -> Option<T> {
        let removed = self.tcp.remove(key);
        if removed.is_some() {
            self.stats.tcp_active.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn tcp_len(&self) -> usize {
        self.tcp.len()
    }

    pub fn insert_udp(&mut self, key: FlowKey, flow: U) -> Option<(FlowKey, U)> {
        let evicted = self.udp.insert(key, flow);
        self.stats.udp_total.fetch_add(1, Ordering::Relaxed);
        if evicted.is_some() {
            self.stats.udp_active.fetch_sub(1, Ordering::Relaxed);
        }
        self.stats.udp_active.fetch_add(1, Ordering::Relaxed);
        evicted
    }

    pub fn get_udp(&self, key: &FlowKey) -> Option<&U> {
        self.udp.get(key)
    }

    pub fn get_udp_mut(&mut self, key: &FlowKey) -> Option<&mut U> {
        self.udp.get_mut(key)
    }

    pub fn touch_udp(&mut self, key: &FlowKey) {
        self.udp.touch(key)
    }

    pub fn remove_udp(&mut self, key: &FlowKey) -> Option<U> {
        let removed = self.udp.remove(key);
        if removed.is_some() {
            self.stats.udp_active.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn udp_len(&self) -> usize {
        self.udp.len()
    }

    /// Removes flows idle past their respective thresholds, returning them
    /// for destruction by the caller.
    pub fn evict_idle(
        &mut self,
        now: Instant,
        tcp_threshold: std::time::Duration,
        udp_threshold: std::time::Duration,
    ) -> (Vec<(FlowKey, T)>, Vec<(FlowKey, U)>) {
        let tcp_evicted = self.tcp.evict_idle(now, tcp_threshold);
        let udp_evicted = self.udp.evict_idle(now, udp_threshold);
        self.stats
            .tcp_active
            .fetch_sub(tcp_evicted.len() as u64, Ordering::Relaxed);
        self.stats
            .udp_active
            .fetch_sub(udp_evicted.len() as u64, Ordering::Relaxed);
        (tcp_evicted, udp_evicted)
    }

    /// Drains every flow (TCP then UDP) for destruction, e.g. on shutdown.
    pub fn close_all(&mut self) -> (Vec<(FlowKey, T)>, Vec<(FlowKey, U)>) {
        let tcp = self.tcp.drain_all();
        let udp = self.udp.drain_all();
        self.stats.tcp_active.store(0, Ordering::Relaxed);
        self.stats.udp_active.store(0, Ordering::Relaxed);
        (tcp, udp)
    }

    pub fn snapshot_stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl<T: Activity, U: Activity> Default for ConnectionTable<T, U> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Dummy {
        last: Instant,
    }
    impl Activity for Dummy {
        fn last_activity(&self) -> Instant {
            self.last
        }
    }

    fn key(n: u16) -> FlowKey {
        FlowKey::new(Protocol::Tcp, Ipv4Addr::new(10, 0, 0, 1), n, Ipv4Addr::new(1, 1, 1, 1), 80)
    }

    #[test]
    fn capacity_is_enforced_via_lru_eviction() {
        let mut table: ConnectionTable<Dummy, Dummy> = ConnectionTable::new();
        for i in 0..MAX_TCP_FLOWS as u16 {
            table.insert_tcp(key(i), Dummy { last: Instant::now() });
        }
        assert_eq!(table.tcp_len(), MAX_TCP_FLOWS);
        let evicted = table.insert_tcp(key(MAX_TCP_FLOWS as u16), Dummy { last: Instant::now() });
        assert!(evicted.is_some());
        assert_eq!(evicted.unwrap().0, key(0));
        assert_eq!(table.tcp_len(), MAX_TCP_FLOWS);
    }

    #[test]
    fn touch_protects_an_entry_from_being_the_next_victim() {
        let mut table: ConnectionTable<Dummy, Dummy> = ConnectionTable::new();
        for i in 0..MAX_TCP_FLOWS as u16 {
            table.insert_tcp(key(i), Dummy { last: Instant::now() });
        }
        table.touch_tcp(&key(0));
        let evicted = table.insert_tcp(key(MAX_TCP_FLOWS as u16), Dummy { last: Instant::now() });
        assert_eq!(evicted.unwrap().0, key(1));
    }

    #[test]
    fn evict_idle_removes_past_threshold_only() {
        let mut table: ConnectionTable<Dummy, Dummy> = ConnectionTable::new();
        let now = Instant::now();
        table.insert_tcp(
            key(0),
            Dummy {
                last: now - Duration::from_secs(200),
            },
        );
        table.insert_tcp(key(1), Dummy { last: now });
        let (tcp, _) = table.evict_idle(now, Duration::from_secs(120), Duration::from_secs(60));
        assert_eq!(tcp.len(), 1);
        assert_eq!(tcp[0].0, key(0));
        assert_eq!(table.tcp_len(), 1);
    }

    #[test]
    fn stats_never_go_negative_and_total_only_increases() {
        let mut table: ConnectionTable<Dummy, Dummy> = ConnectionTable::new();
        table.insert_tcp(key(0), Dummy { last: Instant::now() });
        table.remove_tcp(&key(0));
        table.insert_tcp(key(1), Dummy { last: Instant::now() });
        let snap = table.snapshot_stats();
        assert_eq!(snap.tcp_total, 2);
        assert_eq!(snap.tcp_active, 1);
    }
}
