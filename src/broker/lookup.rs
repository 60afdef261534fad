//! Broker id <-> address lookup for intra-cluster RPC.
//!
//! Updated from gossip events on every broker; read by the controller when
//! fanning out LeaderAndIsr and by followers when opening replicator
//! connections.

use dashmap::DashMap;

use crate::cluster::Member;

#[derive(Default)]
pub struct BrokerLookup {
    brokers: DashMap<i32, Member>,
}

impl BrokerLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_broker(&self, member: Member) {
        self.brokers.insert(member.id, member);
    }

    pub fn broker_by_id(&self, id: i32) -> Option<Member> {
        self.brokers.get(&id).map(|entry| entry.value().clone())
    }

    pub fn remove_broker(&self, id: i32) {
        self.brokers.remove(&id);
    }

    pub fn brokers(&self) -> Vec<Member> {
        let mut all: Vec<Member> = self
            .brokers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by_key(|m| m.id);
        all
    }

    pub fn len(&self) -> usize {
        self.brokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.brokers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::BrokerStatus;

    fn member(id: i32) -> Member {
        Member {
            id,
            addr: format!("127.0.0.1:{}", 9000 + id),
            raft_addr: format!("127.0.0.1:{}", 9100 + id),
            serf_addr: format!("127.0.0.1:{}", 9200 + id),
            status: BrokerStatus::Alive,
        }
    }

    #[test]
    fn add_and_find_broker() {
        let lookup = BrokerLookup::new();
        lookup.add_broker(member(1));

        let found = lookup.broker_by_id(1).unwrap();
        assert_eq!(found.addr, "127.0.0.1:9001");
        assert!(lookup.broker_by_id(2).is_none());
    }

    #[test]
    fn add_same_id_overwrites() {
        let lookup = BrokerLookup::new();
        lookup.add_broker(member(1));
        let mut updated = member(1);
        updated.addr = "10.0.0.1:9092".to_string();
        lookup.add_broker(updated);

        assert_eq!(lookup.len(), 1);
        assert_eq!(lookup.broker_by_id(1).unwrap().addr, "10.0.0.1:9092");
    }

    #[test]
    fn brokers_sorted_by_id() {
        let lookup = BrokerLookup::new();
        lookup.add_broker(member(3));
        lookup.add_broker(member(1));
        lookup.add_broker(member(2));

        let ids: Vec<i32> = lookup.brokers().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn remove_broker() {
        let lookup = BrokerLookup::new();
        lookup.add_broker(member(1));
        lookup.remove_broker(1);
        assert!(lookup.is_empty());
    }
}
