//! Per-remote delivery statistics.
//!
//! The gate records the outcome of every work item here and uses the
//! counters to order transport attempts: the proto that most recently
//! succeeded for a remote goes first on the next outbox.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use bitdust_shared::types::IdUrl;

use crate::transport::{ContactAddress, TransportProto};

#[derive(Debug, Clone, Default)]
pub struct DeliveryCounters {
    pub sent: u64,
    pub acked: u64,
    pub failed: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct DeliveryStats {
    counters: HashMap<(IdUrl, TransportProto), DeliveryCounters>,
}

impl DeliveryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_sent(&mut self, remote: &IdUrl, proto: TransportProto) {
        self.entry(remote, proto).sent += 1;
    }

    pub fn on_acked(&mut self, remote: &IdUrl, proto: TransportProto) {
        let c = self.entry(remote, proto);
        c.acked += 1;
        c.last_success = Some(Utc::now());
    }

    pub fn on_failed(&mut self, remote: &IdUrl, proto: TransportProto) {
        let c = self.entry(remote, proto);
        c.failed += 1;
        c.last_failure = Some(Utc::now());
    }

    pub fn counters(&self, remote: &IdUrl, proto: TransportProto) -> Option<&DeliveryCounters> {
        self.counters.get(&(remote.clone(), proto))
    }

    /// When the remote last acked anything, across all transports.
    pub fn last_seen(&self, remote: &IdUrl) -> Option<DateTime<Utc>> {
        self.counters
            .iter()
            .filter(|((idurl, _), _)| idurl == remote)
            .filter_map(|(_, c)| c.last_success)
            .max()
    }

    /// Order contact methods: most recently successful proto first,
    /// untried ones before known-failing ones, declared order otherwise.
    pub fn order_contacts(
        &self,
        remote: &IdUrl,
        contacts: Vec<ContactAddress>,
    ) -> Vec<ContactAddress> {
        let mut ranked: Vec<(ContactAddress, i64)> = contacts
            .into_iter()
            .map(|c| {
                let score = match self.counters.get(&(remote.clone(), c.proto)) {
                    Some(counters) => match (counters.last_success, counters.last_failure) {
                        (Some(s), Some(f)) if s >= f => s.timestamp_millis(),
                        (Some(_), Some(_)) | (None, Some(_)) => i64::MIN + 1,
                        (Some(s), None) => s.timestamp_millis(),
                        (None, None) => 0,
                    },
                    None => 0,
                };
                (c, score)
            })
            .collect();
        // Stable sort keeps declared order inside equal ranks.
        ranked.sort_by_key(|(_, score)| std::cmp::Reverse(*score));
        ranked.into_iter().map(|(c, _)| c).collect()
    }

    fn entry(&mut self, remote: &IdUrl, proto: TransportProto) -> &mut DeliveryCounters {
        self.counters
            .entry((remote.clone(), proto))
            .or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> IdUrl {
        IdUrl::for_user("id.example.com", 8084, "bob")
    }

    fn tcp(host: &str) -> ContactAddress {
        ContactAddress {
            proto: TransportProto::Tcp,
            host: host.into(),
        }
    }

    fn mem(host: &str) -> ContactAddress {
        ContactAddress {
            proto: TransportProto::Memory,
            host: host.into(),
        }
    }

    #[test]
    fn successful_proto_ranks_first() {
        let mut stats = DeliveryStats::new();
        stats.on_sent(&remote(), TransportProto::Memory);
        stats.on_acked(&remote(), TransportProto::Memory);

        let ordered = stats.order_contacts(&remote(), vec![tcp("a:1"), mem("b")]);
        assert_eq!(ordered[0].proto, TransportProto::Memory);
    }

    #[test]
    fn failing_proto_ranks_last() {
        let mut stats = DeliveryStats::new();
        stats.on_sent(&remote(), TransportProto::Tcp);
        stats.on_failed(&remote(), TransportProto::Tcp);

        let ordered = stats.order_contacts(&remote(), vec![tcp("a:1"), mem("b")]);
        assert_eq!(ordered[0].proto, TransportProto::Memory);
        assert_eq!(ordered[1].proto, TransportProto::Tcp);
    }

    #[test]
    fn declared_order_kept_without_history() {
        let stats = DeliveryStats::new();
        let ordered = stats.order_contacts(&remote(), vec![tcp("a:1"), mem("b")]);
        assert_eq!(ordered[0], tcp("a:1"));
    }

    #[test]
    fn last_seen_tracks_acks() {
        let mut stats = DeliveryStats::new();
        assert!(stats.last_seen(&remote()).is_none());
        stats.on_acked(&remote(), TransportProto::Tcp);
        assert!(stats.last_seen(&remote()).is_some());
    }
}
