//! # Rerouting Table
//!
//! Rules that forward a frame from one client to another through the server
//! without application-level handling.
//!
//! The table is owned by whoever creates it (normally the server) and shared with
//! each connection's registry through an `Arc`. Rules are keyed by packet ID; at
//! most one rule exists per `(packet_id, from_client)` pair. Registering a second
//! rule for the same pair is an error; [`RerouteTable::replace_rule`] is the
//! explicit overwrite.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::ids;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RerouteRule {
    pub from_client: u8,
    pub to_client: u8,
    pub packet_id: u8,
    /// `false` when `packet_id` is one of the reserved IDs
    pub user_defined: bool,
}

impl RerouteRule {
    pub fn new(from_client: u8, to_client: u8, packet_id: u8) -> Self {
        Self {
            from_client,
            to_client,
            packet_id,
            user_defined: !ids::is_reserved(packet_id),
        }
    }
}

pub type SharedRerouteTable = Arc<RerouteTable>;

#[derive(Debug, Default)]
pub struct RerouteTable {
    rules: RwLock<HashMap<u8, Vec<RerouteRule>>>,
}

impl RerouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRerouteTable {
        Arc::new(Self::new())
    }

    fn check(rule: &RerouteRule) -> Result<()> {
        if rule.from_client == rule.to_client {
            return Err(ProtocolError::InvalidReroute(format!(
                "packet {} would loop back to client {}",
                rule.packet_id, rule.from_client
            )));
        }
        if matches!(
            rule.packet_id,
            ids::PEER_INFO | ids::DISCONNECT | ids::SERVER_STOP
        ) {
            return Err(ProtocolError::InvalidReroute(format!(
                "{} frames cannot be rerouted",
                ids::describe(rule.packet_id)
            )));
        }
        Ok(())
    }

    /// Append a rule. Fails if a rule for the same packet and origin exists.
    pub fn add_rule(&self, rule: RerouteRule) -> Result<()> {
        Self::check(&rule)?;
        let mut rules = self
            .rules
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REROUTE_LOCK.to_string()))?;
        let entry = rules.entry(rule.packet_id).or_default();
        if entry.iter().any(|r| r.from_client == rule.from_client) {
            return Err(ProtocolError::DuplicateReroute {
                packet_id: rule.packet_id,
                from_client: rule.from_client,
            });
        }
        debug!(
            packet_id = rule.packet_id,
            from = rule.from_client,
            to = rule.to_client,
            "Reroute rule added"
        );
        entry.push(rule);
        Ok(())
    }

    /// Insert `rule`, returning the rule it replaced
    pub fn replace_rule(&self, rule: RerouteRule) -> Result<Option<RerouteRule>> {
        Self::check(&rule)?;
        let mut rules = self
            .rules
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REROUTE_LOCK.to_string()))?;
        let entry = rules.entry(rule.packet_id).or_default();
        let previous = entry
            .iter()
            .position(|r| r.from_client == rule.from_client)
            .map(|idx| entry.remove(idx));
        entry.push(rule);
        Ok(previous)
    }

    pub fn remove_rule(&self, packet_id: u8, from_client: u8) -> Result<Option<RerouteRule>> {
        let mut rules = self
            .rules
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REROUTE_LOCK.to_string()))?;
        let Some(entry) = rules.get_mut(&packet_id) else {
            return Ok(None);
        };
        let removed = entry
            .iter()
            .position(|r| r.from_client == from_client)
            .map(|idx| entry.remove(idx));
        if entry.is_empty() {
            rules.remove(&packet_id);
        }
        Ok(removed)
    }

    pub fn rules_for(&self, packet_id: u8) -> Result<Vec<RerouteRule>> {
        let rules = self
            .rules
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REROUTE_LOCK.to_string()))?;
        Ok(rules.get(&packet_id).cloned().unwrap_or_default())
    }

    pub fn len(&self) -> usize {
        self.rules
            .read()
            .map(|rules| rules.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the rule that applies to a frame `sender_id` sent under `packet_id`,
    /// as seen by the peer whose own id is `local_id`.
    ///
    /// A rule whose destination is `local_id` never matches.
    pub fn evaluate(&self, packet_id: u8, sender_id: u8, local_id: u8) -> Result<Option<RerouteRule>> {
        let rules = self
            .rules
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REROUTE_LOCK.to_string()))?;
        Ok(rules.get(&packet_id).and_then(|candidates| {
            candidates
                .iter()
                .find(|r| r.from_client == sender_id && r.to_client != local_id)
                .copied()
        }))
    }
}
