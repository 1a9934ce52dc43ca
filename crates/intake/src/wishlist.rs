use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use procura_core::{Aggregate, AggregateId, AggregateRoot, CustomerId, DomainError, UserId};
use procura_events::Event;

use crate::request::WishlistLine;

/// Wishlist entry identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WishlistEntryId(pub AggregateId);

impl WishlistEntryId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for WishlistEntryId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Aggregate root: WishlistEntry.
///
/// Amendable by the owning agent until conversion; once converted it is
/// archived in place (flagged, never deleted) for audit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WishlistEntry {
    id: WishlistEntryId,
    customer_id: Option<CustomerId>,
    agent_id: Option<UserId>,
    lines: Vec<WishlistLine>,
    converted_order: Option<AggregateId>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl WishlistEntry {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: WishlistEntryId) -> Self {
        Self {
            id,
            customer_id: None,
            agent_id: None,
            lines: Vec::new(),
            converted_order: None,
            created_at: None,
            updated_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> WishlistEntryId {
        self.id
    }

    pub fn customer_id(&self) -> Option<CustomerId> {
        self.customer_id
    }

    pub fn agent_id(&self) -> Option<UserId> {
        self.agent_id
    }

    pub fn lines(&self) -> &[WishlistLine] {
        &self.lines
    }

    /// The purchase order this entry was converted into, if any.
    pub fn converted_order(&self) -> Option<AggregateId> {
        self.converted_order
    }

    pub fn is_converted(&self) -> bool {
        self.converted_order.is_some()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn is_created(&self) -> bool {
        self.created
    }
}

impl AggregateRoot for WishlistEntry {
    type Id = WishlistEntryId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: SubmitWishlist (from a normalized draft).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitWishlist {
    pub entry_id: WishlistEntryId,
    pub customer_id: CustomerId,
    pub agent_id: UserId,
    pub lines: Vec<WishlistLine>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AmendLines (owning agent only, until conversion).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmendLines {
    pub entry_id: WishlistEntryId,
    pub actor: UserId,
    pub lines: Vec<WishlistLine>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkConverted (idempotent when re-marked with the same order).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkConverted {
    pub entry_id: WishlistEntryId,
    pub order_id: AggregateId,
    pub converted_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WishlistCommand {
    SubmitWishlist(SubmitWishlist),
    AmendLines(AmendLines),
    MarkConverted(MarkConverted),
}

/// Event: WishlistSubmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WishlistSubmitted {
    pub entry_id: WishlistEntryId,
    pub customer_id: CustomerId,
    pub agent_id: UserId,
    pub lines: Vec<WishlistLine>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: WishlistAmended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WishlistAmended {
    pub entry_id: WishlistEntryId,
    pub lines: Vec<WishlistLine>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: WishlistConverted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WishlistConverted {
    pub entry_id: WishlistEntryId,
    pub order_id: AggregateId,
    pub converted_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WishlistEvent {
    WishlistSubmitted(WishlistSubmitted),
    WishlistAmended(WishlistAmended),
    WishlistConverted(WishlistConverted),
}

impl Event for WishlistEvent {
    fn event_type(&self) -> &'static str {
        match self {
            WishlistEvent::WishlistSubmitted(_) => "intake.wishlist.submitted",
            WishlistEvent::WishlistAmended(_) => "intake.wishlist.amended",
            WishlistEvent::WishlistConverted(_) => "intake.wishlist.converted",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            WishlistEvent::WishlistSubmitted(e) => e.occurred_at,
            WishlistEvent::WishlistAmended(e) => e.occurred_at,
            WishlistEvent::WishlistConverted(e) => e.occurred_at,
        }
    }
}

impl Aggregate for WishlistEntry {
    type Command = WishlistCommand;
    type Event = WishlistEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            WishlistEvent::WishlistSubmitted(e) => {
                self.id = e.entry_id;
                self.customer_id = Some(e.customer_id);
                self.agent_id = Some(e.agent_id);
                self.lines = e.lines.clone();
                self.created_at = Some(e.occurred_at);
                self.updated_at = Some(e.occurred_at);
                self.created = true;
            }
            WishlistEvent::WishlistAmended(e) => {
                self.lines = e.lines.clone();
                self.updated_at = Some(e.occurred_at);
            }
            WishlistEvent::WishlistConverted(e) => {
                self.converted_order = Some(e.order_id);
                self.updated_at = Some(e.occurred_at);
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            WishlistCommand::SubmitWishlist(cmd) => self.handle_submit(cmd),
            WishlistCommand::AmendLines(cmd) => self.handle_amend(cmd),
            WishlistCommand::MarkConverted(cmd) => self.handle_mark_converted(cmd),
        }
    }
}

impl WishlistEntry {
    fn ensure_entry_id(&self, entry_id: WishlistEntryId) -> Result<(), DomainError> {
        if self.id != entry_id {
            return Err(DomainError::invariant("entry_id mismatch"));
        }
        Ok(())
    }

    fn handle_submit(&self, cmd: &SubmitWishlist) -> Result<Vec<WishlistEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("wishlist entry already exists"));
        }
        if cmd.lines.is_empty() {
            return Err(DomainError::validation("wishlist has no lines"));
        }

        Ok(vec![WishlistEvent::WishlistSubmitted(WishlistSubmitted {
            entry_id: cmd.entry_id,
            customer_id: cmd.customer_id,
            agent_id: cmd.agent_id,
            lines: cmd.lines.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_amend(&self, cmd: &AmendLines) -> Result<Vec<WishlistEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_entry_id(cmd.entry_id)?;

        if self.is_converted() {
            return Err(DomainError::invalid_transition(
                "converted wishlist entries are immutable",
            ));
        }
        if self.agent_id != Some(cmd.actor) {
            return Err(DomainError::Unauthorized);
        }
        if cmd.lines.is_empty() {
            return Err(DomainError::validation("wishlist has no lines"));
        }

        Ok(vec![WishlistEvent::WishlistAmended(WishlistAmended {
            entry_id: cmd.entry_id,
            lines: cmd.lines.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mark_converted(
        &self,
        cmd: &MarkConverted,
    ) -> Result<Vec<WishlistEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_entry_id(cmd.entry_id)?;

        match self.converted_order {
            // Re-marking with the same order: recognized no-op (retry).
            Some(existing) if existing == cmd.order_id => Ok(vec![]),
            Some(_) => Err(DomainError::conflict(
                "wishlist entry already converted to a different order",
            )),
            None => Ok(vec![WishlistEvent::WishlistConverted(WishlistConverted {
                entry_id: cmd.entry_id,
                order_id: cmd.order_id,
                converted_by: cmd.converted_by,
                occurred_at: cmd.occurred_at,
            })]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procura_products::ProductKey;

    fn test_entry_id() -> WishlistEntryId {
        WishlistEntryId::new(AggregateId::new())
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn test_lines() -> Vec<WishlistLine> {
        vec![WishlistLine {
            title: "Arabica Beans".to_string(),
            sku: None,
            key: ProductKey::from_title_or_sku("Arabica Beans", None),
            quantity: 5,
            comment: None,
        }]
    }

    fn submitted_entry(agent: UserId) -> WishlistEntry {
        let mut entry = WishlistEntry::empty(test_entry_id());
        let cmd = SubmitWishlist {
            entry_id: entry.id_typed(),
            customer_id: CustomerId::new(),
            agent_id: agent,
            lines: test_lines(),
            occurred_at: test_time(),
        };
        let events = entry
            .handle(&WishlistCommand::SubmitWishlist(cmd))
            .unwrap();
        for e in &events {
            entry.apply(e);
        }
        entry
    }

    #[test]
    fn submit_creates_entry_with_timestamps() {
        let agent = UserId::new();
        let entry = submitted_entry(agent);

        assert!(entry.is_created());
        assert!(!entry.is_converted());
        assert_eq!(entry.agent_id(), Some(agent));
        assert!(entry.created_at().is_some());
        assert_eq!(entry.created_at(), entry.updated_at());
    }

    #[test]
    fn only_the_owning_agent_may_amend() {
        let agent = UserId::new();
        let mut entry = submitted_entry(agent);

        let stranger = AmendLines {
            entry_id: entry.id_typed(),
            actor: UserId::new(),
            lines: test_lines(),
            occurred_at: test_time(),
        };
        let err = entry
            .handle(&WishlistCommand::AmendLines(stranger))
            .unwrap_err();
        assert_eq!(err, DomainError::Unauthorized);

        let owner = AmendLines {
            entry_id: entry.id_typed(),
            actor: agent,
            lines: test_lines(),
            occurred_at: test_time(),
        };
        let events = entry.handle(&WishlistCommand::AmendLines(owner)).unwrap();
        entry.apply(&events[0]);
        assert!(entry.updated_at() >= entry.created_at());
    }

    #[test]
    fn converted_entries_are_immutable_but_retained() {
        let agent = UserId::new();
        let mut entry = submitted_entry(agent);
        let order_id = AggregateId::new();

        let convert = MarkConverted {
            entry_id: entry.id_typed(),
            order_id,
            converted_by: UserId::new(),
            occurred_at: test_time(),
        };
        let events = entry
            .handle(&WishlistCommand::MarkConverted(convert))
            .unwrap();
        entry.apply(&events[0]);
        assert_eq!(entry.converted_order(), Some(order_id));

        // Still readable (archived, not deleted) but refuses amendment.
        assert_eq!(entry.lines().len(), 1);
        let amend = AmendLines {
            entry_id: entry.id_typed(),
            actor: agent,
            lines: test_lines(),
            occurred_at: test_time(),
        };
        let err = entry
            .handle(&WishlistCommand::AmendLines(amend))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
    }

    #[test]
    fn remarking_with_same_order_is_a_no_op_with_other_order_a_conflict() {
        let mut entry = submitted_entry(UserId::new());
        let order_id = AggregateId::new();

        let convert = MarkConverted {
            entry_id: entry.id_typed(),
            order_id,
            converted_by: UserId::new(),
            occurred_at: test_time(),
        };
        let events = entry
            .handle(&WishlistCommand::MarkConverted(convert.clone()))
            .unwrap();
        entry.apply(&events[0]);

        let replay = entry
            .handle(&WishlistCommand::MarkConverted(convert))
            .unwrap();
        assert!(replay.is_empty());

        let other = MarkConverted {
            entry_id: entry.id_typed(),
            order_id: AggregateId::new(),
            converted_by: UserId::new(),
            occurred_at: test_time(),
        };
        let err = entry
            .handle(&WishlistCommand::MarkConverted(other))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }
}
