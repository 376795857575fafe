use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

/// Subject type tag written into every card audit entry.
pub const CARD_SUBJECT_TYPE: &str = "Card";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    /// Role gate failed. Terminal for the request; no store access happened.
    #[error("authorization denied")]
    AuthorizationDenied,
    /// Absent id, inactive record, or ownership mismatch. Deliberately one
    /// signal for all three so callers cannot probe for existence.
    #[error("not found")]
    NotFound,
    #[error("validation error: {0}")]
    Validation(String),
    /// A conditional write lost a race. The whole operation may be retried.
    #[error("storage conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CardId(pub Ulid);

impl CardId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Ulid::from_string(value).ok().map(Self)
    }
}

impl Default for CardId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for CardId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AuditEntryId(pub Ulid);

impl AuditEntryId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Ulid::from_string(value).ok().map(Self)
    }
}

impl Default for AuditEntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for AuditEntryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Capability grants are disjoint: holding one role never implies the other.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    CardOwner,
    Admin,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CardOwner => "card-owner",
            Self::Admin => "admin",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "card-owner" => Some(Self::CardOwner),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    CardOperation,
    AuditOperation,
}

impl EndpointClass {
    #[must_use]
    pub fn required_role(self) -> Role {
        match self {
            Self::CardOperation => Role::CardOwner,
            Self::AuditOperation => Role::Admin,
        }
    }
}

/// Caller identity as supplied by the external authentication collaborator.
/// The core never validates credentials; it treats this as an immutable
/// per-request input.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Identity {
    pub name: String,
    pub roles: BTreeSet<Role>,
}

impl Identity {
    #[must_use]
    pub fn new(name: impl Into<String>, roles: impl IntoIterator<Item = Role>) -> Self {
        Self { name: name.into(), roles: roles.into_iter().collect() }
    }

    #[must_use]
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

/// One per-user financial record. `id` and `owner` never change after
/// creation; `active` only ever transitions true -> false.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Card {
    pub id: CardId,
    pub amount: f64,
    pub owner: String,
    pub active: bool,
}

/// Append-only audit record written when a card is deactivated. Owned by no
/// user; visible only through the admin audit lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEntry {
    pub id: AuditEntryId,
    pub subject_type: String,
    pub subject_id: CardId,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl AuditEntry {
    #[must_use]
    pub fn for_card(subject_id: CardId) -> Self {
        Self {
            id: AuditEntryId::new(),
            subject_type: CARD_SUBJECT_TYPE.to_string(),
            subject_id,
            recorded_at: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    Amount,
    Id,
}

impl SortKey {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Amount => "amount",
            Self::Id => "id",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "amount" => Some(Self::Amount),
            "id" => Some(Self::Id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct SortSpec {
    pub key: SortKey,
    pub direction: SortDirection,
}

impl Default for SortSpec {
    /// Ascending by amount, the list endpoint's documented default.
    fn default() -> Self {
        Self { key: SortKey::Amount, direction: SortDirection::Asc }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct PageSpec {
    pub page: u32,
    pub size: u32,
}

impl Default for PageSpec {
    fn default() -> Self {
        Self { page: 0, size: 20 }
    }
}

impl PageSpec {
    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.page) * u64::from(self.size)
    }
}

/// Result of a conditional write. `NotVisible` means no active card matched
/// the (id, owner) precondition at commit time; the engine reports it as
/// `NotFound`, keeping the outward signal identical to a truly absent id.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WriteOutcome {
    Applied,
    NotVisible,
}

/// Coarse role gate, evaluated before any store access and before the
/// ownership check, so that a role failure is distinguishable from
/// `NotFound` without leaking whether the resource exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct RolePolicy;

impl RolePolicy {
    /// # Errors
    /// Returns [`LedgerError::AuthorizationDenied`] when the identity lacks
    /// the role required by the endpoint class.
    pub fn authorize(
        &self,
        identity: &Identity,
        endpoint: EndpointClass,
    ) -> Result<(), LedgerError> {
        if identity.has_role(endpoint.required_role()) {
            Ok(())
        } else {
            Err(LedgerError::AuthorizationDenied)
        }
    }
}

/// Per-record gate, used uniformly for read, update and deactivate. An
/// inactive card is invisible to every non-admin caller, including its
/// former owner; recovery exists only through the admin audit lookup.
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnershipPolicy;

impl OwnershipPolicy {
    #[must_use]
    pub fn can_access(&self, identity: &Identity, card: &Card) -> bool {
        card.owner == identity.name && card.active
    }
}

/// Transactional seam over both store leaves. The card flip and the audit
/// append of a deactivation are one method so an implementation can commit
/// them as a single unit; no reader may ever observe one without the other.
pub trait LedgerStore {
    /// # Errors
    /// Returns [`LedgerError::Storage`] when the lookup fails.
    fn get_card(&mut self, id: CardId) -> Result<Option<Card>, LedgerError>;

    /// # Errors
    /// Returns [`LedgerError::Storage`] when the insert fails.
    fn insert_card(&mut self, card: &Card) -> Result<(), LedgerError>;

    /// Active cards for one owner, sorted and paged. The query is pre-scoped
    /// to the owner, so no per-item ownership check is needed.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when the query fails.
    fn find_by_owner(
        &mut self,
        owner: &str,
        page: &PageSpec,
        sort: &SortSpec,
    ) -> Result<Vec<Card>, LedgerError>;

    /// Conditional amount replacement: applies only while the card is still
    /// active and owned by `owner`, read and written atomically per id.
    ///
    /// # Errors
    /// Returns [`LedgerError::Conflict`] when the write lost a race, or
    /// [`LedgerError::Storage`] on other failures.
    fn update_amount(
        &mut self,
        id: CardId,
        owner: &str,
        amount: f64,
    ) -> Result<WriteOutcome, LedgerError>;

    /// One logical transaction: flip the card inactive AND append `entry`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Conflict`] when the write lost a race, or
    /// [`LedgerError::Storage`] on other failures.
    fn deactivate_with_audit(
        &mut self,
        id: CardId,
        owner: &str,
        entry: &AuditEntry,
    ) -> Result<WriteOutcome, LedgerError>;

    /// # Errors
    /// Returns [`LedgerError::Storage`] when the lookup fails.
    fn find_audit_by_subject(
        &mut self,
        subject_type: &str,
        subject_id: CardId,
    ) -> Result<Option<AuditEntry>, LedgerError>;
}

/// In-place sort used by in-memory stores; SQL stores express the same
/// ordering in their `ORDER BY`. Ties break ascending by id so that paging
/// is deterministic.
pub fn sort_cards(cards: &mut [Card], sort: &SortSpec) {
    cards.sort_by(|lhs, rhs| {
        let keyed = match sort.key {
            SortKey::Amount => lhs.amount.total_cmp(&rhs.amount),
            SortKey::Id => lhs.id.cmp(&rhs.id),
        };
        let directed = match sort.direction {
            SortDirection::Asc => keyed,
            SortDirection::Desc => keyed.reverse(),
        };
        directed.then_with(|| lhs.id.cmp(&rhs.id))
    });
}

fn validate_amount(amount: f64) -> Result<(), LedgerError> {
    if amount.is_finite() {
        Ok(())
    } else {
        Err(LedgerError::Validation("amount MUST be a finite number".to_string()))
    }
}

/// Single entry point for every card operation. Both policies are explicit
/// collaborators so tests can drive the engine with fabricated identities;
/// no store method runs before the role gate, and none targeting a specific
/// record runs before the ownership gate.
pub struct LifecycleEngine<S> {
    store: S,
    role_policy: RolePolicy,
    ownership_policy: OwnershipPolicy,
}

impl<S: LedgerStore> LifecycleEngine<S> {
    pub fn new(store: S) -> Self {
        Self { store, role_policy: RolePolicy, ownership_policy: OwnershipPolicy }
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// All active cards owned by the caller, sorted and paged.
    ///
    /// # Errors
    /// Returns [`LedgerError::AuthorizationDenied`] when the caller lacks the
    /// card-owner role, or a storage error from the query.
    pub fn list(
        &mut self,
        identity: &Identity,
        page: &PageSpec,
        sort: &SortSpec,
    ) -> Result<Vec<Card>, LedgerError> {
        self.role_policy.authorize(identity, EndpointClass::CardOperation)?;
        self.store.find_by_owner(&identity.name, page, sort)
    }

    /// # Errors
    /// Returns [`LedgerError::AuthorizationDenied`] when the role gate fails,
    /// or [`LedgerError::NotFound`] when the id is absent, inactive, or owned
    /// by someone else (one indistinguishable signal for all three).
    pub fn get(&mut self, identity: &Identity, id: CardId) -> Result<Card, LedgerError> {
        self.role_policy.authorize(identity, EndpointClass::CardOperation)?;
        let Some(card) = self.store.get_card(id)? else {
            return Err(LedgerError::NotFound);
        };
        if !self.ownership_policy.can_access(identity, &card) {
            return Err(LedgerError::NotFound);
        }
        Ok(card)
    }

    /// Creates a card owned by the caller. Id, owner and active state are
    /// assigned here; anything the caller attempted to supply for them was
    /// already discarded at the request boundary, so a caller can never seed
    /// a foreign or pre-deactivated record.
    ///
    /// # Errors
    /// Returns [`LedgerError::AuthorizationDenied`] when the role gate fails,
    /// or [`LedgerError::Validation`] for a non-finite amount.
    pub fn create(&mut self, identity: &Identity, amount: f64) -> Result<Card, LedgerError> {
        self.role_policy.authorize(identity, EndpointClass::CardOperation)?;
        validate_amount(amount)?;

        let card = Card {
            id: CardId::new(),
            amount,
            owner: identity.name.clone(),
            active: true,
        };
        self.store.insert_card(&card)?;
        Ok(card)
    }

    /// Replaces the amount only; id, owner and active state are preserved.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] through the same path as `get`,
    /// [`LedgerError::Validation`] for a non-finite amount, or
    /// [`LedgerError::Conflict`] when the conditional write lost a race.
    pub fn update(
        &mut self,
        identity: &Identity,
        id: CardId,
        new_amount: f64,
    ) -> Result<Card, LedgerError> {
        let card = self.get(identity, id)?;
        validate_amount(new_amount)?;

        match self.store.update_amount(id, &identity.name, new_amount)? {
            WriteOutcome::Applied => Ok(Card { amount: new_amount, ..card }),
            WriteOutcome::NotVisible => Err(LedgerError::NotFound),
        }
    }

    /// Soft delete: flips the card inactive and appends the audit entry as
    /// one transaction. The state transition is terminal; a second call
    /// reports `NotFound` because the first already removed the card from
    /// the caller's view, and no duplicate audit entry is written.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] through the same path as `get`, or
    /// [`LedgerError::Conflict`] when the conditional write lost a race.
    pub fn deactivate(
        &mut self,
        identity: &Identity,
        id: CardId,
    ) -> Result<AuditEntry, LedgerError> {
        self.get(identity, id)?;

        let entry = AuditEntry::for_card(id);
        match self.store.deactivate_with_audit(id, &identity.name, &entry)? {
            WriteOutcome::Applied => Ok(entry),
            WriteOutcome::NotVisible => Err(LedgerError::NotFound),
        }
    }

    /// Admin-only audit lookup, available even after the card has become
    /// invisible to its former owner.
    ///
    /// # Errors
    /// Returns [`LedgerError::AuthorizationDenied`] when the caller lacks the
    /// admin role, or [`LedgerError::NotFound`] when no entry exists.
    pub fn audit_entry(
        &mut self,
        identity: &Identity,
        subject_id: CardId,
    ) -> Result<AuditEntry, LedgerError> {
        self.role_policy.authorize(identity, EndpointClass::AuditOperation)?;
        self.store
            .find_audit_by_subject(CARD_SUBJECT_TYPE, subject_id)?
            .ok_or(LedgerError::NotFound)
    }
}

/// Deterministic in-memory implementation of the store seam. No I/O; drives
/// the engine in unit tests and benchmarks.
pub mod memory {
    use std::collections::BTreeMap;

    use super::{
        sort_cards, AuditEntry, Card, CardId, LedgerError, LedgerStore, PageSpec, SortSpec,
        WriteOutcome,
    };

    #[derive(Debug, Default)]
    pub struct MemoryStore {
        pub(crate) cards: BTreeMap<CardId, Card>,
        pub(crate) audit: Vec<AuditEntry>,
    }

    impl LedgerStore for MemoryStore {
        fn get_card(&mut self, id: CardId) -> Result<Option<Card>, LedgerError> {
            Ok(self.cards.get(&id).cloned())
        }

        fn insert_card(&mut self, card: &Card) -> Result<(), LedgerError> {
            self.cards.insert(card.id, card.clone());
            Ok(())
        }

        fn find_by_owner(
            &mut self,
            owner: &str,
            page: &PageSpec,
            sort: &SortSpec,
        ) -> Result<Vec<Card>, LedgerError> {
            let mut owned = self
                .cards
                .values()
                .filter(|card| card.owner == owner && card.active)
                .cloned()
                .collect::<Vec<_>>();
            sort_cards(&mut owned, sort);

            let offset = usize::try_from(page.offset()).unwrap_or(usize::MAX);
            Ok(owned
                .into_iter()
                .skip(offset)
                .take(page.size as usize)
                .collect())
        }

        fn update_amount(
            &mut self,
            id: CardId,
            owner: &str,
            amount: f64,
        ) -> Result<WriteOutcome, LedgerError> {
            match self.cards.get_mut(&id) {
                Some(card) if card.owner == owner && card.active => {
                    card.amount = amount;
                    Ok(WriteOutcome::Applied)
                }
                _ => Ok(WriteOutcome::NotVisible),
            }
        }

        fn deactivate_with_audit(
            &mut self,
            id: CardId,
            owner: &str,
            entry: &AuditEntry,
        ) -> Result<WriteOutcome, LedgerError> {
            match self.cards.get_mut(&id) {
                Some(card) if card.owner == owner && card.active => {
                    card.active = false;
                    self.audit.push(entry.clone());
                    Ok(WriteOutcome::Applied)
                }
                _ => Ok(WriteOutcome::NotVisible),
            }
        }

        fn find_audit_by_subject(
            &mut self,
            subject_type: &str,
            subject_id: CardId,
        ) -> Result<Option<AuditEntry>, LedgerError> {
            Ok(self
                .audit
                .iter()
                .find(|entry| entry.subject_type == subject_type && entry.subject_id == subject_id)
                .cloned())
        }
    }
}
