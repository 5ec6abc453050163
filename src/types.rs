//! Core types and data structures for the posting core

use bigdecimal::BigDecimal;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Account types following standard accounting principles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    /// Assets - what the business owns (Cash, Inventory, Equipment, etc.)
    Asset,
    /// Liabilities - what the business owes (Loans, Accounts Payable, etc.)
    Liability,
    /// Equity - owner's interest in the business
    Equity,
    /// Income/Revenue - money earned by the business
    Income,
    /// Expenses - costs incurred by the business
    Expense,
    /// Costs - production and sales costs tracked apart from expenses
    Cost,
}

impl AccountType {
    /// Returns the normal balance side for this account type
    pub fn normal_nature(&self) -> AccountNature {
        match self {
            AccountType::Asset | AccountType::Expense | AccountType::Cost => AccountNature::Debit,
            AccountType::Liability | AccountType::Equity | AccountType::Income => {
                AccountNature::Credit
            }
        }
    }
}

/// Side on which an account's balance normally grows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountNature {
    /// Debit-normal account (assets, expenses, costs)
    Debit,
    /// Credit-normal account (liabilities, equity, income)
    Credit,
}

/// Account record as seen by the posting core.
///
/// Leaf accounts receive postings; accounts with children hold the sum of
/// their direct children's current balances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub company_id: String,
    /// Hierarchical code, unique per company
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub account_type: AccountType,
    pub nature: AccountNature,
    /// Weak back-reference to the parent account's code
    pub parent_code: Option<String>,
    /// Depth in the chart, 1 for top-level accounts
    pub level: u32,
    pub is_active: bool,
    pub initial_debit_balance: BigDecimal,
    pub initial_credit_balance: BigDecimal,
    pub current_debit_balance: BigDecimal,
    pub current_credit_balance: BigDecimal,
    pub last_transaction_date: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Account {
    /// Create a new active account with zero balances
    pub fn new(
        company_id: String,
        code: String,
        name: String,
        account_type: AccountType,
        parent_code: Option<String>,
    ) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id: Uuid::new_v4(),
            company_id,
            level: crate::ledger::hierarchy::level_for_code(&code),
            code,
            name,
            description: None,
            nature: account_type.normal_nature(),
            account_type,
            parent_code,
            is_active: true,
            initial_debit_balance: BigDecimal::from(0),
            initial_credit_balance: BigDecimal::from(0),
            current_debit_balance: BigDecimal::from(0),
            current_credit_balance: BigDecimal::from(0),
            last_transaction_date: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Net balance on the account's normal side
    pub fn net_balance(&self) -> BigDecimal {
        match self.nature {
            AccountNature::Debit => &self.current_debit_balance - &self.current_credit_balance,
            AccountNature::Credit => &self.current_credit_balance - &self.current_debit_balance,
        }
    }

    /// Add a posted movement to the current balances
    pub fn apply_movement(&mut self, debit: &BigDecimal, credit: &BigDecimal, at: NaiveDateTime) {
        self.current_debit_balance += debit;
        self.current_credit_balance += credit;
        self.last_transaction_date = Some(at);
        self.updated_at = at;
    }

    /// Remove a previously posted movement from the current balances
    pub fn revert_movement(&mut self, debit: &BigDecimal, credit: &BigDecimal, at: NaiveDateTime) {
        self.current_debit_balance -= debit;
        self.current_credit_balance -= credit;
        self.last_transaction_date = Some(at);
        self.updated_at = at;
    }
}

/// Lifecycle of a journal entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalEntryStatus {
    Draft,
    Posted,
    Reversed,
}

impl JournalEntryStatus {
    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: JournalEntryStatus) -> bool {
        matches!(
            (self, next),
            (JournalEntryStatus::Draft, JournalEntryStatus::Posted)
                | (JournalEntryStatus::Posted, JournalEntryStatus::Draft)
                | (JournalEntryStatus::Posted, JournalEntryStatus::Reversed)
        )
    }
}

impl std::fmt::Display for JournalEntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JournalEntryStatus::Draft => "draft",
            JournalEntryStatus::Posted => "posted",
            JournalEntryStatus::Reversed => "reversed",
        };
        f.write_str(s)
    }
}

/// Origin of a journal entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalEntryType {
    #[default]
    Manual,
    Automatic,
    Adjustment,
    Closing,
}

/// One debit or credit line of a journal entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalLine {
    pub account_code: String,
    pub description: String,
    pub debit: BigDecimal,
    pub credit: BigDecimal,
    pub reference: Option<String>,
}

impl JournalLine {
    /// Create a line with both sides given explicitly
    pub fn new(
        account_code: impl Into<String>,
        description: impl Into<String>,
        debit: BigDecimal,
        credit: BigDecimal,
    ) -> Self {
        Self {
            account_code: account_code.into(),
            description: description.into(),
            debit,
            credit,
            reference: None,
        }
    }

    /// Create a debit line
    pub fn debit(
        account_code: impl Into<String>,
        amount: BigDecimal,
        description: impl Into<String>,
    ) -> Self {
        Self::new(account_code, description, amount, BigDecimal::from(0))
    }

    /// Create a credit line
    pub fn credit(
        account_code: impl Into<String>,
        amount: BigDecimal,
        description: impl Into<String>,
    ) -> Self {
        Self::new(account_code, description, BigDecimal::from(0), amount)
    }

    /// Attach a reference (invoice, cheque number...)
    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Mirror line with debit and credit swapped
    pub fn swapped(&self) -> Self {
        Self {
            account_code: self.account_code.clone(),
            description: self.description.clone(),
            debit: self.credit.clone(),
            credit: self.debit.clone(),
            reference: self.reference.clone(),
        }
    }
}

/// A balanced set of debit/credit lines representing one business transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: Uuid,
    pub company_id: String,
    /// Document number issued by the allocator, unique per company
    pub entry_number: String,
    pub date: NaiveDate,
    pub description: String,
    pub entry_type: JournalEntryType,
    pub status: JournalEntryStatus,
    pub document_type_id: Option<Uuid>,
    pub lines: Vec<JournalLine>,
    pub total_debit: BigDecimal,
    pub total_credit: BigDecimal,
    /// Set on a reversal entry, pointing at the entry it reverses
    pub reversal_of: Option<Uuid>,
    /// Set on a reversed entry, pointing at its reversal
    pub reversed_by: Option<Uuid>,
    pub created_by: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl JournalEntry {
    /// Create a new draft entry and compute its totals
    pub fn new(
        company_id: String,
        entry_number: String,
        date: NaiveDate,
        description: String,
        lines: Vec<JournalLine>,
    ) -> Self {
        let now = chrono::Utc::now().naive_utc();
        let mut entry = Self {
            id: Uuid::new_v4(),
            company_id,
            entry_number,
            date,
            description,
            entry_type: JournalEntryType::Manual,
            status: JournalEntryStatus::Draft,
            document_type_id: None,
            lines,
            total_debit: BigDecimal::from(0),
            total_credit: BigDecimal::from(0),
            reversal_of: None,
            reversed_by: None,
            created_by: None,
            created_at: now,
            updated_at: now,
        };
        entry.refresh_totals();
        entry
    }

    /// Sum of all line debits
    pub fn sum_debits(&self) -> BigDecimal {
        self.lines.iter().map(|l| &l.debit).sum()
    }

    /// Sum of all line credits
    pub fn sum_credits(&self) -> BigDecimal {
        self.lines.iter().map(|l| &l.credit).sum()
    }

    /// Recompute `total_debit` / `total_credit` from the lines
    pub fn refresh_totals(&mut self) {
        self.total_debit = self.sum_debits();
        self.total_credit = self.sum_credits();
    }

    /// Check that debits and credits agree within `tolerance`
    pub fn is_balanced(&self, tolerance: &BigDecimal) -> bool {
        (self.sum_debits() - self.sum_credits()).abs() <= *tolerance
    }

    /// Validate line count, amounts and balance
    pub fn validate(&self, tolerance: &BigDecimal) -> LedgerResult<()> {
        if self.lines.is_empty() {
            return Err(LedgerError::Validation(
                "Journal entry must have at least one line".to_string(),
            ));
        }

        let zero = BigDecimal::from(0);
        for line in &self.lines {
            if line.account_code.trim().is_empty() {
                return Err(LedgerError::Validation(
                    "Journal line account code cannot be empty".to_string(),
                ));
            }
            if line.debit < zero || line.credit < zero {
                return Err(LedgerError::Validation(format!(
                    "Journal line amounts cannot be negative (account {})",
                    line.account_code
                )));
            }
        }

        if !self.is_balanced(tolerance) {
            return Err(LedgerError::Validation(format!(
                "Journal entry is not balanced: debits = {}, credits = {}",
                self.sum_debits(),
                self.sum_credits()
            )));
        }

        Ok(())
    }

    /// Move to `next`, failing with `InvalidState` on an illegal transition
    pub fn transition(&mut self, next: JournalEntryStatus) -> LedgerResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(LedgerError::InvalidState(format!(
                "Journal entry {} cannot move from {} to {}",
                self.entry_number, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = chrono::Utc::now().naive_utc();
        Ok(())
    }

    /// Fail with `InvalidState` unless the entry is in `expected`
    pub fn require_status(&self, expected: JournalEntryStatus, action: &str) -> LedgerResult<()> {
        if self.status != expected {
            return Err(LedgerError::InvalidState(format!(
                "Cannot {} journal entry {}: status is {}, expected {}",
                action, self.entry_number, self.status, expected
            )));
        }
        Ok(())
    }
}

/// Immutable per-account record of a posted movement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub company_id: String,
    pub account_id: Uuid,
    pub account_code: String,
    pub journal_entry_id: Uuid,
    pub date: NaiveDate,
    /// Per-account creation order, breaks ties between entries on the same date
    pub sequence: u64,
    pub description: String,
    pub reference: Option<String>,
    pub debit_amount: BigDecimal,
    pub credit_amount: BigDecimal,
    pub running_debit_balance: BigDecimal,
    pub running_credit_balance: BigDecimal,
    pub created_at: NaiveDateTime,
}

impl LedgerEntry {
    /// Ordering key used for running balances
    pub fn order_key(&self) -> (NaiveDate, u64) {
        (self.date, self.sequence)
    }
}

/// Kind of document whose numbers identify journal entries (CE, CI, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentType {
    pub id: Uuid,
    pub company_id: String,
    pub code: String,
    pub name: String,
    /// Zero-fill width of the numeric part
    pub padding: usize,
    /// Advisory only, the reservation set is authoritative
    pub next_sequence: u64,
    /// Last number handed out, formatted
    pub control_number: Option<String>,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl DocumentType {
    /// Create a new active document type
    pub fn new(company_id: String, code: String, name: String, padding: usize) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id: Uuid::new_v4(),
            company_id,
            code,
            name,
            padding,
            next_sequence: 0,
            control_number: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Prefix shared by every number of this type, e.g. `CE-`
    pub fn number_prefix(&self) -> String {
        format!("{}-", self.code)
    }

    /// Format a sequence as `CODE-00001`
    pub fn format_number(&self, sequence: u64) -> String {
        format!("{}-{:0width$}", self.code, sequence, width = self.padding)
    }

    /// Extract the sequence from a number carrying this type's prefix
    pub fn parse_sequence(&self, number: &str) -> Option<u64> {
        number
            .strip_prefix(&self.number_prefix())
            .and_then(|digits| digits.parse::<u64>().ok())
    }
}

/// Lifecycle of a document number reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Reserved,
    Used,
    Cancelled,
}

impl ReservationStatus {
    /// Reserved and used reservations hold their number
    pub fn holds_number(self) -> bool {
        matches!(self, ReservationStatus::Reserved | ReservationStatus::Used)
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReservationStatus::Reserved => "reserved",
            ReservationStatus::Used => "used",
            ReservationStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Provisional claim on a document number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentNumberReservation {
    pub id: Uuid,
    pub company_id: String,
    pub document_type_id: Uuid,
    pub document_code: String,
    pub sequence: u64,
    pub number: String,
    pub status: ReservationStatus,
    pub journal_entry_id: Option<Uuid>,
    pub reserved_by: Option<String>,
    pub reserved_at: NaiveDateTime,
    pub used_at: Option<NaiveDateTime>,
}

impl DocumentNumberReservation {
    /// Create a reservation in the `reserved` state
    pub fn reserve(
        document_type: &DocumentType,
        sequence: u64,
        reserved_by: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            company_id: document_type.company_id.clone(),
            document_type_id: document_type.id,
            document_code: document_type.code.clone(),
            sequence,
            number: document_type.format_number(sequence),
            status: ReservationStatus::Reserved,
            journal_entry_id: None,
            reserved_by,
            reserved_at: chrono::Utc::now().naive_utc(),
            used_at: None,
        }
    }

    /// `reserved` → `used`; idempotent when already used by the same entry
    pub fn mark_used(&mut self, journal_entry_id: Uuid) -> LedgerResult<bool> {
        match self.status {
            ReservationStatus::Reserved => {
                self.status = ReservationStatus::Used;
                self.journal_entry_id = Some(journal_entry_id);
                self.used_at = Some(chrono::Utc::now().naive_utc());
                Ok(true)
            }
            ReservationStatus::Used if self.journal_entry_id == Some(journal_entry_id) => Ok(false),
            ReservationStatus::Used => Err(LedgerError::InvalidState(format!(
                "Number {} is already used by another journal entry",
                self.number
            ))),
            ReservationStatus::Cancelled => Err(LedgerError::InvalidState(format!(
                "Number {} was cancelled and cannot be used",
                self.number
            ))),
        }
    }

    /// `reserved` → `cancelled`
    pub fn cancel(&mut self) -> LedgerResult<()> {
        if self.status != ReservationStatus::Reserved {
            return Err(LedgerError::InvalidState(format!(
                "Only reserved numbers can be cancelled; {} is {}",
                self.number, self.status
            )));
        }
        self.status = ReservationStatus::Cancelled;
        Ok(())
    }
}

/// Number handed out (or previewed) by the allocator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedNumber {
    pub number: String,
    pub sequence: u64,
    /// Present when the number was actually reserved
    pub reservation_id: Option<Uuid>,
}

/// Coarse error categories callers can branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    State,
    Conflict,
    Integrity,
    Storage,
    Config,
}

/// Errors that can occur in the posting core
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Account not found: {0}")]
    AccountNotFound(String),
    #[error("Journal entry not found: {0}")]
    JournalEntryNotFound(String),
    #[error("Document type not found: {0}")]
    DocumentTypeNotFound(String),
    #[error("Reservation not found: {0}")]
    ReservationNotFound(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Integrity error: {0}")]
    Integrity(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl LedgerError {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::Storage(_) => ErrorKind::Storage,
            LedgerError::Validation(_) => ErrorKind::Validation,
            LedgerError::AccountNotFound(_)
            | LedgerError::JournalEntryNotFound(_)
            | LedgerError::DocumentTypeNotFound(_)
            | LedgerError::ReservationNotFound(_) => ErrorKind::NotFound,
            LedgerError::InvalidState(_) => ErrorKind::State,
            LedgerError::Conflict(_) => ErrorKind::Conflict,
            LedgerError::Integrity(_) => ErrorKind::Integrity,
            LedgerError::Config(_) => ErrorKind::Config,
        }
    }
}

impl From<config::ConfigError> for LedgerError {
    fn from(err: config::ConfigError) -> Self {
        LedgerError::Config(err.to_string())
    }
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn tolerance() -> BigDecimal {
        BigDecimal::new(1.into(), 2)
    }

    fn entry(lines: Vec<JournalLine>) -> JournalEntry {
        JournalEntry::new(
            "acme".to_string(),
            "CD-00001".to_string(),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            "Test".to_string(),
            lines,
        )
    }

    #[test]
    fn test_status_transitions() {
        use JournalEntryStatus::*;
        assert!(Draft.can_transition_to(Posted));
        assert!(Posted.can_transition_to(Draft));
        assert!(Posted.can_transition_to(Reversed));
        assert!(!Draft.can_transition_to(Reversed));
        assert!(!Reversed.can_transition_to(Draft));
        assert!(!Reversed.can_transition_to(Posted));
        assert!(!Posted.can_transition_to(Posted));
    }

    #[test]
    fn test_illegal_transition_leaves_status() {
        let mut e = entry(vec![]);
        let err = e.transition(JournalEntryStatus::Reversed).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
        assert_eq!(e.status, JournalEntryStatus::Draft);
    }

    #[test]
    fn test_balance_tolerance() {
        let within = entry(vec![
            JournalLine::debit("101", "100.005".parse().unwrap(), "d"),
            JournalLine::credit("201", BigDecimal::from(100), "c"),
        ]);
        assert!(within.validate(&tolerance()).is_ok());

        let outside = entry(vec![
            JournalLine::debit("101", BigDecimal::from(100), "d"),
            JournalLine::credit("201", BigDecimal::from(90), "c"),
        ]);
        let err = outside.validate(&tolerance()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_empty_and_negative_lines_rejected() {
        assert!(entry(vec![]).validate(&tolerance()).is_err());

        let negative = entry(vec![
            JournalLine::debit("101", BigDecimal::from(-5), "d"),
            JournalLine::credit("201", BigDecimal::from(-5), "c"),
        ]);
        assert!(negative.validate(&tolerance()).is_err());
    }

    #[test]
    fn test_number_formatting_and_parsing() {
        let doc = DocumentType::new("acme".into(), "CE".into(), "Egreso".into(), 5);
        assert_eq!(doc.format_number(2), "CE-00002");
        assert_eq!(doc.parse_sequence("CE-00017"), Some(17));
        assert_eq!(doc.parse_sequence("CI-00017"), None);
        assert_eq!(doc.parse_sequence("CE-abc"), None);
    }

    #[test]
    fn test_reservation_transitions() {
        let doc = DocumentType::new("acme".into(), "CE".into(), "Egreso".into(), 5);
        let mut r = DocumentNumberReservation::reserve(&doc, 1, None);
        let entry_id = Uuid::new_v4();
        assert!(r.mark_used(entry_id).unwrap());
        assert!(!r.mark_used(entry_id).unwrap());
        assert!(r.mark_used(Uuid::new_v4()).is_err());
        assert!(r.cancel().is_err());

        let mut other = DocumentNumberReservation::reserve(&doc, 2, None);
        other.cancel().unwrap();
        assert_eq!(other.status, ReservationStatus::Cancelled);
        assert!(other.mark_used(entry_id).is_err());
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&JournalEntryStatus::Posted).unwrap(),
            "\"posted\""
        );
        assert_eq!(
            serde_json::to_string(&ReservationStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }
}
