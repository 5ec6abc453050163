//! In-memory storage implementation for testing

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use crate::changeset::Changeset;
use crate::traits::*;
use crate::types::*;

#[derive(Debug, Default)]
struct MemoryState {
    accounts: HashMap<Uuid, Account>,
    journal_entries: HashMap<Uuid, JournalEntry>,
    ledger_entries: HashMap<Uuid, LedgerEntry>,
    document_types: HashMap<Uuid, DocumentType>,
    reservations: HashMap<Uuid, DocumentNumberReservation>,
    revisions: HashMap<String, u64>,
}

impl MemoryState {
    fn account_code_taken(&self, account: &Account) -> bool {
        self.accounts.values().any(|a| {
            a.id != account.id && a.company_id == account.company_id && a.code == account.code
        })
    }

    fn entry_number_taken(&self, entry: &JournalEntry, pending_deletes: &[Uuid]) -> bool {
        self.journal_entries.values().any(|e| {
            e.id != entry.id
                && !pending_deletes.contains(&e.id)
                && e.company_id == entry.company_id
                && e.entry_number == entry.entry_number
        })
    }

    fn number_held(&self, reservation: &DocumentNumberReservation) -> bool {
        reservation.status.holds_number()
            && self.reservations.values().any(|r| {
                r.id != reservation.id
                    && r.status.holds_number()
                    && r.company_id == reservation.company_id
                    && r.number == reservation.number
            })
    }

    /// Whether writing `reservation` would undo a transition already stored.
    /// `used` is final and `cancelled` can never become `used`.
    fn reservation_superseded(&self, reservation: &DocumentNumberReservation) -> bool {
        let Some(stored) = self.reservations.get(&reservation.id) else {
            return false;
        };
        match (stored.status, reservation.status) {
            (ReservationStatus::Used, ReservationStatus::Used) => {
                stored.journal_entry_id != reservation.journal_entry_id
            }
            (ReservationStatus::Used, _) => true,
            (ReservationStatus::Cancelled, ReservationStatus::Used) => true,
            _ => false,
        }
    }

    fn check_reservation(&self, reservation: &DocumentNumberReservation) -> LedgerResult<()> {
        if self.reservation_superseded(reservation) {
            return Err(LedgerError::Conflict(format!(
                "Reservation {} changed concurrently",
                reservation.number
            )));
        }
        if self.number_held(reservation) {
            return Err(LedgerError::Conflict(format!(
                "Number {} is already reserved",
                reservation.number
            )));
        }
        Ok(())
    }

    /// Check every write of `changeset` without applying any of it
    fn validate(&self, changeset: &Changeset) -> LedgerResult<()> {
        if let Some(expected) = changeset.expected_revision {
            let current = self
                .revisions
                .get(&changeset.company_id)
                .copied()
                .unwrap_or(0);
            if current != expected {
                return Err(LedgerError::Conflict(format!(
                    "Company {} changed concurrently (revision {} != {})",
                    changeset.company_id, current, expected
                )));
            }
        }

        for (i, account) in changeset.accounts.iter().enumerate() {
            let duplicated_in_batch = changeset.accounts[..i].iter().any(|a| {
                a.id != account.id && a.company_id == account.company_id && a.code == account.code
            });
            if duplicated_in_batch || self.account_code_taken(account) {
                return Err(LedgerError::Conflict(format!(
                    "Account code {} already exists",
                    account.code
                )));
            }
        }

        for (i, entry) in changeset.journal_entries.iter().enumerate() {
            let duplicated_in_batch = changeset.journal_entries[..i]
                .iter()
                .any(|e| e.company_id == entry.company_id && e.entry_number == entry.entry_number);
            if duplicated_in_batch
                || self.entry_number_taken(entry, &changeset.deleted_journal_entries)
            {
                return Err(LedgerError::Conflict(format!(
                    "Journal entry number {} already exists",
                    entry.entry_number
                )));
            }
        }

        for entry in &changeset.updated_ledger_entries {
            if !self.ledger_entries.contains_key(&entry.id) {
                return Err(LedgerError::Storage(format!(
                    "Ledger entry {} no longer exists",
                    entry.id
                )));
            }
        }

        for reservation in &changeset.reservations {
            self.check_reservation(reservation)?;
        }

        Ok(())
    }

    fn apply(&mut self, changeset: Changeset) {
        let bumps_revision = changeset.bumps_revision();

        for id in &changeset.deleted_ledger_entries {
            self.ledger_entries.remove(id);
        }
        for id in &changeset.deleted_journal_entries {
            self.journal_entries.remove(id);
        }
        for account in changeset.accounts {
            self.accounts.insert(account.id, account);
        }
        for entry in changeset.journal_entries {
            self.journal_entries.insert(entry.id, entry);
        }
        for entry in changeset
            .inserted_ledger_entries
            .into_iter()
            .chain(changeset.updated_ledger_entries)
        {
            self.ledger_entries.insert(entry.id, entry);
        }
        for reservation in changeset.reservations {
            self.reservations.insert(reservation.id, reservation);
        }

        if bumps_revision {
            *self.revisions.entry(changeset.company_id).or_insert(0) += 1;
        }
    }
}

/// In-memory storage implementation for testing and development
///
/// All collections sit behind one lock, so a commit is atomic with respect
/// to every reader.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStorage {
    /// Create a new memory storage instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all data (useful for testing)
    pub fn clear(&self) -> LedgerResult<()> {
        *self.write()? = MemoryState::default();
        Ok(())
    }

    /// Number of ledger entries stored across all companies
    pub fn ledger_entry_count(&self) -> LedgerResult<usize> {
        Ok(self.read()?.ledger_entries.len())
    }

    /// Overwrite an account without any checks, for simulating drift in tests
    pub fn force_account(&self, account: Account) -> LedgerResult<()> {
        self.write()?.accounts.insert(account.id, account);
        Ok(())
    }

    fn read(&self) -> LedgerResult<RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|e| LedgerError::Storage(format!("Lock poisoned: {}", e)))
    }

    fn write(&self) -> LedgerResult<RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|e| LedgerError::Storage(format!("Lock poisoned: {}", e)))
    }
}

#[async_trait]
impl LedgerStorage for MemoryStorage {
    async fn get_account(&self, account_id: Uuid) -> LedgerResult<Option<Account>> {
        Ok(self.read()?.accounts.get(&account_id).cloned())
    }

    async fn get_account_by_code(
        &self,
        company_id: &str,
        code: &str,
    ) -> LedgerResult<Option<Account>> {
        Ok(self
            .read()?
            .accounts
            .values()
            .find(|a| a.company_id == company_id && a.code == code)
            .cloned())
    }

    async fn list_accounts(&self, company_id: &str) -> LedgerResult<Vec<Account>> {
        let mut accounts: Vec<Account> = self
            .read()?
            .accounts
            .values()
            .filter(|a| a.company_id == company_id)
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(accounts)
    }

    async fn get_journal_entry(&self, entry_id: Uuid) -> LedgerResult<Option<JournalEntry>> {
        Ok(self.read()?.journal_entries.get(&entry_id).cloned())
    }

    async fn find_journal_entry_by_number(
        &self,
        company_id: &str,
        entry_number: &str,
    ) -> LedgerResult<Option<JournalEntry>> {
        Ok(self
            .read()?
            .journal_entries
            .values()
            .find(|e| e.company_id == company_id && e.entry_number == entry_number)
            .cloned())
    }

    async fn list_journal_entries(
        &self,
        company_id: &str,
        filter: &JournalEntryFilter,
    ) -> LedgerResult<Vec<JournalEntry>> {
        let mut entries: Vec<JournalEntry> = self
            .read()?
            .journal_entries
            .values()
            .filter(|e| e.company_id == company_id && filter.matches(e))
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            a.date
                .cmp(&b.date)
                .then_with(|| a.entry_number.cmp(&b.entry_number))
        });
        Ok(entries)
    }

    async fn list_entry_numbers(
        &self,
        company_id: &str,
        prefix: &str,
    ) -> LedgerResult<Vec<String>> {
        Ok(self
            .read()?
            .journal_entries
            .values()
            .filter(|e| e.company_id == company_id && e.entry_number.starts_with(prefix))
            .map(|e| e.entry_number.clone())
            .collect())
    }

    async fn list_journal_ledger_entries(
        &self,
        journal_entry_id: Uuid,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        let mut entries: Vec<LedgerEntry> = self
            .read()?
            .ledger_entries
            .values()
            .filter(|e| e.journal_entry_id == journal_entry_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            a.account_code
                .cmp(&b.account_code)
                .then_with(|| a.sequence.cmp(&b.sequence))
        });
        Ok(entries)
    }

    async fn list_account_ledger_entries(
        &self,
        account_id: Uuid,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        let mut entries: Vec<LedgerEntry> = self
            .read()?
            .ledger_entries
            .values()
            .filter(|e| {
                e.account_id == account_id
                    && start_date.is_none_or(|d| e.date >= d)
                    && end_date.is_none_or(|d| e.date <= d)
            })
            .cloned()
            .collect();
        entries.sort_by_key(LedgerEntry::order_key);
        Ok(entries)
    }

    async fn company_revision(&self, company_id: &str) -> LedgerResult<u64> {
        Ok(self
            .read()?
            .revisions
            .get(company_id)
            .copied()
            .unwrap_or(0))
    }

    async fn commit(&self, changeset: Changeset) -> LedgerResult<()> {
        let mut state = self.write()?;
        state.validate(&changeset)?;
        state.apply(changeset);
        Ok(())
    }

    async fn save_document_type(&self, document_type: &DocumentType) -> LedgerResult<()> {
        let mut state = self.write()?;
        let duplicate = state.document_types.values().any(|d| {
            d.id != document_type.id
                && d.company_id == document_type.company_id
                && d.code == document_type.code
        });
        if duplicate {
            return Err(LedgerError::Conflict(format!(
                "Document type {} already exists",
                document_type.code
            )));
        }
        state
            .document_types
            .insert(document_type.id, document_type.clone());
        Ok(())
    }

    async fn get_document_type(
        &self,
        document_type_id: Uuid,
    ) -> LedgerResult<Option<DocumentType>> {
        Ok(self.read()?.document_types.get(&document_type_id).cloned())
    }

    async fn list_document_types(&self, company_id: &str) -> LedgerResult<Vec<DocumentType>> {
        let mut types: Vec<DocumentType> = self
            .read()?
            .document_types
            .values()
            .filter(|d| d.company_id == company_id)
            .cloned()
            .collect();
        types.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(types)
    }

    async fn update_document_type(&self, document_type: &DocumentType) -> LedgerResult<()> {
        let mut state = self.write()?;
        if !state.document_types.contains_key(&document_type.id) {
            return Err(LedgerError::DocumentTypeNotFound(
                document_type.id.to_string(),
            ));
        }
        state
            .document_types
            .insert(document_type.id, document_type.clone());
        Ok(())
    }

    async fn insert_reservation(
        &self,
        reservation: &DocumentNumberReservation,
    ) -> LedgerResult<()> {
        let mut state = self.write()?;
        if state.reservations.contains_key(&reservation.id) || state.number_held(reservation) {
            return Err(LedgerError::Conflict(format!(
                "Number {} is already reserved",
                reservation.number
            )));
        }
        state
            .reservations
            .insert(reservation.id, reservation.clone());
        Ok(())
    }

    async fn get_reservation(
        &self,
        reservation_id: Uuid,
    ) -> LedgerResult<Option<DocumentNumberReservation>> {
        Ok(self.read()?.reservations.get(&reservation_id).cloned())
    }

    async fn find_active_reservation(
        &self,
        company_id: &str,
        number: &str,
    ) -> LedgerResult<Option<DocumentNumberReservation>> {
        Ok(self
            .read()?
            .reservations
            .values()
            .find(|r| r.company_id == company_id && r.number == number && r.status.holds_number())
            .cloned())
    }

    async fn list_reservations(
        &self,
        company_id: &str,
        document_type_id: Option<Uuid>,
        status: Option<ReservationStatus>,
    ) -> LedgerResult<Vec<DocumentNumberReservation>> {
        let mut reservations: Vec<DocumentNumberReservation> = self
            .read()?
            .reservations
            .values()
            .filter(|r| {
                r.company_id == company_id
                    && document_type_id.is_none_or(|id| r.document_type_id == id)
                    && status.is_none_or(|s| r.status == s)
            })
            .cloned()
            .collect();
        reservations.sort_by(|a, b| {
            b.reserved_at
                .cmp(&a.reserved_at)
                .then_with(|| b.sequence.cmp(&a.sequence))
        });
        Ok(reservations)
    }

    async fn update_reservation(
        &self,
        reservation: &DocumentNumberReservation,
    ) -> LedgerResult<()> {
        let mut state = self.write()?;
        if !state.reservations.contains_key(&reservation.id) {
            return Err(LedgerError::ReservationNotFound(reservation.id.to_string()));
        }
        state.check_reservation(reservation)?;
        state
            .reservations
            .insert(reservation.id, reservation.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(code: &str) -> Account {
        Account::new(
            "acme".to_string(),
            code.to_string(),
            "Cash".to_string(),
            AccountType::Asset,
            None,
        )
    }

    #[tokio::test]
    async fn test_commit_is_all_or_nothing() {
        let storage = MemoryStorage::new();
        let mut first = Changeset::new("acme");
        first.accounts.push(account("101"));
        storage.commit(first).await.unwrap();

        let mut second = Changeset::new("acme");
        second.accounts.push(account("102"));
        second.accounts.push(account("101"));
        let err = storage.commit(second).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let accounts = storage.list_accounts("acme").await.unwrap();
        assert_eq!(accounts.len(), 1);

        storage.clear().unwrap();
        assert!(storage.list_accounts("acme").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_revision_conflicts() {
        let storage = MemoryStorage::new();
        let revision = storage.company_revision("acme").await.unwrap();

        let mut winner = Changeset::new("acme").with_revision(revision);
        winner.accounts.push(account("101"));
        storage.commit(winner).await.unwrap();
        assert_eq!(storage.company_revision("acme").await.unwrap(), revision + 1);

        let mut loser = Changeset::new("acme").with_revision(revision);
        loser.accounts.push(account("102"));
        let err = storage.commit(loser).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_active_number_is_unique() {
        let storage = MemoryStorage::new();
        let doc = DocumentType::new("acme".into(), "CE".into(), "Egreso".into(), 5);
        let mut first = DocumentNumberReservation::reserve(&doc, 1, None);
        storage.insert_reservation(&first).await.unwrap();

        let duplicate = DocumentNumberReservation::reserve(&doc, 1, None);
        assert!(storage.insert_reservation(&duplicate).await.is_err());

        first.cancel().unwrap();
        storage.update_reservation(&first).await.unwrap();
        storage.insert_reservation(&duplicate).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_reservation_write_conflicts() {
        let storage = MemoryStorage::new();
        let doc = DocumentType::new("acme".into(), "CE".into(), "Egreso".into(), 5);
        let reserved = DocumentNumberReservation::reserve(&doc, 1, None);
        storage.insert_reservation(&reserved).await.unwrap();

        let mut cancelled = reserved.clone();
        cancelled.cancel().unwrap();
        storage.update_reservation(&cancelled).await.unwrap();

        let mut used = reserved.clone();
        used.mark_used(Uuid::new_v4()).unwrap();
        let mut changeset = Changeset::new("acme");
        changeset.put_reservation(used);
        let err = storage.commit(changeset).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let stored = storage.get_reservation(reserved.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_journal_write_moves_revision() {
        let storage = MemoryStorage::new();
        let entry = JournalEntry::new(
            "acme".to_string(),
            "CE-00001".to_string(),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            "Rent".to_string(),
            Vec::new(),
        );
        let mut created = Changeset::new("acme");
        created.put_journal_entry(entry.clone());
        storage.commit(created).await.unwrap();
        let revision = storage.company_revision("acme").await.unwrap();
        assert_eq!(revision, 1);

        let mut deleted = Changeset::new("acme").with_revision(revision);
        deleted.deleted_journal_entries.push(entry.id);
        storage.commit(deleted).await.unwrap();

        let mut stale = Changeset::new("acme").with_revision(revision);
        stale.put_journal_entry(entry.clone());
        let err = storage.commit(stale).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(storage.get_journal_entry(entry.id).await.unwrap().is_none());
    }
}
