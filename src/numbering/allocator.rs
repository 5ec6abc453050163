//! Gap-filling document number allocator

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::traits::LedgerStorage;
use crate::types::*;
use crate::utils::validation::validate_document_code;

/// Fields a caller may change on a reservation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReservationUpdate {
    pub status: Option<ReservationStatus>,
    pub sequence: Option<u64>,
    pub number: Option<String>,
}

/// Advisory fields cleared by [`DocumentNumberAllocator::reset_sequences`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceReset {
    pub code: String,
    pub previous_next_sequence: u64,
    pub previous_control_number: Option<String>,
}

/// Issues, reserves and cancels document numbers per (company, document type).
///
/// The set of reserved and used reservations is authoritative. Each call scans
/// it for the smallest free sequence and tries to insert a reservation; the
/// storage uniqueness index rejects a number taken concurrently and the scan
/// is retried.
#[derive(Clone)]
pub struct DocumentNumberAllocator<S: LedgerStorage> {
    pub(crate) storage: S,
    max_attempts: u32,
    default_padding: usize,
}

impl<S: LedgerStorage> DocumentNumberAllocator<S> {
    pub fn new(storage: S, config: &LedgerConfig) -> Self {
        Self {
            storage,
            max_attempts: config.max_allocation_attempts,
            default_padding: config.default_padding,
        }
    }

    /// Register a document type; codes are unique per company
    #[instrument(skip_all, fields(company_id = %company_id, code = %code))]
    pub async fn create_document_type(
        &self,
        company_id: &str,
        code: &str,
        name: &str,
        padding: Option<usize>,
    ) -> LedgerResult<DocumentType> {
        validate_document_code(code)?;
        let padding = padding.unwrap_or(self.default_padding);
        if padding == 0 || padding > 18 {
            return Err(LedgerError::Validation(format!(
                "Padding must be between 1 and 18, got {}",
                padding
            )));
        }

        let document_type = DocumentType::new(
            company_id.to_string(),
            code.to_string(),
            name.to_string(),
            padding,
        );
        self.storage.save_document_type(&document_type).await?;
        info!(document_type_id = %document_type.id, "Document type created");
        Ok(document_type)
    }

    /// Get a document type, failing with `DocumentTypeNotFound`
    pub async fn get_document_type(&self, document_type_id: Uuid) -> LedgerResult<DocumentType> {
        self.storage
            .get_document_type(document_type_id)
            .await?
            .ok_or_else(|| LedgerError::DocumentTypeNotFound(document_type_id.to_string()))
    }

    /// Get a document type that must belong to `company_id`
    async fn company_document_type(
        &self,
        company_id: &str,
        document_type_id: Uuid,
    ) -> LedgerResult<DocumentType> {
        let document_type = self.get_document_type(document_type_id).await?;
        if document_type.company_id != company_id {
            return Err(LedgerError::DocumentTypeNotFound(format!(
                "{} (company {})",
                document_type_id, company_id
            )));
        }
        if !document_type.is_active {
            return Err(LedgerError::Validation(format!(
                "Document type {} is inactive",
                document_type.code
            )));
        }
        Ok(document_type)
    }

    pub async fn list_document_types(&self, company_id: &str) -> LedgerResult<Vec<DocumentType>> {
        self.storage.list_document_types(company_id).await
    }

    pub async fn find_document_type_by_code(
        &self,
        company_id: &str,
        code: &str,
    ) -> LedgerResult<Option<DocumentType>> {
        Ok(self
            .storage
            .list_document_types(company_id)
            .await?
            .into_iter()
            .find(|d| d.code == code))
    }

    /// Sequences currently taken for `document_type`
    async fn used_sequences(&self, document_type: &DocumentType) -> LedgerResult<BTreeSet<u64>> {
        let mut used: BTreeSet<u64> = self
            .storage
            .list_reservations(&document_type.company_id, Some(document_type.id), None)
            .await?
            .into_iter()
            .filter(|r| r.status.holds_number())
            .map(|r| r.sequence)
            .collect();

        // Entries numbered outside the allocator still occupy their number
        let numbers = self
            .storage
            .list_entry_numbers(&document_type.company_id, &document_type.number_prefix())
            .await?;
        used.extend(numbers.iter().filter_map(|n| document_type.parse_sequence(n)));
        Ok(used)
    }

    /// Preview the number the next allocation would return, without writing
    pub async fn peek(
        &self,
        company_id: &str,
        document_type_id: Uuid,
    ) -> LedgerResult<AllocatedNumber> {
        let document_type = self.company_document_type(company_id, document_type_id).await?;
        let sequence = first_gap(&self.used_sequences(&document_type).await?);
        Ok(AllocatedNumber {
            number: document_type.format_number(sequence),
            sequence,
            reservation_id: None,
        })
    }

    /// Reserve the smallest free number of a document type
    #[instrument(skip_all, fields(company_id = %company_id, document_type_id = %document_type_id))]
    pub async fn allocate(
        &self,
        company_id: &str,
        document_type_id: Uuid,
        reserved_by: Option<String>,
    ) -> LedgerResult<AllocatedNumber> {
        let document_type = self.company_document_type(company_id, document_type_id).await?;

        let mut attempt = 0;
        let reservation = loop {
            attempt += 1;
            let sequence = first_gap(&self.used_sequences(&document_type).await?);
            let reservation =
                DocumentNumberReservation::reserve(&document_type, sequence, reserved_by.clone());

            match self.storage.insert_reservation(&reservation).await {
                Ok(()) => break reservation,
                Err(e @ LedgerError::Conflict(_)) if attempt < self.max_attempts => {
                    warn!(
                        error = %e,
                        attempt,
                        number = %reservation.number,
                        "Number taken concurrently, rescanning"
                    );
                }
                Err(e) => return Err(e),
            }
        };

        self.stamp_advisory(&document_type, &reservation).await;
        info!(number = %reservation.number, "Number reserved");

        Ok(AllocatedNumber {
            number: reservation.number,
            sequence: reservation.sequence,
            reservation_id: Some(reservation.id),
        })
    }

    /// Refresh the display-only `next_sequence` and `control_number` fields
    async fn stamp_advisory(
        &self,
        document_type: &DocumentType,
        reservation: &DocumentNumberReservation,
    ) {
        let mut updated = match self.storage.get_document_type(document_type.id).await {
            Ok(Some(current)) => current,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Could not reload document type for advisory update");
                return;
            }
        };
        updated.next_sequence = updated.next_sequence.max(reservation.sequence + 1);
        updated.control_number = Some(reservation.number.clone());
        updated.updated_at = chrono::Utc::now().naive_utc();
        if let Err(e) = self.storage.update_document_type(&updated).await {
            warn!(error = %e, code = %document_type.code, "Advisory sequence update failed");
        }
    }

    pub async fn get_reservation(
        &self,
        reservation_id: Uuid,
    ) -> LedgerResult<DocumentNumberReservation> {
        self.storage
            .get_reservation(reservation_id)
            .await?
            .ok_or_else(|| LedgerError::ReservationNotFound(reservation_id.to_string()))
    }

    /// The reserved or used reservation holding `number`
    pub async fn find_reservation(
        &self,
        company_id: &str,
        number: &str,
    ) -> LedgerResult<DocumentNumberReservation> {
        self.storage
            .find_active_reservation(company_id, number)
            .await?
            .ok_or_else(|| {
                LedgerError::ReservationNotFound(format!("{} (company {})", number, company_id))
            })
    }

    /// `reserved` → `used`, linking the journal entry. Idempotent for the same entry.
    #[instrument(skip_all, fields(company_id = %company_id, number = %number))]
    pub async fn mark_used(
        &self,
        company_id: &str,
        number: &str,
        journal_entry_id: Uuid,
    ) -> LedgerResult<DocumentNumberReservation> {
        let mut reservation = self.find_reservation(company_id, number).await?;
        if reservation.mark_used(journal_entry_id)? {
            self.storage.update_reservation(&reservation).await?;
            info!("Number marked used");
        }
        Ok(reservation)
    }

    /// `reserved` → `cancelled`, freeing the number for future allocations
    #[instrument(skip_all, fields(reservation_id = %reservation_id))]
    pub async fn cancel(&self, reservation_id: Uuid) -> LedgerResult<DocumentNumberReservation> {
        let mut reservation = self.get_reservation(reservation_id).await?;
        reservation.cancel()?;
        self.storage.update_reservation(&reservation).await?;
        info!(number = %reservation.number, "Reservation cancelled");
        Ok(reservation)
    }

    /// Edit a reservation by hand.
    ///
    /// Status may only be set to `reserved` or `cancelled`; `used` is reached
    /// through journal entry creation. Number and sequence can only change while
    /// the reservation is reserved.
    #[instrument(skip_all, fields(reservation_id = %reservation_id))]
    pub async fn update_reservation(
        &self,
        reservation_id: Uuid,
        update: ReservationUpdate,
    ) -> LedgerResult<DocumentNumberReservation> {
        let mut reservation = self.get_reservation(reservation_id).await?;

        if update.sequence.is_some() || update.number.is_some() {
            if reservation.status != ReservationStatus::Reserved {
                return Err(LedgerError::InvalidState(format!(
                    "Number {} is {} and can no longer be renumbered",
                    reservation.number, reservation.status
                )));
            }
            let document_type = self.get_document_type(reservation.document_type_id).await?;
            let sequence = match (update.sequence, update.number.as_deref()) {
                (Some(sequence), _) => sequence,
                (None, Some(number)) => document_type.parse_sequence(number).ok_or_else(|| {
                    LedgerError::Validation(format!(
                        "Number {} does not match document type {}",
                        number, document_type.code
                    ))
                })?,
                (None, None) => reservation.sequence,
            };
            if sequence == 0 {
                return Err(LedgerError::Validation(
                    "Sequence must be positive".to_string(),
                ));
            }
            reservation.sequence = sequence;
            reservation.number = document_type.format_number(sequence);
        }

        if let Some(status) = update.status {
            match (reservation.status, status) {
                (_, ReservationStatus::Used) => {
                    return Err(LedgerError::Validation(
                        "Reservations become used only through journal entries".to_string(),
                    ));
                }
                (current, next) if current == next => {}
                (ReservationStatus::Reserved, ReservationStatus::Cancelled) => {
                    reservation.cancel()?
                }
                (ReservationStatus::Cancelled, ReservationStatus::Reserved) => {
                    reservation.status = ReservationStatus::Reserved;
                    reservation.reserved_at = chrono::Utc::now().naive_utc();
                }
                (current, next) => {
                    return Err(LedgerError::InvalidState(format!(
                        "Reservation {} cannot move from {} to {}",
                        reservation.number, current, next
                    )));
                }
            }
        }

        self.storage.update_reservation(&reservation).await?;
        info!(number = %reservation.number, status = %reservation.status, "Reservation updated");
        Ok(reservation)
    }

    /// Reservations of a company, newest first
    pub async fn list_reservations(
        &self,
        company_id: &str,
        document_type_id: Option<Uuid>,
        status: Option<ReservationStatus>,
    ) -> LedgerResult<Vec<DocumentNumberReservation>> {
        self.storage
            .list_reservations(company_id, document_type_id, status)
            .await
    }

    /// Clear the advisory counters of every document type of a company
    #[instrument(skip_all, fields(company_id = %company_id))]
    pub async fn reset_sequences(&self, company_id: &str) -> LedgerResult<Vec<SequenceReset>> {
        let mut resets = Vec::new();
        for mut document_type in self.storage.list_document_types(company_id).await? {
            resets.push(SequenceReset {
                code: document_type.code.clone(),
                previous_next_sequence: document_type.next_sequence,
                previous_control_number: document_type.control_number.take(),
            });
            document_type.next_sequence = 0;
            document_type.updated_at = chrono::Utc::now().naive_utc();
            self.storage.update_document_type(&document_type).await?;
        }
        info!(count = resets.len(), "Advisory sequences reset");
        Ok(resets)
    }
}

/// Smallest positive integer not in `used`
pub fn first_gap(used: &BTreeSet<u64>) -> u64 {
    let mut candidate = 1;
    for &sequence in used.range(1..) {
        if sequence != candidate {
            break;
        }
        candidate += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::MemoryStorage;

    fn allocator() -> DocumentNumberAllocator<MemoryStorage> {
        DocumentNumberAllocator::new(MemoryStorage::new(), &LedgerConfig::default())
    }

    #[test]
    fn test_first_gap() {
        assert_eq!(first_gap(&BTreeSet::new()), 1);
        assert_eq!(first_gap(&[1, 2, 3].into_iter().collect()), 4);
        assert_eq!(first_gap(&[1, 3].into_iter().collect()), 2);
        assert_eq!(first_gap(&[2, 3].into_iter().collect()), 1);
        assert_eq!(first_gap(&[0, 1].into_iter().collect()), 2);
    }

    #[tokio::test]
    async fn test_cancelled_number_is_reused() {
        let allocator = allocator();
        let doc = allocator
            .create_document_type("acme", "CE", "Comprobante de egreso", Some(5))
            .await
            .unwrap();

        let first = allocator.allocate("acme", doc.id, None).await.unwrap();
        let second = allocator.allocate("acme", doc.id, None).await.unwrap();
        let third = allocator.allocate("acme", doc.id, None).await.unwrap();
        assert_eq!(first.number, "CE-00001");
        assert_eq!(third.number, "CE-00003");

        allocator.mark_used("acme", &first.number, Uuid::new_v4()).await.unwrap();
        allocator.mark_used("acme", &third.number, Uuid::new_v4()).await.unwrap();
        allocator.cancel(second.reservation_id.unwrap()).await.unwrap();

        let peeked = allocator.peek("acme", doc.id).await.unwrap();
        assert_eq!(peeked.number, "CE-00002");
        assert_eq!(peeked.reservation_id, None);

        let next = allocator.allocate("acme", doc.id, None).await.unwrap();
        assert_eq!(next.number, "CE-00002");

        let stored = allocator.get_document_type(doc.id).await.unwrap();
        assert_eq!(stored.control_number.as_deref(), Some("CE-00002"));
        assert_eq!(stored.next_sequence, 4);
    }

    #[tokio::test]
    async fn test_peek_has_no_side_effects() {
        let allocator = allocator();
        let doc = allocator
            .create_document_type("acme", "CI", "Ingreso", None)
            .await
            .unwrap();
        allocator.peek("acme", doc.id).await.unwrap();
        allocator.peek("acme", doc.id).await.unwrap();
        assert!(allocator
            .list_reservations("acme", None, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_other_company_cannot_allocate() {
        let allocator = allocator();
        let doc = allocator
            .create_document_type("acme", "CE", "Egreso", None)
            .await
            .unwrap();
        let err = allocator.allocate("globex", doc.id, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_update_reservation_rules() {
        let allocator = allocator();
        let doc = allocator
            .create_document_type("acme", "CE", "Egreso", None)
            .await
            .unwrap();
        let allocated = allocator.allocate("acme", doc.id, None).await.unwrap();
        let id = allocated.reservation_id.unwrap();

        let used = ReservationUpdate {
            status: Some(ReservationStatus::Used),
            ..Default::default()
        };
        assert!(allocator.update_reservation(id, used).await.is_err());

        let renumber = ReservationUpdate {
            number: Some("CE-00042".to_string()),
            ..Default::default()
        };
        let updated = allocator.update_reservation(id, renumber).await.unwrap();
        assert_eq!(updated.sequence, 42);

        allocator.mark_used("acme", "CE-00042", Uuid::new_v4()).await.unwrap();
        let renumber_used = ReservationUpdate {
            sequence: Some(7),
            ..Default::default()
        };
        let err = allocator.update_reservation(id, renumber_used).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
    }

    #[tokio::test]
    async fn test_reset_sequences() {
        let allocator = allocator();
        let doc = allocator
            .create_document_type("acme", "CE", "Egreso", None)
            .await
            .unwrap();
        allocator.allocate("acme", doc.id, None).await.unwrap();

        let resets = allocator.reset_sequences("acme").await.unwrap();
        assert_eq!(resets.len(), 1);
        assert_eq!(resets[0].previous_next_sequence, 2);

        let stored = allocator.get_document_type(doc.id).await.unwrap();
        assert_eq!(stored.next_sequence, 0);
        assert_eq!(stored.control_number, None);
    }
}
