//! Validation utilities

use crate::traits::*;
use crate::types::*;
use bigdecimal::BigDecimal;

/// Validate that an amount is positive
pub fn validate_positive_amount(amount: &BigDecimal) -> LedgerResult<()> {
    if *amount <= BigDecimal::from(0) {
        Err(LedgerError::Validation(
            "Amount must be positive".to_string(),
        ))
    } else {
        Ok(())
    }
}

/// Validate that an account code is valid
pub fn validate_account_code(code: &str) -> LedgerResult<()> {
    if code.trim().is_empty() {
        return Err(LedgerError::Validation(
            "Account code cannot be empty".to_string(),
        ));
    }

    if code.len() > 20 {
        return Err(LedgerError::Validation(
            "Account code cannot exceed 20 characters".to_string(),
        ));
    }

    // Hierarchical codes are plain alphanumerics; dots and dashes would break
    // the two-characters-per-level convention
    if !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(LedgerError::Validation(format!(
            "Account code '{}' can only contain ASCII letters and digits",
            code
        )));
    }

    Ok(())
}

/// Validate that an account name is valid
pub fn validate_account_name(name: &str) -> LedgerResult<()> {
    if name.trim().is_empty() {
        return Err(LedgerError::Validation(
            "Account name cannot be empty".to_string(),
        ));
    }

    if name.len() > 100 {
        return Err(LedgerError::Validation(
            "Account name cannot exceed 100 characters".to_string(),
        ));
    }

    Ok(())
}

/// Validate a document type code such as `CE` or `CI`
pub fn validate_document_code(code: &str) -> LedgerResult<()> {
    if code.trim().is_empty() {
        return Err(LedgerError::Validation(
            "Document type code cannot be empty".to_string(),
        ));
    }

    if code.len() > 10 {
        return Err(LedgerError::Validation(
            "Document type code cannot exceed 10 characters".to_string(),
        ));
    }

    if !code.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(LedgerError::Validation(format!(
            "Document type code '{}' can only contain letters, digits and underscores",
            code
        )));
    }

    Ok(())
}

/// Validate that a journal entry description is valid
pub fn validate_entry_description(description: &str) -> LedgerResult<()> {
    if description.trim().is_empty() {
        return Err(LedgerError::Validation(
            "Journal entry description cannot be empty".to_string(),
        ));
    }

    if description.len() > 500 {
        return Err(LedgerError::Validation(
            "Journal entry description cannot exceed 500 characters".to_string(),
        ));
    }

    Ok(())
}

/// Stricter journal validator for manually keyed entries
pub struct EnhancedJournalValidator;

impl JournalValidator for EnhancedJournalValidator {
    fn validate_entry(&self, entry: &JournalEntry, tolerance: &BigDecimal) -> LedgerResult<()> {
        // Basic validation
        entry.validate(tolerance)?;

        validate_entry_description(&entry.description)?;

        if entry.lines.len() < 2 {
            return Err(LedgerError::Validation(
                "Journal entry needs at least one debit line and one credit line".to_string(),
            ));
        }

        let zero = BigDecimal::from(0);
        for line in &entry.lines {
            validate_account_code(&line.account_code)?;

            // Exactly one side carries the amount
            let has_debit = line.debit > zero;
            let has_credit = line.credit > zero;
            if has_debit == has_credit {
                return Err(LedgerError::Validation(format!(
                    "Line for account {} must have either a debit or a credit amount",
                    line.account_code
                )));
            }
        }

        Ok(())
    }
}
