//! Account management functionality

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use super::hierarchy::{
    heuristic_parent_code, level_for_code, AccountTree, BalanceCorrection, HierarchyMismatch,
};
use super::posting::PostingEngine;
use crate::changeset::{commit_with_retry, Changeset};
use crate::config::LedgerConfig;
use crate::traits::*;
use crate::types::*;
use crate::utils::validation::{validate_account_code, validate_account_name};

/// Parameters for creating an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAccount {
    pub code: String,
    pub name: String,
    pub account_type: AccountType,
    pub parent_code: Option<String>,
    pub description: Option<String>,
    pub initial_debit_balance: BigDecimal,
    pub initial_credit_balance: BigDecimal,
}

impl NewAccount {
    pub fn new(
        code: impl Into<String>,
        name: impl Into<String>,
        account_type: AccountType,
    ) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            account_type,
            parent_code: None,
            description: None,
            initial_debit_balance: BigDecimal::from(0),
            initial_credit_balance: BigDecimal::from(0),
        }
    }

    /// Attach to an explicit parent instead of the code-derived one
    pub fn parent(mut self, parent_code: impl Into<String>) -> Self {
        self.parent_code = Some(parent_code.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn opening_balance(mut self, debit: BigDecimal, credit: BigDecimal) -> Self {
        self.initial_debit_balance = debit;
        self.initial_credit_balance = credit;
        self
    }
}

/// Parent code written onto a legacy account by the backfill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentCodeBackfill {
    pub code: String,
    pub parent_code: String,
    pub level: u32,
}

/// Result of an explicit hierarchy repair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchyRepairReport {
    pub company_id: String,
    pub parents_checked: usize,
    pub corrections: Vec<BalanceCorrection>,
}

/// Consistency snapshot of a company's books
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub company_id: String,
    /// Parents whose balances differ from the sum of their children
    pub mismatches: Vec<HierarchyMismatch>,
    pub leaf_debit_total: BigDecimal,
    pub leaf_credit_total: BigDecimal,
    /// Posted entries whose lines do not balance
    pub unbalanced_entries: Vec<String>,
    pub trial_balance_ok: bool,
}

impl IntegrityReport {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty() && self.unbalanced_entries.is_empty() && self.trial_balance_ok
    }
}

/// Movements of one account over a period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountLedger {
    pub account: Account,
    pub entries: Vec<LedgerEntry>,
    pub total_debit: BigDecimal,
    pub total_credit: BigDecimal,
    /// Period movement on the account's normal side
    pub net_balance: BigDecimal,
}

impl AccountLedger {
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

/// Account manager for the accounts the posting core reads and writes
#[derive(Clone)]
pub struct AccountManager<S: LedgerStorage> {
    pub(crate) storage: S,
    engine: PostingEngine,
    tolerance: BigDecimal,
    max_commit_attempts: u32,
}

impl<S: LedgerStorage> AccountManager<S> {
    /// Create a new account manager
    pub fn new(storage: S, config: &LedgerConfig) -> Self {
        Self {
            storage,
            engine: PostingEngine::new(config.aggregation_scope),
            tolerance: config.balance_tolerance.clone(),
            max_commit_attempts: config.max_commit_attempts,
        }
    }

    /// Create a new account.
    ///
    /// The parent is the explicit `parent_code` when given, otherwise the
    /// code-derived parent if such an account exists. Ancestors are
    /// re-aggregated in the same unit of work.
    #[instrument(skip_all, fields(company_id = %company_id, code = %new_account.code))]
    pub async fn create_account(
        &self,
        company_id: &str,
        new_account: NewAccount,
    ) -> LedgerResult<Account> {
        validate_account_code(&new_account.code)?;
        validate_account_name(&new_account.name)?;
        let zero = BigDecimal::from(0);
        if new_account.initial_debit_balance < zero || new_account.initial_credit_balance < zero {
            return Err(LedgerError::Validation(
                "Opening balances cannot be negative".to_string(),
            ));
        }

        let account_id = Uuid::new_v4();
        let new_account = &new_account;
        let account = commit_with_retry(
            &self.storage,
            self.max_commit_attempts,
            "create_account",
            move || self.plan_create(company_id, account_id, new_account),
        )
        .await?;

        info!(level = account.level, parent_code = ?account.parent_code, "Account created");
        Ok(account)
    }

    async fn plan_create(
        &self,
        company_id: &str,
        account_id: Uuid,
        new_account: &NewAccount,
    ) -> LedgerResult<(Changeset, Account)> {
        let revision = self.storage.company_revision(company_id).await?;
        let accounts = self.storage.list_accounts(company_id).await?;

        if accounts.iter().any(|a| a.code == new_account.code) {
            return Err(LedgerError::Conflict(format!(
                "Account code {} already exists",
                new_account.code
            )));
        }

        let parent = match new_account.parent_code.as_deref() {
            Some(code) => Some(accounts.iter().find(|a| a.code == code).ok_or_else(|| {
                LedgerError::Validation(format!("Parent account {} does not exist", code))
            })?),
            None => heuristic_parent_code(&new_account.code)
                .and_then(|code| accounts.iter().find(|a| a.code == code)),
        };

        if let Some(parent) = parent {
            let postings = self
                .storage
                .list_account_ledger_entries(parent.id, None, None)
                .await?;
            if !postings.is_empty() {
                return Err(LedgerError::Validation(format!(
                    "Account {} already has postings and cannot receive sub-accounts",
                    parent.code
                )));
            }
            let zero = BigDecimal::from(0);
            if parent.initial_debit_balance != zero || parent.initial_credit_balance != zero {
                return Err(LedgerError::Validation(format!(
                    "Account {} carries an opening balance; move it to a sub-account first",
                    parent.code
                )));
            }
        }

        let mut account = Account::new(
            company_id.to_string(),
            new_account.code.clone(),
            new_account.name.clone(),
            new_account.account_type,
            parent.map(|p| p.code.clone()),
        );
        account.id = account_id;
        account.description = new_account.description.clone();
        account.level = parent
            .map(|p| p.level + 1)
            .unwrap_or_else(|| level_for_code(&account.code));
        account.initial_debit_balance = new_account.initial_debit_balance.clone();
        account.initial_credit_balance = new_account.initial_credit_balance.clone();
        account.current_debit_balance = new_account.initial_debit_balance.clone();
        account.current_credit_balance = new_account.initial_credit_balance.clone();

        let mut tree = AccountTree::from_accounts(
            accounts.into_iter().chain(std::iter::once(account.clone())),
        )?;
        let corrections = tree.aggregate_ancestors_of(std::iter::once(&account.code));

        let mut changeset = Changeset::new(company_id).with_revision(revision);
        changeset.accounts.push(account.clone());
        changeset.accounts.extend(
            corrections
                .iter()
                .filter_map(|c| tree.get(&c.code).cloned()),
        );
        Ok((changeset, account))
    }

    /// Get an account by code, returning an error if not found
    pub async fn get_account(&self, company_id: &str, code: &str) -> LedgerResult<Account> {
        self.storage
            .get_account_by_code(company_id, code)
            .await?
            .ok_or_else(|| {
                LedgerError::AccountNotFound(format!("{} (company {})", code, company_id))
            })
    }

    /// List all accounts of a company ordered by code
    pub async fn list_accounts(&self, company_id: &str) -> LedgerResult<Vec<Account>> {
        let mut accounts = self.storage.list_accounts(company_id).await?;
        accounts.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(accounts)
    }

    /// Replace a leaf account's opening balance
    #[instrument(skip_all, fields(company_id = %company_id, code = %code))]
    pub async fn set_opening_balance(
        &self,
        company_id: &str,
        code: &str,
        debit: BigDecimal,
        credit: BigDecimal,
    ) -> LedgerResult<Account> {
        let (debit, credit) = (&debit, &credit);
        commit_with_retry(
            &self.storage,
            self.max_commit_attempts,
            "set_opening_balance",
            move || self.plan_opening_balance(company_id, code, debit, credit),
        )
        .await?;

        let account = self.get_account(company_id, code).await?;
        info!(
            initial_debit = %account.initial_debit_balance,
            initial_credit = %account.initial_credit_balance,
            "Opening balance set"
        );
        Ok(account)
    }

    async fn plan_opening_balance(
        &self,
        company_id: &str,
        code: &str,
        debit: &BigDecimal,
        credit: &BigDecimal,
    ) -> LedgerResult<(Changeset, ())> {
        let plan = self
            .engine
            .plan_opening_balance(&self.storage, company_id, code, debit.clone(), credit.clone())
            .await?;
        Ok((plan.changeset, ()))
    }

    /// One-time migration writing code-derived parent codes onto accounts
    /// that have none
    #[instrument(skip_all, fields(company_id = %company_id))]
    pub async fn backfill_parent_codes(
        &self,
        company_id: &str,
    ) -> LedgerResult<Vec<ParentCodeBackfill>> {
        commit_with_retry(
            &self.storage,
            self.max_commit_attempts,
            "backfill_parent_codes",
            move || self.plan_backfill(company_id),
        )
        .await
        .inspect(|filled| info!(count = filled.len(), "Parent codes backfilled"))
    }

    async fn plan_backfill(
        &self,
        company_id: &str,
    ) -> LedgerResult<(Changeset, Vec<ParentCodeBackfill>)> {
        let revision = self.storage.company_revision(company_id).await?;
        let tree = AccountTree::from_accounts(self.storage.list_accounts(company_id).await?)?;

        let mut changeset = Changeset::new(company_id).with_revision(revision);
        let mut filled = Vec::new();
        for account in tree.accounts().filter(|a| a.parent_code.is_none()) {
            let Some(parent_code) = heuristic_parent_code(&account.code) else {
                continue;
            };
            let Some(parent) = tree.get(parent_code) else {
                continue;
            };

            let mut updated = account.clone();
            updated.parent_code = Some(parent.code.clone());
            updated.level = parent.level + 1;
            updated.updated_at = chrono::Utc::now().naive_utc();
            filled.push(ParentCodeBackfill {
                code: updated.code.clone(),
                parent_code: parent.code.clone(),
                level: updated.level,
            });
            changeset.accounts.push(updated);
        }

        Ok((changeset, filled))
    }

    /// Recompute every parent account of the company and report what changed.
    ///
    /// Balances are kept consistent by posting itself; this is a maintenance
    /// tool for data written outside the core.
    #[instrument(skip_all, fields(company_id = %company_id))]
    pub async fn repair_hierarchy(&self, company_id: &str) -> LedgerResult<HierarchyRepairReport> {
        let report = commit_with_retry(
            &self.storage,
            self.max_commit_attempts,
            "repair_hierarchy",
            move || self.plan_repair(company_id),
        )
        .await?;
        info!(
            parents_checked = report.parents_checked,
            corrected = report.corrections.len(),
            "Hierarchy repaired"
        );
        Ok(report)
    }

    async fn plan_repair(
        &self,
        company_id: &str,
    ) -> LedgerResult<(Changeset, HierarchyRepairReport)> {
        let revision = self.storage.company_revision(company_id).await?;
        let mut tree = AccountTree::from_accounts(self.storage.list_accounts(company_id).await?)?;
        let parents_checked = tree.parent_codes().len();
        let corrections = tree.aggregate_all();

        let mut changeset = Changeset::new(company_id).with_revision(revision);
        changeset.accounts = corrections
            .iter()
            .filter_map(|c| tree.get(&c.code).cloned())
            .collect();

        Ok((
            changeset,
            HierarchyRepairReport {
                company_id: company_id.to_string(),
                parents_checked,
                corrections,
            },
        ))
    }

    /// Check parent sums, the leaf trial balance and posted entry balance
    pub async fn validate_integrity(&self, company_id: &str) -> LedgerResult<IntegrityReport> {
        let tree = AccountTree::from_accounts(self.storage.list_accounts(company_id).await?)?;

        let mut leaf_debit_total = BigDecimal::from(0);
        let mut leaf_credit_total = BigDecimal::from(0);
        for account in tree.accounts().filter(|a| a.is_active && tree.is_leaf(&a.code)) {
            leaf_debit_total += &account.current_debit_balance;
            leaf_credit_total += &account.current_credit_balance;
        }
        let trial_balance_ok = (&leaf_debit_total - &leaf_credit_total).abs() <= self.tolerance;

        let posted = JournalEntryFilter {
            status: Some(JournalEntryStatus::Posted),
            ..Default::default()
        };
        let unbalanced_entries = self
            .storage
            .list_journal_entries(company_id, &posted)
            .await?
            .into_iter()
            .filter(|e| !e.is_balanced(&self.tolerance))
            .map(|e| e.entry_number)
            .collect();

        Ok(IntegrityReport {
            company_id: company_id.to_string(),
            mismatches: tree.mismatches(),
            leaf_debit_total,
            leaf_credit_total,
            unbalanced_entries,
            trial_balance_ok,
        })
    }

    /// Fail with `Integrity` unless the company's books are consistent
    pub async fn ensure_integrity(&self, company_id: &str) -> LedgerResult<IntegrityReport> {
        let report = self.validate_integrity(company_id).await?;
        if !report.is_consistent() {
            return Err(LedgerError::Integrity(format!(
                "Company {}: {} parent mismatches, {} unbalanced entries, leaf totals D:{} C:{}",
                company_id,
                report.mismatches.len(),
                report.unbalanced_entries.len(),
                report.leaf_debit_total,
                report.leaf_credit_total
            )));
        }
        Ok(report)
    }

    /// Ledger entries of one account in `(date, sequence)` order with totals
    pub async fn account_ledger(
        &self,
        company_id: &str,
        code: &str,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> LedgerResult<AccountLedger> {
        let account = self.get_account(company_id, code).await?;
        let entries = self
            .storage
            .list_account_ledger_entries(account.id, start_date, end_date)
            .await?;
        Ok(summarize(account, entries))
    }

    /// Account ledgers of every active account ordered by code
    pub async fn general_ledger(
        &self,
        company_id: &str,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> LedgerResult<Vec<AccountLedger>> {
        let mut ledgers = Vec::new();
        for account in self
            .list_accounts(company_id)
            .await?
            .into_iter()
            .filter(|a| a.is_active)
        {
            let entries = self
                .storage
                .list_account_ledger_entries(account.id, start_date, end_date)
                .await?;
            ledgers.push(summarize(account, entries));
        }
        Ok(ledgers)
    }
}

fn summarize(account: Account, entries: Vec<LedgerEntry>) -> AccountLedger {
    let total_debit: BigDecimal = entries.iter().map(|e| &e.debit_amount).sum();
    let total_credit: BigDecimal = entries.iter().map(|e| &e.credit_amount).sum();
    let net_balance = match account.nature {
        AccountNature::Debit => &total_debit - &total_credit,
        AccountNature::Credit => &total_credit - &total_debit,
    };
    AccountLedger {
        account,
        entries,
        total_debit,
        total_credit,
        net_balance,
    }
}

/// Utility functions for working with accounts
pub mod utils {
    use super::*;

    /// Create a small hierarchical chart using the 1/3/5 digit convention
    pub async fn create_standard_chart<S: LedgerStorage>(
        account_manager: &AccountManager<S>,
        company_id: &str,
    ) -> LedgerResult<Vec<Account>> {
        let chart = [
            ("1", "Assets", AccountType::Asset),
            ("101", "Current Assets", AccountType::Asset),
            ("10101", "Cash", AccountType::Asset),
            ("10102", "Bank", AccountType::Asset),
            ("10103", "Accounts Receivable", AccountType::Asset),
            ("2", "Liabilities", AccountType::Liability),
            ("201", "Current Liabilities", AccountType::Liability),
            ("20101", "Accounts Payable", AccountType::Liability),
            ("3", "Equity", AccountType::Equity),
            ("301", "Capital", AccountType::Equity),
            ("4", "Income", AccountType::Income),
            ("401", "Sales", AccountType::Income),
            ("5", "Expenses", AccountType::Expense),
            ("501", "Operating Expenses", AccountType::Expense),
            ("50101", "Rent", AccountType::Expense),
            ("50102", "Office Supplies", AccountType::Expense),
        ];

        let mut accounts = Vec::with_capacity(chart.len());
        for (code, name, account_type) in chart {
            let account = account_manager
                .create_account(company_id, NewAccount::new(code, name, account_type))
                .await?;
            accounts.push(account);
        }
        Ok(accounts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::MemoryStorage;

    fn manager() -> AccountManager<MemoryStorage> {
        AccountManager::new(MemoryStorage::new(), &LedgerConfig::default())
    }

    #[tokio::test]
    async fn test_create_derives_parent_and_level() {
        let manager = manager();
        utils::create_standard_chart(&manager, "acme").await.unwrap();

        let cash = manager.get_account("acme", "10101").await.unwrap();
        assert_eq!(cash.parent_code.as_deref(), Some("101"));
        assert_eq!(cash.level, 3);

        let assets = manager.get_account("acme", "1").await.unwrap();
        assert_eq!(assets.parent_code, None);
        assert_eq!(assets.level, 1);
    }

    #[tokio::test]
    async fn test_duplicate_code_conflicts() {
        let manager = manager();
        manager
            .create_account("acme", NewAccount::new("1", "Assets", AccountType::Asset))
            .await
            .unwrap();
        let err = manager
            .create_account("acme", NewAccount::new("1", "Assets", AccountType::Asset))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_opening_balance_rolls_up() {
        let manager = manager();
        utils::create_standard_chart(&manager, "acme").await.unwrap();

        manager
            .set_opening_balance("acme", "10101", BigDecimal::from(1000), BigDecimal::from(0))
            .await
            .unwrap();
        manager
            .set_opening_balance("acme", "10102", BigDecimal::from(500), BigDecimal::from(0))
            .await
            .unwrap();

        let assets = manager.get_account("acme", "1").await.unwrap();
        assert_eq!(assets.current_debit_balance, BigDecimal::from(1500));

        let err = manager
            .set_opening_balance("acme", "101", BigDecimal::from(1), BigDecimal::from(0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_parent_with_opening_balance_keeps_it() {
        let manager = manager();
        manager
            .create_account("acme", NewAccount::new("1", "Assets", AccountType::Asset))
            .await
            .unwrap();
        manager
            .create_account(
                "acme",
                NewAccount::new("101", "Current Assets", AccountType::Asset)
                    .opening_balance(BigDecimal::from(300), BigDecimal::from(0)),
            )
            .await
            .unwrap();

        let err = manager
            .create_account("acme", NewAccount::new("10101", "Cash", AccountType::Asset))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let current = manager.get_account("acme", "101").await.unwrap();
        assert_eq!(current.current_debit_balance, BigDecimal::from(300));
        assert!(manager.get_account("acme", "10101").await.is_err());
        let assets = manager.get_account("acme", "1").await.unwrap();
        assert_eq!(assets.current_debit_balance, BigDecimal::from(300));
    }

    #[tokio::test]
    async fn test_backfill_parent_codes() {
        let storage = MemoryStorage::new();
        let manager = AccountManager::new(storage.clone(), &LedgerConfig::default());
        for code in ["1", "101", "10101"] {
            let legacy = Account::new(
                "acme".to_string(),
                code.to_string(),
                format!("Legacy {}", code),
                AccountType::Asset,
                None,
            );
            storage.force_account(legacy).unwrap();
        }

        let filled = manager.backfill_parent_codes("acme").await.unwrap();
        assert_eq!(filled.len(), 2);

        let leaf = manager.get_account("acme", "10101").await.unwrap();
        assert_eq!(leaf.parent_code.as_deref(), Some("101"));
        assert_eq!(leaf.level, 3);

        assert!(manager.backfill_parent_codes("acme").await.unwrap().is_empty());
    }
}
