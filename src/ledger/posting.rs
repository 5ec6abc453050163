//! Posting engine
//!
//! Plans the effect of posting or unposting a journal entry against a snapshot
//! of the company's accounts and the ledgers of the accounts involved. Nothing
//! is written here; the result is a [`Changeset`] the caller commits.

use bigdecimal::BigDecimal;
use chrono::NaiveDateTime;
use std::collections::{BTreeSet, HashMap, HashSet};
use uuid::Uuid;

use super::hierarchy::{AccountTree, BalanceCorrection};
use crate::changeset::Changeset;
use crate::config::AggregationScope;
use crate::traits::LedgerStorage;
use crate::types::*;

/// Result of planning a posting operation
#[derive(Debug, Clone)]
pub struct PostingPlan {
    pub changeset: Changeset,
    /// Ledger entries created by the plan, in line order
    pub ledger_entries: Vec<LedgerEntry>,
    /// Ledger entries removed by the plan
    pub reverted: usize,
    /// Parent accounts whose balances changed
    pub corrections: Vec<BalanceCorrection>,
}

/// Plans balance-affecting operations
#[derive(Debug, Clone, Copy)]
pub struct PostingEngine {
    scope: AggregationScope,
}

impl PostingEngine {
    pub fn new(scope: AggregationScope) -> Self {
        Self { scope }
    }

    /// Plan posting `entry`: revert any stale ledger entries of the same
    /// journal entry, then append one ledger entry per line.
    ///
    /// `revision` must have been read before `entry` was loaded.
    pub async fn plan_post<S: LedgerStorage + ?Sized>(
        &self,
        storage: &S,
        entry: &JournalEntry,
        revision: u64,
    ) -> LedgerResult<PostingPlan> {
        let codes = entry.lines.iter().map(|l| l.account_code.clone());
        let mut workspace =
            Workspace::load(storage, &entry.company_id, codes, Some(entry.id), revision).await?;

        let reverted = workspace.revert_journal(entry.id)?;
        if reverted > 0 {
            tracing::warn!(
                entry_number = %entry.entry_number,
                reverted,
                "Reverted stale ledger entries before posting"
            );
        }

        for line in &entry.lines {
            workspace.resolve_leaf(&line.account_code)?;
        }
        for line in &entry.lines {
            workspace.apply_line(entry, line)?;
        }

        workspace.finish(self.scope, reverted)
    }

    /// Plan unposting `entry`: remove its ledger entries and undo their
    /// effect on balances.
    pub async fn plan_unpost<S: LedgerStorage + ?Sized>(
        &self,
        storage: &S,
        entry: &JournalEntry,
        revision: u64,
    ) -> LedgerResult<PostingPlan> {
        let mut workspace = Workspace::load(
            storage,
            &entry.company_id,
            std::iter::empty(),
            Some(entry.id),
            revision,
        )
        .await?;
        let reverted = workspace.revert_journal(entry.id)?;
        workspace.finish(self.scope, reverted)
    }

    /// Plan replacing a leaf account's opening balance.
    ///
    /// Current balances shift by the difference and every running balance of
    /// the account is recomputed from the new opening balance.
    pub async fn plan_opening_balance<S: LedgerStorage + ?Sized>(
        &self,
        storage: &S,
        company_id: &str,
        account_code: &str,
        debit: BigDecimal,
        credit: BigDecimal,
    ) -> LedgerResult<PostingPlan> {
        let zero = BigDecimal::from(0);
        if debit < zero || credit < zero {
            return Err(LedgerError::Validation(
                "Opening balances cannot be negative".to_string(),
            ));
        }

        let revision = storage.company_revision(company_id).await?;
        let mut workspace = Workspace::load(
            storage,
            company_id,
            std::iter::once(account_code.to_string()),
            None,
            revision,
        )
        .await?;
        workspace.resolve_leaf(account_code)?;
        workspace.set_opening_balance(account_code, debit, credit)?;
        workspace.finish(self.scope, 0)
    }
}

/// In-memory copy of everything one posting operation reads and writes
#[derive(Debug)]
pub(crate) struct Workspace {
    company_id: String,
    revision: u64,
    tree: AccountTree,
    /// Ledger entries per account code, kept sorted by `(date, sequence)`
    ledgers: HashMap<String, Vec<LedgerEntry>>,
    inserted: Vec<Uuid>,
    updated: HashSet<Uuid>,
    deleted: Vec<Uuid>,
    touched: BTreeSet<String>,
    resequence: BTreeSet<String>,
    now: NaiveDateTime,
}

impl Workspace {
    pub(crate) fn from_parts(
        company_id: impl Into<String>,
        revision: u64,
        tree: AccountTree,
        ledgers: HashMap<String, Vec<LedgerEntry>>,
    ) -> Self {
        Self {
            company_id: company_id.into(),
            revision,
            tree,
            ledgers,
            inserted: Vec::new(),
            updated: HashSet::new(),
            deleted: Vec::new(),
            touched: BTreeSet::new(),
            resequence: BTreeSet::new(),
            now: chrono::Utc::now().naive_utc(),
        }
    }

    async fn load<S: LedgerStorage + ?Sized>(
        storage: &S,
        company_id: &str,
        codes: impl Iterator<Item = String>,
        journal_entry_id: Option<Uuid>,
        revision: u64,
    ) -> LedgerResult<Self> {
        let tree = AccountTree::from_accounts(storage.list_accounts(company_id).await?)?;

        let mut needed: BTreeSet<String> = codes.collect();
        if let Some(id) = journal_entry_id {
            let stale = storage.list_journal_ledger_entries(id).await?;
            needed.extend(stale.into_iter().map(|e| e.account_code));
        }

        let mut ledgers = HashMap::with_capacity(needed.len());
        for code in needed {
            let Some(account_id) = tree.get(&code).map(|a| a.id) else {
                continue;
            };
            let entries = storage
                .list_account_ledger_entries(account_id, None, None)
                .await?;
            ledgers.insert(code, entries);
        }

        Ok(Self::from_parts(company_id, revision, tree, ledgers))
    }

    /// Fail unless `code` is an active leaf account
    pub(crate) fn resolve_leaf(&self, code: &str) -> LedgerResult<()> {
        let account = self.tree.get(code).ok_or_else(|| {
            LedgerError::AccountNotFound(format!("{} (company {})", code, self.company_id))
        })?;
        if !account.is_active {
            return Err(LedgerError::Validation(format!(
                "Account {} is inactive",
                code
            )));
        }
        if !self.tree.is_leaf(code) {
            return Err(LedgerError::Validation(format!(
                "Account {} has sub-accounts and cannot receive postings",
                code
            )));
        }
        Ok(())
    }

    /// Remove every ledger entry of `journal_entry_id` and undo its movement
    pub(crate) fn revert_journal(&mut self, journal_entry_id: Uuid) -> LedgerResult<usize> {
        let mut reverted = 0;
        for (code, entries) in self.ledgers.iter_mut() {
            let (stale, keep): (Vec<LedgerEntry>, Vec<LedgerEntry>) = entries
                .drain(..)
                .partition(|e| e.journal_entry_id == journal_entry_id);
            *entries = keep;
            if stale.is_empty() {
                continue;
            }

            let account = self.tree.get_mut(code).ok_or_else(|| {
                LedgerError::Integrity(format!(
                    "Ledger entries reference missing account {}",
                    code
                ))
            })?;
            for entry in &stale {
                account.revert_movement(&entry.debit_amount, &entry.credit_amount, self.now);
                self.deleted.push(entry.id);
            }
            reverted += stale.len();
            self.touched.insert(code.clone());
            self.resequence.insert(code.clone());
        }
        Ok(reverted)
    }

    /// Append the ledger entry for one line and move the account's balance
    pub(crate) fn apply_line(
        &mut self,
        entry: &JournalEntry,
        line: &JournalLine,
    ) -> LedgerResult<()> {
        let code = &line.account_code;
        let account = self
            .tree
            .get_mut(code)
            .ok_or_else(|| LedgerError::AccountNotFound(code.clone()))?;
        account.apply_movement(&line.debit, &line.credit, self.now);

        let ledger = self.ledgers.entry(code.clone()).or_default();
        let sequence = ledger.iter().map(|e| e.sequence).max().unwrap_or(0) + 1;
        let appends = ledger.last().is_none_or(|last| last.date <= entry.date);
        let (previous_debit, previous_credit) = match ledger.last() {
            Some(last) if appends => (
                last.running_debit_balance.clone(),
                last.running_credit_balance.clone(),
            ),
            _ => (
                account.initial_debit_balance.clone(),
                account.initial_credit_balance.clone(),
            ),
        };

        let ledger_entry = LedgerEntry {
            id: Uuid::new_v4(),
            company_id: entry.company_id.clone(),
            account_id: account.id,
            account_code: code.clone(),
            journal_entry_id: entry.id,
            date: entry.date,
            sequence,
            description: if line.description.is_empty() {
                entry.description.clone()
            } else {
                line.description.clone()
            },
            reference: line.reference.clone(),
            debit_amount: line.debit.clone(),
            credit_amount: line.credit.clone(),
            running_debit_balance: previous_debit + &line.debit,
            running_credit_balance: previous_credit + &line.credit,
            created_at: self.now,
        };

        self.inserted.push(ledger_entry.id);
        ledger.push(ledger_entry);
        if !appends {
            // Back-dated: later entries' running balances now include this one
            ledger.sort_by_key(LedgerEntry::order_key);
            self.resequence.insert(code.clone());
        }
        self.touched.insert(code.clone());
        Ok(())
    }

    pub(crate) fn set_opening_balance(
        &mut self,
        code: &str,
        debit: BigDecimal,
        credit: BigDecimal,
    ) -> LedgerResult<()> {
        let account = self
            .tree
            .get_mut(code)
            .ok_or_else(|| LedgerError::AccountNotFound(code.to_string()))?;
        account.current_debit_balance += &debit - &account.initial_debit_balance;
        account.current_credit_balance += &credit - &account.initial_credit_balance;
        account.initial_debit_balance = debit;
        account.initial_credit_balance = credit;
        account.updated_at = self.now;

        self.touched.insert(code.to_string());
        self.resequence.insert(code.to_string());
        Ok(())
    }

    /// Recompute running balances of one account from its opening balance
    fn resequence(&mut self, code: &str) {
        let Some(account) = self.tree.get(code) else {
            return;
        };
        let mut debit = account.initial_debit_balance.clone();
        let mut credit = account.initial_credit_balance.clone();

        let Some(entries) = self.ledgers.get_mut(code) else {
            return;
        };
        entries.sort_by_key(LedgerEntry::order_key);
        for entry in entries.iter_mut() {
            debit += &entry.debit_amount;
            credit += &entry.credit_amount;
            if entry.running_debit_balance != debit || entry.running_credit_balance != credit {
                entry.running_debit_balance = debit.clone();
                entry.running_credit_balance = credit.clone();
                if !self.inserted.contains(&entry.id) {
                    self.updated.insert(entry.id);
                }
            }
        }
    }

    /// Resequence, aggregate parents, check the result and build the changeset
    pub(crate) fn finish(
        mut self,
        scope: AggregationScope,
        reverted: usize,
    ) -> LedgerResult<PostingPlan> {
        let pending: Vec<String> = self.resequence.iter().cloned().collect();
        for code in &pending {
            self.resequence(code);
        }

        let corrections = match scope {
            AggregationScope::Ancestors => self.tree.aggregate_ancestors_of(&self.touched),
            AggregationScope::Company => self.tree.aggregate_all(),
        };

        let ancestors: BTreeSet<String> = self
            .touched
            .iter()
            .flat_map(|code| self.tree.ancestors(code))
            .collect();
        self.tree.ensure_consistent(&ancestors)?;

        let mut changeset = Changeset::new(self.company_id.clone()).with_revision(self.revision);
        let changed_accounts: BTreeSet<&String> = self
            .touched
            .iter()
            .chain(corrections.iter().map(|c| &c.code))
            .collect();
        changeset.accounts = changed_accounts
            .into_iter()
            .filter_map(|code| self.tree.get(code).cloned())
            .collect();

        let mut ledger_entries = Vec::with_capacity(self.inserted.len());
        for entries in self.ledgers.values() {
            for entry in entries {
                if self.updated.contains(&entry.id) {
                    changeset.updated_ledger_entries.push(entry.clone());
                }
            }
        }
        for id in &self.inserted {
            if let Some(entry) = self
                .ledgers
                .values()
                .flat_map(|entries| entries.iter())
                .find(|e| e.id == *id)
            {
                ledger_entries.push(entry.clone());
            }
        }
        changeset.inserted_ledger_entries = ledger_entries.clone();
        changeset.deleted_ledger_entries = self.deleted;

        Ok(PostingPlan {
            changeset,
            ledger_entries,
            reverted,
            corrections,
        })
    }
}
