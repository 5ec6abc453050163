//! Account hierarchy and balance aggregation
//!
//! Accounts are held in an arena keyed by code. Each active account carries a
//! parent key and a cached list of direct children, so aggregation walks
//! explicit edges instead of re-deriving them from code prefixes on every read.
//! The code-length heuristic only fills in edges for legacy accounts that have
//! no `parent_code`.

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::types::*;

/// Depth implied by a code under the 1/3/5/7/9 digit convention
pub fn level_for_code(code: &str) -> u32 {
    let len = code.chars().count() as u32;
    if len == 0 {
        1
    } else {
        len.div_ceil(2)
    }
}

/// Parent code implied by the code-length convention: the code minus its last
/// two characters (`"10101"` → `"101"`, `"101"` → `"1"`).
pub fn heuristic_parent_code(code: &str) -> Option<&str> {
    let len = code.len();
    if len <= 2 || !code.is_char_boundary(len - 2) {
        return None;
    }
    Some(&code[..len - 2])
}

/// One parent account whose balances were recomputed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceCorrection {
    pub code: String,
    pub children_count: usize,
    pub previous_debit: BigDecimal,
    pub previous_credit: BigDecimal,
    pub debit: BigDecimal,
    pub credit: BigDecimal,
}

/// A parent whose stored balances disagree with its children
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchyMismatch {
    pub code: String,
    pub stored_debit: BigDecimal,
    pub stored_credit: BigDecimal,
    pub children_debit: BigDecimal,
    pub children_credit: BigDecimal,
}

/// Arena of a company's accounts with explicit parent/child edges
#[derive(Debug, Clone, Default)]
pub struct AccountTree {
    accounts: BTreeMap<String, Account>,
    parents: HashMap<String, String>,
    children: BTreeMap<String, Vec<String>>,
    depths: HashMap<String, usize>,
}

impl AccountTree {
    /// Build the tree, preferring explicit `parent_code` over the heuristic.
    ///
    /// Only active accounts take part in edges. Fails with `Integrity` when
    /// explicit parent codes form a cycle.
    pub fn from_accounts(accounts: impl IntoIterator<Item = Account>) -> LedgerResult<Self> {
        let accounts: BTreeMap<String, Account> =
            accounts.into_iter().map(|a| (a.code.clone(), a)).collect();

        let is_active = |code: &str| accounts.get(code).is_some_and(|a| a.is_active);

        let mut parents = HashMap::new();
        let mut children: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for account in accounts.values().filter(|a| a.is_active) {
            let parent = match account.parent_code.as_deref() {
                Some(parent) if parent == account.code => {
                    return Err(LedgerError::Integrity(format!(
                        "Account {} is its own parent",
                        account.code
                    )));
                }
                Some(parent) if is_active(parent) => Some(parent.to_string()),
                Some(parent) => {
                    tracing::warn!(
                        code = %account.code,
                        parent_code = %parent,
                        "Parent code does not match an active account; using code heuristic"
                    );
                    heuristic_parent_code(&account.code)
                        .filter(|p| is_active(p))
                        .map(str::to_string)
                }
                None => heuristic_parent_code(&account.code)
                    .filter(|p| is_active(p))
                    .map(str::to_string),
            };

            if let Some(parent) = parent {
                children
                    .entry(parent.clone())
                    .or_default()
                    .push(account.code.clone());
                parents.insert(account.code.clone(), parent);
            }
        }

        let mut tree = Self {
            accounts,
            parents,
            children,
            depths: HashMap::new(),
        };
        tree.compute_depths()?;
        Ok(tree)
    }

    fn compute_depths(&mut self) -> LedgerResult<()> {
        let limit = self.accounts.len();
        let mut depths = HashMap::with_capacity(limit);
        for code in self.accounts.keys() {
            let mut depth = 0;
            let mut current = code.as_str();
            while let Some(parent) = self.parents.get(current) {
                depth += 1;
                if depth > limit {
                    return Err(LedgerError::Integrity(format!(
                        "Parent codes form a cycle through account {}",
                        code
                    )));
                }
                current = parent.as_str();
            }
            depths.insert(code.clone(), depth);
        }
        self.depths = depths;
        Ok(())
    }

    pub fn get(&self, code: &str) -> Option<&Account> {
        self.accounts.get(code)
    }

    pub fn get_mut(&mut self, code: &str) -> Option<&mut Account> {
        self.accounts.get_mut(code)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Accounts ordered by code
    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    pub fn into_accounts(self) -> Vec<Account> {
        self.accounts.into_values().collect()
    }

    pub fn parent_of(&self, code: &str) -> Option<&str> {
        self.parents.get(code).map(String::as_str)
    }

    pub fn children_of(&self, code: &str) -> &[String] {
        self.children.get(code).map(Vec::as_slice).unwrap_or(&[])
    }

    /// An account without active children receives postings directly
    pub fn is_leaf(&self, code: &str) -> bool {
        self.children_of(code).is_empty()
    }

    /// Distance from the top of the chart (0 for roots)
    pub fn depth(&self, code: &str) -> usize {
        self.depths.get(code).copied().unwrap_or(0)
    }

    /// Ancestors of `code`, nearest first
    pub fn ancestors(&self, code: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = code;
        while let Some(parent) = self.parents.get(current) {
            chain.push(parent.clone());
            current = parent.as_str();
        }
        chain
    }

    /// Codes of every account that has at least one child
    pub fn parent_codes(&self) -> Vec<String> {
        self.children.keys().cloned().collect()
    }

    /// Deepest first, so every child is final before its parent is summed
    fn bottom_up(&self, mut codes: Vec<String>) -> Vec<String> {
        codes.sort_by(|a, b| {
            self.depth(b)
                .cmp(&self.depth(a))
                .then_with(|| b.len().cmp(&a.len()))
                .then_with(|| a.cmp(b))
        });
        codes.dedup();
        codes
    }

    fn children_sums(&self, code: &str) -> (BigDecimal, BigDecimal) {
        let mut debit = BigDecimal::from(0);
        let mut credit = BigDecimal::from(0);
        for child in self.children_of(code) {
            if let Some(account) = self.accounts.get(child) {
                debit += &account.current_debit_balance;
                credit += &account.current_credit_balance;
            }
        }
        (debit, credit)
    }

    /// Set one parent to the sum of its direct children
    fn recompute(&mut self, code: &str) -> Option<BalanceCorrection> {
        let children = self.children_of(code);
        if children.is_empty() {
            return None;
        }
        let children_count = children.len();
        let latest_activity = children
            .iter()
            .filter_map(|c| self.accounts.get(c))
            .filter_map(|a| a.last_transaction_date)
            .max();
        let (debit, credit) = self.children_sums(code);

        let account = self.accounts.get_mut(code)?;
        if account.current_debit_balance == debit && account.current_credit_balance == credit {
            return None;
        }

        let correction = BalanceCorrection {
            code: code.to_string(),
            children_count,
            previous_debit: account.current_debit_balance.clone(),
            previous_credit: account.current_credit_balance.clone(),
            debit: debit.clone(),
            credit: credit.clone(),
        };
        account.current_debit_balance = debit;
        account.current_credit_balance = credit;
        account.last_transaction_date = latest_activity.or(account.last_transaction_date);
        account.updated_at = chrono::Utc::now().naive_utc();
        Some(correction)
    }

    /// Recompute every parent account of the company in one bottom-up pass
    pub fn aggregate_all(&mut self) -> Vec<BalanceCorrection> {
        let order = self.bottom_up(self.parent_codes());
        self.aggregate_in_order(order)
    }

    /// Recompute only the ancestor chains of the given leaves
    pub fn aggregate_ancestors_of<'a>(
        &mut self,
        leaves: impl IntoIterator<Item = &'a String>,
    ) -> Vec<BalanceCorrection> {
        let mut ancestors = BTreeSet::new();
        for leaf in leaves {
            ancestors.extend(self.ancestors(leaf));
        }
        let order = self.bottom_up(ancestors.into_iter().collect());
        self.aggregate_in_order(order)
    }

    fn aggregate_in_order(&mut self, order: Vec<String>) -> Vec<BalanceCorrection> {
        let corrections: Vec<BalanceCorrection> =
            order.iter().filter_map(|code| self.recompute(code)).collect();
        tracing::debug!(
            parents = order.len(),
            corrected = corrections.len(),
            "Aggregated parent balances"
        );
        corrections
    }

    /// Parents whose stored balances differ from the sum of their children
    pub fn mismatches(&self) -> Vec<HierarchyMismatch> {
        self.parent_codes()
            .into_iter()
            .filter_map(|code| {
                let account = self.accounts.get(&code)?;
                let (children_debit, children_credit) = self.children_sums(&code);
                if account.current_debit_balance == children_debit
                    && account.current_credit_balance == children_credit
                {
                    return None;
                }
                Some(HierarchyMismatch {
                    stored_debit: account.current_debit_balance.clone(),
                    stored_credit: account.current_credit_balance.clone(),
                    code,
                    children_debit,
                    children_credit,
                })
            })
            .collect()
    }

    /// Fail with `Integrity` if any of `codes` disagrees with its children
    pub fn ensure_consistent<'a>(
        &self,
        codes: impl IntoIterator<Item = &'a String>,
    ) -> LedgerResult<()> {
        for code in codes {
            let Some(account) = self.accounts.get(code) else {
                continue;
            };
            if self.is_leaf(code) {
                continue;
            }
            let (debit, credit) = self.children_sums(code);
            if account.current_debit_balance != debit || account.current_credit_balance != credit {
                return Err(LedgerError::Integrity(format!(
                    "Account {} holds D:{} C:{} but its children sum to D:{} C:{}",
                    code,
                    account.current_debit_balance,
                    account.current_credit_balance,
                    debit,
                    credit
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn account(code: &str, debit: i64, credit: i64) -> Account {
        let mut a = Account::new(
            "acme".to_string(),
            code.to_string(),
            format!("Account {}", code),
            AccountType::Asset,
            None,
        );
        a.current_debit_balance = BigDecimal::from(debit);
        a.current_credit_balance = BigDecimal::from(credit);
        a
    }

    #[test]
    fn test_heuristic_parent_code() {
        assert_eq!(heuristic_parent_code("101"), Some("1"));
        assert_eq!(heuristic_parent_code("10101"), Some("101"));
        assert_eq!(heuristic_parent_code("101010101"), Some("1010101"));
        assert_eq!(heuristic_parent_code("1"), None);
        assert_eq!(heuristic_parent_code("10"), None);
    }

    #[test]
    fn test_level_for_code() {
        assert_eq!(level_for_code("1"), 1);
        assert_eq!(level_for_code("101"), 2);
        assert_eq!(level_for_code("10101"), 3);
        assert_eq!(level_for_code("101010101"), 5);
    }

    #[test]
    fn test_parent_sums_direct_children() {
        let mut tree = AccountTree::from_accounts(vec![
            account("1", 0, 0),
            account("101", 100, 0),
            account("102", 50, 0),
        ])
        .unwrap();

        let corrections = tree.aggregate_all();
        assert_eq!(corrections.len(), 1);

        let parent = tree.get("1").unwrap();
        assert_eq!(parent.current_debit_balance, BigDecimal::from(150));
        assert_eq!(parent.current_credit_balance, BigDecimal::from(0));
    }

    #[test]
    fn test_multi_level_bottom_up() {
        let mut tree = AccountTree::from_accounts(vec![
            account("1", 7, 7),
            account("101", 3, 3),
            account("10101", 40, 5),
            account("10102", 60, 0),
            account("102", 25, 0),
        ])
        .unwrap();

        tree.aggregate_all();
        assert_eq!(tree.get("101").unwrap().current_debit_balance, BigDecimal::from(100));
        assert_eq!(tree.get("101").unwrap().current_credit_balance, BigDecimal::from(5));
        assert_eq!(tree.get("1").unwrap().current_debit_balance, BigDecimal::from(125));
        assert_eq!(tree.get("1").unwrap().current_credit_balance, BigDecimal::from(5));
        assert!(tree.mismatches().is_empty());
    }

    #[test]
    fn test_explicit_parent_code_wins_over_heuristic() {
        let mut child = account("2001", 30, 0);
        child.parent_code = Some("1".to_string());
        let mut tree = AccountTree::from_accounts(vec![
            account("1", 0, 0),
            account("20", 0, 0),
            child,
        ])
        .unwrap();

        assert_eq!(tree.parent_of("2001"), Some("1"));
        assert!(tree.is_leaf("20"));
        tree.aggregate_all();
        assert_eq!(tree.get("1").unwrap().current_debit_balance, BigDecimal::from(30));
    }

    #[test]
    fn test_inactive_accounts_excluded() {
        let mut inactive = account("102", 500, 0);
        inactive.is_active = false;
        let mut tree = AccountTree::from_accounts(vec![
            account("1", 0, 0),
            account("101", 100, 0),
            inactive,
        ])
        .unwrap();

        tree.aggregate_all();
        assert_eq!(tree.get("1").unwrap().current_debit_balance, BigDecimal::from(100));
        assert_eq!(tree.children_of("1").len(), 1);
    }

    #[test]
    fn test_cycle_is_integrity_error() {
        let mut a = account("A1", 0, 0);
        a.parent_code = Some("B1".to_string());
        let mut b = account("B1", 0, 0);
        b.parent_code = Some("A1".to_string());
        let err = AccountTree::from_accounts(vec![a, b]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }

    #[test]
    fn test_ancestor_scope_leaves_other_branches_alone() {
        let mut tree = AccountTree::from_accounts(vec![
            account("1", 0, 0),
            account("101", 10, 0),
            account("2", 999, 0),
            account("201", 1, 0),
        ])
        .unwrap();

        tree.aggregate_ancestors_of(&["101".to_string()]);
        assert_eq!(tree.get("1").unwrap().current_debit_balance, BigDecimal::from(10));
        assert_eq!(tree.get("2").unwrap().current_debit_balance, BigDecimal::from(999));
        assert!(tree.ensure_consistent(&["1".to_string()]).is_ok());
        assert!(tree.ensure_consistent(&["2".to_string()]).is_err());
    }

    fn chart_strategy() -> impl Strategy<Value = Vec<(String, i64, i64)>> {
        // Codes over a fixed 1/3/5 digit chart with random leaf balances
        let codes = vec![
            "1", "101", "102", "10101", "10102", "10201", "2", "201", "20101", "20102",
        ];
        prop::collection::vec((0i64..10_000, 0i64..10_000), codes.len()).prop_map(move |amounts| {
            codes
                .iter()
                .zip(amounts)
                .map(|(code, (d, c))| (code.to_string(), d, c))
                .collect()
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_aggregation_is_consistent_and_idempotent(chart in chart_strategy()) {
            let accounts: Vec<Account> = chart
                .iter()
                .map(|(code, d, c)| account(code, *d, *c))
                .collect();
            let mut tree = AccountTree::from_accounts(accounts).unwrap();

            tree.aggregate_all();
            prop_assert!(tree.mismatches().is_empty());

            let second = tree.aggregate_all();
            prop_assert!(second.is_empty());

            let leaf_debits: BigDecimal = ["10101", "10102", "10201"]
                .iter()
                .map(|c| tree.get(c).unwrap().current_debit_balance.clone())
                .sum();
            prop_assert_eq!(&tree.get("1").unwrap().current_debit_balance, &leaf_debits);
        }
    }
}
