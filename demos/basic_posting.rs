//! Basic posting example: chart of accounts, numbering, posting and reversal

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use journal_ledger::telemetry::init_tracing;
use journal_ledger::{patterns, AccountType, JournalEntryBuilder, Ledger, MemoryStorage, NewAccount};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(false);
    println!("🧾 Journal Ledger - Basic Posting Example\n");

    let ledger = Ledger::new(MemoryStorage::new());
    let company = "acme";

    // 1. Chart of accounts
    println!("📊 Setting up Chart of Accounts...");
    for account in ledger.setup_standard_chart_of_accounts(company).await? {
        println!(
            "  ✓ {:<6} level {} {} ({:?})",
            account.code, account.level, account.name, account.account_type
        );
    }
    let equipment = ledger
        .create_account(
            company,
            NewAccount::new("10104", "Office Equipment", AccountType::Asset),
        )
        .await?;
    println!("  ✓ {:<6} added under {:?}\n", equipment.code, equipment.parent_code);

    // 2. Document types
    let ci = ledger
        .create_document_type(company, "CI", "Comprobante de ingreso", None)
        .await?;
    let ce = ledger
        .create_document_type(company, "CE", "Comprobante de egreso", None)
        .await?;

    // 3. Post some entries
    println!("💰 Posting Journal Entries...\n");
    let number = ledger.allocate_number(company, ci.id, None).await?;
    let sale = patterns::cash_sale(
        company,
        &number.number,
        NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
        "Opening sale",
        "10101",
        "401",
        BigDecimal::from(50000),
    )?;
    let sale = ledger.create_journal_entry(sale).await?;
    ledger.post_journal_entry(sale.id).await?;
    println!("  ✓ Posted {}: cash sale of 50,000", sale.entry_number);

    let number = ledger.allocate_number(company, ce.id, None).await?;
    let purchase = JournalEntryBuilder::new(
        company,
        &number.number,
        NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
        "Office equipment and supplies",
    )
    .debit("10104", BigDecimal::from(12000), "Laptop")
    .debit("50102", BigDecimal::from(800), "Paper and toner")
    .credit("10102", BigDecimal::from(12800), "Bank transfer")
    .build()?;
    let purchase = ledger.create_journal_entry(purchase).await?;
    ledger.post_journal_entry(purchase.id).await?;
    println!("  ✓ Posted {}: equipment purchase of 12,800", purchase.entry_number);

    let number = ledger.allocate_number(company, ce.id, None).await?;
    let rent = patterns::expense_payment(
        company,
        &number.number,
        NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        "January rent",
        "50101",
        "10101",
        BigDecimal::from(3000),
    )?;
    let rent = ledger.create_journal_entry(rent).await?;
    ledger.post_journal_entry(rent.id).await?;
    println!("  ✓ Posted {}: rent of 3,000", rent.entry_number);

    // 4. Reverse the rent and show the numbering reuse
    let reversal = ledger
        .reverse_journal_entry(rent.id, None, Some("demo".to_string()))
        .await?;
    println!(
        "  ↩ Reversed {} with {}\n",
        rent.entry_number, reversal.entry_number
    );

    let spare = ledger.allocate_number(company, ce.id, None).await?;
    if let Some(reservation_id) = spare.reservation_id {
        ledger.cancel_reservation(reservation_id).await?;
    }
    let next = ledger.peek_next_number(ce.id).await?;
    println!("🔢 Cancelled {}, next CE number is {}\n", spare.number, next.number);

    // 5. Balances
    println!("📈 Account Balances:");
    for account in ledger.list_accounts(company).await? {
        println!(
            "  {:indent$}{:<6} {:<22} D:{:>8} C:{:>8}",
            "",
            account.code,
            account.name,
            account.current_debit_balance,
            account.current_credit_balance,
            indent = (account.level as usize - 1) * 2
        );
    }

    let cash = ledger.account_ledger(company, "10101", None, None).await?;
    println!("\n💵 Cash ledger ({} movements):", cash.entry_count());
    for entry in &cash.entries {
        println!(
            "  {} {:<32} D:{:>8} C:{:>8} running D:{} C:{}",
            entry.date,
            entry.description,
            entry.debit_amount,
            entry.credit_amount,
            entry.running_debit_balance,
            entry.running_credit_balance
        );
    }

    let report = ledger.ensure_integrity(company).await?;
    println!(
        "\n✅ Integrity OK: leaf debits {} = leaf credits {}",
        report.leaf_debit_total, report.leaf_credit_total
    );

    Ok(())
}
