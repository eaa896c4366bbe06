//! CSV format handling
//!
//! Input rows share one header, `type,wallet,token,counterparty,counter_token,
//! amount,fee,toll`, and each operation type uses the columns it needs:
//!
//! ```text
//! deposit,1,AMB,,,100,,
//! withdraw,1,AMB,,,10,,
//! transfer,1,AMB,2,GEM,30,2,3     # toll wallet 3 collects the fee
//! transfer,1,AMB,2,,30,2,         # no toll wallet: the fee is burned
//! order,7,AMB,1,,2,,              # portfolio 7 buys 2 units of listing 1
//! ```
//!
//! Output is either fund balances (`wallet,token,balance`) or the transaction
//! journal.

use std::collections::HashMap;
use std::io::Write;
use std::str::FromStr;

use csv::Writer;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::types::{
    Fund, FundKey, LedgerError, LedgerOperation, Token, TokenId, Transaction, WalletId,
};

/// Raw CSV row before validation
#[derive(Debug, Deserialize)]
pub struct CsvRecord {
    #[serde(rename = "type")]
    pub op_type: String,
    pub wallet: u32,
    pub token: String,
    #[serde(default)]
    pub counterparty: Option<u32>,
    #[serde(default)]
    pub counter_token: Option<String>,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub fee: Option<String>,
    #[serde(default)]
    pub toll: Option<WalletId>,
}

/// Convert a raw CSV row into a ledger operation
///
/// # Returns
///
/// * `Ok(LedgerOperation)` if the row is well formed
/// * `Err(String)` naming what is wrong with the row
pub fn convert_csv_record(csv_record: CsvRecord) -> Result<LedgerOperation, String> {
    let op_type = csv_record.op_type.to_lowercase();
    let fund = FundKey::new(csv_record.wallet, csv_record.token.clone());

    match op_type.as_str() {
        "deposit" => Ok(LedgerOperation::Deposit {
            amount: required_decimal(csv_record.amount.as_deref(), "amount", &op_type)?,
            fund,
        }),
        "withdraw" | "withdrawal" => Ok(LedgerOperation::Withdraw {
            amount: required_decimal(csv_record.amount.as_deref(), "amount", &op_type)?,
            fund,
        }),
        "transfer" => {
            let counterparty = csv_record
                .counterparty
                .ok_or_else(|| "transfer requires a counterparty wallet".to_string())?;
            let counter_token = csv_record
                .counter_token
                .filter(|symbol| !symbol.is_empty())
                .unwrap_or(csv_record.token);
            let fee = match non_empty(csv_record.fee.as_deref()) {
                Some(raw) => parse_decimal(raw, "fee")?,
                None => Decimal::ZERO,
            };
            Ok(LedgerOperation::Transfer {
                amount: required_decimal(csv_record.amount.as_deref(), "amount", &op_type)?,
                from: fund,
                to: FundKey::new(counterparty, counter_token),
                fee,
                toll: csv_record.toll,
            })
        }
        "order" => {
            let listing = csv_record
                .counterparty
                .ok_or_else(|| "order requires a listing id".to_string())?;
            let raw = non_empty(csv_record.amount.as_deref())
                .ok_or_else(|| "order requires a quantity".to_string())?;
            let quantity = raw
                .parse::<u32>()
                .map_err(|e| format!("Invalid quantity '{}': {}", raw, e))?;
            Ok(LedgerOperation::Order {
                portfolio: csv_record.wallet,
                token: csv_record.token,
                listing,
                quantity,
            })
        }
        other => Err(format!("Invalid operation type: {}", other)),
    }
}

fn non_empty(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|s| !s.is_empty())
}

fn required_decimal(raw: Option<&str>, field: &str, op_type: &str) -> Result<Decimal, String> {
    let raw = non_empty(raw).ok_or_else(|| format!("{} requires an {}", op_type, field))?;
    parse_decimal(raw, field)
}

fn parse_decimal(raw: &str, field: &str) -> Result<Decimal, String> {
    Decimal::from_str(raw).map_err(|e| format!("Invalid {} '{}': {}", field, raw, e))
}

/// Write fund balances as CSV
///
/// Columns are `wallet,token,balance`. Rows are sorted by wallet, then token
/// symbol, and balances are printed with the token's full precision.
///
/// # Errors
///
/// Returns `TokenNotFound` if a fund refers to a token missing from `tokens`,
/// or the underlying write error.
pub fn write_funds_csv(
    funds: &[Fund],
    tokens: &[Token],
    output: &mut dyn Write,
) -> Result<(), LedgerError> {
    let tokens: HashMap<TokenId, &Token> = tokens.iter().map(|token| (token.id, token)).collect();

    let mut rows = Vec::with_capacity(funds.len());
    for fund in funds {
        let token = tokens
            .get(&fund.token_id)
            .ok_or_else(|| LedgerError::token_not_found(fund.token_id))?;
        rows.push((fund.wallet_id, token.symbol.as_str(), token.format_amount(fund.balance)));
    }
    rows.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    let mut writer = Writer::from_writer(output);
    writer.write_record(["wallet", "token", "balance"])?;
    for (wallet, symbol, balance) in rows {
        writer.write_record([wallet.to_string(), symbol.to_string(), balance])?;
    }
    writer.flush()?;
    Ok(())
}

/// Write the transaction journal as CSV, in id order
pub fn write_transactions_csv(
    transactions: &[Transaction],
    output: &mut dyn Write,
) -> Result<(), LedgerError> {
    let mut sorted: Vec<&Transaction> = transactions.iter().collect();
    sorted.sort_by_key(|tx| tx.id);

    let mut writer = Writer::from_writer(output);
    writer.write_record([
        "id",
        "type",
        "status",
        "from_fund",
        "to_fund",
        "toll_fund",
        "amount",
        "fee",
        "total_amount",
        "credited_amount",
        "failure",
    ])?;
    for tx in sorted {
        writer.write_record([
            tx.id.to_string(),
            tx.tx_type.as_str().to_string(),
            tx.status.as_str().to_string(),
            tx.from_fund_id.to_string(),
            tx.to_fund_id.to_string(),
            tx.toll_fund_id.map(|id| id.to_string()).unwrap_or_default(),
            tx.amount.to_string(),
            tx.fee.to_string(),
            tx.total_amount.to_string(),
            tx.credited_amount.to_string(),
            tx.failure
                .as_ref()
                .map(|reason| reason.as_str().to_string())
                .unwrap_or_default(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
