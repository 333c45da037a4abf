use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime};

pub mod export;

const DATE_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");

pub fn today() -> Date {
    OffsetDateTime::now_utc().date()
}

pub fn format_date(date: Date) -> String {
    date.format(&DATE_FORMAT).unwrap_or_else(|_| {
        format!(
            "{:04}-{:02}-{:02}",
            date.year(),
            u8::from(date.month()),
            date.day()
        )
    })
}

// ---------------------------------------------------------------------------
// Money
// ---------------------------------------------------------------------------

/// Half-up (midpoint away from zero) to 2 decimal places.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Line-item rule: `quantity * unit_price`, rounded half-up to cents.
/// Negative quantities and prices are allowed (credit/refund lines) and are
/// never clamped.
pub fn line_total(quantity: Decimal, unit_price: Decimal) -> Decimal {
    round_money(quantity * unit_price)
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid amount: {raw:?}")]
pub struct InvalidAmount {
    pub raw: String,
}

/// Boundary parsing of user-supplied numeric input.
pub fn parse_amount(raw: &str) -> Result<Decimal, InvalidAmount> {
    raw.trim().parse::<Decimal>().map_err(|_| InvalidAmount {
        raw: raw.to_string(),
    })
}

/// Applied wherever the settings table does not override `invoice.taxrate`.
pub fn default_tax_rate() -> Decimal {
    Decimal::new(10, 2)
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Draft,
    Pending,
    Paid,
    Overdue,
    Cancelled,
}

impl InvoiceStatus {
    /// Storage name, e.g. `DRAFT`.
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "DRAFT",
            InvoiceStatus::Pending => "PENDING",
            InvoiceStatus::Paid => "PAID",
            InvoiceStatus::Overdue => "OVERDUE",
            InvoiceStatus::Cancelled => "CANCELLED",
        }
    }

    /// Human-facing name, e.g. `Draft`. Used in exported sheets.
    pub fn display_name(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "Draft",
            InvoiceStatus::Pending => "Pending",
            InvoiceStatus::Paid => "Paid",
            InvoiceStatus::Overdue => "Overdue",
            InvoiceStatus::Cancelled => "Cancelled",
        }
    }

    pub fn from_name(name: &str) -> Option<InvoiceStatus> {
        match name {
            "DRAFT" => Some(InvoiceStatus::Draft),
            "PENDING" => Some(InvoiceStatus::Pending),
            "PAID" => Some(InvoiceStatus::Paid),
            "OVERDUE" => Some(InvoiceStatus::Overdue),
            "CANCELLED" => Some(InvoiceStatus::Cancelled),
            _ => None,
        }
    }
}

impl Default for InvoiceStatus {
    fn default() -> Self {
        InvoiceStatus::Draft
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceItem {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub invoice_id: i64,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    #[serde(default)]
    pub total: Decimal,
}

impl InvoiceItem {
    pub fn new(description: impl Into<String>, quantity: Decimal, unit_price: Decimal) -> Self {
        Self {
            id: 0,
            invoice_id: 0,
            description: description.into(),
            quantity,
            unit_price,
            total: line_total(quantity, unit_price),
        }
    }

    /// Re-derive `total` from the current quantity and unit price. The store
    /// runs this on every item before persisting; caller-supplied totals are
    /// never trusted.
    pub fn recalculate_total(&mut self) {
        self.total = line_total(self.quantity, self.unit_price);
    }
}

impl Default for InvoiceItem {
    fn default() -> Self {
        Self {
            id: 0,
            invoice_id: 0,
            description: String::new(),
            quantity: Decimal::ONE,
            unit_price: Decimal::ZERO,
            total: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    /// 0 until first save; assigned by the store, immutable afterwards.
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub invoice_number: String,
    pub customer_name: String,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_address: Option<String>,
    pub invoice_date: Date,
    pub due_date: Date,
    #[serde(default)]
    pub status: InvoiceStatus,
    #[serde(default)]
    pub subtotal: Decimal,
    #[serde(default)]
    pub tax: Decimal,
    #[serde(default)]
    pub total: Decimal,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub items: Vec<InvoiceItem>,
}

impl Invoice {
    /// Transient draft: dated today, due in 30 days, zero totals, no items.
    pub fn new() -> Self {
        let today = today();
        Self {
            id: 0,
            invoice_number: String::new(),
            customer_name: String::new(),
            customer_email: None,
            customer_address: None,
            invoice_date: today,
            due_date: today.checked_add(Duration::days(30)).unwrap_or(today),
            status: InvoiceStatus::Draft,
            subtotal: Decimal::ZERO,
            tax: Decimal::ZERO,
            total: Decimal::ZERO,
            notes: None,
            items: Vec::new(),
        }
    }

    /// Recompute subtotal/tax/total from the current item totals. On demand,
    /// not automatic on item mutation.
    pub fn calculate_totals(&mut self, tax_rate: Decimal) {
        self.subtotal = self.items.iter().map(|item| item.total).sum();
        self.tax = round_money(self.subtotal * tax_rate);
        self.total = self.subtotal + self.tax;
    }
}

impl Default for Invoice {
    fn default() -> Self {
        Invoice::new()
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Read interface the exporter (and the shell) consumes. How settings are
/// edited or where they live is not its concern.
pub trait SettingsProvider {
    fn get_property(&self, key: &str, default: &str) -> String;
}

const DEFAULT_SETTINGS: &[(&str, &str)] = &[
    ("company.name", "Your Company Name"),
    ("company.address", "123 Main St, City, State 12345"),
    ("company.taxid", ""),
    ("invoice.taxrate", "10"),
    ("invoice.currency", "$"),
    ("app.theme", "light"),
];

/// Point-in-time copy of the `settings` table. Cheap to clone and hand to a
/// background task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    values: HashMap<String, String>,
}

impl SettingsSnapshot {
    pub fn from_values(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    /// `invoice.taxrate` is stored as a percentage ("10" => 0.10).
    pub fn tax_rate(&self) -> Decimal {
        let raw = self.get_property("invoice.taxrate", "10");
        match raw.trim().parse::<Decimal>() {
            Ok(percent) => percent / Decimal::from(100),
            Err(_) => default_tax_rate(),
        }
    }

    pub fn currency_symbol(&self) -> String {
        self.get_property("invoice.currency", "$")
    }
}

impl SettingsProvider for SettingsSnapshot {
    fn get_property(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing database cannot be opened or created. Fatal at startup.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// Any other storage failure. Surfaced uninterpreted; never retried here.
    #[error("storage error: {0}")]
    Storage(String),
    /// Structurally invalid input the store refuses to persist.
    #[error("{0}")]
    Validation(String),
}

fn sqlite_error_string(err: &rusqlite::Error) -> String {
    match err {
        rusqlite::Error::SqliteFailure(code, msg) => {
            let message = msg.clone().unwrap_or_else(|| "".to_string());
            format!(
                "sqlite(code={:?}, extended_code={}, msg={})",
                code.code, code.extended_code, message
            )
        }
        other => other.to_string(),
    }
}

fn configure_sqlite(conn: &Connection) -> Result<(), rusqlite::Error> {
    // Apply PRAGMAs on init (outside any transaction).
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA foreign_keys = ON;\n\
         PRAGMA temp_store = MEMORY;\n\
         PRAGMA busy_timeout = 5000;\n",
    )?;
    conn.busy_timeout(StdDuration::from_millis(5000))?;
    Ok(())
}

fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    // Money and quantity columns are TEXT holding exact decimal strings, so
    // values survive any number of load/save cycles without drift.
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS invoices (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            invoice_number TEXT UNIQUE NOT NULL,
            customer_name TEXT NOT NULL,
            customer_email TEXT,
            customer_address TEXT,
            invoice_date TEXT NOT NULL,
            due_date TEXT NOT NULL,
            status TEXT NOT NULL,
            subtotal TEXT NOT NULL,
            tax TEXT NOT NULL,
            total TEXT NOT NULL,
            notes TEXT,
            created_at TEXT DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS invoice_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            invoice_id INTEGER NOT NULL REFERENCES invoices(id) ON DELETE CASCADE,
            description TEXT NOT NULL,
            quantity TEXT NOT NULL,
            unit_price TEXT NOT NULL,
            total TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY NOT NULL,
            value TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_invoice_items_invoice_id ON invoice_items(invoice_id);
        CREATE INDEX IF NOT EXISTS idx_invoices_invoice_date ON invoices(invoice_date);
        "#,
    )?;
    Ok(())
}

fn ensure_default_settings(conn: &Connection) -> Result<(), rusqlite::Error> {
    for (key, value) in DEFAULT_SETTINGS {
        conn.execute(
            "INSERT OR IGNORE INTO settings(key, value) VALUES(?1, ?2)",
            params![key, value],
        )?;
    }
    Ok(())
}

fn format_invoice_number(year: i32, sequence: i64) -> String {
    format!("INV-{}-{:04}", year, sequence)
}

/// Numeric sequence of the final dash-delimited segment ("INV-2025-0041" =>
/// 41). Falls back to all digits when the suffix carries none.
fn sequence_suffix(number: &str) -> Option<i64> {
    let tail = number.rsplit('-').next().unwrap_or(number);
    let digits: String = tail.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        let all: String = number.chars().filter(|c| c.is_ascii_digit()).collect();
        return all.parse().ok();
    }
    digits.parse().ok()
}

/// Next suggested number, derived from the most recently inserted row (by
/// rowid, not invoice date). Not a per-year counter; save-time substitution
/// resolves any collision this produces.
fn next_invoice_number(conn: &Connection) -> Result<String, rusqlite::Error> {
    let last: Option<String> = conn
        .query_row(
            "SELECT invoice_number FROM invoices ORDER BY id DESC LIMIT 1",
            [],
            |r| r.get(0),
        )
        .optional()?;

    let sequence = last
        .as_deref()
        .and_then(sequence_suffix)
        .map(|n| n + 1)
        .unwrap_or(1);
    Ok(format_invoice_number(today().year(), sequence))
}

fn invoice_number_exists(conn: &Connection, number: &str) -> Result<bool, rusqlite::Error> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT id FROM invoices WHERE invoice_number = ?1",
            params![number],
            |r| r.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

fn decimal_col(row: &rusqlite::Row<'_>, idx: usize) -> Result<Decimal, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    raw.trim().parse::<Decimal>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::from(format!("bad decimal {:?}: {}", raw, e)),
        )
    })
}

fn date_col(row: &rusqlite::Row<'_>, idx: usize) -> Result<Date, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    Date::parse(raw.trim(), &DATE_FORMAT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::from(format!("bad date {:?}: {}", raw, e)),
        )
    })
}

fn status_col(row: &rusqlite::Row<'_>, idx: usize) -> Result<InvoiceStatus, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    InvoiceStatus::from_name(raw.trim()).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::from(format!("unknown invoice status {:?}", raw)),
        )
    })
}

const INVOICE_COLUMNS: &str = "id, invoice_number, customer_name, customer_email, \
     customer_address, invoice_date, due_date, status, subtotal, tax, total, notes";

fn map_invoice_row(row: &rusqlite::Row<'_>) -> Result<Invoice, rusqlite::Error> {
    Ok(Invoice {
        id: row.get(0)?,
        invoice_number: row.get(1)?,
        customer_name: row.get(2)?,
        customer_email: row.get(3)?,
        customer_address: row.get(4)?,
        invoice_date: date_col(row, 5)?,
        due_date: date_col(row, 6)?,
        status: status_col(row, 7)?,
        subtotal: decimal_col(row, 8)?,
        tax: decimal_col(row, 9)?,
        total: decimal_col(row, 10)?,
        notes: row.get(11)?,
        items: Vec::new(),
    })
}

fn load_items(conn: &Connection, invoice_id: i64) -> Result<Vec<InvoiceItem>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, invoice_id, description, quantity, unit_price, total \
         FROM invoice_items WHERE invoice_id = ?1 ORDER BY id",
    )?;
    let mut rows = stmt.query(params![invoice_id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(InvoiceItem {
            id: row.get(0)?,
            invoice_id: row.get(1)?,
            description: row.get(2)?,
            quantity: decimal_col(row, 3)?,
            unit_price: decimal_col(row, 4)?,
            total: decimal_col(row, 5)?,
        });
    }
    Ok(out)
}

fn insert_items(
    tx: &rusqlite::Transaction<'_>,
    invoice_id: i64,
    items: &mut [InvoiceItem],
) -> Result<(), rusqlite::Error> {
    for item in items.iter_mut() {
        tx.execute(
            "INSERT INTO invoice_items (invoice_id, description, quantity, unit_price, total) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                invoice_id,
                item.description,
                item.quantity.to_string(),
                item.unit_price.to_string(),
                item.total.to_string(),
            ],
        )?;
        item.id = tx.last_insert_rowid();
        item.invoice_id = invoice_id;
    }
    Ok(())
}

/// Durable record of invoices and their items, plus the `settings` key/value
/// table. One open connection per process; construct once at startup and pass
/// by handle. Every operation hops to a blocking thread so callers on a
/// UI-responsiveness-critical task never block on file I/O.
#[derive(Clone)]
pub struct InvoiceStore {
    conn: Arc<Mutex<Connection>>,
    write_lock: Arc<Mutex<()>>,
}

impl InvoiceStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            }
        }
        let conn = Connection::open(path).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        configure_sqlite(&conn).map_err(|e| StoreError::Unavailable(sqlite_error_string(&e)))?;
        init_schema(&conn).map_err(|e| StoreError::Unavailable(sqlite_error_string(&e)))?;
        ensure_default_settings(&conn)
            .map_err(|e| StoreError::Unavailable(sqlite_error_string(&e)))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    async fn with_read<T, F>(&self, op_name: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Storage("db mutex poisoned".to_string()))?;
            f(&guard).map_err(|e| {
                let msg = sqlite_error_string(&e);
                eprintln!("[sqlite] {{ op: {:?}, error: {:?} }}", op_name, msg);
                StoreError::Storage(msg)
            })
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?
    }

    async fn with_write<T, F>(&self, op_name: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = self.conn.clone();
        let write_lock = self.write_lock.clone();
        tokio::task::spawn_blocking(move || {
            let _wg = write_lock
                .lock()
                .map_err(|_| StoreError::Storage("write mutex poisoned".to_string()))?;
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Storage("db mutex poisoned".to_string()))?;
            f(&mut guard).map_err(|e| {
                let msg = sqlite_error_string(&e);
                eprintln!("[sqlite] {{ op: {:?}, error: {:?} }}", op_name, msg);
                StoreError::Storage(msg)
            })
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?
    }

    /// Insert (`id == 0`) or update-in-place. Item totals are recomputed
    /// before anything is written. On insert, a blank invoice number is
    /// generated and a colliding one is silently replaced with a fresh unique
    /// one; duplicates never fail the save. On update, the item set is fully
    /// replaced (delete then re-insert) inside the same transaction, so
    /// readers never see a half-replaced set. Returns the persisted invoice
    /// with all ids assigned.
    pub async fn save(&self, mut invoice: Invoice) -> Result<Invoice, StoreError> {
        if invoice.customer_name.trim().is_empty() {
            return Err(StoreError::Validation(
                "customer name is required".to_string(),
            ));
        }

        self.with_write("save_invoice", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            for item in invoice.items.iter_mut() {
                item.recalculate_total();
            }

            if invoice.id == 0 {
                if invoice.invoice_number.trim().is_empty() {
                    invoice.invoice_number = next_invoice_number(&tx)?;
                } else if invoice_number_exists(&tx, &invoice.invoice_number)? {
                    // Substitute, never error. Bump the sequence until free so
                    // the loop always terminates.
                    let mut candidate = next_invoice_number(&tx)?;
                    while invoice_number_exists(&tx, &candidate)? {
                        let next = sequence_suffix(&candidate).unwrap_or(0) + 1;
                        candidate = format_invoice_number(today().year(), next);
                    }
                    invoice.invoice_number = candidate;
                }

                tx.execute(
                    "INSERT INTO invoices (invoice_number, customer_name, customer_email, \
                     customer_address, invoice_date, due_date, status, subtotal, tax, total, notes) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        invoice.invoice_number,
                        invoice.customer_name,
                        invoice.customer_email,
                        invoice.customer_address,
                        format_date(invoice.invoice_date),
                        format_date(invoice.due_date),
                        invoice.status.as_str(),
                        invoice.subtotal.to_string(),
                        invoice.tax.to_string(),
                        invoice.total.to_string(),
                        invoice.notes,
                    ],
                )?;
                invoice.id = tx.last_insert_rowid();
                insert_items(&tx, invoice.id, &mut invoice.items)?;
            } else {
                tx.execute(
                    "UPDATE invoices SET invoice_number=?2, customer_name=?3, customer_email=?4, \
                     customer_address=?5, invoice_date=?6, due_date=?7, status=?8, subtotal=?9, \
                     tax=?10, total=?11, notes=?12 WHERE id=?1",
                    params![
                        invoice.id,
                        invoice.invoice_number,
                        invoice.customer_name,
                        invoice.customer_email,
                        invoice.customer_address,
                        format_date(invoice.invoice_date),
                        format_date(invoice.due_date),
                        invoice.status.as_str(),
                        invoice.subtotal.to_string(),
                        invoice.tax.to_string(),
                        invoice.total.to_string(),
                        invoice.notes,
                    ],
                )?;
                tx.execute(
                    "DELETE FROM invoice_items WHERE invoice_id = ?1",
                    params![invoice.id],
                )?;
                insert_items(&tx, invoice.id, &mut invoice.items)?;
            }

            tx.commit()?;
            Ok(invoice)
        })
        .await
    }

    /// Items are always eagerly attached, ordered by ascending item id.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<Invoice>, StoreError> {
        self.with_read("get_invoice_by_id", move |conn| {
            let invoice = conn
                .query_row(
                    &format!("SELECT {} FROM invoices WHERE id = ?1", INVOICE_COLUMNS),
                    params![id],
                    map_invoice_row,
                )
                .optional()?;
            match invoice {
                Some(mut inv) => {
                    inv.items = load_items(conn, inv.id)?;
                    Ok(Some(inv))
                }
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn get_by_number(&self, number: String) -> Result<Option<Invoice>, StoreError> {
        self.with_read("get_invoice_by_number", move |conn| {
            let invoice = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM invoices WHERE invoice_number = ?1",
                        INVOICE_COLUMNS
                    ),
                    params![number],
                    map_invoice_row,
                )
                .optional()?;
            match invoice {
                Some(mut inv) => {
                    inv.items = load_items(conn, inv.id)?;
                    Ok(Some(inv))
                }
                None => Ok(None),
            }
        })
        .await
    }

    /// Canonical listing: most recent invoice date first, items attached.
    pub async fn get_all(&self) -> Result<Vec<Invoice>, StoreError> {
        self.with_read("get_all_invoices", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM invoices ORDER BY invoice_date DESC",
                INVOICE_COLUMNS
            ))?;
            let mut rows = stmt.query([])?;
            let mut out: Vec<Invoice> = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(map_invoice_row(row)?);
            }
            for invoice in out.iter_mut() {
                invoice.items = load_items(conn, invoice.id)?;
            }
            Ok(out)
        })
        .await
    }

    /// Items go with the invoice via ON DELETE CASCADE.
    pub async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        self.with_write("delete_invoice", move |conn| {
            let affected = conn.execute("DELETE FROM invoices WHERE id = ?1", params![id])?;
            Ok(affected > 0)
        })
        .await
    }

    pub async fn generate_invoice_number(&self) -> Result<String, StoreError> {
        self.with_read("generate_invoice_number", next_invoice_number)
            .await
    }

    pub async fn load_settings(&self) -> Result<SettingsSnapshot, StoreError> {
        self.with_read("load_settings", |conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
            let mut rows = stmt.query([])?;
            let mut values: HashMap<String, String> = HashMap::new();
            while let Some(row) = rows.next()? {
                let key: String = row.get(0)?;
                let value: Option<String> = row.get(1)?;
                values.insert(key, value.unwrap_or_default());
            }
            Ok(SettingsSnapshot::from_values(values))
        })
        .await
    }

    pub async fn get_property(&self, key: String, default: String) -> Result<String, StoreError> {
        self.with_read("get_property", move |conn| {
            let value: Option<Option<String>> = conn
                .query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    params![key],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(value.flatten().unwrap_or(default))
        })
        .await
    }

    pub async fn set_property(&self, key: String, value: String) -> Result<(), StoreError> {
        self.with_write("set_property", move |conn| {
            conn.execute(
                "INSERT INTO settings(key, value) VALUES(?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }
}
