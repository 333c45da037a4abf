use std::collections::HashSet;
use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_xlsxwriter::{Color, Format, FormatBorder, Workbook, Worksheet, XlsxError};
use thiserror::Error;

use crate::{format_date, Invoice, SettingsProvider, SettingsSnapshot};

#[derive(Debug, Error)]
pub enum ExportError {
    /// Caller-level precondition; re-validated here so the exporter fails
    /// fast instead of writing an empty workbook.
    #[error("no invoices to export")]
    NoInvoices,
    #[error("workbook error: {0}")]
    Workbook(String),
    #[error("failed to write workbook to {path}: {detail}")]
    Write { path: String, detail: String },
}

/// Sink for export notifications, implemented by the shell. Per run: one
/// `on_progress` per invoice with strictly increasing `current`, then exactly
/// one terminal call (`on_complete` or `on_error`, never both). Notifications
/// arrive from a blocking worker, so implementations forward to their own
/// UI context.
pub trait ExportProgressListener: Send + Sync {
    fn on_progress(&self, _current: usize, _total: usize, _message: &str) {}
    fn on_complete(&self, _file_path: &str) {}
    fn on_error(&self, _error: &ExportError) {}
}

/// Render one workbook with one worksheet per invoice and write it to
/// `file_path` in a single shot. Invoices are expected fully loaded; the
/// store is never consulted.
pub fn export_invoices(
    invoices: &[Invoice],
    file_path: &str,
    settings: &dyn SettingsProvider,
    listener: Option<&dyn ExportProgressListener>,
) -> Result<(), ExportError> {
    match build_and_write(invoices, file_path, settings, listener) {
        Ok(()) => {
            if let Some(listener) = listener {
                listener.on_complete(file_path);
            }
            Ok(())
        }
        Err(e) => {
            if let Some(listener) = listener {
                listener.on_error(&e);
            }
            Err(e)
        }
    }
}

/// Background entry point: the workbook build and the final file write run on
/// a blocking thread; progress and the terminal notification go through the
/// listener.
pub async fn export_invoices_background(
    invoices: Vec<Invoice>,
    file_path: String,
    settings: SettingsSnapshot,
    listener: Arc<dyn ExportProgressListener>,
) -> Result<(), ExportError> {
    let task_listener = listener.clone();
    let joined = tokio::task::spawn_blocking(move || {
        export_invoices(&invoices, &file_path, &settings, Some(task_listener.as_ref()))
    })
    .await;
    match joined {
        Ok(outcome) => outcome,
        // A panicked worker never reached a terminal callback; report the
        // failure so the listener still sees exactly one.
        Err(e) => {
            let err = ExportError::Workbook(e.to_string());
            listener.on_error(&err);
            Err(err)
        }
    }
}

fn build_and_write(
    invoices: &[Invoice],
    file_path: &str,
    settings: &dyn SettingsProvider,
    listener: Option<&dyn ExportProgressListener>,
) -> Result<(), ExportError> {
    if invoices.is_empty() {
        return Err(ExportError::NoInvoices);
    }

    let mut workbook = Workbook::new();
    let styles = SheetStyles::new(settings);
    let mut used_names: HashSet<String> = HashSet::new();
    let total = invoices.len();

    for (index, invoice) in invoices.iter().enumerate() {
        let name = unique_sheet_name(&invoice.invoice_number, index + 1, &used_names);
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(&name).map_err(wb_err)?;
        write_invoice_sheet(worksheet, invoice, settings, &styles)?;
        used_names.insert(name);

        if let Some(listener) = listener {
            let current = index + 1;
            listener.on_progress(
                current,
                total,
                &format!(
                    "Processing invoice {} of {} ({})",
                    current, total, invoice.invoice_number
                ),
            );
        }
    }

    workbook.save(file_path).map_err(|e| ExportError::Write {
        path: file_path.to_string(),
        detail: e.to_string(),
    })?;
    Ok(())
}

/// Worksheet names cannot contain `/ \ ? * [ ]` and are capped at 31 chars.
fn sanitize_sheet_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | '?' | '*' | '[' | ']' => '-',
            other => other,
        })
        .take(31)
        .collect()
}

/// On a name collision within one export run, retry with the invoice's
/// 1-based position appended before sanitizing again. The retry truncates
/// too, so numbers longer than 31 chars can still collide; `set_name`
/// rejects that and the export fails.
fn unique_sheet_name(invoice_number: &str, position: usize, used: &HashSet<String>) -> String {
    let name = sanitize_sheet_name(invoice_number);
    if used.contains(&name) {
        return sanitize_sheet_name(&format!("{}_{}", invoice_number, position));
    }
    name
}

struct SheetStyles {
    header: Format,
    bold: Format,
    currency: Format,
    table_header: Format,
    table_cell: Format,
    total: Format,
}

impl SheetStyles {
    fn new(settings: &dyn SettingsProvider) -> Self {
        let symbol = settings.get_property("invoice.currency", "$");
        let money_format = format!("{}#,##0.00", symbol);
        Self {
            header: Format::new().set_bold().set_font_size(18),
            bold: Format::new().set_bold(),
            currency: Format::new().set_num_format(&money_format),
            table_header: Format::new()
                .set_bold()
                .set_background_color(Color::Silver)
                .set_border(FormatBorder::Thin),
            table_cell: Format::new().set_border(FormatBorder::Thin),
            total: Format::new()
                .set_bold()
                .set_font_size(13)
                .set_num_format(&money_format),
        }
    }
}

fn wb_err(e: XlsxError) -> ExportError {
    ExportError::Workbook(e.to_string())
}

fn as_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

fn label_value(
    worksheet: &mut Worksheet,
    row: u32,
    label: &str,
    value: &str,
    style: Option<&Format>,
) -> Result<(), ExportError> {
    match style {
        Some(format) => worksheet
            .write_string_with_format(row, 0, label, format)
            .map_err(wb_err)?,
        None => worksheet.write_string(row, 0, label).map_err(wb_err)?,
    };
    worksheet.write_string(row, 1, value).map_err(wb_err)?;
    Ok(())
}

fn total_row(
    worksheet: &mut Worksheet,
    row: u32,
    label: &str,
    amount: Decimal,
    label_style: &Format,
    amount_style: &Format,
) -> Result<(), ExportError> {
    worksheet
        .write_string_with_format(row, 3, label, label_style)
        .map_err(wb_err)?;
    worksheet
        .write_number_with_format(row, 4, as_f64(amount), amount_style)
        .map_err(wb_err)?;
    Ok(())
}

fn write_invoice_sheet(
    worksheet: &mut Worksheet,
    invoice: &Invoice,
    settings: &dyn SettingsProvider,
    styles: &SheetStyles,
) -> Result<(), ExportError> {
    let mut row: u32 = 0;

    worksheet
        .write_string_with_format(row, 0, "INVOICE", &styles.header)
        .map_err(wb_err)?;
    row += 2;

    label_value(
        worksheet,
        row,
        "Invoice #:",
        &invoice.invoice_number,
        Some(&styles.bold),
    )?;
    row += 1;
    label_value(
        worksheet,
        row,
        "Date:",
        &format_date(invoice.invoice_date),
        Some(&styles.bold),
    )?;
    row += 1;
    label_value(
        worksheet,
        row,
        "Due Date:",
        &format_date(invoice.due_date),
        Some(&styles.bold),
    )?;
    row += 1;
    label_value(
        worksheet,
        row,
        "Status:",
        invoice.status.display_name(),
        Some(&styles.bold),
    )?;
    row += 2;

    let company_name = settings.get_property("company.name", "Your Company");
    let company_address = settings.get_property("company.address", "");
    label_value(worksheet, row, "From:", &company_name, Some(&styles.bold))?;
    row += 1;
    label_value(worksheet, row, "", &company_address, None)?;
    row += 2;

    label_value(
        worksheet,
        row,
        "To:",
        &invoice.customer_name,
        Some(&styles.bold),
    )?;
    row += 1;
    if let Some(email) = invoice.customer_email.as_deref().filter(|s| !s.is_empty()) {
        label_value(worksheet, row, "", email, None)?;
        row += 1;
    }
    if let Some(address) = invoice
        .customer_address
        .as_deref()
        .filter(|s| !s.is_empty())
    {
        label_value(worksheet, row, "", address, None)?;
        row += 1;
    }
    row += 1;

    for (col, header) in ["#", "Description", "Quantity", "Unit Price", "Total"]
        .iter()
        .enumerate()
    {
        worksheet
            .write_string_with_format(row, col as u16, *header, &styles.table_header)
            .map_err(wb_err)?;
    }
    row += 1;

    // 1-based sequential numbering, independent of stored item ids.
    for (item_index, item) in invoice.items.iter().enumerate() {
        worksheet
            .write_number_with_format(row, 0, (item_index + 1) as f64, &styles.table_cell)
            .map_err(wb_err)?;
        worksheet
            .write_string_with_format(row, 1, &item.description, &styles.table_cell)
            .map_err(wb_err)?;
        worksheet
            .write_number_with_format(row, 2, as_f64(item.quantity), &styles.table_cell)
            .map_err(wb_err)?;
        worksheet
            .write_number_with_format(row, 3, as_f64(item.unit_price), &styles.currency)
            .map_err(wb_err)?;
        worksheet
            .write_number_with_format(row, 4, as_f64(item.total), &styles.currency)
            .map_err(wb_err)?;
        row += 1;
    }
    row += 1;

    total_row(
        worksheet,
        row,
        "Subtotal:",
        invoice.subtotal,
        &styles.bold,
        &styles.currency,
    )?;
    row += 1;
    total_row(
        worksheet,
        row,
        "Tax:",
        invoice.tax,
        &styles.bold,
        &styles.currency,
    )?;
    row += 1;
    total_row(
        worksheet,
        row,
        "TOTAL:",
        invoice.total,
        &styles.total,
        &styles.total,
    )?;
    row += 2;

    if let Some(notes) = invoice.notes.as_deref().filter(|s| !s.is_empty()) {
        label_value(worksheet, row, "Notes:", notes, Some(&styles.bold))?;
    }

    worksheet.set_column_width(0, 8).map_err(wb_err)?;
    worksheet.set_column_width(1, 31).map_err(wb_err)?;
    worksheet.set_column_width(2, 12).map_err(wb_err)?;
    worksheet.set_column_width(3, 14).map_err(wb_err)?;
    worksheet.set_column_width(4, 14).map_err(wb_err)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{default_tax_rate, InvoiceItem};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingListener {
        progress: Mutex<Vec<(usize, usize, String)>>,
        completed: Mutex<Vec<String>>,
        errors: Mutex<Vec<String>>,
    }

    impl ExportProgressListener for RecordingListener {
        fn on_progress(&self, current: usize, total: usize, message: &str) {
            self.progress
                .lock()
                .unwrap()
                .push((current, total, message.to_string()));
        }

        fn on_complete(&self, file_path: &str) {
            self.completed.lock().unwrap().push(file_path.to_string());
        }

        fn on_error(&self, error: &ExportError) {
            self.errors.lock().unwrap().push(error.to_string());
        }
    }

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn invoice(number: &str, customer: &str) -> Invoice {
        let mut invoice = Invoice::new();
        invoice.invoice_number = number.to_string();
        invoice.customer_name = customer.to_string();
        invoice.items = vec![
            InvoiceItem::new("Widgets", dec("3"), dec("19.995")),
            InvoiceItem::new("Shipping", dec("1"), dec("9.90")),
        ];
        invoice.calculate_totals(default_tax_rate());
        invoice
    }

    #[test]
    fn sanitize_replaces_forbidden_chars_and_truncates() {
        assert_eq!(sanitize_sheet_name("INV/2025\\00?1*[]"), "INV-2025-00-1---");
        let long = "INV-2025-0001-SOME-VERY-LONG-CUSTOMER-SUFFIX";
        assert_eq!(sanitize_sheet_name(long).chars().count(), 31);
    }

    #[test]
    fn colliding_sheet_name_gets_positional_suffix() {
        let mut used = HashSet::new();
        assert_eq!(unique_sheet_name("INV-2025-0001", 1, &used), "INV-2025-0001");
        used.insert("INV-2025-0001".to_string());
        assert_eq!(
            unique_sheet_name("INV-2025-0001", 2, &used),
            "INV-2025-0001_2"
        );
    }

    #[test]
    fn truncated_retry_keeps_the_31_char_prefix() {
        let long = "INV-2025-0001-SOME-VERY-LONG-CUSTOMER-SUFFIX";
        let first = sanitize_sheet_name(long);
        let mut used = HashSet::new();
        used.insert(first.clone());
        // Positional suffix lands past the cap, so the retry name is the
        // same truncated string.
        assert_eq!(unique_sheet_name(long, 2, &used), first);
    }

    #[test]
    fn export_reports_ordered_progress_then_one_completion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("invoices.xlsx");
        let path = path.to_str().unwrap();

        let invoices = vec![
            invoice("INV-2025-0001", "Acme"),
            invoice("INV-2025-0002", "Globex"),
            invoice("INV-2025-0003", "Initech"),
        ];
        let listener = RecordingListener::default();

        export_invoices(
            &invoices,
            path,
            &SettingsSnapshot::default(),
            Some(&listener),
        )
        .unwrap();

        let progress = listener.progress.lock().unwrap();
        let counts: Vec<usize> = progress.iter().map(|(c, _, _)| *c).collect();
        assert_eq!(counts, vec![1, 2, 3]);
        assert!(progress.iter().all(|(_, t, _)| *t == 3));
        assert_eq!(
            progress[0].2,
            "Processing invoice 1 of 3 (INV-2025-0001)"
        );
        drop(progress);

        assert_eq!(listener.completed.lock().unwrap().as_slice(), [path]);
        assert!(listener.errors.lock().unwrap().is_empty());
        assert!(std::fs::metadata(path).unwrap().len() > 0);
    }

    #[test]
    fn duplicate_invoice_numbers_still_yield_one_sheet_each() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dupes.xlsx");

        let invoices = vec![
            invoice("INV-2025-0001", "Acme"),
            invoice("INV-2025-0001", "Globex"),
        ];
        let listener = RecordingListener::default();

        export_invoices(
            &invoices,
            path.to_str().unwrap(),
            &SettingsSnapshot::default(),
            Some(&listener),
        )
        .unwrap();

        assert_eq!(listener.progress.lock().unwrap().len(), 2);
        assert_eq!(listener.completed.lock().unwrap().len(), 1);
    }

    #[test]
    fn empty_input_fails_fast_with_error_callback() {
        let listener = RecordingListener::default();
        let err = export_invoices(
            &[],
            "unused.xlsx",
            &SettingsSnapshot::default(),
            Some(&listener),
        )
        .unwrap_err();

        assert!(matches!(err, ExportError::NoInvoices));
        assert_eq!(listener.errors.lock().unwrap().len(), 1);
        assert!(listener.completed.lock().unwrap().is_empty());
        assert!(listener.progress.lock().unwrap().is_empty());
    }

    #[test]
    fn invoice_without_items_exports_header_only_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty-items.xlsx");

        let mut bare = invoice("INV-2025-0009", "Acme");
        bare.items.clear();
        bare.calculate_totals(default_tax_rate());

        export_invoices(
            &[bare],
            path.to_str().unwrap(),
            &SettingsSnapshot::default(),
            None,
        )
        .unwrap();
        assert!(path.exists());
    }

    #[test]
    fn unwritable_destination_reports_write_error() {
        let listener = RecordingListener::default();
        let err = export_invoices(
            &[invoice("INV-2025-0001", "Acme")],
            "/nonexistent-dir/invoices.xlsx",
            &SettingsSnapshot::default(),
            Some(&listener),
        )
        .unwrap_err();

        assert!(matches!(err, ExportError::Write { .. }));
        assert_eq!(listener.errors.lock().unwrap().len(), 1);
        assert!(listener.completed.lock().unwrap().is_empty());
    }

    struct PanickingListener {
        errors: Mutex<Vec<String>>,
    }

    impl ExportProgressListener for PanickingListener {
        fn on_progress(&self, _current: usize, _total: usize, _message: &str) {
            panic!("listener forwarding failed");
        }

        fn on_error(&self, error: &ExportError) {
            self.errors.lock().unwrap().push(error.to_string());
        }
    }

    #[tokio::test]
    async fn panicking_worker_still_gets_a_terminal_error_callback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("panic.xlsx");
        let listener = Arc::new(PanickingListener {
            errors: Mutex::new(Vec::new()),
        });

        let err = export_invoices_background(
            vec![invoice("INV-2025-0001", "Acme")],
            path.to_str().unwrap().to_string(),
            SettingsSnapshot::default(),
            listener.clone(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ExportError::Workbook(_)));
        assert_eq!(listener.errors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn background_export_drives_listener_off_thread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("background.xlsx");
        let listener = Arc::new(RecordingListener::default());

        export_invoices_background(
            vec![invoice("INV-2025-0001", "Acme")],
            path.to_str().unwrap().to_string(),
            SettingsSnapshot::default(),
            listener.clone(),
        )
        .await
        .unwrap();

        assert_eq!(listener.progress.lock().unwrap().len(), 1);
        assert_eq!(listener.completed.lock().unwrap().len(), 1);
        assert!(path.exists());
    }
}
