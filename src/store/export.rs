//! # store::export
//!
//! Flat CSV export of the trade ledger, one row per [`TradeRecord`] with the
//! ledger's column names as the header.

use std::io::Write;
use std::path::Path;

use crate::error::StoreError;
use crate::models::TradeRecord;

pub fn write_trades_csv<W: Write>(writer: W, records: &[TradeRecord]) -> Result<(), StoreError> {
    let mut csv = csv::Writer::from_writer(writer);
    for record in records {
        csv.serialize(record)?;
    }
    csv.flush()?;
    Ok(())
}

pub fn export_trades_csv(path: &Path, records: &[TradeRecord]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    write_trades_csv(std::fs::File::create(path)?, records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::tests::{sample_group, sample_record};

    #[test]
    fn test_csv_has_ledger_header_and_status() {
        let group = sample_group(1, 0);
        let mut buf = Vec::new();
        write_trades_csv(&mut buf, &[sample_record(&group)]).unwrap();

        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("trade_id,bot_id,order_id,symbol,open_time"));
        assert!(header.ends_with("position_group_id,position_num"));

        let row = lines.next().unwrap();
        assert!(row.contains(",TP1,RANGE,"));
        assert!(lines.next().is_none());
    }

    #[test]
    fn test_export_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/trades.csv");
        export_trades_csv(&path, &[]).unwrap();
        assert!(path.exists());
    }
}
