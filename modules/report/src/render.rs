//! Text, CSV and JSON renderings of report tables.

use crate::ViolationReport;
use anyhow::Result;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Csv,
    Json,
}

pub fn render<W: Write>(out: &mut W, reports: &[ViolationReport], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            for report in reports {
                write_table(out, report)?;
            }
        }
        OutputFormat::Csv => {
            // a title record precedes each table, so record lengths vary
            let mut wtr = csv::WriterBuilder::new().flexible(true).from_writer(&mut *out);
            for report in reports {
                wtr.write_record([&report.title])?;
                wtr.write_record(&report.header)?;
                for row in &report.rows {
                    wtr.write_record(row)?;
                }
            }
            wtr.flush()?;
        }
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, reports)?;
            writeln!(out)?;
        }
    }
    Ok(())
}

/// `|`-bordered table with upper-cased headers, preceded by the title.
pub fn write_table<W: Write>(out: &mut W, report: &ViolationReport) -> Result<()> {
    let header: Vec<String> = report.header.iter().map(|h| h.to_uppercase()).collect();
    let mut widths: Vec<usize> = header.iter().map(|h| h.chars().count()).collect();
    for row in &report.rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }
    let rule: String = widths.iter().fold(String::from("+"), |mut acc, w| {
        acc.push_str(&"-".repeat(w + 2));
        acc.push('+');
        acc
    });

    writeln!(out, "{}", report.title)?;
    writeln!(out)?;
    writeln!(out, "{rule}")?;
    write_row(out, &header, &widths)?;
    writeln!(out, "{rule}")?;
    for row in &report.rows {
        write_row(out, row, &widths)?;
    }
    if !report.rows.is_empty() {
        writeln!(out, "{rule}")?;
        if let Some(note) = &report.note {
            writeln!(out, "{note}")?;
        }
    }
    writeln!(out)?;
    Ok(())
}

fn write_row<W: Write>(out: &mut W, cells: &[String], widths: &[usize]) -> Result<()> {
    let mut line = String::from("|");
    for (cell, width) in cells.iter().zip(widths) {
        let pad = width - cell.chars().count();
        line.push(' ');
        line.push_str(cell);
        line.push_str(&" ".repeat(pad + 1));
        line.push('|');
    }
    writeln!(out, "{line}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ViolationReport {
        let mut r = ViolationReport::new("World-readable files:", &["Identity", "Path"]).with_note("fix it");
        r.push(vec!["host1".into(), "/etc/my.cnf".into()]);
        r
    }

    fn rendered(reports: &[ViolationReport], format: OutputFormat) -> String {
        let mut buf = Vec::new();
        render(&mut buf, reports, format).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn table_layout() {
        let text = rendered(&[sample()], OutputFormat::Table);
        let expected = "\
World-readable files:

+----------+-------------+
| IDENTITY | PATH        |
+----------+-------------+
| host1    | /etc/my.cnf |
+----------+-------------+
fix it

";
        assert_eq!(text, expected);
    }

    #[test]
    fn empty_table_has_no_note() {
        let empty = ViolationReport::new("Duplicate SSH keys:", &["Identity"]).with_note("unused");
        let text = rendered(&[empty], OutputFormat::Table);
        assert!(text.contains("| IDENTITY |"));
        assert!(!text.contains("unused"));
    }

    #[test]
    fn csv_and_json() {
        let csv = rendered(&[sample()], OutputFormat::Csv);
        assert_eq!(csv, "World-readable files:\nIdentity,Path\nhost1,/etc/my.cnf\n");

        let json: serde_json::Value = serde_json::from_str(&rendered(&[sample()], OutputFormat::Json)).unwrap();
        assert_eq!(json[0]["rows"][0][1], "/etc/my.cnf");
        assert_eq!(json[0]["header"][0], "Identity");
    }
}
