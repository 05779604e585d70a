//! The data-log index file.
//!
//! Scans do not record signal values themselves; the archiver does.  What a
//! scan must leave behind is an index of time windows so the analysis can pull
//! the archived data back out: one comma-separated row per sample with the
//! settle and averaging windows and the cavities that moved.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use fedaq_core::error::DaqResult;

const TIMESTAMP_FMT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// The time windows of one collected sample.
#[derive(Debug, Clone, Copy)]
pub struct SampleWindow {
    pub settle_start: DateTime<Local>,
    pub settle_end: DateTime<Local>,
    pub avg_start: DateTime<Local>,
    pub avg_end: DateTime<Local>,
    pub settle_s: f64,
    pub avg_s: f64,
}

/// Appending writer for the index file.  Every row is flushed immediately so
/// an interrupted scan loses nothing already collected.
pub struct DataLog {
    path: PathBuf,
    file: File,
}

impl DataLog {
    /// Open `path` for appending, creating parent directories as needed.
    pub fn append(path: &Path) -> DaqResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the settings banner (when any settings are given) and the column
    /// header.  Called once per scan; appending scans repeat the header so
    /// each scan's settings travel with its rows.
    pub fn write_header(&mut self, settings: &[(&str, String)]) -> DaqResult<()> {
        if !settings.is_empty() {
            let banner = settings
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join(" ");
            writeln!(self.file, "# {banner}")?;
        }
        writeln!(
            self.file,
            "#settle_start,settle_end,avg_start,avg_end,settle_dur,avg_dur,cavity_name,cavity_epics_name"
        )?;
        self.file.flush()?;
        Ok(())
    }

    /// Append one sample row and flush it.
    pub fn write_row(
        &mut self,
        window: &SampleWindow,
        cavity_names: &[String],
        epics_names: &[String],
    ) -> DaqResult<()> {
        writeln!(
            self.file,
            "{},{},{},{},{},{},{},{}",
            window.settle_start.format(TIMESTAMP_FMT),
            window.settle_end.format(TIMESTAMP_FMT),
            window.avg_start.format(TIMESTAMP_FMT),
            window.avg_end.format(TIMESTAMP_FMT),
            window.settle_s,
            window.avg_s,
            cavity_names.join(":"),
            epics_names.join(":"),
        )?;
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window() -> SampleWindow {
        let base = Local.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
        SampleWindow {
            settle_start: base,
            settle_end: base + chrono::Duration::seconds(6),
            avg_start: base + chrono::Duration::seconds(6),
            avg_end: base + chrono::Duration::seconds(9),
            settle_s: 6.0,
            avg_s: 3.0,
        }
    }

    #[test]
    fn header_carries_settings_then_column_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.csv");
        let mut log = DataLog::append(&path).unwrap();
        log.write_header(&[
            ("type", "random_sample_gradient_scan".to_string()),
            ("n_cavities", "10".to_string()),
        ])
        .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "# type=random_sample_gradient_scan n_cavities=10"
        );
        assert!(lines.next().unwrap().starts_with("#settle_start,settle_end,"));
    }

    #[test]
    fn rows_join_names_with_colons_and_timestamp_microseconds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.csv");
        let mut log = DataLog::append(&path).unwrap();
        log.write_header(&[]).unwrap();
        log.write_row(
            &window(),
            &["1L22-3".to_string(), "1L22-4".to_string()],
            &["R1M3".to_string(), "R1M4".to_string()],
        )
        .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let row = text.lines().last().unwrap();
        let fields: Vec<&str> = row.split(',').collect();
        assert_eq!(fields.len(), 8);
        assert_eq!(fields[0], "2026-03-14 09:26:53.000000");
        assert_eq!(fields[4], "6");
        assert_eq!(fields[5], "3");
        assert_eq!(fields[6], "1L22-3:1L22-4");
        assert_eq!(fields[7], "R1M3:R1M4");
    }

    #[test]
    fn append_creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs/2026-03-14/scan.csv");
        let mut log = DataLog::append(&path).unwrap();
        log.write_header(&[]).unwrap();
        assert!(path.is_file());
    }

    #[test]
    fn empty_settings_skip_the_banner_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.csv");
        let mut log = DataLog::append(&path).unwrap();
        log.write_header(&[]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("#settle_start"));
    }
}
