//! Shutdown leak report, compiled in with the `report-leaks` feature.
//!
//! Appends one line per still-used logical page encountered while tearing a
//! segment down. The pages themselves are never freed; see the shutdown
//! policy notes on [`crate::segment::Segment`].

use std::fs::OpenOptions;
use std::io::Write;

const REPORT_FILE: &str = "leaks.txt";

pub(crate) fn report(size_class: u32, used_bytes: u64) {
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(REPORT_FILE);

    match file {
        Ok(mut file) => {
            let result = if size_class != 0 {
                writeln!(
                    file,
                    "Potential memory leak : sizeclass={} count={}",
                    size_class,
                    used_bytes / u64::from(size_class)
                )
            } else {
                writeln!(file, "Potential memory leak : total size={used_bytes}")
            };
            if let Err(error) = result {
                log::warn!("failed to write leak report: {error}");
            }
        }
        Err(error) => {
            log::warn!("failed to open {REPORT_FILE}: {error}");
        }
    }
}
