//! Name parsing shared by the ledger and the directory processor.
//!
//! Instrument batch files look like `<run>_<seq>.fastq.gz` where `<seq>` is a
//! zero-padded counter; accumulators look like `<prefix>_<first>-<current>.fastq.gz`.

use crate::seq_files::base_name;
use std::path::Path;

/// Minimum width of a barcode string.
pub const BARCODE_WIDTH: usize = 2;

/// Base name with `.gz` and then one more extension removed.
pub fn run_name(file: &str) -> String {
    let name = base_name(Path::new(file));
    let name = name.strip_suffix(".gz").unwrap_or(&name);
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => name.to_string(),
    }
}

/// Trailing `_<digits>` token of the run name, if present.
pub fn run_number(file: &str) -> Option<String> {
    let name = run_name(file);
    let (_, token) = name.rsplit_once('_')?;
    if !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()) {
        Some(token.to_string())
    } else {
        None
    }
}

/// Left-pads `value` with zeros to [`BARCODE_WIDTH`]; wider values are untouched.
pub fn pad_barcode(value: &str) -> String {
    format!("{:0>width$}", value, width = BARCODE_WIDTH)
}

/// Derives the stable sample id from an accumulator path.
///
/// `projectX_00-03.fastq.gz` gives `projectX`; a stem without a trailing
/// `<a>-<b>` token is returned whole.
pub fn sample_id_from_merged(merged_file: &str) -> String {
    let stem = run_name(merged_file);
    match stem.rsplit_once('_') {
        Some((head, token)) if is_run_range(token) && !head.is_empty() => head.to_string(),
        _ => stem,
    }
}

fn is_run_range(token: &str) -> bool {
    match token.split_once('-') {
        Some((first, last)) => !first.is_empty() && !last.is_empty(),
        None => false,
    }
}
