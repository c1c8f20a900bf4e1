//! Sorting raw experiment files into a directory tree by study group.
//!
//! The experiments are listed in a master sheet (exported as CSV) with
//! one row per sample:
//!
//! | column | contents                                   |
//! |--------|--------------------------------------------|
//! | 0      | sample id, e.g. `OP100.1`                  |
//! | 1      | path of the PV recording on the lab drive  |
//! | 2      | segmentation file name without extension   |
//! | 3      | `Sham` or a band size, e.g. `0,5`          |
//! | 4      | time after surgery, e.g. `6w`              |
//!
//! Each sample gets a directory under
//! `SHAM/<weeks>weeks/<sample>` or `AS/<weeks>weeks/<band*100>/<sample>`
//! holding its segmentation file and a `PV Data` folder with its PV files.

use std::path::{Path, PathBuf};

/// Error in reading the master sheet or placing a sample.
#[derive(thiserror::Error, Debug)]
pub enum OrganizeError {
    /// Reading the sheet or copying a file failed.
    #[error("I/O failed")]
    Io(#[from] std::io::Error),
    /// The sheet has no rows.
    #[error("Master sheet is empty")]
    EmptySheet,
    /// A row doesn't have the expected columns.
    #[error("Row {row}: {msg}")]
    InvalidRow {
        /// One-based row number in the sheet.
        row: usize,
        /// Description of the problem.
        msg: String,
    },
    /// A sample id too short to contain a separator and a number.
    #[error("Invalid sample id {0:?}")]
    InvalidSample(String),
    /// A category that's neither `Sham` nor a number.
    #[error("Invalid category {0:?}")]
    InvalidCategory(String),
}

/// One sample of the master sheet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SheetRow {
    /// Sample id.
    pub name: String,
    /// Path of the PV recording as written in the sheet.
    pub pv_path: String,
    /// Segmentation file name without extension.
    pub segmentation: String,
    /// `Sham` or band size.
    pub category: String,
    /// Time after surgery with a unit suffix.
    pub weeks: String,
}

/// Where to find the raw files and where to put them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrganizeOptions {
    /// Root of the directory tree.
    pub outdir: PathBuf,
    /// Create directories and copy files; otherwise only report the paths.
    pub mkdir: bool,
    /// Directory of the segmentation files.
    pub segdir: PathBuf,
    /// Directory of the PV files.
    pub pvdir: PathBuf,
}

/// What [`organize`] did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OrganizeSummary {
    /// Samples placed in the tree.
    pub placed: Vec<(String, PathBuf)>,
    /// Number of files copied.
    pub copied: usize,
    /// Source files that didn't exist.
    pub missing: Vec<PathBuf>,
    /// Rows that couldn't be processed.
    pub failed: usize,
}

/// Read the master sheet, skipping its header row.
pub fn read_master_sheet(path: impl AsRef<Path>) -> Result<Vec<SheetRow>, OrganizeError> {
    let text = std::fs::read_to_string(path)?;
    parse_master_sheet(&text)
}

/// Parse master sheet text.
///
/// Fields are separated by `;` if the header row contains one, otherwise by `,`
/// (so decimal commas survive a semicolon-separated export).
/// Fields may be quoted with `"`, with `""` standing for a literal quote.
/// Blank lines and rows with fewer than five fields are skipped with a warning.
pub fn parse_master_sheet(text: &str) -> Result<Vec<SheetRow>, OrganizeError> {
    let mut lines = text.lines().enumerate();
    let (_, header) = lines.next().ok_or(OrganizeError::EmptySheet)?;
    let delimiter = if header.contains(';') { ';' } else { ',' };

    let mut rows = Vec::new();
    for (idx, line) in lines {
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = split_fields(line, delimiter).into_iter();
        let mut next = || fields.next().unwrap_or_default().trim().to_string();
        let row = SheetRow {
            name: next(),
            pv_path: next(),
            segmentation: next(),
            category: next(),
            weeks: next(),
        };
        if row.name.is_empty() || row.weeks.is_empty() {
            tracing::warn!(row = idx + 1, "skipping incomplete row");
            continue;
        }
        rows.push(row);
    }
    Ok(rows)
}

fn split_fields(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            c if c == delimiter && !quoted => fields.push(std::mem::take(&mut field)),
            c => field.push(c),
        }
    }
    fields.push(field);
    fields
}

/// Destination directory of a sample.
///
/// The unit suffix is dropped from `weeks` and the separator before the
/// last character of the sample id becomes `_` (`OP100.1` → `OP100_1`).
/// Sham samples go under `SHAM/`; other categories are band sizes
/// (a decimal comma is accepted) and go under `AS/` in a directory named
/// after the band size times 100.
pub fn output_directory(
    root: impl AsRef<Path>,
    sample: &str,
    category: &str,
    weeks: &str,
) -> Result<PathBuf, OrganizeError> {
    let w = drop_last_chars(weeks, 1);
    let chars: Vec<char> = sample.chars().collect();
    if chars.len() < 2 {
        return Err(OrganizeError::InvalidSample(sample.to_string()));
    }
    let s: String = chars[..chars.len() - 2]
        .iter()
        .chain(['_', chars[chars.len() - 1]].iter())
        .collect();

    let root = root.as_ref();
    if category == "Sham" {
        return Ok(root.join("SHAM").join(format!("{w}weeks")).join(s));
    }
    let band: f64 = category
        .replace(',', ".")
        .parse()
        .map_err(|_| OrganizeError::InvalidCategory(category.to_string()))?;
    let c = band * 100.;
    Ok(root
        .join("AS")
        .join(format!("{w}weeks"))
        .join(format!("{c:.0}"))
        .join(s))
}

/// File name stem of a PV recording from its path in the sheet.
///
/// The sheet holds Windows paths ending in a 7-character suffix
/// after the stem; `None` for values without a backslash.
pub fn pv_file_stem(pv_path: &str) -> Option<String> {
    let (_, name) = pv_path.rsplit_once('\\')?;
    Some(drop_last_chars(name, 7))
}

fn drop_last_chars(s: &str, n: usize) -> String {
    let count = s.chars().count();
    s.chars().take(count.saturating_sub(n)).collect()
}

/// Place one sample, or every sample if `sample` is `all`.
///
/// Failures of single rows and missing source files are logged and skipped.
pub fn organize(rows: &[SheetRow], sample: &str, opts: &OrganizeOptions) -> OrganizeSummary {
    let mut summary = OrganizeSummary::default();
    if sample.eq_ignore_ascii_case("all") {
        for (idx, row) in rows.iter().enumerate() {
            place_row(idx + 2, row, opts, &mut summary);
        }
    } else {
        match rows.iter().position(|r| r.name == sample) {
            Some(idx) => place_row(idx + 2, &rows[idx], opts, &mut summary),
            None => tracing::warn!(sample, "Sample not found"),
        }
    }
    summary
}

fn place_row(row_num: usize, row: &SheetRow, opts: &OrganizeOptions, summary: &mut OrganizeSummary) {
    let dest = match output_directory(&opts.outdir, &row.name, &row.category, &row.weeks) {
        Ok(dest) => dest,
        Err(e) => {
            tracing::error!(row = row_num, sample = %row.name, "{e}");
            summary.failed += 1;
            return;
        }
    };
    tracing::info!(sample = %row.name, dest = %dest.display(), "placing sample");

    if opts.mkdir {
        if let Err(e) = copy_sample_files(row, &dest, opts, summary) {
            tracing::error!(row = row_num, sample = %row.name, error = %e, "copying failed");
            summary.failed += 1;
            return;
        }
    }
    summary.placed.push((row.name.clone(), dest));
}

fn copy_sample_files(
    row: &SheetRow,
    dest: &Path,
    opts: &OrganizeOptions,
    summary: &mut OrganizeSummary,
) -> Result<(), OrganizeError> {
    std::fs::create_dir_all(dest)?;
    copy_if_exists(
        &opts.segdir.join(format!("{}.mat", row.segmentation)),
        dest,
        summary,
    )?;

    let Some(stem) = pv_file_stem(&row.pv_path) else {
        return Ok(());
    };
    let pv_dest = dest.join("PV Data");
    std::fs::create_dir_all(&pv_dest)?;
    for ext in ["adicht", "mat"] {
        copy_if_exists(&opts.pvdir.join(format!("{stem}.{ext}")), &pv_dest, summary)?;
    }
    Ok(())
}

fn copy_if_exists(
    source: &Path,
    dest_dir: &Path,
    summary: &mut OrganizeSummary,
) -> Result<(), OrganizeError> {
    let Some(name) = source.file_name().filter(|_| source.is_file()) else {
        tracing::warn!(file = %source.display(), "source file not found");
        summary.missing.push(source.to_path_buf());
        return Ok(());
    };
    std::fs::copy(source, dest_dir.join(name))?;
    tracing::debug!(file = %source.display(), dest = %dest_dir.display(), "copied");
    summary.copied += 1;
    Ok(())
}
