//! Compensation matrix files on disk.

use crate::Result;
use cytocomp_core::{CompensationFile, CompensationMatrix};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Writes the matrix as pretty-printed JSON: `{"version", "nParams", "coeffs"}`.
///
/// # Errors
/// Returns an error if the file cannot be created or written.
pub fn save_compensation<P: AsRef<Path>>(path: P, matrix: &CompensationMatrix) -> Result<()> {
    let mut writer = BufWriter::new(File::create(&path)?);
    serde_json::to_writer_pretty(&mut writer, &matrix.to_file())?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    log::info!(
        "saved {}x{} compensation matrix to {}",
        matrix.n_channels(),
        matrix.n_channels(),
        path.as_ref().display()
    );
    Ok(())
}

/// Reads a compensation file without applying it.
///
/// # Errors
/// Returns an error if the file cannot be read or is not valid JSON.
pub fn read_compensation<P: AsRef<Path>>(path: P) -> Result<CompensationFile> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

/// Loads a compensation file into `matrix`, which becomes the new baseline.
///
/// The matrix is left untouched if reading or validation fails.
///
/// # Errors
/// Returns an error if the file cannot be read, is not valid JSON, or does
/// not match the matrix shape.
pub fn load_compensation<P: AsRef<Path>>(path: P, matrix: &mut CompensationMatrix) -> Result<()> {
    let file = read_compensation(&path)?;
    matrix.load_file(&file)?;
    log::info!(
        "loaded compensation matrix from {}",
        path.as_ref().display()
    );
    Ok(())
}
