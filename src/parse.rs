//! Tensor and metadata file parsing.
//!
//! Both formats are delimiter-separated text streamed through
//! [`stream_records`], so neither ever materializes the decoded file.
//!
//! Tensor rows may start with a non-numeric label column. The vector width is
//! fixed by the first row; a row one field wider than that is read as label
//! plus vector. Metadata files carry a header row only if their first line
//! contains the value delimiter; otherwise the single column is named
//! `"label"`.

use crate::dataset::{MetadataValue, Point, PointMetadata, SpriteAndMetadataInfo};
use crate::stats::ColumnAnalyzer;
use crate::stream::{stream_records, ParseOptions};
use crate::ProjectorError;
use std::collections::HashMap;
use std::io::Read;
use std::time::Instant;
use tracing::debug;

/// Metadata key holding a tensor row's leading label.
pub const LABEL_COLUMN: &str = "label";

/// Parses delimiter-separated tensor rows into points.
///
/// Blank lines are skipped. Labels, when present, are stored in each point's
/// metadata under [`LABEL_COLUMN`].
///
/// # Errors
/// * `ProjectorError::InvalidNumber` if a vector component is not numeric
/// * `ProjectorError::DimensionMismatch` if rows disagree on vector width
/// * `ProjectorError::DegenerateVector` if vectors have one or zero components
/// * `ProjectorError::InvalidDelimiter` if a delimiter is not ASCII
/// * `ProjectorError::Io` / `ProjectorError::Utf8` on read or decode failure
pub fn parse_tensors<R: Read>(
    reader: R,
    options: &ParseOptions,
) -> Result<Vec<Point>, ProjectorError> {
    let start_time = Instant::now();
    let delimiter = char::from(options.value_delimiter);
    let mut points: Vec<Point> = Vec::new();
    let mut dim: Option<usize> = None;
    let mut line = 0usize;

    stream_records(reader, options, |record: &str| -> Result<(), ProjectorError> {
        line += 1;
        let record = record.trim();
        if record.is_empty() {
            return Ok(());
        }

        let fields: Vec<&str> = record.split(delimiter).collect();
        let labelled = fields[0].parse::<f32>().is_err() || dim == Some(fields.len() - 1);
        let (label, values) = if labelled {
            (Some(fields[0]), &fields[1..])
        } else {
            (None, &fields[..])
        };

        let vector = values
            .iter()
            .map(|value| {
                value.trim().parse::<f32>().map_err(|_| ProjectorError::InvalidNumber {
                    line,
                    value: (*value).to_owned(),
                })
            })
            .collect::<Result<Vec<f32>, _>>()?;

        let expected = *dim.get_or_insert(vector.len());
        if vector.len() != expected {
            return Err(ProjectorError::DimensionMismatch {
                expected,
                actual: vector.len(),
                line,
            });
        }
        if expected <= 1 {
            return Err(ProjectorError::DegenerateVector { dim: expected });
        }

        let mut point = Point::new(points.len(), vector);
        if let Some(label) = label {
            point
                .metadata
                .insert(LABEL_COLUMN.to_owned(), MetadataValue::Text(label.to_owned()));
        }
        points.push(point);
        Ok(())
    })?;

    debug!(
        "Parsed {} tensors of dimension {:?} in {:.2?}",
        points.len(),
        dim,
        start_time.elapsed()
    );
    Ok(points)
}

/// Reads a binary tensor of little-endian `f32` values with the given
/// `[points, dimension]` shape.
///
/// # Errors
/// * `ProjectorError::TensorShapeMismatch` if the byte length disagrees with
///   the shape
/// * `ProjectorError::DegenerateVector` if the dimension is one or zero
pub fn parse_tensors_from_f32_bytes(
    bytes: &[u8],
    shape: [usize; 2],
) -> Result<Vec<Point>, ProjectorError> {
    let [n, dim] = shape;
    let expected_bytes = n * dim * std::mem::size_of::<f32>();
    if bytes.len() != expected_bytes {
        return Err(ProjectorError::TensorShapeMismatch {
            shape,
            expected_bytes,
            actual_bytes: bytes.len(),
        });
    }
    if dim <= 1 {
        return Err(ProjectorError::DegenerateVector { dim });
    }

    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    Ok(values
        .chunks_exact(dim)
        .enumerate()
        .map(|(index, vector)| Point::new(index, vector.to_vec()))
        .collect())
}

/// Parses a metadata file into per-point records and column statistics.
///
/// Empty fields become [`MetadataValue::Missing`]; numeric fields become
/// [`MetadataValue::Number`].
///
/// # Errors
/// * `ProjectorError::InvalidDelimiter` if a delimiter is not ASCII
/// * `ProjectorError::Io` / `ProjectorError::Utf8` on read or decode failure
pub fn parse_metadata<R: Read>(
    reader: R,
    options: &ParseOptions,
    too_many_unique_values: usize,
) -> Result<SpriteAndMetadataInfo, ProjectorError> {
    let start_time = Instant::now();
    let delimiter = char::from(options.value_delimiter);
    let mut columns: Vec<String> = Vec::new();
    let mut analyzers: Vec<ColumnAnalyzer> = Vec::new();
    let mut points_info: Vec<PointMetadata> = Vec::new();

    stream_records(reader, options, |record: &str| -> Result<(), ProjectorError> {
        let record = record.trim_end_matches('\r');
        if record.trim().is_empty() {
            return Ok(());
        }

        if columns.is_empty() {
            let has_header = record.contains(delimiter);
            columns = if has_header {
                record.split(delimiter).map(str::to_owned).collect()
            } else {
                vec![LABEL_COLUMN.to_owned()]
            };
            analyzers = columns
                .iter()
                .map(|name| ColumnAnalyzer::new(name, too_many_unique_values))
                .collect();
            if has_header {
                return Ok(());
            }
        }

        let mut values = record.split(delimiter);
        let mut metadata = HashMap::with_capacity(columns.len());
        for (name, analyzer) in columns.iter().zip(analyzers.iter_mut()) {
            let value = values.next().map_or(MetadataValue::Missing, MetadataValue::parse);
            analyzer.observe(&value);
            metadata.insert(name.clone(), value);
        }
        points_info.push(metadata);
        Ok(())
    })?;

    let stats: Vec<_> = analyzers.into_iter().map(ColumnAnalyzer::finish).collect();
    debug!(
        "Parsed {} metadata records with {} columns in {:.2?}",
        points_info.len(),
        stats.len(),
        start_time.elapsed()
    );

    Ok(SpriteAndMetadataInfo {
        stats,
        points_info,
        ..SpriteAndMetadataInfo::default()
    })
}
