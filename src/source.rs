// VecShelf — source.rs
// Record source: the vectors table and the titles table, joined by row.
// Author: d65v <https://github.com/d65v>

use std::fs;
use std::path::Path;

use crate::npy::read_npy;
use crate::{Record, Result, ShelfError};

/// Read-only, ordered records. Position `i` is the i-th row of both tables.
#[derive(Debug, Clone, Default)]
pub struct RecordSource {
    records: Vec<Record>,
    dim: usize,
}

impl RecordSource {
    /// # Errors
    /// Returns `ShelfError::Source` if vector widths differ between records.
    pub fn from_records(records: Vec<Record>) -> Result<Self> {
        let dim = records.first().map_or(0, |r| r.vector.len());
        if let Some((pos, r)) = records
            .iter()
            .enumerate()
            .find(|(_, r)| r.vector.len() != dim)
        {
            return Err(ShelfError::Source(format!(
                "row {} (id {}) has {} components, row 0 has {}",
                pos,
                r.id,
                r.vector.len(),
                dim
            )));
        }
        Ok(Self { records, dim })
    }

    /// Join the two tables by row position. Extra titles are ignored.
    pub fn from_tables(ids: Vec<i64>, vectors: Vec<Vec<f32>>, titles: Vec<String>) -> Result<Self> {
        if ids.len() != vectors.len() {
            return Err(ShelfError::Source(format!(
                "{} ids for {} vectors",
                ids.len(),
                vectors.len()
            )));
        }
        if titles.len() < vectors.len() {
            return Err(ShelfError::Source(format!(
                "titles table has {} rows, vectors table has {}",
                titles.len(),
                vectors.len()
            )));
        }
        if titles.len() > vectors.len() {
            log::warn!(
                "titles table has {} extra row(s); ignoring them",
                titles.len() - vectors.len()
            );
        }

        let records = ids
            .into_iter()
            .zip(vectors)
            .zip(titles)
            .map(|((id, vector), label)| Record { id, label, vector })
            .collect();
        Self::from_records(records)
    }

    /// Load both tables from disk. A `.npy` vectors file uses row numbers as ids.
    pub fn load(vectors_path: impl AsRef<Path>, titles_path: impl AsRef<Path>) -> Result<Self> {
        let vectors_path = vectors_path.as_ref();
        let (ids, vectors) = if vectors_path.extension().map_or(false, |e| e == "npy") {
            let rows = read_npy(vectors_path)?.into_rows();
            ((0..rows.len() as i64).collect(), rows)
        } else {
            read_vectors_csv(vectors_path)?
        };
        log::info!(
            "loaded {} vectors of width {} from {}",
            vectors.len(),
            vectors.first().map_or(0, |v| v.len()),
            vectors_path.display()
        );

        let titles = read_titles_csv(titles_path.as_ref())?;
        log::info!("loaded {} titles from {}", titles.len(), titles_path.as_ref().display());

        Self::from_tables(ids, vectors, titles)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Vector width shared by every record.
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn get(&self, position: usize) -> Option<&Record> {
        self.records.get(position)
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Record)> {
        self.records.iter().enumerate()
    }
}

// ── CSV Tables ────────────────────────────────────────────────────────────────

/// Vectors table: header row, first column is the row index, the rest floats.
fn read_vectors_csv(path: &Path) -> Result<(Vec<i64>, Vec<Vec<f32>>)> {
    let text = fs::read_to_string(path)
        .map_err(|e| ShelfError::Source(format!("{}: {}", path.display(), e)))?;
    let mut rows = parse_csv(&text).into_iter();
    let header = rows
        .next()
        .ok_or_else(|| ShelfError::Source(format!("{}: empty file", path.display())))?;
    let width = header.len().saturating_sub(1);
    if width == 0 {
        return Err(ShelfError::Source(format!(
            "{}: header has no vector columns",
            path.display()
        )));
    }

    let mut ids = Vec::new();
    let mut vectors = Vec::new();
    for (n, row) in rows.enumerate() {
        let line = n + 2;
        if row.len() != width + 1 {
            return Err(ShelfError::Source(format!(
                "{}:{}: expected {} columns, got {}",
                path.display(),
                line,
                width + 1,
                row.len()
            )));
        }
        let id = parse_id(&row[0]).ok_or_else(|| {
            ShelfError::Source(format!("{}:{}: bad index '{}'", path.display(), line, row[0]))
        })?;
        let vector = row[1..]
            .iter()
            .map(|cell| cell.trim().parse::<f32>())
            .collect::<std::result::Result<Vec<f32>, _>>()
            .map_err(|e| ShelfError::Source(format!("{}:{}: {}", path.display(), line, e)))?;
        ids.push(id);
        vectors.push(vector);
    }

    Ok((ids, vectors))
}

/// Titles table: any columns, one of them named `title`.
fn read_titles_csv(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)
        .map_err(|e| ShelfError::Source(format!("{}: {}", path.display(), e)))?;
    let mut rows = parse_csv(&text).into_iter();
    let header = rows
        .next()
        .ok_or_else(|| ShelfError::Source(format!("{}: empty file", path.display())))?;
    let col = header
        .iter()
        .position(|h| h.trim() == "title")
        .ok_or_else(|| ShelfError::Source(format!("{}: no 'title' column", path.display())))?;

    rows.enumerate()
        .map(|(n, mut row)| {
            if col < row.len() {
                Ok(row.swap_remove(col))
            } else {
                Err(ShelfError::Source(format!(
                    "{}:{}: row has no 'title' cell",
                    path.display(),
                    n + 2
                )))
            }
        })
        .collect()
}

/// Row indexes may be written as floats (`12.0`) by some exporters.
fn parse_id(cell: &str) -> Option<i64> {
    let cell = cell.trim();
    cell.parse::<i64>().ok().or_else(|| {
        let f = cell.parse::<f64>().ok()?;
        (f.fract() == 0.0 && f >= 0.0 && f <= i64::MAX as f64).then(|| f as i64)
    })
}

/// Split CSV text into rows of cells. Handles double-quoted cells with
/// embedded commas, newlines and `""` escapes. Blank lines are skipped.
pub fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut cell = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    cell.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => cell.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => row.push(std::mem::take(&mut cell)),
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut cell));
                if !(row.len() == 1 && row[0].is_empty()) {
                    rows.push(std::mem::take(&mut row));
                } else {
                    row.clear();
                }
            }
            _ => cell.push(c),
        }
    }
    if !cell.is_empty() || !row.is_empty() {
        row.push(cell);
        rows.push(row);
    }

    rows
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp(name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("vecshelf_{}_{}", std::process::id(), name));
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn test_parse_csv_quotes() {
        let rows = parse_csv("a,b\n\"x, y\",\"say \"\"hi\"\"\"\n\n\"multi\nline\",z");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1], vec!["x, y".to_string(), "say \"hi\"".to_string()]);
        assert_eq!(rows[2][0], "multi\nline");
    }

    #[test]
    fn test_parse_id_accepts_float_form() {
        assert_eq!(parse_id("12"), Some(12));
        assert_eq!(parse_id("12.0"), Some(12));
        assert_eq!(parse_id("1.5"), None);
        assert_eq!(parse_id("abc"), None);
    }

    #[test]
    fn test_load_csv_tables() {
        let vectors = write_tmp("v.csv", b",0,1,2\n0,0.1,0.2,0.3\n1,1.0,0.0,0.0\n");
        let titles = write_tmp(
            "t.csv",
            b"anime_id,title,score\n1,\"Cowboy Bebop\",8.7\n5,\"Trigun, the movie\",8.1\n9,Extra,7\n",
        );

        let source = RecordSource::load(&vectors, &titles).unwrap();
        assert_eq!(source.len(), 2);
        assert_eq!(source.dim(), 3);
        assert_eq!(source.get(1).unwrap().label, "Trigun, the movie");
        assert_eq!(source.get(0).unwrap().id, 0);

        fs::remove_file(vectors).ok();
        fs::remove_file(titles).ok();
    }

    #[test]
    fn test_load_npy_vectors() {
        let vectors = write_tmp("v.npy", &crate::npy::tests::make_npy(3, 2));
        let titles = write_tmp("t2.csv", b"title\na\nb\nc\n");
        let source = RecordSource::load(&vectors, &titles).unwrap();
        assert_eq!(source.len(), 3);
        assert_eq!(source.get(2).unwrap().id, 2);
        assert_eq!(source.get(2).unwrap().vector, vec![4.0, 5.0]);
        fs::remove_file(vectors).ok();
        fs::remove_file(titles).ok();
    }

    #[test]
    fn test_bad_float_names_line() {
        let vectors = write_tmp("bad.csv", b",0,1\n0,0.1,oops\n");
        let titles = write_tmp("t3.csv", b"title\na\n");
        let err = RecordSource::load(&vectors, &titles).unwrap_err().to_string();
        assert!(err.contains(":2:"), "{}", err);
        fs::remove_file(vectors).ok();
        fs::remove_file(titles).ok();
    }

    #[test]
    fn test_short_titles_table_rejected() {
        let err = RecordSource::from_tables(
            vec![0, 1],
            vec![vec![1.0], vec![2.0]],
            vec!["only one".into()],
        )
        .unwrap_err();
        assert!(matches!(err, ShelfError::Source(_)));
    }

    #[test]
    fn test_ragged_vectors_rejected() {
        let err = RecordSource::from_records(vec![
            Record::new(0, "a", vec![1.0, 2.0]),
            Record::new(1, "b", vec![1.0]),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("row 1"));
    }
}
