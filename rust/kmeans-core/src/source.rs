// rust/kmeans-core/src/source.rs

//! Point sources feeding the task distributor.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{ClusterError, Result};
use crate::model::{CentroidSet, Point};

/// Outcome of asking a source for more points.
#[derive(Debug, Clone, PartialEq)]
pub enum Batch {
    /// Between 1 and `n` points.
    Points(Vec<Point>),
    /// No points left until the next `rewind()`.
    Exhausted,
}

/// Access to the raw points and persisted centroids.
pub trait PointSource: Send {
    /// Pull up to `n` points.
    fn next_batch(&mut self, n: usize) -> Result<Batch>;

    /// Initial positions for `k` centroids.
    fn starting_centroids(&mut self, k: usize) -> Result<Vec<Point>>;

    /// Restart from the first point (each iteration covers the whole dataset).
    fn rewind(&mut self) -> Result<()>;

    /// Persist the centroids produced by an iteration.
    fn store_result(&mut self, centroids: &CentroidSet) -> Result<()>;
}

/// A vector-backed source.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    points: Vec<Point>,
    cursor: usize,
    stored: Vec<CentroidSet>,
}

impl MemorySource {
    pub fn new(points: Vec<Point>) -> Self {
        Self {
            points,
            cursor: 0,
            stored: Vec::new(),
        }
    }

    /// Every centroid set passed to `store_result`, oldest first.
    pub fn stored(&self) -> &[CentroidSet] {
        &self.stored
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

impl PointSource for MemorySource {
    fn next_batch(&mut self, n: usize) -> Result<Batch> {
        if self.cursor >= self.points.len() || n == 0 {
            return Ok(Batch::Exhausted);
        }
        let end = (self.cursor + n).min(self.points.len());
        let batch = self.points[self.cursor..end].to_vec();
        self.cursor = end;
        Ok(Batch::Points(batch))
    }

    fn starting_centroids(&mut self, k: usize) -> Result<Vec<Point>> {
        if self.points.len() < k {
            return Err(ClusterError::source(
                "<memory>",
                format!("need {} starting centroids, dataset has {} points", k, self.points.len()),
            ));
        }
        Ok(self.points[..k].to_vec())
    }

    fn rewind(&mut self) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }

    fn store_result(&mut self, centroids: &CentroidSet) -> Result<()> {
        self.stored.push(centroids.clone());
        Ok(())
    }
}

/// Reads `x,y` lines from a text file.
///
/// Blank lines and lines starting with `#` are skipped. Results, when a
/// results path is configured, are appended as `iteration,index,x,y` lines.
pub struct CsvPointSource {
    path: PathBuf,
    reader: BufReader<File>,
    line_number: usize,
    results_path: Option<PathBuf>,
}

impl CsvPointSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .map_err(|e| ClusterError::source_with_io(&path, "failed to open point file", e))?;
        Ok(Self {
            path,
            reader: BufReader::new(file),
            line_number: 0,
            results_path: None,
        })
    }

    /// Append each stored CentroidSet to `path`.
    pub fn with_results(mut self, path: impl AsRef<Path>) -> Self {
        self.results_path = Some(path.as_ref().to_path_buf());
        self
    }

    fn read_point(&mut self) -> Result<Option<Point>> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self
                .reader
                .read_line(&mut line)
                .map_err(|e| ClusterError::source_with_io(&self.path, "read failed", e))?;
            if read == 0 {
                return Ok(None);
            }
            self.line_number += 1;

            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            return parse_point(trimmed)
                .map(Some)
                .ok_or_else(|| {
                    ClusterError::source(
                        &self.path,
                        format!("line {}: expected 'x,y', got '{}'", self.line_number, trimmed),
                    )
                });
        }
    }
}

fn parse_point(line: &str) -> Option<Point> {
    let (x, y) = line.split_once(',')?;
    let x: f64 = x.trim().parse().ok()?;
    let y: f64 = y.trim().parse().ok()?;
    if !x.is_finite() || !y.is_finite() {
        return None;
    }
    Some(Point::new(x, y))
}

impl PointSource for CsvPointSource {
    fn next_batch(&mut self, n: usize) -> Result<Batch> {
        let mut points = Vec::with_capacity(n);
        while points.len() < n {
            match self.read_point()? {
                Some(point) => points.push(point),
                None => break,
            }
        }
        if points.is_empty() {
            Ok(Batch::Exhausted)
        } else {
            Ok(Batch::Points(points))
        }
    }

    fn starting_centroids(&mut self, k: usize) -> Result<Vec<Point>> {
        self.rewind()?;
        let mut centroids = Vec::with_capacity(k);
        while centroids.len() < k {
            match self.read_point()? {
                Some(point) => centroids.push(point),
                None => {
                    return Err(ClusterError::source(
                        &self.path,
                        format!("need {} starting centroids, file has {}", k, centroids.len()),
                    ))
                }
            }
        }
        self.rewind()?;
        Ok(centroids)
    }

    fn rewind(&mut self) -> Result<()> {
        self.reader
            .seek(SeekFrom::Start(0))
            .map_err(|e| ClusterError::source_with_io(&self.path, "seek failed", e))?;
        self.line_number = 0;
        Ok(())
    }

    fn store_result(&mut self, centroids: &CentroidSet) -> Result<()> {
        let Some(results_path) = &self.results_path else {
            return Ok(());
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(results_path)
            .map_err(|e| ClusterError::source_with_io(results_path, "failed to open results", e))?;
        for c in &centroids.centroids {
            writeln!(
                file,
                "{},{},{},{}",
                centroids.iteration, c.index, c.position.x, c.position.y
            )
            .map_err(|e| ClusterError::source_with_io(results_path, "failed to write results", e))?;
        }
        Ok(())
    }
}
