// Table adapters: JSON-lines partition storage (the writable default) and
// a CSV adapter for registering external comma-separated files.

use async_trait::async_trait;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::path::{Path, PathBuf};

use super::{AdapterCore, Asset, TableAdapter};
use crate::errors::{Result, TreeError};
use crate::structures::{Spec, Structure, StructureFamily, TableStructure};

pub const JSONLINES_MIMETYPE: &str = "application/jsonlines";
pub const CSV_MIMETYPE: &str = "text/csv";

fn project_columns(row: &JsonValue, columns: &[String]) -> JsonValue {
    let mut out = JsonMap::new();
    if let Some(map) = row.as_object() {
        for column in columns {
            if let Some(value) = map.get(column) {
                out.insert(column.clone(), value.clone());
            }
        }
    }
    JsonValue::Object(out)
}

fn check_columns(structure: &TableStructure, columns: &[String]) -> Result<()> {
    for column in columns {
        if !structure.columns.contains(column) {
            return Err(TreeError::Unprocessable(format!(
                "no such column {column:?}"
            )));
        }
    }
    Ok(())
}

/// One JSON-lines file per partition under a directory.
#[derive(Debug)]
pub struct JsonLinesTableAdapter {
    directory: PathBuf,
    structure: TableStructure,
    metadata: JsonValue,
    specs: Vec<Spec>,
    writable: bool,
}

impl JsonLinesTableAdapter {
    pub fn new(
        directory: PathBuf,
        structure: TableStructure,
        metadata: JsonValue,
        specs: Vec<Spec>,
        writable: bool,
    ) -> Result<Self> {
        structure.validate()?;
        Ok(Self {
            directory,
            structure,
            metadata,
            specs,
            writable,
        })
    }

    pub fn init_storage(directory: &Path, structure: &TableStructure) -> Result<Vec<Asset>> {
        structure.validate()?;
        std::fs::create_dir_all(directory).map_err(|e| {
            TreeError::Internal(anyhow::anyhow!(
                "failed to create table storage at {}: {e}",
                directory.display()
            ))
        })?;
        for partition in 0..structure.npartitions {
            let path = directory.join(partition_file_name(partition));
            std::fs::write(&path, b"").map_err(|e| {
                TreeError::Internal(anyhow::anyhow!(
                    "failed to initialize partition {}: {e}",
                    path.display()
                ))
            })?;
        }
        Ok(vec![Asset {
            data_uri: format!("file://localhost{}", directory.display()),
            is_directory: true,
        }])
    }

    fn partition_path(&self, partition: usize) -> Result<PathBuf> {
        if partition >= self.structure.npartitions {
            return Err(TreeError::Unprocessable(format!(
                "partition {partition} out of range; table has {}",
                self.structure.npartitions
            )));
        }
        Ok(self.directory.join(partition_file_name(partition)))
    }

    fn check_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(TreeError::Forbidden(
                "this table is externally managed and read-only".into(),
            ))
        }
    }
}

fn partition_file_name(partition: usize) -> String {
    format!("part-{partition}.jsonl")
}

impl AdapterCore for JsonLinesTableAdapter {
    fn structure_family(&self) -> StructureFamily {
        StructureFamily::Table
    }

    fn metadata(&self) -> JsonValue {
        self.metadata.clone()
    }

    fn structure(&self) -> Structure {
        Structure::Table(self.structure.clone())
    }

    fn specs(&self) -> Vec<Spec> {
        self.specs.clone()
    }
}

#[async_trait]
impl TableAdapter for JsonLinesTableAdapter {
    async fn read(&self, columns: Option<&[String]>) -> Result<Vec<JsonValue>> {
        let mut rows = Vec::new();
        for partition in 0..self.structure.npartitions {
            rows.extend(self.read_partition(partition, columns).await?);
        }
        Ok(rows)
    }

    async fn read_partition(
        &self,
        partition: usize,
        columns: Option<&[String]>,
    ) -> Result<Vec<JsonValue>> {
        if let Some(columns) = columns {
            check_columns(&self.structure, columns)?;
        }
        let path = self.partition_path(partition)?;
        let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
            TreeError::Internal(anyhow::anyhow!(
                "failed to read partition {}: {e}",
                path.display()
            ))
        })?;
        let mut rows = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let row: JsonValue = serde_json::from_str(line).map_err(|e| {
                TreeError::Internal(anyhow::anyhow!("corrupt row in {}: {e}", path.display()))
            })?;
            rows.push(match columns {
                Some(columns) => project_columns(&row, columns),
                None => row,
            });
        }
        Ok(rows)
    }

    async fn write(&self, rows: &[JsonValue]) -> Result<()> {
        self.check_writable()?;
        if self.structure.npartitions != 1 {
            return Err(TreeError::Unprocessable(
                "full-table writes require a single-partition table; write partitions \
                 individually"
                    .into(),
            ));
        }
        self.write_partition(0, rows).await
    }

    async fn write_partition(&self, partition: usize, rows: &[JsonValue]) -> Result<()> {
        self.check_writable()?;
        let path = self.partition_path(partition)?;
        let mut out = String::new();
        for row in rows {
            out.push_str(&serde_json::to_string(row).map_err(anyhow::Error::from)?);
            out.push('\n');
        }
        tokio::fs::write(&path, out).await.map_err(|e| {
            TreeError::Internal(anyhow::anyhow!(
                "failed to write partition {}: {e}",
                path.display()
            ))
        })?;
        Ok(())
    }
}

/// A single CSV file as a one-partition table. Numeric cells are parsed as
/// numbers; everything else stays a string.
#[derive(Debug)]
pub struct CsvTableAdapter {
    path: PathBuf,
    structure: TableStructure,
    metadata: JsonValue,
    specs: Vec<Spec>,
    writable: bool,
}

impl CsvTableAdapter {
    pub fn new(
        path: PathBuf,
        structure: TableStructure,
        metadata: JsonValue,
        specs: Vec<Spec>,
        writable: bool,
    ) -> Result<Self> {
        structure.validate()?;
        if structure.npartitions != 1 {
            return Err(TreeError::Unprocessable(
                "csv tables have exactly one partition".into(),
            ));
        }
        Ok(Self {
            path,
            structure,
            metadata,
            specs,
            writable,
        })
    }

    pub fn init_storage(path: &Path, structure: &TableStructure) -> Result<Vec<Asset>> {
        structure.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(anyhow::Error::from)?;
        }
        let mut writer = csv::Writer::from_path(path).map_err(anyhow::Error::from)?;
        writer
            .write_record(&structure.columns)
            .map_err(anyhow::Error::from)?;
        writer.flush().map_err(anyhow::Error::from)?;
        Ok(vec![Asset {
            data_uri: format!("file://localhost{}", path.display()),
            is_directory: false,
        }])
    }

    fn parse_cell(cell: &str) -> JsonValue {
        if let Ok(n) = cell.parse::<i64>() {
            return JsonValue::from(n);
        }
        if let Ok(f) = cell.parse::<f64>() {
            return JsonValue::from(f);
        }
        JsonValue::String(cell.to_string())
    }

    fn format_cell(value: &JsonValue) -> String {
        match value {
            JsonValue::String(s) => s.clone(),
            JsonValue::Null => String::new(),
            other => other.to_string(),
        }
    }
}

impl AdapterCore for CsvTableAdapter {
    fn structure_family(&self) -> StructureFamily {
        StructureFamily::Table
    }

    fn metadata(&self) -> JsonValue {
        self.metadata.clone()
    }

    fn structure(&self) -> Structure {
        Structure::Table(self.structure.clone())
    }

    fn specs(&self) -> Vec<Spec> {
        self.specs.clone()
    }
}

#[async_trait]
impl TableAdapter for CsvTableAdapter {
    async fn read(&self, columns: Option<&[String]>) -> Result<Vec<JsonValue>> {
        if let Some(columns) = columns {
            check_columns(&self.structure, columns)?;
        }
        let path = self.path.clone();
        let columns = columns.map(|c| c.to_vec());
        let rows = tokio::task::spawn_blocking(move || -> Result<Vec<JsonValue>> {
            let mut reader = csv::Reader::from_path(&path).map_err(anyhow::Error::from)?;
            let headers: Vec<String> = reader
                .headers()
                .map_err(anyhow::Error::from)?
                .iter()
                .map(|h| h.to_string())
                .collect();
            let mut rows = Vec::new();
            for record in reader.records() {
                let record = record.map_err(anyhow::Error::from)?;
                let mut row = JsonMap::new();
                for (header, cell) in headers.iter().zip(record.iter()) {
                    row.insert(header.clone(), CsvTableAdapter::parse_cell(cell));
                }
                let row = JsonValue::Object(row);
                rows.push(match &columns {
                    Some(columns) => project_columns(&row, columns),
                    None => row,
                });
            }
            Ok(rows)
        })
        .await
        .map_err(anyhow::Error::from)??;
        Ok(rows)
    }

    async fn read_partition(
        &self,
        partition: usize,
        columns: Option<&[String]>,
    ) -> Result<Vec<JsonValue>> {
        if partition != 0 {
            return Err(TreeError::Unprocessable(format!(
                "partition {partition} out of range; table has 1"
            )));
        }
        self.read(columns).await
    }

    async fn write(&self, rows: &[JsonValue]) -> Result<()> {
        if !self.writable {
            return Err(TreeError::Forbidden(
                "this table is externally managed and read-only".into(),
            ));
        }
        let path = self.path.clone();
        let columns = self.structure.columns.clone();
        let rows = rows.to_vec();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut writer = csv::Writer::from_path(&path).map_err(anyhow::Error::from)?;
            writer.write_record(&columns).map_err(anyhow::Error::from)?;
            for row in &rows {
                let record: Vec<String> = columns
                    .iter()
                    .map(|column| {
                        row.get(column)
                            .map(CsvTableAdapter::format_cell)
                            .unwrap_or_default()
                    })
                    .collect();
                writer.write_record(&record).map_err(anyhow::Error::from)?;
            }
            writer.flush().map_err(anyhow::Error::from)?;
            Ok(())
        })
        .await
        .map_err(anyhow::Error::from)??;
        Ok(())
    }

    async fn write_partition(&self, partition: usize, rows: &[JsonValue]) -> Result<()> {
        if partition != 0 {
            return Err(TreeError::Unprocessable(format!(
                "partition {partition} out of range; table has 1"
            )));
        }
        self.write(rows).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn two_partition_structure() -> TableStructure {
        TableStructure {
            columns: vec!["x".into(), "y".into()],
            npartitions: 2,
        }
    }

    #[tokio::test]
    async fn test_jsonlines_partition_round_trip() {
        let dir = TempDir::new().unwrap();
        let structure = two_partition_structure();
        JsonLinesTableAdapter::init_storage(dir.path(), &structure).unwrap();
        let adapter = JsonLinesTableAdapter::new(
            dir.path().to_path_buf(),
            structure,
            json!({}),
            vec![],
            true,
        )
        .unwrap();

        adapter
            .write_partition(0, &[json!({"x": 1, "y": "a"}), json!({"x": 2, "y": "b"})])
            .await
            .unwrap();
        adapter
            .write_partition(1, &[json!({"x": 3, "y": "c"})])
            .await
            .unwrap();

        let part0 = adapter.read_partition(0, None).await.unwrap();
        assert_eq!(part0.len(), 2);
        assert_eq!(part0[1]["y"], "b");

        let all = adapter.read(None).await.unwrap();
        assert_eq!(all.len(), 3);

        let xs = adapter.read(Some(&["x".to_string()])).await.unwrap();
        assert_eq!(xs[2], json!({"x": 3}));
    }

    #[tokio::test]
    async fn test_jsonlines_bad_partition_and_column() {
        let dir = TempDir::new().unwrap();
        let structure = two_partition_structure();
        JsonLinesTableAdapter::init_storage(dir.path(), &structure).unwrap();
        let adapter = JsonLinesTableAdapter::new(
            dir.path().to_path_buf(),
            structure,
            json!({}),
            vec![],
            true,
        )
        .unwrap();
        assert!(adapter.read_partition(2, None).await.is_err());
        assert!(adapter
            .read_partition(0, Some(&["nope".to_string()]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_csv_round_trip_with_numeric_parsing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.csv");
        let structure = TableStructure {
            columns: vec!["name".into(), "value".into()],
            npartitions: 1,
        };
        CsvTableAdapter::init_storage(&path, &structure).unwrap();
        let adapter =
            CsvTableAdapter::new(path, structure, json!({}), vec![], true).unwrap();

        adapter
            .write(&[
                json!({"name": "alpha", "value": 1}),
                json!({"name": "beta", "value": 2.5}),
            ])
            .await
            .unwrap();

        let rows = adapter.read(None).await.unwrap();
        assert_eq!(rows[0], json!({"name": "alpha", "value": 1}));
        assert_eq!(rows[1], json!({"name": "beta", "value": 2.5}));
    }

    #[tokio::test]
    async fn test_read_only_table_refuses_writes() {
        let dir = TempDir::new().unwrap();
        let structure = TableStructure {
            columns: vec!["x".into()],
            npartitions: 1,
        };
        JsonLinesTableAdapter::init_storage(dir.path(), &structure).unwrap();
        let adapter = JsonLinesTableAdapter::new(
            dir.path().to_path_buf(),
            structure,
            json!({}),
            vec![],
            false,
        )
        .unwrap();
        assert!(adapter.write(&[json!({"x": 1})]).await.is_err());
    }
}
