use crate::error::IngestError;
use crate::models::UNKNOWN;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

const DATE_PATTERN: &str =
    r"(?i)(janv|fevr|mars|avr|mai|juin|juil|aout|sept|oct|nov|dec)[\s\-]+[0-9]{4}";
const DATE_SCAN_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
    pub min_len: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 450,
            overlap: 50,
            min_len: 250,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk_size must be positive".to_string(),
            ));
        }
        if self.overlap >= self.chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap {} must be smaller than chunk_size {}",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }

    fn step(&self) -> usize {
        self.chunk_size - self.overlap
    }
}

/// Slides a `chunk_size` window over the text in `chunk_size - overlap` steps.
/// Windows shorter than `min_len` characters are dropped, which only ever
/// happens at the tail. Lengths are counted in characters.
pub fn chunk_text(text: &str, config: ChunkingConfig) -> Result<Vec<String>, IngestError> {
    config.validate()?;

    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let end = (start + config.chunk_size).min(chars.len());
        if end - start >= config.min_len {
            chunks.push(chars[start..end].iter().collect());
        }
        start = start.saturating_add(config.step());
    }

    Ok(chunks)
}

/// Looks for a French month abbreviation followed by a year near the top of
/// the document, e.g. "janv. 2021" is not matched but "janv 2021" is.
pub fn extract_date(text: &str) -> Result<String, IngestError> {
    let date_re = Regex::new(DATE_PATTERN)?;
    let head = match text.char_indices().nth(DATE_SCAN_CHARS) {
        Some((offset, _)) => &text[..offset],
        None => text,
    };

    Ok(date_re
        .find(head)
        .map(|found| found.as_str().to_string())
        .unwrap_or_else(|| UNKNOWN.to_string()))
}

/// Document identity: the file name without its extension.
pub fn file_id_from_path(path: &Path) -> Result<String, IngestError> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
        .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))
}

pub fn make_chunk_key(file_id: &str, local_index: usize) -> String {
    format!("{file_id}_chunk_{local_index}")
}
