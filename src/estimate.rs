//! Pre-flight estimates for an ingestion job.
//!
//! Before anything is uploaded the console can tell the user roughly how
//! many chunks each file will produce and how long backend processing will
//! take. The numbers are heuristics based on typical text density per
//! format; the backend's indexing progress is the source of truth.

use serde::Serialize;

use crate::models::SegmentationConfig;

/// Smallest effective chunk stride, whatever the overlap.
const MIN_EFFECTIVE_CHUNK: u64 = 100;

/// Share of text left after cleaning rules run.
const CLEANING_RETENTION: f64 = 0.9;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkEstimate {
    pub file_type: String,
    pub estimated_text_chars: u64,
    pub effective_chunk_size: u64,
    pub estimated_chunks: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEstimate {
    pub files: Vec<(String, ChunkEstimate)>,
    pub total_bytes: u64,
    pub total_chunks: u64,
    pub processing_minutes: u64,
}

/// Extracted characters per stored byte for a file extension.
fn chars_per_byte(ext: &str) -> f64 {
    match ext {
        "pdf" => 0.5,
        "doc" | "docx" => 0.4,
        "txt" | "md" => 0.9,
        "html" => 0.3,
        _ => 0.7,
    }
}

pub fn file_extension(name: &str) -> String {
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

pub fn estimate_chunks(name: &str, size: u64, seg: &SegmentationConfig) -> ChunkEstimate {
    let ext = file_extension(name);
    let mut text_chars = size as f64 * chars_per_byte(&ext);
    if !seg.cleaning_rules.is_empty() {
        text_chars *= CLEANING_RETENTION;
    }

    let stride = (seg.chunk_size as i64 - seg.chunk_overlap as i64).max(MIN_EFFECTIVE_CHUNK as i64)
        as u64;

    ChunkEstimate {
        file_type: if ext.is_empty() {
            "unknown".to_string()
        } else {
            ext
        },
        estimated_text_chars: text_chars.round() as u64,
        effective_chunk_size: stride,
        estimated_chunks: (text_chars / stride as f64).ceil() as u64,
    }
}

/// About half a minute of backend work per MiB, never less than one minute.
pub fn processing_minutes(total_bytes: u64) -> u64 {
    let mib = total_bytes as f64 / (1024.0 * 1024.0);
    ((mib * 0.5).ceil() as u64).max(1)
}

pub fn estimate_job<'a>(
    files: impl IntoIterator<Item = (&'a str, u64)>,
    seg: &SegmentationConfig,
) -> JobEstimate {
    let mut total_bytes = 0;
    let mut total_chunks = 0;
    let files: Vec<(String, ChunkEstimate)> = files
        .into_iter()
        .map(|(name, size)| {
            let est = estimate_chunks(name, size, seg);
            total_bytes += size;
            total_chunks += est.estimated_chunks;
            (name.to_string(), est)
        })
        .collect();

    JobEstimate {
        files,
        total_bytes,
        total_chunks,
        processing_minutes: processing_minutes(total_bytes),
    }
}
